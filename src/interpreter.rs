//! Tree-walking backend.
//!
//! Walks the AST directly with environment chains, no bytecode stage; this
//! is the reference semantics the VM must match. Control flow rides on the
//! interpreter-only `ReturnValue` and `Error` object variants, which
//! short-circuit statement lists and expression evaluation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::builtins::Builtin;
use crate::object::{
    Environment, Function, HashPair, Object, RuntimeError, eval_infix, eval_prefix, parse_integer,
};
use crate::parser::ast::{Block, Expression, InfixOperator, Pattern, Program, Statement};

pub struct Interpreter {
    /// Lines produced by `puts`, in emission order.
    pub output: Vec<String>,
}

fn is_error(object: &Object) -> bool {
    matches!(object, Object::Error(_))
}

fn error(error: RuntimeError) -> Object {
    Object::Error(error.to_string())
}

impl Interpreter {
    pub fn new() -> Self {
        Self { output: Vec::new() }
    }

    /// Evaluates a whole program, unwrapping a top-level `return` and
    /// stopping at the first error.
    pub fn eval_program(&mut self, program: &Program, env: &Rc<RefCell<Environment>>) -> Object {
        let mut result = Object::Null;
        for statement in &program.statements {
            result = self.eval_statement(statement, env);
            match result {
                Object::ReturnValue(value) => return *value,
                Object::Error(_) => return result,
                _ => {}
            }
        }
        result
    }

    fn eval_statement(&mut self, statement: &Statement, env: &Rc<RefCell<Environment>>) -> Object {
        match statement {
            Statement::Expression(expression) => self.eval_expression(expression, env),
            Statement::Return(value) => {
                let value = self.eval_expression(value, env);
                if is_error(&value) {
                    return value;
                }
                Object::ReturnValue(Box::new(value))
            }
            Statement::Let { pattern, value } => {
                let value = self.eval_expression(value, env);
                if is_error(&value) {
                    return value;
                }
                if let Err(failure) = bind_pattern(pattern, value.clone(), env) {
                    return failure;
                }
                // A let evaluates to its bound value; the REPL shows it.
                value
            }
        }
    }

    /// Blocks propagate `return` and errors outward unchanged so they
    /// bubble through nested blocks up to the enclosing function call.
    fn eval_block(&mut self, block: &Block, env: &Rc<RefCell<Environment>>) -> Object {
        let mut result = Object::Null;
        for statement in &block.statements {
            let value = self.eval_statement(statement, env);
            if matches!(value, Object::ReturnValue(_) | Object::Error(_)) {
                return value;
            }
            // A binding used as a block's result yields null, matching the
            // compiled form where a set leaves nothing on the stack.
            result = if matches!(statement, Statement::Let { .. }) {
                Object::Null
            } else {
                value
            };
        }
        result
    }

    fn eval_expression(
        &mut self,
        expression: &Expression,
        env: &Rc<RefCell<Environment>>,
    ) -> Object {
        match expression {
            Expression::Number(spelling) => match parse_integer(spelling) {
                Ok(value) => Object::Integer(value),
                Err(failure) => error(failure),
            },
            Expression::Boolean(value) => Object::Boolean(*value),
            Expression::String(value) => Object::string(value.as_str()),
            Expression::Identifier(name) => self.eval_identifier(name, env),
            Expression::Prefix { operator, right } => {
                let right = self.eval_expression(right, env);
                if is_error(&right) {
                    return right;
                }
                eval_prefix(*operator, &right).unwrap_or_else(error)
            }
            Expression::Infix {
                left,
                operator: InfixOperator::Pipeline,
                right,
            } => {
                // Matches compiled evaluation order: the callee first, then
                // the piped value, then the call.
                let function = self.eval_expression(right, env);
                if is_error(&function) {
                    return function;
                }
                let argument = self.eval_expression(left, env);
                if is_error(&argument) {
                    return argument;
                }
                self.call_function(function, vec![argument])
            }
            Expression::Infix {
                left,
                operator,
                right,
            } => {
                let left = self.eval_expression(left, env);
                if is_error(&left) {
                    return left;
                }
                let right = self.eval_expression(right, env);
                if is_error(&right) {
                    return right;
                }
                eval_infix(*operator, &left, &right).unwrap_or_else(error)
            }
            Expression::If {
                condition,
                consequence,
                alternative,
            } => {
                let condition = self.eval_expression(condition, env);
                if is_error(&condition) {
                    return condition;
                }
                if condition.is_truthy() {
                    self.eval_block(consequence, env)
                } else if let Some(alternative) = alternative {
                    self.eval_block(alternative, env)
                } else {
                    Object::Null
                }
            }
            Expression::Array(elements) => match self.eval_expressions(elements, env) {
                Ok(elements) => Object::array(elements),
                Err(failure) => failure,
            },
            Expression::Hash(pairs) => self.eval_hash_literal(pairs, env),
            Expression::Index { left, index } => {
                let left = self.eval_expression(left, env);
                if is_error(&left) {
                    return left;
                }
                let index = self.eval_expression(index, env);
                if is_error(&index) {
                    return index;
                }
                left.index(&index).unwrap_or_else(error)
            }
            Expression::Function(function) => Object::Function(Rc::new(Function {
                parameters: function.parameters.clone(),
                body: function.body.clone(),
                env: env.clone(),
            })),
            Expression::Call {
                function,
                arguments,
            } => {
                let function = self.eval_expression(function, env);
                if is_error(&function) {
                    return function;
                }
                let arguments = match self.eval_expressions(arguments, env) {
                    Ok(arguments) => arguments,
                    Err(failure) => return failure,
                };
                self.call_function(function, arguments)
            }
        }
    }

    fn eval_identifier(&mut self, name: &str, env: &Rc<RefCell<Environment>>) -> Object {
        if let Some(value) = env.borrow().get(name) {
            return value;
        }
        if let Some(builtin) = Builtin::lookup(name) {
            return Object::Builtin(builtin);
        }
        error(RuntimeError::IdentifierNotFound {
            name: name.to_string(),
        })
    }

    fn eval_expressions(
        &mut self,
        expressions: &[Expression],
        env: &Rc<RefCell<Environment>>,
    ) -> Result<Vec<Object>, Object> {
        let mut results = Vec::with_capacity(expressions.len());
        for expression in expressions {
            let value = self.eval_expression(expression, env);
            if is_error(&value) {
                return Err(value);
            }
            results.push(value);
        }
        Ok(results)
    }

    fn eval_hash_literal(
        &mut self,
        pairs: &[(Expression, Expression)],
        env: &Rc<RefCell<Environment>>,
    ) -> Object {
        let mut evaluated = HashMap::with_capacity(pairs.len());
        for (key_expression, value_expression) in pairs {
            let key = self.eval_expression(key_expression, env);
            if is_error(&key) {
                return key;
            }
            let Some(hash_key) = key.hash_key() else {
                return error(RuntimeError::UnusableAsHashKey {
                    kind: key.type_name(),
                });
            };
            let value = self.eval_expression(value_expression, env);
            if is_error(&value) {
                return value;
            }
            evaluated.insert(hash_key, HashPair { key, value });
        }
        Object::Hash(Rc::new(evaluated))
    }

    fn call_function(&mut self, function: Object, arguments: Vec<Object>) -> Object {
        match function {
            Object::Function(function) => {
                if arguments.len() != function.parameters.len() {
                    return error(RuntimeError::WrongNumberOfArguments {
                        got: arguments.len(),
                        want: function.parameters.len(),
                    });
                }
                let scope = Environment::new_enclosed(function.env.clone());
                for (parameter, argument) in function.parameters.iter().zip(arguments) {
                    if let Err(failure) = bind_pattern(parameter, argument, &scope) {
                        return failure;
                    }
                }
                match self.eval_block(&function.body, &scope) {
                    Object::ReturnValue(value) => *value,
                    other => other,
                }
            }
            Object::Builtin(builtin) => builtin
                .apply(&arguments, &mut self.output)
                .unwrap_or_else(error),
            other => error(RuntimeError::NotAFunction {
                kind: other.type_name(),
            }),
        }
    }
}

/// Introduces every name a pattern binds. Destructuring extracts components
/// with the shared indexing semantics, so missing elements bind null and a
/// non-container initializer fails like any bad index would.
fn bind_pattern(
    pattern: &Pattern,
    value: Object,
    env: &Rc<RefCell<Environment>>,
) -> Result<(), Object> {
    match pattern {
        Pattern::Identifier(name) => {
            env.borrow_mut().set(name.clone(), value);
        }
        Pattern::Array(patterns) => {
            for (position, sub_pattern) in patterns.iter().enumerate() {
                let element = value
                    .index(&Object::Integer(position as i64))
                    .map_err(error)?;
                bind_pattern(sub_pattern, element, env)?;
            }
        }
        Pattern::Hash(names) => {
            for name in names {
                let element = value.index(&Object::string(name.as_str())).map_err(error)?;
                env.borrow_mut().set(name.clone(), element);
            }
        }
    }
    Ok(())
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn eval_source(source: &str) -> Object {
        let program = parser::parse(source).expect("parse failed");
        let env = Environment::new();
        Interpreter::new().eval_program(&program, &env)
    }

    fn assert_evals(cases: &[(&str, Object)]) {
        for (source, expected) in cases {
            assert_eq!(&eval_source(source), expected, "source: {source}");
        }
    }

    fn assert_errors(cases: &[(&str, &str)]) {
        for (source, message) in cases {
            assert_eq!(
                eval_source(source),
                Object::Error(message.to_string()),
                "source: {source}"
            );
        }
    }

    fn int(value: i64) -> Object {
        Object::Integer(value)
    }

    #[test]
    fn evaluates_arithmetic_and_comparisons() {
        assert_evals(&[
            ("5", int(5)),
            ("-10", int(-10)),
            ("2 * (5 + 10)", int(30)),
            ("(5 + 10 * 2 + 15 / 3) * 2 + -10", int(50)),
            ("1 < 2", Object::Boolean(true)),
            ("1 != 2", Object::Boolean(true)),
            ("(1 < 2) == true", Object::Boolean(true)),
            ("!!true", Object::Boolean(true)),
            ("!5", Object::Boolean(false)),
        ]);
    }

    #[test]
    fn evaluates_string_operations() {
        assert_evals(&[
            (r#""Hello" + " " + "World""#, Object::string("Hello World")),
            (r#""a" == "a""#, Object::Boolean(true)),
            (r#"len("hello")"#, int(5)),
        ]);
    }

    #[test]
    fn evaluates_conditionals() {
        assert_evals(&[
            ("if (true) { 10 }", int(10)),
            ("if (false) { 10 }", Object::Null),
            ("if (1) { 10 }", int(10)),
            ("if (1 > 2) { 10 } else { 20 }", int(20)),
            ("if (true) { }", Object::Null),
            ("if (true) { let a = 1; }", Object::Null),
            ("let f = fn() { let a = 5; }; f()", Object::Null),
        ]);
    }

    #[test]
    fn return_bubbles_out_of_nested_blocks() {
        assert_evals(&[
            ("return 10; 9;", int(10)),
            ("9; return 2 * 5; 9;", int(10)),
            (
                "if (10 > 1) { if (10 > 1) { return 10; } return 1; }",
                int(10),
            ),
        ]);
    }

    #[test]
    fn let_evaluates_to_its_bound_value() {
        assert_evals(&[
            ("let a = 5;", int(5)),
            ("let a = 5; let b = a; let c = a + b + 5; c", int(15)),
        ]);
    }

    #[test]
    fn evaluates_functions_and_closures() {
        assert_evals(&[
            ("let identity = fn(x) { x }; identity(5)", int(5)),
            ("let double = fn(x) { x * 2 }; double(5)", int(10)),
            ("fn(x) { x }(5)", int(5)),
            (
                "let newAdder = fn(x) { fn(y) { x + y } }; let addTwo = newAdder(2); addTwo(2)",
                int(4),
            ),
            (
                "let fibb = fn(x) { if (x == 0) { x } else { if (x == 1) { x } else { fibb(x-1) + fibb(x-2) } } }; fibb(7)",
                int(13),
            ),
        ]);
    }

    #[test]
    fn evaluates_array_and_hash_indexing() {
        assert_evals(&[
            ("[1, 2, 3][0]", int(1)),
            ("[1, 2, 3][3]", Object::Null),
            ("[1, 2, 3][-1]", Object::Null),
            (r#"{"one": 1}["one"]"#, int(1)),
            (r#"{"one": 1}["two"]"#, Object::Null),
            ("{true: 5}[true]", int(5)),
            ("{1: 1, 1: 2}[1]", int(2)),
        ]);
    }

    #[test]
    fn evaluates_destructuring_lets() {
        assert_evals(&[
            ("let [a, b] = [1, 2]; a + b", int(3)),
            ("let [a, b] = [1]; b", Object::Null),
            ("let [[a, b], c] = [[1, 2], 3]; a + b + c", int(6)),
            (r#"let {x, y} = {"x": 1, "y": 2}; x + y"#, int(3)),
            (r#"let [{x}, b] = [{"x": 7}, 2]; x + b"#, int(9)),
        ]);
    }

    #[test]
    fn evaluates_destructuring_parameters() {
        assert_evals(&[
            ("fn([x, y]) { x + y }([3, 4])", int(7)),
            (r#"fn({x, y}) { x * y }({"x": 3, "y": 5})"#, int(15)),
        ]);
    }

    #[test]
    fn evaluates_pipeline_operator() {
        assert_evals(&[
            ("5 | fn(x) { x * 2 }", int(10)),
            ("[1, 2] | fn([x, y]) { x + y }", int(3)),
            (r#"{"x": 1, "y": 2} | fn({x, y}) { x + y }"#, int(3)),
            ("1 + 2 | fn(x) { x * 10 }", int(30)),
            ("[1, 2, 3] | len", int(3)),
        ]);
    }

    #[test]
    fn evaluates_builtins() {
        assert_evals(&[
            ("len([1, 2])", int(2)),
            ("first([7])", int(7)),
            ("last([])", Object::Null),
            ("rest(rest(rest([])))", Object::Null),
            (
                "push([1], 2)",
                Object::array(vec![int(1), int(2)]),
            ),
        ]);
    }

    #[test]
    fn map_via_closures_and_builtins() {
        let source = "
            let map = fn(arr, f) {
                let iter = fn(arr, acc) {
                    if (len(arr) == 0) { acc } else { iter(rest(arr), push(acc, f(first(arr)))) }
                };
                iter(arr, [])
            };
            map([1, 2, 3, 4], fn(x) { x * 2 })";
        assert_eq!(
            eval_source(source),
            Object::array(vec![int(2), int(4), int(6), int(8)])
        );
    }

    #[test]
    fn closure_captures_outlive_the_defining_call() {
        let source = "
            let makeCounter = fn(start) { fn() { start + 1 } };
            let counter = makeCounter(41);
            counter()";
        assert_eq!(eval_source(source), int(42));
    }

    #[test]
    fn errors_short_circuit_evaluation() {
        assert_errors(&[
            ("5 + true", "type mismatch: INTEGER + BOOLEAN"),
            ("5 + true; 5;", "type mismatch: INTEGER + BOOLEAN"),
            ("-true", "unknown operator: -BOOLEAN"),
            ("true + false", "unknown operator: BOOLEAN + BOOLEAN"),
            (r#""Hello" - "World""#, "unknown operator: STRING - STRING"),
            ("foobar", "identifier is not found: foobar"),
            (
                r#"{"name": "Monkey"}[fn(x) { x }]"#,
                "unusable as hash key: FUNCTION",
            ),
            ("{fn(x) { x }: 1}", "unusable as hash key: FUNCTION"),
            ("5 / 0", "division by zero"),
            ("1 | 2", "not a function: INTEGER"),
            ("1()", "not a function: INTEGER"),
            ("fn() { 1 }(1)", "wrong number of arguments. got=1, want=0"),
            ("let [a] = 5; a", "index operator not supported: INTEGER"),
            ("len(1)", "argument to `len` not supported, got INTEGER"),
            ("3.14", "cannot convert int. 3.14"),
            (
                "if (10 > 1) { if (10 > 1) { return true + false; } return 1; }",
                "unknown operator: BOOLEAN + BOOLEAN",
            ),
        ]);
    }

    #[test]
    fn error_inspect_form_is_prefixed() {
        assert_eq!(eval_source("foobar").inspect(), "ERROR: identifier is not found: foobar");
    }

    #[test]
    fn puts_records_output_lines() {
        let program = parser::parse(r#"puts("a"); puts(1, [2])"#).expect("parse failed");
        let env = Environment::new();
        let mut interpreter = Interpreter::new();
        let result = interpreter.eval_program(&program, &env);
        assert_eq!(result, Object::Null);
        assert_eq!(interpreter.output, vec!["a", "1", "[2]"]);
    }
}
