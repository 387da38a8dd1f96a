use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::builtins::Builtin;
use crate::code::{Opcode, UndefinedOpcode, read_u16};
use crate::compiler::Bytecode;
use crate::object::{
    Closure, CompiledFunction, HashPair, Object, RuntimeError, eval_infix, eval_prefix,
};
use crate::parser::ast::{InfixOperator, PrefixOperator};

pub mod frame;

use frame::Frame;

pub const STACK_SIZE: usize = 2048;
pub const GLOBALS_SIZE: usize = 65536;
pub const MAX_FRAMES: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    UndefinedOpcode(#[from] UndefinedOpcode),
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("vm invariant violated: {message}")]
    InvariantViolation { message: &'static str },
}

// `sp` always points at the next free slot; a frame's locals live at
// `stack[base_pointer..]`, reserved when the call enters. Operator,
// indexing, and builtin semantics are delegated to `object` so results and
// error messages match the tree-walking backend exactly.
#[derive(Debug)]
pub struct VM {
    constants: Vec<Object>,
    stack: Vec<Object>,
    sp: usize,
    globals: Vec<Object>,
    frames: Vec<Frame>,
    /// Lines produced by `puts`, in emission order.
    pub output: Vec<String>,
}

impl VM {
    pub fn new(bytecode: Bytecode) -> Self {
        Self::new_with_globals(bytecode, vec![Object::Null; GLOBALS_SIZE])
    }

    /// Reuses a globals store from an earlier run; the REPL threads its
    /// session globals through here.
    pub fn new_with_globals(bytecode: Bytecode, globals: Vec<Object>) -> Self {
        let main_function = Rc::new(CompiledFunction {
            instructions: bytecode.instructions,
            num_locals: 0,
            num_parameters: 0,
        });
        let main_closure = Rc::new(Closure {
            function: main_function,
            free: Vec::new(),
        });
        Self {
            constants: bytecode.constants,
            stack: vec![Object::Null; STACK_SIZE],
            sp: 0,
            globals,
            frames: vec![Frame::new(main_closure, 0)],
            output: Vec::new(),
        }
    }

    pub fn take_globals(&mut self) -> Vec<Object> {
        std::mem::take(&mut self.globals)
    }

    /// The value most recently popped off the stack; this is what an
    /// expression statement leaves behind for the REPL to show.
    pub fn last_popped_stack_elem(&self) -> Object {
        self.stack[self.sp].clone()
    }

    pub fn run(&mut self) -> Result<(), VmError> {
        loop {
            let byte = {
                let frame = self.current_frame();
                let instructions = frame.instructions();
                if frame.ip >= instructions.len() {
                    break;
                }
                instructions[frame.ip]
            };
            self.current_frame_mut().ip += 1;

            match Opcode::try_from(byte)? {
                Opcode::Constant => {
                    let index = self.read_u16_operand();
                    self.push(self.constants[index].clone())?;
                }
                Opcode::Add => self.execute_infix(InfixOperator::Plus)?,
                Opcode::Sub => self.execute_infix(InfixOperator::Minus)?,
                Opcode::Mul => self.execute_infix(InfixOperator::Asterisk)?,
                Opcode::Div => self.execute_infix(InfixOperator::Slash)?,
                Opcode::Equal => self.execute_infix(InfixOperator::Eq)?,
                Opcode::NotEqual => self.execute_infix(InfixOperator::NotEq)?,
                Opcode::GreaterThan => self.execute_infix(InfixOperator::Gt)?,
                Opcode::Minus => self.execute_prefix(PrefixOperator::Minus)?,
                Opcode::Bang => self.execute_prefix(PrefixOperator::Bang)?,
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::True => self.push(Object::Boolean(true))?,
                Opcode::False => self.push(Object::Boolean(false))?,
                Opcode::Null => self.push(Object::Null)?,
                Opcode::Jump => {
                    let target = self.read_u16_operand();
                    self.current_frame_mut().ip = target;
                }
                Opcode::JumpNotTruthy => {
                    let target = self.read_u16_operand();
                    let condition = self.pop()?;
                    if !condition.is_truthy() {
                        self.current_frame_mut().ip = target;
                    }
                }
                Opcode::SetGlobal => {
                    let index = self.read_u16_operand();
                    self.globals[index] = self.pop()?;
                }
                Opcode::GetGlobal => {
                    let index = self.read_u16_operand();
                    self.push(self.globals[index].clone())?;
                }
                Opcode::SetLocal => {
                    let index = self.read_u8_operand();
                    let base_pointer = self.current_frame().base_pointer;
                    self.stack[base_pointer + index] = self.pop()?;
                }
                Opcode::GetLocal => {
                    let index = self.read_u8_operand();
                    let base_pointer = self.current_frame().base_pointer;
                    self.push(self.stack[base_pointer + index].clone())?;
                }
                Opcode::GetBuiltin => {
                    let index = self.read_u8_operand();
                    let builtin =
                        Builtin::from_index(index).ok_or(VmError::InvariantViolation {
                            message: "builtin index out of range",
                        })?;
                    self.push(Object::Builtin(builtin))?;
                }
                Opcode::GetFree => {
                    let index = self.read_u8_operand();
                    let value = self.current_frame().closure.free[index].clone();
                    self.push(value)?;
                }
                Opcode::CurrentClosure => {
                    let closure = self.current_frame().closure.clone();
                    self.push(Object::Closure(closure))?;
                }
                Opcode::Closure => {
                    let function_index = self.read_u16_operand();
                    let num_free = self.read_u8_operand();
                    self.push_closure(function_index, num_free)?;
                }
                Opcode::Array => {
                    let count = self.read_u16_operand();
                    let elements = self.stack[self.sp - count..self.sp].to_vec();
                    self.sp -= count;
                    self.push(Object::array(elements))?;
                }
                Opcode::Hash => {
                    let count = self.read_u16_operand();
                    let hash = self.build_hash(count)?;
                    self.sp -= count;
                    self.push(hash)?;
                }
                Opcode::Index => {
                    let index = self.pop()?;
                    let left = self.pop()?;
                    self.push(left.index(&index).map_err(VmError::Runtime)?)?;
                }
                Opcode::Call => {
                    let argc = self.read_u8_operand();
                    self.execute_call(argc)?;
                }
                Opcode::ReturnValue => {
                    let value = self.pop()?;
                    if self.return_from_frame(value)? {
                        return Ok(());
                    }
                }
                Opcode::Return => {
                    if self.return_from_frame(Object::Null)? {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn execute_infix(&mut self, operator: InfixOperator) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result = eval_infix(operator, &left, &right).map_err(VmError::Runtime)?;
        self.push(result)
    }

    fn execute_prefix(&mut self, operator: PrefixOperator) -> Result<(), VmError> {
        let operand = self.pop()?;
        let result = eval_prefix(operator, &operand).map_err(VmError::Runtime)?;
        self.push(result)
    }

    fn build_hash(&self, count: usize) -> Result<Object, VmError> {
        let mut pairs = HashMap::with_capacity(count / 2);
        for chunk in self.stack[self.sp - count..self.sp].chunks_exact(2) {
            let key = chunk[0].clone();
            let value = chunk[1].clone();
            let hash_key = key
                .hash_key()
                .ok_or_else(|| RuntimeError::UnusableAsHashKey {
                    kind: key.type_name(),
                })?;
            pairs.insert(hash_key, HashPair { key, value });
        }
        Ok(Object::Hash(Rc::new(pairs)))
    }

    fn execute_call(&mut self, argc: usize) -> Result<(), VmError> {
        let callee = self.stack[self.sp - 1 - argc].clone();
        match callee {
            Object::Closure(closure) => self.call_closure(closure, argc),
            Object::Builtin(builtin) => {
                let args = self.stack[self.sp - argc..self.sp].to_vec();
                let result = builtin
                    .apply(&args, &mut self.output)
                    .map_err(VmError::Runtime)?;
                self.sp -= argc + 1;
                self.push(result)
            }
            other => Err(RuntimeError::NotAFunction {
                kind: other.type_name(),
            }
            .into()),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, argc: usize) -> Result<(), VmError> {
        if argc != closure.function.num_parameters {
            return Err(RuntimeError::WrongNumberOfArguments {
                got: argc,
                want: closure.function.num_parameters,
            }
            .into());
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::StackOverflow);
        }

        let base_pointer = self.sp - argc;
        let num_locals = closure.function.num_locals;
        if base_pointer + num_locals >= STACK_SIZE {
            return Err(VmError::StackOverflow);
        }
        self.frames.push(Frame::new(closure, base_pointer));
        self.sp = base_pointer + num_locals;
        Ok(())
    }

    /// Pops the current frame and pushes the return value in the caller's
    /// context. Returning from the outermost frame halts the machine with
    /// the value as the last popped element.
    fn return_from_frame(&mut self, value: Object) -> Result<bool, VmError> {
        let frame = self
            .frames
            .pop()
            .ok_or(VmError::InvariantViolation {
                message: "return with no active frame",
            })?;
        if self.frames.is_empty() {
            self.stack[0] = value;
            self.sp = 0;
            return Ok(true);
        }
        self.sp = frame.base_pointer - 1;
        self.push(value)?;
        Ok(false)
    }

    fn push_closure(&mut self, function_index: usize, num_free: usize) -> Result<(), VmError> {
        let function = match &self.constants[function_index] {
            Object::CompiledFunction(function) => function.clone(),
            _ => {
                return Err(VmError::InvariantViolation {
                    message: "closure constant is not a compiled function",
                });
            }
        };
        let free = self.stack[self.sp - num_free..self.sp].to_vec();
        self.sp -= num_free;
        self.push(Object::Closure(Rc::new(Closure { function, free })))
    }

    fn push(&mut self, value: Object) -> Result<(), VmError> {
        if self.sp >= STACK_SIZE {
            return Err(VmError::StackOverflow);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Object, VmError> {
        if self.sp == 0 {
            return Err(VmError::StackUnderflow);
        }
        self.sp -= 1;
        // The slot is left in place; `last_popped_stack_elem` reads it.
        Ok(self.stack[self.sp].clone())
    }

    fn read_u16_operand(&mut self) -> usize {
        let frame = self.current_frame_mut();
        let value = read_u16(&frame.closure.function.instructions.0[frame.ip..]);
        frame.ip += 2;
        value
    }

    fn read_u8_operand(&mut self) -> usize {
        let frame = self.current_frame_mut();
        let value = frame.closure.function.instructions.0[frame.ip] as usize;
        frame.ip += 1;
        value
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("frame stack is never empty")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack is never empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn run_vm(source: &str) -> Result<VM, VmError> {
        let mut parser = Parser::new(Lexer::new(source));
        let program = parser.parse_program();
        assert!(
            parser.errors().is_empty(),
            "parse errors: {:?}",
            parser.errors()
        );
        let mut compiler = Compiler::new();
        compiler.compile(&program).expect("compile failed");
        let mut vm = VM::new(compiler.bytecode());
        vm.run()?;
        Ok(vm)
    }

    fn run_source(source: &str) -> Object {
        run_vm(source)
            .unwrap_or_else(|error| panic!("vm error for {source:?}: {error}"))
            .last_popped_stack_elem()
    }

    fn run_error(source: &str) -> String {
        run_vm(source).expect_err("expected vm error").to_string()
    }

    fn assert_runs(cases: &[(&str, Object)]) {
        for (source, expected) in cases {
            assert_eq!(&run_source(source), expected, "source: {source}");
        }
    }

    fn int(value: i64) -> Object {
        Object::Integer(value)
    }

    fn boolean(value: bool) -> Object {
        Object::Boolean(value)
    }

    #[test]
    fn runs_integer_arithmetic() {
        assert_runs(&[
            ("1", int(1)),
            ("1 + 2", int(3)),
            ("1 - 2", int(-1)),
            ("4 / 2", int(2)),
            ("50 / 2 * 2 + 10 - 5", int(55)),
            ("5 * (2 + 10)", int(60)),
            ("-5", int(-5)),
            ("5 * -10", int(-50)),
            ("(5 + 10 * 2 + 15 / 3) * 2 + -10", int(50)),
        ]);
    }

    #[test]
    fn runs_boolean_expressions() {
        assert_runs(&[
            ("true", boolean(true)),
            ("1 < 2", boolean(true)),
            ("1 > 2", boolean(false)),
            ("1 == 1", boolean(true)),
            ("1 != 1", boolean(false)),
            ("true != false", boolean(true)),
            ("(1 < 2) == true", boolean(true)),
            ("!true", boolean(false)),
            ("!!5", boolean(true)),
            ("!(if (false) { 5 })", boolean(true)),
            ("1 == true", boolean(false)),
            ("\"a\" == \"a\"", boolean(true)),
            ("\"a\" != \"b\"", boolean(true)),
        ]);
    }

    #[test]
    fn runs_conditionals() {
        assert_runs(&[
            ("if (true) { 10 }", int(10)),
            ("if (true) { 10 } else { 20 }", int(10)),
            ("if (false) { 10 } else { 20 }", int(20)),
            ("if (1 < 2) { 10 } else { 20 }", int(10)),
            ("if (1 > 2) { 10 }", Object::Null),
            ("if (0) { 10 }", int(10)),
            ("!(if (false) { 5; })", boolean(true)),
            ("if (if (false) { 10 }) { 10 } else { 20 }", int(20)),
            ("if (true) { }", Object::Null),
            ("if (true) { let a = 1; }", Object::Null),
            ("if (false) { 1 } else { let a = 1; }", Object::Null),
            ("let f = fn() { let a = 5; }; f()", Object::Null),
        ]);
    }

    #[test]
    fn runs_global_let_statements() {
        assert_runs(&[
            ("let one = 1; one", int(1)),
            ("let one = 1; let two = 2; one + two", int(3)),
            ("let one = 1; let two = one + one; one + two", int(3)),
        ]);
    }

    #[test]
    fn runs_string_expressions() {
        assert_runs(&[
            (r#""monkey""#, Object::string("monkey")),
            (r#""mon" + "key" + "banana""#, Object::string("monkeybanana")),
        ]);
    }

    #[test]
    fn runs_array_and_hash_indexing() {
        assert_runs(&[
            ("[1, 2, 3][1]", int(2)),
            ("[[1, 1, 1]][0][0]", int(1)),
            ("[][0]", Object::Null),
            ("[1, 2, 3][99]", Object::Null),
            ("[1][-1]", Object::Null),
            ("{1: 1, 2: 2}[1]", int(1)),
            ("{1: 1}[0]", Object::Null),
            ("{}[0]", Object::Null),
            (r#"{"one": 1, "two": 2}["two"]"#, int(2)),
            ("{true: 5}[true]", int(5)),
        ]);
    }

    #[test]
    fn runs_function_calls() {
        assert_runs(&[
            ("let f = fn() { 5 + 10 }; f()", int(15)),
            ("let f = fn() { return 99; 100; }; f()", int(99)),
            ("let f = fn() { }; f()", Object::Null),
            ("fn(a) { a }(4)", int(4)),
            (
                "let sum = fn(a, b) { let c = a + b; c; }; sum(1, 2) + sum(3, 4)",
                int(10),
            ),
            (
                "let identity = fn(a) { a }; let apply = fn(f, x) { f(x) }; apply(identity, 7)",
                int(7),
            ),
        ]);
    }

    #[test]
    fn runs_closures_and_recursion() {
        assert_runs(&[
            (
                "let newAdder = fn(x) { fn(y) { x + y } }; let addTwo = newAdder(2); addTwo(2)",
                int(4),
            ),
            (
                "let newClosure = fn(a) { fn() { a } }; newClosure(99)()",
                int(99),
            ),
            (
                "let countDown = fn(x) { if (x == 0) { 0 } else { countDown(x - 1) } }; countDown(3)",
                int(0),
            ),
            (
                "let wrapper = fn() { let countDown = fn(x) { if (x == 0) { 0 } else { countDown(x - 1) } }; countDown(2) }; wrapper()",
                int(0),
            ),
            (
                "let fibb = fn(x) { if (x == 0) { x } else { if (x == 1) { x } else { fibb(x-1) + fibb(x-2) } } }; fibb(7)",
                int(13),
            ),
        ]);
    }

    #[test]
    fn runs_builtin_functions() {
        assert_runs(&[
            (r#"len("four")"#, int(4)),
            ("len([1, 2, 3])", int(3)),
            ("first([7, 8])", int(7)),
            ("first([])", Object::Null),
            ("last([7, 8])", int(8)),
            ("last([])", Object::Null),
            ("rest([1, 2, 3])", Object::array(vec![int(2), int(3)])),
            ("rest(rest(rest([])))", Object::Null),
            ("push([], 1)", Object::array(vec![int(1)])),
        ]);
        assert_eq!(
            run_error("len(1)"),
            "argument to `len` not supported, got INTEGER"
        );
        assert_eq!(
            run_error("len(rest([]))"),
            "argument to `len` not supported, got NULL"
        );
        assert_eq!(
            run_error("len(1, 2)"),
            "wrong number of arguments. got=2, want=1"
        );
    }

    #[test]
    fn collects_puts_output() {
        let vm = run_vm(r#"puts("hello", 1); puts([1, 2])"#).expect("run failed");
        assert_eq!(vm.output, vec!["hello", "1", "[1, 2]"]);
        assert_eq!(vm.last_popped_stack_elem(), Object::Null);
    }

    #[test]
    fn runs_destructuring_lets() {
        assert_runs(&[
            ("let [a, b] = [1, 2]; a + b", int(3)),
            ("let [a, b] = [1]; a", int(1)),
            ("let [a, b] = [1]; b", Object::Null),
            ("let [[a, b], c] = [[1, 2], 3]; a + b + c", int(6)),
            (r#"let {x, y} = {"x": 1, "y": 2}; x + y"#, int(3)),
            (r#"let {x} = {"y": 2}; x"#, Object::Null),
            (
                r#"let [{x}, b] = [{"x": 7}, 2]; x + b"#,
                int(9),
            ),
        ]);
        assert_eq!(run_error("let [a] = 5; a"), "index operator not supported: INTEGER");
    }

    #[test]
    fn runs_destructuring_parameters() {
        assert_runs(&[
            ("fn([x, y]) { x + y }([3, 4])", int(7)),
            (
                r#"fn({x, y}) { x * y }({"x": 3, "y": 5})"#,
                int(15),
            ),
            ("fn(a, [b, c]) { a + b + c }(1, [2, 3])", int(6)),
        ]);
    }

    #[test]
    fn runs_pipeline_operator() {
        assert_runs(&[
            ("5 | fn(x) { x * 2 }", int(10)),
            ("[1, 2] | fn([x, y]) { x + y }", int(3)),
            (r#"{"x": 1, "y": 2} | fn({x, y}) { x + y }"#, int(3)),
            ("1 + 2 | fn(x) { x * 10 }", int(30)),
            ("len([1, 2] | fn(a) { push(a, 3) })", int(3)),
            ("[1, 2, 3] | len", int(3)),
        ]);
        assert_eq!(run_error("1 | 2"), "not a function: INTEGER");
    }

    #[test]
    fn reports_runtime_errors() {
        assert_eq!(run_error("5 + true"), "type mismatch: INTEGER + BOOLEAN");
        assert_eq!(run_error("5 + true; 5;"), "type mismatch: INTEGER + BOOLEAN");
        assert_eq!(
            run_error(r#""Hello" - "World""#),
            "unknown operator: STRING - STRING"
        );
        assert_eq!(
            run_error(r#"{"name": "Monkey"}[fn(x) { x }]"#),
            "unusable as hash key: FUNCTION"
        );
        assert_eq!(run_error("5 / 0"), "division by zero");
        assert_eq!(run_error("5[0]"), "index operator not supported: INTEGER");
        assert_eq!(run_error("1()"), "not a function: INTEGER");
        assert_eq!(
            run_error("fn() { 1; }(1)"),
            "wrong number of arguments. got=1, want=0"
        );
    }

    #[test]
    fn unbounded_recursion_overflows_the_frame_stack() {
        assert_eq!(
            run_error("let loop = fn() { loop() }; loop()"),
            "stack overflow"
        );
    }

    #[test]
    fn top_level_return_halts_with_the_value() {
        assert_runs(&[("return 10; 5;", int(10))]);
    }

    #[test]
    fn preserves_globals_across_runs() {
        let mut vm = run_vm("let x = 40;").expect("run failed");
        let globals = vm.take_globals();

        let mut parser = Parser::new(Lexer::new("let x = 40;"));
        let program = parser.parse_program();
        let mut compiler = Compiler::new();
        compiler.compile(&program).expect("compile failed");
        let (symbol_table, constants) = compiler.into_state();

        let mut parser = Parser::new(Lexer::new("x + 2"));
        let program = parser.parse_program();
        let mut compiler = crate::compiler::Compiler::new_with_state(symbol_table, constants);
        compiler.compile(&program).expect("compile failed");

        let mut vm = VM::new_with_globals(compiler.bytecode(), globals);
        vm.run().expect("run failed");
        assert_eq!(vm.last_popped_stack_elem(), int(42));
    }
}
