//! Runtime value universe shared by the interpreter and the VM, plus the
//! operator and indexing semantics both backends delegate to so results
//! and error messages agree byte-for-byte.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::rc::Rc;

use fnv::FnvHasher;
use thiserror::Error;

use crate::code::Instructions;
use crate::parser::ast::{Block, InfixOperator, Pattern, PrefixOperator};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("type mismatch: {left} {operator} {right}")]
    TypeMismatch {
        left: &'static str,
        operator: InfixOperator,
        right: &'static str,
    },
    #[error("unknown operator: {left} {operator} {right}")]
    UnknownInfixOperator {
        left: &'static str,
        operator: InfixOperator,
        right: &'static str,
    },
    #[error("unknown operator: {operator}{operand}")]
    UnknownPrefixOperator {
        operator: PrefixOperator,
        operand: &'static str,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("identifier is not found: {name}")]
    IdentifierNotFound { name: String },
    #[error("unusable as hash key: {kind}")]
    UnusableAsHashKey { kind: &'static str },
    #[error("index operator not supported: {kind}")]
    IndexOperatorNotSupported { kind: &'static str },
    #[error("not a function: {kind}")]
    NotAFunction { kind: &'static str },
    #[error("wrong number of arguments. got={got}, want={want}")]
    WrongNumberOfArguments { got: usize, want: usize },
    #[error("argument to `{builtin}` not supported, got {got}")]
    UnsupportedBuiltinArgument {
        builtin: &'static str,
        got: &'static str,
    },
    #[error("cannot convert int. {spelling}")]
    NotAnInteger { spelling: String },
}

#[derive(Debug, Clone)]
pub enum Object {
    Integer(i64),
    Boolean(bool),
    String(Rc<str>),
    Array(Rc<Vec<Object>>),
    Hash(Rc<HashMap<HashKey, HashPair>>),
    Null,
    /// Wraps a value bubbling out of a block; interpreter control flow only.
    ReturnValue(Box<Object>),
    /// A runtime failure flowing as a value; interpreter control flow only.
    Error(String),
    /// AST function with its captured environment; interpreter only.
    Function(Rc<Function>),
    CompiledFunction(Rc<CompiledFunction>),
    Closure(Rc<Closure>),
    Builtin(crate::builtins::Builtin),
}

/// Tree-walked function value: parameters, body, defining environment.
#[derive(Debug)]
pub struct Function {
    pub parameters: Vec<Pattern>,
    pub body: Block,
    pub env: Rc<RefCell<Environment>>,
}

/// Bytecode function emitted by the compiler.
#[derive(Debug, PartialEq, Eq)]
pub struct CompiledFunction {
    pub instructions: Instructions,
    pub num_locals: usize,
    pub num_parameters: usize,
}

/// A compiled function paired with its captured free values.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<CompiledFunction>,
    pub free: Vec<Object>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum HashKeyKind {
    Integer,
    Boolean,
    String,
}

/// Canonical map key: a type tag plus a 64-bit summary of the value.
///
/// Integers use their bit pattern, booleans 0/1, strings FNV-1a 64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey {
    kind: HashKeyKind,
    value: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashPair {
    pub key: Object,
    pub value: Object,
}

impl Object {
    pub fn array(elements: Vec<Object>) -> Self {
        Object::Array(Rc::new(elements))
    }

    pub fn string(value: impl Into<Rc<str>>) -> Self {
        Object::String(value.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Integer(_) => "INTEGER",
            Object::Boolean(_) => "BOOLEAN",
            Object::String(_) => "STRING",
            Object::Array(_) => "ARRAY",
            Object::Hash(_) => "HASH",
            Object::Null => "NULL",
            Object::ReturnValue(_) => "RETURN",
            Object::Error(_) => "ERROR",
            Object::Function(_) => "FUNCTION",
            Object::CompiledFunction(_) => "COMPILED_FUNCTION",
            Object::Closure(_) => "CLOSURE",
            Object::Builtin(_) => "BUILTIN",
        }
    }

    /// Only `false` and `null` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Object::Boolean(false) | Object::Null)
    }

    pub fn hash_key(&self) -> Option<HashKey> {
        match self {
            Object::Integer(value) => Some(HashKey {
                kind: HashKeyKind::Integer,
                value: *value as u64,
            }),
            Object::Boolean(value) => Some(HashKey {
                kind: HashKeyKind::Boolean,
                value: u64::from(*value),
            }),
            Object::String(value) => {
                let mut hasher = FnvHasher::default();
                hasher.write(value.as_bytes());
                Some(HashKey {
                    kind: HashKeyKind::String,
                    value: hasher.finish(),
                })
            }
            _ => None,
        }
    }

    /// The REPL-facing rendering of a value.
    pub fn inspect(&self) -> String {
        match self {
            Object::Integer(value) => value.to_string(),
            Object::Boolean(value) => value.to_string(),
            Object::String(value) => value.to_string(),
            Object::Null => "null".to_string(),
            Object::ReturnValue(value) => value.inspect(),
            Object::Error(message) => format!("ERROR: {message}"),
            Object::Array(elements) => {
                let elements = elements
                    .iter()
                    .map(Object::inspect)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("[{elements}]")
            }
            Object::Hash(pairs) => {
                let pairs = pairs
                    .values()
                    .map(|pair| format!("{}: {}", pair.key.inspect(), pair.value.inspect()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{pairs}}}")
            }
            Object::Function(function) => {
                let parameters = function
                    .parameters
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("fn({parameters}) {{\n{}\n}}", function.body)
            }
            Object::CompiledFunction(function) => {
                format!("CompiledFunction[{:p}]", Rc::as_ptr(function))
            }
            Object::Closure(closure) => format!("Closure[{:p}]", Rc::as_ptr(closure)),
            Object::Builtin(_) => "builtin function".to_string(),
        }
    }

    /// Language-level `==`: value equality for the hashable primitives and
    /// null, identity for everything else, and `false` across types.
    pub fn runtime_eq(&self, other: &Object) -> bool {
        match (self, other) {
            (Object::Integer(left), Object::Integer(right)) => left == right,
            (Object::Boolean(left), Object::Boolean(right)) => left == right,
            (Object::String(left), Object::String(right)) => left == right,
            (Object::Null, Object::Null) => true,
            (Object::Array(left), Object::Array(right)) => Rc::ptr_eq(left, right),
            (Object::Hash(left), Object::Hash(right)) => Rc::ptr_eq(left, right),
            (Object::Function(left), Object::Function(right)) => Rc::ptr_eq(left, right),
            (Object::Closure(left), Object::Closure(right)) => Rc::ptr_eq(left, right),
            (Object::CompiledFunction(left), Object::CompiledFunction(right)) => {
                Rc::ptr_eq(left, right)
            }
            (Object::Builtin(left), Object::Builtin(right)) => left == right,
            _ => false,
        }
    }

    /// Container indexing shared by `a[i]` and pattern destructuring.
    /// Out-of-range and missing lookups yield null rather than an error.
    pub fn index(&self, index: &Object) -> Result<Object, RuntimeError> {
        match (self, index) {
            (Object::Array(elements), Object::Integer(position)) => {
                if *position < 0 {
                    return Ok(Object::Null);
                }
                Ok(elements
                    .get(*position as usize)
                    .cloned()
                    .unwrap_or(Object::Null))
            }
            (Object::Hash(pairs), index) => {
                let key = index.hash_key().ok_or(RuntimeError::UnusableAsHashKey {
                    kind: index.type_name(),
                })?;
                Ok(pairs
                    .get(&key)
                    .map(|pair| pair.value.clone())
                    .unwrap_or(Object::Null))
            }
            _ => Err(RuntimeError::IndexOperatorNotSupported {
                kind: self.type_name(),
            }),
        }
    }
}

// Test-facing equality is structural where that is meaningful; functions
// and closures compare by identity (their environments can be cyclic).
impl PartialEq for Object {
    fn eq(&self, other: &Object) -> bool {
        match (self, other) {
            (Object::Array(left), Object::Array(right)) => left == right,
            (Object::Hash(left), Object::Hash(right)) => left == right,
            (Object::ReturnValue(left), Object::ReturnValue(right)) => left == right,
            (Object::Error(left), Object::Error(right)) => left == right,
            (Object::CompiledFunction(left), Object::CompiledFunction(right)) => left == right,
            _ => self.runtime_eq(other),
        }
    }
}

/// Applies an infix operator to two evaluated operands. The pipeline
/// operator never reaches here; both backends lower it to a call first.
pub fn eval_infix(
    operator: InfixOperator,
    left: &Object,
    right: &Object,
) -> Result<Object, RuntimeError> {
    match (left, right) {
        (Object::Integer(left), Object::Integer(right)) => {
            eval_integer_infix(operator, *left, *right)
        }
        (Object::String(left), Object::String(right)) => eval_string_infix(operator, left, right),
        _ => match operator {
            InfixOperator::Eq => Ok(Object::Boolean(left.runtime_eq(right))),
            InfixOperator::NotEq => Ok(Object::Boolean(!left.runtime_eq(right))),
            _ if left.type_name() != right.type_name() => Err(RuntimeError::TypeMismatch {
                left: left.type_name(),
                operator,
                right: right.type_name(),
            }),
            _ => Err(RuntimeError::UnknownInfixOperator {
                left: left.type_name(),
                operator,
                right: right.type_name(),
            }),
        },
    }
}

fn eval_integer_infix(operator: InfixOperator, left: i64, right: i64) -> Result<Object, RuntimeError> {
    let result = match operator {
        InfixOperator::Plus => Object::Integer(left.wrapping_add(right)),
        InfixOperator::Minus => Object::Integer(left.wrapping_sub(right)),
        InfixOperator::Asterisk => Object::Integer(left.wrapping_mul(right)),
        InfixOperator::Slash => {
            if right == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            Object::Integer(left.wrapping_div(right))
        }
        InfixOperator::Lt => Object::Boolean(left < right),
        InfixOperator::Gt => Object::Boolean(left > right),
        InfixOperator::Eq => Object::Boolean(left == right),
        InfixOperator::NotEq => Object::Boolean(left != right),
        InfixOperator::Pipeline => {
            unreachable!("pipeline is lowered to a call before reaching eval_infix")
        }
    };
    Ok(result)
}

fn eval_string_infix(
    operator: InfixOperator,
    left: &Rc<str>,
    right: &Rc<str>,
) -> Result<Object, RuntimeError> {
    match operator {
        InfixOperator::Plus => Ok(Object::string(format!("{left}{right}"))),
        InfixOperator::Eq => Ok(Object::Boolean(left == right)),
        InfixOperator::NotEq => Ok(Object::Boolean(left != right)),
        _ => Err(RuntimeError::UnknownInfixOperator {
            left: "STRING",
            operator,
            right: "STRING",
        }),
    }
}

/// Applies a prefix operator. `!` negates truthiness and never fails; `-`
/// requires an integer.
pub fn eval_prefix(operator: PrefixOperator, operand: &Object) -> Result<Object, RuntimeError> {
    match operator {
        PrefixOperator::Bang => Ok(Object::Boolean(!operand.is_truthy())),
        PrefixOperator::Minus => match operand {
            Object::Integer(value) => Ok(Object::Integer(value.wrapping_neg())),
            _ => Err(RuntimeError::UnknownPrefixOperator {
                operator,
                operand: operand.type_name(),
            }),
        },
    }
}

/// Parses a number literal's spelling into the integer subset the runtime
/// supports. Float spellings lex fine but are rejected here.
pub fn parse_integer(spelling: &str) -> Result<i64, RuntimeError> {
    spelling
        .parse::<i64>()
        .map_err(|_| RuntimeError::NotAnInteger {
            spelling: spelling.to_string(),
        })
}

/// Name-to-value scope chain used by the tree-walking interpreter.
///
/// Lookup walks parents; writes always land in the innermost frame.
#[derive(Debug, Default)]
pub struct Environment {
    store: HashMap<String, Object>,
    parent: Option<Rc<RefCell<Environment>>>,
}

impl Environment {
    pub fn new() -> Rc<RefCell<Environment>> {
        Rc::new(RefCell::new(Environment::default()))
    }

    pub fn new_enclosed(parent: Rc<RefCell<Environment>>) -> Rc<RefCell<Environment>> {
        Rc::new(RefCell::new(Environment {
            store: HashMap::new(),
            parent: Some(parent),
        }))
    }

    pub fn get(&self, name: &str) -> Option<Object> {
        if let Some(value) = self.store.get(name) {
            return Some(value.clone());
        }
        self.parent
            .as_ref()
            .and_then(|parent| parent.borrow().get(name))
    }

    pub fn set(&mut self, name: impl Into<String>, value: Object) {
        self.store.insert(name.into(), value);
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect())
    }
}
