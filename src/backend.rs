use anyhow::{Result, anyhow};

use crate::compiler::Compiler;
use crate::interpreter::Interpreter;
use crate::object::{Environment, Object};
use crate::parser::{self, ParseError};
use crate::parser::ast::Program;
use crate::vm::VM;

/// Outcome of one program run: the final expression's value and the lines
/// `puts` produced along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub result: Object,
    pub output: Vec<String>,
}

/// Executable artifact produced by a backend `prepare` step.
///
/// This keeps compilation and execution separated so benchmarks and tests
/// can measure/validate prepare-vs-run phases independently.
pub trait PreparedBackend {
    fn run(&self) -> Result<Evaluation>;
}

/// Common interface implemented by each execution backend. Both backends
/// surface runtime failures as errors with identical messages.
pub trait Backend {
    fn name(&self) -> &'static str;
    fn prepare(&self, program: &Program) -> Result<Box<dyn PreparedBackend>>;

    fn run_source(&self, source: &str) -> Result<Evaluation> {
        let program = parser::parse(source).map_err(parse_failure)?;
        self.prepare(&program)?.run()
    }
}

fn parse_failure(errors: Vec<ParseError>) -> anyhow::Error {
    let messages = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    anyhow!("parse failed:\n{messages}")
}

pub struct InterpreterBackend;

struct PreparedInterpreter {
    program: Program,
}

impl Backend for InterpreterBackend {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn prepare(&self, program: &Program) -> Result<Box<dyn PreparedBackend>> {
        Ok(Box::new(PreparedInterpreter {
            program: program.clone(),
        }))
    }
}

impl PreparedBackend for PreparedInterpreter {
    fn run(&self) -> Result<Evaluation> {
        let env = Environment::new();
        let mut interpreter = Interpreter::new();
        let result = interpreter.eval_program(&self.program, &env);
        if let Object::Error(message) = result {
            return Err(anyhow!(message));
        }
        Ok(Evaluation {
            result,
            output: interpreter.output,
        })
    }
}

pub struct VmBackend;

struct PreparedVm {
    bytecode: crate::compiler::Bytecode,
}

impl Backend for VmBackend {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn prepare(&self, program: &Program) -> Result<Box<dyn PreparedBackend>> {
        let mut compiler = Compiler::new();
        compiler.compile(program)?;
        Ok(Box::new(PreparedVm {
            bytecode: compiler.bytecode(),
        }))
    }
}

impl PreparedBackend for PreparedVm {
    fn run(&self) -> Result<Evaluation> {
        let mut vm = VM::new(self.bytecode.clone());
        vm.run()?;
        Ok(Evaluation {
            result: vm.last_popped_stack_elem(),
            output: std::mem::take(&mut vm.output),
        })
    }
}

pub fn backends() -> Vec<Box<dyn Backend>> {
    vec![Box::new(InterpreterBackend), Box::new(VmBackend)]
}
