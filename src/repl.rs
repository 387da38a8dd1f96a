use std::io::{BufRead, Write};

use anyhow::Result;

use crate::compiler::Compiler;
use crate::interpreter::Interpreter;
use crate::lexer::{self, Lexer};
use crate::object::{Environment, Object};
use crate::parser::Parser;
use crate::vm::{GLOBALS_SIZE, VM};

const PROMPT: &str = ">> ";

fn prompt_line(input: &mut impl BufRead, output: &mut impl Write) -> Result<Option<String>> {
    write!(output, "{PROMPT}")?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let line = line.trim_end_matches(['\n', '\r']);
    if line == "exit" {
        return Ok(None);
    }
    Ok(Some(line.to_string()))
}

/// Prints each token of the line, lex diagnostics after.
pub fn start_lexer(input: &mut impl BufRead, output: &mut impl Write) -> Result<()> {
    while let Some(line) = prompt_line(input, output)? {
        let (tokens, errors) = lexer::tokenize(&line);
        for token in &tokens {
            if token.kind != crate::lexer::token::TokenKind::Eof {
                writeln!(output, "{token}")?;
            }
        }
        for error in &errors {
            writeln!(output, "\t{error}")?;
        }
    }
    Ok(())
}

/// Prints the parsed program's canonical form, or every diagnostic.
pub fn start_parser(input: &mut impl BufRead, output: &mut impl Write) -> Result<()> {
    while let Some(line) = prompt_line(input, output)? {
        let mut parser = Parser::new(Lexer::new(&line));
        let program = parser.parse_program();
        if parser.errors().is_empty() {
            writeln!(output, "{program}")?;
        } else {
            for error in parser.errors() {
                writeln!(output, "\t{error}")?;
            }
        }
    }
    Ok(())
}

/// Tree-walking session with one persistent global environment.
pub fn start_interpreter(input: &mut impl BufRead, output: &mut impl Write) -> Result<()> {
    let env = Environment::new();
    let mut interpreter = Interpreter::new();
    while let Some(line) = prompt_line(input, output)? {
        let mut parser = Parser::new(Lexer::new(&line));
        let program = parser.parse_program();
        if !parser.errors().is_empty() {
            for error in parser.errors() {
                writeln!(output, "\t{error}")?;
            }
            continue;
        }
        let result = interpreter.eval_program(&program, &env);
        for line in interpreter.output.drain(..) {
            writeln!(output, "{line}")?;
        }
        writeln!(output, "{}", result.inspect())?;
    }
    Ok(())
}

/// Compile-and-run session; symbol table, constants, and globals survive
/// across lines so earlier definitions stay addressable.
pub fn start_vm(input: &mut impl BufRead, output: &mut impl Write) -> Result<()> {
    let (mut symbol_table, mut constants) = Compiler::new().into_state();
    let mut globals = vec![Object::Null; GLOBALS_SIZE];

    while let Some(line) = prompt_line(input, output)? {
        let mut parser = Parser::new(Lexer::new(&line));
        let program = parser.parse_program();
        if !parser.errors().is_empty() {
            for error in parser.errors() {
                writeln!(output, "\t{error}")?;
            }
            continue;
        }

        let mut compiler = Compiler::new_with_state(
            std::mem::take(&mut symbol_table),
            std::mem::take(&mut constants),
        );
        let compiled = compiler.compile(&program);
        let bytecode = compiler.bytecode();
        (symbol_table, constants) = compiler.into_state();
        if let Err(error) = compiled {
            writeln!(output, "compilation failed: {error}")?;
            continue;
        }

        let mut vm = VM::new_with_globals(bytecode, std::mem::take(&mut globals));
        let outcome = vm.run();
        for line in vm.output.drain(..) {
            writeln!(output, "{line}")?;
        }
        match outcome {
            Ok(()) => writeln!(output, "{}", vm.last_popped_stack_elem().inspect())?,
            Err(error) => writeln!(output, "executing bytecode failed: {error}")?,
        }
        globals = vm.take_globals();
    }
    Ok(())
}
