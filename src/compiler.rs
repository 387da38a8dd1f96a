use std::rc::Rc;

use thiserror::Error;

use crate::builtins::Builtin;
use crate::code::{Instructions, Opcode, make};
use crate::object::{CompiledFunction, Object, parse_integer};
use crate::parser::ast::{
    Block, Expression, FunctionLiteral, InfixOperator, Pattern, PrefixOperator, Program, Statement,
};

pub mod symbol_table;

use symbol_table::{Symbol, SymbolScope, SymbolTable};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("identifier is not found: {name}")]
    UndefinedIdentifier { name: String },
    #[error("cannot convert int. {spelling}")]
    NotAnInteger { spelling: String },
}

/// Compilation output: the main instruction stream plus the constants pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Object>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EmittedInstruction {
    opcode: Opcode,
    position: usize,
}

// One instruction buffer per enclosing function plus the outermost main
// scope. The last two emitted instructions feed the peepholes: a body's
// trailing `Pop` becomes `ReturnValue`, an `if` arm's trailing `Pop` is
// stripped.
#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Instructions,
    last_instruction: Option<EmittedInstruction>,
    previous_instruction: Option<EmittedInstruction>,
}

pub struct Compiler {
    constants: Vec<Object>,
    symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
}

// Placeholder jump target patched once the arm's extent is known.
const PLACEHOLDER_TARGET: usize = 9999;

impl Compiler {
    pub fn new() -> Self {
        let mut symbol_table = SymbolTable::new();
        for (index, builtin) in Builtin::ALL.into_iter().enumerate() {
            symbol_table.define_builtin(index, builtin.name());
        }
        Self::new_with_state(symbol_table, Vec::new())
    }

    /// Resumes a previous compile's symbol table and constants pool; the
    /// REPL threads its session state through here.
    pub fn new_with_state(symbol_table: SymbolTable, constants: Vec<Object>) -> Self {
        Self {
            constants,
            symbol_table,
            scopes: vec![CompilationScope::default()],
        }
    }

    pub fn compile(&mut self, program: &Program) -> Result<(), CompileError> {
        for statement in &program.statements {
            self.compile_statement(statement)?;
        }
        Ok(())
    }

    pub fn bytecode(&self) -> Bytecode {
        Bytecode {
            instructions: self.current_scope().instructions.clone(),
            constants: self.constants.clone(),
        }
    }

    /// Hands back the session state. The symbol table is unwound to the
    /// root scope so an aborted compile cannot leave dangling function
    /// scopes behind.
    pub fn into_state(self) -> (SymbolTable, Vec<Object>) {
        (self.symbol_table.into_root(), self.constants)
    }

    fn compile_statement(&mut self, statement: &Statement) -> Result<(), CompileError> {
        match statement {
            Statement::Expression(expression) => {
                self.compile_expression(expression)?;
                self.emit(Opcode::Pop, &[]);
            }
            Statement::Return(value) => {
                self.compile_expression(value)?;
                self.emit(Opcode::ReturnValue, &[]);
            }
            Statement::Let { pattern, value } => match pattern {
                Pattern::Identifier(name) => {
                    // Defined before the value compiles so `let f = fn() ...`
                    // can resolve its own name.
                    let symbol = self.symbol_table.define(name);
                    self.compile_expression(value)?;
                    self.emit_set(&symbol);
                }
                pattern => {
                    self.compile_expression(value)?;
                    self.compile_pattern_binding(pattern)?;
                }
            },
        }
        Ok(())
    }

    /// Binds the value on top of the stack to a destructuring pattern. The
    /// container lands in a reserved `"$"` slot, a name no legal identifier
    /// can collide with.
    fn compile_pattern_binding(&mut self, pattern: &Pattern) -> Result<(), CompileError> {
        match pattern {
            Pattern::Identifier(name) => {
                let symbol = self.symbol_table.define(name);
                self.emit_set(&symbol);
            }
            pattern => {
                let temp = self.symbol_table.define("$");
                self.emit_set(&temp);
                self.compile_pattern_components(&temp, pattern)?;
            }
        }
        Ok(())
    }

    /// Unpacks the container held in `source` component by component. Each
    /// component is an ordinary index: missing elements bind null.
    fn compile_pattern_components(
        &mut self,
        source: &Symbol,
        pattern: &Pattern,
    ) -> Result<(), CompileError> {
        match pattern {
            Pattern::Identifier(_) => unreachable!("identifier patterns bind directly"),
            Pattern::Array(patterns) => {
                for (position, sub_pattern) in patterns.iter().enumerate() {
                    self.load_symbol(source);
                    let index = self.add_constant(Object::Integer(position as i64));
                    self.emit(Opcode::Constant, &[index]);
                    self.emit(Opcode::Index, &[]);
                    self.compile_pattern_binding(sub_pattern)?;
                }
            }
            Pattern::Hash(names) => {
                for name in names {
                    self.load_symbol(source);
                    let index = self.add_constant(Object::string(name.as_str()));
                    self.emit(Opcode::Constant, &[index]);
                    self.emit(Opcode::Index, &[]);
                    let symbol = self.symbol_table.define(name);
                    self.emit_set(&symbol);
                }
            }
        }
        Ok(())
    }

    fn compile_expression(&mut self, expression: &Expression) -> Result<(), CompileError> {
        match expression {
            Expression::Number(spelling) => {
                let value =
                    parse_integer(spelling).map_err(|_| CompileError::NotAnInteger {
                        spelling: spelling.clone(),
                    })?;
                let index = self.add_constant(Object::Integer(value));
                self.emit(Opcode::Constant, &[index]);
            }
            Expression::String(value) => {
                let index = self.add_constant(Object::string(value.as_str()));
                self.emit(Opcode::Constant, &[index]);
            }
            Expression::Boolean(true) => {
                self.emit(Opcode::True, &[]);
            }
            Expression::Boolean(false) => {
                self.emit(Opcode::False, &[]);
            }
            Expression::Identifier(name) => {
                let symbol = self.symbol_table.resolve(name).ok_or_else(|| {
                    CompileError::UndefinedIdentifier { name: name.clone() }
                })?;
                self.load_symbol(&symbol);
            }
            Expression::Prefix { operator, right } => {
                self.compile_expression(right)?;
                match operator {
                    PrefixOperator::Bang => self.emit(Opcode::Bang, &[]),
                    PrefixOperator::Minus => self.emit(Opcode::Minus, &[]),
                };
            }
            Expression::Infix {
                left,
                operator,
                right,
            } => self.compile_infix(*operator, left, right)?,
            Expression::If {
                condition,
                consequence,
                alternative,
            } => self.compile_if(condition, consequence, alternative.as_ref())?,
            Expression::Array(elements) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit(Opcode::Array, &[elements.len()]);
            }
            Expression::Hash(pairs) => {
                // Source order is arbitrary; sorting by the key's printed
                // form makes the emitted bytecode deterministic.
                let mut pairs: Vec<_> = pairs.iter().collect();
                pairs.sort_by_key(|(key, _)| key.to_string());
                for (key, value) in &pairs {
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                }
                self.emit(Opcode::Hash, &[pairs.len() * 2]);
            }
            Expression::Index { left, index } => {
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.emit(Opcode::Index, &[]);
            }
            Expression::Call {
                function,
                arguments,
            } => {
                self.compile_expression(function)?;
                for argument in arguments {
                    self.compile_expression(argument)?;
                }
                self.emit(Opcode::Call, &[arguments.len()]);
            }
            Expression::Function(function) => self.compile_function(function)?,
        }
        Ok(())
    }

    fn compile_infix(
        &mut self,
        operator: InfixOperator,
        left: &Expression,
        right: &Expression,
    ) -> Result<(), CompileError> {
        match operator {
            // `a | f` is a one-argument call of f with a.
            InfixOperator::Pipeline => {
                self.compile_expression(right)?;
                self.compile_expression(left)?;
                self.emit(Opcode::Call, &[1]);
                return Ok(());
            }
            // `<` swaps its operands and reuses GreaterThan.
            InfixOperator::Lt => {
                self.compile_expression(right)?;
                self.compile_expression(left)?;
                self.emit(Opcode::GreaterThan, &[]);
                return Ok(());
            }
            _ => {}
        }

        self.compile_expression(left)?;
        self.compile_expression(right)?;
        match operator {
            InfixOperator::Plus => self.emit(Opcode::Add, &[]),
            InfixOperator::Minus => self.emit(Opcode::Sub, &[]),
            InfixOperator::Asterisk => self.emit(Opcode::Mul, &[]),
            InfixOperator::Slash => self.emit(Opcode::Div, &[]),
            InfixOperator::Gt => self.emit(Opcode::GreaterThan, &[]),
            InfixOperator::Eq => self.emit(Opcode::Equal, &[]),
            InfixOperator::NotEq => self.emit(Opcode::NotEqual, &[]),
            InfixOperator::Lt | InfixOperator::Pipeline => unreachable!("handled above"),
        };
        Ok(())
    }

    fn compile_if(
        &mut self,
        condition: &Expression,
        consequence: &Block,
        alternative: Option<&Block>,
    ) -> Result<(), CompileError> {
        self.compile_expression(condition)?;
        let jump_not_truthy = self.emit(Opcode::JumpNotTruthy, &[PLACEHOLDER_TARGET]);

        let arm_start = self.current_scope().instructions.len();
        self.compile_block(consequence)?;
        if self.last_instruction_is(Opcode::Pop) {
            self.remove_last_instruction();
        }
        self.ensure_arm_leaves_value(arm_start);

        let jump = self.emit(Opcode::Jump, &[PLACEHOLDER_TARGET]);
        let after_consequence = self.current_scope().instructions.len();
        self.change_operand(jump_not_truthy, after_consequence);

        match alternative {
            None => {
                self.emit(Opcode::Null, &[]);
            }
            Some(alternative) => {
                let arm_start = self.current_scope().instructions.len();
                self.compile_block(alternative)?;
                if self.last_instruction_is(Opcode::Pop) {
                    self.remove_last_instruction();
                }
                self.ensure_arm_leaves_value(arm_start);
            }
        }
        let after_alternative = self.current_scope().instructions.len();
        self.change_operand(jump, after_alternative);
        Ok(())
    }

    /// Both `if` arms must leave exactly one value for the enclosing
    /// expression. An empty arm, or one ending in a binding, pushes null —
    /// the same result the tree-walker produces for such blocks.
    fn ensure_arm_leaves_value(&mut self, arm_start: usize) {
        let leaves_value = match self.current_scope().last_instruction {
            Some(last) if last.position >= arm_start => {
                !matches!(last.opcode, Opcode::SetGlobal | Opcode::SetLocal)
            }
            _ => false,
        };
        if !leaves_value {
            self.emit(Opcode::Null, &[]);
        }
    }

    fn compile_block(&mut self, block: &Block) -> Result<(), CompileError> {
        for statement in &block.statements {
            self.compile_statement(statement)?;
        }
        Ok(())
    }

    fn compile_function(&mut self, function: &FunctionLiteral) -> Result<(), CompileError> {
        self.enter_scope();

        if let Some(name) = &function.name {
            self.symbol_table.define_function_name(name);
        }

        // Parameter slots are assigned in declaration order; a
        // destructuring parameter holds the whole argument in a reserved
        // slot and its components are defined as further locals below.
        let mut destructured = Vec::new();
        for parameter in &function.parameters {
            match parameter {
                Pattern::Identifier(name) => {
                    self.symbol_table.define(name);
                }
                pattern => {
                    let slot = self.symbol_table.define("$");
                    destructured.push((slot, pattern));
                }
            }
        }
        for (slot, pattern) in &destructured {
            self.compile_pattern_components(slot, pattern)?;
        }

        self.compile_block(&function.body)?;

        if self.last_instruction_is(Opcode::Pop) {
            self.replace_last_pop_with_return();
        }
        if !self.last_instruction_is(Opcode::ReturnValue) {
            self.emit(Opcode::Return, &[]);
        }

        let free_symbols = self.symbol_table.free_symbols.clone();
        let num_locals = self.symbol_table.num_definitions;
        let instructions = self.leave_scope();

        for symbol in &free_symbols {
            self.load_symbol(symbol);
        }

        let compiled = Object::CompiledFunction(Rc::new(CompiledFunction {
            instructions,
            num_locals,
            num_parameters: function.parameters.len(),
        }));
        let index = self.add_constant(compiled);
        self.emit(Opcode::Closure, &[index, free_symbols.len()]);
        Ok(())
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        let outer = std::mem::take(&mut self.symbol_table);
        self.symbol_table = SymbolTable::new_enclosed(outer);
    }

    fn leave_scope(&mut self) -> Instructions {
        let scope = self.scopes.pop().expect("scope stack is never empty");
        let inner = std::mem::take(&mut self.symbol_table);
        self.symbol_table = inner.into_outer();
        scope.instructions
    }

    fn emit(&mut self, op: Opcode, operands: &[usize]) -> usize {
        let instruction = make(op, operands);
        let position = self.current_scope().instructions.len();
        let scope = self.current_scope_mut();
        scope.instructions.extend(&instruction);
        scope.previous_instruction = scope.last_instruction;
        scope.last_instruction = Some(EmittedInstruction {
            opcode: op,
            position,
        });
        position
    }

    fn emit_set(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::SetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Opcode::SetLocal, &[symbol.index]),
            _ => unreachable!("define only produces globals and locals"),
        };
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[symbol.index]),
            SymbolScope::Builtin => self.emit(Opcode::GetBuiltin, &[symbol.index]),
            SymbolScope::Free => self.emit(Opcode::GetFree, &[symbol.index]),
            SymbolScope::Function => self.emit(Opcode::CurrentClosure, &[]),
        };
    }

    fn add_constant(&mut self, constant: Object) -> usize {
        self.constants.push(constant);
        self.constants.len() - 1
    }

    fn last_instruction_is(&self, op: Opcode) -> bool {
        self.current_scope()
            .last_instruction
            .is_some_and(|last| last.opcode == op)
    }

    fn remove_last_instruction(&mut self) {
        let scope = self.current_scope_mut();
        if let Some(last) = scope.last_instruction {
            scope.instructions.0.truncate(last.position);
            scope.last_instruction = scope.previous_instruction;
            scope.previous_instruction = None;
        }
    }

    fn replace_last_pop_with_return(&mut self) {
        let scope = self.current_scope_mut();
        let last = scope
            .last_instruction
            .as_mut()
            .expect("peephole requires a last instruction");
        scope.instructions.0[last.position] = Opcode::ReturnValue as u8;
        last.opcode = Opcode::ReturnValue;
    }

    fn change_operand(&mut self, position: usize, operand: usize) {
        let op = Opcode::try_from(self.current_scope().instructions.0[position])
            .expect("patched position holds a valid opcode");
        let instruction = make(op, &[operand]);
        let scope = self.current_scope_mut();
        scope.instructions.0[position..position + instruction.len()]
            .copy_from_slice(&instruction);
    }

    fn current_scope(&self) -> &CompilationScope {
        self.scopes.last().expect("scope stack is never empty")
    }

    fn current_scope_mut(&mut self) -> &mut CompilationScope {
        self.scopes.last_mut().expect("scope stack is never empty")
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}
