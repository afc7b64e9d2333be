//! A small Scheme compiled to a portable bytecode and run on a stack VM.
//!
//! The pipeline is [`read`] → [`Compiler::compile`] → (optionally
//! [`serialize`] / [`deserialize`]) → [`Vm::run`].
use std::{io, rc::Rc};

pub mod codec;
pub mod compiler;
pub mod lexer;
pub mod reader;
pub mod runtime;
pub mod value;

pub use codec::{deserialize, serialize, FormatError};
pub use compiler::{
    bytecode::{CodeObject, Constant, Instruction, Opcode},
    compile, CompileError, Compiler,
};
pub use reader::{read, ParseError};
pub use runtime::{Arity, Frame, Fuel, Procedure, Vm, VmConfig, VmError};
pub use value::Value;

/// Any failure along the pipeline
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Reads and compiles `source`, accepting assignments to the standard primitives
pub fn compile_source(source: &str) -> Result<CodeObject, Error> {
    let program = read(source)?;
    let primitives = runtime::primitives::standard();
    let code = Compiler::new()
        .with_globals(primitives.iter().map(|primitive| primitive.name()))
        .compile(&program)?;
    Ok(code)
}

/// Reads, compiles and runs `source` in a fresh top-level frame of `vm`
pub fn run_source<W: io::Write>(vm: &mut Vm<W>, source: &str) -> Result<Value, Error> {
    let program = read(source)?;
    let code = Compiler::new()
        .with_globals(vm.primitive_names())
        .compile(&program)?;
    Ok(vm.run(Rc::new(code))?)
}
