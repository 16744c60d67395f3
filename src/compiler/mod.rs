// Quill Compiler Module
// Tokens in, function prototypes out

mod chunk;
#[allow(clippy::module_inception)]
mod compiler;
mod opcode;
mod state;

pub use chunk::{Chunk, Constant, Function, FunctionKind, UpvalueInfo, MAX_CONSTANTS};
pub use compiler::{CompileWarning, Compiler};
pub use opcode::OpCode;
pub use state::{MAX_LOCALS, MAX_UPVALUES};

use crate::error::QuillResult;
use crate::lexer::Scanner;
use std::rc::Rc;

/// A compiled script and the warnings produced along the way
#[derive(Debug)]
pub struct Program {
    pub function: Rc<Function>,
    pub warnings: Vec<CompileWarning>,
}

/// Scan and compile `source` into a top-level function
pub fn compile(source: &str, file: &str) -> QuillResult<Program> {
    let tokens = Scanner::new(source, file)
        .scan_tokens_checked()
        .map_err(|e| e.with_source(source))?;

    let mut compiler = Compiler::new(tokens, file, source);
    let function = compiler.compile()?;
    let warnings = compiler.take_warnings();
    Ok(Program { function, warnings })
}
