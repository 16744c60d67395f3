// Quill Lexer Module

mod scanner;
mod token;

pub use scanner::Scanner;
pub use token::{keyword, Token, TokenKind};
