// Quill Scanner (Lexer)
// Converts source code into tokens

use crate::error::{QuillError, QuillResult, Span};
use crate::lexer::token::{keyword, Token, TokenKind};

/// Scanner that tokenizes Quill source code.
///
/// Scanning is total: malformed input is handed to the error callback and
/// skipped, and the returned token list always ends with `Eof`.
pub struct Scanner {
    source: Vec<char>,
    tokens: Vec<Token>,
    start: usize,
    current: usize,
    line: usize,
    column: usize,
    start_line: usize,
    start_column: usize,
    file: String,
}

impl Scanner {
    pub fn new(source: &str, file: impl Into<String>) -> Self {
        Self {
            source: source.chars().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            start_line: 1,
            start_column: 1,
            file: file.into(),
        }
    }

    /// Scan all tokens, reporting malformed input through `on_error`
    pub fn scan_tokens(mut self, on_error: &mut dyn FnMut(QuillError)) -> Vec<Token> {
        while !self.is_at_end() {
            self.start = self.current;
            self.start_line = self.line;
            self.start_column = self.column;
            if let Err(e) = self.scan_token() {
                on_error(e);
            }
        }

        self.tokens.push(Token::new(
            TokenKind::Eof,
            "",
            Span::single(self.line, self.column),
        ));

        self.tokens
    }

    /// Scan all tokens, failing with the first reported error
    pub fn scan_tokens_checked(self) -> QuillResult<Vec<Token>> {
        let mut first_error = None;
        let tokens = self.scan_tokens(&mut |e| {
            first_error.get_or_insert(e);
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(tokens),
        }
    }

    fn scan_token(&mut self) -> QuillResult<()> {
        let c = self.advance();

        match c {
            '(' => self.add_token(TokenKind::LeftParen),
            ')' => self.add_token(TokenKind::RightParen),
            '{' => self.add_token(TokenKind::LeftBrace),
            '}' => self.add_token(TokenKind::RightBrace),
            ',' => self.add_token(TokenKind::Comma),
            '.' => self.add_token(TokenKind::Dot),
            ';' => self.add_token(TokenKind::Semicolon),
            '+' => self.add_token(TokenKind::Plus),
            '-' => self.add_token(TokenKind::Minus),
            '*' => self.add_token(TokenKind::Star),
            '%' => self.add_token(TokenKind::Percent),
            '/' => {
                if self.match_char('/') {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                } else if self.match_char('*') {
                    self.block_comment()?;
                } else {
                    self.add_token(TokenKind::Slash);
                }
            }

            '!' => {
                let kind = if self.match_char('=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.add_token(kind);
            }
            '=' => {
                let kind = if self.match_char('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.add_token(kind);
            }
            '<' => {
                let kind = if self.match_char('=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.add_token(kind);
            }
            '>' => {
                let kind = if self.match_char('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.add_token(kind);
            }

            // Whitespace
            ' ' | '\r' | '\t' => {}
            '\n' => self.newline(),

            '"' => self.string()?,

            c if c.is_ascii_digit() => self.number(),
            c if c.is_alphabetic() || c == '_' => self.identifier(),

            _ => {
                return Err(self
                    .error(&format!("Unexpected character '{}'", c))
                    .with_help("Remove this character or check for typos"));
            }
        }

        Ok(())
    }

    /// Single-line string literal; a newline before the closing quote is an error
    fn string(&mut self) -> QuillResult<()> {
        let mut value = String::new();

        while self.peek() != '"' && self.peek() != '\n' && !self.is_at_end() {
            let c = self.advance();
            if c != '\\' {
                value.push(c);
                continue;
            }
            let escaped = self.advance_if_any();
            match escaped {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('r') => value.push('\r'),
                Some('0') => value.push('\0'),
                Some('\\') => value.push('\\'),
                Some('"') => value.push('"'),
                Some(other) => {
                    // Keep scanning to the closing quote so the rest of the line stays intact
                    self.skip_rest_of_string();
                    return Err(self
                        .error(&format!("Invalid escape sequence '\\{}'", other))
                        .with_help("Valid escapes: \\n, \\t, \\r, \\0, \\\\, \\\""));
                }
                None => break,
            }
        }

        if self.peek() != '"' {
            return Err(self
                .error("Unterminated string")
                .with_help("Add a closing double quote on the same line"));
        }

        self.advance();
        self.add_token(TokenKind::String(value));
        Ok(())
    }

    fn skip_rest_of_string(&mut self) {
        while self.peek() != '"' && self.peek() != '\n' && !self.is_at_end() {
            self.advance();
        }
        if self.peek() == '"' {
            self.advance();
        }
    }

    fn number(&mut self) {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        let mut is_float = false;
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            is_float = true;
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        let lexeme: String = self.source[self.start..self.current].iter().collect();
        let kind = if is_float {
            TokenKind::Float(lexeme.parse().unwrap_or(f64::NAN))
        } else {
            // Integers too large for i64 degrade to floats
            match lexeme.parse::<i64>() {
                Ok(n) => TokenKind::Integer(n),
                Err(_) => TokenKind::Float(lexeme.parse().unwrap_or(f64::INFINITY)),
            }
        };
        self.add_token(kind);
    }

    fn identifier(&mut self) {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let text: String = self.source[self.start..self.current].iter().collect();
        let kind = keyword(&text).unwrap_or(TokenKind::Identifier(text));
        self.add_token(kind);
    }

    fn block_comment(&mut self) -> QuillResult<()> {
        let mut depth = 1;

        while depth > 0 && !self.is_at_end() {
            if self.peek() == '/' && self.peek_next() == '*' {
                self.advance();
                self.advance();
                depth += 1;
            } else if self.peek() == '*' && self.peek_next() == '/' {
                self.advance();
                self.advance();
                depth -= 1;
            } else if self.advance() == '\n' {
                self.newline();
            }
        }

        if depth > 0 {
            return Err(self
                .error("Unterminated block comment")
                .with_help("Add '*/' to close the block comment"));
        }

        Ok(())
    }

    // Helper methods
    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn advance_if_any(&mut self) -> Option<char> {
        if self.is_at_end() || self.peek() == '\n' {
            None
        } else {
            Some(self.advance())
        }
    }

    fn newline(&mut self) {
        self.line += 1;
        self.column = 1;
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            false
        } else {
            self.current += 1;
            self.column += 1;
            true
        }
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme: String = self.source[self.start..self.current].iter().collect();
        let span = Span::from_positions(
            self.start_line,
            self.start_column,
            self.line,
            self.column.saturating_sub(1).max(1),
        );
        self.tokens.push(Token::new(kind, lexeme, span));
    }

    fn error(&self, message: &str) -> QuillError {
        QuillError::syntax_error(
            message,
            Span::from_positions(self.start_line, self.start_column, self.line, self.column),
            &self.file,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new(source, "<test>")
            .scan_tokens_checked()
            .map(|tokens| tokens.into_iter().map(|t| t.kind).collect())
            .unwrap_or_default()
    }

    #[test]
    fn scans_operators_and_keywords() {
        assert_eq!(
            kinds("var x = a % 2 != 0 and !b;"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier("x".into()),
                TokenKind::Equal,
                TokenKind::Identifier("a".into()),
                TokenKind::Percent,
                TokenKind::Integer(2),
                TokenKind::BangEqual,
                TokenKind::Integer(0),
                TokenKind::And,
                TokenKind::Bang,
                TokenKind::Identifier("b".into()),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn decimal_point_distinguishes_floats() {
        assert_eq!(
            kinds("12 1.5 3."),
            vec![
                TokenKind::Integer(12),
                TokenKind::Float(1.5),
                TokenKind::Integer(3),
                TokenKind::Dot,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn skips_line_and_nested_block_comments() {
        assert_eq!(
            kinds("// note\n/* outer /* inner */ still */ loop"),
            vec![TokenKind::Loop, TokenKind::Eof]
        );
    }

    #[test]
    fn tracks_lines_and_columns() {
        let tokens = Scanner::new("print 1;\n  fun", "<test>")
            .scan_tokens_checked()
            .unwrap_or_default();
        let fun = &tokens[3];
        assert_eq!(fun.kind, TokenKind::Fun);
        assert_eq!((fun.line(), fun.column()), (2, 3));
    }

    #[test]
    fn processes_escapes() {
        assert_eq!(
            kinds(r#""a\tb\"c""#),
            vec![TokenKind::String("a\tb\"c".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn errors_go_to_callback_and_scanning_continues() {
        let mut errors = Vec::new();
        let tokens = Scanner::new("var @ x = \"open\nprint x;", "<test>")
            .scan_tokens(&mut |e| errors.push(e.message));

        assert_eq!(
            errors,
            vec![
                "Unexpected character '@'".to_string(),
                "Unterminated string".to_string()
            ]
        );
        assert!(tokens.last().is_some_and(Token::is_eof));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Print));
    }
}
