// Quill Compiler
// Single-pass: parses tokens and emits bytecode directly, no syntax tree

use super::chunk::{Constant, Function, FunctionKind, MAX_CONSTANTS};
use super::opcode::OpCode;
use super::state::{ClassContext, FunctionState, Local, LoopContext, MAX_LOCALS};
use crate::error::{QuillError, QuillResult, Span};
use crate::lexer::{Token, TokenKind};
use std::mem::discriminant;
use std::rc::Rc;
use tracing::{debug, warn};

/// Maximum number of parameters or call arguments
const MAX_ARGS: usize = 255;

/// A non-fatal diagnostic produced during compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileWarning {
    pub message: String,
    pub span: Span,
}

/// Operator binding power, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool) -> QuillResult<()>;

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

impl ParseRule {
    fn new(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> Self {
        Self {
            prefix,
            infix,
            precedence,
        }
    }
}

/// The Pratt rule table, indexed by token kind
fn rule(kind: &TokenKind) -> ParseRule {
    use Precedence as P;
    match kind {
        TokenKind::LeftParen => {
            ParseRule::new(Some(Compiler::grouping), Some(Compiler::call), P::Call)
        }
        TokenKind::Dot => ParseRule::new(None, Some(Compiler::dot), P::Call),
        TokenKind::Minus => ParseRule::new(Some(Compiler::unary), Some(Compiler::binary), P::Term),
        TokenKind::Plus => ParseRule::new(None, Some(Compiler::binary), P::Term),
        TokenKind::Slash | TokenKind::Star | TokenKind::Percent => {
            ParseRule::new(None, Some(Compiler::binary), P::Factor)
        }
        TokenKind::Bang => ParseRule::new(Some(Compiler::unary), None, P::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => {
            ParseRule::new(None, Some(Compiler::binary), P::Equality)
        }
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => ParseRule::new(None, Some(Compiler::binary), P::Comparison),
        TokenKind::Identifier(_) => ParseRule::new(Some(Compiler::variable), None, P::None),
        TokenKind::String(_) => ParseRule::new(Some(Compiler::string), None, P::None),
        TokenKind::Integer(_) | TokenKind::Float(_) => {
            ParseRule::new(Some(Compiler::number), None, P::None)
        }
        TokenKind::And => ParseRule::new(None, Some(Compiler::and), P::And),
        TokenKind::Or => ParseRule::new(None, Some(Compiler::or), P::Or),
        TokenKind::True | TokenKind::False | TokenKind::Null => {
            ParseRule::new(Some(Compiler::literal), None, P::None)
        }
        TokenKind::This => ParseRule::new(Some(Compiler::this), None, P::None),
        TokenKind::Super => ParseRule::new(Some(Compiler::super_), None, P::None),
        TokenKind::Fun => ParseRule::new(Some(Compiler::lambda), None, P::None),
        _ => ParseRule::new(None, None, P::None),
    }
}

/// The Quill bytecode compiler
pub struct Compiler {
    tokens: Vec<Token>,
    current: usize,
    file: String,
    source: String,
    /// One entry per function being compiled; the last one receives code
    states: Vec<FunctionState>,
    classes: Vec<ClassContext>,
    warnings: Vec<CompileWarning>,
}

impl Compiler {
    pub fn new(
        mut tokens: Vec<Token>,
        file: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        if !tokens.last().is_some_and(Token::is_eof) {
            let span = tokens.last().map(|t| t.span).unwrap_or_default();
            tokens.push(Token::new(TokenKind::Eof, "", span));
        }
        Self {
            tokens,
            current: 0,
            file: file.into(),
            source: source.into(),
            states: vec![FunctionState::new("<script>", FunctionKind::Script)],
            classes: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Compile the whole token stream into the top-level script function
    pub fn compile(&mut self) -> QuillResult<Rc<Function>> {
        while !self.is_at_end() {
            self.declaration()?;
        }
        self.end_function()
    }

    /// Unused-local warnings collected during `compile`
    pub fn take_warnings(&mut self) -> Vec<CompileWarning> {
        std::mem::take(&mut self.warnings)
    }

    // ==================== Token Helpers ====================

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len().saturating_sub(1))]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    fn is_at_end(&self) -> bool {
        self.peek().is_eof()
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        discriminant(&self.peek().kind) == discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> QuillResult<()> {
        if self.check(kind) {
            self.advance();
            return Ok(());
        }
        Err(self.error_at_current(message))
    }

    fn consume_identifier(&mut self, message: &str) -> QuillResult<String> {
        match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error_at_current(message)),
        }
    }

    fn error_at(&self, span: Span, message: &str) -> QuillError {
        QuillError::syntax_error(message, span, &self.file).with_source(&self.source)
    }

    fn error_at_current(&self, message: &str) -> QuillError {
        let token = self.peek();
        let found = if token.is_eof() {
            "end of file".to_string()
        } else {
            format!("'{}'", token.lexeme)
        };
        self.error_at(token.span, &format!("{}, found {}", message, found))
    }

    fn error_at_previous(&self, message: &str) -> QuillError {
        self.error_at(self.previous().span, message)
    }

    // ==================== State Access ====================

    fn state(&self) -> &FunctionState {
        &self.states[self.states.len() - 1]
    }

    fn state_mut(&mut self) -> &mut FunctionState {
        let last = self.states.len() - 1;
        &mut self.states[last]
    }

    // ==================== Emit Helpers ====================

    fn emit_byte_at(&mut self, byte: u8, span: Span) {
        self.state_mut().chunk.write(byte, span);
    }

    fn emit_byte(&mut self, byte: u8) {
        let span = self.previous().span;
        self.emit_byte_at(byte, span);
    }

    fn emit_op_at(&mut self, op: OpCode, span: Span) {
        self.emit_byte_at(u8::from(op), span);
    }

    fn emit_op(&mut self, op: OpCode) {
        let span = self.previous().span;
        self.emit_op_at(op, span);
    }

    fn emit_u16_at(&mut self, value: u16, span: Span) {
        self.state_mut().chunk.write_u16(value, span);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let span = self.previous().span;
        self.emit_op_at(op, span);
        self.emit_u16_at(0xFFFF, span);
        self.state().chunk.current_offset() - 2
    }

    fn patch_jump(&mut self, offset: usize) -> QuillResult<()> {
        let jump = self.state().chunk.current_offset() - offset - 2;
        let jump = u16::try_from(jump)
            .map_err(|_| self.error_at_previous("Too much code to jump over"))?;
        self.state().chunk.patch_u16(offset, jump);
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize) -> QuillResult<()> {
        self.emit_op(OpCode::Loop);
        let offset = self.state().chunk.current_offset() - loop_start + 2;
        let offset =
            u16::try_from(offset).map_err(|_| self.error_at_previous("Loop body too large"))?;
        let span = self.previous().span;
        self.emit_u16_at(offset, span);
        Ok(())
    }

    fn make_constant(&mut self, constant: Constant) -> QuillResult<u8> {
        let index = self.state_mut().chunk.add_constant(constant);
        if index >= MAX_CONSTANTS {
            return Err(self
                .error_at_previous("Too many constants in one chunk")
                .with_help("Split this function into smaller functions"));
        }
        Ok(index as u8)
    }

    fn identifier_constant(&mut self, name: &str) -> QuillResult<u8> {
        self.make_constant(Constant::String(Rc::from(name)))
    }

    fn emit_return(&mut self) {
        match self.state().kind {
            // Initializers and field chains hand back the receiver
            FunctionKind::Initializer | FunctionKind::FieldChain => {
                self.emit_op(OpCode::GetLocal);
                self.emit_byte(0);
            }
            _ => self.emit_op(OpCode::Null),
        }
        self.emit_op(OpCode::Return);
    }

    /// Emit a property-style instruction with a zeroed cache operand
    fn emit_cacheable(&mut self, op: OpCode, name: u8, span: Span) {
        self.emit_op_at(op, span);
        self.emit_byte_at(name, span);
        self.emit_u16_at(0, span);
    }

    // ==================== Functions ====================

    /// Finish the innermost function and return its prototype
    fn end_function(&mut self) -> QuillResult<Rc<Function>> {
        self.emit_return();

        let Some(state) = self.states.pop() else {
            return Err(self.error_at_previous("No function to finish"));
        };
        for local in state.locals.iter().skip(1) {
            self.warn_if_unused(local);
        }

        debug!(
            function = %state.name,
            kind = ?state.kind,
            bytes = state.chunk.code.len(),
            constants = state.chunk.constants.len(),
            upvalues = state.upvalues.len(),
            "compiled function"
        );

        Ok(Rc::new(Function {
            name: Rc::from(state.name.as_str()),
            arity: state.arity,
            upvalues: state.upvalues,
            chunk: state.chunk,
            kind: state.kind,
        }))
    }

    /// Emit `Closure` for a finished function into the now-current chunk
    fn emit_closure(&mut self, function: Rc<Function>) -> QuillResult<()> {
        let upvalues = function.upvalues.clone();
        let index = self.make_constant(Constant::Function(function))?;
        self.emit_op(OpCode::Closure);
        self.emit_byte(index);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
        Ok(())
    }

    /// Parameter list and body; the `(` is the next token
    fn function(&mut self, kind: FunctionKind, name: &str) -> QuillResult<()> {
        self.states.push(FunctionState::new(name, kind));
        self.begin_scope();

        self.consume(&TokenKind::LeftParen, "Expected '(' after function name")?;
        if !self.check(&TokenKind::RightParen) {
            loop {
                if self.state().arity == MAX_ARGS {
                    return Err(self.error_at_current("Can't have more than 255 parameters"));
                }
                self.state_mut().arity += 1;
                let param = self.consume_identifier("Expected parameter name")?;
                self.declare_local(&param)?;
                self.mark_initialized();
                if let Some(local) = self.state_mut().locals.last_mut() {
                    local.is_read = true;
                }
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after parameters")?;
        self.consume(&TokenKind::LeftBrace, "Expected '{' before function body")?;
        self.block()?;

        let function = self.end_function()?;
        self.emit_closure(function)
    }

    // ==================== Declarations ====================

    fn declaration(&mut self) -> QuillResult<()> {
        if self.match_token(&TokenKind::Class) {
            self.class_declaration()
        } else if self.check(&TokenKind::Fun)
            && matches!(
                self.tokens.get(self.current + 1).map(|t| &t.kind),
                Some(TokenKind::Identifier(_))
            )
        {
            self.advance();
            self.fun_declaration()
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration()
        } else {
            self.statement()
        }
    }

    fn var_declaration(&mut self) -> QuillResult<()> {
        let name = self.consume_identifier("Expected variable name")?;
        let global = self.declare_variable(&name)?;

        if self.match_token(&TokenKind::Equal) {
            self.expression()?;
        } else {
            self.emit_op(OpCode::Null);
        }
        self.consume(
            &TokenKind::Semicolon,
            "Expected ';' after variable declaration",
        )?;

        self.define_variable(global);
        Ok(())
    }

    fn fun_declaration(&mut self) -> QuillResult<()> {
        let name = self.consume_identifier("Expected function name")?;
        let global = self.declare_variable(&name)?;
        // Allows the body to refer to itself
        self.mark_initialized();
        self.function(FunctionKind::Function, &name)?;
        self.define_variable(global);
        Ok(())
    }

    fn class_declaration(&mut self) -> QuillResult<()> {
        let class_span = self.previous().span;
        let name = self.consume_identifier("Expected class name")?;
        let name_constant = self.identifier_constant(&name)?;
        let global = self.declare_variable(&name)?;

        self.emit_op_at(OpCode::Class, class_span);
        self.emit_byte(name_constant);
        self.define_variable(global);

        self.classes.push(ClassContext::new(name.clone()));

        if self.match_token(&TokenKind::Less) {
            let superclass = self.consume_identifier("Expected superclass name")?;
            if superclass == name {
                return Err(self.error_at_previous("A class can't inherit from itself"));
            }
            self.named_variable(&superclass, false)?;

            self.begin_scope();
            self.add_local("super")?;
            self.mark_initialized();

            self.named_variable(&name, false)?;
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(&name, false)?;
        self.consume(&TokenKind::LeftBrace, "Expected '{' before class body")?;
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            self.class_member()?;
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after class body")?;

        let chain = self.classes.last_mut().and_then(|c| c.field_chain.take());
        if let Some(chain) = chain {
            self.states.push(chain);
            let function = self.end_function()?;
            self.emit_closure(function)?;
            self.emit_op(OpCode::FieldChain);
        }
        self.emit_op(OpCode::Pop);

        let has_superclass = self.classes.last().is_some_and(|c| c.has_superclass);
        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
        Ok(())
    }

    fn class_member(&mut self) -> QuillResult<()> {
        if self.match_token(&TokenKind::Var) {
            return self.field_declaration();
        }
        self.match_token(&TokenKind::Fun);
        self.method()
    }

    fn method(&mut self) -> QuillResult<()> {
        let name = self.consume_identifier("Expected method or field declaration")?;
        let constant = self.identifier_constant(&name)?;
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, &name)?;
        self.emit_op(OpCode::Method);
        self.emit_byte(constant);
        Ok(())
    }

    /// `var name (= expr)?;` inside a class body. The initializer is compiled
    /// into the class's field chain rather than evaluated here.
    fn field_declaration(&mut self) -> QuillResult<()> {
        let name = self.consume_identifier("Expected field name")?;
        let span = self.previous().span;
        let constant = self.identifier_constant(&name)?;
        self.emit_op(OpCode::Field);
        self.emit_byte(constant);

        if self.match_token(&TokenKind::Equal) {
            let existing = self.classes.last_mut().and_then(|c| c.field_chain.take());
            let chain = match existing {
                Some(chain) => chain,
                None => {
                    let class_name = self.classes.last().map(|c| c.name.as_str()).unwrap_or("");
                    FunctionState::new(format!("{}.<fields>", class_name), FunctionKind::FieldChain)
                }
            };
            self.states.push(chain);

            self.emit_op_at(OpCode::GetLocal, span);
            self.emit_byte_at(0, span);
            self.expression()?;
            let name_in_chain = self.identifier_constant(&name)?;
            self.emit_cacheable(OpCode::SetProperty, name_in_chain, span);
            self.emit_op(OpCode::Pop);

            let chain = self.states.pop();
            if let Some(class) = self.classes.last_mut() {
                class.field_chain = chain;
            }
        }

        self.consume(&TokenKind::Semicolon, "Expected ';' after field declaration")?;
        Ok(())
    }

    // ==================== Statements ====================

    fn statement(&mut self) -> QuillResult<()> {
        if self.match_token(&TokenKind::Print) {
            self.print_statement()
        } else if self.match_token(&TokenKind::Throw) {
            self.throw_statement()
        } else if self.match_token(&TokenKind::If) {
            self.if_statement()
        } else if self.match_token(&TokenKind::While) {
            self.while_statement()
        } else if self.match_token(&TokenKind::For) {
            self.for_statement()
        } else if self.match_token(&TokenKind::Loop) {
            self.loop_statement()
        } else if self.match_token(&TokenKind::Break) {
            self.break_statement()
        } else if self.match_token(&TokenKind::Continue) {
            self.continue_statement()
        } else if self.match_token(&TokenKind::Return) {
            self.return_statement()
        } else if self.match_token(&TokenKind::LeftBrace) {
            self.begin_scope();
            self.block()?;
            self.end_scope();
            Ok(())
        } else {
            self.expression_statement()
        }
    }

    fn block(&mut self) -> QuillResult<()> {
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            self.declaration()?;
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after block")?;
        Ok(())
    }

    fn expression_statement(&mut self) -> QuillResult<()> {
        self.expression()?;
        self.consume(&TokenKind::Semicolon, "Expected ';' after expression")?;
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    fn print_statement(&mut self) -> QuillResult<()> {
        let span = self.previous().span;
        self.expression()?;
        self.consume(&TokenKind::Semicolon, "Expected ';' after value")?;
        self.emit_op_at(OpCode::Print, span);
        Ok(())
    }

    fn throw_statement(&mut self) -> QuillResult<()> {
        let span = self.previous().span;
        self.expression()?;
        self.consume(&TokenKind::Semicolon, "Expected ';' after thrown value")?;
        self.emit_op_at(OpCode::Throw, span);
        Ok(())
    }

    fn if_statement(&mut self) -> QuillResult<()> {
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'if'")?;
        self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition")?;

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement()?;

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump)?;
        self.emit_op(OpCode::Pop);

        if self.match_token(&TokenKind::Else) {
            self.statement()?;
        }
        self.patch_jump(else_jump)
    }

    fn while_statement(&mut self) -> QuillResult<()> {
        let loop_start = self.state().chunk.current_offset();
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'")?;
        self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition")?;

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.loop_body(loop_start)?;
        self.emit_loop(loop_start)?;

        self.patch_jump(exit_jump)?;
        self.emit_op(OpCode::Pop);
        self.end_loop()
    }

    fn for_statement(&mut self) -> QuillResult<()> {
        self.begin_scope();
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'for'")?;

        if self.match_token(&TokenKind::Semicolon) {
            // No initializer
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.state().chunk.current_offset();
        let mut exit_jump = None;
        if !self.match_token(&TokenKind::Semicolon) {
            self.expression()?;
            self.consume(&TokenKind::Semicolon, "Expected ';' after loop condition")?;
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(&TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.state().chunk.current_offset();
            self.expression()?;
            self.emit_op(OpCode::Pop);
            self.consume(&TokenKind::RightParen, "Expected ')' after for clauses")?;

            self.emit_loop(loop_start)?;
            loop_start = increment_start;
            self.patch_jump(body_jump)?;
        }

        self.loop_body(loop_start)?;
        self.emit_loop(loop_start)?;

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump)?;
            self.emit_op(OpCode::Pop);
        }
        self.end_loop()?;
        self.end_scope();
        Ok(())
    }

    fn loop_statement(&mut self) -> QuillResult<()> {
        let loop_start = self.state().chunk.current_offset();
        self.loop_body(loop_start)?;
        self.emit_loop(loop_start)?;
        self.end_loop()
    }

    /// Compile a loop body with `start` as the `continue` target
    fn loop_body(&mut self, start: usize) -> QuillResult<()> {
        let depth = self.state().scope_depth;
        self.state_mut().loops.push(LoopContext::new(start, depth));
        self.statement()
    }

    /// Patch pending `break` jumps to the current offset
    fn end_loop(&mut self) -> QuillResult<()> {
        if let Some(context) = self.state_mut().loops.pop() {
            for jump in context.break_jumps {
                self.patch_jump(jump)?;
            }
        }
        Ok(())
    }

    /// Pop or close every local declared inside the innermost loop
    fn emit_loop_cleanup(&mut self, depth: usize) {
        let captured: Vec<bool> = self
            .state()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| local.is_captured)
            .collect();
        for is_captured in captured {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn break_statement(&mut self) -> QuillResult<()> {
        let Some(depth) = self.state().loops.last().map(|l| l.scope_depth) else {
            return Err(self.error_at_previous("Can't use 'break' outside of a loop"));
        };
        self.consume(&TokenKind::Semicolon, "Expected ';' after 'break'")?;

        self.emit_loop_cleanup(depth);
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(context) = self.state_mut().loops.last_mut() {
            context.break_jumps.push(jump);
        }
        Ok(())
    }

    fn continue_statement(&mut self) -> QuillResult<()> {
        let Some((start, depth)) = self.state().loops.last().map(|l| (l.start, l.scope_depth))
        else {
            return Err(self.error_at_previous("Can't use 'continue' outside of a loop"));
        };
        self.consume(&TokenKind::Semicolon, "Expected ';' after 'continue'")?;

        self.emit_loop_cleanup(depth);
        self.emit_loop(start)
    }

    fn return_statement(&mut self) -> QuillResult<()> {
        let kind = self.state().kind;
        if kind == FunctionKind::Script {
            return Err(self.error_at_previous("Can't return from top-level code"));
        }

        if self.match_token(&TokenKind::Semicolon) {
            self.emit_return();
            return Ok(());
        }

        if kind == FunctionKind::Initializer {
            return Err(self
                .error_at_previous("Can't return a value from an initializer")
                .with_help("Initializers always return the new instance; use a bare 'return;'"));
        }
        self.expression()?;
        self.consume(&TokenKind::Semicolon, "Expected ';' after return value")?;
        self.emit_op(OpCode::Return);
        Ok(())
    }

    // ==================== Scope Management ====================

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;

        // Captured locals are closed instead of popped so closures keep them
        loop {
            let state = self.state();
            let Some(local) = state.locals.last() else {
                break;
            };
            if local.depth <= state.scope_depth {
                break;
            }
            let local = local.clone();
            self.warn_if_unused(&local);
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    fn warn_if_unused(&mut self, local: &Local) {
        if !local.warns_when_unused() {
            return;
        }
        let message = format!("Local variable '{}' is declared but never used", local.name);
        warn!(
            file = %self.file,
            line = local.span.start.line,
            column = local.span.start.column,
            "{}",
            message
        );
        self.warnings.push(CompileWarning {
            message,
            span: local.span,
        });
    }

    /// Declare a variable; returns the name constant for globals
    fn declare_variable(&mut self, name: &str) -> QuillResult<Option<u8>> {
        if self.state().scope_depth == 0 {
            return self.identifier_constant(name).map(Some);
        }
        self.declare_local(name)?;
        Ok(None)
    }

    fn define_variable(&mut self, global: Option<u8>) {
        match global {
            Some(constant) => {
                self.emit_op(OpCode::DefineGlobal);
                self.emit_byte(constant);
            }
            None => self.mark_initialized(),
        }
    }

    fn declare_local(&mut self, name: &str) -> QuillResult<()> {
        let state = self.state();
        let duplicate = state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth >= state.scope_depth)
            .any(|local| local.name == name);
        if duplicate {
            return Err(self.error_at_previous(&format!(
                "Variable '{}' already declared in this scope",
                name
            )));
        }
        self.add_local(name)
    }

    fn add_local(&mut self, name: &str) -> QuillResult<()> {
        if self.state().locals.len() >= MAX_LOCALS {
            return Err(self.error_at_previous("Too many local variables in function"));
        }
        let span = self.previous().span;
        let depth = self.state().scope_depth;
        self.state_mut().locals.push(Local {
            name: name.to_string(),
            depth,
            initialized: false,
            is_captured: false,
            is_read: false,
            span,
        });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        if let Some(local) = self.state_mut().locals.last_mut() {
            local.initialized = true;
        }
    }

    /// Resolve `name` as a local of the function at `depth` in the state stack
    fn resolve_local(&self, depth: usize, name: &str) -> QuillResult<Option<u8>> {
        let state = &self.states[depth];
        match state.resolve_local(name) {
            Some(slot) if !state.locals[slot].initialized => Err(self.error_at_previous(
                &format!("Can't read local variable '{}' in its own initializer", name),
            )),
            Some(slot) => Ok(Some(slot as u8)),
            None => Ok(None),
        }
    }

    /// Resolve an upvalue - a variable captured from an enclosing function
    fn resolve_upvalue(&mut self, depth: usize, name: &str) -> QuillResult<Option<u8>> {
        if depth == 0 {
            return Ok(None);
        }
        let enclosing = depth - 1;

        if let Some(slot) = self.resolve_local(enclosing, name)? {
            let local = &mut self.states[enclosing].locals[slot as usize];
            local.is_captured = true;
            local.is_read = true;
            return self.add_upvalue(depth, slot, true).map(Some);
        }

        if let Some(index) = self.resolve_upvalue(enclosing, name)? {
            return self.add_upvalue(depth, index, false).map(Some);
        }

        Ok(None)
    }

    fn add_upvalue(&mut self, depth: usize, index: u8, is_local: bool) -> QuillResult<u8> {
        match self.states[depth].add_upvalue(index, is_local) {
            Some(slot) => Ok(slot as u8),
            None => Err(self.error_at_previous("Too many closure variables in function")),
        }
    }

    // ==================== Expressions ====================

    fn expression(&mut self) -> QuillResult<()> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> QuillResult<()> {
        self.advance();
        let Some(prefix) = rule(&self.previous().kind).prefix else {
            return Err(self.error_at_previous("Expected expression"));
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign)?;

        while precedence <= rule(&self.peek().kind).precedence {
            self.advance();
            if let Some(infix) = rule(&self.previous().kind).infix {
                infix(self, can_assign)?;
            }
        }

        if can_assign && self.check(&TokenKind::Equal) {
            return Err(self.error_at_current("Invalid assignment target"));
        }
        Ok(())
    }

    fn grouping(&mut self, _can_assign: bool) -> QuillResult<()> {
        self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after expression")?;
        Ok(())
    }

    fn number(&mut self, _can_assign: bool) -> QuillResult<()> {
        let kind = self.previous().kind.clone();
        let value = match kind {
            TokenKind::Integer(n) if (0..=255).contains(&n) => {
                self.emit_op(OpCode::SmallInt);
                self.emit_byte(n as u8);
                return Ok(());
            }
            TokenKind::Integer(n) => n as f64,
            TokenKind::Float(n) => n,
            _ => return Err(self.error_at_previous("Expected number")),
        };
        let constant = self.make_constant(Constant::Number(value))?;
        self.emit_op(OpCode::Constant);
        self.emit_byte(constant);
        Ok(())
    }

    fn string(&mut self, _can_assign: bool) -> QuillResult<()> {
        let value: Rc<str> = match &self.previous().kind {
            TokenKind::String(value) => Rc::from(value.as_str()),
            _ => return Err(self.error_at_previous("Expected string")),
        };
        let constant = self.make_constant(Constant::String(value))?;
        self.emit_op(OpCode::Constant);
        self.emit_byte(constant);
        Ok(())
    }

    fn literal(&mut self, _can_assign: bool) -> QuillResult<()> {
        let kind = self.previous().kind.clone();
        match kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => self.emit_op(OpCode::Null),
        }
        Ok(())
    }

    fn unary(&mut self, _can_assign: bool) -> QuillResult<()> {
        let operator = self.previous().clone();
        self.parse_precedence(Precedence::Unary)?;
        match operator.kind {
            TokenKind::Minus => self.emit_op_at(OpCode::Negate, operator.span),
            _ => self.emit_op_at(OpCode::Not, operator.span),
        }
        Ok(())
    }

    fn binary(&mut self, _can_assign: bool) -> QuillResult<()> {
        let operator = self.previous().clone();
        self.parse_precedence(rule(&operator.kind).precedence.next())?;

        let op = match operator.kind {
            TokenKind::Plus => OpCode::Add,
            TokenKind::Minus => OpCode::Sub,
            TokenKind::Star => OpCode::Mul,
            TokenKind::Slash => OpCode::Div,
            TokenKind::Percent => OpCode::Mod,
            TokenKind::EqualEqual => OpCode::Equal,
            TokenKind::BangEqual => OpCode::NotEqual,
            TokenKind::Less => OpCode::Less,
            TokenKind::LessEqual => OpCode::LessEqual,
            TokenKind::Greater => OpCode::Greater,
            TokenKind::GreaterEqual => OpCode::GreaterEqual,
            _ => return Err(self.error_at(operator.span, "Unknown binary operator")),
        };
        self.emit_op_at(op, operator.span);
        Ok(())
    }

    fn and(&mut self, _can_assign: bool) -> QuillResult<()> {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)
    }

    fn or(&mut self, _can_assign: bool) -> QuillResult<()> {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump)?;
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)
    }

    fn argument_list(&mut self) -> QuillResult<u8> {
        let mut count = 0usize;
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.expression()?;
                if count == MAX_ARGS {
                    return Err(self.error_at_previous("Can't have more than 255 arguments"));
                }
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after arguments")?;
        Ok(count as u8)
    }

    fn call(&mut self, _can_assign: bool) -> QuillResult<()> {
        let span = self.previous().span;
        let argc = self.argument_list()?;
        self.emit_op_at(OpCode::Call, span);
        self.emit_byte_at(argc, span);
        Ok(())
    }

    fn dot(&mut self, can_assign: bool) -> QuillResult<()> {
        let name = self.consume_identifier("Expected property name after '.'")?;
        let span = self.previous().span;
        let constant = self.identifier_constant(&name)?;

        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression()?;
            self.emit_cacheable(OpCode::SetProperty, constant, span);
        } else if self.match_token(&TokenKind::LeftParen) {
            let argc = self.argument_list()?;
            self.emit_op_at(OpCode::Invoke, span);
            self.emit_byte_at(constant, span);
            self.emit_byte_at(argc, span);
            self.emit_u16_at(0, span);
        } else {
            self.emit_cacheable(OpCode::GetProperty, constant, span);
        }
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> QuillResult<()> {
        let TokenKind::Identifier(name) = &self.previous().kind else {
            return Err(self.error_at_previous("Expected identifier"));
        };
        let name = name.clone();
        self.named_variable(&name, can_assign)
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) -> QuillResult<()> {
        let span = self.previous().span;
        let depth = self.states.len() - 1;

        let (get, set, operand) = if let Some(slot) = self.resolve_local(depth, name)? {
            (OpCode::GetLocal, OpCode::SetLocal, Some(slot))
        } else if let Some(index) = self.resolve_upvalue(depth, name)? {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, Some(index))
        } else {
            (OpCode::GetGlobal, OpCode::SetGlobal, None)
        };

        let is_assignment = can_assign && self.match_token(&TokenKind::Equal);
        if is_assignment {
            self.expression()?;
        } else if get == OpCode::GetLocal {
            if let Some(slot) = operand {
                self.state_mut().locals[slot as usize].is_read = true;
            }
        }

        let op = if is_assignment { set } else { get };
        match operand {
            Some(index) => {
                self.emit_op_at(op, span);
                self.emit_byte_at(index, span);
            }
            None => {
                // Globals self-patch at runtime; the name stays for the cache guard
                let constant = self.identifier_constant(name)?;
                self.emit_cacheable(op, constant, span);
            }
        }
        Ok(())
    }

    fn this(&mut self, _can_assign: bool) -> QuillResult<()> {
        if self.classes.is_empty() {
            return Err(self.error_at_previous("Can't use 'this' outside of a class"));
        }
        self.named_variable("this", false)
    }

    fn super_(&mut self, _can_assign: bool) -> QuillResult<()> {
        match self.classes.last() {
            None => return Err(self.error_at_previous("Can't use 'super' outside of a class")),
            Some(class) if !class.has_superclass => {
                return Err(self.error_at_previous(
                    "Can't use 'super' in a class with no superclass",
                ))
            }
            _ => {}
        }

        self.consume(&TokenKind::Dot, "Expected '.' after 'super'")?;
        let name = self.consume_identifier("Expected superclass method name")?;
        let span = self.previous().span;
        let constant = self.identifier_constant(&name)?;

        self.named_variable("this", false)?;
        self.named_variable("super", false)?;
        self.emit_op_at(OpCode::GetSuper, span);
        self.emit_byte_at(constant, span);
        Ok(())
    }

    /// Anonymous function expression: `fun (params) { body }`
    fn lambda(&mut self, _can_assign: bool) -> QuillResult<()> {
        self.function(FunctionKind::Function, "<lambda>")
    }
}
