// Quill Bytecode Chunk
// Contains bytecode, constants, and debug information

use super::opcode::OpCode;
use crate::error::Span;
use std::cell::Cell;
use std::fmt::Write;
use std::rc::Rc;

/// Constant pools are indexed by a single byte
pub const MAX_CONSTANTS: usize = 256;

/// Constant values stored in the constant pool
#[derive(Debug, Clone)]
pub enum Constant {
    Number(f64),
    String(Rc<str>),
    Function(Rc<Function>),
}

/// Upvalue metadata - describes how to capture a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueInfo {
    pub index: u8,      // Index in parent's locals or upvalues
    pub is_local: bool, // true = capture from parent's local, false = from parent's upvalue
}

/// What a compiled function is used as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
    /// Per-class field-initializer chain
    FieldChain,
}

impl FunctionKind {
    /// Whether slot 0 holds the receiver
    pub fn has_receiver(&self) -> bool {
        matches!(
            self,
            FunctionKind::Method | FunctionKind::Initializer | FunctionKind::FieldChain
        )
    }
}

/// A compiled function prototype
#[derive(Debug)]
pub struct Function {
    pub name: Rc<str>,
    pub arity: usize,
    pub upvalues: Vec<UpvalueInfo>,
    pub chunk: Chunk,
    pub kind: FunctionKind,
}

impl Function {
    pub fn upvalue_count(&self) -> usize {
        self.upvalues.len()
    }
}

/// A chunk of bytecode
///
/// Instruction bytes sit in `Cell`s so the VM can rewrite cacheable
/// instructions in place while the chunk is shared behind an `Rc`.
#[derive(Debug, Default)]
pub struct Chunk {
    /// Raw bytecode
    pub code: Vec<Cell<u8>>,
    /// Constant pool
    pub constants: Vec<Constant>,
    /// Span information for each byte for error reporting
    pub spans: Vec<Span>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a single byte to the chunk with span info
    pub fn write(&mut self, byte: u8, span: Span) {
        self.code.push(Cell::new(byte));
        self.spans.push(span);
    }

    /// Write an opcode to the chunk
    pub fn write_op(&mut self, op: OpCode, span: Span) {
        self.write(u8::from(op), span);
    }

    /// Write a u16 operand (big-endian)
    pub fn write_u16(&mut self, value: u16, span: Span) {
        self.write((value >> 8) as u8, span);
        self.write((value & 0xFF) as u8, span);
    }

    /// Add a constant and return its index.
    /// Numbers and strings already in the pool are reused.
    pub fn add_constant(&mut self, constant: Constant) -> usize {
        let existing = self.constants.iter().position(|c| match (c, &constant) {
            (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
            (Constant::String(a), Constant::String(b)) => a == b,
            _ => false,
        });
        if let Some(index) = existing {
            return index;
        }
        self.constants.push(constant);
        self.constants.len() - 1
    }

    /// Get the current code offset
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        self.code[offset].get()
    }

    /// Read a u16 at the given offset
    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset].get() as u16) << 8) | (self.code[offset + 1].get() as u16)
    }

    /// Overwrite a u16 operand; used by jump patching and the inline caches
    pub fn patch_u16(&self, offset: usize, value: u16) {
        self.code[offset].set((value >> 8) as u8);
        self.code[offset + 1].set((value & 0xFF) as u8);
    }

    /// Rewrite the opcode byte at `offset`
    pub fn patch_op(&self, offset: usize, op: OpCode) {
        self.code[offset].set(u8::from(op));
    }

    /// Get span for instruction at offset
    pub fn get_span(&self, offset: usize) -> Span {
        self.spans.get(offset).copied().unwrap_or_default()
    }

    /// Disassemble the chunk and every nested function
    pub fn disassemble(&self, name: &str) -> String {
        let mut out = String::new();
        self.disassemble_with_indent(name, 0, &mut out);
        out
    }

    fn disassemble_with_indent(&self, name: &str, indent: usize, out: &mut String) {
        let prefix = "  ".repeat(indent);

        let _ = writeln!(out, "{}--- {} ---", prefix, name);
        let _ = writeln!(
            out,
            "{}{} bytes, {} constants",
            prefix,
            self.code.len(),
            self.constants.len()
        );

        let mut offset = 0;
        while offset < self.code.len() {
            out.push_str(&prefix);
            offset = self.disassemble_instruction(offset, out);
        }

        // Recursively disassemble nested functions
        for constant in &self.constants {
            if let Constant::Function(f) = constant {
                f.chunk
                    .disassemble_with_indent(&format!("<fn {}>", f.name), indent + 1, out);
            }
        }
    }

    fn format_constant(&self, idx: usize) -> String {
        match self.constants.get(idx) {
            Some(Constant::Number(n)) => format!("{}", n),
            Some(Constant::String(s)) => {
                let char_count = s.chars().count();
                if char_count > 32 {
                    let truncated: String = s.chars().take(29).collect();
                    format!("\"{}...\"", truncated)
                } else {
                    format!("\"{}\"", s)
                }
            }
            Some(Constant::Function(f)) => format!("<fn {}>", f.name),
            None => format!("???[{}]", idx),
        }
    }

    /// Render one instruction and return the offset of the next one
    pub fn disassemble_instruction(&self, offset: usize, out: &mut String) -> usize {
        let line = self.get_span(offset).start.line;
        if offset > 0 && line == self.get_span(offset - 1).start.line {
            let _ = write!(out, "{:04}    | ", offset);
        } else {
            let _ = write!(out, "{:04} {:4} ", offset, line);
        }

        let Some(op) = OpCode::from_byte(self.read_byte(offset)) else {
            let _ = writeln!(out, "??? 0x{:02x}", self.read_byte(offset));
            return offset + 1;
        };
        let name = format!("{:?}", op);

        match op {
            OpCode::Constant
            | OpCode::DefineGlobal
            | OpCode::GetSuper
            | OpCode::Class
            | OpCode::Method
            | OpCode::Field => {
                let idx = self.read_byte(offset + 1) as usize;
                let _ = writeln!(out, "{:<16} {}", name, self.format_constant(idx));
                offset + 2
            }
            OpCode::SmallInt
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Call => {
                let _ = writeln!(out, "{:<16} {}", name, self.read_byte(offset + 1));
                offset + 2
            }
            OpCode::GetGlobal
            | OpCode::GetGlobalCached
            | OpCode::SetGlobal
            | OpCode::SetGlobalCached
            | OpCode::GetProperty
            | OpCode::GetFieldCached
            | OpCode::GetMethodCached
            | OpCode::SetProperty
            | OpCode::SetFieldCached => {
                let idx = self.read_byte(offset + 1) as usize;
                let _ = writeln!(
                    out,
                    "{:<16} {} [{}]",
                    name,
                    self.format_constant(idx),
                    self.read_u16(offset + 2)
                );
                offset + 4
            }
            OpCode::Invoke | OpCode::InvokeCached => {
                let idx = self.read_byte(offset + 1) as usize;
                let _ = writeln!(
                    out,
                    "{:<16} {} ({}) [{}]",
                    name,
                    self.format_constant(idx),
                    self.read_byte(offset + 2),
                    self.read_u16(offset + 3)
                );
                offset + 5
            }
            OpCode::Jump | OpCode::JumpIfFalse => {
                let jump = self.read_u16(offset + 1) as usize;
                let _ = writeln!(out, "{:<16} -> {:04}", name, offset + 3 + jump);
                offset + 3
            }
            OpCode::Loop => {
                let jump = self.read_u16(offset + 1) as usize;
                let _ = writeln!(out, "{:<16} -> {:04}", name, (offset + 3).saturating_sub(jump));
                offset + 3
            }
            OpCode::Closure => {
                let idx = self.read_byte(offset + 1) as usize;
                let _ = writeln!(out, "{:<16} {}", name, self.format_constant(idx));
                let mut next = offset + 2;
                if let Some(Constant::Function(f)) = self.constants.get(idx) {
                    for _ in 0..f.upvalue_count() {
                        let kind = if self.read_byte(next) == 1 { "local" } else { "upvalue" };
                        let _ = writeln!(out, "{:04}    |   {} {}", next, kind, self.read_byte(next + 1));
                        next += 2;
                    }
                }
                next
            }
            _ => {
                let _ = writeln!(out, "{}", name);
                offset + 1 + op.operand_count()
            }
        }
    }
}
