// Quill Bytecode Instructions
// Operands follow the opcode byte; u16 operands are big-endian

/// Bytecode operation codes
///
/// The `*Cached` variants are never emitted by the compiler. The VM rewrites
/// an uncached instruction into its cached twin after the first successful
/// lookup, and both twins have the same encoded width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Constants and stack operations
    Constant, // const:u8
    SmallInt, // value:u8, integer literals 0..=255
    Pop,

    // Literals
    Null,
    True,
    False,

    // Globals
    DefineGlobal,    // name:u8
    GetGlobal,       // name:u8 cache:u16
    GetGlobalCached, // name:u8 slot:u16
    SetGlobal,       // name:u8 cache:u16
    SetGlobalCached, // name:u8 slot:u16

    // Locals and upvalues
    GetLocal,     // slot:u8
    SetLocal,     // slot:u8
    GetUpvalue,   // index:u8
    SetUpvalue,   // index:u8
    CloseUpvalue, // close the cell over the top slot, then pop

    // Properties
    GetProperty,     // name:u8 cache:u16
    GetFieldCached,  // name:u8 field:u16
    GetMethodCached, // name:u8 method:u16
    SetProperty,     // name:u8 cache:u16
    SetFieldCached,  // name:u8 field:u16
    GetSuper,        // name:u8

    // Arithmetic operations
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Negate,

    // Comparison operations
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Not,

    // Statements
    Print,
    Throw,

    // Control flow
    Jump,        // offset:u16 forward
    JumpIfFalse, // offset:u16 forward, condition stays on the stack
    Loop,        // offset:u16 backward

    // Functions
    Call,         // argc:u8
    Invoke,       // name:u8 argc:u8 cache:u16
    InvokeCached, // name:u8 argc:u8 method:u16
    Closure,      // const:u8 then (is_local:u8, index:u8) per upvalue
    Return,

    // Classes
    Class,      // name:u8
    Inherit,    // [superclass, subclass] -> [superclass]
    Method,     // name:u8, [class, closure] -> [class]
    Field,      // name:u8, declares a field on the class on top
    FieldChain, // [class, closure] -> [class]
}

impl OpCode {
    const ALL: [OpCode; 50] = [
        OpCode::Constant,
        OpCode::SmallInt,
        OpCode::Pop,
        OpCode::Null,
        OpCode::True,
        OpCode::False,
        OpCode::DefineGlobal,
        OpCode::GetGlobal,
        OpCode::GetGlobalCached,
        OpCode::SetGlobal,
        OpCode::SetGlobalCached,
        OpCode::GetLocal,
        OpCode::SetLocal,
        OpCode::GetUpvalue,
        OpCode::SetUpvalue,
        OpCode::CloseUpvalue,
        OpCode::GetProperty,
        OpCode::GetFieldCached,
        OpCode::GetMethodCached,
        OpCode::SetProperty,
        OpCode::SetFieldCached,
        OpCode::GetSuper,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Mod,
        OpCode::Negate,
        OpCode::Equal,
        OpCode::NotEqual,
        OpCode::Less,
        OpCode::LessEqual,
        OpCode::Greater,
        OpCode::GreaterEqual,
        OpCode::Not,
        OpCode::Print,
        OpCode::Throw,
        OpCode::Jump,
        OpCode::JumpIfFalse,
        OpCode::Loop,
        OpCode::Call,
        OpCode::Invoke,
        OpCode::InvokeCached,
        OpCode::Closure,
        OpCode::Return,
        OpCode::Class,
        OpCode::Inherit,
        OpCode::Method,
        OpCode::Field,
        OpCode::FieldChain,
    ];

    /// Decode an opcode byte
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        Self::ALL
            .get(byte as usize)
            .copied()
            .filter(|op| *op as u8 == byte)
    }

    /// Get the number of operand bytes that follow this opcode.
    /// `Closure` reports only its constant byte; the upvalue pairs that
    /// follow depend on the function being wrapped.
    pub fn operand_count(&self) -> usize {
        match self {
            OpCode::Constant
            | OpCode::SmallInt
            | OpCode::DefineGlobal
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::GetSuper
            | OpCode::Call
            | OpCode::Closure
            | OpCode::Class
            | OpCode::Method
            | OpCode::Field => 1,

            OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::Loop => 2,

            OpCode::GetGlobal
            | OpCode::GetGlobalCached
            | OpCode::SetGlobal
            | OpCode::SetGlobalCached
            | OpCode::GetProperty
            | OpCode::GetFieldCached
            | OpCode::GetMethodCached
            | OpCode::SetProperty
            | OpCode::SetFieldCached => 3,

            OpCode::Invoke | OpCode::InvokeCached => 4,

            _ => 0,
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}
