// Quill Compiler State
// Per-function, per-loop and per-class bookkeeping used while emitting bytecode

use super::chunk::{Chunk, FunctionKind, UpvalueInfo};
use crate::error::Span;
use smallvec::SmallVec;

/// Slot operands are one byte wide
pub const MAX_LOCALS: usize = 256;
pub const MAX_UPVALUES: usize = 256;

/// Local variable information
#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    pub depth: usize,
    pub initialized: bool,
    pub is_captured: bool, // true if captured by a closure
    pub is_read: bool,
    pub span: Span,
}

impl Local {
    /// Receiver, `super` and `_`-prefixed names never produce unused warnings
    pub fn warns_when_unused(&self) -> bool {
        !self.is_read
            && !self.name.is_empty()
            && !self.name.starts_with('_')
            && self.name != "this"
            && self.name != "super"
    }
}

/// An enclosing loop that `break` and `continue` can target
#[derive(Debug, Clone)]
pub struct LoopContext {
    /// Where `continue` jumps back to
    pub start: usize,
    /// Scope depth outside the loop body; deeper locals are cleaned up on exit
    pub scope_depth: usize,
    /// Forward jumps from `break`, patched once the loop end is known
    pub break_jumps: SmallVec<[usize; 4]>,
}

impl LoopContext {
    pub fn new(start: usize, scope_depth: usize) -> Self {
        Self {
            start,
            scope_depth,
            break_jumps: SmallVec::new(),
        }
    }
}

/// Compiler state for one function being compiled
#[derive(Debug)]
pub struct FunctionState {
    pub name: String,
    pub kind: FunctionKind,
    pub arity: usize,
    pub chunk: Chunk,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueInfo>, // Upvalues captured by this function
    pub scope_depth: usize,
    pub loops: Vec<LoopContext>,
}

impl FunctionState {
    pub fn new(name: impl Into<String>, kind: FunctionKind) -> Self {
        // Slot 0 holds the receiver in methods and the callee otherwise
        let slot_zero = if kind.has_receiver() { "this" } else { "" };
        Self {
            name: name.into(),
            kind,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                initialized: true,
                is_captured: false,
                is_read: true,
                span: Span::default(),
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }

    /// Find a local by name, innermost scope first
    pub fn resolve_local(&self, name: &str) -> Option<usize> {
        self.locals.iter().rposition(|local| local.name == name)
    }

    /// Register an upvalue, reusing an existing entry for the same capture
    pub fn add_upvalue(&mut self, index: u8, is_local: bool) -> Option<usize> {
        if let Some(existing) = self
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local)
        {
            return Some(existing);
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return None;
        }
        self.upvalues.push(UpvalueInfo { index, is_local });
        Some(self.upvalues.len() - 1)
    }
}

/// The class whose body is being compiled
#[derive(Debug)]
pub struct ClassContext {
    pub name: String,
    pub has_superclass: bool,
    /// Field-initializer chain, created by the first field with an initializer
    pub field_chain: Option<FunctionState>,
}

impl ClassContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            has_superclass: false,
            field_chain: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_reserve_slot_zero_for_this() {
        let method = FunctionState::new("area", FunctionKind::Method);
        assert_eq!(method.resolve_local("this"), Some(0));

        let function = FunctionState::new("area", FunctionKind::Function);
        assert_eq!(function.resolve_local("this"), None);
    }

    #[test]
    fn upvalues_are_deduplicated() {
        let mut state = FunctionState::new("f", FunctionKind::Function);
        assert_eq!(state.add_upvalue(1, true), Some(0));
        assert_eq!(state.add_upvalue(2, false), Some(1));
        assert_eq!(state.add_upvalue(1, true), Some(0));
        assert_eq!(state.upvalues.len(), 2);
    }

    #[test]
    fn unused_warning_exemptions() {
        let mut local = Local {
            name: "_scratch".into(),
            depth: 1,
            initialized: true,
            is_captured: false,
            is_read: false,
            span: Span::default(),
        };
        assert!(!local.warns_when_unused());
        local.name = "count".into();
        assert!(local.warns_when_unused());
        local.is_read = true;
        assert!(!local.warns_when_unused());
    }
}
