// Quill Globals Table
// Name -> slot index, so cached global instructions can address values directly

use super::value::Value;
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Slots are addressed by a u16 cache operand
pub const MAX_GLOBALS: usize = u16::MAX as usize + 1;

/// Globals are only ever added, so a slot handed out stays valid for the
/// lifetime of the table. Slot numbers are per table: a cached slot from
/// another VM must be checked with `named` before use.
#[derive(Default)]
pub struct Globals {
    slots: FxHashMap<Rc<str>, u16>,
    names: Vec<Rc<str>>,
    values: Vec<Value>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, name: &str) -> Option<u16> {
        self.slots.get(name).copied()
    }

    /// Define or redefine a global; `None` when the table is full
    pub fn define(&mut self, name: Rc<str>, value: Value) -> Option<u16> {
        if let Some(slot) = self.slot(&name) {
            self.values[slot as usize] = value;
            return Some(slot);
        }
        if self.values.len() >= MAX_GLOBALS {
            return None;
        }
        let slot = self.values.len() as u16;
        self.values.push(value);
        self.names.push(name.clone());
        self.slots.insert(name, slot);
        Some(slot)
    }

    pub fn get(&self, slot: u16) -> Option<&Value> {
        self.values.get(slot as usize)
    }

    /// Value at `slot`, only if that slot holds the global `name`
    pub fn named(&self, slot: u16, name: &str) -> Option<&Value> {
        match self.names.get(slot as usize) {
            Some(held) if &**held == name => self.values.get(slot as usize),
            _ => None,
        }
    }

    /// Overwrite `slot` if it holds the global `name`
    pub fn set_named(&mut self, slot: u16, name: &str, value: Value) -> bool {
        match self.names.get(slot as usize) {
            Some(held) if &**held == name => self.set(slot, value),
            _ => false,
        }
    }

    pub fn set(&mut self, slot: u16, value: Value) -> bool {
        match self.values.get_mut(slot as usize) {
            Some(existing) => {
                *existing = value;
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.slot(name).and_then(|slot| self.get(slot))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
