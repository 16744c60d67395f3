// Quill Native Functions
// Host callbacks callable from scripts

use super::value::Value;
use super::vm::Vm;
use std::fmt;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A host function. Receives the VM and the argument count; arguments are
/// read with [`Vm::arg`]. An `Err` becomes a runtime error in the script.
pub type NativeFn = fn(&mut Vm, usize) -> Result<Value, String>;

pub struct NativeFunction {
    pub name: Rc<str>,
    /// `None` accepts any number of arguments
    pub arity: Option<usize>,
    pub function: NativeFn,
}

impl NativeFunction {
    pub fn new(name: &str, arity: Option<usize>, function: NativeFn) -> Self {
        Self {
            name: Rc::from(name),
            arity,
            function,
        }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

/// Natives every VM starts with
pub(crate) fn install_defaults(vm: &mut Vm) {
    vm.define_native("clock", Some(0), clock);
    vm.define_native("str", Some(1), to_str);
}

/// Seconds since the Unix epoch
fn clock(_vm: &mut Vm, _argc: usize) -> Result<Value, String> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("System clock error: {}", e))?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

/// Printable form of any value
fn to_str(vm: &mut Vm, _argc: usize) -> Result<Value, String> {
    let value = vm.arg(0);
    Ok(Value::String(Rc::from(value.to_string())))
}
