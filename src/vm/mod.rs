// Quill VM Module
// Runtime values and the bytecode interpreter

mod globals;
mod natives;
mod value;
#[allow(clippy::module_inception)]
mod vm;

pub use globals::{Globals, MAX_GLOBALS};
pub use natives::{NativeFn, NativeFunction};
pub use value::{BoundMethod, Class, Closure, Instance, Upvalue, Value};
pub use vm::{Vm, FRAMES_MAX, STACK_MAX};
