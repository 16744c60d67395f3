// Quill Programming Language
// An embeddable, class-based scripting language with a bytecode VM

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod vm;

pub use compiler::{compile, CompileWarning, Program};
pub use error::{ErrorKind, QuillError, QuillResult};
pub use vm::{NativeFn, Value, Vm};

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Install a tracing subscriber for compiler and VM diagnostics.
///
/// Safe to call more than once. Nothing is installed unless `RUST_LOG` is set,
/// e.g. `RUST_LOG=quill_core=debug` or `RUST_LOG=quill_core::vm=trace`.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .init();
        }
    });
}
