// Shared helpers for Quill integration tests
//
// In a test file:
//     mod common;
//     use common::*;

#![allow(dead_code)]

pub use quill_core::error::{ErrorKind, QuillError};
pub use quill_core::vm::{Value, Vm};

/// Run a script on a fresh VM and return its printed lines
pub fn run(source: &str) -> Result<Vec<String>, QuillError> {
    let mut vm = Vm::with_captured_output();
    vm.run_source(source, "<test>")?;
    Ok(vm.take_output())
}

/// Run a script that must succeed
pub fn run_ok(source: &str) -> Vec<String> {
    match run(source) {
        Ok(lines) => lines,
        Err(e) => panic!("script failed: {}", e.message),
    }
}

/// Run a script that must fail, returning the error
pub fn run_err(source: &str) -> QuillError {
    match run(source) {
        Ok(lines) => panic!("script succeeded with output {:?}", lines),
        Err(e) => e,
    }
}

/// Lines as owned strings, for comparing against `run_ok`
pub fn lines(expected: &[&str]) -> Vec<String> {
    expected.iter().map(|s| s.to_string()).collect()
}

/// Assert the exact lines a script prints
#[track_caller]
pub fn assert_prints(source: &str, expected: &[&str]) {
    pretty_assertions::assert_eq!(run_ok(source), lines(expected));
}
