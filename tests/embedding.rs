// Host-side API: natives, globals and calling script functions

mod common;
use common::*;
use quill_core::compiler::compile;

fn add(vm: &mut Vm, _argc: usize) -> Result<Value, String> {
    match (vm.arg(0), vm.arg(1)) {
        (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
        (a, b) => Err(format!(
            "add expects numbers, got {} and {}",
            a.type_name(),
            b.type_name()
        )),
    }
}

fn count_args(_vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Ok(Value::Number(argc as f64))
}

fn apply(vm: &mut Vm, _argc: usize) -> Result<Value, String> {
    let callee = vm.arg(0);
    let argument = vm.arg(1);
    vm.call_function(callee, &[argument])
        .map_err(|e| e.message)
}

#[test]
fn natives_receive_arguments() {
    let mut vm = Vm::with_captured_output();
    vm.define_native("add", Some(2), add);
    vm.run_source("print add(2, 40);", "<host>").unwrap();
    assert_eq!(vm.take_output(), lines(&["42"]));
}

#[test]
fn variadic_natives() {
    let mut vm = Vm::with_captured_output();
    vm.define_native("count", None, count_args);
    vm.run_source("print count(); print count(1, 2, 3);", "<host>").unwrap();
    assert_eq!(vm.take_output(), lines(&["0", "3"]));
}

#[test]
fn native_failure_becomes_runtime_error() {
    let mut vm = Vm::with_captured_output();
    vm.define_native("add", Some(2), add);
    let err = vm.run_source("add(1, \"two\");", "<host>").unwrap_err();
    assert_eq!(err.kind, ErrorKind::RuntimeError);
    assert!(err.message.contains("add expects numbers"));
}

#[test]
fn natives_can_call_back_into_scripts() {
    let mut vm = Vm::with_captured_output();
    vm.define_native("apply", Some(2), apply);
    let source = r#"
        fun square(n) { return n * n; }
        print apply(square, 9);
        print apply(fun (s) { return s + "!"; }, "hey");
    "#;
    vm.run_source(source, "<host>").unwrap();
    assert_eq!(vm.take_output(), lines(&["81", "hey!"]));
}

#[test]
fn host_calls_script_functions() {
    let mut vm = Vm::with_captured_output();
    vm.run_source("fun greet(name) { return \"hello \" + name; }", "<host>")
        .unwrap();

    let greet = vm.get_global("greet").unwrap();
    let result = vm.call_function(greet, &[Value::from("host")]).unwrap();
    assert_eq!(result, Value::from("hello host"));
}

#[test]
fn host_constructs_instances() {
    let mut vm = Vm::with_captured_output();
    let source = r#"
        class Counter {
            var step = 5;
            init(start) { this.value = start; }
            next() {
                this.value = this.value + this.step;
                return this.value;
            }
        }
    "#;
    vm.run_source(source, "<host>").unwrap();

    let class = vm.get_global("Counter").unwrap();
    let counter = vm.call_function(class, &[Value::Number(10.0)]).unwrap();
    assert_eq!(counter.type_name(), "Instance");

    vm.set_global("counter", counter).unwrap();
    vm.run_source("print counter.next(); print counter.next();", "<host>")
        .unwrap();
    assert_eq!(vm.take_output(), lines(&["15", "20"]));
}

#[test]
fn host_call_errors_leave_the_vm_usable() {
    let mut vm = Vm::with_captured_output();
    vm.run_source("fun half(n) { return n / 2; }", "<host>").unwrap();
    let half = vm.get_global("half").unwrap();

    let err = vm.call_function(half.clone(), &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ArgumentError);

    let err = vm.call_function(half.clone(), &[Value::Null]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeError);

    let ok = vm.call_function(half, &[Value::Number(9.0)]).unwrap();
    assert_eq!(ok, Value::Number(4.5));
}

#[test]
fn globals_round_trip_through_the_host() {
    let mut vm = Vm::with_captured_output();
    vm.set_global("limit", Value::Number(3.0)).unwrap();
    vm.run_source("var doubled = limit * 2; limit = \"changed\";", "<host>")
        .unwrap();

    assert_eq!(vm.get_global("doubled"), Some(Value::Number(6.0)));
    assert_eq!(vm.get_global("limit"), Some(Value::from("changed")));
    assert_eq!(vm.get_global("nope"), None);
}

#[test]
fn vms_are_isolated() {
    let mut first = Vm::with_captured_output();
    let mut second = Vm::with_captured_output();
    first.run_source("var shared = 1;", "<a>").unwrap();

    let err = second.run_source("print shared;", "<b>").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NameError);
}

#[test]
fn interpret_runs_precompiled_programs() {
    let program = compile("print \"compiled once\";", "<host>").unwrap();
    let mut vm = Vm::with_captured_output();
    vm.interpret(program.function.clone()).unwrap();
    vm.interpret(program.function).unwrap();
    assert_eq!(vm.take_output(), lines(&["compiled once", "compiled once"]));
}

#[test]
fn default_natives() {
    let mut vm = Vm::with_captured_output();
    vm.run_source("var t = clock(); print t > 0; print str(null) + str(true);", "<host>")
        .unwrap();
    assert_eq!(vm.take_output(), lines(&["true", "nulltrue"]));
}

#[test]
fn shared_programs_resolve_globals_per_vm() {
    let program = compile("print x; x = x + \"!\";", "<host>").unwrap();

    // Same globals, defined in opposite orders, so the slots differ
    let mut first = Vm::with_captured_output();
    first.set_global("a", Value::Number(1.0)).unwrap();
    first.set_global("x", Value::from("first")).unwrap();
    first.interpret(program.function.clone()).unwrap();

    let mut second = Vm::with_captured_output();
    second.set_global("x", Value::from("second")).unwrap();
    second.set_global("a", Value::Number(1.0)).unwrap();
    second.interpret(program.function.clone()).unwrap();

    assert_eq!(first.take_output(), lines(&["first"]));
    assert_eq!(second.take_output(), lines(&["second"]));
    assert_eq!(first.get_global("x"), Some(Value::from("first!")));
    assert_eq!(second.get_global("x"), Some(Value::from("second!")));
    assert_eq!(first.get_global("a"), Some(Value::Number(1.0)));
    assert_eq!(second.get_global("a"), Some(Value::Number(1.0)));

    // Back on the first VM, the site now cached by the second still resolves
    first.interpret(program.function).unwrap();
    assert_eq!(first.take_output(), lines(&["first!"]));
}
