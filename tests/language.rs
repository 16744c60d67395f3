// End-to-end behavior of Quill programs

mod common;
use common::*;

#[test]
fn negated_grouping() {
    assert_prints("print -(0.5 + -1) * 2;", &["1"]);
}

#[test]
fn recursive_fib() {
    let source = r#"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(20);
    "#;
    assert_prints(source, &["6765"]);
}

#[test]
fn super_call_runs_base_before_derived() {
    let source = r#"
        class Doughnut {
            cook() {
                print "Fry until golden brown.";
            }
        }

        class BostonCream < Doughnut {
            cook() {
                super.cook();
                print "Pipe full of custard and coat with chocolate.";
            }
        }

        BostonCream().cook();
    "#;
    assert_prints(
        source,
        &[
            "Fry until golden brown.",
            "Pipe full of custard and coat with chocolate.",
        ],
    );
}

#[test]
fn super_dispatches_through_overrides() {
    let source = r#"
        class A {
            method() { print "A method"; }
            describe() { this.method(); }
        }
        class B < A {
            method() { print "B method"; }
            test() { super.describe(); }
        }
        B().test();
    "#;
    assert_prints(source, &["B method"]);
}

#[test]
fn super_method_can_be_stored() {
    let source = r#"
        class Base {
            greet(name) { return "hi " + name; }
        }
        class Derived < Base {
            greeter() { return super.greet; }
        }
        var f = Derived().greeter();
        print f("ana");
    "#;
    assert_prints(source, &["hi ana"]);
}

#[test]
fn unused_local_warns_but_runs() {
    let source = r#"
        {
            var unused = 1;
            print "still runs";
        }
    "#;
    let program = quill_core::compile(source, "<test>").unwrap();
    assert_eq!(program.warnings.len(), 1);
    assert!(program.warnings[0].message.contains("'unused'"));
    assert_prints(source, &["still runs"]);
}

#[test]
fn for_loop_break() {
    let source = "for (i = 0; i < 10; i = i + 1) { if (i > 3) break; print i; }";
    assert_prints(source, &["0", "1", "2", "3"]);
}

#[test]
fn continue_skips_to_increment() {
    let source = r#"
        for (var i = 0; i < 6; i = i + 1) {
            if (i % 2 == 0) continue;
            print i;
        }
    "#;
    assert_prints(source, &["1", "3", "5"]);
}

#[test]
fn break_pops_block_locals() {
    let source = r#"
        var n = 0;
        while (true) {
            var step = 2;
            n = n + step;
            if (n >= 6) break;
        }
        var after = "ok";
        print n;
        print after;
    "#;
    assert_prints(source, &["6", "ok"]);
}

#[test]
fn infinite_loop_with_break() {
    let source = r#"
        var i = 0;
        loop {
            i = i + 1;
            if (i == 3) break;
        }
        print i;
    "#;
    assert_prints(source, &["3"]);
}

#[test]
fn counters_keep_independent_state() {
    let source = r#"
        fun makeCounter() {
            var count = 0;
            fun increment() {
                count = count + 1;
                return count;
            }
            return increment;
        }
        var a = makeCounter();
        var b = makeCounter();
        print a();
        print a();
        print b();
        print a();
    "#;
    assert_prints(source, &["1", "2", "1", "3"]);
}

#[test]
fn closures_share_a_captured_variable() {
    let source = r#"
        var get;
        var set;
        fun pair() {
            var value = "initial";
            fun g() { return value; }
            fun s(v) { value = v; }
            get = g;
            set = s;
        }
        pair();
        print get();
        set("updated");
        print get();
    "#;
    assert_prints(source, &["initial", "updated"]);
}

#[test]
fn nested_closures_capture_through_levels() {
    let source = r#"
        fun outer() {
            var x = "outer";
            fun middle() {
                fun inner() { return x; }
                return inner;
            }
            return middle;
        }
        print outer()()();
    "#;
    assert_prints(source, &["outer"]);
}

#[test]
fn loop_closures_capture_each_iteration() {
    let source = r#"
        var first;
        var second;
        for (var i = 0; i < 2; i = i + 1) {
            var j = i;
            fun show() { return j; }
            if (first == null) first = show; else second = show;
        }
        print first();
        print second();
    "#;
    assert_prints(source, &["0", "1"]);
}

#[test]
fn lambdas_are_values() {
    let source = r#"
        var twice = fun (f, x) { return f(f(x)); };
        print twice(fun (n) { return n * 3; }, 2);
    "#;
    assert_prints(source, &["18"]);
}

// Rebinding `A` makes a new class; the copy itself is covered by
// `Class::inherit_from`'s unit tests
#[test]
fn redefining_a_superclass_leaves_subclass_unchanged() {
    let source = r#"
        class A {
            first() { return "A.first"; }
        }
        class B < A {}
        var b = B();

        class A {
            first() { return "new A.first"; }
            second() { return "A.second"; }
        }

        print b.first();
        print B().first();
        print A().second();
    "#;
    assert_prints(source, &["A.first", "A.first", "A.second"]);

    let err = run_err(&format!("{}\nprint b.second();", source));
    assert_eq!(err.kind, ErrorKind::AttributeError);
}

#[test]
fn field_chain_runs_before_init() {
    let source = r#"
        class Pair {
            var a = 1;
            var b = 2;
            init() {
                print this.a;
                this.b = this.a + 10;
            }
        }
        var p = Pair();
        print p.b;
    "#;
    assert_prints(source, &["1", "11"]);
}

#[test]
fn field_chains_run_base_first() {
    let source = r#"
        class Base {
            var trail = "base";
        }
        class Derived < Base {
            var extra = 0;
            init() { this.trail = this.trail + "+init"; }
        }
        print Derived().trail;
        print Derived().extra;
    "#;
    assert_prints(source, &["base+init", "0"]);
}

#[test]
fn declared_fields_start_null() {
    let source = r#"
        class Box {
            var content;
        }
        print Box().content;
    "#;
    assert_prints(source, &["null"]);
}

#[test]
fn initializer_returns_instance() {
    let source = r#"
        class Point {
            init(x, y) {
                this.x = x;
                this.y = y;
                return;
            }
            sum() { return this.x + this.y; }
        }
        var p = Point(3, 4);
        print p.sum();
        print p.init(1, 1) == p;
        print p.sum();
    "#;
    assert_prints(source, &["7", "true", "2"]);
}

#[test]
fn bound_methods_keep_receiver() {
    let source = r#"
        class Greeter {
            init(name) { this.name = name; }
            greet() { return "hello " + this.name; }
        }
        var g = Greeter("bob").greet;
        print g();
    "#;
    assert_prints(source, &["hello bob"]);
}

#[test]
fn field_shadows_method_on_invoke() {
    let source = r#"
        class R {
            f() { return "method"; }
        }
        var r = R();
        fun call(o) { return o.f(); }
        print call(r);
        r.f = fun () { return "field"; };
        print call(r);
        print call(R());
    "#;
    assert_prints(source, &["method", "field", "method"]);
}

#[test]
fn cached_sites_follow_receiver_shape() {
    let source = r#"
        class P {
            init() { this.x = 1; }
            get() { return this.x; }
        }
        class Q {
            init() { this.y = 0; this.x = 2; }
            get() { return this.x + 10; }
        }
        fun read(o) { return o.x; }
        fun call(o) { return o.get(); }
        fun write(o, v) { o.x = v; return o.x; }

        for (var i = 0; i < 3; i = i + 1) {
            print read(P());
            print read(Q());
            print call(P());
            print call(Q());
            print write(P(), i);
            print write(Q(), i + 100);
        }
    "#;
    let expected: Vec<String> = (0..3)
        .flat_map(|i| {
            vec![
                "1".to_string(),
                "2".to_string(),
                "1".to_string(),
                "12".to_string(),
                i.to_string(),
                (i + 100).to_string(),
            ]
        })
        .collect();
    pretty_assertions::assert_eq!(run_ok(source), expected);
}

#[test]
fn global_caches_see_updates() {
    let source = r#"
        var total = 0;
        fun add(n) { total = total + n; }
        for (var i = 1; i <= 4; i = i + 1) add(i);
        print total;
        total = "reset";
        print total;
    "#;
    assert_prints(source, &["10", "reset"]);
}

#[test]
fn assignment_to_undefined_global_defines_it() {
    assert_prints("fresh = 5; print fresh;", &["5"]);
}

#[test]
fn logical_operators_short_circuit() {
    let source = r#"
        fun boom() { throw "evaluated"; }
        print false and boom();
        print true or boom();
        print null or "fallback";
        print 1 and 2;
    "#;
    assert_prints(source, &["false", "true", "fallback", "2"]);
}

#[test]
fn strings_and_equality() {
    let source = r#"
        var s = "con" + "cat";
        print s;
        print s == "concat";
        print 1 == "1";
        print null == null;
        print !"";
        print str(3) + "!";
    "#;
    assert_prints(source, &["concat", "true", "false", "true", "true", "3!"]);
}

#[test]
fn numbers_format_like_integers_when_whole() {
    assert_prints("print 10 / 4; print 10 / 5; print 7 % 3; print 300 + 0.5;", &["2.5", "2", "1", "300.5"]);
}

#[test]
fn string_escapes() {
    assert_prints(r#"print "tab\there";"#, &["tab\there"]);
}

#[test]
fn if_else_branches() {
    let source = r#"
        fun sign(n) {
            if (n < 0) return "negative";
            else if (n == 0) return "zero";
            else return "positive";
        }
        print sign(-3);
        print sign(0);
        print sign(9);
    "#;
    assert_prints(source, &["negative", "zero", "positive"]);
}
