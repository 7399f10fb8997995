// End-to-end tests: compile and run a whole program, assert on its
// `print`ed output. Each scenario here also passes under GC stress
// (`gc_stress_does_not_change_any_scenarios_output` reruns the whole table
// with a collection forced before every allocation).

use lumen::vm::{InterpretError, Vm};

fn run(source: &str) -> String {
    let mut vm = Vm::new_capturing();
    match vm.interpret(source) {
        Ok(()) => vm.take_output(),
        Err(InterpretError::Compile(errs)) => panic!(
            "unexpected compile error(s): {:?}",
            errs.iter().map(|e| e.to_string()).collect::<Vec<_>>()
        ),
        Err(InterpretError::Runtime(e)) => panic!("unexpected runtime error: {e}"),
    }
}

fn run_stress(source: &str) -> String {
    let mut vm = Vm::new_capturing();
    vm.heap.stress_gc = true;
    match vm.interpret(source) {
        Ok(()) => vm.take_output(),
        Err(InterpretError::Compile(errs)) => panic!(
            "unexpected compile error(s) under gc stress: {:?}",
            errs.iter().map(|e| e.to_string()).collect::<Vec<_>>()
        ),
        Err(InterpretError::Runtime(e)) => panic!("unexpected runtime error under gc stress: {e}"),
    }
}

fn run_err(source: &str) -> InterpretError {
    let mut vm = Vm::new_capturing();
    vm.interpret(source).expect_err("expected the program to fail")
}

/// spec.md §8 scenario 1.
#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
}

/// spec.md §8 scenario 2.
#[test]
fn string_concatenation() {
    assert_eq!(run(r#"var a = "hi"; var b = " there"; print a + b;"#), "hi there\n");
}

/// spec.md §8 scenario 3.
#[test]
fn recursive_fibonacci() {
    assert_eq!(
        run("fun fib(n){ if(n<2) return n; return fib(n-1)+fib(n-2); } print fib(10);"),
        "55\n"
    );
}

/// spec.md §8 scenario 4: closures share one upvalue across calls.
#[test]
fn closures_share_captured_state_across_calls() {
    let out = run(
        r#"
        fun outer(){
            var x=1;
            fun inner(){ x=x+1; return x; }
            return inner;
        }
        var f = outer();
        print f();
        print f();
        print f();
        "#,
    );
    assert_eq!(out, "2\n3\n4\n");
}

/// spec.md §8 scenario 5: class construction, `init`, method call, `this`.
#[test]
fn class_construction_and_method_call() {
    let out = run(
        r#"
        class Point {
            init(x,y){ this.x=x; this.y=y; }
            sum(){ return this.x+this.y; }
        }
        var p=Point(3,4);
        print p.sum();
        "#,
    );
    assert_eq!(out, "7\n");
}

/// spec.md §8 scenario 6.
#[test]
fn for_loop_builds_a_string() {
    assert_eq!(run(r#"var s=""; for(var i=0;i<3;i=i+1) s = s + "a"; print s;"#), "aaa\n");
}

#[test]
fn gc_stress_does_not_change_any_scenarios_output() {
    assert_eq!(run_stress("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run_stress(r#"var a = "hi"; var b = " there"; print a + b;"#), "hi there\n");
    assert_eq!(
        run_stress("fun fib(n){ if(n<2) return n; return fib(n-1)+fib(n-2); } print fib(10);"),
        "55\n"
    );
    assert_eq!(
        run_stress(
            r#"
            fun outer(){ var x=1; fun inner(){ x=x+1; return x; } return inner; }
            var f = outer();
            print f();
            print f();
            print f();
            "#
        ),
        "2\n3\n4\n"
    );
    assert_eq!(
        run_stress(
            r#"
            class Point {
                init(x,y){ this.x=x; this.y=y; }
                sum(){ return this.x+this.y; }
            }
            var p=Point(3,4);
            print p.sum();
            "#
        ),
        "7\n"
    );
    assert_eq!(
        run_stress(r#"var s=""; for(var i=0;i<3;i=i+1) s = s + "a"; print s;"#),
        "aaa\n"
    );
}

#[test]
fn while_loop_counts_down() {
    assert_eq!(
        run("var n = 3; while (n > 0) { print n; n = n - 1; }"),
        "3\n2\n1\n"
    );
}

#[test]
fn if_else_picks_the_matching_branch() {
    assert_eq!(run(r#"if (1 < 2) { print "yes"; } else { print "no"; }"#), "yes\n");
    assert_eq!(run(r#"if (1 > 2) { print "yes"; } else { print "no"; }"#), "no\n");
}

#[test]
fn logical_and_or_short_circuit() {
    let out = run(
        r#"
        fun sideEffect(v) { print v; return v; }
        print false and sideEffect("and-rhs");
        print true or sideEffect("or-rhs");
        "#,
    );
    assert_eq!(out, "false\ntrue\n");
}

#[test]
fn block_scoping_shadows_and_restores_outer_binding() {
    let out = run(
        r#"
        var a = "outer";
        {
            var a = "inner";
            print a;
        }
        print a;
        "#,
    );
    assert_eq!(out, "inner\nouter\n");
}

#[test]
fn nested_closures_each_get_independent_state() {
    let out = run(
        r#"
        fun makeCounter() {
            var count = 0;
            fun increment() { count = count + 1; return count; }
            return increment;
        }
        var a = makeCounter();
        var b = makeCounter();
        print a();
        print a();
        print b();
        "#,
    );
    assert_eq!(out, "1\n2\n1\n");
}

#[test]
fn methods_read_out_as_values_become_bound_methods() {
    let out = run(
        r#"
        class Greeter {
            init(name) { this.name = name; }
            greet() { return "hi " + this.name; }
        }
        var g = Greeter("ada");
        var m = g.greet;
        print m();
        "#,
    );
    assert_eq!(out, "hi ada\n");
}

#[test]
fn fields_can_hold_callables_and_invoke_dispatches_to_them() {
    let out = run(
        r#"
        class Box {}
        var b = Box();
        fun double(x) { return x * 2; }
        b.op = double;
        print b.op(21);
        "#,
    );
    assert_eq!(out, "42\n");
}

#[test]
fn truthiness_treats_only_nil_and_false_as_falsey() {
    let out = run(
        r#"
        if (0) { print "zero-truthy"; } else { print "zero-falsey"; }
        if ("") { print "empty-truthy"; } else { print "empty-falsey"; }
        if (nil) { print "nil-truthy"; } else { print "nil-falsey"; }
        "#,
    );
    assert_eq!(out, "zero-truthy\nempty-truthy\nnil-falsey\n");
}

#[test]
fn numbers_print_without_a_trailing_decimal_when_integral() {
    assert_eq!(run("print 6 / 2;"), "3\n");
    assert_eq!(run("print 7 / 2;"), "3.5\n");
}

#[test]
fn instance_printing_uses_the_class_name() {
    assert_eq!(run("class Widget {} print Widget();"), "<Widget instance>\n");
}

#[test]
fn function_printing_shows_its_name() {
    assert_eq!(run("fun greet() {} print greet;"), "<fn greet>\n");
}

#[test]
fn native_get_delete_and_is_round_trip() {
    let out = run(
        r#"
        class Box {}
        var b = Box();
        b.value = 10;
        print get(b, "value");
        print is(b, Box);
        delete(b, "value");
        print get(b, "value", "gone");
        "#,
    );
    assert_eq!(out, "10\ntrue\ngone\n");
}

// --- compile errors --------------------------------------------------

#[test]
fn top_level_return_is_a_compile_error() {
    match run_err("return 1;") {
        InterpretError::Compile(errs) => assert!(!errs.is_empty()),
        InterpretError::Runtime(_) => panic!("expected a compile error"),
    }
}

#[test]
fn initializer_cannot_return_a_value() {
    match run_err("class C { init() { return 1; } }") {
        InterpretError::Compile(errs) => {
            assert!(errs.iter().any(|e| e.to_string().contains("initializer")));
        }
        InterpretError::Runtime(_) => panic!("expected a compile error"),
    }
}

#[test]
fn a_malformed_program_reports_more_than_one_error() {
    // Two independent missing-semicolon mistakes; panic-mode synchronization
    // should let both surface in one compile rather than stopping at the
    // first (spec.md §4.F "Panic/synchronize").
    match run_err("var a = 1 var b = 2") {
        InterpretError::Compile(errs) => assert!(errs.len() >= 2),
        InterpretError::Runtime(_) => panic!("expected a compile error"),
    }
}

// --- runtime errors ----------------------------------------------------

#[test]
fn undefined_global_read_is_a_runtime_error() {
    match run_err("print nope;") {
        InterpretError::Runtime(e) => assert!(e.message.contains("Undefined variable 'nope'.")),
        InterpretError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn redefining_a_global_is_a_runtime_error() {
    match run_err("var a = 1; var a = 2;") {
        InterpretError::Runtime(e) => assert!(e.message.contains("already exists")),
        InterpretError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn adding_a_number_to_a_string_is_a_runtime_error() {
    match run_err(r#"print 1 + "x";"#) {
        InterpretError::Runtime(e) => assert!(e.message.contains("Operands must be")),
        InterpretError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn calling_a_non_callable_value_is_a_runtime_error() {
    match run_err("var x = 1; x();") {
        InterpretError::Runtime(e) => assert!(e.message.contains("Can only call")),
        InterpretError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn wrong_arity_call_is_a_runtime_error() {
    match run_err("fun f(a, b) { return a + b; } f(1);") {
        InterpretError::Runtime(e) => assert!(e.message.contains("Expected 2 arguments")),
        InterpretError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn deep_recursion_overflows_the_call_stack() {
    match run_err("fun recurse(n) { return recurse(n + 1); } print recurse(0);") {
        InterpretError::Runtime(e) => assert!(e.message.contains("Stack overflow")),
        InterpretError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn runtime_error_trace_names_every_enclosing_frame() {
    match run_err(
        r#"
        fun c() { return 1 + "x"; }
        fun b() { return c(); }
        fun a() { return b(); }
        a();
        "#,
    ) {
        InterpretError::Runtime(e) => {
            assert!(e.trace.iter().any(|f| f.function_name.as_deref() == Some("c")));
            assert!(e.trace.iter().any(|f| f.function_name.as_deref() == Some("b")));
            assert!(e.trace.iter().any(|f| f.function_name.as_deref() == Some("a")));
        }
        InterpretError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn this_outside_a_class_is_a_compile_error() {
    match run_err("print this;") {
        InterpretError::Compile(errs) => {
            assert!(errs.iter().any(|e| e.to_string().contains("this")));
        }
        InterpretError::Runtime(_) => panic!("expected a compile error"),
    }
}
