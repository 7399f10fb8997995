// File: src/builtins.rs
//
// The native function library (spec.md §4.H "Native functions"). Each
// function here matches `object::NativeFn`'s `Result<Value, String>`
// calling convention -- Rust-idiomatic in place of the original's
// `args[-1]`-write-and-bool-return -- and is registered into the VM's
// globals table the same GC-safe way the original's `defineNative` does:
// name and native both pushed onto the stack before the table insert, so
// neither can be collected out from under the call.

use crate::object::Obj;
use crate::value::Value;
use crate::vm::Vm;

pub fn define_natives(vm: &mut Vm) {
    vm.define_native("clock", clock_native);
    vm.define_native("error", error_native);
    vm.define_native("get", get_native);
    vm.define_native("delete", delete_native);
    vm.define_native("is", is_native);
}

/// Seconds since the VM was constructed. Not wall-clock time: a monotonic
/// counter from an arbitrary epoch, matching the original's `clock() /
/// CLOCKS_PER_SEC` (process-relative, not calendar time).
fn clock_native(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.start_time.elapsed().as_secs_f64()))
}

/// Raises a runtime error carrying the given message, or `"Runtime
/// Error"` if called with no (string) argument -- mirrors the original's
/// `errNative`.
fn error_native(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if let Some(Value::Obj(r)) = args.first() {
        if let Obj::Str(s) = vm.heap.get(*r) {
            return Err(s.value.to_string());
        }
    }
    Err("Runtime Error".to_string())
}

/// `get(instance, name)` / `get(instance, name, default)`: reads an
/// instance field dynamically, by name, rather than through `.` syntax.
/// Returns `nil` (two-argument form) or `default` (three-argument form)
/// when the field is absent.
fn get_native(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() != 2 && args.len() != 3 {
        return Err("get() expects 2 or 3 arguments.".to_string());
    }
    let (Value::Obj(instance_ref), Value::Obj(name_ref)) = (args[0], args[1]) else {
        return Err("get() expects an instance and a string field name.".to_string());
    };
    if !matches!(vm.heap.get(instance_ref), Obj::Instance(_)) {
        return Err("get() expects an instance and a string field name.".to_string());
    }
    if !matches!(vm.heap.get(name_ref), Obj::Str(_)) {
        return Err("get() expects an instance and a string field name.".to_string());
    }
    let hash = vm.heap.string_hash(name_ref);
    let instance = vm.heap.get(instance_ref).as_instance().unwrap();
    if let Some(value) = instance.fields.get(name_ref, hash) {
        return Ok(value);
    }
    Ok(if args.len() == 2 { Value::Nil } else { args[2] })
}

/// `delete(instance, name)`: removes an instance field dynamically.
/// Returns whether the field existed.
fn delete_native(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() != 2 {
        return Err("delete() expects 2 arguments.".to_string());
    }
    let (Value::Obj(instance_ref), Value::Obj(name_ref)) = (args[0], args[1]) else {
        return Err("delete() expects an instance and a string field name.".to_string());
    };
    if !matches!(vm.heap.get(instance_ref), Obj::Instance(_)) {
        return Err("delete() expects an instance and a string field name.".to_string());
    }
    if !matches!(vm.heap.get(name_ref), Obj::Str(_)) {
        return Err("delete() expects an instance and a string field name.".to_string());
    }
    let hash = vm.heap.string_hash(name_ref);
    let deleted = vm.heap.get_mut(instance_ref).as_instance_mut().unwrap().fields.delete(name_ref, hash);
    Ok(Value::Bool(deleted))
}

/// `is(instance, class)`: reports whether `instance` was constructed from
/// exactly `class` (no inheritance in this language, so no ancestor walk).
fn is_native(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() != 2 {
        return Err("is() expects 2 arguments.".to_string());
    }
    let (Value::Obj(instance_ref), Value::Obj(class_ref)) = (args[0], args[1]) else {
        return Err("is() expects an instance and a class.".to_string());
    };
    let Obj::Instance(instance) = vm.heap.get(instance_ref) else {
        return Err("is() expects an instance and a class.".to_string());
    };
    if !matches!(vm.heap.get(class_ref), Obj::Class(_)) {
        return Err("is() expects an instance and a class.".to_string());
    }
    Ok(Value::Bool(instance.class == class_ref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::InterpretError;

    fn run(source: &str) -> Vm {
        let mut vm = Vm::new();
        match vm.interpret(source) {
            Ok(()) => vm,
            Err(InterpretError::Compile(errs)) => panic!(
                "compile error: {:?}",
                errs.iter().map(|e| e.to_string()).collect::<Vec<_>>()
            ),
            Err(InterpretError::Runtime(e)) => panic!("runtime error: {e}"),
        }
    }

    #[test]
    fn clock_returns_a_nonnegative_number() {
        run("var t = clock(); if (t < 0) { error(\"negative clock\"); }");
    }

    #[test]
    fn get_and_delete_round_trip_through_an_instance_field() {
        run(
            r#"
            class Box {}
            var b = Box();
            b.value = 10;
            if (get(b, "value") != 10) { error("get failed"); }
            delete(b, "value");
            if (get(b, "value", "gone") != "gone") { error("delete failed"); }
            "#,
        );
    }

    #[test]
    fn is_checks_exact_class_identity() {
        run(
            r#"
            class A {}
            class B {}
            var a = A();
            if (!is(a, A)) { error("expected is(a, A)"); }
            if (is(a, B)) { error("expected !is(a, B)"); }
            "#,
        );
    }

    #[test]
    fn error_native_raises_with_supplied_message() {
        let mut vm = Vm::new();
        match vm.interpret("error(\"boom\");") {
            Err(InterpretError::Runtime(e)) => assert!(e.message.contains("boom")),
            _ => panic!("expected a runtime error"),
        }
    }
}
