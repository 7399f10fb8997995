// File: src/object.rs
//
// Heap object variants (spec.md §3 "Heap object"). Every variant is reached
// through a `gc::ObjRef` handle rather than a raw pointer; the arena in
// `gc::Heap` plays the role of the intrusive "next object" list, and each
// slot's occupancy is the mark bit's complement after a sweep.

use std::fmt;

use crate::chunk::Chunk;
use crate::gc::{Heap, ObjRef};
use crate::table::Table;
use crate::value::Value;

/// A native (Rust-implemented) function. Mirrors clox's `NativeFn` calling
/// convention but returns a `Result` instead of writing through `args[-1]`,
/// which is the idiomatic Rust shape for the same "success value or
/// error string" contract (spec.md §4.H).
pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> Result<Value, String>;

pub enum Obj {
    Str(StringObj),
    Upvalue(UpvalueObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Native(NativeObj),
}

pub struct StringObj {
    pub hash: u32,
    pub value: Box<str>,
}

impl StringObj {
    pub fn as_bytes(&self) -> &[u8] {
        self.value.as_bytes()
    }
}

pub enum UpvalueState {
    /// Points at a live stack slot, by absolute stack index.
    Open(usize),
    /// Owns its value after the enclosing frame returned.
    Closed(Value),
}

pub struct UpvalueObj {
    pub state: UpvalueState,
}

pub struct FunctionObj {
    pub name: Option<ObjRef>, // StringObj, None for the top-level script
    pub arity: u8,
    pub upvalue_count: u32,
    pub chunk: Chunk,
}

pub struct ClosureObj {
    pub function: ObjRef, // FunctionObj
    pub upvalues: Vec<ObjRef>, // UpvalueObj
}

pub struct ClassObj {
    pub name: ObjRef, // StringObj
    pub methods: Table,
}

pub struct InstanceObj {
    pub class: ObjRef, // ClassObj
    pub fields: Table,
}

pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef, // ClosureObj
}

pub struct NativeObj {
    pub name: ObjRef, // StringObj
    pub function: NativeFn,
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::Str(_) => "string",
            Obj::Upvalue(_) => "upvalue",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "closure",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
            Obj::Native(_) => "native function",
        }
    }

    pub fn as_string(&self) -> Option<&StringObj> {
        match self {
            Obj::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionObj> {
        match self {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ClosureObj> {
        match self {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ClassObj> {
        match self {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceObj> {
        match self {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&BoundMethodObj> {
        match self {
            Obj::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&NativeObj> {
        match self {
            Obj::Native(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut FunctionObj> {
        match self {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure_mut(&mut self) -> Option<&mut ClosureObj> {
        match self {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self) -> Option<&mut ClassObj> {
        match self {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut InstanceObj> {
        match self {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&UpvalueObj> {
        match self {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_upvalue_mut(&mut self) -> Option<&mut UpvalueObj> {
        match self {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    /// Approximate retained size in bytes, for GC accounting (spec.md §4.G
    /// `bytesAllocated`). Does not need to be exact, only monotonic with the
    /// object's real footprint, since it only drives collection timing.
    pub fn heap_size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::Str(s) => s.value.len(),
            Obj::Upvalue(_) => 0,
            Obj::Function(f) => {
                f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            Obj::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
            Obj::Class(c) => c.methods.capacity() * std::mem::size_of::<(ObjRef, Value)>(),
            Obj::Instance(i) => i.fields.capacity() * std::mem::size_of::<(ObjRef, Value)>(),
            Obj::BoundMethod(_) => 0,
            Obj::Native(_) => 0,
        }
    }

    /// Print representation used by `OP_PRINT` and string interpolation of
    /// values (spec.md §4.A).
    pub fn fmt_value(&self, heap: &Heap, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obj::Str(s) => write!(f, "{}", s.value),
            Obj::Function(fun) => match fun.name {
                None => write!(f, "<script>"),
                Some(name) => write!(f, "<fn {}>", heap.get(name).as_string().unwrap().value),
            },
            Obj::Closure(c) => {
                let fun = heap.get(c.function).as_function().unwrap();
                match fun.name {
                    None => write!(f, "<script>"),
                    Some(name) => write!(f, "<fn {}>", heap.get(name).as_string().unwrap().value),
                }
            }
            Obj::Upvalue(_) => write!(f, "upvalue"),
            Obj::Class(c) => write!(f, "{}", heap.get(c.name).as_string().unwrap().value),
            Obj::Instance(i) => {
                let class = heap.get(i.class).as_class().unwrap();
                write!(f, "<{} instance>", heap.get(class.name).as_string().unwrap().value)
            }
            Obj::BoundMethod(b) => {
                let closure = heap.get(b.method).as_closure().unwrap();
                let fun = heap.get(closure.function).as_function().unwrap();
                match fun.name {
                    None => write!(f, "<script>"),
                    Some(name) => write!(f, "<fn {}>", heap.get(name).as_string().unwrap().value),
                }
            }
            Obj::Native(_) => write!(f, "<native fn>"),
        }
    }
}

/// FNV-1a, matching the original's `hashString` bit-for-bit (spec.md §4.C).
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_known_vector() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(fnv1a_hash(b""), 2166136261);
        // Known FNV-1a-32 of "a".
        assert_eq!(fnv1a_hash(b"a"), 0xe40c292c);
    }
}
