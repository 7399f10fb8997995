// File: src/gc.rs
//
// Arena-backed heap plus tri-color mark-sweep collector (spec.md §4.G, §9
// "Cyclic/shared references" design note). Rather than an intrusive
// next-pointer list of raw-pointer objects, every object lives in a slot of
// a `Vec`, addressed by a stable `ObjRef` handle (index + generation). This
// is exactly the alternative the design notes call out for a
// strict-ownership systems language: "represent every object by a stable
// handle (index into a typed arena)". Sweep walks the arena instead of an
// intrusive list; freed slots are recycled through a free list instead of
// calling back into a system allocator, which is the same "reallocate
// primitive" role spec.md §1 treats as an external collaborator.

use crate::object::{fnv1a_hash, Obj, StringObj};
use crate::value::Value;
use crate::table::Table;

/// Stable handle to a heap object. The generation counter distinguishes a
/// handle into a freed-then-recycled slot from one into the object it used
/// to point at; under a correct mark phase no live handle ever observes a
/// generation mismatch, so a mismatch here indicates a GC-rooting bug
/// rather than a reachable state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

struct Slot {
    data: Option<Obj>,
    marked: bool,
    generation: u32,
}

/// Growth factor applied to `bytesAllocated` to compute the next collection
/// threshold (spec.md §4.G: "1.5x or 2x, a fixed design constant").
const GC_GROW_FACTOR: usize = 2;
const INITIAL_NEXT_GC: usize = 512 * 1024;

pub trait Roots {
    /// Push every root value/object directly reachable from this provider
    /// onto the heap's gray worklist.
    fn mark_roots(&self, heap: &mut Heap);
}

pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    gray: Vec<ObjRef>,
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    pub stress_gc: bool,
    pub log_gc: bool,
    collections_run: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_gc: false,
            log_gc: false,
            collections_run: 0,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn collections_run(&self) -> usize {
        self.collections_run
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        let slot = &self.slots[r.index as usize];
        assert_eq!(slot.generation, r.generation, "stale ObjRef dereferenced (GC bug)");
        slot.data.as_ref().expect("stale ObjRef dereferenced (GC bug)")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        let slot = &mut self.slots[r.index as usize];
        assert_eq!(slot.generation, r.generation, "stale ObjRef dereferenced (GC bug)");
        slot.data.as_mut().expect("stale ObjRef dereferenced (GC bug)")
    }

    /// Mutates an already-allocated object and reconciles `bytes_allocated`
    /// for any change in its `heap_size()`. Every owned buffer that grows in
    /// place after its object was allocated -- a `FunctionObj`'s `Chunk`
    /// gaining code/constants while its body compiles, a `ClassObj`'s method
    /// table or an `InstanceObj`'s field table growing past its load factor
    /// -- must go through this rather than a bare `get_mut`, or
    /// `bytes_allocated` stops matching the sum of live sizes (spec.md §8).
    pub fn with_object_mut<R>(&mut self, r: ObjRef, f: impl FnOnce(&mut Obj) -> R) -> R {
        let before = self.get(r).heap_size();
        let result = f(self.get_mut(r));
        let after = self.get(r).heap_size();
        if after >= before {
            self.bytes_allocated += after - before;
        } else {
            self.bytes_allocated -= before - after;
        }
        result
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.slots[r.index as usize].marked
    }

    /// Allocates a fresh object, running a collection first if the
    /// allocator is over threshold (or in stress mode) -- collection always
    /// completes before the new object exists, so it is never at risk of
    /// being swept out from under its own allocation (spec.md §4.G, §5).
    pub fn alloc(&mut self, data: Obj, roots: &impl Roots) -> ObjRef {
        let size = data.heap_size();
        if self.stress_gc || self.bytes_allocated + size > self.next_gc {
            self.collect(roots);
        }
        self.bytes_allocated += size;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.data = Some(data);
            slot.marked = false;
            ObjRef { index, generation: slot.generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { data: Some(data), marked: false, generation: 0 });
            ObjRef { index, generation: 0 }
        }
    }

    /// `copyString`: intern a byte sequence, allocating a new `StringObj`
    /// only if an equal one isn't already interned.
    pub fn intern(&mut self, bytes: &[u8], roots: &impl Roots) -> ObjRef {
        let hash = fnv1a_hash(bytes);
        if let Some(existing) = self.strings.find_string(self, bytes, hash) {
            return existing;
        }
        let value = std::str::from_utf8(bytes)
            .expect("the language only ever interns valid UTF-8 source text")
            .to_owned()
            .into_boxed_str();
        let r = self.alloc(Obj::Str(StringObj { hash, value }), roots);
        self.strings.set(r, hash, Value::Nil);
        r
    }

    pub fn intern_str(&mut self, s: &str) -> (ObjRef, u32) {
        struct NoRoots;
        impl Roots for NoRoots {
            fn mark_roots(&self, _heap: &mut Heap) {}
        }
        let r = self.intern(s.as_bytes(), &NoRoots);
        (r, self.get(r).as_string().unwrap().hash)
    }

    /// `concatStrings`: builds the concatenation, then interns it.
    pub fn concat_strings(&mut self, a: ObjRef, b: ObjRef, roots: &impl Roots) -> ObjRef {
        let mut bytes = Vec::with_capacity(
            self.get(a).as_string().unwrap().as_bytes().len()
                + self.get(b).as_string().unwrap().as_bytes().len(),
        );
        bytes.extend_from_slice(self.get(a).as_string().unwrap().as_bytes());
        bytes.extend_from_slice(self.get(b).as_string().unwrap().as_bytes());
        self.intern(&bytes, roots)
    }

    pub fn string_hash(&self, r: ObjRef) -> u32 {
        self.get(r).as_string().expect("expected a string handle").hash
    }

    // --- marking -----------------------------------------------------

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = &mut self.slots[r.index as usize];
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
    }

    pub fn mark_table(&mut self, table: &Table) {
        let entries: Vec<(ObjRef, Value)> = table.iter().collect();
        for (k, v) in entries {
            self.mark_object(k);
            self.mark_value(v);
        }
    }

    /// Marks everything a gray object directly references, per the referent
    /// table in spec.md §4.G. Referents are collected into owned buffers
    /// first (an immutable view into `self`) so the marking pass proper
    /// (which mutates `self`) never aliases a live borrow of `self.slots`.
    fn blacken(&mut self, r: ObjRef) {
        let mut objs: Vec<ObjRef> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let mut table: Option<Table> = None;

        match self.get(r) {
            Obj::Str(_) | Obj::Native(_) => {}
            Obj::Upvalue(u) => {
                if let crate::object::UpvalueState::Closed(v) = u.state {
                    values.push(v);
                }
            }
            Obj::Function(f) => {
                objs.extend(f.name);
                values.extend(f.chunk.constants.iter().copied());
            }
            Obj::Closure(c) => {
                objs.push(c.function);
                objs.extend(c.upvalues.iter().copied());
            }
            Obj::Class(c) => {
                objs.push(c.name);
                table = Some(c.methods.clone());
            }
            Obj::Instance(i) => {
                objs.push(i.class);
                table = Some(i.fields.clone());
            }
            Obj::BoundMethod(b) => {
                objs.push(b.method);
                values.push(b.receiver);
            }
        }

        for o in objs {
            self.mark_object(o);
        }
        for v in values {
            self.mark_value(v);
        }
        if let Some(t) = table {
            self.mark_table(&t);
        }
    }

    pub fn collect(&mut self, roots: &impl Roots) {
        if self.log_gc {
            eprintln!("-- gc begin (bytes_allocated={})", self.bytes_allocated);
        }

        roots.mark_roots(self);

        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }

        self.strings.remove_white(self);

        self.sweep();

        self.next_gc = self.bytes_allocated * GC_GROW_FACTOR;
        if self.next_gc < INITIAL_NEXT_GC {
            self.next_gc = INITIAL_NEXT_GC;
        }
        self.collections_run += 1;

        if self.log_gc {
            eprintln!(
                "-- gc end (bytes_allocated={}, next_gc={})",
                self.bytes_allocated, self.next_gc
            );
        }
    }

    fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.data.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                let size = slot.data.as_ref().unwrap().heap_size();
                slot.data = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.bytes_allocated -= size;
                self.free.push(index as u32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoots;
    impl Roots for NoRoots {
        fn mark_roots(&self, _heap: &mut Heap) {}
    }

    #[test]
    fn interning_the_same_bytes_twice_returns_the_same_handle() {
        let mut heap = Heap::new();
        let (a, _) = heap.intern_str("hello");
        let (b, _) = heap.intern_str("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn collect_with_no_roots_frees_every_interned_string() {
        let mut heap = Heap::new();
        heap.intern_str("orphan");
        assert!(heap.bytes_allocated() > 0);
        heap.collect(&NoRoots);
        assert_eq!(heap.bytes_allocated(), 0);
    }

    struct KeepOne(ObjRef);
    impl Roots for KeepOne {
        fn mark_roots(&self, heap: &mut Heap) {
            heap.mark_object(self.0);
        }
    }

    #[test]
    fn collect_keeps_a_rooted_string_alive() {
        let mut heap = Heap::new();
        let (kept, _) = heap.intern_str("kept");
        heap.intern_str("dropped");
        let roots = KeepOne(kept);
        heap.collect(&roots);
        assert_eq!(heap.get(kept).as_string().unwrap().value.as_ref(), "kept");
    }

    #[test]
    fn stress_gc_runs_a_collection_on_every_allocation() {
        let mut heap = Heap::new();
        heap.stress_gc = true;
        heap.intern_str("a");
        heap.intern_str("b");
        assert!(heap.collections_run() >= 1);
    }
}
