//! Object heap and mark-and-sweep collector
//!
//! Every allocation funnels through [`Heap::alloc`], which charges the
//! byte counter; whoever owns the heap (the VM) polls
//! [`Heap::should_collect`] at its allocation points and drives a cycle:
//! mark the roots, [`Heap::trace_references`], drop dead intern-table
//! keys, [`Heap::sweep`]. Marking is iterative over an explicit gray
//! worklist, never recursive.
//!
//! The intern table lives here. Its keys are weak: after marking, entries
//! whose key string was not reached are removed so interned strings can
//! die with everything else.

use tracing::debug;

use crate::object::{
    Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjList, ObjNative,
    ObjString, ObjUpvalue, hash_chars,
};
use crate::table::Table;
use crate::value::{ObjRef, Value};

/// Collection threshold before the first cycle.
pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;
/// `next_gc = bytes_allocated * growth` after each sweep.
pub const DEFAULT_GC_GROWTH: usize = 2;

struct SlotEntry {
    obj: Obj,
    /// Bytes charged at allocation; returned exactly on free.
    size: usize,
}

pub struct Heap {
    slots: Vec<Option<SlotEntry>>,
    /// Parallel mark bits, kept separate so tracing can read objects
    /// while coloring their children.
    marked: Vec<bool>,
    free: Vec<usize>,
    gray: Vec<ObjRef>,
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    growth: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap::with_config(DEFAULT_GC_THRESHOLD, DEFAULT_GC_GROWTH)
    }

    pub fn with_config(threshold: usize, growth: usize) -> Self {
        Heap {
            slots: Vec::new(),
            marked: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: threshold,
            growth: growth.max(2),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// Count of live objects, for diagnostics and tests.
    pub fn object_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// The allocation funnel. Freed slots are reused before the slot
    /// vector grows.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj.heap_size();
        self.bytes_allocated += size;
        let entry = SlotEntry { obj, size };
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(entry);
            self.marked[index] = false;
            ObjRef(index as u32)
        } else {
            self.slots.push(Some(entry));
            self.marked.push(false);
            ObjRef((self.slots.len() - 1) as u32)
        }
    }

    /// True when allocations have outrun the threshold and the owner
    /// should run a collection.
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    // ----- interning -----

    /// Intern a string given as text. Returns the existing handle when an
    /// equal string is already live.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        self.intern_chars(text.chars().collect())
    }

    pub fn intern_chars(&mut self, chars: Vec<char>) -> ObjRef {
        let hash = hash_chars(&chars);
        let slots = &self.slots;
        let found = self.strings.find_string(hash, |r| {
            match &slots[r.index()] {
                Some(SlotEntry {
                    obj: Obj::String(s),
                    ..
                }) => *s.chars == chars[..],
                _ => false,
            }
        });
        if let Some(existing) = found {
            return existing;
        }
        let r = self.alloc(Obj::String(ObjString::new(chars)));
        self.strings.set(r, hash, Value::Nil);
        r
    }

    /// Look up an already-interned string without allocating.
    pub fn find_interned(&self, text: &str) -> Option<ObjRef> {
        let chars: Vec<char> = text.chars().collect();
        let hash = hash_chars(&chars);
        let slots = &self.slots;
        self.strings.find_string(hash, |r| match &slots[r.index()] {
            Some(SlotEntry {
                obj: Obj::String(s),
                ..
            }) => *s.chars == chars[..],
            _ => false,
        })
    }

    // ----- accessors -----

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.index()] {
            Some(entry) => &entry.obj,
            None => unreachable!("dangling object handle"),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.index()] {
            Some(entry) => &mut entry.obj,
            None => unreachable!("dangling object handle"),
        }
    }

    pub fn string(&self, r: ObjRef) -> &ObjString {
        match self.get(r) {
            Obj::String(s) => s,
            _ => unreachable!("handle is not a string"),
        }
    }

    pub fn str_hash(&self, r: ObjRef) -> u32 {
        self.string(r).hash
    }

    pub fn list(&self, r: ObjRef) -> &ObjList {
        match self.get(r) {
            Obj::List(l) => l,
            _ => unreachable!("handle is not a list"),
        }
    }

    pub fn list_mut(&mut self, r: ObjRef) -> &mut ObjList {
        match self.get_mut(r) {
            Obj::List(l) => l,
            _ => unreachable!("handle is not a list"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &ObjFunction {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => unreachable!("handle is not a function"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &ObjClosure {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("handle is not a closure"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut ObjClosure {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("handle is not a closure"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("handle is not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("handle is not an upvalue"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ObjClass {
        match self.get(r) {
            Obj::Class(c) => c,
            _ => unreachable!("handle is not a class"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ObjClass {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => unreachable!("handle is not a class"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &ObjInstance {
        match self.get(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("handle is not an instance"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut ObjInstance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("handle is not an instance"),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &ObjBoundMethod {
        match self.get(r) {
            Obj::BoundMethod(b) => b,
            _ => unreachable!("handle is not a bound method"),
        }
    }

    pub fn native(&self, r: ObjRef) -> &ObjNative {
        match self.get(r) {
            Obj::Native(n) => n,
            _ => unreachable!("handle is not a native"),
        }
    }

    /// String handle behind a value, if the value is a string.
    pub fn as_string_ref(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.get(r), Obj::String(_)) => Some(r),
            _ => None,
        }
    }

    pub fn as_list_ref(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.get(r), Obj::List(_)) => Some(r),
            _ => None,
        }
    }

    pub fn as_instance_ref(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.get(r), Obj::Instance(_)) => Some(r),
            _ => None,
        }
    }

    pub fn as_class_ref(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.get(r), Obj::Class(_)) => Some(r),
            _ => None,
        }
    }

    pub fn as_closure_ref(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.get(r), Obj::Closure(_)) => Some(r),
            _ => None,
        }
    }

    /// Chinese type label for diagnostics.
    pub fn type_label(&self, v: Value) -> &'static str {
        match v {
            Value::Nil => "空",
            Value::Bool(_) => "布尔",
            Value::Number(_) => "数字",
            Value::Obj(r) => self.get(r).type_label(),
        }
    }

    // ----- printing -----

    pub fn format_value(&self, v: Value) -> String {
        match v {
            Value::Nil => "空".to_string(),
            Value::Bool(true) => "真".to_string(),
            Value::Bool(false) => "假".to_string(),
            Value::Number(n) => format!("{n}"),
            Value::Obj(r) => self.format_object(r),
        }
    }

    fn format_object(&self, r: ObjRef) -> String {
        match self.get(r) {
            Obj::String(s) => s.to_text(),
            Obj::List(l) => {
                let items: Vec<String> = l.items.iter().map(|&v| self.format_value(v)).collect();
                format!("[{}]", items.join(", "))
            }
            Obj::Function(f) => self.format_function(f),
            Obj::Closure(c) => self.format_function(self.function(c.function)),
            Obj::Upvalue(_) => "上值".to_string(),
            Obj::Class(c) => self.string(c.name).to_text(),
            Obj::Instance(i) => {
                format!("{} 实例", self.string(self.class(i.class).name).to_text())
            }
            Obj::BoundMethod(b) => {
                let closure_fn = match self.get(b.method) {
                    Obj::Closure(c) => Some(c.function),
                    _ => None,
                };
                match closure_fn {
                    Some(f) => self.format_function(self.function(f)),
                    None => "<本机功能>".to_string(),
                }
            }
            Obj::Native(_) => "<本机功能>".to_string(),
        }
    }

    fn format_function(&self, f: &ObjFunction) -> String {
        match f.name {
            Some(name) => format!("<功能 {}>", self.string(name).to_text()),
            None => "<脚本>".to_string(),
        }
    }

    // ----- collection -----

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.mark_object(r);
        }
    }

    /// Color an object gray: set its bit and queue it for tracing.
    pub fn mark_object(&mut self, r: ObjRef) {
        if !self.marked[r.index()] {
            self.marked[r.index()] = true;
            self.gray.push(r);
        }
    }

    /// Drain the gray worklist, coloring each reached object's immediate
    /// references.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            let Heap {
                ref slots,
                ref mut marked,
                ref mut gray,
                ..
            } = *self;
            let Some(entry) = &slots[r.index()] else {
                continue;
            };
            match &entry.obj {
                Obj::String(_) | Obj::Native(_) => {}
                Obj::List(l) => {
                    for &item in &l.items {
                        mark_child_value(marked, gray, item);
                    }
                }
                Obj::Function(f) => {
                    if let Some(name) = f.name {
                        mark_child(marked, gray, name);
                    }
                    for &constant in &f.chunk.constants {
                        mark_child_value(marked, gray, constant);
                    }
                }
                Obj::Closure(c) => {
                    mark_child(marked, gray, c.function);
                    for &upvalue in &c.upvalues {
                        mark_child(marked, gray, upvalue);
                    }
                }
                Obj::Upvalue(u) => {
                    if let ObjUpvalue::Closed(v) = u {
                        mark_child_value(marked, gray, *v);
                    }
                }
                Obj::Class(c) => {
                    mark_child(marked, gray, c.name);
                    for (key, value) in c.methods.iter() {
                        mark_child(marked, gray, key);
                        mark_child_value(marked, gray, value);
                    }
                }
                Obj::Instance(i) => {
                    mark_child(marked, gray, i.class);
                    for (key, value) in i.fields.iter() {
                        mark_child(marked, gray, key);
                        mark_child_value(marked, gray, value);
                    }
                }
                Obj::BoundMethod(b) => {
                    mark_child_value(marked, gray, b.receiver);
                    mark_child(marked, gray, b.method);
                }
            }
        }
    }

    /// Weak interning: forget intern-table entries whose key string was
    /// not reached. Must run after marking, before [`Heap::sweep`].
    pub fn remove_white_strings(&mut self) {
        let marked = &self.marked;
        self.strings.remove_white(|r| marked[r.index()]);
    }

    /// Free every unmarked object and clear the surviving mark bits; then
    /// raise the threshold for the next cycle.
    pub fn sweep(&mut self) {
        let before = self.bytes_allocated;
        let mut freed = 0usize;
        for i in 0..self.slots.len() {
            if self.slots[i].is_none() {
                continue;
            }
            if self.marked[i] {
                self.marked[i] = false;
            } else if let Some(entry) = self.slots[i].take() {
                self.bytes_allocated -= entry.size;
                self.free.push(i);
                freed += 1;
            }
        }
        self.next_gc = self.bytes_allocated * self.growth;
        debug!(
            freed,
            before_bytes = before,
            after_bytes = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc sweep complete"
        );
    }
}

impl Table {
    /// Mark every key and value in this table as a GC root set.
    pub fn mark(&self, heap: &mut Heap) {
        for (key, value) in self.iter() {
            heap.mark_object(key);
            heap.mark_value(value);
        }
    }
}

fn mark_child(marked: &mut [bool], gray: &mut Vec<ObjRef>, r: ObjRef) {
    if !marked[r.index()] {
        marked[r.index()] = true;
        gray.push(r);
    }
}

fn mark_child_value(marked: &mut [bool], gray: &mut Vec<ObjRef>, v: Value) {
    if let Value::Obj(r) = v {
        mark_child(marked, gray, r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_dedups_equal_strings() {
        let mut heap = Heap::new();
        let a = heap.intern("你好");
        let b = heap.intern("你好");
        let c = heap.intern("世界");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn test_collection_frees_unreachable_and_cleans_interns() {
        let mut heap = Heap::new();
        let live = heap.intern("留");
        let _dead = heap.intern("死");
        let bytes_with_both = heap.bytes_allocated();

        heap.mark_object(live);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        assert_eq!(heap.object_count(), 1);
        assert!(heap.bytes_allocated() < bytes_with_both);
        // The dead intern entry is gone: re-interning allocates fresh.
        let revived = heap.intern("死");
        assert_eq!(heap.object_count(), 2);
        // And the survivor still dedups.
        assert_eq!(heap.intern("留"), live);
        assert_ne!(revived, live);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut heap = Heap::new();
        let dead = heap.intern("短暂");
        heap.sweep();
        assert_eq!(heap.object_count(), 0);
        let next = heap.alloc(Obj::List(ObjList::default()));
        assert_eq!(next.index(), dead.index());
    }

    #[test]
    fn test_tracing_reaches_closed_upvalues_and_lists() {
        let mut heap = Heap::new();
        let s = heap.intern("捕获");
        let upvalue = heap.alloc(Obj::Upvalue(ObjUpvalue::Closed(Value::Obj(s))));
        let list = heap.alloc(Obj::List(ObjList {
            items: vec![Value::Obj(upvalue)],
        }));

        heap.mark_object(list);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();
        assert_eq!(heap.object_count(), 3);
    }

    #[test]
    fn test_next_gc_scales_with_live_bytes() {
        let mut heap = Heap::with_config(0, 2);
        let keep = heap.intern("很长的一个字符串用来占字节");
        assert!(heap.should_collect());
        heap.mark_object(keep);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();
        assert_eq!(heap.next_gc(), heap.bytes_allocated() * 2);
    }
}
