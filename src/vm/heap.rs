use std::collections::HashMap;
use std::mem;

use crate::vm::object::{fnv1a, Obj, ObjString};
use crate::vm::value::{format_number, Value};

/// Handle to a heap slot. Handles are only ever obtained from live
/// allocations and are kept alive by the collector's reachability rules,
/// so a handle never dangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

#[derive(Debug)]
struct Slot {
    obj: Option<Obj>,
    marked: bool,
    bytes: usize,
}

const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;
const GC_GROWTH_FACTOR: usize = 2;

/// A non-moving slot arena with a free list, playing the role of the
/// classic intrusive all-objects list: allocation reuses freed slots,
/// objects die only during sweep. Also owns the string intern table,
/// which is weak — entries whose string dies are purged before the sweep.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// FNV-1a hash -> interned strings with that hash.
    strings: HashMap<u32, Vec<ObjRef>>,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Forces a collection at every instruction boundary.
    stress: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: HashMap::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            stress: false,
        }
    }

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let bytes = footprint(&obj);
        self.bytes_allocated += bytes;
        let slot = Slot { obj: Some(obj), marked: false, bytes };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = slot;
                ObjRef(index)
            }
            None => {
                self.slots.push(slot);
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Returns the canonical object for `text`, allocating it on first use.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = fnv1a(text);
        if let Some(bucket) = self.strings.get(&hash) {
            for &r in bucket {
                if let Obj::Str(s) = self.get(r) {
                    if s.hash == hash && s.text == text {
                        return r;
                    }
                }
            }
        }
        let r = self.alloc(Obj::Str(ObjString::new(text.to_string())));
        self.strings.entry(hash).or_default().push(r);
        r
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.0 as usize].obj {
            Some(obj) => obj,
            None => unreachable!("use of freed object"),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.0 as usize].obj {
            Some(obj) => obj,
            None => unreachable!("use of freed object"),
        }
    }

    pub fn as_str(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Obj::Str(s) => &s.text,
            _ => unreachable!("expected string object"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &crate::vm::object::Function {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &crate::vm::object::Closure {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &crate::vm::object::Upvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut crate::vm::object::Upvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated() > self.next_gc
    }

    #[cfg(test)]
    pub(crate) fn set_stress(&mut self, on: bool) {
        self.stress = on;
    }

    // ---- Mark phase ----

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = &mut self.slots[r.0 as usize];
        if slot.obj.is_none() || slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
    }

    /// Drains the gray worklist, marking each object's outgoing references.
    pub fn trace(&mut self) {
        while let Some(r) = self.gray.pop() {
            let children = self.children_of(r);
            for child in children {
                self.mark_object(child);
            }
        }
    }

    fn children_of(&self, r: ObjRef) -> Vec<ObjRef> {
        let mut out = Vec::new();
        let mut push_value = |out: &mut Vec<ObjRef>, v: &Value| {
            if let Value::Obj(child) = v {
                out.push(*child);
            }
        };
        match self.get(r) {
            Obj::Str(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    out.push(name);
                }
                for constant in &f.chunk.constants {
                    push_value(&mut out, constant);
                }
            }
            Obj::Closure(c) => {
                out.push(c.function);
                out.extend(&c.upvalues);
            }
            Obj::Upvalue(u) => {
                if let crate::vm::object::Capture::Closed(v) = &u.capture {
                    push_value(&mut out, v);
                }
            }
            Obj::Class(c) => {
                out.push(c.name);
                for method in c.methods.values() {
                    push_value(&mut out, method);
                }
            }
            Obj::Instance(i) => {
                out.push(i.class);
                for field in i.fields.values() {
                    push_value(&mut out, field);
                }
            }
            Obj::BoundMethod(b) => {
                push_value(&mut out, &b.receiver);
                out.push(b.method);
            }
            Obj::List(items) => {
                for item in items {
                    push_value(&mut out, item);
                }
            }
        }
        out
    }

    // ---- Sweep phase ----

    /// Frees everything unmarked, clears surviving marks, and resets the
    /// allocation watermark. Dead intern entries are purged first so the
    /// table never holds a freed handle.
    pub fn sweep(&mut self) {
        let slots = &self.slots;
        self.strings.retain(|_, bucket| {
            bucket.retain(|r| slots[r.0 as usize].marked);
            !bucket.is_empty()
        });

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.obj.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                self.bytes_allocated -= slot.bytes;
                slot.obj = None;
                slot.bytes = 0;
                self.free.push(index as u32);
            }
        }

        self.next_gc = self.bytes_allocated * GC_GROWTH_FACTOR;
    }

    // ---- Printing ----

    pub fn value_to_string(&self, value: Value) -> String {
        match value {
            Value::Number(n) => format_number(n),
            Value::Bool(b) => b.to_string(),
            Value::Nil => "nil".to_string(),
            Value::Obj(r) => self.obj_to_string(r),
        }
    }

    fn obj_to_string(&self, r: ObjRef) -> String {
        match self.get(r) {
            Obj::Str(s) => s.text.clone(),
            Obj::Function(f) => self.function_name(f.name),
            Obj::Closure(c) => self.function_name(self.function(c.function).name),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.as_str(c.name).to_string(),
            Obj::Instance(i) => {
                let class = match self.get(i.class) {
                    Obj::Class(c) => c,
                    _ => unreachable!("instance of a non-class"),
                };
                format!("{} instance", self.as_str(class.name))
            }
            Obj::BoundMethod(_) => "<bound method>".to_string(),
            Obj::Native(n) => format!("<native fn {}>", n.name),
            Obj::List(items) => {
                let parts: Vec<String> =
                    items.iter().map(|v| self.value_to_string(*v)).collect();
                format!("[{}]", parts.join(", "))
            }
        }
    }

    fn function_name(&self, name: Option<ObjRef>) -> String {
        match name {
            Some(n) => format!("<fn {}>", self.as_str(n)),
            None => "<script>".to_string(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

/// Rough footprint of an allocation, for the GC watermark. Payloads that
/// grow after allocation are not re-accounted, matching the allocation-time
/// bookkeeping of the collector's trigger.
fn footprint(obj: &Obj) -> usize {
    let payload = match obj {
        Obj::Str(s) => s.text.capacity(),
        Obj::Function(f) => {
            f.chunk.code.capacity() + f.chunk.constants.capacity() * mem::size_of::<Value>()
        }
        Obj::Closure(c) => c.upvalues.capacity() * mem::size_of::<ObjRef>(),
        Obj::Class(c) => c.methods.len() * entry_size(),
        Obj::Instance(i) => i.fields.len() * entry_size(),
        Obj::List(items) => items.capacity() * mem::size_of::<Value>(),
        Obj::Upvalue(_) | Obj::BoundMethod(_) | Obj::Native(_) => 0,
    };
    mem::size_of::<Obj>() + payload
}

fn entry_size() -> usize {
    mem::size_of::<String>() + mem::size_of::<Value>()
}
