use crate::{Function, HeapObject, Value};
use tracing::debug;

/// Doubling growth policy shared by the heap's object table and the
/// bytecode buffers.
pub fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 {
        8
    } else {
        capacity * 2
    }
}

/// Arena that owns every runtime object. Values refer into it through
/// opaque `u32` handles; the whole arena is released when the VM goes away.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    free_list: Vec<u32>,
    bytes_allocated: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, object: HeapObject) -> u32 {
        self.bytes_allocated += object.footprint();
        if let Some(index) = self.free_list.pop() {
            self.objects[index as usize] = object;
            return index;
        }
        if self.objects.len() == self.objects.capacity() {
            let grown = grow_capacity(self.objects.capacity());
            self.objects.reserve_exact(grown - self.objects.len());
        }
        let index = self.objects.len() as u32;
        self.objects.push(object);
        index
    }

    pub fn alloc_string(&mut self, text: impl Into<String>) -> Value {
        let text = text.into();
        let hash = crate::object::fnv1a(text.as_bytes());
        Value::HeapRef(self.allocate(HeapObject::Str { text, hash }))
    }

    pub fn alloc_function(&mut self, function: Function) -> Value {
        Value::HeapRef(self.allocate(HeapObject::Function(function)))
    }

    pub fn alloc_exception(
        &mut self,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Value {
        Value::HeapRef(self.allocate(HeapObject::Exception {
            name: name.into(),
            message: message.into(),
        }))
    }

    pub fn get(&self, handle: u32) -> &HeapObject {
        &self.objects[handle as usize]
    }

    pub fn function(&self, handle: u32) -> Option<&Function> {
        match self.get(handle) {
            HeapObject::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Text of a string object, if `value` refers to one.
    pub fn string_text(&self, value: Value) -> Option<&str> {
        match value {
            Value::HeapRef(handle) => match self.get(handle) {
                HeapObject::Str { text, .. } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn free(&mut self, handle: u32) {
        let slot = &mut self.objects[handle as usize];
        self.bytes_allocated -= slot.footprint();
        *slot = HeapObject::Free;
        self.free_list.push(handle);
    }

    pub fn objects(&self) -> impl Iterator<Item = &HeapObject> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        debug!(
            objects = self.len(),
            bytes = self.bytes_allocated,
            "releasing heap"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_capacity_doubles_from_eight() {
        let tests = [(0, 8), (1, 8), (7, 8), (8, 16), (16, 32), (100, 200)];
        for (capacity, expected) in tests {
            assert_eq!(grow_capacity(capacity), expected);
        }
    }

    #[test]
    fn test_allocation_tracks_bytes() {
        let mut heap = Heap::new();
        assert_eq!(heap.bytes_allocated(), 0);

        let value = heap.alloc_string("hello");
        assert!(heap.bytes_allocated() > 0);
        assert_eq!(heap.string_text(value), Some("hello"));
    }

    #[test]
    fn test_free_reuses_slots() {
        let mut heap = Heap::new();
        let Value::HeapRef(first) = heap.alloc_string("one") else {
            panic!("expected a heap reference");
        };
        heap.free(first);
        assert!(heap.is_empty());

        let Value::HeapRef(second) = heap.alloc_string("two") else {
            panic!("expected a heap reference");
        };
        assert_eq!(first, second);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_free_returns_bytes() {
        let mut heap = Heap::new();
        let Value::HeapRef(handle) = heap.alloc_string("temporary") else {
            panic!("expected a heap reference");
        };
        let high_water = heap.bytes_allocated();
        heap.free(handle);
        assert!(heap.bytes_allocated() < high_water);
    }
}
