use super::chunk::Chunk;
use super::heap::{mark_ref, mark_root, GrayStack, ObjectRef, ObjectRoot, Trace};
use std::{
    cell::RefCell,
    cmp,
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    mem,
};

//>> Object contents

pub struct LoxString {
    pub chars: String,
    pub hash: u32,
}

impl LoxString {
    pub fn new(chars: String) -> Self {
        let hash = fnv1a(chars.as_bytes());
        Self { chars, hash }
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

impl Trace for LoxString {
    fn trace(&self, _gray: &mut GrayStack) {}

    fn extra_bytes(&self) -> usize {
        self.chars.capacity()
    }
}

/// Strong handle to an interned string, usable as a hash key. Hashes by
/// the precomputed FNV-1a hash; compares by content, which coincides
/// with cell identity once interning holds.
#[derive(Clone)]
pub struct InternedString(pub ObjectRoot<LoxString>);

impl InternedString {
    pub fn from_ref(obj: &ObjectRef<LoxString>) -> Self {
        Self(obj.upgrade().unwrap())
    }

    pub fn as_str(&self) -> &str {
        &self.0.content.chars
    }
}

impl PartialEq for InternedString {
    fn eq(&self, other: &Self) -> bool {
        self.0.content.chars == other.0.content.chars
    }
}

impl Eq for InternedString {}

impl Hash for InternedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0.content.hash);
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InternedString").field(&self.as_str()).finish()
    }
}

pub struct Function {
    pub name: Option<ObjectRef<LoxString>>,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
}

impl Trace for Function {
    fn trace(&self, gray: &mut GrayStack) {
        if let Some(name) = &self.name {
            mark_ref(name, gray);
        }
        for constant in self.chunk.constants() {
            constant.trace(gray);
        }
    }

    fn extra_bytes(&self) -> usize {
        self.chunk.heap_size()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "<fn {}>", name.upgrade().unwrap().content.chars),
            None => write!(f, "<script>"),
        }
    }
}

pub type NativeFn = fn(&[Value]) -> Value;

pub struct Native {
    pub function: NativeFn,
}

impl Trace for Native {
    fn trace(&self, _gray: &mut GrayStack) {}
}

#[derive(Clone)]
pub enum UpValue {
    Open(usize),
    Closed(Value),
}

impl UpValue {
    pub fn close(&mut self, value: Value) {
        *self = UpValue::Closed(value);
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    pub fn as_open(&self) -> usize {
        match self {
            UpValue::Open(idx) => *idx,
            UpValue::Closed(_) => unreachable!(),
        }
    }
}

impl Trace for RefCell<UpValue> {
    fn trace(&self, gray: &mut GrayStack) {
        if let UpValue::Closed(value) = &*self.borrow() {
            value.trace(gray);
        }
    }
}

pub struct Closure {
    pub function: ObjectRef<Function>,
    pub upvalues: Vec<ObjectRef<RefCell<UpValue>>>,
}

impl Trace for Closure {
    fn trace(&self, gray: &mut GrayStack) {
        mark_ref(&self.function, gray);
        for upvalue in &self.upvalues {
            mark_ref(upvalue, gray);
        }
    }

    fn extra_bytes(&self) -> usize {
        self.upvalues.capacity() * mem::size_of::<ObjectRef<RefCell<UpValue>>>()
    }
}

pub struct Class {
    pub name: ObjectRef<LoxString>,
    pub methods: RefCell<HashMap<InternedString, Value>>,
}

impl Trace for Class {
    fn trace(&self, gray: &mut GrayStack) {
        mark_ref(&self.name, gray);
        for (name, method) in self.methods.borrow().iter() {
            mark_root(ObjectRoot::clone(&name.0), gray);
            method.trace(gray);
        }
    }
}

pub struct Instance {
    pub class: ObjectRef<Class>,
    pub fields: RefCell<HashMap<InternedString, Value>>,
}

impl Trace for Instance {
    fn trace(&self, gray: &mut GrayStack) {
        mark_ref(&self.class, gray);
        for (name, value) in self.fields.borrow().iter() {
            mark_root(ObjectRoot::clone(&name.0), gray);
            value.trace(gray);
        }
    }
}

pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjectRef<Closure>,
}

impl Trace for BoundMethod {
    fn trace(&self, gray: &mut GrayStack) {
        self.receiver.trace(gray);
        mark_ref(&self.method, gray);
    }
}

//<<

//>> Value

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    String(ObjectRef<LoxString>),
    Function(ObjectRef<Function>),
    Native(ObjectRef<Native>),
    Closure(ObjectRef<Closure>),
    Class(ObjectRef<Class>),
    Instance(ObjectRef<Instance>),
    BoundMethod(ObjectRef<BoundMethod>),
}

impl Value {
    /// Only `nil` and `false` are falsey.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            _ => true,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn as_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            _ => unreachable!(),
        }
    }

    pub fn as_string(&self) -> ObjectRoot<LoxString> {
        match self {
            Value::String(obj) => obj.upgrade().unwrap(),
            _ => unreachable!(),
        }
    }

    pub fn as_function(&self) -> ObjectRoot<Function> {
        match self {
            Value::Function(obj) => obj.upgrade().unwrap(),
            _ => unreachable!(),
        }
    }

    pub fn trace(&self, gray: &mut GrayStack) {
        match self {
            Value::Nil | Value::Bool(_) | Value::Number(_) => {}
            Value::String(obj) => mark_ref(obj, gray),
            Value::Function(obj) => mark_ref(obj, gray),
            Value::Native(obj) => mark_ref(obj, gray),
            Value::Closure(obj) => mark_ref(obj, gray),
            Value::Class(obj) => mark_ref(obj, gray),
            Value::Instance(obj) => mark_ref(obj, gray),
            Value::BoundMethod(obj) => mark_ref(obj, gray),
        }
    }
}

impl cmp::PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            // interning makes cell identity content equality
            (Self::String(a), Self::String(b)) => a.ptr_eq(b),
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            (Self::Native(a), Self::Native(b)) => a.ptr_eq(b),
            (Self::Closure(a), Self::Closure(b)) => a.ptr_eq(b),
            (Self::Class(a), Self::Class(b)) => a.ptr_eq(b),
            (Self::Instance(a), Self::Instance(b)) => a.ptr_eq(b),
            (Self::BoundMethod(a), Self::BoundMethod(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::String(obj) => write!(f, "{}", obj.upgrade().unwrap().content.chars),
            Self::Function(obj) => write!(f, "{}", obj.upgrade().unwrap().content),
            Self::Native(_) => write!(f, "<native fn>"),
            Self::Closure(obj) => {
                let closure = obj.upgrade().unwrap();
                write!(f, "{}", closure.content.function.upgrade().unwrap().content)
            }
            Self::Class(obj) => {
                let class = obj.upgrade().unwrap();
                write!(
                    f,
                    "{}",
                    class.content.name.upgrade().unwrap().content.chars
                )
            }
            Self::Instance(obj) => {
                let instance = obj.upgrade().unwrap();
                let class = instance.content.class.upgrade().unwrap();
                write!(
                    f,
                    "{} instance",
                    class.content.name.upgrade().unwrap().content.chars
                )
            }
            Self::BoundMethod(obj) => {
                let bound = obj.upgrade().unwrap();
                let closure = bound.content.method.upgrade().unwrap();
                write!(f, "{}", closure.content.function.upgrade().unwrap().content)
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

//<<

#[cfg(test)]
mod tests {
    use super::super::heap::Heap;
    use super::*;

    #[test]
    fn truthiness() {
        let mut heap = Heap::new();
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::String(heap.intern(String::new())).is_truthy());
    }

    #[test]
    fn equality() {
        let mut heap = Heap::new();
        assert_eq!(Value::Nil, Value::Nil);
        assert_eq!(Value::Number(2.0), Value::Number(2.0));
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_ne!(Value::Nil, Value::Bool(false));
        assert_ne!(Value::Number(0.0), Value::Bool(false));

        let a = Value::String(heap.intern("a".to_string()));
        let a2 = Value::String(heap.intern("a".to_string()));
        let b = Value::String(heap.intern("b".to_string()));
        assert_eq!(a, a2);
        assert_ne!(a, b);
    }

    #[test]
    fn printing() {
        let mut heap = Heap::new();
        assert_eq!(format!("{}", Value::Nil), "nil");
        assert_eq!(format!("{}", Value::Bool(true)), "true");
        assert_eq!(format!("{}", Value::Number(7.0)), "7");
        assert_eq!(format!("{}", Value::Number(2.5)), "2.5");
        let s = Value::String(heap.intern("text".to_string()));
        assert_eq!(format!("{}", s), "text");

        let name = heap.intern("f".to_string());
        let function = heap.alloc(Function {
            name: Some(name),
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
        });
        assert_eq!(format!("{}", Value::Function(function.clone())), "<fn f>");
        let script = heap.alloc(Function {
            name: None,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
        });
        assert_eq!(format!("{}", Value::Function(script)), "<script>");
    }

    #[test]
    fn interned_string_hashes_by_content() {
        let mut heap = Heap::new();
        let a = InternedString::from_ref(&heap.intern("key".to_string()));
        let b = InternedString::from_ref(&heap.intern("key".to_string()));
        assert_eq!(a, b);
        let mut map = std::collections::HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }
}
