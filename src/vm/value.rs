// Quill Runtime Values
// Tagged values, closures, upvalue cells, classes and instances

use super::natives::NativeFunction;
use crate::compiler::Function;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    Closure(Rc<Closure>),
    Class(Rc<RefCell<Class>>),
    Instance(Rc<RefCell<Instance>>),
    BoundMethod(Rc<BoundMethod>),
    Native(Rc<NativeFunction>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Boolean(_) => "Boolean",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Closure(_) => "Function",
            Value::Class(_) => "Class",
            Value::Instance(_) => "Instance",
            Value::BoundMethod(_) => "BoundMethod",
            Value::Native(_) => "NativeFunction",
        }
    }

    /// `null`, `false`, `0` and `""` are falsey
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(&**s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::String(s) => write!(f, "{}", s),
            Value::Closure(closure) => write!(f, "<fn {}>", closure.function.name),
            Value::Class(class) => write!(f, "<class {}>", class.borrow().name),
            Value::Instance(inst) => {
                let inst = inst.borrow();
                let class = inst.class.borrow();
                write!(f, "<{} instance>", class.name)
            }
            Value::BoundMethod(bound) => {
                write!(f, "<bound method {}>", bound.method.function.name)
            }
            Value::Native(native) => write!(f, "<native fn {}>", native.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            _ => write!(f, "{}", self),
        }
    }
}

/// A captured variable: aliases a stack slot while open, owns its value once closed
#[derive(Debug, Clone)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// A function value bound to its captured variables
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Closure {
    pub fn new(function: Rc<Function>, upvalues: Vec<Rc<RefCell<Upvalue>>>) -> Self {
        Self { function, upvalues }
    }
}

pub struct Class {
    pub name: Rc<str>,
    /// Methods in definition order; inherited entries come first
    pub methods: Vec<(Rc<str>, Rc<Closure>)>,
    method_index: FxHashMap<Rc<str>, usize>,
    /// Declared fields, initialized to null on construction
    pub field_names: Vec<Rc<str>>,
    pub initializer: Option<Rc<Closure>>,
    /// Field-initializer chains, superclass chains first
    pub field_chains: Vec<Rc<Closure>>,
}

impl Class {
    pub fn new(name: Rc<str>) -> Self {
        Self {
            name,
            methods: Vec::new(),
            method_index: FxHashMap::default(),
            field_names: Vec::new(),
            initializer: None,
            field_chains: Vec::new(),
        }
    }

    /// Add or replace a method; `init` also becomes the initializer
    pub fn add_method(&mut self, name: Rc<str>, method: Rc<Closure>) {
        if &*name == "init" {
            self.initializer = Some(method.clone());
        }
        match self.method_index.get(&name) {
            Some(&index) => self.methods[index].1 = method,
            None => {
                self.method_index.insert(name.clone(), self.methods.len());
                self.methods.push((name, method));
            }
        }
    }

    pub fn find_method(&self, name: &str) -> Option<usize> {
        self.method_index.get(name).copied()
    }

    /// Method at a cached index, if it still carries `name`
    pub fn method_named(&self, index: usize, name: &str) -> Option<&Rc<Closure>> {
        self.methods
            .get(index)
            .filter(|(method_name, _)| &**method_name == name)
            .map(|(_, method)| method)
    }

    pub fn declare_field(&mut self, name: Rc<str>) {
        if !self.field_names.contains(&name) {
            self.field_names.push(name);
        }
    }

    /// Copy the superclass's tables; later changes to it are not seen here
    pub fn inherit_from(&mut self, superclass: &Class) {
        for (name, method) in &superclass.methods {
            self.add_method(name.clone(), method.clone());
        }
        for name in &superclass.field_names {
            self.declare_field(name.clone());
        }
        self.field_chains.extend(superclass.field_chains.iter().cloned());
    }
}

pub struct Instance {
    pub class: Rc<RefCell<Class>>,
    /// Fields in insertion order; declared fields come first
    pub fields: Vec<(Rc<str>, Value)>,
}

impl Instance {
    pub fn new(class: Rc<RefCell<Class>>) -> Self {
        let fields = class
            .borrow()
            .field_names
            .iter()
            .map(|name| (name.clone(), Value::Null))
            .collect();
        Self { class, fields }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(field, _)| &**field == name)
    }

    pub fn get_field(&self, name: &str) -> Option<&Value> {
        self.field_index(name).map(|index| &self.fields[index].1)
    }

    /// Field at a cached index, if it still carries `name`
    pub fn field_named(&self, index: usize, name: &str) -> Option<&Value> {
        self.fields
            .get(index)
            .filter(|(field, _)| &**field == name)
            .map(|(_, value)| value)
    }

    /// Set a field, adding it if missing; returns its index
    pub fn set_field(&mut self, name: Rc<str>, value: Value) -> usize {
        match self.field_index(&name) {
            Some(index) => {
                self.fields[index].1 = value;
                index
            }
            None => {
                self.fields.push((name, value));
                self.fields.len() - 1
            }
        }
    }
}

pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Closure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Chunk, FunctionKind};

    fn closure(name: &str) -> Rc<Closure> {
        let function = Function {
            name: Rc::from(name),
            arity: 0,
            upvalues: Vec::new(),
            chunk: Chunk::new(),
            kind: FunctionKind::Method,
        };
        Rc::new(Closure::new(Rc::new(function), Vec::new()))
    }

    #[test]
    fn falsey_values() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("0").is_truthy());
        assert!(Value::Number(-1.0).is_truthy());
    }

    #[test]
    fn numbers_print_without_trailing_zero() {
        assert_eq!(Value::Number(6765.0).to_string(), "6765");
        assert_eq!(Value::Number(-0.5).to_string(), "-0.5");
        assert_eq!(Value::Number(1e20).to_string(), "100000000000000000000");
    }

    #[test]
    fn strings_compare_by_content() {
        assert_eq!(Value::from("abc"), Value::from("abc"));
        assert_ne!(Value::from("abc"), Value::Number(1.0));
    }

    #[test]
    fn inheritance_copies_and_overrides() {
        let mut base = Class::new(Rc::from("Base"));
        base.add_method(Rc::from("cook"), closure("cook"));
        base.add_method(Rc::from("init"), closure("init"));
        base.declare_field(Rc::from("size"));

        let mut derived = Class::new(Rc::from("Derived"));
        derived.inherit_from(&base);
        let own_cook = closure("cook");
        derived.add_method(Rc::from("cook"), own_cook.clone());

        // Added after the copy; must not leak into the subclass
        base.add_method(Rc::from("glaze"), closure("glaze"));

        assert!(derived.find_method("glaze").is_none());
        assert!(derived.initializer.is_some());
        assert_eq!(derived.field_names.len(), 1);
        let index = derived.find_method("cook").unwrap_or(usize::MAX);
        assert!(derived
            .method_named(index, "cook")
            .is_some_and(|m| Rc::ptr_eq(m, &own_cook)));
        assert!(derived.method_named(index, "init").is_none());
    }

    #[test]
    fn instances_start_with_declared_fields_null() {
        let mut class = Class::new(Rc::from("Point"));
        class.declare_field(Rc::from("x"));
        class.declare_field(Rc::from("y"));
        let mut point = Instance::new(Rc::new(RefCell::new(class)));

        assert_eq!(point.get_field("x"), Some(&Value::Null));
        let index = point.set_field(Rc::from("y"), Value::Number(2.0));
        assert_eq!(index, 1);
        assert_eq!(point.field_named(1, "y"), Some(&Value::Number(2.0)));
        assert_eq!(point.field_named(1, "x"), None);
        assert_eq!(point.set_field(Rc::from("z"), Value::Null), 2);
    }
}
