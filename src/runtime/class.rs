use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::ir::IseqId;
use crate::runtime::builtins::Builtin;
use crate::runtime::frame::Cref;
use crate::runtime::value::Value;

/// Entry of a method table.
#[derive(Clone)]
pub enum Method {
    /// Compiled method body; `cref` is the lexical scope at definition.
    Iseq { iseq: IseqId, cref: Rc<Cref> },
    Builtin(Builtin),
    /// `attr_reader`; holds the `@name`.
    AttrReader(String),
    /// `attr_writer`; holds the `@name`.
    AttrWriter(String),
}

/// Class or module.
pub struct Class {
    pub name: String,
    pub superclass: Option<Rc<Class>>,
    pub is_module: bool,
    /// Core classes also answer from the builtin method table.
    pub builtin: bool,
    pub methods: RefCell<HashMap<String, Method>>,
    pub singleton_methods: RefCell<HashMap<String, Method>>,
    pub constants: RefCell<HashMap<String, Value>>,
    pub class_vars: RefCell<HashMap<String, Value>>,
    pub ivars: RefCell<HashMap<String, Value>>,
    /// Included modules, most recent last.
    pub includes: RefCell<Vec<Rc<Class>>>,
}

impl Class {
    pub fn new(name: impl Into<String>, superclass: Option<Rc<Class>>) -> Self {
        Self {
            name: name.into(),
            superclass,
            is_module: false,
            builtin: false,
            methods: RefCell::new(HashMap::new()),
            singleton_methods: RefCell::new(HashMap::new()),
            constants: RefCell::new(HashMap::new()),
            class_vars: RefCell::new(HashMap::new()),
            ivars: RefCell::new(HashMap::new()),
            includes: RefCell::new(Vec::new()),
        }
    }

    pub fn module(name: impl Into<String>) -> Self {
        Self {
            is_module: true,
            ..Class::new(name, None)
        }
    }

    pub fn core(name: &str, superclass: Option<Rc<Class>>) -> Rc<Class> {
        Rc::new(Self {
            builtin: true,
            ..Class::new(name, superclass)
        })
    }

    pub fn core_module(name: &str) -> Rc<Class> {
        Rc::new(Self {
            builtin: true,
            ..Class::module(name)
        })
    }

    pub fn define_method(&self, name: &str, method: Method) {
        self.methods.borrow_mut().insert(name.to_string(), method);
    }

    pub fn own_method(&self, name: &str) -> Option<Method> {
        self.methods.borrow().get(name).cloned()
    }

    pub fn get_constant(&self, name: &str) -> Option<Value> {
        self.constants.borrow().get(name).cloned()
    }

    pub fn set_constant(&self, name: &str, value: Value) {
        self.constants.borrow_mut().insert(name.to_string(), value);
    }
}

/// Method resolution order: the class, its included modules (latest
/// first), then the superclass chain.
pub fn ancestors(class: &Rc<Class>) -> Vec<Rc<Class>> {
    let mut out: Vec<Rc<Class>> = Vec::new();
    let mut current = Some(Rc::clone(class));
    while let Some(class) = current {
        out.push(Rc::clone(&class));
        for module in class.includes.borrow().iter().rev() {
            for ancestor in ancestors(module) {
                if !out.iter().any(|seen| Rc::ptr_eq(seen, &ancestor)) {
                    out.push(ancestor);
                }
            }
        }
        current = class.superclass.clone();
    }
    out
}

/// `class` is `other` or inherits from it (or includes it).
pub fn is_subclass(class: &Rc<Class>, other: &Rc<Class>) -> bool {
    ancestors(class).iter().any(|ancestor| Rc::ptr_eq(ancestor, other))
}

/// Class-variable owner: the first class in the superclass chain that
/// already has `name`.
pub fn class_var_owner(class: &Rc<Class>, name: &str) -> Option<Rc<Class>> {
    ancestors(class)
        .into_iter()
        .find(|ancestor| ancestor.class_vars.borrow().contains_key(name))
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestors_follow_includes_then_superclass() {
        let object = Class::core("Object", None);
        let comparable = Class::core_module("Comparable");
        let base = Rc::new(Class::new("Base", Some(Rc::clone(&object))));
        let child = Rc::new(Class::new("Child", Some(Rc::clone(&base))));
        child.includes.borrow_mut().push(Rc::clone(&comparable));

        let names: Vec<String> = ancestors(&child).iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["Child", "Comparable", "Base", "Object"]);
        assert!(is_subclass(&child, &object));
        assert!(!is_subclass(&base, &child));
    }

    #[test]
    fn test_class_var_owner() {
        let base = Rc::new(Class::new("Base", None));
        let child = Rc::new(Class::new("Child", Some(Rc::clone(&base))));
        base.class_vars.borrow_mut().insert("@@count".to_string(), Value::Integer(0));
        let owner = class_var_owner(&child, "@@count").map(|c| c.name.clone());
        assert_eq!(owner.as_deref(), Some("Base"));
        assert!(class_var_owner(&child, "@@other").is_none());
    }
}
