//! In-memory stand-ins for the ABC parser and class registry.
//!
//! "Dummy" means the data is assembled by hand rather than parsed from an
//! `.abc` file; the semantics exposed through the collaborator traits are
//! real, so tests exercise the same code paths a production embedding would.

use crate::class::{
    Builtin, Class, ClassId, IndexAccess, MethodSignature, TraitEntry, TraitHeader, TraitKind,
    TypeRef,
};
use crate::env::spec::{AbcEnvironment, ClassRegistry, ExceptionRecord};
use crate::name::{Multiname, MultinameKind, Namespace};
use abclift_entity::PrimaryMap;
use std::collections::HashMap;
use std::sync::Arc;

/// An `AbcEnvironment` backed by plain vectors.
///
/// Pool indices are handed out starting at 1; index 0 keeps its ABC meaning
/// of "absent" (`multiname(0)` is `None`, `double(0)` is NaN).
pub struct DummyEnvironment {
    code: Vec<u8>,
    exceptions: Vec<ExceptionRecord>,
    signature: MethodSignature,
    receiver: Option<ClassId>,
    local_count: u32,
    max_scope_depth: u32,
    ints: Vec<i32>,
    uints: Vec<u32>,
    doubles: Vec<f64>,
    strings: Vec<Arc<str>>,
    namespaces: Vec<Namespace>,
    multinames: Vec<Multiname>,
    method_sigs: Vec<MethodSignature>,
    classes: Vec<ClassId>,
}

impl DummyEnvironment {
    /// An environment with empty pools and a `function(): void` signature.
    pub fn new() -> Self {
        DummyEnvironment {
            code: Vec::new(),
            exceptions: Vec::new(),
            signature: MethodSignature::empty(),
            receiver: None,
            local_count: 1,
            max_scope_depth: 0,
            ints: Vec::new(),
            uints: Vec::new(),
            doubles: Vec::new(),
            strings: Vec::new(),
            namespaces: Vec::new(),
            multinames: Vec::new(),
            method_sigs: Vec::new(),
            classes: Vec::new(),
        }
    }

    /// Set the method body bytecode.
    pub fn set_code(&mut self, code: Vec<u8>) {
        self.code = code;
    }

    /// Set the method signature.
    pub fn set_signature(&mut self, sig: MethodSignature) {
        self.signature = sig;
    }

    /// Set the receiver class for an instance method.
    pub fn set_receiver(&mut self, class: Option<ClassId>) {
        self.receiver = class;
    }

    /// Set the local-variable slot count (including `this` and parameters).
    pub fn set_local_count(&mut self, count: u32) {
        self.local_count = count;
    }

    /// Set the maximum scope-stack depth.
    pub fn set_max_scope_depth(&mut self, depth: u32) {
        self.max_scope_depth = depth;
    }

    /// Append an exception-table record.
    pub fn add_exception(&mut self, record: ExceptionRecord) {
        self.exceptions.push(record);
    }

    /// Intern an integer constant; returns its pool index.
    pub fn add_int(&mut self, value: i32) -> u32 {
        self.ints.push(value);
        self.ints.len() as u32
    }

    /// Intern an unsigned constant; returns its pool index.
    pub fn add_uint(&mut self, value: u32) -> u32 {
        self.uints.push(value);
        self.uints.len() as u32
    }

    /// Intern a double constant; returns its pool index.
    pub fn add_double(&mut self, value: f64) -> u32 {
        self.doubles.push(value);
        self.doubles.len() as u32
    }

    /// Intern a string constant; returns its pool index.
    pub fn add_string(&mut self, value: &str) -> u32 {
        self.strings.push(Arc::from(value));
        self.strings.len() as u32
    }

    /// Intern a namespace; returns its pool index.
    pub fn add_namespace(&mut self, ns: Namespace) -> u32 {
        self.namespaces.push(ns);
        self.namespaces.len() as u32
    }

    /// Intern a multiname; returns its pool index.
    pub fn add_multiname(&mut self, mn: Multiname) -> u32 {
        self.multinames.push(mn);
        self.multinames.len() as u32
    }

    /// Intern a public `QName` multiname for `name`.
    pub fn add_public_name(&mut self, name: &str) -> u32 {
        self.add_multiname(Multiname::public(name))
    }

    /// Register another method's signature; returns its method index.
    pub fn add_method(&mut self, sig: MethodSignature) -> u32 {
        self.method_sigs.push(sig);
        self.method_sigs.len() as u32 - 1
    }

    /// Register a class-info entry for `newclass`; returns its index.
    pub fn add_class_info(&mut self, class: ClassId) -> u32 {
        self.classes.push(class);
        self.classes.len() as u32 - 1
    }
}

impl AbcEnvironment for DummyEnvironment {
    fn code(&self) -> &[u8] {
        &self.code
    }

    fn exceptions(&self) -> &[ExceptionRecord] {
        &self.exceptions
    }

    fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    fn receiver(&self) -> Option<ClassId> {
        self.receiver
    }

    fn local_count(&self) -> u32 {
        self.local_count
    }

    fn max_scope_depth(&self) -> u32 {
        self.max_scope_depth
    }

    fn multiname(&self, index: u32) -> Option<&Multiname> {
        index
            .checked_sub(1)
            .and_then(|i| self.multinames.get(i as usize))
    }

    fn string(&self, index: u32) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.strings.get(i as usize))
            .map(|s| &**s)
    }

    fn int(&self, index: u32) -> Option<i32> {
        index
            .checked_sub(1)
            .and_then(|i| self.ints.get(i as usize))
            .copied()
    }

    fn uint(&self, index: u32) -> Option<u32> {
        index
            .checked_sub(1)
            .and_then(|i| self.uints.get(i as usize))
            .copied()
    }

    fn double(&self, index: u32) -> Option<f64> {
        if index == 0 {
            return Some(f64::NAN);
        }
        self.doubles.get(index as usize - 1).copied()
    }

    fn namespace(&self, index: u32) -> Option<&Namespace> {
        index
            .checked_sub(1)
            .and_then(|i| self.namespaces.get(i as usize))
    }

    fn method_signature(&self, index: u32) -> Option<&MethodSignature> {
        self.method_sigs.get(index as usize)
    }

    fn class_at(&self, index: u32) -> Option<ClassId> {
        self.classes.get(index as usize).copied()
    }
}

/// A `ClassRegistry` seeded with the built-in object model.
pub struct DummyRegistry {
    classes: PrimaryMap<ClassId, Class>,
    builtins: HashMap<Builtin, ClassId>,
    by_name: HashMap<Arc<str>, ClassId>,
    vectors: HashMap<TypeRef, ClassId>,
}

impl DummyRegistry {
    /// A registry containing the built-in classes.
    pub fn with_builtins() -> Self {
        let mut reg = DummyRegistry {
            classes: PrimaryMap::new(),
            builtins: HashMap::new(),
            by_name: HashMap::new(),
            vectors: HashMap::new(),
        };
        reg.seed();
        reg
    }

    /// Register a class; its public name becomes resolvable.
    pub fn add_class(&mut self, class: Class) -> ClassId {
        let name = class.name.clone();
        let id = self.classes.push(class);
        self.by_name.insert(name, id);
        id
    }

    /// Mutable access to a registered class, for test setup.
    pub fn class_mut(&mut self, id: ClassId) -> &mut Class {
        &mut self.classes[id]
    }

    fn add_builtin(&mut self, builtin: Builtin, class: Class) -> ClassId {
        let mut class = class;
        class.builtin = Some(builtin);
        let id = self.add_class(class);
        self.builtins.insert(builtin, id);
        id
    }

    fn method_trait(name: &str, params: &[TypeRef], ret: TypeRef, is_static: bool) -> TraitEntry {
        TraitEntry {
            header: TraitHeader {
                ns: Namespace::public(),
                name: Arc::from(name),
                is_static,
                is_final: true,
            },
            kind: TraitKind::Method {
                sig: MethodSignature {
                    params: params.to_vec(),
                    optional_from: None,
                    has_rest: false,
                    needs_arguments: false,
                    sets_dxns: false,
                    return_type: ret,
                },
                disp: None,
            },
        }
    }

    fn getter_trait(name: &str, ty: TypeRef) -> TraitEntry {
        TraitEntry {
            header: TraitHeader {
                ns: Namespace::public(),
                name: Arc::from(name),
                is_static: false,
                is_final: true,
            },
            kind: TraitKind::Getter { ty },
        }
    }

    fn seed(&mut self) {
        let mut object = Class::named("Object", None);
        object.is_dynamic = true;
        let object = self.add_builtin(Builtin::Object, object);

        let mut prim = |b: Builtin, name: &str| {
            let mut c = Class::named(name, Some(object));
            c.is_final = true;
            self.add_builtin(b, c)
        };
        let int_c = prim(Builtin::Int, "int");
        let uint_c = prim(Builtin::Uint, "uint");
        let number = prim(Builtin::Number, "Number");
        prim(Builtin::Boolean, "Boolean");
        let string = prim(Builtin::String, "String");

        // String instance API used by intrinsic recognition.
        {
            let class = &mut self.classes[string];
            class.traits.push(Self::getter_trait(
                "length",
                TypeRef::Class(int_c),
            ));
            class.traits.push(Self::method_trait(
                "charAt",
                &[TypeRef::Class(number)],
                TypeRef::Class(string),
                false,
            ));
            class.traits.push(Self::method_trait(
                "charCodeAt",
                &[TypeRef::Class(number)],
                TypeRef::Class(number),
                false,
            ));
        }

        let mut array = Class::named("Array", Some(object));
        array.is_dynamic = true;
        array.ctor = MethodSignature {
            params: Vec::new(),
            optional_from: None,
            has_rest: true,
            needs_arguments: false,
            sets_dxns: false,
            return_type: TypeRef::Void,
        };
        array.index_access = Some(IndexAccess {
            element_type: TypeRef::Any,
            may_be_hole: true,
        });
        let array = self.add_builtin(Builtin::Array, array);
        self.classes[array]
            .traits
            .push(Self::getter_trait("length", TypeRef::Class(uint_c)));

        let mut namespace = Class::named("Namespace", Some(object));
        namespace.is_final = true;
        self.add_builtin(Builtin::Namespace, namespace);

        let mut qname = Class::named("QName", Some(object));
        qname.is_final = true;
        self.add_builtin(Builtin::QName, qname);

        let mut xml = Class::named("XML", Some(object));
        xml.is_dynamic = true;
        self.add_builtin(Builtin::Xml, xml);
        let mut xml_list = Class::named("XMLList", Some(object));
        xml_list.is_dynamic = true;
        self.add_builtin(Builtin::XmlList, xml_list);

        let mut function = Class::named("Function", Some(object));
        function.is_dynamic = true;
        self.add_builtin(Builtin::Function, function);

        let class_class = Class::named("Class", Some(object));
        self.add_builtin(Builtin::Class, class_class);

        let mut math = Class::named("Math", Some(object));
        math.instantiable = false;
        math.is_final = true;
        let num = TypeRef::Class(number);
        math.static_traits
            .push(Self::method_trait("min", &[num, num], num, true));
        math.static_traits
            .push(Self::method_trait("max", &[num, num], num, true));
        math.static_traits
            .push(Self::method_trait("abs", &[num], num, true));
        self.add_builtin(Builtin::Math, math);

        let mut vector = Class::named("Vector", Some(object));
        vector.is_final = true;
        vector.index_access = Some(IndexAccess {
            element_type: TypeRef::Any,
            may_be_hole: false,
        });
        let vector = self.add_builtin(Builtin::Vector, vector);

        let mut global = Class::named("global", Some(object));
        global.instantiable = false;
        global.is_dynamic = true;
        self.add_builtin(Builtin::Global, global);

        let mut error = Class::named("Error", Some(object));
        error.is_dynamic = true;
        self.add_builtin(Builtin::Error, error);

        // Pre-instantiated vectors for the common element types.
        for elem in [
            TypeRef::Class(int_c),
            TypeRef::Class(uint_c),
            TypeRef::Class(number),
            TypeRef::Class(string),
            TypeRef::Any,
        ] {
            let elem_name = match elem {
                TypeRef::Class(c) => self.classes[c].name.clone(),
                _ => Arc::from("*"),
            };
            let mut inst = Class::named(&format!("Vector.<{}>", elem_name), Some(vector));
            inst.is_final = true;
            inst.vector_element = Some(elem);
            inst.index_access = Some(IndexAccess {
                element_type: elem,
                may_be_hole: false,
            });
            let id = self.classes.push(inst);
            self.vectors.insert(elem, id);
        }
    }
}

impl ClassRegistry for DummyRegistry {
    fn class(&self, id: ClassId) -> &Class {
        &self.classes[id]
    }

    fn builtin(&self, builtin: Builtin) -> ClassId {
        self.builtins[&builtin]
    }

    fn class_by_multiname(&self, mn: &Multiname) -> Option<TypeRef> {
        match &mn.kind {
            MultinameKind::Parameterized { base, params } => {
                let base_id = self.class_by_multiname(base)?.class()?;
                if base_id != self.builtin(Builtin::Vector) || params.len() != 1 {
                    return None;
                }
                let elem = self.class_by_multiname(&params[0])?;
                match self.vector_of(elem) {
                    Some(id) => Some(TypeRef::Class(id)),
                    None => Some(TypeRef::Class(base_id)),
                }
            }
            _ => {
                let name = mn.local_name()?;
                if name == "*" {
                    return Some(TypeRef::Any);
                }
                if name == "void" {
                    return Some(TypeRef::Void);
                }
                self.by_name.get(name).map(|&id| TypeRef::Class(id))
            }
        }
    }

    fn vector_of(&self, elem: TypeRef) -> Option<ClassId> {
        self.vectors.get(&elem).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_hierarchy() {
        let reg = DummyRegistry::with_builtins();
        let object = reg.builtin(Builtin::Object);
        let string = reg.builtin(Builtin::String);
        let array = reg.builtin(Builtin::Array);

        assert!(reg.is_subclass_of(string, object));
        assert!(!reg.is_subclass_of(object, string));
        assert_eq!(reg.common_base(string, array), Some(object));
    }

    #[test]
    fn name_resolution() {
        let reg = DummyRegistry::with_builtins();
        let mn = Multiname::public("String");
        assert_eq!(
            reg.class_by_multiname(&mn),
            Some(TypeRef::Class(reg.builtin(Builtin::String)))
        );
        assert_eq!(
            reg.class_by_multiname(&Multiname::public("*")),
            Some(TypeRef::Any)
        );
        assert_eq!(reg.class_by_multiname(&Multiname::public("Nope")), None);
    }

    #[test]
    fn vector_instantiation() {
        let reg = DummyRegistry::with_builtins();
        let int_t = TypeRef::Class(reg.builtin(Builtin::Int));
        let vec_int = Multiname {
            kind: MultinameKind::Parameterized {
                base: Box::new(Multiname::public("Vector")),
                params: vec![Multiname::public("int")],
            },
            attribute: false,
        };
        let resolved = reg.class_by_multiname(&vec_int).unwrap().class().unwrap();
        assert_eq!(reg.class(resolved).vector_element, Some(int_t));
    }

    #[test]
    fn trait_walk_reaches_parent() {
        let mut reg = DummyRegistry::with_builtins();
        let array = reg.builtin(Builtin::Array);
        let sub = reg.add_class(Class::named("MyArray", Some(array)));
        let (declaring, idx) = reg
            .find_trait(sub, &Multiname::public("length"), false)
            .unwrap();
        assert_eq!(declaring, array);
        let t = &reg.class(declaring).traits[idx];
        assert_eq!(&*t.header.name, "length");
    }

    #[test]
    fn pool_indices_are_one_based() {
        let mut env = DummyEnvironment::new();
        let i = env.add_int(7);
        assert_eq!(i, 1);
        assert_eq!(env.int(1), Some(7));
        assert_eq!(env.int(0), None);
        assert!(env.double(0).unwrap().is_nan());
        assert_eq!(env.multiname(0), None);
    }
}
