//! The class and trait model resolved against by the semantic analyzer.
//!
//! Classes are arena records owned by the class registry and referenced by
//! `ClassId`. A trait is a statically declared member; the deep inheritance
//! hierarchy a runtime object model would use is flattened here into a sealed
//! kind variant behind a shared header.

use crate::name::{Multiname, Namespace};
use std::sync::Arc;

/// An opaque reference to a class in the registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);
abclift_entity::entity_ref!(ClassId, "class");

/// A resolved type: the `*` type, `void`, or a concrete class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// The `*` (any) type.
    Any,
    /// The `void` type (return types only).
    Void,
    /// A concrete class.
    Class(ClassId),
}

impl TypeRef {
    /// The class, if this is a concrete class type.
    pub fn class(self) -> Option<ClassId> {
        match self {
            TypeRef::Class(c) => Some(c),
            _ => None,
        }
    }
}

/// Tags identifying the built-in classes the compiler special-cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// `Object`.
    Object,
    /// `int`.
    Int,
    /// `uint`.
    Uint,
    /// `Number`.
    Number,
    /// `Boolean`.
    Boolean,
    /// `String`.
    String,
    /// `Array`.
    Array,
    /// `Namespace`.
    Namespace,
    /// `QName`.
    QName,
    /// `XML`.
    Xml,
    /// `XMLList`.
    XmlList,
    /// `Function`.
    Function,
    /// `Class`.
    Class,
    /// `Math` (a singleton class with only static traits).
    Math,
    /// The untyped `Vector` base.
    Vector,
    /// The global-scope object class.
    Global,
    /// `Error` (thrown by generated precondition failures).
    Error,
}

/// A method or function signature.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSignature {
    /// Declared parameter types, in order. Does not include `this`.
    pub params: Vec<TypeRef>,
    /// Index of the first optional parameter, if any have defaults.
    pub optional_from: Option<u32>,
    /// Whether excess arguments are collected into a `rest` array.
    pub has_rest: bool,
    /// Whether the legacy `arguments` array is materialized.
    pub needs_arguments: bool,
    /// Whether the method may set the default XML namespace.
    pub sets_dxns: bool,
    /// Declared return type.
    pub return_type: TypeRef,
}

impl MethodSignature {
    /// A `function(): void` signature.
    pub fn empty() -> Self {
        MethodSignature {
            params: Vec::new(),
            optional_from: None,
            has_rest: false,
            needs_arguments: false,
            sets_dxns: false,
            return_type: TypeRef::Void,
        }
    }

    /// The minimum number of arguments a call site must supply.
    pub fn required_argc(&self) -> u32 {
        match self.optional_from {
            Some(n) => n,
            None => self.params.len() as u32,
        }
    }

    /// Is `argc` an acceptable argument count for this signature?
    pub fn accepts_argc(&self, argc: u32) -> bool {
        if argc < self.required_argc() {
            return false;
        }
        self.has_rest || argc <= self.params.len() as u32
    }
}

/// The parts common to every trait kind.
#[derive(Debug, Clone, PartialEq)]
pub struct TraitHeader {
    /// The qualifying namespace of the trait name.
    pub ns: Namespace,
    /// The local name.
    pub name: Arc<str>,
    /// Declared on the class object rather than on instances.
    pub is_static: bool,
    /// May not be overridden.
    pub is_final: bool,
}

/// The kind-specific payload of a trait.
#[derive(Debug, Clone, PartialEq)]
pub enum TraitKind {
    /// A variable slot.
    Field {
        /// Declared type.
        ty: TypeRef,
        /// Fixed slot id, if the ABC assigned one.
        slot: Option<u32>,
        /// `const` slots reject assignment outside the initializer.
        read_only: bool,
    },
    /// A method.
    Method {
        /// The signature.
        sig: MethodSignature,
        /// Fixed dispatch id, if the ABC assigned one.
        disp: Option<u32>,
    },
    /// A getter accessor.
    Getter {
        /// The property type.
        ty: TypeRef,
    },
    /// A setter accessor.
    Setter {
        /// The property type.
        ty: TypeRef,
    },
    /// An inner class binding.
    InnerClass {
        /// The bound class.
        class: ClassId,
    },
}

/// A statically declared class member.
#[derive(Debug, Clone, PartialEq)]
pub struct TraitEntry {
    /// Name, visibility and modifiers.
    pub header: TraitHeader,
    /// Kind-specific payload.
    pub kind: TraitKind,
}

impl TraitEntry {
    /// The value type read by `getproperty`/`getslot` on this trait, when
    /// statically known.
    pub fn read_type(&self) -> TypeRef {
        match &self.kind {
            TraitKind::Field { ty, .. } => *ty,
            TraitKind::Getter { ty } | TraitKind::Setter { ty } => *ty,
            TraitKind::Method { .. } => TypeRef::Any,
            TraitKind::InnerClass { .. } => TypeRef::Any,
        }
    }

    /// Does an assignment through this trait dispatch at runtime even when
    /// the trait itself resolved statically? True for function-typed fields
    /// invoked as methods and for bare methods being written.
    pub fn is_method_like(&self) -> bool {
        match self.kind {
            TraitKind::Method { .. } => true,
            _ => false,
        }
    }
}

/// Numeric-index access capability of a class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexAccess {
    /// Type of an element read; writes coerce to the same type.
    pub element_type: TypeRef,
    /// Reads may return a hole (`undefined`), so the static type widens
    /// to `*` unless the container guarantees density.
    pub may_be_hole: bool,
}

/// A class descriptor.
#[derive(Debug, Clone)]
pub struct Class {
    /// Qualifying namespace of the class name.
    pub ns: Namespace,
    /// Local class name.
    pub name: Arc<str>,
    /// Superclass, absent only for `Object` and interfaces.
    pub parent: Option<ClassId>,
    /// Declared interfaces (transitively closed by the registry).
    pub interfaces: Vec<ClassId>,
    /// Interfaces cannot be constructed and use different cast emission.
    pub is_interface: bool,
    /// Final classes permit devirtualized dispatch.
    pub is_final: bool,
    /// Can `construct` instantiate this class?
    pub instantiable: bool,
    /// Dynamic classes accept properties beyond their declared traits.
    pub is_dynamic: bool,
    /// Built-in identity, if this is one of the compiler-known classes.
    pub builtin: Option<Builtin>,
    /// Instance traits, declared order.
    pub traits: Vec<TraitEntry>,
    /// Static traits, declared order.
    pub static_traits: Vec<TraitEntry>,
    /// Constructor signature.
    pub ctor: MethodSignature,
    /// Numeric-index access, if the class supports it.
    pub index_access: Option<IndexAccess>,
    /// Element type for `Vector.<T>` instantiations.
    pub vector_element: Option<TypeRef>,
}

impl Class {
    /// A plain instantiable class with the given public name.
    pub fn named(name: &str, parent: Option<ClassId>) -> Self {
        Class {
            ns: Namespace::public(),
            name: Arc::from(name),
            parent,
            interfaces: Vec::new(),
            is_interface: false,
            is_final: false,
            instantiable: true,
            is_dynamic: false,
            builtin: None,
            traits: Vec::new(),
            static_traits: Vec::new(),
            ctor: MethodSignature::empty(),
            index_access: None,
            vector_element: None,
        }
    }

    /// Find a trait on this class (not ancestors) visible through `mn`.
    ///
    /// Declared order decides ties; the ABC format forbids true duplicates.
    pub fn find_trait(&self, mn: &Multiname, static_side: bool) -> Option<(usize, &TraitEntry)> {
        let name = mn.local_name()?;
        let table = if static_side {
            &self.static_traits
        } else {
            &self.traits
        };
        table
            .iter()
            .enumerate()
            .find(|(_, t)| &*t.header.name == name && mn.admits_ns(&t.header.ns))
    }
}
