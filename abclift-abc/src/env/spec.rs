//! Traits the ABC parser and class registry implement for the middle-end.
//!
//! The compiler never owns the bytecode, constant pools, or class hierarchy;
//! it borrows them through these interfaces for the duration of one method
//! compilation. Index-based accessors return `None` for out-of-range indices
//! and leave error reporting to the caller, which knows the offending
//! instruction.

use crate::class::{Builtin, Class, ClassId, MethodSignature, TypeRef};
use crate::name::{Multiname, Namespace};

/// One raw entry of a method's ABC exception table, in byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// First covered byte offset.
    pub from: u32,
    /// One past the last covered byte offset.
    pub to: u32,
    /// Byte offset of the catch target.
    pub target: u32,
    /// Multiname index of the caught type; 0 catches everything.
    pub type_name: u32,
    /// Multiname index of the catch variable name; 0 if unnamed.
    pub var_name: u32,
}

/// Access to one method body and the constant pools of its ABC file.
pub trait AbcEnvironment {
    /// The method body bytecode.
    fn code(&self) -> &[u8];

    /// The method's raw exception table, in declaration order.
    fn exceptions(&self) -> &[ExceptionRecord];

    /// The signature of the method being compiled.
    fn signature(&self) -> &MethodSignature;

    /// The class of `this` for instance methods; `None` for free functions
    /// and script initializers.
    fn receiver(&self) -> Option<ClassId>;

    /// Number of local-variable slots, including `this` and parameters.
    fn local_count(&self) -> u32;

    /// Maximum scope-stack depth declared by the method body.
    fn max_scope_depth(&self) -> u32;

    /// Resolve a constant-pool multiname.
    fn multiname(&self, index: u32) -> Option<&Multiname>;

    /// Resolve a constant-pool string.
    fn string(&self, index: u32) -> Option<&str>;

    /// Resolve a constant-pool signed integer.
    fn int(&self, index: u32) -> Option<i32>;

    /// Resolve a constant-pool unsigned integer.
    fn uint(&self, index: u32) -> Option<u32>;

    /// Resolve a constant-pool double. Index 0 is NaN.
    fn double(&self, index: u32) -> Option<f64>;

    /// Resolve a constant-pool namespace.
    fn namespace(&self, index: u32) -> Option<&Namespace>;

    /// Signature of another method in the same file (`callstatic`,
    /// `newfunction`).
    fn method_signature(&self, index: u32) -> Option<&MethodSignature>;

    /// Class bound by a `newclass` with the given class-info index.
    fn class_at(&self, index: u32) -> Option<ClassId>;
}

/// Access to the resolved class hierarchy.
///
/// Implementations must allow concurrent readers; one registry is shared by
/// all method compilations of a program.
pub trait ClassRegistry {
    /// The descriptor of a class.
    fn class(&self, id: ClassId) -> &Class;

    /// The class behind a built-in tag.
    fn builtin(&self, builtin: Builtin) -> ClassId;

    /// Resolve a compile-time type name to a type. `*` resolves to
    /// `TypeRef::Any`; unknown names resolve to `None`.
    fn class_by_multiname(&self, mn: &Multiname) -> Option<TypeRef>;

    /// The `Vector.<elem>` instantiation, when the registry has one.
    fn vector_of(&self, elem: TypeRef) -> Option<ClassId>;

    /// Is `sub` equal to, or derived from, `sup`? Interfaces count.
    fn is_subclass_of(&self, sub: ClassId, sup: ClassId) -> bool {
        let mut cur = Some(sub);
        while let Some(c) = cur {
            if c == sup {
                return true;
            }
            let class = self.class(c);
            if class.interfaces.contains(&sup) {
                return true;
            }
            cur = class.parent;
        }
        false
    }

    /// Find a trait visible through `mn` on `class` or an ancestor.
    ///
    /// Returns the declaring class and the trait's index within it.
    fn find_trait(
        &self,
        class: ClassId,
        mn: &Multiname,
        static_side: bool,
    ) -> Option<(ClassId, usize)> {
        let mut cur = Some(class);
        while let Some(c) = cur {
            if let Some((idx, _)) = self.class(c).find_trait(mn, static_side) {
                return Some((c, idx));
            }
            // Static traits are not inherited.
            if static_side {
                return None;
            }
            cur = self.class(c).parent;
        }
        None
    }

    /// The nearest common base class of `a` and `b`, if any.
    fn common_base(&self, a: ClassId, b: ClassId) -> Option<ClassId> {
        let mut cur = Some(a);
        while let Some(c) = cur {
            if self.is_subclass_of(b, c) {
                return Some(c);
            }
            cur = self.class(c).parent;
        }
        None
    }
}
