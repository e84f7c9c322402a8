//! Resolved properties.
//!
//! Every property-naming instruction binds its access site to one interned
//! `ResolvedProperty`. Identical sites share one record, so the table stays
//! small even in getter-heavy methods.

use crate::ir::node::DataType;
use abclift_abc::{ClassId, TypeRef};

/// A statically resolved trait: the declaring class and the trait's index in
/// its (instance or static) trait table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraitRef {
    /// The class declaring the trait.
    pub class: ClassId,
    /// Index into the declaring class's trait table.
    pub index: u32,
    /// Whether the trait lives in the static table.
    pub is_static: bool,
}

/// Numeric-index access into a supporting container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexProp {
    /// Static type of a read; writes coerce to the same type.
    pub value_type: TypeRef,
    /// Reads may observe a hole and widen to `undefined`.
    pub may_be_hole: bool,
}

/// A call pattern the generator lowers to a dedicated sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    /// `int(x)` boxing/conversion call.
    IntBox,
    /// `uint(x)`.
    UintBox,
    /// `Number(x)`.
    NumberBox,
    /// `Boolean(x)`.
    BooleanBox,
    /// `String(x)`.
    StringBox,
    /// `Math.min(a, b)`.
    MathMin,
    /// `Math.max(a, b)`.
    MathMax,
    /// `Math.abs(x)`.
    MathAbs,
    /// `String.charAt(i)` with a known-numeric index.
    StringCharAt,
    /// `String.charCodeAt(i)` with a known-numeric index.
    StringCharCodeAt,
    /// `new Array(n)` with one numeric length argument.
    ArrayWithLength,
    /// `new Array(...items)`.
    ArrayOfItems,
    /// `new Vector.<T>(...)` via `applytype` + `construct`.
    VectorCtor,
    /// `coerce`/`astype` to a compile-time-known class.
    ClassCast,
    /// `istype` against a compile-time-known class.
    ClassTest,
    /// A lexical reference to a class object resolved by name.
    ClassObject,
}

/// How an access site was bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolutionKind {
    /// Nothing known yet; only legal before semantic analysis completes.
    Unknown,
    /// Bound to a declared trait.
    Trait(TraitRef),
    /// Bound to numeric-index access.
    Index(IndexProp),
    /// Bound to a recognized intrinsic.
    Intrinsic(Intrinsic),
    /// No compile-time binding; the generator emits a reflective lookup.
    Runtime,
    /// The trait resolved statically but the invoke/assignment still
    /// dispatches at runtime (e.g. calling through a function-typed field).
    TraitRtInvoke(TraitRef),
}

impl ResolutionKind {
    /// The statically bound trait, if any.
    pub fn trait_ref(self) -> Option<TraitRef> {
        match self {
            ResolutionKind::Trait(t) | ResolutionKind::TraitRtInvoke(t) => Some(t),
            _ => None,
        }
    }
}

/// One interned resolved property.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProperty {
    /// Static type of the object the access goes through.
    pub object_type: DataType,
    /// Type of the runtime namespace operand, when the multiname has one.
    pub rt_ns_type: Option<DataType>,
    /// Type of the runtime name operand, when the multiname has one.
    pub rt_name_type: Option<DataType>,
    /// The object class the resolution searched, when there is one.
    pub object_class: Option<ClassId>,
    /// The binding.
    pub kind: ResolutionKind,
}

impl ResolvedProperty {
    /// An unresolved placeholder for `object_type`.
    pub fn unknown(object_type: DataType) -> Self {
        ResolvedProperty {
            object_type,
            rt_ns_type: None,
            rt_name_type: None,
            object_class: None,
            kind: ResolutionKind::Unknown,
        }
    }
}
