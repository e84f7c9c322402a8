//! IR entity references.
//!
//! Every arena record produced during a method compilation is referred to by
//! one of these `u32` newtypes. We prefer `Option<Id>` in signatures and
//! `PackedOption<Id>` inside records, where the doubled size would show up.

use abclift_entity::entity_ref;

/// An opaque reference to a decoded instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub(crate) u32);
entity_ref!(InstrId, "i");

/// An opaque reference to a basic block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);
entity_ref!(BlockId, "bb");

/// An opaque reference to an exception handler region.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u32);
entity_ref!(HandlerId, "eh");

/// An opaque reference to a data-flow node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);
entity_ref!(NodeId, "n");

/// An opaque reference to an interned resolved property.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropId(pub(crate) u32);
entity_ref!(PropId, "rp");

/// An opaque reference to an IL label.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IlLabel(pub(crate) u32);
entity_ref!(IlLabel, "L");

/// An opaque reference to an IL local variable.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IlVar(pub(crate) u32);
entity_ref!(IlVar, "v");
