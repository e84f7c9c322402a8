//! Data-flow nodes.
//!
//! A data node is one SSA-ish value observed in a stack, scope, or local slot
//! during abstract execution. Nodes carry their static type, an optional
//! constant payload, and def/use edges into the shared reference pools.

use crate::ir::NodeOrInstr;
use abclift_abc::{ClassId, Namespace, TypeRef};
use abclift_entity::pool::DynList;
use std::sync::Arc;

/// Which machine component a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// The operand stack.
    Stack,
    /// The scope stack.
    Scope,
    /// A local variable.
    Local,
}

/// A slot descriptor: component plus index (stack depth, scope depth, or
/// local number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    /// The machine component.
    pub kind: SlotKind,
    /// Index within the component.
    pub index: u32,
}

impl SlotRef {
    /// A stack slot at the given depth (0 = bottom).
    pub fn stack(index: u32) -> Self {
        SlotRef {
            kind: SlotKind::Stack,
            index,
        }
    }

    /// A scope-stack slot at the given depth (0 = outermost).
    pub fn scope(index: u32) -> Self {
        SlotRef {
            kind: SlotKind::Scope,
            index,
        }
    }

    /// A local-variable slot.
    pub fn local(index: u32) -> Self {
        SlotRef {
            kind: SlotKind::Local,
            index,
        }
    }
}

/// The static type of a data node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataType {
    /// Not yet determined. Only legal before semantic analysis completes.
    Unknown,
    /// The `*` type.
    Any,
    /// The `undefined` value.
    Undefined,
    /// The `null` value. Representable only for reference types.
    Null,
    /// `Boolean`.
    Bool,
    /// `int`.
    Int,
    /// `uint`.
    Uint,
    /// `Number`.
    Number,
    /// `String`.
    String,
    /// `Namespace`.
    Namespace,
    /// `QName`.
    QName,
    /// A class object; the payload is the class when known.
    Class(Option<ClassId>),
    /// A function closure.
    Function,
    /// An instance of a class.
    Object(ClassId),
    /// The receiver; payload is the enclosing class for instance methods.
    This(Option<ClassId>),
    /// The `rest` arguments array.
    Rest,
    /// The global-scope object.
    Global,
}

impl DataType {
    /// Is this one of the numeric machine types?
    pub fn is_numeric(self) -> bool {
        match self {
            DataType::Int | DataType::Uint | DataType::Number => true,
            _ => false,
        }
    }

    /// Is a value of this type represented as an object reference (and can
    /// therefore hold `null`)?
    pub fn is_reference(self) -> bool {
        match self {
            DataType::Bool | DataType::Int | DataType::Uint | DataType::Number => false,
            DataType::Unknown | DataType::Undefined => false,
            _ => true,
        }
    }

    /// The instance class, when the type names one.
    pub fn instance_class(self) -> Option<ClassId> {
        match self {
            DataType::Object(c) => Some(c),
            DataType::This(c) => c,
            _ => None,
        }
    }

    /// Convert a registry type to a node type.
    pub fn from_type_ref(ty: TypeRef) -> Self {
        match ty {
            TypeRef::Any => DataType::Any,
            TypeRef::Void => DataType::Undefined,
            TypeRef::Class(c) => DataType::Object(c),
        }
    }
}

/// A node's constant payload. Meaningful only when the `CONSTANT` flag is
/// set.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    /// Not a constant.
    None,
    /// `undefined`.
    Undefined,
    /// `null`.
    Null,
    /// An `int` constant.
    Int(i32),
    /// A `uint` constant.
    Uint(u32),
    /// A `Number` constant.
    Number(f64),
    /// A `Boolean` constant.
    Bool(bool),
    /// A `String` constant.
    String(Arc<str>),
    /// A `Namespace` constant.
    Namespace(Namespace),
}

impl ConstValue {
    /// ECMA-262 ToBoolean on a constant.
    pub fn to_bool(&self) -> Option<bool> {
        Some(match self {
            ConstValue::None => return None,
            ConstValue::Undefined | ConstValue::Null => false,
            ConstValue::Int(v) => *v != 0,
            ConstValue::Uint(v) => *v != 0,
            ConstValue::Number(v) => *v != 0.0 && !v.is_nan(),
            ConstValue::Bool(v) => *v,
            ConstValue::String(s) => !s.is_empty(),
            ConstValue::Namespace(_) => true,
        })
    }

    /// ECMA-262 ToNumber on a constant, when it does not require string
    /// parsing.
    pub fn to_number(&self) -> Option<f64> {
        Some(match self {
            ConstValue::Int(v) => *v as f64,
            ConstValue::Uint(v) => *v as f64,
            ConstValue::Number(v) => *v,
            ConstValue::Bool(v) => *v as i32 as f64,
            ConstValue::Null => 0.0,
            ConstValue::Undefined => std::f64::NAN,
            _ => return None,
        })
    }
}

/// Per-node flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags(u16);

macro_rules! node_flag {
    ($bit:expr, $get:ident, $set:ident, $doc:expr) => {
        #[doc = $doc]
        pub fn $get(self) -> bool {
            self.0 & (1 << $bit) != 0
        }

        #[doc = "Setter."]
        pub fn $set(&mut self) {
            self.0 |= 1 << $bit;
        }
    };
}

impl NodeFlags {
    node_flag!(0, is_argument, set_argument, "Holds a declared parameter.");
    node_flag!(1, is_constant, set_constant, "Has a known constant value.");
    node_flag!(2, is_phi, set_phi, "Merges several predecessor values.");
    node_flag!(
        3,
        is_no_push,
        set_no_push,
        "The producer emits no stack traffic; consumers materialize the constant on demand."
    );
    node_flag!(4, is_not_null, set_not_null, "Statically known non-null.");
    node_flag!(
        5,
        is_with_scope,
        set_with_scope,
        "Pushed by `pushwith`; blocks compile-time scope lookups past it."
    );
    node_flag!(
        6,
        is_exception,
        set_exception,
        "The caught exception entering a catch block."
    );
    node_flag!(
        7,
        is_local_write_through,
        set_local_write_through,
        "A local write inside a try region that must sync its catch phis."
    );
    node_flag!(
        8,
        is_push_optional_param,
        set_push_optional_param,
        "An optional parameter that may need its default filled in."
    );
    node_flag!(
        9,
        is_push_convert_string,
        set_push_convert_string,
        "Converted to String on push (`null`/`undefined` become text)."
    );
    node_flag!(
        10,
        is_late_multiname,
        set_late_multiname,
        "A runtime name or namespace operand of a late-bound multiname."
    );
    node_flag!(
        11,
        is_concat_internal,
        set_concat_internal,
        "Interior node of a string-concatenation tree; the root emits it."
    );
}

/// One data-flow node.
#[derive(Debug, Clone)]
pub struct DataNode {
    /// The slot this node was observed in when created.
    pub slot: SlotRef,
    /// Static type.
    pub ty: DataType,
    /// Constant payload.
    pub value: ConstValue,
    /// Flags.
    pub flags: NodeFlags,
    /// A conversion the code generator must emit when this value is pushed.
    pub on_push_coerce: Option<DataType>,
    /// Defining references: the producing instruction, or for phis the
    /// incoming predecessor values.
    pub defs: DynList<NodeOrInstr>,
    /// Consuming references.
    pub uses: DynList<NodeOrInstr>,
}

impl DataNode {
    /// An untyped node in `slot` with fresh def/use lists.
    pub fn new(slot: SlotRef, defs: DynList<NodeOrInstr>, uses: DynList<NodeOrInstr>) -> Self {
        DataNode {
            slot,
            ty: DataType::Unknown,
            value: ConstValue::None,
            flags: Default::default(),
            on_push_coerce: None,
            defs,
            uses,
        }
    }

    /// Is this node a constant of the given type with the given payload
    /// already known?
    pub fn constant(&self) -> Option<&ConstValue> {
        if self.flags.is_constant() {
            Some(&self.value)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_to_bool() {
        assert_eq!(ConstValue::Int(0).to_bool(), Some(false));
        assert_eq!(ConstValue::Int(-1).to_bool(), Some(true));
        assert_eq!(ConstValue::Number(std::f64::NAN).to_bool(), Some(false));
        assert_eq!(ConstValue::String(Arc::from("")).to_bool(), Some(false));
        assert_eq!(ConstValue::String(Arc::from("x")).to_bool(), Some(true));
        assert_eq!(ConstValue::Null.to_bool(), Some(false));
        assert_eq!(ConstValue::None.to_bool(), None);
    }

    #[test]
    fn const_to_number() {
        assert_eq!(ConstValue::Int(3).to_number(), Some(3.0));
        assert_eq!(ConstValue::Bool(true).to_number(), Some(1.0));
        assert_eq!(ConstValue::Null.to_number(), Some(0.0));
        assert!(ConstValue::Undefined.to_number().unwrap().is_nan());
        assert_eq!(ConstValue::String(Arc::from("3")).to_number(), None);
    }

    #[test]
    fn reference_types() {
        assert!(DataType::String.is_reference());
        assert!(DataType::Any.is_reference());
        assert!(!DataType::Int.is_reference());
        assert!(!DataType::Bool.is_reference());
        assert!(DataType::Null.is_reference());
    }
}
