//! The back-end instruction stream interface.
//!
//! The generator talks to the emitter exclusively through [`IlBuilder`]:
//! label create/mark, local declare/acquire/release, instruction emit, and
//! exception-handler scoping. [`RecordingBuilder`] captures the stream for
//! tests and for back-ends that post-process whole methods.

use crate::ir::{IlLabel, IlVar};
use abclift_entity::EntityRef;

/// Machine-level value kinds the back-end distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IlType {
    /// Boolean.
    Bool,
    /// 32-bit signed integer.
    I32,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit float.
    F64,
    /// String reference.
    Str,
    /// Object reference.
    Ref,
    /// Boxed dynamic value (`*`).
    Any,
}

/// Comparison conditions. The `N`-prefixed forms are the NaN-inverted
/// branches of the source ISA and stay distinct so the back-end can pick the
/// right float predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater or equal.
    Ge,
    /// Not less than (true on NaN).
    Nlt,
    /// Not less or equal (true on NaN).
    Nle,
    /// Not greater than (true on NaN).
    Ngt,
    /// Not greater or equal (true on NaN).
    Nge,
    /// Strict equality.
    StrictEq,
    /// Strict inequality.
    StrictNe,
}

/// Width of a global-memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    /// 8-bit integer.
    I8,
    /// 16-bit integer.
    I16,
    /// 32-bit integer.
    I32,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl MemWidth {
    /// Byte count of one access.
    pub fn bytes(self) -> i32 {
        match self {
            MemWidth::I8 => 1,
            MemWidth::I16 => 2,
            MemWidth::I32 | MemWidth::F32 => 4,
            MemWidth::F64 => 8,
        }
    }
}

/// A mangled back-end symbol.
pub type Symbol = Box<str>;

/// Calls into the runtime support library for operations without a static
/// lowering. Argument counts ride along where variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Helper {
    /// Reflective property read; the literal name rides on the stack.
    GetPropertyLate,
    /// Reflective property write.
    SetPropertyLate,
    /// Reflective property delete.
    DeletePropertyLate,
    /// Reflective call with `argc` arguments.
    CallPropertyLate(u32),
    /// Reflective construct with `argc` arguments.
    ConstructLate(u32),
    /// Scope-chain walk; `true` throws on a miss.
    FindProperty(bool),
    /// XML descendants operator.
    GetDescendants,
    /// Numeric-index read on a container.
    GetIndex,
    /// Numeric-index write.
    SetIndex,
    /// Numeric-index delete.
    DeleteIndex,
    /// Slot read by id.
    GetSlot(u32),
    /// Slot write by id.
    SetSlot(u32),
    /// Global slot read.
    GetGlobalSlot(u32),
    /// Global slot write.
    SetGlobalSlot(u32),
    /// Call a file-local method by index.
    CallStatic(u32, u32),
    /// Call by dispatch id.
    CallMethodId(u32, u32),
    /// Invoke a super method resolved at runtime.
    CallSuperLate(u32),
    /// Invoke the parent constructor.
    ConstructSuper(u32),
    /// The `typeof` operator.
    TypeOfValue,
    /// The `instanceof` operator.
    InstanceOfOp,
    /// `istype` with a runtime class.
    IsTypeLate,
    /// `astype` with a runtime class.
    AsTypeLate,
    /// The `in` operator.
    InOp,
    /// `hasnext` iteration probe.
    HasNext,
    /// `hasnext2`; both locals passed by address.
    HasNext2,
    /// Iteration name fetch.
    NextName,
    /// Iteration value fetch.
    NextValue,
    /// E4X filter validity check.
    CheckFilter,
    /// XML element text escape.
    EscXmlElem,
    /// XML attribute text escape.
    EscXmlAttr,
    /// `new Array` from `argc` stacked items.
    NewArray(u32),
    /// `new Array(length)`.
    NewArrayWithLength,
    /// Object literal from `argc` key/value pairs.
    NewObject(u32),
    /// Activation object for the current method.
    NewActivation,
    /// Catch-scope object for exception record `index`.
    NewCatch(u32),
    /// Closure over method `index`.
    NewFunction(u32),
    /// Class object from class-info `index`; base class on the stack.
    NewClassObj(u32),
    /// Parameterize a generic type with `argc` stacked parameters.
    ApplyType(u32),
    /// Construct a parameterized vector with `argc` arguments.
    VectorCtor(u32),
    /// Concatenate exactly `n` strings (specialized up to 4).
    ConcatStrings(u32),
    /// Concatenate `n` strings through an array.
    ConcatStringArray(u32),
    /// `Math.min`.
    MathMin,
    /// `Math.max`.
    MathMax,
    /// `Math.abs`.
    MathAbs,
    /// `String.charAt`.
    StringCharAt,
    /// `String.charCodeAt`.
    StringCharCodeAt,
    /// Set the default XML namespace from a constant string.
    SetDxns(u32),
    /// Set the default XML namespace from the stack.
    SetDxnsLate,
    /// The global-scope object.
    LoadGlobal,
    /// Push onto the runtime scope chain.
    ScopePush,
    /// Push a `with` scope onto the runtime scope chain.
    ScopePushWith,
    /// Pop the runtime scope chain.
    ScopePop,
    /// Base address of the global memory span.
    MemBase,
    /// Length of the global memory span.
    MemSize,
    /// Throw an argument-count error.
    ThrowArgCountError,
    /// Throw a class-not-instantiable error.
    ThrowNotInstantiable,
    /// Throw a range error (memory bounds).
    ThrowRangeError,
    /// Throw an illegal-default-xml-namespace error.
    ThrowIllegalDxns,
    /// Argument `i`, or its declared default when the caller omitted it.
    OptionalArg(u32),
    /// Collect excess arguments into the `rest` array.
    CollectRest,
    /// Materialize the legacy `arguments` array.
    CollectArguments,
}

/// One back-end instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum IlOp {
    /// No operation.
    Nop,
    /// Push a 32-bit integer constant.
    LdcI4(i32),
    /// Push an unsigned 32-bit constant.
    LdcU4(u32),
    /// Push a float constant.
    LdcR8(f64),
    /// Push a string constant.
    LdStr(Box<str>),
    /// Push a namespace constant by URI.
    LdNamespace(Box<str>),
    /// Push a boolean constant.
    LdBool(bool),
    /// Push `null`.
    LdNull,
    /// Push `undefined`.
    LdUndefined,
    /// Duplicate the top of stack.
    Dup,
    /// Discard the top of stack.
    Pop,
    /// Exchange the two topmost values.
    Swap,
    /// Load the incoming argument with the given local index (0 = `this`).
    LdArg(u32),
    /// Load a local variable.
    LdLoc(IlVar),
    /// Load the address of a local variable.
    LdLocA(IlVar),
    /// Store to a local variable.
    StLoc(IlVar),
    /// Unconditional branch.
    Br(IlLabel),
    /// Branch when the popped boolean is true.
    BrTrue(IlLabel),
    /// Branch when the popped boolean is false.
    BrFalse(IlLabel),
    /// Compare two values of the given type and branch on the condition.
    BrCmp(CmpOp, IlType, IlLabel),
    /// Jump table on the popped index; out-of-range falls through.
    Switch(Vec<IlLabel>),
    /// Return the popped value.
    Ret,
    /// Return from a void method.
    RetVoid,
    /// Throw the popped value.
    ThrowVal,
    /// Typed addition.
    Add(IlType),
    /// Typed subtraction.
    Sub(IlType),
    /// Typed multiplication.
    Mul(IlType),
    /// Float division.
    Div,
    /// Float remainder.
    Rem,
    /// Typed negation.
    Neg(IlType),
    /// Left shift.
    Shl,
    /// Arithmetic right shift.
    Shr,
    /// Logical right shift.
    UShr,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Bitwise complement.
    BitNot,
    /// Boolean negation.
    BoolNot,
    /// Compare two values, pushing a boolean.
    Cmp(CmpOp, IlType),
    /// Convert between machine types.
    Conv(IlType, IlType),
    /// ECMA ToString: `null` and `undefined` become text.
    ConvertString,
    /// `coerce_s`: `null` and `undefined` pass through unchanged.
    CoerceString,
    /// Checked downcast to a class.
    CastClass(Symbol),
    /// Checked cast to an interface.
    CastInterface(Symbol),
    /// Type test pushing a boolean.
    IsInst(Symbol),
    /// Load a class object.
    LdClass(Symbol),
    /// Read an instance field.
    LdField(Symbol),
    /// Write an instance field.
    StField(Symbol),
    /// Read a static field.
    LdStaticField(Symbol),
    /// Write a static field.
    StStaticField(Symbol),
    /// Call an instance method with `argc` arguments plus receiver.
    CallMethod(Symbol, u32),
    /// Call a static method with `argc` arguments.
    CallStaticMethod(Symbol, u32),
    /// Construct an instance with `argc` arguments.
    NewObj(Symbol, u32),
    /// Call into the runtime support library.
    CallHelper(Helper),
    /// Load from global memory at the popped address.
    LoadMem(MemWidth),
    /// Store the popped value to global memory at the popped address.
    StoreMem(MemWidth),
    /// Sign-extend the popped integer from the given bit width.
    SignExtend(u8),
    /// Terminate a filter clause with the popped verdict.
    EndFilter,
}

impl IlOp {
    /// Is this a plain constant push (candidate for `dup` folding)?
    pub fn is_const_push(&self) -> bool {
        match self {
            IlOp::LdcI4(_)
            | IlOp::LdcU4(_)
            | IlOp::LdcR8(_)
            | IlOp::LdStr(_)
            | IlOp::LdNamespace(_)
            | IlOp::LdBool(_)
            | IlOp::LdNull
            | IlOp::LdUndefined => true,
            _ => false,
        }
    }
}

/// The back-end emitter interface.
pub trait IlBuilder {
    /// Create an unmarked label.
    fn create_label(&mut self) -> IlLabel;

    /// Mark `label` at the current emission point.
    fn mark_label(&mut self, label: IlLabel);

    /// Declare a method-lifetime local variable.
    fn declare_local(&mut self, ty: IlType, name: Option<&str>) -> IlVar;

    /// Acquire a scratch local. Must be released on all exit paths, in LIFO
    /// order.
    fn acquire_temp(&mut self, ty: IlType) -> IlVar;

    /// Release a scratch local acquired with `acquire_temp`.
    fn release_temp(&mut self, var: IlVar);

    /// Append an instruction to the stream.
    fn emit(&mut self, op: IlOp);

    /// Open the protected region of the method.
    fn begin_try(&mut self);

    /// Close the protected region and open the filter clause.
    fn begin_filter(&mut self);

    /// Close the filter clause and open the handler body.
    fn begin_filtered_catch(&mut self);

    /// Close the exception construct.
    fn end_try(&mut self);
}

/// One event in a recorded stream.
#[derive(Debug, Clone, PartialEq)]
pub enum IlEvent {
    /// An emitted instruction.
    Op(IlOp),
    /// A label marked here.
    Mark(IlLabel),
    /// `begin_try`.
    BeginTry,
    /// `begin_filter`.
    BeginFilter,
    /// `begin_filtered_catch`.
    BeginCatch,
    /// `end_try`.
    EndTry,
}

/// An `IlBuilder` that records the stream in memory.
#[derive(Debug, Default)]
pub struct RecordingBuilder {
    /// The recorded event stream, in emission order.
    pub events: Vec<IlEvent>,
    labels: u32,
    locals: u32,
    free_temps: Vec<(IlType, IlVar)>,
    live_temps: u32,
}

impl RecordingBuilder {
    /// A fresh, empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The emitted instructions, without marks and scoping events.
    pub fn ops(&self) -> Vec<&IlOp> {
        self.events
            .iter()
            .filter_map(|e| match e {
                IlEvent::Op(op) => Some(op),
                _ => None,
            })
            .collect()
    }

    /// Count occurrences of instructions matching `pred`.
    pub fn count_ops(&self, pred: impl Fn(&IlOp) -> bool) -> usize {
        self.ops().into_iter().filter(|op| pred(op)).count()
    }

    /// Number of locals declared or acquired over the method.
    pub fn local_count(&self) -> u32 {
        self.locals
    }

    /// Temps still unreleased; zero after a well-formed method.
    pub fn outstanding_temps(&self) -> u32 {
        self.live_temps
    }
}

impl IlBuilder for RecordingBuilder {
    fn create_label(&mut self) -> IlLabel {
        let label = IlLabel::new(self.labels as usize);
        self.labels += 1;
        label
    }

    fn mark_label(&mut self, label: IlLabel) {
        self.events.push(IlEvent::Mark(label));
    }

    fn declare_local(&mut self, _ty: IlType, _name: Option<&str>) -> IlVar {
        let var = IlVar::new(self.locals as usize);
        self.locals += 1;
        var
    }

    fn acquire_temp(&mut self, ty: IlType) -> IlVar {
        self.live_temps += 1;
        if let Some(pos) = self.free_temps.iter().rposition(|&(t, _)| t == ty) {
            return self.free_temps.remove(pos).1;
        }
        let var = IlVar::new(self.locals as usize);
        self.locals += 1;
        var
    }

    fn release_temp(&mut self, var: IlVar) {
        debug_assert!(self.live_temps > 0, "release without acquire");
        self.live_temps -= 1;
        self.free_temps.push((IlType::Any, var));
    }

    fn emit(&mut self, op: IlOp) {
        self.events.push(IlEvent::Op(op));
    }

    fn begin_try(&mut self) {
        self.events.push(IlEvent::BeginTry);
    }

    fn begin_filter(&mut self) {
        self.events.push(IlEvent::BeginFilter);
    }

    fn begin_filtered_catch(&mut self) {
        self.events.push(IlEvent::BeginCatch);
    }

    fn end_try(&mut self) {
        self.events.push(IlEvent::EndTry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_round_trip() {
        let mut b = RecordingBuilder::new();
        let l = b.create_label();
        b.emit(IlOp::LdcI4(42));
        b.mark_label(l);
        b.emit(IlOp::Br(l));
        assert_eq!(b.ops().len(), 2);
        assert_eq!(b.events.len(), 3);
    }

    #[test]
    fn temps_are_reused() {
        let mut b = RecordingBuilder::new();
        let t0 = b.acquire_temp(IlType::Any);
        b.release_temp(t0);
        let t1 = b.acquire_temp(IlType::Any);
        assert_eq!(t0, t1);
        b.release_temp(t1);
        assert_eq!(b.outstanding_temps(), 0);
    }

    #[test]
    fn const_push_classification() {
        assert!(IlOp::LdcI4(1).is_const_push());
        assert!(IlOp::LdNull.is_const_push());
        assert!(!IlOp::Dup.is_const_push());
        assert!(!IlOp::LdLoc(IlVar::new(0)).is_const_push());
    }
}
