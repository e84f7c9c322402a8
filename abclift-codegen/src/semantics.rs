//! The semantic analyzer.
//!
//! Binds every property-naming instruction to a `ResolvedProperty` — a trait,
//! a numeric-index access, a recognized intrinsic, or a runtime lookup — and
//! drives type inference from the bindings: a `getproperty` resolved to a
//! typed field takes the field's type, a `callproperty` resolved to a method
//! takes its return type, and so on. Resolution and typing feed each other
//! (a refined receiver type can re-resolve a later access), so the pass
//! iterates with the shared type-fixup until nothing moves.
//!
//! Argument-count mismatches against known signatures and construction of
//! non-instantiable classes are not compile errors; they are recorded and
//! lowered by the generator to thrown runtime errors.

use crate::compilation::{MethodCompilation, RuntimeFailure};
use crate::dataflow;
use crate::error::{CompileError, CompileResult, ErrorCode};
use crate::ir::node::DataType;
use crate::ir::{
    IndexProp, InstrId, Intrinsic, NodeId, ResolutionKind, ResolvedProperty, TraitRef,
};
use crate::timing;
use abclift_abc::{Builtin, ClassId, Multiname, Op, TraitKind, TypeRef};
use log::{debug, trace};

/// Run resolution and type inference to a fixed point.
pub fn run(comp: &mut MethodCompilation) -> CompileResult<()> {
    let _tt = timing::semantics();
    for round in 0..10 {
        let mut changed = false;
        for i in comp.instrs.keys().collect::<Vec<InstrId>>() {
            if !comp.instrs[i].flags.is_reached() {
                continue;
            }
            changed |= analyze_instr(comp, i)?;
        }
        dataflow::fixup_types(comp);
        if !changed {
            debug!("semantics settled after {} rounds", round + 1);
            break;
        }
    }
    tag_string_concat_operands(comp);
    Ok(())
}

/// What an access site does with the property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Get,
    Set,
    Call(u32),
    Construct(u32),
    Delete,
}

fn analyze_instr(comp: &mut MethodCompilation, i: InstrId) -> CompileResult<bool> {
    let op = comp.instrs[i].op;
    match op {
        Op::GetProperty => property_access(comp, i, Access::Get, 0),
        Op::SetProperty | Op::InitProperty => property_access(comp, i, Access::Set, 1),
        Op::DeleteProperty => property_access(comp, i, Access::Delete, 0),
        Op::CallProperty | Op::CallPropLex | Op::CallPropVoid => {
            let argc = comp.instrs[i].argc();
            property_access(comp, i, Access::Call(argc), argc)
        }
        Op::ConstructProp => {
            let argc = comp.instrs[i].argc();
            property_access(comp, i, Access::Construct(argc), argc)
        }
        Op::GetSuper => super_access(comp, i, Access::Get, 0),
        Op::SetSuper => super_access(comp, i, Access::Set, 1),
        Op::CallSuper | Op::CallSuperVoid => {
            let argc = comp.instrs[i].argc();
            super_access(comp, i, Access::Call(argc), argc)
        }
        Op::FindPropStrict | Op::FindProperty | Op::FindDef | Op::GetLex => find_access(comp, i),
        Op::GetSlot | Op::SetSlot => slot_access(comp, i),
        Op::GetGlobalSlot | Op::SetGlobalSlot => global_slot_access(comp, i),
        Op::Coerce | Op::AsType | Op::IsType => type_op(comp, i),
        Op::Construct => construct_value(comp, i),
        Op::Call => call_value(comp, i),
        Op::ConstructSuper => construct_super(comp, i),
        _ => Ok(false),
    }
}

/// The multiname of `i`, or a hard error if the pool index is bad.
fn multiname_of<'a>(comp: &'a MethodCompilation, i: InstrId) -> CompileResult<&'a Multiname> {
    let index = comp.instrs[i].name_index();
    comp.env
        .multiname(index)
        .ok_or_else(|| CompileError::at(ErrorCode::InvalidConstantPoolIndex, i))
}

/// Split the popped operand list of a property op into
/// ⟨object, runtime-ns, runtime-name⟩ node ids.
///
/// Layout bottom-to-top is ⟨object, ns?, name?, trailing...⟩ where trailing
/// is the written value or the call arguments.
fn name_operands(
    comp: &MethodCompilation,
    i: InstrId,
    mn: &Multiname,
    trailing: u32,
) -> (NodeId, Option<NodeId>, Option<NodeId>) {
    let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
    let upper = pops.len() - trailing as usize;
    let mut cursor = upper;
    let rt_name = if mn.has_runtime_name() {
        cursor -= 1;
        Some(pops[cursor])
    } else {
        None
    };
    let rt_ns = if mn.has_runtime_ns() {
        cursor -= 1;
        Some(pops[cursor])
    } else {
        None
    };
    (pops[cursor - 1], rt_ns, rt_name)
}

/// The class a value of `ty` is searched through, plus whether the search
/// runs over the static trait table.
fn class_of_type(comp: &MethodCompilation, ty: DataType) -> Option<(ClassId, bool)> {
    let builtin = |b: Builtin| Some((comp.registry.builtin(b), false));
    match ty {
        DataType::Object(c) => Some((c, false)),
        DataType::This(Some(c)) => Some((c, false)),
        DataType::Class(Some(c)) => Some((c, true)),
        DataType::Int => builtin(Builtin::Int),
        DataType::Uint => builtin(Builtin::Uint),
        DataType::Number => builtin(Builtin::Number),
        DataType::Bool => builtin(Builtin::Boolean),
        DataType::String => builtin(Builtin::String),
        DataType::Namespace => builtin(Builtin::Namespace),
        DataType::QName => builtin(Builtin::QName),
        DataType::Function => builtin(Builtin::Function),
        DataType::Rest => builtin(Builtin::Array),
        DataType::Global => builtin(Builtin::Global),
        _ => None,
    }
}

fn property_access(
    comp: &mut MethodCompilation,
    i: InstrId,
    access: Access,
    trailing: u32,
) -> CompileResult<bool> {
    let mn = multiname_of(comp, i)?.clone();
    let (obj, rt_ns, rt_name) = name_operands(comp, i, &mn, trailing);
    let obj_ty = comp.nodes[obj].ty;

    let (kind, result) = resolve(comp, i, obj_ty, &mn, rt_name, access);

    // A write through a typed field or setter converts the value on push,
    // provided the value feeds nothing else.
    if access == Access::Set {
        if let Some(t) = kind.trait_ref() {
            let declared = {
                let class = comp.registry.class(t.class);
                let table = if t.is_static {
                    &class.static_traits
                } else {
                    &class.traits
                };
                table[t.index as usize].read_type()
            };
            let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
            let value = pops[pops.len() - 1];
            if let TypeRef::Class(_) = declared {
                let single_use = comp.refs.len(comp.nodes[value].uses) == 1;
                if single_use && comp.nodes[value].on_push_coerce.is_none() {
                    let target = comp.data_type(declared);
                    if comp.nodes[value].ty != target {
                        comp.nodes[value].on_push_coerce = Some(target);
                    }
                }
            }
        }
    }

    let prop = ResolvedProperty {
        object_type: obj_ty,
        rt_ns_type: rt_ns.map(|n| comp.nodes[n].ty),
        rt_name_type: rt_name.map(|n| comp.nodes[n].ty),
        object_class: class_of_type(comp, obj_ty).map(|(c, _)| c),
        kind,
    };
    finish(comp, i, prop, result)
}

/// Core binding logic shared by the property-access forms.
fn resolve(
    comp: &mut MethodCompilation,
    i: InstrId,
    obj_ty: DataType,
    mn: &Multiname,
    rt_name: Option<NodeId>,
    access: Access,
) -> (ResolutionKind, DataType) {
    let class = class_of_type(comp, obj_ty);

    // Numeric-index access wins when the container supports it.
    if let Some((c, false)) = class {
        if let Some(index_access) = comp.registry.class(c).index_access {
            let numeric_rt = rt_name.map_or(false, |n| comp.nodes[n].ty.is_numeric());
            let literal = !mn.has_runtime_name() && mn.index_literal().is_some();
            if numeric_rt || literal {
                let value_type = index_access.element_type;
                let prop = IndexProp {
                    value_type,
                    may_be_hole: index_access.may_be_hole,
                };
                let result = match access {
                    Access::Get => {
                        if index_access.may_be_hole {
                            DataType::Any
                        } else {
                            comp.data_type(value_type)
                        }
                    }
                    Access::Delete => DataType::Bool,
                    _ => DataType::Any,
                };
                return (ResolutionKind::Index(prop), result);
            }
        }
    }

    if mn.attribute || mn.has_runtime_name() || mn.has_runtime_ns() {
        return (ResolutionKind::Runtime, DataType::Any);
    }

    let (c, is_static) = match class {
        Some(pair) => pair,
        None => return (ResolutionKind::Runtime, DataType::Any),
    };

    match comp.registry.find_trait(c, mn, is_static) {
        Some((declaring, index)) => {
            let trait_ref = TraitRef {
                class: declaring,
                index: index as u32,
                is_static,
            };
            bind_trait(comp, i, trait_ref, access)
        }
        None => {
            if let Some(intr) = loose_intrinsic(comp, obj_ty, mn, access) {
                return intr;
            }
            trace!("{}: no trait for {} on class, falling back to runtime", i, mn);
            (ResolutionKind::Runtime, DataType::Any)
        }
    }
}

/// A trait was found; decide how the access goes through it.
fn bind_trait(
    comp: &mut MethodCompilation,
    i: InstrId,
    trait_ref: TraitRef,
    access: Access,
) -> (ResolutionKind, DataType) {
    let entry = {
        let class = comp.registry.class(trait_ref.class);
        let table = if trait_ref.is_static {
            &class.static_traits
        } else {
            &class.traits
        };
        table[trait_ref.index as usize].clone()
    };

    match access {
        Access::Get => {
            let ty = match &entry.kind {
                TraitKind::Method { .. } => DataType::Function,
                _ => comp.data_type(entry.read_type()),
            };
            (ResolutionKind::Trait(trait_ref), ty)
        }
        Access::Delete => (ResolutionKind::Trait(trait_ref), DataType::Bool),
        Access::Set => match &entry.kind {
            TraitKind::Field { .. } | TraitKind::Setter { .. } => {
                (ResolutionKind::Trait(trait_ref), DataType::Undefined)
            }
            // Writing over a method or class binding dispatches at runtime.
            _ => (ResolutionKind::TraitRtInvoke(trait_ref), DataType::Undefined),
        },
        Access::Call(argc) => match &entry.kind {
            TraitKind::Method { sig, .. } => {
                if let Some(intr) = method_intrinsic(comp, &entry.header.name, trait_ref, argc) {
                    return intr;
                }
                if !sig.accepts_argc(argc) {
                    comp.runtime_failures[i] = Some(RuntimeFailure::ArgCountMismatch {
                        expected_min: sig.required_argc(),
                        expected_max: if sig.has_rest {
                            None
                        } else {
                            Some(sig.params.len() as u32)
                        },
                        actual: argc,
                    });
                }
                (
                    ResolutionKind::Trait(trait_ref),
                    comp.data_type(sig.return_type),
                )
            }
            // Calling through a field or accessor value dispatches at
            // runtime even though the trait itself is known.
            _ => (ResolutionKind::TraitRtInvoke(trait_ref), DataType::Any),
        },
        Access::Construct(argc) => match &entry.kind {
            TraitKind::InnerClass { class } => {
                construct_class_result(comp, i, *class, argc)
            }
            _ => (ResolutionKind::TraitRtInvoke(trait_ref), DataType::Any),
        },
    }
}

/// Static intrinsics recognized by trait identity.
fn method_intrinsic(
    comp: &MethodCompilation,
    name: &str,
    trait_ref: TraitRef,
    argc: u32,
) -> Option<(ResolutionKind, DataType)> {
    let number = DataType::Number;
    let declaring = comp.registry.class(trait_ref.class).builtin?;
    match (declaring, name, argc, trait_ref.is_static) {
        (Builtin::Math, "min", 2, true) => Some((
            ResolutionKind::Intrinsic(Intrinsic::MathMin),
            number,
        )),
        (Builtin::Math, "max", 2, true) => Some((
            ResolutionKind::Intrinsic(Intrinsic::MathMax),
            number,
        )),
        (Builtin::Math, "abs", 1, true) => Some((
            ResolutionKind::Intrinsic(Intrinsic::MathAbs),
            number,
        )),
        (Builtin::String, "charAt", 1, false) => Some((
            ResolutionKind::Intrinsic(Intrinsic::StringCharAt),
            DataType::String,
        )),
        (Builtin::String, "charCodeAt", 1, false) => Some((
            ResolutionKind::Intrinsic(Intrinsic::StringCharCodeAt),
            number,
        )),
        _ => None,
    }
}

/// Calls that are not traits at all but still recognized: boxing conversions
/// through the class objects of the primitive types, whether the callee is
/// the class object itself or the class name looked up on the global scope.
fn loose_intrinsic(
    comp: &MethodCompilation,
    obj_ty: DataType,
    mn: &Multiname,
    access: Access,
) -> Option<(ResolutionKind, DataType)> {
    match (obj_ty, access) {
        (DataType::Class(Some(c)), Access::Call(1)) => boxing_intrinsic(comp, c),
        (DataType::Global, Access::Call(1)) => {
            let c = comp.registry.class_by_multiname(mn)?.class()?;
            boxing_intrinsic(comp, c)
        }
        _ => None,
    }
}

fn boxing_intrinsic(
    comp: &MethodCompilation,
    class: ClassId,
) -> Option<(ResolutionKind, DataType)> {
    match comp.registry.class(class).builtin? {
        Builtin::Int => Some((ResolutionKind::Intrinsic(Intrinsic::IntBox), DataType::Int)),
        Builtin::Uint => Some((ResolutionKind::Intrinsic(Intrinsic::UintBox), DataType::Uint)),
        Builtin::Number => Some((
            ResolutionKind::Intrinsic(Intrinsic::NumberBox),
            DataType::Number,
        )),
        Builtin::Boolean => Some((
            ResolutionKind::Intrinsic(Intrinsic::BooleanBox),
            DataType::Bool,
        )),
        Builtin::String => Some((
            ResolutionKind::Intrinsic(Intrinsic::StringBox),
            DataType::String,
        )),
        _ => None,
    }
}

/// Result of constructing `class` with `argc` arguments.
fn construct_class_result(
    comp: &mut MethodCompilation,
    i: InstrId,
    class: ClassId,
    argc: u32,
) -> (ResolutionKind, DataType) {
    let descriptor = comp.registry.class(class);
    let instantiable = descriptor.instantiable && !descriptor.is_interface;
    let builtin = descriptor.builtin;
    let accepts = descriptor.ctor.accepts_argc(argc);
    let required = descriptor.ctor.required_argc();
    let max = if descriptor.ctor.has_rest {
        None
    } else {
        Some(descriptor.ctor.params.len() as u32)
    };
    let is_vector = descriptor.vector_element.is_some();

    if !instantiable {
        comp.runtime_failures[i] = Some(RuntimeFailure::NotInstantiable);
        return (ResolutionKind::Runtime, DataType::Object(class));
    }
    if !accepts {
        comp.runtime_failures[i] = Some(RuntimeFailure::ArgCountMismatch {
            expected_min: required,
            expected_max: max,
            actual: argc,
        });
    }

    let kind = match builtin {
        Some(Builtin::Array) if argc == 1 => ResolutionKind::Intrinsic(Intrinsic::ArrayWithLength),
        Some(Builtin::Array) => ResolutionKind::Intrinsic(Intrinsic::ArrayOfItems),
        _ if is_vector => ResolutionKind::Intrinsic(Intrinsic::VectorCtor),
        _ => ResolutionKind::Runtime,
    };
    (kind, DataType::Object(class))
}

fn super_access(
    comp: &mut MethodCompilation,
    i: InstrId,
    access: Access,
    trailing: u32,
) -> CompileResult<bool> {
    let mn = multiname_of(comp, i)?.clone();
    let (obj, rt_ns, rt_name) = name_operands(comp, i, &mn, trailing);
    let obj_ty = comp.nodes[obj].ty;

    // Super lookups search the parent of the receiver's class.
    let parent = comp
        .env
        .receiver()
        .and_then(|c| comp.registry.class(c).parent);
    let (kind, result) = match parent {
        Some(parent) => resolve(comp, i, DataType::Object(parent), &mn, rt_name, access),
        None => (ResolutionKind::Runtime, DataType::Any),
    };
    let prop = ResolvedProperty {
        object_type: obj_ty,
        rt_ns_type: rt_ns.map(|n| comp.nodes[n].ty),
        rt_name_type: rt_name.map(|n| comp.nodes[n].ty),
        object_class: parent,
        kind,
    };
    finish(comp, i, prop, result)
}

/// Resolve a scope-walk lookup. The result value of the `find` forms is the
/// object holding the property; `getlex` goes on to read it.
fn find_access(comp: &mut MethodCompilation, i: InstrId) -> CompileResult<bool> {
    let op = comp.instrs[i].op;
    let mn = multiname_of(comp, i)?.clone();

    let mut kind = ResolutionKind::Runtime;
    let mut holder_ty = DataType::Global;
    let mut object_class = None;

    if !mn.has_runtime_name() && !mn.has_runtime_ns() {
        match find_in_scopes(comp, i, &mn) {
            ScopeHit::Found { scope_ty, trait_ref } => {
                kind = ResolutionKind::Trait(trait_ref);
                holder_ty = scope_ty;
                object_class = Some(trait_ref.class);
            }
            ScopeHit::Barrier => {}
            ScopeHit::Miss => {
                // A type name resolving through the registry covers lexical
                // references to classes (`getlex String`).
                if let Some(TypeRef::Class(c)) = comp.registry.class_by_multiname(&mn) {
                    let result = match op {
                        Op::GetLex => DataType::Class(Some(c)),
                        _ => DataType::Global,
                    };
                    let prop = ResolvedProperty {
                        object_type: DataType::Global,
                        rt_ns_type: None,
                        rt_name_type: None,
                        object_class: Some(c),
                        kind: ResolutionKind::Intrinsic(Intrinsic::ClassObject),
                    };
                    return finish(comp, i, prop, result);
                }
            }
        }
    }

    let result = match op {
        Op::GetLex => match kind {
            ResolutionKind::Trait(t) => {
                let (_, ty) = bind_trait(comp, i, t, Access::Get);
                ty
            }
            _ => DataType::Any,
        },
        _ => holder_ty,
    };
    let prop = ResolvedProperty {
        object_type: holder_ty,
        rt_ns_type: None,
        rt_name_type: None,
        object_class,
        kind,
    };
    finish(comp, i, prop, result)
}

enum ScopeHit {
    Found {
        scope_ty: DataType,
        trait_ref: TraitRef,
    },
    Barrier,
    Miss,
}

/// Walk the recorded scope stack innermost-first. A `with` scope blocks all
/// compile-time resolution below it.
fn find_in_scopes(comp: &MethodCompilation, i: InstrId, mn: &Multiname) -> ScopeHit {
    let scopes = &comp.scope_at[i];
    for &scope in scopes.iter().rev() {
        if comp.nodes[scope].flags.is_with_scope() {
            return ScopeHit::Barrier;
        }
        let ty = comp.nodes[scope].ty;
        if let Some((c, is_static)) = class_of_type(comp, ty) {
            if let Some((declaring, index)) = comp.registry.find_trait(c, mn, is_static) {
                return ScopeHit::Found {
                    scope_ty: ty,
                    trait_ref: TraitRef {
                        class: declaring,
                        index: index as u32,
                        is_static,
                    },
                };
            }
        } else {
            // Unknown scope type: anything could live here.
            return ScopeHit::Barrier;
        }
    }
    ScopeHit::Miss
}

/// `getslot`/`setslot` resolve by fixed slot id on the object's class.
fn slot_access(comp: &mut MethodCompilation, i: InstrId) -> CompileResult<bool> {
    let slot = match comp.instrs[i].data {
        crate::ir::InstrData::Slot(slot) => slot,
        _ => unreachable!(),
    };
    let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
    let obj = pops[0];
    let obj_ty = comp.nodes[obj].ty;

    let mut kind = ResolutionKind::Runtime;
    let mut result = DataType::Any;
    if let Some((c, is_static)) = class_of_type(comp, obj_ty) {
        if let Some((declaring, index, ty)) = find_slot_trait(comp, c, is_static, slot) {
            kind = ResolutionKind::Trait(TraitRef {
                class: declaring,
                index,
                is_static,
            });
            result = comp.data_type(ty);
        }
    }
    let prop = ResolvedProperty {
        object_type: obj_ty,
        rt_ns_type: None,
        rt_name_type: None,
        object_class: class_of_type(comp, obj_ty).map(|(c, _)| c),
        kind,
    };
    let result = if comp.instrs[i].op == Op::GetSlot {
        result
    } else {
        DataType::Undefined
    };
    finish(comp, i, prop, result)
}

fn find_slot_trait(
    comp: &MethodCompilation,
    class: ClassId,
    is_static: bool,
    slot: u32,
) -> Option<(ClassId, u32, TypeRef)> {
    let mut cur = Some(class);
    while let Some(c) = cur {
        let descriptor = comp.registry.class(c);
        let table = if is_static {
            &descriptor.static_traits
        } else {
            &descriptor.traits
        };
        for (index, entry) in table.iter().enumerate() {
            if let TraitKind::Field { ty, slot: Some(s), .. } = &entry.kind {
                if *s == slot {
                    return Some((c, index as u32, *ty));
                }
            }
        }
        cur = descriptor.parent;
    }
    None
}

fn global_slot_access(comp: &mut MethodCompilation, i: InstrId) -> CompileResult<bool> {
    // The global object's layout is not modeled; these stay runtime lookups.
    let prop = ResolvedProperty {
        object_type: DataType::Global,
        rt_ns_type: None,
        rt_name_type: None,
        object_class: Some(comp.registry.builtin(Builtin::Global)),
        kind: ResolutionKind::Runtime,
    };
    let result = if comp.instrs[i].op == Op::GetGlobalSlot {
        DataType::Any
    } else {
        DataType::Undefined
    };
    finish(comp, i, prop, result)
}

/// `coerce`, `astype`, `istype` with a compile-time type name.
fn type_op(comp: &mut MethodCompilation, i: InstrId) -> CompileResult<bool> {
    let mn = multiname_of(comp, i)?.clone();
    let resolved = comp.registry.class_by_multiname(&mn);
    let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
    let obj_ty = comp.nodes[pops[0]].ty;

    let (kind, object_class) = match resolved {
        Some(TypeRef::Class(c)) => {
            let intr = if comp.instrs[i].op == Op::IsType {
                Intrinsic::ClassTest
            } else {
                Intrinsic::ClassCast
            };
            (ResolutionKind::Intrinsic(intr), Some(c))
        }
        _ => (ResolutionKind::Runtime, None),
    };
    let result = match comp.instrs[i].op {
        Op::IsType => DataType::Bool,
        _ => match object_class {
            Some(c) => comp.data_type(TypeRef::Class(c)),
            None => DataType::Any,
        },
    };
    let prop = ResolvedProperty {
        object_type: obj_ty,
        rt_ns_type: None,
        rt_name_type: None,
        object_class,
        kind,
    };
    finish(comp, i, prop, result)
}

/// `construct` through a value: bind by the constructor operand's type.
fn construct_value(comp: &mut MethodCompilation, i: InstrId) -> CompileResult<bool> {
    let argc = comp.instrs[i].argc();
    let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
    let ctor = pops[pops.len() - 1 - argc as usize];
    let ctor_ty = comp.nodes[ctor].ty;

    let (kind, result) = match ctor_ty {
        DataType::Class(Some(c)) => construct_class_result(comp, i, c, argc),
        _ => (ResolutionKind::Runtime, DataType::Any),
    };
    let prop = ResolvedProperty {
        object_type: ctor_ty,
        rt_ns_type: None,
        rt_name_type: None,
        object_class: match ctor_ty {
            DataType::Class(c) => c,
            _ => None,
        },
        kind,
    };
    finish(comp, i, prop, result)
}

/// `call` through a value: recognize primitive boxing, otherwise runtime.
fn call_value(comp: &mut MethodCompilation, i: InstrId) -> CompileResult<bool> {
    let argc = comp.instrs[i].argc();
    let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
    let func = pops[pops.len() - 2 - argc as usize];
    let func_ty = comp.nodes[func].ty;

    let (kind, result) = match func_ty {
        DataType::Class(Some(c)) if argc == 1 => boxing_intrinsic(comp, c)
            .unwrap_or((ResolutionKind::Runtime, DataType::Any)),
        _ => (ResolutionKind::Runtime, DataType::Any),
    };
    let prop = ResolvedProperty {
        object_type: func_ty,
        rt_ns_type: None,
        rt_name_type: None,
        object_class: match func_ty {
            DataType::Class(c) => c,
            _ => None,
        },
        kind,
    };
    finish(comp, i, prop, result)
}

/// `constructsuper` checks the parent constructor's arity.
fn construct_super(comp: &mut MethodCompilation, i: InstrId) -> CompileResult<bool> {
    let argc = comp.instrs[i].argc();
    let parent = comp
        .env
        .receiver()
        .and_then(|c| comp.registry.class(c).parent);
    if let Some(parent) = parent {
        let ctor = comp.registry.class(parent).ctor.clone();
        if !ctor.accepts_argc(argc) && comp.runtime_failures[i].is_none() {
            comp.runtime_failures[i] = Some(RuntimeFailure::ArgCountMismatch {
                expected_min: ctor.required_argc(),
                expected_max: if ctor.has_rest {
                    None
                } else {
                    Some(ctor.params.len() as u32)
                },
                actual: argc,
            });
        }
    }
    Ok(false)
}

/// Intern the record, attach it, and retype the pushed node. Returns whether
/// anything changed so the caller can iterate to a fixed point.
fn finish(
    comp: &mut MethodCompilation,
    i: InstrId,
    prop: ResolvedProperty,
    result: DataType,
) -> CompileResult<bool> {
    let id = comp.intern_prop(prop);
    let mut changed = comp.instrs[i].resolved_prop.expand() != Some(id);
    comp.instrs[i].resolved_prop = id.into();

    if let Some(node) = comp.instrs[i].pushed_node.expand() {
        if !comp.nodes[node].flags.is_constant() && comp.nodes[node].ty != result {
            // Never degrade a type that a previous round refined.
            if result != DataType::Any || comp.nodes[node].ty == DataType::Unknown {
                comp.nodes[node].ty = result;
                changed = true;
            }
        }
    }
    Ok(changed)
}

/// Operands of a string-typed `add` that are not strings themselves convert
/// on push (`null` becomes `"null"`, `undefined` becomes `"undefined"`).
fn tag_string_concat_operands(comp: &mut MethodCompilation) {
    for i in comp.instrs.keys().collect::<Vec<InstrId>>() {
        if comp.instrs[i].op != Op::Add {
            continue;
        }
        let out = match comp.instrs[i].pushed_node.expand() {
            Some(out) => out,
            None => continue,
        };
        if comp.nodes[out].ty != DataType::String {
            continue;
        }
        let pops: Vec<NodeId> = comp
            .node_lists
            .get(comp.instrs[i].popped_nodes)
            .to_vec();
        for p in pops {
            if comp.nodes[p].ty != DataType::String {
                comp.nodes[p].flags.set_push_convert_string();
            }
        }
    }
}

/// The scope index a resolved `find` matched, for the generator.
pub(crate) fn matched_scope_index(comp: &MethodCompilation, i: InstrId) -> Option<usize> {
    let mn = comp.env.multiname(comp.instrs[i].name_index())?;
    let scopes = &comp.scope_at[i];
    for (k, &scope) in scopes.iter().enumerate().rev() {
        if comp.nodes[scope].flags.is_with_scope() {
            return None;
        }
        let ty = comp.nodes[scope].ty;
        if let Some((c, is_static)) = class_of_type(comp, ty) {
            if comp.registry.find_trait(c, mn, is_static).is_some() {
                return Some(k);
            }
        } else {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, domtree, exceptions, flowgraph};
    use abclift_abc::asm::Assembler;
    use abclift_abc::class::{Class, MethodSignature, TraitEntry, TraitHeader};
    use abclift_abc::env::{DummyEnvironment, DummyRegistry};
    use abclift_abc::ClassRegistry;
    use abclift_abc::name::Namespace;
    use abclift_entity::EntityRef;
    use std::sync::Arc;

    fn analyze<'a>(
        env: &'a DummyEnvironment,
        reg: &'a DummyRegistry,
    ) -> CompileResult<MethodCompilation<'a>> {
        let mut comp = MethodCompilation::new(env, reg);
        decode::run(&mut comp)?;
        flowgraph::run(&mut comp)?;
        exceptions::run(&mut comp)?;
        domtree::run(&mut comp);
        dataflow::run(&mut comp)?;
        run(&mut comp)?;
        Ok(comp)
    }

    fn field_trait(name: &str, ty: TypeRef) -> TraitEntry {
        TraitEntry {
            header: TraitHeader {
                ns: Namespace::public(),
                name: Arc::from(name),
                is_static: false,
                is_final: false,
            },
            kind: TraitKind::Field {
                ty,
                slot: Some(1),
                read_only: false,
            },
        }
    }

    #[test]
    fn typed_field_get_resolves_to_trait() {
        let mut reg = DummyRegistry::with_builtins();
        let int_t = TypeRef::Class(reg.builtin(Builtin::Int));
        let point = reg.add_class(Class::named("Point", Some(reg.builtin(Builtin::Object))));
        reg.class_mut(point).traits.push(field_trait("x", int_t));

        let mut env = DummyEnvironment::new();
        let x = env.add_public_name("x");
        let mut sig = MethodSignature::empty();
        sig.params = vec![TypeRef::Class(point)];
        sig.return_type = int_t;
        env.set_signature(sig);
        env.set_local_count(2);

        let mut asm = Assembler::new();
        asm.op(Op::GetLocal1);
        asm.op_u30(Op::GetProperty, x);
        asm.op(Op::ReturnValue);
        env.set_code(asm.finish());

        let comp = analyze(&env, &reg).unwrap();
        let get = InstrId::new(1);
        let prop = comp.instrs[get].resolved_prop.expand().unwrap();
        match comp.props[prop].kind {
            ResolutionKind::Trait(t) => {
                assert_eq!(t.class, point);
                assert!(!t.is_static);
            }
            ref other => panic!("expected trait, got {:?}", other),
        }
        // The read takes the declared field type.
        let out = comp.instrs[get].pushed_node.unwrap();
        assert_eq!(comp.nodes[out].ty, DataType::Int);
    }

    #[test]
    fn unknown_property_falls_back_to_runtime() {
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        let name = env.add_public_name("definitelyNotThere");
        let mut sig = MethodSignature::empty();
        sig.params = vec![TypeRef::Class(reg.builtin(Builtin::String))];
        sig.return_type = TypeRef::Any;
        env.set_signature(sig);
        env.set_local_count(2);

        let mut asm = Assembler::new();
        asm.op(Op::GetLocal1);
        asm.op_u30(Op::GetProperty, name);
        asm.op(Op::ReturnValue);
        env.set_code(asm.finish());

        let comp = analyze(&env, &reg).unwrap();
        let prop = comp.instrs[InstrId::new(1)].resolved_prop.expand().unwrap();
        assert_eq!(comp.props[prop].kind, ResolutionKind::Runtime);
        let out = comp.instrs[InstrId::new(1)].pushed_node.unwrap();
        assert_eq!(comp.nodes[out].ty, DataType::Any);
    }

    #[test]
    fn array_index_access_resolves_to_index() {
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        let name = env.add_public_name("3");
        let mut sig = MethodSignature::empty();
        sig.params = vec![TypeRef::Class(reg.builtin(Builtin::Array))];
        sig.return_type = TypeRef::Any;
        env.set_signature(sig);
        env.set_local_count(2);

        let mut asm = Assembler::new();
        asm.op(Op::GetLocal1);
        asm.op_u30(Op::GetProperty, name);
        asm.op(Op::ReturnValue);
        env.set_code(asm.finish());

        let comp = analyze(&env, &reg).unwrap();
        let prop = comp.instrs[InstrId::new(1)].resolved_prop.expand().unwrap();
        match comp.props[prop].kind {
            ResolutionKind::Index(p) => assert!(p.may_be_hole),
            ref other => panic!("expected index, got {:?}", other),
        }
    }

    #[test]
    fn math_min_is_intrinsic() {
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        let math = env.add_public_name("Math");
        let min = env.add_public_name("min");

        let mut asm = Assembler::new();
        asm.op(Op::GetLocal0);
        asm.op(Op::PushScope);
        asm.op_u30(Op::GetLex, math);
        asm.op_byte(Op::PushByte, 1);
        asm.op_byte(Op::PushByte, 2);
        asm.op_u30x2(Op::CallProperty, min, 2);
        asm.op(Op::ReturnValue);
        env.set_code(asm.finish());
        env.set_max_scope_depth(1);
        env.set_receiver(Some(reg.builtin(Builtin::Object)));

        let comp = analyze(&env, &reg).unwrap();
        // getlex Math resolves to the class object.
        let lex_out = comp.instrs[InstrId::new(2)].pushed_node.unwrap();
        assert_eq!(
            comp.nodes[lex_out].ty,
            DataType::Class(Some(reg.builtin(Builtin::Math)))
        );
        // The call resolves to the Math.min intrinsic and types as Number.
        let call = InstrId::new(5);
        let prop = comp.instrs[call].resolved_prop.expand().unwrap();
        assert_eq!(
            comp.props[prop].kind,
            ResolutionKind::Intrinsic(Intrinsic::MathMin)
        );
        let out = comp.instrs[call].pushed_node.unwrap();
        assert_eq!(comp.nodes[out].ty, DataType::Number);
    }

    #[test]
    fn arg_count_mismatch_is_lowered_not_fatal() {
        let mut reg = DummyRegistry::with_builtins();
        let int_t = TypeRef::Class(reg.builtin(Builtin::Int));
        let helper = reg.add_class(Class::named("Helper", Some(reg.builtin(Builtin::Object))));
        reg.class_mut(helper).traits.push(TraitEntry {
            header: TraitHeader {
                ns: Namespace::public(),
                name: Arc::from("twoArgs"),
                is_static: false,
                is_final: false,
            },
            kind: TraitKind::Method {
                sig: MethodSignature {
                    params: vec![int_t, int_t],
                    optional_from: None,
                    has_rest: false,
                    needs_arguments: false,
                    sets_dxns: false,
                    return_type: int_t,
                },
                disp: None,
            },
        });

        let mut env = DummyEnvironment::new();
        let name = env.add_public_name("twoArgs");
        let mut sig = MethodSignature::empty();
        sig.params = vec![TypeRef::Class(helper)];
        sig.return_type = TypeRef::Any;
        env.set_signature(sig);
        env.set_local_count(2);

        let mut asm = Assembler::new();
        asm.op(Op::GetLocal1);
        asm.op_byte(Op::PushByte, 1);
        asm.op_u30x2(Op::CallProperty, name, 1); // one arg instead of two
        asm.op(Op::ReturnValue);
        env.set_code(asm.finish());

        let comp = analyze(&env, &reg).unwrap();
        let call = InstrId::new(2);
        match comp.runtime_failures[call] {
            Some(RuntimeFailure::ArgCountMismatch {
                expected_min,
                actual,
                ..
            }) => {
                assert_eq!(expected_min, 2);
                assert_eq!(actual, 1);
            }
            ref other => panic!("expected arg-count failure, got {:?}", other),
        }
    }

    #[test]
    fn interface_construction_is_lowered() {
        let mut reg = DummyRegistry::with_builtins();
        let mut iface = Class::named("IThing", None);
        iface.is_interface = true;
        iface.instantiable = false;
        let iface = reg.add_class(iface);

        let mut env = DummyEnvironment::new();
        let name = env.add_public_name("IThing");

        let mut asm = Assembler::new();
        asm.op(Op::GetLocal0);
        asm.op(Op::PushScope);
        asm.op_u30(Op::GetLex, name);
        asm.op_u30(Op::Construct, 0);
        asm.op(Op::ReturnValue);
        env.set_code(asm.finish());
        env.set_max_scope_depth(1);
        env.set_receiver(Some(reg.builtin(Builtin::Object)));

        let comp = analyze(&env, &reg).unwrap();
        let construct = InstrId::new(3);
        assert_eq!(
            comp.runtime_failures[construct],
            Some(RuntimeFailure::NotInstantiable)
        );
        let _ = iface;
    }

    #[test]
    fn with_scope_blocks_resolution() {
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        let math = env.add_public_name("Math");

        let mut asm = Assembler::new();
        asm.op(Op::GetLocal0);
        asm.op(Op::PushWith);
        asm.op_u30(Op::FindPropStrict, math);
        asm.op(Op::ReturnValue);
        env.set_code(asm.finish());
        env.set_max_scope_depth(1);

        let comp = analyze(&env, &reg).unwrap();
        let find = InstrId::new(2);
        let prop = comp.instrs[find].resolved_prop.expand().unwrap();
        assert_eq!(comp.props[prop].kind, ResolutionKind::Runtime);
    }

    #[test]
    fn coerce_to_known_class() {
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        let string = env.add_public_name("String");

        let mut asm = Assembler::new();
        asm.op(Op::PushNull);
        asm.op_u30(Op::Coerce, string);
        asm.op(Op::ReturnValue);
        env.set_code(asm.finish());

        let comp = analyze(&env, &reg).unwrap();
        let coerce = InstrId::new(1);
        let prop = comp.instrs[coerce].resolved_prop.expand().unwrap();
        assert_eq!(
            comp.props[prop].kind,
            ResolutionKind::Intrinsic(Intrinsic::ClassCast)
        );
        let out = comp.instrs[coerce].pushed_node.unwrap();
        assert_eq!(comp.nodes[out].ty, DataType::String);
    }
}
