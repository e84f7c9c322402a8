//! The per-method compilation context.
//!
//! One `MethodCompilation` owns every arena the passes fill in. Passes run
//! strictly in sequence — decode, flow, exceptions, dominators, data flow,
//! semantic analysis, code generation — each reading the previous results and
//! appending its own. Nothing is shared between compilations except the
//! borrowed collaborators.

use crate::error::CompileResult;
use crate::ir::{
    BasicBlock, BlockId, CfgNodeRef, DataNode, ExceptionHandler, HandlerId, InstrId, Instruction,
    NodeId, NodeOrInstr, PropId, ResolutionKind, ResolvedProperty,
};
use crate::settings::Settings;
use crate::{codegen, dataflow, decode, domtree, exceptions, flowgraph, semantics};
use abclift_abc::{AbcEnvironment, ClassRegistry};
use abclift_entity::pool::{DynPool, ListPool};
use abclift_entity::{PrimaryMap, SecondaryMap};
use std::collections::HashMap;

use crate::il::IlBuilder;
use crate::ir::node::DataType;

/// A precondition failure detected at compile time and lowered to a thrown
/// runtime error, so the method still compiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeFailure {
    /// A call site supplied an argument count the resolved signature
    /// rejects.
    ArgCountMismatch {
        /// Fewest arguments the signature accepts.
        expected_min: u32,
        /// Most arguments the signature accepts, unless it has a rest
        /// parameter.
        expected_max: Option<u32>,
        /// What the site supplied.
        actual: u32,
    },
    /// `construct` against an interface or other non-instantiable class.
    NotInstantiable,
    /// `dxns`/`dxnslate` in a method not flagged as setting the default XML
    /// namespace.
    IllegalDefaultXmlNamespace,
}

/// Everything produced while compiling one method body.
pub struct MethodCompilation<'a> {
    /// The ABC side of the world: bytecode, pools, signature.
    pub env: &'a dyn AbcEnvironment,
    /// The resolved class hierarchy.
    pub registry: &'a dyn ClassRegistry,
    /// Compilation knobs.
    pub settings: Settings,

    /// Decoded instructions, in byte-offset order.
    pub instrs: PrimaryMap<InstrId, Instruction>,
    /// Basic blocks, in discovery order.
    pub blocks: PrimaryMap<BlockId, BasicBlock>,
    /// Exception handlers, in region-tree order.
    pub handlers: PrimaryMap<HandlerId, ExceptionHandler>,
    /// Data-flow nodes.
    pub nodes: PrimaryMap<NodeId, DataNode>,
    /// Interned resolved properties.
    pub props: PrimaryMap<PropId, ResolvedProperty>,

    /// Immutable block-id lists: exit targets, catch chains.
    pub block_lists: ListPool<BlockId>,
    /// Immutable node-id lists: entry snapshots, popped-operand lists.
    pub node_lists: ListPool<NodeId>,
    /// Immutable raw-offset lists: switch case tables.
    pub offset_lists: ListPool<i32>,
    /// Growable def/use reference lists.
    pub refs: DynPool<NodeOrInstr>,
    /// Growable entry-point sets.
    pub preds: DynPool<CfgNodeRef>,

    /// Per-block ⟨source, phi⟩ pairs the generator materializes at exits.
    pub exit_phi_sources: SecondaryMap<BlockId, Vec<(NodeId, NodeId)>>,
    /// Per-instruction lowered precondition failures.
    pub runtime_failures: SecondaryMap<InstrId, Option<RuntimeFailure>>,
    /// Scope-stack snapshot at each `findproperty`-family instruction.
    pub scope_at: SecondaryMap<InstrId, Vec<NodeId>>,

    prop_intern: HashMap<PropKey, PropId>,
}

impl<'a> std::fmt::Debug for MethodCompilation<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodCompilation").finish_non_exhaustive()
    }
}

impl<'a> MethodCompilation<'a> {
    /// A fresh compilation over `env` and `registry` with default settings.
    pub fn new(env: &'a dyn AbcEnvironment, registry: &'a dyn ClassRegistry) -> Self {
        MethodCompilation {
            env,
            registry,
            settings: Settings::default(),
            instrs: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            handlers: PrimaryMap::new(),
            nodes: PrimaryMap::new(),
            props: PrimaryMap::new(),
            block_lists: ListPool::new(),
            node_lists: ListPool::new(),
            offset_lists: ListPool::new(),
            refs: DynPool::new(),
            preds: DynPool::new(),
            exit_phi_sources: SecondaryMap::new(),
            runtime_failures: SecondaryMap::new(),
            scope_at: SecondaryMap::new(),
            prop_intern: HashMap::new(),
        }
    }

    /// Run every pass and emit IL through `il`.
    pub fn compile(&mut self, il: &mut dyn IlBuilder) -> CompileResult<()> {
        decode::run(self)?;
        flowgraph::run(self)?;
        exceptions::run(self)?;
        domtree::run(self);
        dataflow::run(self)?;
        semantics::run(self)?;
        codegen::run(self, il)
    }

    /// Find the instruction starting exactly at byte `offset`.
    ///
    /// Instruction ids are allocated in byte order, so this is a binary
    /// search over the arena.
    pub fn instr_at_offset(&self, offset: u32) -> Option<InstrId> {
        use abclift_entity::EntityRef;
        let mut lo = 0usize;
        let mut hi = self.instrs.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_off = self.instrs[InstrId::new(mid)].offset;
            if mid_off == offset {
                return Some(InstrId::new(mid));
            } else if mid_off < offset {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        None
    }

    /// Intern `prop`, returning the existing id for an identical record.
    pub fn intern_prop(&mut self, prop: ResolvedProperty) -> PropId {
        let key = PropKey::of(&prop);
        if let Some(&id) = self.prop_intern.get(&key) {
            return id;
        }
        let id = self.props.push(prop);
        self.prop_intern.insert(key, id);
        id
    }

    /// The entry stack of `block` as a slice.
    pub fn entry_stack(&self, block: BlockId) -> &[NodeId] {
        self.node_lists.get(self.blocks[block].entry_stack)
    }

    /// The entry scope stack of `block` as a slice.
    pub fn entry_scope(&self, block: BlockId) -> &[NodeId] {
        self.node_lists.get(self.blocks[block].entry_scope)
    }

    /// The entry locals of `block` as a slice.
    pub fn entry_locals(&self, block: BlockId) -> &[NodeId] {
        self.node_lists.get(self.blocks[block].entry_locals)
    }

    /// The exit targets of `block` as a slice.
    pub fn exit_blocks(&self, block: BlockId) -> &[BlockId] {
        self.block_lists.get(self.blocks[block].exits)
    }

    /// Record that `user` consumes `node`.
    pub fn add_use(&mut self, node: NodeId, user: NodeOrInstr) {
        let list = self.nodes[node].uses;
        self.refs.push(list, user);
    }

    /// Record that `def` defines `node`.
    pub fn add_def(&mut self, node: NodeId, def: NodeOrInstr) {
        let list = self.nodes[node].defs;
        self.refs.push(list, def);
    }

    /// Allocate a node with fresh def/use lists.
    pub fn new_node(&mut self, slot: crate::ir::SlotRef) -> NodeId {
        let defs = self.refs.alloc();
        let uses = self.refs.alloc();
        self.nodes.push(DataNode::new(slot, defs, uses))
    }

    /// The innermost handler covering `instr` via its block assignment.
    pub fn handler_of(&self, block: BlockId) -> Option<HandlerId> {
        self.blocks[block].handler.expand()
    }

    /// Node type of a registry type, unboxing the primitive classes to
    /// their machine tags.
    pub fn data_type(&self, ty: abclift_abc::TypeRef) -> DataType {
        use abclift_abc::{Builtin, TypeRef};
        match ty {
            TypeRef::Any => DataType::Any,
            TypeRef::Void => DataType::Undefined,
            TypeRef::Class(c) => match self.registry.class(c).builtin {
                Some(Builtin::Int) => DataType::Int,
                Some(Builtin::Uint) => DataType::Uint,
                Some(Builtin::Number) => DataType::Number,
                Some(Builtin::Boolean) => DataType::Bool,
                Some(Builtin::String) => DataType::String,
                Some(Builtin::Namespace) => DataType::Namespace,
                Some(Builtin::QName) => DataType::QName,
                Some(Builtin::Function) => DataType::Function,
                _ => DataType::Object(c),
            },
        }
    }
}

/// Hashable identity of a `ResolvedProperty` for interning.
#[derive(PartialEq, Eq, Hash, Clone, Copy)]
struct PropKey {
    object: TypeKey,
    rt_ns: Option<TypeKey>,
    rt_name: Option<TypeKey>,
    object_class: Option<u32>,
    kind: KindKey,
}

/// `DataType` without the float-hostile parts, for hashing.
#[derive(PartialEq, Eq, Hash, Clone, Copy)]
struct TypeKey(u8, u32);

impl TypeKey {
    fn of(ty: DataType) -> Self {
        let class = |c: Option<abclift_abc::ClassId>| c.map(|c| c.as_u32()).unwrap_or(u32::max_value());
        match ty {
            DataType::Unknown => TypeKey(0, 0),
            DataType::Any => TypeKey(1, 0),
            DataType::Undefined => TypeKey(2, 0),
            DataType::Null => TypeKey(3, 0),
            DataType::Bool => TypeKey(4, 0),
            DataType::Int => TypeKey(5, 0),
            DataType::Uint => TypeKey(6, 0),
            DataType::Number => TypeKey(7, 0),
            DataType::String => TypeKey(8, 0),
            DataType::Namespace => TypeKey(9, 0),
            DataType::QName => TypeKey(10, 0),
            DataType::Class(c) => TypeKey(11, class(c)),
            DataType::Function => TypeKey(12, 0),
            DataType::Object(c) => TypeKey(13, c.as_u32()),
            DataType::This(c) => TypeKey(14, class(c)),
            DataType::Rest => TypeKey(15, 0),
            DataType::Global => TypeKey(16, 0),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy)]
enum KindKey {
    Unknown,
    Trait(u32, u32, bool),
    Index(TypeKey, bool),
    Intrinsic(crate::ir::Intrinsic),
    Runtime,
    TraitRtInvoke(u32, u32, bool),
}

impl PropKey {
    fn of(prop: &ResolvedProperty) -> Self {
        let kind = match prop.kind {
            ResolutionKind::Unknown => KindKey::Unknown,
            ResolutionKind::Trait(t) => KindKey::Trait(t.class.as_u32(), t.index, t.is_static),
            ResolutionKind::Index(p) => {
                KindKey::Index(TypeKey::of(DataType::from_type_ref(p.value_type)), p.may_be_hole)
            }
            ResolutionKind::Intrinsic(i) => KindKey::Intrinsic(i),
            ResolutionKind::Runtime => KindKey::Runtime,
            ResolutionKind::TraitRtInvoke(t) => {
                KindKey::TraitRtInvoke(t.class.as_u32(), t.index, t.is_static)
            }
        };
        PropKey {
            object: TypeKey::of(prop.object_type),
            rt_ns: prop.rt_ns_type.map(TypeKey::of),
            rt_name: prop.rt_name_type.map(TypeKey::of),
            object_class: prop.object_class.map(|c| c.as_u32()),
            kind,
        }
    }
}

/// Dump the CFG of a compilation in a compact one-line-per-block format.
///
/// Diagnostic only; tests match on fragments of it.
pub fn dump_blocks(comp: &MethodCompilation) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for (id, block) in comp.blocks.iter() {
        let _ = write!(
            out,
            "{}: instrs {}..{} {:?} ->",
            id,
            block.first_instr,
            block.end_instr(),
            block.exit
        );
        for &succ in comp.block_lists.get(block.exits) {
            let _ = write!(out, " {}", succ);
        }
        if let Some(h) = block.handler.expand() {
            let _ = write!(out, " [in {}]", h);
        }
        let _ = writeln!(out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IndexProp, TraitRef};
    use abclift_abc::env::{DummyEnvironment, DummyRegistry};
    use abclift_abc::TypeRef;

    #[test]
    fn prop_interning_dedupes() {
        let env = DummyEnvironment::new();
        let reg = DummyRegistry::with_builtins();
        let mut comp = MethodCompilation::new(&env, &reg);

        let a = comp.intern_prop(ResolvedProperty::unknown(DataType::Any));
        let b = comp.intern_prop(ResolvedProperty::unknown(DataType::Any));
        assert_eq!(a, b);

        let c = comp.intern_prop(ResolvedProperty::unknown(DataType::Int));
        assert_ne!(a, c);

        let t = TraitRef {
            class: reg.builtin(abclift_abc::Builtin::String),
            index: 0,
            is_static: false,
        };
        let d = comp.intern_prop(ResolvedProperty {
            object_type: DataType::String,
            rt_ns_type: None,
            rt_name_type: None,
            object_class: Some(t.class),
            kind: ResolutionKind::Trait(t),
        });
        let e = comp.intern_prop(ResolvedProperty {
            object_type: DataType::String,
            rt_ns_type: None,
            rt_name_type: None,
            object_class: Some(t.class),
            kind: ResolutionKind::Trait(t),
        });
        assert_eq!(d, e);
        assert_eq!(comp.props.len(), 3);

        let f = comp.intern_prop(ResolvedProperty {
            object_type: DataType::String,
            rt_ns_type: None,
            rt_name_type: Some(DataType::Int),
            object_class: Some(t.class),
            kind: ResolutionKind::Index(IndexProp {
                value_type: TypeRef::Any,
                may_be_hole: true,
            }),
        });
        assert_ne!(d, f);
    }
}
