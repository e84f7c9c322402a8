//! Basic blocks and CFG edge references.

use crate::ir::{BlockId, HandlerId, InstrId, NodeId};
use abclift_entity::packed_option::{PackedOption, ReservedValue};
use abclift_entity::pool::{DynList, ListHandle};

/// How a basic block exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Control continues in the (single) successor; the block ended because
    /// the next instruction starts another block.
    Fall,
    /// Unconditional `jump`.
    Jump,
    /// Conditional branch; targets are ⟨taken, fallthrough⟩.
    Branch,
    /// `lookupswitch`; targets are ⟨default, case 0, .., case N⟩.
    Switch,
    /// `returnvalue` / `returnvoid`.
    Return,
    /// `throw`.
    Throw,
}

/// Per-block flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags(u8);

impl BlockFlags {
    const VISITED: u8 = 1 << 0;
    const DEFINES_PHI: u8 = 1 << 1;
    const REACHABLE: u8 = 1 << 2;

    /// Has the flow assembler walked this block's instructions?
    pub fn is_visited(self) -> bool {
        self.0 & Self::VISITED != 0
    }

    /// Does this block define phi nodes at its entry?
    pub fn defines_phi(self) -> bool {
        self.0 & Self::DEFINES_PHI != 0
    }

    /// Is this block reachable from the entry or a live catch target?
    pub fn is_reachable(self) -> bool {
        self.0 & Self::REACHABLE != 0
    }

    /// Mark walked.
    pub fn set_visited(&mut self) {
        self.0 |= Self::VISITED;
    }

    /// Mark as defining phis.
    pub fn set_defines_phi(&mut self) {
        self.0 |= Self::DEFINES_PHI;
    }

    /// Mark reachable.
    pub fn set_reachable(&mut self) {
        self.0 |= Self::REACHABLE;
    }
}

/// A compact reference to a CFG predecessor: the synthetic start node, a
/// basic block, or the catch edge of an exception handler.
///
/// Two tag bits in the high end of the word discriminate; the remaining 30
/// bits index the block or handler arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CfgNodeRef(u32);

const TAG_SHIFT: u32 = 30;
const TAG_START: u32 = 0;
const TAG_BLOCK: u32 = 1;
const TAG_CATCH: u32 = 2;
const INDEX_MASK: u32 = (1 << TAG_SHIFT) - 1;

/// An expanded `CfgNodeRef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgNode {
    /// The synthetic method entry.
    Start,
    /// A basic block.
    Block(BlockId),
    /// The exception edge of a handler.
    Catch(HandlerId),
}

impl CfgNodeRef {
    /// The synthetic start node.
    pub fn start() -> Self {
        CfgNodeRef(TAG_START << TAG_SHIFT)
    }

    /// A block predecessor.
    pub fn block(block: BlockId) -> Self {
        debug_assert!(block.0 <= INDEX_MASK);
        CfgNodeRef((TAG_BLOCK << TAG_SHIFT) | block.0)
    }

    /// A catch-edge predecessor.
    pub fn catch(handler: HandlerId) -> Self {
        debug_assert!(handler.0 <= INDEX_MASK);
        CfgNodeRef((TAG_CATCH << TAG_SHIFT) | handler.0)
    }

    /// Expand into the three-way view.
    pub fn expand(self) -> CfgNode {
        let index = self.0 & INDEX_MASK;
        match self.0 >> TAG_SHIFT {
            TAG_START => CfgNode::Start,
            TAG_BLOCK => CfgNode::Block(BlockId(index)),
            TAG_CATCH => CfgNode::Catch(HandlerId(index)),
            _ => unreachable!("corrupt CfgNodeRef"),
        }
    }

    /// The block, if this references one.
    pub fn as_block(self) -> Option<BlockId> {
        match self.expand() {
            CfgNode::Block(b) => Some(b),
            _ => None,
        }
    }

    /// Is this a synthetic (non-block) reference?
    pub fn is_virtual(self) -> bool {
        self.as_block().is_none()
    }
}

impl Default for CfgNodeRef {
    fn default() -> Self {
        CfgNodeRef::start()
    }
}

impl ReservedValue for CfgNodeRef {
    fn reserved_value() -> Self {
        CfgNodeRef(u32::max_value())
    }
}

impl std::fmt::Debug for CfgNodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.expand() {
            CfgNode::Start => write!(f, "start"),
            CfgNode::Block(b) => write!(f, "{}", b),
            CfgNode::Catch(h) => write!(f, "catch({})", h),
        }
    }
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// First instruction.
    pub first_instr: InstrId,
    /// Number of instructions. Zero until the flow assembler walks the
    /// block.
    pub instr_count: u32,
    /// How the block exits.
    pub exit: ExitKind,
    /// Exit targets, in the order dictated by `exit`.
    pub exits: ListHandle<BlockId>,
    /// Entry points: predecessor blocks and catch edges.
    pub entry_points: DynList<CfgNodeRef>,
    /// Postorder number. Meaningful once the dominator pass ran.
    pub postorder: u32,
    /// Immediate dominator; `Start` for the entry block and catch entries.
    pub idom: PackedOption<CfgNodeRef>,
    /// Innermost enclosing exception handler.
    pub handler: PackedOption<HandlerId>,
    /// Operand-stack node ids at block entry, bottom to top.
    pub entry_stack: ListHandle<NodeId>,
    /// Scope-stack node ids at block entry, outermost first.
    pub entry_scope: ListHandle<NodeId>,
    /// Local-slot node ids at block entry.
    pub entry_locals: ListHandle<NodeId>,
    /// Flags.
    pub flags: BlockFlags,
}

impl BasicBlock {
    /// A block headed by `first_instr`, not yet walked.
    pub fn new(first_instr: InstrId, entry_points: DynList<CfgNodeRef>) -> Self {
        BasicBlock {
            first_instr,
            instr_count: 0,
            exit: ExitKind::Fall,
            exits: ListHandle::empty(),
            entry_points,
            postorder: 0,
            idom: Default::default(),
            handler: Default::default(),
            entry_stack: ListHandle::empty(),
            entry_scope: ListHandle::empty(),
            entry_locals: ListHandle::empty(),
            flags: Default::default(),
        }
    }

    /// One past the last instruction of the block.
    pub fn end_instr(&self) -> u32 {
        self.first_instr.0 + self.instr_count
    }

    /// Does the block contain `instr`?
    pub fn contains(&self, instr: InstrId) -> bool {
        instr.0 >= self.first_instr.0 && instr.0 < self.end_instr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abclift_entity::EntityRef;

    #[test]
    fn cfg_node_ref_roundtrip() {
        assert_eq!(CfgNodeRef::start().expand(), CfgNode::Start);
        assert_eq!(
            CfgNodeRef::block(BlockId::new(7)).expand(),
            CfgNode::Block(BlockId::new(7))
        );
        assert_eq!(
            CfgNodeRef::catch(HandlerId::new(3)).expand(),
            CfgNode::Catch(HandlerId::new(3))
        );
        assert!(CfgNodeRef::start().is_virtual());
        assert!(CfgNodeRef::catch(HandlerId::new(0)).is_virtual());
        assert_eq!(
            CfgNodeRef::block(BlockId::new(9)).as_block(),
            Some(BlockId::new(9))
        );
    }
}
