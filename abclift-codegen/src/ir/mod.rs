//! The intermediate representation of one method compilation.
//!
//! Definitions are split per entity: instructions, basic blocks, exception
//! handlers, data-flow nodes, and resolved properties. The arenas that own
//! them live on `MethodCompilation`.

mod block;
mod entities;
mod handler;
mod instruction;
pub mod node;
mod resolved;

pub use self::block::{BasicBlock, BlockFlags, CfgNode, CfgNodeRef, ExitKind};
pub use self::entities::{BlockId, HandlerId, IlLabel, IlVar, InstrId, NodeId, PropId};
pub use self::handler::ExceptionHandler;
pub use self::instruction::{InstrData, InstrFlags, Instruction, NodeOrInstr, SwitchTable};
pub use self::node::{ConstValue, DataNode, DataType, NodeFlags, SlotKind, SlotRef};
pub use self::resolved::{IndexProp, Intrinsic, ResolutionKind, ResolvedProperty, TraitRef};
