//! Exception handler regions.

use crate::ir::{BlockId, HandlerId, InstrId};
use abclift_abc::TypeRef;
use abclift_entity::packed_option::PackedOption;
use abclift_entity::pool::ListHandle;

/// One exception handler with its try region.
///
/// After region-tree construction the try intervals of all handlers form a
/// forest of strictly nested half-open intervals over instruction ids.
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    /// First instruction covered by the try region.
    pub try_start: InstrId,
    /// One past the last covered instruction (an instruction index, possibly
    /// one past the end of the arena).
    pub try_end: u32,
    /// Catch target instruction.
    pub catch_target: InstrId,
    /// Enclosing handler, if nested.
    pub parent: PackedOption<HandlerId>,
    /// The caught type; `Any` catches everything.
    pub caught_type: TypeRef,
    /// Catch-target block ids of this handler and each ancestor, root-last.
    pub catch_block_chain: ListHandle<BlockId>,
    /// Index of the originating exception_info record. Declared order breaks
    /// sorting ties and reaches back to the raw record.
    pub exc_index: u32,
}

impl ExceptionHandler {
    /// Does the try region cover `instr`?
    pub fn covers(&self, instr: InstrId) -> bool {
        use abclift_entity::EntityRef;
        (instr.index() as u32) >= self.try_start.as_u32() && (instr.index() as u32) < self.try_end
    }
}
