//! The control-flow assembler.
//!
//! Walks the decoded instruction stream block by block from a worklist of
//! block heads, discovering basic blocks, exit edges, and predecessor sets.
//! A block ends at a control-transfer opcode or where the next instruction is
//! already the head of another block.
//!
//! A branch into the middle of an already-walked block splits it: the tail
//! becomes a new block inheriting the original's exit, and the original is
//! retargeted as a jump to the tail. Splitting invalidates previously fetched
//! block ids, so target resolution works in two rounds — first ensure every
//! target is a block head, then read the final ids back off the head table.

use crate::compilation::MethodCompilation;
use crate::error::{CompileError, CompileResult, ErrorCode};
use crate::ir::{BasicBlock, BlockId, CfgNodeRef, ExitKind, InstrData, InstrId};
use crate::timing;
use abclift_abc::Op;
use abclift_entity::EntityRef;
use log::{debug, trace};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Build the CFG from the method entry.
pub fn run(comp: &mut MethodCompilation) -> CompileResult<()> {
    let _tt = timing::flowgraph();
    let mut flow = Flow::attach(comp);
    let entry = InstrId::new(0);
    flow.reach(comp, entry)?;
    let entry_block = flow.heads[&entry];
    add_entry_point(comp, entry_block, CfgNodeRef::start());
    debug!("flowgraph: {} blocks", comp.blocks.len());
    Ok(())
}

/// Incremental flow-assembly state, reattachable after other passes have
/// added blocks.
pub(crate) struct Flow {
    heads: HashMap<InstrId, BlockId>,
}

impl Flow {
    /// Attach to the blocks already present in `comp`.
    pub fn attach(comp: &MethodCompilation) -> Flow {
        Flow {
            heads: comp
                .blocks
                .iter()
                .map(|(id, b)| (b.first_instr, id))
                .collect(),
        }
    }

    /// Make `seed` reachable: ensure it heads a block and walk everything
    /// reachable from it that has not been walked yet.
    pub fn reach(&mut self, comp: &mut MethodCompilation, seed: InstrId) -> CompileResult<()> {
        let mut worklist: Vec<InstrId> = Vec::new();
        self.block_at(comp, seed, &mut worklist)?;
        while let Some(head) = worklist.pop() {
            let block = self.heads[&head];
            if comp.blocks[block].flags.is_visited() {
                continue;
            }
            self.walk(comp, block, &mut worklist)?;
        }
        Ok(())
    }

    /// Ensure a block boundary at `instr`, splitting if needed.
    ///
    /// `instr` must already have been walked.
    pub fn boundary(
        &mut self,
        comp: &mut MethodCompilation,
        instr: InstrId,
    ) -> CompileResult<BlockId> {
        let mut worklist = Vec::new();
        let block = self.block_at(comp, instr, &mut worklist)?;
        debug_assert!(worklist.is_empty(), "boundary in unwalked code");
        Ok(block)
    }

    /// Return the block starting at `instr`, creating or splitting as
    /// needed. Fresh (unwalked) blocks are pushed onto `worklist`.
    fn block_at(
        &mut self,
        comp: &mut MethodCompilation,
        instr: InstrId,
        worklist: &mut Vec<InstrId>,
    ) -> CompileResult<BlockId> {
        if let Some(&block) = self.heads.get(&instr) {
            return Ok(block);
        }
        comp.instrs[instr].flags.set_starts_block();

        if let Some(owner) = comp.instrs[instr].block.expand() {
            return Ok(self.split(comp, owner, instr));
        }

        let preds = comp.preds.alloc();
        let block = comp.blocks.push(BasicBlock::new(instr, preds));
        self.heads.insert(instr, block);
        worklist.push(instr);
        Ok(block)
    }

    /// Split `owner` so that `at` heads a new block holding the tail.
    fn split(&mut self, comp: &mut MethodCompilation, owner: BlockId, at: InstrId) -> BlockId {
        debug_assert!(comp.blocks[owner].flags.is_visited());
        debug_assert!(comp.blocks[owner].contains(at));
        debug_assert!(comp.blocks[owner].first_instr != at);

        let owner_first = comp.blocks[owner].first_instr;
        let owner_end = comp.blocks[owner].end_instr();
        let old_exit = comp.blocks[owner].exit;
        let old_exits = comp.blocks[owner].exits;

        let preds = comp.preds.alloc();
        let mut tail = BasicBlock::new(at, preds);
        tail.instr_count = owner_end - at.as_u32();
        tail.exit = old_exit;
        tail.exits = old_exits;
        tail.flags.set_visited();
        if comp.blocks[owner].flags.is_reachable() {
            tail.flags.set_reachable();
        }
        let tail_id = comp.blocks.push(tail);

        // The outgoing edges now originate from the tail.
        for i in 0..comp.block_lists.get(old_exits).len() {
            let succ = comp.block_lists.get(old_exits)[i];
            let list = comp.blocks[succ].entry_points;
            comp.preds
                .replace(list, CfgNodeRef::block(owner), CfgNodeRef::block(tail_id));
        }
        for i in at.as_u32()..owner_end {
            comp.instrs[InstrId::new(i as usize)].block = tail_id.into();
        }

        // Retarget the shrunk original as a jump to the tail.
        let owner_block = &mut comp.blocks[owner];
        owner_block.instr_count = at.as_u32() - owner_first.as_u32();
        owner_block.exit = ExitKind::Jump;
        let exits = comp.block_lists.alloc(&[tail_id]);
        comp.blocks[owner].exits = exits;
        comp.instrs[InstrId::new(at.index() - 1)].flags.set_ends_block();
        add_entry_point(comp, tail_id, CfgNodeRef::block(owner));

        self.heads.insert(at, tail_id);
        trace!("split {} at {} -> {}", owner, at, tail_id);
        tail_id
    }

    /// Walk the instructions of `block` until it ends, resolving exits.
    fn walk(
        &mut self,
        comp: &mut MethodCompilation,
        block: BlockId,
        worklist: &mut Vec<InstrId>,
    ) -> CompileResult<()> {
        comp.blocks[block].flags.set_visited();
        comp.blocks[block].flags.set_reachable();

        let mut i = comp.blocks[block].first_instr;
        loop {
            if comp.instrs[i].flags.is_invalid_opcode() {
                return Err(CompileError::at(ErrorCode::InvalidOpcodeReachable, i));
            }
            comp.instrs[i].block = block.into();
            comp.instrs[i].flags.set_reached();
            comp.blocks[block].instr_count += 1;

            let op = comp.instrs[i].op;
            if op.is_block_end() {
                comp.instrs[i].flags.set_ends_block();
                if op.is_terminator() {
                    comp.instrs[i].flags.set_terminator();
                }
                self.resolve_exit(comp, i, worklist)?;
                return Ok(());
            }

            let next = InstrId::new(i.index() + 1);
            if !comp.instrs.is_valid(next) {
                return Err(CompileError::at(ErrorCode::CodeFalloffEndOfMethod, i));
            }
            if let Some(&succ) = self.heads.get(&next) {
                // Ran into an existing block head: fall through to it.
                comp.instrs[i].flags.set_ends_block();
                let cur = comp.instrs[i].block.unwrap();
                comp.blocks[cur].exit = ExitKind::Fall;
                let exits = comp.block_lists.alloc(&[succ]);
                comp.blocks[cur].exits = exits;
                add_entry_point(comp, succ, CfgNodeRef::block(cur));
                return Ok(());
            }
            i = next;
        }
    }

    /// Resolve the control transfer at `i` into exit kind, exit targets, and
    /// predecessor edges.
    fn resolve_exit(
        &mut self,
        comp: &mut MethodCompilation,
        i: InstrId,
        worklist: &mut Vec<InstrId>,
    ) -> CompileResult<()> {
        let op = comp.instrs[i].op;
        let next_offset = next_instr_offset(comp, i);

        // Collect target instructions first; block ids are only read back
        // after every split has happened.
        let mut targets: SmallVec<[InstrId; 4]> = SmallVec::new();
        let exit = match op {
            Op::Jump => {
                let rel = comp.instrs[i].branch_offset();
                targets.push(resolve_target(comp, i, next_offset, rel)?);
                ExitKind::Jump
            }
            Op::ReturnValue | Op::ReturnVoid => ExitKind::Return,
            Op::Throw => ExitKind::Throw,
            Op::LookupSwitch => {
                let table = match comp.instrs[i].data {
                    InstrData::Switch(table) => table,
                    _ => unreachable!("lookupswitch payload"),
                };
                let base = comp.instrs[i].offset;
                for idx in 0..comp.offset_lists.get(table.targets).len() {
                    let rel = comp.offset_lists.get(table.targets)[idx];
                    targets.push(resolve_target(comp, i, base, rel)?);
                }
                ExitKind::Switch
            }
            _ => {
                debug_assert!(op.is_conditional_branch());
                let rel = comp.instrs[i].branch_offset();
                targets.push(resolve_target(comp, i, next_offset, rel)?);
                // A branch off the end of the body is an error.
                let fall = InstrId::new(i.index() + 1);
                if !comp.instrs.is_valid(fall) {
                    return Err(CompileError::at(ErrorCode::CodeFalloffEndOfMethod, i));
                }
                targets.push(fall);
                ExitKind::Branch
            }
        };

        for &target in &targets {
            self.block_at(comp, target, worklist)?;
        }

        // Re-read everything after the splits: the block containing `i` may
        // itself have been split.
        let cur = comp.instrs[i].block.unwrap();
        let exit_blocks: SmallVec<[BlockId; 4]> =
            targets.iter().map(|t| self.heads[t]).collect();
        comp.blocks[cur].exit = exit;
        let exits = comp.block_lists.alloc(&exit_blocks);
        comp.blocks[cur].exits = exits;
        for &succ in &exit_blocks {
            add_entry_point(comp, succ, CfgNodeRef::block(cur));
        }
        Ok(())
    }
}

/// Record `pred` as an entry point of `block`, deduplicating.
pub(crate) fn add_entry_point(comp: &mut MethodCompilation, block: BlockId, pred: CfgNodeRef) {
    let list = comp.blocks[block].entry_points;
    if !comp.preds.contains(list, pred) {
        comp.preds.push(list, pred);
    }
}

fn next_instr_offset(comp: &MethodCompilation, i: InstrId) -> u32 {
    let next = InstrId::new(i.index() + 1);
    if comp.instrs.is_valid(next) {
        comp.instrs[next].offset
    } else {
        comp.env.code().len() as u32
    }
}

/// Resolve a branch displacement to the instruction starting at the computed
/// offset.
fn resolve_target(
    comp: &MethodCompilation,
    from: InstrId,
    base: u32,
    rel: i32,
) -> CompileResult<InstrId> {
    let target = base as i64 + rel as i64;
    if target < 0 {
        return Err(CompileError::at(ErrorCode::InvalidBranchTarget, from));
    }
    if target >= comp.env.code().len() as i64 {
        return Err(CompileError::at(ErrorCode::CodeFalloffEndOfMethod, from));
    }
    comp.instr_at_offset(target as u32)
        .ok_or_else(|| CompileError::at(ErrorCode::InvalidBranchTarget, from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode;
    use abclift_abc::asm::Assembler;
    use abclift_abc::env::{DummyEnvironment, DummyRegistry};

    fn build(code: Vec<u8>) -> CompileResult<(DummyEnvironment, DummyRegistry)> {
        // Helper kept trivial so tests can hold the compilation themselves.
        let mut env = DummyEnvironment::new();
        env.set_code(code);
        Ok((env, DummyRegistry::with_builtins()))
    }

    fn assemble<'a>(
        env: &'a DummyEnvironment,
        reg: &'a DummyRegistry,
    ) -> CompileResult<MethodCompilation<'a>> {
        let mut comp = MethodCompilation::new(env, reg);
        decode::run(&mut comp)?;
        run(&mut comp)?;
        Ok(comp)
    }

    #[test]
    fn straight_line_is_one_block() {
        let mut asm = Assembler::new();
        asm.op(Op::GetLocal0);
        asm.op(Op::GetLocal1);
        asm.op(Op::Add);
        asm.op(Op::ReturnValue);
        let (env, reg) = build(asm.finish()).unwrap();
        let comp = assemble(&env, &reg).unwrap();

        assert_eq!(comp.blocks.len(), 1);
        let entry = BlockId::new(0);
        let block = &comp.blocks[entry];
        assert_eq!(block.exit, ExitKind::Return);
        assert_eq!(block.instr_count, 4);
        for (id, instr) in comp.instrs.iter() {
            assert_eq!(instr.block.expand(), Some(entry), "{}", id);
            assert!(instr.flags.is_reached());
        }
        // Predecessor set of the entry block is just the start marker.
        assert_eq!(
            comp.preds.get(block.entry_points),
            &[CfgNodeRef::start()]
        );
    }

    #[test]
    fn conditional_makes_three_blocks() {
        // S2 from the system tests: getlocal_0; pushbyte 0; ifgt L1;
        // pushint 1; returnvalue; L1: pushint 2; returnvalue
        let mut asm = Assembler::new();
        asm.op(Op::GetLocal0);
        asm.op_byte(Op::PushByte, 0);
        let l1 = asm.label();
        asm.branch(Op::IfGt, l1);
        asm.op_byte(Op::PushByte, 1);
        asm.op(Op::ReturnValue);
        asm.place(l1);
        asm.op_byte(Op::PushByte, 2);
        asm.op(Op::ReturnValue);
        let (env, reg) = build(asm.finish()).unwrap();
        let comp = assemble(&env, &reg).unwrap();

        assert_eq!(comp.blocks.len(), 3);
        let b0 = &comp.blocks[BlockId::new(0)];
        assert_eq!(b0.exit, ExitKind::Branch);
        // Targets are ⟨taken, fallthrough⟩.
        let exits = comp.block_lists.get(b0.exits);
        assert_eq!(exits.len(), 2);
        let taken = &comp.blocks[exits[0]];
        let fall = &comp.blocks[exits[1]];
        assert_eq!(comp.instrs[taken.first_instr].offset, 10);
        assert_eq!(comp.instrs[fall.first_instr].offset, 7);
        assert_eq!(taken.exit, ExitKind::Return);
        assert_eq!(fall.exit, ExitKind::Return);
    }

    #[test]
    fn successors_know_their_predecessors() {
        let mut asm = Assembler::new();
        asm.op(Op::GetLocal0);
        let l1 = asm.label();
        asm.branch(Op::IfTrue, l1);
        asm.op(Op::ReturnVoid);
        asm.place(l1);
        asm.op(Op::ReturnVoid);
        let (env, reg) = build(asm.finish()).unwrap();
        let comp = assemble(&env, &reg).unwrap();

        for (id, block) in comp.blocks.iter() {
            for &succ in comp.block_lists.get(block.exits) {
                assert!(
                    comp.preds
                        .contains(comp.blocks[succ].entry_points, CfgNodeRef::block(id)),
                    "{} missing from preds of {}",
                    id,
                    succ
                );
            }
        }
    }

    #[test]
    fn backward_jump_splits_current_block() {
        // A loop entirely inside what starts as one block: the backward jump
        // targets an instruction of the block being walked.
        let mut asm = Assembler::new();
        asm.op(Op::Nop);
        let top = asm.here();
        asm.op(Op::Nop);
        asm.branch(Op::Jump, top);
        let (env, reg) = build(asm.finish()).unwrap();
        let comp = assemble(&env, &reg).unwrap();

        assert_eq!(comp.blocks.len(), 2);
        let head = BlockId::new(0);
        let tail = BlockId::new(1);
        assert_eq!(comp.blocks[head].exit, ExitKind::Jump);
        assert_eq!(comp.block_lists.get(comp.blocks[head].exits), &[tail]);
        // The tail loops on itself.
        assert_eq!(comp.blocks[tail].exit, ExitKind::Jump);
        assert_eq!(comp.block_lists.get(comp.blocks[tail].exits), &[tail]);
        assert!(comp
            .preds
            .contains(comp.blocks[tail].entry_points, CfgNodeRef::block(tail)));
    }

    #[test]
    fn jump_into_instruction_middle_is_rejected() {
        let mut asm = Assembler::new();
        // jump over the second byte of a pushbyte.
        asm.op(Op::Jump);
        asm.raw(1);
        asm.raw(0);
        asm.raw(0); // target = offset 5: middle of pushbyte
        asm.op_byte(Op::PushByte, 9);
        asm.op(Op::ReturnVoid);
        let (env, reg) = build(asm.finish()).unwrap();
        let err = assemble(&env, &reg).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidBranchTarget);
    }

    #[test]
    fn jump_past_end_is_falloff() {
        let mut asm = Assembler::new();
        asm.op(Op::Jump);
        asm.raw(100);
        asm.raw(0);
        asm.raw(0);
        let (env, reg) = build(asm.finish()).unwrap();
        let err = assemble(&env, &reg).unwrap_err();
        assert_eq!(err.code, ErrorCode::CodeFalloffEndOfMethod);
    }

    #[test]
    fn jump_to_last_instruction_start_is_valid() {
        let mut asm = Assembler::new();
        let end = asm.label();
        asm.branch(Op::Jump, end);
        asm.op(Op::Nop);
        asm.place(end);
        asm.op(Op::ReturnVoid);
        let (env, reg) = build(asm.finish()).unwrap();
        let comp = assemble(&env, &reg).unwrap();
        // The nop is unreachable; two blocks exist (entry, return).
        assert_eq!(comp.blocks.len(), 2);
        assert!(!comp.instrs[InstrId::new(1)].flags.is_reached());
    }

    #[test]
    fn nonterminated_body_is_falloff() {
        let mut asm = Assembler::new();
        asm.op(Op::Nop);
        asm.op(Op::Nop);
        let (env, reg) = build(asm.finish()).unwrap();
        let err = assemble(&env, &reg).unwrap_err();
        assert_eq!(err.code, ErrorCode::CodeFalloffEndOfMethod);
    }

    #[test]
    fn reachable_invalid_opcode_fails() {
        let (env, reg) = build(vec![0xFF, Op::ReturnVoid as u8]).unwrap();
        let err = assemble(&env, &reg).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOpcodeReachable);
    }

    #[test]
    fn unreachable_invalid_opcode_is_fine() {
        let mut asm = Assembler::new();
        asm.op(Op::ReturnVoid);
        asm.raw(0xFF); // dead padding
        let (env, reg) = build(asm.finish()).unwrap();
        let comp = assemble(&env, &reg).unwrap();
        assert_eq!(comp.blocks.len(), 1);
    }

    #[test]
    fn switch_carries_all_targets_in_order() {
        let mut asm = Assembler::new();
        asm.op_byte(Op::PushByte, 0);
        let default = asm.label();
        let c0 = asm.label();
        let c1 = asm.label();
        asm.lookup_switch(default, &[c0, c1]);
        asm.place(c0);
        asm.op(Op::ReturnVoid);
        asm.place(c1);
        asm.op(Op::ReturnVoid);
        asm.place(default);
        asm.op(Op::ReturnVoid);
        let (env, reg) = build(asm.finish()).unwrap();
        let comp = assemble(&env, &reg).unwrap();

        let entry = &comp.blocks[BlockId::new(0)];
        assert_eq!(entry.exit, ExitKind::Switch);
        let exits = comp.block_lists.get(entry.exits);
        assert_eq!(exits.len(), 3, "default + two cases");
        // Declared order: default first, then the cases.
        let offsets: Vec<u32> = exits
            .iter()
            .map(|&b| comp.instrs[comp.blocks[b].first_instr].offset)
            .collect();
        assert_eq!(offsets[1] + 1, offsets[2]);
        assert!(offsets[0] > offsets[2], "default placed last");
    }

    #[test]
    fn switch_with_default_only() {
        let mut asm = Assembler::new();
        asm.op_byte(Op::PushByte, 0);
        let default = asm.label();
        asm.lookup_switch(default, &[default]);
        asm.place(default);
        asm.op(Op::ReturnVoid);
        let (env, reg) = build(asm.finish()).unwrap();
        let comp = assemble(&env, &reg).unwrap();
        let entry = &comp.blocks[BlockId::new(0)];
        let exits = comp.block_lists.get(entry.exits);
        assert_eq!(exits.len(), 2);
        assert_eq!(exits[0], exits[1]);
        // Deduplicated predecessor entry.
        assert_eq!(comp.preds.len(comp.blocks[exits[0]].entry_points), 1);
    }

    #[test]
    fn forward_jump_then_fall_into_target() {
        // jump L; L: return — the jump's target is the next instruction.
        let mut asm = Assembler::new();
        let l = asm.label();
        asm.branch(Op::Jump, l);
        asm.place(l);
        asm.op(Op::ReturnVoid);
        let (env, reg) = build(asm.finish()).unwrap();
        let comp = assemble(&env, &reg).unwrap();
        assert_eq!(comp.blocks.len(), 2);
        assert_eq!(comp.blocks[BlockId::new(0)].exit, ExitKind::Jump);
    }
}
