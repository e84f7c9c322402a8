//! Postorder numbering and immediate dominators.
//!
//! Postorder comes from an iterative depth-first walk over block successors,
//! where a block inside a try region additionally flows into every catch
//! target of its enclosing handler chain. Immediate dominators use the
//! classical iterative fixpoint over reverse postorder; the synthetic START
//! node (and every catch-edge marker, which collapses onto it) numbers past
//! all real blocks so intersections terminate there.

use crate::compilation::MethodCompilation;
use crate::ir::{BlockId, CfgNode, CfgNodeRef};
use crate::timing;
use abclift_entity::{EntitySet, EntityRef};
use log::debug;
use smallvec::SmallVec;

/// Compute postorder numbers and immediate dominators for all reachable
/// blocks.
pub fn run(comp: &mut MethodCompilation) {
    let _tt = timing::domtree();
    if comp.blocks.is_empty() {
        return;
    }
    let visited = number_postorder(comp);
    compute_idoms(comp, &visited);
    debug!("domtree over {} blocks", comp.blocks.len());
}

/// Successors of `block` for dominance purposes: exit targets plus the catch
/// chain of the enclosing handler.
fn successors(comp: &MethodCompilation, block: BlockId) -> SmallVec<[BlockId; 4]> {
    let mut succs: SmallVec<[BlockId; 4]> = SmallVec::new();
    succs.extend_from_slice(comp.block_lists.get(comp.blocks[block].exits));
    if let Some(handler) = comp.blocks[block].handler.expand() {
        succs.extend_from_slice(comp.block_lists.get(comp.handlers[handler].catch_block_chain));
    }
    succs
}

/// Two-phase iterative DFS: an entry is pushed once to expand its successors
/// and once more to receive its postorder number.
fn number_postorder(comp: &mut MethodCompilation) -> EntitySet<BlockId> {
    let entry = comp.instrs[crate::ir::InstrId::new(0)].block.unwrap();
    let mut visited: EntitySet<BlockId> = EntitySet::new();
    let mut stack: Vec<(BlockId, bool)> = vec![(entry, false)];
    let mut next_number = 0u32;

    visited.insert(entry);
    while let Some((block, finalized)) = stack.pop() {
        if finalized {
            comp.blocks[block].postorder = next_number;
            next_number += 1;
            continue;
        }
        stack.push((block, true));
        for succ in successors(comp, block) {
            if visited.insert(succ) {
                stack.push((succ, false));
            }
        }
    }
    visited
}

fn canon(pred: CfgNodeRef) -> CfgNodeRef {
    match pred.expand() {
        CfgNode::Catch(_) => CfgNodeRef::start(),
        _ => pred,
    }
}

fn postorder_of(comp: &MethodCompilation, node: CfgNodeRef) -> u32 {
    match node.expand() {
        // START numbers strictly after every block.
        CfgNode::Start | CfgNode::Catch(_) => comp.blocks.len() as u32,
        CfgNode::Block(b) => comp.blocks[b].postorder,
    }
}

fn intersect(comp: &MethodCompilation, mut a: CfgNodeRef, mut b: CfgNodeRef) -> CfgNodeRef {
    a = canon(a);
    b = canon(b);
    while a != b {
        if postorder_of(comp, a) < postorder_of(comp, b) {
            a = canon(comp.blocks[a.as_block().unwrap()].idom.unwrap());
        } else {
            b = canon(comp.blocks[b.as_block().unwrap()].idom.unwrap());
        }
    }
    a
}

fn compute_idoms(comp: &mut MethodCompilation, visited: &EntitySet<BlockId>) {
    let mut rpo: Vec<BlockId> = comp
        .blocks
        .keys()
        .filter(|&b| visited.contains(b))
        .collect();
    rpo.sort_by(|&a, &b| comp.blocks[b].postorder.cmp(&comp.blocks[a].postorder));

    loop {
        let mut changed = false;
        for &block in &rpo {
            let mut new_idom: Option<CfgNodeRef> = None;
            for i in 0..comp.preds.len(comp.blocks[block].entry_points) {
                let pred = comp.preds.get(comp.blocks[block].entry_points)[i];
                let pred = canon(pred);
                if let Some(pb) = pred.as_block() {
                    // Skip unprocessed predecessors on the first sweep.
                    if !visited.contains(pb) || comp.blocks[pb].idom.is_none() {
                        continue;
                    }
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(cur) => intersect(comp, cur, pred),
                });
            }
            if let Some(idom) = new_idom {
                if comp.blocks[block].idom.expand() != Some(idom) {
                    comp.blocks[block].idom = idom.into();
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileResult;
    use crate::{decode, exceptions, flowgraph};
    use abclift_abc::asm::Assembler;
    use abclift_abc::env::{DummyEnvironment, DummyRegistry, ExceptionRecord};
    use abclift_abc::{AbcEnvironment, Op};
    use crate::ir::InstrId;

    fn compile<'a>(
        env: &'a DummyEnvironment,
        reg: &'a DummyRegistry,
    ) -> CompileResult<MethodCompilation<'a>> {
        let mut comp = MethodCompilation::new(env, reg);
        decode::run(&mut comp)?;
        flowgraph::run(&mut comp)?;
        exceptions::run(&mut comp)?;
        run(&mut comp);
        Ok(comp)
    }

    fn block_at_offset(comp: &MethodCompilation, offset: u32) -> BlockId {
        let instr = comp.instr_at_offset(offset).unwrap();
        comp.instrs[instr].block.unwrap()
    }

    #[test]
    fn entry_is_dominated_by_start() {
        let mut asm = Assembler::new();
        asm.op(Op::ReturnVoid);
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();

        let entry = block_at_offset(&comp, 0);
        assert_eq!(comp.blocks[entry].idom.expand(), Some(CfgNodeRef::start()));
        // The single block takes the highest (and only) postorder number.
        assert_eq!(comp.blocks[entry].postorder, 0);
    }

    #[test]
    fn diamond_joins_at_the_branch() {
        //      b0
        //     /  \
        //    b1  b2
        //     \  /
        //      b3
        let mut asm = Assembler::new();
        asm.op(Op::GetLocal0);
        let right = asm.label();
        let join = asm.label();
        asm.branch(Op::IfTrue, right);
        asm.op(Op::Nop); // left arm
        asm.branch(Op::Jump, join);
        asm.place(right);
        asm.op(Op::Nop);
        asm.place(join);
        asm.op(Op::ReturnVoid);
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();

        let b0 = block_at_offset(&comp, 0);
        let join_block = {
            let join_off = env.code().len() as u32 - 1;
            block_at_offset(&comp, join_off)
        };
        assert_eq!(
            comp.blocks[join_block].idom.expand(),
            Some(CfgNodeRef::block(b0))
        );
        // Strict dominators carry greater postorder numbers.
        assert!(comp.blocks[b0].postorder > comp.blocks[join_block].postorder);
    }

    #[test]
    fn loop_header_is_dominated_by_entry() {
        // S3 shape: entry initializes, header tests, body jumps back.
        let mut asm = Assembler::new();
        asm.op_byte(Op::PushByte, 0);
        asm.op_u30(Op::SetLocal, 1);
        let header = asm.here();
        asm.op_u30(Op::GetLocal, 1);
        asm.op_byte(Op::PushByte, 10);
        let exit = asm.label();
        asm.branch(Op::IfLt, exit);
        asm.op_u30(Op::GetLocal, 1);
        asm.op_byte(Op::PushByte, 1);
        asm.op(Op::Add);
        asm.op_u30(Op::SetLocal, 1);
        asm.branch(Op::Jump, header);
        asm.place(exit);
        asm.op_u30(Op::GetLocal, 1);
        asm.op(Op::ReturnValue);
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.set_local_count(2);
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();

        let entry = block_at_offset(&comp, 0);
        let header_block = block_at_offset(&comp, 4);
        assert_eq!(
            comp.blocks[header_block].idom.expand(),
            Some(CfgNodeRef::block(entry))
        );
        assert!(comp.blocks[header_block].postorder < comp.blocks[entry].postorder);
    }

    #[test]
    fn catch_entry_is_dominated_by_start() {
        let mut asm = Assembler::new();
        asm.op(Op::Nop);
        asm.op(Op::Nop);
        asm.op(Op::ReturnVoid);
        asm.op(Op::ReturnVoid); // catch target
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.add_exception(ExceptionRecord {
            from: 0,
            to: 2,
            target: 3,
            type_name: 0,
            var_name: 0,
        });
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();

        let catch_block = {
            let h = comp.handlers.keys().next().unwrap();
            let target = comp.handlers[h].catch_target;
            comp.instrs[target].block.unwrap()
        };
        assert_eq!(
            comp.blocks[catch_block].idom.expand(),
            Some(CfgNodeRef::start())
        );
        // The catch block received a postorder number (it is visited via the
        // exception successor edge).
        let entry = comp.instrs[InstrId::new(0)].block.unwrap();
        assert_ne!(comp.blocks[catch_block].postorder, comp.blocks[entry].postorder);
    }

    #[test]
    fn postorder_respects_dominators_everywhere() {
        let mut asm = Assembler::new();
        asm.op(Op::GetLocal0);
        let l1 = asm.label();
        asm.branch(Op::IfTrue, l1);
        asm.op(Op::Nop);
        asm.op(Op::ReturnVoid);
        asm.place(l1);
        asm.op(Op::GetLocal0);
        let l2 = asm.label();
        asm.branch(Op::IfFalse, l2);
        asm.op(Op::ReturnVoid);
        asm.place(l2);
        asm.op(Op::ReturnVoid);
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();

        for (id, block) in comp.blocks.iter() {
            if let Some(idom) = block.idom.expand() {
                assert!(
                    postorder_of(&comp, idom) > block.postorder,
                    "{} has idom {:?}",
                    id,
                    idom
                );
            }
        }
    }
}
