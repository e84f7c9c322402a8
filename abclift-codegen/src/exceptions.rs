//! Exception-region tree construction.
//!
//! ABC exception-table entries arrive as arbitrary, possibly overlapping byte
//! ranges. This pass maps them onto instruction ids, discovers which catch
//! handlers are live (rerunning the flow assembler from reachable catch
//! targets to a fixed point), trims regions to reachable code, resolves
//! partial overlaps by splitting, and assigns every basic block its innermost
//! enclosing handler. The result is a forest of strictly nested half-open
//! try intervals.

use crate::compilation::MethodCompilation;
use crate::error::{CompileError, CompileResult, ErrorCode};
use crate::flowgraph::{add_entry_point, Flow};
use crate::ir::{BlockId, CfgNodeRef, ExceptionHandler, HandlerId, InstrId};
use crate::timing;
use abclift_abc::TypeRef;
use abclift_entity::EntityRef;
use log::{debug, trace};
use std::cmp::Ordering;

/// Build the exception-handler arena and assign block handler ids.
pub fn run(comp: &mut MethodCompilation) -> CompileResult<()> {
    let _tt = timing::exceptions();
    if comp.env.exceptions().is_empty() {
        return Ok(());
    }

    let mut regions = map_to_instrs(comp)?;
    let mut flow = Flow::attach(comp);
    activate_reachable(comp, &mut flow, &mut regions)?;
    trim_all(comp, &mut regions);
    regions.retain(|r| r.start < r.end);

    regions.sort_by(region_order);
    let nodes = nest_and_split(comp, &mut regions);

    build_handlers(comp, &mut flow, nodes)?;
    assign_block_handlers(comp);
    debug!("exceptions: {} handlers", comp.handlers.len());
    Ok(())
}

/// A try region in instruction-id space, before handler records exist.
#[derive(Debug, Clone, Copy)]
struct Region {
    start: u32,
    end: u32,
    target: u32,
    exc_index: u32,
    active: bool,
}

/// A region with its resolved parent, in final nesting order.
struct RegionNode {
    region: Region,
    parent: Option<usize>,
}

/// Enclosing regions sort before enclosed ones; for identical ranges the
/// later-declared handler sorts first and becomes the parent, so the
/// earlier-declared handler is tested first at runtime.
fn region_order(a: &Region, b: &Region) -> Ordering {
    a.start
        .cmp(&b.start)
        .then(b.end.cmp(&a.end))
        .then(b.exc_index.cmp(&a.exc_index))
}

fn map_to_instrs(comp: &MethodCompilation) -> CompileResult<Vec<Region>> {
    let code_len = comp.env.code().len() as u32;
    let mut regions = Vec::with_capacity(comp.env.exceptions().len());
    for (exc_index, record) in comp.env.exceptions().iter().enumerate() {
        if record.from > record.to || record.to > code_len || record.target >= code_len {
            return Err(CompileError::new(ErrorCode::IllegalExceptionTable));
        }
        let start = comp
            .instr_at_offset(record.from)
            .ok_or_else(|| CompileError::new(ErrorCode::IllegalExceptionTable))?;
        let end = if record.to == code_len {
            comp.instrs.len() as u32
        } else {
            comp.instr_at_offset(record.to)
                .ok_or_else(|| CompileError::new(ErrorCode::IllegalExceptionTable))?
                .as_u32()
        };
        let target = comp
            .instr_at_offset(record.target)
            .ok_or_else(|| CompileError::new(ErrorCode::IllegalExceptionTable))?;
        // Empty try regions are dropped outright.
        if start.as_u32() >= end {
            continue;
        }
        regions.push(Region {
            start: start.as_u32(),
            end,
            target: target.as_u32(),
            exc_index: exc_index as u32,
            active: false,
        });
    }
    Ok(regions)
}

/// Rerun the flow assembler from each catch target whose try region holds at
/// least one reachable instruction, until no new catches wake up. Regions
/// that never wake up are discarded.
fn activate_reachable(
    comp: &mut MethodCompilation,
    flow: &mut Flow,
    regions: &mut Vec<Region>,
) -> CompileResult<()> {
    loop {
        let mut changed = false;
        for idx in 0..regions.len() {
            if regions[idx].active {
                continue;
            }
            if !has_reached_instr(comp, regions[idx].start, regions[idx].end) {
                continue;
            }
            trace!("activating catch at instruction {}", regions[idx].target);
            flow.reach(comp, InstrId::new(regions[idx].target as usize))?;
            regions[idx].active = true;
            changed = true;
        }
        if !changed {
            break;
        }
    }
    regions.retain(|r| r.active);
    Ok(())
}

fn has_reached_instr(comp: &MethodCompilation, start: u32, end: u32) -> bool {
    (start..end).any(|i| comp.instrs[InstrId::new(i as usize)].flags.is_reached())
}

/// Shrink every region inward to its first and last reachable instruction.
fn trim_all(comp: &MethodCompilation, regions: &mut [Region]) {
    for r in regions.iter_mut() {
        let first = (r.start..r.end)
            .find(|&i| comp.instrs[InstrId::new(i as usize)].flags.is_reached());
        match first {
            Some(first) => {
                let last = (r.start..r.end)
                    .rev()
                    .find(|&i| comp.instrs[InstrId::new(i as usize)].flags.is_reached())
                    .unwrap();
                r.start = first;
                r.end = last + 1;
            }
            None => {
                r.end = r.start;
            }
        }
    }
}

/// One linear sweep over the sorted regions, closing finished regions,
/// nesting contained ones, and splitting partial overlaps.
fn nest_and_split(comp: &MethodCompilation, regions: &mut Vec<Region>) -> Vec<RegionNode> {
    let mut nodes: Vec<RegionNode> = Vec::with_capacity(regions.len());
    let mut open: Vec<usize> = Vec::new();
    let mut i = 0;
    while i < regions.len() {
        let r = regions[i];
        while let Some(&top) = open.last() {
            if r.start >= nodes[top].region.end {
                open.pop();
            } else {
                break;
            }
        }
        match open.last() {
            Some(&top) if r.end > nodes[top].region.end => {
                // Partial overlap: keep the front inside the current region
                // and bubble a fragment for the remainder back into sorted
                // position.
                let cur_end = nodes[top].region.end;
                let fragment = Region {
                    start: cur_end,
                    end: r.end,
                    ..r
                };
                regions[i].end = cur_end;
                trace!(
                    "splitting region [{}, {}) at {}",
                    r.start,
                    r.end,
                    cur_end
                );
                regions.push(fragment);
                let mut j = regions.len() - 1;
                while j > i + 1 && region_order(&regions[j - 1], &regions[j]) == Ordering::Greater {
                    regions.swap(j - 1, j);
                    j -= 1;
                }
                // Reprocess the shrunk region, now contained in `top`.
            }
            Some(&top) => {
                nodes.push(RegionNode {
                    region: regions[i],
                    parent: Some(top),
                });
                open.push(nodes.len() - 1);
                i += 1;
            }
            None => {
                nodes.push(RegionNode {
                    region: regions[i],
                    parent: None,
                });
                open.push(nodes.len() - 1);
                i += 1;
            }
        }
    }

    // Splitting can leave fragments whose edges sit on unreachable code; fix
    // their bounds the same way as the originals.
    let mut trimmed: Vec<Region> = nodes.iter().map(|n| n.region).collect();
    trim_all(comp, &mut trimmed);
    for (node, region) in nodes.iter_mut().zip(trimmed) {
        node.region = region;
    }
    nodes
}

/// Materialize handler records, pre-split block boundaries, and record catch
/// chains and catch-edge predecessors.
fn build_handlers(
    comp: &mut MethodCompilation,
    flow: &mut Flow,
    nodes: Vec<RegionNode>,
) -> CompileResult<()> {
    // Empty fragments may remain after the post-split trim; drop them and
    // reparent across the gap.
    let mut remap: Vec<Option<HandlerId>> = Vec::with_capacity(nodes.len());
    for node in &nodes {
        if node.region.start >= node.region.end {
            remap.push(None);
            continue;
        }
        let mut parent = None;
        let mut up = node.parent;
        while let Some(idx) = up {
            if let Some(h) = remap[idx] {
                parent = Some(h);
                break;
            }
            up = nodes[idx].parent;
        }
        let caught_type = caught_type(comp, node.region.exc_index)?;
        let handler = comp.handlers.push(ExceptionHandler {
            try_start: InstrId::new(node.region.start as usize),
            try_end: node.region.end,
            catch_target: InstrId::new(node.region.target as usize),
            parent: parent.into(),
            caught_type,
            catch_block_chain: Default::default(),
            exc_index: node.region.exc_index,
        });
        remap.push(Some(handler));
    }

    // Block boundaries at every try edge and catch target.
    for h in comp.handlers.keys().collect::<Vec<_>>() {
        let (start, end, target) = {
            let handler = &comp.handlers[h];
            (handler.try_start, handler.try_end, handler.catch_target)
        };
        flow.boundary(comp, start)?;
        let end_instr = InstrId::new(end as usize);
        if comp.instrs.is_valid(end_instr) && comp.instrs[end_instr].flags.is_reached() {
            flow.boundary(comp, end_instr)?;
        }
        flow.boundary(comp, target)?;
    }

    // Catch chains (self first, root last) and catch-edge predecessors are
    // only stable once every boundary has been ensured.
    for h in comp.handlers.keys().collect::<Vec<_>>() {
        let mut chain: Vec<BlockId> = Vec::new();
        let mut cur = Some(h);
        while let Some(handler) = cur {
            let target = comp.handlers[handler].catch_target;
            chain.push(comp.instrs[target].block.unwrap());
            cur = comp.handlers[handler].parent.expand();
        }
        let token = comp.block_lists.alloc(&chain);
        comp.handlers[h].catch_block_chain = token;

        let catch_block = chain[0];
        add_entry_point(comp, catch_block, CfgNodeRef::catch(h));
    }
    Ok(())
}

fn caught_type(comp: &MethodCompilation, exc_index: u32) -> CompileResult<TypeRef> {
    let record = comp.env.exceptions()[exc_index as usize];
    if record.type_name == 0 {
        return Ok(TypeRef::Any);
    }
    let mn = comp
        .env
        .multiname(record.type_name)
        .ok_or_else(|| CompileError::new(ErrorCode::InvalidConstantPoolIndex))?;
    // An unresolvable catch type degrades to catch-all; resolution failures
    // are not fatal here.
    Ok(comp.registry.class_by_multiname(mn).unwrap_or(TypeRef::Any))
}

/// Give every block the id of its innermost enclosing handler.
fn assign_block_handlers(comp: &mut MethodCompilation) {
    let mut order: Vec<BlockId> = comp.blocks.keys().collect();
    order.sort_by_key(|&b| comp.blocks[b].first_instr);

    // Handlers are already in ⟨start asc, end desc⟩ order, so walking them
    // with a single pointer pushes outer regions before inner ones.
    let handler_ids: Vec<HandlerId> = comp.handlers.keys().collect();
    let mut next = 0usize;
    let mut current: Option<HandlerId> = None;

    for block in order {
        let first = comp.blocks[block].first_instr.as_u32();
        while let Some(cur) = current {
            if first >= comp.handlers[cur].try_end {
                current = comp.handlers[cur].parent.expand();
            } else {
                break;
            }
        }
        while next < handler_ids.len() {
            let h = handler_ids[next];
            let start = comp.handlers[h].try_start.as_u32();
            if start > first {
                break;
            }
            if start == first {
                current = Some(h);
            }
            next += 1;
        }
        comp.blocks[block].handler = current.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, flowgraph};
    use abclift_abc::asm::Assembler;
    use abclift_abc::env::{DummyEnvironment, DummyRegistry, ExceptionRecord};
    use abclift_abc::Op;

    fn compile<'a>(
        env: &'a DummyEnvironment,
        reg: &'a DummyRegistry,
    ) -> CompileResult<MethodCompilation<'a>> {
        let mut comp = MethodCompilation::new(env, reg);
        decode::run(&mut comp)?;
        flowgraph::run(&mut comp)?;
        run(&mut comp)?;
        Ok(comp)
    }

    fn catch_all(from: u32, to: u32, target: u32) -> ExceptionRecord {
        ExceptionRecord {
            from,
            to,
            target,
            type_name: 0,
            var_name: 0,
        }
    }

    /// 20 nops and a return, with a throw inside so catches stay live.
    fn nop_sled(len: u32) -> Vec<u8> {
        let mut asm = Assembler::new();
        for _ in 0..len {
            asm.op(Op::Nop);
        }
        asm.op(Op::ReturnVoid);
        asm.finish()
    }

    #[test]
    fn empty_try_region_is_dropped() {
        let mut env = DummyEnvironment::new();
        env.set_code(nop_sled(5));
        env.add_exception(catch_all(2, 2, 4));
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();
        assert_eq!(comp.handlers.len(), 0);
    }

    #[test]
    fn unreachable_region_is_removed() {
        let mut asm = Assembler::new();
        asm.op(Op::ReturnVoid); // offset 0
        asm.op(Op::Nop); // offset 1, unreachable
        asm.op(Op::Nop); // offset 2
        asm.op(Op::ReturnVoid); // offset 3
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.add_exception(catch_all(1, 3, 3));
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();
        assert_eq!(comp.handlers.len(), 0);
    }

    #[test]
    fn catch_target_becomes_reachable() {
        let mut asm = Assembler::new();
        asm.op(Op::Nop); // 0, in try
        asm.op(Op::ReturnVoid); // 1
        asm.op(Op::PushByte); // 2-3: catch target, otherwise unreachable
        asm.raw(0);
        asm.op(Op::ReturnVoid); // 4
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.add_exception(catch_all(0, 2, 2));
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();
        assert_eq!(comp.handlers.len(), 1);
        let target = comp.handlers[HandlerId::new(0)].catch_target;
        assert!(comp.instrs[target].flags.is_reached());
        // The catch block records the exception edge.
        let catch_block = comp.instrs[target].block.unwrap();
        assert!(comp
            .preds
            .contains(
                comp.blocks[catch_block].entry_points,
                CfgNodeRef::catch(HandlerId::new(0))
            ));
    }

    #[test]
    fn overlapping_regions_are_split() {
        // Handlers on [0,20) and [10,30): the second is split at 20, giving
        // regions [0,20), [10,20) nested inside it, and [20,30). The
        // innermost coverage therefore partitions the code as
        // [0,10) -> first, [10,20) -> second (inside first), [20,30) ->
        // second.
        let mut env = DummyEnvironment::new();
        env.set_code(nop_sled(30));
        env.add_exception(catch_all(0, 20, 25));
        env.add_exception(catch_all(10, 30, 28));
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();

        let mut spans: Vec<(u32, u32, u32)> = comp
            .handlers
            .values()
            .map(|h| (h.try_start.as_u32(), h.try_end, h.exc_index))
            .collect();
        spans.sort();
        assert_eq!(spans, vec![(0, 20, 0), (10, 20, 1), (20, 30, 1)]);

        // No partial overlap survives: any two spans are disjoint or nested.
        for a in &spans {
            for b in &spans {
                let disjoint = a.1 <= b.0 || b.1 <= a.0;
                let nested = (a.0 <= b.0 && b.1 <= a.1) || (b.0 <= a.0 && a.1 <= b.1);
                assert!(disjoint || nested, "{:?} vs {:?}", a, b);
            }
        }

        // The split fragment stays parented under the enclosing region.
        let nested = comp
            .handlers
            .values()
            .find(|h| h.try_start.as_u32() == 10)
            .unwrap();
        let parent = nested.parent.expand().unwrap();
        assert_eq!(comp.handlers[parent].try_start.as_u32(), 0);
        assert_eq!(comp.handlers[parent].exc_index, 0);

        // Innermost handler per block realizes the three-way partition.
        for (_, block) in comp.blocks.iter() {
            let first = block.first_instr.as_u32();
            if first >= 30 {
                continue;
            }
            let h = block.handler.expand().unwrap();
            let expected = if first < 10 { 0 } else { 1 };
            assert_eq!(comp.handlers[h].exc_index, expected, "block at {}", first);
        }
    }

    #[test]
    fn same_region_handlers_nest_by_declaration_order() {
        let mut env = DummyEnvironment::new();
        env.set_code(nop_sled(10));
        env.add_exception(catch_all(0, 10, 5));
        env.add_exception(catch_all(0, 10, 7));
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();

        assert_eq!(comp.handlers.len(), 2);
        // The later-declared handler is the parent; the earlier one is
        // innermost and therefore tested first.
        let inner = comp
            .handlers
            .values()
            .find(|h| h.exc_index == 0)
            .unwrap();
        let outer_id = inner.parent.expand().unwrap();
        assert_eq!(comp.handlers[outer_id].exc_index, 1);
        assert!(comp.handlers[outer_id].parent.is_none());

        // Catch chain of the inner handler lists self then parent.
        let chain = comp.block_lists.get(inner.catch_block_chain);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn whole_method_try() {
        let mut env = DummyEnvironment::new();
        env.set_code(nop_sled(6));
        env.add_exception(catch_all(0, 7, 3));
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();
        assert_eq!(comp.handlers.len(), 1);
        let h = &comp.handlers[HandlerId::new(0)];
        assert_eq!(h.try_start.as_u32(), 0);
        // Every block inside the try interval carries the handler id.
        for (_, block) in comp.blocks.iter() {
            if block.first_instr.as_u32() < h.try_end {
                assert_eq!(block.handler.expand(), Some(HandlerId::new(0)));
            }
        }
    }

    #[test]
    fn blocks_split_at_try_edges() {
        let mut env = DummyEnvironment::new();
        env.set_code(nop_sled(10));
        env.add_exception(catch_all(3, 6, 8));
        let reg = DummyRegistry::with_builtins();
        let comp = compile(&env, &reg).unwrap();

        let h = &comp.handlers[HandlerId::new(0)];
        // try_start and try_end both head blocks now.
        assert!(comp.instrs[h.try_start].flags.starts_block());
        let end = InstrId::new(h.try_end as usize);
        assert!(comp.instrs[end].flags.starts_block());
        // Blocks outside the region carry no handler.
        let entry_block = comp.instrs[InstrId::new(0)].block.unwrap();
        assert!(comp.blocks[entry_block].handler.is_none());
    }

    #[test]
    fn malformed_table_is_rejected() {
        let mut env = DummyEnvironment::new();
        env.set_code(nop_sled(5));
        env.add_exception(catch_all(4, 2, 1));
        let reg = DummyRegistry::with_builtins();
        let err = compile(&env, &reg).unwrap_err();
        assert_eq!(err.code, ErrorCode::IllegalExceptionTable);
    }

    #[test]
    fn split_is_stable_under_reconstruction() {
        // Running construction twice over the same input produces the same
        // sorted spans.
        let spans = |comp: &MethodCompilation| -> Vec<(u32, u32, u32)> {
            comp.handlers
                .values()
                .map(|h| (h.try_start.as_u32(), h.try_end, h.exc_index))
                .collect()
        };
        let mut env = DummyEnvironment::new();
        env.set_code(nop_sled(30));
        env.add_exception(catch_all(0, 20, 25));
        env.add_exception(catch_all(10, 30, 28));
        let reg = DummyRegistry::with_builtins();
        let first = spans(&compile(&env, &reg).unwrap());
        let second = spans(&compile(&env, &reg).unwrap());
        assert_eq!(first, second);
    }
}
