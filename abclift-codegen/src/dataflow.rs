//! The data-flow builder.
//!
//! Abstract execution of the stack/scope/local machine over the CFG. Each
//! block's entry state is an array of node ids per component; simulating a
//! block pops input nodes (recorded on the instruction), pushes output nodes,
//! and rewrites local and scope slots. Where control flow merges, slot values
//! join into phi nodes whose def lists are the incoming values.
//!
//! `getlocal` and `getscopeobject` push the slot's current node itself, so a
//! computed value's def list reaches straight back to the values that fed it
//! (an `add` over two parameters lists the two parameter nodes as defs).
//!
//! Constant propagation happens here: value opcodes whose inputs are all
//! constants produce constant outputs, which a post-pass marks `no_push`
//! where the generator can rematerialize them on demand.

use crate::compilation::MethodCompilation;
use crate::error::{CompileError, CompileResult, ErrorCode};
use crate::ir::node::{ConstValue, DataType};
use crate::ir::{
    BlockId, ExitKind, HandlerId, InstrData, InstrId, NodeId, NodeOrInstr, SlotRef,
};
use crate::timing;
use abclift_abc::Op;
use abclift_entity::{EntityRef, EntitySet};
use log::{debug, trace};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;

/// Run abstract execution over all reachable blocks.
pub fn run(comp: &mut MethodCompilation) -> CompileResult<()> {
    let _tt = timing::dataflow();

    let mut ctx = Builder {
        initialized: EntitySet::new(),
        is_catch: EntitySet::new(),
        queue: VecDeque::new(),
    };

    ctx.setup_catch_blocks(comp);
    let entry_locals = initial_locals(comp);
    let entry = comp.instrs[InstrId::new(0)].block.unwrap();
    ctx.merge_into(comp, None, entry, &[], &[], &entry_locals)?;

    let mut processed: EntitySet<BlockId> = EntitySet::new();
    while let Some(block) = ctx.queue.pop_front() {
        if !processed.insert(block) {
            continue;
        }
        ctx.simulate(comp, block)?;
    }

    prune_trivial_phis(comp);
    fixup_types(comp);
    mark_no_push(comp);
    debug!("dataflow: {} nodes", comp.nodes.len());
    Ok(())
}

/// Drop phis with a single distinct source, rewriting every reference to
/// point at the source instead. Eager phi creation makes one per slot at
/// every merge; most collapse here.
fn prune_trivial_phis(comp: &mut MethodCompilation) {
    loop {
        let mut victim: Option<(NodeId, NodeId)> = None;
        'scan: for phi in comp.nodes.keys() {
            if !comp.nodes[phi].flags.is_phi() {
                continue;
            }
            let defs = comp.nodes[phi].defs;
            let mut unique: Option<NodeId> = None;
            for k in 0..comp.refs.len(defs) {
                if let Some(src) = comp.refs.get(defs)[k].as_node() {
                    if src == phi {
                        continue;
                    }
                    match unique {
                        None => unique = Some(src),
                        Some(u) if u != src => continue 'scan,
                        _ => {}
                    }
                }
            }
            if let Some(src) = unique {
                victim = Some((phi, src));
                break;
            }
        }

        let (phi, src) = match victim {
            Some(v) => v,
            None => break,
        };
        trace!("pruning trivial phi {} -> {}", phi, src);

        // Entry snapshots.
        for b in comp.blocks.keys().collect::<Vec<BlockId>>() {
            for handle in &[
                comp.blocks[b].entry_stack,
                comp.blocks[b].entry_scope,
                comp.blocks[b].entry_locals,
            ] {
                for slot in comp.node_lists.get_mut(*handle) {
                    if *slot == phi {
                        *slot = src;
                    }
                }
            }
        }

        // Instruction references.
        for i in comp.instrs.keys().collect::<Vec<InstrId>>() {
            if comp.instrs[i].pushed_node.expand() == Some(phi) {
                comp.instrs[i].pushed_node = src.into();
            }
            let handle = comp.instrs[i].popped_nodes;
            for slot in comp.node_lists.get_mut(handle) {
                if *slot == phi {
                    *slot = src;
                }
            }
        }

        // Forward the phi's uses onto the source.
        let phi_uses: Vec<NodeOrInstr> = comp
            .refs
            .get(comp.nodes[phi].uses)
            .iter()
            .copied()
            .collect();
        for user in phi_uses {
            if let Some(n) = user.as_node() {
                let defs = comp.nodes[n].defs;
                if comp.refs.contains(defs, NodeOrInstr::node(src)) {
                    comp.refs.remove(defs, NodeOrInstr::node(phi));
                } else {
                    comp.refs.replace(defs, NodeOrInstr::node(phi), NodeOrInstr::node(src));
                }
            }
            let src_uses = comp.nodes[src].uses;
            if user != NodeOrInstr::node(src) && !comp.refs.contains(src_uses, user) {
                comp.refs.push(src_uses, user);
            }
        }
        let src_uses = comp.nodes[src].uses;
        comp.refs.remove(src_uses, NodeOrInstr::node(phi));

        // Exit transitions for the dead phi disappear; transitions that fed
        // it from another phi retarget.
        for b in comp.blocks.keys().collect::<Vec<BlockId>>() {
            let pairs = &mut comp.exit_phi_sources[b];
            pairs.retain(|&(_, p)| p != phi);
            for pair in pairs.iter_mut() {
                if pair.0 == phi {
                    pair.0 = src;
                }
            }
        }

        // The node stays in the arena but no longer acts as a phi.
        comp.nodes[phi].flags = Default::default();
        let dead_defs = comp.nodes[phi].defs;
        let dead = comp.refs.get(dead_defs).to_vec();
        for d in dead {
            comp.refs.remove(dead_defs, d);
        }
    }
}

/// Method-entry locals: `this`, the declared parameters, `rest` or
/// `arguments` when present, then `undefined` for the remainder.
fn initial_locals(comp: &mut MethodCompilation) -> Vec<NodeId> {
    let sig = comp.env.signature().clone();
    let receiver = comp.env.receiver();
    let mut locals = Vec::new();

    let this = comp.new_node(SlotRef::local(0));
    comp.nodes[this].ty = DataType::This(receiver);
    comp.nodes[this].flags.set_not_null();
    locals.push(this);

    for (i, &param) in sig.params.iter().enumerate() {
        let node = comp.new_node(SlotRef::local(locals.len() as u32));
        comp.nodes[node].ty = comp.data_type(param);
        comp.nodes[node].flags.set_argument();
        if sig.optional_from.map_or(false, |first| i as u32 >= first) {
            comp.nodes[node].flags.set_push_optional_param();
        }
        locals.push(node);
    }

    if sig.has_rest {
        let rest = comp.new_node(SlotRef::local(locals.len() as u32));
        comp.nodes[rest].ty = DataType::Rest;
        comp.nodes[rest].flags.set_argument();
        comp.nodes[rest].flags.set_not_null();
        locals.push(rest);
    } else if sig.needs_arguments {
        let args = comp.new_node(SlotRef::local(locals.len() as u32));
        let array = comp.registry.builtin(abclift_abc::Builtin::Array);
        comp.nodes[args].ty = DataType::Object(array);
        comp.nodes[args].flags.set_argument();
        comp.nodes[args].flags.set_not_null();
        locals.push(args);
    }

    let count = (comp.env.local_count() as usize).max(locals.len());
    while locals.len() < count {
        let node = comp.new_node(SlotRef::local(locals.len() as u32));
        comp.nodes[node].ty = DataType::Undefined;
        comp.nodes[node].value = ConstValue::Undefined;
        comp.nodes[node].flags.set_constant();
        locals.push(node);
    }
    locals
}

struct Builder {
    initialized: EntitySet<BlockId>,
    is_catch: EntitySet<BlockId>,
    queue: VecDeque<BlockId>,
}

impl Builder {
    /// Catch blocks get their entry state up front: a caught-exception phi
    /// on the stack, an empty scope stack, and one phi per local slot whose
    /// sources accumulate as try-region writes are discovered.
    fn setup_catch_blocks(&mut self, comp: &mut MethodCompilation) {
        let local_count = (comp.env.local_count() as usize).max(1);
        for h in comp.handlers.keys().collect::<Vec<HandlerId>>() {
            let target = comp.handlers[h].catch_target;
            let block = comp.instrs[target].block.unwrap();
            if !self.is_catch.contains(block) {
                self.is_catch.insert(block);
                comp.blocks[block].flags.set_defines_phi();

                let stack_phi = comp.new_node(SlotRef::stack(0));
                comp.nodes[stack_phi].flags.set_phi();
                let entry_stack = comp.node_lists.alloc(&[stack_phi]);
                let entry_scope = comp.node_lists.alloc(&[]);
                let mut locals = Vec::with_capacity(local_count);
                for i in 0..local_count {
                    let phi = comp.new_node(SlotRef::local(i as u32));
                    comp.nodes[phi].flags.set_phi();
                    locals.push(phi);
                }
                let entry_locals = comp.node_lists.alloc(&locals);
                let b = &mut comp.blocks[block];
                b.entry_stack = entry_stack;
                b.entry_scope = entry_scope;
                b.entry_locals = entry_locals;

                self.initialized.insert(block);
                self.queue.push_back(block);
            }

            // One exception value per handler feeds the stack phi.
            let caught = comp.handlers[h].caught_type;
            let exc = comp.new_node(SlotRef::stack(0));
            comp.nodes[exc].ty = comp.data_type(caught);
            comp.nodes[exc].flags.set_exception();
            comp.nodes[exc].flags.set_not_null();
            let stack_phi = comp.entry_stack(block)[0];
            add_phi_source(comp, stack_phi, exc);
        }
    }

    /// Feed `pred`'s exit state into `succ`, creating phis or entry arrays
    /// on first contact.
    fn merge_into(
        &mut self,
        comp: &mut MethodCompilation,
        pred: Option<BlockId>,
        succ: BlockId,
        stack: &[NodeId],
        scope: &[NodeId],
        locals: &[NodeId],
    ) -> CompileResult<()> {
        let pred_count = comp.preds.len(comp.blocks[succ].entry_points);
        let wants_phi = pred_count > 1 || self.is_catch.contains(succ);

        if !self.initialized.contains(succ) {
            self.initialized.insert(succ);
            if wants_phi {
                comp.blocks[succ].flags.set_defines_phi();
                let entry_stack = self.phi_row(comp, pred, stack, |i| SlotRef::stack(i));
                let entry_scope = self.phi_row(comp, pred, scope, |i| SlotRef::scope(i));
                let entry_locals = self.phi_row(comp, pred, locals, |i| SlotRef::local(i));
                let b = &mut comp.blocks[succ];
                b.entry_stack = entry_stack;
                b.entry_scope = entry_scope;
                b.entry_locals = entry_locals;
            } else {
                let entry_stack = comp.node_lists.alloc(stack);
                let entry_scope = comp.node_lists.alloc(scope);
                let entry_locals = comp.node_lists.alloc(locals);
                let b = &mut comp.blocks[succ];
                b.entry_stack = entry_stack;
                b.entry_scope = entry_scope;
                b.entry_locals = entry_locals;
            }
            self.queue.push_back(succ);
            return Ok(());
        }

        let at = comp.blocks[succ].first_instr;
        if comp.entry_stack(succ).len() != stack.len() {
            return Err(CompileError::at(ErrorCode::StackDepthMismatch, at));
        }
        if comp.entry_scope(succ).len() != scope.len() {
            return Err(CompileError::at(ErrorCode::ScopeDepthMismatch, at));
        }

        if !comp.blocks[succ].flags.defines_phi() {
            // A conditional branch with both arms on the same target merges
            // the identical state twice; nothing to do.
            return Ok(());
        }

        for i in 0..stack.len() {
            let phi = comp.entry_stack(succ)[i];
            self.add_source(comp, pred, phi, stack[i]);
        }
        for i in 0..scope.len() {
            let phi = comp.entry_scope(succ)[i];
            self.add_source(comp, pred, phi, scope[i]);
        }
        for i in 0..locals.len().min(comp.entry_locals(succ).len()) {
            let phi = comp.entry_locals(succ)[i];
            self.add_source(comp, pred, phi, locals[i]);
        }
        Ok(())
    }

    fn phi_row<F: Fn(u32) -> SlotRef>(
        &mut self,
        comp: &mut MethodCompilation,
        pred: Option<BlockId>,
        values: &[NodeId],
        slot: F,
    ) -> abclift_entity::pool::ListHandle<NodeId> {
        let mut row = Vec::with_capacity(values.len());
        for (i, &value) in values.iter().enumerate() {
            let phi = comp.new_node(slot(i as u32));
            comp.nodes[phi].flags.set_phi();
            comp.nodes[phi].ty = comp.nodes[value].ty;
            self.add_source(comp, pred, phi, value);
            row.push(phi);
        }
        comp.node_lists.alloc(&row)
    }

    fn add_source(
        &mut self,
        comp: &mut MethodCompilation,
        pred: Option<BlockId>,
        phi: NodeId,
        source: NodeId,
    ) {
        if add_phi_source(comp, phi, source) {
            if let Some(pred) = pred {
                let pairs = &mut comp.exit_phi_sources[pred];
                if !pairs.contains(&(source, phi)) {
                    pairs.push((source, phi));
                }
            }
        }
    }

    /// Abstractly execute `block` and merge the exit state into the
    /// successors.
    fn simulate(&mut self, comp: &mut MethodCompilation, block: BlockId) -> CompileResult<()> {
        let mut st = State {
            stack: comp.entry_stack(block).to_vec(),
            scope: comp.entry_scope(block).to_vec(),
            locals: comp.entry_locals(block).to_vec(),
        };

        // Every handler protecting this block sees the block-entry locals as
        // possible catch-entry values.
        let chain = handler_chain(comp, block);
        for &h in &chain {
            self.contribute_catch_locals(comp, h, &st.locals);
        }
        trace!("dataflow in {} (handlers {:?})", block, chain);

        let first = comp.blocks[block].first_instr.index();
        let count = comp.blocks[block].instr_count as usize;
        for idx in first..first + count {
            let i = InstrId::new(idx);
            step(comp, i, &mut st, &chain, self)?;
        }

        match comp.blocks[block].exit {
            ExitKind::Return | ExitKind::Throw => Ok(()),
            _ => {
                let succs: SmallVec<[BlockId; 4]> =
                    comp.exit_blocks(block).iter().copied().collect();
                for succ in succs {
                    self.merge_into(comp, Some(block), succ, &st.stack, &st.scope, &st.locals)?;
                }
                Ok(())
            }
        }
    }

    /// A local write (or block entry) inside a try region feeds the catch
    /// block's entry phi for the same slot.
    fn contribute_catch_locals(
        &mut self,
        comp: &mut MethodCompilation,
        handler: HandlerId,
        locals: &[NodeId],
    ) {
        let catch_block = comp.block_lists.get(comp.handlers[handler].catch_block_chain)[0];
        for (i, &node) in locals.iter().enumerate() {
            if i >= comp.entry_locals(catch_block).len() {
                break;
            }
            let phi = comp.entry_locals(catch_block)[i];
            if phi != node {
                add_phi_source(comp, phi, node);
            }
        }
    }

    fn contribute_catch_local(
        &mut self,
        comp: &mut MethodCompilation,
        chain: &[HandlerId],
        slot: usize,
        node: NodeId,
    ) {
        for &h in chain {
            let catch_block = comp.block_lists.get(comp.handlers[h].catch_block_chain)[0];
            if slot < comp.entry_locals(catch_block).len() {
                let phi = comp.entry_locals(catch_block)[slot];
                if phi != node {
                    add_phi_source(comp, phi, node);
                }
            }
        }
    }
}

/// Record `source` in `phi`'s def list and `phi` in `source`'s use list.
/// Returns `false` if the edge was already present.
pub(crate) fn add_phi_source(comp: &mut MethodCompilation, phi: NodeId, source: NodeId) -> bool {
    if phi == source {
        return false;
    }
    let defs = comp.nodes[phi].defs;
    if comp.refs.contains(defs, NodeOrInstr::node(source)) {
        return false;
    }
    comp.refs.push(defs, NodeOrInstr::node(source));
    let uses = comp.nodes[source].uses;
    comp.refs.push(uses, NodeOrInstr::node(phi));
    true
}

fn handler_chain(comp: &MethodCompilation, block: BlockId) -> SmallVec<[HandlerId; 2]> {
    let mut chain = SmallVec::new();
    let mut cur = comp.blocks[block].handler.expand();
    while let Some(h) = cur {
        chain.push(h);
        cur = comp.handlers[h].parent.expand();
    }
    chain
}

struct State {
    stack: Vec<NodeId>,
    scope: Vec<NodeId>,
    locals: Vec<NodeId>,
}

/// Execute one instruction against the abstract state.
fn step(
    comp: &mut MethodCompilation,
    i: InstrId,
    st: &mut State,
    chain: &[HandlerId],
    builder: &mut Builder,
) -> CompileResult<()> {
    let op = comp.instrs[i].op;
    let data = comp.instrs[i].data;
    let mut pops: SmallVec<[NodeId; 8]> = SmallVec::new();

    macro_rules! pop {
        () => {{
            let node = st
                .stack
                .pop()
                .ok_or_else(|| CompileError::at(ErrorCode::StackUnderflow, i))?;
            let uses = comp.nodes[node].uses;
            comp.refs.push(uses, NodeOrInstr::instr(i));
            pops.push(node);
            node
        }};
    }
    macro_rules! pop_n {
        ($n:expr) => {{
            for _ in 0..$n {
                pop!();
            }
        }};
    }

    // Pop the runtime name parts of a multiname: name (top), then namespace.
    macro_rules! pop_name_parts {
        ($index:expr) => {{
            let mn = comp
                .env
                .multiname($index)
                .ok_or_else(|| CompileError::at(ErrorCode::InvalidConstantPoolIndex, i))?;
            let (rt_name, rt_ns) = (mn.has_runtime_name(), mn.has_runtime_ns());
            if rt_name {
                let n = pop!();
                comp.nodes[n].flags.set_late_multiname();
            }
            if rt_ns {
                let n = pop!();
                comp.nodes[n].flags.set_late_multiname();
            }
        }};
    }

    match op {
        // Constants.
        Op::PushNull => {
            push_const(comp, st, i, DataType::Null, ConstValue::Null);
        }
        Op::PushUndefined => {
            push_const(comp, st, i, DataType::Undefined, ConstValue::Undefined);
        }
        Op::PushTrue => {
            push_const(comp, st, i, DataType::Bool, ConstValue::Bool(true));
        }
        Op::PushFalse => {
            push_const(comp, st, i, DataType::Bool, ConstValue::Bool(false));
        }
        Op::PushByte | Op::PushShort => {
            let v = match data {
                InstrData::Int(v) => v,
                _ => unreachable!(),
            };
            push_const(comp, st, i, DataType::Int, ConstValue::Int(v));
        }
        Op::PushString => {
            let s = comp
                .env
                .string(pool_index(&data))
                .ok_or_else(|| CompileError::at(ErrorCode::InvalidConstantPoolIndex, i))?;
            let value = ConstValue::String(Arc::from(s));
            push_const(comp, st, i, DataType::String, value);
        }
        Op::PushInt => {
            let v = comp
                .env
                .int(pool_index(&data))
                .ok_or_else(|| CompileError::at(ErrorCode::InvalidConstantPoolIndex, i))?;
            push_const(comp, st, i, DataType::Int, ConstValue::Int(v));
        }
        Op::PushUint => {
            let v = comp
                .env
                .uint(pool_index(&data))
                .ok_or_else(|| CompileError::at(ErrorCode::InvalidConstantPoolIndex, i))?;
            push_const(comp, st, i, DataType::Uint, ConstValue::Uint(v));
        }
        Op::PushDouble => {
            let v = comp
                .env
                .double(pool_index(&data))
                .ok_or_else(|| CompileError::at(ErrorCode::InvalidConstantPoolIndex, i))?;
            push_const(comp, st, i, DataType::Number, ConstValue::Number(v));
        }
        Op::PushNamespace => {
            let ns = comp
                .env
                .namespace(pool_index(&data))
                .ok_or_else(|| CompileError::at(ErrorCode::InvalidConstantPoolIndex, i))?
                .clone();
            push_const(comp, st, i, DataType::Namespace, ConstValue::Namespace(ns));
        }

        // Stack shuffles.
        Op::Pop => {
            pop!();
        }
        Op::Dup => {
            let top = *st
                .stack
                .last()
                .ok_or_else(|| CompileError::at(ErrorCode::StackUnderflow, i))?;
            let node = push_value(comp, st, i, comp.nodes[top].ty);
            comp.nodes[node].value = comp.nodes[top].value.clone();
            if comp.nodes[top].flags.is_constant() {
                comp.nodes[node].flags.set_constant();
            }
            let defs = comp.nodes[node].defs;
            comp.refs.push(defs, NodeOrInstr::node(top));
            let uses = comp.nodes[top].uses;
            comp.refs.push(uses, NodeOrInstr::node(node));
        }
        Op::Swap => {
            let len = st.stack.len();
            if len < 2 {
                return Err(CompileError::at(ErrorCode::StackUnderflow, i));
            }
            st.stack.swap(len - 1, len - 2);
        }

        // Locals.
        Op::GetLocal => {
            let idx = local_index(comp, i, &data, st)?;
            // The slot's node itself goes on the stack; no copy.
            st.stack.push(st.locals[idx]);
            comp.instrs[i].pushed_node = st.locals[idx].into();
        }
        Op::SetLocal => {
            let idx = local_index(comp, i, &data, st)?;
            let v = pop!();
            let node = new_local(comp, idx, comp.nodes[v].ty);
            comp.nodes[node].value = comp.nodes[v].value.clone();
            if comp.nodes[v].flags.is_constant() {
                comp.nodes[node].flags.set_constant();
            }
            let defs = comp.nodes[node].defs;
            comp.refs.push(defs, NodeOrInstr::node(v));
            let uses = comp.nodes[v].uses;
            comp.refs.push(uses, NodeOrInstr::node(node));
            write_local(comp, st, chain, builder, i, idx, node);
        }
        Op::Kill => {
            let idx = local_index(comp, i, &data, st)?;
            let node = new_local(comp, idx, DataType::Undefined);
            comp.nodes[node].value = ConstValue::Undefined;
            comp.nodes[node].flags.set_constant();
            write_local(comp, st, chain, builder, i, idx, node);
        }
        Op::IncLocal | Op::DecLocal | Op::IncLocalI | Op::DecLocalI => {
            let idx = local_index(comp, i, &data, st)?;
            let old = st.locals[idx];
            let ty = if op == Op::IncLocal || op == Op::DecLocal {
                DataType::Number
            } else {
                DataType::Int
            };
            let node = new_local(comp, idx, ty);
            let defs = comp.nodes[node].defs;
            comp.refs.push(defs, NodeOrInstr::node(old));
            let uses = comp.nodes[old].uses;
            comp.refs.push(uses, NodeOrInstr::node(node));
            comp.refs.push(uses, NodeOrInstr::instr(i));
            write_local(comp, st, chain, builder, i, idx, node);
        }
        Op::HasNext2 => {
            let (obj, index) = match data {
                InstrData::HasNext2 { object, index } => (object as usize, index as usize),
                _ => unreachable!(),
            };
            if obj >= st.locals.len() || index >= st.locals.len() {
                return Err(CompileError::at(ErrorCode::LocalIndexOutOfBounds, i));
            }
            for &(slot, ty) in &[(obj, DataType::Any), (index, DataType::Int)] {
                let node = new_local(comp, slot, ty);
                let defs = comp.nodes[node].defs;
                comp.refs.push(defs, NodeOrInstr::instr(i));
                write_local(comp, st, chain, builder, i, slot, node);
            }
            push_value(comp, st, i, DataType::Bool);
        }
        Op::HasNext => {
            pop_n!(2);
            push_value(comp, st, i, DataType::Int);
        }
        Op::NextName | Op::NextValue => {
            pop_n!(2);
            push_value(comp, st, i, DataType::Any);
        }

        // Scope stack.
        Op::PushScope | Op::PushWith => {
            let v = pop!();
            let node = comp.new_node(SlotRef::scope(st.scope.len() as u32));
            comp.nodes[node].ty = comp.nodes[v].ty;
            if op == Op::PushWith {
                comp.nodes[node].flags.set_with_scope();
            }
            let defs = comp.nodes[node].defs;
            comp.refs.push(defs, NodeOrInstr::node(v));
            let uses = comp.nodes[v].uses;
            comp.refs.push(uses, NodeOrInstr::node(node));
            st.scope.push(node);
        }
        Op::PopScope => {
            st.scope
                .pop()
                .ok_or_else(|| CompileError::at(ErrorCode::ScopeStackUnderflow, i))?;
        }
        Op::GetScopeObject => {
            let k = match data {
                InstrData::ScopeIndex(k) => k as usize,
                _ => unreachable!(),
            };
            if k >= st.scope.len() {
                return Err(CompileError::at(ErrorCode::ScopeStackUnderflow, i));
            }
            st.stack.push(st.scope[k]);
            comp.instrs[i].pushed_node = st.scope[k].into();
        }
        Op::GetGlobalScope => {
            let node = push_value(comp, st, i, DataType::Global);
            comp.nodes[node].flags.set_not_null();
        }

        // Control transfers.
        Op::Jump | Op::Label | Op::Nop | Op::Bkpt | Op::Timestamp | Op::Debug | Op::DebugLine
        | Op::DebugFile | Op::BkptLine => {}
        Op::IfTrue | Op::IfFalse => {
            pop!();
        }
        Op::IfEq | Op::IfNe | Op::IfLt | Op::IfLe | Op::IfGt | Op::IfGe | Op::IfStrictEq
        | Op::IfStrictNe | Op::IfNlt | Op::IfNle | Op::IfNgt | Op::IfNge => {
            pop_n!(2);
        }
        Op::LookupSwitch => {
            pop!();
        }
        Op::ReturnValue => {
            // Coercion to the declared return type is the generator's job;
            // it is a per-site conversion, not a property of the node.
            pop!();
        }
        Op::ReturnVoid => {}
        Op::Throw => {
            pop!();
        }

        // DXNS.
        Op::Dxns => {
            if !comp.env.signature().sets_dxns {
                comp.runtime_failures[i] =
                    Some(crate::compilation::RuntimeFailure::IllegalDefaultXmlNamespace);
            }
        }
        Op::DxnsLate => {
            pop!();
            if !comp.env.signature().sets_dxns {
                comp.runtime_failures[i] =
                    Some(crate::compilation::RuntimeFailure::IllegalDefaultXmlNamespace);
            }
        }

        // Global memory.
        Op::Li8 | Op::Li16 | Op::Li32 | Op::Sxi1 | Op::Sxi8 | Op::Sxi16 => {
            pop!();
            push_value(comp, st, i, DataType::Int);
        }
        Op::Lf32 | Op::Lf64 => {
            pop!();
            push_value(comp, st, i, DataType::Number);
        }
        Op::Si8 | Op::Si16 | Op::Si32 | Op::Sf32 | Op::Sf64 => {
            pop_n!(2);
        }

        // Property and call family: operand traffic here, binding and result
        // types in the semantic analyzer.
        Op::FindPropStrict | Op::FindProperty | Op::FindDef => {
            pop_name_parts!(name_index(&data));
            comp.scope_at[i] = st.scope.clone();
            push_value(comp, st, i, DataType::Unknown);
        }
        Op::GetLex => {
            comp.scope_at[i] = st.scope.clone();
            push_value(comp, st, i, DataType::Unknown);
        }
        Op::GetProperty | Op::GetSuper => {
            pop_name_parts!(name_index(&data));
            pop!();
            push_value(comp, st, i, DataType::Unknown);
        }
        Op::GetDescendants => {
            pop_name_parts!(name_index(&data));
            pop!();
            let xml_list = comp.registry.builtin(abclift_abc::Builtin::XmlList);
            push_value(comp, st, i, DataType::Object(xml_list));
        }
        Op::SetProperty | Op::InitProperty | Op::SetSuper => {
            pop!(); // value
            pop_name_parts!(name_index(&data));
            pop!(); // object
        }
        Op::DeleteProperty => {
            pop_name_parts!(name_index(&data));
            pop!();
            push_value(comp, st, i, DataType::Bool);
        }
        Op::GetSlot => {
            pop!();
            push_value(comp, st, i, DataType::Unknown);
        }
        Op::SetSlot => {
            pop_n!(2);
        }
        Op::GetGlobalSlot => {
            push_value(comp, st, i, DataType::Unknown);
        }
        Op::SetGlobalSlot => {
            pop!();
        }
        Op::Call => {
            pop_n!(comp.instrs[i].argc());
            pop_n!(2); // receiver, function
            push_value(comp, st, i, DataType::Any);
        }
        Op::Construct => {
            pop_n!(comp.instrs[i].argc());
            let ctor = pop!();
            let ty = match comp.nodes[ctor].ty {
                DataType::Class(Some(c)) => DataType::Object(c),
                _ => DataType::Unknown,
            };
            let node = push_value(comp, st, i, ty);
            comp.nodes[node].flags.set_not_null();
        }
        Op::ConstructSuper => {
            pop_n!(comp.instrs[i].argc());
            pop!();
        }
        Op::CallProperty | Op::CallPropLex | Op::CallSuper => {
            pop_n!(comp.instrs[i].argc());
            pop_name_parts!(name_index(&data));
            pop!();
            push_value(comp, st, i, DataType::Unknown);
        }
        Op::CallPropVoid | Op::CallSuperVoid => {
            pop_n!(comp.instrs[i].argc());
            pop_name_parts!(name_index(&data));
            pop!();
        }
        Op::ConstructProp => {
            pop_n!(comp.instrs[i].argc());
            pop_name_parts!(name_index(&data));
            pop!();
            let node = push_value(comp, st, i, DataType::Unknown);
            comp.nodes[node].flags.set_not_null();
        }
        Op::CallMethod | Op::CallStatic => {
            pop_n!(comp.instrs[i].argc());
            pop!();
            let method = match data {
                InstrData::MethodArgc { method, .. } => method,
                _ => unreachable!(),
            };
            let ty = match comp.env.method_signature(method) {
                Some(sig) => comp.data_type(sig.return_type),
                None => DataType::Any,
            };
            push_value(comp, st, i, ty);
        }

        // Allocation.
        Op::NewFunction => {
            let node = push_value(comp, st, i, DataType::Function);
            comp.nodes[node].flags.set_not_null();
        }
        Op::NewClass => {
            pop!(); // base class
            let class = comp.env.class_at(pool_index(&data));
            let node = push_value(comp, st, i, DataType::Class(class));
            comp.nodes[node].flags.set_not_null();
        }
        Op::NewActivation | Op::NewCatch => {
            let object = comp.registry.builtin(abclift_abc::Builtin::Object);
            let node = push_value(comp, st, i, DataType::Object(object));
            comp.nodes[node].flags.set_not_null();
        }
        Op::NewArray => {
            pop_n!(comp.instrs[i].argc());
            let array = comp.registry.builtin(abclift_abc::Builtin::Array);
            let node = push_value(comp, st, i, DataType::Object(array));
            comp.nodes[node].flags.set_not_null();
        }
        Op::NewObject => {
            pop_n!(2 * comp.instrs[i].argc());
            let object = comp.registry.builtin(abclift_abc::Builtin::Object);
            let node = push_value(comp, st, i, DataType::Object(object));
            comp.nodes[node].flags.set_not_null();
        }
        Op::ApplyType => {
            pop_n!(comp.instrs[i].argc());
            pop!();
            // The instantiation is a class object; which one depends on the
            // runtime type arguments, so the payload stays open.
            let node = push_value(comp, st, i, DataType::Class(None));
            comp.nodes[node].flags.set_not_null();
        }

        // Type tests and coercions with a compile-time name.
        Op::Coerce | Op::AsType => {
            pop!();
            let mn = comp
                .env
                .multiname(name_index(&data))
                .ok_or_else(|| CompileError::at(ErrorCode::InvalidConstantPoolIndex, i))?;
            let ty = match comp.registry.class_by_multiname(mn) {
                Some(resolved) => comp.data_type(resolved),
                None => DataType::Any,
            };
            push_value(comp, st, i, ty);
        }
        Op::IsType => {
            pop!();
            push_value(comp, st, i, DataType::Bool);
        }
        Op::IsTypeLate | Op::InstanceOf | Op::In => {
            pop_n!(2);
            push_value(comp, st, i, DataType::Bool);
        }
        Op::AsTypeLate => {
            let class = pop!();
            pop!();
            let ty = match comp.nodes[class].ty {
                DataType::Class(Some(c)) => DataType::Object(c),
                _ => DataType::Any,
            };
            push_value(comp, st, i, ty);
        }

        // Everything else is a pure value op: pop per arity, type and fold
        // via the shared table.
        _ => {
            let arity = value_op_arity(op);
            pop_n!(arity);
            let mut ordered = pops.clone();
            ordered.reverse(); // bottom-to-top, as the shared table expects
            let ty = value_output_type(comp, op, &ordered);
            let node = push_value(comp, st, i, ty);
            for k in 0..ordered.len() {
                let defs = comp.nodes[node].defs;
                comp.refs.push(defs, NodeOrInstr::node(ordered[k]));
                let uses = comp.nodes[ordered[k]].uses;
                comp.refs.push(uses, NodeOrInstr::node(node));
            }
            if comp.settings.fold_constants {
                fold_constant(comp, op, &ordered, node);
            }
        }
    }

    // Record stack inputs bottom-to-top.
    if !pops.is_empty() {
        pops.reverse();
        comp.instrs[i].popped_nodes = comp.node_lists.alloc(&pops);
    }

    // Value-op outputs list their inputs as defs; everything else defines
    // its output by the instruction itself.
    if let Some(node) = comp.instrs[i].pushed_node.expand() {
        if comp.refs.len(comp.nodes[node].defs) == 0 {
            let defs = comp.nodes[node].defs;
            comp.refs.push(defs, NodeOrInstr::instr(i));
        }
    }
    Ok(())
}

fn pool_index(data: &InstrData) -> u32 {
    match data {
        InstrData::Pool(v) => *v,
        _ => unreachable!("pool payload"),
    }
}

fn name_index(data: &InstrData) -> u32 {
    match data {
        InstrData::Name(v) | InstrData::NameArgc { name: v, .. } => *v,
        _ => unreachable!("multiname payload"),
    }
}

fn local_index(
    comp: &MethodCompilation,
    i: InstrId,
    data: &InstrData,
    st: &State,
) -> CompileResult<usize> {
    let idx = match data {
        InstrData::Local(idx) => *idx as usize,
        _ => unreachable!("local payload"),
    };
    if idx >= st.locals.len() {
        return Err(CompileError::at(ErrorCode::LocalIndexOutOfBounds, i));
    }
    Ok(idx)
}

fn push_value(comp: &mut MethodCompilation, st: &mut State, i: InstrId, ty: DataType) -> NodeId {
    let node = comp.new_node(SlotRef::stack(st.stack.len() as u32));
    comp.nodes[node].ty = ty;
    st.stack.push(node);
    comp.instrs[i].pushed_node = node.into();
    node
}

fn push_const(
    comp: &mut MethodCompilation,
    st: &mut State,
    i: InstrId,
    ty: DataType,
    value: ConstValue,
) -> NodeId {
    let node = push_value(comp, st, i, ty);
    comp.nodes[node].value = value;
    comp.nodes[node].flags.set_constant();
    node
}

fn new_local(comp: &mut MethodCompilation, idx: usize, ty: DataType) -> NodeId {
    let node = comp.new_node(SlotRef::local(idx as u32));
    comp.nodes[node].ty = ty;
    node
}

fn write_local(
    comp: &mut MethodCompilation,
    st: &mut State,
    chain: &[HandlerId],
    builder: &mut Builder,
    _i: InstrId,
    idx: usize,
    node: NodeId,
) {
    st.locals[idx] = node;
    if !chain.is_empty() {
        comp.nodes[node].flags.set_local_write_through();
        builder.contribute_catch_local(comp, chain, idx, node);
    }
}

/// Stack arity of the pure value opcodes handled by the shared table.
fn value_op_arity(op: Op) -> u32 {
    match op {
        Op::Add | Op::AddI | Op::Subtract | Op::SubtractI | Op::Multiply | Op::MultiplyI
        | Op::Divide | Op::Modulo | Op::LShift | Op::RShift | Op::UrShift | Op::BitAnd
        | Op::BitOr | Op::BitXor | Op::Equals | Op::StrictEquals | Op::LessThan
        | Op::LessEquals | Op::GreaterThan | Op::GreaterEquals => 2,
        _ => 1,
    }
}

/// Output type of a pure value opcode given its popped inputs (top-last).
pub(crate) fn value_output_type(comp: &MethodCompilation, op: Op, pops: &[NodeId]) -> DataType {
    let ty = |k: usize| comp.nodes[pops[pops.len() - 1 - k]].ty; // k = 0 is top
    match op {
        Op::Add => {
            let (b, a) = (ty(0), ty(1));
            if a == DataType::String || b == DataType::String {
                DataType::String
            } else {
                numeric_result(a, b)
            }
        }
        Op::Subtract | Op::Multiply => numeric_result(ty(1), ty(0)),
        Op::Divide | Op::Modulo | Op::Negate | Op::Increment | Op::Decrement => DataType::Number,
        Op::AddI | Op::SubtractI | Op::MultiplyI | Op::NegateI | Op::IncrementI
        | Op::DecrementI => DataType::Int,
        Op::LShift | Op::RShift | Op::BitAnd | Op::BitOr | Op::BitXor | Op::BitNot => {
            DataType::Int
        }
        Op::UrShift => DataType::Uint,
        Op::Equals | Op::StrictEquals | Op::LessThan | Op::LessEquals | Op::GreaterThan
        | Op::GreaterEquals | Op::Not => DataType::Bool,
        Op::TypeOf => DataType::String,
        Op::ConvertI => DataType::Int,
        Op::ConvertU => DataType::Uint,
        Op::ConvertD => DataType::Number,
        Op::ConvertB => DataType::Bool,
        Op::ConvertS | Op::CoerceS | Op::EscXElem | Op::EscXAttr => DataType::String,
        Op::CoerceA => DataType::Any,
        Op::ConvertO | Op::CoerceO | Op::CheckFilter => {
            let t = ty(0);
            if t.is_reference() {
                t
            } else {
                DataType::Any
            }
        }
        _ => DataType::Any,
    }
}

/// `int + int` stays `int`; any other numeric pairing widens to `Number`;
/// non-numeric operands widen to `*`.
fn numeric_result(a: DataType, b: DataType) -> DataType {
    match (a, b) {
        (DataType::Int, DataType::Int) => DataType::Int,
        (DataType::Uint, DataType::Uint) => DataType::Uint,
        _ if a.is_numeric() && b.is_numeric() => DataType::Number,
        (DataType::Bool, _) | (_, DataType::Bool) => DataType::Number,
        _ => DataType::Any,
    }
}

/// Fold a value op whose inputs are all constants into a constant output.
fn fold_constant(comp: &mut MethodCompilation, op: Op, pops: &[NodeId], out: NodeId) {
    if pops.is_empty() || !pops.iter().all(|&p| comp.nodes[p].flags.is_constant()) {
        return;
    }
    let value = |k: usize| comp.nodes[pops[pops.len() - 1 - k]].value.clone(); // k = 0 is top
    let folded: Option<(DataType, ConstValue)> = match op {
        Op::Add => match (value(1), value(0)) {
            (ConstValue::String(a), ConstValue::String(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(&a);
                s.push_str(&b);
                Some((DataType::String, ConstValue::String(Arc::from(&s[..]))))
            }
            (ConstValue::Int(a), ConstValue::Int(b)) => {
                let wide = a as i64 + b as i64;
                if wide >= i32::min_value() as i64 && wide <= i32::max_value() as i64 {
                    Some((DataType::Int, ConstValue::Int(wide as i32)))
                } else {
                    Some((DataType::Number, ConstValue::Number(wide as f64)))
                }
            }
            (a, b) => both_numbers(&a, &b).map(|(x, y)| {
                (DataType::Number, ConstValue::Number(x + y))
            }),
        },
        Op::Subtract => fold_int_preserving(value(1), value(0), |a, b| a - b, |a, b| a - b),
        Op::Multiply => fold_int_preserving(value(1), value(0), |a, b| a * b, |a, b| a * b),
        Op::Divide => fold_numeric(value(1), value(0), |a, b| a / b),
        Op::Modulo => fold_numeric(value(1), value(0), |a, b| a % b),
        Op::AddI => fold_int(value(1), value(0), |a, b| a.wrapping_add(b)),
        Op::SubtractI => fold_int(value(1), value(0), |a, b| a.wrapping_sub(b)),
        Op::MultiplyI => fold_int(value(1), value(0), |a, b| a.wrapping_mul(b)),
        Op::Negate => value(0)
            .to_number()
            .map(|v| (DataType::Number, ConstValue::Number(-v))),
        Op::NegateI => match value(0) {
            ConstValue::Int(v) => Some((DataType::Int, ConstValue::Int(v.wrapping_neg()))),
            _ => None,
        },
        Op::Not => value(0)
            .to_bool()
            .map(|v| (DataType::Bool, ConstValue::Bool(!v))),
        Op::LessThan => fold_compare(value(1), value(0), |a, b| a < b),
        Op::LessEquals => fold_compare(value(1), value(0), |a, b| a <= b),
        Op::GreaterThan => fold_compare(value(1), value(0), |a, b| a > b),
        Op::GreaterEquals => fold_compare(value(1), value(0), |a, b| a >= b),
        Op::Equals | Op::StrictEquals => match (value(1), value(0)) {
            (ConstValue::String(a), ConstValue::String(b)) => {
                Some((DataType::Bool, ConstValue::Bool(a == b)))
            }
            (ConstValue::Bool(a), ConstValue::Bool(b)) => {
                Some((DataType::Bool, ConstValue::Bool(a == b)))
            }
            (a, b) => both_numbers(&a, &b).map(|(x, y)| {
                (DataType::Bool, ConstValue::Bool(x == y))
            }),
        },
        Op::ConvertI => value(0).to_number().map(|v| {
            (DataType::Int, ConstValue::Int(to_int32(v)))
        }),
        Op::ConvertU => value(0).to_number().map(|v| {
            (DataType::Uint, ConstValue::Uint(to_int32(v) as u32))
        }),
        Op::ConvertD => value(0)
            .to_number()
            .map(|v| (DataType::Number, ConstValue::Number(v))),
        Op::ConvertB => value(0)
            .to_bool()
            .map(|v| (DataType::Bool, ConstValue::Bool(v))),
        Op::BitAnd => fold_bits(value(1), value(0), |a, b| a & b),
        Op::BitOr => fold_bits(value(1), value(0), |a, b| a | b),
        Op::BitXor => fold_bits(value(1), value(0), |a, b| a ^ b),
        Op::LShift => fold_bits(value(1), value(0), |a, b| a << (b & 31)),
        Op::RShift => fold_bits(value(1), value(0), |a, b| a >> (b & 31)),
        Op::BitNot => match value(0) {
            ConstValue::Int(v) => Some((DataType::Int, ConstValue::Int(!v))),
            _ => None,
        },
        _ => None,
    };

    if let Some((ty, value)) = folded {
        comp.nodes[out].ty = ty;
        comp.nodes[out].value = value;
        comp.nodes[out].flags.set_constant();
    }
}

fn both_numbers(a: &ConstValue, b: &ConstValue) -> Option<(f64, f64)> {
    Some((a.to_number()?, b.to_number()?))
}

fn fold_numeric(
    a: ConstValue,
    b: ConstValue,
    f: impl Fn(f64, f64) -> f64,
) -> Option<(DataType, ConstValue)> {
    both_numbers(&a, &b).map(|(x, y)| (DataType::Number, ConstValue::Number(f(x, y))))
}

/// Fold over two int constants stays int while the exact result fits;
/// anything else goes through the float path.
fn fold_int_preserving(
    a: ConstValue,
    b: ConstValue,
    fi: impl Fn(i64, i64) -> i64,
    ff: impl Fn(f64, f64) -> f64,
) -> Option<(DataType, ConstValue)> {
    if let (ConstValue::Int(x), ConstValue::Int(y)) = (&a, &b) {
        let wide = fi(*x as i64, *y as i64);
        if wide >= i32::min_value() as i64 && wide <= i32::max_value() as i64 {
            return Some((DataType::Int, ConstValue::Int(wide as i32)));
        }
        return Some((DataType::Number, ConstValue::Number(wide as f64)));
    }
    fold_numeric(a, b, ff)
}

fn fold_int(a: ConstValue, b: ConstValue, f: impl Fn(i32, i32) -> i32) -> Option<(DataType, ConstValue)> {
    both_numbers(&a, &b).map(|(x, y)| {
        (
            DataType::Int,
            ConstValue::Int(f(to_int32(x), to_int32(y))),
        )
    })
}

fn fold_bits(a: ConstValue, b: ConstValue, f: impl Fn(i32, i32) -> i32) -> Option<(DataType, ConstValue)> {
    fold_int(a, b, f)
}

fn fold_compare(
    a: ConstValue,
    b: ConstValue,
    f: impl Fn(f64, f64) -> bool,
) -> Option<(DataType, ConstValue)> {
    both_numbers(&a, &b).map(|(x, y)| (DataType::Bool, ConstValue::Bool(f(x, y))))
}

/// ECMA-262 ToInt32.
pub(crate) fn to_int32(v: f64) -> i32 {
    if !v.is_finite() {
        return 0;
    }
    let m = v.trunc() % 4294967296.0;
    let m = if m < 0.0 { m + 4294967296.0 } else { m };
    if m >= 2147483648.0 {
        (m - 4294967296.0) as i32
    } else {
        m as i32
    }
}

/// Join the types of two merged values.
pub(crate) fn join_types(comp: &MethodCompilation, a: DataType, b: DataType) -> DataType {
    use DataType::*;
    if a == b {
        return a;
    }
    match (a, b) {
        (Unknown, x) | (x, Unknown) => x,
        (Null, x) | (x, Null) if x.is_reference() => x,
        (Int, Uint) | (Uint, Int) | (Int, Number) | (Number, Int) | (Uint, Number)
        | (Number, Uint) => Number,
        _ => {
            let (ca, cb) = (a.instance_class(), b.instance_class());
            match (ca, cb) {
                (Some(ca), Some(cb)) => match comp.registry.common_base(ca, cb) {
                    Some(base) => Object(base),
                    None => Any,
                },
                _ => Any,
            }
        }
    }
}

/// Iterate phi-type joins and dependent value-op types to a fixed point.
///
/// Also reused by the semantic analyzer after property resolution refines
/// the types it owns.
pub(crate) fn fixup_types(comp: &mut MethodCompilation) {
    for _ in 0..50 {
        let mut changed = false;
        for node in comp.nodes.keys().collect::<Vec<NodeId>>() {
            if !comp.nodes[node].flags.is_phi() {
                continue;
            }
            let mut joined = DataType::Unknown;
            for k in 0..comp.refs.len(comp.nodes[node].defs) {
                if let Some(src) = comp.refs.get(comp.nodes[node].defs)[k].as_node() {
                    joined = join_types(comp, joined, comp.nodes[src].ty);
                }
            }
            if joined != DataType::Unknown && comp.nodes[node].ty != joined {
                comp.nodes[node].ty = joined;
                changed = true;
            }
        }
        for i in comp.instrs.keys().collect::<Vec<InstrId>>() {
            let op = comp.instrs[i].op;
            if !is_shared_value_op(op) {
                continue;
            }
            if let Some(out) = comp.instrs[i].pushed_node.expand() {
                if comp.nodes[out].flags.is_constant() {
                    continue;
                }
                let pops: SmallVec<[NodeId; 2]> = comp
                    .node_lists
                    .get(comp.instrs[i].popped_nodes)
                    .iter()
                    .copied()
                    .collect();
                let ty = value_output_type(comp, op, &pops);
                if ty != DataType::Unknown && comp.nodes[out].ty != ty {
                    comp.nodes[out].ty = ty;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

fn is_shared_value_op(op: Op) -> bool {
    match op {
        Op::Add | Op::AddI | Op::Subtract | Op::SubtractI | Op::Multiply | Op::MultiplyI
        | Op::Divide | Op::Modulo | Op::Negate | Op::NegateI | Op::Increment | Op::Decrement
        | Op::IncrementI | Op::DecrementI | Op::LShift | Op::RShift | Op::UrShift | Op::BitAnd
        | Op::BitOr | Op::BitXor | Op::BitNot | Op::Equals | Op::StrictEquals | Op::LessThan
        | Op::LessEquals | Op::GreaterThan | Op::GreaterEquals | Op::Not | Op::TypeOf
        | Op::ConvertI | Op::ConvertU | Op::ConvertD | Op::ConvertB | Op::ConvertS
        | Op::CoerceS | Op::CoerceA | Op::ConvertO | Op::CoerceO => true,
        _ => false,
    }
}

/// Mark folded constants the generator can rematerialize at the consumer.
///
/// Safe only when the node feeds exactly one instruction and every operand
/// from its position to the top of that instruction's input list is also a
/// skippable constant; otherwise the push order on the real stack would
/// diverge from the abstract one.
fn mark_no_push(comp: &mut MethodCompilation) {
    for i in comp.instrs.keys().collect::<Vec<InstrId>>() {
        let pops: SmallVec<[NodeId; 8]> = comp
            .node_lists
            .get(comp.instrs[i].popped_nodes)
            .iter()
            .copied()
            .collect();
        if pops.is_empty() {
            continue;
        }

        let out_const = comp.instrs[i]
            .pushed_node
            .expand()
            .map_or(false, |n| comp.nodes[n].flags.is_constant());

        if out_const {
            // The whole computation folded; none of the inputs are needed.
            for &p in &pops {
                if eligible_no_push(comp, p) {
                    comp.nodes[p].flags.set_no_push();
                }
            }
        } else {
            for &p in pops.iter().rev() {
                if comp.nodes[p].flags.is_constant() && eligible_no_push(comp, p) {
                    comp.nodes[p].flags.set_no_push();
                } else {
                    break;
                }
            }
        }
    }
}

/// A node may skip its push only if exactly one instruction consumes it and
/// no phi does (a phi source must be live on the real stack or in a local at
/// the transition).
fn eligible_no_push(comp: &MethodCompilation, node: NodeId) -> bool {
    let uses = comp.nodes[node].uses;
    let mut instr_uses = 0;
    for k in 0..comp.refs.len(uses) {
        match comp.refs.get(uses)[k].as_node() {
            Some(n) if comp.nodes[n].flags.is_phi() => return false,
            Some(_) => {}
            None => instr_uses += 1,
        }
    }
    instr_uses == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, domtree, exceptions, flowgraph};
    use abclift_abc::asm::Assembler;
    use abclift_abc::env::{DummyEnvironment, DummyRegistry, ExceptionRecord};
    use abclift_abc::{Builtin, ClassRegistry, MethodSignature, TypeRef};

    fn analyze<'a>(
        env: &'a DummyEnvironment,
        reg: &'a DummyRegistry,
    ) -> CompileResult<MethodCompilation<'a>> {
        let mut comp = MethodCompilation::new(env, reg);
        decode::run(&mut comp)?;
        flowgraph::run(&mut comp)?;
        exceptions::run(&mut comp)?;
        domtree::run(&mut comp);
        run(&mut comp)?;
        Ok(comp)
    }

    fn int_method(reg: &DummyRegistry, params: usize) -> MethodSignature {
        let int_t = TypeRef::Class(reg.builtin(Builtin::Int));
        MethodSignature {
            params: vec![int_t; params],
            optional_from: None,
            has_rest: false,
            needs_arguments: false,
            sets_dxns: false,
            return_type: int_t,
        }
    }

    #[test]
    fn straight_line_add_types_and_defs() {
        // S1: getlocal_0; getlocal_1; add; returnvalue with two int params.
        let mut asm = Assembler::new();
        asm.op(Op::GetLocal1);
        asm.op(Op::GetLocal2);
        asm.op(Op::Add);
        asm.op(Op::ReturnValue);
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.set_signature(int_method(&reg, 2));
        env.set_local_count(3);
        let comp = analyze(&env, &reg).unwrap();

        let add = InstrId::new(2);
        let out = comp.instrs[add].pushed_node.expand().unwrap();
        assert_eq!(comp.nodes[out].ty, DataType::Int);

        // The add output's defs are exactly the two parameter nodes.
        let defs = comp.refs.get(comp.nodes[out].defs);
        assert_eq!(defs.len(), 2);
        for d in defs {
            let param = d.as_node().unwrap();
            assert!(comp.nodes[param].flags.is_argument());
            assert_eq!(comp.nodes[param].ty, DataType::Int);
        }
        // And the popped list records them bottom-to-top.
        let pops = comp.node_lists.get(comp.instrs[add].popped_nodes);
        assert_eq!(pops.len(), 2);
    }

    #[test]
    fn conditional_has_no_phis() {
        // S2: both arms return; the join never materializes.
        let mut asm = Assembler::new();
        asm.op(Op::GetLocal1);
        asm.op_byte(Op::PushByte, 0);
        let l1 = asm.label();
        asm.branch(Op::IfGt, l1);
        asm.op_byte(Op::PushByte, 1);
        asm.op(Op::ReturnValue);
        asm.place(l1);
        asm.op_byte(Op::PushByte, 2);
        asm.op(Op::ReturnValue);
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.set_signature(int_method(&reg, 1));
        env.set_local_count(2);
        let comp = analyze(&env, &reg).unwrap();

        assert!(comp.nodes.values().all(|n| !n.flags.is_phi()));
        assert_eq!(comp.blocks.len(), 3);
    }

    #[test]
    fn loop_builds_local_phi() {
        // S3: pushbyte 0; setlocal 1; L0: getlocal 1; pushbyte 10; iflt END;
        // getlocal 1; pushbyte 1; add; setlocal 1; jump L0; END: getlocal 1;
        // returnvalue
        let mut asm = Assembler::new();
        asm.op_byte(Op::PushByte, 0);
        asm.op_u30(Op::SetLocal, 1);
        let l0 = asm.here();
        asm.op_u30(Op::GetLocal, 1);
        asm.op_byte(Op::PushByte, 10);
        let end = asm.label();
        asm.branch(Op::IfLt, end);
        asm.op_u30(Op::GetLocal, 1);
        asm.op_byte(Op::PushByte, 1);
        asm.op(Op::Add);
        asm.op_u30(Op::SetLocal, 1);
        asm.branch(Op::Jump, l0);
        asm.place(end);
        asm.op_u30(Op::GetLocal, 1);
        asm.op(Op::ReturnValue);
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.set_local_count(2);
        let comp = analyze(&env, &reg).unwrap();

        // Exactly one phi, on local slot 1 at the loop header.
        let phis: Vec<NodeId> = comp
            .nodes
            .keys()
            .filter(|&n| comp.nodes[n].flags.is_phi())
            .collect();
        assert_eq!(phis.len(), 1);
        let phi = phis[0];
        assert_eq!(comp.nodes[phi].slot.kind, crate::ir::SlotKind::Local);
        assert_eq!(comp.nodes[phi].slot.index, 1);

        // Two sources: the initial 0 and the add result.
        let defs = comp.refs.get(comp.nodes[phi].defs);
        assert_eq!(defs.len(), 2);
        let sources: Vec<NodeId> = defs.iter().map(|d| d.as_node().unwrap()).collect();
        assert!(sources
            .iter()
            .any(|&s| comp.nodes[s].value == ConstValue::Int(0)));

        // Each source's use list points back at the phi (invariant 5).
        for &s in &sources {
            let uses = comp.refs.get(comp.nodes[s].uses);
            assert!(uses.contains(&NodeOrInstr::node(phi)));
        }

        // The phi appears in exactly one slot of exactly one block entry.
        let mut appearances = 0;
        for (b, _) in comp.blocks.iter() {
            for &n in comp.entry_locals(b).iter().chain(comp.entry_stack(b)) {
                if n == phi {
                    appearances += 1;
                }
            }
        }
        assert_eq!(appearances, 1);

        // Loop header entered with int on both paths: phi type is int.
        assert_eq!(comp.nodes[phi].ty, DataType::Int);
    }

    #[test]
    fn constants_fold_and_skip_pushes() {
        // 2 + 3 < 10 folds all the way to true.
        let mut asm = Assembler::new();
        asm.op_byte(Op::PushByte, 2);
        asm.op_byte(Op::PushByte, 3);
        asm.op(Op::Add);
        asm.op_byte(Op::PushByte, 10);
        asm.op(Op::LessThan);
        asm.op(Op::ReturnValue);
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        let comp = analyze(&env, &reg).unwrap();

        let add_out = comp.instrs[InstrId::new(2)].pushed_node.unwrap();
        assert_eq!(comp.nodes[add_out].value, ConstValue::Int(5));
        let cmp_out = comp.instrs[InstrId::new(4)].pushed_node.unwrap();
        assert_eq!(comp.nodes[cmp_out].value, ConstValue::Bool(true));

        // The operands of the folded comparison skip their pushes.
        assert!(comp.nodes[add_out].flags.is_no_push());
        let ten = comp.instrs[InstrId::new(3)].pushed_node.unwrap();
        assert!(comp.nodes[ten].flags.is_no_push());
    }

    #[test]
    fn int_overflow_folds_to_number() {
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        let big = env.add_int(i32::max_value());
        let mut asm = Assembler::new();
        asm.op_u30(Op::PushInt, big);
        asm.op_byte(Op::PushByte, 1);
        asm.op(Op::Add);
        asm.op(Op::ReturnValue);
        env.set_code(asm.finish());
        let comp = analyze(&env, &reg).unwrap();

        let out = comp.instrs[InstrId::new(2)].pushed_node.unwrap();
        assert_eq!(comp.nodes[out].ty, DataType::Number);
        assert_eq!(
            comp.nodes[out].value,
            ConstValue::Number(i32::max_value() as f64 + 1.0)
        );
    }

    #[test]
    fn stack_underflow_is_reported() {
        let mut asm = Assembler::new();
        asm.op(Op::Add);
        asm.op(Op::ReturnValue);
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        let err = analyze(&env, &reg).unwrap_err();
        assert_eq!(err.code, ErrorCode::StackUnderflow);
    }

    #[test]
    fn scope_stack_roundtrip() {
        let mut asm = Assembler::new();
        asm.op(Op::GetLocal0);
        asm.op(Op::PushScope);
        asm.op_byte(Op::GetScopeObject, 0);
        asm.op(Op::PopScope);
        asm.op(Op::ReturnValue);
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.set_max_scope_depth(1);
        let comp = analyze(&env, &reg).unwrap();

        let got = comp.instrs[InstrId::new(2)].pushed_node.unwrap();
        assert_eq!(comp.nodes[got].slot.kind, crate::ir::SlotKind::Scope);
    }

    #[test]
    fn catch_block_gets_exception_stack_and_local_phis() {
        // S5 groundwork: a try writing local 1, catch reading it.
        let mut asm = Assembler::new();
        asm.op_byte(Op::PushByte, 1); // 0
        asm.op_u30(Op::SetLocal, 1); // 2
        asm.op(Op::ReturnVoid); // 4
        asm.op(Op::ReturnVoid); // 5: catch target
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.set_local_count(2);
        env.add_exception(ExceptionRecord {
            from: 0,
            to: 5,
            target: 5,
            type_name: 0,
            var_name: 0,
        });
        let comp = analyze(&env, &reg).unwrap();

        let h = comp.handlers.keys().next().unwrap();
        let catch_block = comp.block_lists.get(comp.handlers[h].catch_block_chain)[0];

        // Stack: the caught exception (the single-source phi collapses onto
        // the exception node itself).
        let entry_stack = comp.entry_stack(catch_block);
        assert_eq!(entry_stack.len(), 1);
        assert!(comp.nodes[entry_stack[0]].flags.is_exception());

        // Local 1's phi sees both the entry undefined and the written 1.
        let local_phi = comp.entry_locals(catch_block)[1];
        assert!(comp.nodes[local_phi].flags.is_phi());
        let sources: Vec<NodeId> = comp
            .refs
            .get(comp.nodes[local_phi].defs)
            .iter()
            .map(|d| d.as_node().unwrap())
            .collect();
        assert!(sources.len() >= 2);
        assert!(sources
            .iter()
            .any(|&s| comp.nodes[s].value == ConstValue::Int(1)));
        // The written node is flagged as writing through to catch state.
        let written = sources
            .iter()
            .find(|&&s| comp.nodes[s].value == ConstValue::Int(1))
            .unwrap();
        assert!(comp.nodes[*written].flags.is_local_write_through());
    }

    #[test]
    fn exit_phi_sources_recorded_per_predecessor() {
        // Loop from S3 again: the entry block and the body both supply the
        // header's phi.
        let mut asm = Assembler::new();
        asm.op_byte(Op::PushByte, 0);
        asm.op_u30(Op::SetLocal, 1);
        let l0 = asm.here();
        asm.op_u30(Op::GetLocal, 1);
        asm.op_byte(Op::PushByte, 10);
        let end = asm.label();
        asm.branch(Op::IfLt, end);
        asm.op_u30(Op::GetLocal, 1);
        asm.op_byte(Op::PushByte, 1);
        asm.op(Op::Add);
        asm.op_u30(Op::SetLocal, 1);
        asm.branch(Op::Jump, l0);
        asm.place(end);
        asm.op_u30(Op::GetLocal, 1);
        asm.op(Op::ReturnValue);
        let reg = DummyRegistry::with_builtins();
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.set_local_count(2);
        let comp = analyze(&env, &reg).unwrap();

        let mut supplying_blocks = 0;
        for (b, _) in comp.blocks.iter() {
            if !comp.exit_phi_sources[b].is_empty() {
                supplying_blocks += 1;
            }
        }
        assert_eq!(supplying_blocks, 2);
    }

    #[test]
    fn rest_and_arguments_locals() {
        let reg = DummyRegistry::with_builtins();
        let mut sig = int_method(&reg, 1);
        sig.has_rest = true;
        let mut asm = Assembler::new();
        asm.op(Op::GetLocal2);
        asm.op(Op::ReturnValue);
        let mut env = DummyEnvironment::new();
        env.set_code(asm.finish());
        env.set_signature(sig);
        env.set_local_count(3);
        let comp = analyze(&env, &reg).unwrap();

        let pushed = comp.instrs[InstrId::new(0)].pushed_node.unwrap();
        assert_eq!(comp.nodes[pushed].ty, DataType::Rest);
    }
}
