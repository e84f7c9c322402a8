//! The IL code generator.
//!
//! Emits the typed back-end stream in reverse postorder. Values flow on the
//! real IL stack within and across forward edges; backward edges and catch
//! entries park the stack in per-block stash locals and re-enter through a
//! dedicated backward label. Local and scope slots are backed by one IL local
//! each, typed by the join of every value the slot ever holds.
//!
//! Exception dispatch is a state machine: a handler-id register tracks the
//! innermost active handler, the method-tail filter loops the thrown value
//! through the handler chain testing caught types, and the catch clause
//! stashes the exception into the selected handler's slot-0 stash and jumps
//! to its catch block.

use crate::compilation::{MethodCompilation, RuntimeFailure};
use crate::error::CompileResult;
use crate::il::{CmpOp, Helper, IlBuilder, IlOp, IlType, MemWidth};
use crate::ir::node::{ConstValue, DataType};
use crate::ir::{
    BlockId, ExitKind, HandlerId, IlLabel, IlVar, InstrData, InstrId, Intrinsic, NodeId,
    ResolutionKind, TraitRef,
};
use crate::mangle::NameMangler;
use crate::{semantics, timing};
use abclift_abc::{Op, TraitKind, TypeRef};
use abclift_entity::{EntityRef, SecondaryMap};
use log::debug;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Generate IL for the whole method through `il`.
pub fn run(comp: &mut MethodCompilation, il: &mut dyn IlBuilder) -> CompileResult<()> {
    let _tt = timing::codegen();
    mark_concat_trees(comp);
    let mut emitter = Emitter::prepare(comp, il);
    emitter.emit_method(comp)?;
    debug!("codegen done");
    Ok(())
}

/// Machine type of a node type.
fn il_type(ty: DataType) -> IlType {
    match ty {
        DataType::Bool => IlType::Bool,
        DataType::Int => IlType::I32,
        DataType::Uint => IlType::U32,
        DataType::Number => IlType::F64,
        DataType::String => IlType::Str,
        DataType::Null
        | DataType::Namespace
        | DataType::QName
        | DataType::Class(_)
        | DataType::Function
        | DataType::Object(_)
        | DataType::This(_)
        | DataType::Rest
        | DataType::Global => IlType::Ref,
        DataType::Unknown | DataType::Any | DataType::Undefined => IlType::Any,
    }
}

struct Emitter<'il> {
    il: &'il mut dyn IlBuilder,
    mangler: NameMangler,

    order: Vec<BlockId>,
    position: SecondaryMap<BlockId, u32>,
    fwd_label: HashMap<BlockId, IlLabel>,
    bwd_label: HashMap<BlockId, IlLabel>,
    stash: HashMap<BlockId, Vec<(IlVar, DataType)>>,

    local_vars: Vec<(IlVar, IlType)>,
    scope_vars: Vec<IlVar>,
    sync_vars: HashMap<(HandlerId, u32), (IlVar, DataType)>,

    handler_var: Option<IlVar>,
    selected_var: Option<IlVar>,
    cur_handler: Option<HandlerId>,

    uses_memory: bool,
    mem_base: Option<IlVar>,
    mem_size: Option<IlVar>,
    oob_label: Option<IlLabel>,

    needs_runtime_scope: bool,
    last_const: Option<IlOp>,
    fold_dup: bool,
}

impl<'il> Emitter<'il> {
    fn prepare(comp: &mut MethodCompilation, il: &'il mut dyn IlBuilder) -> Self {
        // Reverse postorder over the numbered blocks.
        let mut order: Vec<BlockId> = comp.blocks.keys().collect();
        order.sort_by(|&a, &b| comp.blocks[b].postorder.cmp(&comp.blocks[a].postorder));
        let mut position: SecondaryMap<BlockId, u32> = SecondaryMap::new();
        for (idx, &b) in order.iter().enumerate() {
            position[b] = idx as u32;
        }

        let mut fwd_label = HashMap::new();
        let mut bwd_label = HashMap::new();
        let catch_targets: Vec<BlockId> = comp
            .handlers
            .values()
            .map(|h| comp.block_lists.get(h.catch_block_chain)[0])
            .collect();
        for &b in &order {
            fwd_label.insert(b, il.create_label());
            let backward_entry = comp
                .preds
                .get(comp.blocks[b].entry_points)
                .iter()
                .filter_map(|p| p.as_block())
                .any(|p| position[p] >= position[b]);
            if backward_entry || catch_targets.contains(&b) {
                bwd_label.insert(b, il.create_label());
            }
        }

        // One typed IL local per local slot and per scope depth; the slot
        // type is the machine-type join of every value the slot holds.
        let local_count = (comp.env.local_count() as usize).max(1);
        let mut seen = vec![None::<IlType>; local_count];
        for node in comp.nodes.values() {
            if node.slot.kind == crate::ir::SlotKind::Local {
                let i = node.slot.index as usize;
                if i < seen.len() {
                    let t = il_type(node.ty);
                    seen[i] = Some(match seen[i] {
                        None => t,
                        Some(prev) if prev == t => t,
                        Some(_) => IlType::Any,
                    });
                }
            }
        }
        let local_vars: Vec<(IlVar, IlType)> = seen
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let ty = t.unwrap_or(IlType::Any);
                (il.declare_local(ty, Some(&format!("loc{}", i))), ty)
            })
            .collect();

        let max_scope = max_scope_depth(comp);
        let scope_vars: Vec<IlVar> = (0..max_scope)
            .map(|i| il.declare_local(IlType::Any, Some(&format!("scope{}", i))))
            .collect();

        // Stash locals for blocks re-entered backward with live stack.
        let mut stash: HashMap<BlockId, Vec<(IlVar, DataType)>> = HashMap::new();
        for &b in &order {
            if !bwd_label.contains_key(&b) {
                continue;
            }
            let entry = comp.entry_stack(b);
            if entry.is_empty() {
                continue;
            }
            let vars = entry
                .iter()
                .map(|&n| {
                    let ty = comp.nodes[n].ty;
                    (il.declare_local(il_type(ty), None), ty)
                })
                .collect();
            stash.insert(b, vars);
        }

        // Catch-sync locals, shared with the ancestor when types agree.
        let mut sync_vars: HashMap<(HandlerId, u32), (IlVar, DataType)> = HashMap::new();
        for h in comp.handlers.keys().collect::<Vec<HandlerId>>() {
            let cb = comp.block_lists.get(comp.handlers[h].catch_block_chain)[0];
            let locals = comp.entry_locals(cb).to_vec();
            for (slot, &phi) in locals.iter().enumerate() {
                if !comp.nodes[phi].flags.is_phi() {
                    continue;
                }
                if comp.refs.len(comp.nodes[phi].uses) == 0 {
                    continue;
                }
                let ty = comp.nodes[phi].ty;
                let parent = comp.handlers[h].parent.expand();
                let shared = parent.and_then(|p| sync_vars.get(&(p, slot as u32)).copied());
                let var = match shared {
                    Some((var, pty)) if il_type(pty) == il_type(ty) => (var, ty),
                    _ => (il.declare_local(il_type(ty), None), ty),
                };
                sync_vars.insert((h, slot as u32), var);
            }
        }

        let has_handlers = !comp.handlers.is_empty();
        let handler_var = if has_handlers {
            Some(il.declare_local(IlType::I32, Some("curHandler")))
        } else {
            None
        };
        let selected_var = if has_handlers {
            Some(il.declare_local(IlType::I32, Some("caughtBy")))
        } else {
            None
        };

        let uses_memory = comp
            .instrs
            .values()
            .any(|i| i.flags.is_reached() && (i.op.is_memory() || matches!(i.op, Op::Sxi1 | Op::Sxi8 | Op::Sxi16)));
        let (mem_base, mem_size) = if uses_memory {
            (
                Some(il.declare_local(IlType::I32, Some("memBase"))),
                Some(il.declare_local(IlType::I32, Some("memSize"))),
            )
        } else {
            (None, None)
        };

        let needs_runtime_scope = comp.instrs.iter().any(|(_, ins)| {
            if !ins.flags.is_reached() {
                return false;
            }
            match ins.op {
                Op::FindProperty | Op::FindPropStrict | Op::FindDef | Op::GetLex => ins
                    .resolved_prop
                    .expand()
                    .map_or(true, |p| comp.props[p].kind == ResolutionKind::Runtime),
                _ => false,
            }
        });

        let fold_dup = comp.settings.fold_dup;
        Emitter {
            il,
            mangler: NameMangler::new(),
            order,
            position,
            fwd_label,
            bwd_label,
            stash,
            local_vars,
            scope_vars,
            sync_vars,
            handler_var,
            selected_var,
            cur_handler: None,
            uses_memory,
            mem_base,
            mem_size,
            oob_label: None,
            needs_runtime_scope,
            last_const: None,
            fold_dup,
        }
    }

    /// Emit with the dup peephole: a constant push identical to the previous
    /// one, with nothing in between, becomes `dup`.
    fn out(&mut self, op: IlOp) {
        if op.is_const_push() {
            if self.fold_dup && self.last_const.as_ref() == Some(&op) {
                self.il.emit(IlOp::Dup);
                return;
            }
            self.last_const = Some(op.clone());
            self.il.emit(op);
        } else {
            self.last_const = None;
            self.il.emit(op);
        }
    }

    fn mark(&mut self, label: IlLabel) {
        self.last_const = None;
        self.il.mark_label(label);
    }

    fn emit_method(&mut self, comp: &mut MethodCompilation) -> CompileResult<()> {
        self.emit_prelude(comp);
        if !comp.handlers.is_empty() {
            self.il.begin_try();
        }

        for idx in 0..self.order.len() {
            let block = self.order[idx];
            self.emit_block(comp, block)?;
        }

        if self.uses_memory {
            let label = self.oob_trap_label();
            self.mark(label);
            self.out(IlOp::CallHelper(Helper::ThrowRangeError));
        }

        if !comp.handlers.is_empty() {
            self.emit_exception_tail(comp);
        }
        Ok(())
    }

    fn emit_prelude(&mut self, comp: &MethodCompilation) {
        let sig = comp.env.signature().clone();
        let param_count = sig.params.len();
        let entry = comp.instrs[InstrId::new(0)].block.unwrap();
        let entry_locals = comp.entry_locals(entry).to_vec();

        // `this` and the declared parameters.
        for i in 0..=param_count.min(self.local_vars.len().saturating_sub(1)) {
            let optional = entry_locals
                .get(i)
                .map_or(false, |&n| comp.nodes[n].flags.is_push_optional_param());
            if optional {
                self.out(IlOp::CallHelper(Helper::OptionalArg(i as u32)));
            } else {
                self.out(IlOp::LdArg(i as u32));
            }
            let (var, _) = self.local_vars[i];
            self.out(IlOp::StLoc(var));
        }

        let mut next = param_count + 1;
        if sig.has_rest && next < self.local_vars.len() {
            self.out(IlOp::CallHelper(Helper::CollectRest));
            self.out(IlOp::StLoc(self.local_vars[next].0));
            next += 1;
        } else if sig.needs_arguments && next < self.local_vars.len() {
            self.out(IlOp::CallHelper(Helper::CollectArguments));
            self.out(IlOp::StLoc(self.local_vars[next].0));
            next += 1;
        }
        for i in next..self.local_vars.len() {
            self.out(IlOp::LdUndefined);
            self.out(IlOp::StLoc(self.local_vars[i].0));
        }

        if let Some(var) = self.handler_var {
            self.out(IlOp::LdcI4(-1));
            self.out(IlOp::StLoc(var));
        }
        if self.uses_memory {
            self.out(IlOp::CallHelper(Helper::MemBase));
            self.out(IlOp::StLoc(self.mem_base.unwrap()));
            self.out(IlOp::CallHelper(Helper::MemSize));
            self.out(IlOp::StLoc(self.mem_size.unwrap()));
        }
    }

    fn oob_trap_label(&mut self) -> IlLabel {
        match self.oob_label {
            Some(l) => l,
            None => {
                let l = self.il.create_label();
                self.oob_label = Some(l);
                l
            }
        }
    }

    /// The label a jump from `from` to `target` lands on.
    fn jump_label(&self, from: BlockId, target: BlockId) -> IlLabel {
        if self.position[target] <= self.position[from] {
            self.bwd_label[&target]
        } else {
            self.fwd_label[&target]
        }
    }

    fn is_backward(&self, from: BlockId, target: BlockId) -> bool {
        self.position[target] <= self.position[from]
    }

    fn emit_block(&mut self, comp: &mut MethodCompilation, block: BlockId) -> CompileResult<()> {
        let fwd = self.fwd_label[&block];
        self.mark(fwd);

        // Backward entries re-enter with the stack parked in the stash.
        if let Some(&bwd) = self.bwd_label.get(&block) {
            if let Some(stash) = self.stash.get(&block).cloned() {
                for (var, _) in stash.iter().rev() {
                    self.out(IlOp::StLoc(*var));
                }
                self.mark(bwd);
                for (var, _) in stash.iter() {
                    self.out(IlOp::LdLoc(*var));
                }
            } else {
                self.mark(bwd);
            }
        }

        // Handler-id register tracks the innermost active handler.
        let handler = comp.blocks[block].handler.expand();
        if self.handler_var.is_some() && handler != self.cur_handler {
            let id = handler.map_or(-1, |h| h.index() as i32);
            let var = self.handler_var.unwrap();
            self.out(IlOp::LdcI4(id));
            self.out(IlOp::StLoc(var));
            self.cur_handler = handler;
        }

        // Entering a try region seeds the catch-sync locals.
        self.emit_try_entry_sync(comp, block);

        // Catch blocks re-establish local slots from the sync locals.
        self.emit_catch_entry_restore(comp, block);

        let first = comp.blocks[block].first_instr.index();
        let count = comp.blocks[block].instr_count as usize;
        let mut scope_depth = comp.entry_scope(block).len();
        for idx in first..first + count {
            self.emit_instr(comp, block, InstrId::new(idx), &mut scope_depth)?;
        }

        // Blocks without a terminator transfer to their fallthrough target.
        if comp.blocks[block].exit == ExitKind::Fall {
            let target = comp.exit_blocks(block)[0];
            self.emit_edge(comp, block, target);
        }
        Ok(())
    }

    /// For every handler whose try region starts at this block, copy the
    /// current local values into its sync locals.
    fn emit_try_entry_sync(&mut self, comp: &MethodCompilation, block: BlockId) {
        let first = comp.blocks[block].first_instr;
        let handlers: Vec<HandlerId> = comp
            .handlers
            .keys()
            .filter(|&h| comp.handlers[h].try_start == first)
            .collect();
        let mut done: Vec<IlVar> = Vec::new();
        for h in handlers {
            for slot in 0..self.local_vars.len() as u32 {
                if let Some(&(var, ty)) = self.sync_vars.get(&(h, slot)) {
                    if done.contains(&var) {
                        continue;
                    }
                    done.push(var);
                    let (slot_var, slot_ty) = self.local_vars[slot as usize];
                    self.out(IlOp::LdLoc(slot_var));
                    self.emit_conv(slot_ty, il_type(ty));
                    self.out(IlOp::StLoc(var));
                }
            }
        }
    }

    /// At a catch block entry, local slots take the values carried by the
    /// sync locals of the innermost handler targeting this block.
    fn emit_catch_entry_restore(&mut self, comp: &MethodCompilation, block: BlockId) {
        let handler = comp
            .handlers
            .keys()
            .find(|&h| comp.block_lists.get(comp.handlers[h].catch_block_chain)[0] == block);
        if let Some(h) = handler {
            for slot in 0..self.local_vars.len() as u32 {
                if let Some(&(var, ty)) = self.sync_vars.get(&(h, slot)) {
                    let (slot_var, slot_ty) = self.local_vars[slot as usize];
                    self.out(IlOp::LdLoc(var));
                    self.emit_conv(il_type(ty), slot_ty);
                    self.out(IlOp::StLoc(slot_var));
                }
            }
        }
    }

    /// A plain conversion between machine types, when they differ.
    fn emit_conv(&mut self, from: IlType, to: IlType) {
        if from != to {
            self.out(IlOp::Conv(from, to));
        }
    }

    /// The full coercion table over node types.
    fn emit_coerce(&mut self, comp: &MethodCompilation, from: DataType, to: DataType) {
        if from == to {
            return;
        }
        match to {
            DataType::String => {
                // The coerce table passes null/undefined through; only
                // convert_s sites spell them out.
                if from != DataType::Null {
                    self.out(IlOp::CoerceString);
                }
            }
            DataType::Object(c) => {
                // null is representable for every reference type.
                if from == DataType::Null {
                    return;
                }
                if let Some(fc) = from.instance_class() {
                    if comp.registry.is_subclass_of(fc, c) {
                        return;
                    }
                }
                self.emit_conv(il_type(from), IlType::Any);
                let descriptor = comp.registry.class(c);
                let sym = self
                    .mangler
                    .mangle_type(&descriptor.ns, &descriptor.name)
                    .into_boxed_str();
                if descriptor.is_interface {
                    self.out(IlOp::CastInterface(sym));
                } else {
                    self.out(IlOp::CastClass(sym));
                }
            }
            _ => self.emit_conv(il_type(from), il_type(to)),
        }
    }

    fn emit_const(&mut self, value: &ConstValue) {
        match value {
            ConstValue::None => self.out(IlOp::LdUndefined),
            ConstValue::Undefined => self.out(IlOp::LdUndefined),
            ConstValue::Null => self.out(IlOp::LdNull),
            ConstValue::Int(v) => self.out(IlOp::LdcI4(*v)),
            ConstValue::Uint(v) => self.out(IlOp::LdcU4(*v)),
            ConstValue::Number(v) => self.out(IlOp::LdcR8(*v)),
            ConstValue::Bool(v) => self.out(IlOp::LdBool(*v)),
            ConstValue::String(s) => self.out(IlOp::LdStr(s.to_string().into_boxed_str())),
            ConstValue::Namespace(ns) => {
                self.out(IlOp::LdNamespace(ns.uri.to_string().into_boxed_str()))
            }
        }
    }

    /// Conversions owed after a value lands on the stack.
    fn after_push(&mut self, comp: &MethodCompilation, node: NodeId) {
        let ty = comp.nodes[node].ty;
        if comp.nodes[node].flags.is_push_convert_string() && ty != DataType::String {
            self.emit_conv(il_type(ty), IlType::Any);
            self.out(IlOp::ConvertString);
        }
        if let Some(target) = comp.nodes[node].on_push_coerce {
            self.emit_coerce(comp, ty, target);
        }
    }

    /// Materialize the trailing no-push constants of an instruction's
    /// operand list.
    fn push_skipped_operands(&mut self, comp: &MethodCompilation, i: InstrId) {
        let pops: SmallVec<[NodeId; 8]> = comp
            .node_lists
            .get(comp.instrs[i].popped_nodes)
            .iter()
            .copied()
            .collect();
        for &p in &pops {
            if comp.nodes[p].flags.is_no_push() {
                let value = comp.nodes[p].value.clone();
                self.emit_const(&value);
                self.after_push(comp, p);
            }
        }
    }

    /// Discard the materialized operands of an instruction whose result is a
    /// known constant.
    fn pop_materialized_operands(&mut self, comp: &MethodCompilation, i: InstrId) {
        let pops: SmallVec<[NodeId; 8]> = comp
            .node_lists
            .get(comp.instrs[i].popped_nodes)
            .iter()
            .copied()
            .collect();
        for &p in pops.iter().rev() {
            if !comp.nodes[p].flags.is_no_push() {
                self.out(IlOp::Pop);
            }
        }
    }

    fn trait_symbol(&mut self, comp: &MethodCompilation, t: TraitRef) -> Box<str> {
        let class = comp.registry.class(t.class);
        let table = if t.is_static {
            &class.static_traits
        } else {
            &class.traits
        };
        let header = &table[t.index as usize].header;
        self.mangler
            .mangle_member(&header.ns, &header.name)
            .into_boxed_str()
    }

    fn class_symbol(&mut self, comp: &MethodCompilation, c: abclift_abc::ClassId) -> Box<str> {
        let class = comp.registry.class(c);
        self.mangler
            .mangle_type(&class.ns, &class.name)
            .into_boxed_str()
    }

    fn name_string(&mut self, comp: &MethodCompilation, i: InstrId) -> Box<str> {
        let mn = comp.env.multiname(comp.instrs[i].name_index());
        let text = mn.map(|m| m.to_string()).unwrap_or_default();
        text.into_boxed_str()
    }

    fn emit_instr(
        &mut self,
        comp: &mut MethodCompilation,
        block: BlockId,
        i: InstrId,
        scope_depth: &mut usize,
    ) -> CompileResult<()> {
        let op = comp.instrs[i].op;

        // Lowered precondition failures compile to a throw; the method keeps
        // compiling and the stack is rebuilt with a dummy of the right type.
        if let Some(failure) = comp.runtime_failures[i].clone() {
            self.pop_materialized_operands(comp, i);
            let helper = match failure {
                RuntimeFailure::ArgCountMismatch { .. } => Helper::ThrowArgCountError,
                RuntimeFailure::NotInstantiable => Helper::ThrowNotInstantiable,
                RuntimeFailure::IllegalDefaultXmlNamespace => Helper::ThrowIllegalDxns,
            };
            self.out(IlOp::CallHelper(helper));
            if let Some(out_node) = comp.instrs[i].pushed_node.expand() {
                self.out(IlOp::LdNull);
                self.emit_conv(IlType::Ref, il_type(comp.nodes[out_node].ty));
            }
            return Ok(());
        }

        // No-push results emit nothing; constant results materialize without
        // evaluating their (already folded) operands.
        if let Some(out_node) = comp.instrs[i].pushed_node.expand() {
            if comp.nodes[out_node].flags.is_no_push() {
                self.pop_materialized_operands(comp, i);
                return Ok(());
            }
            if comp.nodes[out_node].flags.is_constant() && constant_rematerializable(op) {
                self.pop_materialized_operands(comp, i);
                let value = comp.nodes[out_node].value.clone();
                self.emit_const(&value);
                self.after_push(comp, out_node);
                return Ok(());
            }
        }

        self.push_skipped_operands(comp, i);

        match op {
            // Constants that did not fold further.
            Op::PushNull | Op::PushUndefined | Op::PushTrue | Op::PushFalse | Op::PushByte
            | Op::PushShort | Op::PushString | Op::PushInt | Op::PushUint | Op::PushDouble
            | Op::PushNamespace => {
                let out_node = comp.instrs[i].pushed_node.unwrap();
                let value = comp.nodes[out_node].value.clone();
                self.emit_const(&value);
                self.after_push(comp, out_node);
            }

            Op::Nop | Op::Label | Op::Bkpt | Op::Timestamp | Op::Debug | Op::DebugLine
            | Op::DebugFile | Op::BkptLine => {}

            Op::Pop => self.out(IlOp::Pop),
            Op::Swap => self.out(IlOp::Swap),
            Op::Dup => {
                self.out(IlOp::Dup);
                let out_node = comp.instrs[i].pushed_node.unwrap();
                self.after_push(comp, out_node);
            }

            Op::GetLocal => {
                let idx = comp.instrs[i].local_index() as usize;
                let (var, var_ty) = self.local_vars[idx];
                self.out(IlOp::LdLoc(var));
                let out_node = comp.instrs[i].pushed_node.unwrap();
                self.emit_conv(var_ty, il_type(comp.nodes[out_node].ty));
                self.after_push(comp, out_node);
            }
            Op::SetLocal => {
                let idx = comp.instrs[i].local_index() as usize;
                let value = comp.node_lists.get(comp.instrs[i].popped_nodes)[0];
                let (var, var_ty) = self.local_vars[idx];
                self.emit_conv(il_type(comp.nodes[value].ty), var_ty);
                self.out(IlOp::StLoc(var));
                let is_const = comp.nodes[value].flags.is_constant();
                self.emit_catch_sync(comp, block, idx as u32, is_const);
            }
            Op::Kill => {
                let idx = comp.instrs[i].local_index() as usize;
                let (var, var_ty) = self.local_vars[idx];
                self.out(IlOp::LdUndefined);
                self.emit_conv(IlType::Any, var_ty);
                self.out(IlOp::StLoc(var));
            }
            Op::IncLocal | Op::DecLocal | Op::IncLocalI | Op::DecLocalI => {
                let idx = comp.instrs[i].local_index() as usize;
                let (var, var_ty) = self.local_vars[idx];
                let (ty, one, add) = if op == Op::IncLocal || op == Op::DecLocal {
                    (IlType::F64, IlOp::LdcR8(1.0), IlOp::Add(IlType::F64))
                } else {
                    (IlType::I32, IlOp::LdcI4(1), IlOp::Add(IlType::I32))
                };
                let sub = if op == Op::DecLocal {
                    IlOp::Sub(IlType::F64)
                } else {
                    IlOp::Sub(IlType::I32)
                };
                self.out(IlOp::LdLoc(var));
                self.emit_conv(var_ty, ty);
                self.out(one);
                if op == Op::IncLocal || op == Op::IncLocalI {
                    self.out(add);
                } else {
                    self.out(sub);
                }
                self.emit_conv(ty, var_ty);
                self.out(IlOp::StLoc(var));
                self.emit_catch_sync(comp, block, idx as u32, false);
            }
            Op::HasNext2 => {
                let (obj, index) = match comp.instrs[i].data {
                    InstrData::HasNext2 { object, index } => (object as usize, index as usize),
                    _ => unreachable!(),
                };
                self.out(IlOp::LdLocA(self.local_vars[obj].0));
                self.out(IlOp::LdLocA(self.local_vars[index].0));
                self.out(IlOp::CallHelper(Helper::HasNext2));
            }
            Op::HasNext => self.out(IlOp::CallHelper(Helper::HasNext)),
            Op::NextName => self.out(IlOp::CallHelper(Helper::NextName)),
            Op::NextValue => self.out(IlOp::CallHelper(Helper::NextValue)),

            Op::PushScope | Op::PushWith => {
                if self.needs_runtime_scope {
                    self.out(IlOp::Dup);
                    let helper = if op == Op::PushWith {
                        Helper::ScopePushWith
                    } else {
                        Helper::ScopePush
                    };
                    self.out(IlOp::CallHelper(helper));
                }
                let value = comp.node_lists.get(comp.instrs[i].popped_nodes)[0];
                self.emit_conv(il_type(comp.nodes[value].ty), IlType::Any);
                self.out(IlOp::StLoc(self.scope_vars[*scope_depth]));
                *scope_depth += 1;
            }
            Op::PopScope => {
                if self.needs_runtime_scope {
                    self.out(IlOp::CallHelper(Helper::ScopePop));
                }
                *scope_depth -= 1;
            }
            Op::GetScopeObject => {
                let k = match comp.instrs[i].data {
                    InstrData::ScopeIndex(k) => k as usize,
                    _ => unreachable!(),
                };
                self.out(IlOp::LdLoc(self.scope_vars[k]));
                let out_node = comp.instrs[i].pushed_node.unwrap();
                self.emit_conv(IlType::Any, il_type(comp.nodes[out_node].ty));
                self.after_push(comp, out_node);
            }
            Op::GetGlobalScope => self.out(IlOp::CallHelper(Helper::LoadGlobal)),

            // Arithmetic, comparison, conversion.
            Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::Modulo | Op::AddI
            | Op::SubtractI | Op::MultiplyI | Op::LShift | Op::RShift | Op::UrShift
            | Op::BitAnd | Op::BitOr | Op::BitXor | Op::Equals | Op::StrictEquals
            | Op::LessThan | Op::LessEquals | Op::GreaterThan | Op::GreaterEquals => {
                self.emit_binary(comp, i, op);
            }
            Op::Negate | Op::NegateI | Op::Increment | Op::Decrement | Op::IncrementI
            | Op::DecrementI | Op::BitNot | Op::Not | Op::TypeOf | Op::ConvertI | Op::ConvertU
            | Op::ConvertD | Op::ConvertB | Op::ConvertS | Op::CoerceS | Op::ConvertO
            | Op::CoerceO | Op::CoerceA | Op::EscXElem | Op::EscXAttr | Op::CheckFilter => {
                self.emit_unary(comp, i, op);
            }

            Op::Coerce | Op::AsType => self.emit_class_cast(comp, i),
            Op::IsType => self.emit_class_test(comp, i),
            Op::IsTypeLate => self.out(IlOp::CallHelper(Helper::IsTypeLate)),
            Op::AsTypeLate => self.out(IlOp::CallHelper(Helper::AsTypeLate)),
            Op::InstanceOf => self.out(IlOp::CallHelper(Helper::InstanceOfOp)),
            Op::In => self.out(IlOp::CallHelper(Helper::InOp)),

            // Property traffic.
            Op::GetProperty | Op::GetSuper => self.emit_get_property(comp, i),
            Op::SetProperty | Op::InitProperty | Op::SetSuper => self.emit_set_property(comp, i),
            Op::DeleteProperty => self.emit_delete_property(comp, i),
            Op::GetDescendants => {
                let name = self.name_string(comp, i);
                self.out(IlOp::LdStr(name));
                self.out(IlOp::CallHelper(Helper::GetDescendants));
            }
            Op::FindPropStrict | Op::FindProperty | Op::FindDef => self.emit_find(comp, i),
            Op::GetLex => self.emit_get_lex(comp, i),
            Op::GetSlot | Op::SetSlot | Op::GetGlobalSlot | Op::SetGlobalSlot => {
                self.emit_slot(comp, i)
            }

            Op::CallProperty | Op::CallPropLex | Op::CallPropVoid => {
                self.emit_call_property(comp, i)
            }
            Op::CallSuper | Op::CallSuperVoid => {
                let argc = comp.instrs[i].argc();
                let name = self.name_string(comp, i);
                self.out(IlOp::LdStr(name));
                self.out(IlOp::CallHelper(Helper::CallSuperLate(argc)));
                if op == Op::CallSuperVoid {
                    self.out(IlOp::Pop);
                } else {
                    let out_node = comp.instrs[i].pushed_node.unwrap();
                    self.coerce_from_any(comp, out_node);
                }
            }
            Op::Call => self.emit_call_value(comp, i),
            Op::CallMethod => {
                let (method, argc) = match comp.instrs[i].data {
                    InstrData::MethodArgc { method, argc } => (method, argc),
                    _ => unreachable!(),
                };
                self.out(IlOp::CallHelper(Helper::CallMethodId(method, argc)));
                let out_node = comp.instrs[i].pushed_node.unwrap();
                self.coerce_from_any(comp, out_node);
            }
            Op::CallStatic => {
                let (method, argc) = match comp.instrs[i].data {
                    InstrData::MethodArgc { method, argc } => (method, argc),
                    _ => unreachable!(),
                };
                self.out(IlOp::CallHelper(Helper::CallStatic(method, argc)));
                let out_node = comp.instrs[i].pushed_node.unwrap();
                self.coerce_from_any(comp, out_node);
            }
            Op::Construct | Op::ConstructProp => self.emit_construct(comp, i),
            Op::ConstructSuper => {
                let argc = comp.instrs[i].argc();
                self.out(IlOp::CallHelper(Helper::ConstructSuper(argc)));
            }

            Op::NewFunction => {
                let index = pool_of(comp, i);
                self.out(IlOp::CallHelper(Helper::NewFunction(index)));
            }
            Op::NewClass => {
                let index = pool_of(comp, i);
                self.out(IlOp::CallHelper(Helper::NewClassObj(index)));
            }
            Op::NewActivation => self.out(IlOp::CallHelper(Helper::NewActivation)),
            Op::NewCatch => {
                let index = pool_of(comp, i);
                self.out(IlOp::CallHelper(Helper::NewCatch(index)));
            }
            Op::NewArray => {
                let argc = comp.instrs[i].argc();
                self.out(IlOp::CallHelper(Helper::NewArray(argc)));
            }
            Op::NewObject => {
                let argc = comp.instrs[i].argc();
                self.out(IlOp::CallHelper(Helper::NewObject(argc)));
            }
            Op::ApplyType => {
                let argc = comp.instrs[i].argc();
                self.out(IlOp::CallHelper(Helper::ApplyType(argc)));
            }

            Op::Dxns => {
                let index = pool_of(comp, i);
                self.out(IlOp::CallHelper(Helper::SetDxns(index)));
            }
            Op::DxnsLate => self.out(IlOp::CallHelper(Helper::SetDxnsLate)),

            Op::Li8 => self.emit_mem_load(comp, i, MemWidth::I8),
            Op::Li16 => self.emit_mem_load(comp, i, MemWidth::I16),
            Op::Li32 => self.emit_mem_load(comp, i, MemWidth::I32),
            Op::Lf32 => self.emit_mem_load(comp, i, MemWidth::F32),
            Op::Lf64 => self.emit_mem_load(comp, i, MemWidth::F64),
            Op::Si8 => self.emit_mem_store(comp, i, MemWidth::I8),
            Op::Si16 => self.emit_mem_store(comp, i, MemWidth::I16),
            Op::Si32 => self.emit_mem_store(comp, i, MemWidth::I32),
            Op::Sf32 => self.emit_mem_store(comp, i, MemWidth::F32),
            Op::Sf64 => self.emit_mem_store(comp, i, MemWidth::F64),
            Op::Sxi1 => self.out(IlOp::SignExtend(1)),
            Op::Sxi8 => self.out(IlOp::SignExtend(8)),
            Op::Sxi16 => self.out(IlOp::SignExtend(16)),

            // Exits.
            Op::ReturnVoid => self.out(IlOp::RetVoid),
            Op::ReturnValue => {
                let value = comp.node_lists.get(comp.instrs[i].popped_nodes)[0];
                let ret = comp.env.signature().return_type;
                if ret != TypeRef::Void {
                    let from = comp.nodes[value].ty;
                    self.emit_coerce(comp, from, comp.data_type(ret));
                }
                self.out(IlOp::Ret);
            }
            Op::Throw => self.out(IlOp::ThrowVal),
            Op::Jump => {
                let target = comp.exit_blocks(block)[0];
                self.emit_edge(comp, block, target);
            }
            Op::LookupSwitch => self.emit_switch(comp, block, i),
            _ if op.is_conditional_branch() => self.emit_branch(comp, block, i, op),

            other => {
                debug_assert!(false, "unhandled opcode {}", other.mnemonic());
            }
        }
        Ok(())
    }

    /// Binary value op: unify operand machine types, emit the operation.
    fn emit_binary(&mut self, comp: &mut MethodCompilation, i: InstrId, op: Op) {
        let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
        let (a, b) = (pops[0], pops[1]);
        let out_node = comp.instrs[i].pushed_node.unwrap();
        let out_ty = comp.nodes[out_node].ty;

        // String concatenation trees fold into one n-ary concat at the root.
        if op == Op::Add && out_ty == DataType::String {
            if comp.nodes[out_node].flags.is_concat_internal() {
                return;
            }
            if comp.settings.fold_string_concat {
                let n = concat_leaves(comp, a) + concat_leaves(comp, b);
                if n > 2 {
                    if n <= 4 {
                        self.out(IlOp::CallHelper(Helper::ConcatStrings(n)));
                    } else {
                        self.out(IlOp::CallHelper(Helper::ConcatStringArray(n)));
                    }
                    self.after_push(comp, out_node);
                    return;
                }
            }
            self.out(IlOp::CallHelper(Helper::ConcatStrings(2)));
            self.after_push(comp, out_node);
            return;
        }

        let opnd_ty = match op {
            Op::Equals | Op::StrictEquals | Op::LessThan | Op::LessEquals | Op::GreaterThan
            | Op::GreaterEquals => compare_operand_type(comp.nodes[a].ty, comp.nodes[b].ty),
            _ => binary_operand_type(op, out_ty),
        };
        self.unify_top2(comp, a, b, opnd_ty);
        let il_op = match op {
            Op::Add | Op::AddI => IlOp::Add(opnd_ty),
            Op::Subtract | Op::SubtractI => IlOp::Sub(opnd_ty),
            Op::Multiply | Op::MultiplyI => IlOp::Mul(opnd_ty),
            Op::Divide => IlOp::Div,
            Op::Modulo => IlOp::Rem,
            Op::LShift => IlOp::Shl,
            Op::RShift => IlOp::Shr,
            Op::UrShift => IlOp::UShr,
            Op::BitAnd => IlOp::And,
            Op::BitOr => IlOp::Or,
            Op::BitXor => IlOp::Xor,
            Op::Equals => IlOp::Cmp(CmpOp::Eq, opnd_ty),
            Op::StrictEquals => IlOp::Cmp(CmpOp::StrictEq, opnd_ty),
            Op::LessThan => IlOp::Cmp(CmpOp::Lt, opnd_ty),
            Op::LessEquals => IlOp::Cmp(CmpOp::Le, opnd_ty),
            Op::GreaterThan => IlOp::Cmp(CmpOp::Gt, opnd_ty),
            Op::GreaterEquals => IlOp::Cmp(CmpOp::Ge, opnd_ty),
            _ => unreachable!(),
        };
        self.out(il_op);
        self.after_push(comp, out_node);
    }

    /// Convert the two topmost values to `target`, in place.
    fn unify_top2(&mut self, comp: &MethodCompilation, a: NodeId, b: NodeId, target: IlType) {
        let a_ty = il_type(comp.nodes[a].ty);
        let b_ty = il_type(comp.nodes[b].ty);
        if b_ty != target {
            self.emit_conv(b_ty, target);
        }
        if a_ty != target {
            let tmp = self.il.acquire_temp(target);
            self.out(IlOp::StLoc(tmp));
            self.emit_conv(a_ty, target);
            self.out(IlOp::LdLoc(tmp));
            self.il.release_temp(tmp);
        }
    }

    fn emit_unary(&mut self, comp: &mut MethodCompilation, i: InstrId, op: Op) {
        let input = comp.node_lists.get(comp.instrs[i].popped_nodes)[0];
        let in_ty = il_type(comp.nodes[input].ty);
        let out_node = comp.instrs[i].pushed_node.unwrap();
        match op {
            Op::Negate | Op::Increment | Op::Decrement => {
                self.emit_conv(in_ty, IlType::F64);
                match op {
                    Op::Negate => self.out(IlOp::Neg(IlType::F64)),
                    Op::Increment => {
                        self.out(IlOp::LdcR8(1.0));
                        self.out(IlOp::Add(IlType::F64));
                    }
                    _ => {
                        self.out(IlOp::LdcR8(1.0));
                        self.out(IlOp::Sub(IlType::F64));
                    }
                }
            }
            Op::NegateI | Op::IncrementI | Op::DecrementI => {
                self.emit_conv(in_ty, IlType::I32);
                match op {
                    Op::NegateI => self.out(IlOp::Neg(IlType::I32)),
                    Op::IncrementI => {
                        self.out(IlOp::LdcI4(1));
                        self.out(IlOp::Add(IlType::I32));
                    }
                    _ => {
                        self.out(IlOp::LdcI4(1));
                        self.out(IlOp::Sub(IlType::I32));
                    }
                }
            }
            Op::BitNot => {
                self.emit_conv(in_ty, IlType::I32);
                self.out(IlOp::BitNot);
            }
            Op::Not => {
                self.emit_conv(in_ty, IlType::Bool);
                self.out(IlOp::BoolNot);
            }
            Op::TypeOf => {
                self.emit_conv(in_ty, IlType::Any);
                self.out(IlOp::CallHelper(Helper::TypeOfValue));
            }
            Op::ConvertI => self.emit_conv(in_ty, IlType::I32),
            Op::ConvertU => self.emit_conv(in_ty, IlType::U32),
            Op::ConvertD => self.emit_conv(in_ty, IlType::F64),
            Op::ConvertB => self.emit_conv(in_ty, IlType::Bool),
            Op::ConvertS => {
                self.emit_conv(in_ty, IlType::Any);
                self.out(IlOp::ConvertString);
            }
            Op::CoerceS => {
                self.emit_conv(in_ty, IlType::Any);
                self.out(IlOp::CoerceString);
            }
            Op::EscXElem => self.out(IlOp::CallHelper(Helper::EscXmlElem)),
            Op::EscXAttr => self.out(IlOp::CallHelper(Helper::EscXmlAttr)),
            Op::CheckFilter => self.out(IlOp::CallHelper(Helper::CheckFilter)),
            Op::ConvertO | Op::CoerceO | Op::CoerceA => {
                self.emit_conv(in_ty, il_type(comp.nodes[out_node].ty));
            }
            _ => unreachable!(),
        }
        self.after_push(comp, out_node);
    }

    fn emit_class_cast(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let prop = comp.instrs[i].resolved_prop.expand().map(|p| comp.props[p].clone());
        let input = comp.node_lists.get(comp.instrs[i].popped_nodes)[0];
        let from = comp.nodes[input].ty;
        match prop {
            Some(p) if p.kind == ResolutionKind::Intrinsic(Intrinsic::ClassCast) => {
                let c = p.object_class.unwrap();
                let target = comp.data_type(TypeRef::Class(c));
                self.emit_coerce(comp, from, target);
            }
            _ => {
                self.emit_conv(il_type(from), IlType::Any);
                let name = self.name_string(comp, i);
                self.out(IlOp::LdStr(name));
                self.out(IlOp::CallHelper(Helper::AsTypeLate));
            }
        }
        let out_node = comp.instrs[i].pushed_node.unwrap();
        self.after_push(comp, out_node);
    }

    fn emit_class_test(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let prop = comp.instrs[i].resolved_prop.expand().map(|p| comp.props[p].clone());
        let input = comp.node_lists.get(comp.instrs[i].popped_nodes)[0];
        let from = il_type(comp.nodes[input].ty);
        self.emit_conv(from, IlType::Any);
        match prop {
            Some(p) if p.kind == ResolutionKind::Intrinsic(Intrinsic::ClassTest) => {
                let sym = self.class_symbol(comp, p.object_class.unwrap());
                self.out(IlOp::IsInst(sym));
            }
            _ => {
                let name = self.name_string(comp, i);
                self.out(IlOp::LdStr(name));
                self.out(IlOp::CallHelper(Helper::IsTypeLate));
            }
        }
    }

    fn coerce_from_any(&mut self, comp: &MethodCompilation, out_node: NodeId) {
        let ty = comp.nodes[out_node].ty;
        self.emit_conv(IlType::Any, il_type(ty));
        self.after_push(comp, out_node);
    }

    fn emit_get_property(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let out_node = comp.instrs[i].pushed_node.unwrap();
        let kind = resolved_kind(comp, i);
        match kind {
            ResolutionKind::Trait(t) => {
                let entry = trait_entry(comp, t);
                let sym = self.trait_symbol(comp, t);
                match entry {
                    TraitKind::Field { .. } if t.is_static => {
                        self.out(IlOp::Pop);
                        self.out(IlOp::LdStaticField(sym));
                    }
                    TraitKind::Field { .. } => self.out(IlOp::LdField(sym)),
                    TraitKind::Getter { .. } => self.out(IlOp::CallMethod(sym, 0)),
                    _ => {
                        let name = self.name_string(comp, i);
                        self.out(IlOp::LdStr(name));
                        self.out(IlOp::CallHelper(Helper::GetPropertyLate));
                        self.coerce_from_any(comp, out_node);
                        return;
                    }
                }
                self.after_push(comp, out_node);
            }
            ResolutionKind::Index(_) => {
                self.out(IlOp::CallHelper(Helper::GetIndex));
                self.coerce_from_any(comp, out_node);
            }
            _ => {
                let name = self.name_string(comp, i);
                self.out(IlOp::LdStr(name));
                self.out(IlOp::CallHelper(Helper::GetPropertyLate));
                self.coerce_from_any(comp, out_node);
            }
        }
    }

    fn emit_set_property(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let kind = resolved_kind(comp, i);
        let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
        let value = pops[pops.len() - 1];
        let value_ty = comp.nodes[value].ty;
        match kind {
            ResolutionKind::Trait(t) => {
                let entry = trait_entry(comp, t);
                let sym = self.trait_symbol(comp, t);
                match entry {
                    TraitKind::Field { ty, .. } => {
                        if comp.nodes[value].on_push_coerce.is_none() {
                            self.emit_coerce(comp, value_ty, comp.data_type(ty));
                        }
                        if t.is_static {
                            self.out(IlOp::StStaticField(sym));
                            self.out(IlOp::Pop);
                        } else {
                            self.out(IlOp::StField(sym));
                        }
                    }
                    TraitKind::Setter { ty } => {
                        if comp.nodes[value].on_push_coerce.is_none() {
                            self.emit_coerce(comp, value_ty, comp.data_type(ty));
                        }
                        self.out(IlOp::CallMethod(sym, 1));
                        self.out(IlOp::Pop);
                    }
                    _ => {
                        let name = self.name_string(comp, i);
                        self.out(IlOp::LdStr(name));
                        self.out(IlOp::CallHelper(Helper::SetPropertyLate));
                    }
                }
            }
            ResolutionKind::Index(p) => {
                self.emit_coerce(comp, value_ty, comp.data_type(p.value_type));
                self.emit_conv(il_type(comp.data_type(p.value_type)), IlType::Any);
                self.out(IlOp::CallHelper(Helper::SetIndex));
            }
            _ => {
                let name = self.name_string(comp, i);
                self.out(IlOp::LdStr(name));
                self.out(IlOp::CallHelper(Helper::SetPropertyLate));
            }
        }
    }

    fn emit_delete_property(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let kind = resolved_kind(comp, i);
        match kind {
            ResolutionKind::Index(_) => self.out(IlOp::CallHelper(Helper::DeleteIndex)),
            _ => {
                let name = self.name_string(comp, i);
                self.out(IlOp::LdStr(name));
                self.out(IlOp::CallHelper(Helper::DeletePropertyLate));
            }
        }
    }

    fn emit_find(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let out_node = comp.instrs[i].pushed_node.unwrap();
        let kind = resolved_kind(comp, i);
        match kind {
            ResolutionKind::Trait(_) => {
                let index = semantics::matched_scope_index(comp, i)
                    .expect("trait-resolved find lost its scope");
                self.out(IlOp::LdLoc(self.scope_vars[index]));
                self.coerce_from_any(comp, out_node);
            }
            ResolutionKind::Intrinsic(Intrinsic::ClassObject) => {
                // The class object stands in for its defining script object.
                self.out(IlOp::CallHelper(Helper::LoadGlobal));
                self.after_push(comp, out_node);
            }
            _ => {
                let strict = comp.instrs[i].op != Op::FindProperty;
                let name = self.name_string(comp, i);
                self.out(IlOp::LdStr(name));
                self.out(IlOp::CallHelper(Helper::FindProperty(strict)));
                self.after_push(comp, out_node);
            }
        }
    }

    fn emit_get_lex(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let out_node = comp.instrs[i].pushed_node.unwrap();
        let kind = resolved_kind(comp, i);
        match kind {
            ResolutionKind::Intrinsic(Intrinsic::ClassObject) => {
                let prop = comp.instrs[i].resolved_prop.unwrap();
                let c = comp.props[prop].object_class.unwrap();
                let sym = self.class_symbol(comp, c);
                self.out(IlOp::LdClass(sym));
                self.after_push(comp, out_node);
            }
            ResolutionKind::Trait(t) => {
                let index = semantics::matched_scope_index(comp, i)
                    .expect("trait-resolved getlex lost its scope");
                self.out(IlOp::LdLoc(self.scope_vars[index]));
                let entry = trait_entry(comp, t);
                let sym = self.trait_symbol(comp, t);
                match entry {
                    TraitKind::Field { .. } => {
                        self.out(IlOp::LdField(sym));
                        self.after_push(comp, out_node);
                    }
                    TraitKind::Getter { .. } => {
                        self.out(IlOp::CallMethod(sym, 0));
                        self.after_push(comp, out_node);
                    }
                    _ => {
                        let name = self.name_string(comp, i);
                        self.out(IlOp::LdStr(name));
                        self.out(IlOp::CallHelper(Helper::GetPropertyLate));
                        self.coerce_from_any(comp, out_node);
                    }
                }
            }
            _ => {
                let name = self.name_string(comp, i);
                self.out(IlOp::LdStr(name.clone()));
                self.out(IlOp::CallHelper(Helper::FindProperty(true)));
                self.out(IlOp::LdStr(name));
                self.out(IlOp::CallHelper(Helper::GetPropertyLate));
                self.coerce_from_any(comp, out_node);
            }
        }
    }

    fn emit_slot(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let op = comp.instrs[i].op;
        let slot = match comp.instrs[i].data {
            InstrData::Slot(slot) => slot,
            _ => unreachable!(),
        };
        let kind = resolved_kind(comp, i);
        match (op, kind) {
            (Op::GetSlot, ResolutionKind::Trait(t)) => {
                let sym = self.trait_symbol(comp, t);
                self.out(IlOp::LdField(sym));
                let out_node = comp.instrs[i].pushed_node.unwrap();
                self.after_push(comp, out_node);
            }
            (Op::SetSlot, ResolutionKind::Trait(t)) => {
                let entry = trait_entry(comp, t);
                if let TraitKind::Field { ty, .. } = entry {
                    let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
                    let value = pops[1];
                    let from = comp.nodes[value].ty;
                    self.emit_coerce(comp, from, comp.data_type(ty));
                }
                let sym = self.trait_symbol(comp, t);
                self.out(IlOp::StField(sym));
            }
            (Op::GetSlot, _) => {
                self.out(IlOp::CallHelper(Helper::GetSlot(slot)));
                let out_node = comp.instrs[i].pushed_node.unwrap();
                self.coerce_from_any(comp, out_node);
            }
            (Op::SetSlot, _) => self.out(IlOp::CallHelper(Helper::SetSlot(slot))),
            (Op::GetGlobalSlot, _) => {
                self.out(IlOp::CallHelper(Helper::GetGlobalSlot(slot)));
                let out_node = comp.instrs[i].pushed_node.unwrap();
                self.coerce_from_any(comp, out_node);
            }
            (Op::SetGlobalSlot, _) => self.out(IlOp::CallHelper(Helper::SetGlobalSlot(slot))),
            _ => unreachable!(),
        }
    }

    fn emit_call_property(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let op = comp.instrs[i].op;
        let argc = comp.instrs[i].argc();
        let kind = resolved_kind(comp, i);
        match kind {
            ResolutionKind::Trait(t) => {
                self.coerce_call_args(comp, i, t, argc);
                let sym = self.trait_symbol(comp, t);
                if t.is_static {
                    // The class object below the arguments is not an
                    // argument of a static call.
                    self.out(IlOp::CallStaticMethod(sym, argc));
                    self.drop_receiver_below(1);
                } else {
                    self.out(IlOp::CallMethod(sym, argc));
                }
            }
            ResolutionKind::Intrinsic(intr) => self.emit_call_intrinsic(comp, i, intr, argc),
            _ => {
                let name = self.name_string(comp, i);
                self.out(IlOp::LdStr(name));
                self.out(IlOp::CallHelper(Helper::CallPropertyLate(argc)));
            }
        }
        if op == Op::CallPropVoid {
            self.out(IlOp::Pop);
        } else {
            let out_node = comp.instrs[i].pushed_node.unwrap();
            match resolved_kind(comp, i) {
                ResolutionKind::Trait(_) | ResolutionKind::Intrinsic(_) => {
                    self.after_push(comp, out_node)
                }
                _ => self.coerce_from_any(comp, out_node),
            }
        }
    }

    /// Coerce stacked call arguments to the resolved signature. Only the
    /// trailing arguments are directly reachable; deeper mismatches go
    /// through temps.
    fn coerce_call_args(
        &mut self,
        comp: &mut MethodCompilation,
        i: InstrId,
        t: TraitRef,
        argc: u32,
    ) {
        let sig = match trait_entry(comp, t) {
            TraitKind::Method { sig, .. } => sig,
            _ => return,
        };
        let pops: Vec<NodeId> = comp.node_lists.get(comp.instrs[i].popped_nodes).to_vec();
        let args = &pops[pops.len() - argc as usize..];

        // Find the deepest argument needing a conversion.
        let mut needed: Vec<Option<(DataType, DataType)>> = Vec::new();
        for (k, &arg) in args.iter().enumerate() {
            let declared = sig
                .params
                .get(k)
                .map(|&p| comp.data_type(p))
                .unwrap_or(DataType::Any);
            let from = comp.nodes[arg].ty;
            if comp.nodes[arg].on_push_coerce.is_some()
                || il_type(from) == il_type(declared)
            {
                needed.push(None);
            } else {
                needed.push(Some((from, declared)));
            }
        }
        let deepest = match needed.iter().position(|n| n.is_some()) {
            Some(d) => d,
            None => return,
        };

        let mut temps: Vec<IlVar> = Vec::new();
        for k in ((deepest + 1)..args.len()).rev() {
            let tmp = self.il.acquire_temp(il_type(comp.nodes[args[k]].ty));
            if let Some((from, to)) = needed[k] {
                self.emit_coerce(comp, from, to);
            }
            self.out(IlOp::StLoc(tmp));
            temps.push(tmp);
        }
        if let Some((from, to)) = needed[deepest] {
            self.emit_coerce(comp, from, to);
        }
        for tmp in temps.iter().rev() {
            self.out(IlOp::LdLoc(*tmp));
        }
        for tmp in temps {
            self.il.release_temp(tmp);
        }
    }

    fn emit_call_intrinsic(
        &mut self,
        comp: &mut MethodCompilation,
        i: InstrId,
        intr: Intrinsic,
        argc: u32,
    ) {
        match intr {
            // The Math class object below the arguments is dead weight.
            Intrinsic::MathMin => {
                self.out(IlOp::CallHelper(Helper::MathMin));
                self.drop_receiver_below(1);
            }
            Intrinsic::MathMax => {
                self.out(IlOp::CallHelper(Helper::MathMax));
                self.drop_receiver_below(1);
            }
            Intrinsic::MathAbs => {
                self.out(IlOp::CallHelper(Helper::MathAbs));
                self.drop_receiver_below(1);
            }
            Intrinsic::StringCharAt => self.out(IlOp::CallHelper(Helper::StringCharAt)),
            Intrinsic::StringCharCodeAt => {
                self.out(IlOp::CallHelper(Helper::StringCharCodeAt))
            }
            Intrinsic::IntBox => self.emit_box(comp, i, IlType::I32, 1),
            Intrinsic::UintBox => self.emit_box(comp, i, IlType::U32, 1),
            Intrinsic::NumberBox => self.emit_box(comp, i, IlType::F64, 1),
            Intrinsic::BooleanBox => self.emit_box(comp, i, IlType::Bool, 1),
            Intrinsic::StringBox => {
                self.emit_string_box(comp, i);
                self.drop_receiver_below(1);
            }
            Intrinsic::ArrayWithLength => {
                self.out(IlOp::CallHelper(Helper::NewArrayWithLength));
                self.drop_receiver_below(1);
            }
            Intrinsic::ArrayOfItems => {
                self.out(IlOp::CallHelper(Helper::NewArray(argc)));
                self.drop_receiver_below(1);
            }
            Intrinsic::VectorCtor => self.out(IlOp::CallHelper(Helper::VectorCtor(argc))),
            Intrinsic::ClassCast | Intrinsic::ClassTest | Intrinsic::ClassObject => {
                // Not call-position intrinsics.
                self.out(IlOp::CallHelper(Helper::CallPropertyLate(argc)));
            }
        }
    }

    /// Boxing call `int(x)` etc.: convert the argument, drop the callee (and
    /// receiver, for `call`-shaped sites with two values below the argument).
    fn emit_box(&mut self, comp: &MethodCompilation, i: InstrId, target: IlType, below: usize) {
        let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
        let arg = pops[pops.len() - 1];
        let from = il_type(comp.nodes[arg].ty);
        self.emit_conv(from, target);
        self.drop_receiver_below(below);
    }

    /// Remove `depth` values sitting directly below the top of stack.
    fn drop_receiver_below(&mut self, depth: usize) {
        for _ in 0..depth {
            self.out(IlOp::Swap);
            self.out(IlOp::Pop);
        }
    }

    /// `String(x)` goes through the ECMA ToString, which needs a boxed
    /// operand.
    fn emit_string_box(&mut self, comp: &MethodCompilation, i: InstrId) {
        let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
        let arg = pops[pops.len() - 1];
        self.emit_conv(il_type(comp.nodes[arg].ty), IlType::Any);
        self.out(IlOp::ConvertString);
    }

    fn emit_call_value(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let argc = comp.instrs[i].argc();
        let kind = resolved_kind(comp, i);
        match kind {
            // `call` sites carry both the callee and a receiver below the
            // argument.
            ResolutionKind::Intrinsic(Intrinsic::IntBox) => {
                self.emit_box(comp, i, IlType::I32, 2)
            }
            ResolutionKind::Intrinsic(Intrinsic::UintBox) => {
                self.emit_box(comp, i, IlType::U32, 2)
            }
            ResolutionKind::Intrinsic(Intrinsic::NumberBox) => {
                self.emit_box(comp, i, IlType::F64, 2)
            }
            ResolutionKind::Intrinsic(Intrinsic::BooleanBox) => {
                self.emit_box(comp, i, IlType::Bool, 2)
            }
            ResolutionKind::Intrinsic(Intrinsic::StringBox) => {
                self.emit_string_box(comp, i);
                self.drop_receiver_below(2);
            }
            _ => {
                self.out(IlOp::CallHelper(Helper::CallPropertyLate(argc)));
                let out_node = comp.instrs[i].pushed_node.unwrap();
                self.coerce_from_any(comp, out_node);
            }
        }
    }

    fn emit_construct(&mut self, comp: &mut MethodCompilation, i: InstrId) {
        let argc = comp.instrs[i].argc();
        let out_node = comp.instrs[i].pushed_node.unwrap();
        let kind = resolved_kind(comp, i);
        match kind {
            ResolutionKind::Trait(t) => {
                let entry = trait_entry(comp, t);
                if let TraitKind::InnerClass { class } = entry {
                    let sym = self.class_symbol(comp, class);
                    self.out(IlOp::NewObj(sym, argc));
                    // The holder object below the arguments is left over.
                    self.drop_receiver_below(1);
                    self.after_push(comp, out_node);
                    return;
                }
                self.out(IlOp::CallHelper(Helper::ConstructLate(argc)));
                self.coerce_from_any(comp, out_node);
            }
            ResolutionKind::Intrinsic(Intrinsic::ArrayWithLength) => {
                self.out(IlOp::CallHelper(Helper::NewArrayWithLength));
                self.drop_receiver_below(1);
                self.after_push(comp, out_node);
            }
            ResolutionKind::Intrinsic(Intrinsic::ArrayOfItems) => {
                // Collapse the args, then drop the constructor reference.
                self.out(IlOp::CallHelper(Helper::NewArray(argc)));
                self.drop_receiver_below(1);
                self.after_push(comp, out_node);
            }
            ResolutionKind::Intrinsic(Intrinsic::VectorCtor) => {
                self.out(IlOp::CallHelper(Helper::VectorCtor(argc)));
                self.after_push(comp, out_node);
            }
            _ => {
                // Known instance class without special handling: direct
                // construction when the class is known, late otherwise.
                let class = comp.instrs[i]
                    .resolved_prop
                    .expand()
                    .and_then(|p| comp.props[p].object_class);
                match (comp.nodes[out_node].ty, class) {
                    (DataType::Object(c), _) | (_, Some(c))
                        if comp.registry.class(c).instantiable =>
                    {
                        let sym = self.class_symbol(comp, c);
                        self.out(IlOp::NewObj(sym, argc));
                        // The constructor reference below the arguments was
                        // consumed conceptually; the back-end NewObj takes
                        // argc stacked arguments plus the class symbol, so
                        // drop the extra reference.
                        self.drop_receiver_below(1);
                        self.after_push(comp, out_node);
                    }
                    _ => {
                        self.out(IlOp::CallHelper(Helper::ConstructLate(argc)));
                        self.coerce_from_any(comp, out_node);
                    }
                }
            }
        }
    }

    fn emit_mem_load(&mut self, comp: &mut MethodCompilation, i: InstrId, width: MemWidth) {
        self.emit_bounds_check(comp, i, width);
        self.out(IlOp::LdLoc(self.mem_base.unwrap()));
        self.out(IlOp::Add(IlType::I32));
        self.out(IlOp::LoadMem(width));
        let out_node = comp.instrs[i].pushed_node.unwrap();
        self.after_push(comp, out_node);
    }

    fn emit_mem_store(&mut self, comp: &mut MethodCompilation, i: InstrId, width: MemWidth) {
        // Stack: value, address(top).
        self.emit_bounds_check(comp, i, width);
        self.out(IlOp::LdLoc(self.mem_base.unwrap()));
        self.out(IlOp::Add(IlType::I32));
        self.out(IlOp::StoreMem(width));
    }

    /// One bounds check per operation: `addr + width > size` traps.
    fn emit_bounds_check(&mut self, comp: &mut MethodCompilation, i: InstrId, width: MemWidth) {
        let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
        let addr = pops[pops.len() - 1];
        self.emit_conv(il_type(comp.nodes[addr].ty), IlType::I32);
        let trap = self.oob_trap_label();
        self.out(IlOp::Dup);
        self.out(IlOp::LdcI4(width.bytes()));
        self.out(IlOp::Add(IlType::I32));
        self.out(IlOp::LdLoc(self.mem_size.unwrap()));
        self.out(IlOp::BrCmp(CmpOp::Gt, IlType::I32, trap));
    }

    /// A local write inside a try region updates the catch-sync locals of
    /// every handler in the chain. Constant writes are skipped: the catch
    /// side rematerializes them from the phi source.
    fn emit_catch_sync(
        &mut self,
        comp: &MethodCompilation,
        block: BlockId,
        slot: u32,
        is_const: bool,
    ) {
        if is_const {
            return;
        }
        let mut handler = comp.blocks[block].handler.expand();
        let mut done: Vec<IlVar> = Vec::new();
        while let Some(h) = handler {
            if let Some(&(var, ty)) = self.sync_vars.get(&(h, slot)) {
                if !done.contains(&var) {
                    done.push(var);
                    let (slot_var, slot_ty) = self.local_vars[slot as usize];
                    self.out(IlOp::LdLoc(slot_var));
                    self.emit_conv(slot_ty, il_type(ty));
                    self.out(IlOp::StLoc(var));
                }
            }
            handler = comp.handlers[h].parent.expand();
        }
    }

    // ---- Block transitions -------------------------------------------------

    /// Emit the transition to a single unconditional successor.
    fn emit_edge(&mut self, comp: &mut MethodCompilation, from: BlockId, target: BlockId) {
        self.emit_stack_coercions(comp, from, &[target]);
        if self.is_backward(from, target) && !comp.entry_stack(target).is_empty() {
            self.stash_into(comp, target);
            let label = self.bwd_label[&target];
            self.out(IlOp::Br(label));
        } else {
            let label = self.jump_label(from, target);
            self.out(IlOp::Br(label));
        }
    }

    /// Coerce on-stack phi sources at the exit of `from` toward the phi
    /// types of the given successors.
    fn emit_stack_coercions(&mut self, comp: &mut MethodCompilation, from: BlockId, targets: &[BlockId]) {
        let pairs = comp.exit_phi_sources[from].clone();
        if pairs.is_empty() {
            return;
        }
        // Depth -> required target type, taken from any successor's phi at
        // that stack slot.
        let mut depth_map: Vec<(u32, DataType, DataType)> = Vec::new();
        for &(source, phi) in &pairs {
            if comp.nodes[phi].slot.kind != crate::ir::SlotKind::Stack {
                continue;
            }
            let phi_in_targets = targets.iter().any(|&t| {
                comp.entry_stack(t).contains(&phi)
            });
            if !phi_in_targets {
                continue;
            }
            let from_ty = comp.nodes[source].ty;
            let to_ty = comp.nodes[phi].ty;
            if il_type(from_ty) != il_type(to_ty) {
                depth_map.push((comp.nodes[phi].slot.index, from_ty, to_ty));
            }
        }
        if depth_map.is_empty() {
            return;
        }
        depth_map.sort_by_key(|&(d, _, _)| d);
        let depth_count = targets
            .iter()
            .map(|&t| comp.entry_stack(t).len())
            .max()
            .unwrap_or(0);
        let deepest = depth_map[0].0 as usize;

        // Pop everything above the deepest slot into temps, fix the slots on
        // the way, reload.
        let mut temps: Vec<IlVar> = Vec::new();
        for d in ((deepest + 1)..depth_count).rev() {
            if let Some(&(_, from_ty, to_ty)) = depth_map.iter().find(|&&(dd, _, _)| dd as usize == d)
            {
                self.emit_coerce(comp, from_ty, to_ty);
            }
            let tmp = self.il.acquire_temp(IlType::Any);
            self.out(IlOp::StLoc(tmp));
            temps.push(tmp);
        }
        let (_, from_ty, to_ty) = depth_map[0];
        self.emit_coerce(comp, from_ty, to_ty);
        for tmp in temps.iter().rev() {
            self.out(IlOp::LdLoc(*tmp));
        }
        while let Some(tmp) = temps.pop() {
            self.il.release_temp(tmp);
        }
    }

    /// Pop the live stack into `target`'s stash locals, top-down.
    fn stash_into(&mut self, comp: &MethodCompilation, target: BlockId) {
        let stash = self.stash[&target].clone();
        for (var, _) in stash.iter().rev() {
            self.out(IlOp::StLoc(*var));
        }
    }

    fn emit_branch(
        &mut self,
        comp: &mut MethodCompilation,
        block: BlockId,
        i: InstrId,
        op: Op,
    ) {
        let exits: Vec<BlockId> = comp.exit_blocks(block).to_vec();
        let (taken, fall) = (exits[0], exits[1]);
        let pops: Vec<NodeId> = comp.node_lists.get(comp.instrs[i].popped_nodes).to_vec();

        // Evaluate the condition into a bool on the stack.
        let negate = match op {
            Op::IfTrue => {
                let from = il_type(comp.nodes[pops[0]].ty);
                self.emit_conv(from, IlType::Bool);
                false
            }
            Op::IfFalse => {
                let from = il_type(comp.nodes[pops[0]].ty);
                self.emit_conv(from, IlType::Bool);
                true
            }
            _ => {
                let (a, b) = (pops[0], pops[1]);
                let cmp_ty = compare_operand_type(comp.nodes[a].ty, comp.nodes[b].ty);
                self.unify_top2(comp, a, b, cmp_ty);
                self.out(IlOp::Cmp(branch_cmp(op), cmp_ty));
                false
            }
        };

        let taken_bwd_stack =
            self.is_backward(block, taken) && !comp.entry_stack(taken).is_empty();
        let fall_bwd_stack =
            self.is_backward(block, fall) && !comp.entry_stack(fall).is_empty();

        if !taken_bwd_stack && !fall_bwd_stack {
            self.emit_stack_coercions_below_cond(comp, block, &[taken, fall]);
            let taken_label = self.jump_label(block, taken);
            if negate {
                self.out(IlOp::BrFalse(taken_label));
            } else {
                self.out(IlOp::BrTrue(taken_label));
            }
            let fall_label = self.jump_label(block, fall);
            self.out(IlOp::Br(fall_label));
            return;
        }

        // A backward target with live stack: park the condition, stash, and
        // restore for the other arm.
        let cond = self.il.acquire_temp(IlType::Bool);
        self.out(IlOp::StLoc(cond));
        self.emit_stack_coercions(comp, block, &[taken, fall]);
        if taken_bwd_stack {
            self.stash_into(comp, taken);
            self.out(IlOp::LdLoc(cond));
            let label = self.bwd_label[&taken];
            if negate {
                self.out(IlOp::BrFalse(label));
            } else {
                self.out(IlOp::BrTrue(label));
            }
            // Rebuild the stack for the fallthrough arm.
            for (var, _) in self.stash[&taken].clone() {
                self.out(IlOp::LdLoc(var));
            }
        } else {
            self.out(IlOp::LdLoc(cond));
            let label = self.jump_label(block, taken);
            if negate {
                self.out(IlOp::BrFalse(label));
            } else {
                self.out(IlOp::BrTrue(label));
            }
        }
        self.il.release_temp(cond);

        if fall_bwd_stack {
            self.stash_into(comp, fall);
            let label = self.bwd_label[&fall];
            self.out(IlOp::Br(label));
        } else {
            let label = self.jump_label(block, fall);
            self.out(IlOp::Br(label));
        }
    }

    /// Stack coercions when the condition result is still on top: park it,
    /// coerce, restore.
    fn emit_stack_coercions_below_cond(
        &mut self,
        comp: &mut MethodCompilation,
        block: BlockId,
        targets: &[BlockId],
    ) {
        let needs = comp.exit_phi_sources[block].iter().any(|&(source, phi)| {
            comp.nodes[phi].slot.kind == crate::ir::SlotKind::Stack
                && il_type(comp.nodes[source].ty) != il_type(comp.nodes[phi].ty)
        });
        if !needs {
            return;
        }
        let cond = self.il.acquire_temp(IlType::Bool);
        self.out(IlOp::StLoc(cond));
        self.emit_stack_coercions(comp, block, targets);
        self.out(IlOp::LdLoc(cond));
        self.il.release_temp(cond);
    }

    fn emit_switch(&mut self, comp: &mut MethodCompilation, block: BlockId, i: InstrId) {
        let exits: Vec<BlockId> = comp.exit_blocks(block).to_vec();
        let default = exits[0];
        let cases = &exits[1..];
        let pops = comp.node_lists.get(comp.instrs[i].popped_nodes);
        let index = pops[0];

        self.emit_conv(il_type(comp.nodes[index].ty), IlType::I32);
        let idx_tmp = self.il.acquire_temp(IlType::I32);
        self.out(IlOp::StLoc(idx_tmp));

        self.emit_stack_coercions(comp, block, &exits);

        // Backward targets with live stack receive it through their stash;
        // the switch then dispatches through per-case adapters that clear
        // the duplicated stack.
        let depth = comp.entry_stack(default).len();
        let needs_stash: Vec<BlockId> = exits
            .iter()
            .copied()
            .filter(|&t| self.is_backward(block, t) && !comp.entry_stack(t).is_empty())
            .collect();
        if !needs_stash.is_empty() {
            let mut scratch: Vec<IlVar> = Vec::new();
            for _ in 0..depth {
                let tmp = self.il.acquire_temp(IlType::Any);
                self.out(IlOp::StLoc(tmp));
                scratch.push(tmp);
            }
            for &t in &needs_stash {
                let stash = self.stash[&t].clone();
                for (k, (var, _)) in stash.iter().enumerate() {
                    // scratch is top-down; stash slot k is depth k.
                    let src = scratch[depth - 1 - k];
                    self.out(IlOp::LdLoc(src));
                    self.out(IlOp::StLoc(*var));
                }
            }
            for tmp in scratch.iter().rev() {
                self.out(IlOp::LdLoc(*tmp));
            }
            while let Some(tmp) = scratch.pop() {
                self.il.release_temp(tmp);
            }
        }

        let mut case_labels = Vec::with_capacity(cases.len());
        let mut adapters: Vec<(IlLabel, BlockId)> = Vec::new();
        for &case in cases {
            if self.is_backward(block, case) && !comp.entry_stack(case).is_empty() {
                let adapter = self.il.create_label();
                adapters.push((adapter, case));
                case_labels.push(adapter);
            } else {
                case_labels.push(self.jump_label(block, case));
            }
        }

        self.out(IlOp::LdLoc(idx_tmp));
        self.il.release_temp(idx_tmp);
        self.out(IlOp::Switch(case_labels));

        if self.is_backward(block, default) && !comp.entry_stack(default).is_empty() {
            for _ in 0..depth {
                self.out(IlOp::Pop);
            }
            let label = self.bwd_label[&default];
            self.out(IlOp::Br(label));
        } else {
            let label = self.jump_label(block, default);
            self.out(IlOp::Br(label));
        }

        for (adapter, target) in adapters {
            self.mark(adapter);
            for _ in 0..comp.entry_stack(target).len() {
                self.out(IlOp::Pop);
            }
            let label = self.bwd_label[&target];
            self.out(IlOp::Br(label));
        }
    }

    // ---- Exception tail ----------------------------------------------------

    /// The filter walks the handler chain testing caught types; the catch
    /// clause stashes the exception for the selected handler and jumps to
    /// its catch block.
    fn emit_exception_tail(&mut self, comp: &mut MethodCompilation) {
        let handler_var = self.handler_var.unwrap();
        let selected_var = self.selected_var.unwrap();
        let exc_tmp = self.il.declare_local(IlType::Any, Some("thrown"));

        self.il.begin_filter();
        self.out(IlOp::StLoc(exc_tmp));
        let loop_label = self.il.create_label();
        self.mark(loop_label);

        let handler_ids: Vec<HandlerId> = comp.handlers.keys().collect();
        let test_labels: Vec<IlLabel> = handler_ids.iter().map(|_| self.il.create_label()).collect();
        let match_label = self.il.create_label();
        let no_match_label = self.il.create_label();

        self.out(IlOp::LdLoc(handler_var));
        self.out(IlOp::Switch(test_labels.clone()));
        self.out(IlOp::Br(no_match_label));

        for (k, &h) in handler_ids.iter().enumerate() {
            self.mark(test_labels[k]);
            let caught = comp.handlers[h].caught_type;
            match caught {
                TypeRef::Class(c) => {
                    let sym = self.class_symbol(comp, c);
                    self.out(IlOp::LdLoc(exc_tmp));
                    self.out(IlOp::IsInst(sym));
                    let next = self.il.create_label();
                    self.out(IlOp::BrFalse(next));
                    self.out(IlOp::LdcI4(h.index() as i32));
                    self.out(IlOp::StLoc(selected_var));
                    self.out(IlOp::Br(match_label));
                    self.mark(next);
                    // Ascend the parent chain and retest.
                    let parent = comp.handlers[h]
                        .parent
                        .expand()
                        .map_or(-1, |p| p.index() as i32);
                    self.out(IlOp::LdcI4(parent));
                    self.out(IlOp::StLoc(handler_var));
                    self.out(IlOp::Br(loop_label));
                }
                _ => {
                    // Catch-all.
                    self.out(IlOp::LdcI4(h.index() as i32));
                    self.out(IlOp::StLoc(selected_var));
                    self.out(IlOp::Br(match_label));
                }
            }
        }

        self.mark(no_match_label);
        self.out(IlOp::LdcI4(0));
        self.out(IlOp::EndFilter);
        self.mark(match_label);
        self.out(IlOp::LdcI4(1));
        self.out(IlOp::EndFilter);

        self.il.begin_filtered_catch();
        // The handler convention pushes the exception again; the filter
        // already stashed it.
        self.out(IlOp::Pop);

        let case_labels: Vec<IlLabel> = handler_ids.iter().map(|_| self.il.create_label()).collect();
        self.out(IlOp::LdLoc(selected_var));
        self.out(IlOp::Switch(case_labels.clone()));
        // Selected is always valid; the fall-through rethrows defensively.
        self.out(IlOp::LdLoc(exc_tmp));
        self.out(IlOp::ThrowVal);

        for (k, &h) in handler_ids.iter().enumerate() {
            self.mark(case_labels[k]);
            let catch_block = comp.block_lists.get(comp.handlers[h].catch_block_chain)[0];
            let (stash_var, stash_ty) = self.stash[&catch_block][0];
            self.out(IlOp::LdLoc(exc_tmp));
            self.emit_coerce(comp, DataType::Any, stash_ty);
            self.out(IlOp::StLoc(stash_var));
            let label = self.bwd_label[&catch_block];
            self.out(IlOp::Br(label));
        }
        self.il.end_try();
    }
}

// ---- Free helpers ----------------------------------------------------------

fn resolved_kind(comp: &MethodCompilation, i: InstrId) -> ResolutionKind {
    comp.instrs[i]
        .resolved_prop
        .expand()
        .map(|p| comp.props[p].kind)
        .unwrap_or(ResolutionKind::Runtime)
}

fn trait_entry(comp: &MethodCompilation, t: TraitRef) -> TraitKind {
    let class = comp.registry.class(t.class);
    let table = if t.is_static {
        &class.static_traits
    } else {
        &class.traits
    };
    table[t.index as usize].kind.clone()
}

fn pool_of(comp: &MethodCompilation, i: InstrId) -> u32 {
    match comp.instrs[i].data {
        InstrData::Pool(v) => v,
        _ => unreachable!("pool payload"),
    }
}

/// Ops whose constant result the generator may rematerialize instead of
/// evaluating.
fn constant_rematerializable(op: Op) -> bool {
    match op {
        Op::PushNull | Op::PushUndefined | Op::PushTrue | Op::PushFalse | Op::PushByte
        | Op::PushShort | Op::PushString | Op::PushInt | Op::PushUint | Op::PushDouble
        | Op::PushNamespace | Op::GetLocal | Op::Dup => true,
        Op::Add | Op::AddI | Op::Subtract | Op::SubtractI | Op::Multiply | Op::MultiplyI
        | Op::Divide | Op::Modulo | Op::Negate | Op::NegateI | Op::Not | Op::BitNot
        | Op::BitAnd | Op::BitOr | Op::BitXor | Op::LShift | Op::RShift | Op::UrShift
        | Op::Equals | Op::StrictEquals | Op::LessThan | Op::LessEquals | Op::GreaterThan
        | Op::GreaterEquals | Op::ConvertI | Op::ConvertU | Op::ConvertD | Op::ConvertB => true,
        _ => false,
    }
}

/// Machine type binary operands are unified to, given the result type.
fn binary_operand_type(op: Op, out_ty: DataType) -> IlType {
    match op {
        Op::LShift | Op::RShift | Op::BitAnd | Op::BitOr | Op::BitXor => IlType::I32,
        Op::UrShift => IlType::U32,
        Op::AddI | Op::SubtractI | Op::MultiplyI => IlType::I32,
        Op::Divide | Op::Modulo => IlType::F64,
        Op::Add | Op::Subtract | Op::Multiply => match out_ty {
            DataType::Int => IlType::I32,
            DataType::Uint => IlType::U32,
            DataType::Number => IlType::F64,
            _ => IlType::Any,
        },
        _ => IlType::Any,
    }
}

fn compare_operand_type(a: DataType, b: DataType) -> IlType {
    if a == DataType::Int && b == DataType::Int {
        IlType::I32
    } else if a.is_numeric() && b.is_numeric() {
        IlType::F64
    } else if a == DataType::String && b == DataType::String {
        IlType::Str
    } else {
        IlType::Any
    }
}

fn branch_cmp(op: Op) -> CmpOp {
    match op {
        Op::IfEq => CmpOp::Eq,
        Op::IfNe => CmpOp::Ne,
        Op::IfLt => CmpOp::Lt,
        Op::IfLe => CmpOp::Le,
        Op::IfGt => CmpOp::Gt,
        Op::IfGe => CmpOp::Ge,
        Op::IfStrictEq => CmpOp::StrictEq,
        Op::IfStrictNe => CmpOp::StrictNe,
        Op::IfNlt => CmpOp::Nlt,
        Op::IfNle => CmpOp::Nle,
        Op::IfNgt => CmpOp::Ngt,
        Op::IfNge => CmpOp::Nge,
        _ => unreachable!(),
    }
}

fn max_scope_depth(comp: &MethodCompilation) -> usize {
    let mut max = comp.env.max_scope_depth() as usize;
    for (b, block) in comp.blocks.iter() {
        let mut depth = comp.entry_scope(b).len();
        max = max.max(depth);
        let first = block.first_instr.index();
        for k in first..first + block.instr_count as usize {
            match comp.instrs[InstrId::new(k)].op {
                Op::PushScope | Op::PushWith => {
                    depth += 1;
                    max = max.max(depth);
                }
                Op::PopScope => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
    }
    max
}

/// Count the string leaves feeding a concat operand.
fn concat_leaves(comp: &MethodCompilation, node: NodeId) -> u32 {
    if !comp.nodes[node].flags.is_concat_internal() {
        return 1;
    }
    let defs = comp.refs.get(comp.nodes[node].defs);
    let mut n = 0;
    for d in defs {
        if let Some(src) = d.as_node() {
            n += concat_leaves(comp, src);
        }
    }
    n.max(1)
}

/// Mark interior nodes of same-block string-concatenation chains.
fn mark_concat_trees(comp: &mut MethodCompilation) {
    if !comp.settings.fold_string_concat {
        return;
    }
    for i in comp.instrs.keys().collect::<Vec<InstrId>>() {
        if comp.instrs[i].op != Op::Add || !comp.instrs[i].flags.is_reached() {
            continue;
        }
        let out = match comp.instrs[i].pushed_node.expand() {
            Some(out) => out,
            None => continue,
        };
        if comp.nodes[out].ty != DataType::String || comp.nodes[out].flags.is_constant() {
            continue;
        }
        // Interior iff the single consumer is another string add in the same
        // block.
        let uses: Vec<crate::ir::NodeOrInstr> =
            comp.refs.get(comp.nodes[out].uses).iter().copied().collect();
        let mut instr_uses = uses.iter().filter_map(|u| u.as_instr());
        let consumer = match (instr_uses.next(), instr_uses.next()) {
            (Some(c), None) => c,
            _ => continue,
        };
        if uses.iter().any(|u| {
            u.as_node()
                .map_or(false, |n| comp.nodes[n].flags.is_phi())
        }) {
            continue;
        }
        let same_block = comp.instrs[consumer].block == comp.instrs[i].block;
        let consumer_is_string_add = comp.instrs[consumer].op == Op::Add
            && comp.instrs[consumer]
                .pushed_node
                .expand()
                .map_or(false, |n| comp.nodes[n].ty == DataType::String);
        if same_block && consumer_is_string_add {
            comp.nodes[out].flags.set_concat_internal();
        }
    }
}
