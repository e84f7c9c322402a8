//! End-to-end compilation scenarios: assembled bytecode through every pass
//! into a recorded IL stream.

use abclift_abc::asm::Assembler;
use abclift_abc::env::{DummyEnvironment, DummyRegistry, ExceptionRecord};
use abclift_abc::{Builtin, ClassRegistry, MethodSignature, Op, TypeRef};
use abclift_codegen::il::{CmpOp, Helper, IlEvent, IlOp, IlType, MemWidth, RecordingBuilder};
use abclift_codegen::{ErrorCode, MethodCompilation};

fn compile<'a>(
    env: &'a DummyEnvironment,
    reg: &'a DummyRegistry,
) -> (MethodCompilation<'a>, RecordingBuilder) {
    let mut comp = MethodCompilation::new(env, reg);
    let mut il = RecordingBuilder::new();
    comp.compile(&mut il).expect("compilation failed");
    assert_eq!(il.outstanding_temps(), 0, "unbalanced temp locals");
    (comp, il)
}

fn int_sig(reg: &DummyRegistry, params: usize) -> MethodSignature {
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
fn straight_line_add() {
    // S1: getlocal_0; getlocal_1; add; returnvalue over two int parameters.
    // (Parameters live in slots 1 and 2; slot 0 is `this`.)
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
    let mut asm = Assembler::new();
    asm.op(Op::GetLocal1);
    asm.op(Op::GetLocal2);
    asm.op(Op::Add);
    asm.op(Op::ReturnValue);
    env.set_code(asm.finish());
    env.set_signature(int_sig(&reg, 2));
    env.set_local_count(3);

    let (comp, il) = compile(&env, &reg);
    assert_eq!(comp.blocks.len(), 1);
    assert_eq!(il.count_ops(|op| *op == IlOp::Add(IlType::I32)), 1);
    assert_eq!(il.count_ops(|op| *op == IlOp::Ret), 1);
    // The prelude materializes `this` and both parameters.
    assert_eq!(il.count_ops(|op| matches!(op, IlOp::LdArg(_))), 3);
}

#[test]
fn conditional_branch() {
    // S2: getlocal_0; pushbyte 0; ifgt L1; pushbyte 1; returnvalue;
    // L1: pushbyte 2; returnvalue.
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
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
    env.set_code(asm.finish());
    env.set_signature(int_sig(&reg, 1));
    env.set_local_count(2);

    let (comp, il) = compile(&env, &reg);
    assert_eq!(comp.blocks.len(), 3);
    assert_eq!(il.count_ops(|op| matches!(op, IlOp::Cmp(CmpOp::Gt, IlType::I32))), 1);
    assert_eq!(il.count_ops(|op| matches!(op, IlOp::BrTrue(_))), 1);
    assert_eq!(il.count_ops(|op| *op == IlOp::Ret), 2);

    let dump = abclift_codegen::compilation::dump_blocks(&comp);
    assert!(dump.contains("Branch"), "{}", dump);
    assert_eq!(dump.matches("Return").count(), 2, "{}", dump);
}

#[test]
fn loop_with_phi() {
    // S3: count from 0 to 10, then return the counter.
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
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
    env.set_code(asm.finish());
    env.set_signature(int_sig(&reg, 0));
    env.set_local_count(2);

    let (comp, il) = compile(&env, &reg);
    // The loop body adds ints and stores back into the slot-backed local.
    assert!(il.count_ops(|op| *op == IlOp::Add(IlType::I32)) >= 1);
    assert!(il.count_ops(|op| matches!(op, IlOp::Br(_))) >= 2);
    // One real phi survives (local 1 at the loop header).
    let phis = comp
        .nodes
        .values()
        .filter(|n| n.flags.is_phi())
        .count();
    assert_eq!(phis, 1);
}

#[test]
fn exception_scaffolding_is_emitted() {
    // S5: the catch entry receives the thrown value through the stash local
    // of the catch block's stack slot 0.
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
    let mut asm = Assembler::new();
    asm.op_byte(Op::PushByte, 1); // 0
    asm.op_u30(Op::SetLocal, 1); // 2
    asm.op(Op::ReturnVoid); // 4
    asm.op(Op::ReturnValue); // 5: catch target returns the exception
    env.set_code(asm.finish());
    env.set_local_count(2);
    env.add_exception(ExceptionRecord {
        from: 0,
        to: 5,
        target: 5,
        type_name: 0,
        var_name: 0,
    });

    let (comp, il) = compile(&env, &reg);
    assert_eq!(comp.handlers.len(), 1);

    let begin_try = il.events.iter().filter(|e| **e == IlEvent::BeginTry).count();
    let begin_filter = il.events.iter().filter(|e| **e == IlEvent::BeginFilter).count();
    let begin_catch = il.events.iter().filter(|e| **e == IlEvent::BeginCatch).count();
    let end_try = il.events.iter().filter(|e| **e == IlEvent::EndTry).count();
    assert_eq!((begin_try, begin_filter, begin_catch, end_try), (1, 1, 1, 1));

    // The filter dispatches on the handler-id register and ends with a
    // verdict; the catch clause hands the exception to the catch block.
    assert!(il.count_ops(|op| *op == IlOp::EndFilter) >= 2);
    assert!(il.count_ops(|op| matches!(op, IlOp::Switch(_))) >= 2);

    // After the catch clause begins, the thrown value is stashed and control
    // transfers into the body.
    let catch_at = il
        .events
        .iter()
        .position(|e| *e == IlEvent::BeginCatch)
        .unwrap();
    let tail: Vec<&IlOp> = il.events[catch_at..]
        .iter()
        .filter_map(|e| match e {
            IlEvent::Op(op) => Some(op),
            _ => None,
        })
        .collect();
    assert!(tail.iter().any(|op| matches!(op, IlOp::StLoc(_))));
    assert!(tail.iter().any(|op| matches!(op, IlOp::Br(_))));
}

#[test]
fn dup_fold() {
    // S6: two identical constant pushes collapse into push + dup.
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
    let forty_two = env.add_int(42);
    let mut asm = Assembler::new();
    asm.op_u30(Op::PushInt, forty_two);
    asm.op_u30(Op::PushInt, forty_two);
    asm.op_u30(Op::NewArray, 2);
    asm.op(Op::ReturnValue);
    env.set_code(asm.finish());

    let (_, il) = compile(&env, &reg);
    assert_eq!(il.count_ops(|op| *op == IlOp::LdcI4(42)), 1);
    assert_eq!(il.count_ops(|op| *op == IlOp::Dup), 1);
}

#[test]
fn dup_fold_respects_conversions() {
    // A conversion between the pushes keeps both materializations.
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
    let s = env.add_string("x");
    let mut asm = Assembler::new();
    asm.op_u30(Op::PushString, s);
    asm.op(Op::ConvertI);
    asm.op_u30(Op::PushString, s);
    asm.op_u30(Op::NewArray, 2);
    asm.op(Op::ReturnValue);
    env.set_code(asm.finish());

    let (_, il) = compile(&env, &reg);
    assert_eq!(il.count_ops(|op| *op == IlOp::Dup), 0);
    assert_eq!(il.count_ops(|op| matches!(op, IlOp::LdStr(_))), 2);
}

#[test]
fn string_concat_chain_folds() {
    // a + b + c + d over four string constants folds in the data-flow
    // layer; variables keep the n-ary concat alive instead.
    let reg = DummyRegistry::with_builtins();
    let string_t = TypeRef::Class(reg.builtin(Builtin::String));
    let mut env = DummyEnvironment::new();
    let mut sig = MethodSignature::empty();
    sig.params = vec![string_t; 3];
    sig.return_type = string_t;
    env.set_signature(sig);
    env.set_local_count(4);
    let mut asm = Assembler::new();
    asm.op(Op::GetLocal1);
    asm.op(Op::GetLocal2);
    asm.op(Op::Add);
    asm.op(Op::GetLocal3);
    asm.op(Op::Add);
    asm.op(Op::ReturnValue);
    env.set_code(asm.finish());

    let (_, il) = compile(&env, &reg);
    // One 3-ary concat, no 2-ary ones.
    assert_eq!(
        il.count_ops(|op| *op == IlOp::CallHelper(Helper::ConcatStrings(3))),
        1
    );
    assert_eq!(
        il.count_ops(|op| *op == IlOp::CallHelper(Helper::ConcatStrings(2))),
        0
    );
}

#[test]
fn global_memory_bounds_check() {
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
    env.set_signature(int_sig(&reg, 1));
    env.set_local_count(2);
    let mut asm = Assembler::new();
    asm.op(Op::GetLocal1);
    asm.op(Op::Li8);
    asm.op(Op::ReturnValue);
    env.set_code(asm.finish());

    let (_, il) = compile(&env, &reg);
    assert_eq!(il.count_ops(|op| *op == IlOp::LoadMem(MemWidth::I8)), 1);
    assert_eq!(
        il.count_ops(|op| matches!(op, IlOp::BrCmp(CmpOp::Gt, IlType::I32, _))),
        1
    );
    // The shared trap at the method tail.
    assert_eq!(
        il.count_ops(|op| *op == IlOp::CallHelper(Helper::ThrowRangeError)),
        1
    );
}

#[test]
fn constant_folding_reaches_the_stream() {
    // (2 + 3) * 4 compiles to a single constant push.
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
    let mut asm = Assembler::new();
    asm.op_byte(Op::PushByte, 2);
    asm.op_byte(Op::PushByte, 3);
    asm.op(Op::Add);
    asm.op_byte(Op::PushByte, 4);
    asm.op(Op::Multiply);
    asm.op(Op::ReturnValue);
    env.set_code(asm.finish());
    env.set_signature(int_sig(&reg, 0));

    let (_, il) = compile(&env, &reg);
    assert_eq!(il.count_ops(|op| *op == IlOp::LdcI4(20)), 1);
    assert_eq!(il.count_ops(|op| matches!(op, IlOp::Add(_))), 0);
    assert_eq!(il.count_ops(|op| matches!(op, IlOp::Mul(_))), 0);
}

#[test]
fn empty_body_is_rejected() {
    let reg = DummyRegistry::with_builtins();
    let env = DummyEnvironment::new();
    let mut comp = MethodCompilation::new(&env, &reg);
    let mut il = RecordingBuilder::new();
    let err = comp.compile(&mut il).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidCodeLength);
}

#[test]
fn single_instruction_body() {
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
    let mut asm = Assembler::new();
    asm.op(Op::ReturnVoid);
    env.set_code(asm.finish());
    let (comp, il) = compile(&env, &reg);
    assert_eq!(comp.blocks.len(), 1);
    assert_eq!(il.count_ops(|op| *op == IlOp::RetVoid), 1);
}

#[test]
fn nested_try_regions_compile() {
    // S4 end to end: overlapping handlers split and the whole method still
    // compiles with every block inside the right region.
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
    let mut asm = Assembler::new();
    for _ in 0..30 {
        asm.op(Op::Nop);
    }
    asm.op(Op::ReturnVoid);
    env.set_code(asm.finish());
    env.add_exception(ExceptionRecord {
        from: 0,
        to: 20,
        target: 25,
        type_name: 0,
        var_name: 0,
    });
    env.add_exception(ExceptionRecord {
        from: 10,
        to: 30,
        target: 28,
        type_name: 0,
        var_name: 0,
    });

    let (comp, il) = compile(&env, &reg);
    assert_eq!(comp.handlers.len(), 3);
    // The handler-id register is retargeted when crossing region borders.
    assert!(il.count_ops(|op| matches!(op, IlOp::LdcI4(_))) >= 3);
}

#[test]
fn runtime_property_fallback_compiles() {
    // Property access on `*` lowers to a reflective helper call.
    let reg = DummyRegistry::with_builtins();
    let mut env = DummyEnvironment::new();
    let name = env.add_public_name("anything");
    let mut sig = MethodSignature::empty();
    sig.params = vec![TypeRef::Any];
    sig.return_type = TypeRef::Any;
    env.set_signature(sig);
    env.set_local_count(2);
    let mut asm = Assembler::new();
    asm.op(Op::GetLocal1);
    asm.op_u30(Op::GetProperty, name);
    asm.op(Op::ReturnValue);
    env.set_code(asm.finish());

    let (_, il) = compile(&env, &reg);
    assert_eq!(
        il.count_ops(|op| *op == IlOp::CallHelper(Helper::GetPropertyLate)),
        1
    );
}
