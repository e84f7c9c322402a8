//! The instruction decoder.
//!
//! Turns the method body bytes into the instruction arena. Each byte position
//! holding an opcode yields exactly one `Instruction` with its absolute
//! offset; immediate reads are driven by the opcode-info table in
//! `abclift_abc::opcode`.
//!
//! Undefined opcode bytes are tolerated here — they may be unreachable
//! padding — and recorded as flagged zero-operand instructions. The flow
//! assembler rejects them if they turn out to be reachable.

use crate::compilation::MethodCompilation;
use crate::error::{CompileError, CompileResult, ErrorCode};
use crate::ir::{InstrData, InstrId, Instruction, SwitchTable};
use crate::timing;
use abclift_abc::{Op, OperandShape};
use log::debug;

/// Decode the whole method body into `comp.instrs`.
pub fn run(comp: &mut MethodCompilation) -> CompileResult<()> {
    let _tt = timing::decode();
    let env = comp.env;
    let code = env.code();
    if code.is_empty() {
        return Err(CompileError::new(ErrorCode::InvalidCodeLength));
    }

    let mut pos = 0usize;
    while pos < code.len() {
        let offset = pos as u32;
        let at = comp.instrs.next_key();
        let byte = code[pos];
        pos += 1;

        let op = match Op::from_byte(byte) {
            Some(op) => op,
            None => {
                // Possibly unreachable padding; keep it as a flagged
                // zero-operand instruction.
                let mut instr = Instruction::new(Op::Nop, offset, InstrData::None);
                instr.flags.set_invalid_opcode();
                comp.instrs.push(instr);
                continue;
            }
        };

        let data = match op.shape() {
            OperandShape::None => InstrData::None,
            OperandShape::Byte => {
                let value = read_byte(code, &mut pos, at)?;
                match op {
                    Op::PushByte => InstrData::Int(value as i8 as i32),
                    Op::GetScopeObject => InstrData::ScopeIndex(value),
                    _ => InstrData::Int(value as i32),
                }
            }
            OperandShape::U30 => {
                let value = read_u30(code, &mut pos, at)?;
                classify_u30(op, value)
            }
            OperandShape::U30U30 => {
                let a = read_u30(code, &mut pos, at)?;
                let b = read_u30(code, &mut pos, at)?;
                classify_u30x2(op, a, b)
            }
            OperandShape::S24 => InstrData::Branch(read_s24(code, &mut pos, at)?),
            OperandShape::Debug => {
                read_byte(code, &mut pos, at)?;
                read_u30(code, &mut pos, at)?;
                read_byte(code, &mut pos, at)?;
                read_u30(code, &mut pos, at)?;
                InstrData::None
            }
            OperandShape::Switch => {
                let default = read_s24(code, &mut pos, at)?;
                let case_count = read_u30(code, &mut pos, at)?;
                let mut targets = Vec::with_capacity(case_count as usize + 2);
                targets.push(default);
                for _ in 0..=case_count {
                    targets.push(read_s24(code, &mut pos, at)?);
                }
                InstrData::Switch(SwitchTable {
                    targets: comp.offset_lists.alloc(&targets),
                })
            }
        };

        comp.instrs.push(normalize(Instruction::new(op, offset, data)));
    }

    debug!("decoded {} instructions", comp.instrs.len());
    Ok(())
}

/// Fold alias opcodes onto their canonical forms.
///
/// The short local forms gain an explicit index; `pushnan` becomes a
/// `pushdouble` of constant-pool slot 0 (NaN); the redundant coerce opcodes
/// collapse onto their convert equivalents. `coerce_s` survives: unlike
/// `convert_s` it passes `null` and `undefined` through unchanged.
fn normalize(mut instr: Instruction) -> Instruction {
    match instr.op {
        Op::GetLocal0 | Op::GetLocal1 | Op::GetLocal2 | Op::GetLocal3 => {
            instr.data = InstrData::Local(instr.op as u32 - Op::GetLocal0 as u32);
            instr.op = Op::GetLocal;
        }
        Op::SetLocal0 | Op::SetLocal1 | Op::SetLocal2 | Op::SetLocal3 => {
            instr.data = InstrData::Local(instr.op as u32 - Op::SetLocal0 as u32);
            instr.op = Op::SetLocal;
        }
        Op::PushNan => {
            instr.op = Op::PushDouble;
            instr.data = InstrData::Pool(0);
        }
        Op::CoerceB => instr.op = Op::ConvertB,
        Op::CoerceI => instr.op = Op::ConvertI,
        Op::CoerceU => instr.op = Op::ConvertU,
        Op::CoerceD => instr.op = Op::ConvertD,
        _ => {}
    }
    instr
}

fn classify_u30(op: Op, value: u32) -> InstrData {
    match op {
        Op::GetLocal | Op::SetLocal | Op::Kill | Op::IncLocal | Op::DecLocal | Op::IncLocalI
        | Op::DecLocalI => InstrData::Local(value),
        Op::PushString | Op::PushInt | Op::PushUint | Op::PushDouble | Op::PushNamespace
        | Op::Dxns | Op::NewFunction | Op::NewClass | Op::NewCatch | Op::DebugFile
        | Op::DebugLine | Op::BkptLine => InstrData::Pool(value),
        Op::GetSuper | Op::SetSuper | Op::FindPropStrict | Op::FindProperty | Op::FindDef
        | Op::GetLex | Op::SetProperty | Op::GetProperty | Op::InitProperty
        | Op::DeleteProperty | Op::GetDescendants | Op::IsType | Op::Coerce | Op::AsType => {
            InstrData::Name(value)
        }
        Op::GetSlot | Op::SetSlot | Op::GetGlobalSlot | Op::SetGlobalSlot => {
            InstrData::Slot(value)
        }
        Op::Call | Op::Construct | Op::ConstructSuper | Op::NewArray | Op::NewObject
        | Op::ApplyType => InstrData::Argc(value),
        // The operand is a signed value in 30 bits.
        Op::PushShort => InstrData::Int(((value << 2) as i32) >> 2),
        _ => InstrData::Pool(value),
    }
}

fn classify_u30x2(op: Op, a: u32, b: u32) -> InstrData {
    match op {
        Op::CallProperty
        | Op::CallPropLex
        | Op::CallPropVoid
        | Op::CallSuper
        | Op::CallSuperVoid
        | Op::ConstructProp => InstrData::NameArgc { name: a, argc: b },
        Op::CallStatic | Op::CallMethod => InstrData::MethodArgc { method: a, argc: b },
        Op::HasNext2 => InstrData::HasNext2 {
            object: a,
            index: b,
        },
        _ => InstrData::NameArgc { name: a, argc: b },
    }
}

fn read_byte(code: &[u8], pos: &mut usize, at: InstrId) -> CompileResult<u8> {
    if *pos >= code.len() {
        return Err(CompileError::at(ErrorCode::CodeFalloffEndOfMethod, at));
    }
    let b = code[*pos];
    *pos += 1;
    Ok(b)
}

/// Read a `u30`: little-endian, 7 bits per byte with a continuation bit,
/// accepted over at most 5 bytes and 30 value bits.
fn read_u30(code: &[u8], pos: &mut usize, at: InstrId) -> CompileResult<u32> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    loop {
        let b = read_byte(code, pos, at)?;
        if shift == 28 {
            // Fifth byte: two value bits left, no continuation allowed.
            if b & !0x03 != 0 {
                return Err(CompileError::at(ErrorCode::AbcIllegalU30Value, at));
            }
            return Ok(value | (u32::from(b) << 28));
        }
        value |= u32::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Read an `s24`: 24-bit little-endian two's complement.
fn read_s24(code: &[u8], pos: &mut usize, at: InstrId) -> CompileResult<i32> {
    let b0 = read_byte(code, pos, at)? as u32;
    let b1 = read_byte(code, pos, at)? as u32;
    let b2 = read_byte(code, pos, at)? as u32;
    let raw = b0 | (b1 << 8) | (b2 << 16);
    Ok(((raw << 8) as i32) >> 8)
}
