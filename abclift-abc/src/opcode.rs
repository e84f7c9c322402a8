//! The AVM2 opcode set and its static operand-shape table.
//!
//! Every opcode is described by one row of the `ops!` table: the encoding
//! byte, the enum variant, the mnemonic, and the shape of the immediate
//! operands that follow the opcode byte in the instruction stream. The
//! decoder drives its reads entirely off this table, so round-tripping byte
//! offsets against cumulative immediate lengths is a table property, not a
//! decoder property.

/// The shape of an opcode's immediate operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    /// No immediates.
    None,
    /// One raw byte.
    Byte,
    /// One variable-length `u30`.
    U30,
    /// Two variable-length `u30`s.
    U30U30,
    /// One 24-bit little-endian two's-complement branch offset.
    S24,
    /// The `debug` shape: byte, `u30`, byte, `u30`.
    Debug,
    /// `lookupswitch`: default `s24`, case count `u30`, then count+1 `s24`s.
    Switch,
}

macro_rules! ops {
    ( $( $byte:expr => $variant:ident, $mnemonic:expr, $shape:ident; )* ) => {
        /// An AVM2 opcode.
        ///
        /// Discriminants are the ABC encoding bytes. Alias opcodes
        /// (`getlocal0`..`getlocal3`, `pushnan`, the redundant `coerce_*`
        /// forms) survive decoding only until normalization folds them onto
        /// their canonical forms.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $(
                #[allow(missing_docs)]
                $variant = $byte,
            )*
        }

        impl Op {
            /// Decode an opcode byte. Returns `None` for bytes that do not
            /// name an AVM2 instruction.
            pub fn from_byte(byte: u8) -> Option<Op> {
                match byte {
                    $( $byte => Some(Op::$variant), )*
                    _ => None,
                }
            }

            /// The assembler mnemonic.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Op::$variant => $mnemonic, )*
                }
            }

            /// The shape of the immediates following the opcode byte.
            pub fn shape(self) -> OperandShape {
                match self {
                    $( Op::$variant => OperandShape::$shape, )*
                }
            }
        }
    };
}

ops! {
    0x01 => Bkpt,           "bkpt",           None;
    0x02 => Nop,            "nop",            None;
    0x03 => Throw,          "throw",          None;
    0x04 => GetSuper,       "getsuper",       U30;
    0x05 => SetSuper,       "setsuper",       U30;
    0x06 => Dxns,           "dxns",           U30;
    0x07 => DxnsLate,       "dxnslate",       None;
    0x08 => Kill,           "kill",           U30;
    0x09 => Label,          "label",          None;
    0x0C => IfNlt,          "ifnlt",          S24;
    0x0D => IfNle,          "ifnle",          S24;
    0x0E => IfNgt,          "ifngt",          S24;
    0x0F => IfNge,          "ifnge",          S24;
    0x10 => Jump,           "jump",           S24;
    0x11 => IfTrue,         "iftrue",         S24;
    0x12 => IfFalse,        "iffalse",        S24;
    0x13 => IfEq,           "ifeq",           S24;
    0x14 => IfNe,           "ifne",           S24;
    0x15 => IfLt,           "iflt",           S24;
    0x16 => IfLe,           "ifle",           S24;
    0x17 => IfGt,           "ifgt",           S24;
    0x18 => IfGe,           "ifge",           S24;
    0x19 => IfStrictEq,     "ifstricteq",     S24;
    0x1A => IfStrictNe,     "ifstrictne",     S24;
    0x1B => LookupSwitch,   "lookupswitch",   Switch;
    0x1C => PushWith,       "pushwith",       None;
    0x1D => PopScope,       "popscope",       None;
    0x1E => NextName,       "nextname",       None;
    0x1F => HasNext,        "hasnext",        None;
    0x20 => PushNull,       "pushnull",       None;
    0x21 => PushUndefined,  "pushundefined",  None;
    0x23 => NextValue,      "nextvalue",      None;
    0x24 => PushByte,       "pushbyte",       Byte;
    0x25 => PushShort,      "pushshort",      U30;
    0x26 => PushTrue,       "pushtrue",       None;
    0x27 => PushFalse,      "pushfalse",      None;
    0x28 => PushNan,        "pushnan",        None;
    0x29 => Pop,            "pop",            None;
    0x2A => Dup,            "dup",            None;
    0x2B => Swap,           "swap",           None;
    0x2C => PushString,     "pushstring",     U30;
    0x2D => PushInt,        "pushint",        U30;
    0x2E => PushUint,       "pushuint",       U30;
    0x2F => PushDouble,     "pushdouble",     U30;
    0x30 => PushScope,      "pushscope",      None;
    0x31 => PushNamespace,  "pushnamespace",  U30;
    0x32 => HasNext2,       "hasnext2",       U30U30;
    0x35 => Li8,            "li8",            None;
    0x36 => Li16,           "li16",           None;
    0x37 => Li32,           "li32",           None;
    0x38 => Lf32,           "lf32",           None;
    0x39 => Lf64,           "lf64",           None;
    0x3A => Si8,            "si8",            None;
    0x3B => Si16,           "si16",           None;
    0x3C => Si32,           "si32",           None;
    0x3D => Sf32,           "sf32",           None;
    0x3E => Sf64,           "sf64",           None;
    0x40 => NewFunction,    "newfunction",    U30;
    0x41 => Call,           "call",           U30;
    0x42 => Construct,      "construct",      U30;
    0x43 => CallMethod,     "callmethod",     U30U30;
    0x44 => CallStatic,     "callstatic",     U30U30;
    0x45 => CallSuper,      "callsuper",      U30U30;
    0x46 => CallProperty,   "callproperty",   U30U30;
    0x47 => ReturnVoid,     "returnvoid",     None;
    0x48 => ReturnValue,    "returnvalue",    None;
    0x49 => ConstructSuper, "constructsuper", U30;
    0x4A => ConstructProp,  "constructprop",  U30U30;
    0x4C => CallPropLex,    "callproplex",    U30U30;
    0x4E => CallSuperVoid,  "callsupervoid",  U30U30;
    0x4F => CallPropVoid,   "callpropvoid",   U30U30;
    0x50 => Sxi1,           "sxi1",           None;
    0x51 => Sxi8,           "sxi8",           None;
    0x52 => Sxi16,          "sxi16",          None;
    0x53 => ApplyType,      "applytype",      U30;
    0x55 => NewObject,      "newobject",      U30;
    0x56 => NewArray,       "newarray",       U30;
    0x57 => NewActivation,  "newactivation",  None;
    0x58 => NewClass,       "newclass",       U30;
    0x59 => GetDescendants, "getdescendants", U30;
    0x5A => NewCatch,       "newcatch",       U30;
    0x5D => FindPropStrict, "findpropstrict", U30;
    0x5E => FindProperty,   "findproperty",   U30;
    0x5F => FindDef,        "finddef",        U30;
    0x60 => GetLex,         "getlex",         U30;
    0x61 => SetProperty,    "setproperty",    U30;
    0x62 => GetLocal,       "getlocal",       U30;
    0x63 => SetLocal,       "setlocal",       U30;
    0x64 => GetGlobalScope, "getglobalscope", None;
    0x65 => GetScopeObject, "getscopeobject", Byte;
    0x66 => GetProperty,    "getproperty",    U30;
    0x68 => InitProperty,   "initproperty",   U30;
    0x6A => DeleteProperty, "deleteproperty", U30;
    0x6C => GetSlot,        "getslot",        U30;
    0x6D => SetSlot,        "setslot",        U30;
    0x6E => GetGlobalSlot,  "getglobalslot",  U30;
    0x6F => SetGlobalSlot,  "setglobalslot",  U30;
    0x70 => ConvertS,       "convert_s",      None;
    0x71 => EscXElem,       "esc_xelem",      None;
    0x72 => EscXAttr,       "esc_xattr",      None;
    0x73 => ConvertI,       "convert_i",      None;
    0x74 => ConvertU,       "convert_u",      None;
    0x75 => ConvertD,       "convert_d",      None;
    0x76 => ConvertB,       "convert_b",      None;
    0x77 => ConvertO,       "convert_o",      None;
    0x78 => CheckFilter,    "checkfilter",    None;
    0x80 => Coerce,         "coerce",         U30;
    0x81 => CoerceB,        "coerce_b",       None;
    0x82 => CoerceA,        "coerce_a",       None;
    0x83 => CoerceI,        "coerce_i",       None;
    0x84 => CoerceD,        "coerce_d",       None;
    0x85 => CoerceS,        "coerce_s",       None;
    0x86 => AsType,         "astype",         U30;
    0x87 => AsTypeLate,     "astypelate",     None;
    0x88 => CoerceU,        "coerce_u",       None;
    0x89 => CoerceO,        "coerce_o",       None;
    0x90 => Negate,         "negate",         None;
    0x91 => Increment,      "increment",      None;
    0x92 => IncLocal,       "inclocal",       U30;
    0x93 => Decrement,      "decrement",      None;
    0x94 => DecLocal,       "declocal",       U30;
    0x95 => TypeOf,         "typeof",         None;
    0x96 => Not,            "not",            None;
    0x97 => BitNot,         "bitnot",         None;
    0xA0 => Add,            "add",            None;
    0xA1 => Subtract,       "subtract",       None;
    0xA2 => Multiply,       "multiply",       None;
    0xA3 => Divide,         "divide",         None;
    0xA4 => Modulo,         "modulo",         None;
    0xA5 => LShift,         "lshift",         None;
    0xA6 => RShift,         "rshift",         None;
    0xA7 => UrShift,        "urshift",        None;
    0xA8 => BitAnd,         "bitand",         None;
    0xA9 => BitOr,          "bitor",          None;
    0xAA => BitXor,         "bitxor",         None;
    0xAB => Equals,         "equals",         None;
    0xAC => StrictEquals,   "strictequals",   None;
    0xAD => LessThan,       "lessthan",       None;
    0xAE => LessEquals,     "lessequals",     None;
    0xAF => GreaterThan,    "greaterthan",    None;
    0xB0 => GreaterEquals,  "greaterequals",  None;
    0xB1 => InstanceOf,     "instanceof",     None;
    0xB2 => IsType,         "istype",         U30;
    0xB3 => IsTypeLate,     "istypelate",     None;
    0xB4 => In,             "in",             None;
    0xC0 => IncrementI,     "increment_i",    None;
    0xC1 => DecrementI,     "decrement_i",    None;
    0xC2 => IncLocalI,      "inclocal_i",     U30;
    0xC3 => DecLocalI,      "declocal_i",     U30;
    0xC4 => NegateI,        "negate_i",       None;
    0xC5 => AddI,           "add_i",          None;
    0xC6 => SubtractI,      "subtract_i",     None;
    0xC7 => MultiplyI,      "multiply_i",     None;
    0xD0 => GetLocal0,      "getlocal0",      None;
    0xD1 => GetLocal1,      "getlocal1",      None;
    0xD2 => GetLocal2,      "getlocal2",      None;
    0xD3 => GetLocal3,      "getlocal3",      None;
    0xD4 => SetLocal0,      "setlocal0",      None;
    0xD5 => SetLocal1,      "setlocal1",      None;
    0xD6 => SetLocal2,      "setlocal2",      None;
    0xD7 => SetLocal3,      "setlocal3",      None;
    0xEF => Debug,          "debug",          Debug;
    0xF0 => DebugLine,      "debugline",      U30;
    0xF1 => DebugFile,      "debugfile",      U30;
    0xF2 => BkptLine,       "bkptline",       U30;
    0xF3 => Timestamp,      "timestamp",      None;
}

impl Op {
    /// Is this an unconditional `jump`?
    pub fn is_jump(self) -> bool {
        self == Op::Jump
    }

    /// Is this a conditional branch (`iftrue`..`ifstrictne`, `ifnlt`..`ifnge`)?
    pub fn is_conditional_branch(self) -> bool {
        match self {
            Op::IfNlt
            | Op::IfNle
            | Op::IfNgt
            | Op::IfNge
            | Op::IfTrue
            | Op::IfFalse
            | Op::IfEq
            | Op::IfNe
            | Op::IfLt
            | Op::IfLe
            | Op::IfGt
            | Op::IfGe
            | Op::IfStrictEq
            | Op::IfStrictNe => true,
            _ => false,
        }
    }

    /// Does this opcode end its basic block?
    ///
    /// Covers jumps, conditional branches, `lookupswitch`, returns and
    /// `throw`. Fallthrough block boundaries are discovered by the flow
    /// assembler, not by the opcode.
    pub fn is_block_end(self) -> bool {
        self.is_jump()
            || self.is_conditional_branch()
            || match self {
                Op::LookupSwitch | Op::ReturnVoid | Op::ReturnValue | Op::Throw => true,
                _ => false,
            }
    }

    /// Does control never fall through to the next instruction?
    pub fn is_terminator(self) -> bool {
        match self {
            Op::Jump | Op::LookupSwitch | Op::ReturnVoid | Op::ReturnValue | Op::Throw => true,
            _ => false,
        }
    }

    /// Is this one of the global-memory load/store/sign-extend opcodes?
    pub fn is_memory(self) -> bool {
        match self {
            Op::Li8
            | Op::Li16
            | Op::Li32
            | Op::Lf32
            | Op::Lf64
            | Op::Si8
            | Op::Si16
            | Op::Si32
            | Op::Sf32
            | Op::Sf64 => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_roundtrip() {
        for byte in 0..=255u8 {
            if let Some(op) = Op::from_byte(byte) {
                assert_eq!(op as u8, byte, "{}", op.mnemonic());
            }
        }
    }

    #[test]
    fn holes_are_invalid() {
        // A few known gaps in the AVM2 encoding.
        for byte in [0x00u8, 0x0A, 0x22, 0x33, 0x3F, 0x54, 0x69, 0xFF] {
            assert!(Op::from_byte(byte).is_none(), "{:#04x}", byte);
        }
    }

    #[test]
    fn shapes() {
        assert_eq!(Op::Jump.shape(), OperandShape::S24);
        assert_eq!(Op::PushByte.shape(), OperandShape::Byte);
        assert_eq!(Op::HasNext2.shape(), OperandShape::U30U30);
        assert_eq!(Op::LookupSwitch.shape(), OperandShape::Switch);
        assert_eq!(Op::Debug.shape(), OperandShape::Debug);
        assert_eq!(Op::GetScopeObject.shape(), OperandShape::Byte);
        assert_eq!(Op::Add.shape(), OperandShape::None);
    }

    #[test]
    fn classifications() {
        assert!(Op::Jump.is_block_end());
        assert!(Op::Jump.is_terminator());
        assert!(Op::IfGt.is_block_end());
        assert!(!Op::IfGt.is_terminator());
        assert!(Op::LookupSwitch.is_terminator());
        assert!(Op::Throw.is_terminator());
        assert!(!Op::Add.is_block_end());
        assert!(Op::Li8.is_memory());
        assert!(!Op::Sxi1.is_memory());
    }
}
