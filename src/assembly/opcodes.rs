//! Native CIL instruction table.
//!
//! [`Code`] enumerates the native instructions the translator can emit and the pattern engine can
//! match on. Every entry carries its encoded value, mnemonic, inline operand type, control-flow
//! behaviour and fixed stack effect. Two-byte opcodes are encoded as `0xFE00 | second_byte`.

use strum::{EnumCount, EnumIter};

use crate::assembly::instruction::{FlowType, OperandType};

/// Sentinel for stack effects that depend on a call signature.
const VAR: u8 = u8::MAX;

macro_rules! opcodes {
    ($( $variant:ident = $value:literal, $mnemonic:literal, $operand:ident, $flow:ident, $pops:expr, $pushes:expr; )*) => {
        /// A native CIL instruction.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount)]
        #[allow(missing_docs)]
        pub enum Code {
            $( $variant, )*
        }

        impl Code {
            /// Encoded opcode value; two-byte opcodes carry the `0xFE` prefix in the high byte.
            #[must_use]
            pub const fn value(self) -> u16 {
                match self {
                    $( Code::$variant => $value, )*
                }
            }

            /// Canonical mnemonic.
            #[must_use]
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Code::$variant => $mnemonic, )*
                }
            }

            /// Type of the inline operand following the opcode.
            #[must_use]
            pub const fn operand_type(self) -> OperandType {
                match self {
                    $( Code::$variant => OperandType::$operand, )*
                }
            }

            /// Control-flow behaviour.
            #[must_use]
            pub const fn flow(self) -> FlowType {
                match self {
                    $( Code::$variant => FlowType::$flow, )*
                }
            }

            /// Number of values popped and pushed, or `None` when it depends on a call signature.
            #[must_use]
            pub const fn stack_effect(self) -> Option<(u8, u8)> {
                let (pops, pushes) = match self {
                    $( Code::$variant => ($pops, $pushes), )*
                };
                if pops == VAR || pushes == VAR {
                    None
                } else {
                    Some((pops, pushes))
                }
            }

            /// Looks up an instruction by its encoded value.
            #[must_use]
            pub const fn from_value(value: u16) -> Option<Code> {
                match value {
                    $( $value => Some(Code::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", None, Sequential, 0, 0;
    Ldarg0 = 0x02, "ldarg.0", None, Sequential, 0, 1;
    Ldarg1 = 0x03, "ldarg.1", None, Sequential, 0, 1;
    Ldarg2 = 0x04, "ldarg.2", None, Sequential, 0, 1;
    Ldarg3 = 0x05, "ldarg.3", None, Sequential, 0, 1;
    Ldloc0 = 0x06, "ldloc.0", None, Sequential, 0, 1;
    Ldloc1 = 0x07, "ldloc.1", None, Sequential, 0, 1;
    Ldloc2 = 0x08, "ldloc.2", None, Sequential, 0, 1;
    Ldloc3 = 0x09, "ldloc.3", None, Sequential, 0, 1;
    Stloc0 = 0x0A, "stloc.0", None, Sequential, 1, 0;
    Stloc1 = 0x0B, "stloc.1", None, Sequential, 1, 0;
    Stloc2 = 0x0C, "stloc.2", None, Sequential, 1, 0;
    Stloc3 = 0x0D, "stloc.3", None, Sequential, 1, 0;
    LdargS = 0x0E, "ldarg.s", UInt8, Sequential, 0, 1;
    StargS = 0x10, "starg.s", UInt8, Sequential, 1, 0;
    LdlocS = 0x11, "ldloc.s", UInt8, Sequential, 0, 1;
    StlocS = 0x13, "stloc.s", UInt8, Sequential, 1, 0;
    Ldnull = 0x14, "ldnull", None, Sequential, 0, 1;
    LdcI4M1 = 0x15, "ldc.i4.m1", None, Sequential, 0, 1;
    LdcI40 = 0x16, "ldc.i4.0", None, Sequential, 0, 1;
    LdcI41 = 0x17, "ldc.i4.1", None, Sequential, 0, 1;
    LdcI42 = 0x18, "ldc.i4.2", None, Sequential, 0, 1;
    LdcI43 = 0x19, "ldc.i4.3", None, Sequential, 0, 1;
    LdcI44 = 0x1A, "ldc.i4.4", None, Sequential, 0, 1;
    LdcI45 = 0x1B, "ldc.i4.5", None, Sequential, 0, 1;
    LdcI46 = 0x1C, "ldc.i4.6", None, Sequential, 0, 1;
    LdcI47 = 0x1D, "ldc.i4.7", None, Sequential, 0, 1;
    LdcI48 = 0x1E, "ldc.i4.8", None, Sequential, 0, 1;
    LdcI4S = 0x1F, "ldc.i4.s", Int8, Sequential, 0, 1;
    LdcI4 = 0x20, "ldc.i4", Int32, Sequential, 0, 1;
    LdcI8 = 0x21, "ldc.i8", Int64, Sequential, 0, 1;
    LdcR4 = 0x22, "ldc.r4", Float32, Sequential, 0, 1;
    LdcR8 = 0x23, "ldc.r8", Float64, Sequential, 0, 1;
    Dup = 0x25, "dup", None, Sequential, 1, 2;
    Pop = 0x26, "pop", None, Sequential, 1, 0;
    Call = 0x28, "call", Token, Call, VAR, VAR;
    Ret = 0x2A, "ret", None, Return, VAR, 0;
    BrS = 0x2B, "br.s", Int8, UnconditionalBranch, 0, 0;
    BrfalseS = 0x2C, "brfalse.s", Int8, ConditionalBranch, 1, 0;
    BrtrueS = 0x2D, "brtrue.s", Int8, ConditionalBranch, 1, 0;
    BeqS = 0x2E, "beq.s", Int8, ConditionalBranch, 2, 0;
    BgeS = 0x2F, "bge.s", Int8, ConditionalBranch, 2, 0;
    BgtS = 0x30, "bgt.s", Int8, ConditionalBranch, 2, 0;
    BleS = 0x31, "ble.s", Int8, ConditionalBranch, 2, 0;
    BltS = 0x32, "blt.s", Int8, ConditionalBranch, 2, 0;
    BneUnS = 0x33, "bne.un.s", Int8, ConditionalBranch, 2, 0;
    Br = 0x38, "br", Int32, UnconditionalBranch, 0, 0;
    Brfalse = 0x39, "brfalse", Int32, ConditionalBranch, 1, 0;
    Brtrue = 0x3A, "brtrue", Int32, ConditionalBranch, 1, 0;
    Beq = 0x3B, "beq", Int32, ConditionalBranch, 2, 0;
    Bge = 0x3C, "bge", Int32, ConditionalBranch, 2, 0;
    Bgt = 0x3D, "bgt", Int32, ConditionalBranch, 2, 0;
    Ble = 0x3E, "ble", Int32, ConditionalBranch, 2, 0;
    Blt = 0x3F, "blt", Int32, ConditionalBranch, 2, 0;
    BneUn = 0x40, "bne.un", Int32, ConditionalBranch, 2, 0;
    Switch = 0x45, "switch", Switch, Switch, 1, 0;
    Add = 0x58, "add", None, Sequential, 2, 1;
    Sub = 0x59, "sub", None, Sequential, 2, 1;
    Mul = 0x5A, "mul", None, Sequential, 2, 1;
    Div = 0x5B, "div", None, Sequential, 2, 1;
    DivUn = 0x5C, "div.un", None, Sequential, 2, 1;
    Rem = 0x5D, "rem", None, Sequential, 2, 1;
    RemUn = 0x5E, "rem.un", None, Sequential, 2, 1;
    And = 0x5F, "and", None, Sequential, 2, 1;
    Or = 0x60, "or", None, Sequential, 2, 1;
    Xor = 0x61, "xor", None, Sequential, 2, 1;
    Shl = 0x62, "shl", None, Sequential, 2, 1;
    Shr = 0x63, "shr", None, Sequential, 2, 1;
    ShrUn = 0x64, "shr.un", None, Sequential, 2, 1;
    Neg = 0x65, "neg", None, Sequential, 1, 1;
    Not = 0x66, "not", None, Sequential, 1, 1;
    ConvI1 = 0x67, "conv.i1", None, Sequential, 1, 1;
    ConvI2 = 0x68, "conv.i2", None, Sequential, 1, 1;
    ConvI4 = 0x69, "conv.i4", None, Sequential, 1, 1;
    ConvI8 = 0x6A, "conv.i8", None, Sequential, 1, 1;
    ConvR4 = 0x6B, "conv.r4", None, Sequential, 1, 1;
    ConvR8 = 0x6C, "conv.r8", None, Sequential, 1, 1;
    ConvU4 = 0x6D, "conv.u4", None, Sequential, 1, 1;
    ConvU8 = 0x6E, "conv.u8", None, Sequential, 1, 1;
    Callvirt = 0x6F, "callvirt", Token, Call, VAR, VAR;
    Ldstr = 0x72, "ldstr", Token, Sequential, 0, 1;
    Newobj = 0x73, "newobj", Token, Call, VAR, 1;
    Castclass = 0x74, "castclass", Token, Sequential, 1, 1;
    Isinst = 0x75, "isinst", Token, Sequential, 1, 1;
    ConvRUn = 0x76, "conv.r.un", None, Sequential, 1, 1;
    Throw = 0x7A, "throw", None, Throw, 1, 0;
    Ldfld = 0x7B, "ldfld", Token, Sequential, 1, 1;
    Stfld = 0x7D, "stfld", Token, Sequential, 2, 0;
    Ldsfld = 0x7E, "ldsfld", Token, Sequential, 0, 1;
    Stsfld = 0x80, "stsfld", Token, Sequential, 1, 0;
    Box = 0x8C, "box", Token, Sequential, 1, 1;
    Newarr = 0x8D, "newarr", Token, Sequential, 1, 1;
    Ldlen = 0x8E, "ldlen", None, Sequential, 1, 1;
    LdelemU1 = 0x91, "ldelem.u1", None, Sequential, 2, 1;
    LdelemU2 = 0x93, "ldelem.u2", None, Sequential, 2, 1;
    LdelemI4 = 0x94, "ldelem.i4", None, Sequential, 2, 1;
    LdelemRef = 0x9A, "ldelem.ref", None, Sequential, 2, 1;
    StelemRef = 0xA2, "stelem.ref", None, Sequential, 3, 0;
    UnboxAny = 0xA5, "unbox.any", Token, Sequential, 1, 1;
    ConvU2 = 0xD1, "conv.u2", None, Sequential, 1, 1;
    ConvU1 = 0xD2, "conv.u1", None, Sequential, 1, 1;
    ConvI = 0xD3, "conv.i", None, Sequential, 1, 1;
    Ldtoken = 0xD0, "ldtoken", Token, Sequential, 0, 1;
    AddOvf = 0xD6, "add.ovf", None, Sequential, 2, 1;
    MulOvf = 0xD8, "mul.ovf", None, Sequential, 2, 1;
    SubOvf = 0xDA, "sub.ovf", None, Sequential, 2, 1;
    Endfinally = 0xDC, "endfinally", None, EndFinally, 0, 0;
    Leave = 0xDD, "leave", Int32, Leave, 0, 0;
    LeaveS = 0xDE, "leave.s", Int8, Leave, 0, 0;
    ConvU = 0xE0, "conv.u", None, Sequential, 1, 1;
    Ceq = 0xFE01, "ceq", None, Sequential, 2, 1;
    Cgt = 0xFE02, "cgt", None, Sequential, 2, 1;
    CgtUn = 0xFE03, "cgt.un", None, Sequential, 2, 1;
    Clt = 0xFE04, "clt", None, Sequential, 2, 1;
    CltUn = 0xFE05, "clt.un", None, Sequential, 2, 1;
    Ldftn = 0xFE06, "ldftn", Token, Sequential, 0, 1;
    Ldarg = 0xFE09, "ldarg", UInt16, Sequential, 0, 1;
    Starg = 0xFE0B, "starg", UInt16, Sequential, 1, 0;
    Ldloc = 0xFE0C, "ldloc", UInt16, Sequential, 0, 1;
    Stloc = 0xFE0E, "stloc", UInt16, Sequential, 1, 0;
    Endfilter = 0xFE11, "endfilter", None, EndFilter, 1, 0;
    Rethrow = 0xFE1A, "rethrow", None, Throw, 0, 0;
}

/// Groups of instructions that the pattern engine may treat as interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// `ldc.i4.m1` to `ldc.i4.8`, `ldc.i4.s`, `ldc.i4`
    LoadConstant,
    /// `ldloc.0` to `ldloc.3`, `ldloc.s`, `ldloc`
    LoadLocal,
    /// `stloc.0` to `stloc.3`, `stloc.s`, `stloc`
    StoreLocal,
    /// `ldarg.0` to `ldarg.3`, `ldarg.s`, `ldarg`
    LoadArgument,
}

impl Code {
    /// Returns the interchange family of this instruction, if any.
    #[must_use]
    pub const fn family(self) -> Option<Family> {
        match self {
            Code::LdcI4M1
            | Code::LdcI40
            | Code::LdcI41
            | Code::LdcI42
            | Code::LdcI43
            | Code::LdcI44
            | Code::LdcI45
            | Code::LdcI46
            | Code::LdcI47
            | Code::LdcI48
            | Code::LdcI4S
            | Code::LdcI4 => Some(Family::LoadConstant),
            Code::Ldloc0 | Code::Ldloc1 | Code::Ldloc2 | Code::Ldloc3 | Code::LdlocS | Code::Ldloc => {
                Some(Family::LoadLocal)
            }
            Code::Stloc0 | Code::Stloc1 | Code::Stloc2 | Code::Stloc3 | Code::StlocS | Code::Stloc => {
                Some(Family::StoreLocal)
            }
            Code::Ldarg0 | Code::Ldarg1 | Code::Ldarg2 | Code::Ldarg3 | Code::LdargS | Code::Ldarg => {
                Some(Family::LoadArgument)
            }
            _ => None,
        }
    }

    /// Returns the long-form equivalent of a short-form instruction, or the instruction itself.
    #[must_use]
    pub const fn long_form(self) -> Code {
        match self {
            Code::BrS => Code::Br,
            Code::BrfalseS => Code::Brfalse,
            Code::BrtrueS => Code::Brtrue,
            Code::BeqS => Code::Beq,
            Code::BgeS => Code::Bge,
            Code::BgtS => Code::Bgt,
            Code::BleS => Code::Ble,
            Code::BltS => Code::Blt,
            Code::BneUnS => Code::BneUn,
            Code::LeaveS => Code::Leave,
            Code::LdlocS => Code::Ldloc,
            Code::StlocS => Code::Stloc,
            Code::LdargS => Code::Ldarg,
            Code::StargS => Code::Starg,
            Code::LdcI4S => Code::LdcI4,
            other => other,
        }
    }

    /// Encoded size of the opcode itself, without its operand.
    #[must_use]
    pub const fn opcode_size(self) -> u32 {
        if self.value() > 0xFF {
            2
        } else {
            1
        }
    }

    /// Returns `true` for instructions that pop two values and push one result.
    #[must_use]
    pub const fn is_binary_operator(self) -> bool {
        matches!(
            self,
            Code::Add
                | Code::Sub
                | Code::Mul
                | Code::Div
                | Code::DivUn
                | Code::Rem
                | Code::RemUn
                | Code::And
                | Code::Or
                | Code::Xor
                | Code::Shl
                | Code::Shr
                | Code::ShrUn
                | Code::AddOvf
                | Code::SubOvf
                | Code::MulOvf
                | Code::Ceq
                | Code::Cgt
                | Code::CgtUn
                | Code::Clt
                | Code::CltUn
        )
    }

    /// Returns `true` for instructions that transform the top of stack in place.
    #[must_use]
    pub const fn is_unary_operator(self) -> bool {
        matches!(
            self,
            Code::Neg
                | Code::Not
                | Code::ConvI1
                | Code::ConvI2
                | Code::ConvI4
                | Code::ConvI8
                | Code::ConvR4
                | Code::ConvR8
                | Code::ConvU4
                | Code::ConvU8
                | Code::ConvRUn
                | Code::ConvU2
                | Code::ConvU1
                | Code::ConvI
                | Code::ConvU
        )
    }

    /// Returns `true` for `brtrue`/`brfalse` in either form.
    #[must_use]
    pub const fn is_boolean_branch(self) -> bool {
        matches!(
            self,
            Code::Brtrue | Code::BrtrueS | Code::Brfalse | Code::BrfalseS
        )
    }

    /// Returns `true` for the two-operand comparison branches in either form.
    #[must_use]
    pub const fn is_compare_branch(self) -> bool {
        matches!(self.flow(), FlowType::ConditionalBranch) && !self.is_boolean_branch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    #[test]
    fn values_are_unique_and_roundtrip() {
        let mut seen = HashSet::new();
        for code in Code::iter() {
            assert!(seen.insert(code.value()), "duplicate value for {code:?}");
            assert_eq!(Code::from_value(code.value()), Some(code));
        }
        assert_eq!(seen.len(), Code::COUNT);
    }

    #[test]
    fn long_forms_are_long() {
        for code in Code::iter() {
            let long = code.long_form();
            assert_ne!(long.operand_type(), OperandType::Int8, "{code:?}");
            assert_eq!(long.flow(), code.flow());
        }
        assert_eq!(Code::LdcI4S.long_form(), Code::LdcI4);
        assert_eq!(Code::LdlocS.long_form(), Code::Ldloc);
    }

    #[test]
    fn families() {
        assert_eq!(Code::LdcI45.family(), Some(Family::LoadConstant));
        assert_eq!(Code::Ldloc.family(), Some(Family::LoadLocal));
        assert_eq!(Code::Stloc2.family(), Some(Family::StoreLocal));
        assert_eq!(Code::Ldarg0.family(), Some(Family::LoadArgument));
        assert_eq!(Code::Add.family(), None);
    }

    #[test]
    fn classification() {
        assert!(Code::Xor.is_binary_operator());
        assert!(Code::Clt.is_binary_operator());
        assert!(!Code::Neg.is_binary_operator());
        assert!(Code::ConvU1.is_unary_operator());
        assert!(Code::BltS.is_compare_branch());
        assert!(!Code::Brtrue.is_compare_branch());
        assert!(Code::BrfalseS.is_boolean_branch());
        assert_eq!(Code::Ceq.opcode_size(), 2);
        assert_eq!(Code::Call.stack_effect(), None);
        assert_eq!(Code::Stfld.stack_effect(), Some((2, 0)));
    }
}
