//! Values of the replay evaluation stack.

use std::{fmt, sync::Arc};

use crate::{assembly::Code, Error, Result};

/// A value on the replay evaluation stack or in a replay local.
///
/// Integers smaller than 32 bits are widened to [`EmValue::I32`] as on the CIL stack; both floating
/// point types are carried as [`EmValue::F64`].
#[derive(Clone, PartialEq)]
pub enum EmValue {
    /// 32-bit integer (also `bool`, `char`, `int8`/`uint8`, `int16`/`uint16`)
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// Floating point value
    F64(f64),
    /// A byte array
    Bytes(Arc<[u8]>),
    /// An object reference whose content is never inspected
    Object,
    /// Null reference
    Null,
}

impl EmValue {
    /// Integer value, sign-extended to 64 bits.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EmValue::I32(value) => Some(i64::from(*value)),
            EmValue::I64(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer value reinterpreted as unsigned, zero-extended from its own width.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            EmValue::I32(value) => Some(u64::from(*value as u32)),
            EmValue::I64(value) => Some(*value as u64),
            _ => None,
        }
    }

    /// Short type name for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            EmValue::I32(_) => "int32",
            EmValue::I64(_) => "int64",
            EmValue::F64(_) => "float",
            EmValue::Bytes(_) => "byte[]",
            EmValue::Object => "object",
            EmValue::Null => "null",
        }
    }

    fn mismatch(code: Code, left: &EmValue, right: &EmValue) -> Error {
        malformed_error!(
            "{} on incompatible operands {} and {}",
            code.mnemonic(),
            left.type_name(),
            right.type_name()
        )
    }

    /// Applies a two-operand arithmetic, bitwise or comparison instruction.
    ///
    /// Mixed `int32`/`int64` operands are promoted to `int64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] for non-numeric operands, division by zero or a checked overflow.
    pub fn binary(code: Code, left: &EmValue, right: &EmValue) -> Result<EmValue> {
        if let (EmValue::F64(a), EmValue::F64(b)) = (left, right) {
            return Self::binary_float(code, *a, *b).ok_or_else(|| Self::mismatch(code, left, right));
        }

        let wide = matches!(left, EmValue::I64(_)) || matches!(right, EmValue::I64(_));
        let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) else {
            return Err(Self::mismatch(code, left, right));
        };

        if wide {
            let (ua, ub) = (a as u64, b as u64);
            let value = match code {
                Code::Add => a.wrapping_add(b),
                Code::Sub => a.wrapping_sub(b),
                Code::Mul => a.wrapping_mul(b),
                Code::AddOvf => a.checked_add(b).ok_or_else(|| malformed_error!("add.ovf overflow"))?,
                Code::SubOvf => a.checked_sub(b).ok_or_else(|| malformed_error!("sub.ovf overflow"))?,
                Code::MulOvf => a.checked_mul(b).ok_or_else(|| malformed_error!("mul.ovf overflow"))?,
                Code::Div => a.checked_div(b).ok_or_else(|| malformed_error!("division by zero"))?,
                Code::Rem => a.checked_rem(b).ok_or_else(|| malformed_error!("division by zero"))?,
                Code::DivUn => ua.checked_div(ub).ok_or_else(|| malformed_error!("division by zero"))? as i64,
                Code::RemUn => ua.checked_rem(ub).ok_or_else(|| malformed_error!("division by zero"))? as i64,
                Code::And => a & b,
                Code::Or => a | b,
                Code::Xor => a ^ b,
                Code::Shl => a.wrapping_shl(b as u32),
                Code::Shr => a.wrapping_shr(b as u32),
                Code::ShrUn => ua.wrapping_shr(b as u32) as i64,
                Code::Ceq => return Ok(EmValue::I32(i32::from(a == b))),
                Code::Cgt => return Ok(EmValue::I32(i32::from(a > b))),
                Code::CgtUn => return Ok(EmValue::I32(i32::from(ua > ub))),
                Code::Clt => return Ok(EmValue::I32(i32::from(a < b))),
                Code::CltUn => return Ok(EmValue::I32(i32::from(ua < ub))),
                _ => return Err(Self::mismatch(code, left, right)),
            };
            return Ok(EmValue::I64(value));
        }

        let (a, b) = (a as i32, b as i32);
        let (ua, ub) = (a as u32, b as u32);
        let value = match code {
            Code::Add => a.wrapping_add(b),
            Code::Sub => a.wrapping_sub(b),
            Code::Mul => a.wrapping_mul(b),
            Code::AddOvf => a.checked_add(b).ok_or_else(|| malformed_error!("add.ovf overflow"))?,
            Code::SubOvf => a.checked_sub(b).ok_or_else(|| malformed_error!("sub.ovf overflow"))?,
            Code::MulOvf => a.checked_mul(b).ok_or_else(|| malformed_error!("mul.ovf overflow"))?,
            Code::Div => a.checked_div(b).ok_or_else(|| malformed_error!("division by zero"))?,
            Code::Rem => a.checked_rem(b).ok_or_else(|| malformed_error!("division by zero"))?,
            Code::DivUn => ua.checked_div(ub).ok_or_else(|| malformed_error!("division by zero"))? as i32,
            Code::RemUn => ua.checked_rem(ub).ok_or_else(|| malformed_error!("division by zero"))? as i32,
            Code::And => a & b,
            Code::Or => a | b,
            Code::Xor => a ^ b,
            Code::Shl => a.wrapping_shl(b as u32),
            Code::Shr => a.wrapping_shr(b as u32),
            Code::ShrUn => ua.wrapping_shr(b as u32) as i32,
            Code::Ceq => i32::from(a == b),
            Code::Cgt => i32::from(a > b),
            Code::CgtUn => i32::from(ua > ub),
            Code::Clt => i32::from(a < b),
            Code::CltUn => i32::from(ua < ub),
            _ => return Err(Self::mismatch(code, left, right)),
        };
        Ok(EmValue::I32(value))
    }

    fn binary_float(code: Code, a: f64, b: f64) -> Option<EmValue> {
        let value = match code {
            Code::Add => a + b,
            Code::Sub => a - b,
            Code::Mul => a * b,
            Code::Div => a / b,
            Code::Rem => a % b,
            Code::Ceq => return Some(EmValue::I32(i32::from(a == b))),
            Code::Cgt | Code::CgtUn => return Some(EmValue::I32(i32::from(a > b))),
            Code::Clt | Code::CltUn => return Some(EmValue::I32(i32::from(a < b))),
            _ => return None,
        };
        Some(EmValue::F64(value))
    }

    /// Applies a one-operand instruction: negation, complement or a conversion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the operand is not numeric.
    pub fn unary(code: Code, value: &EmValue) -> Result<EmValue> {
        if let EmValue::F64(f) = value {
            return Ok(match code {
                Code::Neg => EmValue::F64(-f),
                Code::ConvR4 | Code::ConvR8 | Code::ConvRUn => EmValue::F64(*f),
                Code::ConvI8 | Code::ConvU8 | Code::ConvI | Code::ConvU => EmValue::I64(*f as i64),
                _ => Self::convert_int(code, *f as i64)
                    .ok_or_else(|| Self::mismatch(code, value, value))?,
            });
        }

        let Some(int) = value.as_i64() else {
            return Err(Self::mismatch(code, value, value));
        };
        let wide = matches!(value, EmValue::I64(_));
        match code {
            Code::Neg if wide => Ok(EmValue::I64(int.wrapping_neg())),
            Code::Neg => Ok(EmValue::I32((int as i32).wrapping_neg())),
            Code::Not if wide => Ok(EmValue::I64(!int)),
            Code::Not => Ok(EmValue::I32(!(int as i32))),
            Code::ConvR4 | Code::ConvR8 => Ok(EmValue::F64(int as f64)),
            Code::ConvRUn => Ok(EmValue::F64(value.as_u64().unwrap_or_default() as f64)),
            Code::ConvU8 | Code::ConvU if !wide => Ok(EmValue::I64(i64::from(int as u32))),
            _ => Self::convert_int(code, int).ok_or_else(|| Self::mismatch(code, value, value)),
        }
    }

    fn convert_int(code: Code, int: i64) -> Option<EmValue> {
        Some(match code {
            Code::ConvI1 => EmValue::I32(i32::from(int as i8)),
            Code::ConvU1 => EmValue::I32(i32::from(int as u8)),
            Code::ConvI2 => EmValue::I32(i32::from(int as i16)),
            Code::ConvU2 => EmValue::I32(i32::from(int as u16)),
            Code::ConvI4 | Code::ConvU4 => EmValue::I32(int as i32),
            Code::ConvI8 | Code::ConvU8 | Code::ConvI | Code::ConvU => EmValue::I64(int),
            _ => return None,
        })
    }
}

impl fmt::Debug for EmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmValue::I32(value) => write!(f, "{value}"),
            EmValue::I64(value) => write!(f, "{value}L"),
            EmValue::F64(value) => write!(f, "{value}f"),
            EmValue::Bytes(bytes) => write!(f, "byte[{}]", bytes.len()),
            EmValue::Object => f.write_str("object"),
            EmValue::Null => f.write_str("null"),
        }
    }
}
