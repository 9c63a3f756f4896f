use std::fmt;

use crate::error::{PmError, PM_ERR_CONV, PM_ERR_TYPE};

/// Value stored in place, 32-bit types only
pub const PM_VAL_INSITU: i32 = 0;
/// Value held in a dynamically allocated value block
pub const PM_VAL_DPTR: i32 = 1;
/// Value held in a statically allocated value block
pub const PM_VAL_SPTR: i32 = 2;

/// Numeric encodings a metric descriptor can declare.
///
/// The discriminants are the daemon's type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ValueType {
    I32 = 0,
    U32 = 1,
    I64 = 2,
    U64 = 3,
    Float = 4,
    Double = 5,
}

impl ValueType {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Width in bytes of the encoded value
    pub fn width(self) -> usize {
        match self {
            ValueType::I32 | ValueType::U32 | ValueType::Float => 4,
            ValueType::I64 | ValueType::U64 | ValueType::Double => 8,
        }
    }

    /// Decodes a raw value according to this type.
    ///
    /// Only the 32-bit integer types may be stored in place; everything else
    /// must come in a value block of exactly [`width`](Self::width) bytes in
    /// native byte order.
    pub fn decode(self, raw: &RawValue) -> Result<Atom, PmError> {
        match (self, raw) {
            (ValueType::I32, RawValue::Insitu(v)) => Ok(Atom::I32(*v)),
            (ValueType::U32, RawValue::Insitu(v)) => Ok(Atom::U32(*v as u32)),
            (_, RawValue::Insitu(_)) => Err(PmError::new(PM_ERR_CONV)),
            (_, RawValue::Block(bytes)) => {
                if bytes.len() != self.width() {
                    return Err(PmError::new(PM_ERR_CONV));
                }
                let atom = match self {
                    ValueType::I32 => Atom::I32(i32::from_ne_bytes(word(bytes))),
                    ValueType::U32 => Atom::U32(u32::from_ne_bytes(word(bytes))),
                    ValueType::Float => Atom::Float(f32::from_ne_bytes(word(bytes))),
                    ValueType::I64 => Atom::I64(i64::from_ne_bytes(dword(bytes))),
                    ValueType::U64 => Atom::U64(u64::from_ne_bytes(dword(bytes))),
                    ValueType::Double => Atom::Double(f64::from_ne_bytes(dword(bytes))),
                };
                Ok(atom)
            }
        }
    }
}

fn word(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    out
}

fn dword(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

impl TryFrom<i32> for ValueType {
    type Error = PmError;

    /// Strings, aggregates, events and unknown tags are rejected
    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ValueType::I32),
            1 => Ok(ValueType::U32),
            2 => Ok(ValueType::I64),
            3 => Ok(ValueType::U64),
            4 => Ok(ValueType::Float),
            5 => Ok(ValueType::Double),
            _ => Err(PmError::new(PM_ERR_TYPE)),
        }
    }
}

/// Raw value of one instance as delivered by a fetch
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Insitu(i32),
    Block(Vec<u8>),
}

impl RawValue {
    /// Value format tag matching this representation
    pub fn format(&self) -> i32 {
        match self {
            RawValue::Insitu(_) => PM_VAL_INSITU,
            RawValue::Block(_) => PM_VAL_DPTR,
        }
    }
}

/// A decoded scalar, tagged with the encoding it was decoded from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Atom {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Float(f32),
    Double(f64),
}

impl Atom {
    pub fn value_type(&self) -> ValueType {
        match self {
            Atom::I32(_) => ValueType::I32,
            Atom::U32(_) => ValueType::U32,
            Atom::I64(_) => ValueType::I64,
            Atom::U64(_) => ValueType::U64,
            Atom::Float(_) => ValueType::Float,
            Atom::Double(_) => ValueType::Double,
        }
    }

    /// Exact conversion to an unsigned counter.
    ///
    /// Fails for negative integers and for floating point values that are
    /// negative, fractional, not finite or beyond `u64::MAX`.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Atom::I32(v) => u64::try_from(v).ok(),
            Atom::U32(v) => Some(u64::from(v)),
            Atom::I64(v) => u64::try_from(v).ok(),
            Atom::U64(v) => Some(v),
            Atom::Float(v) => float_to_u64(f64::from(v)),
            Atom::Double(v) => float_to_u64(v),
        }
    }

    /// Conversion to a double; 64-bit integers beyond 2^53 lose precision
    pub fn as_f64(&self) -> f64 {
        match *self {
            Atom::I32(v) => f64::from(v),
            Atom::U32(v) => f64::from(v),
            Atom::I64(v) => v as f64,
            Atom::U64(v) => v as f64,
            Atom::Float(v) => f64::from(v),
            Atom::Double(v) => v,
        }
    }

    /// Raw form of this value, the way a daemon would ship it
    pub fn to_raw(&self) -> RawValue {
        match *self {
            Atom::I32(v) => RawValue::Insitu(v),
            Atom::U32(v) => RawValue::Insitu(v as i32),
            Atom::I64(v) => RawValue::Block(v.to_ne_bytes().to_vec()),
            Atom::U64(v) => RawValue::Block(v.to_ne_bytes().to_vec()),
            Atom::Float(v) => RawValue::Block(v.to_ne_bytes().to_vec()),
            Atom::Double(v) => RawValue::Block(v.to_ne_bytes().to_vec()),
        }
    }
}

fn float_to_u64(v: f64) -> Option<u64> {
    // 2^64 is exactly representable; anything at or above it overflows
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v < 18_446_744_073_709_551_616.0 {
        Some(v as u64)
    } else {
        None
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::I32(v) => write!(f, "{}", v),
            Atom::U32(v) => write!(f, "{}", v),
            Atom::I64(v) => write!(f, "{}", v),
            Atom::U64(v) => write!(f, "{}", v),
            Atom::Float(v) => write!(f, "{}", v),
            Atom::Double(v) => write!(f, "{}", v),
        }
    }
}
