//! Constant and specialization constant representations, grounded in
//! `spirq_core::constant::ConstantValue` (bit-pattern scalar dedup via
//! `ordered_float::OrderedFloat` and `half::f16`).
use half::f16;
use ordered_float::OrderedFloat;

use crate::ir::Id;

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum ScalarValue {
    Bool(bool),
    S8(i8),
    S16(i16),
    S32(i32),
    S64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F16(OrderedFloat<f16>),
    F32(OrderedFloat<f32>),
    F64(OrderedFloat<f64>),
}
impl From<bool> for ScalarValue {
    fn from(x: bool) -> Self {
        ScalarValue::Bool(x)
    }
}
impl From<i32> for ScalarValue {
    fn from(x: i32) -> Self {
        ScalarValue::S32(x)
    }
}
impl From<u32> for ScalarValue {
    fn from(x: u32) -> Self {
        ScalarValue::U32(x)
    }
}
impl From<f32> for ScalarValue {
    fn from(x: f32) -> Self {
        ScalarValue::F32(OrderedFloat(x))
    }
}
impl ScalarValue {
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ScalarValue::F32(x) => Some((*x).into()),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::S8(x) => Some(*x as i64),
            ScalarValue::S16(x) => Some(*x as i64),
            ScalarValue::S32(x) => Some(*x as i64),
            ScalarValue::S64(x) => Some(*x),
            ScalarValue::U8(x) => Some(*x as i64),
            ScalarValue::U16(x) => Some(*x as i64),
            ScalarValue::U32(x) => Some(*x as i64),
            ScalarValue::U64(x) => Some(*x as i64),
            _ => None,
        }
    }
}

/// The structural key used to deduplicate scalar constants: (type id, raw
/// bit pattern). −0.0 and +0.0 hash and compare unequal because
/// `OrderedFloat` compares bit patterns, and NaN payloads are preserved
/// rather than canonicalized.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub(crate) struct ScalarKey {
    pub ty: Id,
    pub value: ScalarValue,
}

#[derive(Clone, Debug)]
pub enum ConstantKind {
    Scalar(ScalarValue),
    Composite(Vec<Id>),
    Null,
}

#[derive(Clone, Debug)]
pub struct Constant {
    pub ty: Id,
    pub kind: ConstantKind,
    /// `Some` iff this is a specialization constant.
    pub spec_id: Option<u32>,
}
impl Constant {
    pub fn is_specialization(&self) -> bool {
        self.spec_id.is_some()
    }
}
