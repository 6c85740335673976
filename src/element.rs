use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::error::{CacheError, Result};

/// Element type tag persisted alongside every stored stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }
}

/// Plain-old-data scalar that can be stored in a chunk stream
pub trait Element: bytemuck::Pod + Default + Debug + Send + Sync + 'static {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: DType = DType::$tag;
        })*
    };
}

impl_element! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

/// Native-endian bytes of a contiguous element slice
pub fn to_bytes<T: Element>(values: &[T]) -> &[u8] {
    bytemuck::cast_slice(values)
}

/// Copy raw bytes back into an owned element vector.
///
/// The copy avoids alignment requirements on `bytes`.
pub fn from_bytes<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    let size = T::DTYPE.size();
    if bytes.len() % size != 0 {
        return Err(CacheError::Serialization(format!(
            "{} bytes is not a multiple of the {:?} element size",
            bytes.len(),
            T::DTYPE
        )));
    }
    let mut values = vec![T::zeroed(); bytes.len() / size];
    bytemuck::cast_slice_mut::<T, u8>(&mut values).copy_from_slice(bytes);
    Ok(values)
}
