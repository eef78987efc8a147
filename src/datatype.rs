//! Element types that can travel through the transport.
//!
//! [`MpiDatatype`] is sealed. Each implementor carries a [`DatatypeTag`], a
//! fixed byte width, a native-endian codec and the combiner used by the
//! built-in reductions. Payloads are plain bytes; receivers decode as many
//! whole elements as the payload holds.
//!
//! | Type  | Tag | Width |
//! |-------|-----|-------|
//! | `f32` | 0   | 4     |
//! | `f64` | 1   | 8     |
//! | `i32` | 2   | 4     |
//! | `i64` | 3   | 8     |
//! | `u8`  | 4   | 1     |
//! | `u32` | 5   | 4     |
//! | `u64` | 6   | 8     |

use crate::ReduceOp;

mod sealed {
    pub trait Sealed {}
}

/// Identifies the element type of a typed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DatatypeTag {
    #[allow(missing_docs)]
    F32 = 0,
    #[allow(missing_docs)]
    F64 = 1,
    #[allow(missing_docs)]
    I32 = 2,
    #[allow(missing_docs)]
    I64 = 3,
    /// Also the element type of raw byte messages.
    U8 = 4,
    #[allow(missing_docs)]
    U32 = 5,
    #[allow(missing_docs)]
    U64 = 6,
}

impl DatatypeTag {
    /// Width of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DatatypeTag::U8 => 1,
            DatatypeTag::F32 | DatatypeTag::I32 | DatatypeTag::U32 => 4,
            DatatypeTag::F64 | DatatypeTag::I64 | DatatypeTag::U64 => 8,
        }
    }
}

/// A primitive element type usable in point-to-point and collective calls.
///
/// Sealed; implemented for `f32`, `f64`, `i32`, `i64`, `u8`, `u32` and `u64`.
///
/// # Example
///
/// ```
/// use mpirt::{Config, Universe};
///
/// Universe::new(Config::default())
///     .run(2, |mpi| {
///         let world = mpi.world();
///
///         let mut weights = vec![0.5f64; 4];
///         world.broadcast(&mut weights, 0)?;
///
///         let mut ids = [world.rank() as u64; 2];
///         world.broadcast(&mut ids, 1)?;
///         assert_eq!(ids, [1, 1]);
///         Ok(())
///     })
///     .unwrap();
/// ```
pub trait MpiDatatype: sealed::Sealed + Copy + Default + PartialEq + std::fmt::Debug + Send + 'static {
    /// The datatype tag identifying this type.
    const TAG: DatatypeTag;

    /// Width of one element in bytes.
    const SIZE: usize;

    /// Append the native-endian encoding of `values` to `out`.
    fn encode(values: &[Self], out: &mut Vec<u8>);

    /// Decode as many whole elements as fit from `bytes` into `out`.
    ///
    /// Returns the number of elements written.
    fn decode(bytes: &[u8], out: &mut [Self]) -> usize;

    /// Combine two values with a built-in operator.
    fn combine(op: ReduceOp, a: Self, b: Self) -> Self;
}

/// Encode a slice into a fresh byte vector.
pub(crate) fn to_bytes<T: MpiDatatype>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::SIZE);
    T::encode(values, &mut out);
    out
}

/// Decode a byte payload into a fresh vector of whole elements.
pub(crate) fn from_bytes<T: MpiDatatype>(bytes: &[u8]) -> Vec<T> {
    let mut out = vec![T::default(); bytes.len() / T::SIZE];
    T::decode(bytes, &mut out);
    out
}

macro_rules! impl_mpi_datatype {
    (@codec $ty:ty) => {
        fn encode(values: &[Self], out: &mut Vec<u8>) {
            for v in values {
                out.extend_from_slice(&v.to_ne_bytes());
            }
        }

        fn decode(bytes: &[u8], out: &mut [Self]) -> usize {
            let mut written = 0;
            for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(Self::SIZE)) {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(chunk);
                *slot = <$ty>::from_ne_bytes(raw);
                written += 1;
            }
            written
        }
    };
    ($ty:ty, $tag:expr, int) => {
        impl sealed::Sealed for $ty {}
        impl MpiDatatype for $ty {
            const TAG: DatatypeTag = $tag;
            const SIZE: usize = std::mem::size_of::<$ty>();

            impl_mpi_datatype!(@codec $ty);

            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum => a.wrapping_add(b),
                    ReduceOp::Prod => a.wrapping_mul(b),
                    ReduceOp::Max => a.max(b),
                    ReduceOp::Min => a.min(b),
                }
            }
        }
    };
    ($ty:ty, $tag:expr, float) => {
        impl sealed::Sealed for $ty {}
        impl MpiDatatype for $ty {
            const TAG: DatatypeTag = $tag;
            const SIZE: usize = std::mem::size_of::<$ty>();

            impl_mpi_datatype!(@codec $ty);

            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum => a + b,
                    ReduceOp::Prod => a * b,
                    ReduceOp::Max => a.max(b),
                    ReduceOp::Min => a.min(b),
                }
            }
        }
    };
}

impl_mpi_datatype!(f32, DatatypeTag::F32, float);
impl_mpi_datatype!(f64, DatatypeTag::F64, float);
impl_mpi_datatype!(i32, DatatypeTag::I32, int);
impl_mpi_datatype!(i64, DatatypeTag::I64, int);
impl_mpi_datatype!(u8, DatatypeTag::U8, int);
impl_mpi_datatype!(u32, DatatypeTag::U32, int);
impl_mpi_datatype!(u64, DatatypeTag::U64, int);
