use std::{
    fmt::{Debug, Display},
    ops::{Add, Div, Mul, Sub},
};

#[cfg(feature = "half")]
use half::f16;
use serde::{Deserialize, Serialize};

pub use self::gemm::{GemmDispatch, MatShape};
pub use self::rand::RandDispatch;

mod gemm;
mod rand;

/// Element type of a tensor as recorded in its descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    U8,
    I8,
    I32,
    I64,
    F16,
    #[default]
    F32,
    F64,
}

impl ElementType {
    /// Width of one element in bytes.
    pub const fn bytes(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::F16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F16 | Self::F32 | Self::F64)
    }
}

impl Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Type which can be square-rooted.
/// If self<0 and Self is integral, then te output is 0
pub trait Sqrtable {
    fn sqrt(&self) -> Self
    where
        Self: Sized;
}

impl Sqrtable for f32 {
    fn sqrt(&self) -> Self
    where
        Self: Sized,
    {
        f32::sqrt(*self)
    }
}

impl Sqrtable for f64 {
    fn sqrt(&self) -> Self
    where
        Self: Sized,
    {
        f64::sqrt(*self)
    }
}

#[cfg(feature = "half")]
impl Sqrtable for f16 {
    fn sqrt(&self) -> Self
    where
        Self: Sized,
    {
        f16::from_f64_const(self.to_f64_const().sqrt())
    }
}

macro_rules! sqrt_integral {
    ($t:ty) => {
        impl Sqrtable for $t {
            fn sqrt(&self) -> Self
            where
                Self: Sized,
            {
                (*self as f64).max(0.0).sqrt() as $t
            }
        }
    };
}

sqrt_integral!(u8);
sqrt_integral!(i8);
sqrt_integral!(i32);
sqrt_integral!(i64);

pub trait DTypeOps:
    Copy
    + Add<Output = Self>
    + Div<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Sqrtable
    + GemmDispatch
    + RandDispatch
{
}

pub trait MaybeNeg {
    /// Negation; unsigned types wrap around.
    fn maybe_neg(self) -> Self;
}

macro_rules! maybe_neg_wrapping {
    ($rt:ident) => {
        impl MaybeNeg for $rt {
            fn maybe_neg(self) -> Self {
                self.wrapping_neg()
            }
        }
    };
}

macro_rules! maybe_neg {
    ($rt:ident) => {
        impl MaybeNeg for $rt {
            fn maybe_neg(self) -> Self {
                -self
            }
        }
    };
}

maybe_neg_wrapping!(u8);
maybe_neg!(i8);
maybe_neg!(i32);
maybe_neg!(i64);
maybe_neg!(f32);
maybe_neg!(f64);

/// Marker trait for host element types. Maps a Rust scalar onto its
/// [`ElementType`] and its native-endian byte representation.
pub trait DType:
    Debug + Clone + PartialEq + PartialOrd + DTypeOps + Send + Sync + MaybeNeg + 'static
{
    const ZERO: Self;
    const ONE: Self;
    const NAME: &'static str;
    const ELEMENT: ElementType;
    const INTEGRAL: bool;

    fn to_f64(&self) -> f64;
    fn from_f64(x: f64) -> Self;

    /// Decode one element. `bytes` holds exactly `ELEMENT.bytes()` bytes.
    fn from_ne_slice(bytes: &[u8]) -> Self;

    /// Encode one element into `out`, which holds exactly `ELEMENT.bytes()` bytes.
    fn write_ne(self, out: &mut [u8]);
}

macro_rules! dtype {
    ($rt:ident, $zero:expr, $one:expr, $element:ident, $integral:expr) => {
        impl DTypeOps for $rt {}
        impl DType for $rt {
            const ZERO: $rt = $zero;
            const ONE: $rt = $one;
            const NAME: &'static str = stringify!($rt);
            const ELEMENT: ElementType = ElementType::$element;
            const INTEGRAL: bool = $integral;

            fn to_f64(&self) -> f64 {
                *self as f64
            }
            fn from_f64(x: f64) -> Self {
                x as $rt
            }
            fn from_ne_slice(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$rt>()];
                raw.copy_from_slice(bytes);
                $rt::from_ne_bytes(raw)
            }
            fn write_ne(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_ne_bytes());
            }
        }
    };
}

dtype!(u8, 0u8, 1u8, U8, true);
dtype!(i8, 0i8, 1i8, I8, true);
dtype!(i32, 0i32, 1i32, I32, true);
dtype!(i64, 0i64, 1i64, I64, true);
dtype!(f32, 0f32, 1f32, F32, false);
dtype!(f64, 0f64, 1f64, F64, false);

#[cfg(feature = "half")]
impl DTypeOps for f16 {}
#[cfg(feature = "half")]
maybe_neg!(f16);
#[cfg(feature = "half")]
impl DType for f16 {
    const ZERO: f16 = f16::from_f64_const(0.0);
    const ONE: f16 = f16::from_f64_const(1.0);
    const NAME: &'static str = "f16";
    const ELEMENT: ElementType = ElementType::F16;
    const INTEGRAL: bool = false;

    fn to_f64(&self) -> f64 {
        self.to_f64_const()
    }
    fn from_f64(x: f64) -> Self {
        Self::from_f64_const(x)
    }
    fn from_ne_slice(bytes: &[u8]) -> Self {
        f16::from_ne_bytes([bytes[0], bytes[1]])
    }
    fn write_ne(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_ne_bytes());
    }
}

/// Decode a native-endian byte buffer into typed elements. Trailing bytes
/// that do not form a whole element are ignored.
pub fn bytes_to_vec<T: DType>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::ELEMENT.bytes())
        .map(T::from_ne_slice)
        .collect()
}

/// Encode typed elements into a native-endian byte buffer.
pub fn vec_to_bytes<T: DType>(values: &[T]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * T::ELEMENT.bytes()];
    write_slice(values, &mut out);
    out
}

pub(crate) fn write_slice<T: DType>(values: &[T], out: &mut [u8]) {
    for (v, chunk) in values
        .iter()
        .zip(out.chunks_exact_mut(T::ELEMENT.bytes()))
    {
        v.write_ne(chunk);
    }
}
