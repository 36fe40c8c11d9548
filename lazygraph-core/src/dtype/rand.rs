use ::rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

#[cfg(feature = "half")]
use half::f16;

use crate::Result;

/// Dispatch random fills based on the data type.
pub trait RandDispatch {
    /// Fill the slice with uniform random values in `[low, high)`.
    fn fill_with_uniform<R: Rng>(rng: &mut R, slice: &mut [Self], low: f64, high: f64) -> Result<()>
    where
        Self: Sized;

    /// Fill the slice with normal (Gaussian) random values.
    fn fill_with_normal<R: Rng>(rng: &mut R, slice: &mut [Self], mean: f64, std: f64) -> Result<()>
    where
        Self: Sized;
}

fn uniform(low: f64, high: f64) -> Result<Uniform<f64>> {
    if low.partial_cmp(&high) != Some(std::cmp::Ordering::Less) {
        crate::bail!("uniform range is empty: [{low}, {high})");
    }
    Ok(Uniform::new(low, high))
}

fn normal(mean: f64, std: f64) -> Result<Normal<f64>> {
    Normal::new(mean, std).map_err(|e| crate::Error::Msg(format!("invalid normal distribution: {e}")))
}

macro_rules! rand_float {
    ($rt:ident, $from:expr) => {
        impl RandDispatch for $rt {
            fn fill_with_uniform<R: Rng>(
                rng: &mut R,
                slice: &mut [Self],
                low: f64,
                high: f64,
            ) -> Result<()> {
                let dist = uniform(low, high)?;
                for x in slice.iter_mut() {
                    *x = $from(dist.sample(rng));
                }
                Ok(())
            }
            fn fill_with_normal<R: Rng>(
                rng: &mut R,
                slice: &mut [Self],
                mean: f64,
                std: f64,
            ) -> Result<()> {
                let dist = normal(mean, std)?;
                for x in slice.iter_mut() {
                    *x = $from(dist.sample(rng));
                }
                Ok(())
            }
        }
    };
}

// Integers: uniform only, values are floored.
macro_rules! rand_integral {
    ($rt:ident) => {
        impl RandDispatch for $rt {
            fn fill_with_uniform<R: Rng>(
                rng: &mut R,
                slice: &mut [Self],
                low: f64,
                high: f64,
            ) -> Result<()> {
                let dist = uniform(low, high)?;
                for x in slice.iter_mut() {
                    *x = dist.sample(rng).floor() as $rt;
                }
                Ok(())
            }
            fn fill_with_normal<R: Rng>(
                _rng: &mut R,
                _slice: &mut [Self],
                _mean: f64,
                _std: f64,
            ) -> Result<()> {
                crate::bail!(
                    "Normal random fill is not supported for dtype {}",
                    stringify!($rt)
                )
            }
        }
    };
}

rand_float!(f32, |v: f64| v as f32);
rand_float!(f64, |v: f64| v);
#[cfg(feature = "half")]
rand_float!(f16, f16::from_f64);

rand_integral!(u8);
rand_integral!(i8);
rand_integral!(i32);
rand_integral!(i64);
