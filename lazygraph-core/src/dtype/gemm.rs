use ::gemm::{gemm, Parallelism};

#[cfg(feature = "half")]
use half::f16;

use super::DType;

/// Extents of a batched product `[batch, m, k] x [batch, k, n]`. Operands and
/// output are dense and row-major.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatShape {
    pub batch: usize,
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

impl MatShape {
    fn fits(&self, lhs: usize, rhs: usize, out: usize) -> bool {
        let b = self.batch;
        lhs >= b * self.m * self.k && rhs >= b * self.k * self.n && out >= b * self.m * self.n
    }
}

/// Host matrix product, overwriting `out`.
pub trait GemmDispatch: Sized {
    fn matmul_into(lhs: &[Self], rhs: &[Self], out: &mut [Self], shape: MatShape, threads: usize);
}

fn matmul_naive<T: DType>(lhs: &[T], rhs: &[T], out: &mut [T], s: MatShape) {
    if !s.fits(lhs.len(), rhs.len(), out.len()) {
        return;
    }
    for b in 0..s.batch {
        let a = &lhs[b * s.m * s.k..];
        let w = &rhs[b * s.k * s.n..];
        let dst = &mut out[b * s.m * s.n..];
        for i in 0..s.m {
            for j in 0..s.n {
                let mut acc = T::ZERO;
                for p in 0..s.k {
                    acc = acc + a[i * s.k + p] * w[p * s.n + j];
                }
                dst[i * s.n + j] = acc;
            }
        }
    }
}

macro_rules! naive_gemm {
    ($($t:ty),*) => {$(
        impl GemmDispatch for $t {
            fn matmul_into(lhs: &[Self], rhs: &[Self], out: &mut [Self], shape: MatShape, _threads: usize) {
                matmul_naive(lhs, rhs, out, shape)
            }
        }
    )*};
}

macro_rules! blas_gemm {
    ($($t:ty),*) => {$(
        impl GemmDispatch for $t {
            fn matmul_into(lhs: &[Self], rhs: &[Self], out: &mut [Self], s: MatShape, threads: usize) {
                if !s.fits(lhs.len(), rhs.len(), out.len()) {
                    return;
                }
                let parallelism = if threads > 1 {
                    Parallelism::Rayon(threads)
                } else {
                    Parallelism::None
                };
                for b in 0..s.batch {
                    let a = &lhs[b * s.m * s.k..];
                    let w = &rhs[b * s.k * s.n..];
                    let dst = &mut out[b * s.m * s.n..];
                    // SAFETY: `fits` guarantees each batch slice holds m*k, k*n
                    // and m*n elements laid out with the strides below.
                    unsafe {
                        gemm(
                            s.m,
                            s.n,
                            s.k,
                            dst.as_mut_ptr(),
                            1,
                            s.n as isize,
                            false,
                            a.as_ptr(),
                            1,
                            s.k as isize,
                            w.as_ptr(),
                            1,
                            s.n as isize,
                            0 as $t,
                            1 as $t,
                            false,
                            false,
                            false,
                            parallelism,
                        )
                    }
                }
            }
        }
    )*};
}

naive_gemm!(u8, i8, i32, i64);
blas_gemm!(f32, f64);
// f16 goes through the naive loop to stay clear of half-precision SIMD paths.
#[cfg(feature = "half")]
naive_gemm!(f16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_and_integer_paths_agree() {
        let shape = MatShape {
            batch: 2,
            m: 2,
            k: 3,
            n: 1,
        };
        let lhs = [1, 2, 3, 4, 5, 6, 1, 0, 0, 0, 1, 0];
        let rhs = [1, 1, 1, 2, 3, 4];
        let mut out = [0i32; 4];
        i32::matmul_into(&lhs, &rhs, &mut out, shape, 1);
        assert_eq!(out, [6, 15, 2, 3]);

        let lhs: Vec<f32> = lhs.iter().map(|v| *v as f32).collect();
        let rhs: Vec<f32> = rhs.iter().map(|v| *v as f32).collect();
        let mut out = [9.0f32; 4];
        f32::matmul_into(&lhs, &rhs, &mut out, shape, 1);
        assert_eq!(out, [6.0, 15.0, 2.0, 3.0]);
    }
}
