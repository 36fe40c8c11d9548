use rayon::{
    iter::{IndexedParallelIterator, IntoParallelRefMutIterator, ParallelIterator},
    ThreadPool,
};

use super::pool::BufferPool;
use crate::{
    dtype::{bytes_to_vec, write_slice, MatShape},
    op::{normalize_axes, BinaryOpType, ReduceType, UnaryOpType},
    DType, Descriptor, ElementType, HostTensor, Op, Result,
};

/// Runs `$body` with `$t` aliased to the Rust scalar type of `$dtype`.
macro_rules! dispatch {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            ElementType::U8 => {
                type $t = u8;
                $body
            }
            ElementType::I8 => {
                type $t = i8;
                $body
            }
            ElementType::I32 => {
                type $t = i32;
                $body
            }
            ElementType::I64 => {
                type $t = i64;
                $body
            }
            ElementType::F32 => {
                type $t = f32;
                $body
            }
            ElementType::F64 => {
                type $t = f64;
                $body
            }
            #[cfg(feature = "half")]
            ElementType::F16 => {
                type $t = half::f16;
                $body
            }
            #[cfg(not(feature = "half"))]
            ElementType::F16 => crate::bail!("f16 tensors need the `half` feature"),
        }
    };
}

/// Everything a kernel needs besides its operands.
pub(crate) struct KernelCtx<'a> {
    pub pool: &'a mut BufferPool,
    pub threads: &'a ThreadPool,
    pub num_threads: usize,
}

impl KernelCtx<'_> {
    fn emit<T: DType>(&mut self, desc: &Descriptor, values: &[T]) -> HostTensor {
        let mut data = self.pool.get_buffer(desc.byte_size());
        write_slice(values, &mut data);
        HostTensor::new(desc.clone(), data)
    }
}

fn decode<T: DType>(t: &HostTensor) -> Result<Vec<T>> {
    if t.data.len() < t.desc.byte_size() {
        crate::bail!(
            "operand holds {} bytes, descriptor needs {}",
            t.data.len(),
            t.desc.byte_size()
        );
    }
    let mut v = bytes_to_vec::<T>(&t.data);
    v.truncate(t.desc.size);
    Ok(v)
}

pub(crate) fn run(
    op: &Op,
    inputs: &[&HostTensor],
    outputs: &[Descriptor],
    ctx: &mut KernelCtx<'_>,
) -> Result<Vec<HostTensor>> {
    match op {
        Op::Binary(operator) => {
            let out = &outputs[0];
            dispatch!(out.dtype, T => Ok(vec![binary::<T>(*operator, inputs[0], inputs[1], out, ctx)?]))
        }
        Op::Unary(operator) => {
            let out = &outputs[0];
            dispatch!(out.dtype, T => Ok(vec![unary::<T>(*operator, inputs[0], out, ctx)?]))
        }
        Op::Reduce {
            kind,
            dims,
            keep_dims: _,
        } => {
            let out = &outputs[0];
            dispatch!(out.dtype, T => Ok(vec![reduce::<T>(*kind, dims, inputs[0], out, ctx)?]))
        }
        Op::Reshape => {
            let out = &outputs[0];
            let src = inputs[0];
            let bytes = out.byte_size();
            if src.data.len() < bytes {
                crate::bail!("reshape source holds {} bytes, needs {bytes}", src.data.len());
            }
            let mut data = ctx.pool.get_buffer(bytes);
            data.copy_from_slice(&src.data[..bytes]);
            Ok(vec![HostTensor::new(out.clone(), data)])
        }
        Op::Shape => {
            let dims = inputs[0].desc.dims.clone();
            Ok(vec![ctx.emit::<i32>(&outputs[0], &dims)])
        }
        Op::MatMul => {
            let out = &outputs[0];
            dispatch!(out.dtype, T => Ok(vec![matmul::<T>(inputs[0], inputs[1], out, ctx)?]))
        }
        Op::Split { axis, .. } => split(*axis, inputs[0], outputs, ctx),
    }
}

/// Rough operation count used by the profiler.
pub(crate) fn flops(op: &Op, inputs: &[&HostTensor], outputs: &[Descriptor]) -> f32 {
    match op {
        Op::Binary(_) | Op::Unary(_) => outputs[0].size as f32,
        Op::Reduce { .. } => inputs[0].desc.size as f32,
        Op::MatMul => {
            let a = &inputs[0].desc.dims;
            let k = a.last().copied().unwrap_or(0) as f32;
            2.0 * outputs[0].size as f32 * k
        }
        Op::Reshape | Op::Shape | Op::Split { .. } => 0.0,
    }
}

fn binary<T: DType>(
    operator: BinaryOpType,
    a: &HostTensor,
    b: &HostTensor,
    out: &Descriptor,
    ctx: &mut KernelCtx<'_>,
) -> Result<HostTensor> {
    let a = decode::<T>(a)?;
    let b = decode::<T>(b)?;
    let (sa, sb) = (a.len() != 1, b.len() != 1);
    if (sa && a.len() < out.size) || (sb && b.len() < out.size) {
        crate::bail!(
            "{operator:?} operands of {} and {} elements cannot fill {}",
            a.len(),
            b.len(),
            out.size
        );
    }
    let f = operator.as_closure::<T>();
    let mut res = vec![T::ZERO; out.size];
    ctx.threads.install(|| {
        res.par_iter_mut().enumerate().for_each(|(i, o)| {
            let x = a[if sa { i } else { 0 }];
            let y = b[if sb { i } else { 0 }];
            *o = f(x, y);
        })
    });
    Ok(ctx.emit(out, &res))
}

fn unary<T: DType>(
    operator: UnaryOpType,
    src: &HostTensor,
    out: &Descriptor,
    ctx: &mut KernelCtx<'_>,
) -> Result<HostTensor> {
    let mut res = decode::<T>(src)?;
    if res.len() != out.size {
        crate::bail!("{operator:?} operand of {} elements, output needs {}", res.len(), out.size);
    }
    let f = operator.to_closure::<T>();
    ctx.threads
        .install(|| res.par_iter_mut().for_each(|x| *x = f(*x)));
    Ok(ctx.emit(out, &res))
}

fn reduce<T: DType>(
    kind: ReduceType,
    dims: &[i32],
    src: &HostTensor,
    out: &Descriptor,
    ctx: &mut KernelCtx<'_>,
) -> Result<HostTensor> {
    let values = decode::<T>(src)?;
    let shape = &src.desc.dims;
    let axes = normalize_axes(dims, shape.len()).map_err(crate::Error::Msg)?;

    // Output stride of every input axis, 0 for reduced ones.
    let mut out_strides = vec![0usize; shape.len()];
    let mut stride = 1usize;
    for axis in (0..shape.len()).rev() {
        if !axes.contains(&axis) {
            out_strides[axis] = stride;
            stride *= shape[axis] as usize;
        }
    }

    let mut acc = vec![T::ZERO; out.size];
    for (flat, v) in values.iter().enumerate() {
        let mut rem = flat;
        let mut dst = 0;
        for axis in (0..shape.len()).rev() {
            let extent = shape[axis] as usize;
            dst += (rem % extent) * out_strides[axis];
            rem /= extent;
        }
        acc[dst] = acc[dst] + *v;
    }

    if kind == ReduceType::Mean && out.size > 0 {
        let count = T::from_f64((values.len() / out.size) as f64);
        for x in acc.iter_mut() {
            *x = *x / count;
        }
    }
    Ok(ctx.emit(out, &acc))
}

fn matmul<T: DType>(
    a: &HostTensor,
    b: &HostTensor,
    out: &Descriptor,
    ctx: &mut KernelCtx<'_>,
) -> Result<HostTensor> {
    let (batch, m, k) = match a.desc.dims.as_slice() {
        [m, k] => (1, *m as usize, *k as usize),
        [bs, m, k] => (*bs as usize, *m as usize, *k as usize),
        other => crate::bail!("matmul operand of rank {}", other.len()),
    };
    let n = *b.desc.dims.last().unwrap_or(&0) as usize;
    let lhs = decode::<T>(a)?;
    let rhs = decode::<T>(b)?;
    let mut res = vec![T::ZERO; out.size];
    if lhs.len() < batch * m * k || rhs.len() < batch * k * n || out.size < batch * m * n {
        crate::bail!("matmul operands do not cover [{batch}, {m}, {k}] x [{k}, {n}]");
    }
    let shape = MatShape { batch, m, k, n };
    let threads = ctx.num_threads;
    ctx.threads
        .install(|| T::matmul_into(&lhs, &rhs, &mut res, shape, threads));
    Ok(ctx.emit(out, &res))
}

fn split(
    axis: i32,
    src: &HostTensor,
    outputs: &[Descriptor],
    ctx: &mut KernelCtx<'_>,
) -> Result<Vec<HostTensor>> {
    let shape = &src.desc.dims;
    let axis = normalize_axes(&[axis], shape.len()).map_err(crate::Error::Msg)?[0];
    if src.data.len() < src.desc.byte_size() {
        crate::bail!("split source is shorter than its descriptor");
    }
    let outer: usize = shape[..axis].iter().map(|d| *d as usize).product();
    let inner: usize = shape[axis + 1..].iter().map(|d| *d as usize).product::<usize>()
        * src.desc.dtype.bytes();
    let part_extent = outputs.first().map(|d| d.dims[axis] as usize).unwrap_or(0);
    let chunk = part_extent * inner;
    let row = chunk * outputs.len();

    let mut result = Vec::with_capacity(outputs.len());
    for (p, desc) in outputs.iter().enumerate() {
        let mut data = ctx.pool.get_buffer(desc.byte_size());
        for o in 0..outer {
            let from = o * row + p * chunk;
            data[o * chunk..(o + 1) * chunk].copy_from_slice(&src.data[from..from + chunk]);
        }
        result.push(HostTensor::new(desc.clone(), data));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use rayon::ThreadPoolBuilder;

    use super::*;
    use crate::dtype::vec_to_bytes;

    fn tensor(values: &[f32]) -> HostTensor {
        HostTensor::new(
            Descriptor::of(&[values.len() as i32], ElementType::F32),
            vec_to_bytes(values),
        )
    }

    #[test]
    fn short_operands_are_rejected() {
        let mut pool = BufferPool::new();
        let threads = ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let mut ctx = KernelCtx {
            pool: &mut pool,
            threads: &threads,
            num_threads: 1,
        };
        let out = Descriptor::of(&[4], ElementType::F32);
        let (a, b) = (tensor(&[1.0, 2.0]), tensor(&[1.0, 2.0, 3.0, 4.0]));

        let add = Op::Binary(BinaryOpType::Add);
        assert!(run(&add, &[&a, &b], &[out.clone()], &mut ctx).is_err());
        let neg = Op::Unary(UnaryOpType::Neg);
        assert!(run(&neg, &[&a], &[out.clone()], &mut ctx).is_err());

        let one = tensor(&[1.0]);
        let sum = run(&add, &[&one, &b], &[out], &mut ctx).unwrap();
        assert_eq!(sum[0].to_vec::<f32>(), vec![2.0, 3.0, 4.0, 5.0]);
    }
}
