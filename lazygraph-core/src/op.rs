use serde::{Deserialize, Serialize};

use crate::{backend::InfoInput, DType, Descriptor, ElementType, Error, Result};

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum BinaryOpType {
    Add,
    Div,
    Sub,
    Mul,
}

impl BinaryOpType {
    /// Integer division by zero yields zero instead of trapping.
    pub fn as_closure<T: DType>(&self) -> impl Fn(T, T) -> T + Sync {
        match self {
            Self::Add => |x, y| x + y,
            Self::Div => |x: T, y: T| {
                if T::INTEGRAL && y == T::ZERO {
                    T::ZERO
                } else {
                    x / y
                }
            },
            Self::Sub => |x, y| x - y,
            Self::Mul => |x, y| x * y,
        }
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum UnaryOpType {
    Neg,
    Sqrt,
}

impl UnaryOpType {
    pub fn to_closure<T: DType>(&self) -> impl Fn(T) -> T + Sync {
        match self {
            Self::Neg => T::maybe_neg,
            Self::Sqrt => |x: T| x.sqrt(),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ReduceType {
    Sum,
    Mean,
}

/// Operator payload of a computed node.
///
/// The graph core treats this as opaque apart from [`Op::requirement`],
/// [`Op::output_count`] and the shape inference that backends delegate to.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Binary(BinaryOpType),
    Unary(UnaryOpType),
    /// Reduce over `dims`; an empty list reduces every axis.
    Reduce {
        kind: ReduceType,
        dims: Vec<i32>,
        keep_dims: bool,
    },
    /// Second input is an int32 tensor holding the target shape.
    Reshape,
    Shape,
    MatMul,
    Split {
        axis: i32,
        parts: usize,
    },
}

/// Per-input dependency table of one operator node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requirement {
    /// Output content needs this input's content (not only its shape).
    pub content_need_content: Vec<bool>,
    /// Output shape needs this input's content.
    pub shape_need_content: Vec<bool>,
}

impl Requirement {
    /// Requirement of a node with no operator.
    pub fn leaf() -> Self {
        Self::default()
    }
}

impl Op {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Binary(_) => "BinaryOp",
            Self::Unary(_) => "UnaryOp",
            Self::Reduce { .. } => "Reduction",
            Self::Reshape => "Reshape",
            Self::Shape => "Shape",
            Self::MatMul => "MatMul",
            Self::Split { .. } => "Split",
        }
    }

    pub fn output_count(&self) -> usize {
        match self {
            Self::Split { parts, .. } => *parts,
            _ => 1,
        }
    }

    pub fn input_count(&self) -> usize {
        match self {
            Self::Binary(_) | Self::Reshape | Self::MatMul => 2,
            Self::Unary(_) | Self::Reduce { .. } | Self::Shape | Self::Split { .. } => 1,
        }
    }

    pub fn requirement(&self, n_inputs: usize) -> Requirement {
        let mut req = Requirement {
            content_need_content: vec![true; n_inputs],
            shape_need_content: vec![false; n_inputs],
        };
        match self {
            Self::Reshape if n_inputs > 1 => {
                req.shape_need_content[1] = true;
                req.content_need_content[1] = false;
            }
            Self::Shape if n_inputs > 0 => {
                req.content_need_content[0] = false;
            }
            _ => {}
        }
        req
    }

    fn shape_err(&self, msg: impl std::fmt::Display) -> Error {
        Error::backend("shape", format!("{}: {msg}", self.kind_name()))
    }

    /// Shape inference from resolved input descriptors. Inputs whose content
    /// the shape depends on carry that content.
    pub fn infer(&self, inputs: &[InfoInput]) -> Result<Vec<Descriptor>> {
        if inputs.len() != self.input_count() {
            return Err(self.shape_err(format!(
                "expected {} inputs, got {}",
                self.input_count(),
                inputs.len()
            )));
        }
        match self {
            Self::Binary(_) => {
                let (a, b) = (&inputs[0].desc, &inputs[1].desc);
                if a.dtype != b.dtype {
                    return Err(self.shape_err(format!("dtype {} vs {}", a.dtype, b.dtype)));
                }
                let out = if a.dims == b.dims || b.size == 1 {
                    a.clone()
                } else if a.size == 1 {
                    b.clone()
                } else {
                    return Err(self.shape_err(format!("cannot broadcast {:?} with {:?}", a.dims, b.dims)));
                };
                Ok(vec![out])
            }
            Self::Unary(_) => Ok(vec![inputs[0].desc.clone()]),
            Self::Reduce {
                dims, keep_dims, ..
            } => {
                let src = &inputs[0].desc;
                let axes = normalize_axes(dims, src.rank()).map_err(|e| self.shape_err(e))?;
                let mut out = Vec::with_capacity(src.rank());
                for (i, &d) in src.dims.iter().enumerate() {
                    if !axes.contains(&i) {
                        out.push(d);
                    } else if *keep_dims {
                        out.push(1);
                    }
                }
                Ok(vec![Descriptor::new(out, src.layout, src.dtype)])
            }
            Self::Reshape => {
                let src = &inputs[0].desc;
                let shape = &inputs[1];
                if shape.desc.dtype != ElementType::I32 {
                    return Err(self.shape_err("shape tensor must be i32"));
                }
                let Some(content) = &shape.content else {
                    return Err(self.shape_err("shape tensor content is missing"));
                };
                let mut dims = crate::dtype::bytes_to_vec::<i32>(content);
                dims.truncate(shape.desc.size);
                let mut unknown = None;
                let mut known = 1usize;
                for (i, d) in dims.iter_mut().enumerate() {
                    match *d {
                        -1 if unknown.is_none() => unknown = Some(i),
                        0 => {
                            *d = *src.dims.get(i).ok_or_else(|| self.shape_err("0 dim past input rank"))?;
                            known *= *d as usize;
                        }
                        d if d > 0 => known *= d as usize,
                        d => return Err(self.shape_err(format!("bad target dim {d}"))),
                    }
                }
                if let Some(i) = unknown {
                    if known == 0 || src.size % known != 0 {
                        return Err(self.shape_err(format!("cannot infer -1 for {:?}", src.dims)));
                    }
                    dims[i] = (src.size / known) as i32;
                } else if known != src.size {
                    return Err(self.shape_err(format!("{:?} does not fit {:?}", dims, src.dims)));
                }
                Ok(vec![Descriptor::new(dims, src.layout, src.dtype)])
            }
            Self::Shape => Ok(vec![Descriptor::of(
                &[inputs[0].desc.rank() as i32],
                ElementType::I32,
            )]),
            Self::MatMul => {
                let (a, b) = (&inputs[0].desc, &inputs[1].desc);
                if a.dtype != b.dtype {
                    return Err(self.shape_err(format!("dtype {} vs {}", a.dtype, b.dtype)));
                }
                let dims = match (a.dims.as_slice(), b.dims.as_slice()) {
                    ([m, k1], [k2, n]) if k1 == k2 => vec![*m, *n],
                    ([b1, m, k1], [b2, k2, n]) if k1 == k2 && b1 == b2 => vec![*b1, *m, *n],
                    _ => {
                        return Err(self.shape_err(format!(
                            "incompatible operands {:?} x {:?}",
                            a.dims, b.dims
                        )))
                    }
                };
                Ok(vec![Descriptor::new(dims, a.layout, a.dtype)])
            }
            Self::Split { axis, parts } => {
                let src = &inputs[0].desc;
                let axes = normalize_axes(&[*axis], src.rank()).map_err(|e| self.shape_err(e))?;
                let axis = axes[0];
                let extent = src.dims[axis];
                if *parts == 0 || extent % *parts as i32 != 0 {
                    return Err(self.shape_err(format!("{extent} is not divisible into {parts}")));
                }
                let mut dims = src.dims.clone();
                dims[axis] = extent / *parts as i32;
                Ok(vec![Descriptor::new(dims, src.layout, src.dtype); *parts])
            }
        }
    }
}

/// Resolve negative axes against `rank`. An empty list selects every axis.
pub(crate) fn normalize_axes(dims: &[i32], rank: usize) -> std::result::Result<Vec<usize>, String> {
    if dims.is_empty() {
        return Ok((0..rank).collect());
    }
    let mut axes = Vec::with_capacity(dims.len());
    for &d in dims {
        let a = if d < 0 { d + rank as i32 } else { d };
        if a < 0 || a as usize >= rank {
            return Err(format!("axis {d} out of range for rank {rank}"));
        }
        if !axes.contains(&(a as usize)) {
            axes.push(a as usize);
        }
    }
    axes.sort_unstable();
    Ok(axes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::vec_to_bytes;

    fn info(dims: &[i32]) -> InfoInput {
        InfoInput {
            desc: Descriptor::of(dims, ElementType::F32),
            content: None,
        }
    }

    #[test]
    fn reshape_needs_shape_content() {
        let req = Op::Reshape.requirement(2);
        assert_eq!(req.shape_need_content, vec![false, true]);
        assert_eq!(req.content_need_content, vec![true, false]);
        assert!(!Op::Shape.requirement(1).content_need_content[0]);
    }

    #[test]
    fn reshape_infers_minus_one() {
        let target = InfoInput {
            desc: Descriptor::of(&[2], ElementType::I32),
            content: Some(vec_to_bytes(&[-1i32, 4])),
        };
        let out = Op::Reshape.infer(&[info(&[2, 6]), target]).unwrap();
        assert_eq!(out[0].dims, vec![3, 4]);
    }

    #[test]
    fn reduce_drops_or_keeps_axes() {
        let op = Op::Reduce {
            kind: ReduceType::Sum,
            dims: vec![-1],
            keep_dims: false,
        };
        assert_eq!(op.infer(&[info(&[2, 3])]).unwrap()[0].dims, vec![2]);
        let op = Op::Reduce {
            kind: ReduceType::Mean,
            dims: vec![],
            keep_dims: true,
        };
        assert_eq!(op.infer(&[info(&[2, 3])]).unwrap()[0].dims, vec![1, 1]);
    }

    #[test]
    fn binary_rejects_mismatched_shapes() {
        let op = Op::Binary(BinaryOpType::Add);
        assert!(op.infer(&[info(&[2, 3]), info(&[3, 2])]).is_err());
        assert_eq!(op.infer(&[info(&[2, 3]), info(&[1])]).unwrap()[0].dims, vec![2, 3]);
    }

    #[test]
    fn split_divides_axis() {
        let op = Op::Split { axis: 0, parts: 2 };
        let out = op.infer(&[info(&[4, 3])]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].dims, vec![2, 3]);
    }
}
