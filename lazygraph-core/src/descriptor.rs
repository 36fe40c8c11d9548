use serde::{Deserialize, Serialize};

use crate::ElementType;

/// Channel alignment used by the packed layout.
pub const PACK_ALIGN: i32 = 4;

/// Element order of a tensor in memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// Row-major, channel second.
    #[default]
    Nchw,
    /// Row-major, channel last.
    Nhwc,
    /// Channel axis packed in groups of [`PACK_ALIGN`].
    Nc4hw4,
}

/// Shape, layout and element type of one tensor value.
///
/// `size` is a cache of the element count and must be refreshed with
/// [`Descriptor::sync_size`] whenever `dims` or `layout` change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub dims: Vec<i32>,
    pub layout: Layout,
    pub dtype: ElementType,
    pub size: usize,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::new(Vec::new(), Layout::default(), ElementType::default())
    }
}

impl Descriptor {
    pub fn new(dims: Vec<i32>, layout: Layout, dtype: ElementType) -> Self {
        let mut desc = Self {
            dims,
            layout,
            dtype,
            size: 0,
        };
        desc.sync_size();
        desc
    }

    /// Row-major descriptor, the common case.
    pub fn of(dims: &[i32], dtype: ElementType) -> Self {
        Self::new(dims.to_vec(), Layout::Nchw, dtype)
    }

    /// Recompute `size` from `dims` and `layout`. Any non-positive dim, or a
    /// byte size past `usize`, yields 0.
    pub fn sync_size(&mut self) {
        self.size = self.checked_size().unwrap_or(0);
    }

    fn checked_size(&self) -> Option<usize> {
        let mut size = 1usize;
        for (axis, &d) in self.dims.iter().enumerate() {
            if d <= 0 {
                return None;
            }
            let d = if axis == 1 && self.layout == Layout::Nc4hw4 {
                d.checked_add(PACK_ALIGN - 1)? / PACK_ALIGN * PACK_ALIGN
            } else {
                d
            };
            size = size.checked_mul(d as usize)?;
        }
        size.checked_mul(self.dtype.bytes())?;
        Some(size)
    }

    /// True if some extent is not known yet.
    pub fn has_unknown_dim(&self) -> bool {
        self.dims.iter().any(|d| *d < 0)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn byte_size(&self) -> usize {
        self.size * self.dtype.bytes()
    }

    /// Same dims, layout and element type.
    pub fn same_shape(&self, other: &Self) -> bool {
        self.dims == other.dims && self.layout == other.layout && self.dtype == other.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_product_of_dims() {
        let desc = Descriptor::of(&[2, 3, 4], ElementType::F32);
        assert_eq!(desc.size, 24);
        assert_eq!(desc.byte_size(), 96);
    }

    #[test]
    fn scalar_has_one_element() {
        assert_eq!(Descriptor::of(&[], ElementType::I32).size, 1);
    }

    #[test]
    fn unknown_dim_zeroes_size() {
        let desc = Descriptor::of(&[-1, 3], ElementType::F32);
        assert_eq!(desc.size, 0);
        assert!(desc.has_unknown_dim());
        assert_eq!(Descriptor::of(&[0, 3], ElementType::F32).size, 0);
    }

    #[test]
    fn overflowing_dims_zero_size() {
        let desc = Descriptor::of(&[i32::MAX, i32::MAX, i32::MAX], ElementType::F32);
        assert_eq!(desc.size, 0);
        let packed = Descriptor::new(vec![1, i32::MAX], Layout::Nc4hw4, ElementType::F32);
        assert_eq!(packed.size, 0);
    }

    #[test]
    fn packed_layout_rounds_channels() {
        let mut desc = Descriptor::new(vec![1, 3, 2, 2], Layout::Nc4hw4, ElementType::F32);
        assert_eq!(desc.size, 16);
        desc.dims[1] = 5;
        desc.sync_size();
        assert_eq!(desc.size, 32);
    }
}
