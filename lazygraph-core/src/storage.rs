use std::{cell::RefCell, rc::Rc};

use crate::{
    dtype::{bytes_to_vec, vec_to_bytes, write_slice},
    DType, Descriptor, Error, Result,
};

/// Caller-owned host memory that a leaf node may adopt without copying.
///
/// The node only holds a reference; writes made through any clone of the
/// buffer are visible to later reads of the node until it reallocates.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Rc::new(RefCell::new(bytes)))
    }

    pub fn from_slice<T: DType>(values: &[T]) -> Self {
        Self::new(vec_to_bytes(values))
    }

    /// Overwrite the leading elements with `values`.
    pub fn write<T: DType>(&self, values: &[T]) -> Result<()> {
        let mut data = self.0.borrow_mut();
        let bytes = values.len() * T::ELEMENT.bytes();
        if bytes > data.len() {
            crate::bail!(
                "write of {bytes} bytes overflows a shared buffer of {} bytes",
                data.len()
            );
        }
        write_slice(values, &mut data[..bytes]);
        Ok(())
    }

    pub fn to_vec<T: DType>(&self) -> Vec<T> {
        bytes_to_vec(&self.0.borrow())
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Content of one node output.
#[derive(Clone, Debug, Default)]
pub(crate) enum TensorBuffer {
    #[default]
    Empty,
    Owned(Vec<u8>),
    External(SharedBuffer),
}

impl TensorBuffer {
    /// Replace the content with a fresh zeroed allocation of `bytes` bytes.
    /// An adopted external buffer is released, never resized.
    pub(crate) fn alloc(&mut self, bytes: usize) -> Result<()> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| Error::Alloc(bytes))?;
        data.resize(bytes, 0);
        *self = Self::Owned(data);
        Ok(())
    }

    pub(crate) fn release(&mut self) {
        *self = Self::Empty;
    }

    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            Self::Empty => f(&[]),
            Self::Owned(data) => f(data),
            Self::External(shared) => f(&shared.0.borrow()),
        }
    }

    pub(crate) fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match self {
            Self::Empty => f(&mut []),
            Self::Owned(data) => f(data),
            Self::External(shared) => f(&mut shared.0.borrow_mut()),
        }
    }

    /// Copy of the first `len` bytes, or fewer if the buffer is shorter.
    pub(crate) fn to_bytes(&self, len: usize) -> Vec<u8> {
        self.with_bytes(|b| b[..len.min(b.len())].to_vec())
    }
}

/// A materialized tensor exchanged with a backend.
#[derive(Clone, Debug, PartialEq)]
pub struct HostTensor {
    pub desc: Descriptor,
    pub data: Vec<u8>,
}

impl HostTensor {
    pub fn new(desc: Descriptor, data: Vec<u8>) -> Self {
        Self { desc, data }
    }

    pub fn to_vec<T: DType>(&self) -> Vec<T> {
        bytes_to_vec(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_buffer_writes_are_visible_to_clones() {
        let a = SharedBuffer::from_slice(&[1f32, 2., 3.]);
        let b = a.clone();
        a.write(&[9f32]).unwrap();
        assert_eq!(b.to_vec::<f32>(), vec![9., 2., 3.]);
        assert!(a.write(&[0f32; 4]).is_err());
    }

    #[test]
    fn alloc_drops_external_buffer() {
        let shared = SharedBuffer::from_slice(&[1u8, 2]);
        let mut buf = TensorBuffer::External(shared.clone());
        buf.alloc(3).unwrap();
        assert!(matches!(buf, TensorBuffer::Owned(_)));
        assert_eq!(buf.to_bytes(8), vec![0, 0, 0]);
        assert_eq!(shared.to_vec::<u8>(), vec![1, 2]);
    }
}
