use core::fmt;

use crate::error::CapacityExceeded;

// Holds at most N - 1 bytes. A write that does not fit leaves the contents untouched.
#[derive(Clone)]
pub struct BoundedBuffer<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> BoundedBuffer<N> {
    pub const CAPACITY: usize = N - 1;

    pub const fn new() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        Self::CAPACITY - self.len
    }

    pub fn is_full(&self) -> bool {
        self.len == Self::CAPACITY
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push(&mut self, byte: u8) -> Result<(), CapacityExceeded> {
        self.extend_from_slice(&[byte])
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), CapacityExceeded> {
        let needed = self.len + data.len();
        if needed > Self::CAPACITY {
            return Err(CapacityExceeded {
                needed,
                capacity: Self::CAPACITY,
            });
        }
        self.bytes[self.len..needed].copy_from_slice(data);
        self.len = needed;
        Ok(())
    }

    // Returns how many bytes were kept.
    pub fn extend_truncating(&mut self, data: &[u8]) -> usize {
        let kept = data.len().min(self.remaining());
        self.bytes[self.len..self.len + kept].copy_from_slice(&data[..kept]);
        self.len += kept;
        kept
    }

    pub fn set(&mut self, data: &[u8]) -> Result<(), CapacityExceeded> {
        if data.len() > Self::CAPACITY {
            return Err(CapacityExceeded {
                needed: data.len(),
                capacity: Self::CAPACITY,
            });
        }
        self.clear();
        self.extend_from_slice(data)
    }
}

impl<const N: usize> Default for BoundedBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for BoundedBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedBuffer")
            .field("len", &self.len)
            .field("capacity", &Self::CAPACITY)
            .field("bytes", &String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

impl<const N: usize> PartialEq for BoundedBuffer<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl<const N: usize> Eq for BoundedBuffer<N> {}
