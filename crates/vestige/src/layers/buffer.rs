//! In-memory byte-buffer layer.
//!
//! Terminal raw layer over an owned byte vector. Used for synthetic images
//! in tests and for carved regions promoted to their own layer.

use crate::error::{AsError, AsResult};
use crate::layers::AddressSpace;

pub struct BufferLayer {
    name: String,
    data: Vec<u8>,
}

impl BufferLayer {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        BufferLayer {
            name: name.into(),
            data,
        }
    }

    /// Read bytes, padding with zeros past the end when `pad` is set.
    pub fn read_bytes(&self, offset: u64, length: usize, pad: bool) -> AsResult<Vec<u8>> {
        let size = self.data.len() as u64;
        if offset > size || (offset == size && length > 0) {
            if pad {
                return Ok(vec![0u8; length]);
            }
            return Err(AsError::invalid_address(
                &self.name,
                offset,
                "Offset outside of the buffer boundaries",
            ));
        }

        let start = offset as usize;
        let available = (size - offset) as usize;
        if length <= available {
            Ok(self.data[start..start + length].to_vec())
        } else if pad {
            let mut result = Vec::with_capacity(length);
            result.extend_from_slice(&self.data[start..]);
            result.resize(length, 0);
            Ok(result)
        } else {
            Err(AsError::invalid_address(
                &self.name,
                offset + available as u64,
                "Could not read sufficient bytes from the buffer",
            ))
        }
    }
}

impl AddressSpace for BufferLayer {
    fn read(&self, offset: u64, length: usize) -> AsResult<Vec<u8>> {
        self.read_bytes(offset, length, false)
    }

    fn is_valid(&self, offset: u64, length: u64) -> bool {
        if length == 0 || self.data.is_empty() {
            return false;
        }
        let max_addr = self.data.len() as u64 - 1;
        let end = offset.saturating_add(length).saturating_sub(1);
        offset <= max_addr && end <= max_addr
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn maximum_address(&self) -> u64 {
        (self.data.len() as u64).saturating_sub(1)
    }
}
