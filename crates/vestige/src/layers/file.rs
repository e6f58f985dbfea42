//! Memory-mapped file layer.
//!
//! Terminal raw layer over a read-only memory map. Accepts `file://` URLs
//! or plain filesystem paths.

use crate::error::{AsError, AsResult};
use crate::layers::AddressSpace;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::PathBuf;

pub struct FileLayer {
    name: String,
    location: String,
    /// None when the file is empty; mmap of a zero-length file is an error.
    mmap: Option<Mmap>,
    size: u64,
}

impl FileLayer {
    /// Open a read-only memory-mapped file layer.
    pub fn open(name: impl Into<String>, location: impl Into<String>) -> AsResult<Self> {
        let name = name.into();
        let location = location.into();
        let path = Self::parse_location(&location);

        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        let mmap = if size == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().map(&file)? })
        };

        Ok(FileLayer {
            name,
            location,
            mmap,
            size,
        })
    }

    /// Parse a file:// URL to a path, decoding percent escapes.
    fn parse_location(location: &str) -> PathBuf {
        let path_str = match location.strip_prefix("file://") {
            Some(url_path) => {
                // file:///C:/path means a Windows drive-absolute path
                if url_path.starts_with('/')
                    && url_path.len() > 2
                    && url_path.chars().nth(2) == Some(':')
                {
                    &url_path[1..]
                } else {
                    url_path
                }
            }
            None => location,
        };
        PathBuf::from(percent_decode(path_str))
    }

    fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Read bytes, padding with zeros past the end when `pad` is set.
    pub fn read_bytes(&self, offset: u64, length: usize, pad: bool) -> AsResult<Vec<u8>> {
        let size = self.size;
        if offset > size || (offset == size && length > 0) {
            if pad {
                return Ok(vec![0u8; length]);
            }
            return Err(AsError::invalid_address(
                &self.name,
                offset,
                "Offset outside of the file boundaries",
            ));
        }

        let data = self.as_slice();
        let start = offset as usize;
        let available = (size - offset) as usize;

        if length <= available {
            Ok(data[start..start + length].to_vec())
        } else if pad {
            let mut result = Vec::with_capacity(length);
            result.extend_from_slice(&data[start..]);
            result.resize(length, 0);
            Ok(result)
        } else {
            Err(AsError::invalid_address(
                &self.name,
                offset + available as u64,
                "Could not read sufficient bytes from the file",
            ))
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

impl AddressSpace for FileLayer {
    fn read(&self, offset: u64, length: usize) -> AsResult<Vec<u8>> {
        self.read_bytes(offset, length, false)
    }

    fn is_valid(&self, offset: u64, length: u64) -> bool {
        if length == 0 || self.size == 0 {
            return false;
        }
        let max_addr = self.size - 1;
        let end = offset.saturating_add(length).saturating_sub(1);
        offset <= max_addr && end <= max_addr
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn maximum_address(&self) -> u64 {
        self.size.saturating_sub(1)
    }
}

/// Percent-decoding for file paths (handles %20 etc.).
fn percent_decode(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if hex.len() == 2 {
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    result.push(byte as char);
                    continue;
                }
            }
            result.push('%');
            result.push_str(&hex);
        } else {
            result.push(c);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_file_url() {
        assert_eq!(
            FileLayer::parse_location("file:///tmp/test.raw"),
            PathBuf::from("/tmp/test.raw")
        );
        assert_eq!(
            FileLayer::parse_location("/tmp/test.raw"),
            PathBuf::from("/tmp/test.raw")
        );
        assert_eq!(
            FileLayer::parse_location("file:///tmp/test%20file.raw"),
            PathBuf::from("/tmp/test file.raw")
        );
    }

    #[test]
    fn test_open_and_read() {
        let mut tmpfile = NamedTempFile::new().unwrap();
        tmpfile.write_all(b"Hello, World!").unwrap();
        tmpfile.flush().unwrap();

        let layer = FileLayer::open("physical", tmpfile.path().to_str().unwrap()).unwrap();
        assert_eq!(layer.read(0, 5).unwrap(), b"Hello");
        assert_eq!(layer.read(7, 5).unwrap(), b"World");
        assert_eq!(layer.maximum_address(), 12);
    }

    #[test]
    fn test_read_with_padding() {
        let mut tmpfile = NamedTempFile::new().unwrap();
        tmpfile.write_all(b"Hello").unwrap();
        tmpfile.flush().unwrap();

        let layer = FileLayer::open("physical", tmpfile.path().to_str().unwrap()).unwrap();
        assert_eq!(layer.read_bytes(3, 5, true).unwrap(), b"lo\0\0\0");
        assert_eq!(layer.read_bytes(100, 3, true).unwrap(), b"\0\0\0");
        assert!(layer.read_bytes(100, 3, false).is_err());
        assert!(layer.read_bytes(3, 5, false).is_err());
    }

    #[test]
    fn test_is_valid() {
        let mut tmpfile = NamedTempFile::new().unwrap();
        tmpfile.write_all(b"0123456789").unwrap();
        tmpfile.flush().unwrap();

        let layer = FileLayer::open("physical", tmpfile.path().to_str().unwrap()).unwrap();
        assert!(layer.is_valid(0, 10));
        assert!(layer.is_valid(9, 1));
        assert!(!layer.is_valid(10, 1));
        assert!(!layer.is_valid(0, 11));
        assert!(!layer.is_valid(0, 0));
    }

    #[test]
    fn test_open_missing_file() {
        assert!(matches!(
            FileLayer::open("physical", "/nonexistent/image.raw"),
            Err(AsError::Io(_))
        ));
    }
}
