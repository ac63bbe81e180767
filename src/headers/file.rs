//! Append-only flat file of fixed-size serialized headers.
//!
//! The file holds `headers[start_point..=tip]` back to back with no framing.
//! Its length is a multiple of the header size at every observation point;
//! truncation removes whole headers from the tail only.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::chain_error::{ChainError, ChainResult};

pub struct HeaderFile {
    path: PathBuf,
    header_size: usize,
}

impl HeaderFile {
    /// Open (creating if needed) the header file and check its length.
    pub fn open<P: AsRef<Path>>(path: P, header_size: usize) -> ChainResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                create_dir_all(dir)?;
            }
        }
        if !path.exists() {
            File::create(&path)?;
        }

        let file = HeaderFile { path, header_size };
        file.header_count()?;
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn len_bytes(&self) -> ChainResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Number of whole headers on disk; fails if the length is ragged.
    pub fn header_count(&self) -> ChainResult<u64> {
        let len = self.len_bytes()?;
        self.check_len(len)?;
        Ok(len / self.header_size as u64)
    }

    /// Append serialized headers, returning how many were written.
    pub fn append(&self, raw: &[u8]) -> ChainResult<usize> {
        self.check_len(raw.len() as u64)?;
        if raw.is_empty() {
            return Ok(0);
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(raw)?;
        file.sync_data()?;
        Ok(raw.len() / self.header_size)
    }

    pub fn read_all(&self) -> ChainResult<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        self.check_len(buf.len() as u64)?;
        Ok(buf)
    }

    /// Remove exactly `n` headers from the tail. Returns the new header count.
    pub fn truncate_headers(&self, n: u64) -> ChainResult<u64> {
        if n == 0 {
            return Err(ChainError::InvalidTruncate(
                "truncate count must be positive".to_string(),
            ));
        }

        let len = self.len_bytes()?;
        self.check_len(len)?;

        let cut = n * self.header_size as u64;
        if cut > len {
            return Err(ChainError::InvalidTruncate(format!(
                "cannot remove {} headers from a file holding {}",
                n,
                len / self.header_size as u64
            )));
        }

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len - cut)?;
        file.sync_all()?;
        Ok((len - cut) / self.header_size as u64)
    }

    fn check_len(&self, len: u64) -> ChainResult<()> {
        if len % self.header_size as u64 != 0 {
            return Err(ChainError::CorruptLength {
                len,
                header_size: self.header_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let file = HeaderFile::open(dir.path().join("sub/headers.bin"), 80).unwrap();
        assert_eq!(file.header_count().unwrap(), 0);

        assert_eq!(file.append(&[1u8; 160]).unwrap(), 2);
        assert_eq!(file.append(&[]).unwrap(), 0);
        assert_eq!(file.header_count().unwrap(), 2);
        assert_eq!(file.read_all().unwrap().len(), 160);
    }

    #[test]
    fn test_append_rejects_ragged_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let file = HeaderFile::open(dir.path().join("headers.bin"), 80).unwrap();
        let err = file.append(&[0u8; 81]).unwrap_err();
        assert!(matches!(err, ChainError::CorruptLength { len: 81, .. }));
        assert_eq!(file.len_bytes().unwrap(), 0);
    }

    #[test]
    fn test_open_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headers.bin");
        std::fs::write(&path, [0u8; 100]).unwrap();
        assert!(matches!(
            HeaderFile::open(&path, 80),
            Err(ChainError::CorruptLength { len: 100, .. })
        ));
    }

    #[test]
    fn test_truncate_whole_headers() {
        let dir = tempfile::tempdir().unwrap();
        let file = HeaderFile::open(dir.path().join("headers.bin"), 80).unwrap();
        let mut raw = Vec::new();
        for i in 0..5u8 {
            raw.extend_from_slice(&[i; 80]);
        }
        file.append(&raw).unwrap();

        assert_eq!(file.truncate_headers(2).unwrap(), 3);
        let left = file.read_all().unwrap();
        assert_eq!(left.len(), 240);
        assert_eq!(left[239], 2);

        assert!(file.truncate_headers(0).is_err());
        assert!(file.truncate_headers(4).is_err());
        assert_eq!(file.header_count().unwrap(), 3);
    }
}
