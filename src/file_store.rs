//! Elementary files of the LDS application.
//!
//! Files are fixed-size byte buffers keyed by their 16-bit file identifier.
//! A file is allocated once by [`FileStore::create_file`] and never
//! resized or deleted afterwards.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, trace};

use crate::BacError;

/// Application identifier of the eMRTD LDS application.
pub const EMRTD_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

pub const EF_COM: u16 = 0x011E;
pub const EF_SOD: u16 = 0x011D;
pub const EF_DG1: u16 = 0x0101;
pub const EF_DG2: u16 = 0x0102;
/// Last data group identifier, DG16.
pub const EF_DG16: u16 = 0x0110;

/// Storage behind the card's file commands.
///
/// Every failing call must leave the store unchanged.
pub trait FileStore {
    /// Allocates a zero filled file of `size` bytes.
    ///
    /// # Errors
    ///
    /// * `BacError::FileExists` if the file was already created.
    /// * `BacError::FileNotFound` if the identifier is not allowed.
    fn create_file(&mut self, fid: u16, size: usize) -> Result<(), BacError>;

    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// * `BacError::FileNotFound` if the file does not exist.
    /// * `BacError::FileOutOfBounds` if the range exceeds the file.
    fn read_file(&self, fid: u16, offset: usize, len: usize) -> Result<Vec<u8>, BacError>;

    /// Overwrites bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// * `BacError::FileNotFound` if the file does not exist.
    /// * `BacError::FileOutOfBounds` if the range exceeds the file.
    fn write_file(&mut self, fid: u16, offset: usize, data: &[u8]) -> Result<(), BacError>;

    fn exists(&self, fid: u16) -> bool;

    /// Allocated size of a file.
    ///
    /// # Errors
    ///
    /// * `BacError::FileNotFound` if the file does not exist.
    fn file_size(&self, fid: u16) -> Result<usize, BacError>;
}

/// A [`FileStore`] kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileStore {
    files: BTreeMap<u16, Vec<u8>>,
    /// Identifiers that may be created, `None` allows all.
    allowed: Option<BTreeSet<u16>>,
}

impl MemoryFileStore {
    /// A store accepting any file identifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store accepting only the LDS files: DG1 to DG16, EF.SOD and EF.COM.
    ///
    /// # Example
    ///
    /// ```
    /// use mrtd_bac::{FileStore, MemoryFileStore, EF_COM};
    ///
    /// let mut store = MemoryFileStore::lds();
    /// assert!(store.create_file(EF_COM, 32).is_ok());
    /// assert!(store.create_file(0x3F00, 32).is_err());
    /// ```
    #[must_use]
    pub fn lds() -> Self {
        let allowed = (EF_DG1..=EF_DG16).chain([EF_SOD, EF_COM]).collect();
        Self {
            files: BTreeMap::new(),
            allowed: Some(allowed),
        }
    }

    fn is_allowed(&self, fid: u16) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&fid))
    }

    fn file(&self, fid: u16) -> Result<&Vec<u8>, BacError> {
        self.files.get(&fid).ok_or_else(|| {
            error!("File {fid:04X} not found");
            BacError::FileNotFound(fid)
        })
    }
}

/// Checks that `offset..offset + len` lies within a file of `size` bytes.
fn check_bounds(fid: u16, offset: usize, len: usize, size: usize) -> Result<usize, BacError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(end),
        end => {
            let end = end.unwrap_or(usize::MAX);
            error!("Access to file {fid:04X} ends at {end}, beyond its size {size}");
            Err(BacError::FileOutOfBounds(fid, end, size))
        }
    }
}

impl FileStore for MemoryFileStore {
    fn create_file(&mut self, fid: u16, size: usize) -> Result<(), BacError> {
        if !self.is_allowed(fid) {
            error!("File {fid:04X} is not part of this application");
            return Err(BacError::FileNotFound(fid));
        }
        if self.files.contains_key(&fid) {
            error!("File {fid:04X} already exists");
            return Err(BacError::FileExists(fid));
        }
        trace!("Creating file {fid:04X} of {size} bytes");
        self.files.insert(fid, vec![0; size]);
        Ok(())
    }

    fn read_file(&self, fid: u16, offset: usize, len: usize) -> Result<Vec<u8>, BacError> {
        let file = self.file(fid)?;
        let end = check_bounds(fid, offset, len, file.len())?;
        Ok(file[offset..end].to_vec())
    }

    fn write_file(&mut self, fid: u16, offset: usize, data: &[u8]) -> Result<(), BacError> {
        let end = check_bounds(fid, offset, data.len(), self.file(fid)?.len())?;
        if let Some(file) = self.files.get_mut(&fid) {
            file[offset..end].copy_from_slice(data);
        }
        Ok(())
    }

    fn exists(&self, fid: u16) -> bool {
        self.files.contains_key(&fid)
    }

    fn file_size(&self, fid: u16) -> Result<usize, BacError> {
        Ok(self.file(fid)?.len())
    }
}
