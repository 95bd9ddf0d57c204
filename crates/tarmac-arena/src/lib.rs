//! Append-only byte arena backed by a single growable file.
//!
//! The arena hands out stable byte offsets; allocations are monotonic and
//! never freed. All tree nodes, payload blobs, and auxiliary arrays of the
//! index live inside one arena, addressed purely by offset.
//!
//! Reads of allocated-but-unwritten spans observe zeros (the backing file
//! is sparse until written). Reads outside the allocated span are treated
//! as structural corruption, not I/O errors.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tarmac_error::{Result, TarmacError};
use tarmac_types::{DiskRecord, OffT};

/// An append-only byte region persisted to a single file.
pub struct Arena {
    file: File,
    /// High-water mark of allocation, which may run ahead of the physical
    /// file length until the next flush.
    size: OffT,
    writable: bool,
}

impl Arena {
    /// Create a fresh arena, truncating any existing file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            size: 0,
            writable: true,
        })
    }

    /// Open an existing arena read-only for querying.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            writable: false,
        })
    }

    /// Total allocated size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> OffT {
        self.size
    }

    /// Reserve `size` bytes and return their stable offset.
    pub fn alloc(&mut self, size: u64) -> Result<OffT> {
        self.alloc_aligned(size, 1)
    }

    /// Reserve `size` bytes at an offset that is a multiple of `align`.
    pub fn alloc_aligned(&mut self, size: u64, align: u64) -> Result<OffT> {
        if !self.writable {
            return Err(TarmacError::internal("allocation in read-only arena"));
        }
        if align == 0 || !align.is_power_of_two() {
            return Err(TarmacError::internal(format!(
                "bad arena alignment {align}"
            )));
        }
        let off = (self.size + align - 1) & !(align - 1);
        self.size = off
            .checked_add(size)
            .ok_or_else(|| TarmacError::internal("arena allocation overflow"))?;
        Ok(off)
    }

    fn check_span(&self, off: OffT, len: usize) -> Result<()> {
        let end = off
            .checked_add(len as u64)
            .ok_or_else(|| TarmacError::corrupt(format!("offset overflow at {off:#x}")))?;
        if end > self.size {
            return Err(TarmacError::corrupt(format!(
                "access [{off:#x}, {end:#x}) past end of arena ({:#x})",
                self.size
            )));
        }
        Ok(())
    }

    /// Write bytes into a previously allocated span.
    pub fn write_bytes(&mut self, off: OffT, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(TarmacError::internal("write to read-only arena"));
        }
        self.check_span(off, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(off))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Read bytes from the arena into `buf`.
    ///
    /// Spans that were allocated but never written read back as zeros.
    pub fn read_into(&self, off: OffT, buf: &mut [u8]) -> Result<()> {
        self.check_span(off, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(off))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                // Past the physical end of the file but inside the
                // allocated span: the remainder is unwritten, hence zero.
                buf[total..].fill(0);
                break;
            }
            total += n;
        }
        Ok(())
    }

    /// Read `len` bytes from the arena.
    pub fn read_bytes(&self, off: OffT, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.read_into(off, &mut buf)?;
        Ok(buf)
    }

    /// Write a fixed-layout record at `off`.
    pub fn write_record<T: DiskRecord>(&mut self, off: OffT, record: &T) -> Result<()> {
        let mut buf = vec![0_u8; T::SIZE];
        record.write_to(&mut buf);
        self.write_bytes(off, &buf)
    }

    /// Read a fixed-layout record at `off`.
    pub fn read_record<T: DiskRecord>(&self, off: OffT) -> Result<T> {
        let buf = self.read_bytes(off, T::SIZE)?;
        Ok(T::read_from(&buf))
    }

    /// Allocate space for a record and write it, returning its offset.
    pub fn alloc_record<T: DiskRecord>(&mut self, record: &T) -> Result<OffT> {
        let off = self.alloc(T::SIZE as u64)?;
        self.write_record(off, record)?;
        Ok(off)
    }

    /// Allocate space for a byte blob and write it, returning its offset.
    pub fn alloc_bytes(&mut self, data: &[u8]) -> Result<OffT> {
        let off = self.alloc(data.len() as u64)?;
        self.write_bytes(off, data)?;
        Ok(off)
    }

    /// Extend the physical file to the allocated size and sync it.
    pub fn flush(&mut self) -> Result<()> {
        if self.writable {
            let len = self.file.metadata()?.len();
            if len < self.size {
                self.file.set_len(self.size)?;
            }
            self.file.sync_data()?;
        }
        Ok(())
    }
}
