// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! File-backed shared memory with a validated schema.
//!
//! Two unrelated processes must observe the same byte-for-byte control
//! structures: the persistent flow/vport shadow tables and the memnic port
//! regions. A [`SharedRegion`] is a mapped file whose first eight bytes are
//! a `{magic, version}` stamp checked on open; everything after is an opaque
//! payload the owning component lays out with explicit offsets. Absolute
//! pointers never enter a region.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, warn};

/// Byte length of the `{magic, version}` stamp.
pub const HEADER_LEN: usize = 8;

/// File permissions for shared regions, matching the historic tables.
const REGION_MODE: u32 = 0o755;

/// Identity and size of a region's contents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegionSchema {
    /// Stamp identifying the layout.
    pub magic: u32,
    /// Layout revision.
    pub version: u32,
    /// Payload bytes following the stamp.
    pub payload_len: usize,
}

impl RegionSchema {
    const fn file_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }
}

/// Errors from region lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("region {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("region {path:?}: magic {found:#010x}, expected {expected:#010x}")]
    BadMagic {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("region {path:?}: version {found}, expected {expected}")]
    BadVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("region {path:?}: {found} bytes on disk, schema needs {expected}")]
    BadLength {
        path: PathBuf,
        found: usize,
        expected: usize,
    },
}

/// A mapped, schema-stamped shared region.
pub struct SharedRegion {
    map: MmapMut,
    path: PathBuf,
    schema: RegionSchema,
}

impl SharedRegion {
    /// Create (or truncate-and-restamp) the region file and map it.
    ///
    /// The payload is zeroed.
    ///
    /// # Errors
    ///
    /// I/O failures opening, sizing, or mapping the file.
    pub fn create(path: impl AsRef<Path>, schema: RegionSchema) -> Result<SharedRegion, RegionError> {
        let path = path.as_ref().to_path_buf();
        let io = |source| RegionError::Io {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(REGION_MODE)
            .open(&path)
            .map_err(io)?;
        file.set_len(schema.file_len() as u64).map_err(io)?;
        // SAFETY: the mapping is backed by a regular file we just sized;
        // concurrent mappers are part of the region contract.
        #[allow(unsafe_code)]
        let mut map = unsafe { MmapMut::map_mut(&file).map_err(io)? };
        map[0..4].copy_from_slice(&schema.magic.to_le_bytes());
        map[4..8].copy_from_slice(&schema.version.to_le_bytes());
        debug!(path = %path.display(), len = schema.file_len(), "created shared region");
        Ok(SharedRegion { map, path, schema })
    }

    /// Map an existing region, validating stamp and length against `schema`.
    ///
    /// # Errors
    ///
    /// I/O failures, or [`RegionError::BadMagic`] / [`RegionError::BadVersion`]
    /// / [`RegionError::BadLength`] when the file does not match the schema.
    pub fn open(path: impl AsRef<Path>, schema: RegionSchema) -> Result<SharedRegion, RegionError> {
        let path = path.as_ref().to_path_buf();
        let io = |source| RegionError::Io {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(io)?;
        let found = file.metadata().map_err(io)?.len() as usize;
        if found != schema.file_len() {
            return Err(RegionError::BadLength {
                path,
                found,
                expected: schema.file_len(),
            });
        }
        // SAFETY: as in `create`; the file length was just validated.
        #[allow(unsafe_code)]
        let map = unsafe { MmapMut::map_mut(&file).map_err(io)? };
        let magic = u32::from_le_bytes(map[0..4].try_into().unwrap_or_default());
        if magic != schema.magic {
            return Err(RegionError::BadMagic {
                path,
                found: magic,
                expected: schema.magic,
            });
        }
        let version = u32::from_le_bytes(map[4..8].try_into().unwrap_or_default());
        if version != schema.version {
            return Err(RegionError::BadVersion {
                path,
                found: version,
                expected: schema.version,
            });
        }
        Ok(SharedRegion { map, path, schema })
    }

    /// Map the region if the file exists and matches; create it otherwise.
    ///
    /// # Errors
    ///
    /// As for [`SharedRegion::create`].
    pub fn open_or_create(
        path: impl AsRef<Path>,
        schema: RegionSchema,
    ) -> Result<SharedRegion, RegionError> {
        match SharedRegion::open(&path, schema) {
            Ok(region) => Ok(region),
            Err(RegionError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                SharedRegion::create(path, schema)
            }
            Err(err) => {
                warn!(
                    path = %path.as_ref().display(),
                    %err,
                    "stale shared region, recreating"
                );
                SharedRegion::create(path, schema)
            }
        }
    }

    /// Payload bytes (everything after the stamp).
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.map[HEADER_LEN..]
    }

    /// Mutable payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.map[HEADER_LEN..]
    }

    /// The schema this region was mapped with.
    #[must_use]
    pub fn schema(&self) -> RegionSchema {
        self.schema
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmap and delete the backing file.
    ///
    /// # Errors
    ///
    /// I/O failure removing the file; the mapping is gone either way.
    pub fn destroy(self) -> Result<(), RegionError> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path).map_err(|source| RegionError::Io { path, source })
    }
}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("schema", &self.schema)
            .finish()
    }
}
