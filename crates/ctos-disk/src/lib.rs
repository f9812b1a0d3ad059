//! A library for reading and mutating disk images of the Convergent
//! CTOS/BTOS filesystem.
//!
//! A disk image is a single byte array holding the raw sectors of a floppy or
//! fixed disk formatted by CTOS. The [`Volume`] type owns such a buffer and
//! exposes the on-disk structures: the Volume Home Block (superblock, two
//! copies), the Master File Directory, per-directory pages, file headers with
//! their extent lists, and the sector allocation bitmap.
//!
//! Supported operations are enumeration (`dump`, `listdir`, `stat`), content
//! retrieval and replacement, file deletion, geometry rewriting, and a
//! whole-volume integrity audit ([`Volume::check_disk`]). Creating files or
//! directories, renaming, and bad-block remapping are not supported.
//!
//! Non-fatal problems found while reading (bad checksums, name mismatches,
//! malformed records) are reported through the [`log`] crate and the
//! operation continues best-effort. Problems found after a mutation are
//! fatal: the mutating call returns an error and the image must not be
//! saved in that state.

pub mod codec;
pub mod fs;
pub mod structures;

pub use fs::{DirEntry, Volume};
pub use structures::bitmap::AllocBitmap;
pub use structures::file_header::{Extent, FileHeader};
pub use structures::mfd::MfdEntry;
pub use structures::vhb::Vhb;

/// Errors surfaced by the disk engine.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// The buffer is too short for the record or region being decoded.
    #[error("truncated input: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    /// A raw-buffer field was given a source value of the wrong length.
    #[error("field {field} holds {expected} bytes, source has {got}")]
    FieldSizeMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    /// A field table is not contiguous at the named field.
    #[error("field table broken at {field}: offset {found}, expected {expected}")]
    BadFieldTable {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    /// A length-prefixed name claims more payload than its field holds.
    #[error("length-prefixed name overruns its field")]
    InvalidName,

    /// A stored checksum does not match the computed one.
    #[error("{owner} checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        owner: ChecksumOwner,
        stored: u16,
        computed: u16,
    },

    /// A file header offset points past the end of the image.
    #[error("file header {0} lies outside the image")]
    HeaderOutOfRange(u16),

    #[error("directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The allocation bitmap has no free sector left.
    #[error("no free sector in the allocation bitmap")]
    NoFreeSector,

    /// The new contents would need more extents than a file header holds.
    #[error("contents would need more than {} extents", structures::file_header::MAX_EXTENTS)]
    TooFragmented,

    /// Contents read back after a replace differ from what was written.
    #[error("written contents did not read back identically")]
    VerificationFailed,

    /// The post-mutation integrity audit found problems.
    #[error("integrity check reported {0} errors")]
    IntegrityCheckFailed(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Which structure a mismatching checksum belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumOwner {
    BackupVhb,
    ActiveVhb,
    FileHeader(u16),
}

impl core::fmt::Display for ChecksumOwner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ChecksumOwner::BackupVhb => write!(f, "backup VHB"),
            ChecksumOwner::ActiveVhb => write!(f, "active VHB"),
            ChecksumOwner::FileHeader(fho) => write!(f, "file header {fho}"),
        }
    }
}
