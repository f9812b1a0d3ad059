//! On-disk structures of the CTOS volume format.
//!
//! The `vhb` module defines the Volume Home Block (superblock, two copies).
//! The `mfd` module defines the Master File Directory.
//! The `directory` module parses and mutates per-directory pages.
//! The `file_header` module defines file headers and their extent lists.
//! The `bitmap` module manages the sector allocation bitmap.
//!
//! All multi-byte integers are little-endian; strings are length-prefixed
//! byte arrays padded to their field width.

use crate::DiskError;
use crate::codec::{Field, field, sanity_check};

pub mod bitmap;
pub mod directory;
pub mod file_header;
pub mod mfd;
pub mod vhb;

/// CTOS pages are 512 bytes; larger sector sizes are still addressed in
/// 512-byte units for file headers and the allocation bitmap.
pub const SECTOR_SIZE: usize = 512;

/// Arithmetic seed for the VHB and file-header checksums.
pub const MAGIC_WD: u16 = 0x7C39;

/// Bad-block table layout. Remapping is out of scope, so nothing decodes
/// these pages; the layout is still validated by [`sanity_check_all`] with
/// the rest of the format.
pub const BAD_BLOCK_FIELDS: &[Field] = &[
    field(0, 128, "RgbBadSector"),
    field(128, 128, "RgbBadHead"),
    field(256, 256, "RgbBadCylinder"),
];

/// Validate every field table: offsets must be contiguous and
/// non-overlapping. Run by the tool at startup, before any command.
pub fn sanity_check_all() -> Result<(), DiskError> {
    sanity_check(vhb::VHB_FIELDS)?;
    sanity_check(mfd::MFD_FIELDS)?;
    sanity_check(file_header::FILE_HEADER_FIELDS)?;
    sanity_check(BAD_BLOCK_FIELDS)?;
    Ok(())
}
