//! The Master File Directory: a flat list of the volume's directories.
//!
//! The MFD occupies `CPagedMFD` pages starting at `LfaMFDbase`. Each page
//! holds a one-byte header followed by 14 entries of 35 bytes; an entry
//! whose directory name has length 0 is a free slot.

use crate::DiskError;
use crate::codec::{Field, RecordView, field, pascal_str, record_len};
use crate::structures::vhb::Vhb;

pub const MFD_FIELDS: &[Field] = &[
    field(0, 13, "DirectoryName"),
    field(13, 13, "DirPassword"),
    field(26, 4, "LfaDirbase"),
    field(30, 2, "CPages"),
    field(32, 1, "DefaultAccessCode"),
    field(33, 2, "LruCnt"),
];

/// Entries per MFD page. 14 entries of 35 bytes plus the page header byte
/// use 491 bytes of a 512-byte page.
pub const ENTRIES_PER_PAGE: usize = 14;

/// One directory known to the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfdEntry {
    pub name: Vec<u8>,
    pub password: Vec<u8>,
    pub lfa_dir_base: u32,
    pub c_pages: u16,
    pub default_access_code: u8,
    pub lru_cnt: u16,
}

impl MfdEntry {
    /// Decode one 35-byte slot. `None` for a free slot.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, DiskError> {
        let v = RecordView::new(buf, MFD_FIELDS)?;
        let raw_name = v.bytes("DirectoryName");
        if raw_name[0] == 0 {
            return Ok(None);
        }
        let name = match pascal_str(raw_name) {
            Ok(n) => n.to_vec(),
            Err(_) => {
                log::warn!("MFD entry with over-long name prefix, skipping");
                return Ok(None);
            }
        };
        let password = pascal_str(v.bytes("DirPassword")).unwrap_or(&[]).to_vec();
        Ok(Some(Self {
            name,
            password,
            lfa_dir_base: v.u32("LfaDirbase"),
            c_pages: v.u16("CPages"),
            default_access_code: v.u8("DefaultAccessCode"),
            lru_cnt: v.u16("LruCnt"),
        }))
    }
}

/// Enumerate the MFD in on-disk order, skipping free slots.
pub fn read_mfd(image: &[u8], vhb: &Vhb) -> Result<Vec<MfdEntry>, DiskError> {
    let bps = vhb.bytes_per_sector as usize;
    let entry_len = record_len(MFD_FIELDS);
    let mut entries = Vec::new();
    for page in 0..vhb.c_paged_mfd as usize {
        let page_start = vhb.lfa_mfd_base as usize + page * bps;
        let page_bytes = image
            .get(page_start..page_start + bps)
            .ok_or(DiskError::Truncated {
                needed: page_start + bps,
                got: image.len(),
            })?;
        for slot in 0..ENTRIES_PER_PAGE {
            let at = 1 + slot * entry_len;
            let Some(slot_bytes) = page_bytes.get(at..) else {
                log::warn!("MFD page {page} is too small for slot {slot}");
                break;
            };
            if let Some(entry) = MfdEntry::decode(slot_bytes)? {
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}

/// Case-insensitive lookup by directory name.
pub fn find<'a>(mfd: &'a [MfdEntry], name: &[u8]) -> Option<&'a MfdEntry> {
    mfd.iter().find(|e| e.name.eq_ignore_ascii_case(name))
}
