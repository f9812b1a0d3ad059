//! The whole-volume integrity audit.
//!
//! A pure observer: builds the bitmap the volume *should* have from the
//! structures it can reach (VHBs, bitmap pages, directory pages, every
//! extent of every live file) and compares it against the on-disk bitmap.
//! Every finding is logged and counted; nothing is repaired.

use crate::DiskError;
use crate::structures::SECTOR_SIZE;
use crate::structures::bitmap::AllocBitmap;
use crate::structures::file_header;
use crate::structures::mfd;

use super::{Volume, display};

pub(super) fn run(vol: &Volume) -> Result<u32, DiskError> {
    let vhb = vol.active_vhb()?;
    let bitmap = AllocBitmap::read(vol.as_bytes(), &vhb)?;
    let n_sectors = bitmap.len();
    // what the checker believes: true = free
    let mut expected = vec![true; n_sectors];
    let mut errors: u32 = 0;

    let mark = |expected: &mut Vec<bool>, sector: usize| {
        if let Some(bit) = expected.get_mut(sector) {
            *bit = false;
        } else {
            log::warn!("structure sector {sector} lies beyond the bitmap");
        }
    };

    // sector 0 holds the backup VHB
    mark(&mut expected, 0);

    // the allocation bitmap's own pages; when the map exactly fills its
    // last page, one extra page is reserved (quirk of the original format
    // tooling, reproduced to keep error counts identical)
    let bitmap_bytes = n_sectors.div_ceil(8);
    let mut bitmap_sectors = bitmap_bytes.div_ceil(SECTOR_SIZE);
    if bitmap_bytes % SECTOR_SIZE == 0 {
        bitmap_sectors += 1;
    }
    let first = vhb.lfa_alloc_bitmap_base as usize / SECTOR_SIZE;
    for sector in first..first + bitmap_sectors {
        mark(&mut expected, sector);
    }

    // the active VHB
    mark(&mut expected, vhb.lfa_vhb as usize / SECTOR_SIZE);

    // every directory and every file reachable from the MFD
    let mut reached = vec![false; vhb.c_pages_file_headers as usize];
    let mfd = mfd::read_mfd(vol.as_bytes(), &vhb)?;
    for mfd_entry in &mfd {
        let dir_first = mfd_entry.lfa_dir_base as usize / SECTOR_SIZE;
        for sector in dir_first..dir_first + mfd_entry.c_pages as usize {
            mark(&mut expected, sector);
        }

        for entry in vol.read_dir_entries(&vhb, mfd_entry)? {
            if let Ok(block) = vol.file_header_block_with(&vhb, entry.fho) {
                if !file_header::block_checksum_ok(block) {
                    log::error!(
                        "file header {} ({}) has a bad checksum",
                        entry.fho,
                        display(&entry.name)
                    );
                    errors += 1;
                }
            }

            if let Some(seen) = reached.get_mut(entry.fho as usize) {
                *seen = true;
            }
            if vhb.alt_file_header_page_offset > 0 {
                if let Some(shadow_fho) =
                    entry.fho.checked_add(vhb.alt_file_header_page_offset)
                {
                    let matches = vol
                        .file_header_block_with(&vhb, shadow_fho)
                        .is_ok_and(|shadow| {
                            file_header::peek_header_number(shadow)
                                == Some(entry.header.file_header_number)
                        });
                    if matches {
                        if let Some(seen) = reached.get_mut(shadow_fho as usize) {
                            *seen = true;
                        }
                    }
                }
            }

            for extent in &entry.header.extents {
                let first = extent.lfa as usize / SECTOR_SIZE;
                let last = (extent.lfa as usize + extent.cb as usize).div_ceil(SECTOR_SIZE);
                for sector in first..last {
                    if sector >= n_sectors {
                        log::error!(
                            "extent of {} covers sector {sector} beyond the volume",
                            display(&entry.name)
                        );
                        errors += 1;
                        continue;
                    }
                    if !expected[sector] {
                        log::error!(
                            "sector {sector} double-allocated (again by {})",
                            display(&entry.name)
                        );
                        errors += 1;
                    }
                    expected[sector] = false;
                    if bitmap.is_free(sector) != expected[sector] {
                        log::error!(
                            "bitmap says sector {sector} is free but {} uses it",
                            display(&entry.name)
                        );
                        errors += 1;
                    }
                }
            }
        }
    }

    // every sector the checker believes is allocated must read allocated
    for sector in 0..n_sectors {
        if !expected[sector] && bitmap.is_free(sector) {
            log::error!("sector {sector} is in use but marked free in the bitmap");
            errors += 1;
        }
    }

    // live headers nothing points at
    for fho in 0..vhb.c_pages_file_headers {
        if reached.get(fho as usize).copied().unwrap_or(false) {
            continue;
        }
        let block = match vol.file_header_block_with(&vhb, fho) {
            Ok(block) => block,
            Err(_) => {
                log::warn!("file header {fho} lies outside the image, skipping");
                continue;
            }
        };
        // offset 4 is the first byte of sbFileName; nonzero means live
        if block[4] != 0 {
            log::error!("file header {fho} is live but reachable from no directory");
            errors += 1;
        }
    }

    Ok(errors)
}
