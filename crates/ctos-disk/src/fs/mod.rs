//! The volume engine: an owned image buffer and the operations over it.
//!
//! A [`Volume`] owns the raw image bytes. Read operations take `&self`;
//! every mutating operation takes `&mut self` and completes fully (content,
//! header, shadow header, bitmap) before the next one starts. There is no
//! suspension point anywhere; the caller serializes access.

mod check;

use std::cell::Cell;
use std::path::Path;

use crate::codec;
use crate::structures::SECTOR_SIZE;
use crate::structures::bitmap::AllocBitmap;
use crate::structures::directory;
use crate::structures::file_header::{
    self, Extent, FILE_HEADER_LEN, FileHeader, MAX_EXTENTS,
};
use crate::structures::mfd::{self, MfdEntry};
use crate::structures::vhb::{self, VHB_FIELDS, VHB_LEN, Vhb};
use crate::{ChecksumOwner, DiskError};

/// One file listed in a directory.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Name as stored on the directory page.
    pub name: Vec<u8>,
    /// File header offset the page points at.
    pub fho: u16,
    /// The header itself.
    pub header: FileHeader,
}

/// A CTOS disk image held in memory.
pub struct Volume {
    data: Vec<u8>,
    // warn-once latch for the CylindersPerDisk fixup
    cpd_warned: Cell<bool>,
}

impl core::fmt::Debug for Volume {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Volume")
            .field("len", &self.data.len())
            .finish()
    }
}

impl Volume {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            cpd_warned: Cell::new(false),
        }
    }

    /// Read an image file in one call.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DiskError> {
        Ok(Self::from_bytes(std::fs::read(path)?))
    }

    /// Write the image back in one call.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DiskError> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Decode the backup VHB at image offset 0.
    pub fn backup_vhb(&self) -> Result<Vhb, DiskError> {
        Vhb::decode(&self.data)
    }

    /// Decode the active VHB at the offset named by the backup copy.
    ///
    /// Applies one in-memory compatibility fixup: a known malformed image
    /// reports 2 cylinders per disk where 77 is meant. The on-disk bytes are
    /// never changed here; `set_geometry` is the only writer.
    pub fn active_vhb(&self) -> Result<Vhb, DiskError> {
        let backup = self.backup_vhb()?;
        let at = backup.lfa_vhb as usize;
        let mut active = Vhb::decode(self.data.get(at..).ok_or(DiskError::Truncated {
            needed: at + VHB_LEN,
            got: self.data.len(),
        })?)?;
        if active.cylinders_per_disk == 2 {
            if !self.cpd_warned.replace(true) {
                log::warn!("VHB reports 2 cylinders per disk, assuming 77");
            }
            active.cylinders_per_disk = 77;
        }
        Ok(active)
    }

    /// Verify the backup VHB checksum.
    pub fn verify_backup_checksum(&self) -> Result<(), DiskError> {
        vhb::verify_checksum(&self.data, ChecksumOwner::BackupVhb)
    }

    /// Verify the active VHB checksum.
    pub fn verify_active_checksum(&self) -> Result<(), DiskError> {
        let at = self.backup_vhb()?.lfa_vhb as usize;
        let record = self.data.get(at..).ok_or(DiskError::Truncated {
            needed: at + VHB_LEN,
            got: self.data.len(),
        })?;
        vhb::verify_checksum(record, ChecksumOwner::ActiveVhb)
    }

    /// Compare every field of the backup VHB against the active copy,
    /// logging each difference. Returns the number of mismatching fields.
    pub fn verify_active_matches_backup(&self) -> Result<usize, DiskError> {
        let at = self.backup_vhb()?.lfa_vhb as usize;
        let active = self.data.get(at..).ok_or(DiskError::Truncated {
            needed: at + VHB_LEN,
            got: self.data.len(),
        })?;
        let backup_fields = codec::fields(&self.data, VHB_FIELDS)?;
        let active_fields = codec::fields(active, VHB_FIELDS)?;
        let mut mismatches = 0;
        for ((name, b), (_, a)) in backup_fields.zip(active_fields) {
            if a != b {
                log::warn!("active/backup VHB mismatch (field={name}, backup={b}, active={a})");
                mismatches += 1;
            }
        }
        Ok(mismatches)
    }

    /// Enumerate the MFD in on-disk order.
    pub fn read_mfd(&self) -> Result<Vec<MfdEntry>, DiskError> {
        let vhb = self.active_vhb()?;
        mfd::read_mfd(&self.data, &vhb)
    }

    /// Enumerate a directory's entries, loading each file header.
    pub fn read_dir(&self, name: &[u8]) -> Result<Vec<DirEntry>, DiskError> {
        let vhb = self.active_vhb()?;
        let mfd = mfd::read_mfd(&self.data, &vhb)?;
        let entry = mfd::find(&mfd, name)
            .ok_or_else(|| DiskError::DirectoryNotFound(display(name)))?;
        self.read_dir_entries(&vhb, entry)
    }

    pub(crate) fn read_dir_entries(
        &self,
        vhb: &Vhb,
        mfd_entry: &MfdEntry,
    ) -> Result<Vec<DirEntry>, DiskError> {
        let bps = vhb.bytes_per_sector as usize;
        let mut out = Vec::new();
        for page in 0..mfd_entry.c_pages as usize {
            let start = mfd_entry.lfa_dir_base as usize + page * bps;
            let page_bytes = self
                .data
                .get(start..start + bps)
                .ok_or(DiskError::Truncated {
                    needed: start + bps,
                    got: self.data.len(),
                })?;
            for raw in directory::parse_page(page_bytes) {
                let header = match self.read_file_header_with(vhb, raw.fho) {
                    Ok(header) => header,
                    Err(DiskError::HeaderOutOfRange(fho)) => {
                        log::warn!("file header {fho} lies outside the image, skipping");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if header.name() != raw.name {
                    log::warn!(
                        "file header name mismatch: directory says {}, header says {}",
                        display(raw.name),
                        display(header.name())
                    );
                }
                out.push(DirEntry {
                    name: raw.name.to_vec(),
                    fho: raw.fho,
                    header,
                });
            }
        }
        Ok(out)
    }

    /// Load the file header at `fho`.
    pub fn read_file_header(&self, fho: u16) -> Result<FileHeader, DiskError> {
        let vhb = self.active_vhb()?;
        self.read_file_header_with(&vhb, fho)
    }

    fn read_file_header_with(&self, vhb: &Vhb, fho: u16) -> Result<FileHeader, DiskError> {
        let block = self.file_header_block_with(vhb, fho)?;
        FileHeader::decode(block, fho, header_lfa(vhb, fho))
    }

    /// The raw 512-byte block of a file header, as stored on disk.
    pub fn file_header_block(&self, fho: u16) -> Result<&[u8], DiskError> {
        let vhb = self.active_vhb()?;
        self.file_header_block_with(&vhb, fho)
    }

    fn file_header_block_with(&self, vhb: &Vhb, fho: u16) -> Result<&[u8], DiskError> {
        let at = header_lfa(vhb, fho);
        self.data
            .get(at..at + FILE_HEADER_LEN)
            .ok_or(DiskError::HeaderOutOfRange(fho))
    }

    /// Resolve a directory and file name to the file's header.
    pub fn open_file(&self, dir: &[u8], file: &[u8]) -> Result<FileHeader, DiskError> {
        self.read_dir(dir)?
            .into_iter()
            .find(|e| e.name.eq_ignore_ascii_case(file))
            .map(|e| e.header)
            .ok_or_else(|| DiskError::FileNotFound(display(file)))
    }

    /// Unpack the allocation bitmap.
    pub fn read_bitmap(&self) -> Result<AllocBitmap, DiskError> {
        let vhb = self.active_vhb()?;
        AllocBitmap::read(&self.data, &vhb)
    }

    /// Flush an in-memory bitmap back into the image.
    pub fn write_bitmap(&mut self, bitmap: &AllocBitmap) -> Result<(), DiskError> {
        let vhb = self.active_vhb()?;
        bitmap.write(&mut self.data, &vhb)
    }

    /// Concatenate a file's extents and trim to its exact byte length.
    pub fn retrieve(&self, fh: &FileHeader) -> Vec<u8> {
        let mut out = Vec::with_capacity(fh.cb_file as usize);
        for extent in &fh.extents {
            let start = extent.lfa as usize;
            let end = start + extent.cb as usize;
            match self.data.get(start..end) {
                Some(span) => out.extend_from_slice(span),
                None => {
                    log::warn!(
                        "extent at {:#x}+{} of {} runs past the image, skipping",
                        extent.lfa,
                        extent.cb,
                        display(fh.name())
                    );
                }
            }
        }
        out.truncate(fh.cb_file as usize);
        out
    }

    /// Free every sector covered by the file's extents and clear the extent
    /// list. The header is not rewritten here; the caller does that.
    pub fn truncate_contents(&mut self, fh: &mut FileHeader, bitmap: &mut AllocBitmap) {
        for extent in &fh.extents {
            // the allocator only ever hands out sector-aligned extents
            assert!(
                extent.lfa as usize % SECTOR_SIZE == 0,
                "extent start {:#x} is not sector-aligned",
                extent.lfa
            );
            let first = extent.lfa as usize / SECTOR_SIZE;
            let count = (extent.cb as usize).div_ceil(SECTOR_SIZE);
            for sector in first..first + count {
                bitmap.free(sector);
            }
        }
        fh.extents.clear();
    }

    /// Replace a file's contents with `src`, reallocating its sectors.
    ///
    /// Sectors are claimed in ascending index order and contiguous runs are
    /// merged into one extent. On success the header (and shadow), the
    /// bitmap, and the content sectors are all written, and the contents
    /// have been read back and compared against `src`.
    pub fn replace_contents(
        &mut self,
        fh: &mut FileHeader,
        bitmap: &mut AllocBitmap,
        src: &[u8],
    ) -> Result<(), DiskError> {
        let vhb = self.active_vhb()?;
        self.truncate_contents(fh, bitmap);

        for chunk in src.chunks(SECTOR_SIZE) {
            let sector = bitmap.allocate().ok_or(DiskError::NoFreeSector)?;
            let lfa = sector * SECTOR_SIZE;
            let got = self.data.len();
            let dest = self
                .data
                .get_mut(lfa..lfa + SECTOR_SIZE)
                .ok_or(DiskError::Truncated {
                    needed: lfa + SECTOR_SIZE,
                    got,
                })?;
            dest[..chunk.len()].copy_from_slice(chunk);
            dest[chunk.len()..].fill(0);

            match fh.extents.last_mut() {
                Some(tail) if tail.lfa as usize + tail.cb as usize == lfa => {
                    tail.cb += SECTOR_SIZE as u32;
                }
                _ => {
                    if fh.extents.len() == MAX_EXTENTS {
                        return Err(DiskError::TooFragmented);
                    }
                    fh.extents.push(Extent {
                        lfa: lfa as u32,
                        cb: SECTOR_SIZE as u32,
                    });
                }
            }
        }
        fh.cb_file = src.len() as u32;

        fh.update_checksum();
        self.write_file_header(&vhb, fh)?;
        bitmap.write(&mut self.data, &vhb)?;

        let reread = self.read_file_header_with(&vhb, fh.fho)?;
        if self.retrieve(&reread) != src {
            return Err(DiskError::VerificationFailed);
        }
        Ok(())
    }

    /// Serialize a header at its slot and mirror it into the shadow slot
    /// when the volume carries alternate headers and the shadow still
    /// belongs to this file. The shadow checksum is recomputed over the
    /// shadow's own bytes.
    pub fn write_file_header(&mut self, vhb: &Vhb, fh: &FileHeader) -> Result<(), DiskError> {
        let block = fh.encode();
        self.data
            .get_mut(fh.lfa..fh.lfa + FILE_HEADER_LEN)
            .ok_or(DiskError::HeaderOutOfRange(fh.fho))?
            .copy_from_slice(&block);

        let alt = vhb.alt_file_header_page_offset;
        if alt == 0 {
            return Ok(());
        }
        let Some(shadow_fho) = fh.fho.checked_add(alt) else {
            return Ok(());
        };
        let at = header_lfa(vhb, shadow_fho);
        let Some(slot) = self.data.get_mut(at..at + FILE_HEADER_LEN) else {
            log::warn!("shadow header {shadow_fho} lies outside the image");
            return Ok(());
        };
        if file_header::peek_header_number(slot) == Some(fh.file_header_number) {
            let mut shadow = block;
            file_header::restamp_checksum(&mut shadow);
            slot.copy_from_slice(&shadow);
        }
        Ok(())
    }

    /// Delete a file: free its sectors, drop its directory entry, mark the
    /// header (and shadow) deleted, then audit the whole volume. A nonzero
    /// audit is fatal and the image must not be saved.
    pub fn delete(&mut self, dir: &[u8], file: &[u8]) -> Result<(), DiskError> {
        let vhb = self.active_vhb()?;
        let mut fh = self.open_file(dir, file)?;
        let mut bitmap = AllocBitmap::read(&self.data, &vhb)?;

        self.truncate_contents(&mut fh, &mut bitmap);
        bitmap.write(&mut self.data, &vhb)?;
        self.remove_dir_entry(&vhb, dir, file)?;
        fh.mark_deleted();
        fh.update_checksum();
        self.write_file_header(&vhb, &fh)?;

        let errors = self.check_disk()?;
        if errors != 0 {
            return Err(DiskError::IntegrityCheckFailed(errors));
        }
        Ok(())
    }

    fn remove_dir_entry(
        &mut self,
        vhb: &Vhb,
        dir: &[u8],
        file: &[u8],
    ) -> Result<(), DiskError> {
        let mfd = mfd::read_mfd(&self.data, vhb)?;
        let entry = mfd::find(&mfd, dir)
            .ok_or_else(|| DiskError::DirectoryNotFound(display(dir)))?;
        let bps = vhb.bytes_per_sector as usize;
        for page in 0..entry.c_pages as usize {
            let start = entry.lfa_dir_base as usize + page * bps;
            let page_bytes = self
                .data
                .get(start..start + bps)
                .ok_or(DiskError::Truncated {
                    needed: start + bps,
                    got: self.data.len(),
                })?;
            let found = directory::parse_page(page_bytes)
                .into_iter()
                .find(|r| r.name.eq_ignore_ascii_case(file))
                .map(|r| (r.offset, r.encoded_len()));
            if let Some((offset, len)) = found {
                directory::remove_from_page(&mut self.data[start..start + bps], offset, len);
                return Ok(());
            }
        }
        Err(DiskError::FileNotFound(display(file)))
    }

    /// Rewrite the geometry fields of both VHB copies and re-checksum them.
    /// The active copy is rewritten at `LfaVHB`, the backup copy at
    /// `LfaInitialVHB`.
    pub fn set_geometry(
        &mut self,
        cylinders: u16,
        heads: u16,
        sectors: u16,
        bytes_per_sector: u16,
    ) -> Result<(), DiskError> {
        for active in [true, false] {
            let mut vhb = if active {
                self.active_vhb()?
            } else {
                self.backup_vhb()?
            };
            let at = if active {
                vhb.lfa_vhb as usize
            } else {
                vhb.lfa_initial_vhb as usize
            };
            vhb.bytes_per_sector = bytes_per_sector;
            vhb.sectors_per_track = sectors;
            vhb.tracks_per_cylinder = heads;
            vhb.cylinders_per_disk = cylinders;
            vhb.encode(&mut self.data, at)?;
            vhb.checksum = vhb::compute_checksum(&self.data[at..at + VHB_LEN]);
            vhb.encode(&mut self.data, at)?;

            let reread = Vhb::decode(&self.data[at..])?;
            if reread != vhb {
                log::error!(
                    "{} VHB did not round-trip after re-encoding",
                    if active { "active" } else { "backup" }
                );
            }
        }
        Ok(())
    }

    /// Audit the whole volume for mutual consistency of directories, file
    /// headers, extents and the allocation bitmap. Returns the error count;
    /// every finding is logged on the diagnostic channel.
    pub fn check_disk(&self) -> Result<u32, DiskError> {
        check::run(self)
    }
}

fn header_lfa(vhb: &Vhb, fho: u16) -> usize {
    vhb.lfa_file_headers_base as usize + fho as usize * FILE_HEADER_LEN
}

/// Lossy text rendering of an on-disk name, for messages only.
pub(crate) fn display(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}
