//! File headers: one 512-byte record per file, aligned in the file-header
//! region at `LfaFileHeadersbase + fho * 512`.
//!
//! A header names its file, points back at its directory, and lists up to 32
//! extents of content. When the VHB's `AltFileHeaderPageOffset` is nonzero,
//! each header has a shadow copy `AltFileHeaderPageOffset` slots later;
//! the shadow is a replica only while its `FileHeaderNumber` matches the
//! primary's. A deleted header has the first byte of `sbFileName` zeroed,
//! everything else is left in place.

use crate::DiskError;
use crate::codec::{Field, RecordView, RecordWriter, field, pascal_str};
use crate::structures::MAGIC_WD;

pub const FILE_HEADER_FIELDS: &[Field] = &[
    field(0, 2, "Checksum"),
    field(2, 2, "FileHeaderPageNumber"),
    field(4, 51, "sbFileName"),
    field(55, 13, "sbFileNamePassword"),
    field(68, 13, "sbDirectoryName"),
    field(81, 2, "FileHeaderNumber"),
    field(83, 2, "ExtensionFileHeaderNumber"),
    field(85, 1, "bHeaderSequenceNumber"),
    field(86, 1, "bFileClass"),
    field(87, 1, "bAccessProtection"),
    field(88, 4, "lfaDirPage"),
    field(92, 4, "CreationDate"),
    field(96, 4, "ModificationDate"),
    field(100, 4, "AccessDate"),
    field(104, 4, "ExpirationDate"),
    field(108, 1, "fNoSave"),
    field(109, 1, "fNoDirPrint"),
    field(110, 1, "fNoDelete"),
    field(111, 4, "cbFile"),
    field(115, 4, "defaultExpansion"),
    field(119, 2, "iFreeRun"),
    field(121, 128, "rgLfaExtents"),
    field(249, 128, "rgcbExtents"),
    field(377, 71, "Reserved"),
    field(448, 64, "AppSpecific"),
];

/// Byte length of one file header.
pub const FILE_HEADER_LEN: usize = 512;

/// Extent slots per header.
pub const MAX_EXTENTS: usize = 32;

/// Byte offset of `FileHeaderNumber` within the record, for peeking at a
/// shadow without decoding it.
pub const FILE_HEADER_NUMBER_OFFSET: usize = 81;

/// A contiguous span of sectors holding part of a file's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Byte offset of the extent start; always a multiple of 512.
    pub lfa: u32,
    /// Byte length held in this extent.
    pub cb: u32,
}

/// A decoded file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Index of this header within the file-header region.
    pub fho: u16,
    /// Absolute byte offset of the primary copy in the image.
    pub lfa: usize,

    pub checksum: u16,
    pub file_header_page_number: u16,
    pub sb_file_name: [u8; 51],
    pub sb_file_name_password: [u8; 13],
    pub sb_directory_name: [u8; 13],
    pub file_header_number: u16,
    pub extension_file_header_number: u16,
    pub header_sequence_number: u8,
    pub file_class: u8,
    pub access_protection: u8,
    pub lfa_dir_page: u32,
    pub creation_date: u32,
    pub modification_date: u32,
    pub access_date: u32,
    pub expiration_date: u32,
    pub f_no_save: u8,
    pub f_no_dir_print: u8,
    pub f_no_delete: u8,
    pub cb_file: u32,
    pub default_expansion: u32,
    pub i_free_run: u16,
    /// In-use extents, in on-disk slot order.
    pub extents: Vec<Extent>,
    pub reserved: [u8; 71],
    pub app_specific: [u8; 64],
}

impl FileHeader {
    pub fn decode(buf: &[u8], fho: u16, lfa: usize) -> Result<Self, DiskError> {
        let v = RecordView::new(buf, FILE_HEADER_FIELDS)?;
        let i_free_run = v.u16("iFreeRun");
        let rg_lfa = v.bytes("rgLfaExtents");
        let rg_cb = v.bytes("rgcbExtents");
        let mut extents = Vec::new();
        for i in 0..MAX_EXTENTS.min(i_free_run as usize) {
            let at = i * 4;
            let lfa = u32::from_le_bytes(rg_lfa[at..at + 4].try_into().unwrap());
            if lfa == 0 {
                continue;
            }
            let cb = u32::from_le_bytes(rg_cb[at..at + 4].try_into().unwrap());
            extents.push(Extent { lfa, cb });
        }
        Ok(Self {
            fho,
            lfa,
            checksum: v.u16("Checksum"),
            file_header_page_number: v.u16("FileHeaderPageNumber"),
            sb_file_name: v.bytes("sbFileName").try_into().unwrap(),
            sb_file_name_password: v.bytes("sbFileNamePassword").try_into().unwrap(),
            sb_directory_name: v.bytes("sbDirectoryName").try_into().unwrap(),
            file_header_number: v.u16("FileHeaderNumber"),
            extension_file_header_number: v.u16("ExtensionFileHeaderNumber"),
            header_sequence_number: v.u8("bHeaderSequenceNumber"),
            file_class: v.u8("bFileClass"),
            access_protection: v.u8("bAccessProtection"),
            lfa_dir_page: v.u32("lfaDirPage"),
            creation_date: v.u32("CreationDate"),
            modification_date: v.u32("ModificationDate"),
            access_date: v.u32("AccessDate"),
            expiration_date: v.u32("ExpirationDate"),
            f_no_save: v.u8("fNoSave"),
            f_no_dir_print: v.u8("fNoDirPrint"),
            f_no_delete: v.u8("fNoDelete"),
            cb_file: v.u32("cbFile"),
            default_expansion: v.u32("defaultExpansion"),
            i_free_run,
            extents,
            reserved: v.bytes("Reserved").try_into().unwrap(),
            app_specific: v.bytes("AppSpecific").try_into().unwrap(),
        })
    }

    /// Serialize to a 512-byte block. The extent arrays are rewritten from
    /// the in-memory extent list (unused slots zeroed) and `iFreeRun` is the
    /// number of in-use slots.
    pub fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut rg_lfa = [0u8; 128];
        let mut rg_cb = [0u8; 128];
        for (i, e) in self.extents.iter().enumerate() {
            let at = i * 4;
            rg_lfa[at..at + 4].copy_from_slice(&e.lfa.to_le_bytes());
            rg_cb[at..at + 4].copy_from_slice(&e.cb.to_le_bytes());
        }

        let mut buf = [0u8; FILE_HEADER_LEN];
        let mut w = RecordWriter::new(&mut buf, FILE_HEADER_FIELDS, 0).unwrap();
        w.u16("Checksum", self.checksum);
        w.u16("FileHeaderPageNumber", self.file_header_page_number);
        w.bytes("sbFileName", &self.sb_file_name).unwrap();
        w.bytes("sbFileNamePassword", &self.sb_file_name_password)
            .unwrap();
        w.bytes("sbDirectoryName", &self.sb_directory_name).unwrap();
        w.u16("FileHeaderNumber", self.file_header_number);
        w.u16("ExtensionFileHeaderNumber", self.extension_file_header_number);
        w.u8("bHeaderSequenceNumber", self.header_sequence_number);
        w.u8("bFileClass", self.file_class);
        w.u8("bAccessProtection", self.access_protection);
        w.u32("lfaDirPage", self.lfa_dir_page);
        w.u32("CreationDate", self.creation_date);
        w.u32("ModificationDate", self.modification_date);
        w.u32("AccessDate", self.access_date);
        w.u32("ExpirationDate", self.expiration_date);
        w.u8("fNoSave", self.f_no_save);
        w.u8("fNoDirPrint", self.f_no_dir_print);
        w.u8("fNoDelete", self.f_no_delete);
        w.u32("cbFile", self.cb_file);
        w.u32("defaultExpansion", self.default_expansion);
        w.u16("iFreeRun", self.extents.len() as u16);
        w.bytes("rgLfaExtents", &rg_lfa).unwrap();
        w.bytes("rgcbExtents", &rg_cb).unwrap();
        w.bytes("Reserved", &self.reserved).unwrap();
        w.bytes("AppSpecific", &self.app_specific).unwrap();
        buf
    }

    /// Filename payload (without the length prefix). Empty for a deleted or
    /// malformed header.
    pub fn name(&self) -> &[u8] {
        pascal_str(&self.sb_file_name).unwrap_or(&[])
    }

    /// Directory name payload.
    pub fn directory_name(&self) -> &[u8] {
        pascal_str(&self.sb_directory_name).unwrap_or(&[])
    }

    pub fn is_deleted(&self) -> bool {
        self.sb_file_name[0] == 0
    }

    /// Zero the first filename byte, leaving everything else for forensic
    /// recovery.
    pub fn mark_deleted(&mut self) {
        self.sb_file_name[0] = 0;
    }

    /// Recompute the stored checksum so the encoded block sums to zero.
    pub fn update_checksum(&mut self) {
        self.checksum = 0;
        let mut block = self.encode();
        restamp_checksum(&mut block);
        self.checksum = u16::from_le_bytes([block[0], block[1]]);
    }

    /// True when the serialized header carries a valid checksum.
    pub fn check_checksum(&self) -> bool {
        block_checksum_ok(&self.encode())
    }
}

fn word(block: &[u8], i: usize) -> u16 {
    u16::from_le_bytes(block[2 * i..2 * i + 2].try_into().unwrap())
}

/// Verify an encoded header block: seeding with the magic word and
/// subtracting all 256 little-endian words must yield zero.
pub fn block_checksum_ok(block: &[u8]) -> bool {
    if block.len() < FILE_HEADER_LEN {
        return false;
    }
    let mut w = MAGIC_WD;
    for i in 0..FILE_HEADER_LEN / 2 {
        w = w.wrapping_sub(word(block, i));
    }
    w == 0
}

/// Stamp a fresh checksum into an encoded header block.
pub fn restamp_checksum(block: &mut [u8; FILE_HEADER_LEN]) {
    block[0] = 0;
    block[1] = 0;
    let mut sum = 0u16;
    for i in 0..FILE_HEADER_LEN / 2 {
        sum = sum.wrapping_add(word(block, i));
    }
    let checksum = MAGIC_WD.wrapping_sub(sum);
    block[0..2].copy_from_slice(&checksum.to_le_bytes());
}

/// Peek at the `FileHeaderNumber` of an encoded header block.
pub fn peek_header_number(block: &[u8]) -> Option<u16> {
    let at = FILE_HEADER_NUMBER_OFFSET;
    Some(u16::from_le_bytes(block.get(at..at + 2)?.try_into().unwrap()))
}

/// Byte length of a file implied by its extents, for sanity checks: at least
/// `cbFile`, less than `cbFile + 512` for any live file.
pub fn extents_len(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.cb as u64).sum()
}
