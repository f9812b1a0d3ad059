//! End-to-end tests over a synthetic CTOS floppy image built in memory.
//!
//! The image carries one directory (`Sys`) spanning two pages, two files
//! (`Install.Sub` on page one, `Page2.File` on page two), shadow file
//! headers, and a consistent allocation bitmap, so every operation can be
//! driven against a volume whose integrity audit starts clean.

use ctos_disk::structures::MAGIC_WD;
use ctos_disk::structures::file_header::extents_len;
use ctos_disk::structures::vhb::{self, VHB_LEN, Vhb};
use ctos_disk::{DiskError, Extent, FileHeader, Volume};
use pretty_assertions::assert_eq;

const BPS: usize = 512;
const N_SECTORS: usize = 8 * 2 * 77;

const MFD_BASE: usize = 2 * BPS;
const DIR_BASE: usize = 3 * BPS;
const HEADERS_BASE: usize = 5 * BPS;
const HEADER_COUNT: u16 = 16;
const ALT_OFFSET: u16 = 8;
const BITMAP_BASE: usize = 21 * BPS;

const INSTALL_LFA: u32 = 0x8400; // sector 66
const PAGE2_LFA: u32 = 0x8600; // sector 67

fn install_content() -> Vec<u8> {
    (0..73u32).map(|i| (i * 7) as u8).collect()
}

fn make_header(fho: u16, name: &[u8], cb_file: u32, extents: Vec<Extent>) -> FileHeader {
    let mut sb_file_name = [0u8; 51];
    sb_file_name[0] = name.len() as u8;
    sb_file_name[1..1 + name.len()].copy_from_slice(name);
    let mut sb_directory_name = [0u8; 13];
    sb_directory_name[0] = 3;
    sb_directory_name[1..4].copy_from_slice(b"Sys");
    let mut fh = FileHeader {
        fho,
        lfa: HEADERS_BASE + fho as usize * BPS,
        checksum: 0,
        file_header_page_number: fho,
        sb_file_name,
        sb_file_name_password: [0; 13],
        sb_directory_name,
        file_header_number: fho,
        extension_file_header_number: 0,
        header_sequence_number: 0,
        file_class: 0,
        access_protection: 0,
        lfa_dir_page: DIR_BASE as u32,
        creation_date: 0,
        modification_date: 0,
        access_date: 0,
        expiration_date: 0,
        f_no_save: 0,
        f_no_dir_print: 0,
        f_no_delete: 0,
        cb_file,
        default_expansion: 0,
        i_free_run: extents.len() as u16,
        extents,
        reserved: [0; 71],
        app_specific: [0; 64],
    };
    fh.update_checksum();
    fh
}

fn put_dir_entry(buf: &mut [u8], at: &mut usize, name: &[u8], fho: u16) {
    buf[*at] = name.len() as u8;
    buf[*at + 1..*at + 1 + name.len()].copy_from_slice(name);
    buf[*at + 1 + name.len()..*at + 3 + name.len()].copy_from_slice(&fho.to_le_bytes());
    *at += 3 + name.len();
}

fn clear_free_bit(image: &mut [u8], sector: usize) {
    image[BITMAP_BASE + sector / 8] &= !(1 << (sector % 8));
}

fn build_image_with_cylinders(cylinders: u16) -> Vec<u8> {
    let mut image = vec![0u8; N_SECTORS * BPS];

    let mut vhb = Vhb::decode(&[0u8; VHB_LEN]).unwrap();
    vhb.magic_wd = MAGIC_WD;
    vhb.vol_name[0] = 4;
    vhb.vol_name[1..5].copy_from_slice(b"Test");
    vhb.lfa_vhb = BPS as u32;
    vhb.lfa_initial_vhb = 0;
    vhb.lfa_mfd_base = MFD_BASE as u32;
    vhb.c_paged_mfd = 1;
    vhb.lfa_file_headers_base = HEADERS_BASE as u32;
    vhb.c_pages_file_headers = HEADER_COUNT;
    vhb.alt_file_header_page_offset = ALT_OFFSET;
    vhb.lfa_alloc_bitmap_base = BITMAP_BASE as u32;
    vhb.c_pages_alloc_bitmap = 1;
    vhb.bytes_per_sector = BPS as u16;
    vhb.sectors_per_track = 8;
    vhb.tracks_per_cylinder = 2;
    vhb.cylinders_per_disk = cylinders;
    for at in [BPS, 0] {
        vhb.encode(&mut image, at).unwrap();
        vhb.checksum = vhb::compute_checksum(&image[at..at + VHB_LEN]);
        vhb.encode(&mut image, at).unwrap();
    }

    // MFD: one page, one directory
    let slot = MFD_BASE + 1;
    image[slot] = 3;
    image[slot + 1..slot + 4].copy_from_slice(b"Sys");
    image[slot + 26..slot + 30].copy_from_slice(&(DIR_BASE as u32).to_le_bytes());
    image[slot + 30..slot + 32].copy_from_slice(&2u16.to_le_bytes());

    // directory page one: Install.Sub, then the terminator
    image[DIR_BASE] = 0x01;
    let mut at = DIR_BASE + 1;
    put_dir_entry(&mut image, &mut at, b"Install.Sub", 0);
    // directory page two: parsed independently of page one
    image[DIR_BASE + BPS] = 0x01;
    let mut at = DIR_BASE + BPS + 1;
    put_dir_entry(&mut image, &mut at, b"Page2.File", 2);

    // file headers, with a shadow replica for Install.Sub
    let install = make_header(0, b"Install.Sub", 73, vec![Extent { lfa: INSTALL_LFA, cb: 512 }]);
    image[install.lfa..install.lfa + BPS].copy_from_slice(&install.encode());
    let shadow_lfa = HEADERS_BASE + (ALT_OFFSET as usize) * BPS;
    image[shadow_lfa..shadow_lfa + BPS].copy_from_slice(&install.encode());

    let page2 = make_header(2, b"Page2.File", 10, vec![Extent { lfa: PAGE2_LFA, cb: 10 }]);
    image[page2.lfa..page2.lfa + BPS].copy_from_slice(&page2.encode());

    // contents
    let content = install_content();
    image[INSTALL_LFA as usize..INSTALL_LFA as usize + content.len()].copy_from_slice(&content);
    image[PAGE2_LFA as usize..PAGE2_LFA as usize + 10].copy_from_slice(b"0123456789");

    // bitmap: everything free, then the occupied sectors
    for byte in 0..N_SECTORS / 8 {
        image[BITMAP_BASE + byte] = 0xFF;
    }
    for sector in 0..22 {
        clear_free_bit(&mut image, sector);
    }
    clear_free_bit(&mut image, 66);
    clear_free_bit(&mut image, 67);

    image
}

fn build_volume() -> Volume {
    Volume::from_bytes(build_image_with_cylinders(77))
}

#[test]
fn test_fresh_image_audits_clean() {
    let vol = build_volume();
    vol.verify_backup_checksum().unwrap();
    vol.verify_active_checksum().unwrap();
    assert_eq!(vol.verify_active_matches_backup().unwrap(), 0);
    assert_eq!(vol.check_disk().unwrap(), 0);
}

#[test]
fn test_mfd_and_directory_listing() {
    let vol = build_volume();
    let mfd = vol.read_mfd().unwrap();
    assert_eq!(mfd.len(), 1);
    assert_eq!(mfd[0].name, b"Sys");
    assert_eq!(mfd[0].c_pages, 2);

    // the page-one terminator must not hide the page-two entry
    let entries = vol.read_dir(b"Sys").unwrap();
    let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
    assert_eq!(names, vec![b"Install.Sub".as_slice(), b"Page2.File".as_slice()]);
}

#[test]
fn test_extract_round_trip() {
    let vol = build_volume();
    let fh = vol.open_file(b"Sys", b"Install.Sub").unwrap();
    assert_eq!(fh.cb_file, 73);
    assert_eq!(fh.extents, vec![Extent { lfa: INSTALL_LFA, cb: 512 }]);
    assert_eq!(vol.retrieve(&fh), install_content());
}

#[test]
fn test_open_file_failures() {
    let vol = build_volume();
    assert!(matches!(
        vol.open_file(b"Nope", b"Install.Sub"),
        Err(DiskError::DirectoryNotFound(_))
    ));
    assert!(matches!(
        vol.open_file(b"Sys", b"Nope.Txt"),
        Err(DiskError::FileNotFound(_))
    ));
    // lookups ignore ASCII case
    assert!(vol.open_file(b"SYS", b"install.sub").is_ok());
}

#[test]
fn test_replace_with_grow() {
    let mut vol = build_volume();
    let mut fh = vol.open_file(b"Sys", b"Install.Sub").unwrap();
    let mut bitmap = vol.read_bitmap().unwrap();

    let src: Vec<u8> = (0..1200).map(|i| b'A' + (i % 26) as u8).collect();
    vol.replace_contents(&mut fh, &mut bitmap, &src).unwrap();

    assert_eq!(fh.cb_file, 1200);
    // sector 66 was freed first, so the lowest free run is 22..25 and the
    // three sectors merge into a single extent
    assert_eq!(fh.extents, vec![Extent { lfa: 22 * 512, cb: 1536 }]);
    assert!(extents_len(&fh.extents) >= 1200);
    assert!(extents_len(&fh.extents) < 1200 + 512);

    assert_eq!(vol.check_disk().unwrap(), 0);
    let reread = vol.open_file(b"Sys", b"Install.Sub").unwrap();
    assert_eq!(vol.retrieve(&reread), src);
    // the old sector is free again, the new ones are not
    let bitmap = vol.read_bitmap().unwrap();
    assert!(bitmap.is_free(66));
    assert!(!bitmap.is_free(22));
    assert!(!bitmap.is_free(24));
}

#[test]
fn test_replace_updates_shadow_identically() {
    let mut vol = build_volume();
    let mut fh = vol.open_file(b"Sys", b"Install.Sub").unwrap();
    let mut bitmap = vol.read_bitmap().unwrap();
    vol.replace_contents(&mut fh, &mut bitmap, b"shadow me").unwrap();

    let primary = vol.file_header_block(0).unwrap().to_vec();
    let shadow = vol.file_header_block(ALT_OFFSET).unwrap().to_vec();
    assert_eq!(primary, shadow);
}

#[test]
fn test_replace_with_empty_contents() {
    let mut vol = build_volume();
    let mut fh = vol.open_file(b"Sys", b"Install.Sub").unwrap();
    let mut bitmap = vol.read_bitmap().unwrap();
    vol.replace_contents(&mut fh, &mut bitmap, b"").unwrap();

    assert_eq!(fh.cb_file, 0);
    assert!(fh.extents.is_empty());
    assert_eq!(vol.check_disk().unwrap(), 0);
    let reread = vol.open_file(b"Sys", b"Install.Sub").unwrap();
    assert_eq!(vol.retrieve(&reread), b"");
}

#[test]
fn test_replace_too_fragmented() {
    let mut vol = build_volume();
    let mut fh = vol.open_file(b"Sys", b"Install.Sub").unwrap();
    let mut bitmap = vol.read_bitmap().unwrap();
    // drain every free sector, then open 33 isolated one-sector holes
    while bitmap.allocate().is_some() {}
    for i in 0..33 {
        bitmap.free(100 + 2 * i);
    }
    let src = vec![0xAB; 33 * 512];
    assert!(matches!(
        vol.replace_contents(&mut fh, &mut bitmap, &src),
        Err(DiskError::TooFragmented)
    ));
}

#[test]
fn test_replace_without_free_sectors() {
    let mut vol = build_volume();
    let mut fh = vol.open_file(b"Sys", b"Install.Sub").unwrap();
    let mut bitmap = vol.read_bitmap().unwrap();
    while bitmap.allocate().is_some() {}
    // the truncate inside replace frees exactly one sector; two are needed
    assert!(matches!(
        vol.replace_contents(&mut fh, &mut bitmap, &vec![1u8; 1024]),
        Err(DiskError::NoFreeSector)
    ));
}

#[test]
fn test_delete_frees_sectors() {
    let mut vol = build_volume();
    vol.delete(b"Sys", b"Install.Sub").unwrap();

    let bitmap = vol.read_bitmap().unwrap();
    assert!(bitmap.is_free(66));
    // primary and shadow headers both carry the deletion sentinel
    assert_eq!(vol.file_header_block(0).unwrap()[4], 0);
    assert_eq!(vol.file_header_block(ALT_OFFSET).unwrap()[4], 0);
    // the directory entry is gone, its neighbor survives
    let names: Vec<Vec<u8>> = vol
        .read_dir(b"Sys")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![b"Page2.File".to_vec()]);
    assert!(matches!(
        vol.open_file(b"Sys", b"Install.Sub"),
        Err(DiskError::FileNotFound(_))
    ));
    assert_eq!(vol.check_disk().unwrap(), 0);
}

#[test]
fn test_set_geometry_rewrites_both_vhbs() {
    let mut vol = build_volume();
    vol.set_geometry(77, 2, 9, 512).unwrap();

    let backup = vol.backup_vhb().unwrap();
    let active = vol.active_vhb().unwrap();
    assert_eq!(backup.sectors_per_track, 9);
    assert_eq!(active.sectors_per_track, 9);
    assert_eq!(backup.tracks_per_cylinder, 2);
    assert_eq!(backup.cylinders_per_disk, 77);
    assert_eq!(backup.bytes_per_sector, 512);

    vol.verify_backup_checksum().unwrap();
    vol.verify_active_checksum().unwrap();
    assert_eq!(vol.verify_active_matches_backup().unwrap(), 0);
}

#[test]
fn test_check_disk_reports_double_allocation() {
    let mut image = build_image_with_cylinders(77);
    // a third file whose extent collides with Install.Sub's sector
    let overlap = make_header(1, b"Overlap.Bin", 100, vec![Extent { lfa: INSTALL_LFA, cb: 512 }]);
    image[overlap.lfa..overlap.lfa + BPS].copy_from_slice(&overlap.encode());
    let mut at = DIR_BASE + 1 + (1 + b"Install.Sub".len() + 2);
    put_dir_entry(&mut image, &mut at, b"Overlap.Bin", 1);

    let vol = Volume::from_bytes(image);
    let errors = vol.check_disk().unwrap();
    assert_eq!(errors, 1);
}

#[test]
fn test_check_disk_reports_orphan_header() {
    let mut image = build_image_with_cylinders(77);
    // a live header no directory points at
    let orphan = make_header(3, b"Lost.Dat", 0, Vec::new());
    image[orphan.lfa..orphan.lfa + BPS].copy_from_slice(&orphan.encode());

    let vol = Volume::from_bytes(image);
    assert_eq!(vol.check_disk().unwrap(), 1);
}

#[test]
fn test_check_disk_reports_bitmap_mismatch() {
    let mut image = build_image_with_cylinders(77);
    // the bitmap claims Install.Sub's sector is free
    image[BITMAP_BASE + 66 / 8] |= 1 << (66 % 8);

    let vol = Volume::from_bytes(image);
    // reported once while walking the extent, once by the cross-check
    assert_eq!(vol.check_disk().unwrap(), 2);
}

#[test]
fn test_cylinders_per_disk_fixup() {
    let image = build_image_with_cylinders(2);
    let on_disk = image.clone();
    let vol = Volume::from_bytes(image);

    assert_eq!(vol.active_vhb().unwrap().cylinders_per_disk, 77);
    // the fixup is in-memory only; the buffer is untouched
    assert_eq!(vol.backup_vhb().unwrap().cylinders_per_disk, 2);
    assert_eq!(vol.as_bytes(), on_disk.as_slice());
}

#[test]
fn test_save_and_reopen() {
    let vol = build_volume();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("floppy.img");
    vol.save(&path).unwrap();

    let reopened = Volume::open(&path).unwrap();
    assert_eq!(reopened.as_bytes(), vol.as_bytes());
    assert_eq!(reopened.check_disk().unwrap(), 0);
}
