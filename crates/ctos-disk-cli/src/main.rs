use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;
use ctos_disk::codec;
use ctos_disk::structures::file_header::FILE_HEADER_FIELDS;
use ctos_disk::structures::vhb::VHB_FIELDS;
use ctos_disk::{DirEntry, Volume};

/// Inspect and modify Convergent CTOS/BTOS disk images.
#[derive(Debug, Parser)]
#[command(name = "ctostool", version)]
struct Args {
    /// Disk image to operate on
    image: PathBuf,

    /// Write output to a file instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Escape non-printable characters in extracted output
    #[arg(short, long, global = true)]
    escape: bool,

    /// Log everything
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Print both VHBs, the MFD, and every directory
    Dump,
    /// List the entries of one or more directories
    Listdir {
        #[arg(required = true)]
        dirs: Vec<String>,
    },
    /// Print every allocation bitmap bit as <sector>:<bit>
    Dumpbitmap,
    /// Audit the volume and report the error count
    Chkdsk,
    /// Print the decoded file header of a file
    Stat { dir: String, file: String },
    /// Write a file's contents to the output sink
    Extract { dir: String, file: String },
    /// Extract every file into <dest>/<directory>/<file>
    Extractall { dest: PathBuf },
    /// Replace a file's contents with the bytes of a local file
    Replace {
        dir: String,
        file: String,
        src: PathBuf,
    },
    /// Delete a file and free its sectors
    Delete { dir: String, file: String },
    /// Rewrite the geometry fields of both VHBs
    Setgeometry {
        cylinders: u16,
        heads: u16,
        sectors: u16,
        bytes_per_sector: u16,
    },
}

fn main() -> anyhow::Result<()> {
    ctos_disk::structures::sanity_check_all().context("field table self-check failed")?;

    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(if args.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Warn
        })
        .init()?;

    let mut volume = Volume::open(&args.image)
        .with_context(|| format!("reading {}", args.image.display()))?;

    match &args.command {
        Command::Dump => dump(&volume),
        Command::Listdir { dirs } => listdir(&volume, dirs),
        Command::Dumpbitmap => dumpbitmap(&volume),
        Command::Chkdsk => chkdsk(&volume),
        Command::Stat { dir, file } => stat(&volume, dir, file),
        Command::Extract { dir, file } => extract(&volume, dir, file, &args),
        Command::Extractall { dest } => extract_all(&volume, dest),
        Command::Replace { dir, file, src } => {
            replace(&mut volume, dir, file, src)?;
            volume.save(&args.image)?;
            Ok(())
        }
        Command::Delete { dir, file } => {
            volume.delete(dir.as_bytes(), file.as_bytes())?;
            volume.save(&args.image)?;
            Ok(())
        }
        Command::Setgeometry {
            cylinders,
            heads,
            sectors,
            bytes_per_sector,
        } => {
            volume.set_geometry(*cylinders, *heads, *sectors, *bytes_per_sector)?;
            write_output(&args.output, volume.as_bytes())
        }
    }
}

fn dump(volume: &Volume) -> anyhow::Result<()> {
    println!("== Backup VHB");
    print_record(volume.as_bytes(), VHB_FIELDS, &[])?;

    let backup = volume.backup_vhb()?;
    println!();
    println!("== Active VHB at {}", backup.lfa_vhb);
    let active = volume
        .as_bytes()
        .get(backup.lfa_vhb as usize..)
        .context("active VHB lies outside the image")?;
    print_record(active, VHB_FIELDS, &[])?;

    if let Err(e) = volume.verify_backup_checksum() {
        log::warn!("{e}");
    }
    if let Err(e) = volume.verify_active_checksum() {
        log::warn!("{e}");
    }
    volume.verify_active_matches_backup()?;

    let mfd = volume.read_mfd()?;
    println!();
    println!("== MFD");
    for entry in &mfd {
        println!(
            "{:<13} {:<13} {} ({} pages)",
            text(&entry.name),
            text(&entry.password),
            entry.lfa_dir_base,
            entry.c_pages
        );
    }
    for entry in &mfd {
        println!();
        println!("== Directory {}", text(&entry.name));
        print_dir(&volume.read_dir(&entry.name)?);
    }
    Ok(())
}

fn listdir(volume: &Volume, dirs: &[String]) -> anyhow::Result<()> {
    if let Err(e) = volume.verify_backup_checksum() {
        log::warn!("{e}");
    }
    for dir in dirs {
        print_dir(&volume.read_dir(dir.as_bytes())?);
    }
    Ok(())
}

fn print_dir(entries: &[DirEntry]) {
    println!("{:<20} {:>4} {:>8} EXTENTS", "NAME", "OFFS", "SIZE");
    for entry in entries {
        print!(
            "{:<20} {:>4} {:>8}",
            text(&entry.name),
            entry.fho,
            entry.header.cb_file
        );
        for extent in &entry.header.extents {
            print!(" <offs {}, len {}>", extent.lfa, extent.cb);
        }
        println!();
    }
}

fn dumpbitmap(volume: &Volume) -> anyhow::Result<()> {
    let bitmap = volume.read_bitmap()?;
    for (sector, free) in bitmap.iter().enumerate() {
        println!("{sector}:{}", free as u8);
    }
    Ok(())
}

fn chkdsk(volume: &Volume) -> anyhow::Result<()> {
    let errors = volume.check_disk()?;
    println!("Checkdisk complete, {errors} errors");
    if errors != 0 {
        bail!("integrity check reported {errors} errors");
    }
    Ok(())
}

fn stat(volume: &Volume, dir: &str, file: &str) -> anyhow::Result<()> {
    let fh = volume.open_file(dir.as_bytes(), file.as_bytes())?;
    let block = volume.file_header_block(fh.fho)?;
    print_record(
        block,
        FILE_HEADER_FIELDS,
        &["sbFileName", "rgLfaExtents", "rgcbExtents", "AppSpecific"],
    )?;
    println!("{:<20} {}", "name", text(fh.name()));
    print!("{:<20}", "extents");
    for extent in &fh.extents {
        print!(" <offs {}, len {}>", extent.lfa, extent.cb);
    }
    println!();
    Ok(())
}

fn print_record(
    buf: &[u8],
    table: &'static [codec::Field],
    skip: &[&str],
) -> anyhow::Result<()> {
    for (name, value) in codec::fields(&buf[..], table)? {
        if skip.contains(&name) {
            continue;
        }
        println!("{name:<20} {value}");
    }
    Ok(())
}

fn extract(volume: &Volume, dir: &str, file: &str, args: &Args) -> anyhow::Result<()> {
    let fh = volume.open_file(dir.as_bytes(), file.as_bytes())?;
    let contents = volume.retrieve(&fh);
    if args.escape {
        write_output(&args.output, hex_escape(&contents).as_bytes())
    } else {
        write_output(&args.output, &contents)
    }
}

fn extract_all(volume: &Volume, dest: &Path) -> anyhow::Result<()> {
    for entry in volume.read_mfd()? {
        let dir_name = text(&entry.name);
        if dir_name == "." || dir_name == ".." {
            log::warn!("skipping directory {dir_name}");
            continue;
        }
        let dest_dir = dest.join(safe_file_name(&dir_name));
        std::fs::create_dir_all(&dest_dir)
            .with_context(|| format!("creating {}", dest_dir.display()))?;
        for file in volume.read_dir(&entry.name)? {
            let file_name = text(&file.name);
            if file_name == "." || file_name == ".." {
                log::warn!("skipping file {file_name}");
                continue;
            }
            let contents = volume.retrieve(&file.header);
            let dest_file = dest_dir.join(safe_file_name(&file_name));
            println!("Creating {}", dest_file.display());
            std::fs::write(&dest_file, contents)
                .with_context(|| format!("writing {}", dest_file.display()))?;
        }
    }
    Ok(())
}

fn replace(volume: &mut Volume, dir: &str, file: &str, src: &Path) -> anyhow::Result<()> {
    let mut fh = volume.open_file(dir.as_bytes(), file.as_bytes())?;
    let mut bitmap = volume.read_bitmap()?;
    let src_data = std::fs::read(src).with_context(|| format!("reading {}", src.display()))?;
    volume.replace_contents(&mut fh, &mut bitmap, &src_data)?;
    Ok(())
}

fn write_output(output: &Option<PathBuf>, data: &[u8]) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?
        }
        None => std::io::stdout().write_all(data)?,
    }
    Ok(())
}

fn text(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

fn safe_file_name(name: &str) -> String {
    name.replace(['>', '/'], "_")
}

fn hex_escape(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &byte in data {
        if (0x20..=0x7e).contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("\\x{byte:02x}"));
        }
    }
    out
}
