//! Table-driven decoding and encoding of fixed binary record layouts.
//!
//! Every on-disk record (VHB, MFD entry, file header, bad-block table) is
//! described by a field table: a sequence of `(offset, size, name)` tuples.
//! Fields of size 1, 2 or 4 are little-endian unsigned integers; any other
//! size is a raw byte buffer. The tables live next to the typed record
//! structs that decode through them, so a single decoder serves every layout.

use crate::DiskError;

/// One field of a fixed-size record.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub offset: usize,
    pub size: usize,
    pub name: &'static str,
}

/// Shorthand for building field tables as const data.
pub const fn field(offset: usize, size: usize, name: &'static str) -> Field {
    Field { offset, size, name }
}

/// Total byte length covered by a table.
pub fn record_len(table: &[Field]) -> usize {
    table.iter().map(|f| f.size).sum()
}

/// Validates that field offsets are contiguous and non-overlapping.
pub fn sanity_check(table: &[Field]) -> Result<(), DiskError> {
    let mut offset = 0;
    for f in table {
        if f.offset != offset {
            return Err(DiskError::BadFieldTable {
                field: f.name,
                expected: offset,
                found: f.offset,
            });
        }
        offset += f.size;
    }
    Ok(())
}

fn lookup(table: &'static [Field], name: &str) -> &'static Field {
    table
        .iter()
        .find(|f| f.name == name)
        .unwrap_or_else(|| panic!("no field named {name} in table"))
}

/// A decoded view over one record. Accessors look fields up by name; asking
/// for a field that is not in the table, or with the wrong width, is a
/// programmer error and panics.
pub struct RecordView<'a> {
    buf: &'a [u8],
    table: &'static [Field],
}

impl<'a> RecordView<'a> {
    pub fn new(buf: &'a [u8], table: &'static [Field]) -> Result<Self, DiskError> {
        let needed = record_len(table);
        if buf.len() < needed {
            return Err(DiskError::Truncated {
                needed,
                got: buf.len(),
            });
        }
        Ok(Self { buf, table })
    }

    pub fn u8(&self, name: &str) -> u8 {
        let f = lookup(self.table, name);
        assert_eq!(f.size, 1, "{name} is not a 1-byte field");
        self.buf[f.offset]
    }

    pub fn u16(&self, name: &str) -> u16 {
        let f = lookup(self.table, name);
        assert_eq!(f.size, 2, "{name} is not a 2-byte field");
        u16::from_le_bytes(self.buf[f.offset..f.offset + 2].try_into().unwrap())
    }

    pub fn u32(&self, name: &str) -> u32 {
        let f = lookup(self.table, name);
        assert_eq!(f.size, 4, "{name} is not a 4-byte field");
        u32::from_le_bytes(self.buf[f.offset..f.offset + 4].try_into().unwrap())
    }

    pub fn bytes(&self, name: &str) -> &'a [u8] {
        let f = lookup(self.table, name);
        &self.buf[f.offset..f.offset + f.size]
    }
}

/// Writes named fields of one record into a destination buffer at a base
/// offset.
pub struct RecordWriter<'a> {
    buf: &'a mut [u8],
    table: &'static [Field],
    base: usize,
}

impl<'a> RecordWriter<'a> {
    pub fn new(
        buf: &'a mut [u8],
        table: &'static [Field],
        base: usize,
    ) -> Result<Self, DiskError> {
        let needed = base + record_len(table);
        if buf.len() < needed {
            return Err(DiskError::Truncated {
                needed,
                got: buf.len(),
            });
        }
        Ok(Self { buf, table, base })
    }

    pub fn u8(&mut self, name: &str, value: u8) {
        let f = lookup(self.table, name);
        assert_eq!(f.size, 1, "{name} is not a 1-byte field");
        self.buf[self.base + f.offset] = value;
    }

    pub fn u16(&mut self, name: &str, value: u16) {
        let f = lookup(self.table, name);
        assert_eq!(f.size, 2, "{name} is not a 2-byte field");
        let at = self.base + f.offset;
        self.buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn u32(&mut self, name: &str, value: u32) {
        let f = lookup(self.table, name);
        assert_eq!(f.size, 4, "{name} is not a 4-byte field");
        let at = self.base + f.offset;
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Raw-buffer fields require the source length to equal the field width.
    pub fn bytes(&mut self, name: &str, value: &[u8]) -> Result<(), DiskError> {
        let f = lookup(self.table, name);
        if value.len() != f.size {
            return Err(DiskError::FieldSizeMismatch {
                field: f.name,
                expected: f.size,
                got: value.len(),
            });
        }
        let at = self.base + f.offset;
        self.buf[at..at + f.size].copy_from_slice(value);
        Ok(())
    }
}

/// A generically decoded field value, for record printing and field-wise
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Int(u32),
    Bytes(&'a [u8]),
}

impl core::fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Bytes(b) => {
                for &c in *b {
                    if (0x20..=0x7e).contains(&c) {
                        write!(f, "{}", c as char)?;
                    } else {
                        write!(f, "\\x{c:02x}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Iterate every field of a record as `(name, value)` pairs, in table order.
pub fn fields<'a>(
    buf: &'a [u8],
    table: &'static [Field],
) -> Result<impl Iterator<Item = (&'static str, FieldValue<'a>)>, DiskError> {
    let needed = record_len(table);
    if buf.len() < needed {
        return Err(DiskError::Truncated {
            needed,
            got: buf.len(),
        });
    }
    Ok(table.iter().map(move |f| {
        let value = match f.size {
            1 => FieldValue::Int(buf[f.offset] as u32),
            2 => FieldValue::Int(u16::from_le_bytes(
                buf[f.offset..f.offset + 2].try_into().unwrap(),
            ) as u32),
            4 => FieldValue::Int(u32::from_le_bytes(
                buf[f.offset..f.offset + 4].try_into().unwrap(),
            )),
            _ => FieldValue::Bytes(&buf[f.offset..f.offset + f.size]),
        };
        (f.name, value)
    }))
}

/// Payload of a length-prefixed buffer: byte 0 is the length, bytes
/// `1..1+len` are the payload, the rest is padding.
pub fn pascal_str(raw: &[u8]) -> Result<&[u8], DiskError> {
    let len = *raw.first().ok_or(DiskError::InvalidName)? as usize;
    if len > raw.len() - 1 {
        return Err(DiskError::InvalidName);
    }
    Ok(&raw[1..1 + len])
}
