//! Name encoding, the up-case folding table, and the directory-entry name
//! hash.
//!
//! The real Microsoft default up-case table is Unicode case-folding data
//! that was filtered out of the retrieval pack as pure data (see
//! `original_source/trunk/mkfs/uct.c`, which references an excluded
//! `uctc.h`). [`default_table`] instead generates a table that folds ASCII
//! and Latin-1 Supplement letters and leaves every other code point
//! unchanged; it is internally consistent (format, mount and checksum all
//! agree) but is not byte-identical to Microsoft's compressed table. See
//! `DESIGN.md` for the full rationale.

use crate::error::Error;

/// Maximum number of UTF-16 code units in a file name, per exFAT's
/// `FileName` secondary entry limit of 15 code units per entry and 18
/// entries per file.
pub const MAX_NAME_LENGTH: usize = 255;

/// Byte length of the default up-case table this crate emits when
/// formatting a volume.
pub const UPCASE_TABLE_SIZE_BYTES: u32 = 5836;

/// An up-case folding table: `table[c]` is the folded form of code point
/// `c` for `c < table.len()`; code points at or beyond `table.len()` are
/// their own fold.
#[derive(Debug, Clone)]
pub struct UpcaseTable {
    entries: Vec<u16>,
}

impl UpcaseTable {
    pub fn from_entries(entries: Vec<u16>) -> Self {
        Self { entries }
    }

    pub fn fold(&self, c: u16) -> u16 {
        self.entries.get(c as usize).copied().unwrap_or(c)
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * 2);
        for &c in &self.entries {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() % 2 != 0 {
            return Err(Error::corrupted("up-case table length is not even"));
        }
        let entries = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { entries })
    }

    /// 32-bit rotating checksum over the raw table bytes, per
    /// `original_source/trunk/mkfs/uct.c`'s `uct_checksum`.
    pub fn checksum(&self) -> u32 {
        checksum(&self.as_bytes())
    }
}

pub fn checksum(bytes: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &b in bytes {
        sum = ((sum << 31) | (sum >> 1)).wrapping_add(b as u32);
    }
    sum
}

fn fold_code_point(c: u16) -> u16 {
    match c {
        0x61..=0x7A => c - 0x20,                 // a-z -> A-Z
        0xE0..=0xFE if c != 0xF7 => c - 0x20,     // Latin-1 supplement, skip division sign
        0xFF => 0x178,                            // y with diaeresis -> Y with diaeresis
        _ => c,
    }
}

/// Builds the default up-case table emitted by [`crate::format::Formatter`].
pub fn default_table() -> UpcaseTable {
    let count = UPCASE_TABLE_SIZE_BYTES as usize / 2;
    let entries = (0..count as u16).map(fold_code_point).collect();
    UpcaseTable::from_entries(entries)
}

/// Computes the exFAT directory-entry name hash for a name that has
/// already been converted to UTF-16, per `calc_name_hash` in
/// `original_source/trunk/libexfat/utils.c`.
pub fn name_hash(table: &UpcaseTable, units: &[u16]) -> u16 {
    let mut hash: u16 = 0;
    for &unit in units {
        let c = table.fold(unit);
        hash = ((hash << 15) | (hash >> 1)).wrapping_add(c & 0xff);
        hash = ((hash << 15) | (hash >> 1)).wrapping_add(c >> 8);
    }
    hash
}

/// Converts a UTF-8 `str` into UTF-16 code units, rejecting empty names,
/// names longer than [`MAX_NAME_LENGTH`] code units, and the characters
/// exFAT disallows in a file name (`" * / : < > ? \ |` and control
/// characters).
pub fn encode_name(name: &str) -> Result<Vec<u16>, Error> {
    if name.is_empty() {
        return Err(Error::InvalidName);
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidName);
    }
    for c in name.chars() {
        if (c as u32) < 0x20 || "\"*/:<>?\\|".contains(c) {
            return Err(Error::InvalidName);
        }
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > MAX_NAME_LENGTH {
        return Err(Error::NameTooLong);
    }
    Ok(units)
}

pub fn decode_name(units: &[u16]) -> Result<String, Error> {
    String::from_utf16(units).map_err(|_| Error::corrupted("file name is not valid UTF-16"))
}

/// Compares two names for equality using the up-case table, as exFAT
/// lookups do.
pub fn names_equal_folded(table: &UpcaseTable, a: &[u16], b: &[u16]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| table.fold(x) == table.fold(y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_case_folds() {
        let table = default_table();
        assert_eq!(table.fold('a' as u16), 'A' as u16);
        assert_eq!(table.fold('Z' as u16), 'Z' as u16);
    }

    #[test]
    fn table_round_trips_through_bytes() {
        let table = default_table();
        let bytes = table.as_bytes();
        let back = UpcaseTable::from_bytes(&bytes).unwrap();
        assert_eq!(table.as_bytes(), back.as_bytes());
    }

    #[test]
    fn checksum_is_stable() {
        let table = default_table();
        assert_eq!(table.checksum(), table.checksum());
    }

    #[test]
    fn encode_rejects_reserved_characters() {
        assert!(encode_name("a/b").is_err());
        assert!(encode_name("").is_err());
        assert!(encode_name(".").is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        let units = encode_name("hello.txt").unwrap();
        assert_eq!(decode_name(&units).unwrap(), "hello.txt");
    }

    #[test]
    fn folded_equality_ignores_case() {
        let table = default_table();
        let a = encode_name("Hello").unwrap();
        let b = encode_name("HELLO").unwrap();
        assert!(names_equal_folded(&table, &a, &b));
    }
}
