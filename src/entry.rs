//! Variable-length directory entry records: the seven entry types, the
//! entry-set checksum, and the file attribute/flag bitflags.
//!
//! Adapted from the teacher's `dir::entry::mod` (the `DirEntry` tagged
//! union, its `TryFrom<[u8; 32]>` validation, and the checksum rotation)
//! with the timestamp and stream-extension fields generalized for a
//! read-write filesystem instead of a read-only one; field tags and the
//! directory-entry-type table itself are confirmed against
//! `original_source/trunk/libexfat/exfatfs.h`.

use std::mem::transmute;

use bitflags::bitflags;
use enumeric::range_enum;

use crate::error::Error;
use crate::timestamp::Timestamp;

pub const VOLUME_GUID_ENTRY_TYPE: u8 = 0xA0;

/// A raw, 32-byte exFAT directory entry.
#[derive(Copy, Clone)]
#[repr(C, u8)]
#[range_enum]
pub enum DirEntry {
    EndOfDirectory([u8; 31]) = 0x0,
    #[range(0x1..0x80)]
    Unused([u8; 31]),
    Invalid = 0x80,
    // critical primary
    Bitmap(BitmapEntry),
    UpcaseTable(UpcaseTableEntry),
    VolumeLabel(VolumeLabelEntry),
    File(FileEntry) = 0x85,
    // benign primary
    VolumeGuid(VolumeGuidEntry) = VOLUME_GUID_ENTRY_TYPE,
    // critical secondary
    StreamExtension(StreamExtensionEntry) = 0xC0,
    FileName(FileNameEntry),
    // benign secondary
    VendorExtension(VendorExtensionEntry) = 0xE0,
    VendorAllocation(VendorAllocationEntry),
}

impl TryFrom<[u8; 32]> for DirEntry {
    type Error = Error;

    fn try_from(value: [u8; 32]) -> Result<Self, Error> {
        let ty = value[0];
        match ty {
            0x0..=0x83 | 0x85 | 0xA0 | 0xC0..=0xC1 | 0xE0..=0xE1 => {
                Ok(unsafe { transmute::<[u8; 32], DirEntry>(value) })
            }
            _ => Err(Error::corrupted(format!("invalid directory entry type {ty:#04x}"))),
        }
    }
}

impl DirEntry {
    pub fn regular(&self) -> bool {
        self.entry_type() >= 0x81
    }

    pub fn primary(&self) -> bool {
        (self.entry_type() & 0x40) >> 6 == 0
    }

    pub fn unused(&self) -> bool {
        self.entry_type() > 0x0 && self.entry_type() < 0x80
    }

    pub fn bytes(&self) -> [u8; 32] {
        assert_eq!(size_of::<DirEntry>(), 32);
        unsafe { transmute::<DirEntry, [u8; 32]>(*self) }
    }

    pub fn entry_type(&self) -> u8 {
        // SAFETY: `Self` is `repr(C, u8)`, a union of `repr(C)` structs each
        // starting with the `u8` discriminant, so reading the first byte
        // does not require offsetting the pointer.
        unsafe { *<*const _>::from(self).cast::<u8>() }
    }

    pub fn new_unused(ty: u8) -> DirEntry {
        assert_eq!(size_of::<DirEntry>(), 32);
        let mut bytes = [0u8; 32];
        bytes[0] = ty & !(DirEntry::Invalid.entry_type());
        unsafe { transmute::<[u8; 32], DirEntry>(bytes) }
    }

    /// Folds this entry's bytes into the rotating entry-set checksum,
    /// skipping bytes 2-3 (the File entry's own `SetChecksum` field) for
    /// the primary entry and folding every byte of each secondary entry,
    /// matching `original_source`'s `exfat_start_checksum`/
    /// `exfat_add_checksum`.
    pub fn checksum(&self, input: u16) -> u16 {
        let bytes = self.bytes();

        let mut sum = input.rotate_right(1);
        sum = sum.wrapping_add(bytes[0] as u16);
        sum = sum.rotate_right(1);
        sum = sum.wrapping_add(bytes[1] as u16);

        let start = if self.primary() { 4 } else { 2 };
        for &b in &bytes[start..] {
            sum = sum.rotate_right(1);
            sum = sum.wrapping_add(b as u16);
        }
        sum
    }
}

/// Computes the checksum over a complete entry set (the file entry
/// followed by its secondary entries), per `exfat_calc_checksum`.
pub fn set_checksum(entries: &[DirEntry]) -> u16 {
    entries.iter().fold(0u16, |sum, e| e.checksum(sum))
}

pub trait ClusterAllocation {
    fn valid(&self) -> bool;
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct BitmapEntry {
    pub flags: u8,
    pub _reserved: [u8; 18],
    pub first_cluster: u32,
    pub data_len: u64,
}

impl BitmapEntry {
    pub fn new(first_cluster: u32, data_len: u64) -> Self {
        Self { flags: 0, _reserved: [0; 18], first_cluster, data_len }
    }

    /// `0` for the first FAT's bitmap, `1` for the second (TexFAT).
    pub fn index(&self) -> u8 {
        self.flags & 1
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct UpcaseTableEntry {
    pub _reserved1: [u8; 3],
    pub table_checksum: u32,
    pub _reserved2: [u8; 12],
    pub first_cluster: u32,
    pub data_len: u64,
}

impl UpcaseTableEntry {
    pub fn new(first_cluster: u32, data_len: u64, table_checksum: u32) -> Self {
        Self { _reserved1: [0; 3], table_checksum, _reserved2: [0; 12], first_cluster, data_len }
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VolumeLabelEntry {
    pub character_count: u8,
    pub volume_label: [u16; 11],
    pub _reserved: [u8; 8],
}

impl VolumeLabelEntry {
    pub fn new(label: &[u16]) -> Self {
        let mut volume_label = [0u16; 11];
        let n = label.len().min(11);
        volume_label[..n].copy_from_slice(&label[..n]);
        Self { character_count: n as u8, volume_label, _reserved: [0; 8] }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Ord, PartialOrd, Eq, PartialEq)]
    pub struct FileAttributes: u16 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct FileEntry {
    pub secondary_count: u8,
    pub set_checksum: u16,
    pub file_attributes: u16,
    pub _reserved1: u16,
    pub create_time: u16,
    pub create_date: u16,
    pub modified_time: u16,
    pub modified_date: u16,
    pub accessed_time: u16,
    pub accessed_date: u16,
    pub create_10ms: u8,
    pub modified_10ms: u8,
    pub create_utc_offset: u8,
    pub modified_utc_offset: u8,
    pub accessed_utc_offset: u8,
    pub _reserved2: [u8; 7],
}

impl FileEntry {
    pub fn new(secondary_count: u8, attributes: FileAttributes, now: Timestamp) -> Self {
        Self {
            secondary_count,
            set_checksum: 0,
            file_attributes: attributes.bits(),
            _reserved1: 0,
            create_time: now.time,
            create_date: now.date,
            modified_time: now.time,
            modified_date: now.date,
            accessed_time: now.time,
            accessed_date: now.date,
            create_10ms: now.increment_10ms,
            modified_10ms: now.increment_10ms,
            create_utc_offset: Timestamp::encode_utc_offset(now.utc_offset),
            modified_utc_offset: Timestamp::encode_utc_offset(now.utc_offset),
            accessed_utc_offset: Timestamp::encode_utc_offset(now.utc_offset),
            _reserved2: [0; 7],
        }
    }

    pub fn create_timestamp(&self) -> Timestamp {
        Timestamp {
            date: self.create_date,
            time: self.create_time,
            increment_10ms: self.create_10ms,
            utc_offset: Timestamp::decode_utc_offset(self.create_utc_offset),
        }
    }

    pub fn modified_timestamp(&self) -> Timestamp {
        Timestamp {
            date: self.modified_date,
            time: self.modified_time,
            increment_10ms: self.modified_10ms,
            utc_offset: Timestamp::decode_utc_offset(self.modified_utc_offset),
        }
    }

    pub fn accessed_timestamp(&self) -> Timestamp {
        Timestamp {
            date: self.accessed_date,
            time: self.accessed_time,
            increment_10ms: 0,
            utc_offset: Timestamp::decode_utc_offset(self.accessed_utc_offset),
        }
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VolumeGuidEntry {
    pub secondary_count: u8,
    pub set_checksum: u16,
    pub general_primary_flags: u16,
    pub volume_guid: u128,
    pub _reserved: [u8; 10],
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Ord, PartialOrd, Eq, PartialEq)]
    pub struct GeneralSecondaryFlags: u8 {
        const ALLOCATION_POSSIBLE = 1 << 0;
        const NO_FAT_CHAIN = 1 << 1;
    }
}

impl GeneralSecondaryFlags {
    pub fn allocation_possible(&self) -> bool {
        self.contains(GeneralSecondaryFlags::ALLOCATION_POSSIBLE)
    }

    pub fn no_fat_chain(&self) -> bool {
        self.contains(GeneralSecondaryFlags::NO_FAT_CHAIN)
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct StreamExtensionEntry {
    pub general_secondary_flags: u8,
    pub _reserved1: u8,
    pub name_length: u8,
    pub name_hash: u16,
    pub _reserved2: u16,
    pub valid_data_length: u64,
    pub _reserved3: u32,
    pub first_cluster: u32,
    pub data_len: u64,
}

impl StreamExtensionEntry {
    pub fn new(
        flags: GeneralSecondaryFlags,
        name_length: u8,
        name_hash: u16,
        valid_data_length: u64,
        first_cluster: u32,
        data_len: u64,
    ) -> Self {
        Self {
            general_secondary_flags: flags.bits(),
            _reserved1: 0,
            name_length,
            name_hash,
            _reserved2: 0,
            valid_data_length,
            _reserved3: 0,
            first_cluster,
            data_len,
        }
    }

    pub fn flags(&self) -> GeneralSecondaryFlags {
        GeneralSecondaryFlags::from_bits_truncate(self.general_secondary_flags)
    }
}

impl ClusterAllocation for StreamExtensionEntry {
    fn valid(&self) -> bool {
        let flags = self.flags();
        let valid_data_length = self.valid_data_length;
        let data_len = self.data_len;
        flags.allocation_possible() && self.name_length > 0 && valid_data_length <= data_len
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct FileNameEntry {
    pub general_secondary_flags: u8,
    pub file_name: [u16; 15],
}

impl FileNameEntry {
    pub fn new(chunk: &[u16]) -> Self {
        let mut file_name = [0u16; 15];
        let n = chunk.len().min(15);
        file_name[..n].copy_from_slice(&chunk[..n]);
        Self { general_secondary_flags: 0, file_name }
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VendorExtensionEntry {
    pub general_secondary_flags: u8,
    pub vendor_guid: u128,
    pub vendor_defined: [u8; 14],
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VendorAllocationEntry {
    pub general_secondary_flags: u8,
    pub vendor_guid: u128,
    pub vendor_defined: [u8; 2],
    pub first_cluster: u32,
    pub data_len: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_through_bytes() {
        let e = DirEntry::Bitmap(BitmapEntry::new(2, 128));
        let bytes = e.bytes();
        let back = DirEntry::try_from(bytes).unwrap();
        assert_eq!(back.entry_type(), 0x81);
    }

    #[test]
    fn rejects_unknown_entry_type() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x90;
        assert!(DirEntry::try_from(bytes).is_err());
    }

    #[test]
    fn checksum_is_order_sensitive() {
        let a = DirEntry::Bitmap(BitmapEntry::new(2, 128));
        let b = DirEntry::UpcaseTable(UpcaseTableEntry::new(3, 5836, 0));
        let forward = set_checksum(&[a, b]);
        let backward = set_checksum(&[b, a]);
        assert_ne!(forward, backward);
    }

    #[test]
    fn stream_extension_validity() {
        let valid = StreamExtensionEntry::new(
            GeneralSecondaryFlags::ALLOCATION_POSSIBLE,
            5,
            0,
            10,
            2,
            10,
        );
        assert!(valid.valid());

        let invalid = StreamExtensionEntry::new(GeneralSecondaryFlags::empty(), 0, 0, 0, 0, 0);
        assert!(!invalid.valid());
    }
}
