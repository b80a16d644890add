//! The 512-byte Main/Backup Boot Sector record.
//!
//! Field layout follows `original_source/trunk/libexfat/exfatfs.h`'s
//! `exfat_super_block` and the teacher's `format::boot_sector::BootSector`.
//! Like the teacher's struct, multi-byte fields are plain native integers
//! rather than explicitly byte-swapped wrappers: exFAT's on-disk format is
//! little-endian and this crate, like its teacher, targets little-endian
//! hosts.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable, bytes_of, pod_read_unaligned};

use crate::error::Error;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BootSector {
    pub jump_boot: [u8; 3],
    pub filesystem_name: [u8; 8],
    pub _reserved: [u8; 53],
    pub partition_offset: u64,
    pub volume_length: u64,
    pub fat_offset: u32,
    pub fat_length: u32,
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub first_cluster_of_root_directory: u32,
    pub volume_serial_number: u32,
    pub file_system_revision: u16,
    pub volume_flags: u16,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
    pub number_of_fats: u8,
    pub drive_select: u8,
    pub percent_in_use: u8,
    pub _reserved2: [u8; 7],
    pub boot_code: [u8; 390],
    pub boot_signature: u16,
}

const _: () = assert!(core::mem::size_of::<BootSector>() == 512);

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Ord, PartialOrd, Eq, PartialEq)]
    pub struct VolumeFlags: u16 {
        const ACTIVE_FAT = 1 << 0;
        const VOLUME_DIRTY = 1 << 1;
        const MEDIA_FAILURE = 1 << 2;
        const CLEAR_TO_ZERO = 1 << 3;
    }
}

impl BootSector {
    pub fn zeroed() -> Self {
        Zeroable::zeroed()
    }

    pub fn from_bytes(buf: &[u8; 512]) -> Result<Self, Error> {
        Ok(pod_read_unaligned(buf))
    }

    /// Serializes into a buffer of `sector_size` bytes, zero-padded beyond
    /// the 512-byte record for volumes with a larger sector size.
    pub fn to_bytes(&self, sector_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; sector_size.max(512)];
        buf[..512].copy_from_slice(bytes_of(self));
        buf
    }

    pub fn validate(&self) -> Result<(), Error> {
        if &self.filesystem_name != b"EXFAT   " {
            return Err(Error::corrupted("filesystem name is not EXFAT"));
        }
        if self.boot_signature != super::BOOT_SIGNATURE {
            return Err(Error::corrupted("boot signature mismatch"));
        }
        if !(9..=12).contains(&self.bytes_per_sector_shift) {
            return Err(Error::corrupted(format!(
                "invalid bytes-per-sector shift: {}",
                self.bytes_per_sector_shift
            )));
        }
        if self.sectors_per_cluster_shift > 25 - self.bytes_per_sector_shift {
            return Err(Error::corrupted("invalid sectors-per-cluster shift"));
        }
        if !(1..=2).contains(&self.number_of_fats) {
            return Err(Error::corrupted("invalid number of FATs"));
        }
        if self.cluster_count > super::MAX_CLUSTER_COUNT {
            return Err(Error::corrupted("cluster count exceeds maximum"));
        }
        if self.first_cluster_of_root_directory < crate::FIRST_DATA_CLUSTER
            || self.first_cluster_of_root_directory > self.cluster_count + 1
        {
            return Err(Error::corrupted("invalid root directory cluster"));
        }
        let flags = VolumeFlags::from_bits_truncate(self.volume_flags);
        if flags.contains(VolumeFlags::ACTIVE_FAT) && self.number_of_fats != 2 {
            return Err(Error::corrupted("active FAT flag set with a single FAT"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_is_one_sector() {
        assert_eq!(core::mem::size_of::<BootSector>(), 512);
    }

    #[test]
    fn rejects_wrong_filesystem_name() {
        let mut s = BootSector::zeroed();
        s.filesystem_name = *b"FAT32   ";
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_active_fat_with_single_fat() {
        let mut s = BootSector::zeroed();
        s.filesystem_name = *b"EXFAT   ";
        s.boot_signature = super::super::BOOT_SIGNATURE;
        s.bytes_per_sector_shift = 9;
        s.number_of_fats = 1;
        s.volume_flags = VolumeFlags::ACTIVE_FAT.bits();
        s.cluster_count = 10;
        s.first_cluster_of_root_directory = 2;
        assert!(s.validate().is_err());
    }
}
