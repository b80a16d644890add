//! Volume boot region: the packed boot sector record, its checksum, and
//! the read/write logic shared by [`crate::format::Formatter`] and
//! [`crate::fs::Filesystem::mount`].

pub mod checksum;
pub mod sector;

use log::warn;

use crate::disk::Device;
use crate::error::Error;
use checksum::Checksum;
use sector::{BootSector, VolumeFlags};

/// Offset of the main boot region, in sectors from the start of the
/// volume.
pub const MAIN_BOOT_OFFSET: u64 = 0;
/// Offset of the backup boot region, in sectors from the start of the
/// volume.
pub const BACKUP_BOOT_OFFSET: u64 = 12;
/// Number of extended boot sectors following the boot sector in each boot
/// region.
pub const EXTENDED_BOOT_COUNT: u64 = 8;
pub const BOOT_SIGNATURE: u16 = 0xAA55;
pub const EXTENDED_BOOT_SIGNATURE: u32 = 0xAA550000;
pub const MAX_CLUSTER_COUNT: u32 = 0xFFFFFFF5;
pub const MAX_CLUSTER_SIZE: u32 = 32 * crate::MB;

/// A fully validated boot region: the boot sector plus the sector size it
/// was read with, ready for layout arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct BootRegion {
    pub sector: BootSector,
    pub bytes_per_sector: u32,
}

impl BootRegion {
    pub fn bytes_per_cluster(&self) -> u64 {
        (self.bytes_per_sector as u64) << self.sector.sectors_per_cluster_shift
    }

    pub fn fat_offset_bytes(&self) -> u64 {
        self.sector.fat_offset as u64 * self.bytes_per_sector as u64
    }

    pub fn fat_length_bytes(&self) -> u64 {
        self.sector.fat_length as u64 * self.bytes_per_sector as u64
    }

    pub fn cluster_heap_offset_bytes(&self) -> u64 {
        self.sector.cluster_heap_offset as u64 * self.bytes_per_sector as u64
    }

    pub fn cluster_offset_bytes(&self, cluster: u32) -> Option<u64> {
        if cluster < crate::FIRST_DATA_CLUSTER {
            return None;
        }
        Some(
            self.cluster_heap_offset_bytes()
                + (cluster - crate::FIRST_DATA_CLUSTER) as u64 * self.bytes_per_cluster(),
        )
    }

    pub fn active_fat_index(&self) -> u32 {
        let flags = VolumeFlags::from_bits_truncate(self.sector.volume_flags);
        if flags.contains(VolumeFlags::ACTIVE_FAT) && self.sector.number_of_fats == 2 {
            1
        } else {
            0
        }
    }
}

/// Reads and validates the main boot region of `device`, per the checks
/// the teacher's `dir::Root::open` performed for a read-only mount.
///
/// Also folds the 11 VBR sectors (the boot sector, the 8 extended boot
/// sectors, the OEM parameters sector and the reserved sector) into a
/// running checksum and compares it against the checksum sector, per
/// `original_source`'s `mkfs/vbr.c:vbr_write`. A mismatch in the main
/// region is fatal; a mismatch in only the backup region is logged and
/// otherwise ignored, since the main region is what `mount` trusts.
pub fn read_boot_region(device: &mut dyn Device) -> Result<BootRegion, Error> {
    let mut buf = [0u8; 512];
    device
        .read_at(MAIN_BOOT_OFFSET * 512, &mut buf)
        .map_err(Error::io)?;

    let sector = BootSector::from_bytes(&buf)?;
    sector.validate()?;

    let bytes_per_sector = 1u32 << sector.bytes_per_sector_shift;

    let main_checksum = region_checksum(device, MAIN_BOOT_OFFSET, bytes_per_sector)?;
    let main_stored = stored_checksum(device, MAIN_BOOT_OFFSET, bytes_per_sector)?;
    if main_checksum != main_stored {
        return Err(Error::corrupted("main boot region checksum mismatch"));
    }

    match (
        region_checksum(device, BACKUP_BOOT_OFFSET, bytes_per_sector),
        stored_checksum(device, BACKUP_BOOT_OFFSET, bytes_per_sector),
    ) {
        (Ok(backup_checksum), Ok(backup_stored)) if backup_checksum != backup_stored => {
            warn!("backup boot region checksum mismatch, continuing with the main region");
        }
        (Err(err), _) | (_, Err(err)) => {
            warn!("backup boot region unreadable ({err}), continuing with the main region");
        }
        _ => {}
    }

    Ok(BootRegion { sector, bytes_per_sector })
}

/// Folds the boot sector, 8 extended boot sectors, OEM parameters sector
/// and reserved sector of the boot region starting at `offset_sectors`
/// into a single checksum, per `vbr_write`'s write-time computation. The
/// OEM parameters and reserved sectors are always written zeroed by
/// [`write_boot_region`], so they are folded without reading them back.
fn region_checksum(device: &mut dyn Device, offset_sectors: u64, bytes_per_sector: u32) -> Result<u32, Error> {
    let base = offset_sectors * bytes_per_sector as u64;
    let mut checksum = Checksum::new(bytes_per_sector as u16);

    let mut boot_sector_bytes = vec![0u8; bytes_per_sector as usize];
    device.read_at(base, &mut boot_sector_bytes).map_err(Error::io)?;
    checksum.boot_sector(&boot_sector_bytes);

    let mut block = vec![0u8; bytes_per_sector as usize];
    for i in 0..EXTENDED_BOOT_COUNT {
        device
            .read_at(base + (1 + i) * bytes_per_sector as u64, &mut block)
            .map_err(Error::io)?;
        checksum.extended_boot_sector(&block, 1);
    }

    checksum.zero_sector();
    checksum.zero_sector();

    Ok(checksum.get())
}

fn stored_checksum(device: &mut dyn Device, offset_sectors: u64, bytes_per_sector: u32) -> Result<u32, Error> {
    let mut bytes = [0u8; 4];
    device
        .read_at((offset_sectors + 11) * bytes_per_sector as u64, &mut bytes)
        .map_err(Error::io)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Patches the `VolumeDirty` bit in both the main and backup boot
/// sector's `volume_flags` field in place, without rewriting the
/// surrounding extended boot sectors or checksum.
pub fn set_volume_dirty(device: &mut dyn Device, region: &mut BootRegion, dirty: bool) -> Result<(), Error> {
    let mut flags = VolumeFlags::from_bits_truncate(region.sector.volume_flags);
    flags.set(VolumeFlags::VOLUME_DIRTY, dirty);
    region.sector.volume_flags = flags.bits();

    for base_sectors in [MAIN_BOOT_OFFSET, BACKUP_BOOT_OFFSET] {
        let offset = base_sectors * region.bytes_per_sector as u64 + 106;
        device
            .write_at(offset, &flags.bits().to_le_bytes())
            .map_err(Error::io)?;
    }
    Ok(())
}

/// Writes the boot sector, eight zeroed extended boot sectors, an OEM
/// parameters sector, a reserved sector and a checksum sector — one full
/// boot region — at `region_offset_sectors`, per
/// `original_source/trunk/mkfs/vbr.c`'s `vbr_write`.
pub fn write_boot_region(
    device: &mut dyn Device,
    region_offset_sectors: u64,
    sector: &BootSector,
    bytes_per_sector: u32,
) -> Result<(), Error> {
    let base = region_offset_sectors * bytes_per_sector as u64;
    let sector_bytes = sector.to_bytes(bytes_per_sector as usize);
    device.write_at(base, &sector_bytes).map_err(Error::io)?;

    let mut checksum = Checksum::new(bytes_per_sector as u16);
    checksum.boot_sector(&sector_bytes);

    for i in 0..EXTENDED_BOOT_COUNT {
        let mut block = vec![0u8; bytes_per_sector as usize];
        block[bytes_per_sector as usize - 4..].copy_from_slice(&EXTENDED_BOOT_SIGNATURE.to_le_bytes());
        device
            .write_at(base + (1 + i) * bytes_per_sector as u64, &block)
            .map_err(Error::io)?;
        checksum.extended_boot_sector(&block, 1);
    }

    // OEM parameters sector, reserved sector: all zero.
    let zero = vec![0u8; bytes_per_sector as usize];
    for offset in [9u64, 10u64] {
        device
            .write_at(base + offset * bytes_per_sector as u64, &zero)
            .map_err(Error::io)?;
        checksum.zero_sector();
    }

    let value = checksum.get();
    let mut checksum_sector = vec![0u8; bytes_per_sector as usize];
    for chunk in checksum_sector.chunks_exact_mut(4) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    device
        .write_at(base + 11 * bytes_per_sector as u64, &checksum_sector)
        .map_err(Error::io)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_sector() -> BootSector {
        let mut s = BootSector::zeroed();
        s.filesystem_name = *b"EXFAT   ";
        s.jump_boot = [0xeb, 0x76, 0x90];
        s.volume_length = 1 << 20;
        s.fat_offset = 24;
        s.fat_length = 1;
        s.cluster_heap_offset = 32;
        s.cluster_count = 100;
        s.first_cluster_of_root_directory = 2;
        s.bytes_per_sector_shift = 9;
        s.sectors_per_cluster_shift = 3;
        s.number_of_fats = 1;
        s.drive_select = 0x80;
        s.boot_signature = BOOT_SIGNATURE;
        s
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut device = Cursor::new(vec![0u8; 24 * 512]);
        let sector = sample_sector();
        write_boot_region(&mut device, 0, &sector, 512).unwrap();
        let region = read_boot_region(&mut device).unwrap();
        assert_eq!(region.sector.cluster_count, 100);
        assert_eq!(region.bytes_per_sector, 512);
    }

    #[test]
    fn corrupted_boot_sector_is_rejected_at_mount() {
        let mut device = Cursor::new(vec![0u8; 24 * 512]);
        let sector = sample_sector();
        write_boot_region(&mut device, 0, &sector, 512).unwrap();
        // Flip a byte inside the boot sector that the checksum does cover.
        let mut byte = [0u8; 1];
        device.read_at(64, &mut byte).unwrap();
        device.write_at(64, &[byte[0] ^ 0xff]).unwrap();
        assert!(matches!(read_boot_region(&mut device), Err(Error::Corrupted(_))));
    }

    #[test]
    fn main_and_backup_checksums_match() {
        let mut device = Cursor::new(vec![0u8; 48 * 512]);
        let sector = sample_sector();
        write_boot_region(&mut device, MAIN_BOOT_OFFSET, &sector, 512).unwrap();
        write_boot_region(&mut device, BACKUP_BOOT_OFFSET, &sector, 512).unwrap();
        let mut main_checksum = [0u8; 512];
        let mut backup_checksum = [0u8; 512];
        device.read_at(11 * 512, &mut main_checksum).unwrap();
        device.read_at((BACKUP_BOOT_OFFSET + 11) * 512, &mut backup_checksum).unwrap();
        assert_eq!(main_checksum, backup_checksum);
    }
}
