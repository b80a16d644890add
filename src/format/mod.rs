//! Volume formatting: the layout arithmetic that places the FAT,
//! allocation bitmap, up-case table and root directory on a freshly
//! formatted volume, and the code that writes them out.
//!
//! The layout computation is carried over from the teacher's own
//! `format::Exfat::try_from`/`write_fat` almost unchanged (it was already
//! general-purpose boundary-alignment and bitmap-packing arithmetic, not
//! read-only-specific); only the record types it writes through are new.

use std::ops::{Div, Sub};
use std::time::{SystemTime, UNIX_EPOCH};

use checked_num::CheckedU64;
use derive_builder::Builder;

use crate::FIRST_DATA_CLUSTER;
use crate::boot::sector::{BootSector, VolumeFlags};
use crate::boot::{self, BOOT_SIGNATURE, MAX_CLUSTER_COUNT, MAX_CLUSTER_SIZE};
use crate::disk::{self, Device};
use crate::entry::{BitmapEntry, DirEntry, UpcaseTableEntry, VolumeGuidEntry, VolumeLabelEntry};
use crate::error::Error;
use crate::fat::{self, Fat};
use crate::name;
use log::info;

/// Formatting options, built with the [`derive_builder::Builder`] pattern.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct FormatVolumeOptions {
    /// Size of the target device, in bytes.
    pub dev_size: u64,
    /// Bytes per sector. Must be a power of two between 512 and 4096.
    pub bytes_per_sector: u16,
    /// Byte alignment for filesystem structures such as the FAT and the
    /// up-case table.
    #[builder(default = "crate::DEFAULT_BOUNDARY_ALIGNMENT")]
    pub boundary_align: u32,
    /// Whether to pack the allocation bitmap right after the FAT, trading
    /// a slightly more complex layout computation for less wasted space.
    #[builder(default = "true")]
    pub pack_bitmap: bool,
    /// Whether to zero the entire device instead of just the metadata
    /// region ahead of the cluster heap.
    #[builder(default)]
    pub full_format: bool,
    /// Media-relative sector offset of the partition hosting the volume.
    #[builder(default)]
    pub partition_offset: u64,
    #[builder(default)]
    pub volume_label: Option<String>,
    #[builder(default)]
    pub guid: Option<u128>,
}

impl FormatVolumeOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(bytes_per_sector) = self.bytes_per_sector {
            if !bytes_per_sector.is_power_of_two() || !(512..=4096).contains(&bytes_per_sector) {
                return Err("bytes_per_sector must be a power of two between 512 and 4096".into());
            }
        }
        if let Some(boundary_align) = self.boundary_align {
            if !boundary_align.is_power_of_two() {
                return Err("boundary_align must be a power of two".into());
            }
        }
        Ok(())
    }
}

/// A validated volume layout, ready to be written to a device.
#[derive(Clone, Debug)]
pub struct Formatter {
    volume_length: u64,
    fat_offset: u32,
    fat_length: u32,
    cluster_heap_offset: u32,
    cluster_count: u32,
    cluster_count_used: u32,
    first_cluster_of_root_directory: u32,
    bytes_per_sector_shift: u8,
    sectors_per_cluster_shift: u8,
    number_of_fats: u8,
    bytes_per_cluster: u32,
    bitmap_offset_bytes: u32,
    bitmap_length_bytes: u32,
    upcase_offset_bytes: u32,
    upcase_start_cluster: u32,
    root_offset_bytes: u32,
    options: FormatVolumeOptions,
}

fn default_cluster_size(size: u64) -> u32 {
    const FIRST_BOUND: u64 = 256 * crate::MB as u64;
    const SECOND_BOUND: u64 = 32 * crate::GB as u64;
    match size {
        ..=FIRST_BOUND => 4 * crate::KB as u32,
        s if s <= SECOND_BOUND => 32 * crate::KB as u32,
        _ => 128 * crate::KB as u32,
    }
}

impl Formatter {
    /// Validates `options` and computes the full volume layout, per
    /// `original_source/trunk/mkfs/fat.c`'s `fat_compute_cluster_count`
    /// family of calculations.
    pub fn try_from(options: FormatVolumeOptions) -> Result<Self, Error> {
        let size = options.dev_size;
        let bytes_per_cluster = default_cluster_size(size);
        let number_of_fats = 1u8;

        let partition_offset = options.partition_offset / options.bytes_per_sector as u64;

        if !bytes_per_cluster.is_power_of_two()
            || !(options.bytes_per_sector as u32..=MAX_CLUSTER_SIZE).contains(&bytes_per_cluster)
        {
            return Err(Error::InvalidArgument(format!("invalid cluster size {bytes_per_cluster}")));
        }
        let bytes_per_sector_shift = options.bytes_per_sector.ilog2() as u8;
        let sectors_per_cluster_shift = (bytes_per_cluster / options.bytes_per_sector as u32).ilog2() as u8;

        let volume_length = size / options.bytes_per_sector as u64;
        if volume_length < (1 << (20 - bytes_per_sector_shift)) {
            return Err(Error::InvalidArgument(format!("device too small: {size} bytes")));
        }

        let fat_offset_bytes: u32 = (CheckedU64::new(options.bytes_per_sector as u64) * 24 + partition_offset)
            .ok_or(Error::InvalidArgument("partition offset overflow".into()))?
            .next_multiple_of(options.boundary_align as u64)
            .sub(partition_offset)
            .try_into()
            .map_err(|_| Error::InvalidArgument("boundary alignment too large".into()))?;
        let fat_offset = fat_offset_bytes / options.bytes_per_sector as u32;

        let max_clusters: CheckedU64 = ((CheckedU64::new(size) - fat_offset_bytes as u64 - number_of_fats as u64 * 8 - 1)
            / (bytes_per_cluster as u64 + 4 * number_of_fats as u64)
            + 1)
        .ok_or(Error::InvalidArgument(format!("invalid cluster size {bytes_per_cluster}")))?
        .into();

        let fat_length_bytes = ((max_clusters + 2) * 4)
            .ok_or(Error::InvalidArgument(format!("invalid cluster size {bytes_per_cluster}")))?
            .next_multiple_of(options.bytes_per_sector as u64);
        let fat_length: u32 = (fat_length_bytes / options.bytes_per_sector as u64)
            .try_into()
            .map_err(|_| Error::InvalidArgument(format!("invalid cluster size {bytes_per_cluster}")))?;

        let mut cluster_heap_offset_bytes = ((partition_offset + fat_offset_bytes as u64 + fat_length_bytes * number_of_fats as u64)
            .next_multiple_of(options.boundary_align as u64)
            - partition_offset) as u32;
        let mut cluster_heap_offset = cluster_heap_offset_bytes / options.bytes_per_sector as u32;

        if cluster_heap_offset_bytes as u64 >= size {
            return Err(Error::InvalidArgument("boundary alignment too large".into()));
        }

        let mut cluster_count: u32 = ((size - cluster_heap_offset_bytes as u64) / bytes_per_cluster as u64)
            .try_into()
            .map_err(|_| Error::InvalidArgument(format!("invalid cluster size {bytes_per_cluster}")))?;

        if cluster_count
            > MAX_CLUSTER_COUNT.min(((volume_length - cluster_heap_offset as u64) / 2u64.pow(sectors_per_cluster_shift as u32)) as u32)
        {
            return Err(Error::InvalidArgument(format!("invalid cluster size {bytes_per_cluster}")));
        }

        let mut bitmap_offset_bytes = cluster_heap_offset_bytes;
        let mut bitmap_length_bytes = cluster_count.next_multiple_of(8) / 8;

        if options.pack_bitmap {
            let fat_end_bytes = fat_offset_bytes as u64 + fat_length_bytes;
            let mut bitmap_length_clusters_packed = bitmap_length_bytes.next_multiple_of(bytes_per_cluster);

            loop {
                let bitmap_cluster_count_packed = bitmap_length_clusters_packed / bytes_per_cluster;
                if ((cluster_heap_offset_bytes - bitmap_length_clusters_packed) as u64) < fat_end_bytes
                    || cluster_count > MAX_CLUSTER_COUNT - bitmap_cluster_count_packed
                {
                    return Err(Error::InvalidArgument("cannot pack allocation bitmap".into()));
                }
                let total_cluster_count = cluster_count + bitmap_cluster_count_packed;
                let bitmap_length_bytes_packed = total_cluster_count.next_multiple_of(8).div(8);
                let new_bitmap_length_clusters = bitmap_length_bytes_packed.next_multiple_of(bytes_per_cluster);

                if new_bitmap_length_clusters == bitmap_length_clusters_packed {
                    cluster_heap_offset_bytes -= bitmap_length_clusters_packed;
                    cluster_count = total_cluster_count;
                    bitmap_offset_bytes -= bitmap_length_clusters_packed;
                    bitmap_length_bytes = bitmap_length_bytes_packed;
                    break;
                }
                bitmap_length_clusters_packed = new_bitmap_length_clusters;
            }
            cluster_heap_offset = cluster_heap_offset_bytes / options.bytes_per_sector as u32;
        }
        let _ = cluster_heap_offset;

        let cluster_length = bitmap_length_bytes.next_multiple_of(bytes_per_cluster);
        let upcase_offset_bytes = bitmap_offset_bytes + cluster_length;
        let upcase_start_cluster = FIRST_DATA_CLUSTER + cluster_length / bytes_per_cluster;
        let upcase_length_bytes = name::UPCASE_TABLE_SIZE_BYTES;

        let cluster_length = upcase_length_bytes.next_multiple_of(bytes_per_cluster);
        let root_offset_bytes = upcase_offset_bytes + cluster_length;
        let first_cluster_of_root_directory = upcase_start_cluster + cluster_length / bytes_per_cluster;

        Ok(Self {
            volume_length,
            bytes_per_sector_shift,
            fat_offset,
            number_of_fats,
            fat_length,
            cluster_heap_offset: cluster_heap_offset_bytes / options.bytes_per_sector as u32,
            cluster_count,
            sectors_per_cluster_shift,
            first_cluster_of_root_directory,
            bytes_per_cluster,
            root_offset_bytes,
            bitmap_offset_bytes,
            bitmap_length_bytes,
            upcase_offset_bytes,
            upcase_start_cluster,
            cluster_count_used: 0,
            options,
        })
    }

    fn bytes_per_sector(&self) -> u32 {
        1 << self.bytes_per_sector_shift
    }

    /// Writes the boot regions, FAT, allocation bitmap, up-case table and
    /// root directory to `device`, which must already be exactly
    /// `dev_size` bytes long.
    pub fn write<D: Device>(&mut self, device: &mut D) -> Result<(), Error> {
        let len = device.size().map_err(Error::io)?;
        if len != self.options.dev_size {
            return Err(Error::InvalidArgument(format!(
                "device size {len} does not match the formatted size {}",
                self.options.dev_size
            )));
        }

        let zero_upto = if self.options.full_format {
            self.options.dev_size
        } else {
            self.root_offset_bytes as u64 + self.bytes_per_cluster as u64
        };
        disk::write_zeroes(device, 0, zero_upto)?;

        let sector = self.boot_sector()?;
        boot::write_boot_region(device, boot::MAIN_BOOT_OFFSET, &sector, self.bytes_per_sector())?;
        boot::write_boot_region(device, boot::BACKUP_BOOT_OFFSET, &sector, self.bytes_per_sector())?;

        let region = boot::BootRegion { sector, bytes_per_sector: self.bytes_per_sector() };
        self.write_fat(device, &region)?;
        self.write_bitmap(device)?;
        self.write_upcase_table(device)?;
        self.write_root_directory(device)?;
        info!(
            "formatted {} byte volume, {} clusters of {} bytes each",
            self.options.dev_size, self.cluster_count, self.bytes_per_cluster
        );
        Ok(())
    }

    fn boot_sector(&self) -> Result<BootSector, Error> {
        let mut sector = BootSector::zeroed();
        sector.jump_boot = [0xeb, 0x76, 0x90];
        sector.filesystem_name = *b"EXFAT   ";
        sector.partition_offset = self.options.partition_offset;
        sector.volume_length = self.volume_length;
        sector.fat_offset = self.fat_offset;
        sector.fat_length = self.fat_length;
        sector.cluster_heap_offset = self.cluster_heap_offset;
        sector.cluster_count = self.cluster_count;
        sector.first_cluster_of_root_directory = self.first_cluster_of_root_directory;
        sector.volume_serial_number = volume_serial_number();
        sector.file_system_revision = 0x0100;
        sector.volume_flags = VolumeFlags::empty().bits();
        sector.bytes_per_sector_shift = self.bytes_per_sector_shift;
        sector.sectors_per_cluster_shift = self.sectors_per_cluster_shift;
        sector.number_of_fats = self.number_of_fats;
        sector.drive_select = 0x80;
        sector.percent_in_use = 0xFF;
        sector.boot_code = [0xF4; 390];
        sector.boot_signature = BOOT_SIGNATURE;
        sector.validate()?;
        Ok(sector)
    }

    /// Writes the reserved entries and the three fixed cluster chains
    /// (bitmap, up-case table, root directory) into the FAT, per the
    /// teacher's `write_fat`/`write_fat_entries`.
    fn write_fat<D: Device>(&mut self, device: &mut D, region: &boot::BootRegion) -> Result<(), Error> {
        fat::Fat::write_reserved(device, region)?;

        let mut fat = Fat::load(device, region)?;
        let mut cluster = FIRST_DATA_CLUSTER;
        for length_bytes in [self.bitmap_length_bytes, name::UPCASE_TABLE_SIZE_BYTES, root_directory_length_bytes()] {
            let count = length_bytes.next_multiple_of(self.bytes_per_cluster) / self.bytes_per_cluster;
            let chain: Vec<u32> = (cluster..cluster + count).collect();
            fat.link_chain(&chain);
            for &c in &chain {
                fat.flush_entry(device, region, c)?;
            }
            cluster += count;
        }
        self.cluster_count_used = cluster - FIRST_DATA_CLUSTER;
        Ok(())
    }

    fn write_bitmap<D: Device>(&self, device: &mut D) -> Result<(), Error> {
        let mut bitmap = vec![0u8; self.bitmap_length_bytes as usize];
        let full_bytes = self.cluster_count_used / 8;
        let remaining_bits = self.cluster_count_used % 8;
        bitmap[..full_bytes as usize].fill(0xff);
        let mut zero_offset = full_bytes;
        if remaining_bits != 0 {
            bitmap[full_bytes as usize] = (1 << remaining_bits) - 1;
            zero_offset += 1;
        }
        if zero_offset < self.bitmap_length_bytes {
            bitmap[zero_offset as usize..].fill(0);
        }
        device.write_at(self.bitmap_offset_bytes as u64, &bitmap).map_err(Error::io)
    }

    fn write_upcase_table<D: Device>(&self, device: &mut D) -> Result<(), Error> {
        let table = name::default_table();
        device.write_at(self.upcase_offset_bytes as u64, &table.as_bytes()).map_err(Error::io)
    }

    fn write_root_directory<D: Device>(&self, device: &mut D) -> Result<(), Error> {
        let mut entries = Vec::new();

        entries.push(DirEntry::Bitmap(BitmapEntry::new(FIRST_DATA_CLUSTER, self.bitmap_length_bytes as u64)));
        entries.push(DirEntry::UpcaseTable(UpcaseTableEntry::new(
            self.upcase_start_cluster,
            name::UPCASE_TABLE_SIZE_BYTES as u64,
            name::default_table().checksum(),
        )));

        if let Some(label) = &self.options.volume_label {
            let units = name::encode_name(label)?;
            entries.push(DirEntry::VolumeLabel(VolumeLabelEntry::new(&units)));
        }

        if let Some(guid) = self.options.guid {
            let mut guid_entry = VolumeGuidEntry { secondary_count: 0, set_checksum: 0, general_primary_flags: 0, volume_guid: guid, _reserved: [0; 10] };
            let checksum = crate::entry::set_checksum(std::slice::from_ref(&DirEntry::VolumeGuid(guid_entry)));
            guid_entry.set_checksum = checksum;
            entries.push(DirEntry::VolumeGuid(guid_entry));
        }

        while entries.len() < 3 {
            entries.push(DirEntry::new_unused(0));
        }
        entries.push(DirEntry::EndOfDirectory([0; 31]));

        let mut offset = self.root_offset_bytes as u64;
        for entry in entries {
            device.write_at(offset, &entry.bytes()).map_err(Error::io)?;
            offset += 32;
        }
        Ok(())
    }

}

fn root_directory_length_bytes() -> u32 {
    32 * 3
}

fn volume_serial_number() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn format(size: u64) -> (Formatter, Cursor<Vec<u8>>) {
        let mut device = Cursor::new(vec![0u8; size as usize]);
        let options = FormatVolumeOptionsBuilder::default()
            .dev_size(size)
            .bytes_per_sector(512u16)
            .pack_bitmap(false)
            .build()
            .unwrap();
        let mut formatter = Formatter::try_from(options).unwrap();
        formatter.write(&mut device).unwrap();
        (formatter, device)
    }

    #[test]
    fn computes_expected_layout_for_small_volume() {
        let (formatter, _) = format(32 * crate::MB as u64);
        assert_eq!(formatter.bytes_per_sector_shift, 9);
        assert_eq!(formatter.sectors_per_cluster_shift, 3);
        assert!(formatter.cluster_count > 0);
    }

    #[test]
    fn main_and_backup_boot_checksums_match() {
        let (_, mut device) = format(32 * crate::MB as u64);
        let mut main = [0u8; 512];
        let mut backup = [0u8; 512];
        device.read_at(11 * 512, &mut main).unwrap();
        device.read_at(23 * 512, &mut backup).unwrap();
        assert_eq!(main, backup);
    }

    #[test]
    fn root_directory_has_bitmap_and_upcase_entries() {
        let (formatter, mut device) = format(32 * crate::MB as u64);
        let mut buf = [0u8; 32];
        device.read_at(formatter.root_offset_bytes as u64, &mut buf).unwrap();
        assert_eq!(buf[0], 0x81);
        device.read_at(formatter.root_offset_bytes as u64 + 32, &mut buf).unwrap();
        assert_eq!(buf[0], 0x82);
    }

    #[test]
    fn rejects_device_size_mismatch() {
        let options = FormatVolumeOptionsBuilder::default()
            .dev_size(32 * crate::MB as u64)
            .bytes_per_sector(512u16)
            .build()
            .unwrap();
        let mut formatter = Formatter::try_from(options).unwrap();
        let mut device = Cursor::new(vec![0u8; 16 * crate::MB as usize]);
        assert!(formatter.write(&mut device).is_err());
    }

    #[test]
    fn builder_rejects_non_power_of_two_sector_size() {
        let result = FormatVolumeOptionsBuilder::default()
            .dev_size(32 * crate::MB as u64)
            .bytes_per_sector(500u16)
            .build();
        assert!(result.is_err());
    }
}
