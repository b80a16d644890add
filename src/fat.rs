//! The File Allocation Table: a flat array of 32-bit cluster pointers and
//! the fallible iterator that walks a chain of them.
//!
//! Grounded in the teacher's (dead, read-only) `fat::Fat::load` for the
//! on-disk layout, and in `original_source/trunk/libexfat/cluster.c`'s
//! `exfat_next_cluster`/`make_noncontiguous` for the chain-walking and
//! contiguous-chain materialization semantics, generalized here from
//! read-only to read-write.

use crate::boot::BootRegion;
use crate::disk::Device;
use crate::error::Error;

pub const FREE: u32 = 0x0000_0000;
pub const BAD: u32 = 0xFFFF_FFF7;
pub const EOF: u32 = 0xFFFF_FFFF;

/// The reserved FAT entry written at index 0: media type byte `0xF8`
/// followed by `0xFF` three times.
pub const MEDIA_TYPE_ENTRY: u32 = 0xFFFF_FFF8;

/// The loaded File Allocation Table for one volume.
#[derive(Debug, Clone)]
pub struct Fat {
    entries: Vec<u32>,
    offset_bytes: u64,
}

impl Fat {
    /// Loads the active FAT (per `BootRegion::active_fat_index`) in full.
    pub fn load(device: &mut dyn Device, region: &BootRegion) -> Result<Self, Error> {
        let fat_index = region.active_fat_index();
        let offset_bytes =
            region.fat_offset_bytes() + fat_index as u64 * region.fat_length_bytes();
        let count = (region.sector.cluster_count + 2) as usize;
        let mut buf = vec![0u8; count * 4];
        device.read_at(offset_bytes, &mut buf).map_err(Error::io)?;
        let entries = buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { entries, offset_bytes })
    }

    pub fn entry(&self, cluster: u32) -> Result<u32, Error> {
        self.entries
            .get(cluster as usize)
            .copied()
            .ok_or_else(|| Error::corrupted(format!("cluster {cluster} out of range")))
    }

    pub fn set_entry(&mut self, cluster: u32, value: u32) {
        self.entries[cluster as usize] = value;
    }

    pub fn cluster_count(&self) -> u32 {
        self.entries.len() as u32 - 2
    }

    /// Writes a single FAT entry at `cluster` to `device` at every active
    /// FAT copy described by `region`.
    pub fn flush_entry(
        &self,
        device: &mut dyn Device,
        region: &BootRegion,
        cluster: u32,
    ) -> Result<(), Error> {
        let value = self.entry(cluster)?.to_le_bytes();
        let copies = if region.sector.number_of_fats == 2 { 2 } else { 1 };
        for fat_index in 0..copies {
            let base = region.fat_offset_bytes() + fat_index as u64 * region.fat_length_bytes();
            device
                .write_at(base + cluster as u64 * 4, &value)
                .map_err(Error::io)?;
        }
        Ok(())
    }

    /// Writes the reserved entries 0 and 1, per
    /// `original_source/trunk/libexfat/exfatfs.h`.
    pub fn write_reserved(device: &mut dyn Device, region: &BootRegion) -> Result<(), Error> {
        let copies = if region.sector.number_of_fats == 2 { 2 } else { 1 };
        for fat_index in 0..copies {
            let base = region.fat_offset_bytes() + fat_index as u64 * region.fat_length_bytes();
            device
                .write_at(base, &MEDIA_TYPE_ENTRY.to_le_bytes())
                .map_err(Error::io)?;
            device
                .write_at(base + 4, &EOF.to_le_bytes())
                .map_err(Error::io)?;
        }
        Ok(())
    }

    /// Writes a run of fixed FAT entries linking `first..=last` into a
    /// chain terminated by `EOF`, used both by the formatter (bitmap,
    /// up-case table and root directory chains) and by
    /// `fs::Filesystem::mknod`/`truncate` when materializing a
    /// non-contiguous chain.
    pub fn link_chain(&mut self, clusters: &[u32]) {
        for window in clusters.windows(2) {
            self.set_entry(window[0], window[1]);
        }
        if let Some(&last) = clusters.last() {
            self.set_entry(last, EOF);
        }
    }

    pub fn offset_bytes(&self) -> u64 {
        self.offset_bytes
    }
}

/// A fallible iterator walking a cluster chain through the FAT, starting
/// from `first`. Mirrors `exfat_next_cluster` without the contiguous-chain
/// shortcut, which callers holding a `no_fat_chain` stream extension
/// instead compute directly from the cluster count.
pub struct ClusterChain<'a> {
    fat: &'a Fat,
    next: Option<u32>,
}

impl<'a> ClusterChain<'a> {
    pub fn new(fat: &'a Fat, first: u32) -> Self {
        let next = if first >= crate::FIRST_DATA_CLUSTER {
            Some(first)
        } else {
            None
        };
        Self { fat, next }
    }
}

impl<'a> Iterator for ClusterChain<'a> {
    type Item = Result<u32, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = match self.fat.entry(current) {
            Ok(EOF) | Ok(FREE) => None,
            Ok(BAD) => {
                return Some(Err(Error::corrupted(format!(
                    "cluster chain references bad cluster {current}"
                ))));
            }
            Ok(next) if next < crate::FIRST_DATA_CLUSTER => {
                return Some(Err(Error::corrupted(format!(
                    "cluster chain entry {current} points at reserved cluster {next}"
                ))));
            }
            Ok(next) => Some(next),
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(current))
    }
}

/// A contiguous run of clusters `[first, first + count)`, used for stream
/// extensions with the `no_fat_chain` flag set.
pub fn contiguous_chain(first: u32, count: u32) -> impl Iterator<Item = Result<u32, Error>> {
    (first..first + count).map(Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::sector::BootSector;
    use std::io::Cursor;

    fn region(cluster_count: u32) -> BootRegion {
        let mut s = BootSector::zeroed();
        s.number_of_fats = 1;
        s.fat_offset = 1;
        s.fat_length = 1;
        s.cluster_count = cluster_count;
        BootRegion { sector: s, bytes_per_sector: 512 }
    }

    fn loaded_fat(entries: &[u32]) -> (Fat, BootRegion) {
        let region = region(entries.len() as u32 - 2);
        let mut device = Cursor::new(vec![0u8; 4096]);
        for (i, &e) in entries.iter().enumerate() {
            device.write_at(512 + i as u64 * 4, &e.to_le_bytes()).unwrap();
        }
        (Fat::load(&mut device, &region).unwrap(), region)
    }

    #[test]
    fn walks_chain_to_eof() {
        let (fat, _) = loaded_fat(&[MEDIA_TYPE_ENTRY, EOF, 3, 4, EOF]);
        let chain: Result<Vec<u32>, _> = ClusterChain::new(&fat, 2).collect();
        assert_eq!(chain.unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn detects_bad_cluster() {
        let (fat, _) = loaded_fat(&[MEDIA_TYPE_ENTRY, EOF, BAD]);
        let chain: Result<Vec<u32>, _> = ClusterChain::new(&fat, 2).collect();
        assert!(chain.is_err());
    }

    #[test]
    fn link_chain_sets_eof_on_last() {
        let (mut fat, _) = loaded_fat(&[MEDIA_TYPE_ENTRY, EOF, 0, 0, 0]);
        fat.link_chain(&[2, 3, 4]);
        assert_eq!(fat.entry(2).unwrap(), 3);
        assert_eq!(fat.entry(3).unwrap(), 4);
        assert_eq!(fat.entry(4).unwrap(), EOF);
    }

    #[test]
    fn contiguous_chain_is_a_plain_range() {
        let v: Result<Vec<u32>, Error> = contiguous_chain(5, 3).collect();
        assert_eq!(v.unwrap(), vec![5, 6, 7]);
    }
}
