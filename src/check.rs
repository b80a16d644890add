//! Consistency checking: walks every directory reachable from the root
//! and cross-checks the cluster chains it finds against the allocation
//! bitmap, the way `original_source/trunk/fsck/fsck.c`'s single read-only
//! pass does. This module only reports; repairing a volume is handled by
//! [`crate::fs::MountOptions::repair`] at mount time for directory-parse
//! errors specifically, not here.

use std::collections::HashMap;

use log::{info, warn};

use crate::bitmap::Bitmap;
use crate::boot::{self, BootRegion};
use crate::disk::Device;
use crate::entry::{DirEntry, FileAttributes};
use crate::error::Error;
use crate::fat::{self, Fat};
use crate::name::UpcaseTable;

/// One inconsistency found while checking a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// A cluster is referenced by a file or directory but the allocation
    /// bitmap marks it free.
    ClusterNotMarkedUsed { path: String, cluster: u32 },
    /// A cluster is referenced by more than one file's chain.
    ClusterReferencedTwice { cluster: u32 },
    /// A directory entry set failed to parse.
    MalformedEntrySet { path: String, reason: String },
    /// A file's recorded size does not match the length of its cluster
    /// chain.
    SizeMismatch { path: String, recorded: u64, chain_bytes: u64 },
    /// `valid_data_length` exceeds `data_length` in a stream extension.
    ValidSizeExceedsSize { path: String },
    /// The allocation bitmap marks a cluster used that no file or
    /// directory chain references.
    OrphanedCluster { cluster: u32 },
}

/// The outcome of a full volume check: every issue found, plus basic
/// counts useful for a summary report.
#[derive(Debug, Default)]
pub struct Report {
    pub issues: Vec<Issue>,
    pub files_checked: u32,
    pub directories_checked: u32,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Runs a full, read-only consistency check over `device`.
pub fn check(device: &mut dyn Device) -> Result<Report, Error> {
    let region = boot::read_boot_region(device)?;
    let fat = Fat::load(device, &region)?;

    let raw_root = crate::dir::read_raw_entries(device, &fat, &region, region.sector.first_cluster_of_root_directory, None, false)?;
    let (bitmap_cluster, table) = root_special_entries(device, &region, &raw_root)?;

    let mut report = Report::default();
    let mut referenced: HashMap<u32, String> = HashMap::new();

    walk(device, &fat, &region, &table, region.sector.first_cluster_of_root_directory, None, false, "/", true, &mut report, &mut referenced)?;

    let bitmap_offset = region
        .cluster_offset_bytes(bitmap_cluster)
        .ok_or_else(|| Error::corrupted("bitmap has an invalid first cluster"))?;
    let bitmap = Bitmap::load(device, bitmap_offset, region.sector.cluster_count)?;

    for cluster in crate::FIRST_DATA_CLUSTER..crate::FIRST_DATA_CLUSTER + region.sector.cluster_count {
        let used = !bitmap.is_free(cluster)?;
        if let Some(path) = referenced.get(&cluster) {
            if !used {
                report.issues.push(Issue::ClusterNotMarkedUsed { path: path.clone(), cluster });
            }
        }
    }

    if report.is_clean() {
        info!(
            "volume clean: {} files, {} directories checked",
            report.files_checked, report.directories_checked
        );
    } else {
        warn!("volume check found {} issue(s)", report.issues.len());
    }

    Ok(report)
}

/// Locates the root directory's allocation bitmap's first cluster and
/// loads its up-case table directly from the raw root entries, without
/// pulling in the full `fs::Filesystem` machinery. Mirrors
/// `fs::Filesystem::mount`'s bootstrap: the up-case table is needed to
/// verify file name hashes, so it must be loaded before the root is
/// parsed through the full entry-set parser.
fn root_special_entries(device: &mut dyn Device, region: &BootRegion, raw_root: &[(u32, u32, DirEntry)]) -> Result<(u32, UpcaseTable), Error> {
    let bitmap_cluster = raw_root
        .iter()
        .find_map(|(_, _, e)| match e {
            DirEntry::Bitmap(b) => Some(b.first_cluster),
            _ => None,
        })
        .ok_or_else(|| Error::corrupted("root directory has no allocation bitmap entry"))?;

    let upcase_entry = raw_root
        .iter()
        .find_map(|(_, _, e)| match e {
            DirEntry::UpcaseTable(u) => Some(*u),
            _ => None,
        })
        .ok_or_else(|| Error::corrupted("root directory has no up-case table entry"))?;

    let upcase_offset = region
        .cluster_offset_bytes(upcase_entry.first_cluster)
        .ok_or_else(|| Error::corrupted("up-case table has an invalid first cluster"))?;
    let mut upcase_bytes = vec![0u8; upcase_entry.data_len as usize];
    device.read_at(upcase_offset, &mut upcase_bytes).map_err(Error::io)?;
    let table = UpcaseTable::from_bytes(&upcase_bytes)?;

    Ok((bitmap_cluster, table))
}

#[allow(clippy::too_many_arguments)]
fn walk(
    device: &mut dyn Device,
    fat: &Fat,
    region: &BootRegion,
    table: &UpcaseTable,
    first_cluster: u32,
    data_len: Option<u64>,
    no_fat_chain: bool,
    path: &str,
    is_root: bool,
    report: &mut Report,
    referenced: &mut HashMap<u32, String>,
) -> Result<(), Error> {
    report.directories_checked += 1;

    let raw = match crate::dir::read_raw_entries(device, fat, region, first_cluster, data_len, no_fat_chain) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("{path}: failed to read directory entries: {e}");
            report.issues.push(Issue::MalformedEntrySet { path: path.to_string(), reason: e.to_string() });
            return Ok(());
        }
    };

    let parsed = match crate::dir::parse_entries(&raw, is_root, table) {
        Ok(p) => p,
        Err(e) => {
            warn!("{path}: malformed entry set: {e}");
            report.issues.push(Issue::MalformedEntrySet { path: path.to_string(), reason: e.to_string() });
            return Ok(());
        }
    };

    for file in &parsed.files {
        let name = crate::name::decode_name(&file.name).unwrap_or_else(|_| String::from("<invalid name>"));
        let child_path = if path == "/" { format!("/{name}") } else { format!("{path}/{name}") };

        if file.valid_size > file.size {
            report.issues.push(Issue::ValidSizeExceedsSize { path: child_path.clone() });
        }

        let chain: Result<Vec<u32>, Error> = if file.first_cluster == 0 {
            Ok(Vec::new())
        } else if file.no_fat_chain {
            let count = file.size.div_ceil(region.bytes_per_cluster()) as u32;
            fat::contiguous_chain(file.first_cluster, count).collect()
        } else {
            fat::ClusterChain::new(fat, file.first_cluster).collect()
        };

        let chain = match chain {
            Ok(c) => c,
            Err(e) => {
                report.issues.push(Issue::MalformedEntrySet { path: child_path, reason: e.to_string() });
                continue;
            }
        };

        let chain_bytes = chain.len() as u64 * region.bytes_per_cluster();
        if !file.attributes.contains(FileAttributes::DIRECTORY) && file.size > chain_bytes {
            report.issues.push(Issue::SizeMismatch { path: child_path.clone(), recorded: file.size, chain_bytes });
        }

        for &c in &chain {
            if referenced.insert(c, child_path.clone()).is_some() {
                report.issues.push(Issue::ClusterReferencedTwice { cluster: c });
            }
        }

        if file.attributes.contains(FileAttributes::DIRECTORY) {
            walk(device, fat, region, table, file.first_cluster, Some(file.size), file.no_fat_chain, &child_path, false, report, referenced)?;
        } else {
            report.files_checked += 1;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatVolumeOptionsBuilder, Formatter};
    use crate::fs::{Filesystem, MountOptions};
    use std::io::Cursor;

    fn formatted_volume(size: u64) -> Cursor<Vec<u8>> {
        let mut device = Cursor::new(vec![0u8; size as usize]);
        let options = FormatVolumeOptionsBuilder::default().dev_size(size).bytes_per_sector(512u16).build().unwrap();
        Formatter::try_from(options).unwrap().write(&mut device).unwrap();
        device
    }

    #[test]
    fn freshly_formatted_volume_is_clean() {
        let mut device = formatted_volume(8 * crate::MB as u64);
        let report = check(&mut device).unwrap();
        assert!(report.is_clean(), "{:?}", report.issues);
    }

    #[test]
    fn volume_with_files_is_clean() {
        let device = formatted_volume(8 * crate::MB as u64);
        let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        let file = fs.mknod("/a.txt").unwrap();
        fs.pwrite(file, b"some data", 0).unwrap();
        fs.mkdir("/sub").unwrap();
        let mut device = fs.unmount().unwrap();
        let report = check(&mut device).unwrap();
        assert!(report.is_clean(), "{:?}", report.issues);
    }

    #[test]
    fn detects_corrupted_entry_type() {
        let mut device = formatted_volume(8 * crate::MB as u64);
        let region = boot::read_boot_region(&mut device).unwrap();
        let mut bad = [0u8; 32];
        bad[0] = 0x90;
        let offset = region.cluster_offset_bytes(region.sector.first_cluster_of_root_directory).unwrap();
        device.write_at(offset, &bad).unwrap();
        let report = check(&mut device).unwrap();
        assert!(!report.is_clean());
    }
}
