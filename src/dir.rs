//! Directory parsing and entry-set placement.
//!
//! Generalizes the teacher's ad hoc `dir::Root::open` loop (which only
//! ever read the root directory once, at mount time) and the duplicate
//! logic in `fs::directory::Directory::open` into one reusable parser
//! consumed both at mount time and by on-demand directory scans, per the
//! Idle / FileOpen(n) / InfoSeen(n) state machine. Name decoding follows
//! `dir::entry::parsed::ParsedFileEntry::try_new`.

use crate::boot::BootRegion;
use crate::disk::Device;
use crate::entry::{
    BitmapEntry, ClusterAllocation, DirEntry, FileAttributes, FileEntry, FileNameEntry,
    GeneralSecondaryFlags, StreamExtensionEntry, UpcaseTableEntry,
};
use crate::error::Error;
use crate::fat::{self, Fat};
use crate::name;
use crate::timestamp::Timestamp;

/// Walks a directory's cluster chain and decodes every 32-byte record,
/// stopping at the first `EndOfDirectory` entry. `data_len` bounds the
/// scan for directories whose size is known (every directory but the
/// root); `None` walks the full FAT chain. Shared by
/// [`crate::fs::Filesystem`] and [`crate::check`].
pub fn read_raw_entries(
    device: &mut dyn Device,
    fat: &Fat,
    region: &BootRegion,
    first_cluster: u32,
    data_len: Option<u64>,
    no_fat_chain: bool,
) -> Result<Vec<(u32, u32, DirEntry)>, Error> {
    let bytes_per_cluster = region.bytes_per_cluster();
    let clusters: Vec<u32> = if no_fat_chain {
        let count = data_len.map(|l| l.div_ceil(bytes_per_cluster)).unwrap_or(1).max(1) as u32;
        (first_cluster..first_cluster + count).collect()
    } else {
        fat::ClusterChain::new(fat, first_cluster).collect::<Result<Vec<_>, _>>()?
    };

    let entries_per_cluster = (bytes_per_cluster / 32) as usize;
    let mut out = Vec::new();
    'outer: for &cluster in &clusters {
        let base = region
            .cluster_offset_bytes(cluster)
            .ok_or_else(|| Error::corrupted("directory cluster out of range"))?;
        let mut buf = vec![0u8; bytes_per_cluster as usize];
        device.read_at(base, &mut buf).map_err(Error::io)?;
        for i in 0..entries_per_cluster {
            let mut raw = [0u8; 32];
            raw.copy_from_slice(&buf[i * 32..i * 32 + 32]);
            let entry = DirEntry::try_from(raw)?;
            let is_eod = matches!(entry, DirEntry::EndOfDirectory(_));
            out.push((cluster, i as u32, entry));
            if is_eod {
                break 'outer;
            }
        }
    }
    Ok(out)
}

/// One decoded file or subdirectory entry set from a parsed directory.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub name: Vec<u16>,
    pub attributes: FileAttributes,
    pub first_cluster: u32,
    pub size: u64,
    pub valid_size: u64,
    pub no_fat_chain: bool,
    pub created: Timestamp,
    pub modified: Timestamp,
    pub accessed: Timestamp,
    /// Cluster and byte offset of the `File` primary entry, recorded so
    /// the entry set can be rewritten or erased later.
    pub entry_cluster: u32,
    pub entry_offset: u32,
    pub continuations: u8,
}

/// The result of parsing one directory's entries: root-only special
/// entries plus the regular file/subdirectory list.
#[derive(Debug, Clone, Default)]
pub struct ParsedDirectory {
    pub volume_label: Option<Vec<u16>>,
    pub bitmaps: Vec<BitmapEntry>,
    pub upcase: Option<UpcaseTableEntry>,
    pub files: Vec<ParsedFile>,
}

/// The state machine driving entry-set assembly while walking a flat
/// sequence of 32-byte records: `Idle` between entry sets, `FileOpen(n)`
/// after a `File` primary entry announcing `n` secondary entries still to
/// come, `InfoSeen(n)` after the stream extension with `n` file-name
/// entries still expected.
enum State {
    Idle,
    FileOpen {
        secondary_remaining: u8,
        entry: FileEntry,
        cluster: u32,
        offset: u32,
        raw: Vec<DirEntry>,
    },
    InfoSeen {
        secondary_remaining: u8,
        entry: FileEntry,
        stream: StreamExtensionEntry,
        name_units: Vec<u16>,
        cluster: u32,
        offset: u32,
        raw: Vec<DirEntry>,
    },
}

/// Parses a flat stream of `(cluster, offset_in_cluster, entry)` records
/// — as produced while walking a directory's cluster chain — into a
/// [`ParsedDirectory`]. `is_root` additionally permits `Bitmap`,
/// `UpcaseTable` and `VolumeLabel` entries, which are only legal in the
/// root directory. `table` folds each assembled name to cross-check
/// against the stored name hash, per `exfat_calc_name_hash`; every
/// completed entry set's checksum is likewise recomputed and compared
/// against the `File` entry's `set_checksum`, per `exfat_calc_checksum`.
/// Either mismatch is reported as [`Error::Corrupted`].
pub fn parse_entries(
    entries: &[(u32, u32, DirEntry)],
    is_root: bool,
    table: &name::UpcaseTable,
) -> Result<ParsedDirectory, Error> {
    let mut out = ParsedDirectory::default();
    let mut state = State::Idle;

    for &(cluster, offset, entry) in entries {
        match entry {
            DirEntry::EndOfDirectory(_) => break,
            DirEntry::Bitmap(b) if is_root => {
                out.bitmaps.push(b);
            }
            DirEntry::UpcaseTable(u) if is_root => {
                if out.upcase.is_some() {
                    return Err(Error::corrupted("duplicate up-case table entry"));
                }
                out.upcase = Some(u);
            }
            DirEntry::VolumeLabel(l) if is_root => {
                if out.volume_label.is_some() {
                    return Err(Error::corrupted("duplicate volume label entry"));
                }
                let volume_label = l.volume_label;
                out.volume_label = Some(volume_label[..l.character_count as usize].to_vec());
            }
            DirEntry::Bitmap(_) | DirEntry::UpcaseTable(_) | DirEntry::VolumeLabel(_) => {
                return Err(Error::corrupted("special entry outside root directory"));
            }
            DirEntry::File(file) => {
                if file.secondary_count < 2 {
                    return Err(Error::corrupted("file entry missing stream extension"));
                }
                state = State::FileOpen {
                    secondary_remaining: file.secondary_count,
                    entry: file,
                    cluster,
                    offset,
                    raw: vec![DirEntry::File(file)],
                };
            }
            DirEntry::StreamExtension(stream) => {
                let State::FileOpen { secondary_remaining, entry, cluster: c, offset: o, mut raw } = state
                else {
                    return Err(Error::corrupted("stream extension without a file entry"));
                };
                if !stream.valid() {
                    return Err(Error::corrupted("invalid stream extension entry"));
                }
                raw.push(DirEntry::StreamExtension(stream));
                state = State::InfoSeen {
                    secondary_remaining: secondary_remaining - 1,
                    entry,
                    stream,
                    name_units: Vec::with_capacity(stream.name_length as usize),
                    cluster: c,
                    offset: o,
                    raw,
                };
            }
            DirEntry::FileName(name_entry) => {
                let State::InfoSeen {
                    secondary_remaining,
                    entry,
                    stream,
                    mut name_units,
                    cluster: c,
                    offset: o,
                    mut raw,
                } = state
                else {
                    return Err(Error::corrupted("file name entry without a stream extension"));
                };
                let flags = GeneralSecondaryFlags::from_bits_truncate(name_entry.general_secondary_flags);
                if flags.allocation_possible() {
                    return Err(Error::corrupted("file name entry must not allocate"));
                }
                raw.push(DirEntry::FileName(name_entry));
                let file_name = name_entry.file_name;
                name_units.extend_from_slice(&file_name);

                if secondary_remaining == 1 {
                    name_units.truncate(stream.name_length as usize);

                    let expected_checksum = crate::entry::set_checksum(&raw);
                    if expected_checksum != entry.set_checksum {
                        return Err(Error::corrupted("entry set checksum mismatch"));
                    }
                    let expected_hash = name::name_hash(table, &name_units);
                    if expected_hash != stream.name_hash {
                        return Err(Error::corrupted("file name hash mismatch"));
                    }

                    out.files.push(ParsedFile {
                        name: name_units,
                        attributes: FileAttributes::from_bits_truncate(entry.file_attributes),
                        first_cluster: stream.first_cluster,
                        size: stream.data_len,
                        valid_size: stream.valid_data_length,
                        no_fat_chain: GeneralSecondaryFlags::from_bits_truncate(stream.general_secondary_flags).no_fat_chain(),
                        created: entry.create_timestamp(),
                        modified: entry.modified_timestamp(),
                        accessed: entry.accessed_timestamp(),
                        entry_cluster: c,
                        entry_offset: o,
                        continuations: entry.secondary_count,
                    });
                    state = State::Idle;
                } else {
                    state = State::InfoSeen {
                        secondary_remaining: secondary_remaining - 1,
                        entry,
                        stream,
                        name_units,
                        cluster: c,
                        offset: o,
                        raw,
                    };
                }
            }
            DirEntry::VolumeGuid(_) | DirEntry::VendorExtension(_) | DirEntry::VendorAllocation(_) => {
                // Benign entries this crate does not interpret; they do not
                // alter directory semantics and are skipped.
                state = State::Idle;
            }
            // Remaining variants are the `Unused` range (expanded by
            // `#[range_enum]` into `Unused1..Unused127`) plus `Invalid`.
            _ => {
                state = State::Idle;
                continue;
            }
        }
    }

    Ok(out)
}

/// Builds the entry set for a new file or subdirectory: a `File` primary
/// entry, a `StreamExtension` entry and as many `FileName` entries as the
/// name requires.
pub fn build_entry_set(
    table: &name::UpcaseTable,
    name_units: &[u16],
    attributes: FileAttributes,
    first_cluster: u32,
    size: u64,
    no_fat_chain: bool,
    now: Timestamp,
) -> Vec<DirEntry> {
    let name_entry_count = name_units.len().div_ceil(15).max(1);
    let secondary_count = 1 + name_entry_count as u8;

    let mut file_entry = FileEntry::new(secondary_count, attributes, now);

    let mut flags = GeneralSecondaryFlags::ALLOCATION_POSSIBLE;
    if no_fat_chain {
        flags |= GeneralSecondaryFlags::NO_FAT_CHAIN;
    }
    let hash = name::name_hash(table, name_units);
    let stream_entry = StreamExtensionEntry::new(flags, name_units.len() as u8, hash, size, first_cluster, size);

    let mut entries = vec![DirEntry::File(file_entry), DirEntry::StreamExtension(stream_entry)];
    for chunk in name_units.chunks(15) {
        entries.push(DirEntry::FileName(FileNameEntry::new(chunk)));
    }

    let checksum = crate::entry::set_checksum(&entries);
    file_entry.set_checksum = checksum;
    entries[0] = DirEntry::File(file_entry);
    entries
}

/// Locates a run of `count` consecutive free (unused or end-of-directory)
/// entry slots within an already-decoded flat entry stream, returning the
/// `(cluster, offset)` of the run's first slot. `None` means the
/// directory must grow by another cluster to fit the entry set.
pub fn find_free_run(raw: &[(u32, u32, DirEntry)], count: usize) -> Option<(u32, u32)> {
    let mut run_start = None;
    let mut run_len = 0usize;
    for &(cluster, offset, entry) in raw {
        let is_free = entry.unused() || matches!(entry, DirEntry::EndOfDirectory(_));
        if is_free {
            if run_len == 0 {
                run_start = Some((cluster, offset));
            }
            run_len += 1;
            if run_len == count {
                return run_start;
            }
        } else {
            run_len = 0;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::GeneralSecondaryFlags;

    #[test]
    fn parses_single_file_entry_set() {
        let table = name::default_table();
        let units = name::encode_name("a.txt").unwrap();
        let set = build_entry_set(&table, &units, FileAttributes::ARCHIVE, 5, 3, false, Timestamp::now());
        let raw: Vec<_> = set.into_iter().enumerate().map(|(i, e)| (2u32, i as u32, e)).collect();
        let parsed = parse_entries(&raw, false, &table).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].name, units);
        assert_eq!(parsed.files[0].first_cluster, 5);
    }

    #[test]
    fn rejects_root_only_entries_outside_root() {
        let table = name::default_table();
        let bitmap = DirEntry::Bitmap(BitmapEntry::new(2, 128));
        let raw = vec![(2u32, 0u32, bitmap)];
        assert!(parse_entries(&raw, false, &table).is_err());
    }

    #[test]
    fn finds_free_run_of_requested_length() {
        let free = DirEntry::new_unused(0x05);
        let raw = vec![(2u32, 0u32, free), (2u32, 1u32, free), (2u32, 2u32, free)];
        assert_eq!(find_free_run(&raw, 2), Some((2, 0)));
    }

    #[test]
    fn no_free_run_when_all_entries_in_use() {
        let table = name::default_table();
        let units = name::encode_name("a").unwrap();
        let set = build_entry_set(&table, &units, FileAttributes::empty(), 0, 0, false, Timestamp::now());
        let raw: Vec<_> = set.into_iter().enumerate().map(|(i, e)| (2u32, i as u32, e)).collect();
        assert_eq!(find_free_run(&raw, 1), None);
    }

    #[test]
    fn stream_extension_no_fat_chain_flag_round_trips() {
        let table = name::default_table();
        let units = name::encode_name("b").unwrap();
        let set = build_entry_set(&table, &units, FileAttributes::empty(), 2, 10, true, Timestamp::now());
        if let DirEntry::StreamExtension(stream) = set[1] {
            assert!(GeneralSecondaryFlags::from_bits_truncate(stream.general_secondary_flags).no_fat_chain());
        } else {
            panic!("expected stream extension entry");
        }
    }
}
