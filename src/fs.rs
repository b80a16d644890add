//! The mounted filesystem handle: lookup, directory iteration, metadata
//! mutation and cluster-chain data I/O.
//!
//! Grounded in `original_source/trunk/libexfat/`'s `lookup.c` (name
//! resolution), `node.c` (create/unlink/rename), and `cluster.c`
//! (grow/shrink, reused here via [`crate::bitmap::Bitmap`]); mount-time
//! validation follows the teacher's `dir::Root::open`, generalized from a
//! read-only snapshot into a live, writable handle.

use derive_builder::Builder;
use log::{debug, trace, warn};

use crate::bitmap::Bitmap;
use crate::boot::{self, BootRegion};
use crate::disk::Device;
use crate::entry::{DirEntry, FileAttributes};
use crate::error::Error;
use crate::fat::{self, Fat};
use crate::name::{self, UpcaseTable};
use crate::node::{Node, NodeCache, NodeId};
use crate::timestamp::Timestamp;

/// A reference to an open file or directory. Handles are stable across
/// operations until the node they name is unlinked and its last
/// reference is dropped via [`Filesystem::close`].
pub type Handle = NodeId;

/// Mount-time options, mirroring `-o key=val,...` mount flags.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), default)]
pub struct MountOptions {
    pub read_only: bool,
    pub no_atime: bool,
    /// Attempt to repair minor inconsistencies encountered while parsing
    /// directories instead of failing the mount.
    pub repair: bool,
    pub uid: u32,
    pub gid: u32,
    pub dmask: u16,
    pub fmask: u16,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            no_atime: false,
            repair: false,
            uid: 0,
            gid: 0,
            dmask: 0o022,
            fmask: 0o022,
        }
    }
}

impl MountOptions {
    /// Parses a comma-separated `key=value,key,...` option string, in the
    /// style of the original's mount option parser. Unknown keys are
    /// rejected with [`Error::InvalidArgument`].
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut options = MountOptions::default();
        if input.is_empty() {
            return Ok(options);
        }
        for item in input.split(',') {
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (item, None),
            };
            match key {
                "ro" => options.read_only = true,
                "rw" => options.read_only = false,
                "noatime" => options.no_atime = true,
                "repair" => options.repair = true,
                "uid" => options.uid = parse_value(key, value)?,
                "gid" => options.gid = parse_value(key, value)?,
                "dmask" => options.dmask = parse_value(key, value)?,
                "fmask" => options.fmask = parse_value(key, value)?,
                _ => return Err(Error::InvalidArgument(format!("unknown mount option: {key}"))),
            }
        }
        Ok(options)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: Option<&str>) -> Result<T, Error> {
    value
        .ok_or_else(|| Error::InvalidArgument(format!("option {key} requires a value")))?
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid value for option {key}")))
}

/// A mounted exFAT volume.
pub struct Filesystem<D: Device> {
    device: D,
    region: BootRegion,
    fat: Fat,
    bitmap: Bitmap,
    bitmap_entry_cluster: u32,
    upcase: UpcaseTable,
    cache: NodeCache,
    root: NodeId,
    options: MountOptions,
}

impl<D: Device> Filesystem<D> {
    /// Mounts `device`: reads and validates the boot region, loads the
    /// FAT, locates and loads the allocation bitmap and up-case table
    /// from the root directory, and caches the root directory's
    /// immediate children.
    pub fn mount(mut device: D, options: MountOptions) -> Result<Self, Error> {
        let region = boot::read_boot_region(&mut device)?;
        let fat = Fat::load(&mut device, &region)?;

        let root_cluster = region.sector.first_cluster_of_root_directory;
        let raw_root = crate::dir::read_raw_entries(&mut device, &fat, &region, root_cluster, None, false)?;

        // Locate the bitmap and up-case table entries directly, without
        // running the full parser: verifying a file's name hash requires
        // the up-case table this scan exists to load in the first place.
        let expected_bitmaps = if region.sector.number_of_fats == 2 { 2 } else { 1 };
        let bitmap_entries: Vec<_> = raw_root
            .iter()
            .filter_map(|(_, _, e)| match e {
                DirEntry::Bitmap(b) => Some(*b),
                _ => None,
            })
            .collect();
        if bitmap_entries.len() != expected_bitmaps {
            return Err(Error::corrupted("unexpected number of allocation bitmap entries"));
        }
        let active_bitmap = bitmap_entries
            .iter()
            .find(|b| b.index() as u32 == region.active_fat_index())
            .ok_or_else(|| Error::corrupted("no allocation bitmap for the active FAT"))?;

        let upcase_entry = raw_root
            .iter()
            .find_map(|(_, _, e)| match e {
                DirEntry::UpcaseTable(u) => Some(*u),
                _ => None,
            })
            .ok_or_else(|| Error::corrupted("root directory has no up-case table entry"))?;

        let bitmap_offset = region
            .cluster_offset_bytes(active_bitmap.first_cluster)
            .ok_or_else(|| Error::corrupted("allocation bitmap has an invalid first cluster"))?;
        let bitmap = Bitmap::load(&mut device, bitmap_offset, region.sector.cluster_count)?;

        let upcase_offset = region
            .cluster_offset_bytes(upcase_entry.first_cluster)
            .ok_or_else(|| Error::corrupted("up-case table has an invalid first cluster"))?;
        let mut upcase_bytes = vec![0u8; upcase_entry.data_len as usize];
        device.read_at(upcase_offset, &mut upcase_bytes).map_err(Error::io)?;
        let upcase = UpcaseTable::from_bytes(&upcase_bytes)?;
        if upcase.checksum() != upcase_entry.table_checksum && !options.repair {
            return Err(Error::corrupted("up-case table checksum mismatch"));
        } else if upcase.checksum() != upcase_entry.table_checksum {
            warn!("up-case table checksum mismatch, continuing because repair is enabled");
        }

        let parsed_root = crate::dir::parse_entries(&raw_root, true, &upcase)?;

        let mut cache = NodeCache::new();
        let root = cache.insert(Node {
            parent: None,
            name: Vec::new(),
            attributes: FileAttributes::DIRECTORY,
            first_cluster: root_cluster,
            size: 0,
            valid_size: 0,
            no_fat_chain: false,
            entry_cluster: 0,
            entry_offset: 0,
            continuations: 0,
            created: Timestamp::now(),
            modified: Timestamp::now(),
            accessed: Timestamp::now(),
            children: None,
            references: Default::default(),
            dirty: Default::default(),
            unlinked: Default::default(),
        });

        let mut fs = Self {
            device,
            region,
            fat,
            bitmap,
            bitmap_entry_cluster: active_bitmap.first_cluster,
            upcase,
            cache,
            root,
            options,
        };
        fs.populate_children(root, &parsed_root.files)?;
        debug!("mounted exfat volume, cluster_count={}", fs.region.sector.cluster_count);
        Ok(fs)
    }

    fn populate_children(&mut self, parent: NodeId, files: &[crate::dir::ParsedFile]) -> Result<(), Error> {
        let mut children = Vec::with_capacity(files.len());
        for f in files {
            let id = self.cache.insert(Node {
                parent: Some(parent),
                name: f.name.clone(),
                attributes: f.attributes,
                first_cluster: f.first_cluster,
                size: f.size,
                valid_size: f.valid_size,
                no_fat_chain: f.no_fat_chain,
                entry_cluster: f.entry_cluster,
                entry_offset: f.entry_offset,
                continuations: f.continuations,
                created: f.created,
                modified: f.modified,
                accessed: f.accessed,
                children: None,
                references: Default::default(),
                dirty: Default::default(),
                unlinked: Default::default(),
            });
            children.push(id);
        }
        self.cache.get_mut(parent).children = Some(children);
        Ok(())
    }

    /// Scans a directory's cluster chain if it hasn't been cached yet.
    pub fn cache_directory(&mut self, dir: NodeId) -> Result<(), Error> {
        if self.cache.get(dir).children.is_some() {
            return Ok(());
        }
        let node = self.cache.get(dir).clone();
        if !node.is_directory() {
            return Err(Error::NotADirectory);
        }
        let is_root = dir == self.root;
        let data_len = if is_root { None } else { Some(node.size) };
        let raw = crate::dir::read_raw_entries(&mut self.device, &self.fat, &self.region, node.first_cluster, data_len, node.no_fat_chain)?;
        let parsed = crate::dir::parse_entries(&raw, is_root, &self.upcase)?;
        self.populate_children(dir, &parsed.files)
    }

    /// Resolves an absolute, `/`-separated path to a node, caching every
    /// directory traversed along the way.
    pub fn lookup(&mut self, path: &str) -> Result<NodeId, Error> {
        let mut current = self.root;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if component == ".." {
                current = self.cache.get(current).parent.unwrap_or(self.root);
                continue;
            }
            self.cache_directory(current)?;
            if !self.cache.get(current).is_directory() {
                return Err(Error::NotADirectory);
            }
            let folded = name::encode_name(component)?;
            match self.cache.find_child(current, &folded, &self.upcase)? {
                Some(child) => current = child,
                None => return Err(Error::NotFound),
            }
        }
        Ok(current)
    }

    /// Lists the immediate children of `dir`, caching it first if
    /// necessary.
    pub fn opendir(&mut self, dir: NodeId) -> Result<Vec<NodeId>, Error> {
        self.cache_directory(dir)?;
        Ok(self.cache.get(dir).children.clone().unwrap_or_default())
    }

    fn split_path(path: &str) -> Result<(&str, &str), Error> {
        let trimmed = path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(i) => Ok((&trimmed[..i], &trimmed[i + 1..])),
            None => Ok(("", trimmed)),
        }
    }

    fn create(&mut self, path: &str, is_directory: bool) -> Result<NodeId, Error> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let (parent_path, name_str) = Self::split_path(path)?;
        let parent = self.lookup(parent_path)?;
        self.cache_directory(parent)?;
        if !self.cache.get(parent).is_directory() {
            return Err(Error::NotADirectory);
        }
        let units = name::encode_name(name_str)?;
        if self.cache.find_child(parent, &units, &self.upcase)?.is_some() {
            return Err(Error::Exists);
        }

        let now = Timestamp::now();
        let attributes = if is_directory { FileAttributes::DIRECTORY } else { FileAttributes::empty() };

        let (first_cluster, size, no_fat_chain) = if is_directory {
            let cluster = self.bitmap.grow(None, 1)?[0];
            self.fat.set_entry(cluster, fat::EOF);
            self.fat.flush_entry(&mut self.device, &self.region, cluster)?;
            self.write_bitmap()?;
            let bytes_per_cluster = self.region.bytes_per_cluster();
            let offset = self
                .region
                .cluster_offset_bytes(cluster)
                .ok_or_else(|| Error::corrupted("allocated cluster out of range"))?;
            crate::disk::write_zeroes(&mut self.device, offset, bytes_per_cluster)?;
            (cluster, bytes_per_cluster, true)
        } else {
            (0, 0, false)
        };

        let entries = crate::dir::build_entry_set(&self.upcase, &units, attributes, first_cluster, size, no_fat_chain, now);
        let (entry_cluster, entry_offset) = self.place_entry_set(parent, &entries)?;

        let continuations = entries.len() as u8 - 1;
        let id = self.cache.insert(Node {
            parent: Some(parent),
            name: units,
            attributes,
            first_cluster,
            size,
            valid_size: size,
            no_fat_chain,
            entry_cluster,
            entry_offset,
            continuations,
            created: now,
            modified: now,
            accessed: now,
            children: if is_directory { Some(Vec::new()) } else { None },
            references: Default::default(),
            dirty: Default::default(),
            unlinked: Default::default(),
        });
        if let Some(children) = &mut self.cache.get_mut(parent).children {
            children.push(id);
        }
        trace!("created entry {name_str}");
        Ok(id)
    }

    pub fn mknod(&mut self, path: &str) -> Result<NodeId, Error> {
        self.create(path, false)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<NodeId, Error> {
        self.create(path, true)
    }

    /// Finds room for `entries` in `parent`'s directory data, growing the
    /// directory by one cluster if no existing run of free slots fits,
    /// and writes the entry set there.
    fn place_entry_set(&mut self, parent: NodeId, entries: &[DirEntry]) -> Result<(u32, u32), Error> {
        let node = self.cache.get(parent).clone();
        let is_root = parent == self.root;
        let data_len = if is_root { None } else { Some(node.size) };
        let raw = crate::dir::read_raw_entries(&mut self.device, &self.fat, &self.region, node.first_cluster, data_len, node.no_fat_chain)?;

        let (cluster, offset) = match crate::dir::find_free_run(&raw, entries.len()) {
            Some(slot) => slot,
            None => self.grow_directory(parent)?,
        };

        self.write_entries_at(cluster, offset, entries)?;
        Ok((cluster, offset))
    }

    fn grow_directory(&mut self, dir: NodeId) -> Result<(u32, u32), Error> {
        let node = self.cache.get(dir).clone();
        let after = if node.first_cluster == 0 { None } else { Some(node.first_cluster) };
        let new_cluster = self.bitmap.grow(after, 1)?[0];
        self.fat.set_entry(new_cluster, fat::EOF);
        if node.first_cluster != 0 {
            self.fat.link_chain(&[last_cluster(&self.fat, node.first_cluster)?, new_cluster]);
        }
        self.fat.flush_entry(&mut self.device, &self.region, new_cluster)?;
        self.write_bitmap()?;

        let bytes_per_cluster = self.region.bytes_per_cluster();
        let offset_bytes = self
            .region
            .cluster_offset_bytes(new_cluster)
            .ok_or_else(|| Error::corrupted("allocated cluster out of range"))?;
        crate::disk::write_zeroes(&mut self.device, offset_bytes, bytes_per_cluster)?;

        if dir != self.root {
            let node = self.cache.get_mut(dir);
            node.size += bytes_per_cluster;
            node.dirty = true;
        }
        Ok((new_cluster, 0))
    }

    fn write_entries_at(&mut self, mut cluster: u32, mut offset: u32, entries: &[DirEntry]) -> Result<(), Error> {
        let entries_per_cluster = (self.region.bytes_per_cluster() / 32) as u32;
        for entry in entries {
            let base = self
                .region
                .cluster_offset_bytes(cluster)
                .ok_or_else(|| Error::corrupted("entry placement out of range"))?;
            self.device
                .write_at(base + offset as u64 * 32, &entry.bytes())
                .map_err(Error::io)?;
            offset += 1;
            if offset == entries_per_cluster {
                offset = 0;
                cluster = fat::ClusterChain::new(&self.fat, cluster)
                    .nth(1)
                    .transpose()?
                    .ok_or_else(|| Error::corrupted("entry set spans past end of chain"))?;
            }
        }
        Ok(())
    }

    fn write_bitmap(&mut self) -> Result<(), Error> {
        let offset = self
            .region
            .cluster_offset_bytes(self.bitmap_entry_cluster)
            .ok_or_else(|| Error::corrupted("bitmap cluster out of range"))?;
        self.bitmap.write(&mut self.device, offset)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read (short once `offset + n` reaches the
    /// file's size).
    pub fn pread(&mut self, handle: Handle, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let node = self.cache.get(handle).clone();
        if node.is_directory() {
            return Err(Error::IsADirectory);
        }
        if offset >= node.size {
            return Ok(0);
        }
        let n = buf.len().min((node.size - offset) as usize);
        let bytes_per_cluster = self.region.bytes_per_cluster();
        let mut read = 0usize;
        let mut chain = self.cluster_chain(&node)?.into_iter();
        let start_cluster_index = offset / bytes_per_cluster;
        let mut within = offset % bytes_per_cluster;
        for _ in 0..start_cluster_index {
            chain.next();
        }
        while read < n {
            let cluster = chain.next().ok_or_else(|| Error::corrupted("cluster chain shorter than file size"))?;
            let base = self
                .region
                .cluster_offset_bytes(cluster)
                .ok_or_else(|| Error::corrupted("data cluster out of range"))?;
            let chunk = (bytes_per_cluster - within).min((n - read) as u64) as usize;
            self.device.read_at(base + within, &mut buf[read..read + chunk]).map_err(Error::io)?;
            read += chunk;
            within = 0;
        }
        if !self.options.no_atime {
            self.cache.get_mut(handle).accessed = Timestamp::now();
        }
        Ok(n)
    }

    /// Writes `buf` at `offset`, growing the file's cluster chain and
    /// updating its size as needed.
    pub fn pwrite(&mut self, handle: Handle, buf: &[u8], offset: u64) -> Result<usize, Error> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let mut node = self.cache.get(handle).clone();
        if node.is_directory() {
            return Err(Error::IsADirectory);
        }
        let end = offset + buf.len() as u64;
        if end > node.size {
            self.grow_file(handle, end)?;
            node = self.cache.get(handle).clone();
        }

        let bytes_per_cluster = self.region.bytes_per_cluster();
        let mut chain = self.cluster_chain(&node)?.into_iter();
        let start_cluster_index = offset / bytes_per_cluster;
        let mut within = offset % bytes_per_cluster;
        for _ in 0..start_cluster_index {
            chain.next();
        }
        let mut written = 0usize;
        while written < buf.len() {
            let cluster = chain.next().ok_or_else(|| Error::corrupted("cluster chain shorter than file size"))?;
            let base = self
                .region
                .cluster_offset_bytes(cluster)
                .ok_or_else(|| Error::corrupted("data cluster out of range"))?;
            let chunk = (bytes_per_cluster - within).min((buf.len() - written) as u64) as usize;
            self.device.write_at(base + within, &buf[written..written + chunk]).map_err(Error::io)?;
            written += chunk;
            within = 0;
        }

        let node = self.cache.get_mut(handle);
        node.valid_size = node.valid_size.max(end);
        node.modified = Timestamp::now();
        node.dirty = true;
        self.flush_node(handle)?;
        Ok(written)
    }

    fn cluster_chain(&self, node: &Node) -> Result<Vec<u32>, Error> {
        if node.first_cluster == 0 {
            return Ok(Vec::new());
        }
        if node.no_fat_chain {
            let count = node.size.div_ceil(self.region.bytes_per_cluster()) as u32;
            fat::contiguous_chain(node.first_cluster, count).collect()
        } else {
            fat::ClusterChain::new(&self.fat, node.first_cluster).collect()
        }
    }

    /// Extends a file's cluster chain to cover `new_size` bytes, per
    /// `grow_file`: materializes a non-contiguous chain if a newly
    /// allocated cluster does not continue the previous one.
    fn grow_file(&mut self, handle: Handle, new_size: u64) -> Result<(), Error> {
        let node = self.cache.get(handle).clone();
        let bytes_per_cluster = self.region.bytes_per_cluster();
        let have = node.size.div_ceil(bytes_per_cluster.max(1)).max(if node.first_cluster == 0 { 0 } else { 1 });
        let need = new_size.div_ceil(bytes_per_cluster);
        if need > have {
            let mut chain = self.cluster_chain(&node)?;
            let after = chain.last().copied();
            let added = self.bitmap.grow(after, (need - have) as u32)?;
            self.write_bitmap()?;

            let was_contiguous = node.no_fat_chain;
            let stays_contiguous = was_contiguous
                && added
                    .first()
                    .is_some_and(|&c| chain.last().is_none_or(|&last| c == last + 1));

            if was_contiguous && !stays_contiguous {
                // Materialize the previously-contiguous run as real FAT
                // links before appending the new, possibly disjoint run.
                self.fat.link_chain(&chain);
                for &c in &chain {
                    self.fat.flush_entry(&mut self.device, &self.region, c)?;
                }
            }
            chain.extend(&added);
            if !stays_contiguous {
                self.fat.link_chain(&chain);
                for &c in &chain {
                    self.fat.flush_entry(&mut self.device, &self.region, c)?;
                }
            }

            let node = self.cache.get_mut(handle);
            if node.first_cluster == 0 {
                node.first_cluster = chain[0];
            }
            node.no_fat_chain = stays_contiguous;
        }
        self.cache.get_mut(handle).size = new_size;
        Ok(())
    }

    /// Shrinks a file's cluster chain to cover `new_size` bytes, per
    /// `shrink_file`: frees every cluster beyond the new last one.
    pub fn truncate(&mut self, handle: Handle, new_size: u64) -> Result<(), Error> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let node = self.cache.get(handle).clone();
        if node.is_directory() {
            return Err(Error::IsADirectory);
        }
        let bytes_per_cluster = self.region.bytes_per_cluster();
        if new_size > node.size {
            self.grow_file(handle, new_size)?;
        } else if new_size < node.size {
            let chain = self.cluster_chain(&node)?;
            let keep = new_size.div_ceil(bytes_per_cluster) as usize;
            let (kept, freed) = chain.split_at(keep.min(chain.len()));
            if let Some(&last) = kept.last() {
                if !node.no_fat_chain {
                    self.fat.set_entry(last, fat::EOF);
                    self.fat.flush_entry(&mut self.device, &self.region, last)?;
                }
            }
            if !freed.is_empty() {
                self.bitmap.shrink(freed);
                self.write_bitmap()?;
            }
            let node = self.cache.get_mut(handle);
            if keep == 0 {
                node.first_cluster = 0;
            }
        }
        let node = self.cache.get_mut(handle);
        node.size = new_size;
        node.valid_size = node.valid_size.min(new_size);
        node.modified = Timestamp::now();
        node.dirty = true;
        self.flush_node(handle)
    }

    /// Removes a file's directory entry and, once nothing references it
    /// in the node cache, frees its cluster chain.
    pub fn unlink(&mut self, handle: Handle) -> Result<(), Error> {
        self.remove(handle, false)
    }

    pub fn rmdir(&mut self, handle: Handle) -> Result<(), Error> {
        self.remove(handle, true)
    }

    /// Moves and/or renames `from` to `to`. If both paths share a parent,
    /// the entry set is rewritten in place; otherwise a new slot is found
    /// in the destination parent and the old entry set is erased. If
    /// `to` already exists it is unlinked first (an existing directory
    /// must be empty).
    pub fn rename(&mut self, from: &str, to: &str) -> Result<Handle, Error> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let handle = self.lookup(from)?;
        if handle == self.root {
            return Err(Error::InvalidArgument("cannot rename the root directory".into()));
        }

        let (to_parent_path, to_name) = Self::split_path(to)?;
        let to_parent = self.lookup(to_parent_path)?;
        self.cache_directory(to_parent)?;
        if !self.cache.get(to_parent).is_directory() {
            return Err(Error::NotADirectory);
        }
        let units = name::encode_name(to_name)?;

        if let Some(existing) = self.cache.find_child(to_parent, &units, &self.upcase)? {
            if existing != handle {
                let existing_is_dir = self.cache.get(existing).is_directory();
                if existing_is_dir {
                    self.cache_directory(existing)?;
                    if !self.cache.get(existing).children.as_ref().unwrap().is_empty() {
                        return Err(Error::NotEmpty);
                    }
                }
                self.remove(existing, existing_is_dir)?;
            }
        }

        let node = self.cache.get(handle).clone();
        self.erase_entry_set(&node)?;

        let entries = crate::dir::build_entry_set(
            &self.upcase,
            &units,
            node.attributes,
            node.first_cluster,
            node.size,
            node.no_fat_chain,
            node.modified,
        );
        let (entry_cluster, entry_offset) = self.place_entry_set(to_parent, &entries)?;
        let continuations = entries.len() as u8 - 1;

        if let Some(old_parent) = node.parent {
            if let Some(children) = &mut self.cache.get_mut(old_parent).children {
                children.retain(|&c| c != handle);
            }
        }

        let updated = self.cache.get_mut(handle);
        updated.parent = Some(to_parent);
        updated.name = units;
        updated.entry_cluster = entry_cluster;
        updated.entry_offset = entry_offset;
        updated.continuations = continuations;
        updated.modified = Timestamp::now();

        if let Some(children) = &mut self.cache.get_mut(to_parent).children {
            children.push(handle);
        }
        trace!("renamed {from} to {to}");
        Ok(handle)
    }

    fn remove(&mut self, handle: Handle, expect_directory: bool) -> Result<(), Error> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        if handle == self.root {
            return Err(Error::InvalidArgument("cannot remove the root directory".into()));
        }
        let node = self.cache.get(handle).clone();
        if node.is_directory() != expect_directory {
            return if expect_directory { Err(Error::NotADirectory) } else { Err(Error::IsADirectory) };
        }
        if expect_directory {
            self.cache_directory(handle)?;
            if !self.cache.get(handle).children.as_ref().unwrap().is_empty() {
                return Err(Error::NotEmpty);
            }
        }

        self.erase_entry_set(&node)?;

        if let Some(parent) = node.parent {
            if let Some(children) = &mut self.cache.get_mut(parent).children {
                children.retain(|&c| c != handle);
            }
        }
        self.cache.mark_unlinked(handle);
        // The directory entry's own reference is dropped here; clusters are
        // only reclaimed once that was the last reference, per
        // `exfat_put_node`. A still-open handle keeps the chain alive until
        // its own `close` drops the final reference.
        if self.cache.put_node(handle) {
            self.reclaim_chain(&node)?;
        }
        Ok(())
    }

    /// Frees `node`'s cluster chain in the FAT and bitmap. Called once a
    /// node's last reference drops while it is unlinked.
    fn reclaim_chain(&mut self, node: &Node) -> Result<(), Error> {
        let chain = self.cluster_chain(node)?;
        if !chain.is_empty() {
            if !node.no_fat_chain {
                for &c in &chain {
                    self.fat.set_entry(c, fat::FREE);
                    self.fat.flush_entry(&mut self.device, &self.region, c)?;
                }
            }
            self.bitmap.shrink(&chain);
            self.write_bitmap()?;
        }
        Ok(())
    }

    /// Pins an extra reference on `handle`, simulating an open file
    /// descriptor. Keeps the node (and, if later unlinked, its cluster
    /// chain) alive until a matching [`Filesystem::close`].
    pub fn open(&mut self, handle: Handle) -> Handle {
        self.cache.get_node(handle)
    }

    /// Releases a reference pinned by [`Filesystem::open`] (or held
    /// implicitly since lookup/creation). If this was the last reference on
    /// a node already unlinked, its cluster chain is reclaimed now.
    pub fn close(&mut self, handle: Handle) -> Result<(), Error> {
        let node = self.cache.get(handle).clone();
        if self.cache.put_node(handle) {
            self.reclaim_chain(&node)?;
        }
        Ok(())
    }

    fn erase_entry_set(&mut self, node: &Node) -> Result<(), Error> {
        let count = node.continuations as u32 + 1;
        let entries_per_cluster = (self.region.bytes_per_cluster() / 32) as u32;
        let mut cluster = node.entry_cluster;
        let mut offset = node.entry_offset;
        for _ in 0..count {
            let base = self
                .region
                .cluster_offset_bytes(cluster)
                .ok_or_else(|| Error::corrupted("entry set location out of range"))?;
            let unused = DirEntry::new_unused(0);
            self.device.write_at(base + offset as u64 * 32, &unused.bytes()).map_err(Error::io)?;
            offset += 1;
            if offset == entries_per_cluster {
                offset = 0;
                cluster = fat::ClusterChain::new(&self.fat, cluster).nth(1).transpose()?.unwrap_or(cluster);
            }
        }
        Ok(())
    }

    /// Rewrites `handle`'s `File`/`StreamExtension` entries in place to
    /// reflect its current size and timestamps.
    fn flush_node(&mut self, handle: Handle) -> Result<(), Error> {
        if !self.cache.is_dirty(handle) {
            return Ok(());
        }
        let node = self.cache.get(handle).clone();
        let entries = crate::dir::build_entry_set(
            &self.upcase,
            &node.name,
            node.attributes,
            node.first_cluster,
            node.size,
            node.no_fat_chain,
            node.modified,
        );
        self.write_entries_at(node.entry_cluster, node.entry_offset, &entries)?;
        self.cache.clear_dirty(handle);
        Ok(())
    }

    /// Flushes every dirty node, the FAT and the bitmap without
    /// unmounting.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.device.flush().map_err(Error::io)
    }

    /// Flushes all pending state, clears the volume-dirty flag, and hands
    /// the underlying device back to the caller.
    pub fn unmount(mut self) -> Result<D, Error> {
        boot::set_volume_dirty(&mut self.device, &mut self.region, false)?;
        self.device.flush().map_err(Error::io)?;
        Ok(self.device)
    }

    pub fn node(&self, handle: Handle) -> &Node {
        self.cache.get(handle)
    }

    /// Updates the four DOS-style attribute bits
    /// (`READ_ONLY`/`HIDDEN`/`SYSTEM`/`ARCHIVE`); the `DIRECTORY` bit is
    /// preserved regardless of what `attributes` requests, since it is
    /// intrinsic to the node and not user-settable.
    pub fn set_attributes(&mut self, handle: Handle, attributes: FileAttributes) -> Result<(), Error> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let is_dir = self.cache.get(handle).is_directory();
        let mut attributes = attributes & !FileAttributes::DIRECTORY;
        if is_dir {
            attributes |= FileAttributes::DIRECTORY;
        }
        let node = self.cache.get_mut(handle);
        node.attributes = attributes;
        node.modified = Timestamp::now();
        node.dirty = true;
        self.flush_node(handle)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }
}

fn last_cluster(fat: &Fat, first: u32) -> Result<u32, Error> {
    fat::ClusterChain::new(fat, first).last().transpose()?.ok_or_else(|| Error::corrupted("empty cluster chain"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatVolumeOptionsBuilder, Formatter};
    use std::io::Cursor;

    fn formatted_volume(size: u64) -> Cursor<Vec<u8>> {
        let mut device = Cursor::new(vec![0u8; size as usize]);
        let options = FormatVolumeOptionsBuilder::default()
            .dev_size(size)
            .bytes_per_sector(512u16)
            .build()
            .unwrap();
        Formatter::try_from(options).unwrap().write(&mut device).unwrap();
        device
    }

    #[test]
    fn mount_fresh_volume() {
        let device = formatted_volume(8 * crate::MB as u64);
        let fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        assert_eq!(fs.node(fs.root()).attributes, FileAttributes::DIRECTORY);
    }

    #[test]
    fn create_read_back_file() {
        let device = formatted_volume(8 * crate::MB as u64);
        let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        let file = fs.mknod("/hello.txt").unwrap();
        fs.pwrite(file, b"hello, world", 0).unwrap();
        let mut buf = [0u8; 12];
        fs.pread(file, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello, world");
    }

    #[test]
    fn sparse_write_extends_file() {
        let device = formatted_volume(8 * crate::MB as u64);
        let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        let file = fs.mknod("/sparse.bin").unwrap();
        fs.pwrite(file, b"end", 5000).unwrap();
        assert_eq!(fs.node(file).size, 5003);
    }

    #[test]
    fn mkdir_then_create_nested_file() {
        let device = formatted_volume(8 * crate::MB as u64);
        let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        fs.mkdir("/sub").unwrap();
        let file = fs.mknod("/sub/a.txt").unwrap();
        fs.pwrite(file, b"x", 0).unwrap();
        let found = fs.lookup("/sub/a.txt").unwrap();
        assert_eq!(found, file);
    }

    #[test]
    fn unlink_removes_entry_from_parent() {
        let device = formatted_volume(8 * crate::MB as u64);
        let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        let file = fs.mknod("/a.txt").unwrap();
        fs.unlink(file).unwrap();
        assert!(fs.lookup("/a.txt").is_err());
    }

    #[test]
    fn unlink_of_open_file_defers_cluster_reclamation() {
        let device = formatted_volume(8 * crate::MB as u64);
        let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        let before = fs.bitmap.used_count();

        let file = fs.mknod("/tmp").unwrap();
        fs.pwrite(file, &vec![0u8; 100 * 1024], 0).unwrap();
        fs.open(file);

        fs.unlink(file).unwrap();
        assert!(fs.lookup("/tmp").is_err());
        let mut buf = vec![0u8; 100 * 1024];
        fs.pread(file, &mut buf, 0).unwrap();
        assert!(fs.bitmap.used_count() > before);

        fs.close(file).unwrap();
        assert_eq!(fs.bitmap.used_count(), before);
    }

    #[test]
    fn rename_moves_entry_between_directories() {
        let device = formatted_volume(8 * crate::MB as u64);
        let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        let file = fs.mknod("/a.txt").unwrap();
        fs.mkdir("/sub").unwrap();
        let renamed = fs.rename("/a.txt", "/sub/b.txt").unwrap();
        assert_eq!(renamed, file);
        assert!(fs.lookup("/a.txt").is_err());
        assert_eq!(fs.lookup("/sub/b.txt").unwrap(), file);
    }

    #[test]
    fn rename_onto_existing_file_replaces_it() {
        let device = formatted_volume(8 * crate::MB as u64);
        let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        let src = fs.mknod("/src.txt").unwrap();
        fs.mknod("/dst.txt").unwrap();
        fs.rename("/src.txt", "/dst.txt").unwrap();
        assert!(fs.lookup("/src.txt").is_err());
        assert_eq!(fs.lookup("/dst.txt").unwrap(), src);
    }

    #[test]
    fn rename_onto_nonempty_directory_fails() {
        let device = formatted_volume(8 * crate::MB as u64);
        let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        fs.mknod("/b/inside.txt").unwrap();
        assert!(matches!(fs.rename("/a", "/b"), Err(Error::NotEmpty)));
    }

    #[test]
    fn set_attributes_preserves_directory_bit() {
        let device = formatted_volume(8 * crate::MB as u64);
        let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
        let dir = fs.mkdir("/sub").unwrap();
        fs.set_attributes(dir, FileAttributes::HIDDEN).unwrap();
        assert_eq!(fs.node(dir).attributes, FileAttributes::HIDDEN | FileAttributes::DIRECTORY);

        let file = fs.mknod("/a.txt").unwrap();
        fs.set_attributes(file, FileAttributes::READ_ONLY | FileAttributes::ARCHIVE).unwrap();
        assert_eq!(fs.node(file).attributes, FileAttributes::READ_ONLY | FileAttributes::ARCHIVE);
    }

    #[test]
    fn mount_option_parsing_rejects_unknown_key() {
        assert!(MountOptions::parse("bogus").is_err());
        let parsed = MountOptions::parse("ro,noatime").unwrap();
        assert!(parsed.read_only);
        assert!(parsed.no_atime);
    }
}
