//! # exFAT
//!
//! A userspace implementation of the exFAT filesystem: volume boot region
//! parsing, FAT and allocation-bitmap maintenance, a directory node cache,
//! cluster-chain data I/O, metadata mutation (create/unlink/rename/
//! truncate), volume formatting and consistency checking.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use exfat_fs::{MB, format::{FormatVolumeOptionsBuilder, Formatter}, fs::Filesystem, fs::MountOptions};
//!
//! let size: u64 = 32 * MB as u64;
//! let mut device = std::io::Cursor::new(vec![0u8; size as usize]);
//!
//! let options = FormatVolumeOptionsBuilder::default()
//!     .dev_size(size)
//!     .bytes_per_sector(512u16)
//!     .build()
//!     .unwrap();
//!
//! Formatter::try_from(options).unwrap().write(&mut device).unwrap();
//!
//! let mut fs = Filesystem::mount(device, MountOptions::default()).unwrap();
//! let file = fs.mknod("/hello.txt").unwrap();
//! fs.pwrite(file, b"Hello, world!", 0).unwrap();
//! fs.unmount().unwrap();
//! ```

pub mod bitmap;
pub mod boot;
pub mod check;
pub mod dir;
pub mod disk;
pub mod entry;
pub mod error;
pub mod fat;
pub mod format;
pub mod fs;
pub mod name;
pub mod node;
pub mod timestamp;

pub use error::Error;

pub const GB: u32 = 1024 * 1024 * 1024;
pub const MB: u32 = 1024 * 1024;
pub const KB: u16 = 1024;

/// Default byte alignment for filesystem structures such as the FAT and the
/// up-case table.
pub const DEFAULT_BOUNDARY_ALIGNMENT: u32 = 1024 * 1024;

/// First cluster index usable for data; clusters 0 and 1 are reserved FAT
/// entries.
pub const FIRST_DATA_CLUSTER: u32 = 2;

pub type Result<T> = core::result::Result<T, Error>;
