//! Grows the Kernel and RootFS1 MTD partitions of QNAP Kirkwood NAS devices (TS-219, TS-419
//! and relatives) from 2 MiB/9 MiB to 3 MiB/12 MiB, by taking space from the 'NAS Config'
//! partition and the second root filesystem.
//!
//! The partition table itself lives in the kernel's DTB and is never touched. Instead the
//! U-Boot environment is patched to load the larger kernel and initrd and to pass an `mtdparts`
//! descriptor on the kernel command line, and the kernel image is relocated on flash to where
//! the new layout expects it.

pub mod bootenv;
pub mod error;
pub mod host;
pub mod layout;
pub mod migrate;
pub mod mtd;
pub mod plan;
pub mod util;
