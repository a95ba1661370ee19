//! The legacy and target flash layouts of the supported QNAP boards.
//!
//! The whole SPI NOR is 16 MiB. QNAP ships it cut into six partitions:
//!
//! ```text
//!                  offset     size
//!  uboot          0x000000  512 KiB   /dev/mtd0
//!  U-Boot Config  0x080000  256 KiB   /dev/mtd4
//!  NAS Config     0x0c0000 1280 KiB   /dev/mtd5
//!  Kernel         0x200000    2 MiB   /dev/mtd1
//!  RootFS1        0x400000    9 MiB   /dev/mtd2
//!  RootFS2        0xd00000    3 MiB   /dev/mtd3
//! ```
//!
//! 'NAS Config' only holds a tiny ext2 filesystem, and RootFS2 is unused by Debian, so the new
//! layout gives that space to the kernel and the initrd:
//!
//! ```text
//!                  offset     size
//!  uboot          0x000000  512 KiB   (read-only)
//!  Kernel         0x100000    3 MiB
//!  RootFS1        0x400000   12 MiB
//!  Kernel_legacy  0x200000    2 MiB   (the old Kernel range, inside the new Kernel)
//!  U-Boot Config  0x080000  256 KiB
//!  NAS Config     0x0c0000  256 KiB
//! ```
//!
//! Kernel_legacy is not new flash, it's a second view over the tail of the new Kernel. QNAP's
//! rescue flow rewrites the old Kernel partition without knowing about our environment, and the
//! fallback clause in `bootcmd` boots whatever it finds there.

use std::fmt::Write;
use std::ops::Range;

use crate::util::{KIB, MIB};

/// A named byte range of the flash
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Region {
    pub label: &'static str,
    pub offset: u64,
    pub size: u64,
    pub read_only: bool,
}

impl Region {
    const fn new(label: &'static str, offset: u64, size: u64) -> Self {
        Self {
            label,
            offset,
            size,
            read_only: false,
        }
    }

    const fn read_only(self) -> Self {
        Self {
            read_only: true,
            ..self
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.offset < other.offset + other.size && other.offset < self.offset + self.size
    }

    /// Format as one `mtdparts` entry, e.g. `3M@0x100000(Kernel)`
    fn write_mtdpart(&self, out: &mut String) {
        let _ = match self.size {
            size if size % MIB == 0 => write!(out, "{}M", size / MIB),
            size if size % KIB == 0 => write!(out, "{}k", size / KIB),
            size => write!(out, "{size}"),
        };
        let _ = write!(out, "@{:#x}({})", self.offset, self.label);
        if self.read_only {
            out.push_str("ro");
        }
    }
}

pub const LEGACY_UBOOT_CONFIG: Region = Region::new("U-Boot Config", 0x80000, 256 * KIB);
pub const LEGACY_NAS_CONFIG: Region = Region::new("NAS Config", 0xc0000, 1280 * KIB);
pub const LEGACY_KERNEL: Region = Region::new("Kernel", 0x200000, 2 * MIB);
pub const LEGACY_ROOTFS1: Region = Region::new("RootFS1", 0x400000, 9 * MIB);

/// The layout the boards ship with, in flash order
pub const LEGACY_LAYOUT: [Region; 6] = [
    Region::new("uboot", 0, 512 * KIB),
    LEGACY_UBOOT_CONFIG,
    LEGACY_NAS_CONFIG,
    LEGACY_KERNEL,
    LEGACY_ROOTFS1,
    Region::new("RootFS2", 0xd00000, 3 * MIB),
];

pub const KERNEL: Region = Region::new("Kernel", 0x100000, 3 * MIB);
pub const KERNEL_LEGACY: Region = Region::new("Kernel_legacy", 0x200000, 2 * MIB);
pub const ROOTFS1: Region = Region::new("RootFS1", 0x400000, 12 * MIB);
pub const NAS_CONFIG: Region = Region::new("NAS Config", 0xc0000, 256 * KIB);

/// The migrated layout, in the order it appears on the kernel command line
pub const TARGET_LAYOUT: [Region; 6] = [
    Region::new("uboot", 0, 512 * KIB).read_only(),
    KERNEL,
    ROOTFS1,
    KERNEL_LEGACY,
    Region::new("U-Boot Config", 0x80000, 256 * KIB),
    NAS_CONFIG,
];

/// Filesystem blocks the 'NAS Config' ext2 is shrunk to (1 KiB blocks, half the new partition)
pub const NAS_CONFIG_FS_BLOCKS: u32 = 128;

/// Check that no two regions overlap, except the Kernel/Kernel_legacy pair, where the legacy
/// region must lie entirely inside the new Kernel.
pub fn validate(layout: &[Region]) -> anyhow::Result<()> {
    let is_kernel_pair = |a: &Region, b: &Region| {
        let labels = [a.label, b.label];
        labels.contains(&KERNEL.label) && labels.contains(&KERNEL_LEGACY.label)
    };

    for (i, a) in layout.iter().enumerate() {
        for b in &layout[i + 1..] {
            if !a.overlaps(b) {
                continue;
            }

            anyhow::ensure!(
                is_kernel_pair(a, b),
                "regions {} and {} overlap",
                a.label,
                b.label
            );

            let (kernel, legacy) = if a.label == KERNEL.label { (a, b) } else { (b, a) };
            anyhow::ensure!(
                kernel.range().start <= legacy.range().start
                    && legacy.range().end <= kernel.range().end,
                "{} must lie inside {}",
                legacy.label,
                kernel.label
            );
        }
    }

    Ok(())
}

/// Build the `mtdparts` descriptor for the target layout on the given master device, e.g.
/// `spi0.0:512k@0x0(uboot)ro,3M@0x100000(Kernel),...`
pub fn mtdparts(master: &str) -> String {
    let mut out = format!("{master}:");
    for (i, region) in TARGET_LAYOUT.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        region.write_mtdpart(&mut out);
    }
    out
}

#[test]
fn test_layouts_are_valid() -> anyhow::Result<()> {
    validate(&LEGACY_LAYOUT)?;
    validate(&TARGET_LAYOUT)?;

    // The migration only makes sense if the flash size doesn't change
    let end = |layout: &[Region]| layout.iter().map(|r| r.range().end).max();
    assert_eq!(end(&LEGACY_LAYOUT), end(&TARGET_LAYOUT));
    Ok(())
}

#[test]
fn test_validate_rejects_overlap() {
    let bad = [KERNEL, Region::new("RootFS1", 0x380000, MIB)];
    assert!(validate(&bad).is_err());

    // Kernel_legacy sticking out of the Kernel is not the designed overlap
    let bad = [KERNEL, Region::new("Kernel_legacy", 0x300000, 2 * MIB)];
    assert!(validate(&bad).is_err());
}

#[test]
fn test_kernel_overlap() {
    assert!(KERNEL.overlaps(&KERNEL_LEGACY));
    assert_eq!(KERNEL.range(), 0x100000..0x400000);
    assert_eq!(KERNEL_LEGACY.range(), 0x200000..0x400000);
}

#[test]
fn test_mtdparts() {
    assert_eq!(
        mtdparts("spi0.0"),
        "spi0.0:512k@0x0(uboot)ro,3M@0x100000(Kernel),12M@0x400000(RootFS1),\
         2M@0x200000(Kernel_legacy),256k@0x80000(U-Boot Config),256k@0xc0000(NAS Config)"
    );
}

#[test]
fn test_mtdparts_entries() {
    let desc = mtdparts("spi0.0");
    let (master, parts) = desc.split_once(':').unwrap();
    assert_eq!(master, "spi0.0");

    let entry = regex::Regex::new(r"^([0-9]+)([kM])@0x([0-9a-f]+)\(([^)]+)\)(ro)?$").unwrap();
    let labels: Vec<_> = parts
        .split(',')
        .map(|part| {
            let caps = entry.captures(part).unwrap();
            let label = caps.get(4).unwrap().as_str().to_owned();
            assert_eq!(caps.get(5).is_some(), label == "uboot");
            label
        })
        .collect();

    assert_eq!(
        labels,
        [
            "uboot",
            "Kernel",
            "RootFS1",
            "Kernel_legacy",
            "U-Boot Config",
            "NAS Config"
        ]
    );
}
