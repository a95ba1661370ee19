//! Reading the live MTD partition table, and finding the partitions the migration works on.

use std::fmt;
use std::path::PathBuf;

use anyhow::Context;
use regex::Regex;

use crate::error::ResizeError;
use crate::layout::{self, Region};

#[cfg(target_os = "linux")]
pub mod dev;

/// The kernel's list of MTD partitions
pub const PROC_MTD: &str = "/proc/mtd";

/// The DTB files (as reported by flash-kernel's `kirkwood-qnap` probe) of the boards the
/// migration has been tested on
pub const TESTED_DTBS: [&str; 4] = [
    "kirkwood-ts219-6281.dtb",
    "kirkwood-ts219-6282.dtb",
    "kirkwood-ts419-6281.dtb",
    "kirkwood-ts419-6282.dtb",
];

/// Labels each partition has gone by. QNAP's DTBs use spaces; the `mtdparts` descriptor of
/// some earlier migrations used underscores.
pub const KERNEL_LABELS: &[&str] = &["Kernel"];
pub const ROOTFS1_LABELS: &[&str] = &["RootFS1"];
pub const ROOTFS2_LABELS: &[&str] = &["RootFS2"];
pub const NAS_CONFIG_LABELS: &[&str] = &["NAS Config", "NAS_Config"];
pub const UBOOT_CONFIG_LABELS: &[&str] = &["U-Boot Config", "U-Boot_Config"];

/// One line of `/proc/mtd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtdPartition {
    /// Device name, e.g. `mtd1`
    pub device: String,
    pub size: u64,
    pub erase_size: u64,
    pub label: String,
}

impl MtdPartition {
    /// The character device for this partition, e.g. `/dev/mtd1`
    pub fn path(&self) -> PathBuf {
        PathBuf::from("/dev").join(&self.device)
    }
}

impl fmt::Display for MtdPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({})", self.label, self.device)
    }
}

/// The parsed contents of `/proc/mtd`, in kernel order
#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    pub partitions: Vec<MtdPartition>,
}

impl PartitionTable {
    /// Parse `/proc/mtd` text. The header line, and anything else that isn't a partition, is
    /// skipped.
    ///
    /// ```text
    /// dev:    size   erasesize  name
    /// mtd0: 00080000 00040000 "uboot"
    /// ```
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let line_re = Regex::new(r#"^(mtd[0-9]+): ([0-9a-fA-F]+) ([0-9a-fA-F]+) "(.+)"$"#)?;

        let mut partitions = Vec::new();
        for line in text.lines() {
            let Some(caps) = line_re.captures(line.trim()) else {
                continue;
            };

            let device = caps[1].to_owned();
            anyhow::ensure!(
                !partitions.iter().any(|p: &MtdPartition| p.device == device),
                "{device} listed twice in the partition table"
            );

            partitions.push(MtdPartition {
                device,
                size: u64::from_str_radix(&caps[2], 16)?,
                erase_size: u64::from_str_radix(&caps[3], 16)?,
                label: caps[4].to_owned(),
            });
        }

        Ok(Self { partitions })
    }

    /// Read and parse the running kernel's table
    pub fn load() -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(PROC_MTD).context(PROC_MTD)?;
        Self::parse(&text)
    }

    /// Find the first partition (in kernel order) carrying any of `labels`
    pub fn find(&self, labels: &[&str]) -> Option<&MtdPartition> {
        self.partitions
            .iter()
            .find(|p| labels.contains(&p.label.as_str()))
    }

    /// Like [find](Self::find), but a missing partition is an error
    pub fn lookup(&self, labels: &[&str]) -> Result<&MtdPartition, ResizeError> {
        self.find(labels)
            .ok_or_else(|| ResizeError::PartitionNotFound(labels.join(" / ")))
    }
}

/// Extract the name of the flash device the partitions live on from the kernel log, e.g.
/// `spi0.0` from `Creating 6 MTD partitions on "spi0.0":`. The last such line wins.
pub fn master_device(kernel_log: &str) -> anyhow::Result<String> {
    let re = Regex::new(r#"Creating [0-9]+ MTD partitions on "([^"]+)""#)?;

    kernel_log
        .lines()
        .filter_map(|line| re.captures(line))
        .last()
        .map(|caps| caps[1].to_owned())
        .ok_or_else(|| ResizeError::MasterDeviceNotFound.into())
}

/// Decide whether the board may be migrated. An untested DTB is up to the operator.
pub fn check_model(dtb: &str, accept_untested: impl FnOnce() -> bool) -> Result<(), ResizeError> {
    if TESTED_DTBS.contains(&dtb) || accept_untested() {
        Ok(())
    } else {
        Err(ResizeError::Declined)
    }
}

/// The partitions the migration reads and writes, all verified to still have their legacy size
#[derive(Debug, Clone)]
pub struct Inventory {
    pub kernel: MtdPartition,
    pub rootfs1: MtdPartition,
    pub nas_config: MtdPartition,
    pub uboot_config: MtdPartition,
    /// Flash device the partitions are carved from, e.g. `spi0.0`
    pub master: String,
}

impl Inventory {
    /// Locate the partitions in `table` and refuse anything that isn't the legacy layout.
    ///
    /// This is deliberately not idempotent: running the migration twice would relocate the
    /// kernel a second time, so a layout that has already been resized is an error.
    pub fn read(table: &PartitionTable, kernel_log: &str) -> anyhow::Result<Self> {
        let legacy = |labels: &[&str], expected: &Region| -> anyhow::Result<MtdPartition> {
            let partition = table.lookup(labels)?;
            if partition.size != expected.size {
                return Err(ResizeError::AlreadyResized {
                    label: expected.label,
                    device: partition.device.clone(),
                    actual: partition.size,
                    expected: expected.size,
                }
                .into());
            }
            Ok(partition.clone())
        };

        let kernel = legacy(KERNEL_LABELS, &layout::LEGACY_KERNEL)?;
        let rootfs1 = legacy(ROOTFS1_LABELS, &layout::LEGACY_ROOTFS1)?;
        let nas_config = legacy(NAS_CONFIG_LABELS, &layout::LEGACY_NAS_CONFIG)?;
        let uboot_config = table.lookup(UBOOT_CONFIG_LABELS)?.clone();
        let master = master_device(kernel_log)?;

        Ok(Self {
            kernel,
            rootfs1,
            nas_config,
            uboot_config,
            master,
        })
    }
}

/// What the partition table says about the state of the migration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LayoutState {
    /// As shipped; the migration can run
    Legacy,
    /// Kernel and RootFS1 already have their new sizes
    Migrated,
    /// Neither of the above
    Unknown,
}

impl LayoutState {
    pub fn detect(table: &PartitionTable) -> Self {
        let sizes = (
            table.find(KERNEL_LABELS).map(|p| p.size),
            table.find(ROOTFS1_LABELS).map(|p| p.size),
            table.find(NAS_CONFIG_LABELS).map(|p| p.size),
        );

        let matches = |kernel: &Region, rootfs1: &Region, nas_config: &Region| {
            sizes == (Some(kernel.size), Some(rootfs1.size), Some(nas_config.size))
        };

        if matches(
            &layout::LEGACY_KERNEL,
            &layout::LEGACY_ROOTFS1,
            &layout::LEGACY_NAS_CONFIG,
        ) {
            LayoutState::Legacy
        } else if matches(&layout::KERNEL, &layout::ROOTFS1, &layout::NAS_CONFIG) {
            LayoutState::Migrated
        } else {
            LayoutState::Unknown
        }
    }
}

impl fmt::Display for LayoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayoutState::Legacy => "legacy (not migrated yet)",
            LayoutState::Migrated => "migrated",
            LayoutState::Unknown => "unrecognized",
        })
    }
}

#[cfg(test)]
pub(crate) const LEGACY_PROC_MTD: &str = r#"dev:    size   erasesize  name
mtd0: 00080000 00040000 "uboot"
mtd1: 00200000 00040000 "Kernel"
mtd2: 00900000 00040000 "RootFS1"
mtd3: 00300000 00040000 "RootFS2"
mtd4: 00040000 00040000 "U-Boot Config"
mtd5: 00140000 00040000 "NAS Config"
"#;

#[cfg(test)]
pub(crate) const KERNEL_LOG: &str = r#"[    1.021847] m25p80 spi0.0: mx25l12805d (16384 Kbytes)
[    1.027033] 6 cmdlinepart partitions found on MTD device spi0.0
[    1.032981] Creating 6 MTD partitions on "spi0.0":
[    1.037781] 0x000000000000-0x000000080000 : "uboot"
"#;

#[test]
fn test_parse_table() -> anyhow::Result<()> {
    let table = PartitionTable::parse(LEGACY_PROC_MTD)?;
    assert_eq!(table.partitions.len(), 6);
    assert_eq!(
        table.partitions[1],
        MtdPartition {
            device: "mtd1".into(),
            size: 0x200000,
            erase_size: 0x40000,
            label: "Kernel".into(),
        }
    );
    assert_eq!(table.partitions[4].label, "U-Boot Config");
    assert_eq!(table.partitions[4].path(), PathBuf::from("/dev/mtd4"));
    Ok(())
}

#[test]
fn test_parse_rejects_duplicate_devices() {
    let text = "mtd0: 00080000 00040000 \"uboot\"\nmtd0: 00080000 00040000 \"Kernel\"\n";
    assert!(PartitionTable::parse(text).is_err());
}

#[test]
fn test_lookup_aliases() -> anyhow::Result<()> {
    let table = PartitionTable::parse(
        "mtd4: 00040000 00040000 \"U-Boot_Config\"\n\
         mtd5: 00040000 00040000 \"NAS_Config\"\n\
         mtd6: 00040000 00040000 \"NAS Config\"\n",
    )?;
    assert_eq!(table.lookup(UBOOT_CONFIG_LABELS)?.device, "mtd4");
    // Both spellings are present; the first in kernel order is the one
    assert_eq!(table.lookup(NAS_CONFIG_LABELS)?.device, "mtd5");
    assert!(matches!(
        table.lookup(KERNEL_LABELS),
        Err(ResizeError::PartitionNotFound(_))
    ));
    Ok(())
}

#[test]
fn test_master_device() -> anyhow::Result<()> {
    assert_eq!(master_device(KERNEL_LOG)?, "spi0.0");

    let err = master_device("[    0.000000] Booting Linux on physical CPU 0x0\n").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ResizeError>(),
        Some(ResizeError::MasterDeviceNotFound)
    ));
    Ok(())
}

#[test]
fn test_inventory_legacy() -> anyhow::Result<()> {
    let table = PartitionTable::parse(LEGACY_PROC_MTD)?;
    let inventory = Inventory::read(&table, KERNEL_LOG)?;

    assert_eq!(inventory.kernel.device, "mtd1");
    assert_eq!(inventory.rootfs1.device, "mtd2");
    assert_eq!(inventory.nas_config.device, "mtd5");
    assert_eq!(inventory.uboot_config.device, "mtd4");
    assert_eq!(inventory.master, "spi0.0");
    Ok(())
}

#[test]
fn test_inventory_refuses_resized_kernel() -> anyhow::Result<()> {
    let text = LEGACY_PROC_MTD.replace(
        "mtd1: 00200000 00040000 \"Kernel\"",
        "mtd1: 00300000 00040000 \"Kernel\"",
    );
    let table = PartitionTable::parse(&text)?;

    let err = Inventory::read(&table, KERNEL_LOG).unwrap_err();
    match err.downcast_ref::<ResizeError>() {
        Some(ResizeError::AlreadyResized { label, actual, .. }) => {
            assert_eq!(*label, "Kernel");
            assert_eq!(*actual, 0x300000);
        }
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}

#[test]
fn test_inventory_refuses_resized_nas_config() -> anyhow::Result<()> {
    let text = LEGACY_PROC_MTD.replace(
        "mtd5: 00140000 00040000 \"NAS Config\"",
        "mtd5: 00040000 00040000 \"NAS_Config\"",
    );
    let table = PartitionTable::parse(&text)?;
    assert!(Inventory::read(&table, KERNEL_LOG).is_err());
    Ok(())
}

#[test]
fn test_check_model() {
    assert!(check_model("kirkwood-ts219-6282.dtb", || panic!("should not ask")).is_ok());
    assert!(check_model("kirkwood-ts119-6281.dtb", || true).is_ok());
    assert!(matches!(
        check_model("kirkwood-ts119-6281.dtb", || false),
        Err(ResizeError::Declined)
    ));
}

#[test]
fn test_layout_state() -> anyhow::Result<()> {
    let legacy = PartitionTable::parse(LEGACY_PROC_MTD)?;
    assert_eq!(LayoutState::detect(&legacy), LayoutState::Legacy);

    let migrated = PartitionTable::parse(
        r#"mtd0: 00080000 00040000 "uboot"
mtd1: 00300000 00040000 "Kernel"
mtd2: 00c00000 00040000 "RootFS1"
mtd3: 00200000 00040000 "Kernel_legacy"
mtd4: 00040000 00040000 "U-Boot Config"
mtd5: 00040000 00040000 "NAS Config"
"#,
    )?;
    assert_eq!(LayoutState::detect(&migrated), LayoutState::Migrated);

    assert_eq!(
        LayoutState::detect(&PartitionTable::default()),
        LayoutState::Unknown
    );
    Ok(())
}
