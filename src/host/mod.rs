//! The boundary between the migration logic and the machine it runs on.
//!
//! Everything that reads system state is a [Probe]; everything that changes flash is a
//! [FlashMutator]. On the board both are implemented by [linux::LinuxHost]; the tests use
//! [SimHost], which keeps the partitions in memory and records what was asked of it.

use std::collections::HashMap;

use anyhow::Context;

use crate::bootenv::{EnvDeviceConfig, EnvDialect};
use crate::error::ResizeError;
use crate::mtd::MtdPartition;

#[cfg(target_os = "linux")]
pub mod linux;

/// Read-only access to the system state the migration is planned from
pub trait Probe {
    /// Text of `/proc/mtd`
    fn partition_table(&mut self) -> anyhow::Result<String>;

    /// Text of the kernel log
    fn kernel_log(&mut self) -> anyhow::Result<String>;

    /// Which script syntax the installed environment tools expect
    fn env_dialect(&mut self) -> anyhow::Result<EnvDialect>;

    /// `fw_printenv` output for the environment described by `config`
    fn print_environment(&mut self, config: &EnvDeviceConfig) -> anyhow::Result<String>;
}

/// The operations that touch flash, or prepare content for it
pub trait FlashMutator {
    /// Read the full content of a partition
    fn read_partition(&mut self, partition: &MtdPartition) -> anyhow::Result<Vec<u8>>;

    /// Overwrite the start of a partition with `data`
    fn write_partition(&mut self, partition: &MtdPartition, data: &[u8]) -> anyhow::Result<()>;

    /// Apply an `fw_setenv` script to the environment described by `config`
    fn commit_environment(&mut self, config: &EnvDeviceConfig, script: &str)
        -> anyhow::Result<()>;

    /// Check and shrink the ext2 filesystem in `image` to `target_blocks` blocks, returning the
    /// new image
    fn shrink_filesystem(&mut self, image: Vec<u8>, target_blocks: u32) -> anyhow::Result<Vec<u8>>;

    /// Keep a copy of prepared content around for the operator to inspect or replay by hand
    fn keep_copy(&mut self, _name: &str, _data: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a [SimHost] was asked to do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    Read(String),
    Write(String, usize),
    Commit(String),
    Shrink(u32),
    Keep(String),
}

impl SimOp {
    /// Does this operation change flash?
    pub fn is_destructive(&self) -> bool {
        matches!(self, SimOp::Write(..) | SimOp::Commit(_))
    }
}

/// A simulated board, for testing purposes
#[derive(Debug, Clone)]
pub struct SimHost {
    pub proc_mtd: String,
    pub kernel_log: String,
    pub printenv: String,
    pub dialect: Option<EnvDialect>,

    /// Partition content by device name
    pub partitions: HashMap<String, Vec<u8>>,

    /// When set, writing to this device fails
    pub fail_write: Option<String>,

    /// When set, the filesystem check fails
    pub fail_shrink: bool,

    pub ops: Vec<SimOp>,
}

impl SimHost {
    pub fn new(proc_mtd: &str, kernel_log: &str, printenv: &str) -> Self {
        Self {
            proc_mtd: proc_mtd.to_owned(),
            kernel_log: kernel_log.to_owned(),
            printenv: printenv.to_owned(),
            dialect: Some(EnvDialect::Equals),
            partitions: HashMap::new(),
            fail_write: None,
            fail_shrink: false,
            ops: Vec::new(),
        }
    }

    /// Fill a partition with content
    pub fn load(mut self, device: &str, content: Vec<u8>) -> Self {
        self.partitions.insert(device.to_owned(), content);
        self
    }

    pub fn destructive_ops(&self) -> impl Iterator<Item = &SimOp> {
        self.ops.iter().filter(|op| op.is_destructive())
    }
}

impl Probe for SimHost {
    fn partition_table(&mut self) -> anyhow::Result<String> {
        Ok(self.proc_mtd.clone())
    }

    fn kernel_log(&mut self) -> anyhow::Result<String> {
        Ok(self.kernel_log.clone())
    }

    fn env_dialect(&mut self) -> anyhow::Result<EnvDialect> {
        self.dialect
            .ok_or_else(|| ResizeError::EnvToolDialect("simulated unknown tool".into()).into())
    }

    fn print_environment(&mut self, _config: &EnvDeviceConfig) -> anyhow::Result<String> {
        Ok(self.printenv.clone())
    }
}

impl FlashMutator for SimHost {
    fn read_partition(&mut self, partition: &MtdPartition) -> anyhow::Result<Vec<u8>> {
        self.ops.push(SimOp::Read(partition.device.clone()));
        self.partitions
            .get(&partition.device)
            .cloned()
            .with_context(|| format!("no content for {partition}"))
    }

    fn write_partition(&mut self, partition: &MtdPartition, data: &[u8]) -> anyhow::Result<()> {
        self.ops
            .push(SimOp::Write(partition.device.clone(), data.len()));
        anyhow::ensure!(
            self.fail_write.as_ref() != Some(&partition.device),
            "simulated write failure on {partition}"
        );

        let content = self
            .partitions
            .entry(partition.device.clone())
            .or_insert_with(|| vec![0xFF; partition.size as usize]);
        anyhow::ensure!(data.len() <= content.len(), "{partition} too small");
        content[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit_environment(
        &mut self,
        _config: &EnvDeviceConfig,
        script: &str,
    ) -> anyhow::Result<()> {
        self.ops.push(SimOp::Commit(script.to_owned()));
        Ok(())
    }

    fn shrink_filesystem(&mut self, image: Vec<u8>, target_blocks: u32) -> anyhow::Result<Vec<u8>> {
        self.ops.push(SimOp::Shrink(target_blocks));
        if self.fail_shrink {
            return Err(ResizeError::FilesystemRepair("simulated e2fsck failure".into()).into());
        }
        Ok(image)
    }

    fn keep_copy(&mut self, name: &str, _data: &[u8]) -> anyhow::Result<()> {
        self.ops.push(SimOp::Keep(name.to_owned()));
        Ok(())
    }
}
