//! The real board: `/proc/mtd`, `/dev/mtdX`, and the tools Debian ships for the rest.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use duct::Expression;
use retry::{delay::Fixed, retry};

use super::{FlashMutator, Probe};
use crate::bootenv::{EnvDeviceConfig, EnvDialect};
use crate::error::ResizeError;
use crate::mtd::{dev::MtdDevice, MtdPartition, PROC_MTD};

/// flash-kernel's probe for which QNAP Kirkwood board this is
pub const DTB_PROBE: &str = "/usr/share/flash-kernel/dtb-probe/kirkwood-qnap";

pub const FW_PRINTENV: &str = "fw_printenv";
pub const FW_SETENV: &str = "fw_setenv";

/// Tools needed in any case
pub const ENV_TOOLS: [&str; 2] = [FW_PRINTENV, FW_SETENV];

/// Tools needed to shrink the 'NAS Config' filesystem
pub const FS_TOOLS: [&str; 4] = ["modprobe", "losetup", "e2fsck", "resize2fs"];

/// Build a command, echoing it to the operator first
fn sh(program: &str, args: &[&str]) -> Expression {
    eprintln!("+ {program} {}", args.join(" "));
    duct::cmd(program, args)
}

/// Read the board's DTB name
pub fn board_dtb() -> Result<String, ResizeError> {
    if !Path::new(DTB_PROBE).exists() {
        return Err(ResizeError::UnsupportedModel(format!(
            "{DTB_PROBE} is missing (is flash-kernel installed?)"
        )));
    }

    duct::cmd!(DTB_PROBE)
        .read()
        .map(|dtb| dtb.trim().to_owned())
        .map_err(|e| ResizeError::UnsupportedModel(e.to_string()))
}

/// Fail unless every tool in `tools` can be found on the `PATH`
pub fn require_tools<'a>(tools: impl IntoIterator<Item = &'a str>) -> Result<(), ResizeError> {
    for tool in tools {
        let path = which::which(tool).map_err(|_| ResizeError::MissingTool(tool.to_owned()))?;
        eprintln!("    {tool}: {}", path.display());
    }
    Ok(())
}

pub fn require_root() -> Result<(), ResizeError> {
    match nix::unistd::geteuid().is_root() {
        true => Ok(()),
        false => Err(ResizeError::NotRoot),
    }
}

/// Help text of a tool, whatever its exit status (some print usage and exit non-zero)
fn help_text(tool: &str) -> anyhow::Result<String> {
    duct::cmd!(tool, "--help")
        .stderr_to_stdout()
        .unchecked()
        .read()
        .with_context(|| format!("running {tool} --help"))
}

/// The board, as seen from a root shell on it
#[derive(Debug)]
pub struct LinuxHost {
    /// Where dumps, prepared images and tool configuration are written
    work_dir: PathBuf,
    /// The loop device used to repair and shrink the 'NAS Config' filesystem
    loop_dev: String,
}

impl LinuxHost {
    pub fn new(work_dir: impl Into<PathBuf>, loop_dev: impl Into<String>) -> anyhow::Result<Self> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir).with_context(|| work_dir.display().to_string())?;

        Ok(Self {
            work_dir,
            loop_dev: loop_dev.into(),
        })
    }

    fn work_file(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    fn write_work_file(&self, name: &str, data: impl AsRef<[u8]>) -> anyhow::Result<PathBuf> {
        let path = self.work_file(name);
        fs::write(&path, data).with_context(|| path.display().to_string())?;
        Ok(path)
    }

    /// Write `fw_env.config` for `config`, returning its path
    fn env_config_file(&self, config: &EnvDeviceConfig) -> anyhow::Result<PathBuf> {
        self.write_work_file("fw_env.config", config.to_string())
    }

    /// e2fsck, then resize2fs, on the image attached to the loop device
    fn shrink_attached(&self, target_blocks: u32) -> Result<(), ResizeError> {
        let loop_dev = self.loop_dev.as_str();

        // The first pass may report an error even though it fixed everything, so only two
        // failures in a row count
        retry(Fixed::from_millis(0).take(1), || {
            sh("e2fsck", &["-f", "-p", "-v", loop_dev]).run()
        })
        .map_err(|e| ResizeError::FilesystemRepair(format!("e2fsck failed: {}", e.error)))?;

        sh("resize2fs", &[loop_dev, target_blocks.to_string().as_str()])
            .run()
            .map_err(|e| ResizeError::FilesystemRepair(format!("resize2fs failed: {e}")))?;

        Ok(())
    }
}

impl Probe for LinuxHost {
    fn partition_table(&mut self) -> anyhow::Result<String> {
        fs::read_to_string(PROC_MTD).context(PROC_MTD)
    }

    fn kernel_log(&mut self) -> anyhow::Result<String> {
        duct::cmd!("dmesg").read().context("running dmesg")
    }

    fn env_dialect(&mut self) -> anyhow::Result<EnvDialect> {
        let printenv = help_text(FW_PRINTENV)?;
        let setenv = help_text(FW_SETENV)?;
        Ok(EnvDialect::detect_pair(&printenv, &setenv)?)
    }

    fn print_environment(&mut self, config: &EnvDeviceConfig) -> anyhow::Result<String> {
        let config = self.env_config_file(config)?;
        sh(FW_PRINTENV, &["-c", &*config.to_string_lossy()])
            .read()
            .context("reading the U-Boot environment")
    }
}

impl FlashMutator for LinuxHost {
    fn read_partition(&mut self, partition: &MtdPartition) -> anyhow::Result<Vec<u8>> {
        let device = MtdDevice::open(partition.path())?;
        let content = device.read(device.size() as usize)?;
        anyhow::ensure!(
            content.len() as u64 == partition.size,
            "read {} bytes from {partition}, expected {:#x}",
            content.len(),
            partition.size
        );
        Ok(content)
    }

    fn write_partition(&mut self, partition: &MtdPartition, data: &[u8]) -> anyhow::Result<()> {
        eprintln!(
            "+ write {} bytes to {} ({})",
            data.len(),
            partition.path().display(),
            partition.label
        );
        MtdDevice::open(partition.path())?.write(data)
    }

    fn commit_environment(
        &mut self,
        config: &EnvDeviceConfig,
        script: &str,
    ) -> anyhow::Result<()> {
        let config = self.env_config_file(config)?;
        let script = self.write_work_file("fw_setenv.script", script)?;
        sh(
            FW_SETENV,
            &[
                "-c",
                &*config.to_string_lossy(),
                "-s",
                &*script.to_string_lossy(),
            ],
        )
        .run()
        .context("fw_setenv")?;
        Ok(())
    }

    fn shrink_filesystem(&mut self, image: Vec<u8>, target_blocks: u32) -> anyhow::Result<Vec<u8>> {
        let dump_path = self.write_work_file("mtd_nas_config.dump", &image)?;
        let dump = dump_path.to_string_lossy();
        let loop_dev = self.loop_dev.as_str();

        sh("modprobe", &["loop"]).run().context("modprobe loop")?;
        sh("losetup", &[loop_dev, &*dump])
            .run()
            .map_err(|e| ResizeError::FilesystemRepair(format!("losetup failed: {e}")))?;

        let shrunk = self.shrink_attached(target_blocks);
        let detached = sh("losetup", &["-d", loop_dev]).run();
        shrunk?;
        detached.with_context(|| format!("detaching {loop_dev}"))?;

        fs::read(&dump_path).with_context(|| dump.to_string())
    }

    fn keep_copy(&mut self, name: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.write_work_file(name, data)?;
        eprintln!("    kept {}", path.display());
        Ok(())
    }
}

#[test]
fn test_work_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut host = LinuxHost::new(dir.path().join("work"), "/dev/loop7")?;

    host.keep_copy("mtd_kernel.tail", &[1, 2, 3])?;
    assert_eq!(fs::read(dir.path().join("work/mtd_kernel.tail"))?, [1, 2, 3]);

    let config = host.env_config_file(&EnvDeviceConfig::qnap("/dev/mtd4"))?;
    let text = fs::read_to_string(config)?;
    assert!(text.lines().nth(1).unwrap().starts_with("/dev/mtd4 "));
    Ok(())
}
