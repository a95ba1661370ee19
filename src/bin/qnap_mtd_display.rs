//! Show the current partition layout and boot settings. Nothing is changed.
//!
//! Mostly useful after the reboot that follows a resize, to check the kernel picked up the new
//! `mtdparts` descriptor.

use anyhow::Result;
use clap::Parser;

use qnap_mtd_resize::bootenv::{EnvDeviceConfig, Environment};
use qnap_mtd_resize::host::{linux::LinuxHost, Probe};
use qnap_mtd_resize::mtd::{self, LayoutState, PartitionTable};
use qnap_mtd_resize::util::Size;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// Where the fw_env.config for fw_printenv is written
    #[clap(long, value_name = "DIR", default_value = "/tmp")]
    work_dir: std::path::PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut host = LinuxHost::new(&cli.work_dir, "")?;

    let text = host.partition_table()?;
    println!("[{}]", mtd::PROC_MTD);
    println!("{}", text.trim_end());

    let table = PartitionTable::parse(&text)?;
    println!("\n[Partitions]");
    for (name, labels) in [
        ("uboot", &["uboot"][..]),
        ("U-Boot Config", mtd::UBOOT_CONFIG_LABELS),
        ("NAS Config", mtd::NAS_CONFIG_LABELS),
        ("Kernel", mtd::KERNEL_LABELS),
        ("Kernel_legacy", &["Kernel_legacy"][..]),
        ("RootFS1", mtd::ROOTFS1_LABELS),
        ("RootFS2", mtd::ROOTFS2_LABELS),
    ] {
        match table.find(labels) {
            Some(partition) => println!(
                "    {name:<14} /dev/{:<6} {:#010x} {}",
                partition.device,
                partition.size,
                Size(partition.size)
            ),
            None => println!("    {name:<14} missing"),
        }
    }

    match host
        .kernel_log()
        .and_then(|log| mtd::master_device(&log))
    {
        Ok(master) => println!("\n[Flash device]\n    {master}"),
        Err(error) => println!("\n[Flash device]\n    unknown: {error}"),
    }

    println!("\n[Layout]\n    {}", LayoutState::detect(&table));

    println!("\n[U-Boot environment]");
    let Some(uboot_config) = table.find(mtd::UBOOT_CONFIG_LABELS) else {
        println!("    no 'U-Boot Config' partition");
        return Ok(());
    };
    let config = EnvDeviceConfig::qnap(uboot_config.path().to_string_lossy());
    let env = Environment::parse(&host.print_environment(&config)?)?;
    for name in ["bootcmd", "bootargs"] {
        println!("    {name}={}", env.get(name).unwrap_or("(missing)"));
    }

    Ok(())
}
