//! Resize the MTD partitions of a QNAP Kirkwood NAS running Debian.
//!
//! This runs on the NAS itself, as root, from a normal shell. Everything up to the confirmation
//! prompt is read-only; the prompt is the last chance to take a backup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use qnap_mtd_resize::bootenv::PatchSelection;
use qnap_mtd_resize::error::{Category, ResizeError};
use qnap_mtd_resize::host::linux::{self, LinuxHost, ENV_TOOLS, FS_TOOLS};
use qnap_mtd_resize::migrate::{self, Options};
use qnap_mtd_resize::mtd::{self, MtdPartition, PartitionTable};

const SERIAL_CONSOLE_URL: &str = "https://www.cyrius.com/debian/kirkwood/qnap/ts-219/serial/";

const SUCCESS_NOTES: &str = "\
SUCCESS. You can reboot now.

Notes:
- Don't perform a kernel or system update before the next reboot, so don't wait too long.
- Consider compressing the initrd with 'xz' to make the most of the new space:

    echo \"COMPRESS=xz\" > /etc/initramfs-tools/conf.d/compress
";

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// Do everything except writing to flash and the U-Boot environment
    #[clap(long)]
    dry_run: bool,

    /// Leave bootcmd alone (requires --env-fragment)
    #[clap(long)]
    skip_bootcmd_patch: bool,

    /// Leave bootargs alone (requires --env-fragment)
    #[clap(long)]
    skip_bootargs_patch: bool,

    /// fw_setenv script lines to append to the generated script
    #[clap(long, value_name = "FILE")]
    env_fragment: Option<PathBuf>,

    /// Discard the content of 'NAS Config' instead of shrinking its filesystem
    #[clap(long)]
    drop_nas_config: bool,

    /// Loop device used to check and shrink the 'NAS Config' filesystem
    #[clap(long = "loop", value_name = "DEV", default_value = "/dev/loop0")]
    loop_dev: String,

    /// Where dumps, prepared images and scripts are kept
    #[clap(long, value_name = "DIR", default_value = "/tmp")]
    work_dir: PathBuf,
}

/// Ask a yes/no question; anything but "y" is a no
fn ask_yes_no(question: &str) -> bool {
    eprint!("{question} (y/N) ");
    let mut input = String::new();
    match io::stdin().read_line(&mut input) {
        Ok(_) => input.trim().eq_ignore_ascii_case("y"),
        Err(_) => false,
    }
}

/// Nag the operator to type "CONFIRM". End of input is a no.
fn confirm_prompt() -> bool {
    const CONFIRM_KEYWORD: &str = "CONFIRM";

    let mut input = String::new();
    loop {
        eprint!("Type \"{CONFIRM_KEYWORD}\" to flash the new layout: ");
        input.clear();
        match io::stdin().read_line(&mut input) {
            Ok(_) if input.trim_end() == CONFIRM_KEYWORD => return true,
            Ok(0) | Err(_) => return false,
            _ => continue,
        };
    }
}

/// e.g. `/tmp/mtd5.nas-config.backup`
fn backup_path(work_dir: &Path, partition: &MtdPartition) -> PathBuf {
    let slug = partition
        .label
        .to_lowercase()
        .replace([' ', '_'], "-");
    work_dir.join(format!("{}.{slug}.backup", partition.device))
}

fn print_backup_warning(cli: &Cli, table: &PartitionTable) {
    let work_dir = &cli.work_dir;
    let mut commands = String::new();
    for partition in &table.partitions {
        commands += &format!(
            "    cat {} > {}\n",
            partition.path().display(),
            backup_path(work_dir, partition).display()
        );
    }
    commands += &format!(
        "    fw_printenv -c {} > {}\n",
        work_dir.join("fw_env.config").display(),
        work_dir.join("uboot_config.backup.txt").display()
    );
    commands += &format!(
        "    cd {} && tar cvzf mtd_backup.tgz mtd?.*.backup uboot_config.backup.txt\n",
        work_dir.display()
    );

    eprintln!(
        "\
------------------------------------------------------------
[!] Everything is fine up to now. The next steps write to flash.

It is highly recommended to back up every MTD partition and the U-Boot
environment, and to copy the result off the NAS (USB stick, scp):

{commands}
Do not cut the power until the end of the operation. If anything goes wrong,
recovery needs U-Boot commands on a serial console:

    {SERIAL_CONSOLE_URL}
"
    );

    if cli.dry_run {
        eprintln!("Note: this is a dry run. Nothing will be written, even if you confirm.\n");
    }
}

fn resize(cli: &Cli) -> anyhow::Result<migrate::Report> {
    eprintln!("[*] Checking the QNAP model");
    let dtb = linux::board_dtb()?;
    eprintln!("    DTB file: {dtb}");
    mtd::check_model(&dtb, || {
        eprintln!("[!] The partition resize has not been tested on this device yet.");
        ask_yes_no("Do you want to continue?")
    })?;
    if !mtd::TESTED_DTBS.contains(&dtb.as_str()) {
        eprintln!("    In case of success, please report the DTB file name.");
    }

    let fragment = match &cli.env_fragment {
        Some(path) => Some(
            fs::read_to_string(path).with_context(|| path.display().to_string())?,
        ),
        None => None,
    };
    let options = Options {
        dry_run: cli.dry_run,
        drop_nas_config: cli.drop_nas_config,
        selection: PatchSelection {
            skip_bootcmd: cli.skip_bootcmd_patch,
            skip_bootargs: cli.skip_bootargs_patch,
            fragment,
        },
    };
    options.selection.validate()?;

    eprintln!("[*] Checking the required tools");
    linux::require_tools(ENV_TOOLS)?;
    if !cli.drop_nas_config {
        linux::require_tools(FS_TOOLS)?;
    }
    linux::require_root()?;

    let table = PartitionTable::load()?;
    let mut host = LinuxHost::new(&cli.work_dir, cli.loop_dev.as_str())?;

    migrate::run(&mut host, &options, |_plan| {
        print_backup_warning(cli, &table);
        confirm_prompt()
    })
}

/// What to tell the operator after a classified failure
fn guidance(error: &ResizeError, cli: &Cli) -> String {
    match error.category() {
        Category::Precondition => "Nothing was changed.".into(),
        Category::PatternMismatch => "\
Nothing was changed. Please report this log. The patch can be replaced by hand with
--skip-bootcmd-patch / --skip-bootargs-patch and an --env-fragment."
            .into(),
        Category::FilesystemRepair => "\
Nothing was written. Fix the 'NAS Config' filesystem by hand, or rerun with
--drop-nas-config to discard its content."
            .into(),
        Category::Declined => "Abort.".into(),
        Category::Mutation => format!(
            "\
The flash may now be in an inconsistent state. Do NOT reboot yet.
The prepared images and the fw_setenv script are in {}; retry the failed step
by hand, or restore the backups. Serial console recovery:
    {SERIAL_CONSOLE_URL}",
            cli.work_dir.display()
        ),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let result = resize(&cli);

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down

    match result {
        Ok(report) => {
            if report.mutated {
                eprintln!("[+] {SUCCESS_NOTES}");
            } else {
                eprintln!("[+] Dry run complete. Nothing was written.");
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("[-] {error:#}");
            match error.chain().find_map(|e| e.downcast_ref::<ResizeError>()) {
                Some(classified) => {
                    eprintln!("{}", guidance(classified, &cli));
                    ExitCode::from(classified.exit_code())
                }
                None => ExitCode::FAILURE,
            }
        }
    }
}
