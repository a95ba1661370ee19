//! The migration itself: probe, plan, ask, then write.
//!
//! Nothing is written to flash until the operator has seen the plan and confirmed it. The three
//! writes happen in a fixed order, chosen so that an interruption at any point leaves something
//! bootable or recoverable from the serial console:
//!
//! 1. the 'NAS Config' partition gets the shrunk config filesystem and the head of the kernel,
//! 2. the U-Boot environment is committed (the backups go in with it),
//! 3. the tail of the kernel goes to the start of the legacy Kernel partition.

use std::fmt;

use anyhow::Context;

use crate::bootenv::{EnvDeviceConfig, Environment, PatchSelection};
use crate::error::ResizeError;
use crate::host::{FlashMutator, Probe};
use crate::layout;
use crate::mtd::{Inventory, PartitionTable};
use crate::plan::{Images, MigrationPlan};

/// Names of the files kept in the work directory
pub const NAS_CONFIG_IMAGE: &str = "mtd_nas_config.new";
pub const KERNEL_TAIL_IMAGE: &str = "mtd_kernel.tail";
pub const SETENV_SCRIPT: &str = "fw_setenv.script";

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Do everything except change flash
    pub dry_run: bool,
    /// Erase the 'NAS Config' filesystem instead of shrinking it
    pub drop_nas_config: bool,
    pub selection: PatchSelection,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Probing,
    Planning,
    AwaitingConfirmation,
    Mutating,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "Idle",
            Phase::Probing => "Probing the device",
            Phase::Planning => "Planning the migration",
            Phase::AwaitingConfirmation => "Waiting for confirmation",
            Phase::Mutating => "Writing to flash",
            Phase::Done => "Done",
        })
    }
}

/// What a completed run did
#[derive(Debug, Clone)]
pub struct Report {
    pub inventory: Inventory,
    pub plan: MigrationPlan,
    pub images: Images,
    /// False for a dry run
    pub mutated: bool,
}

fn enter(phase: &mut Phase, next: Phase) {
    *phase = next;
    eprintln!("[*] {next}");
}

/// Run the whole migration against `host`.
///
/// `confirm` is shown the plan once everything has been computed and the images prepared; the
/// run only proceeds past that point if it returns true. A dry run still asks, and still does
/// every read and preparation step, but leaves flash and the environment alone.
///
/// A failure carries the [Phase] it happened in as context.
pub fn run<H: Probe + FlashMutator>(
    host: &mut H,
    options: &Options,
    confirm: impl FnOnce(&MigrationPlan) -> bool,
) -> anyhow::Result<Report> {
    let mut phase = Phase::Idle;
    run_phases(host, options, confirm, &mut phase).with_context(|| phase.to_string())
}

fn run_phases<H: Probe + FlashMutator>(
    host: &mut H,
    options: &Options,
    confirm: impl FnOnce(&MigrationPlan) -> bool,
    phase: &mut Phase,
) -> anyhow::Result<Report> {
    enter(phase, Phase::Probing);
    options.selection.validate()?;

    let table = PartitionTable::parse(&host.partition_table()?)?;
    let inventory = Inventory::read(&table, &host.kernel_log()?)?;
    for partition in [
        &inventory.uboot_config,
        &inventory.nas_config,
        &inventory.kernel,
        &inventory.rootfs1,
    ] {
        eprintln!("    {partition}: {:#x} bytes", partition.size);
    }
    eprintln!("    flash device: {}", inventory.master);

    let dialect = host.env_dialect()?;
    let env_config = EnvDeviceConfig::qnap(inventory.uboot_config.path().to_string_lossy());
    let env = Environment::parse(&host.print_environment(&env_config)?)?;

    enter(phase, Phase::Planning);
    let plan = MigrationPlan::new(&inventory, &env, dialect, &options.selection)?;
    eprintln!("    old bootcmd:  {}", plan.old.bootcmd);
    eprintln!("    new bootcmd:  {}", plan.new.bootcmd);
    eprintln!("    old bootargs: {}", plan.old.bootargs);
    eprintln!("    new bootargs: {}", plan.new.bootargs);
    eprintln!("    mtdparts:     {}", plan.mtdparts);

    let config_fs = host.read_partition(&inventory.nas_config)?;
    let kernel = host.read_partition(&inventory.kernel)?;

    let config_fs = match options.drop_nas_config {
        true => plan.relocation.erased_config(),
        false => host.shrink_filesystem(config_fs, layout::NAS_CONFIG_FS_BLOCKS)?,
    };

    let images = Images {
        nas_config: plan.relocation.config_image(&config_fs, &kernel)?,
        kernel_tail: plan.relocation.kernel_tail(&kernel)?,
    };
    host.keep_copy(NAS_CONFIG_IMAGE, &images.nas_config)?;
    host.keep_copy(KERNEL_TAIL_IMAGE, &images.kernel_tail)?;
    host.keep_copy(SETENV_SCRIPT, plan.script.as_bytes())?;

    enter(phase, Phase::AwaitingConfirmation);
    if !confirm(&plan) {
        return Err(ResizeError::Declined.into());
    }

    enter(phase, Phase::Mutating);

    struct TaskCtx<'a, H> {
        rpt: howudoin::Tx,
        host: &'a mut H,
        inventory: &'a Inventory,
        env_config: &'a EnvDeviceConfig,
        plan: &'a MigrationPlan,
        images: &'a Images,
    }
    type TaskFn<Ctx> = fn(&mut Ctx) -> anyhow::Result<()>;
    let tasks: [(&'static str, TaskFn<TaskCtx<'_, H>>); 3] = [
        ("Writing 'NAS Config' image", |ctx| {
            ctx.host
                .write_partition(&ctx.inventory.nas_config, &ctx.images.nas_config)
        }),
        ("Committing U-Boot environment", |ctx| {
            ctx.host.commit_environment(ctx.env_config, &ctx.plan.script)
        }),
        ("Writing kernel tail to Kernel_legacy", |ctx| {
            ctx.host
                .write_partition(&ctx.inventory.kernel, &ctx.images.kernel_tail)
        }),
    ];

    let rpt = howudoin::new()
        .label("Resizing MTD partitions")
        .set_len(u64::try_from(tasks.len()).ok());
    {
        let mut ctx = TaskCtx {
            rpt,
            host,
            inventory: &inventory,
            env_config: &env_config,
            plan: &plan,
            images: &images,
        };
        for (desc, task) in tasks {
            ctx.rpt.desc(desc);
            ctx.rpt.inc();

            if options.dry_run {
                eprintln!("+ (dry run) {desc}");
                continue;
            }
            task(&mut ctx).map_err(|source| ResizeError::Mutation { step: desc, source })?;
        }
        ctx.rpt.finish();
    }

    enter(phase, Phase::Done);
    Ok(Report {
        inventory,
        plan,
        images,
        mutated: !options.dry_run,
    })
}

#[cfg(test)]
fn sim_host() -> crate::host::SimHost {
    use crate::bootenv::PRINTENV;
    use crate::mtd::{KERNEL_LOG, LEGACY_PROC_MTD};

    crate::host::SimHost::new(LEGACY_PROC_MTD, KERNEL_LOG, PRINTENV)
        .load("mtd5", vec![0xC0; 0x140000])
        .load("mtd1", sim_kernel())
}

/// 2 MiB, each MiB filled with its index + 1
#[cfg(test)]
fn sim_kernel() -> Vec<u8> {
    (0..0x200000).map(|i| (i / 0x100000) as u8 + 1).collect()
}

#[test]
fn test_run() -> anyhow::Result<()> {
    use crate::host::SimOp;

    let mut host = sim_host();
    let report = run(&mut host, &Options::default(), |_| true)?;
    assert!(report.mutated);

    let writes: Vec<_> = host.destructive_ops().cloned().collect();
    assert_eq!(
        writes,
        [
            SimOp::Write("mtd5".into(), 0x140000),
            SimOp::Commit(report.plan.script.clone()),
            SimOp::Write("mtd1".into(), 0x100000),
        ]
    );
    assert!(host.ops.contains(&SimOp::Shrink(layout::NAS_CONFIG_FS_BLOCKS)));

    let nas_config = &host.partitions["mtd5"];
    assert!(nas_config[..0x40000].iter().all(|&x| x == 0xC0));
    assert_eq!(&nas_config[0x40000..], &sim_kernel()[..0x100000]);

    // The tail moved to the front; the back of the legacy partition is untouched
    let kernel = &host.partitions["mtd1"];
    assert!(kernel.iter().all(|&x| x == 2));
    Ok(())
}

#[test]
fn test_dry_run() -> anyhow::Result<()> {
    use crate::host::SimOp;

    let mut host = sim_host();
    let options = Options {
        dry_run: true,
        ..Default::default()
    };
    let report = run(&mut host, &options, |_| true)?;

    assert!(!report.mutated);
    assert_eq!(host.destructive_ops().count(), 0);
    assert_eq!(host.partitions["mtd1"], sim_kernel());

    // Everything up to the writes still happened
    assert!(report.plan.new.bootcmd.ends_with(";bootm 0x900000"));
    assert_eq!(report.images.nas_config.len(), 0x140000);
    for name in [NAS_CONFIG_IMAGE, KERNEL_TAIL_IMAGE, SETENV_SCRIPT] {
        assert!(host.ops.contains(&SimOp::Keep(name.into())));
    }
    Ok(())
}

#[test]
fn test_declined() {
    let mut host = sim_host();
    let err = run(&mut host, &Options::default(), |_| false).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ResizeError>(),
        Some(ResizeError::Declined)
    ));
    assert_eq!(host.destructive_ops().count(), 0);
}

#[test]
fn test_shrink_failure() {
    let mut host = sim_host();
    host.fail_shrink = true;

    let mut asked = false;
    let err = run(&mut host, &Options::default(), |_| {
        asked = true;
        true
    })
    .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ResizeError>(),
        Some(ResizeError::FilesystemRepair(_))
    ));
    assert!(!asked);
    assert_eq!(host.destructive_ops().count(), 0);
}

#[test]
fn test_drop_nas_config() -> anyhow::Result<()> {
    use crate::host::SimOp;

    let mut host = sim_host();
    let options = Options {
        drop_nas_config: true,
        ..Default::default()
    };
    run(&mut host, &options, |_| true)?;

    assert!(!host.ops.iter().any(|op| matches!(op, SimOp::Shrink(_))));
    assert!(host.partitions["mtd5"][..0x40000].iter().all(|&x| x == 0xFF));
    Ok(())
}

#[test]
fn test_write_failure() {
    use crate::error::Category;

    let mut host = sim_host();
    host.fail_write = Some("mtd1".into());
    let err = run(&mut host, &Options::default(), |_| true).unwrap_err();

    let err = err.downcast_ref::<ResizeError>().unwrap();
    assert_eq!(err.category(), Category::Mutation);
    assert!(err.to_string().starts_with("Writing kernel tail"));
}

#[test]
fn test_already_resized() {
    let mut host = sim_host();
    host.proc_mtd = host.proc_mtd.replace(
        r#"mtd1: 00200000 00040000 "Kernel""#,
        r#"mtd1: 00300000 00040000 "Kernel""#,
    );
    let err = run(&mut host, &Options::default(), |_| true).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ResizeError>(),
        Some(ResizeError::AlreadyResized { .. })
    ));
    assert!(host.ops.is_empty());
}

#[test]
fn test_skip_without_fragment() {
    let mut host = sim_host();
    let options = Options {
        selection: PatchSelection {
            skip_bootargs: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let err = run(&mut host, &options, |_| true).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ResizeError>(),
        Some(ResizeError::SkipWithoutFragment("bootargs"))
    ));
    assert!(host.ops.is_empty());
}

#[test]
fn test_failure_phase() {
    let mut host = sim_host();
    host.dialect = None;
    let err = run(&mut host, &Options::default(), |_| true).unwrap_err();
    assert_eq!(err.to_string(), Phase::Probing.to_string());

    let mut host = sim_host();
    host.fail_shrink = true;
    let err = run(&mut host, &Options::default(), |_| true).unwrap_err();
    assert_eq!(err.to_string(), Phase::Planning.to_string());

    let mut host = sim_host();
    let err = run(&mut host, &Options::default(), |_| false).unwrap_err();
    assert_eq!(err.to_string(), Phase::AwaitingConfirmation.to_string());

    let mut host = sim_host();
    host.fail_write = Some("mtd5".into());
    let err = run(&mut host, &Options::default(), |_| true).unwrap_err();
    assert_eq!(err.to_string(), Phase::Mutating.to_string());
    assert!(matches!(
        err.downcast_ref::<ResizeError>(),
        Some(ResizeError::Mutation { .. })
    ));
}
