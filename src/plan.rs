//! Putting the pieces together: everything that has to be decided before the first write.

use std::ops::Range;

use anyhow::ensure;
use bytes::{BufMut, Bytes, BytesMut};

use crate::bootenv::{self, bootargs, bootcmd, BootVars, EnvDialect, Environment, PatchSelection};
use crate::layout::{self, Region};
use crate::mtd::Inventory;

/// How the kernel gets from the legacy Kernel partition into the new Kernel region.
///
/// The new Kernel starts in the space reclaimed from 'NAS Config', so the first part of the
/// kernel goes into the tail of the 'NAS Config' partition (which the running kernel still sees
/// at its legacy size), and the rest into the legacy Kernel partition:
///
/// ```text
///          0x0c0000     0x100000           0x200000           0x300000
/// legacy   | NAS Config (1280 KiB)         | Kernel (2 MiB)                        |
/// new      | NAS Config | Kernel (3 MiB)                                           |
/// content  | config fs  | kernel[0..1M]    | kernel[1M..2M]     | (left as is)     |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// How much of the (shrunk) 'NAS Config' filesystem image is kept
    pub config_len: usize,
    /// Bytes of the legacy kernel that go after it, into the 'NAS Config' partition
    pub kernel_head: Range<usize>,
    /// Bytes of the legacy kernel that go to the start of the legacy Kernel partition
    pub kernel_tail: Range<usize>,
}

impl Relocation {
    /// Derive the relocation from the two layouts, checking they line up the way described above
    pub fn for_layouts(
        legacy_config: &Region,
        legacy_kernel: &Region,
        config: &Region,
        kernel: &Region,
    ) -> anyhow::Result<Self> {
        ensure!(
            config.offset == legacy_config.offset && config.size < legacy_config.size,
            "'NAS Config' must keep its offset and shrink"
        );
        ensure!(
            kernel.offset == config.range().end,
            "the new Kernel must start right after the new 'NAS Config'"
        );
        ensure!(
            legacy_config.range().end == legacy_kernel.offset,
            "the legacy Kernel must follow the legacy 'NAS Config'"
        );

        let head_len = (legacy_config.size - config.size) as usize;
        ensure!(
            (head_len as u64) < legacy_kernel.size,
            "nothing of the kernel would stay in place"
        );

        Ok(Self {
            config_len: config.size as usize,
            kernel_head: 0..head_len,
            kernel_tail: head_len..legacy_kernel.size as usize,
        })
    }

    /// The relocation between [layout::LEGACY_LAYOUT] and [layout::TARGET_LAYOUT]
    pub fn qnap() -> anyhow::Result<Self> {
        Self::for_layouts(
            &layout::LEGACY_NAS_CONFIG,
            &layout::LEGACY_KERNEL,
            &layout::NAS_CONFIG,
            &layout::KERNEL,
        )
    }

    /// The new content of the 'NAS Config' partition: the start of the config filesystem image,
    /// then the head of the kernel.
    pub fn config_image(&self, config_fs: &[u8], kernel: &[u8]) -> anyhow::Result<Bytes> {
        ensure!(
            config_fs.len() >= self.config_len,
            "'NAS Config' image is {} bytes, need at least {}",
            config_fs.len(),
            self.config_len
        );
        let head = self.kernel_bytes(kernel, &self.kernel_head)?;

        let mut image = BytesMut::with_capacity(self.config_len + head.len());
        image.put_slice(&config_fs[..self.config_len]);
        image.put_slice(head);
        Ok(image.freeze())
    }

    /// The new start of the legacy Kernel partition
    pub fn kernel_tail(&self, kernel: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Bytes::copy_from_slice(
            self.kernel_bytes(kernel, &self.kernel_tail)?,
        ))
    }

    /// An erased config area, for when the 'NAS Config' filesystem is dropped instead of shrunk
    pub fn erased_config(&self) -> Vec<u8> {
        vec![0xFF; self.config_len]
    }

    fn kernel_bytes<'a>(&self, kernel: &'a [u8], range: &Range<usize>) -> anyhow::Result<&'a [u8]> {
        kernel.get(range.clone()).ok_or_else(|| {
            anyhow::anyhow!(
                "Kernel partition dump is {} bytes, too short for {:#x}..{:#x}",
                kernel.len(),
                range.start,
                range.end
            )
        })
    }
}

/// The content every write will put on flash
#[derive(Debug, Clone)]
pub struct Images {
    /// For the legacy 'NAS Config' partition
    pub nas_config: Bytes,
    /// For the start of the legacy Kernel partition
    pub kernel_tail: Bytes,
}

/// Everything about the environment that will change
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub old: BootVars,
    pub new: BootVars,
    pub mtdparts: String,
    /// The `fw_setenv -s` script
    pub script: String,
    pub relocation: Relocation,
}

impl MigrationPlan {
    /// Compute the new environment for a board whose partitions are described by `inventory`.
    ///
    /// Fails, without side effects, if a skipped patch has no replacement, if `bootcmd` or
    /// `bootargs` is missing, or if either has a shape we don't know how to patch.
    pub fn new(
        inventory: &Inventory,
        env: &Environment,
        dialect: EnvDialect,
        selection: &PatchSelection,
    ) -> anyhow::Result<Self> {
        selection.validate()?;
        layout::validate(&layout::TARGET_LAYOUT)?;

        let old = BootVars {
            bootcmd: env.require("bootcmd")?.to_owned(),
            bootargs: env.require("bootargs")?.to_owned(),
        };

        let new = BootVars {
            bootcmd: match selection.skip_bootcmd {
                true => old.bootcmd.clone(),
                false => bootcmd::patch(&old.bootcmd)?,
            },
            bootargs: match selection.skip_bootargs {
                true => old.bootargs.clone(),
                false => bootargs::patch(&old.bootargs, &inventory.master)?,
            },
        };

        let script = bootenv::build_script(dialect, &old, &new, selection)?;

        Ok(Self {
            old,
            new,
            mtdparts: layout::mtdparts(&inventory.master),
            script,
            relocation: Relocation::qnap()?,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_inventory() -> Inventory {
    use crate::mtd::{PartitionTable, KERNEL_LOG, LEGACY_PROC_MTD};

    let table = PartitionTable::parse(LEGACY_PROC_MTD).unwrap();
    Inventory::read(&table, KERNEL_LOG).unwrap()
}

#[test]
fn test_relocation() -> anyhow::Result<()> {
    use crate::util::{KIB, MIB};

    let relocation = Relocation::qnap()?;
    assert_eq!(relocation.config_len, 256 * KIB as usize);
    assert_eq!(relocation.kernel_head, 0..MIB as usize);
    assert_eq!(relocation.kernel_tail, MIB as usize..2 * MIB as usize);
    Ok(())
}

#[test]
fn test_relocation_images() -> anyhow::Result<()> {
    let relocation = Relocation::qnap()?;

    let config_fs: Vec<u8> = vec![0xC0; 1280 * 1024];
    let kernel: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i / 1024 / 1024) as u8 + 1).collect();

    let image = relocation.config_image(&config_fs, &kernel)?;
    assert_eq!(image.len(), 1280 * 1024);
    assert!(image[..256 * 1024].iter().all(|&x| x == 0xC0));
    assert!(image[256 * 1024..].iter().all(|&x| x == 1));

    let tail = relocation.kernel_tail(&kernel)?;
    assert_eq!(tail.len(), 1024 * 1024);
    assert!(tail.iter().all(|&x| x == 2));

    // A dump that came back short is not silently padded
    assert!(relocation.kernel_tail(&kernel[..1024]).is_err());
    assert!(relocation.config_image(&config_fs[..1024], &kernel).is_err());
    Ok(())
}

#[test]
fn test_relocation_rejects_misaligned_layout() {
    let mut kernel = layout::KERNEL;
    kernel.offset += 0x40000;
    assert!(Relocation::for_layouts(
        &layout::LEGACY_NAS_CONFIG,
        &layout::LEGACY_KERNEL,
        &layout::NAS_CONFIG,
        &kernel,
    )
    .is_err());
}

#[test]
fn test_plan() -> anyhow::Result<()> {
    let env = Environment::parse(bootenv::PRINTENV)?;
    let plan = MigrationPlan::new(
        &test_inventory(),
        &env,
        EnvDialect::Equals,
        &Default::default(),
    )?;

    assert!(plan.new.bootcmd.ends_with(";bootm 0x900000"));
    assert!(plan.new.bootargs.contains("initrd=0xb00000,0xc00000"));
    assert!(plan.mtdparts.starts_with("spi0.0:"));
    assert!(plan.script.starts_with(&format!(
        "bootargs_backup={}\nbootcmd_backup={}\n",
        plan.old.bootargs, plan.old.bootcmd
    )));
    Ok(())
}

#[test]
fn test_plan_missing_bootargs() -> anyhow::Result<()> {
    use crate::error::ResizeError;

    let env = Environment::parse("bootcmd=bootm 0x800000\n")?;
    let err = MigrationPlan::new(
        &test_inventory(),
        &env,
        EnvDialect::Equals,
        &Default::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ResizeError>(),
        Some(ResizeError::MissingVariable("bootargs"))
    ));
    Ok(())
}

#[test]
fn test_plan_skip_unknown_bootcmd() -> anyhow::Result<()> {
    // A bootcmd we can't patch is fine when the operator supplies their own
    let env = Environment::parse(
        "bootcmd=run custom_boot\n\
         bootargs=root=/dev/ram initrd=0xa00000,0x900000\n",
    )?;
    let selection = PatchSelection {
        skip_bootcmd: true,
        skip_bootargs: false,
        fragment: Some("bootcmd=run custom_boot_new".into()),
    };
    let plan = MigrationPlan::new(&test_inventory(), &env, EnvDialect::Equals, &selection)?;

    assert_eq!(plan.new.bootcmd, plan.old.bootcmd);
    assert!(plan.script.ends_with("bootcmd=run custom_boot_new\n"));
    assert!(!plan.script.contains("\nbootcmd=run custom_boot\n"));
    Ok(())
}
