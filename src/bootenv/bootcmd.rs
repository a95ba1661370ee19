//! Rewriting `bootcmd` to load the kernel and initrd from the new partitions.
//!
//! QNAP's U-Boot boots by copying the kernel and the initrd out of memory-mapped NOR into RAM,
//! then jumping into the kernel:
//!
//! ```text
//! uart1 0x68;cp.l 0xf8200000 0x800000 0x80000;cp.l 0xf8400000 0xa00000 0x240000;bootm 0x800000
//! ```
//!
//! Depending on the U-Boot build the copies are done with `cp.l` (length in 32-bit words) or
//! `cp.b` (length in bytes). The commands are parsed into [CopyCommand]s, the two copies
//! matching the legacy layout are replaced, and everything else is kept as it was.

use std::fmt;

use crate::error::ResizeError;
use crate::layout::{self, Region};

/// Where the NOR flash is mapped in the CPU's address space
pub const FLASH_BASE: u64 = 0xf800_0000;

/// Where U-Boot loads the kernel; the initrd goes right after it
pub const KERNEL_LOAD_ADDR: u64 = 0x80_0000;

/// Appended to `bootcmd`: if the new kernel won't boot, try the image in the Kernel_legacy range,
/// which is where QNAP's rescue flow puts a kernel (not knowing about the new layout). It sits at
/// the same distance from the load address as Kernel_legacy does from the start of the Kernel.
pub fn fallback_clause() -> String {
    let addr = KERNEL_LOAD_ADDR + (layout::KERNEL_LEGACY.offset - layout::KERNEL.offset);
    format!("echo {} layout fallback;bootm {addr:#x}", layout::KERNEL_LEGACY.label)
}

/// A flash-to-RAM transfer, independent of how the copy command expresses its length
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub src: u64,
    pub dst: u64,
    pub bytes: u64,
}

impl Transfer {
    /// Loading the whole `kernel` region to the kernel load address
    pub fn kernel(kernel: &Region) -> Self {
        Self {
            src: FLASH_BASE + kernel.offset,
            dst: KERNEL_LOAD_ADDR,
            bytes: kernel.size,
        }
    }

    /// Loading the whole `rootfs` region right after a kernel the size of `kernel`
    pub fn initrd(kernel: &Region, rootfs: &Region) -> Self {
        Self {
            src: FLASH_BASE + rootfs.offset,
            dst: KERNEL_LOAD_ADDR + kernel.size,
            bytes: rootfs.size,
        }
    }
}

/// The copy instruction a `bootcmd` uses; this decides how lengths are written
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CopyWidth {
    /// `cp.l`, counting 32-bit words
    Word,
    /// `cp.b`, counting bytes
    Byte,
}

impl CopyWidth {
    fn from_mnemonic(mnemonic: &str) -> Option<Self> {
        match mnemonic {
            "cp.l" => Some(CopyWidth::Word),
            "cp.b" => Some(CopyWidth::Byte),
            _ => None,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            CopyWidth::Word => "cp.l",
            CopyWidth::Byte => "cp.b",
        }
    }

    fn unit(self) -> u64 {
        match self {
            CopyWidth::Word => 4,
            CopyWidth::Byte => 1,
        }
    }

    /// The (legacy, new) pairs of transfers this migration rewrites
    fn substitutions(self) -> [(Transfer, Transfer); 2] {
        // Same for both widths; only the way the length is counted differs
        [
            (
                Transfer::kernel(&layout::LEGACY_KERNEL),
                Transfer::kernel(&layout::KERNEL),
            ),
            (
                Transfer::initrd(&layout::LEGACY_KERNEL, &layout::LEGACY_ROOTFS1),
                Transfer::initrd(&layout::KERNEL, &layout::ROOTFS1),
            ),
        ]
    }
}

/// One `cp.<width> <src> <dst> <count>` command
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CopyCommand {
    pub width: CopyWidth,
    pub src: u64,
    pub dst: u64,
    pub count: u64,
}

impl CopyCommand {
    /// Parse a single command; anything that isn't a `cp.l`/`cp.b` with three numbers is None.
    pub fn parse(command: &str) -> Option<Self> {
        let mut words = command.split_whitespace();
        let width = CopyWidth::from_mnemonic(words.next()?)?;
        let src = parse_hex(words.next()?)?;
        let dst = parse_hex(words.next()?)?;
        let count = parse_hex(words.next()?)?;
        if words.next().is_some() {
            return None;
        }

        Some(Self {
            width,
            src,
            dst,
            count,
        })
    }

    /// What the command copies, or None if its length doesn't fit in a u64
    pub fn transfer(&self) -> Option<Transfer> {
        Some(Transfer {
            src: self.src,
            dst: self.dst,
            bytes: self.count.checked_mul(self.width.unit())?,
        })
    }

    /// Express `transfer` with a copy of the given width
    pub fn from_transfer(width: CopyWidth, transfer: Transfer) -> Self {
        Self {
            width,
            src: transfer.src,
            dst: transfer.dst,
            count: transfer.bytes / width.unit(),
        }
    }
}

impl fmt::Display for CopyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:#x} {:#x} {:#x}",
            self.width.mnemonic(),
            self.src,
            self.dst,
            self.count
        )
    }
}

/// U-Boot reads numbers as hex, with or without the `0x`
pub(crate) fn parse_hex(word: &str) -> Option<u64> {
    let digits = word
        .strip_prefix("0x")
        .or_else(|| word.strip_prefix("0X"))
        .unwrap_or(word);
    u64::from_str_radix(digits, 16).ok()
}

/// One `;`-separated command of a `bootcmd`, with the whitespace around it kept
#[derive(Debug)]
enum Command<'a> {
    Copy {
        leading: &'a str,
        copy: CopyCommand,
        trailing: &'a str,
    },
    Other(&'a str),
}

impl<'a> Command<'a> {
    fn parse(text: &'a str) -> Self {
        match CopyCommand::parse(text) {
            Some(copy) => {
                let start = text.len() - text.trim_start().len();
                let end = text.trim_end().len();
                Command::Copy {
                    leading: &text[..start],
                    copy,
                    trailing: &text[end..],
                }
            }
            None => Command::Other(text),
        }
    }
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Copy {
                leading,
                copy,
                trailing,
            } => write!(f, "{leading}{copy}{trailing}"),
            Command::Other(text) => f.write_str(text),
        }
    }
}

/// Figure out which copy width `bootcmd` uses. Mixed widths are not a shape we know.
pub fn detect_width(bootcmd: &str) -> Result<CopyWidth, ResizeError> {
    let mut widths = bootcmd.split(';').filter_map(CopyCommand::parse).map(|c| c.width);
    let width = widths.next().ok_or_else(|| {
        ResizeError::UnrecognizedBootcmd(format!("no cp.l or cp.b command in '{bootcmd}'"))
    })?;

    if widths.any(|w| w != width) {
        return Err(ResizeError::UnrecognizedBootcmd(format!(
            "both cp.l and cp.b are used in '{bootcmd}'"
        )));
    }
    Ok(width)
}

/// Produce the new `bootcmd`: both legacy copies rewritten, and the Kernel_legacy fallback
/// appended.
pub fn patch(bootcmd: &str) -> Result<String, ResizeError> {
    let width = detect_width(bootcmd)?;
    let mut commands: Vec<Command> = bootcmd.split(';').map(Command::parse).collect();

    for (legacy, new) in width.substitutions() {
        let found = commands.iter_mut().find_map(|command| match command {
            Command::Copy { copy, .. } if copy.transfer() == Some(legacy) => Some(copy),
            _ => None,
        });

        let Some(copy) = found else {
            return Err(ResizeError::UnrecognizedBootcmd(format!(
                "'{}' not found in '{bootcmd}'",
                CopyCommand::from_transfer(width, legacy)
            )));
        };
        *copy = CopyCommand::from_transfer(width, new);
    }

    let mut patched = commands
        .iter()
        .map(Command::to_string)
        .collect::<Vec<_>>()
        .join(";");
    if !patched.ends_with(';') {
        patched.push(';');
    }
    patched.push_str(&fallback_clause());

    Ok(patched)
}

#[cfg(test)]
const TS219_BOOTCMD: &str =
    "uart1 0x68;cp.l 0xf8200000 0x800000 0x80000;cp.l 0xf8400000 0xa00000 0x240000;bootm 0x800000";

#[test]
fn test_fallback_clause() {
    assert_eq!(
        fallback_clause(),
        "echo Kernel_legacy layout fallback;bootm 0x900000"
    );
}

#[test]
fn test_patch_word_copy() -> anyhow::Result<()> {
    let patched = patch(TS219_BOOTCMD)?;
    assert!(patched.contains(
        "cp.l 0xf8100000 0x800000 0xc0000;cp.l 0xf8400000 0xb00000 0x300000;"
    ));
    assert_eq!(
        patched,
        "uart1 0x68;cp.l 0xf8100000 0x800000 0xc0000;cp.l 0xf8400000 0xb00000 0x300000;\
         bootm 0x800000;echo Kernel_legacy layout fallback;bootm 0x900000"
    );
    Ok(())
}

#[test]
fn test_patch_byte_copy() -> anyhow::Result<()> {
    let bootcmd =
        "uart1 0x68;cp.b 0xf8200000 0x800000 0x200000;cp.b 0xf8400000 0xa00000 0x900000;bootm 0x800000";
    assert_eq!(detect_width(bootcmd)?, CopyWidth::Byte);
    assert_eq!(
        patch(bootcmd)?,
        "uart1 0x68;cp.b 0xf8100000 0x800000 0x300000;cp.b 0xf8400000 0xb00000 0xc00000;\
         bootm 0x800000;echo Kernel_legacy layout fallback;bootm 0x900000"
    );
    Ok(())
}

#[test]
fn test_patch_tolerates_formatting() -> anyhow::Result<()> {
    // Leading zeros and spacing around the separators don't change what the copies do
    let bootcmd =
        "uart1 0x68; cp.l 0xf8200000 0x800000 0x080000; cp.l 0xf8400000 0xa00000 0x240000; bootm 0x800000;";
    assert_eq!(
        patch(bootcmd)?,
        "uart1 0x68; cp.l 0xf8100000 0x800000 0xc0000; cp.l 0xf8400000 0xb00000 0x300000; \
         bootm 0x800000;echo Kernel_legacy layout fallback;bootm 0x900000"
    );
    Ok(())
}

#[test]
fn test_patch_unrecognized() {
    let unrecognized = |bootcmd: &str| {
        matches!(patch(bootcmd), Err(ResizeError::UnrecognizedBootcmd(_)))
    };

    assert!(unrecognized("bootm 0x800000"));
    assert!(unrecognized(
        "cp.l 0xf8200000 0x800000 0x80000;cp.b 0xf8400000 0xa00000 0x900000;bootm 0x800000"
    ));
    // Already pointing at the new layout
    assert!(unrecognized(
        "cp.l 0xf8100000 0x800000 0xc0000;cp.l 0xf8400000 0xb00000 0x300000;bootm 0x800000"
    ));
    // Initrd copy missing
    assert!(unrecognized("cp.l 0xf8200000 0x800000 0x80000;bootm 0x800000"));
}

#[test]
fn test_copy_parse() {
    let copy = CopyCommand::parse(" cp.l f8200000 0x800000 0x80000 ").unwrap();
    assert_eq!(copy.width, CopyWidth::Word);
    assert_eq!(copy.transfer(), Some(Transfer::kernel(&layout::LEGACY_KERNEL)));
    assert_eq!(copy.to_string(), "cp.l 0xf8200000 0x800000 0x80000");

    assert!(CopyCommand::parse("cp.w 0xf8200000 0x800000 0x100000").is_none());
    assert!(CopyCommand::parse("cp.l 0xf8200000 0x800000").is_none());
    assert!(CopyCommand::parse("cp.l 0xf8200000 0x800000 0x80000 0x1").is_none());
}

#[test]
fn test_patch_huge_count() -> anyhow::Result<()> {
    // A word count whose byte length overflows is just another copy we don't touch
    let copy = CopyCommand::parse("cp.l 0 0 0x4000000000000000").unwrap();
    assert_eq!(copy.transfer(), None);

    let patched = patch(&format!("cp.l 0 0 0x4000000000000000;{TS219_BOOTCMD}"))?;
    assert!(patched.starts_with(
        "cp.l 0x0 0x0 0x4000000000000000;uart1 0x68;cp.l 0xf8100000 0x800000 0xc0000;"
    ));
    Ok(())
}
