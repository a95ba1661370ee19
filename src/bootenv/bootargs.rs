//! Rewriting `bootargs`: the initrd location moves, and the kernel is told about the new
//! partitions.

use super::bootcmd::{parse_hex, Transfer};
use crate::error::ResizeError;
use crate::layout;

/// Debian builds `cmdlinepart` as a module, which only sees parameters prefixed with its name.
/// A kernel with the parser built in wants the bare `mtdparts=`. Both are always passed.
pub const MTDPARTS_PARAMS: [&str; 2] = ["cmdlinepart.mtdparts", "mtdparts"];

/// An `initrd=<addr>,<size>` kernel parameter
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Initrd {
    addr: u64,
    size: u64,
}

impl Initrd {
    fn parse(word: &str) -> Option<Self> {
        let (addr, size) = word.strip_prefix("initrd=")?.split_once(',')?;
        Some(Self {
            addr: parse_hex(addr)?,
            size: parse_hex(size)?,
        })
    }

    fn from_transfer(transfer: Transfer) -> Self {
        Self {
            addr: transfer.dst,
            size: transfer.bytes,
        }
    }
}

impl std::fmt::Display for Initrd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "initrd={:#x},{:#x}", self.addr, self.size)
    }
}

/// Produce the new `bootargs` for partitions on the `master` flash device.
///
/// The `initrd=` parameter has to describe exactly the legacy initrd; it is replaced in place.
/// The `mtdparts` descriptor is then appended once per parameter name in [MTDPARTS_PARAMS],
/// quoted since partition labels contain spaces.
pub fn patch(bootargs: &str, master: &str) -> Result<String, ResizeError> {
    let legacy = Initrd::from_transfer(Transfer::initrd(
        &layout::LEGACY_KERNEL,
        &layout::LEGACY_ROOTFS1,
    ));
    let new = Initrd::from_transfer(Transfer::initrd(&layout::KERNEL, &layout::ROOTFS1));

    // Split on single spaces so joining back gives the original spacing
    let mut words: Vec<String> = bootargs.split(' ').map(str::to_owned).collect();
    let Some(word) = words
        .iter_mut()
        .find(|word| Initrd::parse(word.trim()) == Some(legacy))
    else {
        return Err(ResizeError::UnrecognizedBootargs(format!(
            "'{legacy}' not found in '{bootargs}'"
        )));
    };
    *word = new.to_string();

    let mut patched = words.join(" ");

    let mtdparts = layout::mtdparts(master);
    for param in MTDPARTS_PARAMS {
        patched.push_str(&format!(" {param}=\"{mtdparts}\""));
    }

    Ok(patched)
}

#[cfg(test)]
const TS219_BOOTARGS: &str = "console=ttyS0,115200 root=/dev/ram initrd=0xa00000,0x900000 ramdisk=32768";

#[test]
fn test_patch() -> anyhow::Result<()> {
    let patched = patch(TS219_BOOTARGS, "spi0.0")?;
    let mtdparts = layout::mtdparts("spi0.0");

    assert!(patched
        .starts_with("console=ttyS0,115200 root=/dev/ram initrd=0xb00000,0xc00000 ramdisk=32768 "));
    assert!(!patched.contains("initrd=0xa00000"));

    // The same descriptor, once under each name
    assert_eq!(patched.matches(&mtdparts).count(), 2);
    assert!(patched.contains(&format!(" cmdlinepart.mtdparts=\"{mtdparts}\"")));
    assert!(patched.ends_with(&format!(" mtdparts=\"{mtdparts}\"")));
    Ok(())
}

#[test]
fn test_patch_leading_zeros() -> anyhow::Result<()> {
    let patched = patch("root=/dev/ram initrd=0x00a00000,0x00900000", "spi0.0")?;
    assert!(patched.starts_with("root=/dev/ram initrd=0xb00000,0xc00000 "));
    Ok(())
}

#[test]
fn test_patch_unrecognized() {
    for bootargs in [
        "console=ttyS0,115200 root=/dev/ram",
        "console=ttyS0,115200 root=/dev/ram initrd=0xb00000,0xc00000",
        "console=ttyS0,115200 initrd=0xa00000,0x400000",
    ] {
        assert!(matches!(
            patch(bootargs, "spi0.0"),
            Err(ResizeError::UnrecognizedBootargs(_))
        ));
    }
}

#[test]
fn test_patch_only_the_initrd_parameter() -> anyhow::Result<()> {
    // Another parameter ending in the same text is not the kernel's initrd=
    let patched = patch(
        "foo.initrd=0xa00000,0x900000  initrd=0xa00000,0x900000",
        "spi0.0",
    )?;
    assert!(patched.starts_with("foo.initrd=0xa00000,0x900000  initrd=0xb00000,0xc00000 "));
    Ok(())
}
