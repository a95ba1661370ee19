//! Raw partition access over the Linux MTD character devices (`/dev/mtdX`)

use anyhow::{ensure, Context};

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::mem::MaybeUninit;
use std::ops::Range;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::{Path, PathBuf};

use crate::util::ReadExt;

/// An open `/dev/mtdX` partition
#[derive(Debug)]
pub struct MtdDevice {
    file: File,
    path: PathBuf,
    size: u64,
    erase_size: u64,
}

impl MtdDevice {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd1")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| path.display().to_string())?;

        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())
                .with_context(|| format!("MEMGETINFO on {}", path.display()))?;
            info.assume_init()
        };
        ensure!(
            info.erasesize != 0 && info.size % info.erasesize == 0,
            "{}: size {:#x} not a multiple of erasesize {:#x}",
            path.display(),
            info.size,
            info.erasesize
        );

        Ok(Self {
            file,
            path: path.to_owned(),
            size: info.size.into(),
            erase_size: info.erasesize.into(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the partition from its start, up to `len` bytes (less if the partition is smaller)
    pub fn read(&self, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;

        let mut buf = Vec::with_capacity(len);
        file.read_to_vec(&mut buf, len)
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(buf)
    }

    /// Write `data` at the start of the partition, then read it back to verify.
    ///
    /// Only the erase blocks that `data` covers are touched, and blocks that already hold the
    /// right content are skipped. Anything past the end of `data` is left as it was.
    pub fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        ensure!(
            data.len() as u64 <= self.size,
            "{} bytes don't fit in {} ({:#x} bytes)",
            data.len(),
            self.path.display(),
            self.size
        );

        let mut block = vec![0u8; self.erase_size as usize];
        for range in erase_blocks(data.len(), self.erase_size) {
            let content = &data[range.start as usize..range.end as usize];

            self.file.read_exact_at(&mut block, range.start)?;
            if !overlay_block(&mut block, content) {
                continue;
            }

            let erase_info = ioctl::erase_info_user {
                start: range.start as u32,
                length: self.erase_size as u32,
            };
            unsafe {
                ioctl::memerase(self.file.as_raw_fd(), &erase_info).with_context(|| {
                    format!("erasing {:#x} of {}", range.start, self.path.display())
                })?;
            }
            self.file.write_all_at(&block, range.start)?;
        }

        let written = self.read(data.len())?;
        ensure!(
            written == data,
            "{}: content read back does not match what was written",
            self.path.display()
        );

        Ok(())
    }
}

/// Split the first `len` bytes of a partition into erase-block-sized ranges (the last one may be
/// short)
fn erase_blocks(len: usize, erase_size: u64) -> impl Iterator<Item = Range<u64>> {
    let len = len as u64;
    (0..len)
        .step_by(erase_size as usize)
        .map(move |start| start..std::cmp::min(len, start + erase_size))
}

/// Put `content` over the start of an erase block's current content. False if the block
/// already holds it, i.e. there is nothing to erase.
fn overlay_block(block: &mut [u8], content: &[u8]) -> bool {
    let head = &mut block[..content.len()];
    if head == content {
        return false;
    }
    head.copy_from_slice(content);
    true
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);
}

#[test]
fn test_erase_blocks() {
    let blocks: Vec<_> = erase_blocks(0x50000, 0x40000).collect();
    assert_eq!(blocks, [0..0x40000, 0x40000..0x50000]);

    assert_eq!(erase_blocks(0, 0x40000).count(), 0);
    assert_eq!(erase_blocks(0x100000, 0x40000).count(), 4);
}

#[test]
fn test_overlay_block() {
    // A short last block keeps whatever followed the new content
    let mut block = [0xAA; 8];
    assert!(overlay_block(&mut block, &[1, 2, 3]));
    assert_eq!(block, [1, 2, 3, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]);

    assert!(!overlay_block(&mut block, &[1, 2, 3]));
    assert!(!overlay_block(&mut block, &[]));
}
