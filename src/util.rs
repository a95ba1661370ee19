//! Small helpers that don't really belong anywhere else.

use std::fmt;
use std::io::{self, Read};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

pub trait ReadExt {
    /// Reads up to `read_len` bytes onto the end of `vec`, stopping early (without error) at EOF.
    ///
    /// MTD character devices report EOF at the end of the partition, so this is how a whole
    /// partition, or a prefix of it, is read without knowing its exact size up front.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        // One erase block on the SPI NOR these boards use
        const CHUNK_SIZE: usize = 65536;

        let end = vec.len() + read_len;
        let mut cursor = vec.len();
        while cursor < end {
            vec.resize(std::cmp::min(end, cursor + CHUNK_SIZE), 0u8);

            cursor += match self.read(&mut vec[cursor..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => {
                    vec.truncate(cursor);
                    return Err(e);
                }
            };
        }

        vec.truncate(cursor);
        Ok(())
    }
}

/// Displays a byte count the way a human would say it: `512 KiB`, `3 MiB`, `1300 bytes`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Size(pub u64);

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "0 bytes"),
            n if n % MIB == 0 => write!(f, "{} MiB", n / MIB),
            n if n % KIB == 0 => write!(f, "{} KiB", n / KIB),
            n => write!(f, "{n} bytes"),
        }
    }
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 1, 2, 3]);

    let mut big = Vec::new();
    io::repeat(0x55).read_to_vec(&mut big, 3 * 65536 + 7)?;
    assert_eq!(big.len(), 3 * 65536 + 7);
    Ok(())
}

#[test]
fn test_size_display() {
    assert_eq!(Size(512 * KIB).to_string(), "512 KiB");
    assert_eq!(Size(1280 * KIB).to_string(), "1280 KiB");
    assert_eq!(Size(12 * MIB).to_string(), "12 MiB");
    assert_eq!(Size(1300).to_string(), "1300 bytes");
}
