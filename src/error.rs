//! The failures that the migration classifies for the operator.
//!
//! Everything else travels as a plain `anyhow::Error`; these are the cases where the binary needs
//! to know *what kind* of failure happened, both for the exit status and for the guidance it
//! prints (a failure after the point of no return is very different from a refused precondition).

use thiserror::Error;

/// How far the run got when a failure happened, and therefore how dangerous it is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Category {
    /// Nothing was touched; the device is not (or no longer) in a state we know how to migrate.
    Precondition,

    /// The bootloader environment has a shape we don't know how to patch.
    PatternMismatch,

    /// The 'NAS Config' filesystem could not be checked or shrunk. No flash writes happened.
    FilesystemRepair,

    /// The operator said no.
    Declined,

    /// A write failed past the point of no return. Flash content is in an unknown state.
    Mutation,
}

#[derive(Error, Debug)]
pub enum ResizeError {
    #[error("this is not a supported QNAP device: {0}")]
    UnsupportedModel(String),

    #[error("no MTD partition labelled {0}")]
    PartitionNotFound(String),

    #[error("'{label}' ({device}) is {actual:#x} bytes, expected {expected:#x}: has it already been resized?")]
    AlreadyResized {
        label: &'static str,
        device: String,
        actual: u64,
        expected: u64,
    },

    #[error("no 'Creating N MTD partitions on \"...\"' line found in the kernel log")]
    MasterDeviceNotFound,

    #[error("missing '{0}' in the U-Boot environment")]
    MissingVariable(&'static str),

    #[error("required tool '{0}' was not found")]
    MissingTool(String),

    #[error("cannot tell which script syntax fw_setenv expects: {0}")]
    EnvToolDialect(String),

    #[error("must be run as root")]
    NotRoot,

    #[error("skipping the {0} patch requires an --env-fragment replacement")]
    SkipWithoutFragment(&'static str),

    #[error("don't know how to patch bootcmd: {0}")]
    UnrecognizedBootcmd(String),

    #[error("don't know how to patch bootargs: {0}")]
    UnrecognizedBootargs(String),

    #[error("'NAS Config' resize not possible automatically: {0}")]
    FilesystemRepair(String),

    #[error("aborted by the operator")]
    Declined,

    #[error("{step} failed")]
    Mutation {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl ResizeError {
    pub fn category(&self) -> Category {
        match self {
            ResizeError::UnrecognizedBootcmd(_) | ResizeError::UnrecognizedBootargs(_) => {
                Category::PatternMismatch
            }
            ResizeError::FilesystemRepair(_) => Category::FilesystemRepair,
            ResizeError::Declined => Category::Declined,
            ResizeError::Mutation { .. } => Category::Mutation,
            _ => Category::Precondition,
        }
    }

    /// Process exit status for this failure. Always non-zero.
    pub fn exit_code(&self) -> u8 {
        match self.category() {
            Category::Precondition => 2,
            Category::PatternMismatch => 3,
            Category::FilesystemRepair => 4,
            Category::Declined => 5,
            Category::Mutation => 6,
        }
    }
}

#[test]
fn test_categories() {
    let mismatch = ResizeError::UnrecognizedBootcmd("bootm 0x800000".into());
    assert_eq!(mismatch.category(), Category::PatternMismatch);

    let resized = ResizeError::AlreadyResized {
        label: "Kernel",
        device: "mtd1".into(),
        actual: 0x300000,
        expected: 0x200000,
    };
    assert_eq!(resized.category(), Category::Precondition);
    assert!(resized.to_string().contains("0x300000"));

    let mutation = ResizeError::Mutation {
        step: "Committing U-Boot environment",
        source: anyhow::anyhow!("fw_setenv exited with status 1"),
    };
    assert_eq!(mutation.category(), Category::Mutation);
    assert_ne!(mutation.exit_code(), 0);
}
