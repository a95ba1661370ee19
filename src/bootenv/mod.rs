//! The U-Boot environment: reading it, patching it, and writing the script `fw_setenv` applies.
//!
//! Debian has shipped two incompatible `fw_setenv` implementations. The one from `u-boot-tools`
//! (Buster) reads scripts as `name value`, while `libubootenv-tool` (Bullseye onwards) wants
//! `name=value` and happily stores a variable named after the whole line if given the other
//! form. A wrongly-formatted script leaves the board unbootable, so the syntax is never guessed.

pub mod bootargs;
pub mod bootcmd;

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

use crate::error::ResizeError;

/// The suffix of the variables that keep the original values around for manual recovery
pub const BACKUP_SUFFIX: &str = "_backup";

/// A snapshot of the U-Boot environment variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Parse the output of `fw_printenv`: one `name=value` per line. Lines that don't look like
    /// that (warnings about a bad CRC, blank lines) are skipped.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let re = Regex::new(r"^([a-zA-Z_0-9]+)=(.*)$")?;

        let vars = text
            .lines()
            .filter_map(|line| re.captures(line.trim()))
            .map(|caps| (caps[1].to_owned(), caps[2].to_owned()))
            .collect();

        Ok(Self { vars })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Get a variable the migration can't do without
    pub fn require(&self, name: &'static str) -> Result<&str, ResizeError> {
        self.get(name).ok_or(ResizeError::MissingVariable(name))
    }
}

/// Which script syntax the installed `fw_setenv` understands
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EnvDialect {
    /// `name=value` (libubootenv)
    Equals,
    /// `name value` (u-boot-tools)
    Space,
}

impl EnvDialect {
    /// Classify one tool from its `--help` output.
    ///
    /// Only libubootenv knows `--defenv`, and only u-boot-tools knows `--lock`.
    pub fn detect(help: &str) -> Option<Self> {
        if help.contains("--defenv") {
            Some(EnvDialect::Equals)
        } else if help.contains("--lock") {
            Some(EnvDialect::Space)
        } else {
            None
        }
    }

    /// Classify the installed tool pair from the help output of `fw_printenv` and `fw_setenv`.
    /// Both have to be recognized, and they have to come from the same implementation.
    pub fn detect_pair(printenv_help: &str, setenv_help: &str) -> Result<Self, ResizeError> {
        let classify = |tool: &str, help: &str| {
            Self::detect(help).ok_or_else(|| {
                ResizeError::EnvToolDialect(format!(
                    "{tool} mentions neither --defenv nor --lock in its help"
                ))
            })
        };

        let printenv = classify("fw_printenv", printenv_help)?;
        let setenv = classify("fw_setenv", setenv_help)?;
        if printenv != setenv {
            return Err(ResizeError::EnvToolDialect(format!(
                "fw_printenv looks like {printenv:?} but fw_setenv looks like {setenv:?}"
            )));
        }
        Ok(setenv)
    }

    fn separator(self) -> char {
        match self {
            EnvDialect::Equals => '=',
            EnvDialect::Space => ' ',
        }
    }
}

/// The geometry of the environment inside the 'U-Boot Config' partition, written out as the
/// `fw_env.config` that both tools are pointed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvDeviceConfig {
    pub device: String,
    pub offset: u32,
    pub env_size: u32,
    pub sector_size: u32,
    pub sectors: u32,
}

impl EnvDeviceConfig {
    /// The environment as QNAP's U-Boot stores it: 4 KiB at the start of a single 256 KiB
    /// sector of `device` (e.g. `/dev/mtd4`)
    pub fn qnap(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            offset: 0,
            env_size: 0x1000,
            sector_size: 0x40000,
            sectors: 1,
        }
    }
}

impl fmt::Display for EnvDeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "# MTD device name       Device offset   Env. size       Flash sector size       Number of sectors"
        )?;
        writeln!(
            f,
            "{}                 {:#06x}          {:#x}           {:#x}                 {}",
            self.device, self.offset, self.env_size, self.sector_size, self.sectors
        )
    }
}

/// Which of the two variables get patched. A skipped patch has to be replaced by a script
/// fragment written by hand.
#[derive(Debug, Clone, Default)]
pub struct PatchSelection {
    pub skip_bootcmd: bool,
    pub skip_bootargs: bool,
    pub fragment: Option<String>,
}

impl PatchSelection {
    /// Refuse a skip with nothing to replace it: the board would not boot the new layout.
    pub fn validate(&self) -> Result<(), ResizeError> {
        if self.fragment.is_none() {
            if self.skip_bootcmd {
                return Err(ResizeError::SkipWithoutFragment("bootcmd"));
            }
            if self.skip_bootargs {
                return Err(ResizeError::SkipWithoutFragment("bootargs"));
            }
        }
        Ok(())
    }
}

/// The `fw_setenv -s` script, accumulated one variable at a time
#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    dialect: EnvDialect,
    text: String,
}

impl ScriptBuilder {
    pub fn new(dialect: EnvDialect) -> Self {
        Self {
            dialect,
            text: String::new(),
        }
    }

    /// Append `name` set to `value`
    pub fn set(mut self, name: &str, value: &str) -> Self {
        self.text.push_str(name);
        self.text.push(self.dialect.separator());
        self.text.push_str(value);
        self.text.push('\n');
        self
    }

    /// Save the current value of `name` under `<name>_backup`
    pub fn backup(self, name: &str, value: &str) -> Self {
        self.set(&format!("{name}{BACKUP_SUFFIX}"), value)
    }

    /// Append hand-written script lines verbatim
    pub fn fragment(mut self, fragment: &str) -> Self {
        let fragment = fragment.trim_end_matches(['\n', '\r']);
        if !fragment.is_empty() {
            self.text.push_str(fragment);
            self.text.push('\n');
        }
        self
    }

    pub fn build(self) -> String {
        self.text
    }
}

/// Old and new values of the two patched variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootVars {
    pub bootcmd: String,
    pub bootargs: String,
}

/// Write the script that applies `new` over `old`: backups first, then the new values (unless
/// skipped), then the operator's fragment.
pub fn build_script(
    dialect: EnvDialect,
    old: &BootVars,
    new: &BootVars,
    selection: &PatchSelection,
) -> Result<String, ResizeError> {
    selection.validate()?;

    let mut script = ScriptBuilder::new(dialect)
        .backup("bootargs", &old.bootargs)
        .backup("bootcmd", &old.bootcmd);
    if !selection.skip_bootargs {
        script = script.set("bootargs", &new.bootargs);
    }
    if !selection.skip_bootcmd {
        script = script.set("bootcmd", &new.bootcmd);
    }
    if let Some(fragment) = &selection.fragment {
        script = script.fragment(fragment);
    }

    Ok(script.build())
}

#[cfg(test)]
pub(crate) const PRINTENV: &str = "\
baudrate=115200
bootargs=console=ttyS0,115200 root=/dev/ram initrd=0xa00000,0x900000 ramdisk=32768
bootcmd=uart1 0x68;cp.l 0xf8200000 0x800000 0x80000;cp.l 0xf8400000 0xa00000 0x240000;bootm 0x800000
bootdelay=1
";

#[cfg(test)]
fn test_vars() -> (BootVars, BootVars) {
    let old = BootVars {
        bootcmd: "bootm 0x800000".into(),
        bootargs: "console=ttyS0,115200".into(),
    };
    let new = BootVars {
        bootcmd: "bootm 0x800000;bootm 0x900000".into(),
        bootargs: "console=ttyS0,115200 mtdparts=x".into(),
    };
    (old, new)
}

#[test]
fn test_parse_environment() -> anyhow::Result<()> {
    let text = format!("Warning: Bad CRC, using default environment\n{PRINTENV}");
    let env = Environment::parse(&text)?;
    assert_eq!(env.get("bootdelay"), Some("1"));
    assert!(env.require("bootcmd")?.starts_with("uart1 0x68;"));
    assert!(matches!(
        env.require("bootfile"),
        Err(ResizeError::MissingVariable("bootfile"))
    ));
    Ok(())
}

#[test]
fn test_detect_dialect() {
    let libubootenv = "Usage fw_printenv [OPTION]\n -c, --config  configuration file\n -f, --defenv  default environment\n";
    let uboot_tools = "Usage: fw_printenv [OPTIONS]... [VARIABLE]...\n -l, --lock  lock node\n";

    assert_eq!(EnvDialect::detect(libubootenv), Some(EnvDialect::Equals));
    assert_eq!(EnvDialect::detect(uboot_tools), Some(EnvDialect::Space));
    assert_eq!(EnvDialect::detect("fw_printenv 1.0"), None);

    assert_eq!(
        EnvDialect::detect_pair(libubootenv, libubootenv).ok(),
        Some(EnvDialect::Equals)
    );
    assert_eq!(
        EnvDialect::detect_pair(uboot_tools, uboot_tools).ok(),
        Some(EnvDialect::Space)
    );
    assert!(matches!(
        EnvDialect::detect_pair(libubootenv, uboot_tools),
        Err(ResizeError::EnvToolDialect(_))
    ));
    assert!(matches!(
        EnvDialect::detect_pair("", ""),
        Err(ResizeError::EnvToolDialect(_))
    ));
}

#[test]
fn test_env_config() {
    let config = EnvDeviceConfig::qnap("/dev/mtd4");
    let text = config.to_string();
    let line = text.lines().nth(1).unwrap();
    let fields: Vec<_> = line.split_whitespace().collect();
    assert_eq!(fields, ["/dev/mtd4", "0x0000", "0x1000", "0x40000", "1"]);
}

#[test]
fn test_script_equals() -> anyhow::Result<()> {
    let (old, new) = test_vars();
    let script = build_script(EnvDialect::Equals, &old, &new, &Default::default())?;
    assert_eq!(
        script,
        "bootargs_backup=console=ttyS0,115200\n\
         bootcmd_backup=bootm 0x800000\n\
         bootargs=console=ttyS0,115200 mtdparts=x\n\
         bootcmd=bootm 0x800000;bootm 0x900000\n"
    );
    Ok(())
}

#[test]
fn test_script_space() -> anyhow::Result<()> {
    let (old, new) = test_vars();
    let script = build_script(EnvDialect::Space, &old, &new, &Default::default())?;
    assert_eq!(
        script.lines().next(),
        Some("bootargs_backup console=ttyS0,115200")
    );
    assert_eq!(
        script.lines().last(),
        Some("bootcmd bootm 0x800000;bootm 0x900000")
    );
    Ok(())
}

#[test]
fn test_script_skip() -> anyhow::Result<()> {
    let (old, new) = test_vars();

    let selection = PatchSelection {
        skip_bootcmd: true,
        ..Default::default()
    };
    assert!(matches!(
        build_script(EnvDialect::Equals, &old, &new, &selection),
        Err(ResizeError::SkipWithoutFragment("bootcmd"))
    ));

    let selection = PatchSelection {
        skip_bootcmd: true,
        skip_bootargs: false,
        fragment: Some("bootcmd=run my_boot\n\n".into()),
    };
    let script = build_script(EnvDialect::Equals, &old, &new, &selection)?;
    let lines: Vec<_> = script.lines().collect();
    assert_eq!(
        lines,
        [
            "bootargs_backup=console=ttyS0,115200",
            "bootcmd_backup=bootm 0x800000",
            "bootargs=console=ttyS0,115200 mtdparts=x",
            "bootcmd=run my_boot",
        ]
    );
    Ok(())
}
