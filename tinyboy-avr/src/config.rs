use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    firmware::FlashImage,
    pins::{tinyboy_wiring, Button, WiringTable},
};

fn default_pulse_width() -> u32 {
    1
}

fn default_lines() -> u32 {
    Button::ALL.len() as u32
}

/// Describes the firmware under test and the board it runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// The directory containing the config file. Used for reading other files relative to the
    /// config path.
    #[serde(skip)]
    pub path: PathBuf,

    /// The firmware image, either Intel HEX or a raw binary.
    pub firmware: PathBuf,

    /// Connects pin labels to the button they are wired to.
    #[serde(default = "tinyboy_wiring")]
    pub wiring: WiringTable,

    /// The number of clock cycles a single button pulse is held for.
    #[serde(default = "default_pulse_width")]
    pub pulse_width: u32,

    /// The number of input lines that a pulse can be assigned to.
    #[serde(default = "default_lines")]
    pub lines: u32,

    /// The maximum number of clock cycles a single input may execute for, in addition to the limit
    /// imposed by the length of the input.
    #[serde(default)]
    pub cycle_limit: Option<u64>,
}

impl FirmwareConfig {
    /// Create a config for a firmware image with default settings.
    pub fn for_firmware(firmware: PathBuf) -> Self {
        Self {
            path: PathBuf::from("."),
            firmware,
            wiring: tinyboy_wiring(),
            pulse_width: default_pulse_width(),
            lines: default_lines(),
            cycle_limit: None,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_path = std::env::var_os("TARGET_CONFIG")
            .ok_or_else(|| anyhow::format_err!("TARGET_CONFIG not set"))?;
        Self::from_path(config_path.as_ref())
    }

    pub fn from_path(target: &Path) -> anyhow::Result<Self> {
        // Allow a bare firmware image to be used directly with the default board settings.
        if target.extension().map_or(false, |x| x == "hex" || x == "ihex" || x == "bin") {
            let mut config = Self::for_firmware(target.to_owned());
            config.apply_env_overrides()?;
            return Ok(config);
        }

        // Otherwise expect either a path to a config file or to a folder containing `config.yml`.
        let (root, config_path) = match target.extension().map_or(false, |x| x == "yml") {
            true => {
                let root = target.parent().unwrap_or(Path::new(".")).to_owned();
                (root, target.to_owned())
            }
            false => (target.to_owned(), target.join("config.yml")),
        };

        let mut config: Self = serde_yaml::from_slice(
            &std::fs::read(&config_path)
                .with_context(|| format!("failed to read '{}'", config_path.display()))?,
        )
        .with_context(|| format!("error parsing: {}", config_path.display()))?;
        config.path = root;
        config.apply_env_overrides()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Some(limit) = get_u64_env("CYCLE_LIMIT")? {
            self.cycle_limit = Some(limit);
        }
        if let Some(width) = get_u64_env("PULSE_WIDTH")? {
            self.pulse_width =
                width.try_into().map_err(|_| anyhow::format_err!("PULSE_WIDTH too large"))?;
        }
        self.validate()
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.pulse_width > 0, "pulse_width must be non-zero");
        anyhow::ensure!(
            self.lines > 0 && self.lines <= default_lines(),
            "lines must be between 1 and {}",
            default_lines()
        );
        for (label, button) in &self.wiring {
            anyhow::ensure!(
                button.line() < self.lines as u8,
                "pin {label} is wired to {button:?}, which is not one of the {} input lines",
                self.lines
            );
        }
        Ok(())
    }

    /// The firmware path, resolved relative to the config file.
    pub fn firmware_path(&self) -> PathBuf {
        self.path.join(&self.firmware)
    }

    pub fn load_firmware(&self) -> anyhow::Result<FlashImage> {
        FlashImage::from_path(&self.firmware_path())
    }
}

/// Parse an integer with an optional `0x`, `0o` or `0b` prefix.
pub fn parse_u64_with_prefix(value: &str) -> Option<u64> {
    let value = value.trim().replace('_', "");
    let (digits, radix) = match value.get(..2) {
        Some("0x" | "0X") => (&value[2..], 16),
        Some("0o" | "0O") => (&value[2..], 8),
        Some("0b" | "0B") => (&value[2..], 2),
        _ => (&value[..], 10),
    };
    u64::from_str_radix(digits, radix).ok()
}

pub fn get_u64_env(name: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var_os(name) {
        Some(value) => Ok(Some(
            value
                .to_str()
                .and_then(parse_u64_with_prefix)
                .ok_or_else(|| anyhow::format_err!("Invalid value for {name}"))?,
        )),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_yaml_with_defaults() {
        let config: FirmwareConfig = serde_yaml::from_str("firmware: game.hex\n").unwrap();
        assert_eq!(config.firmware, PathBuf::from("game.hex"));
        assert_eq!(config.wiring, tinyboy_wiring());
        assert_eq!(config.pulse_width, 1);
        assert_eq!(config.lines, 4);
        assert_eq!(config.cycle_limit, None);
        config.validate().unwrap();
    }

    #[test]
    fn custom_wiring() {
        let yaml = "
firmware: game.bin
pulse_width: 100
lines: 2
wiring:
  PD2: up
  PD3: down
";
        let config: FirmwareConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.wiring.get("PD3"), Some(&Button::Down));
        assert_eq!(config.wiring.len(), 2);
        config.validate().unwrap();

        let bad: FirmwareConfig =
            serde_yaml::from_str("firmware: a.hex\nlines: 1\nwiring: { PB1: left }\n").unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn integer_prefixes() {
        assert_eq!(parse_u64_with_prefix("0x10"), Some(16));
        assert_eq!(parse_u64_with_prefix("0b101"), Some(5));
        assert_eq!(parse_u64_with_prefix("1_000"), Some(1000));
        assert_eq!(parse_u64_with_prefix("ten"), None);
    }
}
