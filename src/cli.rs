use crate::config::DriverConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;

/// Flags accepted by the host-simulator binary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<String>,
    script: Option<String>,
    watch: Option<bool>,
    frames: Option<u64>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            if !flag.starts_with("--") {
                bail!("Unexpected argument '{flag}'. Use --config/--script/--watch/--frames with values.");
            }
            let key = &flag[2..];
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => {
                    overrides.config = Some(value);
                }
                "script" => {
                    overrides.script = Some(value);
                }
                "watch" => {
                    overrides.watch = Some(parse_bool_flag("watch", &value)?);
                }
                "frames" => {
                    overrides.frames =
                        Some(value.parse::<u64>().with_context(|| format!("Invalid frame count '{value}'"))?);
                }
                _ => bail!("Unknown flag '{flag}'. Supported flags: --config, --script, --watch, --frames."),
            }
        }
        Ok(overrides)
    }

    pub fn config_path(&self) -> &str {
        self.config.as_deref().unwrap_or("driver.json")
    }

    pub fn frames(&self) -> u64 {
        self.frames.unwrap_or(300)
    }

    pub fn into_config_overrides(self) -> DriverConfigOverrides {
        DriverConfigOverrides { script: self.script, watch: self.watch }
    }

    #[cfg(test)]
    fn as_tuple(&self) -> (Option<&str>, Option<&str>, Option<bool>, Option<u64>) {
        (self.config.as_deref(), self.script.as_deref(), self.watch, self.frames)
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}
