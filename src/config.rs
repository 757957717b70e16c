use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Per-device identity and the property values populated at activation.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "DeviceConfig::default_serial_number")]
    pub serial_number: String,
    #[serde(default = "DeviceConfig::default_model_number")]
    pub model_number: String,
    #[serde(default = "DeviceConfig::default_user_ipd_meters")]
    pub user_ipd_meters: f64,
    #[serde(default = "DeviceConfig::default_head_to_eye_depth_meters")]
    pub head_to_eye_depth_meters: f64,
    #[serde(default = "DeviceConfig::default_display_frequency")]
    pub display_frequency: f64,
    #[serde(default = "DeviceConfig::default_seconds_from_vsync_to_photons")]
    pub seconds_from_vsync_to_photons: f64,
    #[serde(default = "DeviceConfig::default_universe_id")]
    pub universe_id: u64,
}

impl DeviceConfig {
    fn default_serial_number() -> String {
        "SN00000001".to_string()
    }

    fn default_model_number() -> String {
        "v1.hmd.merlin.dev".to_string()
    }

    const fn default_user_ipd_meters() -> f64 {
        0.063
    }

    const fn default_head_to_eye_depth_meters() -> f64 {
        0.0
    }

    const fn default_display_frequency() -> f64 {
        60.0
    }

    const fn default_seconds_from_vsync_to_photons() -> f64 {
        0.1
    }

    const fn default_universe_id() -> u64 {
        2
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial_number: Self::default_serial_number(),
            model_number: Self::default_model_number(),
            user_ipd_meters: Self::default_user_ipd_meters(),
            head_to_eye_depth_meters: Self::default_head_to_eye_depth_meters(),
            display_frequency: Self::default_display_frequency(),
            seconds_from_vsync_to_photons: Self::default_seconds_from_vsync_to_photons(),
            universe_id: Self::default_universe_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    #[serde(default = "ScriptConfig::default_path")]
    pub path: String,
    /// Reload automatically when the script file changes on disk.
    #[serde(default = "ScriptConfig::default_watch")]
    pub watch: bool,
    /// Per-callback operation budget; 0 disables the limit.
    #[serde(default = "ScriptConfig::default_ops_budget")]
    pub ops_budget: u64,
}

impl ScriptConfig {
    fn default_path() -> String {
        "scripts/driver.rhai".to_string()
    }

    const fn default_watch() -> bool {
        true
    }

    const fn default_ops_budget() -> u64 {
        500_000
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            watch: Self::default_watch(),
            ops_budget: Self::default_ops_budget(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "WatchdogConfig::default_interval_ms")]
    pub interval_ms: u64,
}

impl WatchdogConfig {
    const fn default_interval_ms() -> u64 {
        500
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { interval_ms: Self::default_interval_ms() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DriverConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub script: ScriptConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Clone, Default)]
pub struct DriverConfigOverrides {
    pub script: Option<String>,
    pub watch: Option<bool>,
}

impl DriverConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Load a config file, falling back to defaults. A missing file is the
    /// normal zero-config case; a malformed one is reported.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &DriverConfigOverrides) {
        if let Some(script) = &overrides.script {
            self.script.path = script.clone();
        }
        if let Some(watch) = overrides.watch {
            self.script.watch = watch;
        }
    }
}

impl DriverConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.script.is_none() && self.watch.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.script.is_some() {
            fields.push("script");
        }
        if self.watch.is_some() {
            fields.push("watch");
        }
        fields
    }
}
