use log::{info, warn};

use crate::config::DriverConfig;
use crate::driver::ScriptedHmdDriver;
use crate::host::{DeviceClass, HostServices};
use crate::peripheral::PeripheralDiscovery;
use crate::watchdog::WatchdogDriver;

/// Server-side device provider: owns the scripted HMD and announces it to
/// the host at init. Thin glue over the facade; the host talks to the
/// device itself through [`crate::host::TrackedDeviceDriver`].
pub struct ServerDriver {
    hmd: ScriptedHmdDriver,
    announced: bool,
}

impl ServerDriver {
    pub fn new(config: DriverConfig, discovery: Box<dyn PeripheralDiscovery>) -> Self {
        Self { hmd: ScriptedHmdDriver::new(config, discovery), announced: false }
    }

    /// Load the script and announce the HMD. A script that fails to load is
    /// not fatal: the device is announced anyway and stays inert until a
    /// later reload succeeds.
    pub fn init(&mut self, host: &mut dyn HostServices) {
        info!("[server] init");
        if let Err(err) = self.hmd.load() {
            warn!("[server] initial script load failed: {}", err);
        }
        self.announced = host.announce_device(self.hmd.serial_number(), DeviceClass::Hmd);
        if !self.announced {
            warn!("[server] host rejected device {}", self.hmd.serial_number());
        }
    }

    /// Unload the script and drop every script-side reference. Idempotent.
    pub fn cleanup(&mut self) {
        info!("[server] cleanup");
        self.hmd.unload();
    }

    /// One host frame tick, forwarded to the device.
    pub fn run_frame(&mut self) {
        self.hmd.run_frame();
    }

    pub fn should_block_standby_mode(&self) -> bool {
        true
    }

    pub fn hmd(&self) -> &ScriptedHmdDriver {
        &self.hmd
    }

    pub fn hmd_mut(&mut self) -> &mut ScriptedHmdDriver {
        &mut self.hmd
    }
}

/// Everything the driver shared library owns, created once when the host
/// loads the plugin. The host negotiates for one provider or the other;
/// both live here so no provider needs process-wide state.
pub struct DriverContext {
    server: ServerDriver,
    watchdog: WatchdogDriver,
}

impl DriverContext {
    pub fn new(config: DriverConfig, discovery: Box<dyn PeripheralDiscovery>) -> Self {
        let watchdog = WatchdogDriver::new(config.watchdog.clone());
        Self { server: ServerDriver::new(config, discovery), watchdog }
    }

    pub fn server(&mut self) -> &mut ServerDriver {
        &mut self.server
    }

    pub fn watchdog(&mut self) -> &mut WatchdogDriver {
        &mut self.watchdog
    }
}
