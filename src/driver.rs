use log::{debug, info, warn};
use rhai::Dynamic;

use crate::bridge::Caps;
use crate::codec;
use crate::config::DriverConfig;
use crate::error::Result;
use crate::handlers::{HandlerRegistry, InterfaceId};
use crate::host::{
    DisplayComponent, DistortionCoordinates, DriverPose, Eye, InitError, ProjectionRaw,
    PropertyKey, PropertyStore, RenderTargetSize, TrackedDeviceDriver, Viewport, WindowBounds,
};
use crate::peripheral::PeripheralDiscovery;
use crate::runtime::{RuntimeState, ScriptRuntime};

/// The HMD device the host drives. Every callback forwards into the loaded
/// script through the bridge; when the script cannot answer (not loaded,
/// method missing, call failed) the callback degrades to its default.
///
/// All methods run on the host's callback thread. A frame is: the host's
/// pose/geometry queries in any order, then one `run_frame`, which is also
/// the only point where a reload (controller-requested or file-watch) takes
/// effect.
pub struct ScriptedHmdDriver {
    config: DriverConfig,
    runtime: ScriptRuntime,
    handlers: HandlerRegistry,
    discovery: Box<dyn PeripheralDiscovery>,
    object_id: Option<u32>,
}

impl ScriptedHmdDriver {
    pub fn new(config: DriverConfig, discovery: Box<dyn PeripheralDiscovery>) -> Self {
        let runtime =
            ScriptRuntime::new(config.script.path.clone().into(), config.script.ops_budget);
        Self {
            config,
            runtime,
            handlers: HandlerRegistry::new(),
            discovery,
            object_id: None,
        }
    }

    pub fn serial_number(&self) -> &str {
        &self.config.device.serial_number
    }

    pub fn state(&self) -> RuntimeState {
        self.runtime.state()
    }

    pub fn runtime(&self) -> &ScriptRuntime {
        &self.runtime
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Messages the script printed through `driver_log` since the last call.
    pub fn take_script_logs(&mut self) -> Vec<String> {
        self.runtime.take_logs()
    }

    /// Depth of the staging stack; zero between host callbacks.
    pub fn stack_depth(&self) -> usize {
        self.runtime.instance().map_or(0, |i| i.stack_depth())
    }

    /// Load the configured script. A failure leaves the runtime unloaded and
    /// the device inert; the host keeps polling it regardless.
    pub fn load(&mut self) -> Result<()> {
        self.runtime.load(&mut self.handlers, self.discovery.as_mut())
    }

    pub fn unload(&mut self) {
        self.runtime.unload(&mut self.handlers);
        self.object_id = None;
    }

    pub fn reload(&mut self) -> Result<()> {
        self.runtime.reload(&mut self.handlers, self.discovery.as_mut())
    }

    /// Per-frame tick: the script's `RunFrame` hook, then the controller
    /// event pump, then queued haptic requests, and finally any pending
    /// reload. Reloads are applied only here, after the dispatch passes have
    /// unwound, so script-triggered ones never tear down a call frame that
    /// is still executing.
    pub fn run_frame(&mut self) {
        self.invoke_table(InterfaceId::TrackedDevice, "RunFrame", Caps::RUN_FRAME, vec![], false);

        let reload_from_controller = match self.runtime.instance_mut() {
            Some(instance) => self.handlers.pump_events(instance),
            None => false,
        };
        if reload_from_controller {
            self.runtime.request_reload("controller home button");
        }

        let haptics = self.runtime.drain_haptic_requests();
        if !haptics.is_empty() {
            self.handlers.trigger_haptics(haptics);
        }
        self.runtime.discard_stale_registrations();

        if self.runtime.poisoned() {
            warn!("[driver] script instance is poisoned; forcing an unload");
            self.unload();
        }

        if self.config.script.watch && self.runtime.is_loaded() && self.runtime.script_file_changed()
        {
            self.runtime.request_reload("script file changed on disk");
        }

        if self.runtime.take_reload_request() {
            if let Err(err) = self.reload() {
                warn!("[driver] reload failed: {}", err);
            }
        }

        self.check_balance("RunFrame");
    }

    /// Invoke `method` on a registered interface table with the table as
    /// receiver plus `args`. Returns the staged result when one was asked
    /// for; `None` stands for "use the default" on every failure path.
    fn invoke_table(
        &mut self,
        id: InterfaceId,
        method: &'static str,
        cap: Caps,
        args: Vec<Dynamic>,
        want_result: bool,
    ) -> Option<Dynamic> {
        let slot = self.handlers.interface(id)?;
        if !slot.caps.contains(cap) {
            return None;
        }
        let handle = slot.handle;

        let instance = self.runtime.instance_mut()?;
        let table = match instance.resolve(handle) {
            Ok(table) => table,
            Err(err) => {
                warn!("[driver] {} table is gone: {}", id.wire_name(), err);
                return None;
            }
        };

        let nargs = 1 + args.len();
        instance.push(table.clone());
        for arg in args {
            instance.push(arg);
        }
        match instance.invoke(&table, id.wire_name(), method, nargs, usize::from(want_result)) {
            Ok(()) => {
                if want_result {
                    instance.pop().ok()
                } else {
                    None
                }
            }
            Err(err) => {
                warn!("[driver] {}.{} failed: {}", id.wire_name(), method, err);
                None
            }
        }
    }

    fn populate_properties(&self, properties: &mut dyn PropertyStore) {
        let device = &self.config.device;
        properties.set_string(PropertyKey::ModelNumber, &device.model_number);
        properties.set_string(PropertyKey::RenderModelName, &device.model_number);
        properties.set_f64(PropertyKey::UserIpdMeters, device.user_ipd_meters);
        properties.set_f64(PropertyKey::UserHeadToEyeDepthMeters, device.head_to_eye_depth_meters);
        properties.set_f64(PropertyKey::DisplayFrequency, device.display_frequency);
        properties.set_f64(
            PropertyKey::SecondsFromVsyncToPhotons,
            device.seconds_from_vsync_to_photons,
        );
        properties.set_u64(PropertyKey::CurrentUniverseId, device.universe_id);
        properties.set_bool(PropertyKey::IsOnDesktop, false);
    }

    /// Every host callback must leave the staging stack empty. A residue
    /// here is a bridge bug; it is logged and discarded so the next callback
    /// starts from a clean slate.
    fn check_balance(&mut self, entry: &str) {
        if let Some(instance) = self.runtime.instance_mut() {
            if !instance.stack_is_empty() {
                warn!(
                    "[driver] value stack has {} leftover values after {}; clearing",
                    instance.stack_depth(),
                    entry
                );
                instance.clear_stack();
            }
        }
    }
}

impl TrackedDeviceDriver for ScriptedHmdDriver {
    fn activate(
        &mut self,
        object_id: u32,
        properties: &mut dyn PropertyStore,
    ) -> std::result::Result<(), InitError> {
        self.populate_properties(properties);

        let result = self.invoke_table(
            InterfaceId::TrackedDevice,
            "Activate",
            Caps::ACTIVATE,
            vec![Dynamic::from_int(object_id as i64)],
            true,
        );
        self.check_balance("Activate");

        // Anything but a strict boolean true is an activation failure.
        match result.as_ref().and_then(|value| value.as_bool().ok()) {
            Some(true) => {
                info!("[driver] activated as object {}", object_id);
                self.object_id = Some(object_id);
                self.runtime.mark_activated();
                Ok(())
            }
            _ => {
                warn!("[driver] script refused activation (object {})", object_id);
                Err(InitError::DriverFailed)
            }
        }
    }

    fn deactivate(&mut self) {
        self.invoke_table(InterfaceId::TrackedDevice, "Deactivate", Caps::DEACTIVATE, vec![], false);
        self.check_balance("Deactivate");
        self.object_id = None;
        self.runtime.mark_deactivated();
    }

    fn enter_standby(&mut self) {
        self.invoke_table(
            InterfaceId::TrackedDevice,
            "EnterStandby",
            Caps::ENTER_STANDBY,
            vec![],
            false,
        );
        self.check_balance("EnterStandby");
        self.runtime.mark_standby();
    }

    fn get_pose(&mut self) -> DriverPose {
        let pose = self
            .invoke_table(InterfaceId::TrackedDevice, "GetPose", Caps::GET_POSE, vec![], true)
            .map(|value| match codec::decode_pose(&value) {
                Ok(pose) => pose,
                Err(err) => {
                    warn!("[driver] {}", err);
                    DriverPose::default()
                }
            })
            .unwrap_or_default();
        self.check_balance("GetPose");
        pose
    }

    fn debug_request(&mut self, request: &str) -> String {
        debug!("[driver] debug request ignored: {}", request);
        String::new()
    }
}

impl DisplayComponent for ScriptedHmdDriver {
    fn window_bounds(&mut self) -> WindowBounds {
        let bounds = self
            .invoke_table(
                InterfaceId::Display,
                "GetWindowBounds",
                Caps::GET_WINDOW_BOUNDS,
                vec![],
                true,
            )
            .and_then(|value| match codec::decode_tuple::<4>(&value, "GetWindowBounds") {
                Ok(tuple) => Some(tuple),
                Err(err) => {
                    warn!("[driver] {}", err);
                    None
                }
            })
            .map(|[x, y, width, height]| WindowBounds {
                x: x as i32,
                y: y as i32,
                width: width as u32,
                height: height as u32,
            })
            .unwrap_or_default();
        self.check_balance("GetWindowBounds");
        debug!(
            "[driver] GetWindowBounds -> ({}, {}, {}, {})",
            bounds.x, bounds.y, bounds.width, bounds.height
        );
        bounds
    }

    fn is_display_on_desktop(&self) -> bool {
        true
    }

    fn is_display_real_display(&self) -> bool {
        false
    }

    fn recommended_render_target_size(&mut self) -> RenderTargetSize {
        let size = self
            .invoke_table(
                InterfaceId::Display,
                "GetRecommendedRenderTargetSize",
                Caps::GET_RENDER_TARGET_SIZE,
                vec![],
                true,
            )
            .and_then(
                |value| match codec::decode_tuple::<2>(&value, "GetRecommendedRenderTargetSize") {
                    Ok(tuple) => Some(tuple),
                    Err(err) => {
                        warn!("[driver] {}", err);
                        None
                    }
                },
            )
            .map(|[width, height]| RenderTargetSize { width: width as u32, height: height as u32 })
            .unwrap_or_default();
        self.check_balance("GetRecommendedRenderTargetSize");
        size
    }

    fn eye_output_viewport(&mut self, eye: Eye) -> Viewport {
        let viewport = self
            .invoke_table(
                InterfaceId::Display,
                "GetEyeOutputViewport",
                Caps::GET_EYE_VIEWPORT,
                vec![Dynamic::from_int(eye.index())],
                true,
            )
            .and_then(|value| match codec::decode_tuple::<4>(&value, "GetEyeOutputViewport") {
                Ok(tuple) => Some(tuple),
                Err(err) => {
                    warn!("[driver] {}", err);
                    None
                }
            })
            .map(|[x, y, width, height]| Viewport {
                x: x as u32,
                y: y as u32,
                width: width as u32,
                height: height as u32,
            })
            .unwrap_or_default();
        self.check_balance("GetEyeOutputViewport");
        debug!(
            "[driver] GetEyeOutputViewport({:?}) -> ({}, {}, {}, {})",
            eye, viewport.x, viewport.y, viewport.width, viewport.height
        );
        viewport
    }

    fn projection_raw(&mut self, _eye: Eye) -> ProjectionRaw {
        ProjectionRaw { left: -1.0, right: 1.0, top: -1.0, bottom: 1.0 }
    }

    fn compute_distortion(&mut self, _eye: Eye, u: f64, v: f64) -> DistortionCoordinates {
        DistortionCoordinates { red: [u, v], green: [u, v], blue: [u, v] }
    }
}
