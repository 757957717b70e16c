use std::collections::BTreeMap;

use glam::DQuat;

/// Tracking quality reported alongside a pose sample.
///
/// Wire values follow the host runtime's numbering; anything the script
/// reports outside that range decodes as `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingResult {
    Uninitialized,
    Ok,
    Calibrating,
    OutOfRange,
}

impl TrackingResult {
    pub fn from_wire(value: i64) -> Self {
        match value {
            1 => TrackingResult::Ok,
            2 => TrackingResult::Calibrating,
            3 => TrackingResult::OutOfRange,
            _ => TrackingResult::Uninitialized,
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            TrackingResult::Uninitialized => 0,
            TrackingResult::Ok => 1,
            TrackingResult::Calibrating => 2,
            TrackingResult::OutOfRange => 3,
        }
    }
}

/// Pose sample handed to the host on every `get_pose` callback.
///
/// The default is fully zeroed, quaternions included (not identity): it is
/// the safe "nothing to report" answer the facade substitutes whenever the
/// script cannot produce a pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverPose {
    pub pose_is_valid: bool,
    pub device_is_connected: bool,
    pub result: TrackingResult,
    pub world_from_driver_rotation: DQuat,
    pub driver_from_head_rotation: DQuat,
    pub rotation: DQuat,
}

impl Default for DriverPose {
    fn default() -> Self {
        let zero = DQuat::from_xyzw(0.0, 0.0, 0.0, 0.0);
        Self {
            pose_is_valid: false,
            device_is_connected: false,
            result: TrackingResult::Uninitialized,
            world_from_driver_rotation: zero,
            driver_from_head_rotation: zero,
            rotation: zero,
        }
    }
}

/// Which eye a display geometry query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub fn index(self) -> i64 {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }
}

/// Desktop window placement of the driver's output.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowBounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Suggested offscreen render target dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderTargetSize {
    pub width: u32,
    pub height: u32,
}

/// Per-eye viewport within the output window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Raw projection frustum extents for one eye.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProjectionRaw {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

/// Distortion-corrected UV coordinates per color channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DistortionCoordinates {
    pub red: [f64; 2],
    pub green: [f64; 2],
    pub blue: [f64; 2],
}

/// Failure reported from device activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    DriverFailed,
}

/// Device category announced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Hmd,
    Controller,
}

/// Keys of the host's per-device property container the driver populates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PropertyKey {
    ModelNumber,
    RenderModelName,
    UserIpdMeters,
    UserHeadToEyeDepthMeters,
    DisplayFrequency,
    SecondsFromVsyncToPhotons,
    CurrentUniverseId,
    IsOnDesktop,
}

/// Property container interface supplied by the host during activation.
pub trait PropertyStore {
    fn set_string(&mut self, key: PropertyKey, value: &str);
    fn set_f64(&mut self, key: PropertyKey, value: f64);
    fn set_bool(&mut self, key: PropertyKey, value: bool);
    fn set_u64(&mut self, key: PropertyKey, value: u64);
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    F64(f64),
    Bool(bool),
    U64(u64),
}

/// In-memory property container used by the simulator and tests.
#[derive(Default)]
pub struct MemoryPropertyStore {
    values: BTreeMap<PropertyKey, PropertyValue>,
}

impl MemoryPropertyStore {
    pub fn get(&self, key: PropertyKey) -> Option<&PropertyValue> {
        self.values.get(&key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn set_string(&mut self, key: PropertyKey, value: &str) {
        self.values.insert(key, PropertyValue::String(value.to_string()));
    }

    fn set_f64(&mut self, key: PropertyKey, value: f64) {
        self.values.insert(key, PropertyValue::F64(value));
    }

    fn set_bool(&mut self, key: PropertyKey, value: bool) {
        self.values.insert(key, PropertyValue::Bool(value));
    }

    fn set_u64(&mut self, key: PropertyKey, value: u64) {
        self.values.insert(key, PropertyValue::U64(value));
    }
}

/// Per-device driver contract the host invokes on its callback thread.
pub trait TrackedDeviceDriver {
    /// Activate the device. The property store is scoped to this device and
    /// only valid for the duration of the call.
    fn activate(&mut self, object_id: u32, properties: &mut dyn PropertyStore)
        -> Result<(), InitError>;

    /// Deactivate the device. Must tolerate being called when never activated.
    fn deactivate(&mut self);

    /// Drop into low-power standby.
    fn enter_standby(&mut self);

    /// Poll the current pose sample.
    fn get_pose(&mut self) -> DriverPose;

    /// Answer a free-form debug request.
    fn debug_request(&mut self, request: &str) -> String;
}

/// Display geometry contract for a device that renders to a headset.
pub trait DisplayComponent {
    fn window_bounds(&mut self) -> WindowBounds;
    fn is_display_on_desktop(&self) -> bool;
    fn is_display_real_display(&self) -> bool;
    fn recommended_render_target_size(&mut self) -> RenderTargetSize;
    fn eye_output_viewport(&mut self, eye: Eye) -> Viewport;
    fn projection_raw(&mut self, eye: Eye) -> ProjectionRaw;
    fn compute_distortion(&mut self, eye: Eye, u: f64, v: f64) -> DistortionCoordinates;
}

/// Narrow interface the driver uses to call back into the host server.
pub trait HostServices {
    /// Announce a device under a stable serial. Returns false if the host
    /// rejected the announcement (duplicate serial, shutdown in progress).
    fn announce_device(&mut self, serial: &str, class: DeviceClass) -> bool;
}

/// Host-side wake-up surface available to the watchdog thread.
pub trait WatchdogServices: Send + Sync {
    fn wake_up(&self, class: DeviceClass);
}
