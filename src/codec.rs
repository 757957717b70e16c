use glam::DQuat;
use log::warn;
use rhai::{Array, Dynamic, Map};

use crate::error::{BridgeError, Result};
use crate::host::{DriverPose, TrackingResult};
use crate::peripheral::ControllerUpdate;

// Script-side field names are the wire contract; scripts were written
// against these spellings and they survive reloads and renames on the
// native side.
const KEY_POSE_IS_VALID: &str = "poseIsValid";
const KEY_DEVICE_IS_CONNECTED: &str = "deviceIsConnected";
const KEY_RESULT: &str = "result";
const KEY_WORLD_FROM_DRIVER: &str = "qWorldFromDriverRotation";
const KEY_DRIVER_FROM_HEAD: &str = "qDriverFromHeadRotation";
const KEY_ROTATION: &str = "qRotation";

/// Loose numeric read: scripts write `0` and `0.0` interchangeably.
fn number(value: &Dynamic) -> Option<f64> {
    if let Ok(f) = value.as_float() {
        Some(f)
    } else if let Ok(i) = value.as_int() {
        Some(i as f64)
    } else {
        None
    }
}

fn field_number(map: &Map, key: &str) -> f64 {
    map.get(key).and_then(number).unwrap_or(0.0)
}

fn field_bool(map: &Map, key: &str) -> bool {
    map.get(key).and_then(|v| v.as_bool().ok()).unwrap_or(false)
}

fn field_int(map: &Map, key: &str) -> i64 {
    map.get(key)
        .and_then(|v| v.as_int().ok().or_else(|| v.as_float().ok().map(|f| f as i64)))
        .unwrap_or(0)
}

/// Encode a quaternion as the script-side record `{w, x, y, z}`.
pub fn encode_quat(q: DQuat) -> Dynamic {
    let mut map = Map::new();
    map.insert("w".into(), Dynamic::from_float(q.w));
    map.insert("x".into(), Dynamic::from_float(q.x));
    map.insert("y".into(), Dynamic::from_float(q.y));
    map.insert("z".into(), Dynamic::from_float(q.z));
    Dynamic::from_map(map)
}

/// Decode a `{w, x, y, z}` record. Missing or malformed components read as
/// zero; a non-map value decodes as the zero quaternion.
pub fn decode_quat(value: &Dynamic) -> DQuat {
    match value.read_lock::<Map>() {
        Some(map) => DQuat::from_xyzw(
            field_number(&map, "x"),
            field_number(&map, "y"),
            field_number(&map, "z"),
            field_number(&map, "w"),
        ),
        None => DQuat::from_xyzw(0.0, 0.0, 0.0, 0.0),
    }
}

/// Encode a controller update event for `OnUpdate`.
///
/// The transport reports orientation as a signed 16-bit vector part; the
/// scalar part is reconstructed the way the hardware protocol defines it
/// before the quaternion is handed to the script.
pub fn encode_controller_update(update: ControllerUpdate) -> Dynamic {
    let x = update.orientation.x as f64 / 32767.0;
    let y = update.orientation.y as f64 / 32767.0;
    let z = update.orientation.z as f64 / 32767.0;
    let w = 1.0 - (x * x + y * y + z * z).sqrt();

    let mut map = Map::new();
    map.insert("orientation".into(), encode_quat(DQuat::from_xyzw(x, y, z, w)));
    map.insert("buttons".into(), Dynamic::from_int(update.buttons.bits() as i64));
    Dynamic::from_map(map)
}

/// Decode a pose record returned by the script's `GetPose`.
///
/// Inside the map every missing or malformed field falls back to the zeroed
/// default for its type; only a non-map value is an error, and the caller
/// substitutes `DriverPose::default()` for it.
pub fn decode_pose(value: &Dynamic) -> Result<DriverPose> {
    let map = value.read_lock::<Map>().ok_or_else(|| BridgeError::Decode {
        what: "pose",
        detail: format!("expected a map, got {}", value.type_name()),
    })?;

    let mut pose = DriverPose::default();
    pose.pose_is_valid = field_bool(&map, KEY_POSE_IS_VALID);
    pose.device_is_connected = field_bool(&map, KEY_DEVICE_IS_CONNECTED);
    pose.result = TrackingResult::from_wire(field_int(&map, KEY_RESULT));
    if let Some(q) = map.get(KEY_WORLD_FROM_DRIVER) {
        pose.world_from_driver_rotation = decode_quat(q);
    }
    if let Some(q) = map.get(KEY_DRIVER_FROM_HEAD) {
        pose.driver_from_head_rotation = decode_quat(q);
    }
    if let Some(q) = map.get(KEY_ROTATION) {
        pose.rotation = decode_quat(q);
    }
    Ok(pose)
}

/// Decode a fixed-arity numeric tuple returned as a script array.
///
/// A short array pads the missing trailing elements with zero (logged at
/// warn); extra elements are ignored; a non-array value is an error and the
/// caller substitutes the all-zero tuple.
pub fn decode_tuple<const N: usize>(value: &Dynamic, what: &'static str) -> Result<[f64; N]> {
    let array = value.read_lock::<Array>().ok_or_else(|| BridgeError::Decode {
        what,
        detail: format!("expected an array of {} numbers, got {}", N, value.type_name()),
    })?;

    if array.len() < N {
        warn!(
            "[codec] {} returned {} of {} elements; padding with zeros",
            what,
            array.len(),
            N
        );
    }

    let mut out = [0.0; N];
    for (i, slot) in out.iter_mut().enumerate() {
        let Some(element) = array.get(i) else { break };
        match number(element) {
            Some(n) => *slot = n,
            None => warn!("[codec] {} element {} is not a number; reading as 0", what, i),
        }
    }
    Ok(out)
}
