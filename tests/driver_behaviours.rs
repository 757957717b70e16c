use merlin_driver::config::DriverConfig;
use merlin_driver::driver::ScriptedHmdDriver;
use merlin_driver::error::BridgeError;
use merlin_driver::host::{
    DisplayComponent, DriverPose, Eye, InitError, MemoryPropertyStore, PropertyKey, PropertyValue,
    TrackedDeviceDriver, TrackingResult,
};
use merlin_driver::peripheral::NoPeripherals;
use merlin_driver::runtime::RuntimeState;
use glam::DQuat;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_script(contents: &str) -> NamedTempFile {
    let mut temp = NamedTempFile::new().expect("temp script");
    write!(temp, "{contents}").expect("write script");
    temp
}

fn config_for(script: &NamedTempFile) -> DriverConfig {
    let mut config = DriverConfig::default();
    config.script.path = script.path().to_string_lossy().into_owned();
    config.script.watch = false;
    config
}

fn driver_for(script: &NamedTempFile) -> ScriptedHmdDriver {
    ScriptedHmdDriver::new(config_for(script), Box::new(NoPeripherals))
}

#[test]
fn get_pose_forwards_the_script_record() {
    let script = write_script(
        r#"
            let TrackedDeviceServerDriver = #{
                Activate: |me, object_id| true,
                GetPose: |me| #{
                    poseIsValid: true,
                    deviceIsConnected: true,
                    result: 1,
                    qWorldFromDriverRotation: #{ w: 1.0, x: 0.0, y: 0.0, z: 0.0 },
                    qDriverFromHeadRotation: #{ w: 1.0, x: 0.0, y: 0.0, z: 0.0 },
                    qRotation: #{ w: 0.5, x: 0.5, y: -0.5, z: 0.5 },
                },
            };
        "#,
    );
    let mut driver = driver_for(&script);
    driver.load().expect("script should load");

    let pose = driver.get_pose();
    assert!(pose.pose_is_valid);
    assert!(pose.device_is_connected);
    assert_eq!(pose.result, TrackingResult::Ok);
    assert_eq!(pose.rotation, DQuat::from_xyzw(0.5, -0.5, 0.5, 0.5));
    assert_eq!(pose.world_from_driver_rotation, DQuat::from_xyzw(0.0, 0.0, 0.0, 1.0));
    assert_eq!(pose.driver_from_head_rotation, DQuat::from_xyzw(0.0, 0.0, 0.0, 1.0));
    assert_eq!(driver.stack_depth(), 0, "pose query must leave the stack balanced");
}

#[test]
fn missing_script_methods_degrade_to_defaults() {
    let script = write_script("let TrackedDeviceServerDriver = #{ EnterStandby: |me| () };");
    let mut driver = driver_for(&script);
    driver.load().expect("script should load");

    assert_eq!(driver.get_pose(), DriverPose::default(), "no GetPose means the zeroed pose");

    let mut properties = MemoryPropertyStore::default();
    assert_eq!(
        driver.activate(1, &mut properties),
        Err(InitError::DriverFailed),
        "without an Activate method the script cannot consent to activation"
    );
    assert!(driver.runtime().is_loaded(), "missing methods are not load failures");
}

#[test]
fn missing_script_file_leaves_the_driver_inert() {
    let mut config = DriverConfig::default();
    config.script.path = "does/not/exist.rhai".to_string();
    config.script.watch = false;
    let mut driver = ScriptedHmdDriver::new(config, Box::new(NoPeripherals));

    let err = driver.load().expect_err("load should fail without a script file");
    assert!(matches!(err, BridgeError::Read { .. }), "unexpected error: {err}");
    assert_eq!(driver.state(), RuntimeState::Unloaded);

    let mut properties = MemoryPropertyStore::default();
    assert_eq!(driver.activate(1, &mut properties), Err(InitError::DriverFailed));
    assert_eq!(driver.get_pose(), DriverPose::default());
    driver.run_frame();
    assert_eq!(driver.state(), RuntimeState::Unloaded, "frames must be safe while unloaded");
}

#[test]
fn syntax_errors_fail_the_load() {
    let script = write_script("let TrackedDeviceServerDriver = #{");
    let mut driver = driver_for(&script);

    let err = driver.load().expect_err("load should fail on a syntax error");
    assert!(matches!(err, BridgeError::Compile { .. }), "unexpected error: {err}");
    assert_eq!(driver.state(), RuntimeState::Unloaded);
}

#[test]
fn activation_requires_a_strict_boolean_true() {
    for (body, expect_ok) in [("true", true), ("false", false), ("1", false), ("\"ready\"", false)]
    {
        let script = write_script(&format!(
            "let TrackedDeviceServerDriver = #{{ Activate: |me, object_id| {body} }};"
        ));
        let mut driver = driver_for(&script);
        driver.load().expect("script should load");

        let mut properties = MemoryPropertyStore::default();
        let outcome = driver.activate(4, &mut properties);
        assert_eq!(outcome.is_ok(), expect_ok, "Activate returning {body}");
        let expected_state = if expect_ok { RuntimeState::Activated } else { RuntimeState::Loaded };
        assert_eq!(driver.state(), expected_state);
        assert_eq!(driver.stack_depth(), 0);
    }
}

#[test]
fn activation_populates_the_property_store() {
    let script =
        write_script("let TrackedDeviceServerDriver = #{ Activate: |me, object_id| true };");
    let mut driver = driver_for(&script);
    driver.load().expect("script should load");

    let mut properties = MemoryPropertyStore::default();
    driver.activate(3, &mut properties).expect("activation should succeed");

    assert_eq!(
        properties.get(PropertyKey::ModelNumber),
        Some(&PropertyValue::String("v1.hmd.merlin.dev".to_string()))
    );
    assert_eq!(properties.get(PropertyKey::UserIpdMeters), Some(&PropertyValue::F64(0.063)));
    assert_eq!(properties.get(PropertyKey::DisplayFrequency), Some(&PropertyValue::F64(60.0)));
    assert_eq!(properties.get(PropertyKey::CurrentUniverseId), Some(&PropertyValue::U64(2)));
    assert_eq!(properties.get(PropertyKey::IsOnDesktop), Some(&PropertyValue::Bool(false)));
    assert_eq!(properties.len(), 8, "every well-known key gets a value");
}

#[test]
fn display_queries_decode_fixed_arity_tuples() {
    let script = write_script(
        r#"
            let VRDisplayComponent = #{
                GetWindowBounds: |me| [16, 32, 800, 600],
                GetRecommendedRenderTargetSize: |me| [1024, 768],
                GetEyeOutputViewport: |me, eye| {
                    if eye == 0 { [0, 0, 512, 768] } else { [512, 0, 512, 768] }
                },
            };
        "#,
    );
    let mut driver = driver_for(&script);
    driver.load().expect("script should load");

    let bounds = driver.window_bounds();
    assert_eq!((bounds.x, bounds.y, bounds.width, bounds.height), (16, 32, 800, 600));

    let target = driver.recommended_render_target_size();
    assert_eq!((target.width, target.height), (1024, 768));

    let left = driver.eye_output_viewport(Eye::Left);
    let right = driver.eye_output_viewport(Eye::Right);
    assert_eq!((left.x, left.width), (0, 512));
    assert_eq!((right.x, right.width), (512, 512));
    assert_eq!(driver.stack_depth(), 0);
}

#[test]
fn short_and_malformed_tuples_zero_fill_or_default() {
    let script = write_script(
        r#"
            let VRDisplayComponent = #{
                GetWindowBounds: |me| [42],
                GetRecommendedRenderTargetSize: |me| "big",
            };
        "#,
    );
    let mut driver = driver_for(&script);
    driver.load().expect("script should load");

    let bounds = driver.window_bounds();
    assert_eq!(
        (bounds.x, bounds.y, bounds.width, bounds.height),
        (42, 0, 0, 0),
        "short arrays zero-fill the missing positions"
    );

    let target = driver.recommended_render_target_size();
    assert_eq!((target.width, target.height), (0, 0), "non-arrays fall back to the default");
    assert_eq!(driver.stack_depth(), 0);
}

#[test]
fn native_display_answers_work_without_a_script() {
    let mut config = DriverConfig::default();
    config.script.path = "does/not/exist.rhai".to_string();
    config.script.watch = false;
    let mut driver = ScriptedHmdDriver::new(config, Box::new(NoPeripherals));

    assert!(driver.is_display_on_desktop());
    assert!(!driver.is_display_real_display());

    let projection = driver.projection_raw(Eye::Left);
    assert_eq!(
        (projection.left, projection.right, projection.top, projection.bottom),
        (-1.0, 1.0, -1.0, 1.0)
    );

    let uv = driver.compute_distortion(Eye::Right, 0.25, 0.75);
    assert_eq!(uv.red, [0.25, 0.75]);
    assert_eq!(uv.green, [0.25, 0.75]);
    assert_eq!(uv.blue, [0.25, 0.75]);

    assert_eq!(driver.debug_request("dump"), "", "debug requests answer empty");
}

#[test]
fn script_errors_degrade_per_call_without_poisoning() {
    let script = write_script(
        r#"
            let TrackedDeviceServerDriver = #{
                Activate: |me, object_id| true,
                GetPose: |me| { throw "sensor exploded"; },
                RunFrame: |me| (),
            };

            let VRDisplayComponent = #{
                GetWindowBounds: |me| [0, 0, 1280, 720],
            };
        "#,
    );
    let mut driver = driver_for(&script);
    driver.load().expect("script should load");
    let mut properties = MemoryPropertyStore::default();
    driver.activate(1, &mut properties).expect("activation should succeed");

    for _ in 0..5 {
        assert_eq!(driver.get_pose(), DriverPose::default(), "a throwing GetPose yields the default");
        assert_eq!(driver.window_bounds().height, 720);
        driver.run_frame();
        assert_eq!(driver.stack_depth(), 0, "every callback must leave the stack balanced");
    }

    assert!(!driver.runtime().poisoned(), "plain script errors are recoverable");
    assert!(driver.runtime().is_loaded());

    driver.enter_standby();
    assert_eq!(driver.state(), RuntimeState::Standby);
    driver.deactivate();
    assert_eq!(driver.state(), RuntimeState::Loaded);
    assert_eq!(driver.stack_depth(), 0);
}

#[test]
fn runaway_scripts_poison_the_instance_and_unload_next_frame() {
    let script = write_script(
        r#"
            let TrackedDeviceServerDriver = #{
                Activate: |me, object_id| true,
                GetPose: |me| { loop { } },
            };
        "#,
    );
    let mut config = config_for(&script);
    config.script.ops_budget = 10_000;
    let mut driver = ScriptedHmdDriver::new(config, Box::new(NoPeripherals));
    driver.load().expect("script should load");

    assert_eq!(driver.get_pose(), DriverPose::default(), "the runaway call still answers safely");
    assert!(driver.runtime().poisoned(), "exceeding the op budget must poison the instance");

    driver.run_frame();
    assert_eq!(driver.state(), RuntimeState::Unloaded, "poisoned instances are torn down");
}
