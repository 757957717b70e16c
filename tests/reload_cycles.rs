use merlin_driver::config::DriverConfig;
use merlin_driver::driver::ScriptedHmdDriver;
use merlin_driver::error::BridgeError;
use merlin_driver::handlers::InterfaceId;
use merlin_driver::host::{MemoryPropertyStore, TrackedDeviceDriver, TrackingResult};
use merlin_driver::peripheral::{
    ControllerButtons, MockController, MockDiscovery, NoPeripherals, OrientationSample,
};
use merlin_driver::runtime::RuntimeState;
use std::fs;
use std::io::Write;
use std::thread;
use std::time::Duration;
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

fn count(logs: &[String], needle: &str) -> usize {
    logs.iter().filter(|line| line.contains(needle)).count()
}

const LIFECYCLE_SCRIPT: &str = r#"
    let TrackedDeviceServerDriver = #{
        OnInit: |me| driver_log("tracked device ready"),
        OnShutdown: |me| driver_log("tracked device shutdown"),
        Activate: |me, object_id| true,
        GetPose: |me| #{ poseIsValid: true, result: 1 },
    };

    let VRDisplayComponent = #{
        OnInit: |me| driver_log("display ready"),
        OnShutdown: |me| driver_log("display shutdown"),
    };
"#;

#[test]
fn unloading_twice_fires_shutdown_callbacks_once() {
    let script = write_script(LIFECYCLE_SCRIPT);
    let mut driver = ScriptedHmdDriver::new(config_for(&script), Box::new(NoPeripherals));
    driver.load().expect("script should load");

    let logs = driver.take_script_logs();
    assert_eq!(count(&logs, "tracked device ready"), 1);
    assert_eq!(count(&logs, "display ready"), 1);

    driver.unload();
    let logs = driver.take_script_logs();
    assert_eq!(count(&logs, "tracked device shutdown"), 1);
    assert_eq!(count(&logs, "display shutdown"), 1);
    assert_eq!(driver.state(), RuntimeState::Unloaded);

    driver.unload();
    assert!(driver.take_script_logs().is_empty(), "a second unload must not re-run callbacks");
    assert_eq!(driver.state(), RuntimeState::Unloaded);
}

#[test]
fn reload_replaces_the_instance_and_stales_old_handles() {
    let script = write_script(LIFECYCLE_SCRIPT);
    let mut driver = ScriptedHmdDriver::new(config_for(&script), Box::new(NoPeripherals));
    driver.load().expect("script should load");

    for cycle in 0..3 {
        let old_token = driver.runtime().token();
        let old_handle =
            driver.handlers().interface(InterfaceId::TrackedDevice).expect("registered").handle;
        assert_eq!(
            driver.runtime().instance().expect("instance").live_handles(),
            2,
            "one live handle per registered interface (cycle {cycle})"
        );

        driver.reload().expect("reload should succeed");
        assert_eq!(driver.state(), RuntimeState::Loaded, "reload lands in Loaded");
        assert!(driver.runtime().token() > old_token, "each load mints a fresh driver token");

        let instance = driver.runtime().instance().expect("instance");
        assert_eq!(instance.live_handles(), 2, "reloads must not leak handles (cycle {cycle})");
        assert!(
            matches!(instance.resolve(old_handle), Err(BridgeError::StaleHandle(_))),
            "handles die with their instance (cycle {cycle})"
        );
    }
}

#[test]
fn home_button_reloads_at_the_frame_boundary_without_forwarding() {
    let script = write_script(
        r#"
            let TrackedDeviceServerDriver = #{
                Activate: |me, object_id| true,
            };

            fn register_handlers(token) {
                register_handler(token, "SteamController", #{
                    Create: |table| #{ device: 0 },
                    OnConnect: |me, device| { me.device = device; },
                    OnUpdate: |me, event| driver_log("update forwarded"),
                    OnShutdown: |me| driver_log("controller handler shutdown"),
                });
            }
        "#,
    );
    let controller = MockController::new("CTRL-1");
    controller.push_update(OrientationSample::default(), ControllerButtons::HOME);
    let mut discovery = MockDiscovery::new();
    discovery.stage_round(vec![controller]);

    let mut driver = ScriptedHmdDriver::new(config_for(&script), Box::new(discovery));
    driver.load().expect("script should load");
    assert_eq!(driver.handlers().live_proxies(), 1);

    let mut properties = MemoryPropertyStore::default();
    driver.activate(1, &mut properties).expect("activation should succeed");
    driver.take_script_logs();

    driver.run_frame();

    let logs = driver.take_script_logs();
    assert_eq!(count(&logs, "update forwarded"), 0, "the home press must not reach OnUpdate");
    assert_eq!(count(&logs, "controller handler shutdown"), 1, "the old proxy shuts down");
    assert_eq!(driver.state(), RuntimeState::Loaded, "the reload lands inside the same frame");
    assert_eq!(driver.handlers().live_proxies(), 0, "the post-reload scan found no hardware");
    assert_eq!(driver.stack_depth(), 0);

    driver.activate(1, &mut properties).expect("the host may re-activate after the reload");
    assert_eq!(driver.state(), RuntimeState::Activated);
}

#[test]
fn shutdown_runs_proxies_before_interface_tables() {
    let script = write_script(
        r#"
            let TrackedDeviceServerDriver = #{
                OnShutdown: |me| driver_log("shutdown TrackedDeviceServerDriver"),
            };

            let VRDisplayComponent = #{
                OnShutdown: |me| driver_log("shutdown VRDisplayComponent"),
            };

            fn register_handlers(token) {
                register_handler(token, "SteamController", #{
                    Create: |table| #{},
                    OnShutdown: |me| driver_log("shutdown proxy"),
                });
            }
        "#,
    );
    let controller = MockController::new("CTRL-1");
    let mut discovery = MockDiscovery::new();
    discovery.stage_round(vec![controller]);

    let mut driver = ScriptedHmdDriver::new(config_for(&script), Box::new(discovery));
    driver.load().expect("script should load");
    driver.take_script_logs();

    driver.unload();
    let logs = driver.take_script_logs();
    let order: Vec<&str> = logs.iter().filter_map(|line| line.strip_prefix("shutdown ")).collect();
    assert_eq!(
        order,
        ["proxy", "TrackedDeviceServerDriver", "VRDisplayComponent"],
        "proxies shut down first, then interfaces in a stable order"
    );
}

#[test]
fn watched_script_files_reload_on_change() {
    let script =
        write_script("let TrackedDeviceServerDriver = #{ GetPose: |me| #{ result: 1 } };");
    let mut config = config_for(&script);
    config.script.watch = true;
    let mut driver = ScriptedHmdDriver::new(config, Box::new(NoPeripherals));
    driver.load().expect("script should load");
    assert_eq!(driver.get_pose().result, TrackingResult::Ok);

    // mtime granularity is coarse on some filesystems
    thread::sleep(Duration::from_millis(25));
    fs::write(script.path(), "let TrackedDeviceServerDriver = #{ GetPose: |me| #{ result: 2 } };")
        .expect("rewrite script");

    driver.run_frame();

    assert_eq!(driver.state(), RuntimeState::Loaded);
    assert_eq!(
        driver.get_pose().result,
        TrackingResult::Calibrating,
        "the frame after a file change must observe the new script"
    );
}

#[test]
fn each_reload_rebinds_the_discovered_controllers() {
    let script = write_script(
        r#"
            fn register_handlers(token) {
                register_handler(token, "SteamController", #{
                    Create: |table| #{ device: 0 },
                    OnConnect: |me, device| { me.device = device; driver_log("bound " + device); },
                });
            }
        "#,
    );
    let mut discovery = MockDiscovery::new();
    discovery.stage_round(vec![MockController::new("CTRL-A")]);
    discovery.stage_round(vec![MockController::new("CTRL-B"), MockController::new("CTRL-C")]);

    let mut driver = ScriptedHmdDriver::new(config_for(&script), Box::new(discovery));
    driver.load().expect("script should load");
    assert_eq!(driver.handlers().live_proxies(), 1);
    assert_eq!(count(&driver.take_script_logs(), "bound "), 1);

    driver.reload().expect("reload should succeed");
    assert_eq!(driver.handlers().live_proxies(), 2, "the reload scan found two controllers");
    let serials: Vec<&str> =
        driver.handlers().proxies().iter().map(|proxy| proxy.serial()).collect();
    assert_eq!(serials, ["CTRL-B", "CTRL-C"]);
    let logs = driver.take_script_logs();
    assert_eq!(count(&logs, "bound "), 2, "each new proxy connects exactly once");
}
