use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use env_logger::Env;
use log::info;

use merlin_driver::cli::CliOverrides;
use merlin_driver::config::DriverConfig;
use merlin_driver::host::{
    DeviceClass, DisplayComponent, Eye, HostServices, MemoryPropertyStore, TrackedDeviceDriver,
    WatchdogServices,
};
use merlin_driver::peripheral::{
    ControllerButtons, MockController, MockDiscovery, OrientationSample,
};
use merlin_driver::server::DriverContext;

/// Stand-in for the VR runtime: accepts every announcement.
struct SimHost;

impl HostServices for SimHost {
    fn announce_device(&mut self, serial: &str, class: DeviceClass) -> bool {
        info!("[sim] device announced: {} ({:?})", serial, class);
        true
    }
}

struct SimWakeUps(AtomicU64);

impl WatchdogServices for SimWakeUps {
    fn wake_up(&self, _class: DeviceClass) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// A controller with a short scripted life: a few orientation updates, one
/// trigger press, then a Home press that asks the driver to reload.
fn staged_controller() -> MockController {
    let controller = MockController::new("MOCK-CTRL-1");
    for step in 0..8_i16 {
        let buttons =
            if step == 3 { ControllerButtons::TRIGGER } else { ControllerButtons::empty() };
        controller.push_update(OrientationSample { x: step * 1000, y: 0, z: 0 }, buttons);
    }
    controller.push_update(OrientationSample::default(), ControllerButtons::HOME);
    controller
}

fn run(cli: CliOverrides) -> Result<()> {
    let mut config = DriverConfig::load_or_default(cli.config_path());
    let frames = cli.frames();
    let overrides = cli.into_config_overrides();
    if !overrides.is_empty() {
        info!("[sim] applying CLI overrides: {:?}", overrides.applied_fields());
    }
    config.apply_overrides(&overrides);

    // One controller now, and one found again by the post-reload scan.
    let mut discovery = MockDiscovery::new();
    discovery.stage_round(vec![staged_controller()]);
    discovery.stage_round(vec![staged_controller()]);

    let mut context = DriverContext::new(config, Box::new(discovery));
    let wake_ups = Arc::new(SimWakeUps(AtomicU64::new(0)));
    context.watchdog().init(wake_ups.clone());

    let mut host = SimHost;
    context.server().init(&mut host);

    let hmd = context.server().hmd_mut();
    let mut properties = MemoryPropertyStore::default();
    match hmd.activate(1, &mut properties) {
        Ok(()) => info!("[sim] activated ({} properties populated)", properties.len()),
        Err(err) => info!("[sim] activation failed: {:?}", err),
    }

    let bounds = hmd.window_bounds();
    let target = hmd.recommended_render_target_size();
    info!(
        "[sim] window {}x{} at ({}, {}); render target {}x{}",
        bounds.width, bounds.height, bounds.x, bounds.y, target.width, target.height
    );
    for eye in [Eye::Left, Eye::Right] {
        let viewport = hmd.eye_output_viewport(eye);
        info!(
            "[sim] {:?} eye viewport ({}, {}) {}x{}",
            eye, viewport.x, viewport.y, viewport.width, viewport.height
        );
    }

    for frame in 0..frames {
        let server = context.server();
        let pose = server.hmd_mut().get_pose();
        if frame % 60 == 0 {
            info!(
                "[sim] frame {}: pose valid={} result={:?} q=({:.3}, {:.3}, {:.3}, {:.3})",
                frame,
                pose.pose_is_valid,
                pose.result,
                pose.rotation.w,
                pose.rotation.x,
                pose.rotation.y,
                pose.rotation.z
            );
        }
        server.run_frame();
    }

    context.server().hmd_mut().deactivate();
    context.server().cleanup();
    context.watchdog().cleanup();
    info!("[sim] done after {} frames, {} watchdog wake-ups", frames, wake_ups.0.load(Ordering::Relaxed));
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run(cli) {
        eprintln!("Simulator error: {err:?}");
    }
}
