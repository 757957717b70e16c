use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::info;

use crate::config::WatchdogConfig;
use crate::host::{DeviceClass, WatchdogServices};

/// Watchdog provider: a thread that periodically asks the host to wake the
/// server up. It never touches the script runtime, so it needs no
/// synchronization with the bridge.
pub struct WatchdogDriver {
    interval: Duration,
    exiting: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogDriver {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms),
            exiting: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Start the wake-up thread. Starting an already-running watchdog is a
    /// no-op.
    pub fn init(&mut self, services: Arc<dyn WatchdogServices>) {
        if self.thread.is_some() {
            return;
        }
        info!("[watchdog] starting wake-up thread ({:?} interval)", self.interval);
        self.exiting.store(false, Ordering::SeqCst);
        let exiting = Arc::clone(&self.exiting);
        let interval = self.interval;
        self.thread = Some(thread::spawn(move || {
            while !exiting.load(Ordering::SeqCst) {
                thread::sleep(interval);
                services.wake_up(DeviceClass::Hmd);
            }
        }));
    }

    /// Stop and join the wake-up thread. Idempotent.
    pub fn cleanup(&mut self) {
        self.exiting.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("[watchdog] wake-up thread joined");
        }
    }
}

impl Drop for WatchdogDriver {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHost {
        wake_ups: AtomicUsize,
    }

    impl WatchdogServices for CountingHost {
        fn wake_up(&self, class: DeviceClass) {
            assert_eq!(class, DeviceClass::Hmd);
            self.wake_ups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn watchdog_pings_until_cleaned_up() {
        let host = Arc::new(CountingHost { wake_ups: AtomicUsize::new(0) });
        let mut watchdog = WatchdogDriver::new(WatchdogConfig { interval_ms: 1 });

        watchdog.init(Arc::clone(&host) as Arc<dyn WatchdogServices>);
        assert!(watchdog.is_running());
        watchdog.init(Arc::clone(&host) as Arc<dyn WatchdogServices>);

        while host.wake_ups.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        watchdog.cleanup();
        assert!(!watchdog.is_running());

        let after_stop = host.wake_ups.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(host.wake_ups.load(Ordering::SeqCst), after_stop, "no pings after cleanup");
        watchdog.cleanup();
    }
}
