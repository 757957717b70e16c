use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bitflags::bitflags;

bitflags! {
    /// Button state bits carried by a controller update event.
    ///
    /// `HOME` is special-cased by the dispatcher: it requests a script
    /// reload instead of being forwarded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControllerButtons: u32 {
        const TRIGGER = 1 << 0;
        const GRIP = 1 << 1;
        const STICK = 1 << 2;
        const PAD = 1 << 3;
        const A = 1 << 4;
        const B = 1 << 5;
        const X = 1 << 6;
        const Y = 1 << 7;
        const HOME = 1 << 8;
    }
}

/// Raw orientation triple as reported by the transport.
///
/// Components are signed 16-bit fixed point; the codec normalizes by
/// 32767 and reconstructs the scalar part when building the script-side
/// quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrientationSample {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

/// Payload of a controller update event.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControllerUpdate {
    pub orientation: OrientationSample,
    pub buttons: ControllerButtons,
}

/// One event read from a peripheral session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PeripheralEvent {
    Update(ControllerUpdate),
    Battery { millivolts: u16 },
    Disconnect,
}

/// A haptic pulse request in transport units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HapticPulse {
    pub motor: u16,
    pub on_time_us: u16,
    pub off_time_us: u16,
    pub count: u16,
}

/// An open connection to one physical controller.
///
/// Sessions are owned by exactly one peripheral proxy and close their
/// underlying device on drop. `read_event` must never block: it returns at
/// most one pending event per call.
pub trait PeripheralSession {
    fn serial(&self) -> &str;
    fn read_event(&mut self) -> Option<PeripheralEvent>;
    fn trigger_haptic(&mut self, pulse: HapticPulse) -> bool;
}

/// Enumerates currently attached controllers.
///
/// `scan` is called once per script load; each returned session becomes a
/// peripheral proxy bound to the freshly loaded script.
pub trait PeripheralDiscovery {
    fn scan(&mut self) -> Vec<Box<dyn PeripheralSession>>;
}

/// Discovery that never finds hardware. Default for headless setups.
#[derive(Default)]
pub struct NoPeripherals;

impl PeripheralDiscovery for NoPeripherals {
    fn scan(&mut self) -> Vec<Box<dyn PeripheralSession>> {
        Vec::new()
    }
}

/// Observable state behind a [`MockController`].
#[derive(Default)]
pub struct MockControllerState {
    pub events: VecDeque<PeripheralEvent>,
    pub haptic_pulses: Vec<HapticPulse>,
    pub closed: bool,
}

/// Deterministic in-memory controller used by tests and the simulator.
///
/// Events are replayed in the order they were staged; haptic requests and
/// session closure are recorded on the shared state so a test can observe
/// them after the session has been handed to the runtime.
pub struct MockController {
    serial: String,
    state: Rc<RefCell<MockControllerState>>,
}

impl MockController {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: Rc::new(RefCell::new(MockControllerState::default())),
        }
    }

    /// Shared view of the controller's state for later inspection.
    pub fn state(&self) -> Rc<RefCell<MockControllerState>> {
        Rc::clone(&self.state)
    }

    pub fn push_update(&self, orientation: OrientationSample, buttons: ControllerButtons) {
        self.state
            .borrow_mut()
            .events
            .push_back(PeripheralEvent::Update(ControllerUpdate { orientation, buttons }));
    }

    pub fn push_disconnect(&self) {
        self.state.borrow_mut().events.push_back(PeripheralEvent::Disconnect);
    }

    pub fn push_battery(&self, millivolts: u16) {
        self.state
            .borrow_mut()
            .events
            .push_back(PeripheralEvent::Battery { millivolts });
    }
}

impl PeripheralSession for MockController {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn read_event(&mut self) -> Option<PeripheralEvent> {
        self.state.borrow_mut().events.pop_front()
    }

    fn trigger_haptic(&mut self, pulse: HapticPulse) -> bool {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return false;
        }
        state.haptic_pulses.push(pulse);
        true
    }
}

impl Drop for MockController {
    fn drop(&mut self) {
        self.state.borrow_mut().closed = true;
    }
}

/// Discovery over staged mock controllers.
///
/// Each `scan` consumes one staged round, so a test can decide exactly
/// which controllers every load (and reload) will find.
#[derive(Default)]
pub struct MockDiscovery {
    rounds: VecDeque<Vec<MockController>>,
}

impl MockDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage_round(&mut self, controllers: Vec<MockController>) {
        self.rounds.push_back(controllers);
    }
}

impl PeripheralDiscovery for MockDiscovery {
    fn scan(&mut self) -> Vec<Box<dyn PeripheralSession>> {
        self.rounds
            .pop_front()
            .unwrap_or_default()
            .into_iter()
            .map(|c| Box::new(c) as Box<dyn PeripheralSession>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_replays_events_in_order_and_records_haptics() {
        let mut controller = MockController::new("MOCK-1");
        let state = controller.state();
        controller.push_update(OrientationSample { x: 1, y: 2, z: 3 }, ControllerButtons::A);
        controller.push_disconnect();

        assert!(matches!(
            controller.read_event(),
            Some(PeripheralEvent::Update(_))
        ));
        assert!(matches!(controller.read_event(), Some(PeripheralEvent::Disconnect)));
        assert!(controller.read_event().is_none(), "queue should be drained");

        let pulse = HapticPulse { motor: 0, on_time_us: 1000, off_time_us: 1000, count: 500 };
        assert!(controller.trigger_haptic(pulse));
        drop(controller);

        let state = state.borrow();
        assert_eq!(state.haptic_pulses, vec![pulse]);
        assert!(state.closed, "drop must close the session");
    }

    #[test]
    fn mock_discovery_hands_out_one_round_per_scan() {
        let mut discovery = MockDiscovery::new();
        discovery.stage_round(vec![MockController::new("A"), MockController::new("B")]);
        discovery.stage_round(vec![MockController::new("C")]);

        assert_eq!(discovery.scan().len(), 2);
        assert_eq!(discovery.scan().len(), 1);
        assert!(discovery.scan().is_empty(), "rounds exhausted");
    }
}
