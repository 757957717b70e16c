use std::collections::BTreeMap;

use log::{debug, info, warn};
use rhai::{Dynamic, Map};

use crate::bridge::{Caps, ScriptInstance};
use crate::codec;
use crate::error::Result;
use crate::handles::Handle;
use crate::peripheral::{ControllerButtons, HapticPulse, PeripheralEvent, PeripheralSession};

pub const TABLE_TRACKED_DEVICE: &str = "TrackedDeviceServerDriver";
pub const TABLE_DISPLAY: &str = "VRDisplayComponent";
pub const TABLE_CONTROLLER: &str = "SteamController";

// Rumble fires both motors with the transport's canonical pulse.
const RUMBLE_PULSE: HapticPulse = HapticPulse {
    motor: 0,
    on_time_us: 1000,
    off_time_us: 1000,
    count: 500,
};

/// The fixed set of interfaces a script may register handlers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterfaceId {
    TrackedDevice,
    Display,
    SteamController,
}

impl InterfaceId {
    pub const ALL: [InterfaceId; 3] =
        [InterfaceId::TrackedDevice, InterfaceId::Display, InterfaceId::SteamController];

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            TABLE_TRACKED_DEVICE => Some(InterfaceId::TrackedDevice),
            TABLE_DISPLAY => Some(InterfaceId::Display),
            TABLE_CONTROLLER => Some(InterfaceId::SteamController),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            InterfaceId::TrackedDevice => TABLE_TRACKED_DEVICE,
            InterfaceId::Display => TABLE_DISPLAY,
            InterfaceId::SteamController => TABLE_CONTROLLER,
        }
    }

    /// Peripheral interfaces dispatch through per-device proxies instead of
    /// table-level lifecycle callbacks.
    pub fn is_peripheral(self) -> bool {
        matches!(self, InterfaceId::SteamController)
    }
}

/// Methods a controller handler table is expected to provide. Omissions are
/// logged at instantiation, not treated as failures.
const REQUIRED_PROXY_CAPS: Caps = Caps::CREATE
    .union(Caps::ON_INIT)
    .union(Caps::ON_SHUTDOWN)
    .union(Caps::ON_CONNECT)
    .union(Caps::ON_DISCONNECT)
    .union(Caps::ON_UPDATE)
    .union(Caps::GET_CONTROLLER_HANDLE);

/// A handler registration queued by the script's `register_handler` call.
/// Adopted by the registry once the current dispatch pass has unwound.
pub struct PendingRegistration {
    pub token: i64,
    pub interface: String,
    pub table: Dynamic,
}

/// An adopted handler table plus its capability set.
pub struct InterfaceSlot {
    pub handle: Handle,
    pub caps: Caps,
}

/// One connected controller bound to the current script instance.
///
/// Owns the hardware session (closed when the session drops) and the script
/// binding: the handler's method table, the pinned instance returned by
/// `Create`, and the capability set. Both halves die together at unload.
///
/// The proxy pins the method table independently of the registry slot, so a
/// handler re-registered mid-session replaces future instantiations without
/// cutting off proxies already bound to the old table. Methods are always
/// looked up on the table; the instance is the receiver argument.
pub struct PeripheralProxy {
    session: Option<Box<dyn PeripheralSession>>,
    serial: String,
    table: Handle,
    instance: Handle,
    caps: Caps,
    device_token: i64,
    alive: bool,
}

impl PeripheralProxy {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn device_token(&self) -> i64 {
        self.device_token
    }
}

/// Maps interface names to handler tables and owns the peripheral proxies.
#[derive(Default)]
pub struct HandlerRegistry {
    interfaces: BTreeMap<InterfaceId, InterfaceSlot>,
    proxies: Vec<PeripheralProxy>,
    next_device_token: i64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { interfaces: BTreeMap::new(), proxies: Vec::new(), next_device_token: 1 }
    }

    pub fn interface(&self, id: InterfaceId) -> Option<&InterfaceSlot> {
        self.interfaces.get(&id)
    }

    pub fn proxies(&self) -> &[PeripheralProxy] {
        &self.proxies
    }

    pub fn live_proxies(&self) -> usize {
        self.proxies.iter().filter(|p| p.alive).count()
    }

    /// Adopt a handler table for an interface. A replacement releases the
    /// superseded table's handle instead of leaking it.
    pub fn adopt(&mut self, instance: &mut ScriptInstance, id: InterfaceId, table: Dynamic) {
        let caps = Caps::scan(&table);
        let handle = instance.pin(table);
        info!("[handlers] registered {} ({:?})", id.wire_name(), caps);
        if let Some(old) = self.interfaces.insert(id, InterfaceSlot { handle, caps }) {
            debug!("[handlers] released superseded {} registration", id.wire_name());
            instance.release(old.handle);
        }
    }

    /// Adopt queued registrations from the load phase. Entries with a stale
    /// token, an unknown interface name, or a non-map table are dropped
    /// with a warning.
    pub fn adopt_pending(
        &mut self,
        instance: &mut ScriptInstance,
        pending: Vec<PendingRegistration>,
        current_token: i64,
    ) {
        for registration in pending {
            if registration.token != current_token {
                warn!(
                    "[handlers] ignoring registration for {} with stale driver token {}",
                    registration.interface, registration.token
                );
                continue;
            }
            let Some(id) = InterfaceId::from_wire(&registration.interface) else {
                warn!("[handlers] ignoring registration for unknown interface {}", registration.interface);
                continue;
            };
            if !registration.table.is::<Map>() {
                warn!("[handlers] ignoring {} registration: not a table", registration.interface);
                continue;
            }
            self.adopt(instance, id, registration.table);
        }
    }

    /// Call `OnInit` on every registered non-peripheral interface table, in
    /// interface order. Script errors degrade to warnings.
    pub fn init_interfaces(&mut self, instance: &mut ScriptInstance) {
        for (id, slot) in &self.interfaces {
            if id.is_peripheral() || !slot.caps.contains(Caps::ON_INIT) {
                continue;
            }
            if instance.poisoned() {
                break;
            }
            let Ok(table) = instance.resolve(slot.handle) else { continue };
            instance.push(table.clone());
            if let Err(err) = instance.invoke(&table, id.wire_name(), "OnInit", 1, 0) {
                warn!("[handlers] {}.OnInit failed: {}", id.wire_name(), err);
            }
        }
    }

    /// Bind discovered controller sessions to the registered handler.
    pub fn instantiate_all(
        &mut self,
        instance: &mut ScriptInstance,
        sessions: Vec<Box<dyn PeripheralSession>>,
    ) {
        for session in sessions {
            if instance.poisoned() {
                break;
            }
            if let Err(err) = self.instantiate(instance, session) {
                warn!("[handlers] proxy creation failed: {}", err);
            }
        }
    }

    fn instantiate(
        &mut self,
        instance: &mut ScriptInstance,
        session: Box<dyn PeripheralSession>,
    ) -> Result<()> {
        let serial = session.serial().to_string();
        let Some(slot) = self.interfaces.get(&InterfaceId::SteamController) else {
            info!("[handlers] no {} handler registered; ignoring device {}", TABLE_CONTROLLER, serial);
            return Ok(());
        };
        let caps = slot.caps;
        let table_handle = slot.handle;

        let missing = REQUIRED_PROXY_CAPS.difference(caps);
        if !missing.is_empty() {
            warn!("[handlers] {} handler for {} is missing methods: {:?}", TABLE_CONTROLLER, serial, missing);
        }
        if !caps.contains(Caps::CREATE) {
            warn!("[handlers] cannot bind device {}: handler has no Create", serial);
            return Ok(());
        }

        let table = instance.resolve(table_handle)?;
        instance.push(table.clone());
        instance.invoke(&table, TABLE_CONTROLLER, "Create", 1, 1)?;
        let created = instance.pop()?;
        if !created.is::<Map>() {
            warn!("[handlers] {}.Create for {} returned {}, not a map; device ignored",
                TABLE_CONTROLLER, serial, created.type_name());
            return Ok(());
        }

        let instance_handle = instance.pin(created);
        let proxy_table = instance.pin(table.clone());
        let device_token = self.next_device_token;
        self.next_device_token += 1;

        if caps.contains(Caps::ON_INIT) {
            let me = instance.resolve(instance_handle)?;
            instance.push(me);
            if let Err(err) = instance.invoke(&table, TABLE_CONTROLLER, "OnInit", 1, 0) {
                warn!("[handlers] {}.OnInit for {} failed: {}", TABLE_CONTROLLER, serial, err);
            }
        }
        if caps.contains(Caps::ON_CONNECT) && !instance.poisoned() {
            let me = instance.resolve(instance_handle)?;
            instance.push(me);
            instance.push(Dynamic::from_int(device_token));
            if let Err(err) = instance.invoke(&table, TABLE_CONTROLLER, "OnConnect", 2, 0) {
                warn!("[handlers] {}.OnConnect for {} failed: {}", TABLE_CONTROLLER, serial, err);
            }
        }

        info!("[handlers] bound controller {} as device {}", serial, device_token);
        self.proxies.push(PeripheralProxy {
            session: Some(session),
            serial,
            table: proxy_table,
            instance: instance_handle,
            caps,
            device_token,
            alive: true,
        });
        Ok(())
    }

    /// Pump at most one transport event per live proxy.
    ///
    /// Home-button updates raise a reload request instead of being
    /// forwarded. Returns true when a reload was requested.
    pub fn pump_events(&mut self, instance: &mut ScriptInstance) -> bool {
        let mut reload_requested = false;
        for proxy in &mut self.proxies {
            if !proxy.alive || instance.poisoned() {
                continue;
            }
            let Some(session) = proxy.session.as_mut() else { continue };
            let Some(event) = session.read_event() else { continue };
            match event {
                PeripheralEvent::Update(update) => {
                    if update.buttons.contains(ControllerButtons::HOME) {
                        info!("[handlers] reload requested from controller {}", proxy.serial);
                        reload_requested = true;
                        continue;
                    }
                    if !proxy.caps.contains(Caps::ON_UPDATE) {
                        continue;
                    }
                    let (table, me) = match (instance.resolve(proxy.table), instance.resolve(proxy.instance)) {
                        (Ok(table), Ok(me)) => (table, me),
                        _ => {
                            warn!("[handlers] proxy {} lost its script binding; dropping events", proxy.serial);
                            proxy.alive = false;
                            continue;
                        }
                    };
                    instance.push(me);
                    instance.push(codec::encode_controller_update(update));
                    if let Err(err) = instance.invoke(&table, TABLE_CONTROLLER, "OnUpdate", 2, 0) {
                        warn!("[handlers] {}.OnUpdate failed: {}", TABLE_CONTROLLER, err);
                    }
                }
                PeripheralEvent::Battery { millivolts } => {
                    debug!("[handlers] controller {} battery {} mV", proxy.serial, millivolts);
                }
                PeripheralEvent::Disconnect => {
                    info!("[handlers] controller {} disconnected", proxy.serial);
                    proxy.session = None;
                    proxy.alive = false;
                    if proxy.caps.contains(Caps::ON_DISCONNECT) {
                        if let (Ok(table), Ok(me)) =
                            (instance.resolve(proxy.table), instance.resolve(proxy.instance))
                        {
                            instance.push(me);
                            if let Err(err) =
                                instance.invoke(&table, TABLE_CONTROLLER, "OnDisconnect", 1, 0)
                            {
                                warn!("[handlers] {}.OnDisconnect failed: {}", TABLE_CONTROLLER, err);
                            }
                        }
                    }
                }
            }
        }
        reload_requested
    }

    /// Route queued haptic requests to their sessions. Both motors fire,
    /// the way the transport's rumble has always worked.
    pub fn trigger_haptics(&mut self, device_tokens: Vec<i64>) {
        for token in device_tokens {
            let Some(proxy) = self.proxies.iter_mut().find(|p| p.device_token == token) else {
                warn!("[handlers] haptic request for unknown device {}", token);
                continue;
            };
            let Some(session) = proxy.session.as_mut() else {
                debug!("[handlers] haptic request for disconnected device {}", token);
                continue;
            };
            session.trigger_haptic(RUMBLE_PULSE);
            session.trigger_haptic(HapticPulse { motor: 1, ..RUMBLE_PULSE });
        }
    }

    /// Run shutdown callbacks: every proxy instance first, then every
    /// non-peripheral interface table, in interface order. Each fires at
    /// most once; errors degrade to warnings.
    pub fn shutdown(&mut self, instance: &mut ScriptInstance) {
        for proxy in &mut self.proxies {
            if instance.poisoned() {
                break;
            }
            if !proxy.caps.contains(Caps::ON_SHUTDOWN) {
                continue;
            }
            let (Ok(table), Ok(me)) =
                (instance.resolve(proxy.table), instance.resolve(proxy.instance))
            else {
                continue;
            };
            instance.push(me);
            if let Err(err) = instance.invoke(&table, TABLE_CONTROLLER, "OnShutdown", 1, 0) {
                warn!("[handlers] {}.OnShutdown failed: {}", TABLE_CONTROLLER, err);
            }
        }
        for (id, slot) in &self.interfaces {
            if id.is_peripheral() || !slot.caps.contains(Caps::ON_SHUTDOWN) {
                continue;
            }
            if instance.poisoned() {
                break;
            }
            let Ok(table) = instance.resolve(slot.handle) else { continue };
            instance.push(table.clone());
            if let Err(err) = instance.invoke(&table, id.wire_name(), "OnShutdown", 1, 0) {
                warn!("[handlers] {}.OnShutdown failed: {}", id.wire_name(), err);
            }
        }
    }

    /// Release every handle and destroy every proxy. Sessions close as they
    /// drop. Safe to call repeatedly.
    pub fn clear(&mut self, instance: &mut ScriptInstance) {
        for proxy in self.proxies.drain(..) {
            instance.release(proxy.instance);
            instance.release(proxy.table);
        }
        for (_, slot) in std::mem::take(&mut self.interfaces) {
            instance.release(slot.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::{Engine, Scope};

    fn empty_instance() -> ScriptInstance {
        let engine = Engine::new();
        let ast = engine.compile("").expect("compile");
        ScriptInstance::new(engine, ast, Scope::new(), 0)
    }

    fn table_with_method(method: &str) -> Dynamic {
        let mut map = Map::new();
        map.insert(method.into(), Dynamic::from(rhai::FnPtr::new("noop").expect("fn name")));
        Dynamic::from_map(map)
    }

    #[test]
    fn interface_ids_round_trip_their_wire_names() {
        for id in InterfaceId::ALL {
            assert_eq!(InterfaceId::from_wire(id.wire_name()), Some(id));
        }
        assert_eq!(InterfaceId::from_wire("NotAnInterface"), None);
        assert!(InterfaceId::SteamController.is_peripheral());
        assert!(!InterfaceId::TrackedDevice.is_peripheral());
    }

    #[test]
    fn adopting_twice_keeps_one_registration_and_releases_the_old_handle() {
        let mut instance = empty_instance();
        let mut registry = HandlerRegistry::new();

        registry.adopt(&mut instance, InterfaceId::SteamController, table_with_method("Create"));
        let first = registry.interface(InterfaceId::SteamController).expect("slot").handle;
        assert_eq!(instance.live_handles(), 1);

        registry.adopt(&mut instance, InterfaceId::SteamController, table_with_method("OnUpdate"));
        let second = registry.interface(InterfaceId::SteamController).expect("slot").handle;
        assert_ne!(first, second);
        assert_eq!(instance.live_handles(), 1, "superseded handle must be released");
        assert!(instance.resolve(first).is_err(), "old registration handle must be stale");
        assert!(registry.interface(InterfaceId::SteamController).expect("slot").caps
            .contains(Caps::ON_UPDATE));
    }

    #[test]
    fn pending_registrations_filter_stale_tokens_and_junk() {
        let mut instance = empty_instance();
        let mut registry = HandlerRegistry::new();

        let pending = vec![
            PendingRegistration {
                token: 1,
                interface: TABLE_CONTROLLER.to_string(),
                table: table_with_method("Create"),
            },
            PendingRegistration {
                token: 7,
                interface: TABLE_TRACKED_DEVICE.to_string(),
                table: table_with_method("GetPose"),
            },
            PendingRegistration {
                token: 1,
                interface: "SomethingElse".to_string(),
                table: table_with_method("Create"),
            },
            PendingRegistration {
                token: 1,
                interface: TABLE_DISPLAY.to_string(),
                table: Dynamic::from_int(3),
            },
        ];
        registry.adopt_pending(&mut instance, pending, 1);

        assert!(registry.interface(InterfaceId::SteamController).is_some());
        assert!(registry.interface(InterfaceId::TrackedDevice).is_none(), "stale token ignored");
        assert!(registry.interface(InterfaceId::Display).is_none(), "non-map table ignored");
        assert_eq!(instance.live_handles(), 1);
    }

    #[test]
    fn clear_releases_everything_and_is_repeatable() {
        let mut instance = empty_instance();
        let mut registry = HandlerRegistry::new();
        registry.adopt(&mut instance, InterfaceId::TrackedDevice, table_with_method("GetPose"));
        registry.adopt(&mut instance, InterfaceId::Display, table_with_method("GetWindowBounds"));
        assert_eq!(instance.live_handles(), 2);

        registry.clear(&mut instance);
        assert_eq!(instance.live_handles(), 0);
        assert!(registry.interface(InterfaceId::TrackedDevice).is_none());

        registry.clear(&mut instance);
        assert_eq!(instance.live_handles(), 0);
    }
}
