use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::SystemTime;

use log::{debug, info, warn};
use rhai::{Dynamic, Engine, Scope};

use crate::bridge::{classify_eval_error, ScriptInstance};
use crate::error::{BridgeError, Result};
use crate::handlers::{HandlerRegistry, InterfaceId, PendingRegistration};
use crate::peripheral::PeripheralDiscovery;

/// Lifecycle of the embedded script.
///
/// `Loading` and `Reloading` are transient; the runtime always settles in
/// `Loaded` (on success) or `Unloaded` (on failure) before returning to the
/// host. Activation state is driven by the facade on top of `Loaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Unloaded,
    Loading,
    Loaded,
    Activated,
    Standby,
    Reloading,
}

/// Actions a script requests through native bindings mid-dispatch. They are
/// queued here and applied only after the current pass has unwound, so a
/// handler can never mutate the registry that is dispatching it.
#[derive(Default)]
struct PendingActions {
    registrations: Vec<PendingRegistration>,
    haptics: Vec<i64>,
}

/// Owns the script instance and drives load, unload, and reload.
pub struct ScriptRuntime {
    script_path: PathBuf,
    ops_budget: u64,
    state: RuntimeState,
    instance: Option<ScriptInstance>,
    pending: Rc<RefCell<PendingActions>>,
    logs: Rc<RefCell<Vec<String>>>,
    token: i64,
    last_modified: Option<SystemTime>,
    reload_requested: bool,
}

impl ScriptRuntime {
    pub fn new(script_path: PathBuf, ops_budget: u64) -> Self {
        Self {
            script_path,
            ops_budget,
            state: RuntimeState::Unloaded,
            instance: None,
            pending: Rc::new(RefCell::new(PendingActions::default())),
            logs: Rc::new(RefCell::new(Vec::new())),
            token: 0,
            last_modified: None,
            reload_requested: false,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.instance.is_some()
    }

    pub fn token(&self) -> i64 {
        self.token
    }

    pub fn instance_mut(&mut self) -> Option<&mut ScriptInstance> {
        self.instance.as_mut()
    }

    pub fn instance(&self) -> Option<&ScriptInstance> {
        self.instance.as_ref()
    }

    pub fn poisoned(&self) -> bool {
        self.instance.as_ref().map_or(false, |i| i.poisoned())
    }

    /// Messages the script emitted through `driver_log` since the last call.
    pub fn take_logs(&mut self) -> Vec<String> {
        self.logs.borrow_mut().drain(..).collect()
    }

    pub fn request_reload(&mut self, why: &str) {
        if !self.reload_requested {
            info!("[runtime] reload requested: {}", why);
        }
        self.reload_requested = true;
    }

    pub fn take_reload_request(&mut self) -> bool {
        std::mem::take(&mut self.reload_requested)
    }

    /// Poll the script file's mtime. True when it changed since the last
    /// load or poll.
    pub fn script_file_changed(&mut self) -> bool {
        let Some(modified) = fs::metadata(&self.script_path).ok().and_then(|m| m.modified().ok())
        else {
            return false;
        };
        match self.last_modified {
            Some(previous) if modified != previous => {
                self.last_modified = Some(modified);
                true
            }
            Some(_) => false,
            None => {
                self.last_modified = Some(modified);
                false
            }
        }
    }

    pub fn drain_haptic_requests(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.pending.borrow_mut().haptics)
    }

    /// Registrations queued outside a load phase never take effect; drop
    /// them with a warning so script authors can see the mistake.
    pub fn discard_stale_registrations(&mut self) {
        let stale = std::mem::take(&mut self.pending.borrow_mut().registrations);
        for registration in stale {
            warn!(
                "[runtime] ignoring {} registration made outside the load phase",
                registration.interface
            );
        }
    }

    pub fn mark_activated(&mut self) {
        if self.instance.is_some() {
            self.state = RuntimeState::Activated;
        }
    }

    pub fn mark_standby(&mut self) {
        if self.state == RuntimeState::Activated {
            self.state = RuntimeState::Standby;
        }
    }

    pub fn mark_deactivated(&mut self) {
        if self.instance.is_some() {
            self.state = RuntimeState::Loaded;
        }
    }

    /// Load the configured script into a fresh instance.
    ///
    /// On success the runtime is `Loaded`: handler tables are adopted (well
    /// known globals first, then explicit registrations, which win),
    /// interface `OnInit` hooks have run, and discovered controllers are
    /// bound. On any failure before that point the instance is discarded
    /// and the runtime stays `Unloaded`; the host keeps running either way.
    pub fn load(
        &mut self,
        handlers: &mut HandlerRegistry,
        discovery: &mut dyn PeripheralDiscovery,
    ) -> Result<()> {
        if self.instance.is_some() {
            self.unload(handlers);
        }
        self.state = RuntimeState::Loading;
        let path_text = self.script_path.display().to_string();
        info!("[runtime] loading script {}", path_text);

        self.token = self.token.wrapping_add(1);
        let token = self.token;

        let source = match fs::read_to_string(&self.script_path) {
            Ok(source) => source,
            Err(err) => {
                return Err(self.fail_load(BridgeError::Read { path: path_text, source: err }))
            }
        };

        let engine = self.build_engine();
        let mut scope = Scope::new();
        scope.push_constant("DRIVER_TOKEN", token);

        let ast = match engine.compile(&source) {
            Ok(ast) => ast,
            Err(err) => {
                return Err(self.fail_load(BridgeError::Compile {
                    path: path_text,
                    message: err.to_string(),
                }))
            }
        };
        if let Err(err) = engine.run_ast_with_scope(&mut scope, &ast) {
            return Err(self.fail_load(classify_eval_error(err)));
        }

        let mut instance = ScriptInstance::new(engine, ast, scope, token as u32);

        // Well-known global tables seed the registry; explicit
        // register_handler calls adopted below replace them.
        for id in InterfaceId::ALL {
            if let Some(table) = instance.global_table(id.wire_name()) {
                handlers.adopt(&mut instance, id, table);
            }
        }

        match instance.call_global("register_handlers", vec![Dynamic::from_int(token)]) {
            Ok(true) => debug!("[runtime] register_handlers completed"),
            Ok(false) => debug!("[runtime] script defines no register_handlers"),
            Err(err) => {
                handlers.clear(&mut instance);
                return Err(self.fail_load(err));
            }
        }

        let queued = std::mem::take(&mut self.pending.borrow_mut().registrations);
        handlers.adopt_pending(&mut instance, queued, token);

        handlers.init_interfaces(&mut instance);
        handlers.instantiate_all(&mut instance, discovery.scan());

        self.last_modified =
            fs::metadata(&self.script_path).ok().and_then(|m| m.modified().ok());
        self.instance = Some(instance);
        self.state = RuntimeState::Loaded;
        info!("[runtime] script loaded (driver token {})", token);
        Ok(())
    }

    /// Tear the current instance down. Idempotent; a second call is a
    /// silent no-op, so shutdown callbacks fire at most once.
    pub fn unload(&mut self, handlers: &mut HandlerRegistry) {
        let Some(mut instance) = self.instance.take() else {
            self.state = RuntimeState::Unloaded;
            return;
        };
        info!("[runtime] unloading script");
        if instance.poisoned() {
            warn!("[runtime] instance is poisoned; skipping shutdown callbacks");
        } else {
            handlers.shutdown(&mut instance);
        }
        handlers.clear(&mut instance);
        {
            let mut pending = self.pending.borrow_mut();
            pending.registrations.clear();
            pending.haptics.clear();
        }
        self.reload_requested = false;
        self.state = RuntimeState::Unloaded;
    }

    /// Unload then load. Always lands in `Loaded` (or `Unloaded` on
    /// failure); the host re-activates on its own schedule.
    pub fn reload(
        &mut self,
        handlers: &mut HandlerRegistry,
        discovery: &mut dyn PeripheralDiscovery,
    ) -> Result<()> {
        info!("[runtime] reloading script");
        self.state = RuntimeState::Reloading;
        self.unload(handlers);
        self.load(handlers, discovery)
    }

    fn fail_load(&mut self, err: BridgeError) -> BridgeError {
        let mut pending = self.pending.borrow_mut();
        pending.registrations.clear();
        pending.haptics.clear();
        drop(pending);
        self.state = RuntimeState::Unloaded;
        warn!("[runtime] load failed: {}", err);
        err
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);

        if self.ops_budget > 0 {
            let budget = self.ops_budget;
            engine.on_progress(move |ops| {
                if ops > budget {
                    Some("operation budget exceeded".into())
                } else {
                    None
                }
            });
        }

        let logs = Rc::clone(&self.logs);
        engine.register_fn("driver_log", move |message: Dynamic| {
            let line = message.to_string();
            info!("[script] {}", line);
            logs.borrow_mut().push(line);
        });

        let pending = Rc::clone(&self.pending);
        engine.register_fn("register_handler", move |token: i64, interface: &str, table: Dynamic| {
            pending.borrow_mut().registrations.push(PendingRegistration {
                token,
                interface: interface.to_string(),
                table,
            });
        });

        let pending = Rc::clone(&self.pending);
        engine.register_fn("trigger_haptic", move |device: i64| {
            pending.borrow_mut().haptics.push(device);
        });

        engine
    }
}
