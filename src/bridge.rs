use bitflags::bitflags;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Map, Scope, AST};
use smallvec::SmallVec;

use crate::error::{BridgeError, Result};
use crate::handles::{Handle, HandleArena};

bitflags! {
    /// Which well-known methods a registered handler table actually
    /// provides. Computed once when the table is adopted, so per-callback
    /// dispatch is a bit test instead of a map probe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Caps: u32 {
        const CREATE = 1 << 0;
        const ON_INIT = 1 << 1;
        const ON_SHUTDOWN = 1 << 2;
        const ACTIVATE = 1 << 3;
        const DEACTIVATE = 1 << 4;
        const ENTER_STANDBY = 1 << 5;
        const GET_POSE = 1 << 6;
        const RUN_FRAME = 1 << 7;
        const GET_WINDOW_BOUNDS = 1 << 8;
        const GET_RENDER_TARGET_SIZE = 1 << 9;
        const GET_EYE_VIEWPORT = 1 << 10;
        const ON_CONNECT = 1 << 11;
        const ON_DISCONNECT = 1 << 12;
        const ON_UPDATE = 1 << 13;
        const GET_CONTROLLER_HANDLE = 1 << 14;
    }
}

impl Caps {
    pub fn for_method(name: &str) -> Option<Caps> {
        Some(match name {
            "Create" => Caps::CREATE,
            "OnInit" => Caps::ON_INIT,
            "OnShutdown" => Caps::ON_SHUTDOWN,
            "Activate" => Caps::ACTIVATE,
            "Deactivate" => Caps::DEACTIVATE,
            "EnterStandby" => Caps::ENTER_STANDBY,
            "GetPose" => Caps::GET_POSE,
            "RunFrame" => Caps::RUN_FRAME,
            "GetWindowBounds" => Caps::GET_WINDOW_BOUNDS,
            "GetRecommendedRenderTargetSize" => Caps::GET_RENDER_TARGET_SIZE,
            "GetEyeOutputViewport" => Caps::GET_EYE_VIEWPORT,
            "OnConnect" => Caps::ON_CONNECT,
            "OnDisconnect" => Caps::ON_DISCONNECT,
            "OnUpdate" => Caps::ON_UPDATE,
            "GetControllerHandle" => Caps::GET_CONTROLLER_HANDLE,
            _ => return None,
        })
    }

    /// Scan a method table and record every well-known method that is
    /// present as a callable value.
    pub fn scan(table: &Dynamic) -> Caps {
        let mut caps = Caps::empty();
        if let Some(map) = table.read_lock::<Map>() {
            for (key, value) in map.iter() {
                if let Some(bit) = Caps::for_method(key.as_str()) {
                    if value.is::<FnPtr>() {
                        caps |= bit;
                    }
                }
            }
        }
        caps
    }
}

/// Staging stack for arguments and results crossing the script boundary.
///
/// Every encode pushes exactly one value and every decode consumes exactly
/// one, so any balanced call sequence leaves the stack at its entry depth.
/// The facade asserts emptiness after each host callback.
#[derive(Default)]
pub struct ValueStack {
    values: SmallVec<[Dynamic; 8]>,
}

impl ValueStack {
    pub fn push(&mut self, value: Dynamic) {
        self.values.push(value);
    }

    pub fn pop(&mut self) -> Result<Dynamic> {
        self.values.pop().ok_or(BridgeError::StackUnderflow)
    }

    /// Pop `n` values, returned in push order (bottom first).
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Dynamic>> {
        let at = self.values.len().checked_sub(n).ok_or(BridgeError::StackUnderflow)?;
        Ok(self.values.drain(at..).collect())
    }

    pub fn depth(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// One loaded script: engine, compiled AST, top-level scope, the handle
/// arena, and the staging stack. Owned exclusively by the runtime and
/// destroyed wholesale on unload, which is what makes every outstanding
/// handle die with it.
pub struct ScriptInstance {
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
    arena: HandleArena,
    stack: ValueStack,
    poisoned: bool,
}

impl ScriptInstance {
    /// `handle_generation` seeds the handle arena; the runtime passes the
    /// per-load driver token so handles from earlier instances stay stale.
    pub fn new(engine: Engine, ast: AST, scope: Scope<'static>, handle_generation: u32) -> Self {
        Self {
            engine,
            ast,
            scope,
            arena: HandleArena::with_generation(handle_generation),
            stack: ValueStack::default(),
            poisoned: false,
        }
    }

    /// True once a fatal fault has been observed. A poisoned instance
    /// refuses further calls until the runtime unloads it.
    pub fn poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn pin(&mut self, value: Dynamic) -> Handle {
        self.arena.pin(value)
    }

    pub fn resolve(&self, handle: Handle) -> Result<Dynamic> {
        self.arena.get(handle).ok_or(BridgeError::StaleHandle(handle))
    }

    pub fn release(&mut self, handle: Handle) {
        self.arena.release(handle);
    }

    pub fn live_handles(&self) -> usize {
        self.arena.live()
    }

    /// Fetch a top-level table by name as a shared value, so the pinned
    /// alias and the storage the script's closures mutate stay the same
    /// object. A table is already shared once any closure captures it; a
    /// plain entry is converted and written back in place (constants are
    /// left as they are). Returns `None` when the global is absent or not
    /// a map.
    pub fn global_table(&mut self, name: &str) -> Option<Dynamic> {
        // Scope::get_value flatten-clones shared entries; fetch by
        // reference so the shared wrapper survives.
        let value = self.scope.get(name)?.clone();
        if !value.is::<Map>() {
            return None;
        }
        if value.is_shared() {
            return Some(value);
        }
        let shared = value.into_shared();
        // get_mut refuses constants, which must not be reassigned.
        if let Some(slot) = self.scope.get_mut(name) {
            *slot = shared.clone();
        }
        Some(shared)
    }

    pub fn push(&mut self, value: Dynamic) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Dynamic> {
        self.stack.pop()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn stack_is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub(crate) fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Call `table.method` with `nargs` staged values (receiver included)
    /// and stage `nresults` (0 or 1) results.
    ///
    /// The staged arguments are consumed in every outcome, so an erroring
    /// call still leaves the stack at its pre-stage depth. Nothing is
    /// staged back on error; callers substitute their defaults instead of
    /// popping.
    pub fn invoke(
        &mut self,
        table: &Dynamic,
        interface: &'static str,
        method: &'static str,
        nargs: usize,
        nresults: usize,
    ) -> Result<()> {
        let args = self.stack.pop_n(nargs)?;
        if self.poisoned {
            return Err(BridgeError::Poisoned);
        }
        let map = table
            .read_lock::<Map>()
            .ok_or(BridgeError::NotATable { interface })?;
        let fn_ptr = map
            .get(method)
            .and_then(|v| v.clone().try_cast::<FnPtr>())
            .ok_or(BridgeError::MissingMethod { interface, method })?;
        drop(map);

        match fn_ptr.call::<Dynamic>(&self.engine, &self.ast, args) {
            Ok(value) => {
                if nresults > 0 {
                    self.stack.push(value);
                }
                Ok(())
            }
            Err(err) => Err(self.classify(err)),
        }
    }

    /// Call a global script function, tolerating its absence.
    ///
    /// Returns `Ok(true)` when the function ran, `Ok(false)` when the
    /// script does not define it.
    pub fn call_global(&mut self, name: &str, args: Vec<Dynamic>) -> Result<bool> {
        if self.poisoned {
            return Err(BridgeError::Poisoned);
        }
        let fn_ptr = FnPtr::new(name).map_err(|e| BridgeError::Eval(e.to_string()))?;
        match fn_ptr.call::<Dynamic>(&self.engine, &self.ast, args) {
            Ok(_) => Ok(true),
            Err(err) => match err.as_ref() {
                EvalAltResult::ErrorFunctionNotFound(sig, _) if sig.starts_with(name) => Ok(false),
                _ => Err(self.classify(err)),
            },
        }
    }

    fn classify(&mut self, err: Box<EvalAltResult>) -> BridgeError {
        let classified = classify_eval_error(err);
        if classified.is_fatal() {
            self.poisoned = true;
        }
        classified
    }
}

/// Split script faults into fatal (terminated by the operation budget, or a
/// system error) and recoverable evaluation errors.
pub(crate) fn classify_eval_error(err: Box<EvalAltResult>) -> BridgeError {
    match *err {
        EvalAltResult::ErrorTerminated(token, _) => BridgeError::Fatal(token.to_string()),
        EvalAltResult::ErrorSystem(message, source) => {
            BridgeError::Fatal(format!("{}: {}", message, source))
        }
        other => BridgeError::Eval(other.to_string()),
    }
}
