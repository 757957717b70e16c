use rhai::Dynamic;

/// Opaque reference to a value pinned inside the script instance.
///
/// A handle is an index plus the generation the slot had when the value was
/// pinned, so a handle kept across a release (or across an instance reload,
/// where the whole arena is rebuilt) can never read someone else's value:
/// it just resolves to nothing.
///
/// Two sentinels never touch the arena: `NONE` means "no reference was ever
/// taken", `NIL` means "a reference was taken but the value was nil". Both
/// resolve to nothing and are ignored by `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub const NONE: Handle = Handle { index: u32::MAX, generation: 0 };
    pub const NIL: Handle = Handle { index: u32::MAX, generation: 1 };

    pub fn is_sentinel(self) -> bool {
        self.index == u32::MAX
    }

    pub fn is_none(self) -> bool {
        self == Handle::NONE
    }

    pub fn is_nil(self) -> bool {
        self == Handle::NIL
    }
}

struct Slot {
    generation: u32,
    value: Option<Dynamic>,
}

/// Pin table for script values referenced from native code.
///
/// Pinned values are converted to shared values, so every `get` returns an
/// alias of the same underlying object and script-side mutation through any
/// alias is visible through all of them. The arena is owned by the script
/// instance and drops with it; handles held elsewhere simply go stale.
/// Each instance seeds its arena with a distinct generation base and slots
/// are never reused within an instance, so every live slot carries exactly
/// the base generation and a handle minted by any other instance never
/// resolves, even when slot indices line up.
#[derive(Default)]
pub struct HandleArena {
    slots: Vec<Slot>,
    live: usize,
    base_generation: u32,
}

impl HandleArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_generation(base: u32) -> Self {
        Self { base_generation: base, ..Self::default() }
    }

    /// Pin a value and return a handle to it. Unit values are not stored;
    /// they pin as `Handle::NIL`.
    pub fn pin(&mut self, value: Dynamic) -> Handle {
        if value.is_unit() {
            return Handle::NIL;
        }
        let value = if value.is_shared() { value } else { value.into_shared() };
        self.live += 1;
        let index = self.slots.len() as u32;
        let generation = self.base_generation;
        self.slots.push(Slot { generation, value: Some(value) });
        Handle { index, generation }
    }

    /// Resolve a handle to an alias of the pinned value. Sentinels, stale
    /// generations, and released slots all yield `None`.
    pub fn get(&self, handle: Handle) -> Option<Dynamic> {
        if handle.is_sentinel() {
            return None;
        }
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.clone()
    }

    /// Release a pinned value. Idempotent; sentinels and stale handles are
    /// ignored. The slot stays retired for the rest of the instance's life.
    pub fn release(&mut self, handle: Handle) {
        if handle.is_sentinel() {
            return;
        }
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return;
        };
        if slot.generation != handle.generation {
            return;
        }
        if slot.value.take().is_some() {
            slot.generation = slot.generation.wrapping_add(1);
            self.live -= 1;
        }
    }

    /// Number of currently pinned values.
    pub fn live(&self) -> usize {
        self.live
    }
}
