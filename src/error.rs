use thiserror::Error;

/// Errors produced by the script bridge.
///
/// None of these are allowed to escape into the host process as a panic;
/// the facade maps them to logged warnings plus type-level defaults, and
/// only `Fatal` changes runtime state (it poisons the instance until the
/// next unload).
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to read script '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compile script '{path}': {message}")]
    Compile { path: String, message: String },

    #[error("script evaluation failed: {0}")]
    Eval(String),

    #[error("fatal script fault: {0}")]
    Fatal(String),

    #[error("no script is loaded")]
    NotLoaded,

    #[error("script instance is poisoned after a fatal fault")]
    Poisoned,

    #[error("handle {0:?} is stale or unset")]
    StaleHandle(crate::handles::Handle),

    #[error("'{interface}' registration is not a map")]
    NotATable { interface: &'static str },

    #[error("'{interface}' has no method '{method}'")]
    MissingMethod {
        interface: &'static str,
        method: &'static str,
    },

    #[error("could not decode {what}: {detail}")]
    Decode {
        what: &'static str,
        detail: String,
    },

    #[error("value stack underflow")]
    StackUnderflow,
}

impl BridgeError {
    /// Fatal faults poison the instance; everything else is recoverable
    /// per call.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Fatal(_) | BridgeError::Poisoned)
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
