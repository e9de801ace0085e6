use thiserror::Error;

use crate::values::RemoteObjectId;

pub type HostResult<T> = Result<T, HostError>;

#[derive(Error, Debug)]
pub enum HostError {
    /// The debug target could not be reached at all. Fatal.
    #[error("cannot connect to the debug target at {addr}: {source}. \
             Make sure the target was started with \
             -agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address=<port>")]
    Connect {
        addr: String,
        #[source]
        source: tern_jdwp::JdwpError,
    },

    #[error("jdwp: {0}")]
    Jdwp(#[from] tern_jdwp::JdwpError),

    /// A private engine structure the host depends on is missing; the target
    /// runs an incompatible engine version.
    #[error("engine contract violation: {0}")]
    EngineContract(String),

    #[error("operation requires a paused target: {0}")]
    IllegalState(String),

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("unknown object id {0}")]
    UnknownObject(RemoteObjectId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid script URL: {0}")]
    InvalidUrl(String),

    /// The host pump has shut down (VM death or disconnect).
    #[error("debugger host is not running")]
    HostGone,
}

impl HostError {
    /// Whether a JDWP failure carries the given VM error code.
    pub fn is_vm_error(&self, code: u16) -> bool {
        matches!(self, HostError::Jdwp(err) if err.vm_error_code() == Some(code))
    }
}
