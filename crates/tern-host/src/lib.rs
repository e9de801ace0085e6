//! Tern: a debugger host bridging a Chrome DevTools front-end to a Nashorn
//! script engine reached over JDWP.
//!
//! This crate is the core of the bridge: it discovers script classes loaded
//! by the target VM and recovers their JavaScript source, manages breakable
//! locations, drives the VM event queue through a pause/resume/step state
//! machine, evaluates user expressions against a synthesized scope that can
//! observe and commit local-variable mutations, and extracts property
//! descriptors from remote objects.
//!
//! The WebSocket server and CDP domain actors are external collaborators:
//! they call into [`DebuggerHost`] and serialize the [`events::DebuggerEvent`]
//! stream as CDP events.

pub mod breakpoints;
pub mod error;
pub mod eval;
pub mod events;
pub mod host;
pub mod invoke;
pub mod marshal;
pub mod nashorn;
pub mod objects;
pub mod pause;
pub mod properties;
pub mod script;
pub mod url;
pub mod values;

pub use crate::breakpoints::{Breakpoint, ScriptLocation};
pub use crate::error::{HostError, HostResult};
pub use crate::events::{DebuggerEvent, EventStream};
pub use crate::host::{AttachArgs, DebuggerHost, ExceptionPauseMode};
pub use crate::pause::{StackFrameView, StepKind};
pub use crate::script::Script;
pub use crate::url::ScriptUrl;
pub use crate::values::{
    ErrorValue, ObjectPropertyDescriptor, PropertyDescriptorKind, RemoteObjectId, SimpleValue,
    ValueNode,
};
