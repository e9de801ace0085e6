//! Wire-level Java Debug Wire Protocol (JDWP) client for the Tern debugger
//! host.
//!
//! This crate speaks the JDWP binary protocol over TCP. It is async (`tokio`)
//! and cancellation-aware: replies are correlated to commands by packet id on
//! a background read loop, and VM events are fanned out over a broadcast
//! channel.
//!
//! The command surface is intentionally scoped to what the debugger host
//! needs — class/thread/frame introspection, breakpoint and exception event
//! requests, method invocation on a suspended thread, and local-slot reads
//! and writes. It is not a general-purpose JDWP library.

mod client;
mod codec;
pub mod types;

pub use client::{EventModifier, JdwpClient, JdwpClientConfig};
pub use types::{
    ClassInfo, FieldId, FieldInfo, FrameId, FrameInfo, JdwpError, JdwpEvent, JdwpIdSizes,
    JdwpValue, LineTable, LineTableEntry, Location, MethodId, MethodInfo, ObjectId,
    ReferenceTypeId, Result, ThreadId, VariableInfo,
};

// The mock VM is only needed for tests and downstream integration suites.
// Compile it for this crate's own unit tests unconditionally, and behind the
// `test-support` feature for downstream crates.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
