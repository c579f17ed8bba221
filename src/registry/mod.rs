//! Server registry — lazy, serialized access to backend connections.
//!
//! One [`ServerEntry`] per backend name, each behind its own async mutex.
//! Connections start on first use and failed starts back off with a
//! cooldown before the next attempt.

pub mod entry;
pub mod server_registry;

pub use entry::{ConnectionState, RetryPolicy, ServerEntry, ServerStatus};
pub use server_registry::{ClientMutex, ServerRegistry};
