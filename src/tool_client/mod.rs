//! Tool client: JSON-RPC over stdio for external tool servers.
//!
//! This module handles:
//! - A versioned registry of tool-server configs, applied explicitly
//! - Spawning tool-server processes and the discovery handshake
//! - Connection lifecycle, health probing, degradation, and reconnect backoff
//! - Single tool calls with schema validation, timeouts, and one retry
//!
//! The pipeline's stage handlers reach tool servers through the
//! [`ToolInvocationProxy`].

pub mod backoff;
pub mod connection;
pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod proxy;
pub mod registry;
pub mod transport;
pub mod types;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use backoff::BackoffPolicy;
pub use connection::{ConnectionState, ToolConnection};
pub use errors::ToolError;
pub use lifecycle::{Connector, ProcessConnector};
pub use manager::{ServerStatus, ToolConnectionManager, ToolMatch};
pub use proxy::ToolInvocationProxy;
pub use registry::{RegistrySnapshot, ToolServerRegistry};
pub use transport::{StdioTransport, Transport};
pub use types::{ConnectDescriptor, ToolCatalog, ToolOutcome, ToolResult, ToolServerConfig};
pub use value::{ParamSchema, ToolValue};
