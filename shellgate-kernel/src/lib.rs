//! Shellgate kernel: gateway between API callers and device agents

pub mod config;
pub mod dispatcher;
pub mod health;
pub mod http;
pub mod registry;
pub mod transport;

pub use dispatcher::{CallContext, CommandDispatcher, DispatchConfig, DispatchError};
pub use registry::{ConnectionRegistry, DeviceHealth, DeviceView, RegistryConfig, RegistryError};
pub use transport::{AgentTransport, Connector, HttpConnector, TransportError, TransportState};
