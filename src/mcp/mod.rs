//! Remote tool invocation.
//!
//! The server's reasoning engine asks the device to act by sending `mcp`
//! control messages. The [`ToolDispatcher`] resolves them against the frozen
//! [`ToolRegistry`], runs the tool off the core thread and hands back the
//! reply message.

pub mod dispatcher;
pub mod registry;
pub mod schema;
pub mod tools;

pub use dispatcher::ToolDispatcher;
pub use registry::{ToolDescriptor, ToolHandler, ToolRegistry, ToolRegistryBuilder};
pub use schema::{Arguments, ParameterSchema, PropertyKind};
pub use tools::{DeviceControl, register_device_tools};
