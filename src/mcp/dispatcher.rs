//! Routes inbound `mcp` payloads to tools and builds the replies.
//!
//! Two request shapes are understood:
//!
//! - plain: `{"tool": name, "arguments": {...}}`, answered with
//!   `{"result": ...}` or `{"error": {"kind", "message"}}`;
//! - JSON-RPC 2.0: `initialize`, `tools/list` and `tools/call`.
//!
//! An `id` on a plain request is echoed back.

use crate::error::{Result, ToolError};
use crate::mcp::registry::ToolRegistry;
use crate::protocol::ControlMessage;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info};

/// MCP protocol revision announced by `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const RPC_INVALID_REQUEST: i64 = -32600;
const RPC_METHOD_NOT_FOUND: i64 = -32601;
const RPC_INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Handle one payload on a short-lived worker thread and pass the
    /// reply, wrapped as an `mcp` control message, to `reply`.
    /// Notifications produce no reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned.
    pub fn dispatch<F>(&self, payload: Value, reply: F) -> Result<()>
    where
        F: FnOnce(ControlMessage) + Send + 'static,
    {
        let dispatcher = self.clone();
        std::thread::Builder::new()
            .name("fae-tool".into())
            .spawn(move || {
                if let Some(response) = dispatcher.handle_payload(&payload) {
                    reply(ControlMessage::mcp(response));
                }
            })?;
        Ok(())
    }

    /// Handle one payload synchronously.
    #[must_use]
    pub fn handle_payload(&self, payload: &Value) -> Option<Value> {
        if payload.get("jsonrpc").is_some() || payload.get("method").is_some() {
            return self.handle_rpc(payload);
        }
        Some(self.handle_plain(payload))
    }

    fn handle_plain(&self, payload: &Value) -> Value {
        let mut reply = Map::new();
        if let Some(id) = payload.get("id") {
            reply.insert("id".into(), id.clone());
        }
        let Some(name) = payload.get("tool").and_then(Value::as_str) else {
            reply.insert(
                "error".into(),
                json!({"kind": "invalid_request", "message": "missing \"tool\""}),
            );
            return Value::Object(reply);
        };
        let arguments = payload.get("arguments").cloned().unwrap_or(Value::Null);

        match self.call(name, &arguments) {
            Ok(result) => {
                reply.insert("result".into(), result);
            }
            Err(e) => {
                reply.insert(
                    "error".into(),
                    json!({"kind": e.kind(), "message": e.to_string()}),
                );
            }
        }
        Value::Object(reply)
    }

    fn handle_rpc(&self, payload: &Value) -> Option<Value> {
        let method = payload.get("method").and_then(Value::as_str);
        let Some(id) = payload.get("id").cloned() else {
            debug!("mcp notification {method:?}");
            return None;
        };
        let Some(method) = method else {
            return Some(rpc_error(id, RPC_INVALID_REQUEST, "missing method", None));
        };
        let params = payload.get("params").cloned().unwrap_or(Value::Null);

        let response = match method {
            "initialize" => rpc_result(
                id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "tools/list" => rpc_result(id, json!({"tools": self.registry.tools_json()})),
            "tools/call" => {
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return Some(rpc_error(
                        id,
                        RPC_INVALID_PARAMS,
                        "tools/call needs params.name",
                        None,
                    ));
                };
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                match self.call(name, &arguments) {
                    Ok(result) => rpc_result(
                        id,
                        json!({
                            "content": [{"type": "text", "text": as_text(&result)}],
                            "isError": false,
                        }),
                    ),
                    Err(e) => rpc_error(
                        id,
                        e.rpc_code(),
                        &e.to_string(),
                        Some(json!({"kind": e.kind()})),
                    ),
                }
            }
            other => rpc_error(
                id,
                RPC_METHOD_NOT_FOUND,
                &format!("unknown method {other}"),
                None,
            ),
        };
        Some(response)
    }

    fn call(&self, name: &str, arguments: &Value) -> std::result::Result<Value, ToolError> {
        info!("tool call {name}");
        let result = self.registry.handle_tool_call(name, arguments);
        if let Err(e) = &result {
            info!("tool call {name} failed: {e}");
        }
        result
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn rpc_error(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({"code": code, "message": message});
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({"jsonrpc": "2.0", "id": id, "error": error})
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::mcp::registry::ToolDescriptor;
    use crate::mcp::schema::ParameterSchema;
    use std::time::Duration;

    fn dispatcher() -> ToolDispatcher {
        let mut builder = ToolRegistry::builder();
        builder
            .register(ToolDescriptor::new(
                "self.light.set",
                "Switch the light",
                ParameterSchema::new().boolean("on"),
                |args| Ok(json!({"on": args.get_bool("on")})),
            ))
            .unwrap();
        builder
            .register(ToolDescriptor::new(
                "self.greet",
                "Say hello",
                ParameterSchema::new(),
                |_| Ok(json!("hello")),
            ))
            .unwrap();
        ToolDispatcher::new(Arc::new(builder.build()))
    }

    #[test]
    fn plain_call_result_and_id() {
        let reply = dispatcher()
            .handle_payload(&json!({"id": 4, "tool": "self.light.set", "arguments": {"on": true}}))
            .unwrap();
        assert_eq!(reply, json!({"id": 4, "result": {"on": true}}));
    }

    #[test]
    fn plain_call_errors_carry_kind() {
        let d = dispatcher();
        let reply = d.handle_payload(&json!({"tool": "self.fly"})).unwrap();
        assert_eq!(reply["error"]["kind"], "tool_not_found");
        let reply = d
            .handle_payload(&json!({"tool": "self.light.set", "arguments": {}}))
            .unwrap();
        assert_eq!(reply["error"]["kind"], "invalid_arguments");
        let reply = d.handle_payload(&json!({"arguments": {}})).unwrap();
        assert_eq!(reply["error"]["kind"], "invalid_request");
    }

    #[test]
    fn rpc_initialize_and_list() {
        let d = dispatcher();
        let init = d
            .handle_payload(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .unwrap();
        assert_eq!(init["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(init["id"], 1);

        let list = d
            .handle_payload(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .unwrap();
        let tools = list["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "self.greet");
    }

    #[test]
    fn rpc_call_success_and_failure() {
        let d = dispatcher();
        let ok = d
            .handle_payload(&json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "self.greet", "arguments": {}}
            }))
            .unwrap();
        assert_eq!(ok["result"]["content"][0]["text"], "hello");
        assert_eq!(ok["result"]["isError"], false);

        let missing = d
            .handle_payload(&json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": {"name": "self.nope"}
            }))
            .unwrap();
        assert_eq!(missing["error"]["code"], -32601);
        assert_eq!(missing["error"]["data"]["kind"], "tool_not_found");

        let unknown = d
            .handle_payload(&json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"}))
            .unwrap();
        assert_eq!(unknown["error"]["code"], RPC_METHOD_NOT_FOUND);
    }

    #[test]
    fn rpc_notification_has_no_reply() {
        assert!(
            dispatcher()
                .handle_payload(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
                .is_none()
        );
    }

    #[test]
    fn dispatch_replies_from_worker_thread() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let caller = std::thread::current().id();
        dispatcher()
            .dispatch(json!({"tool": "self.greet"}), move |msg| {
                tx.send((std::thread::current().id(), msg)).unwrap();
            })
            .unwrap();
        let (thread, msg) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(thread, caller);
        assert_eq!(msg, ControlMessage::mcp(json!({"result": "hello"})));
    }
}
