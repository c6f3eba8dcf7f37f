//! Tool registry and dispatcher failure handling.

use fae_device::error::{RegistryError, ToolError};
use fae_device::mcp::{ParameterSchema, ToolDescriptor, ToolDispatcher, ToolRegistry};
use fae_device::protocol::ControlMessage;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn registry(calls: &Arc<AtomicUsize>) -> ToolRegistry {
    let mut builder = ToolRegistry::builder();
    let counter = Arc::clone(calls);
    builder
        .register(ToolDescriptor::new(
            "self.light.set_brightness",
            "Set the ring light brightness.",
            ParameterSchema::new().integer("level", 0, 10),
            move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"level": args.get_i64("level")}))
            },
        ))
        .unwrap();
    builder
        .register(ToolDescriptor::new(
            "self.faulty",
            "Always crashes.",
            ParameterSchema::new(),
            |_| panic!("sensor bus fault"),
        ))
        .unwrap();
    builder.build()
}

#[test]
fn unknown_tool_is_not_found() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry(&calls);
    assert!(matches!(
        registry.handle_tool_call("self.missing", &json!({})),
        Err(ToolError::NotFound { .. })
    ));
}

#[test]
fn malformed_arguments_never_reach_the_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry(&calls);
    for args in [
        json!({}),
        json!({"level": "bright"}),
        json!({"level": 11}),
        json!([1, 2]),
    ] {
        assert!(
            matches!(
                registry.handle_tool_call("self.light.set_brightness", &args),
                Err(ToolError::InvalidArguments { .. })
            ),
            "accepted {args}"
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let ok = registry
        .handle_tool_call("self.light.set_brightness", &json!({"level": 4}))
        .unwrap();
    assert_eq!(ok["level"], 4);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn faulting_handler_leaves_dispatcher_usable() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry(&calls);
    assert!(matches!(
        registry.handle_tool_call("self.faulty", &json!({})),
        Err(ToolError::ExecutionFailed { .. })
    ));
    registry
        .handle_tool_call("self.light.set_brightness", &json!({"level": 1}))
        .unwrap();
}

#[test]
fn dispatch_replies_off_thread_with_structured_errors() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = ToolDispatcher::new(Arc::new(registry(&calls)));
    let (tx, rx) = crossbeam_channel::unbounded::<ControlMessage>();

    let payloads = [
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
               "params": {"name": "self.faulty", "arguments": {}}}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
               "params": {"name": "self.light.set_brightness", "arguments": {"level": 7}}}),
        json!({"id": "x", "tool": "self.nope"}),
    ];
    for payload in payloads {
        let tx = tx.clone();
        dispatcher
            .dispatch(payload, move |reply| {
                tx.send(reply).unwrap();
            })
            .unwrap();
    }

    let replies: Vec<Value> = (0..3)
        .map(|_| match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            ControlMessage::Mcp { payload } => payload,
            other => panic!("unexpected reply {other:?}"),
        })
        .collect();

    let by_id = |id: Value| replies.iter().find(|r| r["id"] == id).unwrap().clone();
    let fault = by_id(json!(1));
    assert_eq!(fault["error"]["code"], -32603);
    assert_eq!(fault["error"]["data"]["kind"], "tool_execution_failed");

    let ok = by_id(json!(2));
    assert_eq!(ok["result"]["isError"], false);

    let missing = by_id(json!("x"));
    assert_eq!(missing["error"]["kind"], "tool_not_found");
}

#[test]
fn notifications_get_no_reply() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = ToolDispatcher::new(Arc::new(registry(&calls)));
    assert!(
        dispatcher
            .handle_payload(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .is_none()
    );
}

#[test]
fn duplicate_registration_rejected() {
    let mut builder = ToolRegistry::builder();
    let tool = || {
        ToolDescriptor::new("self.ping", "Ping.", ParameterSchema::new(), |_| {
            Ok(json!(true))
        })
    };
    builder.register(tool()).unwrap();
    assert_eq!(
        builder.register(tool()),
        Err(RegistryError::DuplicateTool("self.ping".into()))
    );
}
