// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Integration tests wiring the real storage, bus, permission checker and
/// processor together around scripted providers.
use std::sync::{Arc, Mutex};

use smed_bus::{Bus, Event};
use smed_config::Config;
use smed_core::{Processor, SessionStore};
use smed_model::{Part, PermissionReply, Role, ScriptedProvider};
use smed_permission::{Checker, PermissionGate};
use smed_storage::Storage;
use smed_tools::Registry;

fn stack(
    provider: ScriptedProvider,
) -> (tempfile::TempDir, Arc<Bus>, SessionStore, Arc<Checker>, Processor) {
    let dir = tempfile::tempdir().unwrap();
    let bus = Bus::new();
    let storage = Arc::new(Storage::new(dir.path()));
    let store = SessionStore::new(storage, Arc::clone(&bus));
    let checker = Arc::new(Checker::new(Arc::clone(&bus)));
    let gate: Arc<dyn PermissionGate> = Arc::clone(&checker) as Arc<dyn PermissionGate>;
    let processor = Processor::new(
        store.clone(),
        Arc::clone(&bus),
        gate,
        Arc::new(Registry::new()),
        Arc::new(provider),
        Arc::new(Config::default()),
    );
    (dir, bus, store, checker, processor)
}

#[tokio::test]
async fn prompt_round_trip_persists_the_reply() {
    let (_dir, _bus, store, _checker, processor) =
        stack(ScriptedProvider::always_text("the answer is 42"));

    let session = store.create_session("/work", None).unwrap();
    store.create_user_message(&session.id, "what is the answer?").unwrap();

    let message = processor.process(&session.id, "build").await.unwrap();
    assert_eq!(message.role, Role::Assistant);

    // Survives a fresh read from disk.
    let all = store.messages_with_parts(&session.id).unwrap();
    assert_eq!(all.len(), 2);
    let (_, parts) = &all[1];
    assert!(matches!(&parts[0], Part::Text(tp) if tp.text == "the answer is 42"));
}

#[tokio::test]
async fn events_stream_ends_with_idle_and_deletion_cascades() {
    let (_dir, bus, store, _checker, processor) =
        stack(ScriptedProvider::always_text("done"));

    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    bus.subscribe_all(move |e| sink.lock().unwrap().push(e.kind().name()));

    let session = store.create_session("/work", Some("demo".into())).unwrap();
    store.create_user_message(&session.id, "go").unwrap();
    let message = processor.process(&session.id, "build").await.unwrap();

    assert_eq!(*kinds.lock().unwrap().last().unwrap(), "session.idle");

    store.delete_session(&session.id).unwrap();
    assert!(store.session(&session.id).is_err());
    assert!(store.messages(&session.id).unwrap().is_empty());
    assert!(store.parts(&message.id).unwrap().is_empty());
    assert_eq!(*kinds.lock().unwrap().last().unwrap(), "session.deleted");
}

#[tokio::test]
async fn interactive_checker_round_trip_through_the_bus() {
    // A second prompt on the same session reuses memoized "always" grants:
    // two identical bash turns, one reply.
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use smed_model::PermissionType;
    use smed_tools::{Tool, ToolContext, ToolError, ToolResult};

    struct ShellTool;

    #[async_trait]
    impl Tool for ShellTool {
        fn name(&self) -> &str {
            "bash"
        }
        fn description(&self) -> &str {
            "runs a shell command"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn permission(&self) -> Option<PermissionType> {
            Some(PermissionType::Bash)
        }
        async fn invoke(&self, _ctx: &ToolContext, _input: Value) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::text("ok"))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let bus = Bus::new();
    let storage = Arc::new(Storage::new(dir.path()));
    let store = SessionStore::new(storage, Arc::clone(&bus));
    let checker = Arc::new(Checker::new(Arc::clone(&bus)));
    let gate: Arc<dyn PermissionGate> = Arc::clone(&checker) as Arc<dyn PermissionGate>;
    let mut registry = Registry::new();
    registry.register(ShellTool);

    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_turn("call_1", "bash", r#"{"command":"git status"}"#),
        ScriptedProvider::text_turn("clean tree"),
        ScriptedProvider::tool_turn("call_2", "bash", r#"{"command":"git status"}"#),
        ScriptedProvider::text_turn("still clean"),
    ]);
    let processor = Processor::new(
        store.clone(),
        Arc::clone(&bus),
        gate,
        Arc::new(registry),
        Arc::new(provider),
        Arc::new(Config::default()),
    );

    // Reply "always" to whatever gets asked.
    let asked = Arc::new(Mutex::new(0usize));
    let count = Arc::clone(&asked);
    let replier = Arc::clone(&checker);
    bus.subscribe(smed_bus::EventKind::PermissionUpdated, move |e| {
        if let Event::PermissionUpdated { request } = e {
            *count.lock().unwrap() += 1;
            replier.respond(&request.id, PermissionReply::Always);
        }
    });

    let session = store.create_session("/work", None).unwrap();
    store.create_user_message(&session.id, "status?").unwrap();
    processor.process(&session.id, "build").await.unwrap();

    store.create_user_message(&session.id, "again?").unwrap();
    processor.process(&session.id, "build").await.unwrap();

    assert_eq!(
        *asked.lock().unwrap(),
        1,
        "the memoized pattern must suppress the second ask"
    );
}
