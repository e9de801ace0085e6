//! Breakpoint lifecycle, the pause flow, locals snapshots and remote-object
//! lifetimes.

use std::collections::HashMap;

use crate::harness::*;
use tern_jdwp::mock::{MockEventRequestModifier, MockObject};
use tern_jdwp::types::EVENT_KIND_BREAKPOINT;
use tern_host::nashorn::ScopeKind;
use tern_host::{
    DebuggerEvent, HostError, PropertyDescriptorKind, RemoteObjectId, ScriptLocation, SimpleValue,
    ValueNode,
};

fn breakpoint_requests_at(
    server: &tern_jdwp::mock::MockJdwpServer,
    location: tern_jdwp::Location,
) -> usize {
    server
        .event_requests()
        .iter()
        .filter(|r| {
            r.event_kind == EVENT_KIND_BREAKPOINT
                && r.modifiers
                    .iter()
                    .any(|m| matches!(m, MockEventRequestModifier::LocationOnly { location: l } if *l == location))
        })
        .count()
}

#[tokio::test]
async fn set_and_remove_breakpoint_restores_request_state() {
    let fixture = attach_nashorn().await;

    assert_eq!(breakpoint_requests_at(&fixture.server, line_location(2)), 0);

    let breakpoint = fixture
        .host
        .set_breakpoint(TEST_SCRIPT_URL, ScriptLocation::new(2, None))
        .await
        .unwrap()
        .expect("line 2 is breakable");
    assert_eq!(breakpoint_requests_at(&fixture.server, line_location(2)), 1);

    // An unbreakable line yields no breakpoint.
    let missing = fixture
        .host
        .set_breakpoint(TEST_SCRIPT_URL, ScriptLocation::new(99, None))
        .await
        .unwrap();
    assert!(missing.is_none());

    fixture
        .host
        .remove_breakpoint_by_id(&breakpoint.id)
        .await
        .unwrap();
    assert_eq!(breakpoint_requests_at(&fixture.server, line_location(2)), 0);

    // Removing twice is a no-op.
    fixture
        .host
        .remove_breakpoint_by_id(&breakpoint.id)
        .await
        .unwrap();
}

#[tokio::test]
async fn breakpoint_locations_respect_the_range_rule() {
    let fixture = attach_nashorn().await;
    let scripts = fixture.host.scripts().await.unwrap();
    let script_id = scripts[0].id().to_string();

    let locations = fixture
        .host
        .get_breakpoint_locations(
            &script_id,
            ScriptLocation::new(2, None),
            Some(ScriptLocation::new(4, Some(1))),
        )
        .await
        .unwrap();
    // Lines 2 and 3 qualify; line 4 is the end line and column 1 is not
    // strictly below the end column.
    assert_eq!(
        locations,
        vec![ScriptLocation::new(2, Some(1)), ScriptLocation::new(3, Some(1))]
    );
}

#[tokio::test]
async fn hitting_a_breakpoint_pauses_with_frames_and_locals() {
    let mut fixture = attach_nashorn().await;
    let frames = pause_on_line_2(&mut fixture).await;

    assert_eq!(frames.len(), 1);
    let top = &frames[0];
    assert_eq!(top.id, "sf-1");
    assert_eq!(top.url.as_str(), TEST_SCRIPT_URL);
    assert_eq!(top.location.line, 2);
    assert_eq!(top.function_name, "");

    let kinds: Vec<ScopeKind> = top.scope_chain.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![ScopeKind::Local, ScopeKind::Global]);
    assert!(matches!(top.this, ValueNode::Object { .. }));

    // The Local scope surfaces the frame's locals.
    let locals_id = top.scope_chain[0]
        .object
        .object_id()
        .expect("local scope is an object")
        .clone();
    assert_eq!(locals_id.as_str(), "$$locals-sf-1");

    let properties = fixture
        .host
        .get_object_properties(locals_id, true, false)
        .await
        .unwrap();
    let x = properties.get("x").expect("local x present");
    assert_eq!(x.kind, PropertyDescriptorKind::Data);
    assert_eq!(
        x.value,
        Some(ValueNode::Simple(SimpleValue::Number(1.0)))
    );
}

#[tokio::test]
async fn object_properties_require_a_pause() {
    let fixture = attach_nashorn().await;
    let err = fixture
        .host
        .get_object_properties(RemoteObjectId::new("objid-1"), true, false)
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::IllegalState(_)));
}

#[tokio::test]
async fn unknown_object_ids_return_an_empty_map() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    let properties = fixture
        .host
        .get_object_properties(RemoteObjectId::new("objid-9999"), false, false)
        .await
        .unwrap();
    assert!(properties.is_empty());
}

#[tokio::test]
async fn object_ids_do_not_survive_across_pauses() {
    let mut fixture = attach_modified(|config| {
        script_program_mut(config).variables.push(tern_jdwp::VariableInfo {
            code_index: 0,
            name: "o".to_string(),
            signature: "Ljava/lang/Object;".to_string(),
            length: 1000,
            slot: 2,
        });
        main_frame_mut(config).locals.insert(2, obj(O_LOCAL));
        config
            .objects
            .push((O_LOCAL, MockObject::script(JO_CLASS, Vec::new())));
    })
    .await;

    let frames = pause_on_line_2(&mut fixture).await;
    let locals_id = frames[0].scope_chain[0].object.object_id().unwrap().clone();
    let properties = fixture
        .host
        .get_object_properties(locals_id, true, false)
        .await
        .unwrap();
    let o_id = properties
        .get("o")
        .and_then(|d| d.value.as_ref())
        .and_then(|v| v.object_id())
        .expect("local o is an object")
        .clone();

    fixture.host.resume().await.unwrap();
    wait_for(&mut fixture.events, |e| matches!(e, DebuggerEvent::Resumed)).await;

    // Second pause: the old id must mean nothing.
    let _ = pause_on_line_2(&mut fixture).await;
    let stale = fixture
        .host
        .get_object_properties(o_id, false, false)
        .await
        .unwrap();
    assert!(stale.is_empty(), "ids from a previous pause must be unknown");
}

#[tokio::test]
async fn invalid_slot_degrades_to_per_variable_reads() {
    let mut fixture = attach_modified(|config| {
        let program = script_program_mut(config);
        program.variables = vec![
            tern_jdwp::VariableInfo {
                code_index: 0,
                name: ":this".to_string(),
                signature: "Ljava/lang/Object;".to_string(),
                length: 1000,
                slot: 0,
            },
            tern_jdwp::VariableInfo {
                code_index: 0,
                name: "x".to_string(),
                signature: "Ljava/lang/Object;".to_string(),
                length: 1000,
                slot: 1,
            },
            tern_jdwp::VariableInfo {
                code_index: 0,
                name: "y".to_string(),
                signature: "Ljava/lang/Object;".to_string(),
                length: 1000,
                slot: 2,
            },
            tern_jdwp::VariableInfo {
                code_index: 0,
                name: "z".to_string(),
                signature: "Ljava/lang/Object;".to_string(),
                length: 1000,
                slot: 3,
            },
        ];
        let frame = main_frame_mut(config);
        frame.locals.clear();
        frame.locals.insert(0, obj(GLOBAL_OBJ));
        frame.locals.insert(1, obj(BOXED_1));
        // Slot 2 (`y`) is listed in the variable table but was never
        // materialized: the batch read fails with INVALID_SLOT.
        frame.locals.insert(3, obj(BOXED_42));
    })
    .await;

    let frames = pause_on_line_2(&mut fixture).await;
    let locals_id = frames[0].scope_chain[0].object.object_id().unwrap().clone();
    let properties = fixture
        .host
        .get_object_properties(locals_id, true, false)
        .await
        .unwrap();

    assert_eq!(
        properties.get("x").and_then(|d| d.value.clone()),
        Some(ValueNode::Simple(SimpleValue::Number(1.0)))
    );
    assert_eq!(
        properties.get("z").and_then(|d| d.value.clone()),
        Some(ValueNode::Simple(SimpleValue::Number(42.0)))
    );
    assert!(
        !properties.contains_key("y"),
        "the invalid slot must be skipped, not fail the pause"
    );
}

#[tokio::test]
async fn ignored_breakpoints_do_not_pause() {
    let mut fixture = attach_nashorn().await;

    // A breakpoint exists but the client never asked to pause.
    fixture
        .host
        .set_breakpoint(TEST_SCRIPT_URL, ScriptLocation::new(2, None))
        .await
        .unwrap()
        .unwrap();
    prime_pause_invokes(&fixture.server);
    fixture
        .server
        .emit_breakpoint(THREAD, line_location(2))
        .await
        .unwrap();

    // The hit thread is released; evaluating still reports not-paused.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let err = fixture
        .host
        .evaluate_on_stack_frame("$top", "x", HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::IllegalState(_)));
}
