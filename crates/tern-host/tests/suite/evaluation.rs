//! Expression evaluation: marker suppression, thrown values, and the local
//! mutation write-back.

use std::collections::HashMap;

use crate::harness::*;
use tern_jdwp::JdwpValue;
use tern_host::{HostError, RemoteObjectId, SimpleValue, ValueNode};

#[tokio::test]
async fn evaluating_mutated_locals_writes_back_to_the_frame_slot() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    // The engine evaluates `x = x + 41` to the boxed 42 and records the
    // mutation in the wrapper's change log.
    fixture
        .server
        .push_invoke_reply(CONTEXT_OBJ, EVAL_METHOD, obj(BOXED_42), 0);
    fixture.server.with_world(|world| {
        let changes = world.objects.get_mut(&CHANGES_OBJ).unwrap();
        if let tern_jdwp::mock::MockObjectKind::Script { properties } = &mut changes.kind {
            properties.clear();
            properties.push(("length".to_string(), JdwpValue::Int(1)));
            properties.push(("0".to_string(), obj(PAIR_OBJ)));
        }
        world.objects.insert(
            PAIR_OBJ,
            tern_jdwp::mock::MockObject::script(
                JO_CLASS,
                vec![
                    ("0".to_string(), string_obj(X_NAME_STR)),
                    ("1".to_string(), obj(BOXED_42)),
                ],
            ),
        );
    });

    let result = fixture
        .host
        .evaluate_on_stack_frame("$top", "x = x + 41", HashMap::new())
        .await
        .unwrap();
    assert_eq!(result, ValueNode::Simple(SimpleValue::Number(42.0)));

    // The JDI slot now holds the unboxed 42 (the slot signature is `int`).
    assert_eq!(
        fixture.server.frame_local(THREAD, FRAME, 1),
        Some(JdwpValue::Int(42))
    );
}

#[tokio::test]
async fn statement_results_suppress_the_marker_string() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    // `var y = 7` completes with the leading marker literal; the host must
    // report undefined, not the marker.
    fixture
        .server
        .push_invoke_reply(CONTEXT_OBJ, EVAL_METHOD, string_obj(MARKER_STR), 0);

    let result = fixture
        .host
        .evaluate_on_stack_frame("$top", "var y = 7", HashMap::new())
        .await
        .unwrap();
    assert_eq!(result, ValueNode::Simple(SimpleValue::Undefined));
}

#[tokio::test]
async fn thrown_values_surface_as_errors_not_plain_values() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    fixture
        .server
        .push_invoke_reply(CONTEXT_OBJ, EVAL_METHOD, JdwpValue::Void, ECMA_EXC_OBJ);

    let result = fixture
        .host
        .evaluate_on_stack_frame("$top", "throw 'oops'", HashMap::new())
        .await
        .unwrap();
    match result {
        ValueNode::Error { data, .. } => {
            assert_eq!(data.message, "oops");
        }
        other => panic!("expected an error node, got {other:?}"),
    }
}

#[tokio::test]
async fn evaluation_sends_marker_prefixed_code_to_the_engine() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    fixture
        .server
        .push_invoke_reply(CONTEXT_OBJ, EVAL_METHOD, JdwpValue::Int(3), 0);
    let result = fixture
        .host
        .evaluate_on_stack_frame("$top", "1 + 2", HashMap::new())
        .await
        .unwrap();
    assert_eq!(result, ValueNode::Simple(SimpleValue::Number(3.0)));

    let marker = tern_host::nashorn::EVALUATED_CODE_MARKER;
    let seen = fixture
        .server
        .created_strings()
        .iter()
        .any(|(_, text)| text.starts_with(&format!("'{marker}';")) && text.ends_with("1 + 2"));
    assert!(seen, "evaluated code must be prefixed with the marker literal");
}

#[tokio::test]
async fn stale_named_objects_fail_before_running_anything() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    let mut named = HashMap::new();
    named.insert("gone".to_string(), RemoteObjectId::new("objid-404"));
    let err = fixture
        .host
        .evaluate_on_stack_frame("$top", "gone", named)
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::UnknownObject(_)));
}

#[tokio::test]
async fn evaluation_requires_a_pause() {
    let fixture = attach_nashorn().await;
    let err = fixture
        .host
        .evaluate_on_stack_frame("$top", "1 + 1", HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::IllegalState(_)));
}

#[tokio::test]
async fn unknown_stack_frame_ids_are_rejected() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    let err = fixture
        .host
        .evaluate_on_stack_frame("sf-99", "1", HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::InvalidRequest(_)));
}
