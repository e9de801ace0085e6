//! Property extraction across the extractor families: JDI arrays, host
//! objects, hash tables, and script objects via the in-target helper.

use crate::harness::*;
use tern_jdwp::mock::MockObject;
use tern_jdwp::types::{TAG_ARRAY, TAG_INT, TAG_OBJECT};
use tern_jdwp::JdwpValue;
use tern_host::{PropertyDescriptorKind, SimpleValue, ValueNode};

fn with_extra_local(
    config: &mut tern_jdwp::mock::MockVmConfig,
    name: &str,
    slot: u32,
    value: JdwpValue,
) {
    script_program_mut(config).variables.push(tern_jdwp::VariableInfo {
        code_index: 0,
        name: name.to_string(),
        signature: "Ljava/lang/Object;".to_string(),
        length: 1000,
        slot,
    });
    main_frame_mut(config).locals.insert(slot, value);
}

async fn local_value_id(
    fixture: &mut Fixture,
    name: &str,
) -> tern_host::RemoteObjectId {
    let frames = pause_on_line_2(fixture).await;
    let locals_id = frames[0].scope_chain[0].object.object_id().unwrap().clone();
    let properties = fixture
        .host
        .get_object_properties(locals_id, true, false)
        .await
        .unwrap();
    properties
        .get(name)
        .and_then(|d| d.value.as_ref())
        .and_then(|v| v.object_id())
        .unwrap_or_else(|| panic!("local {name} should be an object"))
        .clone()
}

#[tokio::test]
async fn jdi_arrays_expose_indices_and_length() {
    let mut fixture = attach_modified(|config| {
        with_extra_local(
            config,
            "arr",
            2,
            JdwpValue::Object {
                tag: TAG_ARRAY,
                id: ARR_OBJ,
            },
        );
        config.objects.push((
            ARR_OBJ,
            MockObject::array(
                INT_ARRAY_CLASS,
                TAG_INT,
                vec![JdwpValue::Int(10), JdwpValue::Int(20), JdwpValue::Int(30)],
            ),
        ));
    })
    .await;

    let arr_id = local_value_id(&mut fixture, "arr").await;
    let properties = fixture
        .host
        .get_object_properties(arr_id.clone(), true, false)
        .await
        .unwrap();

    assert_eq!(
        properties.get("0").and_then(|d| d.value.clone()),
        Some(ValueNode::Simple(SimpleValue::Number(10.0)))
    );
    assert_eq!(
        properties.get("2").and_then(|d| d.value.clone()),
        Some(ValueNode::Simple(SimpleValue::Number(30.0)))
    );
    assert_eq!(
        properties.get("length").and_then(|d| d.value.clone()),
        Some(ValueNode::Simple(SimpleValue::Number(3.0)))
    );

    // Arrays have no accessor properties.
    let accessors = fixture
        .host
        .get_object_properties(arr_id, true, true)
        .await
        .unwrap();
    assert!(accessors.is_empty());
}

#[tokio::test]
async fn host_objects_expose_declared_fields() {
    let mut fixture = attach_modified(|config| {
        with_extra_local(config, "pt", 2, obj(POINT_OBJ));
        config.objects.push((
            POINT_OBJ,
            MockObject::plain(POINT_CLASS)
                .with_field(POINT_X_FIELD, JdwpValue::Int(3))
                .with_field(POINT_Y_FIELD, JdwpValue::Int(4)),
        ));
    })
    .await;

    let pt_id = local_value_id(&mut fixture, "pt").await;
    let properties = fixture
        .host
        .get_object_properties(pt_id, true, false)
        .await
        .unwrap();

    let x = properties.get("x").expect("field x");
    assert_eq!(x.kind, PropertyDescriptorKind::Data);
    assert!(x.is_own);
    assert_eq!(x.value, Some(ValueNode::Simple(SimpleValue::Number(3.0))));
    assert_eq!(
        properties.get("y").and_then(|d| d.value.clone()),
        Some(ValueNode::Simple(SimpleValue::Number(4.0)))
    );
}

#[tokio::test]
async fn hashtables_are_walked_through_their_enumeration() {
    let mut fixture = attach_modified(|config| {
        with_extra_local(config, "tbl", 2, obj(TABLE_OBJ));
        config
            .objects
            .push((TABLE_OBJ, MockObject::plain(HASHTABLE_CLASS)));
        config
            .objects
            .push((ENUM_OBJ, MockObject::plain(ENUMERATION_CLASS)));
        config.objects.push((COLOR_STR, MockObject::string(0, "color")));
        config.objects.push((BLUE_STR, MockObject::string(0, "blue")));
    })
    .await;

    let tbl_id = local_value_id(&mut fixture, "tbl").await;

    let server = &fixture.server;
    server.push_invoke_reply(TABLE_OBJ, HASHTABLE_KEYS_METHOD, obj(ENUM_OBJ), 0);
    server.push_invoke_reply(
        ENUM_OBJ,
        HAS_MORE_ELEMENTS_METHOD,
        JdwpValue::Boolean(true),
        0,
    );
    server.push_invoke_reply(ENUM_OBJ, NEXT_ELEMENT_METHOD, string_obj(COLOR_STR), 0);
    server.push_invoke_reply(TABLE_OBJ, HASHTABLE_GET_METHOD, string_obj(BLUE_STR), 0);
    server.push_invoke_reply(
        ENUM_OBJ,
        HAS_MORE_ELEMENTS_METHOD,
        JdwpValue::Boolean(false),
        0,
    );

    let properties = fixture
        .host
        .get_object_properties(tbl_id.clone(), true, false)
        .await
        .unwrap();
    assert_eq!(
        properties.get("color").and_then(|d| d.value.clone()),
        Some(ValueNode::Simple(SimpleValue::Str("blue".to_string())))
    );

    // Accessors are impossible on a hash table.
    let accessors = fixture
        .host
        .get_object_properties(tbl_id, true, true)
        .await
        .unwrap();
    assert!(accessors.is_empty());
}

#[tokio::test]
async fn script_objects_prefer_the_in_target_extractor() {
    let mut fixture = attach_modified(|config| {
        with_extra_local(config, "s", 2, obj(SOBJ));
        config
            .objects
            .push((SOBJ, MockObject::script(JO_CLASS, Vec::new())));
        config.objects.push((A_STR, MockObject::string(0, "a")));
        config.objects.push((FLAGS_STR, MockObject::string(0, "cewo")));
        config
            .objects
            .push((HIDDEN_STR, MockObject::string(0, "||hidden")));
        config.objects.push((
            TUPLES_ARR,
            MockObject::array(
                OBJECT_ARRAY_CLASS,
                TAG_OBJECT,
                vec![
                    // [name, flags, value, getter, setter] x 2
                    string_obj(A_STR),
                    string_obj(FLAGS_STR),
                    JdwpValue::Int(7),
                    JdwpValue::NULL,
                    JdwpValue::NULL,
                    string_obj(HIDDEN_STR),
                    string_obj(FLAGS_STR),
                    JdwpValue::Int(0),
                    JdwpValue::NULL,
                    JdwpValue::NULL,
                ],
            ),
        ));
    })
    .await;

    let s_id = local_value_id(&mut fixture, "s").await;

    // The helper function is evaluated once, then applied to the target.
    fixture
        .server
        .push_invoke_reply(CONTEXT_OBJ, EVAL_METHOD, obj(EXTRACTOR_FN), 0);
    fixture.server.push_invoke_reply(
        SCRIPT_RUNTIME_CLASS,
        APPLY_METHOD,
        JdwpValue::Object {
            tag: TAG_ARRAY,
            id: TUPLES_ARR,
        },
        0,
    );

    let properties = fixture
        .host
        .get_object_properties(s_id, true, false)
        .await
        .unwrap();

    let a = properties.get("a").expect("property a extracted");
    assert_eq!(a.kind, PropertyDescriptorKind::Data);
    assert!(a.writable && a.enumerable && a.configurable && a.is_own);
    assert_eq!(a.value, Some(ValueNode::Simple(SimpleValue::Number(7.0))));

    assert!(
        !properties.keys().any(|k| k.starts_with("||")),
        "hidden names must never surface"
    );
}

// A script-object class whose key-walk entry points are reachable, for the
// fallback path (no in-target extractor).
const JO4_CLASS: u64 = 0x600C;
const JO4_GET_METHOD: u64 = 0x4701;
const JO4_GET_OWN_KEYS_METHOD: u64 = 0x4703;
const JO4_GET_PROTO_METHOD: u64 = 0x4704;
const OWN_OBJ: u64 = 0x5513;
const PROTO_OBJ: u64 = 0x5514;
const OWN_KEYS_ARR: u64 = 0x5515;
const PROTO_KEYS_ARR: u64 = 0x5516;
const B_STR: u64 = 0x5517;

#[tokio::test]
async fn fallback_key_walk_follows_the_prototype_chain() {
    let mut fixture = attach_modified(|config| {
        with_extra_local(config, "s", 2, obj(OWN_OBJ));
        config.classes.push(
            tern_jdwp::mock::MockClass::new(JO4_CLASS, "Ljdk/nashorn/internal/scripts/JO4;")
                .with_method(tern_jdwp::mock::MockMethod::named(JO4_GET_METHOD, "get"))
                .with_method(tern_jdwp::mock::MockMethod::named(
                    JO4_GET_OWN_KEYS_METHOD,
                    "getOwnKeys",
                ))
                .with_method(tern_jdwp::mock::MockMethod::named(
                    JO4_GET_PROTO_METHOD,
                    "getProto",
                )),
        );
        config.objects.push((
            OWN_OBJ,
            MockObject::script(JO4_CLASS, vec![("a".to_string(), JdwpValue::Int(1))]),
        ));
        config.objects.push((
            PROTO_OBJ,
            MockObject::script(JO4_CLASS, vec![("b".to_string(), JdwpValue::Int(2))]),
        ));
        config.objects.push((A_STR, MockObject::string(0, "a")));
        config.objects.push((B_STR, MockObject::string(0, "b")));
        config.objects.push((
            OWN_KEYS_ARR,
            MockObject::array(OBJECT_ARRAY_CLASS, TAG_OBJECT, vec![string_obj(A_STR)]),
        ));
        config.objects.push((
            PROTO_KEYS_ARR,
            MockObject::array(OBJECT_ARRAY_CLASS, TAG_OBJECT, vec![string_obj(B_STR)]),
        ));
    })
    .await;

    let s_id = local_value_id(&mut fixture, "s").await;

    let keys_value = |id: u64| JdwpValue::Object { tag: TAG_ARRAY, id };
    let server = &fixture.server;
    server.push_invoke_reply(OWN_OBJ, JO4_GET_OWN_KEYS_METHOD, keys_value(OWN_KEYS_ARR), 0);
    server.push_invoke_reply(OWN_OBJ, JO4_GET_PROTO_METHOD, obj(PROTO_OBJ), 0);
    server.push_invoke_reply(
        PROTO_OBJ,
        JO4_GET_OWN_KEYS_METHOD,
        keys_value(PROTO_KEYS_ARR),
        0,
    );
    server.push_invoke_reply(PROTO_OBJ, JO4_GET_PROTO_METHOD, JdwpValue::NULL, 0);

    let properties = fixture
        .host
        .get_object_properties(s_id.clone(), false, false)
        .await
        .unwrap();
    let a = properties.get("a").expect("own property a");
    assert!(a.is_own);
    assert_eq!(a.value, Some(ValueNode::Simple(SimpleValue::Number(1.0))));
    let b = properties.get("b").expect("inherited property b");
    assert!(!b.is_own);
    assert_eq!(b.value, Some(ValueNode::Simple(SimpleValue::Number(2.0))));

    // only_own stops the walk at the object itself.
    fixture
        .server
        .push_invoke_reply(OWN_OBJ, JO4_GET_OWN_KEYS_METHOD, keys_value(OWN_KEYS_ARR), 0);
    let own_only = fixture
        .host
        .get_object_properties(s_id, true, false)
        .await
        .unwrap();
    assert!(own_only.contains_key("a"));
    assert!(!own_only.contains_key("b"));
}

#[tokio::test]
async fn property_results_are_cached_within_a_pause() {
    let mut fixture = attach_modified(|config| {
        with_extra_local(config, "pt", 2, obj(POINT_OBJ));
        config.objects.push((
            POINT_OBJ,
            MockObject::plain(POINT_CLASS)
                .with_field(POINT_X_FIELD, JdwpValue::Int(3))
                .with_field(POINT_Y_FIELD, JdwpValue::Int(4)),
        ));
    })
    .await;

    let pt_id = local_value_id(&mut fixture, "pt").await;
    let first = fixture
        .host
        .get_object_properties(pt_id.clone(), true, false)
        .await
        .unwrap();
    let invocations_after_first = fixture.server.invocations().len();

    let second = fixture
        .host
        .get_object_properties(pt_id, true, false)
        .await
        .unwrap();
    assert_eq!(first.len(), second.len());
    assert_eq!(
        fixture.server.invocations().len(),
        invocations_after_first,
        "the cached result must not re-run extraction"
    );
}
