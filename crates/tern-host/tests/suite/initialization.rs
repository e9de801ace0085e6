//! Attach, quiescence-gated initialization, script discovery, dedup and
//! delayed source recovery.

use crate::harness::*;
use tern_jdwp::mock::{MockClass, MockMethod, MockObject};
use tern_jdwp::types::{TAG_ARRAY, TAG_CHAR};
use tern_jdwp::{JdwpValue, LineTable, LineTableEntry};
use tern_host::DebuggerEvent;

#[tokio::test]
async fn initialization_discovers_and_announces_the_script() {
    let fixture = attach_nashorn().await;

    let added: Vec<_> = fixture
        .boot_events
        .iter()
        .filter_map(|e| match e {
            DebuggerEvent::ScriptAdded(script) => Some(script.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(added.len(), 1, "expected exactly one ScriptAdded before init");
    assert_eq!(added[0].url().as_str(), TEST_SCRIPT_URL);
    assert_eq!(added[0].source(), TEST_SOURCE);

    let scripts = fixture.host.scripts().await.unwrap();
    assert_eq!(scripts.len(), 1);
    let script = fixture
        .host
        .script_by_id(scripts[0].id())
        .await
        .unwrap()
        .expect("script resolvable by id");
    assert_eq!(script.contents_hash().len(), 32);
    assert!(script.contents_hash().chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn recompiled_class_with_identical_source_aliases_the_script() {
    let fixture = attach_modified(|config| {
        // A recompilation: new class, no source file (synthetic eval path),
        // same Source object, same line layout.
        let mut recompiled = MockClass::new(
            RECOMPILED_SCRIPT_CLASS,
            "Ljdk/nashorn/internal/scripts/Script$Recompilation$2$test;",
        )
        .with_field(SOURCE_FIELD, "source", "Ljdk/nashorn/internal/runtime/Source;");
        recompiled
            .static_values
            .insert(SOURCE_FIELD, obj(SOURCE_OBJ));
        let mut program = MockMethod::named(PROGRAM_METHOD, ":program");
        program.line_table = Some(LineTable {
            start: 0,
            end: 40,
            lines: (1u64..=4)
                .map(|line| LineTableEntry {
                    code_index: u64::from(line - 1) * 10,
                    line: line as i32,
                })
                .collect(),
        });
        recompiled.methods.push(program);
        config.classes.push(recompiled);
    })
    .await;

    // Identical contents hash: both classes map to one script.
    let scripts = fixture.host.scripts().await.unwrap();
    assert_eq!(scripts.len(), 1, "recompilation must not create a second script");
}

#[tokio::test]
async fn script_source_is_recovered_after_retries() {
    let mut fixture = attach_nashorn().await;

    // A class shows up whose `source` field the engine has not populated
    // yet. The host must retry instead of dropping it.
    fixture.server.with_world(|world| {
        let mut lazy = MockClass::new(
            LAZY_SCRIPT_CLASS,
            "Ljdk/nashorn/internal/scripts/Script$lazy;",
        )
        .with_field(SOURCE_FIELD, "source", "Ljdk/nashorn/internal/runtime/Source;");
        let mut program = MockMethod::named(PROGRAM_METHOD, ":program");
        program.line_table = Some(LineTable {
            start: 0,
            end: 10,
            lines: vec![LineTableEntry {
                code_index: 0,
                line: 1,
            }],
        });
        lazy.methods.push(program);
        world.classes.push(lazy);

        world.objects.insert(
            LAZY_SOURCE_OBJ,
            MockObject::plain(SOURCE_CLASS).with_field(DATA_FIELD, obj(LAZY_DATA_OBJ)),
        );
        world.objects.insert(
            LAZY_DATA_OBJ,
            MockObject::plain(DATA_CLASS).with_field(
                ARRAY_FIELD,
                JdwpValue::Object {
                    tag: TAG_ARRAY,
                    id: LAZY_CHARS_OBJ,
                },
            ),
        );
        world.objects.insert(
            LAZY_CHARS_OBJ,
            MockObject::array(
                CHAR_ARRAY_CLASS,
                TAG_CHAR,
                "var lazy = true;\n".encode_utf16().map(JdwpValue::Char).collect(),
            ),
        );
    });

    fixture
        .server
        .emit_class_prepare(THREAD, LAZY_SCRIPT_CLASS)
        .await
        .expect("class-prepare request registered");

    // Let a couple of retry rounds fail before the engine "sets" the field.
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    fixture.server.with_world(|world| {
        let lazy = world
            .classes
            .iter_mut()
            .find(|c| c.type_id == LAZY_SCRIPT_CLASS)
            .unwrap();
        lazy.static_values.insert(SOURCE_FIELD, obj(LAZY_SOURCE_OBJ));
    });

    let event = wait_for(&mut fixture.events, |e| {
        matches!(e, DebuggerEvent::ScriptAdded(s) if s.url().as_str().starts_with("eval:"))
    })
    .await;
    match event {
        DebuggerEvent::ScriptAdded(script) => {
            assert_eq!(script.url().as_str(), "eval:///lazy");
            assert_eq!(script.source(), "var lazy = true;\n");
        }
        _ => unreachable!(),
    }

    let scripts = fixture.host.scripts().await.unwrap();
    assert_eq!(scripts.len(), 2);
}

#[tokio::test]
async fn class_prepare_during_a_pause_is_ignored() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    // A fully-resolvable script class loads while the host is suspended.
    fixture.server.with_world(|world| {
        let mut lazy = MockClass::new(
            LAZY_SCRIPT_CLASS,
            "Ljdk/nashorn/internal/scripts/Script$lazy;",
        )
        .with_field(SOURCE_FIELD, "source", "Ljdk/nashorn/internal/runtime/Source;");
        lazy.static_values.insert(SOURCE_FIELD, obj(LAZY_SOURCE_OBJ));
        let mut program = MockMethod::named(PROGRAM_METHOD, ":program");
        program.line_table = Some(LineTable {
            start: 0,
            end: 10,
            lines: vec![LineTableEntry {
                code_index: 0,
                line: 1,
            }],
        });
        lazy.methods.push(program);
        world.classes.push(lazy);

        world.objects.insert(
            LAZY_SOURCE_OBJ,
            MockObject::plain(SOURCE_CLASS).with_field(DATA_FIELD, obj(LAZY_DATA_OBJ)),
        );
        world.objects.insert(
            LAZY_DATA_OBJ,
            MockObject::plain(DATA_CLASS).with_field(
                ARRAY_FIELD,
                JdwpValue::Object {
                    tag: TAG_ARRAY,
                    id: LAZY_CHARS_OBJ,
                },
            ),
        );
        world.objects.insert(
            LAZY_CHARS_OBJ,
            MockObject::array(
                CHAR_ARRAY_CLASS,
                TAG_CHAR,
                "var lazy = true;\n".encode_utf16().map(JdwpValue::Char).collect(),
            ),
        );
    });
    fixture
        .server
        .emit_class_prepare(THREAD, LAZY_SCRIPT_CLASS)
        .await
        .expect("class-prepare request registered");

    // The event set is ignored while suspended: no registration, no
    // mid-pause ScriptAdded.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(fixture.host.scripts().await.unwrap().len(), 1);

    // An ignored prepare is not deferred either; the script stays unknown
    // after the resume.
    fixture.host.resume().await.unwrap();
    wait_for(&mut fixture.events, |e| matches!(e, DebuggerEvent::Resumed)).await;
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(fixture.host.scripts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn vm_death_completes_the_event_stream() {
    let mut fixture = attach_nashorn().await;

    fixture.server.emit_vm_death().await;

    let ended = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            match fixture.events.next().await {
                None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => panic!("unexpected bus error: {err}"),
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "event stream should complete on VM death");
}
