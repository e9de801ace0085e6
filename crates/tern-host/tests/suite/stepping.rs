//! Stepping (one-shot breakpoint seeding), pause-on-exceptions,
//! pause-at-next-statement and reset.

use crate::harness::*;
use tern_jdwp::mock::MockEventRequestModifier;
use tern_jdwp::types::{
    EVENT_KIND_BREAKPOINT, EVENT_KIND_EXCEPTION, EVENT_KIND_METHOD_ENTRY, EVENT_KIND_METHOD_EXIT,
};
use tern_jdwp::Location;
use tern_host::{DebuggerEvent, ExceptionPauseMode, HostError, StepKind};

fn armed_breakpoint_locations(server: &tern_jdwp::mock::MockJdwpServer) -> Vec<Location> {
    server
        .event_requests()
        .iter()
        .filter(|r| r.event_kind == EVENT_KIND_BREAKPOINT)
        .flat_map(|r| {
            r.modifiers.iter().filter_map(|m| match m {
                MockEventRequestModifier::LocationOnly { location } => Some(*location),
                _ => None,
            })
        })
        .collect()
}

#[tokio::test]
async fn step_over_seeds_lines_after_the_current_one_and_resumes() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    let resumes_before = fixture.server.vm_resume_calls();
    fixture.host.step(StepKind::Over).await.unwrap();
    wait_for(&mut fixture.events, |e| matches!(e, DebuggerEvent::Resumed)).await;

    let armed = armed_breakpoint_locations(&fixture.server);
    // Paused on line 2: lines 3 and 4 of the same method get one-shots;
    // lines 1 and 2 must not (the user breakpoint at line 2 stays, so the
    // line-2 location appears exactly once).
    assert!(armed.contains(&line_location(3)));
    assert!(armed.contains(&line_location(4)));
    assert!(!armed.contains(&line_location(1)));
    assert_eq!(
        armed.iter().filter(|l| **l == line_location(2)).count(),
        1,
        "only the pre-existing user breakpoint remains on the current line"
    );
    assert!(fixture.server.vm_resume_calls() > resumes_before);
}

#[tokio::test]
async fn step_into_seeds_every_breakable_location() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    fixture.host.step(StepKind::Into).await.unwrap();
    wait_for(&mut fixture.events, |e| matches!(e, DebuggerEvent::Resumed)).await;

    let armed = armed_breakpoint_locations(&fixture.server);
    for line in 1..=4 {
        assert!(
            armed.contains(&line_location(line)),
            "step-into must arm line {line}"
        );
    }
}

#[tokio::test]
async fn step_requires_a_pause() {
    let fixture = attach_nashorn().await;
    let err = fixture.host.step(StepKind::Out).await.unwrap_err();
    assert!(matches!(err, HostError::IllegalState(_)));
}

#[tokio::test]
async fn one_shot_seeds_are_cleared_on_the_next_pause() {
    let mut fixture = attach_nashorn().await;
    pause_on_line_2(&mut fixture).await;

    fixture.host.step(StepKind::Over).await.unwrap();
    wait_for(&mut fixture.events, |e| matches!(e, DebuggerEvent::Resumed)).await;
    assert!(armed_breakpoint_locations(&fixture.server).contains(&line_location(3)));

    // The step lands: the seeded one-shot fires and every seed is cleared.
    prime_pause_invokes(&fixture.server);
    fixture
        .server
        .emit_breakpoint(THREAD, line_location(3))
        .await
        .expect("one-shot request armed at line 3");
    wait_for(&mut fixture.events, |e| {
        matches!(e, DebuggerEvent::HitBreakpoint(_))
    })
    .await;

    let armed = armed_breakpoint_locations(&fixture.server);
    assert!(!armed.contains(&line_location(3)));
    assert!(!armed.contains(&line_location(4)));
}

#[tokio::test]
async fn pause_on_exceptions_installs_a_filtered_request() {
    let fixture = attach_nashorn().await;
    fixture
        .host
        .pause_on_exceptions(ExceptionPauseMode::Uncaught)
        .await
        .unwrap();

    let requests = fixture.server.event_requests();
    let exception = requests
        .iter()
        .find(|r| r.event_kind == EVENT_KIND_EXCEPTION)
        .expect("an exception request is installed");
    assert!(exception.modifiers.iter().any(|m| matches!(
        m,
        MockEventRequestModifier::ExceptionOnly {
            caught: false,
            uncaught: true,
            ..
        }
    )));
    assert!(exception.modifiers.iter().any(|m| matches!(
        m,
        MockEventRequestModifier::ClassMatch { pattern } if pattern.starts_with("jdk.nashorn.internal.scripts.")
    )));

    // Switching to None removes it again.
    fixture
        .host
        .pause_on_exceptions(ExceptionPauseMode::None)
        .await
        .unwrap();
    assert!(!fixture
        .server
        .event_requests()
        .iter()
        .any(|r| r.event_kind == EVENT_KIND_EXCEPTION));
}

#[tokio::test]
async fn uncaught_exceptions_pause_and_announce_the_error() {
    let mut fixture = attach_nashorn().await;
    fixture.host.pause_on_breakpoints().await.unwrap();
    fixture
        .host
        .pause_on_exceptions(ExceptionPauseMode::Uncaught)
        .await
        .unwrap();

    prime_pause_invokes(&fixture.server);
    fixture
        .server
        .emit_exception(THREAD, line_location(2), ECMA_EXC_OBJ, false)
        .await
        .expect("exception request armed");

    let error = match wait_for(&mut fixture.events, |e| {
        matches!(e, DebuggerEvent::UncaughtError(_))
    })
    .await
    {
        DebuggerEvent::UncaughtError(error) => error,
        _ => unreachable!(),
    };
    assert_eq!(error.message, "oops");

    wait_for(&mut fixture.events, |e| {
        matches!(e, DebuggerEvent::HitBreakpoint(_))
    })
    .await;
}

#[tokio::test]
async fn pause_at_next_statement_arms_and_disarms() {
    let mut fixture = attach_nashorn().await;
    fixture.host.pause_on_breakpoints().await.unwrap();

    fixture.host.pause_at_next_statement().await.unwrap();
    assert_eq!(fixture.server.vm_suspend_calls(), 1);

    let requests = fixture.server.event_requests();
    assert!(requests
        .iter()
        .any(|r| r.event_kind == EVENT_KIND_METHOD_ENTRY));
    assert!(requests
        .iter()
        .any(|r| r.event_kind == EVENT_KIND_METHOD_EXIT));
    // The main thread sits in `:program`, so its line locations are armed.
    assert!(armed_breakpoint_locations(&fixture.server).contains(&line_location(1)));

    // The first event tears all arms down.
    prime_pause_invokes(&fixture.server);
    fixture
        .server
        .emit_breakpoint(THREAD, line_location(2))
        .await
        .expect("one-shot armed at the current line");
    wait_for(&mut fixture.events, |e| {
        matches!(e, DebuggerEvent::HitBreakpoint(_))
    })
    .await;

    let requests = fixture.server.event_requests();
    assert!(!requests
        .iter()
        .any(|r| r.event_kind == EVENT_KIND_METHOD_ENTRY
            || r.event_kind == EVENT_KIND_METHOD_EXIT));
    assert!(!armed_breakpoint_locations(&fixture.server).contains(&line_location(1)));
}

#[tokio::test]
async fn reset_clears_breakpoints_and_resumes() {
    let mut fixture = attach_nashorn().await;
    let frames = pause_on_line_2(&mut fixture).await;
    assert!(!frames.is_empty());

    fixture.host.reset().await.unwrap();
    wait_for(&mut fixture.events, |e| matches!(e, DebuggerEvent::Resumed)).await;

    // The user breakpoint is gone and the host reports not-paused.
    assert!(armed_breakpoint_locations(&fixture.server)
        .iter()
        .all(|l| *l != line_location(2)));
    let err = fixture.host.resume().await.unwrap_err();
    assert!(matches!(err, HostError::IllegalState(_)));
}
