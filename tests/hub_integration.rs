//! End-to-end scenarios driven directly against the dispatcher/broker/session
//! APIs, per the connection-less testing approach: a live socket adds nothing
//! a unit test over `dispatch::dispatch` doesn't already cover, so these
//! exercise multiple components together instead of opening a real `/ws`.

use std::collections::HashMap;

use serde_json::json;

use deeperhub_core::app::AppState;
use deeperhub_core::broker::Priority;
use deeperhub_core::config::AppConfig;
use deeperhub_core::dispatch::{dispatch, DispatchContext, InboundEnvelope};
use deeperhub_core::session::InvalidationReason;
use deeperhub_core::ws::connection::Delivery;

fn state() -> AppState {
    AppState::new(AppConfig::for_test())
}

fn ctx_for<'a>(state: &'a AppState, connection_id: &'a str, authenticated: bool, user_id: Option<&'a str>) -> DispatchContext<'a> {
    DispatchContext {
        connection_id,
        is_authenticated: authenticated,
        user_id,
        ip: "127.0.0.1",
        tokens: &state.tokens,
        sessions: &state.sessions,
        rate_limits: &state.rate_limits,
        users: &state.users,
        broker: &state.broker,
        connections: &state.connections,
    }
}

#[test]
fn auth_then_channel_fan_out_delivers_exactly_once_per_subscriber() {
    let state = state();
    state.users.create("alice", "alice@example.com", "Secret!1").unwrap();

    state.connections.register("publisher".into(), HashMap::new());
    let (_sub_handle, mut sub_rx) = state.connections.register("subscriber".into(), HashMap::new());

    // publisher authenticates
    let auth_ctx = ctx_for(&state, "publisher", false, None);
    let auth = dispatch(
        InboundEnvelope {
            r#type: "auth".into(),
            payload: json!({"username": "alice", "password": "Secret!1"}),
            r#ref: None,
        },
        &auth_ctx,
    );
    let (user_id, session_id) = auth.bind_session.expect("auth must bind a session");
    state.connections.bind_session("publisher", &user_id, &session_id);

    // subscriber joins the topic via the broker directly (no auth needed to subscribe in this test)
    let handle = state.connections.handle("subscriber").unwrap();
    state.broker.subscribe("room:1", "subscriber", handle, None);

    let publisher_ctx = ctx_for(&state, "publisher", true, Some(&user_id));
    let outcome = dispatch(
        InboundEnvelope {
            r#type: "channel.publish".into(),
            payload: json!({"topic": "room:1", "content": "hello room"}),
            r#ref: Some("7".into()),
        },
        &publisher_ctx,
    );
    assert_eq!(outcome.reply["type"], "channel.publish.response");

    let delivery = sub_rx.try_recv().expect("subscriber should receive exactly one message");
    match delivery {
        Delivery::Envelope(env) => {
            assert_eq!(env["type"], "channel.message");
            assert_eq!(env["topic"], "room:1");
            assert_eq!(env["payload"]["content"], "hello room");
        }
        Delivery::Close(..) => panic!("expected an envelope delivery"),
    }
    assert!(sub_rx.try_recv().is_err(), "no second delivery should be queued");
}

#[test]
fn xss_sanitization_runs_before_dispatch_sees_the_payload() {
    let state = state();
    state.users.create("bob", "bob@example.com", "Secret!1").unwrap();
    state.connections.register("c1".into(), HashMap::new());

    let auth_ctx = ctx_for(&state, "c1", false, None);
    let auth = dispatch(
        InboundEnvelope {
            r#type: "auth".into(),
            payload: json!({"username": "bob", "password": "Secret!1"}),
            r#ref: None,
        },
        &auth_ctx,
    );
    let (user_id, _) = auth.bind_session.unwrap();

    // Simulate the worker's message-gate pass over an inbound echo payload.
    let mut raw = json!({"type": "echo", "payload": {"message": "<script>alert(1)</script>"}, "ref": "1"});
    let outcome = deeperhub_core::security::message_gate(raw.get_mut("payload").unwrap(), "data");
    assert!(outcome.is_allow());

    let envelope: InboundEnvelope = serde_json::from_value(raw).unwrap();
    let authed_ctx = ctx_for(&state, "c1", true, Some(&user_id));
    let result = dispatch(envelope, &authed_ctx);

    assert_eq!(result.reply["type"], "echo.response");
    let echoed = result.reply["payload"]["message"].as_str().unwrap();
    assert!(!echoed.contains("<script>"));
    assert!(echoed.contains("&lt;script&gt;"));
}

#[test]
fn idle_session_is_invalidated_by_the_sweeper_after_inactivity_timeout() {
    use deeperhub_core::session::SessionRegistry;

    let sessions = SessionRegistry::new(5, 0, 2_592_000);
    let session_id = sessions.create("u1", HashMap::new(), "1.2.3.4", "ua", false);
    assert!(sessions.validate(&session_id).is_ok());

    // inactivity_timeout_s is 0, so any elapsed wall-clock second trips it.
    std::thread::sleep(std::time::Duration::from_millis(1100));

    let invalidated = sessions.sweep();
    assert_eq!(invalidated.len(), 1);
    assert_eq!(invalidated[0].0, session_id);
    assert_eq!(invalidated[0].1, InvalidationReason::Timeout);
    assert_eq!(sessions.active_count("u1"), 0);
}

#[test]
fn disconnect_path_removes_subscriptions_and_invalidates_the_bound_session() {
    let state = state();
    state.users.create("carol", "carol@example.com", "Secret!1").unwrap();
    state.connections.register("c1".into(), HashMap::new());

    let auth_ctx = ctx_for(&state, "c1", false, None);
    let auth = dispatch(
        InboundEnvelope {
            r#type: "auth".into(),
            payload: json!({"username": "carol", "password": "Secret!1"}),
            r#ref: None,
        },
        &auth_ctx,
    );
    let (user_id, session_id) = auth.bind_session.unwrap();
    state.connections.bind_session("c1", &user_id, &session_id);

    let handle = state.connections.handle("c1").unwrap();
    state.broker.subscribe("room:2", "c1", handle, None);
    assert_eq!(state.broker.topic_metrics("room:2").unwrap().subscriber_count, 1);

    // What ws::worker::run_connection does on the way out.
    state.broker.remove_subscriber_everywhere("c1");
    state.sessions.invalidate(&session_id, InvalidationReason::Logout).unwrap();
    state.connections.deregister("c1");

    assert_eq!(state.broker.topic_metrics("room:2").unwrap().subscriber_count, 0);
    assert!(state.sessions.validate(&session_id).is_err());
    assert_eq!(state.connections.current_connections(), 0);
}

#[test]
fn backpressure_rejects_low_priority_publish_at_threshold() {
    let state = AppState::new(AppConfig::for_test());
    state.broker.create("busy-room", "owner");
    // `for_test()` sets broker_queue_threshold to 1_000; Low priority is only
    // rejected once queue_size reaches the threshold, which a single publish
    // never does, so assert the High/Low contrast at threshold 0 directly.
    let broker = deeperhub_core::broker::ChannelBroker::new(0);
    broker.create("t", "owner");
    assert_eq!(
        broker.publish("t", json!({}), Priority::Low),
        Err(deeperhub_core::HubError::Backpressure)
    );
    assert!(broker.publish("t", json!({}), Priority::High).is_ok());
}
