//! Message dispatcher (component C10): parses the inbound envelope into a
//! tagged union and routes to the matching handler.
//!
//! Per the redesign flag on dynamic dispatch-by-type, there is no default
//! callback: an envelope whose `type` is not one of the named arms routes to
//! an explicit `unknown_type` error rather than falling through silently.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::token_service::TokenService;
use crate::broker::{ChannelBroker, Priority};
use crate::core::now_iso;
use crate::error::HubError;
use crate::rate_limit::{RateLimitConfig, RateLimitResult, RateLimitStore};
use crate::session::registry::{InvalidationReason, SessionRegistry};
use crate::users::UserStore;
use crate::ws::connection::{ConnectionHandle, ConnectionRegistry};

#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub r#ref: Option<String>,
}

/// The tagged union of routes the dispatcher recognizes, sniffed from
/// `InboundEnvelope::type` rather than matched on the raw string at every
/// call site.
enum InboundType {
    Auth,
    Echo,
    UserCreate,
    UserGet,
    UserUpdate,
    UserDelete,
    UserList,
    ChannelCreate,
    ChannelSubscribe,
    ChannelUnsubscribe,
    ChannelPublish,
    ChannelList,
    ChannelRemove,
    Heartbeat,
    Unknown,
}

impl From<&str> for InboundType {
    fn from(s: &str) -> Self {
        match s {
            "auth" => InboundType::Auth,
            "echo" => InboundType::Echo,
            "user.create" => InboundType::UserCreate,
            "user.get" => InboundType::UserGet,
            "user.update" => InboundType::UserUpdate,
            "user.delete" => InboundType::UserDelete,
            "user.list" => InboundType::UserList,
            "channel.create" => InboundType::ChannelCreate,
            "channel.subscribe" => InboundType::ChannelSubscribe,
            "channel.unsubscribe" => InboundType::ChannelUnsubscribe,
            "channel.publish" => InboundType::ChannelPublish,
            "channel.list" => InboundType::ChannelList,
            "channel.remove" => InboundType::ChannelRemove,
            "heartbeat" => InboundType::Heartbeat,
            _ => InboundType::Unknown,
        }
    }
}

/// Everything a dispatch call needs, borrowed for the duration of one
/// envelope. Built fresh per call by the connection worker from its
/// `Arc<AppState>`.
pub struct DispatchContext<'a> {
    pub connection_id: &'a str,
    pub is_authenticated: bool,
    pub user_id: Option<&'a str>,
    pub ip: &'a str,
    pub tokens: &'a TokenService,
    pub sessions: &'a SessionRegistry,
    pub rate_limits: &'a RateLimitStore,
    pub users: &'a UserStore,
    pub broker: &'a ChannelBroker,
    pub connections: &'a ConnectionRegistry,
}

pub struct DispatchOutcome {
    pub reply: Value,
    /// Set when `auth` succeeds, so the worker can bind the connection.
    pub bind_session: Option<(String, String)>,
}

fn reply(r#type: &str, payload: Value, r#ref: &Option<String>) -> DispatchOutcome {
    DispatchOutcome {
        reply: json!({ "type": r#type, "payload": payload, "ref": r#ref }),
        bind_session: None,
    }
}

pub fn dispatch(envelope: InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    match InboundType::from(envelope.r#type.as_str()) {
        InboundType::Auth => handle_auth(envelope, ctx),
        InboundType::Echo => guard_auth(ctx, &envelope.r#ref, || handle_echo(&envelope)),
        InboundType::UserCreate => guard_auth(ctx, &envelope.r#ref, || handle_user_create(&envelope, ctx)),
        InboundType::UserGet => guard_auth(ctx, &envelope.r#ref, || handle_user_get(&envelope, ctx)),
        InboundType::UserUpdate => guard_auth(ctx, &envelope.r#ref, || handle_user_update(&envelope, ctx)),
        InboundType::UserDelete => guard_auth(ctx, &envelope.r#ref, || handle_user_delete(&envelope, ctx)),
        InboundType::UserList => guard_auth(ctx, &envelope.r#ref, || handle_user_list(ctx)),
        InboundType::ChannelCreate => guard_auth(ctx, &envelope.r#ref, || handle_channel_create(&envelope, ctx)),
        InboundType::ChannelSubscribe => {
            guard_auth(ctx, &envelope.r#ref, || handle_channel_subscribe(&envelope, ctx))
        }
        InboundType::ChannelUnsubscribe => {
            guard_auth(ctx, &envelope.r#ref, || handle_channel_unsubscribe(&envelope, ctx))
        }
        InboundType::ChannelPublish => guard_auth(ctx, &envelope.r#ref, || handle_channel_publish(&envelope, ctx)),
        InboundType::ChannelList => guard_auth(ctx, &envelope.r#ref, || handle_channel_list(ctx)),
        InboundType::ChannelRemove => guard_auth(ctx, &envelope.r#ref, || handle_channel_remove(&envelope, ctx)),
        InboundType::Heartbeat => reply("heartbeat", json!({}), &envelope.r#ref),
        InboundType::Unknown => error_reply(HubError::UnknownType, &envelope.r#ref),
    }
}

fn error_reply(err: HubError, r#ref: &Option<String>) -> DispatchOutcome {
    let envelope = err.to_envelope(r#ref.clone());
    DispatchOutcome {
        reply: serde_json::to_value(envelope).expect("error envelope always serializes"),
        bind_session: None,
    }
}

fn guard_auth(ctx: &DispatchContext, r#ref: &Option<String>, f: impl FnOnce() -> DispatchOutcome) -> DispatchOutcome {
    if !ctx.is_authenticated {
        return error_reply(HubError::Unauthorized, r#ref);
    }
    f()
}

#[derive(Deserialize)]
struct AuthByPassword {
    username: String,
    password: String,
    #[serde(default)]
    remember_me: bool,
}

#[derive(Deserialize)]
struct AuthByToken {
    token: String,
}

fn handle_auth(envelope: InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    if let Ok(by_token) = serde_json::from_value::<AuthByToken>(envelope.payload.clone()) {
        return match ctx.tokens.verify_access(&by_token.token) {
            Ok(claims) => finish_auth(&claims.sub, false, ctx, &envelope.r#ref),
            Err(_) => reply(
                "auth.failure",
                json!({"code": "invalid_token"}),
                &envelope.r#ref,
            ),
        };
    }

    let by_password: AuthByPassword = match serde_json::from_value(envelope.payload.clone()) {
        Ok(v) => v,
        Err(_) => return error_reply(HubError::InvalidPayload, &envelope.r#ref),
    };

    let scope_id = format!("{}:{}", ctx.ip, by_password.username);
    let config = RateLimitConfig::auth_login();

    match ctx.users.authenticate(&by_password.username, &by_password.password) {
        Ok(user) => match ctx.rate_limits.record("auth_login", &scope_id, Some(true), &config) {
            RateLimitResult::Locked { retry_after_ms } => reply(
                "auth.failure",
                json!({"code": "account_locked", "retry_after_ms": retry_after_ms}),
                &envelope.r#ref,
            ),
            RateLimitResult::Ok { .. } => {
                finish_auth(&user.user_id, by_password.remember_me, ctx, &envelope.r#ref)
            }
        },
        Err(_) => match ctx.rate_limits.record("auth_login", &scope_id, Some(false), &config) {
            RateLimitResult::Locked { retry_after_ms } => reply(
                "auth.failure",
                json!({"code": "account_locked", "retry_after_ms": retry_after_ms}),
                &envelope.r#ref,
            ),
            RateLimitResult::Ok { .. } => reply(
                "auth.failure",
                json!({"code": "invalid_credentials"}),
                &envelope.r#ref,
            ),
        },
    }
}

fn finish_auth(user_id: &str, remember: bool, ctx: &DispatchContext, r#ref: &Option<String>) -> DispatchOutcome {
    let pair = ctx.tokens.issue_pair(user_id, remember);
    let session_id = ctx.sessions.create(
        user_id,
        std::collections::HashMap::new(),
        ctx.ip,
        "",
        remember,
    );
    DispatchOutcome {
        reply: json!({
            "type": "auth.success",
            "ref": r#ref,
            "payload": {
                "user_id": user_id,
                "session_id": session_id,
                "access_token": pair.access_token,
                "refresh_token": pair.refresh_token,
                "expires_in_s": pair.expires_in_s,
            }
        }),
        bind_session: Some((user_id.to_string(), session_id)),
    }
}

fn handle_echo(envelope: &InboundEnvelope) -> DispatchOutcome {
    let mut payload = envelope.payload.clone();
    if let Value::Object(ref mut map) = payload {
        map.insert("timestamp".to_string(), json!(now_iso()));
    }
    reply("echo.response", payload, &envelope.r#ref)
}

#[derive(Deserialize)]
struct UserCreateRequest {
    username: String,
    email: String,
    password: String,
}

fn handle_user_create(envelope: &InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    let req: UserCreateRequest = match serde_json::from_value(envelope.payload.clone()) {
        Ok(v) => v,
        Err(_) => return error_reply(HubError::InvalidPayload, &envelope.r#ref),
    };
    match ctx.users.create(&req.username, &req.email, &req.password) {
        Ok(user) => reply(
            "user.create.response",
            serde_json::to_value(&user).unwrap_or(json!({})),
            &envelope.r#ref,
        ),
        Err(_) => error_reply(HubError::InvalidPayload, &envelope.r#ref),
    }
}

#[derive(Deserialize)]
struct UserIdRequest {
    user_id: String,
}

fn handle_user_get(envelope: &InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    let req: UserIdRequest = match serde_json::from_value(envelope.payload.clone()) {
        Ok(v) => v,
        Err(_) => return error_reply(HubError::InvalidPayload, &envelope.r#ref),
    };
    match ctx.users.get(&req.user_id) {
        Ok(user) => reply(
            "user.get.response",
            serde_json::to_value(&user).unwrap_or(json!({})),
            &envelope.r#ref,
        ),
        Err(_) => error_reply(HubError::UserNotFound, &envelope.r#ref),
    }
}

#[derive(Deserialize)]
struct UserUpdateRequest {
    user_id: String,
    email: String,
}

fn handle_user_update(envelope: &InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    let req: UserUpdateRequest = match serde_json::from_value(envelope.payload.clone()) {
        Ok(v) => v,
        Err(_) => return error_reply(HubError::InvalidPayload, &envelope.r#ref),
    };
    match ctx.users.update_email(&req.user_id, &req.email) {
        Ok(user) => reply(
            "user.update.response",
            serde_json::to_value(&user).unwrap_or(json!({})),
            &envelope.r#ref,
        ),
        Err(_) => error_reply(HubError::UserNotFound, &envelope.r#ref),
    }
}

fn handle_user_delete(envelope: &InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    let req: UserIdRequest = match serde_json::from_value(envelope.payload.clone()) {
        Ok(v) => v,
        Err(_) => return error_reply(HubError::InvalidPayload, &envelope.r#ref),
    };
    match ctx.users.delete(&req.user_id) {
        Ok(()) => reply("user.delete.response", json!({"user_id": req.user_id}), &envelope.r#ref),
        Err(_) => error_reply(HubError::UserNotFound, &envelope.r#ref),
    }
}

fn handle_user_list(ctx: &DispatchContext) -> DispatchOutcome {
    let users = ctx.users.list();
    reply(
        "user.list.response",
        json!({"users": users}),
        &None,
    )
}

#[derive(Deserialize)]
struct ChannelCreateRequest {
    topic: String,
}

fn handle_channel_create(envelope: &InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    let req: ChannelCreateRequest = match serde_json::from_value(envelope.payload.clone()) {
        Ok(v) => v,
        Err(_) => return error_reply(HubError::InvalidPayload, &envelope.r#ref),
    };
    let owner = ctx.user_id.unwrap_or(ctx.connection_id);
    let topic = ctx.broker.create(&req.topic, owner);
    reply("channel.create.response", json!({"topic": topic}), &envelope.r#ref)
}

#[derive(Deserialize)]
struct ChannelTopicRequest {
    topic: String,
}

fn handle_channel_subscribe(envelope: &InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    let req: ChannelTopicRequest = match serde_json::from_value(envelope.payload.clone()) {
        Ok(v) => v,
        Err(_) => return error_reply(HubError::InvalidPayload, &envelope.r#ref),
    };
    let handle: ConnectionHandle = match ctx.connections.handle(ctx.connection_id) {
        Some(h) => h,
        None => return error_reply(HubError::InternalError, &envelope.r#ref),
    };
    ctx.broker.subscribe(&req.topic, ctx.connection_id, handle, None);
    ctx.connections.add_subscription(ctx.connection_id, &req.topic);
    reply(
        "channel.subscribe.response",
        json!({"topic": req.topic}),
        &envelope.r#ref,
    )
}

fn handle_channel_unsubscribe(envelope: &InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    let req: ChannelTopicRequest = match serde_json::from_value(envelope.payload.clone()) {
        Ok(v) => v,
        Err(_) => return error_reply(HubError::InvalidPayload, &envelope.r#ref),
    };
    ctx.broker.unsubscribe(&req.topic, ctx.connection_id);
    ctx.connections.remove_subscription(ctx.connection_id, &req.topic);
    reply(
        "channel.unsubscribe.response",
        json!({"topic": req.topic}),
        &envelope.r#ref,
    )
}

#[derive(Deserialize)]
struct ChannelPublishRequest {
    topic: String,
    #[serde(flatten)]
    rest: Value,
}

fn handle_channel_publish(envelope: &InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    let req: ChannelPublishRequest = match serde_json::from_value(envelope.payload.clone()) {
        Ok(v) => v,
        Err(_) => return error_reply(HubError::InvalidPayload, &envelope.r#ref),
    };
    match ctx.broker.publish(&req.topic, req.rest, Priority::Normal) {
        Ok(outcome) => reply(
            "channel.publish.response",
            json!({"message_id": outcome.message_id}),
            &envelope.r#ref,
        ),
        Err(HubError::Backpressure) => error_reply(HubError::Backpressure, &envelope.r#ref),
        Err(_) => error_reply(HubError::InvalidPayload, &envelope.r#ref),
    }
}

fn handle_channel_list(ctx: &DispatchContext) -> DispatchOutcome {
    reply("channel.list.response", json!({"topics": ctx.broker.list()}), &None)
}

fn handle_channel_remove(envelope: &InboundEnvelope, ctx: &DispatchContext) -> DispatchOutcome {
    let req: ChannelTopicRequest = match serde_json::from_value(envelope.payload.clone()) {
        Ok(v) => v,
        Err(_) => return error_reply(HubError::InvalidPayload, &envelope.r#ref),
    };
    let caller = ctx.user_id.unwrap_or(ctx.connection_id);
    match ctx.broker.remove(&req.topic, caller) {
        Ok(()) => reply("channel.remove.response", json!({"topic": req.topic}), &envelope.r#ref),
        Err(_) => error_reply(HubError::InvalidPayload, &envelope.r#ref),
    }
}

/// Reason a session was invalidated, surfaced so callers (sweep task) can
/// emit the matching wire event without importing `session::registry` directly.
pub fn invalidation_reason_str(reason: InvalidationReason) -> &'static str {
    reason.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_service::{JwtConfig, TokenService};
    use crate::broker::ChannelBroker;
    use crate::rate_limit::RateLimitStore;
    use crate::session::registry::SessionRegistry;
    use crate::users::UserStore;
    use crate::ws::connection::ConnectionRegistry;

    fn harness() -> (TokenService, SessionRegistry, RateLimitStore, UserStore, ChannelBroker, ConnectionRegistry) {
        let tokens = TokenService::new(JwtConfig {
            signing_key: b"test-signing-key-at-least-32-bytes".to_vec(),
            access_ttl_s: 3600,
            refresh_ttl_s: 2_592_000,
            remember_me_ttl_s: 15_552_000,
        });
        let sessions = SessionRegistry::new(5, 1800, 2_592_000);
        let rate_limits = RateLimitStore::new();
        let users = UserStore::new();
        let broker = ChannelBroker::new(1_000);
        let connections = ConnectionRegistry::new();
        (tokens, sessions, rate_limits, users, broker, connections)
    }

    #[test]
    fn happy_path_auth_then_echo() {
        let (tokens, sessions, rate_limits, users, broker, connections) = harness();
        users.create("alice", "alice@example.com", "Secret!1").unwrap();
        connections.register("c1".into(), std::collections::HashMap::new());

        let ctx = DispatchContext {
            connection_id: "c1",
            is_authenticated: false,
            user_id: None,
            ip: "1.2.3.4",
            tokens: &tokens,
            sessions: &sessions,
            rate_limits: &rate_limits,
            users: &users,
            broker: &broker,
            connections: &connections,
        };

        let envelope = InboundEnvelope {
            r#type: "auth".into(),
            payload: json!({"username": "alice", "password": "Secret!1"}),
            r#ref: Some("1".into()),
        };
        let outcome = dispatch(envelope, &ctx);
        assert_eq!(outcome.reply["type"], "auth.success");
        assert!(outcome.bind_session.is_some());

        let ctx_authed = DispatchContext {
            is_authenticated: true,
            user_id: Some("u_alice"),
            ..ctx
        };
        let echo = InboundEnvelope {
            r#type: "echo".into(),
            payload: json!({"message": "hi"}),
            r#ref: Some("2".into()),
        };
        let outcome2 = dispatch(echo, &ctx_authed);
        assert_eq!(outcome2.reply["type"], "echo.response");
        assert_eq!(outcome2.reply["payload"]["message"], "hi");
    }

    #[test]
    fn unauthenticated_echo_is_rejected() {
        let (tokens, sessions, rate_limits, users, broker, connections) = harness();
        connections.register("c1".into(), std::collections::HashMap::new());
        let ctx = DispatchContext {
            connection_id: "c1",
            is_authenticated: false,
            user_id: None,
            ip: "1.2.3.4",
            tokens: &tokens,
            sessions: &sessions,
            rate_limits: &rate_limits,
            users: &users,
            broker: &broker,
            connections: &connections,
        };
        let echo = InboundEnvelope {
            r#type: "echo".into(),
            payload: json!({}),
            r#ref: None,
        };
        let outcome = dispatch(echo, &ctx);
        assert_eq!(outcome.reply["payload"]["code"], "unauthorized");
    }

    #[test]
    fn unknown_type_routes_to_explicit_error() {
        let (tokens, sessions, rate_limits, users, broker, connections) = harness();
        connections.register("c1".into(), std::collections::HashMap::new());
        let ctx = DispatchContext {
            connection_id: "c1",
            is_authenticated: true,
            user_id: Some("u1"),
            ip: "1.2.3.4",
            tokens: &tokens,
            sessions: &sessions,
            rate_limits: &rate_limits,
            users: &users,
            broker: &broker,
            connections: &connections,
        };
        let envelope = InboundEnvelope {
            r#type: "something.else".into(),
            payload: json!({}),
            r#ref: None,
        };
        let outcome = dispatch(envelope, &ctx);
        assert_eq!(outcome.reply["payload"]["code"], "unknown_type");
    }

    #[test]
    fn brute_force_locks_on_sixth_failure() {
        let (tokens, sessions, rate_limits, users, broker, connections) = harness();
        users.create("bob", "bob@example.com", "Secret!1").unwrap();
        connections.register("c1".into(), std::collections::HashMap::new());
        let ctx = DispatchContext {
            connection_id: "c1",
            is_authenticated: false,
            user_id: None,
            ip: "1.2.3.4",
            tokens: &tokens,
            sessions: &sessions,
            rate_limits: &rate_limits,
            users: &users,
            broker: &broker,
            connections: &connections,
        };

        for _ in 0..5 {
            let envelope = InboundEnvelope {
                r#type: "auth".into(),
                payload: json!({"username": "bob", "password": "wrong"}),
                r#ref: None,
            };
            let outcome = dispatch(envelope, &ctx);
            assert_eq!(outcome.reply["payload"]["code"], "invalid_credentials");
        }

        let envelope = InboundEnvelope {
            r#type: "auth".into(),
            payload: json!({"username": "bob", "password": "wrong"}),
            r#ref: None,
        };
        let outcome = dispatch(envelope, &ctx);
        assert_eq!(outcome.reply["payload"]["code"], "account_locked");

        let envelope = InboundEnvelope {
            r#type: "auth".into(),
            payload: json!({"username": "bob", "password": "Secret!1"}),
            r#ref: None,
        };
        let outcome = dispatch(envelope, &ctx);
        assert_eq!(outcome.reply["payload"]["code"], "account_locked");
    }
}
