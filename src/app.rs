//! Wires every component into one shared, `Arc`-held application state.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::auth::token_service::{JwtConfig, TokenService};
use crate::broker::ChannelBroker;
use crate::config::AppConfig;
use crate::rate_limit::RateLimitStore;
use crate::security::{CsrfStore, OriginBlacklist, RequestGate};
use crate::session::registry::SessionRegistry;
use crate::users::UserStore;
use crate::ws::connection::ConnectionRegistry;

pub struct AppState {
    pub config: AppConfig,
    pub tokens: TokenService,
    pub sessions: SessionRegistry,
    pub rate_limits: RateLimitStore,
    pub request_gate: RequestGate,
    pub broker: ChannelBroker,
    pub connections: ConnectionRegistry,
    pub users: UserStore,
    pub started_at_s: u64,
    /// Fired once on SIGTERM/Ctrl-C; every connection worker holds a
    /// receiver and closes with code 1001 on the first tick it observes.
    pub shutdown: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let tokens = TokenService::new(JwtConfig::from_app_config(&config));
        let sessions = SessionRegistry::new(
            config.max_sessions_per_user,
            config.inactivity_timeout_s,
            config.refresh_token_ttl_s,
        );
        let rate_limits = RateLimitStore::new();
        let request_gate = RequestGate::new(
            crate::rate_limit::RateLimitConfig::connect_rate(config.rate_limit_max, config.rate_limit_window_s * 1000),
            config.allowed_origins.clone(),
            config.csrf_required,
            OriginBlacklist::empty(),
        );
        let broker = ChannelBroker::new(config.broker_queue_threshold);
        let connections = ConnectionRegistry::new();
        let users = UserStore::new();
        let started_at_s = crate::core::now_s();
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            tokens,
            sessions,
            rate_limits,
            request_gate,
            broker,
            connections,
            users,
            started_at_s,
            shutdown,
        }
    }

    pub fn csrf_store(&self) -> &CsrfStore {
        self.request_gate.csrf_store()
    }

    /// Broadcast the shutdown signal, then poll until every connection has
    /// drained or `deadline` elapses — whichever comes first. Workers that
    /// are still open when the deadline passes are left to the final
    /// `axum::serve` graceful-shutdown drain (the worker's own shutdown
    /// branch still fires on the next select tick and closes with 1001).
    pub async fn drain(&self, deadline: std::time::Duration) {
        let _ = self.shutdown.send(());
        let start = tokio::time::Instant::now();
        while self.connections.current_connections() > 0 && start.elapsed() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// Runs the three background sweepers this hub needs: revocation GC,
    /// session inactivity/expiry sweep (at most once per minute per §4.3),
    /// and rate-limit GC. Intended to be spawned once at startup.
    pub async fn run_sweepers(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            self.tokens.sweep();
            self.rate_limits.sweep();
            let invalidated = self.sessions.sweep();
            for (session_id, reason) in invalidated {
                tracing::info!(session_id = %session_id, reason = reason.as_str(), "session_invalidated");
            }
        }
    }
}
