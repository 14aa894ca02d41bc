use std::net::SocketAddr;
use std::sync::Arc;

use app::build_router;
use time::OffsetDateTime;

pub mod app;
pub mod approval;
pub mod config;
mod correlator;
pub mod manager;
pub mod probe;
pub mod protocol;
pub mod router;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod turns;

pub use approval::{
    Decision, InMemoryProposalStore, JsonFileProposalStore, Proposal, ProposalDraft,
    ProposalStatus, ProposalStore,
};
pub use assistant_session_error::{ErrorType, ProblemDetails, SessionError};
pub use config::{LaunchSpec, SessionConfig, TransportKind};
pub use manager::{SessionManager, SessionStatus, TurnSubscription};
pub use probe::{CommandReadinessProbe, ProbeReport, ReadinessProbe, StaticReadinessProbe};
pub use session::{ApprovalOutcome, Diagnostic, SessionInfo};
pub use transport::{AgentConnection, AgentLauncher, ProcessLauncher};
pub use turns::{StartTurnInput, TurnEvent, TurnEventKind, TurnRecord, TurnStatus, TurnTarget};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session: SessionConfig,
}

pub async fn run_server(
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let manager = Arc::new(SessionManager::new(config.session)?);
    run_server_with_manager(config.host, config.port, manager).await
}

pub async fn run_server_with_manager(
    host: String,
    port: u16,
    manager: Arc<SessionManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = build_router(manager.clone());
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "assistant-session listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;
    Ok(())
}

async fn shutdown_signal(manager: Arc<SessionManager>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    manager.stop().await;
}

/// Unix epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
