pub mod app_state;
pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod iam;
pub mod ipam;
pub mod persistence;
pub mod reconciler;
pub mod routes;
pub mod scheduler;
pub mod telemetry;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::api::{EventKind, ResourceKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::events::{EventBus, LoggingHandler};
use crate::persistence::Db;

/// Startup options parsed from argv: `--config-file <path>` or
/// `--config-dir <dir>` (reads `<dir>/config.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    pub config_file: Option<String>,
}

pub fn parse_command_args<I: Iterator<Item = String>>(mut args: I) -> Result<CommandOptions> {
    let mut options = CommandOptions::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-file" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config-file requires a path"))?;
                options.config_file = Some(path);
            }
            "--config-dir" => {
                let dir = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config-dir requires a directory"))?;
                options.config_file = Some(format!("{}/config", dir.trim_end_matches('/')));
            }
            "--help" | "-h" => {
                println!("Usage: genesis-control-plane [--config-file <path> | --config-dir <dir>]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(options)
}

/// Resolve the kinds this deployment's reconciler claims from the
/// capability label list, plus the orchestrator-internal kinds that are
/// always reconciled locally.
pub fn resolve_scheduled_kinds(labels: &[String]) -> Vec<ResourceKind> {
    let agent_kinds = [
        ResourceKind::ComputeNode,
        ResourceKind::ServiceNode,
        ResourceKind::Password,
        ResourceKind::Certificate,
    ];
    let mut kinds: Vec<ResourceKind> = agent_kinds
        .into_iter()
        .filter(|kind| {
            labels
                .iter()
                .any(|label| scheduler::capability_matches(label, kind.as_str()))
        })
        .collect();

    kinds.extend([
        ResourceKind::Service,
        ResourceKind::MachinePool,
        ResourceKind::NodeSet,
        ResourceKind::LoadBalancer,
        ResourceKind::Vhost,
        ResourceKind::Route,
        ResourceKind::BackendPool,
        ResourceKind::Network,
        ResourceKind::Subnet,
        ResourceKind::Interface,
    ]);
    kinds
}

pub fn make_app_state(cfg: &AppConfig, db: Db) -> AppState {
    let authz = iam::AuthzKernel::new(db.clone(), Duration::from_millis(cfg.iam.memo_ttl_ms));
    let scheduler = scheduler::CapabilityScheduler::new(
        db.clone(),
        chrono::Duration::seconds(cfg.universal_agent_scheduler.heartbeat_stale_secs as i64),
    );
    let scheduled_kinds = resolve_scheduled_kinds(&cfg.universal_agent_scheduler.capability_list());
    let metrics_handle = telemetry::init_metrics_recorder();

    AppState {
        db,
        authz,
        scheduler,
        scheduled_kinds,
        agent_token: cfg.orch.agent_token.clone(),
        iam: cfg.iam.clone(),
        reconciler: cfg.reconciler.clone(),
        outbox: cfg.outbox.clone(),
        metrics_handle,
    }
}

/// Replace the seeded bootstrap admin hash with the configured secret so the
/// placeholder from the migration never authenticates.
pub async fn bootstrap_admin(db: &Db, cfg: &AppConfig) -> Result<()> {
    let Some(admin) = persistence::iam::get_user_by_name(db, "admin").await? else {
        anyhow::bail!("bootstrap admin user is missing from the database");
    };
    persistence::iam::set_user_secret(db, admin.uuid, &iam::hash_secret(&cfg.iam.bootstrap_admin_secret))
        .await?;
    Ok(())
}

pub fn default_event_bus() -> EventBus {
    let mut bus = EventBus::new();
    let logger = Arc::new(LoggingHandler);
    bus.subscribe(EventKind::IamUserRegistration, logger.clone());
    bus.subscribe(EventKind::IamUserResetPassword, logger.clone());
    bus.subscribe(EventKind::SecretCertificateIssued, logger);
    bus
}

pub async fn run(options: CommandOptions) -> Result<()> {
    let cfg = config::load(options.config_file.as_deref())?;

    let db = persistence::migrations::init_pool(
        &cfg.db.connection_url,
        cfg.db.connection_pool_size,
    )
    .await?;
    let migration_outcome = persistence::migrations::run_migrations(&db).await?;
    for applied in &migration_outcome.applied {
        info!(
            version = applied.version,
            description = applied.description,
            "applied database migration"
        );
    }
    bootstrap_admin(&db, &cfg).await?;

    let state = make_app_state(&cfg, db.clone());
    let bus = Arc::new(default_event_bus());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    let reconciler_state = state.clone();
    let reconciler_shutdown = shutdown_rx.clone();
    let reconciler_task = tokio::spawn(async move {
        if let Err(err) = reconciler::reconciler_loop(reconciler_state, reconciler_shutdown).await {
            error!(?err, "reconciler loop terminated with error");
        }
    });

    let dispatcher_shutdown = shutdown_rx.clone();
    let dispatcher_cfg = cfg.outbox.clone();
    let dispatcher_db = db.clone();
    let dispatcher_task = tokio::spawn(async move {
        if let Err(err) =
            events::dispatcher_loop(dispatcher_db, bus, dispatcher_cfg, dispatcher_shutdown).await
        {
            error!(?err, "event dispatcher terminated with error");
        }
    });

    let api_addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {err}"))?;
    let metrics_addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.metrics_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {err}"))?;

    let app = routes::build_router(state.clone()).with_state(state.clone());
    let metrics_app = routes::build_metrics_router().with_state(state);

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "control-plane listening");
    info!(%metrics_addr, "control-plane metrics listening");

    let mut api_shutdown = shutdown_rx.clone();
    let mut metrics_shutdown = shutdown_rx.clone();

    let api_task = tokio::spawn(async move {
        axum::serve(api_listener, app)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });
    let metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    api_task
        .await
        .map_err(|err| anyhow::anyhow!("control-plane task failed: {err}"))?
        .map_err(|err| anyhow::anyhow!("control-plane server failed: {err}"))?;
    metrics_task
        .await
        .map_err(|err| anyhow::anyhow!("metrics task failed: {err}"))?
        .map_err(|err| anyhow::anyhow!("metrics server failed: {err}"))?;

    let _ = shutdown_tx.send(true);
    let _ = reconciler_task.await;
    let _ = dispatcher_task.await;

    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_accepts_config_file() {
        let options =
            parse_command_args(["--config-file", "/etc/genesis/core.toml"].map(String::from).into_iter())
                .expect("parses");
        assert_eq!(options.config_file.as_deref(), Some("/etc/genesis/core.toml"));
    }

    #[test]
    fn parse_command_maps_config_dir() {
        let options = parse_command_args(["--config-dir", "/etc/genesis/"].map(String::from).into_iter())
            .expect("parses");
        assert_eq!(options.config_file.as_deref(), Some("/etc/genesis/config"));
    }

    #[test]
    fn parse_command_rejects_unknown_arguments() {
        let err = parse_command_args(["--nope"].map(String::from).into_iter()).expect_err("rejects");
        assert!(err.to_string().contains("unknown argument"));
    }

    #[test]
    fn scheduled_kinds_follow_capability_labels() {
        let kinds = resolve_scheduled_kinds(&["password".to_string()]);
        assert!(kinds.contains(&ResourceKind::Password));
        assert!(!kinds.contains(&ResourceKind::ComputeNode));
        // Orchestrator-internal kinds are always present.
        assert!(kinds.contains(&ResourceKind::Service));
        assert!(kinds.contains(&ResourceKind::LoadBalancer));

        let kinds = resolve_scheduled_kinds(&["em_core_*".to_string()]);
        assert!(kinds.contains(&ResourceKind::ComputeNode));
        assert!(kinds.contains(&ResourceKind::ServiceNode));
        assert!(!kinds.contains(&ResourceKind::Certificate));
    }
}
