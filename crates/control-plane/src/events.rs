use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::api::EventKind;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backoff;
use crate::config::OutboxConfig;
use crate::persistence::{self, Db, OutboxRecord};
use crate::telemetry;
use crate::Result;

/// A subscriber for one or more event kinds. Delivery is at-least-once;
/// handlers must tolerate replays.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, event: &OutboxRecord) -> anyhow::Result<()>;
}

/// Process-internal registry mapping event kinds to their subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn handlers_for(&self, kind: EventKind) -> &[Arc<dyn EventHandler>] {
        self.handlers
            .get(&kind)
            .map(|handlers| handlers.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Drains the outbox: hands each due event to every subscriber, retries
/// transient handler failures with exponential backoff, and dead-letters
/// after the bounded attempt count.
pub async fn run_dispatch_pass(
    db: &Db,
    bus: &EventBus,
    cfg: &OutboxConfig,
) -> Result<DispatchReport> {
    let mut report = DispatchReport::default();
    let due = persistence::outbox::due_events(db, Utc::now(), 50).await?;

    for event in due {
        let Some(kind) = event.kind() else {
            warn!(event = %event.uuid, kind = %event.kind, "dropping event of unknown kind");
            persistence::outbox::mark_delivered(db, event.uuid).await?;
            continue;
        };

        let mut failure: Option<String> = None;
        for handler in bus.handlers_for(kind) {
            // Handlers run in their own task so a panic is contained at the
            // dispatcher boundary and counts as a failed attempt.
            let task_handler = Arc::clone(handler);
            let task_event = event.clone();
            let outcome =
                tokio::spawn(async move { task_handler.handle(&task_event).await }).await;
            let result = match outcome {
                Ok(result) => result,
                Err(join_err) => Err(anyhow::anyhow!("handler panicked: {join_err}")),
            };
            if let Err(err) = result {
                warn!(
                    event = %event.uuid,
                    kind = kind.as_str(),
                    handler = handler.name(),
                    ?err,
                    "event handler failed"
                );
                failure = Some(format!("{}: {err:#}", handler.name()));
                break;
            }
        }

        match failure {
            None => {
                persistence::outbox::mark_delivered(db, event.uuid).await?;
                telemetry::record_event_delivery("delivered");
                report.delivered += 1;
            }
            Some(reason) => {
                let attempts = event.attempts + 1;
                let dead = attempts >= cfg.max_attempts;
                let delay = backoff::exponential(
                    Duration::from_secs(cfg.backoff_base_secs),
                    Duration::from_secs(cfg.backoff_cap_secs),
                    attempts as u32,
                );
                let next_attempt_at =
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(1));
                persistence::outbox::record_failure(db, event.uuid, &reason, next_attempt_at, dead)
                    .await?;
                if dead {
                    error!(event = %event.uuid, kind = kind.as_str(), reason, "event dead-lettered");
                    telemetry::record_event_delivery("dead_lettered");
                    report.dead_lettered += 1;
                } else {
                    telemetry::record_event_delivery("retried");
                    report.retried += 1;
                }
            }
        }
    }

    Ok(report)
}

pub async fn dispatcher_loop(
    db: Db,
    bus: Arc<EventBus>,
    cfg: OutboxConfig,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.interval_secs.max(1)));
    info!("event dispatcher starting");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if let Err(err) = run_dispatch_pass(&db, &bus, &cfg).await {
                    error!(?err, "event dispatch pass failed");
                }
            }
        }
    }

    Ok(())
}

/// Logs deliveries; stands in for outbound side effects (mail, webhooks)
/// wired up by deployments.
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(&self, event: &OutboxRecord) -> anyhow::Result<()> {
        info!(
            event = %event.uuid,
            kind = %event.kind,
            payload_version = event.payload_version,
            "event delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(&self, _event: &OutboxRecord) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                anyhow::bail!("transient handler failure");
            }
            Ok(())
        }
    }

    fn test_cfg() -> OutboxConfig {
        OutboxConfig {
            interval_secs: 1,
            max_attempts: 3,
            backoff_base_secs: 1,
            backoff_cap_secs: 60,
        }
    }

    async fn test_db() -> Db {
        let pool = migrations::init_pool("sqlite::memory:", 1).await.expect("pool");
        migrations::run_migrations(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn events_deliver_to_every_subscriber_once_queued() {
        let db = test_db().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new();
        bus.subscribe(
            EventKind::IamUserRegistration,
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_first: 0,
            }),
        );

        let uuid = persistence::outbox::enqueue(
            &db,
            EventKind::IamUserRegistration,
            1,
            &json!({"site_endpoint": "http://x", "confirmation_code": uuid::Uuid::new_v4()}),
        )
        .await
        .expect("enqueue");

        let report = run_dispatch_pass(&db, &bus, &test_cfg()).await.expect("pass");
        assert_eq!(report.delivered, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let record = persistence::outbox::get_event(&db, uuid)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(record.status, "DELIVERED");
    }

    #[tokio::test]
    async fn failed_delivery_retries_then_succeeds() {
        let db = test_db().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new();
        bus.subscribe(
            EventKind::IamUserResetPassword,
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_first: 1,
            }),
        );

        let uuid = persistence::outbox::enqueue(
            &db,
            EventKind::IamUserResetPassword,
            1,
            &json!({"site_endpoint": "http://x", "reset_code": uuid::Uuid::new_v4()}),
        )
        .await
        .expect("enqueue");

        let first = run_dispatch_pass(&db, &bus, &test_cfg()).await.expect("pass");
        assert_eq!(first.retried, 1);

        // Force the retry window open instead of sleeping through backoff.
        persistence::outbox::record_failure(&db, uuid, "test", Utc::now(), false)
            .await
            .expect("rewind");
        let second = run_dispatch_pass(&db, &bus, &test_cfg()).await.expect("pass");
        assert_eq!(second.delivered, 1);
        assert!(calls.load(Ordering::SeqCst) >= 2, "at-least-once delivery");
    }

    #[tokio::test]
    async fn exhausted_events_are_dead_lettered() {
        let db = test_db().await;
        let mut bus = EventBus::new();
        bus.subscribe(
            EventKind::IamUserRegistration,
            Arc::new(CountingHandler {
                calls: Arc::new(AtomicUsize::new(0)),
                fail_first: usize::MAX,
            }),
        );

        let uuid = persistence::outbox::enqueue(
            &db,
            EventKind::IamUserRegistration,
            1,
            &json!({}),
        )
        .await
        .expect("enqueue");

        let cfg = test_cfg();
        for _ in 0..cfg.max_attempts {
            persistence::outbox::record_failure(&db, uuid, "rewind", Utc::now(), false)
                .await
                .expect("rewind");
            run_dispatch_pass(&db, &bus, &cfg).await.expect("pass");
        }

        let record = persistence::outbox::get_event(&db, uuid)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(record.status, "DEAD");
    }
}
