use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{ApiResult, AppError};
use crate::persistence::{self, Db};
use crate::telemetry;

/// The reserved wildcard permission held by the bootstrap admin.
pub const WILDCARD_PERMISSION: &str = "*.*.*";

const MEMO_CAPACITY: usize = 512;

/// SHA-256 hex digest used for user secrets and bearer tokens at rest.
pub fn hash_secret(value: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validates the `service.resource.action` grammar: three dot-separated
/// segments, the first `[a-z_]+`, the rest `[a-z_*]+`.
pub fn validate_permission_name(name: &str) -> bool {
    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() != 3 {
        return false;
    }
    let head_ok = !segments[0].is_empty()
        && segments[0]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_');
    let tail_ok = segments[1..].iter().all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_' || c == '*')
    });
    head_ok && tail_ok
}

/// A stored permission matches a required one when each of its three segments
/// is either equal or the literal wildcard `*`.
pub fn permission_matches(stored: &str, required: &str) -> bool {
    let stored: Vec<&str> = stored.split('.').collect();
    let required: Vec<&str> = required.split('.').collect();
    if stored.len() != 3 || required.len() != 3 {
        return false;
    }
    stored
        .iter()
        .zip(required.iter())
        .all(|(s, r)| *s == "*" || s == r)
}

#[derive(Debug, Clone, Copy)]
struct MemoEntry {
    allowed: bool,
    at: Instant,
    epoch: u64,
}

/// The authorization kernel: answers "may subject S perform action A inside
/// project P", deny by default.
///
/// Decisions are memoized per (subject, project, permission) for a bounded
/// TTL; any role or permission write bumps the epoch and drops every cached
/// decision, so a concurrent revocation becomes visible within the bound.
#[derive(Clone)]
pub struct AuthzKernel {
    db: Db,
    memo: Arc<Mutex<HashMap<(Uuid, Uuid, String), MemoEntry>>>,
    epoch: Arc<AtomicU64>,
    memo_ttl: Duration,
}

impl AuthzKernel {
    pub fn new(db: Db, memo_ttl: Duration) -> Self {
        Self {
            db,
            memo: Arc::new(Mutex::new(HashMap::new())),
            epoch: Arc::new(AtomicU64::new(0)),
            memo_ttl,
        }
    }

    /// Drop every memoized decision. Must be called by any code path that
    /// writes roles, permissions, or their bindings.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.memo.lock().expect("memo lock poisoned").clear();
    }

    /// Returns whether the subject holds a matching permission in the project.
    pub async fn authorize(
        &self,
        subject: Uuid,
        project: Uuid,
        required: &str,
    ) -> crate::Result<bool> {
        let key = (subject, project, required.to_string());
        let epoch = self.epoch.load(Ordering::SeqCst);

        if let Some(entry) = self.memo.lock().expect("memo lock poisoned").get(&key) {
            if entry.epoch == epoch && entry.at.elapsed() < self.memo_ttl {
                return Ok(entry.allowed);
            }
        }

        let names = persistence::iam::resolve_permission_names(&self.db, subject, project).await?;
        let allowed = names.iter().any(|stored| permission_matches(stored, required));

        let mut memo = self.memo.lock().expect("memo lock poisoned");
        if memo.len() >= MEMO_CAPACITY {
            memo.clear();
        }
        memo.insert(
            key,
            MemoEntry {
                allowed,
                at: Instant::now(),
                epoch,
            },
        );

        Ok(allowed)
    }

    /// Deny-by-default check; the error maps to 403 at the edge.
    pub async fn check(&self, subject: Uuid, project: Uuid, required: &str) -> ApiResult<()> {
        let allowed = self.authorize(subject, project, required).await?;
        telemetry::record_authz_decision(allowed);
        if allowed {
            Ok(())
        } else {
            Err(AppError::permission_denied(format!(
                "subject lacks permission {required}"
            )))
        }
    }
}
