//! Cooperative cancellation primitives.
//!
//! Every fetch or mutation attempt owns exactly one [`AbortController`]. The function doing the
//! work receives the matching [`AbortSignal`] and may watch it; the runtime also races the
//! function against the signal so an attempt stops even when the function ignores it.
//!
//! The [`AbortRegistry`] keeps one controller per in-flight operation key so callers outside the
//! operation (shutdown paths, "cancel everything under this prefix") can reach it.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

static NEXT_CONTROLLER_ID: AtomicU64 = AtomicU64::new(1);

/// Owner side of a cancellation handle.
///
/// Clones share the same underlying token and identity.
#[derive(Clone, Debug)]
pub struct AbortController {
    id: u64,
    token: CancellationToken,
}

impl AbortController {
    pub fn new() -> Self {
        AbortController {
            id: NEXT_CONTROLLER_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        }
    }

    /// Process-unique identity of this controller.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Signal handed to the operation.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            token: self.token.clone(),
        }
    }

    /// Cancel the operation. Idempotent.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation handle, passed to fetch and mutation functions.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the owning controller aborts.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }
}

/// Bookkeeping of active controllers by operation key.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct AbortRegistry {
    controllers: Arc<DashMap<String, AbortController>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `controller` under `key`, returning the controller it replaced.
    ///
    /// The replaced controller is not aborted; its owner still releases it normally and that
    /// release is ignored because the identities no longer match.
    pub fn register(&self, key: &str, controller: AbortController) -> Option<AbortController> {
        self.controllers.insert(key.to_string(), controller)
    }

    /// Stop tracking the controller with `id` under `key`.
    ///
    /// Returns `false` when `key` is absent or now holds a different controller.
    pub fn release(&self, key: &str, id: u64) -> bool {
        self.controllers
            .remove_if(key, |_, controller| controller.id() == id)
            .is_some()
    }

    /// Abort and forget the controller under `key`.
    pub fn abort(&self, key: &str) -> bool {
        match self.controllers.remove(key) {
            Some((_, controller)) => {
                controller.abort();
                debug!("Aborted in-flight operation {}", key);
                true
            }
            None => false,
        }
    }

    /// Abort every controller whose key satisfies `predicate`.
    pub fn abort_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let keys: Vec<String> = self
            .controllers
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        keys.iter().filter(|key| self.abort(key)).count()
    }

    /// Abort every controller whose key equals or starts with `prefix`.
    pub fn abort_prefix(&self, prefix: &str) -> usize {
        self.abort_where(|key| key.starts_with(prefix))
    }

    /// Abort everything.
    pub fn abort_all(&self) -> usize {
        let count = self.abort_where(|_| true);
        if count > 0 {
            warn!("AbortRegistry: aborted {} in-flight operations", count);
        }
        count
    }

    pub fn contains(&self, key: &str) -> bool {
        self.controllers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}
