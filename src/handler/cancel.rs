//! Cancellation bookkeeping for in-flight dispatches.
//!
//! Cancel is advisory. Every running dispatch gets a `CancellationToken`
//! registered under its message id; a Cancel naming that id trips the token.
//! Handlers that want to stop early poll or await it, others ignore it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Registry of cancellation tokens keyed by message id.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<DashMap<String, (u64, CancellationToken)>>,
    next_seq: Arc<AtomicU64>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for `message_id`.
    ///
    /// The entry lives until the returned guard is dropped. A later
    /// registration with the same id replaces it.
    pub fn register(&self, message_id: &str) -> CancellationGuard {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.tokens
            .insert(message_id.to_string(), (seq, token.clone()));

        CancellationGuard {
            registry: self.clone(),
            message_id: message_id.to_string(),
            seq,
            token,
        }
    }

    /// Trip the token for `message_id`. Returns false if nothing is registered.
    pub fn cancel(&self, message_id: &str) -> bool {
        match self.tokens.get(message_id) {
            Some(entry) => {
                entry.value().1.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, message_id: &str) -> bool {
        self.tokens.contains_key(message_id)
    }

    /// Number of registered dispatches.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Keeps a registration alive; removes it on drop.
pub struct CancellationGuard {
    registry: CancellationRegistry,
    message_id: String,
    seq: u64,
    token: CancellationToken,
}

impl CancellationGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        let seq = self.seq;
        self.registry
            .tokens
            .remove_if(&self.message_id, |_, (s, _)| *s == seq);
    }
}
