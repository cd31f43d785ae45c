//! Transport module
//!
//! This module defines the broadcast transport the reconciliation core sends
//! through and catches up from:
//! - `Transport` trait: topic broadcast and store-and-forward history
//! - `MemoryTransport`: shared in-process log with failure injection, used to
//!   connect several messengers (peers or paired devices) in one process
//!
//! The transport gives no ordering or exactly-once guarantee; the core is
//! correct under re-delivery and reordering.

use crate::{crypto, Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One page of store-and-forward history
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryPage {
    /// Raw envelopes, oldest first
    pub envelopes: Vec<Vec<u8>>,
    /// Cursor to resume from, `None` when there was nothing after the
    /// requested cursor
    pub next_cursor: Option<String>,
}

/// Broadcast transport
pub trait Transport: Send + Sync {
    /// Publish a payload on a topic
    ///
    /// # Returns
    /// The transport-level message hash
    fn broadcast(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Fetch up to `limit` stored envelopes after `cursor` (from the beginning
    /// if `None`)
    ///
    /// A transport may return fewer than `limit` envelopes per page.
    fn fetch_history(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> impl Future<Output = Result<HistoryPage>> + Send;
}

/// Envelope published on a [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Topic it was published on
    pub topic: String,
    /// Raw envelope bytes
    pub payload: Vec<u8>,
    /// Hex SHA-256 of the payload
    pub hash: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    log: Vec<Published>,
    /// Successful broadcasts left before failures start
    fail_after: Option<usize>,
    history_fetches: usize,
}

/// In-process transport
///
/// Clones share the same log, so every messenger built on a clone sees what
/// the others published.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    page_size: usize,
}

impl MemoryTransport {
    /// Create an empty transport returning history pages of at most
    /// `page_size`
    pub fn new(page_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            page_size: page_size.max(1),
        }
    }

    /// Let the next `n` broadcasts succeed, then fail every later one
    pub async fn fail_after(&self, n: usize) {
        self.state.lock().await.fail_after = Some(n);
    }

    /// Stop injecting failures
    pub async fn heal(&self) {
        self.state.lock().await.fail_after = None;
    }

    /// Everything published so far
    pub async fn published(&self) -> Vec<Published> {
        self.state.lock().await.log.clone()
    }

    /// Number of envelopes published so far
    pub async fn len(&self) -> usize {
        self.state.lock().await.log.len()
    }

    /// Number of history pages served so far
    pub async fn history_fetches(&self) -> usize {
        self.state.lock().await.history_fetches
    }

    /// Whether nothing was published yet
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.log.is_empty()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Transport for MemoryTransport {
    async fn broadcast(&self, topic: &str, payload: Vec<u8>) -> Result<String> {
        let mut state = self.state.lock().await;

        if let Some(remaining) = state.fail_after.as_mut() {
            if *remaining == 0 {
                warn!("Broadcast on {} failed (injected)", topic);
                return Err(Error::Transport(format!("broadcast on {} failed", topic)));
            }
            *remaining -= 1;
        }

        let hash = hex::encode(crypto::sha256(&[&payload]));
        debug!("Broadcast {} bytes on {} ({})", payload.len(), topic, hash);
        state.log.push(Published {
            topic: topic.to_string(),
            payload,
            hash: hash.clone(),
        });
        Ok(hash)
    }

    async fn fetch_history(&self, cursor: Option<String>, limit: usize) -> Result<HistoryPage> {
        let start = match cursor {
            None => 0,
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| Error::Transport(format!("invalid history cursor {:?}", cursor)))?,
        };

        let mut state = self.state.lock().await;
        state.history_fetches += 1;
        let page_size = limit.clamp(1, self.page_size);
        let end = start.saturating_add(page_size).min(state.log.len());
        let envelopes = state
            .log
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|published| published.payload.clone())
            .collect();

        Ok(HistoryPage {
            envelopes,
            next_cursor: (end > start).then(|| end.to_string()),
        })
    }
}
