use std::sync::Arc;
use std::time::Duration;

use beach_pier_core::AuthToken;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// In-memory set of issued pairing tokens. Nothing is persisted, so a
/// restarted host rejects every token issued before it.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<TokenStoreInner>,
}

struct TokenStoreInner {
    tokens: DashMap<AuthToken, Instant>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(TokenStoreInner {
                tokens: DashMap::new(),
                ttl,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn generate(&self) -> AuthToken {
        let token = AuthToken::generate();
        self.inner.tokens.insert(token, Instant::now());
        token
    }

    /// True only for a token this store issued less than one TTL ago. Expired
    /// entries are rejected even before the sweeper has removed them.
    pub fn validate(&self, token: &AuthToken) -> bool {
        match self.inner.tokens.get(token) {
            Some(created) => !self.expired(*created, Instant::now()),
            None => false,
        }
    }

    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.tokens.len();
        self.inner
            .tokens
            .retain(|_, created| !self.expired(*created, now));
        before.saturating_sub(self.inner.tokens.len())
    }

    pub fn len(&self) -> usize {
        self.inner.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tokens.is_empty()
    }

    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let removed = store.cleanup_expired();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "expired tokens swept");
                }
            }
        })
    }

    fn expired(&self, created: Instant, now: Instant) -> bool {
        now.saturating_duration_since(created) >= self.inner.ttl
    }
}
