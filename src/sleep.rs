use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Delay used between download attempts.
///
/// Injected so backoff can be observed without wall-clock waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// A shared reference to a sleeper
pub type SharedSleeper = Arc<dyn Sleeper>;

/// Sleeps on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

impl TokioSleeper {
    pub fn shared() -> SharedSleeper {
        Arc::new(Self)
    }
}
