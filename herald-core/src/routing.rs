//! Content routing contract
//!
//! The network service that accepts announcements. The engine only ever
//! calls `provide`; resolution of CIDs to peers happens elsewhere.

use async_trait::async_trait;
use cid::Cid;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Announce failed: {0}")]
    Announce(String),

    #[error("Announce timed out")]
    Timeout,

    #[error("Routing backend unavailable")]
    Unavailable,
}

/// External routing layer that records which peers serve which CIDs.
///
/// `provide` must honour cancellation: callers bound every announce with
/// a deadline and drop the future when it elapses. When `broadcast` is
/// set the routing layer propagates the announcement to its peers rather
/// than recording it locally only.
#[async_trait]
pub trait ContentRouting: Send + Sync {
    async fn provide(&self, cid: Cid, broadcast: bool) -> Result<(), RoutingError>;
}

/// Routing backend that records announcements in the log.
///
/// The daemon default until a DHT client is wired in; announcements are
/// visible but go nowhere.
pub struct LogRouter;

#[async_trait]
impl ContentRouting for LogRouter {
    async fn provide(&self, cid: Cid, broadcast: bool) -> Result<(), RoutingError> {
        info!(%cid, broadcast, "announce (log-only routing backend)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::block_cid;

    #[tokio::test]
    async fn test_log_router_accepts_announcements() {
        let router = LogRouter;
        let cid = block_cid(b"some block").unwrap();

        router.provide(cid, true).await.unwrap();
        router.provide(cid, false).await.unwrap();
    }
}
