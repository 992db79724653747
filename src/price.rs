//! Dynamic-price gating
//!
//! The policy engine needs one synchronous question answered on every
//! tick: "is now a good time to charge on price?" Getting that answer
//! can involve network I/O (a day-ahead price API, a home-energy
//! broker), which must never block a poll. [`PriceProvider`] is the
//! trait a concrete backend implements; [`CachedPriceProvider`] wraps
//! one behind a TTL cache refreshed by a background task, so the
//! policy engine only ever reads a `watch` channel. [`StaticPriceProvider`]
//! is the default used when `price.enabled` is false: it always says
//! yes, so price never gates charging unless a provider is configured.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One price decision: whether charging should proceed right now, and
/// an informational level label (e.g. "low", "high") for observability.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceDecision {
    pub should_charge_now: bool,
    pub price_level: String,
}

impl Default for PriceDecision {
    fn default() -> Self {
        Self {
            should_charge_now: true,
            price_level: "unknown".to_string(),
        }
    }
}

/// A source of price decisions. Implementations may hit the network;
/// callers on the hot control-loop path should go through
/// [`CachedPriceProvider`] rather than calling this directly.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn fetch(&self) -> crate::error::Result<PriceDecision>;
}

/// Default provider used when no dynamic-price backend is configured.
/// Always permits charging.
pub struct StaticPriceProvider;

#[async_trait]
impl PriceProvider for StaticPriceProvider {
    async fn fetch(&self) -> crate::error::Result<PriceDecision> {
        Ok(PriceDecision::default())
    }
}

/// TTL-caches a [`PriceProvider`] behind a background refresh task so
/// the policy engine's synchronous read never blocks on I/O.
pub struct CachedPriceProvider {
    rx: watch::Receiver<PriceDecision>,
    _task: tokio::task::JoinHandle<()>,
}

impl CachedPriceProvider {
    /// Spawn a background task that refreshes `provider` every `ttl`
    /// and publishes the result to a `watch` channel. The initial value
    /// is [`PriceDecision::default`] until the first refresh completes.
    pub fn spawn(provider: Arc<dyn PriceProvider>, ttl: Duration) -> Self {
        let (tx, rx) = watch::channel(PriceDecision::default());
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl);
            loop {
                interval.tick().await;
                match provider.fetch().await {
                    Ok(decision) => {
                        let _ = tx.send(decision);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "price provider refresh failed, keeping last value");
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
        });
        Self { rx, _task: task }
    }

    /// Read the most recently cached decision without blocking.
    pub fn current(&self) -> PriceDecision {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_always_permits_charging() {
        let provider = StaticPriceProvider;
        let decision = provider.fetch().await.unwrap();
        assert!(decision.should_charge_now);
    }

    #[tokio::test]
    async fn cached_provider_starts_with_default_before_first_refresh() {
        struct NeverCalled;
        #[async_trait]
        impl PriceProvider for NeverCalled {
            async fn fetch(&self) -> crate::error::Result<PriceDecision> {
                unreachable!("refresh interval longer than the test")
            }
        }
        let cache = CachedPriceProvider::spawn(Arc::new(NeverCalled), Duration::from_secs(3600));
        assert!(cache.current().should_charge_now);
    }

    #[tokio::test]
    async fn cached_provider_picks_up_refreshed_value() {
        struct LowPrice;
        #[async_trait]
        impl PriceProvider for LowPrice {
            async fn fetch(&self) -> crate::error::Result<PriceDecision> {
                Ok(PriceDecision {
                    should_charge_now: false,
                    price_level: "high".to_string(),
                })
            }
        }
        let cache = CachedPriceProvider::spawn(Arc::new(LowPrice), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let decision = cache.current();
        assert!(!decision.should_charge_now);
        assert_eq!(decision.price_level, "high");
    }
}
