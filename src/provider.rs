//! Trader-data provider seam.
//!
//! The engine never talks to an exchange API directly; it consumes this
//! trait. Implementations fetch and map, nothing more. Retry policy lives
//! with the caller via [`with_retry`], so each cadence decides how long a
//! transient failure is worth waiting out.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::EngineError;
use crate::models::{TradeEvent, TrackedTrader, TraderPosition, Timeframe};

#[async_trait]
pub trait TraderDataProvider: Send + Sync {
    /// Candidate trader addresses for the given lookback window, best
    /// first as ranked by the provider.
    async fn fetch_leaderboard(&self, timeframe: Timeframe)
        -> Result<Vec<String>, EngineError>;

    /// Full profile for one trader: account value, per-window metrics,
    /// style inputs. `score` is left unset; scoring happens downstream.
    async fn fetch_trader(&self, address: &str) -> Result<TrackedTrader, EngineError>;

    /// Current open positions for one trader.
    async fn fetch_positions(&self, address: &str)
        -> Result<Vec<TraderPosition>, EngineError>;

    /// Trade events for one trader since the cursor, oldest first.
    async fn fetch_trades(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TradeEvent>, EngineError>;
}

/// Retry a provider call with exponential backoff until it succeeds or
/// the elapsed budget runs out. Only transient errors are retried;
/// anything else fails immediately.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    max_elapsed: StdDuration,
    mut call: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EngineError>>,
{
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(max_elapsed),
        ..ExponentialBackoff::default()
    };

    backoff::future::retry(policy, || {
        let attempt = call();
        async move {
            attempt.await.map_err(|e| {
                if e.is_transient() {
                    warn!(operation, error = %e, "Transient provider failure, will retry");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

pub mod fixture {
    //! File-backed provider for dry runs and tests: a JSON snapshot of
    //! traders, their positions and trade history stands in for the
    //! exchange API.

    use std::collections::HashMap;
    use std::path::Path;

    use serde::Deserialize;

    use super::*;

    #[derive(Deserialize)]
    struct FixtureTrader {
        #[serde(flatten)]
        profile: TrackedTrader,
        #[serde(default)]
        trades: Vec<TradeEvent>,
    }

    #[derive(Deserialize)]
    struct FixtureFile {
        traders: Vec<FixtureTrader>,
    }

    pub struct FixtureProvider {
        traders: HashMap<String, TrackedTrader>,
        trades: HashMap<String, Vec<TradeEvent>>,
        /// Leaderboard order as listed in the file.
        order: Vec<String>,
    }

    impl FixtureProvider {
        pub fn load(path: &Path) -> Result<Self, EngineError> {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                EngineError::transient("fixture_load", &format!("{}: {}", path.display(), e))
            })?;
            let file: FixtureFile = serde_json::from_str(&raw).map_err(|e| {
                EngineError::data_invalid(&path.display().to_string(), &e.to_string())
            })?;

            let mut traders = HashMap::new();
            let mut trades = HashMap::new();
            let mut order = Vec::new();
            for entry in file.traders {
                order.push(entry.profile.address.clone());
                trades.insert(entry.profile.address.clone(), entry.trades);
                traders.insert(entry.profile.address.clone(), entry.profile);
            }

            Ok(Self { traders, trades, order })
        }

        fn lookup(&self, address: &str) -> Result<&TrackedTrader, EngineError> {
            self.traders
                .get(address)
                .ok_or_else(|| EngineError::data_invalid(address, "unknown trader in fixture"))
        }
    }

    #[async_trait]
    impl TraderDataProvider for FixtureProvider {
        async fn fetch_leaderboard(
            &self,
            _timeframe: Timeframe,
        ) -> Result<Vec<String>, EngineError> {
            Ok(self.order.clone())
        }

        async fn fetch_trader(&self, address: &str) -> Result<TrackedTrader, EngineError> {
            self.lookup(address).cloned()
        }

        async fn fetch_positions(
            &self,
            address: &str,
        ) -> Result<Vec<TraderPosition>, EngineError> {
            Ok(self.lookup(address)?.positions.clone())
        }

        async fn fetch_trades(
            &self,
            address: &str,
            since: DateTime<Utc>,
        ) -> Result<Vec<TradeEvent>, EngineError> {
            Ok(self
                .trades
                .get(address)
                .map(|events| {
                    events
                        .iter()
                        .filter(|e| e.timestamp > since)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient() {
        let attempts = AtomicU32::new(0);

        let result = with_retry("test_op", StdDuration::from_secs(5), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EngineError::transient("test_op", "flaky"))
            } else {
                Ok(42u32)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_fails_fast_on_permanent() {
        let attempts = AtomicU32::new(0);

        let result: Result<u32, _> =
            with_retry("test_op", StdDuration::from_secs(5), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::data_invalid("0xabc", "malformed"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
