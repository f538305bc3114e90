//! Runtime context shared by the read and write engines
//!
//! Holds the clock, feature flags, cache boundary and shutdown flag that
//! both engines consult. Constructed once from [`Config`] and passed in
//! explicitly, so an engine under test never sees process-wide state.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::entities::Timestamp;

/// Source of "now" in unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp()
    }
}

/// Settable clock for tests and replays
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(now: Timestamp) -> Self {
        Self { now: AtomicI64::new(now) }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// Engine context
pub struct EngineContext {
    clock: Box<dyn Clock>,
    pub node_id: String,
    pub pow_check_enabled: bool,
    pub allow_localhost_remotes: bool,
    pub network_head_days: u32,
    pub max_address_table_size: u32,
    pub lock_retry_backoff: Duration,
    last_cache_generation: AtomicI64,
    shutdown: AtomicBool,
}

impl EngineContext {
    /// Build a context on the wall clock
    pub fn from_config(config: &Config) -> Self {
        Self::with_clock(config, SystemClock)
    }

    /// Build a context on a caller-supplied clock
    pub fn with_clock(config: &Config, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            node_id: config.node_id.clone(),
            pow_check_enabled: config.pow_check_enabled,
            allow_localhost_remotes: config.allow_localhost_remotes,
            network_head_days: config.network_head_days,
            max_address_table_size: config.max_address_table_size,
            lock_retry_backoff: Duration::from_millis(config.lock_retry_backoff_ms),
            last_cache_generation: AtomicI64::new(config.last_cache_generation),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Oldest timestamp an unprivileged reader may ask for when no cache exists
    pub fn network_head_start(&self) -> Timestamp {
        self.now() - i64::from(self.network_head_days) * 86_400
    }

    pub fn last_cache_generation(&self) -> Timestamp {
        self.last_cache_generation.load(Ordering::SeqCst)
    }

    /// Called by the cache generator after it publishes a new cache
    pub fn set_last_cache_generation(&self, ts: Timestamp) {
        self.last_cache_generation.store(ts, Ordering::SeqCst);
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_initiated(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("node_id", &self.node_id)
            .field("now", &self.now())
            .field("pow_check_enabled", &self.pow_check_enabled)
            .field("allow_localhost_remotes", &self.allow_localhost_remotes)
            .field("network_head_days", &self.network_head_days)
            .field("max_address_table_size", &self.max_address_table_size)
            .field("last_cache_generation", &self.last_cache_generation())
            .field("shutdown", &self.shutdown_initiated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_drives_context() {
        let clock = Arc::new(FixedClock::new(1_000_000));
        let ctx = EngineContext::with_clock(&Config::default(), clock.clone());
        assert_eq!(ctx.now(), 1_000_000);

        clock.advance(5);
        assert_eq!(ctx.now(), 1_000_005);
        assert_eq!(ctx.network_head_start(), 1_000_005 - 14 * 86_400);
    }

    #[test]
    fn test_shutdown_and_cache_boundary() {
        let ctx = EngineContext::with_clock(&Config::default(), FixedClock::new(10));
        assert!(!ctx.shutdown_initiated());
        ctx.begin_shutdown();
        assert!(ctx.shutdown_initiated());

        assert_eq!(ctx.last_cache_generation(), 0);
        ctx.set_last_cache_generation(7);
        assert_eq!(ctx.last_cache_generation(), 7);
    }
}
