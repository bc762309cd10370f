//! # Admission Facade
//!
//! This module contains the [`Limiter`] facade that gives the middleware one
//! uniform admission operation over the two engines.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Limiter                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │   allow(id, cost, capacity, refill_rate) ──► bool            │
//! │                                                              │
//! │  ┌──────────────────────────┐  ┌──────────────────────────┐  │
//! │  │    LocalRateLimiter      │  │  DistributedRateLimiter  │  │
//! │  │                          │  │                          │  │
//! │  │ • LRU bucket registry    │  │ • Redis-resident buckets │  │
//! │  │ • TTL sweeper task       │  │ • Atomic Lua admission   │  │
//! │  │ • Integer refill         │  │ • Fractional refill      │  │
//! │  └──────────────────────────┘  └──────────────────────────┘  │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is chosen at construction and never changes. Both engines
//! present the same boundary: `true` admits, `false` denies, and any
//! infrastructure failure inside the distributed engine surfaces as a deny.
//!
//! ## Refill divergence
//!
//! The two engines intentionally differ in how they accrue tokens. The local
//! engine adds whole tokens only (`⌊elapsed seconds × rate⌋`) and keeps
//! sub-token remainders by not advancing its refill clock; the shared-store
//! script accrues fractional tokens continuously. Identities may therefore
//! see slightly earlier refills on the distributed engine.

use crate::config::{DistributedConfig, LocalConfig};
use crate::error::GatekeeperError;
use crate::rate_limiter::{DistributedRateLimiter, LocalRateLimiter};

/// Uniform admission handle shared by all request-handling tasks.
///
/// # Example
///
/// ```rust,no_run
/// use gatekeeper::config::LocalConfig;
/// use gatekeeper::limiter::Limiter;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = LocalConfig::default();
/// let limiter = Limiter::local(&config)?;
///
/// if limiter.allow("client-123", 1, config.capacity, config.refill_rate).await {
///     // forward the request
/// } else {
///     // respond 429 Too Many Requests
/// }
/// # limiter.stop().await;
/// # Ok(())
/// # }
/// ```
pub enum Limiter {
    Local(LocalRateLimiter),
    Distributed(DistributedRateLimiter),
}

impl Limiter {
    /// Constructs the in-process engine and starts its sweeper.
    pub fn local(config: &LocalConfig) -> Result<Self, GatekeeperError> {
        Ok(Limiter::Local(LocalRateLimiter::new(config)?))
    }

    /// Constructs the shared-store engine. Connection problems found by the
    /// readiness probe are logged, not fatal; decisions fail closed until
    /// the store answers.
    pub async fn distributed(config: &DistributedConfig) -> Result<Self, GatekeeperError> {
        Ok(Limiter::Distributed(
            DistributedRateLimiter::connect(config).await?,
        ))
    }

    /// Decides whether `id` may spend `cost` tokens right now.
    pub async fn allow(&self, id: &str, cost: u64, capacity: u64, refill_rate: u64) -> bool {
        match self {
            Limiter::Local(limiter) => limiter.allow(id, cost, capacity, refill_rate),
            Limiter::Distributed(limiter) => limiter.allow(id, cost, capacity, refill_rate).await,
        }
    }

    /// Verifies the engine's backing store is reachable. The local engine
    /// has none and is always ready.
    pub async fn check_ready(&self) -> Result<(), GatekeeperError> {
        match self {
            Limiter::Local(_) => Ok(()),
            Limiter::Distributed(limiter) => limiter.check_ready().await,
        }
    }

    /// Stops background work: the local sweeper is joined, the store client
    /// closed. Calling this twice is a no-op.
    pub async fn stop(&self) {
        match self {
            Limiter::Local(limiter) => limiter.stop().await,
            Limiter::Distributed(limiter) => limiter.stop(),
        }
    }
}
