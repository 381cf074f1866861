//! The data-access layer behind motordata's vehicle-history reports.
//!
//! Everything user-facing in motordata boils down to a handful of slow
//! upstream lookups (technical specifications, repair times, the MOT defect
//! manual, condition analysis). This crate coordinates those lookups: it
//! caches results across an in-memory and an on-disk tier, deduplicates
//! concurrent requests for the same vehicle, and retries transient upstream
//! failures. See the [`caching`] module docs for the full picture.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod fetch;
pub mod logging;
pub mod lookup;
pub mod utils;

#[cfg(test)]
mod test;
