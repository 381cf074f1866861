//! # Lookup caching infrastructure
//!
//! Upstream vehicle-data lookups are slow and metered, so caching is front
//! and center in this crate. This module contains the two cache tiers, the
//! central [`CacheError`] type, and the in-flight deduplication that sits
//! between them and the network.
//!
//! ## Cache tiers
//!
//! A lookup goes through the following layers:
//!
//! - An in-memory tier holding deserialized payloads for the domain's
//!   memory TTL. It disappears on process exit.
//! - An on-disk tier holding one JSON envelope file per key, with its own
//!   (longer) TTL. A hit here also warms the in-memory tier.
//! - On miss in both, the in-flight map ([`InFlightRequests`]) either joins
//!   an already running upstream request for the same key or starts a new
//!   one.
//!
//! Both tiers validate the envelope's timestamp and schema version on every
//! read and delete entries that fail either check (lazy GC). Bumping a
//! domain's configured version therefore invalidates everything it
//! previously persisted, one read at a time.
//!
//! ## Quota and eviction
//!
//! The on-disk tier has a byte budget per domain. A write that would exceed
//! it triggers eviction: the oldest ⌈20%⌉ of the domain's entries are
//! removed and the write is retried exactly once. A write that still does
//! not fit is abandoned and the entry stays memory-only. Oversized single
//! entries (above `max_entry_size`) are never persisted at all.
//!
//! ## Failure semantics
//!
//! Nothing in here is allowed to fail a lookup that would have succeeded
//! over the network: the read path treats every storage error as a miss,
//! the write path reports outcomes instead of raising. Only upstream
//! errors, classified as [`CacheError`], ever reach callers.
//!
//! ## Metrics
//!
//! Each metric is tagged with a `cache` field naming the lookup domain:
//!
//! - `caches.access`: all reads.
//! - `caches.memory.hit` / `caches.file.hit`: reads served per tier.
//! - `caches.file.size`: histogram of envelope sizes, read and written.
//! - `caches.channel.hit` / `caches.channel.miss`: in-flight deduplication.
//! - `caches.computation`: upstream requests actually started.
//! - `caches.eviction.runs` / `caches.eviction.removed`: quota recoveries.

mod cache_error;
mod cache_key;
mod config;
mod entry;
mod eviction;
mod fs;
mod inflight;
mod memory;
mod store;

#[cfg(test)]
mod tests;

pub use cache_error::{CacheContents, CacheError};
pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use config::CacheName;
pub use entry::CacheEntry;
pub use inflight::InFlightRequests;
pub use store::TtlStore;
