use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};

use crate::utils::defer::defer;

use super::{CacheContents, CacheError, CacheKey, CacheName};

type ComputationChannel<T> = Shared<oneshot::Receiver<CacheContents<T>>>;
type ComputationMap<T> = Arc<Mutex<BTreeMap<CacheKey, ComputationChannel<T>>>>;

/// Deduplicates concurrent lookups for the same key.
///
/// While a computation for a key is running, every further caller for that
/// key is handed the same channel and observes the literal same resolution
/// or rejection. The map entry is removed the moment the computation
/// settles, success or failure, so a later caller always starts fresh.
///
/// Invariant: at most one outstanding computation per key at any instant
/// within one process.
pub struct InFlightRequests<T> {
    name: CacheName,
    current_computations: ComputationMap<T>,
}

impl<T> std::fmt::Debug for InFlightRequests<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .current_computations
            .try_lock()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("InFlightRequests")
            .field("name", &self.name)
            .field("pending", &pending)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> InFlightRequests<T> {
    pub fn new(name: CacheName) -> Self {
        InFlightRequests {
            name,
            current_computations: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Runs `computation` for `key`, sharing the outcome with every
    /// concurrent caller of the same key.
    ///
    /// NOTE: This function itself is *not* `async`, because it should
    /// eagerly spawn the computation on the runtime, even if the caller does
    /// not `await` the result right away.
    pub fn spawn_deduplicated<F>(
        &self,
        key: CacheKey,
        computation: F,
    ) -> BoxFuture<'static, CacheContents<T>>
    where
        F: Future<Output = CacheContents<T>> + Send + 'static,
    {
        let name = self.name;
        let channel = {
            let mut current_computations = self.current_computations.lock().unwrap();
            if let Some(channel) = current_computations.get(&key) {
                // A concurrent lookup was deduplicated.
                metric!(counter("caches.channel.hit") += 1, "cache" => name.as_ref());
                channel.clone()
            } else {
                // A concurrent lookup is considered new. This does not imply
                // an upstream request; the cache tiers were consulted first.
                metric!(counter("caches.channel.miss") += 1, "cache" => name.as_ref());

                let (sender, receiver) = oneshot::channel();

                let remove_computation_token = {
                    let key = key.clone();
                    let current_computations = Arc::clone(&self.current_computations);
                    defer(move || {
                        current_computations.lock().unwrap().remove(&key);
                    })
                };

                let task = async move {
                    let result = computation.await;
                    // Drop the token first to evict from the map. This
                    // ensures that callers either get a channel that will
                    // receive data, or they create a new channel.
                    drop(remove_computation_token);
                    sender.send(result).ok();
                };
                tokio::spawn(task);

                let channel = receiver.shared();
                current_computations.insert(key, channel.clone());
                channel
            }
        };

        let future = channel.unwrap_or_else(move |_canceled| {
            tracing::error!("{name} computation channel dropped before settling");
            Err(CacheError::InternalError)
        });

        Box::pin(future)
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.current_computations.lock().unwrap().len()
    }
}
