//! In-Flight Dedup and Result Cache
//!
//! At most one pipeline execution runs per request fingerprint. Concurrent
//! duplicates attach to the same shared future and receive the same
//! `Arc<PipelineResult>`. Completed results are kept for a short TTL and
//! evicted lazily.
//!
//! The DashMap shard lock is held only while inspecting or inserting an
//! entry. Execution happens outside it, on a spawned task, so it runs to
//! completion and settles its entry even when every waiter goes away.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::types::PipelineResult;
use crate::types::ModelId;

type SharedResult = Shared<BoxFuture<'static, Arc<PipelineResult>>>;

enum Entry {
    InFlight {
        future: SharedResult,
        generation: u64,
        created_at: Instant,
    },
    Completed {
        result: Arc<PipelineResult>,
        completed_at: Instant,
    },
}

enum Lookup {
    Hit(Arc<PipelineResult>),
    Attach(SharedResult, u64),
    Start,
}

/// Counters for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub in_flight: usize,
    pub cached: usize,
    /// Pipeline executions started
    pub executions: u64,
    /// Requests served by an in-flight execution or the cache
    pub hits: u64,
}

/// Deterministic fingerprint over the normalized prompt, the sorted
/// candidate set and the policy version.
pub fn fingerprint<'a, I>(prompt: &str, candidates: I, policy_version: u64) -> String
where
    I: IntoIterator<Item = &'a ModelId>,
{
    let normalized = prompt.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut models: Vec<&str> = candidates.into_iter().map(ModelId::as_str).collect();
    models.sort_unstable();
    models.dedup();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"\x00");
    for model in models {
        hasher.update(model.as_bytes());
        hasher.update(b"\x00");
    }
    hasher.update(policy_version.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct DedupCache {
    entries: Arc<DashMap<String, Entry>>,
    ttl: Duration,
    next_generation: AtomicU64,
    executions: AtomicU64,
    hits: AtomicU64,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            next_generation: AtomicU64::new(1),
            executions: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Return the cached or in-flight result for `fingerprint`, or start
    /// `execute` and share it with concurrent callers.
    pub async fn get_or_create<F, Fut>(&self, fingerprint: &str, execute: F) -> Arc<PipelineResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult> + Send + 'static,
    {
        let (future, generation) = {
            let entry = self.entries.entry(fingerprint.to_string());
            let lookup = match &entry {
                MapEntry::Occupied(occupied) => match occupied.get() {
                    Entry::Completed {
                        result,
                        completed_at,
                    } if completed_at.elapsed() < self.ttl => Lookup::Hit(Arc::clone(result)),
                    Entry::InFlight {
                        future,
                        generation,
                        created_at,
                    } if created_at.elapsed() < self.ttl => {
                        Lookup::Attach(future.clone(), *generation)
                    }
                    Entry::InFlight { .. } | Entry::Completed { .. } => Lookup::Start,
                },
                MapEntry::Vacant(_) => Lookup::Start,
            };

            match lookup {
                Lookup::Hit(result) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(request_id = %result.request_id, "Dedup cache hit");
                    return result;
                }
                Lookup::Attach(future, generation) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Attached to in-flight execution");
                    (future, generation)
                }
                Lookup::Start => {
                    let (fresh, future, generation) = self.start(fingerprint, execute);
                    entry.insert(fresh);
                    (future, generation)
                }
            }
        };

        let result = future.await;
        settle(&self.entries, fingerprint, generation, &result);
        result
    }

    /// Spawn the execution and return the entry that shares it.
    ///
    /// The spawned driver owns one clone of the shared future, so progress
    /// never depends on a waiter being polled.
    fn start<F, Fut>(&self, fingerprint: &str, execute: F) -> (Entry, SharedResult, u64)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.executions.fetch_add(1, Ordering::Relaxed);

        let future = execute().map(Arc::new).boxed().shared();

        let driver = future.clone();
        let entries = Arc::clone(&self.entries);
        let key = fingerprint.to_string();
        tokio::spawn(async move {
            let result = driver.await;
            settle(&entries, &key, generation, &result);
        });

        let entry = Entry::InFlight {
            future: future.clone(),
            generation,
            created_at: Instant::now(),
        };
        (entry, future, generation)
    }

    /// Drop completed and in-flight entries older than the TTL.
    ///
    /// An evicted execution still finishes, but its result is not cached.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry {
            Entry::Completed { completed_at, .. } => completed_at.elapsed() < self.ttl,
            Entry::InFlight { created_at, .. } => created_at.elapsed() < self.ttl,
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn stats(&self) -> DedupStats {
        let mut stats = DedupStats {
            executions: self.executions.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in self.entries.iter() {
            match entry.value() {
                Entry::InFlight { .. } => stats.in_flight += 1,
                Entry::Completed { .. } => stats.cached += 1,
            }
        }
        stats
    }
}

/// Replace the in-flight entry of `generation` once it resolved.
/// The driver task and every waiter call this; only the first finds the entry.
fn settle(
    entries: &DashMap<String, Entry>,
    fingerprint: &str,
    generation: u64,
    result: &Arc<PipelineResult>,
) {
    let MapEntry::Occupied(mut occupied) = entries.entry(fingerprint.to_string()) else {
        return;
    };
    let current = matches!(
        occupied.get(),
        Entry::InFlight { generation: g, .. } if *g == generation
    );
    if !current {
        return;
    }

    if result.is_cacheable() {
        occupied.insert(Entry::Completed {
            result: Arc::clone(result),
            completed_at: Instant::now(),
        });
    } else {
        occupied.remove();
    }
}
