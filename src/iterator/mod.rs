//! Resumable, filtered network scans
//!
//! The [`IteratorManager`] owns a registry of live scans keyed by an opaque
//! ID. Each [`Advance`](IteratorManager::advance) call re-walks the queried
//! network from the start, skips through to the last network it handed out
//! and then pulls up to `max_results` matching entries. Nothing is buffered
//! between calls, so an iterator costs a few hundred bytes no matter how
//! large the scanned block is.
//!
//! Every batch carries a [`ResumeToken`] holding the same state, which lets a
//! client continue after the server has restarted or the iterator has idled
//! out of the registry.
//!
//! # Locking
//!
//! - The registry map sits behind one mutex, held only for inserts, removals,
//!   lookups and the sweep.
//! - Each iterator has its own state mutex, held for a whole Advance, so two
//!   calls with the same ID run one after the other.
//! - The last-access stamp has a separate mutex so that lookups and the sweep
//!   never wait behind a running Advance.

mod source;
mod token;

pub use source::{NetworkEntry, NetworkSource};
pub use token::{ResumeToken, TokenError};

use crate::data_section::DataValue;
use crate::filter::{self, FilterEngine, FilterError, FilterMode, Predicate};
use crate::mmdb::MmdbError;
use crate::periodic::PeriodicTask;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use ipnet::IpNet;
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bytes of entropy in an iterator ID
const ID_BYTES: usize = 16;

/// Iterator manager errors
#[derive(Debug, Error)]
pub enum IteratorError {
    /// No live iterator with this ID
    #[error("iterator '{0}' not found")]
    NotFound(String),
    /// Predicates failed validation
    #[error(transparent)]
    Filter(#[from] FilterError),
    /// Resume token could not be decoded
    #[error(transparent)]
    Token(#[from] TokenError),
    /// Entropy source failed while generating an ID
    #[error("failed to generate iterator id: {0}")]
    IdGeneration(String),
    /// `max_results` must be positive
    #[error("max_results must be greater than zero")]
    InvalidMaxResults,
    /// The underlying network walk failed
    #[error("network traversal failed: {0}")]
    Traversal(#[from] MmdbError),
}

impl IteratorError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            IteratorError::NotFound(_) => "iterator_not_found",
            IteratorError::Filter(e) => e.code(),
            IteratorError::Token(_) => "resume_failed",
            IteratorError::IdGeneration(_) => "iterator_creation_failed",
            IteratorError::InvalidMaxResults => "invalid_parameter",
            IteratorError::Traversal(_) => "iteration_failed",
        }
    }
}

/// A network and its decoded record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkRecord {
    /// CIDR of the block
    pub network: IpNet,
    /// Decoded record
    pub data: DataValue,
}

/// One page of scan results
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    /// Matching networks in walk order
    pub results: Vec<NetworkRecord>,
    /// ID of the live iterator
    pub iterator_id: String,
    /// Token to continue without the live iterator
    pub resume_token: String,
    /// True when the walk had at least one more entry
    pub has_more: bool,
    /// Networks visited over the iterator's lifetime
    pub total_processed: u64,
    /// Networks that matched over the iterator's lifetime
    pub total_matched: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ScanState {
    last_network: Option<IpNet>,
    processed: u64,
    matched: u64,
}

/// A registered scan
pub struct ManagedIterator {
    id: String,
    source: Arc<dyn NetworkSource>,
    database: String,
    network: IpNet,
    predicates: Vec<Predicate>,
    mode: FilterMode,
    /// `None` when there are no predicates
    filter: Option<FilterEngine>,
    created: Instant,
    last_access: Mutex<Instant>,
    state: Mutex<ScanState>,
}

impl fmt::Debug for ManagedIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedIterator")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("network", &self.network)
            .field("mode", &self.mode)
            .field("filters", &self.predicates.len())
            .finish_non_exhaustive()
    }
}

impl ManagedIterator {
    /// Opaque ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Database the scan is bound to
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Queried network
    pub fn network(&self) -> IpNet {
        self.network
    }

    /// Predicate combination mode
    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Bound predicates
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Time since the last lookup or advance
    pub fn idle_time(&self) -> Duration {
        lock(&self.last_access).elapsed()
    }

    /// `(processed, matched)` so far
    pub fn counters(&self) -> (u64, u64) {
        let state = lock(&self.state);
        (state.processed, state.matched)
    }

    /// Last network handed out, the resume anchor
    pub fn last_network(&self) -> Option<IpNet> {
        lock(&self.state).last_network
    }

    /// Current resume token
    pub fn resume_token(&self) -> ResumeToken {
        let state = *lock(&self.state);
        self.token_for(&state)
    }

    fn token_for(&self, state: &ScanState) -> ResumeToken {
        ResumeToken {
            database: self.database.clone(),
            network: self.network.to_string(),
            filter_mode: self.mode,
            filters: self.predicates.clone(),
            processed: state.processed,
            matched: state.matched,
            last_network: state
                .last_network
                .map(|n| n.to_string())
                .unwrap_or_default(),
        }
    }

    fn touch(&self) {
        *lock(&self.last_access) = Instant::now();
    }

    fn batch(&self, state: &ScanState, results: Vec<NetworkRecord>, has_more: bool) -> Batch {
        Batch {
            results,
            iterator_id: self.id.clone(),
            resume_token: self.token_for(state).encode(),
            has_more,
            total_processed: state.processed,
            total_matched: state.matched,
        }
    }

    fn advance(&self, max_results: usize) -> Result<Batch, IteratorError> {
        if max_results == 0 {
            return Err(IteratorError::InvalidMaxResults);
        }
        self.touch();

        let mut state = lock(&self.state);
        let mut walk = self.source.networks_within(self.network)?.peekable();

        if let Some(anchor) = state.last_network {
            let mut found = false;
            for entry in walk.by_ref() {
                if entry?.network == anchor {
                    found = true;
                    break;
                }
            }
            if !found {
                warn!(
                    iterator = %self.id,
                    %anchor,
                    "resume position no longer present in the database, ending scan"
                );
                return Ok(self.batch(&state, Vec::new(), false));
            }
        }

        let mut results = Vec::new();
        let mut counted = 0u64;
        while results.len() < max_results {
            let entry = match walk.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) if counted > 0 => {
                    // Entries already counted must reach the caller
                    warn!(
                        iterator = %self.id,
                        error = %e,
                        delivered = results.len(),
                        "walk failed mid-batch, returning partial results"
                    );
                    return Ok(self.batch(&state, results, false));
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            };

            // Position moves before decoding so a failure never revisits
            // an entry already counted
            state.processed += 1;
            state.last_network = Some(entry.network);
            counted += 1;

            let record = match self.source.decode(&entry) {
                Ok(record) => record,
                Err(e) => {
                    debug!(iterator = %self.id, network = %entry.network, error = %e, "skipping undecodable record");
                    continue;
                }
            };

            if let Some(filter) = &self.filter {
                if !filter.matches(&record) {
                    continue;
                }
            }

            state.matched += 1;
            results.push(NetworkRecord {
                network: entry.network,
                data: record,
            });
        }

        let has_more = results.len() >= max_results && walk.peek().is_some();
        Ok(self.batch(&state, results, has_more))
    }
}

/// Registry of live iterators plus its expiry sweep
pub struct IteratorManager {
    registry: Arc<Registry>,
    ttl: Duration,
    sweep: Mutex<Option<PeriodicTask>>,
}

#[derive(Default)]
struct Registry {
    iterators: Mutex<HashMap<String, Arc<ManagedIterator>>>,
}

impl Registry {
    fn expire(&self, ttl: Duration) -> usize {
        let mut iterators = lock(&self.iterators);
        let before = iterators.len();
        iterators.retain(|id, it| {
            let keep = it.idle_time() <= ttl;
            if !keep {
                debug!(iterator = %id, "expiring idle iterator");
            }
            keep
        });
        before - iterators.len()
    }
}

impl IteratorManager {
    /// Create a manager whose iterators expire after `ttl` without use
    pub fn new(ttl: Duration) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            ttl,
            sweep: Mutex::new(None),
        }
    }

    /// Idle time after which iterators are removed
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a new scan
    ///
    /// Predicates are validated first. An empty predicate list binds no
    /// filter and every network matches.
    pub fn create(
        &self,
        source: Arc<dyn NetworkSource>,
        database: &str,
        network: IpNet,
        predicates: Vec<Predicate>,
        mode: FilterMode,
    ) -> Result<Arc<ManagedIterator>, IteratorError> {
        filter::validate(&predicates)?;
        let filter = if predicates.is_empty() {
            None
        } else {
            Some(FilterEngine::new(predicates.clone(), mode))
        };

        let now = Instant::now();
        let iterator = Arc::new(ManagedIterator {
            id: generate_id()?,
            source,
            database: database.to_string(),
            network: network.trunc(),
            predicates,
            mode,
            filter,
            created: now,
            last_access: Mutex::new(now),
            state: Mutex::new(ScanState::default()),
        });

        lock(&self.registry.iterators).insert(iterator.id.clone(), Arc::clone(&iterator));
        info!(
            iterator = %iterator.id,
            database,
            network = %iterator.network,
            filters = iterator.predicates.len(),
            "created iterator"
        );
        Ok(iterator)
    }

    /// Rebuild a scan from an encoded resume token
    ///
    /// The new iterator gets a fresh ID.
    pub fn resume(
        &self,
        source: Arc<dyn NetworkSource>,
        token: &str,
    ) -> Result<Arc<ManagedIterator>, IteratorError> {
        let token = ResumeToken::decode(token)?;
        self.resume_from(source, &token)
    }

    /// Rebuild a scan from an already decoded token
    pub fn resume_from(
        &self,
        source: Arc<dyn NetworkSource>,
        token: &ResumeToken,
    ) -> Result<Arc<ManagedIterator>, IteratorError> {
        let network = token.network()?;
        let last_network = token.last_network()?;
        let iterator = self.create(
            source,
            &token.database,
            network,
            token.filters.clone(),
            token.filter_mode,
        )?;

        *lock(&iterator.state) = ScanState {
            last_network,
            processed: token.processed,
            matched: token.matched,
        };
        info!(
            iterator = %iterator.id,
            processed = token.processed,
            "resumed iterator from token"
        );
        Ok(iterator)
    }

    /// Find a live iterator, refreshing its idle timer
    pub fn lookup(&self, id: &str) -> Option<Arc<ManagedIterator>> {
        let iterator = lock(&self.registry.iterators).get(id).cloned()?;
        iterator.touch();
        Some(iterator)
    }

    /// Pull the next batch from an iterator
    pub fn advance(
        &self,
        iterator: &ManagedIterator,
        max_results: usize,
    ) -> Result<Batch, IteratorError> {
        iterator.advance(max_results)
    }

    /// Pull the next batch from the iterator with this ID
    pub fn advance_id(&self, id: &str, max_results: usize) -> Result<Batch, IteratorError> {
        let iterator = self
            .lookup(id)
            .ok_or_else(|| IteratorError::NotFound(id.to_string()))?;
        iterator.advance(max_results)
    }

    /// Drop an iterator; unknown IDs are ignored
    pub fn remove(&self, id: &str) {
        if lock(&self.registry.iterators).remove(id).is_some() {
            debug!(iterator = %id, "removed iterator");
        }
    }

    /// Number of live iterators
    pub fn len(&self) -> usize {
        lock(&self.registry.iterators).len()
    }

    /// True when no iterators are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove iterators idle for longer than the TTL; returns how many
    pub fn expire_idle(&self) -> usize {
        self.registry.expire(self.ttl)
    }

    /// Start the background sweep; a running sweep is replaced
    pub fn start_sweep(&self, interval: Duration) -> std::io::Result<()> {
        let registry = Arc::clone(&self.registry);
        let ttl = self.ttl;
        let task = PeriodicTask::spawn("iterator-sweep", interval, move || {
            let expired = registry.expire(ttl);
            if expired > 0 {
                info!(expired, "expired idle iterators");
            }
        })?;

        if let Some(mut previous) = lock(&self.sweep).replace(task) {
            previous.stop();
        }
        Ok(())
    }

    /// Stop the background sweep
    ///
    /// Safe to call more than once or without a running sweep.
    pub fn stop_sweep(&self) {
        if let Some(mut task) = lock(&self.sweep).take() {
            task.stop();
        }
    }
}

impl Drop for IteratorManager {
    fn drop(&mut self) {
        self.stop_sweep();
    }
}

fn generate_id() -> Result<String, IteratorError> {
    let mut bytes = [0u8; ID_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| IteratorError::IdGeneration(e.to_string()))?;
    Ok(URL_SAFE.encode(bytes))
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
