//! Requery scheduling for a single download.
//!
//! A stalled download can re-issue one broadcast source query (once the user
//! activated requerying) and any number of Kad alternate-source lookups. The
//! supervisor tracks what went out and when; the host decides when to ask.
//! There are no timers in here: every call returns promptly and slow work is
//! left to the collaborators.

use serde::Serialize;
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use crate::download::errors::RequeryError;
use crate::download::types::{FileHash, QueryType};
use crate::logging::{WarnThrottle, redact_hex};

mod listener;
mod lookup;
mod policy;
mod stability;


pub use listener::{ChannelQueryDispatcher, QueryDispatcher, RequeryListener};
pub use lookup::{
    CancelableLookup, DhtLookupFactory, LookupCompletion, TaskLookup, spawn_task_lookup,
};
pub use policy::SendPolicy;
pub use stability::{ConnectionProbe, StabilityThresholds, StaticConnectionProbe};

/// Minimum wait between requeries of this download.
pub const REQUERY_COOLDOWN: Duration = Duration::from_secs(5 * 60);
/// Retry hint handed out while connections are not stable yet.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(750);
pub const MIN_STABLE_CONNECTIONS: u32 = 2;
pub const MIN_MESSAGES_PER_CONNECTION: u64 = 6;
pub const MIN_TOTAL_MESSAGES: u64 = 45;
/// How long a Kad alternate-source lookup is expected to run.
pub const DHT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

const UNSTABLE_WARN_INTERVAL: Duration = Duration::from_secs(60);

const BROADCAST_NOT_SENT: u8 = 0;
const BROADCAST_SENDING: u8 = 1;
const BROADCAST_SENT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub cooldown: Duration,
    pub connect_retry_delay: Duration,
    pub dht_lookup_timeout: Duration,
    pub thresholds: StabilityThresholds,
    pub policy: SendPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cooldown: REQUERY_COOLDOWN,
            connect_retry_delay: CONNECT_RETRY_DELAY,
            dht_lookup_timeout: DHT_LOOKUP_TIMEOUT,
            thresholds: StabilityThresholds::default(),
            policy: SendPolicy::build_default(),
        }
    }
}

/// Everything the supervisor calls out to.
#[derive(Clone)]
pub struct RequeryCollaborators {
    pub listener: Arc<dyn RequeryListener>,
    pub dispatcher: Arc<dyn QueryDispatcher>,
    pub probe: Arc<dyn ConnectionProbe>,
    pub dht: Arc<dyn DhtLookupFactory>,
}

/// What a send attempt did. Declined attempts are normal outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SendOutcome {
    /// The send policy does not allow a broadcast requery right now.
    NotAllowed,
    /// The one broadcast requery of this download already went out.
    AlreadySent,
    /// Another send on the same track is still being set up, or a lookup is running.
    InFlight,
    /// Connections are not stable yet; ask again after `retry_in`.
    Pending {
        #[serde(rename = "retry_in_ms", serialize_with = "serialize_millis")]
        retry_in: Duration,
    },
    /// The download had nothing to search for; the broadcast track is done for good.
    Exhausted,
    Started {
        kind: QueryType,
        #[serde(rename = "expected_wait_ms", serialize_with = "serialize_millis")]
        expected_wait: Duration,
    },
    /// No Kad lookup could be started.
    Unavailable,
    /// The supervisor was cleaned up.
    Closed,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastState {
    NotSent,
    Sending,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorSnapshot {
    pub file_hash: String,
    pub activated: bool,
    pub broadcast: BroadcastState,
    pub dht_lookup_in_flight: bool,
    pub dht_queries_issued: u32,
    pub last_query_type: Option<QueryType>,
    pub time_left_ms: i64,
    pub waiting_for_results: bool,
}

enum DhtState {
    Idle,
    Starting {
        generation: u64,
    },
    // Completed from inside `start_lookup`; the finish is reported by the
    // starting call after `on_lookup_started`.
    FinishedWhileStarting {
        generation: u64,
        success: bool,
    },
    InFlight {
        generation: u64,
        handle: Box<dyn CancelableLookup>,
    },
}

impl DhtState {
    fn generation(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Starting { generation }
            | Self::FinishedWhileStarting { generation, .. }
            | Self::InFlight { generation, .. } => Some(*generation),
        }
    }
}

struct Shared {
    file: FileHash,
    cfg: SupervisorConfig,
    collab: RequeryCollaborators,
    activated: AtomicBool,
    closed: AtomicBool,
    broadcast: AtomicU8,
    last_query_type: AtomicU8,
    dht_queries_issued: AtomicU32,
    dht_generation: AtomicU64,
    last_query_sent_at: Mutex<Option<Instant>>,
    dht: Mutex<DhtState>,
    unstable_warn: WarnThrottle,
    #[cfg(any(test, feature = "test-util"))]
    force_stable: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("requery lock poisoned; continuing with recovered state");
            poisoned.into_inner()
        }
    }
}

fn millis_i64(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl Shared {
    fn record_query(&self, kind: QueryType, now: Instant) {
        *lock(&self.last_query_sent_at) = Some(now);
        self.last_query_type
            .store(QueryType::to_tag(Some(kind)), Ordering::Release);
    }

    fn finish_dht_lookup(&self, generation: Option<u64>, success: bool) {
        let released = {
            let mut dht = lock(&self.dht);
            if let Some(want) = generation
                && dht.generation() != Some(want)
            {
                tracing::debug!(
                    file = %redact_hex(&self.file.to_hex_lower()),
                    generation = want,
                    "ignoring completion of a stale dht lookup"
                );
                return;
            }
            match std::mem::replace(&mut *dht, DhtState::Idle) {
                DhtState::Starting { generation } => {
                    *dht = DhtState::FinishedWhileStarting {
                        generation,
                        success,
                    };
                    return;
                }
                finished @ DhtState::FinishedWhileStarting { .. } => {
                    *dht = finished;
                    return;
                }
                other => other,
            }
        };
        // The lookup is over either way; its handle needs no shutdown.
        drop(released);
        self.report_dht_finished(success);
    }

    fn report_dht_finished(&self, success: bool) {
        // Finished regardless of success: results found here may still go unused
        // by the download.
        tracing::info!(
            event = "requery_dht_lookup_finished",
            file = %redact_hex(&self.file.to_hex_lower()),
            success,
            "dht alt-source lookup finished"
        );
        self.collab.listener.on_lookup_finished(QueryType::Dht);
    }
}

/// Holds the broadcast track in `Sending`; falls back to `NotSent` on drop
/// unless the attempt committed the track to `Sent`, including on unwind.
struct SendingGuard<'a> {
    track: &'a AtomicU8,
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.track.compare_exchange(
            BROADCAST_SENDING,
            BROADCAST_NOT_SENT,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let dht = self
            .dht
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let DhtState::InFlight { handle, .. } = std::mem::replace(dht, DhtState::Idle) {
            handle.shutdown();
        }
    }
}

/// Requery state of one download. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RequerySupervisor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RequerySupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequerySupervisor")
            .field("file", &self.shared.file)
            .field("activated", &self.is_activated())
            .field("broadcast", &self.broadcast_state())
            .field("last_query_type", &self.last_query_type())
            .finish_non_exhaustive()
    }
}

impl RequerySupervisor {
    pub fn new(file: FileHash, cfg: SupervisorConfig, collab: RequeryCollaborators) -> Self {
        Self {
            shared: Arc::new(Shared {
                file,
                cfg,
                collab,
                activated: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                broadcast: AtomicU8::new(BROADCAST_NOT_SENT),
                last_query_type: AtomicU8::new(QueryType::to_tag(None)),
                dht_queries_issued: AtomicU32::new(0),
                dht_generation: AtomicU64::new(0),
                last_query_sent_at: Mutex::new(None),
                dht: Mutex::new(DhtState::Idle),
                unstable_warn: WarnThrottle::new(UNSTABLE_WARN_INTERVAL),
                #[cfg(any(test, feature = "test-util"))]
                force_stable: AtomicBool::new(false),
            }),
        }
    }

    pub fn file(&self) -> FileHash {
        self.shared.file
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.cfg
    }

    /// Unlocks broadcast requeries. Idempotent.
    pub fn activate(&self) {
        if !self.shared.activated.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                event = "requery_activated",
                file = %redact_hex(&self.shared.file.to_hex_lower()),
                "requery activated"
            );
        }
    }

    pub fn is_activated(&self) -> bool {
        self.shared.activated.load(Ordering::Acquire)
    }

    pub fn broadcast_state(&self) -> BroadcastState {
        match self.shared.broadcast.load(Ordering::Acquire) {
            BROADCAST_NOT_SENT => BroadcastState::NotSent,
            BROADCAST_SENDING => BroadcastState::Sending,
            _ => BroadcastState::Sent,
        }
    }

    /// True once the broadcast track is used up. Never goes back to false.
    pub fn sent_broadcast_query(&self) -> bool {
        self.broadcast_state() == BroadcastState::Sent
    }

    pub fn can_send_query_after_activate(&self) -> bool {
        !self.sent_broadcast_query()
    }

    pub fn can_send_query_now(&self) -> bool {
        self.shared
            .cfg
            .policy
            .allows(self.is_activated(), self.sent_broadcast_query())
    }

    pub fn last_query_type(&self) -> Option<QueryType> {
        QueryType::from_tag(self.shared.last_query_type.load(Ordering::Acquire))
    }

    pub fn dht_queries_issued(&self) -> u32 {
        self.shared.dht_queries_issued.load(Ordering::Acquire)
    }

    pub fn has_dht_lookup(&self) -> bool {
        matches!(
            *lock(&self.shared.dht),
            DhtState::Starting { .. } | DhtState::InFlight { .. }
        )
    }

    /// Milliseconds left in the current query's cooldown. Zero or negative means
    /// elapsed; zero as well when no query was ever sent.
    pub fn time_left_in_query(&self) -> i64 {
        self.time_left_in_query_at(Instant::now())
    }

    pub fn time_left_in_query_at(&self, now: Instant) -> i64 {
        let Some(sent_at) = *lock(&self.shared.last_query_sent_at) else {
            return 0;
        };
        let elapsed = match now.checked_duration_since(sent_at) {
            Some(d) => millis_i64(d),
            None => -millis_i64(sent_at.duration_since(now)),
        };
        millis_i64(self.shared.cfg.cooldown).saturating_sub(elapsed)
    }

    pub fn is_waiting_for_results(&self) -> bool {
        self.is_waiting_for_results_at(Instant::now())
    }

    pub fn is_waiting_for_results_at(&self, now: Instant) -> bool {
        match self.last_query_type() {
            None => false,
            Some(QueryType::Dht) => self.has_dht_lookup() && self.time_left_in_query_at(now) > 0,
            Some(QueryType::Broadcast) => self.time_left_in_query_at(now) > 0,
        }
    }

    /// Sends the broadcast requery if the send policy allows it.
    pub fn send_query(&self) -> Result<SendOutcome, RequeryError> {
        self.send_query_at(Instant::now())
    }

    pub fn send_query_at(&self, now: Instant) -> Result<SendOutcome, RequeryError> {
        let s = &self.shared;
        let file = redact_hex(&s.file.to_hex_lower());
        if s.closed.load(Ordering::Acquire) {
            return Ok(SendOutcome::Closed);
        }
        if !self.can_send_query_now() {
            tracing::debug!(%file, "tried to send requery, but cannot do it now");
            return Ok(SendOutcome::NotAllowed);
        }
        match s.broadcast.compare_exchange(
            BROADCAST_NOT_SENT,
            BROADCAST_SENDING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(BROADCAST_SENDING) => return Ok(SendOutcome::InFlight),
            Err(_) => {
                tracing::debug!(%file, "allowed to send a requery, but broadcast already sent");
                return Ok(SendOutcome::AlreadySent);
            }
        }

        let _guard = SendingGuard {
            track: &s.broadcast,
        };
        // Checked with the track already in `Sending`; `send_dht_query` checks
        // the track under the same lock, so only one of the two can go ahead.
        if !matches!(*lock(&s.dht), DhtState::Idle) {
            tracing::debug!(%file, "dht lookup still running; holding back broadcast requery");
            return Ok(SendOutcome::InFlight);
        }
        self.send_broadcast_query(now, &file)
    }

    // Caller holds the broadcast track in `BROADCAST_SENDING`.
    fn send_broadcast_query(&self, now: Instant, file: &str) -> Result<SendOutcome, RequeryError> {
        let s = &self.shared;
        let stable = self.has_stable_connections();
        if !stable {
            if let Some(suppressed) = s.unstable_warn.allow(now) {
                tracing::warn!(
                    event = "requery_connections_unstable",
                    %file,
                    suppressed,
                    retry_in_ms = millis_i64(s.cfg.connect_retry_delay),
                    "broadcast requery held back: no stable connections"
                );
            }
            s.collab
                .listener
                .on_lookup_pending(QueryType::Broadcast, s.cfg.connect_retry_delay);
            return Ok(SendOutcome::Pending {
                retry_in: s.cfg.connect_retry_delay,
            });
        }

        let Some(query) = s.collab.listener.build_query() else {
            s.broadcast.store(BROADCAST_SENT, Ordering::Release);
            tracing::info!(
                event = "requery_broadcast_exhausted",
                %file,
                "download has nothing to requery; broadcast track closed"
            );
            s.collab.listener.on_lookup_finished(QueryType::Broadcast);
            return Ok(SendOutcome::Exhausted);
        };

        s.collab
            .dispatcher
            .submit(query)
            .map_err(|source| RequeryError::Dispatch {
                file: s.file,
                source,
            })?;
        s.broadcast.store(BROADCAST_SENT, Ordering::Release);
        s.record_query(QueryType::Broadcast, now);
        tracing::info!(
            event = "requery_broadcast_sent",
            %file,
            cooldown_secs = s.cfg.cooldown.as_secs(),
            "sent broadcast requery"
        );
        s.collab
            .listener
            .on_lookup_started(QueryType::Broadcast, s.cfg.cooldown);
        Ok(SendOutcome::Started {
            kind: QueryType::Broadcast,
            expected_wait: s.cfg.cooldown,
        })
    }

    /// Starts a Kad alternate-source lookup unless one is already running.
    ///
    /// Not gated by activation or the send policy; the host caps how many of
    /// these go out using [`dht_queries_issued`](Self::dht_queries_issued).
    pub fn send_dht_query(&self) -> SendOutcome {
        self.send_dht_query_at(Instant::now())
    }

    pub fn send_dht_query_at(&self, now: Instant) -> SendOutcome {
        let s = &self.shared;
        let file = redact_hex(&s.file.to_hex_lower());
        if s.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        let generation = {
            let mut dht = lock(&s.dht);
            if !matches!(*dht, DhtState::Idle) {
                tracing::debug!(%file, "dht lookup already in flight");
                return SendOutcome::InFlight;
            }
            if s.broadcast.load(Ordering::Acquire) == BROADCAST_SENDING {
                tracing::debug!(%file, "broadcast requery in progress; holding back dht lookup");
                return SendOutcome::InFlight;
            }
            let generation = s.dht_generation.fetch_add(1, Ordering::AcqRel) + 1;
            *dht = DhtState::Starting { generation };
            generation
        };

        let completion = LookupCompletion {
            shared: Arc::downgrade(&self.shared),
            generation,
        };
        let Some(handle) = s.collab.dht.start_lookup(s.file, completion) else {
            let mut dht = lock(&s.dht);
            if dht.generation() == Some(generation) {
                *dht = DhtState::Idle;
            }
            tracing::debug!(%file, "no dht lookup available");
            return SendOutcome::Unavailable;
        };

        let issued = s.dht_queries_issued.fetch_add(1, Ordering::AcqRel) + 1;
        s.record_query(QueryType::Dht, now);

        let (leftover, finished_early) = {
            let mut dht = lock(&s.dht);
            match std::mem::replace(&mut *dht, DhtState::Idle) {
                DhtState::Starting { generation: g } if g == generation => {
                    *dht = DhtState::InFlight { generation, handle };
                    (None, None)
                }
                DhtState::FinishedWhileStarting {
                    generation: g,
                    success,
                } if g == generation => (None, Some(success)),
                other => {
                    *dht = other;
                    (Some(handle), None)
                }
            }
        };
        if let Some(handle) = leftover
            && s.closed.load(Ordering::Acquire)
        {
            tracing::debug!(%file, generation, "cleaned up while starting; cancelling dht lookup");
            handle.shutdown();
        }

        let expected_wait = s.cfg.cooldown.max(s.cfg.dht_lookup_timeout);
        tracing::info!(
            event = "requery_dht_lookup_started",
            %file,
            generation,
            issued,
            "started dht alt-source lookup"
        );
        s.collab
            .listener
            .on_lookup_started(QueryType::Dht, expected_wait);
        if let Some(success) = finished_early {
            s.report_dht_finished(success);
        }
        SendOutcome::Started {
            kind: QueryType::Dht,
            expected_wait,
        }
    }

    /// Completion of the running DHT lookup. Always clears the lookup and reports
    /// it finished, whether or not it found anything.
    pub fn handle_alt_loc_search_done(&self, success: bool) {
        self.shared.finish_dht_lookup(None, success);
    }

    /// Cancels an outstanding DHT lookup. Safe to call any number of times.
    pub fn clean_up(&self) {
        let s = &self.shared;
        s.closed.store(true, Ordering::Release);
        let previous = std::mem::replace(&mut *lock(&s.dht), DhtState::Idle);
        match previous {
            DhtState::InFlight { generation, handle } => {
                tracing::debug!(
                    file = %redact_hex(&s.file.to_hex_lower()),
                    generation,
                    "cancelling dht lookup on clean up"
                );
                handle.shutdown();
            }
            DhtState::Starting { .. }
            | DhtState::FinishedWhileStarting { .. }
            | DhtState::Idle => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> SupervisorSnapshot {
        SupervisorSnapshot {
            file_hash: self.shared.file.to_hex_lower(),
            activated: self.is_activated(),
            broadcast: self.broadcast_state(),
            dht_lookup_in_flight: self.has_dht_lookup(),
            dht_queries_issued: self.dht_queries_issued(),
            last_query_type: self.last_query_type(),
            time_left_ms: self.time_left_in_query_at(now),
            waiting_for_results: self.is_waiting_for_results_at(now),
        }
    }

    fn has_stable_connections(&self) -> bool {
        self.forced_stable()
            || self
                .shared
                .cfg
                .thresholds
                .is_stable(self.shared.collab.probe.as_ref())
    }

    #[cfg(any(test, feature = "test-util"))]
    fn forced_stable(&self) -> bool {
        self.shared.force_stable.load(Ordering::Acquire)
    }

    #[cfg(not(any(test, feature = "test-util")))]
    fn forced_stable(&self) -> bool {
        false
    }

    /// Test-only: treat connections as stable regardless of the probe.
    #[cfg(any(test, feature = "test-util"))]
    pub fn force_stable_connections(&self, force: bool) {
        self.shared.force_stable.store(force, Ordering::Release);
    }
}
