use crate::config::RequeryConfig;
use crate::download::errors::{RequeryError, RequeryServiceError};
use crate::download::requery::{RequerySupervisor, SendOutcome, SupervisorSnapshot};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

pub type Result<T> = std::result::Result<T, RequeryServiceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeryServiceConfig {
    pub poll_every: Duration,
    /// Kad lookups to try before falling back to the broadcast requery.
    pub max_dht_queries: u32,
}

impl RequeryServiceConfig {
    pub fn from_requery_config(cfg: &RequeryConfig) -> Self {
        Self {
            poll_every: Duration::from_millis(cfg.poll_every_ms.max(1)),
            max_dht_queries: cfg.max_dht_queries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeryServiceStatus {
    pub running: bool,
    pub attempts: u64,
    pub last_outcome: Option<SendOutcome>,
    pub supervisor: SupervisorSnapshot,
    pub started_at: Instant,
}

#[derive(Debug)]
pub enum RequeryCommand {
    Activate {
        reply: oneshot::Sender<()>,
    },
    SendNow {
        reply: oneshot::Sender<std::result::Result<SendOutcome, RequeryError>>,
    },
    SendDhtNow {
        reply: oneshot::Sender<SendOutcome>,
    },
    Snapshot {
        reply: oneshot::Sender<SupervisorSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct RequeryServiceHandle {
    tx: mpsc::Sender<RequeryCommand>,
}

impl RequeryServiceHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RequeryCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| RequeryServiceError::ChannelClosed)?;
        rx.await.map_err(|_| RequeryServiceError::ChannelClosed)
    }

    pub async fn activate(&self) -> Result<()> {
        self.request(|reply| RequeryCommand::Activate { reply }).await
    }

    pub async fn send_now(&self) -> Result<SendOutcome> {
        let outcome = self
            .request(|reply| RequeryCommand::SendNow { reply })
            .await?;
        Ok(outcome?)
    }

    pub async fn send_dht_now(&self) -> Result<SendOutcome> {
        self.request(|reply| RequeryCommand::SendDhtNow { reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<SupervisorSnapshot> {
        self.request(|reply| RequeryCommand::Snapshot { reply })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| RequeryCommand::Shutdown { reply })
            .await
    }
}

/// Spawns the host loop that drives one download's requeries.
///
/// Must be called from within a tokio runtime.
pub fn start_service(
    cfg: RequeryServiceConfig,
    supervisor: RequerySupervisor,
) -> (
    RequeryServiceHandle,
    watch::Receiver<RequeryServiceStatus>,
    tokio::task::JoinHandle<Result<()>>,
) {
    let (tx, rx) = mpsc::channel(32);
    let started_at = Instant::now();
    let (status_tx, status_rx) = watch::channel(RequeryServiceStatus {
        running: true,
        attempts: 0,
        last_outcome: None,
        supervisor: supervisor.snapshot_at(started_at),
        started_at,
    });
    let join = tokio::spawn(run_service(rx, status_tx, supervisor, cfg, started_at));
    (RequeryServiceHandle { tx }, status_rx, join)
}

/// One scheduling step: Kad lookups first while under the cap, then the
/// broadcast requery. `None` while the previous query is still running.
pub fn requery_tick(
    supervisor: &RequerySupervisor,
    cfg: &RequeryServiceConfig,
    now: Instant,
) -> std::result::Result<Option<SendOutcome>, RequeryError> {
    if supervisor.is_waiting_for_results_at(now) {
        return Ok(None);
    }
    if supervisor.dht_queries_issued() < cfg.max_dht_queries {
        match supervisor.send_dht_query_at(now) {
            SendOutcome::Unavailable => {}
            outcome => return Ok(Some(outcome)),
        }
    }
    supervisor.send_query_at(now).map(Some)
}

// Gated outcomes change nothing, so they are not attempts.
fn counts_as_attempt(outcome: &SendOutcome) -> bool {
    !matches!(
        outcome,
        SendOutcome::NotAllowed
            | SendOutcome::AlreadySent
            | SendOutcome::InFlight
            | SendOutcome::Closed
    )
}

struct Progress {
    attempts: u64,
    last_outcome: Option<SendOutcome>,
}

impl Progress {
    fn record(&mut self, outcome: SendOutcome) {
        if counts_as_attempt(&outcome) {
            self.attempts += 1;
        }
        self.last_outcome = Some(outcome);
    }
}

// The cooldown countdown alone does not republish.
fn status_changed(old: &RequeryServiceStatus, new: &RequeryServiceStatus) -> bool {
    old.running != new.running
        || old.attempts != new.attempts
        || old.last_outcome != new.last_outcome
        || SupervisorSnapshot {
            time_left_ms: new.supervisor.time_left_ms,
            ..old.supervisor.clone()
        } != new.supervisor
}

fn publish(
    status_tx: &watch::Sender<RequeryServiceStatus>,
    supervisor: &RequerySupervisor,
    progress: &Progress,
    running: bool,
    started_at: Instant,
) {
    let next = RequeryServiceStatus {
        running,
        attempts: progress.attempts,
        last_outcome: progress.last_outcome,
        supervisor: supervisor.snapshot(),
        started_at,
    };
    status_tx.send_if_modified(|current| {
        if !status_changed(current, &next) {
            return false;
        }
        *current = next;
        true
    });
}

async fn run_service(
    mut rx: mpsc::Receiver<RequeryCommand>,
    status_tx: watch::Sender<RequeryServiceStatus>,
    supervisor: RequerySupervisor,
    cfg: RequeryServiceConfig,
    started_at: Instant,
) -> Result<()> {
    let file = crate::logging::redact_hex(&supervisor.file().to_hex_lower());
    let mut progress = Progress {
        attempts: 0,
        last_outcome: None,
    };
    let mut next_attempt = tokio::time::Instant::now();

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    break;
                };
                match cmd {
                    RequeryCommand::Activate { reply } => {
                        supervisor.activate();
                        next_attempt = tokio::time::Instant::now();
                        let _ = reply.send(());
                    }
                    RequeryCommand::SendNow { reply } => {
                        let result = supervisor.send_query();
                        if let Ok(outcome) = &result {
                            progress.record(*outcome);
                        }
                        let _ = reply.send(result);
                    }
                    RequeryCommand::SendDhtNow { reply } => {
                        let outcome = supervisor.send_dht_query();
                        progress.record(outcome);
                        let _ = reply.send(outcome);
                    }
                    RequeryCommand::Snapshot { reply } => {
                        let _ = reply.send(supervisor.snapshot());
                    }
                    RequeryCommand::Shutdown { reply } => {
                        supervisor.clean_up();
                        publish(&status_tx, &supervisor, &progress, false, started_at);
                        let _ = reply.send(());
                        return Ok(());
                    }
                }
            }
            _ = tokio::time::sleep_until(next_attempt) => {
                let delay = match requery_tick(&supervisor, &cfg, Instant::now()) {
                    Ok(Some(outcome)) => {
                        progress.record(outcome);
                        match outcome {
                            SendOutcome::Pending { retry_in } => retry_in,
                            _ => cfg.poll_every,
                        }
                    }
                    Ok(None) => cfg.poll_every,
                    Err(err) => {
                        tracing::warn!(%file, error = %err, "requery attempt failed");
                        cfg.poll_every
                    }
                };
                next_attempt = tokio::time::Instant::now() + delay;
            }
        }
        publish(&status_tx, &supervisor, &progress, true, started_at);
    }

    supervisor.clean_up();
    publish(&status_tx, &supervisor, &progress, false, started_at);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::requery::{
        BroadcastState, CancelableLookup, ChannelQueryDispatcher, DhtLookupFactory,
        LookupCompletion, RequeryCollaborators, RequeryListener, SendPolicy,
        StaticConnectionProbe, SupervisorConfig,
    };
    use crate::download::types::{FileHash, QueryType, SearchQuery};
    use std::sync::Arc;

    struct QueryListener;

    impl RequeryListener for QueryListener {
        fn build_query(&self) -> Option<SearchQuery> {
            Some(SearchQuery {
                file_hash: FileHash([3u8; 16]),
                file_name: "b.bin".to_string(),
                file_size: 20,
            })
        }
        fn on_lookup_started(&self, _kind: QueryType, _expected_wait: Duration) {}
        fn on_lookup_pending(&self, _kind: QueryType, _retry_in: Duration) {}
        fn on_lookup_finished(&self, _kind: QueryType) {}
    }

    struct NoKad;

    impl DhtLookupFactory for NoKad {
        fn start_lookup(
            &self,
            _file: FileHash,
            _completion: LookupCompletion,
        ) -> Option<Box<dyn CancelableLookup>> {
            None
        }
    }

    struct IdleLookup;

    impl CancelableLookup for IdleLookup {
        fn shutdown(self: Box<Self>) {}
    }

    struct KeepRunningKad;

    impl DhtLookupFactory for KeepRunningKad {
        fn start_lookup(
            &self,
            _file: FileHash,
            _completion: LookupCompletion,
        ) -> Option<Box<dyn CancelableLookup>> {
            Some(Box::new(IdleLookup))
        }
    }

    fn supervisor(
        dht: Arc<dyn DhtLookupFactory>,
        counts: &[u64],
    ) -> (RequerySupervisor, mpsc::Receiver<SearchQuery>) {
        let (dispatcher, rx) = ChannelQueryDispatcher::channel(4);
        let sup = RequerySupervisor::new(
            FileHash([3u8; 16]),
            SupervisorConfig {
                policy: SendPolicy::AfterActivate,
                ..SupervisorConfig::default()
            },
            RequeryCollaborators {
                listener: Arc::new(QueryListener),
                dispatcher: Arc::new(dispatcher),
                probe: Arc::new(StaticConnectionProbe::with_counts(counts.iter().copied())),
                dht,
            },
        );
        (sup, rx)
    }

    fn cfg() -> RequeryServiceConfig {
        RequeryServiceConfig {
            poll_every: Duration::from_millis(10),
            max_dht_queries: 1,
        }
    }

    #[test]
    fn tick_prefers_kad_lookup_under_cap() {
        let (sup, _rx) = supervisor(Arc::new(KeepRunningKad), &[50, 50]);
        let now = Instant::now();

        let first = requery_tick(&sup, &cfg(), now).expect("tick");
        assert!(matches!(
            first,
            Some(SendOutcome::Started {
                kind: QueryType::Dht,
                ..
            })
        ));
        // Lookup still running and cooldown active.
        assert_eq!(requery_tick(&sup, &cfg(), now).expect("tick"), None);
    }

    #[test]
    fn tick_falls_back_to_broadcast_when_kad_unavailable() {
        let (sup, mut rx) = supervisor(Arc::new(NoKad), &[50, 50]);
        sup.activate();

        let outcome = requery_tick(&sup, &cfg(), Instant::now()).expect("tick");
        assert!(matches!(
            outcome,
            Some(SendOutcome::Started {
                kind: QueryType::Broadcast,
                ..
            })
        ));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn tick_reports_pending_on_unstable_connections() {
        let (sup, _rx) = supervisor(Arc::new(NoKad), &[]);
        sup.activate();
        let outcome = requery_tick(&sup, &cfg(), Instant::now()).expect("tick");
        assert!(matches!(outcome, Some(SendOutcome::Pending { .. })));
    }

    #[tokio::test]
    async fn service_sends_broadcast_after_activate_and_shuts_down() {
        let (sup, mut queries) = supervisor(Arc::new(NoKad), &[50, 50]);
        let (handle, mut status_rx, join) = start_service(cfg(), sup);

        assert!(status_rx.borrow().running);
        handle.activate().await.expect("activate");

        let query = tokio::time::timeout(Duration::from_secs(5), queries.recv())
            .await
            .expect("query in time")
            .expect("query");
        assert_eq!(query.file_name, "b.bin");

        let snap = handle.snapshot().await.expect("snapshot");
        assert_eq!(snap.broadcast, BroadcastState::Sent);
        assert_eq!(snap.last_query_type, Some(QueryType::Broadcast));
        assert!(snap.waiting_for_results);
        assert_eq!(
            handle.send_now().await.expect("send now"),
            SendOutcome::NotAllowed
        );

        handle.shutdown().await.expect("shutdown");
        status_rx.changed().await.expect("status changed");
        assert!(!status_rx.borrow().running);
        join.await.expect("join").expect("service");
        assert!(handle.snapshot().await.is_err());
    }

    #[tokio::test]
    async fn gated_polls_are_not_attempts_and_do_not_republish() {
        let (dispatcher, _queries) = ChannelQueryDispatcher::channel(4);
        let sup = RequerySupervisor::new(
            FileHash([3u8; 16]),
            SupervisorConfig {
                policy: SendPolicy::Disabled,
                ..SupervisorConfig::default()
            },
            RequeryCollaborators {
                listener: Arc::new(QueryListener),
                dispatcher: Arc::new(dispatcher),
                probe: Arc::new(StaticConnectionProbe::with_counts([50, 50])),
                dht: Arc::new(NoKad),
            },
        );
        let poll = RequeryServiceConfig {
            poll_every: Duration::from_millis(5),
            max_dht_queries: 1,
        };
        let (handle, mut status_rx, join) = start_service(poll, sup);

        // Roughly twenty polls, each ending in NotAllowed.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
        let mut publishes = 0;
        while let Ok(Ok(())) = tokio::time::timeout_at(deadline, status_rx.changed()).await {
            publishes += 1;
        }
        assert!(publishes <= 1, "published {publishes} times");
        {
            let status = status_rx.borrow();
            assert_eq!(status.attempts, 0);
            assert_eq!(status.last_outcome, Some(SendOutcome::NotAllowed));
        }

        handle.shutdown().await.expect("shutdown");
        join.await.expect("join").expect("service");
    }

    #[test]
    fn countdown_alone_is_not_a_status_change() {
        let (sup, _rx) = supervisor(Arc::new(NoKad), &[50, 50]);
        let now = Instant::now();
        let status = RequeryServiceStatus {
            running: true,
            attempts: 1,
            last_outcome: None,
            supervisor: sup.snapshot_at(now),
            started_at: now,
        };
        let mut later = status.clone();
        later.supervisor.time_left_ms -= 1000;
        assert!(!status_changed(&status, &later));
        later.attempts = 2;
        assert!(status_changed(&status, &later));
    }

    #[tokio::test]
    async fn service_cleans_up_kad_lookup_on_shutdown() {
        let (sup, _queries) = supervisor(Arc::new(KeepRunningKad), &[]);
        let watcher = sup.clone();
        let (handle, _status_rx, join) = start_service(cfg(), sup);

        let outcome = handle.send_dht_now().await.expect("send dht");
        assert!(matches!(
            outcome,
            SendOutcome::Started { .. } | SendOutcome::InFlight
        ));
        assert!(watcher.has_dht_lookup());

        handle.shutdown().await.expect("shutdown");
        join.await.expect("join").expect("service");
        assert!(!watcher.has_dht_lookup());
        assert!(watcher.is_closed());
    }
}
