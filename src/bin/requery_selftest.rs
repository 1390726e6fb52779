use rust_mule_requery::config::Config;
use rust_mule_requery::config_io::load_or_create_config;
use rust_mule_requery::download::requery::{
    CancelableLookup, ChannelQueryDispatcher, DhtLookupFactory, LookupCompletion,
    RequeryCollaborators, RequeryListener, RequerySupervisor, SendOutcome, SendPolicy,
    StaticConnectionProbe, spawn_task_lookup,
};
use rust_mule_requery::download::{FileHash, QueryType, RequeryError, SearchQuery};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{Duration, timeout};

#[derive(Debug)]
enum SelftestError {
    ConfigIo(rust_mule_requery::config_io::ConfigIoError),
    Requery(RequeryError),
    Unexpected(&'static str, SendOutcome),
    TimedOut(&'static str),
}

impl std::fmt::Display for SelftestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigIo(source) => write!(f, "Unable to load Config: {source}"),
            Self::Requery(source) => write!(f, "{source}"),
            Self::Unexpected(step, outcome) => write!(f, "unexpected outcome at {step}: {outcome:?}"),
            Self::TimedOut(what) => write!(f, "timed out waiting for {what}"),
        }
    }
}

impl std::error::Error for SelftestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigIo(source) => Some(source),
            Self::Requery(source) => Some(source),
            Self::Unexpected(..) | Self::TimedOut(_) => None,
        }
    }
}

impl From<rust_mule_requery::config_io::ConfigIoError> for SelftestError {
    fn from(value: rust_mule_requery::config_io::ConfigIoError) -> Self {
        Self::ConfigIo(value)
    }
}

impl From<RequeryError> for SelftestError {
    fn from(value: RequeryError) -> Self {
        Self::Requery(value)
    }
}

const SELFTEST_FILE: FileHash = FileHash([
    0x31, 0xd6, 0xcf, 0xe0, 0xd1, 0x6a, 0xe9, 0x31, 0xb7, 0x3c, 0x59, 0xd7, 0xe0, 0xc0, 0x89, 0xc0,
]);

struct LoggingListener {
    dht_finished: Arc<Notify>,
}

impl RequeryListener for LoggingListener {
    fn build_query(&self) -> Option<SearchQuery> {
        Some(SearchQuery {
            file_hash: SELFTEST_FILE,
            file_name: "selftest.bin".to_string(),
            file_size: 1 << 20,
        })
    }

    fn on_lookup_started(&self, kind: QueryType, expected_wait: Duration) {
        tracing::info!(kind = kind.as_str(), ?expected_wait, "lookup started");
    }

    fn on_lookup_pending(&self, kind: QueryType, retry_in: Duration) {
        tracing::info!(kind = kind.as_str(), ?retry_in, "lookup pending");
    }

    fn on_lookup_finished(&self, kind: QueryType) {
        tracing::info!(kind = kind.as_str(), "lookup finished");
        if kind == QueryType::Dht {
            self.dht_finished.notify_one();
        }
    }
}

/// Pretends to walk Kad for a moment and then reports a hit.
struct SleepyKad;

impl DhtLookupFactory for SleepyKad {
    fn start_lookup(
        &self,
        file: FileHash,
        completion: LookupCompletion,
    ) -> Option<Box<dyn CancelableLookup>> {
        tracing::info!(file = %file, generation = completion.generation(), "starting fake kad lookup");
        let lookup = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            true
        };
        Some(Box::new(spawn_task_lookup(lookup, completion)))
    }
}

fn expect_started(step: &'static str, outcome: SendOutcome) -> Result<(), SelftestError> {
    match outcome {
        SendOutcome::Started { .. } => Ok(()),
        other => Err(SelftestError::Unexpected(step, other)),
    }
}

#[tokio::main]
async fn main() -> Result<(), SelftestError> {
    let cfg: Config = load_or_create_config("config.toml").await?;
    rust_mule_requery::config::init_tracing(&cfg);

    let dht_finished = Arc::new(Notify::new());
    let (dispatcher, mut sent) = ChannelQueryDispatcher::channel(4);
    let probe = Arc::new(StaticConnectionProbe::new());
    let supervisor = RequerySupervisor::new(
        SELFTEST_FILE,
        cfg.requery.supervisor_config(SendPolicy::AfterActivate),
        RequeryCollaborators {
            listener: Arc::new(LoggingListener {
                dht_finished: dht_finished.clone(),
            }),
            dispatcher: Arc::new(dispatcher),
            probe: probe.clone(),
            dht: Arc::new(SleepyKad),
        },
    );

    let outcome = supervisor.send_query()?;
    tracing::info!(?outcome, "send before activate");

    supervisor.activate();
    let outcome = supervisor.send_query()?;
    tracing::info!(?outcome, "send with no connections");

    let connections = u64::from(cfg.requery.min_stable_connections.max(1));
    let per_connection = cfg
        .requery
        .min_messages_per_connection
        .max(cfg.requery.min_total_messages.div_ceil(connections));
    probe.set_counts(std::iter::repeat_n(per_connection, connections as usize));
    let outcome = supervisor.send_query()?;
    expect_started("broadcast", outcome)?;
    if let Some(query) = sent.recv().await {
        tracing::info!(file_name = %query.file_name, "dispatcher received broadcast requery");
    }

    let outcome = supervisor.send_dht_query();
    expect_started("dht lookup", outcome)?;
    timeout(Duration::from_secs(5), dht_finished.notified())
        .await
        .map_err(|_| SelftestError::TimedOut("dht lookup"))?;

    match serde_json::to_string_pretty(&supervisor.snapshot()) {
        Ok(json) => println!("{json}"),
        Err(err) => tracing::warn!(error = %err, "failed to render snapshot"),
    }

    supervisor.clean_up();
    supervisor.clean_up();
    tracing::info!("requery selftest finished");
    Ok(())
}
