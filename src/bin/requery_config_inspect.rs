use anyhow::Context;
use rust_mule_requery::config::Config;
use rust_mule_requery::download::{RequeryServiceConfig, SendPolicy};

fn usage() -> &'static str {
    "Usage: cargo run --bin requery_config_inspect -- <path/to/config.toml>"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!(usage()))?;
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {path}"))?;
    let cfg: Config = toml::from_str(&content).with_context(|| format!("invalid TOML in {path}"))?;
    cfg.requery
        .validate()
        .map_err(|reason| anyhow::anyhow!("{path}: {reason}"))?;

    let policy = SendPolicy::build_default();
    let sup = cfg.requery.supervisor_config(policy);
    let svc = RequeryServiceConfig::from_requery_config(&cfg.requery);

    println!("send policy: {policy:?}");
    println!("cooldown: {:?}", sup.cooldown);
    println!("connect retry delay: {:?}", sup.connect_retry_delay);
    println!("kad lookup timeout: {:?}", sup.dht_lookup_timeout);
    println!(
        "stable when >= {} connections with >= {} messages and >= {} messages total",
        sup.thresholds.min_stable_connections,
        sup.thresholds.min_messages_per_connection,
        sup.thresholds.min_total_messages,
    );
    println!("poll every: {:?}", svc.poll_every);
    println!("kad lookups before broadcast: {}", svc.max_dht_queries);

    Ok(())
}
