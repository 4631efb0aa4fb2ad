use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use poolkeeper_core::{BoundedPoolFactory, LruPoolManager, PoolkeeperConfig, Value};
use poolkeeper_pg::PgConnectionFactory;
use serde_json::{Map, json};

pub async fn probe(
    path: &Path,
    databases: &[String],
    persistent: &[String],
    connect_timeout: u64,
) -> anyhow::Result<()> {
    let config = PoolkeeperConfig::from_file(path)?;
    let targets = probe_targets(&config, databases, persistent);

    let connector = PgConnectionFactory::new(Duration::from_secs(connect_timeout));
    let factory = Arc::new(BoundedPoolFactory::new(Arc::new(connector)));
    let args = config.connection.to_args();
    let mut manager = LruPoolManager::new(args.clone(), config.manager, factory)?;
    if let Some(auth) = &config.connection.auth {
        let provider = poolkeeper_pg::token_provider(auth, &args)?;
        tracing::info!(auth = ?auth, "using managed authentication tokens");
        manager = manager.with_token_provider(Arc::new(provider));
    }

    let mut failures = Map::new();
    for (dbname, persistent) in &targets {
        if let Err(e) = probe_one(&manager, dbname, *persistent).await {
            tracing::warn!(database = %dbname, error = %e, "probe failed");
            failures.insert(dbname.clone(), json!(e.to_string()));
        }
    }

    let mut pools = Map::new();
    for dbname in manager.dbnames() {
        if let Some(stats) = manager.get_pool_stats(&dbname) {
            pools.insert(dbname, serde_json::to_value(stats)?);
        }
    }
    manager.close_all();

    let report = json!({ "pools": pools, "failures": &failures });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !failures.is_empty() {
        anyhow::bail!("{} of {} probes failed", failures.len(), targets.len());
    }
    Ok(())
}

/// Databases to probe in order, each with its persistence flag.
fn probe_targets(
    config: &PoolkeeperConfig,
    databases: &[String],
    persistent: &[String],
) -> Vec<(String, bool)> {
    let mut names: Vec<String> = databases.to_vec();
    for name in persistent {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    if names.is_empty() {
        names.push(config.connection.dbname.clone());
    }
    names
        .into_iter()
        .map(|name| {
            let keep = persistent.contains(&name);
            (name, keep)
        })
        .collect()
}

async fn probe_one(manager: &LruPoolManager, dbname: &str, persistent: bool) -> anyhow::Result<()> {
    let mut conn = manager.get_connection(dbname, persistent).await?;
    let rows = conn.query("SELECT 1").await?;
    match rows.first().and_then(|row| row.first()) {
        Some(Value::Int(1)) => {
            tracing::info!(database = %dbname, persistent = persistent, "probe ok");
            Ok(())
        }
        other => anyhow::bail!("unexpected SELECT 1 result: {other:?}"),
    }
}
