//! cbkv - key-value command-line client for Couchbase clusters

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use couchbase_core::config::{CliArgs, ClusterOptions, Command};
use couchbase_core::{Cluster, ServiceType};

fn setup_logging(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    // RUST_LOG, when set, overrides -q/-v
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

async fn run() -> Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.verbose, args.quiet)?;

    let options = ClusterOptions::from_cli(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    info!("Connecting to {}", options.servers.join(", "));

    let cluster = Cluster::connect(options).await?;
    let result = execute(&cluster, &args).await;
    cluster.close().await;
    result
}

async fn execute(cluster: &Cluster, args: &CliArgs) -> Result<()> {
    let bucket = cluster
        .bucket(&args.bucket)
        .await
        .with_context(|| format!("Failed to open bucket '{}'", args.bucket))?;

    match &args.command {
        Command::Get { key, replica } => {
            let collection = bucket.scope(&args.scope)?.collection(&args.collection)?;
            let response = if *replica {
                collection.get_any_replica(key).await?
            } else {
                collection.get(key).await?
            };
            println!("{}", String::from_utf8_lossy(&response.value));
            info!("cas={} format={:?}", response.cas, response.format());
        }
        Command::Upsert { key, value, expiry } => {
            let collection = bucket.scope(&args.scope)?.collection(&args.collection)?;
            let response = collection
                .upsert(key, value.clone().into_bytes(), *expiry)
                .await?;
            println!("cas={}", response.cas);
        }
        Command::Remove { key } => {
            let collection = bucket.scope(&args.scope)?.collection(&args.collection)?;
            collection.remove(key, 0).await?;
            println!("removed {}", key);
        }
        Command::Locate { key } => {
            let table = bucket.routing()?;
            let target = table.map_key(key.as_bytes());
            println!("rev:      {}", table.revision());
            if let Some(vbucket) = target.vbucket_id {
                println!("vbucket:  {}", vbucket);
            }
            match &target.primary {
                Some(primary) => println!("active:   {}", primary),
                None => println!("active:   <unassigned>"),
            }
            for (i, replica) in target.replicas.iter().enumerate() {
                println!("replica{}: {}", i, replica);
            }
        }
        Command::Services => {
            for service in ServiceType::ALL {
                let uris = match service {
                    ServiceType::Views => bucket.view_uris().unwrap_or_default(),
                    other => cluster.service_uris(other).await?,
                };
                for uri in uris {
                    println!("{:<10} {}", service.name(), uri);
                }
            }
        }
        Command::Watch => {
            let mut updates = cluster.config_updates();
            println!("{} rev {}", bucket.name(), bucket.revision().unwrap_or(0));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    received = updates.recv() => match received {
                        Ok(config) if config.name() == bucket.name() => {
                            println!(
                                "{} rev {} ({} nodes)",
                                config.name(),
                                config.rev(),
                                config.kv_endpoints(cluster.options().use_ssl).len()
                            );
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => warn!("Missed {} config updates", n),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Error: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
