mod workers;

use std::process;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use sharder::{
    FleetEvent, IpcAddress, ManagerConfig, ServiceOptions, ShardCount, ShardManager, WorkerEnv,
    WorkerRoleEnv, init_tracing, run_cluster, run_service,
};

use workers::{CounterService, DemoCluster};

struct Args {
    shards: ShardCount,
    clusters: Option<u32>,
    address: Option<IpcAddress>,
    token: Option<String>,
    services: Vec<String>,
}

fn usage() {
    eprintln!("Usage: sharder-demo [--shards <n|auto>] [--clusters <n>] [--address <addr>] [--service <name>]...");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --shards <n|auto>   Shard total [default: 4]");
    eprintln!("  --clusters <n>      Cluster processes [default: available parallelism]");
    eprintln!("  --address <addr>    IPC socket path, port, or host:port [default: /tmp/sharder.sock]");
    eprintln!("  --token <token>     Bot token, required for --shards auto (or SHARDER_TOKEN)");
    eprintln!("  --service <name>    Start a counter service; may be repeated");
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        shards: ShardCount::Fixed(4),
        clusters: None,
        address: None,
        token: std::env::var("SHARDER_TOKEN").ok(),
        services: Vec::new(),
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match flag {
            "--shards" => parsed.shards = ShardCount::from_str(&value()?).map_err(|e| e.to_string())?,
            "--clusters" => {
                let n = value()?;
                parsed.clusters = Some(n.parse().map_err(|_| format!("invalid cluster count: {n}"))?);
            }
            "--address" => parsed.address = Some(IpcAddress::from_str(&value()?).map_err(|e| e.to_string())?),
            "--token" => parsed.token = Some(value()?),
            "--service" => parsed.services.push(value()?),
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    if let Some(env) = WorkerEnv::from_env()? {
        let exit = match env.role.clone() {
            WorkerRoleEnv::Cluster { shards, .. } => run_cluster(DemoCluster::new(shards), env).await?,
            WorkerRoleEnv::Service { .. } => run_service(CounterService::default(), env).await?,
        };
        exit.exit_process();
    }

    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };
    run_master(args).await
}

async fn run_master(args: Args) -> anyhow::Result<()> {
    let mut config = ManagerConfig::for_current_exe()
        .context("failed to locate own executable")?
        .with_shard_count(args.shards)
        .with_kill_timeout(Some(Duration::from_secs(10)))
        .with_stats_interval(Duration::from_secs(15));
    if let Some(n) = args.clusters {
        config = config.with_cluster_count(n);
    }
    if let Some(address) = args.address {
        config = config.with_address(address);
    }
    if let Some(token) = args.token {
        config = config.with_token(token);
    }

    let manager = ShardManager::bind(config).await?;

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                FleetEvent::StatsUpdated(snapshot) => tracing::info!(
                    clusters = snapshot.clusters.len(),
                    services = snapshot.services.len(),
                    "Stats updated"
                ),
                other => tracing::debug!(event = ?other, "Fleet event"),
            }
        }
    });

    manager.spawn().await?;
    for name in &args.services {
        manager
            .register_service(name.as_str(), std::env::current_dir()?, ServiceOptions::default())
            .await
            .with_context(|| format!("service {name} failed to start"))?;
    }
    tracing::info!(summary = %manager.fleet().summary(), "Fleet is up");

    tokio::signal::ctrl_c().await?;
    manager.shutdown(manager.config().kill_timeout).await;
    Ok(())
}
