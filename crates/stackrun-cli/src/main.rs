//! stackrun CLI - build and run cluster create/delete task trees against an
//! in-memory simulated cloud.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stackrun_engine::sim::Behavior;
use stackrun_engine::{
    Clients, ClusterCreation, ClusterTeardown, EngineConfig, NodegroupSpec, ServiceAccountSpec,
    SimulatedCloud, StackManager, TaskContext, TreeReport,
};

const PLACEHOLDER_TEMPLATE: &str = "{\"Resources\": {}}";

/// stackrun - dependency-aware stack orchestration
#[derive(Parser)]
#[command(name = "stackrun")]
#[command(about = "Run cluster create/delete task trees against a simulated cloud", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a cluster with its nodegroups and service accounts
    Create(ClusterArgs),

    /// Create a cluster, then tear it down
    Delete {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Keep going past failures and dependency timeouts
        #[arg(long)]
        force: bool,

        /// Return once the cluster stack deletion was requested
        #[arg(long)]
        no_wait: bool,
    },
}

#[derive(Args)]
struct ClusterArgs {
    /// Cluster name
    #[arg(long)]
    cluster: String,

    /// Unmanaged nodegroup (repeatable)
    #[arg(long = "nodegroup")]
    nodegroups: Vec<String>,

    /// Managed nodegroup (repeatable)
    #[arg(long = "managed-nodegroup")]
    managed_nodegroups: Vec<String>,

    /// IAM service account as namespace/name (repeatable)
    #[arg(long = "service-account")]
    service_accounts: Vec<String>,

    /// Stack or nodegroup whose operations fail (repeatable)
    #[arg(long = "fail")]
    fail: Vec<String>,

    /// Stack or nodegroup whose operations take ten times longer (repeatable)
    #[arg(long = "slow")]
    slow: Vec<String>,

    /// Simulated latency of every operation, in milliseconds
    #[arg(long, default_value_t = 500)]
    latency_ms: u64,

    /// Engine config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stackrun=info,stackrun_engine=info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling unstarted tasks");
            on_signal.cancel();
        }
    });

    let report = match cli.command {
        Commands::Create(args) => {
            let (cloud, manager) = setup(&args)?;
            for name in &args.fail {
                cloud.behave(name.clone(), Behavior::failing_create());
            }
            let report = create(&args, &cloud, &manager, &cancel, true).await?;
            print_report(&report, args.json)?;
            report
        }
        Commands::Delete {
            cluster: args,
            force,
            no_wait,
        } => {
            let (cloud, manager) = setup(&args)?;
            let created = create(&args, &cloud, &manager, &cancel, false).await?;
            if !created.is_success() {
                print_report(&created, args.json)?;
                created.into_result()?;
            }
            for name in &args.fail {
                cloud.behave(name.clone(), Behavior::failing_delete());
            }

            let plan = manager
                .new_tasks_to_delete_cluster_with_nodegroups(ClusterTeardown {
                    oidc: Some(cloud.clone()),
                    cluster_client: Some(cloud.clone()),
                    force,
                    wait: !no_wait,
                    ..Default::default()
                })
                .await?;
            println!("{plan}");
            let report = plan.run(cancel.clone()).await;
            print_report(&report, args.json)?;
            report
        }
    };

    report.into_result()?;
    Ok(())
}

fn setup(
    args: &ClusterArgs,
) -> Result<(Arc<SimulatedCloud>, StackManager), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig {
            poll_initial_interval_ms: 200,
            poll_max_interval_ms: 2_000,
            ..Default::default()
        },
    };

    let latency = Duration::from_millis(args.latency_ms);
    let cloud = Arc::new(
        SimulatedCloud::new(args.cluster.clone())
            .with_latency(latency)
            .with_oidc_provider(),
    );
    for name in &args.slow {
        cloud.behave(name.clone(), Behavior::slow(latency * 10));
    }

    let manager = StackManager::new(
        args.cluster.clone(),
        config,
        Clients::from_cloud(cloud.clone()),
    )?;
    info!(cluster = %args.cluster, prefix = %manager.config().stack_prefix, "Using simulated cloud");
    Ok((cloud, manager))
}

async fn create(
    args: &ClusterArgs,
    cloud: &Arc<SimulatedCloud>,
    manager: &StackManager,
    cancel: &CancellationToken,
    print_tree: bool,
) -> Result<TreeReport, Box<dyn std::error::Error>> {
    let accounts = args
        .service_accounts
        .iter()
        .map(|qualified| match qualified.split_once('/') {
            Some((ns, name)) => Ok(ServiceAccountSpec::new(ns, name, PLACEHOLDER_TEMPLATE)),
            None => Err(format!("service account {qualified:?} must be namespace/name")),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let post = if accounts.is_empty() {
        None
    } else {
        Some(manager.new_tasks_to_create_iam_service_accounts(
            &accounts,
            cloud.clone(),
            cloud.clone(),
        )?)
    };

    let managed_tags = BTreeMap::from([("stackrun.io/cluster".to_string(), args.cluster.clone())]);
    let request = ClusterCreation {
        nodegroups: args
            .nodegroups
            .iter()
            .map(|ng| NodegroupSpec::new(ng, PLACEHOLDER_TEMPLATE))
            .collect(),
        managed_nodegroups: args
            .managed_nodegroups
            .iter()
            .map(|ng| {
                NodegroupSpec::new(ng, PLACEHOLDER_TEMPLATE).with_asg_tags(managed_tags.clone())
            })
            .collect(),
        post_cluster_tasks: post,
        ..ClusterCreation::new(PLACEHOLDER_TEMPLATE)
    };

    let tree = Arc::new(manager.new_tasks_to_create_cluster(request)?);
    if print_tree {
        println!("{tree}");
    }
    Ok(tree.run(TaskContext::new(cancel.clone())).await)
}

fn print_report(report: &TreeReport, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
        return Ok(());
    }

    println!("{}", report.summary());
    println!("{:<10}  {:>8}  {}", "STATUS", "ELAPSED", "TASK");
    println!("{}", "-".repeat(80));
    for outcome in &report.outcomes {
        println!(
            "{:<10}  {:>7.1}s  {}",
            outcome.status.as_str(),
            outcome.elapsed.as_secs_f64(),
            outcome.task
        );
        if let Some(err) = outcome.error() {
            println!("{:<10}  {:>8}  {err}", "", "");
        }
    }
    Ok(())
}
