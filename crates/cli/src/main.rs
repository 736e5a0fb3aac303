use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use keel_apply::{ApplyError, ApplyOptions, EntryState};
use keel_core::{ReleaseIdentity, Resource};
use keel_kubehub::{KubeCluster, SecretInventoryStore};
use keel_persist::{default_db_path, InventoryStore, SqliteStore, DEFAULT_HISTORY};
use keel_provider::{kubernetes, Provider};
use keel_render::{default_concurrency, RenderOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod input;

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Render components into Kubernetes resources, apply and prune them")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Where release inventories are kept
    #[arg(long, value_enum, global = true, env = "KEEL_INVENTORY_BACKEND", default_value_t = Backend::Sqlite)]
    backend: Backend,

    /// SQLite inventory database (default: ~/.keel/inventory.db)
    #[arg(long = "db", global = true, env = "KEEL_DB_PATH")]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend { Sqlite, Secret }

#[derive(Args, Debug, Clone)]
struct ReleaseArgs {
    /// Release name
    #[arg(short = 'r', long = "release")]
    release: String,

    /// Release namespace
    #[arg(short = 'n', long = "namespace", default_value = "default")]
    namespace: String,
}

#[derive(Args, Debug, Clone)]
struct RenderArgs {
    /// Components document (YAML or JSON); `-` reads stdin
    #[arg(short = 'f', long = "file")]
    file: String,

    #[command(flatten)]
    release: ReleaseArgs,

    /// Module name used to derive the release identity (default: from the document, else the release name)
    #[arg(long)]
    module: Option<String>,

    /// Module version handed to transformers
    #[arg(long = "module-version")]
    module_version: Option<String>,

    /// Reject unpinned images and other loose input
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,

    /// Maximum concurrently running transformers
    #[arg(long, env = "KEEL_CONCURRENCY")]
    concurrency: Option<usize>,
}

#[derive(Args, Debug, Clone)]
struct PruneArgs {
    /// Also delete Namespace resources the release no longer renders
    #[arg(long = "prune-namespaces", action = ArgAction::SetTrue)]
    prune_namespaces: bool,

    /// Change records kept per release
    #[arg(long, env = "KEEL_HISTORY", default_value_t = DEFAULT_HISTORY)]
    history: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render components and print the resources
    Build {
        #[command(flatten)]
        render: RenderArgs,
    },
    /// Render and validate; with --server, dry-run every resource against the cluster
    Vet {
        #[command(flatten)]
        render: RenderArgs,
        #[arg(long, action = ArgAction::SetTrue)]
        server: bool,
    },
    /// Apply a release and prune what it no longer renders
    Apply {
        #[command(flatten)]
        render: RenderArgs,
        #[command(flatten)]
        prune: PruneArgs,
        /// Allow an empty render to delete everything the release owns
        #[arg(long = "force-empty", action = ArgAction::SetTrue)]
        force_empty: bool,
        /// Server-side dry run; nothing is pruned or recorded
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Show what an apply would change
    Diff {
        #[command(flatten)]
        render: RenderArgs,
        #[arg(long = "force-empty", action = ArgAction::SetTrue)]
        force_empty: bool,
    },
    /// Delete every resource a release owns, then its inventory
    Delete {
        #[command(flatten)]
        release: ReleaseArgs,
        #[command(flatten)]
        prune: PruneArgs,
    },
    /// Show the live state of a release's resources
    Status {
        #[command(flatten)]
        release: ReleaseArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel on Ctrl-C. Work in flight finishes; nothing new starts.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; finishing in-flight work");
            trigger.cancel();
        }
    });
    token
}

fn release_key(r: &ReleaseArgs) -> String {
    format!("{}/{}", r.namespace, r.release)
}

struct Loaded {
    components: Vec<keel_core::Component>,
    opts: RenderOptions,
}

fn load_render(args: &RenderArgs) -> Result<Loaded> {
    let doc = input::load(&args.file)?;
    let module = args.module.clone().or(doc.module).unwrap_or_else(|| args.release.release.clone());
    let release = ReleaseIdentity::derive(&args.release.release, &args.release.namespace, &module);
    let mut opts = RenderOptions::new(release);
    if let Some(v) = args.module_version.clone().or(doc.version) {
        opts.version = v;
    }
    opts.strict = args.strict;
    opts.max_concurrency = args.concurrency.unwrap_or_else(default_concurrency).max(1);
    Ok(Loaded { components: doc.components, opts })
}

fn provider() -> Result<Provider> {
    kubernetes::provider().context("registering built-in kubernetes provider")
}

async fn open_store(cli: &Cli, cluster: Option<&KubeCluster>) -> Result<Box<dyn InventoryStore>> {
    match cli.backend {
        Backend::Sqlite => {
            let path = cli.db_path.clone().unwrap_or_else(default_db_path);
            Ok(Box::new(SqliteStore::open(&path)?))
        }
        Backend::Secret => {
            let client = match cluster {
                Some(c) => c.client(),
                None => keel_kubehub::get_kube_client().await?,
            };
            Ok(Box::new(SecretInventoryStore::new(client)))
        }
    }
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_resources(output: Output, resources: &[Resource]) -> Result<()> {
    match output {
        Output::Human => print!("{}", keel_apply::to_yaml_stream(resources)?),
        Output::Json => print_json(&resources.iter().map(|r| &r.data).collect::<Vec<_>>())?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            // EX_TEMPFAIL: a concurrent writer won; rerunning is safe.
            match e.downcast_ref::<ApplyError>() {
                Some(ae) if ae.is_retryable() => ExitCode::from(75),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cancel = cancel_on_ctrl_c();
    match &cli.command {
        Commands::Build { render } => {
            let l = load_render(render)?;
            let rendered = keel_render::render(&l.components, &provider()?, &l.opts, &cancel).await?;
            info!(resources = rendered.resources.len(), "build complete");
            print_resources(cli.output, &rendered.resources)?;
        }
        Commands::Vet { render, server } => {
            let l = load_render(render)?;
            let cluster = if *server { Some(KubeCluster::try_default().await?) } else { None };
            let applier = cluster.as_ref().map(|c| c as &dyn keel_apply::Applier);
            let report = keel_apply::vet(&l.components, &provider()?, &l.opts, applier, &cancel).await?;
            match cli.output {
                Output::Human => {
                    println!(
                        "{} component(s), {} match(es), {} resource(s)",
                        report.components, report.matches, report.resources
                    );
                    for (r, cause) in &report.rejected {
                        println!("rejected {}: {}", r, cause);
                    }
                }
                Output::Json => print_json(&report)?,
            }
            if !report.ok() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Apply { render, prune, force_empty, dry_run } => {
            let l = load_render(render)?;
            let cluster = KubeCluster::try_default().await?;
            let store = open_store(&cli, Some(&cluster)).await?;
            let opts = ApplyOptions {
                force_empty: *force_empty,
                prune_namespaces: prune.prune_namespaces,
                history_limit: prune.history.max(1),
                dry_run: *dry_run,
            };
            let c = keel_apply::Cluster { applier: &cluster, lookup: &cluster, deleter: &cluster };
            let report = keel_apply::apply(&l.components, &provider()?, &l.opts, &opts, c, store.as_ref(), &cancel).await?;
            match cli.output {
                Output::Human => {
                    let verb = if *dry_run { "validated" } else { "applied" };
                    println!("{} {} resource(s)", verb, report.applied.len());
                    if let Some(p) = &report.prune {
                        for e in &p.deleted {
                            println!("pruned {}", e);
                        }
                        for e in &p.skipped {
                            println!("kept {} (namespace)", e);
                        }
                    } else if !report.stale.is_empty() {
                        for e in &report.stale {
                            println!("would prune {}", e);
                        }
                    }
                    if let Some(v) = &report.inventory_version {
                        println!("inventory {} at version {}", l.opts.release.key(), v);
                    }
                }
                Output::Json => print_json(&serde_json::json!({
                    "phases": report.phases,
                    "applied": report.applied,
                    "stale": report.stale,
                    "pruned": report.prune.as_ref().map(|p| &p.deleted),
                    "inventoryVersion": report.inventory_version,
                    "firstInstall": report.first_install,
                }))?,
            }
        }
        Commands::Diff { render, force_empty } => {
            let l = load_render(render)?;
            let cluster = KubeCluster::try_default().await?;
            let store = open_store(&cli, Some(&cluster)).await?;
            let opts = ApplyOptions { force_empty: *force_empty, ..Default::default() };
            let report =
                keel_apply::diff(&l.components, &provider()?, &l.opts, &opts, &cluster, store.as_ref(), &cancel).await?;
            match cli.output {
                Output::Human => {
                    for d in &report.resources {
                        if !d.exists {
                            println!("+ {}", d.resource);
                        } else if !d.summary.is_empty() {
                            println!(
                                "~ {} (+{} ~{} -{})",
                                d.resource, d.summary.adds, d.summary.updates, d.summary.removes
                            );
                        }
                    }
                    for e in &report.prune {
                        println!("- {}", e);
                    }
                    if !report.has_changes() {
                        println!("no changes");
                    }
                }
                Output::Json => print_json(&report)?,
            }
            if report.has_changes() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Delete { release, prune } => {
            let cluster = KubeCluster::try_default().await?;
            let store = open_store(&cli, Some(&cluster)).await?;
            let opts = ApplyOptions {
                prune_namespaces: prune.prune_namespaces,
                history_limit: prune.history.max(1),
                ..Default::default()
            };
            let report = keel_apply::delete(&release_key(release), &opts, &cluster, store.as_ref(), &cancel).await?;
            match cli.output {
                Output::Human => {
                    for e in &report.deleted {
                        println!("deleted {}", e);
                    }
                    for e in &report.missing {
                        println!("already gone {}", e);
                    }
                    for e in &report.skipped {
                        println!("kept {} (namespace; delete again with --prune-namespaces)", e);
                    }
                }
                Output::Json => print_json(&serde_json::json!({
                    "deleted": report.deleted,
                    "missing": report.missing,
                    "skipped": report.skipped,
                }))?,
            }
        }
        Commands::Status { release } => {
            let cluster = KubeCluster::try_default().await?;
            let store = open_store(&cli, Some(&cluster)).await?;
            let report = keel_apply::status(&release_key(release), &cluster, store.as_ref()).await?;
            match cli.output {
                Output::Human => {
                    println!("release {} (inventory version {})", report.release, report.version);
                    println!("{:<12} {}", "STATE", "RESOURCE");
                    for e in &report.entries {
                        let state = match e.state {
                            EntryState::Ready => "ready",
                            EntryState::NotReady => "not-ready",
                            EntryState::Present => "present",
                            EntryState::Terminating => "terminating",
                            EntryState::Missing => "missing",
                        };
                        println!("{:<12} {}", state, e.entry);
                    }
                    if let Some(last) = report.history.first() {
                        println!("last change {} ({} record(s) kept)", last.digest, report.history.len());
                    }
                }
                Output::Json => print_json(&report)?,
            }
            if !report.healthy() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
