use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use skiff_core::{labels, AppKind, Application, EnvVar, PlatformConfig};
use skiff_kubehub::{KubeCluster, ReadinessWatcher};
use skiff_persist::SqliteStore;
use skiff_provision::ResourceProvisioner;
use skiff_store::ResourceStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "skiffctl", version, about = "Skiff provisioning CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for application resources (overrides SKIFF_NAMESPACE)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available templates
    Templates,
    /// Import templates from a YAML list
    ImportTemplates {
        file: std::path::PathBuf,
    },
    /// Provision an application from a template
    Provision {
        #[arg(long = "template")]
        template: String,
        #[arg(long = "name")]
        name: String,
        #[arg(long = "owner")]
        owner: String,
        /// KEY=VALUE, repeatable
        #[arg(long = "env")]
        env: Vec<EnvVar>,
    },
    /// Show an application record
    Show {
        name: String,
        #[arg(long = "owner")]
        owner: Option<String>,
    },
    /// Wait for a Deployment to become available
    WaitReady {
        deployment: String,
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
    },
    /// Delete an application's cluster resources, newest first; the record is kept
    Teardown {
        name: String,
        #[arg(long = "owner")]
        owner: String,
    },
}

fn init_tracing() {
    let env = std::env::var("SKIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SKIFF_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel the token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupted");
                token.cancel();
            }
        }
    });
    token
}

async fn provisioner(cfg: &PlatformConfig, store: Arc<SqliteStore>) -> Result<ResourceProvisioner> {
    let cluster = KubeCluster::try_default().await.context("connecting to cluster")?;
    Ok(ResourceProvisioner::new(Arc::new(cluster), store, cfg.clone()))
}

async fn find_app(store: &SqliteStore, name: &str, owner: Option<&str>) -> Result<Application> {
    let found = match owner {
        Some(o) => store.find_by_name_and_owner(name, o).await,
        None => store.find_by_name(name).await,
    };
    found.map_err(|e| anyhow!("{}", e))
}

fn render_age(created: DateTime<Utc>) -> String {
    let mut secs = (Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn print_app(app: &Application, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("NAME                 KIND        STATE     VISIBILITY  DNS                            AGE");
            println!(
                "{:<20} {:<11} {:<9} {:<11} {:<30} {}",
                app.name,
                app.kind.as_str(),
                app.state.as_str(),
                app.visibility.as_str(),
                app.dns_name.as_deref().unwrap_or("-"),
                render_age(app.created_at)
            );
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(app)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let mut cfg = PlatformConfig::from_env();
    if let Some(ns) = cli.namespace.clone() {
        cfg.namespace = ns;
    }
    let store = Arc::new(SqliteStore::open(&cfg.db_path)?);

    match cli.command {
        Commands::Templates => {
            let templates = store.find_all_available_templates().await.map_err(|e| anyhow!("{}", e))?;
            match cli.output {
                Output::Human => {
                    println!("CODE             KIND        IMAGE                          REQUIRED");
                    for t in &templates {
                        println!("{:<16} {:<11} {:<30} {}", t.code, t.kind.as_str(), t.image, t.required_envs.join(","));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&templates)?),
            }
        }
        Commands::ImportTemplates { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let n = store.import_templates_yaml(&raw)?;
            info!(file = %file.display(), count = n, "templates imported");
            if cli.output == Output::Json {
                println!("{}", serde_json::json!({ "imported": n }));
            } else {
                println!("imported {} template(s)", n);
            }
        }
        Commands::Provision { template, name, owner, env } => {
            let t = store.find_template_by_code(&template).await.map_err(|e| anyhow!("{}", e))?;
            if !t.available {
                return Err(anyhow!("template {} is not available", t.code));
            }
            let prov = provisioner(&cfg, Arc::clone(&store)).await?;
            let cancel = cancel_on_ctrl_c();
            let started = Instant::now();
            let draft = Application::draft(name, owner.clone(), t.kind);
            let app = prov.provision(&t, draft, &owner, env, &cancel).await?;
            info!(app = %app.name, state = %app.state, took_ms = started.elapsed().as_millis() as u64, "provision finished");
            print_app(&app, cli.output)?;
        }
        Commands::Show { name, owner } => {
            let app = find_app(&store, &name, owner.as_deref()).await?;
            print_app(&app, cli.output)?;
        }
        Commands::WaitReady { deployment, timeout_secs } => {
            let cluster = KubeCluster::try_default().await.context("connecting to cluster")?;
            let watcher = ReadinessWatcher::new(Arc::new(cluster));
            let timeout = timeout_secs.map(Duration::from_secs).unwrap_or(cfg.readiness_timeout);
            let started = Instant::now();
            watcher.wait_ready(&cfg.namespace, &deployment, timeout, cancel_on_ctrl_c()).await?;
            let took_ms = started.elapsed().as_millis() as u64;
            match cli.output {
                Output::Human => println!("{} available after {}ms", deployment, took_ms),
                Output::Json => println!("{}", serde_json::json!({ "deployment": deployment, "ready": true, "took_ms": took_ms })),
            }
        }
        Commands::Teardown { name, owner } => {
            let app = find_app(&store, &name, Some(&owner)).await?;
            if app.kind == AppKind::Web && app.state.is_build_in_flight() {
                warn!(app = %app.name, state = %app.state, "tearing down while a build is in flight");
            }
            let prov = provisioner(&cfg, Arc::clone(&store)).await?;
            let removed = prov.teardown(app.id).await?;
            match cli.output {
                Output::Human => {
                    for (kind, res) in &removed {
                        println!("deleted {} {}/{}", kind, cfg.namespace, res);
                    }
                    if removed.is_empty() {
                        println!("nothing to delete for {} (selector {})", app.name, labels::selector_string(&labels::app_selector(&app)));
                    }
                }
                Output::Json => {
                    let items: Vec<_> = removed.iter().map(|(k, n)| serde_json::json!({ "kind": k.to_string(), "name": n })).collect();
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
    }
    Ok(())
}
