use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use keel_apply::{parse_manifest, LAST_APPLIED_ANNOTATION};
use keel_core::{ClusterClient, Labels, ResourceSet};
use keel_install::{list_all_cached_values, CancellationToken, CreationPolicy, InstallerOptions, ReconcileParams, Reconciler};
use keel_kubehub::KubeClient;
use keel_store::OwnershipCache;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel: reconcile manifests against a cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Installation namespace for namespaced resources
    #[arg(long = "ns", global = true, env = "KEEL_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Owner label, repeatable: -l app=demo
    #[arg(short = 'l', long = "owner", global = true, value_parser = parse_label)]
    owner: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge the cluster to the resources in the given manifests ("-" reads stdin)
    Apply {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Keep namespaces written in the manifests
        #[arg(long = "respect-namespaces", action = ArgAction::SetTrue)]
        respect_namespaces: bool,
        /// What to do when a resource already exists: fail, ignore, update, recreate
        #[arg(long = "policy")]
        policy: Option<CreationPolicy>,
        /// Cap on concurrent operations per kind group
        #[arg(long = "max-concurrency")]
        max_concurrency: Option<usize>,
    },
    /// Delete every resource owned by the given labels
    Purge,
    /// List owned resources
    Ls,
    /// Distinct values of a label key across owned resources
    Values {
        /// Label key, e.g. "app.kubernetes.io/instance"
        key: String,
    },
    /// Create or delete the CustomResourceDefinitions found in manifests
    Crds {
        #[arg(long = "delete", action = ArgAction::SetTrue)]
        delete: bool,
        #[arg(required = true)]
        files: Vec<PathBuf>,
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

fn parse_label(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("expected key=value, got {:?}", s)),
    }
}

/// Cancelled on Ctrl-C; in-flight waits then return early.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; abandoning waits");
            child.cancel();
        }
    });
    token
}

fn load_manifests(files: &[PathBuf]) -> Result<ResourceSet> {
    let mut all = ResourceSet::new();
    for path in files {
        let text = if path.as_os_str() == "-" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading manifests from stdin")?;
            buf
        } else {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
        };
        let set = parse_manifest(&text).with_context(|| format!("parsing {}", path.display()))?;
        info!(file = %path.display(), resources = set.len(), "loaded manifest");
        for res in set {
            all.push(res);
        }
    }
    Ok(all)
}

fn print_resources(set: &ResourceSet, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<28} {:<16} {}", "KIND", "NAMESPACE", "NAME");
            for res in set {
                let ns = if res.namespace().is_empty() { "-" } else { res.namespace() };
                println!("{:<28} {:<16} {}", res.gvk().gvk_key(), ns, res.name());
            }
        }
        Output::Json => {
            let items: Vec<_> = set.iter().map(|r| r.to_value()).collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let owner: Labels = cli.owner.iter().cloned().collect();

    let kube = KubeClient::try_default().await.context("connecting to the cluster")?;
    let client: Arc<dyn ClusterClient> = Arc::new(kube);
    let cache = Arc::new(OwnershipCache::new());
    let mut opts = InstallerOptions::from_env();

    match cli.command {
        Commands::Apply { files, respect_namespaces, policy, max_concurrency } => {
            anyhow::ensure!(!owner.is_empty(), "apply needs at least one owner label (-l key=value)");
            if let Some(p) = policy {
                opts.creation_policy = p;
            }
            if max_concurrency.is_some() {
                opts.max_concurrency = max_concurrency.filter(|n| *n > 0);
            }
            let resources = load_manifests(&files)?;
            info!(resources = resources.len(), ns = %cli.namespace, policy = %opts.creation_policy, "apply invoked");
            let reconciler = Reconciler::new(client, cache, opts);
            let params = ReconcileParams::new(cli.namespace.clone(), resources, owner, respect_namespaces);
            reconciler.reconcile(params, &cancel_on_ctrl_c()).await.context("apply failed")?;
            print_resources(&reconciler.list_all(), cli.output)?;
        }
        Commands::Purge => {
            anyhow::ensure!(!owner.is_empty(), "purge needs at least one owner label (-l key=value)");
            info!(labels = ?owner, "purge invoked");
            let reconciler = Reconciler::new(client, cache, opts);
            reconciler.purge(&owner, &cancel_on_ctrl_c()).await.context("purge failed")?;
        }
        Commands::Ls => {
            cache
                .sync(&*client, &owner, |r| r.annotation(LAST_APPLIED_ANNOTATION).is_some())
                .await
                .context("listing owned resources")?;
            print_resources(&cache.list(), cli.output)?;
        }
        Commands::Values { key } => {
            cache
                .sync(&*client, &owner, |r| r.annotation(LAST_APPLIED_ANNOTATION).is_some())
                .await
                .context("listing owned resources")?;
            let reconciler = Reconciler::new(client, cache, opts);
            let values = list_all_cached_values(&reconciler, &key);
            match cli.output {
                Output::Human => values.iter().for_each(|v| println!("{}", v)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&values)?),
            }
        }
        Commands::Crds { delete, files } => {
            let crds: Vec<CustomResourceDefinition> = load_manifests(&files)?
                .into_iter()
                .filter(|r| r.kind() == "CustomResourceDefinition")
                .map(|r| serde_json::from_value::<CustomResourceDefinition>(r.into_value()))
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("decoding CustomResourceDefinition")?;
            info!(count = crds.len(), delete, "crds invoked");
            if delete {
                keel_kubehub::delete_crds(&*client, &crds).await.context("deleting CRDs")?;
            } else {
                keel_kubehub::create_crds(&*client, &crds).await.context("creating CRDs")?;
            }
        }
    }

    Ok(())
}
