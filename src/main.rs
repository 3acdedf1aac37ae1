use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

use cadence::config::Config;
use cadence::decompose::{TaskDecomposer, TemplateCatalog, WorkflowRequest, SAMPLE_CATALOG};
use cadence::state::{DistributedLock, RateLimiter};
use cadence::{Error, ExecutorRegistry, Result, WorkflowId, WorkflowManager};

/// Cadence - run template catalogs as dependency-ordered task graphs
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CADENCE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.cadence/cadence.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.cadence/cadence.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build the task graph for a catalog without running it
    Validate {
        /// Template catalog (default: `catalog` from the config)
        catalog: Option<PathBuf>,

        /// Templates to include (default: every template in the catalog)
        #[arg(short = 't', long = "template")]
        templates: Vec<String>,

        /// Run parameter, KEY=VALUE; VALUE is parsed as JSON when possible
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },

    /// Run a catalog and print the final status report as JSON
    Run {
        /// Template catalog (default: `catalog` from the config)
        catalog: Option<PathBuf>,

        /// Templates to include (default: every template in the catalog)
        #[arg(short = 't', long = "template")]
        templates: Vec<String>,

        /// Run parameter, KEY=VALUE; VALUE is parsed as JSON when possible
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// Override `scheduler.max_parallel`
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Show stored workflows, or the status report of one
    Status {
        /// Workflow ID (lists all workflows if omitted)
        workflow_id: Option<String>,
    },

    /// Write a default config and a sample catalog
    Init {
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
}

fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))?;
    if key.is_empty() {
        return Err("parameter name is empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cadence::log::init(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Validate {
            catalog,
            templates,
            params,
        } => run_validate(&config, catalog, templates, params),
        Command::Run {
            catalog,
            templates,
            params,
            max_parallel,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_catalog(&config, catalog, templates, params, max_parallel))
        }
        Command::Status { workflow_id } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_status(&config, workflow_id))
        }
        Command::Init { force } => run_init(&config, cli.config.as_deref(), force),
    }
}

fn resolve_catalog(config: &Config, catalog: Option<PathBuf>) -> Result<TemplateCatalog> {
    let path = catalog.or_else(|| config.catalog_path()).ok_or_else(|| {
        Error::Validation("no catalog given and none configured; try `cadence init`".to_string())
    })?;
    TemplateCatalog::load(&path)
}

fn build_request(templates: Vec<String>, params: Vec<(String, Value)>) -> WorkflowRequest {
    params
        .into_iter()
        .fold(WorkflowRequest { templates, ..Default::default() }, |req, (k, v)| {
            req.with_param(k, v)
        })
}

fn run_validate(
    config: &Config,
    catalog: Option<PathBuf>,
    templates: Vec<String>,
    params: Vec<(String, Value)>,
) -> Result<()> {
    let catalog = resolve_catalog(config, catalog)?;
    let request = build_request(templates, params);
    let decomposer = TaskDecomposer::new(catalog, Arc::new(ExecutorRegistry::with_builtins()));
    let graph = decomposer.build(&request)?;

    println!(
        "{} tasks, {} dependencies",
        graph.task_count(),
        graph.dependency_count()
    );
    for task in graph.topological_order()? {
        let deps: Vec<&str> = task.dependencies.iter().map(|d| d.as_str()).collect();
        if deps.is_empty() {
            println!("  {} ({})", task.id, task.kind);
        } else {
            println!("  {} ({}) <- {}", task.id, task.kind, deps.join(", "));
        }
    }
    Ok(())
}

fn build_manager(config: &Config, registry: Arc<ExecutorRegistry>) -> Result<WorkflowManager> {
    config.ensure_dirs()?;
    let backend = config.open_backend()?;
    let store = config.state_store(Arc::clone(&backend));
    let mut manager = WorkflowManager::new(store, registry, config.run_policy());
    if config.store.use_lock {
        manager = manager.with_lock(DistributedLock::new(Arc::clone(&backend)), config.lock_ttl());
    }
    if let Some(limit) = config.rate_limit() {
        manager = manager.with_rate_limit(RateLimiter::new(backend), limit);
    }
    Ok(manager)
}

async fn run_catalog(
    config: &Config,
    catalog: Option<PathBuf>,
    templates: Vec<String>,
    params: Vec<(String, Value)>,
    max_parallel: Option<usize>,
) -> Result<()> {
    let catalog = resolve_catalog(config, catalog)?;
    let request = build_request(templates, params);
    let registry = Arc::new(ExecutorRegistry::with_builtins());
    let graph = TaskDecomposer::new(catalog, Arc::clone(&registry)).build(&request)?;

    let manager = build_manager(config, registry)?;
    let mut policy = manager.policy();
    if let Some(n) = max_parallel {
        policy = policy.with_max_parallel(n);
    }

    let id = manager.prepare(graph).await?;
    info!(workflow_id = %id, "workflow prepared");

    let mut events = manager.subscribe(id).await?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match &event.task_id {
                Some(task) => eprintln!("[{}] {} {}", id.short(), event.kind, task),
                None => eprintln!("[{}] {}", id.short(), event.kind),
            }
        }
    });

    let canceller = manager.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(workflow_id = %id, "interrupted, cancelling");
            let _ = canceller.cancel(id).await;
        }
    });

    let result = manager.execute(id, policy).await;
    ctrl_c.abort();
    if result.is_ok() {
        let _ = printer.await;
    } else {
        printer.abort();
    }

    let state = result?;
    println!("{}", serde_json::to_string_pretty(&state.report())?);
    Ok(())
}

async fn run_status(config: &Config, workflow_id: Option<String>) -> Result<()> {
    let manager = build_manager(config, Arc::new(ExecutorRegistry::with_builtins()))?;

    match workflow_id {
        Some(raw) => {
            let id: WorkflowId = raw
                .parse()
                .map_err(|e| Error::Validation(format!("invalid workflow id {:?}: {}", raw, e)))?;
            let report = manager.get_status(id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        None => {
            let ids = manager.list_workflows().await?;
            if ids.is_empty() {
                println!("No workflows");
            }
            for id in ids {
                let report = manager.get_status(id).await?;
                println!(
                    "{}  {:<10} {:>5.1}%",
                    id, report.status, report.progress_percent
                );
            }
        }
    }
    Ok(())
}

fn run_init(config: &Config, config_path: Option<&Path>, force: bool) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    let catalog_path = config
        .catalog_path()
        .unwrap_or(Config::cadence_dir()?.join("catalog.toml"));

    if catalog_path.exists() && !force {
        println!("Catalog exists: {}", catalog_path.display());
    } else {
        if let Some(parent) = catalog_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&catalog_path, SAMPLE_CATALOG)?;
        println!("Wrote catalog: {}", catalog_path.display());
    }

    if config_path.exists() && !force {
        println!("Config exists: {}", config_path.display());
    } else {
        let mut fresh = config.clone();
        fresh.catalog = Some(catalog_path.display().to_string());
        fresh.save_to(&config_path)?;
        println!("Wrote config: {}", config_path.display());
    }

    config.ensure_dirs()?;
    Ok(())
}
