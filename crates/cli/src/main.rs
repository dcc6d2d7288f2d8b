//! flowsync: command-line front end for the workflow sync and execution core.
//!
//! - `watch` streams remote change events as JSON lines
//! - `refs` lists the `@ref` candidates available to a step of a local workflow file
//! - `run` reads a workflow from the service and runs one step
//! - `follow` keeps a local replica reconciled with remote changes until Ctrl-C

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use flowsync_api::{
    ApiConfig, DEFAULT_API_BASE, DEFAULT_READ_TOOL_NAME, FlowsyncClient, HttpToolCaller, ResourceWatchClient, RetryConfig,
    ToolWorkflowReader, WatchOptions, follow_workflow,
};
use flowsync_engine::{
    RUN_STEP_TOOL_NAME, StepExecutionOrchestrator, SyncReconciler, ToolCaller, WorkflowDocumentStore, WorkflowReadApi,
    available_references_for, compatible_options, load_workflow_file, lock_store, resolve_at_refs_in_input,
};
use flowsync_util::{JsonStepStateStore, StepStateStore, redact_sensitive};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Workflow sync and step execution from the terminal
#[derive(Parser)]
#[command(name = "flowsync", version, about)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// API base URL
    #[arg(long, global = true, env = "FLOWSYNC_API_BASE")]
    api_base: Option<String>,

    /// Bearer token for the API
    #[arg(long, global = true, env = "FLOWSYNC_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Workspace locator used in endpoint paths, e.g. `acme/default`
    #[arg(long, global = true, env = "FLOWSYNC_LOCATOR")]
    locator: Option<String>,

    /// Location of the cached step state file
    #[arg(long, global = true, env = "FLOWSYNC_STATE_PATH")]
    state_path: Option<PathBuf>,
}

impl ConnectionArgs {
    fn api_config(&self) -> Result<ApiConfig> {
        let config = ApiConfig {
            base_url: self.api_base.clone().unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            token: self.token.clone().filter(|token| !token.trim().is_empty()),
            locator: self.locator.clone().filter(|locator| !locator.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    fn step_state_store(&self) -> Result<Arc<dyn StepStateStore>> {
        let store = JsonStepStateStore::new(self.state_path.clone()).context("open step state cache")?;
        info!(path = %store.path().display(), "using step state cache");
        Ok(Arc::new(store))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Stream change events for a path filter as JSON lines
    Watch {
        /// Path prefix to watch, e.g. `/src/workflows/`
        #[arg(long)]
        path_filter: String,
        /// Also print events that happened before the subscription started
        #[arg(long)]
        include_history: bool,
    },

    /// List the references available to a step of a local workflow file
    Refs {
        /// Workflow definition (YAML or JSON)
        #[arg(long)]
        file: PathBuf,
        /// Step whose input is being authored
        #[arg(long)]
        step: String,
        /// Cache key for recorded step outputs; defaults to the file URL
        #[arg(long)]
        uri: Option<String>,
        /// JSON Schema of the target field; only compatible references are listed
        #[arg(long)]
        target_schema: Option<String>,
    },

    /// Read a workflow from the service and run one step
    Run {
        /// Workflow resource URI
        #[arg(long)]
        uri: String,
        /// Step to run
        #[arg(long)]
        step: String,
        /// JSON input overriding the stored one
        #[arg(long)]
        input: Option<String>,
        /// Tool that executes steps
        #[arg(long, default_value = RUN_STEP_TOOL_NAME)]
        run_step_tool: String,
        /// Tool that reads workflow definitions
        #[arg(long, default_value = DEFAULT_READ_TOOL_NAME)]
        read_tool: String,
    },

    /// Keep a workflow reconciled with remote changes until Ctrl-C
    Follow {
        /// Workflow resource URI
        #[arg(long)]
        uri: String,
        /// Path prefix whose changes trigger a re-read
        #[arg(long)]
        path_filter: String,
        /// Tool that reads workflow definitions
        #[arg(long, default_value = DEFAULT_READ_TOOL_NAME)]
        read_tool: String,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("error: {}", redact_sensitive(&format!("{error:#}")));
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Watch {
            path_filter,
            include_history,
        } => watch(&cli.connection, path_filter, include_history).await,
        Commands::Refs {
            file,
            step,
            uri,
            target_schema,
        } => refs(&cli.connection, &file, &step, uri, target_schema.as_deref()),
        Commands::Run {
            uri,
            step,
            input,
            run_step_tool,
            read_tool,
        } => run_step(&cli.connection, &uri, &step, input.as_deref(), run_step_tool, read_tool).await,
        Commands::Follow {
            uri,
            path_filter,
            read_tool,
        } => follow(&cli.connection, &uri, &path_filter, read_tool).await,
    }
}

/// Cancellation token that fires on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping");
        }
        trigger.cancel();
    });
    cancel
}

fn parse_json_arg(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{what} is not valid JSON"))
}

async fn watch(connection: &ConnectionArgs, path_filter: String, include_history: bool) -> Result<()> {
    let client = FlowsyncClient::new(connection.api_config()?)?;
    let watch = ResourceWatchClient::new(client);
    let mut options = WatchOptions::new(path_filter);
    if include_history {
        options = options.include_history();
    }

    let cancel = cancel_on_ctrl_c();
    watch
        .watch_with_retry(&options, RetryConfig::default(), &cancel, |event| match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(error) => warn!(error = %error, "failed to encode watch event"),
        })
        .await?;
    Ok(())
}

fn refs(connection: &ConnectionArgs, file: &Path, step: &str, uri: Option<String>, target_schema: Option<&str>) -> Result<()> {
    let workflow = load_workflow_file(file)?;
    if workflow.step(step).is_none() {
        bail!("step '{step}' not found in {}; available: {}", file.display(), workflow.step_names().join(", "));
    }

    let uri = match uri {
        Some(uri) => uri,
        None => format!("file://{}", file.canonicalize().unwrap_or_else(|_| file.to_path_buf()).display()),
    };
    let store = WorkflowDocumentStore::new(uri, workflow, connection.step_state_store()?);
    let mut options = available_references_for(store.state(), step);

    let target_schema = match target_schema {
        Some(raw) => Some(parse_json_arg(raw, "target-schema")?),
        None => None,
    };
    if let Some(schema) = &target_schema {
        options = compatible_options(&options, schema);
    }

    let state = store.state();
    if let Some(input) = state.effective_step_input(step) {
        let resolved = resolve_at_refs_in_input(input, &state.step_state.step_outputs, state.first_step_input());
        for error in resolved.errors {
            warn!(step, reference = %error.reference, reason = %error.message, "step input reference does not resolve yet");
        }
    }

    println!("{}", serde_json::to_string_pretty(&options)?);
    Ok(())
}

fn tool_stack(config: &ApiConfig, read_tool: String) -> Result<(Arc<dyn ToolCaller>, ToolWorkflowReader)> {
    let client = FlowsyncClient::new(config.clone())?;
    let caller: Arc<dyn ToolCaller> = Arc::new(HttpToolCaller::new(client.http().clone()));
    let locator = config.require_locator()?;
    let reader = ToolWorkflowReader::new(caller.clone(), config.tool_connection()?)
        .with_locator(locator)
        .with_read_tool(read_tool);
    Ok((caller, reader))
}

async fn run_step(
    connection: &ConnectionArgs,
    uri: &str,
    step: &str,
    input: Option<&str>,
    run_step_tool: String,
    read_tool: String,
) -> Result<()> {
    let config = connection.api_config()?;
    let (caller, reader) = tool_stack(&config, read_tool)?;
    let input = input.map(|raw| parse_json_arg(raw, "input")).transpose()?;

    let workflow = reader.read(uri).await.with_context(|| format!("read workflow {uri}"))?;
    let store = WorkflowDocumentStore::new(uri, workflow, connection.step_state_store()?).into_shared();
    let orchestrator = StepExecutionOrchestrator::new(store.clone(), caller, config.tool_connection()?)
        .with_locator(config.require_locator()?)
        .with_run_step_tool(run_step_tool);

    let report = orchestrator.run_step(step, input).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(error) = lock_store(&store).last_persist_error() {
        warn!(error, "step state was not cached");
    }
    if !report.success {
        bail!("step '{step}' failed");
    }
    Ok(())
}

async fn follow(connection: &ConnectionArgs, uri: &str, path_filter: &str, read_tool: String) -> Result<()> {
    let config = connection.api_config()?;
    let (_, reader) = tool_stack(&config, read_tool)?;
    let workflow = reader.read(uri).await.with_context(|| format!("read workflow {uri}"))?;
    let store = WorkflowDocumentStore::new(uri, workflow, connection.step_state_store()?).into_shared();
    let reconciler = SyncReconciler::new(store);
    let watch = ResourceWatchClient::new(FlowsyncClient::new(config)?);

    let cancel = cancel_on_ctrl_c();
    info!(uri, path_filter, "following workflow");
    let summary = follow_workflow(&watch, &reader, &reconciler, uri, path_filter, &cancel, |event, outcome| {
        match outcome.user_message() {
            Some(message) => println!("{message}"),
            None => println!("applied server update ({})", event.path),
        }
    })
    .await?;

    info!(
        events = summary.events,
        applied = summary.applied,
        queued = summary.queued,
        read_failures = summary.read_failures,
        "follow stopped"
    );
    Ok(())
}
