// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trellis - workflow runtime command line
//!
//! Runs one operation against a SQLite database and prints the result as JSON.
//! Without `TRELLIS_DATABASE_URL` (or `--database`) the stores live in memory and
//! disappear when the command exits.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use trellis_core::config::Config;
use trellis_core::persistence::SqliteStore;
use trellis_core::specification::fields;
use trellis_core::{
    CancellationTokens, OrderBy, Page, ResumeWorkflowParams, Specification, StartWorkflowParams, VersionOptions,
    WorkflowRuntime, WorkflowStatus,
};

#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(about = "Trellis - versioned workflow definitions with resumable instances")]
#[command(version)]
struct Cli {
    /// SQLite database file (overrides TRELLIS_DATABASE_URL)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save a definition from a JSON save request
    Save {
        /// Path to the request JSON
        #[arg(short, long)]
        file: PathBuf,

        /// Publish the saved version
        #[arg(long)]
        publish: bool,
    },

    /// Publish the latest version of a definition
    Publish {
        /// Definition ID
        definition_id: String,
    },

    /// Clear the published flag of a definition
    Retract {
        /// Definition ID
        definition_id: String,
    },

    /// Delete every version of a definition
    DeleteDefinition {
        /// Definition ID
        definition_id: String,
    },

    /// List definition versions
    Definitions {
        /// Only this definition family
        #[arg(short, long)]
        definition_id: Option<String>,

        /// Version selector: latest, published, latest-or-published, all or a number
        #[arg(long, default_value = "all")]
        version: VersionOptions,
    },

    /// Start an instance
    Start {
        /// Definition ID
        definition_id: String,

        /// Version selector
        #[arg(long, default_value = "latest-or-published")]
        version: VersionOptions,

        /// Input as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Correlation ID
        #[arg(short, long)]
        correlation_id: Option<String>,

        /// Caller-chosen instance ID
        #[arg(long)]
        instance_id: Option<String>,

        /// Start at this activity instead of the start activities
        #[arg(long)]
        trigger_activity: Option<String>,
    },

    /// Resume the oldest bookmark matching an activity and payload
    Resume {
        /// Activity ID the bookmark was created at
        activity_id: String,

        /// Bookmark payload as JSON
        #[arg(short, long)]
        payload: String,

        /// Trigger input as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Correlation ID
        #[arg(short, long)]
        correlation_id: Option<String>,

        /// Only bookmarks of this instance
        #[arg(long)]
        instance_id: Option<String>,
    },

    /// Resume every bookmark of an activity type with a matching payload
    Dispatch {
        /// Activity type, e.g. SignalReceived
        activity_type: String,

        /// Bookmark payload as JSON
        #[arg(short, long)]
        payload: String,

        /// Trigger input as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Correlation ID
        #[arg(short, long)]
        correlation_id: Option<String>,
    },

    /// Cancel an instance
    Cancel {
        /// Instance ID
        instance_id: String,
    },

    /// Re-run instances left running by an interrupted process
    Recover {
        /// Only this instance (default: every interrupted instance)
        instance_id: Option<String>,
    },

    /// Delete an instance and its bookmarks
    DeleteInstance {
        /// Instance ID
        instance_id: String,
    },

    /// Show one instance
    Instance {
        /// Instance ID
        instance_id: String,
    },

    /// List instances
    Instances {
        /// Only this definition family
        #[arg(short, long)]
        definition_id: Option<String>,

        /// Only this status
        #[arg(short, long)]
        status: Option<WorkflowStatus>,

        /// Maximum number of rows
        #[arg(short, long, default_value = "50")]
        limit: u64,
    },

    /// Print the JSON schema of a workflow definition
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trellis_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    if let Command::Schema = cli.command {
        return print(&trellis_dsl::definition_schema());
    }

    let path = match cli.database {
        Some(path) => Some(path),
        None => config.database_path()?.map(PathBuf::from),
    };
    let builder = WorkflowRuntime::builder().config(&config);
    let (runtime, store) = match path {
        Some(path) => {
            let store = SqliteStore::from_path(&path).await?;
            info!(path = %path.display(), "Database opened");
            (builder.sqlite(store.clone()).build()?, Some(store))
        }
        None => {
            warn!("No database configured, using in-memory stores");
            (builder.in_memory().build()?, None)
        }
    };

    let outcome = run(&runtime, cli.command).await;
    if let Some(store) = store {
        store.close().await;
    }
    outcome
}

async fn run(runtime: &WorkflowRuntime, command: Command) -> Result<()> {
    match command {
        Command::Save { file, publish } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let json: Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", file.display()))?;
            let mut request =
                trellis_dsl::parse_save_request(&json).map_err(anyhow::Error::msg)?;
            request.publish |= publish;
            print(&runtime.save_definition(request).await?)
        }
        Command::Publish { definition_id } => print(&runtime.publish(&definition_id).await?),
        Command::Retract { definition_id } => print(&runtime.retract(&definition_id).await?),
        Command::DeleteDefinition { definition_id } => {
            let removed = runtime.delete_definition(&definition_id).await?;
            print(&serde_json::json!({ "definitionId": definition_id, "removed": removed }))
        }
        Command::Definitions {
            definition_id,
            version,
        } => {
            let spec = match definition_id {
                Some(definition_id) => Specification::ByDefinitionId {
                    definition_id,
                    version: Some(version),
                },
                None => Specification::ByVersion(version),
            };
            let definitions = runtime
                .find_definitions(&spec, Some(&OrderBy::asc(fields::VERSION)), None)
                .await?;
            print(&definitions)
        }
        Command::Start {
            definition_id,
            version,
            input,
            correlation_id,
            instance_id,
            trigger_activity,
        } => {
            let mut params = StartWorkflowParams::new(definition_id).version(version);
            params.input = parse_object(input.as_deref())?;
            params.correlation_id = correlation_id;
            params.instance_id = instance_id;
            params.trigger_activity_id = trigger_activity;
            print(&runtime.start_workflow(params).await?)
        }
        Command::Resume {
            activity_id,
            payload,
            input,
            correlation_id,
            instance_id,
        } => {
            let mut params = ResumeWorkflowParams::new(activity_id, parse_json(&payload)?);
            params.input = parse_object(input.as_deref())?;
            params.correlation_id = correlation_id;
            params.instance_id = instance_id;
            print(&runtime.resume(params).await?)
        }
        Command::Dispatch {
            activity_type,
            payload,
            input,
            correlation_id,
        } => {
            let results = runtime
                .dispatch_trigger(
                    &activity_type,
                    &parse_json(&payload)?,
                    correlation_id.as_deref(),
                    parse_object(input.as_deref())?,
                )
                .await?;
            print(&results)
        }
        Command::Cancel { instance_id } => {
            let outcome = runtime.cancel_instance(&instance_id).await?;
            print(&serde_json::json!({
                "instanceId": instance_id,
                "outcome": format!("{:?}", outcome),
            }))
        }
        Command::Recover { instance_id } => match instance_id {
            Some(id) => print(
                &runtime
                    .recover_instance(&id, CancellationTokens::new())
                    .await?,
            ),
            None => print(&runtime.recover_instances(CancellationTokens::new()).await?),
        },
        Command::DeleteInstance { instance_id } => {
            runtime.delete_instance(&instance_id).await?;
            print(&serde_json::json!({ "instanceId": instance_id, "deleted": true }))
        }
        Command::Instance { instance_id } => match runtime.get_instance(&instance_id).await? {
            Some(instance) => print(&instance),
            None => anyhow::bail!("instance '{}' not found", instance_id),
        },
        Command::Instances {
            definition_id,
            status,
            limit,
        } => {
            let mut spec = Specification::all();
            if let Some(definition_id) = definition_id {
                spec = spec.and(Specification::by_definition(definition_id));
            }
            if let Some(status) = status {
                spec = spec.and(Specification::with_status(status));
            }
            let instances = runtime
                .find_instances(
                    &spec,
                    Some(&OrderBy::desc(fields::CREATED_AT)),
                    Some(Page::first(limit)),
                )
                .await?;
            print(&instances)
        }
        Command::Schema => print(&trellis_dsl::definition_schema()),
    }
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("'{}' is not valid JSON", raw))
}

fn parse_object(raw: Option<&str>) -> Result<BTreeMap<String, Value>> {
    match raw {
        Some(raw) => serde_json::from_str(raw)
            .with_context(|| format!("'{}' is not a JSON object", raw)),
        None => Ok(BTreeMap::new()),
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
