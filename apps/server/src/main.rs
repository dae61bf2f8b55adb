//! DICOM index - command-line entry point
//!
//! Opens the configured index and runs one query or maintenance command,
//! printing its result as JSON.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;

use dicom_index::config::Config;
use dicom_index::db::search::DatabaseLookup;
use dicom_index::db::{DatabaseWrapper, IndexOperations, SqliteDatabase};
use dicom_index::finder::{NoStorageArea, ResourceFinder};
use dicom_index::logging;
use dicom_index::models::{parse_tag, DeletedAttachment, LabelsConstraint, ResourceType};

#[derive(Parser, Debug)]
#[clap(name = "dicom-index")]
#[clap(about = "Query and maintain a DICOM index")]
struct Args {
    /// SQLite file, overriding `database.path`
    #[clap(short, long)]
    database: Option<String>,

    /// Evaluate finds through primitive calls instead of native SQL
    #[clap(long)]
    no_native_find: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the global statistics
    Stats,

    /// Look up resources
    Find {
        /// Patient, Study, Series or Instance
        #[clap(long)]
        level: ResourceType,

        /// Constraint as KEY=VALUE, where KEY is a keyword or `gggg,eeee`
        #[clap(long = "tag")]
        tags: Vec<String>,

        #[clap(long = "label")]
        labels: Vec<String>,

        #[clap(long, default_value = "all")]
        labels_constraint: LabelsConstraint,

        #[clap(long)]
        since: Option<u64>,

        #[clap(long)]
        limit: Option<u64>,

        /// Print the expanded resources instead of their ids
        #[clap(long)]
        expand: bool,

        #[clap(long = "requested-tag")]
        requested_tags: Vec<String>,
    },

    /// Print a page of the change log
    Changes {
        #[clap(long, default_value_t = 0)]
        since: i64,

        #[clap(long, default_value_t = 100)]
        limit: u32,
    },

    /// Delete a resource and everything below it
    Delete { public_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(path) = &args.database {
        config.database.path = path.clone();
    }
    if args.no_native_find {
        config.database.enable_native_find = false;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let _logging_guard =
        logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.database.path,
        "Starting DICOM index"
    );

    let registry = Arc::new(
        config
            .registry
            .build()
            .context("Failed to build the main DICOM tags registry")?,
    );
    let database = Arc::new(SqliteDatabase::new(config.database.clone(), registry.clone()));
    database.open().await.context("Failed to open the index")?;

    let index = IndexOperations::new(database.clone(), registry);
    let result = run(args.command, &index, &config).await;

    database.close().await.context("Failed to close the index")?;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(
    command: Command,
    index: &IndexOperations,
    config: &Config,
) -> anyhow::Result<serde_json::Value> {
    match command {
        Command::Stats => Ok(serde_json::to_value(index.get_statistics().await?)?),

        Command::Find {
            level,
            tags,
            labels,
            labels_constraint,
            since,
            limit,
            expand,
            requested_tags,
        } => {
            let mut finder = ResourceFinder::new(level, expand)?.with_config(&config.find);

            if !tags.is_empty() {
                let mut lookup = DatabaseLookup::new();
                for constraint in &tags {
                    let (key, value) = constraint
                        .split_once('=')
                        .with_context(|| format!("Expected KEY=VALUE, got {constraint}"))?;
                    lookup.add_dicom_constraint(
                        parse_tag(key)?,
                        value,
                        config.find.case_sensitive_pn,
                        true,
                    )?;
                }
                finder.set_database_lookup(lookup)?;
            }

            for label in labels {
                finder.add_label(label);
            }
            finder.set_labels_constraint(labels_constraint);

            if let Some(since) = since {
                finder.set_limits_since(since)?;
            }
            if let Some(limit) = limit {
                finder.set_limits_count(limit)?;
            }

            for tag in &requested_tags {
                finder.add_requested_tag(parse_tag(tag)?);
            }
            // No storage area is attached to the command line.
            finder.set_allow_storage_access(false);

            Ok(finder.execute_json(index, &NoStorageArea).await?)
        }

        Command::Changes { since, limit } => {
            Ok(serde_json::to_value(index.get_changes(since, limit).await?)?)
        }

        Command::Delete { public_id } => {
            let deleted = index.delete_resource(&public_id).await?;
            let attachments: Vec<DeletedAttachment> =
                deleted.attachments.iter().map(DeletedAttachment::from).collect();
            let resources: Vec<_> = deleted
                .resources
                .iter()
                .map(|(level, id)| json!({ "Type": level.as_str(), "ID": id }))
                .collect();

            Ok(json!({
                "Deleted": resources,
                "Attachments": attachments,
                "RemainingAncestor": deleted
                    .remaining_ancestor
                    .map(|(level, id)| json!({ "Type": level.as_str(), "ID": id })),
            }))
        }
    }
}
