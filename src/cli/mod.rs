//! CLI module for the optgrid command-line interface.
//!
//! Every subcommand works directly against the local database:
//! - `run` - Start the background reapply worker
//! - `org` / `account` - Manage organizations and cloud accounts
//! - `cluster-types` - Manage cluster types and reapply them
//! - `rules` - Manage assignment rules
//! - `discovery ingest <file>` - Ingest a discovery batch
//! - `events <org>` - Show recent activity
//! - `config check` - Validate configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::db::{
    self, ActivityEvent, CloudAccount, CloudType, Condition, ConditionType, CreateAssignmentRule,
    Organization, Pool,
};
use crate::engine::{ApplyResult, DiscoveryBatch, PriorityAction};
use crate::Engine;

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "optgrid")]
#[command(author, version, about = "Cluster-type resolution and reapplication engine", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "OPTGRID_CONFIG", default_value = "optgrid.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Subcommand to run (if none, starts the background worker)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the background reapply worker until interrupted
    Run,

    /// Organization management commands
    #[command(subcommand)]
    Org(OrgCommands),

    /// Cloud account management commands
    #[command(subcommand)]
    Account(AccountCommands),

    /// Cluster type management commands
    #[command(subcommand)]
    ClusterTypes(ClusterTypeCommands),

    /// Assignment rule management commands
    #[command(subcommand)]
    Rules(RuleCommands),

    /// Discovery commands
    #[command(subcommand)]
    Discovery(DiscoveryCommands),

    /// Show recent activity events of an organization
    Events {
        /// Organization ID
        org: String,
        /// Number of events to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Organization subcommands
#[derive(Subcommand, Debug)]
pub enum OrgCommands {
    /// Create an organization with its root pool and owner
    Create {
        name: String,
        /// Name of the organization owner
        #[arg(long, default_value = "Owner")]
        owner: String,
    },
    /// List organizations
    List,
}

/// Cloud account subcommands
#[derive(Subcommand, Debug)]
pub enum AccountCommands {
    /// Register a cloud account
    Create {
        /// Organization ID
        org: String,
        name: String,
        /// aws, azure, gcp or kubernetes
        cloud_type: String,
    },
    /// List cloud accounts of an organization
    List {
        /// Organization ID
        org: String,
    },
}

/// Cluster type subcommands
#[derive(Subcommand, Debug)]
pub enum ClusterTypeCommands {
    /// List cluster types by priority
    List {
        /// Organization ID
        org: String,
    },
    /// Create a cluster type at the lowest priority
    Create {
        /// Organization ID
        org: String,
        name: String,
        /// Tag key that groups resources into clusters
        tag_key: String,
    },
    /// Delete a cluster type and reapply its organization
    Delete {
        /// Cluster type ID
        id: String,
    },
    /// Change the priority of a cluster type
    Priority {
        /// Cluster type ID
        id: String,
        /// prioritize, promote, demote or deprioritize
        action: String,
    },
    /// Reapply all cluster types of an organization
    Apply {
        /// Organization ID
        org: String,
    },
}

/// Assignment rule subcommands
#[derive(Subcommand, Debug)]
pub enum RuleCommands {
    /// List assignment rules by priority
    List {
        /// Organization ID
        org: String,
    },
    /// Create an assignment rule at the lowest priority
    Create {
        /// Organization ID
        org: String,
        name: String,
        /// Condition as TYPE:VALUE, tag conditions as TYPE:KEY=VALUE (repeatable)
        #[arg(short = 'c', long = "condition", required = true)]
        conditions: Vec<String>,
        /// Target pool ID (defaults to the root pool)
        #[arg(long)]
        pool: Option<String>,
        /// Owner employee ID (defaults to the pool's default owner)
        #[arg(long)]
        owner: Option<String>,
        /// Create the rule disabled
        #[arg(long)]
        inactive: bool,
    },
    /// Delete an assignment rule
    Delete {
        /// Rule ID
        id: String,
    },
}

/// Discovery subcommands
#[derive(Subcommand, Debug)]
pub enum DiscoveryCommands {
    /// Ingest a discovery batch from a JSON file
    Ingest {
        file: PathBuf,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Check,
}

/// Run a CLI command
pub async fn run_command(cli: &Cli, config: &Config) -> Result<()> {
    let command = match &cli.command {
        Some(Commands::Config(ConfigCommands::Check)) => return cmd_config_check(&cli.config),
        // Running the worker is handled in main.rs
        None | Some(Commands::Run) => return Ok(()),
        Some(command) => command,
    };

    let db = db::init(&config.database).await?;
    let engine = Engine::new(config, db.clone());

    let result = match command {
        Commands::Org(OrgCommands::Create { name, owner }) => cmd_org_create(&engine, name, owner).await,
        Commands::Org(OrgCommands::List) => cmd_org_list(&engine).await,
        Commands::Account(AccountCommands::Create { org, name, cloud_type }) => {
            cmd_account_create(&engine, org, name, cloud_type).await
        }
        Commands::Account(AccountCommands::List { org }) => cmd_account_list(&engine, org).await,
        Commands::ClusterTypes(ClusterTypeCommands::List { org }) => cmd_cluster_types_list(&engine, org).await,
        Commands::ClusterTypes(ClusterTypeCommands::Create { org, name, tag_key }) => {
            cmd_cluster_types_create(&engine, org, name, tag_key).await
        }
        Commands::ClusterTypes(ClusterTypeCommands::Delete { id }) => {
            cmd_cluster_types_delete(&engine, id).await
        }
        Commands::ClusterTypes(ClusterTypeCommands::Priority { id, action }) => {
            cmd_cluster_types_priority(&engine, id, action).await
        }
        Commands::ClusterTypes(ClusterTypeCommands::Apply { org }) => cmd_cluster_types_apply(&engine, org).await,
        Commands::Rules(RuleCommands::List { org }) => cmd_rules_list(&engine, org).await,
        Commands::Rules(RuleCommands::Create {
            org,
            name,
            conditions,
            pool,
            owner,
            inactive,
        }) => {
            cmd_rules_create(
                &engine,
                org,
                name,
                conditions,
                pool.as_deref(),
                owner.as_deref(),
                !*inactive,
            )
            .await
        }
        Commands::Rules(RuleCommands::Delete { id }) => cmd_rules_delete(&engine, id).await,
        Commands::Discovery(DiscoveryCommands::Ingest { file }) => cmd_discovery_ingest(&engine, file).await,
        Commands::Events { org, limit } => cmd_events(&engine, org, *limit).await,
        Commands::Config(_) | Commands::Run => Ok(()),
    };

    db.close().await;
    result
}

async fn cmd_org_create(engine: &Engine, name: &str, owner: &str) -> Result<()> {
    let bundle = Organization::create(&engine.db, name, owner)
        .await
        .context("Failed to create organization")?;

    println!("[OK] Organization created");
    println!();
    println!("  ID:         {}", bundle.organization.id);
    println!("  Name:       {}", bundle.organization.name);
    println!("  Root pool:  {}", bundle.root_pool.id);
    println!("  Owner:      {} ({})", bundle.owner.name, bundle.owner.id);
    println!();
    Ok(())
}

async fn cmd_org_list(engine: &Engine) -> Result<()> {
    let organizations = Organization::list(&engine.db).await?;
    if organizations.is_empty() {
        println!("No organizations found.");
        return Ok(());
    }

    println!();
    println!("{:<36}  {:<30}  {:<25}", "ID", "NAME", "CREATED");
    println!("{}", "-".repeat(95));
    for org in organizations {
        println!(
            "{:<36}  {:<30}  {:<25}",
            org.id,
            truncate(&org.name, 30),
            org.created_at
        );
    }
    println!();
    Ok(())
}

async fn cmd_account_create(engine: &Engine, org: &str, name: &str, cloud_type: &str) -> Result<()> {
    let cloud_type: CloudType = cloud_type.parse().map_err(anyhow::Error::msg)?;
    Organization::get(&engine.db, org)
        .await?
        .with_context(|| format!("Organization not found: {}", org))?;

    let account = CloudAccount::create(&engine.db, org, name, cloud_type).await?;
    println!("[OK] Cloud account created: {} ({})", account.id, account.cloud_type);
    Ok(())
}

async fn cmd_account_list(engine: &Engine, org: &str) -> Result<()> {
    let accounts = CloudAccount::list(&engine.db, org).await?;
    if accounts.is_empty() {
        println!("No cloud accounts found.");
        return Ok(());
    }

    println!();
    println!("{:<36}  {:<30}  {:<16}", "ID", "NAME", "TYPE");
    println!("{}", "-".repeat(86));
    for account in accounts {
        println!(
            "{:<36}  {:<30}  {:<16}",
            account.id,
            truncate(&account.name, 30),
            account.cloud_type
        );
    }
    println!();
    Ok(())
}

async fn cmd_cluster_types_list(engine: &Engine, org: &str) -> Result<()> {
    let types = engine.cluster_types.list(org).await?;
    if types.is_empty() {
        println!("No cluster types found.");
        return Ok(());
    }

    println!();
    println!("{:<8}  {:<36}  {:<30}  {:<30}", "PRIORITY", "ID", "NAME", "TAG KEY");
    println!("{}", "-".repeat(110));
    for cluster_type in types {
        println!(
            "{:<8}  {:<36}  {:<30}  {:<30}",
            cluster_type.priority,
            cluster_type.id,
            truncate(&cluster_type.name, 30),
            truncate(&cluster_type.tag_key, 30)
        );
    }
    println!();
    Ok(())
}

async fn cmd_cluster_types_create(engine: &Engine, org: &str, name: &str, tag_key: &str) -> Result<()> {
    let cluster_type = engine.cluster_types.create(org, name, tag_key).await?;
    println!(
        "[OK] Cluster type created: {} (priority {})",
        cluster_type.id, cluster_type.priority
    );
    println!("Run `optgrid cluster-types apply {}` to group existing resources.", org);
    Ok(())
}

async fn cmd_cluster_types_delete(engine: &Engine, id: &str) -> Result<()> {
    let result = engine.cluster_types.delete(id).await?;
    println!("[OK] Cluster type deleted: {}", id);
    print_apply_result(&result);
    Ok(())
}

async fn cmd_cluster_types_priority(engine: &Engine, id: &str, action: &str) -> Result<()> {
    let action: PriorityAction = action.parse().map_err(anyhow::Error::msg)?;
    let types = engine.cluster_types.update_priority(id, action).await?;

    println!();
    for cluster_type in types {
        let marker = if cluster_type.id == id { "*" } else { " " };
        println!(
            "{} {:<4}  {:<30}  {}",
            marker,
            cluster_type.priority,
            truncate(&cluster_type.name, 30),
            cluster_type.tag_key
        );
    }
    println!();
    Ok(())
}

async fn cmd_cluster_types_apply(engine: &Engine, org: &str) -> Result<()> {
    let result = engine.cluster_types.apply(org).await?;
    println!("[OK] Cluster types applied");
    print_apply_result(&result);
    Ok(())
}

async fn cmd_rules_list(engine: &Engine, org: &str) -> Result<()> {
    let rules = crate::rules::list_rules(&engine.db, org).await?;
    if rules.is_empty() {
        println!("No assignment rules found.");
        return Ok(());
    }

    println!();
    println!(
        "{:<8}  {:<36}  {:<30}  {:<8}  {:<36}",
        "PRIORITY", "ID", "NAME", "ACTIVE", "POOL"
    );
    println!("{}", "-".repeat(126));
    for rule in rules {
        println!(
            "{:<8}  {:<36}  {:<30}  {:<8}  {:<36}",
            rule.priority,
            rule.id,
            truncate(&rule.name, 30),
            if rule.active { "yes" } else { "no" },
            rule.pool_id
        );
        for condition in &rule.conditions {
            println!("          {} {}", condition.condition_type, condition.meta_info);
        }
    }
    println!();
    Ok(())
}

async fn cmd_rules_create(
    engine: &Engine,
    org: &str,
    name: &str,
    conditions: &[String],
    pool: Option<&str>,
    owner: Option<&str>,
    active: bool,
) -> Result<()> {
    let conditions = conditions
        .iter()
        .map(|c| parse_condition(c))
        .collect::<Result<Vec<_>>>()?;

    let pool = match pool {
        Some(id) => Pool::get(&engine.db, id)
            .await?
            .with_context(|| format!("Pool not found: {}", id))?,
        None => Pool::root(&engine.db, org)
            .await?
            .with_context(|| format!("Organization has no root pool: {}", org))?,
    };
    let owner_id = owner
        .map(str::to_string)
        .or_else(|| pool.default_owner_id.clone())
        .context("Pool has no default owner, pass --owner")?;

    let rule = crate::rules::create_rule(
        &engine.db,
        org,
        CreateAssignmentRule {
            name: name.to_string(),
            active,
            pool_id: pool.id,
            owner_id,
            conditions,
        },
    )
    .await?;

    println!("[OK] Assignment rule created: {} (priority {})", rule.id, rule.priority);
    Ok(())
}

async fn cmd_rules_delete(engine: &Engine, id: &str) -> Result<()> {
    crate::rules::delete_rule(&engine.db, id).await?;
    println!("[OK] Assignment rule deleted: {}", id);
    Ok(())
}

async fn cmd_discovery_ingest(engine: &Engine, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read discovery batch: {}", file.display()))?;
    let batch: DiscoveryBatch = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse discovery batch: {}", file.display()))?;

    let result = engine.discovery.ingest(batch).await?;
    println!("[OK] Discovery batch ingested");
    println!();
    println!("  Created:      {}", result.created);
    println!("  Updated:      {}", result.updated);
    println!("  Deactivated:  {}", result.deactivated);
    print_apply_result(&result.binding);
    Ok(())
}

async fn cmd_events(engine: &Engine, org: &str, limit: i64) -> Result<()> {
    let events = ActivityEvent::list(&engine.db, org, limit).await?;
    if events.is_empty() {
        println!("No activity events found.");
        return Ok(());
    }

    println!();
    println!(
        "{:<32}  {:<8}  {:<34}  {:<36}",
        "TIME", "LEVEL", "ACTION", "OBJECT"
    );
    println!("{}", "-".repeat(116));
    for event in events {
        println!(
            "{:<32}  {:<8}  {:<34}  {:<36}",
            event.created_at,
            event.level,
            truncate(&event.action, 34),
            event.object_id
        );
    }
    println!();
    Ok(())
}

fn cmd_config_check(config_path: &Path) -> Result<()> {
    println!("Checking configuration file: {}", config_path.display());
    println!();

    if !config_path.exists() {
        println!(
            "[!!] Configuration file not found: {}",
            config_path.display()
        );
        println!();
        println!("The default configuration will be used.");
        return Ok(());
    }

    match Config::load(config_path) {
        Ok(config) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("[OK] Configuration file is valid!");
            } else {
                println!("[!!] Configuration file has problems:");
                for problem in &problems {
                    println!("  [!] {}", problem);
                }
            }
            println!();
            println!("=== Configuration Summary ===");
            println!();
            println!("Database:");
            println!("  Path:            {}", config.database.path().display());
            println!("  Connections:     {}", config.database.max_connections);
            println!();
            println!("Logging:");
            println!("  Level:           {}", config.logging.level);
            println!(
                "  Format:          {}",
                if config.logging.json { "JSON" } else { "Text" }
            );
            println!();
            println!("Clustering:");
            println!("  Batch size:      {}", config.clustering.effective_batch_size());
            println!(
                "  Reapply:         {}",
                if config.clustering.reapply_interval_secs == 0 {
                    "Disabled".to_string()
                } else {
                    format!("every {}s", config.clustering.reapply_interval_secs)
                }
            );
            println!("  Startup delay:   {}s", config.clustering.startup_delay_secs);
            println!();

            if problems.is_empty() {
                Ok(())
            } else {
                anyhow::bail!("Invalid configuration file");
            }
        }
        Err(e) => {
            println!("[!!] Configuration file is invalid!");
            println!();
            println!("Error: {:#}", e);
            println!();
            println!("Please check the configuration file syntax and try again.");
            anyhow::bail!("Invalid configuration file");
        }
    }
}

fn print_apply_result(result: &ApplyResult) {
    println!();
    println!("  Resources:         {}", result.processed_resources);
    println!("  Cluster types:     {}", result.processed_cluster_types);
    println!("  Clusters created:  {}", result.clusters_created);
    println!("  Clusters updated:  {}", result.clusters_updated);
    println!("  Clusters removed:  {}", result.clusters_removed);
    println!("  Bound:             {}", result.resources_bound);
    println!("  Unbound:           {}", result.resources_unbound);
    println!();
}

/// Parse `TYPE:VALUE`, with `TYPE:KEY=VALUE` for tag conditions
fn parse_condition(input: &str) -> Result<Condition> {
    let (kind, value) = input
        .split_once(':')
        .with_context(|| format!("Condition must look like TYPE:VALUE, got '{}'", input))?;
    let condition_type: ConditionType = serde_json::from_value(serde_json::Value::String(kind.trim().to_string()))
        .with_context(|| format!("Unknown condition type: {}", kind))?;

    if condition_type.takes_key_value() {
        let (key, value) = value
            .split_once('=')
            .with_context(|| format!("{} condition must look like {}:KEY=VALUE", condition_type, condition_type))?;
        Ok(Condition::tag(condition_type, key, value))
    } else {
        Ok(Condition::new(condition_type, value))
    }
}

/// Truncate a string to max length with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
