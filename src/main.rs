//! dbvault command-line interface.

use std::io::{Write, stdin, stdout};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dbvault::backup::{BackupRequest, run_backup};
use dbvault::config::{AppConfig, Paths, StorageConfig};
use dbvault::engines::engine_for;
use dbvault::logging;
use dbvault::metadata::MetadataStore;
use dbvault::models::{
    BackupStatus, BackupType, CompressionSettings, ConnectionSpec, DatabaseKind, RestoreSpec,
    Secret, human_size, parse_table_list,
};
use dbvault::notifications;
use dbvault::restore::{fetch_backup, run_restore};
use dbvault::scheduler::{BackupJobRunner, JobStore, ScheduleEntry, Scheduler};
use dbvault::storage::open_storage;

#[derive(Parser, Debug)]
#[command(name = "dbvault", version)]
#[command(about = "Back up and restore PostgreSQL, MySQL, MongoDB and SQLite databases")]
struct Cli {
    /// Config file (default: <config dir>/db-vault/config.json)
    #[arg(long, global = true, env = "DB_VAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run and inspect backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Restore a database from a backup
    Restore {
        #[command(subcommand)]
        command: RestoreCommands,
    },
    /// Manage scheduled backups
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Check that a database is reachable
    TestConnection(ConnectionArgs),
    /// List databases on a server
    ListDatabases(ConnectionArgs),
    /// List tables or collections of a database
    ListTables(ConnectionArgs),
}

#[derive(Subcommand, Debug)]
enum BackupCommands {
    /// Dump, compress, checksum and store a backup
    Run(BackupRunArgs),
    /// List backups in storage
    List {
        #[command(flatten)]
        storage: StorageArgs,
        /// Only keys starting with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Show recent backup attempts
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum RestoreCommands {
    /// Restore a backup file into a database
    Run(RestoreRunArgs),
}

#[derive(Subcommand, Debug)]
enum ScheduleCommands {
    /// Add or replace a scheduled backup
    Add(ScheduleAddArgs),
    /// Remove a scheduled backup
    Remove { id: String },
    /// List scheduled backups
    List,
    /// Pause a scheduled backup
    Pause { id: String },
    /// Resume a paused backup
    Resume { id: String },
    /// Run the scheduler in the foreground until interrupted
    Start,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config with secrets masked
    Show,
    /// Save a named database profile
    AddDb {
        name: String,
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct ConnectionArgs {
    /// Named database profile from the config file
    #[arg(long, conflicts_with = "db_type")]
    profile: Option<String>,

    /// postgres, mysql, mongodb or sqlite
    #[arg(short = 't', long = "db-type")]
    db_type: Option<String>,

    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    #[arg(short = 'P', long)]
    port: Option<u16>,

    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Prefer the environment variable; flags are visible in process listings
    #[arg(short = 'p', long, env = "DB_VAULT_DB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Database name, or the file path for sqlite
    #[arg(short = 'd', long, default_value = "")]
    database: String,

    #[arg(long)]
    ssl: bool,
}

impl ConnectionArgs {
    fn resolve(&self, config: &AppConfig) -> Result<ConnectionSpec> {
        if let Some(name) = &self.profile {
            return Ok(config.profile(name)?);
        }
        let Some(kind) = &self.db_type else {
            if config.databases.contains_key("default") {
                return Ok(config.profile("default")?);
            }
            bail!("either --db-type or --profile is required");
        };

        let mut spec = ConnectionSpec::new(DatabaseKind::from_str(kind)?, self.database.clone())
            .with_host(self.host.clone())
            .with_ssl(self.ssl);
        if let Some(port) = self.port {
            spec = spec.with_port(port);
        }
        spec.username = self.username.clone();
        spec.password = self.password.clone().map(Secret::new);
        Ok(spec.normalized())
    }
}

#[derive(Args, Debug, Clone)]
struct StorageArgs {
    /// local or s3
    #[arg(short = 's', long)]
    storage: Option<String>,

    /// Local storage directory
    #[arg(short = 'o', long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    s3_bucket: Option<String>,

    #[arg(long)]
    s3_prefix: Option<String>,

    #[arg(long)]
    s3_region: Option<String>,

    #[arg(long)]
    s3_endpoint: Option<String>,
}

impl StorageArgs {
    fn apply(&self, mut storage: StorageConfig) -> Result<StorageConfig> {
        if let Some(kind) = &self.storage {
            storage.kind = kind.parse()?;
        }
        if let Some(dir) = &self.output_dir {
            storage.local_path = dir.clone();
        }
        if let Some(bucket) = &self.s3_bucket {
            storage.s3_bucket = Some(bucket.clone());
        }
        if let Some(prefix) = &self.s3_prefix {
            storage.s3_prefix = prefix.clone();
        }
        if let Some(region) = &self.s3_region {
            storage.s3_region = region.clone();
        }
        if let Some(endpoint) = &self.s3_endpoint {
            storage.s3_endpoint_url = Some(endpoint.clone());
        }
        Ok(storage)
    }
}

#[derive(Args, Debug, Clone)]
struct CompressionArgs {
    /// zstd, gzip, lz4 or none
    #[arg(short = 'c', long)]
    compression: Option<String>,

    #[arg(long)]
    compression_level: Option<i32>,
}

impl CompressionArgs {
    fn apply(&self, mut settings: CompressionSettings) -> Result<CompressionSettings> {
        if let Some(algorithm) = &self.compression {
            settings.algorithm = algorithm.parse()?;
        }
        if let Some(level) = self.compression_level {
            settings.level = level;
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Args, Debug)]
struct BackupRunArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    storage: StorageArgs,

    #[command(flatten)]
    compression: CompressionArgs,

    #[arg(short = 'b', long, default_value = "full")]
    backup_type: String,

    /// Comma-separated tables or collections
    #[arg(long)]
    tables: Option<String>,

    /// Slack incoming webhook for this run
    #[arg(long, env = "DB_VAULT_SLACK_WEBHOOK_URL", hide_env_values = true)]
    slack_webhook: Option<String>,
}

#[derive(Args, Debug)]
struct RestoreRunArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Local backup file
    #[arg(short = 'f', long, required_unless_present = "from_storage")]
    file: Option<PathBuf>,

    /// Storage key to download and restore
    #[arg(long, conflicts_with = "file")]
    from_storage: Option<String>,

    #[command(flatten)]
    storage: StorageArgs,

    /// Restore into a different database (or file, for sqlite)
    #[arg(long)]
    target_db: Option<String>,

    /// Comma-separated tables to restore
    #[arg(long)]
    tables: Option<String>,

    /// Drop existing objects before restoring
    #[arg(long)]
    drop_existing: bool,

    /// Skip object ownership (PostgreSQL)
    #[arg(long)]
    no_owner: bool,

    /// Show what would be restored without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,
}

#[derive(Args, Debug)]
struct ScheduleAddArgs {
    /// Job id
    id: String,

    /// Five-field crontab expression, e.g. "0 2 * * *"
    #[arg(long)]
    cron: String,

    /// Display name (defaults to the id)
    #[arg(long)]
    name: Option<String>,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    storage: StorageArgs,

    #[command(flatten)]
    compression: CompressionArgs,

    #[arg(short = 'b', long, default_value = "full")]
    backup_type: String,

    #[arg(long)]
    tables: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let paths = Paths::resolve();
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let config = AppConfig::load(&config_path).context(format!(
        "Failed to load configuration from {}",
        config_path.display()
    ))?;

    if let Err(e) = logging::init(&config.logging, cli.verbose) {
        eprintln!("⚠️ {e}");
    }
    paths.ensure_dirs()?;

    match cli.command {
        Commands::Backup { command } => match command {
            BackupCommands::Run(args) => backup_run(&paths, &config, args).await,
            BackupCommands::List { storage, prefix } => {
                backup_list(&config, &storage, &prefix).await
            }
            BackupCommands::History { limit } => backup_history(&paths, limit),
        },
        Commands::Restore {
            command: RestoreCommands::Run(args),
        } => restore_run(&paths, &config, args).await,
        Commands::Schedule { command } => schedule(&paths, &config, command).await,
        Commands::Config { command } => config_command(&config_path, config, command),
        Commands::TestConnection(args) => {
            let spec = args.resolve(&config)?;
            engine_for(&spec)
                .test_connection()
                .await
                .context("Connection test failed")?;
            println!("✅ Connection OK: {}", spec.describe());
            Ok(())
        }
        Commands::ListDatabases(args) => {
            let spec = args.resolve(&config)?;
            for name in engine_for(&spec).list_databases().await? {
                println!("{name}");
            }
            Ok(())
        }
        Commands::ListTables(args) => {
            let spec = args.resolve(&config)?;
            for name in engine_for(&spec).list_tables(None).await? {
                println!("{name}");
            }
            Ok(())
        }
    }
}

async fn backup_run(paths: &Paths, config: &AppConfig, args: BackupRunArgs) -> Result<()> {
    let spec = args.connection.resolve(config)?;
    let storage_config = args.storage.apply(config.storage.clone())?;
    let request = BackupRequest {
        backup_type: BackupType::from_str(&args.backup_type)?,
        tables: parse_table_list(args.tables.as_deref()),
        compression: args.compression.apply(config.compression)?,
        work_dir: paths.work_dir(),
    };

    let engine = engine_for(&spec);
    let storage = open_storage(&storage_config)
        .await
        .context("Failed to open storage backend")?;
    let metadata = MetadataStore::new(paths.metadata_dir());

    let record = run_backup(engine.as_ref(), storage.as_ref(), &metadata, &request)
        .await
        .context("Failed to save backup metadata")?;

    let mut notification = config.notification.clone();
    if let Some(url) = args.slack_webhook {
        notification.slack_webhook_url = Some(Secret::new(url));
    }
    match notifications::from_config(&notification) {
        Ok(notifier) => {
            if notifications::dispatch(notifier.as_deref(), &notification, &record).await {
                println!("✅ Slack notification sent");
            }
        }
        Err(e) => warn!(error = %e, "notifier unavailable"),
    }

    if record.status != BackupStatus::Completed {
        bail!(
            "Backup failed: {}",
            record.error_message.as_deref().unwrap_or("unknown error")
        );
    }

    println!("✅ Backup completed in {:.1}s", record.duration_seconds);
    println!("  ID:        {}", record.id);
    println!("  File:      {}", record.file_name);
    println!("  Location:  {}", record.file_path);
    println!(
        "  Size:      {} ({:.0}% of original)",
        record.size_human(),
        record.compression_ratio() * 100.0
    );
    println!("  SHA-256:   {}", record.checksum_sha256);
    Ok(())
}

async fn backup_list(config: &AppConfig, args: &StorageArgs, prefix: &str) -> Result<()> {
    let storage_config = args.apply(config.storage.clone())?;
    let storage = open_storage(&storage_config).await?;
    let backups = storage.list_backups(prefix).await?;
    if backups.is_empty() {
        println!("No backups found.");
        return Ok(());
    }
    let width = backups.iter().map(|b| b.key.len()).max().unwrap_or(3).max(3);
    println!("{:<width$}  {:>10}  LAST MODIFIED", "KEY", "SIZE");
    for backup in backups {
        println!(
            "{:<width$}  {:>10}  {}",
            backup.key,
            human_size(backup.size),
            backup.last_modified.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn backup_history(paths: &Paths, limit: usize) -> Result<()> {
    let records = MetadataStore::new(paths.metadata_dir()).list(limit)?;
    if records.is_empty() {
        println!("No backup history found.");
        return Ok(());
    }
    println!(
        "{:<16}  {:<20}  {:<8}  {:<11}  {:>10}  {:>9}  TIMESTAMP",
        "ID", "DATABASE", "ENGINE", "STATUS", "SIZE", "DURATION"
    );
    for record in records {
        println!(
            "{:<16}  {:<20}  {:<8}  {:<11}  {:>10}  {:>8.1}s  {}",
            record.id,
            record.database_name,
            record.database_type,
            record.status,
            record.size_human(),
            record.duration_seconds,
            record.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N]: ");
    stdout().flush().context("Failed to flush stdout")?;
    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn restore_run(paths: &Paths, config: &AppConfig, args: RestoreRunArgs) -> Result<()> {
    let spec = args.connection.resolve(config)?;
    let tables = parse_table_list(args.tables.as_deref());
    let source = match (&args.file, &args.from_storage) {
        (Some(file), _) => {
            if !file.exists() {
                bail!("Backup file not found: {}", file.display());
            }
            file.display().to_string()
        }
        (None, Some(key)) => key.clone(),
        (None, None) => bail!("either --file or --from-storage is required"),
    };

    if !args.dry_run && !args.yes {
        println!("Restore summary:");
        println!("  Source:     {source}");
        println!(
            "  Target DB:  {}",
            args.target_db
                .as_deref()
                .filter(|t| !t.is_empty())
                .unwrap_or(if spec.database.is_empty() { "(default)" } else { &spec.database })
        );
        println!("  Engine:     {}", spec.kind);
        if let Some(tables) = &tables {
            println!("  Tables:     {}", tables.join(", "));
        }
        if args.drop_existing {
            println!("  ⚠️ Existing objects will be dropped before restore");
        }
        if !confirm("Proceed with restore?")? {
            println!("Restore cancelled.");
            return Ok(());
        }
    }

    let (file, downloaded) = match (args.file, args.from_storage) {
        (Some(file), _) => (file, false),
        (None, Some(key)) => {
            let storage = open_storage(&args.storage.apply(config.storage.clone())?).await?;
            let file = fetch_backup(storage.as_ref(), &key, &paths.work_dir())
                .await
                .context("Failed to download backup")?;
            (file, true)
        }
        (None, None) => bail!("either --file or --from-storage is required"),
    };

    let request = RestoreSpec {
        backup_file: file.clone(),
        target_database: args.target_db,
        tables,
        dry_run: args.dry_run,
        drop_existing: args.drop_existing,
        no_owner: args.no_owner,
    };
    let engine = engine_for(&spec);
    run_restore(engine.as_ref(), &request)
        .await
        .context("Restore failed")?;

    if downloaded {
        if let Err(e) = tokio::fs::remove_file(&file).await {
            warn!(file = %file.display(), error = %e, "failed to remove downloaded backup");
        }
    }
    if args.dry_run {
        println!("✅ Dry run complete (no changes made)");
    } else {
        println!("✅ Restore completed successfully");
    }
    Ok(())
}

async fn schedule(paths: &Paths, config: &AppConfig, command: ScheduleCommands) -> Result<()> {
    let store = JobStore::new(paths.jobs_file());
    match command {
        ScheduleCommands::Add(args) => {
            let mut entry = ScheduleEntry::new(
                args.id.clone(),
                args.cron,
                args.connection.resolve(config)?,
                args.storage.apply(config.storage.clone())?,
            );
            entry.name = args.name.unwrap_or(args.id);
            entry.backup_type = BackupType::from_str(&args.backup_type)?;
            entry.tables = parse_table_list(args.tables.as_deref());
            entry.compression = args.compression.apply(config.compression)?;
            entry.notification = config.notification.clone();
            let next = entry.next_run(Utc::now());
            let id = entry.id.clone();
            store.add(entry)?;
            println!("✅ Scheduled '{id}'");
            if let Some(next) = next {
                println!("  Next run: {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        ScheduleCommands::Remove { id } => {
            store.remove(&id)?;
            println!("✅ Removed '{id}'");
        }
        ScheduleCommands::Pause { id } => {
            store.pause(&id)?;
            println!("⏸ Paused '{id}'");
        }
        ScheduleCommands::Resume { id } => {
            store.resume(&id)?;
            println!("▶ Resumed '{id}'");
        }
        ScheduleCommands::List => {
            let jobs = store.list()?;
            if jobs.is_empty() {
                println!("No scheduled jobs.");
                return Ok(());
            }
            let now = Utc::now();
            println!(
                "{:<16}  {:<20}  {:<15}  {:<10}  {:<20}  LAST RUN",
                "ID", "NAME", "CRON", "DATABASE", "NEXT RUN"
            );
            for job in jobs {
                let next = job
                    .next_run(now)
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "paused".to_string());
                let last = job
                    .last_run
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<16}  {:<20}  {:<15}  {:<10}  {:<20}  {}",
                    job.id,
                    job.name,
                    job.cron,
                    job.database.database_label(),
                    next,
                    last
                );
            }
        }
        ScheduleCommands::Start => {
            let runner = Arc::new(BackupJobRunner::new(paths.metadata_dir(), paths.work_dir()));
            let scheduler = Scheduler::new(store, runner);
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, stopping after running jobs finish");
                }
                on_signal.cancel();
            });
            println!("Scheduler running. Press Ctrl+C to stop.");
            scheduler.run(cancel).await?;
        }
    }
    Ok(())
}

/// `config` with every secret replaced by a mask.
fn redacted(mut config: AppConfig) -> AppConfig {
    let mask = |secret: &mut Option<Secret>| {
        if secret.is_some() {
            *secret = Some(Secret::new("********"));
        }
    };
    for spec in config.databases.values_mut() {
        mask(&mut spec.password);
    }
    mask(&mut config.storage.s3_secret_access_key);
    mask(&mut config.notification.slack_webhook_url);
    config
}

fn config_command(config_path: &Path, config: AppConfig, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Init { force } => {
            if config_path.exists() && !force {
                bail!(
                    "Config already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            let path = AppConfig::default().save(config_path)?;
            println!("✅ Config written to {}", path.display());
        }
        ConfigCommands::Show => {
            let json = serde_json::to_string_pretty(&redacted(config))
                .context("Failed to serialize config")?;
            println!("{json}");
        }
        ConfigCommands::AddDb { name, connection } => {
            // Start from the file alone so env overrides are not persisted.
            let mut stored = AppConfig::load_from_json(config_path)?;
            let spec = connection.resolve(&stored)?;
            println!("✅ Saved profile '{name}': {}", spec.describe());
            stored.databases.insert(name, spec);
            stored.save(config_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn backup_run_flags_build_a_request() -> Result<()> {
        let cli = Cli::try_parse_from([
            "dbvault", "backup", "run", "-t", "postgres", "-H", "db.internal", "-u", "admin",
            "-d", "app", "-c", "gzip", "--compression-level", "6", "--tables", "users, orders",
        ])?;
        let Commands::Backup {
            command: BackupCommands::Run(args),
        } = cli.command
        else {
            panic!("expected backup run");
        };
        let config = AppConfig::default();
        let spec = args.connection.resolve(&config)?;
        assert_eq!(spec.kind, DatabaseKind::Postgres);
        assert_eq!(spec.port, Some(5432));
        assert_eq!(spec.host, "db.internal");
        let compression = args.compression.apply(config.compression)?;
        assert_eq!(compression.level, 6);
        assert_eq!(
            parse_table_list(args.tables.as_deref()),
            Some(vec!["users".to_string(), "orders".to_string()])
        );
        Ok(())
    }

    #[test]
    fn restore_needs_a_source() {
        assert!(Cli::try_parse_from(["dbvault", "restore", "run", "-t", "sqlite"]).is_err());
        assert!(
            Cli::try_parse_from([
                "dbvault", "restore", "run", "-t", "sqlite", "-f", "a.db", "--from-storage", "k"
            ])
            .is_err()
        );
    }

    #[test]
    fn profile_comes_from_config() -> Result<()> {
        let mut config = AppConfig::default();
        config
            .databases
            .insert("shop".into(), ConnectionSpec::new(DatabaseKind::Mysql, "shop"));
        let cli = Cli::try_parse_from(["dbvault", "test-connection", "--profile", "shop"])?;
        let Commands::TestConnection(args) = cli.command else {
            panic!("expected test-connection");
        };
        assert_eq!(args.resolve(&config)?.kind, DatabaseKind::Mysql);

        let missing = Cli::try_parse_from(["dbvault", "list-tables"])?;
        let Commands::ListTables(args) = missing.command else {
            panic!("expected list-tables");
        };
        assert!(args.resolve(&AppConfig::default()).is_err());
        Ok(())
    }

    #[test]
    fn show_masks_secrets() {
        let mut config = AppConfig::default();
        config.databases.insert(
            "prod".into(),
            ConnectionSpec::new(DatabaseKind::Postgres, "app")
                .with_credentials("admin", Some(Secret::new("hunter2"))),
        );
        config.notification.slack_webhook_url = Some(Secret::new("https://hooks.slack.com/x"));
        let json = serde_json::to_string(&redacted(config)).unwrap_or_default();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("hooks.slack.com"));
        assert!(json.contains("********"));
    }
}
