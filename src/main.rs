use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use libretto_lib::backup;
use libretto_lib::db::Collection;
use libretto_lib::sync::{Filesystem, LocalFilesystem, SyncOutcome, SyncState};
use libretto_lib::{logging, AppConfig, AppError, AppResult, AppState};

#[derive(Debug, Parser)]
#[command(name = "libretto", about = "Local-first bookkeeping store with folder sync", version)]
struct Cli {
    /// Directory holding the database and preference files.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show database, user and sync folder status.
    Status {
        #[arg(long)]
        json: bool,
    },
    #[command(subcommand)]
    Users(UsersCommand),
    #[command(subcommand)]
    Records(RecordsCommand),
    #[command(subcommand)]
    Backup(BackupCommand),
    #[command(subcommand)]
    Sync(SyncCommand),
}

#[derive(Debug, Subcommand)]
enum UsersCommand {
    List,
    Add {
        name: String,
        #[arg(long)]
        color: Option<String>,
    },
    /// Make another user the active one.
    Switch { id: String },
    Rename { id: String, name: String },
    /// Delete a user with all of its records.
    Delete { id: String },
}

#[derive(Debug, Subcommand)]
enum RecordsCommand {
    /// Print the active user's records of one collection.
    List { collection: String },
    /// Insert or update a record from a JSON object.
    Put { collection: String, json: String },
    Delete { collection: String, id: String },
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    /// Write one user's data to a JSON file.
    Export {
        path: PathBuf,
        #[arg(long)]
        user: Option<String>,
    },
    /// Replace one user's data with a backup file.
    Import {
        path: PathBuf,
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    /// Link a folder and reconcile with it.
    Link { dir: PathBuf },
    /// Forget the linked folder. Its file is left in place.
    Unlink,
    /// Import the folder's file into the local database.
    Pull,
    /// Write the local database to the folder.
    Push,
    /// Stay running: reconcile periodically and propagate local changes.
    Watch {
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> AppResult<i32> {
    let mut config = AppConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config.log_dir = Some(dir.join("logs"));
        config.data_dir = dir;
    }
    logging::init(config.log_dir.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    runtime.block_on(dispatch(config, cli.command))
}

async fn dispatch(config: AppConfig, command: Commands) -> AppResult<i32> {
    let fs: Arc<dyn Filesystem> = match &command {
        Commands::Sync(SyncCommand::Link { dir }) => Arc::new(LocalFilesystem::with_selection(dir)),
        _ => Arc::new(LocalFilesystem::new()),
    };
    let state = AppState::bootstrap(config, fs).await?;

    let result = match command {
        Commands::Status { json } => {
            pull_linked(&state).await?;
            status(&state, json).await
        }
        Commands::Users(cmd) => {
            pull_linked(&state).await?;
            users(&state, cmd).await
        }
        Commands::Records(cmd) => {
            pull_linked(&state).await?;
            records(&state, cmd).await
        }
        Commands::Backup(cmd) => {
            pull_linked(&state).await?;
            backup_command(&state, cmd).await
        }
        Commands::Sync(cmd) => sync(&state, cmd).await,
    };
    state.shutdown().await;
    result
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

fn report_outcome(outcome: &SyncOutcome) -> AppResult<()> {
    if *outcome == SyncOutcome::PermissionLost {
        eprintln!("Access to the sync folder was lost; link it again with `libretto sync link`.");
    }
    print_json(outcome)
}

/// Bring in other devices' changes before acting on local data.
async fn pull_linked(state: &AppState) -> AppResult<()> {
    if state.sync.persisted_handle().is_none() {
        return Ok(());
    }
    let outcome = state.sync.reconcile_on_load().await?;
    if outcome == SyncOutcome::PermissionLost {
        eprintln!("Access to the sync folder was lost; continuing with local data only.");
    }
    Ok(())
}

/// Mirror a local mutation to the linked folder, if any.
async fn push_linked(state: &AppState) -> AppResult<()> {
    if matches!(state.sync.state(), SyncState::Linked { .. }) {
        state.sync.propagate_now().await?;
    }
    Ok(())
}

async fn status(state: &AppState, as_json: bool) -> AppResult<i32> {
    let store = state.engine.status().await?;
    let active = state.partition.active_user().await?;
    let folder = state.sync.persisted_handle().map(|h| h.location);
    if as_json {
        print_json(&json!({
            "store": store,
            "activeUser": active,
            "syncFolder": folder,
            "syncState": state.sync.state().label(),
        }))?;
        return Ok(0);
    }

    println!("Database     : {}", store.path.as_deref().unwrap_or(":memory:"));
    println!("Schema       : {}", store.schema_version.as_deref().unwrap_or("-"));
    println!("Active user  : {} ({})", active.display_name, active.id);
    println!("Sync folder  : {}", folder.as_deref().unwrap_or("not linked"));
    println!("\n{:<12} {:>8}", "Collection", "Records");
    for (name, count) in &store.counts {
        println!("{name:<12} {count:>8}");
    }
    Ok(0)
}

async fn users(state: &AppState, command: UsersCommand) -> AppResult<i32> {
    let partition = &state.partition;
    match command {
        UsersCommand::List => {
            let active = partition.active_id();
            for user in partition.list_users().await? {
                let marker = if active.as_deref() == Some(user.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{marker} {:<36} {:<24} {}",
                    user.id, user.display_name, user.created_at
                );
            }
            return Ok(0);
        }
        UsersCommand::Add { name, color } => {
            let user = partition.create_user(&name, color).await?;
            println!("{}", user.id);
        }
        UsersCommand::Switch { id } => {
            if !partition.switch_user(&id).await? {
                eprintln!("Error: [USERS/NOT_FOUND] No user with id {id}.");
                return Ok(1);
            }
            println!("Active user is now {id}.");
        }
        UsersCommand::Rename { id, name } => {
            let user = partition.rename_user(&id, &name).await?;
            println!("Renamed {} to {}.", user.id, user.display_name);
        }
        UsersCommand::Delete { id } => {
            partition.delete_user(&id).await?;
            println!("Deleted user {id}.");
        }
    }
    push_linked(state).await?;
    Ok(0)
}

fn parse_collection(raw: &str) -> AppResult<Collection> {
    raw.parse::<Collection>().map_err(|_| {
        AppError::new("RECORDS/UNKNOWN_COLLECTION", format!("Unknown collection: {raw}"))
    })
}

async fn records(state: &AppState, command: RecordsCommand) -> AppResult<i32> {
    let ledger = state.partition.ledger();
    match command {
        RecordsCommand::List { collection } => {
            let collection = parse_collection(&collection)?;
            let records = match collection {
                Collection::Users => state
                    .partition
                    .list_users()
                    .await?
                    .into_iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()?,
                Collection::Config => ledger
                    .config
                    .current()?
                    .into_iter()
                    .map(|r| r.into_value())
                    .collect(),
                other => ledger
                    .accessor(other)
                    .map(|a| a.list())
                    .transpose()?
                    .unwrap_or_default()
                    .into_iter()
                    .map(|r| r.into_value())
                    .collect(),
            };
            print_json(&records)?;
            return Ok(0);
        }
        RecordsCommand::Put { collection, json } => {
            let collection = parse_collection(&collection)?;
            let value: Value = serde_json::from_str(&json)?;
            let saved = match collection {
                Collection::Config => ledger.config.save(value).await?,
                Collection::Users => return Err(users_not_writable()),
                other => match ledger.accessor(other) {
                    Some(accessor) => accessor.save(value).await?,
                    None => return Err(users_not_writable()),
                },
            };
            print_json(&saved.to_value())?;
        }
        RecordsCommand::Delete { collection, id } => {
            let collection = parse_collection(&collection)?;
            let Some(accessor) = ledger.accessor(collection) else {
                return Err(users_not_writable());
            };
            if !accessor.delete(&id).await? {
                eprintln!("Error: [RECORDS/NOT_FOUND] No {collection} record with id {id}.");
                return Ok(1);
            }
            println!("Deleted {collection}/{id}.");
        }
    }
    push_linked(state).await?;
    Ok(0)
}

fn users_not_writable() -> AppError {
    AppError::new(
        "RECORDS/READ_ONLY",
        "Use `libretto users` to manage users; config is edited with `records put config`.",
    )
}

async fn backup_command(state: &AppState, command: BackupCommand) -> AppResult<i32> {
    let active = state.partition.active_id();
    let resolve = |user: Option<String>| {
        user.or_else(|| active.clone())
            .ok_or_else(|| AppError::new("USERS/NOT_READY", "No active user."))
    };
    match command {
        BackupCommand::Export { path, user } => {
            let user_id = resolve(user)?;
            let snapshot = backup::export_backup(&state.engine, &user_id).await?;
            backup::write_backup(&path, &snapshot).await?;
            println!(
                "Exported {} records for {user_id} to {}.",
                snapshot.record_count(),
                path.display()
            );
        }
        BackupCommand::Import { path, user } => {
            let user_id = resolve(user)?;
            let snapshot = backup::read_backup(&path).await?;
            let summary = backup::import_backup(&state.partition, &user_id, &snapshot).await?;
            println!("Imported {} records into {}.", summary.records, summary.user_id);
            push_linked(state).await?;
        }
    }
    Ok(0)
}

async fn sync(state: &AppState, command: SyncCommand) -> AppResult<i32> {
    let sync = &state.sync;
    match command {
        SyncCommand::Link { .. } => {
            let outcome = sync.select_folder().await?;
            report_outcome(&outcome)?;
            Ok(i32::from(outcome == SyncOutcome::PermissionLost))
        }
        SyncCommand::Unlink => {
            sync.unlink()?;
            println!("Sync folder unlinked.");
            Ok(0)
        }
        SyncCommand::Pull => {
            let outcome = sync.reconcile_on_load().await?;
            report_outcome(&outcome)?;
            Ok(0)
        }
        SyncCommand::Push => {
            if !sync.attach().await? {
                eprintln!("No sync folder linked.");
                return Ok(1);
            }
            report_outcome(&sync.propagate_now().await?)?;
            Ok(0)
        }
        SyncCommand::Watch { interval_secs } => {
            report_outcome(&state.start_sync().await?)?;
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        match sync.reconcile_on_focus().await {
                            Ok(SyncOutcome::Skipped) | Ok(SyncOutcome::NoFolder) => {}
                            Ok(outcome) => report_outcome(&outcome)?,
                            Err(err) => eprintln!("Error: {}", AppError::from(err)),
                        }
                    }
                }
            }
            Ok(0)
        }
    }
}
