pub mod models {
    pub mod realtime;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
}
pub mod local;
pub mod schema;
pub mod store;
pub mod utils;
pub mod services {
    pub mod auto_mode;
    pub mod devices;
    pub mod offline_queue;
    pub mod realtime;
    pub mod settings;
    pub mod thresholds;
    pub mod views;
}

use crate::client::RealtimeClient;
use crate::config::Config;
use crate::local::{CachedPond, FileStorage};
use crate::models::realtime::{DeviceKey, DeviceType, PondId, PondNode};
use crate::services::offline_queue::OfflineQueue;
use crate::services::realtime::{Connectivity, RealtimeService};
use crate::services::thresholds::Thresholds;
use crate::services::{devices, realtime, settings, views};
use crate::store::paths;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info, warn};
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Run,
    Status,
    Toggle { device: DeviceKey, on: bool },
    Send { device: DeviceKey, on: bool },
    Flush,
}

#[derive(Debug)]
struct Cli {
    env_file: Option<PathBuf>,
    command: Command,
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn connect_database(cfg: &Config) -> Result<PgConnection, String> {
    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");
    apply_database_migrations(&mut conn)?;
    Ok(conn)
}

fn run(command: Command) -> Result<(), String> {
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (account={}, realtime_db={}, auth={}, poll_interval={}s, http_timeout={}s, local_storage={})",
        cfg.account_id,
        cfg.realtime_db_url,
        if cfg.realtime_db_auth.is_some() { "set" } else { "none" },
        cfg.poll_interval.as_secs(),
        cfg.http_timeout.as_secs(),
        cfg.local_storage_dir.display()
    );

    let client = RealtimeClient::new(&cfg.realtime_db_url, cfg.realtime_db_auth.clone(), cfg.http_timeout);
    let mut queue = OfflineQueue::load(FileStorage::new(&cfg.local_storage_dir));

    match command {
        Command::Run => run_service(&cfg, &client, &mut queue),
        Command::Status => print_status(&cfg, &client, &queue),
        Command::Toggle { device, on } => {
            let mut connectivity = Connectivity::new();
            let online = connectivity.probe(&client, &paths::last_seen(&device.pond_id));
            match devices::toggle(&client, &mut queue, online, device.clone(), on)? {
                devices::ToggleOutcome::Written => println!("{} switched {}", device, on_off(on)),
                devices::ToggleOutcome::Queued => println!(
                    "{} queued {} ({} action(s) pending until the backend is reachable)",
                    device,
                    on_off(on),
                    queue.len()
                ),
            }
            Ok(())
        }
        Command::Send { device, on } => {
            let outcome = devices::send_with_ack(
                &client,
                &device,
                on,
                devices::ACK_TIMEOUT,
                devices::ACK_POLL_INTERVAL,
            )
            .map_err(|e| format!("sending {} to {} failed: {}", on_off(on), device, e))?;
            match outcome {
                devices::AckOutcome::Acknowledged { after } => {
                    println!("{} switched {} (acknowledged after {} ms)", device, on_off(on), after.as_millis())
                }
                devices::AckOutcome::TimedOut => {
                    println!("{} switched {} (no acknowledgement from the pond yet)", device, on_off(on))
                }
            }
            Ok(())
        }
        Command::Flush => {
            if queue.is_empty() {
                println!("No pending actions");
                return Ok(());
            }
            let report = queue.flush(&client);
            println!("Replayed {} action(s), {} still pending", report.replayed, queue.len());
            Ok(())
        }
    }
}

fn run_service(cfg: &Config, client: &RealtimeClient, queue: &mut OfflineQueue<FileStorage>) -> Result<(), String> {
    let mut conn = connect_database(cfg)?;

    info!("Syncing account settings");
    let account = settings::sync_all(&mut conn, client, queue.storage(), &cfg.account_id)?;
    if account.ponds.is_empty() {
        return Err(format!("No ponds found for account {}", cfg.account_id));
    }

    let mut service = RealtimeService::new(account.ponds.clone(), account.thresholds, account.automation);
    let probe_path = paths::last_seen(&account.ponds[0].id);
    if service.connectivity_mut().probe(client, &probe_path) && !queue.is_empty() {
        info!("Replaying {} action(s) queued while offline", queue.len());
        queue.flush(client);
    }

    info!(
        "Starting realtime loop: ponds={}, interval={}s",
        account.ponds.len(),
        cfg.poll_interval.as_secs()
    );
    let mut source = settings::DbSettings::new(&mut conn, &cfg.account_id);
    realtime::run_loop(client, queue, &mut service, &mut source, cfg.poll_interval)
}

/// Ponds and thresholds from the database when reachable, otherwise the cached
/// pond list with default thresholds.
fn status_context(cfg: &Config, queue: &OfflineQueue<FileStorage>) -> (Vec<CachedPond>, Thresholds) {
    let from_db = connect_database(cfg).and_then(|mut conn| {
        let ponds = settings::load_ponds(&mut conn, &cfg.account_id)?
            .iter()
            .map(|p| CachedPond {
                id: p.pond_id(),
                name: p.name.clone(),
            })
            .collect::<Vec<_>>();
        let thresholds = settings::load_user_settings(&mut conn, &cfg.account_id)?.thresholds();
        Ok((ponds, thresholds))
    });
    match from_db {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!("Falling back to cached ponds: {}", e);
            (local::cached_ponds(queue.storage()), Thresholds::default())
        }
    }
}

fn print_status(cfg: &Config, client: &RealtimeClient, queue: &OfflineQueue<FileStorage>) -> Result<(), String> {
    let (ponds, thresholds) = status_context(cfg, queue);
    if ponds.is_empty() {
        return Err(format!("No ponds known for account {}", cfg.account_id));
    }

    let now = utils::now_millis();
    for pond in &ponds {
        let view = match store::read::<PondNode, _>(client, &paths::pond(&pond.id)) {
            Ok(node) => views::pond_view(&pond.id, &pond.name, &node.unwrap_or_default(), &thresholds, now),
            Err(e) => {
                warn!("Pond {}: {}; showing cached state", pond.id, e);
                views::cached_pond_view(&pond.id, &pond.name, &local::cached_devices(queue.storage(), &pond.id))
            }
        };
        println!("{}", view);
    }

    if !queue.is_empty() {
        println!("Pending actions:");
        for action in queue.pending() {
            println!(
                "  {} -> {} (queued {})",
                action.device_id,
                on_off(action.value),
                utils::describe_age(action.timestamp, now)
            );
        }
    }
    Ok(())
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

fn parse_cli<I>(args: I) -> Result<Cli, String>
where
    I: IntoIterator<Item = std::ffi::OsString>,
{
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;
    let mut positional: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        let arg = arg
            .into_string()
            .map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let path = if arg == "--env-file" {
            Some(
                args.next()
                    .map(PathBuf::from)
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            )
        } else if let Some(value) = arg.strip_prefix("--env-file=") {
            if value.is_empty() {
                return Err("`--env-file` requires a path argument".to_string());
            }
            Some(PathBuf::from(value))
        } else if arg.starts_with("--") {
            return Err(format!("unrecognised argument: {}", arg));
        } else {
            positional.push(arg);
            None
        };
        if let Some(path) = path {
            if env_file.replace(path).is_some() {
                return Err("`--env-file` provided more than once".to_string());
            }
        }
    }

    let command = parse_command(&positional)?;
    Ok(Cli { env_file, command })
}

fn parse_command(words: &[String]) -> Result<Command, String> {
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    match words.as_slice() {
        [] | ["run"] => Ok(Command::Run),
        ["status"] => Ok(Command::Status),
        ["flush"] => Ok(Command::Flush),
        ["toggle", pond, device, state] => {
            let (device, on) = parse_device_switch(pond, device, state)?;
            Ok(Command::Toggle { device, on })
        }
        ["command", pond, device, state] => {
            let (device, on) = parse_device_switch(pond, device, state)?;
            Ok(Command::Send { device, on })
        }
        ["toggle" | "command", ..] => Err("usage: toggle|command POND DEVICE on|off".to_string()),
        [other, ..] => Err(format!("unknown command: {}", other)),
    }
}

fn parse_device_switch(pond: &str, device: &str, state: &str) -> Result<(DeviceKey, bool), String> {
    let device_type = device.parse::<DeviceType>()?;
    let on = match state {
        "on" | "1" => true,
        "off" | "0" => false,
        other => return Err(format!("device state must be on or off, got {}", other)),
    };
    Ok((DeviceKey::new(PondId(pond.to_string()), device_type), on))
}

fn load_env(explicit: Option<PathBuf>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        return Ok(Some(LoadedEnvFile { path, explicit: true }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if !default_path.is_file() {
        return Ok(None);
    }
    load_env_file(&default_path)?;
    Ok(Some(LoadedEnvFile {
        path: default_path,
        explicit: false,
    }))
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;

    for (index, line) in content.lines().enumerate() {
        let Some((key, value)) =
            parse_env_assignment(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        // Values already in the process environment win.
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }

    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let trimmed = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);

    let (key, raw_value) = trimmed
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let raw_value = raw_value.trim();
    let value = match raw_value.chars().next() {
        Some(quote @ ('"' | '\'')) => parse_quoted(&raw_value[1..], quote)?,
        _ => raw_value.split('#').next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}

/// Parse the rest of a quoted value. Escapes are honoured in double quotes only.
fn parse_quoted(input: &str, quote: char) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if ch == quote {
            let remainder = chars.as_str().trim();
            if remainder.is_empty() || remainder.starts_with('#') {
                return Ok(result);
            }
            return Err(format!("unexpected characters after closing {} quote", quote));
        }
        if ch == '\\' && quote == '"' {
            let escaped = chars
                .next()
                .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
            result.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            continue;
        }
        result.push(ch);
    }

    Err(format!("unterminated {} quoted value", quote))
}

fn main() {
    let cli = match parse_cli(std::env::args_os().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            eprintln!("usage: pondkeeper [--env-file PATH] [run|status|flush|toggle|command POND DEVICE on|off]");
            std::process::exit(2);
        }
    };
    let loaded_env = match load_env(cli.env_file) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "pondkeeper {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli.command) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
