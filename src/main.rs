use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{warn, Level};

use fable_core::ids::SessionId;
use fable_engine::{build_window, HistoryWindowConfig};
use fable_store::{wait_until_ready, DatabaseCell, SessionRepo, SessionStore, SettingsRepo};
use fable_telemetry::{LogFormat, TelemetryConfig, TelemetryError, TelemetryGuard};

const READY_TIMEOUT: Duration = Duration::from_secs(5);
/// Settings key holding per-module log levels, e.g. `{"fable_store": "debug"}`.
const LOG_LEVELS_KEY: &str = "log_levels";

#[derive(Parser)]
#[command(name = "fable", about = "Inspect and manage story sessions")]
struct Cli {
    /// Database file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = FormatArg::Pretty)]
    log_format: FormatArg,

    /// Per-module override such as `fable_store=debug`. Repeatable; wins over
    /// levels stored under the `log_levels` setting.
    #[arg(long = "module-level", global = true, value_parser = fable_telemetry::parse_module_level)]
    module_levels: Vec<(String, Level)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Command {
    /// Create, list, rename and delete sessions.
    #[command(subcommand)]
    Sessions(SessionsCommand),
    /// Print a session with its full turn log.
    Show { id: String },
    /// Print the history window the next generation would receive.
    Window { id: String },
    /// Read and write settings.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum SessionsCommand {
    List,
    Create { name: String },
    Rename { id: String, name: String },
    Delete { id: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print one setting, or all of them.
    Get { key: Option<String> },
    /// Store a JSON value.
    Set { key: String, value: String },
    Delete { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = fable_telemetry::init_telemetry(TelemetryConfig {
        log_level: fable_telemetry::parse_level(&cli.log_level)?,
        module_levels: cli.module_levels,
        format: match cli.log_format {
            FormatArg::Json => LogFormat::Json,
            FormatArg::Pretty => LogFormat::Pretty,
        },
    })?;

    let db_path = cli.db.unwrap_or_else(default_db_path);
    let cell = DatabaseCell::open_in_background(db_path.clone());
    let sessions = SessionRepo::with_cell(cell.clone());
    let settings = SettingsRepo::with_cell(cell);
    wait_until_ready(&sessions, READY_TIMEOUT)
        .await
        .with_context(|| format!("opening {}", db_path.display()))?;
    apply_stored_levels(&telemetry, &settings);

    match cli.command {
        Command::Sessions(cmd) => run_sessions(&sessions, cmd),
        Command::Show { id } => {
            let session = sessions
                .get_session(&SessionId::from_raw(&id))
                .with_context(|| format!("no session {id}"))?;
            print_json(&session)
        }
        Command::Window { id } => {
            let session = sessions
                .get_session(&SessionId::from_raw(&id))
                .with_context(|| format!("no session {id}"))?;
            let config = settings
                .get(HistoryWindowConfig::SETTINGS_KEY)
                .map(|v| HistoryWindowConfig::from_value(&v))
                .unwrap_or_default();
            let window = build_window(&session.turns, &config);
            print_json(&serde_json::json!({
                "config": config,
                "fragments": window.fragments,
                "stats": window.stats,
            }))
        }
        Command::Config(cmd) => run_config(&settings, cmd),
    }
}

fn run_sessions(sessions: &SessionRepo, cmd: SessionsCommand) -> anyhow::Result<()> {
    match cmd {
        SessionsCommand::List => print_json(&sessions.list_sessions()),
        SessionsCommand::Create { name } => {
            let session = sessions.create_session(&name)?;
            tracing::info!(session_id = %session.id, "session created");
            print_json(&session.listing())
        }
        SessionsCommand::Rename { id, name } => {
            sessions.rename_session(&SessionId::from_raw(id), &name)?;
            Ok(())
        }
        SessionsCommand::Delete { id } => {
            if !sessions.delete_session(&SessionId::from_raw(&id))? {
                bail!("no session {id}");
            }
            Ok(())
        }
    }
}

fn run_config(settings: &SettingsRepo, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Get { key: Some(key) } => {
            let value = settings.get(&key).with_context(|| format!("no setting {key}"))?;
            print_json(&value)
        }
        ConfigCommand::Get { key: None } => {
            let all: serde_json::Map<String, serde_json::Value> = settings.all().into_iter().collect();
            print_json(&all)
        }
        ConfigCommand::Set { key, value } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).with_context(|| format!("value for {key} is not JSON"))?;
            if key == LOG_LEVELS_KEY {
                let levels = value
                    .as_object()
                    .with_context(|| format!("{key} must be an object of module to level"))?;
                for (module, level) in levels {
                    parse_stored_level(module, level)?;
                }
            }
            if key == HistoryWindowConfig::SETTINGS_KEY {
                let config = HistoryWindowConfig::from_value(&value);
                settings.set_json(&key, &config)?;
                return print_json(&config);
            }
            settings.set(&key, &value)?;
            Ok(())
        }
        ConfigCommand::Delete { key } => {
            settings.delete(&key)?;
            Ok(())
        }
    }
}

fn parse_stored_level(module: &str, level: &serde_json::Value) -> Result<(String, Level), TelemetryError> {
    let name = level
        .as_str()
        .ok_or_else(|| TelemetryError::InvalidLevel(level.to_string()))?;
    Ok((module.to_string(), fable_telemetry::parse_level(name)?))
}

/// Apply levels saved in settings. The database opens after logging starts,
/// so these go through the live filter. Modules set on the command line keep
/// their level.
fn apply_stored_levels(telemetry: &TelemetryGuard, settings: &SettingsRepo) {
    let Some(serde_json::Value::Object(levels)) = settings.get(LOG_LEVELS_KEY) else {
        return;
    };
    let pinned: Vec<String> = telemetry.module_levels().into_iter().map(|(m, _)| m).collect();
    for (module, level) in &levels {
        if pinned.contains(module) {
            continue;
        }
        let applied = parse_stored_level(module, level)
            .and_then(|(module, level)| telemetry.set_module_level(&module, level));
        if let Err(e) = applied {
            warn!(%module, error = %e, "ignoring stored log level");
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".fable")
        .join("database")
        .join("fable.db")
}
