use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dirsave_core::config::{add_job, load_settings, remove_job, save_settings, validate_settings};
use dirsave_core::process_gate::spawn_blacklist_poller;
use dirsave_core::run_log::open_daily_log;
use dirsave_core::{
    APP_NAME, ConfigHandle, JobDefinition, JobEvent, JobState, JsonStateFile, Orchestrator,
    RunReport, StateAggregator,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const BLACKLIST_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "dirsave")]
#[command(about = "DirSave CLI (directory backup jobs)", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    Jobs {
        #[command(subcommand)]
        cmd: JobsCmd,
    },
    /// Runs jobs by name, 1-based index, or range ("1-3", "1,3", "docs").
    Run { selection: String },
    /// Prints the last persisted job states.
    Status,
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
}

#[derive(Subcommand)]
enum JobsCmd {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        source: String,
        #[arg(long)]
        destination: String,
        /// Complete (full mirror) or Differential.
        #[arg(long, default_value = "Differential")]
        kind: String,
    },
    Remove {
        name: String,
    },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("DIRSAVE_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("DIRSAVE_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
        },
        Command::Jobs { cmd } => match cmd {
            JobsCmd::List => jobs_list(&config_dir, cli.json),
            JobsCmd::Add {
                name,
                source,
                destination,
                kind,
            } => jobs_add(
                &config_dir,
                JobDefinition {
                    name,
                    source,
                    destination,
                    kind,
                },
                cli.json,
            ),
            JobsCmd::Remove { name } => jobs_remove(&config_dir, &name, cli.json),
        },
        Command::Run { selection } => {
            run_jobs(&config_dir, &data_dir, &selection, cli.json, cli.events).await
        }
        Command::Status => status_get(&data_dir, cli.json),
    }
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = toml::to_string(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn jobs_list(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "jobs": settings.jobs }));
        return Ok(());
    }
    for (i, job) in settings.jobs.iter().enumerate() {
        println!(
            "{} {} kind={} source={} destination={}",
            i + 1,
            job.name,
            job.kind,
            job.source,
            job.destination
        );
    }
    Ok(())
}

fn jobs_add(config_dir: &Path, job: JobDefinition, json: bool) -> Result<(), CliError> {
    let mut settings = load_settings(config_dir).map_err(map_core_err)?;
    let name = job.name.clone();
    add_job(&mut settings, job).map_err(map_core_err)?;
    save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "added": name, "jobs": settings.jobs.len() }));
    } else {
        println!("added={name}");
    }
    Ok(())
}

fn jobs_remove(config_dir: &Path, name: &str, json: bool) -> Result<(), CliError> {
    let mut settings = load_settings(config_dir).map_err(map_core_err)?;
    let removed = remove_job(&mut settings, name).map_err(map_core_err)?;
    save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "removed": removed.name }));
    } else {
        println!("removed={}", removed.name);
    }
    Ok(())
}

async fn run_jobs(
    config_dir: &Path,
    data_dir: &Path,
    selection: &str,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let _log = open_daily_log(data_dir)
        .map_err(|e| CliError::new("log.open_failed", e.to_string()))?;

    let settings = load_settings(config_dir).map_err(map_core_err)?;
    validate_settings(&settings).map_err(map_core_err)?;
    let blacklist = settings.scheduler.process_blacklist.clone();

    let aggregator = StateAggregator::new(Arc::new(JsonStateFile::in_data_dir(data_dir)));
    let orchestrator = Orchestrator::new(ConfigHandle::new(settings), aggregator);

    if events {
        orchestrator.subscribe(Arc::new(|e: &JobEvent| {
            if let Ok(line) = serde_json::to_string(e) {
                println!("{line}");
            }
        }));
    }

    let cancel = CancellationToken::new();
    let poller = spawn_blacklist_poller(
        orchestrator.process_gate().clone(),
        blacklist,
        BLACKLIST_POLL_INTERVAL,
        cancel.clone(),
    );
    let gate_watch = orchestrator.watch_process_gate();

    let interrupt = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(event = "run.interrupted", "run.interrupted");
                orchestrator.stop_all();
            }
        })
    };

    let result = orchestrator.run(selection).await;

    cancel.cancel();
    interrupt.abort();
    gate_watch.abort();
    let _ = poller.await;

    let report = result.map_err(map_core_err)?;
    print_report(&report, json, events)?;

    if !report.all_finished() {
        let outcomes = serde_json::to_value(&report.outcomes)
            .map_err(|e| CliError::new("unknown", e.to_string()))?;
        return Err(CliError::new(
            "run.incomplete",
            format!("run {} did not finish every job", report.run_id),
        )
        .with_details(serde_json::json!({ "runId": report.run_id, "outcomes": outcomes })));
    }
    Ok(())
}

fn print_report(report: &RunReport, json: bool, events: bool) -> Result<(), CliError> {
    if json || events {
        let line = serde_json::to_string(report)
            .map_err(|e| CliError::new("unknown", e.to_string()))?;
        println!("{line}");
        return Ok(());
    }

    println!("runId={}", report.run_id);
    for o in &report.outcomes {
        match &o.message {
            Some(message) => println!(
                "{} state={} priority={} message={message}",
                o.name,
                o.state.as_str(),
                o.priority
            ),
            None => println!("{} state={} priority={}", o.name, o.state.as_str(), o.priority),
        }
    }
    Ok(())
}

fn status_get(data_dir: &Path, json: bool) -> Result<(), CliError> {
    let file = JsonStateFile::in_data_dir(data_dir);
    let states = match file.read() {
        Ok(states) => states,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(CliError::new("state.read_failed", e.to_string())),
    };

    if json {
        println!("{}", serde_json::json!({ "jobs": states }));
        return Ok(());
    }
    for s in &states {
        let marker = if s.state == JobState::Running { "*" } else { " " };
        println!(
            "{marker} {} state={} progression={:.1}% filesLeft={}/{} bytesLeft={}/{}",
            s.name,
            s.state.as_str(),
            s.progression,
            s.nb_files_left_to_do,
            s.total_files_to_copy,
            s.nb_bytes_left_to_do,
            s.total_files_size
        );
    }
    Ok(())
}

fn default_config_dir() -> PathBuf {
    if let Ok(v) = std::env::var("XDG_CONFIG_HOME")
        && !v.is_empty()
    {
        return PathBuf::from(v).join(APP_NAME);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME)
}

fn default_data_dir() -> PathBuf {
    if let Ok(v) = std::env::var("XDG_DATA_HOME")
        && !v.is_empty()
    {
        return PathBuf::from(v).join(APP_NAME);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".local").join("share").join(APP_NAME)
}

fn map_core_err(e: dirsave_core::Error) -> CliError {
    use dirsave_core::Error;
    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::DuplicateJob { message } => CliError::new("job.duplicate", message),
        Error::JobNotFound { selector } => {
            CliError::new("job.not_found", format!("no job matches: {selector}"))
        }
        Error::ConnectionFailed { message } => CliError::retryable("crypto.unavailable", message),
        Error::Protocol { message } => CliError::new("crypto.protocol", message),
        Error::NotFound { path } => {
            CliError::new("path.not_found", format!("not found: {}", path.display()))
        }
        Error::Io(e) => CliError::new("io", e.to_string()),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
