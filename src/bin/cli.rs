//! Bazelle CLI - keeps Bazel build files in sync with the source tree.
//!
//! Usage:
//!   bazelle daemon start             # Start the daemon in the background
//!   bazelle daemon stop              # Graceful shutdown, then SIGTERM/SIGKILL
//!   bazelle daemon status            # Is it running?
//!   bazelle watch start src --follow # Watch and print events
//!   bazelle update                   # Regenerate changed packages
//!   bazelle status                   # What changed since the last update
//!   bazelle index refresh            # Rebuild the baseline locally

use anyhow::{bail, Context, Result};
use bazelle::daemon::protocol::{
    StatusGetParams, StatusGetResult, UpdateRunParams, WatchEventParams, WatchStartParams, EVENT_SHUTDOWN,
};
use bazelle::daemon::{
    get_status, spawn_background, stop_daemon, Client, Paths, Server, ShutdownSignal, StopOutcome,
    StopTimeouts,
};
use bazelle::{App, ChangeSet};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Client commands stay quiet unless `BAZELLE_LOG` says otherwise.
const CLI_LOG_LEVEL: &str = "warn";

#[derive(Parser)]
#[command(name = "bazelle")]
#[command(about = "Bazelle - incremental BUILD file daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Workspace root (default: current directory)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Use ~/.bazelle as the daemon directory
    #[arg(long, global = true)]
    global: bool,

    /// Daemon directory, overriding the config
    #[arg(long, global = true, conflicts_with = "global")]
    daemon_dir: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// Check that the daemon answers
    Ping,

    /// Control the daemon's file watcher
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },

    /// Regenerate build files for changed packages
    Update {
        /// Restrict to these languages
        #[arg(short, long = "lang")]
        languages: Vec<String>,

        /// Run even when nothing changed
        #[arg(short, long)]
        force: bool,
    },

    /// Show what changed since the last update
    Status {
        #[arg(short, long = "lang")]
        languages: Vec<String>,
    },

    /// Work on the local baseline without the daemon
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Run in the foreground
    Run {
        /// Log to <daemon dir>/daemon.log instead of stderr
        #[arg(long)]
        log_file: bool,
    },
    /// Start in the background
    Start,
    /// Stop the running daemon
    Stop,
    /// Stop, then start again
    Restart,
    /// Show whether the daemon is running
    Status,
}

#[derive(Subcommand)]
enum WatchAction {
    /// Start watching
    Start {
        /// Directories to watch (default: workspace root)
        paths: Vec<String>,

        #[arg(short, long = "lang")]
        languages: Vec<String>,

        /// Debounce window in milliseconds
        #[arg(short, long, default_value = "0")]
        debounce: i64,

        /// Keep running and print watch events
        #[arg(short, long)]
        follow: bool,
    },
    /// Stop watching
    Stop,
    /// Show the watch state
    Status,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Full scan and replace the baseline
    Refresh {
        #[arg(short, long = "lang")]
        languages: Vec<String>,
    },
    /// Diff the workspace against the baseline
    Status {
        #[arg(short, long = "lang")]
        languages: Vec<String>,
    },
    /// Delete the baseline
    Clear,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let app = load_app(&cli)?;
    let json = cli.json;

    match &cli.command {
        Commands::Daemon {
            action: DaemonAction::Run { log_file },
        } => {
            let log = log_file.then(|| app.paths.log.clone());
            init_logging(&app.config.log.level, log.as_deref())?;
        }
        _ => init_logging(CLI_LOG_LEVEL, None)?,
    }

    match cli.command {
        Commands::Daemon { action } => daemon_command(&app, action, json),
        Commands::Ping => {
            let result = connect(&app)?.ping()?;
            output(json, &result, || {
                println!("pong (version {}, uptime {})", result.version, result.uptime)
            })
        }
        Commands::Watch { action } => watch_command(&app, action, json),
        Commands::Update { languages, force } => {
            let result = connect(&app)?.update_run(&UpdateRunParams { languages, force })?;
            output(json, &result, || {
                println!("Status: {}", result.status);
                for target in &result.targets {
                    println!("  {target}");
                }
            })
        }
        Commands::Status { languages } => {
            let params = StatusGetParams { languages };
            let result = match try_connect(&app)? {
                Some(client) => client.status_get(&params)?,
                None => {
                    let tracker = app.tracker(&params.languages)?;
                    let has_baseline = tracker.has_baseline();
                    let changes = tracker.status()?;
                    StatusGetResult {
                        stale: !changes.is_empty(),
                        has_baseline,
                        changes,
                    }
                }
            };
            output(json, &result, || {
                if !result.has_baseline {
                    println!("No baseline yet (run `bazelle update` or `bazelle index refresh`).");
                }
                if result.stale {
                    print_changes(&result.changes);
                } else {
                    println!("Up to date.");
                }
            })
        }
        Commands::Index { action } => index_command(&app, action, json),
    }
}

fn load_app(cli: &Cli) -> Result<App> {
    let app = App::load(&cli.workspace)
        .with_context(|| format!("loading workspace {}", cli.workspace.display()))?;
    if let Some(dir) = &cli.daemon_dir {
        return Ok(app.with_paths(Paths::new(dir)));
    }
    if cli.global {
        let paths = Paths::global().context("no home directory for --global")?;
        return Ok(app.with_paths(paths));
    }
    Ok(app)
}

/// One fmt subscriber; `BAZELLE_LOG` wins over the configured level.
fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_env("BAZELLE_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn run_daemon(app: App) -> Result<()> {
    let server = Server::new(Arc::new(app), ShutdownSignal::new());
    server.start()?;
    Ok(())
}

fn connect(app: &App) -> Result<Client> {
    match try_connect(app)? {
        Some(client) => Ok(client),
        None => bail!("daemon is not running (start it with `bazelle daemon start`)"),
    }
}

fn try_connect(app: &App) -> Result<Option<Client>> {
    match Client::connect(&app.paths.socket, app.config.daemon.connect_timeout()) {
        Ok(client) => Ok(Some(
            client.with_request_timeout(app.config.daemon.request_timeout()),
        )),
        Err(e) if e.is_disconnect() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn output<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}

fn print_changes(changes: &ChangeSet) {
    for path in &changes.added {
        println!("  + {path}");
    }
    for path in &changes.modified {
        println!("  ~ {path}");
    }
    for path in &changes.deleted {
        println!("  - {path}");
    }
}

// ─── daemon ─────────────────────────────────────────────────────

fn daemon_command(app: &App, action: DaemonAction, json: bool) -> Result<()> {
    let timeouts = StopTimeouts {
        connect: app.config.daemon.connect_timeout(),
        ..StopTimeouts::default()
    };

    match action {
        DaemonAction::Run { .. } => run_daemon(app.clone()),
        DaemonAction::Start => start_daemon(app),
        DaemonAction::Stop => {
            let outcome = stop_daemon(&app.paths, &timeouts, &mut |line: &str| println!("{line}"))?;
            report_stop(outcome);
            Ok(())
        }
        DaemonAction::Restart => {
            let outcome = stop_daemon(&app.paths, &timeouts, &mut |line: &str| println!("{line}"))?;
            report_stop(outcome);
            start_daemon(app)
        }
        DaemonAction::Status => {
            let status = get_status(Some(&app.paths));
            let ping = if status.running {
                try_connect(app)?.and_then(|c| c.ping().ok())
            } else {
                None
            };
            let report = serde_json::json!({
                "running": status.running,
                "pid": status.pid,
                "stale": status.stale,
                "socket": app.paths.socket,
                "version": ping.as_ref().map(|p| p.version.clone()),
                "uptime": ping.as_ref().map(|p| p.uptime.clone()),
            });
            output(json, &report, || {
                if status.running {
                    println!("Daemon running (pid {})", status.pid);
                    if let Some(p) = &ping {
                        println!("  version {}, uptime {}", p.version, p.uptime);
                    }
                    println!("  socket {}", app.paths.socket.display());
                } else if status.stale {
                    println!("Daemon not running (stale PID file for pid {})", status.pid);
                } else {
                    println!("Daemon not running");
                }
            })
        }
    }
}

fn start_daemon(app: &App) -> Result<()> {
    let status = get_status(Some(&app.paths));
    if status.running {
        println!("Daemon already running (pid {})", status.pid);
        return Ok(());
    }
    let pid = spawn_background(app)?;
    println!("Daemon started (pid {pid})");
    println!("  log {}", app.paths.log.display());
    Ok(())
}

fn report_stop(outcome: StopOutcome) {
    match outcome {
        StopOutcome::NotRunning => println!("Daemon not running"),
        StopOutcome::Graceful => println!("Daemon stopped"),
        StopOutcome::Terminated => println!("Daemon stopped (SIGTERM)"),
        StopOutcome::Killed => println!("Daemon killed (SIGKILL)"),
    }
}

// ─── watch ──────────────────────────────────────────────────────

fn watch_command(app: &App, action: WatchAction, json: bool) -> Result<()> {
    let client = connect(app)?;
    match action {
        WatchAction::Start {
            paths,
            languages,
            debounce,
            follow,
        } => {
            let events = if follow { client.subscribe_events()? } else { None };
            let result = client.watch_start(&WatchStartParams {
                paths,
                languages,
                debounce_ms: debounce,
            })?;
            output(json, &result, || {
                println!("Watch {}: {}", result.status, result.paths.join(", "))
            })?;

            let Some(events) = events else {
                return Ok(());
            };
            for note in events.iter() {
                let event: WatchEventParams = match note.parse_params() {
                    Ok(event) => event,
                    Err(e) => {
                        eprintln!("Ignoring malformed event: {e}");
                        continue;
                    }
                };
                print_event(&event, json)?;
                if event.event_type == EVENT_SHUTDOWN {
                    break;
                }
            }
            Ok(())
        }
        WatchAction::Stop => {
            let result = client.watch_stop()?;
            output(json, &result, || println!("Watch {}", result.status))
        }
        WatchAction::Status => {
            let result = client.watch_status()?;
            output(json, &result, || {
                if !result.watching {
                    println!("Not watching");
                    return;
                }
                println!("Watching: {}", result.paths.join(", "));
                if !result.languages.is_empty() {
                    println!("  languages {}", result.languages.join(", "));
                }
                println!("  updates {}", result.update_count);
                if let Some(t) = &result.update_time {
                    println!("  last update {t}");
                }
            })
        }
    }
}

fn print_event(event: &WatchEventParams, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event.message.as_deref() {
        Some(message) => println!("[{}] {}: {}", event.time, event.event_type, message),
        None => println!("[{}] {} {}", event.time, event.event_type, event.targets.join(" ")),
    }
    Ok(())
}

// ─── index ──────────────────────────────────────────────────────

fn index_command(app: &App, action: IndexAction, json: bool) -> Result<()> {
    match action {
        IndexAction::Refresh { languages } => {
            let tracker = app.tracker(&languages)?;
            let changes = tracker.refresh()?;
            output(json, &changes, || {
                println!("Baseline refreshed ({} changed)", changes.len());
                print_changes(&changes);
            })
        }
        IndexAction::Status { languages } => {
            let changes = app.tracker(&languages)?.status()?;
            output(json, &changes, || {
                if changes.is_empty() {
                    println!("Up to date.");
                } else {
                    print_changes(&changes);
                    println!("Targets: {}", changes.as_targets().join(" "));
                }
            })
        }
        IndexAction::Clear => {
            app.tracker(&[])?.clear()?;
            if !json {
                println!("Baseline cleared");
            }
            Ok(())
        }
    }
}
