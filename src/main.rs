use anyhow::{bail, Context, Result};
use chrono::Utc;
use scriptgate::config::{Settings, SettingsStore};
use scriptgate::discovery::discover;
use scriptgate::launcher::{Launcher, INVOKE_COMMAND};
use scriptgate::process::{count_requests, DispatcherState, StartOutcome, Supervisor, SupervisorOptions};
use scriptgate::reconcile::{self, ProcessMatch};
use scriptgate::routes::{LauncherSpec, RouteTable};
use scriptgate::status::{StatusSnapshot, StatusTicker};
use scriptgate::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Settings file used when `--config` is not given
const DEFAULT_CONFIG: &str = "scriptgate.toml";

/// How often the console advances its status line
const STATUS_INTERVAL: Duration = Duration::from_secs(3);

/// CLI commands
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Serve,
    Console,
    Invoke { relative_path: String },
    Routes,
    Status { json: bool },
    Settings,
    SettingsSet { key: String, value: String },
    SettingsUnset { key: String },
    Help,
    Version,
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config: PathBuf,
    command: Command,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("Run '{} help' for usage.", PKG_NAME);
            std::process::exit(2);
        }
    };

    init_tracing(&cli.command);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing(command: &Command) {
    // The launcher's stdout is the HTTP response; keep it quiet and off stdout
    let default = match command {
        Command::Invoke { .. } => "scriptgate=warn",
        _ => "scriptgate=info",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config = None;
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" if rest.is_empty() => {
                let path = iter.next().context("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            _ => rest.push(arg.clone()),
        }
    }

    Ok(Cli {
        config: config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG)),
        command: parse_command(&rest)?,
    })
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };

    let command = match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "serve" => Command::Serve,
        "console" => Command::Console,
        "invoke" => {
            let relative_path = args.get(1).context("invoke requires an endpoint path")?;
            Command::Invoke {
                relative_path: relative_path.clone(),
            }
        }
        "routes" => Command::Routes,
        "status" => Command::Status {
            json: args[1..].iter().any(|a| a == "--json"),
        },
        "settings" | "config" => match args.get(1).map(String::as_str) {
            None | Some("show") => Command::Settings,
            Some("set") => {
                let (Some(key), Some(value)) = (args.get(2), args.get(3)) else {
                    bail!("usage: settings set <key> <value>");
                };
                Command::SettingsSet {
                    key: key.clone(),
                    value: value.clone(),
                }
            }
            Some("unset") => {
                let key = args.get(2).context("usage: settings unset <key>")?;
                Command::SettingsUnset { key: key.clone() }
            }
            Some(other) => bail!("unknown settings command '{}'", other),
        },
        other => bail!("unknown command '{}'", other),
    };
    Ok(command)
}

async fn run(cli: Cli) -> Result<i32> {
    // Absolute, so the dispatcher can hand it back to the launcher from any directory
    let config_path = if cli.config.is_absolute() {
        cli.config
    } else {
        std::env::current_dir()
            .context("cannot determine the current directory")?
            .join(cli.config)
    };

    match cli.command {
        Command::Help => {
            print_help();
            Ok(0)
        }
        Command::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            Ok(0)
        }
        Command::Invoke { relative_path } => {
            let settings = SettingsStore::load(&config_path).resolved();
            Ok(Launcher::from_settings(&settings)
                .invoke_from_env(&relative_path)
                .await)
        }
        Command::Serve => serve(build_supervisor(&config_path)?).await,
        Command::Console => console(build_supervisor(&config_path)?).await,
        Command::Routes => {
            let supervisor = build_supervisor(&config_path)?;
            print_routes(&supervisor)?;
            Ok(0)
        }
        Command::Status { json } => {
            let snapshot = external_status(&SettingsStore::load(&config_path));
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_status(&snapshot);
            }
            Ok(0)
        }
        Command::Settings => {
            let store = SettingsStore::load(&config_path);
            println!("# {}", store.path().display());
            print!("{}", toml::to_string(&store.get())?);
            Ok(0)
        }
        Command::SettingsSet { key, value } => {
            let store = SettingsStore::load(&config_path);
            let mut settings = store.get();
            settings.set(&key, &value)?;
            store
                .save(settings)
                .with_context(|| format!("settings not saved to {}", store.path().display()))?;
            println!("{} = {}", key, value);
            Ok(0)
        }
        Command::SettingsUnset { key } => {
            let store = SettingsStore::load(&config_path);
            let mut settings = store.get();
            settings.unset(&key)?;
            store
                .save(settings)
                .with_context(|| format!("settings not saved to {}", store.path().display()))?;
            println!("{} reset to default", key);
            Ok(0)
        }
    }
}

fn build_supervisor(config_path: &Path) -> Result<Arc<Supervisor>> {
    let store = Arc::new(SettingsStore::load(config_path));
    let program = std::env::current_exe().context("cannot locate the scriptgate executable")?;
    let launcher = LauncherSpec::new(program).with_args(vec![
        "--config".to_string(),
        config_path.to_string_lossy().into_owned(),
        INVOKE_COMMAND.to_string(),
    ]);
    Ok(Supervisor::new(store, launcher, SupervisorOptions::default()))
}

/// Run the dispatcher in the foreground until Ctrl+C, SIGTERM or a crash
async fn serve(supervisor: Arc<Supervisor>) -> Result<i32> {
    print_startup_banner(&supervisor.settings().resolved());

    match supervisor.start().await {
        Ok(StartOutcome::Started { pid }) => info!(pid, "Serving endpoints"),
        Ok(StartOutcome::AlreadyRunning) => {}
        Err(e) => {
            supervisor.shutdown().await;
            return Err(e).context("dispatcher failed to start");
        }
    }
    if let Err(e) = print_routes(&supervisor) {
        warn!(error = %e, "Could not list routes");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);

    let code = loop {
        tokio::select! {
            _ = &mut shutdown => break 0,
            _ = ticker.tick() => {
                let snapshot = supervisor.status();
                if snapshot.state == DispatcherState::Failed {
                    error!(reason = ?snapshot.failure, "Dispatcher died, exiting");
                    break 1;
                }
            }
        }
    };

    supervisor.shutdown().await;
    Ok(code)
}

/// Interactive front-end reading commands from stdin
async fn console(supervisor: Arc<Supervisor>) -> Result<i32> {
    let settings = supervisor.settings().get();
    println!(
        "{} {} console. Commands: start, stop, toggle, status, routes, quit",
        PKG_NAME, VERSION
    );

    if settings.auto_start {
        let _ = supervisor.spawn_start();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut updates = supervisor.subscribe();
    let mut ticker = StatusTicker::new();
    let mut tick = tokio::time::interval(STATUS_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read from stdin")? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "start" => {
                        let _ = supervisor.spawn_start();
                    }
                    "stop" => {
                        let _ = supervisor.spawn_stop();
                    }
                    "toggle" => {
                        if supervisor.state().is_active() {
                            let _ = supervisor.spawn_stop();
                        } else {
                            let _ = supervisor.spawn_start();
                        }
                    }
                    "status" => print_status(&supervisor.status()),
                    "routes" => {
                        if let Err(e) = print_routes(&supervisor) {
                            println!("Error: {}", e);
                        }
                    }
                    "quit" | "exit" => break,
                    other => println!("unknown command '{}'", other),
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                ticker.reset();
                println!("[{}]", ticker.next_line(&snapshot));
                if let Some(reason) = &snapshot.failure {
                    println!("  {}", reason);
                }
            }
            _ = tick.tick(), if !settings.auto_minimize => {
                let snapshot = supervisor.status();
                println!("[{}]", ticker.next_line(&snapshot));
            }
            _ = &mut shutdown => break,
        }
    }

    supervisor.shutdown().await;
    Ok(0)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// Status of a dispatcher run by another scriptgate process, from the
/// process table and its log
fn external_status(store: &SettingsStore) -> StatusSnapshot {
    let settings = store.resolved();
    let mut snapshot = StatusSnapshot::stopped(settings.port());
    snapshot.endpoint_count = discover(Path::new(&settings.endpoints_path)).len();

    let dispatchers = reconcile::find(&[ProcessMatch::executable(&settings.webhook_path)]);
    if let Some(dispatcher) = dispatchers.first() {
        snapshot.state = DispatcherState::Running;
        snapshot.pid = Some(dispatcher.pid);
        snapshot.uptime = dispatcher.run_time;
        snapshot.started_at = chrono::Duration::from_std(dispatcher.run_time)
            .ok()
            .map(|elapsed| Utc::now() - elapsed);
        snapshot.request_count = count_requests(Path::new(&settings.log_path));
    }
    snapshot
}

fn print_status(snapshot: &StatusSnapshot) {
    for line in snapshot.display_lines() {
        println!("{}", line);
    }
    if let Some(pid) = snapshot.pid {
        println!("PID {}", pid);
    }
    if let Some(reason) = &snapshot.failure {
        println!("{}", reason);
    }
}

fn print_routes(supervisor: &Supervisor) -> Result<()> {
    let settings = supervisor.settings().resolved();
    let table = supervisor.route_table()?;

    if table.is_empty() {
        println!("No endpoints under {}", settings.endpoints_path);
        return Ok(());
    }

    let base = format!("http://localhost:{}", settings.port());
    for entry in table.iter() {
        let url = RouteTable::url_for(&entry.id, settings.url_prefix.as_deref());
        println!("  {:<32} -> {}{}  ({})", entry.id, base, url, entry.relative_path);
    }
    Ok(())
}

fn print_startup_banner(settings: &Settings) {
    println!(
        r#"
  {} v{}

  Endpoints:   {}
  Dispatcher:  {}
  Port:        {}
  Hooks file:  {}
  Log file:    {}
"#,
        PKG_NAME,
        VERSION,
        settings.endpoints_path,
        settings.webhook_path,
        settings.port(),
        settings.hooks_path,
        settings.log_path,
    );
}

fn print_help() {
    println!(
        r#"
{name} - Serve a folder of scripts as webhook endpoints

USAGE:
    {name} [--config <file>] <command> [options]

COMMANDS:
    serve                    Start the dispatcher and run until Ctrl+C
    console                  Interactive start/stop console
    routes                   List endpoints and their URLs
    status [--json]          Show the dispatcher status
    settings                 Show current settings
    settings set <key> <val> Change and save a setting
    settings unset <key>     Restore a setting's default
    invoke <path>            Run one endpoint (used by the dispatcher)
    help                     Show this help
    version                  Show version

OPTIONS:
    -c, --config <file>      Settings file (default: {config})

ENVIRONMENT:
    RUST_LOG                 Log filter (default: scriptgate=info)
    WEBHOOK_PAYLOAD          Request body file, read by `invoke`

Scripts ending in .py, .sh, .bat and .ps1 under the endpoints directory
are served at /hooks/<relative path without extension>.
"#,
        name = PKG_NAME,
        config = DEFAULT_CONFIG,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_defaults_to_help() {
        let cli = parse_args(&[]).unwrap();
        assert_eq!(cli.command, Command::Help);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn test_parse_launcher_contract() {
        let cli = parse_args(&args(&["--config", "/srv/sg.toml", "invoke", "billing/charge.py"])).unwrap();
        assert_eq!(cli.config, PathBuf::from("/srv/sg.toml"));
        assert_eq!(
            cli.command,
            Command::Invoke {
                relative_path: "billing/charge.py".to_string()
            }
        );
    }

    #[test]
    fn test_config_flag_only_before_command() {
        let cli = parse_args(&args(&["invoke", "--config"])).unwrap();
        assert_eq!(
            cli.command,
            Command::Invoke {
                relative_path: "--config".to_string()
            }
        );
        assert!(parse_args(&args(&["--config"])).is_err());
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command(&args(&["serve"])).unwrap(), Command::Serve);
        assert_eq!(parse_command(&args(&["console"])).unwrap(), Command::Console);
        assert_eq!(parse_command(&args(&["routes"])).unwrap(), Command::Routes);
        assert_eq!(
            parse_command(&args(&["status", "--json"])).unwrap(),
            Command::Status { json: true }
        );
        assert_eq!(parse_command(&args(&["settings"])).unwrap(), Command::Settings);
        assert_eq!(
            parse_command(&args(&["settings", "set", "port", "8080"])).unwrap(),
            Command::SettingsSet {
                key: "port".to_string(),
                value: "8080".to_string()
            }
        );
        assert_eq!(
            parse_command(&args(&["settings", "unset", "url_prefix"])).unwrap(),
            Command::SettingsUnset {
                key: "url_prefix".to_string()
            }
        );
        assert_eq!(parse_command(&args(&["-V"])).unwrap(), Command::Version);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command(&args(&["invoke"])).is_err());
        assert!(parse_command(&args(&["settings", "set", "port"])).is_err());
        assert!(parse_command(&args(&["settings", "unset"])).is_err());
        assert!(parse_command(&args(&["launch"])).is_err());
    }
}
