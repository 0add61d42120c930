use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use gemhub::discovery::{DiscoveryConfig, DiscoveryEngine, DiscoverySnapshot};
use gemhub::filesystem;
use gemhub::launcher::{LaunchRequest, LauncherConfig, LauncherEngine};
use gemhub::monitor::{IdleMonitorConfig, IdleShutdownMonitor};
use gemhub::process::{CommandRunner, SystemRunner};
use gemhub::reclaim::{WorktreeConfig, WorktreeReclaimer};
use gemhub::session::{SessionController, StopOutcome};

const APP_NAME: &str = "gemhub";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext) -> Result<()> {
    handle_serve(&ctx).await
}

#[tokio::main]
async fn async_status(ctx: RuntimeContext) -> Result<()> {
    handle_status(&ctx).await
}

#[tokio::main]
async fn async_launch(ctx: RuntimeContext, cmd: LaunchCommand) -> Result<()> {
    handle_launch(&ctx, cmd).await
}

#[tokio::main]
async fn async_stop(ctx: RuntimeContext, cmd: StopCommand) -> Result<()> {
    handle_stop(&ctx, cmd).await
}

#[tokio::main]
async fn async_browse(ctx: RuntimeContext, cmd: BrowseCommand) -> Result<()> {
    handle_browse(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.paths.config_file.display());

    match cli.command {
        Command::Serve => async_serve(ctx),
        Command::Status => async_status(ctx),
        Command::Launch(cmd) => async_launch(ctx, cmd),
        Command::Stop(cmd) => async_stop(ctx, cmd),
        Command::Browse(cmd) => async_browse(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Gemini Hub - operator dashboard engine for ephemeral dev sessions.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the hub engine (background reconcilers) until terminated
    Serve,
    /// Print the current unified session list
    Status,
    /// Launch a new session in a project directory
    Launch(LaunchCommand),
    /// Stop a running session by id
    Stop(StopCommand),
    /// List subdirectories of a path inside the workspace roots
    Browse(BrowseCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct LaunchCommand {
    /// Project directory to launch from
    #[arg(value_name = "PATH")]
    project_path: String,
    /// Config profile name under the host config root
    #[arg(long, value_name = "NAME")]
    profile: Option<String>,
    /// Session type (cli, bash, ...)
    #[arg(long = "type", value_name = "TYPE", default_value = "cli")]
    session_type: String,
    /// Task to hand to the session
    #[arg(long, value_name = "TEXT")]
    task: Option<String>,
    /// Run the task interactively
    #[arg(short = 'i', long)]
    interactive: bool,
    /// Image variant (standard, preview)
    #[arg(long, value_name = "VARIANT", default_value = "standard")]
    image_variant: String,
    /// Custom image, takes precedence over the variant
    #[arg(long, value_name = "IMAGE")]
    image: Option<String>,
    /// Disable docker-in-session support
    #[arg(long = "no-docker")]
    no_docker: bool,
    /// Disable the in-session IDE
    #[arg(long = "no-ide")]
    no_ide: bool,
    /// Launch into a fresh git worktree
    #[arg(long)]
    worktree: bool,
    /// Name for the worktree
    #[arg(long, value_name = "NAME")]
    worktree_name: Option<String>,
    /// Extra arguments passed through to the container runtime
    #[arg(long, value_name = "ARGS")]
    docker_args: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct StopCommand {
    /// Session id (hostname) to stop
    session_id: String,
}

#[derive(Debug, Clone, Args)]
struct BrowseCommand {
    /// Directory to list
    path: String,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    hub: HubSettings,
    worktree: WorktreeSettings,
    monitor: MonitorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
    file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Workspace and external tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct HubSettings {
    /// Allowed workspace roots for browsing and launching.
    roots: Vec<String>,
    /// Directory of launcher config profiles.
    host_config_root: Option<String>,
    /// Value to rebind HOME to in launched sessions.
    host_home: Option<String>,
    /// Remote auth secret handed to the launcher via its environment.
    vpn_auth_key: String,
    /// Session launcher binary.
    launcher_bin: String,
    /// Container runtime binary.
    container_bin: String,
    /// VPN daemon CLI binary.
    vpn_bin: String,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            host_config_root: None,
            host_home: None,
            vpn_auth_key: String::new(),
            launcher_bin: "gemini-toolbox".to_string(),
            container_bin: "docker".to_string(),
            vpn_bin: "tailscale".to_string(),
        }
    }
}

/// Worktree reclamation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct WorktreeSettings {
    root: String,
    prune_enabled: bool,
    branch_expiry_days: u64,
    headless_expiry_days: u64,
    orphan_expiry_days: u64,
    git_bin: String,
}

impl Default for WorktreeSettings {
    fn default() -> Self {
        let defaults = WorktreeConfig::default();
        Self {
            root: defaults.root,
            prune_enabled: defaults.prune_enabled,
            branch_expiry_days: defaults.branch_expiry_days,
            headless_expiry_days: defaults.headless_expiry_days,
            orphan_expiry_days: defaults.orphan_expiry_days,
            git_bin: defaults.git_bin,
        }
    }
}

/// Idle shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct MonitorSettings {
    auto_shutdown: bool,
    idle_timeout_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        let defaults = IdleMonitorConfig::default();
        Self {
            auto_shutdown: defaults.auto_shutdown,
            idle_timeout_secs: defaults.idle_timeout_secs,
        }
    }
}

/// Engine assembly shared by every command that talks to external tools.
struct Engines {
    discovery: DiscoveryEngine,
    launcher: LauncherEngine,
    sessions: SessionController,
    reclaimer: WorktreeReclaimer,
    /// Roots used for browsing: workspace roots plus the worktree root.
    browse_roots: Vec<String>,
}

fn build_engines(ctx: &RuntimeContext) -> Result<Engines> {
    let hub = &ctx.config.hub;

    let mut roots = Vec::with_capacity(hub.roots.len());
    for root in &hub.roots {
        roots.push(expand_str_path(root)?.display().to_string());
    }

    if hub.vpn_auth_key.is_empty() {
        warn!("vpn_auth_key is not set; launched sessions cannot join the mesh");
    }

    let worktree_root = if ctx.config.worktree.root.is_empty() {
        None
    } else {
        Some(expand_str_path(&ctx.config.worktree.root)?.display().to_string())
    };

    let mut browse_roots = roots.clone();
    if let Some(ref root) = worktree_root {
        browse_roots.push(root.clone());
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    let discovery = DiscoveryEngine::new(
        runner.clone(),
        DiscoveryConfig {
            container_bin: hub.container_bin.clone(),
            vpn_bin: hub.vpn_bin.clone(),
        },
    );

    let launcher = LauncherEngine::new(
        runner.clone(),
        LauncherConfig {
            launcher_bin: hub.launcher_bin.clone(),
            roots,
            host_config_root: hub.host_config_root.clone(),
            host_home: hub.host_home.clone(),
            vpn_auth_key: hub.vpn_auth_key.clone(),
        },
    );

    let sessions = SessionController::new(runner.clone(), hub.container_bin.clone());

    let reclaimer = WorktreeReclaimer::new(
        runner,
        WorktreeConfig {
            root: worktree_root.unwrap_or_default(),
            prune_enabled: ctx.config.worktree.prune_enabled,
            branch_expiry_days: ctx.config.worktree.branch_expiry_days,
            headless_expiry_days: ctx.config.worktree.headless_expiry_days,
            orphan_expiry_days: ctx.config.worktree.orphan_expiry_days,
            git_bin: ctx.config.worktree.git_bin.clone(),
        },
    );

    Ok(Engines {
        discovery,
        launcher,
        sessions,
        reclaimer,
        browse_roots,
    })
}

async fn handle_serve(ctx: &RuntimeContext) -> Result<()> {
    info!("Starting hub engine...");
    let engines = build_engines(ctx)?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = Vec::new();

    if ctx.config.worktree.prune_enabled {
        let reclaimer = engines.reclaimer.clone();
        tasks.push(tokio::spawn(reclaimer.run(shutdown_tx.subscribe())));
    } else {
        info!("Worktree pruning disabled");
    }

    if ctx.config.monitor.auto_shutdown {
        let monitor = IdleShutdownMonitor::new(
            engines.discovery.clone(),
            IdleMonitorConfig {
                auto_shutdown: true,
                idle_timeout_secs: ctx.config.monitor.idle_timeout_secs,
            },
        );
        tasks.push(tokio::spawn(monitor.run(shutdown_tx.subscribe())));
    } else {
        info!("Auto-shutdown disabled");
    }

    let snapshot = engines.discovery.snapshot().await;
    tracing::info!(sessions = snapshot.sessions.len(), "initial discovery pass");

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(());
    for task in tasks {
        let _ = task.await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_status(ctx: &RuntimeContext) -> Result<()> {
    let engines = build_engines(ctx)?;
    let snapshot = engines.discovery.snapshot().await;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("serializing status to JSON")?
        );
    } else if ctx.common.yaml {
        println!(
            "{}",
            serde_yaml::to_string(&snapshot).context("serializing status to YAML")?
        );
    } else {
        print_status_table(&snapshot);
    }

    Ok(())
}

fn print_status_table(snapshot: &DiscoverySnapshot) {
    if snapshot.sessions.is_empty() {
        println!("No sessions found");
        return;
    }

    println!(
        "{:<36} {:<20} {:<10} {:>6} {:>6} {:>5} {}",
        "NAME", "PROJECT", "TYPE", "ONLINE", "LOCAL", "VPN", "ADDRESS"
    );
    println!("{}", "-".repeat(100));
    for session in &snapshot.sessions {
        let yn = |b: bool| if b { "yes" } else { "no" };
        let address = session
            .local_url
            .as_deref()
            .or(session.vpn_address.as_deref())
            .unwrap_or("-");
        println!(
            "{:<36} {:<20} {:<10} {:>6} {:>6} {:>5} {}",
            session.name,
            session.project,
            session.session_type,
            yn(session.online),
            yn(session.is_local),
            yn(session.has_vpn),
            address
        );
    }
    println!();
    println!("Total: {} session(s)", snapshot.sessions.len());
}

async fn handle_launch(ctx: &RuntimeContext, cmd: LaunchCommand) -> Result<()> {
    let engines = build_engines(ctx)?;

    let request = LaunchRequest {
        project_path: cmd.project_path,
        config_profile: cmd.profile,
        session_type: cmd.session_type,
        task: cmd.task,
        interactive: cmd.interactive,
        image_variant: cmd.image_variant,
        docker_enabled: !cmd.no_docker,
        ide_enabled: !cmd.no_ide,
        worktree_mode: cmd.worktree,
        worktree_name: cmd.worktree_name,
        custom_image: cmd.image,
        docker_args: cmd.docker_args,
    };

    let outcome = engines.launcher.launch(&request).await?;

    if ctx.common.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.command);
        if !outcome.stdout.is_empty() {
            print!("{}", outcome.stdout);
        }
        if !outcome.stderr.is_empty() {
            eprint!("{}", outcome.stderr);
        }
    }

    if outcome.exit_code != 0 {
        return Err(anyhow!("launch failed with exit code {}", outcome.exit_code));
    }
    Ok(())
}

async fn handle_stop(ctx: &RuntimeContext, cmd: StopCommand) -> Result<()> {
    let engines = build_engines(ctx)?;
    let outcome = engines.sessions.stop(&cmd.session_id).await?;

    if ctx.common.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return match outcome {
            StopOutcome::Success { .. } => Ok(()),
            StopOutcome::Error { error, .. } => Err(anyhow!(error)),
        };
    }

    match outcome {
        StopOutcome::Success { session_id } => {
            println!("Stopped session {}", session_id);
            Ok(())
        }
        StopOutcome::Error { error, returncode } => {
            Err(anyhow!("stop failed ({}): {}", returncode, error))
        }
    }
}

async fn handle_browse(ctx: &RuntimeContext, cmd: BrowseCommand) -> Result<()> {
    let engines = build_engines(ctx)?;
    let listing = filesystem::browse(Path::new(&cmd.path), &engines.browse_roots).await?;

    if ctx.common.json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        for name in &listing.directories {
            println!("{}", name);
        }
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }

    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix().as_str())
                .separator("__")
                .try_parsing(true)
                .list_separator(":")
                .with_list_parse_key("hub.roots"),
        )
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
