use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, error, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use teamserver::api::{AppState, create_router};
use teamserver::audit::AuditRepository;
use teamserver::auth::BcryptHasher;
use teamserver::config::AppConfig;
use teamserver::db::{DEFAULT_WORKSPACE, Database};
use teamserver::ports::LogWebhook;
use teamserver::rbac::RbacRepository;
use teamserver::session::SessionRepository;
use teamserver::user::{UserInfo, UserRepository, UserService};
use teamserver::Teamserver;

const APP_NAME: &str = "teamserver";
const DATABASE_FILE: &str = "teamserver.db";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_operators(ctx: RuntimeContext, cmd: OperatorsCommand) -> Result<()> {
    handle_operators(&ctx, cmd).await
}

#[tokio::main]
async fn async_audit(ctx: RuntimeContext, cmd: AuditCommand) -> Result<()> {
    handle_audit(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Operators { command } => async_operators(ctx, command),
        Command::Audit { command } => async_audit(ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Teamserver - multi-operator session, RBAC and event hub.",
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
    /// Start the teamserver
    Serve(ServeCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage operator accounts
    Operators {
        #[command(subcommand)]
        command: OperatorsCommand,
    },
    /// Inspect the audit trail
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
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

#[derive(Debug, Subcommand)]
enum OperatorsCommand {
    /// List operator accounts
    List,
    /// Create an operator, or update its credentials
    Add(OperatorsAddCommand),
    /// Reset an operator's password and revoke their sessions
    Passwd {
        username: String,
        #[arg(long, env = "TEAMSERVER_OPERATOR_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Bind a role to an operator in a workspace
    Grant {
        username: String,
        role: String,
        #[arg(long, default_value = DEFAULT_WORKSPACE)]
        workspace: String,
    },
}

#[derive(Debug, Clone, Args)]
struct OperatorsAddCommand {
    username: String,
    /// Plaintext password (hashed before storage)
    #[arg(long, env = "TEAMSERVER_OPERATOR_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// SSO token accepted for this operator
    #[arg(long)]
    sso_token: Option<String>,
    /// Role binding as WORKSPACE:ROLE (repeatable)
    #[arg(long = "role", value_name = "WORKSPACE:ROLE")]
    roles: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    /// Show the most recent audit events of a workspace
    List {
        #[arg(long, default_value = DEFAULT_WORKSPACE)]
        workspace: String,
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },
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
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
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

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}"))
        });

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

        // The registry and the CLI log through the `log` facade.
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
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })
    }

    fn database_path(&self) -> Result<PathBuf> {
        match self.config.database.path.as_deref() {
            Some(path) => expand_str_path(path),
            None => Ok(self.paths.data_dir.join(DATABASE_FILE)),
        }
    }

    async fn open_database(&self) -> Result<Database> {
        let path = self.database_path()?;
        Database::new(&path, self.config.database.max_connections)
            .await
            .with_context(|| format!("opening database {}", path.display()))
    }

    fn print<T: serde::Serialize + fmt::Debug>(&self, value: &T) -> Result<()> {
        if self.common.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("serializing output to JSON")?
            );
        } else if self.common.yaml {
            println!(
                "{}",
                serde_yaml::to_string(value).context("serializing output to YAML")?
            );
        } else {
            println!("{value:#?}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
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

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }
    write_default_config(&ctx.paths.config_file)?;
    info!("Wrote default config to {}", ctx.paths.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.print(&ctx.config),
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

/// Services the offline subcommands work with.
struct Offline {
    users: UserService,
    rbac: RbacRepository,
    audit: AuditRepository,
}

impl Offline {
    async fn open(ctx: &RuntimeContext) -> Result<Self> {
        let db = ctx.open_database().await?;
        let pool = db.pool().clone();
        let users = UserService::new(
            UserRepository::new(pool.clone()),
            SessionRepository::new(pool.clone()),
            Arc::new(BcryptHasher::new(ctx.config.auth.bcrypt_cost)),
        );
        let rbac = RbacRepository::new(pool.clone());

        // Bindings reference roles, which are only seeded from config.
        for (name, permissions) in &ctx.config.roles {
            rbac.upsert_role(name, permissions.iter().map(String::as_str))
                .await
                .with_context(|| format!("seeding role {name}"))?;
        }

        Ok(Self {
            users,
            rbac,
            audit: AuditRepository::new(pool),
        })
    }
}

async fn handle_operators(ctx: &RuntimeContext, cmd: OperatorsCommand) -> Result<()> {
    let offline = Offline::open(ctx).await?;

    match cmd {
        OperatorsCommand::List => {
            let users: Vec<UserInfo> = offline
                .users
                .list()
                .await?
                .into_iter()
                .map(UserInfo::from)
                .collect();
            if ctx.common.json || ctx.common.yaml {
                return ctx.print(&users);
            }
            for user in users {
                let mut methods = Vec::new();
                if user.password_login {
                    methods.push("password");
                }
                if user.sso_login {
                    methods.push("sso");
                }
                println!(
                    "{:<6} {:<24} {:<26} {}",
                    user.id,
                    user.username,
                    user.created_at,
                    methods.join(",")
                );
            }
            Ok(())
        }
        OperatorsCommand::Add(add) => {
            if add.password.is_none() && add.sso_token.is_none() {
                return Err(anyhow!("--password or --sso-token is required"));
            }
            let bindings = add
                .roles
                .iter()
                .map(|binding| parse_role_binding(binding))
                .collect::<Result<Vec<_>>>()?;

            let user = offline
                .users
                .save_operator(
                    &add.username,
                    add.password.as_deref(),
                    None,
                    add.sso_token.as_deref(),
                )
                .await?;
            for (workspace, role) in bindings {
                grant(&offline.rbac, user.id, &workspace, &role).await?;
            }
            info!("Saved operator {} (id {})", user.username, user.id);
            Ok(())
        }
        OperatorsCommand::Passwd { username, password } => {
            if offline.users.get_by_username(&username).await?.is_none() {
                return Err(anyhow!("operator {username:?} not found"));
            }
            offline.users.set_password(&username, &password).await?;
            info!("Password updated for {username}; existing sessions revoked");
            Ok(())
        }
        OperatorsCommand::Grant {
            username,
            role,
            workspace,
        } => {
            let user = offline
                .users
                .get_by_username(&username)
                .await?
                .ok_or_else(|| anyhow!("operator {username:?} not found"))?;
            grant(&offline.rbac, user.id, &workspace, &role).await?;
            info!("Granted {role} in {workspace} to {username}");
            Ok(())
        }
    }
}

async fn grant(rbac: &RbacRepository, user_id: i64, workspace: &str, role: &str) -> Result<()> {
    if rbac.role(role).await?.is_none() {
        return Err(anyhow!("unknown role {role:?}"));
    }
    let workspace_id = rbac.ensure_workspace(workspace).await?;
    rbac.assign_role(user_id, role, workspace_id).await?;
    Ok(())
}

fn parse_role_binding(binding: &str) -> Result<(String, String)> {
    match binding.split_once(':') {
        Some((workspace, role)) if !workspace.is_empty() && !role.is_empty() => {
            Ok((workspace.to_string(), role.to_string()))
        }
        _ => Err(anyhow!("invalid role binding {binding:?}, expected WORKSPACE:ROLE")),
    }
}

async fn handle_audit(ctx: &RuntimeContext, cmd: AuditCommand) -> Result<()> {
    let offline = Offline::open(ctx).await?;

    match cmd {
        AuditCommand::List { workspace, limit } => {
            let ws = offline
                .rbac
                .workspace(&workspace)
                .await?
                .ok_or_else(|| anyhow!("workspace {workspace:?} not found"))?;
            let events = offline.audit.list(ws.id, limit).await?;
            if ctx.common.json || ctx.common.yaml {
                return ctx.print(&events);
            }
            for event in events.iter().rev() {
                println!(
                    "{} {:<16} {:<22} {} {}",
                    event.created_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    event.username,
                    event.action,
                    event.target,
                    serde_json::Value::Object(event.metadata.clone())
                );
            }
            Ok(())
        }
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let config = &ctx.config;
    let db = ctx.open_database().await?;

    let shutdown = CancellationToken::new();
    let server = Teamserver::start(
        db,
        config,
        Arc::new(BcryptHasher::new(config.auth.bcrypt_cost)),
        Arc::new(LogWebhook),
        shutdown.clone(),
    )
    .await
    .context("starting teamserver")?;

    for operator in &config.operators {
        if operator.roles.is_empty() {
            warn!("Operator {} has no role bindings", operator.username);
        }
    }

    let app = create_router(AppState::new(server));

    let host = cmd.host.unwrap_or_else(|| config.server.host.clone());
    let port = cmd.port.unwrap_or(config.server.port);
    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding to {host}:{port}"))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await
    .context("running server")?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM and stop background tasks.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

fn load_or_init_config(paths: &AppPaths) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }

    AppConfig::load(&paths.config_file)
        .with_context(|| format!("loading config {}", paths.config_file.display()))
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
    buffer.push_str("# Operators are added as [[operators]] tables.\n");
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
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}
