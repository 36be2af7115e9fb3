//! CLI interface for igdm - follower outreach from the terminal.

use std::env;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use env_logger::fmt::WriteStyle;
use log::{LevelFilter, debug};
use tokio_util::sync::CancellationToken;

use igdm_core::auth::{CodeKind, FileCodeSource};
use igdm_core::config::CodeSourceKind;
use igdm_core::paths::write_default_config;
use igdm_core::tasks::TASK_LOG_TARGET;
use igdm_core::{
    AppConfig, AppPaths, OutreachService, OutreachSummary, REPO_URL, SentLedger, SessionStore,
    SubmitRequest, TaskLog, TaskStatus, generate_schema, write_generated_files,
};

const APP_NAME: &str = "igdm";

fn main() -> anyhow::Result<()> {
    try_main()
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Send(cmd) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(handle_send(&ctx, cmd))
        }
        Command::Session { command } => handle_session(&ctx, command),
        Command::Ledger { command } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(handle_ledger(&ctx, command))
        }
        Command::Code(cmd) => handle_code(&ctx, &cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => {
            handle_completions(shell);
            Ok(())
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "igdm",
    author,
    version,
    about = "Follow and message the followers of target accounts",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

/// Common CLI options shared across all subcommands.
#[derive(Debug, Clone, Args)]
pub struct CommonOpts {
    /// Override the config file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,
    /// Reduce output to only errors.
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    pub quiet: bool,
    /// Increase logging verbosity (stackable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,
    /// Enable trace logging.
    #[arg(long, global = true)]
    pub trace: bool,
    /// Output machine-readable JSON.
    #[arg(long, global = true)]
    pub json: bool,
    /// Disable ANSI colors in output.
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    pub no_color: bool,
    /// Control color output.
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    pub color: ColorOption,
    /// Do not change anything on disk.
    #[arg(long = "dry-run", global = true)]
    pub dry_run: bool,
    /// Assume "yes" for interactive prompts.
    #[arg(short = 'y', long = "yes", global = true)]
    pub assume_yes: bool,
}

/// Color output mode.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorOption {
    /// Detect terminal capabilities automatically.
    Auto,
    /// Always emit ANSI color codes.
    Always,
    /// Never emit ANSI color codes.
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in and message the followers of target accounts.
    Send(SendCommand),
    /// Inspect or delete stored sessions.
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Inspect or edit the sent-users ledger.
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    /// Supply a verification code to a login waiting for one.
    Code(CodeCommand),
    /// Create config directories and default files.
    Init(InitCommand),
    /// Inspect and manage configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct SendCommand {
    /// Account to send from.
    #[arg(short, long)]
    username: String,
    /// Account password.
    #[arg(long, env = "IGDM_PASSWORD", hide_env_values = true)]
    password: String,
    /// Comma-separated target accounts whose followers are contacted.
    #[arg(short, long)]
    targets: String,
    /// Message body. `{name}` and `{username}` are replaced per recipient.
    #[arg(short, long, conflicts_with = "message_file", required_unless_present = "message_file")]
    message: Option<String>,
    /// Read the message body from a file.
    #[arg(long, value_name = "PATH")]
    message_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
enum SessionCommand {
    /// Show the stored session for an account.
    Status {
        /// Account handle.
        username: String,
    },
    /// Delete the stored session for an account.
    Clear {
        /// Account handle.
        username: String,
    },
}

#[derive(Debug, Clone, Subcommand)]
enum LedgerCommand {
    /// List every contacted username.
    List,
    /// Check whether a username has been contacted.
    Check {
        /// Username to look up.
        username: String,
    },
    /// Mark a username as contacted.
    Add {
        /// Username to record.
        username: String,
    },
}

#[derive(Debug, Clone, Args)]
struct CodeCommand {
    /// Account that is logging in.
    username: String,
    /// Verification code.
    code: String,
    /// The code answers a two-factor prompt instead of a challenge.
    #[arg(long)]
    two_factor: bool,
}

#[derive(Debug, Clone, Copy, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists.
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration.
    Show,
    /// Print the resolved config file path.
    Path,
    /// Print all resolved paths.
    Paths,
    /// Print the JSON schema.
    Schema,
    /// Write the JSON schema and an example config into a directory.
    Generate {
        /// Output directory.
        dir: PathBuf,
    },
    /// Regenerate the default configuration file.
    Reset,
}

// ─── Runtime ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.as_deref())?;
        let config = AppConfig::load(&paths, common.dry_run)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
        let level = self.effective_log_level();
        builder.filter_level(level);
        // Task progress stays visible at the default verbosity.
        if level < LevelFilter::Info {
            builder.filter_module(TASK_LOG_TARGET, LevelFilter::Info);
        }

        let force_color = matches!(self.common.color, ColorOption::Always)
            || env::var_os("FORCE_COLOR").is_some();
        let disable_color = self.common.no_color
            || matches!(self.common.color, ColorOption::Never)
            || env::var_os("NO_COLOR").is_some()
            || (!force_color && !io::stderr().is_terminal());

        if disable_color {
            builder.write_style(WriteStyle::Never);
        } else if force_color {
            builder.write_style(WriteStyle::Always);
        } else {
            builder.write_style(WriteStyle::Auto);
        }

        builder.try_init().or_else(|err| {
            if self.common.verbose > 0 {
                eprintln!("logger already initialized: {err}");
            }
            Ok(())
        })
    }

    const fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            self.paths.log_dry_run();
            return Ok(());
        }
        self.paths.ensure_directories()
    }

    fn sessions(&self) -> SessionStore {
        SessionStore::new(self.paths.sessions_dir())
    }

    fn ledger(&self) -> SentLedger {
        SentLedger::new(self.paths.ledger_file())
    }
}

// ─── Handlers ────────────────────────────────────────────────────────

async fn handle_send(ctx: &RuntimeContext, cmd: SendCommand) -> Result<()> {
    let message = match (&cmd.message, &cmd.message_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading message from {}", path.display()))?,
        (None, None) => return Err(anyhow!("--message or --message-file is required")),
    };
    let request = SubmitRequest::from_form(&cmd.username, &cmd.password, &cmd.targets, &message)?;

    if ctx.common.dry_run {
        println!(
            "dry-run: would log in as {} and contact followers of {}",
            request.credentials.username,
            request.targets.join(", ")
        );
        return Ok(());
    }

    // Codes come from drop files here; the HTTP inbox has no one feeding it.
    let mut config = ctx.config.clone();
    config.auth.code_source = CodeSourceKind::File;
    let service = OutreachService::from_config(&config, &ctx.paths)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, stopping after the current step...");
                cancel.cancel();
            }
        }
    });

    eprintln!(
        "Verification codes: write them with `{APP_NAME} code {} <code>` or into {}",
        request.credentials.username,
        ctx.paths.codes_dir().display()
    );

    let log = TaskLog::new(&request.credentials.username);
    let summary = service.run_now(&request, &log, cancel).await?;
    print_summary(ctx, &summary)?;

    if summary.status == TaskStatus::Error {
        return Err(anyhow!("{}", summary.message));
    }
    Ok(())
}

fn print_summary(ctx: &RuntimeContext, summary: &OutreachSummary) -> Result<()> {
    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("serializing summary to JSON")?
        );
        return Ok(());
    }

    println!("{}", summary.message);
    println!("attempted: {}", summary.attempted);
    println!("succeeded: {}", summary.success);
    println!("failed:    {}", summary.failed);
    if !summary.failed_users.is_empty() {
        println!("failed users: {}", summary.failed_users.join(", "));
    }
    Ok(())
}

fn handle_session(ctx: &RuntimeContext, command: SessionCommand) -> Result<()> {
    let store = ctx.sessions();

    match command {
        SessionCommand::Status { username } => {
            let path = store.path_for(&username);
            let Some(record) = store.load(&username)? else {
                println!("No session stored for {username} ({})", path.display());
                return Ok(());
            };

            let saved = chrono::DateTime::from_timestamp(record.saved_at, 0)
                .map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339());
            if ctx.common.json {
                let status = serde_json::json!({
                    "username": record.username,
                    "path": path,
                    "saved_at": saved,
                    "has_credentials": record.has_credentials(),
                    "user_id": record.user_id,
                    "device_uuid": record.device.uuid,
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status).context("serializing session status")?
                );
            } else {
                println!("Session:     {}", path.display());
                println!("Account:     {}", record.username);
                println!("Saved at:    {saved}");
                println!(
                    "Credentials: {}",
                    if record.has_credentials() { "present" } else { "missing" }
                );
                if !record.device.uuid.is_empty() {
                    println!("Device UUID: {}", record.device.uuid);
                }
            }
            Ok(())
        }
        SessionCommand::Clear { username } => {
            if ctx.common.dry_run {
                log::info!(
                    "dry-run: would delete {}",
                    store.path_for(&username).display()
                );
                return Ok(());
            }
            if store.delete(&username)? {
                println!("Deleted session for {username}.");
            } else {
                println!("No session stored for {username}.");
            }
            Ok(())
        }
    }
}

async fn handle_ledger(ctx: &RuntimeContext, command: LedgerCommand) -> Result<()> {
    let ledger = ctx.ledger();

    match command {
        LedgerCommand::List => {
            let mut users: Vec<_> = ledger.load().await?.into_iter().collect();
            users.sort();
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&users).context("serializing ledger")?
                );
            } else {
                for user in &users {
                    println!("{user}");
                }
                eprintln!("{} users in {}", users.len(), ledger.path().display());
            }
            Ok(())
        }
        LedgerCommand::Check { username } => {
            let contacted = ledger.contains(&username).await?;
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::json!({ "username": username, "contacted": contacted })
                );
            } else if contacted {
                println!("{username} has already been contacted.");
            } else {
                println!("{username} has not been contacted.");
            }
            Ok(())
        }
        LedgerCommand::Add { username } => {
            if ledger.contains(&username).await? {
                println!("{username} is already in the ledger.");
                return Ok(());
            }
            if ctx.common.dry_run {
                log::info!(
                    "dry-run: would add {username} to {}",
                    ledger.path().display()
                );
                return Ok(());
            }
            ledger.append(&username).await?;
            println!("Added {username}.");
            Ok(())
        }
    }
}

fn handle_code(ctx: &RuntimeContext, cmd: &CodeCommand) -> Result<()> {
    let kind = if cmd.two_factor {
        CodeKind::TwoFactor
    } else {
        CodeKind::Challenge
    };
    let source = FileCodeSource::new(ctx.paths.codes_dir(), Duration::ZERO);

    if ctx.common.dry_run {
        log::info!(
            "dry-run: would write {kind} code to {}",
            source.path_for(&cmd.username, kind).display()
        );
        return Ok(());
    }

    let path = source
        .deliver(&cmd.username, kind, &cmd.code)
        .with_context(|| format!("writing {kind} code for {}", cmd.username))?;
    println!("Wrote {kind} code to {}", path.display());
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }
    if ctx.common.dry_run {
        log::info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
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
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Paths => {
            if ctx.common.json {
                let paths = serde_json::json!({
                    "config": ctx.paths.config_file,
                    "data": ctx.paths.data_dir,
                    "state": ctx.paths.state_dir,
                    "sessions": ctx.paths.sessions_dir(),
                    "ledger": ctx.paths.ledger_file(),
                    "codes": ctx.paths.codes_dir(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&paths).context("serializing paths to JSON")?
                );
            } else {
                println!("config:   {}", ctx.paths.config_file.display());
                println!("data:     {}", ctx.paths.data_dir.display());
                println!("state:    {}", ctx.paths.state_dir.display());
                println!("sessions: {}", ctx.paths.sessions_dir().display());
                println!("ledger:   {}", ctx.paths.ledger_file().display());
                println!("codes:    {}", ctx.paths.codes_dir().display());
            }
            Ok(())
        }
        ConfigCommand::Schema => {
            println!("{}", generate_schema(APP_NAME, REPO_URL)?);
            Ok(())
        }
        ConfigCommand::Generate { dir } => {
            if ctx.common.dry_run {
                log::info!("dry-run: would write schema and example config to {}", dir.display());
                return Ok(());
            }
            write_generated_files(&dir, APP_NAME, REPO_URL)?;
            println!("Wrote config.schema.json and config.toml to {}", dir.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                log::info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn send_requires_a_message_source() {
        let err = Cli::try_parse_from([
            "igdm", "send", "-u", "me", "--password", "pw", "-t", "acct_a",
        ])
        .expect_err("message is required");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let cli = Cli::try_parse_from([
            "igdm",
            "send",
            "-u",
            "me",
            "--password",
            "pw",
            "-t",
            "acct_a,acct_b",
            "--message-file",
            "msg.txt",
        ])
        .expect("valid send");
        let Command::Send(cmd) = cli.command else {
            panic!("expected send command");
        };
        assert_eq!(cmd.message_file, Some(PathBuf::from("msg.txt")));
    }

    #[test]
    fn init_accepts_force_and_global_yes() {
        let cli = Cli::try_parse_from(["igdm", "init", "--force"]).expect("init --force");
        let Command::Init(cmd) = cli.command else {
            panic!("expected init command");
        };
        assert!(cmd.force);
        assert!(!cli.common.assume_yes);

        let cli = Cli::try_parse_from(["igdm", "-y", "init"]).expect("-y init");
        let Command::Init(cmd) = cli.command else {
            panic!("expected init command");
        };
        assert!(!cmd.force);
        assert!(cli.common.assume_yes);
    }

    #[test]
    fn code_defaults_to_challenge() {
        let cli = Cli::try_parse_from(["igdm", "code", "me", "123456"]).expect("parse");
        let Command::Code(cmd) = cli.command else {
            panic!("expected code command");
        };
        assert!(!cmd.two_factor);
        assert_eq!(cmd.code, "123456");
    }
}
