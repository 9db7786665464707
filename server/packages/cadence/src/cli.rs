use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use cadence_error::CadenceError;
use cadence_opencode_client::{ModelRef, PermissionReply, PermissionRequest};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::export::DEFAULT_EXPORT_FILE;
use crate::notice::ShellNotice;
use crate::settings::{ConfigPaths, ServerMode, Settings, SettingsPatch, UiMode};
use crate::shell::{CadenceShell, ShellOptions, SlashCommand};
use crate::transcript::TranscriptPrinter;

#[derive(Parser, Debug)]
#[command(name = "cadence", bin_name = "cadence")]
#[command(about = "Chat shell for a local OpenCode server", version)]
pub struct CadenceCli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Directory holding settings.json and permission-memory.json.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Working directory sent to the server, for this run only.
    #[arg(long, short = 'd', global = true)]
    directory: Option<String>,

    /// Attach to a running server instead of the configured mode, for this run only.
    #[arg(long, short = 'a', global = true)]
    attach: Option<String>,

    /// OpenCode checkout used to start the server in auto mode.
    #[arg(long, global = true)]
    opencode_root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive chat with the active session (default).
    Chat(ChatArgs),
    /// List, create, read and export sessions.
    Sessions(SessionsArgs),
    /// List the server's agents.
    Agents,
    /// List providers and their models.
    Providers,
    /// Show or change persisted settings.
    Settings(SettingsArgs),
    /// Inspect remembered permission approvals.
    Permissions(PermissionsArgs),
    /// Print shell notices as JSON lines until interrupted.
    Watch,
}

#[derive(Args, Debug, Default)]
pub struct ChatArgs {
    /// Open this session instead of the most recent one.
    #[arg(long, short = 's')]
    session: Option<String>,

    /// Start a new session.
    #[arg(long, conflicts_with = "session")]
    new: bool,
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    #[command(subcommand)]
    command: SessionsCommand,
}

#[derive(Subcommand, Debug)]
pub enum SessionsCommand {
    /// List sessions for the working directory.
    List {
        #[arg(long)]
        search: Option<String>,
    },
    /// Create a session with the default permission rules.
    Create {
        #[arg(long)]
        title: Option<String>,
    },
    /// Print a session's messages.
    Messages {
        session_id: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Write a session transcript as Markdown.
    Export {
        session_id: String,
        #[arg(long, short = 'o', default_value = DEFAULT_EXPORT_FILE)]
        output: PathBuf,
    },
    /// Ask the server to summarize a session.
    Summarize { session_id: String },
}

#[derive(Args, Debug)]
pub struct SettingsArgs {
    #[command(subcommand)]
    command: SettingsCommand,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Print the persisted settings.
    Show,
    /// Update persisted settings.
    Set(SettingsSetArgs),
}

#[derive(Args, Debug, Default)]
pub struct SettingsSetArgs {
    #[arg(long)]
    directory: Option<String>,

    /// Default model as `provider/model`.
    #[arg(long, conflicts_with = "clear_model")]
    model: Option<String>,

    #[arg(long)]
    clear_model: bool,

    #[arg(long, conflicts_with = "clear_agent")]
    agent: Option<String>,

    #[arg(long)]
    clear_agent: bool,

    #[arg(long)]
    server_mode: Option<ServerMode>,

    #[arg(long)]
    server_url: Option<String>,

    #[arg(long)]
    ui_mode: Option<UiMode>,

    #[arg(long)]
    auto_launch: Option<bool>,

    #[arg(long)]
    hotkey: Option<String>,
}

#[derive(Args, Debug)]
pub struct PermissionsArgs {
    #[command(subcommand)]
    command: PermissionsCommand,
}

#[derive(Subcommand, Debug)]
pub enum PermissionsCommand {
    /// Print remembered approvals by permission.
    List,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Cadence(#[from] CadenceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub fn run_cadence() -> Result<(), CliError> {
    let cli = CadenceCli::parse();
    let command = cli.command.unwrap_or(Command::Chat(ChatArgs::default()));
    if let Err(err) = init_logging(&command) {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }

    let options = ShellOptions {
        paths: Some(ConfigPaths::resolve(cli.config_dir)?),
        directory: cli.directory,
        attach_url: cli.attach,
        opencode_root: cli.opencode_root,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    runtime.block_on(run_command(command, options))
}

pub fn init_logging(command: &Command) -> Result<(), CliError> {
    // The chat REPL shares the terminal with logs.
    let default_level = match command {
        Command::Chat(_) => "warn",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub async fn run_command(command: Command, options: ShellOptions) -> Result<(), CliError> {
    let command = match command {
        Command::Settings(args) => return run_settings(args.command, &options).await,
        Command::Permissions(args) => return run_permissions(args.command, options).await,
        other => other,
    };

    let shell = Arc::new(CadenceShell::open(options).await?);
    let result: Result<(), CliError> = async {
        match command {
            Command::Chat(args) => run_chat(&shell, args).await,
            Command::Sessions(args) => run_sessions(&shell, args.command).await,
            Command::Agents => {
                shell.ensure_server_ready().await;
                print_json(&shell.list_agents().await?)
            }
            Command::Providers => {
                shell.ensure_server_ready().await;
                print_json(&shell.list_providers().await?)
            }
            Command::Watch => run_watch(&shell).await,
            Command::Settings(_) | Command::Permissions(_) => Ok(()),
        }
    }
    .await;
    shell.shutdown().await;
    result
}

async fn run_settings(command: SettingsCommand, options: &ShellOptions) -> Result<(), CliError> {
    let paths = match options.paths.clone() {
        Some(paths) => paths,
        None => ConfigPaths::resolve(None)?,
    };
    let path = paths.settings_file();
    let mut settings = Settings::load(&path).await;
    match command {
        SettingsCommand::Show => print_json(&settings),
        SettingsCommand::Set(args) => {
            let patch = settings_patch(args)?;
            if patch.is_empty() {
                return Err(CliError::InvalidArgument("no settings given".to_string()));
            }
            patch.apply(&mut settings);
            settings.save(&path).await?;
            print_json(&settings)
        }
    }
}

fn settings_patch(args: SettingsSetArgs) -> Result<SettingsPatch, CliError> {
    let model = match (args.model, args.clear_model) {
        (_, true) => Some(None),
        (Some(model), false) => Some(Some(ModelRef::parse(&model).ok_or_else(|| {
            CliError::InvalidArgument(format!("model must be provider/model, got `{model}`"))
        })?)),
        (None, false) => None,
    };
    let agent = match (args.agent, args.clear_agent) {
        (_, true) => Some(None),
        (agent, false) => agent.map(Some),
    };
    Ok(SettingsPatch {
        directory: args.directory,
        model,
        agent,
        server_mode: args.server_mode,
        server_url: args.server_url,
        ui_mode: args.ui_mode,
        auto_launch: args.auto_launch,
        hotkey: args.hotkey,
    })
}

async fn run_permissions(command: PermissionsCommand, options: ShellOptions) -> Result<(), CliError> {
    match command {
        PermissionsCommand::List => {
            let shell = CadenceShell::open(options).await?;
            print_json(&shell.synchronizer().memory().snapshot())
        }
    }
}

async fn run_sessions(shell: &CadenceShell, command: SessionsCommand) -> Result<(), CliError> {
    shell.ensure_server_ready().await;
    match command {
        SessionsCommand::List { search } => print_json(&shell.list_sessions(search.as_deref()).await?),
        SessionsCommand::Create { title } => print_json(&shell.create_session(title.as_deref()).await?),
        SessionsCommand::Messages { session_id, limit } => {
            print_json(&shell.client().session_messages(&session_id, limit).await?)
        }
        SessionsCommand::Export { session_id, output } => {
            shell.export_session_markdown(&session_id, &output).await?;
            write_stdout_line(&output.display().to_string())
        }
        SessionsCommand::Summarize { session_id } => {
            let summarized = shell.summarize(&session_id).await?;
            print_json(&json!({ "sessionID": session_id, "summarized": summarized }))
        }
    }
}

async fn run_watch(shell: &CadenceShell) -> Result<(), CliError> {
    let mut notices = shell.notices();
    let info = shell.ready().await;
    tracing::info!(base_url = %info.base_url, directory = %info.directory, "watching events");
    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Ok(notice) => write_stdout_line(&serde_json::to_string(&notice)?)?,
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "notice consumer lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn run_chat(shell: &Arc<CadenceShell>, args: ChatArgs) -> Result<(), CliError> {
    let mut notices = shell.notices();
    let info = shell.ready().await;
    write_stderr_line(&format!("connected to {} ({})", info.base_url, info.directory))?;

    let session_id = if args.new {
        shell.start_new_session(None).await?.id
    } else if let Some(session_id) = args.session {
        shell.open_session(&session_id).await?;
        session_id
    } else {
        shell.open_latest_or_create().await?
    };
    write_stderr_line(&format!("session {session_id}; /help for commands"))?;

    let mut printer = TranscriptPrinter::default();
    write_stdout(&printer.replay(&shell.store().snapshot().messages))?;

    let mut versions = shell.store().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if handle_chat_line(shell, &mut printer, &line).await? == ChatFlow::Quit {
                    break;
                }
            }
            changed = versions.changed() => {
                if changed.is_err() {
                    break;
                }
                write_stdout(&printer.render_new(&shell.store().snapshot().messages))?;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => print_chat_notice(&notice)?,
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "notice consumer lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    write_stdout("\n")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatFlow {
    Continue,
    Quit,
}

async fn handle_chat_line(
    shell: &Arc<CadenceShell>,
    printer: &mut TranscriptPrinter,
    line: &str,
) -> Result<ChatFlow, CliError> {
    let input = line.trim();
    if input.is_empty() {
        return Ok(ChatFlow::Continue);
    }

    let pending = shell.store().read(|state| state.pending_permission().cloned());
    if let Some(request) = pending {
        if let Ok(reply) = input.parse::<PermissionReply>() {
            if let Err(err) = shell.respond_permission(&request.id, reply).await {
                shell.report(&err);
            }
            return Ok(ChatFlow::Continue);
        }
    }

    let Some(command) = SlashCommand::parse(input) else {
        spawn_prompt(shell, input.to_string());
        return Ok(ChatFlow::Continue);
    };

    match command {
        SlashCommand::Help => write_stderr_line(SlashCommand::HELP)?,
        SlashCommand::New => match shell.start_new_session(None).await {
            Ok(session) => {
                printer.reset();
                write_stderr_line(&format!("session {}", session.id))?;
            }
            Err(err) => shell.report(&err),
        },
        SlashCommand::Clear => {
            shell.clear_messages();
            printer.reset();
        }
        SlashCommand::Compact => match shell.active_session() {
            Some(session_id) => {
                let shell = shell.clone();
                tokio::spawn(async move {
                    if let Err(err) = shell.summarize(&session_id).await {
                        shell.report(&err);
                    }
                });
            }
            None => write_stderr_line("no active session")?,
        },
        SlashCommand::Export(path) => match shell.active_session() {
            Some(session_id) => {
                let path = PathBuf::from(path.unwrap_or_else(|| DEFAULT_EXPORT_FILE.to_string()));
                match shell.export_session_markdown(&session_id, &path).await {
                    Ok(()) => write_stderr_line(&format!("exported to {}", path.display()))?,
                    Err(err) => shell.report(&err),
                }
            }
            None => write_stderr_line("no active session")?,
        },
        SlashCommand::Quit => return Ok(ChatFlow::Quit),
    }
    Ok(ChatFlow::Continue)
}

// The prompt call returns only when the assistant is done; streamed output
// arrives through the store meanwhile.
fn spawn_prompt(shell: &Arc<CadenceShell>, text: String) {
    let shell = shell.clone();
    tokio::spawn(async move {
        if let Err(err) = shell.send_prompt(&text).await {
            shell.report(&err);
        }
    });
}

fn print_chat_notice(notice: &ShellNotice) -> Result<(), CliError> {
    match notice {
        ShellNotice::Error(error) => write_stderr_line(&format!("\n{}: {}", error.title, error.message)),
        ShellNotice::PermissionRequested(request) => write_stderr_line(&permission_prompt(request)),
        ShellNotice::TaskCompleted { .. } => write_stderr_line("\n(done)"),
        ShellNotice::SubscriptionEnded { state, .. } => {
            write_stderr_line(&format!("\nevent stream {state}; restart cadence to reconnect"))
        }
        ShellNotice::SessionsStale => Ok(()),
    }
}

fn permission_prompt(request: &PermissionRequest) -> String {
    let patterns = if request.patterns.is_empty() {
        String::new()
    } else {
        format!(" {}", request.patterns.join(", "))
    };
    format!(
        "\npermission {}{patterns}: [o]nce, [a]lways, [r]eject?",
        request.permission
    )
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let pretty = serde_json::to_string_pretty(value)?;
    write_stdout_line(&pretty)
}

fn write_stdout(text: &str) -> Result<(), CliError> {
    if text.is_empty() {
        return Ok(());
    }
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_has_no_subcommand() {
        let cli = CadenceCli::try_parse_from(["cadence", "--attach", "http://127.0.0.1:4096"])
            .expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.attach.as_deref(), Some("http://127.0.0.1:4096"));
    }

    #[test]
    fn settings_set_builds_a_patch() {
        let cli = CadenceCli::try_parse_from([
            "cadence",
            "settings",
            "set",
            "--model",
            "anthropic/claude",
            "--clear-agent",
            "--server-mode",
            "attach",
        ])
        .expect("parse");
        let Some(Command::Settings(SettingsArgs {
            command: SettingsCommand::Set(args),
        })) = cli.command
        else {
            panic!("expected settings set");
        };

        let patch = settings_patch(args).expect("patch");
        assert_eq!(patch.model, Some(Some(ModelRef::new("anthropic", "claude"))));
        assert_eq!(patch.agent, Some(None));
        assert_eq!(patch.server_mode, Some(ServerMode::Attach));
        assert_eq!(patch.server_url, None);
    }

    #[test]
    fn malformed_model_is_rejected() {
        let args = SettingsSetArgs {
            model: Some("claude".to_string()),
            ..SettingsSetArgs::default()
        };
        assert!(matches!(settings_patch(args), Err(CliError::InvalidArgument(_))));
    }

    #[test]
    fn permission_prompt_lists_patterns() {
        let request: PermissionRequest = serde_json::from_value(json!({
            "id": "per_1",
            "sessionID": "s1",
            "permission": "bash",
            "patterns": ["git status", "git diff"],
            "always": ["git *"]
        }))
        .expect("request");
        assert_eq!(
            permission_prompt(&request),
            "\npermission bash git status, git diff: [o]nce, [a]lways, [r]eject?"
        );
    }
}
