//! CLI entrypoint and subcommand orchestration.

mod config;
mod confirm;
mod repl;
mod session_file;
#[cfg(test)]
mod test_support;

use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use agent::trace::{format_event, read_tail, read_trace};
use agent::{AgentRuntime, LoopOutcome, ProviderCache};
use anyhow::Context;
use clap::{Parser, Subcommand};
use proto::{
    AutoRejectHandler, ChatMode, ProgressEvent, ToolApprovalDecision, ToolApprovalHandler,
    ToolApprovalRequest, ToolError,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tools::{DangerPolicy, HttpBridge, ToolBridge, ValidationError};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::confirm::StdinApproval;
use crate::repl::{Input, SlashCommand};
use crate::session_file::{load_session, save_session};

/// Exit status when the loop stopped after repeated tool failures.
const EXIT_HALTED: u8 = 2;
/// Exit status when the question was interrupted.
const EXIT_INTERRUPTED: u8 = 130;

/// Top-level command-line arguments for r2pilot.
#[derive(Parser)]
#[command(name = "r2pilot")]
#[command(about = "Tool-calling reverse-engineering assistant", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging to ~/.r2pilot/logs/debug.log
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands available in the application.
#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (default when no subcommand is given)
    Chat {
        /// Start in strict mode (evidence-backed report required)
        #[arg(long, default_value_t = false)]
        strict: bool,

        /// Load the configured session file before the first question
        #[arg(long, default_value_t = false)]
        resume: bool,
    },

    /// Answer a single question and exit
    Run {
        /// Question to send to the agent
        #[arg(short = 'e', long)]
        exec: String,

        /// Use strict mode
        #[arg(long, default_value_t = false)]
        strict: bool,
    },

    /// List the bridge's tools with their required fields
    Tools,

    /// Call one tool directly, after validation and the dangerous-command guard
    Call {
        /// Tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(value_name = "JSON")]
        args: Option<String>,

        /// Skip the dangerous-command guard
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Print the bridge health line
    Health,

    /// Print trace events from the trace file
    Trace {
        /// Only events of this trace id
        trace_id: Option<String>,

        /// Maximum number of events to print
        #[arg(long, default_value_t = 50)]
        tail: usize,
    },

    /// Print the effective configuration (API key masked)
    Config {
        /// Also write the effective configuration to this path
        #[arg(long, value_name = "PATH")]
        write: Option<PathBuf>,
    },
}

impl Commands {
    fn label(&self) -> &'static str {
        match self {
            Commands::Chat { .. } => "chat",
            Commands::Run { .. } => "run",
            Commands::Tools => "tools",
            Commands::Call { .. } => "call",
            Commands::Health => "health",
            Commands::Trace { .. } => "trace",
            Commands::Config { .. } => "config",
        }
    }
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Chat {
        strict: false,
        resume: false,
    });

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // Keep the guard alive for the whole run so buffered file logs are flushed.
    let _file_guard;
    let debug_writer = if cli.debug {
        let log_dir = config::state_dir().join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);
        Some(writer)
    } else {
        _file_guard = None;
        None
    };

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);
    match debug_writer {
        Some(writer) => {
            let file = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .with_filter(EnvFilter::new(
                    "debug,hyper_util=info,hyper=info,h2=info,rustls=info,reqwest=info",
                ));
            tracing_subscriber::registry()
                .with(console)
                .with(file)
                .init();
        }
        None => {
            tracing_subscriber::registry().with(console).init();
        }
    }

    if cli.debug {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = command.label(),
            log_level = %cli.log_level,
            "========== r2pilot session start =========="
        );
    }

    let config = Config::load(cli.config.as_deref())?;
    let config_path = cli.config.clone();

    match command {
        Commands::Chat { strict, resume } => {
            cmd_chat(config, config_path.as_deref(), mode_for(strict), resume).await
        }
        Commands::Run { exec, strict } => cmd_run(config, exec, mode_for(strict)).await,
        Commands::Tools => cmd_tools(config).await,
        Commands::Call { tool, args, force } => cmd_call(config, tool, args, force).await,
        Commands::Health => cmd_health(config).await,
        Commands::Trace { trace_id, tail } => cmd_trace(&config, trace_id, tail),
        Commands::Config { write } => cmd_config(&config, write.as_deref()),
    }
}

fn mode_for(strict: bool) -> ChatMode {
    if strict { ChatMode::Strict } else { ChatMode::Loose }
}

fn connect_bridge(config: &Config) -> anyhow::Result<Arc<HttpBridge>> {
    let bridge = HttpBridge::new(config.bridge.base_url.clone(), config.bridge_timeout())?;
    Ok(Arc::new(bridge))
}

/// Connects the bridge, loads the tool catalog and wires the runtime.
async fn build_runtime(
    config: &Config,
    providers: &ProviderCache,
    approval: Arc<dyn ToolApprovalHandler>,
    progress: Option<mpsc::Sender<ProgressEvent>>,
) -> anyhow::Result<AgentRuntime> {
    let bridge = connect_bridge(config)?;
    let catalog = tools::load_catalog(&*bridge)
        .await
        .with_context(|| format!("failed to load tools/list from {}", config.bridge.base_url))?;
    if catalog.is_empty() {
        warn!(bridge = %config.bridge.base_url, "Bridge returned no tools");
    }
    if config.llm.api_key.is_empty() {
        warn!("No API key configured. Set llm.api_key or R2PILOT_API_KEY.");
    }
    let llm = providers.get_or_create(&config.llm.api_key, &config.llm.base_url, config.llm_timeout())?;
    info!(
        model = %config.llm.model,
        tools = catalog.len(),
        policy = %config.dangerous.policy,
        "Runtime ready"
    );

    let mut runtime = AgentRuntime::new(llm, bridge, catalog, config.runtime_config())
        .with_guard(config.guard()?)
        .with_approval(approval)
        .with_trace_sink(config.trace_sink());
    if let Some(tx) = progress {
        runtime = runtime.with_progress(tx);
    }
    Ok(runtime)
}

/// Prints progress events to stderr until every sender is gone.
fn spawn_progress_printer(mut rx: mpsc::Receiver<ProgressEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(text) = repl::render_progress(&event) {
                let mut stderr = std::io::stderr().lock();
                let _ = stderr.write_all(text.as_bytes());
                let _ = stderr.flush();
            }
        }
    })
}

/// Runs one question; Ctrl-C cancels it without leaving the process.
async fn ask(runtime: &mut AgentRuntime, question: &str, mode: ChatMode) -> Result<LoopOutcome, proto::LlmError> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let outcome = runtime.chat(question, mode, &cancel).await;
    watcher.abort();
    outcome
}

fn print_outcome(outcome: &LoopOutcome) {
    match outcome {
        LoopOutcome::Answer(text) | LoopOutcome::Halted(text) => println!("\n{text}\n"),
        LoopOutcome::Interrupted => eprintln!("\n[interrupted]"),
    }
}

fn exit_status(outcome: &LoopOutcome) -> u8 {
    match outcome {
        LoopOutcome::Answer(_) => 0,
        LoopOutcome::Halted(_) => EXIT_HALTED,
        LoopOutcome::Interrupted => EXIT_INTERRUPTED,
    }
}

/// `y/N` on a terminal, automatic rejection otherwise.
fn approval_handler() -> Arc<dyn ToolApprovalHandler> {
    if std::io::stdin().is_terminal() {
        Arc::new(StdinApproval)
    } else {
        Arc::new(AutoRejectHandler)
    }
}

async fn close_sessions(runtime: &mut AgentRuntime) {
    let known = runtime.session_ids().len();
    if known == 0 {
        return;
    }
    let closed = runtime.close_all_sessions().await;
    info!(known, closed, "Closed bridge sessions");
}

fn banner(runtime: &AgentRuntime) -> String {
    format!(
        "r2pilot {} | model {} | {} tools | mode {}\nType /help for commands.",
        env!("CARGO_PKG_VERSION"),
        runtime.model(),
        runtime.catalog().len(),
        runtime.mode(),
    )
}

/// Interactive chat loop.
async fn cmd_chat(
    config: Config,
    config_path: Option<&Path>,
    mode: ChatMode,
    resume: bool,
) -> anyhow::Result<ExitCode> {
    let mut config = config;
    let providers = ProviderCache::new();
    let approval = approval_handler();
    let (tx, rx) = mpsc::channel(256);
    let printer = spawn_progress_printer(rx);

    let mut runtime = build_runtime(&config, &providers, approval.clone(), Some(tx.clone())).await?;
    let mut mode = mode;
    runtime.set_mode(mode);
    if resume {
        let path = PathBuf::from(&config.session.path);
        match load_session(&path).and_then(|snapshot| runtime.import_session(snapshot)) {
            Ok(()) => println!("Resumed {} messages from {}", runtime.messages().len(), path.display()),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to resume session"),
        }
    }
    println!("{}", banner(&runtime));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("r2pilot[{mode}]> ");
        std::io::stdout().flush()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let cmd = match repl::parse_line(&line) {
            Input::Empty => continue,
            Input::Question(question) => {
                match ask(&mut runtime, &question, mode).await {
                    Ok(outcome) => print_outcome(&outcome),
                    Err(e) => {
                        error!(error = %e, "Question failed");
                        eprintln!("Error: {e}");
                    }
                }
                continue;
            }
            Input::Command(cmd) => cmd,
        };

        match cmd {
            SlashCommand::Reset => {
                close_sessions(&mut runtime).await;
                runtime.reset();
                println!("Conversation cleared.");
            }
            SlashCommand::Save(path) => {
                let path = path.unwrap_or_else(|| PathBuf::from(&config.session.path));
                match save_session(&path, &runtime.export_session()) {
                    Ok(()) => println!("Saved {} messages to {}", runtime.messages().len(), path.display()),
                    Err(e) => eprintln!("Save failed: {e}"),
                }
            }
            SlashCommand::Load(path) => {
                let path = path.unwrap_or_else(|| PathBuf::from(&config.session.path));
                match load_session(&path).and_then(|snapshot| runtime.import_session(snapshot)) {
                    Ok(()) => println!(
                        "Loaded {} messages from {} (model {})",
                        runtime.messages().len(),
                        path.display(),
                        runtime.model()
                    ),
                    Err(e) => eprintln!("Load failed: {e}"),
                }
            }
            SlashCommand::Mode(None) => println!("Mode: {mode}"),
            SlashCommand::Mode(Some(next)) => {
                mode = next;
                runtime.set_mode(mode);
                println!("Mode: {mode}");
            }
            SlashCommand::Sessions => {
                if runtime.session_ids().is_empty() {
                    println!("No bridge sessions.");
                }
                for id in runtime.session_ids() {
                    println!("  {id}");
                }
            }
            SlashCommand::Trace => {
                if runtime.trace_events().is_empty() {
                    println!("No trace yet.");
                } else {
                    println!("trace {}", runtime.last_trace_id());
                    for event in runtime.trace_events() {
                        println!("  {}", format_event(event));
                    }
                }
            }
            SlashCommand::Reload { keep } => {
                match reload(config_path, &providers, approval.clone(), tx.clone(), &mut runtime, keep).await {
                    Ok(fresh) => {
                        config = fresh.0;
                        runtime = fresh.1;
                        runtime.set_mode(mode);
                        println!("{}", banner(&runtime));
                    }
                    Err(e) => eprintln!("Reload failed: {e:#}"),
                }
            }
            SlashCommand::Help => println!("{}", repl::HELP),
            SlashCommand::Exit => break,
            SlashCommand::Invalid(msg) => println!("{msg}"),
        }
    }

    close_sessions(&mut runtime).await;
    drop(runtime);
    drop(tx);
    let _ = printer.await;
    Ok(ExitCode::SUCCESS)
}

/// Re-reads the config and rebuilds the runtime, optionally keeping the conversation.
async fn reload(
    config_path: Option<&Path>,
    providers: &ProviderCache,
    approval: Arc<dyn ToolApprovalHandler>,
    tx: mpsc::Sender<ProgressEvent>,
    current: &mut AgentRuntime,
    keep: bool,
) -> anyhow::Result<(Config, AgentRuntime)> {
    let config = Config::load(config_path)?;
    let mut fresh = build_runtime(&config, providers, approval, Some(tx)).await?;
    if keep {
        fresh.carry_over(current)?;
    } else {
        close_sessions(current).await;
    }
    info!(keep, model = %fresh.model(), "Runtime reloaded");
    Ok((config, fresh))
}

/// One question, then exit.
async fn cmd_run(config: Config, exec: String, mode: ChatMode) -> anyhow::Result<ExitCode> {
    let providers = ProviderCache::new();
    let (tx, rx) = mpsc::channel(256);
    let printer = spawn_progress_printer(rx);
    let mut runtime = build_runtime(&config, &providers, approval_handler(), Some(tx)).await?;

    let outcome = ask(&mut runtime, &exec, mode).await;
    close_sessions(&mut runtime).await;
    drop(runtime);
    let _ = printer.await;

    let outcome = outcome?;
    print_outcome(&outcome);
    Ok(ExitCode::from(exit_status(&outcome)))
}

async fn cmd_tools(config: Config) -> anyhow::Result<ExitCode> {
    let bridge = connect_bridge(&config)?;
    let catalog = tools::load_catalog(&*bridge).await?;
    println!("{}", repl::format_catalog(&catalog));
    Ok(ExitCode::SUCCESS)
}

/// Parses the `call` argument text; blank means `{}`.
fn parse_call_args(text: Option<&str>) -> anyhow::Result<Value> {
    match text.map(str::trim).filter(|t| !t.is_empty()) {
        None => Ok(Value::Object(Default::default())),
        Some(text) => serde_json::from_str(text).context("arguments must be valid JSON"),
    }
}

fn rejected_call(tool: &str, err: ValidationError) -> ToolError {
    match err {
        ValidationError::UnknownTool(name) => ToolError::NotFound(name),
        other => ToolError::InvalidArgs(format!("{tool}: {other}")),
    }
}

async fn cmd_call(config: Config, tool: String, args: Option<String>, force: bool) -> anyhow::Result<ExitCode> {
    let args = parse_call_args(args.as_deref())?;
    let bridge = connect_bridge(&config)?;
    let catalog = tools::load_catalog(&*bridge).await?;
    tools::validate(&tool, &args, &catalog).map_err(|e| rejected_call(&tool, e))?;

    if !force && tool == tools::SHELL_TOOL {
        let guard = config.guard()?;
        let command = tools::command_from_args(&args);
        let verdict = guard.check(&command);
        if verdict.dangerous {
            match guard.policy() {
                DangerPolicy::Off => {}
                DangerPolicy::Deny => {
                    return Err(ToolError::Declined(format!(
                        "dangerous command blocked ({}); pass --force to run it",
                        verdict.reason
                    ))
                    .into());
                }
                DangerPolicy::Confirm => {
                    let decision = approval_handler()
                        .request_approval(ToolApprovalRequest {
                            call_id: "cli".to_string(),
                            tool_name: tool.clone(),
                            command: command.clone(),
                            reason: verdict.reason.clone(),
                        })
                        .await;
                    if decision != ToolApprovalDecision::Approve {
                        return Err(ToolError::Declined(format!("dangerous command rejected ({})", verdict.reason)).into());
                    }
                }
            }
        }
    }

    let raw = bridge.call_tool(&tool, args.clone()).await?;
    let result = tools::compact_tool_result(&tool, tools::normalize_result(&tool, &args, raw));
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.get("error").is_some() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_health(config: Config) -> anyhow::Result<ExitCode> {
    let bridge = connect_bridge(&config)?;
    let health = bridge.health().await?;
    println!("{health}");
    Ok(ExitCode::SUCCESS)
}

fn cmd_trace(config: &Config, trace_id: Option<String>, tail: usize) -> anyhow::Result<ExitCode> {
    let path = PathBuf::from(&config.debug.path);
    let events = match trace_id.as_deref() {
        Some(id) => read_trace(&path, id, tail)?,
        None => read_tail(&path, tail)?,
    };
    if events.is_empty() {
        println!("No trace events in {}", path.display());
    }
    for event in &events {
        println!("{}", format_event(event));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_config(config: &Config, write: Option<&Path>) -> anyhow::Result<ExitCode> {
    print!("{}", toml::to_string_pretty(&config.redacted())?);
    if let Some(path) = write {
        config.save(path)?;
        println!("\nSaved to {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_subcommand_means_chat() {
        let cli = Cli::try_parse_from(["r2pilot"]).expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
        assert!(!cli.debug);
    }

    #[test]
    fn run_and_call_arguments_parse() {
        let cli = Cli::try_parse_from(["r2pilot", "--debug", "run", "-e", "list tools", "--strict"])
            .expect("parse");
        assert!(cli.debug);
        match cli.command {
            Some(Commands::Run { exec, strict }) => {
                assert_eq!(exec, "list tools");
                assert!(strict);
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["r2pilot", "call", "termux_command", r#"{"command":"ls"}"#, "--force"])
            .expect("parse");
        match cli.command {
            Some(Commands::Call { tool, args, force }) => {
                assert_eq!(tool, "termux_command");
                assert_eq!(args.as_deref(), Some(r#"{"command":"ls"}"#));
                assert!(force);
            }
            _ => panic!("expected call"),
        }

        let cli = Cli::try_parse_from(["r2pilot", "trace", "tr_1", "--tail", "5"]).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Commands::Trace { trace_id: Some(ref id), tail: 5 }) if id == "tr_1"
        ));
    }

    #[test]
    fn call_args_default_to_empty_object() {
        assert_eq!(parse_call_args(None).expect("empty"), json!({}));
        assert_eq!(parse_call_args(Some("  ")).expect("blank"), json!({}));
        assert_eq!(
            parse_call_args(Some(r#"{"path": "/a"}"#)).expect("object"),
            json!({"path": "/a"})
        );
        assert!(parse_call_args(Some("{oops")).is_err());
    }

    #[test]
    fn validation_failures_map_to_tool_errors() {
        let missing = rejected_call("r2_nope", ValidationError::UnknownTool("r2_nope".to_string()));
        assert!(matches!(missing, ToolError::NotFound(ref name) if name == "r2_nope"));
        let bad = rejected_call("r2_open_file", ValidationError::MissingRequired("file_path".to_string()));
        assert!(bad.to_string().contains("r2_open_file: missing required parameter: file_path"));
    }

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(exit_status(&LoopOutcome::Answer("ok".to_string())), 0);
        assert_eq!(exit_status(&LoopOutcome::Halted("stopped".to_string())), 2);
        assert_eq!(exit_status(&LoopOutcome::Interrupted), 130);
    }

    #[test]
    fn command_labels_are_stable() {
        assert_eq!(Commands::Tools.label(), "tools");
        assert_eq!(
            Commands::Chat {
                strict: false,
                resume: true
            }
            .label(),
            "chat"
        );
    }
}
