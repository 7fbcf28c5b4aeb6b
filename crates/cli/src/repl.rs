//! Line parsing and terminal rendering for the interactive chat.

use std::path::PathBuf;

use proto::{ChatMode, ProgressEvent, ToolCatalog};

const PREVIEW_CHARS: usize = 160;

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Question(String),
    Command(SlashCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    /// Drop the conversation, keep the system prompt.
    Reset,
    /// Save to the given path or the configured one.
    Save(Option<PathBuf>),
    /// Load from the given path or the configured one.
    Load(Option<PathBuf>),
    /// Switch mode; `None` prints the current one.
    Mode(Option<ChatMode>),
    Sessions,
    Trace,
    /// Re-read the config and rebuild the runtime; `keep` carries the
    /// conversation over.
    Reload { keep: bool },
    Help,
    Exit,
    /// Unknown command or bad argument, with the message to print.
    Invalid(String),
}

pub const HELP: &str = "\
Commands:
  /reset            clear the conversation (system prompt kept)
  /save [path]      save the conversation
  /load [path]      load a saved conversation
  /mode strict|loose
  /sessions         bridge sessions seen so far
  /trace            events of the last question
  /reload [keep|reset]  re-read the config, reconnect the bridge and model
  /exit             close bridge sessions and quit
Anything else is sent as a question. Ctrl-C interrupts the current question.";

pub fn parse_line(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Question(line.to_string());
    };
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());
    let path = arg.map(PathBuf::from);

    let cmd = match name.as_str() {
        "reset" | "clear" => SlashCommand::Reset,
        "save" => SlashCommand::Save(path),
        "load" => SlashCommand::Load(path),
        "mode" => match arg.map(str::parse::<ChatMode>) {
            None => SlashCommand::Mode(None),
            Some(Ok(mode)) => SlashCommand::Mode(Some(mode)),
            Some(Err(_)) => SlashCommand::Invalid("usage: /mode strict|loose".to_string()),
        },
        "sessions" => SlashCommand::Sessions,
        "trace" => SlashCommand::Trace,
        "reload" => match arg.map(str::to_ascii_lowercase).as_deref() {
            None | Some("keep") => SlashCommand::Reload { keep: true },
            Some("reset") | Some("clear") => SlashCommand::Reload { keep: false },
            Some(_) => SlashCommand::Invalid("usage: /reload [keep|reset]".to_string()),
        },
        "help" | "?" => SlashCommand::Help,
        "exit" | "quit" | "q" => SlashCommand::Exit,
        other => SlashCommand::Invalid(format!("unknown command: /{other} (try /help)")),
    };
    Input::Command(cmd)
}

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let head: String = flat.chars().take(PREVIEW_CHARS).collect();
    format!("{head}...")
}

/// Text for stderr, or `None` for events the printer skips.
///
/// Answer deltas are skipped because the final answer is printed whole.
pub fn render_progress(event: &ProgressEvent) -> Option<String> {
    match event {
        ProgressEvent::Thinking { turn } => Some(format!("\n[turn {turn}] thinking...\n")),
        ProgressEvent::ReasoningDelta(text) => Some(text.clone()),
        ProgressEvent::AnswerDelta(_) => None,
        ProgressEvent::ToolCallStarted { tool_name, args, .. } => {
            Some(format!("\n-> {tool_name} {}\n", preview(&args.to_string())))
        }
        ProgressEvent::ToolCallFinished {
            tool_name,
            output,
            is_error,
            ..
        } => {
            let status = if *is_error { "error" } else { "ok" };
            Some(format!("<- {tool_name} {status}: {}\n", preview(output)))
        }
        ProgressEvent::Notice(text) => Some(format!("[!] {text}\n")),
    }
}

/// Catalog listing for the `tools` command.
pub fn format_catalog(catalog: &ToolCatalog) -> String {
    if catalog.is_empty() {
        return "(no tools)".to_string();
    }
    let width = catalog.names().iter().map(|n| n.len()).max().unwrap_or(0);
    let mut lines = Vec::with_capacity(catalog.len() + 1);
    lines.push(format!("{} tools:", catalog.len()));
    for spec in catalog.iter() {
        let mut line = format!("  {:<width$}  required=[{}]", spec.name, spec.required.join(", "));
        let optional = spec.optional();
        if !optional.is_empty() {
            line.push_str(&format!(" optional=[{}]", optional.join(", ")));
        }
        lines.push(line);
    }
    lines.join("\n")
}
