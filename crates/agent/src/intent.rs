//! Heuristic check for answers that describe tool use without issuing calls.

use std::sync::OnceLock;

use proto::ToolCatalog;
use regex::Regex;

use crate::report::REPORT_HEADINGS;

const TOOL_NAME: &str = r"(termux_command|r2_[A-Za-z0-9_]+|os_[A-Za-z0-9_]+)";
const CLI_PROGRAMS: &str = r"(?i)\b(unzip|zipinfo|aapt2?|jadx|apktool|baksmali|smali|dexdump|dex2jar|readelf|objdump|nm|strings|binwalk|dd|grep|head|tail|sed|awk|cut|sort|wc)\b";
const PIPE_FILTER: &str = r"(?i)\|\s*(head|tail|grep|rg)\b";
const ACTION_EN: &str = r"\b(run|running|execute|executing|call|calling|check|checking|install|list|listing|extract|extracting|unzip|search|searching|find|open|opening|load|loading|analy[sz]e|analy[sz]ing|decompile|disassemble)\b";
const PLAN_EN: &str = r"(?i)\b(next|then|let me|let's|first|i will|i'll|i am going to|i'm going to|now i|try|continue)\b";
const ACTION_ZH: &str = r"(运行|执行|调用|检查|安装|列出|解压|提取|搜索|查找|打开|加载|分析|反编译|反汇编)";
const PLAN_ZH: &str = r"(下一步|接下来|让我|先|然后|尝试|继续)";
const TOOL_PHRASES: &[&str] = &[
    "tool call",
    "call the tool",
    "use the tool",
    "using the tool",
    "invoke the tool",
    "工具调用",
];

struct Patterns {
    tool_name: Regex,
    tool_name_word: Regex,
    cli_programs: Regex,
    pipe_filter: Regex,
    backtick_action_en: Regex,
    action_backtick_en: Regex,
    backtick_action_zh: Regex,
    action_backtick_zh: Regex,
    action_en: Regex,
    plan_en: Regex,
    action_zh: Regex,
    plan_zh: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                tool_name: Regex::new(TOOL_NAME).ok()?,
                tool_name_word: Regex::new(&format!(r"\b{TOOL_NAME}\b")).ok()?,
                cli_programs: Regex::new(CLI_PROGRAMS).ok()?,
                pipe_filter: Regex::new(PIPE_FILTER).ok()?,
                backtick_action_en: Regex::new(&format!(r"(?i)\b(use|using|via|with)\s*`[^`]+`.*{ACTION_EN}")).ok()?,
                action_backtick_en: Regex::new(&format!(r"(?i){ACTION_EN}\s*`[^`]+`")).ok()?,
                backtick_action_zh: Regex::new(&format!(r"(用|通过|使用)\s*`[^`]+`.*{ACTION_ZH}")).ok()?,
                action_backtick_zh: Regex::new(&format!(r"{ACTION_ZH}\s*`[^`]+`")).ok()?,
                action_en: Regex::new(&format!("(?i){ACTION_EN}")).ok()?,
                plan_en: Regex::new(PLAN_EN).ok()?,
                action_zh: Regex::new(ACTION_ZH).ok()?,
                plan_zh: Regex::new(PLAN_ZH).ok()?,
            })
        })
        .as_ref()
}

/// Whether `text` reads like a plan to use tools rather than a finished answer.
///
/// A finished three-section report never counts. Mentions of a tool name,
/// shell programs, pipelines, or a plan phrase next to an action verb do.
pub fn looks_like_unissued_tool_use(text: &str, catalog: &ToolCatalog) -> bool {
    let text = text.trim();
    if text.is_empty() {
        return false;
    }
    if REPORT_HEADINGS.iter().all(|h| text.contains(h)) {
        return false;
    }
    let Some(p) = patterns() else {
        return false;
    };

    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if p.tool_name_word.is_match(text) || p.tool_name.is_match(&compact) {
        return true;
    }
    if catalog
        .names()
        .iter()
        .any(|name| !name.is_empty() && (text.contains(name) || compact.contains(name)))
    {
        return true;
    }

    let lowered = text.to_lowercase();
    if TOOL_PHRASES.iter().any(|phrase| lowered.contains(phrase))
        || (text.contains("工具") && (text.contains("使用") || text.contains("调用")))
    {
        return true;
    }
    if p.cli_programs.is_match(text) || p.pipe_filter.is_match(text) {
        return true;
    }
    if p.backtick_action_en.is_match(text)
        || p.action_backtick_en.is_match(text)
        || p.backtick_action_zh.is_match(text)
        || p.action_backtick_zh.is_match(text)
    {
        return true;
    }
    (p.plan_en.is_match(text) && p.action_en.is_match(text))
        || (p.plan_zh.is_match(text) && p.action_zh.is_match(text))
}
