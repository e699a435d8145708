//! Wrapper configuration: prompt pattern selection and limits.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use regex::bytes::Regex;

use crate::detector::DEFAULT_TURN_CAP_BYTES;

/// Built-in prompt patterns. All are end-anchored so they match the
/// unterminated prompt tail, and tolerate a leading carriage return from
/// TUI line redraws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    Claude,
    Aider,
    Generic,
}

impl Preset {
    pub fn pattern(self) -> &'static str {
        match self {
            Preset::Claude => r"(?:^|\r)[>❯] ?$",
            Preset::Aider => r"(?:^|\r)[a-z-]*> ?$",
            Preset::Generic => r"(?:^|\r)[#$%>❯] ?$",
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct WrapConfig {
    /// Prompt preset used when no custom pattern is given.
    #[arg(long, value_enum, default_value = "generic")]
    pub preset: Preset,

    /// Custom prompt regex, matched against ANSI-stripped output lines.
    #[arg(long, conflicts_with = "preset")]
    pub pattern: Option<String>,

    /// Cap on a single turn's accumulated bytes; overflow marks the turn
    /// truncated.
    #[arg(long, default_value_t = DEFAULT_TURN_CAP_BYTES)]
    pub turn_cap_bytes: usize,

    /// The agent command to wrap.
    #[arg(required = true)]
    pub command: String,

    /// Arguments passed through to the agent.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl WrapConfig {
    /// The regex source in effect, custom or preset.
    pub fn pattern_source(&self) -> String {
        self.pattern
            .clone()
            .unwrap_or_else(|| self.preset.pattern().to_string())
    }

    /// Validate and compile the prompt pattern. Patterns are immutable for
    /// the session's lifetime, so all rejection happens here, before the
    /// child is spawned.
    pub fn compiled_pattern(&self) -> Result<Regex> {
        let source = self.pattern_source();
        if source.contains('\n') {
            bail!("prompt patterns must be single-line (literal newline found)");
        }
        Regex::new(&source).with_context(|| format!("invalid prompt pattern {source:?}"))
    }
}
