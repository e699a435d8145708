//! Turn detection on the live child-output stream.
//!
//! The detector segments output into completed turns: the raw bytes between
//! the user's input submission and the line on which the next prompt is
//! recognized. Prompt matching runs on an ANSI-stripped projection; the
//! captured content keeps the raw bytes untouched.
//!
//! Three phases:
//! - *pre-ready* — nothing is emitted until the first prompt is seen (the
//!   session-ready signal),
//! - *idle* — awaiting input; characters echoed while the user types arrive
//!   here and are never accumulated,
//! - *responding* — entered on input submission; raw bytes accumulate until
//!   the next prompt match closes the turn.
//!
//! The wrapper reports input bytes via [`TurnDetector::note_input`] as it
//! writes them to the master — before the child's echo comes back. For input
//! delivered in one write (a pasted line, a broker inject) that echo arrives
//! inside the response window, so the detector remembers the submitted line
//! and skips its echo at the window start; see `consume_echo`.

use regex::bytes::Regex;

use crate::ansi::AnsiStripper;

/// Default cap on a single turn's accumulated bytes.
pub const DEFAULT_TURN_CAP_BYTES: usize = 4 * 1024 * 1024;

// The stripped tail line only exists for prompt matching; keep it small with
// the usual append-and-trim discipline.
const LINE_MAX_BYTES: usize = 4096;
const LINE_KEEP_BYTES: usize = 2048;

// Pending-input bytes kept for echo suppression. Input beyond this is left
// unmatched; suppression then degrades to the mismatch path.
const TYPED_MAX_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTurn {
    pub content: Vec<u8>,
    pub interrupted: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    PreReady,
    Idle,
    Responding,
}

/// Progress of echo suppression at the start of a response window.
#[derive(Debug)]
enum EchoState {
    /// Skipping output bytes that replay the submitted input.
    Matching { expected: Vec<u8>, pos: usize },
    /// No (further) echo expected; everything is content.
    Done,
}

pub struct TurnDetector {
    pattern: Regex,
    cap: usize,
    phase: Phase,
    stripper: AnsiStripper,
    /// Current stripped line tail (no terminating newline yet).
    line: Vec<u8>,
    /// Raw bytes of the response window. Bounded by `cap`.
    raw: Vec<u8>,
    /// Total raw bytes seen this window, including dropped ones.
    window_len: usize,
    /// Window offset where the current line begins (just past the last `\n`).
    line_start: usize,
    /// Input bytes written to the master since the last submission.
    typed: Vec<u8>,
    echo: EchoState,
    interrupted: bool,
    overflowed: bool,
}

impl TurnDetector {
    pub fn new(pattern: Regex, cap: usize) -> Self {
        Self {
            pattern,
            cap,
            phase: Phase::PreReady,
            stripper: AnsiStripper::new(),
            line: Vec::new(),
            raw: Vec::new(),
            window_len: 0,
            line_start: 0,
            typed: Vec::new(),
            echo: EchoState::Done,
            interrupted: false,
            overflowed: false,
        }
    }

    /// Whether the first prompt has been seen yet.
    pub fn ready(&self) -> bool {
        self.phase != Phase::PreReady
    }

    /// Observe input bytes on their way to the PTY master, typed or
    /// injected. Must be called in write order, before the corresponding
    /// echo can arrive through [`TurnDetector::feed`].
    pub fn note_input(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match b {
                0x03 => self.note_interrupt(),
                b'\r' | b'\n' => self.note_submission(),
                _ => {
                    if self.typed.len() < TYPED_MAX_BYTES {
                        self.typed.push(b);
                    }
                }
            }
        }
    }

    fn note_submission(&mut self) {
        let typed = std::mem::take(&mut self.typed);
        match self.phase {
            Phase::PreReady => {}
            Phase::Idle => {
                self.phase = Phase::Responding;
                self.raw.clear();
                self.window_len = 0;
                self.line_start = 0;
                self.overflowed = false;
                self.echo = if typed.is_empty() {
                    EchoState::Done
                } else {
                    EchoState::Matching {
                        expected: typed,
                        pos: 0,
                    }
                };
            }
            Phase::Responding => {
                // A further line submitted into the same window (multi-line
                // paste or inject): its echo follows the previous line's
                // terminator.
                if let EchoState::Matching { expected, .. } = &mut self.echo {
                    expected.extend_from_slice(b"\r\n");
                    expected.extend_from_slice(&typed);
                }
            }
        }
    }

    fn note_interrupt(&mut self) {
        if self.phase == Phase::Responding {
            self.interrupted = true;
        }
    }

    /// Feed a chunk of child output in master-read order. Returns any turns
    /// completed inside this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<CompletedTurn> {
        let mut turns = Vec::new();
        let mut stripped = Vec::new();
        for &byte in chunk {
            let mut suppressed = false;
            if self.phase == Phase::Responding {
                suppressed = self.consume_echo(byte);
                if !suppressed {
                    if self.raw.len() < self.cap {
                        self.raw.push(byte);
                    } else {
                        self.overflowed = true;
                    }
                    self.window_len += 1;
                }
            }
            // Line starts track raw newlines; a prompt match on the line the
            // newline just terminated cuts at the line's own start. Echo
            // bytes are outside the window and move no offsets.
            let terminated_line_start = self.line_start;
            if byte == b'\n' && !suppressed {
                self.line_start = self.window_len;
            }

            stripped.clear();
            self.stripper.feed(std::slice::from_ref(&byte), &mut stripped);
            for &sb in &stripped {
                if sb == b'\n' {
                    let matched = !self.line.is_empty() && self.pattern.is_match(&self.line);
                    self.line.clear();
                    if matched {
                        if let Some(turn) = self.on_prompt(terminated_line_start) {
                            turns.push(turn);
                        }
                    }
                } else {
                    self.line.push(sb);
                    if self.line.len() > LINE_MAX_BYTES {
                        let start = self.line.len() - LINE_KEEP_BYTES;
                        self.line.drain(..start);
                    }
                    // Prompts wait for input, so the closing line never gets
                    // its newline: test the growing tail as well. Checking at
                    // every byte keeps detection independent of how the
                    // stream was chunked.
                    if self.pattern.is_match(&self.line) {
                        if let Some(turn) = self.on_prompt(self.line_start) {
                            turns.push(turn);
                        }
                    }
                }
            }
        }
        turns
    }

    /// Try to swallow one output byte as the echo of submitted input.
    /// Tolerates LF-only echoes of a CRLF terminator; the first real
    /// mismatch abandons suppression for the rest of the window, so agents
    /// that never echo (TUI input boxes) lose nothing.
    fn consume_echo(&mut self, byte: u8) -> bool {
        let (suppressed, finished) = match &mut self.echo {
            EchoState::Done => (false, false),
            EchoState::Matching { expected, pos } => {
                let step = match expected.get(*pos) {
                    Some(&e) if e == byte => 1,
                    Some(&b'\r')
                        if byte == b'\n' && expected.get(*pos + 1) == Some(&b'\n') =>
                    {
                        2
                    }
                    _ => 0,
                };
                if step == 0 {
                    (false, true)
                } else {
                    *pos += step;
                    (true, *pos >= expected.len())
                }
            }
        };
        if finished {
            self.echo = EchoState::Done;
        }
        suppressed
    }

    /// Handle a prompt detection whose prompt line begins at `boundary`
    /// (window offset). Emits a turn only in *responding* and only when the
    /// window holds content outside the prompt line.
    fn on_prompt(&mut self, boundary: usize) -> Option<CompletedTurn> {
        // The matched prompt text is consumed; without this, a tail match
        // would leave it in the line view to re-match against the next
        // window's first bytes.
        self.line.clear();
        match self.phase {
            Phase::PreReady | Phase::Idle => {
                self.phase = Phase::Idle;
                None
            }
            Phase::Responding => {
                self.phase = Phase::Idle;
                self.echo = EchoState::Done;
                let cut = boundary.min(self.raw.len());
                let mut content = self.raw[..cut].to_vec();
                trim_submission_echo(&mut content);
                let interrupted = std::mem::take(&mut self.interrupted);
                let truncated = std::mem::take(&mut self.overflowed);
                self.raw.clear();
                self.window_len = 0;
                self.line_start = 0;
                if content.is_empty() {
                    None
                } else {
                    Some(CompletedTurn {
                        content,
                        interrupted,
                        truncated,
                    })
                }
            }
        }
    }
}

/// Drop the echoed terminator of the submission keystroke itself from the
/// front of the captured content.
fn trim_submission_echo(content: &mut Vec<u8>) {
    if content.starts_with(b"\r\n") {
        content.drain(..2);
    } else if matches!(content.first(), Some(b'\r') | Some(b'\n')) {
        content.drain(..1);
    }
}
