//! Detects degenerate reasoning streams: models that keep emitting the same
//! short token run, the same paragraphs, or the same numbered list.
//!
//! Checks run once at fixed character checkpoints over fixed windows of the
//! accumulated reasoning. Each window is evaluated exactly once per turn.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Minimum number of consecutive periodic matches at the tail.
pub const MIN_PERIODIC_MATCHES: usize = 6;
/// Longest period searched by the block and list detectors.
pub const MAX_PERIOD: usize = 50;

const SHORT_SEQUENCE_CHECKPOINT: usize = 2_000;
const SHORT_SEQUENCE_WINDOW: usize = 200;
const SHORT_UNIT_MIN: usize = 2;
const SHORT_UNIT_MAX: usize = 6;
const SHORT_UNIT_MIN_REPEATS: usize = 4;

const FIRST_BLOCK_CHECKPOINT: usize = 3_000;
const SECOND_BLOCK_CHECKPOINT: usize = 5_000;

static ORDINAL_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+\s*[.)、．）]\s*").expect("valid ordinal regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepetitionKind {
    ShortSequenceLoop,
    ParagraphRepetition,
    OrderedListRepetition,
}

impl RepetitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RepetitionKind::ShortSequenceLoop => "short_sequence_loop",
            RepetitionKind::ParagraphRepetition => "paragraph_repetition",
            RepetitionKind::OrderedListRepetition => "ordered_list_repetition",
        }
    }
}

impl fmt::Display for RepetitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepetitionDetection {
    pub kind: RepetitionKind,
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    ShortSequence,
    Blocks { start: usize, end: usize },
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    at: usize,
    check: Check,
    done: bool,
}

/// Per-turn guard fed with reasoning deltas.
#[derive(Debug, Clone)]
pub struct RepetitionGuard {
    chars: Vec<char>,
    checkpoints: [Checkpoint; 3],
}

impl Default for RepetitionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl RepetitionGuard {
    pub fn new() -> Self {
        Self {
            chars: Vec::new(),
            checkpoints: [
                Checkpoint {
                    at: SHORT_SEQUENCE_CHECKPOINT,
                    check: Check::ShortSequence,
                    done: false,
                },
                Checkpoint {
                    at: FIRST_BLOCK_CHECKPOINT,
                    check: Check::Blocks {
                        start: 0,
                        end: FIRST_BLOCK_CHECKPOINT,
                    },
                    done: false,
                },
                Checkpoint {
                    at: SECOND_BLOCK_CHECKPOINT,
                    check: Check::Blocks {
                        start: FIRST_BLOCK_CHECKPOINT,
                        end: SECOND_BLOCK_CHECKPOINT,
                    },
                    done: false,
                },
            ],
        }
    }

    /// Runs a fresh guard over a complete reasoning text.
    pub fn scan(text: &str) -> Option<RepetitionDetection> {
        Self::new().push(text)
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.checkpoints.iter().all(|cp| cp.done)
    }

    /// Appends a reasoning delta and runs every checkpoint it crosses.
    pub fn push(&mut self, delta: &str) -> Option<RepetitionDetection> {
        if self.is_exhausted() {
            return None;
        }
        let room = SECOND_BLOCK_CHECKPOINT.saturating_sub(self.chars.len());
        self.chars.extend(delta.chars().take(room));

        for idx in 0..self.checkpoints.len() {
            let checkpoint = self.checkpoints[idx];
            if checkpoint.done || self.chars.len() < checkpoint.at {
                continue;
            }
            self.checkpoints[idx].done = true;
            let detection = match checkpoint.check {
                Check::ShortSequence => {
                    let end = SHORT_SEQUENCE_CHECKPOINT;
                    detect_short_sequence(&self.chars[end - SHORT_SEQUENCE_WINDOW..end])
                }
                Check::Blocks { start, end } => {
                    let window: String = self.chars[start..end].iter().collect();
                    detect_paragraph_repetition(&window)
                        .or_else(|| detect_ordered_list_repetition(&window))
                }
            };
            if detection.is_some() {
                return detection;
            }
        }
        None
    }
}

fn is_ideographic(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}')
}

fn is_block_boundary(c: char) -> bool {
    matches!(c, '.' | '。' | ';' | '；' | '!' | '！' | '?' | '？' | '\n')
}

fn detect_short_sequence(window: &[char]) -> Option<RepetitionDetection> {
    for unit_len in SHORT_UNIT_MIN..=SHORT_UNIT_MAX {
        let span = unit_len * SHORT_UNIT_MIN_REPEATS;
        if window.len() < span {
            break;
        }
        for start in 0..=window.len() - span {
            let unit = &window[start..start + unit_len];
            if !unit.iter().copied().any(is_ideographic) {
                continue;
            }
            let mut repeats = 1;
            let mut pos = start + unit_len;
            while pos + unit_len <= window.len() && &window[pos..pos + unit_len] == unit {
                repeats += 1;
                pos += unit_len;
            }
            if repeats >= SHORT_UNIT_MIN_REPEATS {
                let unit: String = unit.iter().collect();
                return Some(RepetitionDetection {
                    kind: RepetitionKind::ShortSequenceLoop,
                    details: format!("unit {unit:?} repeated {repeats} times"),
                });
            }
        }
    }
    None
}

/// Splits on sentence/line boundaries. The trailing fragment after the last
/// boundary is incomplete and dropped, as are blank blocks.
fn split_blocks(window: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for c in window.chars() {
        if is_block_boundary(c) {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                blocks.push(trimmed.to_string());
            }
            current.clear();
        } else {
            current.push(c);
        }
    }
    blocks
}

fn list_items(window: &str) -> Vec<String> {
    let mut lines: Vec<&str> = window.split('\n').collect();
    if !window.ends_with('\n') {
        lines.pop();
    }
    lines
        .into_iter()
        .map(|line| ORDINAL_PREFIX.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Smallest period whose tail run reaches the match threshold.
fn periodic_tail(items: &[String]) -> Option<(usize, usize)> {
    for period in 1..=MAX_PERIOD {
        if items.len() <= period {
            break;
        }
        let mut matches = 0;
        let mut idx = items.len() - 1;
        while idx >= period && items[idx] == items[idx - period] {
            matches += 1;
            idx -= 1;
        }
        if matches >= MIN_PERIODIC_MATCHES {
            return Some((period, matches));
        }
    }
    None
}

fn detect_paragraph_repetition(window: &str) -> Option<RepetitionDetection> {
    let blocks = split_blocks(window);
    let (period, matches) = periodic_tail(&blocks)?;
    Some(RepetitionDetection {
        kind: RepetitionKind::ParagraphRepetition,
        details: format!("{matches} trailing blocks repeat with period {period}"),
    })
}

fn detect_ordered_list_repetition(window: &str) -> Option<RepetitionDetection> {
    let items = list_items(window);
    let (period, matches) = periodic_tail(&items)?;
    Some(RepetitionDetection {
        kind: RepetitionKind::OrderedListRepetition,
        details: format!("{matches} trailing list items repeat with period {period}"),
    })
}
