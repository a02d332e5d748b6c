//! Decoding, encoding and replay of logged per-run source patches.
//!
//! A patch is always relative to the file's baseline snapshot, never to an earlier
//! patch, so reconstructing a file at some run needs exactly one baseline and one
//! patch body. Replay verifies every delta's source chunk against the baseline
//! before touching it; that check is the only thing standing between a drifted
//! baseline and a silently wrong reconstruction.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod codec;

pub use codec::{decode, detect_kind, encode, encode_body, DecodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Insert,
    Delete,
    Change,
}

impl DeltaKind {
    pub fn token(self) -> &'static str {
        match self {
            DeltaKind::Insert => "INSERT",
            DeltaKind::Delete => "DELETE",
            DeltaKind::Change => "CHANGE",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "INSERT" => Some(DeltaKind::Insert),
            "DELETE" => Some(DeltaKind::Delete),
            "CHANGE" => Some(DeltaKind::Change),
            _ => None,
        }
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A run of lines anchored at a zero-based line position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    pub position: usize,
    pub lines: Vec<String>,
}

impl Chunk {
    pub fn new(position: usize, lines: Vec<String>) -> Self {
        Self { position, lines }
    }

    fn end(&self) -> usize {
        self.position.saturating_add(self.lines.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub kind: DeltaKind,
    pub source: Chunk,
    pub target: Chunk,
}

/// Ordered deltas taking a baseline to one run's content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub deltas: Vec<Delta>,
}

/// A decoded patch body: either real deltas or one of the logger's sentinels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchBody {
    Deltas(Patch),
    /// The file first appeared this run; the baseline already holds its content.
    Created,
    /// The logger refused to diff the file; its content is gone.
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchKind {
    Empty,
    FileCreated,
    FileTooLarge,
    DeltaPatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchApplyError {
    #[error(
        "delta {index} ({kind}) expects {expected} source line(s) at line {position}, \
         but the baseline only has {available} line(s)"
    )]
    OutOfRange {
        index: usize,
        kind: DeltaKind,
        position: usize,
        expected: usize,
        available: usize,
    },
    #[error("delta {index} ({kind}) source mismatch at line {line}: expected {expected:?}, found {found:?}")]
    Mismatch {
        index: usize,
        kind: DeltaKind,
        line: usize,
        expected: String,
        found: String,
    },
    #[error("delta {index} overlaps or precedes delta {previous}")]
    Overlap { index: usize, previous: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("file was logged as too large; its content cannot be reconstructed")]
pub struct Unreconstructible;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Apply(#[from] PatchApplyError),
    #[error(transparent)]
    Unreconstructible(#[from] Unreconstructible),
}

/// Splits text into lines the way the logger reads them: `\n` or `\r\n`
/// terminators, no phantom empty line after a final terminator.
pub fn split_lines(text: &str) -> Vec<String> {
    let mut out: Vec<String> = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
        .collect();
    if text.is_empty() || text.ends_with('\n') {
        out.pop();
    }
    out
}

/// Joins lines with a `\n` after every line.
pub fn join_lines(lines: &[String]) -> String {
    let cap = lines.iter().map(|l| l.len() + 1).sum();
    let mut out = String::with_capacity(cap);
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Applies `patch` to `baseline`, verifying every source chunk first.
pub fn apply(baseline: &[String], patch: &Patch) -> Result<Vec<String>, PatchApplyError> {
    for (i, pair) in patch.deltas.windows(2).enumerate() {
        if pair[0].source.end() > pair[1].source.position {
            return Err(PatchApplyError::Overlap {
                index: i + 1,
                previous: i,
            });
        }
    }

    let mut out = baseline.to_vec();
    for (index, delta) in patch.deltas.iter().enumerate().rev() {
        verify_source(&out, index, delta)?;
        let pos = delta.source.position;
        match delta.kind {
            DeltaKind::Insert => {
                out.splice(pos..pos, delta.target.lines.iter().cloned());
            }
            DeltaKind::Delete => {
                out.drain(pos..delta.source.end());
            }
            DeltaKind::Change => {
                out.splice(pos..delta.source.end(), delta.target.lines.iter().cloned());
            }
        }
    }
    Ok(out)
}

fn verify_source(lines: &[String], index: usize, delta: &Delta) -> Result<(), PatchApplyError> {
    let src = &delta.source;
    if src.end() > lines.len() {
        return Err(PatchApplyError::OutOfRange {
            index,
            kind: delta.kind,
            position: src.position,
            expected: src.lines.len(),
            available: lines.len(),
        });
    }
    for (offset, expected) in src.lines.iter().enumerate() {
        let found = &lines[src.position + offset];
        if found != expected {
            return Err(PatchApplyError::Mismatch {
                index,
                kind: delta.kind,
                line: src.position + offset,
                expected: expected.clone(),
                found: found.clone(),
            });
        }
    }
    Ok(())
}

/// Reconstructs one run's lines from a baseline and an already decoded body.
pub fn replay(baseline: &[String], body: &PatchBody) -> Result<Vec<String>, ReplayError> {
    match body {
        PatchBody::Created => Ok(baseline.to_vec()),
        PatchBody::TooLarge => Err(Unreconstructible.into()),
        PatchBody::Deltas(patch) => Ok(apply(baseline, patch)?),
    }
}

/// Decodes `patch` and replays it against `baseline` text.
pub fn replay_text(baseline: &str, patch: &[u8]) -> Result<Vec<String>, ReplayError> {
    let body = decode(patch)?;
    replay(&split_lines(baseline), &body)
}
