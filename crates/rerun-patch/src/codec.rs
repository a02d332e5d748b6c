use thiserror::Error;

use rerun_contracts::{PATCH_SENTINEL_FILE_CREATED, PATCH_SENTINEL_FILE_TOO_LARGE};

use crate::{split_lines, Chunk, Delta, DeltaKind, Patch, PatchBody, PatchKind};

/// Line numbers are 1-based, counted in the patch body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("patch body is not valid UTF-8")]
    NotUtf8,
    #[error("line {line}: bad delta count header {text:?}")]
    BadHeader { line: usize, text: String },
    #[error("line {line}: unknown delta type {token:?}")]
    BadDeltaType { line: usize, token: String },
    #[error("line {line}: bad positions line {text:?} (want `srcPos,tgtPos`)")]
    BadPositions { line: usize, text: String },
    #[error("line {line}: bad {what} count {text:?}")]
    BadCount {
        line: usize,
        what: &'static str,
        text: String,
    },
    #[error("unexpected end of patch after line {line}: missing {expected} for delta {delta}")]
    UnexpectedEof {
        line: usize,
        delta: usize,
        expected: &'static str,
    },
    #[error("line {line}: unexpected content after {count} declared delta(s)")]
    TrailingContent { line: usize, count: usize },
}

struct Cursor<'a> {
    lines: &'a [String],
    next: usize,
    delta: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, expected: &'static str) -> Result<(usize, &'a str), DecodeError> {
        let Some(line) = self.lines.get(self.next) else {
            return Err(DecodeError::UnexpectedEof {
                line: self.next,
                delta: self.delta,
                expected,
            });
        };
        self.next += 1;
        Ok((self.next, line.as_str()))
    }

    fn take_count(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        let (line, text) = self.take(what)?;
        let head = text.split(',').next().unwrap_or_default().trim();
        head.parse::<usize>().map_err(|_| DecodeError::BadCount {
            line,
            what,
            text: text.to_string(),
        })
    }

    fn take_chunk(&mut self, position: usize, what: &'static str) -> Result<Chunk, DecodeError> {
        let count = self.take_count(what)?;
        let mut lines = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let (_, text) = self.take(what)?;
            lines.push(text.to_string());
        }
        Ok(Chunk::new(position, lines))
    }
}

/// Decodes a logged patch body.
///
/// Layout, after an optional run of blank lines:
///
/// ```text
/// N;
/// CHANGE
/// srcPos,tgtPos
/// srcCount,
/// <srcCount raw lines>
/// tgtCount,
/// <tgtCount raw lines>
/// ... N blocks ...
/// ```
///
/// A body with no content is a zero-delta patch. Sentinel first lines short-circuit
/// the grammar.
pub fn decode(bytes: &[u8]) -> Result<PatchBody, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    let lines = split_lines(text);

    let Some(first) = lines.iter().position(|l| !l.trim().is_empty()) else {
        return Ok(PatchBody::Deltas(Patch::default()));
    };
    let header = lines[first].trim();
    if header == PATCH_SENTINEL_FILE_CREATED {
        return Ok(PatchBody::Created);
    }
    if header == PATCH_SENTINEL_FILE_TOO_LARGE {
        return Ok(PatchBody::TooLarge);
    }

    let count_text = header.strip_suffix(';').unwrap_or(header).trim();
    let count: usize = count_text.parse().map_err(|_| DecodeError::BadHeader {
        line: first + 1,
        text: header.to_string(),
    })?;

    let mut cur = Cursor {
        lines: &lines,
        next: first + 1,
        delta: 0,
    };
    let mut deltas = Vec::with_capacity(count.min(1024));
    for d in 0..count {
        cur.delta = d;
        let (line, token) = cur.take("delta type")?;
        let kind = DeltaKind::from_token(token.trim()).ok_or_else(|| DecodeError::BadDeltaType {
            line,
            token: token.trim().to_string(),
        })?;

        let (line, pos_text) = cur.take("positions")?;
        let (src_pos, tgt_pos) =
            parse_positions(pos_text).ok_or_else(|| DecodeError::BadPositions {
                line,
                text: pos_text.to_string(),
            })?;

        let source = cur.take_chunk(src_pos, "source")?;
        let target = cur.take_chunk(tgt_pos, "target")?;
        deltas.push(Delta {
            kind,
            source,
            target,
        });
    }

    if let Some(extra) = lines[cur.next..].iter().position(|l| !l.trim().is_empty()) {
        return Err(DecodeError::TrailingContent {
            line: cur.next + extra + 1,
            count,
        });
    }

    Ok(PatchBody::Deltas(Patch { deltas }))
}

fn parse_positions(text: &str) -> Option<(usize, usize)> {
    let mut parts = text.trim().split(',');
    let src = parts.next()?.trim().parse().ok()?;
    let tgt = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((src, tgt))
}

/// Renders a delta patch in the logged layout; `decode(encode(p))` yields `p`.
pub fn encode(patch: &Patch) -> String {
    let mut out = String::new();
    out.push_str(&format!("{};\n", patch.deltas.len()));
    for delta in &patch.deltas {
        out.push_str(delta.kind.token());
        out.push('\n');
        out.push_str(&format!(
            "{},{}\n",
            delta.source.position, delta.target.position
        ));
        for chunk in [&delta.source, &delta.target] {
            out.push_str(&format!("{},\n", chunk.lines.len()));
            for line in &chunk.lines {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

pub fn encode_body(body: &PatchBody) -> String {
    match body {
        PatchBody::Deltas(patch) => encode(patch),
        PatchBody::Created => format!("{PATCH_SENTINEL_FILE_CREATED}\n"),
        PatchBody::TooLarge => format!("{PATCH_SENTINEL_FILE_TOO_LARGE}\n"),
    }
}

/// Classifies a body by its first non-blank line without decoding the deltas.
pub fn detect_kind(bytes: &[u8]) -> PatchKind {
    let text = String::from_utf8_lossy(bytes);
    match text.lines().map(str::trim).find(|l| !l.is_empty()) {
        None => PatchKind::Empty,
        Some(PATCH_SENTINEL_FILE_CREATED) => PatchKind::FileCreated,
        Some(PATCH_SENTINEL_FILE_TOO_LARGE) => PatchKind::FileTooLarge,
        Some(_) => PatchKind::DeltaPatch,
    }
}
