//! SGR (styling) escape-sequence parsing.
//!
//! Grammar: `ESC [ <digits and ';'>* m`. Anything else that merely looks like
//! an escape (cursor moves, OSC, a lone ESC) is not ours and stays in the text.
//!
//! Within a matched sequence, parameters are applied left to right. Unknown
//! parameters and background colors are consumed with no visible effect.

pub mod palette;

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BlockError;

pub use palette::{Rgb, Theme};

static SGR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[([0-9;]*)m").expect("SGR pattern is valid"));

static SGR_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b(\[[0-9;]*)?$").expect("SGR prefix pattern is valid"));

/// Accumulated text style. `color` is a palette index (0..16).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Style {
    pub color: Option<u8>,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

impl Style {
    pub fn is_plain(&self) -> bool {
        *self == Style::default()
    }

    pub fn foreground(&self, theme: Theme) -> Option<Rgb> {
        self.color.and_then(|i| palette::color(i, theme))
    }
}

/// A slice of escape-free text and the style it is drawn in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub text: &'a str,
    pub style: Style,
}

/// Parse `text` starting from the default style.
pub fn parse(text: &str) -> Vec<Segment<'_>> {
    parse_from(Style::default(), text).0
}

/// Parse `text` starting from `style`; also returns the style in effect at
/// the end so a caller feeding a stream can continue where it left off.
pub fn parse_from(mut style: Style, text: &str) -> (Vec<Segment<'_>>, Style) {
    let mut out = Vec::new();
    let mut cursor = 0;

    for caps in SGR.captures_iter(text) {
        let (Some(whole), Some(params)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() > cursor {
            out.push(Segment {
                text: &text[cursor..whole.start()],
                style,
            });
        }
        apply_params(&mut style, params.as_str());
        cursor = whole.end();
    }

    if cursor < text.len() {
        out.push(Segment {
            text: &text[cursor..],
            style,
        });
    }

    (out, style)
}

/// Remove every SGR sequence; all other bytes are left alone.
pub fn strip(text: &str) -> Cow<'_, str> {
    SGR.replace_all(text, "")
}

/// Split off a trailing, not-yet-terminated SGR sequence (e.g. `"\x1b[1;3"`)
/// so it can be completed by the next chunk. Returns `(complete, pending)`.
pub fn split_incomplete(text: &str) -> (&str, &str) {
    match SGR_PREFIX.find(text) {
        Some(m) => (&text[..m.start()], &text[m.start()..]),
        None => (text, ""),
    }
}

fn apply_params(style: &mut Style, params: &str) {
    // `ESC[m` is a reset.
    if params.is_empty() {
        *style = Style::default();
        return;
    }

    let codes: Vec<Option<u16>> = params
        .split(';')
        .map(|p| if p.is_empty() { Some(0) } else { p.parse().ok() })
        .collect();

    let mut i = 0;
    while i < codes.len() {
        let Some(code) = codes[i] else {
            // Numeric overflow: skip the parameter.
            i += 1;
            continue;
        };
        match code {
            0 => *style = Style::default(),
            1 => style.bold = true,
            22 => style.bold = false,
            3 => style.italic = true,
            23 => style.italic = false,
            4 => style.underline = true,
            24 => style.underline = false,
            30..=37 => style.color = Some((code - 30) as u8),
            90..=97 => style.color = Some((code - 90 + 8) as u8),
            39 => style.color = None,
            38 | 48 => match extended_color(&codes[i + 1..]) {
                Ok((consumed, index)) => {
                    if code == 38 {
                        if let Some(n) = index.filter(|n| (*n as usize) < palette::PALETTE_SIZE)
                        {
                            style.color = Some(n);
                        }
                    }
                    i += consumed;
                }
                Err(err) => {
                    tracing::trace!(%err, "dropping rest of SGR parameters");
                    return;
                }
            },
            // Background and everything else: recognised as a parameter,
            // nothing to render.
            _ => {}
        }
        i += 1;
    }
}

/// Parse the tail of a `38;…` / `48;…` selector. Returns how many extra
/// parameters it consumed and, for `5;n`, the index.
fn extended_color(rest: &[Option<u16>]) -> Result<(usize, Option<u8>), BlockError> {
    let malformed = || BlockError::Parse {
        sequence: format!("{rest:?}"),
    };
    match rest.first().copied().flatten() {
        Some(5) => {
            let n = rest.get(1).copied().flatten().ok_or_else(malformed)?;
            Ok((2, u8::try_from(n).ok()))
        }
        Some(2) => {
            if rest.len() < 4 {
                return Err(malformed());
            }
            Ok((4, None))
        }
        _ => Err(malformed()),
    }
}
