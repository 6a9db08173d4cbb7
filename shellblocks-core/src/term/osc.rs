use std::borrow::Cow;

/// Upper bound on a buffered OSC payload; longer ones are dropped.
const MAX_PAYLOAD: usize = 4096;

/// OSC events the block pipeline cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OscEvent {
    /// OSC 7;file://...  (best-effort decoded path)
    Cwd(String),

    /// OSC 133;A  prompt start
    PromptStart,

    /// OSC 133;B  command start (user hit enter / command is about to run)
    CommandStart,

    /// OSC 133;C  output begins
    CommandExecuted,

    /// OSC 133;D;<exit>
    CommandFinished { exit_code: Option<i32> },

    /// Anything else (payload string, without terminator)
    Unknown(String),
}

/// Output of one `feed` call: the text with OSC sequences removed, plus the
/// events they carried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scanned {
    pub text: String,
    pub events: Vec<OscEvent>,
}

/// Streaming OSC scanner (handles BEL or ST terminators). Sequences split
/// across `feed` calls are reassembled; a trailing lone ESC is held until the
/// next call decides whether it starts an OSC.
#[derive(Debug, Default, Clone)]
pub struct OscScanner {
    in_osc: bool,
    saw_esc: bool,
    buf: Vec<u8>,
    overflowed: bool,
}

impl OscScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, text: &str) -> Scanned {
        let mut out = Scanned {
            text: String::with_capacity(text.len()),
            events: Vec::new(),
        };

        for c in text.chars() {
            if !self.in_osc {
                // OSC introducer: ESC ]  or single-char 0x9d
                if self.saw_esc {
                    self.saw_esc = false;
                    if c == ']' {
                        self.begin();
                        continue;
                    }
                    out.text.push('\x1b');
                }

                match c {
                    '\x1b' => self.saw_esc = true,
                    '\u{9d}' => self.begin(),
                    c => out.text.push(c),
                }
                continue;
            }

            // Inside OSC. Terminators: BEL (0x07) or ST (ESC \).
            if self.saw_esc {
                self.saw_esc = false;
                if c == '\\' {
                    self.finish(&mut out.events);
                    continue;
                }
                self.push('\x1b');
                self.push(c);
                continue;
            }

            match c {
                '\x1b' => self.saw_esc = true,
                '\x07' => self.finish(&mut out.events),
                c => self.push(c),
            }
        }

        out
    }

    /// Give back anything held between calls (a lone trailing ESC). An
    /// unterminated OSC is dropped.
    pub fn flush(&mut self) -> String {
        if self.in_osc {
            tracing::trace!(bytes = self.buf.len(), "unterminated OSC dropped");
        }
        let held = if self.saw_esc && !self.in_osc {
            "\x1b".to_string()
        } else {
            String::new()
        };
        *self = Self::default();
        held
    }

    fn begin(&mut self) {
        self.in_osc = true;
        self.overflowed = false;
        self.buf.clear();
    }

    fn push(&mut self, c: char) {
        if self.buf.len() >= MAX_PAYLOAD {
            self.overflowed = true;
            return;
        }
        let mut tmp = [0u8; 4];
        self.buf.extend_from_slice(c.encode_utf8(&mut tmp).as_bytes());
    }

    fn finish(&mut self, events: &mut Vec<OscEvent>) {
        self.in_osc = false;
        if self.overflowed {
            tracing::trace!("oversized OSC payload dropped");
            self.buf.clear();
            return;
        }
        if self.buf.is_empty() {
            return;
        }
        let payload = String::from_utf8_lossy(&self.buf);
        events.push(parse_osc_payload(payload));
        self.buf.clear();
    }
}

fn parse_osc_payload(payload: Cow<'_, str>) -> OscEvent {
    let s = payload.trim_matches('\0').trim();

    if let Some(rest) = s.strip_prefix("7;") {
        return OscEvent::Cwd(decode_file_uri_to_path(rest));
    }

    if let Some(rest) = s.strip_prefix("133;") {
        if rest.starts_with('A') {
            return OscEvent::PromptStart;
        }
        if rest.starts_with('B') {
            return OscEvent::CommandStart;
        }
        if rest.starts_with('C') {
            return OscEvent::CommandExecuted;
        }
        if let Some(d) = rest.strip_prefix('D') {
            let exit_code = d.split(';').nth(1).and_then(|x| x.trim().parse::<i32>().ok());
            return OscEvent::CommandFinished { exit_code };
        }
    }

    OscEvent::Unknown(s.to_string())
}

/// Accepts `file://host/path`, `file:///path`, `file://localhost/C:/...` or a
/// raw path. The host part is discarded.
fn decode_file_uri_to_path(uri: &str) -> String {
    let u = uri.trim();

    let Some(rest) = u.strip_prefix("file://") else {
        return percent_decode(u);
    };

    let path = match rest.find('/') {
        Some(pos) => &rest[pos..],
        None => "/",
    };

    // "/C:/Users" -> "C:\Users"
    let b = path.as_bytes();
    if b.len() >= 3 && b[0] == b'/' && b[1].is_ascii_alphabetic() && b[2] == b':' {
        return percent_decode(&path[1..]).replace('/', "\\");
    }
    percent_decode(path)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cwd_with_bel() {
        let mut scanner = OscScanner::new();
        let out = scanner.feed("before\x1b]7;file://myhost/home/user/src\x07after");
        assert_eq!(out.text, "beforeafter");
        assert_eq!(out.events, vec![OscEvent::Cwd("/home/user/src".into())]);
    }

    #[test]
    fn test_exit_code_with_st() {
        let mut scanner = OscScanner::new();
        let out = scanner.feed("\x1b]133;D;127\x1b\\$ ");
        assert_eq!(out.text, "$ ");
        assert_eq!(
            out.events,
            vec![OscEvent::CommandFinished { exit_code: Some(127) }]
        );
    }

    #[test]
    fn test_prompt_markers() {
        let mut scanner = OscScanner::new();
        let out = scanner.feed("\x1b]133;A\x07\x1b]133;B\x07\x1b]133;C\x07\x1b]133;D\x07");
        assert_eq!(
            out.events,
            vec![
                OscEvent::PromptStart,
                OscEvent::CommandStart,
                OscEvent::CommandExecuted,
                OscEvent::CommandFinished { exit_code: None },
            ]
        );
        assert!(out.text.is_empty());
    }

    #[test]
    fn test_split_across_feeds() {
        let mut scanner = OscScanner::new();
        let first = scanner.feed("out\x1b");
        assert_eq!(first.text, "out");
        let second = scanner.feed("]7;file:///tmp/a%20b");
        assert!(second.events.is_empty());
        let third = scanner.feed("\x07done");
        assert_eq!(third.text, "done");
        assert_eq!(third.events, vec![OscEvent::Cwd("/tmp/a b".into())]);
    }

    #[test]
    fn test_sgr_passes_through() {
        let mut scanner = OscScanner::new();
        let out = scanner.feed("\x1b[31mred\x1b[0m");
        assert_eq!(out.text, "\x1b[31mred\x1b[0m");
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_flush_returns_held_escape() {
        let mut scanner = OscScanner::new();
        assert_eq!(scanner.feed("x\x1b").text, "x");
        assert_eq!(scanner.flush(), "\x1b");
        assert_eq!(scanner.flush(), "");
    }

    #[test]
    fn test_unterminated_osc_dropped_on_flush() {
        let mut scanner = OscScanner::new();
        let out = scanner.feed("a\x1b]7;file:///never");
        assert_eq!(out.text, "a");
        assert_eq!(scanner.flush(), "");
        assert_eq!(scanner.feed("b").text, "b");
    }

    #[test]
    fn test_windows_drive_uri() {
        assert_eq!(
            decode_file_uri_to_path("file://localhost/C:/Users/me"),
            "C:\\Users\\me"
        );
        assert_eq!(decode_file_uri_to_path("/plain/path"), "/plain/path");
    }

    #[test]
    fn test_unknown_payload() {
        let mut scanner = OscScanner::new();
        let out = scanner.feed("\x1b]0;window title\x07");
        assert_eq!(out.events, vec![OscEvent::Unknown("0;window title".into())]);
    }
}
