//! Incremental classifier for the output of `rsync -rP --remove-source-files`.
//!
//! The parser is fed one stdout line at a time and never looks ahead or buffers the stream. The
//! transfer tool prints nested directory entries until it reaches a concrete file, then exactly
//! one progress line for that file, so the parser only has to remember the deepest path that
//! has not been resolved by a progress line yet (the "pending path").
//!
//! ```text
//! 1234 files to consider                        -> SizeAnnounced { count: 1234 }
//! sending incremental file list                 -> (starts copy tracking)
//! subdir/                                       -> (pending = "subdir/")
//! subdir/file.mkv                               -> (pending = "subdir/file.mkv")
//!   1,234,567 100% 12.34MB/s 0:00:01 (xfr#1, to-chk=0/5)
//!                                               -> FileCompleted { path: "subdir/file.mkv", counter: 1 }
//! total size is 999999999  speedup is 2.34      -> TransferEnded
//! ```
//!
//! The literal tokens below are only valid for the `-rP` flag set used by
//! [`crate::transfer::TransferEngine`].

/// Announces how many entries the tool is about to examine.
const SIZE_TOKEN: &str = "files to consider";
/// Either marker means the file listing has begun.
const COPY_START_TOKENS: [&str; 2] = ["sending incremental file list", "created directory"];
/// Lines that never carry a path or progress while copying. `created directory` is printed right
/// after the listing marker and must not become the pending path.
const IGNORE_TOKENS: [&str; 4] = [
    "./",
    "bytes/sec",
    "sending incremental file list",
    "created directory",
];
/// Present on the final progress line of a file, the tool is moving on to the next entry.
///
/// NOTE: ignore tokens are checked first, so a progress line that also happens to contain an
/// ignore token (e.g. a path fragment with `./`) is dropped instead of resolving the pending
/// path. This precedence is inferred from observed output, not from a documented format.
const ADVANCE_TOKENS: [&str; 2] = ["to-check", "to-chk"];
const END_TOKEN: &str = "total size is";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserState {
    /// Nothing recognized yet, or the previous transfer has ended.
    #[default]
    Idle,
    /// File count has been announced, the listing has not begun yet.
    AwaitingFileCount,
    /// Inside the file listing, tracking pending paths.
    Copying,
}

/// Fields recovered from a progress line, each one best effort.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Progress {
    pub bytes: Option<u64>,
    pub percent: Option<u8>,
    pub rate: Option<String>,
}

impl Progress {
    /// Recognizes `<bytes> <percent>% <rate> <eta> [(xfr#N, to-chk=M/T)]`.
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 || !is_byte_count(fields[0]) {
            return None;
        }
        let percent = fields
            .iter()
            .find_map(|field| field.strip_suffix('%'))
            .and_then(|value| value.parse::<u8>().ok())?;
        Some(Self {
            bytes: fields[0].replace(',', "").parse::<u64>().ok(),
            percent: Some(percent),
            rate: fields
                .iter()
                .find(|field| field.ends_with("/s"))
                .map(|field| (*field).to_string()),
        })
    }
}

fn is_byte_count(field: &str) -> bool {
    field.chars().any(|c| c.is_ascii_digit())
        && field.chars().all(|c| c.is_ascii_digit() || c == ',')
}

/// A line that is neither progress-shaped nor a bare number is a sibling path announcement.
fn looks_like_path(line: &str) -> bool {
    let mut fields = line.split_whitespace().peekable();
    if fields.peek().is_some_and(|first| is_byte_count(first)) {
        return false;
    }
    !fields.any(|field| field.ends_with('%') || field.ends_with("/s") || field.starts_with("(xfr#"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    SizeAnnounced {
        count: u64,
    },
    FileCompleted {
        path: String,
        counter: u64,
        progress: Progress,
    },
    TransferEnded,
    /// Any line that carries nothing for the ledger; reported for diagnostics only.
    Noise {
        line: String,
    },
}

/// State machine turning transfer tool output into [`ParseEvent`]s.
///
/// One parser serves one transfer; it is never shared.
#[derive(Debug, Default)]
pub struct OutputParser {
    state: ParserState,
    pending_path: Option<String>,
    file_counter: u64,
}

impl OutputParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> ParserState {
        self.state
    }

    #[must_use]
    pub fn pending_path(&self) -> Option<&str> {
        self.pending_path.as_deref()
    }

    #[must_use]
    pub fn file_counter(&self) -> u64 {
        self.file_counter
    }

    /// Classifies a single line of output.
    ///
    /// Progress frames rewritten with `\r` are collapsed to the last frame and surrounding
    /// whitespace is dropped. Blank lines produce no events. Lines that cannot be classified
    /// are reported as [`ParseEvent::Noise`] and leave the state untouched.
    pub fn feed(&mut self, line: &str) -> Vec<ParseEvent> {
        let trimmed = line.trim_end();
        let line = trimmed.rsplit('\r').next().unwrap_or(trimmed).trim();
        if line.is_empty() {
            return vec![];
        }
        let event = match self.state {
            ParserState::Copying => self.feed_copying(line),
            ParserState::Idle | ParserState::AwaitingFileCount => self.feed_preamble(line),
        };
        event.into_iter().collect()
    }

    fn feed_preamble(&mut self, line: &str) -> Option<ParseEvent> {
        if let Some(index) = line.find(SIZE_TOKEN) {
            // "  1,234 files to consider" or "building file list ... 1234 files to consider"
            let count = line[..index]
                .split_whitespace()
                .next_back()
                .and_then(|field| field.replace(',', "").parse::<u64>().ok());
            return match count {
                Some(count) => {
                    self.state = ParserState::AwaitingFileCount;
                    Some(ParseEvent::SizeAnnounced { count })
                }
                None => Some(noise(line)),
            };
        }
        if COPY_START_TOKENS.iter().any(|token| line.contains(token)) {
            self.state = ParserState::Copying;
            self.pending_path = None;
            self.file_counter = 1;
            return None;
        }
        Some(noise(line))
    }

    fn feed_copying(&mut self, line: &str) -> Option<ParseEvent> {
        if IGNORE_TOKENS.iter().any(|token| line.contains(token)) {
            return Some(noise(line));
        }
        if line.contains(END_TOKEN) {
            self.pending_path = None;
            self.state = ParserState::Idle;
            return Some(ParseEvent::TransferEnded);
        }
        // nested directory announcements extend the pending path until a file is reached
        let Some(pending) = self
            .pending_path
            .clone()
            .filter(|pending| !line.contains(pending.as_str()))
        else {
            self.pending_path = Some(line.to_string());
            return None;
        };
        match Progress::parse(line) {
            Some(progress) => {
                let event = ParseEvent::FileCompleted {
                    path: pending,
                    counter: self.file_counter,
                    progress,
                };
                if ADVANCE_TOKENS.iter().any(|token| line.contains(token)) {
                    self.pending_path = None;
                    self.file_counter += 1;
                }
                Some(event)
            }
            None if looks_like_path(line) => {
                // a sibling entry replaces the unresolved one
                self.pending_path = Some(line.to_string());
                None
            }
            None => Some(noise(line)),
        }
    }
}

fn noise(line: &str) -> ParseEvent {
    ParseEvent::Noise {
        line: line.to_string(),
    }
}
