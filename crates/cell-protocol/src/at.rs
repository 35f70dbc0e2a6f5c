//! AT Command Text Protocol
//!
//! Commands are ASCII lines terminated by `\r`. The modem answers with zero
//! or more information lines followed by one terminal result line:
//!
//! ```text
//! AT+CSQ\r                -> host to modem
//! \r\n+CSQ: 21,99\r\n     -> information line
//! \r\nOK\r\n              -> terminal line
//! ```
//!
//! Terminal lines: `OK`, `ERROR`, `NO CARRIER`, `BUSY`, `NO ANSWER`,
//! `+CME ERROR: <n>` and `+CMS ERROR: <n>`.

use crate::ProtocolCodec;

/// Line appended to a command that does not already end in a valid terminator
pub const CMD_SEPARATOR: char = '\r';

/// Characters accepted as the end of a command (`\x1a` ends an SMS body)
pub const VALID_TERMINATORS: [char; 4] = ['\r', '\n', '\x1a', '\x1b'];

/// Prompt the modem sends when it expects a data body
pub const PROMPT: char = '>';

const OK: &str = "OK";
const ERROR: &str = "ERROR";
const NO_CARRIER: &str = "NO CARRIER";
const BUSY: &str = "BUSY";
const NO_ANSWER: &str = "NO ANSWER";
const CME_ERROR: &str = "+CME ERROR:";
const CMS_ERROR: &str = "+CMS ERROR:";

/// Outcome of one command exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResultCode {
    /// Terminal `OK`, or the expected number of lines arrived
    Ok,
    /// `ERROR`, `NO CARRIER`, `BUSY` or `NO ANSWER`
    Error,
    /// No terminal line before the deadline
    Timeout,
    /// Mobile equipment error with its numeric code
    CmeError(u32),
    /// Message service error with its numeric code
    CmsError(u32),
    /// The transport never started delivering data
    ReceivingNotStarted,
    /// The transport refused the command bytes
    TransmissionNotStarted,
    /// The multiplexer link failed while the command was in flight
    CmuxFrameError,
    /// Data that is neither a response nor a known URC
    DataNotUsed,
    /// The per-channel response buffer overflowed
    FullMsgBuffer,
}

impl ResultCode {
    /// Whether the command succeeded
    pub fn is_ok(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::Error => "ERROR",
            ResultCode::Timeout => "TIMEOUT",
            ResultCode::CmeError(_) => "CME_ERROR",
            ResultCode::CmsError(_) => "CMS_ERROR",
            ResultCode::ReceivingNotStarted => "RECEIVING_NOT_STARTED",
            ResultCode::TransmissionNotStarted => "TRANSMISSION_NOT_STARTED",
            ResultCode::CmuxFrameError => "CMUX_FRAME_ERROR",
            ResultCode::DataNotUsed => "DATA_NOT_USED",
            ResultCode::FullMsgBuffer => "FULL_MSG_BUFFER",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::CmeError(n) | ResultCode::CmsError(n) => write!(f, "{}({})", self.name(), n),
            _ => f.write_str(self.name()),
        }
    }
}

/// Result of a command: code plus every non-empty response line
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AtResult {
    /// Outcome
    pub code: ResultCode,
    /// Response lines in arrival order, terminal line included
    pub response: Vec<String>,
}

impl AtResult {
    /// Result with no response lines
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            response: Vec::new(),
        }
    }

    /// Whether the command succeeded
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Last response line, usually the terminal one
    pub fn last_line(&self) -> Option<&str> {
        self.response.last().map(String::as_str)
    }

    /// Body of the first line starting with `head` (e.g. `+CSQ:`), trimmed
    ///
    /// Only successful results are searched.
    pub fn line_for(&self, head: &str) -> Option<&str> {
        if !self.is_ok() {
            return None;
        }
        self.response
            .iter()
            .find_map(|line| line.strip_prefix(head))
            .map(str::trim)
    }

    /// Comma-separated tokens of the line starting with `head`
    pub fn tokens_for(&self, head: &str) -> Option<Vec<String>> {
        self.line_for(head)
            .map(|body| body.split(',').map(|t| t.trim().to_string()).collect())
    }
}

/// Classify a single response line as terminal
///
/// Returns `None` for information lines.
pub fn terminal_code(line: &str) -> Option<ResultCode> {
    let line = line.trim();
    match line {
        OK => Some(ResultCode::Ok),
        ERROR | NO_CARRIER | BUSY | NO_ANSWER => Some(ResultCode::Error),
        _ => {
            if let Some(rest) = line.strip_prefix(CME_ERROR) {
                Some(ResultCode::CmeError(parse_error_number(rest)))
            } else if let Some(rest) = line.strip_prefix(CMS_ERROR) {
                Some(ResultCode::CmsError(parse_error_number(rest)))
            } else {
                None
            }
        }
    }
}

fn parse_error_number(rest: &str) -> u32 {
    // Verbose error mode reports text instead of a number
    rest.trim().parse().unwrap_or(0)
}

/// Append the command separator unless the text already ends in a valid terminator
pub fn format_command(cmd: &str) -> String {
    match cmd.chars().last() {
        Some(c) if VALID_TERMINATORS.contains(&c) => cmd.to_string(),
        _ => format!("{}{}", cmd, CMD_SEPARATOR),
    }
}

/// Command text without line terminators, for logging
pub fn printable(cmd: &str) -> String {
    cmd.chars().filter(|c| !matches!(c, '\r' | '\n')).collect()
}

/// Accumulates response text until a command is resolved
///
/// Resolution happens on a terminal line, when `expected_tokens` lines
/// have been collected (non-zero counts only), or on the `>` prompt when
/// created with [`AtStream::with_prompt`].
#[derive(Debug, Default)]
pub struct AtStream {
    pending: String,
    lines: Vec<String>,
    expected_tokens: usize,
    stop_on_prompt: bool,
    code: Option<ResultCode>,
}

impl AtStream {
    /// Create a stream resolving on a terminal line or `expected_tokens` lines
    pub fn new(expected_tokens: usize) -> Self {
        Self {
            expected_tokens,
            ..Default::default()
        }
    }

    /// Create a stream that additionally resolves on the data prompt
    pub fn with_prompt(expected_tokens: usize) -> Self {
        Self {
            stop_on_prompt: true,
            ..Self::new(expected_tokens)
        }
    }

    /// Feed received text
    pub fn write(&mut self, text: &str) {
        if self.is_ready() {
            return;
        }
        self.pending.push_str(text);

        while let Some(pos) = self.pending.find(['\r', '\n']) {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.lines.push(line.to_string());

            if let Some(code) = terminal_code(line) {
                self.code = Some(code);
                return;
            }
            if self.expected_tokens > 0 && self.lines.len() >= self.expected_tokens {
                self.code = Some(ResultCode::Ok);
                return;
            }
        }

        // The prompt is not followed by a line break
        if self.stop_on_prompt && self.pending.trim_start().starts_with(PROMPT) {
            self.lines.push(PROMPT.to_string());
            self.pending.clear();
            self.code = Some(ResultCode::Ok);
        }
    }

    /// Whether the command is resolved
    pub fn is_ready(&self) -> bool {
        self.code.is_some()
    }

    /// Lines collected so far
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Final result, if resolved
    pub fn result(&self) -> Option<AtResult> {
        self.code.map(|code| AtResult {
            code,
            response: self.lines.clone(),
        })
    }

    /// Consume the stream, resolving unfinished exchanges with `fallback`
    pub fn into_result(self, fallback: ResultCode) -> AtResult {
        AtResult {
            code: self.code.unwrap_or(fallback),
            response: self.lines,
        }
    }
}

/// Streaming splitter producing one trimmed, non-empty line at a time
#[derive(Debug, Default)]
pub struct LineCodec {
    buffer: Vec<u8>,
}

impl LineCodec {
    /// Largest partial line kept while waiting for its terminator
    pub const MAX_LINE: usize = 4096;

    /// Create an empty codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes waiting for a line terminator
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

impl ProtocolCodec for LineCodec {
    type Item = String;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > Self::MAX_LINE {
            let excess = self.buffer.len() - Self::MAX_LINE;
            self.buffer.drain(..excess);
            tracing::warn!("Line buffer overflow, dropped {} bytes", excess);
        }
    }

    fn next_item(&mut self) -> Option<Self::Item> {
        self.next_item_with_bytes().map(|(line, _)| line)
    }

    fn next_item_with_bytes(&mut self) -> Option<(Self::Item, Vec<u8>)> {
        loop {
            let pos = self.buffer.iter().position(|&b| b == b'\r' || b == b'\n')?;
            let bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&bytes).trim().to_string();
            if !line.is_empty() {
                return Some((line, bytes));
            }
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_lines() {
        assert_eq!(terminal_code("OK"), Some(ResultCode::Ok));
        assert_eq!(terminal_code("\r\nERROR\r\n"), Some(ResultCode::Error));
        assert_eq!(terminal_code("NO CARRIER"), Some(ResultCode::Error));
        assert_eq!(terminal_code("BUSY"), Some(ResultCode::Error));
        assert_eq!(terminal_code("NO ANSWER"), Some(ResultCode::Error));
        assert_eq!(terminal_code("+CME ERROR: 10"), Some(ResultCode::CmeError(10)));
        assert_eq!(terminal_code("+CMS ERROR: 500"), Some(ResultCode::CmsError(500)));
        assert_eq!(terminal_code("+CSQ: 21,99"), None);
        assert_eq!(terminal_code("OKAY"), None);
    }

    #[test]
    fn test_format_command() {
        assert_eq!(format_command("AT"), "AT\r");
        assert_eq!(format_command("AT\r"), "AT\r");
        assert_eq!(format_command("hello\x1a"), "hello\x1a");
        assert_eq!(format_command(""), "\r");
    }

    #[test]
    fn test_stream_resolves_on_ok() {
        let mut stream = AtStream::new(0);
        stream.write("\r\n+CSQ: 21");
        assert!(!stream.is_ready());
        stream.write(",99\r\n\r\nOK\r\n");
        let result = stream.result().unwrap();
        assert_eq!(result.code, ResultCode::Ok);
        assert_eq!(result.response, vec!["+CSQ: 21,99", "OK"]);
        assert_eq!(result.tokens_for("+CSQ:").unwrap(), vec!["21", "99"]);
    }

    #[test]
    fn test_stream_cme_error() {
        let mut stream = AtStream::new(0);
        stream.write("\r\n+CME ERROR: 10\r\n");
        assert_eq!(stream.result().unwrap().code, ResultCode::CmeError(10));
    }

    #[test]
    fn test_stream_expected_tokens() {
        let mut stream = AtStream::new(2);
        stream.write("first\r\n");
        assert!(!stream.is_ready());
        stream.write("second\r\nthird\r\n");
        let result = stream.result().unwrap();
        assert_eq!(result.code, ResultCode::Ok);
        assert_eq!(result.response.len(), 2);
    }

    #[test]
    fn test_stream_prompt() {
        let mut stream = AtStream::with_prompt(0);
        stream.write("\r\n> ");
        let result = stream.result().unwrap();
        assert_eq!(result.code, ResultCode::Ok);
        assert_eq!(result.last_line(), Some(">"));

        let mut plain = AtStream::new(0);
        plain.write("\r\n> ");
        assert!(!plain.is_ready());
    }

    #[test]
    fn test_unfinished_stream_uses_fallback() {
        let mut stream = AtStream::new(0);
        stream.write("partial\r\n");
        let result = stream.into_result(ResultCode::Timeout);
        assert_eq!(result.code, ResultCode::Timeout);
        assert_eq!(result.response, vec!["partial"]);
    }

    #[test]
    fn test_line_for_requires_success() {
        let result = AtResult {
            code: ResultCode::Error,
            response: vec!["+COPS: 0".into(), "ERROR".into()],
        };
        assert!(result.line_for("+COPS:").is_none());
    }

    #[test]
    fn test_line_codec() {
        let mut codec = LineCodec::new();
        codec.push_bytes(b"\r\nRDY\r\n\r\n+CF");
        assert_eq!(codec.next_item().as_deref(), Some("RDY"));
        assert!(codec.next_item().is_none());
        codec.push_bytes(b"UN: 1\r\n");
        assert_eq!(codec.next_item().as_deref(), Some("+CFUN: 1"));
        assert!(codec.next_item().is_none());
        assert!(codec.pending().is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(ResultCode::CmeError(3).to_string(), "CME_ERROR(3)");
        assert_eq!(ResultCode::Timeout.to_string(), "TIMEOUT");
        assert_eq!(printable("AT+CSQ\r\n"), "AT+CSQ");
    }
}
