//! Line-based command protocol
//!
//! ```text
//! server: spotd v0.1.0
//! client: PLAY spotify:track:4uLU6hMCjMI75M1A2tKUQC
//! server: OK
//! client: STOP
//! server: INVALID COMMAND
//! ```
//!
//! `OK` only means the line parsed. Resolution and playback failures are
//! logged on the daemon side and never reported to the client.

/// Verb prefix for the play command, including the separating space
const PLAY_PREFIX: &str = "PLAY ";

/// Reply to a line that parsed into a command
pub const REPLY_OK: &str = "OK\n";

/// Reply to a line that matched no verb
pub const REPLY_INVALID: &str = "INVALID COMMAND\n";

/// First line sent on every connection
pub fn greeting() -> String {
    format!("spotd v{}\n", crate::constants::VERSION)
}

/// Command verbs understood by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    PlayTrack,
}

/// A parsed client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub args: Vec<String>,
}

impl Command {
    pub fn play(link: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::PlayTrack,
            args: vec![link.into()],
        }
    }

    /// The link argument of a `PlayTrack` command
    pub fn link(&self) -> Option<&str> {
        match self.kind {
            CommandKind::PlayTrack => self.args.first().map(String::as_str),
        }
    }
}

/// Parse one client line.
///
/// Every CR and LF is removed first. `PLAY ` must match exactly at the start
/// (case-sensitive); whatever follows, possibly nothing, is the link.
///
/// A bare `PLAY` with no trailing space yields a command with an empty link.
pub fn parse_line(line: &str) -> Option<Command> {
    let stripped: String = line.chars().filter(|c| *c != '\r' && *c != '\n').collect();

    if let Some(link) = stripped.strip_prefix(PLAY_PREFIX) {
        return Some(Command::play(link));
    }
    if stripped == PLAY_PREFIX.trim_end() {
        return Some(Command::play(""));
    }
    None
}

/// Reply line for a parse result
pub fn reply_for(command: Option<&Command>) -> &'static str {
    match command {
        Some(_) => REPLY_OK,
        None => REPLY_INVALID,
    }
}

/// Splits a TCP byte stream into lines
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line_length: usize,
    /// The last line was cut at `max_line_length`; its terminator is still due
    after_cut: bool,
}

impl LineBuffer {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_length: max_line_length.max(1),
            after_cut: false,
        }
    }

    /// Feed received bytes and collect every complete line.
    ///
    /// Lines keep their terminator. A partial line that reaches
    /// `max_line_length` is emitted as-is, and a CR/LF arriving directly
    /// after that cut belongs to it and is dropped.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in data {
            if self.after_cut {
                match byte {
                    b'\r' => continue,
                    b'\n' => {
                        self.after_cut = false;
                        continue;
                    }
                    _ => self.after_cut = false,
                }
            }

            self.pending.push(byte);
            if byte == b'\n' {
                lines.push(self.take_pending());
            } else if self.pending.len() >= self.max_line_length {
                lines.push(self.take_pending());
                self.after_cut = true;
            }
        }

        lines
    }

    fn take_pending(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }

    /// Bytes received but not yet terminated
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_play() {
        let cmd = parse_line("PLAY spotify:track:abc\r\n").unwrap();
        assert_eq!(cmd.kind, CommandKind::PlayTrack);
        assert_eq!(cmd.args, vec!["spotify:track:abc".to_string()]);
        assert_eq!(cmd.link(), Some("spotify:track:abc"));
    }

    #[test]
    fn test_parse_empty_argument() {
        assert_eq!(parse_line("PLAY\r\n"), Some(Command::play("")));
        assert_eq!(parse_line("PLAY \n"), Some(Command::play("")));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(parse_line("STOP\r\n"), None);
        assert_eq!(parse_line("play lower\r\n"), None);
        assert_eq!(parse_line(" PLAY leading\n"), None);
        assert_eq!(parse_line("PLAYX\n"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn test_parse_keeps_argument_verbatim() {
        let cmd = parse_line("PLAY  two spaces \n").unwrap();
        assert_eq!(cmd.link(), Some(" two spaces "));
    }

    #[test]
    fn test_replies() {
        assert_eq!(reply_for(Some(&Command::play("x"))), "OK\n");
        assert_eq!(reply_for(None), "INVALID COMMAND\n");
        assert!(greeting().starts_with("spotd v"));
        assert!(greeting().ends_with('\n'));
    }

    #[test]
    fn test_line_buffer_splits() {
        let mut buf = LineBuffer::new(2000);

        assert!(buf.push(b"PLAY a").is_empty());
        assert_eq!(buf.pending_len(), 6);

        let lines = buf.push(b"\r\nPLAY b\nST");
        assert_eq!(lines, vec!["PLAY a\r\n".to_string(), "PLAY b\n".to_string()]);
        assert_eq!(buf.pending_len(), 2);
    }

    #[test]
    fn test_line_buffer_terminator_after_cut() {
        let mut buf = LineBuffer::new(8);

        let lines = buf.push(b"PLAY abc\r\nPLAY x\n");
        assert_eq!(lines, vec!["PLAY abc".to_string(), "PLAY x\n".to_string()]);
        assert_eq!(reply_for(parse_line(&lines[0]).as_ref()), REPLY_OK);

        // Same, with the terminator in a later read
        assert_eq!(buf.push(b"PLAY def"), vec!["PLAY def".to_string()]);
        assert!(buf.push(b"\r").is_empty());
        assert!(buf.push(b"\n").is_empty());
        assert_eq!(buf.pending_len(), 0);
        assert_eq!(buf.push(b"PLAY y\n"), vec!["PLAY y\n".to_string()]);
    }

    #[test]
    fn test_line_buffer_bounded() {
        let mut buf = LineBuffer::new(4);
        let lines = buf.push(b"abcdefg");
        assert_eq!(lines, vec!["abcd".to_string()]);
        assert_eq!(buf.pending_len(), 3);
    }
}
