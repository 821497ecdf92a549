//! Wire protocol shared with the ledger engine.
//!
//! Every frame is one newline-terminated line of tab-separated fields:
//!
//! ```text
//! command: <36-char id>\t<token>\t<token>...\n
//! result:  <36-char id>\t<code>\t<token>\t<token>...\n
//! ```
//!
//! Tokens are written verbatim. A token containing a tab or a newline
//! corrupts its frame; [`Command::validate`] lets callers reject such input
//! before it is submitted.

use thiserror::Error;
use uuid::Uuid;

/// Length of a hyphenated UUID on the wire.
pub const ID_LEN: usize = 36;

/// Shortest line that can hold an id, a separator and a one-digit code.
pub const MIN_FRAME_LEN: usize = ID_LEN + 2;

/// Field separator.
pub const SEPARATOR: char = '\t';

/// Status code the engine sends with the last reply of a resumable command.
pub const RESUMABLE_COMPLETE_CODE: i32 = 10;

/// Reasons a result line fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("line is shorter than a request id")]
    TooShort,
    #[error("line does not start with a valid request id")]
    BadId,
    #[error("status code is not an integer")]
    BadCode,
}

/// How many replies the engine may send for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    /// Exactly one reply.
    #[default]
    Single,
    /// Progressive replies under the same id; the caller re-registers with
    /// `Node::wait_command` after each non-terminal reply.
    Resumable,
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    id: Uuid,
    body: Vec<String>,
    kind: CommandKind,
}

impl Command {
    /// Create a single-reply command with a fresh id.
    pub fn new<I, S>(body: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_id(Uuid::new_v4(), body)
    }

    /// Create a resumable command with a fresh id.
    pub fn resumable<I, S>(body: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = Self::new(body);
        cmd.kind = CommandKind::Resumable;
        cmd
    }

    /// Create a single-reply command with a caller-chosen id.
    pub fn with_id<I, S>(id: Uuid, body: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            body: body.into_iter().map(Into::into).collect(),
            kind: CommandKind::Single,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn body(&self) -> &[String] {
        &self.body
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn is_resumable(&self) -> bool {
        self.kind == CommandKind::Resumable
    }

    /// Reject bodies that would corrupt the frame.
    ///
    /// Returns the index of the first token containing a tab or newline.
    pub fn validate(&self) -> std::result::Result<(), usize> {
        match self
            .body
            .iter()
            .position(|t| t.contains(SEPARATOR) || t.contains('\n') || t.contains('\r'))
        {
            Some(index) => Err(index),
            None => Ok(()),
        }
    }

    /// Encode the command as one frame, terminator included.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = self.id.hyphenated().to_string();
        for token in &self.body {
            line.push(SEPARATOR);
            line.push_str(token);
        }
        line.push('\n');
        line.into_bytes()
    }
}

/// A decoded reply from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub id: Uuid,
    pub code: i32,
    pub tokens: Vec<String>,
    pub decode_error: Option<DecodeError>,
}

impl CommandResult {
    /// Build a well-formed result.
    pub fn new(id: Uuid, code: i32, tokens: Vec<String>) -> Self {
        Self {
            id,
            code,
            tokens,
            decode_error: None,
        }
    }

    fn malformed(id: Uuid, error: DecodeError) -> Self {
        Self {
            id,
            code: 0,
            tokens: Vec::new(),
            decode_error: Some(error),
        }
    }

    /// Decode one result line.
    ///
    /// Never fails outright: a malformed line yields a shell with
    /// `decode_error` set so the caller can log the raw input.
    pub fn decode(line: &str) -> Self {
        if line.len() < ID_LEN {
            return Self::malformed(Uuid::nil(), DecodeError::TooShort);
        }

        let id = match line.get(..ID_LEN).and_then(|s| Uuid::try_parse(s).ok()) {
            Some(id) => id,
            None => return Self::malformed(Uuid::nil(), DecodeError::BadId),
        };

        let rest = &line[ID_LEN..];
        let rest = rest.strip_suffix('\n').unwrap_or(rest);
        let rest = rest.strip_suffix('\r').unwrap_or(rest);
        let rest = match rest.strip_prefix(SEPARATOR) {
            Some(fields) => fields,
            // Either the id field runs past 36 chars or the code is missing.
            None if rest.is_empty() => return Self::malformed(id, DecodeError::BadCode),
            None => return Self::malformed(Uuid::nil(), DecodeError::BadId),
        };

        let mut fields = rest.split(SEPARATOR);
        let code = match fields.next().map(str::parse::<i32>) {
            Some(Ok(code)) => code,
            _ => return Self::malformed(id, DecodeError::BadCode),
        };

        Self::new(id, code, fields.map(str::to_string).collect())
    }

    /// Decode one result line, turning a decode failure into an error.
    pub fn parse(line: &str) -> std::result::Result<Self, DecodeError> {
        let result = Self::decode(line);
        match result.decode_error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    /// Encode this result as the engine would send it.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = format!("{}{}{}", self.id.hyphenated(), SEPARATOR, self.code);
        for token in &self.tokens {
            line.push(SEPARATOR);
            line.push_str(token);
        }
        line.push('\n');
        line.into_bytes()
    }

    /// Whether no further replies follow this one for a resumable command.
    ///
    /// The engine marks completion with [`RESUMABLE_COMPLETE_CODE`]. Any code
    /// outside the success range is also treated as final, since an error
    /// reply is never followed by a progressive one.
    pub fn is_terminal(&self) -> bool {
        self.code == RESUMABLE_COMPLETE_CODE || !(200..=299).contains(&self.code)
    }
}
