//! beanstalkd command set and reply classification.
//!
//! Each [`Command`] knows its wire line and the reply keywords it
//! accepts. [`Expectation::classify`] turns a raw [`Reply`] into either the
//! reply itself (success) or a [`QueueError`].

use bytes::Bytes;
use tessera_core::types::JobId;

use crate::error::QueueError;

/// Reply keywords whose last token is the length of a trailing data block.
pub const PAYLOAD_REPLIES: [&str; 3] = ["RESERVED", "FOUND", "OK"];

/// Error keywords any command may receive.
pub const GENERIC_ERRORS: [&str; 4] = [
    "OUT_OF_MEMORY",
    "INTERNAL_ERROR",
    "BAD_FORMAT",
    "UNKNOWN_COMMAND",
];

/// A request to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        body: Bytes,
    },
    Use(String),
    Reserve,
    ReserveWithTimeout(u32),
    Delete(JobId),
    Release {
        id: JobId,
        pri: u32,
        delay: u32,
    },
    Bury {
        id: JobId,
        pri: u32,
    },
    Touch(JobId),
    Watch(String),
    Ignore(String),
    Peek(JobId),
    PeekReady,
    PeekDelayed,
    PeekBuried,
    Kick(u64),
    KickJob(JobId),
    Stats,
    StatsJob(JobId),
    StatsTube(String),
    ListTubes,
    ListTubeUsed,
    ListTubesWatched,
    PauseTube {
        tube: String,
        delay: u32,
    },
    Quit,
}

impl Command {
    /// Command line without the trailing CRLF. For `put` the body follows
    /// on its own line.
    pub fn line(&self) -> String {
        match self {
            Self::Put {
                pri,
                delay,
                ttr,
                body,
            } => format!("put {pri} {delay} {ttr} {}", body.len()),
            Self::Use(tube) => format!("use {tube}"),
            Self::Reserve => "reserve".to_string(),
            Self::ReserveWithTimeout(secs) => format!("reserve-with-timeout {secs}"),
            Self::Delete(id) => format!("delete {id}"),
            Self::Release { id, pri, delay } => format!("release {id} {pri} {delay}"),
            Self::Bury { id, pri } => format!("bury {id} {pri}"),
            Self::Touch(id) => format!("touch {id}"),
            Self::Watch(tube) => format!("watch {tube}"),
            Self::Ignore(tube) => format!("ignore {tube}"),
            Self::Peek(id) => format!("peek {id}"),
            Self::PeekReady => "peek-ready".to_string(),
            Self::PeekDelayed => "peek-delayed".to_string(),
            Self::PeekBuried => "peek-buried".to_string(),
            Self::Kick(bound) => format!("kick {bound}"),
            Self::KickJob(id) => format!("kick-job {id}"),
            Self::Stats => "stats".to_string(),
            Self::StatsJob(id) => format!("stats-job {id}"),
            Self::StatsTube(tube) => format!("stats-tube {tube}"),
            Self::ListTubes => "list-tubes".to_string(),
            Self::ListTubeUsed => "list-tube-used".to_string(),
            Self::ListTubesWatched => "list-tubes-watched".to_string(),
            Self::PauseTube { tube, delay } => format!("pause-tube {tube} {delay}"),
            Self::Quit => "quit".to_string(),
        }
    }

    /// Whether the broker answers this command at all.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Self::Quit)
    }

    /// Keywords this command accepts as success and as declared errors.
    pub fn expectation(&self) -> Expectation {
        let (success, errors): (&'static [&'static str], &'static [&'static str]) = match self {
            Self::Put { .. } => (
                &["INSERTED"],
                &["BURIED", "EXPECTED_CRLF", "JOB_TOO_BIG", "DRAINING"],
            ),
            Self::Use(_) | Self::ListTubeUsed => (&["USING"], &[]),
            Self::Reserve => (&["RESERVED"], &["DEADLINE_SOON", "TIMED_OUT"]),
            Self::ReserveWithTimeout(_) => (&["RESERVED", "TIMED_OUT"], &["DEADLINE_SOON"]),
            Self::Delete(_) => (&["DELETED"], &["NOT_FOUND"]),
            Self::Release { .. } => (&["RELEASED"], &["BURIED", "NOT_FOUND"]),
            Self::Bury { .. } => (&["BURIED"], &["NOT_FOUND"]),
            Self::Touch(_) => (&["TOUCHED"], &["NOT_FOUND"]),
            Self::Watch(_) => (&["WATCHING"], &[]),
            Self::Ignore(_) => (&["WATCHING"], &["NOT_IGNORED"]),
            Self::Peek(_) | Self::PeekReady | Self::PeekDelayed | Self::PeekBuried => {
                (&["FOUND"], &["NOT_FOUND"])
            }
            Self::Kick(_) => (&["KICKED"], &[]),
            Self::KickJob(_) => (&["KICKED"], &["NOT_FOUND"]),
            Self::Stats | Self::ListTubes | Self::ListTubesWatched => (&["OK"], &[]),
            Self::StatsJob(_) | Self::StatsTube(_) => (&["OK"], &["NOT_FOUND"]),
            Self::PauseTube { .. } => (&["PAUSED"], &["NOT_FOUND"]),
            Self::Quit => (&[], &[]),
        };
        Expectation { success, errors }
    }
}

/// One reply frame: the whitespace-split status line plus the data block
/// for `RESERVED`, `FOUND` and `OK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub tokens: Vec<String>,
    pub payload: Option<Bytes>,
}

impl Reply {
    pub fn keyword(&self) -> &str {
        self.tokens.first().map(String::as_str).unwrap_or_default()
    }

    /// Parse the token at `index` as a number.
    pub fn number<T: std::str::FromStr>(&self, index: usize) -> Result<T, QueueError> {
        self.tokens
            .get(index)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| {
                QueueError::Malformed(format!(
                    "expected a number at position {index} in {:?}",
                    self.tokens
                ))
            })
    }

    /// Token at `index` as a string.
    pub fn token(&self, index: usize) -> Result<&str, QueueError> {
        self.tokens
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| QueueError::Malformed(format!("missing token {index} in {:?}", self.tokens)))
    }

    /// The data block, which payload replies always carry.
    pub fn take_payload(&mut self) -> Result<Bytes, QueueError> {
        self.payload
            .take()
            .ok_or_else(|| QueueError::Malformed(format!("{} reply without data", self.keyword())))
    }
}

/// Success and declared-error keywords of one command.
#[derive(Debug, Clone, Copy)]
pub struct Expectation {
    pub success: &'static [&'static str],
    pub errors: &'static [&'static str],
}

impl Expectation {
    pub fn classify(&self, reply: Reply) -> Result<Reply, QueueError> {
        let keyword = reply.keyword();
        if self.success.contains(&keyword) {
            return Ok(reply);
        }
        if self.errors.contains(&keyword) || GENERIC_ERRORS.contains(&keyword) {
            return Err(QueueError::Rejected {
                keyword: keyword.to_string(),
                tokens: reply.tokens,
            });
        }
        Err(QueueError::UnexpectedReply(reply.tokens))
    }
}
