/// Errors surfaced by [`QueueClient`](crate::QueueClient) calls.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Failed to open a TCP session to the broker.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The session is not ready; the request was never sent, or it was
    /// still waiting for a reply when the session dropped.
    #[error("Queue session is disconnected")]
    Disconnected,

    /// The broker answered with an error keyword the command declares
    /// (or one of the generic errors every command may return).
    #[error("Broker rejected command: {}", .tokens.join(" "))]
    Rejected { keyword: String, tokens: Vec<String> },

    /// The broker answered with a keyword the command does not know.
    #[error("Unexpected reply: {}", .0.join(" "))]
    UnexpectedReply(Vec<String>),

    /// A reply could not be parsed at the framing level.
    #[error("Malformed reply: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// True for a `NOT_FOUND` rejection, which peek loops use as their
    /// termination signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Rejected { keyword, .. } if keyword == "NOT_FOUND")
    }
}
