//! Pipelined beanstalkd client.
//!
//! [`QueueClient`] owns at most one live session. A session is a background
//! task that holds the framed TCP stream, writes requests in submission
//! order and resolves each reply against the oldest unanswered request.
//! Every operation writes its request synchronously when called and returns
//! a `'static` future for the reply, so callers can pipeline any number of
//! commands before awaiting.
//!
//! While no session is ready, calls send nothing and resolve to
//! [`QueueError::Disconnected`]. [`QueueClient::ensure_connected`] opens a
//! fresh session and replays the producing and watched tubes.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tessera_core::types::JobId;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::codec::BeanstalkCodec;
use crate::error::QueueError;
use crate::protocol::{Command, Reply};
use crate::stats::{parse_dict, parse_list, Stats};

/// Tube every new session starts out using and watching.
pub const DEFAULT_TUBE: &str = "default";

/// A job as returned by `reserve` or `peek`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub body: Bytes,
}

impl Job {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Reply>,
}

/// Submission side of a running session task.
struct SessionHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl SessionHandle {
    fn is_ready(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Tubes the client has selected, replayed onto every new session.
#[derive(Debug, Clone)]
struct TubeState {
    used: String,
    watched: Vec<String>,
}

impl Default for TubeState {
    fn default() -> Self {
        Self {
            used: DEFAULT_TUBE.to_string(),
            watched: vec![DEFAULT_TUBE.to_string()],
        }
    }
}

impl TubeState {
    fn replay_commands(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.used != DEFAULT_TUBE {
            commands.push(Command::Use(self.used.clone()));
        }
        for tube in self.watched.iter().filter(|t| *t != DEFAULT_TUBE) {
            commands.push(Command::Watch(tube.clone()));
        }
        if !self.watched.iter().any(|t| t == DEFAULT_TUBE) {
            commands.push(Command::Ignore(DEFAULT_TUBE.to_string()));
        }
        commands
    }
}

/// Client for a beanstalkd-compatible broker.
pub struct QueueClient {
    addr: String,
    session: Mutex<Option<SessionHandle>>,
    tubes: Mutex<TubeState>,
}

impl QueueClient {
    /// Create a disconnected client targeting `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            session: Mutex::new(None),
            tubes: Mutex::new(TubeState::default()),
        }
    }

    /// Create a client and make a single connection attempt.
    pub async fn connect(addr: impl Into<String>) -> Result<Self, QueueError> {
        let client = Self::new(addr);
        client.ensure_connected().await?;
        Ok(client)
    }

    /// Broker address this client connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether a session is currently ready to accept requests.
    pub fn is_connected(&self) -> bool {
        self.session
            .lock()
            .map(|s| s.as_ref().is_some_and(SessionHandle::is_ready))
            .unwrap_or(false)
    }

    /// Make one connection attempt if no session is ready.
    ///
    /// On success the tube selection made through this client is replayed
    /// before any other request can reach the new session.
    pub async fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.is_connected() {
            return Ok(());
        }

        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            QueueError::Connection(format!("failed to connect to {}: {e}", self.addr))
        })?;
        stream.set_nodelay(true)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_session(
            Framed::new(stream, BeanstalkCodec::new()),
            rx,
            self.addr.clone(),
        ));
        let handle = SessionHandle { tx };

        let replay = self.tubes_snapshot().replay_commands();
        let mut pending = Vec::with_capacity(replay.len());
        for command in replay {
            let expectation = command.expectation();
            let label = command.line();
            let (reply_tx, reply_rx) = oneshot::channel();
            if handle
                .tx
                .send(Request {
                    command,
                    reply: reply_tx,
                })
                .is_err()
            {
                return Err(QueueError::Disconnected);
            }
            pending.push((label, expectation, reply_rx));
        }

        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(handle);
        }
        tracing::info!(addr = %self.addr, "Connected to broker");

        for (label, expectation, reply_rx) in pending {
            let result = match reply_rx.await {
                Ok(reply) => expectation.classify(reply).map(|_| ()),
                Err(_) => Err(QueueError::Disconnected),
            };
            if let Err(e) = result {
                tracing::warn!(addr = %self.addr, command = %label, error = %e, "Tube replay failed");
            }
        }

        Ok(())
    }

    fn tubes_snapshot(&self) -> TubeState {
        self.tubes.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn update_tubes(&self, f: impl FnOnce(&mut TubeState)) {
        if let Ok(mut tubes) = self.tubes.lock() {
            f(&mut tubes);
        }
    }

    /// Write `command` to the live session, or fail without I/O.
    fn submit(&self, command: Command) -> Result<oneshot::Receiver<Reply>, QueueError> {
        let guard = self.session.lock().map_err(|_| QueueError::Disconnected)?;
        let Some(handle) = guard.as_ref().filter(|h| h.is_ready()) else {
            tracing::trace!(command = %command.line(), "Dropping request while disconnected");
            return Err(QueueError::Disconnected);
        };
        let (reply, rx) = oneshot::channel();
        handle
            .tx
            .send(Request { command, reply })
            .map_err(|_| QueueError::Disconnected)?;
        Ok(rx)
    }

    fn call<T, F>(
        &self,
        command: Command,
        map: F,
    ) -> impl Future<Output = Result<T, QueueError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(Reply) -> Result<T, QueueError> + Send + 'static,
    {
        let expectation = command.expectation();
        let submitted = self.submit(command);
        async move {
            let reply = submitted?.await.map_err(|_| QueueError::Disconnected)?;
            map(expectation.classify(reply)?)
        }
    }

    // ---- producing --------------------------------------------------------

    /// Enqueue `body` on the used tube. Lower `pri` is served first.
    pub fn put(
        &self,
        body: impl Into<Bytes>,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> impl Future<Output = Result<JobId, QueueError>> + Send + 'static {
        let command = Command::Put {
            pri,
            delay,
            ttr,
            body: body.into(),
        };
        self.call(command, |reply| reply.number(1))
    }

    /// Select the tube subsequent `put`s go to.
    pub fn use_tube(&self, tube: &str) -> impl Future<Output = Result<String, QueueError>> + Send + 'static {
        let name = tube.to_string();
        self.update_tubes(|t| t.used = name.clone());
        self.call(Command::Use(name), |reply| Ok(reply.token(1)?.to_string()))
    }

    // ---- consuming --------------------------------------------------------

    /// Lease the next ready job, waiting for one if necessary.
    pub fn reserve(&self) -> impl Future<Output = Result<Job, QueueError>> + Send + 'static {
        self.call(Command::Reserve, job_from_reply)
    }

    /// Lease the next ready job, or `None` once `secs` pass without one.
    pub fn reserve_with_timeout(
        &self,
        secs: u32,
    ) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send + 'static {
        self.call(Command::ReserveWithTimeout(secs), |reply| {
            if reply.keyword() == "TIMED_OUT" {
                Ok(None)
            } else {
                job_from_reply(reply).map(Some)
            }
        })
    }

    /// Acknowledge (remove) a job.
    pub fn delete(&self, id: JobId) -> impl Future<Output = Result<(), QueueError>> + Send + 'static {
        self.call(Command::Delete(id), |_| Ok(()))
    }

    /// Hand a leased job back to the ready queue.
    pub fn release(
        &self,
        id: JobId,
        pri: u32,
        delay: u32,
    ) -> impl Future<Output = Result<(), QueueError>> + Send + 'static {
        self.call(Command::Release { id, pri, delay }, |_| Ok(()))
    }

    pub fn bury(&self, id: JobId, pri: u32) -> impl Future<Output = Result<(), QueueError>> + Send + 'static {
        self.call(Command::Bury { id, pri }, |_| Ok(()))
    }

    /// Extend a lease by its ttr.
    pub fn touch(&self, id: JobId) -> impl Future<Output = Result<(), QueueError>> + Send + 'static {
        self.call(Command::Touch(id), |_| Ok(()))
    }

    /// Add `tube` to the watch list. Resolves to the number of watched tubes.
    pub fn watch(&self, tube: &str) -> impl Future<Output = Result<u32, QueueError>> + Send + 'static {
        let name = tube.to_string();
        self.update_tubes(|t| {
            if !t.watched.contains(&name) {
                t.watched.push(name.clone());
            }
        });
        self.call(Command::Watch(name), |reply| reply.number(1))
    }

    /// Remove `tube` from the watch list. The broker refuses to drop the
    /// last watched tube with `NOT_IGNORED`.
    pub fn ignore(&self, tube: &str) -> impl Future<Output = Result<u32, QueueError>> + Send + 'static {
        let name = tube.to_string();
        self.update_tubes(|t| {
            if t.watched.len() > 1 {
                t.watched.retain(|w| *w != name);
            }
        });
        self.call(Command::Ignore(name), |reply| reply.number(1))
    }

    // ---- inspection -------------------------------------------------------

    pub fn peek(&self, id: JobId) -> impl Future<Output = Result<Job, QueueError>> + Send + 'static {
        self.call(Command::Peek(id), job_from_reply)
    }

    /// Next ready job on the used tube.
    pub fn peek_ready(&self) -> impl Future<Output = Result<Job, QueueError>> + Send + 'static {
        self.call(Command::PeekReady, job_from_reply)
    }

    pub fn peek_delayed(&self) -> impl Future<Output = Result<Job, QueueError>> + Send + 'static {
        self.call(Command::PeekDelayed, job_from_reply)
    }

    pub fn peek_buried(&self) -> impl Future<Output = Result<Job, QueueError>> + Send + 'static {
        self.call(Command::PeekBuried, job_from_reply)
    }

    /// Move up to `bound` buried (or else delayed) jobs on the used tube to
    /// ready. Resolves to the number moved.
    pub fn kick(&self, bound: u64) -> impl Future<Output = Result<u64, QueueError>> + Send + 'static {
        self.call(Command::Kick(bound), |reply| reply.number(1))
    }

    pub fn kick_job(&self, id: JobId) -> impl Future<Output = Result<(), QueueError>> + Send + 'static {
        self.call(Command::KickJob(id), |_| Ok(()))
    }

    pub fn stats(&self) -> impl Future<Output = Result<Stats, QueueError>> + Send + 'static {
        self.call(Command::Stats, stats_from_reply)
    }

    pub fn stats_job(&self, id: JobId) -> impl Future<Output = Result<Stats, QueueError>> + Send + 'static {
        self.call(Command::StatsJob(id), stats_from_reply)
    }

    pub fn stats_tube(&self, tube: &str) -> impl Future<Output = Result<Stats, QueueError>> + Send + 'static {
        self.call(Command::StatsTube(tube.to_string()), stats_from_reply)
    }

    pub fn list_tubes(&self) -> impl Future<Output = Result<Vec<String>, QueueError>> + Send + 'static {
        self.call(Command::ListTubes, list_from_reply)
    }

    pub fn list_tube_used(&self) -> impl Future<Output = Result<String, QueueError>> + Send + 'static {
        self.call(Command::ListTubeUsed, |reply| Ok(reply.token(1)?.to_string()))
    }

    pub fn list_tubes_watched(
        &self,
    ) -> impl Future<Output = Result<Vec<String>, QueueError>> + Send + 'static {
        self.call(Command::ListTubesWatched, list_from_reply)
    }

    /// Stop `tube` from handing out jobs for `delay` seconds.
    pub fn pause_tube(
        &self,
        tube: &str,
        delay: u32,
    ) -> impl Future<Output = Result<(), QueueError>> + Send + 'static {
        let command = Command::PauseTube {
            tube: tube.to_string(),
            delay,
        };
        self.call(command, |_| Ok(()))
    }

    // ---- session ----------------------------------------------------------

    /// Ask the broker to close the session. Replies to requests already
    /// in flight are still delivered.
    pub fn quit(&self) -> impl Future<Output = Result<(), QueueError>> + Send + 'static {
        let submitted = self.submit(Command::Quit);
        async move {
            // The session drops the reply sender once the socket closes.
            let _ = submitted?.await;
            Ok(())
        }
    }
}

fn job_from_reply(mut reply: Reply) -> Result<Job, QueueError> {
    Ok(Job {
        id: reply.number(1)?,
        body: reply.take_payload()?,
    })
}

fn stats_from_reply(mut reply: Reply) -> Result<Stats, QueueError> {
    parse_dict(&reply.take_payload()?)
}

fn list_from_reply(mut reply: Reply) -> Result<Vec<String>, QueueError> {
    parse_list(&reply.take_payload()?)
}

/// Session task: owns the socket until it fails, the broker closes it, or
/// every client handle is gone.
///
/// Requests still waiting for a reply when the task ends have their reply
/// senders dropped, which their callers observe as
/// [`QueueError::Disconnected`].
async fn run_session(
    framed: Framed<TcpStream, BeanstalkCodec>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    addr: String,
) {
    let (mut sink, mut stream) = framed.split();
    let mut pending: VecDeque<oneshot::Sender<Reply>> = VecDeque::new();
    let mut quitting = false;

    loop {
        tokio::select! {
            request = requests.recv(), if !quitting => {
                let Some(Request { command, reply }) = request else {
                    tracing::debug!(addr = %addr, "Queue client dropped, closing session");
                    break;
                };
                let expects_reply = command.expects_reply();
                if let Err(e) = sink.send(command).await {
                    tracing::warn!(addr = %addr, error = %e, "Broker write failed");
                    break;
                }
                if expects_reply {
                    pending.push_back(reply);
                } else {
                    // quit: keep reading until earlier replies are in.
                    quitting = true;
                    if pending.is_empty() {
                        break;
                    }
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(reply)) => {
                    match pending.pop_front() {
                        Some(waiter) => {
                            let _ = waiter.send(reply);
                        }
                        None => {
                            tracing::warn!(addr = %addr, tokens = ?reply.tokens, "Unsolicited reply from broker");
                        }
                    }
                    if quitting && pending.is_empty() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(addr = %addr, error = %e, "Broker session failed");
                    break;
                }
                None => {
                    tracing::info!(addr = %addr, "Broker closed the session");
                    break;
                }
            },
        }
    }

    if !pending.is_empty() {
        tracing::warn!(
            addr = %addr,
            pending = pending.len(),
            "Failing requests left unanswered by the broker",
        );
    }
}
