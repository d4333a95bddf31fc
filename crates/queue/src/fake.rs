//! In-memory beanstalkd for tests.
//!
//! [`FakeBroker`] listens on an ephemeral loopback port and speaks enough
//! of the protocol to exercise every [`QueueClient`](crate::QueueClient)
//! operation: tubes, priorities, delays, ttr reclaim, burying, kicking,
//! peeking, stats and pausing. Reserve calls poll the shared state, so a
//! blocking `reserve` wakes up within a few milliseconds of a matching
//! `put` from another session.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_TUBE: &str = "default";
const RESERVE_POLL: Duration = Duration::from_millis(5);

/// Behaviour switches for a [`FakeBroker`].
#[derive(Debug, Clone, Default)]
pub struct FakeBrokerOptions {
    /// Write every reply one byte at a time, flushing in between.
    pub split_replies: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ready,
    Delayed(Instant),
    Reserved { session: u64, deadline: Instant },
    Buried,
}

impl Status {
    fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Delayed(_) => "delayed",
            Self::Reserved { .. } => "reserved",
            Self::Buried => "buried",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredJob {
    tube: String,
    pri: u32,
    ttr: u32,
    body: Vec<u8>,
    status: Status,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: u64,
    jobs: BTreeMap<u64, StoredJob>,
    paused: HashMap<String, Instant>,
}

impl BrokerState {
    /// Promote expired delays and reclaim leases whose ttr ran out.
    fn settle(&mut self, now: Instant) {
        for job in self.jobs.values_mut() {
            match job.status {
                Status::Delayed(until) if until <= now => job.status = Status::Ready,
                Status::Reserved { deadline, .. } if deadline <= now => job.status = Status::Ready,
                _ => {}
            }
        }
    }

    fn count(&self, tube: Option<&str>, name: &str) -> usize {
        self.jobs
            .values()
            .filter(|j| tube.map_or(true, |t| j.tube == t) && j.status.name() == name)
            .count()
    }

    fn release_session(&mut self, session: u64) {
        for job in self.jobs.values_mut() {
            if matches!(job.status, Status::Reserved { session: s, .. } if s == session) {
                job.status = Status::Ready;
            }
        }
    }
}

/// A running in-memory broker. Dropping it stops the listener and closes
/// every session.
pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    shutdown: CancellationToken,
    sessions: Arc<Mutex<CancellationToken>>,
}

impl FakeBroker {
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(FakeBrokerOptions::default()).await
    }

    pub async fn start_with(options: FakeBrokerOptions) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let shutdown = CancellationToken::new();
        let sessions = Arc::new(Mutex::new(CancellationToken::new()));

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            shutdown.clone(),
            Arc::clone(&sessions),
            options,
        ));

        Ok(Self {
            addr,
            state,
            shutdown,
            sessions,
        })
    }

    /// `host:port` to hand to a client.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Close every open session while keeping the listener and all jobs.
    pub fn drop_connections(&self) {
        if let Ok(mut token) = self.sessions.lock() {
            token.cancel();
            *token = CancellationToken::new();
        }
    }

    /// Number of jobs in any state on `tube`.
    pub fn jobs_in(&self, tube: &str) -> usize {
        lock(&self.state).jobs.values().filter(|j| j.tube == tube).count()
    }

    /// Number of jobs in any state on any tube.
    pub fn total_jobs(&self) -> usize {
        lock(&self.state).jobs.len()
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(token) = self.sessions.lock() {
            token.cancel();
        }
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<Mutex<BrokerState>>,
    shutdown: CancellationToken,
    sessions: Arc<Mutex<CancellationToken>>,
    options: FakeBrokerOptions,
) {
    let next_session = AtomicU64::new(1);
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let Ok((stream, _)) = accepted else {
            continue;
        };
        let Ok(cancel) = sessions.lock().map(|t| t.clone()) else {
            return;
        };
        let id = next_session.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(serve_session(
            stream,
            id,
            Arc::clone(&state),
            cancel,
            options.clone(),
        ));
    }
}

struct Session {
    id: u64,
    used: String,
    watched: Vec<String>,
    state: Arc<Mutex<BrokerState>>,
}

async fn serve_session(
    stream: TcpStream,
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    cancel: CancellationToken,
    options: FakeBrokerOptions,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut session = Session {
        id,
        used: DEFAULT_TUBE.to_string(),
        watched: vec![DEFAULT_TUBE.to_string()],
        state: Arc::clone(&state),
    };

    loop {
        let mut line = String::new();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let args: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = args.split_first() else {
            continue;
        };

        let reply = match name {
            "quit" => break,
            "put" => match read_put_body(&mut reader, args).await {
                Ok(Ok((pri, delay, ttr, body))) => session.put(pri, delay, ttr, body),
                Ok(Err(reply)) => reply,
                Err(_) => break,
            },
            "reserve" => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    reply = session.reserve(None) => reply,
                }
            }
            "reserve-with-timeout" => match parse_args::<1>(args) {
                Some([secs]) => tokio::select! {
                    _ = cancel.cancelled() => break,
                    reply = session.reserve(Some(Duration::from_secs(secs))) => reply,
                },
                None => status("BAD_FORMAT"),
            },
            _ => session.handle(name, args),
        };

        if write_reply(&mut write, &reply, options.split_replies)
            .await
            .is_err()
        {
            break;
        }
    }

    lock(&state).release_session(id);
}

type PutArgs = (u32, u64, u32, Vec<u8>);

async fn read_put_body(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    args: &[&str],
) -> std::io::Result<Result<PutArgs, Vec<u8>>> {
    let Some([pri, delay, ttr, len]) = parse_args::<4>(args) else {
        return Ok(Err(status("BAD_FORMAT")));
    };
    let mut body = vec![0u8; len as usize + 2];
    reader.read_exact(&mut body).await?;
    if !body.ends_with(b"\r\n") {
        return Ok(Err(status("EXPECTED_CRLF")));
    }
    body.truncate(len as usize);
    Ok(Ok((pri as u32, delay, ttr as u32, body)))
}

fn parse_args<const N: usize>(args: &[&str]) -> Option<[u64; N]> {
    if args.len() != N {
        return None;
    }
    let mut out = [0u64; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg.parse().ok()?;
    }
    Some(out)
}

fn status(line: &str) -> Vec<u8> {
    format!("{line}\r\n").into_bytes()
}

fn with_data(head: &str, data: &[u8]) -> Vec<u8> {
    let mut out = format!("{head} {}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn yaml_list<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<u8> {
    let mut out = String::from("---\n");
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
    out.into_bytes()
}

fn yaml_dict(entries: &[(&str, String)]) -> Vec<u8> {
    let mut out = String::from("---\n");
    for (key, value) in entries {
        out.push_str(&format!("{key}: {value}\n"));
    }
    out.into_bytes()
}

async fn write_reply(
    write: &mut OwnedWriteHalf,
    reply: &[u8],
    split: bool,
) -> std::io::Result<()> {
    if split {
        for byte in reply {
            write.write_all(std::slice::from_ref(byte)).await?;
            write.flush().await?;
            tokio::task::yield_now().await;
        }
        Ok(())
    } else {
        write.write_all(reply).await
    }
}

impl Session {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        let mut state = lock(&self.state);
        state.settle(Instant::now());
        state
    }

    fn put(&mut self, pri: u32, delay: u64, ttr: u32, body: Vec<u8>) -> Vec<u8> {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        let status = if delay > 0 {
            Status::Delayed(Instant::now() + Duration::from_secs(delay))
        } else {
            Status::Ready
        };
        state.jobs.insert(
            id,
            StoredJob {
                tube: self.used.clone(),
                pri,
                ttr: ttr.max(1),
                body,
                status,
            },
        );
        status_line(format!("INSERTED {id}"))
    }

    fn try_reserve(&self) -> Option<Vec<u8>> {
        let mut state = self.state();
        let now = Instant::now();
        let paused: BTreeSet<String> = state
            .paused
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(tube, _)| tube.clone())
            .collect();

        let (&id, _) = state
            .jobs
            .iter()
            .filter(|(_, j)| {
                j.status == Status::Ready
                    && self.watched.contains(&j.tube)
                    && !paused.contains(&j.tube)
            })
            .min_by_key(|(id, j)| (j.pri, **id))?;

        let job = state.jobs.get_mut(&id)?;
        job.status = Status::Reserved {
            session: self.id,
            deadline: now + Duration::from_secs(u64::from(job.ttr)),
        };
        Some(with_data(&format!("RESERVED {id}"), &job.body))
    }

    async fn reserve(&self, timeout: Option<Duration>) -> Vec<u8> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(reply) = self.try_reserve() {
                return reply;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return status("TIMED_OUT");
            }
            tokio::time::sleep(RESERVE_POLL).await;
        }
    }

    fn owned_job<'s>(&self, state: &'s mut BrokerState, id: u64) -> Option<&'s mut StoredJob> {
        state
            .jobs
            .get_mut(&id)
            .filter(|j| matches!(j.status, Status::Reserved { session, .. } if session == self.id))
    }

    fn handle(&mut self, name: &str, args: &[&str]) -> Vec<u8> {
        match (name, args) {
            ("use", [tube]) => {
                self.used = tube.to_string();
                status_line(format!("USING {tube}"))
            }
            ("watch", [tube]) => {
                if !self.watched.iter().any(|t| t == tube) {
                    self.watched.push(tube.to_string());
                }
                status_line(format!("WATCHING {}", self.watched.len()))
            }
            ("ignore", [tube]) => {
                if self.watched.len() == 1 && self.watched[0] == *tube {
                    return status("NOT_IGNORED");
                }
                self.watched.retain(|t| t != tube);
                status_line(format!("WATCHING {}", self.watched.len()))
            }
            ("list-tube-used", []) => status_line(format!("USING {}", self.used)),
            ("list-tubes-watched", []) => {
                with_data("OK", &yaml_list(self.watched.iter().map(String::as_str)))
            }
            ("list-tubes", []) => {
                let state = self.state();
                let mut tubes: BTreeSet<&str> = state.jobs.values().map(|j| j.tube.as_str()).collect();
                tubes.insert(DEFAULT_TUBE);
                tubes.insert(&self.used);
                tubes.extend(self.watched.iter().map(String::as_str));
                with_data("OK", &yaml_list(tubes))
            }
            ("peek-ready", []) => self.peek_where(|j| j.status == Status::Ready, |_, j| j.pri as u64),
            ("peek-delayed", []) => self.peek_where(
                |j| matches!(j.status, Status::Delayed(_)),
                |id, _| id,
            ),
            ("peek-buried", []) => self.peek_where(|j| j.status == Status::Buried, |id, _| id),
            ("stats", []) => {
                let state = self.state();
                with_data(
                    "OK",
                    &yaml_dict(&[
                        ("current-jobs-ready", state.count(None, "ready").to_string()),
                        ("current-jobs-reserved", state.count(None, "reserved").to_string()),
                        ("current-jobs-delayed", state.count(None, "delayed").to_string()),
                        ("current-jobs-buried", state.count(None, "buried").to_string()),
                        ("total-jobs", state.next_id.to_string()),
                    ]),
                )
            }
            ("stats-tube", [tube]) => {
                let state = self.state();
                let known = *tube == DEFAULT_TUBE
                    || state.jobs.values().any(|j| j.tube == *tube)
                    || self.used == *tube
                    || self.watched.iter().any(|t| t == tube);
                if !known {
                    return status("NOT_FOUND");
                }
                let t = Some(*tube);
                with_data(
                    "OK",
                    &yaml_dict(&[
                        ("name", tube.to_string()),
                        ("current-jobs-ready", state.count(t, "ready").to_string()),
                        ("current-jobs-reserved", state.count(t, "reserved").to_string()),
                        ("current-jobs-delayed", state.count(t, "delayed").to_string()),
                        ("current-jobs-buried", state.count(t, "buried").to_string()),
                    ]),
                )
            }
            ("pause-tube", [tube, delay]) => {
                let Ok(delay) = delay.parse::<u64>() else {
                    return status("BAD_FORMAT");
                };
                self.state()
                    .paused
                    .insert(tube.to_string(), Instant::now() + Duration::from_secs(delay));
                status("PAUSED")
            }
            ("kick", [bound]) => {
                let Ok(bound) = bound.parse::<usize>() else {
                    return status("BAD_FORMAT");
                };
                let mut state = self.state();
                let used = self.used.clone();
                let buried: Vec<u64> = state
                    .jobs
                    .iter()
                    .filter(|(_, j)| j.tube == used && j.status == Status::Buried)
                    .map(|(id, _)| *id)
                    .collect();
                let candidates: Vec<u64> = if buried.is_empty() {
                    state
                        .jobs
                        .iter()
                        .filter(|(_, j)| j.tube == used && matches!(j.status, Status::Delayed(_)))
                        .map(|(id, _)| *id)
                        .collect()
                } else {
                    buried
                };
                let kicked: Vec<u64> = candidates.into_iter().take(bound).collect();
                for id in &kicked {
                    if let Some(job) = state.jobs.get_mut(id) {
                        job.status = Status::Ready;
                    }
                }
                status_line(format!("KICKED {}", kicked.len()))
            }
            (_, [id, rest @ ..]) if is_job_command(name) => {
                let Ok(id) = id.parse::<u64>() else {
                    return status("BAD_FORMAT");
                };
                self.handle_job(name, id, rest)
            }
            _ if is_known(name) => status("BAD_FORMAT"),
            _ => status("UNKNOWN_COMMAND"),
        }
    }

    fn handle_job(&self, name: &str, id: u64, rest: &[&str]) -> Vec<u8> {
        let mut state = self.state();
        let now = Instant::now();
        match (name, rest) {
            ("delete", []) => {
                let deletable = state.jobs.get(&id).is_some_and(|j| match j.status {
                    Status::Reserved { session, .. } => session == self.id,
                    _ => true,
                });
                if deletable {
                    state.jobs.remove(&id);
                    status("DELETED")
                } else {
                    status("NOT_FOUND")
                }
            }
            ("release", [pri, delay]) => {
                let (Ok(pri), Ok(delay)) = (pri.parse::<u32>(), delay.parse::<u64>()) else {
                    return status("BAD_FORMAT");
                };
                match self.owned_job(&mut state, id) {
                    Some(job) => {
                        job.pri = pri;
                        job.status = if delay > 0 {
                            Status::Delayed(now + Duration::from_secs(delay))
                        } else {
                            Status::Ready
                        };
                        status("RELEASED")
                    }
                    None => status("NOT_FOUND"),
                }
            }
            ("bury", [pri]) => {
                let Ok(pri) = pri.parse::<u32>() else {
                    return status("BAD_FORMAT");
                };
                match self.owned_job(&mut state, id) {
                    Some(job) => {
                        job.pri = pri;
                        job.status = Status::Buried;
                        status("BURIED")
                    }
                    None => status("NOT_FOUND"),
                }
            }
            ("touch", []) => match self.owned_job(&mut state, id) {
                Some(job) => {
                    job.status = Status::Reserved {
                        session: self.id,
                        deadline: now + Duration::from_secs(u64::from(job.ttr)),
                    };
                    status("TOUCHED")
                }
                None => status("NOT_FOUND"),
            },
            ("peek", []) => match state.jobs.get(&id) {
                Some(job) => with_data(&format!("FOUND {id}"), &job.body),
                None => status("NOT_FOUND"),
            },
            ("kick-job", []) => match state.jobs.get_mut(&id) {
                Some(job) if matches!(job.status, Status::Buried | Status::Delayed(_)) => {
                    job.status = Status::Ready;
                    status("KICKED")
                }
                _ => status("NOT_FOUND"),
            },
            ("stats-job", []) => match state.jobs.get(&id) {
                Some(job) => with_data(
                    "OK",
                    &yaml_dict(&[
                        ("id", id.to_string()),
                        ("tube", job.tube.clone()),
                        ("state", job.status.name().to_string()),
                        ("pri", job.pri.to_string()),
                        ("ttr", job.ttr.to_string()),
                    ]),
                ),
                None => status("NOT_FOUND"),
            },
            _ => status("BAD_FORMAT"),
        }
    }

    /// First job on the used tube matching `filter`, by `key` then id.
    fn peek_where(
        &self,
        filter: impl Fn(&StoredJob) -> bool,
        key: impl Fn(u64, &StoredJob) -> u64,
    ) -> Vec<u8> {
        let state = self.state();
        state
            .jobs
            .iter()
            .filter(|(_, j)| j.tube == self.used && filter(*j))
            .min_by_key(|(id, j)| (key(**id, *j), **id))
            .map(|(id, j)| with_data(&format!("FOUND {id}"), &j.body))
            .unwrap_or_else(|| status("NOT_FOUND"))
    }
}

fn status_line(line: String) -> Vec<u8> {
    status(&line)
}

fn is_job_command(name: &str) -> bool {
    matches!(
        name,
        "delete" | "release" | "bury" | "touch" | "peek" | "kick-job" | "stats-job"
    )
}

fn is_known(name: &str) -> bool {
    is_job_command(name)
        || matches!(
            name,
            "use"
                | "watch"
                | "ignore"
                | "list-tube-used"
                | "list-tubes-watched"
                | "list-tubes"
                | "peek-ready"
                | "peek-delayed"
                | "peek-buried"
                | "stats"
                | "stats-tube"
                | "pause-tube"
                | "kick"
        )
}
