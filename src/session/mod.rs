//! RobustSession engine
//!
//! This module implements [`RobustSession`], the per-connection state
//! machine that presents a conventional stream-oriented IRC connection
//! to a host client while actually speaking the RobustIRC HTTP/JSON
//! session protocol to a set of cooperating backend servers.
//!
//! A session moves through the states
//!
//! ```text
//!             resolve OK         create OK           completion / error
//!  Resolving ─────────► Creating ─────► Streaming ─────┬─► Streaming  (transient)
//!      │                   │                           │
//!      │ resolve err       │ create err                └─► Closed     (permanent)
//!      └──► Resolving◄─────┘
//!  any ── close ──► WriteOnly ── drain POSTs ──► Closed
//! ```
//!
//! While `Streaming`, exactly one GetMessages long-poll is in flight,
//! decoding the inbound JSON stream into IRC lines, and outbound lines
//! are POSTed one at a time in submission order. Transient failures back
//! off the current target and fail over to a freshly picked one;
//! permanent failures emit [`SessionEvent::Disconnected`] and close the
//! session.
//!
//! # Host adapter
//!
//! The [`RobustSession`] handle is a write-only byte sink: `send` pushes
//! one logical IRC line, `close` drains outstanding POSTs (so quit
//! messages are delivered) and tears the session down. Inbound lines and
//! lifecycle notifications arrive on the [`RobustSession::events`]
//! stream; there is nothing to read from the handle itself.

pub mod decoder;
pub(crate) mod request;

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use reqwest::header::HeaderMap;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::http::{self, Disposition, HttpRunner};
use crate::network::NetworkRegistry;
use decoder::{FrameDecoder, RobustMessage, IRC_TO_CLIENT, ROBUST_PING};
use request::{auth_headers, CreateSessionResponse, PostMessageBody, RequestKind};

/// Lifecycle of a session. A session that reaches `Closed` never
/// re-enters any earlier state; construct a new one to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Resolving the server set via DNS SRV.
    Resolving,
    /// CreateSession in flight.
    Creating,
    /// Established: GetMessages long-poll running, sends accepted.
    Streaming,
    /// Host-initiated shutdown: draining outstanding POSTs, no reads.
    WriteOnly,
    /// Terminal.
    Closed,
}

/// Notifications emitted to the host on the [`RobustSession::events`]
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Server set resolution has started.
    Looking,
    /// The session was created; the connection is usable.
    ConnectFinished,
    /// One inbound IRC line.
    Incoming(String),
    /// A request is being reissued against a new target after a
    /// transient failure, so the operator can see flapping.
    Retry {
        url_suffix: String,
        old_target: String,
        new_target: String,
    },
    /// The session hit a permanent error and is closed.
    Disconnected { reason: String },
}

enum Command {
    Send(String),
    Close(oneshot::Sender<()>),
}

/// Handle to one RobustIRC session.
///
/// Dropping the handle destroys the session: every pending network
/// operation is cancelled and no further events are emitted. Use
/// [`RobustSession::close`] instead when queued outbound lines (such as
/// a QUIT) should still be delivered.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use futures::StreamExt;
/// use robustsession::{NetworkRegistry, RobustSession, SessionConfig, SessionEvent};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let registry = Arc::new(NetworkRegistry::new());
///     let session = RobustSession::connect(SessionConfig::new("robustirc.net"), registry)?;
///     let mut events = session.events();
///     session.send("NICK nick");
///     while let Some(event) = events.next().await {
///         if let SessionEvent::Incoming(line) = event {
///             println!("{line}");
///         }
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct RobustSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_rx: Arc<Mutex<mpsc::UnboundedReceiver<SessionEvent>>>,
    state_rx: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    gm_cancel: CancellationToken,
}

impl RobustSession {
    /// Start connecting to the network described by `config`.
    ///
    /// Returns immediately; the connection is established in the
    /// background and announced through [`SessionEvent::ConnectFinished`]
    /// on the events stream. The `registry` is shared across sessions so
    /// that backoff state for a failing server is visible to all of
    /// them.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP
    /// client pools cannot be constructed. Network failures are not
    /// errors here; they surface as events.
    pub fn connect(config: SessionConfig, registry: Arc<NetworkRegistry>) -> Result<Self> {
        config.validate()?;
        let runner = HttpRunner::new(&config)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Resolving);
        let cancel = CancellationToken::new();
        let gm_cancel = cancel.child_token();

        let engine = Engine {
            config,
            registry,
            runner,
            events: Some(event_tx),
            state: Arc::new(state_tx),
            cancel: cancel.clone(),
            gm_cancel: gm_cancel.clone(),
            cmd_rx,
        };
        tokio::spawn(engine.run());

        Ok(Self {
            cmd_tx,
            event_rx: Arc::new(Mutex::new(event_rx)),
            state_rx,
            cancel,
            gm_cancel,
        })
    }

    /// Queue one logical IRC line for delivery.
    ///
    /// Fire-and-forget: lines are POSTed in submission order, each
    /// retried across targets until delivered or the session dies.
    /// Lines queued on a closed session are silently dropped.
    pub fn send(&self, line: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Send(line.into()));
    }

    /// Close the session, delivering outstanding outbound lines first.
    ///
    /// The GetMessages long-poll is aborted immediately and no further
    /// [`SessionEvent::Incoming`] is emitted; queued POSTs (such as a
    /// QUIT sent just before) run to completion. Returns once the
    /// session reached `Closed`. Queued lines are retried across targets
    /// like any other send, so on an unreachable network this can take a
    /// while; drop the handle instead to abort without draining.
    pub async fn close(self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.gm_cancel.cancel();
        if self.cmd_tx.send(Command::Close(done_tx)).is_ok() {
            // The engine drops the sender without answering only if it
            // is already tearing down, which is just as final.
            let _ = done_rx.await;
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Stream of inbound lines and lifecycle notifications.
    ///
    /// Events are delivered in the order they occurred. The stream ends
    /// when the session is closed.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = SessionEvent> + Send + 'static>> {
        let rx = Arc::clone(&self.event_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let item = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            item.map(|item| (item, rx))
        }))
    }
}

impl Drop for RobustSession {
    /// Destroy the session: abort every pending network operation.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct CreatedSession {
    session_id: String,
    headers: HeaderMap,
}

enum CreateAttempt {
    Done(CreateSessionResponse),
    Temporary,
    Permanent(String),
}

/// The per-session background task driving the state machine.
struct Engine {
    config: SessionConfig,
    registry: Arc<NetworkRegistry>,
    runner: HttpRunner,
    /// Cleared on host close so no callback ever reaches the host again.
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
    gm_cancel: CancellationToken,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl Engine {
    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state.send(state);
    }

    async fn run(mut self) {
        self.emit(SessionEvent::Looking);
        if !self.resolve_loop().await {
            self.set_state(SessionState::Closed);
            return;
        }

        self.set_state(SessionState::Creating);
        let Some(created) = self.create_session_loop().await else {
            self.set_state(SessionState::Closed);
            return;
        };
        tracing::debug!("session {} established", created.session_id);
        self.emit(SessionEvent::ConnectFinished);
        self.set_state(SessionState::Streaming);

        let gm = GetMessagesLoop {
            registry: Arc::clone(&self.registry),
            client: self.runner.stream().clone(),
            address: self.config.address.clone(),
            plaintext: self.config.plaintext,
            session_id: created.session_id.clone(),
            headers: created.headers.clone(),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            cancel: self.gm_cancel.clone(),
            session_cancel: self.cancel.clone(),
        };
        tokio::spawn(gm.run());

        self.command_loop(&created.session_id, &created.headers)
            .await;
    }

    /// Resolve the server set, re-entering Resolving on failure until
    /// cancelled.
    ///
    /// Watches the GetMessages token rather than the session token: it
    /// fires on destroy and on host close alike, and before Streaming
    /// there is nothing worth draining.
    async fn resolve_loop(&self) -> bool {
        loop {
            tokio::select! {
                _ = self.gm_cancel.cancelled() => return false,
                resolved = self.registry.resolve(&self.config.address) => match resolved {
                    Ok(()) => return true,
                    Err(err) => {
                        tracing::warn!("resolving {} failed: {err}", self.config.address);
                        tokio::select! {
                            _ = self.gm_cancel.cancelled() => return false,
                            _ = tokio::time::sleep(self.config.resolve_retry()) => {}
                        }
                    }
                },
            }
        }
    }

    /// Issue CreateSession against random targets until one succeeds or
    /// a permanent error closes the session.
    async fn create_session_loop(&self) -> Option<CreatedSession> {
        let url_suffix = RequestKind::CreateSession.url_suffix(None);
        let mut target = self.pick(true, &self.gm_cancel).await?;
        loop {
            match self.create_session_once(&target, &url_suffix).await {
                CreateAttempt::Done(created) => {
                    self.registry.succeeded(&self.config.address, &target).await;
                    let headers = match auth_headers(&created.sessionauth) {
                        Ok(headers) => headers,
                        Err(err) => {
                            self.emit(SessionEvent::Disconnected {
                                reason: err.to_string(),
                            });
                            return None;
                        }
                    };
                    return Some(CreatedSession {
                        session_id: created.sessionid,
                        headers,
                    });
                }
                CreateAttempt::Temporary => {
                    self.registry.failed(&self.config.address, &target).await;
                    let next = self.pick(true, &self.gm_cancel).await?;
                    self.emit(SessionEvent::Retry {
                        url_suffix: url_suffix.clone(),
                        old_target: target,
                        new_target: next.clone(),
                    });
                    target = next;
                }
                CreateAttempt::Permanent(reason) => {
                    self.emit(SessionEvent::Disconnected { reason });
                    return None;
                }
            }
        }
    }

    async fn create_session_once(&self, target: &str, url_suffix: &str) -> CreateAttempt {
        let url = http::request_url(self.config.plaintext, target, url_suffix);
        let response = match self.runner.short().post(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("CreateSession on {target} failed: {err}");
                return CreateAttempt::Temporary;
            }
        };
        let status = response.status();
        match http::classify(RequestKind::CreateSession, status) {
            Disposition::Success => match response.json::<CreateSessionResponse>().await {
                Ok(created) => CreateAttempt::Done(created),
                // A malformed CreateSession response is permanent; an
                // aborted body read is not.
                Err(err) if err.is_decode() => {
                    CreateAttempt::Permanent(format!("invalid CreateSession response: {err}"))
                }
                Err(err) => {
                    tracing::warn!("CreateSession on {target} failed: {err}");
                    CreateAttempt::Temporary
                }
            },
            Disposition::Temporary => {
                tracing::warn!("CreateSession on {target} returned HTTP {status}");
                CreateAttempt::Temporary
            }
            Disposition::Permanent => {
                CreateAttempt::Permanent(format!("HTTP error code {}", status.as_u16()))
            }
        }
    }

    /// Process host commands until the session dies or the host closes
    /// it.
    async fn command_loop(&mut self, session_id: &str, headers: &HeaderMap) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(SessionState::Closed);
                    return;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None => {
                        // Handle dropped without close(); destroy.
                        self.set_state(SessionState::Closed);
                        self.cancel.cancel();
                        return;
                    }
                    Some(Command::Send(line)) => {
                        if !self.post_message(session_id, headers, &line).await {
                            self.set_state(SessionState::Closed);
                            self.cancel.cancel();
                            return;
                        }
                    }
                    Some(Command::Close(done)) => {
                        // Lines queued before close() were already
                        // delivered in submission order above; nothing
                        // may touch the host from here on.
                        self.set_state(SessionState::WriteOnly);
                        self.gm_cancel.cancel();
                        self.events = None;
                        self.set_state(SessionState::Closed);
                        self.cancel.cancel();
                        let _ = done.send(());
                        return;
                    }
                },
            }
        }
    }

    /// POST one logical IRC line, retrying across targets on transient
    /// failures. Returns false when the session must close.
    async fn post_message(&self, session_id: &str, headers: &HeaderMap, line: &str) -> bool {
        let url_suffix = RequestKind::PostMessage.url_suffix(Some(session_id));
        // The body (and with it the ClientMessageId) is built once per
        // logical message so the server can deduplicate our retries.
        let body = match serde_json::to_string(&PostMessageBody::new(line)) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("failed to encode outbound line: {err}");
                return true;
            }
        };

        let Some(mut target) = self.pick(false, &self.cancel).await else {
            return true;
        };
        loop {
            let url = http::request_url(self.config.plaintext, &target, &url_suffix);
            let status = match self
                .runner
                .short()
                .post(&url)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await
            {
                Ok(response) => Some(response.status()),
                Err(err) => {
                    tracing::warn!("PostMessage to {target} failed: {err}");
                    None
                }
            };
            match status.map(|status| (status, http::classify(RequestKind::PostMessage, status))) {
                Some((_, Disposition::Success)) => {
                    self.registry.succeeded(&self.config.address, &target).await;
                    return true;
                }
                Some((status, Disposition::Permanent)) => {
                    self.emit(SessionEvent::Disconnected {
                        reason: format!("HTTP error code {}", status.as_u16()),
                    });
                    return false;
                }
                Some((_, Disposition::Temporary)) | None => {
                    self.registry.failed(&self.config.address, &target).await;
                    let Some(next) = self.pick(false, &self.cancel).await else {
                        return true;
                    };
                    self.emit(SessionEvent::Retry {
                        url_suffix: url_suffix.clone(),
                        old_target: target,
                        new_target: next.clone(),
                    });
                    target = next;
                }
            }
        }
    }

    /// Pick a target, or None once `abort` fires.
    ///
    /// Before Streaming the GetMessages token is passed so that a host
    /// close aborts the pick; the drain after close passes the session
    /// token so queued lines still get a target.
    async fn pick(&self, random: bool, abort: &CancellationToken) -> Option<String> {
        tokio::select! {
            _ = abort.cancelled() => None,
            picked = self.registry.pick(&self.config.address, random) => match picked {
                Ok(target) => Some(target),
                Err(err) => {
                    tracing::warn!("no target for {}: {err}", self.config.address);
                    None
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// GetMessages long-poll
// ---------------------------------------------------------------------------

enum StreamEnd {
    Temporary,
    Permanent(String),
    Cancelled,
}

/// Background task maintaining the single GetMessages long-poll of a
/// session.
struct GetMessagesLoop {
    registry: Arc<NetworkRegistry>,
    client: reqwest::Client,
    address: String,
    plaintext: bool,
    session_id: String,
    headers: HeaderMap,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    state: Arc<watch::Sender<SessionState>>,
    /// Cancelled on host close, before queued POSTs drain.
    cancel: CancellationToken,
    /// Cancelled by us on permanent failure to tear the session down.
    session_cancel: CancellationToken,
}

impl GetMessagesLoop {
    fn emit(&self, event: SessionEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn run(self) {
        let url_suffix = RequestKind::GetMessages.url_suffix(Some(&self.session_id));
        let mut last_seen = String::from("0.0");
        let mut failed_target: Option<String> = None;

        loop {
            let Some(target) = self.pick().await else {
                return;
            };
            if let Some(old_target) = failed_target.take() {
                self.emit(SessionEvent::Retry {
                    url_suffix: url_suffix.clone(),
                    old_target,
                    new_target: target.clone(),
                });
            }
            match self.poll_once(&target, &url_suffix, &mut last_seen).await {
                StreamEnd::Temporary => {
                    self.registry.failed(&self.address, &target).await;
                    failed_target = Some(target);
                }
                StreamEnd::Permanent(reason) => {
                    self.emit(SessionEvent::Disconnected { reason });
                    let _ = self.state.send(SessionState::Closed);
                    self.session_cancel.cancel();
                    return;
                }
                StreamEnd::Cancelled => return,
            }
        }
    }

    /// Run one GetMessages request against `target` until the stream
    /// dies.
    async fn poll_once(
        &self,
        target: &str,
        url_suffix: &str,
        last_seen: &mut String,
    ) -> StreamEnd {
        let url = format!(
            "{}?lastseen={last_seen}",
            http::request_url(self.plaintext, target, url_suffix)
        );
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
            response = self.client.get(&url).headers(self.headers.clone()).send() => response,
        };
        let mut response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("GetMessages on {target} failed: {err}");
                return StreamEnd::Temporary;
            }
        };
        let status = response.status();
        if status.is_server_error() {
            tracing::warn!("GetMessages on {target} returned HTTP {status}");
            return StreamEnd::Temporary;
        }
        if !status.is_success() {
            return StreamEnd::Permanent(format!("HTTP error code {}", status.as_u16()));
        }

        let mut decoder = FrameDecoder::new();
        let mut deadline = Instant::now() + http::GETMESSAGES_IDLE_TIMEOUT;
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                chunk = tokio::time::timeout_at(deadline, response.chunk()) => chunk,
            };
            let bytes: bytes::Bytes = match chunk {
                Err(_elapsed) => {
                    tracing::warn!("GetMessages on {target} idle, reconnecting");
                    return StreamEnd::Temporary;
                }
                Ok(Err(err)) => {
                    tracing::warn!("GetMessages on {target} failed: {err}");
                    return StreamEnd::Temporary;
                }
                // The server closed the never-ending stream, likely
                // because it is partitioned from the cluster.
                Ok(Ok(None)) => return StreamEnd::Temporary,
                Ok(Ok(Some(bytes))) => bytes,
            };
            for message in decoder.push(&bytes) {
                self.handle_frame(target, message, last_seen, &mut deadline)
                    .await;
            }
        }
    }

    async fn handle_frame(
        &self,
        target: &str,
        message: RobustMessage,
        last_seen: &mut String,
        deadline: &mut Instant,
    ) {
        if message.message_type == IRC_TO_CLIENT && !message.data.is_empty() {
            let cursor = message.id.to_string();
            self.emit(SessionEvent::Incoming(message.data));
            // The cursor advances only after the line was dispatched, so
            // a crash in between causes re-delivery rather than loss.
            *last_seen = cursor;
        } else if message.message_type == ROBUST_PING {
            // Update the server set before prolonging the timer so that
            // a list which no longer contains |target| is noticed on the
            // next pick.
            self.registry
                .update_targets(&self.address, message.servers)
                .await;
            *deadline = Instant::now() + http::GETMESSAGES_IDLE_TIMEOUT;
        }
        self.registry.succeeded(&self.address, target).await;
    }

    async fn pick(&self) -> Option<String> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            picked = self.registry.pick(&self.address, true) => match picked {
                Ok(target) => Some(target),
                Err(err) => {
                    tracing::warn!("no target for {}: {err}", self.address);
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt as _;

    #[tokio::test]
    async fn test_connect_rejects_empty_address() {
        let registry = Arc::new(NetworkRegistry::new());
        let result = RobustSession::connect(SessionConfig::new(""), registry);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_first_event_is_looking() {
        let registry = Arc::new(NetworkRegistry::new());
        let mut config = SessionConfig::new("127.0.0.1:1,");
        config.plaintext = true;
        let session = RobustSession::connect(config, registry).expect("connect");
        let mut events = session.events();
        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("event within deadline");
        assert_eq!(event, Some(SessionEvent::Looking));
    }

    #[tokio::test]
    async fn test_dropping_the_handle_ends_the_event_stream() {
        let registry = Arc::new(NetworkRegistry::new());
        let mut config = SessionConfig::new("127.0.0.1:1,");
        config.plaintext = true;
        let session = RobustSession::connect(config, registry).expect("connect");
        let mut events = session.events();
        drop(session);
        // The engine observes cancellation and drops its event sender;
        // the stream must end rather than hang.
        let end = tokio::time::timeout(Duration::from_secs(5), async {
            while events.next().await.is_some() {}
        })
        .await;
        assert!(end.is_ok(), "event stream did not end after drop");
    }
}
