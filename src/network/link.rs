//! The per-connection protocol link actor.
//!
//! A [`ProtocolLink`] owns one TCP connection to a device peer. It frames
//! outgoing commands into wire envelopes, guards every one of them with an
//! acknowledge deadline, matches inbound acknowledges by reference, and runs
//! the periodic heartbeat exchange that detects silent connection death.
//!
//! The link runs as a dedicated task processing, in one `tokio::select!`
//! loop: commands from its [`LinkHandle`], inbound frames (forwarded by a
//! reader task through an mpsc so the loop only awaits cancel-safe
//! primitives), the heartbeat interval, and the earliest acknowledge
//! deadline. Everything the device layer needs to know comes back as
//! [`LinkEvent`]s.
//!
//! # Guarantees
//!
//! - For every outgoing command exactly one of `AckReceived` or `AckTimeout`
//!   is emitted, after which the command is deregistered; teardown emits
//!   `AckTimeout` for whatever is still outstanding, exactly once each.
//! - A heartbeat reply must echo `sent + 1` (wrapping); anything else is
//!   reported as a heartbeat problem. A heartbeat acknowledge timeout is
//!   fatal to the connection; probes are internal and never surface as
//!   `AckTimeout`.
//! - The server role validates inbound frames against the message catalog;
//!   the client role does not.

use crate::error::{MasterError, MasterResult};
use crate::messages::{AckStatus, Command, Ref, RefSource};
use crate::network::catalog::MessageValidator;
use crate::network::protocol::{Envelope, HEARTBEAT_CLIENT, HEARTBEAT_SERVER};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMMAND_MAILBOX: usize = 32;
const LINE_MAILBOX: usize = 64;
/// Sleep horizon used when no deadline is armed.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Which side of the device/master pair this link plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Accepting side; initiates heartbeats and validates inbound frames.
    Server,
    /// Connecting side; answers heartbeats, skips validation.
    Client,
}

/// Per-link protocol settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub role: LinkRole,
    /// Deadline applied to every outgoing command without its own timeout.
    pub ack_timeout: Duration,
    /// Heartbeat probe interval while the connection is up.
    pub heartbeat_interval: Duration,
}

impl LinkConfig {
    pub fn new(role: LinkRole) -> Self {
        Self {
            role,
            ack_timeout: Duration::from_millis(3000),
            heartbeat_interval: Duration::from_millis(2000),
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }
}

/// Notifications the link sends to the device layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The matching acknowledge arrived in time.
    AckReceived {
        reference: Ref,
        name: String,
        status: AckStatus,
    },
    /// No acknowledge arrived before the deadline (or the link was torn
    /// down with the command still outstanding).
    AckTimeout { reference: Ref, name: String },
    /// The peer's heartbeat reply did not echo `sent + 1`.
    HeartbeatProblem { sent: u16, got: u16 },
    /// The peer sent a command of its own.
    PeerCommand(Envelope),
    /// The connection died (peer closed, write failed, heartbeat timed out).
    ConnectionLost { reason: String },
}

/// Requests the device layer sends to the link.
#[derive(Debug)]
enum LinkCommand {
    Execute(Command),
    Acknowledge {
        reference: Ref,
        cmd_name: String,
        status: AckStatus,
    },
}

/// Cloneable handle for driving a running link.
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<LinkCommand>,
    shutdown: watch::Sender<bool>,
}

impl LinkHandle {
    /// Send a command out on the wire; the outcome arrives as a
    /// [`LinkEvent::AckReceived`] or [`LinkEvent::AckTimeout`].
    pub async fn execute(&self, command: Command) -> MasterResult<()> {
        self.tx
            .send(LinkCommand::Execute(command))
            .await
            .map_err(|_| MasterError::ChannelNotBound)
    }

    /// Acknowledge a peer command received via [`LinkEvent::PeerCommand`].
    pub async fn acknowledge(
        &self,
        reference: Ref,
        cmd_name: impl Into<String>,
        status: AckStatus,
    ) -> MasterResult<()> {
        self.tx
            .send(LinkCommand::Acknowledge {
                reference,
                cmd_name: cmd_name.into(),
                status,
            })
            .await
            .map_err(|_| MasterError::ChannelNotBound)
    }

    /// Tear the link down. Outstanding commands are deregistered (each with
    /// one final `AckTimeout`) and all timers die with the task. The signal
    /// travels on its own channel, so it cannot be lost behind a full
    /// command mailbox.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

struct Outgoing {
    name: String,
    deadline: Instant,
}

/// The connection actor. Construct with [`ProtocolLink::new`] (any stream,
/// used by tests) or [`ProtocolLink::connect`], then `tokio::spawn(link.run())`.
pub struct ProtocolLink<S> {
    id: Uuid,
    config: LinkConfig,
    validator: Arc<dyn MessageValidator>,
    events: mpsc::Sender<LinkEvent>,
    commands: mpsc::Receiver<LinkCommand>,
    shutdown: watch::Receiver<bool>,
    refs: RefSource,
    outstanding: HashMap<Ref, Outgoing>,
    heartbeat_nr: u16,
    awaiting_heartbeat: Option<(Ref, u16)>,
    last_probe_seen: Instant,
    stream: Option<S>,
    writer: Option<WriteHalf<S>>,
}

impl ProtocolLink<TcpStream> {
    /// Connect to a peer and build a client/server link over the stream.
    pub async fn connect(
        addr: &str,
        config: LinkConfig,
        validator: Arc<dyn MessageValidator>,
        events: mpsc::Sender<LinkEvent>,
    ) -> MasterResult<(LinkHandle, Self)> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream, config, validator, events))
    }
}

impl<S> ProtocolLink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Build a link over an established stream.
    pub fn new(
        stream: S,
        config: LinkConfig,
        validator: Arc<dyn MessageValidator>,
        events: mpsc::Sender<LinkEvent>,
    ) -> (LinkHandle, Self) {
        let (tx, commands) = mpsc::channel(COMMAND_MAILBOX);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = Self {
            id: Uuid::new_v4(),
            config,
            validator,
            events,
            commands,
            shutdown: shutdown_rx,
            refs: RefSource::new(),
            outstanding: HashMap::new(),
            heartbeat_nr: 0,
            awaiting_heartbeat: None,
            last_probe_seen: Instant::now(),
            stream: Some(stream),
            writer: None,
        };
        (
            LinkHandle {
                tx,
                shutdown: shutdown_tx,
            },
            link,
        )
    }

    /// Run the connection until it is closed or lost.
    pub async fn run(mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        let (read_half, write_half) = tokio::io::split(stream);
        self.writer = Some(write_half);

        let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_MAILBOX);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let mut probe_timer = interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.last_probe_seen = Instant::now();
        info!(link = %self.id, role = ?self.config.role, "protocol link up");

        // `Some(reason)` means the connection died; `None` a deliberate close.
        let mut lost: Option<String> = None;
        let mut shutdown = self.shutdown.clone();
        loop {
            let next_deadline = self.outstanding.values().map(|o| o.deadline).min();
            let deadline = next_deadline.unwrap_or_else(|| Instant::now() + IDLE_SLEEP);

            let outcome = tokio::select! {
                // A resolved or dropped shutdown signal both end the link.
                _ = shutdown.changed() => break,
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Execute(cmd)) => self.execute(cmd).await,
                    Some(LinkCommand::Acknowledge { reference, cmd_name, status }) => {
                        self.write_frame(&Envelope::acknowledge(reference, &cmd_name, &status))
                            .await
                    }
                    None => break,
                },
                line = line_rx.recv() => match line {
                    Some(line) => self.on_frame(&line).await,
                    None => Err("peer closed the connection".to_string()),
                },
                _ = probe_timer.tick() => self.on_probe_tick().await,
                _ = sleep_until(deadline), if next_deadline.is_some() => {
                    self.expire_deadlines().await
                }
            };

            if let Err(reason) = outcome {
                lost = Some(reason);
                break;
            }
        }

        reader.abort();
        self.teardown(lost).await;
    }

    /// Assign a reference, register the deadline, put the frame on the wire.
    async fn execute(&mut self, command: Command) -> Result<(), String> {
        let reference = self.refs.next_ref();
        let envelope = match Envelope::command(&command, reference) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(link = %self.id, name = %command.name, error = %e, "cannot frame command");
                return Ok(());
            }
        };
        let timeout = command.timeout.unwrap_or(self.config.ack_timeout);
        self.outstanding.insert(
            reference,
            Outgoing {
                name: command.name.clone(),
                deadline: Instant::now() + timeout,
            },
        );
        debug!(link = %self.id, name = %command.name, %reference, "command sent");
        self.write_frame(&envelope).await
    }

    /// Process one inbound frame. Protocol errors reject the frame but keep
    /// the connection; only I/O failure is fatal here.
    async fn on_frame(&mut self, line: &str) -> Result<(), String> {
        let envelope = match Envelope::from_xml(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(link = %self.id, error = %e, "rejecting malformed frame");
                return Ok(());
            }
        };

        if self.config.role == LinkRole::Server
            && !self.validator.validate(&envelope.name, line)
        {
            warn!(link = %self.id, name = %envelope.name, "rejecting frame that failed validation");
            return Ok(());
        }

        if envelope.is_acknowledge() {
            self.on_acknowledge(envelope).await;
            Ok(())
        } else if envelope.name == HEARTBEAT_CLIENT {
            self.on_heartbeat_reply(envelope).await;
            Ok(())
        } else if envelope.name == HEARTBEAT_SERVER {
            self.on_heartbeat_probe(envelope).await
        } else {
            self.emit(LinkEvent::PeerCommand(envelope)).await;
            Ok(())
        }
    }

    /// Match an acknowledge against the outstanding set.
    async fn on_acknowledge(&mut self, envelope: Envelope) {
        let reference = envelope.reference;
        let Some(outgoing) = self.outstanding.get(&reference) else {
            warn!(link = %self.id, %reference, "acknowledge for unknown or completed reference");
            return;
        };

        match envelope.ack_cmd_name() {
            Some(cmd) if cmd == outgoing.name => {
                let status = envelope
                    .ack_status()
                    .unwrap_or_else(|| AckStatus::Failed("missing status".to_string()));
                if let Some(outgoing) = self.outstanding.remove(&reference) {
                    debug!(link = %self.id, name = %outgoing.name, %reference, "acknowledged");
                    self.emit(LinkEvent::AckReceived {
                        reference,
                        name: outgoing.name,
                        status,
                    })
                    .await;
                }
            }
            other => {
                // Name mismatch: the frame is dropped, the command stays
                // outstanding until its deadline.
                warn!(
                    link = %self.id,
                    %reference,
                    expected = %outgoing.name,
                    got = other.unwrap_or("<none>"),
                    "acknowledge name mismatch"
                );
            }
        }
    }

    /// Heartbeat tick: the server sends the next probe, the client checks
    /// that probes keep arriving.
    async fn on_probe_tick(&mut self) -> Result<(), String> {
        match self.config.role {
            LinkRole::Server => {
                if self.awaiting_heartbeat.is_some() {
                    // Previous probe still in flight; its deadline decides.
                    return Ok(());
                }
                let reference = self.refs.next_ref();
                let nr = self.heartbeat_nr;
                self.outstanding.insert(
                    reference,
                    Outgoing {
                        name: HEARTBEAT_SERVER.to_string(),
                        deadline: Instant::now() + self.config.ack_timeout,
                    },
                );
                self.awaiting_heartbeat = Some((reference, nr));
                debug!(link = %self.id, nr, "heartbeat probe");
                self.write_frame(&Envelope::heartbeat_server(nr, reference))
                    .await
            }
            LinkRole::Client => {
                let silence = self.config.heartbeat_interval + self.config.ack_timeout;
                if self.last_probe_seen.elapsed() > silence {
                    return Err("no heartbeat from peer".to_string());
                }
                Ok(())
            }
        }
    }

    /// Peer answered our probe: verify the echoed sequence number.
    async fn on_heartbeat_reply(&mut self, envelope: Envelope) {
        let Some((reference, sent)) = self.awaiting_heartbeat.take() else {
            warn!(link = %self.id, "unexpected heartbeat reply");
            return;
        };
        self.outstanding.remove(&reference);

        let expected = Envelope::expected_heartbeat_reply(sent);
        // A reply without a number can never match.
        let got = envelope.heartbeat_nr().unwrap_or(sent);
        if got == expected {
            debug!(link = %self.id, nr = got, "heartbeat ok");
            self.heartbeat_nr = expected.wrapping_add(1);
        } else {
            warn!(link = %self.id, sent, got, "heartbeat sequence mismatch");
            self.emit(LinkEvent::HeartbeatProblem { sent, got }).await;
        }
    }

    /// We are the responder: restart the liveness window and echo `nr + 1`.
    async fn on_heartbeat_probe(&mut self, envelope: Envelope) -> Result<(), String> {
        self.last_probe_seen = Instant::now();
        let Some(nr) = envelope.heartbeat_nr() else {
            warn!(link = %self.id, "heartbeat probe without nr");
            return Ok(());
        };
        let reply = Envelope::heartbeat_client(nr.wrapping_add(1), envelope.reference);
        self.write_frame(&reply).await
    }

    /// Fire `AckTimeout` for every expired command deadline. A timed-out
    /// heartbeat probe is internal: it never becomes an `AckTimeout`, it is
    /// fatal to the connection and reported as the loss reason instead.
    async fn expire_deadlines(&mut self) -> Result<(), String> {
        let now = Instant::now();
        let expired: Vec<Ref> = self
            .outstanding
            .iter()
            .filter_map(|(r, o)| (o.deadline <= now).then_some(*r))
            .collect();

        let mut fatal = None;
        for reference in expired {
            if let Some(outgoing) = self.outstanding.remove(&reference) {
                warn!(link = %self.id, name = %outgoing.name, %reference, "acknowledge timeout");
                if self.awaiting_heartbeat.map(|(r, _)| r) == Some(reference) {
                    self.awaiting_heartbeat = None;
                    fatal = Some("heartbeat acknowledge timeout".to_string());
                    continue;
                }
                self.emit(LinkEvent::AckTimeout {
                    reference,
                    name: outgoing.name,
                })
                .await;
            }
        }
        match fatal {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Deregister every outstanding command exactly once, then report the
    /// loss (unless the close was deliberate). An in-flight heartbeat probe
    /// is dropped silently; it is not a command anyone is waiting on.
    async fn teardown(&mut self, lost: Option<String>) {
        let outstanding = std::mem::take(&mut self.outstanding);
        for (reference, outgoing) in outstanding {
            if outgoing.name == HEARTBEAT_SERVER {
                continue;
            }
            self.emit(LinkEvent::AckTimeout {
                reference,
                name: outgoing.name,
            })
            .await;
        }
        self.awaiting_heartbeat = None;

        match lost {
            Some(reason) => {
                warn!(link = %self.id, %reason, "connection lost");
                self.emit(LinkEvent::ConnectionLost { reason }).await;
            }
            None => info!(link = %self.id, "link closed"),
        }
    }

    async fn write_frame(&mut self, envelope: &Envelope) -> Result<(), String> {
        let xml = match envelope.to_xml() {
            Ok(xml) => xml,
            Err(e) => {
                warn!(link = %self.id, error = %e, "cannot serialize frame");
                return Ok(());
            }
        };
        let Some(writer) = self.writer.as_mut() else {
            return Err("link writer missing".to_string());
        };
        let result = async {
            writer.write_all(xml.as_bytes()).await?;
            writer.write_all(b"\n").await
        }
        .await;
        result.map_err(|e| format!("write failed: {e}"))
    }

    async fn emit(&mut self, event: LinkEvent) {
        if self.events.send(event).await.is_err() {
            debug!(link = %self.id, "link event receiver dropped");
        }
    }
}
