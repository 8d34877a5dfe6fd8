//! The Master context.
//!
//! [`Master`] is the explicitly constructed root object of the process: it
//! owns the message catalog, one supervisor per configured external process,
//! the listeners their peers connect to, and the dispatch channels that
//! carry peer commands inward. There are no globals; everything is reachable
//! from this one value and torn down by [`Master::shutdown`].
//!
//! Wiring per process:
//!
//! ```text
//! TCP accept ──> ProtocolLink (server role) ──LinkEvent──> relay task
//!                                                           │
//!                          ProcessConnected/Disconnected,   │ peer commands
//!                          CommunicationError               ▼
//!                    ProcessSupervisor <──────────── DispatchChannel ──> executor
//! ```
//!
//! The relay task translates link events into supervisor events and forwards
//! peer commands into the process's dispatch channel; the acknowledge that
//! comes back through the [`ReplyHandle`](crate::dispatch::ReplyHandle) is
//! returned to the peer on the wire under the peer's own reference.

use crate::config::{MasterConfig, ProcessDefinition};
use crate::dispatch::{DispatchChannel, ExecutorEnd, RequesterEnd};
use crate::error::MasterResult;
use crate::messages::{Acknowledge, AckStatus, Command, Payload, Ref};
use crate::network::catalog::{MessageCatalog, MessageValidator, NoValidation};
use crate::network::link::{LinkConfig, LinkEvent, LinkHandle, LinkRole, ProtocolLink};
use crate::network::protocol::Envelope;
use crate::supervisor::{
    ControllerNotice, DeviceController, LinkSlot, ProcessSupervisor, SupervisorEvent,
    SupervisorHandle, SupervisorStateId,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LINK_EVENT_MAILBOX: usize = 32;
/// How long shutdown waits for each supervisor to reach `Final`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Root context of the Master process.
pub struct Master {
    config: MasterConfig,
    validator: Arc<dyn MessageValidator>,
    supervisors: HashMap<String, SupervisorHandle>,
    executors: HashMap<String, ExecutorEnd>,
    listen_addrs: HashMap<String, SocketAddr>,
    notices_tx: mpsc::UnboundedSender<ControllerNotice>,
    notices_rx: mpsc::UnboundedReceiver<ControllerNotice>,
    tasks: Vec<JoinHandle<()>>,
}

impl Master {
    /// Build the context: load the message catalog (when configured) and
    /// prepare the notice channel. Nothing runs until [`Master::run`].
    pub fn new(config: MasterConfig) -> MasterResult<Self> {
        let validator: Arc<dyn MessageValidator> = match &config.protocol.schema_dir {
            Some(dir) => Arc::new(MessageCatalog::load(dir)?),
            None => Arc::new(NoValidation),
        };
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            validator,
            supervisors: HashMap::new(),
            executors: HashMap::new(),
            listen_addrs: HashMap::new(),
            notices_tx,
            notices_rx,
            tasks: Vec::new(),
        })
    }

    /// Start supervision of every configured process: spawn its supervisor,
    /// bind its listener and kick off device startup. Returns once
    /// everything is running.
    pub async fn run(&mut self) -> MasterResult<()> {
        let capacity = self.config.dispatch.mailbox_capacity;
        let link_config = LinkConfig::new(LinkRole::Server)
            .with_ack_timeout(self.config.protocol.ack_timeout())
            .with_heartbeat_interval(self.config.protocol.heartbeat_interval());

        for definition in self.config.processes.clone() {
            let name = definition.name.clone();

            let (event_tx, event_rx) = mpsc::channel(capacity);
            let controller =
                DeviceController::new(&name, event_tx.clone(), self.notices_tx.clone());
            let slot = controller.link_slot();
            let (handle, supervisor) =
                ProcessSupervisor::from_parts(definition.clone(), controller, event_tx, event_rx);
            self.tasks.push(tokio::spawn(supervisor.run()));
            handle.dispatch(SupervisorEvent::StartOperation).await?;

            let (requester, executor) = DispatchChannel::bounded(capacity);
            self.executors.insert(name.clone(), executor);
            let requester = Arc::new(Mutex::new(requester));

            if let Some(addr) = &definition.listen_addr {
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                info!(process = %name, addr = %local, "listening for peer");
                self.listen_addrs.insert(name.clone(), local);
                self.tasks.push(tokio::spawn(accept_loop(
                    listener,
                    definition.clone(),
                    link_config.clone(),
                    Arc::clone(&self.validator),
                    handle.clone(),
                    slot,
                    requester,
                    self.notices_tx.clone(),
                )));
            }

            self.supervisors.insert(name, handle);
        }

        info!(
            processes = self.supervisors.len(),
            "master context running"
        );
        Ok(())
    }

    /// Stop every supervisor (waiting up to a grace period for `Final`),
    /// then abort the remaining listener and relay tasks.
    pub async fn shutdown(&mut self) {
        for (name, handle) in &self.supervisors {
            debug!(process = %name, "requesting stop");
            let _ = handle.dispatch(SupervisorEvent::StopRequested).await;
        }
        for (name, handle) in &self.supervisors {
            let mut handle = handle.clone();
            let reached = tokio::time::timeout(
                SHUTDOWN_GRACE,
                handle.wait_for(SupervisorStateId::Final),
            )
            .await;
            if !matches!(reached, Ok(true)) {
                warn!(process = %name, "supervisor did not reach final state in time");
            }
        }
        self.supervisors.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("master context stopped");
    }

    /// Handle to a running process supervisor.
    pub fn supervisor(&self, name: &str) -> Option<SupervisorHandle> {
        self.supervisors.get(name).cloned()
    }

    /// Bound listener address for a process (useful with port 0).
    pub fn listen_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listen_addrs.get(name).copied()
    }

    /// Take the executor end of a process's dispatch channel. The embedding
    /// application consumes peer commands from it and replies through the
    /// handles; un-taken executors leave peer commands queued until the
    /// mailbox fills.
    pub fn take_executor(&mut self, name: &str) -> Option<ExecutorEnd> {
        self.executors.remove(name)
    }

    /// Next lifecycle or protocol notice from any process.
    pub async fn next_notice(&mut self) -> Option<ControllerNotice> {
        self.notices_rx.recv().await
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }
}

/// Accept peer connections for one process, one active link at a time.
#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    definition: ProcessDefinition,
    link_config: LinkConfig,
    validator: Arc<dyn MessageValidator>,
    supervisor: SupervisorHandle,
    slot: LinkSlot,
    requester: Arc<Mutex<RequesterEnd>>,
    notices: mpsc::UnboundedSender<ControllerNotice>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(process = %definition.name, error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        if !definition.remote_login_allowed && !peer.ip().is_loopback() {
            warn!(process = %definition.name, %peer, "remote login not allowed, dropping connection");
            continue;
        }

        debug!(process = %definition.name, %peer, "peer connected");
        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_MAILBOX);
        let (link_handle, link) =
            ProtocolLink::new(stream, link_config.clone(), Arc::clone(&validator), events_tx);
        match slot.lock() {
            Ok(mut slot) => *slot = Some(link_handle.clone()),
            Err(_) => warn!(process = %definition.name, "link slot poisoned"),
        }
        tokio::spawn(link.run());

        if supervisor
            .dispatch(SupervisorEvent::ProcessConnected)
            .await
            .is_err()
        {
            // Supervisor gone; the master is shutting down.
            return;
        }
        tokio::spawn(relay(
            definition.name.clone(),
            events_rx,
            link_handle,
            supervisor.clone(),
            Arc::clone(&requester),
            notices.clone(),
        ));
    }
}

/// Translate one connection's link events for the supervisor, and bridge
/// peer commands into the process's dispatch channel.
async fn relay(
    process: String,
    mut events: mpsc::Receiver<LinkEvent>,
    link: LinkHandle,
    supervisor: SupervisorHandle,
    requester: Arc<Mutex<RequesterEnd>>,
    notices: mpsc::UnboundedSender<ControllerNotice>,
) {
    // One active connection per process: the requester end is held for the
    // life of this relay.
    let mut requester = requester.lock().await;
    // Dispatch reference -> (peer reference, command name).
    let mut inflight: HashMap<Ref, (Ref, String)> = HashMap::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    LinkEvent::PeerCommand(envelope) => {
                        forward_peer_command(
                            &process,
                            envelope,
                            &mut requester,
                            &mut inflight,
                            &link,
                        )
                        .await;
                    }
                    LinkEvent::AckReceived { reference, name, status } => {
                        debug!(%process, %reference, %name, "command acknowledged");
                        let _ = notices.send(ControllerNotice::CommandAcknowledged {
                            process: process.clone(),
                            ack: Acknowledge::new(reference, status),
                        });
                    }
                    LinkEvent::AckTimeout { reference, name } => {
                        warn!(%process, %reference, %name, "command acknowledge timed out");
                        let _ = notices.send(ControllerNotice::CommandTimedOut {
                            process: process.clone(),
                            reference,
                            name,
                        });
                    }
                    LinkEvent::HeartbeatProblem { sent, got } => {
                        warn!(%process, sent, got, "heartbeat sequence problem");
                        supervisor.try_dispatch(SupervisorEvent::CommunicationError);
                    }
                    LinkEvent::ConnectionLost { reason } => {
                        warn!(%process, %reason, "peer connection lost");
                        let _ = supervisor
                            .dispatch(SupervisorEvent::ProcessDisconnected)
                            .await;
                    }
                }
            }
            ack = requester.next_ack(), if !inflight.is_empty() => {
                let Some(ack) = ack else { break };
                if let Some((peer_ref, name)) = inflight.remove(&ack.reference) {
                    let _ = link.acknowledge(peer_ref, name, ack.status).await;
                }
            }
        }
    }
    debug!(%process, "relay finished");
}

async fn forward_peer_command(
    process: &str,
    envelope: Envelope,
    requester: &mut RequesterEnd,
    inflight: &mut HashMap<Ref, (Ref, String)>,
    link: &LinkHandle,
) {
    let peer_ref = envelope.reference;
    let name = envelope.name.clone();
    let command = Command::new(&name).with_payload(items_to_payload(&envelope));
    match requester.send(command) {
        Ok(internal) => {
            inflight.insert(internal, (peer_ref, name));
        }
        Err(e) => {
            warn!(%process, %name, error = %e, "cannot dispatch peer command");
            let _ = link
                .acknowledge(peer_ref, name, AckStatus::Failed(e.to_string()))
                .await;
        }
    }
}

/// Envelope data items as a flat JSON object.
fn items_to_payload(envelope: &Envelope) -> Payload {
    let mut map = serde_json::Map::new();
    for (key, value) in &envelope.items {
        map.insert(key.clone(), serde_json::Value::String(value.clone()));
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplicationConfig, DispatchConfig, ProtocolConfig};

    fn config(listen: Option<&str>) -> MasterConfig {
        MasterConfig {
            application: ApplicationConfig {
                name: "stainer".to_string(),
                log_level: "info".to_string(),
            },
            dispatch: DispatchConfig::default(),
            protocol: ProtocolConfig::default(),
            processes: vec![ProcessDefinition {
                name: "gui".to_string(),
                start_command: "sleep 600".to_string(),
                listen_addr: listen.map(str::to_string),
                remote_login_allowed: true,
                remote_login_timeout_ms: 30_000,
                disconnect_window_ms: 60_000,
                max_disconnects: 1,
            }],
        }
    }

    #[test]
    fn items_become_a_flat_string_object() {
        let envelope = Envelope::new("CmdStartStaining", Ref::new(4))
            .with_item("program", "HE-12")
            .with_item("rack", "3");
        let payload = items_to_payload(&envelope);
        assert_eq!(payload["program"], "HE-12");
        assert_eq!(payload["rack"], "3");
    }

    #[tokio::test]
    async fn run_binds_listener_and_starts_supervisor() {
        let mut master = Master::new(config(Some("127.0.0.1:0"))).unwrap();
        master.run().await.unwrap();

        assert!(master.listen_addr("gui").is_some());
        let mut handle = master.supervisor("gui").unwrap();
        assert!(handle.wait_for(SupervisorStateId::Wait).await);
        assert!(master.take_executor("gui").is_some());
        assert!(master.take_executor("gui").is_none());

        master.shutdown().await;
        assert!(master.supervisor("gui").is_none());
    }

    #[tokio::test]
    async fn missing_schema_dir_is_a_config_error() {
        let mut bad = config(None);
        bad.protocol.schema_dir = Some(std::path::PathBuf::from("/no/such/dir"));
        assert!(Master::new(bad).is_err());
    }
}
