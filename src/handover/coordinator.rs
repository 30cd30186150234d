use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::client::HandoverClient;
use super::protocol::HandoverMessage;
use super::server::{ControlHandler, ControlServer};
use crate::config::HandoverConfig;
use crate::device::{DeviceHandle, DevicePool, FreeDeviceState};
use crate::error::{FleetError, Result};
use crate::scheduler::wake::WakeGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoverState {
    Idle,
    /// Outgoing: connected to the new scheduler, reporting held devices.
    Initiating,
    /// Outgoing: waiting for the new scheduler to acknowledge init complete.
    AwaitingAck,
    /// Outgoing: handover finished, this scheduler is draining or gone.
    Complete,
    /// Incoming: waiting for the old scheduler to report its devices.
    Receiving,
    /// Owns the control address, or finished receiving a handover.
    Active,
    Failed,
}

impl std::fmt::Display for HandoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandoverState::Idle => "idle",
            HandoverState::Initiating => "initiating",
            HandoverState::AwaitingAck => "awaiting_ack",
            HandoverState::Complete => "complete",
            HandoverState::Receiving => "receiving",
            HandoverState::Active => "active",
            HandoverState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

struct CoordinatorState {
    state: HandoverState,
    client: Option<Arc<HandoverClient>>,
    /// Devices reported to the new scheduler that it has not seen freed yet.
    reported: HashSet<String>,
    server_cancel: Option<CancellationToken>,
    bound_addr: Option<SocketAddr>,
}

/// Moves device ownership between an outgoing and an incoming scheduler.
///
/// Has its own lock, never taken while the scheduler lock is held and never
/// held across an await.
pub struct HandoverCoordinator {
    config: HandoverConfig,
    pool: Arc<dyn DevicePool>,
    state: Mutex<CoordinatorState>,
    /// Raised when the old scheduler reports init complete.
    handshake: WakeGate,
    /// Devices force-allocated on behalf of the old scheduler.
    remote_devices: Mutex<HashMap<String, DeviceHandle>>,
    handler: OnceLock<Arc<dyn ControlHandler>>,
}

impl HandoverCoordinator {
    pub fn new(config: HandoverConfig, pool: Arc<dyn DevicePool>) -> Self {
        Self {
            config,
            pool,
            state: Mutex::new(CoordinatorState {
                state: HandoverState::Idle,
                client: None,
                reported: HashSet::new(),
                server_cancel: None,
                bound_addr: None,
            }),
            handshake: WakeGate::new(),
            remote_devices: Mutex::new(HashMap::new()),
            handler: OnceLock::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> HandoverState {
        self.lock().state
    }

    fn set_state(&self, state: HandoverState) {
        let mut inner = self.lock();
        if inner.state != state {
            tracing::info!(from = %inner.state, to = %state, "Handover state changed");
            inner.state = state;
        }
    }

    /// Address the control listener is bound to, if it is running.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.lock().bound_addr
    }

    pub fn remote_device_count(&self) -> usize {
        self.remote_devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn serve(&self, server: ControlServer) -> Result<SocketAddr> {
        let handler = self
            .handler
            .get()
            .cloned()
            .ok_or_else(|| FleetError::Handover("control handler not installed".to_string()))?;
        let addr = server.local_addr()?;
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(handler, cancel.clone()));

        let mut inner = self.lock();
        if let Some(previous) = inner.server_cancel.replace(cancel) {
            previous.cancel();
        }
        inner.bound_addr = Some(addr);
        Ok(addr)
    }

    /// Start the control listener.
    ///
    /// Binds the control address when it is free. Otherwise, with
    /// auto-handover on, binds a temporary port and asks the current owner
    /// to hand over, waiting for the handshake within the configured
    /// timeout. A failed handover is logged and this scheduler carries on
    /// independently.
    pub async fn start(&self, handler: Arc<dyn ControlHandler>) -> Result<()> {
        let _ = self.handler.set(handler);

        match ControlServer::bind(self.config.control_addr).await {
            Ok(server) => {
                let addr = self.serve(server)?;
                self.set_state(HandoverState::Active);
                tracing::info!(addr = %addr, "Bound control address");
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::info!(
                    addr = %self.config.control_addr,
                    "Control address in use by another scheduler"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let temp_addr = SocketAddr::new(self.config.control_addr.ip(), 0);
        let temp_server = ControlServer::bind(temp_addr).await?;
        let temp_addr = self.serve(temp_server)?;

        if !self.config.auto_handover {
            tracing::warn!(
                addr = %temp_addr,
                "Auto handover disabled, running on a temporary control port"
            );
            return Ok(());
        }

        self.set_state(HandoverState::Receiving);
        self.handshake.reset();
        let requested = async {
            let client =
                HandoverClient::connect(self.config.control_addr, self.config.handshake_timeout())
                    .await?;
            client
                .request(HandoverMessage::StartHandover {
                    port: temp_addr.port(),
                })
                .await
        };
        if let Err(e) = requested.await {
            tracing::error!(error = %e, "Failed to request handover");
            self.set_state(HandoverState::Failed);
            return Ok(());
        }

        let timeout = self.config.handshake_timeout();
        if self.handshake.wait(timeout).await {
            tracing::info!("Handover handshake complete");
        } else {
            tracing::error!(timeout_ms = self.config.handshake_timeout_ms, "Handover failed: timed out waiting for handshake");
            self.set_state(HandoverState::Failed);
        }
        Ok(())
    }

    /// Answer a device-ownership request from the old scheduler.
    pub async fn handle_incoming(&self, message: HandoverMessage) -> HandoverMessage {
        match message {
            HandoverMessage::AllocateDevice { serial } => match self.pool.force_allocate(&serial) {
                Some(handle) => {
                    tracing::info!(serial = %serial, "Device held by previous scheduler");
                    self.remote_devices
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(serial, handle);
                    HandoverMessage::Ack
                }
                None => HandoverMessage::error(format!("cannot allocate device {}", serial)),
            },
            HandoverMessage::FreeDevice { serial } => {
                let handle = self
                    .remote_devices
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&serial);
                match handle {
                    Some(handle) => {
                        tracing::info!(serial = %serial, "Previous scheduler released device");
                        self.pool.free(&handle, FreeDeviceState::Available);
                        HandoverMessage::Ack
                    }
                    None => HandoverMessage::error(format!("device {} was not handed over", serial)),
                }
            }
            HandoverMessage::HandoverInitComplete => {
                self.set_state(HandoverState::Active);
                self.handshake.signal();
                HandoverMessage::Ack
            }
            HandoverMessage::HandoverComplete => {
                tracing::info!("Previous scheduler shut down");
                HandoverMessage::Ack
            }
            other => HandoverMessage::error(format!("unexpected request {:?}", other)),
        }
    }

    /// Move the control listener from the temporary port back to the
    /// control address, retrying while the old scheduler releases it. The
    /// handover is marked failed once every attempt has failed.
    pub async fn rebind_control_addr(&self) -> Result<SocketAddr> {
        if self.bound_addr() == Some(self.config.control_addr) {
            return Ok(self.config.control_addr);
        }
        let mut last_error = None;
        for attempt in 1..=self.config.rebind_attempts {
            match ControlServer::bind(self.config.control_addr).await {
                Ok(server) => {
                    let addr = self.serve(server)?;
                    tracing::info!(addr = %addr, attempt, "Rebound control address");
                    return Ok(addr);
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Control address not free yet");
                    last_error = Some(e);
                    tokio::time::sleep(self.config.rebind_delay()).await;
                }
            }
        }
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        self.set_state(HandoverState::Failed);
        Err(FleetError::Handover(format!(
            "failed to rebind {}: {}",
            self.config.control_addr, reason
        )))
    }

    /// Outgoing side: connect to the new scheduler on `port` and report
    /// every device in `held`.
    ///
    /// On failure the coordinator returns to the state it was in and the
    /// error is handed back, leaving the caller running.
    pub async fn initiate(&self, port: u16, held: &[String]) -> Result<()> {
        let prior = {
            let mut inner = self.lock();
            match inner.state {
                HandoverState::Idle | HandoverState::Active | HandoverState::Failed => {}
                state => {
                    return Err(FleetError::Handover(format!(
                        "handover already in progress ({})",
                        state
                    )))
                }
            }
            let prior = inner.state;
            inner.state = HandoverState::Initiating;
            prior
        };
        tracing::info!(port, devices = held.len(), "Initiating handover");

        match self.report_devices(port, held).await {
            Ok(client) => {
                let mut inner = self.lock();
                inner.client = Some(Arc::new(client));
                inner.reported = held.iter().cloned().collect();
                inner.state = HandoverState::Complete;
                Ok(())
            }
            Err(e) => {
                tracing::error!(port, error = %e, "Handover failed");
                self.set_state(prior);
                Err(e)
            }
        }
    }

    async fn report_devices(&self, port: u16, held: &[String]) -> Result<HandoverClient> {
        let addr = SocketAddr::new(self.config.control_addr.ip(), port);
        let client = HandoverClient::connect(addr, self.config.handshake_timeout()).await?;
        for serial in held {
            client.allocate_device(serial).await?;
        }
        self.set_state(HandoverState::AwaitingAck);
        client.request(HandoverMessage::HandoverInitComplete).await?;
        Ok(client)
    }

    /// Report a device released while draining after a handover. Devices
    /// the new scheduler was never told about are skipped.
    pub async fn notify_device_freed(&self, serial: &str) {
        let client = {
            let mut inner = self.lock();
            if !inner.reported.remove(serial) {
                return;
            }
            inner.client.clone()
        };
        let Some(client) = client else {
            return;
        };
        if let Err(e) = client.free_device(serial).await {
            tracing::warn!(serial = %serial, error = %e, "Failed to report freed device");
        }
    }

    /// Tell the new scheduler this one is gone and drop the connection.
    pub async fn finish_outgoing(&self) {
        let Some(client) = self.lock().client.take() else {
            return;
        };
        match client.request(HandoverMessage::HandoverComplete).await {
            Ok(()) => tracing::info!(peer = %client.addr(), "Handover complete"),
            Err(e) => tracing::warn!(error = %e, "Failed to send handover complete"),
        }
    }

    /// Stop the control listener.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if let Some(cancel) = inner.server_cancel.take() {
            cancel.cancel();
        }
        inner.bound_addr = None;
    }
}
