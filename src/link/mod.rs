// Command link to the remote rewinder drivers
//
// All transport I/O runs on one dedicated thread with its own tokio runtime.
// Callers hand requests over a channel and get replies back on crossbeam
// channels, so the synchronous motor code never touches a connection.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as xch;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::LinkConfig;
use crate::motor::CommandFrame;

mod actor;
pub mod serial;
mod sink;

pub use serial::{SerialConnection, SerialTransport};
pub use sink::DeviceSink;

use actor::LinkActor;

/// Extra wait on top of the connect timeout before giving up on the reply
const CONNECT_GRACE: Duration = Duration::from_secs(1);

/// How long the link thread waits for stray blocking opens on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Link errors. Motor commands are never retried after any of these.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    #[error("Timed out connecting to {address}")]
    ConnectTimeout { address: String },

    #[error("Unable to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Device {address} disconnected")]
    DeviceLost { address: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Timed out waiting for queued commands")]
    DrainTimeout,

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("Invalid link config: {0}")]
    InvalidConfig(String),

    #[error("Link runtime error: {0}")]
    Runtime(String),
}

impl LinkError {
    fn closed() -> Self {
        LinkError::SendFailed {
            reason: "link is shut down".to_string(),
        }
    }
}

/// Index of a remote device in the link's device table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteDevice {
    pub address: String,
    pub connected: bool,
}

/// Reported to the fault handler when a device goes away
#[derive(Debug, Clone, PartialEq)]
pub struct LinkFault {
    pub device: DeviceId,
    pub address: String,
    pub error: LinkError,
}

pub type FaultHandler = Box<dyn Fn(&LinkFault) + Send + 'static>;

/// Opens connections. Called on the link's blocking pool.
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;

    fn open(&self, address: &str, timeout: Duration) -> Result<Self::Conn, LinkError>;
}

/// One open connection, only ever used from the link thread
pub trait Connection: Send + 'static {
    /// Write one or more encoded frames as a single transport write
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Health probe; `false` marks the device lost
    fn is_alive(&mut self) -> bool;

    fn close(&mut self) {}
}

pub(crate) enum Request {
    Connect {
        address: String,
        reply: xch::Sender<Result<DeviceId, LinkError>>,
    },
    Disconnect {
        device: DeviceId,
        reply: xch::Sender<()>,
    },
    Send {
        device: DeviceId,
        frames: Vec<CommandFrame>,
        not_before: Option<Instant>,
        reply: xch::Sender<Result<(), LinkError>>,
    },
    Drain {
        reply: xch::Sender<()>,
    },
    Shutdown,
}

impl Request {
    /// Report a request that will never be processed
    fn fail(self, error: LinkError) {
        match self {
            Request::Connect { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Request::Send { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            // dropping the reply wakes the waiter with a disconnect
            Request::Disconnect { .. } | Request::Drain { .. } | Request::Shutdown => {}
        }
    }
}

type DeviceTable = Arc<Mutex<Vec<RemoteDevice>>>;

fn lock(devices: &DeviceTable) -> MutexGuard<'_, Vec<RemoteDevice>> {
    devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write access to the remote devices, shared by every motor
pub trait SharedBus {
    /// Queue `frames` for `device` as one transport write, released no
    /// earlier than `not_before`
    fn write_batch(
        &self,
        device: DeviceId,
        frames: Vec<CommandFrame>,
        not_before: Option<Instant>,
    ) -> Result<SendTicket, LinkError>;
}

/// Acknowledgement of one send
pub struct SendTicket {
    rx: xch::Receiver<Result<(), LinkError>>,
}

impl SendTicket {
    pub fn wait(&self, timeout: Duration) -> Result<(), LinkError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(xch::RecvTimeoutError::Timeout) => Err(LinkError::SendFailed {
                reason: format!("no acknowledgement within {:?}", timeout),
            }),
            Err(xch::RecvTimeoutError::Disconnected) => Err(LinkError::closed()),
        }
    }

    pub fn try_result(&self) -> Option<Result<(), LinkError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(xch::TryRecvError::Empty) => None,
            Err(xch::TryRecvError::Disconnected) => Some(Err(LinkError::closed())),
        }
    }
}

/// Cloneable, thread-safe handle to a running link
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<Request>,
    devices: DeviceTable,
    connect_timeout: Duration,
}

impl LinkHandle {
    /// Connect (or reconnect) to `address`, blocking up to the connect timeout
    pub fn connect(&self, address: &str) -> Result<DeviceId, LinkError> {
        let (reply, rx) = xch::bounded(1);
        self.submit(Request::Connect {
            address: address.to_string(),
            reply,
        })?;
        match rx.recv_timeout(self.connect_timeout + CONNECT_GRACE) {
            Ok(result) => result,
            Err(xch::RecvTimeoutError::Timeout) => Err(LinkError::ConnectTimeout {
                address: address.to_string(),
            }),
            Err(xch::RecvTimeoutError::Disconnected) => Err(LinkError::closed()),
        }
    }

    /// Close one device on purpose. Sends still queued for it fail.
    pub fn disconnect(&self, device: DeviceId) -> Result<(), LinkError> {
        let (reply, rx) = xch::bounded(1);
        self.submit(Request::Disconnect { device, reply })?;
        rx.recv().map_err(|_| LinkError::closed())
    }

    /// Fails fast when the device is unknown or has been lost
    pub fn check(&self, device: DeviceId) -> Result<(), LinkError> {
        let devices = lock(&self.devices);
        match devices.get(device.0) {
            None => Err(LinkError::UnknownDevice(device)),
            Some(entry) if !entry.connected => Err(LinkError::DeviceLost {
                address: entry.address.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    pub fn is_connected(&self, device: DeviceId) -> bool {
        self.check(device).is_ok()
    }

    pub fn devices(&self) -> Vec<RemoteDevice> {
        lock(&self.devices).clone()
    }

    /// Queue a frame for immediate delivery
    pub fn send(&self, device: DeviceId, frame: CommandFrame) -> Result<SendTicket, LinkError> {
        self.write_batch(device, vec![frame], None)
    }

    /// Queue a frame that must not go out before `not_before`
    pub fn send_at(
        &self,
        device: DeviceId,
        frame: CommandFrame,
        not_before: Instant,
    ) -> Result<SendTicket, LinkError> {
        self.write_batch(device, vec![frame], Some(not_before))
    }

    /// Block until every request queued so far has been processed
    pub fn drain(&self, timeout: Duration) -> Result<(), LinkError> {
        let (reply, rx) = xch::bounded(1);
        self.submit(Request::Drain { reply })?;
        match rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(xch::RecvTimeoutError::Timeout) => Err(LinkError::DrainTimeout),
            Err(xch::RecvTimeoutError::Disconnected) => Err(LinkError::closed()),
        }
    }

    fn submit(&self, request: Request) -> Result<(), LinkError> {
        self.tx.send(request).map_err(|_| LinkError::closed())
    }
}

impl SharedBus for LinkHandle {
    fn write_batch(
        &self,
        device: DeviceId,
        frames: Vec<CommandFrame>,
        not_before: Option<Instant>,
    ) -> Result<SendTicket, LinkError> {
        self.check(device)?;
        let (reply, rx) = xch::bounded(1);
        self.submit(Request::Send {
            device,
            frames,
            not_before,
            reply,
        })?;
        Ok(SendTicket { rx })
    }
}

/// Owner of the link thread. Dropping it shuts the link down.
pub struct CommandLink {
    handle: LinkHandle,
    thread: Option<JoinHandle<()>>,
}

impl CommandLink {
    /// Start the link thread. `on_fault` runs on the link thread whenever a
    /// device is lost.
    pub fn spawn<T, F>(config: &LinkConfig, transport: T, on_fault: F) -> Result<Self, LinkError>
    where
        T: Transport,
        F: Fn(&LinkFault) + Send + 'static,
    {
        config
            .validate()
            .map_err(|e| LinkError::InvalidConfig(e.to_string()))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| LinkError::Runtime(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let devices = DeviceTable::default();
        let actor = LinkActor::new(config, transport, devices.clone(), Box::new(on_fault));

        let thread = std::thread::Builder::new()
            .name("command-link".to_string())
            .spawn(move || {
                runtime.block_on(actor.run(rx));
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            })
            .map_err(|e| LinkError::Runtime(e.to_string()))?;

        info!(
            "Command link started: {}ms health interval, {:?} connect timeout",
            config.health_interval_ms,
            config.connect_timeout()
        );

        Ok(Self {
            handle: LinkHandle {
                tx,
                devices,
                connect_timeout: config.connect_timeout(),
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Close every connection from the link thread, then join it
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.tx.send(Request::Shutdown);
            if thread.join().is_err() {
                warn!("Command link thread panicked");
            }
        }
    }
}

impl std::ops::Deref for CommandLink {
    type Target = LinkHandle;

    fn deref(&self) -> &LinkHandle {
        &self.handle
    }
}

impl Drop for CommandLink {
    fn drop(&mut self) {
        self.stop();
    }
}
