// Link thread event loop: owns every connection

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    lock, Connection, DeviceId, DeviceTable, FaultHandler, LinkError, LinkFault, RemoteDevice,
    Request, Transport,
};
use crate::config::LinkConfig;
use crate::motor::CommandFrame;

pub(super) struct LinkActor<T: Transport> {
    transport: Arc<T>,
    connect_timeout: Duration,
    health_interval: Duration,
    devices: DeviceTable,
    // indexed like `devices`; `None` once closed or lost
    conns: Vec<Option<T::Conn>>,
    on_fault: FaultHandler,
}

impl<T: Transport> LinkActor<T> {
    pub(super) fn new(
        config: &LinkConfig,
        transport: T,
        devices: DeviceTable,
        on_fault: FaultHandler,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            connect_timeout: config.connect_timeout(),
            health_interval: config.health_interval(),
            devices,
            conns: Vec::new(),
            on_fault,
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        let mut health = tokio::time::interval(self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle(request, &mut health).await,
                },
                _ = health.tick() => self.supervise(),
            }
        }

        // Connections must be closed from this thread
        self.close_all();

        rx.close();
        while let Ok(request) = rx.try_recv() {
            request.fail(LinkError::SendFailed {
                reason: "link shut down before delivery".to_string(),
            });
        }
        info!("Command link stopped");
    }

    async fn handle(&mut self, request: Request, health: &mut Interval) {
        match request {
            Request::Connect { address, reply } => {
                let result = self.connect(address).await;
                let _ = reply.send(result);
            }
            Request::Disconnect { device, reply } => {
                self.close(device);
                let _ = reply.send(());
            }
            Request::Send {
                device,
                frames,
                not_before,
                reply,
            } => {
                if let Some(at) = not_before {
                    self.wait_release(at, health).await;
                }
                let _ = reply.send(self.write(device, &frames));
            }
            Request::Drain { reply } => {
                // FIFO: everything queued before this has been handled
                let _ = reply.send(());
            }
            Request::Shutdown => {}
        }
    }

    /// Hold the queue until `at`, still probing device health
    ///
    /// Requests stay FIFO, so everything queued behind a timed send waits with
    /// it. The wait is bounded by one kick-start plus the minimum command
    /// interval.
    async fn wait_release(&mut self, at: std::time::Instant, health: &mut Interval) {
        let release = tokio::time::sleep_until(tokio::time::Instant::from_std(at));
        tokio::pin!(release);
        loop {
            tokio::select! {
                _ = &mut release => return,
                _ = health.tick() => self.supervise(),
            }
        }
    }

    async fn connect(&mut self, address: String) -> Result<DeviceId, LinkError> {
        let transport = Arc::clone(&self.transport);
        let timeout = self.connect_timeout;
        let target = address.clone();

        let opened = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || transport.open(&target, timeout)),
        )
        .await;

        let conn = match opened {
            Err(_) => {
                warn!("Timed out connecting to {}", address);
                return Err(LinkError::ConnectTimeout { address });
            }
            Ok(Err(join)) => {
                return Err(LinkError::ConnectFailed {
                    address,
                    reason: join.to_string(),
                });
            }
            Ok(Ok(result)) => result?,
        };

        Ok(self.register(address, conn))
    }

    fn register(&mut self, address: String, conn: T::Conn) -> DeviceId {
        let index = {
            let mut devices = lock(&self.devices);
            match devices.iter().position(|d| d.address == address) {
                Some(index) => {
                    devices[index].connected = true;
                    index
                }
                None => {
                    devices.push(RemoteDevice {
                        address: address.clone(),
                        connected: true,
                    });
                    devices.len() - 1
                }
            }
        };

        if index < self.conns.len() {
            if let Some(mut old) = self.conns[index].replace(conn) {
                old.close();
            }
        } else {
            self.conns.push(Some(conn));
        }

        info!("Connected to device {} at {}", index, address);
        DeviceId(index)
    }

    fn write(&mut self, device: DeviceId, frames: &[CommandFrame]) -> Result<(), LinkError> {
        let address = self.address(device).ok_or(LinkError::UnknownDevice(device))?;
        let Some(conn) = self.conns.get_mut(device.0).and_then(Option::as_mut) else {
            return Err(LinkError::DeviceLost { address });
        };

        let bytes: Vec<u8> = frames.iter().flat_map(|frame| frame.encode()).collect();
        match conn.write_frame(&bytes) {
            Ok(()) => {
                for frame in frames {
                    debug!(
                        "Sent to {}: pins={}/{} speed={} decay={:?} startup={}",
                        address,
                        frame.pin_a,
                        frame.pin_b,
                        frame.speed,
                        frame.decay_mode,
                        frame.startup_speed
                    );
                }
                Ok(())
            }
            Err(e) if conn.is_alive() => {
                warn!("Write to {} failed: {}", address, e);
                Err(LinkError::SendFailed {
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                warn!("Write to {} failed, device gone: {}", address, e);
                self.mark_lost(device);
                Err(LinkError::DeviceLost { address })
            }
        }
    }

    fn supervise(&mut self) {
        let lost: Vec<DeviceId> = self
            .conns
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Some(conn) => (!conn.is_alive()).then_some(DeviceId(index)),
                None => None,
            })
            .collect();

        for device in lost {
            self.mark_lost(device);
        }
    }

    /// Close a lost device and report it. Only the first call per
    /// connection reports.
    fn mark_lost(&mut self, device: DeviceId) {
        let Some(address) = self.close(device) else {
            return;
        };
        warn!("Device {} at {} disconnected", device, address);
        (self.on_fault)(&LinkFault {
            device,
            address: address.clone(),
            error: LinkError::DeviceLost { address },
        });
    }

    /// Close a device's connection; returns its address if one was open
    fn close(&mut self, device: DeviceId) -> Option<String> {
        let mut conn = self.conns.get_mut(device.0).and_then(Option::take)?;
        conn.close();

        let mut devices = lock(&self.devices);
        let entry = devices.get_mut(device.0)?;
        entry.connected = false;
        debug!("Closed device {} at {}", device, entry.address);
        Some(entry.address.clone())
    }

    fn close_all(&mut self) {
        for index in 0..self.conns.len() {
            self.close(DeviceId(index));
        }
    }

    fn address(&self, device: DeviceId) -> Option<String> {
        lock(&self.devices)
            .get(device.0)
            .map(|entry| entry.address.clone())
    }
}
