// 20 Hz bridge between the filament-handling host and the rewinders
//
// Stage events, manual mode requests and gate selection arrive over zenoh;
// rewinder status and runtime health go back out every tick. A stage bracket
// left open for too long is released by the watchdog.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::block_in_place;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{
    Config, ConfigError, LOOP_HZ, RewinderConfig, STAGE_WATCHDOG, TOPIC_CONTROL, TOPIC_GATE,
    TOPIC_HEALTH, TOPIC_RECONNECT, TOPIC_STAGE, TOPIC_STATUS,
};
use crate::dispatch::{FilamentHost, PhaseDispatcher, RewindModeProvider};
use crate::link::{
    CommandLink, DeviceId, DeviceSink, LinkError, LinkFault, LinkHandle, SerialTransport,
    Transport,
};
use crate::messages::{
    GateStatus, ReconnectRequest, RewindControl, RewinderStatus, RuntimeHealth, StageEvent,
    StagePhase,
};
use crate::motor::Rewinder;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// The filament-handling host as seen through its zenoh messages
#[derive(Debug, Default)]
pub struct RemoteHost {
    gate: GateStatus,
    pauses: Mutex<Vec<String>>,
}

impl RemoteHost {
    pub fn gate(&self) -> GateStatus {
        self.gate
    }

    pub fn set_gate(&mut self, gate: GateStatus) {
        self.gate = gate;
    }

    /// Most recent pause reason, if the sequence is paused
    pub fn pause_reason(&self) -> Option<String> {
        self.pauses().last().cloned()
    }

    pub fn resume(&self) {
        self.pauses().clear();
    }

    fn pauses(&self) -> MutexGuard<'_, Vec<String>> {
        self.pauses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FilamentHost for RemoteHost {
    fn selected_gate(&self) -> Option<usize> {
        self.gate.selected
    }

    fn gate_available(&self) -> bool {
        self.gate.available_from_buffer
    }

    // Moves run on the host, which only sends the exit event once they are done
    fn wait_moves(&self) {}

    fn pause(&self, reason: &str) {
        warn!("Pausing filament sequence: {}", reason);
        self.pauses().push(reason.to_string());
    }
}

pub struct Runtime {
    // declared before `link` so running rewinders are stopped while it is up
    dispatcher: PhaseDispatcher<RemoteHost, DeviceSink>,
    link: CommandLink,
    addresses: Vec<String>,
    faults: mpsc::UnboundedReceiver<LinkFault>,
}

impl Runtime {
    /// Connect to every configured driver board over serial
    pub fn start(config: &Config) -> Result<Self, RuntimeError> {
        Self::with_transport(config, SerialTransport::new(config.link.baud_rate))
    }

    /// Connect through `transport`. Any board failing to connect is fatal,
    /// a badly configured rewinder is only skipped.
    pub fn with_transport<T: Transport>(config: &Config, transport: T) -> Result<Self, RuntimeError> {
        config.validate()?;

        let (fault_tx, faults) = mpsc::unbounded_channel();
        let link = CommandLink::spawn(&config.link, transport, move |fault: &LinkFault| {
            // the receiver only goes away on shutdown
            let _ = fault_tx.send(fault.clone());
        })?;

        let mut devices = Vec::with_capacity(config.link.addresses.len());
        for address in &config.link.addresses {
            devices.push(link.connect(address)?);
        }

        let rewinders = build_rewinders(&config.rewinders, &link.handle(), &devices, Instant::now());
        if rewinders.is_empty() {
            warn!("No usable rewinder configured");
        }
        info!(
            "{} rewinder(s) ready on {} device(s)",
            rewinders.len(),
            devices.len()
        );

        let dispatcher =
            PhaseDispatcher::new(RemoteHost::default(), rewinders, config.link.drain_timeout());

        Ok(Self {
            dispatcher,
            link,
            addresses: config.link.addresses.clone(),
            faults,
        })
    }

    pub fn dispatcher(&self) -> &PhaseDispatcher<RemoteHost, DeviceSink> {
        &self.dispatcher
    }

    pub fn link(&self) -> LinkHandle {
        self.link.handle()
    }

    pub fn on_stage(&mut self, event: StageEvent) {
        debug!("Stage {:?} {:?}", event.stage, event.phase);
        let result = match event.phase {
            StagePhase::Enter => self.dispatcher.on_stage_enter(&event.stage).map(|_| ()),
            StagePhase::Exit => self.dispatcher.on_stage_exit(&event.stage),
        };
        if let Err(e) = result {
            error!("Stage {:?} {:?} failed: {}", event.stage, event.phase, e);
        }
    }

    pub fn on_control(&mut self, control: RewindControl) {
        info!("Manual control: rewinder {} -> {}", control.id, control.mode);
        if let Err(e) = self.dispatcher.rewind_control_id(control.id, &control.mode) {
            warn!("Rejected manual control for rewinder {}: {}", control.id, e);
        }
    }

    pub fn on_gate(&mut self, gate: GateStatus) {
        if gate != self.dispatcher.host().gate() {
            info!(
                "Gate {:?} selected (buffer: {})",
                gate.selected, gate.available_from_buffer
            );
        }
        self.dispatcher.host_mut().set_gate(gate);
    }

    /// Reopen a device; the pause is lifted once every device is back
    ///
    /// What the device's motors did while it was gone is unknown, so their
    /// rewinders start over from a stop.
    pub fn on_reconnect(&mut self, request: ReconnectRequest) {
        let Some(address) = self.addresses.get(request.device) else {
            warn!("Reconnect requested for unknown device {}", request.device);
            return;
        };
        let device = match self.link.connect(address) {
            Ok(device) => device,
            Err(e) => {
                error!("Reconnect to {} failed: {}", address, e);
                return;
            }
        };
        info!("Device {} at {} reconnected", device, address);

        let mut stopped = true;
        for rewinder in self
            .dispatcher
            .rewinders_mut()
            .filter(|rewinder| rewinder.controller().sink().device() == device)
        {
            rewinder.reset();
            if let Err(e) = rewinder.stop() {
                error!("Failed to stop rewinder {} after reconnect: {}", rewinder.index(), e);
                stopped = false;
            }
        }

        if stopped && self.link.devices().iter().all(|d| d.connected) {
            self.dispatcher.host().resume();
        }
    }

    /// Turn link faults reported since the last call into host pauses
    pub fn check_faults(&mut self) {
        while let Ok(fault) = self.faults.try_recv() {
            let reason = format!("Rewinder link fault: {}", fault.error);
            error!("{} (device {})", reason, fault.device);
            self.dispatcher.host().pause(&reason);
        }
    }

    /// Release a stage bracket open for longer than `limit`
    pub fn watchdog(&mut self, limit: Duration) {
        let Some((stage, age)) = self.dispatcher.active_stage() else {
            return;
        };
        if age <= limit {
            return;
        }
        warn!("Stage {:?} open for {:?}, stopping its rewinder", stage, age);
        if let Err(e) = self.dispatcher.force_release() {
            error!("Watchdog release failed: {}", e);
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        match self.dispatcher.host().pause_reason() {
            Some(reason) => RuntimeHealth::Paused { reason },
            None => RuntimeHealth::Ok,
        }
    }

    pub fn statuses(&self) -> Vec<RewinderStatus> {
        self.dispatcher
            .rewinders()
            .map(|rewinder| {
                let device = rewinder.controller().sink().device();
                RewinderStatus::new(
                    rewinder.index(),
                    rewinder.mode(),
                    rewinder.status(),
                    self.link.is_connected(device),
                )
            })
            .collect()
    }

    /// Stop every rewinder, then close the link
    pub fn shutdown(mut self) {
        if let Err(e) = self.dispatcher.force_release() {
            warn!("Failed to release active stage: {}", e);
        }
        let Runtime {
            dispatcher, link, ..
        } = self;
        drop(dispatcher);
        link.shutdown();
    }
}

fn build_rewinders(
    configs: &[RewinderConfig],
    link: &LinkHandle,
    devices: &[DeviceId],
    epoch: Instant,
) -> Vec<Rewinder<DeviceSink>> {
    configs
        .iter()
        .filter_map(|cfg| {
            let built = cfg.check_device(devices.len()).and_then(|()| {
                let sink = DeviceSink::new(link.clone(), devices[cfg.device], cfg, epoch);
                Rewinder::new(cfg, sink, epoch)
            });
            match built {
                Ok(rewinder) => Some(rewinder),
                Err(e) => {
                    error!("Rewinder {} disabled: {}", cfg.index, e);
                    None
                }
            }
        })
        .collect()
}

fn parse<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("Failed to parse message on {}: {}", topic, e);
            None
        }
    }
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(
        "Connecting to {} rewinder device(s)...",
        config.link.addresses.len()
    );
    let mut runtime = block_in_place(|| Runtime::start(&config))?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_gate = session.declare_subscriber(TOPIC_GATE).await?;
    let sub_stage = session.declare_subscriber(TOPIC_STAGE).await?;
    let sub_control = session.declare_subscriber(TOPIC_CONTROL).await?;
    let sub_reconnect = session.declare_subscriber(TOPIC_RECONNECT).await?;
    let pub_status = session.declare_publisher(TOPIC_STATUS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(
        "Runtime started: {}Hz loop, {}s stage watchdog",
        LOOP_HZ,
        STAGE_WATCHDOG.as_secs()
    );
    info!(
        "Subscribed to: {}, {}, {}, {}",
        TOPIC_GATE, TOPIC_STAGE, TOPIC_CONTROL, TOPIC_RECONNECT
    );
    info!("Publishing to: {}, {}", TOPIC_STATUS, TOPIC_HEALTH);

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping rewinders");
                break Ok(());
            }
            _ = tick.tick() => {}
        }

        // 1. Gate selection first, stage rules depend on it
        while let Ok(Some(sample)) = sub_gate.try_recv() {
            if let Some(gate) = parse(TOPIC_GATE, &sample.payload().to_bytes()) {
                runtime.on_gate(gate);
            }
        }

        // 2. Stage events and manual requests, in arrival order per topic
        while let Ok(Some(sample)) = sub_stage.try_recv() {
            if let Some(event) = parse(TOPIC_STAGE, &sample.payload().to_bytes()) {
                block_in_place(|| runtime.on_stage(event));
            }
        }
        while let Ok(Some(sample)) = sub_control.try_recv() {
            if let Some(control) = parse(TOPIC_CONTROL, &sample.payload().to_bytes()) {
                block_in_place(|| runtime.on_control(control));
            }
        }
        while let Ok(Some(sample)) = sub_reconnect.try_recv() {
            if let Some(request) = parse(TOPIC_RECONNECT, &sample.payload().to_bytes()) {
                block_in_place(|| runtime.on_reconnect(request));
            }
        }

        // 3. Faults and watchdog
        runtime.check_faults();
        block_in_place(|| runtime.watchdog(STAGE_WATCHDOG));

        // 4. Publish status and health
        let status_json = match serde_json::to_string(&runtime.statuses()) {
            Ok(json) => json,
            Err(e) => break Err(e.into()),
        };
        if let Err(e) = pub_status.put(status_json).await {
            break Err(e);
        }
        let health_json = match serde_json::to_string(&runtime.health()) {
            Ok(json) => json,
            Err(e) => break Err(e.into()),
        };
        if let Err(e) = pub_health.put(health_json).await {
            break Err(e);
        }
    };

    block_in_place(|| runtime.shutdown());
    result
}
