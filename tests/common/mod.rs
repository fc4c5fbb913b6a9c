//! In-memory driver boards for link and runtime tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rewinder_runtime::config::LinkConfig;
use rewinder_runtime::link::{Connection, LinkError, Transport};
use rewinder_runtime::motor::CommandFrame;

/// Shared view of one simulated board
#[derive(Clone)]
pub struct MockBoard {
    alive: Arc<AtomicBool>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Default for MockBoard {
    fn default() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            writes: Arc::default(),
            opens: Arc::default(),
            closes: Arc::default(),
        }
    }
}

impl MockBoard {
    pub fn unplug(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn plug(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<CommandFrame> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .flat_map(|bytes| bytes.chunks(18))
            .map(|chunk| CommandFrame::decode(chunk).unwrap())
            .collect()
    }

    pub fn raw_writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockTransport {
    boards: HashMap<String, MockBoard>,
    open_delay: Duration,
}

impl MockTransport {
    pub fn with_board(mut self, address: &str, board: &MockBoard) -> Self {
        self.boards.insert(address.to_string(), board.clone());
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }
}

impl Transport for MockTransport {
    type Conn = MockConnection;

    fn open(&self, address: &str, _timeout: Duration) -> Result<MockConnection, LinkError> {
        std::thread::sleep(self.open_delay);
        let board = self
            .boards
            .get(address)
            .filter(|board| board.alive.load(Ordering::SeqCst))
            .ok_or_else(|| LinkError::ConnectFailed {
                address: address.to_string(),
                reason: "no such board".to_string(),
            })?;
        board.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            board: board.clone(),
        })
    }
}

pub struct MockConnection {
    board: MockBoard,
}

impl Connection for MockConnection {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if !self.board.alive.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "board gone"));
        }
        self.board.writes.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.board.alive.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.board.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Short timeouts and a fast health probe
pub fn link_config(addresses: &[&str]) -> LinkConfig {
    LinkConfig {
        addresses: addresses.iter().map(|a| a.to_string()).collect(),
        connect_timeout_s: 0.2,
        health_interval_ms: 10,
        drain_timeout_s: 2.0,
        ..LinkConfig::default()
    }
}
