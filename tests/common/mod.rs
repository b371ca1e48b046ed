//! Loopback mock crates and stubs shared by the integration tests.
#![allow(dead_code)]

use sepd_sc::config::{Endpoint, Settings};
use sepd_sc::error::{ScError, ScResult};
use sepd_sc::executor::Tripwire;
use sepd_sc::hardware::BiasSource;
use sepd_sc::reading::{BiasChannelStatus, ChannelState};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// What a mock crate does with one command.
pub enum MockReply {
    /// Answer with the text followed by `\r\n>`
    Text(String),
    /// Never answer; keep the session open
    Silent,
    /// Close the session without answering
    Hangup,
    /// Answer like `Text`, after sleeping
    Delayed(Duration, String),
}

fn text(body: impl Into<String>) -> MockReply {
    MockReply::Text(body.into())
}

/// A line-oriented crate terminal on a loopback port.
pub struct MockCrate {
    port: u16,
    log: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl MockCrate {
    pub fn spawn<F>(respond: F) -> Self
    where
        F: Fn(&str) -> MockReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let respond = Arc::new(respond);

        let (accept_log, accept_count) = (Arc::clone(&log), Arc::clone(&connections));
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                accept_count.fetch_add(1, Ordering::SeqCst);
                let respond = Arc::clone(&respond);
                let log = Arc::clone(&accept_log);
                thread::spawn(move || serve(stream, respond.as_ref(), &log));
            }
        });

        Self {
            port,
            log,
            connections,
        }
    }

    /// Controller crate answering `$T/$U/$I/$G` for any board.
    ///
    /// Temperatures of local board `b` are `[base + b, base + 10 + b]`.
    pub fn controller(base: f64) -> Self {
        Self::spawn(controller_reply(base))
    }

    /// LV crate answering `$V/$C` with 16 values `0.0, 0.5, ... 7.5`.
    pub fn lv() -> Self {
        Self::spawn(|command| match command.get(..2) {
            Some("$V") | Some("$C") => text(
                (0..16)
                    .map(|i| (i as f64 * 0.5).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => MockReply::Silent,
        })
    }

    /// Accepts sessions and reads commands but never answers.
    pub fn silent() -> Self {
        Self::spawn(|_| MockReply::Silent)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port)
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Number of received commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub fn controller_reply(base: f64) -> impl Fn(&str) -> MockReply + Send + Sync + 'static {
    move |command: &str| {
        let Some(board) = command.get(2..).and_then(|b| b.parse::<u32>().ok()) else {
            return MockReply::Silent;
        };
        let b = f64::from(board);
        match command.get(..2) {
            Some("$T") => text(format!("{} {}", base + b, base + 10.0 + b)),
            Some("$U") => text(format!("V+ = 5.0, V- = -5.0, Vb = {}", 60.0 + b)),
            Some("$I") => text(format!("{} {}", 1.0 + b, 2.0 + b)),
            Some("$G") => text("1"),
            _ => MockReply::Silent,
        }
    }
}

fn serve(stream: TcpStream, respond: &(dyn Fn(&str) -> MockReply + Send + Sync), log: &Mutex<Vec<String>>) {
    let Ok(mut writer) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        // Commands end in "\n\r"; the '\r' lands at the start of the next line.
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        log.lock().unwrap().push(command.to_string());
        match respond(command) {
            MockReply::Text(body) => {
                if writer.write_all(format!("{body}\r\n>").as_bytes()).is_err() {
                    return;
                }
            }
            MockReply::Delayed(delay, body) => {
                thread::sleep(delay);
                if writer.write_all(format!("{body}\r\n>").as_bytes()).is_err() {
                    return;
                }
            }
            MockReply::Silent => {}
            MockReply::Hangup => return,
        }
    }
}

/// An endpoint nothing listens on.
pub fn refused_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Endpoint::new("127.0.0.1", port)
}

/// Settings pointing at the given crates with short loopback timings.
pub fn test_settings(north: Endpoint, south: Endpoint, lv: Endpoint) -> Settings {
    let mut settings = Settings::default();
    settings.controllers.north = north;
    settings.controllers.south = south;
    settings.interface.connect_timeout_ms = 200;
    settings.interface.read_deadline_ms = 300;
    settings.lv.endpoint = lv;
    settings.lv.connect_timeout_ms = 200;
    settings.lv.read_timeout_ms = 300;
    settings.lv.deadline_ms = 1000;
    settings.bias.deadline_ms = 1000;
    settings.cache.throttle_ms = 0;
    settings.server.bind = "127.0.0.1:0".to_string();
    settings.server.connect_timeout_ms = 200;
    settings.server.read_deadline_ms = 500;
    settings
}

pub fn bias_row(channel: &str, readback: f64) -> BiasChannelStatus {
    BiasChannelStatus {
        channel: channel.to_string(),
        setpoint: 65.0,
        readback,
        current_limit: 10.0,
        current_readback: 1.0,
        state: ChannelState::On,
        ok: true,
    }
}

/// Bias source replaying a fixed table; fails every call after `fail_after`.
pub struct StubBias {
    rows: Vec<BiasChannelStatus>,
    fail_after: usize,
    calls: AtomicUsize,
}

impl StubBias {
    pub fn new(rows: Vec<BiasChannelStatus>) -> Self {
        Self {
            rows,
            fail_after: usize::MAX,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_after(mut self, calls: usize) -> Self {
        self.fail_after = calls;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BiasSource for StubBias {
    fn fetch_bias_status(&self, _tripwire: &Tripwire) -> ScResult<Vec<BiasChannelStatus>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.fail_after {
            return Err(ScError::ExternalProcess("status command exited with 1".into()));
        }
        Ok(self.rows.clone())
    }
}
