//! Configuration System using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. built-in defaults (the production crate addresses and timings)
//! 2. a TOML file (`config/sepd.toml` by default)
//! 3. environment variables prefixed with `SEPD_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use sepd_sc::config::Settings;
//!
//! let settings = Settings::load_from("config/sepd.toml")?;
//! settings.validate()?;
//! println!("north controller: {}", settings.controllers.north);
//! # Ok::<(), sepd_sc::error::ScError>(())
//! ```

use crate::error::{ScError, ScResult};
use crate::reading::Side;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings, handed to the engine as one opaque object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
    pub controllers: ControllerSettings,
    pub interface: InterfaceSettings,
    pub lv: LvSettings,
    pub bias: BiasSettings,
    pub cache: CacheSettings,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub export: ExportThresholds,
    /// Space-delimited channel mapping file; no map means no tile labels.
    pub channel_map: Option<PathBuf>,
}

/// Host/port of a line-oriented crate session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-side controller crates, each multiplexing `boards_per_side` boards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub north: Endpoint,
    pub south: Endpoint,
    pub boards_per_side: usize,
}

impl ControllerSettings {
    pub fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::North => &self.north,
            Side::South => &self.south,
        }
    }

    pub fn total_boards(&self) -> usize {
        self.boards_per_side * Side::ALL.len()
    }
}

/// Interface-board read timings for the poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSettings {
    pub connect_timeout_ms: u64,
    /// Deadline per board read; a side's batch gets this times its board count.
    pub read_deadline_ms: u64,
    /// Byte ending every controller reply.
    pub terminator: char,
}

impl InterfaceSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }

    pub fn batch_deadline(&self, boards: usize) -> Duration {
        self.connect_timeout() + self.read_deadline() * boards.max(1) as u32
    }
}

/// Low-voltage crate link and its fallback policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LvSettings {
    pub endpoint: Endpoint,
    pub boards: usize,
    pub channels: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub deadline_ms: u64,
    /// Connection attempts before falling back to sentinels (1 = try once).
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub terminator: char,
}

impl LvSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// External bias status command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasSettings {
    pub program: String,
    pub args: Vec<String>,
    pub deadline_ms: u64,
}

impl BiasSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// How long a successful gain-mode read stays fresh.
    pub gain_ttl_secs: u64,
    /// Minimum spacing between two completed poll cycles.
    pub throttle_ms: u64,
}

impl CacheSettings {
    pub fn gain_ttl(&self) -> Duration {
        Duration::from_secs(self.gain_ttl_secs)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub connect_timeout_ms: u64,
    /// Deadline for one single-board query against a shared crate link.
    pub read_deadline_ms: u64,
}

impl ServerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server: String,
    pub timeout_ms: u64,
}

impl ClientSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Hardware-specific readings that mean "this interface board is powered off".
///
/// Applied by the exporter only; the scheduler stores raw values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportThresholds {
    pub temperature_off_below: f64,
    pub current_off_above: f64,
    pub voltage_off_above: f64,
}

impl Default for ExportThresholds {
    fn default() -> Self {
        Self {
            temperature_off_below: 0.0,
            current_off_above: 2045.0,
            voltage_off_above: 12.0,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            controllers: ControllerSettings::default(),
            interface: InterfaceSettings::default(),
            lv: LvSettings::default(),
            bias: BiasSettings::default(),
            cache: CacheSettings::default(),
            server: ServerSettings::default(),
            client: ClientSettings::default(),
            export: ExportThresholds::default(),
            channel_map: None,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            north: Endpoint::new("10.20.34.98", 9760),
            south: Endpoint::new("10.20.34.99", 9760),
            boards_per_side: 6,
        }
    }
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            read_deadline_ms: 1000,
            terminator: '>',
        }
    }
}

impl Default for LvSettings {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("10.20.34.136", 9760),
            boards: 2,
            channels: 8,
            connect_timeout_ms: 500,
            read_timeout_ms: 1000,
            deadline_ms: 3000,
            max_attempts: 1,
            backoff_ms: 100,
            terminator: '>',
        }
    }
}

impl Default for BiasSettings {
    fn default() -> Self {
        Self {
            program: "bias_status".to_string(),
            args: Vec::new(),
            deadline_ms: 5000,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            gain_ttl_secs: 600,
            throttle_ms: 1000,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:12345".to_string(),
            connect_timeout_ms: 5000,
            read_deadline_ms: 2000,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:12345".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl Settings {
    /// Load from `config/sepd.toml` and `SEPD_` environment variables.
    pub fn load() -> ScResult<Self> {
        Self::load_from("config/sepd.toml")
    }

    /// Load from a specific file; a missing file leaves the defaults in place.
    ///
    /// Environment variables override the file, e.g.
    /// `SEPD_CACHE__THROTTLE_MS=500` or `SEPD_CONTROLLERS__NORTH__HOST=localhost`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SEPD_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> ScResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ScError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.controllers.boards_per_side == 0 {
            return Err(ScError::Config("boards_per_side must be at least 1".into()));
        }

        if self.lv.boards == 0 || self.lv.channels == 0 {
            return Err(ScError::Config(
                "lv.boards and lv.channels must be at least 1".into(),
            ));
        }

        if self.lv.max_attempts == 0 {
            return Err(ScError::Config(
                "lv.max_attempts must be at least 1 (1 = try once)".into(),
            ));
        }

        let deadlines = [
            ("interface.read_deadline_ms", self.interface.read_deadline_ms),
            ("lv.deadline_ms", self.lv.deadline_ms),
            ("bias.deadline_ms", self.bias.deadline_ms),
            ("server.read_deadline_ms", self.server.read_deadline_ms),
        ];
        for (name, value) in deadlines {
            if value == 0 {
                return Err(ScError::Config(format!("{name} must be greater than 0")));
            }
        }

        if !self.interface.terminator.is_ascii() || !self.lv.terminator.is_ascii() {
            return Err(ScError::Config("reply terminators must be ASCII".into()));
        }

        Ok(())
    }
}
