//! Bias crate status collector.
//!
//! The bias crate is not reached over a line session: an external status
//! command prints one whitespace-delimited row per channel:
//!
//! ```text
//! <channel_id> <setpoint> <current_limit> <bias_readback> <current_readback> <unused> <on|off> <Ok|...>
//! ```
//!
//! [`BiasSource`] is the seam the scheduler polls through, so tests can swap
//! the command for a stub.

use crate::config::BiasSettings;
use crate::error::{ScError, ScResult};
use crate::executor::Tripwire;
use crate::reading::{BiasChannelStatus, ChannelState};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::debug;

const BIAS_COLUMNS: usize = 8;
const EXIT_POLL: Duration = Duration::from_millis(10);

/// Anything that can report bias channel status.
///
/// Called on an isolated worker; implementations may block.
pub trait BiasSource: Send + Sync {
    fn fetch_bias_status(&self, tripwire: &Tripwire) -> ScResult<Vec<BiasChannelStatus>>;
}

/// Runs the configured status program and parses its table.
#[derive(Debug, Clone)]
pub struct CommandBiasSource {
    program: String,
    args: Vec<String>,
}

impl CommandBiasSource {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_settings(settings: &BiasSettings) -> Self {
        Self::new(settings.program.clone(), settings.args.clone())
    }
}

impl BiasSource for CommandBiasSource {
    fn fetch_bias_status(&self, tripwire: &Tripwire) -> ScResult<Vec<BiasChannelStatus>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ScError::ExternalProcess(format!("cannot run {}: {e}", self.program)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScError::ExternalProcess("no stdout pipe".into()))?;

        let child = Arc::new(Mutex::new(child));
        let killer = Arc::clone(&child);
        tripwire.on_trip(move || {
            let _ = killer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .kill();
        });

        let mut output = String::new();
        stdout
            .read_to_string(&mut output)
            .map_err(|e| ScError::ExternalProcess(format!("reading output: {e}")))?;

        // Never hold the lock across a blocking wait; the trip hook needs it.
        let status = loop {
            let polled = child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait()
                .map_err(|e| {
                    ScError::ExternalProcess(format!("waiting for {}: {e}", self.program))
                })?;
            match polled {
                Some(status) => break status,
                None if tripwire.is_tripped() => {
                    return Err(ScError::ExternalProcess(format!(
                        "{} abandoned after deadline",
                        self.program
                    )))
                }
                None => thread::sleep(EXIT_POLL),
            }
        };
        if !status.success() {
            return Err(ScError::ExternalProcess(format!(
                "{} exited with {status}",
                self.program
            )));
        }

        debug!(program = %self.program, bytes = output.len(), "Bias status collected");
        parse_bias_table(&output)
    }
}

/// Parse the status table. Blank lines and `#` comments are skipped; any
/// other malformed row fails the whole table.
pub fn parse_bias_table(output: &str) -> ScResult<Vec<BiasChannelStatus>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_bias_row)
        .collect()
}

fn parse_bias_row(line: &str) -> ScResult<BiasChannelStatus> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != BIAS_COLUMNS {
        return Err(ScError::ExternalProcess(format!(
            "expected {BIAS_COLUMNS} columns, found {} in '{line}'",
            fields.len()
        )));
    }

    let number = |index: usize| -> ScResult<f64> {
        fields[index].parse::<f64>().map_err(|_| {
            ScError::ExternalProcess(format!("column {} is not a number in '{line}'", index + 1))
        })
    };

    let state = match fields[6].to_lowercase().as_str() {
        "on" => ChannelState::On,
        "off" => ChannelState::Off,
        other => {
            return Err(ScError::ExternalProcess(format!(
                "unknown channel state '{other}'"
            )))
        }
    };

    Ok(BiasChannelStatus {
        channel: fields[0].to_string(),
        setpoint: number(1)?,
        current_limit: number(2)?,
        readback: number(3)?,
        current_readback: number(4)?,
        state,
        ok: fields[7].eq_ignore_ascii_case("ok"),
    })
}
