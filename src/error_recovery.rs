//! Retry-then-substitute policy for the low-voltage crate.
//!
//! The LV crate is the one link that is routinely offline. Its poll connects
//! with a short timeout, retries according to a [`RetryPolicy`] and, once
//! the attempts are exhausted, reports the link as unreachable. The scheduler
//! then stores [`LvReadings::sentinel`] for every channel of both boards so
//! the snapshot schema stays stable and the failure never reaches its caller.

use crate::config::LvSettings;
use crate::error::{ScError, ScResult};
use crate::executor::Tripwire;
use crate::hardware::codec;
use crate::hardware::link::{Link, Session};
use crate::reading::RailPair;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// How many times to try connecting and how long to wait in between.
///
/// # Example
///
/// ```rust
/// use sepd_sc::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 3,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(RetryPolicy::default().max_attempts, 1);
/// ```
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first one; 1 means "try once".
    pub max_attempts: u32,
    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &LvSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff_delay: Duration::from_millis(settings.backoff_ms),
        }
    }
}

/// Open a session, retrying connection errors per `policy`.
///
/// Blocking; only call from a bounded worker. Stops early once `tripwire`
/// has fired.
pub fn connect_with_retry(
    link: &Link,
    policy: &RetryPolicy,
    tripwire: &Tripwire,
) -> ScResult<Session> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match link.open() {
            Ok(session) => return Ok(session),
            Err(err @ ScError::Connection { .. })
                if attempt < attempts && !tripwire.is_tripped() =>
            {
                warn!(link = link.name(), attempt, error = %err, "Connection failed, retrying");
                attempt += 1;
                thread::sleep(policy.backoff_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Per-board channel readings from the LV crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LvReadings {
    pub voltages: BTreeMap<usize, Vec<RailPair>>,
    pub currents: BTreeMap<usize, Vec<RailPair>>,
}

impl LvReadings {
    /// Sentinel rails (-1/-1) for every channel of every board.
    pub fn sentinel(boards: usize, channels: usize) -> Self {
        let rails: BTreeMap<usize, Vec<RailPair>> = (0..boards)
            .map(|board| (board, vec![RailPair::SENTINEL; channels]))
            .collect();
        Self {
            voltages: rails.clone(),
            currents: rails,
        }
    }
}

/// Outcome of one LV crate poll.
#[derive(Debug, Default)]
pub enum LvOutcome {
    /// Connected; boards whose replies failed to parse are absent.
    Polled(LvReadings),
    /// Connection attempts exhausted.
    Unreachable(ScError),
    /// Produced by the executor when the deadline expired.
    #[default]
    TimedOut,
}

/// The LV crate link together with its fallback policy.
#[derive(Debug, Clone)]
pub struct LvFallback {
    link: Link,
    policy: RetryPolicy,
    boards: usize,
    channels: usize,
}

impl LvFallback {
    pub fn new(link: Link, policy: RetryPolicy, boards: usize, channels: usize) -> Self {
        Self {
            link,
            policy,
            boards,
            channels,
        }
    }

    pub fn from_settings(settings: &LvSettings) -> Self {
        let link = Link::new("lv", settings.endpoint.clone())
            .with_connect_timeout(settings.connect_timeout())
            .with_read_timeout(settings.read_timeout())
            .with_terminator(settings.terminator);
        Self::new(
            link,
            RetryPolicy::from_settings(settings),
            settings.boards,
            settings.channels,
        )
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn sentinel(&self) -> LvReadings {
        LvReadings::sentinel(self.boards, self.channels)
    }

    /// Connect (with retries) and read both rails of every board.
    pub fn poll(&self, tripwire: &Tripwire) -> LvOutcome {
        let mut session = match connect_with_retry(&self.link, &self.policy, tripwire) {
            Ok(session) => session,
            Err(err) => return LvOutcome::Unreachable(err),
        };
        if let Err(err) = session.arm(tripwire) {
            warn!(link = self.link.name(), error = %err, "Could not arm session");
        }

        let mut readings = LvReadings::default();
        for board in 0..self.boards {
            match codec::read_lv_voltages(&mut session, board) {
                Ok(rails) => {
                    readings.voltages.insert(board, rails);
                }
                Err(err) if err.keeps_session() => {
                    warn!(board, error = %err, "Dropping LV voltages for this cycle");
                }
                Err(err) => {
                    warn!(board, error = %err, "LV link failed mid-poll");
                    break;
                }
            }
            match codec::read_lv_currents(&mut session, board) {
                Ok(rails) => {
                    readings.currents.insert(board, rails);
                }
                Err(err) if err.keeps_session() => {
                    warn!(board, error = %err, "Dropping LV currents for this cycle");
                }
                Err(err) => {
                    warn!(board, error = %err, "LV link failed mid-poll");
                    break;
                }
            }
        }
        session.close();
        debug!(
            voltages = readings.voltages.len(),
            currents = readings.currents.len(),
            "LV crate polled"
        );
        LvOutcome::Polled(readings)
    }
}
