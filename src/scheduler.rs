//! Snapshot cache and poll scheduler.
//!
//! [`Scheduler`] owns the last-known-good [`Snapshot`]. Each call to
//! [`Scheduler::get_snapshot`] either serves the cached snapshot (when a cycle
//! completed less than `cache.throttle_ms` ago) or runs one poll cycle:
//!
//! - both controller sides, the LV crate and the bias collector run
//!   concurrently, each in its own bounded worker
//! - within a side, temperatures, voltages, currents and (when due) gain modes
//!   are read one subsystem at a time over a fresh scoped session
//! - results merge into the snapshot keyed by absolute board index; boards
//!   that failed keep their previous values
//!
//! Cycles are serialized by one async mutex, so two callers never drive the
//! hardware at once. A panic escaping the cycle is caught, counted and the
//! previous snapshot is served unchanged.

use crate::config::{ControllerSettings, InterfaceSettings, Settings};
use crate::error::ScResult;
use crate::error_recovery::{LvFallback, LvOutcome};
use crate::executor::{run_bounded, Tripwire};
use crate::hardware::bias::{BiasSource, CommandBiasSource};
use crate::hardware::codec;
use crate::hardware::link::{Link, Session};
use crate::reading::{BiasChannelStatus, GainMode, Side, VoltageTriple};
use crate::snapshot::{self, Snapshot};
use chrono::Utc;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type BoardRead<T> = fn(&mut Session, usize) -> ScResult<T>;

/// Refresh window of a slow-changing subsystem.
///
/// Transitions on elapsed wall-clock time, not on the number of cycles.
#[derive(Debug, Clone)]
pub struct TtlState {
    ttl: Duration,
    last_refresh: Option<Instant>,
}

impl TtlState {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last_refresh: None,
        }
    }

    /// `true` until the first successful read, then again once the TTL elapsed.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_refresh {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.ttl,
        }
    }

    /// Whether a cached value is being served instead of polling.
    pub fn is_cached(&self, now: Instant) -> bool {
        !self.is_due(now)
    }

    pub fn mark_refreshed(&mut self, now: Instant) {
        self.last_refresh = Some(now);
    }
}

/// Counters over all `get_snapshot` calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleStats {
    pub incoming: u64,
    pub throttled: u64,
    pub updated: u64,
    pub failed: u64,
    pub last_cycle: Option<Duration>,
}

struct State {
    snapshot: Snapshot,
    gain: [TtlState; 2],
    last_completed: Option<Instant>,
    stats: CycleStats,
}

#[derive(Default)]
struct SideResult {
    temperatures: BTreeMap<usize, Vec<f64>>,
    voltages: BTreeMap<usize, VoltageTriple>,
    currents: BTreeMap<usize, Vec<f64>>,
    /// `None` when gain was not due this cycle.
    gains: Option<BTreeMap<usize, GainMode>>,
}

struct CycleResult {
    sides: [(Side, SideResult); 2],
    lv: LvOutcome,
    bias: Option<ScResult<Vec<BiasChannelStatus>>>,
}

/// Run a cycle, turning a panic into `None`.
async fn guarded<F>(cycle: F) -> Option<CycleResult>
where
    F: Future<Output = CycleResult>,
{
    AssertUnwindSafe(cycle).catch_unwind().await.ok()
}

pub struct Scheduler {
    controllers: ControllerSettings,
    interface: InterfaceSettings,
    lv: LvFallback,
    lv_deadline: Duration,
    bias: Arc<dyn BiasSource>,
    bias_deadline: Duration,
    throttle: Duration,
    state: Mutex<State>,
}

impl Scheduler {
    pub fn new(settings: &Settings, bias: Arc<dyn BiasSource>) -> Self {
        let gain_ttl = settings.cache.gain_ttl();
        Self {
            controllers: settings.controllers.clone(),
            interface: settings.interface.clone(),
            lv: LvFallback::from_settings(&settings.lv),
            lv_deadline: settings.lv.deadline(),
            bias,
            bias_deadline: settings.bias.deadline(),
            throttle: settings.cache.throttle(),
            state: Mutex::new(State {
                snapshot: Snapshot::default(),
                gain: [TtlState::new(gain_ttl), TtlState::new(gain_ttl)],
                last_completed: None,
                stats: CycleStats::default(),
            }),
        }
    }

    /// Scheduler polling bias status through the configured external command.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings,
            Arc::new(CommandBiasSource::from_settings(&settings.bias)),
        )
    }

    /// Return the current snapshot, polling first unless throttled.
    pub async fn get_snapshot(&self) -> Snapshot {
        let mut state = self.state.lock().await;
        state.stats.incoming += 1;

        let now = Instant::now();
        if let Some(last) = state.last_completed {
            if now.saturating_duration_since(last) < self.throttle {
                state.stats.throttled += 1;
                debug!("Poll throttled, serving cached snapshot");
                return state.snapshot.clone();
            }
        }

        let gain_due = [state.gain[0].is_due(now), state.gain[1].is_due(now)];
        let started = Instant::now();
        let outcome = guarded(self.poll_cycle(gain_due)).await;
        self.record_cycle(&mut state, outcome, started.elapsed());
        state.snapshot.clone()
    }

    /// Fold a cycle into the cached state. `None` is a cycle that panicked.
    fn record_cycle(&self, state: &mut State, outcome: Option<CycleResult>, elapsed: Duration) {
        match outcome {
            Some(result) => {
                self.apply(state, result);
                state.stats.updated += 1;
            }
            None => {
                state.stats.failed += 1;
                error!("Poll cycle failed, serving previous snapshot");
            }
        }
        state.stats.last_cycle = Some(elapsed);
        state.last_completed = Some(Instant::now());
        debug!(
            ?elapsed,
            subsystems = ?state.snapshot.populated(),
            "Poll cycle complete"
        );
    }

    /// The cached snapshot, without polling.
    pub async fn snapshot(&self) -> Snapshot {
        self.state.lock().await.snapshot.clone()
    }

    pub async fn stats(&self) -> CycleStats {
        self.state.lock().await.stats.clone()
    }

    async fn poll_cycle(&self, gain_due: [bool; 2]) -> CycleResult {
        let (north, south, lv, bias) = tokio::join!(
            self.poll_side(Side::North, gain_due[Side::North.index()]),
            self.poll_side(Side::South, gain_due[Side::South.index()]),
            self.poll_lv(),
            self.poll_bias(),
        );
        CycleResult {
            sides: [(Side::North, north), (Side::South, south)],
            lv,
            bias,
        }
    }

    fn side_link(&self, side: Side) -> Link {
        Link::new(side.name(), self.controllers.endpoint(side).clone())
            .with_connect_timeout(self.interface.connect_timeout())
            .with_read_timeout(self.interface.read_deadline())
            .with_terminator(self.interface.terminator)
    }

    async fn poll_side(&self, side: Side, gain_due: bool) -> SideResult {
        let link = self.side_link(side);
        let boards = self.controllers.boards_per_side;
        let offset = side.board_offset(boards);
        let deadline = self.interface.batch_deadline(boards);

        let temperatures = bounded_boards(
            format!("{side}-temperature"),
            deadline,
            link.clone(),
            offset,
            boards,
            codec::read_temperatures,
        )
        .await;
        let voltages = bounded_boards(
            format!("{side}-voltage"),
            deadline,
            link.clone(),
            offset,
            boards,
            codec::read_voltages,
        )
        .await;
        let currents = bounded_boards(
            format!("{side}-current"),
            deadline,
            link.clone(),
            offset,
            boards,
            codec::read_currents,
        )
        .await;
        let gains = if gain_due {
            Some(
                bounded_boards(
                    format!("{side}-gain"),
                    deadline,
                    link,
                    offset,
                    boards,
                    codec::read_gain_mode,
                )
                .await,
            )
        } else {
            None
        };

        SideResult {
            temperatures,
            voltages,
            currents,
            gains,
        }
    }

    async fn poll_lv(&self) -> LvOutcome {
        let lv = self.lv.clone();
        run_bounded("lv", self.lv_deadline, move |wire| lv.poll(wire)).await
    }

    async fn poll_bias(&self) -> Option<ScResult<Vec<BiasChannelStatus>>> {
        let source = Arc::clone(&self.bias);
        run_bounded("bias", self.bias_deadline, move |wire| {
            Some(source.fetch_bias_status(wire))
        })
        .await
    }

    fn apply(&self, state: &mut State, result: CycleResult) {
        let captured = Utc::now();
        let snapshot = &mut state.snapshot;

        for (side, side_result) in result.sides {
            snapshot::merge(&mut snapshot.temperatures, side_result.temperatures, captured);
            snapshot::merge(&mut snapshot.interface_voltages, side_result.voltages, captured);
            snapshot::merge(&mut snapshot.interface_currents, side_result.currents, captured);
            if let Some(gains) = side_result.gains {
                let read = gains.len();
                snapshot::merge(&mut snapshot.gain_modes, gains, captured);
                if read == self.controllers.boards_per_side {
                    state.gain[side.index()].mark_refreshed(Instant::now());
                    info!(%side, "Gain modes refreshed");
                } else {
                    warn!(%side, read, "Gain sweep incomplete, retrying next cycle");
                }
            }
        }

        let lv = match result.lv {
            LvOutcome::Polled(readings) => Some(readings),
            LvOutcome::Unreachable(err) => {
                error!(link = self.lv.link().name(), error = %err, "LV crate unreachable, substituting sentinel readings");
                None
            }
            LvOutcome::TimedOut => {
                error!(link = self.lv.link().name(), "LV crate poll timed out, substituting sentinel readings");
                None
            }
        };
        match lv {
            Some(readings) => {
                snapshot::merge(&mut snapshot.lv_voltages, readings.voltages, captured);
                snapshot::merge(&mut snapshot.lv_currents, readings.currents, captured);
            }
            None => {
                let sentinel = self.lv.sentinel();
                snapshot::replace(&mut snapshot.lv_voltages, sentinel.voltages, captured);
                snapshot::replace(&mut snapshot.lv_currents, sentinel.currents, captured);
            }
        }

        match result.bias {
            Some(Ok(rows)) => {
                let table: BTreeMap<String, BiasChannelStatus> = rows
                    .into_iter()
                    .map(|row| (row.channel.clone(), row))
                    .collect();
                snapshot::replace(&mut snapshot.bias, table, captured);
            }
            Some(Err(err)) => {
                error!(error = %err, "Bias status unavailable, keeping previous values")
            }
            None => error!("Bias status timed out, keeping previous values"),
        }
    }
}

async fn bounded_boards<T>(
    label: String,
    deadline: Duration,
    link: Link,
    offset: usize,
    boards: usize,
    read: BoardRead<T>,
) -> BTreeMap<usize, T>
where
    T: Send + 'static,
{
    run_bounded(&label, deadline, move |wire| {
        poll_boards(&link, wire, offset, boards, read)
    })
    .await
}

/// Read one subsystem from every board of a side over a single session.
///
/// A parse error drops that board only; a transport error ends the batch.
fn poll_boards<T>(
    link: &Link,
    wire: &Tripwire,
    offset: usize,
    boards: usize,
    read: BoardRead<T>,
) -> BTreeMap<usize, T> {
    let mut results = BTreeMap::new();
    let mut session = match link.open() {
        Ok(session) => session,
        Err(err) => {
            warn!(link = link.name(), error = %err, "Controller unreachable");
            return results;
        }
    };
    if let Err(err) = session.arm(wire) {
        warn!(link = link.name(), error = %err, "Could not arm session");
    }

    for board in 0..boards {
        match read(&mut session, board) {
            Ok(value) => {
                results.insert(offset + board, value);
            }
            Err(err) if err.keeps_session() => {
                warn!(link = link.name(), board = offset + board, error = %err, "Dropping board for this cycle");
            }
            Err(err) => {
                warn!(link = link.name(), board = offset + board, error = %err, "Link failed mid-batch");
                break;
            }
        }
    }
    session.close();
    results
}
