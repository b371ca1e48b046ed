//! Snapshot distribution server.
//!
//! The server keeps one long-lived session per controller crate and answers
//! single-board point queries from any number of clients. Each accepted
//! connection gets its own task; all of them share the crate links, and a
//! per-link mutex serializes the command/reply exchanges on each physical
//! session. A link that fails on the transport is dropped and reopened on
//! the next request.

use crate::config::Settings;
use crate::error::{ScError, ScResult};
use crate::executor::{run_bounded, Tripwire};
use crate::hardware::codec::{self, Command};
use crate::hardware::link::{Link, Session};
use crate::network::protocol::{
    board_index, read_request_line, write_frame, Reply, Request, Verb, HELP_TEXT,
};
use crate::reading::Side;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A crate link shared by every client connection.
pub struct SharedLink {
    link: Link,
    session: Mutex<Option<Session>>,
}

impl SharedLink {
    pub fn new(link: Link) -> Self {
        Self {
            link,
            session: Mutex::new(None),
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Open the session now instead of on the first request. Blocking.
    pub fn connect(&self) -> ScResult<()> {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.link.open()?);
            info!(link = self.link.name(), endpoint = %self.link.endpoint(), "Crate link connected");
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `op` on the shared session, holding the link for its duration.
    ///
    /// Blocking. Reopens a missing session first; drops the session again if
    /// `op` fails on the transport. A request whose deadline expired while it
    /// waited for the link returns [`ScError::Abandoned`] without touching the
    /// crate.
    pub fn query<T, F>(&self, wire: &Tripwire, op: F) -> ScResult<T>
    where
        F: FnOnce(&mut Session) -> ScResult<T>,
    {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if wire.is_tripped() {
            debug!(link = self.link.name(), "Skipping request abandoned while queued");
            return Err(ScError::Abandoned(self.link.name().to_string()));
        }
        let mut session = match guard.take() {
            Some(session) => session,
            None => {
                info!(link = self.link.name(), "Reopening crate link");
                self.link.open()?
            }
        };
        if let Err(err) = session.arm(wire) {
            warn!(link = self.link.name(), error = %err, "Could not arm session");
        }

        let result = op(&mut session);
        match &result {
            Err(err) if !err.keeps_session() => {
                warn!(link = self.link.name(), error = %err, "Dropping crate link");
            }
            _ => *guard = Some(session),
        }
        result
    }
}

struct ServerState {
    sides: [Arc<SharedLink>; 2],
    boards_per_side: usize,
    deadline: Duration,
    shutdown: watch::Sender<bool>,
}

impl ServerState {
    async fn respond(&self, request: Request) -> (Reply, bool) {
        match request {
            Request::Unknown(verb) => {
                warn!(%verb, "Unknown request verb");
                (Reply::Empty, false)
            }
            Request::Command {
                verb: Verb::Help, ..
            } => (Reply::Text(HELP_TEXT.to_string()), false),
            Request::Command {
                verb: Verb::Shutdown,
                ..
            } => {
                info!("Shutdown requested");
                (Reply::Empty, true)
            }
            Request::Command { verb, board } => (self.query(verb, board.as_deref()).await, false),
        }
    }

    async fn query(&self, verb: Verb, board: Option<&str>) -> Reply {
        let boards = self.boards_per_side * Side::ALL.len();
        let located = board_index(board, boards).and_then(|index| {
            Side::locate(index, self.boards_per_side)
                .ok_or_else(|| format!("board {index} is not served"))
        });
        let (side, local) = match located {
            Ok(found) => found,
            Err(msg) => return Reply::Text(format!("Specify interface board number: {msg}")),
        };

        let link = Arc::clone(&self.sides[side.index()]);
        let label = format!("{side}-{verb}");
        let result: Option<ScResult<Reply>> = run_bounded(&label, self.deadline, move |wire| {
            Some(link.query(wire, |session| match verb {
                Verb::Temperature => {
                    codec::read_tokens(session, Command::Temperature(local)).map(Reply::Values)
                }
                Verb::Voltage => codec::read_voltages(session, local).map(Reply::Voltages),
                Verb::Current => {
                    codec::read_tokens(session, Command::Current(local)).map(Reply::Values)
                }
                Verb::Help | Verb::Shutdown => Ok(Reply::Empty),
            }))
        })
        .await;

        match result {
            Some(Ok(reply)) => reply,
            Some(Err(err)) => {
                warn!(%side, board = local, %verb, error = %err, "Query failed");
                Reply::Text(format!("Query failed: {err}"))
            }
            None => Reply::Text(format!(
                "Query timed out after {} ms",
                self.deadline.as_millis()
            )),
        }
    }
}

/// Stops a running [`DistributionServer`].
#[derive(Clone)]
pub struct ShutdownSignal {
    state: Arc<ServerState>,
}

impl ShutdownSignal {
    pub fn trigger(&self) {
        self.state.shutdown.send_replace(true);
    }
}

pub struct DistributionServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl DistributionServer {
    /// Bind the listener and connect both controller links.
    ///
    /// A controller that cannot be reached is logged, not fatal: its link is
    /// opened on the first request for one of its boards.
    pub async fn bind(settings: &Settings) -> ScResult<Self> {
        let listener = TcpListener::bind(&settings.server.bind).await?;
        info!(addr = %listener.local_addr()?, "Distribution server listening");

        let sides = Side::ALL.map(|side| {
            Arc::new(SharedLink::new(
                Link::new(side.name(), settings.controllers.endpoint(side).clone())
                    .with_connect_timeout(settings.server.connect_timeout())
                    .with_read_timeout(settings.server.read_deadline())
                    .with_terminator(settings.interface.terminator),
            ))
        });

        for shared in &sides {
            let shared = Arc::clone(shared);
            let name = shared.link().name().to_string();
            match tokio::task::spawn_blocking(move || shared.connect()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(link = %name, error = %err, "Could not open crate link"),
                Err(err) => error!(link = %name, error = %err, "Connect task failed"),
            }
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                sides,
                boards_per_side: settings.controllers.boards_per_side,
                deadline: settings.server.read_deadline(),
                shutdown,
            }),
        })
    }

    pub fn local_addr(&self) -> ScResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            state: Arc::clone(&self.state),
        }
    }

    /// Accept clients until a `shutdown` request or [`ShutdownSignal`].
    pub async fn run(self) -> ScResult<()> {
        let mut shutdown = self.state.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            info!("Distribution server stopped before accepting");
            return Ok(());
        }
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(socket, addr, state).await {
                                warn!(%addr, error = %e, "Client error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept error"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Distribution server stopping");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_client(socket: TcpStream, addr: SocketAddr, state: Arc<ServerState>) -> ScResult<()> {
    info!(%addr, "Client connected");
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(line) = read_request_line(&mut reader).await? {
        let Some(request) = Request::parse(&line) else {
            debug!(%addr, "Ignoring blank request line");
            continue;
        };
        debug!(%addr, ?request, "Request received");

        let (reply, stop) = state.respond(request).await;
        write_frame(&mut writer, &reply)
            .await
            .map_err(|e| ScError::Protocol(format!("writing reply to {addr}: {e}")))?;
        if stop {
            state.shutdown.send_replace(true);
            break;
        }
    }

    info!(%addr, "Client disconnected");
    Ok(())
}
