//! Line-oriented TCP sessions to the crates.
//!
//! A [`Link`] describes how to reach one crate: endpoint, connect timeout,
//! socket read timeout, command line ending and reply terminator. Opening it
//! yields a [`Session`], which is scoped: the poller opens one right before a
//! batch of same-subsystem commands and drops it right after. Dropping a
//! session shuts the socket down, so it is released on every exit path.
//!
//! Sessions are blocking (`std::net`). They are only ever driven from the
//! isolated workers of [`run_bounded`](crate::executor::run_bounded).

use crate::config::Endpoint;
use crate::error::{ScError, ScResult};
use crate::executor::Tripwire;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

/// Default ending appended to every command, as the crate terminals expect.
pub const COMMAND_ENDING: &str = "\n\r";

/// Connection parameters for one crate.
#[derive(Debug, Clone)]
pub struct Link {
    name: String,
    endpoint: Endpoint,
    connect_timeout: Duration,
    read_timeout: Duration,
    terminator: u8,
}

impl Link {
    /// Create a link with a 1 s connect/read timeout and `>` as terminator.
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            terminator: b'>',
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Socket-level read timeout; a backstop behind the executor deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Non-ASCII terminators are ignored; the crates speak ASCII.
    pub fn with_terminator(mut self, terminator: char) -> Self {
        if let Ok(byte) = u8::try_from(terminator) {
            self.terminator = byte;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn terminator(&self) -> char {
        char::from(self.terminator)
    }

    /// Connect, trying every resolved address within the connect timeout.
    pub fn open(&self) -> ScResult<Session> {
        let endpoint = self.endpoint.to_string();
        let connection_error = |source: std::io::Error| ScError::Connection {
            endpoint: endpoint.clone(),
            source,
        };

        let addrs = (self.endpoint.host.as_str(), self.endpoint.port)
            .to_socket_addrs()
            .map_err(connection_error)?;

        let mut last_err =
            std::io::Error::new(ErrorKind::AddrNotAvailable, "endpoint resolved to no address");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    stream.set_nodelay(true)?;
                    debug!(link = %self.name, %endpoint, "Session opened");
                    return Ok(Session {
                        link: self.clone(),
                        reader: BufReader::new(stream),
                    });
                }
                Err(e) => last_err = e,
            }
        }
        Err(connection_error(last_err))
    }

    /// Open a session, run `f` on it and release it, whatever `f` returns.
    pub fn with_session<T, F>(&self, f: F) -> ScResult<T>
    where
        F: FnOnce(&mut Session) -> ScResult<T>,
    {
        let mut session = self.open()?;
        let result = f(&mut session);
        session.close();
        result
    }
}

/// An open session to a crate.
pub struct Session {
    link: Link,
    reader: BufReader<TcpStream>,
}

impl Session {
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Let a bounded executor shut this session down on deadline expiry.
    pub fn arm(&self, tripwire: &Tripwire) -> ScResult<()> {
        tripwire.arm_stream(self.reader.get_ref())?;
        Ok(())
    }

    /// Send one command and read until the reply terminator.
    ///
    /// The returned reply still ends with the terminator byte.
    pub fn exchange(&mut self, command: &str) -> ScResult<String> {
        let endpoint = self.link.endpoint.to_string();
        let line = format!("{command}{COMMAND_ENDING}");
        trace!(link = %self.link.name, command = %line.escape_default(), "Sending");

        let stream = self.reader.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.flush()?;

        let mut raw = Vec::new();
        match self.reader.read_until(self.link.terminator, &mut raw) {
            Ok(_) if raw.last() == Some(&self.link.terminator) => {}
            Ok(_) => return Err(ScError::LinkClosed(endpoint)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ScError::ReadTimeout {
                    endpoint,
                    timeout: self.link.read_timeout,
                });
            }
            Err(e) => return Err(ScError::Io(e)),
        }

        let reply = String::from_utf8_lossy(&raw).into_owned();
        trace!(link = %self.link.name, reply = %reply.escape_default(), "Received");
        Ok(reply)
    }

    /// Release the session. Dropping it has the same effect.
    pub fn close(self) {
        debug!(link = %self.link.name, "Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
    }
}
