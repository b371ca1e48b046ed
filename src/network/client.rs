//! Client side of the distribution protocol.

use crate::error::{ScError, ScResult};
use crate::network::protocol::{read_frame, Reply, Request, Verb};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A connection to a distribution server.
///
/// Requests are answered in order, so one client is driven by one task.
pub struct DistributionClient {
    addr: String,
    stream: BufStream<TcpStream>,
    timeout: Duration,
}

impl DistributionClient {
    pub async fn connect(addr: &str, request_timeout: Duration) -> ScResult<Self> {
        let stream = match timeout(request_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ScError::Connection {
                    endpoint: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ScError::Connection {
                    endpoint: addr.to_string(),
                    source: std::io::ErrorKind::TimedOut.into(),
                })
            }
        };
        debug!(%addr, "Connected to distribution server");
        Ok(Self {
            addr: addr.to_string(),
            stream: BufStream::new(stream),
            timeout: request_timeout,
        })
    }

    pub async fn request(&mut self, verb: Verb, board: Option<usize>) -> ScResult<Reply> {
        self.send(&Request::new(verb, board)).await
    }

    /// Send any request line and wait for its reply frame.
    pub async fn send(&mut self, request: &Request) -> ScResult<Reply> {
        self.stream.write_all(request.to_line().as_bytes()).await?;
        self.stream.flush().await?;
        match timeout(self.timeout, read_frame(&mut self.stream)).await {
            Ok(reply) => reply,
            Err(_) => Err(ScError::ReadTimeout {
                endpoint: self.addr.clone(),
                timeout: self.timeout,
            }),
        }
    }

    /// Query one verb for boards `0..boards`, skipping boards that fail.
    pub async fn query_all(&mut self, verb: Verb, boards: usize) -> BTreeMap<usize, Reply> {
        let mut replies = BTreeMap::new();
        for board in 0..boards {
            match self.request(verb, Some(board)).await {
                Ok(reply) => {
                    replies.insert(board, reply);
                }
                Err(err) => warn!(board, %verb, error = %err, "Query failed"),
            }
        }
        replies
    }

    /// Ask the server to stop.
    pub async fn shutdown_server(mut self) -> ScResult<()> {
        self.request(Verb::Shutdown, None).await.map(|_| ())
    }
}
