//! Per-connection protocol handling.

use crate::dispatch::Dispatcher;
use crate::error::ConnectionError;
use crate::session::{ConnectionId, Session};
use crate::wire::{self, BYE, MAX_LINE_LENGTH, QUIT};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// State shared by every connection of one server run.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) user: String,
    pub(crate) password: String,
    pub(crate) write_limit: Option<Duration>,
    pub(crate) handshake_limit: Duration,
}

impl Shared {
    fn authenticate(&self, user: &str, password: &str) -> bool {
        user == self.user && password == self.password
    }
}

/// A single client connection.
pub(crate) struct Connection {
    framed: Framed<TcpStream, LinesCodec>,
    id: ConnectionId,
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, id: ConnectionId, shared: Arc<Shared>) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            id,
            shared,
        }
    }

    /// Serves the connection until the client quits, the socket fails, or
    /// `shutdown` fires while the connection is idle.
    ///
    /// A statement that is already executing is allowed to finish.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) -> Result<(), ConnectionError> {
        let Some(mut session) = self.handshake(&shutdown).await? else {
            return Ok(());
        };
        debug!(user = session.user(), branch = %session.active_branch(), "session opened");

        while let Some(line) = self.next_line(&shutdown).await? {
            let statement = line.trim();

            if statement.eq_ignore_ascii_case(QUIT) {
                self.send(vec![BYE.to_string()]).await?;
                break;
            }
            if statement.is_empty() {
                self.send(vec![String::from("OK 0")]).await?;
                continue;
            }

            debug!(statement, "executing");
            let response = match self.shared.dispatcher.execute(&mut session, statement).await {
                Ok(result) => wire::render_result(&result),
                Err(e) => {
                    debug!(error = %e, "statement failed");
                    vec![wire::render_error(e)]
                }
            };
            self.send(response).await?;
        }

        debug!("session closed");
        Ok(())
    }

    /// Reads the `AUTH` line. `None` if the peer left or shutdown began.
    ///
    /// A client that stays silent past the handshake limit is dropped so it
    /// does not hold a connection slot.
    async fn handshake(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<Option<Session>, ConnectionError> {
        let limit = self.shared.handshake_limit;
        let line = match tokio::time::timeout(limit, self.next_line(shutdown)).await {
            Ok(line) => line?,
            Err(_) => return Err(ConnectionError::HandshakeTimeout(limit)),
        };
        let Some(line) = line else {
            return Ok(None);
        };

        let Some((user, password)) = wire::parse_auth(&line) else {
            self.send(vec![wire::render_error("expected AUTH <user> <password>")])
                .await?;
            return Err(ConnectionError::AuthenticationFailed(String::new()));
        };

        if !self.shared.authenticate(&user, &password) {
            self.send(vec![wire::render_error(format!(
                "access denied for user '{user}'"
            ))])
            .await?;
            return Err(ConnectionError::AuthenticationFailed(user));
        }

        self.send(vec![wire::render_greeting(self.id)]).await?;
        Ok(Some(Session::open(
            self.id,
            user,
            self.shared.dispatcher.default_branch(),
        )))
    }

    /// Waits for the next line. `None` on EOF or shutdown.
    async fn next_line(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<Option<String>, ConnectionError> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("closing idle connection for shutdown");
                Ok(None)
            }
            line = self.framed.next() => line.transpose().map_err(ConnectionError::from),
        }
    }

    /// Writes and flushes `lines`, bounded by the write timeout.
    async fn send(&mut self, lines: Vec<String>) -> Result<(), ConnectionError> {
        let limit = self.shared.write_limit;
        let framed = &mut self.framed;
        let write = async move {
            for line in lines {
                framed.feed(line).await?;
            }
            SinkExt::<String>::flush(framed).await?;
            Ok::<_, ConnectionError>(())
        };

        match limit {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| ConnectionError::WriteTimeout(limit))?,
            None => write.await,
        }
    }
}

/// How long a rejected client gets to send its first line.
const REJECT_LINGER: Duration = Duration::from_millis(500);

/// Sends a single error line before the socket is dropped.
///
/// The client's first line is read (if it arrives in time) so closing does
/// not reset the connection before the error is delivered.
pub(crate) async fn reject(stream: TcpStream, message: &str) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    framed.send(wire::render_error(message)).await?;
    let _ = tokio::time::timeout(REJECT_LINGER, framed.next()).await;
    Ok(())
}
