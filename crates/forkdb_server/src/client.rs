//! Minimal line-protocol client.

use crate::engine::QueryResult;
use crate::error::{ClientError, ClientResult};
use crate::session::ConnectionId;
use crate::wire::{self, Frame, MAX_LINE_LENGTH, QUIT};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LinesCodec};

/// One authenticated connection to a forkdb server.
///
/// ```rust,ignore
/// let mut client = Client::connect(addr, "root", "").await?;
/// client.query("SELECT checkout('-b', 'feature')").await?;
/// let result = client.query("SELECT active_branch()").await?;
/// assert_eq!(result.rows[0][0], "feature");
/// client.quit().await?;
/// ```
#[derive(Debug)]
pub struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    connection_id: ConnectionId,
}

impl Client {
    /// Connects and authenticates.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        user: &str,
        password: &str,
    ) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        framed.send(wire::render_auth(user, password)).await?;
        match read_frame(&mut framed).await? {
            Frame::Ok(id) => {
                let connection_id = ConnectionId::try_from(id).map_err(|_| {
                    ClientError::UnexpectedResponse(format!("connection id {id} out of range"))
                })?;
                Ok(Self {
                    framed,
                    connection_id,
                })
            }
            Frame::Err(message) => Err(ClientError::Rejected(message)),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Returns the id the server assigned to this connection.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Runs one statement.
    ///
    /// Line breaks in `sql` are sent as spaces. A server-side failure is
    /// returned as [`ClientError::Statement`] and leaves the connection usable.
    pub async fn query(&mut self, sql: &str) -> ClientResult<QueryResult> {
        let line: String = sql
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        self.framed.send(line).await?;

        let mut result = QueryResult::empty();
        loop {
            match read_frame(&mut self.framed).await? {
                Frame::Columns(columns) => result.columns = columns,
                Frame::Row(row) => result.rows.push(row),
                Frame::Ok(_) => return Ok(result),
                Frame::Err(message) => return Err(ClientError::Statement(message)),
                Frame::Bye => return Err(ClientError::Closed),
            }
        }
    }

    /// Ends the session politely.
    pub async fn quit(mut self) -> ClientResult<()> {
        self.framed.send(QUIT).await?;
        match read_frame(&mut self.framed).await {
            Ok(Frame::Bye) | Err(ClientError::Closed) => Ok(()),
            Ok(other) => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
            Err(e) => Err(e),
        }
    }
}

async fn read_frame(framed: &mut Framed<TcpStream, LinesCodec>) -> ClientResult<Frame> {
    let line = framed.next().await.ok_or(ClientError::Closed)??;
    match Frame::parse(&line) {
        Some(frame) => Ok(frame),
        None => Err(ClientError::UnexpectedResponse(line)),
    }
}
