//! # Store Connection
//!
//! Purpose: Own one TCP session to the backing store and drive it through its
//! lifecycle: dial, handshake, serve commands, re-dial after a failure, and
//! close gracefully.
//!
//! ## Design Principles
//! 1. **Explicit State Machine**: `ConnectionState` is the single source of
//!    truth for health; the pool only ever asks `is_healthy()`.
//! 2. **Exclusive Ownership**: Commands take `&mut self`, so a borrowed
//!    connection cannot be driven by two callers at once.
//! 3. **Buffer Reuse**: Each connection keeps its own line and write buffers.
//! 4. **No Replay**: A command that hit a broken socket fails even if the
//!    re-dial succeeds; only the session is repaired.
//! 5. **In-Flight Guard**: A request stays marked in flight from the first
//!    byte written until its last reply is read. A borrower dropped in that
//!    window leaves a reply on the socket, so the connection reports itself
//!    unhealthy and is never reused.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting ──> Connect ──> Ready ──(io error)──> Reconnecting ──> Ready
//!                                │                      │
//!                                │                      └─(retries exhausted)──> End
//!                                └──(close)──> Closing ──> End
//! ```

use std::fmt;
use std::io;

use keeper_common::{Endpoint, StoreOptions};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::events::{ConnectionId, EventSink, PoolEvent};
use crate::resp::{encode_command, read_response, RespValue};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connect,
    Ready,
    Reconnecting,
    Closing,
    End,
}

impl ConnectionState {
    /// Health predicate used when a connection is returned to its pool.
    pub fn is_healthy(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connect | ConnectionState::Ready
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connect => "connect",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
            ConnectionState::End => "end",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single session to the backing store with reusable buffers.
pub struct Connection {
    id: ConnectionId,
    endpoint: Endpoint,
    options: StoreOptions,
    events: EventSink,
    state: ConnectionState,
    in_flight: bool,
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: Option<BufReader<TcpStream>>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    /// Dials the endpoint and completes the handshake.
    ///
    /// A failure emits `PoolEvent::Error` and returns the cause; the
    /// half-built session is dropped.
    pub async fn open(
        id: ConnectionId,
        endpoint: Endpoint,
        options: StoreOptions,
        events: EventSink,
    ) -> StoreResult<Self> {
        let mut conn = Connection {
            id,
            endpoint,
            options,
            events,
            state: ConnectionState::Connecting,
            in_flight: false,
            reader: None,
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        };

        debug!(connection_id = id, endpoint = %conn.endpoint, "opening connection");
        if let Err(err) = conn.dial().await {
            warn!(connection_id = id, endpoint = %conn.endpoint, error = %err, "failed to open connection");
            conn.state = ConnectionState::End;
            conn.events.emit(PoolEvent::Error {
                id,
                message: err.to_string(),
            });
            return Err(err);
        }
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Healthy state and no request awaiting its reply.
    pub fn is_healthy(&self) -> bool {
        !self.in_flight && self.state.is_healthy()
    }

    /// True while a written request still has unread replies.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Sends one command and returns the raw reply, server errors included.
    ///
    /// A broken session is re-dialed before the error is returned.
    pub async fn query<A: AsRef<[u8]>>(&mut self, args: &[A]) -> StoreResult<RespValue> {
        let result = self.round_trip(args).await;
        if let Err(err) = &result {
            if err.is_connection_failure() {
                self.recover(err).await;
            }
        }
        result
    }

    /// Writes all commands in one batch, then reads one reply per command.
    ///
    /// Replies come back in submission order. A server error reply fails only
    /// its own slot; a broken session fails the whole batch.
    pub async fn exec_commands<C, A>(&mut self, commands: &[C]) -> StoreResult<Vec<StoreResult<RespValue>>>
    where
        C: AsRef<[A]>,
        A: AsRef<[u8]>,
    {
        let result = self.pipeline_round_trip(commands).await;
        if let Err(err) = &result {
            if err.is_connection_failure() {
                self.recover(err).await;
            }
        }
        result
    }

    /// Flushes, says `QUIT`, waits for the server to acknowledge, and shuts
    /// the socket down. Idempotent.
    pub async fn close(&mut self) -> StoreResult<()> {
        if self.state == ConnectionState::End && self.reader.is_none() {
            return Ok(());
        }
        self.state = ConnectionState::Closing;
        debug!(connection_id = self.id, "closing connection");

        let mut outcome = Ok(());
        if let Some(mut reader) = self.reader.take() {
            if self.in_flight {
                // The next reply belongs to an abandoned request, not to QUIT.
                let _ = reader.get_mut().shutdown().await;
                self.in_flight = false;
            } else {
                outcome = quit(&mut reader, &mut self.write_buf, &mut self.line_buf).await;
            }
            self.events.emit(PoolEvent::Close {
                id: self.id,
                error: outcome.as_ref().err().map(ToString::to_string),
            });
        }

        self.state = ConnectionState::End;
        self.events.emit(PoolEvent::Disconnected(self.id));
        outcome
    }

    async fn dial(&mut self) -> StoreResult<()> {
        self.state = ConnectionState::Connecting;
        let stream = connect_stream(&self.endpoint, &self.options).await?;
        self.reader = Some(BufReader::new(stream));
        self.in_flight = false;
        self.state = ConnectionState::Connect;
        self.events.emit(PoolEvent::Connect(self.id));

        self.handshake().await?;
        self.state = ConnectionState::Ready;
        self.events.emit(PoolEvent::Ready(self.id));
        Ok(())
    }

    async fn handshake(&mut self) -> StoreResult<()> {
        let password = self
            .endpoint
            .password
            .clone()
            .or_else(|| self.options.password.clone());
        if let Some(password) = password {
            let mut args = vec!["AUTH".to_string()];
            if let Some(user) = self.endpoint.username.clone() {
                args.push(user);
            }
            args.push(password);
            expect_ok(self.round_trip(args.as_slice()).await?, "AUTH")?;
        }

        if let Some(database) = self.endpoint.database.or(self.options.database) {
            let database = database.to_string();
            expect_ok(self.round_trip(&["SELECT", database.as_str()]).await?, "SELECT")?;
        }
        Ok(())
    }

    async fn round_trip<A: AsRef<[u8]>>(&mut self, args: &[A]) -> StoreResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let reader = self.reader.as_mut().ok_or(StoreError::Closed)?;
        self.in_flight = true;
        let stream = reader.get_mut();
        stream.write_all(&self.write_buf).await?;
        stream.flush().await?;

        let reply = read_response(reader, &mut self.line_buf).await?;
        self.in_flight = false;
        Ok(reply)
    }

    async fn pipeline_round_trip<C, A>(&mut self, commands: &[C]) -> StoreResult<Vec<StoreResult<RespValue>>>
    where
        C: AsRef<[A]>,
        A: AsRef<[u8]>,
    {
        self.write_buf.clear();
        for command in commands {
            encode_command(command.as_ref(), &mut self.write_buf);
        }

        let reader = self.reader.as_mut().ok_or(StoreError::Closed)?;
        self.in_flight = true;
        let stream = reader.get_mut();
        stream.write_all(&self.write_buf).await?;
        stream.flush().await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(read_response(reader, &mut self.line_buf).await?.into_result());
        }
        self.in_flight = false;
        Ok(replies)
    }

    /// Re-dials after a session failure, following the retry policy.
    async fn recover(&mut self, cause: &StoreError) {
        warn!(connection_id = self.id, error = %cause, "connection broke");
        self.events.emit(PoolEvent::Error {
            id: self.id,
            message: cause.to_string(),
        });
        self.reader = None;

        let mut last_error = cause.to_string();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(delay) = self.options.retry.delay_for(attempt) else {
                break;
            };
            self.state = ConnectionState::Reconnecting;
            self.events.emit(PoolEvent::Reconnecting {
                id: self.id,
                attempt,
                delay,
            });
            tokio::time::sleep(delay).await;

            match self.dial().await {
                Ok(()) => {
                    debug!(connection_id = self.id, attempt, "connection restored");
                    return;
                }
                Err(err) => {
                    warn!(connection_id = self.id, attempt, error = %err, "reconnect failed");
                    self.reader = None;
                    self.events.emit(PoolEvent::Error {
                        id: self.id,
                        message: err.to_string(),
                    });
                    last_error = err.to_string();
                }
            }
        }

        self.state = ConnectionState::End;
        self.events.emit(PoolEvent::Close {
            id: self.id,
            error: Some(last_error),
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

pub(crate) fn expect_ok(reply: RespValue, command: &'static str) -> StoreResult<()> {
    match reply.into_result()? {
        RespValue::Simple(_) => Ok(()),
        _ => Err(StoreError::UnexpectedResponse(command)),
    }
}

async fn quit(
    reader: &mut BufReader<TcpStream>,
    write_buf: &mut Vec<u8>,
    line_buf: &mut Vec<u8>,
) -> StoreResult<()> {
    write_buf.clear();
    encode_command(&["QUIT"], write_buf);

    let stream = reader.get_mut();
    stream.write_all(write_buf).await?;
    stream.flush().await?;
    read_response(reader, line_buf).await?;

    // The server hangs up after acknowledging QUIT; a failed shutdown here
    // only means it already did.
    let _ = reader.get_mut().shutdown().await;
    Ok(())
}

async fn connect_stream(endpoint: &Endpoint, options: &StoreOptions) -> StoreResult<TcpStream> {
    let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    let stream = match options.connect_timeout() {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
        None => connect.await?,
    };
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_predicate() {
        assert!(ConnectionState::Connecting.is_healthy());
        assert!(ConnectionState::Connect.is_healthy());
        assert!(ConnectionState::Ready.is_healthy());
        assert!(!ConnectionState::Reconnecting.is_healthy());
        assert!(!ConnectionState::Closing.is_healthy());
        assert!(!ConnectionState::End.is_healthy());
    }

    #[test]
    fn expect_ok_maps_replies() {
        assert!(expect_ok(RespValue::Simple(b"OK".to_vec()), "SET").is_ok());
        assert!(matches!(
            expect_ok(RespValue::Integer(1), "SET"),
            Err(StoreError::UnexpectedResponse("SET"))
        ));
        assert!(matches!(
            expect_ok(RespValue::Error(b"ERR no".to_vec()), "SET"),
            Err(StoreError::Server(_))
        ));
    }
}
