//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the
//! in-memory store with minimal overhead.
//!
//! ## Design Principles
//! 1. **Task per Connection**: Each client runs on its own Tokio task.
//! 2. **Batch Replies**: Every command parsed from one read is answered with a
//!    single write, which keeps pipelines cheap.
//! 3. **Cooperative Shutdown**: A watch channel tells the accept loop and all
//!    client tasks to stop; dropped sockets surface as EOF to clients.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, MemoryStore, TtlStatus};
use crate::protocol::{RespError, RespParser};

/// Number of logical databases accepted by `SELECT`. All share one keyspace.
const DATABASES: i64 = 16;

/// Server-wide settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// When set, clients must `AUTH` before running data commands.
    pub password: Option<String>,
}

/// Cheap counters reported by `INFO`.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_total: AtomicU64,
    connected: AtomicU64,
    commands_total: AtomicU64,
}

impl ServerStats {
    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn connected(&self) -> u64 {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn commands_total(&self) -> u64 {
        self.commands_total.load(Ordering::Relaxed)
    }
}

/// State shared by every client task.
#[derive(Debug)]
pub struct ServerContext {
    pub store: Arc<MemoryStore>,
    pub config: ServerConfig,
    pub stats: ServerStats,
}

impl ServerContext {
    pub fn new(store: Arc<MemoryStore>, config: ServerConfig) -> Self {
        ServerContext {
            store,
            config,
            stats: ServerStats::default(),
        }
    }
}

/// Per-connection session flags.
#[derive(Debug)]
struct Session {
    authenticated: bool,
    quit: bool,
}

/// Handles a single TCP client connection until it disconnects or says `QUIT`.
pub async fn handle_connection(mut stream: TcpStream, ctx: Arc<ServerContext>) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = RespParser::new();
    let mut out = Vec::with_capacity(1024);
    let mut session = Session {
        authenticated: ctx.config.password.is_none(),
        quit: false,
    };

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        out.clear();
        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) if args.is_empty() => {}
                Ok(Some(args)) => {
                    ctx.stats.commands_total.fetch_add(1, Ordering::Relaxed);
                    out.extend_from_slice(&dispatch_command(&args, &ctx, &mut session));
                    if session.quit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    out.extend_from_slice(&resp_error("protocol error"));
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }

        if !out.is_empty() {
            stream.write_all(&out).await?;
        }
        if session.quit {
            stream.shutdown().await?;
            break;
        }
    }

    Ok(())
}

/// Accepts clients until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => break,
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "failed to set TCP_NODELAY");
        }

        ctx.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::clone(&ctx);
        let mut stop = shutdown.clone();
        tokio::spawn(async move {
            ctx.stats.connected.fetch_add(1, Ordering::Relaxed);
            debug!(%peer, "client connected");
            tokio::select! {
                result = handle_connection(stream, Arc::clone(&ctx)) => {
                    if let Err(err) = result {
                        debug!(%peer, error = %err, "client connection failed");
                    }
                }
                _ = stop.changed() => {
                    debug!(%peer, "dropping client on shutdown");
                }
            }
            ctx.stats.connected.fetch_sub(1, Ordering::Relaxed);
        });
    }

    info!("server stopped accepting connections");
    Ok(())
}

/// A server running on the current Tokio runtime.
///
/// Used by the binary and by integration tests that need a live store.
pub struct ServerHandle {
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    /// Binds `addr` (use port 0 for an ephemeral port) with a fresh store.
    pub async fn start(addr: &str) -> std::io::Result<Self> {
        Self::start_with(addr, Arc::new(MemoryStore::new()), ServerConfig::default()).await
    }

    /// Binds `addr` serving an existing store, e.g. to simulate a restart.
    pub async fn start_with(addr: &str, store: Arc<MemoryStore>, config: ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let ctx = Arc::new(ServerContext::new(store, config));
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, Arc::clone(&ctx), rx));
        info!(%addr, "server listening");
        Ok(ServerHandle {
            addr,
            ctx,
            shutdown,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.ctx.store
    }

    pub fn stats(&self) -> &ServerStats {
        &self.ctx.stats
    }

    /// Stops accepting, drops every client socket, and waits for the
    /// listener to be released.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(addr = %self.addr, error = %err, "server loop failed"),
            Err(err) => warn!(addr = %self.addr, error = %err, "server task panicked"),
        }
        // Give client tasks a moment to observe the signal.
        tokio::task::yield_now().await;
    }
}

fn dispatch_command(args: &[Vec<u8>], ctx: &ServerContext, session: &mut Session) -> Vec<u8> {
    let cmd = args[0].to_ascii_uppercase();
    let store = ctx.store.as_ref();

    match cmd.as_slice() {
        b"AUTH" => return handle_auth(args, ctx, session),
        b"QUIT" => {
            session.quit = true;
            return resp_simple("OK");
        }
        b"PING" if session.authenticated => return handle_ping(args),
        _ => {}
    }
    if !session.authenticated {
        return b"-NOAUTH Authentication required.\r\n".to_vec();
    }

    match cmd.as_slice() {
        b"PING" => handle_ping(args),
        b"GET" => handle_get(args, store),
        b"SET" => handle_set(args, store),
        b"SETEX" => handle_setex(args, store),
        b"DEL" => handle_del(args, store),
        b"MGET" => handle_mget(args, store),
        b"EXISTS" => handle_exists(args, store),
        b"INCR" => handle_incr_by(args, store, 1, "INCR"),
        b"DECR" => handle_incr_by(args, store, -1, "DECR"),
        b"EXPIRE" => handle_expire(args, store),
        b"TTL" => handle_ttl(args, store),
        b"SELECT" => handle_select(args),
        b"FLUSHDB" | b"FLUSHALL" => {
            store.clear();
            resp_simple("OK")
        }
        b"INFO" => handle_info(ctx),
        _ => resp_error("unknown command"),
    }
}

fn handle_auth(args: &[Vec<u8>], ctx: &ServerContext, session: &mut Session) -> Vec<u8> {
    // AUTH password | AUTH username password
    let supplied = match args.len() {
        2 => &args[1],
        3 => &args[2],
        _ => return resp_error("wrong number of arguments for AUTH"),
    };
    match &ctx.config.password {
        None => resp_error("AUTH called without any password configured"),
        Some(expected) if expected.as_bytes() == supplied.as_slice() => {
            session.authenticated = true;
            resp_simple("OK")
        }
        Some(_) => {
            session.authenticated = false;
            b"-WRONGPASS invalid username-password pair\r\n".to_vec()
        }
    }
}

fn handle_ping(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        1 => resp_simple("PONG"),
        2 => resp_bulk(&args[1]),
        _ => resp_error("wrong number of arguments for PING"),
    }
}

fn handle_get(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for GET");
    }
    match store.get(&args[1]) {
        Some(value) => resp_bulk(&value),
        None => resp_null(),
    }
}

fn handle_set(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() == 3 {
        store.set(&args[1], &args[2]);
        return resp_simple("OK");
    }
    if args.len() == 5 && args[3].eq_ignore_ascii_case(b"EX") {
        let seconds = match parse_seconds(&args[4]) {
            Ok(value) => value,
            Err(resp) => return resp,
        };
        store.set_with_ttl(&args[1], &args[2], Duration::from_secs(seconds));
        return resp_simple("OK");
    }
    if args.len() < 3 {
        return resp_error("wrong number of arguments for SET");
    }
    resp_error("unsupported SET options")
}

fn handle_setex(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 4 {
        return resp_error("wrong number of arguments for SETEX");
    }
    let seconds = match parse_seconds(&args[2]) {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    store.set_with_ttl(&args[1], &args[3], Duration::from_secs(seconds));
    resp_simple("OK")
}

fn handle_del(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for DEL");
    }
    let removed = args[1..].iter().filter(|key| store.delete(key)).count();
    resp_integer(removed as i64)
}

fn handle_mget(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for MGET");
    }
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("*{}\r\n", args.len() - 1).as_bytes());
    for key in &args[1..] {
        match store.get(key) {
            Some(value) => buf.extend_from_slice(&resp_bulk(&value)),
            None => buf.extend_from_slice(&resp_null()),
        }
    }
    buf
}

fn handle_exists(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for EXISTS");
    }
    let found = args[1..].iter().filter(|key| store.exists(key)).count();
    resp_integer(found as i64)
}

fn handle_incr_by(args: &[Vec<u8>], store: &MemoryStore, delta: i64, name: &str) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error(&format!("wrong number of arguments for {name}"));
    }
    match store.incr_by(&args[1], delta) {
        Ok(value) => resp_integer(value),
        Err(err) => resp_error(&err.to_string()),
    }
}

fn handle_expire(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for EXPIRE");
    }
    let seconds = match parse_u64(&args[2]) {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    match store.expire(&args[1], Duration::from_secs(seconds)) {
        Ok(()) => resp_integer(1),
        Err(EngineError::NotFound) => resp_integer(0),
        Err(err) => resp_error(&err.to_string()),
    }
}

fn handle_ttl(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for TTL");
    }
    match store.ttl(&args[1]) {
        TtlStatus::Missing => resp_integer(-2),
        TtlStatus::NoExpiry => resp_integer(-1),
        // Round up so a fresh `EXPIRE k 10` reports 10, not 9.
        TtlStatus::ExpiresIn(remaining) => resp_integer(remaining.as_millis().div_ceil(1000) as i64),
    }
}

fn handle_select(args: &[Vec<u8>]) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for SELECT");
    }
    let index = std::str::from_utf8(&args[1])
        .ok()
        .and_then(|text| text.parse::<i64>().ok());
    match index {
        Some(index) if (0..DATABASES).contains(&index) => resp_simple("OK"),
        _ => resp_error("DB index is out of range"),
    }
}

fn handle_info(ctx: &ServerContext) -> Vec<u8> {
    let info = format!(
        "role:master\r\nengine:keeper\r\nconnected_clients:{}\r\ntotal_connections_received:{}\r\ntotal_commands_processed:{}\r\nkeys:{}\r\n",
        ctx.stats.connected(),
        ctx.stats.connections_total(),
        ctx.stats.commands_total(),
        ctx.store.len(),
    );
    resp_bulk(info.as_bytes())
}

fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"+");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 6);
    buf.extend_from_slice(b"-ERR ");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_integer(value: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b":");
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"$");
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

fn parse_u64(arg: &[u8]) -> Result<u64, Vec<u8>> {
    if arg.is_empty() {
        return Err(resp_error("invalid integer"));
    }
    let mut value: u64 = 0;
    for &b in arg {
        if !b.is_ascii_digit() {
            return Err(resp_error("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
    }
    Ok(value)
}

/// Like `parse_u64`, but rejects 0 the way `SET EX` and `SETEX` do.
fn parse_seconds(arg: &[u8]) -> Result<u64, Vec<u8>> {
    match parse_u64(arg)? {
        0 => Err(resp_error("invalid expire time")),
        seconds => Ok(seconds),
    }
}
