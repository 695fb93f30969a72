use std::time::Duration;

use keeper_client::{
    ConnectionPool, ConnectionState, PoolError, PoolEvent, PoolOptions, PoolSizing, RespValue,
    RetryPolicy, StoreError, StoreOptions,
};
use keeper_server::{MemoryStore, ServerConfig, ServerHandle};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn sizing(max: usize) -> PoolSizing {
    PoolSizing::default().with_min(0).with_max(max)
}

fn options_for(server: &ServerHandle, sizing: PoolSizing) -> PoolOptions {
    let addr = server.addr();
    PoolOptions::from_host_and_port(addr.ip().to_string(), addr.port()).with_sizing(sizing)
}

async fn start_pool(sizing: PoolSizing) -> (ServerHandle, ConnectionPool) {
    let server = ServerHandle::start("127.0.0.1:0").await.expect("start server");
    let pool = ConnectionPool::new(options_for(&server, sizing)).expect("pool");
    (server, pool)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    let count: usize = line.trim_end().trim_start_matches('*').parse().unwrap_or(0);
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await?;
        let len: usize = line.trim_end().trim_start_matches('$').parse().unwrap_or(0);
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        data.truncate(len);
        args.push(String::from_utf8_lossy(&data).into_owned());
    }
    Ok(args)
}

/// Store that answers `GET <key>` with `<key>-value`, taking 200ms for `slow`.
async fn slow_store() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                while let Ok(args) = read_command(&mut reader).await {
                    let reply = match args.first().map(String::as_str) {
                        Some("GET") => {
                            let key = args.get(1).cloned().unwrap_or_default();
                            if key == "slow" {
                                tokio::time::sleep(Duration::from_millis(200)).await;
                            }
                            let value = format!("{key}-value");
                            format!("${}\r\n{value}\r\n", value.len())
                        }
                        _ => "+OK\r\n".to_string(),
                    };
                    if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

#[tokio::test]
async fn reuses_released_connections() {
    let (_server, pool) = start_pool(sizing(1)).await;

    let first = pool.acquire().await.unwrap();
    let id = first.id();
    assert_eq!(first.state(), ConnectionState::Ready);
    drop(first);

    let status = pool.status();
    assert_eq!((status.size, status.available, status.borrowed), (1, 1, 0));

    let second = pool.acquire().await.unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(pool.status().borrowed, 1);
}

#[tokio::test]
async fn typed_commands_round_trip() {
    let (server, pool) = start_pool(sizing(2)).await;

    pool.set("alpha", "1").await.unwrap();
    assert_eq!(pool.get("alpha").await.unwrap().as_deref(), Some("1"));
    assert_eq!(pool.get("missing").await.unwrap(), None);

    pool.set_with_seconds("beta", "2", 30).await.unwrap();
    pool.setex("gamma", 30, "3").await.unwrap();
    assert!(server.store().ttl(b"beta") != keeper_server::TtlStatus::NoExpiry);

    assert_eq!(
        pool.mget(&["alpha", "missing", "gamma"]).await.unwrap(),
        vec![Some("1".to_string()), None, Some("3".to_string())]
    );
    assert_eq!(pool.exists(&["alpha", "beta", "missing"]).await.unwrap(), 2);
    assert_eq!(pool.del(&["alpha", "beta", "missing"]).await.unwrap(), 2);

    let mut conn = pool.acquire().await.unwrap();
    assert_eq!(conn.incr("n").await.unwrap(), 1);
    assert_eq!(conn.decr("n").await.unwrap(), 0);
    assert_eq!(conn.ping().await.unwrap(), "PONG");
}

#[tokio::test]
async fn server_errors_keep_the_connection() {
    let (_server, pool) = start_pool(sizing(1)).await;

    let mut conn = pool.acquire().await.unwrap();
    conn.set("text", "abc").await.unwrap();
    assert!(matches!(conn.incr("text").await, Err(StoreError::Server(_))));
    assert!(conn.is_healthy());
    assert_eq!(conn.get("text").await.unwrap().as_deref(), Some("abc"));
}

#[tokio::test]
async fn pipeline_replies_in_order() {
    let (_server, pool) = start_pool(sizing(1)).await;

    let commands: Vec<Vec<&str>> = vec![
        vec!["set", "testMulti", "5"],
        vec!["get", "testMulti"],
        vec!["incr", "testMulti"],
        vec!["decr", "testMulti"],
    ];
    let replies = pool.exec_commands(&commands).await.unwrap();
    assert_eq!(replies.len(), 4);
    assert_eq!(replies[0].as_ref().unwrap(), &RespValue::Simple(b"OK".to_vec()));
    assert_eq!(replies[1].as_ref().unwrap(), &RespValue::Bulk(Some(b"5".to_vec())));
    assert_eq!(replies[2].as_ref().unwrap(), &RespValue::Integer(6));
    assert_eq!(replies[3].as_ref().unwrap(), &RespValue::Integer(5));

    assert_eq!(pool.get("testMulti").await.unwrap().as_deref(), Some("5"));
}

#[tokio::test]
async fn pipeline_error_fails_only_its_slot() {
    let (_server, pool) = start_pool(sizing(1)).await;

    let commands: Vec<Vec<&str>> = vec![vec!["set", "word", "abc"], vec!["incr", "word"], vec!["get", "word"]];
    let replies = pool.exec_commands(&commands).await.unwrap();
    assert!(matches!(replies[1], Err(StoreError::Server(_))));
    assert_eq!(replies[2].as_ref().unwrap(), &RespValue::Bulk(Some(b"abc".to_vec())));
}

#[tokio::test]
async fn acquire_times_out_at_capacity() {
    let (_server, pool) = start_pool(sizing(2).with_acquire_timeout_millis(100)).await;

    let _a = pool.acquire().await.unwrap();
    let _b = pool.acquire().await.unwrap();
    assert_eq!(pool.status().spare_capacity(), 0);

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::AcquireTimeout(limit) if limit == Duration::from_millis(100)));
    assert_eq!(pool.status().pending, 0);
    assert_eq!(pool.status().size, 2);
}

#[tokio::test]
async fn queued_caller_gets_released_connection() {
    let (_server, pool) = start_pool(sizing(1).with_acquire_timeout_millis(0)).await;

    let held = pool.acquire().await.unwrap();
    let id = held.id();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });
    wait_until(|| pool.status().pending == 1).await;

    drop(held);
    assert_eq!(waiter.await.unwrap().unwrap(), id);
    assert_eq!(pool.status().size, 1);
}

#[tokio::test]
async fn full_queue_rejects_immediately() {
    let (_server, pool) = start_pool(sizing(1).with_acquire_timeout_millis(0).with_max_waiting_clients(1)).await;

    let held = pool.acquire().await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.is_ok() }
    });
    wait_until(|| pool.status().pending == 1).await;

    assert!(matches!(pool.acquire().await, Err(PoolError::QueueFull(1))));

    drop(held);
    assert!(waiter.await.unwrap());
}

#[tokio::test]
async fn lower_priority_value_is_served_first() {
    let (_server, pool) = start_pool(sizing(1).with_acquire_timeout_millis(0)).await;

    let held = pool.acquire().await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for (queued, priority) in [5u32, 1].into_iter().enumerate() {
        let waiter_pool = pool.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let conn = waiter_pool.acquire_with_priority(priority).await.unwrap();
            tx.send(priority).unwrap();
            drop(conn);
        });
        wait_until(|| pool.status().pending == queued + 1).await;
    }

    drop(held);
    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, Some(5));
}

#[tokio::test]
async fn execute_releases_on_error() {
    let (_server, pool) = start_pool(sizing(1)).await;

    let result: anyhow::Result<()> = pool
        .execute(|mut conn| async move {
            conn.set("k", "v").await?;
            Err::<(), _>(anyhow::anyhow!("work failed"))
        })
        .await;
    assert_eq!(result.unwrap_err().to_string(), "work failed");

    let status = pool.status();
    assert_eq!((status.borrowed, status.available), (0, 1));

    let value = pool
        .execute(|mut conn| async move { conn.get("k").await.map_err(PoolError::from) })
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("v"));
}

#[tokio::test]
async fn warms_up_minimum_connections() {
    let (_server, pool) = start_pool(sizing(4).with_min(2)).await;

    wait_until(|| pool.status().available == 2).await;
    assert_eq!(pool.status().size, 2);
}

#[tokio::test]
async fn unreachable_store_fails_creation() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let pool = ConnectionPool::new(
        PoolOptions::from_host_and_port("127.0.0.1", addr.port()).with_sizing(sizing(1)),
    )
    .unwrap();
    let mut events = pool.subscribe();

    assert!(matches!(pool.acquire().await, Err(PoolError::Connection(StoreError::Io(_)))));
    assert_eq!(pool.status().size, 0);
    assert!(drain(&mut events).iter().any(|event| event.name() == "error"));
}

#[tokio::test]
async fn rejects_unusable_sizing() {
    let options = PoolOptions::default().with_sizing(PoolSizing::default().with_min(5).with_max(2));
    assert!(matches!(ConnectionPool::new(options), Err(PoolError::InvalidConfig(_))));

    let options = PoolOptions::from_url("http://localhost:6379");
    assert!(matches!(ConnectionPool::new(options), Err(PoolError::Address(_))));
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let (_server, pool) = start_pool(sizing(1)).await;
    let mut events = pool.subscribe();

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();
    pool.destroy(conn).await;

    let names: Vec<_> = drain(&mut events).iter().map(PoolEvent::name).collect();
    assert_eq!(names, vec!["connect", "ready", "close", "disconnected"]);
    assert_eq!(pool.status().size, 0);

    let next = pool.acquire().await.unwrap();
    assert_ne!(next.id(), id);
}

#[tokio::test]
async fn end_waits_for_borrowed_connections() {
    let (_server, pool) = start_pool(sizing(2)).await;
    let mut events = pool.subscribe();

    let held = pool.acquire().await.unwrap();
    let ending = tokio::spawn({
        let pool = pool.clone();
        async move { pool.end().await }
    });
    wait_until(|| pool.is_closed()).await;

    assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!ending.is_finished());

    drop(held);
    ending.await.unwrap();

    assert_eq!(pool.status().size, 0);
    let names: Vec<_> = drain(&mut events).iter().map(PoolEvent::name).collect();
    assert_eq!(names.last(), Some(&"end"));
    assert!(names.contains(&"disconnected"));

    // A second end is a no-op.
    pool.end().await;
    assert_eq!(drain(&mut events).len(), 0);
}

#[tokio::test]
async fn broken_connection_is_destroyed_on_release() {
    let server = ServerHandle::start("127.0.0.1:0").await.unwrap();
    let options = options_for(&server, sizing(1))
        .with_store_options(StoreOptions::default().with_retry(RetryPolicy::never()));
    let pool = ConnectionPool::new(options).unwrap();

    let mut conn = pool.acquire().await.unwrap();
    conn.set("k", "v").await.unwrap();

    server.stop().await;
    assert!(conn.get("k").await.is_err());
    assert_eq!(conn.state(), ConnectionState::End);

    drop(conn);
    wait_until(|| pool.status().size == 0).await;
}

#[tokio::test]
async fn connection_recovers_after_restart() {
    let store = std::sync::Arc::new(MemoryStore::with_shard_count(2));
    let server = ServerHandle::start_with("127.0.0.1:0", store.clone(), ServerConfig::default())
        .await
        .unwrap();
    let addr = server.addr();
    let retry = RetryPolicy {
        step_millis: 20,
        max_delay_millis: 200,
        max_attempts: 10,
    };
    let options = options_for(&server, sizing(1))
        .with_store_options(StoreOptions::default().with_retry(retry));
    let pool = ConnectionPool::new(options).unwrap();
    let mut events = pool.subscribe();

    let mut conn = pool.acquire().await.unwrap();
    conn.set("k", "v").await.unwrap();

    server.stop().await;
    let _restarted = ServerHandle::start_with(&addr.to_string(), store, ServerConfig::default())
        .await
        .unwrap();

    // The command that hit the broken socket fails; it is not replayed.
    assert!(conn.get("k").await.is_err());
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(conn.get("k").await.unwrap().as_deref(), Some("v"));

    let names: Vec<_> = drain(&mut events).iter().map(PoolEvent::name).collect();
    assert!(names.contains(&"reconnecting"));
}

#[tokio::test]
async fn handshake_authenticates() {
    let config = ServerConfig {
        password: Some("secret".to_string()),
    };
    let server = ServerHandle::start_with("127.0.0.1:0", std::sync::Arc::new(MemoryStore::new()), config)
        .await
        .unwrap();

    let options = options_for(&server, sizing(1))
        .with_store_options(StoreOptions::default().with_password("secret").with_database(2));
    let pool = ConnectionPool::new(options).unwrap();
    pool.set("k", "v").await.unwrap();

    let addr = server.addr();
    let url = format!("redis://:wrong@{}:{}/0", addr.ip(), addr.port());
    let pool = ConnectionPool::new(PoolOptions::from_url(url).with_sizing(sizing(1))).unwrap();
    assert!(matches!(pool.get("k").await, Err(PoolError::Connection(StoreError::Server(_)))));
}

#[tokio::test]
async fn abandoned_command_does_not_leak_its_reply() {
    let addr = slow_store().await;
    let options = PoolOptions::from_host_and_port(addr.ip().to_string(), addr.port()).with_sizing(sizing(1));
    let pool = ConnectionPool::new(options).unwrap();

    let abandoned = tokio::time::timeout(Duration::from_millis(50), pool.get("slow")).await;
    assert!(abandoned.is_err());

    assert_eq!(pool.get("fast").await.unwrap().as_deref(), Some("fast-value"));
    assert_eq!(pool.get("other").await.unwrap().as_deref(), Some("other-value"));
    assert_eq!(pool.status().size, 1);
}

#[tokio::test]
async fn in_flight_connection_fails_validation() {
    let addr = slow_store().await;
    let options = PoolOptions::from_host_and_port(addr.ip().to_string(), addr.port()).with_sizing(sizing(1));
    let pool = ConnectionPool::new(options).unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let first = conn.id();
    assert!(tokio::time::timeout(Duration::from_millis(50), conn.get("slow")).await.is_err());
    assert!(conn.is_in_flight());
    assert!(!conn.is_healthy());
    drop(conn);

    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id(), first);
    assert!(conn.is_healthy());
}
