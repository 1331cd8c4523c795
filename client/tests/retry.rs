//! Bounded retry against a misbehaving server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use httptun_client::{ClientError, CloseReason, RetryConfig, TunnelConnector, TunnelUrl};
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Counters {
    opens: Arc<AtomicU32>,
    reads: Arc<AtomicU32>,
    writes: Arc<AtomicU32>,
    deletes: Arc<AtomicU32>,
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        base_delay_ms: 0,
        max_delay_ms: 0,
        ..RetryConfig::default()
    }
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr
}

fn connector(addr: SocketAddr) -> TunnelConnector {
    connector_with(addr, fast_retry())
}

fn connector_with(addr: SocketAddr, retry: RetryConfig) -> TunnelConnector {
    TunnelConnector::new(
        TunnelUrl::parse(&format!("http://{addr}")).unwrap(),
        "token".into(),
        None,
        retry,
    )
    .unwrap()
}

/// Long-poll that never answers.
async fn silent_read() -> StatusCode {
    std::future::pending().await
}

async fn failing_write(State(c): State<Counters>) -> StatusCode {
    c.writes.fetch_add(1, Ordering::SeqCst);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn wait_for(counter: &AtomicU32, at_least: u32) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter.load(Ordering::SeqCst) < at_least {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

async fn descriptor(State(counters): State<Counters>) -> (StatusCode, Json<serde_json::Value>) {
    counters.opens.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::CREATED,
        Json(json!({
            "id": "abc",
            "path": "/tunnels/abc",
            "path_in": "/tunnels/abc/in",
            "path_out": "/tunnels/abc/out",
        })),
    )
}

#[tokio::test]
async fn open_gives_up_after_max_retries() {
    let counters = Counters::default();
    let app = Router::new()
        .route(
            "/tunnels",
            post(|State(c): State<Counters>| async move {
                c.opens.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }),
        )
        .with_state(counters.clone());
    let addr = serve(app).await;

    let err = connector(addr).open().await.err().unwrap();
    assert!(matches!(
        err,
        ClientError::RetriesExhausted {
            op: "open",
            attempts: 10
        }
    ));
    assert_eq!(counters.opens.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn read_failures_close_the_tunnel_after_max_retries() {
    let counters = Counters::default();
    let app = Router::new()
        .route("/tunnels", post(descriptor))
        .route(
            "/tunnels/abc/out/{seq}",
            get(|State(c): State<Counters>| async move {
                c.reads.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }),
        )
        .with_state(counters.clone());
    let addr = serve(app).await;

    let mut tunnel = connector(addr).open().await.unwrap();
    let closed = tunnel.close_signal();
    let received = tokio::time::timeout(Duration::from_secs(5), tunnel.receive())
        .await
        .unwrap();
    assert!(received.is_none());
    assert_eq!(
        *closed.borrow(),
        Some(CloseReason::RetriesExhausted { op: "read" })
    );
    assert_eq!(counters.reads.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn gone_closes_the_tunnel_without_retrying() {
    let counters = Counters::default();
    let app = Router::new()
        .route("/tunnels", post(descriptor))
        .route(
            "/tunnels/abc/out/{seq}",
            get(|State(c): State<Counters>| async move {
                c.reads.fetch_add(1, Ordering::SeqCst);
                StatusCode::GONE
            }),
        )
        .with_state(counters.clone());
    let addr = serve(app).await;

    let mut tunnel = connector(addr).open().await.unwrap();
    let closed = tunnel.close_signal();
    let received = tokio::time::timeout(Duration::from_secs(5), tunnel.receive())
        .await
        .unwrap();
    assert!(received.is_none());
    assert_eq!(*closed.borrow(), Some(CloseReason::Remote));
    assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
    assert_eq!(counters.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_interrupts_retry_backoff() {
    let counters = Counters::default();
    let app = Router::new()
        .route("/tunnels", post(descriptor))
        .route(
            "/tunnels/abc",
            delete(|State(c): State<Counters>| async move {
                c.deletes.fetch_add(1, Ordering::SeqCst);
                StatusCode::NO_CONTENT
            }),
        )
        .route(
            "/tunnels/abc/out/{seq}",
            get(|State(c): State<Counters>| async move {
                c.reads.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }),
        )
        .route("/tunnels/abc/in/{seq}", put(failing_write))
        .with_state(counters.clone());
    let addr = serve(app).await;

    let slow = RetryConfig {
        base_delay_ms: 60_000,
        max_delay_ms: 60_000,
        ..RetryConfig::default()
    };
    let tunnel = connector_with(addr, slow).open().await.unwrap();
    let closed = tunnel.close_signal();
    tunnel.send(Bytes::from_static(b"data")).await.unwrap();

    // both tasks have failed once and are now sleeping a full minute
    wait_for(&counters.reads, 1).await;
    wait_for(&counters.writes, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(1), tunnel.close())
        .await
        .expect("close must not wait out the backoff");
    assert_eq!(*closed.borrow(), Some(CloseReason::Local));
    assert_eq!(counters.reads.load(Ordering::SeqCst), 1);
    assert_eq!(counters.writes.load(Ordering::SeqCst), 1);
    assert_eq!(counters.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gone_on_write_closes_the_tunnel_without_retrying() {
    let counters = Counters::default();
    let app = Router::new()
        .route("/tunnels", post(descriptor))
        .route("/tunnels/abc/out/{seq}", get(silent_read))
        .route(
            "/tunnels/abc/in/{seq}",
            put(|State(c): State<Counters>| async move {
                c.writes.fetch_add(1, Ordering::SeqCst);
                StatusCode::GONE
            }),
        )
        .with_state(counters.clone());
    let addr = serve(app).await;

    let mut tunnel = connector(addr).open().await.unwrap();
    let mut closed = tunnel.close_signal();
    tunnel.send(Bytes::from_static(b"data")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), closed.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*closed.borrow(), Some(CloseReason::Remote));
    // the reader is stopped too
    let received = tokio::time::timeout(Duration::from_secs(5), tunnel.receive())
        .await
        .unwrap();
    assert!(received.is_none());
    assert_eq!(counters.writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn write_failures_close_the_tunnel_after_max_retries() {
    let counters = Counters::default();
    let app = Router::new()
        .route("/tunnels", post(descriptor))
        .route("/tunnels/abc/out/{seq}", get(silent_read))
        .route("/tunnels/abc/in/{seq}", put(failing_write))
        .with_state(counters.clone());
    let addr = serve(app).await;

    let tunnel = connector(addr).open().await.unwrap();
    let mut closed = tunnel.close_signal();
    tunnel.send(Bytes::from_static(b"data")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), closed.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        *closed.borrow(),
        Some(CloseReason::RetriesExhausted { op: "write" })
    );
    assert_eq!(counters.writes.load(Ordering::SeqCst), 10);
}
