//! End-to-end tests for the hub over real TCP sockets.
//!
//! These tests validate:
//! - Client requests reach a worker and the response comes back
//! - A worker that disconnects mid-job yields a 502 instead of a hang
//! - Persistent length-prefixed workers serve several jobs on one link
//! - The worker agent forwards through its balancer to local backends

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prometheus_tunnel::builders::build_hub;
use prometheus_tunnel::config::{AgentConfig, FramingConfig, HubConfig, WorkerMode};
use prometheus_tunnel::core::ConnectionBridge;
use prometheus_tunnel::infra::framing::DEFAULT_MAX_FRAME_BYTES;
use prometheus_tunnel::infra::Framing;
use prometheus_tunnel::runtime::{self, WorkerAgent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningHub {
    client: SocketAddr,
    worker: SocketAddr,
    bridge: Arc<ConnectionBridge>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningHub {
    async fn start(cfg: HubConfig) -> Self {
        let hub = build_hub(&cfg).await.unwrap();
        let client = hub.client_addr().unwrap();
        let worker = hub.worker_addr().unwrap();
        let bridge = Arc::clone(hub.bridge());
        let (stop, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            hub.run_until(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });
        Self {
            client,
            worker,
            bridge,
            stop,
            handle,
        }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap();
    }
}

fn local_config() -> HubConfig {
    HubConfig {
        bind_host: "127.0.0.1".into(),
        main_port: 0,
        worker_port: 0,
        ..HubConfig::default()
    }
}

fn http() -> Framing {
    Framing::from_config(FramingConfig::Http, DEFAULT_MAX_FRAME_BYTES)
}

fn length_prefixed() -> Framing {
    Framing::from_config(FramingConfig::LengthPrefixed, DEFAULT_MAX_FRAME_BYTES)
}

fn http_response(body: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    ))
}

fn first_line(frame: &[u8]) -> String {
    String::from_utf8_lossy(frame)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = BufReader::new(TcpStream::connect(addr).await.unwrap());
    let request = format!("GET {path} HTTP/1.1\r\nHost: tunnel.test\r\n\r\n");
    http().write_frame(&mut stream, request.as_bytes()).await.unwrap();
    let response = tokio::time::timeout(TEST_TIMEOUT, http().read_frame(&mut stream))
        .await
        .expect("client must get an answer")
        .unwrap()
        .expect("response frame");
    String::from_utf8(response.to_vec()).unwrap()
}

/// Local HTTP backend answering `<name> <request line>` on each connection.
async fn spawn_backend(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut stream = BufReader::new(stream);
                if let Ok(Some(request)) = http().read_frame(&mut stream).await {
                    let body = format!("{name} {}", first_line(&request));
                    let _ = http().write_frame(&mut stream, &http_response(&body)).await;
                }
            });
        }
    });
    addr
}

// ============================================================================
// RAW WORKERS
// ============================================================================

#[tokio::test]
async fn test_client_request_round_trips_through_worker() {
    let hub = RunningHub::start(local_config()).await;

    let worker = tokio::spawn({
        let addr = hub.worker;
        async move {
            let mut link = BufReader::new(TcpStream::connect(addr).await.unwrap());
            let request = http().read_frame(&mut link).await.unwrap().unwrap();
            let body = format!("echo {}", first_line(&request));
            http().write_frame(&mut link, &http_response(&body)).await.unwrap();
            // Once mode: the hub closes the link after one job.
            let mut rest = Vec::new();
            link.read_until(b'\n', &mut rest).await.unwrap();
            rest.is_empty()
        }
    });

    let response = http_get(hub.client, "/hello").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("echo GET /hello HTTP/1.1"));
    assert!(worker.await.unwrap(), "hub should close a once-mode link");

    let stats = runtime::hub_snapshot(&hub.bridge).rendezvous;
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.resolved, 1);
    hub.stop().await;
}

#[tokio::test]
async fn test_worker_disconnect_mid_job_returns_502() {
    let hub = RunningHub::start(local_config()).await;

    let worker = tokio::spawn({
        let addr = hub.worker;
        async move {
            let mut link = BufReader::new(TcpStream::connect(addr).await.unwrap());
            let mut line = Vec::new();
            link.read_until(b'\n', &mut line).await.unwrap();
            // Drop the link without answering.
        }
    });

    let response = http_get(hub.client, "/lost").await;
    assert!(response.starts_with("HTTP/1.1 502"), "got {response}");
    worker.await.unwrap();

    let health = runtime::health(&hub.bridge);
    assert!(health.ok);
    assert_eq!(health.pending_jobs, 0);
    assert_eq!(runtime::hub_snapshot(&hub.bridge).rendezvous.failed, 1);
    hub.stop().await;
}

#[tokio::test]
async fn test_client_timeout_returns_504_without_workers() {
    let hub = RunningHub::start(HubConfig {
        client_timeout_secs: Some(1),
        ..local_config()
    })
    .await;

    let response = http_get(hub.client, "/nobody").await;
    assert!(response.starts_with("HTTP/1.1 504"), "got {response}");
    hub.stop().await;
}

#[tokio::test]
async fn test_persistent_length_prefixed_worker_serves_many_jobs() {
    let hub = RunningHub::start(HubConfig {
        client_framing: FramingConfig::LengthPrefixed,
        worker_framing: FramingConfig::LengthPrefixed,
        worker_mode: WorkerMode::Persistent,
        ..local_config()
    })
    .await;

    let worker = tokio::spawn({
        let addr = hub.worker;
        async move {
            let mut link = BufReader::new(TcpStream::connect(addr).await.unwrap());
            let mut served = 0;
            while let Ok(Some(request)) = length_prefixed().read_frame(&mut link).await {
                let mut reply = b"ack:".to_vec();
                reply.extend_from_slice(&request);
                length_prefixed().write_frame(&mut link, &reply).await.unwrap();
                served += 1;
                if served == 3 {
                    break;
                }
            }
            served
        }
    });

    let mut client = BufReader::new(TcpStream::connect(hub.client).await.unwrap());
    for i in 0..3 {
        let payload = format!("job-{i}");
        length_prefixed()
            .write_frame(&mut client, payload.as_bytes())
            .await
            .unwrap();
        let reply = tokio::time::timeout(TEST_TIMEOUT, length_prefixed().read_frame(&mut client))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Bytes::from(format!("ack:job-{i}")));
    }
    client.get_mut().shutdown().await.unwrap();

    assert_eq!(worker.await.unwrap(), 3);
    hub.stop().await;
}

// ============================================================================
// WORKER AGENT
// ============================================================================

#[tokio::test]
async fn test_agent_balances_across_backends() {
    let hub = RunningHub::start(local_config()).await;
    let a = spawn_backend("alpha").await;
    let b = spawn_backend("beta").await;

    let mut cfg = AgentConfig::new(hub.worker, vec![a, b]);
    cfg.connections = 2;
    cfg.reconnect_delay_ms = 10;
    let agent = Arc::new(WorkerAgent::new(cfg).unwrap());
    let (stop_agent, rx) = oneshot::channel::<()>();
    let agent_task = tokio::spawn(Arc::clone(&agent).run_until(async {
        let _ = rx.await;
    }));

    let mut served_by: HashMap<String, usize> = HashMap::new();
    for i in 0..4 {
        let response = http_get(hub.client, &format!("/item/{i}")).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "got {response}");
        assert!(response.ends_with(&format!("GET /item/{i} HTTP/1.1")));
        let backend = response.rsplit("\r\n\r\n").next().unwrap();
        let name = backend.split(' ').next().unwrap().to_string();
        *served_by.entry(name).or_default() += 1;
    }
    assert_eq!(served_by.get("alpha"), Some(&2));
    assert_eq!(served_by.get("beta"), Some(&2));

    let snapshot = agent.snapshot();
    assert_eq!(snapshot.forwarded, 4);
    assert_eq!(snapshot.failed, 0);
    assert_eq!(snapshot.backends.total_usage(), 0);

    let _ = stop_agent.send(());
    agent_task.await.unwrap();
    hub.stop().await;
}

#[tokio::test]
async fn test_agent_reports_dead_backend_as_502() {
    let hub = RunningHub::start(local_config()).await;

    // Reserve a port and close it so connections are refused.
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let mut cfg = AgentConfig::new(hub.worker, vec![dead]);
    cfg.connections = 1;
    cfg.reconnect_delay_ms = 10;
    let agent = Arc::new(WorkerAgent::new(cfg).unwrap());
    let (stop_agent, rx) = oneshot::channel::<()>();
    let agent_task = tokio::spawn(Arc::clone(&agent).run_until(async {
        let _ = rx.await;
    }));

    let response = http_get(hub.client, "/down").await;
    assert!(response.starts_with("HTTP/1.1 502"), "got {response}");
    assert_eq!(agent.snapshot().failed, 1);

    let _ = stop_agent.send(());
    agent_task.await.unwrap();
    hub.stop().await;
}
