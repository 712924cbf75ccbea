use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use efa::{SimulatedFocuser, SimulatorConfig};
use focusd::communication::run_communication_layer;
use focusd::service::FocusService;
use focusd::worker::{FocusWorker, PollDelays};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

async fn start_daemon(control_ips: Vec<IpAddr>) -> (SocketAddr, SimulatedFocuser) {
    let sim = SimulatedFocuser::new(SimulatorConfig {
        initial_steps: 100,
        steps_per_second: 1_000_000,
        ..Default::default()
    });
    let opener = {
        let sim = sim.clone();
        Box::new(move || sim.open())
    };
    let worker = FocusWorker::spawn(
        PollDelays {
            idle: Duration::from_millis(20),
            moving: Duration::from_millis(10),
        },
        opener,
    );
    let service = Arc::new(FocusService::new(
        &worker,
        control_ips,
        Duration::from_secs(5),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = run_communication_layer(service, listener).await;
    });
    (addr, sim)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        let mut reply = String::new();
        self.reader.read_line(&mut reply).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string()).await
    }
}

#[tokio::test]
async fn a_whole_session_runs_over_one_socket() {
    let (addr, _sim) = start_daemon(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]).await;
    let mut client = Client::connect(addr).await;

    let report = client.call(json!({"method": "report_status"})).await;
    assert_eq!(report["status"], "disabled");

    let reply = client.call(json!({"method": "initialize"})).await;
    assert_eq!(reply["status"], "succeeded");

    let report = client.call(json!({"method": "report_status"})).await;
    assert_eq!(report["status"], "idle");
    assert_eq!(report["current_steps"], 100);
    assert_eq!(report["target_steps"], 100);

    let reply = client
        .call(json!({"method": "set_focus", "steps": 500}))
        .await;
    assert_eq!(reply["status"], "succeeded");
    let report = client.call(json!({"method": "report_status"})).await;
    assert_eq!(report["current_steps"], 500);

    let reply = client
        .call(json!({"method": "set_focus", "steps": -50, "offset": true}))
        .await;
    assert_eq!(reply["status"], "succeeded");
    let report = client.call(json!({"method": "report_status"})).await;
    assert_eq!(report["current_steps"], 450);

    let reply = client
        .call(json!({"method": "enable_fans", "enabled": true}))
        .await;
    assert_eq!(reply["status"], "succeeded");
    let report = client.call(json!({"method": "report_status"})).await;
    assert_eq!(report["fans_enabled"], true);

    let reply = client.call(json!({"method": "shutdown"})).await;
    assert_eq!(reply["status"], "succeeded");
    let report = client.call(json!({"method": "report_status"})).await;
    assert_eq!(report["status"], "disabled");
    assert!(report.get("current_steps").is_none());
}

#[tokio::test]
async fn mutating_requests_from_an_unlisted_host_are_refused() {
    let (addr, _sim) = start_daemon(vec![IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))]).await;
    let mut client = Client::connect(addr).await;

    let reply = client.call(json!({"method": "initialize"})).await;
    assert_eq!(reply["status"], "invalid_control_ip");

    // Status stays readable from anywhere.
    let report = client.call(json!({"method": "report_status"})).await;
    assert_eq!(report["status"], "disabled");
}

#[tokio::test]
async fn overlong_lines_are_rejected_and_the_connection_survives() {
    let (addr, _sim) = start_daemon(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]).await;
    let mut client = Client::connect(addr).await;

    let reply = client.send_raw(&"x".repeat(64 * 1024)).await;
    assert_eq!(reply["error"], "request too long");

    // The oversized line is discarded, not served or buffered.
    let report = client.call(json!({"method": "report_status"})).await;
    assert_eq!(report["status"], "disabled");
}

#[tokio::test]
async fn malformed_lines_get_an_error_reply_and_the_connection_survives() {
    let (addr, _sim) = start_daemon(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]).await;
    let mut client = Client::connect(addr).await;

    let reply = client.send_raw("this is not json").await;
    assert!(reply.get("error").is_some());

    let reply = client.send_raw(r#"{"method": "warp_drive"}"#).await;
    assert!(reply.get("error").is_some());

    // The same connection still serves valid requests.
    let report = client.call(json!({"method": "report_status"})).await;
    assert_eq!(report["status"], "disabled");
}
