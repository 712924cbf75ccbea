use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Take};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::models::CommandStatus;
use crate::service::FocusService;

/// Cap on one request line; anything longer is answered with an error and
/// discarded without ever being buffered whole.
const MAX_REQUEST_BYTES: u64 = 8 * 1024;

/// One request per line, JSON-encoded, answered with one JSON line.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
enum Request {
    Initialize,
    Shutdown,
    SetFocus {
        steps: i32,
        #[serde(default)]
        offset: bool,
    },
    ResetHomePosition,
    EnableFans {
        enabled: bool,
    },
    Stop,
    ReportStatus,
}

#[derive(Debug, Serialize)]
struct StatusReply {
    status: CommandStatus,
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    error: String,
}

pub async fn run_communication_layer(
    service: Arc<FocusService>,
    listener: TcpListener,
) -> Result<()> {
    loop {
        let (socket, peer) = listener
            .accept()
            .await
            .context("failed to accept a client connection")?;
        debug!("client connected from {}", peer);
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(service, socket, peer).await {
                debug!("connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn serve_connection(
    service: Arc<FocusService>,
    socket: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader).take(MAX_REQUEST_BYTES);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        reader.set_limit(MAX_REQUEST_BYTES);
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        if !buf.ends_with(b"\n") && reader.limit() == 0 {
            warn!("overlong request from {}, discarding it", peer);
            let reply = encode(&ErrorReply {
                error: "request too long".to_string(),
            });
            send_reply(&mut writer, &reply).await?;
            if !drain_line(&mut reader, &mut buf).await? {
                break;
            }
            continue;
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(line) {
            Ok(request) => handle_request(&service, request, peer).await,
            Err(e) => {
                warn!("bad request from {}: {}", peer, e);
                encode(&ErrorReply {
                    error: format!("bad request: {}", e),
                })
            }
        };
        send_reply(&mut writer, &reply).await?;
    }
    debug!("client {} disconnected", peer);
    Ok(())
}

/// Swallow the remainder of a line that blew the size limit. Returns false at
/// end of stream.
async fn drain_line(
    reader: &mut Take<BufReader<OwnedReadHalf>>,
    buf: &mut Vec<u8>,
) -> io::Result<bool> {
    loop {
        buf.clear();
        reader.set_limit(MAX_REQUEST_BYTES);
        if reader.read_until(b'\n', buf).await? == 0 {
            return Ok(false);
        }
        if buf.ends_with(b"\n") {
            return Ok(true);
        }
    }
}

async fn send_reply(writer: &mut OwnedWriteHalf, reply: &str) -> io::Result<()> {
    writer.write_all(reply.as_bytes()).await?;
    writer.write_all(b"\n").await
}

async fn handle_request(service: &FocusService, request: Request, peer: SocketAddr) -> String {
    let origin = peer.ip();
    match request {
        Request::ReportStatus => encode(&service.report_status()),
        Request::Initialize => status_reply(service.initialize(origin).await),
        Request::Shutdown => status_reply(service.shutdown(origin).await),
        Request::SetFocus { steps, offset } => {
            status_reply(service.set_focus(origin, steps, offset).await)
        }
        Request::ResetHomePosition => status_reply(service.reset_home_position(origin).await),
        Request::EnableFans { enabled } => status_reply(service.enable_fans(origin, enabled).await),
        Request::Stop => status_reply(service.stop(origin).await),
    }
}

fn status_reply(status: CommandStatus) -> String {
    encode(&StatusReply { status })
}

fn encode<T: Serialize>(reply: &T) -> String {
    serde_json::to_string(reply).unwrap_or_else(|e| {
        warn!("failed to encode a reply: {}", e);
        r#"{"error":"internal error"}"#.to_string()
    })
}
