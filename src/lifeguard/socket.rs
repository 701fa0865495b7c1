//! Lifeguard Unix-domain socket listener.
//!
//! Caller credentials are read from `SO_PEERCRED` via
//! `UnixStream::peer_cred`, a kernel-verified source -- a client cannot
//! lie about its own uid the way it could in a request field.

use super::proto::{LifeguardRequest, LifeguardResponse};
use crate::bus::{Bus, Message};
use crate::config::DsmeConfig;
use crate::error::{DsmeError, DsmeResult};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{instrument, warn};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[instrument(skip(cfg, bus))]
pub async fn run(cfg: &DsmeConfig, bus: &Bus) -> DsmeResult<()> {
    let path = Path::new(&cfg.lifeguard_socket_path);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::remove_file(path);

    let listener = UnixListener::bind(path).map_err(|e| DsmeError::SocketBind {
        path: cfg.lifeguard_socket_path.clone(),
        source: e,
    })?;

    loop {
        let (stream, _) = listener.accept().await.map_err(|e| DsmeError::SocketBind {
            path: cfg.lifeguard_socket_path.clone(),
            source: e,
        })?;
        let bus = bus.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &bus).await {
                warn!(error = %e, "lifeguard connection ended with error");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, bus: &Bus) -> DsmeResult<()> {
    let caller_uid = stream
        .peer_cred()
        .map(|c| c.uid())
        .map_err(|e| DsmeError::ClientProtocol(format!("peer_cred failed: {e}")))?;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| DsmeError::ClientProtocol(e.to_string()))?;
        if n == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: LifeguardRequest = serde_json::from_str(trimmed)
            .map_err(|e| DsmeError::ClientProtocol(format!("bad request: {e}")))?;

        let response = dispatch(request, caller_uid, bus).await;
        let mut out = serde_json::to_string(&response).map_err(|e| DsmeError::ClientProtocol(e.to_string()))?;
        out.push('\n');
        write_half
            .write_all(out.as_bytes())
            .await
            .map_err(|e| DsmeError::ClientProtocol(e.to_string()))?;
    }
}

async fn dispatch(request: LifeguardRequest, caller_uid: u32, bus: &Bus) -> LifeguardResponse {
    let mut rx = bus.subscribe();

    match request {
        LifeguardRequest::ProcessStart { command, action, uid, gid, nice, restart_limit, restart_period_secs } => {
            bus.publish(Message::ProcessStart { command, action, uid, gid, nice, restart_limit, restart_period_secs, caller_uid });
            wait_for(&mut rx, |m| match m {
                Message::ProcessStartStatus { pid, status } => Some(LifeguardResponse::StartStatus { pid: *pid, status: *status }),
                _ => None,
            })
            .await
            .unwrap_or(LifeguardResponse::StartStatus { pid: None, status: -1 })
        }
        LifeguardRequest::ProcessStop { command, signal } => {
            bus.publish(Message::ProcessStop { command, signal, caller_uid });
            wait_for(&mut rx, |m| match m {
                Message::ProcessStopStatus { killed, info } => Some(LifeguardResponse::StopStatus { killed: *killed, info: info.clone() }),
                _ => None,
            })
            .await
            .unwrap_or(LifeguardResponse::StopStatus { killed: false, info: "timed out waiting for response".to_string() })
        }
    }
}

async fn wait_for<F>(rx: &mut tokio::sync::broadcast::Receiver<Message>, matcher: F) -> Option<LifeguardResponse>
where
    F: Fn(&Message) -> Option<LifeguardResponse>,
{
    tokio::time::timeout(REPLY_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if let Some(resp) = matcher(&msg) {
                        return resp;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return LifeguardResponse::StartStatus { pid: None, status: -1 };
                }
            }
        }
    })
    .await
    .ok()
}
