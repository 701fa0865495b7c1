//! IPHB server: a Unix-domain socket coalescing
//! wakeup service. The pure scheduling math lives in [`client`]; this
//! module wires it to a real `UnixListener` and the kernel heartbeat
//! character device, using the same `tokio::select!`-over-channels-
//! and-sockets structure as the rest of this crate's socket servers.

pub mod client;
pub mod proto;

pub use client::{ClientTable, IphbClient};
pub use proto::{IphbRequest, IphbStats, IphbWaitResponse};

use crate::bus::{Bus, Message};
use crate::config::DsmeConfig;
use crate::error::DsmeResult;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Optional kernel heartbeat character device handle. Held open while
/// there is at least one client; closed when the table is empty
///.
pub trait HeartbeatDevice: Send + Sync {
    fn arm(&mut self, period_secs: u64) -> DsmeResult<()>;
    fn close(&mut self);
}

/// No-op heartbeat device for environments without the kernel interface
/// (tests, desktop dev).
#[derive(Default)]
pub struct NullHeartbeatDevice;

impl HeartbeatDevice for NullHeartbeatDevice {
    fn arm(&mut self, _period_secs: u64) -> DsmeResult<()> {
        Ok(())
    }
    fn close(&mut self) {}
}

enum ClientEvent {
    Connected { id: u64, pid: u32, tx: mpsc::Sender<Vec<u8>> },
    Request { id: u64, request: IphbRequest },
    Disconnected { id: u64 },
}

/// Runs the IPHB server loop until the listener is dropped. Owns the
/// client table exclusively; it is never shared with another task.
pub struct IphbServer {
    table: ClientTable,
    heartbeat: Box<dyn HeartbeatDevice>,
    senders: std::collections::HashMap<u64, mpsc::Sender<Vec<u8>>>,
}

impl IphbServer {
    pub fn new(heartbeat: Box<dyn HeartbeatDevice>) -> Self {
        Self { table: ClientTable::new(), heartbeat, senders: std::collections::HashMap::new() }
    }

    #[instrument(skip(self, cfg, bus))]
    pub async fn run(&mut self, cfg: &DsmeConfig, bus: &Bus) -> DsmeResult<()> {
        let path = Path::new(&cfg.iphb_socket_path);
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let listener = UnixListener::bind(path).map_err(|e| crate::error::DsmeError::SocketBind {
            path: cfg.iphb_socket_path.clone(),
            source: e,
        })?;

        let (event_tx, mut event_rx) = mpsc::channel::<ClientEvent>(256);
        let mut sleep = Box::pin(tokio::time::sleep(std::time::Duration::from_secs(cfg.iphb_default_sleep_secs)));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    if let Ok((stream, _addr)) = accepted {
                        self.spawn_client(stream, event_tx.clone());
                    } else {
                        warn!("iphb accept failed");
                    }
                }
                Some(event) = event_rx.recv() => {
                    self.handle_event(event, cfg, bus);
                }
                _ = &mut sleep => {
                    bus.publish(Message::Wakeup);
                }
            }

            let woken = self.table.run_wake_passes(now_secs());
            for (id, waited_secs) in &woken {
                if let Some(tx) = self.senders.get(id) {
                    let resp = IphbWaitResponse { waited_secs: *waited_secs };
                    let _ = tx.try_send(resp.encode().to_vec());
                }
            }

            if self.table.is_empty() {
                self.heartbeat.close();
            } else {
                let _ = self.heartbeat.arm(cfg.iphb_default_sleep_secs);
            }

            let next = self.table.next_sleep(now_secs(), cfg.iphb_default_sleep_secs);
            sleep.as_mut().reset(tokio::time::Instant::now() + next);
        }
    }

    fn spawn_client(&mut self, stream: UnixStream, event_tx: mpsc::Sender<ClientEvent>) {
        let pid = stream.peer_cred().ok().and_then(|c| c.pid()).unwrap_or(0) as u32;
        let id = self.table.register(pid);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
        self.senders.insert(id, tx.clone());
        let _ = event_tx.try_send(ClientEvent::Connected { id, pid, tx });

        tokio::spawn(async move {
            let (mut read_half, mut write_half) = stream.into_split();
            let writer = tokio::spawn(async move {
                while let Some(buf) = rx.recv().await {
                    if write_half.write_all(&buf).await.is_err() {
                        break;
                    }
                }
            });

            let mut buf = [0u8; proto::WAIT_FRAME_LEN];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => match IphbRequest::decode(&buf[..n]) {
                        Ok(req) => {
                            if event_tx.send(ClientEvent::Request { id, request: req }).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    },
                    Err(_) => break,
                }
            }
            let _ = event_tx.send(ClientEvent::Disconnected { id }).await;
            writer.abort();
        });
    }

    fn handle_event(&mut self, event: ClientEvent, cfg: &DsmeConfig, bus: &Bus) {
        match event {
            ClientEvent::Connected { .. } => {}
            ClientEvent::Disconnected { id } => {
                self.table.remove(id);
                self.senders.remove(&id);
            }
            ClientEvent::Request { id, request } => match request {
                IphbRequest::Wait { mintime, maxtime, pid: _, wakeup: _ } => {
                    if client::is_misbehaving_window(mintime, maxtime, cfg.iphb_misbehaving_ratio) {
                        warn!(mintime, maxtime, "iphb client misbehaving window, accepting anyway");
                    }
                    if let Some(c) = self.table.get_mut(id) {
                        if mintime == 0 && maxtime == 0 {
                            if c.wait_started.is_none() {
                                // register/connect ack: nothing else to do
                            } else {
                                c.wait_started = None;
                            }
                        } else {
                            c.mintime = mintime;
                            c.maxtime = maxtime;
                            c.wait_started = Some(now_secs());
                        }
                    }
                }
                IphbRequest::Stat => {
                    if let Some(tx) = self.senders.get(&id) {
                        let stats = IphbStats {
                            clients: self.table.len() as u32,
                            waiting: self.table.waiting_count() as u32,
                            next_hb_secs: cfg.iphb_default_sleep_secs as u32,
                        };
                        let _ = tx.try_send(stats.encode().to_vec());
                    }
                }
            },
        }
        info!(clients = self.table.len(), "iphb client table updated");
        let _ = bus;
    }
}
