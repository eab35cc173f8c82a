//! The guest-facing TCP frontend of the bus.
//!
//! Each guest connection authenticates with its minted seed, then
//! exchanges newline-delimited JSON frames. Subject scope is enforced
//! per frame against the connection's `vm_id`.

use crate::broker::{BusHandle, Subscription};
use crate::error::{BusError, Result};
use crate::message::Message;
use crate::subject::{guest_may_publish, guest_may_subscribe};
use crate::wire::{decode_payload, encode_payload, Frame};
use skiff_common::VmId;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Listen address for the guest frontend.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Interface to bind; the private interface guests can reach.
    pub host: IpAddr,
    /// Port to bind; 0 selects an ephemeral port.
    pub port: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".parse().expect("valid address literal"),
            port: 0,
        }
    }
}

/// The running bus: in-process router plus the guest TCP frontend.
pub struct Bus {
    handle: BusHandle,
    client_url: String,
    local_addr: std::net::SocketAddr,
    shutdown: CancellationToken,
}

impl Bus {
    /// Bring up the bus.
    ///
    /// Returns the bus and its privileged in-process handle. The URL
    /// guests connect to is available from
    /// [`client_url`](Self::client_url). Bring-up failures are fatal to
    /// the node.
    pub async fn start(config: BusConfig) -> Result<(Bus, BusHandle)> {
        let listener = TcpListener::bind((config.host, config.port))
            .await
            .map_err(|e| BusError::BringUp(format!("bind {}:{}: {e}", config.host, config.port)))?;
        let local = listener
            .local_addr()
            .map_err(|e| BusError::BringUp(e.to_string()))?;

        let handle = BusHandle::new();
        let client_url = format!("tcp://{}:{}", local.ip(), local.port());
        let shutdown = CancellationToken::new();

        let accept_handle = handle.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "Guest connection accepted");
                            let handle = accept_handle.clone();
                            let shutdown = accept_shutdown.clone();
                            tokio::spawn(async move {
                                serve_connection(handle, stream, shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept guest connection");
                        }
                    }
                }
            }
            tracing::debug!("Bus accept loop exited");
        });

        tracing::info!(client_url = %client_url, "Internal bus started");
        Ok((
            Bus {
                handle: handle.clone(),
                client_url,
                local_addr: local,
                shutdown,
            },
            handle,
        ))
    }

    /// URL reachable from guests.
    pub fn client_url(&self) -> &str {
        &self.client_url
    }

    /// Port the frontend actually bound.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The privileged in-process connection.
    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    /// Stop accepting and tear down live guest connections.
    pub fn shutdown(&self) {
        tracing::info!("Internal bus shutting down");
        self.shutdown.cancel();
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve one authenticated guest connection until it closes, its
/// credentials are revoked, or the bus shuts down.
async fn serve_connection(handle: BusHandle, stream: TcpStream, shutdown: CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(write_frames(write_half, out_rx));

    // First frame must authenticate the connection.
    let vm_id = match authenticate(&handle, &mut reader, &out_tx).await {
        Some(vm_id) => vm_id,
        None => {
            drop(out_tx);
            let _ = writer_task.await;
            return;
        }
    };

    let cancel = CancellationToken::new();
    let conn_id = handle.register_connection(vm_id, cancel.clone());
    let _ = out_tx.send(Frame::Info { message: None });
    tracing::info!(vm_id = %vm_id, "Guest authenticated");

    let mut subs: HashMap<u64, Subscription> = HashMap::new();
    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(vm_id = %vm_id, "Guest connection revoked");
                break;
            }
            _ = shutdown.cancelled() => break,
            read = reader.read_line(&mut line) => match read {
                Ok(0) => {
                    tracing::debug!(vm_id = %vm_id, "Guest disconnected");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Frame>(trimmed) {
                        Ok(frame) => handle_frame(&handle, &vm_id, frame, &out_tx, &mut subs).await,
                        Err(e) => {
                            tracing::warn!(vm_id = %vm_id, error = %e, "Unparseable frame from guest");
                            let _ = out_tx.send(Frame::Err {
                                message: format!("parse error: {e}"),
                            });
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(vm_id = %vm_id, error = %e, "Guest read error");
                    break;
                }
            }
        }
    }

    for (_, sub) in subs.drain() {
        if let Err(e) = sub.drain().await {
            tracing::warn!(vm_id = %vm_id, error = %e, "Failed to drain guest subscription");
        }
    }
    handle.unregister_connection(&vm_id, conn_id);
    drop(out_tx);
    let _ = writer_task.await;
}

async fn authenticate(
    handle: &BusHandle,
    reader: &mut BufReader<OwnedReadHalf>,
    out_tx: &mpsc::UnboundedSender<Frame>,
) -> Option<VmId> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => return None,
        Ok(_) => {}
    }

    match serde_json::from_str::<Frame>(line.trim()) {
        Ok(Frame::Connect { vm_id, seed }) => {
            if handle.verify_credentials(&vm_id, &seed) {
                Some(vm_id)
            } else {
                tracing::warn!(vm_id = %vm_id, "Guest presented invalid credentials");
                let _ = out_tx.send(Frame::Err {
                    message: "authorization failed".to_string(),
                });
                None
            }
        }
        Ok(_) => {
            let _ = out_tx.send(Frame::Err {
                message: "expected connect".to_string(),
            });
            None
        }
        Err(e) => {
            let _ = out_tx.send(Frame::Err {
                message: format!("parse error: {e}"),
            });
            None
        }
    }
}

async fn handle_frame(
    handle: &BusHandle,
    vm_id: &VmId,
    frame: Frame,
    out_tx: &mpsc::UnboundedSender<Frame>,
    subs: &mut HashMap<u64, Subscription>,
) {
    match frame {
        Frame::Sub { sid, subject } => {
            if !guest_may_subscribe(vm_id, &subject) {
                tracing::warn!(vm_id = %vm_id, subject = %subject, "Guest subscribe denied");
                let _ = out_tx.send(Frame::Err {
                    message: format!("permission denied for subject {subject}"),
                });
                return;
            }
            let forward = out_tx.clone();
            let result = handle
                .subscribe(&subject, move |msg: Message| {
                    let forward = forward.clone();
                    Box::pin(async move {
                        let _ = forward.send(Frame::Msg {
                            sid,
                            subject: msg.subject,
                            reply: msg.reply,
                            headers: msg.headers,
                            payload: encode_payload(&msg.payload),
                        });
                    }) as crate::broker::HandlerFuture
                })
                .await;
            match result {
                Ok(sub) => {
                    subs.insert(sid, sub);
                    let _ = out_tx.send(Frame::Ok);
                }
                Err(e) => {
                    let _ = out_tx.send(Frame::Err {
                        message: e.to_string(),
                    });
                }
            }
        }
        Frame::Unsub { sid } => {
            if let Some(sub) = subs.remove(&sid) {
                if let Err(e) = sub.drain().await {
                    tracing::warn!(vm_id = %vm_id, sid, error = %e, "Unsub drain failed");
                }
            }
        }
        Frame::Pub {
            subject,
            reply,
            headers,
            payload,
        } => {
            if !guest_may_publish(vm_id, &subject) {
                tracing::warn!(vm_id = %vm_id, subject = %subject, "Guest publish denied");
                let _ = out_tx.send(Frame::Err {
                    message: format!("permission denied for subject {subject}"),
                });
                return;
            }
            let Some(payload) = decode_payload(&payload) else {
                let _ = out_tx.send(Frame::Err {
                    message: "invalid payload encoding".to_string(),
                });
                return;
            };
            let msg = Message {
                subject,
                reply,
                headers,
                payload,
            };
            if let Err(e) = handle.publish_message(msg).await {
                let _ = out_tx.send(Frame::Err {
                    message: e.to_string(),
                });
            }
        }
        Frame::Get { bucket, key } => {
            let frame = match handle.object_store().get(&bucket, &key) {
                Ok(bytes) => Frame::Obj {
                    found: true,
                    payload: encode_payload(&bytes),
                },
                Err(_) => Frame::Obj {
                    found: false,
                    payload: String::new(),
                },
            };
            let _ = out_tx.send(frame);
        }
        other => {
            tracing::warn!(vm_id = %vm_id, frame = ?other, "Unexpected frame from guest");
            let _ = out_tx.send(Frame::Err {
                message: "unexpected frame".to_string(),
            });
        }
    }
}

async fn write_frames(write_half: OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<Frame>) {
    let mut writer = BufWriter::new(write_half);
    while let Some(frame) = out_rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode frame");
                continue;
            }
        };
        if writer.write_all(json.as_bytes()).await.is_err() {
            break;
        }
        if writer.write_all(b"\n").await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}
