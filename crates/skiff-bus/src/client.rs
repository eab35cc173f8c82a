//! Guest-side bus client.
//!
//! Used by the in-guest agent to reach the node's internal bus over the
//! private interface. Connection establishment retries while the guest
//! network comes up.

use crate::error::{BusError, Result};
use crate::message::Message;
use crate::wire::{decode_payload, encode_payload, Frame};
use parking_lot::Mutex;
use skiff_common::VmId;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Total time to keep retrying the initial connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between connection retry attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline for object fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct ClientShared {
    subs: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    pending_gets: Mutex<VecDeque<oneshot::Sender<Option<Vec<u8>>>>>,
}

/// Credentialed guest connection to the node's internal bus.
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct GuestClient {
    vm_id: VmId,
    writer: Arc<tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>>,
    shared: Arc<ClientShared>,
    next_sid: Arc<AtomicU64>,
}

/// A guest-side subscription: a stream of matching messages.
pub struct GuestSubscription {
    sid: u64,
    receiver: mpsc::UnboundedReceiver<Message>,
    client: GuestClient,
}

impl GuestSubscription {
    /// Receive the next message, or `None` once the connection closes.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Remove the subscription on both ends.
    pub async fn unsubscribe(self) -> Result<()> {
        self.client.shared.subs.lock().remove(&self.sid);
        self.client.send_frame(&Frame::Unsub { sid: self.sid }).await
    }
}

impl GuestClient {
    /// Connect and authenticate with the node's bus.
    ///
    /// The connection is retried for up to ten seconds while the guest
    /// boots and the private interface comes up. Authentication failures
    /// abort immediately.
    pub async fn connect(url: &str, vm_id: VmId, seed: &str) -> Result<Self> {
        let addr = url.strip_prefix("tcp://").unwrap_or(url).to_string();
        let start = std::time::Instant::now();
        tracing::debug!(addr = %addr, vm_id = %vm_id, "Connecting to internal bus");

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match Self::try_connect(&addr, vm_id, seed).await {
                Ok(client) => {
                    tracing::info!(
                        addr = %addr,
                        vm_id = %vm_id,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "Connected to internal bus"
                    );
                    return Ok(client);
                }
                Err(e @ BusError::Unauthorized(_)) => return Err(e),
                Err(e) => {
                    if start.elapsed() >= CONNECT_TIMEOUT {
                        tracing::warn!(
                            addr = %addr,
                            attempts,
                            error = %e,
                            "Bus connection timed out"
                        );
                        return Err(BusError::TimedOut {
                            subject: addr,
                            timeout: CONNECT_TIMEOUT,
                        });
                    }
                    tracing::trace!(error = %e, attempt = attempts, "Connection attempt failed, retrying");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn try_connect(addr: &str, vm_id: VmId, seed: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BusError::Transport(format!("connect failed: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let connect = serde_json::to_string(&Frame::Connect {
            vm_id,
            seed: seed.to_string(),
        })?;
        writer.write_all(connect.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        match serde_json::from_str::<Frame>(line.trim()) {
            Ok(Frame::Info { .. }) => {}
            Ok(Frame::Err { message }) => return Err(BusError::Unauthorized(message)),
            Ok(other) => {
                return Err(BusError::Transport(format!(
                    "unexpected frame during connect: {other:?}"
                )))
            }
            Err(e) => return Err(BusError::Transport(format!("connect reply: {e}"))),
        }

        let shared = Arc::new(ClientShared::default());
        let read_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            read_loop(reader, read_shared).await;
        });

        Ok(Self {
            vm_id,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            shared,
            next_sid: Arc::new(AtomicU64::new(1)),
        })
    }

    /// This connection's VM identity.
    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// Subscribe to a subject within this VM's scope.
    pub async fn subscribe(&self, subject: &str) -> Result<GuestSubscription> {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subs.lock().insert(sid, tx);
        self.send_frame(&Frame::Sub {
            sid,
            subject: subject.to_string(),
        })
        .await?;
        Ok(GuestSubscription {
            sid,
            receiver: rx,
            client: self.clone(),
        })
    }

    /// Fire-and-forget publish.
    pub async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.send_frame(&Frame::Pub {
            subject: subject.to_string(),
            reply: None,
            headers: HashMap::new(),
            payload: encode_payload(payload),
        })
        .await
    }

    /// Reply to a request message. No-op when the message carries no
    /// reply subject.
    pub async fn respond(&self, msg: &Message, payload: &[u8]) -> Result<()> {
        if let Some(reply) = &msg.reply {
            self.send_frame(&Frame::Pub {
                subject: reply.clone(),
                reply: None,
                headers: HashMap::new(),
                payload: encode_payload(payload),
            })
            .await?;
        }
        Ok(())
    }

    /// Single-reply request with a deadline.
    pub async fn request(
        &self,
        subject: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message> {
        let inbox = format!(
            "{}{}.{}",
            crate::INBOX_PREFIX,
            self.vm_id,
            Uuid::new_v4().simple()
        );
        let mut sub = self.subscribe(&inbox).await?;
        self.send_frame(&Frame::Pub {
            subject: subject.to_string(),
            reply: Some(inbox),
            headers: HashMap::new(),
            payload: encode_payload(payload),
        })
        .await?;

        let outcome = tokio::time::timeout(timeout, sub.next()).await;
        let _ = sub.unsubscribe().await;
        match outcome {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(BusError::Transport("connection closed".to_string())),
            Err(_) => Err(BusError::TimedOut {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }

    /// Pull an object from the node's store.
    pub async fn fetch_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending_gets.lock().push_back(tx);
        self.send_frame(&Frame::Get {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
        .await?;

        match tokio::time::timeout(FETCH_TIMEOUT, rx).await {
            Ok(Ok(Some(bytes))) => Ok(bytes),
            Ok(Ok(None)) => Err(BusError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Ok(Err(_)) => Err(BusError::Transport("connection closed".to_string())),
            Err(_) => Err(BusError::TimedOut {
                subject: format!("{bucket}/{key}"),
                timeout: FETCH_TIMEOUT,
            }),
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_loop(mut reader: BufReader<OwnedReadHalf>, shared: Arc<ClientShared>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<Frame>(trimmed) {
            Ok(Frame::Msg {
                sid,
                subject,
                reply,
                headers,
                payload,
            }) => {
                let Some(payload) = decode_payload(&payload) else {
                    tracing::warn!(subject = %subject, "Dropping message with bad payload encoding");
                    continue;
                };
                let tx = shared.subs.lock().get(&sid).cloned();
                if let Some(tx) = tx {
                    let _ = tx.send(Message {
                        subject,
                        reply,
                        headers,
                        payload,
                    });
                }
            }
            Ok(Frame::Obj { found, payload }) => {
                let pending = shared.pending_gets.lock().pop_front();
                if let Some(tx) = pending {
                    let value = if found { decode_payload(&payload) } else { None };
                    let _ = tx.send(value);
                }
            }
            Ok(Frame::Err { message }) => {
                tracing::warn!(message = %message, "Error frame from bus");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable frame from bus");
            }
        }
    }

    // Connection closed: wake up anything still waiting.
    shared.subs.lock().clear();
    shared.pending_gets.lock().clear();
}
