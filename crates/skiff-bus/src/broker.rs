//! Subject router, subscriptions, request/reply, and per-VM credentials.

use crate::error::{BusError, Result};
use crate::message::Message;
use crate::object_store::ObjectStore;
use crate::subject::{subject_matches, valid_subject};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use skiff_common::VmId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Quiescence window a drain waits for in-flight handlers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Future returned by a subscription handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Credentials minted for one VM.
///
/// The seed is embedded in the VM's boot metadata; a guest presenting it
/// is granted traffic only on subjects scoped to its `vm_id` plus the
/// handshake subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCredentials {
    /// Opaque user token for this VM.
    pub user_jwt: String,
    /// Connection seed the guest authenticates with.
    pub user_seed: String,
}

struct SubEntry {
    pattern: String,
    tx: mpsc::UnboundedSender<Message>,
}

pub(crate) struct BrokerInner {
    subscriptions: RwLock<HashMap<u64, SubEntry>>,
    inboxes: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    credentials: RwLock<HashMap<VmId, VmCredentials>>,
    connections: Mutex<HashMap<VmId, Vec<(u64, CancellationToken)>>>,
    store: ObjectStore,
    next_sid: AtomicU64,
}

impl BrokerInner {
    /// Route a message to every matching subscription and, for inbox
    /// subjects, the pending request waiting on it. Returns the number
    /// of deliveries.
    fn route(&self, msg: &Message) -> usize {
        let mut delivered = 0;

        if msg.subject.starts_with(crate::INBOX_PREFIX) {
            if let Some(tx) = self.inboxes.lock().remove(&msg.subject) {
                if tx.send(msg.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        let subs = self.subscriptions.read();
        for entry in subs.values() {
            if subject_matches(&entry.pattern, &msg.subject) && entry.tx.send(msg.clone()).is_ok() {
                delivered += 1;
            }
        }

        delivered
    }
}

/// A registered subscription.
///
/// Messages matching the pattern are dispatched to the handler on a
/// dedicated task, one at a time in arrival order. Dropping the
/// subscription unregisters it; [`drain`](Subscription::drain) also
/// waits for in-flight handler calls to finish.
pub struct Subscription {
    sid: u64,
    pattern: String,
    inner: Arc<BrokerInner>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// The pattern this subscription was registered with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Unregister and wait for in-flight handler callbacks to complete,
    /// bounded by the drain quiescence window.
    pub async fn drain(mut self) -> Result<()> {
        self.inner.subscriptions.write().remove(&self.sid);
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
                tracing::warn!(pattern = %self.pattern, "Subscription drain timed out");
                return Err(BusError::DrainTimedOut);
            }
        }
        tracing::debug!(pattern = %self.pattern, "Drained subscription");
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.subscriptions.write().remove(&self.sid);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Privileged in-process connection to the bus.
///
/// Cloning is cheap; all clones address the same router.
#[derive(Clone)]
pub struct BusHandle {
    inner: Arc<BrokerInner>,
}

impl Default for BusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl BusHandle {
    /// Create a standalone in-process bus with no guest frontend.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscriptions: RwLock::new(HashMap::new()),
                inboxes: Mutex::new(HashMap::new()),
                credentials: RwLock::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                store: ObjectStore::default(),
                next_sid: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler for every message matching `pattern`.
    pub async fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Message) -> HandlerFuture + Send + Sync + 'static,
    {
        if !valid_subject(pattern) {
            return Err(BusError::Transport(format!("invalid subject: {pattern}")));
        }

        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.inner.subscriptions.write().insert(
            sid,
            SubEntry {
                pattern: pattern.to_string(),
                tx,
            },
        );

        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handler(msg).await;
            }
        });

        tracing::debug!(pattern = %pattern, sid, "Subscribed");
        Ok(Subscription {
            sid,
            pattern: pattern.to_string(),
            inner: Arc::clone(&self.inner),
            task: Some(task),
        })
    }

    /// Fire-and-forget publish.
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.publish_message(Message::new(subject, payload)).await
    }

    /// Publish a fully-formed message (reply subject and headers included).
    pub async fn publish_message(&self, msg: Message) -> Result<()> {
        if !valid_subject(&msg.subject) {
            return Err(BusError::Transport(format!(
                "invalid subject: {}",
                msg.subject
            )));
        }
        let delivered = self.inner.route(&msg);
        tracing::trace!(subject = %msg.subject, delivered, "Published");
        Ok(())
    }

    /// Single-reply request with a caller-specified deadline.
    ///
    /// Fails immediately with [`BusError::NoResponders`] when nothing
    /// subscribes to the subject; request-level failures are never
    /// retried by the bus.
    pub async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message> {
        self.request_with_headers(subject, HashMap::new(), payload, timeout)
            .await
    }

    /// [`request`](Self::request) with caller-supplied headers.
    pub async fn request_with_headers(
        &self,
        subject: &str,
        headers: HashMap<String, String>,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message> {
        let reply = format!("{}{}", crate::INBOX_PREFIX, Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        self.inner.inboxes.lock().insert(reply.clone(), tx);

        let msg = Message {
            subject: subject.to_string(),
            reply: Some(reply.clone()),
            headers,
            payload,
        };
        let delivered = self.inner.route(&msg);
        if delivered == 0 {
            self.inner.inboxes.lock().remove(&reply);
            return Err(BusError::NoResponders(subject.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(BusError::Transport("reply channel closed".to_string())),
            Err(_) => {
                self.inner.inboxes.lock().remove(&reply);
                Err(BusError::TimedOut {
                    subject: subject.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Mint credentials scoped to one VM's subjects.
    ///
    /// Re-minting for the same VM replaces the previous credentials; on
    /// error no partial state is left behind.
    pub async fn mint_credentials(&self, vm_id: VmId) -> Result<VmCredentials> {
        let creds = VmCredentials {
            user_jwt: format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
            user_seed: format!("SUAS{}", Uuid::new_v4().simple().to_string().to_uppercase()),
        };
        self.inner.credentials.write().insert(vm_id, creds.clone());
        tracing::debug!(vm_id = %vm_id, "Minted VM credentials");
        Ok(creds)
    }

    /// Revoke a VM's credentials and terminate any connection holding
    /// them. Idempotent.
    pub async fn revoke_credentials(&self, vm_id: &VmId) {
        self.inner.credentials.write().remove(vm_id);
        let tokens = self.inner.connections.lock().remove(vm_id);
        if let Some(tokens) = tokens {
            let count = tokens.len();
            for (_, token) in tokens {
                token.cancel();
            }
            tracing::debug!(vm_id = %vm_id, connections = count, "Revoked VM credentials");
        }
    }

    /// The bus-wide object store.
    pub fn object_store(&self) -> &ObjectStore {
        &self.inner.store
    }

    pub(crate) fn verify_credentials(&self, vm_id: &VmId, seed: &str) -> bool {
        self.inner
            .credentials
            .read()
            .get(vm_id)
            .map(|c| c.user_seed == seed)
            .unwrap_or(false)
    }

    pub(crate) fn register_connection(&self, vm_id: VmId, token: CancellationToken) -> u64 {
        let conn_id = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        self.inner
            .connections
            .lock()
            .entry(vm_id)
            .or_default()
            .push((conn_id, token));
        conn_id
    }

    pub(crate) fn unregister_connection(&self, vm_id: &VmId, conn_id: u64) {
        let mut connections = self.inner.connections.lock();
        if let Some(tokens) = connections.get_mut(vm_id) {
            tokens.retain(|(id, _)| *id != conn_id);
            if tokens.is_empty() {
                connections.remove(vm_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> BusHandle {
        BusHandle::new()
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = handle();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = bus
            .subscribe("agentint.*.logs", move |msg| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(msg);
                }) as HandlerFuture
            })
            .await
            .unwrap();

        bus.publish("agentint.abc.logs", b"line".to_vec())
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("message delivered")
            .expect("channel open");
        assert_eq!(msg.subject, "agentint.abc.logs");
        assert_eq!(msg.payload, b"line");
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = handle();
        let responder = bus.clone();

        let _sub = bus
            .subscribe("agentint.abc.deploy", move |msg| {
                let bus = responder.clone();
                Box::pin(async move {
                    if let Some(reply) = msg.reply {
                        let _ = bus.publish(&reply, b"ack".to_vec()).await;
                    }
                }) as HandlerFuture
            })
            .await
            .unwrap();

        let reply = bus
            .request("agentint.abc.deploy", b"req".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, b"ack");
    }

    #[tokio::test]
    async fn test_request_no_responders() {
        let bus = handle();
        let err = bus
            .request("agentint.abc.deploy", Vec::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoResponders(_)));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let bus = handle();

        // A responder that never replies.
        let _sub = bus
            .subscribe("agentint.abc.deploy", |_msg| {
                Box::pin(async {}) as HandlerFuture
            })
            .await
            .unwrap();

        let err = bus
            .request(
                "agentint.abc.deploy",
                Vec::new(),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let bus = handle();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = bus
            .subscribe("slow.subject", move |_msg| {
                let tx = tx.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = tx.send(());
                }) as HandlerFuture
            })
            .await
            .unwrap();

        bus.publish("slow.subject", Vec::new()).await.unwrap();
        sub.drain().await.unwrap();

        // The in-flight handler completed before drain returned.
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_delivery() {
        let bus = handle();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = bus
            .subscribe("drop.subject", move |msg| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(msg);
                }) as HandlerFuture
            })
            .await
            .unwrap();
        drop(sub);

        bus.publish("drop.subject", Vec::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mint_and_verify_credentials() {
        let bus = handle();
        let vm_id = VmId::new();
        let creds = bus.mint_credentials(vm_id).await.unwrap();

        assert!(bus.verify_credentials(&vm_id, &creds.user_seed));
        assert!(!bus.verify_credentials(&vm_id, "SUASWRONG"));
        assert!(!bus.verify_credentials(&VmId::new(), &creds.user_seed));
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let bus = handle();
        let vm_id = VmId::new();
        let creds = bus.mint_credentials(vm_id).await.unwrap();

        bus.revoke_credentials(&vm_id).await;
        assert!(!bus.verify_credentials(&vm_id, &creds.user_seed));
        bus.revoke_credentials(&vm_id).await;
    }
}
