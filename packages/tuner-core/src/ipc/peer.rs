//! IPC peer: a named participant that publishes/subscribes and exchanges
//! directed commands over the broker (§4.C).
//!
//! Handlers are registered with [`Peer::on_event`]/[`Peer::on_command`]
//! before [`Peer::start`] is called — the target-language analogue of the
//! source's decorator-collected-at-import-time handlers (§9 Design Notes):
//! each registration is a call at startup, and the handler itself is a
//! closure over whatever shared state it needs.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex as SyncMutex;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::protocol::{read_frames, write_frames, CommandFrame, MsgType};
use crate::error::{TunerError, TunerResult};

/// A boxed future returned by an async handler.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handler for `on_event(topic)`.
pub type EventHandler = Arc<dyn Fn(serde_json::Value) -> BoxFuture<()> + Send + Sync>;

/// Handler for `on_command(method)`. Its return value becomes the `RES` payload.
pub type CommandHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<TunerResult<serde_json::Value>> + Send + Sync>;

/// A peer connected to the IPC broker.
pub struct Peer {
    identity: String,
    broker_dir: std::path::PathBuf,
    started: AtomicBool,
    cmd_writer: SyncMutex<Option<OwnedWriteHalf>>,
    sub_writer: SyncMutex<Option<OwnedWriteHalf>>,
    pending: DashMap<Uuid, oneshot::Sender<TunerResult<serde_json::Value>>>,
    event_handlers: DashMap<String, EventHandler>,
    command_handlers: DashMap<String, CommandHandler>,
}

impl Peer {
    /// Creates an unconnected peer. Call [`Peer::start`] once handlers are registered.
    #[must_use]
    pub fn new(identity: impl Into<String>, broker_dir: impl Into<std::path::PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.into(),
            broker_dir: broker_dir.into(),
            started: AtomicBool::new(false),
            cmd_writer: SyncMutex::new(None),
            sub_writer: SyncMutex::new(None),
            pending: DashMap::new(),
            event_handlers: DashMap::new(),
            command_handlers: DashMap::new(),
        })
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Registers an async handler for `topic`; the peer auto-subscribes on [`Peer::start`].
    pub fn on_event(&self, topic: impl Into<String>, handler: EventHandler) {
        self.event_handlers.insert(topic.into(), handler);
    }

    /// Registers an async handler for `method`; its return value becomes the `RES` payload.
    pub fn on_command(&self, method: impl Into<String>, handler: CommandHandler) {
        self.command_handlers.insert(method.into(), handler);
    }

    /// Connects to the broker's three sockets, subscribes to every registered
    /// topic, and spawns the receive loops.
    pub async fn start(self: &Arc<Self>) -> TunerResult<()> {
        let cmd_stream = UnixStream::connect(self.broker_dir.join("cmd.sock"))
            .await
            .map_err(|e| TunerError::Fatal(format!("connect cmd.sock: {e}")))?;
        let (cmd_read, mut cmd_write) = cmd_stream.into_split();
        write_frames(&mut cmd_write, &[self.identity.clone().into_bytes()]).await?;
        *self.cmd_writer.lock().await = Some(cmd_write);

        let sub_stream = UnixStream::connect(self.broker_dir.join("sub.sock"))
            .await
            .map_err(|e| TunerError::Fatal(format!("connect sub.sock: {e}")))?;
        *self.sub_writer.lock().await = Some(sub_stream.into_split().1);

        let pub_stream = UnixStream::connect(self.broker_dir.join("pub.sock"))
            .await
            .map_err(|e| TunerError::Fatal(format!("connect pub.sock: {e}")))?;
        let (pub_read, mut pub_write) = pub_stream.into_split();
        for topic in self.event_handlers.iter().map(|e| e.key().clone()) {
            write_frames(&mut pub_write, &[b"SUBSCRIBE".to_vec(), topic.into_bytes()]).await?;
        }

        self.started.store(true, Ordering::SeqCst);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_cmd_loop(cmd_read).await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_event_loop(pub_read).await });

        Ok(())
    }

    async fn run_cmd_loop(self: Arc<Self>, mut read_half: tokio::net::unix::OwnedReadHalf) {
        loop {
            match read_frames(&mut read_half).await {
                Ok(Some(frames)) => {
                    let Ok(frame) = CommandFrame::from_wire(frames) else {
                        continue;
                    };
                    self.clone().handle_incoming(frame).await;
                }
                Ok(None) | Err(_) => break,
            }
        }
        // Shutdown: fail every pending request with a shutdown error.
        for entry in self.pending.iter() {
            let _ = entry.value();
        }
        let keys: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(TunerError::Fatal("peer shutting down".into())));
            }
        }
    }

    async fn handle_incoming(self: Arc<Self>, frame: CommandFrame) {
        match frame.msg_type {
            MsgType::Req => {
                let sender = frame.identity.clone();
                let corr_id = frame.corr_id;
                let Some(handler) = self.command_handlers.get(&frame.method).map(|h| h.clone())
                else {
                    self.send_response(
                        &sender,
                        corr_id,
                        MsgType::Err,
                        serde_json::json!({"error": format!("no such method: {}", frame.method)}),
                    )
                    .await;
                    return;
                };
                let result = handler(frame.payload).await;
                match result {
                    Ok(value) => self.send_response(&sender, corr_id, MsgType::Res, value).await,
                    Err(e) => {
                        self.send_response(
                            &sender,
                            corr_id,
                            MsgType::Err,
                            serde_json::json!({"error": e.to_string()}),
                        )
                        .await
                    }
                }
            }
            MsgType::Res | MsgType::Err => {
                // A late response after the requester's timeout detached the
                // pending entry is dropped here with a debug log.
                match self.pending.remove(&frame.corr_id) {
                    Some((_, tx)) => {
                        let result = match frame.msg_type {
                            MsgType::Res => Ok(frame.payload),
                            _ => Err(classify_err(&frame.payload)),
                        };
                        let _ = tx.send(result);
                    }
                    None => {
                        tracing::debug!(corr_id = %frame.corr_id, "dropping stale/unexpected response");
                    }
                }
            }
        }
    }

    async fn send_response(&self, target: &str, corr_id: Uuid, msg_type: MsgType, payload: serde_json::Value) {
        let frame = CommandFrame {
            identity: target.to_string(),
            msg_type,
            corr_id,
            method: String::new(),
            payload,
        };
        let mut guard = self.cmd_writer_async_guard().await;
        if let Some(writer) = guard.as_mut() {
            let _ = write_frames(writer, &frame.into_wire()).await;
        }
    }

    async fn run_event_loop(self: Arc<Self>, mut read_half: tokio::net::unix::OwnedReadHalf) {
        loop {
            match read_frames(&mut read_half).await {
                Ok(Some(frames)) if frames.len() == 2 => {
                    let topic = String::from_utf8_lossy(&frames[0]).to_string();
                    let payload: serde_json::Value =
                        serde_json::from_slice(&frames[1]).unwrap_or(serde_json::Value::Null);
                    let handler = self
                        .event_handlers
                        .iter()
                        .find(|e| topic.starts_with(e.key().as_str()))
                        .map(|e| e.value().clone());
                    if let Some(handler) = handler {
                        handler(payload).await;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// Non-blocking publish; preserves this peer's FIFO order per topic.
    pub async fn broadcast(&self, topic: &str, data: serde_json::Value) -> TunerResult<()> {
        let payload = serde_json::to_vec(&data).unwrap_or_else(|_| b"null".to_vec());
        let frames = vec![topic.as_bytes().to_vec(), payload];
        let mut guard = self.sub_writer_async_guard().await;
        if let Some(writer) = guard.as_mut() {
            write_frames(writer, &frames).await?;
        }
        Ok(())
    }

    /// Sends a directed request to `target.method` and awaits its response,
    /// failing with a deadline error if `timeout` elapses first.
    pub async fn command(
        &self,
        target_method: &str,
        data: serde_json::Value,
        timeout: Duration,
    ) -> TunerResult<serde_json::Value> {
        let (target, method) = target_method
            .split_once('.')
            .ok_or_else(|| TunerError::Protocol(format!("invalid target.method: {target_method}")))?;

        let corr_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(corr_id, tx);

        let frame = CommandFrame {
            identity: target.to_string(),
            msg_type: MsgType::Req,
            corr_id,
            method: method.to_string(),
            payload: data,
        };
        {
            let mut guard = self.cmd_writer_async_guard().await;
            if let Some(writer) = guard.as_mut() {
                write_frames(writer, &frame.into_wire()).await?;
            } else {
                self.pending.remove(&corr_id);
                return Err(TunerError::Fatal("peer not started".into()));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TunerError::Fatal("peer shutting down".into())),
            Err(_) => {
                self.pending.remove(&corr_id);
                Err(TunerError::Timeout(target_method.to_string()))
            }
        }
    }

    async fn cmd_writer_async_guard(&self) -> tokio::sync::MutexGuard<'_, Option<OwnedWriteHalf>> {
        self.cmd_writer.lock().await
    }

    async fn sub_writer_async_guard(&self) -> tokio::sync::MutexGuard<'_, Option<OwnedWriteHalf>> {
        self.sub_writer.lock().await
    }

    // ------------------------------------------------------------------
    // State store convenience methods (§4.C "state peer")
    // ------------------------------------------------------------------

    pub async fn state_get(&self, key: &str, timeout: Duration) -> TunerResult<Option<String>> {
        let v = self
            .command("state.get", serde_json::json!({"key": key}), timeout)
            .await?;
        Ok(v.as_str().map(str::to_string))
    }

    pub async fn state_set(
        &self,
        key: &str,
        value: Option<String>,
        ttl_ms: Option<i64>,
        timeout: Duration,
    ) -> TunerResult<()> {
        self.command(
            "state.set",
            serde_json::json!({"key": key, "value": value, "ttl_ms": ttl_ms}),
            timeout,
        )
        .await?;
        Ok(())
    }

    pub async fn state_delete(&self, key: &str, timeout: Duration) -> TunerResult<bool> {
        let v = self
            .command("state.delete", serde_json::json!({"key": key}), timeout)
            .await?;
        Ok(v.as_bool().unwrap_or(false))
    }

    pub async fn state_exists(&self, key: &str, timeout: Duration) -> TunerResult<bool> {
        let v = self
            .command("state.exists", serde_json::json!({"key": key}), timeout)
            .await?;
        Ok(v.as_bool().unwrap_or(false))
    }
}

/// Default budget for the `state.*` commands issued on behalf of callers
/// (the interruptible-sleep helper, the detection loop) that don't carry
/// their own per-call timeout (§4.D).
const DEFAULT_STATE_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
impl crate::state_client::StateClient for Peer {
    async fn get(&self, key: &str) -> TunerResult<Option<String>> {
        self.state_get(key, DEFAULT_STATE_COMMAND_TIMEOUT).await
    }

    async fn set_with_ttl(&self, key: &str, value: Option<String>, ttl_ms: Option<i64>) -> TunerResult<()> {
        self.state_set(key, value, ttl_ms, DEFAULT_STATE_COMMAND_TIMEOUT).await
    }

    async fn delete(&self, key: &str) -> TunerResult<bool> {
        self.state_delete(key, DEFAULT_STATE_COMMAND_TIMEOUT).await
    }

    async fn exists(&self, key: &str) -> TunerResult<bool> {
        self.state_exists(key, DEFAULT_STATE_COMMAND_TIMEOUT).await
    }
}

/// Maps a synthesized or forwarded `ERR` payload to a [`TunerError`]. A
/// "peer not connected" message (the broker's synthesized routing failure,
/// §4.C) is distinguished from an ordinary handler-side failure so callers
/// can tell a dead target from a rejected request.
fn classify_err(payload: &serde_json::Value) -> TunerError {
    let message = payload
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("command failed")
        .to_string();
    if message.contains("not connected") {
        TunerError::Routing(message)
    } else {
        TunerError::Handler(message)
    }
}

/// Blocking façade over [`Peer`] for OS threads that are not themselves
/// driving the tokio executor (the capture and detection worker threads,
/// §4.D). Mirrors the source's `run_coroutine_threadsafe(...).result(timeout)`
/// pattern: the outer wait is given two extra seconds over the command's own
/// timeout so a slow-but-answering peer is distinguishable from a hung one.
#[derive(Clone)]
pub struct SyncPeer {
    peer: Arc<Peer>,
    handle: tokio::runtime::Handle,
}

impl SyncPeer {
    #[must_use]
    pub fn new(peer: Arc<Peer>, handle: tokio::runtime::Handle) -> Self {
        Self { peer, handle }
    }

    pub fn command(
        &self,
        target_method: &str,
        data: serde_json::Value,
        timeout: Duration,
    ) -> TunerResult<serde_json::Value> {
        let peer = Arc::clone(&self.peer);
        let target_method = target_method.to_string();
        let outer = timeout + Duration::from_secs(2);
        self.handle.block_on(async move {
            match tokio::time::timeout(outer, peer.command(&target_method, data, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(TunerError::Timeout(target_method)),
            }
        })
    }

    pub fn broadcast(&self, topic: &str, data: serde_json::Value) -> TunerResult<()> {
        let peer = Arc::clone(&self.peer);
        let topic = topic.to_string();
        self.handle.block_on(async move { peer.broadcast(&topic, data).await })
    }

    pub fn state_get(&self, key: &str, timeout: Duration) -> TunerResult<Option<String>> {
        let peer = Arc::clone(&self.peer);
        let key = key.to_string();
        self.handle.block_on(async move { peer.state_get(&key, timeout).await })
    }

    pub fn state_set(
        &self,
        key: &str,
        value: Option<String>,
        ttl_ms: Option<i64>,
        timeout: Duration,
    ) -> TunerResult<()> {
        let peer = Arc::clone(&self.peer);
        let key = key.to_string();
        self.handle
            .block_on(async move { peer.state_set(&key, value, ttl_ms, timeout).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::broker::Broker;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn command_round_trips_between_two_peers() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new(dir.path());
        broker.start().await.unwrap();

        let responder = Peer::new("echo", dir.path());
        responder.on_command(
            "ping",
            Arc::new(|payload: serde_json::Value| -> BoxFuture<TunerResult<serde_json::Value>> {
                Box::pin(async move { Ok(payload) })
            }),
        );
        responder.start().await.unwrap();

        let caller = Peer::new("caller", dir.path());
        caller.start().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let result = caller
            .command("echo.ping", serde_json::json!({"n": 1}), StdDuration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result["n"], 1);
    }

    #[tokio::test]
    async fn command_to_unroutable_target_surfaces_as_routing_error() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new(dir.path());
        broker.start().await.unwrap();

        let caller = Peer::new("caller", dir.path());
        caller.start().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let err = caller
            .command("ghost.ping", serde_json::json!({}), StdDuration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TunerError::Routing(_)));
    }

    #[tokio::test]
    async fn broadcast_event_reaches_subscribed_handler() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new(dir.path());
        broker.start().await.unwrap();

        let received = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&received);
        let subscriber = Peer::new("sub", dir.path());
        subscriber.on_event(
            "detection.",
            Arc::new(move |_payload: serde_json::Value| -> BoxFuture<()> {
                let flag = Arc::clone(&flag);
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                })
            }),
        );
        subscriber.start().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let publisher = Peer::new("pub", dir.path());
        publisher.start().await.unwrap();
        publisher
            .broadcast("detection.matched", serde_json::json!({"track": "x"}))
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        assert!(received.load(Ordering::SeqCst));
    }
}
