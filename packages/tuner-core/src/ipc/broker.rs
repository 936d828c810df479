//! Local IPC broker: pub/sub proxy + identity-routed command router (§4.C).
//!
//! Binds three Unix domain sockets inside a broker directory:
//!
//! * `sub.sock` — publishers connect here and send `[topic, payload]` messages.
//! * `pub.sock` — subscribers connect here, announce topic prefixes with a
//!   `SUBSCRIBE` control frame, and receive forwarded `[topic, payload]` messages.
//! * `cmd.sock` — peers connect, announce their identity, then exchange
//!   directed request/response [`CommandFrame`]s; the broker routes by identity.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{read_frames, write_frames, CommandFrame, Frames, MsgType};
use crate::error::{TunerError, TunerResult};

const CHANNEL_CAPACITY: usize = 256;

struct SubscriberConn {
    topics: RwLock<Vec<String>>,
    tx: mpsc::Sender<Frames>,
}

/// The IPC broker, run inside the supervisor's parent process.
pub struct Broker {
    dir: PathBuf,
    cancel: CancellationToken,
    next_conn_id: AtomicU64,
    subscribers: DashMap<u64, Arc<SubscriberConn>>,
    identities: DashMap<String, mpsc::Sender<Frames>>,
}

impl Broker {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            cancel: CancellationToken::new(),
            next_conn_id: AtomicU64::new(0),
            subscribers: DashMap::new(),
            identities: DashMap::new(),
        })
    }

    pub fn sub_path(&self) -> PathBuf {
        self.dir.join("sub.sock")
    }

    pub fn pub_path(&self) -> PathBuf {
        self.dir.join("pub.sock")
    }

    pub fn cmd_path(&self) -> PathBuf {
        self.dir.join("cmd.sock")
    }

    /// Creates the broker directory, unlinks stale socket files, binds the
    /// three sockets, and spawns their accept loops.
    pub async fn start(self: &Arc<Self>) -> TunerResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TunerError::Fatal(format!("broker dir: {e}")))?;

        for path in [self.sub_path(), self.pub_path(), self.cmd_path()] {
            unlink_if_present(&path).await;
        }

        let sub_listener = UnixListener::bind(self.sub_path())
            .map_err(|e| TunerError::Fatal(format!("bind sub.sock: {e}")))?;
        let pub_listener = UnixListener::bind(self.pub_path())
            .map_err(|e| TunerError::Fatal(format!("bind pub.sock: {e}")))?;
        let cmd_listener = UnixListener::bind(self.cmd_path())
            .map_err(|e| TunerError::Fatal(format!("bind cmd.sock: {e}")))?;

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_sub_accept_loop(sub_listener).await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_pub_accept_loop(pub_listener).await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_cmd_accept_loop(cmd_listener).await });

        tracing::info!(
            dir = %self.dir.display(),
            "IPC broker started"
        );
        Ok(())
    }

    /// Cancels accept/read loops and unlinks the socket files.
    pub async fn stop(&self) {
        self.cancel.cancel();
        for path in [self.sub_path(), self.pub_path(), self.cmd_path()] {
            unlink_if_present(&path).await;
        }
    }

    // ------------------------------------------------------------------
    // sub.sock: publishers
    // ------------------------------------------------------------------

    async fn run_sub_accept_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.run_publisher_conn(stream).await });
                }
            }
        }
    }

    async fn run_publisher_conn(self: Arc<Self>, mut stream: UnixStream) {
        loop {
            match read_frames(&mut stream).await {
                Ok(Some(frames)) if frames.len() == 2 => {
                    let topic = String::from_utf8_lossy(&frames[0]).to_string();
                    self.fan_out(&topic, frames).await;
                }
                Ok(Some(_)) => {
                    tracing::warn!("IPC broker: malformed publish message");
                }
                Ok(None) | Err(_) => return,
            }
        }
    }

    async fn fan_out(&self, topic: &str, frames: Frames) {
        for entry in self.subscribers.iter() {
            let matches = entry
                .value()
                .topics
                .read()
                .iter()
                .any(|prefix| topic.starts_with(prefix.as_str()));
            if matches {
                let _ = entry.value().tx.send(frames.clone()).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // pub.sock: subscribers
    // ------------------------------------------------------------------

    async fn run_pub_accept_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.run_subscriber_conn(stream).await });
                }
            }
        }
    }

    async fn run_subscriber_conn(self: Arc<Self>, stream: UnixStream) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Frames>(CHANNEL_CAPACITY);

        let conn = Arc::new(SubscriberConn {
            topics: RwLock::new(Vec::new()),
            tx,
        });
        self.subscribers.insert(conn_id, Arc::clone(&conn));

        let writer = tokio::spawn(async move {
            while let Some(frames) = rx.recv().await {
                if write_frames(&mut write_half, &frames).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match read_frames(&mut read_half).await {
                Ok(Some(frames)) if frames.len() == 2 && frames[0] == b"SUBSCRIBE" => {
                    let topic = String::from_utf8_lossy(&frames[1]).to_string();
                    conn.topics.write().push(topic);
                }
                Ok(Some(_)) => {
                    tracing::warn!("IPC broker: malformed subscribe control frame");
                }
                Ok(None) | Err(_) => break,
            }
        }

        // Subscriber disconnected: remove its subscriptions. Publisher
        // disconnects on sub.sock never touch this table (see §4.C).
        self.subscribers.remove(&conn_id);
        writer.abort();
    }

    // ------------------------------------------------------------------
    // cmd.sock: identity-routed commands
    // ------------------------------------------------------------------

    async fn run_cmd_accept_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.run_cmd_conn(stream).await });
                }
            }
        }
    }

    async fn run_cmd_conn(self: Arc<Self>, stream: UnixStream) {
        let (mut read_half, mut write_half) = stream.into_split();

        let identity = match read_frames(&mut read_half).await {
            Ok(Some(frames)) if frames.len() == 1 => String::from_utf8_lossy(&frames[0]).to_string(),
            _ => return,
        };

        let (tx, mut rx) = mpsc::channel::<Frames>(CHANNEL_CAPACITY);
        self.identities.insert(identity.clone(), tx);

        let writer = tokio::spawn(async move {
            while let Some(frames) = rx.recv().await {
                if write_frames(&mut write_half, &frames).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match read_frames(&mut read_half).await {
                Ok(Some(frames)) => match CommandFrame::from_wire(frames) {
                    Ok(frame) => self.route(&identity, frame).await,
                    Err(e) => tracing::warn!(error = %e, "IPC broker: malformed command frame"),
                },
                Ok(None) | Err(_) => break,
            }
        }

        self.identities.remove(&identity);
        writer.abort();
    }

    /// Routes a command frame from `sender` to its target, or synthesizes an
    /// ERR response back to `sender` if the target is not connected.
    async fn route(&self, sender: &str, frame: CommandFrame) {
        let target = frame.identity.clone();
        let corr_id = frame.corr_id;

        if let Some(target_tx) = self.identities.get(&target) {
            let forwarded = CommandFrame {
                identity: sender.to_string(),
                msg_type: frame.msg_type,
                corr_id,
                method: frame.method,
                payload: frame.payload,
            };
            let _ = target_tx.send(forwarded.into_wire()).await;
            return;
        }

        tracing::debug!(target = %target, "IPC broker: cannot route, peer not connected");
        if let Some(sender_tx) = self.identities.get(sender) {
            let err_frame = CommandFrame {
                identity: "broker".to_string(),
                msg_type: MsgType::Err,
                corr_id,
                method: String::new(),
                payload: serde_json::json!({
                    "error": format!("peer not connected: {target}")
                }),
            };
            let _ = sender_tx.send(err_frame.into_wire()).await;
        }
    }
}

async fn unlink_if_present(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}

#[cfg(test)]
pub(crate) fn make_corr_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::UnixStream as ClientStream;

    async fn start_broker() -> (Arc<Broker>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new(dir.path());
        broker.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        (broker, dir)
    }

    #[tokio::test]
    async fn fan_out_delivers_to_matching_subscriber_in_order() {
        let (broker, _dir) = start_broker().await;

        let mut sub_conn = ClientStream::connect(broker.pub_path()).await.unwrap();
        write_frames(&mut sub_conn, &[b"SUBSCRIBE".to_vec(), b"now_".to_vec()])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut pub_conn = ClientStream::connect(broker.sub_path()).await.unwrap();
        write_frames(&mut pub_conn, &[b"now_playing".to_vec(), b"1".to_vec()])
            .await
            .unwrap();
        write_frames(&mut pub_conn, &[b"now_playing".to_vec(), b"2".to_vec()])
            .await
            .unwrap();
        write_frames(&mut pub_conn, &[b"other_topic".to_vec(), b"x".to_vec()])
            .await
            .unwrap();

        let first = read_frames(&mut sub_conn).await.unwrap().unwrap();
        let second = read_frames(&mut sub_conn).await.unwrap().unwrap();
        assert_eq!(first[1], b"1");
        assert_eq!(second[1], b"2");
    }

    #[tokio::test]
    async fn publisher_disconnect_does_not_affect_subscriptions() {
        let (broker, _dir) = start_broker().await;

        let mut sub_conn = ClientStream::connect(broker.pub_path()).await.unwrap();
        write_frames(&mut sub_conn, &[b"SUBSCRIBE".to_vec(), b"topic".to_vec()])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        {
            let mut pub_conn = ClientStream::connect(broker.sub_path()).await.unwrap();
            write_frames(&mut pub_conn, &[b"topic".to_vec(), b"before".to_vec()])
                .await
                .unwrap();
            // pub_conn dropped here -- publisher disconnects.
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut pub_conn2 = ClientStream::connect(broker.sub_path()).await.unwrap();
        write_frames(&mut pub_conn2, &[b"topic".to_vec(), b"after".to_vec()])
            .await
            .unwrap();

        let first = read_frames(&mut sub_conn).await.unwrap().unwrap();
        let second = read_frames(&mut sub_conn).await.unwrap().unwrap();
        assert_eq!(first[1], b"before");
        assert_eq!(second[1], b"after");
    }

    #[tokio::test]
    async fn unroutable_target_gets_synthesized_error_not_a_hang() {
        let (broker, _dir) = start_broker().await;

        let mut conn = ClientStream::connect(broker.cmd_path()).await.unwrap();
        write_frames(&mut conn, &[b"caller".to_vec()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let corr_id = make_corr_id();
        let req = CommandFrame {
            identity: "ghost".to_string(),
            msg_type: MsgType::Req,
            corr_id,
            method: "method".to_string(),
            payload: serde_json::Value::Null,
        };
        write_frames(&mut conn, &req.into_wire()).await.unwrap();

        let response = read_frames(&mut conn).await.unwrap().unwrap();
        let decoded = CommandFrame::from_wire(response).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Err);
        assert_eq!(decoded.corr_id, corr_id);
    }

    #[tokio::test]
    async fn command_routes_to_connected_target_with_sender_prepended() {
        let (broker, _dir) = start_broker().await;

        let mut caller = ClientStream::connect(broker.cmd_path()).await.unwrap();
        write_frames(&mut caller, &[b"caller".to_vec()]).await.unwrap();
        let mut target = ClientStream::connect(broker.cmd_path()).await.unwrap();
        write_frames(&mut target, &[b"target".to_vec()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let corr_id = make_corr_id();
        let req = CommandFrame {
            identity: "target".to_string(),
            msg_type: MsgType::Req,
            corr_id,
            method: "echo".to_string(),
            payload: serde_json::json!("hi"),
        };
        write_frames(&mut caller, &req.into_wire()).await.unwrap();

        let received = read_frames(&mut target).await.unwrap().unwrap();
        let decoded = CommandFrame::from_wire(received).unwrap();
        assert_eq!(decoded.identity, "caller");
        assert_eq!(decoded.method, "echo");
        assert_eq!(decoded.corr_id, corr_id);
    }
}
