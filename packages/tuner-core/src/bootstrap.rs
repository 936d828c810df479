//! Application bootstrap and dependency wiring for the parent (supervisor)
//! process.
//!
//! This module is the composition root: the single place where the broker,
//! state store, state peer, and webserver peer stub are instantiated and
//! wired together, mirroring how a long-running service in this corpus
//! centralizes its startup sequence instead of scattering it across `main`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::TunerResult;
use crate::events::EventEmitter;
use crate::ipc::{Broker, Peer};
use crate::state::{StateStore, TokioSpawner};

const STATE_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// All services the supervisor owns for the lifetime of the parent process.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// The IPC broker (§4.C); owns the three Unix sockets.
    pub broker: Arc<Broker>,
    /// The in-process TTL state store (§4.B), confined to this process (§5).
    pub state_store: Arc<StateStore>,
    /// The distinguished `state` peer exposing the store over the bus.
    pub state_peer: Arc<Peer>,
    /// The distinguished `webserver` peer stub (§4.C, §9) — a bus handle for
    /// the out-of-scope HTTP layer to register handlers and issue commands.
    pub webserver_peer: Arc<Peer>,
    /// Background task spawner shared with the state store's reaper.
    pub spawner: TokioSpawner,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Shuts the parent-owned services down in the order the source
    /// observes (§2.A): webserver peer, then state peer, then state store,
    /// then broker. Callers are responsible for confirming the capture
    /// child is dead first (§4.E) before calling this.
    pub async fn shutdown(&self) {
        log::info!("supervisor: beginning graceful shutdown");
        self.cancel_token.cancel();

        drop(Arc::clone(&self.webserver_peer));
        drop(Arc::clone(&self.state_peer));

        self.broker.stop().await;
        log::info!("supervisor: shutdown complete");
    }
}

/// Wires the parent process's services together in dependency order:
///
/// 1. Broker (owns the sockets every peer connects to)
/// 2. State store (no dependencies)
/// 3. State peer (depends on broker + state store; starts serving `state.*`)
/// 4. Webserver peer stub (depends on broker only)
/// 5. Background reaper (depends on state store + spawner)
///
/// # Errors
///
/// Returns an error if the broker fails to bind its sockets or a peer fails
/// to connect to it.
pub async fn bootstrap_services(config: &Config) -> TunerResult<BootstrappedServices> {
    let cancel_token = CancellationToken::new();
    let spawner = TokioSpawner::current();

    let broker = Broker::new(&config.broker_dir);
    broker.start().await?;

    let state_store = StateStore::new();
    state_store.start_cleanup(&spawner);

    let state_peer = Peer::new("state", &config.broker_dir);
    register_state_handlers(&state_peer, Arc::clone(&state_store));
    state_peer.start().await?;

    let webserver_peer = Peer::new("webserver", &config.broker_dir);
    webserver_peer.start().await?;

    log::info!("supervisor: broker and parent-side peers ready");

    Ok(BootstrappedServices {
        broker,
        state_store,
        state_peer,
        webserver_peer,
        spawner,
        cancel_token,
    })
}

fn register_state_handlers(peer: &Peer, store: Arc<StateStore>) {
    use crate::ipc::peer::BoxFuture;

    let get_store = Arc::clone(&store);
    peer.on_command(
        "get",
        Arc::new(move |payload: serde_json::Value| -> BoxFuture<TunerResult<serde_json::Value>> {
            let store = Arc::clone(&get_store);
            Box::pin(async move {
                let key = payload["key"].as_str().unwrap_or_default().to_string();
                Ok(serde_json::json!(store.get(&key).await))
            })
        }),
    );

    let set_store = Arc::clone(&store);
    peer.on_command(
        "set",
        Arc::new(move |payload: serde_json::Value| -> BoxFuture<TunerResult<serde_json::Value>> {
            let store = Arc::clone(&set_store);
            Box::pin(async move {
                let key = payload["key"].as_str().unwrap_or_default().to_string();
                let value = payload["value"].as_str().map(str::to_string);
                let ttl_ms = payload["ttl_ms"].as_i64();
                store.set(&key, value, ttl_ms).await;
                Ok(serde_json::Value::Null)
            })
        }),
    );

    let delete_store = Arc::clone(&store);
    peer.on_command(
        "delete",
        Arc::new(move |payload: serde_json::Value| -> BoxFuture<TunerResult<serde_json::Value>> {
            let store = Arc::clone(&delete_store);
            Box::pin(async move {
                let key = payload["key"].as_str().unwrap_or_default().to_string();
                Ok(serde_json::json!(store.delete(&key).await))
            })
        }),
    );

    let exists_store = Arc::clone(&store);
    peer.on_command(
        "exists",
        Arc::new(move |payload: serde_json::Value| -> BoxFuture<TunerResult<serde_json::Value>> {
            let store = Arc::clone(&exists_store);
            Box::pin(async move {
                let key = payload["key"].as_str().unwrap_or_default().to_string();
                Ok(serde_json::json!(store.exists(&key).await))
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_peer_serves_get_set_delete_over_the_bus() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.broker_dir = dir.path().to_string_lossy().to_string();

        let services = bootstrap_services(&config).await.unwrap();

        let caller = Peer::new("caller", &config.broker_dir);
        caller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        caller
            .state_set("now_playing", Some("guid-1".to_string()), None, STATE_COMMAND_TIMEOUT)
            .await
            .unwrap();
        let value = caller.state_get("now_playing", STATE_COMMAND_TIMEOUT).await.unwrap();
        assert_eq!(value, Some("guid-1".to_string()));

        assert!(caller.state_exists("now_playing", STATE_COMMAND_TIMEOUT).await.unwrap());
        assert!(caller.state_delete("now_playing", STATE_COMMAND_TIMEOUT).await.unwrap());
        assert!(!caller.state_exists("now_playing", STATE_COMMAND_TIMEOUT).await.unwrap());

        services.shutdown().await;
    }
}
