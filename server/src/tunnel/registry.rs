//! Tunnel registry: id → [`ServerTunnel`] with inactivity sweep.
//!
//! The registry is the only owner that outlives a request. Tunnels leave it
//! when drained after their destination closed, on an explicit `DELETE`, on a
//! GET that finds the tunnel closed, or when the sweep finds them idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, info_span, Instrument};

use super::session::{DeleteOutcome, PutOutcome, ServerTunnel};
use super::{destination, next_session_id, DrainPolicy, TunnelDescriptor};
use crate::config::ServerConfig;
use crate::error::TunnelError;

/// Floor for the sweep period; `tokio::time::interval` rejects zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Per-tunnel settings shared by every tunnel the registry creates.
#[derive(Debug, Clone, Copy)]
pub struct TunnelSettings {
    pub max_buffer_bytes: usize,
    pub drain_policy: DrainPolicy,
    pub connect_timeout: Duration,
    /// How long a closing tunnel may wait for its write queue before the
    /// destination is cut off.
    pub close_grace: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for TunnelSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_buffer_bytes: config.max_buffer_bytes,
            drain_policy: config.drain_policy,
            connect_timeout: config.connect_timeout(),
            close_grace: config.close_grace(),
        }
    }
}

/// Shared map of live tunnels. Cheap to clone.
#[derive(Clone)]
pub struct TunnelRegistry {
    tunnels: Arc<RwLock<HashMap<String, Arc<ServerTunnel>>>>,
    settings: TunnelSettings,
}

impl TunnelRegistry {
    pub fn new(settings: TunnelSettings) -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            settings,
        }
    }

    /// Connect to the destination and register a new tunnel for it.
    ///
    /// Nothing is registered when the connect fails or times out.
    pub async fn open(&self, host: &str, port: u16) -> Result<TunnelDescriptor, TunnelError> {
        let session = next_session_id();
        let span = info_span!("tunnel", session, component = "server");

        async {
            let stream = destination::connect(host, port, self.settings.connect_timeout).await?;
            let id = uuid::Uuid::new_v4().simple().to_string();
            let (tunnel, link) = ServerTunnel::new(
                id.clone(),
                host.to_string(),
                port,
                session,
                &self.settings,
            );
            self.tunnels.write().await.insert(id.clone(), Arc::clone(&tunnel));
            info!(tunnel = %id, "t -> d connected to {host}:{port}");

            let registry = self.clone();
            let task_tunnel = Arc::clone(&tunnel);
            tokio::spawn(
                async move {
                    let id = task_tunnel.id().to_string();
                    if destination::run(task_tunnel, stream, link).await {
                        registry.remove(&id).await;
                    }
                }
                .in_current_span(),
            );

            Ok(tunnel.descriptor().await)
        }
        .instrument(span)
        .await
    }

    /// Look up a live tunnel.
    pub async fn get(&self, id: &str) -> Result<Arc<ServerTunnel>, TunnelError> {
        self.tunnels
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TunnelError::TunnelNotFound(id.to_string()))
    }

    /// Descriptors of every live tunnel.
    pub async fn list(&self) -> Vec<TunnelDescriptor> {
        let tunnels: Vec<_> = self.tunnels.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(tunnels.len());
        for tunnel in tunnels {
            out.push(tunnel.descriptor().await);
        }
        out
    }

    /// `GET out/{seq}`. A tunnel found closed with nothing left is removed.
    pub async fn read(&self, id: &str, seq: u64) -> Result<Bytes, TunnelError> {
        let tunnel = self.get(id).await?;
        let result = tunnel
            .get(seq)
            .instrument(info_span!("tunnel", session = tunnel.session(), component = "server"))
            .await;
        if matches!(result, Err(TunnelError::TunnelClosed)) {
            self.remove(id).await;
        }
        result
    }

    /// `PUT in/{seq}`.
    pub async fn write(&self, id: &str, seq: u64, data: Bytes) -> Result<PutOutcome, TunnelError> {
        let tunnel = self.get(id).await?;
        tunnel
            .put(seq, data)
            .instrument(info_span!("tunnel", session = tunnel.session(), component = "server"))
            .await
    }

    /// `DELETE`: start a graceful close, or remove right away when the
    /// destination is already gone.
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome, TunnelError> {
        let tunnel = self.get(id).await?;
        let outcome = tunnel.delete().await;
        if outcome == DeleteOutcome::Removable {
            self.remove(id).await;
        }
        Ok(outcome)
    }

    /// Drop a tunnel from the map. Idempotent.
    pub async fn remove(&self, id: &str) -> Option<Arc<ServerTunnel>> {
        let removed = self.tunnels.write().await.remove(id);
        if removed.is_some() {
            info!(tunnel = %id, "tunnel removed");
        }
        removed
    }

    /// Close every tunnel idle for longer than `idle_timeout`. Returns how
    /// many were closed or removed.
    pub async fn sweep_inactive(&self, idle_timeout: Duration) -> usize {
        let snapshot: Vec<_> = self
            .tunnels
            .read()
            .await
            .iter()
            .map(|(id, t)| (id.clone(), Arc::clone(t)))
            .collect();

        let mut swept = 0;
        for (id, tunnel) in snapshot {
            let idle = tunnel.idle_for().await;
            if idle <= idle_timeout {
                continue;
            }
            info!(tunnel = %id, idle_secs = idle.as_secs(), "closing inactive tunnel");
            if tunnel.delete().await == DeleteOutcome::Removable {
                self.remove(&id).await;
            }
            swept += 1;
        }
        swept
    }

    /// Run [`Self::sweep_inactive`] every `every` (at least one second) until
    /// the task is aborted.
    pub fn spawn_sweeper(&self, every: Duration, idle_timeout: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(MIN_SWEEP_INTERVAL));
            interval.tick().await; // first tick is immediate
            loop {
                interval.tick().await;
                let swept = registry.sweep_inactive(idle_timeout).await;
                if swept > 0 {
                    let remaining = registry.len().await;
                    info!(swept, remaining, "inactivity sweep");
                }
            }
        })
    }

    /// Close every destination and empty the registry. Used at shutdown.
    pub async fn close_all(&self) {
        let tunnels: Vec<_> = self.tunnels.write().await.drain().map(|(_, t)| t).collect();
        for tunnel in &tunnels {
            tunnel.delete().await;
        }
        if !tunnels.is_empty() {
            info!(count = tunnels.len(), "closed all tunnels");
        }
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }
}
