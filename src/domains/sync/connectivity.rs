use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use crate::domains::sync::types::SyncConfig;

/// One bounded reachability check against the remote service.
///
/// Probe failures are never engine errors; they only feed the boolean
/// connectivity state.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Probes the central service's health endpoint over HTTP. Any transport
/// error, timeout, or non-2xx response counts as offline.
pub struct HttpReachabilityProbe {
    client: Client,
    health_url: String,
    timeout: Duration,
}

impl HttpReachabilityProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            health_url: format!("{}/health", base_url.trim_end_matches('/')),
            timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpReachabilityProbe {
    async fn probe(&self) -> bool {
        let request = self.client.get(&self.health_url).send();
        match time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                debug!("Health probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Health probe timed out after {:?}", self.timeout);
                false
            }
        }
    }
}

/// Periodically probes remote reachability and publishes the online/offline
/// state, notifying subscribers only when the observed state flips.
pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    state_tx: watch::Sender<bool>,
    probe_interval: Duration,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, config: &SyncConfig) -> Self {
        // Stations start offline until the first probe says otherwise.
        let (state_tx, _) = watch::channel(false);
        Self {
            probe,
            state_tx,
            probe_interval: config.probe_interval,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        let probe = HttpReachabilityProbe::new(&config.api_base_url, config.probe_timeout);
        Self::new(Arc::new(probe), config)
    }

    pub fn current_state(&self) -> bool {
        *self.state_tx.borrow()
    }

    /// Subscribe to connectivity flips. The receiver always observes the
    /// latest state; repeated identical probes produce no notification.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// Run one probe and update the published state.
    pub async fn check_now(&self) -> bool {
        let now_online = self.probe.probe().await;
        self.state_tx.send_if_modified(|online| {
            if *online != now_online {
                info!(
                    "Connectivity changed: {}",
                    if now_online { "online" } else { "offline" }
                );
                *online = now_online;
                true
            } else {
                false
            }
        });
        now_online
    }

    /// Probe loop. Each probe is awaited to completion before the next tick
    /// is considered, so at most one probe is ever in flight; ticks that
    /// fire while a probe is outstanding are skipped.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut interval = time::interval(self.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Connectivity monitor started (interval {:?})",
            self.probe_interval
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_now().await;
                }
                _ = &mut shutdown => {
                    info!("Connectivity monitor stopping");
                    break;
                }
            }
        }
    }
}
