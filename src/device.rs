//! High-level Tuya device handle: data-point reads and writes, a cached
//! status map fed by responses and unsolicited pushes, and automatic
//! reconnection on connection failure.

use crate::connection::{Connection, ConnectionConfig, ConnectionState};
use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, MessageCodec, TuyaMessage, Version};
use crate::retry::{RetryPolicy, retry};
use futures_core::stream::Stream;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;

/// Default TCP port of Tuya devices.
pub const DEFAULT_PORT: u16 = 6668;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Snapshot of a device's data points.
///
/// Keys are opaque integer-in-a-string DP ids; values are JSON scalars.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DpsStatus {
    pub dps: HashMap<String, Value>,
    /// Unix timestamp of the last update, when reported
    pub updated_at: Option<u64>,
}

impl DpsStatus {
    /// Parse a data-point response payload. Accepts `{"dps": …}`,
    /// `{"data": {"dps": …}}`, and a bare DP object.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let val: Value = serde_json::from_slice(payload)?;
        Self::from_value(&val)
    }

    pub fn from_value(val: &Value) -> Result<Self> {
        let dps_val = val
            .get("dps")
            .or_else(|| val.get("data").and_then(|d| d.get("dps")))
            .unwrap_or(val);
        let obj = dps_val
            .as_object()
            .ok_or_else(|| TuyaError::Json("dps is not an object".into()))?;

        let updated_at = val.get("t").and_then(|t| match t {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        });

        Ok(Self {
            dps: obj.clone().into_iter().collect(),
            updated_at,
        })
    }

    /// Value of a single data point.
    pub fn get(&self, dp_id: &str) -> Option<&Value> {
        self.dps.get(dp_id)
    }

    pub fn is_empty(&self) -> bool {
        self.dps.is_empty()
    }

    fn merge(&mut self, dps: &serde_json::Map<String, Value>, timestamp: Option<u64>) {
        for (k, v) in dps {
            self.dps.insert(k.clone(), v.clone());
        }
        if timestamp.is_some() {
            self.updated_at = timestamp;
        }
    }
}

/// Builder for [`Device`].
pub struct DeviceBuilder {
    id: String,
    address: String,
    local_key: String,
    port: u16,
    version: Version,
    connection: ConnectionConfig,
    auto_reconnect: bool,
    reconnect_delay: Duration,
    status_poll_interval: Option<Duration>,
    retry_policy: RetryPolicy,
}

impl DeviceBuilder {
    /// Start building a device handle from its id, IP address, and local key.
    pub fn new<I, A, K>(id: I, address: A, local_key: K) -> Self
    where
        I: Into<String>,
        A: Into<String>,
        K: Into<String>,
    {
        Self {
            id: id.into(),
            address: address.into(),
            local_key: local_key.into(),
            port: DEFAULT_PORT,
            version: Version::V3_3,
            connection: ConnectionConfig::default(),
            auto_reconnect: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            status_poll_interval: None,
            retry_policy: RetryPolicy::STANDARD,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection.connection_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.connection.response_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.connection.heartbeat_interval = interval;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Enable periodic status refreshes. Off by default.
    pub fn status_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.status_poll_interval = interval;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Build the device handle and start its monitor tasks. No connection
    /// is opened until [`Device::connect`].
    pub fn build(self) -> Device {
        let cipher = TuyaCipher::new(&self.local_key, false);
        let codec = MessageCodec::new(self.version, Some(cipher));
        let addr = format!("{}:{}", self.address, self.port);
        let connection = Connection::new(addr, codec, self.connection);

        let (status_tx, _) = watch::channel(DpsStatus::default());
        let device = Device {
            id: self.id,
            version: self.version,
            connection,
            status_tx: Arc::new(status_tx),
            retry_policy: self.retry_policy,
            cancel: CancellationToken::new(),
        };

        let d = device.clone();
        let token = device.cancel.clone();
        tokio::spawn(async move { d.run_status_listener(token).await });

        if self.auto_reconnect {
            let d = device.clone();
            let token = device.cancel.clone();
            let delay = self.reconnect_delay;
            tokio::spawn(async move { d.run_reconnect_monitor(delay, token).await });
        }

        if let Some(interval) = self.status_poll_interval {
            let d = device.clone();
            let token = device.cancel.clone();
            tokio::spawn(async move { d.run_status_poller(interval, token).await });
        }

        device
    }
}

/// A Tuya device on the local network.
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct Device {
    id: String,
    version: Version,
    connection: Connection,
    status_tx: Arc<watch::Sender<DpsStatus>>,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Device {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The underlying connection, for state and unsolicited-message
    /// observation.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state()
    }

    /// Open the TCP session.
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Close the TCP session. Monitor tasks stay alive so the device can
    /// reconnect later.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Permanently stop this device handle: disconnect and end the monitor
    /// tasks. The cached status is reset.
    pub async fn close(&self) {
        info!("closing device {}", self.id);
        self.cancel.cancel();
        self.connection.disconnect().await;
        self.status_tx.send_replace(DpsStatus::default());
    }

    /// Snapshot of the cached data-point status.
    pub fn status(&self) -> DpsStatus {
        self.status_tx.borrow().clone()
    }

    /// Cached-status updates as a Stream, starting from the current value.
    pub fn status_stream(&self) -> impl Stream<Item = DpsStatus> + Send + 'static {
        let mut rx = self.status_tx.subscribe();
        async_stream::stream! {
            let current = rx.borrow_and_update().clone();
            yield current;
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().clone();
                yield status;
            }
        }
    }

    /// Query the device for its full data-point state and update the cache.
    pub async fn refresh(&self) -> Result<DpsStatus> {
        let payload = json!({ "gwId": self.id, "devId": self.id });
        let conn = self.connection.clone();
        let response = retry(&self.retry_policy, move || {
            let conn = conn.clone();
            let payload = payload.clone();
            async move {
                conn.send(TuyaMessage::with_json(CommandType::DpQuery, &payload)?)
                    .await
            }
        })
        .await?;

        let status = DpsStatus::parse(&response.payload)?;
        let parsed = status.clone();
        self.status_tx.send_modify(|cached| {
            for (k, v) in &parsed.dps {
                cached.dps.insert(k.clone(), v.clone());
            }
            cached.updated_at = parsed.updated_at.or(cached.updated_at);
        });
        debug!("refreshed {} data point(s) for {}", status.dps.len(), self.id);
        Ok(status)
    }

    /// Write one or more data points. `dps` must be a JSON object mapping
    /// DP ids to values; the written values are merged into the cache once
    /// the device acknowledges.
    pub async fn set_dps(&self, dps: Value) -> Result<TuyaMessage> {
        let dps_map = dps
            .as_object()
            .cloned()
            .ok_or_else(|| TuyaError::Json("dps must be a JSON object".into()))?;

        let timestamp = unix_timestamp();
        let payload = json!({
            "devId": self.id,
            "uid": self.id,
            "t": timestamp.to_string(),
            "dps": dps,
        });

        let conn = self.connection.clone();
        let response = retry(&self.retry_policy, move || {
            let conn = conn.clone();
            let payload = payload.clone();
            async move {
                conn.send(TuyaMessage::with_json(CommandType::Control, &payload)?)
                    .await
            }
        })
        .await?;

        self.status_tx
            .send_modify(|cached| cached.merge(&dps_map, Some(timestamp)));
        Ok(response)
    }

    /// Write a single data point by id.
    pub async fn set_dp(&self, dp_id: &str, value: Value) -> Result<TuyaMessage> {
        self.set_dps(json!({ dp_id: value })).await
    }

    /// Write a single data point by numeric index.
    pub async fn set_value<V: Into<Value>>(&self, index: u32, value: V) -> Result<TuyaMessage> {
        let value: Value = value.into();
        self.set_dps(json!({ index.to_string(): value })).await
    }

    /// Merge an unsolicited status payload into the cache, best effort.
    fn apply_status_payload(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        match DpsStatus::parse(payload) {
            Ok(status) => {
                debug!(
                    "status push for {}: {} data point(s)",
                    self.id,
                    status.dps.len()
                );
                self.status_tx.send_modify(|cached| {
                    for (k, v) in &status.dps {
                        cached.dps.insert(k.clone(), v.clone());
                    }
                    cached.updated_at = status.updated_at.or(cached.updated_at);
                });
            }
            Err(e) => debug!("ignoring unparsable status push for {}: {}", self.id, e),
        }
    }

    async fn run_status_listener(self, token: CancellationToken) {
        let mut rx = self.connection.subscribe();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                res = rx.recv() => {
                    match res {
                        Ok(msg) => self.apply_status_payload(&msg.payload),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("status listener for {} lagged, {} push(es) dropped", self.id, skipped);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!("status listener for {} stopped", self.id);
    }

    /// Watches the connection state and schedules one reconnect attempt per
    /// failure. The next failure transition reschedules, so attempts never
    /// pile up.
    async fn run_reconnect_monitor(self, delay: Duration, token: CancellationToken) {
        let mut state_rx = self.connection.state();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let failed = matches!(*state_rx.borrow_and_update(), ConnectionState::Failed(_));
                    if !failed {
                        continue;
                    }
                    debug!("device {} failed, reconnecting in {:?}", self.id, delay);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                    if self.connection.is_connected() {
                        continue;
                    }
                    match self.connection.connect().await {
                        Ok(()) => info!("device {} reconnected", self.id),
                        Err(e) => warn!("reconnect to {} failed: {}", self.id, e),
                    }
                }
            }
        }
        debug!("reconnect monitor for {} stopped", self.id);
    }

    async fn run_status_poller(self, poll_interval: Duration, token: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.connection.is_connected() {
                        continue;
                    }
                    if let Err(e) = self.refresh().await {
                        warn!("status poll for {} failed: {}", self.id, e);
                    }
                }
            }
        }
        debug!("status poller for {} stopped", self.id);
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
