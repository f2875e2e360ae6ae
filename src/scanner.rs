//! UDP-based device discovery.
//! Listens for Tuya broadcast announcements and decodes device information
//! using the fixed discovery key.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::protocol::{MessageCodec, Version};
use futures_core::stream::Stream;
use log::{debug, warn};
use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Well-known key for discovery broadcasts, always MD5-normalized.
pub const UDP_DISCOVERY_KEY: &str = "yGAdlopoPVldABfn";

const DEFAULT_PORTS: [u16; 3] = [6666, 6667, 7000];

/// Information decoded from one discovery broadcast.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Device IP address
    pub ip: String,
    /// Gateway / device id
    pub gw_id: String,
    /// Product key, when announced
    pub product_key: Option<String>,
    /// Protocol version
    pub version: Version,
    /// Whether the device expects encrypted traffic
    pub encrypt: bool,
    /// Whether the device is activated
    pub active: bool,
}

/// Scanner discovers Tuya devices on the local network by listening for
/// their periodic UDP broadcasts on ports 6666, 6667, and 7000.
#[derive(Clone)]
pub struct Scanner {
    /// How long one scan runs
    pub timeout: Duration,
    /// Local address to bind to
    pub bind_addr: String,
    /// UDP ports to listen on
    pub ports: Vec<u16>,
    codec: Arc<MessageCodec>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    /// Create a Scanner with default settings.
    pub fn new() -> Self {
        let cipher = TuyaCipher::new(UDP_DISCOVERY_KEY, true);
        Self {
            timeout: Duration::from_secs(10),
            bind_addr: "0.0.0.0".to_string(),
            ports: DEFAULT_PORTS.to_vec(),
            codec: Arc::new(MessageCodec::new(Version::V3_3, Some(cipher))),
        }
    }

    /// Set the scan timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the ports to listen on.
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// Set the local bind address.
    pub fn with_bind_addr<A: Into<String>>(mut self, bind_addr: A) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    /// Listen until the timeout elapses and return every device heard,
    /// deduplicated by source IP.
    pub async fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        debug!(
            "starting scan (addr: {}, ports: {:?}, timeout: {:?})",
            self.bind_addr, self.ports, self.timeout
        );
        let (mut rx, cancel) = self.spawn_listeners()?;

        let mut found: HashMap<IpAddr, DiscoveredDevice> = HashMap::new();
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => break,
                recv = rx.recv() => {
                    let Some((data, addr)) = recv else { break };
                    if let Some(device) = self.parse_datagram(&data, addr.ip()) {
                        found.entry(addr.ip()).or_insert(device);
                    }
                }
            }
        }

        cancel.cancel();
        let devices: Vec<_> = found.into_values().collect();
        debug!("scan finished, {} device(s) found", devices.len());
        Ok(devices)
    }

    /// Devices as they are heard, ending when the timeout elapses.
    pub fn scan_stream(&self) -> impl Stream<Item = DiscoveredDevice> + Send + 'static {
        let scanner = self.clone();
        async_stream::stream! {
            let Ok((mut rx, cancel)) = scanner.spawn_listeners() else {
                return;
            };
            let mut seen: HashMap<IpAddr, ()> = HashMap::new();
            let deadline = Instant::now() + scanner.timeout;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let received = tokio::select! {
                    _ = tokio::time::sleep(remaining) => break,
                    recv = rx.recv() => recv,
                };
                let Some((data, addr)) = received else { break };
                if seen.contains_key(&addr.ip()) {
                    continue;
                }
                if let Some(device) = scanner.parse_datagram(&data, addr.ip()) {
                    seen.insert(addr.ip(), ());
                    yield device;
                }
            }
            cancel.cancel();
        }
    }

    /// Bind every configured port and fan received datagrams into one
    /// channel. Ports that fail to bind are skipped with a warning; at
    /// least one must succeed.
    fn spawn_listeners(
        &self,
    ) -> Result<(mpsc::Receiver<(Vec<u8>, SocketAddr)>, CancellationToken)> {
        let mut sockets = Vec::new();
        for &port in &self.ports {
            match self.create_socket(port) {
                Ok(s) => sockets.push(Arc::new(s)),
                Err(e) => warn!("failed to listen on port {}: {}", port, e),
            }
        }
        if sockets.is_empty() {
            return Err(TuyaError::Io("no discovery port could be bound".into()));
        }

        let (tx, rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(64);
        let cancel = CancellationToken::new();

        for socket in sockets {
            tokio::spawn(pump_datagrams(socket, tx.clone(), cancel.clone()));
        }

        Ok((rx, cancel))
    }

    fn create_socket(&self, port: u16) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|e| TuyaError::Io(format!("bad bind address: {}", e)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Decode one broadcast datagram. Failures are logged and swallowed so
    /// a single noisy packet never aborts the scan.
    fn parse_datagram(&self, data: &[u8], src: IpAddr) -> Option<DiscoveredDevice> {
        let msg = match self.codec.decode(data, None) {
            Ok(m) => m,
            Err(e) => {
                debug!("ignoring undecodable datagram from {}: {}", src, e);
                return None;
            }
        };

        let val: Value = match serde_json::from_slice(&msg.payload) {
            Ok(v) => v,
            Err(e) => {
                debug!("ignoring non-JSON announcement from {}: {}", src, e);
                return None;
            }
        };

        let Some(gw_id) = val.get("gwId").and_then(|v| v.as_str()) else {
            debug!("announcement from {} carries no gwId", src);
            return None;
        };

        let version = match val.get("version").and_then(|v| v.as_str()) {
            Some(s) => match Version::from_str(s) {
                Ok(v) => v,
                Err(_) => {
                    debug!("device {} announces unsupported version {}", gw_id, s);
                    return None;
                }
            },
            None => match sniff_version(data) {
                Some(v) => v,
                None => {
                    debug!("device {} sniffed as unsupported version", gw_id);
                    return None;
                }
            },
        };

        let ip = val
            .get("ip")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| src.to_string());

        Some(DiscoveredDevice {
            ip,
            gw_id: gw_id.to_string(),
            product_key: val
                .get("productKey")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            version,
            encrypt: val.get("encrypt").and_then(|v| v.as_bool()).unwrap_or(false),
            active: match val.get("active") {
                Some(Value::Bool(b)) => *b,
                Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
                _ => false,
            },
        })
    }
}

/// Forwards datagrams from one bound socket into the shared scan channel
/// until the scan is cancelled or every receiver is gone.
async fn pump_datagrams(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    token: CancellationToken,
) {
    let mut buf = [0u8; 4096];
    while !token.is_cancelled() {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            res = socket.recv_from(&mut buf) => res,
        };
        let Ok((len, addr)) = received else { break };
        if tx.send((buf[..len].to_vec(), addr)).await.is_err() {
            break;
        }
    }
}

/// Byte-pattern version sniff for announcements without a `version` field.
/// "3.5" yields `None` (unsupported); nothing found defaults to 3.3.
fn sniff_version(data: &[u8]) -> Option<Version> {
    for window in data.windows(3) {
        match window {
            b"3.1" => return Some(Version::V3_1),
            b"3.2" => return Some(Version::V3_2),
            b"3.3" => return Some(Version::V3_3),
            b"3.4" => return Some(Version::V3_4),
            b"3.5" => return None,
            _ => {}
        }
    }
    Some(Version::V3_3)
}
