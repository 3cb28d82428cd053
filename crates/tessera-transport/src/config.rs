use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::bitrate::BitratePolicy;
use crate::crypto::{parse_key, PrivateKey};
use crate::error::{Result, TransportError};
use crate::wire::{PacketType, MAX_PAYLOAD_SIZE};

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 32262;

// ─── Input (as written in TOML) ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfigInput {
    pub version: u32,
    pub connection: ConnectionConfigInput,
    pub nack_buffers: Option<Vec<NackBufferConfigInput>>,
    pub receiver: ReceiverConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionConfigInput {
    pub port: Option<u16>,
    pub destination: Option<String>,
    pub stun: Option<String>,
    pub recv_timeout_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    pub stun_timeout_ms: Option<u64>,
    /// 32 hex characters.
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NackBufferConfigInput {
    pub packet_type: PacketType,
    pub max_payload_size: usize,
    pub num_buffers: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverConfigInput {
    pub ring_size: Option<usize>,
    pub frame_queue_capacity: Option<usize>,
    pub nack_interval_ms: Option<u64>,
    pub statistics_period_ms: Option<u64>,
    pub adapt_bitrate: Option<bool>,
    pub bitrate_policy: Option<BitratePolicy>,
}

// ─── Resolved ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Public port the server listens on or the client dials.
    pub port: u16,
    /// Server address; clients only.
    pub destination: Option<Ipv4Addr>,
    /// Rendezvous server; direct connection when absent.
    pub stun: Option<SocketAddr>,
    /// Read timeout once connected.
    pub recv_timeout: Duration,
    pub connection_timeout: Duration,
    pub stun_timeout: Duration,
    pub key: PrivateKey,
}

impl ConnectionConfig {
    /// Direct-connection settings with default timeouts.
    pub fn new(key: PrivateKey) -> Self {
        ConnectionConfig {
            port: DEFAULT_PORT,
            destination: None,
            stun: None,
            recv_timeout: Duration::from_millis(5),
            connection_timeout: Duration::from_secs(5),
            stun_timeout: Duration::from_secs(5),
            key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackBufferConfig {
    pub packet_type: PacketType,
    pub max_payload_size: usize,
    pub num_buffers: usize,
}

impl NackBufferConfig {
    pub fn defaults() -> Vec<NackBufferConfig> {
        vec![
            NackBufferConfig {
                packet_type: PacketType::Video,
                max_payload_size: 1 << 20,
                num_buffers: 25,
            },
            NackBufferConfig {
                packet_type: PacketType::Audio,
                max_payload_size: 4096,
                num_buffers: 256,
            },
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub ring_size: usize,
    pub frame_queue_capacity: usize,
    pub nack_interval: Duration,
    pub statistics_period: Duration,
    /// Run the bitrate controller and report settings to the peer.
    pub adapt_bitrate: bool,
    pub bitrate_policy: BitratePolicy,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            ring_size: 275,
            frame_queue_capacity: 32,
            nack_interval: Duration::from_millis(10),
            statistics_period: Duration::from_secs(1),
            adapt_bitrate: false,
            bitrate_policy: BitratePolicy::RatioEwma,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub version: u32,
    pub connection: ConnectionConfig,
    pub nack_buffers: Vec<NackBufferConfig>,
    pub receiver: ReceiverConfig,
}

impl NodeConfigInput {
    pub fn resolve(self) -> Result<NodeConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(TransportError::Config(format!("unsupported config version {version}")));
        }

        let conn = self.connection;
        let key = match conn.key.as_deref() {
            Some(k) => parse_key(k)?,
            None => return Err(TransportError::Config("connection.key is required".into())),
        };
        let mut connection = ConnectionConfig::new(key);
        if let Some(port) = conn.port {
            if port == 0 {
                return Err(TransportError::Config("connection.port must be non-zero".into()));
            }
            connection.port = port;
        }
        connection.destination = conn
            .destination
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| {
                d.parse::<Ipv4Addr>()
                    .map_err(|e| TransportError::Config(format!("connection.destination {d:?}: {e}")))
            })
            .transpose()?;
        connection.stun = conn
            .stun
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<SocketAddr>()
                    .map_err(|e| TransportError::Config(format!("connection.stun {s:?}: {e}")))
            })
            .transpose()?;
        if let Some(ms) = conn.recv_timeout_ms {
            connection.recv_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = conn.connection_timeout_ms {
            connection.connection_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = conn.stun_timeout_ms {
            connection.stun_timeout = Duration::from_millis(ms.max(1));
        }

        let nack_buffers = match self.nack_buffers {
            None => NackBufferConfig::defaults(),
            Some(list) => {
                let mut seen = HashSet::new();
                let mut out = Vec::new();
                for buf in list {
                    if !seen.insert(buf.packet_type) {
                        return Err(TransportError::Config(format!(
                            "duplicate nack buffer for {:?}",
                            buf.packet_type
                        )));
                    }
                    if buf.num_buffers == 0 {
                        return Err(TransportError::Config("nack_buffers.num_buffers must be non-zero".into()));
                    }
                    // control messages always travel as a single fragment
                    if buf.packet_type == PacketType::Message && buf.max_payload_size > MAX_PAYLOAD_SIZE {
                        return Err(TransportError::Config(format!(
                            "message nack buffer max_payload_size must be at most {MAX_PAYLOAD_SIZE}"
                        )));
                    }
                    out.push(NackBufferConfig {
                        packet_type: buf.packet_type,
                        max_payload_size: buf.max_payload_size,
                        num_buffers: buf.num_buffers,
                    });
                }
                out
            }
        };

        let defaults = ReceiverConfig::default();
        let r = self.receiver;
        let receiver = ReceiverConfig {
            ring_size: r.ring_size.unwrap_or(defaults.ring_size).max(1),
            frame_queue_capacity: r.frame_queue_capacity.unwrap_or(defaults.frame_queue_capacity).max(1),
            nack_interval: r
                .nack_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.nack_interval),
            statistics_period: r
                .statistics_period_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(defaults.statistics_period),
            adapt_bitrate: r.adapt_bitrate.unwrap_or(defaults.adapt_bitrate),
            bitrate_policy: r.bitrate_policy.unwrap_or(defaults.bitrate_policy),
        };

        Ok(NodeConfig {
            version,
            connection,
            nack_buffers,
            receiver,
        })
    }
}

impl NodeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let parsed: NodeConfigInput = toml::from_str(input)
            .map_err(|e| TransportError::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }
}
