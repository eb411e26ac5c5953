//! Tether discovery wire format.
//!
//! An announce datagram is a fixed `AnnounceHeader` followed by
//! `endpoint_count` fixed-size `EndpointRecord`s. Multi-byte integers are
//! carried in network byte order, so every type here is `Unaligned` and
//! can be read straight out of a receive buffer with zerocopy.
//!
//! The layout is private to tether nodes. It carries exactly two things:
//! who is announcing, and where that node can be reached.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use rand::RngCore;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Node identity ─────────────────────────────────────────────────────────────

/// Opaque 16-byte node identity, stable for the lifetime of a process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    /// A fresh random identity.
    pub fn random() -> Self {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Derive an identity from a node name. The same name always yields the
    /// same id, so a named node keeps its identity across restarts.
    pub fn from_name(name: &str) -> Self {
        let hash = blake3::hash(name.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&hash.as_bytes()[..16]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| WireError::InvalidNodeId(s.to_string()))?;
        let id: [u8; 16] = bytes
            .try_into()
            .map_err(|_| WireError::InvalidNodeId(s.to_string()))?;
        Ok(Self(id))
    }
}

// ── Announce header ───────────────────────────────────────────────────────────

/// Fixed prefix of every announce datagram.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct AnnounceHeader {
    /// Always `ANNOUNCE_MAGIC`. Anything else on the discovery port is noise.
    pub magic: [u8; 4],

    /// Datagram format version. Currently `ANNOUNCE_VERSION`.
    pub version: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Number of `EndpointRecord`s following the header.
    pub endpoint_count: U16<NetworkEndian>,

    /// Identity of the announcing node.
    pub node_id: [u8; 16],
}

assert_eq_size!(AnnounceHeader, [u8; 24]);

/// One reachable endpoint of the announcing node.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct EndpointRecord {
    /// IPv6 address, or an IPv4 address in the first four bytes
    /// (remaining twelve zero) when `family == 4`.
    pub addr: [u8; 16],

    pub port: U16<NetworkEndian>,

    /// 4 or 6.
    pub family: u8,

    /// Reserved, must be zero.
    pub reserved: u8,
}

assert_eq_size!(EndpointRecord, [u8; 20]);

impl EndpointRecord {
    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        let mut bytes = [0u8; 16];
        let family = match addr.ip() {
            IpAddr::V4(v4) => {
                bytes[..4].copy_from_slice(&v4.octets());
                4
            }
            IpAddr::V6(v6) => {
                bytes.copy_from_slice(&v6.octets());
                6
            }
        };
        Self {
            addr: bytes,
            port: U16::new(addr.port()),
            family,
            reserved: 0,
        }
    }

    pub fn to_socket_addr(&self) -> Result<SocketAddr, WireError> {
        let ip = match self.family {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.addr[..4]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => IpAddr::V6(Ipv6Addr::from(self.addr)),
            other => {
                return Err(WireError::MalformedAnnounce(format!(
                    "unknown address family {other}"
                )))
            }
        };
        Ok(SocketAddr::new(ip, self.port.get()))
    }
}

// ── Announce ──────────────────────────────────────────────────────────────────

/// A decoded announce: who is speaking and where they listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub node_id: NodeId,
    pub endpoints: Vec<SocketAddr>,
}

impl Announce {
    pub fn new(node_id: NodeId, endpoints: Vec<SocketAddr>) -> Self {
        Self { node_id, endpoints }
    }

    /// Serialize into a single datagram.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.endpoints.len() > MAX_ANNOUNCE_ENDPOINTS {
            return Err(WireError::TooManyEndpoints(self.endpoints.len()));
        }

        let header = AnnounceHeader {
            magic: ANNOUNCE_MAGIC,
            version: ANNOUNCE_VERSION,
            flags: 0,
            endpoint_count: U16::new(self.endpoints.len() as u16),
            node_id: self.node_id.0,
        };

        let mut out = Vec::with_capacity(
            ANNOUNCE_HEADER_SIZE + self.endpoints.len() * ENDPOINT_RECORD_SIZE,
        );
        out.extend_from_slice(header.as_bytes());
        for endpoint in &self.endpoints {
            out.extend_from_slice(EndpointRecord::from_socket_addr(endpoint).as_bytes());
        }
        Ok(out)
    }

    /// Parse a received datagram. Any structural inconsistency is reported
    /// as `MalformedAnnounce`; callers drop the datagram and move on.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let header = AnnounceHeader::read_from_prefix(datagram).ok_or_else(|| {
            WireError::MalformedAnnounce(format!("short datagram: {} bytes", datagram.len()))
        })?;

        if header.magic != ANNOUNCE_MAGIC {
            return Err(WireError::MalformedAnnounce("bad magic".into()));
        }
        if header.version != ANNOUNCE_VERSION {
            return Err(WireError::MalformedAnnounce(format!(
                "unknown version 0x{:02x}",
                header.version
            )));
        }
        if header.flags != 0 {
            return Err(WireError::MalformedAnnounce(format!(
                "reserved flags set: 0x{:02x}",
                header.flags
            )));
        }

        let count = header.endpoint_count.get() as usize;
        if count > MAX_ANNOUNCE_ENDPOINTS {
            return Err(WireError::MalformedAnnounce(format!(
                "endpoint count {count} exceeds {MAX_ANNOUNCE_ENDPOINTS}"
            )));
        }

        let body = &datagram[ANNOUNCE_HEADER_SIZE..];
        if body.len() != count * ENDPOINT_RECORD_SIZE {
            return Err(WireError::MalformedAnnounce(format!(
                "expected {} endpoint bytes, got {}",
                count * ENDPOINT_RECORD_SIZE,
                body.len()
            )));
        }

        let endpoints = body
            .chunks_exact(ENDPOINT_RECORD_SIZE)
            .map(|raw| {
                EndpointRecord::read_from(raw)
                    .ok_or_else(|| WireError::MalformedAnnounce("truncated endpoint".into()))?
                    .to_socket_addr()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            node_id: NodeId(header.node_id),
            endpoints,
        })
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

pub const ANNOUNCE_MAGIC: [u8; 4] = *b"TTHR";

pub const ANNOUNCE_VERSION: u8 = 0x01;

pub const ANNOUNCE_HEADER_SIZE: usize = std::mem::size_of::<AnnounceHeader>();

pub const ENDPOINT_RECORD_SIZE: usize = std::mem::size_of::<EndpointRecord>();

/// Upper bound on advertised endpoints; keeps a datagram well under 1500 bytes.
pub const MAX_ANNOUNCE_ENDPOINTS: usize = 64;

/// Largest datagram the receive loop will accept.
pub const MAX_DATAGRAM: usize = 65_507;

/// Default UDP port for discovery.
pub const DEFAULT_DISCOVERY_PORT: u16 = 10054;

/// Default multicast group announces are sent to.
pub const DEFAULT_MULTICAST_GROUP: &str = "239.255.0.1";

/// Default announce interval in milliseconds.
pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 5_000;

/// A peer is evicted after this many announce intervals of silence.
pub const DEFAULT_EXPIRATION_FACTOR: u32 = 3;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed announce: {0}")]
    MalformedAnnounce(String),

    #[error("too many endpoints to announce: {0} (max {})", MAX_ANNOUNCE_ENDPOINTS)]
    TooManyEndpoints(usize),

    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame payload of {0} bytes exceeds {}", crate::frame::MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
