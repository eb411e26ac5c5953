//! Peer discovery over UDP multicast.
//!
//! The beacon announces this node's endpoints to the discovery group on a
//! fixed interval and listens for everyone else's announces. Peers that go
//! quiet for `interval * expiration_factor` are evicted. Joins and leaves
//! are reported to a `Locator`.

use std::net::SocketAddr;

use tether_core::WireError;

pub mod beacon;
pub mod peers;

pub use beacon::Beacon;
pub use peers::PeerTable;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("interface {0:?} not found")]
    UnknownInterface(String),
    #[error("cannot build announce: {0}")]
    Announce(#[from] WireError),
}

/// Get the OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32, DiscoveryError> {
    let name_cstr = std::ffi::CString::new(name)
        .map_err(|_| DiscoveryError::UnknownInterface(name.to_string()))?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        return Err(DiscoveryError::UnknownInterface(name.to_string()));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_is_an_error() {
        assert!(matches!(
            if_index("tether-no-such0"),
            Err(DiscoveryError::UnknownInterface(_))
        ));
        assert!(if_index("bad\0name").is_err());
    }
}
