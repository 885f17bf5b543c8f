//! Shareable room links
//!
//! Link format: raidroom://<host>:<port>/room/<room-id>

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use raidroom_core::RoomId;

use crate::error::{Error, Result};

const SCHEME: &str = "raidroom://";

/// Where a room lives and which one it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomLink {
    pub host: IpAddr,
    pub port: u16,
    pub room_id: RoomId,
}

impl RoomLink {
    pub fn new(addr: SocketAddr, room_id: RoomId) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
            room_id,
        }
    }

    /// Get the socket address for connection
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn to_url(&self) -> String {
        format!("{}{}/room/{}", SCHEME, self.socket_addr(), self.room_id)
    }

    /// Parse from URL string
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .trim()
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::Protocol("Invalid room link: missing raidroom:// prefix".into()))?;

        let (host_port, path) = rest.split_once('/').ok_or_else(|| {
            Error::Protocol("Invalid room link: expected host:port/room/<id>".into())
        })?;

        let addr: SocketAddr = host_port.parse().map_err(|_| {
            Error::Protocol(format!("Invalid room link: bad address '{}'", host_port))
        })?;

        let id = path
            .strip_prefix("room/")
            .map(|id| id.trim_end_matches('/'))
            .ok_or_else(|| Error::Protocol(format!("Invalid room link: bad path '{}'", path)))?;

        let room_id = RoomId::from_str(id)
            .map_err(|_| Error::Protocol(format!("Invalid room link: bad room id '{}'", id)))?;

        Ok(Self::new(addr, room_id))
    }
}

impl std::fmt::Display for RoomLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_url())
    }
}

impl FromStr for RoomLink {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_link_format() {
        let room_id: RoomId = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        let link = RoomLink::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)), 7331),
            room_id,
        );

        assert_eq!(
            link.to_string(),
            "raidroom://192.168.1.100:7331/room/550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(RoomLink::parse(&link.to_url()).unwrap(), link);
    }

    #[test]
    fn test_link_parse_ipv6_and_trailing_slash() {
        let link: RoomLink = "raidroom://[::1]:7331/room/550e8400-e29b-41d4-a716-446655440000/"
            .parse()
            .unwrap();

        assert_eq!(link.port, 7331);
        assert!(link.host.is_loopback());
    }

    #[test]
    fn test_link_parse_invalid() {
        assert!(RoomLink::parse("http://127.0.0.1:7331/room/abc").is_err());
        assert!(RoomLink::parse("raidroom://127.0.0.1:7331").is_err());
        assert!(RoomLink::parse("raidroom://localhost:7331/room/550e8400-e29b-41d4-a716-446655440000").is_err());
        assert!(RoomLink::parse("raidroom://127.0.0.1:7331/hall/550e8400-e29b-41d4-a716-446655440000").is_err());
        assert!(RoomLink::parse("raidroom://127.0.0.1:7331/room/not-a-uuid").is_err());
    }
}
