/// Core identity types shared by every coordination component.
use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of the default room every server hosts.
pub const MAIN_HALL_PREFIX: &str = "MainHall-";

/// Immutable description of one server in the static configuration.
///
/// Equality compares id, address and both ports, which is what makes
/// "is the leader me?" checks robust against a stale descriptor that happens
/// to reuse an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Globally unique id, e.g. `s3`.
    pub server_id: String,
    /// Host name or IP address.
    pub address: String,
    /// Port serving chat clients.
    pub client_port: u16,
    /// Port serving peer coordination traffic.
    pub coordination_port: u16,
    /// Election priority derived from the id suffix (higher is more senior).
    pub priority: u32,
}

impl ServerDescriptor {
    /// Build a descriptor, deriving the priority from `server_id`.
    pub fn new(
        server_id: impl Into<String>,
        address: impl Into<String>,
        client_port: u16,
        coordination_port: u16,
    ) -> MeshResult<Self> {
        let server_id = server_id.into();
        let priority = parse_priority(&server_id)?;
        Ok(Self {
            server_id,
            address: address.into(),
            client_port,
            coordination_port,
            priority,
        })
    }

    /// `host:port` of the coordination listener.
    pub fn coordination_addr(&self) -> String {
        format!("{}:{}", self.address, self.coordination_port)
    }

    /// Name of this server's main hall room.
    pub fn main_hall(&self) -> String {
        main_hall(&self.server_id)
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.server_id, self.coordination_addr())
    }
}

/// Parse the election priority from the trailing digits of a server id.
///
/// `s12` has priority 12. Ids without trailing digits are rejected.
pub fn parse_priority(server_id: &str) -> MeshResult<u32> {
    let digits_start = server_id
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)
        .ok_or_else(|| MeshError::InvalidServerId(server_id.to_string()))?;

    server_id[digits_start..]
        .parse()
        .map_err(|_| MeshError::InvalidServerId(server_id.to_string()))
}

/// Name of the main hall hosted by `server_id`.
pub fn main_hall(server_id: &str) -> String {
    format!("{}{}", MAIN_HALL_PREFIX, server_id)
}
