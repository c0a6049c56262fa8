use minecraft_relay_macros::{Decode, Encode};

/// First packet of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Handshake {
    #[encoding(varint)]
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub intent: HandshakeIntent,
}

impl Handshake {
    /// The address the client typed, without Forge markers,
    /// forwarding payloads or a trailing dot.
    pub fn virtual_host(&self) -> &str {
        let host = self
            .server_address
            .split('\0')
            .next()
            .unwrap_or(&self.server_address);
        host.strip_suffix('.').unwrap_or(host)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Encode, Decode)]
#[encoding(discriminant = "varint")]
pub enum HandshakeIntent {
    #[encoding(id = 1)]
    Status,
    #[encoding(id = 2)]
    Login,
    /// Login after a server-initiated transfer.
    #[encoding(id = 3)]
    Transfer,
}

impl HandshakeIntent {
    pub fn id(self) -> i32 {
        match self {
            HandshakeIntent::Status => 1,
            HandshakeIntent::Login => 2,
            HandshakeIntent::Transfer => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_host_strips_markers() {
        let mut handshake = Handshake {
            protocol_version: 765,
            server_address: "play.example.com.\0FML3\0".into(),
            server_port: 25565,
            intent: HandshakeIntent::Login,
        };
        assert_eq!(handshake.virtual_host(), "play.example.com");
        handshake.server_address = "localhost".into();
        assert_eq!(handshake.virtual_host(), "localhost");
    }
}
