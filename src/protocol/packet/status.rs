use minecraft_relay_macros::{Decode, Encode};

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StatusRequest;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StatusResponse {
    pub json: String,
}

/// Ping and pong share a shape; the server echoes the payload back.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StatusPing {
    pub payload: i64,
}
