use minecraft_relay_macros::{Decode, Encode};

/// Clientbound join packet. The proxy only needs to recognize it
/// (it marks a backend as ready on versions without a configuration
/// phase), so the body is carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct JoinGame {
    #[encoding(length_prefix = "inferred")]
    pub data: Vec<u8>,
}

/// Clientbound, 1.20.2+. Moves the client from Play back to Configuration.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StartConfiguration;

/// Serverbound reply to [`StartConfiguration`].
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AcknowledgeConfiguration;
