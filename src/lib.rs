//! A reverse proxy for Minecraft: Java Edition.
//!
//! Clients connect to the proxy, which logs them in and relays their
//! packets to one of a pool of backend servers. A player can be moved
//! between backends without disconnecting.
//!
//! # Connection lifecycle
//! A client connection starts in the Handshake state. Status pings are
//! answered by the proxy itself. Logins are handled by the proxy as well,
//! including encryption and compression when enabled, after which the
//! client gets a [`Session`](session::Session).
//!
//! The session's first backend is the first server in the `try` list that
//! accepts the player. The proxy connects to backends as an offline-mode
//! client carrying the player's name and UUID.
//!
//! # Switching backends
//! On versions with a configuration phase (1.20.2 and later), the client is
//! sent back into configuration, the new backend configures it, and it
//! returns to play. Older clients are re-homed by forwarding the new
//! backend's join packet. Either way the previous backend stays connected
//! until the new one is ready, so a failed switch leaves the player where
//! they were. See [`switch`].
//!
//! Backends can request switches themselves over the
//! [control channel](control_channel).

pub mod auth;
pub mod config;
pub mod connection;
pub mod control_channel;
pub mod hooks;
mod login;
mod pipeline;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod session;
mod status;
pub mod switch;
pub mod transport;

pub use config::ProxyConfig;
pub use login::LoginError;
pub use proxy::{ProxyBuilder, ProxyContext};
pub use switch::{initiate_switch, SwitchError};
