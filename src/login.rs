//! The client side of the Login state: authentication, encryption and
//! compression, ending with the client in Configuration (or Play on
//! versions without a configuration phase).

use crate::{
    auth::{self, AuthError, GameProfile, KeyPair},
    connection::{Connection, ConnectionError},
    hooks::LoginDecision,
    protocol::{
        packet::{EncryptionRequest, LoginSuccess, SetCompression},
        Capability, CipherError, ConnectionState, EncryptionKey, Packet, ProtocolError,
    },
    proxy::ProxyContext,
};
use tokio::time::timeout;

const VERIFY_TOKEN_LENGTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("invalid username {0:?}")]
    InvalidUsername(String),
    #[error("verify token did not match")]
    VerifyTokenMismatch,
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("bad shared secret: {0}")]
    SharedSecret(#[from] CipherError),
    #[error("login denied: {0}")]
    Denied(String),
    #[error("{0} is already connected")]
    AlreadyConnected(String),
    #[error("login timed out")]
    TimedOut,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<ProtocolError> for LoginError {
    fn from(error: ProtocolError) -> Self {
        LoginError::Connection(error.into())
    }
}

impl LoginError {
    /// What the player is told before being disconnected.
    pub fn disconnect_message(&self) -> String {
        match self {
            LoginError::InvalidUsername(_) => "Invalid username".to_owned(),
            LoginError::VerifyTokenMismatch | LoginError::SharedSecret(_) => {
                "Failed to establish an encrypted connection".to_owned()
            }
            LoginError::Authentication(AuthError::Http(_)) => {
                "Authentication servers are down. Please try again later, sorry!".to_owned()
            }
            LoginError::Authentication(_) => "Failed to verify username!".to_owned(),
            LoginError::Denied(reason) => reason.clone(),
            LoginError::AlreadyConnected(_) => "You are already connected to this proxy!".to_owned(),
            LoginError::TimedOut => "Timed out".to_owned(),
            LoginError::Connection(e) => format!("Protocol error: {e}"),
        }
    }
}

/// Runs the login sequence on a client connection that has just moved
/// to the Login state.
pub(crate) async fn login(
    ctx: &ProxyContext,
    connection: &mut Connection,
) -> Result<GameProfile, LoginError> {
    timeout(ctx.config().login_timeout(), negotiate(ctx, connection))
        .await
        .map_err(|_| LoginError::TimedOut)?
}

async fn negotiate(
    ctx: &ProxyContext,
    connection: &mut Connection,
) -> Result<GameProfile, LoginError> {
    let start = match connection.read_known("LoginStart").await? {
        Packet::LoginStart(start) => start,
        other => return Err(unexpected("LoginStart", &other)),
    };
    if !auth::is_valid_username(&start.username) {
        return Err(LoginError::InvalidUsername(start.username));
    }

    let profile = match ctx.key_pair() {
        Some(key_pair) => authenticate(ctx, connection, key_pair, &start.username).await?,
        None => GameProfile::offline(&start.username),
    };
    if ctx.sessions().is_connected(&profile) {
        return Err(LoginError::AlreadyConnected(profile.name));
    }
    if let LoginDecision::Denied(reason) = ctx.hooks().on_login(&profile, connection.version()) {
        return Err(LoginError::Denied(reason));
    }

    if let Some(threshold) = ctx.settings().compression_threshold {
        connection
            .write_packet(SetCompression {
                threshold: i32::try_from(threshold.get()).unwrap_or(i32::MAX),
            })
            .await?;
        connection.enable_compression(threshold)?;
    }
    connection
        .write_packet(LoginSuccess {
            uuid: profile.id,
            username: profile.name.clone(),
            properties: profile.properties.clone(),
            strict_error_handling: false,
        })
        .await?;

    if connection.version().supports(Capability::ConfigurationState) {
        match connection.read_known("LoginAcknowledged").await? {
            Packet::LoginAcknowledged(_) => {}
            other => return Err(unexpected("LoginAcknowledged", &other)),
        }
        connection.set_state(ConnectionState::Configuration)?;
    } else {
        connection.set_state(ConnectionState::Play)?;
    }

    tracing::info!(
        "{} ({}) logged in from {:?} using {}",
        profile.name,
        profile.id,
        connection.peer_address(),
        connection.version()
    );
    Ok(profile)
}

/// The online-mode key exchange, followed by the session server check.
async fn authenticate(
    ctx: &ProxyContext,
    connection: &mut Connection,
    key_pair: &KeyPair,
    username: &str,
) -> Result<GameProfile, LoginError> {
    let verify_token: [u8; VERIFY_TOKEN_LENGTH] = rand::random();
    connection
        .write_packet(EncryptionRequest {
            server_id: String::new(),
            public_key: key_pair.public_key_der().to_vec(),
            verify_token: verify_token.to_vec(),
            should_authenticate: true,
        })
        .await?;

    let response = match connection.read_known("EncryptionResponse").await? {
        Packet::EncryptionResponse(response) => response,
        other => return Err(unexpected("EncryptionResponse", &other)),
    };
    let token = key_pair
        .decrypt(&response.verify_token)
        .map_err(|_| LoginError::VerifyTokenMismatch)?;
    if token != verify_token {
        return Err(LoginError::VerifyTokenMismatch);
    }
    let shared_secret = key_pair.decrypt(&response.shared_secret)?;
    connection.enable_encryption(EncryptionKey::from_slice(&shared_secret)?)?;

    let hash = auth::server_hash("", &shared_secret, key_pair.public_key_der());
    let profile = ctx.authenticator().authenticate(username, &hash).await?;
    tracing::debug!("{username} authenticated as {}", profile.id);
    Ok(profile)
}

fn unexpected(expected: &'static str, got: &Packet) -> LoginError {
    ProtocolError::UnexpectedPacket {
        expected,
        got: got.kind().as_ref().to_owned(),
    }
    .into()
}
