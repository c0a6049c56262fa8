//! Player identity: offline UUIDs, the login key exchange and the
//! session server check used in online mode.

use crate::protocol::packet::ProfileProperty;
use futures::future::BoxFuture;
use md5::Md5;
use num_bigint::BigInt;
use rsa::{pkcs8::EncodePublicKey, Pkcs1v15Encrypt, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use uuid::Uuid;

pub const MOJANG_SESSION_SERVER: &str = "https://sessionserver.mojang.com";

const KEY_BITS: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("the session server did not confirm the login")]
    NotAuthenticated,
    #[error("session server request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RSA failure: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("failed to encode the public key: {0}")]
    PublicKey(#[from] rsa::pkcs8::spki::Error),
}

/// A player's identity as the backends will see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameProfile {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub properties: Vec<ProfileProperty>,
}

impl GameProfile {
    /// Profile of an unauthenticated player.
    pub fn offline(name: &str) -> Self {
        Self {
            id: offline_uuid(name),
            name: name.to_owned(),
            properties: Vec::new(),
        }
    }
}

/// The UUID vanilla servers give players in offline mode:
/// a name-based (version 3) UUID of `OfflinePlayer:<name>`.
pub fn offline_uuid(name: &str) -> Uuid {
    let digest = Md5::digest(format!("OfflinePlayer:{name}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    uuid::Builder::from_md5_bytes(bytes).into_uuid()
}

/// Whether `name` is a valid player name: 1 to 16 ASCII letters, digits or underscores.
pub fn is_valid_username(name: &str) -> bool {
    (1..=16).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// The proxy's RSA key pair, generated once at start-up.
pub struct KeyPair {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl KeyPair {
    pub fn generate() -> Result<Self, AuthError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)?;
        let public_der = private.to_public_key().to_public_key_der()?.into_vec();
        Ok(Self {
            private,
            public_der,
        })
    }

    /// The public key in X.509 SubjectPublicKeyInfo DER, as sent to clients.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(self.private.decrypt(Pkcs1v15Encrypt, ciphertext)?)
    }
}

/// The "server id" hash both sides send to the session server.
pub fn server_hash(server_id: &str, shared_secret: &[u8], public_key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_id.as_bytes());
    hasher.update(shared_secret);
    hasher.update(public_key);
    hex_digest(&hasher.finalize())
}

/// Formats a digest as a signed two's-complement number in hex,
/// which is how the game formats SHA-1 digests.
fn hex_digest(digest: &[u8]) -> String {
    BigInt::from_signed_bytes_be(digest).to_str_radix(16)
}

/// Confirms with a session server that a client joined with the given hash.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate<'a>(
        &'a self,
        username: &'a str,
        server_hash: &'a str,
    ) -> BoxFuture<'a, Result<GameProfile, AuthError>>;
}

/// Authenticates against Mojang's session server.
pub struct MojangAuthenticator {
    client: reqwest::Client,
    base_url: String,
}

impl MojangAuthenticator {
    pub fn new() -> Self {
        Self::with_base_url(MOJANG_SESSION_SERVER)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for MojangAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for MojangAuthenticator {
    fn authenticate<'a>(
        &'a self,
        username: &'a str,
        server_hash: &'a str,
    ) -> BoxFuture<'a, Result<GameProfile, AuthError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!("{}/session/minecraft/hasJoined", self.base_url))
                .query(&[("username", username), ("serverId", server_hash)])
                .send()
                .await?
                .error_for_status()?;
            // An empty 204 means the client never joined.
            if response.status() == reqwest::StatusCode::NO_CONTENT {
                return Err(AuthError::NotAuthenticated);
            }
            Ok(response.json::<GameProfile>().await?)
        })
    }
}
