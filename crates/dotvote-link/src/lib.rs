//! Encrypted participant-link codec.
//!
//! Each session owns one symmetric key. A participant's voting link embeds
//! `(session_id, participant_id)` sealed with ChaCha20-Poly1305, so the
//! link authorizes exactly one participant in exactly one session and any
//! bit flip invalidates it. Keys are generated from the OS CSPRNG and are
//! never derived from session metadata.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use dotvote_protocol::{ParticipantId, SessionError, SessionId};

/// Key size for ChaCha20-Poly1305 (256-bit).
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305 (96-bit, random per token).
pub const NONCE_SIZE: usize = 12;

/// Per-session link key. Kept out of the session record on disk and out of
/// every log line; the redacting `Debug` impl is load-bearing.
#[derive(Clone)]
pub struct LinkKey([u8; KEY_SIZE]);

impl LinkKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Encoding used for the on-disk key file.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(encoded.trim()).ok()?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LinkKey(..)")
    }
}

/// The pair a valid token resolves to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkClaims {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
}

/// Seals and opens participant tokens under one session key.
///
/// Token layout: `<hint>.<sealed>` where `hint` is the base64url session id
/// and `sealed` is base64url(nonce || ciphertext) over the JSON claims with
/// the session id as associated data. The hint lets a caller locate the
/// session key without trial decryption; because it doubles as the AAD, a
/// tampered hint fails authentication like any other bit flip.
pub struct LinkCodec {
    cipher: ChaCha20Poly1305,
}

impl LinkCodec {
    pub fn new(key: &LinkKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    pub fn encode(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<String, SessionError> {
        let claims = LinkClaims {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
        };
        let plaintext = serde_json::to_vec(&claims)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: session_id.as_bytes(),
                },
            )
            .map_err(|_| SessionError::Persistence("failed to seal voting token".into()))?;
        let mut packet = Vec::with_capacity(NONCE_SIZE + sealed.len());
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(&sealed);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(session_id.as_bytes()),
            URL_SAFE_NO_PAD.encode(&packet)
        ))
    }

    /// Opens a token. Every failure mode collapses into `InvalidToken`:
    /// callers (and forgers probing the endpoint) cannot tell a malformed
    /// token from a wrong key from a failed authentication check.
    pub fn decode(&self, token: &str) -> Result<LinkClaims, SessionError> {
        let (hint, sealed) = token.split_once('.').ok_or(SessionError::InvalidToken)?;
        let session_hint = String::from_utf8(
            URL_SAFE_NO_PAD
                .decode(hint)
                .map_err(|_| SessionError::InvalidToken)?,
        )
        .map_err(|_| SessionError::InvalidToken)?;
        let packet = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|_| SessionError::InvalidToken)?;
        if packet.len() <= NONCE_SIZE {
            return Err(SessionError::InvalidToken);
        }
        let (nonce, ciphertext) = packet.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: session_hint.as_bytes(),
                },
            )
            .map_err(|_| SessionError::InvalidToken)?;
        let claims: LinkClaims =
            serde_json::from_slice(&plaintext).map_err(|_| SessionError::InvalidToken)?;
        if claims.session_id != session_hint {
            return Err(SessionError::InvalidToken);
        }
        Ok(claims)
    }
}

/// Extracts the *unauthenticated* session hint from a token so the caller
/// can look up the right key. The hint is only trustworthy once a
/// subsequent [`LinkCodec::decode`] under that key confirms it.
pub fn peek_session_id(token: &str) -> Result<SessionId, SessionError> {
    let (hint, _) = token.split_once('.').ok_or(SessionError::InvalidToken)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(hint)
        .map_err(|_| SessionError::InvalidToken)?;
    String::from_utf8(bytes).map_err(|_| SessionError::InvalidToken)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> (LinkCodec, LinkKey) {
        let key = LinkKey::generate();
        (LinkCodec::new(&key), key)
    }

    #[test]
    fn round_trip() {
        let (codec, _) = codec();
        let token = codec.encode("session-1", "participant-1").unwrap();
        let claims = codec.decode(&token).unwrap();
        assert_eq!(claims.session_id, "session-1");
        assert_eq!(claims.participant_id, "participant-1");
    }

    #[test]
    fn token_is_url_safe() {
        let (codec, _) = codec();
        let token = codec.encode("session/1?x=y", "participant&2").unwrap();
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')));
    }

    #[test]
    fn random_nonce_makes_tokens_distinct() {
        let (codec, _) = codec();
        let a = codec.encode("s", "p").unwrap();
        let b = codec.encode("s", "p").unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.decode(&a).unwrap(), codec.decode(&b).unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let (codec, _) = codec();
        let other = LinkCodec::new(&LinkKey::generate());
        let token = codec.encode("s", "p").unwrap();
        assert!(matches!(
            other.decode(&token),
            Err(SessionError::InvalidToken)
        ));
    }

    #[test]
    fn tampered_seal_fails() {
        let (codec, _) = codec();
        let token = codec.encode("s", "p").unwrap();
        let (hint, sealed) = token.split_once('.').unwrap();
        let mut packet = URL_SAFE_NO_PAD.decode(sealed).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0x01;
        let forged = format!("{}.{}", hint, URL_SAFE_NO_PAD.encode(&packet));
        assert!(matches!(
            codec.decode(&forged),
            Err(SessionError::InvalidToken)
        ));
    }

    #[test]
    fn tampered_hint_fails() {
        let (codec, _) = codec();
        let token = codec.encode("session-a", "p").unwrap();
        let (_, sealed) = token.split_once('.').unwrap();
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(b"session-b"), sealed);
        assert!(matches!(
            codec.decode(&forged),
            Err(SessionError::InvalidToken)
        ));
    }

    #[test]
    fn malformed_tokens_fail() {
        let (codec, _) = codec();
        for bad in ["", "no-dot", "a.", ".b", "!!!.???", "YQ.YQ"] {
            assert!(
                matches!(codec.decode(bad), Err(SessionError::InvalidToken)),
                "token {bad:?} must be rejected"
            );
        }
    }

    #[test]
    fn peek_reads_the_hint_without_the_key() {
        let (codec, _) = codec();
        let token = codec.encode("session-xyz", "p").unwrap();
        assert_eq!(peek_session_id(&token).unwrap(), "session-xyz");
        assert!(peek_session_id("garbage").is_err());
    }

    #[test]
    fn key_survives_base64_round_trip() {
        let key = LinkKey::generate();
        let restored = LinkKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key.as_bytes(), restored.as_bytes());
        assert!(LinkKey::from_base64("too-short").is_none());
    }

    #[test]
    fn debug_never_prints_key_material() {
        let key = LinkKey::generate();
        assert_eq!(format!("{key:?}"), "LinkKey(..)");
    }
}
