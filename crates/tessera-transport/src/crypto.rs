//! # Datagram Encryption
//!
//! Every datagram after the handshake is sealed independently with
//! AES-128-GCM under the connection's 16-byte private key:
//!
//! ```text
//! nonce (12 random bytes) | ciphertext | tag (16 bytes)
//! ```
//!
//! Building with the `insecure-plaintext` feature turns sealing into a
//! plain copy for packet-capture debugging. The handshake proof always uses
//! HMAC-SHA256 regardless of the feature.

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, NONCE_LEN};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, TransportError};
use crate::wire::MAX_PACKET_SIZE;

pub const KEY_LEN: usize = 16;

/// Whether datagrams are sealed. Fixed at compile time.
pub const ENCRYPT_PACKETS: bool = !cfg!(feature = "insecure-plaintext");

/// Bytes added to every sealed datagram.
pub const SEAL_OVERHEAD: usize = if ENCRYPT_PACKETS {
    NONCE_LEN + aead::MAX_TAG_LEN
} else {
    0
};

/// Largest datagram on the wire.
pub const MAX_DATAGRAM_SIZE: usize = MAX_PACKET_SIZE + SEAL_OVERHEAD;

pub type PrivateKey = [u8; KEY_LEN];

/// Parse a 32-character hex string into a key.
pub fn parse_key(hex_key: &str) -> Result<PrivateKey> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| TransportError::Config(format!("private key is not hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| TransportError::Config(format!("private key must be {KEY_LEN} bytes")))
}

// ─── Packet Cipher ───────────────────────────────────────────────────────────

pub struct PacketCipher {
    aead: LessSafeKey,
    hmac: hmac::Key,
    rng: SystemRandom,
}

impl PacketCipher {
    pub fn new(key: &PrivateKey) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_128_GCM, key).map_err(|_| TransportError::Encrypt)?;
        Ok(PacketCipher {
            aead: LessSafeKey::new(unbound),
            hmac: hmac::Key::new(hmac::HMAC_SHA256, key),
            rng: SystemRandom::new(),
        })
    }

    /// Seal `plaintext` into `out` (cleared first).
    pub fn seal(&self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        if !ENCRYPT_PACKETS {
            out.extend_from_slice(plaintext);
            return Ok(());
        }
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| TransportError::Encrypt)?;
        out.reserve(NONCE_LEN + plaintext.len() + aead::MAX_TAG_LEN);
        out.extend_from_slice(&nonce);
        let mut body = plaintext.to_vec();
        self.aead
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut body)
            .map_err(|_| TransportError::Encrypt)?;
        out.extend_from_slice(&body);
        Ok(())
    }

    /// Open a sealed datagram in place, returning the plaintext slice.
    pub fn open<'a>(&self, datagram: &'a mut [u8]) -> Result<&'a [u8]> {
        if !ENCRYPT_PACKETS {
            return Ok(&*datagram);
        }
        if datagram.len() < NONCE_LEN + aead::MAX_TAG_LEN {
            return Err(TransportError::Decrypt);
        }
        let (nonce, body) = datagram.split_at_mut(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| TransportError::Decrypt)?;
        let plain = self
            .aead
            .open_in_place(nonce, Aad::empty(), body)
            .map_err(|_| TransportError::Decrypt)?;
        Ok(&*plain)
    }

    /// Fill `buf` with random bytes.
    pub fn random(&self, buf: &mut [u8]) -> Result<()> {
        self.rng.fill(buf).map_err(|_| TransportError::Encrypt)
    }

    /// HMAC-SHA256 proof of key possession over `challenge`.
    pub fn sign(&self, challenge: &[u8]) -> hmac::Tag {
        hmac::sign(&self.hmac, challenge)
    }

    pub fn verify(&self, challenge: &[u8], proof: &[u8]) -> bool {
        hmac::verify(&self.hmac, challenge, proof).is_ok()
    }
}
