use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// How cookie values are protected on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// HMAC-SHA256 over the plaintext payload.
    Signed,
    /// AES-256-GCM; the random nonce is prefixed to the ciphertext.
    Encrypted,
    /// Encrypt, then sign the nonce-plus-ciphertext.
    SignedEncrypted,
}

/// Decode failure. Tampering, truncation, and wrong keys all collapse into
/// the same opaque error so the cause is not observable from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError;

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cookie failed validation")
    }
}

impl std::error::Error for DecodeError {}

/// Signs and/or encrypts cookie payloads.
///
/// Wire form is base64url without padding. Signed payloads are
/// `value|hex(hmac)`; encrypted payloads are `nonce || ciphertext`, signed
/// variants append `|hex(hmac)` over those bytes. HMAC verification is
/// constant time.
#[derive(Clone)]
pub struct CookieCodec {
    key: [u8; 32],
    mode: CodecMode,
}

impl CookieCodec {
    /// Derive the 256-bit working key from an application secret.
    pub fn new(secret: &[u8], mode: CodecMode) -> Self {
        let digest = Sha256::digest(secret);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key, mode }
    }

    pub fn mode(&self) -> CodecMode {
        self.mode
    }

    pub fn encode(&self, value: &str) -> Result<String, DecodeError> {
        let payload = match self.mode {
            CodecMode::Signed => {
                let mut bytes = value.as_bytes().to_vec();
                bytes.push(b'|');
                bytes.extend_from_slice(hex(&self.sign(value.as_bytes())).as_bytes());
                bytes
            }
            CodecMode::Encrypted => self.encrypt(value)?,
            CodecMode::SignedEncrypted => {
                let mut bytes = self.encrypt(value)?;
                let tag = self.sign(&bytes);
                bytes.push(b'|');
                bytes.extend_from_slice(hex(&tag).as_bytes());
                bytes
            }
        };
        Ok(URL_SAFE_NO_PAD.encode(payload))
    }

    pub fn decode(&self, token: &str) -> Result<String, DecodeError> {
        let payload = URL_SAFE_NO_PAD.decode(token).map_err(|_| DecodeError)?;
        match self.mode {
            CodecMode::Signed => {
                let (value, tag) = split_signature(&payload)?;
                self.verify(value, &tag)?;
                String::from_utf8(value.to_vec()).map_err(|_| DecodeError)
            }
            CodecMode::Encrypted => self.decrypt(&payload),
            CodecMode::SignedEncrypted => {
                let (sealed, tag) = split_signature(&payload)?;
                self.verify(sealed, &tag)?;
                self.decrypt(sealed)
            }
        }
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn verify(&self, data: &[u8], tag: &[u8]) -> Result<(), DecodeError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.verify_slice(tag).map_err(|_| DecodeError)
    }

    fn encrypt(&self, value: &str) -> Result<Vec<u8>, DecodeError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, value.as_bytes())
            .map_err(|_| DecodeError)?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<String, DecodeError> {
        if sealed.len() <= NONCE_LEN {
            return Err(DecodeError);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| DecodeError)?;
        String::from_utf8(plaintext).map_err(|_| DecodeError)
    }
}

/// Split `payload|hex(tag)` on the last `|` and decode the tag.
fn split_signature(payload: &[u8]) -> Result<(&[u8], Vec<u8>), DecodeError> {
    let split = payload
        .iter()
        .rposition(|b| *b == b'|')
        .ok_or(DecodeError)?;
    let value = &payload[..split];
    let tag_hex = std::str::from_utf8(&payload[split + 1..]).map_err(|_| DecodeError)?;
    Ok((value, unhex(tag_hex)?))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(s: &str) -> Result<Vec<u8>, DecodeError> {
    if s.len() % 2 != 0 {
        return Err(DecodeError);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| DecodeError))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"app-secret";

    #[test]
    fn signed_round_trip() {
        let codec = CookieCodec::new(SECRET, CodecMode::Signed);
        let token = codec.encode(r#"{"sid":"abc"}"#).unwrap();
        assert_eq!(codec.decode(&token).unwrap(), r#"{"sid":"abc"}"#);
    }

    #[test]
    fn encrypted_round_trip() {
        let codec = CookieCodec::new(SECRET, CodecMode::Encrypted);
        let token = codec.encode("top secret").unwrap();
        assert_eq!(codec.decode(&token).unwrap(), "top secret");
    }

    #[test]
    fn signed_encrypted_round_trip() {
        let codec = CookieCodec::new(SECRET, CodecMode::SignedEncrypted);
        let token = codec.encode("both").unwrap();
        assert_eq!(codec.decode(&token).unwrap(), "both");
    }

    #[test]
    fn encrypted_tokens_differ_per_nonce() {
        let codec = CookieCodec::new(SECRET, CodecMode::Encrypted);
        let a = codec.encode("v").unwrap();
        let b = codec.encode("v").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn any_single_byte_flip_fails_signed_decode() {
        let codec = CookieCodec::new(SECRET, CodecMode::Signed);
        let token = codec.encode("payload").unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        for i in 0..raw.len() {
            raw[i] ^= 0x01;
            let tampered = URL_SAFE_NO_PAD.encode(&raw);
            assert!(
                codec.decode(&tampered).is_err(),
                "flip at byte {i} should fail"
            );
            raw[i] ^= 0x01;
        }
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let codec = CookieCodec::new(SECRET, CodecMode::Encrypted);
        let token = codec.encode("payload").unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(codec.decode(&URL_SAFE_NO_PAD.encode(&raw)).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let codec = CookieCodec::new(SECRET, CodecMode::Signed);
        let other = CookieCodec::new(b"different", CodecMode::Signed);
        let token = codec.encode("payload").unwrap();
        assert!(other.decode(&token).is_err());
    }

    #[test]
    fn malformed_tokens_fail() {
        let codec = CookieCodec::new(SECRET, CodecMode::Signed);
        assert!(codec.decode("!!!not-base64!!!").is_err());
        assert!(codec.decode("").is_err());
        let no_sig = URL_SAFE_NO_PAD.encode(b"value-without-separator");
        assert!(codec.decode(&no_sig).is_err());
    }
}
