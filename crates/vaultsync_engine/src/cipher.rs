//! Encrypted strings in the remote vault's `<type>.<iv>|<data>|<mac>` form.
//!
//! Only type 2 is produced and accepted: AES-256-CBC with PKCS#7 padding,
//! authenticated by HMAC-SHA256 over `iv || ciphertext`. The MAC is checked
//! in constant time before anything is decrypted.

use crate::error::{SyncError, SyncResult};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Size of each half of a [`SymmetricKey`].
pub const KEY_HALF_SIZE: usize = 32;
/// AES block / IV size.
pub const IV_SIZE: usize = 16;
/// HMAC-SHA256 tag size.
pub const MAC_SIZE: usize = 32;

/// The only encryption type this engine writes.
pub const ENC_TYPE_AES_CBC_256_HMAC_SHA256: u8 = 2;

/// Session key pair: one half encrypts, the other authenticates.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    enc: [u8; KEY_HALF_SIZE],
    mac: [u8; KEY_HALF_SIZE],
}

impl SymmetricKey {
    /// Builds a key from its two halves.
    #[must_use]
    pub fn new(enc: [u8; KEY_HALF_SIZE], mac: [u8; KEY_HALF_SIZE]) -> Self {
        Self { enc, mac }
    }

    /// Builds a key from 64 bytes laid out as `enc || mac`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Crypto`] if `bytes` is not 64 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.len() != 2 * KEY_HALF_SIZE {
            return Err(SyncError::crypto(format!(
                "symmetric key must be {} bytes, got {}",
                2 * KEY_HALF_SIZE,
                bytes.len()
            )));
        }
        let mut enc = [0u8; KEY_HALF_SIZE];
        let mut mac = [0u8; KEY_HALF_SIZE];
        enc.copy_from_slice(&bytes[..KEY_HALF_SIZE]);
        mac.copy_from_slice(&bytes[KEY_HALF_SIZE..]);
        Ok(Self { enc, mac })
    }

    /// Expands a 32-byte master key into enc/mac halves with HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Crypto`] if the expansion fails.
    pub fn stretch(master: &[u8; KEY_HALF_SIZE]) -> SyncResult<Self> {
        let hk = Hkdf::<Sha256>::from_prk(master)
            .map_err(|_| SyncError::crypto("master key too short for HKDF"))?;
        let mut enc = [0u8; KEY_HALF_SIZE];
        let mut mac = [0u8; KEY_HALF_SIZE];
        hk.expand(b"enc", &mut enc)
            .map_err(|_| SyncError::crypto("HKDF expand failed"))?;
        hk.expand(b"mac", &mut mac)
            .map_err(|_| SyncError::crypto("HKDF expand failed"))?;
        Ok(Self { enc, mac })
    }

    /// Generates a random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut enc = [0u8; KEY_HALF_SIZE];
        let mut mac = [0u8; KEY_HALF_SIZE];
        rng.fill_bytes(&mut enc);
        rng.fill_bytes(&mut mac);
        Self { enc, mac }
    }

    fn authenticator(&self) -> SyncResult<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.mac)
            .map_err(|_| SyncError::crypto("invalid MAC key length"))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("enc", &"[REDACTED]")
            .field("mac", &"[REDACTED]")
            .finish()
    }
}

/// One encrypted field.
#[derive(Clone, PartialEq, Eq)]
pub struct EncString {
    iv: [u8; IV_SIZE],
    data: Vec<u8>,
    mac: [u8; MAC_SIZE],
}

impl EncString {
    /// Encrypts `plaintext` under a fresh random IV.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Crypto`] if the key is unusable.
    pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> SyncResult<Self> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let data = Aes256CbcEnc::new_from_slices(&key.enc, &iv)
            .map_err(|_| SyncError::crypto("invalid encryption key length"))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut mac = key.authenticator()?;
        mac.update(&iv);
        mac.update(&data);
        let mut tag = [0u8; MAC_SIZE];
        tag.copy_from_slice(&mac.finalize().into_bytes());

        Ok(Self { iv, data, mac: tag })
    }

    /// Encrypts a UTF-8 string.
    ///
    /// # Errors
    ///
    /// See [`EncString::encrypt`].
    pub fn encrypt_str(plaintext: &str, key: &SymmetricKey) -> SyncResult<Self> {
        Self::encrypt(plaintext.as_bytes(), key)
    }

    /// Verifies the MAC, then decrypts.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Crypto`] if authentication or unpadding fails.
    pub fn decrypt(&self, key: &SymmetricKey) -> SyncResult<Vec<u8>> {
        let mut mac = key.authenticator()?;
        mac.update(&self.iv);
        mac.update(&self.data);
        mac.verify_slice(&self.mac)
            .map_err(|_| SyncError::crypto("cipher string MAC mismatch"))?;

        Aes256CbcDec::new_from_slices(&key.enc, &self.iv)
            .map_err(|_| SyncError::crypto("invalid encryption key length"))?
            .decrypt_padded_vec_mut::<Pkcs7>(&self.data)
            .map_err(|_| SyncError::crypto("invalid padding"))
    }

    /// Decrypts into a UTF-8 string.
    ///
    /// # Errors
    ///
    /// See [`EncString::decrypt`]; also fails on invalid UTF-8.
    pub fn decrypt_to_string(&self, key: &SymmetricKey) -> SyncResult<String> {
        String::from_utf8(self.decrypt(key)?)
            .map_err(|_| SyncError::crypto("decrypted field is not UTF-8"))
    }
}

impl fmt::Display for EncString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}|{}|{}",
            ENC_TYPE_AES_CBC_256_HMAC_SHA256,
            STANDARD.encode(self.iv),
            STANDARD.encode(&self.data),
            STANDARD.encode(self.mac)
        )
    }
}

impl fmt::Debug for EncString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncString")
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl FromStr for EncString {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| SyncError::InvalidCipherString(why.to_string());

        let (enc_type, rest) = s.split_once('.').ok_or_else(|| invalid("missing type prefix"))?;
        let enc_type: u8 = enc_type.parse().map_err(|_| invalid("type is not a number"))?;
        if enc_type != ENC_TYPE_AES_CBC_256_HMAC_SHA256 {
            return Err(invalid(&format!("unsupported type {enc_type}")));
        }

        let parts: Vec<&str> = rest.split('|').collect();
        let [iv, data, mac] = parts[..] else {
            return Err(invalid("expected iv|data|mac"));
        };
        let decode = |part: &str, what: &str| {
            STANDARD
                .decode(part)
                .map_err(|_| invalid(&format!("{what} is not base64")))
        };

        let iv: [u8; IV_SIZE] = decode(iv, "iv")?
            .try_into()
            .map_err(|_| invalid("iv must be 16 bytes"))?;
        let mac: [u8; MAC_SIZE] = decode(mac, "mac")?
            .try_into()
            .map_err(|_| invalid("mac must be 32 bytes"))?;
        let data = decode(data, "data")?;
        if data.is_empty() || data.len() % IV_SIZE != 0 {
            return Err(invalid("ciphertext is not whole AES blocks"));
        }

        Ok(Self { iv, data, mac })
    }
}

impl Serialize for EncString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EncString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
