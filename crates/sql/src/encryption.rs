//! Optional envelope encryption: each object's blob is encrypted with its
//! own one-time AES-256-GCM data key, and that data key is itself wrapped
//! by a process-lifetime master key identified by `key_id`. Master keys
//! never persist across restarts — a fresh `KeyRegistry` is created every
//! process start, the same "ephemeral by construction" posture the cache
//! itself has.
//!
//! The `objects` table only carries three encryption columns — `data`,
//! `nonce`, `key_id` — so the wrapped data key and its own nonce travel
//! bundled ahead of the ciphertext inside `data` itself; decryption still
//! only touches the three stored columns.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{QueryError, SqlResult};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// A process-lifetime table of master keys, looked up by `key_id`. New keys
/// are minted randomly; nothing is ever loaded from or written to disk.
pub struct KeyRegistry {
    keys: Mutex<HashMap<u32, [u8; KEY_LEN]>>,
    active: Mutex<u32>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRegistry {
    pub fn new() -> Self {
        let mut registry = Self { keys: Mutex::new(HashMap::new()), active: Mutex::new(0) };
        let id = registry.mint();
        *registry.active.get_mut().unwrap() = id;
        registry
    }

    /// Generates a fresh random master key and returns its `key_id`.
    pub fn mint(&self) -> u32 {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; KEY_LEN];
        rng.fill_bytes(&mut key);
        let mut keys = self.keys.lock().expect("key registry mutex poisoned");
        let id = loop {
            let candidate = rng.next_u32();
            if !keys.contains_key(&candidate) {
                break candidate;
            }
        };
        keys.insert(id, key);
        id
    }

    /// The `key_id` new objects should be encrypted under.
    pub fn active_key_id(&self) -> u32 {
        *self.active.lock().expect("key registry mutex poisoned")
    }

    fn get(&self, key_id: u32) -> SqlResult<[u8; KEY_LEN]> {
        self.keys
            .lock()
            .expect("key registry mutex poisoned")
            .get(&key_id)
            .copied()
            .ok_or_else(|| QueryError::new("ENVELOPE decrypt", format!("unknown key_id {key_id}")))
    }
}

/// Encrypts `plaintext` under a fresh one-time data key, itself wrapped by
/// the registry's active master key. Returns `(data, nonce, key_id)`
/// matching the three stored columns; `data` is `wrapped_key || wrap_nonce
/// || ciphertext`.
pub fn encrypt(registry: &KeyRegistry, plaintext: &[u8]) -> SqlResult<(Vec<u8>, Vec<u8>, u32)> {
    let key_id = registry.active_key_id();
    let master = registry.get(key_id)?;

    let mut rng = rand::thread_rng();
    let mut data_key = [0u8; KEY_LEN];
    rng.fill_bytes(&mut data_key);

    let mut payload_nonce_bytes = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut payload_nonce_bytes);
    let payload_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
    let ciphertext = payload_cipher
        .encrypt(Nonce::from_slice(&payload_nonce_bytes), plaintext)
        .map_err(|e| QueryError::new("ENVELOPE encrypt", e.to_string()))?;

    let mut wrap_nonce_bytes = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut wrap_nonce_bytes);
    let wrap_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master));
    let wrapped_key = wrap_cipher
        .encrypt(Nonce::from_slice(&wrap_nonce_bytes), data_key.as_slice())
        .map_err(|e| QueryError::new("ENVELOPE wrap", e.to_string()))?;

    let mut data = Vec::with_capacity(4 + wrapped_key.len() + NONCE_LEN + ciphertext.len());
    data.extend_from_slice(&(wrapped_key.len() as u32).to_le_bytes());
    data.extend_from_slice(&wrapped_key);
    data.extend_from_slice(&wrap_nonce_bytes);
    data.extend_from_slice(&ciphertext);

    Ok((data, payload_nonce_bytes.to_vec(), key_id))
}

/// Inverse of [`encrypt`]. Requires all three stored columns.
pub fn decrypt(registry: &KeyRegistry, data: &[u8], nonce: &[u8], key_id: u32) -> SqlResult<Vec<u8>> {
    if data.len() < 4 {
        return Err(QueryError::new("ENVELOPE decrypt", "truncated envelope header"));
    }
    let wrapped_len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    let mut idx = 4;
    if data.len() < idx + wrapped_len + NONCE_LEN {
        return Err(QueryError::new("ENVELOPE decrypt", "truncated wrapped key or wrap nonce"));
    }
    let wrapped_key = &data[idx..idx + wrapped_len];
    idx += wrapped_len;
    let wrap_nonce = &data[idx..idx + NONCE_LEN];
    idx += NONCE_LEN;
    let ciphertext = &data[idx..];

    let master = registry.get(key_id)?;
    let wrap_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master));
    let data_key = wrap_cipher
        .decrypt(Nonce::from_slice(wrap_nonce), wrapped_key)
        .map_err(|e| QueryError::new("ENVELOPE unwrap", e.to_string()))?;

    if nonce.len() != NONCE_LEN {
        return Err(QueryError::new("ENVELOPE decrypt", "bad payload nonce length"));
    }
    let payload_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
    payload_cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| QueryError::new("ENVELOPE decrypt", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let registry = KeyRegistry::new();
        let plaintext = b"hello steve cache";
        let (data, nonce, key_id) = encrypt(&registry, plaintext).unwrap();
        let out = decrypt(&registry, &data, &nonce, key_id).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn every_object_gets_its_own_data_key() {
        let registry = KeyRegistry::new();
        let (data_a, _, _) = encrypt(&registry, b"a").unwrap();
        let (data_b, _, _) = encrypt(&registry, b"a").unwrap();
        assert_ne!(data_a, data_b, "identical plaintext must not produce identical ciphertext");
    }

    #[test]
    fn unknown_key_id_fails_closed() {
        let registry = KeyRegistry::new();
        let (data, nonce, _) = encrypt(&registry, b"x").unwrap();
        let err = decrypt(&registry, &data, &nonce, 999_999).unwrap_err();
        assert!(err.cause.contains("unknown key_id"));
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let registry = KeyRegistry::new();
        let (mut data, nonce, key_id) = encrypt(&registry, b"hello steve cache").unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(decrypt(&registry, &data, &nonce, key_id).is_err());
    }
}
