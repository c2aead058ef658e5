//! Data keys and their sealing to age X25519 recipients

use std::io::{Read, Write};
use std::path::Path;

use anyhow::Context;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CodecError;
use crate::KEY_SIZE;

pub use age::x25519::{Identity, Recipient};

/// A per-file 256-bit data key. Zeroized on drop.
#[derive(Clone)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit data key.
pub fn generate_data_key() -> DataKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    DataKey::from_bytes(bytes)
}

/// Seal a data key for every recipient (one age stanza each).
///
/// Output is a binary age file whose payload is the 32 key bytes.
pub fn seal_key(key: &DataKey, recipients: &[Recipient]) -> Result<Vec<u8>, CodecError> {
    if recipients.is_empty() {
        return Err(CodecError::KeyUnseal(
            "at least one recipient is required to seal the data key".into(),
        ));
    }

    let encryptor =
        age::Encryptor::with_recipients(recipients.iter().map(|r| r as &dyn age::Recipient))
            .map_err(|e| CodecError::KeyUnseal(format!("sealing data key: {e}")))?;

    let mut sealed = Vec::new();
    let mut writer = encryptor.wrap_output(&mut sealed)?;
    writer.write_all(key.as_bytes())?;
    writer.finish()?;
    Ok(sealed)
}

/// Unseal a data key with any of the caller's identities.
pub fn unseal_key(sealed: &[u8], identities: &[Identity]) -> Result<DataKey, CodecError> {
    if identities.is_empty() {
        return Err(CodecError::KeyUnseal("no private key available".into()));
    }

    let decryptor = age::Decryptor::new(sealed)
        .map_err(|e| CodecError::Format(format!("sealed key header: {e}")))?;

    if decryptor.is_scrypt() {
        return Err(CodecError::KeyUnseal(
            "passphrase-sealed data keys are not supported".into(),
        ));
    }

    let mut reader = decryptor
        .decrypt(identities.iter().map(|i| i as &dyn age::Identity))
        .map_err(|e| CodecError::KeyUnseal(e.to_string()))?;

    let mut plaintext = Vec::with_capacity(KEY_SIZE);
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| CodecError::KeyUnseal(format!("reading sealed key: {e}")))?;

    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        return Err(CodecError::Format(format!(
            "unsealed key has wrong size: expected {KEY_SIZE} bytes"
        )));
    }

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(DataKey::from_bytes(key_bytes))
}

/// Parse age recipients (`age1...`), one per line; `#` comments and blank
/// lines are skipped.
pub fn parse_recipients(text: &str) -> anyhow::Result<Vec<Recipient>> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            l.parse::<Recipient>()
                .map_err(|e| anyhow::anyhow!("invalid age recipient '{l}': {e}"))
        })
        .collect()
}

/// Parse age identities (`AGE-SECRET-KEY-1...`) from an identity file body.
pub fn parse_identities(text: &str) -> anyhow::Result<Vec<Identity>> {
    let identities: Vec<Identity> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            l.parse::<Identity>()
                .map_err(|e| anyhow::anyhow!("invalid age identity: {e}"))
        })
        .collect::<anyhow::Result<_>>()?;

    if identities.is_empty() {
        anyhow::bail!("identity file contains no age secret keys");
    }
    Ok(identities)
}

/// Load recipients from each of `paths`.
pub fn load_recipients<P: AsRef<Path>>(paths: &[P]) -> anyhow::Result<Vec<Recipient>> {
    let mut recipients = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading recipient file: {}", path.display()))?;
        recipients.extend(
            parse_recipients(&text)
                .with_context(|| format!("parsing recipient file: {}", path.display()))?,
        );
    }
    Ok(recipients)
}

/// Load the local identity file.
pub fn load_identities(path: &Path) -> anyhow::Result<Vec<Identity>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading identity file: {}", path.display()))?;
    parse_identities(&text).with_context(|| format!("parsing identity file: {}", path.display()))
}
