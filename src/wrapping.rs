//! Wrapping of internal keys under a principal key.
//!
//! One AES block in CBC mode: the internal key is XOR-ed with the IV and encrypted
//! with AES-128 for 16-byte principal keys or AES-256 for 32-byte ones. The IV is
//! derived from the object id and the principal key's versioned name, so wrapping is
//! deterministic for identical inputs. There is no authentication tag: an unwrap with
//! the wrong principal key returns garbage, not an error. Check
//! [`WrappedInternalKeyEnvelope::is_wrapped_by`] first.
//!
//! 中文: 用主密钥封装/解封内部密钥（单块 AES-CBC，无认证）。密钥不匹配时解封结果是无意义的字节。

use aes::cipher::{BlockDecrypt, BlockEncrypt, InvalidLength, KeyInit};
use aes::{Aes128, Aes256, Block};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{KeyError, Result};
use crate::keyring::INTERNAL_KEY_LEN;
use crate::keymap::{InternalKey, WrappedInternalKeyEnvelope};
use crate::principal::{PrincipalKeyIdentity, PrincipalKeyMaterial};

const IV_LEN: usize = 16;
const IV_DOMAIN: &[u8] = b"tde-internal-key-iv";

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

fn derive_iv(object_id: u32, identity: &PrincipalKeyIdentity) -> [u8; IV_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(IV_DOMAIN);
    hasher.update(object_id.to_le_bytes());
    hasher.update(identity.versioned_name().as_bytes());
    let digest = hasher.finalize();
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest[..IV_LEN]);
    iv
}

fn xor_in_place(block: &mut [u8; INTERNAL_KEY_LEN], iv: &[u8]) {
    for (b, v) in block.iter_mut().zip(iv) {
        *b ^= v;
    }
}

/// Runs the block cipher once over `block` in place.
fn apply_block(key: &[u8], block: &mut [u8; INTERNAL_KEY_LEN], direction: Direction) -> Result<()> {
    let invalid = |e: InvalidLength| KeyError::InvalidArgument(format!("invalid wrapping key: {}", e));
    let block = Block::from_mut_slice(block);
    match key.len() {
        16 => {
            let cipher = Aes128::new_from_slice(key).map_err(invalid)?;
            match direction {
                Direction::Encrypt => cipher.encrypt_block(block),
                Direction::Decrypt => cipher.decrypt_block(block),
            }
        }
        32 => {
            let cipher = Aes256::new_from_slice(key).map_err(invalid)?;
            match direction {
                Direction::Encrypt => cipher.encrypt_block(block),
                Direction::Decrypt => cipher.decrypt_block(block),
            }
        }
        other => {
            return Err(KeyError::InvalidArgument(format!(
                "principal key must be 16 or 32 bytes, got {}",
                other
            )));
        }
    }
    Ok(())
}

/// Wraps `internal_key` for `object_id` under `principal`.
pub fn wrap(
    object_id: u32,
    internal_key: &InternalKey,
    principal: &PrincipalKeyMaterial,
) -> Result<WrappedInternalKeyEnvelope> {
    let iv = derive_iv(object_id, principal.identity());
    let mut block = *internal_key.key_bytes();
    xor_in_place(&mut block, &iv);
    if let Err(e) = apply_block(principal.key_bytes(), &mut block, Direction::Encrypt) {
        block.zeroize();
        return Err(e);
    }

    Ok(WrappedInternalKeyEnvelope {
        principal_key: principal.identity().clone(),
        provider_id: principal.metadata().provider_id,
        rel_type: internal_key.rel_type(),
        iv: iv.to_vec(),
        ciphertext: block.to_vec(),
    })
}

/// Unwraps an envelope with `principal`. Does not check that `principal` is the key
/// the envelope names.
pub fn unwrap(
    envelope: &WrappedInternalKeyEnvelope,
    principal: &PrincipalKeyMaterial,
) -> Result<InternalKey> {
    if envelope.ciphertext.len() != INTERNAL_KEY_LEN || envelope.iv.len() != IV_LEN {
        return Err(KeyError::InvalidArgument(format!(
            "malformed internal key envelope: {} byte ciphertext, {} byte IV",
            envelope.ciphertext.len(),
            envelope.iv.len()
        )));
    }
    let mut block = [0u8; INTERNAL_KEY_LEN];
    block.copy_from_slice(&envelope.ciphertext);
    apply_block(principal.key_bytes(), &mut block, Direction::Decrypt)?;
    xor_in_place(&mut block, &envelope.iv);

    let key = InternalKey::new(block, envelope.rel_type);
    block.zeroize();
    Ok(key)
}
