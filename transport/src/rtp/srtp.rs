//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! SRTP and SRTCP with AEAD_AES_128_GCM (RFC 7714).

use std::convert::TryInto;

use aes::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Aes128,
};
use aes_gcm::{AeadInPlace, Aes128Gcm};
use thiserror::Error;
use zeroize::Zeroizing;

use super::types::*;

pub const SRTP_KEY_LEN: usize = 16;
pub const SRTP_SALT_LEN: usize = 12;
pub const SRTP_IV_LEN: usize = 12;
pub const SRTP_AUTH_TAG_LEN: usize = 16;
pub const SRTCP_FOOTER_LEN: usize = 4;
const SRTCP_ENCRYPTED_FLAG: u32 = 0x8000_0000;
pub const MAX_SRTCP_INDEX: u32 = 0x7FFF_FFFF;
const RTCP_SENDER_SSRC_RANGE: std::ops::Range<usize> = 4..8;
const RTCP_HEADER_LEN: usize = 8;

pub type Key = Zeroizing<[u8; SRTP_KEY_LEN]>;
pub type Salt = [u8; SRTP_SALT_LEN];
pub type Iv = [u8; SRTP_IV_LEN];

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("packet too short for SRTP: {0} bytes")]
    TooShort(usize),
    #[error("SRTCP packet is not encrypted")]
    Unencrypted,
    #[error("SRTCP index exhausted")]
    IndexExhausted,
    #[error("authentication failed")]
    AuthenticationFailed,
}

#[derive(Debug, Clone)]
pub struct KeyAndSalt {
    pub key: Key,
    pub salt: Salt,
}

/// Session keys for one direction, derived from a DTLS-exported master key and salt.
#[derive(Debug, Clone)]
pub struct KeysAndSalts {
    pub rtp: KeyAndSalt,
    pub rtcp: KeyAndSalt,
}

impl KeysAndSalts {
    // See https://tools.ietf.org/html/rfc3711#section-4.3.2 for label constants.
    pub fn derive_from_master(master: &KeyAndSalt) -> Self {
        Self {
            rtp: KeyAndSalt {
                key: Self::derive_key_from_master(master, 0),
                salt: Self::derive_salt_from_master(master, 2),
            },
            rtcp: KeyAndSalt {
                key: Self::derive_key_from_master(master, 3),
                salt: Self::derive_salt_from_master(master, 5),
            },
        }
    }

    fn derive_key_from_master(master: &KeyAndSalt, label: u8) -> Key {
        let cipher = Aes128::new(GenericArray::from_slice(&master.key[..]));
        let mut derived = Zeroizing::new([0; SRTP_KEY_LEN]);
        derived[..SRTP_SALT_LEN].copy_from_slice(&master.salt);
        derived[7] ^= label;
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut derived[..]));
        derived
    }

    fn derive_salt_from_master(master: &KeyAndSalt, label: u8) -> Salt {
        let mut salt = [0u8; SRTP_SALT_LEN];
        salt.copy_from_slice(&Self::derive_key_from_master(master, label)[..SRTP_SALT_LEN]);
        salt
    }
}

/// What the DTLS collaborator hands over once the handshake has exported keying material.
#[derive(Debug, Clone)]
pub struct SrtpMasterKeys {
    pub local: KeyAndSalt,
    pub remote: KeyAndSalt,
}

impl SrtpMasterKeys {
    /// Returns (decrypt, encrypt)
    pub fn derive(&self) -> (KeysAndSalts, KeysAndSalts) {
        (
            KeysAndSalts::derive_from_master(&self.remote),
            KeysAndSalts::derive_from_master(&self.local),
        )
    }
}

pub fn rtp_iv(ssrc: Ssrc, seqnum: FullSequenceNumber, salt: &Salt) -> Iv {
    // XOR the salt with (RFC 7714 section 8.1):
    //   |00|00|    SSRC   |     ROC   | SEQ |
    let mut iv = [0u8; SRTP_IV_LEN];
    iv[2..6].copy_from_slice(&ssrc.to_be_bytes());
    iv[6..12].copy_from_slice(&seqnum.to_be_bytes()[2..8]);
    for (b, s) in iv.iter_mut().zip(salt.iter()) {
        *b ^= s;
    }
    iv
}

pub fn rtcp_iv(sender_ssrc: Ssrc, index: u32, salt: &Salt) -> Option<Iv> {
    if index > MAX_SRTCP_INDEX {
        return None;
    }
    //   |00|00|    SSRC   |00|00|0+SRTCP Idx|
    let mut iv = [0u8; SRTP_IV_LEN];
    iv[2..6].copy_from_slice(&sender_ssrc.to_be_bytes());
    iv[8..12].copy_from_slice(&index.to_be_bytes());
    for (b, s) in iv.iter_mut().zip(salt.iter()) {
        *b ^= s;
    }
    Some(iv)
}

/// Encrypts an RTP packet whose serialized form already has room for the tag at the end.
pub fn encrypt_rtp_in_place(
    serialized: &mut [u8],
    header_len: usize,
    ssrc: Ssrc,
    seqnum: FullSequenceNumber,
    key: &KeyAndSalt,
) -> Result<(), CryptoError> {
    if serialized.len() < header_len + SRTP_AUTH_TAG_LEN {
        return Err(CryptoError::TooShort(serialized.len()));
    }
    let (aad, payload_plus_tag) = serialized.split_at_mut(header_len);
    let payload_len = payload_plus_tag.len() - SRTP_AUTH_TAG_LEN;
    let (plaintext, tag) = payload_plus_tag.split_at_mut(payload_len);
    let cipher = Aes128Gcm::new(GenericArray::from_slice(&key.key[..]));
    let iv = rtp_iv(ssrc, seqnum, &key.salt);
    let computed_tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), aad, plaintext)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    tag.copy_from_slice(&computed_tag);
    Ok(())
}

/// Decrypts in place; the tag stays at the end and should be ignored by the caller.
pub fn decrypt_rtp_in_place(
    serialized: &mut [u8],
    header_len: usize,
    ssrc: Ssrc,
    seqnum: FullSequenceNumber,
    key: &KeyAndSalt,
) -> Result<(), CryptoError> {
    if serialized.len() < header_len + SRTP_AUTH_TAG_LEN {
        return Err(CryptoError::TooShort(serialized.len()));
    }
    let (aad, payload_plus_tag) = serialized.split_at_mut(header_len);
    let payload_len = payload_plus_tag.len() - SRTP_AUTH_TAG_LEN;
    let (ciphertext, tag) = payload_plus_tag.split_at_mut(payload_len);
    let cipher = Aes128Gcm::new(GenericArray::from_slice(&key.key[..]));
    let iv = rtp_iv(ssrc, seqnum, &key.salt);
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&iv),
            aad,
            ciphertext,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Appends the tag and the SRTCP footer (E flag + index) to a plaintext compound packet.
pub fn encrypt_rtcp(
    mut compound: Vec<u8>,
    srtcp_index: u32,
    key: &KeyAndSalt,
) -> Result<Vec<u8>, CryptoError> {
    if compound.len() < RTCP_HEADER_LEN {
        return Err(CryptoError::TooShort(compound.len()));
    }
    let sender_ssrc = u32::from_be_bytes(compound[RTCP_SENDER_SSRC_RANGE].try_into().unwrap());
    let iv = rtcp_iv(sender_ssrc, srtcp_index, &key.salt).ok_or(CryptoError::IndexExhausted)?;
    let footer = (srtcp_index | SRTCP_ENCRYPTED_FLAG).to_be_bytes();

    let plaintext_len = compound.len();
    compound.resize(plaintext_len + SRTP_AUTH_TAG_LEN, 0);
    let (header, payload_plus_tag) = compound.split_at_mut(RTCP_HEADER_LEN);
    let (payload, tag) = payload_plus_tag.split_at_mut(plaintext_len - RTCP_HEADER_LEN);
    let aad = [&header[..], &footer[..]].concat();
    let cipher = Aes128Gcm::new(GenericArray::from_slice(&key.key[..]));
    let computed_tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), &aad, payload)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    tag.copy_from_slice(&computed_tag);
    compound.extend_from_slice(&footer);
    Ok(compound)
}

/// Returns the length of the decrypted compound packet at the front of `serialized`.
pub fn decrypt_rtcp_in_place(serialized: &mut [u8], key: &KeyAndSalt) -> Result<usize, CryptoError> {
    let len = serialized.len();
    if len < RTCP_HEADER_LEN + SRTP_AUTH_TAG_LEN + SRTCP_FOOTER_LEN {
        return Err(CryptoError::TooShort(len));
    }
    let sender_ssrc = u32::from_be_bytes(serialized[RTCP_SENDER_SSRC_RANGE].try_into().unwrap());
    let footer: [u8; SRTCP_FOOTER_LEN] = serialized[len - SRTCP_FOOTER_LEN..].try_into().unwrap();
    let footer_value = u32::from_be_bytes(footer);
    if footer_value & SRTCP_ENCRYPTED_FLAG == 0 {
        return Err(CryptoError::Unencrypted);
    }
    let iv = rtcp_iv(sender_ssrc, footer_value & MAX_SRTCP_INDEX, &key.salt)
        .ok_or(CryptoError::IndexExhausted)?;

    let plaintext_len = len - SRTP_AUTH_TAG_LEN - SRTCP_FOOTER_LEN;
    let (header, rest) = serialized.split_at_mut(RTCP_HEADER_LEN);
    let (ciphertext, tag_plus_footer) = rest.split_at_mut(plaintext_len - RTCP_HEADER_LEN);
    let aad = [&header[..], &footer[..]].concat();
    let cipher = Aes128Gcm::new(GenericArray::from_slice(&key.key[..]));
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&iv),
            &aad,
            ciphertext,
            GenericArray::from_slice(&tag_plus_footer[..SRTP_AUTH_TAG_LEN]),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(plaintext_len)
}

/// Creates a test key and salt by repeating the byte
#[cfg(test)]
pub fn key_and_salt_from(seed: u8) -> KeyAndSalt {
    KeyAndSalt {
        key: [seed; SRTP_KEY_LEN].into(),
        salt: [seed.wrapping_add(1); SRTP_SALT_LEN],
    }
}

/// Returns the master keys for the server and the mirrored ones for a simulated client.
#[cfg(test)]
pub fn new_master_keys(seed: u8) -> (SrtpMasterKeys, SrtpMasterKeys) {
    let server = SrtpMasterKeys {
        local: key_and_salt_from(seed),
        remote: key_and_salt_from(seed.wrapping_add(10)),
    };
    let client = SrtpMasterKeys {
        local: server.remote.clone(),
        remote: server.local.clone(),
    };
    (server, client)
}
