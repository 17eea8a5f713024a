// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Optional AES-256-CBC packet envelope.
//!
//! The envelope encrypts the header region `crc..update_counter` (56 bytes)
//! together with the payload, zero-padded to a 16-byte boundary. The pad
//! count travels in the high nibble of `data_size`. `magic0`, `data_size`
//! and `magic1` stay in the clear so the framer keeps working on encrypted
//! streams.
//!
//! Integrity: `crc` is a CRC-32 over `type..end_of_payload`, computed before
//! encryption and verified after decryption. A mismatch means a wrong key or
//! a tampered packet and is fatal for the connection.
//!
//! The 32-byte key bundle is used directly as the AES-256 key; its first 16
//! bytes double as the IV. This is deliberately simpler than the original
//! deployment's split-bundle scheme and not interoperable with it.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use zeroize::Zeroize;

use crate::config::{CRYPT_KEY_SIZE, HEADER_SIZE, PAYLOAD_SIZE_MAX};
use crate::error::{Error, Result};
use crate::protocol::crc::crc32_update;
use crate::protocol::header::{CRC_OFFSET, DATA_SIZE_OFFSET, TYPE_OFFSET};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Bytes of the header covered by the envelope (`crc..update_counter`).
const CRYPT_HEADER_SIZE: usize = HEADER_SIZE - 1 - 2 - 1;

/// AES block size; ciphertext is padded to this boundary.
const BLOCK: usize = 16;

/// Largest payload that still fits the 12-bit size field after padding.
const SEALABLE_PAYLOAD_MAX: usize = PAYLOAD_SIZE_MAX - (BLOCK - 1);

/// Symmetric key bundle for the packet envelope.
#[derive(Clone)]
pub struct CryptKey {
    bundle: [u8; CRYPT_KEY_SIZE],
}

impl CryptKey {
    /// Wrap a 32-byte key bundle.
    pub fn new(bundle: [u8; CRYPT_KEY_SIZE]) -> Self {
        Self { bundle }
    }

    fn cipher_key(&self) -> &[u8; CRYPT_KEY_SIZE] {
        &self.bundle
    }

    fn iv(&self) -> [u8; BLOCK] {
        let mut iv = [0u8; BLOCK];
        iv.copy_from_slice(&self.bundle[..BLOCK]);
        iv
    }
}

impl Drop for CryptKey {
    fn drop(&mut self) {
        self.bundle.zeroize();
    }
}

impl std::fmt::Debug for CryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptKey(..)")
    }
}

/// Encrypt an encoded frame in place.
pub fn seal_frame(key: &CryptKey, frame: &mut Vec<u8>) -> Result<()> {
    if frame.len() < HEADER_SIZE {
        return Err(Error::Protocol("frame shorter than header".into()));
    }
    let payload_len = frame.len() - HEADER_SIZE;
    if payload_len > SEALABLE_PAYLOAD_MAX {
        return Err(Error::Protocol(format!(
            "payload of {} bytes cannot carry envelope padding",
            payload_len
        )));
    }

    let plain_len = CRYPT_HEADER_SIZE + payload_len;
    let padded_len = (plain_len + BLOCK - 1) & !(BLOCK - 1);
    let padding = padded_len - plain_len;
    let stored_len = payload_len + padding;

    // Size field first: the CRC covers its final value.
    let data_size = (stored_len as u16 & 0x0fff) | ((padding as u16) << 12);
    frame[DATA_SIZE_OFFSET..DATA_SIZE_OFFSET + 2].copy_from_slice(&data_size.to_le_bytes());

    let mut crc = crc32_update(0xFFFF_FFFF, &frame[TYPE_OFFSET..HEADER_SIZE]);
    crc = crc32_update(crc, &frame[HEADER_SIZE..HEADER_SIZE + payload_len]);
    frame[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&(!crc).to_le_bytes());

    frame.resize(HEADER_SIZE + stored_len, 0);

    let mut block = Vec::with_capacity(padded_len);
    block.extend_from_slice(&frame[CRC_OFFSET..CRC_OFFSET + CRYPT_HEADER_SIZE]);
    block.extend_from_slice(&frame[HEADER_SIZE..]);

    let enc = Aes256CbcEnc::new(key.cipher_key().into(), (&key.iv()).into());
    enc.encrypt_padded_mut::<NoPadding>(&mut block, padded_len)
        .map_err(|_| Error::Crypt)?;

    frame[CRC_OFFSET..CRC_OFFSET + CRYPT_HEADER_SIZE].copy_from_slice(&block[..CRYPT_HEADER_SIZE]);
    frame[HEADER_SIZE..].copy_from_slice(&block[CRYPT_HEADER_SIZE..]);
    Ok(())
}

/// Decrypt and verify a framed packet in place, stripping the padding.
pub fn open_frame(key: &CryptKey, frame: &mut Vec<u8>) -> Result<()> {
    if frame.len() < HEADER_SIZE {
        return Err(Error::Protocol("frame shorter than header".into()));
    }
    let data_size = u16::from_le_bytes([frame[DATA_SIZE_OFFSET], frame[DATA_SIZE_OFFSET + 1]]);
    let stored_len = usize::from(data_size & 0x0fff);
    let padding = usize::from(data_size >> 12);
    if frame.len() != HEADER_SIZE + stored_len
        || padding > stored_len
        || (CRYPT_HEADER_SIZE + stored_len) % BLOCK != 0
    {
        return Err(Error::Crypt);
    }

    let mut block = Vec::with_capacity(CRYPT_HEADER_SIZE + stored_len);
    block.extend_from_slice(&frame[CRC_OFFSET..CRC_OFFSET + CRYPT_HEADER_SIZE]);
    block.extend_from_slice(&frame[HEADER_SIZE..]);

    let dec = Aes256CbcDec::new(key.cipher_key().into(), (&key.iv()).into());
    dec.decrypt_padded_mut::<NoPadding>(&mut block)
        .map_err(|_| Error::Crypt)?;

    frame[CRC_OFFSET..CRC_OFFSET + CRYPT_HEADER_SIZE].copy_from_slice(&block[..CRYPT_HEADER_SIZE]);
    frame[HEADER_SIZE..].copy_from_slice(&block[CRYPT_HEADER_SIZE..]);

    let payload_len = stored_len - padding;
    let stored_crc = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
    let mut crc = crc32_update(0xFFFF_FFFF, &frame[TYPE_OFFSET..HEADER_SIZE]);
    crc = crc32_update(crc, &frame[HEADER_SIZE..HEADER_SIZE + payload_len]);
    if !crc != stored_crc {
        return Err(Error::Crypt);
    }

    let data_size = payload_len as u16 & 0x0fff;
    frame[DATA_SIZE_OFFSET..DATA_SIZE_OFFSET + 2].copy_from_slice(&data_size.to_le_bytes());
    frame.truncate(HEADER_SIZE + payload_len);
    Ok(())
}
