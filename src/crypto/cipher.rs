// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
use crate::error::Error;
use openssl::symm::{Cipher as OsslCipher, Crypter, Mode};

/// A stateful, stream-oriented encrypt/decrypt side. Each instance is bound
/// to one direction of one key-exchange's worth of key material; a rekey
/// installs a brand new instance rather than re-keying this one in place
/// (spec.md §4.1's `SetCipher`).
pub trait Cipher: Send {
    /// In-place transform; for CTR/CBC stream wrapping this is the same
    /// operation run either way, driven by the `Crypter`'s configured mode.
    fn apply(&mut self, data: &mut [u8]) -> Result<(), Error>;
    /// Alignment required of the plaintext packet image (RFC 4253 §6).
    fn block_size(&self) -> usize;
}

/// Before the first `NEWKEYS`, packets are neither encrypted nor MACed.
pub struct Clear;

impl Cipher for Clear {
    fn apply(&mut self, _data: &mut [u8]) -> Result<(), Error> {
        Ok(())
    }
    fn block_size(&self) -> usize {
        8
    }
}

struct OpensslCipher {
    crypter: Crypter,
    block_size: usize,
}

impl Cipher for OpensslCipher {
    fn apply(&mut self, data: &mut [u8]) -> Result<(), Error> {
        // Crypter::update requires scratch space of input_len + block_size;
        // for the stream/CTR and CBC-no-padding modes we use, output length
        // equals input length, so we copy through a scratch buffer.
        let mut out = vec![0u8; data.len() + self.block_size];
        let n = self.crypter.update(data, &mut out)?;
        data.copy_from_slice(&out[..n]);
        Ok(())
    }
    fn block_size(&self) -> usize {
        self.block_size
    }
}

fn make(name: &str, mode: Mode, key: &[u8], iv: &[u8]) -> Result<Box<dyn Cipher>, Error> {
    let (ossl, block_size): (OsslCipher, usize) = match name {
        "aes256-ctr" => (OsslCipher::aes_256_ctr(), 16),
        "aes128-ctr" => (OsslCipher::aes_128_ctr(), 16),
        "3des-cbc" => (OsslCipher::des_ede3_cbc(), 8),
        "blowfish-cbc" => (OsslCipher::bf_cbc(), 8),
        other => return Err(Error::NoCommonAlgorithm(other.to_string())),
    };
    let mut crypter = Crypter::new(ossl, mode, key, Some(iv))?;
    crypter.pad(false);
    Ok(Box::new(OpensslCipher { crypter, block_size }))
}

/// Builds the encrypt side for the named cipher, given the derived key/IV.
pub fn new_cipher(name: &str, key: &[u8], iv: &[u8], encrypting: bool) -> Result<Box<dyn Cipher>, Error> {
    if name == "none" {
        return Ok(Box::new(Clear));
    }
    let mode = if encrypting { Mode::Encrypt } else { Mode::Decrypt };
    make(name, mode, key, iv)
}

/// Byte length of the key and IV the named cipher requires.
pub fn key_iv_len(name: &str) -> (usize, usize) {
    match name {
        "aes256-ctr" => (32, 16),
        "aes128-ctr" => (16, 16),
        "3des-cbc" => (24, 8),
        "blowfish-cbc" => (16, 8),
        _ => (0, 0),
    }
}
