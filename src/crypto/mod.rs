// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! Cipher, MAC and KDF factories. Per spec.md §6, the primitive
//! implementations themselves are external collaborators the core merely
//! consumes; this module is the default, production-grade implementation of
//! those factory interfaces, built on `openssl` exactly as the teacher's
//! Cargo.toml already depends on it for this purpose.
pub mod cipher;
pub mod kdf;
pub mod mac;

pub use cipher::{new_cipher, Cipher};
pub use mac::{new_mac, Mac};

/// One direction's (cipher, mac) pair, as installed atomically by
/// `Framer::set_cipher` (spec.md §4.1).
pub struct CipherSuite {
    pub cipher: Box<dyn Cipher>,
    pub mac: Box<dyn Mac>,
}

impl CipherSuite {
    pub fn clear() -> Self {
        CipherSuite {
            cipher: Box::new(cipher::Clear),
            mac: Box::new(mac::ClearMac),
        }
    }
}
