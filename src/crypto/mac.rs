// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
use crate::error::Error;
use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkey::PKey;
use openssl::sign::Signer;

/// Authenticates a packet; the wire input is always `sequence_number ||
/// plaintext_packet` (RFC 4253 §6.4, spec.md §4.1).
pub trait Mac: Send {
    fn len(&self) -> usize;
    fn sign(&self, sequence_number: u32, packet: &[u8]) -> Vec<u8>;
    fn verify(&self, sequence_number: u32, packet: &[u8], tag: &[u8]) -> bool {
        if tag.len() != self.len() {
            return false;
        }
        memcmp::eq(&self.sign(sequence_number, packet), tag)
    }
}

/// Before the first `NEWKEYS`, packets carry no MAC.
pub struct ClearMac;

impl Mac for ClearMac {
    fn len(&self) -> usize {
        0
    }
    fn sign(&self, _sequence_number: u32, _packet: &[u8]) -> Vec<u8> {
        Vec::new()
    }
    fn verify(&self, _sequence_number: u32, _packet: &[u8], tag: &[u8]) -> bool {
        tag.is_empty()
    }
}

struct HmacSha1 {
    key: PKey<openssl::pkey::Private>,
}

impl Mac for HmacSha1 {
    fn len(&self) -> usize {
        20
    }
    fn sign(&self, sequence_number: u32, packet: &[u8]) -> Vec<u8> {
        let mut signer = Signer::new(MessageDigest::sha1(), &self.key).expect("hmac signer");
        signer.update(&sequence_number.to_be_bytes()).expect("hmac update");
        signer.update(packet).expect("hmac update");
        signer.sign_to_vec().expect("hmac sign")
    }
}

/// Builds the MAC for the named algorithm over the given key material.
pub fn new_mac(name: &str, key: &[u8]) -> Result<Box<dyn Mac>, Error> {
    match name {
        "none" => Ok(Box::new(ClearMac)),
        "hmac-sha1" => {
            let key = PKey::hmac(key)?;
            Ok(Box::new(HmacSha1 { key }))
        }
        other => Err(Error::NoCommonAlgorithm(other.to_string())),
    }
}

/// Byte length of the key the named MAC requires.
pub fn key_len(name: &str) -> usize {
    match name {
        "hmac-sha1" => 20,
        _ => 0,
    }
}
