// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The SSH2 key derivation function, RFC 4253 §7.2, used once per key
//! exchange at `NEWKEYS` (spec.md §4.3 step 4) to turn (k, H, session_id)
//! into the six directional keys.
use openssl::hash::{Hasher, MessageDigest};

/// Picks the KEX hash (SHA-1/256/512) from the negotiated kex algorithm
/// name's suffix, per spec.md §4.3 step 3.
pub fn digest_for_kex(kex_algorithm: &str) -> MessageDigest {
    if kex_algorithm.ends_with("sha512") {
        MessageDigest::sha512()
    } else if kex_algorithm.ends_with("sha256") {
        MessageDigest::sha256()
    } else {
        MessageDigest::sha1()
    }
}

/// `Kx = HASH(K || H || X || session_id)`, then `Kn+1 = HASH(K || H ||
/// K1 || ... || Kn)`, concatenated and truncated to `out_len` bytes.
pub fn derive(digest: MessageDigest, k: &[u8], h: &[u8], letter: u8, session_id: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len + digest.size());
    let mut block = hash_round(digest, k, h, Some((letter, session_id)), &[]);
    out.extend_from_slice(&block);
    while out.len() < out_len {
        block = hash_round(digest, k, h, None, &out);
        out.extend_from_slice(&block);
    }
    out.truncate(out_len);
    out
}

fn hash_round(digest: MessageDigest, k: &[u8], h: &[u8], seed: Option<(u8, &[u8])>, prior: &[u8]) -> Vec<u8> {
    let mut hasher = Hasher::new(digest).expect("hasher init");
    hasher.update(k).expect("hasher update");
    hasher.update(h).expect("hasher update");
    if let Some((letter, session_id)) = seed {
        hasher.update(&[letter]).expect("hasher update");
        hasher.update(session_id).expect("hasher update");
    } else {
        hasher.update(prior).expect("hasher update");
    }
    hasher.finish().expect("hasher finish").to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic_and_extends() {
        let k = b"\x00\x00\x00\x01\x07";
        let h = b"exchange-hash";
        let session_id = b"session-id";
        let short = derive(MessageDigest::sha1(), k, h, b'A', session_id, 16);
        let long = derive(MessageDigest::sha1(), k, h, b'A', session_id, 40);
        assert_eq!(short.len(), 16);
        assert_eq!(long.len(), 40);
        assert_eq!(&long[..16], &short[..]);
    }
}
