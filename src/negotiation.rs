// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! Algorithm negotiation: parsing a peer's `KEXINIT` and picking, for every
//! algorithm family, "first client preference present in the server's list"
//! (spec.md §4.3 step 1).
use crate::config::Preferred;
use crate::error::Error;
use crate::msg;
use cryptovec::CryptoVec;
use thrussh_keys::encoding::{Encoding, Reader};

/// The algorithms chosen for one key exchange.
#[derive(Debug, Clone)]
pub struct Names {
    pub kex: String,
    pub key: String,
    pub cipher: String,
    pub mac: String,
}

/// A peer's parsed `KEXINIT` payload, as comma-separated name-lists.
#[derive(Debug, Clone)]
pub struct PeerKexInit {
    pub cookie: [u8; 16],
    pub kex: Vec<String>,
    pub key: Vec<String>,
    pub cipher_client_to_server: Vec<String>,
    pub cipher_server_to_client: Vec<String>,
    pub mac_client_to_server: Vec<String>,
    pub mac_server_to_client: Vec<String>,
    pub compression_client_to_server: Vec<String>,
    pub compression_server_to_client: Vec<String>,
    pub first_kex_packet_follows: bool,
}

fn name_list(bytes: &[u8]) -> Vec<String> {
    if bytes.is_empty() {
        return Vec::new();
    }
    bytes
        .split(|&b| b == b',')
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

impl PeerKexInit {
    /// Parses an inbound `SSH_MSG_KEXINIT` payload (opcode + 16-byte cookie +
    /// ten name-lists + first_kex_packet_follows + reserved u32).
    pub fn parse(buf: &[u8]) -> Result<PeerKexInit, Error> {
        if buf.is_empty() || buf[0] != msg::KEXINIT {
            return Err(Error::Kex("expected KEXINIT".into()));
        }
        let mut r = buf.reader(1);
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_bytes(16)?);
        let kex = name_list(r.read_string()?);
        let key = name_list(r.read_string()?);
        let cipher_client_to_server = name_list(r.read_string()?);
        let cipher_server_to_client = name_list(r.read_string()?);
        let mac_client_to_server = name_list(r.read_string()?);
        let mac_server_to_client = name_list(r.read_string()?);
        let compression_client_to_server = name_list(r.read_string()?);
        let compression_server_to_client = name_list(r.read_string()?);
        let _languages_client_to_server = r.read_string()?;
        let _languages_server_to_client = r.read_string()?;
        let first_kex_packet_follows = r.read_byte()? != 0;
        Ok(PeerKexInit {
            cookie,
            kex,
            key,
            cipher_client_to_server,
            cipher_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// Helper for reading a fixed number of raw bytes out of a `Reader` position.
trait ReadBytes {
    fn read_bytes(&mut self, n: usize) -> Result<&[u8], Error>;
}

impl<'a> ReadBytes for thrussh_keys::encoding::Position<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<&[u8], Error> {
        if self.position + n > self.s.len() {
            return Err(Error::IndexOutOfBounds);
        }
        let b = &self.s[self.position..self.position + n];
        self.position += n;
        Ok(b)
    }
}

fn join(names: &[&'static str]) -> String {
    names.join(",")
}

/// Writes our own `KEXINIT` payload (random cookie, our `Preferred` lists,
/// `first_kex_packet_follows = false` since we never speculatively guess).
pub fn write_kexinit(preferred: &Preferred, buf: &mut CryptoVec) {
    let mut cookie = [0u8; 16];
    use rand::RngCore;
    rand::thread_rng().fill_bytes(&mut cookie);
    buf.push(msg::KEXINIT);
    buf.extend(&cookie);
    buf.extend_ssh_string(join(preferred.kex).as_bytes());
    buf.extend_ssh_string(join(preferred.key).as_bytes());
    buf.extend_ssh_string(join(preferred.cipher).as_bytes());
    buf.extend_ssh_string(join(preferred.cipher).as_bytes());
    buf.extend_ssh_string(join(preferred.mac).as_bytes());
    buf.extend_ssh_string(join(preferred.mac).as_bytes());
    buf.extend_ssh_string(join(preferred.compression).as_bytes());
    buf.extend_ssh_string(join(preferred.compression).as_bytes());
    buf.extend_ssh_string(b""); // languages c->s
    buf.extend_ssh_string(b""); // languages s->c
    buf.push(0); // first_kex_packet_follows
    buf.push_u32_be(0); // reserved
}

fn pick(preference: &[&'static str], offered: &[String]) -> Option<String> {
    preference
        .iter()
        .find(|p| offered.iter().any(|o| o == *p))
        .map(|p| p.to_string())
}

/// Picks algorithms, one family at a time, as "first client preference
/// present in server's list"; a missing intersection in any family is fatal
/// (spec.md §4.3 step 1).
pub fn select(preferred: &Preferred, peer: &PeerKexInit) -> Result<Names, Error> {
    let kex = pick(preferred.kex, &peer.kex).ok_or(Error::NoCommonAlgorithm("kex".into()))?;
    let key = pick(preferred.key, &peer.key).ok_or(Error::NoCommonAlgorithm("host key".into()))?;
    let cipher = pick(preferred.cipher, &peer.cipher_server_to_client)
        .ok_or(Error::NoCommonAlgorithm("cipher".into()))?;
    let mac = pick(preferred.mac, &peer.mac_server_to_client).ok_or(Error::NoCommonAlgorithm("mac".into()))?;
    Ok(Names { kex, key, cipher, mac })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_with(kex: &[&str], key: &[&str], cipher: &[&str], mac: &[&str]) -> PeerKexInit {
        let strs = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        PeerKexInit {
            cookie: [0u8; 16],
            kex: strs(kex),
            key: strs(key),
            cipher_client_to_server: strs(cipher),
            cipher_server_to_client: strs(cipher),
            mac_client_to_server: strs(mac),
            mac_server_to_client: strs(mac),
            compression_client_to_server: vec!["none".into()],
            compression_server_to_client: vec!["none".into()],
            first_kex_packet_follows: false,
        }
    }

    #[test]
    fn picks_first_client_preference_present_in_server_list() {
        let preferred = Preferred::default();
        // Server offers group14-sha1 and group1-sha1; group16-sha512 (the client's
        // top preference) is absent, so the first match further down the client's
        // list wins, not the server's own ordering.
        let peer = peer_with(
            &["diffie-hellman-group1-sha1", "diffie-hellman-group14-sha1"],
            &["ssh-rsa"],
            &["aes256-ctr"],
            &["hmac-sha1"],
        );
        let names = select(&preferred, &peer).expect("should find a common kex");
        assert_eq!(names.kex, "diffie-hellman-group14-sha1");
        assert_eq!(names.key, "ssh-rsa");
        assert_eq!(names.cipher, "aes256-ctr");
        assert_eq!(names.mac, "hmac-sha1");
    }

    #[test]
    fn no_common_kex_is_fatal() {
        let preferred = Preferred::default();
        let peer = peer_with(&["diffie-hellman-group-exchange-sha1"], &["ssh-rsa"], &["aes256-ctr"], &["hmac-sha1"]);
        match select(&preferred, &peer) {
            Err(Error::NoCommonAlgorithm(family)) => assert_eq!(family, "kex"),
            other => panic!("expected NoCommonAlgorithm(\"kex\"), got {:?}", other),
        }
    }

    #[test]
    fn no_common_host_key_is_fatal() {
        let preferred = Preferred::default();
        let peer = peer_with(&["diffie-hellman-group14-sha1"], &["ssh-ed25519"], &["aes256-ctr"], &["hmac-sha1"]);
        match select(&preferred, &peer) {
            Err(Error::NoCommonAlgorithm(family)) => assert_eq!(family, "host key"),
            other => panic!("expected NoCommonAlgorithm(\"host key\"), got {:?}", other),
        }
    }

    #[test]
    fn no_common_cipher_is_fatal() {
        let preferred = Preferred::default();
        let peer = peer_with(&["diffie-hellman-group14-sha1"], &["ssh-rsa"], &["rc4"], &["hmac-sha1"]);
        match select(&preferred, &peer) {
            Err(Error::NoCommonAlgorithm(family)) => assert_eq!(family, "cipher"),
            other => panic!("expected NoCommonAlgorithm(\"cipher\"), got {:?}", other),
        }
    }

    #[test]
    fn no_common_mac_is_fatal() {
        let preferred = Preferred::default();
        let peer = peer_with(&["diffie-hellman-group14-sha1"], &["ssh-rsa"], &["aes256-ctr"], &["hmac-md5"]);
        match select(&preferred, &peer) {
            Err(Error::NoCommonAlgorithm(family)) => assert_eq!(family, "mac"),
            other => panic!("expected NoCommonAlgorithm(\"mac\"), got {:?}", other),
        }
    }

    #[test]
    fn group18_is_never_selected_even_if_server_offers_it() {
        let preferred = Preferred::default();
        let peer = peer_with(
            &["diffie-hellman-group18-sha512", "diffie-hellman-group14-sha1"],
            &["ssh-rsa"],
            &["aes256-ctr"],
            &["hmac-sha1"],
        );
        let names = select(&preferred, &peer).expect("should find a common kex");
        assert_eq!(names.kex, "diffie-hellman-group14-sha1");
    }

    #[test]
    fn parse_round_trips_against_write_kexinit() {
        let preferred = Preferred::default();
        let mut buf = CryptoVec::new();
        write_kexinit(&preferred, &mut buf);
        let parsed = PeerKexInit::parse(&buf).expect("our own KEXINIT must parse");
        assert_eq!(parsed.kex, preferred.kex.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        assert_eq!(parsed.key, preferred.key.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        assert!(!parsed.first_kex_packet_follows);
    }

    #[test]
    fn parse_rejects_non_kexinit_opcode() {
        let buf = [msg::NEWKEYS];
        match PeerKexInit::parse(&buf) {
            Err(Error::Kex(_)) => {}
            other => panic!("expected Error::Kex, got {:?}", other),
        }
    }

    #[test]
    fn name_list_of_empty_string_is_empty_vec() {
        assert!(name_list(b"").is_empty());
    }
}
