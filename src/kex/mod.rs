// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The key exchanger (spec.md §4.3): an interceptor that drives the
//! KEXINIT/KEXDH/NEWKEYS handshake, client- or server-initiated, and
//! installs new cipher+MAC pairs atomically via the `Framer`.
pub mod groups;

use crate::config::{Config, Preferred};
use crate::crypto::{new_cipher, new_mac, CipherSuite};
use crate::crypto::cipher::key_iv_len;
use crate::crypto::kdf::{derive, digest_for_kex};
use crate::crypto::mac::key_len as mac_key_len;
use crate::error::{Error, Result};
use crate::framer::Framer;
use crate::host_key::HostKeyVerifier;
use crate::interceptor::{InterceptResult, Interceptor};
use crate::msg;
use crate::negotiation::{self, Names, PeerKexInit};
use crate::outbound::OutboundSink;
use crate::response_slot::ResponseSlot;
use cryptovec::CryptoVec;
use log::{debug, warn};
use openssl::bn::{BigNum, BigNumContext};
use openssl::hash::Hasher;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thrussh_keys::encoding::{Encoding, Reader};
use thrussh_keys::key::PublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    InitiatedByClient,
    InitiatedByServer,
    KexInitReceived,
    WaitKexDHReply,
    WaitNewKeys,
    WaitUpdateCipher,
    Failed,
    ConnectionClosed,
}

struct Shared {
    preferred: Preferred,
    response_timeout: Duration,
    client_id: Vec<u8>,
    server_id: Vec<u8>,
    outbound: OutboundSink,
    framer: Arc<Framer>,
    host_key_verifier: Mutex<Box<dyn HostKeyVerifier>>,
    session_id: Mutex<Option<Vec<u8>>>,
    phase: Mutex<Phase>,
    kexinit_slot: ResponseSlot<Vec<u8>>,
    kexdh_reply_slot: ResponseSlot<Vec<u8>>,
    newkeys_slot: ResponseSlot<()>,
    swap_done_slot: ResponseSlot<()>,
}

/// An interceptor driving zero-or-more key exchanges over the connection's
/// lifetime (spec.md §4.3: "all of the above is reentrant"). Cheaply
/// `Clone`: every clone shares the same `Arc<Shared>`, so the `Connection`
/// can keep one handle for `exec_key_exchange`/`session_id` while another
/// lives in the interceptor chain.
#[derive(Clone)]
pub struct KeyExchanger {
    shared: Arc<Shared>,
}

impl KeyExchanger {
    pub fn new(
        config: &Config,
        client_id: Vec<u8>,
        server_id: Vec<u8>,
        framer: Arc<Framer>,
        outbound: OutboundSink,
        host_key_verifier: Box<dyn HostKeyVerifier>,
    ) -> Self {
        KeyExchanger {
            shared: Arc::new(Shared {
                preferred: config.preferred.clone(),
                response_timeout: config.response_timeout,
                client_id,
                server_id,
                outbound,
                framer,
                host_key_verifier: Mutex::new(host_key_verifier),
                session_id: Mutex::new(None),
                phase: Mutex::new(Phase::Idle),
                kexinit_slot: ResponseSlot::new(),
                kexdh_reply_slot: ResponseSlot::new(),
                newkeys_slot: ResponseSlot::new(),
                swap_done_slot: ResponseSlot::new(),
            }),
        }
    }

    /// The session identifier: the exchange hash of the first key exchange,
    /// immutable thereafter (spec.md §3's Invariants).
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.shared.session_id.lock().expect("session id lock poisoned").clone()
    }

    /// Client-initiated rekey (spec.md §4.3 Trigger): sends our KEXINIT
    /// synchronously and blocks on this thread until the whole handshake
    /// completes or fails.
    pub fn exec_key_exchange(&self) -> Result<()> {
        {
            let mut phase = self.shared.phase.lock().expect("kex phase lock poisoned");
            if *phase != Phase::Idle {
                return Err(Error::Inconsistent);
            }
            *phase = Phase::InitiatedByClient;
        }
        drive(&self.shared, None)
    }
}

impl Interceptor for KeyExchanger {
    fn intercept(&mut self, payload: &[u8]) -> InterceptResult {
        if payload.is_empty() {
            return InterceptResult::PassThrough;
        }
        match payload[0] {
            msg::KEXINIT => {
                let mut phase = self.shared.phase.lock().expect("kex phase lock poisoned");
                if *phase == Phase::Idle {
                    *phase = Phase::InitiatedByServer;
                    drop(phase);
                    let shared = self.shared.clone();
                    let payload = payload.to_vec();
                    thread::spawn(move || {
                        if let Err(e) = drive(&shared, Some(payload)) {
                            warn!("server-initiated key exchange failed: {}", e);
                            *shared.phase.lock().expect("kex phase lock poisoned") = Phase::Failed;
                        }
                    });
                } else {
                    drop(phase);
                    self.shared.kexinit_slot.handle().reply(payload.to_vec());
                }
                InterceptResult::Consumed
            }
            msg::KEXDH_REPLY => {
                self.shared.kexdh_reply_slot.handle().reply(payload.to_vec());
                InterceptResult::Consumed
            }
            msg::NEWKEYS => {
                // Unblock the driver, then wait for it to finish the atomic
                // inbound cipher swap before letting the reader loop move on
                // to the next packet (spec.md §5's NEWKEYS receive-thread
                // note).
                self.shared.newkeys_slot.handle().reply(());
                if let Err(e) = self.shared.swap_done_slot.wait(self.shared.response_timeout) {
                    warn!("key exchange did not complete its cipher swap: {}", e);
                }
                InterceptResult::Consumed
            }
            _ => InterceptResult::PassThrough,
        }
    }

    fn on_connection_closed(&mut self) {
        *self.shared.phase.lock().expect("kex phase lock poisoned") = Phase::ConnectionClosed;
        self.shared.kexinit_slot.handle().close();
        self.shared.kexdh_reply_slot.handle().close();
        self.shared.newkeys_slot.handle().close();
        self.shared.swap_done_slot.handle().close();
    }
}

/// Runs one complete key exchange to completion. `peer_kexinit` is `Some`
/// when the peer's KEXINIT already triggered this run (server-initiated);
/// otherwise our own KEXINIT is sent first and we wait for theirs.
fn drive(shared: &Arc<Shared>, peer_kexinit: Option<Vec<u8>>) -> Result<()> {
    let mut our_kexinit = CryptoVec::new();
    negotiation::write_kexinit(&shared.preferred, &mut our_kexinit);
    shared.outbound.send(&our_kexinit)?;

    let peer_payload = match peer_kexinit {
        Some(p) => p,
        None => shared.kexinit_slot.wait(shared.response_timeout)?,
    };
    *shared.phase.lock().expect("kex phase lock poisoned") = Phase::KexInitReceived;

    let peer = PeerKexInit::parse(&peer_payload)?;
    let names = negotiation::select(&shared.preferred, &peer)?;
    if peer.first_kex_packet_follows
        && (peer.kex.first().map(String::as_str) != Some(names.kex.as_str())
            || peer.key.first().map(String::as_str) != Some(names.key.as_str()))
    {
        return Err(Error::Kex("peer guessed a kex/host-key algorithm we did not select".into()));
    }

    let (prime, generator, exponent_bytes) = groups::for_kex_algorithm(&names.kex)
        .ok_or_else(|| Error::NoCommonAlgorithm(names.kex.clone()))?;
    let mut ctx = BigNumContext::new()?;
    let x = generate_private_exponent(&prime, exponent_bytes)?;
    let g = BigNum::from_u32(generator)?;
    let e = g.mod_exp(&x, &prime, &mut ctx)?;

    *shared.phase.lock().expect("kex phase lock poisoned") = Phase::WaitKexDHReply;
    let mut kexdh_init = CryptoVec::new();
    kexdh_init.push(msg::KEXDH_INIT);
    write_mpint(&mut kexdh_init, &e.to_vec());
    shared.outbound.send(&kexdh_init)?;

    let reply_payload = shared.kexdh_reply_slot.wait(shared.response_timeout)?;
    if reply_payload.is_empty() || reply_payload[0] != msg::KEXDH_REPLY {
        return Err(Error::Kex("expected KEXDH_REPLY".into()));
    }
    let mut r = reply_payload.reader(1);
    let host_key_blob = r.read_string()?;
    let f_bytes = r.read_string()?;
    let signature_blob = r.read_string()?;

    let f = BigNum::from_slice(strip_leading_zero(f_bytes))?;
    let k = f.mod_exp(&x, &prime, &mut ctx)?;

    let digest = digest_for_kex(&names.kex);
    let h = exchange_hash(
        digest,
        &shared.client_id,
        &shared.server_id,
        &our_kexinit,
        &peer_payload,
        host_key_blob,
        &e,
        &f,
        &k,
    )?;

    let host_key_algo = host_key_blob.reader(0).read_string()?;
    let host_key = PublicKey::parse(host_key_algo, host_key_blob).map_err(|_| Error::HostKeyMismatch)?;
    let mut sig_reader = signature_blob.reader(0);
    let _sig_algo = sig_reader.read_string()?;
    let raw_sig = sig_reader.read_string()?;
    if !host_key.verify_server_auth(&h, raw_sig) {
        return Err(Error::HostKeyMismatch);
    }

    let is_first_kex = {
        let mut session_id = shared.session_id.lock().expect("session id lock poisoned");
        let first = session_id.is_none();
        if first {
            *session_id = Some(h.clone());
        }
        first
    };
    if is_first_kex {
        let server_id = String::from_utf8_lossy(&shared.server_id).into_owned();
        let accepted = shared
            .host_key_verifier
            .lock()
            .expect("host key verifier lock poisoned")
            .verify(&server_id, &host_key);
        if !accepted {
            return Err(Error::HostKeyNotVerified);
        }
    }

    let session_id = shared.session_id.lock().expect("session id lock poisoned").clone().expect("session id set above");
    let k_mpint = to_mpint(&k.to_vec());
    let outbound_suite = build_cipher_suite(digest, &k_mpint, &h, &session_id, &names, b'C', b'A', b'E')?;
    let inbound_suite = build_cipher_suite(digest, &k_mpint, &h, &session_id, &names, b'D', b'B', b'F')?;

    *shared.phase.lock().expect("kex phase lock poisoned") = Phase::WaitNewKeys;
    shared.outbound.send(&[msg::NEWKEYS])?;
    shared.framer.set_outbound_cipher(outbound_suite);

    shared.newkeys_slot.wait(shared.response_timeout)?;
    *shared.phase.lock().expect("kex phase lock poisoned") = Phase::WaitUpdateCipher;
    shared.framer.set_inbound_cipher(inbound_suite);
    shared.swap_done_slot.handle().reply(());

    debug!("key exchange complete, kex={} cipher={} mac={}", names.kex, names.cipher, names.mac);
    *shared.phase.lock().expect("kex phase lock poisoned") = Phase::Idle;
    Ok(())
}

fn build_cipher_suite(
    digest: openssl::hash::MessageDigest,
    k: &[u8],
    h: &[u8],
    session_id: &[u8],
    names: &Names,
    key_letter: u8,
    iv_letter: u8,
    mac_letter: u8,
) -> Result<CipherSuite> {
    let (key_len, iv_len) = key_iv_len(&names.cipher);
    let key = derive(digest, k, h, key_letter, session_id, key_len);
    let iv = derive(digest, k, h, iv_letter, session_id, iv_len);
    let mac_key = derive(digest, k, h, mac_letter, session_id, mac_key_len(&names.mac));
    let encrypting = key_letter == b'C' || key_letter == b'A';
    let cipher = new_cipher(&names.cipher, &key, &iv, encrypting)?;
    let mac = new_mac(&names.mac, &mac_key)?;
    Ok(CipherSuite { cipher, mac })
}

/// 1 < x < (p-1)/2, `exponent_bytes` long (spec.md §4.3 step 2).
fn generate_private_exponent(prime: &BigNum, exponent_bytes: usize) -> Result<BigNum> {
    use rand::RngCore;
    let one = BigNum::from_u32(1)?;
    let p_minus_one = prime.checked_sub(&one)?;
    let half = p_minus_one.rshift1()?;

    loop {
        let mut bytes = vec![0u8; exponent_bytes];
        rand::thread_rng().fill_bytes(&mut bytes);
        let x = BigNum::from_slice(&bytes)?;
        if x > one && x < half {
            return Ok(x);
        }
    }
}

fn write_mpint(buf: &mut CryptoVec, bytes: &[u8]) {
    buf.extend_ssh_string(&to_mpint(bytes));
}

/// SSH2 mpint encoding: big-endian, with a leading zero byte if the
/// high-order bit would otherwise be set (RFC 4251 §5).
fn to_mpint(bytes: &[u8]) -> Vec<u8> {
    let bytes = strip_leading_zero(bytes);
    if bytes.is_empty() {
        return Vec::new();
    }
    if bytes[0] & 0x80 != 0 {
        let mut v = Vec::with_capacity(bytes.len() + 1);
        v.push(0);
        v.extend_from_slice(bytes);
        v
    } else {
        bytes.to_vec()
    }
}

fn strip_leading_zero(bytes: &[u8]) -> &[u8] {
    if bytes.len() > 1 && bytes[0] == 0 {
        &bytes[1..]
    } else {
        bytes
    }
}

#[allow(clippy::too_many_arguments)]
fn exchange_hash(
    digest: openssl::hash::MessageDigest,
    v_c: &[u8],
    v_s: &[u8],
    i_c: &[u8],
    i_s: &[u8],
    k_s: &[u8],
    e: &BigNum,
    f: &BigNum,
    k: &BigNum,
) -> Result<Vec<u8>> {
    let mut buf = CryptoVec::new();
    buf.extend_ssh_string(v_c);
    buf.extend_ssh_string(v_s);
    buf.extend_ssh_string(i_c);
    buf.extend_ssh_string(i_s);
    buf.extend_ssh_string(k_s);
    write_mpint(&mut buf, &e.to_vec());
    write_mpint(&mut buf, &f.to_vec());
    write_mpint(&mut buf, &k.to_vec());
    let mut hasher = Hasher::new(digest)?;
    hasher.update(&buf)?;
    Ok(hasher.finish()?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_mpint_pads_high_bit_values() {
        assert_eq!(to_mpint(&[0x80]), vec![0x00, 0x80]);
        assert_eq!(to_mpint(&[0x7f]), vec![0x7f]);
        assert_eq!(to_mpint(&[]), Vec::<u8>::new());
    }

    #[test]
    fn strip_leading_zero_removes_single_pad_byte() {
        assert_eq!(strip_leading_zero(&[0x00, 0x80]), &[0x80]);
        assert_eq!(strip_leading_zero(&[0x01, 0x02]), &[0x01, 0x02]);
    }

    #[test]
    fn generate_private_exponent_is_in_range() {
        let prime = BigNum::from_u32(65521).unwrap(); // a small prime, test-only
        let x = generate_private_exponent(&prime, 1).unwrap();
        let one = BigNum::from_u32(1).unwrap();
        assert!(x > one);
    }
}
