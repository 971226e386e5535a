// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! Binary packet framing, RFC 4253 §6 (spec.md §4.1). `Framer` owns
//! independent send/receive (cipher, MAC, sequence number) triples and
//! serializes both the outbound packet image and the sequence-number
//! increment inside one critical section per direction, so that no outbound
//! packet can straddle a `set_cipher` swap (spec.md §9: "the lock used for
//! cipher swaps ALSO serializes sequence-number increment").
use crate::crypto::CipherSuite;
use crate::error::Error;
use crate::transport::Transport;
use rand::RngCore;
use std::sync::Mutex;

struct Direction {
    suite: CipherSuite,
    sequence_number: u32,
}

impl Direction {
    fn next_sequence_number(&mut self) -> Result<u32, Error> {
        let n = self.sequence_number;
        self.sequence_number = self
            .sequence_number
            .checked_add(1)
            .ok_or(Error::SequenceNumberOverflow)?;
        Ok(n)
    }
}

pub struct Framer {
    outbound: Mutex<Direction>,
    inbound: Mutex<Direction>,
    max_decrypted_packet_size: usize,
}

impl Framer {
    pub fn new(max_decrypted_packet_size: usize) -> Self {
        Framer {
            outbound: Mutex::new(Direction {
                suite: CipherSuite::clear(),
                sequence_number: 0,
            }),
            inbound: Mutex::new(Direction {
                suite: CipherSuite::clear(),
                sequence_number: 0,
            }),
            max_decrypted_packet_size,
        }
    }

    /// Atomically replaces the outbound or inbound (cipher, MAC) pair.
    /// Callers MUST send `NEWKEYS` immediately before swapping the outbound
    /// pair, and swap the inbound pair immediately after receiving the
    /// peer's `NEWKEYS` (spec.md §4.1/§4.3 step 4).
    pub fn set_outbound_cipher(&self, suite: CipherSuite) {
        let mut d = self.outbound.lock().expect("outbound cipher lock poisoned");
        d.suite = suite;
    }

    pub fn set_inbound_cipher(&self, suite: CipherSuite) {
        let mut d = self.inbound.lock().expect("inbound cipher lock poisoned");
        d.suite = suite;
    }

    /// Builds the length-prefixed, padded, optionally-encrypted-and-MACed
    /// packet image for `payload` and writes it to `transport`, under the
    /// outbound critical section.
    pub fn send(&self, transport: &mut dyn Transport, payload: &[u8]) -> Result<(), Error> {
        let mut d = self.outbound.lock().expect("outbound cipher lock poisoned");
        let block_size = d.suite.cipher.block_size().max(8);
        let mut packet = Vec::with_capacity(4 + 1 + payload.len() + block_size);
        // uint32 packet_length (filled below) + byte padding_length + payload + padding
        packet.extend_from_slice(&[0u8; 4]);
        packet.push(0); // padding_length placeholder
        packet.extend_from_slice(payload);

        let unpadded_len = 1 + payload.len();
        let mut padding_len = block_size - ((4 + unpadded_len) % block_size);
        if padding_len < 4 {
            padding_len += block_size;
        }
        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);
        packet.extend_from_slice(&padding);

        let packet_length = (packet.len() - 4) as u32;
        packet[0..4].copy_from_slice(&packet_length.to_be_bytes());
        packet[4] = padding_len as u8;

        let sequence_number = d.next_sequence_number()?;
        let mac = d.suite.mac.sign(sequence_number, &packet);
        d.suite.cipher.apply(&mut packet)?;
        transport.send(&packet)?;
        if !mac.is_empty() {
            transport.send(&mac)?;
        }
        Ok(())
    }

    /// Reads one packet: decrypts the first cipher block to learn
    /// `packet_length`, reads the remainder plus MAC tag, decrypts, verifies
    /// the MAC over `sequence_number || plaintext`, and returns the payload
    /// (opcode + body) with the 1-byte padding-length and padding stripped.
    pub fn recv(&self, transport: &mut dyn Transport) -> Result<Vec<u8>, Error> {
        let mut d = self.inbound.lock().expect("inbound cipher lock poisoned");
        let block_size = d.suite.cipher.block_size().max(8);

        let mut first_block = vec![0u8; block_size];
        read_exact(transport, &mut first_block)?;
        let mut to_decrypt = first_block.clone();
        d.suite.cipher.apply(&mut to_decrypt)?;
        let packet_length = u32::from_be_bytes([to_decrypt[0], to_decrypt[1], to_decrypt[2], to_decrypt[3]]) as usize;

        if packet_length > self.max_decrypted_packet_size {
            return Err(Error::PacketTooLarge(packet_length, self.max_decrypted_packet_size));
        }
        let total_len = 4 + packet_length;
        let mut rest = vec![0u8; total_len.saturating_sub(block_size)];
        read_exact(transport, &mut rest)?;
        let mut plaintext = to_decrypt;
        if !rest.is_empty() {
            let mut decrypted_rest = rest.clone();
            d.suite.cipher.apply(&mut decrypted_rest)?;
            plaintext.extend_from_slice(&decrypted_rest);
        }

        let mac_len = d.suite.mac.len();
        let mut mac_tag = vec![0u8; mac_len];
        if mac_len > 0 {
            read_exact(transport, &mut mac_tag)?;
        }

        let sequence_number = d.next_sequence_number()?;
        if mac_len > 0 && !d.suite.mac.verify(sequence_number, &plaintext, &mac_tag) {
            return Err(Error::MacMismatch);
        }

        let padding_length = plaintext[4] as usize;
        if 1 + padding_length > packet_length {
            return Err(Error::InvalidPacketLength);
        }
        let payload_len = packet_length - 1 - padding_length;
        Ok(plaintext[5..5 + payload_len].to_vec())
    }
}

fn read_exact(transport: &mut dyn Transport, buf: &mut [u8]) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.recv(&mut buf[filled..])?;
        if n == 0 {
            return Err(Error::Disconnected);
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_pipe;

    #[test]
    fn round_trips_cleartext_packets() {
        let (mut a, mut b) = test_pipe::pair();
        let framer = Framer::new(1 << 16);
        framer.send(&mut a, b"hello").unwrap();
        let payload = framer.recv(&mut b).unwrap();
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn sequence_numbers_advance_monotonically() {
        let (mut a, mut b) = test_pipe::pair();
        let framer = Framer::new(1 << 16);
        for i in 0..5u8 {
            framer.send(&mut a, &[i]).unwrap();
        }
        for i in 0..5u8 {
            let payload = framer.recv(&mut b).unwrap();
            assert_eq!(&payload[..], &[i]);
        }
    }
}
