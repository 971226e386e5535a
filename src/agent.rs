// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The agent forwarder (spec.md §4.6): handles inbound
//! "auth-agent@openssh.com" channel opens and relays the OpenSSH agent
//! protocol between the remote peer and a locally configured provider.
use crate::channel::{ChannelHandler, ChannelOpenFailure, ChannelOperator, ChannelTable};
use crate::error::Result;
use crate::interceptor::{InterceptResult, Interceptor};
use crate::msg;
use crate::outbound::OutboundSink;
use cryptovec::CryptoVec;
use std::sync::{Arc, Mutex};
use thrussh_keys::encoding::{Encoding, Reader};

/// Answers OpenSSH agent protocol requests (draft-miller-ssh-agent):
/// receives one de-framed request body (opcode byte plus payload, without
/// the 4-byte length prefix) and returns the response body to frame back.
pub trait AgentProvider: Send {
    fn handle_message(&mut self, request: &[u8]) -> Vec<u8>;
}

pub struct AgentForwarder {
    channels: Arc<ChannelTable>,
    outbound: OutboundSink,
    local_window_size: u32,
    local_max_packet_size: u32,
    provider: Option<Arc<Mutex<Box<dyn AgentProvider>>>>,
}

impl AgentForwarder {
    pub fn new(
        channels: Arc<ChannelTable>,
        outbound: OutboundSink,
        local_window_size: u32,
        local_max_packet_size: u32,
        provider: Option<Box<dyn AgentProvider>>,
    ) -> Self {
        AgentForwarder {
            channels,
            outbound,
            local_window_size,
            local_max_packet_size,
            provider: provider.map(|p| Arc::new(Mutex::new(p))),
        }
    }

    fn handle_open(&self, payload: &[u8]) -> Result<()> {
        let mut r = payload.reader(1);
        let _channel_type = r.read_string()?;
        let remote_channel = r.read_u32()?;
        let initial_window = r.read_u32()?;
        let max_packet = r.read_u32()?;

        let provider = match &self.provider {
            Some(p) => p.clone(),
            None => return self.send_open_failure(remote_channel, ChannelOpenFailure::AdministrativelyProhibited),
        };

        let local_id = self.channels.allocate_id();
        let operator = ChannelOperator {
            local_id,
            remote_id: remote_channel,
            local_window_size: self.local_window_size,
            remote_window_size: initial_window,
            local_max_packet_size: self.local_max_packet_size,
            remote_max_packet_size: max_packet,
            confirmed: true,
            consumed_since_adjust: 0,
        };
        let handler = Box::new(AgentChannelHandler {
            remote_id: remote_channel,
            outbound: self.outbound.clone(),
            provider,
            buffer: Vec::new(),
        });
        self.channels.insert(operator, handler);

        let mut buf = CryptoVec::new();
        buf.push(msg::CHANNEL_OPEN_CONFIRMATION);
        buf.push_u32_be(remote_channel);
        buf.push_u32_be(local_id.0);
        buf.push_u32_be(self.local_window_size);
        buf.push_u32_be(self.local_max_packet_size);
        self.outbound.send(&buf)
    }

    fn send_open_failure(&self, remote_channel: u32, reason: ChannelOpenFailure) -> Result<()> {
        let mut buf = CryptoVec::new();
        buf.push(msg::CHANNEL_OPEN_FAILURE);
        buf.push_u32_be(remote_channel);
        buf.push_u32_be(reason.code());
        buf.extend_ssh_string(b"");
        buf.extend_ssh_string(b"");
        self.outbound.send(&buf)
    }
}

impl Interceptor for AgentForwarder {
    fn intercept(&mut self, payload: &[u8]) -> InterceptResult {
        if payload.is_empty() || payload[0] != msg::CHANNEL_OPEN {
            return InterceptResult::PassThrough;
        }
        let is_agent_channel = payload.reader(1).read_string().map(|s| s == b"auth-agent@openssh.com").unwrap_or(false);
        if !is_agent_channel {
            return InterceptResult::PassThrough;
        }
        let _ = self.handle_open(payload);
        InterceptResult::Consumed
    }
}

/// Per-channel agent-protocol relay: de-frames inbound `CHANNEL_DATA`
/// into individual (4-byte length, body) messages, hands each body to the
/// provider, and frames the response back the same way.
struct AgentChannelHandler {
    remote_id: u32,
    outbound: OutboundSink,
    provider: Arc<Mutex<Box<dyn AgentProvider>>>,
    buffer: Vec<u8>,
}

impl AgentChannelHandler {
    fn send_data(&self, body: &[u8]) {
        let mut buf = CryptoVec::new();
        buf.push(msg::CHANNEL_DATA);
        buf.push_u32_be(self.remote_id);
        buf.push_u32_be(body.len() as u32);
        buf.extend(body);
        let _ = self.outbound.send(&buf);
    }
}

impl ChannelHandler for AgentChannelHandler {
    fn data(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        loop {
            if self.buffer.len() < 4 {
                return;
            }
            let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
            if self.buffer.len() < 4 + len {
                return;
            }
            let request: Vec<u8> = self.buffer[4..4 + len].to_vec();
            self.buffer.drain(0..4 + len);

            let response = self.provider.lock().expect("agent provider lock poisoned").handle_message(&request);
            let mut framed = Vec::with_capacity(4 + response.len());
            framed.extend_from_slice(&(response.len() as u32).to_be_bytes());
            framed.extend_from_slice(&response);
            self.send_data(&framed);
        }
    }

    fn eof(&mut self) {}
    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_pipe;

    struct EchoProvider;
    impl AgentProvider for EchoProvider {
        fn handle_message(&mut self, request: &[u8]) -> Vec<u8> {
            request.to_vec()
        }
    }

    fn outbound_with_peer() -> (OutboundSink, test_pipe::PipeTransport) {
        let (local, peer) = test_pipe::pair();
        let write_transport: Arc<Mutex<Box<dyn crate::transport::Transport>>> = Arc::new(Mutex::new(Box::new(local)));
        let framer = Arc::new(crate::framer::Framer::new(262144));
        (OutboundSink::new(framer, write_transport), peer)
    }

    fn open_payload() -> CryptoVec {
        let mut payload = CryptoVec::new();
        payload.push(msg::CHANNEL_OPEN);
        payload.extend_ssh_string(b"auth-agent@openssh.com");
        payload.push_u32_be(11); // remote_channel
        payload.push_u32_be(2097152); // initial_window
        payload.push_u32_be(32768); // max_packet
        payload
    }

    #[test]
    fn intercept_ignores_non_agent_channel_open() {
        let (outbound, _peer) = outbound_with_peer();
        let mut forwarder = AgentForwarder::new(Arc::new(ChannelTable::new()), outbound, 2097152, 32768, Some(Box::new(EchoProvider)));
        let mut payload = CryptoVec::new();
        payload.push(msg::CHANNEL_OPEN);
        payload.extend_ssh_string(b"session");
        match forwarder.intercept(&payload) {
            InterceptResult::PassThrough => {}
            InterceptResult::Consumed => panic!("non-agent channel-open must pass through"),
        }
    }

    #[test]
    fn handle_open_without_provider_is_administratively_prohibited() {
        let (outbound, peer) = outbound_with_peer();
        let mut forwarder = AgentForwarder::new(Arc::new(ChannelTable::new()), outbound, 2097152, 32768, None);
        forwarder.intercept(&open_payload());

        let sent = peer.rx.recv_timeout(std::time::Duration::from_secs(1)).expect("open-failure packet sent");
        assert!(sent.iter().any(|&b| b == msg::CHANNEL_OPEN_FAILURE));
    }

    #[test]
    fn handle_open_with_provider_inserts_channel_and_confirms() {
        let (outbound, peer) = outbound_with_peer();
        let channels = Arc::new(ChannelTable::new());
        let mut forwarder = AgentForwarder::new(channels.clone(), outbound, 2097152, 32768, Some(Box::new(EchoProvider)));
        forwarder.intercept(&open_payload());

        assert_eq!(channels.len(), 1);
        let sent = peer.rx.recv_timeout(std::time::Duration::from_secs(1)).expect("confirmation packet sent");
        assert!(sent.iter().any(|&b| b == msg::CHANNEL_OPEN_CONFIRMATION));
    }

    #[test]
    fn data_buffers_partial_message_until_complete() {
        let (outbound, peer) = outbound_with_peer();
        let mut handler = AgentChannelHandler {
            remote_id: 3,
            outbound,
            provider: Arc::new(Mutex::new(Box::new(EchoProvider))),
            buffer: Vec::new(),
        };

        let mut framed = Vec::new();
        framed.extend_from_slice(&3u32.to_be_bytes());
        framed.extend_from_slice(b"abc");

        // Deliver the message split across two `data()` calls.
        handler.data(&framed[..2]);
        assert!(peer.rx.try_recv().is_err(), "incomplete message must not trigger a response yet");

        handler.data(&framed[2..]);
        let sent = peer.rx.recv_timeout(std::time::Duration::from_secs(1)).expect("response packet sent");
        assert!(sent.windows(3).any(|w| w == b"abc"), "echoed request body must appear in the response frame");
    }
}
