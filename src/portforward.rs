// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The remote port forwarder (spec.md §4.5): ListenForwardedPort and
//! CancelForwardedPort, each a global request serialized through a single
//! in-flight slot, plus the inbound "forwarded-tcpip" channel-open path
//! that delivers connections accepted on those remote listeners.
use crate::channel::{ChannelHandler, ChannelId, ChannelOpenFailure, ChannelOperator, ChannelTable};
use crate::error::{Error, Result};
use crate::interceptor::{InterceptResult, Interceptor};
use crate::msg;
use crate::outbound::OutboundSink;
use crate::response_slot::ResponseSlot;
use cryptovec::CryptoVec;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thrussh_keys::encoding::{Encoding, Reader};

/// Notified when a listener is confirmed, cancelled, or delivers an
/// inbound connection (spec.md §4.5).
pub trait PortForwardHandler: Send {
    fn listening(&mut self, addr: &str, port: u32) {
        let _ = (addr, port);
    }
    fn cancelled(&mut self, addr: &str, port: u32) {
        let _ = (addr, port);
    }
    /// Offered a new inbound connection from `originator_addr:originator_port`
    /// on the forwarded port. Returning `None` rejects it with the given
    /// failure reason; returning `Some` accepts it and supplies the
    /// channel's event handler (the "channel factory" of spec.md §4.5).
    fn accept(&mut self, originator_addr: &str, originator_port: u32) -> PortForwardDecision;
}

pub enum PortForwardDecision {
    Accept(Box<dyn ChannelHandler>),
    Reject(ChannelOpenFailure),
}

struct Registration {
    handler: Arc<Mutex<Box<dyn PortForwardHandler>>>,
}

enum GlobalRequestOutcome {
    Success { data: Vec<u8> },
    Failure,
}

struct Shared {
    response_timeout: Duration,
    outbound: OutboundSink,
    channels: Arc<ChannelTable>,
    request_gate: Mutex<()>,
    response_slot: ResponseSlot<GlobalRequestOutcome>,
    registry: Mutex<HashMap<(String, u32), Registration>>,
    local_window_size: u32,
    local_max_packet_size: u32,
}

/// Cheaply `Clone`: every clone shares the same `Arc<Shared>`.
#[derive(Clone)]
pub struct RemotePortForwarder {
    shared: Arc<Shared>,
}

impl RemotePortForwarder {
    pub fn new(
        response_timeout: Duration,
        outbound: OutboundSink,
        channels: Arc<ChannelTable>,
        local_window_size: u32,
        local_max_packet_size: u32,
    ) -> Self {
        RemotePortForwarder {
            shared: Arc::new(Shared {
                response_timeout,
                outbound,
                channels,
                request_gate: Mutex::new(()),
                response_slot: ResponseSlot::new(),
                registry: Mutex::new(HashMap::new()),
                local_window_size,
                local_max_packet_size,
            }),
        }
    }

    pub fn listen_forwarded_port(&self, handler: Box<dyn PortForwardHandler>, addr: &str, port: u32) -> Result<u32> {
        let _gate = self.shared.request_gate.lock().expect("port-forward request gate poisoned");

        let mut buf = CryptoVec::new();
        buf.push(msg::GLOBAL_REQUEST);
        buf.extend_ssh_string(b"tcpip-forward");
        buf.push(1); // want_reply
        buf.extend_ssh_string(addr.as_bytes());
        buf.push_u32_be(port);
        self.shared.outbound.send(&buf)?;

        match self.shared.response_slot.wait(self.shared.response_timeout)? {
            GlobalRequestOutcome::Success { data } => {
                let bound_port = if port == 0 {
                    data.reader(0).read_u32()?
                } else {
                    port
                };
                let handler = Arc::new(Mutex::new(handler));
                handler.lock().expect("port-forward handler poisoned").listening(addr, bound_port);
                self.shared
                    .registry
                    .lock()
                    .expect("port-forward registry poisoned")
                    .insert((addr.to_string(), bound_port), Registration { handler });
                Ok(bound_port)
            }
            GlobalRequestOutcome::Failure => Err(Error::RequestRefused),
        }
    }

    pub fn cancel_forwarded_port(&self, addr: &str, port: u32) -> Result<()> {
        let _gate = self.shared.request_gate.lock().expect("port-forward request gate poisoned");

        let mut buf = CryptoVec::new();
        buf.push(msg::GLOBAL_REQUEST);
        buf.extend_ssh_string(b"cancel-tcpip-forward");
        buf.push(1);
        buf.extend_ssh_string(addr.as_bytes());
        buf.push_u32_be(port);
        self.shared.outbound.send(&buf)?;

        match self.shared.response_slot.wait(self.shared.response_timeout)? {
            GlobalRequestOutcome::Success { .. } => {
                let mut registry = self.shared.registry.lock().expect("port-forward registry poisoned");
                if port == 0 {
                    registry.retain(|(a, _), reg| {
                        if a == addr {
                            reg.handler.lock().expect("port-forward handler poisoned").cancelled(addr, 0);
                            false
                        } else {
                            true
                        }
                    });
                } else if let Some(reg) = registry.remove(&(addr.to_string(), port)) {
                    reg.handler.lock().expect("port-forward handler poisoned").cancelled(addr, port);
                }
                Ok(())
            }
            GlobalRequestOutcome::Failure => Err(Error::RequestRefused),
        }
    }

    fn handle_forwarded_tcpip_open(&self, payload: &[u8]) -> Result<()> {
        let mut r = payload.reader(1);
        let _channel_type = r.read_string()?;
        let remote_channel = r.read_u32()?;
        let initial_window = r.read_u32()?;
        let max_packet = r.read_u32()?;
        let addr_connected = String::from_utf8_lossy(r.read_string()?).into_owned();
        let port_connected = r.read_u32()?;
        let originator_ip = String::from_utf8_lossy(r.read_string()?).into_owned();
        let originator_port = r.read_u32()?;

        let handler = {
            let registry = self.shared.registry.lock().expect("port-forward registry poisoned");
            registry.get(&(addr_connected.clone(), port_connected)).map(|reg| reg.handler.clone())
        };

        let handler = match handler {
            Some(h) => h,
            None => return self.send_open_failure(remote_channel, ChannelOpenFailure::AdministrativelyProhibited),
        };

        let decision = handler.lock().expect("port-forward handler poisoned").accept(&originator_ip, originator_port);
        match decision {
            PortForwardDecision::Reject(reason) => self.send_open_failure(remote_channel, reason),
            PortForwardDecision::Accept(channel_handler) => {
                let local_id = self.shared.channels.allocate_id();
                let operator = ChannelOperator {
                    local_id,
                    remote_id: remote_channel,
                    local_window_size: self.shared.local_window_size,
                    remote_window_size: initial_window,
                    local_max_packet_size: self.shared.local_max_packet_size,
                    remote_max_packet_size: max_packet,
                    confirmed: true,
                    consumed_since_adjust: 0,
                };
                self.shared.channels.insert(operator, channel_handler);

                let mut buf = CryptoVec::new();
                buf.push(msg::CHANNEL_OPEN_CONFIRMATION);
                buf.push_u32_be(remote_channel);
                buf.push_u32_be(local_id.0);
                buf.push_u32_be(self.shared.local_window_size);
                buf.push_u32_be(self.shared.local_max_packet_size);
                self.shared.outbound.send(&buf)
            }
        }
    }

    fn send_open_failure(&self, remote_channel: u32, reason: ChannelOpenFailure) -> Result<()> {
        let mut buf = CryptoVec::new();
        buf.push(msg::CHANNEL_OPEN_FAILURE);
        buf.push_u32_be(remote_channel);
        buf.push_u32_be(reason.code());
        buf.extend_ssh_string(b"");
        buf.extend_ssh_string(b"");
        self.shared.outbound.send(&buf)
    }
}

impl Interceptor for RemotePortForwarder {
    fn intercept(&mut self, payload: &[u8]) -> InterceptResult {
        if payload.is_empty() {
            return InterceptResult::PassThrough;
        }
        match payload[0] {
            msg::REQUEST_SUCCESS => {
                self.shared
                    .response_slot
                    .handle()
                    .reply(GlobalRequestOutcome::Success { data: payload[1..].to_vec() });
                InterceptResult::Consumed
            }
            msg::REQUEST_FAILURE => {
                self.shared.response_slot.handle().reply(GlobalRequestOutcome::Failure);
                InterceptResult::Consumed
            }
            msg::CHANNEL_OPEN => {
                let is_forwarded_tcpip = payload.reader(1).read_string().map(|s| s == b"forwarded-tcpip").unwrap_or(false);
                if !is_forwarded_tcpip {
                    return InterceptResult::PassThrough;
                }
                if let Err(err) = self.handle_forwarded_tcpip_open(payload) {
                    debug!("forwarded-tcpip open failed: {:?}", err);
                }
                InterceptResult::Consumed
            }
            _ => InterceptResult::PassThrough,
        }
    }

    fn on_connection_closed(&mut self) {
        self.shared.response_slot.handle().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_pipe;
    use std::thread;

    struct NullPortForwardHandler;
    impl PortForwardHandler for NullPortForwardHandler {
        fn accept(&mut self, _originator_addr: &str, _originator_port: u32) -> PortForwardDecision {
            PortForwardDecision::Reject(ChannelOpenFailure::AdministrativelyProhibited)
        }
    }

    struct NullChannelHandler;
    impl ChannelHandler for NullChannelHandler {}

    fn forwarder() -> (RemotePortForwarder, test_pipe::PipeTransport) {
        let (local, peer) = test_pipe::pair();
        let write_transport: Arc<Mutex<Box<dyn crate::transport::Transport>>> = Arc::new(Mutex::new(Box::new(local)));
        let framer = Arc::new(crate::framer::Framer::new(262144));
        let outbound = OutboundSink::new(framer, write_transport);
        let forwarder = RemotePortForwarder::new(Duration::from_secs(1), outbound, Arc::new(ChannelTable::new()), 2097152, 32768);
        (forwarder, peer)
    }

    fn global_request_reply(success: bool, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![if success { msg::REQUEST_SUCCESS } else { msg::REQUEST_FAILURE }];
        payload.extend_from_slice(data);
        payload
    }

    #[test]
    fn listen_forwarded_port_returns_bound_port_from_reply() {
        let (forwarder, _peer) = forwarder();
        let mut replier = forwarder.clone();
        thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            replier.intercept(&global_request_reply(true, &4022u32.to_be_bytes()));
        });
        let port = forwarder
            .listen_forwarded_port(Box::new(NullPortForwardHandler), "0.0.0.0", 0)
            .expect("server granted the requested port");
        assert_eq!(port, 4022);
    }

    #[test]
    fn listen_forwarded_port_failure_is_request_refused() {
        let (forwarder, _peer) = forwarder();
        let mut replier = forwarder.clone();
        thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            replier.intercept(&global_request_reply(false, &[]));
        });
        match forwarder.listen_forwarded_port(Box::new(NullPortForwardHandler), "0.0.0.0", 2222) {
            Err(Error::RequestRefused) => {}
            other => panic!("expected RequestRefused, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unregistered_forwarded_tcpip_open_is_administratively_prohibited() {
        let (forwarder, peer) = forwarder();
        let mut payload = CryptoVec::new();
        payload.push(msg::CHANNEL_OPEN);
        payload.extend_ssh_string(b"forwarded-tcpip");
        payload.push_u32_be(7); // remote_channel
        payload.push_u32_be(2097152); // initial_window
        payload.push_u32_be(32768); // max_packet
        payload.extend_ssh_string(b"0.0.0.0");
        payload.push_u32_be(4022);
        payload.extend_ssh_string(b"203.0.113.1");
        payload.push_u32_be(55555);

        forwarder.handle_forwarded_tcpip_open(&payload).unwrap();

        let sent = peer.rx.recv_timeout(std::time::Duration::from_secs(1)).expect("open-failure packet sent");
        assert!(sent.iter().any(|&b| b == msg::CHANNEL_OPEN_FAILURE));
    }

    #[test]
    fn registered_forwarded_tcpip_open_accept_inserts_channel_and_confirms() {
        let (forwarder, peer) = forwarder();
        forwarder
            .shared
            .registry
            .lock()
            .unwrap()
            .insert(("0.0.0.0".to_string(), 4022), Registration { handler: Arc::new(Mutex::new(Box::new(AcceptingHandler))) });

        let mut payload = CryptoVec::new();
        payload.push(msg::CHANNEL_OPEN);
        payload.extend_ssh_string(b"forwarded-tcpip");
        payload.push_u32_be(7);
        payload.push_u32_be(2097152);
        payload.push_u32_be(32768);
        payload.extend_ssh_string(b"0.0.0.0");
        payload.push_u32_be(4022);
        payload.extend_ssh_string(b"203.0.113.1");
        payload.push_u32_be(55555);

        forwarder.handle_forwarded_tcpip_open(&payload).unwrap();

        assert_eq!(forwarder.shared.channels.len(), 1);
        let sent = peer.rx.recv_timeout(std::time::Duration::from_secs(1)).expect("confirmation packet sent");
        assert!(sent.iter().any(|&b| b == msg::CHANNEL_OPEN_CONFIRMATION));
    }

    struct AcceptingHandler;
    impl PortForwardHandler for AcceptingHandler {
        fn accept(&mut self, _originator_addr: &str, _originator_port: u32) -> PortForwardDecision {
            PortForwardDecision::Accept(Box::new(NullChannelHandler))
        }
    }
}
