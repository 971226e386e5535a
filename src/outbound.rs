// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The single point every writer (user threads, the key exchanger, the user
//! authenticator, the port forwarder) goes through to put a packet on the
//! wire (spec.md §5: "the outbound socket is shared by all writers").
//! `Framer::send` already takes the transport lock's contents by exclusive
//! reference, so this just owns that lock and hands it over for the
//! duration of one send.
use crate::error::Result;
use crate::framer::Framer;
use crate::transport::Transport;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct OutboundSink {
    framer: Arc<Framer>,
    transport: Arc<Mutex<Box<dyn Transport>>>,
}

impl OutboundSink {
    pub fn new(framer: Arc<Framer>, transport: Arc<Mutex<Box<dyn Transport>>>) -> Self {
        OutboundSink { framer, transport }
    }

    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let mut transport = self.transport.lock().expect("transport lock poisoned");
        self.framer.send(&mut **transport, payload)
    }
}
