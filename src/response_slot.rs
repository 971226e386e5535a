// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The "response slot" a waiting thread parks on while an interceptor's
//! state machine is mid-flight (spec.md §9: "better modeled as a bounded
//! (capacity 1) rendezvous channel"). Used by the key exchanger, the user
//! authenticator and the remote port forwarder for their "await a reply"
//! suspension points (spec.md §5).
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

/// Delivered to a thread parked on a [`ResponseSlot`].
pub enum SlotMessage<T> {
    Reply(T),
    /// Injected by [`crate::interceptor::Interceptor::on_connection_closed`]
    /// to unblock a waiter when the connection goes away.
    ConnectionClosed,
}

pub struct ResponseSlot<T> {
    sender: SyncSender<SlotMessage<T>>,
    receiver: Receiver<SlotMessage<T>>,
}

impl<T> ResponseSlot<T> {
    pub fn new() -> Self {
        let (sender, receiver) = sync_channel(1);
        ResponseSlot { sender, receiver }
    }

    pub fn handle(&self) -> ResponseHandle<T> {
        ResponseHandle { sender: self.sender.clone() }
    }

    /// Blocks until a reply arrives, the connection closes, or `timeout`
    /// elapses — the per-step response timeout of spec.md §4.3/§4.4/§4.5.
    pub fn wait(&self, timeout: Duration) -> crate::error::Result<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(SlotMessage::Reply(value)) => Ok(value),
            Ok(SlotMessage::ConnectionClosed) => Err(crate::error::Error::Disconnected),
            Err(RecvTimeoutError::Timeout) => Err(crate::error::Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(crate::error::Error::Disconnected),
        }
    }
}

#[derive(Clone)]
pub struct ResponseHandle<T> {
    sender: SyncSender<SlotMessage<T>>,
}

impl<T> ResponseHandle<T> {
    pub fn reply(&self, value: T) {
        let _ = self.sender.try_send(SlotMessage::Reply(value));
    }

    pub fn close(&self) {
        let _ = self.sender.try_send(SlotMessage::ConnectionClosed);
    }
}
