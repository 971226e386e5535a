// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The packet-interceptor fabric (spec.md §4.2): an ordered chain of
//! stateful consumers, each able to claim an inbound packet for the
//! duration of its own state machine, so that sub-protocols can share one
//! packet stream without a monolithic dispatcher.
use std::sync::Mutex;

/// What an interceptor did with one inbound packet.
pub enum InterceptResult {
    /// Fully handled; the chain stops here for this packet.
    Consumed,
    /// Not interested; offer the packet to the next interceptor (or default
    /// dispatch if this was the last one).
    PassThrough,
    /// Handled, and this interceptor is now done for good; it is removed
    /// from the chain after this call.
    Finished,
}

/// A stateful consumer that may claim selected inbound packets
/// (spec.md's GLOSSARY: "Interceptor").
pub trait Interceptor: Send {
    fn intercept(&mut self, payload: &[u8]) -> InterceptResult;

    /// Called once, on every interceptor still in the chain, when the
    /// connection is closing. Implementations must unblock any thread
    /// waiting on an internal response slot by injecting a synthetic
    /// terminating packet (spec.md §4.2, §5 Cancellation).
    fn on_connection_closed(&mut self) {}
}

/// The ordered chain itself. `offer` is called once per inbound packet from
/// the connection's single reader thread; `Consumed` and `Finished` both
/// stop the walk, `Finished` additionally drops the interceptor afterwards.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Mutex<Vec<Box<dyn Interceptor>>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        InterceptorChain {
            interceptors: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, interceptor: Box<dyn Interceptor>) {
        self.interceptors.lock().expect("interceptor chain lock poisoned").push(interceptor);
    }

    /// Offers `payload` to each interceptor in insertion order. Returns
    /// `true` if some interceptor consumed it (no default dispatch should
    /// run), `false` if every interceptor passed (default dispatch should
    /// run).
    pub fn offer(&self, payload: &[u8]) -> bool {
        let mut interceptors = self.interceptors.lock().expect("interceptor chain lock poisoned");
        let mut finished_index = None;
        let mut claimed = false;
        for (i, interceptor) in interceptors.iter_mut().enumerate() {
            match interceptor.intercept(payload) {
                InterceptResult::Consumed => {
                    claimed = true;
                    break;
                }
                InterceptResult::Finished => {
                    claimed = true;
                    finished_index = Some(i);
                    break;
                }
                InterceptResult::PassThrough => continue,
            }
        }
        if let Some(i) = finished_index {
            interceptors.remove(i);
        }
        claimed
    }

    /// Notifies every interceptor that the connection has closed
    /// (spec.md §4.2).
    pub fn close(&self) {
        let mut interceptors = self.interceptors.lock().expect("interceptor chain lock poisoned");
        for interceptor in interceptors.iter_mut() {
            interceptor.on_connection_closed();
        }
        interceptors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingInterceptor {
        claims: u8,
        seen: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Interceptor for CountingInterceptor {
        fn intercept(&mut self, _payload: &[u8]) -> InterceptResult {
            self.seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.claims > 0 {
                self.claims -= 1;
                InterceptResult::Consumed
            } else {
                InterceptResult::PassThrough
            }
        }
    }

    #[test]
    fn stops_at_first_consumer() {
        let chain = InterceptorChain::new();
        let seen_a = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_b = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        chain.push(Box::new(CountingInterceptor { claims: 1, seen: seen_a.clone() }));
        chain.push(Box::new(CountingInterceptor { claims: 1, seen: seen_b.clone() }));

        assert!(chain.offer(&[1]));
        assert_eq!(seen_a.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(seen_b.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn falls_through_to_default_dispatch_when_all_pass() {
        let chain = InterceptorChain::new();
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        chain.push(Box::new(CountingInterceptor { claims: 0, seen: seen.clone() }));
        assert!(!chain.offer(&[1]));
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
