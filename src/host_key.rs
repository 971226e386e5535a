// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The host-key verification callback (spec.md §6: "a predicate over
//! server identity + key fingerprint"), invoked once, on the first key
//! exchange only (spec.md §4.3 step 3).
use thrussh_keys::key::PublicKey;

/// Implemented by the application; consumed, not shipped with a trusting
/// default, since accepting any host key defeats the point of host-key
/// pinning.
pub trait HostKeyVerifier: Send {
    fn verify(&mut self, server_id: &str, key: &PublicKey) -> bool;
}

/// Accepts whatever the `predicate` closure returns.
pub struct ClosureVerifier<F: FnMut(&str, &PublicKey) -> bool + Send>(pub F);

impl<F: FnMut(&str, &PublicKey) -> bool + Send> HostKeyVerifier for ClosureVerifier<F> {
    fn verify(&mut self, server_id: &str, key: &PublicKey) -> bool {
        (self.0)(server_id, key)
    }
}

/// Test/throwaway-connection verifier that accepts every host key.
/// Never the default; callers must opt in explicitly.
pub struct AcceptAll;

impl HostKeyVerifier for AcceptAll {
    fn verify(&mut self, _server_id: &str, _key: &PublicKey) -> bool {
        true
    }
}
