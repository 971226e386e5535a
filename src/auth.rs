// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The user authenticator (spec.md §4.4): an interceptor implementing the
//! "ssh-userauth" service and the password, public-key and
//! keyboard-interactive methods. Installed after the first successful key
//! exchange.
use crate::connection::ConnectionShared;
use crate::error::{Error, Result};
use crate::interceptor::{InterceptResult, Interceptor};
use crate::msg;
use crate::outbound::OutboundSink;
use crate::response_slot::ResponseSlot;
use cryptovec::CryptoVec;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use thrussh_keys::encoding::{Encoding, Reader};
use thrussh_keys::key::KeyPair;

/// One of the three authentication methods spec.md §4.4 names.
pub enum Credential {
    Password(String),
    PublicKey(Arc<KeyPair>),
}

/// Result of one password/public-key authentication attempt, or of a
/// completed keyboard-interactive loop. `SSH_MSG_USERAUTH_FAILURE` is not a
/// variant here: it is reported as `Err(Error::AuthenticationFailed)` and
/// closes the connection (spec.md §7, §8 scenario 3); this crate does not
/// implement multi-method auth chaining.
#[derive(Debug, Clone, Copy)]
pub enum AuthOutcome {
    Success,
}

/// One keyboard-interactive round: a name, free-text instruction, and a
/// list of (prompt text, echo) pairs (spec.md §4.4).
pub struct PromptRequest {
    pub name: String,
    pub instruction: String,
    pub prompts: Vec<(String, bool)>,
}

/// Supplies responses to a keyboard-interactive prompt. Runs on a
/// background thread and may block indefinitely on user input (spec.md
/// §4.4/§5: "unbounded; NOT covered by the 5s response timeout").
pub trait PromptHandler: Send {
    fn respond(&mut self, request: &PromptRequest) -> Vec<String>;
}

/// Delivered out-of-band events: banners (may arrive at any time) and the
/// completion of an asynchronous keyboard-interactive run.
pub trait AuthEventHandler: Send {
    #[allow(unused_variables)]
    fn banner(&mut self, text: &str) {}
    #[allow(unused_variables)]
    fn keyboard_interactive_complete(&mut self, outcome: Result<AuthOutcome>) {}
}

enum UserAuthEvent {
    Success,
    Failure { partial_success: bool, remaining_methods: Vec<String> },
    InfoRequest(PromptRequest),
}

#[derive(PartialEq)]
enum ServiceState {
    NotRequested,
    Requested,
    Accepted,
}

struct Shared {
    /// Filled in once the first key exchange completes; every auth method
    /// needs it, but the authenticator is installed in the interceptor
    /// chain (so it can catch an eager `SERVICE_ACCEPT`/`BANNER`) before
    /// that happens (spec.md §4.4, §9).
    session_id: Mutex<Option<Vec<u8>>>,
    response_timeout: Duration,
    outbound: OutboundSink,
    service_state: Mutex<ServiceState>,
    service_slot: ResponseSlot<()>,
    response_slot: ResponseSlot<UserAuthEvent>,
    keyboard_interactive_active: AtomicBool,
    event_handler: Mutex<Box<dyn AuthEventHandler>>,
    /// Set once, right after construction, so a `USERAUTH_FAILURE` can close
    /// the connection (spec.md §7: "the connection is closed"). `Weak` to
    /// avoid a reference cycle: `Connection` owns this authenticator through
    /// the interceptor chain, so a strong back-reference would never drop.
    connection: Mutex<Option<Weak<ConnectionShared>>>,
}

impl Shared {
    fn close_connection(&self) {
        if let Some(connection) = self.connection.lock().expect("auth connection handle lock poisoned").as_ref().and_then(Weak::upgrade) {
            connection.close_fatal();
        }
    }
}

/// Cheaply `Clone`: every clone shares the same `Arc<Shared>`.
#[derive(Clone)]
pub struct UserAuthenticator {
    shared: Arc<Shared>,
}

impl UserAuthenticator {
    pub fn new(response_timeout: Duration, outbound: OutboundSink, event_handler: Box<dyn AuthEventHandler>) -> Self {
        UserAuthenticator {
            shared: Arc::new(Shared {
                session_id: Mutex::new(None),
                response_timeout,
                outbound,
                service_state: Mutex::new(ServiceState::NotRequested),
                service_slot: ResponseSlot::new(),
                response_slot: ResponseSlot::new(),
                keyboard_interactive_active: AtomicBool::new(false),
                event_handler: Mutex::new(event_handler),
                connection: Mutex::new(None),
            }),
        }
    }

    /// Set once, right after the first key exchange completes.
    pub fn set_session_id(&self, session_id: Vec<u8>) {
        *self.shared.session_id.lock().expect("auth session id lock poisoned") = Some(session_id);
    }

    /// Set once, right after construction, so authentication failure can
    /// close the connection.
    pub fn set_connection(&self, connection: Weak<ConnectionShared>) {
        *self.shared.connection.lock().expect("auth connection handle lock poisoned") = Some(connection);
    }

    /// Password or public-key authentication: blocks until SUCCESS or
    /// FAILURE (spec.md §4.4's WaitResponse state).
    pub fn exec_authentication(&self, user: &str, credential: &Credential) -> Result<AuthOutcome> {
        self.ensure_service_accepted()?;
        match credential {
            Credential::Password(password) => self.send_password_request(user, password)?,
            Credential::PublicKey(key) => self.send_publickey_request(user, key)?,
        }
        match self.shared.response_slot.wait(self.shared.response_timeout)? {
            UserAuthEvent::Success => Ok(AuthOutcome::Success),
            UserAuthEvent::Failure { partial_success, remaining_methods } => {
                self.shared.close_connection();
                Err(Error::AuthenticationFailed { partial_success, remaining_methods })
            }
            UserAuthEvent::InfoRequest(_) => Err(Error::Inconsistent),
        }
    }

    /// Keyboard-interactive authentication: returns immediately after
    /// sending the initial request (the connection observes this as
    /// `AwaitingPromptResponse`, spec.md §4.4); the loop runs on a spawned
    /// thread and reports completion through the configured
    /// [`AuthEventHandler`].
    pub fn exec_keyboard_interactive(&self, user: &str, mut handler: Box<dyn PromptHandler>) -> Result<()> {
        self.ensure_service_accepted()?;
        self.shared.keyboard_interactive_active.store(true, Ordering::SeqCst);

        let mut buf = CryptoVec::new();
        buf.push(msg::USERAUTH_REQUEST);
        buf.extend_ssh_string(user.as_bytes());
        buf.extend_ssh_string(b"ssh-connection");
        buf.extend_ssh_string(b"keyboard-interactive");
        buf.extend_ssh_string(b""); // language tag
        buf.extend_ssh_string(b""); // submethods
        self.shared.outbound.send(&buf)?;

        let shared = self.shared.clone();
        thread::spawn(move || {
            let outcome = keyboard_interactive_loop(&shared, handler.as_mut());
            shared.keyboard_interactive_active.store(false, Ordering::SeqCst);
            shared
                .event_handler
                .lock()
                .expect("auth event handler lock poisoned")
                .keyboard_interactive_complete(outcome);
        });
        Ok(())
    }

    fn ensure_service_accepted(&self) -> Result<()> {
        let should_send = {
            let mut state = self.shared.service_state.lock().expect("service state lock poisoned");
            match *state {
                ServiceState::Accepted => return Ok(()),
                ServiceState::Requested => false,
                ServiceState::NotRequested => {
                    *state = ServiceState::Requested;
                    true
                }
            }
        };
        if should_send {
            let mut buf = CryptoVec::new();
            buf.push(msg::SERVICE_REQUEST);
            buf.extend_ssh_string(b"ssh-userauth");
            self.shared.outbound.send(&buf)?;
        }
        self.shared.service_slot.wait(self.shared.response_timeout)?;
        *self.shared.service_state.lock().expect("service state lock poisoned") = ServiceState::Accepted;
        Ok(())
    }

    fn send_password_request(&self, user: &str, password: &str) -> Result<()> {
        let mut buf = CryptoVec::new();
        buf.push(msg::USERAUTH_REQUEST);
        buf.extend_ssh_string(user.as_bytes());
        buf.extend_ssh_string(b"ssh-connection");
        buf.extend_ssh_string(b"password");
        buf.push(0);
        buf.extend_ssh_string(password.as_bytes());
        self.shared.outbound.send(&buf)
    }

    fn send_publickey_request(&self, user: &str, key: &KeyPair) -> Result<()> {
        let session_id = self
            .shared
            .session_id
            .lock()
            .expect("auth session id lock poisoned")
            .clone()
            .ok_or(Error::Inconsistent)?;
        let mut buf = CryptoVec::new();
        buf.extend_ssh_string(session_id.as_slice());
        let body_start = buf.len();
        buf.push(msg::USERAUTH_REQUEST);
        buf.extend_ssh_string(user.as_bytes());
        buf.extend_ssh_string(b"ssh-connection");
        buf.extend_ssh_string(b"publickey");
        buf.push(1);
        buf.extend_ssh_string(key.name().as_bytes());
        key.push_to(&mut buf);
        key.add_self_signature(&mut buf)?;
        self.shared.outbound.send(&buf[body_start..])
    }
}

impl Interceptor for UserAuthenticator {
    fn intercept(&mut self, payload: &[u8]) -> InterceptResult {
        if payload.is_empty() {
            return InterceptResult::PassThrough;
        }
        match payload[0] {
            msg::SERVICE_ACCEPT => {
                let service = match payload.reader(1).read_string() {
                    Ok(s) => s,
                    Err(_) => return InterceptResult::PassThrough,
                };
                if service == b"ssh-userauth" {
                    self.shared.service_slot.handle().reply(());
                    InterceptResult::Consumed
                } else {
                    InterceptResult::PassThrough
                }
            }
            msg::USERAUTH_BANNER => {
                if let Ok(banner) = payload.reader(1).read_string() {
                    if let Ok(text) = std::str::from_utf8(banner) {
                        self.shared.event_handler.lock().expect("auth event handler lock poisoned").banner(text);
                    }
                }
                InterceptResult::Consumed
            }
            msg::USERAUTH_SUCCESS => {
                debug!("userauth success");
                self.shared.response_slot.handle().reply(UserAuthEvent::Success);
                InterceptResult::Finished
            }
            msg::USERAUTH_FAILURE => match parse_failure(payload) {
                Ok(event) => {
                    self.shared.response_slot.handle().reply(event);
                    InterceptResult::Consumed
                }
                Err(_) => InterceptResult::PassThrough,
            },
            msg::USERAUTH_INFO_REQUEST if self.shared.keyboard_interactive_active.load(Ordering::SeqCst) => {
                match parse_info_request(payload) {
                    Ok(request) => {
                        self.shared.response_slot.handle().reply(UserAuthEvent::InfoRequest(request));
                        InterceptResult::Consumed
                    }
                    Err(_) => InterceptResult::PassThrough,
                }
            }
            _ => InterceptResult::PassThrough,
        }
    }

    fn on_connection_closed(&mut self) {
        self.shared.service_slot.handle().close();
        self.shared.response_slot.handle().close();
    }
}

fn parse_failure(payload: &[u8]) -> Result<UserAuthEvent> {
    let mut r = payload.reader(1);
    let remaining_raw = r.read_string()?;
    let partial_success = r.read_byte()? != 0;
    let remaining_methods = remaining_raw
        .split(|&b| b == b',')
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    Ok(UserAuthEvent::Failure { partial_success, remaining_methods })
}

fn parse_info_request(payload: &[u8]) -> Result<PromptRequest> {
    let mut r = payload.reader(1);
    let name = String::from_utf8_lossy(r.read_string()?).into_owned();
    let instruction = String::from_utf8_lossy(r.read_string()?).into_owned();
    let _language = r.read_string()?;
    let num_prompts = r.read_u32()?;
    let mut prompts = Vec::with_capacity(num_prompts as usize);
    for _ in 0..num_prompts {
        let prompt = String::from_utf8_lossy(r.read_string()?).into_owned();
        let echo = r.read_byte()? != 0;
        prompts.push((prompt, echo));
    }
    Ok(PromptRequest { name, instruction, prompts })
}

fn keyboard_interactive_loop(shared: &Arc<Shared>, handler: &mut dyn PromptHandler) -> Result<AuthOutcome> {
    loop {
        match shared.response_slot.wait(shared.response_timeout)? {
            UserAuthEvent::Success => return Ok(AuthOutcome::Success),
            UserAuthEvent::Failure { partial_success, remaining_methods } => {
                shared.close_connection();
                return Err(Error::AuthenticationFailed { partial_success, remaining_methods });
            }
            UserAuthEvent::InfoRequest(request) => {
                let responses = handler.respond(&request);
                let mut buf = CryptoVec::new();
                buf.push(msg::USERAUTH_INFO_RESPONSE);
                buf.push_u32_be(responses.len() as u32);
                for response in &responses {
                    buf.extend_ssh_string(response.as_bytes());
                }
                shared.outbound.send(&buf)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failure_splits_remaining_methods() {
        let mut payload = vec![msg::USERAUTH_FAILURE];
        let methods = b"publickey,password";
        payload.extend_from_slice(&(methods.len() as u32).to_be_bytes());
        payload.extend_from_slice(methods);
        payload.push(0);
        match parse_failure(&payload).unwrap() {
            UserAuthEvent::Failure { partial_success, remaining_methods } => {
                assert!(!partial_success);
                assert_eq!(remaining_methods, vec!["publickey".to_string(), "password".to_string()]);
            }
            _ => panic!("expected Failure"),
        }
    }

    #[test]
    fn parse_info_request_reads_all_prompts() {
        let mut payload = vec![msg::USERAUTH_INFO_REQUEST];
        payload.extend_from_slice(&0u32.to_be_bytes()); // name
        payload.extend_from_slice(&0u32.to_be_bytes()); // instruction
        payload.extend_from_slice(&0u32.to_be_bytes()); // language
        payload.extend_from_slice(&1u32.to_be_bytes()); // num_prompts
        let prompt = b"Password: ";
        payload.extend_from_slice(&(prompt.len() as u32).to_be_bytes());
        payload.extend_from_slice(prompt);
        payload.push(0); // echo = false
        let request = parse_info_request(&payload).unwrap();
        assert_eq!(request.prompts, vec![("Password: ".to_string(), false)]);
    }
}
