// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The `Connection`: owns the transport, framer, interceptor chain and
//! channel table, drives the version exchange and first key exchange, and
//! is the public surface applications call into (spec.md §3, §4.7, §6).
use crate::agent::{AgentForwarder, AgentProvider};
use crate::auth::{AuthEventHandler, AuthOutcome, Credential, PromptHandler, UserAuthenticator};
use crate::channel::{ChannelHandler, ChannelId, ChannelOpenFailure, ChannelOperator, ChannelTable};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::framer::Framer;
use crate::host_key::HostKeyVerifier;
use crate::interceptor::InterceptorChain;
use crate::kex::KeyExchanger;
use crate::msg;
use crate::outbound::OutboundSink;
use crate::portforward::{PortForwardHandler, RemotePortForwarder};
use crate::response_slot::{ResponseHandle, ResponseSlot};
use crate::transport::{Status, Transport};
use crate::transport::TcpTransport;
use cryptovec::CryptoVec;
use log::{debug, warn};
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thrussh_keys::encoding::{Encoding, Reader};

/// The authentication state spec.md §3's Data Model requires on `Connection`.
/// `AwaitingPromptResponse` is the state observed between
/// `Connection::authenticate_keyboard_interactive` returning and its
/// completion event firing (spec.md §4.4/§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NotAttempted,
    Success,
    Failure,
    AwaitingPromptResponse,
}

/// Receives the connection-level events that have no more specific home:
/// DISCONNECT, IGNORE, DEBUG, anything not otherwise claimed, and fatal
/// errors (spec.md §4.7, §7).
pub trait ConnectionEventHandler: Send {
    fn on_disconnect(&mut self, reason_code: u32, description: &str) {
        let _ = (reason_code, description);
    }
    fn on_ignore(&mut self, data: &[u8]) {
        let _ = data;
    }
    fn on_debug(&mut self, always_display: bool, message: &str) {
        let _ = (always_display, message);
    }
    fn on_unknown(&mut self, opcode: u8, payload: &[u8]) {
        let _ = (opcode, payload);
    }
    fn on_error(&mut self, err: &Error) {
        let _ = err;
    }
}

pub(crate) struct ConnectionShared {
    framer: Arc<Framer>,
    write_transport: Arc<Mutex<Box<dyn Transport>>>,
    interceptors: Arc<InterceptorChain>,
    channels: Arc<ChannelTable>,
    event_handler: Mutex<Box<dyn ConnectionEventHandler>>,
    closed: AtomicBool,
}

impl ConnectionShared {
    fn send_raw(&self, payload: &[u8]) -> Result<()> {
        let mut transport = self.write_transport.lock().expect("transport lock poisoned");
        self.framer.send(&mut **transport, payload)
    }

    /// Closes the connection from a context that does not already hold the
    /// interceptor chain's lock (spec.md §7: authentication failure closes
    /// the connection). Never call this from inside `Interceptor::intercept`
    /// — `InterceptorChain::offer` and `::close` share one `Mutex`.
    pub(crate) fn close_fatal(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.interceptors.close();
        let mut transport = self.write_transport.lock().expect("transport lock poisoned");
        let _ = transport.shutdown();
    }

    fn default_dispatch(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        match payload[0] {
            msg::DISCONNECT => {
                let mut r = payload.reader(1);
                let (code, description) = match (r.read_u32(), r.read_string()) {
                    (Ok(code), Ok(desc)) => (code, String::from_utf8_lossy(desc).into_owned()),
                    _ => (0, String::new()),
                };
                debug!("peer disconnected: {} {}", code, description);
                self.closed.store(true, Ordering::SeqCst);
                self.event_handler.lock().expect("connection event handler lock poisoned").on_disconnect(code, &description);
            }
            msg::IGNORE => {
                if let Ok(data) = payload.reader(1).read_string() {
                    self.event_handler.lock().expect("connection event handler lock poisoned").on_ignore(data);
                }
            }
            msg::DEBUG => {
                let mut r = payload.reader(1);
                let always_display = r.read_byte().unwrap_or(0) != 0;
                let message = r.read_string().map(|m| String::from_utf8_lossy(m).into_owned()).unwrap_or_default();
                self.event_handler.lock().expect("connection event handler lock poisoned").on_debug(always_display, &message);
            }
            opcode if msg::is_channel_message(opcode) => self.dispatch_channel_message(opcode, payload),
            opcode => {
                self.event_handler.lock().expect("connection event handler lock poisoned").on_unknown(opcode, payload);
            }
        }
    }

    fn dispatch_channel_message(&self, opcode: u8, payload: &[u8]) {
        let mut r = payload.reader(1);
        let channel_num = match r.read_u32() {
            Ok(n) => ChannelId(n),
            Err(_) => return,
        };
        match opcode {
            msg::CHANNEL_OPEN_CONFIRMATION => {
                let remote_id = r.read_u32().unwrap_or(0);
                let remote_window = r.read_u32().unwrap_or(0);
                let remote_max_packet = r.read_u32().unwrap_or(0);
                self.channels.with_mut(channel_num, |op, handler| {
                    op.remote_id = remote_id;
                    op.remote_window_size = remote_window;
                    op.remote_max_packet_size = remote_max_packet;
                    op.confirmed = true;
                    handler.open_confirmed();
                });
            }
            msg::CHANNEL_OPEN_FAILURE => {
                let reason = r.read_u32().ok().and_then(ChannelOpenFailure::from_u32).unwrap_or(ChannelOpenFailure::ConnectFailed);
                let description = r.read_string().map(|d| String::from_utf8_lossy(d).into_owned()).unwrap_or_default();
                self.channels.with_mut(channel_num, |_, handler| handler.open_failed(reason, &description));
                self.channels.remove(channel_num);
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                let amount = r.read_u32().unwrap_or(0);
                self.channels.with_mut(channel_num, |op, handler| {
                    op.remote_window_size = op.remote_window_size.saturating_add(amount);
                    handler.window_adjusted(op.remote_window_size);
                });
            }
            msg::CHANNEL_DATA => {
                if let Ok(data) = r.read_string() {
                    let len = data.len() as u32;
                    self.channels.with_mut(channel_num, |_, handler| handler.data(data));
                    self.maybe_adjust_window(channel_num, len);
                }
            }
            msg::CHANNEL_EXTENDED_DATA => {
                let code = r.read_u32().unwrap_or(0);
                if let Ok(data) = r.read_string() {
                    let len = data.len() as u32;
                    self.channels.with_mut(channel_num, |_, handler| handler.extended_data(code, data));
                    self.maybe_adjust_window(channel_num, len);
                }
            }
            msg::CHANNEL_EOF => {
                self.channels.with_mut(channel_num, |_, handler| handler.eof());
            }
            msg::CHANNEL_CLOSE => {
                self.channels.with_mut(channel_num, |_, handler| handler.close());
                self.channels.remove(channel_num);
            }
            msg::CHANNEL_SUCCESS => {
                self.channels.with_mut(channel_num, |_, handler| handler.request_success());
            }
            msg::CHANNEL_FAILURE => {
                self.channels.with_mut(channel_num, |_, handler| handler.request_failure());
            }
            _ => {
                self.event_handler.lock().expect("connection event handler lock poisoned").on_unknown(opcode, payload);
            }
        }
    }

    /// Channel-level flow control (SPEC_FULL.md §H): replenishes the local
    /// window with `SSH_MSG_CHANNEL_WINDOW_ADJUST` once consumed data
    /// crosses half the advertised window, mirroring the teacher's
    /// `adjust_window_size`/`window_size` bookkeeping.
    fn maybe_adjust_window(&self, channel_num: ChannelId, consumed: u32) {
        let adjust = self
            .channels
            .with_mut(channel_num, |op, _| {
                op.consumed_since_adjust = op.consumed_since_adjust.saturating_add(consumed);
                let low_water = (op.local_window_size / 2).max(1);
                if op.consumed_since_adjust >= low_water {
                    let amount = op.consumed_since_adjust;
                    op.consumed_since_adjust = 0;
                    Some((op.remote_id, amount))
                } else {
                    None
                }
            })
            .flatten();
        if let Some((remote_id, amount)) = adjust {
            let mut buf = CryptoVec::new();
            buf.push(msg::CHANNEL_WINDOW_ADJUST);
            buf.push_u32_be(remote_id);
            buf.push_u32_be(amount);
            if let Err(err) = self.send_raw(&buf) {
                debug!("failed to send channel window adjust: {}", err);
            }
        }
    }
}

/// The SSH client connection core: one TCP socket, one framer, one
/// interceptor chain, one channel table (spec.md §3).
pub struct Connection {
    config: Config,
    shared: Arc<ConnectionShared>,
    key_exchanger: KeyExchanger,
    authenticator: UserAuthenticator,
    port_forwarder: RemotePortForwarder,
    auth_state: Arc<Mutex<AuthState>>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Opens the TCP socket, exchanges versions, and runs the first key
    /// exchange to completion before returning (spec.md §4.3, §6).
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        config: Config,
        host_key_verifier: Box<dyn HostKeyVerifier>,
        event_handler: Box<dyn ConnectionEventHandler>,
        agent_provider: Option<Box<dyn AgentProvider>>,
    ) -> Result<Connection> {
        let transport: Box<dyn Transport> = Box::new(TcpTransport::connect(addr, config.connect_timeout)?);
        Connection::connect_with_transport(transport, config, host_key_verifier, event_handler, agent_provider)
    }

    /// Runs the handshake over a caller-supplied transport (spec.md §6:
    /// the transport is an external collaborator, not limited to TCP).
    pub fn connect_with_transport(
        mut transport: Box<dyn Transport>,
        config: Config,
        host_key_verifier: Box<dyn HostKeyVerifier>,
        event_handler: Box<dyn ConnectionEventHandler>,
        agent_provider: Option<Box<dyn AgentProvider>>,
    ) -> Result<Connection> {
        let client_id = format!("SSH-2.0-{}", config.client_id);
        transport.send(client_id.as_bytes())?;
        transport.send(config.version_eol.as_bytes())?;
        let server_id = read_version_line(transport.as_mut())?;

        let read_transport = transport.try_clone()?;
        let write_transport: Arc<Mutex<Box<dyn Transport>>> = Arc::new(Mutex::new(transport));

        let framer = Arc::new(Framer::new(config.maximum_decrypted_packet_size));
        let outbound = OutboundSink::new(framer.clone(), write_transport.clone());
        let interceptors = Arc::new(InterceptorChain::new());
        let channels = Arc::new(ChannelTable::new());

        let key_exchanger = KeyExchanger::new(
            &config,
            client_id.into_bytes(),
            server_id.into_bytes(),
            framer.clone(),
            outbound.clone(),
            host_key_verifier,
        );

        let shared = Arc::new(ConnectionShared {
            framer: framer.clone(),
            write_transport: write_transport.clone(),
            interceptors: interceptors.clone(),
            channels: channels.clone(),
            event_handler: Mutex::new(event_handler),
            closed: AtomicBool::new(false),
        });

        let auth_state = Arc::new(Mutex::new(AuthState::NotAttempted));

        // Registered before the reader thread starts so an eager
        // SERVICE_ACCEPT/BANNER from the server is never missed; the
        // authenticator's session_id is filled in once kex completes.
        let authenticator = UserAuthenticator::new(
            config.response_timeout,
            outbound.clone(),
            Box::new(ConnectionAuthEventHandler { auth_state: auth_state.clone() }),
        );
        authenticator.set_connection(Arc::downgrade(&shared));
        let port_forwarder = RemotePortForwarder::new(
            config.response_timeout,
            outbound.clone(),
            channels.clone(),
            config.window_size,
            config.maximum_packet_size,
        );
        let agent_forwarder = AgentForwarder::new(channels.clone(), outbound.clone(), config.window_size, config.maximum_packet_size, agent_provider);

        interceptors.push(Box::new(key_exchanger.clone()));
        interceptors.push(Box::new(authenticator.clone()));
        interceptors.push(Box::new(port_forwarder.clone()));
        interceptors.push(Box::new(agent_forwarder));

        let reader_shared = shared.clone();
        let reader_thread = thread::spawn(move || run_reader_loop(reader_shared, read_transport));

        key_exchanger.exec_key_exchange()?;
        let session_id = key_exchanger.session_id().ok_or(Error::Inconsistent)?;
        authenticator.set_session_id(session_id);

        Ok(Connection {
            config,
            shared,
            key_exchanger,
            authenticator,
            port_forwarder,
            auth_state,
            reader_thread: Mutex::new(Some(reader_thread)),
        })
    }

    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.key_exchanger.session_id()
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    /// The connection's authentication state (spec.md §3 Data Model).
    pub fn auth_state(&self) -> AuthState {
        *self.auth_state.lock().expect("auth state lock poisoned")
    }

    /// Blocks until SUCCESS or FAILURE for password/public-key credentials.
    /// On `SSH_MSG_USERAUTH_FAILURE` the connection is closed and this
    /// returns `Err(Error::AuthenticationFailed { .. })` (spec.md §7, §8
    /// scenario 3).
    pub fn authenticate(&self, user: &str, credential: &Credential) -> Result<AuthOutcome> {
        let result = self.authenticator.exec_authentication(user, credential);
        let mut state = self.auth_state.lock().expect("auth state lock poisoned");
        match &result {
            Ok(AuthOutcome::Success) => *state = AuthState::Success,
            Err(Error::AuthenticationFailed { .. }) => *state = AuthState::Failure,
            _ => {}
        }
        result
    }

    /// Returns immediately, having set `AuthState::AwaitingPromptResponse`;
    /// completion is reported through the `AuthEventHandler` given to the
    /// authenticator (spec.md §4.4/§9: "the original caller of Connect()
    /// must return AwaitingPromptResponse without waiting for
    /// keyboard-interactive completion").
    pub fn authenticate_keyboard_interactive(&self, user: &str, handler: Box<dyn PromptHandler>) -> Result<()> {
        self.authenticator.exec_keyboard_interactive(user, handler)?;
        *self.auth_state.lock().expect("auth state lock poisoned") = AuthState::AwaitingPromptResponse;
        Ok(())
    }

    pub fn listen_forwarded_port(&self, handler: Box<dyn PortForwardHandler>, addr: &str, port: u32) -> Result<u32> {
        self.port_forwarder.listen_forwarded_port(handler, addr, port)
    }

    pub fn cancel_forwarded_port(&self, addr: &str, port: u32) -> Result<()> {
        self.port_forwarder.cancel_forwarded_port(addr, port)
    }

    /// Opens a locally initiated channel of the given `channel_type`
    /// ("session", "direct-tcpip", ...). The caller sends the subsequent
    /// request (shell/exec/subsystem) once `ChannelHandler::open_confirmed`
    /// fires.
    pub fn open_channel(&self, channel_type: &str, extra: &[u8], handler: Box<dyn ChannelHandler>) -> Result<ChannelId> {
        let local_id = self.shared.channels.allocate_id();
        let operator = ChannelOperator {
            local_id,
            remote_id: 0,
            local_window_size: self.config.window_size,
            remote_window_size: 0,
            local_max_packet_size: self.config.maximum_packet_size,
            remote_max_packet_size: 0,
            confirmed: false,
            consumed_since_adjust: 0,
        };
        self.shared.channels.insert(operator, handler);

        let mut buf = CryptoVec::new();
        buf.push(msg::CHANNEL_OPEN);
        buf.extend_ssh_string(channel_type.as_bytes());
        buf.push_u32_be(local_id.0);
        buf.push_u32_be(self.config.window_size);
        buf.push_u32_be(self.config.maximum_packet_size);
        buf.extend(extra);
        self.send_raw(&buf)?;
        Ok(local_id)
    }

    /// `ForwardLocalPort`: opens a `direct-tcpip` channel toward
    /// `(remote_addr, remote_port)`, reporting `(originator_addr,
    /// originator_port)` as the local end (spec.md §6).
    pub fn forward_local_port(
        &self,
        remote_addr: &str,
        remote_port: u32,
        originator_addr: &str,
        originator_port: u32,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<ChannelId> {
        let mut extra = CryptoVec::new();
        extra.extend_ssh_string(remote_addr.as_bytes());
        extra.push_u32_be(remote_port);
        extra.extend_ssh_string(originator_addr.as_bytes());
        extra.push_u32_be(originator_port);
        self.open_channel("direct-tcpip", &extra, handler)
    }

    /// `OpenShell`: opens a `session` channel and requests an interactive
    /// shell (RFC 4254 §6.1, §6.5), blocking until the full handshake
    /// completes.
    pub fn open_shell(&self, handler: Box<dyn ChannelHandler>) -> Result<ChannelId> {
        self.open_session_channel("shell", None, handler)
    }

    /// `ExecCommand`: opens a `session` channel and requests execution of
    /// `command` (RFC 4254 §6.5), blocking until the full handshake
    /// completes.
    pub fn exec_command(&self, command: &str, handler: Box<dyn ChannelHandler>) -> Result<ChannelId> {
        self.open_session_channel("exec", Some(ssh_string(command.as_bytes())), handler)
    }

    /// `OpenSubsystem`: opens a `session` channel and requests the named
    /// subsystem (RFC 4254 §6.5), blocking until the full handshake
    /// completes.
    pub fn open_subsystem(&self, name: &str, handler: Box<dyn ChannelHandler>) -> Result<ChannelId> {
        self.open_session_channel("subsystem", Some(ssh_string(name.as_bytes())), handler)
    }

    /// RFC 4254 §6.1/§6.5: `CHANNEL_OPEN("session")`, wait for
    /// `CHANNEL_OPEN_CONFIRMATION`/`FAILURE`, then `CHANNEL_REQUEST` and wait
    /// for `CHANNEL_SUCCESS`/`FAILURE`, before handing the caller an opened
    /// channel (SPEC_FULL.md §H, spec.md §6).
    fn open_session_channel(&self, request_type: &str, request_data: Option<Vec<u8>>, handler: Box<dyn ChannelHandler>) -> Result<ChannelId> {
        let open_slot = ResponseSlot::new();
        let request_slot = ResponseSlot::new();
        let wrapped = Box::new(PendingSessionHandler {
            inner: handler,
            open_result: open_slot.handle(),
            request_result: request_slot.handle(),
            handshake_done: AtomicBool::new(false),
        });

        let local_id = self.open_channel("session", &[], wrapped)?;

        match open_slot.wait(self.config.response_timeout)? {
            Ok(()) => {}
            Err(reason) => return Err(Error::ChannelOpenRejected(reason)),
        }

        let remote_id = self.shared.channels.with_mut(local_id, |op, _| op.remote_id).ok_or(Error::WrongChannel)?;
        let mut buf = CryptoVec::new();
        buf.push(msg::CHANNEL_REQUEST);
        buf.push_u32_be(remote_id);
        buf.extend_ssh_string(request_type.as_bytes());
        buf.push(1); // want_reply
        if let Some(data) = &request_data {
            buf.extend(data);
        }
        self.send_raw(&buf)?;

        match request_slot.wait(self.config.response_timeout)? {
            true => Ok(local_id),
            false => Err(Error::ChannelRequestRejected(request_type.to_string())),
        }
    }

    pub fn send_channel_data(&self, channel: ChannelId, data: &[u8]) -> Result<()> {
        let remote_id = self
            .shared
            .channels
            .with_mut(channel, |op, _| op.remote_id)
            .ok_or(Error::WrongChannel)?;
        let mut buf = CryptoVec::new();
        buf.push(msg::CHANNEL_DATA);
        buf.push_u32_be(remote_id);
        buf.extend_ssh_string(data);
        self.send_raw(&buf)
    }

    pub fn close_channel(&self, channel: ChannelId) -> Result<()> {
        let remote_id = self
            .shared
            .channels
            .with_mut(channel, |op, _| op.remote_id)
            .ok_or(Error::WrongChannel)?;
        let mut buf = CryptoVec::new();
        buf.push(msg::CHANNEL_CLOSE);
        buf.push_u32_be(remote_id);
        self.send_raw(&buf)?;
        self.shared.channels.remove(channel);
        Ok(())
    }

    /// `SendIgnorable`: an `SSH_MSG_IGNORE` the peer must silently discard
    /// (RFC 4253 §11.2), used e.g. to pad traffic analysis or as a
    /// keepalive.
    pub fn send_ignorable(&self, data: &[u8]) -> Result<()> {
        let mut buf = CryptoVec::new();
        buf.push(msg::IGNORE);
        buf.extend_ssh_string(data);
        self.send_raw(&buf)
    }

    pub fn disconnect(&self, reason_code: u32, message: &str) -> Result<()> {
        let mut buf = CryptoVec::new();
        buf.push(msg::DISCONNECT);
        buf.push_u32_be(reason_code);
        buf.extend_ssh_string(message.as_bytes());
        buf.extend_ssh_string(b"");
        let result = self.send_raw(&buf);
        self.shared.close_fatal();
        result
    }

    fn send_raw(&self, payload: &[u8]) -> Result<()> {
        self.shared.send_raw(payload)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_thread.lock().expect("reader thread lock poisoned").take() {
            if !handle.is_finished() {
                let mut transport = self.shared.write_transport.lock().expect("transport lock poisoned");
                let _ = transport.shutdown();
            }
        }
    }
}

/// Keeps `Connection::auth_state()` current for the asynchronous
/// keyboard-interactive completion path (spec.md §4.4/§9).
struct ConnectionAuthEventHandler {
    auth_state: Arc<Mutex<AuthState>>,
}

impl AuthEventHandler for ConnectionAuthEventHandler {
    fn keyboard_interactive_complete(&mut self, outcome: Result<AuthOutcome>) {
        let mut state = self.auth_state.lock().expect("auth state lock poisoned");
        *state = match outcome {
            Ok(AuthOutcome::Success) => AuthState::Success,
            Err(_) => AuthState::Failure,
        };
    }
}

/// Wraps a caller-supplied [`ChannelHandler`] for the duration of the
/// `session` channel-open-then-channel-request handshake (RFC 4254
/// §6.1/§6.5), resolving the two [`ResponseSlot`]s `open_session_channel`
/// blocks on. Forwarding continues afterwards so the caller's handler keeps
/// receiving ordinary channel events.
struct PendingSessionHandler {
    inner: Box<dyn ChannelHandler>,
    open_result: ResponseHandle<std::result::Result<(), ChannelOpenFailure>>,
    request_result: ResponseHandle<bool>,
    handshake_done: AtomicBool,
}

impl ChannelHandler for PendingSessionHandler {
    fn open_confirmed(&mut self) {
        self.open_result.reply(Ok(()));
        self.inner.open_confirmed();
    }
    fn open_failed(&mut self, reason: ChannelOpenFailure, description: &str) {
        self.open_result.reply(Err(reason));
        self.inner.open_failed(reason, description);
    }
    fn data(&mut self, data: &[u8]) {
        self.inner.data(data);
    }
    fn extended_data(&mut self, code: u32, data: &[u8]) {
        self.inner.extended_data(code, data);
    }
    fn eof(&mut self) {
        self.inner.eof();
    }
    fn close(&mut self) {
        self.inner.close();
    }
    fn window_adjusted(&mut self, new_window: u32) {
        self.inner.window_adjusted(new_window);
    }
    fn request_success(&mut self) {
        if !self.handshake_done.swap(true, Ordering::SeqCst) {
            self.request_result.reply(true);
        } else {
            self.inner.request_success();
        }
    }
    fn request_failure(&mut self) {
        if !self.handshake_done.swap(true, Ordering::SeqCst) {
            self.request_result.reply(false);
        } else {
            self.inner.request_failure();
        }
    }
}

/// RFC 4254 §6.5 request-specific data: a single length-prefixed string.
fn ssh_string(bytes: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + bytes.len());
    v.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    v.extend_from_slice(bytes);
    v
}

fn run_reader_loop(shared: Arc<ConnectionShared>, mut transport: Box<dyn Transport>) {
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        match shared.framer.recv(transport.as_mut()) {
            Ok(payload) => {
                if !shared.interceptors.offer(&payload) {
                    shared.default_dispatch(&payload);
                }
            }
            Err(err) => {
                warn!("transport read failed, closing connection: {}", err);
                shared.closed.store(true, Ordering::SeqCst);
                shared.event_handler.lock().expect("connection event handler lock poisoned").on_error(&err);
                shared.interceptors.close();
                break;
            }
        }
        if transport.status() == Status::Closed {
            shared.closed.store(true, Ordering::SeqCst);
            shared.interceptors.close();
            break;
        }
    }
}

/// Reads the peer's identification line (RFC 4253 §4.2): lines preceding
/// `SSH-` are banner text and are discarded; the returned string excludes
/// the trailing CR/LF, matching what the exchange hash requires.
fn read_version_line(transport: &mut dyn Transport) -> Result<String> {
    loop {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = transport.recv(&mut byte)?;
            if n == 0 {
                return Err(Error::Disconnected);
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.starts_with(b"SSH-") {
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_pipe;

    struct NullEventHandler;
    impl ConnectionEventHandler for NullEventHandler {}

    struct RecordingHandler {
        data: Arc<Mutex<Vec<u8>>>,
    }
    impl ChannelHandler for RecordingHandler {
        fn data(&mut self, data: &[u8]) {
            self.data.lock().unwrap().extend_from_slice(data);
        }
    }

    fn shared_with_pipe() -> (Arc<ConnectionShared>, test_pipe::PipeTransport) {
        let (local, peer) = test_pipe::pair();
        let write_transport: Arc<Mutex<Box<dyn Transport>>> = Arc::new(Mutex::new(Box::new(local)));
        let shared = Arc::new(ConnectionShared {
            framer: Arc::new(Framer::new(262144)),
            write_transport,
            interceptors: Arc::new(InterceptorChain::new()),
            channels: Arc::new(ChannelTable::new()),
            event_handler: Mutex::new(Box::new(NullEventHandler)),
            closed: AtomicBool::new(false),
        });
        (shared, peer)
    }

    fn open_channel(shared: &ConnectionShared, local_id: ChannelId, remote_id: u32, local_window_size: u32, handler: Box<dyn ChannelHandler>) {
        shared.channels.insert(
            ChannelOperator {
                local_id,
                remote_id,
                local_window_size,
                remote_window_size: 0,
                local_max_packet_size: 32768,
                remote_max_packet_size: 32768,
                confirmed: true,
                consumed_since_adjust: 0,
            },
            handler,
        );
    }

    #[test]
    fn close_fatal_is_idempotent_and_shuts_down_transport() {
        let (shared, _peer) = shared_with_pipe();
        shared.close_fatal();
        assert!(shared.closed.load(Ordering::SeqCst));
        // A second call must not panic or double-close.
        shared.close_fatal();
    }

    #[test]
    fn window_adjust_stays_below_low_water_mark() {
        let (shared, peer) = shared_with_pipe();
        let data = Arc::new(Mutex::new(Vec::new()));
        open_channel(&shared, ChannelId(0), 7, 100, Box::new(RecordingHandler { data: data.clone() }));

        shared.maybe_adjust_window(ChannelId(0), 40);

        // 40 < low_water (50), so no adjust is sent yet.
        assert!(peer.rx.try_recv().is_err());
        assert_eq!(data.lock().unwrap().len(), 0);
    }

    #[test]
    fn window_adjust_sent_once_low_water_mark_crossed() {
        let (shared, peer) = shared_with_pipe();
        open_channel(&shared, ChannelId(0), 7, 100, Box::new(RecordingHandler { data: Arc::new(Mutex::new(Vec::new())) }));

        shared.maybe_adjust_window(ChannelId(0), 30);
        shared.maybe_adjust_window(ChannelId(0), 30); // 60 >= low_water(50): triggers

        let sent = peer.rx.recv_timeout(std::time::Duration::from_secs(1)).expect("adjust packet sent");
        // Framer-encoded: 4-byte length + padding + payload + MAC(none). Just
        // confirm a CHANNEL_WINDOW_ADJUST opcode appears in the plaintext tail.
        assert!(sent.iter().any(|&b| b == msg::CHANNEL_WINDOW_ADJUST));

        let consumed = shared.channels.with_mut(ChannelId(0), |op, _| op.consumed_since_adjust).unwrap();
        assert_eq!(consumed, 0, "counter resets after sending the adjust");
    }

    #[test]
    fn channel_data_dispatch_delivers_payload_and_triggers_adjust() {
        let (shared, peer) = shared_with_pipe();
        let data = Arc::new(Mutex::new(Vec::new()));
        open_channel(&shared, ChannelId(3), 9, 10, Box::new(RecordingHandler { data: data.clone() }));

        let mut payload = CryptoVec::new();
        payload.push(msg::CHANNEL_DATA);
        payload.push_u32_be(3);
        payload.extend_ssh_string(b"hello world");
        shared.dispatch_channel_message(msg::CHANNEL_DATA, &payload);

        assert_eq!(&data.lock().unwrap()[..], b"hello world");
        // 11 bytes consumed >= low_water(5), so an adjust must have gone out.
        let sent = peer.rx.recv_timeout(std::time::Duration::from_secs(1)).expect("adjust packet sent");
        assert!(sent.iter().any(|&b| b == msg::CHANNEL_WINDOW_ADJUST));
    }

    #[test]
    fn channel_open_failure_removes_table_entry() {
        let (shared, _peer) = shared_with_pipe();
        open_channel(&shared, ChannelId(5), 0, 2097152, Box::new(RecordingHandler { data: Arc::new(Mutex::new(Vec::new())) }));
        assert!(shared.channels.contains(ChannelId(5)));

        let mut payload = CryptoVec::new();
        payload.push(msg::CHANNEL_OPEN_FAILURE);
        payload.push_u32_be(5);
        payload.push_u32_be(2); // ConnectFailed
        payload.extend_ssh_string(b"refused");
        shared.dispatch_channel_message(msg::CHANNEL_OPEN_FAILURE, &payload);

        assert!(!shared.channels.contains(ChannelId(5)));
    }
}
