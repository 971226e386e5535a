// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! A client-side SSH2 connection core: transport framing with rekeying,
//! Diffie-Hellman key exchange, user authentication (password, public-key,
//! keyboard-interactive), a packet-interceptor dispatch fabric, remote port
//! forwarding and agent forwarding.
//!
//! This crate does not open sockets on your behalf beyond the bundled
//! blocking `TcpTransport`, does not implement a server role, and does not
//! implement the OpenSSH agent protocol itself — it relays agent messages to
//! an [`agent::AgentProvider`] you supply.
pub mod agent;
pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod framer;
pub mod host_key;
pub mod interceptor;
pub mod kex;
pub mod msg;
pub mod negotiation;
pub mod outbound;
pub mod portforward;
pub mod response_slot;
pub mod transport;

pub use auth::{AuthEventHandler, AuthOutcome, Credential, PromptHandler, PromptRequest};
pub use channel::{ChannelHandler, ChannelId, ChannelOpenFailure};
pub use config::Config;
pub use connection::{AuthState, Connection, ConnectionEventHandler};
pub use error::{Error, Result};
pub use host_key::HostKeyVerifier;
pub use portforward::{PortForwardDecision, PortForwardHandler};
pub use transport::{Transport, TcpTransport};
