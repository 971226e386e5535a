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
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("the connection is in an inconsistent state")]
    Inconsistent,
    #[error("the connection is disconnected")]
    Disconnected,
    #[error("wrong channel")]
    WrongChannel,
    #[error("could not send a message to a background task")]
    SendError,
    #[error("no authentication method left")]
    NoAuthMethod,
    #[error("authentication rejected by server")]
    AuthenticationFailed {
        partial_success: bool,
        remaining_methods: Vec<String>,
    },
    #[error("channel open request rejected: {0:?}")]
    ChannelOpenRejected(crate::channel::ChannelOpenFailure),
    #[error("channel request '{0}' rejected by peer")]
    ChannelRequestRejected(String),
    #[error("key exchange error: {0}")]
    Kex(String),
    #[error("no common algorithm for {0}")]
    NoCommonAlgorithm(String),
    #[error("host key verification rejected the server's key")]
    HostKeyNotVerified,
    #[error("host key signature verification failed")]
    HostKeyMismatch,
    #[error("MAC verification failed")]
    MacMismatch,
    #[error("packet length {0} exceeds the configured maximum {1}")]
    PacketTooLarge(usize, usize),
    #[error("decrypted packet length is not a multiple of the cipher block size")]
    InvalidPacketLength,
    #[error("sequence number overflowed")]
    SequenceNumberOverflow,
    #[error("timed out waiting for a response from the server")]
    Timeout,
    #[error("the server refused the request")]
    RequestRefused,
    #[error("index out of bounds")]
    IndexOutOfBounds,
    #[error(transparent)]
    Encoding(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Keys(#[from] thrussh_keys::Error),
    #[error(transparent)]
    Openssl(#[from] openssl::error::ErrorStack),
}
