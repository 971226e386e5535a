// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
use std::time::Duration;

/// Ordered algorithm preferences, client-preference-first, matched against
/// whatever the server advertises in its `KEXINIT` (spec.md §4.3 step 1).
#[derive(Debug, Clone)]
pub struct Preferred {
    pub kex: &'static [&'static str],
    pub key: &'static [&'static str],
    pub cipher: &'static [&'static str],
    pub mac: &'static [&'static str],
    pub compression: &'static [&'static str],
}

impl Default for Preferred {
    fn default() -> Self {
        Preferred {
            // group18 (RFC 3526 §7, 8192-bit) is deliberately not offered:
            // see kex::groups for why.
            kex: &[
                "diffie-hellman-group16-sha512",
                "diffie-hellman-group14-sha256",
                "diffie-hellman-group14-sha1",
                "diffie-hellman-group1-sha1",
            ],
            key: &["ssh-rsa", "ssh-dss"],
            cipher: &["aes256-ctr", "aes128-ctr", "3des-cbc", "blowfish-cbc"],
            mac: &["hmac-sha1"],
            compression: &["none"],
        }
    }
}

/// Bytes/time thresholds before the client requests a rekey on its own
/// initiative (spec.md §4.3's rekey is reentrant and may be either side's
/// doing; this is the client-initiated trigger).
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: u64,
    pub rekey_read_limit: u64,
    pub rekey_time_limit: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            // RFC 4253 §9 recommends rekeying after at most 2**31 packets or
            // roughly 1GB for the weakest supported cipher; we rekey well
            // before that.
            rekey_write_limit: 1 << 30,
            rekey_read_limit: 1 << 30,
            rekey_time_limit: Duration::from_secs(3600),
        }
    }
}

/// Client construction-time configuration; cloned once into the `Connection`
/// (spec.md §3).
#[derive(Debug, Clone)]
pub struct Config {
    /// Sent in the version-exchange line as `SSH-2.0-<client_id><eol>`.
    pub client_id: String,
    /// End-of-line marker for the version-exchange line. RFC 4253 §4.2
    /// allows a bare `\n`; OpenSSH and most servers expect `\r\n`.
    pub version_eol: &'static str,
    pub preferred: Preferred,
    pub window_size: u32,
    pub maximum_packet_size: u32,
    /// The explicit decryption ceiling called for by spec.md §9's Open
    /// Question (RFC 4253 recommends servers support at least 35000).
    pub maximum_decrypted_packet_size: usize,
    pub limits: Limits,
    pub connect_timeout: Option<Duration>,
    /// Per-step response timeout for KEX, auth and global-request round
    /// trips (spec.md §5's 5s figure, overridable so tests don't block).
    pub response_timeout: Duration,
    pub max_auth_attempts: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            client_id: format!("{}_{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            version_eol: "\r\n",
            preferred: Preferred::default(),
            window_size: 2097152,
            maximum_packet_size: 32768,
            maximum_decrypted_packet_size: 262144,
            limits: Limits::default(),
            connect_timeout: Some(Duration::from_secs(30)),
            response_timeout: Duration::from_secs(5),
            max_auth_attempts: 10,
        }
    }
}
