//! Stream cipher selection and per-connection keystream state.
//!
//! A [`CipherSpec`] is derived once per tunnel from the configured method and
//! secret. Every connection asks it for fresh [`Keystream`]s, so no two
//! streams ever share a keystream position. The two directions of the
//! ciphered leg use separately derived key material, so upstream and
//! downstream ciphertext never XOR down to the plaintexts.

use std::{fmt, str::FromStr};

use aes::{Aes128, Aes192, Aes256};
use chacha20::ChaCha20;
use cipher::{KeyInit, KeyIvInit, StreamCipher, consts::U16};
use rc4::Rc4;
use sha2::{Digest, Sha256};

use crate::error::TunnelError;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoMethod {
    /// Bytes pass through untouched.
    Identity,
    Rc4,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    ChaCha20,
}

impl CryptoMethod {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Rc4 => "rc4",
            Self::Aes128Ctr => "aes-128-ctr",
            Self::Aes192Ctr => "aes-192-ctr",
            Self::Aes256Ctr => "aes-256-ctr",
            Self::ChaCha20 => "chacha20",
        }
    }

    /// Key length in bytes.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Identity => 0,
            Self::Rc4 | Self::Aes128Ctr => 16,
            Self::Aes192Ctr => 24,
            Self::Aes256Ctr | Self::ChaCha20 => 32,
        }
    }

    /// IV (or nonce) length in bytes.
    #[must_use]
    pub const fn iv_len(self) -> usize {
        match self {
            Self::Identity | Self::Rc4 => 0,
            Self::Aes128Ctr | Self::Aes192Ctr | Self::Aes256Ctr => 16,
            Self::ChaCha20 => 12,
        }
    }

    #[must_use]
    pub const fn requires_secret(self) -> bool {
        !matches!(self, Self::Identity)
    }
}

impl fmt::Display for CryptoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CryptoMethod {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "none" => Ok(Self::Identity),
            "rc4" => Ok(Self::Rc4),
            "aes-128-ctr" | "aes128ctr" => Ok(Self::Aes128Ctr),
            "aes-192-ctr" | "aes192ctr" => Ok(Self::Aes192Ctr),
            "aes-256-ctr" | "aes256ctr" => Ok(Self::Aes256Ctr),
            "chacha20" => Ok(Self::ChaCha20),
            other => Err(TunnelError::CryptoConfig(format!(
                "unknown crypto method: {other}"
            ))),
        }
    }
}

/// Direction of travel across the ciphered leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the client-mode instance towards the server-mode instance.
    ClientToServer,
    ServerToClient,
}

impl Direction {
    const fn label(self) -> &'static [u8] {
        match self {
            Self::ClientToServer => b"c2s",
            Self::ServerToClient => b"s2c",
        }
    }
}

/// Which end of the ciphered leg a stream sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Faces a server-mode peer: writes client-to-server, reads server-to-client.
    Client,
    /// Faces a client-mode peer.
    Server,
}

impl Role {
    #[must_use]
    pub const fn outgoing(self) -> Direction {
        match self {
            Self::Client => Direction::ClientToServer,
            Self::Server => Direction::ServerToClient,
        }
    }

    #[must_use]
    pub const fn incoming(self) -> Direction {
        match self {
            Self::Client => Direction::ServerToClient,
            Self::Server => Direction::ClientToServer,
        }
    }
}

#[derive(Clone, Default)]
struct Material {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl Material {
    fn derive(method: CryptoMethod, secret: &[u8], direction: Direction) -> Self {
        let mut input = direction.label().to_vec();
        input.extend_from_slice(secret);
        Self {
            key: derive_key(&input, method.key_len()),
            iv: derive_iv(&input, method.iv_len()),
        }
    }
}

/// Validated key material for one tunnel. Read-only once built.
#[derive(Clone)]
pub struct CipherSpec {
    method: CryptoMethod,
    client_to_server: Material,
    server_to_client: Material,
}

impl CipherSpec {
    /// Derives key material, failing closed on a missing secret or on key
    /// material the cipher rejects.
    pub fn new(method: CryptoMethod, secret: &str) -> Result<Self, TunnelError> {
        if method.requires_secret() && secret.is_empty() {
            return Err(TunnelError::CryptoConfig(format!(
                "crypto method {method} requires a non-empty secret"
            )));
        }

        let secret = secret.as_bytes();
        let spec = Self {
            method,
            client_to_server: Material::derive(method, secret, Direction::ClientToServer),
            server_to_client: Material::derive(method, secret, Direction::ServerToClient),
        };
        // Surface key/iv length problems now rather than per connection.
        spec.keystream(Direction::ClientToServer)?;
        spec.keystream(Direction::ServerToClient)?;
        Ok(spec)
    }

    #[must_use]
    pub fn identity() -> Self {
        Self {
            method: CryptoMethod::Identity,
            client_to_server: Material::default(),
            server_to_client: Material::default(),
        }
    }

    #[must_use]
    pub const fn method(&self) -> CryptoMethod {
        self.method
    }

    /// Creates a new keystream for `direction`, positioned at byte zero.
    pub fn keystream(&self, direction: Direction) -> Result<Keystream, TunnelError> {
        let Material { key, iv } = match direction {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        };
        let invalid = |_: cipher::InvalidLength| {
            TunnelError::CryptoConfig(format!("invalid key material for {}", self.method))
        };
        let state = match self.method {
            CryptoMethod::Identity => State::Identity,
            CryptoMethod::Rc4 => {
                State::Rc4(Box::new(Rc4::<U16>::new_from_slice(key).map_err(invalid)?))
            }
            CryptoMethod::Aes128Ctr => {
                State::Aes128Ctr(Aes128Ctr::new_from_slices(key, iv).map_err(invalid)?)
            }
            CryptoMethod::Aes192Ctr => {
                State::Aes192Ctr(Aes192Ctr::new_from_slices(key, iv).map_err(invalid)?)
            }
            CryptoMethod::Aes256Ctr => {
                State::Aes256Ctr(Aes256Ctr::new_from_slices(key, iv).map_err(invalid)?)
            }
            CryptoMethod::ChaCha20 => {
                State::ChaCha20(ChaCha20::new_from_slices(key, iv).map_err(invalid)?)
            }
        };
        Ok(Keystream { state, position: 0 })
    }
}

impl fmt::Debug for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSpec")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

enum State {
    Identity,
    Rc4(Box<Rc4<U16>>),
    Aes128Ctr(Aes128Ctr),
    Aes192Ctr(Aes192Ctr),
    Aes256Ctr(Aes256Ctr),
    ChaCha20(ChaCha20),
}

/// Running cipher state for one direction of one connection.
pub struct Keystream {
    state: State,
    position: u64,
}

impl Keystream {
    /// XORs the keystream into `buf` in place and advances the position.
    pub fn apply(&mut self, buf: &mut [u8]) {
        match &mut self.state {
            State::Identity => {}
            State::Rc4(c) => c.apply_keystream(buf),
            State::Aes128Ctr(c) => c.apply_keystream(buf),
            State::Aes192Ctr(c) => c.apply_keystream(buf),
            State::Aes256Ctr(c) => c.apply_keystream(buf),
            State::ChaCha20(c) => c.apply_keystream(buf),
        }
        self.position += buf.len() as u64;
    }

    /// Number of bytes processed so far.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }
}

impl fmt::Debug for Keystream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keystream")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

fn derive_key(secret: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut block = Sha256::digest(secret);
    while out.len() < len {
        out.extend_from_slice(&block);
        let mut hasher = Sha256::new();
        hasher.update(block);
        hasher.update(secret);
        block = hasher.finalize();
    }
    out.truncate(len);
    out
}

fn derive_iv(secret: &[u8], len: usize) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"iv");
    hasher.update(secret);
    let mut iv = hasher.finalize().to_vec();
    iv.truncate(len);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METHODS: [CryptoMethod; 6] = [
        CryptoMethod::Identity,
        CryptoMethod::Rc4,
        CryptoMethod::Aes128Ctr,
        CryptoMethod::Aes192Ctr,
        CryptoMethod::Aes256Ctr,
        CryptoMethod::ChaCha20,
    ];

    mod method_names {
        use super::*;

        #[test]
        fn parses_every_canonical_name() {
            for method in ALL_METHODS {
                assert_eq!(method.name().parse::<CryptoMethod>().unwrap(), method);
            }
        }

        #[test]
        fn accepts_aliases_and_case() {
            assert_eq!("none".parse::<CryptoMethod>().unwrap(), CryptoMethod::Identity);
            assert_eq!("RC4".parse::<CryptoMethod>().unwrap(), CryptoMethod::Rc4);
            assert_eq!(
                "aes256ctr".parse::<CryptoMethod>().unwrap(),
                CryptoMethod::Aes256Ctr
            );
        }

        #[test]
        fn rejects_unknown_method() {
            let err = "des".parse::<CryptoMethod>().unwrap_err();
            assert!(matches!(err, TunnelError::CryptoConfig(_)));
        }
    }

    mod spec {
        use super::*;

        #[test]
        fn missing_secret_fails_closed() {
            let err = CipherSpec::new(CryptoMethod::Rc4, "").unwrap_err();
            assert!(matches!(err, TunnelError::CryptoConfig(_)));
        }

        #[test]
        fn identity_needs_no_secret() {
            let spec = CipherSpec::new(CryptoMethod::Identity, "").unwrap();
            let mut ks = spec.keystream(Direction::ClientToServer).unwrap();
            let mut data = *b"plain";
            ks.apply(&mut data);
            assert_eq!(&data, b"plain");
        }

        #[test]
        fn derived_material_has_method_lengths() {
            for method in ALL_METHODS {
                let spec = CipherSpec::new(method, "secret").unwrap();
                for material in [&spec.client_to_server, &spec.server_to_client] {
                    assert_eq!(material.key.len(), method.key_len());
                    assert_eq!(material.iv.len(), method.iv_len());
                }
            }
        }

        #[test]
        fn debug_output_hides_key_material() {
            let spec = CipherSpec::new(CryptoMethod::Rc4, "hunter2").unwrap();
            let rendered = format!("{spec:?}");
            assert!(rendered.contains("Rc4"));
            assert!(!rendered.contains("key"));
        }
    }

    mod keystream {
        use super::*;

        #[test]
        fn decrypt_inverts_encrypt_for_every_method() {
            for method in ALL_METHODS {
                let spec = CipherSpec::new(method, "secret").unwrap();
                let plaintext: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

                let mut data = plaintext.clone();
                let mut encryptor = spec.keystream(Direction::ServerToClient).unwrap();
                // Uneven chunks must line up with one contiguous pass.
                let (a, b) = data.split_at_mut(333);
                encryptor.apply(a);
                encryptor.apply(b);
                if method != CryptoMethod::Identity {
                    assert_ne!(data, plaintext, "{method} left data unchanged");
                }

                let mut decryptor = spec.keystream(Direction::ServerToClient).unwrap();
                decryptor.apply(&mut data);
                assert_eq!(data, plaintext, "{method} round trip");
            }
        }

        #[test]
        fn each_keystream_starts_fresh_and_advances_alone() {
            let spec = CipherSpec::new(CryptoMethod::Aes128Ctr, "secret").unwrap();
            let mut first = spec.keystream(Direction::ClientToServer).unwrap();
            let mut second = spec.keystream(Direction::ClientToServer).unwrap();

            let mut buf = [0u8; 64];
            first.apply(&mut buf);
            assert_eq!(first.position(), 64);
            assert_eq!(second.position(), 0);

            // The second stream is unaffected by the first and produces the
            // keystream from its own start, not from offset 64.
            let mut fresh = [0u8; 64];
            second.apply(&mut fresh);
            assert_eq!(fresh, buf);
            let mut next = [0u8; 64];
            first.apply(&mut next);
            assert_ne!(next, fresh);
        }

        #[test]
        fn different_secrets_give_different_keystreams() {
            let mut a = CipherSpec::new(CryptoMethod::ChaCha20, "one")
                .unwrap()
                .keystream(Direction::ClientToServer)
                .unwrap();
            let mut b = CipherSpec::new(CryptoMethod::ChaCha20, "two")
                .unwrap()
                .keystream(Direction::ClientToServer)
                .unwrap();
            let mut x = [0u8; 32];
            let mut y = [0u8; 32];
            a.apply(&mut x);
            b.apply(&mut y);
            assert_ne!(x, y);
        }

        #[test]
        fn directions_use_separate_keystreams_from_offset_zero() {
            for method in ALL_METHODS {
                if method == CryptoMethod::Identity {
                    continue;
                }
                let spec = CipherSpec::new(method, "secret").unwrap();
                let mut up = [0u8; 16];
                let mut down = [0u8; 16];
                spec.keystream(Direction::ClientToServer)
                    .unwrap()
                    .apply(&mut up);
                spec.keystream(Direction::ServerToClient)
                    .unwrap()
                    .apply(&mut down);
                assert_ne!(up, down, "{method} reuses its keystream across directions");
            }
        }

        #[test]
        fn roles_pair_up_across_the_leg() {
            assert_eq!(Role::Client.outgoing(), Role::Server.incoming());
            assert_eq!(Role::Server.outgoing(), Role::Client.incoming());
            assert_ne!(Role::Client.outgoing(), Role::Client.incoming());
        }
    }
}
