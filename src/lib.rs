//! Encrypted TCP tunnel
//!
//! Accepts connections on frontend addresses, relays them to fixed backends and
//! applies a symmetric stream cipher on the leg that crosses the untrusted
//! network. A client-mode instance and a server-mode instance sharing a secret
//! form an encrypted pipe around any plaintext TCP protocol.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod stream;
pub mod tunnel;

// Re-export commonly used types and functions
pub use config::{TunnelConfig, load_tunnel_file, parse_tunnel_file};
pub use crypto::{CipherSpec, CryptoMethod, Direction, Keystream, Role};
pub use error::{ErrorKind, TunnelError};
pub use orchestrator::{FailedTunnel, Orchestrator, StartupMode};
pub use session::{SessionStats, pump, run_session};
pub use stream::CipherStream;
pub use tunnel::TunnelInstance;
