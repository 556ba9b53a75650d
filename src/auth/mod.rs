//! Authentication: the session and the gate that unlocks it.
//!
//! This module provides:
//! - The in-memory `Session` and its read-only `SessionHandle` (`session`)
//! - Second-factor registration and verification (`second_factor`)
//! - The cached master password used by second-factor unlock (`secret_cache`)
//! - The `AuthGate` state machine (`gate`)

pub mod gate;
pub mod second_factor;
pub mod secret_cache;
pub mod session;

pub use gate::{AuthGate, AuthState, SecondFactorOutcome};
pub use second_factor::{
    Assertion, Authenticator, CredentialReference, SecondFactorRegistry, SoftwareAuthenticator,
};
pub use secret_cache::{MemorySecretCache, NoSecretCache, SecretCache};
pub use session::{Session, SessionHandle};

#[cfg(feature = "keyring-store")]
pub use secret_cache::KeyringSecretCache;
