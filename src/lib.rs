//! Shared session identity and distributed mutual exclusion for horizontally
//! scaled services.
//!
//! Identity contexts live in a shared key/value store and are located through
//! opaque encrypted tokens ([`identity`]). Operations that must not run
//! concurrently, or twice, are wrapped by a lock interceptor ([`guard`]) that
//! keys a distributed lock off the call's arguments ([`keys`]).

pub mod guard;
pub mod identity;
pub mod keys;
pub mod lock;
pub mod settings;
pub mod store;

// Token cipher
pub mod modules {
    pub mod crypto;
}

pub use guard::{GuardError, GuardSpec, HeldLock, MutexInterceptor};
pub use identity::{IdentityContext, IdentityError, IdentityRepository, ResolveError};
pub use keys::{Arg, KeyDeriver, KeyError, KeyExpression};
pub use lock::{LockClient, LockError, LockKind};
pub use modules::crypto::{CipherAlgorithm, CryptoError, TokenCipher};
pub use settings::{Settings, SettingsError};
pub use store::{SessionStore, StoreError};
