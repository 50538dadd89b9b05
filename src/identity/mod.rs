//! Identity context repository: opaque tokens resolved against sessions held in
//! the shared store.

pub mod carrier;
pub mod context;
pub mod error;
pub mod repository;
pub mod token;

pub use self::carrier::{DeviceBinding, InboundCredentials};
pub use self::context::{IdentityContext, SessionRecord};
pub use self::error::{IdentityError, ResolveError};
pub use self::repository::IdentityRepository;
pub use self::token::TokenClaims;
