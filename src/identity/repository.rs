use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use super::carrier::{DeviceBinding, InboundCredentials};
use super::context::{IdentityContext, SessionRecord};
use super::error::{IdentityError, ResolveError};
use super::token::TokenClaims;
use crate::modules::crypto::{constant_time_eq, fingerprint, TokenCipher};
use crate::settings::{BindingStrategy, CallerTypeSettings};
use crate::store::SessionStore;

/// A context located through its token, with the store key it lives under.
struct Located {
    context: IdentityContext,
    session_key: String,
}

/// Resolves opaque tokens to identity contexts held in the shared store.
///
/// The stored context carries the one token that is currently valid for its
/// session. Minting a new token and saving overwrites it, which is how a second
/// login revokes the first without any revocation list.
pub struct IdentityRepository {
    store: Arc<dyn SessionStore>,
    cipher: Arc<TokenCipher>,
    caller_types: HashMap<String, CallerTypeSettings>,
}

impl IdentityRepository {
    pub fn new<I>(store: Arc<dyn SessionStore>, cipher: Arc<TokenCipher>, caller_types: I) -> Self
    where
        I: IntoIterator<Item = CallerTypeSettings>,
    {
        let caller_types = caller_types
            .into_iter()
            .map(|settings| (settings.name.clone(), settings))
            .collect();
        Self {
            store,
            cipher,
            caller_types,
        }
    }

    pub fn caller_type(&self, name: &str) -> Option<&CallerTypeSettings> {
        self.caller_types.get(name)
    }

    fn settings_for(&self, caller_type: &str) -> Result<&CallerTypeSettings, IdentityError> {
        self.caller_types
            .get(caller_type)
            .ok_or_else(|| IdentityError::UnknownCallerType(caller_type.to_string()))
    }

    /// Resolve a token to its live context. Every authentication failure is
    /// `Ok(None)`; only store failures are errors.
    pub async fn resolve(&self, token: &str) -> Result<Option<IdentityContext>, IdentityError> {
        match self.authenticate(token).await {
            Ok(context) => Ok(Some(context)),
            Err(e) => Self::recover(token, e).map(|_| None),
        }
    }

    /// Detailed form of [`resolve`](Self::resolve).
    pub async fn authenticate(&self, token: &str) -> Result<IdentityContext, ResolveError> {
        self.locate(token).await.map(|located| located.context)
    }

    fn recover(token: &str, e: ResolveError) -> Result<(), IdentityError> {
        match e {
            ResolveError::Store(e) => {
                error!("Session store failed resolving token {}: {}", fingerprint(token), e);
                Err(e.into())
            }
            ResolveError::CorruptRecord(reason) => {
                error!("Corrupt session record for token {}: {}", fingerprint(token), reason);
                Ok(())
            }
            other => {
                debug!("Token {} not authenticated: {}", fingerprint(token), other);
                Ok(())
            }
        }
    }

    async fn locate(&self, token: &str) -> Result<Located, ResolveError> {
        let claims: TokenClaims = self.cipher.decrypt(token)?;
        let settings = self
            .caller_types
            .get(&claims.caller_type)
            .ok_or_else(|| ResolveError::UnknownCallerType(claims.caller_type.clone()))?;

        let binding_key = match settings.binding {
            BindingStrategy::Principal => claims.principal_id.as_str(),
            BindingStrategy::Device => claims
                .device_id
                .as_deref()
                .ok_or(ResolveError::MissingDevice)?,
        };
        let session_key = settings.session_key(binding_key);

        let bytes = self
            .store
            .get(&session_key)
            .await?
            .ok_or(ResolveError::SessionNotFound)?;
        let record = SessionRecord::from_bytes(&bytes)
            .map_err(|e| ResolveError::CorruptRecord(e.to_string()))?;
        let context = record.context;

        match context.token() {
            Some(current) if constant_time_eq(current.as_bytes(), token.as_bytes()) => {}
            _ => return Err(ResolveError::TokenSuperseded),
        }

        if let Some(bound_device) = context.device_id() {
            if claims.device_id.as_deref() != Some(bound_device) {
                return Err(ResolveError::DeviceMismatch);
            }
        }

        if !context.is_active() {
            return Err(ResolveError::Inactive);
        }

        if settings.sliding {
            if let Some(ttl) = settings.ttl() {
                if let Err(e) = self.store.expire(&session_key, ttl).await {
                    warn!("Failed to refresh session {}: {}", session_key, e);
                }
            }
        }

        Ok(Located {
            context,
            session_key,
        })
    }

    /// Persist `context` under `binding_key`, minting a token if it has none.
    /// Returns the context as stored.
    pub async fn save(
        &self,
        mut context: IdentityContext,
        binding_key: &str,
    ) -> Result<IdentityContext, IdentityError> {
        let settings = self.settings_for(&context.caller_type)?;
        bind(&mut context, settings, binding_key)?;

        if context.token().is_none() {
            let token = self.cipher.encrypt(&TokenClaims::from_context(&context))?;
            context.set_token(token);
        }

        let ttl = settings.ttl();
        let record = SessionRecord::new(context, ttl);
        let session_key = settings.session_key(binding_key);
        self.store.set(&session_key, record.to_bytes()?, ttl).await?;

        debug!(
            "Saved session {} with token {}",
            session_key,
            record.context.token().map(fingerprint).unwrap_or_default()
        );
        Ok(record.context)
    }

    /// Save with a freshly minted token, superseding any previous one.
    pub async fn login(
        &self,
        mut context: IdentityContext,
        binding_key: &str,
    ) -> Result<IdentityContext, IdentityError> {
        context.clear_token();
        let context = self.save(context, binding_key).await?;
        info!(
            "Login for {} ({})",
            context.principal_id, context.caller_type
        );
        Ok(context)
    }

    /// Save a device-bound context, refusing to clobber a session that the
    /// caller cannot show it owns.
    pub async fn save_for_device(
        &self,
        mut context: IdentityContext,
        binding: &DeviceBinding,
    ) -> Result<IdentityContext, IdentityError> {
        let settings = self.settings_for(&context.caller_type)?;
        if settings.binding != BindingStrategy::Device {
            return Err(IdentityError::NotDeviceBound(context.caller_type.clone()));
        }

        let session_key = settings.session_key(&binding.device_id);
        let existing = match self.store.get(&session_key).await? {
            Some(bytes) => match SessionRecord::from_bytes(&bytes) {
                Ok(record) => Some(record.context),
                Err(e) => {
                    warn!("Replacing unreadable session {}: {}", session_key, e);
                    None
                }
            },
            None => None,
        };

        admit_device_write(existing.as_ref(), &context, binding)?;

        if binding.is_login {
            context.clear_token();
        }
        self.save(context, &binding.device_id).await
    }

    /// Delete the session for `(caller_type, binding_key)`. Returns whether one
    /// existed.
    pub async fn invalidate(
        &self,
        caller_type: &str,
        binding_key: &str,
    ) -> Result<bool, IdentityError> {
        let settings = self.settings_for(caller_type)?;
        let session_key = settings.session_key(binding_key);
        let removed = self.store.delete(&session_key).await?;
        if removed {
            info!("Invalidated session {}", session_key);
        }
        Ok(removed)
    }

    /// Invalidate the session `token` belongs to, if it is still current.
    pub async fn logout(&self, token: &str) -> Result<bool, IdentityError> {
        match self.locate(token).await {
            Ok(located) => {
                self.store.delete(&located.session_key).await?;
                info!(
                    "Logout for {} ({})",
                    located.context.principal_id, located.context.caller_type
                );
                Ok(true)
            }
            Err(e) => Self::recover(token, e).map(|_| false),
        }
    }

    /// Resolve the identity carried by an inbound request.
    pub async fn resolve_request(
        &self,
        credentials: &InboundCredentials,
    ) -> Result<Option<IdentityContext>, IdentityError> {
        let Some(token) = credentials.token.as_deref() else {
            return Ok(None);
        };
        let Some(context) = self.resolve(token).await? else {
            return Ok(None);
        };

        if let (Some(presented), Some(bound)) =
            (credentials.device_id.as_deref(), context.device_id())
        {
            if presented != bound {
                debug!(
                    "Token {} presented from device {} but bound to {}",
                    fingerprint(token),
                    presented,
                    bound
                );
                return Ok(None);
            }
        }
        Ok(Some(context))
    }
}

fn bind(
    context: &mut IdentityContext,
    settings: &CallerTypeSettings,
    binding_key: &str,
) -> Result<(), IdentityError> {
    let mismatch = || IdentityError::BindingMismatch {
        caller_type: settings.name.clone(),
        binding_key: binding_key.to_string(),
    };
    match settings.binding {
        BindingStrategy::Principal if context.principal_id != binding_key => Err(mismatch()),
        BindingStrategy::Principal => Ok(()),
        BindingStrategy::Device => match context.device_id() {
            None => {
                context.set_device(binding_key);
                Ok(())
            }
            Some(device) if device == binding_key => Ok(()),
            Some(_) => Err(mismatch()),
        },
    }
}

/// Whether a device-bound write may create or replace the existing session.
///
/// A missing session is only created by the login endpoint. An existing one is
/// replaced when the caller presents its current token, when the presented user
/// id and the incoming principal both equal the stored principal, or when a
/// login without a user id re-authenticates the stored principal.
fn admit_device_write(
    existing: Option<&IdentityContext>,
    incoming: &IdentityContext,
    binding: &DeviceBinding,
) -> Result<(), IdentityError> {
    let Some(stored) = existing else {
        return if binding.is_login {
            Ok(())
        } else {
            Err(IdentityError::NoDeviceSession(binding.device_id.clone()))
        };
    };

    let presents_current = match (binding.presented_token.as_deref(), stored.token()) {
        (Some(presented), Some(current)) => {
            constant_time_eq(presented.as_bytes(), current.as_bytes())
        }
        _ => false,
    };
    let same_principal = incoming.principal_id == stored.principal_id;
    let user_matches = binding.presented_user_id.as_deref() == Some(stored.principal_id.as_str());
    let bootstrap = binding.is_login && binding.presented_user_id.is_none();

    if presents_current || (same_principal && (user_matches || bootstrap)) {
        Ok(())
    } else {
        warn!(
            "Refused overwrite of device {} session for principal {}",
            binding.device_id, incoming.principal_id
        );
        Err(IdentityError::DeviceSessionConflict(
            binding.device_id.clone(),
        ))
    }
}
