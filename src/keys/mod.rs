//! Cache and lock key derivation.
//!
//! Two forms are supported. Session keys are built from structured identity
//! fields through a per-caller-type template. Operation keys are built from the
//! call's arguments, either by default concatenation or through a
//! [`KeyExpression`].

pub mod expression;

use log::debug;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use expression::{value_to_key_string, KeyExpression};

/// Placeholder for the caller type inside a session key template.
pub const TYPE_PLACEHOLDER: &str = "{type}";

/// Placeholder for the binding key inside a session key template.
pub const ID_PLACEHOLDER: &str = "{id}";

/// Default session key template.
pub const DEFAULT_SESSION_TEMPLATE: &str = "session:{type}:{id}";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum KeyError {
    #[error("Invalid key expression {expression:?} at {position}: {message}")]
    Syntax {
        expression: String,
        position: usize,
        message: String,
    },

    #[error("Key expression references undefined variable #{0}")]
    UndefinedVariable(String),

    #[error("Key expression path {path} does not exist")]
    MissingField { path: String },

    #[error("Key expression path {path} is out of bounds (len {len})")]
    IndexOutOfBounds { path: String, len: usize },

    #[error("Argument {0} is opaque and cannot be used in a key expression")]
    OpaqueArgument(String),

    #[error("Argument {name} could not be serialized: {reason}")]
    Unserializable { name: String, reason: String },

    #[error("Session key template {0:?} must contain {{id}}")]
    InvalidTemplate(String),
}

/// One argument of a guarded call.
#[derive(Debug, Clone)]
pub struct Arg {
    name: String,
    type_name: &'static str,
    value: ArgValue,
}

#[derive(Debug, Clone)]
enum ArgValue {
    Value(Value),
    Opaque,
    Unserializable(String),
}

impl Arg {
    /// Capture a serializable argument. Serialization failures are reported when
    /// the argument is actually used in a key, not here.
    pub fn new<T: Serialize + ?Sized>(name: &str, value: &T) -> Self {
        let value = match serde_json::to_value(value) {
            Ok(value) => ArgValue::Value(value),
            Err(e) => ArgValue::Unserializable(e.to_string()),
        };
        Self {
            name: name.to_string(),
            type_name: std::any::type_name::<T>(),
            value,
        }
    }

    /// Declare a resource-like argument (connections, streams, request handles)
    /// that never contributes to a default key.
    pub fn opaque<T: ?Sized>(name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: std::any::type_name::<T>(),
            value: ArgValue::Opaque,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self.value, ArgValue::Opaque)
    }

    pub(crate) fn expression_value(&self) -> Result<Value, KeyError> {
        match &self.value {
            ArgValue::Value(value) => Ok(value.clone()),
            ArgValue::Opaque => Err(KeyError::OpaqueArgument(self.name.clone())),
            ArgValue::Unserializable(reason) => Err(KeyError::Unserializable {
                name: self.name.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

/// Derives operation keys from call arguments.
#[derive(Debug, Clone, Default)]
pub struct KeyDeriver {
    ignored_types: Vec<String>,
}

impl KeyDeriver {
    pub fn new<I, S>(ignored_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored_types: ignored_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `type_name` is on the ignore list, by full path or last segment.
    pub fn is_ignored(&self, type_name: &str) -> bool {
        let short = short_type_name(type_name);
        self.ignored_types
            .iter()
            .any(|ignored| ignored == type_name || ignored == short)
    }

    /// Compute the key for one invocation of `operation`.
    pub fn operation_key(
        &self,
        operation: &str,
        args: &[Arg],
        expression: Option<&KeyExpression>,
    ) -> Result<String, KeyError> {
        let key = match expression {
            Some(expression) => expression.evaluate(operation, args)?,
            None => self.default_key(operation, args)?,
        };
        debug!("Derived key {} for {}", key, operation);
        Ok(key)
    }

    fn default_key(&self, operation: &str, args: &[Arg]) -> Result<String, KeyError> {
        let mut key = operation.to_string();
        for arg in args {
            if arg.is_opaque() || self.is_ignored(arg.type_name()) {
                continue;
            }
            key.push(':');
            key.push_str(&value_to_key_string(&arg.expression_value()?));
        }
        Ok(key)
    }
}

/// Last path segment of a type name, ignoring generic parameters.
fn short_type_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Reject templates that would collapse every binding key onto one entry.
pub fn validate_session_template(template: &str) -> Result<(), KeyError> {
    if template.contains(ID_PLACEHOLDER) {
        Ok(())
    } else {
        Err(KeyError::InvalidTemplate(template.to_string()))
    }
}

/// Session key for `(caller_type, binding_key)` under `template`.
pub fn session_key(template: &str, caller_type: &str, binding_key: &str) -> String {
    template
        .replace(TYPE_PLACEHOLDER, caller_type)
        .replace(ID_PLACEHOLDER, binding_key)
}
