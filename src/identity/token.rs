use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::context::IdentityContext;

/// Claims sealed inside an opaque token. They carry just enough to locate the
/// session record and compare against it; there is no server-side handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub principal_id: String,
    pub display_name: String,
    pub caller_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub issued_at_ms: i64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TokenClaims {
    pub fn from_context(context: &IdentityContext) -> Self {
        Self {
            principal_id: context.principal_id.clone(),
            display_name: context.display_name.clone(),
            caller_type: context.caller_type.clone(),
            device_id: context.device_id().map(str::to_string),
            issued_at_ms: Utc::now().timestamp_millis(),
            extra: BTreeMap::new(),
        }
    }
}
