//! Reads credentials off an inbound request.

use crate::settings::CarrierSettings;

/// Credentials found on one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundCredentials {
    pub token: Option<String>,
    pub device_id: Option<String>,
    pub user_id: Option<String>,
    pub is_login: bool,
}

/// Context for a device-bound session write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub device_id: String,
    /// User id header value, if any.
    pub presented_user_id: Option<String>,
    /// Token the caller presented, if any.
    pub presented_token: Option<String>,
    pub is_login: bool,
}

impl DeviceBinding {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            presented_user_id: None,
            presented_token: None,
            is_login: false,
        }
    }

    pub fn login(mut self) -> Self {
        self.is_login = true;
        self
    }

    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.presented_user_id = Some(user_id.to_string());
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.presented_token = Some(token.to_string());
        self
    }
}

impl InboundCredentials {
    /// Extract credentials. The token header wins over the query parameter and
    /// a leading `Bearer ` is stripped. Header names compare case-insensitively.
    pub fn extract<'a, I>(
        headers: I,
        path: &str,
        query: Option<&str>,
        settings: &CarrierSettings,
    ) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut credentials = InboundCredentials::default();
        for (name, value) in headers {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            if name.eq_ignore_ascii_case(&settings.token_header) {
                let token = strip_bearer(value);
                if !token.is_empty() {
                    credentials.token = Some(token.to_string());
                }
            } else if name.eq_ignore_ascii_case(&settings.device_header) {
                credentials.device_id = Some(value.to_string());
            } else if name.eq_ignore_ascii_case(&settings.user_id_header) {
                credentials.user_id = Some(value.to_string());
            }
        }

        if credentials.token.is_none() {
            credentials.token =
                query.and_then(|query| query_param(query, &settings.token_param));
        }
        credentials.is_login = same_path(path, &settings.login_path);
        credentials
    }

    /// Device-write context, when the request names a device.
    pub fn device_binding(&self) -> Option<DeviceBinding> {
        self.device_id.as_ref().map(|device_id| DeviceBinding {
            device_id: device_id.clone(),
            presented_user_id: self.user_id.clone(),
            presented_token: self.token.clone(),
            is_login: self.is_login,
        })
    }
}

/// Strips a case-insensitive `Bearer` scheme. A bare scheme yields `""`.
fn strip_bearer(value: &str) -> &str {
    match value.get(..6) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer") => {
            let rest = &value[6..];
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                rest.trim()
            } else {
                value
            }
        }
        _ => value,
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, raw)| {
            urlencoding::decode(&raw.replace('+', " "))
                .ok()
                .map(|value| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
}

fn same_path(path: &str, login_path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    path.trim_end_matches('/') == login_path.trim_end_matches('/')
}
