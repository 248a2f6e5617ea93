use crate::error::MarksError;
use crate::ipc::error::err;
use crate::marks::WriteMode;
use crate::model::{Principal, Role};
use crate::store::StoreError;
use serde_json::{json, Value};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<MarksError> for HandlerErr {
    fn from(e: MarksError) -> Self {
        let details = match &e {
            MarksError::Timeout(limit) => Some(json!({ "timeoutSecs": limit.as_secs() })),
            _ => None,
        };
        Self {
            code: e.code(),
            message: e.to_string(),
            details,
        }
    }
}

impl From<StoreError> for HandlerErr {
    fn from(e: StoreError) -> Self {
        MarksError::from(e).into()
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        Self {
            code: "storage_failed",
            message: format!("{e:#}"),
            details: None,
        }
    }
}

/// Trimmed, non-empty string parameter.
pub fn get_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    get_str(params, key)
        .map(str::to_string)
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// The authenticated caller attached by the identity layer. Mutations
/// without one are rejected.
pub fn principal(params: &Value) -> Result<Principal, HandlerErr> {
    let Some(raw) = params.get("principal").filter(|v| !v.is_null()) else {
        return Err(MarksError::unauthorized("missing principal").into());
    };
    let id = get_str(raw, "id")
        .ok_or_else(|| HandlerErr::from(MarksError::unauthorized("principal.id is required")))?;
    let role = match get_str(raw, "role").map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("teacher") => Role::Teacher,
        Some("admin") => Role::Admin,
        _ => {
            return Err(HandlerErr::bad_params(
                "principal.role must be one of: teacher, admin",
            ))
        }
    };
    Ok(Principal {
        id: id.to_string(),
        role,
    })
}

pub fn write_mode(optimistic: bool) -> WriteMode {
    if optimistic {
        WriteMode::Optimistic
    } else {
        WriteMode::LastWriteWins
    }
}
