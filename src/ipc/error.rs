use serde_json::json;

use crate::store::StoreError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

/// Success response of a mutating call, naming the resource tags to refresh.
pub fn ok_invalidating(id: &str, result: serde_json::Value, tags: &[String]) -> serde_json::Value {
    let mut resp = ok(id, result);
    if !tags.is_empty() {
        resp["invalidate"] = json!(tags);
    }
    resp
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<StoreError> for HandlerErr {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::new("not_found", format!("{what} not found")),
            StoreError::BatchTooLarge { len, limit } => {
                Self::new("store_failed", e.to_string())
                    .with_details(json!({ "len": len, "limit": limit }))
            }
            other => Self::new("store_failed", other.to_string()),
        }
    }
}

/// Turn a handler outcome into a response.
pub fn respond(id: &str, outcome: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match outcome {
        Ok(v) => v,
        Err(e) => e.response(id),
    }
}
