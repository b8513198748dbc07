//! Request/response adapter mapping REST-shaped requests onto services.
//!
//! Transport-free: an HTTP front end converts its requests into
//! [`RestRequest`] and writes back the [`RestResponse`].
//!
//! | Request              | Call                  |
//! |----------------------|-----------------------|
//! | `POST   /path`       | `create(body)`        |
//! | `GET    /path?q`     | `find(query)`         |
//! | `GET    /path/:id`   | `get(id)`             |
//! | `PATCH  /path/:id`   | `update(id, body)`    |
//! | `DELETE /path/:id`   | `remove(id)`          |

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};
use tracing::{debug, warn};

use servix_core::{ErrorCode, ServiceError, ServiceResult};

use crate::dispatch::Dispatcher;
use crate::service::Caller;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

/// Declared type of a queryable field; query-string values are coerced
/// to it before `find` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Float,
    /// `"t"` is true, anything else false.
    Bool,
    String,
}

impl FieldType {
    pub fn coerce(self, field: &str, raw: &str) -> ServiceResult<Value> {
        let invalid = || ServiceError::bad_request(format!("invalid {self:?} value for '{field}': {raw}"));
        match self {
            Self::Int => raw.trim().parse::<i64>().map(Value::from).map_err(|_| invalid()),
            Self::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(invalid),
            Self::Bool => Ok(Value::Bool(raw == "t")),
            Self::String => Ok(Value::String(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl RestRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
}

impl RestResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(err: &ServiceError) -> Self {
        Self {
            status: status_for(&err.code),
            body: json!({ "code": err.code, "message": err.message }),
        }
    }
}

/// HTTP status for an error code.
pub fn status_for(code: &ErrorCode) -> u16 {
    match code {
        ErrorCode::MissingService | ErrorCode::MissingMethod => 404,
        ErrorCode::NotAuthenticated | ErrorCode::SessionExpired => 401,
        ErrorCode::BadRequest => 400,
        ErrorCode::Custom(code) if code == "not-found" => 404,
        ErrorCode::Custom(code) if code == "conflict" => 409,
        _ => 500,
    }
}

/// Mounts one service at a path.
#[derive(Debug, Clone)]
pub struct RestRoute {
    path: String,
    service: String,
    fields: HashMap<String, FieldType>,
}

impl RestRoute {
    pub fn new<'a>(
        path: impl Into<String>,
        service: impl Into<String>,
        fields: impl IntoIterator<Item = (&'a str, FieldType)>,
    ) -> Self {
        let path = path.into();
        Self {
            path: path.trim_end_matches('/').to_string(),
            service: service.into(),
            fields: fields
                .into_iter()
                .map(|(name, ty)| (name.to_string(), ty))
                .collect(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// `Some(None)` for the collection path, `Some(Some(id))` for an item.
    fn match_path<'p>(&self, path: &'p str) -> Option<Option<&'p str>> {
        let rest = path.trim_end_matches('/').strip_prefix(self.path.as_str())?;
        if rest.is_empty() {
            return Some(None);
        }
        let id = rest.strip_prefix('/')?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        Some(Some(id))
    }

    fn coerce_query(&self, query: &BTreeMap<String, String>) -> ServiceResult<Map<String, Value>> {
        query
            .iter()
            .map(|(field, raw)| {
                let value = match self.fields.get(field) {
                    Some(ty) => ty.coerce(field, raw)?,
                    None => Value::String(raw.clone()),
                };
                Ok((field.clone(), value))
            })
            .collect()
    }

    /// Maps a request on this route to `(action, args)`.
    fn call_for(&self, request: &RestRequest, id: Option<&str>) -> ServiceResult<(&'static str, Vec<Value>)> {
        let body = || request.body.clone().unwrap_or_else(|| json!({}));
        match (request.method, id) {
            (HttpMethod::Post, None) => Ok(("create", vec![body()])),
            (HttpMethod::Get, None) => {
                let query = self.coerce_query(&request.query)?;
                if query.is_empty() {
                    Ok(("find", vec![]))
                } else {
                    Ok(("find", vec![Value::Object(query)]))
                }
            }
            (HttpMethod::Get, Some(id)) => Ok(("get", vec![json!(id)])),
            (HttpMethod::Patch, Some(id)) => Ok(("update", vec![json!(id), body()])),
            (HttpMethod::Delete, Some(id)) => Ok(("remove", vec![json!(id)])),
            (method, _) => Err(ServiceError::custom(
                "method-not-allowed",
                format!("{method:?} not supported on {}", request.path),
            )),
        }
    }
}

/// Routes [`RestRequest`]s through the dispatcher with `Transport::Http`.
#[derive(Clone)]
pub struct RestAdapter {
    dispatcher: Dispatcher,
    routes: Vec<RestRoute>,
}

impl RestAdapter {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            routes: Vec::new(),
        }
    }

    #[must_use]
    pub fn route(mut self, route: RestRoute) -> Self {
        debug!(path = %route.path, service = %route.service, "REST route mounted");
        self.routes.push(route);
        self
    }

    pub async fn handle(&self, request: RestRequest) -> RestResponse {
        debug!(method = ?request.method, path = %request.path, "REST request");

        let matched = self
            .routes
            .iter()
            .find_map(|route| route.match_path(&request.path).map(|id| (route, id)));
        let Some((route, id)) = matched else {
            return RestResponse {
                status: 404,
                body: json!({ "code": "not-found", "message": format!("no route for {}", request.path) }),
            };
        };

        let (action, args) = match route.call_for(&request, id) {
            Ok(call) => call,
            Err(err) if err.code.as_str() == "method-not-allowed" => {
                return RestResponse {
                    status: 405,
                    body: json!({ "code": err.code, "message": err.message }),
                };
            }
            Err(err) => return RestResponse::error(&err),
        };

        match self
            .dispatcher
            .invoke(Caller::http(), &route.service, action, args)
            .await
        {
            Ok(value) => RestResponse::ok(value),
            Err(err) => {
                warn!(path = %request.path, action, error = %err, "REST call failed");
                RestResponse::error(&err)
            }
        }
    }
}
