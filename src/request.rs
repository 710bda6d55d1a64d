//! Request and response snapshots exposed to scripts.
//!
//! The request is the one mutable piece of host state a pre-request script
//! can change. The endpoint's query string and `params` are kept in step:
//! query mutations rewrite both, and param mutations rewrite the endpoint
//! query whenever the endpoint already carries one.

use serde::{Deserialize, Serialize};

use crate::marshal::HostValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub description: String,
}

const fn default_active() -> bool {
    true
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            active: true,
            description: String::new(),
        }
    }

    fn to_host_value(&self) -> HostValue {
        HostValue::map([
            ("key", HostValue::string(&self.key)),
            ("value", HostValue::string(&self.value)),
            ("active", HostValue::Bool(self.active)),
            ("description", HostValue::string(&self.description)),
        ])
    }

    /// A `{key, value}` pair read from the VM. `value` defaults to `""` when
    /// missing or falsy; non-string values are stringified.
    fn from_host(item: &HostValue) -> Option<Self> {
        let key = item.get("key").filter(|key| is_truthy(key))?.to_js_string();
        let value = item
            .get("value")
            .filter(|value| is_truthy(value))
            .map(HostValue::to_js_string)
            .unwrap_or_default();
        let mut pair = Self::new(key, value);
        if let Some(active) = item.get("active").and_then(HostValue::as_bool) {
            pair.active = active;
        }
        Some(pair)
    }
}

fn is_truthy(value: &HostValue) -> bool {
    match value {
        HostValue::Undefined | HostValue::Null => false,
        HostValue::Bool(b) => *b,
        HostValue::Number(n) => *n != 0.0 && !n.is_nan(),
        HostValue::String(s) => !s.is_empty(),
        HostValue::Bytes(_) | HostValue::List(_) | HostValue::Map(_) => true,
    }
}

/// Query parameter as exposed by the query DSL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParam {
    pub key: String,
    pub value: String,
}

impl QueryParam {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn to_host_value(&self) -> HostValue {
        HostValue::map([
            ("key", HostValue::string(&self.key)),
            ("value", HostValue::string(&self.value)),
        ])
    }
}

/// Split an endpoint into base, query and fragment. Tolerates endpoints
/// that are not valid URLs (for example unresolved `<<var>>` templates).
fn split_endpoint(endpoint: &str) -> (&str, Option<&str>, Option<&str>) {
    let (rest, fragment) = match endpoint.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (endpoint, None),
    };
    match rest.split_once('?') {
        Some((base, query)) => (base, Some(query), fragment),
        None => (rest, None, fragment),
    }
}

pub fn parse_query(query: &str) -> Vec<QueryParam> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| QueryParam::new(key, value))
        .collect()
}

pub fn encode_query(params: &[QueryParam]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for param in params {
        serializer.append_pair(&param.key, &param.value);
    }
    serializer.finish()
}

/// Parsed view of an endpoint for the `pm.request.url` helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub protocol: String,
    pub host: Vec<String>,
    pub port: String,
    pub path: Vec<String>,
    pub hash: String,
}

impl UrlParts {
    /// `None` when the endpoint is not an absolute URL.
    pub fn parse(endpoint: &str) -> Option<Self> {
        let parsed = url::Url::parse(endpoint).ok()?;
        let protocol = parsed.scheme().to_string();
        let port = parsed
            .port_or_known_default()
            .map(|port| port.to_string())
            .unwrap_or_default();
        Some(Self {
            host: parsed
                .host_str()
                .map(|host| host.split('.').map(str::to_string).collect())
                .unwrap_or_default(),
            path: parsed
                .path_segments()
                .map(|segments| {
                    segments
                        .filter(|segment| !segment.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            hash: parsed.fragment().unwrap_or_default().to_string(),
            protocol,
            port,
        })
    }

    pub fn to_host_value(&self) -> HostValue {
        let strings = |items: &[String]| {
            HostValue::List(items.iter().map(HostValue::string).collect())
        };
        HostValue::map([
            ("protocol", HostValue::string(&self.protocol)),
            ("host", strings(&self.host)),
            ("port", HostValue::string(&self.port)),
            ("path", strings(&self.path)),
            ("hash", HostValue::string(&self.hash)),
        ])
    }
}

/// A request edit requested by a script.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestMutation {
    SetUrl(String),
    SetMethod(String),
    SetHeader(String, String),
    SetHeaders(Vec<KeyValue>),
    RemoveHeader(String),
    /// Remove any header with the same name, then append.
    UpsertHeader(String, String),
    SetParam(String, String),
    SetParams(Vec<KeyValue>),
    RemoveParam(String),
    SetBody(serde_json::Value),
    SetAuth(serde_json::Value),
    QueryAdd(QueryParam),
    QueryRemove(String),
    QueryUpsert(QueryParam),
    QueryClear,
    QueryInsert {
        param: QueryParam,
        before: Option<String>,
    },
    QueryAppend(QueryParam),
    QueryAssimilate {
        source: Vec<QueryParam>,
        prune: bool,
    },
}

fn string_arg(args: &[HostValue], idx: usize, message: &str) -> Result<String, String> {
    args.get(idx)
        .and_then(HostValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| message.to_string())
}

fn query_param_arg(args: &[HostValue]) -> Result<QueryParam, String> {
    args.first()
        .and_then(KeyValue::from_host)
        .map(|pair| QueryParam::new(pair.key, pair.value))
        .ok_or_else(|| "Query param must have a 'key' property".to_string())
}

fn header_arg(args: &[HostValue]) -> Result<KeyValue, String> {
    match args.first() {
        Some(header @ HostValue::Map(_)) => KeyValue::from_host(header)
            .ok_or_else(|| "Header must have a 'key' property".to_string()),
        _ => Err("Header must be an object with 'key' and 'value' properties".to_string()),
    }
}

fn pair_list_arg(args: &[HostValue], message: &str) -> Result<Vec<KeyValue>, String> {
    match args.first() {
        Some(HostValue::List(items)) => Ok(items.iter().filter_map(KeyValue::from_host).collect()),
        _ => Err(message.to_string()),
    }
}

fn object_arg(args: &[HostValue], message: &str) -> Result<serde_json::Value, String> {
    match args.first() {
        Some(value @ HostValue::Map(_)) => Ok(value.to_json()),
        _ => Err(message.to_string()),
    }
}

impl RequestMutation {
    /// Decode a mutation from a bridged call. `Err` carries the message the
    /// script sees.
    pub fn from_call(op: &str, args: &[HostValue]) -> Result<Self, String> {
        let mutation = match op {
            "setUrl" => Self::SetUrl(string_arg(args, 0, "Expected url to be a string")?),
            "setMethod" => Self::SetMethod(string_arg(
                args,
                0,
                "Method must be a string (GET, POST, PUT, DELETE, etc.)",
            )?),
            "setHeader" => Self::SetHeader(
                string_arg(args, 0, "Expected header name to be a string")?,
                string_arg(args, 1, "Expected header value to be a string")?,
            ),
            "setHeaders" => {
                Self::SetHeaders(pair_list_arg(args, "Expected headers to be an array")?)
            }
            "removeHeader" => {
                Self::RemoveHeader(string_arg(args, 0, "Header name must be a string")?)
            }
            "addHeader" => {
                let header = header_arg(args)?;
                Self::SetHeader(header.key, header.value)
            }
            "upsertHeader" => {
                let header = header_arg(args)?;
                Self::UpsertHeader(header.key, header.value)
            }
            "setParam" => Self::SetParam(
                string_arg(args, 0, "Expected param name to be a string")?,
                string_arg(args, 1, "Expected param value to be a string")?,
            ),
            "setParams" => Self::SetParams(pair_list_arg(args, "Expected params to be an array")?),
            "removeParam" => {
                Self::RemoveParam(string_arg(args, 0, "Expected param name to be a string")?)
            }
            "setBody" => Self::SetBody(object_arg(args, "Expected body to be an object")?),
            "setAuth" => Self::SetAuth(object_arg(args, "Expected auth to be an object")?),
            "queryAdd" => Self::QueryAdd(query_param_arg(args)?),
            "queryRemove" => {
                Self::QueryRemove(string_arg(args, 0, "Query param key must be a string")?)
            }
            "queryUpsert" => Self::QueryUpsert(query_param_arg(args)?),
            "queryClear" => Self::QueryClear,
            "queryInsert" => Self::QueryInsert {
                param: query_param_arg(args)?,
                before: args
                    .get(1)
                    .filter(|before| is_truthy(before))
                    .map(HostValue::to_js_string),
            },
            "queryAppend" => Self::QueryAppend(query_param_arg(args)?),
            "queryAssimilate" => {
                let source = match args.first() {
                    Some(HostValue::List(items)) => items
                        .iter()
                        .filter_map(KeyValue::from_host)
                        .map(|pair| QueryParam::new(pair.key, pair.value))
                        .collect(),
                    Some(HostValue::Map(map)) => map
                        .iter()
                        .map(|(key, value)| QueryParam::new(key.clone(), value.to_js_string()))
                        .collect(),
                    _ => return Err("Source must be an array or object".to_string()),
                };
                Self::QueryAssimilate {
                    source,
                    prune: args.get(1).is_some_and(is_truthy),
                }
            }
            other => return Err(format!("Unknown request operation: {other}")),
        };
        Ok(mutation)
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    #[serde(alias = "url", default)]
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: Vec<KeyValue>,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default = "empty_object")]
    pub body: serde_json::Value,
    #[serde(default = "empty_object")]
    pub auth: serde_json::Value,
    #[serde(default)]
    pub request_variables: Vec<KeyValue>,
}

impl Default for RequestSnapshot {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            method: default_method(),
            params: Vec::new(),
            headers: Vec::new(),
            body: empty_object(),
            auth: empty_object(),
            request_variables: Vec::new(),
        }
    }
}

/// Shallow-merge `patch` into `target` when both are objects, else replace.
fn merge_object(target: &mut serde_json::Value, patch: serde_json::Value) {
    match patch {
        serde_json::Value::Object(patch) if target.is_object() => {
            if let Some(existing) = target.as_object_mut() {
                existing.extend(patch);
            }
        }
        patch => *target = patch,
    }
}

impl RequestSnapshot {
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    /// Query parameters: the endpoint's query string when present, else the
    /// active `params`.
    pub fn query_params(&self) -> Vec<QueryParam> {
        let (_, query, _) = split_endpoint(&self.endpoint);
        match query.map(parse_query) {
            Some(params) if !params.is_empty() => params,
            _ => self
                .params
                .iter()
                .filter(|param| param.active)
                .map(|param| QueryParam::new(&param.key, &param.value))
                .collect(),
        }
    }

    fn endpoint_has_query(&self) -> bool {
        matches!(split_endpoint(&self.endpoint), (_, Some(query), _) if !query.is_empty())
    }

    fn rewrite_endpoint_query(&mut self, params: &[QueryParam]) {
        let (base, _, fragment) = split_endpoint(&self.endpoint);
        let mut endpoint = base.to_string();
        if !params.is_empty() {
            endpoint.push('?');
            endpoint.push_str(&encode_query(params));
        }
        if let Some(fragment) = fragment {
            endpoint.push('#');
            endpoint.push_str(fragment);
        }
        self.endpoint = endpoint;
    }

    /// Write a new query list into both the endpoint and `params`.
    fn store_query(&mut self, params: &[QueryParam]) {
        self.rewrite_endpoint_query(params);
        self.params = params
            .iter()
            .map(|param| KeyValue::new(&param.key, &param.value))
            .collect();
    }

    fn sync_params_into_endpoint(&mut self) {
        if self.endpoint_has_query() {
            let active: Vec<QueryParam> = self
                .params
                .iter()
                .filter(|param| param.active)
                .map(|param| QueryParam::new(&param.key, &param.value))
                .collect();
            self.rewrite_endpoint_query(&active);
        }
    }

    pub fn apply(&mut self, mutation: RequestMutation) {
        tracing::trace!(
            event = "sandbox.request.mutate",
            mutation = ?mutation,
            "Applying request mutation"
        );
        match mutation {
            RequestMutation::SetUrl(url) => {
                let (_, query, _) = split_endpoint(&url);
                self.params = query
                    .map(parse_query)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|param| KeyValue::new(param.key, param.value))
                    .collect();
                self.endpoint = url;
            }
            RequestMutation::SetMethod(method) => self.method = method,
            RequestMutation::SetHeader(key, value) => {
                match self
                    .headers
                    .iter_mut()
                    .find(|header| header.key.eq_ignore_ascii_case(&key))
                {
                    Some(header) => header.value = value,
                    None => self.headers.push(KeyValue::new(key, value)),
                }
            }
            RequestMutation::SetHeaders(headers) => self.headers = headers,
            RequestMutation::RemoveHeader(key) => {
                self.headers
                    .retain(|header| !header.key.eq_ignore_ascii_case(&key));
            }
            RequestMutation::UpsertHeader(key, value) => {
                self.headers
                    .retain(|header| !header.key.eq_ignore_ascii_case(&key));
                self.headers.push(KeyValue::new(key, value));
            }
            RequestMutation::SetParam(key, value) => {
                match self.params.iter_mut().find(|param| param.key == key) {
                    Some(param) => param.value = value,
                    None => self.params.push(KeyValue::new(key, value)),
                }
                self.sync_params_into_endpoint();
            }
            RequestMutation::SetParams(params) => {
                self.params = params;
                self.sync_params_into_endpoint();
            }
            RequestMutation::RemoveParam(key) => {
                self.params.retain(|param| param.key != key);
                self.sync_params_into_endpoint();
            }
            RequestMutation::SetBody(patch) => merge_object(&mut self.body, patch),
            RequestMutation::SetAuth(patch) => merge_object(&mut self.auth, patch),
            RequestMutation::QueryClear => self.store_query(&[]),
            query_mutation => {
                let mut params = self.query_params();
                apply_query_mutation(&mut params, query_mutation);
                self.store_query(&params);
            }
        }
    }

    pub fn to_host_value(&self) -> HostValue {
        let pairs = |items: &[KeyValue]| {
            HostValue::List(items.iter().map(KeyValue::to_host_value).collect())
        };
        HostValue::map([
            ("url", HostValue::string(&self.endpoint)),
            ("method", HostValue::string(&self.method)),
            ("params", pairs(&self.params)),
            ("headers", pairs(&self.headers)),
            ("body", HostValue::from_json(&self.body)),
            ("auth", HostValue::from_json(&self.auth)),
            ("requestVariables", pairs(&self.request_variables)),
        ])
    }

    pub fn request_variable(&self, key: &str) -> Option<&str> {
        self.request_variables
            .iter()
            .find(|var| var.key == key)
            .map(|var| var.value.as_str())
    }
}

fn apply_query_mutation(params: &mut Vec<QueryParam>, mutation: RequestMutation) {
    match mutation {
        RequestMutation::QueryAdd(param) => params.push(param),
        RequestMutation::QueryRemove(key) => params.retain(|param| param.key != key),
        RequestMutation::QueryUpsert(param) => upsert_query(params, param),
        RequestMutation::QueryInsert { param, before } => {
            let position = before
                .and_then(|before| params.iter().position(|existing| existing.key == before));
            match position {
                Some(idx) => params.insert(idx, param),
                None => params.push(param),
            }
        }
        RequestMutation::QueryAppend(param) => {
            params.retain(|existing| existing.key != param.key);
            params.push(param);
        }
        RequestMutation::QueryAssimilate { source, prune } => {
            for item in &source {
                upsert_query(params, item.clone());
            }
            if prune {
                params.retain(|param| source.iter().any(|item| item.key == param.key));
            }
        }
        _ => {}
    }
}

fn upsert_query(params: &mut Vec<QueryParam>, param: QueryParam) {
    match params.iter_mut().find(|existing| existing.key == param.key) {
        Some(existing) => existing.value = param.value,
        None => params.push(param),
    }
}

/// Query params as an object; repeated keys collect into arrays.
pub fn query_object(params: &[QueryParam]) -> HostValue {
    let mut map = indexmap::IndexMap::new();
    for param in params {
        let value = HostValue::string(&param.value);
        match map.get_mut(&param.key) {
            Some(HostValue::List(values)) => values.push(value),
            Some(existing) => {
                let first = std::mem::take(existing);
                *existing = HostValue::List(vec![first, value]);
            }
            None => {
                map.insert(param.key.clone(), value);
            }
        }
    }
    HostValue::Map(map)
}

/// Response given to test scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSnapshot {
    #[serde(alias = "statusCode", alias = "code")]
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub response_time: f64,
}

impl ResponseSnapshot {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            status_text: String::new(),
            headers: Vec::new(),
            body,
            response_time: 0.0,
        }
    }

    /// Status text, falling back to the standard reason phrase.
    pub fn reason(&self) -> &str {
        if self.status_text.trim().is_empty() {
            reason_phrase(self.status)
        } else {
            &self.status_text
        }
    }

    /// Body as text: strings verbatim, `null` as empty, anything else as JSON.
    pub fn text(&self) -> String {
        match &self.body {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.key.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn to_host_value(&self) -> HostValue {
        HostValue::map([
            ("status", HostValue::Number(f64::from(self.status))),
            ("statusText", HostValue::string(self.reason())),
            (
                "headers",
                HostValue::List(self.headers.iter().map(KeyValue::to_host_value).collect()),
            ),
            ("body", HostValue::from_json(&self.body)),
            ("text", HostValue::String(self.text())),
            ("bytes", HostValue::Bytes(self.text().into_bytes())),
            ("responseTime", HostValue::Number(self.response_time)),
        ])
    }
}

pub const fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        410 => "Gone",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
