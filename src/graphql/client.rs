//! GraphQL query executor
//!
//! Queries POST `{query, variables}` through the same resilience chain as
//! the REST client and parse the `{data, errors}` envelope. Partial data
//! with errors is surfaced to the caller; missing data is fatal.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use url::Url;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::auth::{ContextAwareProvider, RequestContext};
use crate::error::{ErrorKind, MeshError, Result};
use crate::metrics::{self, OpTimer, TimerTarget};
use crate::resilience::{AdaptiveRateLimiter, Bulkhead, CircuitBreaker, RetryPolicy};
use crate::rest::client::error_from_response;
use crate::rest::rate_limit::{parse_rate_limit_headers, RateLimitCallback};

use super::PaginationOptions;

/// Maximum named queries folded into one batched operation.
const MAX_BATCH: usize = 10;

/// Configuration for the GraphQL client
#[derive(Debug, Clone)]
pub struct GraphQlClientConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub request_timeout: std::time::Duration,
}

impl Default for GraphQlClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.github.com/graphql".to_string(),
            user_agent: format!("mesh-adapter/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: std::time::Duration::from_secs(30),
        }
    }
}

/// One named query in a batched operation.
#[derive(Debug, Clone)]
pub struct BatchQueryItem {
    /// Result field name the caller demultiplexes by.
    pub name: String,
    /// Query text; an outer `query { ... }` wrapper is unwrapped.
    pub query: String,
    /// Variables; names are namespaced as `{name}_{var}` when merged.
    pub variables: Map<String, Value>,
}

/// Per-item result of a batched operation.
#[derive(Debug, Clone)]
pub struct BatchQueryResult {
    pub data: Option<Value>,
    pub errors: Vec<String>,
}

/// GraphQL client sharing the adapter's resilience chain.
pub struct GraphQlClient {
    http: reqwest::Client,
    endpoint: Url,
    auth: Arc<ContextAwareProvider>,
    limiter: Arc<AdaptiveRateLimiter>,
    bulkhead: Arc<Bulkhead>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    rate_limit_callback: RwLock<Option<RateLimitCallback>>,
}

impl GraphQlClient {
    pub fn new(
        config: GraphQlClientConfig,
        auth: Arc<ContextAwareProvider>,
        limiter: Arc<AdaptiveRateLimiter>,
        bulkhead: Arc<Bulkhead>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()?;

        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            MeshError::validation(format!("invalid graphql endpoint {}: {}", config.endpoint, e))
        })?;

        Ok(Self {
            http,
            endpoint,
            auth,
            limiter,
            bulkhead,
            breaker,
            retry,
            rate_limit_callback: RwLock::new(None),
        })
    }

    pub fn set_rate_limit_callback(&self, callback: RateLimitCallback) {
        *self.rate_limit_callback.write() = Some(callback);
    }

    /// Executes a query and returns the `data` payload.
    ///
    /// No `data` in the envelope fails with `UPSTREAM` carrying the first
    /// error message. Partial data alongside errors is logged and returned.
    pub async fn query(
        &self,
        ctx: &RequestContext,
        query: &str,
        variables: Value,
    ) -> Result<Value> {
        let envelope = self.dispatch(ctx, query, variables).await?;

        let errors: Vec<String> = envelope
            .get("errors")
            .and_then(Value::as_array)
            .map(|errs| {
                errs.iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        match envelope.get("data") {
            Some(data) if !data.is_null() => {
                if !errors.is_empty() {
                    warn!(
                        errors = errors.len(),
                        first = %errors[0],
                        "GraphQL returned partial data with errors"
                    );
                }
                Ok(data.clone())
            }
            _ => {
                let message = errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "graphql response carried no data".to_string());
                Err(MeshError::upstream(message).with_operation("graphql_query"))
            }
        }
    }

    /// Executes a query and decodes `data` into the caller's type. A
    /// `serde_json::Value` target receives the payload as-is.
    pub async fn query_as<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        query: &str,
        variables: Value,
    ) -> Result<T> {
        let data = self.query(ctx, query, variables).await?;
        serde_json::from_value(data).map_err(Into::into)
    }

    /// Drives `(first, after)` pagination, invoking `handler` with each
    /// page's data. Stops when `hasNextPage` is false or `max_pages` is
    /// reached. Pages are spaced by at least the minimum page delay.
    pub async fn query_paginated<F>(
        &self,
        ctx: &RequestContext,
        query: &str,
        variables: Value,
        opts: &PaginationOptions,
        mut handler: F,
    ) -> Result<u32>
    where
        F: FnMut(Value) -> Result<()>,
    {
        let mut vars = match variables {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(MeshError::validation(format!(
                    "pagination variables must be an object, got {}",
                    other
                )))
            }
        };

        vars.insert("first".to_string(), json!(opts.page_size()));
        let mut cursor = opts.after.clone();
        let mut pages = 0u32;

        loop {
            match &cursor {
                Some(c) => {
                    vars.insert("after".to_string(), json!(c));
                }
                None => {
                    vars.remove("after");
                }
            }

            let data = self
                .query(ctx, query, Value::Object(vars.clone()))
                .await?;

            let page_info = find_page_info(&data, opts.items_field.as_deref());
            let (has_next, end_cursor) = match page_info {
                Some(info) => (
                    info.get("hasNextPage").map(parse_has_next).unwrap_or(false),
                    info.get("endCursor").and_then(parse_cursor),
                ),
                None => (false, None),
            };

            handler(data)?;
            pages += 1;

            if !has_next {
                break;
            }
            if let Some(max) = opts.max_pages {
                if pages >= max {
                    debug!(pages, max, "Pagination stopped at max pages");
                    break;
                }
            }
            match end_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }

            tokio::time::sleep(opts.effective_page_delay()).await;
        }

        Ok(pages)
    }

    /// Folds up to ten named queries into one operation.
    ///
    /// Each item's `query { ... }` wrapper is unwrapped and its selection
    /// re-emitted under the item's name as an alias; variables are
    /// namespaced `{name}_{var}`. Errors are re-attributed to items by the
    /// first element of their path.
    pub async fn batch_query(
        &self,
        ctx: &RequestContext,
        items: &[BatchQueryItem],
    ) -> Result<HashMap<String, BatchQueryResult>> {
        if items.is_empty() {
            return Ok(HashMap::new());
        }
        if items.len() > MAX_BATCH {
            return Err(MeshError::validation(format!(
                "batch holds {} queries; the maximum is {}",
                items.len(),
                MAX_BATCH
            )));
        }

        let (query, variables) = compose_batch(items)?;
        let envelope = self.dispatch(ctx, &query, Value::Object(variables)).await?;

        let mut results: HashMap<String, BatchQueryResult> = items
            .iter()
            .map(|item| {
                (
                    item.name.clone(),
                    BatchQueryResult {
                        data: None,
                        errors: Vec::new(),
                    },
                )
            })
            .collect();

        if let Some(data) = envelope.get("data").and_then(Value::as_object) {
            for (field, value) in data {
                if let Some(result) = results.get_mut(field) {
                    result.data = Some(value.clone());
                }
            }
        }

        if let Some(errors) = envelope.get("errors").and_then(Value::as_array) {
            for error in errors {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown graphql error")
                    .to_string();
                let owner = error
                    .get("path")
                    .and_then(Value::as_array)
                    .and_then(|p| p.first())
                    .and_then(Value::as_str)
                    .map(String::from);

                match owner.and_then(|o| results.get_mut(&o)) {
                    Some(result) => result.errors.push(message),
                    None => {
                        // Errors without a path affect the whole batch.
                        for result in results.values_mut() {
                            result.errors.push(message.clone());
                        }
                    }
                }
            }
        }

        Ok(results)
    }

    async fn dispatch(&self, ctx: &RequestContext, query: &str, variables: Value) -> Result<Value> {
        let body = if variable_map_is_empty(&variables) {
            json!({ "query": query })
        } else {
            json!({ "query": query, "variables": variables })
        };

        self.limiter.wait().await?;

        self.bulkhead
            .execute(|| async {
                self.retry
                    .execute("graphql_query", || {
                        let body = body.clone();
                        async move {
                            self.breaker.execute(|| self.round_trip(ctx, body)).await
                        }
                    })
                    .await
            })
            .await
    }

    async fn round_trip(&self, ctx: &RequestContext, body: Value) -> Result<Value> {
        let _timer = OpTimer::new("POST", TimerTarget::Http);

        let mut request = self.http.post(self.endpoint.clone()).json(&body);
        request = self.auth.attach_for(ctx, request).await?;

        let response = request.send().await?;
        let status = response.status();
        metrics::record_http_request("POST", status.as_u16());

        if let Some(snapshot) = parse_rate_limit_headers(response.headers()) {
            if let Some(callback) = self.rate_limit_callback.read().as_ref() {
                callback(snapshot);
            }
        }

        let bytes = response.bytes().await?;
        if status.is_client_error() || status.is_server_error() {
            return Err(error_from_response(status, &bytes, &self.endpoint));
        }

        serde_json::from_slice(&bytes).map_err(Into::into)
    }
}

/// Empty variable maps encode as absent.
fn variable_map_is_empty(variables: &Value) -> bool {
    match variables {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// `hasNextPage` arrives as bool, string, or number depending on the
/// serializer on the other side.
fn parse_has_next(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

/// `endCursor` arrives as string or number.
fn parse_cursor(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Locates the `pageInfo` object: first under the named items field, then
/// by recursive search for any subtree carrying one.
fn find_page_info<'a>(data: &'a Value, items_field: Option<&str>) -> Option<&'a Value> {
    if let Some(field) = items_field {
        if let Some(connection) = find_field(data, field) {
            if let Some(info) = connection.get("pageInfo") {
                return Some(info);
            }
        }
    }
    find_field(data, "pageInfo")
}

fn find_field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(name) {
                return Some(found);
            }
            map.values().find_map(|v| find_field(v, name))
        }
        Value::Array(items) => items.iter().find_map(|v| find_field(v, name)),
        _ => None,
    }
}

/// Merges named queries into one operation text plus namespaced variables.
fn compose_batch(items: &[BatchQueryItem]) -> Result<(String, Map<String, Value>)> {
    let mut declarations: Vec<String> = Vec::new();
    let mut selections: Vec<String> = Vec::new();
    let mut variables = Map::new();

    for item in items {
        let parsed = unwrap_query(&item.query)?;

        let mut body = parsed.body;
        for (var, ty) in &parsed.declarations {
            let namespaced = format!("{}_{}", item.name, var);
            body = rename_variable(&body, var, &namespaced);
            declarations.push(format!("${}: {}", namespaced, ty));
        }

        for (var, value) in &item.variables {
            variables.insert(format!("{}_{}", item.name, var), value.clone());
        }

        selections.push(format!("{}: {}", item.name, body.trim()));
    }

    let header = if declarations.is_empty() {
        "query".to_string()
    } else {
        format!("query({})", declarations.join(", "))
    };

    Ok((
        format!("{} {{ {} }}", header, selections.join(" ")),
        variables,
    ))
}

struct ParsedQuery {
    declarations: Vec<(String, String)>,
    body: String,
}

/// Strips an optional `query Name($a: T) { ... }` wrapper, returning the
/// variable declarations and the inner selection set.
fn unwrap_query(query: &str) -> Result<ParsedQuery> {
    let trimmed = query.trim();

    let (declarations, rest) = if let Some(after_kw) = trimmed.strip_prefix("query") {
        let after_kw = after_kw.trim_start();
        if let Some(paren_start) = after_kw.find('(') {
            let brace = after_kw.find('{').unwrap_or(after_kw.len());
            if paren_start < brace {
                let paren_end = after_kw[paren_start..]
                    .find(')')
                    .map(|i| paren_start + i)
                    .ok_or_else(|| {
                        MeshError::validation("unterminated variable declarations in query")
                    })?;
                let decls = parse_declarations(&after_kw[paren_start + 1..paren_end]);
                (decls, &after_kw[paren_end + 1..])
            } else {
                (Vec::new(), after_kw)
            }
        } else {
            (Vec::new(), after_kw)
        }
    } else {
        (Vec::new(), trimmed)
    };

    let open = rest
        .find('{')
        .ok_or_else(|| MeshError::validation("query has no selection set"))?;
    let close = rest
        .rfind('}')
        .ok_or_else(|| MeshError::validation("query has no closing brace"))?;
    if close <= open {
        return Err(MeshError::validation("malformed query braces"));
    }

    Ok(ParsedQuery {
        declarations,
        body: rest[open + 1..close].trim().to_string(),
    })
}

fn parse_declarations(decls: &str) -> Vec<(String, String)> {
    decls
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            let (name, ty) = part.split_once(':')?;
            let name = name.trim().strip_prefix('$')?.to_string();
            Some((name, ty.trim().to_string()))
        })
        .collect()
}

/// Renames `$old` to `$new` at identifier boundaries.
fn rename_variable(body: &str, old: &str, new: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let end = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        out.push('$');
        if &after[..end] == old {
            out.push_str(new);
        } else {
            out.push_str(&after[..end]);
        }
        rest = &after[end..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_has_next_lenient_forms() {
        assert!(parse_has_next(&json!(true)));
        assert!(parse_has_next(&json!("true")));
        assert!(parse_has_next(&json!("TRUE")));
        assert!(parse_has_next(&json!(1)));
        assert!(!parse_has_next(&json!(false)));
        assert!(!parse_has_next(&json!("false")));
        assert!(!parse_has_next(&json!(0)));
        assert!(!parse_has_next(&json!(null)));
    }

    #[test]
    fn test_parse_cursor_forms() {
        assert_eq!(parse_cursor(&json!("XYZ")).as_deref(), Some("XYZ"));
        assert_eq!(parse_cursor(&json!(42)).as_deref(), Some("42"));
        assert!(parse_cursor(&json!(null)).is_none());
    }

    #[test]
    fn test_find_page_info_by_items_field() {
        let data = json!({
            "repository": {
                "issues": {
                    "nodes": [],
                    "pageInfo": {"hasNextPage": true, "endCursor": "C1"}
                }
            }
        });
        let info = find_page_info(&data, Some("issues")).unwrap();
        assert_eq!(info["endCursor"], "C1");
    }

    #[test]
    fn test_find_page_info_recursive() {
        let data = json!({
            "viewer": {
                "repositories": {
                    "pageInfo": {"hasNextPage": false}
                }
            }
        });
        let info = find_page_info(&data, None).unwrap();
        assert_eq!(info["hasNextPage"], false);
    }

    #[test]
    fn test_unwrap_query_with_declarations() {
        let parsed = unwrap_query(
            "query Issues($owner: String!, $name: String!) { repository(owner: $owner, name: $name) { id } }",
        )
        .unwrap();

        assert_eq!(parsed.declarations.len(), 2);
        assert_eq!(parsed.declarations[0].0, "owner");
        assert_eq!(parsed.declarations[0].1, "String!");
        assert!(parsed.body.starts_with("repository(owner: $owner"));
    }

    #[test]
    fn test_unwrap_bare_selection() {
        let parsed = unwrap_query("{ viewer { login } }").unwrap();
        assert!(parsed.declarations.is_empty());
        assert_eq!(parsed.body, "viewer { login }");
    }

    #[test]
    fn test_rename_variable_respects_boundaries() {
        let renamed = rename_variable("repo(id: $id, ids: $ids)", "id", "q1_id");
        assert_eq!(renamed, "repo(id: $q1_id, ids: $ids)");
    }

    #[test]
    fn test_compose_batch_namespaces_variables() {
        let items = vec![
            BatchQueryItem {
                name: "a".into(),
                query: "query($owner: String!) { repository(owner: $owner) { id } }".into(),
                variables: {
                    let mut m = Map::new();
                    m.insert("owner".into(), json!("octocat"));
                    m
                },
            },
            BatchQueryItem {
                name: "b".into(),
                query: "{ viewer { login } }".into(),
                variables: Map::new(),
            },
        ];

        let (query, vars) = compose_batch(&items).unwrap();
        assert!(query.starts_with("query($a_owner: String!)"));
        assert!(query.contains("a: repository(owner: $a_owner) { id }"));
        assert!(query.contains("b: viewer { login }"));
        assert_eq!(vars.get("a_owner"), Some(&json!("octocat")));
    }

    #[test]
    fn test_empty_variables_encode_as_absent() {
        assert!(variable_map_is_empty(&json!(null)));
        assert!(variable_map_is_empty(&json!({})));
        assert!(!variable_map_is_empty(&json!({"a": 1})));
    }
}
