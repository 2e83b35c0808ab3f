//! In-memory stand-in for a Portofino REST backend.
//!
//! Serves class accessors, enveloped records keyed by `__rowKey`, JWT login
//! with renewal, and either the legacy or the current response shapes for
//! delete and bulk update. Every request is counted so tests can assert on
//! call patterns.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::debug;

pub const API_VERSION_HEADER: &str = "x-portofino-api-version";
pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "admin";

/// Any resource with this name answers 403 to authenticated callers.
pub const RESTRICTED: &str = "restricted";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Generation {
    /// Pre-5.2: counts for deletes, not-updated ids for bulk updates.
    Legacy,
    Current,
}

#[derive(Debug, Default)]
pub struct Table {
    pub properties: Vec<(String, String)>,
    pub rows: BTreeMap<i64, Map<String, Value>>,
    /// Rows other tables point at; deleting them is a 409.
    pub referenced: HashSet<i64>,
    next_id: i64,
}

impl Table {
    fn type_of(&self, field: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, type_name)| type_name.as_str())
    }
}

#[derive(Debug)]
pub struct Backend {
    pub generation: Generation,
    pub token_ttl_secs: i64,
    tables: HashMap<String, Table>,
    tokens: HashMap<String, i64>,
    issued: u64,
    hits: HashMap<String, usize>,
}

pub type Db = Arc<RwLock<Backend>>;

impl Backend {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            token_ttl_secs: 3600,
            tables: HashMap::new(),
            tokens: HashMap::new(),
            issued: 0,
            hits: HashMap::new(),
        }
    }

    /// Backend with an `orders` table holding three rows, the middle one
    /// referenced by an invoice.
    pub fn seeded(generation: Generation) -> Self {
        let mut backend = Self::new(generation);
        backend.add_table(
            "orders",
            &[
                ("customer", "java.lang.String"),
                ("placed_at", "java.sql.Timestamp"),
                ("total", "java.math.BigDecimal"),
            ],
        );
        backend.add_table(RESTRICTED, &[("secret", "java.lang.String")]);
        backend.insert_row(
            "orders",
            json!({"customer": "ACME", "placed_at": 1_609_459_200_000_i64, "total": 120}),
        );
        let referenced = backend.insert_row(
            "orders",
            json!({"customer": "Globex", "placed_at": 1_612_137_600_000_i64, "total": 80}),
        );
        backend.insert_row(
            "orders",
            json!({"customer": "Initech", "placed_at": 1_614_556_800_000_i64, "total": 45}),
        );
        if let Some(table) = backend.tables.get_mut("orders") {
            table.referenced.insert(referenced);
        }
        backend
    }

    pub fn add_table(&mut self, name: &str, properties: &[(&str, &str)]) {
        self.tables.insert(
            name.to_string(),
            Table {
                properties: properties
                    .iter()
                    .map(|(n, t)| (n.to_string(), t.to_string()))
                    .collect(),
                next_id: 1,
                ..Table::default()
            },
        );
    }

    /// Inserts a row and returns its id. Unknown tables are ignored (returns 0).
    pub fn insert_row(&mut self, table: &str, fields: Value) -> i64 {
        let Some(table) = self.tables.get_mut(table) else {
            return 0;
        };
        let id = table.next_id;
        table.next_id += 1;
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        table.rows.insert(id, fields);
        id
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Number of requests seen for e.g. `GET /orders/:classAccessor`.
    pub fn hits(&self, key: &str) -> usize {
        self.hits.get(key).copied().unwrap_or(0)
    }

    fn hit(&mut self, key: String) {
        debug!(%key, "request");
        *self.hits.entry(key).or_default() += 1;
    }

    fn issue_token(&mut self) -> String {
        self.issued += 1;
        let exp = chrono::Utc::now().timestamp() + self.token_ttl_secs;
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS512"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            json!({"sub": USERNAME, "exp": exp, "jti": self.issued}).to_string(),
        );
        let token = format!("{header}.{payload}.bW9jaw");
        self.tokens.insert(token.clone(), exp);
        token
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<String, Response> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| StatusCode::UNAUTHORIZED.into_response())?;
        match self.tokens.get(token) {
            Some(exp) if *exp > chrono::Utc::now().timestamp() => Ok(token.to_string()),
            _ => Err(StatusCode::UNAUTHORIZED.into_response()),
        }
    }

    fn is_current(&self) -> bool {
        self.generation == Generation::Current
    }
}

pub fn app() -> Router {
    app_with(Arc::new(RwLock::new(Backend::seeded(Generation::Current))))
}

pub fn app_with(db: Db) -> Router {
    Router::new()
        .route(
            "/api/{first}",
            get(collection_get)
                .post(collection_post)
                .put(collection_put)
                .delete(collection_delete),
        )
        .route(
            "/api/{first}/{second}",
            get(member_get)
                .post(member_post)
                .put(member_put)
                .delete(member_delete),
        )
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

pub async fn run_with(listener: TcpListener, db: Db) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with(db)).await
}

// -- collection routes ---------------------------------------------------------

async fn collection_get(
    State(db): State<Db>,
    Path(first): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let mut backend = db.write().await;
    backend.hit(format!("GET /{first}"));
    if first == ":description" {
        return Json(json!({"name": "api", "loginPath": "/:auth"})).into_response();
    }
    if let Err(denied) = guard(&backend, &headers, &first) {
        return denied;
    }
    let Some(table) = backend.table(&first) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    list(table, &query.unwrap_or_default())
}

async fn collection_post(
    State(db): State<Db>,
    Path(first): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut backend = db.write().await;
    backend.hit(format!("POST /{first}"));
    if first == ":auth" {
        return login(&mut backend, &body);
    }
    if let Err(denied) = guard(&backend, &headers, &first) {
        return denied;
    }
    let fields = match parse_fields(&backend, &first, &body) {
        Ok(fields) => fields,
        Err(rejected) => return rejected,
    };
    let id = backend.insert_row(&first, Value::Object(fields));
    match backend.table(&first).and_then(|t| t.rows.get(&id)) {
        Some(row) => (StatusCode::CREATED, Json(render(id, row))).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn collection_put(
    State(db): State<Db>,
    Path(first): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let mut backend = db.write().await;
    backend.hit(format!("PUT /{first}"));
    if let Err(denied) = guard(&backend, &headers, &first) {
        return denied;
    }
    let fields = match parse_fields(&backend, &first, &body) {
        Ok(fields) => fields,
        Err(rejected) => return rejected,
    };
    let current = backend.is_current();
    let Some(table) = backend.tables.get_mut(&first) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut updated = Vec::new();
    let mut not_updated = Vec::new();
    for id in query_ids(&query.unwrap_or_default()) {
        match table.rows.get_mut(&id) {
            Some(row) => {
                row.extend(fields.clone());
                updated.push(id);
            }
            None => not_updated.push(id),
        }
    }

    if current {
        versioned(Json(json!(updated)).into_response())
    } else {
        Json(json!(not_updated)).into_response()
    }
}

async fn collection_delete(
    State(db): State<Db>,
    Path(first): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let mut backend = db.write().await;
    backend.hit(format!("DELETE /{first}"));
    if first == ":auth" {
        return match backend.authorize(&headers) {
            Ok(token) => {
                backend.tokens.remove(&token);
                StatusCode::OK.into_response()
            }
            Err(denied) => denied,
        };
    }
    if let Err(denied) = guard(&backend, &headers, &first) {
        return denied;
    }
    let current = backend.is_current();
    let Some(table) = backend.tables.get_mut(&first) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let ids = query_ids(&query.unwrap_or_default());
    if let Some(id) = ids.iter().find(|id| table.referenced.contains(*id)) {
        return conflict(*id);
    }
    let deleted: Vec<i64> = ids
        .into_iter()
        .filter(|id| table.rows.remove(id).is_some())
        .collect();

    if current {
        versioned(Json(json!(deleted)).into_response())
    } else {
        Json(json!(deleted.len())).into_response()
    }
}

// -- member routes -------------------------------------------------------------

async fn member_get(
    State(db): State<Db>,
    Path((first, second)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let mut backend = db.write().await;
    backend.hit(format!("GET /{first}/{second}"));
    if let Err(denied) = guard(&backend, &headers, &first) {
        return denied;
    }
    let Some(table) = backend.table(&first) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if second == ":classAccessor" {
        return Json(class_accessor(&first, table)).into_response();
    }
    match second.parse().ok().and_then(|id: i64| table.rows.get(&id).map(|r| (id, r))) {
        Some((id, row)) => Json(render(id, row)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn member_post(
    State(db): State<Db>,
    Path((first, second)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let mut backend = db.write().await;
    backend.hit(format!("POST /{first}/{second}"));
    if first != ":auth" || second != ":renew-token" {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if let Err(denied) = backend.authorize(&headers) {
        return denied;
    }
    Json(Value::String(backend.issue_token())).into_response()
}

async fn member_put(
    State(db): State<Db>,
    Path((first, second)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut backend = db.write().await;
    backend.hit(format!("PUT /{first}/{second}"));
    if let Err(denied) = guard(&backend, &headers, &first) {
        return denied;
    }
    let fields = match parse_fields(&backend, &first, &body) {
        Ok(fields) => fields,
        Err(rejected) => return rejected,
    };
    let Some(table) = backend.tables.get_mut(&first) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(id) = second.parse::<i64>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match table.rows.get_mut(&id) {
        Some(row) => {
            row.extend(fields);
            Json(render(id, row)).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn member_delete(
    State(db): State<Db>,
    Path((first, second)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let mut backend = db.write().await;
    backend.hit(format!("DELETE /{first}/{second}"));
    if let Err(denied) = guard(&backend, &headers, &first) {
        return denied;
    }
    let current = backend.is_current();
    let Some(table) = backend.tables.get_mut(&first) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(id) = second.parse::<i64>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if table.referenced.contains(&id) {
        return conflict(id);
    }
    let removed = table.rows.remove(&id).is_some();

    if current {
        let deleted: Vec<i64> = if removed { vec![id] } else { Vec::new() };
        versioned(Json(json!(deleted)).into_response())
    } else {
        Json(json!(usize::from(removed))).into_response()
    }
}

// -- helpers -------------------------------------------------------------------

fn guard(backend: &Backend, headers: &HeaderMap, resource: &str) -> Result<(), Response> {
    backend.authorize(headers)?;
    if resource == RESTRICTED {
        return Err(StatusCode::FORBIDDEN.into_response());
    }
    Ok(())
}

fn login(backend: &mut Backend, body: &[u8]) -> Response {
    let form: HashMap<String, String> = url::form_urlencoded::parse(body)
        .into_owned()
        .collect();
    let valid = form.get("username").map(String::as_str) == Some(USERNAME)
        && form.get("password").map(String::as_str) == Some(PASSWORD);
    if !valid {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "jwt": backend.issue_token(),
        "userId": 1,
        "displayName": "Administrator",
        "administrator": true,
        "groups": ["administrators", "registered"]
    }))
    .into_response()
}

fn class_accessor(name: &str, table: &Table) -> Value {
    json!({
        "name": name,
        "keyProperties": [],
        "properties": table
            .properties
            .iter()
            .map(|(n, t)| json!({"name": n, "type": t, "label": n}))
            .collect::<Vec<_>>()
    })
}

fn render(id: i64, row: &Map<String, Value>) -> Value {
    let mut out: Map<String, Value> = row
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                json!({"value": value, "displayValue": display(value)}),
            )
        })
        .collect();
    out.insert("__rowKey".to_string(), Value::String(id.to_string()));
    Value::Object(out)
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Rejects unknown fields and timestamps that are not epoch milliseconds.
fn parse_fields(
    backend: &Backend,
    resource: &str,
    body: &[u8],
) -> Result<Map<String, Value>, Response> {
    let Some(table) = backend.table(resource) else {
        return Err(StatusCode::NOT_FOUND.into_response());
    };
    let fields = match serde_json::from_slice(body) {
        Ok(Value::Object(fields)) => fields,
        _ => return Err(bad_request("body must be a JSON object".to_string())),
    };
    for (name, value) in &fields {
        match table.type_of(name) {
            None => return Err(bad_request(format!("unknown field {name}"))),
            Some("java.sql.Timestamp") if !(value.is_i64() || value.is_null()) => {
                return Err(bad_request(format!("{name} expects epoch milliseconds")))
            }
            Some(_) => {}
        }
    }
    Ok(fields)
}

fn list(table: &Table, query: &str) -> Response {
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let search: Vec<(String, String)> = params
        .get("searchString")
        .map(|s| {
            url::form_urlencoded::parse(s.as_bytes())
                .into_owned()
                .filter_map(|(k, v)| k.strip_prefix("search_").map(|f| (f.to_string(), v)))
                .collect()
        })
        .unwrap_or_default();

    let mut rows: Vec<(i64, &Map<String, Value>)> = table
        .rows
        .iter()
        .filter(|(_, row)| {
            search.iter().all(|(field, term)| {
                row.get(field)
                    .map(|v| display(v).to_lowercase().contains(&term.to_lowercase()))
                    .unwrap_or(false)
            })
        })
        .map(|(id, row)| (*id, row))
        .collect();

    if let Some(property) = params.get("sortProperty") {
        rows.sort_by(|a, b| compare(a.1.get(property), b.1.get(property)));
        if params.get("sortDirection").map(String::as_str) == Some("desc") {
            rows.reverse();
        }
    }

    let total = rows.len();
    let first: usize = params.get("firstResult").and_then(|v| v.parse().ok()).unwrap_or(0);
    let max: usize = params.get("maxResults").and_then(|v| v.parse().ok()).unwrap_or(total);
    let records: Vec<Value> = rows
        .into_iter()
        .skip(first)
        .take(max)
        .map(|(id, row)| render(id, row))
        .collect();

    Json(json!({"records": records, "totalRecords": total})).into_response()
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => display(x).cmp(&display(y)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn query_ids(query: &str) -> Vec<i64> {
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| k == "id")
        .filter_map(|(_, v)| v.parse().ok())
        .collect()
}

fn versioned(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static("5.2"));
    response
}

fn conflict(id: i64) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({"message": format!("row {id} is referenced by other records")})),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"message": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_wraps_values_and_adds_row_key() {
        let row = json!({"customer": "ACME", "total": 12}).as_object().cloned().unwrap();
        let rendered = render(7, &row);
        assert_eq!(rendered["customer"], json!({"value": "ACME", "displayValue": "ACME"}));
        assert_eq!(rendered["total"]["displayValue"], "12");
        assert_eq!(rendered["__rowKey"], "7");
    }

    #[test]
    fn query_ids_reads_repeated_keys() {
        assert_eq!(query_ids("id=1&id=3&other=2&id=x"), vec![1, 3]);
    }

    #[test]
    fn issued_tokens_carry_exp_claim() {
        let mut backend = Backend::new(Generation::Current);
        backend.token_ttl_secs = 60;
        let token = backend.issue_token();
        let payload = token.split('.').nth(1).unwrap();
        let claims: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        let exp = claims["exp"].as_i64().unwrap();
        assert!(exp > chrono::Utc::now().timestamp());
        assert!(exp <= chrono::Utc::now().timestamp() + 60);
    }

    #[test]
    fn seeded_backend_marks_a_referenced_order() {
        let backend = Backend::seeded(Generation::Legacy);
        let orders = backend.table("orders").unwrap();
        assert_eq!(orders.rows.len(), 3);
        assert!(orders.referenced.contains(&2));
    }
}
