//! Per-resource CRUD client.
//!
//! # Design
//! Each operation is split into a `build_*` method that produces an
//! `HttpRequest` and a `parse_*` method that consumes the `HttpResponse`, as
//! plain functions of the resource's class accessor. The async operation
//! methods glue the two halves together through the `SessionManager`, which
//! owns the token. Legacy (pre-5.2) and current backends differ only in the
//! bulk and delete response shapes, so the branching lives in the parsers.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::codec::{to_plain_record, to_wire_json};
use crate::config::{join_path, ProviderConfig};
use crate::error::{ApiError, Result};
use crate::http::{HttpMethod, HttpRequest, HttpResponse, API_VERSION_HEADER};
use crate::metadata::ClassAccessor;
use crate::query::{ids_query, list_query, with_query};
use crate::session::SessionManager;
use crate::types::{ListParams, ListResult, Record, RecordId};

pub struct ResourceClient {
    resource: String,
    base_url: String,
    api_version: String,
    send_version_header: bool,
    accessor: ClassAccessor,
    session: Arc<SessionManager>,
}

impl ResourceClient {
    pub fn new(
        resource: &str,
        config: &ProviderConfig,
        accessor: ClassAccessor,
        session: Arc<SessionManager>,
    ) -> Self {
        Self {
            resource: resource.to_string(),
            base_url: join_path(&config.api_url, resource),
            api_version: config.api_version.clone(),
            send_version_header: config.sends_version_header(),
            accessor,
            session,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn accessor(&self) -> &ClassAccessor {
        &self.accessor
    }

    // -- request builders ----------------------------------------------------

    pub fn build_get_one(&self, id: &RecordId) -> HttpRequest {
        HttpRequest::new(HttpMethod::Get, self.record_url(id))
    }

    pub fn build_get_list(&self, params: &ListParams) -> HttpRequest {
        let url = with_query(self.base_url.clone(), &list_query(params));
        HttpRequest::new(HttpMethod::Get, url)
    }

    pub fn build_create(&self, data: &Record) -> HttpRequest {
        HttpRequest::new(HttpMethod::Post, self.base_url.clone())
            .with_json_body(to_wire_json(&self.accessor, data).to_string())
    }

    pub fn build_update(&self, id: &RecordId, data: &Record) -> HttpRequest {
        HttpRequest::new(HttpMethod::Put, self.record_url(id))
            .with_json_body(to_wire_json(&self.accessor, data).to_string())
    }

    pub fn build_update_many(&self, ids: &[RecordId], data: &Record) -> HttpRequest {
        let url = with_query(self.base_url.clone(), &ids_query(ids));
        self.versioned(HttpRequest::new(HttpMethod::Put, url))
            .with_json_body(to_wire_json(&self.accessor, data).to_string())
    }

    pub fn build_delete(&self, id: &RecordId) -> HttpRequest {
        self.versioned(HttpRequest::new(HttpMethod::Delete, self.record_url(id)))
    }

    pub fn build_delete_many(&self, ids: &[RecordId]) -> HttpRequest {
        let url = with_query(self.base_url.clone(), &ids_query(ids));
        self.versioned(HttpRequest::new(HttpMethod::Delete, url))
    }

    // -- response parsers ----------------------------------------------------

    /// Parses a single-record response (get, create, update).
    pub fn parse_record(&self, response: HttpResponse) -> Result<Record> {
        check_status(&response)?;
        to_plain_record(&self.accessor, parse_body(&response)?)
    }

    pub fn parse_get_list(&self, response: HttpResponse) -> Result<ListResult> {
        check_status(&response)?;
        let mut body = parse_body(&response)?;
        let records = match body.get_mut("records").map(Value::take) {
            Some(Value::Array(records)) => records,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(ApiError::Deserialization(format!(
                    "records is not an array: {other}"
                )))
            }
        };
        let data = records
            .into_iter()
            .map(|raw| to_plain_record(&self.accessor, raw))
            .collect::<Result<Vec<_>>>()?;
        let total = body
            .get("totalRecords")
            .and_then(Value::as_u64)
            .unwrap_or(data.len() as u64);
        Ok(ListResult { data, total })
    }

    /// Legacy backends answer with a deleted-row count, current ones with the
    /// array of deleted ids.
    pub fn parse_delete(&self, id: &RecordId, response: HttpResponse) -> Result<RecordId> {
        check_delete_status(&response)?;
        match parse_body(&response)? {
            Value::Number(n) if n.as_i64() == Some(1) => Ok(id.clone()),
            Value::Number(n) => Err(ApiError::DeleteFailed {
                id: id.clone(),
                deleted: n.as_i64().unwrap_or_default(),
            }),
            Value::Array(ids) => ids
                .first()
                .and_then(RecordId::from_json)
                .ok_or(ApiError::DeleteFailed {
                    id: id.clone(),
                    deleted: 0,
                }),
            other => Err(ApiError::Deserialization(format!(
                "unexpected delete response: {other}"
            ))),
        }
    }

    pub fn parse_delete_many(
        &self,
        ids: &[RecordId],
        response: HttpResponse,
    ) -> Result<Vec<RecordId>> {
        check_delete_status(&response)?;
        match parse_body(&response)? {
            // The legacy count does not say which rows went away.
            Value::Number(_) => Ok(ids.to_vec()),
            Value::Array(deleted) => collect_ids(&deleted),
            other => Err(ApiError::Deserialization(format!(
                "unexpected delete response: {other}"
            ))),
        }
    }

    /// Current backends flag their responses with the version header and
    /// return what was updated; legacy ones return the ids that were not.
    pub fn parse_update_many(
        &self,
        ids: &[RecordId],
        response: HttpResponse,
    ) -> Result<Vec<RecordId>> {
        check_status(&response)?;
        let current = response.header(API_VERSION_HEADER).is_some();
        let body = parse_body(&response)?;

        if current {
            return match body {
                Value::Array(updated) => updated
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(_) => to_plain_record(&self.accessor, item)?
                            .id()
                            .ok_or_else(|| {
                                ApiError::Deserialization("updated record has no id".to_string())
                            }),
                        other => RecordId::from_json(&other).ok_or_else(|| {
                            ApiError::Deserialization(format!("invalid record id: {other}"))
                        }),
                    })
                    .collect(),
                Value::Number(_) => Ok(ids.to_vec()),
                other => Err(ApiError::Deserialization(format!(
                    "unexpected update response: {other}"
                ))),
            };
        }

        let not_updated: HashSet<RecordId> = match body {
            Value::Array(failed) => collect_ids(&failed)?.into_iter().collect(),
            Value::Null => HashSet::new(),
            other => {
                return Err(ApiError::Deserialization(format!(
                    "unexpected update response: {other}"
                )))
            }
        };
        Ok(ids
            .iter()
            .filter(|id| !not_updated.contains(*id))
            .cloned()
            .collect())
    }

    // -- operations ----------------------------------------------------------

    pub async fn get_one(&self, id: &RecordId) -> Result<Record> {
        let response = self.session.fetch(self.build_get_one(id)).await?;
        self.parse_record(response)
    }

    pub async fn get_list(&self, params: &ListParams) -> Result<ListResult> {
        let response = self.session.fetch(self.build_get_list(params)).await?;
        self.parse_get_list(response)
    }

    /// One `get_one` per id, in order; there is no bulk-fetch endpoint.
    pub async fn get_many(&self, ids: &[RecordId]) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            records.push(self.get_one(id).await?);
        }
        Ok(records)
    }

    pub async fn get_many_reference(
        &self,
        target: &str,
        id: &RecordId,
        params: &ListParams,
    ) -> Result<ListResult> {
        let mut params = params.clone();
        params
            .filter
            .insert(target.to_string(), Value::String(id.to_string()));
        self.get_list(&params).await
    }

    pub async fn create(&self, data: &Record) -> Result<Record> {
        let response = self.session.fetch(self.build_create(data)).await?;
        self.parse_record(response)
    }

    pub async fn update(&self, id: &RecordId, data: &Record) -> Result<Record> {
        let response = self.session.fetch(self.build_update(id, data)).await?;
        self.parse_record(response)
    }

    pub async fn update_many(&self, ids: &[RecordId], data: &Record) -> Result<Vec<RecordId>> {
        let response = self.session.fetch(self.build_update_many(ids, data)).await?;
        self.parse_update_many(ids, response)
    }

    pub async fn delete(&self, id: &RecordId) -> Result<RecordId> {
        let response = self.session.fetch(self.build_delete(id)).await?;
        self.parse_delete(id, response)
    }

    pub async fn delete_many(&self, ids: &[RecordId]) -> Result<Vec<RecordId>> {
        let response = self.session.fetch(self.build_delete_many(ids)).await?;
        self.parse_delete_many(ids, response)
    }

    fn record_url(&self, id: &RecordId) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(id.as_str()))
    }

    fn versioned(&self, request: HttpRequest) -> HttpRequest {
        if self.send_version_header {
            request.with_header(API_VERSION_HEADER, self.api_version.clone())
        } else {
            request
        }
    }
}

/// Map non-success status codes to `HttpError`.
fn check_status(response: &HttpResponse) -> Result<()> {
    if response.is_success() {
        return Ok(());
    }
    debug!(status = response.status, "backend returned an error status");
    Err(ApiError::HttpError {
        status: response.status,
        status_text: response.status_text.clone(),
        body: response.body.clone(),
    })
}

/// Like `check_status`, but 409 becomes a constraint violation.
fn check_delete_status(response: &HttpResponse) -> Result<()> {
    if response.status == 409 {
        return Err(ApiError::ConstraintViolation {
            message: error_message(&response.body),
        });
    }
    check_status(response)
}

fn parse_body(response: &HttpResponse) -> Result<Value> {
    serde_json::from_str(&response.body).map_err(|e| ApiError::Deserialization(e.to_string()))
}

/// The backend sends either a plain message or `{ "message": ... }`.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(fields)) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Ok(Value::String(message)) => message,
        _ => body.to_string(),
    }
}

fn collect_ids(values: &[Value]) -> Result<Vec<RecordId>> {
    values
        .iter()
        .map(|v| {
            RecordId::from_json(v)
                .ok_or_else(|| ApiError::Deserialization(format!("invalid record id: {v}")))
        })
        .collect()
}
