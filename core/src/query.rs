//! Query-string dialect of the backend's list and bulk endpoints.
//!
//! Keys are emitted in sorted order and values are percent-encoded with the
//! RFC 3986 unreserved set, so the same parameters always produce the same
//! string. Filters travel as a nested query string of `search_<field>=<term>`
//! pairs under `searchString`.

use serde_json::Value;

use crate::types::{ListParams, RecordId};

const SEARCH_PREFIX: &str = "search_";

/// Builds the query string (without `?`) for a list request.
pub fn list_query(params: &ListParams) -> String {
    let mut pairs = Vec::new();

    if let Some(sort) = &params.sort {
        pairs.push(("sortProperty".to_string(), sort.field.clone()));
        pairs.push(("sortDirection".to_string(), sort.order.as_query().to_string()));
    }

    if let Some(pagination) = &params.pagination {
        let first = pagination
            .page
            .saturating_sub(1)
            .saturating_mul(pagination.per_page);
        pairs.push(("firstResult".to_string(), first.to_string()));
        pairs.push(("maxResults".to_string(), pagination.per_page.to_string()));
    }

    if !params.filter.is_empty() {
        let mut search = Vec::new();
        for (field, term) in &params.filter {
            let key = format!("{SEARCH_PREFIX}{field}");
            match term {
                Value::Null => {}
                Value::Array(terms) => {
                    search.extend(terms.iter().map(|t| (key.clone(), term_to_string(t))));
                }
                other => search.push((key, term_to_string(other))),
            }
        }
        pairs.push(("searchString".to_string(), encode_pairs(search)));
    }

    encode_pairs(pairs)
}

/// Builds `id=<a>&id=<b>...` for bulk endpoints, preserving id order.
pub fn ids_query(ids: &[RecordId]) -> String {
    encode_pairs(
        ids.iter()
            .map(|id| ("id".to_string(), id.to_string()))
            .collect(),
    )
}

/// Appends a query string to a URL, omitting `?` when the query is empty.
pub fn with_query(url: String, query: &str) -> String {
    if query.is_empty() {
        url
    } else {
        format!("{url}?{query}")
    }
}

fn encode_pairs(mut pairs: Vec<(String, String)>) -> String {
    // Stable sort keeps repeated keys in their original order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn term_to_string(term: &Value) -> String {
    match term {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
