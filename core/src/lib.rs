//! Adapter between a generic admin UI's data and auth operations and the
//! Portofino REST API.
//!
//! # Overview
//! `Provider` is the entry point. It lazily builds one `ResourceClient` per
//! resource from the backend's class accessor metadata, and routes every call
//! through a `SessionManager` that attaches the bearer token, renews it before
//! it expires, and clears it when the backend rejects it.
//!
//! # Design
//! - `ResourceClient` splits every operation into `build_*` (produces an
//!   `HttpRequest`) and `parse_*` (consumes an `HttpResponse`), so the wire
//!   rules are testable without I/O.
//! - The HTTP round-trip is behind the `Transport` trait; `ReqwestTransport`
//!   is the default.
//! - Token and profile live in a `SessionStore`, shared by any number of
//!   providers.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod metadata;
pub mod operation;
pub mod provider;
pub mod query;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use client::ResourceClient;
pub use config::ProviderConfig;
pub use error::{ApiError, Result};
pub use http::{HttpMethod, HttpRequest, HttpResponse, API_VERSION_HEADER};
pub use metadata::{ClassAccessor, Property, PropertyKind};
pub use operation::{DataProvider, Operation, OperationResult};
pub use provider::Provider;
pub use session::SessionManager;
pub use store::{FileStore, MemoryStore, SessionStore};
pub use transport::{ReqwestTransport, Transport};
pub use types::{
    FieldValue, Identity, ListParams, ListResult, Pagination, Permissions, Record, RecordId, Sort,
    SortOrder, UserProfile,
};
