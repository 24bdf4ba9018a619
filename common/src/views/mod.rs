//! Output views for the various functions within certa.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

mod authority;
pub use authority::*;

mod cert;
pub use cert::*;

mod request;
pub use request::*;

/// One page of a list. `total` counts every matching record, not just the
/// ones on this page.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct PaginatedList<T> {
    pub items: Vec<T>,

    /// Number of records matching the query across all pages.
    pub total: u64,

    /// Offset of the first item on this page.
    pub start: usize,

    /// Requested page size.
    pub size: usize,
}

/// An error response for an API endpoint. This is used to return errors to the
/// client in a consistent format.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ApiErrorResponse {
    /// A stable error code that can be used to identify the type of error
    /// that occurred, e.g. `ConflictingOperation`.
    pub code: Option<String>,

    /// Numeric form of `code` for clients that switch on numbers.
    pub category: u16,

    /// A human-readable message describing the error that occurred.
    pub message: String,

    /// Policy messages when a request was rejected by policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
