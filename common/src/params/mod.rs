//! Input parameters for the various functions within certa.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

mod authority;
pub use authority::*;

mod cert;
pub use cert::*;

mod request;
pub use request::*;

/// Page size used when a list call does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Upper bound on the page size a client may request.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Parameters for paginating through a list of records. This is used by the
/// various list endpoints to allow clients to page through large sets of
/// records.
#[derive(Debug, Clone, Default, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct PaginationParams {
    /// Offset of the first record to return.
    pub start: Option<usize>,

    /// The maximum number of results to return. Defaults to 20.
    pub size: Option<usize>,
}

impl PaginationParams {
    pub fn new(start: usize, size: usize) -> Self {
        Self {
            start: Some(start),
            size: Some(size),
        }
    }

    pub fn start(&self) -> usize {
        self.start.unwrap_or(0)
    }

    pub fn size(&self) -> usize {
        self.size.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pagination_defaults() {
        let p = PaginationParams::default();
        assert_eq!(p.start(), 0);
        assert_eq!(p.size(), 20);
    }

    #[test]
    fn pagination_size_is_capped() {
        let p = PaginationParams::new(5, 1_000_000);
        assert_eq!(p.start(), 5);
        assert_eq!(p.size(), MAX_PAGE_SIZE);
    }
}
