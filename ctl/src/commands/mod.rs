mod list_requests;
mod serial_range;

pub use certa_api::auth::providers::token::token_digest;
pub use list_requests::{ListRequestsParams, list_requests};
pub use serial_range::{SerialRangeCommand, serial_range};
