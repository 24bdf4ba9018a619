use chrono::{DateTime, SubsecRound, Utc};

pub mod authority;
pub mod cert;
pub mod request;
pub mod serial;

pub use authority::*;
pub use cert::*;
pub use request::*;
pub use serial::*;

/// Current time truncated to milliseconds, the precision BSON dates keep, so
/// records read back compare equal to what was written.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
