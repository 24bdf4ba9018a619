//! Types shared between the certa crates: identifiers, wire enums, input
//! parameters and output views.

pub mod caller;
pub mod ids;
pub mod params;
pub mod types;
pub mod views;
