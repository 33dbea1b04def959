//! Memory hygiene: constant-time comparison and process hardening

pub mod constant_time;
pub mod wipe;

pub use constant_time::ct_eq;
