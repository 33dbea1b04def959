//! Key derivation functions

pub mod hkdf;

pub use hkdf::derive;
