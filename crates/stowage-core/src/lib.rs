//! # stowage-core
//!
//! Core crate for Stowage. Contains the unified error system, the layered
//! configuration schemas (including the transfer tuning knobs handed to the
//! transfer engine at call time), and the symmetric cipher used to seal
//! storage configuration at rest.
//!
//! This crate has **no** internal dependencies on other Stowage crates.

pub mod config;
pub mod crypt;
pub mod error;
pub mod result;

pub use error::AppError;
pub use result::AppResult;
