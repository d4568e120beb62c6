//! # stowage-entity
//!
//! Domain entity models for Stowage. Every struct in this crate represents
//! a persisted record or a domain value object: configured storages and
//! their per-backend settings, packages and their per-storage transfer
//! state, and schedules.

pub mod package;
pub mod schedule;
pub mod storage;
