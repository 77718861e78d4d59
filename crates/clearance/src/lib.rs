//! Clearance workflow and certificate integrity engine.
//!
//! Tracks per-department approval of a student's no-dues application, governs reapplication
//! of rejected applications, and issues certificates whose integrity can be re-verified from a
//! scanned QR payload.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
