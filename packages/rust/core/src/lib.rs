//! Core pipeline logic for DailyBrief.
//!
//! This crate owns the enrichment phase, the read-only verifier and the
//! orchestrator that sequences collection, media processing, enrichment
//! and verification into a single run.

pub mod enrichment;
pub mod pipeline;
pub mod verifier;
