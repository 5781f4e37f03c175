//! OCR jobs: accepting requests, tracking their pages, and reporting on
//! them.
//!
//! A job is a set of pages sharing one key in the result store. Nothing
//! about a job is kept in memory. Its record and per-page manifests in the
//! store are the only source of truth, so a restarted service picks up
//! where the last one left off (short of re-running interrupted pages).

pub mod dispatcher;
pub mod identity;
pub mod manifest;
pub mod status;
