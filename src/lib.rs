//! Dataflow-based defect finder for JVM program models.
//!
//! The engine consumes an already-parsed program model, runs per-method
//! dataflow analyses through a shared memoizing cache, and drives plugin
//! detectors over the classes in ordered passes. Findings are emitted as
//! SARIF.

pub mod cache;
pub mod cfg;
pub mod dataflow;
pub mod descriptor;
pub mod detect;
pub mod errors;
pub mod ir;
pub mod orchestrator;
pub mod plugin;
pub mod qualifiers;
pub mod report;
pub mod sarif;
pub mod session;
