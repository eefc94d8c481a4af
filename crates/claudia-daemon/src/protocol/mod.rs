//! Tool-call protocol: JSON-RPC 2.0 over stdio.

pub mod stdio;
pub mod types;
