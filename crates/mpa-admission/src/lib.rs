//! Admission webhook for the multidimensional pod autoscaler
//!
//! Intercepts pod CREATE, matches the pod to its controlling autoscaler
//! and rewrites `resources.requests`/`resources.limits` to the current
//! recommendation while preserving the original request:limit ratios.

pub mod patches;
pub mod provider;
pub mod registration;
pub mod server;
pub mod tls;
