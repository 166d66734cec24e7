// src/core/haproxy/mod.rs

//! HAProxy Dataplane API integration: the REST client, scoped transactions,
//! server slot allocation, and the reconciler.

pub mod dataplane;
pub mod reconciler;
pub mod slots;
pub mod transaction;
