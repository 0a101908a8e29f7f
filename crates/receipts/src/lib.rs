//! Delivery receipt reconciliation: buffered, batched application of
//! vendor callbacks to message and campaign state.

pub mod reconciler;

pub use reconciler::{DeliveryReconciler, FlushOutcome, ReconcilerHandle, ReconcilerSettings};
