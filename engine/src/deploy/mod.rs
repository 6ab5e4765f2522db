//! Deployment: reconciliation, the job pipeline and immediate service control

pub mod control;
pub mod fsm;
pub mod pipeline;
pub mod reconciler;
