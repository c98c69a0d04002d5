//! Diffing an fid's Hub state against the store.
//!
//! Both reconcilers perform a full outer join on identity: every record present on only one
//! side is reported exactly once to the caller's handler. The dedup maps live only for the
//! duration of one call.

mod messages;
mod username_proofs;

pub use messages::{
    HubMessageDivergence, MessageReconciliation, MessageReconciliationHandler,
    MessageReconciliationSummary,
};
pub use username_proofs::{
    ProofReconciliationOutcome, ProofReconciliationSummary, TimeRange,
    UsernameProofReconciliation, UsernameProofReconciliationHandler,
};
