use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use log::{debug, warn};

use crate::config::HubConfig;
use crate::error::{BoxError, SyncError};
use crate::hub::{HubClient, with_timeout};
use crate::store::{ProofQuery, SyncStore};
use crate::username_proof::{ProofKey, StoredUsernameProof, UserNameProof, UserNameType};

/// Seconds added on both sides of the store query so that rows written with a slightly
/// different timestamp are still compared.
const STORE_RANGE_PAD_SECS: i64 = 1;

/// An inclusive range of Unix seconds. Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<i64>,
    pub stop: Option<i64>,
}

impl TimeRange {
    /// Parses optional bounds given as Unix seconds or RFC 3339 timestamps.
    pub fn parse(start: Option<&str>, stop: Option<&str>) -> Result<Self, SyncError> {
        let range = Self {
            start: start.map(parse_timestamp).transpose()?,
            stop: stop.map(parse_timestamp).transpose()?,
        };
        if let (Some(start), Some(stop)) = (range.start, range.stop)
            && start > stop
        {
            return Err(SyncError::InvalidRange(format!(
                "start {} is after stop {}",
                start, stop
            )));
        }
        Ok(range)
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start.is_none_or(|start| timestamp >= start)
            && self.stop.is_none_or(|stop| timestamp <= stop)
    }

    fn padded(&self, pad: i64) -> Self {
        Self {
            start: self.start.map(|s| s.saturating_sub(pad)),
            stop: self.stop.map(|s| s.saturating_add(pad)),
        }
    }
}

fn parse_timestamp(value: &str) -> Result<i64, SyncError> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return Ok(seconds);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.timestamp())
        .map_err(|_| SyncError::InvalidRange(format!("unparsable timestamp '{}'", value)))
}

/// Repair callbacks for username proof reconciliation.
#[async_trait]
pub trait UsernameProofReconciliationHandler: Send + Sync {
    /// Called once for every distinct Hub proof.
    async fn on_hub_proof(&self, proof: &UserNameProof, missing_in_db: bool)
    -> Result<(), BoxError>;

    /// Called once for every store proof that the Hub does not hold.
    async fn on_db_proof(
        &self,
        proof: &StoredUsernameProof,
        missing_in_hub: bool,
    ) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProofReconciliationSummary {
    pub hub_proofs: usize,
    pub db_proofs: usize,
    pub missing_in_db: usize,
    pub missing_in_hub: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofReconciliationOutcome {
    Reconciled(ProofReconciliationSummary),
    /// The time range was unusable; nothing was compared.
    Skipped { reason: String },
}

/// Compares the username proofs the Hub holds for an fid with the store's copy.
pub struct UsernameProofReconciliation<H, S>
where
    H: HubClient,
    S: SyncStore,
{
    hub: Arc<H>,
    store: Arc<S>,
    hub_config: HubConfig,
}

impl<H, S> Clone for UsernameProofReconciliation<H, S>
where
    H: HubClient,
    S: SyncStore,
{
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            store: self.store.clone(),
            hub_config: self.hub_config.clone(),
        }
    }
}

impl<H, S> UsernameProofReconciliation<H, S>
where
    H: HubClient,
    S: SyncStore,
{
    pub fn new(hub: Arc<H>, store: Arc<S>, hub_config: HubConfig) -> Self {
        Self {
            hub,
            store,
            hub_config,
        }
    }

    /// Reconciles the username proofs of `fid` for each of `types` (default: every type).
    ///
    /// Hub proofs are limited to `[start_time, stop_time]`, store proofs to the same range
    /// padded by one second. When several store rows share a key the most recent one wins.
    pub async fn reconcile_username_proofs_for_fid<R>(
        &self,
        fid: u64,
        handler: &R,
        start_time: Option<&str>,
        stop_time: Option<&str>,
        types: Option<&[UserNameType]>,
    ) -> Result<ProofReconciliationOutcome, SyncError>
    where
        R: UsernameProofReconciliationHandler + ?Sized,
    {
        let range = match TimeRange::parse(start_time, stop_time) {
            Ok(range) => range,
            Err(e) => {
                warn!(
                    "Skipping username proof reconciliation for fid {}: {}",
                    fid, e
                );
                return Ok(ProofReconciliationOutcome::Skipped {
                    reason: e.to_string(),
                });
            }
        };

        let types = types.unwrap_or(&UserNameType::ALL);
        let mut summary = ProofReconciliationSummary::default();
        for proof_type in types {
            self.reconcile_type(fid, *proof_type, range, handler, &mut summary)
                .await?;
        }
        debug!(
            "Reconciled {} hub username proofs for fid {}: {} missing in db, {} missing in hub",
            summary.hub_proofs, fid, summary.missing_in_db, summary.missing_in_hub
        );
        Ok(ProofReconciliationOutcome::Reconciled(summary))
    }

    async fn reconcile_type<R>(
        &self,
        fid: u64,
        proof_type: UserNameType,
        range: TimeRange,
        handler: &R,
        summary: &mut ProofReconciliationSummary,
    ) -> Result<(), SyncError>
    where
        R: UsernameProofReconciliationHandler + ?Sized,
    {
        let hub_proofs: Vec<UserNameProof> = with_timeout(
            self.hub_config.rpc_timeout,
            self.hub.get_username_proofs_by_fid(fid),
        )
        .await?
        .into_iter()
        .filter(|p| p.fid == fid && p.proof_type == proof_type && range.contains(p.timestamp))
        .collect();

        let padded = range.padded(STORE_RANGE_PAD_SECS);
        let query = ProofQuery {
            proof_type,
            start: padded.start,
            stop: padded.stop,
        };
        let db_proofs = self.store.get_username_proofs_by_fid(fid, &query).await?;
        summary.db_proofs += db_proofs.len();

        // Latest wins; on equal timestamps the first row read is kept.
        let mut latest: HashMap<ProofKey, StoredUsernameProof> = HashMap::new();
        let mut db_order: Vec<ProofKey> = Vec::new();
        for stored in db_proofs {
            let key = stored.proof.key();
            match latest.get_mut(&key) {
                Some(current) => {
                    if stored.proof.timestamp > current.proof.timestamp {
                        *current = stored;
                    }
                }
                None => {
                    db_order.push(key.clone());
                    latest.insert(key, stored);
                }
            }
        }

        let mut hub_keys: HashSet<ProofKey> = HashSet::new();
        for proof in &hub_proofs {
            let key = proof.key();
            let missing_in_db = !latest.contains_key(&key);
            if !hub_keys.insert(key) {
                continue;
            }
            summary.hub_proofs += 1;
            if missing_in_db {
                summary.missing_in_db += 1;
            }
            handler
                .on_hub_proof(proof, missing_in_db)
                .await
                .map_err(SyncError::Handler)?;
        }

        for key in &db_order {
            if hub_keys.contains(key) {
                continue;
            }
            if let Some(stored) = latest.get(key) {
                summary.missing_in_hub += 1;
                handler
                    .on_db_proof(stored, true)
                    .await
                    .map_err(SyncError::Handler)?;
            }
        }
        Ok(())
    }
}
