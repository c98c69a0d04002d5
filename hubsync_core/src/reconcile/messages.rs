use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};

use crate::config::{HubConfig, ReconcileConfig};
use crate::error::{BoxError, SyncError};
use crate::hub::{HubClient, PageRequest, with_timeout};
use crate::message::{Message, MessageHash, MessageKind, StoredMessage};
use crate::store::SyncStore;

/// How a Hub message compares to the store's copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubMessageDivergence {
    /// The store has no row for the message.
    pub missing_in_db: bool,
    /// The store's row was pruned.
    pub pruned_in_db: bool,
    /// The store's row was revoked.
    pub revoked_in_db: bool,
    /// The store's row is deleted, for any reason.
    pub deleted_in_db: bool,
}

impl HubMessageDivergence {
    fn of(stored: Option<&StoredMessage>) -> Self {
        match stored {
            None => Self {
                missing_in_db: true,
                ..Self::default()
            },
            Some(stored) => Self {
                missing_in_db: false,
                pruned_in_db: stored.pruned_at.is_some(),
                revoked_in_db: stored.revoked_at.is_some(),
                deleted_in_db: stored.deleted_at.is_some(),
            },
        }
    }

    /// The store holds the message live, exactly as the Hub does.
    pub fn is_consistent(&self) -> bool {
        !(self.missing_in_db || self.pruned_in_db || self.revoked_in_db || self.deleted_in_db)
    }
}

/// Repair callbacks for message reconciliation.
#[async_trait]
pub trait MessageReconciliationHandler: Send + Sync {
    /// Called once for every distinct Hub message.
    async fn on_hub_message(
        &self,
        message: &Message,
        divergence: HubMessageDivergence,
    ) -> Result<(), BoxError>;

    /// Called once for every store message that the Hub does not hold.
    async fn on_db_message(
        &self,
        message: &StoredMessage,
        missing_in_hub: bool,
    ) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageReconciliationSummary {
    pub hub_messages: usize,
    pub db_messages: usize,
    pub missing_in_db: usize,
    pub missing_in_hub: usize,
    pub pruned_in_db: usize,
    pub revoked_in_db: usize,
    /// Hub messages whose store row is deleted, whatever the reason.
    pub deleted_in_db: usize,
    pub duplicate_hub_messages: usize,
}

impl MessageReconciliationSummary {
    pub fn is_consistent(&self) -> bool {
        self.missing_in_db == 0
            && self.missing_in_hub == 0
            && self.pruned_in_db == 0
            && self.revoked_in_db == 0
            && self.deleted_in_db == 0
    }
}

/// Compares the messages the Hub holds for an fid with the store's copy.
pub struct MessageReconciliation<H, S>
where
    H: HubClient,
    S: SyncStore,
{
    hub: Arc<H>,
    store: Arc<S>,
    config: ReconcileConfig,
    hub_config: HubConfig,
}

impl<H, S> Clone for MessageReconciliation<H, S>
where
    H: HubClient,
    S: SyncStore,
{
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            hub_config: self.hub_config.clone(),
        }
    }
}

impl<H, S> MessageReconciliation<H, S>
where
    H: HubClient,
    S: SyncStore,
{
    pub fn new(hub: Arc<H>, store: Arc<S>, config: ReconcileConfig) -> Self {
        Self::with_hub_config(hub, store, config, HubConfig::default())
    }

    pub fn with_hub_config(
        hub: Arc<H>,
        store: Arc<S>,
        config: ReconcileConfig,
        hub_config: HubConfig,
    ) -> Self {
        Self {
            hub,
            store,
            config,
            hub_config,
        }
    }

    /// Reconciles every configured message kind of `fid`, reporting divergence to `handler`.
    ///
    /// Every kind is fetched from the Hub and the store before anything is reported, so a
    /// failing or timed out Hub call returns an error without any handler having run. A
    /// handler error aborts the call.
    pub async fn reconcile_messages_for_fid<R>(
        &self,
        fid: u64,
        handler: &R,
    ) -> Result<MessageReconciliationSummary, SyncError>
    where
        R: MessageReconciliationHandler + ?Sized,
    {
        let mut fetched = Vec::with_capacity(self.config.kinds.len());
        for kind in &self.config.kinds {
            let db_messages = self
                .store
                .get_messages_by_fid(fid, kind.message_types())
                .await?;
            let hub_messages = self.fetch_hub_messages(fid, *kind).await?;
            fetched.push((db_messages, hub_messages));
        }

        let mut summary = MessageReconciliationSummary::default();
        for (db_messages, hub_messages) in &fetched {
            report_kind(fid, db_messages, hub_messages, handler, &mut summary).await?;
        }

        if summary.is_consistent() {
            debug!(
                "Reconciled {} hub messages for fid {}: consistent",
                summary.hub_messages, fid
            );
        } else {
            info!(
                "Reconciled fid {}: {} missing in db, {} missing in hub, {} deleted, {} pruned, {} revoked",
                fid,
                summary.missing_in_db,
                summary.missing_in_hub,
                summary.deleted_in_db,
                summary.pruned_in_db,
                summary.revoked_in_db
            );
        }
        Ok(summary)
    }

    async fn fetch_hub_messages(
        &self,
        fid: u64,
        kind: MessageKind,
    ) -> Result<Vec<Message>, SyncError> {
        let mut hub_messages = Vec::new();
        if self.config.use_streaming {
            let mut messages = with_timeout(
                self.hub_config.rpc_timeout,
                self.hub
                    .stream_messages_by_fid(fid, kind, self.config.page_size),
            )
            .await?;
            loop {
                let next = with_timeout(self.hub_config.rpc_timeout, async {
                    Ok(messages.next().await)
                })
                .await?;
                match next {
                    Some(message) => hub_messages.push(message?),
                    None => break,
                }
            }
            return Ok(hub_messages);
        }

        let mut page_token: Option<Vec<u8>> = None;
        loop {
            let page = with_timeout(
                self.hub_config.rpc_timeout,
                self.hub.get_messages_by_fid(
                    fid,
                    kind,
                    PageRequest {
                        page_size: self.config.page_size,
                        page_token: page_token.clone(),
                    },
                ),
            )
            .await?;
            hub_messages.extend(page.messages);
            match page.next_page_token {
                Some(token) if !token.is_empty() => {
                    if page_token.as_ref() == Some(&token) {
                        warn!(
                            "Hub returned the same page token twice for fid {} ({}); stopping pagination",
                            fid, kind
                        );
                        break;
                    }
                    page_token = Some(token);
                }
                _ => break,
            }
        }
        Ok(hub_messages)
    }
}

async fn report_kind<R>(
    fid: u64,
    db_messages: &[StoredMessage],
    hub_messages: &[Message],
    handler: &R,
    summary: &mut MessageReconciliationSummary,
) -> Result<(), SyncError>
where
    R: MessageReconciliationHandler + ?Sized,
{
    summary.db_messages += db_messages.len();

    let mut db_by_hash: HashMap<MessageHash, &StoredMessage> =
        HashMap::with_capacity(db_messages.len());
    for stored in db_messages {
        db_by_hash.entry(stored.message.hash.clone()).or_insert(stored);
    }

    let mut seen_on_hub: HashSet<MessageHash> = HashSet::new();
    let mut pass = HubPass {
        fid,
        db_by_hash: &db_by_hash,
        seen_on_hub: &mut seen_on_hub,
        summary: &mut *summary,
    };
    for message in hub_messages {
        pass.visit(message, handler).await?;
    }

    let mut reported: HashSet<&MessageHash> = HashSet::new();
    for stored in db_messages {
        let hash = &stored.message.hash;
        if seen_on_hub.contains(hash) || !reported.insert(hash) {
            continue;
        }
        summary.missing_in_hub += 1;
        handler
            .on_db_message(stored, true)
            .await
            .map_err(SyncError::Handler)?;
    }
    Ok(())
}

struct HubPass<'a> {
    fid: u64,
    db_by_hash: &'a HashMap<MessageHash, &'a StoredMessage>,
    seen_on_hub: &'a mut HashSet<MessageHash>,
    summary: &'a mut MessageReconciliationSummary,
}

impl HubPass<'_> {
    async fn visit<R>(&mut self, message: &Message, handler: &R) -> Result<(), SyncError>
    where
        R: MessageReconciliationHandler + ?Sized,
    {
        if message.fid != self.fid {
            warn!(
                "Hub returned message {} of fid {} while reconciling fid {}",
                message.hash, message.fid, self.fid
            );
            return Ok(());
        }
        if !self.seen_on_hub.insert(message.hash.clone()) {
            self.summary.duplicate_hub_messages += 1;
            return Ok(());
        }

        let divergence = HubMessageDivergence::of(self.db_by_hash.get(&message.hash).copied());
        self.summary.hub_messages += 1;
        if divergence.missing_in_db {
            self.summary.missing_in_db += 1;
        }
        if divergence.pruned_in_db {
            self.summary.pruned_in_db += 1;
        }
        if divergence.revoked_in_db {
            self.summary.revoked_in_db += 1;
        }
        if divergence.deleted_in_db {
            self.summary.deleted_in_db += 1;
        }

        handler
            .on_hub_message(message, divergence)
            .await
            .map_err(SyncError::Handler)
    }
}
