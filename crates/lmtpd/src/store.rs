//! The narrow interface to the mail-storage service. The daemon only
//! ever asks it to resolve a user, report quota standing, and save
//! one message; everything else about mailbox management belongs to
//! the store.

use crate::headers::RawMessage;
use async_trait::async_trait;
use std::any::Any;
use std::net::IpAddr;
use std::time::Duration;

/// Connection endpoints handed to lookups so the backend can apply
/// per-network policy and log usefully.
#[derive(Debug, Clone)]
pub struct LookupContext {
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub session_id: String,
}

/// A resolved store user, produced by [`MailStore::lookup_user`].
#[derive(Debug, Clone)]
pub struct StoreUser {
    pub username: String,
    /// System uid to switch to for the save, when the process runs
    /// privileged.
    pub uid: Option<u32>,
    /// Prefix of the namespace holding the INBOX; detail mailboxes
    /// are created under it.
    pub namespace_prefix: String,
    pub quota_bytes: Option<u64>,
}

#[derive(Debug, PartialEq)]
pub enum QuotaStatus {
    Ok,
    Exceeded(String),
}

/// Token for a message the store has already saved, offered back on
/// subsequent saves of the same body so the backend can hard-link
/// instead of re-serialising.
pub struct SavedMail(pub Box<dyn Any + Send + Sync>);

impl std::fmt::Debug for SavedMail {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("SavedMail").finish()
    }
}

pub struct DeliveryRequest<'a> {
    pub user: &'a StoreUser,
    pub mailbox: String,
    pub envelope_sender: &'a str,
    /// Original-recipient style address, for Delivered-To logging.
    pub dest_addr: &'a str,
    pub final_dest_addr: &'a str,
    pub session_id: &'a str,
    /// Upper bound on lock waits; None leaves the store's default.
    pub lock_timeout: Option<Duration>,
    pub src_mail: Option<&'a SavedMail>,
    /// Ask for a [`SavedMail`] token back on success.
    pub want_saved_handle: bool,
    pub message: &'a RawMessage,
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    Saved { saved: Option<SavedMail> },
    /// Transient storage problem, reported as 451 4.2.0.
    TempFail(String),
    /// Quota exceeded, reported as 452 or 552 per policy.
    OverQuota(String),
    /// Store-internal failure; the detail is logged, the peer gets a
    /// generic temporary error.
    Internal(String),
}

#[async_trait]
pub trait MailStore: Send + Sync {
    async fn lookup_user(
        &self,
        username: &str,
        ctx: &LookupContext,
    ) -> anyhow::Result<Option<StoreUser>>;

    async fn quota_status(&self, user: &StoreUser) -> anyhow::Result<QuotaStatus>;

    async fn deliver(&self, request: DeliveryRequest<'_>) -> DeliveryOutcome;
}
