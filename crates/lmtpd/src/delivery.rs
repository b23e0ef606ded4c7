//! Local delivery: drive the store once per accepted recipient,
//! reusing the first saved copy as a hard-link source, with the
//! effective uid scoped to each destination user when the process
//! runs privileged.

use crate::config::LmtpSettings;
use crate::headers::{valid_rfc822_orcpt, RawMessage};
use crate::server::Recipient;
use crate::store::{DeliveryOutcome, DeliveryRequest, MailStore, SavedMail};
use anyhow::Context;
use nix::unistd::{geteuid, seteuid, Uid};
use std::path::Path;
use std::time::Duration;

/// Trim the storage lock wait below the peer's advertised timeout so
/// a save never completes after the front proxy has already given up
/// on us (which would double-deliver on its retry). A peer timeout
/// of zero means none was advertised.
pub fn clamp_lock_timeout(existing_secs: u64, peer_timeout_secs: u64) -> Option<Duration> {
    if peer_timeout_secs > 0 && (existing_secs == 0 || existing_secs > peer_timeout_secs) {
        return Some(Duration::from_secs(peer_timeout_secs.saturating_sub(1).max(1)));
    }
    if existing_secs > 0 {
        return Some(Duration::from_secs(existing_secs));
    }
    None
}

/// Scoped seteuid: switches to the target user when (and only when)
/// we are root, restoring the prior euid on drop.
pub struct ScopedEuid {
    prior: Option<Uid>,
}

impl ScopedEuid {
    pub fn enter(uid: u32) -> anyhow::Result<Self> {
        let current = geteuid();
        if !current.is_root() || current.as_raw() == uid {
            return Ok(Self { prior: None });
        }
        seteuid(Uid::from_raw(uid)).with_context(|| format!("seteuid({uid})"))?;
        Ok(Self {
            prior: Some(current),
        })
    }
}

impl Drop for ScopedEuid {
    fn drop(&mut self) {
        if let Some(prior) = self.prior.take() {
            if let Err(err) = seteuid(prior) {
                tracing::error!("restoring euid {prior}: {err}");
            }
        }
    }
}

/// After the fan-out, a process that started privileged goes back to
/// root and becomes debuggable again: core dumps come back on and we
/// chdir to a root-owned directory they can land in.
pub fn restore_privileges(base_dir: &Path) {
    if !geteuid().is_root() {
        return;
    }
    #[cfg(target_os = "linux")]
    unsafe {
        libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0);
    }
    if let Err(err) = nix::unistd::chdir(base_dir) {
        tracing::error!("chdir({}) failed: {err}", base_dir.display());
    }
}

fn mailbox_name(rcpt: &Recipient, settings: &LmtpSettings) -> String {
    if rcpt.detail.is_empty() || !settings.lmtp_save_to_detail_mailbox {
        "INBOX".to_string()
    } else {
        format!("{}{}", rcpt.user.namespace_prefix, rcpt.detail)
    }
}

fn dest_addr(rcpt: &Recipient, settings: &LmtpSettings, message: &RawMessage) -> String {
    if let Some(orcpt) = valid_rfc822_orcpt(rcpt.orcpt.as_deref()) {
        return orcpt.to_string();
    }
    if !settings.lda_original_recipient_header.is_empty() {
        if let Some(addr) = message.header(&settings.lda_original_recipient_header) {
            return addr;
        }
    }
    rcpt.address.clone()
}

/// Deliver to every recipient in RCPT order, producing one reply
/// line each. Failures are per-recipient; the loop always finishes.
pub async fn deliver_local(
    store: &dyn MailStore,
    settings: &LmtpSettings,
    recipients: &[Recipient],
    mail_from: &str,
    peer_timeout_secs: u64,
    message: &RawMessage,
) -> Vec<String> {
    let was_root = geteuid().is_root();
    let lock_timeout = clamp_lock_timeout(settings.mail_max_lock_timeout, peer_timeout_secs);

    let mut replies = Vec::with_capacity(recipients.len());
    let mut first_saved: Option<SavedMail> = None;

    for rcpt in recipients {
        let guard = match rcpt.user.uid {
            Some(uid) => match ScopedEuid::enter(uid) {
                Ok(guard) => Some(guard),
                Err(err) => {
                    tracing::error!(
                        "{}: failed to become uid for {}: {err:#}",
                        rcpt.session_id,
                        rcpt.user.username
                    );
                    replies.push(format!(
                        "451 4.3.0 <{}> Temporary internal error",
                        rcpt.address
                    ));
                    continue;
                }
            },
            None => None,
        };

        let dest = dest_addr(rcpt, settings, message);
        let request = DeliveryRequest {
            user: &rcpt.user,
            mailbox: mailbox_name(rcpt, settings),
            envelope_sender: mail_from,
            dest_addr: &dest,
            final_dest_addr: &rcpt.address,
            session_id: &rcpt.session_id,
            lock_timeout,
            src_mail: first_saved.as_ref(),
            want_saved_handle: recipients.len() > 1 && first_saved.is_none(),
            message,
        };

        let outcome = store.deliver(request).await;
        drop(guard);

        replies.push(match outcome {
            DeliveryOutcome::Saved { saved } => {
                if let Some(saved) = saved {
                    first_saved = Some(saved);
                }
                format!("250 2.0.0 <{}> {} Saved", rcpt.address, rcpt.session_id)
            }
            DeliveryOutcome::TempFail(error) => {
                format!("451 4.2.0 <{}> {error}", rcpt.address)
            }
            DeliveryOutcome::OverQuota(error) => {
                let code = if settings.quota_full_tempfail {
                    "452 4.2.2"
                } else {
                    "552 5.2.2"
                };
                format!("{code} <{}> {error}", rcpt.address)
            }
            DeliveryOutcome::Internal(error) => {
                tracing::error!("{}: delivery failed: {error}", rcpt.session_id);
                format!("451 4.3.0 <{}> Temporary internal error", rcpt.address)
            }
        });
    }

    // the hard-link source outlives every delivery that might use it
    drop(first_saved);

    if was_root {
        restore_privileges(&settings.base_dir);
    }
    replies
}
