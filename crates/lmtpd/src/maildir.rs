//! Filesystem-backed mail store: one maildir-style tree per user
//! below the configured mail root. Users come from the same static
//! table as the directory; anyone whose entry carries a `proxy`
//! field belongs to some other server and does not resolve here.

use crate::store::{
    DeliveryOutcome, DeliveryRequest, LookupContext, MailStore, QuotaStatus, SavedMail, StoreUser,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub struct MaildirStore {
    root: PathBuf,
    users: HashMap<String, HashMap<String, String>>,
}

impl MaildirStore {
    pub fn new(root: &Path, users: HashMap<String, HashMap<String, String>>) -> Self {
        Self {
            root: root.to_path_buf(),
            users,
        }
    }

    fn user_dir(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    fn mailbox_dir(&self, username: &str, mailbox: &str) -> PathBuf {
        self.user_dir(username).join(mailbox)
    }

    async fn used_bytes(&self, username: &str) -> std::io::Result<u64> {
        let mut total = 0;
        let mut pending = vec![self.user_dir(username)];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    async fn write_message(
        &self,
        request: &DeliveryRequest<'_>,
        mailbox_dir: &Path,
        dest: &Path,
    ) -> anyhow::Result<()> {
        let tmp_dir = mailbox_dir.join("tmp");
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let tmp = tmp_dir.join(format!("{}.{}", std::process::id(), request.session_id));

        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut reader = request.message.reader();
        if let Err(err) = tokio::io::copy(&mut reader, &mut file).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(err.into());
        }
        file.flush().await?;
        drop(file);

        if let Err(err) = tokio::fs::rename(&tmp, dest).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl MailStore for MaildirStore {
    async fn lookup_user(
        &self,
        username: &str,
        _ctx: &LookupContext,
    ) -> anyhow::Result<Option<StoreUser>> {
        let Some(fields) = self.users.get(username) else {
            return Ok(None);
        };
        if fields.contains_key("proxy") {
            // routed elsewhere; not a local store user
            return Ok(None);
        }
        let uid = match fields.get("uid") {
            Some(uid) => Some(
                uid.parse::<u32>()
                    .map_err(|_| anyhow::anyhow!("user {username}: bad uid {uid:?}"))?,
            ),
            None => None,
        };
        let quota_bytes = match fields.get("quota_bytes") {
            Some(quota) => Some(
                quota
                    .parse::<u64>()
                    .map_err(|_| anyhow::anyhow!("user {username}: bad quota_bytes {quota:?}"))?,
            ),
            None => None,
        };
        Ok(Some(StoreUser {
            username: username.to_string(),
            uid,
            namespace_prefix: fields
                .get("namespace_prefix")
                .cloned()
                .unwrap_or_default(),
            quota_bytes,
        }))
    }

    async fn quota_status(&self, user: &StoreUser) -> anyhow::Result<QuotaStatus> {
        let Some(quota) = user.quota_bytes else {
            return Ok(QuotaStatus::Ok);
        };
        let used = self.used_bytes(&user.username).await?;
        if used >= quota {
            Ok(QuotaStatus::Exceeded(
                "Quota exceeded (mailbox for user is full)".to_string(),
            ))
        } else {
            Ok(QuotaStatus::Ok)
        }
    }

    async fn deliver(&self, request: DeliveryRequest<'_>) -> DeliveryOutcome {
        match self.quota_status(request.user).await {
            Ok(QuotaStatus::Ok) => {}
            Ok(QuotaStatus::Exceeded(error)) => return DeliveryOutcome::OverQuota(error),
            Err(err) => return DeliveryOutcome::Internal(format!("{err:#}")),
        }

        let mailbox_dir = self.mailbox_dir(&request.user.username, &request.mailbox);
        let new_dir = mailbox_dir.join("new");
        if let Err(err) = tokio::fs::create_dir_all(&new_dir).await {
            return DeliveryOutcome::TempFail(format!("creating {}: {err}", new_dir.display()));
        }
        let dest = new_dir.join(format!("{}.eml", request.session_id));

        // A message we already saved for an earlier recipient can be
        // hard-linked instead of writing the bytes again.
        if let Some(saved) = request.src_mail {
            if let Some(src) = saved.0.downcast_ref::<PathBuf>() {
                match tokio::fs::hard_link(src, &dest).await {
                    Ok(()) => {
                        return DeliveryOutcome::Saved {
                            saved: request
                                .want_saved_handle
                                .then(|| SavedMail(Box::new(dest))),
                        };
                    }
                    Err(err) => {
                        tracing::debug!(
                            "hard_link {} -> {} failed, copying: {err}",
                            src.display(),
                            dest.display()
                        );
                    }
                }
            }
        }

        match self.write_message(&request, &mailbox_dir, &dest).await {
            Ok(()) => DeliveryOutcome::Saved {
                saved: request.want_saved_handle.then(|| SavedMail(Box::new(dest))),
            },
            Err(err) => DeliveryOutcome::TempFail(format!("{err:#}")),
        }
    }
}
