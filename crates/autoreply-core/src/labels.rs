use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::gmail::{Label, LabelVisibility};
use crate::mailbox::{Mailbox, MailboxError};

/// Resolves label names to ids, creating missing labels.
///
/// Resolution of one name is single-flight within the process: concurrent callers
/// wait for the first lookup instead of each issuing a create. Across processes the
/// 409 Gmail returns for a duplicate name is answered by re-listing.
pub struct LabelResolver {
    visibility: LabelVisibility,
    cache: Mutex<HashMap<String, String>>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for LabelResolver {
    fn default() -> Self {
        Self::new(LabelVisibility::SHOW)
    }
}

impl LabelResolver {
    pub fn new(visibility: LabelVisibility) -> Self {
        Self {
            visibility,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached(&self, name: &str) -> Option<String> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn invalidate(&self, name: &str) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Seed the cache from a label listing, e.g. the one logged at start-up.
    pub fn prime(&self, labels: &[Label]) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        for label in labels {
            cache.insert(label.name.clone(), label.id.clone());
        }
    }

    /// Find an existing label by name without creating it. Hits are cached; a miss
    /// is not, so a label created later is still found.
    pub async fn lookup<M>(&self, mailbox: &M, name: &str) -> Result<Option<String>, MailboxError>
    where
        M: Mailbox + ?Sized,
    {
        if let Some(id) = self.cached(name) {
            return Ok(Some(id));
        }

        let found = find_label(mailbox, name).await?;
        if let Some(id) = &found {
            debug!(label = name, label_id = %id, "found existing label");
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string(), id.clone());
        }
        Ok(found)
    }

    pub async fn resolve<M>(&self, mailbox: &M, name: &str) -> Result<String, MailboxError>
    where
        M: Mailbox + ?Sized,
    {
        if let Some(id) = self.cached(name) {
            return Ok(id);
        }

        let flight = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            inflight.entry(name.to_string()).or_default().clone()
        };
        let _guard = flight.lock().await;

        if let Some(id) = self.cached(name) {
            return Ok(id);
        }

        let id = match find_label(mailbox, name).await? {
            Some(id) => id,
            None => match mailbox.create_label(name, self.visibility).await {
                Ok(label) => {
                    info!(label = name, label_id = %label.id, "created label");
                    label.id
                }
                Err(MailboxError::Conflict) => {
                    debug!(label = name, "label created concurrently, re-listing");
                    find_label(mailbox, name)
                        .await?
                        .ok_or(MailboxError::Conflict)?
                }
                Err(err) => return Err(err),
            },
        };

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), id.clone());
        Ok(id)
    }

    /// Apply the named label to a message. If a cached id has gone stale (the label was
    /// deleted remotely) the name is resolved again and the apply retried once.
    pub async fn apply<M>(
        &self,
        mailbox: &M,
        message_id: &str,
        name: &str,
    ) -> Result<String, MailboxError>
    where
        M: Mailbox + ?Sized,
    {
        let was_cached = self.cached(name).is_some();
        let label_id = self.resolve(mailbox, name).await?;

        match mailbox
            .modify_message_labels(message_id, std::slice::from_ref(&label_id))
            .await
        {
            Ok(()) => Ok(label_id),
            Err(err) if was_cached && err.is_stale_reference() => {
                warn!(label = name, label_id = %label_id, error = %err, "cached label rejected, resolving again");
                self.invalidate(name);
                let label_id = self.resolve(mailbox, name).await?;
                mailbox
                    .modify_message_labels(message_id, std::slice::from_ref(&label_id))
                    .await?;
                Ok(label_id)
            }
            Err(err) => Err(err),
        }
    }
}

async fn find_label<M>(mailbox: &M, name: &str) -> Result<Option<String>, MailboxError>
where
    M: Mailbox + ?Sized,
{
    Ok(mailbox
        .list_labels()
        .await?
        .into_iter()
        .find(|label| label.name == name)
        .map(|label| label.id))
}
