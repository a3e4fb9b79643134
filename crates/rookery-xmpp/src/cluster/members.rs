//! Cluster membership tracked through the KV store.
//!
//! Each instance announces itself under `i://<instance_id>`; every member
//! watches the prefix and fires `member_list_updated` on joins and leaves.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::kv::{KvEventType, KvStore};
use crate::hook::{names, HookContext, HookInfo, Hooks, MemberListInfo};
use crate::XmppError;

/// Key prefix of member announcements.
pub const MEMBER_KEY_PREFIX: &str = "i://";

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Membership view of one instance.
pub struct MemberList {
    instance_id: String,
    kv: Arc<dyn KvStore>,
    hooks: Arc<Hooks>,
    members: RwLock<HashSet<String>>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MemberList {
    /// Create a member list for `instance_id`.
    pub fn new(instance_id: impl Into<String>, kv: Arc<dyn KvStore>, hooks: Arc<Hooks>) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.into(),
            kv,
            hooks,
            members: RwLock::new(HashSet::new()),
            cancel: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
        })
    }

    /// Announce this instance and start watching peers.
    pub async fn start(self: &Arc<Self>) -> Result<(), XmppError> {
        self.kv
            .put(&member_key(&self.instance_id), self.instance_id.as_bytes().to_vec())
            .await?;
        self.resync().await?;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.watch_loop().await });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(instance_id = %self.instance_id, "Cluster member list started");
        Ok(())
    }

    /// Withdraw the announcement and stop watching.
    pub async fn stop(&self) -> Result<(), XmppError> {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Member list watch task failed");
            }
        }
        self.kv.del(&member_key(&self.instance_id)).await?;
        Ok(())
    }

    /// Known peer instances, excluding this one.
    pub fn peers(&self) -> Vec<String> {
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        let mut peers: Vec<_> = members
            .iter()
            .filter(|m| **m != self.instance_id)
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    async fn resync(&self) -> Result<(), XmppError> {
        let snapshot: HashSet<String> = self
            .kv
            .get_prefix(MEMBER_KEY_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(k, _)| k.strip_prefix(MEMBER_KEY_PREFIX).map(str::to_string))
            .collect();

        let update = {
            let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
            let registered: Vec<_> = snapshot.difference(&members).cloned().collect();
            let unregistered: Vec<_> = members.difference(&snapshot).cloned().collect();
            *members = snapshot;
            MemberListInfo {
                registered,
                unregistered,
            }
        };
        self.notify(update).await;
        Ok(())
    }

    async fn watch_loop(self: Arc<Self>) {
        let mut backoff = Duration::from_millis(100);
        loop {
            let mut events = match self.kv.watch(MEMBER_KEY_PREFIX, false).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "Member watch failed, retrying");
                    if self.sleep(&mut backoff).await {
                        return;
                    }
                    continue;
                }
            };
            if let Err(e) = self.resync().await {
                warn!(error = %e, "Member resync failed");
            }

            loop {
                let event = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    event = events.next() => event,
                };
                match event {
                    Some(Ok(event)) => {
                        backoff = Duration::from_millis(100);
                        let Some(member) = event.key.strip_prefix(MEMBER_KEY_PREFIX) else {
                            continue;
                        };
                        let update = {
                            let mut members =
                                self.members.write().unwrap_or_else(PoisonError::into_inner);
                            match event.kind {
                                KvEventType::Put if members.insert(member.to_string()) => {
                                    Some(MemberListInfo {
                                        registered: vec![member.to_string()],
                                        unregistered: vec![],
                                    })
                                }
                                KvEventType::Delete if members.remove(member) => {
                                    Some(MemberListInfo {
                                        registered: vec![],
                                        unregistered: vec![member.to_string()],
                                    })
                                }
                                _ => None,
                            }
                        };
                        if let Some(update) = update {
                            self.notify(update).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Member watch error, resynchronising");
                        break;
                    }
                    None => {
                        debug!("Member watch closed");
                        break;
                    }
                }
            }
            if self.sleep(&mut backoff).await {
                return;
            }
        }
    }

    /// Back off; returns true when cancelled.
    async fn sleep(&self, backoff: &mut Duration) -> bool {
        let delay = *backoff;
        *backoff = (*backoff * 2).min(MAX_BACKOFF);
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn notify(&self, mut update: MemberListInfo) {
        update.registered.retain(|m| *m != self.instance_id);
        update.unregistered.retain(|m| *m != self.instance_id);
        if update.registered.is_empty() && update.unregistered.is_empty() {
            return;
        }
        info!(
            registered = ?update.registered,
            unregistered = ?update.unregistered,
            "Cluster member list updated"
        );
        let mut ctx = HookContext::new(HookInfo::MemberList(update));
        if let Err(e) = self.hooks.run(names::MEMBER_LIST_UPDATED, &mut ctx).await {
            warn!(error = %e, "member_list_updated hook failed");
        }
    }
}

fn member_key(instance_id: &str) -> String {
    format!("{}{}", MEMBER_KEY_PREFIX, instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::kv::MemoryKv;
    use crate::hook::{hook_fn, HookOutcome};
    use std::sync::Mutex;

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_peers_join_and_leave() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let hooks = Arc::new(Hooks::new());
        let left = Arc::new(Mutex::new(Vec::new()));
        let sink = left.clone();
        hooks.add(
            names::MEMBER_LIST_UPDATED,
            hook_fn(move |ctx| {
                let sink = sink.clone();
                let unregistered = ctx
                    .member_list()
                    .map(|m| m.unregistered.clone())
                    .unwrap_or_default();
                Box::pin(async move {
                    sink.lock().unwrap().extend(unregistered);
                    Ok(HookOutcome::Continue)
                })
            }),
            0,
        );

        let a = MemberList::new("a", kv.clone(), hooks.clone());
        let b = MemberList::new("b", kv.clone(), Arc::new(Hooks::new()));
        a.start().await.unwrap();
        b.start().await.unwrap();

        wait_for(|| a.peers() == vec!["b".to_string()]).await;
        assert_eq!(b.peers(), vec!["a".to_string()]);

        b.stop().await.unwrap();
        wait_for(|| a.peers().is_empty()).await;
        assert_eq!(*left.lock().unwrap(), vec!["b".to_string()]);
        a.stop().await.unwrap();
    }
}
