//! Cluster view of bound resources.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::kv::{KvEvent, KvEventType, KvStore};
use crate::hook::{names, weak_hook_fn, HandlerId, HookOutcome, Hooks};
use crate::resource::{parse_resource_key, resource_key, ResourceDesc, RESOURCE_KEY_PREFIX};
use crate::XmppError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// `username -> descriptors` of one instance.
type UserIndex = HashMap<String, Vec<ResourceDesc>>;

/// Per-instance mirrors of the `r://` prefix.
///
/// Local writes update the local mirror synchronously; watch events whose key
/// names this instance are ignored so a write never echoes back.
pub struct ResourceDirectory {
    instance_id: String,
    kv: Arc<dyn KvStore>,
    hooks: Arc<Hooks>,
    mirrors: RwLock<HashMap<String, UserIndex>>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    member_hook: std::sync::Mutex<Option<HandlerId>>,
}

impl ResourceDirectory {
    /// Create a directory for `instance_id`.
    pub fn new(instance_id: impl Into<String>, kv: Arc<dyn KvStore>, hooks: Arc<Hooks>) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.into(),
            kv,
            hooks,
            mirrors: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
            member_hook: std::sync::Mutex::new(None),
        })
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Hydrate from a snapshot and start consuming the change stream.
    pub async fn start(self: &Arc<Self>) -> Result<(), XmppError> {
        let events = self.kv.watch(RESOURCE_KEY_PREFIX, false).await?;
        self.resync().await?;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.watch_loop(Some(events)).await });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let id = self.hooks.add(
            names::MEMBER_LIST_UPDATED,
            weak_hook_fn(self, |dir, ctx| {
                Box::pin(async move {
                    if let Some(update) = ctx.member_list() {
                        dir.drop_instances(&update.unregistered);
                    }
                    Ok(HookOutcome::Continue)
                })
            }),
            0,
        );
        *self.member_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);

        info!(instance_id = %self.instance_id, "Resource directory started");
        Ok(())
    }

    /// Stop watching.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Resource directory watch task failed");
            }
        }
        let hook = self.member_hook.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(id) = hook {
            self.hooks.remove(names::MEMBER_LIST_UPDATED, id);
        }
    }

    /// Publish a local descriptor.
    #[instrument(skip(self, res), fields(jid = %res.jid()))]
    pub async fn put(&self, res: ResourceDesc) -> Result<(), XmppError> {
        let value = res.encode()?;
        let key = resource_key(res.username(), res.resource(), &self.instance_id);
        self.kv.put(&key, value).await?;

        let mut mirrors = self.mirrors.write().unwrap_or_else(PoisonError::into_inner);
        let index = mirrors.entry(self.instance_id.clone()).or_default();
        upsert(index, res);
        debug!("Resource published");
        Ok(())
    }

    /// Withdraw a local descriptor.
    #[instrument(skip(self))]
    pub async fn delete(&self, username: &str, resource: &str) -> Result<(), XmppError> {
        {
            let mut mirrors = self.mirrors.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(index) = mirrors.get_mut(&self.instance_id) {
                remove(index, username, resource);
            }
        }
        self.kv
            .del(&resource_key(username, resource, &self.instance_id))
            .await?;
        debug!("Resource withdrawn");
        Ok(())
    }

    /// Descriptor of `username/resource` on any instance.
    pub fn get(&self, username: &str, resource: &str) -> Option<ResourceDesc> {
        let mirrors = self.mirrors.read().unwrap_or_else(PoisonError::into_inner);
        mirrors
            .values()
            .filter_map(|index| index.get(username))
            .flatten()
            .find(|r| r.resource() == resource)
            .cloned()
    }

    /// Every descriptor of `username` across the cluster.
    pub fn get_all(&self, username: &str) -> Vec<ResourceDesc> {
        let mirrors = self.mirrors.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<ResourceDesc> = mirrors
            .values()
            .filter_map(|index| index.get(username))
            .flatten()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.resource().cmp(b.resource()));
        all
    }

    fn drop_instances(&self, instances: &[String]) {
        let mut mirrors = self.mirrors.write().unwrap_or_else(PoisonError::into_inner);
        for instance in instances {
            if *instance == self.instance_id {
                continue;
            }
            if mirrors.remove(instance).is_some() {
                info!(instance_id = %instance, "Dropped resources of departed instance");
            }
        }
    }

    /// Replace every remote mirror with a fresh snapshot.
    async fn resync(&self) -> Result<(), XmppError> {
        let pairs = self.kv.get_prefix(RESOURCE_KEY_PREFIX).await?;
        let mut fresh: HashMap<String, UserIndex> = HashMap::new();
        for (key, value) in pairs {
            let Some((_, _, instance)) = parse_resource_key(&key) else {
                warn!(key = %key, "Skipping malformed resource key");
                continue;
            };
            if instance == self.instance_id {
                continue;
            }
            match ResourceDesc::decode(&key, &value) {
                Ok(res) => upsert(fresh.entry(instance.to_string()).or_default(), res),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable resource"),
            }
        }

        let mut mirrors = self.mirrors.write().unwrap_or_else(PoisonError::into_inner);
        let local = mirrors.remove(&self.instance_id);
        *mirrors = fresh;
        if let Some(local) = local {
            mirrors.insert(self.instance_id.clone(), local);
        }
        Ok(())
    }

    fn apply(&self, event: KvEvent) {
        let Some((username, resource, instance)) = parse_resource_key(&event.key) else {
            return;
        };
        if instance == self.instance_id {
            return;
        }
        match event.kind {
            KvEventType::Put => {
                let Some(ref value) = event.value else {
                    return;
                };
                match ResourceDesc::decode(&event.key, value) {
                    Ok(res) => {
                        let mut mirrors =
                            self.mirrors.write().unwrap_or_else(PoisonError::into_inner);
                        upsert(mirrors.entry(instance.to_string()).or_default(), res);
                    }
                    Err(e) => warn!(key = %event.key, error = %e, "Ignoring undecodable resource"),
                }
            }
            KvEventType::Delete => {
                let mut mirrors = self.mirrors.write().unwrap_or_else(PoisonError::into_inner);
                if let Some(index) = mirrors.get_mut(instance) {
                    remove(index, username, resource);
                    if index.is_empty() {
                        mirrors.remove(instance);
                    }
                }
            }
        }
    }

    async fn watch_loop(self: Arc<Self>, mut initial: Option<crate::cluster::KvWatchStream>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let mut events = match initial.take() {
                Some(events) => events,
                None => {
                    let watched = self.kv.watch(RESOURCE_KEY_PREFIX, false).await;
                    let resynced = match watched {
                        Ok(events) => self.resync().await.map(|_| events),
                        Err(e) => Err(e.into()),
                    };
                    match resynced {
                        Ok(events) => events,
                        Err(e) => {
                            warn!(error = %e, ?backoff, "Resource watch failed, retrying");
                            if self.sleep(&mut backoff).await {
                                return;
                            }
                            continue;
                        }
                    }
                }
            };

            loop {
                let event = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    event = events.next() => event,
                };
                match event {
                    Some(Ok(event)) => {
                        backoff = INITIAL_BACKOFF;
                        self.apply(event);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Resource watch error, resynchronising");
                        break;
                    }
                    None => {
                        warn!("Resource watch closed, resynchronising");
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
}

impl std::fmt::Debug for ResourceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDirectory")
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

fn upsert(index: &mut UserIndex, res: ResourceDesc) {
    let list = index.entry(res.username().to_string()).or_default();
    match list.iter_mut().find(|r| r.resource() == res.resource()) {
        Some(slot) => *slot = res,
        None => list.push(res),
    }
}

fn remove(index: &mut UserIndex, username: &str, resource: &str) {
    if let Some(list) = index.get_mut(username) {
        list.retain(|r| r.resource() != resource);
        if list.is_empty() {
            index.remove(username);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::kv::MemoryKv;
    use crate::hook::{HookContext, HookInfo, MemberListInfo};
    use crate::resource::InfoMap;

    fn desc(instance: &str, jid: &str) -> ResourceDesc {
        ResourceDesc::new(instance, jid.parse().unwrap(), None, InfoMap::new())
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("directory did not converge");
    }

    async fn pair() -> (Arc<ResourceDirectory>, Arc<ResourceDirectory>, Arc<Hooks>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let hooks_a = Arc::new(Hooks::new());
        let a = ResourceDirectory::new("a", kv.clone(), hooks_a.clone());
        let b = ResourceDirectory::new("b", kv, Arc::new(Hooks::new()));
        a.start().await.unwrap();
        b.start().await.unwrap();
        (a, b, hooks_a)
    }

    #[tokio::test]
    async fn test_local_put_is_visible_immediately() {
        let (a, _b, _) = pair().await;
        a.put(desc("a", "ortuman@localhost/yard")).await.unwrap();

        let found = a.get("ortuman", "yard").unwrap();
        assert_eq!(found.instance_id(), "a");
        assert_eq!(a.get_all("ortuman").len(), 1);
    }

    #[tokio::test]
    async fn test_peers_converge_through_watch() {
        let (a, b, _) = pair().await;
        a.put(desc("a", "ortuman@localhost/yard")).await.unwrap();
        b.put(desc("b", "ortuman@localhost/balcony")).await.unwrap();

        eventually(|| a.get_all("ortuman").len() == 2 && b.get_all("ortuman").len() == 2).await;
        let resources: Vec<_> = a
            .get_all("ortuman")
            .iter()
            .map(|r| (r.resource().to_string(), r.instance_id().to_string()))
            .collect();
        assert_eq!(
            resources,
            vec![
                ("balcony".to_string(), "b".to_string()),
                ("yard".to_string(), "a".to_string())
            ]
        );

        b.delete("ortuman", "balcony").await.unwrap();
        assert!(b.get("ortuman", "balcony").is_none());
        eventually(|| a.get("ortuman", "balcony").is_none()).await;
    }

    #[tokio::test]
    async fn test_snapshot_hydrates_late_starter() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let a = ResourceDirectory::new("a", kv.clone(), Arc::new(Hooks::new()));
        a.start().await.unwrap();
        a.put(desc("a", "noelia@localhost/hall")).await.unwrap();

        let late = ResourceDirectory::new("late", kv, Arc::new(Hooks::new()));
        late.start().await.unwrap();
        assert!(late.get("noelia", "hall").is_some());
    }

    #[tokio::test]
    async fn test_departed_instance_is_dropped() {
        let (a, b, hooks_a) = pair().await;
        b.put(desc("b", "ortuman@localhost/balcony")).await.unwrap();
        eventually(|| a.get("ortuman", "balcony").is_some()).await;

        let mut ctx = HookContext::new(HookInfo::MemberList(MemberListInfo {
            registered: vec![],
            unregistered: vec!["b".to_string()],
        }));
        hooks_a.run(names::MEMBER_LIST_UPDATED, &mut ctx).await.unwrap();

        assert!(a.get_all("ortuman").is_empty());
    }

    #[tokio::test]
    async fn test_resync_after_lag() {
        let kv = MemoryKv::with_capacity(1);
        let shared: Arc<dyn KvStore> = Arc::new(kv.clone());
        let a = ResourceDirectory::new("a", shared.clone(), Arc::new(Hooks::new()));
        a.start().await.unwrap();

        for i in 0..10 {
            let jid = format!("user{}@localhost/r", i);
            kv.put(
                &resource_key(&format!("user{}", i), "r", "peer"),
                desc("peer", &jid).encode().unwrap(),
            )
            .await
            .unwrap();
        }

        eventually(|| (0..10).all(|i| a.get(&format!("user{}", i), "r").is_some())).await;
        a.stop().await;
    }

    #[tokio::test]
    async fn test_stop_survives_failed_watch_task() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let hooks = Arc::new(Hooks::new());
        let directory = ResourceDirectory::new("a", kv, hooks.clone());
        directory.start().await.unwrap();

        let crashed = tokio::spawn(async { panic!("watch task crashed") });
        let previous = directory.task.lock().unwrap().replace(crashed);
        previous.unwrap().abort();

        directory.stop().await;
        assert!(directory.task.lock().unwrap().is_none());
        assert_eq!(hooks.len(names::MEMBER_LIST_UPDATED), 0);
    }
}
