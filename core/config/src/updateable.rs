use crate::{LogsConfig, ServerConfig, Settings};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Hot-swappable view of one settings struct. Readers pay one atomic load.
pub struct UpdateableSettings<T> {
    current: ArcSwap<T>,
}

impl<T> UpdateableSettings<T> {
    pub fn new(initial: T) -> UpdateableSettings<T> {
        UpdateableSettings { current: ArcSwap::from_pointee(initial) }
    }

    pub fn get(&self) -> Arc<T> {
        self.current.load_full()
    }

    pub fn update(&self, new: T) {
        self.current.store(Arc::new(new));
    }
}

impl<T: Default> Default for UpdateableSettings<T> {
    fn default() -> Self {
        UpdateableSettings::new(T::default())
    }
}

/// Handle returned by [`UpdateableConfig::subscribe_to_updates`]. Dropping
/// it unsubscribes.
pub struct ConfigSubscription {
    id: u64,
    subs: Arc<Mutex<Vec<(u64, Callback)>>>,
}

impl Drop for ConfigSubscription {
    fn drop(&mut self) {
        self.subs.lock().retain(|(id, _)| *id != self.id);
    }
}

/// The process-wide configuration root: server config, logs config and
/// runtime settings, each independently swappable. Subscribers are invoked
/// synchronously, in subscription order, after each update.
pub struct UpdateableConfig {
    server: ArcSwap<ServerConfig>,
    logs: ArcSwap<LogsConfig>,
    pub settings: UpdateableSettings<Settings>,
    subs: Arc<Mutex<Vec<(u64, Callback)>>>,
    next_sub_id: AtomicU64,
}

impl UpdateableConfig {
    pub fn new(server: ServerConfig, logs: LogsConfig, settings: Settings) -> UpdateableConfig {
        UpdateableConfig {
            server: ArcSwap::from_pointee(server),
            logs: ArcSwap::from_pointee(logs),
            settings: UpdateableSettings::new(settings),
            subs: Arc::new(Mutex::new(Vec::new())),
            next_sub_id: AtomicU64::new(1),
        }
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server.load_full()
    }

    pub fn logs_config(&self) -> Arc<LogsConfig> {
        self.logs.load_full()
    }

    pub fn update_server_config(&self, new: ServerConfig) {
        let old = self.server.load();
        if new.version <= old.version {
            tracing::warn!(
                target: "config",
                new_version = new.version,
                current_version = old.version,
                "ignoring config update with non-increasing version"
            );
            return;
        }
        tracing::info!(target: "config", version = new.version, "applying new server config");
        self.server.store(Arc::new(new));
        self.notify();
    }

    pub fn update_logs_config(&self, new: LogsConfig) {
        self.logs.store(Arc::new(new));
        self.notify();
    }

    pub fn subscribe_to_updates(&self, cb: impl Fn() + Send + Sync + 'static) -> ConfigSubscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().push((id, Arc::new(cb)));
        ConfigSubscription { id, subs: self.subs.clone() }
    }

    fn notify(&self) {
        // Snapshot under the lock, invoke outside it, so a callback may
        // subscribe or unsubscribe without deadlocking.
        let snapshot: Vec<Callback> =
            self.subs.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for cb in snapshot {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogAttributes;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> UpdateableConfig {
        let server = ServerConfig {
            cluster_name: "test".to_owned(),
            version: 1,
            nodes: Default::default(),
            metadata_nodes: vec![],
            sequencers_provision_epoch_store: true,
        };
        let logs = LogsConfig::new([(1, LogAttributes::test_default())].into_iter().collect());
        UpdateableConfig::new(server, logs, Settings::test())
    }

    #[test]
    fn stale_version_is_rejected() {
        let cfg = test_config();
        let mut stale = (*cfg.server_config()).clone();
        stale.version = 1;
        stale.cluster_name = "other".to_owned();
        cfg.update_server_config(stale);
        assert_eq!(cfg.server_config().cluster_name, "test");
    }

    #[test]
    fn subscribers_fire_and_unsubscribe() {
        let cfg = test_config();
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = {
            let hits = hits.clone();
            cfg.subscribe_to_updates(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
        };
        let mut new = (*cfg.server_config()).clone();
        new.version = 2;
        cfg.update_server_config(new);
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        drop(sub);
        let mut new = (*cfg.server_config()).clone();
        new.version = 3;
        cfg.update_server_config(new);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
