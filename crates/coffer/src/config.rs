use super::{Error, ImportFn, ObserverFn, SchemaFn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// MigrationStep is one named, ordered transform of a record's data.
/// Steps run exactly once per record, in configured order, and become
/// durable with the first post-load save; a crash in between reruns the
/// step on the next load, so transforms must be idempotent in effect.
#[derive(Clone)]
pub struct MigrationStep {
    pub(crate) name: String,
    pub(crate) apply: Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>,
}

impl MigrationStep {
    pub fn new(
        name: impl Into<String>,
        apply: impl Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// StoreConfig is everything recognized at store creation.
#[derive(Clone)]
pub struct StoreConfig {
    pub(crate) name: String,
    pub(crate) template: Value,
    pub(crate) schema: Option<SchemaFn>,
    pub(crate) migrations: Vec<MigrationStep>,
    pub(crate) import_legacy: Option<ImportFn>,
    pub(crate) observers: Vec<ObserverFn>,
    pub(crate) disable_reference_protection: bool,
    pub(crate) max_doc_bytes: usize,
    pub(crate) lock_duration: Duration,
    pub(crate) lock_refresh_interval: Option<Duration>,
    pub(crate) autosave_interval: Duration,
    pub(crate) orphan_sweep_interval: Duration,
}

impl StoreConfig {
    /// A config with the given namespace prefix and template for
    /// freshly-created records, and default tunables.
    pub fn new(name: impl Into<String>, template: Value) -> Self {
        Self {
            name: name.into(),
            template,
            schema: None,
            migrations: Vec::new(),
            import_legacy: None,
            observers: Vec::new(),
            disable_reference_protection: false,
            max_doc_bytes: 3_900_000,
            lock_duration: Duration::from_secs(60),
            lock_refresh_interval: None,
            autosave_interval: Duration::from_secs(30),
            orphan_sweep_interval: Duration::from_secs(300),
        }
    }

    pub fn with_schema(
        mut self,
        schema: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    /// Append a migration step. Steps run in the order they are added.
    pub fn with_migration(mut self, step: MigrationStep) -> Self {
        self.migrations.push(step);
        self
    }

    pub fn with_import_legacy(
        mut self,
        import: impl Fn(&str) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        self.import_legacy = Some(Arc::new(import));
        self
    }

    /// Register a change observer. Repeatable.
    pub fn with_observer(mut self, observer: ObserverFn) -> Self {
        self.observers.push(observer);
        self
    }

    /// Skip the defensive deep copy handed to fast-path update
    /// transforms. With this set, a transform that returns `false` after
    /// mutating its argument leaves those mutations in the working copy:
    /// intended only for hosts whose transforms never abort. Fan-out
    /// snapshot immutability is unaffected.
    pub fn with_reference_protection_disabled(mut self) -> Self {
        self.disable_reference_protection = true;
        self
    }

    pub fn with_max_doc_bytes(mut self, max: usize) -> Self {
        self.max_doc_bytes = max;
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    /// Defaults to a third of the lock duration.
    pub fn with_lock_refresh_interval(mut self, interval: Duration) -> Self {
        self.lock_refresh_interval = Some(interval);
        self
    }

    pub fn with_autosave_interval(mut self, interval: Duration) -> Self {
        self.autosave_interval = interval;
        self
    }

    pub fn with_orphan_sweep_interval(mut self, interval: Duration) -> Self {
        self.orphan_sweep_interval = interval;
        self
    }

    pub(crate) fn refresh_interval(&self) -> Duration {
        self.lock_refresh_interval.unwrap_or(self.lock_duration / 3)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::InvalidConfig(
                "store name must be a non-empty prefix without '/'".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for step in &self.migrations {
            if !names.insert(step.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate migration step name {:?}",
                    step.name
                )));
            }
        }
        if self.max_doc_bytes < 4096 {
            return Err(Error::InvalidConfig(
                "maxDocBytes must be at least 4096".to_string(),
            ));
        }
        if self.refresh_interval() >= self.lock_duration {
            return Err(Error::InvalidConfig(
                "lock refresh interval must be shorter than the lock duration".to_string(),
            ));
        }
        Ok(())
    }

    // Document-id layout within the DocStore namespace.

    pub(crate) fn primary_id(&self, key: &str) -> String {
        format!("{}/{}", self.name, key)
    }

    pub(crate) fn shard_id(&self, key: &str, index: usize) -> String {
        format!("{}/{}/shard/{}", self.name, key, index)
    }

    pub(crate) fn orphan_queue_id(&self) -> String {
        format!("{}/orphans", self.name)
    }

    pub(crate) fn lease_key(&self, key: &str) -> String {
        format!("{}/{}", self.name, key)
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("name", &self.name)
            .field("migrations", &self.migrations)
            .field("max_doc_bytes", &self.max_doc_bytes)
            .field("lock_duration", &self.lock_duration)
            .field("autosave_interval", &self.autosave_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_migration_names_are_rejected() {
        let config = StoreConfig::new("players", json!({}))
            .with_migration(MigrationStep::new("one", Ok))
            .with_migration(MigrationStep::new("one", Ok));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn refresh_must_undercut_duration() {
        let config = StoreConfig::new("players", json!({}))
            .with_lock_duration(Duration::from_secs(10))
            .with_lock_refresh_interval(Duration::from_secs(10));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        assert!(StoreConfig::new("players", json!({})).validate().is_ok());
    }

    #[test]
    fn doc_id_layout() {
        let config = StoreConfig::new("players", json!({}));
        assert_eq!(config.primary_id("p7"), "players/p7");
        assert_eq!(config.shard_id("p7", 2), "players/p7/shard/2");
        assert_eq!(config.orphan_queue_id(), "players/orphans");
    }
}
