//! Data source descriptors and the per-process registry.
//! Add built-in sources in `sources.rs` so `DataSourceRegistry::builtin` picks them up.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::GatherContext;
use crate::config::Config;
use crate::error::{FetchError, Result, StatuslineError};
use crate::freshness::FreshnessCategory;
use crate::health::SessionHealth;

/// Coordination class of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Derived from the host input alone. Run synchronously, in order.
    Instant = 1,
    /// Per-session I/O. Run in parallel with per-source timeouts.
    Session = 2,
    /// Global and expensive. Shared through the global cache under single-flight.
    Global = 3,
}

impl Tier {
    pub fn default_timeout(self) -> Duration {
        match self {
            Tier::Instant => Duration::from_millis(50),
            Tier::Session => Duration::from_secs(2),
            Tier::Global => Duration::from_secs(35),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", *self as u8)
    }
}

pub type FetchFn<T> = Arc<dyn Fn(&GatherContext) -> std::result::Result<T, FetchError> + Send + Sync>;
pub type MergeFn<T> = Arc<dyn Fn(&mut SessionHealth, T) + Send + Sync>;

/// A typed data source: how to fetch a `T` and where it lands in the health record.
pub struct DataSourceDescriptor<T> {
    pub id: String,
    pub tier: Tier,
    pub freshness: FreshnessCategory,
    pub timeout: Duration,
    pub dependencies: Vec<String>,
    pub fetch: FetchFn<T>,
    pub merge: MergeFn<T>,
}

impl<T> DataSourceDescriptor<T> {
    /// Descriptor with the tier's default timeout and a freshness category named after `id`.
    pub fn new(
        id: impl Into<String>,
        tier: Tier,
        fetch: impl Fn(&GatherContext) -> std::result::Result<T, FetchError> + Send + Sync + 'static,
        merge: impl Fn(&mut SessionHealth, T) + Send + Sync + 'static,
    ) -> Self {
        let id = id.into();
        Self {
            freshness: FreshnessCategory::parse(&id),
            id,
            tier,
            timeout: tier.default_timeout(),
            dependencies: Vec::new(),
            fetch: Arc::new(fetch),
            merge: Arc::new(merge),
        }
    }

    pub fn with_freshness(mut self, category: FreshnessCategory) -> Self {
        self.freshness = category;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }
}

/// Type-erased view the broker works with. Values cross this boundary as JSON,
/// which is also their shape in the global cache.
pub trait DataSource: Send + Sync {
    fn id(&self) -> &str;
    fn tier(&self) -> Tier;
    fn freshness(&self) -> &FreshnessCategory;
    fn timeout(&self) -> Duration;
    fn dependencies(&self) -> &[String];
    fn fetch(&self, ctx: &GatherContext) -> std::result::Result<Value, FetchError>;
    /// Fails only when `value` does not decode as this source's type.
    fn merge(&self, target: &mut SessionHealth, value: Value) -> std::result::Result<(), FetchError>;
}

impl<T> DataSource for DataSourceDescriptor<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn freshness(&self) -> &FreshnessCategory {
        &self.freshness
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn fetch(&self, ctx: &GatherContext) -> std::result::Result<Value, FetchError> {
        let value = (self.fetch)(ctx)?;
        serde_json::to_value(value).map_err(|e| FetchError::Shape(e.to_string()))
    }

    fn merge(&self, target: &mut SessionHealth, value: Value) -> std::result::Result<(), FetchError> {
        let typed: T = serde_json::from_value(value).map_err(|e| FetchError::Shape(e.to_string()))?;
        (self.merge)(target, typed);
        Ok(())
    }
}

/// Sources known to this process, in registration order.
#[derive(Default)]
pub struct DataSourceRegistry {
    sources: Vec<Arc<dyn DataSource>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in source enabled by `config`.
    pub fn builtin(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        super::sources::register_builtin(&mut registry, config)?;
        Ok(registry)
    }

    pub fn register<T>(&mut self, descriptor: DataSourceDescriptor<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.register_source(Arc::new(descriptor))
    }

    /// Rejects duplicate ids and dependencies that cannot have run first:
    /// unknown ids, later tiers, and same-tier ids outside tier 1 (tiers 2
    /// and 3 run in parallel).
    pub fn register_source(&mut self, source: Arc<dyn DataSource>) -> Result<()> {
        let id = source.id();
        if self.get(id).is_some() {
            return Err(StatuslineError::Registry(format!("duplicate source id {:?}", id)));
        }
        for dep in source.dependencies() {
            let Some(existing) = self.get(dep) else {
                return Err(StatuslineError::Registry(format!(
                    "{:?} depends on unregistered source {:?}",
                    id, dep
                )));
            };
            let ordered = existing.tier() < source.tier()
                || (existing.tier() == Tier::Instant && source.tier() == Tier::Instant);
            if !ordered {
                return Err(StatuslineError::Registry(format!(
                    "{:?} ({}) cannot depend on {:?} ({})",
                    id,
                    source.tier(),
                    dep,
                    existing.tier()
                )));
            }
        }
        tracing::debug!(source = %id, tier = %source.tier(), "Registered data source");
        self.sources.push(source);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn DataSource>> {
        self.sources.iter().find(|s| s.id() == id)
    }

    pub fn get_by_tier(&self, tier: Tier) -> Vec<Arc<dyn DataSource>> {
        self.sources
            .iter()
            .filter(|s| s.tier() == tier)
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(id: &str, tier: Tier) -> DataSourceDescriptor<u32> {
        DataSourceDescriptor::new(id, tier, |_| Ok(1), |_, _| {})
    }

    #[test]
    fn test_register_and_lookup_by_tier() {
        let mut registry = DataSourceRegistry::new();
        registry.register(noop("a", Tier::Instant)).unwrap();
        registry.register(noop("b", Tier::Session)).unwrap();
        registry.register(noop("c", Tier::Session)).unwrap();

        let tier2: Vec<_> = registry
            .get_by_tier(Tier::Session)
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(tier2, vec!["b", "c"]);
        assert_eq!(registry.get("a").map(|s| s.tier()), Some(Tier::Instant));
        assert!(registry.get("zzz").is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = DataSourceRegistry::new();
        registry.register(noop("a", Tier::Instant)).unwrap();
        let err = registry.register(noop("a", Tier::Session)).unwrap_err();
        assert!(matches!(err, StatuslineError::Registry(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dependency_rules() {
        let mut registry = DataSourceRegistry::new();
        registry.register(noop("model", Tier::Instant)).unwrap();
        registry
            .register(noop("derived", Tier::Instant).depends_on("model"))
            .unwrap();
        registry
            .register(noop("git", Tier::Session).depends_on("model"))
            .unwrap();

        assert!(registry
            .register(noop("late", Tier::Instant).depends_on("git"))
            .is_err());
        assert!(registry
            .register(noop("peer", Tier::Session).depends_on("git"))
            .is_err());
        assert!(registry
            .register(noop("orphan", Tier::Global).depends_on("missing"))
            .is_err());
    }

    #[test]
    fn test_descriptor_defaults_from_id_and_tier() {
        let d = noop("billing", Tier::Global);
        assert_eq!(d.freshness, FreshnessCategory::Billing);
        assert_eq!(d.timeout, Tier::Global.default_timeout());

        let d = d.with_timeout(Duration::from_secs(1));
        assert_eq!(d.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_merge_rejects_wrong_shape() {
        let source = noop("a", Tier::Instant);
        let mut health = SessionHealth::new("s1");
        let err = DataSource::merge(&source, &mut health, Value::String("x".into())).unwrap_err();
        assert!(matches!(err, FetchError::Shape(_)));
    }
}
