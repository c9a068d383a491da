//! Name -> constructor table for database backends.
//!
//! A [`Registry`] is filled in once at startup and then shared by reference;
//! holding it behind `&Registry` or `Arc<Registry>` makes it read-only for
//! the rest of the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::DbConfig;
use crate::db::Db;
use crate::error::{ConfigError, DbResult};

/// Builds a fresh, independent database instance.
pub trait DbCreator: Send + Sync {
    fn create(&self, config: &DbConfig) -> DbResult<Arc<dyn Db>>;
}

impl<F> DbCreator for F
where
    F: Fn(&DbConfig) -> DbResult<Arc<dyn Db>> + Send + Sync,
{
    fn create(&self, config: &DbConfig) -> DbResult<Arc<dyn Db>> {
        self(config)
    }
}

#[derive(Default)]
pub struct Registry {
    creators: BTreeMap<String, Box<dyn DbCreator>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a creator under `name`.
    ///
    /// # Panics
    /// If `name` is already registered. Two backends claiming one name is a
    /// build/configuration error, and the first registration is never
    /// overwritten.
    pub fn register(&mut self, name: impl Into<String>, creator: impl DbCreator + 'static) {
        let name = name.into();
        if self.creators.contains_key(&name) {
            panic!("duplicate register database {}", name);
        }
        tracing::debug!(backend = %name, "registered database backend");
        self.creators.insert(name, Box::new(creator));
    }

    /// Look up the creator for `name`; `None` if unknown.
    pub fn get(&self, name: &str) -> Option<&dyn DbCreator> {
        self.creators.get(name).map(|c| c.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.creators.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.creators.keys().map(String::as_str)
    }

    /// Resolve `name` and build an instance, reporting unknown names.
    pub fn create(&self, name: &str, config: &DbConfig) -> DbResult<Arc<dyn Db>> {
        let creator = self.get(name).ok_or_else(|| ConfigError::UnknownBackend {
            name: name.to_string(),
            known: self.names().map(str::to_string).collect(),
        })?;
        let db = creator.create(config)?;
        tracing::info!(backend = %name, capabilities = %db.capabilities(), "created database");
        Ok(db)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.creators.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use super::*;
    use crate::backends::memory::MemoryDb;
    use crate::error::DbError;

    fn memory(_: &DbConfig) -> DbResult<Arc<dyn Db>> {
        Ok(Arc::new(MemoryDb::new()))
    }

    struct Failing;

    impl DbCreator for Failing {
        fn create(&self, config: &DbConfig) -> DbResult<Arc<dyn Db>> {
            let _: u16 = config.parse_or("failing.port", 0)?;
            Err(DbError::backend("connection refused"))
        }
    }

    #[test]
    fn lookup_of_unknown_name_is_none() {
        let mut registry = Registry::new();
        registry.register("memory", memory);
        assert!(registry.get("memory").is_some());
        assert!(registry.get("mysql").is_none());
        assert!(!registry.contains("mysql"));
    }

    #[test]
    fn distinct_names_resolve_to_distinct_creators() {
        let mut registry = Registry::new();
        registry.register("memory", memory);
        registry.register("failing", Failing);

        let config = DbConfig::new();
        assert_eq!(registry.get("memory").unwrap().create(&config).unwrap().name(), "memory");
        assert!(registry.get("failing").unwrap().create(&config).is_err());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["failing", "memory"]);
    }

    #[test]
    #[should_panic(expected = "duplicate register database memory")]
    fn duplicate_registration_panics() {
        let mut registry = Registry::new();
        registry.register("memory", memory);
        registry.register("memory", memory);
    }

    #[test]
    fn duplicate_registration_keeps_first_creator() {
        let mut registry = Registry::new();
        registry.register("memory", memory);
        let res = catch_unwind(AssertUnwindSafe(|| registry.register("memory", Failing)));
        assert!(res.is_err());
        assert!(registry.get("memory").unwrap().create(&DbConfig::new()).is_ok());
    }

    #[test]
    fn create_reports_unknown_backend() {
        let mut registry = Registry::new();
        registry.register("memory", memory);
        match registry.create("mysql", &DbConfig::new()) {
            Err(DbError::Config(ConfigError::UnknownBackend { name, known })) => {
                assert_eq!(name, "mysql");
                assert_eq!(known, vec!["memory".to_string()]);
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("mysql should not resolve"),
        }
    }

    #[test]
    fn creator_errors_propagate() {
        let mut registry = Registry::new();
        registry.register("failing", Failing);
        let config = DbConfig::new().with("failing.port", "not-a-port");
        assert!(matches!(
            registry.create("failing", &config),
            Err(DbError::Config(ConfigError::InvalidParam { .. }))
        ));
    }
}
