use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::ManagedServer;
use crate::error::{RegistryError, Result};

type ServerMap = BTreeMap<String, Arc<ManagedServer>>;

/// Name-keyed set of managed servers.
///
/// Readers load an immutable snapshot and never block; writers serialize on a
/// mutex and publish a new snapshot. Iteration order is by name.
pub struct ServerRegistry {
    snapshot: ArcSwap<ServerMap>,
    write: Mutex<()>,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(BTreeMap::new()),
            write: Mutex::new(()),
        }
    }

    pub fn register(&self, server: Arc<ManagedServer>) -> Result<()> {
        self.update(|servers| {
            let name = server.name().to_string();
            if servers.contains_key(&name) {
                return Err(RegistryError::AlreadyRegistered(name));
            }
            servers.insert(name, server);
            Ok(())
        })
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.update(|servers| {
            servers
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
        })
    }

    pub fn get(&self, name: &str) -> Result<Arc<ManagedServer>> {
        self.snapshot
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()).into())
    }

    pub fn list(&self) -> Vec<Arc<ManagedServer>> {
        self.snapshot.load().values().cloned().collect()
    }

    pub fn list_by_capability(&self, capability: &str) -> Vec<Arc<ManagedServer>> {
        self.snapshot
            .load()
            .values()
            .filter(|s| s.has_capability(capability))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Applies `f` to a copy of the map and publishes it only on success.
    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ServerMap) -> std::result::Result<(), RegistryError>,
    {
        let _guard = self.write.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = self.snapshot.load().as_ref().clone();
        f(&mut next)?;
        self.snapshot.store(Arc::new(next));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::GatewayError;
    use crate::test_utils::MockTransport;

    fn server(name: &str, caps: &[&str]) -> Arc<ManagedServer> {
        let mut config = ServerConfig::stdio(name, "unused", vec![]);
        config.capabilities = caps.iter().map(|c| c.to_string()).collect();
        Arc::new(ManagedServer::with_transport(
            config,
            Arc::new(MockTransport::new(name)),
        ))
    }

    #[test]
    fn test_duplicate_register_keeps_first() {
        let registry = ServerRegistry::new();
        let first = server("alpha", &["tools"]);
        registry.register(first.clone()).unwrap();

        let err = registry.register(server("alpha", &["prompts"])).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Registry(RegistryError::AlreadyRegistered(ref n)) if n == "alpha"
        ));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("alpha").unwrap(), &first));
    }

    #[test]
    fn test_unregister_missing_fails_without_change() {
        let registry = ServerRegistry::new();
        registry.register(server("alpha", &[])).unwrap();

        let err = registry.unregister("beta").unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Registry(RegistryError::NotRegistered(_))
        ));
        assert_eq!(registry.len(), 1);

        registry.unregister("alpha").unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("alpha").unwrap_err(),
            GatewayError::Registry(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_is_a_detached_snapshot() {
        let registry = ServerRegistry::new();
        registry.register(server("alpha", &[])).unwrap();
        let listed = registry.list();
        registry.register(server("beta", &[])).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_list_by_capability_exact_match() {
        let registry = ServerRegistry::new();
        registry.register(server("both", &["tools", "resources"])).unwrap();
        registry.register(server("prompter", &["prompts"])).unwrap();

        let names = |cap: &str| -> Vec<String> {
            registry
                .list_by_capability(cap)
                .iter()
                .map(|s| s.name().to_string())
                .collect()
        };
        assert_eq!(names("tools"), vec!["both"]);
        assert_eq!(names("resources"), vec!["both"]);
        assert_eq!(names("prompts"), vec!["prompter"]);
        assert!(names("tool").is_empty());
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let registry = Arc::new(ServerRegistry::new());
        registry.register(server("seed", &["tools"])).unwrap();

        std::thread::scope(|scope| {
            for i in 0..4 {
                let registry = registry.clone();
                scope.spawn(move || {
                    let name = format!("writer-{i}");
                    registry.register(server(&name, &["tools"])).unwrap();
                    registry.unregister(&name).unwrap();
                });
            }
            for _ in 0..16 {
                let registry = registry.clone();
                scope.spawn(move || {
                    for _ in 0..100 {
                        let all = registry.list();
                        assert!(!all.is_empty());
                        assert!(registry.list_by_capability("tools").len() <= all.len() + 4);
                        assert!(registry.get("seed").is_ok());
                    }
                });
            }
        });
        assert_eq!(registry.len(), 1);
    }
}
