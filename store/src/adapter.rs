//! The adapter contract lets a larger system treat storage engines as interchangeable. The
//! system owns an [`AdapterRegistry`], the application registers whatever engines it wants at
//! startup, and everything else asks the registry for an engine by name.
//!
//! Nothing registers itself: if you want the tidepool engine available, call [`register`].

use ahash::AHashMap;
use crate::{
    engine::{Engine, ENGINE_NAME},
    error::{Error, Result},
};

/// The operations a storage engine exposes to the messaging system.
pub trait Adapter: Send + Sync {
    /// The name this adapter registers under
    fn name(&self) -> &str;

    /// Open the underlying storage using a YAML/JSON config string.
    fn open(&self, config: &str) -> Result<()>;

    /// Close the underlying storage, releasing everything it holds.
    fn close(&self) -> Result<()>;

    /// Whether `open()` has succeeded (and `close()` hasn't been called since). This doesn't
    /// check whether the storage is actually healthy.
    fn is_open(&self) -> bool;

    /// Append a message, generating an id for it.
    fn put(&self, contract: u32, topic: &[u8], payload: &[u8]) -> Result<()>;

    /// Append a message under an id the caller generated.
    fn put_with_id(&self, contract: u32, topic: &[u8], id: &[u8], payload: &[u8]) -> Result<()>;

    /// Fetch up to `limit` of the newest payloads for a topic, newest first.
    fn get(&self, contract: u32, topic: &[u8], limit: usize) -> Result<Vec<Vec<u8>>>;

    /// Delete a message by id. Missing messages are not an error.
    fn delete(&self, contract: u32, topic: &[u8], id: &[u8]) -> Result<()>;

    /// Generate a message id without storing anything.
    fn gen_id(&self, contract: u32, topic: &[u8], payload: &[u8]) -> Result<Vec<u8>>;
}

impl Adapter for Engine {
    fn name(&self) -> &str {
        Engine::name(self)
    }

    fn open(&self, config: &str) -> Result<()> {
        self.open_str(config)
    }

    fn close(&self) -> Result<()> {
        Engine::close(self)
    }

    fn is_open(&self) -> bool {
        Engine::is_open(self)
    }

    fn put(&self, contract: u32, topic: &[u8], payload: &[u8]) -> Result<()> {
        Engine::put(self, contract, topic, payload).map(|_| ())
    }

    fn put_with_id(&self, contract: u32, topic: &[u8], id: &[u8], payload: &[u8]) -> Result<()> {
        Engine::put_with_id(self, contract, topic, id, payload)
    }

    fn get(&self, contract: u32, topic: &[u8], limit: usize) -> Result<Vec<Vec<u8>>> {
        Engine::get(self, contract, topic, limit)
    }

    fn delete(&self, contract: u32, topic: &[u8], id: &[u8]) -> Result<()> {
        Engine::delete(self, contract, topic, id)
    }

    fn gen_id(&self, contract: u32, topic: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        Engine::gen_id(self, contract, topic, payload).map(Vec::from)
    }
}

/// Builds a fresh, closed adapter.
pub type AdapterFactory = Box<dyn Fn() -> Box<dyn Adapter> + Send + Sync>;

/// Maps adapter names to the factories that build them.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: AHashMap<String, AdapterFactory>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}

impl AdapterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a name. Names can only be registered once.
    pub fn register<N, F>(&mut self, name: N, factory: F) -> Result<()>
        where N: Into<String>,
              F: Fn() -> Box<dyn Adapter> + Send + Sync + 'static,
    {
        let name: String = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AdapterExists(name));
        }
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    /// Build a new adapter by name.
    pub fn create(&self, name: &str) -> Result<Box<dyn Adapter>> {
        self.factories.get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::AdapterNotFound(String::from(name)))
    }

    /// The names of every registered adapter, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names = self.factories.keys().map(|x| x.as_str()).collect::<Vec<_>>();
        names.sort();
        names
    }
}

/// Register the tidepool [`Engine`] with a registry.
pub fn register(registry: &mut AdapterRegistry) -> Result<()> {
    registry.register(ENGINE_NAME, || Box::new(Engine::new()) as Box<dyn Adapter>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_create() {
        let mut registry = AdapterRegistry::new();
        assert!(matches!(registry.create("tidepool"), Err(Error::AdapterNotFound(_))));
        register(&mut registry).unwrap();
        assert!(matches!(register(&mut registry), Err(Error::AdapterExists(_))));
        assert_eq!(registry.names(), vec!["tidepool"]);

        let adapter = registry.create("tidepool").unwrap();
        assert_eq!(adapter.name(), "tidepool");
        assert!(!adapter.is_open());
        // every create gets its own engine
        let other = registry.create("tidepool").unwrap();
        let dir = tempfile::tempdir().unwrap();
        adapter.open(&format!("{{\"dir\": {:?}}}", dir.path().join("one"))).unwrap();
        assert!(adapter.is_open());
        assert!(!other.is_open());
    }

    #[test]
    fn bad_config() {
        let adapter = Engine::new();
        assert!(matches!(Adapter::open(&adapter, "{not json"), Err(Error::ConfigParse(_))));
        assert!(!Adapter::is_open(&adapter));
    }
}
