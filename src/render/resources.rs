use std::{
    any::Any,
    sync::Arc,
};

use parking_lot::Mutex;

/// Anything the resource manager can hold.
pub trait Resource: Any + Send + Sync {
    fn name(&self) -> &str;
}

struct Entry {
    name: String,
    resource: Arc<dyn Any + Send + Sync>,
}

/// Owns registered resources and hands out shared handles.
///
/// Names need not be unique: every `add` registers a new resource and lookups
/// by name return the most recent one.
#[derive(Default)]
pub struct ResourceManager {
    entries: Mutex<Vec<Entry>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<R: Resource>(&self, resource: R) -> Arc<R> {
        let resource = Arc::new(resource);
        let name = resource.name().to_owned();
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.name == name) {
            log::debug!("resource `{name}` registered again");
        }
        entries.push(Entry {
            name,
            resource: resource.clone(),
        });
        resource
    }

    pub fn find<R: Resource>(&self, name: &str) -> Option<Arc<R>> {
        self.entries
            .lock()
            .iter()
            .rev()
            .filter(|e| e.name == name)
            .find_map(|e| Arc::clone(&e.resource).downcast::<R>().ok())
    }

    /// Resources of type `R` registered under `name`.
    pub fn count<R: Resource>(&self, name: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.name == name && e.resource.is::<R>())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every registered handle.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, u32);

    impl Resource for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    struct Other(&'static str);

    impl Resource for Other {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn duplicate_names_resolve_to_the_newest() {
        let manager = ResourceManager::new();
        let first = manager.add(Named("sky", 1));
        let second = manager.add(Named("sky", 2));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(manager.find::<Named>("sky").map(|r| r.1), Some(2));
        assert_eq!(manager.count::<Named>("sky"), 2);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn lookups_are_typed() {
        let manager = ResourceManager::new();
        manager.add(Named("lut", 7));
        manager.add(Other("lut"));
        assert_eq!(manager.find::<Named>("lut").map(|r| r.1), Some(7));
        assert!(manager.find::<Named>("missing").is_none());
        assert_eq!(manager.count::<Other>("lut"), 1);
    }

    #[test]
    fn handles_outlive_the_manager_entry() {
        let manager = ResourceManager::new();
        let handle = manager.add(Named("sky", 3));
        manager.clear();
        assert_eq!(Arc::strong_count(&handle), 1);
        assert!(manager.is_empty());
    }
}
