use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::command::CommandDescriptor;
use crate::registry::Registry;

/// A source of command descriptors, composed at startup.
pub trait CommandProvider: Send + Sync {
    fn provide_commands(&self) -> Vec<CommandDescriptor>;
}

/// Fixed list of descriptors, used for externally loaded commands.
pub struct StaticProvider {
    commands: Vec<CommandDescriptor>,
}

impl StaticProvider {
    pub fn new(commands: Vec<CommandDescriptor>) -> Self {
        Self { commands }
    }
}

impl CommandProvider for StaticProvider {
    fn provide_commands(&self) -> Vec<CommandDescriptor> {
        self.commands.clone()
    }
}

/// Ordered collection of providers that bulk-registers into a [`Registry`].
#[derive(Default)]
pub struct ProviderSet {
    providers: Mutex<Vec<Arc<dyn CommandProvider>>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&self, provider: Arc<dyn CommandProvider>) {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(provider);
    }

    /// Register every descriptor of every provider, in the order providers
    /// were added. Later providers override earlier ones on name clashes.
    pub fn register_all(&self, registry: &Registry) -> usize {
        let providers = self.providers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for provider in providers.iter() {
            for descriptor in provider.provide_commands() {
                registry.register(descriptor);
                count += 1;
            }
        }
        debug!(providers = providers.len(), commands = count, "registered providers");
        count
    }

    pub fn provider_count(&self) -> usize {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Tagged, descriptor, invoke};

    #[tokio::test]
    async fn later_provider_wins_on_clash() {
        let set = ProviderSet::new();
        set.add_provider(Arc::new(StaticProvider::new(vec![
            descriptor("shared", Tagged("first")),
            descriptor("only-first", Tagged("first")),
        ])));
        set.add_provider(Arc::new(StaticProvider::new(vec![descriptor(
            "shared",
            Tagged("second"),
        )])));

        let registry = Registry::new();
        assert_eq!(set.register_all(&registry), 3);
        assert_eq!(set.provider_count(), 2);
        assert_eq!(registry.len(), 2);

        let shared = registry.get("shared").expect("shared registered");
        assert_eq!(invoke(&shared).await, b"second");
    }

    #[test]
    fn empty_set_registers_nothing() {
        let set = ProviderSet::new();
        let registry = Registry::new();
        assert_eq!(set.register_all(&registry), 0);
        assert!(registry.is_empty());
    }
}
