use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::command::CommandDescriptor;

/// Name to descriptor map shared by every session.
#[derive(Default)]
pub struct Registry {
    commands: RwLock<HashMap<String, CommandDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; the last registration of a name wins.
    pub fn register(&self, descriptor: CommandDescriptor) {
        let mut commands = self
            .commands
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if commands.contains_key(&descriptor.name) {
            debug!(command = %descriptor.name, "replacing registered command");
        }
        commands.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<CommandDescriptor> {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshot of every descriptor, in no particular order.
    pub fn list(&self) -> Vec<CommandDescriptor> {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
