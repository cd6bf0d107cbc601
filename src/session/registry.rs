// Callback Registry - Subscribers multiplexed onto command keys
//
// Shared keys are reference-counted: the underlying subscription exists while
// at least one subscriber is registered. Lists keep insertion order, which is
// the order events are delivered in.

use crate::session::{Command, CommandKey, OperationKind, Subscriber, SubscriberId};
use crate::transport::{SubscriptionMode, TargetId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct CallbackRegistry {
    entries: HashMap<CommandKey, Vec<Subscriber>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the command's subscriber under its key.
    /// Returns the resulting subscriber count. A subscriber is never listed twice.
    pub fn add_command(&mut self, command: &Command) -> usize {
        self.add(command.key(), command.subscriber().clone())
    }

    /// Unregister the command's subscriber.
    /// An unsubscribe command removes from the subscription it targets.
    /// Returns the remaining count.
    pub fn remove_command(&mut self, command: &Command) -> usize {
        let key = command.key();
        let key = key.subscription_key().unwrap_or(key);
        self.remove(&key, &command.subscriber().id())
    }

    pub fn add(&mut self, key: CommandKey, subscriber: Subscriber) -> usize {
        let list = self.entries.entry(key).or_default();
        if !list.iter().any(|s| s.id() == subscriber.id()) {
            list.push(subscriber);
        }
        list.len()
    }

    pub fn remove(&mut self, key: &CommandKey, subscriber: &SubscriberId) -> usize {
        let Some(list) = self.entries.get_mut(key) else {
            return 0;
        };
        list.retain(|s| &s.id() != subscriber);
        let remaining = list.len();
        if remaining == 0 {
            self.entries.remove(key);
        }
        remaining
    }

    pub fn contains(&self, key: &CommandKey, subscriber: &SubscriberId) -> bool {
        self.entries
            .get(key)
            .is_some_and(|list| list.iter().any(|s| &s.id() == subscriber))
    }

    pub fn count(&self, key: &CommandKey) -> usize {
        self.entries.get(key).map_or(0, Vec::len)
    }

    pub fn subscribers(&self, key: &CommandKey) -> &[Subscriber] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Subscribers that should see a value pushed on `target`, across both modes
    pub fn push_targets(&self, target: &TargetId) -> Vec<Subscriber> {
        [SubscriptionMode::Notify, SubscriptionMode::Indicate]
            .into_iter()
            .flat_map(|mode| {
                self.subscribers(&CommandKey::shared(OperationKind::Subscribe(mode), *target))
                    .iter()
                    .cloned()
            })
            .collect()
    }

    /// Remove a key entirely, returning its subscribers
    pub fn take(&mut self, key: &CommandKey) -> Vec<Subscriber> {
        self.entries.remove(key).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
