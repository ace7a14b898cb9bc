//! Bookkeeping of the contexts and cards issued through the PC/SC interface.
//!
//! Two maps are kept: contexts to their cards, and cards back to their context. Each is behind
//! its own lock. Whenever both are needed, the context map is locked first.

use std::collections::HashMap;

use parking_lot::Mutex;

#[cfg(feature = "tracing")]
use tracing::{error, info};

/// A context handle, as established through `SCardEstablishContext`.
pub type ContextId = i32;

/// A card handle, as connected through `SCardConnect`.
pub type CardId = i32;

/// Maximum number of contexts alive at the same time.
pub const MAX_CONTEXTS: usize = 10;

/// Maximum number of cards connected within a single context.
pub const MAX_CARDS_PER_CONTEXT: usize = 10;

/// Thread-safe registry of contexts and their cards.
#[derive(Debug, Default)]
pub struct Registry {
    contexts: Mutex<HashMap<ContextId, Vec<CardId>>>,
    cards: Mutex<HashMap<CardId, ContextId>>,
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a context with no cards.
    /// Re-adding a known context replaces it, dropping the cards it had.
    pub fn add_context(&self, context: ContextId) -> bool {
        let mut contexts = self.contexts.lock();

        if contexts.len() >= MAX_CONTEXTS {
            error!(
                "Cannot add context {}: the limit of {} contexts is reached",
                context, MAX_CONTEXTS
            );
            return false;
        }

        if let Some(stale) = contexts.insert(context, Vec::new()) {
            let mut cards = self.cards.lock();
            for card in stale {
                cards.remove(&card);
            }
        }

        info!("Added context {}", context);
        true
    }

    /// Removes the context along with every card associated with it.
    pub fn remove_context(&self, context: ContextId) -> bool {
        let mut contexts = self.contexts.lock();
        let mut cards = self.cards.lock();

        match contexts.remove(&context) {
            Some(removed) => {
                for card in &removed {
                    cards.remove(card);
                }

                info!("Removed context {} and {} card(s)", context, removed.len());
                true
            }
            None => false,
        }
    }

    /// Associates the card with the context.
    /// A card that belonged to another context is moved.
    pub fn add_card(&self, card: CardId, context: ContextId) -> bool {
        let mut contexts = self.contexts.lock();

        // Checked on every call, usually with a handle that is expected to be gone: no logs.
        match contexts.get(&context) {
            Some(list) if list.contains(&card) => return true,
            Some(list) if list.len() >= MAX_CARDS_PER_CONTEXT => return false,
            Some(_) => {}
            None => return false,
        }

        let mut cards = self.cards.lock();

        if let Some(previous) = cards.insert(card, context) {
            if let Some(list) = contexts.get_mut(&previous) {
                list.retain(|c| *c != card);
            }
        }

        if let Some(list) = contexts.get_mut(&context) {
            list.push(card);
        }

        info!("Added card {} to context {}", card, context);
        true
    }

    /// Removes the card from its context.
    pub fn remove_card(&self, card: CardId) -> bool {
        let mut contexts = self.contexts.lock();
        let mut cards = self.cards.lock();

        match cards.remove(&card) {
            Some(context) => {
                if let Some(list) = contexts.get_mut(&context) {
                    list.retain(|c| *c != card);
                }

                info!("Removed card {} from context {}", card, context);
                true
            }
            None => false,
        }
    }

    pub fn context_is_valid(&self, context: ContextId) -> bool {
        self.contexts.lock().contains_key(&context)
    }

    pub fn card_is_valid(&self, card: CardId) -> bool {
        self.cards.lock().contains_key(&card)
    }

    /// The context the card belongs to, if the card is known.
    pub fn context_for_card(&self, card: CardId) -> Option<ContextId> {
        self.cards.lock().get(&card).copied()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_context_capacity() {
        let registry = Registry::new();

        for context in 0..MAX_CONTEXTS as ContextId {
            assert!(registry.add_context(100 + context));
        }

        assert!(!registry.add_context(200));
        assert!(!registry.context_is_valid(200));

        assert!(registry.remove_context(100));
        assert!(registry.add_context(200));
    }

    #[test]
    fn test_card_capacity() {
        let registry = Registry::new();
        assert!(registry.add_context(1));

        for card in 0..MAX_CARDS_PER_CONTEXT as CardId {
            assert!(registry.add_card(10 + card, 1));
        }

        assert!(!registry.add_card(99, 1));
        assert!(!registry.card_is_valid(99));
        assert_eq!(None, registry.context_for_card(99));
    }

    #[test]
    fn test_add_card_to_unknown_context() {
        let registry = Registry::new();

        assert!(!registry.add_card(1, 100));
        assert!(!registry.card_is_valid(1));
    }

    #[test]
    fn test_remove_context_cascades() {
        let registry = Registry::new();
        assert!(registry.add_context(100));
        assert!(registry.add_card(1, 100));
        assert!(registry.add_card(2, 100));
        assert_eq!(Some(100), registry.context_for_card(1));

        assert!(registry.remove_context(100));

        assert!(!registry.context_is_valid(100));
        assert!(!registry.card_is_valid(1));
        assert!(!registry.card_is_valid(2));
        assert_eq!(None, registry.context_for_card(1));
        assert!(!registry.remove_context(100));
    }

    #[test]
    fn test_remove_card_twice() {
        let registry = Registry::new();
        assert!(registry.add_context(7));
        assert!(registry.add_card(3, 7));

        assert!(registry.remove_card(3));
        assert!(!registry.remove_card(3));
        assert!(registry.context_is_valid(7));
    }

    #[test]
    fn test_readd_context_drops_cards() {
        let registry = Registry::new();
        assert!(registry.add_context(5));
        assert!(registry.add_card(50, 5));

        assert!(registry.add_context(5));

        assert!(registry.context_is_valid(5));
        assert!(!registry.card_is_valid(50));
    }

    #[test]
    fn test_card_moves_between_contexts() {
        let registry = Registry::new();
        assert!(registry.add_context(1));
        assert!(registry.add_context(2));
        assert!(registry.add_card(9, 1));
        assert!(registry.add_card(9, 1));

        assert!(registry.add_card(9, 2));
        assert_eq!(Some(2), registry.context_for_card(9));

        // The card must be gone from the first context, so removing it leaves nothing behind.
        assert!(registry.remove_context(1));
        assert!(registry.card_is_valid(9));
        assert!(registry.remove_context(2));
        assert!(!registry.card_is_valid(9));
    }

    #[test]
    fn test_concurrent_access() {
        let registry = Arc::new(Registry::new());

        let handles = (0..MAX_CONTEXTS as ContextId)
            .map(|context| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    assert!(registry.add_context(context));
                    for card in 0..MAX_CARDS_PER_CONTEXT as CardId {
                        assert!(registry.add_card(context * 100 + card, context));
                    }
                    for card in 0..5 {
                        assert!(registry.remove_card(context * 100 + card));
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        for context in 0..MAX_CONTEXTS as ContextId {
            assert!(!registry.card_is_valid(context * 100));
            assert_eq!(Some(context), registry.context_for_card(context * 100 + 9));
            assert!(registry.remove_context(context));
            assert!(!registry.card_is_valid(context * 100 + 9));
        }
    }
}
