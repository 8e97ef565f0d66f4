//! Request id allocation and the pending-response table.

use crate::protocol::MessageId;
use std::collections::HashMap;

/// Maps outstanding request ids to whatever must run when the response
/// arrives.
///
/// Ids come from a counter that is never rewound, not even by [`clear`], so
/// a late response to a request from before a reset can never be mistaken
/// for a newer one.
///
/// [`clear`]: RequestCorrelator::clear
#[derive(Debug)]
pub struct RequestCorrelator<H> {
    next_id: i64,
    pending: HashMap<MessageId, H>,
}

impl<H> Default for RequestCorrelator<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> RequestCorrelator<H> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate a fresh id.
    pub fn next_id(&mut self) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        MessageId::Number(id)
    }

    /// Store the handler for `id`.
    pub fn insert(&mut self, id: MessageId, handler: H) {
        self.pending.insert(id, handler);
    }

    /// Remove the handler for a response that just arrived.
    pub fn take(&mut self, id: &MessageId) -> Option<H> {
        self.pending.remove(id)
    }

    /// Forget `id`; a later response for it will be dropped.
    pub fn cancel(&mut self, id: &MessageId) -> bool {
        self.pending.remove(id).is_some()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every outstanding handler, e.g. to fail them when the
    /// connection goes away.
    pub fn drain(&mut self) -> Vec<(MessageId, H)> {
        self.pending.drain().collect()
    }

    /// Discard all handlers without running them.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let mut correlator: RequestCorrelator<()> = RequestCorrelator::new();
        assert_eq!(correlator.next_id(), MessageId::Number(1));
        assert_eq!(correlator.next_id(), MessageId::Number(2));
        correlator.clear();
        assert_eq!(correlator.next_id(), MessageId::Number(3));
    }

    #[test]
    fn test_take_once() {
        let mut correlator = RequestCorrelator::new();
        let id = correlator.next_id();
        correlator.insert(id.clone(), "handler");
        assert!(correlator.contains(&id));
        assert_eq!(correlator.take(&id), Some("handler"));
        assert_eq!(correlator.take(&id), None);
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_cancel_drops_handler() {
        let mut correlator = RequestCorrelator::new();
        let id = correlator.next_id();
        correlator.insert(id.clone(), 1);
        assert!(correlator.cancel(&id));
        assert!(!correlator.cancel(&id));
        assert_eq!(correlator.take(&id), None);
    }

    #[test]
    fn test_unknown_string_id() {
        let mut correlator: RequestCorrelator<u8> = RequestCorrelator::new();
        assert_eq!(correlator.take(&MessageId::from("nope")), None);
    }

    #[test]
    fn test_drain_returns_everything() {
        let mut correlator = RequestCorrelator::new();
        for n in 0..3 {
            let id = correlator.next_id();
            correlator.insert(id, n);
        }
        let mut drained: Vec<_> = correlator.drain().into_iter().map(|(_, h)| h).collect();
        drained.sort();
        assert_eq!(drained, vec![0, 1, 2]);
        assert_eq!(correlator.len(), 0);
    }
}
