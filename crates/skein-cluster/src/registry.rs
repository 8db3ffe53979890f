//! Queue registry
//!
//! Owns every [`QueueContext`], indexed by canonical uri and by assigned
//! queue id. All access happens on the dispatcher; nothing here is shared
//! across threads.

use crate::context::QueueContext;
use crate::queue::{Queue, LOCAL_QUEUE_ID};
use crate::uri::QueueUri;
use skein_protocol::UNASSIGNED_QUEUE_ID;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Registry of all queues known to this node
#[derive(Default)]
pub struct QueueRegistry {
    queues: HashMap<QueueUri, QueueContext>,
    /// Id index; only remote queues with a real id are listed here
    by_id: HashMap<u32, QueueUri>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the context for `uri`, creating it if unknown. Idempotent.
    pub fn get_or_create(&mut self, uri: &QueueUri) -> &mut QueueContext {
        self.queues
            .entry(uri.clone())
            .or_insert_with(|| QueueContext::new(uri.clone()))
    }

    pub fn get(&self, uri: &QueueUri) -> Option<&QueueContext> {
        self.queues.get(uri)
    }

    pub fn get_mut(&mut self, uri: &QueueUri) -> Option<&mut QueueContext> {
        self.queues.get_mut(uri)
    }

    pub fn contains(&self, uri: &QueueUri) -> bool {
        self.queues.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Register `uri` under `id`. Ids 0 (strictly local) and unassigned are
    /// never indexed.
    pub fn register_id(&mut self, id: u32, uri: &QueueUri) {
        if id != LOCAL_QUEUE_ID && id != UNASSIGNED_QUEUE_ID {
            self.by_id.insert(id, uri.clone());
        }
    }

    pub fn unregister_id(&mut self, id: u32) {
        self.by_id.remove(&id);
    }

    /// Queue object for `id`, or `None` if unknown or not yet created
    pub fn lookup_by_id(&self, id: u32) -> Option<Arc<Queue>> {
        let uri = self.by_id.get(&id)?;
        self.queues.get(uri)?.live.queue.clone()
    }

    pub fn uri_by_id(&self, id: u32) -> Option<&QueueUri> {
        self.by_id.get(&id)
    }

    /// Remove the context for `uri` when nothing references it any more.
    /// Returns the context, or `None` when the deletion invariant does not
    /// hold (or the uri is unknown).
    pub fn remove(&mut self, uri: &QueueUri) -> Option<QueueContext> {
        if !self.queues.get(uri)?.can_delete() {
            return None;
        }
        self.remove_raw(uri)
    }

    /// Remove unconditionally, detaching both indexes. Callers must have
    /// established the deletion invariant themselves.
    pub fn remove_raw(&mut self, uri: &QueueUri) -> Option<QueueContext> {
        let context = self.queues.remove(uri)?;
        if context.live.id != UNASSIGNED_QUEUE_ID {
            self.by_id.remove(&context.live.id);
        }
        Some(context)
    }

    /// Snapshot of all uris; lets callers mutate contexts while iterating
    pub fn uris(&self) -> Vec<QueueUri> {
        self.queues.keys().cloned().collect()
    }

    pub fn for_each(&self, mut visitor: impl FnMut(&QueueContext)) {
        for context in self.queues.values() {
            visitor(context);
        }
    }

    /// Number of assigned queues per partition; used by the leader to place
    /// new queues on the least-loaded partition.
    pub fn count_for_partition(&self, partition_id: u32) -> usize {
        self.queues
            .values()
            .filter(|c| c.partition_id() == Some(partition_id))
            .count()
    }

    /// Whether any queue of `domain` still has clients
    pub fn has_active_queue(&self, domain: &str) -> bool {
        self.queues.values().any(|c| {
            c.uri().domain() == domain
                && (c.live.num_handles > 0
                    || c.live.in_flight_count() > 0
                    || !c.live.pending.is_empty())
        })
    }

    /// Uris of queues eligible for garbage collection at `now`: a created
    /// queue with no handles whose expiration deadline passed, or one marked
    /// by a previous non-immediate sweep.
    pub fn gc_eligible(&self, now: Instant, domain_filter: Option<&str>) -> Vec<QueueUri> {
        self.queues
            .values()
            .filter(|c| {
                if let Some(domain) = domain_filter {
                    if c.uri().domain() != domain {
                        return false;
                    }
                }
                if !c.can_delete() || c.live.queue.is_none() {
                    return false;
                }
                c.gc_marked
                    || c.live
                        .expiration_deadline
                        .is_some_and(|deadline| now >= deadline)
            })
            .map(|c| c.uri().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn uri(s: &str) -> QueueUri {
        QueueUri::parse(s).unwrap()
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut registry = QueueRegistry::new();
        let u = uri("skein://acme/orders");

        registry.get_or_create(&u).live.next_sub_queue_id = 42;
        assert_eq!(registry.get_or_create(&u).live.next_sub_queue_id, 42);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_id_index_skips_local_ids() {
        let mut registry = QueueRegistry::new();
        let u = uri("skein://acme/orders");
        registry.get_or_create(&u);

        registry.register_id(LOCAL_QUEUE_ID, &u);
        registry.register_id(UNASSIGNED_QUEUE_ID, &u);
        assert!(registry.lookup_by_id(LOCAL_QUEUE_ID).is_none());
        assert!(registry.lookup_by_id(UNASSIGNED_QUEUE_ID).is_none());

        registry.register_id(7, &u);
        // no queue object created yet
        assert!(registry.lookup_by_id(7).is_none());

        let queue = Arc::new(Queue::new_remote(u.clone(), 7, 3));
        registry.get_mut(&u).unwrap().live.queue = Some(queue);
        assert!(registry.lookup_by_id(7).is_some());
    }

    #[test]
    fn test_remove_honors_deletion_invariant() {
        let mut registry = QueueRegistry::new();
        let u = uri("skein://acme/orders");
        registry.get_or_create(&u).live.num_handles = 1;

        assert!(registry.remove(&u).is_none());
        assert!(registry.contains(&u));

        registry.get_mut(&u).unwrap().live.num_handles = 0;
        assert!(registry.remove(&u).is_some());
        assert!(!registry.contains(&u));
    }

    #[test]
    fn test_remove_detaches_id_index() {
        let mut registry = QueueRegistry::new();
        let u = uri("skein://acme/orders");
        {
            let context = registry.get_or_create(&u);
            context.live.id = 7;
            context.live.queue = Some(Arc::new(Queue::new_remote(u.clone(), 7, 3)));
        }
        registry.register_id(7, &u);
        assert!(registry.lookup_by_id(7).is_some());

        registry.remove(&u).unwrap();
        assert!(registry.lookup_by_id(7).is_none());
    }

    #[test]
    fn test_gc_eligibility() {
        let mut registry = QueueRegistry::new();
        let u = uri("skein://acme/orders");
        let now = Instant::now();

        // unknown queue object: not eligible
        registry.get_or_create(&u).live.expiration_deadline =
            Some(now - Duration::from_secs(1));
        assert!(registry.gc_eligible(now, None).is_empty());

        registry.get_mut(&u).unwrap().live.queue =
            Some(Arc::new(Queue::new_remote(u.clone(), 7, 3)));
        assert_eq!(registry.gc_eligible(now, None), vec![u.clone()]);

        // domain filter
        assert!(registry.gc_eligible(now, Some("other")).is_empty());
        assert_eq!(registry.gc_eligible(now, Some("acme")).len(), 1);

        // future deadline: not eligible unless marked
        registry.get_mut(&u).unwrap().live.expiration_deadline =
            Some(now + Duration::from_secs(60));
        assert!(registry.gc_eligible(now, None).is_empty());
        registry.get_mut(&u).unwrap().gc_marked = true;
        assert_eq!(registry.gc_eligible(now, None).len(), 1);
    }

    #[test]
    fn test_has_active_queue() {
        let mut registry = QueueRegistry::new();
        let u = uri("skein://acme/orders");
        registry.get_or_create(&u);
        assert!(!registry.has_active_queue("acme"));

        registry.get_mut(&u).unwrap().live.num_handles = 2;
        assert!(registry.has_active_queue("acme"));
        assert!(!registry.has_active_queue("other"));
    }
}
