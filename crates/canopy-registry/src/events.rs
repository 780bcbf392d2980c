//! Typed synchronous publish/subscribe.
//!
//! Dispatch happens on the publishing thread, in subscription order. A
//! subscriber that panics is logged and skipped; the remaining subscribers
//! still receive the event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use canopy_common::rwlock_read_or_recover;
use canopy_common::rwlock_write_or_recover;
use canopy_core::AgentState;
use tracing::warn;

use crate::domain::PanelLocation;

type Subscriber<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventBus<E> {
    name: &'static str,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        rwlock_write_or_recover(&self.subscribers).push((id, Arc::new(subscriber)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = rwlock_write_or_recover(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        rwlock_read_or_recover(&self.subscribers).len()
    }

    /// Deliver `event` to every subscriber; returns how many returned
    /// normally. Subscribers may publish or subscribe re-entrantly.
    pub fn publish(&self, event: &E) -> usize {
        let snapshot: Vec<Subscriber<E>> = rwlock_read_or_recover(&self.subscribers)
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();

        let mut delivered = 0;
        for subscriber in snapshot {
            match std::panic::catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(bus = self.name, "Event subscriber panicked"),
            }
        }
        delivered
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Notifications about registry mutations.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    TerminalAdded {
        id: String,
    },
    /// `index` is the removed terminal's position among terminals sharing
    /// its location before removal; `remaining` lists those terminals after.
    TerminalRemoved {
        id: String,
        location: PanelLocation,
        index: usize,
        remaining: Vec<String>,
    },
    TerminalMoved {
        id: String,
        from: PanelLocation,
        to: PanelLocation,
        worktree_id: Option<String>,
    },
    AgentStateChanged {
        id: String,
        state: AgentState,
        previous: Option<AgentState>,
    },
    TabGroupChanged {
        group_id: String,
    },
}
