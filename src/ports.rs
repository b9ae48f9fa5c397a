//! Port allocation
//!
//! Grounded on `original_source/src/hp_manager.cpp`'s port-selection block
//! in `create_new_instance`: a vacant stack of reclaimed port pairs is
//! drained first; once it runs dry the allocator falls back to a counter
//! seeded from the highest port pair ever handed out. The counter is only
//! refreshed from the Store when the previous allocation came off the
//! vacant stack, so a long run of counter-allocations doesn't re-query the
//! database on every call.

use crate::error::{AgentError, Result};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub peer_port: u16,
    pub user_port: u16,
}

/// In-memory port allocator state, owned by the `InstanceManager`.
pub struct PortAllocator {
    init_peer_port: u16,
    init_user_port: u16,
    vacant: Vec<PortPair>,
    last_assigned: PortPair,
    last_assign_from_vacant: bool,
}

impl PortAllocator {
    /// Build allocator state from what the Store currently knows: the
    /// vacant stack (destroyed instances' ports) and the high-water mark
    /// (every instance ever created).
    pub async fn load(store: &Store, init_peer_port: u16, init_user_port: u16) -> Result<Self> {
        let vacant = store
            .vacant_ports()
            .await?
            .into_iter()
            .map(|(peer_port, user_port)| PortPair {
                peer_port,
                user_port,
            })
            .collect();

        let (max_peer, max_user) = store.max_ports().await?;
        let last_assigned = if max_peer == 0 && max_user == 0 {
            PortPair {
                peer_port: init_peer_port - 1,
                user_port: init_user_port - 1,
            }
        } else {
            PortPair {
                peer_port: max_peer,
                user_port: max_user,
            }
        };

        Ok(Self {
            init_peer_port,
            init_user_port,
            vacant,
            last_assigned,
            last_assign_from_vacant: false,
        })
    }

    /// Allocate the next free port pair. Pops from the vacant stack first;
    /// otherwise refreshes the counter from the Store if the previous
    /// allocation came from the vacant stack, then increments by one.
    pub async fn allocate(&mut self, store: &Store) -> Result<PortPair> {
        if let Some(pair) = self.vacant.pop() {
            self.last_assign_from_vacant = true;
            return Ok(pair);
        }

        if self.last_assign_from_vacant {
            let (max_peer, max_user) = store.max_ports().await?;
            if max_peer != 0 || max_user != 0 {
                self.last_assigned = PortPair {
                    peer_port: max_peer,
                    user_port: max_user,
                };
            }
            self.last_assign_from_vacant = false;
        }

        let next_peer = self
            .last_assigned
            .peer_port
            .checked_add(1)
            .ok_or_else(|| AgentError::ResourceExhausted("peer port space exhausted".into()))?;
        let next_user = self
            .last_assigned
            .user_port
            .checked_add(1)
            .ok_or_else(|| AgentError::ResourceExhausted("user port space exhausted".into()))?;

        let pair = PortPair {
            peer_port: next_peer,
            user_port: next_user,
        };
        self.last_assigned = pair;
        Ok(pair)
    }

    /// Return a port pair to the vacant stack, e.g. after an instance is
    /// destroyed. A no-op if the pair is already on the stack, matching
    /// §4.B.4's "if not already present" rule (guards idempotent destroy
    /// from double-queuing the same pair).
    pub fn release(&mut self, pair: PortPair) {
        if !self.vacant.contains(&pair) {
            self.vacant.push(pair);
        }
    }

    #[cfg(test)]
    fn init_ports(&self) -> (u16, u16) {
        (self.init_peer_port, self.init_user_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_db_starts_from_configured_init_ports() {
        let store = Store::open_in_memory().unwrap();
        let mut alloc = PortAllocator::load(&store, 22861, 26201).await.unwrap();
        assert_eq!(alloc.init_ports(), (22861, 26201));

        let first = alloc.allocate(&store).await.unwrap();
        assert_eq!(first, PortPair { peer_port: 22861, user_port: 26201 });
    }

    #[tokio::test]
    async fn releases_are_reused_before_the_counter_advances() {
        let store = Store::open_in_memory().unwrap();
        let mut alloc = PortAllocator::load(&store, 22861, 26201).await.unwrap();

        let a = alloc.allocate(&store).await.unwrap();
        let b = alloc.allocate(&store).await.unwrap();
        assert_ne!(a, b);

        alloc.release(a);
        let reused = alloc.allocate(&store).await.unwrap();
        assert_eq!(reused, a);

        let next = alloc.allocate(&store).await.unwrap();
        assert_eq!(
            next,
            PortPair {
                peer_port: b.peer_port + 1,
                user_port: b.user_port + 1
            }
        );
    }
}
