//! Arena holding the parent/successor links of every attached driver.
//!
//! Drivers reference each other only by [`DriverId`]; the tree is the single
//! owner of the topology, so no driver ever holds a pointer to another.

use std::collections::HashMap;

use crate::activity::DriverId;
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Default)]
struct Links {
    previous: Option<DriverId>,
    successors: Vec<DriverId>,
    ordinal: usize,
}

/// Forest of driver stacks. The last root is the foreground stack.
#[derive(Debug, Default)]
pub struct ActivityTree {
    links: HashMap<DriverId, Links>,
    roots: Vec<DriverId>,
    next_id: u64,
}

impl ActivityTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next instance id. Ids are never reused.
    pub fn allocate_id(&mut self) -> DriverId {
        self.next_id += 1;
        DriverId::new(self.next_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, id: DriverId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn roots(&self) -> &[DriverId] {
        &self.roots
    }

    pub fn previous(&self, id: DriverId) -> Option<DriverId> {
        self.links.get(&id).and_then(|links| links.previous)
    }

    pub fn successors(&self, id: DriverId) -> &[DriverId] {
        self.links
            .get(&id)
            .map(|links| links.successors.as_slice())
            .unwrap_or(&[])
    }

    /// Depth from the stack root (roots are 0).
    pub fn ordinal(&self, id: DriverId) -> Option<usize> {
        self.links.get(&id).map(|links| links.ordinal)
    }

    /// Link `id` under `parent`, or as a new foreground root.
    pub fn attach(&mut self, id: DriverId, parent: Option<DriverId>) -> Result<usize> {
        if let Some(existing) = self.links.get(&id) {
            return Ok(existing.ordinal);
        }
        let ordinal = match parent {
            Some(parent_id) => {
                let parent_links = self
                    .links
                    .get_mut(&parent_id)
                    .ok_or(RuntimeError::UnknownDriver(parent_id))?;
                parent_links.successors.push(id);
                parent_links.ordinal + 1
            }
            None => {
                self.roots.push(id);
                0
            }
        };
        self.links.insert(
            id,
            Links {
                previous: parent,
                successors: Vec::new(),
                ordinal,
            },
        );
        Ok(ordinal)
    }

    /// Unlink a driver that has no successors left.
    pub fn detach(&mut self, id: DriverId) -> Result<()> {
        let links = self.links.get(&id).ok_or(RuntimeError::UnknownDriver(id))?;
        if !links.successors.is_empty() {
            return Err(RuntimeError::DriverHasSuccessors(id));
        }
        let previous = links.previous;
        self.links.remove(&id);
        match previous.and_then(|parent| self.links.get_mut(&parent)) {
            Some(parent_links) => parent_links.successors.retain(|child| *child != id),
            None => self.roots.retain(|root| *root != id),
        }
        Ok(())
    }

    /// Deepest driver reached from `id` by always following the last successor.
    pub fn top_of(&self, id: DriverId) -> DriverId {
        let mut current = id;
        // Bounded by the number of nodes; the forest is acyclic by construction.
        for _ in 0..=self.links.len() {
            match self.successors(current).last() {
                Some(next) => current = *next,
                None => break,
            }
        }
        current
    }

    /// Top of the foreground stack.
    pub fn top(&self) -> Option<DriverId> {
        self.roots.last().map(|root| self.top_of(*root))
    }

    /// Ancestors of `id` and `id` itself, root first.
    pub fn chain(&self, id: DriverId) -> Vec<DriverId> {
        let mut chain = Vec::new();
        let mut cursor = self.contains(id).then_some(id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.previous(current);
        }
        chain.reverse();
        chain
    }

    /// Re-locate a driver from a root-first ancestor chain recorded earlier.
    /// Fails if any link along the chain has since been broken.
    pub fn resolve_chain(&self, chain: &[DriverId]) -> Option<DriverId> {
        let (first, rest) = chain.split_first()?;
        if !self.roots.contains(first) {
            return None;
        }
        let mut current = *first;
        for next in rest {
            if !self.successors(current).contains(next) {
                return None;
            }
            current = *next;
        }
        Some(current)
    }

    pub fn is_ancestor_or_self(&self, ancestor: DriverId, id: DriverId) -> bool {
        let mut cursor = self.contains(id).then_some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.previous(current);
        }
        false
    }

    /// Depth-first, last-child-first order over the whole forest.
    pub fn below(&self) -> Vec<DriverId> {
        let mut order = Vec::with_capacity(self.links.len());
        let mut pending: Vec<DriverId> = self.roots.clone();
        while let Some(id) = pending.pop() {
            order.push(id);
            pending.extend(self.successors(id).iter().copied());
        }
        order
    }

    /// Drivers strictly above `id`, in the order they must be concluded.
    pub fn above(&self, id: DriverId) -> Vec<DriverId> {
        let mut order = Vec::new();
        let mut pending: Vec<DriverId> = self.successors(id).to_vec();
        while let Some(current) = pending.pop() {
            order.push(current);
            pending.extend(self.successors(current).iter().copied());
        }
        order.reverse();
        order
    }
}
