//! Individually reserved buffers, tracked by the IOVA range they occupy.

use crate::{Access, PageSet, Pages, PAGE_SIZE};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tracing::error;

/// A live fallback allocation.
pub(super) struct Node<P: Pages, O> {
    pub size: usize,
    pub pages: Arc<PageSet<P>>,
    pub owner: O,
    pub access: Access,
}

/// An ordered set of non-overlapping `[iova, iova + size)` intervals.
pub(super) struct Tree<P: Pages, O> {
    nodes: Mutex<BTreeMap<u64, Node<P, O>>>,
}

impl<P: Pages, O: Clone> Tree<P, O> {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of bytes a fallback buffer of `len` bytes occupies.
    ///
    /// Returns `None` if rounding up would overflow.
    pub fn size_for(len: usize) -> Option<usize> {
        len.checked_next_power_of_two()
            .map(|size| size.max(PAGE_SIZE))
    }

    /// Track `node` at `iova`.
    ///
    /// If the interval overlaps a tracked one, nothing is inserted and the node is handed back.
    pub fn insert(&self, iova: u64, node: Node<P, O>) -> Result<(), Node<P, O>> {
        let mut nodes = self.nodes.lock().unwrap();
        let end = iova + node.size as u64;
        let before = nodes
            .range(..=iova)
            .next_back()
            .filter(|(start, prev)| **start + prev.size as u64 > iova);
        let after = nodes.range(iova..end).next();
        if let Some((start, _)) = before.or(after) {
            error!(iova, size = node.size, conflict = *start, "fallback interval collision");
            return Err(node);
        }
        nodes.insert(iova, node);
        Ok(())
    }

    /// Find the interval containing `handle`, returning its start along with its contents.
    pub fn find(&self, handle: u64) -> Option<(u64, Arc<PageSet<P>>, O, Access)> {
        let nodes = self.nodes.lock().unwrap();
        let (start, node) = Self::containing(&nodes, handle)?;
        Some((start, node.pages.clone(), node.owner.clone(), node.access))
    }

    /// Stop tracking the interval containing `handle`.
    pub fn remove(&self, handle: u64) -> Option<(u64, Node<P, O>)> {
        let mut nodes = self.nodes.lock().unwrap();
        let (start, _) = Self::containing(&nodes, handle)?;
        nodes.remove(&start).map(|node| (start, node))
    }

    /// Stop tracking every interval.
    pub fn drain(&self) -> Vec<(u64, Node<P, O>)> {
        let mut nodes = self.nodes.lock().unwrap();
        std::mem::take(&mut *nodes).into_iter().collect()
    }

    fn containing(nodes: &BTreeMap<u64, Node<P, O>>, handle: u64) -> Option<(u64, &Node<P, O>)> {
        nodes
            .range(..=handle)
            .next_back()
            .filter(|(start, node)| handle < **start + node.size as u64)
            .map(|(start, node)| (*start, node))
    }

    /// Number of tracked intervals.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }
}
