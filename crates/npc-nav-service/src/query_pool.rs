//! Pool of query scratch contexts
//!
//! A [`QueryContext`] holds the node pool and open list of one search and must
//! never be used by two callers at once. Request handlers check a context out
//! for the duration of one operation through a [`QueryGuard`], which hands it
//! back when dropped. When every pooled context is checked out a fresh one is
//! allocated, so callers never wait on each other for scratch memory.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use detour::{NavMesh, NavMeshQuery, QueryContext};

#[derive(Debug)]
pub struct QueryPool {
    nav_mesh: Arc<NavMesh>,
    contexts: Mutex<Vec<QueryContext>>,
    capacity: usize,
    max_nodes: usize,
}

impl QueryPool {
    /// Creates a pool holding up to `capacity` idle contexts of `max_nodes` nodes each
    pub fn new(nav_mesh: Arc<NavMesh>, capacity: usize, max_nodes: usize) -> Self {
        let contexts = (0..capacity).map(|_| QueryContext::new(max_nodes)).collect();
        Self {
            nav_mesh,
            contexts: Mutex::new(contexts),
            capacity,
            max_nodes,
        }
    }

    /// Checks out a query over the pool's mesh
    pub fn acquire(&self) -> QueryGuard<'_> {
        let context = self
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| {
                log::debug!("Query pool exhausted, allocating a context of {} nodes", self.max_nodes);
                QueryContext::new(self.max_nodes)
            });

        QueryGuard {
            pool: self,
            query: Some(NavMeshQuery::with_context(&self.nav_mesh, context)),
        }
    }

    /// Number of idle contexts
    pub fn available(&self) -> usize {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self, context: QueryContext) {
        let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        if contexts.len() < self.capacity {
            contexts.push(context);
        }
    }
}

/// A checked-out query; returns its context to the pool on drop
pub struct QueryGuard<'a> {
    pool: &'a QueryPool,
    query: Option<NavMeshQuery<'a>>,
}

impl<'a> Deref for QueryGuard<'a> {
    type Target = NavMeshQuery<'a>;

    fn deref(&self) -> &Self::Target {
        match &self.query {
            Some(query) => query,
            None => unreachable!("query is only taken on drop"),
        }
    }
}

impl<'a> DerefMut for QueryGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.query {
            Some(query) => query,
            None => unreachable!("query is only taken on drop"),
        }
    }
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        if let Some(query) = self.query.take() {
            self.pool.release(query.into_context());
        }
    }
}
