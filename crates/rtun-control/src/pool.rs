//! Round-robin pool of agent control channels for one bound port

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Control channels attached to a binder, selected round-robin.
///
/// Members keep insertion order. A single mutex guards the members and the
/// cursor together, so no caller ever sees a half-updated pool.
pub struct WsPool<C: ?Sized> {
    inner: Mutex<PoolInner<C>>,
}

struct PoolInner<C: ?Sized> {
    members: Vec<Arc<C>>,
    next_index: usize,
}

impl<C: ?Sized> WsPool<C> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                members: Vec::new(),
                next_index: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    /// Append a channel. Duplicates are kept.
    pub fn add(&self, channel: Arc<C>) {
        self.lock().members.push(channel);
    }

    /// Remove the first member identical to `channel`.
    ///
    /// Returns false (and leaves the pool untouched) if it is not a member.
    /// The cursor is kept where it is unless it now points past the end.
    pub fn remove(&self, channel: &Arc<C>) -> bool {
        let mut inner = self.lock();

        let Some(index) = inner.members.iter().position(|m| Arc::ptr_eq(m, channel)) else {
            return false;
        };
        inner.members.remove(index);

        if inner.next_index >= inner.members.len() {
            inner.next_index = 0;
        }
        true
    }

    /// Return the member under the cursor and advance it.
    ///
    /// With a single member the cursor never moves.
    ///
    /// # Panics
    ///
    /// Panics if the pool is empty. Use [`WsPool::try_next`] when the pool
    /// may be drained concurrently.
    pub fn next(&self) -> Arc<C> {
        match self.try_next() {
            Some(channel) => channel,
            None => panic!("WsPool::next called on an empty pool"),
        }
    }

    /// Like [`WsPool::next`], but returns `None` on an empty pool
    pub fn try_next(&self) -> Option<Arc<C>> {
        let mut inner = self.lock();

        let len = inner.members.len();
        let index = inner.next_index;
        let channel = inner.members.get(index).cloned()?;

        if len > 1 {
            inner.next_index = (index + 1) % len;
        }

        Some(channel)
    }

    #[cfg(test)]
    fn cursor(&self) -> usize {
        self.lock().next_index
    }
}

impl<C: ?Sized> Default for WsPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn channels(n: usize) -> Vec<Arc<usize>> {
        (0..n).map(Arc::new).collect()
    }

    #[test]
    fn test_new_pool_is_empty() {
        let pool: WsPool<usize> = WsPool::new();
        assert!(pool.is_empty());
        assert_eq!(pool.len(), 0);
        assert!(pool.try_next().is_none());
    }

    #[test]
    fn test_round_robin_in_insertion_order() {
        let pool = WsPool::new();
        let members = channels(3);
        for m in &members {
            pool.add(m.clone());
        }

        for _round in 0..3 {
            for expected in &members {
                assert!(Arc::ptr_eq(&pool.next(), expected));
            }
        }
    }

    #[test]
    fn test_single_member_cursor_never_moves() {
        let pool = WsPool::new();
        let only = Arc::new(7usize);
        pool.add(only.clone());

        for _ in 0..5 {
            assert!(Arc::ptr_eq(&pool.next(), &only));
            assert_eq!(pool.cursor(), 0);
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let pool = WsPool::new();
        let members = channels(2);
        pool.add(members[0].clone());
        pool.add(members[1].clone());

        assert!(pool.remove(&members[0]));
        assert!(!pool.remove(&members[0]));
        assert_eq!(pool.len(), 1);
        assert!(Arc::ptr_eq(&pool.next(), &members[1]));
    }

    #[test]
    fn test_remove_absent_leaves_pool_unchanged() {
        let pool = WsPool::new();
        let members = channels(2);
        pool.add(members[0].clone());

        // Equal value, different identity
        let lookalike = Arc::new(0usize);
        assert!(!pool.remove(&lookalike));
        assert!(!pool.remove(&members[1]));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_remove_only_first_duplicate() {
        let pool = WsPool::new();
        let member = Arc::new(1usize);
        pool.add(member.clone());
        pool.add(member.clone());

        assert!(pool.remove(&member));
        assert!(!pool.is_empty());
        assert!(pool.remove(&member));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_cursor_clamped_after_shrink() {
        let pool = WsPool::new();
        let members = channels(3);
        for m in &members {
            pool.add(m.clone());
        }

        pool.next();
        pool.next();
        assert_eq!(pool.cursor(), 2);

        pool.remove(&members[2]);
        assert!(Arc::ptr_eq(&pool.next(), &members[0]));
    }

    #[test]
    #[should_panic(expected = "empty pool")]
    fn test_next_on_empty_pool_panics() {
        let pool: WsPool<usize> = WsPool::new();
        pool.next();
    }

    #[test]
    fn test_concurrent_add_remove_next() {
        let pool = Arc::new(WsPool::new());
        let stable = Arc::new(usize::MAX);
        pool.add(stable.clone());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mine = Arc::new(t);
                    let mut seen = HashSet::new();
                    for _ in 0..500 {
                        pool.add(mine.clone());
                        seen.insert(*pool.next());
                        assert!(pool.remove(&mine));
                    }
                    seen
                })
            })
            .collect();

        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(value == usize::MAX || value < 8);
            }
        }

        assert_eq!(pool.len(), 1);
        assert!(Arc::ptr_eq(&pool.next(), &stable));
    }
}
