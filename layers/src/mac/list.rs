//! Index Lists
//!
//! Allocation-free singly-linked lists over a fixed pool of indices. The
//! scheduler uses them to partition bounded pools (HARQ process ids, UEs)
//! into disjoint classes without touching the heap after creation.

use super::MacError;

/// Ordered set of indices into a fixed-capacity pool.
///
/// Insertion order is preserved, so the head is always the oldest member.
#[derive(Debug, Clone)]
pub struct IndexList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    /// Successor of every index, `None` for the tail and for non-members
    next: Vec<Option<usize>>,
}

impl IndexList {
    /// Create an empty list able to hold indices `0..capacity`
    pub fn new(capacity: usize) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            next: vec![None; capacity],
        }
    }

    /// Create a list already holding `0..capacity` in ascending order
    pub fn new_full(capacity: usize) -> Self {
        let mut list = Self::new(capacity);
        for idx in 0..capacity {
            list.push_tail(idx);
        }
        list
    }

    /// Pool size the list was created for
    pub fn capacity(&self) -> usize {
        self.next.len()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list has no members
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Oldest member, if any
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    /// Append `idx` at the tail.
    ///
    /// `idx` must be within the pool and not already a member of this list.
    pub fn push_tail(&mut self, idx: usize) {
        debug_assert!(idx < self.next.len(), "index {} outside pool of {}", idx, self.next.len());
        debug_assert!(!self.contains(idx), "index {} pushed twice", idx);

        self.next[idx] = None;
        match self.tail {
            Some(tail) => self.next[tail] = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// Remove and return the oldest member
    pub fn pop_head(&mut self) -> Result<usize, MacError> {
        let head = self.head.ok_or(MacError::EmptyList)?;
        self.head = self.next[head];
        self.next[head] = None;
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Ok(head)
    }

    /// Remove `idx` wherever it sits. Returns false if it was not a member.
    pub fn remove(&mut self, idx: usize) -> bool {
        if self.head == Some(idx) {
            return self.pop_head().is_ok();
        }

        let mut prev = match self.head {
            Some(head) => head,
            None => return false,
        };
        while let Some(cur) = self.next[prev] {
            if cur == idx {
                self.next[prev] = self.next[cur];
                self.next[cur] = None;
                if self.tail == Some(cur) {
                    self.tail = Some(prev);
                }
                self.len -= 1;
                return true;
            }
            prev = cur;
        }
        false
    }

    /// Whether `idx` is a member
    pub fn contains(&self, idx: usize) -> bool {
        self.iter().any(|member| member == idx)
    }

    /// Drop every member
    pub fn clear(&mut self) {
        self.head = None;
        self.tail = None;
        self.len = 0;
        self.next.iter_mut().for_each(|n| *n = None);
    }

    /// Members from oldest to newest
    pub fn iter(&self) -> IndexListIter<'_> {
        IndexListIter { list: self, cur: self.head }
    }
}

/// Iterator over the members of an [`IndexList`]
pub struct IndexListIter<'a> {
    list: &'a IndexList,
    cur: Option<usize>,
}

impl Iterator for IndexListIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let cur = self.cur?;
        self.cur = self.list.next[cur];
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_preserves_order() {
        let mut list = IndexList::new(8);
        list.push_tail(5);
        list.push_tail(2);
        list.push_tail(7);
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_head(), Ok(5));
        assert_eq!(list.pop_head(), Ok(2));
        assert_eq!(list.pop_head(), Ok(7));
        assert_eq!(list.pop_head(), Err(MacError::EmptyList));
        assert!(list.is_empty());
    }

    #[test]
    fn test_full_list() {
        let list = IndexList::new_full(4);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(list.capacity(), 4);
    }

    #[test]
    fn test_remove_middle_head_and_tail() {
        let mut list = IndexList::new_full(5);
        assert!(list.remove(2));
        assert!(list.remove(0));
        assert!(list.remove(4));
        assert!(!list.remove(4));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![1, 3]);

        // The tail moved back, so appending must still link correctly
        list.push_tail(4);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![1, 3, 4]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_membership_matches_pushed_minus_removed() {
        let mut list = IndexList::new(16);
        let mut expected = Vec::new();
        for idx in [3, 9, 1, 12, 7, 0] {
            list.push_tail(idx);
            expected.push(idx);
        }
        list.pop_head().unwrap();
        expected.remove(0);
        list.remove(12);
        expected.retain(|&i| i != 12);
        list.push_tail(3);
        expected.push(3);

        assert_eq!(list.iter().collect::<Vec<_>>(), expected);
        assert_eq!(list.len(), expected.len());
    }

    #[test]
    fn test_clear_then_reuse() {
        let mut list = IndexList::new_full(3);
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        list.push_tail(1);
        assert_eq!(list.pop_head(), Ok(1));
    }
}
