//! # Immutable Singly Linked List
//!
//! A persistent cons-list with structural sharing. Prepending is O(1) and never
//! touches the existing spine, so a list value can be published to other threads
//! and extended independently by each of them.
//!
//! The runtime uses it for registries that are swapped wholesale, such as the
//! callback and waiter lists of a pending promise.

use std::fmt;
use std::iter::FromIterator;
use std::sync::Arc;

struct Node<T> {
    value: T,
    next: Option<Arc<Node<T>>>,
}

/// An immutable, thread-safe cons list.
pub struct ImmutableList<T> {
    head: Option<Arc<Node<T>>>,
    len: usize,
}

impl<T> ImmutableList<T> {
    /// The empty list.
    pub const fn empty() -> Self {
        Self { head: None, len: 0 }
    }

    /// Returns a new list with `value` in front of `self`.
    pub fn cons(&self, value: T) -> Self {
        Self {
            head: Some(Arc::new(Node {
                value,
                next: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    pub fn head(&self) -> Option<&T> {
        self.head.as_ref().map(|node| &node.value)
    }

    /// Everything but the first element, or `None` for the empty list.
    pub fn tail(&self) -> Option<Self> {
        self.head.as_ref().map(|node| Self {
            head: node.next.clone(),
            len: self.len - 1,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head.as_deref(),
        }
    }
}

impl<T: Clone> ImmutableList<T> {
    /// Keeps the elements matching `predicate`, preserving their order.
    pub fn filter<P>(&self, mut predicate: P) -> Self
    where
        P: FnMut(&T) -> bool,
    {
        let kept: Vec<T> = self.iter().filter(|v| predicate(v)).cloned().collect();
        kept.into_iter().collect()
    }

    pub fn reverse(&self) -> Self {
        self.iter()
            .fold(Self::empty(), |acc, value| acc.cons(value.clone()))
    }
}

impl<T> Clone for ImmutableList<T> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            len: self.len,
        }
    }
}

impl<T> Default for ImmutableList<T> {
    fn default() -> Self {
        Self::empty()
    }
}

// Unlink uniquely owned nodes one by one; the derived drop would recurse once per node.
impl<T> Drop for ImmutableList<T> {
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// Builds a list whose iteration order matches the source iterator.
impl<T> FromIterator<T> for ImmutableList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let items: Vec<T> = iter.into_iter().collect();
        let mut list = Self::empty();
        for item in items.into_iter().rev() {
            list = list.cons(item);
        }
        list
    }
}

impl<T: fmt::Debug> fmt::Debug for ImmutableList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: PartialEq> PartialEq for ImmutableList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl<T: Eq> Eq for ImmutableList<T> {}

/// Borrowing iterator over an [`ImmutableList`].
pub struct Iter<'a, T> {
    next: Option<&'a Node<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.next.map(|node| {
            self.next = node.next.as_deref();
            &node.value
        })
    }
}

impl<'a, T> IntoIterator for &'a ImmutableList<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
