//! Intrusive doubly linked list.
//!
//! Types that want to be part of a list embed their own `next` and `previous`
//! links and expose them through [`Linked`]. The list never allocates or frees
//! nodes, it only relinks existing ones. This matters for us because, as the
//! allocator, we can't allocate memory to keep track of memory: region records
//! live inside the very regions they describe.

use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to `T`.
pub type Link<T> = Option<NonNull<T>>;

/// A node that carries its own list links.
pub trait Linked: Sized {
    /// Pointer to the next node of the list.
    fn next(&self) -> Link<Self>;

    /// Pointer to the previous node of the list.
    fn previous(&self) -> Link<Self>;

    fn set_next(&mut self, next: Link<Self>);

    fn set_previous(&mut self, previous: Link<Self>);
}

/// Splices `node` out of the list it belongs to. The links of `node` itself are
/// left untouched, use [`unlink`] if the node is going to be reused.
///
/// # Safety
///
/// `node` and its neighbours must be valid for writes.
pub unsafe fn remove<N: Linked>(node: NonNull<N>) -> NonNull<N> {
    unsafe {
        let previous = node.as_ref().previous();
        let next = node.as_ref().next();

        if let Some(mut previous) = previous {
            previous.as_mut().set_next(next);
        }

        if let Some(mut next) = next {
            next.as_mut().set_previous(previous);
        }
    }

    node
}

/// Same as [`remove`], but also clears the links of `node`.
///
/// # Safety
///
/// See [`remove`].
pub unsafe fn unlink<N: Linked>(mut node: NonNull<N>) -> NonNull<N> {
    unsafe {
        remove(node);

        node.as_mut().set_next(None);
        node.as_mut().set_previous(None);
    }

    node
}

/// Inserts `node` right before `position`.
///
/// `node` is not removed from whatever list it is currently in.
///
/// # Safety
///
/// `node`, `position` and the node preceding `position` must be valid for writes.
pub unsafe fn insert_before<N: Linked>(mut node: NonNull<N>, mut position: NonNull<N>) -> NonNull<N> {
    unsafe {
        let previous = position.as_ref().previous();

        if let Some(mut previous) = previous {
            previous.as_mut().set_next(Some(node));
        }

        position.as_mut().set_previous(Some(node));

        node.as_mut().set_next(Some(position));
        node.as_mut().set_previous(previous);
    }

    node
}

/// Inserts `node` right after `position`.
///
/// `node` is not removed from whatever list it is currently in.
///
/// # Safety
///
/// `node`, `position` and the node following `position` must be valid for writes.
pub unsafe fn insert_after<N: Linked>(mut node: NonNull<N>, mut position: NonNull<N>) -> NonNull<N> {
    unsafe {
        let next = position.as_ref().next();

        if let Some(mut next) = next {
            next.as_mut().set_previous(Some(node));
        }

        position.as_mut().set_next(Some(node));

        node.as_mut().set_next(next);
        node.as_mut().set_previous(Some(position));
    }

    node
}

/// Head and tail of an intrusive list.
pub struct List<N: Linked> {
    head: Link<N>,
    tail: Link<N>,
    len: usize,
    marker: PhantomData<N>,
}

pub struct Iter<'a, N: Linked> {
    current: Link<N>,
    remaining: usize,
    marker: PhantomData<&'a N>,
}

impl<N: Linked> List<N> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<N> {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Link<N> {
        self.tail
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `node` at the end of the list.
    ///
    /// **SAFETY**: `node` must be valid for writes, not part of any list, and
    /// must stay valid until it is removed.
    pub unsafe fn push_back(&mut self, mut node: NonNull<N>) {
        unsafe {
            match self.tail {
                Some(tail) => {
                    insert_after(node, tail);
                }
                None => {
                    node.as_mut().set_next(None);
                    node.as_mut().set_previous(None);
                    self.head = Some(node);
                }
            }
        }

        self.tail = Some(node);
        self.len += 1;
    }

    /// Removes `node` from the list and clears its links.
    ///
    /// **SAFETY**: `node` must be part of this list.
    pub unsafe fn remove(&mut self, node: NonNull<N>) {
        unsafe {
            if self.head == Some(node) {
                self.head = node.as_ref().next();
            }

            if self.tail == Some(node) {
                self.tail = node.as_ref().previous();
            }

            unlink(node);
        }

        self.len -= 1;
    }

    pub fn iter(&self) -> Iter<'_, N> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<N: Linked> Default for List<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, N: Linked> Iterator for Iter<'a, N> {
    type Item = NonNull<N>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next();
        }
        self.remaining -= 1;

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, N: Linked> IntoIterator for &'a List<N> {
    type Item = NonNull<N>;
    type IntoIter = Iter<'a, N>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        value: u32,
        next: Link<Item>,
        previous: Link<Item>,
    }

    impl Item {
        fn new(value: u32) -> Self {
            Self { value, next: None, previous: None }
        }
    }

    impl Linked for Item {
        fn next(&self) -> Link<Self> {
            self.next
        }

        fn previous(&self) -> Link<Self> {
            self.previous
        }

        fn set_next(&mut self, next: Link<Self>) {
            self.next = next;
        }

        fn set_previous(&mut self, previous: Link<Self>) {
            self.previous = previous;
        }
    }

    fn values(list: &List<Item>) -> Vec<u32> {
        list.iter().map(|node| unsafe { node.as_ref().value }).collect()
    }

    #[test]
    fn new_list_is_empty() {
        let list: List<Item> = List::new();

        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert!(list.iter().next().is_none());
    }

    #[test]
    fn push_and_remove() {
        let mut items = [Item::new(1), Item::new(2), Item::new(3)];
        let [a, b, c] = items.each_mut().map(NonNull::from);
        let mut list = List::new();

        unsafe {
            list.push_back(a);
            list.push_back(b);
            list.push_back(c);
        }
        assert_eq!(vec![1, 2, 3], values(&list));
        assert_eq!(Some(a), list.first());
        assert_eq!(Some(c), list.last());

        unsafe { list.remove(b) };
        assert_eq!(vec![1, 3], values(&list));
        assert!(unsafe { b.as_ref().next().is_none() && b.as_ref().previous().is_none() });

        unsafe { list.remove(a) };
        assert_eq!(Some(c), list.first());

        unsafe { list.remove(c) };
        assert!(list.is_empty());
        assert!(list.first().is_none() && list.last().is_none());
    }

    #[test]
    fn insert_before_and_after() {
        let mut items = [Item::new(1), Item::new(2), Item::new(3), Item::new(4)];
        let [a, b, c, d] = items.each_mut().map(NonNull::from);

        unsafe {
            insert_after(c, a);
            insert_before(b, c);
            insert_after(d, c);

            assert_eq!(Some(b), a.as_ref().next());
            assert_eq!(Some(c), b.as_ref().next());
            assert_eq!(Some(d), c.as_ref().next());
            assert_eq!(Some(c), d.as_ref().previous());
            assert_eq!(Some(b), c.as_ref().previous());
            assert_eq!(Some(a), b.as_ref().previous());

            // `remove` leaves the links of the removed node alone.
            remove(b);
            assert_eq!(Some(c), a.as_ref().next());
            assert_eq!(Some(a), c.as_ref().previous());
            assert_eq!(Some(c), b.as_ref().next());

            unlink(c);
            assert_eq!(Some(d), a.as_ref().next());
            assert!(c.as_ref().next().is_none());
        }
    }
}
