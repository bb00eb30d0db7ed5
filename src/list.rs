//! Intrusive task lists.
//!
//! Every task control block carries three independent link pairs, one per
//! tag, so a task can sit in the all-tasks list, the timeout queue and a
//! waiting or ready list at the same time without any storage besides the
//! list heads. Which pair a [`TaskList`] threads through is selected by a
//! phantom tag type.
//!
//! All operations run while interrupts are masked up to the service call
//! priority, which is what makes the raw pointer plumbing sound.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr;

use crate::task::TaskControlBlock;
use crate::trap_assert;

/// One prev/next pair embedded in a task control block.
pub(crate) struct Link {
    prev: *mut TaskControlBlock,
    next: *mut TaskControlBlock,
    linked: bool,
}

impl Link {
    pub(crate) const fn new() -> Link {
        Link {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            linked: false,
        }
    }
}

/// Selects which of the three link pairs a list threads through.
pub(crate) trait ListTag {
    fn link(task: &TaskControlBlock) -> &UnsafeCell<Link>;
}

/// Tag for the all-tasks list.
pub(crate) struct Handle;

/// Tag for the timeout queue.
pub(crate) struct Timeout;

/// Tag for waiter lists and the ready queue. A task is never in more than
/// one of those at a time, so they share a pair.
pub(crate) struct Waiting;

impl ListTag for Handle {
    fn link(task: &TaskControlBlock) -> &UnsafeCell<Link> {
        &task.handle_link
    }
}

impl ListTag for Timeout {
    fn link(task: &TaskControlBlock) -> &UnsafeCell<Link> {
        &task.timeout_link
    }
}

impl ListTag for Waiting {
    fn link(task: &TaskControlBlock) -> &UnsafeCell<Link> {
        &task.waiting_link
    }
}

/// A doubly-linked list of task control blocks threaded through the link
/// pair selected by `T`.
pub(crate) struct TaskList<T: ListTag> {
    head: *mut TaskControlBlock,
    tail: *mut TaskControlBlock,
    _tag: PhantomData<T>,
}

impl<T: ListTag> TaskList<T> {
    pub(crate) const fn new() -> TaskList<T> {
        TaskList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            _tag: PhantomData,
        }
    }

    unsafe fn link_of(task: *mut TaskControlBlock) -> *mut Link {
        T::link(&*task).get()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn front(&self) -> *mut TaskControlBlock {
        self.head
    }

    /// Checks whether `task` is currently threaded on this tag's pair.
    pub(crate) unsafe fn is_linked(task: *mut TaskControlBlock) -> bool {
        (*Self::link_of(task)).linked
    }

    pub(crate) unsafe fn push_front(&mut self, task: *mut TaskControlBlock) {
        let link = Self::link_of(task);
        trap_assert!(!(*link).linked);
        (*link).prev = ptr::null_mut();
        (*link).next = self.head;
        (*link).linked = true;
        if self.head.is_null() {
            self.tail = task;
        } else {
            (*Self::link_of(self.head)).prev = task;
        }
        self.head = task;
    }

    pub(crate) unsafe fn push_back(&mut self, task: *mut TaskControlBlock) {
        let link = Self::link_of(task);
        trap_assert!(!(*link).linked);
        (*link).prev = self.tail;
        (*link).next = ptr::null_mut();
        (*link).linked = true;
        if self.tail.is_null() {
            self.head = task;
        } else {
            (*Self::link_of(self.tail)).next = task;
        }
        self.tail = task;
    }

    pub(crate) unsafe fn pop_front(&mut self) -> *mut TaskControlBlock {
        let task = self.head;
        if !task.is_null() {
            self.remove(task);
        }
        task
    }

    /// Inserts `task` before the first element for which `before(task,
    /// element)` holds, at the back when there is none. With a strict
    /// ordering comparator this keeps the list sorted and places new
    /// elements after their equals.
    pub(crate) unsafe fn insert_when(
        &mut self,
        before: fn(&TaskControlBlock, &TaskControlBlock) -> bool,
        task: *mut TaskControlBlock,
    ) {
        let mut cursor = self.head;
        while !cursor.is_null() {
            if before(&*task, &*cursor) {
                self.insert_before(cursor, task);
                return;
            }
            cursor = (*Self::link_of(cursor)).next;
        }
        self.push_back(task);
    }

    unsafe fn insert_before(&mut self, position: *mut TaskControlBlock, task: *mut TaskControlBlock) {
        let link = Self::link_of(task);
        trap_assert!(!(*link).linked);
        let pos_link = Self::link_of(position);
        let prev = (*pos_link).prev;
        (*link).prev = prev;
        (*link).next = position;
        (*link).linked = true;
        (*pos_link).prev = task;
        if prev.is_null() {
            self.head = task;
        } else {
            (*Self::link_of(prev)).next = task;
        }
    }

    pub(crate) unsafe fn remove(&mut self, task: *mut TaskControlBlock) {
        let link = Self::link_of(task);
        trap_assert!((*link).linked);
        let prev = (*link).prev;
        let next = (*link).next;
        if prev.is_null() {
            self.head = next;
        } else {
            (*Self::link_of(prev)).next = next;
        }
        if next.is_null() {
            self.tail = prev;
        } else {
            (*Self::link_of(next)).prev = prev;
        }
        (*link).prev = ptr::null_mut();
        (*link).next = ptr::null_mut();
        (*link).linked = false;
    }

    pub(crate) fn iter(&self) -> ListIter<T> {
        ListIter {
            cursor: self.head,
            _tag: PhantomData,
        }
    }
}

pub(crate) struct ListIter<T: ListTag> {
    cursor: *mut TaskControlBlock,
    _tag: PhantomData<T>,
}

impl<T: ListTag> Iterator for ListIter<T> {
    type Item = *mut TaskControlBlock;

    fn next(&mut self) -> Option<*mut TaskControlBlock> {
        if self.cursor.is_null() {
            None
        } else {
            let task = self.cursor;
            self.cursor = unsafe { (*TaskList::<T>::link_of(task)).next };
            Some(task)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use crate::time::{Duration, STARTUP};
    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec;

    fn leak_task(priority: Priority, started_tick: i32) -> *mut TaskControlBlock {
        let task = Box::leak(Box::new(TaskControlBlock::new()));
        task.priority.set(priority);
        task.last_started
            .set(STARTUP + Duration::from_ticks(started_tick));
        task
    }

    fn collect(list: &TaskList<Waiting>) -> Vec<*mut TaskControlBlock> {
        list.iter().collect()
    }

    #[test]
    fn push_and_pop() {
        let mut list: TaskList<Waiting> = TaskList::new();
        assert!(list.is_empty());
        let a = leak_task(Priority::NORMAL, 0);
        let b = leak_task(Priority::NORMAL, 1);
        unsafe {
            list.push_front(a);
            list.push_back(b);
            assert_eq!(collect(&list), vec![a, b]);
            assert_eq!(list.pop_front(), a);
            assert_eq!(list.pop_front(), b);
            assert!(list.pop_front().is_null());
        }
        assert!(list.is_empty());
    }

    #[test]
    fn ordered_insert_sorts_by_priority_then_age() {
        let mut list: TaskList<Waiting> = TaskList::new();
        let low = leak_task(Priority::LOW, 0);
        let high = leak_task(Priority::HIGH, 5);
        let normal_old = leak_task(Priority::NORMAL, 1);
        let normal_new = leak_task(Priority::NORMAL, 2);
        unsafe {
            list.insert_when(TaskControlBlock::priority_is_lower, low);
            list.insert_when(TaskControlBlock::priority_is_lower, normal_new);
            list.insert_when(TaskControlBlock::priority_is_lower, high);
            list.insert_when(TaskControlBlock::priority_is_lower, normal_old);
        }
        assert_eq!(collect(&list), vec![high, normal_old, normal_new, low]);
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let mut list: TaskList<Waiting> = TaskList::new();
        let first = leak_task(Priority::NORMAL, 7);
        let second = leak_task(Priority::NORMAL, 7);
        unsafe {
            list.insert_when(TaskControlBlock::priority_is_lower, first);
            list.insert_when(TaskControlBlock::priority_is_lower, second);
        }
        assert_eq!(collect(&list), vec![first, second]);
    }

    #[test]
    fn remove_from_middle() {
        let mut list: TaskList<Waiting> = TaskList::new();
        let a = leak_task(Priority::HIGH, 0);
        let b = leak_task(Priority::NORMAL, 0);
        let c = leak_task(Priority::LOW, 0);
        unsafe {
            list.push_back(a);
            list.push_back(b);
            list.push_back(c);
            assert!(TaskList::<Waiting>::is_linked(b));
            list.remove(b);
            assert!(!TaskList::<Waiting>::is_linked(b));
            assert_eq!(collect(&list), vec![a, c]);
            list.remove(c);
            list.remove(a);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn tags_are_independent() {
        let task = leak_task(Priority::NORMAL, 0);
        let mut waiting: TaskList<Waiting> = TaskList::new();
        let mut timeouts: TaskList<Timeout> = TaskList::new();
        let mut handles: TaskList<Handle> = TaskList::new();
        unsafe {
            waiting.push_back(task);
            timeouts.push_back(task);
            handles.push_front(task);
            assert_eq!(waiting.pop_front(), task);
            assert!(TaskList::<Timeout>::is_linked(task));
            assert!(TaskList::<Handle>::is_linked(task));
            timeouts.remove(task);
            handles.remove(task);
        }
    }
}
