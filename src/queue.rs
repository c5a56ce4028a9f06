use crate::task::GcTask;
use std::fmt;
use std::ptr;

/// Unsynchronized doubly-linked list of [`GcTask`]s.
///
/// Tasks enter at the insert end and leave from the remove end, so dispatch
/// order is FIFO. The queue owns its tasks: `enqueue` takes the box apart and
/// threads the allocation into the list, `dequeue` reassembles it and hands
/// ownership to the caller. Splicing a whole queue onto another is O(1).
///
/// The list itself does no locking. The manager wraps it in its monitor; a
/// free-standing queue (a batch under construction) is reached through
/// `&mut` only.
pub struct TaskQueue {
    /// Youngest end; new tasks are attached here.
    insert_end: *mut GcTask,
    /// Oldest end; tasks are removed from here.
    remove_end: *mut GcTask,
    length: u32,
}

// Safety: the linkage pointers reference heap allocations owned by this
// queue, and all access goes through &mut self.
unsafe impl Send for TaskQueue {}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            insert_end: ptr::null_mut(),
            remove_end: ptr::null_mut(),
            length: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// Attach `task` at the insert end.
    pub fn enqueue(&mut self, task: Box<GcTask>) {
        assert!(!task.is_linked(), "task is already on a queue");
        let task = Box::into_raw(task);
        unsafe {
            (*task).older = self.insert_end;
            if self.is_empty() {
                self.remove_end = task;
            } else {
                (*self.insert_end).newer = task;
            }
        }
        self.insert_end = task;
        self.length += 1;
        self.verify_length();
    }

    /// Splice every task of `list` onto the insert end, preserving their
    /// relative order. `list` is left empty.
    pub fn enqueue_list(&mut self, list: &mut TaskQueue) {
        if list.is_empty() {
            return;
        }
        if self.is_empty() {
            self.insert_end = list.insert_end;
            self.remove_end = list.remove_end;
            self.length = list.length;
        } else {
            unsafe {
                (*list.remove_end).older = self.insert_end;
                (*self.insert_end).newer = list.remove_end;
            }
            self.insert_end = list.insert_end;
            self.length += list.length;
        }
        list.insert_end = ptr::null_mut();
        list.remove_end = ptr::null_mut();
        list.length = 0;
        self.verify_length();
    }

    /// Detach and return the oldest task, or `None` if the queue is empty.
    pub fn dequeue(&mut self) -> Option<Box<GcTask>> {
        if self.is_empty() {
            return None;
        }
        Some(self.remove_oldest())
    }

    /// Detach and return the oldest task whose affinity is `which`, scanning
    /// from the remove end but never across a barrier: a barrier fences the
    /// batch submitted before it, and honouring an affinity hint behind the
    /// fence would leak work past it. Falls back to a plain [`dequeue`] when
    /// the scan finds no match.
    ///
    /// [`dequeue`]: TaskQueue::dequeue
    pub fn dequeue_with_affinity(&mut self, which: u32) -> Option<Box<GcTask>> {
        if self.is_empty() {
            return None;
        }
        let mut element = self.remove_end;
        while !element.is_null() {
            unsafe {
                if (*element).is_barrier() {
                    break;
                }
                if (*element).affinity() == which {
                    return Some(self.unlink(element));
                }
                element = (*element).newer;
            }
        }
        Some(self.remove_oldest())
    }

    fn remove_oldest(&mut self) -> Box<GcTask> {
        let result = self.remove_end;
        unsafe {
            debug_assert!((*result).older.is_null(), "not the remove end");
            self.remove_end = (*result).newer;
            if self.remove_end.is_null() {
                debug_assert!(self.insert_end == result, "not a singleton");
                self.insert_end = ptr::null_mut();
            } else {
                (*self.remove_end).older = ptr::null_mut();
            }
            (*result).newer = ptr::null_mut();
            self.length -= 1;
            self.verify_length();
            Box::from_raw(result)
        }
    }

    /// Unlink `task` from anywhere in the list and take ownership back.
    ///
    /// Safety: `task` must be an element of this queue.
    unsafe fn unlink(&mut self, task: *mut GcTask) -> Box<GcTask> {
        unsafe {
            if (*task).newer.is_null() {
                debug_assert!(self.insert_end == task, "not the youngest");
                self.insert_end = (*task).older;
            } else {
                (*(*task).newer).older = (*task).older;
            }
            if (*task).older.is_null() {
                debug_assert!(self.remove_end == task, "not the oldest");
                self.remove_end = (*task).newer;
            } else {
                (*(*task).older).newer = (*task).newer;
            }
            (*task).newer = ptr::null_mut();
            (*task).older = ptr::null_mut();
            self.length -= 1;
            self.verify_length();
            Box::from_raw(task)
        }
    }

    /// Re-count the list and compare against the stored length.
    fn verify_length(&self) {
        #[cfg(debug_assertions)]
        {
            let mut count = 0;
            let mut element = self.insert_end;
            while !element.is_null() {
                count += 1;
                element = unsafe { (*element).older };
            }
            assert_eq!(count, self.length, "length does not match queue");
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
