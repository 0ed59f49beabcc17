// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

/// Opaque identifier for a posted task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskId(u64);

pub type Task = Box<dyn FnOnce()>;

/// A single-threaded cooperative task queue. Work is posted as thunks and
/// dispatched one at a time by whoever owns the pump loop; tasks may post
/// further tasks while running. There is no threading involved, so a pending
/// task can be cancelled reliably up until the moment it is dispatched.
#[derive(Default)]
pub struct TaskQueue {
    inner: RefCell<Inner>,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<(TaskId, Task)>,
    next_id: u64,
}

impl TaskQueue {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Append a task to the queue and return an id usable with
    /// [`Self::cancel`].
    pub fn post(&self, task: Task) -> TaskId {
        let mut inner = self.inner.borrow_mut();
        let id = TaskId(inner.next_id);
        inner.next_id += 1;
        inner.queue.push_back((id, task));
        id
    }

    /// Drop a pending task. Returns false if the task already ran or was
    /// already cancelled.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let len = inner.queue.len();
        inner.queue.retain(|(task_id, _)| *task_id != id);
        inner.queue.len() != len
    }

    /// Dispatch the next pending task. Returns false if the queue was empty.
    pub fn run_one(&self) -> bool {
        // The borrow must end before the task runs so that the task can post.
        let entry = self.inner.borrow_mut().queue.pop_front();

        match entry {
            Some((_, task)) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Dispatch tasks until the queue drains, returning how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.run_one() {
            count += 1;
        }
        count
    }

    pub fn is_idle(&self) -> bool {
        self.inner.borrow().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::TaskQueue;

    #[test]
    fn tasks_run_in_post_order() {
        let queue = TaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let log = Rc::clone(&log);
            queue.post(Box::new(move || log.borrow_mut().push(i)));
        }

        assert_eq!(queue.run_until_idle(), 3);
        assert_eq!(*log.borrow(), [0, 1, 2]);
        assert!(queue.is_idle());
    }

    #[test]
    fn cancel_drops_pending_task() {
        let queue = TaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let log_a = Rc::clone(&log);
        queue.post(Box::new(move || log_a.borrow_mut().push("a")));
        let log_b = Rc::clone(&log);
        let id = queue.post(Box::new(move || log_b.borrow_mut().push("b")));

        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));

        assert_eq!(queue.run_until_idle(), 1);
        assert_eq!(*log.borrow(), ["a"]);
    }

    #[test]
    fn tasks_can_post_tasks() {
        let queue = TaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let inner_queue = Rc::clone(&queue);
            let inner_log = Rc::clone(&log);
            queue.post(Box::new(move || {
                inner_log.borrow_mut().push("outer");
                let log = Rc::clone(&inner_log);
                inner_queue.post(Box::new(move || log.borrow_mut().push("inner")));
            }));
        }

        assert!(queue.run_one());
        assert!(!queue.is_idle());
        assert!(queue.run_one());
        assert_eq!(*log.borrow(), ["outer", "inner"]);
    }
}
