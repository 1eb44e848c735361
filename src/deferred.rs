/*
 * Bound-thread queue of work that must run after the current window
 * procedure has returned. Every pump iteration drains it, so a task pushed
 * from inside a notification never runs nested inside that notification.
 * A panicking task is logged and skipped; the tasks behind it still run.
 */

use crate::action::{Action, panic_message};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

pub(crate) type LocalTask = Box<dyn FnOnce()>;

#[derive(Default)]
pub(crate) struct DeferredQueue {
    tasks: RefCell<VecDeque<LocalTask>>,
}

impl DeferredQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, task: impl FnOnce() + 'static) {
        self.tasks.borrow_mut().push_back(Box::new(task));
    }

    pub(crate) fn push_action(&self, action: Action) {
        self.push(move || {
            action.run();
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /*
     * Runs queued tasks until the queue is empty, including tasks queued by
     * the tasks themselves. The borrow is released before each task runs.
     */
    pub(crate) fn run_pending(&self) -> usize {
        let mut executed = 0;
        loop {
            let next = self.tasks.borrow_mut().pop_front();
            match next {
                Some(task) => {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                        log::error!(
                            "Toolkit: deferred task panicked: {}",
                            panic_message(payload.as_ref())
                        );
                    }
                    executed += 1;
                }
                None => return executed,
            }
        }
    }
}
