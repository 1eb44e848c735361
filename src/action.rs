/*
 * A unit of work submitted to the bound thread together with its delivery
 * mode. The callable is consumed when it runs, so an `Action` executes at
 * most once; dropping an `Action` that never ran releases it without running
 * it, which is how undeliverable deferred work is discarded.
 *
 * A panic raised by the callable is contained in `run`: it is logged and the
 * action counts as finished, so the loop that ran it keeps going. A
 * synchronous submitter of such work sees no result.
 */

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

pub type Work = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The submitter blocks until the callable has finished on the bound thread.
    Synchronous,
    /// Fire-and-forget; the dispatch mechanism owns the action until it runs or is discarded.
    Deferred,
}

pub struct Action {
    work: Option<Work>,
    delivery: Delivery,
}

impl Action {
    pub fn synchronous(work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            work: Some(Box::new(work)),
            delivery: Delivery::Synchronous,
        }
    }

    pub fn deferred(work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            work: Some(Box::new(work)),
            delivery: Delivery::Deferred,
        }
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// Runs the callable on the calling thread. Returns false if it panicked.
    pub fn run(mut self) -> bool {
        let Some(work) = self.work.take() else {
            return true;
        };
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(()) => true,
            Err(payload) => {
                log::error!(
                    "Action: {:?} action panicked: {}",
                    self.delivery,
                    panic_message(payload.as_ref())
                );
                false
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "non-string panic payload"
    }
}

impl Drop for Action {
    fn drop(&mut self) {
        if self.work.is_some() {
            log::debug!(
                "Action: {:?} action released without running.",
                self.delivery
            );
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("delivery", &self.delivery)
            .field("pending", &self.work.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_executes_work_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let action = Action::deferred(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(action.delivery(), Delivery::Deferred);
        assert!(action.run());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_work_is_contained() {
        let payload = Arc::new(());
        let captured = Arc::clone(&payload);
        let action = Action::deferred(move || {
            let _held = captured;
            panic!("work failed");
        });
        assert!(!action.run());
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn panic_message_reads_both_payload_kinds() {
        let fixed: Box<dyn Any + Send> = Box::new("fixed");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(fixed.as_ref()), "fixed");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn dropping_unrun_action_releases_captures() {
        let payload = Arc::new(());
        let captured = Arc::clone(&payload);
        let action = Action::synchronous(move || drop(captured));
        assert_eq!(Arc::strong_count(&payload), 2);
        drop(action);
        assert_eq!(Arc::strong_count(&payload), 1);
    }
}
