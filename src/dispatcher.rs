/*
 * Main-thread dispatcher. Other threads hand work to the bound thread by
 * sending or posting it to the coordination window, a hidden window whose
 * only job is to run actions inside its message handler. Both delivery modes
 * ride on the OS message queue, which provides per-sender FIFO ordering and
 * the blocking semantics of the synchronous case.
 *
 * `Dispatcher` is the cross-thread handle: it is `Send + Sync + Clone` and
 * carries the bound thread's identity, the current dispatcher instance (the
 * coordination window, present only while that window is alive), the
 * nested-loop termination request and the count of connected accessibility
 * clients.
 */

use crate::action::Action;
use crate::nested_loop::{LoopValue, NestedLoopState};
use crate::platform::Platform;
use crate::types::{WindowHandle, WindowMessage};

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, ThreadId};

struct DispatchState {
    bound_thread: ThreadId,
    platform: Arc<dyn Platform>,
    // The coordination window while it is alive. Posting happens under this lock.
    instance: Mutex<Option<WindowHandle>>,
    nested_loop: NestedLoopState,
    accessibility_clients: AtomicU32,
}

#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<DispatchState>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("bound_thread", &self.state.bound_thread)
            .field("instance", &*self.state.instance.lock())
            .finish()
    }
}

impl Dispatcher {
    /// Binds to the calling thread.
    pub(crate) fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            state: Arc::new(DispatchState {
                bound_thread: thread::current().id(),
                platform,
                instance: Mutex::new(None),
                nested_loop: NestedLoopState::default(),
                accessibility_clients: AtomicU32::new(0),
            }),
        }
    }

    pub fn bound_thread(&self) -> ThreadId {
        self.state.bound_thread
    }

    pub fn is_bound_thread(&self) -> bool {
        thread::current().id() == self.state.bound_thread
    }

    /// True while the coordination window exists.
    pub fn is_active(&self) -> bool {
        self.state.instance.lock().is_some()
    }

    pub fn coordination_window(&self) -> Option<WindowHandle> {
        *self.state.instance.lock()
    }

    pub(crate) fn nested_loop_state(&self) -> &NestedLoopState {
        &self.state.nested_loop
    }

    pub(crate) fn platform(&self) -> &Arc<dyn Platform> {
        &self.state.platform
    }

    /// Records a newly connected accessibility client. Returns the new count.
    pub fn increment_accessibility(&self) -> u32 {
        self.state.accessibility_clients.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Records a disconnected accessibility client. Returns the new count, which never drops below zero.
    pub fn decrement_accessibility(&self) -> u32 {
        let previous = self.state.accessibility_clients.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| count.checked_sub(1),
        );
        match previous {
            Ok(previous) => previous - 1,
            Err(_) => {
                log::warn!("Dispatcher: accessibility count already zero; decrement ignored.");
                0
            }
        }
    }

    pub fn accessibility_count(&self) -> u32 {
        self.state.accessibility_clients.load(Ordering::Acquire)
    }

    /*
     * Runs `work` on the bound thread and blocks until it has finished.
     * Returns `None` without running anything when no dispatcher instance
     * exists or the coordination window died before the work was delivered.
     * Called on the bound thread itself, the work runs inline.
     */
    pub fn submit_and_wait<R, F>(&self, work: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let Some(target) = self.coordination_window() else {
            log::debug!("Dispatcher: submit_and_wait with no active dispatcher; ignored.");
            return None;
        };

        if self.is_bound_thread() {
            return Some(work());
        }

        let (result_tx, result_rx) = mpsc::sync_channel(1);
        let action = Action::synchronous(move || {
            let _ = result_tx.send(work());
        });
        match self
            .state
            .platform
            .send_message(target, WindowMessage::RunAction(action))
        {
            Ok(_) => result_rx.try_recv().ok(),
            Err(undelivered) => {
                log::debug!(
                    "Dispatcher: coordination window {target:?} gone; {} released.",
                    undelivered.name()
                );
                None
            }
        }
    }

    /*
     * Queues `work` to run later on the bound thread. Never blocks and reports
     * nothing back. With no dispatcher instance the work is dropped at once.
     */
    pub fn submit_deferred<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let undelivered = self.post(WindowMessage::RunActionLater(Action::deferred(work)));
        if let Some(message) = undelivered {
            log::debug!(
                "Dispatcher: no active dispatcher; {} discarded.",
                message.name()
            );
        }
    }

    /*
     * Asks the innermost running nested loop to return `value`. A wake-up is
     * posted from every thread: a loop blocked on an empty queue notices the
     * request, and so does one whose native wait is itself running this call.
     */
    pub fn leave_nested_loop(&self, value: Option<LoopValue>) {
        self.state.nested_loop.request_leave(value);
        if let Some(message) = self.post(WindowMessage::Wake) {
            log::debug!("Dispatcher: no active dispatcher; {} not queued.", message.name());
        }
    }

    // Returns the message when it could not be queued. Dropped by the caller, outside the lock.
    fn post(&self, message: WindowMessage) -> Option<WindowMessage> {
        let instance = self.state.instance.lock();
        match *instance {
            Some(target) => self.state.platform.post_message(target, message).err(),
            None => Some(message),
        }
    }

    pub(crate) fn attach(&self, window: WindowHandle) {
        let mut instance = self.state.instance.lock();
        match *instance {
            Some(existing) => log::warn!(
                "Dispatcher: instance already set to {existing:?}; ignoring {window:?}."
            ),
            None => {
                *instance = Some(window);
                log::debug!("Dispatcher: instance set to {window:?}.");
            }
        }
    }

    pub(crate) fn detach(&self, window: WindowHandle) {
        let mut instance = self.state.instance.lock();
        if *instance == Some(window) {
            *instance = None;
            log::debug!("Dispatcher: instance {window:?} cleared.");
        }
    }

    pub(crate) fn detach_any(&self) {
        self.state.instance.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform_headless::HeadlessPlatform;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn inactive_dispatcher_ignores_synchronous_work() {
        let dispatcher = Dispatcher::new(Arc::new(HeadlessPlatform::new()));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let result = dispatcher.submit_and_wait(move || counter.fetch_add(1, Ordering::SeqCst));
        assert!(result.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn inactive_dispatcher_releases_deferred_work_immediately() {
        let dispatcher = Dispatcher::new(Arc::new(HeadlessPlatform::new()));
        let payload = Arc::new(());
        let captured = Arc::clone(&payload);
        dispatcher.submit_deferred(move || drop(captured));
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn instance_is_set_once_and_cleared_by_its_own_window() {
        let dispatcher = Dispatcher::new(Arc::new(HeadlessPlatform::new()));
        dispatcher.attach(WindowHandle(1));
        dispatcher.attach(WindowHandle(2));
        assert_eq!(dispatcher.coordination_window(), Some(WindowHandle(1)));
        dispatcher.detach(WindowHandle(2));
        assert!(dispatcher.is_active());
        dispatcher.detach(WindowHandle(1));
        assert!(!dispatcher.is_active());
    }

    #[test]
    fn bound_thread_is_the_constructing_thread() {
        let dispatcher = Dispatcher::new(Arc::new(HeadlessPlatform::new()));
        assert!(dispatcher.is_bound_thread());
        let remote = dispatcher.clone();
        let on_bound = thread::spawn(move || remote.is_bound_thread()).join().unwrap();
        assert!(!on_bound);
    }

    #[test]
    fn accessibility_count_is_shared_and_never_negative() {
        let dispatcher = Dispatcher::new(Arc::new(HeadlessPlatform::new()));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let remote = dispatcher.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        remote.increment_accessibility();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(dispatcher.accessibility_count(), 100);
        assert_eq!(dispatcher.decrement_accessibility(), 99);

        let fresh = Dispatcher::new(Arc::new(HeadlessPlatform::new()));
        assert_eq!(fresh.decrement_accessibility(), 0);
        assert_eq!(fresh.increment_accessibility(), 1);
    }

    #[test]
    fn leave_request_wakes_the_loop_from_the_bound_thread_too() {
        let platform = Arc::new(HeadlessPlatform::new());
        let dispatcher = Dispatcher::new(platform.clone());
        let class = platform
            .register_class(&crate::types::ClassDescriptor {
                name: "Wake".to_string(),
                cursor: Default::default(),
            })
            .unwrap();
        let window = platform
            .create_window(
                class,
                &crate::types::WindowParams {
                    parent: None,
                    bounds: Default::default(),
                    style: Default::default(),
                    name: "wake".to_string(),
                },
            )
            .unwrap();
        dispatcher.attach(window);

        dispatcher.leave_nested_loop(None);
        assert!(dispatcher.nested_loop_state().leave_requested());
        assert_eq!(platform.queued_message_count(), 1);
    }
}
