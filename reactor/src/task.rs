//! Units of work executed on a reactor thread.

use crate::error::{Error, Result};
use crate::messenger::Messenger;
use crate::reactor::ReactorCore;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// A task posted to a reactor. For every task that was successfully enqueued,
/// exactly one of `run` (on the reactor thread) or `abort` (from any thread)
/// is invoked.
pub trait ReactorTask: Send + Sync {
    fn run(&self, core: &mut ReactorCore);
    fn abort(&self, status: Error);
}

pub type ReactorTaskPtr = Arc<dyn ReactorTask>;

/// One-shot closure task. Abort drops the closure, which releases anything it
/// captured (sockets, connections).
pub(crate) struct FunctorTask {
    func: Mutex<Option<Box<dyn FnOnce(&mut ReactorCore) + Send>>>,
}

impl FunctorTask {
    pub fn new(func: impl FnOnce(&mut ReactorCore) + Send + 'static) -> Arc<Self> {
        Arc::new(FunctorTask {
            func: Mutex::new(Some(Box::new(func))),
        })
    }
}

impl ReactorTask for FunctorTask {
    fn run(&self, core: &mut ReactorCore) {
        if let Some(func) = self.func.lock().take() {
            func(core);
        }
    }

    fn abort(&self, status: Error) {
        let func = self.func.lock().take();
        if func.is_some() {
            trace!("dropping aborted reactor functor: {}", status);
        }
    }
}

/// Closure plus completion latch, used by run_on_reactor_thread. The bounded
/// channel doubles as the latch: the caller blocks on `recv` until run or
/// abort sends the outcome.
pub(crate) struct RunFunctionTask<R> {
    func: Mutex<Option<Box<dyn FnOnce(&mut ReactorCore) -> Result<R> + Send>>>,
    tx: Sender<Result<R>>,
}

impl<R: Send + 'static> RunFunctionTask<R> {
    pub fn new(
        func: impl FnOnce(&mut ReactorCore) -> Result<R> + Send + 'static,
    ) -> (Arc<Self>, Receiver<Result<R>>) {
        let (tx, rx) = bounded(1);
        let task = Arc::new(RunFunctionTask {
            func: Mutex::new(Some(Box::new(func))),
            tx,
        });
        (task, rx)
    }
}

impl<R: Send + 'static> ReactorTask for RunFunctionTask<R> {
    fn run(&self, core: &mut ReactorCore) {
        if let Some(func) = self.func.lock().take() {
            let _ = self.tx.send(func(core));
        }
    }

    fn abort(&self, status: Error) {
        if self.func.lock().take().is_some() {
            let _ = self.tx.send(Err(status));
        }
    }
}

/// Singleton task that drains the shared outbound-call queue. Re-scheduled by
/// the first producer to make the queue non-empty; the queued calls
/// themselves are aborted by shutdown, so abort here has nothing to do.
pub(crate) struct ProcessOutboundQueueTask;

impl ReactorTask for ProcessOutboundQueueTask {
    fn run(&self, core: &mut ReactorCore) {
        core.process_outbound_queue();
    }

    fn abort(&self, _status: Error) {}
}

pub type DelayedTaskCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// A one-shot callback scheduled to run on the reactor thread after a delay.
///
/// The timer-fire and abort paths race from different threads; the done flag
/// under the task's own mutex guarantees the callback runs exactly once, with
/// `Ok(())` from the timer or the abort status otherwise. Unlinking from the
/// reactor's scheduled set always happens on the reactor thread.
pub struct DelayedTask {
    func: Mutex<Option<DelayedTaskCallback>>,
    delay: Duration,
    id: u64,
    messenger: Weak<Messenger>,
    done: Mutex<bool>,
    self_ref: Weak<DelayedTask>,
}

impl DelayedTask {
    pub(crate) fn new(
        func: DelayedTaskCallback,
        delay: Duration,
        id: u64,
        messenger: Weak<Messenger>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| DelayedTask {
            func: Mutex::new(Some(func)),
            delay,
            id,
            messenger,
            done: Mutex::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Id assigned by the owning messenger.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wins the fire/abort race for whoever flips the flag first.
    fn mark_as_done(&self) -> bool {
        let mut done = self.done.lock();
        if *done {
            false
        } else {
            *done = true;
            true
        }
    }

    /// Timer expiry on the reactor thread. A task that was aborted in the
    /// meantime is left alone.
    pub(crate) fn fire(&self) {
        if !self.mark_as_done() {
            return;
        }
        if let Some(messenger) = self.messenger.upgrade() {
            messenger.remove_scheduled_task(self.id);
        }
        if let Some(func) = self.func.lock().take() {
            func(Ok(()));
        }
    }

    /// Abort from any thread. Runs the callback with `status` if the timer
    /// has not fired yet.
    pub fn abort(&self, status: Error) {
        if !self.mark_as_done() {
            return;
        }
        if let Some(messenger) = self.messenger.upgrade() {
            messenger.remove_scheduled_task(self.id);
        }
        if let Some(func) = self.func.lock().take() {
            func(Err(status));
        }
    }
}

impl ReactorTask for DelayedTask {
    /// Arms the timer. The done lock is held across arming so a concurrent
    /// abort either wins before arming (and this returns without arming) or
    /// runs the callback right after, leaving a stale heap entry for the
    /// reactor to discard.
    fn run(&self, core: &mut ReactorCore) {
        let me = match self.self_ref.upgrade() {
            Some(me) => me,
            None => return,
        };
        let done = self.done.lock();
        if *done {
            return;
        }
        core.arm_delayed_task(me, self.delay);
    }

    fn abort(&self, status: Error) {
        DelayedTask::abort(self, status);
    }
}
