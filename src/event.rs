//! Event wait queues, the blocking primitive the rest of the IPC layer is built on.
//!
//! A waiting task leaves `WaitEvent` exactly once, through whichever of [`Kernel::wake`],
//! [`Kernel::wake_abort`] or its timer gets to it first. That winner unlinks the task from
//! the wait list while holding the event lock; the per-episode wait token makes the
//! losers' attempts no-ops.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::hal::{IrqGuard, KernelHal};
use crate::kernel::Kernel;
use crate::percpu::{CoreId, Timer};
use crate::task::{PendState, Task, TaskId, TaskList, TaskState};

/// What a task waits for. Recorded for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitKind {
    Event,
    Mutex,
}

pub(crate) struct EventInner {
    /// Waiters in arrival order.
    pub waiters: VecDeque<Arc<Task>>,
    /// The owning task, for events used as a mutex.
    pub owner: Option<TaskId>,
}

/// A wait queue.
pub struct Event {
    pub(crate) inner: Mutex<EventInner>,
}

impl Event {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(EventInner {
                waiters: VecDeque::new(),
                owner: None,
            }),
        })
    }

    /// Number of tasks waiting on the event.
    pub fn nr_waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Whether `task` is linked on the wait list.
    pub fn has_waiter(&self, task: TaskId) -> bool {
        self.inner.lock().waiters.iter().any(|t| t.id() == task)
    }
}

impl PendState {
    /// Convert the outcome of a wait into a result.
    pub fn into_result(self) -> AxResult {
        match self {
            PendState::Ok => Ok(()),
            PendState::Abort => ax_err!(BadState, "wait aborted"),
            PendState::Timeout => ax_err!(WouldBlock, "wait timed out"),
        }
    }
}

impl<H: KernelHal> Kernel<H> {
    /// Park the current task `id` of `core` on `event`.
    ///
    /// `timeout` is in ticks; 0 and [`crate::WAIT_FOREVER`] wait forever. The caller is
    /// switched out before this returns; the outcome is collected with
    /// [`Kernel::event_pend_down`] once it runs again.
    pub fn event_task_wait(
        &self,
        core: CoreId,
        id: TaskId,
        event: &Arc<Event>,
        mode: WaitKind,
        timeout: u64,
    ) -> AxResult {
        self.might_sleep(core)?;
        {
            let _irq = IrqGuard::new(&self.hal);
            let mut ev = event.inner.lock();
            self.park_on_event(core, id, event, &mut ev, mode, timeout)?;
        }
        self.sched(core)
    }

    /// Link the current task on an event whose lock the caller holds.
    pub(crate) fn park_on_event(
        &self,
        core: CoreId,
        id: TaskId,
        event: &Arc<Event>,
        ev: &mut EventInner,
        mode: WaitKind,
        timeout: u64,
    ) -> AxResult {
        let pcpu = self.pcpu(core)?;
        let mut local = pcpu.local.lock();
        if local.current != id || local.current == local.idle {
            return ax_err!(PermissionDenied, "only the running task can wait");
        }
        let task = self.task(id)?;
        let mut inner = task.inner.lock();
        if let Some(list) = inner.list {
            panic!("running task {} found on {:?}", id, list);
        }
        inner.state = TaskState::WaitEvent;
        inner.pend_state = PendState::Ok;
        inner.wait_event = Some(event.clone());
        inner.wait_kind = mode;
        inner.wait_token += 1;
        inner.list = Some(TaskList::Wait);
        if let Some(deadline) = self.deadline(timeout) {
            local.arm_timer(Timer {
                deadline,
                task: id,
                token: inner.wait_token,
            });
        }
        drop(inner);
        ev.waiters.push_back(task);
        Ok(())
    }

    /// Clear the wait bookkeeping of a task that was just unlinked from a wait list.
    fn finish_wait(task: &Task, pend: PendState) {
        let mut inner = task.inner.lock();
        assert_eq!(
            inner.list,
            Some(TaskList::Wait),
            "task {} leaving a wait it is not in",
            task.id()
        );
        inner.list = None;
        inner.wait_event = None;
        inner.pend_state = pend;
    }

    /// Ready the highest-priority waiter of a locked event (FIFO among equal priorities)
    /// with the given outcome.
    pub(crate) fn event_highest_task_ready(
        &self,
        from: CoreId,
        ev: &mut EventInner,
        pend: PendState,
    ) -> AxResult<Option<Arc<Task>>> {
        let mut best: Option<(usize, u8)> = None;
        for (pos, t) in ev.waiters.iter().enumerate() {
            if best.map_or(true, |(_, prio)| t.prio() < prio) {
                best = Some((pos, t.prio()));
            }
        }
        let Some(task) = best.and_then(|(pos, _)| ev.waiters.remove(pos)) else {
            return Ok(None);
        };
        Self::finish_wait(&task, pend);
        self.enqueue_ready(from, &task, true)?;
        Ok(Some(task))
    }

    /// Wake the highest-priority waiter of `event`.
    ///
    /// Returns the woken task, or `NotFound` when nobody waits.
    pub fn wake(&self, from: CoreId, event: &Arc<Event>) -> AxResult<TaskId> {
        let _irq = IrqGuard::new(&self.hal);
        let mut ev = event.inner.lock();
        match self.event_highest_task_ready(from, &mut ev, PendState::Ok)? {
            Some(task) => Ok(task.id()),
            None => ax_err!(NotFound, "no task waiting on the event"),
        }
    }

    /// Abort the wait of task `id`.
    pub fn wake_abort(&self, from: CoreId, id: TaskId) -> AxResult {
        let task = self.task(id)?;
        let Some(event) = task.inner.lock().wait_event.clone() else {
            return ax_err!(NotFound, "task is not waiting");
        };
        let _irq = IrqGuard::new(&self.hal);
        let mut ev = event.inner.lock();
        let Some(pos) = ev.waiters.iter().position(|t| t.id() == id) else {
            return ax_err!(NotFound, "task already left the wait");
        };
        ev.waiters.remove(pos);
        Self::finish_wait(&task, PendState::Abort);
        self.enqueue_ready(from, &task, true)
    }

    /// Abort every waiter of `event`, returning how many there were.
    pub fn event_del_always(&self, from: CoreId, event: &Arc<Event>) -> AxResult<usize> {
        let _irq = IrqGuard::new(&self.hal);
        let mut ev = event.inner.lock();
        let mut n = 0;
        while self
            .event_highest_task_ready(from, &mut ev, PendState::Abort)?
            .is_some()
        {
            n += 1;
        }
        ev.owner = None;
        Ok(n)
    }

    /// Collect the outcome of the last wait of `id` and reset its wait bookkeeping.
    pub fn event_pend_down(&self, id: TaskId) -> AxResult<PendState> {
        let task = self.task(id)?;
        let mut inner = task.inner.lock();
        if inner.state == TaskState::WaitEvent {
            return ax_err!(BadState, "task is still waiting");
        }
        let pend = inner.pend_state;
        inner.pend_state = PendState::Ok;
        inner.wait_event = None;
        inner.wait_kind = WaitKind::Event;
        Ok(pend)
    }

    /// Timer expiry of an event wait armed with `token`.
    pub(crate) fn event_timeout(
        &self,
        core: CoreId,
        event: &Arc<Event>,
        task: &Arc<Task>,
        token: u64,
    ) -> AxResult {
        let mut ev = event.inner.lock();
        let live = {
            let inner = task.inner.lock();
            inner.wait_token == token
                && inner.state == TaskState::WaitEvent
                && inner
                    .wait_event
                    .as_ref()
                    .is_some_and(|e| Arc::ptr_eq(e, event))
        };
        if !live {
            return Ok(());
        }
        let Some(pos) = ev.waiters.iter().position(|t| t.id() == task.id()) else {
            return Ok(());
        };
        ev.waiters.remove(pos);
        Self::finish_wait(task, PendState::Timeout);
        debug!("task {}({}) wait timed out", task.name(), task.id());
        self.enqueue_ready(core, task, true)
    }

    /// Unlink a task from `event` without readying it.
    pub(crate) fn event_remove_waiter(&self, event: &Arc<Event>, task: &Task) {
        let mut ev = event.inner.lock();
        if let Some(pos) = ev.waiters.iter().position(|t| t.id() == task.id()) {
            ev.waiters.remove(pos);
            Self::finish_wait(task, PendState::Abort);
        }
    }
}
