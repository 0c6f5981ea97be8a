use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};

use crate::event::{Event, WaitKind};
use crate::hal::{IrqGuard, KernelHal};
use crate::kernel::Kernel;
use crate::percpu::CoreId;
use crate::task::{PendState, TaskId};

/// A sleeping mutex built on an [`Event`]. Ownership passes directly to the
/// highest-priority waiter on post.
#[derive(Clone)]
pub struct KMutex {
    event: Arc<Event>,
}

/// What [`Kernel::mutex_pend`] did with the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutexPend {
    /// The mutex was free and is now owned by the caller.
    Acquired,
    /// The caller was parked; collect the result with [`Kernel::mutex_pend_result`] when
    /// it runs again.
    Blocked,
}

impl KMutex {
    pub fn new() -> Self {
        Self { event: Event::new() }
    }

    /// The task holding the mutex.
    pub fn owner(&self) -> Option<TaskId> {
        self.event.inner.lock().owner
    }

    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: KernelHal> Kernel<H> {
    /// Take `m` if it is free; `ResourceBusy` otherwise.
    pub fn mutex_accept(&self, core: CoreId, id: TaskId, m: &KMutex) -> AxResult {
        self.pcpu(core)?;
        let _irq = IrqGuard::new(&self.hal);
        let mut ev = m.event.inner.lock();
        if ev.owner.is_some() {
            return ax_err!(ResourceBusy, "mutex is held");
        }
        ev.owner = Some(id);
        Ok(())
    }

    /// Take `m`, blocking the current task `id` of `core` while it is held.
    ///
    /// `timeout` is in ticks; 0 and [`crate::WAIT_FOREVER`] wait forever.
    pub fn mutex_pend(
        &self,
        core: CoreId,
        id: TaskId,
        m: &KMutex,
        timeout: u64,
    ) -> AxResult<MutexPend> {
        self.might_sleep(core)?;
        {
            let _irq = IrqGuard::new(&self.hal);
            let mut ev = m.event.inner.lock();
            match ev.owner {
                None => {
                    ev.owner = Some(id);
                    return Ok(MutexPend::Acquired);
                }
                Some(owner) if owner == id => {
                    return ax_err!(AlreadyExists, "mutex already held by the caller");
                }
                Some(_) => self.park_on_event(core, id, &m.event, &mut ev, WaitKind::Mutex, timeout)?,
            }
        }
        self.sched(core)?;
        Ok(MutexPend::Blocked)
    }

    /// Outcome of a blocked [`Kernel::mutex_pend`]: `Ok` when the mutex was handed over.
    pub fn mutex_pend_result(&self, id: TaskId) -> AxResult {
        self.event_pend_down(id)?.into_result()
    }

    /// Release `m`, handing it to the highest-priority waiter if there is one.
    pub fn mutex_post(&self, core: CoreId, id: TaskId, m: &KMutex) -> AxResult {
        let pcpu = self.pcpu(core)?;
        if pcpu.in_interrupt() {
            return ax_err!(PermissionDenied, "mutex post in interrupt context");
        }
        {
            let _irq = IrqGuard::new(&self.hal);
            let mut ev = m.event.inner.lock();
            if ev.owner != Some(id) {
                return ax_err!(PermissionDenied, "mutex not owned by the caller");
            }
            let next = self.event_highest_task_ready(core, &mut ev, PendState::Ok)?;
            ev.owner = next.map(|t| t.id());
        }
        if pcpu.need_resched() {
            self.sched(core)?;
        }
        Ok(())
    }
}
