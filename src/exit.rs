use axerrno::{ax_err, AxResult};

use crate::hal::{IrqGuard, KernelHal};
use crate::hook::{HookItem, HookType};
use crate::kernel::Kernel;
use crate::percpu::CoreId;
use crate::vcpu::Vcpu;

/// Why the current vCPU of a core trapped into the hypervisor.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestExit {
    /// The instruction executed by the vcpu performs a hypercall.
    Hypercall {
        /// The hypercall number.
        nr: u64,
        /// The arguments for the hypercall.
        args: [u64; 6],
    },
    /// A physical interrupt arrived while the guest was running.
    Irq {
        /// The physical interrupt number.
        hwirq: u32,
    },
    /// The scheduler timer fired while the guest was running.
    Tick,
    /// The guest executed `WFI`.
    WaitForInterrupt,
    /// Nothing special happened.
    Nothing,
}

impl<H: KernelHal> Kernel<H> {
    /// The trap boundary of a vCPU running on `core`.
    ///
    /// Runs the exit hooks (virq state is collected there), handles `exit`, honours a
    /// pending reschedule, then runs the entry hooks for whichever vCPU is about to enter
    /// the guest (pending virqs are injected there).
    pub fn handle_guest_exit(&self, core: CoreId, exit: GuestExit) -> AxResult {
        let task = self.current(core)?;
        let Some(vcpu) = task.vcpu().cloned() else {
            return ax_err!(BadState, "guest exit on a host task");
        };
        self.guest_boundary_hooks(core, &vcpu, HookType::ExitFromGuest);

        match exit {
            GuestExit::Hypercall { nr, args } => {
                let ret = self.handle_hvc(core, &vcpu, nr, &args);
                // SAFETY: the task trapped on this core and is not running guest code.
                unsafe { task.context_mut() }.set_return_value(ret as usize);
            }
            GuestExit::Irq { hwirq } => {
                self.irq_enter(core)?;
                if let Err(e) = self.handle_guest_irq(core, hwirq) {
                    warn!("core {}: unhandled irq {}: {:?}", core, hwirq, e);
                }
                self.irq_exit(core)?;
            }
            GuestExit::Tick => {
                self.irq_enter(core)?;
                let ret = self.sched_tick(core);
                self.irq_exit(core)?;
                ret?;
            }
            GuestExit::WaitForInterrupt => {
                if !self.has_pending_virq(&vcpu) {
                    self.set_task_suspend(core, task.id(), 0)?;
                }
            }
            GuestExit::Nothing => {}
        }

        self.trap_return(core)?;
        if let Some(next) = self.current_vcpu(core) {
            self.guest_boundary_hooks(core, &next, HookType::EnterToGuest);
        }
        Ok(())
    }

    /// Guest entry and exit hooks take the virq lock, which the host irq path takes too.
    fn guest_boundary_hooks(&self, core: CoreId, vcpu: &Vcpu, hook: HookType) {
        let _irq = IrqGuard::new(&self.hal);
        self.do_hooks(&HookItem::Vcpu { core, vcpu }, hook);
    }

    /// Run the entry hooks for the vCPU current on `core`, for the first entry after a
    /// switch that did not come through [`Kernel::handle_guest_exit`].
    pub fn enter_guest(&self, core: CoreId) -> AxResult {
        let Some(vcpu) = self.current_vcpu(core) else {
            return ax_err!(BadState, "current task is not a vcpu");
        };
        self.guest_boundary_hooks(core, &vcpu, HookType::EnterToGuest);
        Ok(())
    }
}
