use alloc::boxed::Box;

use crate::percpu::CoreId;
use crate::vm::VmId;

/// The architectural state one vmodule keeps for one vCPU.
pub trait VcpuContext: Send {
    /// Capture the hardware state on `core` as the vCPU is switched out.
    fn save(&mut self, core: CoreId);
    /// Load the state on `core` as the vCPU is switched in.
    fn restore(&self, core: CoreId);
    /// Return to the power-on state.
    fn reset(&mut self) {}
}

/// A piece of per-vCPU architectural state (FP registers, timers, list registers, ...)
/// that must follow the vCPU across context switches.
///
/// Modules are registered with [`crate::Kernel::register_vmodule`] before VMs are created;
/// every vCPU gets one context from each.
pub trait VModule: Send + Sync {
    fn name(&self) -> &str;

    fn create_context(&self, vm: VmId, vcpu: usize) -> Box<dyn VcpuContext>;
}
