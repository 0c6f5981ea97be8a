//! Hypercalls issued by guests.
//!
//! Management calls follow the `0xc0000000 + (type << 24) + n` numbering of the Minos
//! guest drivers; vCPU and system power use the standard PSCI function ids. The result
//! goes back to the guest in `x0`, negative Linux errno on failure.

use alloc::sync::Arc;

use axerrno::{ax_err, ax_err_type, AxResult, LinuxError};
use memory_addr::VirtAddr;

use crate::hal::KernelHal;
use crate::kernel::Kernel;
use crate::percpu::CoreId;
use crate::vcpu::Vcpu;

const HVC_CALL_BASE: u64 = 0xc000_0000;
const HVC_TYPE_VM0: u64 = 0x8;
const HVC_TYPE_MISC: u64 = 0x9;

const fn hvc_call(ty: u64, n: u64) -> u64 {
    HVC_CALL_BASE + (ty << 24) + n
}

pub const HVC_VM_DESTROY: u64 = hvc_call(HVC_TYPE_VM0, 1);
pub const HVC_VM_RESTART: u64 = hvc_call(HVC_TYPE_VM0, 2);
pub const HVC_VM_POWER_UP: u64 = hvc_call(HVC_TYPE_VM0, 3);
pub const HVC_VM_POWER_DOWN: u64 = hvc_call(HVC_TYPE_VM0, 4);
pub const HVC_VM_SEND_VIRQ: u64 = hvc_call(HVC_TYPE_VM0, 7);
pub const HVC_GET_VMID: u64 = hvc_call(HVC_TYPE_MISC, 0);
pub const HVC_SCHED_OUT: u64 = hvc_call(HVC_TYPE_MISC, 1);

pub const PSCI_CPU_OFF: u64 = 0x8400_0002;
pub const PSCI_CPU_ON: u64 = 0xc400_0003;
pub const PSCI_SYSTEM_RESET: u64 = 0x8400_0009;
pub const PSCI_SYSTEM_SUSPEND: u64 = 0xc400_000e;

impl<H: KernelHal> Kernel<H> {
    /// Dispatch hypercall `nr` from `vcpu`, returning the value for `x0`.
    pub(crate) fn handle_hvc(&self, core: CoreId, vcpu: &Arc<Vcpu>, nr: u64, args: &[u64; 6]) -> i64 {
        match self.dispatch_hvc(core, vcpu, nr, args) {
            Ok(val) => val as i64,
            Err(e) => {
                debug!("hvc {:#x} from vm {} failed: {:?}", nr, vcpu.vm_id(), e);
                -(LinuxError::from(e).code() as i64)
            }
        }
    }

    fn dispatch_hvc(&self, core: CoreId, vcpu: &Arc<Vcpu>, nr: u64, args: &[u64; 6]) -> AxResult<u64> {
        let own_vm = vcpu.vm_id();
        match nr {
            HVC_VM_POWER_UP => self.vm_power_on(core, args[0] as usize),
            HVC_VM_POWER_DOWN => self.vm_power_off(core, args[0] as usize),
            HVC_VM_RESTART => self.vm_reset(core, args[0] as usize),
            HVC_VM_DESTROY => {
                if args[0] as usize == own_vm {
                    return ax_err!(PermissionDenied, "a vm cannot destroy itself");
                }
                self.destroy_vm(core, args[0] as usize)
            }
            HVC_VM_SEND_VIRQ => {
                let virq = u32::try_from(args[1])
                    .map_err(|_| ax_err_type!(InvalidInput, "virq number out of range"))?;
                self.send_virq_to_vm(core, args[0] as usize, virq)
            }
            HVC_GET_VMID => return Ok(own_vm as u64),
            HVC_SCHED_OUT => self.sched_yield(core),
            PSCI_CPU_ON => self.vcpu_power_on(
                core,
                own_vm,
                args[0] as usize,
                VirtAddr::from(args[1] as usize),
                args[2] as usize,
            ),
            PSCI_CPU_OFF => self.vcpu_power_off(core),
            PSCI_SYSTEM_RESET => self.vm_reset(core, own_vm),
            PSCI_SYSTEM_SUSPEND => self.vm_suspend(core, own_vm),
            _ => ax_err!(Unsupported, format!("unknown hypercall {:#x}", nr)),
        }
        .map(|_| 0)
    }
}
