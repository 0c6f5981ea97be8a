//! Hardware-assisted virq chips: GICv2 and GICv3 list registers.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};

use crate::config::MAX_VIRQ_SLOTS;
use crate::percpu::CoreId;
use crate::virq::{VirqDesc, VirqState, VIRQ_NR_LOCAL, VIRQ_NR_SGI};
use crate::virq_chip::{VirqAction, VirqChip, VirqChipFlags};
use crate::vm::VmId;
use crate::vmodule::{VModule, VcpuContext};

/// Access to the list registers of the core the caller runs on.
pub trait ListRegisters: Send + Sync {
    fn nr_lrs(&self) -> usize;
    fn read_lr(&self, core: CoreId, idx: usize) -> u64;
    fn write_lr(&self, core: CoreId, idx: usize, val: u64);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GicVersion {
    V2,
    V3,
}

const LR_STATE_PENDING: u64 = 0b01;
const LR_STATE_ACTIVE: u64 = 0b10;
const LR_STATE_BOTH: u64 = 0b11;

mod gich_lr {
    pub const VID_MASK: u64 = 0x3ff;
    pub const PID_SHIFT: u64 = 10;
    pub const PID_MASK: u64 = 0x3ff;
    pub const CPUID_SHIFT: u64 = 10;
    pub const CPUID_MASK: u64 = 0x7;
    pub const PRIO_SHIFT: u64 = 23;
    pub const PRIO_MASK: u64 = 0x1f;
    pub const STATE_SHIFT: u64 = 28;
    pub const GRP1: u64 = 1 << 30;
    pub const HW: u64 = 1 << 31;
}

mod ich_lr {
    pub const VINTID_MASK: u64 = 0xffff_ffff;
    pub const PINTID_SHIFT: u64 = 32;
    pub const PINTID_MASK: u64 = 0x1fff;
    pub const PRIO_SHIFT: u64 = 48;
    pub const PRIO_MASK: u64 = 0xff;
    pub const GROUP1: u64 = 1 << 60;
    pub const HW: u64 = 1 << 61;
    pub const STATE_SHIFT: u64 = 62;
}

fn state_bits(state: VirqState) -> u64 {
    match state {
        VirqState::Pending => LR_STATE_PENDING,
        VirqState::Active => LR_STATE_ACTIVE,
        VirqState::ActiveAndPending => LR_STATE_BOTH,
        VirqState::Inactive | VirqState::Offline => 0,
    }
}

fn bits_state(bits: u64) -> VirqState {
    match bits & 0b11 {
        LR_STATE_PENDING => VirqState::Pending,
        LR_STATE_ACTIVE => VirqState::Active,
        LR_STATE_BOTH => VirqState::ActiveAndPending,
        _ => VirqState::Inactive,
    }
}

impl GicVersion {
    /// Encode a list register value injecting `desc` in `state`.
    pub fn encode_lr(self, desc: &VirqDesc, state: VirqState) -> u64 {
        match self {
            GicVersion::V2 => {
                let mut val = (desc.vno as u64) & gich_lr::VID_MASK;
                if desc.is_hw() {
                    val |= gich_lr::HW | ((desc.hno as u64) & gich_lr::PID_MASK) << gich_lr::PID_SHIFT;
                } else if desc.vno < VIRQ_NR_SGI {
                    val |= ((desc.src as u64) & gich_lr::CPUID_MASK) << gich_lr::CPUID_SHIFT;
                }
                val |= ((desc.pr as u64 >> 3) & gich_lr::PRIO_MASK) << gich_lr::PRIO_SHIFT;
                val | gich_lr::GRP1 | state_bits(state) << gich_lr::STATE_SHIFT
            }
            GicVersion::V3 => {
                let mut val = (desc.vno as u64) & ich_lr::VINTID_MASK;
                if desc.is_hw() {
                    val |= ich_lr::HW | ((desc.hno as u64) & ich_lr::PINTID_MASK) << ich_lr::PINTID_SHIFT;
                }
                val |= ((desc.pr as u64) & ich_lr::PRIO_MASK) << ich_lr::PRIO_SHIFT;
                val | ich_lr::GROUP1 | state_bits(state) << ich_lr::STATE_SHIFT
            }
        }
    }

    /// The state field of a list register value.
    pub fn lr_state(self, val: u64) -> VirqState {
        match self {
            GicVersion::V2 => bits_state(val >> gich_lr::STATE_SHIFT),
            GicVersion::V3 => bits_state(val >> ich_lr::STATE_SHIFT),
        }
    }

    /// The virtual interrupt id of a list register value.
    pub fn lr_vintid(self, val: u64) -> u32 {
        match self {
            GicVersion::V2 => (val & gich_lr::VID_MASK) as u32,
            GicVersion::V3 => (val & ich_lr::VINTID_MASK) as u32,
        }
    }
}

/// A virq chip injecting through list registers.
pub struct Vgic<L: ListRegisters> {
    version: GicVersion,
    lrs: Arc<L>,
}

impl<L: ListRegisters + 'static> Vgic<L> {
    pub fn new(version: GicVersion, lrs: Arc<L>) -> Self {
        Self { version, lrs }
    }

    pub fn version(&self) -> GicVersion {
        self.version
    }

    /// The vmodule that carries the list registers across vCPU switches.
    pub fn lr_module(&self) -> Arc<dyn VModule> {
        Arc::new(LrModule {
            lrs: self.lrs.clone(),
        })
    }

    fn slot(&self, desc: &VirqDesc) -> AxResult<usize> {
        match desc.id {
            Some(id) if (id as usize) < self.nr_slots() => Ok(id as usize),
            _ => ax_err!(InvalidInput, "virq has no valid list register"),
        }
    }
}

impl<L: ListRegisters + 'static> VirqChip for Vgic<L> {
    fn name(&self) -> &str {
        match self.version {
            GicVersion::V2 => "vgicv2",
            GicVersion::V3 => "vgicv3",
        }
    }

    fn flags(&self) -> VirqChipFlags {
        VirqChipFlags::HW_VIRT
    }

    fn nr_slots(&self) -> usize {
        self.lrs.nr_lrs().min(MAX_VIRQ_SLOTS)
    }

    fn send_virq(&self, core: CoreId, _vcpu: usize, desc: &VirqDesc) -> AxResult {
        let idx = self.slot(desc)?;
        self.lrs
            .write_lr(core, idx, self.version.encode_lr(desc, VirqState::Pending));
        Ok(())
    }

    fn get_virq_state(&self, core: CoreId, _vcpu: usize, desc: &VirqDesc) -> VirqState {
        match self.slot(desc) {
            Ok(idx) => {
                let val = self.lrs.read_lr(core, idx);
                if self.version.lr_vintid(val) != desc.vno {
                    return VirqState::Inactive;
                }
                self.version.lr_state(val)
            }
            Err(_) => VirqState::Inactive,
        }
    }

    fn update_virq(
        &self,
        core: CoreId,
        _vcpu: usize,
        desc: &VirqDesc,
        action: VirqAction,
    ) -> AxResult {
        match action {
            VirqAction::Clear => {
                let idx = self.slot(desc)?;
                self.lrs.write_lr(core, idx, 0);
            }
            // physical routing is done by the host irq layer
            VirqAction::Add | VirqAction::Remove => {}
        }
        Ok(())
    }

    /// `<type number flags>`: type 0 is an SPI, type 1 a PPI.
    fn xlate(&self, intspec: &[u32]) -> AxResult<(u32, u32)> {
        if intspec.len() < 2 {
            return ax_err!(InvalidInput, "interrupt specifier too short");
        }
        let flags = intspec.get(2).copied().unwrap_or(0);
        match intspec[0] {
            0 => Ok((intspec[1] + VIRQ_NR_LOCAL, flags)),
            1 if intspec[1] < VIRQ_NR_LOCAL - VIRQ_NR_SGI => Ok((intspec[1] + VIRQ_NR_SGI, flags)),
            _ => ax_err!(InvalidInput, "bad interrupt specifier"),
        }
    }
}

struct LrModule<L: ListRegisters> {
    lrs: Arc<L>,
}

impl<L: ListRegisters + 'static> VModule for LrModule<L> {
    fn name(&self) -> &str {
        "vgic-lr"
    }

    fn create_context(&self, _vm: VmId, _vcpu: usize) -> Box<dyn VcpuContext> {
        Box::new(LrContext {
            lrs: self.lrs.clone(),
            saved: vec![0; self.lrs.nr_lrs()],
        })
    }
}

struct LrContext<L: ListRegisters> {
    lrs: Arc<L>,
    saved: Vec<u64>,
}

impl<L: ListRegisters> VcpuContext for LrContext<L> {
    fn save(&mut self, core: CoreId) {
        for (idx, val) in self.saved.iter_mut().enumerate() {
            *val = self.lrs.read_lr(core, idx);
            self.lrs.write_lr(core, idx, 0);
        }
    }

    fn restore(&self, core: CoreId) {
        for (idx, &val) in self.saved.iter().enumerate() {
            self.lrs.write_lr(core, idx, val);
        }
    }

    fn reset(&mut self) {
        self.saved.iter_mut().for_each(|v| *v = 0);
    }
}
