// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Minos core - pCPU/vCPU scheduling and virtual interrupt delivery.
//!
//! This crate multiplexes physical cores across kernel tasks and guest vCPUs and
//! virtualizes the interrupt controller, so that each VM sees the interrupts it is entitled
//! to while the host keeps control of physical delivery. Architecture-specific operations
//! (context switch, IPIs, interrupt masking, list registers) are delegated to the platform
//! through [`KernelHal`] and [`ListRegisters`].
//!
//! # Features
//!
//! - Per-core priority scheduler with O(1) selection and cross-core handoff
//! - Event wait queues and a sleeping mutex with timeouts
//! - Virq state machine (Inactive → Pending → Active) with deferred delivery
//! - GICv2/GICv3 list-register chips and a software-emulated chip
//! - Guest entry/exit hook pipeline, VM lifecycle, hypercalls and cross-core calls

#![no_std]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

#[cfg(test)]
extern crate std;

// Core modules
mod config; // Boot-time configuration and limits
mod event; // Event wait queues
mod exit; // Guest exit reasons and the trap-boundary pipeline
mod hal; // Hardware abstraction layer interfaces
mod hook; // Hook points and the callback registry
mod hvc; // Hypercall dispatch
mod kernel; // The top-level kernel object
mod list; // Index-based intrusive lists
mod mutex; // Sleeping mutex on top of events
mod percpu; // Per-core scheduling state
mod sched; // The priority scheduler
mod smp; // Cross-core calls
mod task; // Task control blocks
mod test; // Unit tests for the scheduler and virq pipeline
mod vcpu; // vCPU entity
mod vdev; // Software-emulated virq chip
mod vgic; // GICv2/GICv3 list-register virq chips
mod virq; // Virq descriptors and the delivery state machine
mod virq_chip; // The virq chip trait
mod vm; // VM container and lifecycle
mod vmodule; // Per-vCPU architectural contexts

// Public API exports
pub use config::*;
pub use event::{Event, WaitKind};
pub use exit::GuestExit;
pub use hal::{IpiKind, KernelHal};
pub use hook::{HookItem, HookType};
pub use hvc::*;
pub use kernel::{IrqBinding, Kernel};
pub use list::{IndexList, Link, LinkStore};
pub use mutex::{KMutex, MutexPend};
pub use percpu::{CoreId, Pcpu, PcpuState};
pub use smp::{CallHandle, SmpCall};
pub use task::*;
pub use vcpu::Vcpu;
pub use vdev::*;
pub use vgic::{GicVersion, ListRegisters, Vgic};
pub use virq::*;
pub use virq_chip::{VirqAction, VirqChip, VirqChipFlags};
pub use vm::*;
pub use vmodule::{VModule, VcpuContext};
