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

//! AxVmCore - VM, vCPU and vmexit dispatch core for ArceOS hypervisors.
//!
//! This crate provides the control-plane core of a type-1 hypervisor: fixed-capacity
//! pools of VMs and vCPUs, a per-vCPU vmexit dispatcher with per-category handlers,
//! and the per-CPU bring-up sequence. Hardware access is delegated to implementations
//! of the `AxArchVCpu` and `AxArchPerCpu` traits, and host services to `AxPlatform`,
//! all selected at compile time through one `AxVmmHal` type.
//!
//! # Features
//!
//! - Capability traits a vCPU or VM is composed of (`Execute`, `VmexitControl`, ...)
//! - State machine for vCPU execution (Unloaded → Loaded → Running → Loaded)
//! - Non-recursive re-entry: `run()` inside a vmexit handler resumes after the handler
//! - Allocation-free VM and vCPU creation, with generation-tagged ids
//! - VM lifecycle handlers invoked on vCPU creation and destruction
//! - A direct-map platform for hosts with a fixed physical-to-virtual offset

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

// Core modules
mod arch_vcpu; // Architecture-specific vCPU trait definition
mod capability; // Single-responsibility vCPU and VM interfaces
mod config; // Monitor sizing
mod error; // Error type of the monitor
mod exit; // vmexit reasons, categories and dispatch data
mod hal; // Hardware abstraction layer interfaces
mod monitor; // The monitor instance and the per-CPU dispatch loop
mod percpu; // Per-CPU virtualization state management
mod platform; // Firmware, loader and host memory services
mod pool; // Fixed-capacity VM and vCPU arenas
#[cfg(test)]
mod test; // Scenario tests against a mock backend
mod vcpu; // vCPU composite and vmexit dispatch
mod vm; // VM composite and vCPU lifecycle

// Public API exports
pub use arch_vcpu::{AxArchVCpu, Gpr};
pub use capability::{
    advance_and_run, Execute, InstructionPointer, Property, VcpuLifecycle, VmexitControl,
    VmexitInfo,
};
pub use config::{MonitorConfig, MAX_VCPUS_PER_VM};
pub use error::{VmmError, VmmResult};
pub use exit::{reason, ExitCategory, ExitCategorySet, ExitDetail, ExitInfo, ExitResolution};
pub use hal::AxVmmHal;
pub use monitor::AxMonitor;
pub use percpu::{AxArchPerCpu, AxPerCpu};
pub use platform::{
    AxPlatform, DirectMapPlatform, HostPhysAddr, HostVirtAddr, MemoryType, PageSize,
    PlatformInfo, MAX_DIRECT_MAPPINGS,
};
pub use pool::{VcpuId, VmId, INDEX_BITS, MAX_POOL_CAPACITY};
pub use vcpu::{AxVCpu, VCpuState, VmexitHandler};
pub use vm::{AxVM, VCpuLifecycleHandler};
