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

use axerrno::AxResult;

use crate::exit::{ExitCategory, ExitCategorySet, ExitInfo};
use crate::pool::{VcpuId, VmId};
use crate::VmmResult;

/// General purpose registers of an x86_64 vcpu, plus `rip` and `rsp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rbx,
    Rcx,
    Rdx,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rsp,
}

/// Architecture-specific virtual CPU backend.
///
/// The monitor pre-constructs one backend per vcpu pool slot with [`Default`], so
/// creating a vcpu never allocates. [`AxArchVCpu::init`] binds an empty backend to a
/// vcpu identity and [`AxArchVCpu::reset`] returns it to the empty state when the
/// vcpu is destroyed.
///
/// All methods are called on the physical CPU the vcpu is loaded on, except
/// `init`, which runs on the creating CPU before the vcpu is visible to anyone
/// else, and `reset`, which runs after the vcpu was unloaded.
pub trait AxArchVCpu: Default + Send {
    /// Architecture-specific configuration shared by all vcpus of a monitor.
    type CreateConfig: Send + Sync;

    /// The exit categories this backend can surface. Requests for other
    /// categories are ignored by the vcpu.
    const SUPPORTED_EXITS: ExitCategorySet;

    /// Binds the backend to a newly created vcpu.
    fn init(&mut self, vm_id: VmId, vcpu_id: VcpuId, config: &Self::CreateConfig) -> AxResult;

    /// Returns the backend to its empty state.
    fn reset(&mut self);

    /// Makes the virtualization control state of this vcpu current on this
    /// physical CPU (VMPTRLD on VMX).
    fn load(&mut self) -> AxResult;

    /// Clears the virtualization control state from this physical CPU (VMCLEAR on VMX).
    fn unload(&mut self) -> AxResult;

    /// Enters the guest and returns at the next vmexit.
    ///
    /// A rejected entry is reported as [`crate::VmmError::EntryFailure`].
    fn run(&mut self) -> VmmResult<ExitInfo>;

    /// Turns the vmexit for `category` on or off in the execution controls.
    fn set_exit_control(&mut self, category: ExitCategory, enabled: bool);

    /// Moves the guest instruction pointer forward by `len` bytes.
    fn advance_instruction_pointer(&mut self, len: u32);

    /// Completes `exit` by executing the real instruction on behalf of the guest.
    fn execute(&mut self, exit: &ExitInfo);

    /// Completes `exit` by substituting `value` for the result of the instruction.
    fn emulate(&mut self, exit: &ExitInfo, value: u64);

    /// Reads a general purpose register.
    fn gpr(&self, reg: Gpr) -> u64;

    /// Writes a general purpose register.
    fn set_gpr(&mut self, reg: Gpr, value: u64);

    /// Sets the value returned to the guest by a hypercall.
    fn set_return_value(&mut self, value: u64) {
        self.set_gpr(Gpr::Rax, value);
    }

    /// Queues an external interrupt for injection at the next entry.
    fn inject_interrupt(&mut self, vector: u8);

    /// Queues an NMI for injection at the next entry.
    fn inject_nmi(&mut self);

    /// Programs the preemption timer.
    fn set_preemption_timer(&mut self, ticks: u64);

    /// Tags this vcpu's translations with a VPID.
    fn enable_vpid(&mut self);
}
