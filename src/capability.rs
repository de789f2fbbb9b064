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

//! Single-responsibility interfaces a vcpu or VM is composed of.
//!
//! Code that only needs one capability (for example, a handler helper that
//! advances and resumes) can be written against that trait alone.

use crate::exit::{ExitCategory, ExitInfo, ExitResolution};
use crate::pool::{VcpuId, VmId};
use crate::VmmResult;

/// Execution control of a vcpu.
pub trait Execute {
    /// Binds the vcpu to the calling physical CPU.
    fn load(&self) -> VmmResult;
    /// Unbinds the vcpu from the calling physical CPU.
    fn unload(&self) -> VmmResult;
    /// Enters the vcpu, or, from inside a vmexit handler, schedules it for
    /// re-entry once the handler returns.
    fn run(&self) -> VmmResult;
}

/// Instruction pointer control of a vcpu.
pub trait InstructionPointer {
    /// Moves the instruction pointer past the instruction that caused the
    /// current vmexit.
    fn instruction_pointer_advance(&self);
}

/// Read access to the current vmexit.
///
/// Outside a vmexit handler, these report the most recent vmexit.
pub trait VmexitInfo {
    /// The full vmexit.
    fn vmexit_info(&self) -> ExitInfo;

    /// The basic exit reason.
    fn vmexit_reason(&self) -> u32 {
        self.vmexit_info().reason
    }

    /// The exit qualification.
    fn vmexit_qualification(&self) -> u64 {
        self.vmexit_info().qualification
    }

    /// The category the vmexit was dispatched as.
    fn vmexit_category(&self) -> Option<ExitCategory> {
        ExitCategory::resolve(&self.vmexit_info())
    }
}

/// Per-category vmexit control.
pub trait VmexitControl {
    /// The handler type invoked for a category.
    type Handler;

    /// Makes the hardware surface `category` as a vmexit. Idempotent.
    fn vmexit_enable(&self, category: ExitCategory);
    /// Stops the hardware from surfacing `category` as a vmexit. Idempotent.
    fn vmexit_disable(&self, category: ExitCategory);
    /// Whether `category` currently causes vmexits.
    fn vmexit_is_enabled(&self, category: ExitCategory) -> bool;
    /// Replaces the handler of `category`.
    fn vmexit_handler_set(&self, category: ExitCategory, handler: Self::Handler);
    /// Completes the current vmexit by executing the real instruction.
    fn vmexit_execute(&self);
    /// Completes the current vmexit by substituting `value` for the instruction.
    fn vmexit_emulate(&self, value: u64);
    /// How the current vmexit was completed so far.
    fn vmexit_resolution(&self) -> ExitResolution;
}

/// Identity and role of a vcpu.
pub trait Property {
    fn id(&self) -> VcpuId;
    /// The VM the vcpu belongs to.
    fn vm_id(&self) -> VmId;
    /// Whether this is the first vcpu created on the bootstrap CPU.
    fn is_bootstrap_vcpu(&self) -> bool;
    /// Whether the vcpu belongs to the root VM.
    fn is_root_vcpu(&self) -> bool;
}

/// vcpu lifecycle callbacks of a VM.
pub trait VcpuLifecycle {
    /// The handler type invoked on vcpu creation and destruction.
    type Handler;

    fn id_get(&self) -> VmId;
    /// Replaces the handler invoked once for every vcpu created from now on.
    fn vcpu_init_handler_set(&self, handler: Self::Handler);
    /// Replaces the handler invoked once for every vcpu destroyed from now on.
    fn vcpu_fini_handler_set(&self, handler: Self::Handler);
}

/// Skips the exiting instruction and resumes the vcpu, the usual way to finish
/// a handler.
pub fn advance_and_run<V: InstructionPointer + Execute>(vcpu: &V) -> VmmResult {
    vcpu.instruction_pointer_advance();
    vcpu.run()
}
