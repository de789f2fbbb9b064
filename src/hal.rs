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

use crate::{AxArchPerCpu, AxArchVCpu, AxPlatform};

/// The interfaces which the underlying software (kernel or hypervisor) must implement.
///
/// The monitor is generic over one type implementing this trait, which also
/// selects the backends, so no dynamic dispatch happens on the vmexit path.
pub trait AxVmmHal: Sized + 'static {
    /// The architecture-specific vcpu backend.
    type VCpu: AxArchVCpu;
    /// The architecture-specific per-CPU virtualization state.
    type PerCpu: AxArchPerCpu;
    /// The platform the monitor runs on.
    type Platform: AxPlatform;

    /// Returns the id of the physical CPU executing the call.
    ///
    /// Ids must be dense, starting from 0.
    fn current_cpu() -> usize;
}
