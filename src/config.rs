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

use axerrno::{ax_err, AxResult};

use crate::pool::MAX_POOL_CAPACITY;

/// Upper bound on the number of vcpus a single VM can have.
pub const MAX_VCPUS_PER_VM: usize = 256;

/// Sizing of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Number of VM slots.
    pub vm_capacity: usize,
    /// Number of vcpu slots.
    pub vcpu_capacity: usize,
    /// Number of physical CPUs the monitor tracks. CPU ids reported by the HAL
    /// must be below this.
    pub cpu_count: usize,
    /// The physical CPU whose first vcpu is the bootstrap vcpu.
    pub bootstrap_cpu: usize,
    /// Largest vcpu count accepted by `make_virtual_machine`, at most
    /// [`MAX_VCPUS_PER_VM`].
    pub max_vcpus_per_vm: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            vm_capacity: 64,
            vcpu_capacity: 1024,
            cpu_count: 64,
            bootstrap_cpu: 0,
            max_vcpus_per_vm: MAX_VCPUS_PER_VM,
        }
    }
}

impl MonitorConfig {
    /// Returns a copy with the given pool capacities.
    pub const fn with_capacity(mut self, vm_capacity: usize, vcpu_capacity: usize) -> Self {
        self.vm_capacity = vm_capacity;
        self.vcpu_capacity = vcpu_capacity;
        self
    }

    /// Returns a copy tracking `cpu_count` physical CPUs.
    pub const fn with_cpu_count(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    /// Checks that the configuration describes a usable monitor.
    pub fn validate(&self) -> AxResult {
        if self.vm_capacity == 0 || self.vcpu_capacity == 0 || self.cpu_count == 0 {
            return ax_err!(InvalidInput, "pool capacities and cpu count must be non-zero");
        }
        if self.vm_capacity > MAX_POOL_CAPACITY || self.vcpu_capacity > MAX_POOL_CAPACITY {
            return ax_err!(InvalidInput, "pool capacity does not fit a handle index");
        }
        if self.bootstrap_cpu >= self.cpu_count {
            return ax_err!(InvalidInput, "bootstrap cpu is not a tracked cpu");
        }
        if self.max_vcpus_per_vm == 0 || self.max_vcpus_per_vm > MAX_VCPUS_PER_VM {
            return ax_err!(InvalidInput, "invalid per-VM vcpu limit");
        }
        Ok(())
    }
}
