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

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axerrno::{ax_err, AxResult};
use spin::Mutex;

/// Trait representing the per-CPU architecture-specific virtualization state.
///
/// Implementers handle the specifics of how hardware virtualization is enabled,
/// disabled, and checked for each CPU in the system (VMXON/VMXOFF on VMX).
pub trait AxArchPerCpu: Sized + Send {
    /// Create a new per-CPU state.
    fn new(cpu_id: usize) -> AxResult<Self>;
    /// Whether hardware virtualization is enabled on the current CPU.
    fn is_enabled(&self) -> bool;
    /// Enable hardware virtualization on the current CPU.
    fn hardware_enable(&mut self) -> AxResult;
    /// Disable hardware virtualization on the current CPU.
    fn hardware_disable(&mut self) -> AxResult;
}

const NO_VCPU: usize = usize::MAX;

/// Host per-CPU state kept by the monitor for every physical CPU.
///
/// Besides the architecture-specific virtualization state, it records which
/// vcpu slot is loaded on the CPU and whether the CPU is currently inside a
/// vmexit handler. Only the CPU itself writes those two fields, except that
/// [`AxPerCpu::claim`] may be raced by misbehaving callers, which is why it is a
/// compare-and-swap.
pub struct AxPerCpu<A: AxArchPerCpu> {
    cpu_id: usize,
    /// Pool index of the loaded vcpu, or `NO_VCPU`.
    loaded: AtomicUsize,
    in_dispatch: AtomicBool,
    /// The architecture-specific state, `None` until [`AxPerCpu::init`].
    arch: Mutex<Option<A>>,
}

impl<A: AxArchPerCpu> AxPerCpu<A> {
    /// Create a new, uninitialized per-CPU state.
    pub const fn new_uninit(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            loaded: AtomicUsize::new(NO_VCPU),
            in_dispatch: AtomicBool::new(false),
            arch: Mutex::new(None),
        }
    }

    /// The id of the CPU.
    pub const fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    /// Initialize the architecture-specific state.
    pub fn init(&self) -> AxResult {
        let mut arch = self.arch.lock();
        if arch.is_some() {
            ax_err!(BadState, "per-CPU state is already initialized")
        } else {
            *arch = Some(A::new(self.cpu_id)?);
            Ok(())
        }
    }

    /// Whether the per-CPU state is initialized.
    pub fn is_initialized(&self) -> bool {
        self.arch.lock().is_some()
    }

    /// Whether the CPU has hardware virtualization enabled.
    pub fn is_enabled(&self) -> bool {
        self.arch.lock().as_ref().is_some_and(|arch| arch.is_enabled())
    }

    /// Enable hardware virtualization on the CPU.
    pub fn hardware_enable(&self) -> AxResult {
        match self.arch.lock().as_mut() {
            Some(arch) => arch.hardware_enable(),
            None => ax_err!(BadState, "per-CPU state is not initialized"),
        }
    }

    /// Disable hardware virtualization on the CPU.
    pub fn hardware_disable(&self) -> AxResult {
        match self.arch.lock().as_mut() {
            Some(arch) => arch.hardware_disable(),
            None => ax_err!(BadState, "per-CPU state is not initialized"),
        }
    }

    /// Pool index of the vcpu loaded on this CPU.
    pub fn loaded(&self) -> Option<usize> {
        match self.loaded.load(Ordering::Acquire) {
            NO_VCPU => None,
            index => Some(index),
        }
    }

    /// Records `index` as the loaded vcpu. Fails with the index of the vcpu
    /// already loaded, if it is a different one.
    pub(crate) fn claim(&self, index: usize) -> Result<(), usize> {
        match self
            .loaded
            .compare_exchange(NO_VCPU, index, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(current) if current == index => Ok(()),
            Err(current) => Err(current),
        }
    }

    /// Clears the loaded vcpu if it is `index`.
    pub(crate) fn release(&self, index: usize) {
        let _ = self
            .loaded
            .compare_exchange(index, NO_VCPU, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Whether this CPU is running a vmexit handler.
    pub fn is_dispatching(&self) -> bool {
        self.in_dispatch.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dispatching(&self, dispatching: bool) {
        self.in_dispatch.store(dispatching, Ordering::Relaxed);
    }
}

impl<A: AxArchPerCpu> Drop for AxPerCpu<A> {
    fn drop(&mut self) {
        if let Some(arch) = self.arch.get_mut() {
            if arch.is_enabled() {
                if let Err(err) = arch.hardware_disable() {
                    warn!("failed to disable virtualization on cpu {}: {:?}", self.cpu_id, err);
                }
            }
        }
    }
}
