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

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::capability::VcpuLifecycle;
use crate::config::MAX_VCPUS_PER_VM;
use crate::pool::{VcpuId, VmId};
use crate::{AxMonitor, AxVCpu, AxVmmHal, VmmResult};

/// A handler invoked once per vcpu of a VM, on creation or destruction.
pub type VCpuLifecycleHandler<H> = fn(&AxVCpu<'_, H>);

/// A pre-constructed VM in the VM pool.
pub(crate) struct VmSlot<H: AxVmmHal> {
    /// Number of vcpus reserved for the VM.
    vcpu_count: AtomicUsize,
    /// Number of reservations held by live vcpus of the VM.
    created: AtomicUsize,
    init_handler: Mutex<Option<VCpuLifecycleHandler<H>>>,
    fini_handler: Mutex<Option<VCpuLifecycleHandler<H>>>,
    vcpus: Mutex<heapless::Vec<VcpuId, MAX_VCPUS_PER_VM>>,
}

impl<H: AxVmmHal> VmSlot<H> {
    pub(crate) const fn new() -> Self {
        Self {
            vcpu_count: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            init_handler: Mutex::new(None),
            fini_handler: Mutex::new(None),
            vcpus: Mutex::new(heapless::Vec::new()),
        }
    }

    /// Prepares a claimed slot for a VM with `vcpu_count` vcpus.
    pub(crate) fn prepare(&self, vcpu_count: usize) {
        self.vcpu_count.store(vcpu_count, Ordering::Relaxed);
        self.created.store(0, Ordering::Relaxed);
        *self.init_handler.lock() = None;
        *self.fini_handler.lock() = None;
        self.vcpus.lock().clear();
    }

    pub(crate) fn vcpu_count(&self) -> usize {
        self.vcpu_count.load(Ordering::Relaxed)
    }

    /// Consumes one reserved vcpu. Fails once all of them were consumed.
    pub(crate) fn consume_reservation(&self) -> bool {
        let limit = self.vcpu_count();
        self.created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                (created < limit).then_some(created + 1)
            })
            .is_ok()
    }

    /// Returns a reservation consumed by a vcpu that was destroyed or could not
    /// be created.
    pub(crate) fn restore_reservation(&self) {
        self.created.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn init_handler(&self) -> Option<VCpuLifecycleHandler<H>> {
        *self.init_handler.lock()
    }

    pub(crate) fn fini_handler(&self) -> Option<VCpuLifecycleHandler<H>> {
        *self.fini_handler.lock()
    }

    pub(crate) fn add_vcpu(&self, id: VcpuId) {
        // Never full: at most `vcpu_count <= MAX_VCPUS_PER_VM` vcpus are created.
        if self.vcpus.lock().push(id).is_err() {
            error!("vcpu set of the VM is full, dropping {}", id);
        }
    }

    pub(crate) fn remove_vcpu(&self, id: VcpuId) {
        self.vcpus.lock().retain(|v| *v != id);
    }

    pub(crate) fn vcpus(&self) -> heapless::Vec<VcpuId, MAX_VCPUS_PER_VM> {
        self.vcpus.lock().clone()
    }
}

/// A virtual machine living in a monitor's VM pool.
///
/// Like [`AxVCpu`], this is a lightweight view; the VM itself stays in the pool
/// until [`AxMonitor::destroy_virtual_machine`].
pub struct AxVM<'a, H: AxVmmHal> {
    monitor: &'a AxMonitor<H>,
    slot: &'a VmSlot<H>,
    id: VmId,
}

impl<H: AxVmmHal> Clone for AxVM<'_, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: AxVmmHal> Copy for AxVM<'_, H> {}

impl<'a, H: AxVmmHal> AxVM<'a, H> {
    pub(crate) fn new(monitor: &'a AxMonitor<H>, slot: &'a VmSlot<H>, id: VmId) -> Self {
        Self { monitor, slot, id }
    }

    /// The monitor owning this VM.
    pub fn monitor(&self) -> &'a AxMonitor<H> {
        self.monitor
    }

    /// Number of vcpus reserved for this VM at creation.
    pub fn vcpu_count(&self) -> usize {
        self.slot.vcpu_count()
    }

    /// Ids of the live vcpus of this VM, in creation order.
    pub fn vcpus(&self) -> heapless::Vec<VcpuId, MAX_VCPUS_PER_VM> {
        self.slot.vcpus()
    }

    /// Whether this is the root VM, the VM of the host.
    pub fn is_root_vm(&self) -> bool {
        self.monitor.root_vm() == Some(self.id)
    }

    /// Creates one of the vcpus reserved for this VM, see [`AxMonitor::make_vcpu`].
    pub fn make_vcpu(&self) -> VmmResult<AxVCpu<'a, H>> {
        self.monitor.make_vcpu(self.id)
    }
}

impl<H: AxVmmHal> VcpuLifecycle for AxVM<'_, H> {
    type Handler = VCpuLifecycleHandler<H>;

    fn id_get(&self) -> VmId {
        self.id
    }

    fn vcpu_init_handler_set(&self, handler: VCpuLifecycleHandler<H>) {
        *self.slot.init_handler.lock() = Some(handler);
    }

    fn vcpu_fini_handler_set(&self, handler: VCpuLifecycleHandler<H>) {
        *self.slot.fini_handler.lock() = Some(handler);
    }
}
