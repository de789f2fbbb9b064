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

use alloc::boxed::Box;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use axerrno::{AxError, AxResult};

use crate::capability::{Execute, Property, VcpuLifecycle};
use crate::pool::{Pool, VcpuId, VmId};
use crate::vcpu::VCpuSlot;
use crate::vm::VmSlot;
use crate::{
    AxArchVCpu, AxPerCpu, AxVCpu, AxVM, AxVmmHal, MonitorConfig, VCpuState, VmmError, VmmResult,
};

/// The monitor instance: the VM and vcpu pools, the per-CPU state of every
/// physical CPU, and the platform.
///
/// Every slot is constructed up front in [`AxMonitor::new`]; creating and
/// destroying VMs and vcpus afterwards never allocates.
///
/// The monitor is shared by reference between physical CPUs. VMs and vcpus are
/// handed out as views borrowing it ([`AxVM`], [`AxVCpu`]) and referred to by
/// id ([`VmId`], [`VcpuId`]) everywhere else.
pub struct AxMonitor<H: AxVmmHal> {
    config: MonitorConfig,
    arch_config: <H::VCpu as AxArchVCpu>::CreateConfig,
    platform: H::Platform,
    vms: Pool<VmSlot<H>>,
    vcpus: Pool<VCpuSlot<H>>,
    cores: Box<[AxPerCpu<H::PerCpu>]>,
    /// vcpu slots promised to live VMs.
    vcpus_reserved: AtomicUsize,
    /// Raw id of the root VM, 0 if there is none.
    root_vm: AtomicU64,
    brought_up: AtomicBool,
    bootstrap_assigned: AtomicBool,
    _hal: PhantomData<fn() -> H>,
}

impl<H: AxVmmHal> AxMonitor<H> {
    /// Creates a monitor sized by `config`.
    ///
    /// `arch_config` is passed to [`AxArchVCpu::init`] for every vcpu.
    pub fn new(
        config: MonitorConfig,
        arch_config: <H::VCpu as AxArchVCpu>::CreateConfig,
        platform: H::Platform,
    ) -> AxResult<Self> {
        config.validate()?;
        debug!(
            "creating monitor: {} VM slots, {} vcpu slots, {} cpus",
            config.vm_capacity, config.vcpu_capacity, config.cpu_count
        );
        Ok(Self {
            config,
            arch_config,
            platform,
            vms: Pool::new(config.vm_capacity, |_| VmSlot::new()),
            vcpus: Pool::new(config.vcpu_capacity, |_| VCpuSlot::new()),
            cores: (0..config.cpu_count).map(AxPerCpu::new_uninit).collect(),
            vcpus_reserved: AtomicUsize::new(0),
            root_vm: AtomicU64::new(0),
            brought_up: AtomicBool::new(false),
            bootstrap_assigned: AtomicBool::new(false),
            _hal: PhantomData,
        })
    }

    /// The sizing of the monitor.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The platform the monitor runs on.
    pub fn platform_instance(&self) -> &H::Platform {
        &self.platform
    }

    /// Number of live VMs.
    pub fn vm_count(&self) -> usize {
        self.vms.live()
    }

    /// Number of live vcpus.
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.live()
    }

    /// Number of vcpu slots not reserved by any VM.
    pub fn vcpus_available(&self) -> usize {
        self.vcpus.capacity() - self.vcpus_reserved.load(Ordering::Acquire)
    }

    /// Creates a VM and reserves `vcpu_count` vcpu slots for it.
    pub fn make_virtual_machine(&self, vcpu_count: usize) -> VmmResult<AxVM<'_, H>> {
        if vcpu_count == 0 || vcpu_count > self.config.max_vcpus_per_vm {
            return Err(VmmError::InvalidVcpuCount);
        }
        let capacity = self.vcpus.capacity();
        if self
            .vcpus_reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                (reserved + vcpu_count <= capacity).then_some(reserved + vcpu_count)
            })
            .is_err()
        {
            debug!("cannot reserve {} vcpus", vcpu_count);
            return Err(VmmError::PoolExhausted);
        }
        let Some(claim) = self.vms.claim() else {
            self.vcpus_reserved.fetch_sub(vcpu_count, Ordering::AcqRel);
            debug!("VM pool exhausted");
            return Err(VmmError::PoolExhausted);
        };
        let slot = self.vms.claimed(&claim);
        slot.prepare(vcpu_count);
        let id = VmId::from_raw(claim.id);
        self.vms.commit(claim);
        debug!("{} created with {} vcpus", id, vcpu_count);
        Ok(AxVM::new(self, slot, id))
    }

    /// Looks up a live VM.
    pub fn vm(&self, id: VmId) -> VmmResult<AxVM<'_, H>> {
        self.vms
            .get(id.as_u64())
            .map(|slot| AxVM::new(self, slot, id))
            .ok_or(VmmError::InvalidVm)
    }

    /// Destroys a VM, and every vcpu of it that is still alive.
    ///
    /// Fails with [`VmmError::BindConflict`] if one of its vcpus is loaded; the
    /// vcpus destroyed before stay destroyed.
    pub fn destroy_virtual_machine(&self, id: VmId) -> VmmResult {
        let slot = self.vms.get(id.as_u64()).ok_or(VmmError::InvalidVm)?;
        for vcpu in slot.vcpus() {
            match self.destroy_vcpu(vcpu) {
                Ok(()) | Err(VmmError::InvalidVcpu) => {}
                Err(err) => return Err(err),
            }
        }
        let vcpu_count = slot.vcpu_count();
        if !self.vms.release(id.as_u64(), |_| {}) {
            return Err(VmmError::InvalidVm);
        }
        self.vcpus_reserved.fetch_sub(vcpu_count, Ordering::AcqRel);
        let _ = self
            .root_vm
            .compare_exchange(id.as_u64(), 0, Ordering::AcqRel, Ordering::Acquire);
        debug!("{} destroyed", id);
        Ok(())
    }

    /// Creates one of the vcpus reserved for the VM `vm_id`.
    ///
    /// The new vcpu is marked as the bootstrap vcpu if it is the first one
    /// created on the bootstrap CPU, and as a root vcpu if `vm_id` is the root
    /// VM. The VM's init handler, if any, runs on the calling CPU before this
    /// returns; until then, no other CPU can load or access the vcpu.
    pub fn make_vcpu(&self, vm_id: VmId) -> VmmResult<AxVCpu<'_, H>> {
        let cpu = H::current_cpu();
        let vm = self.vms.get(vm_id.as_u64()).ok_or(VmmError::InvalidVm)?;
        if !vm.consume_reservation() {
            debug!("{} already created its {} vcpus", vm_id, vm.vcpu_count());
            return Err(VmmError::PoolExhausted);
        }
        let Some(claim) = self.vcpus.claim() else {
            vm.restore_reservation();
            return Err(VmmError::PoolExhausted);
        };
        let slot = self.vcpus.claimed(&claim);
        let id = VcpuId::from_raw(claim.id);
        if let Err(err) = slot.prepare(vm_id, id, cpu, &self.arch_config) {
            warn!("failed to initialize {}: {}", id, err);
            slot.clear();
            self.vcpus.abort(claim);
            vm.restore_reservation();
            return Err(err);
        }

        let root = self.root_vm() == Some(vm_id);
        let bootstrap = cpu == self.config.bootstrap_cpu
            && self
                .bootstrap_assigned
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        slot.set_roles(bootstrap, root);
        self.vcpus.commit(claim);
        vm.add_vcpu(id);
        debug!("{} created in {} (bootstrap: {}, root: {})", id, vm_id, bootstrap, root);

        let vcpu = AxVCpu::new(self, slot, id);
        if let Some(init) = vm.init_handler() {
            init(&vcpu);
        }
        slot.finish_setup();
        Ok(vcpu)
    }

    /// Looks up a live vcpu.
    pub fn vcpu(&self, id: VcpuId) -> VmmResult<AxVCpu<'_, H>> {
        self.vcpus
            .get(id.as_u64())
            .map(|slot| AxVCpu::new(self, slot, id))
            .ok_or(VmmError::InvalidVcpu)
    }

    /// Destroys an unloaded vcpu. The fini handler of its VM runs on the
    /// calling CPU before the slot is given back.
    ///
    /// Fails with [`VmmError::BindConflict`] if the vcpu is loaded, or is being
    /// created, destroyed or accessed by another CPU.
    pub fn destroy_vcpu(&self, id: VcpuId) -> VmmResult {
        let slot = self.vcpus.get(id.as_u64()).ok_or(VmmError::InvalidVcpu)?;
        let cpu = H::current_cpu();
        if !slot.hold(cpu) {
            return Err(if self.vcpus.get(id.as_u64()).is_some() {
                VmmError::BindConflict
            } else {
                VmmError::InvalidVcpu
            });
        }
        let vm_id = AxVCpu::new(self, slot, id).vm_id();
        let vm = self.vms.get(vm_id.as_u64());
        let fini = vm.and_then(VmSlot::fini_handler);
        let released = self.vcpus.release(id.as_u64(), |slot| {
            if let Some(fini) = fini {
                fini(&AxVCpu::new(self, slot, id));
            }
            slot.clear();
        });
        if !released {
            // The vcpu was destroyed before the hold was taken.
            slot.unhold(cpu);
            return Err(VmmError::InvalidVcpu);
        }
        if let Some(vm) = vm {
            vm.remove_vcpu(id);
            vm.restore_reservation();
        }
        debug!("{} destroyed", id);
        Ok(())
    }

    /// The root VM, once [`AxMonitor::bring_up`] succeeded.
    pub fn root_vm(&self) -> Option<VmId> {
        match self.root_vm.load(Ordering::Acquire) {
            0 => None,
            raw => Some(VmId::from_raw(raw)),
        }
    }

    /// Creates the root VM, with one vcpu reserved per physical CPU, and hands
    /// it to `init` together with the platform.
    ///
    /// `init` typically registers the vcpu init handler of the root VM. If it
    /// fails, the root VM is destroyed and bring-up may be attempted again.
    /// Bring-up succeeds at most once per monitor.
    pub fn bring_up<F>(&self, init: F) -> VmmResult<AxVM<'_, H>>
    where
        F: FnOnce(&AxVM<'_, H>, &H::Platform) -> AxResult,
    {
        if self.brought_up.swap(true, Ordering::AcqRel) {
            warn!("monitor is already brought up");
            return Err(VmmError::BringUpFailed(AxError::AlreadyExists));
        }
        let root_vcpus = self.config.cpu_count.min(self.config.max_vcpus_per_vm);
        let root = match self.make_virtual_machine(root_vcpus) {
            Ok(root) => root,
            Err(err) => {
                self.brought_up.store(false, Ordering::Release);
                return Err(err);
            }
        };
        let root_id = root.id_get();
        self.root_vm.store(root_id.as_u64(), Ordering::Release);

        if let Err(err) = init(&root, &self.platform) {
            error!("bring-up failed: {:?}", err);
            if let Err(cleanup) = self.destroy_virtual_machine(root_id) {
                warn!("failed to destroy root {}: {}", root_id, cleanup);
            }
            self.root_vm.store(0, Ordering::Release);
            self.brought_up.store(false, Ordering::Release);
            return Err(VmmError::BringUpFailed(err));
        }
        info!("monitor brought up, root {}", root_id);
        Ok(root)
    }

    /// Starts virtualization on the calling physical CPU.
    ///
    /// Enables hardware virtualization, creates the root vcpu of this CPU (which
    /// runs the root VM's init handler), loads it and runs it until the CPU goes
    /// idle.
    ///
    /// Fails with [`VmmError::BindConflict`], leaving the CPU untouched, if a
    /// vcpu is already loaded on it. On any other failure, hardware
    /// virtualization is turned off again only if this call turned it on.
    pub fn start_core(&self) -> VmmResult {
        let cpu = H::current_cpu();
        let core = self.core(cpu)?;
        let root = self.root_vm().ok_or(VmmError::InvalidVm)?;
        if let Some(index) = core.loaded() {
            debug!("cpu {} already runs vcpu slot {}", cpu, index);
            return Err(VmmError::BindConflict);
        }
        if !core.is_initialized() {
            core.init()?;
        }
        let enabled_here = !core.is_enabled();
        if enabled_here {
            core.hardware_enable()?;
            info!("virtualization enabled on cpu {}", cpu);
        }

        let vcpu = match self.make_vcpu(root) {
            Ok(vcpu) => vcpu,
            Err(err) => {
                if enabled_here {
                    self.disable_core(core);
                }
                return Err(err);
            }
        };
        if let Err(err) = vcpu.load() {
            if let Err(cleanup) = self.destroy_vcpu(vcpu.id()) {
                warn!("failed to destroy {}: {}", vcpu.id(), cleanup);
            }
            if enabled_here {
                self.disable_core(core);
            }
            return Err(err);
        }
        vcpu.run()
    }

    /// Stops virtualization on the calling physical CPU.
    ///
    /// Unloads the vcpu loaded on this CPU, destroys it if it is a root vcpu, and
    /// disables hardware virtualization.
    pub fn stop_core(&self) -> VmmResult {
        let cpu = H::current_cpu();
        let core = self.core(cpu)?;
        if let Some(vcpu) = self.vcpu_at(cpu) {
            vcpu.unload()?;
            if vcpu.is_root_vcpu() {
                self.destroy_vcpu(vcpu.id())?;
            }
        }
        if core.is_enabled() {
            core.hardware_disable()?;
        }
        info!("virtualization disabled on cpu {}", cpu);
        Ok(())
    }

    fn disable_core(&self, core: &AxPerCpu<H::PerCpu>) {
        if let Err(err) = core.hardware_disable() {
            warn!("failed to disable virtualization on cpu {}: {:?}", core.cpu_id(), err);
        }
    }

    /// The per-CPU state of physical CPU `cpu`.
    pub fn core(&self, cpu: usize) -> VmmResult<&AxPerCpu<H::PerCpu>> {
        self.cores
            .get(cpu)
            .ok_or(VmmError::Arch(AxError::InvalidInput))
    }

    /// The vcpu loaded on physical CPU `cpu`.
    pub fn vcpu_at(&self, cpu: usize) -> Option<AxVCpu<'_, H>> {
        let index = self.cores.get(cpu)?.loaded()?;
        let (id, slot) = self.vcpus.get_index(index)?;
        Some(AxVCpu::new(self, slot, VcpuId::from_raw(id)))
    }

    /// The dispatch loop of a physical CPU: enters whichever vcpu is loaded and
    /// marked running, and dispatches its vmexit, until no vcpu is left running.
    pub(crate) fn run_loop(&self, core: &AxPerCpu<H::PerCpu>) -> VmmResult {
        while let Some(vcpu) = self.vcpu_at(core.cpu_id()) {
            if vcpu.state() != VCpuState::Running {
                break;
            }
            let exit = vcpu.enter()?;
            vcpu.dispatch(exit);
        }
        trace!("cpu {} is idle", core.cpu_id());
        Ok(())
    }
}
