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

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::thread;

use axerrno::{AxError, AxResult};

use crate::*;

thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
    static FINI_LOG: RefCell<Vec<VcpuId>> = const { RefCell::new(Vec::new()) };
    static OTHER_CORE: Cell<Option<(VmmResult, VmmResult)>> = const { Cell::new(None) };
}

/// Runs `f` as if on physical CPU `cpu`.
fn on_cpu<T>(cpu: usize, f: impl FnOnce() -> T) -> T {
    let prev = CURRENT_CPU.with(|c| c.replace(cpu));
    let ret = f();
    CURRENT_CPU.with(|c| c.set(prev));
    ret
}

struct MockHal;

impl AxVmmHal for MockHal {
    type VCpu = MockArchVCpu;
    type PerCpu = MockPerCpu;
    type Platform = DirectMapPlatform;

    fn current_cpu() -> usize {
        CURRENT_CPU.with(Cell::get)
    }
}

#[derive(Debug, Default)]
struct MockConfig {
    fail_init: bool,
}

// Mock architecture implementation for testing
#[derive(Debug, Default)]
struct MockArchVCpu {
    ids: Option<(VmId, VcpuId)>,
    regs: [u64; 17],
    exit_controls: ExitCategorySet,
    exit_control_writes: usize,
    /// Results of the next entries; an empty script fails the entry.
    script: VecDeque<VmmResult<ExitInfo>>,
    /// Handler and completion events, in order.
    trace: Vec<&'static str>,
    entries: usize,
    loaded: bool,
    injected: Vec<u8>,
    nmi_pending: bool,
    preemption_timer: u64,
    vpid: bool,
}

impl AxArchVCpu for MockArchVCpu {
    type CreateConfig = MockConfig;

    const SUPPORTED_EXITS: ExitCategorySet =
        ExitCategorySet::all().difference(ExitCategorySet::PREEMPTION_TIMER);

    fn init(&mut self, vm_id: VmId, vcpu_id: VcpuId, config: &MockConfig) -> AxResult {
        if config.fail_init {
            return Err(AxError::BadState);
        }
        self.ids = Some((vm_id, vcpu_id));
        Ok(())
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn load(&mut self) -> AxResult {
        self.loaded = true;
        Ok(())
    }

    fn unload(&mut self) -> AxResult {
        self.loaded = false;
        Ok(())
    }

    fn run(&mut self) -> VmmResult<ExitInfo> {
        self.entries += 1;
        self.script
            .pop_front()
            .unwrap_or(Err(VmmError::EntryFailure { qualification: 0 }))
    }

    fn set_exit_control(&mut self, category: ExitCategory, enabled: bool) {
        self.exit_controls.set(category.flag(), enabled);
        self.exit_control_writes += 1;
    }

    fn advance_instruction_pointer(&mut self, len: u32) {
        self.regs[Gpr::Rip as usize] += len as u64;
    }

    fn execute(&mut self, _exit: &ExitInfo) {
        self.trace.push("execute");
    }

    fn emulate(&mut self, _exit: &ExitInfo, value: u64) {
        self.trace.push("emulate");
        self.regs[Gpr::Rax as usize] = value;
    }

    fn gpr(&self, reg: Gpr) -> u64 {
        self.regs[reg as usize]
    }

    fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.regs[reg as usize] = value;
    }

    fn inject_interrupt(&mut self, vector: u8) {
        self.injected.push(vector);
    }

    fn inject_nmi(&mut self) {
        self.nmi_pending = true;
    }

    fn set_preemption_timer(&mut self, ticks: u64) {
        self.preemption_timer = ticks;
    }

    fn enable_vpid(&mut self) {
        self.vpid = true;
    }
}

struct MockPerCpu {
    enabled: bool,
}

impl AxArchPerCpu for MockPerCpu {
    fn new(_cpu_id: usize) -> AxResult<Self> {
        Ok(Self { enabled: false })
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn hardware_enable(&mut self) -> AxResult {
        self.enabled = true;
        Ok(())
    }

    fn hardware_disable(&mut self) -> AxResult {
        self.enabled = false;
        Ok(())
    }
}

type Monitor = AxMonitor<MockHal>;
type VCpu<'a> = AxVCpu<'a, MockHal>;

fn monitor_with(config: MonitorConfig, arch_config: MockConfig) -> Monitor {
    let platform = DirectMapPlatform::new(
        PlatformInfo {
            late_launch: true,
            ..Default::default()
        },
        0,
    );
    AxMonitor::new(config, arch_config, platform).unwrap()
}

fn monitor() -> Monitor {
    monitor_with(
        MonitorConfig::default().with_capacity(4, 8).with_cpu_count(4),
        MockConfig::default(),
    )
}

fn single_vcpu(monitor: &Monitor) -> VCpu<'_> {
    monitor.make_virtual_machine(1).unwrap().make_vcpu().unwrap()
}

fn record(vcpu: &VCpu<'_>, event: &'static str) {
    vcpu.with_arch_vcpu(|arch| arch.trace.push(event)).unwrap();
}

fn trace(vcpu: &VCpu<'_>) -> Vec<&'static str> {
    vcpu.with_arch_vcpu(|arch| arch.trace.clone()).unwrap()
}

fn script(vcpu: &VCpu<'_>, exit: VmmResult<ExitInfo>) {
    vcpu.with_arch_vcpu(|arch| arch.script.push_back(exit)).unwrap();
}

fn on_category(vcpu: &VCpu<'_>) {
    record(vcpu, "category");
}

fn on_replaced(vcpu: &VCpu<'_>) {
    record(vcpu, "replaced");
}

fn on_any(vcpu: &VCpu<'_>) {
    record(vcpu, "catch_all");
}

fn on_post(vcpu: &VCpu<'_>) {
    record(vcpu, "post");
}

fn on_init(vcpu: &VCpu<'_>) {
    record(vcpu, "init");
}

fn on_fini(vcpu: &VCpu<'_>) {
    FINI_LOG.with(|log| log.borrow_mut().push(vcpu.id()));
}

fn advance_and_resume(vcpu: &VCpu<'_>) {
    record(vcpu, "resume");
    advance_and_run(vcpu).unwrap();
}

fn hypercall(vcpu: &VCpu<'_>) {
    if vcpu.gpr(Gpr::Rax) == 0xF00D {
        vcpu.set_return_value(0xBEEF);
    }
    vcpu.instruction_pointer_advance();
    vcpu.run().unwrap();
}

fn register_hypercall(vcpu: &VCpu<'_>) {
    vcpu.vmexit_handler_set(ExitCategory::Vmcall, hypercall);
}

fn vmcall(len: u32) -> ExitInfo {
    ExitInfo::new(reason::VMCALL, 0).with_instruction_len(len)
}

fn rdmsr(address: u32) -> ExitInfo {
    ExitInfo::new(reason::RDMSR, 0)
        .with_instruction_len(2)
        .with_detail(ExitDetail::MsrRead { address })
}

fn hlt() -> ExitInfo {
    ExitInfo::new(reason::HLT, 0).with_instruction_len(1)
}

#[test]
fn vm_ids_are_unique_until_pool_exhausted() {
    let monitor = monitor();
    let ids: Vec<VmId> = (0..4)
        .map(|_| monitor.make_virtual_machine(1).unwrap().id_get())
        .collect();
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 4);
    assert_eq!(monitor.vm_count(), 4);
    assert_eq!(
        monitor.make_virtual_machine(1).err(),
        Some(VmmError::PoolExhausted)
    );

    monitor.destroy_virtual_machine(ids[1]).unwrap();
    let reused = monitor.make_virtual_machine(1).unwrap().id_get();
    assert_eq!(reused.index(), ids[1].index());
    assert!(!ids.contains(&reused));
}

#[test]
fn vcpu_slots_are_reserved_per_vm() {
    let monitor = monitor();
    assert_eq!(
        monitor.make_virtual_machine(0).err(),
        Some(VmmError::InvalidVcpuCount)
    );
    assert_eq!(
        monitor.make_virtual_machine(MAX_VCPUS_PER_VM + 1).err(),
        Some(VmmError::InvalidVcpuCount)
    );

    let big = monitor.make_virtual_machine(6).unwrap();
    assert_eq!(
        monitor.make_virtual_machine(3).err(),
        Some(VmmError::PoolExhausted)
    );
    // A failed reservation takes no VM slot.
    assert_eq!(monitor.vm_count(), 1);
    monitor.make_virtual_machine(2).unwrap();
    assert_eq!(monitor.vcpus_available(), 0);

    monitor.destroy_virtual_machine(big.id_get()).unwrap();
    assert_eq!(monitor.vcpus_available(), 6);
}

#[test]
fn vm_creates_at_most_its_reserved_vcpus() {
    let monitor = monitor();
    let vm = monitor.make_virtual_machine(2).unwrap();
    let first = vm.make_vcpu().unwrap().id();
    let second = vm.make_vcpu().unwrap().id();
    assert_ne!(first, second);
    assert_eq!(vm.make_vcpu().err(), Some(VmmError::PoolExhausted));
    assert_eq!(vm.vcpus().as_slice(), &[first, second]);

    monitor.destroy_vcpu(first).unwrap();
    assert_eq!(vm.vcpus().as_slice(), &[second]);
    let third = vm.make_vcpu().unwrap().id();
    assert!(third != first && third != second);
}

#[test]
fn failed_arch_init_gives_everything_back() {
    let monitor = monitor_with(
        MonitorConfig::default().with_capacity(2, 2),
        MockConfig { fail_init: true },
    );
    let vm = monitor.make_virtual_machine(2).unwrap();
    assert_eq!(vm.make_vcpu().err(), Some(VmmError::Arch(AxError::BadState)));
    assert_eq!(vm.make_vcpu().err(), Some(VmmError::Arch(AxError::BadState)));
    // Neither the slots nor the reservations leaked.
    assert_eq!(monitor.vcpu_count(), 0);
    assert!(vm.vcpus().is_empty());
}

#[test]
fn stale_ids_are_rejected() {
    let monitor = monitor();
    let vm = monitor.make_virtual_machine(2).unwrap();
    let vm_id = vm.id_get();
    let vcpu = vm.make_vcpu().unwrap();
    let vcpu_id = vcpu.id();

    monitor.destroy_vcpu(vcpu_id).unwrap();
    assert_eq!(monitor.vcpu(vcpu_id).err(), Some(VmmError::InvalidVcpu));
    assert_eq!(monitor.destroy_vcpu(vcpu_id), Err(VmmError::InvalidVcpu));
    assert_eq!(vcpu.load(), Err(VmmError::InvalidVcpu));

    monitor.destroy_virtual_machine(vm_id).unwrap();
    assert_eq!(monitor.vm(vm_id).err(), Some(VmmError::InvalidVm));
    assert_eq!(monitor.make_vcpu(vm_id).err(), Some(VmmError::InvalidVm));
    assert_eq!(
        monitor.destroy_virtual_machine(vm_id),
        Err(VmmError::InvalidVm)
    );
    assert_eq!(AxError::from(VmmError::InvalidVm), AxError::NotFound);
}

#[test]
fn catch_all_runs_after_category_handler() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    vcpu.load().unwrap();
    vcpu.vmexit_enable(ExitCategory::Rdmsr);
    vcpu.catch_all_handler_set(on_any);

    vcpu.dispatch(rdmsr(0x10));
    assert_eq!(trace(&vcpu), ["catch_all"]);

    vcpu.vmexit_handler_set(ExitCategory::Rdmsr, on_category);
    vcpu.post_vmexit_handler_set(on_post);
    vcpu.dispatch(rdmsr(0x10));
    assert_eq!(trace(&vcpu), ["catch_all", "category", "catch_all", "post"]);
    assert_eq!(vcpu.vmexit_category(), Some(ExitCategory::Rdmsr));
}

#[test]
fn uncategorized_exits_reach_only_the_catch_all() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    vcpu.load().unwrap();
    for category in ExitCategory::ALL {
        vcpu.vmexit_handler_set(category, on_category);
    }
    vcpu.catch_all_handler_set(on_any);

    vcpu.dispatch(hlt());
    assert_eq!(trace(&vcpu), ["catch_all"]);
    assert_eq!(vcpu.vmexit_reason(), reason::HLT);
    assert_eq!(vcpu.vmexit_category(), None);
}

#[test]
fn handler_registration_replaces() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    vcpu.load().unwrap();
    vcpu.vmexit_handler_set(ExitCategory::Cpuid, on_category);
    vcpu.vmexit_handler_set(ExitCategory::Cpuid, on_replaced);

    vcpu.dispatch(ExitInfo::new(reason::CPUID, 0));
    assert_eq!(trace(&vcpu), ["replaced"]);
}

#[test]
fn vcpu_binds_to_one_core() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    on_cpu(0, || vcpu.load()).unwrap();
    assert_eq!(vcpu.state(), VCpuState::Loaded);
    // Loading again on the same core is a no-op.
    on_cpu(0, || vcpu.load()).unwrap();

    assert_eq!(on_cpu(1, || vcpu.load()), Err(VmmError::BindConflict));
    assert_eq!(on_cpu(1, || vcpu.unload()), Err(VmmError::NotLoaded));
    assert_eq!(on_cpu(1, || vcpu.run()), Err(VmmError::NotLoaded));

    on_cpu(0, || vcpu.unload()).unwrap();
    assert_eq!(vcpu.state(), VCpuState::Unloaded);
    on_cpu(1, || vcpu.load()).unwrap();
    assert_eq!(monitor.vcpu_at(1).map(|v| v.id()), Some(vcpu.id()));
    assert!(monitor.vcpu_at(0).is_none());
}

#[test]
fn other_cores_cannot_touch_a_loaded_vcpu() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    vcpu.load().unwrap();
    vcpu.set_gpr(Gpr::Rax, 1);

    on_cpu(1, || {
        vcpu.set_gpr(Gpr::Rax, 2);
        vcpu.vmexit_handler_set(ExitCategory::Cpuid, on_category);
        vcpu.catch_all_handler_set(on_any);
        vcpu.vmexit_enable(ExitCategory::Rdmsr);
        vcpu.dispatch(ExitInfo::new(reason::CPUID, 0));
        assert_eq!(vcpu.gpr(Gpr::Rax), 0);
        assert_eq!(
            vcpu.with_arch_vcpu(|arch| arch.entries).err(),
            Some(VmmError::BindConflict)
        );
        assert_eq!(vcpu.validate_exit_config(), Err(VmmError::BindConflict));
    });

    assert_eq!(vcpu.gpr(Gpr::Rax), 1);
    assert!(!vcpu.vmexit_is_enabled(ExitCategory::Rdmsr));
    assert_eq!(vcpu.vmexit_reason(), 0);
    assert_eq!(vcpu.state(), VCpuState::Loaded);
    // The owning core dispatches, and finds no handler registered.
    vcpu.dispatch(ExitInfo::new(reason::CPUID, 0));
    assert!(trace(&vcpu).is_empty());
    assert_eq!(vcpu.vmexit_reason(), reason::CPUID);

    // Once unloaded, any core may touch it.
    vcpu.unload().unwrap();
    on_cpu(1, || vcpu.set_gpr(Gpr::Rax, 3));
    assert_eq!(vcpu.gpr(Gpr::Rax), 3);
}

#[test]
fn core_holds_one_vcpu() {
    let monitor = monitor();
    let vm = monitor.make_virtual_machine(2).unwrap();
    let first = vm.make_vcpu().unwrap();
    let second = vm.make_vcpu().unwrap();

    first.load().unwrap();
    assert_eq!(second.load(), Err(VmmError::BindConflict));
    assert_eq!(second.state(), VCpuState::Unloaded);
    assert!(!second.with_arch_vcpu(|arch| arch.loaded).unwrap());
    // The failed load left nothing behind on the second vcpu.
    on_cpu(1, || second.load()).unwrap();

    assert_eq!(monitor.destroy_vcpu(first.id()), Err(VmmError::BindConflict));
}

#[test]
fn hypercall_returns_to_guest() {
    let monitor = monitor();
    let vm = monitor.make_virtual_machine(1).unwrap();
    vm.vcpu_init_handler_set(register_hypercall);
    let vcpu = vm.make_vcpu().unwrap();
    vcpu.load().unwrap();
    vcpu.set_gpr(Gpr::Rax, 0xF00D);

    vcpu.dispatch(vmcall(3));
    assert_eq!(vcpu.gpr(Gpr::Rax), 0xBEEF);
    assert_eq!(vcpu.gpr(Gpr::Rip), 3);
    assert_eq!(vcpu.state(), VCpuState::Running);
    // The handler only scheduled the entry.
    assert_eq!(vcpu.with_arch_vcpu(|arch| arch.entries).unwrap(), 0);
}

#[test]
fn run_loop_idles_when_nothing_resumes() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    vcpu.vmexit_handler_set(ExitCategory::Vmcall, advance_and_resume);
    vcpu.catch_all_handler_set(on_any);
    script(&vcpu, Ok(vmcall(3)));
    script(&vcpu, Ok(hlt()));
    vcpu.load().unwrap();

    vcpu.run().unwrap();
    assert_eq!(vcpu.state(), VCpuState::Loaded);
    assert_eq!(vcpu.with_arch_vcpu(|arch| arch.entries).unwrap(), 2);
    assert_eq!(vcpu.gpr(Gpr::Rip), 3);
    assert_eq!(trace(&vcpu), ["resume", "catch_all", "catch_all"]);
    assert!(!monitor.core(0).unwrap().is_dispatching());
}

#[test]
fn entry_failure_is_reported() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    vcpu.vmexit_handler_set(ExitCategory::Vmcall, advance_and_resume);
    script(&vcpu, Ok(vmcall(3)));
    script(&vcpu, Err(VmmError::EntryFailure { qualification: 7 }));
    vcpu.load().unwrap();

    assert_eq!(vcpu.run(), Err(VmmError::EntryFailure { qualification: 7 }));
    assert_eq!(vcpu.state(), VCpuState::Loaded);
    assert_eq!(vcpu.with_arch_vcpu(|arch| arch.entries).unwrap(), 2);
}

#[test]
fn run_requires_load() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    assert_eq!(vcpu.run(), Err(VmmError::NotLoaded));
    assert_eq!(vcpu.unload(), Err(VmmError::NotLoaded));
    assert_eq!(vcpu.with_arch_vcpu(|arch| arch.entries).unwrap(), 0);
}

fn switch_to_sibling(vcpu: &VCpu<'_>) {
    let vm = vcpu.vm().unwrap();
    let sibling = vm.vcpus().into_iter().find(|id| *id != vcpu.id()).unwrap();
    let sibling = vcpu.monitor().vcpu(sibling).unwrap();
    vcpu.unload().unwrap();
    sibling.load().unwrap();
    sibling.run().unwrap();
}

fn register_switch(vcpu: &VCpu<'_>) {
    vcpu.vmexit_handler_set(ExitCategory::Vmcall, switch_to_sibling);
    vcpu.catch_all_handler_set(on_any);
}

#[test]
fn handler_can_resume_another_vcpu() {
    let monitor = monitor();
    let vm = monitor.make_virtual_machine(2).unwrap();
    vm.vcpu_init_handler_set(register_switch);
    let first = vm.make_vcpu().unwrap();
    let second = vm.make_vcpu().unwrap();
    script(&first, Ok(vmcall(3)));
    script(&second, Ok(hlt()));

    first.load().unwrap();
    first.run().unwrap();

    assert_eq!(first.state(), VCpuState::Unloaded);
    assert_eq!(second.state(), VCpuState::Loaded);
    assert_eq!(monitor.vcpu_at(0).map(|v| v.id()), Some(second.id()));
    assert_eq!(first.with_arch_vcpu(|arch| arch.entries).unwrap(), 1);
    assert_eq!(second.with_arch_vcpu(|arch| arch.entries).unwrap(), 1);
    assert_eq!(trace(&second), ["catch_all"]);
}

#[test]
fn lifecycle_handlers_run_once_and_are_not_retroactive() {
    let monitor = monitor();
    let vm = monitor.make_virtual_machine(3).unwrap();
    let early = vm.make_vcpu().unwrap();
    vm.vcpu_init_handler_set(on_init);
    let late = vm.make_vcpu().unwrap();
    assert!(trace(&early).is_empty());
    assert_eq!(trace(&late), ["init"]);

    FINI_LOG.with(|log| log.borrow_mut().clear());
    vm.vcpu_fini_handler_set(on_fini);
    let loaded = vm.make_vcpu().unwrap();
    loaded.load().unwrap();
    assert_eq!(monitor.destroy_vcpu(loaded.id()), Err(VmmError::BindConflict));
    loaded.unload().unwrap();

    monitor.destroy_vcpu(late.id()).unwrap();
    FINI_LOG.with(|log| assert_eq!(*log.borrow(), [late.id()]));

    monitor.destroy_virtual_machine(vm.id_get()).unwrap();
    FINI_LOG.with(|log| assert_eq!(*log.borrow(), [late.id(), early.id(), loaded.id()]));
    assert_eq!(monitor.vcpu_count(), 0);
}

fn contend_from_other_core(vcpu: &VCpu<'_>) {
    let results = on_cpu(1, || (vcpu.load(), vcpu.with_arch_vcpu(|_| ())));
    OTHER_CORE.with(|c| c.set(Some(results)));
}

#[test]
fn vcpu_is_held_until_init_handler_returns() {
    let monitor = monitor();
    let vm = monitor.make_virtual_machine(1).unwrap();
    vm.vcpu_init_handler_set(contend_from_other_core);
    let vcpu = vm.make_vcpu().unwrap();

    assert_eq!(
        OTHER_CORE.with(Cell::take),
        Some((Err(VmmError::BindConflict), Err(VmmError::BindConflict)))
    );
    assert!(monitor.vcpu_at(1).is_none());
    on_cpu(1, || vcpu.load()).unwrap();
    on_cpu(1, || vcpu.unload()).unwrap();
}

#[test]
fn vcpu_is_held_while_fini_handler_runs() {
    let monitor = monitor();
    let vm = monitor.make_virtual_machine(1).unwrap();
    vm.vcpu_fini_handler_set(contend_from_other_core);
    let vcpu = vm.make_vcpu().unwrap();
    monitor.destroy_vcpu(vcpu.id()).unwrap();

    let (load, access) = OTHER_CORE.with(Cell::take).unwrap();
    assert!(load.is_err());
    assert_eq!(access, Err(VmmError::BindConflict));
    assert!(monitor.vcpu_at(1).is_none());
    assert_eq!(monitor.vcpu_count(), 0);
}

#[test]
fn destroy_never_races_a_load() {
    let monitor = monitor();
    let id = single_vcpu(&monitor).id();
    thread::scope(|s| {
        let monitor = &monitor;
        s.spawn(move || {
            on_cpu(1, || {
                for _ in 0..1000 {
                    let Ok(vcpu) = monitor.vcpu(id) else {
                        break;
                    };
                    match vcpu.load() {
                        Ok(()) => assert_eq!(vcpu.unload(), Ok(())),
                        Err(VmmError::BindConflict | VmmError::InvalidVcpu) => {}
                        Err(err) => panic!("unexpected load failure: {err}"),
                    }
                }
            })
        });
        s.spawn(move || {
            on_cpu(0, || loop {
                match monitor.destroy_vcpu(id) {
                    Ok(()) => break,
                    Err(VmmError::BindConflict) => thread::yield_now(),
                    Err(err) => panic!("unexpected destroy failure: {err}"),
                }
            })
        });
    });

    assert_eq!(monitor.vcpu(id).err(), Some(VmmError::InvalidVcpu));
    assert!(monitor.vcpu_at(1).is_none());
    assert_eq!(monitor.vcpu_count(), 0);
}

fn emulate_then_execute(vcpu: &VCpu<'_>) {
    vcpu.vmexit_emulate(0x1234);
    vcpu.vmexit_execute();
}

#[test]
fn first_completion_wins() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    vcpu.load().unwrap();
    vcpu.vmexit_enable(ExitCategory::Rdmsr);

    // A handler that chooses neither is observable.
    vcpu.dispatch(rdmsr(0x1b));
    assert_eq!(vcpu.vmexit_resolution(), ExitResolution::Pending);

    vcpu.vmexit_handler_set(ExitCategory::Rdmsr, emulate_then_execute);
    vcpu.dispatch(rdmsr(0x1b));
    assert_eq!(vcpu.vmexit_resolution(), ExitResolution::Emulated(0x1234));
    assert_eq!(trace(&vcpu), ["emulate"]);
    assert_eq!(vcpu.gpr(Gpr::Rax), 0x1234);
    assert_eq!(vcpu.msr_address(), 0x1b);

    // Every vmexit starts pending again.
    vcpu.dispatch(rdmsr(0x1b));
    assert_eq!(vcpu.vmexit_resolution(), ExitResolution::Emulated(0x1234));
    assert_eq!(trace(&vcpu), ["emulate", "emulate"]);
}

#[test]
fn exit_controls_are_idempotent() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    let writes = || vcpu.with_arch_vcpu(|arch| arch.exit_control_writes).unwrap();

    vcpu.vmexit_enable(ExitCategory::Rdmsr);
    vcpu.vmexit_enable(ExitCategory::Rdmsr);
    assert!(vcpu.vmexit_is_enabled(ExitCategory::Rdmsr));
    assert_eq!(writes(), 1);
    vcpu.vmexit_disable(ExitCategory::Rdmsr);
    vcpu.vmexit_disable(ExitCategory::Rdmsr);
    assert!(!vcpu.vmexit_is_enabled(ExitCategory::Rdmsr));
    assert_eq!(writes(), 2);

    // Unconditional categories are always on.
    assert!(vcpu.vmexit_is_enabled(ExitCategory::Cpuid));
    vcpu.vmexit_enable(ExitCategory::Cpuid);
    vcpu.vmexit_disable(ExitCategory::Cpuid);
    assert!(vcpu.vmexit_is_enabled(ExitCategory::Cpuid));
    assert_eq!(writes(), 2);

    // The mock backend has no preemption timer.
    vcpu.vmexit_enable(ExitCategory::PreemptionTimer);
    assert!(!vcpu.vmexit_is_enabled(ExitCategory::PreemptionTimer));
    assert_eq!(writes(), 2);
    assert!(vcpu
        .with_arch_vcpu(|arch| arch.exit_controls)
        .unwrap()
        .is_empty());
}

#[test]
fn missing_handlers_are_reported() {
    let monitor = monitor();
    let vm = monitor.make_virtual_machine(2).unwrap();

    let vcpu = vm.make_vcpu().unwrap();
    assert_eq!(
        vcpu.validate_exit_config(),
        Err(VmmError::MissingHandler(ExitCategory::InitSignal))
    );
    vcpu.catch_all_handler_set(on_any);
    assert_eq!(vcpu.validate_exit_config(), Ok(()));

    let vcpu = vm.make_vcpu().unwrap();
    for category in ExitCategorySet::UNCONDITIONAL.categories() {
        vcpu.vmexit_handler_set(category, on_category);
    }
    assert_eq!(vcpu.validate_exit_config(), Ok(()));
    vcpu.vmexit_enable(ExitCategory::Wrmsr);
    assert_eq!(
        vcpu.validate_exit_config(),
        Err(VmmError::MissingHandler(ExitCategory::Wrmsr))
    );
}

fn failing_init(_root: &AxVM<'_, MockHal>, _platform: &DirectMapPlatform) -> AxResult {
    Err(AxError::BadState)
}

#[test]
fn bring_up_happens_once() {
    let monitor = monitor();
    assert_eq!(
        monitor.bring_up(failing_init).err(),
        Some(VmmError::BringUpFailed(AxError::BadState))
    );
    assert_eq!(monitor.root_vm(), None);
    assert_eq!(monitor.vm_count(), 0);
    assert_eq!(monitor.vcpus_available(), 8);

    let root = monitor
        .bring_up(|root, platform| {
            assert!(platform.loader_is_late_launch());
            assert_eq!(root.vcpu_count(), 4);
            Ok(())
        })
        .unwrap();
    assert!(root.is_root_vm());
    assert_eq!(monitor.root_vm(), Some(root.id_get()));
    assert_eq!(
        monitor.bring_up(|_, _| Ok(())).err(),
        Some(VmmError::BringUpFailed(AxError::AlreadyExists))
    );
    assert!(monitor.platform_instance().acpi_rsdp().is_none());
}

fn snapshot_roles(vcpu: &VCpu<'_>) -> (bool, bool) {
    (vcpu.is_bootstrap_vcpu(), vcpu.is_root_vcpu())
}

#[test]
fn role_flags_are_fixed_at_creation() {
    let monitor = monitor();
    let root = monitor.bring_up(|_, _| Ok(())).unwrap();
    let guest = monitor.make_virtual_machine(1).unwrap();

    let bsp = on_cpu(0, || root.make_vcpu()).unwrap();
    let ap = on_cpu(1, || root.make_vcpu()).unwrap();
    let guest_vcpu = on_cpu(0, || guest.make_vcpu()).unwrap();
    assert_eq!(snapshot_roles(&bsp), (true, true));
    assert_eq!(snapshot_roles(&ap), (false, true));
    assert_eq!(snapshot_roles(&guest_vcpu), (false, false));
    assert!(!guest.is_root_vm());

    for vcpu in [bsp, ap, guest_vcpu] {
        let before = snapshot_roles(&vcpu);
        on_cpu(2, || {
            vcpu.load().unwrap();
            vcpu.vmexit_enable(ExitCategory::Wrmsr);
            vcpu.vmexit_handler_set(ExitCategory::Cpuid, on_category);
            vcpu.dispatch(ExitInfo::new(reason::CPUID, 0));
            vcpu.vmexit_execute();
            vcpu.instruction_pointer_advance();
            vcpu.unload().unwrap();
        });
        assert_eq!(snapshot_roles(&vcpu), before);
    }
}

fn prepare_root_vcpu(vcpu: &VCpu<'_>) {
    vcpu.catch_all_handler_set(on_any);
    script(vcpu, Ok(hlt()));
}

#[test]
fn cores_start_and_stop() {
    let monitor = monitor();
    assert_eq!(on_cpu(1, || monitor.start_core()), Err(VmmError::InvalidVm));

    monitor
        .bring_up(|root, _| {
            root.vcpu_init_handler_set(prepare_root_vcpu);
            Ok(())
        })
        .unwrap();

    on_cpu(1, || monitor.start_core()).unwrap();
    let core = monitor.core(1).unwrap();
    assert!(core.is_enabled());
    let vcpu = monitor.vcpu_at(1).unwrap();
    assert!(vcpu.is_root_vcpu());
    assert!(!vcpu.is_bootstrap_vcpu());
    assert_eq!(vcpu.state(), VCpuState::Loaded);
    assert_eq!(on_cpu(1, || trace(&vcpu)), ["catch_all"]);

    on_cpu(1, || monitor.stop_core()).unwrap();
    assert!(!core.is_enabled());
    assert!(monitor.vcpu_at(1).is_none());
    assert_eq!(monitor.vcpu_count(), 0);

    // The root vcpu reservation came back with the destroyed vcpu.
    on_cpu(1, || monitor.start_core()).unwrap();
    assert_eq!(monitor.vcpu_count(), 1);
    assert_eq!(
        monitor.core(64).err(),
        Some(VmmError::Arch(AxError::InvalidInput))
    );
}

#[test]
fn start_core_refuses_a_busy_core() {
    let monitor = monitor();
    let root = monitor
        .bring_up(|root, _| {
            root.vcpu_init_handler_set(prepare_root_vcpu);
            Ok(())
        })
        .unwrap()
        .id_get();
    on_cpu(1, || monitor.start_core()).unwrap();
    let core = monitor.core(1).unwrap();
    let vcpu = monitor.vcpu_at(1).unwrap();

    assert_eq!(on_cpu(1, || monitor.start_core()), Err(VmmError::BindConflict));
    assert!(core.is_enabled());
    assert_eq!(monitor.vcpu_at(1).map(|v| v.id()), Some(vcpu.id()));
    assert_eq!(vcpu.state(), VCpuState::Loaded);
    assert_eq!(monitor.vcpu_count(), 1);

    // A failure on a core that was already enabled leaves it enabled.
    on_cpu(1, || vcpu.unload()).unwrap();
    for cpu in [0, 2, 3] {
        on_cpu(cpu, || monitor.make_vcpu(root)).unwrap();
    }
    assert_eq!(on_cpu(1, || monitor.start_core()), Err(VmmError::PoolExhausted));
    assert!(core.is_enabled());
    assert!(monitor.vcpu_at(1).is_none());
}

#[test]
fn concurrent_creation_never_aliases() {
    let monitor = monitor_with(
        MonitorConfig::default().with_cpu_count(8),
        MockConfig::default(),
    );
    let per_thread: Vec<Vec<VcpuId>> = thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|cpu| {
                let monitor = &monitor;
                s.spawn(move || {
                    on_cpu(cpu, || {
                        let mut ids = Vec::new();
                        for _ in 0..8 {
                            let vm = monitor.make_virtual_machine(2).unwrap();
                            ids.push(vm.make_vcpu().unwrap().id());
                            ids.push(vm.make_vcpu().unwrap().id());
                        }
                        ids
                    })
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let all: HashSet<VcpuId> = per_thread.into_iter().flatten().collect();
    assert_eq!(all.len(), 128);
    assert_eq!(all.iter().map(|id| id.index()).collect::<HashSet<_>>().len(), 128);
    assert_eq!(monitor.vm_count(), 64);
    assert_eq!(
        monitor.make_virtual_machine(1).err(),
        Some(VmmError::PoolExhausted)
    );
}

fn answer_hypervisor_leaf(vcpu: &VCpu<'_>) {
    if vcpu.cpuid_leaf() == 0x4000_0000 {
        vcpu.vmexit_emulate(vcpu.cpuid_subleaf() as u64 + 1);
    } else {
        vcpu.vmexit_execute();
    }
}

#[test]
fn category_accessors_read_the_current_exit() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    vcpu.load().unwrap();
    vcpu.vmexit_handler_set(ExitCategory::Cpuid, answer_hypervisor_leaf);

    let cpuid = |leaf, subleaf| {
        ExitInfo::new(reason::CPUID, 0).with_detail(ExitDetail::Cpuid { leaf, subleaf })
    };
    vcpu.dispatch(cpuid(0x4000_0000, 4));
    assert_eq!(vcpu.gpr(Gpr::Rax), 5);
    vcpu.dispatch(cpuid(0, 0));
    assert_eq!(vcpu.vmexit_resolution(), ExitResolution::Executed);

    vcpu.dispatch(ExitInfo::new(reason::IO_INSTRUCTION, 0).with_detail(ExitDetail::Io {
        port: 0x3f8,
        size: 1,
        is_write: true,
        value: 0x41,
    }));
    assert_eq!(vcpu.io_port_number(), 0x3f8);
    assert_eq!(vcpu.io_size(), 1);
    assert!(vcpu.io_is_write());
    assert_eq!(vcpu.io_value(), 0x41);
    // Accessors of another category read as zero.
    assert_eq!(vcpu.cpuid_leaf(), 0);

    vcpu.dispatch(
        ExitInfo::new(reason::CR_ACCESS, 0x04)
            .with_detail(ExitDetail::RegisterWrite { value: 0x2020 }),
    );
    assert_eq!(vcpu.vmexit_category(), Some(ExitCategory::Cr4Write));
    assert_eq!(vcpu.register_write_value(), 0x2020);
}

#[test]
fn injection_reaches_the_backend() {
    let monitor = monitor();
    let vcpu = single_vcpu(&monitor);
    vcpu.load().unwrap();
    vcpu.interrupt_inject(0x20);
    vcpu.nmi_inject();
    vcpu.preemption_timer_set(1000);
    vcpu.vpid_enable();
    vcpu.with_arch_vcpu(|arch| {
        assert_eq!(arch.injected, [0x20]);
        assert!(arch.nmi_pending);
        assert_eq!(arch.preemption_timer, 1000);
        assert!(arch.vpid);
        assert_eq!(arch.ids.map(|(_, id)| id), Some(vcpu.id()));
    })
    .unwrap();
}
