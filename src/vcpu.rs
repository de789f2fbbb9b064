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

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::capability::{Execute, InstructionPointer, Property, VmexitControl, VmexitInfo};
use crate::exit::{ExitCategory, ExitCategorySet, ExitDetail, ExitInfo, ExitResolution};
use crate::pool::{VcpuId, VmId};
use crate::{AxArchVCpu, AxMonitor, AxPerCpu, AxVM, AxVmmHal, Gpr, VmmError, VmmResult};

/// A vmexit handler. It receives the vcpu that exited.
pub type VmexitHandler<H> = fn(&AxVCpu<'_, H>);

/// The state of a virtual CPU.
///
/// `Unloaded → Loaded → Running → Loaded → Unloaded`: a vcpu is `Running` from
/// [`Execute::run`] until its next vmexit, after which it stays `Loaded` unless a
/// handler runs it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VCpuState {
    /// The vcpu is not bound to any physical CPU.
    Unloaded = 0,
    /// The vcpu is bound to a physical CPU and not executing guest code.
    Loaded = 1,
    /// The vcpu is executing guest code, or is scheduled to be re-entered.
    Running = 2,
}

impl VCpuState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Loaded,
            2 => Self::Running,
            _ => Self::Unloaded,
        }
    }
}

const NO_CPU: usize = usize::MAX;
/// Marks an `owner` value as a short-lived hold by that CPU (creation,
/// destruction, or a single access to an unloaded vcpu) rather than a load.
const HELD: usize = 1 << (usize::BITS - 2);
const FLAG_BOOTSTRAP: u8 = 1 << 0;
const FLAG_ROOT: u8 = 1 << 1;

/// The mutable part of a vcpu, owned by the CPU it is loaded on.
struct VCpuControl<H: AxVmmHal> {
    arch: H::VCpu,
    handlers: [Option<VmexitHandler<H>>; ExitCategory::COUNT],
    vmexit_handler: Option<VmexitHandler<H>>,
    post_vmexit_handler: Option<VmexitHandler<H>>,
    /// Conditional categories turned on in the execution controls.
    enabled: ExitCategorySet,
    exit: ExitInfo,
    resolution: ExitResolution,
}

impl<H: AxVmmHal> VCpuControl<H> {
    fn new() -> Self {
        Self {
            arch: H::VCpu::default(),
            handlers: [None; ExitCategory::COUNT],
            vmexit_handler: None,
            post_vmexit_handler: None,
            enabled: ExitCategorySet::empty(),
            exit: ExitInfo::default(),
            resolution: ExitResolution::Pending,
        }
    }

    fn reset(&mut self) {
        self.arch.reset();
        self.handlers = [None; ExitCategory::COUNT];
        self.vmexit_handler = None;
        self.post_vmexit_handler = None;
        self.enabled = ExitCategorySet::empty();
        self.exit = ExitInfo::default();
        self.resolution = ExitResolution::Pending;
    }

    fn active_categories(&self) -> ExitCategorySet {
        self.enabled | (ExitCategorySet::UNCONDITIONAL & H::VCpu::SUPPORTED_EXITS)
    }
}

/// A pre-constructed vcpu in the vcpu pool.
pub(crate) struct VCpuSlot<H: AxVmmHal> {
    vm: AtomicU64,
    flags: AtomicU8,
    state: AtomicU8,
    /// The ownership token for `control`: `NO_CPU`, the CPU the vcpu is loaded
    /// on, or `HELD | cpu` while `cpu` creates, destroys or briefly accesses it.
    owner: AtomicUsize,
    control: UnsafeCell<VCpuControl<H>>,
}

// SAFETY: `control` is only accessed by the CPU holding the `owner` token. The
// remaining fields are atomics.
unsafe impl<H: AxVmmHal> Sync for VCpuSlot<H> {}

impl<H: AxVmmHal> VCpuSlot<H> {
    pub(crate) fn new() -> Self {
        Self {
            vm: AtomicU64::new(0),
            flags: AtomicU8::new(0),
            state: AtomicU8::new(VCpuState::Unloaded as u8),
            owner: AtomicUsize::new(NO_CPU),
            control: UnsafeCell::new(VCpuControl::new()),
        }
    }

    /// Binds a claimed slot to a new vcpu, held by `cpu` until
    /// [`VCpuSlot::finish_setup`]. Must only be called before the slot is published.
    pub(crate) fn prepare(
        &self,
        vm_id: VmId,
        vcpu_id: VcpuId,
        cpu: usize,
        config: &<H::VCpu as AxArchVCpu>::CreateConfig,
    ) -> VmmResult {
        self.vm.store(vm_id.as_u64(), Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.state.store(VCpuState::Unloaded as u8, Ordering::Relaxed);
        self.owner.store(HELD | cpu, Ordering::Relaxed);
        // SAFETY: the slot is claimed but not published, so nobody else can reach it.
        let control = unsafe { &mut *self.control.get() };
        control.reset();
        control.arch.init(vm_id, vcpu_id, config)?;
        Ok(())
    }

    /// Records the role of the vcpu. Must only be called before the slot is published.
    pub(crate) fn set_roles(&self, bootstrap: bool, root: bool) {
        let mut flags = 0;
        if bootstrap {
            flags |= FLAG_BOOTSTRAP;
        }
        if root {
            flags |= FLAG_ROOT;
        }
        self.flags.store(flags, Ordering::Relaxed);
    }

    /// Gives up the hold taken by [`VCpuSlot::prepare`].
    pub(crate) fn finish_setup(&self) {
        self.owner.store(NO_CPU, Ordering::Release);
    }

    /// Takes the hold of an unloaded vcpu for `cpu`. Fails if the vcpu is loaded
    /// or held anywhere.
    pub(crate) fn hold(&self, cpu: usize) -> bool {
        self.owner
            .compare_exchange(NO_CPU, HELD | cpu, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Gives up a hold taken by [`VCpuSlot::hold`].
    pub(crate) fn unhold(&self, cpu: usize) {
        let _ = self.owner.compare_exchange(
            HELD | cpu,
            NO_CPU,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Returns the slot to its empty state and drops any hold. Only called by
    /// the holder of an unpublished slot.
    pub(crate) fn clear(&self) {
        // SAFETY: the slot is unpublished and held by the calling CPU.
        unsafe { &mut *self.control.get() }.reset();
        self.flags.store(0, Ordering::Relaxed);
        self.vm.store(0, Ordering::Relaxed);
        self.owner.store(NO_CPU, Ordering::Release);
    }

    pub(crate) fn state(&self) -> VCpuState {
        VCpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: VCpuState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// A virtual CPU living in a monitor's vcpu pool.
///
/// This is a lightweight view (a pair of references and the id) handed to
/// vmexit handlers and returned by [`AxMonitor::vcpu`]. It implements the
/// capability traits [`Execute`], [`InstructionPointer`], [`VmexitInfo`],
/// [`VmexitControl`] and [`Property`].
///
/// Note that:
/// - Every method that touches the handlers, the exit data or the architecture
///   state only takes effect on the physical CPU the vcpu is loaded on, or on
///   an unloaded vcpu nobody else is creating, destroying or accessing. Other
///   calls are refused with a warning: setters do nothing, getters return a
///   default value and fallible methods return [`VmmError::BindConflict`].
/// - The category-specific accessors (such as [`AxVCpu::cpuid_leaf`]) are only
///   meaningful inside the handler of that category.
pub struct AxVCpu<'a, H: AxVmmHal> {
    monitor: &'a AxMonitor<H>,
    slot: &'a VCpuSlot<H>,
    id: VcpuId,
}

impl<H: AxVmmHal> Clone for AxVCpu<'_, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: AxVmmHal> Copy for AxVCpu<'_, H> {}

impl<'a, H: AxVmmHal> AxVCpu<'a, H> {
    pub(crate) fn new(monitor: &'a AxMonitor<H>, slot: &'a VCpuSlot<H>, id: VcpuId) -> Self {
        Self { monitor, slot, id }
    }

    /// The monitor owning this vcpu.
    pub fn monitor(&self) -> &'a AxMonitor<H> {
        self.monitor
    }

    /// The VM this vcpu belongs to.
    pub fn vm(&self) -> VmmResult<AxVM<'a, H>> {
        self.monitor.vm(self.vm_id())
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.slot.state()
    }

    /// Whether this view still refers to a live vcpu.
    pub fn is_live(&self) -> bool {
        self.monitor.vcpu(self.id).is_ok()
    }

    fn ensure_live(&self) -> VmmResult {
        if self.is_live() {
            Ok(())
        } else {
            Err(VmmError::InvalidVcpu)
        }
    }

    /// Runs `f` on the mutable part of the vcpu if the calling CPU may touch it.
    ///
    /// The CPU the vcpu is loaded on (or that holds it) gets direct access. An
    /// unloaded vcpu is held for the duration of `f`. `f` must not call back
    /// into this vcpu.
    fn access<T>(&self, f: impl FnOnce(&mut VCpuControl<H>) -> T) -> Option<T> {
        let cpu = H::current_cpu();
        let owner = self.slot.owner.load(Ordering::Acquire);
        if owner == cpu || owner == HELD | cpu {
            // SAFETY: the calling CPU holds the token and the reference does not
            // outlive `f`.
            return Some(f(unsafe { &mut *self.slot.control.get() }));
        }
        if owner == NO_CPU && self.slot.hold(cpu) {
            // SAFETY: as above, the hold was just taken.
            let ret = f(unsafe { &mut *self.slot.control.get() });
            self.slot.unhold(cpu);
            return Some(ret);
        }
        warn!("{} is owned by another cpu, refusing access from cpu {}", self.id, cpu);
        None
    }

    /// Execute `f` on the architecture-specific vcpu.
    ///
    /// `f` must not call back into this vcpu. Fails with
    /// [`VmmError::BindConflict`] if another CPU owns the vcpu.
    pub fn with_arch_vcpu<T>(&self, f: impl FnOnce(&mut H::VCpu) -> T) -> VmmResult<T> {
        self.access(|control| f(&mut control.arch))
            .ok_or(VmmError::BindConflict)
    }

    /// Registers the catch-all handler, invoked on every vmexit after the
    /// category handler (if any).
    pub fn catch_all_handler_set(&self, handler: VmexitHandler<H>) {
        self.access(|control| control.vmexit_handler = Some(handler));
    }

    /// Registers the handler invoked on every vmexit after the catch-all handler.
    pub fn post_vmexit_handler_set(&self, handler: VmexitHandler<H>) {
        self.access(|control| control.post_vmexit_handler = Some(handler));
    }

    /// Checks that every category that can cause a vmexit has a handler, or that
    /// a catch-all handler is registered.
    pub fn validate_exit_config(&self) -> VmmResult {
        self.access(|control| {
            if control.vmexit_handler.is_some() {
                return Ok(());
            }
            match control
                .active_categories()
                .categories()
                .find(|category| control.handlers[category.index()].is_none())
            {
                Some(category) => Err(VmmError::MissingHandler(category)),
                None => Ok(()),
            }
        })
        .unwrap_or(Err(VmmError::BindConflict))
    }

    /// Handles a vmexit of this vcpu.
    ///
    /// This is the entry point of the exit path: it records `exit`, invokes the
    /// handler registered for its category, then the catch-all handler, then the
    /// post-vmexit handler. Nothing is resumed implicitly: unless a handler calls
    /// [`Execute::run`], the vcpu stays [`VCpuState::Loaded`] and the physical
    /// CPU goes idle.
    ///
    /// Must be called on the CPU the vcpu is loaded on, otherwise the vmexit is
    /// dropped with a warning.
    pub fn dispatch(&self, exit: ExitInfo) {
        let cpu = H::current_cpu();
        if self.slot.owner.load(Ordering::Acquire) != cpu {
            warn!("{} is not loaded on cpu {}, dropping vmexit {}", self.id, cpu, exit.reason);
            return;
        }
        let category = ExitCategory::resolve(&exit);
        let Some((handler, catch_all, post)) = self.access(|control| {
            control.exit = exit;
            control.resolution = ExitResolution::Pending;
            (
                category.and_then(|category| control.handlers[category.index()]),
                control.vmexit_handler,
                control.post_vmexit_handler,
            )
        }) else {
            return;
        };
        self.slot.set_state(VCpuState::Loaded);

        trace!(
            "{} vmexit reason {} qualification {:#x} ({:?})",
            self.id,
            exit.reason,
            exit.qualification,
            category
        );

        let core = self.monitor.core(cpu).ok();
        let nested = core.is_some_and(AxPerCpu::is_dispatching);
        if let Some(core) = core {
            core.set_dispatching(true);
        }
        if let Some(handler) = handler {
            handler(self);
        }
        if let Some(catch_all) = catch_all {
            catch_all(self);
        }
        if let Some(post) = post {
            post(self);
        }
        if let Some(core) = core {
            core.set_dispatching(nested);
        }
    }

    /// Enters the guest once and returns the vmexit.
    pub(crate) fn enter(&self) -> VmmResult<ExitInfo> {
        match self
            .access(|control| control.arch.run())
            .unwrap_or(Err(VmmError::BindConflict))
        {
            Ok(exit) => Ok(exit),
            Err(err) => {
                self.slot.set_state(VCpuState::Loaded);
                warn!("{} failed to enter: {}", self.id, err);
                Err(err)
            }
        }
    }

    fn exit_detail(&self) -> ExitDetail {
        self.access(|control| control.exit.detail)
            .unwrap_or_default()
    }

    /// The CPUID leaf requested by the guest.
    pub fn cpuid_leaf(&self) -> u32 {
        match self.exit_detail() {
            ExitDetail::Cpuid { leaf, .. } => leaf,
            _ => 0,
        }
    }

    /// The CPUID subleaf requested by the guest.
    pub fn cpuid_subleaf(&self) -> u32 {
        match self.exit_detail() {
            ExitDetail::Cpuid { subleaf, .. } => subleaf,
            _ => 0,
        }
    }

    /// The value the guest attempted to write to CR0, CR3, CR4 or XCR0.
    pub fn register_write_value(&self) -> u64 {
        match self.exit_detail() {
            ExitDetail::RegisterWrite { value } => value,
            _ => 0,
        }
    }

    /// The port of a port I/O vmexit.
    pub fn io_port_number(&self) -> u16 {
        match self.exit_detail() {
            ExitDetail::Io { port, .. } => port,
            _ => 0,
        }
    }

    /// The access size in bytes of a port I/O vmexit.
    pub fn io_size(&self) -> u8 {
        match self.exit_detail() {
            ExitDetail::Io { size, .. } => size,
            _ => 0,
        }
    }

    /// Whether a port I/O vmexit is a write (OUT).
    pub fn io_is_write(&self) -> bool {
        matches!(self.exit_detail(), ExitDetail::Io { is_write: true, .. })
    }

    /// The value written by a port I/O write.
    pub fn io_value(&self) -> u64 {
        match self.exit_detail() {
            ExitDetail::Io { value, .. } => value,
            _ => 0,
        }
    }

    /// The MSR accessed by a RDMSR or WRMSR vmexit.
    pub fn msr_address(&self) -> u32 {
        match self.exit_detail() {
            ExitDetail::MsrRead { address } | ExitDetail::MsrWrite { address, .. } => address,
            _ => 0,
        }
    }

    /// The value written by a WRMSR.
    pub fn msr_value(&self) -> u64 {
        match self.exit_detail() {
            ExitDetail::MsrWrite { value, .. } => value,
            _ => 0,
        }
    }

    /// The vector of an external interrupt or SIPI vmexit.
    pub fn exit_vector(&self) -> u8 {
        match self.exit_detail() {
            ExitDetail::Interrupt { vector } | ExitDetail::Sipi { vector } => vector,
            _ => 0,
        }
    }

    /// Reads a general purpose register.
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.access(|control| control.arch.gpr(reg))
            .unwrap_or_default()
    }

    /// Writes a general purpose register.
    pub fn set_gpr(&self, reg: Gpr, value: u64) {
        self.access(|control| control.arch.set_gpr(reg, value));
    }

    /// Sets the value returned to the guest by a hypercall.
    pub fn set_return_value(&self, value: u64) {
        self.access(|control| control.arch.set_return_value(value));
    }

    /// Injects an external interrupt at the next entry.
    pub fn interrupt_inject(&self, vector: u8) {
        self.access(|control| control.arch.inject_interrupt(vector));
    }

    /// Injects an NMI at the next entry.
    pub fn nmi_inject(&self) {
        self.access(|control| control.arch.inject_nmi());
    }

    /// Programs the preemption timer. The vmexit itself is controlled with
    /// [`ExitCategory::PreemptionTimer`].
    pub fn preemption_timer_set(&self, ticks: u64) {
        self.access(|control| control.arch.set_preemption_timer(ticks));
    }

    /// Tags the translations of this vcpu with a VPID.
    pub fn vpid_enable(&self) {
        self.access(|control| control.arch.enable_vpid());
    }
}

impl<H: AxVmmHal> Execute for AxVCpu<'_, H> {
    fn load(&self) -> VmmResult {
        self.ensure_live()?;
        let cpu = H::current_cpu();
        let core = self.monitor.core(cpu)?;
        match self
            .slot
            .owner
            .compare_exchange(NO_CPU, cpu, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(owner) if owner == cpu => return Ok(()),
            Err(owner) => {
                debug!("{} is already loaded on cpu {}", self.id, owner);
                return Err(VmmError::BindConflict);
            }
        }
        if let Err(other) = core.claim(self.id.index()) {
            debug!("cpu {} already has vcpu slot {} loaded", cpu, other);
            self.slot.owner.store(NO_CPU, Ordering::Release);
            return Err(VmmError::BindConflict);
        }
        if let Err(err) = self
            .access(|control| control.arch.load().map_err(VmmError::from))
            .unwrap_or(Err(VmmError::BindConflict))
        {
            core.release(self.id.index());
            self.slot.owner.store(NO_CPU, Ordering::Release);
            return Err(err);
        }
        self.slot.set_state(VCpuState::Loaded);
        if let Err(err) = self.validate_exit_config() {
            warn!("{}: {}", self.id, err);
        }
        debug!("{} loaded on cpu {}", self.id, cpu);
        Ok(())
    }

    fn unload(&self) -> VmmResult {
        self.ensure_live()?;
        let cpu = H::current_cpu();
        if self.slot.owner.load(Ordering::Acquire) != cpu {
            return Err(VmmError::NotLoaded);
        }
        let core = self.monitor.core(cpu)?;
        self.access(|control| control.arch.unload().map_err(VmmError::from))
            .unwrap_or(Err(VmmError::BindConflict))?;
        self.slot.set_state(VCpuState::Unloaded);
        core.release(self.id.index());
        self.slot.owner.store(NO_CPU, Ordering::Release);
        debug!("{} unloaded from cpu {}", self.id, cpu);
        Ok(())
    }

    /// Called from inside a vmexit handler, marks the vcpu for re-entry and
    /// returns at once; the dispatch loop enters it after the handler returns.
    ///
    /// Otherwise, runs the dispatch loop of the calling CPU until no vcpu is
    /// resumed by a handler (`Ok`), or until an entry fails.
    fn run(&self) -> VmmResult {
        self.ensure_live()?;
        let cpu = H::current_cpu();
        if self.slot.owner.load(Ordering::Acquire) != cpu {
            return Err(VmmError::NotLoaded);
        }
        let core = self.monitor.core(cpu)?;
        self.slot.set_state(VCpuState::Running);
        if core.is_dispatching() {
            return Ok(());
        }
        self.monitor.run_loop(core)
    }
}

impl<H: AxVmmHal> InstructionPointer for AxVCpu<'_, H> {
    fn instruction_pointer_advance(&self) {
        self.access(|control| {
            let len = control.exit.instruction_len;
            control.arch.advance_instruction_pointer(len);
        });
    }
}

impl<H: AxVmmHal> VmexitInfo for AxVCpu<'_, H> {
    fn vmexit_info(&self) -> ExitInfo {
        self.access(|control| control.exit).unwrap_or_default()
    }
}

impl<H: AxVmmHal> VmexitControl for AxVCpu<'_, H> {
    type Handler = VmexitHandler<H>;

    fn vmexit_enable(&self, category: ExitCategory) {
        if !H::VCpu::SUPPORTED_EXITS.has(category) {
            warn!("{}: vmexit {:?} is not supported", self.id, category);
            return;
        }
        self.access(|control| {
            if category.is_unconditional() || control.enabled.has(category) {
                return;
            }
            control.enabled.insert(category.flag());
            control.arch.set_exit_control(category, true);
        });
    }

    fn vmexit_disable(&self, category: ExitCategory) {
        self.access(|control| {
            if !control.enabled.has(category) {
                return;
            }
            control.enabled.remove(category.flag());
            control.arch.set_exit_control(category, false);
        });
    }

    fn vmexit_is_enabled(&self, category: ExitCategory) -> bool {
        self.access(|control| control.active_categories().has(category))
            .unwrap_or(false)
    }

    fn vmexit_handler_set(&self, category: ExitCategory, handler: VmexitHandler<H>) {
        if !H::VCpu::SUPPORTED_EXITS.has(category) {
            warn!("{}: ignoring handler for unsupported vmexit {:?}", self.id, category);
            return;
        }
        self.access(|control| control.handlers[category.index()] = Some(handler));
    }

    fn vmexit_execute(&self) {
        let id = self.id;
        self.access(|control| {
            if control.resolution != ExitResolution::Pending {
                warn!("{}: vmexit already completed ({:?})", id, control.resolution);
                return;
            }
            control.resolution = ExitResolution::Executed;
            let exit = control.exit;
            control.arch.execute(&exit);
        });
    }

    fn vmexit_emulate(&self, value: u64) {
        let id = self.id;
        self.access(|control| {
            if control.resolution != ExitResolution::Pending {
                warn!("{}: vmexit already completed ({:?})", id, control.resolution);
                return;
            }
            control.resolution = ExitResolution::Emulated(value);
            let exit = control.exit;
            control.arch.emulate(&exit, value);
        });
    }

    fn vmexit_resolution(&self) -> ExitResolution {
        self.access(|control| control.resolution)
            .unwrap_or_default()
    }
}

impl<H: AxVmmHal> Property for AxVCpu<'_, H> {
    fn id(&self) -> VcpuId {
        self.id
    }

    fn vm_id(&self) -> VmId {
        VmId::from_raw(self.slot.vm.load(Ordering::Relaxed))
    }

    fn is_bootstrap_vcpu(&self) -> bool {
        self.slot.flags.load(Ordering::Relaxed) & FLAG_BOOTSTRAP != 0
    }

    fn is_root_vcpu(&self) -> bool {
        self.slot.flags.load(Ordering::Relaxed) & FLAG_ROOT != 0
    }
}
