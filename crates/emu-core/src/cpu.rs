//! CPU execution harness: primary core stepping, interrupt injection, the
//! auxiliary core pool for synchronous firmware calls, and systick.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::bus::Bus;
use crate::jit::{regs, Core, CoreBuilder, CoreParams, ExclusiveMonitor, CPSR_THUMB};
use crate::timer::Timer;

/// Sentinel return address placed in LR before entering an ISR or a called
/// firmware function. `PC == 0 || PC >= IRQ_HANDLER` signals completion.
pub const IRQ_HANDLER: u32 = 0xffff_fff0;

/// Value returned by the read hook at the sentinel address: a Thumb
/// `bx lr; bx lr` pair, so control falling onto the sentinel naturally pops
/// back to the caller.
const SENTINEL_CODE: u32 = 0x7047_7047;

const SYSTICK_CSR: u32 = 0xe000_e010;
const SYSTICK_MILLIS: u32 = 0xe000_e018;
const VTOR: u32 = 0xe000_ed08;

/// Pool/stack layout and IRQ numbers for the harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Number of auxiliary cores for [`CpuHarness::call_function`].
    pub pool_size: usize,
    /// Guest base of the per-slot stacks (inside the extra-memory range).
    pub pool_stack_base: u32,
    /// Bytes of guest stack per pool slot.
    pub pool_stack_size: u32,
    /// IRQ injected by the 1 ms systick.
    pub systick_irq: u32,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            pool_size: 6,
            pool_stack_base: 0xb004_0000,
            pool_stack_size: 8 * 1024,
            systick_irq: 15,
        }
    }
}

struct SavedFrame {
    regs: [u32; 16],
    cpsr: u32,
    fpscr: u32,
}

struct IsrState {
    active: bool,
    irq: u32,
    saved: Option<SavedFrame>,
}

struct PoolSlot {
    index: usize,
    core: Mutex<Box<dyn Core>>,
}

struct JitPool {
    slots: Vec<Arc<PoolSlot>>,
    busy: Mutex<Vec<bool>>,
    idle: Condvar,
}

impl JitPool {
    fn acquire(&self) -> Arc<PoolSlot> {
        let mut busy = self.busy.lock();
        loop {
            if let Some(index) = busy.iter().position(|b| !*b) {
                busy[index] = true;
                return Arc::clone(&self.slots[index]);
            }
            self.idle.wait(&mut busy);
        }
    }

    fn release(&self, index: usize) {
        let mut busy = self.busy.lock();
        if let Some(slot) = busy.get_mut(index) {
            *slot = false;
        }
        self.idle.notify_one();
    }
}

/// Owns the primary core, the auxiliary pool, and interrupt state.
///
/// `run()` is driven in a tight loop by the boot thread;
/// [`CpuHarness::call_function`] may be called concurrently from any number
/// of other threads (audio workers, peripheral emulation).
pub struct CpuHarness {
    bus: Arc<Bus>,
    config: HarnessConfig,
    primary: Mutex<Box<dyn Core>>,
    pool: JitPool,
    isr: Mutex<IsrState>,
    pending: Mutex<BTreeSet<u32>>,
    vector_base: AtomicU32,
    systick: Timer,
    systick_millis: AtomicU32,
    init_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    init_once: Once,
}

impl CpuHarness {
    /// Build the primary core and the auxiliary pool, and install the
    /// sentinel, VTOR, and systick hooks on the bus.
    pub fn new(bus: Arc<Bus>, builder: &dyn CoreBuilder, config: HarnessConfig) -> Arc<Self> {
        let monitor = Arc::new(ExclusiveMonitor::new(config.pool_size + 1));
        let params = |bus: &Arc<Bus>| CoreParams {
            bus: Arc::clone(bus),
            page_table: bus.page_table(),
            monitor: Arc::clone(&monitor),
        };

        let mut primary = builder.build(params(&bus));
        primary.set_cpsr(CPSR_THUMB);

        let mut slots = Vec::with_capacity(config.pool_size);
        for index in 0..config.pool_size {
            let mut core = builder.build(params(&bus));
            core.set_cpsr(CPSR_THUMB);
            slots.push(Arc::new(PoolSlot {
                index,
                core: Mutex::new(core),
            }));
        }
        let busy = vec![false; config.pool_size];

        let harness = Arc::new(Self {
            bus,
            config,
            primary: Mutex::new(primary),
            pool: JitPool {
                slots,
                busy: Mutex::new(busy),
                idle: Condvar::new(),
            },
            isr: Mutex::new(IsrState {
                active: false,
                irq: 0,
                saved: None,
            }),
            pending: Mutex::new(BTreeSet::new()),
            vector_base: AtomicU32::new(0),
            systick: Timer::new(),
            systick_millis: AtomicU32::new(0),
            init_callbacks: Mutex::new(Vec::new()),
            init_once: Once::new(),
        });
        harness.install_system_hooks();
        harness
    }

    fn install_system_hooks(self: &Arc<Self>) {
        // Return-from-ISR trick: the sentinel address reads as `bx lr`.
        self.bus
            .add_read_hook(IRQ_HANDLER, Arc::new(|_| SENTINEL_CODE));

        let millis = Arc::clone(self);
        self.bus.add_read_hook(
            SYSTICK_MILLIS,
            Arc::new(move |_| millis.systick_millis.load(Ordering::Relaxed)),
        );

        let vtor = Arc::clone(self);
        self.bus.add_write_hook(
            VTOR,
            Arc::new(move |_, value| {
                info!(base = format_args!("{value:#010x}"), "vector table installed");
                vtor.vector_base.store(value, Ordering::Release);
            }),
        );

        let csr = Arc::clone(self);
        self.bus.add_write_hook(
            SYSTICK_CSR,
            Arc::new(move |_, value| {
                if value & 1 != 0 {
                    let tick = Arc::clone(&csr);
                    csr.systick.set_interval(
                        Duration::from_millis(1),
                        Box::new(move || {
                            tick.systick_millis.fetch_add(1, Ordering::Relaxed);
                            tick.trigger_interrupt(tick.config.systick_irq);
                        }),
                    );
                    csr.systick.start();
                } else {
                    csr.systick.stop();
                }
            }),
        );
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Point the primary core at the firmware entry.
    pub fn set_entry(&self, pc: u32) {
        self.primary.lock().set_reg(regs::PC, pc);
    }

    /// Resolve a vector-table entry through guest memory.
    pub fn vector_address(&self, irq: u32) -> u32 {
        let base = self.vector_base.load(Ordering::Acquire);
        self.bus.read32(base + 4 * irq)
    }

    /// Mark `irq` pending. Callable from any thread.
    pub fn trigger_interrupt(&self, irq: u32) {
        self.pending.lock().insert(irq);
    }

    /// One iteration of the primary stepping loop. Returns the primary PC
    /// after the step.
    ///
    /// Order per invocation: retire a finished ISR (PC at the sentinel),
    /// else consume one pending interrupt, then execute under the master
    /// callbacks lock.
    pub fn run(&self) -> u32 {
        let mut primary = self.primary.lock();
        {
            let mut isr = self.isr.lock();
            if isr.active {
                let pc = primary.reg(regs::PC);
                if pc == 0 || pc >= IRQ_HANDLER {
                    self.exit_interrupt(&mut primary, &mut isr);
                }
            } else {
                let irq = {
                    let mut pending = self.pending.lock();
                    pending.pop_first()
                };
                if let Some(irq) = irq {
                    self.enter_interrupt(&mut primary, &mut isr, irq);
                }
            }
        }

        let _master = self.bus.lock();
        primary.run();
        primary.reg(regs::PC)
    }

    fn enter_interrupt(&self, core: &mut Box<dyn Core>, isr: &mut IsrState, irq: u32) {
        let base = self.vector_base.load(Ordering::Acquire);
        if base == 0 {
            debug!(irq, "interrupt before vector table install; dropped");
            return;
        }
        isr.saved = Some(SavedFrame {
            regs: core.regs(),
            cpsr: core.cpsr(),
            fpscr: core.fpscr(),
        });
        isr.active = true;
        isr.irq = irq;
        let handler = self.vector_address(irq) & !1;
        core.set_cpsr(CPSR_THUMB);
        core.set_fpscr(0);
        core.set_reg(regs::PC, handler);
        core.set_reg(regs::LR, IRQ_HANDLER);
        debug!(irq, pc = format_args!("{handler:#010x}"), "enter interrupt");
    }

    fn exit_interrupt(&self, core: &mut Box<dyn Core>, isr: &mut IsrState) {
        if let Some(frame) = isr.saved.take() {
            core.set_regs(&frame.regs);
            core.set_cpsr(frame.cpsr);
            core.set_fpscr(frame.fpscr);
        }
        isr.active = false;
        debug!(
            irq = isr.irq,
            pc = format_args!("{:#010x}", core.reg(regs::PC)),
            "exit interrupt"
        );
    }

    /// Synchronously call a firmware function on an auxiliary core.
    ///
    /// Blocks until a pool slot is free. Each slot runs on its own disjoint
    /// guest stack; the call returns once the core's PC reaches 0 or the
    /// sentinel, yielding R0.
    pub fn call_function(&self, addr: u32, r0: u32) -> u32 {
        let started = Instant::now();
        let slot = self.pool.acquire();
        let result = {
            let mut core = slot.core.lock();
            core.set_cpsr(CPSR_THUMB);
            core.set_fpscr(0);
            core.set_reg(regs::PC, addr & !1);
            core.set_reg(regs::R0, r0);
            core.set_reg(regs::LR, IRQ_HANDLER);
            let stack_top = self
                .config
                .pool_stack_base
                .wrapping_add(self.config.pool_stack_size * (slot.index as u32 + 1));
            core.set_reg(regs::SP, stack_top);

            loop {
                let pc = core.reg(regs::PC);
                if pc == 0 || pc >= IRQ_HANDLER {
                    break;
                }
                core.run();
            }
            core.reg(regs::R0)
        };
        self.pool.release(slot.index);
        debug!(
            addr = format_args!("{addr:#010x}"),
            result = format_args!("{result:#x}"),
            micros = started.elapsed().as_micros() as u64,
            "call function"
        );
        result
    }

    /// Register a callback fired when the firmware reaches its setup-done
    /// point (see [`CpuHarness::arm_initialize_hook`]).
    pub fn attach_initialize_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        self.init_callbacks.lock().push(callback);
    }

    /// Arm a single-shot translation hook at `pc`: the first time the
    /// recompiler lifts that address, all registered initialize callbacks
    /// fire (exactly once, even across block re-translation).
    pub fn arm_initialize_hook(self: &Arc<Self>, pc: u32) {
        let harness = Arc::clone(self);
        self.bus.add_translation_hook(
            pc,
            Arc::new(move |_, _emitter| {
                harness.init_once.call_once(|| {
                    let callbacks = std::mem::take(&mut *harness.init_callbacks.lock());
                    for callback in callbacks {
                        callback();
                    }
                    info!("firmware setup complete; subsystems started");
                });
            }),
        );
    }

    /// True while the primary core is inside an interrupt handler.
    pub fn in_interrupt(&self) -> bool {
        self.isr.lock().active
    }

    /// Number of interrupts currently pending.
    pub fn pending_interrupts(&self) -> usize {
        self.pending.lock().len()
    }
}
