//! Test doubles for the emulator crates.
//!
//! The real machine drives a dynamic recompiler through the
//! [`emu_core::jit::Core`] trait. Tests substitute [`ScriptedCore`]: a core
//! whose `run()` invokes a host closure with the register file and the bus,
//! so a test can stand in for "firmware" with a few lines of Rust. Typical
//! scripts dispatch on PC and finish by steering PC to 0 or the sentinel.

use std::sync::Arc;

use emu_core::bus::Bus;
use emu_core::jit::{regs, Core, CoreBuilder, CoreParams};

/// Architectural state of a scripted core.
pub struct CoreState {
    pub regs: [u32; 16],
    pub cpsr: u32,
    pub fpscr: u32,
}

impl CoreState {
    pub fn pc(&self) -> u32 {
        self.regs[regs::PC]
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.regs[regs::PC] = pc;
    }

    /// Steer the core back to its link register, i.e. emulate `bx lr`.
    pub fn ret(&mut self) {
        self.regs[regs::PC] = self.regs[regs::LR];
    }
}

/// Behaviour of a scripted core: called once per `run()`.
pub type Script = Arc<dyn Fn(&mut CoreState, &Arc<Bus>) + Send + Sync>;

/// A [`Core`] whose execution is a host closure.
pub struct ScriptedCore {
    state: CoreState,
    bus: Arc<Bus>,
    script: Script,
}

impl Core for ScriptedCore {
    fn reg(&self, index: usize) -> u32 {
        self.state.regs.get(index).copied().unwrap_or(0)
    }

    fn set_reg(&mut self, index: usize, value: u32) {
        if let Some(slot) = self.state.regs.get_mut(index) {
            *slot = value;
        }
    }

    fn regs(&self) -> [u32; 16] {
        self.state.regs
    }

    fn set_regs(&mut self, regs: &[u32; 16]) {
        self.state.regs = *regs;
    }

    fn cpsr(&self) -> u32 {
        self.state.cpsr
    }

    fn set_cpsr(&mut self, value: u32) {
        self.state.cpsr = value;
    }

    fn fpscr(&self) -> u32 {
        self.state.fpscr
    }

    fn set_fpscr(&mut self, value: u32) {
        self.state.fpscr = value;
    }

    fn run(&mut self) {
        let script = Arc::clone(&self.script);
        script(&mut self.state, &self.bus);
    }
}

/// Builds [`ScriptedCore`]s sharing one script.
pub struct ScriptedCoreBuilder {
    script: Script,
}

impl ScriptedCoreBuilder {
    pub fn new(script: Script) -> Self {
        Self { script }
    }

    /// A core that halts immediately: every `run()` sets PC to 0.
    pub fn halting() -> Self {
        Self::new(Arc::new(|state, _| state.set_pc(0)))
    }

    /// A core that returns immediately: every `run()` performs `bx lr`.
    pub fn returning() -> Self {
        Self::new(Arc::new(|state, _| state.ret()))
    }
}

impl CoreBuilder for ScriptedCoreBuilder {
    fn build(&self, params: CoreParams) -> Box<dyn Core> {
        Box::new(ScriptedCore {
            state: CoreState {
                regs: [0; 16],
                cpsr: 0,
                fpscr: 0,
            },
            bus: params.bus,
            script: Arc::clone(&self.script),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_core_runs_its_script() {
        let bus = Bus::new();
        let builder = ScriptedCoreBuilder::new(Arc::new(|state, _| {
            state.regs[0] = state.regs[0].wrapping_add(1);
            state.ret();
        }));
        let mut core = builder.build(CoreParams {
            bus: Arc::clone(&bus),
            page_table: bus.page_table(),
            monitor: Arc::new(emu_core::jit::ExclusiveMonitor::new(1)),
        });
        core.set_reg(14, 0xffff_fff0);
        core.run();
        assert_eq!(core.reg(0), 1);
        assert_eq!(core.reg(15), 0xffff_fff0);
    }
}
