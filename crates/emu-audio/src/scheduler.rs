//! Tick scheduler: executes every pipeline node once per audio block,
//! fanning independent subgraphs out across worker threads that call the
//! firmware's update functions on pooled cores.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use emu_core::cpu::CpuHarness;
use emu_core::descriptor::FirmwareDescriptor;
use emu_core::error::CoreError;
use emu_core::timer::Timer;

use crate::graph::Graph;
use crate::hooks::{install_irq_bracket_lock, install_range_lock, FirmwareLock};
use crate::layout::AudioConfig;

struct WorkState {
    graph: Option<Arc<Graph>>,
    /// Nodes eligible to run, ordered by index.
    ready: BTreeSet<(usize, u32)>,
    /// Nodes dispatched this tick (running or done).
    visited: HashSet<u32>,
    /// Nodes completed this tick.
    finished: HashSet<u32>,
    /// Completion bits by node index; drives readiness checks and the sweep.
    finished_flag: Vec<bool>,
}

/// The audio pipeline driver.
pub struct AudioProcessor {
    harness: Arc<CpuHarness>,
    config: AudioConfig,
    /// Guest address of the firmware variable holding the update-list head.
    first_update_addr: u32,
    work: Mutex<WorkState>,
    work_ready: Condvar,
    work_done: Condvar,
    running: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    timer: Timer,
    block_lock: Arc<FirmwareLock>,
    usb_lock: Arc<FirmwareLock>,
}

impl AudioProcessor {
    pub fn new(harness: Arc<CpuHarness>, config: AudioConfig, first_update_addr: u32) -> Arc<Self> {
        Arc::new(Self {
            harness,
            config,
            first_update_addr,
            work: Mutex::new(WorkState {
                graph: None,
                ready: BTreeSet::new(),
                visited: HashSet::new(),
                finished: HashSet::new(),
                finished_flag: Vec::new(),
            }),
            work_ready: Condvar::new(),
            work_done: Condvar::new(),
            running: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
            timer: Timer::new(),
            block_lock: Arc::new(FirmwareLock::new()),
            usb_lock: Arc::new(FirmwareLock::new()),
        })
    }

    /// Instrument the firmware's critical-section helpers named by the
    /// descriptor: `block_lock_ranges` guard the audio block pool,
    /// `usb_lock_ranges` bracket the USB-audio transmit path with
    /// cpsid/cpsie.
    pub fn install_lock_hooks(&self, descriptor: &FirmwareDescriptor) -> Result<(), CoreError> {
        let bus = self.harness.bus();
        for name in descriptor
            .config::<Vec<String>>("block_lock_ranges")?
            .unwrap_or_default()
        {
            let (entry, end) = descriptor.range(&name)?;
            install_range_lock(bus, entry, end, Arc::clone(&self.block_lock));
        }
        for name in descriptor
            .config::<Vec<String>>("usb_lock_ranges")?
            .unwrap_or_default()
        {
            let (entry, end) = descriptor.range(&name)?;
            install_irq_bracket_lock(bus, entry, end, Arc::clone(&self.usb_lock));
        }
        Ok(())
    }

    /// Spawn the workers and start ticking. Called once the firmware has
    /// finished its setup (the initialize callback).
    pub fn start(self: &Arc<Self>) {
        self.start_workers();
        let processor = Arc::clone(self);
        let period = self.config.tick_period();
        self.timer.set_interval(
            period,
            Box::new(move || {
                if processor.config.fine_grained_lock {
                    processor.process();
                } else {
                    // Coarse mode: the whole tick excludes the primary core.
                    let bus = Arc::clone(processor.harness.bus());
                    let _master = bus.lock();
                    processor.process();
                }
            }),
        );
        self.timer.start();
        info!(
            workers = self.config.workers,
            period_us = period.as_micros() as u64,
            "audio processor started"
        );
    }

    /// Spawn the worker pool without arming the tick timer.
    pub fn start_workers(self: &Arc<Self>) {
        if self.config.workers == 0 {
            return;
        }
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.config.workers {
            let processor = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("audio-worker-{index}"))
                .spawn(move || processor.worker_loop());
            if let Ok(handle) = handle {
                workers.push(handle);
            }
        }
    }

    /// Stop ticking and wind the workers down.
    pub fn shutdown(&self) {
        self.timer.stop();
        self.running.store(false, Ordering::Release);
        {
            // Notify under the work mutex so no worker can slip between its
            // running check and the wait.
            let _work = self.work.lock();
            self.work_ready.notify_all();
            self.work_done.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Execute one audio tick: every pipeline node exactly once.
    pub fn process(&self) {
        let started = Instant::now();

        if self.config.workers == 0 {
            // Block-serial fallback: run the firmware's software-interrupt
            // handler, which updates every node in list order.
            let handler = self.harness.vector_address(self.config.software_irq);
            self.harness.call_function(handler, 0);
        } else {
            let graph = self.ensure_graph();
            if graph.is_empty() {
                return;
            }
            let total = graph.len();
            let mut work = self.work.lock();
            work.ready.clear();
            work.visited.clear();
            work.finished.clear();
            work.finished_flag = vec![false; total];
            for ptr in &graph.pipelines {
                let node = &graph.map[ptr];
                if node.inputs.is_empty() || node.index == 0 {
                    work.ready.insert((node.index, *ptr));
                }
            }
            self.work_ready.notify_all();
            while work.finished.len() < total {
                self.work_done.wait(&mut work);
            }
        }

        let period = self.config.tick_period();
        let elapsed = started.elapsed();
        if elapsed > period {
            warn!(
                elapsed_us = elapsed.as_micros() as u64,
                period_us = period.as_micros() as u64,
                "audio tick overran its period"
            );
        }
    }

    /// The discovered graph, built from guest memory on first use.
    fn ensure_graph(&self) -> Arc<Graph> {
        let mut work = self.work.lock();
        if let Some(graph) = work.graph.as_ref() {
            return Arc::clone(graph);
        }
        let bus = self.harness.bus();
        let first_node = bus.read32(self.first_update_addr);
        let graph = Arc::new(Graph::discover(
            bus,
            first_node,
            &self.config.stream_layout,
            &self.config.connection_layout,
        ));
        work.graph = Some(Arc::clone(&graph));
        graph
    }

    fn worker_loop(&self) {
        loop {
            let claimed = {
                let mut work = self.work.lock();
                loop {
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                    let next = work.ready.iter().next().copied();
                    if let Some((index, ptr)) = next {
                        work.ready.remove(&(index, ptr));
                        work.visited.insert(ptr);
                        let graph = work.graph.as_ref().map(Arc::clone);
                        break graph.map(|graph| (graph, index, ptr));
                    }
                    self.work_ready.wait(&mut work);
                }
            };
            let Some((graph, index, ptr)) = claimed else {
                continue;
            };

            let update_func = graph.map[&ptr].update_func;
            self.harness.call_function(update_func, ptr);

            let mut work = self.work.lock();
            work.finished.insert(ptr);
            if let Some(flag) = work.finished_flag.get_mut(index) {
                *flag = true;
            }

            let mut extended = false;
            for dst in &graph.map[&ptr].successors {
                let dst_node = &graph.map[dst];
                let key = (dst_node.index, *dst);
                if !work.visited.contains(dst)
                    && !work.ready.contains(&key)
                    && graph.forward_inputs_finished(dst_node, &work.finished_flag)
                {
                    work.ready.insert(key);
                    extended = true;
                }
            }

            // Safety sweep: the precomputed successors prune back-edges, so
            // pick up the lowest-index node not yet dispatched. It runs once
            // its forward inputs are done, or unconditionally when nothing
            // else is in flight (the deadlock breaker for feedback loops).
            let in_flight = work.visited.len() > work.finished.len();
            let candidate = graph
                .pipelines
                .iter()
                .enumerate()
                .find(|(i, p)| {
                    !work.finished_flag.get(*i).copied().unwrap_or(true)
                        && !work.visited.contains(*p)
                        && !work.ready.contains(&(*i, **p))
                })
                .map(|(i, p)| (i, *p));
            if let Some((i, p)) = candidate {
                let node = &graph.map[&p];
                if graph.forward_inputs_finished(node, &work.finished_flag) || !in_flight {
                    work.ready.insert((i, p));
                    extended = true;
                }
            }

            if extended {
                self.work_ready.notify_all();
            } else {
                self.work_done.notify_all();
            }
            if work.finished.len() == graph.len() {
                self.work_done.notify_all();
            }
        }
    }
}
