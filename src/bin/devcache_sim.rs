//! Drive the allocator with a random workload on a simulated device
//!
//! Prints the diagnostic summary, the counters as JSON and the Prometheus
//! exposition at the end of the run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rocm_devcache::backend::{DeviceError, DeviceResult};
use rocm_devcache::logging::init_logging_default;
use rocm_devcache::memory::ResidentId;
use rocm_devcache::{
    AllocatorConfig, DeviceFootprint, DeviceMemoryError, DeviceMemoryManager, DevicePtr,
    EvictionPolicy, PrometheusSink, ResidentObject, SimulatedDevice,
};

const TAGS: [&str; 4] = ["matmul", "transpose", "solve", "reduce"];

#[derive(Parser, Debug)]
#[command(name = "devcache_sim", version)]
#[command(about = "Exercise the device-memory cache against a simulated GPU", long_about = None)]
struct Cli {
    /// Simulated device capacity in bytes
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    capacity: usize,

    /// Number of workload steps
    #[arg(long, default_value_t = 10_000)]
    steps: usize,

    /// Largest block requested, in bytes
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    max_block: usize,

    /// RNG seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Fraction of free device memory usable by a fresh allocation
    #[arg(long)]
    utilization: Option<f64>,

    /// Eviction policy (size_aware or recency)
    #[arg(long, value_parser = parse_policy)]
    policy: Option<EvictionPolicy>,

    /// Skip the Prometheus exposition in the report
    #[arg(long)]
    no_metrics: bool,
}

fn parse_policy(s: &str) -> Result<EvictionPolicy, String> {
    EvictionPolicy::from_str(s).ok_or_else(|| format!("unknown eviction policy: {}", s))
}

/// Host copies written back on eviction, keyed by device address
type HostStore = Arc<Mutex<HashMap<DevicePtr, Vec<u8>>>>;

fn writeback_to(
    device: Arc<SimulatedDevice>,
    store: HostStore,
) -> impl Fn(&DeviceFootprint) -> DeviceResult<()> + Send + Sync + 'static {
    move |footprint: &DeviceFootprint| {
        let mut host = store.lock()?;
        for block in footprint.blocks() {
            host.insert(block.ptr, device.read(block.ptr)?);
        }
        Ok(())
    }
}

struct Workload {
    manager: DeviceMemoryManager<Arc<SimulatedDevice>>,
    device: Arc<SimulatedDevice>,
    store: HostStore,
    live: Vec<(DevicePtr, usize)>,
    residents: Vec<Arc<ResidentObject>>,
    rng: StdRng,
    max_block: usize,
    out_of_memory: usize,
}

impl Workload {
    fn tag(&mut self) -> &'static str {
        TAGS[self.rng.gen_range(0..TAGS.len())]
    }

    fn block_size(&mut self) -> usize {
        // Few distinct sizes so the free list gets exact hits
        let buckets = 16;
        let step = (self.max_block / buckets).max(1);
        step * self.rng.gen_range(1..=buckets)
    }

    fn malloc(&mut self, tag: &str, size: usize) -> anyhow::Result<Option<DevicePtr>> {
        match self.manager.malloc(tag, size as i64) {
            Ok(ptr) => Ok(Some(ptr)),
            Err(DeviceMemoryError::OutOfDeviceMemory { .. }) => {
                self.out_of_memory += 1;
                Ok(None)
            }
            Err(err) => Err(err).context("malloc failed"),
        }
    }

    fn step(&mut self) -> anyhow::Result<()> {
        let tag = self.tag();
        match self.rng.gen_range(0..100) {
            0..=34 => {
                let size = self.block_size();
                if let Some(ptr) = self.malloc(tag, size)? {
                    self.live.push((ptr, size));
                }
            }
            35..=59 if !self.live.is_empty() => {
                let index = self.rng.gen_range(0..self.live.len());
                let (ptr, _) = self.live.swap_remove(index);
                let eager = self.rng.gen_bool(0.2);
                self.manager.free(tag, ptr, eager)?;
            }
            60..=74 if !self.live.is_empty() => {
                let index = self.rng.gen_range(0..self.live.len());
                let (ptr, size) = self.live.swap_remove(index);
                let writeback = writeback_to(self.device.clone(), self.store.clone());
                let object = self
                    .manager
                    .register_resident(DeviceFootprint::dense(ptr, size), writeback)?;
                self.residents.push(object);
            }
            75..=84 if !self.residents.is_empty() => {
                let index = self.rng.gen_range(0..self.residents.len());
                let object = self.residents[index].clone();
                if object.is_resident()? {
                    object.touch();
                    object.mark_dirty();
                }
            }
            85..=92 if !self.residents.is_empty() => {
                // Allocate while a resident object is pinned by a kernel
                let index = self.rng.gen_range(0..self.residents.len());
                let object = self.residents[index].clone();
                let _pin = object.lock()?;
                let size = self.block_size();
                if let Some(ptr) = self.malloc(tag, size)? {
                    self.live.push((ptr, size));
                }
            }
            93..=99 if !self.residents.is_empty() => {
                let index = self.rng.gen_range(0..self.residents.len());
                let object = self.residents.swap_remove(index);
                let id: ResidentId = object.id();
                if object.is_resident()? {
                    self.manager.remove_resident(tag, id, self.rng.gen_bool(0.5))?;
                }
            }
            _ => {}
        }
        self.residents
            .retain(|object| object.is_resident().unwrap_or(false));
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    init_logging_default();
    let cli = Cli::parse();

    let mut config = AllocatorConfig::from_env()?;
    if let Some(factor) = cli.utilization {
        config = config.with_utilization_factor(factor);
    }
    if let Some(policy) = cli.policy {
        config = config.with_eviction_policy(policy);
    }

    let device = Arc::new(SimulatedDevice::new(cli.capacity));
    let sink = Arc::new(PrometheusSink::new());
    let manager = DeviceMemoryManager::new(device.clone(), config)?.with_stats_sink(sink.clone());

    let mut workload = Workload {
        manager,
        device,
        store: Arc::new(Mutex::new(HashMap::new())),
        live: Vec::new(),
        residents: Vec::new(),
        rng: StdRng::seed_from_u64(cli.seed),
        max_block: cli.max_block.max(1),
        out_of_memory: 0,
    };

    for step in 0..cli.steps {
        workload
            .step()
            .with_context(|| format!("workload step {}", step))?;
    }

    let manager = &workload.manager;
    println!("{}", manager.diagnostic_summary()?);
    println!(
        "Out-of-memory results: {}, host copies written back: {}",
        workload.out_of_memory,
        workload
            .store
            .lock()
            .map_err(|e| DeviceError::LockPoisoned(e.to_string()))?
            .len()
    );
    println!("{}", serde_json::to_string_pretty(&manager.counters().snapshot())?);

    if !cli.no_metrics {
        sink.observe(&manager.snapshot()?, &manager.counters().snapshot());
        print!("{}", sink.encode()?);
    }

    manager.clear_all()?;
    anyhow::ensure!(
        workload.device.live_blocks()? == 0,
        "device blocks left after clear_all"
    );
    Ok(())
}
