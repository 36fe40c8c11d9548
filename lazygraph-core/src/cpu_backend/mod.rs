use std::{cell::RefCell, sync::Arc, time::Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    backend::{Backend, Executable, OpCost, Unit, UnitInput},
    Error, ExecutorConfig, HostTensor, Result,
};

pub use pool::{BufferPool, PoolMetrics};

mod kernels;
mod pool;

/// Reference host backend. Elementwise kernels run on a rayon pool sized by
/// the executor configuration; pools are shared between plans of equal width.
#[derive(Default)]
pub struct CpuBackend {
    thread_pools: RefCell<Vec<(usize, Arc<ThreadPool>)>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn thread_pool(&self, num_threads: usize) -> Result<Arc<ThreadPool>> {
        let mut pools = self.thread_pools.borrow_mut();
        if let Some((_, pool)) = pools.iter().find(|(n, _)| *n == num_threads) {
            return Ok(pool.clone());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("lazygraph-cpu-{i}"))
            .build()
            .map_err(|e| Error::backend("cpu", e))?;
        let pool = Arc::new(pool);
        pools.push((num_threads, pool.clone()));
        Ok(pool)
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn build_units(
        &self,
        units: Vec<Unit>,
        config: &ExecutorConfig,
    ) -> Result<Box<dyn Executable>> {
        for (i, unit) in units.iter().enumerate() {
            for input in &unit.inputs {
                if let UnitInput::Internal { unit: u, output } = *input {
                    let ok = u < i && units[u].outputs.len() > output;
                    if !ok {
                        return Err(Error::backend(
                            "cpu",
                            format!("unit `{}` reads a missing output {u}:{output}", unit.name),
                        ));
                    }
                }
            }
        }
        Ok(Box::new(CpuProgram {
            units,
            num_threads: config.num_threads,
            threads: self.thread_pool(config.num_threads)?,
            pool: BufferPool::new(),
            profile: config.profile,
            costs: Vec::new(),
        }))
    }
}

/// A built CPU plan. Owns the buffer pool its outputs are recycled into.
pub struct CpuProgram {
    units: Vec<Unit>,
    num_threads: usize,
    threads: Arc<ThreadPool>,
    pool: BufferPool,
    profile: bool,
    costs: Vec<OpCost>,
}

impl CpuProgram {
    pub fn pool_metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }
}

impl Executable for CpuProgram {
    fn run(&mut self, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
        let mut produced: Vec<Vec<HostTensor>> = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let args = unit
                .inputs
                .iter()
                .map(|input| {
                    let found = match *input {
                        UnitInput::External(k) => inputs.get(k),
                        UnitInput::Internal { unit, output } => {
                            produced.get(unit).and_then(|o| o.get(output))
                        }
                    };
                    found.ok_or_else(|| {
                        Error::backend("cpu", format!("`{}`: unbound input {input:?}", unit.name))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let start = Instant::now();
            let mut ctx = kernels::KernelCtx {
                pool: &mut self.pool,
                threads: &self.threads,
                num_threads: self.num_threads,
            };
            let outs = kernels::run(&unit.op, &args, &unit.outputs, &mut ctx).map_err(|e| {
                Error::backend("cpu", format!("`{}` ({}): {e}", unit.name, unit.op.kind_name()))
            })?;
            if self.profile {
                self.costs.push(OpCost {
                    kind: unit.op.kind_name(),
                    time_ms: start.elapsed().as_secs_f32() * 1000.0,
                    flops: kernels::flops(&unit.op, &args, &unit.outputs),
                });
            }
            produced.push(outs);
        }
        Ok(produced.into_iter().flatten().collect())
    }

    fn recycle(&mut self, outputs: Vec<HostTensor>) {
        for t in outputs {
            self.pool.recycle_buffer(t.data);
        }
    }

    fn take_costs(&mut self) -> Vec<OpCost> {
        std::mem::take(&mut self.costs)
    }
}
