#![allow(dead_code)]

use std::{cell::Cell, rc::Rc};

use lazygraph_core::{
    Backend, CpuBackend, Descriptor, Executable, Executor, ExecutorConfig, HostTensor, InfoInput,
    Op, OpCost, Result, Unit,
};

/// How often the graph core called into the backend.
#[derive(Default)]
pub struct Counts {
    pub infos: Cell<usize>,
    pub builds: Cell<usize>,
    pub runs: Cell<usize>,
}

fn bump(c: &Cell<usize>) {
    c.set(c.get() + 1);
}

/// CPU backend that records every shape inference, plan build and run.
pub struct Counting {
    inner: CpuBackend,
    counts: Rc<Counts>,
}

struct CountingProgram {
    inner: Box<dyn Executable>,
    counts: Rc<Counts>,
}

impl Backend for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn compute_info(&self, op: &Op, inputs: &[InfoInput]) -> Result<Vec<Descriptor>> {
        bump(&self.counts.infos);
        self.inner.compute_info(op, inputs)
    }

    fn build_units(&self, units: Vec<Unit>, config: &ExecutorConfig) -> Result<Box<dyn Executable>> {
        bump(&self.counts.builds);
        let inner = self.inner.build_units(units, config)?;
        Ok(Box::new(CountingProgram {
            inner,
            counts: self.counts.clone(),
        }))
    }
}

impl Executable for CountingProgram {
    fn run(&mut self, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
        bump(&self.counts.runs);
        self.inner.run(inputs)
    }

    fn recycle(&mut self, outputs: Vec<HostTensor>) {
        self.inner.recycle(outputs)
    }

    fn take_costs(&mut self) -> Vec<OpCost> {
        self.inner.take_costs()
    }
}

pub fn counting_executor(config: ExecutorConfig) -> (Rc<Executor>, Rc<Counts>) {
    let counts = Rc::new(Counts::default());
    let backend = Counting {
        inner: CpuBackend::new(),
        counts: counts.clone(),
    };
    (Executor::new(Rc::new(backend), config), counts)
}

pub fn single_threaded() -> ExecutorConfig {
    ExecutorConfig::default().with_threads(1)
}
