use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    marker::PhantomData,
    rc::{Rc, Weak},
    sync::Mutex,
};

use crate::{
    backend::{Backend, InfoInput, Unit, UnitInput},
    expr::addr,
    op::Requirement,
    storage::TensorBuffer,
    CpuBackend, Descriptor, Error, ExecutorConfig, ExprRef, ForwardType, Op, Result, Var,
};

pub use self::{cache::ComputeCache, profiler::OpProfile};
use self::{cache::Lowered, profiler::Profiler};

mod cache;
mod profiler;

/// What [`Executor::gc`] releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcFlag {
    /// Built plans and every computed value; the next read re-runs.
    Full,
    /// Only caches no live node is attached to. Plans of retained handles
    /// survive.
    Part,
}

/// Coordinates requirement lookup, shape inference, and the building and
/// running of compute caches.
pub struct Executor {
    backend: Rc<dyn Backend>,
    /// Host runtime for plans built with `force_cpu`.
    backup: Rc<dyn Backend>,
    config: RefCell<ExecutorConfig>,
    caches: Mutex<Vec<Weak<ComputeCache>>>,
    profiler: RefCell<Profiler>,
}

thread_local! {
    static GLOBAL: Rc<Executor> =
        Executor::new(Rc::new(CpuBackend::new()), ExecutorConfig::from_env());
    static CURRENT: RefCell<Vec<Rc<Executor>>> = const { RefCell::new(Vec::new()) };
}

impl Executor {
    pub fn new(backend: Rc<dyn Backend>, mut config: ExecutorConfig) -> Rc<Self> {
        if config.forward_type == ForwardType::Auto {
            tracing::info!("auto forward type resolved to `{}`", backend.name());
            config.forward_type = ForwardType::Cpu;
        }
        Rc::new(Self {
            backend,
            backup: Rc::new(CpuBackend::new()),
            config: RefCell::new(config),
            caches: Mutex::new(Vec::new()),
            profiler: RefCell::new(Profiler::default()),
        })
    }

    /// The default executor of this thread.
    pub fn global() -> Rc<Self> {
        GLOBAL.with(Rc::clone)
    }

    /// The innermost scoped executor, or the global one.
    pub fn current() -> Rc<Self> {
        CURRENT
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(Self::global)
    }

    pub fn backend_name(&self) -> String {
        self.backend.name().to_string()
    }

    pub fn config(&self) -> ExecutorConfig {
        self.config.borrow().clone()
    }

    /// Configuration for caches built from now on. Existing caches keep the
    /// configuration they were built with.
    pub fn set_global_config(&self, mut config: ExecutorConfig) {
        if config.forward_type == ForwardType::Auto {
            tracing::info!("auto forward type resolved to `{}`", self.backend.name());
            config.forward_type = ForwardType::Cpu;
        }
        *self.config.borrow_mut() = config;
    }

    pub fn requirement(&self, op: &Op, n_inputs: usize) -> Requirement {
        op.requirement(n_inputs)
    }

    pub fn compute_info(&self, op: &Op, inputs: &[InfoInput]) -> Result<Vec<Descriptor>> {
        self.backend.compute_info(op, inputs)
    }

    /// Number of live caches built by this executor.
    pub fn cache_count(&self) -> usize {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        caches.retain(|w| w.strong_count() > 0);
        caches.len()
    }

    /// Build one cache over `exprs` and every not-yet-cached node they
    /// depend on. Cached producers become dependencies of the new cache.
    #[tracing::instrument(skip_all, fields(targets = exprs.len()))]
    pub fn make_cache(&self, exprs: &[ExprRef], force_cpu: bool) -> Result<()> {
        // Shape inference may itself build caches for shape-relevant
        // content, so it runs before the registry lock is taken.
        for expr in exprs {
            expr.require_info()?;
        }
        let mut visited = HashSet::new();
        let mut frontier = Vec::new();
        for expr in exprs {
            collect_frontier(expr, &mut visited, &mut frontier);
        }
        if frontier.is_empty() {
            return Ok(());
        }
        for expr in &frontier {
            expr.require_info()?;
        }

        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let lowered = lower(&frontier)?;
        let offsets: Vec<usize> = frontier
            .iter()
            .scan(0, |acc, e| {
                let off = *acc;
                *acc += e.output_size();
                Some(off)
            })
            .collect();
        let backend = if force_cpu {
            self.backup.clone()
        } else {
            self.backend.clone()
        };
        tracing::debug!(
            "cache over {} nodes on `{}`: {} externals, {} dependencies",
            frontier.len(),
            backend.name(),
            lowered.externals.len(),
            lowered.deps.len()
        );
        let cache = ComputeCache::new(backend, self.config(), lowered);
        for (expr, offset) in frontier.iter().zip(offsets) {
            let inside = expr.inside();
            let mut ins = inside.borrow_mut();
            ins.cache = Some(cache.clone());
            ins.cache_offset = offset;
        }
        caches.retain(|w| w.strong_count() > 0);
        caches.push(Rc::downgrade(&cache));
        Ok(())
    }

    pub fn run_cache(&self, cache: &Rc<ComputeCache>) -> Result<()> {
        cache.run(self)
    }

    pub fn set_shape_dirty(&self, cache: &Rc<ComputeCache>) {
        cache.set_shape_dirty();
    }

    pub fn set_content_dirty(&self, cache: &Rc<ComputeCache>) {
        cache.set_content_dirty();
    }

    pub(crate) fn map_output(
        &self,
        cache: &Rc<ComputeCache>,
        slot: usize,
        dest: &mut TensorBuffer,
    ) -> Result<()> {
        cache.output_into(slot, dest)
    }

    /// Release backend resources. `Full` releases every cache; `Part` only
    /// those no live node reads from any more.
    pub fn gc(&self, flag: GcFlag) {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        caches.retain(|w| w.strong_count() > 0);
        let mut released = 0;
        for cache in caches.iter().filter_map(Weak::upgrade) {
            if flag == GcFlag::Full || !cache.is_retained() {
                cache.release();
                released += 1;
            }
        }
        tracing::debug!("gc {flag:?} released {released} of {} caches", caches.len());
    }

    pub fn reset_profile(&self) {
        self.profiler.borrow_mut().reset();
    }

    pub fn dump_profile(&self) {
        self.profiler.borrow().dump();
    }

    pub fn add_op_cost_time(&self, kind: &str, ms: f32) {
        self.profiler.borrow_mut().add_time(kind, ms);
    }

    pub fn add_op_flops(&self, kind: &str, flops: f32) {
        self.profiler.borrow_mut().add_flops(kind, flops);
    }

    /// Accumulated cost per operator kind.
    pub fn profile(&self) -> Vec<(String, OpProfile)> {
        self.profiler.borrow().snapshot()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("backend", &self.backend.name())
            .field("config", &*self.config.borrow())
            .finish()
    }
}

/// Post-order walk over uncached operator nodes.
fn collect_frontier(expr: &ExprRef, visited: &mut HashSet<usize>, out: &mut Vec<ExprRef>) {
    if expr.is_leaf() || expr.cache().is_some() || !visited.insert(addr(expr)) {
        return;
    }
    for input in expr.inputs() {
        collect_frontier(&input.expr, visited, out);
    }
    out.push(expr.clone());
}

fn lower(frontier: &[ExprRef]) -> Result<Lowered> {
    let index: HashMap<usize, usize> = frontier
        .iter()
        .enumerate()
        .map(|(i, e)| (addr(e), i))
        .collect();
    let mut lowered = Lowered {
        nodes: Vec::with_capacity(frontier.len()),
        units: Vec::with_capacity(frontier.len()),
        shape_needs: Vec::with_capacity(frontier.len()),
        externals: Vec::new(),
        external_needs_content: Vec::new(),
        deps: Vec::new(),
    };
    for expr in frontier {
        let op = expr
            .op()
            .ok_or_else(|| Error::InvalidGraph(format!("leaf `{}` in a plan", expr.name())))?;
        let req = expr.requirement();
        let mut inputs = Vec::new();
        for (slot, input) in expr.inputs().into_iter().enumerate() {
            if let Some(&unit) = index.get(&addr(&input.expr)) {
                inputs.push(UnitInput::Internal {
                    unit,
                    output: input.index,
                });
                continue;
            }
            let k = external_slot(&mut lowered, input);
            if req.content_need_content.get(slot).copied().unwrap_or(true) {
                lowered.external_needs_content[k] = true;
            }
            inputs.push(UnitInput::External(k));
        }
        let outputs = expr.inside().borrow().infos.clone();
        lowered.units.push(Unit {
            name: expr.name(),
            op,
            inputs,
            outputs,
        });
        lowered.shape_needs.push(req.shape_need_content);
        lowered.nodes.push(Rc::downgrade(expr));
    }
    Ok(lowered)
}

fn external_slot(lowered: &mut Lowered, input: Var) -> usize {
    if let Some(k) = lowered.externals.iter().position(|v| *v == input) {
        return k;
    }
    if let Some(dep) = input.expr.cache() {
        if !lowered.deps.iter().any(|d| Rc::ptr_eq(d, &dep)) {
            lowered.deps.push(dep);
        }
    }
    lowered.externals.push(input);
    lowered.external_needs_content.push(false);
    lowered.externals.len() - 1
}

/// Makes an executor current for the lifetime of the guard.
///
/// ```
/// use std::rc::Rc;
/// use lazygraph_core::{CpuBackend, Executor, ExecutorConfig, ExecutorScope};
///
/// let exec = Executor::new(Rc::new(CpuBackend::new()), ExecutorConfig::default().with_threads(1));
/// {
///     let _scope = ExecutorScope::new(exec.clone());
///     assert!(Rc::ptr_eq(&Executor::current(), &exec));
/// }
/// assert!(!Rc::ptr_eq(&Executor::current(), &exec));
/// ```
pub struct ExecutorScope {
    _not_send: PhantomData<Rc<()>>,
}

impl ExecutorScope {
    pub fn new(executor: Rc<Executor>) -> Self {
        CURRENT.with(|stack| stack.borrow_mut().push(executor));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for ExecutorScope {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
