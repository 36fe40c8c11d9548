use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use crate::{
    backend::{Backend, Executable, InfoInput, Unit, UnitInput},
    storage::TensorBuffer,
    Error, Executor, ExecutorConfig, Expr, HostTensor, Result, Var,
};

/// Nodes of a frontier lowered to backend units.
pub(crate) struct Lowered {
    pub(crate) nodes: Vec<Weak<Expr>>,
    pub(crate) units: Vec<Unit>,
    /// Per unit and input slot: the unit's output shape reads that content.
    pub(crate) shape_needs: Vec<Vec<bool>>,
    pub(crate) externals: Vec<Var>,
    pub(crate) external_needs_content: Vec<bool>,
    pub(crate) deps: Vec<Rc<ComputeCache>>,
}

struct CacheState {
    backend: Rc<dyn Backend>,
    config: ExecutorConfig,
    nodes: Vec<Weak<Expr>>,
    units: Vec<Unit>,
    shape_needs: Vec<Vec<bool>>,
    externals: Vec<Var>,
    external_needs_content: Vec<bool>,
    /// Upstream caches this one reads from; kept alive with it.
    deps: Vec<Rc<ComputeCache>>,
    executable: Option<Box<dyn Executable>>,
    outputs: Vec<HostTensor>,
    shape_dirty: bool,
    content_dirty: bool,
    /// Content stamps of the externals at the last successful run.
    stamps: Vec<(usize, u64)>,
    generation: u64,
}

/// An executable plan over a set of nodes, built lazily and re-run only when
/// stale. Its output space is the outputs of its nodes, in node order.
pub struct ComputeCache {
    state: RefCell<CacheState>,
    running: Cell<bool>,
}

struct RunGuard<'a>(&'a Cell<bool>);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl ComputeCache {
    pub(crate) fn new(backend: Rc<dyn Backend>, config: ExecutorConfig, lowered: Lowered) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(CacheState {
                backend,
                config,
                nodes: lowered.nodes,
                units: lowered.units,
                shape_needs: lowered.shape_needs,
                externals: lowered.externals,
                external_needs_content: lowered.external_needs_content,
                deps: lowered.deps,
                executable: None,
                outputs: Vec::new(),
                shape_dirty: false,
                content_dirty: true,
                stamps: Vec::new(),
                generation: 0,
            }),
            running: Cell::new(false),
        })
    }

    /// Number of completed runs.
    pub fn generation(&self) -> u64 {
        self.state.borrow().generation
    }

    pub fn is_shape_dirty(&self) -> bool {
        self.state.borrow().shape_dirty
    }

    pub fn is_content_dirty(&self) -> bool {
        self.state.borrow().content_dirty
    }

    pub fn unit_count(&self) -> usize {
        self.state.borrow().units.len()
    }

    pub fn dependency_count(&self) -> usize {
        self.state.borrow().deps.len()
    }

    pub fn backend_name(&self) -> String {
        self.state.borrow().backend.name().to_string()
    }

    pub(crate) fn set_shape_dirty(&self) {
        let mut st = self.state.borrow_mut();
        st.shape_dirty = true;
        st.content_dirty = true;
    }

    pub(crate) fn set_content_dirty(&self) {
        self.state.borrow_mut().content_dirty = true;
    }

    fn is_attached(&self, node: &Expr) -> bool {
        node.cache()
            .is_some_and(|c| std::ptr::eq(Rc::as_ptr(&c), self))
    }

    /// True while some live node still reads its outputs from this cache.
    pub(crate) fn is_retained(&self) -> bool {
        let nodes = self.state.borrow().nodes.clone();
        nodes
            .iter()
            .filter_map(Weak::upgrade)
            .any(|node| self.is_attached(&node))
    }

    /// Re-infer every unit's output descriptors and drop the built plan.
    fn relower(&self) -> Result<()> {
        let (backend, nodes, units, shape_needs, externals) = {
            let st = self.state.borrow();
            (
                st.backend.clone(),
                st.nodes.clone(),
                st.units.clone(),
                st.shape_needs.clone(),
                st.externals.clone(),
            )
        };
        let mut lowered: Vec<Unit> = Vec::with_capacity(units.len());
        for (i, (unit, node)) in units.into_iter().zip(&nodes).enumerate() {
            let outputs = match node.upgrade() {
                Some(node) if self.is_attached(&node) => {
                    node.require_info()?;
                    let infos = node.inside().borrow().infos.clone();
                    infos
                }
                _ => {
                    let mut infos = Vec::with_capacity(unit.inputs.len());
                    for (slot, input) in unit.inputs.iter().enumerate() {
                        let need = shape_needs[i].get(slot).copied().unwrap_or(false);
                        let info = match *input {
                            UnitInput::External(k) => {
                                let ext = &externals[k];
                                InfoInput {
                                    desc: ext.get_info()?,
                                    content: if need {
                                        Some(ext.read_internal(true)?)
                                    } else {
                                        None
                                    },
                                }
                            }
                            UnitInput::Internal { unit: u, output } => {
                                if need {
                                    return Err(Error::NotReady(format!(
                                        "shape of `{}` needs content computed in the same plan",
                                        unit.name
                                    )));
                                }
                                let desc = lowered
                                    .get(u)
                                    .and_then(|p| p.outputs.get(output))
                                    .cloned()
                                    .ok_or_else(|| {
                                        Error::InvalidGraph(format!("`{}` reads {u}:{output}", unit.name))
                                    })?;
                                InfoInput { desc, content: None }
                            }
                        };
                        infos.push(info);
                    }
                    backend.compute_info(&unit.op, &infos)?
                }
            };
            lowered.push(Unit { outputs, ..unit });
        }

        let mut st = self.state.borrow_mut();
        st.units = lowered;
        st.executable = None;
        st.outputs.clear();
        st.shape_dirty = false;
        st.content_dirty = true;
        Ok(())
    }

    /// Run the plan if stale: a shape-dirty cache is re-lowered and rebuilt,
    /// a content-dirty one re-runs its existing plan. Upstream content is
    /// brought up to date first; if any upstream changed since the last run,
    /// the cache counts as content-dirty.
    pub(crate) fn run(&self, executor: &Executor) -> Result<()> {
        if self.running.replace(true) {
            return Err(Error::NotReady("plan re-entered while running".to_string()));
        }
        let _guard = RunGuard(&self.running);

        let (externals, needs) = {
            let st = self.state.borrow();
            (st.externals.clone(), st.external_needs_content.clone())
        };
        // Externals read for their shape only carry no stamp.
        let mut stamps = Vec::with_capacity(externals.len());
        for (ext, &need) in externals.iter().zip(&needs) {
            if need {
                ext.materialize()?;
                stamps.push(ext.content_stamp());
            } else {
                stamps.push((0, 0));
            }
        }
        {
            let mut st = self.state.borrow_mut();
            if st.stamps != stamps {
                st.content_dirty = true;
            }
            let has_outputs = !st.outputs.is_empty() || st.units.iter().all(|u| u.outputs.is_empty());
            if !st.shape_dirty && !st.content_dirty && has_outputs {
                return Ok(());
            }
        }

        if self.is_shape_dirty() {
            tracing::debug!("re-lowering plan of {} units", self.unit_count());
            self.relower()?;
        }

        let mut inputs = Vec::with_capacity(externals.len());
        for (ext, need) in externals.iter().zip(needs) {
            let desc = ext.get_info()?;
            let data = if need { ext.read_internal(false)? } else { Vec::new() };
            inputs.push(HostTensor::new(desc, data));
        }

        let (costs, nodes) = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            if st.executable.is_none() {
                tracing::debug!(
                    "building {} units on `{}` with {} threads",
                    st.units.len(),
                    st.backend.name(),
                    st.config.num_threads
                );
                st.executable = Some(st.backend.build_units(st.units.clone(), &st.config)?);
            }
            let exec = st
                .executable
                .as_mut()
                .ok_or_else(|| Error::msg("plan was not built"))?;
            exec.recycle(std::mem::take(&mut st.outputs));
            st.outputs = exec.run(&inputs)?;
            let costs = if st.config.profile {
                exec.take_costs()
            } else {
                Vec::new()
            };
            st.generation += 1;
            st.content_dirty = false;
            st.stamps = stamps;
            (costs, st.nodes.clone())
        };

        for node in nodes.iter().filter_map(Weak::upgrade) {
            if self.is_attached(&node) {
                node.inside().borrow_mut().content_dirty = false;
            }
        }
        for cost in &costs {
            executor.add_op_cost_time(cost.kind, cost.time_ms);
            executor.add_op_flops(cost.kind, cost.flops);
        }
        Ok(())
    }

    /// Copy output `slot` of the last run into `dest`.
    pub(crate) fn output_into(&self, slot: usize, dest: &mut TensorBuffer) -> Result<()> {
        let st = self.state.borrow();
        let out = st
            .outputs
            .get(slot)
            .ok_or_else(|| Error::NotReady(format!("plan output {slot} is not computed")))?;
        match dest {
            TensorBuffer::Owned(buf) => {
                buf.clear();
                buf.extend_from_slice(&out.data);
            }
            other => *other = TensorBuffer::Owned(out.data.clone()),
        }
        Ok(())
    }

    /// Drop the built plan and its computed values; the next run rebuilds.
    pub(crate) fn release(&self) {
        let mut st = self.state.borrow_mut();
        st.executable = None;
        st.outputs.clear();
        st.content_dirty = true;
    }
}

impl fmt::Debug for ComputeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("ComputeCache")
            .field("backend", &st.backend.name())
            .field("units", &st.units.len())
            .field("externals", &st.externals.len())
            .field("shape_dirty", &st.shape_dirty)
            .field("content_dirty", &st.content_dirty)
            .field("generation", &st.generation)
            .finish()
    }
}
