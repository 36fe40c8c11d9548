use std::{collections::HashSet, fmt, rc::Rc};

use crate::{
    dtype::{bytes_to_vec, write_slice},
    executor::ComputeCache,
    expr::{addr, LeafData},
    Context, DType, Descriptor, Error, Executor, Expr, ExprRef, Result, VarKind,
};

/// Handle to one output of one node. This is the user-facing unit of a
/// graph; equality is by (node identity, output index).
#[derive(Clone)]
pub struct Var {
    pub(crate) expr: ExprRef,
    pub(crate) index: usize,
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.expr, &other.expr) && self.index == other.index
    }
}

impl Eq for Var {}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Var({:?}#{})", self.expr.name(), self.index)
    }
}

impl Var {
    pub(crate) fn new(expr: ExprRef, index: usize) -> Self {
        Self { expr, index }
    }

    /// Handle to output `index` of a node built with [`Expr::create_leaf`]
    /// or [`Expr::create_op`].
    pub fn from_expr(expr: ExprRef, index: usize) -> Result<Self> {
        if index >= expr.output_size() {
            return Err(Error::InvalidNode(format!(
                "{}#{index} of {} outputs",
                expr.name(),
                expr.output_size()
            )));
        }
        Ok(Self::new(expr, index))
    }

    fn check_index(&self) -> Result<()> {
        if self.index < self.expr.output_size() {
            Ok(())
        } else {
            Err(Error::InvalidNode(format!("{}#{}", self.expr.name(), self.index)))
        }
    }

    /// The owning node and output index.
    pub fn expr(&self) -> (&ExprRef, usize) {
        (&self.expr, self.index)
    }

    pub fn kind(&self) -> VarKind {
        self.expr.kind()
    }

    pub fn name(&self) -> String {
        self.expr.output_name(self.index)
    }

    /// Name this output; also names the node if it has no name yet.
    pub fn set_name(&self, name: &str) {
        self.expr.set_output_name(self.index, name);
    }

    /// Number of live consumer links of the owning node.
    pub fn link_number(&self) -> usize {
        self.expr.link_count()
    }

    pub fn to_exprs(&self) -> Vec<ExprRef> {
        self.expr.consumers()
    }

    pub fn get_info(&self) -> Result<Descriptor> {
        self.expr.require_info()?;
        let inside = self.expr.inside();
        let ins = inside.borrow();
        ins.infos
            .get(self.index)
            .cloned()
            .ok_or_else(|| Error::InvalidNode(format!("{}#{}", self.expr.name(), self.index)))
    }

    fn input_leaf_check(&self, action: &str) -> Result<()> {
        if self.expr.is_leaf() && self.expr.kind() == VarKind::Input {
            return Ok(());
        }
        tracing::warn!("can't {action} `{}`: not an input", self.expr.name());
        Err(Error::illegal(self.expr.name(), format!("{action} needs an input leaf")))
    }

    /// Change the extents of an input leaf. Its content becomes dirty and
    /// every consumer must re-infer its shape.
    pub fn resize(&self, dims: &[i32]) -> Result<()> {
        self.input_leaf_check("resize")?;
        let inside = self.expr.inside();
        let mut desc = {
            let ins = inside.borrow();
            if ins.infos[0].dims == dims {
                return Ok(());
            }
            ins.infos[0].clone()
        };
        desc.dims = dims.to_vec();
        desc.sync_size();
        if desc.size == 0 {
            return Err(Error::illegal(
                self.expr.name(),
                format!("cannot resize to {dims:?}"),
            ));
        }
        {
            let mut ins = inside.borrow_mut();
            ins.buffers[0].alloc(desc.byte_size())?;
            ins.infos[0] = desc;
            ins.info_dirty = false;
            ins.content_dirty = true;
            ins.version += 1;
        }
        self.expr.set_valid(true);
        self.expr.visit_outputs(&mut |e, _| e.set_info_dirty());
        Ok(())
    }

    /// Feed an input (or trainable) leaf with a snapshot of `src`. Passing
    /// `None` closes the input: every consumer is invalidated and the call
    /// reports [`Error::InputClosed`].
    pub fn input(&self, src: Option<&Var>) -> Result<()> {
        if !self.expr.is_leaf() || self.expr.kind() == VarKind::Constant {
            tracing::warn!("can't input to `{}`: not an input leaf", self.expr.name());
            return Err(Error::illegal(
                self.expr.name(),
                "only input and trainable leaves accept input",
            ));
        }
        let Some(src) = src else {
            self.expr.visit_outputs(&mut |e, _| {
                let recurse = e.is_valid();
                e.set_valid(false);
                recurse
            });
            self.expr.set_valid(false);
            return Err(Error::InputClosed(self.expr.name()));
        };

        let info = src.get_info()?;
        let bytes = if info.size > 0 {
            src.read_internal(false)?
        } else {
            Vec::new()
        };
        let inside = self.expr.inside();
        let need_change = !self.expr.is_valid() || !inside.borrow().infos[0].same_shape(&info);
        if need_change {
            let mut ins = inside.borrow_mut();
            if info.size > 0 {
                ins.buffers[0].alloc(info.byte_size())?;
            } else {
                ins.buffers[0].release();
            }
            ins.infos[0] = info;
            ins.info_dirty = false;
        }
        if !bytes.is_empty() {
            self.write_internal(false, |dst| {
                let n = dst.len().min(bytes.len());
                dst[..n].copy_from_slice(&bytes[..n]);
            })?;
        }
        self.expr.set_valid(true);
        if need_change {
            self.expr.visit_outputs(&mut |e, _| e.set_info_dirty());
        } else {
            self.inform_dirty();
        }
        let mut ins = inside.borrow_mut();
        ins.content_dirty = false;
        ins.version += 1;
        Ok(())
    }

    /// Content-only change notice. Consumers whose shape depends on this
    /// content are fully re-resolved; consumers that only read the content
    /// get their cache marked for a re-run.
    pub fn inform_dirty(&self) {
        let executor = Executor::current();
        let mut visited = HashSet::new();
        self.expr.visit_outputs(&mut |consumer, slot| {
            if !visited.insert((addr(consumer), slot)) {
                return false;
            }
            let req = consumer.requirement();
            if req.shape_need_content.get(slot).copied().unwrap_or(false) {
                consumer.set_info_dirty();
                consumer.visit_outputs(&mut |e, _| e.set_info_dirty());
                return false;
            }
            if req.content_need_content.get(slot).copied().unwrap_or(false) {
                if let Some(cache) = consumer.cache() {
                    executor.set_content_dirty(&cache);
                }
            }
            false
        });
    }

    /// Resolve shape, attach a cache if needed and run it.
    fn compute(&self, force_cpu: bool) -> Result<Rc<ComputeCache>> {
        self.expr.require_info()?;
        let executor = Executor::current();
        let cache = match self.expr.cache() {
            Some(cache) => cache,
            None => {
                executor.make_cache(&[self.expr.clone()], force_cpu)?;
                self.expr
                    .cache()
                    .with_context(|| format!("no cache attached to `{}`", self.expr.name()))?
            }
        };
        executor.run_cache(&cache)?;
        Ok(cache)
    }

    fn check_readable(&self) -> Result<()> {
        self.check_index()?;
        if !self.expr.is_valid() {
            return Err(Error::InvalidNode(self.expr.name()));
        }
        if self.expr.is_leaf()
            && self.expr.kind() == VarKind::Input
            && self.expr.content_dirty()
        {
            return Err(Error::NotReady(self.expr.name()));
        }
        Ok(())
    }

    /// Bring this output's content up to date without copying it out.
    pub(crate) fn materialize(&self) -> Result<()> {
        self.check_readable()?;
        if !self.expr.is_leaf() {
            self.compute(false)?;
        }
        Ok(())
    }

    /// Identifies the content version this handle currently resolves to.
    pub(crate) fn content_stamp(&self) -> (usize, u64) {
        let inside = self.expr.inside();
        let ins = inside.borrow();
        match &ins.cache {
            Some(cache) if !self.expr.is_leaf() => (Rc::as_ptr(cache) as usize, cache.generation()),
            _ => (Rc::as_ptr(&inside) as usize, ins.version),
        }
    }

    /// Materialize and copy out this output's bytes. `for_shape` requests a
    /// host-only plan, used when a shape depends on this content.
    pub fn read_internal(&self, for_shape: bool) -> Result<Vec<u8>> {
        self.check_readable()?;
        let inside = self.expr.inside();
        if self.expr.is_leaf() {
            let ins = inside.borrow();
            return Ok(ins.buffers[self.index].to_bytes(ins.infos[self.index].byte_size()));
        }
        let cache = self.compute(for_shape)?;
        let executor = Executor::current();
        let mut ins = inside.borrow_mut();
        let slot = ins.cache_offset + self.index;
        executor.map_output(&cache, slot, &mut ins.buffers[self.index])?;
        ins.content_dirty = false;
        Ok(ins.buffers[self.index].to_bytes(ins.infos[self.index].byte_size()))
    }

    /// Write into a leaf's host buffer through `f`. Computed outputs are not
    /// writable.
    pub fn write_internal<R>(&self, inform: bool, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        if !self.expr.is_leaf() {
            return Err(Error::illegal(
                self.expr.name(),
                "computed outputs are not writable",
            ));
        }
        self.check_index()?;
        if inform {
            self.inform_dirty();
        }
        let inside = self.expr.inside();
        let mut ins = inside.borrow_mut();
        ins.content_dirty = false;
        ins.version += 1;
        let len = ins.infos[self.index].byte_size();
        Ok(ins.buffers[self.index].with_bytes_mut(|b| {
            let n = len.min(b.len());
            f(&mut b[..n])
        }))
    }

    fn check_dtype<T: DType>(&self, desc: &Descriptor) -> Result<()> {
        if desc.dtype != T::ELEMENT {
            crate::bail!(
                "`{}` holds {} elements, accessed as {}",
                self.expr.name(),
                desc.dtype,
                T::NAME
            );
        }
        Ok(())
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.read_internal(false)
    }

    /// Typed copy of this output's content.
    pub fn read_map<T: DType>(&self) -> Result<Vec<T>> {
        let desc = self.get_info()?;
        self.check_dtype::<T>(&desc)?;
        let mut values = bytes_to_vec::<T>(&self.read_internal(false)?);
        values.truncate(desc.size);
        Ok(values)
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let desc = self.get_info()?;
        if bytes.len() != desc.byte_size() {
            crate::bail!(
                "`{}` takes {} bytes, got {}",
                self.expr.name(),
                desc.byte_size(),
                bytes.len()
            );
        }
        self.write_internal(true, |dst| dst.copy_from_slice(bytes))
    }

    /// Overwrite a leaf's content; consumers are informed.
    pub fn write_map<T: DType>(&self, values: &[T]) -> Result<()> {
        let desc = self.get_info()?;
        self.check_dtype::<T>(&desc)?;
        if values.len() != desc.size {
            crate::bail!(
                "`{}` takes {} elements, got {}",
                self.expr.name(),
                desc.size,
                values.len()
            );
        }
        self.write_internal(true, |dst| write_slice(values, dst))
    }

    /// Freeze this output into a leaf of `kind` holding its current value.
    pub fn fix(&mut self, kind: VarKind) -> Result<()> {
        if kind == VarKind::Computed {
            return Err(Error::illegal(self.name(), "cannot fix into a computed node"));
        }
        let info = self.get_info()?;
        let bytes = self.read_internal(false)?;
        let leaf = Expr::create_leaf(info, LeafData::Copy(&bytes), kind, self.expr.name())?;
        let fixed = Var::new(leaf, 0);
        fixed.set_name(&self.name());
        Var::replace(self, &fixed)
    }

    /// Make `dst` (and every consumer of its node) read `src`.
    ///
    /// Same node: only the output index moves. Nodes with different output
    /// counts: consumers of `dst` are re-wired to `src`. Otherwise the node of
    /// `dst` takes on the node of `src` through [`Expr::replace`].
    pub fn replace(dst: &mut Var, src: &Var) -> Result<()> {
        if Rc::ptr_eq(&dst.expr, &src.expr) {
            dst.index = src.index;
            return Ok(());
        }
        if dst.expr.output_size() != src.expr.output_size() {
            let mut visited = HashSet::new();
            dst.expr.visit_outputs(&mut |e, _| {
                if !visited.insert(addr(e)) {
                    return false;
                }
                e.reset_for_replace();
                true
            });
            for consumer in dst.expr.consumers() {
                if consumer.rewire_input(dst, src) > 0 {
                    src.expr.link_consumer(&consumer);
                    if !consumer.inputs().iter().any(|v| Rc::ptr_eq(&v.expr, &dst.expr)) {
                        dst.expr.unlink_consumer(&consumer);
                    }
                }
            }
            *dst = src.clone();
            return Ok(());
        }
        Expr::replace(&dst.expr, &src.expr)?;
        dst.index = src.index;
        Ok(())
    }

    /// Resolve shapes of `vars` and build one shared cache over those not
    /// cached yet.
    pub fn prepare_compute(vars: &[Var], force_cpu: bool) -> Result<()> {
        let mut seen = HashSet::new();
        let mut exprs = Vec::new();
        for var in vars {
            let expr = &var.expr;
            if expr.is_leaf() || expr.cache().is_some() || !seen.insert(addr(expr)) {
                continue;
            }
            expr.require_info()?;
            exprs.push(expr.clone());
        }
        if exprs.is_empty() {
            return Ok(());
        }
        Executor::current().make_cache(&exprs, force_cpu)
    }
}
