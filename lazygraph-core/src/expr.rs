use std::{
    cell::RefCell,
    collections::HashSet,
    fmt,
    rc::{Rc, Weak},
};

use serde::{Deserialize, Serialize};

use crate::{
    backend::InfoInput,
    executor::ComputeCache,
    op::Requirement,
    storage::{SharedBuffer, TensorBuffer},
    Descriptor, Error, Executor, Op, Result, Var,
};

/// Shared ownership of a node. Node identity is the allocation address.
pub type ExprRef = Rc<Expr>;

/// What a leaf holds, or `Computed` for operator nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    Input,
    Constant,
    Trainable,
    Computed,
}

/// Initial content of a leaf node.
pub enum LeafData<'a> {
    /// No content. An input leaf with a known shape starts content-dirty.
    None,
    /// Copied into a buffer owned by the node.
    Copy(&'a [u8]),
    /// Referenced without copying until the node reallocates.
    Adopt(SharedBuffer),
}

/// Resolved per-output state of one node.
#[derive(Debug, Default)]
pub(crate) struct Inside {
    pub(crate) infos: Vec<Descriptor>,
    pub(crate) buffers: Vec<TensorBuffer>,
    pub(crate) req: Requirement,
    pub(crate) cache: Option<Rc<ComputeCache>>,
    pub(crate) cache_offset: usize,
    pub(crate) info_dirty: bool,
    pub(crate) content_dirty: bool,
    /// Bumped on every content or shape change of this node.
    pub(crate) version: u64,
}

impl Inside {
    fn new(outputs: usize) -> Self {
        Self {
            infos: vec![Descriptor::default(); outputs],
            buffers: (0..outputs).map(|_| TensorBuffer::Empty).collect(),
            info_dirty: true,
            content_dirty: true,
            ..Default::default()
        }
    }

    /// State for a node taking on this one's behaviour. Leaf content is
    /// carried over; computed outputs start unresolved and uncached.
    fn detached(&self, leaf: bool) -> Self {
        if leaf {
            Self {
                infos: self.infos.clone(),
                buffers: self.buffers.clone(),
                req: self.req.clone(),
                info_dirty: self.info_dirty,
                content_dirty: self.content_dirty,
                ..Default::default()
            }
        } else {
            Self {
                infos: self.infos.clone(),
                req: self.req.clone(),
                ..Self::new(self.infos.len())
            }
        }
    }
}

struct ExprState {
    name: String,
    output_names: Vec<String>,
    op: Option<Op>,
    kind: VarKind,
    inputs: Vec<Var>,
    valid: bool,
    inside: Rc<RefCell<Inside>>,
}

/// One graph vertex: an operator over input handles, or a leaf value.
///
/// Borrows of `state` and `to` are never held across calls into other nodes,
/// which keeps traversal and surgery free of re-borrow panics.
pub struct Expr {
    state: RefCell<ExprState>,
    /// Consumers, one entry per linked input edge. Dead entries are reused.
    to: RefCell<Vec<Weak<Expr>>>,
}

pub(crate) fn addr(expr: &ExprRef) -> usize {
    Rc::as_ptr(expr) as usize
}

impl Expr {
    fn with_state(state: ExprState) -> ExprRef {
        Rc::new(Self {
            state: RefCell::new(state),
            to: RefCell::new(Vec::new()),
        })
    }

    /// Build a leaf holding `desc` and, optionally, its content.
    pub fn create_leaf(
        desc: Descriptor,
        data: LeafData<'_>,
        kind: VarKind,
        name: impl Into<String>,
    ) -> Result<ExprRef> {
        let name = name.into();
        if kind == VarKind::Computed {
            return Err(Error::illegal(name, "a leaf cannot be of computed kind"));
        }
        let mut inside = Inside::new(1);
        let bytes = desc.byte_size();
        inside.info_dirty = desc.has_unknown_dim();
        inside.content_dirty = false;
        match data {
            LeafData::Adopt(shared) => {
                if shared.len() < bytes {
                    return Err(Error::msg(format!(
                        "adopted buffer holds {} bytes, `{name}` needs {bytes}",
                        shared.len()
                    )));
                }
                inside.buffers[0] = TensorBuffer::External(shared);
            }
            LeafData::Copy(src) if bytes > 0 => {
                if src.len() < bytes {
                    return Err(Error::msg(format!(
                        "source holds {} bytes, `{name}` needs {bytes}",
                        src.len()
                    )));
                }
                inside.buffers[0].alloc(bytes)?;
                inside.buffers[0].with_bytes_mut(|dst| dst.copy_from_slice(&src[..bytes]));
            }
            LeafData::None if bytes > 0 => {
                inside.buffers[0].alloc(bytes)?;
                inside.content_dirty = kind == VarKind::Input;
            }
            LeafData::Copy(_) | LeafData::None => {}
        }
        inside.infos[0] = desc;
        Ok(Self::with_state(ExprState {
            name,
            output_names: vec![String::new()],
            op: None,
            kind,
            inputs: Vec::new(),
            valid: true,
            inside: Rc::new(RefCell::new(inside)),
        }))
    }

    /// Build an operator node over `inputs` and link it into their consumer
    /// lists. The requirement table is taken from the current executor.
    pub fn create_op(op: Op, inputs: Vec<Var>, name: impl Into<String>) -> ExprRef {
        let outputs = op.output_count();
        let mut inside = Inside::new(outputs);
        inside.req = Executor::current().requirement(&op, inputs.len());
        let expr = Self::with_state(ExprState {
            name: name.into(),
            output_names: vec![String::new(); outputs],
            op: Some(op),
            kind: VarKind::Computed,
            inputs,
            valid: true,
            inside: Rc::new(RefCell::new(inside)),
        });
        expr.add_link_for_inputs();
        expr
    }

    fn add_link_for_inputs(self: &Rc<Self>) {
        let inputs = self.inputs();
        for input in &inputs {
            input.expr.link_consumer(self);
        }
    }

    /// Record `consumer` in this node's back-references, reusing a dead slot.
    pub(crate) fn link_consumer(&self, consumer: &ExprRef) {
        let mut to = self.to.borrow_mut();
        let weak = Rc::downgrade(consumer);
        match to.iter_mut().find(|w| w.strong_count() == 0) {
            Some(slot) => *slot = weak,
            None => to.push(weak),
        }
    }

    fn links_to(&self, consumer: &ExprRef) -> bool {
        self.to
            .borrow()
            .iter()
            .any(|w| std::ptr::eq(w.as_ptr(), Rc::as_ptr(consumer)))
    }

    pub(crate) fn unlink_consumer(&self, consumer: &ExprRef) {
        for slot in self.to.borrow_mut().iter_mut() {
            if std::ptr::eq(slot.as_ptr(), Rc::as_ptr(consumer)) {
                *slot = Weak::new();
            }
        }
    }

    pub fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state.borrow_mut().name = name.into();
    }

    pub fn output_name(&self, index: usize) -> String {
        self.state
            .borrow()
            .output_names
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn set_output_name(&self, index: usize, name: &str) {
        let mut state = self.state.borrow_mut();
        if let Some(slot) = state.output_names.get_mut(index) {
            *slot = name.to_string();
        }
        if state.name.is_empty() {
            state.name = name.to_string();
        }
    }

    pub fn op(&self) -> Option<Op> {
        self.state.borrow().op.clone()
    }

    pub fn is_leaf(&self) -> bool {
        self.state.borrow().op.is_none()
    }

    pub fn kind(&self) -> VarKind {
        self.state.borrow().kind
    }

    pub fn inputs(&self) -> Vec<Var> {
        self.state.borrow().inputs.clone()
    }

    pub fn output_size(&self) -> usize {
        self.state.borrow().output_names.len()
    }

    pub fn is_valid(&self) -> bool {
        self.state.borrow().valid
    }

    pub(crate) fn set_valid(&self, valid: bool) {
        self.state.borrow_mut().valid = valid;
    }

    pub fn info_dirty(&self) -> bool {
        self.inside().borrow().info_dirty
    }

    pub fn content_dirty(&self) -> bool {
        self.inside().borrow().content_dirty
    }

    /// Mutation counter: bumped on every shape or content change.
    pub fn version(&self) -> u64 {
        self.inside().borrow().version
    }

    pub fn requirement(&self) -> Requirement {
        self.inside().borrow().req.clone()
    }

    pub(crate) fn inside(&self) -> Rc<RefCell<Inside>> {
        self.state.borrow().inside.clone()
    }

    /// The compute cache this node's outputs are read from, if built.
    pub fn cache(&self) -> Option<Rc<ComputeCache>> {
        self.inside().borrow().cache.clone()
    }

    /// Live consumers, each listed once.
    pub fn consumers(&self) -> Vec<ExprRef> {
        let mut out: Vec<ExprRef> = Vec::new();
        for consumer in self.to.borrow().iter().filter_map(Weak::upgrade) {
            if !out.iter().any(|e| Rc::ptr_eq(e, &consumer)) {
                out.push(consumer);
            }
        }
        out
    }

    /// Number of live consumer links.
    pub fn link_count(&self) -> usize {
        self.to.borrow().iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Resolve output descriptors, pulling input shapes (and input content
    /// where the shape depends on it) first.
    pub fn require_info(self: &Rc<Self>) -> Result<()> {
        let inside = self.inside();
        if !inside.borrow().info_dirty {
            return Ok(());
        }
        let (op, inputs, name) = {
            let state = self.state.borrow();
            if !state.valid {
                return Err(Error::InvalidNode(state.name.clone()));
            }
            (state.op.clone(), state.inputs.clone(), state.name.clone())
        };
        let Some(op) = op else {
            let mut ins = inside.borrow_mut();
            if ins.infos[0].has_unknown_dim() {
                return Err(Error::ShapeUnresolved { name });
            }
            ins.info_dirty = false;
            return Ok(());
        };

        let req = inside.borrow().req.clone();
        let mut infos = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let desc = input.get_info()?;
            let content = if req.shape_need_content.get(i).copied().unwrap_or(false) {
                Some(input.read_internal(true)?)
            } else {
                None
            };
            infos.push(InfoInput { desc, content });
        }

        let computed = Executor::current()
            .compute_info(&op, &infos)
            .and_then(|descs| {
                if descs.len() == self.output_size() {
                    Ok(descs)
                } else {
                    Err(Error::backend(
                        "shape",
                        format!("{} produced {} outputs", op.kind_name(), descs.len()),
                    ))
                }
            });
        match computed {
            Ok(descs) => {
                let mut ins = inside.borrow_mut();
                ins.infos = descs;
                ins.info_dirty = false;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("shape inference failed for `{name}`: {e}");
                self.set_valid(false);
                Err(e)
            }
        }
    }

    /// Walk consumer edges. `visit(consumer, slot)` runs once per input slot
    /// of a live consumer that reads this node; the walk descends into that
    /// consumer's own consumers only if some call returned true. Dead
    /// back-references are pruned on the way.
    pub fn visit_outputs(self: &Rc<Self>, visit: &mut dyn FnMut(&ExprRef, usize) -> bool) {
        let consumers = {
            self.to.borrow_mut().retain(|w| w.strong_count() > 0);
            self.consumers()
        };
        for consumer in consumers {
            let slots: Vec<usize> = consumer
                .state
                .borrow()
                .inputs
                .iter()
                .enumerate()
                .filter(|(_, v)| Rc::ptr_eq(&v.expr, self))
                .map(|(i, _)| i)
                .collect();
            let mut recurse = false;
            for slot in slots {
                recurse |= visit(&consumer, slot);
            }
            if recurse {
                consumer.visit_outputs(visit);
            }
        }
    }

    /// Mark descriptors and content stale. Returns false, without side
    /// effects, if the node is already info-dirty and valid.
    pub fn set_info_dirty(&self) -> bool {
        let inside = self.inside();
        let leaf = {
            let mut state = self.state.borrow_mut();
            if inside.borrow().info_dirty && state.valid {
                return false;
            }
            state.valid = true;
            state.op.is_none()
        };
        let cache = {
            let mut ins = inside.borrow_mut();
            ins.info_dirty = true;
            ins.content_dirty = true;
            ins.version += 1;
            if !leaf {
                ins.buffers.iter_mut().for_each(TensorBuffer::release);
            }
            ins.cache.clone()
        };
        if let Some(cache) = cache {
            Executor::current().set_shape_dirty(&cache);
        }
        true
    }

    /// Detach from any cache and force full re-resolution.
    pub(crate) fn reset_for_replace(&self) {
        let inside = self.inside();
        {
            let mut ins = inside.borrow_mut();
            ins.cache = None;
            ins.cache_offset = 0;
            ins.info_dirty = true;
            ins.content_dirty = true;
            ins.version += 1;
        }
        self.set_valid(true);
    }

    /// Replace the inputs equal to `from` by `to`. Returns how many changed.
    pub(crate) fn rewire_input(&self, from: &Var, to: &Var) -> usize {
        let mut state = self.state.borrow_mut();
        let mut changed = 0;
        for input in state.inputs.iter_mut().filter(|v| **v == *from) {
            *input = to.clone();
            changed += 1;
        }
        changed
    }

    /// True if `target` is `root` or one of its transitive inputs.
    pub(crate) fn reaches(root: &ExprRef, target: &ExprRef) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![root.clone()];
        while let Some(expr) = stack.pop() {
            if Rc::ptr_eq(&expr, target) {
                return true;
            }
            if visited.insert(addr(&expr)) {
                stack.extend(expr.inputs().into_iter().map(|v| v.expr));
            }
        }
        false
    }

    /// Graph surgery: `old` keeps its identity and consumers but takes on the
    /// operator, inputs and state of `from`. Consumers of `old` are marked
    /// dirty once each.
    pub fn replace(old: &ExprRef, from: &ExprRef) -> Result<()> {
        if Rc::ptr_eq(old, from) {
            return Ok(());
        }
        if from.inputs().iter().any(|v| Self::reaches(&v.expr, old)) {
            return Err(Error::illegal(
                old.name(),
                "replacement depends on the node it replaces",
            ));
        }

        for input in old.inputs() {
            input.expr.unlink_consumer(old);
        }
        for input in from.inputs() {
            if !input.expr.links_to(old) {
                input.expr.link_consumer(old);
            }
        }

        {
            let src = from.state.borrow();
            let mut dst = old.state.borrow_mut();
            dst.op = src.op.clone();
            dst.name = src.name.clone();
            dst.output_names = src.output_names.clone();
            dst.kind = src.kind;
            dst.valid = src.valid;
            let detached = src.inside.borrow().detached(src.op.is_none());
            dst.inside = Rc::new(RefCell::new(detached));
            dst.inputs = src.inputs.clone();
        }

        let mut visited = HashSet::new();
        old.visit_outputs(&mut |consumer, _| {
            if !visited.insert(addr(consumer)) {
                return false;
            }
            consumer.reset_for_replace();
            true
        });
        Ok(())
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Expr")
            .field("name", &state.name)
            .field("kind", &state.kind)
            .field("op", &state.op.as_ref().map(Op::kind_name))
            .field("inputs", &state.inputs.len())
            .field("valid", &state.valid)
            .finish()
    }
}
