//! Persisted graphs.
//!
//! A graph is saved as a list of operator records in execution order. Each
//! output of each record owns one tensor slot; inputs reference slots of
//! earlier records only. On disk the record list is bincode-encoded behind a
//! 4-byte magic and a little-endian format version.

use std::{collections::BTreeMap, collections::HashMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    expr::addr, traversal::get_execute_order, Context, Descriptor, Error, Expr, LeafData, Op, Result, Var,
    VarKind,
};

const MAGIC: &[u8; 4] = b"LZGR";
const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OpPayload {
    /// Input placeholder: shape only.
    Input { desc: Descriptor },
    /// Constant or trainable leaf with its raw content.
    Blob {
        desc: Descriptor,
        kind: VarKind,
        data: Vec<u8>,
    },
    Op(Op),
}

impl OpPayload {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Input { .. } => "Input",
            Self::Blob {
                kind: VarKind::Trainable,
                ..
            } => "TrainableParam",
            Self::Blob { .. } => "Const",
            Self::Op(op) => op.kind_name(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpRecord {
    pub name: String,
    pub main: OpPayload,
    pub input_indexes: Vec<usize>,
    pub output_indexes: Vec<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetDef {
    pub oplists: Vec<OpRecord>,
    /// Slot index to tensor name.
    pub tensor_names: Vec<String>,
}

/// Describe the subgraph reaching `vars`. Unnamed nodes are named after
/// their operator kind and position; unnamed tensors after their node.
pub fn save(vars: &[Var]) -> Result<NetDef> {
    let order = get_execute_order(vars);
    let mut first_slot = HashMap::with_capacity(order.len());
    let mut slots = 0;
    for expr in &order {
        first_slot.insert(addr(expr), slots);
        slots += expr.output_size();
    }

    let mut net = NetDef {
        oplists: Vec::with_capacity(order.len()),
        tensor_names: vec![String::new(); slots],
    };
    for (i, expr) in order.iter().enumerate() {
        let main = match expr.op() {
            Some(op) => OpPayload::Op(op),
            None => {
                let desc = expr.inside().borrow().infos[0].clone();
                match expr.kind() {
                    VarKind::Input => OpPayload::Input { desc },
                    kind => OpPayload::Blob {
                        data: Var::new(expr.clone(), 0).read_internal(false)?,
                        desc,
                        kind,
                    },
                }
            }
        };
        let mut name = expr.name();
        if name.is_empty() {
            name = format!("{}{}", main.kind_name(), i + 1);
        }
        let input_indexes = expr
            .inputs()
            .iter()
            .map(|v| {
                first_slot
                    .get(&addr(&v.expr))
                    .map(|s| s + v.index)
                    .ok_or_else(|| Error::InvalidGraph(format!("`{name}` reads an unordered node")))
            })
            .collect::<Result<Vec<_>>>()?;
        let base = first_slot[&addr(expr)];
        let output_indexes: Vec<usize> = (base..base + expr.output_size()).collect();
        for (v, &slot) in output_indexes.iter().enumerate() {
            let tensor = expr.output_name(v);
            net.tensor_names[slot] = match tensor {
                t if !t.is_empty() => t,
                _ if v == 0 => name.clone(),
                _ => format!("{name}{v}"),
            };
        }
        net.oplists.push(OpRecord {
            name,
            main,
            input_indexes,
            output_indexes,
        });
    }
    Ok(net)
}

/// Rebuild a graph. Returns one handle per tensor slot, in slot order.
pub fn load(net: &NetDef) -> Result<Vec<Var>> {
    let mut slots: Vec<Option<Var>> = vec![None; net.tensor_names.len()];
    for record in &net.oplists {
        let mut inputs = Vec::with_capacity(record.input_indexes.len());
        for &index in &record.input_indexes {
            match slots.get(index).cloned().flatten() {
                Some(var) => inputs.push(var),
                None => {
                    tracing::warn!("`{}` reads tensor {index} before it is defined", record.name);
                    return Err(Error::InvalidGraph(format!(
                        "`{}` reads undefined tensor {index}",
                        record.name
                    )));
                }
            }
        }
        let name = record.name.clone();
        let outputs = match &record.main {
            OpPayload::Input { desc } => {
                let mut desc = desc.clone();
                if desc.dims.first() == Some(&-1) {
                    desc.dims[0] = 1;
                    desc.sync_size();
                }
                let leaf = Expr::create_leaf(desc, LeafData::None, VarKind::Input, name)?;
                vec![Var::new(leaf, 0)]
            }
            OpPayload::Blob { desc, kind, data } => {
                let leaf = Expr::create_leaf(desc.clone(), LeafData::Copy(data), *kind, name)?;
                vec![Var::new(leaf, 0)]
            }
            OpPayload::Op(op) => {
                if inputs.len() != op.input_count() {
                    return Err(Error::InvalidGraph(format!(
                        "`{name}` has {} inputs, {} takes {}",
                        inputs.len(),
                        op.kind_name(),
                        op.input_count()
                    )));
                }
                let expr = Expr::create_op(op.clone(), inputs, name);
                (0..expr.output_size())
                    .map(|i| Var::new(expr.clone(), i))
                    .collect()
            }
        };
        if outputs.len() != record.output_indexes.len() {
            return Err(Error::InvalidGraph(format!(
                "`{}` declares {} outputs, has {}",
                record.name,
                record.output_indexes.len(),
                outputs.len()
            )));
        }
        for (var, &slot) in outputs.into_iter().zip(&record.output_indexes) {
            let entry = slots
                .get_mut(slot)
                .ok_or_else(|| Error::InvalidGraph(format!("tensor slot {slot} out of range")))?;
            var.set_name(&net.tensor_names[slot]);
            *entry = Some(var);
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

pub fn save_to_bytes(vars: &[Var]) -> Result<Vec<u8>> {
    let net = save(vars)?;
    let mut out = MAGIC.to_vec();
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bincode::serialize_into(&mut out, &net)?;
    Ok(out)
}

pub fn save_to_file<P: AsRef<Path>>(vars: &[Var], path: P) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, save_to_bytes(vars)?).with_context(|| format!("writing {}", path.display()))
}

fn decode(bytes: &[u8]) -> Result<NetDef> {
    if bytes.len() < 8 || &bytes[..4] != MAGIC {
        return Err(Error::InvalidGraph("not a saved graph".to_string()));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(Error::InvalidGraph(format!(
            "format version {version}, expected {FORMAT_VERSION}"
        )));
    }
    Ok(bincode::deserialize(&bytes[8..])?)
}

pub fn load_from_bytes(bytes: &[u8]) -> Result<Vec<Var>> {
    load(&decode(bytes)?)
}

pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<Var>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    load_from_bytes(&bytes)
}

fn by_name(vars: Vec<Var>) -> BTreeMap<String, Var> {
    vars.into_iter().map(|v| (v.name(), v)).collect()
}

pub fn load_map_from_bytes(bytes: &[u8]) -> Result<BTreeMap<String, Var>> {
    load_from_bytes(bytes).map(by_name)
}

pub fn load_map_from_file<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, Var>> {
    load_from_file(path).map(by_name)
}

pub fn map_to_sequence(map: &BTreeMap<String, Var>) -> Vec<Var> {
    map.values().cloned().collect()
}

/// Split a loaded graph into its input placeholders and its terminal
/// outputs, those without a live consumer.
pub fn get_input_and_output(
    map: &BTreeMap<String, Var>,
) -> (BTreeMap<String, Var>, BTreeMap<String, Var>) {
    let mut inputs = BTreeMap::new();
    let mut outputs = BTreeMap::new();
    for (name, var) in map {
        if var.expr.is_leaf() && var.kind() == VarKind::Input {
            inputs.insert(name.clone(), var.clone());
        }
        if var.link_number() == 0 {
            outputs.insert(name.clone(), var.clone());
        }
    }
    (inputs, outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_foreign_headers() {
        assert!(matches!(
            load_from_bytes(b"nope"),
            Err(Error::InvalidGraph(_))
        ));
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        assert!(matches!(load_from_bytes(&bytes), Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn missing_input_aborts_load() {
        let net = NetDef {
            oplists: vec![OpRecord {
                name: "neg".to_string(),
                main: OpPayload::Op(Op::Unary(crate::op::UnaryOpType::Neg)),
                input_indexes: vec![0],
                output_indexes: vec![1],
            }],
            tensor_names: vec!["x".to_string(), "y".to_string()],
        };
        assert!(matches!(load(&net), Err(Error::InvalidGraph(_))));
    }
}
