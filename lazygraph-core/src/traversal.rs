use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    env, fs,
    path::Path,
    process::Command,
};

use petgraph::{
    dot::{Config, Dot},
    graph::{DiGraph, NodeIndex},
};

use crate::{expr::addr, Error, Expr, ExprRef, Result, Var};

impl Expr {
    /// Depth-first walk over inputs. `before` returning false cuts the walk
    /// below that node; `after` runs once all of a node's inputs are done and
    /// its result is passed through.
    pub fn visit(
        expr: &ExprRef,
        before: &mut dyn FnMut(&ExprRef) -> bool,
        after: &mut dyn FnMut(&ExprRef) -> bool,
    ) -> bool {
        if !before(expr) {
            return true;
        }
        for input in expr.inputs() {
            if !Self::visit(&input.expr, before, after) {
                return false;
            }
        }
        after(expr)
    }
}

/// Every node `outputs` depend on, producers before consumers, each once.
pub fn get_execute_order(outputs: &[Var]) -> Vec<ExprRef> {
    let visited = RefCell::new(HashSet::new());
    let mut order = Vec::new();
    for output in outputs {
        Expr::visit(
            &output.expr,
            &mut |e| !visited.borrow().contains(&addr(e)),
            &mut |e| {
                if visited.borrow_mut().insert(addr(e)) {
                    order.push(e.clone());
                }
                true
            },
        );
    }
    order
}

fn label(expr: &ExprRef) -> String {
    let what = match expr.op() {
        Some(op) => op.kind_name().to_string(),
        None => format!("{:?}", expr.kind()),
    };
    match expr.name() {
        name if name.is_empty() => what,
        name => format!("{name}: {what}"),
    }
}

/// The subgraph reaching `outputs`, one vertex per node and one edge per
/// input slot.
pub fn to_petgraph(outputs: &[Var]) -> DiGraph<String, usize> {
    let mut g = DiGraph::new();
    let order = get_execute_order(outputs);
    let mut index: HashMap<usize, NodeIndex> = HashMap::with_capacity(order.len());
    for expr in &order {
        index.insert(addr(expr), g.add_node(label(expr)));
    }
    for expr in &order {
        let dst = index[&addr(expr)];
        for input in expr.inputs() {
            if let Some(&src) = index.get(&addr(&input.expr)) {
                g.add_edge(src, dst, input.index);
            }
        }
    }
    g
}

/// DOT rendering of [`to_petgraph`].
pub fn to_dot(outputs: &[Var]) -> String {
    let g = to_petgraph(outputs);
    format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
}

/// Render the graph to a PNG through Graphviz.
///
/// Install graphviz:
/// - brew install graphviz
/// - apt install graphviz
pub fn visualize<P: AsRef<Path>>(outputs: &[Var], filename: P) -> Result<()> {
    let dot_path = env::temp_dir().join("lazygraph.dot");
    fs::write(&dot_path, to_dot(outputs))?;
    let status = Command::new("dot")
        .args([
            "-Tpng",
            &dot_path.display().to_string(),
            "-o",
            &filename.as_ref().display().to_string(),
        ])
        .status()?;
    if !status.success() {
        return Err(Error::msg(format!("graphviz exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{creator, ElementType};

    #[test]
    fn diamond_is_ordered_once() {
        let a = creator::input(&[2], ElementType::F32).unwrap();
        let b = creator::sqrt(&a);
        let c = creator::neg(&a);
        let d = &b + &c;
        let order = get_execute_order(&[d.clone()]);
        assert_eq!(order.len(), 4);
        let pos = |v: &Var| order.iter().position(|e| std::rc::Rc::ptr_eq(e, &v.expr)).unwrap();
        assert_eq!(pos(&a), 0);
        assert!(pos(&b) < pos(&d) && pos(&c) < pos(&d));

        let g = to_petgraph(&[d]);
        assert_eq!(g.node_count(), 4);
        assert_eq!(g.edge_count(), 4);
    }
}
