use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use crate::{
    edsl::{
        shape::TensorShape,
        tensor::{Expr, Tensor, TensorId},
    },
    error::{BridgeError, BridgeResult},
};

/// Concrete dims for input placeholders, scoped to one compilation.
///
/// The symbolic definition is never modified; each compilation builds its own bindings.
#[derive(Debug, Clone)]
pub struct ShapeBindings {
    program: String,
    dims: HashMap<TensorId, Vec<usize>>,
}

impl ShapeBindings {
    pub fn new(program: &str) -> Self {
        ShapeBindings {
            program: program.to_string(),
            dims: HashMap::new(),
        }
    }

    pub fn bind(&mut self, slot: &Tensor, dims: &[usize]) -> BridgeResult<()> {
        if !slot.is_placeholder() {
            return Err(BridgeError::compilation(
                &self.program,
                format!("input slot {} is not a placeholder", slot),
            ));
        }
        if !slot.shape().accepts(dims) {
            return Err(BridgeError::compilation(
                &self.program,
                format!("cannot bind {:?} to input slot {}", dims, slot),
            ));
        }
        self.dims.insert(slot.id(), dims.to_vec());
        Ok(())
    }

    pub fn get(&self, slot: &Tensor) -> Option<&[usize]> {
        self.dims.get(&slot.id()).map(Vec::as_slice)
    }
}

/// A set of output expressions specialised to concrete shapes.
pub struct Program {
    name: String,
    outputs: Vec<Tensor>,
    nodes: Vec<Tensor>,
    shapes: HashMap<TensorId, TensorShape>,
}

impl Program {
    /// Specialise `outputs` to `bindings`. Every tensor in `inputs` is part of the program even
    /// when no output reads it.
    pub fn new(
        name: &str,
        inputs: &[Tensor],
        outputs: &[Tensor],
        bindings: &ShapeBindings,
    ) -> BridgeResult<Program> {
        let mut nodes = topological_order(outputs);
        for input in inputs.iter().rev() {
            if !nodes.contains(input) {
                nodes.insert(0, input.clone());
            }
        }
        let mut shapes: HashMap<TensorId, TensorShape> = HashMap::with_capacity(nodes.len());
        for node in &nodes {
            let dims = match node.expr() {
                Expr::Placeholder => bindings
                    .get(node)
                    .ok_or_else(|| {
                        BridgeError::compilation(name, format!("placeholder {} is unbound", node))
                    })?
                    .to_vec(),
                Expr::Variable(_) => node.shape().int_dims(),
                expr => {
                    let operand_dims = expr
                        .operands()
                        .iter()
                        .map(|operand| {
                            shapes[&operand.id()]
                                .dims
                                .iter()
                                .map(|d| Some(*d))
                                .collect::<Vec<_>>()
                        })
                        .collect::<Vec<_>>();
                    expr.infer_dims(&operand_dims)
                        .map_err(|reason| BridgeError::compilation(name, reason))?
                        .into_iter()
                        .collect::<Option<Vec<usize>>>()
                        .ok_or_else(|| {
                            BridgeError::compilation(
                                name,
                                format!("{} has unresolved dims", node),
                            )
                        })?
                }
            };
            shapes.insert(node.id(), TensorShape::new(node.dtype(), dims));
        }
        Ok(Program {
            name: name.to_string(),
            outputs: outputs.to_vec(),
            nodes,
            shapes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outputs(&self) -> &[Tensor] {
        &self.outputs
    }

    /// Every node reachable from the outputs, operands before their users.
    pub fn nodes(&self) -> &[Tensor] {
        &self.nodes
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Tensor> {
        self.nodes.iter().filter(|node| node.is_placeholder())
    }

    pub fn shape_of(&self, tensor: &Tensor) -> Option<&TensorShape> {
        self.shapes.get(&tensor.id())
    }
}

fn topological_order(outputs: &[Tensor]) -> Vec<Tensor> {
    let mut visited: HashSet<TensorId> = HashSet::new();
    let mut order = Vec::new();
    // (node, operands already pushed)
    let mut stack: Vec<(Tensor, bool)> = outputs.iter().rev().map(|t| (t.clone(), false)).collect();
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            if visited.insert(node.id()) {
                order.push(node);
            }
            continue;
        }
        if visited.contains(&node.id()) {
            continue;
        }
        let operands = node
            .expr()
            .operands()
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        stack.push((node, true));
        for operand in operands.into_iter().rev() {
            if !visited.contains(&operand.id()) {
                stack.push((operand, false));
            }
        }
    }
    order
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program {} {{", self.name)?;
        for node in &self.nodes {
            let operands = node
                .expr()
                .operands()
                .iter()
                .map(|operand| operand.name().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "  {}: {} = {}({})",
                node.name(),
                self.shapes[&node.id()],
                node.expr().op_name(),
                operands
            )?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{dtype::DType, edsl::shape::LogicalShape};

    fn placeholder() -> Tensor {
        Tensor::placeholder(LogicalShape::new(DType::Float32, vec![None, Some(4)]), "x")
    }

    #[test]
    fn specialise_to_bound_shape() {
        let x = placeholder();
        let y = &x * &x;
        let mut bindings = ShapeBindings::new("square");
        bindings.bind(&x, &[2, 4]).unwrap();
        let program = Program::new("square", &[x.clone()], &[y.clone()], &bindings).unwrap();
        assert_eq!(program.shape_of(&y).unwrap().dims, vec![2, 4]);
        assert_eq!(program.nodes().len(), 2);
        assert_eq!(program.placeholders().count(), 1);
    }

    #[test]
    fn same_definition_specialises_per_binding() {
        let x = placeholder();
        let y = x.sum(&[1], false);
        for rows in &[2_usize, 3, 7] {
            let mut bindings = ShapeBindings::new("rows");
            bindings.bind(&x, &[*rows, 4]).unwrap();
            let program = Program::new("rows", &[x.clone()], &[y.clone()], &bindings).unwrap();
            assert_eq!(program.shape_of(&y).unwrap().dims, vec![*rows]);
        }
        assert_eq!(x.shape().dims, vec![None, Some(4)]);
    }

    #[test]
    fn reject_incompatible_binding() {
        let x = placeholder();
        let mut bindings = ShapeBindings::new("bad");
        assert!(matches!(
            bindings.bind(&x, &[2, 5]),
            Err(BridgeError::Compilation { .. })
        ));
    }

    #[test]
    fn reject_operator_dim_mismatch() {
        let x = placeholder();
        let y = Tensor::placeholder(LogicalShape::new(DType::Float32, vec![None]), "y");
        let z = &x + &y;
        let mut bindings = ShapeBindings::new("mismatch");
        bindings.bind(&x, &[2, 4]).unwrap();
        bindings.bind(&y, &[3]).unwrap();
        assert!(matches!(
            Program::new("mismatch", &[x, y], &[z], &bindings),
            Err(BridgeError::Compilation { .. })
        ));
    }

    #[test]
    fn unbound_placeholder_fails() {
        let x = placeholder();
        let bindings = ShapeBindings::new("unbound");
        assert!(Program::new("unbound", &[], &[x.neg()], &bindings).is_err());
    }

    #[test]
    fn shared_operands_appear_once() {
        let x = placeholder();
        let a = x.exp();
        let y = &(&a + &a) * &x;
        let mut bindings = ShapeBindings::new("dag");
        bindings.bind(&x, &[1, 4]).unwrap();
        let program = Program::new("dag", &[x.clone()], &[y, a], &bindings).unwrap();
        assert_eq!(program.nodes().len(), 4);
        assert_eq!(program.nodes()[0], x);
        print!("{}", program);
    }

    #[test]
    fn unused_inputs_are_kept() {
        let x = placeholder();
        let unused = Tensor::placeholder(LogicalShape::new(DType::Int32, vec![None]), "flag");
        let mut bindings = ShapeBindings::new("unused");
        bindings.bind(&x, &[1, 4]).unwrap();
        bindings.bind(&unused, &[5]).unwrap();
        let program = Program::new("unused", &[x.clone(), unused.clone()], &[x.exp()], &bindings)
            .unwrap();
        assert_eq!(program.shape_of(&unused).unwrap().dims, vec![5]);
        assert_eq!(program.placeholders().count(), 2);
    }
}
