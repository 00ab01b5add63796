//!
//! # scalargrad
//!
//! Scalar reverse-mode automatic differentiation over an arena-backed
//! computation graph.
//!
//! Every operation on a [`Var`] appends a node to the owning [`Tape`] and
//! returns a handle to it; [`Var::backward`] then walks the recorded
//! subgraph once, in reverse topological order, accumulating the exact
//! gradient of the root with respect to every reachable node into that
//! node's `grad` slot.
//!
//! Gradients always accumulate (`+=`), never overwrite; a value feeding
//! several consumers receives the sum of the gradients along every path to
//! the output. Nothing resets them automatically: call [`Var::zero_grad`]
//! between passes, or lean on the accumulation across repeated backward
//! calls on purpose.
//!

use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use bit_set::BitSet;

use log::trace;

use smallvec::SmallVec;

mod error;

pub use error::DomainError;

type NodeIndex = usize;

/// Backward rule recorded on a node at construction time.
///
/// Each variant carries the operand indices and any constant parameter the
/// local derivative needs (the exponent, elu's alpha); everything else is
/// read back out of the arena during dispatch. Leaves carry no rule at all.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
  Leaf,
  Add(NodeIndex, NodeIndex),
  Mul(NodeIndex, NodeIndex),
  Powf { base: NodeIndex, exponent: f64 },
  Tanh(NodeIndex),
  Sigmoid(NodeIndex),
  Relu(NodeIndex),
  Exp(NodeIndex),
  Ln(NodeIndex),
  Sin(NodeIndex),
  Cos(NodeIndex),
  Step(NodeIndex),
  Elu { input: NodeIndex, alpha: f64 },
}

impl Op {
  /// Operand indices, in rule order. A value used twice in one expression
  /// occupies both slots with the same index; the visited set of the
  /// traversal deduplicates the node while both slots still push their own
  /// gradient contribution.
  fn operands(&self) -> SmallVec<[NodeIndex; 2]> {
    match *self {
      Op::Leaf => SmallVec::new(),
      Op::Add(a, b) | Op::Mul(a, b) => SmallVec::from_slice(&[a, b]),
      Op::Powf { base: a, .. }
      | Op::Tanh(a)
      | Op::Sigmoid(a)
      | Op::Relu(a)
      | Op::Exp(a)
      | Op::Ln(a)
      | Op::Sin(a)
      | Op::Cos(a)
      | Op::Step(a)
      | Op::Elu { input: a, .. } => SmallVec::from_slice(&[a]),
    }
  }

  /// Diagnostic operator label; no semantic role.
  fn tag(&self) -> &'static str {
    match self {
      Op::Leaf => "leaf",
      Op::Add(..) => "+",
      Op::Mul(..) => "*",
      Op::Powf { .. } => "powf",
      Op::Tanh(..) => "tanh",
      Op::Sigmoid(..) => "sigmoid",
      Op::Relu(..) => "relu",
      Op::Exp(..) => "exp",
      Op::Ln(..) => "ln",
      Op::Sin(..) => "sin",
      Op::Cos(..) => "cos",
      Op::Step(..) => "step",
      Op::Elu { .. } => "elu",
    }
  }
}

/// One vertex of the graph: forward value, accumulated gradient, rule.
///
/// `data` and `op` are frozen at construction; `grad` is the only mutable
/// field, touched by the backward pass and by callers zeroing it.
#[derive(Debug)]
struct Node {
  data: f64,
  grad: f64,
  op: Op,
}

/// Arena owning every node of one computation graph.
///
/// Nodes are addressed by stable index and freed together when the tape
/// drops; handles borrow the tape, so no handle outlives its graph. A tape
/// is single-threaded by construction (interior `RefCell`).
#[derive(Debug, Default)]
pub struct Tape {
  nodes: RefCell<Vec<Node>>,
}

impl Tape {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a leaf: a directly supplied constant or trainable parameter.
  /// Its gradient starts at zero and it carries no backward rule.
  #[inline]
  pub fn var(&self, value: f64) -> Var<'_> {
    Var {
      node: self.push(value, Op::Leaf),
      tape: self,
    }
  }

  /// Number of nodes recorded so far.
  pub fn len(&self) -> usize {
    self.nodes.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.borrow().is_empty()
  }

  #[inline]
  fn push(&self, data: f64, op: Op) -> NodeIndex {
    let mut nodes = self.nodes.borrow_mut();
    let node = nodes.len();
    nodes.push(Node {
      data,
      grad: 0.0,
      op,
    });
    node
  }

  /// Post-order of the subgraph reachable from `root` along operand edges:
  /// every node appears after all of its operands.
  ///
  /// Iterative with an explicit work stack, so graph depth is bounded by the
  /// heap rather than the call stack; long chained expressions stay safe.
  fn topological_subgraph_of(&self, root: NodeIndex) -> Vec<NodeIndex> {
    let nodes = self.nodes.borrow();

    let mut order = Vec::new();
    let mut visited = BitSet::with_capacity(nodes.len());
    let mut stack = vec![(root, false)];

    while let Some((index, expanded)) = stack.pop() {
      if expanded {
        order.push(index);
      } else if visited.insert(index) {
        // marker below the operands, so the operands finish first
        stack.push((index, true));
        for pred in nodes[index].op.operands() {
          if !visited.contains(pred) {
            stack.push((pred, false));
          }
        }
      }
    }

    order
  }
}

/// A handle to one scalar in the graph: the forward value fixed at
/// construction plus the gradient accumulated by backward passes.
///
/// Handles are `Copy` (an index into the owning [`Tape`]), so expressions
/// can reuse a variable freely; every use is another path the backward pass
/// sums over.
#[derive(Clone, Copy)]
pub struct Var<'t> {
  node: NodeIndex,
  tape: &'t Tape,
}

impl<'t> Var<'t> {
  /// Forward value; untouched by any number of backward passes.
  #[inline]
  pub fn value(&self) -> f64 {
    self.tape.nodes.borrow()[self.node].data
  }

  /// Gradient accumulated so far. Zero until a backward pass reaches this
  /// node.
  #[inline]
  pub fn grad(&self) -> f64 {
    self.tape.nodes.borrow()[self.node].grad
  }

  /// Overwrite the accumulated gradient.
  #[inline]
  pub fn set_grad(&self, grad: f64) {
    self.tape.nodes.borrow_mut()[self.node].grad = grad;
  }

  /// Reset the accumulated gradient, typically between optimization steps.
  #[inline]
  pub fn zero_grad(&self) {
    self.set_grad(0.0);
  }

  /// Diagnostic label of the operation that produced this value.
  pub fn op(&self) -> &'static str {
    self.tape.nodes.borrow()[self.node].op.tag()
  }

  #[inline]
  fn emit(&self, data: f64, op: Op) -> Self {
    Var {
      node: self.tape.push(data, op),
      tape: self.tape,
    }
  }

  #[inline]
  fn emit_binary(&self, other: &Var<'t>, data: f64, op: Op) -> Self {
    // handles from two different tapes would cross-wire indices
    debug_assert!(std::ptr::eq(self.tape, other.tape));
    self.emit(data, op)
  }

  /// Raise to a constant real exponent.
  ///
  /// Fails if the exponent is not a finite real, or if the derivative
  /// factor `value^(exponent - 1)` is not finite for a finite base (e.g. a
  /// negative base with a fractional exponent). A NaN or infinite base is
  /// not an error; it propagates per IEEE-754.
  pub fn powf(&self, exponent: f64) -> Result<Self, DomainError> {
    if !exponent.is_finite() {
      return Err(DomainError::NonFiniteExponent { exponent });
    }
    let base = self.value();
    if base.is_finite() && !base.powf(exponent - 1.0).is_finite() {
      return Err(DomainError::PowUndefined { base, exponent });
    }
    Ok(self.emit(
      base.powf(exponent),
      Op::Powf {
        base: self.node,
        exponent,
      },
    ))
  }

  /// Divide, derived as `self * other^(-1)`.
  ///
  /// Fails on a zero denominator before delegating to multiply/power.
  pub fn div(&self, other: Var<'t>) -> Result<Self, DomainError> {
    if other.value() == 0.0 {
      return Err(DomainError::DivisionByZero);
    }
    Ok(*self * other.powf(-1.0)?)
  }

  /// Divide by a raw number, wrapped as a fresh leaf first.
  pub fn div_f64(&self, other: f64) -> Result<Self, DomainError> {
    self.div(self.tape.var(other))
  }

  pub fn tanh(&self) -> Self {
    let t = self.value().tanh();
    self.emit(t, Op::Tanh(self.node))
  }

  pub fn sigmoid(&self) -> Self {
    let s = 1.0 / (1.0 + (-self.value()).exp());
    self.emit(s, Op::Sigmoid(self.node))
  }

  pub fn relu(&self) -> Self {
    let v = self.value();
    let out = if v < 0.0 { 0.0 } else { v };
    self.emit(out, Op::Relu(self.node))
  }

  pub fn exp(&self) -> Self {
    self.emit(self.value().exp(), Op::Exp(self.node))
  }

  /// Natural logarithm. Fails for non-positive input; a NaN input is not an
  /// error and propagates.
  pub fn ln(&self) -> Result<Self, DomainError> {
    let v = self.value();
    if v <= 0.0 {
      return Err(DomainError::LnNonPositive { input: v });
    }
    Ok(self.emit(v.ln(), Op::Ln(self.node)))
  }

  pub fn sin(&self) -> Self {
    self.emit(self.value().sin(), Op::Sin(self.node))
  }

  pub fn cos(&self) -> Self {
    self.emit(self.value().cos(), Op::Cos(self.node))
  }

  /// Hard threshold at zero: 1 for positive input, 0 otherwise. Its
  /// derivative is zero almost everywhere, so the backward rule contributes
  /// an explicit zero.
  pub fn step(&self) -> Self {
    let out = if self.value() > 0.0 { 1.0 } else { 0.0 };
    self.emit(out, Op::Step(self.node))
  }

  /// Exponential linear unit with slope parameter `alpha` on the negative
  /// side.
  pub fn elu(&self, alpha: f64) -> Self {
    let v = self.value();
    let out = if v >= 0.0 { v } else { alpha * (v.exp() - 1.0) };
    self.emit(
      out,
      Op::Elu {
        input: self.node,
        alpha,
      },
    )
  }

  /// Accumulate d(self)/d(node) into the `grad` of every node reachable
  /// from `self`.
  ///
  /// Seeds `self.grad = 1.0`, then dispatches each node's rule in reverse
  /// topological order; by the time a node's rule runs, every consumer has
  /// already pushed its contribution, so the node's gradient is final.
  ///
  /// Gradients are never reset here. Repeated calls accumulate onto
  /// whatever each node's `grad` already holds; zero the relevant leaves
  /// between passes unless that is what you want.
  pub fn backward(&self) {
    let order = self.tape.topological_subgraph_of(self.node);
    trace!("backward over {} nodes rooted at {}", order.len(), self.node);

    let mut nodes = self.tape.nodes.borrow_mut();
    // d(self)/d(self)
    nodes[self.node].grad = 1.0;

    for &index in order.iter().rev() {
      let upstream = nodes[index].grad;
      let out = nodes[index].data;
      let op = nodes[index].op;
      match op {
        Op::Leaf => {}
        Op::Add(a, b) => {
          nodes[a].grad += upstream;
          nodes[b].grad += upstream;
        }
        Op::Mul(a, b) => {
          let (da, db) = (nodes[b].data, nodes[a].data);
          nodes[a].grad += da * upstream;
          nodes[b].grad += db * upstream;
        }
        Op::Powf { base, exponent } => {
          let x = nodes[base].data;
          nodes[base].grad += exponent * x.powf(exponent - 1.0) * upstream;
        }
        Op::Tanh(a) => {
          nodes[a].grad += (1.0 - out * out) * upstream;
        }
        Op::Sigmoid(a) => {
          nodes[a].grad += out * (1.0 - out) * upstream;
        }
        Op::Relu(a) => {
          nodes[a].grad += if out > 0.0 { upstream } else { 0.0 };
        }
        Op::Exp(a) => {
          nodes[a].grad += out * upstream;
        }
        Op::Ln(a) => {
          nodes[a].grad += upstream / nodes[a].data;
        }
        Op::Sin(a) => {
          nodes[a].grad += nodes[a].data.cos() * upstream;
        }
        Op::Cos(a) => {
          nodes[a].grad += -nodes[a].data.sin() * upstream;
        }
        Op::Step(a) => {
          // zero almost everywhere; contributed explicitly, not skipped
          nodes[a].grad += 0.0;
        }
        Op::Elu { input, alpha } => {
          let x = nodes[input].data;
          nodes[input].grad += if x >= 0.0 {
            upstream
          } else {
            alpha * x.exp() * upstream
          };
        }
      }
    }
  }
}

impl fmt::Debug for Var<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Var")
      .field("value", &self.value())
      .field("grad", &self.grad())
      .field("op", &self.op())
      .finish()
  }
}

impl<'t> Add for Var<'t> {
  type Output = Var<'t>;

  #[inline]
  fn add(self, other: Self) -> Self::Output {
    self.emit_binary(
      &other,
      self.value() + other.value(),
      Op::Add(self.node, other.node),
    )
  }
}

impl<'t> Add<f64> for Var<'t> {
  type Output = Var<'t>;

  #[inline]
  fn add(self, other: f64) -> Self::Output {
    // a raw number becomes a fresh leaf before the operation proceeds
    self + self.tape.var(other)
  }
}

impl<'t> Add<Var<'t>> for f64 {
  type Output = Var<'t>;

  #[inline]
  fn add(self, other: Var<'t>) -> Self::Output {
    other.tape.var(self) + other
  }
}

impl<'t> Mul for Var<'t> {
  type Output = Var<'t>;

  #[inline]
  fn mul(self, other: Self) -> Self::Output {
    self.emit_binary(
      &other,
      self.value() * other.value(),
      Op::Mul(self.node, other.node),
    )
  }
}

impl<'t> Mul<f64> for Var<'t> {
  type Output = Var<'t>;

  #[inline]
  fn mul(self, other: f64) -> Self::Output {
    self * self.tape.var(other)
  }
}

impl<'t> Mul<Var<'t>> for f64 {
  type Output = Var<'t>;

  #[inline]
  fn mul(self, other: Var<'t>) -> Self::Output {
    other.tape.var(self) * other
  }
}

impl<'t> Neg for Var<'t> {
  type Output = Var<'t>;

  /// Derived as `self * -1`.
  #[inline]
  fn neg(self) -> Self::Output {
    self * -1.0
  }
}

impl<'t> Sub for Var<'t> {
  type Output = Var<'t>;

  /// Derived as `self + (-other)`.
  #[inline]
  fn sub(self, other: Self) -> Self::Output {
    self + (-other)
  }
}

impl<'t> Sub<f64> for Var<'t> {
  type Output = Var<'t>;

  #[inline]
  fn sub(self, other: f64) -> Self::Output {
    self - self.tape.var(other)
  }
}

impl<'t> Sub<Var<'t>> for f64 {
  type Output = Var<'t>;

  #[inline]
  fn sub(self, other: Var<'t>) -> Self::Output {
    other.tape.var(self) - other
  }
}
