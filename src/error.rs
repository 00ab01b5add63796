use thiserror::Error;

/// Domain failures raised by an operation before any result node is built.
///
/// These cover invalid mathematical input only. IEEE-754 exceptional values
/// (NaN, infinities) produced by otherwise valid operations are not errors;
/// they propagate through the graph like any other `f64` and detecting them
/// is the caller's responsibility.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum DomainError {
  /// `ln` over the non-positive reals.
  #[error("ln is undefined for non-positive input {input}")]
  LnNonPositive { input: f64 },

  /// Zero denominator, rejected before delegating to multiply/power.
  #[error("division by zero")]
  DivisionByZero,

  /// The exponent of `powf` must be a real constant.
  #[error("powf exponent must be a finite real number, got {exponent}")]
  NonFiniteExponent { exponent: f64 },

  /// The derivative factor `base^(exponent - 1)` is not finite, e.g. a
  /// negative base raised to a fractional exponent.
  #[error("powf has no finite derivative at base {base} with exponent {exponent}")]
  PowUndefined { base: f64, exponent: f64 },
}
