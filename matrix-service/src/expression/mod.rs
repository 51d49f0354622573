// Expression Module
// `${{ }}` interpolation and `if:` conditions for workflow steps

pub mod evaluator;
pub mod lexer;
pub mod parser;

pub use evaluator::{to_display, truthy, ExpressionContext, ExpressionEngine};
pub use lexer::{has_expressions, segments, Segment};
pub use parser::{parse, BinaryOp, Expr};
