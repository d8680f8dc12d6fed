//! Record assembler generation.
//!
//! Provides:
//! - `Expr` / `FieldExpr`: Declarative output field expressions
//! - `TypeContext`: Descriptor to structural type resolution
//! - `RecordBuilder`: Output record under construction
//! - `AssemblerGenerator`: Type-checks expressions once and produces `Assembler`s

mod builder;
mod compile;
mod expr;
mod generator;
mod schema;

pub use builder::*;
pub use expr::*;
pub use generator::*;
pub use schema::*;
