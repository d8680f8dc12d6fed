//! Expression type checking and lowering.
//!
//! Each `Expr` is checked against the input structural type once, at
//! generation time, and lowered into a tree of closures whose field lookups
//! are already resolved to slot indices. Evaluation never consults field
//! names or re-checks types.

use super::expr::{BinaryOp, Expr, UnaryOp};
use super::schema::{FieldPath, StructuralType};
use crate::models::{DataType, Result, StagepointError, Value};
use std::cmp::Ordering;

/// Evaluates a lowered expression against the top-level slots of one record.
pub(crate) type EvalFn = Box<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// A type-checked expression ready to evaluate.
pub(crate) struct Lowered {
    pub data_type: DataType,
    pub eval: EvalFn,
    /// Source text of the expression, for the rendered assembler
    pub source: String,
}

fn codegen(message: impl Into<String>) -> StagepointError {
    StagepointError::CodeGeneration(message.into())
}

fn with_nullability(data_type: DataType, nullable: bool) -> DataType {
    if nullable {
        DataType::nullable(data_type)
    } else {
        data_type
    }
}

fn numeric_result(left: &DataType, right: &DataType) -> Option<DataType> {
    if !left.is_numeric() || !right.is_numeric() {
        return None;
    }
    Some(match (left, right) {
        (DataType::Float64, _) | (_, DataType::Float64) => DataType::Float64,
        (DataType::Int64, _) | (_, DataType::Int64) => DataType::Int64,
        _ => DataType::Int32,
    })
}

/// Lower `expr` against the fields of `input`.
pub(crate) fn lower(expr: &Expr, input: &StructuralType) -> Result<Lowered> {
    match expr {
        Expr::Column(name) => lower_column(name, input),
        Expr::Literal(value) => lower_literal(value),
        Expr::Null(data_type) => {
            if let Some(opaque) = data_type.find_opaque() {
                return Err(codegen(format!("null literal of unresolvable type '{opaque}'")));
            }
            Ok(Lowered {
                data_type: DataType::nullable(data_type.clone()),
                eval: Box::new(|_: &[Value]| Ok(Value::Null)),
                source: format!("None::<{data_type}>"),
            })
        }
        Expr::Binary { op, left, right } => {
            let left = lower(left, input)?;
            let right = lower(right, input)?;
            lower_binary(*op, left, right)
        }
        Expr::Unary { op, expr } => lower_unary(*op, lower(expr, input)?),
        Expr::Cast { expr, to } => lower_cast(lower(expr, input)?, to),
        Expr::Concat(args) => {
            let args = args
                .iter()
                .map(|a| lower(a, input))
                .collect::<Result<Vec<_>>>()?;
            lower_concat(args)
        }
        Expr::Coalesce(args) => {
            let args = args
                .iter()
                .map(|a| lower(a, input))
                .collect::<Result<Vec<_>>>()?;
            lower_coalesce(args)
        }
    }
}

fn lower_column(name: &str, input: &StructuralType) -> Result<Lowered> {
    let FieldPath {
        slot,
        nested,
        data_type,
    } = input.resolve_path(name).ok_or_else(|| {
        codegen(format!(
            "unknown field '{name}' in input type {}",
            input.descriptor()
        ))
    })?;

    let field = name.to_string();
    let eval: EvalFn = Box::new(move |row: &[Value]| {
        let mut value = row.get(slot).ok_or_else(|| {
            StagepointError::Execution(format!("input record has no slot {slot} for '{field}'"))
        })?;
        for &index in &nested {
            value = match value {
                Value::Struct(children) => children.get(index).ok_or_else(|| {
                    StagepointError::Execution(format!("missing nested field in '{field}'"))
                })?,
                Value::Null => return Ok(Value::Null),
                other => {
                    return Err(StagepointError::Execution(format!(
                        "expected struct while reading '{field}', found {other}"
                    )));
                }
            };
        }
        Ok(value.clone())
    });

    Ok(Lowered {
        data_type,
        eval,
        source: format!("input.{name}"),
    })
}

fn lower_literal(value: &Value) -> Result<Lowered> {
    let data_type = match value {
        Value::Bool(_) => DataType::Bool,
        Value::Int32(_) => DataType::Int32,
        Value::Int64(_) => DataType::Int64,
        Value::Float64(_) => DataType::Float64,
        Value::Utf8(_) => DataType::Utf8,
        Value::Binary(_) => DataType::Binary,
        Value::Null => return Err(codegen("untyped null literal; use Expr::Null(type)")),
        Value::List(_) | Value::Struct(_) => {
            return Err(codegen(format!("composite literal {value} is not supported")));
        }
    };
    let constant = value.clone();
    Ok(Lowered {
        data_type,
        eval: Box::new(move |_: &[Value]| Ok(constant.clone())),
        source: value.to_string(),
    })
}

fn lower_binary(op: BinaryOp, left: Lowered, right: Lowered) -> Result<Lowered> {
    let nullable = left.data_type.is_nullable() || right.data_type.is_nullable();
    let lt = left.data_type.non_null().clone();
    let rt = right.data_type.non_null().clone();
    let source = format!("({} {} {})", left.source, op.symbol(), right.source);
    let (le, re) = (left.eval, right.eval);

    if op.is_arithmetic() {
        let result = numeric_result(&lt, &rt).ok_or_else(|| {
            codegen(format!("cannot apply '{}' to {lt} and {rt}", op.symbol()))
        })?;
        let text = source.clone();
        let result_type = result.clone();
        let eval: EvalFn = Box::new(move |row: &[Value]| {
            let a = le(row)?;
            let b = re(row)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            arithmetic(op, &result_type, &a, &b)
                .map_err(|msg| StagepointError::Execution(format!("{msg} in {text}")))
        });
        return Ok(Lowered {
            data_type: with_nullability(result, nullable),
            eval,
            source,
        });
    }

    if op.is_comparison() {
        let comparable = (lt.is_numeric() && rt.is_numeric())
            || (lt == rt && matches!(lt, DataType::Utf8 | DataType::Bool | DataType::Binary));
        if !comparable {
            return Err(codegen(format!("cannot compare {lt} with {rt}")));
        }
        let eval: EvalFn = Box::new(move |row: &[Value]| {
            let a = le(row)?;
            let b = re(row)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let outcome = match compare(&a, &b) {
                Some(ordering) => match op {
                    BinaryOp::Eq => ordering == Ordering::Equal,
                    BinaryOp::NotEq => ordering != Ordering::Equal,
                    BinaryOp::Lt => ordering == Ordering::Less,
                    BinaryOp::LtEq => ordering != Ordering::Greater,
                    BinaryOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
                // NaN is unordered
                None => op == BinaryOp::NotEq,
            };
            Ok(Value::Bool(outcome))
        });
        return Ok(Lowered {
            data_type: with_nullability(DataType::Bool, nullable),
            eval,
            source,
        });
    }

    // And / Or
    if lt != DataType::Bool || rt != DataType::Bool {
        return Err(codegen(format!(
            "'{}' needs bool operands, got {lt} and {rt}",
            op.symbol()
        )));
    }
    let is_and = op == BinaryOp::And;
    let eval: EvalFn = Box::new(move |row: &[Value]| {
        let a = le(row)?;
        let b = re(row)?;
        // Three-valued logic: a decisive operand wins over null.
        let decisive = Value::Bool(!is_and);
        if a == decisive || b == decisive {
            return Ok(decisive);
        }
        if a.is_null() || b.is_null() {
            return Ok(Value::Null);
        }
        Ok(Value::Bool(is_and))
    });
    Ok(Lowered {
        data_type: with_nullability(DataType::Bool, nullable),
        eval,
        source,
    })
}

fn checked_i32(op: BinaryOp, x: i32, y: i32) -> std::result::Result<i32, String> {
    if matches!(op, BinaryOp::Div | BinaryOp::Rem) && y == 0 {
        return Err("division by zero".to_string());
    }
    match op {
        BinaryOp::Add => x.checked_add(y),
        BinaryOp::Sub => x.checked_sub(y),
        BinaryOp::Mul => x.checked_mul(y),
        BinaryOp::Div => x.checked_div(y),
        BinaryOp::Rem => x.checked_rem(y),
        other => return Err(format!("'{}' is not arithmetic", other.symbol())),
    }
    .ok_or_else(|| "i32 overflow".to_string())
}

fn checked_i64(op: BinaryOp, x: i64, y: i64) -> std::result::Result<i64, String> {
    if matches!(op, BinaryOp::Div | BinaryOp::Rem) && y == 0 {
        return Err("division by zero".to_string());
    }
    match op {
        BinaryOp::Add => x.checked_add(y),
        BinaryOp::Sub => x.checked_sub(y),
        BinaryOp::Mul => x.checked_mul(y),
        BinaryOp::Div => x.checked_div(y),
        BinaryOp::Rem => x.checked_rem(y),
        other => return Err(format!("'{}' is not arithmetic", other.symbol())),
    }
    .ok_or_else(|| "i64 overflow".to_string())
}

fn arithmetic(
    op: BinaryOp,
    result: &DataType,
    a: &Value,
    b: &Value,
) -> std::result::Result<Value, String> {
    let mismatch = || format!("unexpected operands {a} and {b}");
    match result {
        DataType::Int32 => match (a, b) {
            (Value::Int32(x), Value::Int32(y)) => checked_i32(op, *x, *y).map(Value::Int32),
            _ => Err(mismatch()),
        },
        DataType::Int64 => {
            let (x, y) = a.as_i64().zip(b.as_i64()).ok_or_else(mismatch)?;
            checked_i64(op, x, y).map(Value::Int64)
        }
        _ => {
            let (x, y) = a.as_f64().zip(b.as_f64()).ok_or_else(mismatch)?;
            let v = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                BinaryOp::Rem => x % y,
                other => return Err(format!("'{}' is not arithmetic", other.symbol())),
            };
            Ok(Value::Float64(v))
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Utf8(x), Value::Utf8(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Binary(x), Value::Binary(y)) => Some(x.cmp(y)),
        _ => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
    }
}

fn lower_unary(op: UnaryOp, inner: Lowered) -> Result<Lowered> {
    let nullable = inner.data_type.is_nullable();
    let base = inner.data_type.non_null().clone();
    let ie = inner.eval;
    match op {
        UnaryOp::Neg => {
            if !base.is_numeric() {
                return Err(codegen(format!("cannot negate {base}")));
            }
            let text = inner.source.clone();
            let eval: EvalFn = Box::new(move |row: &[Value]| match ie(row)? {
                Value::Int32(v) => v.checked_neg().map(Value::Int32).ok_or_else(|| {
                    StagepointError::Execution(format!("i32 overflow in -{text}"))
                }),
                Value::Int64(v) => v.checked_neg().map(Value::Int64).ok_or_else(|| {
                    StagepointError::Execution(format!("i64 overflow in -{text}"))
                }),
                Value::Float64(v) => Ok(Value::Float64(-v)),
                other => Ok(other),
            });
            Ok(Lowered {
                data_type: with_nullability(base, nullable),
                eval,
                source: format!("(-{})", inner.source),
            })
        }
        UnaryOp::Not => {
            if base != DataType::Bool {
                return Err(codegen(format!("'!' needs a bool operand, got {base}")));
            }
            let eval: EvalFn = Box::new(move |row: &[Value]| match ie(row)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Ok(other),
            });
            Ok(Lowered {
                data_type: with_nullability(DataType::Bool, nullable),
                eval,
                source: format!("(!{})", inner.source),
            })
        }
        UnaryOp::IsNull => Ok(Lowered {
            data_type: DataType::Bool,
            eval: Box::new(move |row: &[Value]| Ok(Value::Bool(ie(row)?.is_null()))),
            source: format!("{}.is_none()", inner.source),
        }),
    }
}

fn castable(from: &DataType, to: &DataType) -> bool {
    from == to
        || (from.is_numeric() && to.is_numeric())
        || (matches!(to, DataType::Utf8) && (from.is_numeric() || *from == DataType::Bool))
        || (*from == DataType::Utf8 && (to.is_numeric() || *to == DataType::Bool))
        || (*from == DataType::Bool && to.is_integer())
}

fn float_to_int(x: f64, min: f64, max: f64) -> std::result::Result<i64, String> {
    let t = x.trunc();
    if !t.is_finite() || t < min || t > max {
        return Err(format!("{x} is out of range"));
    }
    Ok(t as i64)
}

fn cast_value(value: Value, to: &DataType) -> std::result::Result<Value, String> {
    let parse_err = |s: &str| format!("cannot parse {s:?} as {to}");
    Ok(match (value, to) {
        (Value::Null, _) => Value::Null,
        (Value::Utf8(s), DataType::Utf8) => Value::Utf8(s),
        (Value::Int32(v), DataType::Utf8) => Value::Utf8(v.to_string()),
        (Value::Int64(v), DataType::Utf8) => Value::Utf8(v.to_string()),
        (Value::Float64(v), DataType::Utf8) => Value::Utf8(v.to_string()),
        (Value::Bool(v), DataType::Utf8) => Value::Utf8(v.to_string()),
        (Value::Int32(v), DataType::Int32) => Value::Int32(v),
        (Value::Int32(v), DataType::Int64) => Value::Int64(i64::from(v)),
        (Value::Int32(v), DataType::Float64) => Value::Float64(f64::from(v)),
        (Value::Int64(v), DataType::Int32) => Value::Int32(
            i32::try_from(v).map_err(|_| format!("{v} is out of range for i32"))?,
        ),
        (Value::Int64(v), DataType::Int64) => Value::Int64(v),
        (Value::Int64(v), DataType::Float64) => Value::Float64(v as f64),
        (Value::Float64(v), DataType::Float64) => Value::Float64(v),
        (Value::Float64(v), DataType::Int32) => {
            Value::Int32(float_to_int(v, f64::from(i32::MIN), f64::from(i32::MAX))? as i32)
        }
        (Value::Float64(v), DataType::Int64) => {
            // i64::MAX is not exactly representable; 2^63 is the first value out of range
            let t = float_to_int(v, -9_223_372_036_854_775_808.0, 9_223_372_036_854_774_784.0)?;
            Value::Int64(t)
        }
        (Value::Bool(b), DataType::Int32) => Value::Int32(i32::from(b)),
        (Value::Bool(b), DataType::Int64) => Value::Int64(i64::from(b)),
        (Value::Bool(b), DataType::Bool) => Value::Bool(b),
        (Value::Utf8(s), DataType::Int32) => {
            Value::Int32(s.trim().parse().map_err(|_| parse_err(&s))?)
        }
        (Value::Utf8(s), DataType::Int64) => {
            Value::Int64(s.trim().parse().map_err(|_| parse_err(&s))?)
        }
        (Value::Utf8(s), DataType::Float64) => {
            Value::Float64(s.trim().parse().map_err(|_| parse_err(&s))?)
        }
        (Value::Utf8(s), DataType::Bool) => {
            Value::Bool(s.trim().parse().map_err(|_| parse_err(&s))?)
        }
        (value, to) if value.conforms_to(to) => value,
        (value, to) => return Err(format!("cannot cast {value} to {to}")),
    })
}

fn lower_cast(inner: Lowered, to: &DataType) -> Result<Lowered> {
    let from = inner.data_type.non_null().clone();
    let target = to.non_null().clone();
    if !castable(&from, &target) {
        return Err(codegen(format!("cannot cast {from} to {target}")));
    }
    let nullable = inner.data_type.is_nullable() || to.is_nullable();
    let ie = inner.eval;
    let text = inner.source.clone();
    let cast_to = target.clone();
    let eval: EvalFn = Box::new(move |row: &[Value]| {
        cast_value(ie(row)?, &cast_to)
            .map_err(|msg| StagepointError::Execution(format!("{msg} in {text}")))
    });
    Ok(Lowered {
        source: format!("({} as {target})", inner.source),
        data_type: with_nullability(target, nullable),
        eval,
    })
}

fn render_call(name: &str, args: &[Lowered]) -> String {
    let parts: Vec<&str> = args.iter().map(|a| a.source.as_str()).collect();
    format!("{name}({})", parts.join(", "))
}

fn lower_concat(args: Vec<Lowered>) -> Result<Lowered> {
    if args.is_empty() {
        return Err(codegen("concat needs at least one argument"));
    }
    if let Some(bad) = args.iter().find(|a| *a.data_type.non_null() != DataType::Utf8) {
        return Err(codegen(format!(
            "concat arguments must be strings, got {} for {}",
            bad.data_type, bad.source
        )));
    }
    let nullable = args.iter().any(|a| a.data_type.is_nullable());
    let source = render_call("concat", &args);
    let evals: Vec<EvalFn> = args.into_iter().map(|a| a.eval).collect();
    let eval: EvalFn = Box::new(move |row: &[Value]| {
        let mut out = String::new();
        for eval in &evals {
            match eval(row)? {
                Value::Utf8(s) => out.push_str(&s),
                Value::Null => return Ok(Value::Null),
                other => {
                    return Err(StagepointError::Execution(format!(
                        "concat received non-string {other}"
                    )));
                }
            }
        }
        Ok(Value::Utf8(out))
    });
    Ok(Lowered {
        data_type: with_nullability(DataType::Utf8, nullable),
        eval,
        source,
    })
}

fn lower_coalesce(args: Vec<Lowered>) -> Result<Lowered> {
    let Some(first) = args.first() else {
        return Err(codegen("coalesce needs at least one argument"));
    };
    let base = first.data_type.non_null().clone();
    if let Some(bad) = args.iter().find(|a| *a.data_type.non_null() != base) {
        return Err(codegen(format!(
            "coalesce arguments must share type {base}, got {} for {}",
            bad.data_type, bad.source
        )));
    }
    let nullable = args.iter().all(|a| a.data_type.is_nullable());
    let source = render_call("coalesce", &args);
    let evals: Vec<EvalFn> = args.into_iter().map(|a| a.eval).collect();
    let eval: EvalFn = Box::new(move |row: &[Value]| {
        for eval in &evals {
            let value = eval(row)?;
            if !value.is_null() {
                return Ok(value);
            }
        }
        Ok(Value::Null)
    });
    Ok(Lowered {
        data_type: with_nullability(base, nullable),
        eval,
        source,
    })
}

/// Conversion applied when storing an expression result into an output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Coercion {
    Identity,
    ToInt64,
    ToFloat64,
}

impl Coercion {
    /// Find how a value of type `from` is stored into a field of type `to`.
    pub(crate) fn between(from: &DataType, to: &DataType) -> Option<Coercion> {
        if from.is_nullable() && !to.is_nullable() {
            return None;
        }
        let (from, to) = (from.non_null(), to.non_null());
        match (from, to) {
            _ if from == to => Some(Coercion::Identity),
            (DataType::Int32, DataType::Int64) => Some(Coercion::ToInt64),
            (DataType::Int32 | DataType::Int64, DataType::Float64) => Some(Coercion::ToFloat64),
            _ => None,
        }
    }

    pub(crate) fn apply(self, value: Value) -> Value {
        match (self, value) {
            (Coercion::ToInt64, Value::Int32(v)) => Value::Int64(i64::from(v)),
            (Coercion::ToFloat64, Value::Int32(v)) => Value::Float64(f64::from(v)),
            (Coercion::ToFloat64, Value::Int64(v)) => Value::Float64(v as f64),
            (_, value) => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::expr::{coalesce, col, concat, lit};
    use crate::assembler::schema::TypeContext;
    use crate::models::{Field, TypeDescriptor};
    use std::sync::Arc;

    fn input_type() -> Arc<StructuralType> {
        TypeContext::new()
            .resolve(&TypeDescriptor::record([
                ("x", DataType::Int32),
                ("y", DataType::Int64),
                ("f", DataType::Float64),
                ("name", DataType::Utf8),
                ("nick", DataType::nullable(DataType::Utf8)),
                ("flag", DataType::nullable(DataType::Bool)),
                (
                    "pos",
                    DataType::Struct(vec![Field::new("lat", DataType::Float64)]),
                ),
            ]))
            .unwrap()
    }

    fn row() -> Vec<Value> {
        vec![
            Value::Int32(3),
            Value::Int64(4),
            Value::Float64(1.5),
            Value::Utf8("ada".into()),
            Value::Null,
            Value::Null,
            Value::record([Value::Float64(52.5)]),
        ]
    }

    fn eval(expr: Expr) -> Result<(DataType, Value)> {
        let lowered = lower(&expr, &input_type())?;
        let value = (lowered.eval)(row().as_slice())?;
        Ok((lowered.data_type, value))
    }

    #[test]
    fn test_arithmetic_promotion() {
        assert_eq!(
            eval(col("x") + col("y")).unwrap(),
            (DataType::Int64, Value::Int64(7))
        );
        assert_eq!(
            eval(col("x") * col("f")).unwrap(),
            (DataType::Float64, Value::Float64(4.5))
        );
        assert_eq!(
            eval(col("x") - lit(1i32)).unwrap(),
            (DataType::Int32, Value::Int32(2))
        );
    }

    #[test]
    fn test_runtime_errors_are_execution_failures() {
        let err = eval(col("x") / lit(0i32)).unwrap_err();
        assert!(matches!(err, StagepointError::Execution(_)));
        let err = eval(lit(i64::MAX) + col("y")).unwrap_err();
        assert!(matches!(err, StagepointError::Execution(_)));
    }

    #[test]
    fn test_unknown_field_is_codegen_failure() {
        let err = eval(col("x") + col("missing")).unwrap_err();
        assert!(matches!(err, StagepointError::CodeGeneration(_)));
        let err = eval(col("pos.lon")).unwrap_err();
        assert!(matches!(err, StagepointError::CodeGeneration(_)));
    }

    #[test]
    fn test_type_errors_are_codegen_failures() {
        for expr in [
            col("name") + col("x"),
            col("name").lt(col("x")),
            col("x").and(col("flag")),
            -col("name"),
            concat([col("name"), col("x")]),
            coalesce([col("nick"), col("x")]),
            lit(Value::Null),
        ] {
            let err = eval(expr).unwrap_err();
            assert!(matches!(err, StagepointError::CodeGeneration(_)), "{err}");
        }
    }

    #[test]
    fn test_nulls_propagate_and_coalesce() {
        assert_eq!(
            eval(concat([col("nick"), lit("!")])).unwrap(),
            (DataType::nullable(DataType::Utf8), Value::Null)
        );
        assert_eq!(
            eval(coalesce([col("nick"), col("name")])).unwrap(),
            (DataType::Utf8, Value::Utf8("ada".into()))
        );
        assert_eq!(
            eval(col("nick").is_null()).unwrap(),
            (DataType::Bool, Value::Bool(true))
        );
    }

    #[test]
    fn test_three_valued_logic() {
        let (_, v) = eval(col("flag").and(lit(false))).unwrap();
        assert_eq!(v, Value::Bool(false));
        let (_, v) = eval(col("flag").or(lit(true))).unwrap();
        assert_eq!(v, Value::Bool(true));
        let (ty, v) = eval(col("flag").and(lit(true))).unwrap();
        assert_eq!((ty, v), (DataType::nullable(DataType::Bool), Value::Null));
    }

    #[test]
    fn test_comparisons_and_casts() {
        assert_eq!(eval(col("x").lt(col("y"))).unwrap().1, Value::Bool(true));
        assert_eq!(eval(col("f").ge(lit(1.5))).unwrap().1, Value::Bool(true));
        assert_eq!(
            eval(col("name").equals(lit("ada"))).unwrap().1,
            Value::Bool(true)
        );
        assert_eq!(
            eval(col("x").cast(DataType::Utf8)).unwrap(),
            (DataType::Utf8, Value::Utf8("3".into()))
        );
        assert_eq!(
            eval(col("f").cast(DataType::Int32)).unwrap().1,
            Value::Int32(1)
        );
        assert!(matches!(
            eval(col("name").cast(DataType::Int64)).unwrap_err(),
            StagepointError::Execution(_)
        ));
    }

    #[test]
    fn test_nested_column_source() {
        let lowered = lower(&col("pos.lat"), &input_type()).unwrap();
        assert_eq!(lowered.source, "input.pos.lat");
        assert_eq!((lowered.eval)(row().as_slice()).unwrap(), Value::Float64(52.5));
    }

    #[test]
    fn test_coercion_rules() {
        use DataType::*;
        assert_eq!(Coercion::between(&Int32, &Int64), Some(Coercion::ToInt64));
        assert_eq!(Coercion::between(&Int64, &Float64), Some(Coercion::ToFloat64));
        assert_eq!(
            Coercion::between(&Utf8, &DataType::nullable(Utf8)),
            Some(Coercion::Identity)
        );
        assert_eq!(Coercion::between(&DataType::nullable(Utf8), &Utf8), None);
        assert_eq!(Coercion::between(&Int64, &Int32), None);
        assert_eq!(Coercion::ToInt64.apply(Value::Int32(5)), Value::Int64(5));
        assert_eq!(Coercion::ToInt64.apply(Value::Null), Value::Null);
    }
}
