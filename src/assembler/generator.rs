//! Assembler generation.
//!
//! Epistemic foundation:
//! - K_i: Generation type-checks every field expression before any record flows
//! - K_i: Identical (input, output, expressions) keys yield identical behaviour;
//!   the cache returns the same assembler for a repeated key
//! - B_i: Expressions may reference missing fields or produce incompatible
//!   types → CodeGeneration error at build time

use super::builder::RecordBuilder;
use super::compile::{lower, Coercion, EvalFn};
use super::expr::FieldExpr;
use super::schema::{StructuralType, TypeContext};
use crate::models::{
    AssemblerConfig, Result, SourceLogLevel, StagepointError, TypeDescriptor, Value,
};
use dashmap::DashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, trace};

struct CompiledField {
    eval: EvalFn,
    coercion: Coercion,
}

/// Populates output builders from input records.
///
/// Holds no mutable state; one assembler can be invoked concurrently as long
/// as each call gets its own builder.
pub struct Assembler {
    input: Arc<StructuralType>,
    output: Arc<StructuralType>,
    fields: Vec<CompiledField>,
    source: String,
}

impl fmt::Debug for Assembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assembler")
            .field("input", &self.input.name())
            .field("output", &self.output.name())
            .field("fields", &self.fields.len())
            .finish()
    }
}

impl Assembler {
    pub fn input_type(&self) -> &Arc<StructuralType> {
        &self.input
    }

    pub fn output_type(&self) -> &Arc<StructuralType> {
        &self.output
    }

    /// Rendered source text of this assembler.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// A fresh builder for this assembler's output type.
    pub fn new_builder(&self) -> RecordBuilder {
        RecordBuilder::new(Arc::clone(&self.output))
    }

    /// Populate `out` from `input`.
    ///
    /// All fields are evaluated before any is written, so a failing record
    /// leaves `out` unchanged.
    pub fn assemble(&self, input: &Value, out: &mut RecordBuilder) -> Result<()> {
        if out.structural_type().name() != self.output.name() {
            return Err(StagepointError::TypeMismatch(format!(
                "builder is for {}, assembler produces {}",
                out.structural_type().name(),
                self.output.name()
            )));
        }
        if !input.conforms_to(self.input.descriptor().root()) {
            return Err(StagepointError::TypeMismatch(format!(
                "input {input} does not conform to {}",
                self.input.descriptor()
            )));
        }

        let row: &[Value] = match input {
            Value::Struct(values) if self.input.descriptor().is_record() => values,
            scalar => std::slice::from_ref(scalar),
        };

        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            values.push(field.coercion.apply((field.eval)(row)?));
        }
        for (index, value) in values.into_iter().enumerate() {
            out.set(index, value)?;
        }
        Ok(())
    }

    /// Assemble into a fresh builder and build the output record.
    pub fn apply(&self, input: &Value) -> Result<Value> {
        let mut builder = self.new_builder();
        self.assemble(input, &mut builder)?;
        builder.build()
    }
}

/// Produces assemblers from declarative field expressions.
#[derive(Debug)]
pub struct AssemblerGenerator {
    context: Arc<TypeContext>,
    config: AssemblerConfig,
    cache: DashMap<String, Arc<Assembler>>,
}

impl AssemblerGenerator {
    pub fn new(context: Arc<TypeContext>, config: AssemblerConfig) -> Self {
        Self {
            context,
            config,
            cache: DashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<TypeContext> {
        &self.context
    }

    /// Number of cached assemblers.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn cache_key(input: &TypeDescriptor, output: &TypeDescriptor, exprs: &[FieldExpr]) -> String {
        let mut key = format!("{:016x}>{:016x}", input.fingerprint(), output.fingerprint());
        for field in exprs {
            let _ = write!(key, "|{field:?}");
        }
        key
    }

    /// Generate (or fetch from cache) the assembler for this operator shape.
    pub fn generate(
        &self,
        input: &TypeDescriptor,
        output: &TypeDescriptor,
        exprs: &[FieldExpr],
    ) -> Result<Arc<Assembler>> {
        let key = Self::cache_key(input, output, exprs);
        if let Some(hit) = self.cache.get(&key) {
            trace!(assembler = %hit.output.name(), "Assembler cache hit");
            return Ok(Arc::clone(&hit));
        }

        let assembler = Arc::new(self.build(input, output, exprs)?);

        if self.cache.len() < self.config.cache_capacity {
            self.cache.insert(key, Arc::clone(&assembler));
        } else {
            debug!(
                capacity = self.config.cache_capacity,
                "Assembler cache full, not caching"
            );
        }
        Ok(assembler)
    }

    fn build(
        &self,
        input: &TypeDescriptor,
        output: &TypeDescriptor,
        exprs: &[FieldExpr],
    ) -> Result<Assembler> {
        let input_ty = self.context.resolve(input)?;
        let output_ty = self.context.resolve(output)?;

        if exprs.len() != output_ty.len() {
            return Err(StagepointError::CodeGeneration(format!(
                "{} field expressions for {} output fields of {output}",
                exprs.len(),
                output_ty.len()
            )));
        }

        let mut fields = Vec::with_capacity(exprs.len());
        let mut statements = Vec::with_capacity(exprs.len());
        for (index, (field_expr, target)) in exprs.iter().zip(output_ty.fields()).enumerate() {
            if field_expr.name != target.name {
                return Err(StagepointError::CodeGeneration(format!(
                    "expression {index} assigns '{}' but output field {index} is '{}'",
                    field_expr.name, target.name
                )));
            }
            let lowered = lower(&field_expr.expr, &input_ty)?;
            let coercion =
                Coercion::between(&lowered.data_type, &target.data_type).ok_or_else(|| {
                    StagepointError::CodeGeneration(format!(
                        "'{field_expr}' produces {} but field '{}' is {}",
                        lowered.data_type, target.name, target.data_type
                    ))
                })?;
            let value_source = match coercion {
                Coercion::Identity => lowered.source,
                _ => format!("({} as {})", lowered.source, target.data_type.non_null()),
            };
            statements.push(format!(
                "    out.set({index} /* {} */, {value_source});",
                target.name
            ));
            fields.push(CompiledField {
                eval: lowered.eval,
                coercion,
            });
        }

        let source = render_source(&input_ty, &output_ty, &statements);
        match self.config.source_log {
            SourceLogLevel::Off => {}
            SourceLogLevel::Debug => debug!(output = %output_ty.name(), "Generated assembler:\n{source}"),
            SourceLogLevel::Trace => trace!(output = %output_ty.name(), "Generated assembler:\n{source}"),
        }
        info!(
            input = %input_ty.name(),
            output = %output_ty.name(),
            fields = fields.len(),
            "Assembler generated"
        );

        Ok(Assembler {
            input: input_ty,
            output: output_ty,
            fields,
            source,
        })
    }
}

fn render_source(input: &StructuralType, output: &StructuralType, statements: &[String]) -> String {
    let mut src = String::new();
    src.push_str(&input.definition());
    src.push('\n');
    if output.name() != input.name() {
        src.push_str(&output.definition());
        src.push('\n');
    }
    let _ = writeln!(
        src,
        "fn assemble(input: &{}, out: &mut RecordBuilder<{}>) {{",
        input.name(),
        output.name()
    );
    for statement in statements {
        src.push_str(statement);
        src.push('\n');
    }
    src.push('}');
    src
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::expr::{col, concat, lit};
    use crate::models::DataType;

    fn generator() -> AssemblerGenerator {
        AssemblerGenerator::new(Arc::new(TypeContext::new()), AssemblerConfig::default())
    }

    fn xy() -> TypeDescriptor {
        TypeDescriptor::record([("x", DataType::Int64), ("y", DataType::Int64)])
    }

    fn sum() -> TypeDescriptor {
        TypeDescriptor::record([("sum", DataType::Int64)])
    }

    #[test]
    fn test_sum_of_fields() {
        let gen = generator();
        let asm = gen
            .generate(&xy(), &sum(), &[FieldExpr::new("sum", col("x") + col("y"))])
            .unwrap();

        let mut out = asm.new_builder();
        asm.assemble(&Value::record([Value::Int64(3), Value::Int64(4)]), &mut out)
            .unwrap();
        assert_eq!(out.get_named("sum"), Some(&Value::Int64(7)));
        assert_eq!(out.build().unwrap(), Value::record([Value::Int64(7)]));
    }

    #[test]
    fn test_repeated_generation_is_deterministic() {
        let exprs = [FieldExpr::new("sum", col("x") * lit(2i64) + col("y"))];
        let input = Value::record([Value::Int64(5), Value::Int64(-1)]);

        let first = generator().generate(&xy(), &sum(), &exprs).unwrap();
        let second = generator().generate(&xy(), &sum(), &exprs).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.apply(&input).unwrap(), second.apply(&input).unwrap());
        assert_eq!(first.source(), second.source());

        let gen = generator();
        let a = gen.generate(&xy(), &sum(), &exprs).unwrap();
        let b = gen.generate(&xy(), &sum(), &exprs).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(gen.cached(), 1);
    }

    #[test]
    fn test_missing_field_fails_at_generation() {
        let gen = generator();
        let err = gen
            .generate(&xy(), &sum(), &[FieldExpr::new("sum", col("x") + col("z"))])
            .unwrap_err();
        assert!(matches!(err, StagepointError::CodeGeneration(_)));
        assert_eq!(gen.cached(), 0);
    }

    #[test]
    fn test_incompatible_output_type_fails() {
        let out = TypeDescriptor::record([("sum", DataType::Int32)]);
        let err = generator()
            .generate(&xy(), &out, &[FieldExpr::new("sum", col("x") + col("y"))])
            .unwrap_err();
        assert!(matches!(err, StagepointError::CodeGeneration(_)));
    }

    #[test]
    fn test_arity_and_name_mismatch_fail() {
        let gen = generator();
        let err = gen.generate(&xy(), &sum(), &[]).unwrap_err();
        assert!(matches!(err, StagepointError::CodeGeneration(_)));

        let err = gen
            .generate(&xy(), &sum(), &[FieldExpr::new("total", col("x"))])
            .unwrap_err();
        assert!(matches!(err, StagepointError::CodeGeneration(_)));
    }

    #[test]
    fn test_runtime_failure_leaves_builder_untouched() {
        let input = TypeDescriptor::record([("a", DataType::Int64), ("b", DataType::Int64)]);
        let output = TypeDescriptor::record([("a", DataType::Int64), ("q", DataType::Int64)]);
        let asm = generator()
            .generate(
                &input,
                &output,
                &[
                    FieldExpr::new("a", col("a")),
                    FieldExpr::new("q", col("a") / col("b")),
                ],
            )
            .unwrap();

        let mut out = asm.new_builder();
        let err = asm
            .assemble(&Value::record([Value::Int64(1), Value::Int64(0)]), &mut out)
            .unwrap_err();
        assert!(matches!(err, StagepointError::Execution(_)));
        assert!(out.is_untouched());
    }

    #[test]
    fn test_widening_and_scalar_shapes() {
        let input = TypeDescriptor::scalar(DataType::Int32);
        let output = TypeDescriptor::record([
            ("wide", DataType::Int64),
            ("ratio", DataType::Float64),
            ("label", DataType::nullable(DataType::Utf8)),
        ]);
        let asm = generator()
            .generate(
                &input,
                &output,
                &[
                    FieldExpr::new("wide", col("value")),
                    FieldExpr::new("ratio", col("value")),
                    FieldExpr::new("label", concat([lit("n="), col("value").cast(DataType::Utf8)])),
                ],
            )
            .unwrap();

        assert_eq!(
            asm.apply(&Value::Int32(4)).unwrap(),
            Value::record([
                Value::Int64(4),
                Value::Float64(4.0),
                Value::Utf8("n=4".into())
            ])
        );
        assert!(asm.source().contains("out.set(0 /* wide */, (input.value as i64));"));
    }

    #[test]
    fn test_wrong_builder_rejected() {
        let gen = generator();
        let asm = gen
            .generate(&xy(), &sum(), &[FieldExpr::new("sum", col("x") + col("y"))])
            .unwrap();
        let other = gen
            .generate(&sum(), &xy(), &[FieldExpr::new("x", col("sum")), FieldExpr::new("y", col("sum"))])
            .unwrap();
        let mut wrong = other.new_builder();
        let err = asm
            .assemble(&Value::record([Value::Int64(1), Value::Int64(2)]), &mut wrong)
            .unwrap_err();
        assert!(matches!(err, StagepointError::TypeMismatch(_)));
    }

    #[test]
    fn test_opaque_descriptor_is_type_mismatch() {
        let input = TypeDescriptor::record([("g", DataType::Opaque("Geometry".into()))]);
        let err = generator()
            .generate(&input, &sum(), &[FieldExpr::new("sum", lit(1i64))])
            .unwrap_err();
        assert!(matches!(err, StagepointError::TypeMismatch(_)));
    }

    #[test]
    fn test_assembler_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Assembler>();

        let asm = generator()
            .generate(&xy(), &sum(), &[FieldExpr::new("sum", col("x") + col("y"))])
            .unwrap();
        let handles: Vec<_> = (0..4i64)
            .map(|i| {
                let asm = Arc::clone(&asm);
                std::thread::spawn(move || asm.apply(&Value::record([Value::Int64(i), Value::Int64(i)])))
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            let out = handle.join().unwrap().unwrap();
            assert_eq!(out, Value::record([Value::Int64(2 * i as i64)]));
        }
    }
}
