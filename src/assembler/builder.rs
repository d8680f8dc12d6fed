//! Output record builder.

use super::schema::StructuralType;
use crate::models::{Result, StagepointError, Value};
use std::sync::Arc;

/// Mutable slots for one output record of a fixed structural type.
///
/// Each assembler invocation should get its own builder; builders are not
/// shared between threads.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    ty: Arc<StructuralType>,
    slots: Vec<Option<Value>>,
}

impl RecordBuilder {
    pub fn new(ty: Arc<StructuralType>) -> Self {
        let slots = vec![None; ty.len()];
        Self { ty, slots }
    }

    pub fn structural_type(&self) -> &Arc<StructuralType> {
        &self.ty
    }

    /// Set the field at `index`, checking it against the declared field type.
    pub fn set(&mut self, index: usize, value: Value) -> Result<()> {
        let field = self.ty.fields().get(index).ok_or_else(|| {
            StagepointError::InvalidInput(format!(
                "{} has no field at index {index}",
                self.ty.name()
            ))
        })?;
        if !value.conforms_to(&field.data_type) {
            return Err(StagepointError::TypeMismatch(format!(
                "value {value} does not fit field '{}' of type {}",
                field.name, field.data_type
            )));
        }
        self.slots[index] = Some(value);
        Ok(())
    }

    /// Set a field by name.
    pub fn set_named(&mut self, name: &str, value: Value) -> Result<()> {
        let index = self.ty.slot(name).ok_or_else(|| {
            StagepointError::InvalidInput(format!("{} has no field '{name}'", self.ty.name()))
        })?;
        self.set(index, value)
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.ty.slot(name).and_then(|i| self.get(i))
    }

    /// Whether no field has been set.
    pub fn is_untouched(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Clear all fields so the builder can be reused.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    /// Produce the record. A non-struct output type yields the bare value.
    pub fn build(self) -> Result<Value> {
        let mut values = Vec::with_capacity(self.slots.len());
        for (slot, field) in self.slots.into_iter().zip(self.ty.fields()) {
            let value = slot.ok_or_else(|| {
                StagepointError::InvalidInput(format!("output field '{}' was not set", field.name))
            })?;
            values.push(value);
        }

        if self.ty.descriptor().is_record() {
            Ok(Value::Struct(values))
        } else {
            values
                .pop()
                .ok_or_else(|| StagepointError::Internal("scalar type without a slot".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::schema::TypeContext;
    use crate::models::{DataType, TypeDescriptor};

    fn builder() -> RecordBuilder {
        let ty = TypeContext::new()
            .resolve(&TypeDescriptor::record([
                ("id", DataType::Int64),
                ("label", DataType::nullable(DataType::Utf8)),
            ]))
            .unwrap();
        RecordBuilder::new(ty)
    }

    #[test]
    fn test_build_complete_record() {
        let mut b = builder();
        assert!(b.is_untouched());
        b.set(0, Value::Int64(1)).unwrap();
        b.set_named("label", Value::Null).unwrap();
        assert!(b.is_complete());
        assert_eq!(
            b.build().unwrap(),
            Value::record([Value::Int64(1), Value::Null])
        );
    }

    #[test]
    fn test_set_rejects_wrong_type() {
        let mut b = builder();
        let err = b.set(0, Value::Utf8("x".into())).unwrap_err();
        assert!(matches!(err, StagepointError::TypeMismatch(_)));
        assert!(b.is_untouched());
    }

    #[test]
    fn test_build_requires_all_fields() {
        let mut b = builder();
        b.set(0, Value::Int64(1)).unwrap();
        assert!(matches!(
            b.build().unwrap_err(),
            StagepointError::InvalidInput(_)
        ));
    }

    #[test]
    fn test_scalar_builder_yields_bare_value() {
        let ty = TypeContext::new()
            .resolve(&TypeDescriptor::scalar(DataType::Int64))
            .unwrap();
        let mut b = RecordBuilder::new(ty);
        b.set_named("value", Value::Int64(9)).unwrap();
        assert_eq!(b.build().unwrap(), Value::Int64(9));
    }

    #[test]
    fn test_reset() {
        let mut b = builder();
        b.set(0, Value::Int64(1)).unwrap();
        b.reset();
        assert!(b.is_untouched());
        assert_eq!(b.get_named("id"), None);
    }
}
