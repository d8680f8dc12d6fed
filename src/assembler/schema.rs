//! Descriptor-to-structural-type mapping.
//!
//! Epistemic foundation:
//! - K_i: A structural type is a pure function of its descriptor
//! - K_i: Resolution is cached by descriptor fingerprint
//! - B_i: A descriptor may contain types with no structural mapping → Result

use crate::models::{DataType, Field, Result, StagepointError, TypeDescriptor};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// Concrete record type resolved from a descriptor.
#[derive(Debug)]
pub struct StructuralType {
    name: String,
    descriptor: TypeDescriptor,
    fields: Vec<Field>,
    slots: HashMap<String, usize>,
}

/// Location of a (possibly nested) field inside a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    /// Top-level slot
    pub slot: usize,
    /// Struct indices below the top-level slot
    pub nested: Vec<usize>,
    /// Type of the addressed value, nullable if any enclosing struct is
    pub data_type: DataType,
}

impl StructuralType {
    fn new(descriptor: &TypeDescriptor) -> Result<Self> {
        if let Some(name) = descriptor.root().find_opaque() {
            return Err(StagepointError::TypeMismatch(format!(
                "type '{name}' in {descriptor} cannot be resolved to a record type"
            )));
        }

        let fields = descriptor.fields();
        let mut slots = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if slots.insert(field.name.clone(), i).is_some() {
                return Err(StagepointError::TypeMismatch(format!(
                    "duplicate field '{}' in {descriptor}",
                    field.name
                )));
            }
        }

        Ok(Self {
            name: format!("Record_{:016x}", descriptor.fingerprint()),
            descriptor: descriptor.clone(),
            fields,
            slots,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }

    /// Resolve a dotted field path such as `origin.lat`.
    pub fn resolve_path(&self, path: &str) -> Option<FieldPath> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let slot = self.slot(head)?;

        let mut current = self.fields[slot].data_type.clone();
        let mut nullable = current.is_nullable();
        let mut nested = Vec::new();
        for segment in segments {
            let DataType::Struct(children) = current.non_null() else {
                return None;
            };
            let index = children.iter().position(|f| f.name == segment)?;
            let child = children[index].data_type.clone();
            nullable |= child.is_nullable();
            nested.push(index);
            current = child;
        }

        let data_type = if nullable {
            DataType::nullable(current)
        } else {
            current
        };
        Some(FieldPath {
            slot,
            nested,
            data_type,
        })
    }

    /// Source text of this type's definition.
    pub fn definition(&self) -> String {
        let mut out = format!("struct {} {{\n", self.name);
        for field in &self.fields {
            let _ = writeln!(out, "    {}: {},", field.name, field.data_type);
        }
        out.push('}');
        out
    }
}

/// Explicit type-resolution context for assembler generation.
///
/// Shared by every generator that should agree on type identities; there is
/// no process-wide instance.
#[derive(Debug, Default)]
pub struct TypeContext {
    types: DashMap<u64, Arc<StructuralType>>,
}

impl TypeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a descriptor to its structural type, resolving it on first use.
    pub fn resolve(&self, descriptor: &TypeDescriptor) -> Result<Arc<StructuralType>> {
        let fingerprint = descriptor.fingerprint();
        if let Some(existing) = self.types.get(&fingerprint) {
            if existing.descriptor() != descriptor {
                return Err(StagepointError::Internal(format!(
                    "fingerprint collision between {} and {descriptor}",
                    existing.descriptor()
                )));
            }
            return Ok(Arc::clone(&existing));
        }

        let resolved = Arc::new(StructuralType::new(descriptor)?);
        debug!(name = %resolved.name(), fields = resolved.len(), "Resolved structural type");
        Ok(Arc::clone(
            self.types.entry(fingerprint).or_insert(resolved).value(),
        ))
    }

    /// Number of resolved types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> TypeDescriptor {
        TypeDescriptor::record([
            ("name", DataType::Utf8),
            (
                "address",
                DataType::nullable(DataType::Struct(vec![
                    Field::new("city", DataType::Utf8),
                    Field::new("zip", DataType::Int32),
                ])),
            ),
        ])
    }

    #[test]
    fn test_resolve_is_cached() {
        let ctx = TypeContext::new();
        let a = ctx.resolve(&person()).unwrap();
        let b = ctx.resolve(&person()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_nested_path_inherits_nullability() {
        let ctx = TypeContext::new();
        let ty = ctx.resolve(&person()).unwrap();

        let path = ty.resolve_path("address.zip").unwrap();
        assert_eq!(path.slot, 1);
        assert_eq!(path.nested, vec![1]);
        assert_eq!(path.data_type, DataType::nullable(DataType::Int32));

        assert_eq!(ty.resolve_path("name").unwrap().data_type, DataType::Utf8);
        assert!(ty.resolve_path("address.street").is_none());
        assert!(ty.resolve_path("name.first").is_none());
        assert!(ty.resolve_path("age").is_none());
    }

    #[test]
    fn test_opaque_and_duplicate_fields_rejected() {
        let ctx = TypeContext::new();
        let opaque = TypeDescriptor::record([("g", DataType::Opaque("Geometry".into()))]);
        assert!(matches!(
            ctx.resolve(&opaque).unwrap_err(),
            StagepointError::TypeMismatch(_)
        ));

        let dup = TypeDescriptor::record([("a", DataType::Int32), ("a", DataType::Int64)]);
        assert!(matches!(
            ctx.resolve(&dup).unwrap_err(),
            StagepointError::TypeMismatch(_)
        ));
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_scalar_descriptor_has_value_slot() {
        let ctx = TypeContext::new();
        let ty = ctx
            .resolve(&TypeDescriptor::scalar(DataType::Int64))
            .unwrap();
        assert_eq!(ty.slot("value"), Some(0));
        assert!(ty.definition().contains("value: i64,"));
    }
}
