use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tensorloom_core::{InferError, Tensor, TensorName};

/// Per-request value table for ensemble-scope tensors.
///
/// Write-once: the plan guarantees a single producer per name, so a second
/// write means the wiring validation was bypassed and the request must die
/// loudly instead of clobbering data. Owned by the task driving one request,
/// hence no locking.
#[derive(Debug, Default)]
pub struct TensorRegistry {
    values: HashMap<TensorName, Tensor>,
}

impl TensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: TensorName, tensor: Tensor) -> Result<(), InferError> {
        match self.values.entry(name) {
            Entry::Occupied(slot) => Err(InferError::DuplicateWrite {
                name: slot.key().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(tensor);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &TensorName) -> Option<&Tensor> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &TensorName) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tensorloom_core::Shape;

    use super::*;

    #[test]
    fn second_write_to_a_name_is_rejected() {
        let mut registry = TensorRegistry::new();
        let tensor = Tensor::from_f32(Shape::from_slice(&[2]), &[1.0, 2.0]);
        registry
            .insert("preprocessed".into(), tensor.clone())
            .unwrap();

        let err = registry
            .insert("preprocessed".into(), tensor)
            .unwrap_err();
        assert!(matches!(err, InferError::DuplicateWrite { .. }));

        // The first write survives.
        assert_eq!(registry.len(), 1);
        let kept = registry.get(&"preprocessed".into()).unwrap();
        assert_eq!(kept.as_f32().unwrap(), vec![1.0, 2.0]);
    }
}
