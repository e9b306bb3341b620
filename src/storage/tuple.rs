use std::sync::Arc;

use crate::catalog::{Schema, SchemaRef};
use crate::utils::scalar::ScalarValue;

/// One record: a schema plus one value per column. Values are fixed-width,
/// so `schema.fixed_size()` is also the on-page footprint of the tuple.
#[derive(Debug, Clone)]
pub struct Tuple {
    pub schema: SchemaRef,
    pub values: Vec<ScalarValue>,
}

impl Tuple {
    pub fn new(schema: SchemaRef, values: Vec<ScalarValue>) -> Self {
        debug_assert_eq!(schema.column_count(), values.len());
        Tuple { schema, values }
    }

    pub fn value(&self, index: usize) -> &ScalarValue {
        &self.values[index]
    }

    /// Concatenation of `self`'s fields followed by `other`'s, under the
    /// concatenated schema. Used by joins to build output records.
    pub fn concat(&self, other: &Tuple) -> Tuple {
        let schema = Arc::new(Schema::concat(&self.schema, &other.schema));
        let mut values = self.values.clone();
        values.extend(other.values.iter().cloned());
        Tuple { schema, values }
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for Tuple {}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        write!(f, "({})", fields.join(", "))
    }
}
