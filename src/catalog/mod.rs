mod data_type;
mod schema;

pub use data_type::DataType;
pub use schema::{Column, Schema, SchemaRef};
