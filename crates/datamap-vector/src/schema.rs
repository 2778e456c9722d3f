use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

pub const ROW_ID: &str = "row_id";
pub const ITEM_ID: &str = "item_id";
pub const SUB_INDEX: &str = "sub_index";
pub const PAYLOAD: &str = "payload";
pub const VECTOR: &str = "vector";

/// One row per stored vector. Array fields spread an item over `sub_index` 0..n.
pub fn build_points_schema(dim: i32) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new(ROW_ID, DataType::Utf8, false),
		Field::new(ITEM_ID, DataType::Utf8, false),
		Field::new(SUB_INDEX, DataType::Int32, false),
		Field::new(PAYLOAD, DataType::Utf8, false),
		Field::new(VECTOR, DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim), true),
	]))
}

pub fn row_id(item_id: &str, sub_index: usize) -> String {
	format!("{item_id}#{sub_index}")
}
