pub mod field_mask;
pub mod header;
pub mod point;
pub mod quantize;
