pub mod row;
pub mod value;
