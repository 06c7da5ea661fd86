pub mod alert;
pub mod detection;
pub mod metric;
