pub mod connections;
pub mod item;
pub mod rules;
