pub mod compose;
pub mod context;
pub mod outlet;
pub mod research;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;
pub mod workflow;
