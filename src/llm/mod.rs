pub mod client;
pub mod router;
