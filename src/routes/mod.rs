pub mod maintenance;
pub mod registration;
