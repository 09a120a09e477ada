pub mod agent;
pub mod context;
pub mod conversation;
pub mod errors;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod session;
pub mod tools;
pub mod transport;
