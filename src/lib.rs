pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod model_registry;
pub mod openai;
pub mod preprocess;
pub mod tool_calls;
pub mod translate;
pub mod upstream;
