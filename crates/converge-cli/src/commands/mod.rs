pub mod app;
pub mod render;
pub mod serve;
pub mod webhook;
