//! HTTP Handlers

mod gpu;
mod ping;
mod task;
mod websocket;

pub use gpu::*;
pub use ping::*;
pub use task::*;
pub use websocket::*;
