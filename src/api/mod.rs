pub mod handlers;
pub mod middleware;
pub mod router;
pub mod websocket;

pub use router::create_router;
