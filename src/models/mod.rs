pub mod conversation;
pub mod events;
pub mod message;
pub mod user;

pub use conversation::*;
pub use events::*;
pub use message::*;
pub use user::*;
