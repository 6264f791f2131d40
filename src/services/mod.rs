pub mod actors;
pub mod auth;
pub mod conversations;
pub mod media;
pub mod pipeline;
pub mod presence;
pub mod receipts;
pub mod sessions;
pub mod typing;
pub mod users;

pub use actors::ConversationActors;
pub use auth::{JwtVerifier, TokenVerifier};
pub use conversations::ConversationStore;
pub use media::{MediaUploads, UploadKind};
pub use pipeline::MessagePipeline;
pub use presence::PresenceTracker;
pub use receipts::ReceiptAggregator;
pub use sessions::{SessionGuard, SessionRegistry};
pub use typing::TypingCoordinator;
pub use users::UserDirectory;
