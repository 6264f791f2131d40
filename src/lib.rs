pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;

use std::sync::Arc;

use tokio::sync::mpsc;

use config::Config;
use services::{
    sessions::PresenceChange, ConversationActors, ConversationStore, JwtVerifier, MediaUploads,
    MessagePipeline, PresenceTracker, ReceiptAggregator, SessionRegistry, TokenVerifier,
    TypingCoordinator, UserDirectory,
};
use storage::{BlobStore, DocumentStore, MemoryBlobStore, MemoryDocumentStore, Store};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub verifier: Arc<dyn TokenVerifier>,
    pub sessions: Arc<SessionRegistry>,
    pub conversations: ConversationStore,
    pub pipeline: MessagePipeline,
    pub receipts: ReceiptAggregator,
    pub typing: Arc<TypingCoordinator>,
    pub presence: Arc<PresenceTracker>,
    pub users: UserDirectory,
    pub media: MediaUploads,
}

impl AppState {
    /// Wire every component over the given collaborators and start the
    /// background tasks (presence loop and typing sweeper).
    pub fn start(
        config: Config,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let (state, presence_changes) = Self::build(config, documents, blobs, verifier);

        tokio::spawn(state.presence.clone().run(presence_changes));
        tokio::spawn(
            state
                .typing
                .clone()
                .run_sweeper(state.config.messaging.typing_sweep_interval),
        );

        state
    }

    /// In-memory store and blob store with JWT verification from `config`.
    pub fn in_memory(config: Config) -> Self {
        let verifier = Arc::new(JwtVerifier::new(&config.jwt));
        Self::start(
            config,
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryBlobStore::new("memory://blobs")),
            verifier,
        )
    }

    fn build(
        config: Config,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> (Self, mpsc::UnboundedReceiver<PresenceChange>) {
        let messaging = config.messaging.clone();
        let store = Store::new(documents, &config.store);

        let (sessions, presence_changes) = SessionRegistry::new();
        let sessions = Arc::new(sessions);
        let conversations = ConversationStore::new(store.clone());
        let actors = ConversationActors::new(conversations.clone(), messaging.actor_idle_timeout);
        let receipts = ReceiptAggregator::new(store.clone(), actors.clone(), sessions.clone());
        let pipeline = MessagePipeline::new(
            store.clone(),
            conversations.clone(),
            actors,
            sessions.clone(),
            receipts.clone(),
            messaging.page_size,
        );
        let typing = Arc::new(TypingCoordinator::new(
            conversations.clone(),
            sessions.clone(),
            messaging.typing_ttl,
        ));
        let presence = Arc::new(PresenceTracker::new(
            sessions.clone(),
            conversations.clone(),
            typing.clone(),
            store.clone(),
        ));
        let users = UserDirectory::new(store.clone(), conversations.clone(), blobs.clone());
        let media = MediaUploads::new(blobs);

        let state = Self {
            config: Arc::new(config),
            store,
            verifier,
            sessions,
            conversations,
            pipeline,
            receipts,
            typing,
            presence,
            users,
            media,
        };
        (state, presence_changes)
    }
}
