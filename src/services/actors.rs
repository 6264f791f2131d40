//! One actor per active conversation.
//!
//! Every mutation of a conversation or of one of its messages runs as a job on
//! that conversation's actor, one job at a time. This is what keeps sequence
//! numbers gap-free and unread counters free of lost updates without any lock
//! shared across conversations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::conversations::ConversationStore;
use crate::{
    error::{AppError, AppResult},
    models::Conversation,
    storage::Store,
};

const QUEUE_CAPACITY: usize = 64;

type Job = Box<dyn for<'a> FnOnce(&'a mut ConversationState) -> BoxFuture<'a, ()> + Send>;

fn job<F>(f: F) -> Job
where
    F: for<'a> FnOnce(&'a mut ConversationState) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// State owned by a conversation actor. The conversation document is cached
/// between jobs and reloaded after any job that failed.
pub struct ConversationState {
    id: Uuid,
    conversations: ConversationStore,
    cached: Option<Conversation>,
}

impl ConversationState {
    fn new(id: Uuid, conversations: ConversationStore) -> Self {
        Self {
            id,
            conversations,
            cached: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &Store {
        self.conversations.store()
    }

    pub async fn conversation(&mut self) -> AppResult<&mut Conversation> {
        if self.cached.is_none() {
            self.cached = Some(self.conversations.get(self.id).await?);
        }
        self.cached.as_mut().ok_or(AppError::ConversationNotFound)
    }

    /// Write the cached conversation back to the store.
    pub async fn save(&mut self) -> AppResult<()> {
        if let Some(conversation) = &self.cached {
            self.conversations.store().put(conversation).await?;
        }
        Ok(())
    }

    pub fn forget(&mut self) {
        self.cached = None;
    }
}

struct ActorSlot {
    generation: u64,
    tx: mpsc::Sender<Job>,
}

struct Actors {
    slots: DashMap<Uuid, ActorSlot>,
    next_generation: AtomicU64,
    conversations: ConversationStore,
    idle_timeout: Duration,
}

#[derive(Clone)]
pub struct ConversationActors {
    inner: Arc<Actors>,
}

impl ConversationActors {
    pub fn new(conversations: ConversationStore, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Actors {
                slots: DashMap::new(),
                next_generation: AtomicU64::new(0),
                conversations,
                idle_timeout,
            }),
        }
    }

    /// Run `f` on the conversation's actor and wait for its result.
    pub async fn run<T, F>(&self, conversation_id: Uuid, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut ConversationState) -> BoxFuture<'a, AppResult<T>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut pending = job(move |state| {
            Box::pin(async move {
                let result = f(&mut *state).await;
                if result.is_err() {
                    state.forget();
                }
                let _ = reply_tx.send(result);
            })
        });

        loop {
            let tx = self.sender_for(conversation_id);
            match tx.send(pending).await {
                Ok(()) => break,
                // The actor is retiring; wait for it to leave so a fresh one can start.
                Err(mpsc::error::SendError(returned)) => {
                    pending = returned;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }

        reply_rx.await.map_err(|_| {
            AppError::Internal(anyhow::anyhow!(
                "Conversation actor for {} stopped",
                conversation_id
            ))
        })?
    }

    fn sender_for(&self, conversation_id: Uuid) -> mpsc::Sender<Job> {
        self.inner
            .slots
            .entry(conversation_id)
            .or_insert_with(|| self.spawn(conversation_id))
            .tx
            .clone()
    }

    fn spawn(&self, conversation_id: Uuid) -> ActorSlot {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let state = ConversationState::new(conversation_id, self.inner.conversations.clone());

        tracing::debug!(%conversation_id, generation, "Spawning conversation actor");
        tokio::spawn(run_actor(self.inner.clone(), generation, rx, state));

        ActorSlot { generation, tx }
    }

    pub fn active(&self) -> usize {
        self.inner.slots.len()
    }
}

/// Removes the actor's slot when the task ends, including by panic.
struct Retire {
    actors: Arc<Actors>,
    conversation_id: Uuid,
    generation: u64,
}

impl Drop for Retire {
    fn drop(&mut self) {
        let generation = self.generation;
        self.actors
            .slots
            .remove_if(&self.conversation_id, |_, slot| slot.generation == generation);
    }
}

async fn run_actor(
    actors: Arc<Actors>,
    generation: u64,
    mut rx: mpsc::Receiver<Job>,
    mut state: ConversationState,
) {
    let idle_timeout = actors.idle_timeout;
    let _retire = Retire {
        conversation_id: state.id(),
        actors,
        generation,
    };

    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(job)) => job(&mut state).await,
            Ok(None) => break,
            Err(_) => {
                // Refuse new work, finish what was already queued, then leave.
                rx.close();
                while let Some(job) = rx.recv().await {
                    job(&mut state).await;
                }
                tracing::debug!(conversation_id = %state.id(), generation, "Conversation actor retired");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    async fn setup(idle: Duration) -> (ConversationActors, Conversation) {
        let store = Store::memory();
        let alice = User::new("alice", "Alice").unwrap();
        let bob = User::new("bob", "Bob").unwrap();
        store.put(&alice).await.unwrap();
        store.put(&bob).await.unwrap();

        let conversations = ConversationStore::new(store);
        let conversation = conversations
            .get_or_create_direct(alice.id, bob.id)
            .await
            .unwrap();
        (ConversationActors::new(conversations, idle), conversation)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jobs_are_serialized_per_conversation() {
        let (actors, conversation) = setup(Duration::from_secs(60)).await;
        let conversation_id = conversation.id;

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let actors = actors.clone();
            tasks.push(tokio::spawn(async move {
                actors
                    .run(conversation_id, |state| {
                        Box::pin(async move {
                            let conversation = state.conversation().await?;
                            // Yield between read and write to expose lost updates.
                            let next = conversation.last_sequence + 1;
                            tokio::task::yield_now().await;
                            state.conversation().await?.last_sequence = next;
                            state.save().await?;
                            Ok::<_, AppError>(next)
                        })
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut seen = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_failed_job_reloads_state() {
        let (actors, conversation) = setup(Duration::from_secs(60)).await;

        let err = actors
            .run(conversation.id, |state| {
                Box::pin(async move {
                    state.conversation().await?.last_sequence = 99;
                    Err::<(), _>(AppError::Validation("abort".into()))
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let seq = actors
            .run(conversation.id, |state| {
                Box::pin(async move { Ok::<_, AppError>(state.conversation().await?.last_sequence) })
            })
            .await
            .unwrap();
        assert_eq!(seq, 0);
    }

    #[tokio::test]
    async fn test_missing_conversation() {
        let (actors, _) = setup(Duration::from_secs(60)).await;
        let err = actors
            .run(Uuid::new_v4(), |state| {
                Box::pin(async move { state.conversation().await.map(|_| ()) })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConversationNotFound));
    }

    #[tokio::test]
    async fn test_idle_actor_retires_and_respawns() {
        let (actors, conversation) = setup(Duration::from_millis(20)).await;
        let conversation_id = conversation.id;

        let read = |actors: ConversationActors| async move {
            actors
                .run(conversation_id, |state| {
                    Box::pin(async move { Ok::<_, AppError>(state.conversation().await?.id) })
                })
                .await
        };

        assert_eq!(read(actors.clone()).await.unwrap(), conversation.id);
        assert_eq!(actors.active(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(actors.active(), 0);

        assert_eq!(read(actors.clone()).await.unwrap(), conversation.id);
        assert_eq!(actors.active(), 1);
    }
}
