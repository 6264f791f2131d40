use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{Conversation, Message, User},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Conversations,
    Messages,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Self::Users, Self::Conversations, Self::Messages];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Conversations => "conversations",
            Self::Messages => "messages",
        }
    }
}

/// Predicate over a top-level document field. Field names are fixed by the code
/// (camelCase, as serialized); values are always bound as parameters.
#[derive(Debug, Clone)]
pub enum Filter {
    /// `doc[field] == value`
    Eq(&'static str, Value),
    /// `doc[field]` is an array containing `value`
    Contains(&'static str, Value),
    /// Case-insensitive substring match on any of the string fields.
    Search(&'static [&'static str], String),
}

impl Filter {
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Eq(field, value) => doc.get(*field) == Some(value),
            Filter::Contains(field, value) => doc
                .get(*field)
                .and_then(Value::as_array)
                .map(|items| items.contains(value))
                .unwrap_or(false),
            Filter::Search(fields, needle) => {
                let needle = needle.to_lowercase();
                fields.iter().any(|field| {
                    doc.get(*field)
                        .and_then(Value::as_str)
                        .map(|s| s.to_lowercase().contains(&needle))
                        .unwrap_or(false)
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    /// Numeric field to sort by, descending.
    pub sort_desc: Option<&'static str>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort_desc(mut self, field: &'static str) -> Self {
        self.sort_desc = Some(field);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }
}

/// Schemaless document store. Documents are JSON objects keyed by (collection, id).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: Uuid) -> AppResult<Option<Value>>;

    /// Create-if-absent. Returns false when a document with this id already exists.
    async fn insert(&self, collection: Collection, id: Uuid, doc: Value) -> AppResult<bool>;

    async fn put(&self, collection: Collection, id: Uuid, doc: Value) -> AppResult<()>;

    /// Merge top-level fields into an existing document. Returns false if absent.
    async fn patch(
        &self,
        collection: Collection,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> AppResult<bool>;

    async fn delete(&self, collection: Collection, id: Uuid) -> AppResult<bool>;

    async fn delete_where(&self, collection: Collection, filters: &[Filter]) -> AppResult<u64>;

    async fn query(&self, collection: Collection, query: &Query) -> AppResult<Vec<Value>>;
}

/// A typed record living in one collection.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> Uuid;
}

impl Document for User {
    const COLLECTION: Collection = Collection::Users;

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Document for Conversation {
    const COLLECTION: Collection = Collection::Conversations;

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Document for Message {
    const COLLECTION: Collection = Collection::Messages;

    fn id(&self) -> Uuid {
        self.id
    }
}
