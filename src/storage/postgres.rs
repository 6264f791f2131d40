use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{types::Json, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{Collection, DocumentStore, Filter, Query};
use crate::error::AppResult;

/// Documents stored as JSONB rows in a single `documents` table.
#[derive(Clone)]
pub struct PgDocumentStore {
    db: PgPool,
}

impl PgDocumentStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.db)
            .await
            .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;
        Ok(())
    }
}

fn single_field(field: &str, value: Value) -> Json<Value> {
    let mut object = Map::new();
    object.insert(field.to_string(), value);
    Json(Value::Object(object))
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &[Filter]) {
    for filter in filters {
        qb.push(" AND ");
        match filter {
            Filter::Eq(field, value) => {
                qb.push("doc @> ");
                qb.push_bind(single_field(field, value.clone()));
            }
            Filter::Contains(field, value) => {
                qb.push("doc @> ");
                qb.push_bind(single_field(field, Value::Array(vec![value.clone()])));
            }
            Filter::Search(fields, needle) => {
                let pattern = format!("%{}%", escape_like(needle));
                qb.push("(");
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        qb.push(" OR ");
                    }
                    // Field names are compile-time constants, never user input.
                    qb.push(format!("doc->>'{}' ILIKE ", field));
                    qb.push_bind(pattern.clone());
                }
                if fields.is_empty() {
                    qb.push("FALSE");
                }
                qb.push(")");
            }
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, collection: Collection, id: Uuid) -> AppResult<Option<Value>> {
        let doc: Option<Json<Value>> =
            sqlx::query_scalar("SELECT doc FROM documents WHERE collection = $1 AND id = $2")
                .bind(collection.as_str())
                .bind(id)
                .fetch_optional(&self.db)
                .await?;

        Ok(doc.map(|d| d.0))
    }

    async fn insert(&self, collection: Collection, id: Uuid, doc: Value) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (collection, id, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id) DO NOTHING
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(Json(doc))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn put(&self, collection: Collection, id: Uuid, doc: Value) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id)
            DO UPDATE SET doc = EXCLUDED.doc, updated_at = NOW()
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(Json(doc))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn patch(
        &self,
        collection: Collection,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE documents SET doc = doc || $3, updated_at = NOW() WHERE collection = $1 AND id = $2",
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(Json(Value::Object(fields)))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_where(&self, collection: Collection, filters: &[Filter]) -> AppResult<u64> {
        let mut qb = QueryBuilder::new("DELETE FROM documents WHERE collection = ");
        qb.push_bind(collection.as_str());
        push_filters(&mut qb, filters);

        let result = qb.build().execute(&self.db).await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, collection: Collection, query: &Query) -> AppResult<Vec<Value>> {
        let mut qb = QueryBuilder::new("SELECT doc FROM documents WHERE collection = ");
        qb.push_bind(collection.as_str());
        push_filters(&mut qb, &query.filters);

        if let Some(field) = query.sort_desc {
            qb.push(format!(" ORDER BY (doc->>'{}')::numeric DESC", field));
        }
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }
        if query.offset > 0 {
            qb.push(" OFFSET ");
            qb.push_bind(query.offset as i64);
        }

        let docs: Vec<Json<Value>> = qb.build_query_scalar().fetch_all(&self.db).await?;
        Ok(docs.into_iter().map(|d| d.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_like_escaping() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[test]
    fn test_filter_sql() {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT doc FROM documents WHERE collection = ");
        qb.push_bind("users");
        push_filters(
            &mut qb,
            &[
                Filter::Contains("participants", json!("x")),
                Filter::Search(&["username", "displayName"], "al".to_string()),
            ],
        );
        assert_eq!(
            qb.sql(),
            "SELECT doc FROM documents WHERE collection = $1 AND doc @> $2 AND \
             (doc->>'username' ILIKE $3 OR doc->>'displayName' ILIKE $4)"
        );
    }
}
