use std::{path::Path, str::FromStr, time::Duration};

use {
    async_trait::async_trait,
    chrono::{DateTime, SecondsFormat, Utc},
    sqlx::{
        Row, SqliteConnection, SqlitePool,
        sqlite::{
            SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
            SqliteSynchronous,
        },
    },
    tracing::{debug, warn},
};

use crate::{
    embeddings::{VectorSpace, blob_to_vector, cosine_similarity, vector_to_blob},
    error::{MemoryError, Result},
    model::Category,
    schema::run_migrations,
    store::{Hit, IndexEntry, IndexRow, IndexStats, IndexStore, SearchFilter, VectorOutcome},
};

const ROW_COLUMNS: &str = "m.id, m.project, m.category, m.tags, m.title, m.source, \
                           m.created_at, m.file_path, m.summary, m.has_more";

const FILTER: &str = "(?{p} IS NULL OR m.project = ?{p}) AND (?{s} IS NULL OR m.source = ?{s})";

const META_MODEL: &str = "vector_model";
const META_DIMS: &str = "vector_dims";

/// SQLite-backed index (FTS5 for keywords, brute-force cosine over blobs for vectors).
#[derive(Clone)]
pub struct SqliteIndexStore {
    pool: SqlitePool,
}

impl SqliteIndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the index database in WAL mode and migrate it.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MemoryError::persistence(parent, e))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        run_migrations(&pool).await?;
        debug!(path = %path.display(), "index opened");
        Ok(Self::new(pool))
    }
}

/// Filter clause bound at positions `p` and `s`.
fn filter_clause(p: usize, s: usize) -> String {
    FILTER
        .replace("{p}", &p.to_string())
        .replace("{s}", &s.to_string())
}

/// Turn free text into an FTS5 OR-query of quoted prefix terms.
///
/// Only letters, digits and `_` survive, so user input can never inject FTS5 syntax.
pub fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t.to_lowercase()))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_err(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

fn row_from(r: &SqliteRow) -> Result<IndexRow, sqlx::Error> {
    let category: String = r.try_get("category")?;
    let tags: String = r.try_get("tags")?;
    let created_at: String = r.try_get("created_at")?;
    Ok(IndexRow {
        id: r.try_get("id")?,
        project: r.try_get("project")?,
        category: Category::from_str(&category).map_err(decode_err)?,
        tags: serde_json::from_str(&tags).map_err(decode_err)?,
        title: r.try_get("title")?,
        source: r.try_get("source")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(decode_err)?
            .with_timezone(&Utc),
        file_path: r.try_get("file_path")?,
        summary: r.try_get("summary")?,
        has_more: r.try_get("has_more")?,
    })
}

async fn read_space(conn: &mut SqliteConnection) -> Result<Option<VectorSpace>, sqlx::Error> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM meta WHERE key IN (?1, ?2)")
            .bind(META_MODEL)
            .bind(META_DIMS)
            .fetch_all(&mut *conn)
            .await?;
    let value = |key: &str| rows.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
    let model = value(META_MODEL).map(str::to_string);
    let dims = value(META_DIMS).and_then(|v| v.parse::<usize>().ok());
    Ok(model.zip(dims).map(|(model, dims)| VectorSpace::new(model, dims)))
}

async fn write_space(
    conn: &mut SqliteConnection,
    space: Option<&VectorSpace>,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM meta WHERE key IN (?1, ?2)")
        .bind(META_MODEL)
        .bind(META_DIMS)
        .execute(&mut *conn)
        .await?;
    if let Some(space) = space {
        sqlx::query("INSERT INTO meta (key, value) VALUES (?1, ?2), (?3, ?4)")
            .bind(META_MODEL)
            .bind(&space.model)
            .bind(META_DIMS)
            .bind(space.dims.to_string())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn write_row(conn: &mut SqliteConnection, entry: &IndexEntry) -> Result<(), sqlx::Error> {
    let row = &entry.row;
    let tags = serde_json::to_string(&row.tags).map_err(decode_err)?;
    sqlx::query(
        "INSERT INTO memories
            (id, project, category, tags, title, what, why, impact, source, created_at,
             file_path, summary, has_more)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(id) DO UPDATE SET
            project = excluded.project,
            category = excluded.category,
            tags = excluded.tags,
            title = excluded.title,
            what = excluded.what,
            why = excluded.why,
            impact = excluded.impact,
            source = excluded.source,
            created_at = excluded.created_at,
            file_path = excluded.file_path,
            summary = excluded.summary,
            has_more = excluded.has_more",
    )
    .bind(&row.id)
    .bind(&row.project)
    .bind(row.category.as_str())
    .bind(&tags)
    .bind(&row.title)
    .bind(&entry.what)
    .bind(&entry.why)
    .bind(&entry.impact)
    .bind(&row.source)
    .bind(format_timestamp(&row.created_at))
    .bind(&row.file_path)
    .bind(&row.summary)
    .bind(row.has_more)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM memories_fts WHERE id = ?1")
        .bind(&row.id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO memories_fts (id, title, what, why, impact, tags)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(&row.id)
    .bind(&row.title)
    .bind(&entry.what)
    .bind(entry.why.as_deref().unwrap_or(""))
    .bind(entry.impact.as_deref().unwrap_or(""))
    .bind(row.tags.join(" "))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_vector(
    conn: &mut SqliteConnection,
    id: &str,
    space: &VectorSpace,
    vector: &[f32],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO memory_vectors (id, model, dims, embedding) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            model = excluded.model, dims = excluded.dims, embedding = excluded.embedding",
    )
    .bind(id)
    .bind(&space.model)
    .bind(i64::try_from(space.dims).unwrap_or(i64::MAX))
    .bind(vector_to_blob(vector))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn drop_vector(conn: &mut SqliteConnection, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM memory_vectors WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn upsert(
        &self,
        entry: &IndexEntry,
        space: Option<&VectorSpace>,
    ) -> Result<VectorOutcome> {
        let mut tx = self.pool.begin().await?;
        write_row(&mut tx, entry).await?;

        let outcome = match (entry.vector.as_deref(), space) {
            (Some(vector), Some(space)) if vector.len() == space.dims => {
                match read_space(&mut tx).await? {
                    Some(stored) if stored != *space => {
                        drop_vector(&mut tx, &entry.row.id).await?;
                        VectorOutcome::Incompatible { stored }
                    },
                    stored => {
                        if stored.is_none() {
                            write_space(&mut tx, Some(space)).await?;
                        }
                        write_vector(&mut tx, &entry.row.id, space, vector).await?;
                        VectorOutcome::Stored
                    },
                }
            },
            (Some(vector), Some(space)) => {
                warn!(
                    id = %entry.row.id,
                    got = vector.len(),
                    expected = space.dims,
                    "vector has the wrong dimension, storing row without it"
                );
                drop_vector(&mut tx, &entry.row.id).await?;
                VectorOutcome::Absent
            },
            _ => {
                drop_vector(&mut tx, &entry.row.id).await?;
                VectorOutcome::Absent
            },
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn keyword_search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<Hit>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        // Column weights: id, title, what, why, impact, tags.
        let sql = format!(
            "SELECT {ROW_COLUMNS}, bm25(memories_fts, 0.0, 4.0, 2.0, 1.0, 1.0, 2.0) AS rank
             FROM memories_fts
             JOIN memories m ON m.id = memories_fts.id
             WHERE memories_fts MATCH ?1 AND {}
             ORDER BY rank ASC, m.created_at DESC, m.id ASC
             LIMIT ?4",
            filter_clause(2, 3)
        );
        let rows = sqlx::query(&sql)
            .bind(&fts)
            .bind(filter.project.as_deref())
            .bind(filter.source.as_deref())
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let rank: f64 = r.try_get("rank")?;
                Ok(Hit {
                    row: row_from(r)?,
                    score: -rank,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(MemoryError::from)
    }

    async fn vector_search(
        &self,
        query: &[f32],
        space: &VectorSpace,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<Hit>> {
        let mut conn = self.pool.acquire().await?;
        match read_space(&mut conn).await? {
            None => return Ok(Vec::new()),
            Some(stored) if stored != *space => {
                return Err(MemoryError::NeedsReindex {
                    stored,
                    active: space.clone(),
                });
            },
            Some(_) => {},
        }
        if query.len() != space.dims {
            return Err(MemoryError::Provider(format!(
                "query vector has {} dimensions, index expects {}",
                query.len(),
                space.dims
            )));
        }

        let sql = format!(
            "SELECT {ROW_COLUMNS}, v.embedding
             FROM memory_vectors v
             JOIN memories m ON m.id = v.id
             WHERE v.model = ?1 AND v.dims = ?2 AND {}",
            filter_clause(3, 4)
        );
        let rows = sqlx::query(&sql)
            .bind(&space.model)
            .bind(to_i64(space.dims))
            .bind(filter.project.as_deref())
            .bind(filter.source.as_deref())
            .fetch_all(&mut *conn)
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for r in &rows {
            let blob: Vec<u8> = r.try_get("embedding")?;
            let Some(vector) = blob_to_vector(&blob).filter(|v| v.len() == space.dims) else {
                warn!(id = %r.try_get::<String, _>("id")?, "skipping corrupt vector");
                continue;
            };
            hits.push(Hit {
                row: row_from(r)?,
                score: f64::from(cosine_similarity(query, &vector)),
            });
        }
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.row.created_at.cmp(&a.row.created_at))
                .then_with(|| a.row.id.cmp(&b.row.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn recent(&self, filter: &SearchFilter, limit: usize) -> Result<Vec<IndexRow>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM memories m WHERE {}
             ORDER BY m.created_at DESC, m.id ASC LIMIT ?3",
            filter_clause(1, 2)
        );
        let rows = sqlx::query(&sql)
            .bind(filter.project.as_deref())
            .bind(filter.source.as_deref())
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_from).collect::<Result<_, _>>()?)
    }

    async fn count(&self, filter: &SearchFilter) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM memories m WHERE {}", filter_clause(1, 2));
        let n: i64 = sqlx::query_scalar(&sql)
            .bind(filter.project.as_deref())
            .bind(filter.source.as_deref())
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    async fn resolve_prefix(&self, prefix: &str) -> Result<Vec<IndexRow>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM memories m
             WHERE substr(m.id, 1, length(?1)) = ?1
             ORDER BY m.id LIMIT 50"
        );
        let rows = sqlx::query(&sql).bind(prefix).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_from).collect::<Result<_, _>>()?)
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM memories WHERE id = ?1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for id in ids {
            drop_vector(&mut tx, id).await?;
            sqlx::query("DELETE FROM memories_fts WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += sqlx::query("DELETE FROM memories WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }

    async fn replace_all(&self, entries: &[IndexEntry], space: Option<&VectorSpace>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for stmt in [
            "DELETE FROM memory_vectors",
            "DELETE FROM memories_fts",
            "DELETE FROM memories",
        ] {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        write_space(&mut tx, space).await?;
        for entry in entries {
            write_row(&mut tx, entry).await?;
            if let (Some(vector), Some(space)) = (entry.vector.as_deref(), space)
                && vector.len() == space.dims
            {
                write_vector(&mut tx, &entry.row.id, space, vector).await?;
            }
        }
        tx.commit().await?;
        debug!(rows = entries.len(), "index replaced");
        Ok(())
    }

    async fn vector_space(&self) -> Result<Option<VectorSpace>> {
        let mut conn = self.pool.acquire().await?;
        Ok(read_space(&mut conn).await?)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let (memories, vectors): (i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM memories), (SELECT COUNT(*) FROM memory_vectors)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(IndexStats {
            memories: usize::try_from(memories).unwrap_or(0),
            vectors: usize::try_from(vectors).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::model::MemoryRecord,
        chrono::TimeZone,
        tempfile::TempDir,
    };

    async fn store() -> (SqliteIndexStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteIndexStore::connect(&tmp.path().join("index.db"))
            .await
            .unwrap();
        (store, tmp)
    }

    fn entry(id: &str, title: &str, what: &str, minute: u32) -> IndexEntry {
        let record = MemoryRecord {
            id: id.into(),
            title: title.into(),
            category: Category::Decision,
            tags: vec!["backend".into()],
            what: what.into(),
            why: None,
            impact: None,
            details: None,
            related_files: vec![],
            source: Some("claude-code".into()),
            project: "api".into(),
            created_at: Utc.with_ymd_and_hms(2026, 2, 1, 10, minute, 0).unwrap(),
        };
        IndexEntry::from_record(&record, "api/2026-02-01-session.md", 50, 320)
    }

    #[test]
    fn fts_query_sanitises_input() {
        assert_eq!(
            fts_query("JWT auth!").as_deref(),
            Some("\"jwt\"* OR \"auth\"*")
        );
        assert_eq!(fts_query("\"; DROP TABLE memories; --"), Some("\"drop\"* OR \"table\"* OR \"memories\"*".to_string()));
        assert_eq!(fts_query("  ?!  "), None);
    }

    #[tokio::test]
    async fn keyword_search_finds_stems_and_prefixes() {
        let (store, _tmp) = store().await;
        store
            .upsert(&entry("a", "Switched to JWT", "Replaced cookie authentication with tokens", 1), None)
            .await
            .unwrap();
        store
            .upsert(&entry("b", "Pasta recipe", "Cooking notes", 2), None)
            .await
            .unwrap();

        let hits = store
            .keyword_search("authenticating", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].row.id, "a");

        let hits = store
            .keyword_search("cook", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits[0].row.id, "b");

        let none = store
            .keyword_search(
                "cook",
                &SearchFilter {
                    project: Some("web".into()),
                    ..Default::default()
                },
                10,
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_id() {
        let (store, _tmp) = store().await;
        store.upsert(&entry("a", "first", "one", 1), None).await.unwrap();
        store.upsert(&entry("a", "second", "two", 1), None).await.unwrap();
        assert_eq!(store.count(&SearchFilter::default()).await.unwrap(), 1);
        let rows = store.resolve_prefix("a").await.unwrap();
        assert_eq!(rows[0].title, "second");
        assert!(store.keyword_search("one", &SearchFilter::default(), 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vector_space_is_enforced() {
        let (store, _tmp) = store().await;
        let small = VectorSpace::new("model-a", 2);
        let other = VectorSpace::new("model-b", 3);

        let e = entry("a", "t", "w", 1).with_vector(Some(vec![1.0, 0.0]));
        assert_eq!(store.upsert(&e, Some(&small)).await.unwrap(), VectorOutcome::Stored);
        assert_eq!(store.vector_space().await.unwrap(), Some(small.clone()));

        let e = entry("b", "t", "w", 2).with_vector(Some(vec![1.0, 0.0, 0.0]));
        assert_eq!(
            store.upsert(&e, Some(&other)).await.unwrap(),
            VectorOutcome::Incompatible { stored: small.clone() }
        );
        assert_eq!(store.stats().await.unwrap(), IndexStats { memories: 2, vectors: 1 });

        let err = store
            .vector_search(&[1.0, 0.0, 0.0], &other, &SearchFilter::default(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::NeedsReindex { .. }));

        let hits = store
            .vector_search(&[1.0, 0.0], &small, &SearchFilter::default(), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn replace_all_swaps_contents_and_space() {
        let (store, _tmp) = store().await;
        let old = VectorSpace::new("old", 2);
        store
            .upsert(&entry("gone", "t", "w", 1).with_vector(Some(vec![1.0, 1.0])), Some(&old))
            .await
            .unwrap();

        let new = VectorSpace::new("new", 3);
        let entries = vec![
            entry("x", "t", "w", 1).with_vector(Some(vec![0.0, 1.0, 0.0])),
            entry("y", "t", "w", 2),
        ];
        store.replace_all(&entries, Some(&new)).await.unwrap();

        assert!(!store.contains("gone").await.unwrap());
        assert_eq!(store.vector_space().await.unwrap(), Some(new.clone()));
        assert_eq!(store.stats().await.unwrap(), IndexStats { memories: 2, vectors: 1 });
        let hits = store
            .vector_search(&[0.0, 1.0, 0.0], &new, &SearchFilter::default(), 5)
            .await
            .unwrap();
        assert_eq!(hits[0].row.id, "x");

        store.replace_all(&[], None).await.unwrap();
        assert_eq!(store.vector_space().await.unwrap(), None);
    }

    #[tokio::test]
    async fn recent_delete_and_prefix() {
        let (store, _tmp) = store().await;
        for (id, minute) in [("0190-aa", 1), ("0190-ab", 2), ("0191-cc", 3)] {
            store.upsert(&entry(id, "t", "w", minute), None).await.unwrap();
        }
        let recent = store.recent(&SearchFilter::default(), 2).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["0191-cc", "0190-ab"]);

        assert_eq!(store.resolve_prefix("0190").await.unwrap().len(), 2);
        assert_eq!(store.delete(&["0190-aa".to_string()]).await.unwrap(), 1);
        assert_eq!(store.resolve_prefix("0190").await.unwrap().len(), 1);
        assert_eq!(store.count(&SearchFilter::default()).await.unwrap(), 2);
    }
}
