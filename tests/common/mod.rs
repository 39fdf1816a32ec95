#![allow(dead_code)]

pub mod fixtures;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use http_body_util::BodyExt;
use ingest::config::{AppConfig, DEFAULT_MAX_UPLOAD_BYTES};
use ingest::db::{self, PgPool};
use ingest::jobs::{Delivery, IngestionTask, PgTaskQueue, QueueError, QueueResult, TaskQueue};
use ingest::models::{Document, DocumentChunk, Job};
use ingest::routes;
use ingest::state::AppState;
use ingest::storage::LocalContentStore;
use ingest::Worker;
use once_cell::sync::Lazy;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub const WORKER_TAG: &str = "test@0.1.0/0";

/// Rejects every enqueue, as a broker outage would.
#[derive(Default)]
pub struct FailingQueue;

#[async_trait]
impl TaskQueue for FailingQueue {
    async fn enqueue(&self, _task: IngestionTask) -> QueueResult<()> {
        Err(QueueError::Database(
            diesel::result::Error::BrokenTransactionManager,
        ))
    }

    async fn consume(&self) -> QueueResult<Option<Delivery>> {
        Ok(None)
    }

    async fn ack(&self, _delivery: &Delivery) -> QueueResult<()> {
        Ok(())
    }

    async fn retry(&self, _delivery: &Delivery, _delay: Duration, _error: &str) -> QueueResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct TestOptions {
    pub failing_queue: bool,
    pub unwritable_storage: bool,
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    upload_root: TempDir,
    upload_dir: PathBuf,
}

impl TestApp {
    /// `None` when no test database is configured; callers skip.
    pub async fn new() -> Result<Option<Self>> {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Result<Option<Self>> {
        let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set; skipping database test");
            return Ok(None);
        };

        let upload_root = tempfile::tempdir().context("failed to create upload dir")?;
        let upload_dir = if options.unwritable_storage {
            let blocker = upload_root.path().join("blocked");
            std::fs::write(&blocker, b"not a directory")?;
            blocker
        } else {
            upload_root.path().join("uploads")
        };

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            cors_allowed_origin: None,
            upload_dir: upload_dir.clone(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            converter_program: "soffice".to_string(),
            converter_timeout_secs: 5,
            conversion_scratch_dir: Some(upload_root.path().join("scratch")),
            worker_name: "test".to_string(),
            worker_concurrency: 1,
            worker_poll_interval_ms: 10,
            job_max_attempts: 3,
            job_lease_secs: 900,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(LocalContentStore::new(upload_dir.clone()));
        let queue: Arc<dyn TaskQueue> = if options.failing_queue {
            Arc::new(FailingQueue)
        } else {
            Arc::new(PgTaskQueue::new(
                pool.clone(),
                config.job_max_attempts,
                config.job_lease(),
            ))
        };
        let state = AppState::new(pool, config, storage, queue);
        let router = routes::create_router(state.clone());

        Ok(Some(Self {
            state,
            router,
            upload_root,
            upload_dir,
        }))
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(truncate_all).await
    }

    pub fn upload_dir(&self) -> &std::path::Path {
        &self.upload_dir
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.upload_root.path().join("scratch")
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            Arc::new(self.state.clone()),
            WORKER_TAG.to_string(),
            Duration::from_millis(10),
        )
    }

    /// Runs one consumer loop until the queue has nothing due.
    pub async fn drain_queue(&self) -> Result<usize> {
        let worker = self.worker();
        let mut handled = 0;
        while worker.tick().await? {
            handled += 1;
        }
        Ok(handled)
    }

    pub async fn document(&self, document_id: Uuid) -> Result<Option<Document>> {
        self.with_conn(move |conn| {
            Ok(ingest::registry::get_document(conn, document_id).optional()?)
        })
        .await
    }

    pub async fn chunks(&self, document_id: Uuid) -> Result<Vec<DocumentChunk>> {
        self.with_conn(move |conn| Ok(ingest::chunks::list_chunks(conn, document_id)?))
            .await
    }

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.with_conn(|conn| {
            use ingest::schema::jobs;
            let rows = jobs::table
                .order(jobs::created_at.asc())
                .load::<Job>(conn)
                .context("failed to load jobs")?;
            Ok(rows)
        })
        .await
    }

    pub async fn document_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            use ingest::schema::documents;
            Ok(documents::table.count().get_result(conn)?)
        })
        .await
    }

    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        self.send(Method::GET, path).await
    }

    pub async fn delete(&self, path: &str) -> Result<hyper::Response<Body>> {
        self.send(Method::DELETE, path).await
    }

    pub async fn post_empty(&self, path: &str) -> Result<hyper::Response<Body>> {
        self.send(Method::POST, path).await
    }

    async fn send(&self, method: Method, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn upload_document(
        &self,
        user_id: Option<Uuid>,
        filename: &str,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();

        if let Some(user_id) = user_id {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(b"Content-Disposition: form-data; name=\"user_id\"\r\n\r\n");
            body.extend(user_id.to_string().as_bytes());
            body.extend(b"\r\n");
        }

        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        if let Some(content_type) = content_type {
            body.extend(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        body.extend(b"\r\n");
        body.extend(data);
        body.extend(b"\r\n");
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/documents")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn body_json(response: hyper::Response<Body>) -> Result<serde_json::Value> {
    let bytes = body_to_vec(response.into_body()).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        db::run_migrations(&pool)?;
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute("TRUNCATE TABLE document_chunks, documents, jobs RESTART IDENTITY CASCADE;")
        .context("failed to truncate tables")?;
    Ok(())
}
