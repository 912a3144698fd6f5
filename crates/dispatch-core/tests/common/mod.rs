//! Shared fixtures for database integration tests
//!
//! Every test gets its own PostgreSQL container with migrations applied, a scratch data
//! directory and a [`Pipeline`] wired to an in-memory feed.

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use dispatch_core::config::PipelineConfig;
use dispatch_core::db::{create_pool, run_migrations};
use dispatch_core::error::PipelineError;
use dispatch_core::nemweb::{DispatchSource, RemoteFile, ReportKind};
use dispatch_core::{Pipeline, ZipCursor};
use sqlx::PgPool;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use zip::write::SimpleFileOptions;

#[ctor::ctor]
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dispatch_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// PostgreSQL container with the warehouse schema
pub struct TestDb {
    _container: ContainerAsync<Postgres>,
    pub pool: PgPool,
    pub url: String,
}

impl TestDb {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let config = PipelineConfig::with_database_url(&url);
        let pool = create_pool(&config.database).await?;
        run_migrations(&pool).await?;

        Ok(Self {
            _container: container,
            pool,
            url,
        })
    }
}

/// Feed serving a fixed set of files from memory
#[derive(Default)]
pub struct StaticSource {
    files: Vec<RemoteFile>,
    bodies: HashMap<String, Vec<u8>>,
}

impl StaticSource {
    /// Add a zip; `None` makes its download fail
    pub fn with_file(mut self, name: &str, body: Option<Vec<u8>>) -> Self {
        let pattern = ReportKind::DispatchIs.pattern().unwrap();
        let cursor = dispatch_core::nemweb::cursor_from_filename(&pattern, name).unwrap();
        let url = format!("memory://{}", name);
        if let Some(body) = body {
            self.bodies.insert(url.clone(), body);
        }
        self.files.push(RemoteFile {
            name: name.to_string(),
            url,
            cursor,
        });
        self
    }
}

#[async_trait]
impl DispatchSource for StaticSource {
    async fn list(&self, _report: ReportKind) -> dispatch_core::Result<Vec<RemoteFile>> {
        Ok(self.files.clone())
    }

    async fn fetch(&self, file: &RemoteFile) -> dispatch_core::Result<Vec<u8>> {
        self.bodies
            .get(&file.url)
            .cloned()
            .ok_or_else(|| PipelineError::HttpStatus {
                url: file.url.clone(),
                status: 404,
            })
    }
}

/// Database, scratch directories and a pipeline over them
pub struct Harness {
    pub db: TestDb,
    pub dir: TempDir,
    pub pipeline: Pipeline,
}

impl Harness {
    pub async fn start() -> Result<Self> {
        Self::with_source(StaticSource::default()).await
    }

    pub async fn with_source(source: StaticSource) -> Result<Self> {
        let db = TestDb::start().await?;
        let dir = tempfile::tempdir()?;

        let mut config = PipelineConfig::with_database_url(&db.url);
        config.paths.raw_dir = dir.path().join("raw");
        config.paths.clean_dir = dir.path().join("clean");
        config.paths.curated_dir = dir.path().join("curated");
        std::fs::create_dir_all(&config.paths.raw_dir)?;

        let pipeline = Pipeline::new(db.pool.clone(), config, Arc::new(source));
        Ok(Self { db, dir, pipeline })
    }

    pub fn inbox(&self) -> PathBuf {
        self.pipeline.config().paths.raw_dir.clone()
    }

    pub fn put(&self, name: &str, body: &[u8]) -> PathBuf {
        let path = self.inbox().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    pub async fn conn(&self) -> sqlx::pool::PoolConnection<sqlx::Postgres> {
        self.db.pool.acquire().await.unwrap()
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.db.pool)
            .await
            .unwrap()
    }

    pub async fn watermark(&self, name: &str) -> Option<String> {
        let mut conn = self.conn().await;
        dispatch_core::watermark::read(&mut *conn, name)
            .await
            .unwrap()
    }

    pub async fn price(&self, region: &str, settlement: &str) -> Option<f64> {
        sqlx::query_scalar(
            "SELECT rrp FROM dispatch_price WHERE region_id = $1 AND settlement_date = $2::timestamp",
        )
        .bind(region)
        .bind(settlement)
        .fetch_optional(&self.db.pool)
        .await
        .unwrap()
    }
}

/// One `DISPATCH,PRICE` data row
pub struct Price<'a> {
    pub settlement: &'a str,
    pub region: &'a str,
    pub rrp: &'a str,
}

pub fn price<'a>(settlement: &'a str, region: &'a str, rrp: &'a str) -> Price<'a> {
    Price {
        settlement,
        region,
        rrp,
    }
}

/// An MMS CSV with a comment header, an unrelated table and the price table
pub fn mms_csv(rows: &[Price<'_>]) -> Vec<u8> {
    let mut out = String::from(
        "C,NEMP.WORLD,DISPATCHIS,AEMO,PUBLIC,2026/02/05,21:05:14,0000000500000001,DISPATCHIS,0000000500000001\n\
         I,DISPATCH,CASESOLUTION,2,SETTLEMENTDATE,RUNNO,INTERVENTION,CASESUBTYPE,SOLUTIONSTATUS\n\
         D,DISPATCH,CASESOLUTION,2,\"2026/02/05 21:10:00\",1,0,,0\n\
         I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP,EEP\n",
    );
    for row in rows {
        out.push_str(&format!(
            "D,DISPATCH,PRICE,5,\"{}\",1,{},20260205254,0,{},0\n",
            row.settlement, row.region, row.rrp
        ));
    }
    out.push_str("C,\"END OF REPORT\",99\n");
    out.into_bytes()
}

/// Zip holding one CSV member
pub fn zip_of(member: &str, body: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(member, SimpleFileOptions::default()).unwrap();
    writer.write_all(body).unwrap();
    writer.finish().unwrap().into_inner()
}

/// NEMweb-style zip name for an interval
pub fn zip_name(ts: &str) -> String {
    format!("PUBLIC_DISPATCHIS_{}_0000000500000001.zip", ts)
}

pub fn cursor(ts: &str) -> ZipCursor {
    ZipCursor::parse(ts).unwrap()
}
