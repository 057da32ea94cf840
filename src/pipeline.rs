//! Job runners: extract, normalize, stage, load.
//!
//! Every extract/load job pulls pages from its source, normalizes each page against the job's
//! schema and writes it to the staging area. Once extraction is done, staged files are loaded in
//! order and removed after their batch committed. A failed run leaves the remaining files behind
//! and the next merge run of the same day loads them again; a replace run discards them.

use crate::api::{ApiExtractor, ApiSource};
use crate::config::{
    EtlConfig, JobMetadata, MetadataProvider, ServerConfig, ServerKind, TransformationConfig,
    fetch_with_retry,
};
use crate::error::{Error, Result};
use crate::extract::{
    DOCUMENT_ID_COLUMN, DocumentExtractOptions, DocumentExtractor, DocumentStore, Page,
    RelationalExtractor, RelationalSource, SourceTable, build_projection, time_window_filter,
};
use crate::metrics::{EtlMetrics, MetricsSnapshot, Timer};
use crate::normalize::Normalizer;
use crate::postgres::PostgresClient;
use crate::schema::TableSchema;
use crate::staging::StagingArea;
use crate::sync::{LoadType, SyncEngine, Warehouse, WarehouseClient};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const SECONDS_PER_DAY: i64 = 86_400;

/// Connect timeout of relational sources.
pub const SOURCE_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(JobProgress) + Send + Sync>;

/// Job progress update.
#[derive(Debug, Clone)]
pub struct JobProgress {
    /// Job name
    pub job: String,
    /// Current phase
    pub phase: JobPhase,
    /// Steps done in the current phase (pages or staged files)
    pub done: u64,
    /// Total steps of the current phase, if known
    pub total: Option<u64>,
    /// Records handled so far in the current phase
    pub records: u64,
}

/// Job phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Connecting to source and warehouse
    Connecting,
    /// Pulling pages from the source into the staging area
    Extracting,
    /// Loading staged files into the warehouse
    Loading,
    /// Running a transformation
    Transforming,
    /// Completed
    Completed,
    /// Failed
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Connecting => write!(f, "connecting"),
            JobPhase::Extracting => write!(f, "extracting"),
            JobPhase::Loading => write!(f, "loading"),
            JobPhase::Transforming => write!(f, "transforming"),
            JobPhase::Completed => write!(f, "completed"),
            JobPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Time window of a document-store job, in epoch seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    /// Inclusive start
    pub start: Option<i64>,
    /// Exclusive end
    pub end: Option<i64>,
    /// Move the start back by the job's reload days
    pub reload: bool,
}

impl TimeWindow {
    /// Effective `[start, end)` bounds at time `now`.
    pub fn bounds(&self, reload_days: u32, now: i64) -> (Option<i64>, Option<i64>) {
        let shift = i64::from(reload_days) * SECONDS_PER_DAY;
        let start = match (self.reload, self.start) {
            (true, Some(start)) => Some(start - shift),
            (true, None) => Some(now - shift),
            (false, start) => start,
        };
        (start, self.end)
    }

    fn is_set(&self) -> bool {
        self.reload || self.start.is_some() || self.end.is_some()
    }
}

/// A job to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    /// Document-store extract/load job
    Document {
        /// Job name
        job_name: String,
        /// Optional time window
        window: TimeWindow,
    },
    /// Relational extract/load job
    Relational {
        /// Job name
        job_name: String,
    },
    /// REST API extract/load job
    Api {
        /// Job name
        job_name: String,
    },
    /// Transformation inside the warehouse
    Transform {
        /// Job name
        job_name: String,
    },
}

impl JobCommand {
    /// Name of the job.
    pub fn job_name(&self) -> &str {
        match self {
            JobCommand::Document { job_name, .. }
            | JobCommand::Relational { job_name }
            | JobCommand::Api { job_name }
            | JobCommand::Transform { job_name } => job_name,
        }
    }

    /// Kind of the job, as used in reports and staging paths.
    pub fn kind(&self) -> &'static str {
        match self {
            JobCommand::Document { .. } => "mongo",
            JobCommand::Relational { .. } => "relational",
            JobCommand::Api { .. } => "api",
            JobCommand::Transform { .. } => "transform",
        }
    }
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} job {}", self.kind(), self.job_name())
    }
}

/// Outcome of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// The job completed
    Success,
    /// The job failed
    Error,
}

/// Report of one job run.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// Unique run id
    pub run_id: Uuid,
    /// Job name
    pub job_name: String,
    /// Job kind
    pub job_kind: String,
    /// Status
    pub status: JobStatus,
    /// Error message of a failed run
    pub message: Option<String>,
    /// Error code of a failed run
    pub error_code: Option<String>,
    /// Counters of the run
    pub metrics: MetricsSnapshot,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub completed_at: DateTime<Utc>,
}

impl JobReport {
    /// Whether the run succeeded.
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// A source of pages the pipeline drains.
#[allow(async_fn_in_trait)]
pub trait PageSource {
    /// Fetch the next non-empty page.
    async fn next_page(&mut self) -> Result<Option<Page>>;
}

impl<S: DocumentStore> PageSource for DocumentExtractor<'_, S> {
    async fn next_page(&mut self) -> Result<Option<Page>> {
        self.next_batch().await
    }
}

impl<R: RelationalSource> PageSource for RelationalExtractor<'_, R> {
    async fn next_page(&mut self) -> Result<Option<Page>> {
        self.next_batch().await
    }
}

impl PageSource for ApiExtractor<'_> {
    async fn next_page(&mut self) -> Result<Option<Page>> {
        self.next_batch().await
    }
}

/// Runs jobs described by a configuration.
pub struct Pipeline {
    config: EtlConfig,
    metadata: Arc<dyn MetadataProvider + Send + Sync>,
    metrics: EtlMetrics,
    progress_callback: Option<Arc<ProgressCallback>>,
}

impl Pipeline {
    /// Create a pipeline.
    pub fn new(config: EtlConfig) -> Self {
        Self {
            metadata: Arc::new(config.clone()),
            config,
            metrics: EtlMetrics::new(),
            progress_callback: None,
        }
    }

    /// Look up jobs, servers and transformations through `provider` instead of the configuration.
    pub fn with_metadata<M>(mut self, provider: M) -> Self
    where
        M: MetadataProvider + Send + Sync + 'static,
    {
        self.metadata = Arc::new(provider);
        self
    }

    /// Set progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(JobProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(Box::new(callback)));
        self
    }

    /// The configuration.
    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    /// Counters of the runs so far.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn report_progress(&self, progress: JobProgress) {
        if let Some(callback) = &self.progress_callback {
            callback(progress);
        }
    }

    fn progress(&self, job: &str, phase: JobPhase, done: u64, total: Option<u64>, records: u64) {
        self.report_progress(JobProgress {
            job: job.to_string(),
            phase,
            done,
            total,
            records,
        });
    }

    /// Run a job and report its outcome.
    ///
    /// Never fails: errors are logged and carried in the report.
    pub async fn run(&self, command: &JobCommand) -> JobReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let timer = Timer::start(command.to_string());
        info!(%run_id, "Starting {}", command);

        let result = self.execute(command).await;
        let duration = timer.stop();
        let metrics = self.metrics.snapshot();

        let (status, message, error_code) = match &result {
            Ok(()) => {
                info!(
                    %run_id,
                    "{} finished in {} ({} rows loaded)",
                    command,
                    humantime::format_duration(std::time::Duration::from_millis(
                        duration.as_millis() as u64
                    )),
                    metrics.records_loaded
                );
                self.progress(command.job_name(), JobPhase::Completed, 1, Some(1), 0);
                (JobStatus::Success, None, None)
            }
            Err(e) => {
                error!(%run_id, code = e.code(), "{} failed: {}", command, e);
                self.progress(command.job_name(), JobPhase::Failed, 0, None, 0);
                (
                    JobStatus::Error,
                    Some(e.to_string()),
                    Some(e.code().to_string()),
                )
            }
        };

        JobReport {
            run_id,
            job_name: command.job_name().to_string(),
            job_kind: command.kind().to_string(),
            status,
            message,
            error_code,
            metrics,
            duration_ms: duration.as_millis() as u64,
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// Run a job, connecting to its source and the warehouse.
    pub async fn execute(&self, command: &JobCommand) -> Result<()> {
        match command {
            JobCommand::Document { job_name, window } => {
                self.execute_document(job_name, *window).await
            }
            JobCommand::Relational { job_name } => {
                let job = self.job_metadata(job_name).await?;
                let server = self
                    .job_server(&job, &[ServerKind::Postgres, ServerKind::Mysql])
                    .await?;
                self.progress(job_name, JobPhase::Connecting, 0, None, 0);
                if server.kind == ServerKind::Mysql {
                    return self.execute_mysql(&job, &server).await;
                }
                let source = PostgresClient::connect(
                    &server.postgres_url(&job.db_name)?,
                    SOURCE_CONNECT_TIMEOUT_SECS,
                )
                .await?;
                let warehouse = WarehouseClient::connect(&self.config.warehouse).await?;
                self.run_relational_job(&job, &server, &source, &warehouse)
                    .await
            }
            JobCommand::Api { job_name } => {
                let job = self.job_metadata(job_name).await?;
                let server = self.job_server(&job, &[ServerKind::Api]).await?;
                let base_url = server.base_url.clone().ok_or_else(|| {
                    Error::config(format!("API server {} has no base_url", server.name))
                })?;
                self.progress(job_name, JobPhase::Connecting, 0, None, 0);
                let source = ApiSource::new(base_url, server.api_key.clone())?;
                let warehouse = WarehouseClient::connect(&self.config.warehouse).await?;
                self.run_api_job(&job, &server, &source, &warehouse).await
            }
            JobCommand::Transform { job_name } => {
                let transformation = fetch_with_retry(
                    &self.config.retry,
                    &self.metrics,
                    "transformation",
                    || self.metadata.transformation(job_name),
                )
                .await?;
                self.progress(job_name, JobPhase::Connecting, 0, None, 0);
                let warehouse = WarehouseClient::connect(&self.config.warehouse).await?;
                self.run_transformation(&transformation, &warehouse).await
            }
        }
    }

    #[cfg(feature = "mongodb")]
    async fn execute_document(&self, job_name: &str, window: TimeWindow) -> Result<()> {
        let job = self.job_metadata(job_name).await?;
        let server = self.job_server(&job, &[ServerKind::Mongo]).await?;
        self.progress(job_name, JobPhase::Connecting, 0, None, 0);
        let store = crate::mongo::MongoStore::connect(
            &server.mongo_uri()?,
            &job.db_name,
            self.config.extract.server_selection_timeout(),
        )
        .await?;
        let warehouse = WarehouseClient::connect(&self.config.warehouse).await?;
        let result = self
            .run_document_job(&job, &server, &store, &warehouse, window)
            .await;
        store.close().await;
        result
    }

    #[cfg(not(feature = "mongodb"))]
    async fn execute_document(&self, job_name: &str, _window: TimeWindow) -> Result<()> {
        Err(Error::config(format!(
            "Job {} needs a document store; rebuild with the `mongodb` feature",
            job_name
        )))
    }

    #[cfg(feature = "mysql")]
    async fn execute_mysql(&self, job: &JobMetadata, server: &ServerConfig) -> Result<()> {
        let source = crate::mysql::MySqlClient::connect(
            &server.mysql_url(&job.db_name)?,
            SOURCE_CONNECT_TIMEOUT_SECS,
        )
        .await?;
        let warehouse = WarehouseClient::connect(&self.config.warehouse).await?;
        let result = self
            .run_relational_job(job, server, &source, &warehouse)
            .await;
        source.close().await;
        result
    }

    #[cfg(not(feature = "mysql"))]
    async fn execute_mysql(&self, job: &JobMetadata, _server: &ServerConfig) -> Result<()> {
        Err(Error::config(format!(
            "Job {} reads from MySQL; rebuild with the `mysql` feature",
            job.job_name
        )))
    }

    async fn job_metadata(&self, job_name: &str) -> Result<JobMetadata> {
        fetch_with_retry(&self.config.retry, &self.metrics, "job metadata", || {
            self.metadata.job_metadata(job_name)
        })
        .await
    }

    async fn job_server(&self, job: &JobMetadata, kinds: &[ServerKind]) -> Result<ServerConfig> {
        let server = fetch_with_retry(&self.config.retry, &self.metrics, "server", || {
            self.metadata.server(&job.server_name)
        })
        .await?;
        if !kinds.contains(&server.kind) {
            let expected: Vec<String> = kinds.iter().map(ToString::to_string).collect();
            return Err(Error::config(format!(
                "Job {} runs on server {} of kind {}, expected {}",
                job.job_name,
                server.name,
                server.kind,
                expected.join(" or ")
            )));
        }
        Ok(server)
    }

    /// Extract a document-store collection and load it.
    #[instrument(skip_all, fields(job = %job.job_name))]
    pub async fn run_document_job<S: DocumentStore, W: Warehouse>(
        &self,
        job: &JobMetadata,
        server: &ServerConfig,
        store: &S,
        warehouse: &W,
        window: TimeWindow,
    ) -> Result<()> {
        let schema = declared_schema(job)?;
        let load_type = job.load_type()?;
        let normalizer = Normalizer::new(&schema);

        let mut options = DocumentExtractOptions::new(&job.table_name);
        options.max_column = job.max_column.clone();
        options.projection = build_projection(&schema.column_names(), &job.ignore_fields());
        options.byte_budget = self.config.extract.page_byte_budget;
        if window.is_set() {
            match job.max_column.as_deref() {
                Some(column) if column != DOCUMENT_ID_COLUMN => {
                    let (start, end) = window.bounds(job.reload_days, Utc::now().timestamp());
                    info!("Time window on {}: {:?} .. {:?}", column, start, end);
                    options.filter = time_window_filter(column, start, end);
                }
                _ => warn!(
                    "Job {} has no time column; ignoring the time window",
                    job.job_name
                ),
            }
        }

        let mut staging = self.staging(job, load_type, "mongo", server, &job.db_name)?;
        let mut extractor = DocumentExtractor::prepare(store, options).await?;
        self.stage_pages(&job.job_name, &mut extractor, &normalizer, &mut staging)
            .await?;
        self.load_staged(job, warehouse, load_type, &schema, &normalizer, &staging)
            .await
    }

    /// Extract a relational table and load it.
    #[instrument(skip_all, fields(job = %job.job_name))]
    pub async fn run_relational_job<R: RelationalSource, W: Warehouse>(
        &self,
        job: &JobMetadata,
        server: &ServerConfig,
        source: &R,
        warehouse: &W,
    ) -> Result<()> {
        let load_type = job.load_type()?;
        let table = SourceTable::new(server.source_namespace(&job.db_name), &job.table_name);
        let schema = match job.table_schema()? {
            Some(schema) => schema,
            None => {
                let columns = source.source_columns(&table).await?;
                if columns.is_empty() {
                    return Err(Error::schema(format!(
                        "Source table {} has no columns or doesn't exist",
                        table
                    )));
                }
                info!("Using schema introspected from {}", table);
                TableSchema::from_introspection(&columns, &job.key_columns())
            }
        };
        let schema = without_ignored(schema, job);
        let normalizer = Normalizer::new(&schema);

        let mut staging = self.staging(job, load_type, "relational", server, &job.db_name)?;
        let mut extractor = RelationalExtractor::prepare(
            source,
            &table,
            job.max_column.as_deref(),
            self.config.extract.relational_batch_size,
        )
        .await?;
        self.stage_pages(&job.job_name, &mut extractor, &normalizer, &mut staging)
            .await?;
        self.load_staged(job, warehouse, load_type, &schema, &normalizer, &staging)
            .await
    }

    /// Extract every page of an API service and load it.
    #[instrument(skip_all, fields(job = %job.job_name))]
    pub async fn run_api_job<W: Warehouse>(
        &self,
        job: &JobMetadata,
        server: &ServerConfig,
        source: &ApiSource,
        warehouse: &W,
    ) -> Result<()> {
        let service = job
            .service_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::config(format!("API job {} needs a service_name", job.job_name))
            })?;
        let schema = without_ignored(declared_schema(job)?, job);
        let load_type = job.load_type()?;
        let normalizer = Normalizer::new(&schema);

        let mut staging = self.staging(job, load_type, "api", server, service)?;
        let mut extractor = ApiExtractor::prepare(source, service).await?;
        self.stage_pages(&job.job_name, &mut extractor, &normalizer, &mut staging)
            .await?;
        self.load_staged(job, warehouse, load_type, &schema, &normalizer, &staging)
            .await
    }

    /// Run a transformation inside the warehouse.
    pub async fn run_transformation<W: Warehouse>(
        &self,
        transformation: &TransformationConfig,
        warehouse: &W,
    ) -> Result<()> {
        self.progress(
            &transformation.job_name,
            JobPhase::Transforming,
            0,
            Some(1),
            0,
        );
        let affected = crate::transform::run_transformation(warehouse, transformation).await?;
        self.metrics.record_load(affected);
        Ok(())
    }

    /// Staging area of a run; a replace run starts from an empty directory.
    fn staging(
        &self,
        job: &JobMetadata,
        load_type: LoadType,
        source: &str,
        server: &ServerConfig,
        db: &str,
    ) -> Result<StagingArea> {
        let staging = StagingArea::prepare(
            &self.config.staging.root,
            source,
            &server.name,
            db,
            &job.job_name,
        )?;
        if load_type == LoadType::Replace {
            staging.discard_leftovers()?;
        }
        Ok(staging)
    }

    async fn stage_pages<P: PageSource>(
        &self,
        job_name: &str,
        source: &mut P,
        normalizer: &Normalizer,
        staging: &mut StagingArea,
    ) -> Result<()> {
        let mut records = 0u64;
        while let Some(page) = source.next_page().await? {
            self.metrics.record_page(page.records.len() as u64);
            let batch = normalizer.normalize_data(&page.records)?;
            if batch.field_errors > 0 {
                warn!(
                    "Page {}/{}: {} field values set to null",
                    page.index + 1,
                    page.total,
                    batch.field_errors
                );
            }
            self.metrics
                .record_normalized(batch.len() as u64, batch.field_errors as u64);
            staging.write_batch(&batch.records)?;

            records += batch.len() as u64;
            self.progress(
                job_name,
                JobPhase::Extracting,
                page.index + 1,
                Some(page.total),
                records,
            );
        }
        Ok(())
    }

    async fn load_staged<W: Warehouse>(
        &self,
        job: &JobMetadata,
        warehouse: &W,
        load_type: LoadType,
        schema: &TableSchema,
        normalizer: &Normalizer,
        staging: &StagingArea,
    ) -> Result<()> {
        info!("Load data to warehouse");
        let engine = SyncEngine::new(warehouse);
        let table = job.destination_table.as_str();
        // A replace loads this run's snapshot only
        let files = match load_type {
            LoadType::Replace => staging.run_files()?,
            LoadType::Merge => staging.files()?,
        };

        if files.is_empty() {
            info!("No data extracted for {}", table);
            if load_type == LoadType::Replace {
                engine.ensure_table(table, schema).await?;
                engine.truncate(table).await?;
            }
            return Ok(());
        }

        let columns = normalizer.columns();
        let total = files.len() as u64;
        let mut records = 0u64;
        for (i, file) in files.iter().enumerate() {
            let batch = StagingArea::read_batch(file, &columns)?;
            // A replace truncates once, with the first file
            let rows = match load_type {
                LoadType::Replace if i > 0 => engine.insert(table, schema, &batch).await?,
                _ => engine.sync_data(load_type, table, schema, &batch).await?,
            };
            self.metrics.record_load(rows);
            StagingArea::remove(file)?;

            records += batch.len() as u64;
            self.progress(
                &job.job_name,
                JobPhase::Loading,
                i as u64 + 1,
                Some(total),
                records,
            );
        }
        Ok(())
    }
}

fn declared_schema(job: &JobMetadata) -> Result<TableSchema> {
    job.table_schema()?
        .ok_or_else(|| Error::schema(format!("Job {} has no declared schema", job.job_name)))
}

fn without_ignored(schema: TableSchema, job: &JobMetadata) -> TableSchema {
    let ignored = job.ignore_fields();
    if ignored.is_empty() {
        return schema;
    }
    info!("Ignoring columns {:?}", ignored);
    schema.without_fields(&ignored)
}
