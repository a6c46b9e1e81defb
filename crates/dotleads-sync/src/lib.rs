//! DOT leads run orchestration: fetch, normalize, dedup, reconcile, report.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use dotleads_adapters::{fetch_all, normalize_batch, DateWindow, RecordPager, SocrataClient, DEFAULT_PAGE_SIZE};
use dotleads_core::{format_date, previous_day};
use dotleads_storage::{
    build_http_client, CsvArtifactStore, Destination, GoogleSheetsDestination, HttpClientConfig,
    ServiceAccountKey, TokenSource,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod dedup;
pub mod reconcile;
pub mod report;

pub use config::{
    ConfigError, RunMode, ScheduleSettings, SheetsSettings, SmtpSettings, SocrataSettings, SyncConfig,
};
pub use dedup::{dedup_by_natural_key, DedupOutcome};
pub use reconcile::reconcile;
pub use report::{
    Attachment, DailyReport, Notification, Notifier, NotifyError, RecordingNotifier, ReportDispatcher,
    SentNotification, SmtpNotifier, FAILURE_SUBJECT,
};

pub const CRATE_NAME: &str = "dotleads-sync";

/// File name suffix of the CSV holding only newly appended records.
pub const NEW_RECORDS_SUFFIX: &str = "new";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub fetched: usize,
    pub normalized: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub unique: usize,
    pub new_records: usize,
    pub existing_count: usize,
    pub destination_reference: Option<String>,
    pub csv_path: Option<String>,
    pub new_records_csv_path: Option<String>,
    pub report_sent: bool,
}

impl RunSummary {
    fn empty(run_id: Uuid, target_date: NaiveDate) -> Self {
        Self {
            run_id,
            target_date,
            fetched: 0,
            normalized: 0,
            skipped: 0,
            duplicates: 0,
            unique: 0,
            new_records: 0,
            existing_count: 0,
            destination_reference: None,
            csv_path: None,
            new_records_csv_path: None,
            report_sent: false,
        }
    }
}

pub struct SyncPipeline {
    source: Box<dyn RecordPager>,
    destination: Box<dyn Destination>,
    csv_store: CsvArtifactStore,
    dispatcher: ReportDispatcher,
    page_size: usize,
    today: Option<NaiveDate>,
}

impl SyncPipeline {
    pub fn new(
        source: impl RecordPager + 'static,
        destination: impl Destination + 'static,
        csv_store: CsvArtifactStore,
        dispatcher: ReportDispatcher,
    ) -> Self {
        Self {
            source: Box::new(source),
            destination: Box::new(destination),
            csv_store,
            dispatcher,
            page_size: DEFAULT_PAGE_SIZE,
            today: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Pin the run's local date instead of reading the clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    /// Socrata source, Google Sheets destination and SMTP reports from `config`.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let http = build_http_client(&HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        })?;
        let source = SocrataClient::new(
            http.clone(),
            config.socrata.base_url.clone(),
            config.socrata.dataset_id.clone(),
            config.socrata.app_token.clone(),
        );
        let key = ServiceAccountKey::from_file(&config.sheets.credentials_path)
            .context("loading service account credentials")?;
        let destination = GoogleSheetsDestination::new(
            http,
            config.sheets.spreadsheet_id.clone(),
            TokenSource::ServiceAccount(key),
        );
        let dispatcher =
            ReportDispatcher::from_settings(&config.smtp).context("configuring email notifier")?;
        let csv_store = CsvArtifactStore::new(config.output_dir.clone(), config.csv_prefix.clone());

        Ok(Self::new(source, destination, csv_store, dispatcher).with_page_size(config.socrata.page_size))
    }

    /// One full run for `target_date`, or for yesterday when `None`.
    pub async fn run_once(&self, target_date: Option<NaiveDate>) -> Result<RunSummary> {
        let today = self.today.unwrap_or_else(|| Local::now().date_naive());
        let target_date = target_date.unwrap_or_else(|| previous_day(today));
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, target_date = %format_date(target_date));

        self.execute(run_id, today, target_date).instrument(span).await
    }

    /// `run_once`, plus an error log and a best-effort failure email when it fails.
    pub async fn run_with_failure_notice(&self, target_date: Option<NaiveDate>) -> Result<RunSummary> {
        match self.run_once(target_date).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "DOT leads run failed");
                self.dispatcher.send_failure_notice(&message).await;
                Err(err)
            }
        }
    }

    async fn execute(&self, run_id: Uuid, today: NaiveDate, target_date: NaiveDate) -> Result<RunSummary> {
        let date = format_date(target_date);
        info!("starting DOT leads run");

        let mut summary = RunSummary::empty(run_id, target_date);
        let raw = fetch_all(self.source.as_ref(), &DateWindow::new(target_date), self.page_size)
            .await
            .with_context(|| format!("fetching census records for {date}"))?;
        summary.fetched = raw.len();
        if raw.is_empty() {
            info!("no records found for date; nothing to do");
            return Ok(summary);
        }

        let batch = normalize_batch(&raw, today);
        summary.normalized = batch.records.len();
        summary.skipped = batch.skipped;

        let deduped = dedup_by_natural_key(batch.records);
        summary.duplicates = deduped.duplicates;
        summary.unique = deduped.records.len();
        if deduped.records.is_empty() {
            warn!(fetched = summary.fetched, "no valid records after normalization");
            return Ok(summary);
        }

        let full_csv = self
            .csv_store
            .write_records(target_date, None, &deduped.records)
            .await
            .with_context(|| format!("writing csv for {date}"))?;

        let reconciled = reconcile(self.destination.as_ref(), target_date, &deduped.records)
            .await
            .with_context(|| format!("reconciling records for {date} with destination"))?;

        let new_csv = if reconciled.new_records.is_empty() {
            None
        } else {
            Some(
                self.csv_store
                    .write_records(target_date, Some(NEW_RECORDS_SUFFIX), &reconciled.new_records)
                    .await
                    .with_context(|| format!("writing new-records csv for {date}"))?,
            )
        };

        let report = DailyReport {
            date: target_date,
            new_count: reconciled.new_records.len(),
            total_count: deduped.records.len(),
            existing_count: reconciled.existing_count,
            destination_reference: &reconciled.destination_reference,
            attachment_path: new_csv.as_ref().map(|csv| csv.path.as_path()),
        };
        summary.report_sent = self
            .dispatcher
            .send_daily_report(&report)
            .await
            .context("sending daily report")?;

        summary.new_records = reconciled.new_records.len();
        summary.existing_count = reconciled.existing_count;
        summary.destination_reference = Some(reconciled.destination_reference);
        summary.csv_path = Some(full_csv.path.display().to_string());
        summary.new_records_csv_path = new_csv.map(|csv| csv.path.display().to_string());

        info!(
            fetched = summary.fetched,
            skipped = summary.skipped,
            duplicates = summary.duplicates,
            unique = summary.unique,
            new = summary.new_records,
            existing = summary.existing_count,
            report_sent = summary.report_sent,
            "DOT leads run complete"
        );
        Ok(summary)
    }
}

/// Something that can start a run on demand, e.g. from an HTTP request.
#[async_trait]
pub trait RunTrigger: Send + Sync {
    async fn trigger(&self, target_date: Option<NaiveDate>) -> Result<RunSummary>;
}

#[async_trait]
impl RunTrigger for SyncPipeline {
    async fn trigger(&self, target_date: Option<NaiveDate>) -> Result<RunSummary> {
        self.run_with_failure_notice(target_date).await
    }
}

/// Build the production pipeline, emailing a failure notice if that is not possible.
pub async fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline> {
    let built = SyncPipeline::from_config(config);
    if let Err(err) = &built {
        match ReportDispatcher::from_settings(&config.smtp) {
            Ok(dispatcher) => notify_setup_failure(&dispatcher, err).await,
            Err(notify_err) => {
                error!(error = %format!("{err:#}"), "pipeline setup failed");
                warn!(error = %notify_err, "cannot send failure notice");
            }
        }
    }
    built
}

async fn notify_setup_failure(dispatcher: &ReportDispatcher, err: &anyhow::Error) {
    let message = format!("{err:#}");
    error!(error = %message, "pipeline setup failed");
    dispatcher.send_failure_notice(&message).await;
}

/// Cron job running the pipeline for yesterday. `cron` is seconds-first and
/// read in the host's local time zone.
pub fn nightly_job(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<Job> {
    Job::new_async_tz(cron, Local, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            info!("scheduled run triggered");
            if let Err(err) = pipeline.run_with_failure_notice(None).await {
                error!(error = %format!("{err:#}"), "scheduled run failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))
}

pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    sched
        .add(nightly_job(pipeline, cron)?)
        .await
        .context("adding scheduler job")?;
    Ok(sched)
}

/// Schedule mode: optional immediate run, then cron-driven runs until Ctrl-C.
pub async fn run_scheduled(pipeline: Arc<SyncPipeline>, settings: &ScheduleSettings) -> Result<()> {
    if settings.run_on_startup {
        info!("running on startup");
        if let Err(err) = pipeline.run_with_failure_notice(None).await {
            error!(error = %format!("{err:#}"), "startup run failed");
        }
    }

    let mut sched = build_scheduler(Arc::clone(&pipeline), &settings.cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %settings.cron, "scheduler started; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
