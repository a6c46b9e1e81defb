//! Daily report and failure notices.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dotleads_core::format_date;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::SmtpSettings;

pub const FAILURE_SUBJECT: &str = "ERROR: FMCSA DOT Leads Automation Failed";
const CSV_CONTENT_TYPE: &str = "text/csv";
const FOOTER: &str = "---\nThis is an automated message from the FMCSA DOT Leads Automation system.\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mailbox '{address}': {reason}")]
    Address { address: String, reason: String },
    #[error("building message: {0}")]
    Build(String),
    #[error("smtp transport: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipients: &[String], notification: &Notification) -> Result<(), NotifyError>;
}

#[async_trait]
impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    async fn send(&self, recipients: &[String], notification: &Notification) -> Result<(), NotifyError> {
        (**self).send(recipients, notification).await
    }
}

/// STARTTLS relay with username/password login.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(settings: &SmtpSettings) -> Result<Self, NotifyError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.server)
            .map_err(|err| NotifyError::Transport(err.to_string()))?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();
        Ok(Self {
            transport,
            from: parse_mailbox(&settings.from)?,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, recipients: &[String], notification: &Notification) -> Result<(), NotifyError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(notification.subject.clone());
        for recipient in recipients {
            builder = builder.to(parse_mailbox(recipient)?);
        }

        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(notification.body.clone()));
        if let Some(attachment) = &notification.attachment {
            let content_type = ContentType::parse(&attachment.content_type)
                .map_err(|err| NotifyError::Build(format!("content type: {err}")))?;
            parts = parts.singlepart(
                MailAttachment::new(attachment.file_name.clone())
                    .body(attachment.bytes.clone(), content_type),
            );
        }

        let message = builder
            .multipart(parts)
            .map_err(|err| NotifyError::Build(err.to_string()))?;
        self.transport
            .send(message)
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|err: lettre::address::AddressError| NotifyError::Address {
        address: address.to_string(),
        reason: err.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub recipients: Vec<String>,
    pub notification: Notification,
}

/// Keeps every notification in memory instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    failure: Option<String>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every send fails with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failure: Some(reason.into()),
        }
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipients: &[String], notification: &Notification) -> Result<(), NotifyError> {
        if let Some(reason) = &self.failure {
            return Err(NotifyError::Transport(reason.clone()));
        }
        self.sent.lock().await.push(SentNotification {
            recipients: recipients.to_vec(),
            notification: notification.clone(),
        });
        Ok(())
    }
}

/// Counts and links for one day's report.
#[derive(Debug, Clone)]
pub struct DailyReport<'a> {
    pub date: NaiveDate,
    pub new_count: usize,
    pub total_count: usize,
    pub existing_count: usize,
    pub destination_reference: &'a str,
    /// CSV holding only the new records.
    pub attachment_path: Option<&'a Path>,
}

impl DailyReport<'_> {
    pub fn subject(&self) -> String {
        let date = format_date(self.date);
        if self.new_count > 0 {
            format!("Daily DOT Leads Report - {date} ({} NEW records)", self.new_count)
        } else {
            format!("Daily DOT Leads Report - {date} (No new records)")
        }
    }

    pub fn body(&self) -> String {
        let date = format_date(self.date);
        let mut body = format!(
            "Daily FMCSA DOT Leads Report\n\n\
             Date: {date}\n\n\
             Summary:\n\
             - Total records found for {date}: {}\n\
             - Existing records in sheet: {}\n\
             - NEW records added: {}\n\n",
            self.total_count, self.existing_count, self.new_count
        );

        if self.new_count > 0 {
            body.push_str(&format!(
                "{} new DOT number(s) have been added to the Google Sheet.\n\n\
                 Google Sheet Link:\n{}\n\n\
                 The CSV attachment contains only the NEW records that were added today.\n\n",
                self.new_count, self.destination_reference
            ));
        } else {
            body.push_str(&format!(
                "No new records found. All {} records for {date} already exist in the sheet.\n\n\
                 Google Sheet Link:\n{}\n\n",
                self.total_count, self.destination_reference
            ));
        }

        body.push_str(FOOTER);
        body
    }
}

pub fn failure_body(error_message: &str) -> String {
    format!(
        "The FMCSA DOT Leads Automation job has failed.\n\n\
         Error Details:\n{error_message}\n\n\
         Please check the logs and system status.\n\n{FOOTER}"
    )
}

pub struct ReportDispatcher {
    notifier: Option<Box<dyn Notifier>>,
    recipients: Vec<String>,
}

impl ReportDispatcher {
    pub fn new(notifier: Box<dyn Notifier>, recipients: Vec<String>) -> Self {
        Self {
            notifier: Some(notifier),
            recipients,
        }
    }

    /// Dispatcher that never sends anything.
    pub fn disabled() -> Self {
        Self {
            notifier: None,
            recipients: Vec::new(),
        }
    }

    /// SMTP-backed dispatcher, or a disabled one when no recipients are configured.
    pub fn from_settings(settings: &SmtpSettings) -> Result<Self, NotifyError> {
        if settings.recipients.is_empty() {
            return Ok(Self::disabled());
        }
        Ok(Self::new(
            Box::new(SmtpNotifier::new(settings)?),
            settings.recipients.clone(),
        ))
    }

    fn active_notifier(&self) -> Option<&dyn Notifier> {
        if self.recipients.is_empty() {
            return None;
        }
        self.notifier.as_deref()
    }

    /// Send the day's summary. `Ok(false)` when there is nobody to send to.
    ///
    /// The attachment is included only when there are new records.
    pub async fn send_daily_report(&self, report: &DailyReport<'_>) -> Result<bool, NotifyError> {
        let Some(notifier) = self.active_notifier() else {
            warn!("no email recipients configured; skipping daily report");
            return Ok(false);
        };

        let attachment = match report.attachment_path {
            Some(path) if report.new_count > 0 => read_attachment(path).await,
            _ => None,
        };
        let notification = Notification {
            subject: report.subject(),
            body: report.body(),
            attachment,
        };

        notifier.send(&self.recipients, &notification).await?;
        info!(
            recipients = %self.recipients.join(", "),
            attached = notification.attachment.is_some(),
            "daily report sent"
        );
        Ok(true)
    }

    /// Best effort: send failures are logged and reported as `false`.
    pub async fn send_failure_notice(&self, error_message: &str) -> bool {
        let Some(notifier) = self.active_notifier() else {
            warn!("no email recipients configured for error notifications");
            return false;
        };

        let notification = Notification {
            subject: FAILURE_SUBJECT.to_string(),
            body: failure_body(error_message),
            attachment: None,
        };
        match notifier.send(&self.recipients, &notification).await {
            Ok(()) => {
                info!(recipients = %self.recipients.join(", "), "failure notice sent");
                true
            }
            Err(err) => {
                error!(error = %err, "failed to send failure notice");
                false
            }
        }
    }
}

async fn read_attachment(path: &Path) -> Option<Attachment> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(Attachment {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dot_leads.csv".to_string()),
            content_type: CSV_CONTENT_TYPE.to_string(),
            bytes,
        }),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not attach csv file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn report<'a>(new_count: usize, attachment_path: Option<&'a Path>) -> DailyReport<'a> {
        DailyReport {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            new_count,
            total_count: 5,
            existing_count: 5 - new_count,
            destination_reference: "https://docs.google.com/spreadsheets/d/abc/edit#gid=1",
            attachment_path,
        }
    }

    fn dispatcher(notifier: Arc<RecordingNotifier>) -> ReportDispatcher {
        ReportDispatcher::new(Box::new(notifier), vec!["ops@example.com".into()])
    }

    fn csv_file(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("dot_leads_2024-03-01_new.csv");
        std::fs::write(&path, "DOT Number\n1\n").unwrap();
        path
    }

    #[test]
    fn subject_reflects_new_records() {
        assert_eq!(
            report(3, None).subject(),
            "Daily DOT Leads Report - 2024-03-01 (3 NEW records)"
        );
        assert_eq!(
            report(0, None).subject(),
            "Daily DOT Leads Report - 2024-03-01 (No new records)"
        );
    }

    #[test]
    fn body_lists_counts_and_link() {
        let body = report(2, None).body();
        assert!(body.contains("- Total records found for 2024-03-01: 5"));
        assert!(body.contains("- Existing records in sheet: 3"));
        assert!(body.contains("- NEW records added: 2"));
        assert!(body.contains("https://docs.google.com/spreadsheets/d/abc/edit#gid=1"));

        let body = report(0, None).body();
        assert!(body.contains("All 5 records for 2024-03-01 already exist"));
    }

    #[tokio::test]
    async fn attaches_csv_when_there_are_new_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = csv_file(&dir);
        let notifier = Arc::new(RecordingNotifier::new());

        let sent = dispatcher(notifier.clone())
            .send_daily_report(&report(1, Some(&path)))
            .await
            .unwrap();

        assert!(sent);
        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipients, vec!["ops@example.com"]);
        let attachment = sent[0].notification.attachment.as_ref().unwrap();
        assert_eq!(attachment.file_name, "dot_leads_2024-03-01_new.csv");
        assert_eq!(attachment.content_type, "text/csv");
        assert_eq!(attachment.bytes, b"DOT Number\n1\n");
    }

    #[tokio::test]
    async fn no_attachment_without_new_records_even_with_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = csv_file(&dir);
        let notifier = Arc::new(RecordingNotifier::new());

        dispatcher(notifier.clone())
            .send_daily_report(&report(0, Some(&path)))
            .await
            .unwrap();

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].notification.attachment.is_none());
    }

    #[tokio::test]
    async fn unreadable_attachment_is_skipped() {
        let notifier = Arc::new(RecordingNotifier::new());
        let missing = Path::new("/nonexistent/dot_leads_new.csv");

        let sent = dispatcher(notifier.clone())
            .send_daily_report(&report(2, Some(missing)))
            .await
            .unwrap();

        assert!(sent);
        assert!(notifier.sent().await[0].notification.attachment.is_none());
    }

    #[tokio::test]
    async fn no_recipients_is_a_quiet_no_op() {
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher = ReportDispatcher::new(Box::new(notifier.clone()), Vec::new());

        assert!(!dispatcher.send_daily_report(&report(1, None)).await.unwrap());
        assert!(!dispatcher.send_failure_notice("boom").await);
        assert!(notifier.sent().await.is_empty());

        assert!(!ReportDispatcher::disabled()
            .send_daily_report(&report(1, None))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn report_send_errors_propagate_but_failure_notice_swallows_them() {
        let dispatcher = dispatcher(Arc::new(RecordingNotifier::failing("connection refused")));

        let err = dispatcher.send_daily_report(&report(1, None)).await.unwrap_err();
        assert!(matches!(err, NotifyError::Transport(ref reason) if reason == "connection refused"));
        assert!(!dispatcher.send_failure_notice("fetch failed").await);
    }

    #[tokio::test]
    async fn failure_notice_carries_the_error() {
        let notifier = Arc::new(RecordingNotifier::new());
        assert!(dispatcher(notifier.clone()).send_failure_notice("socrata returned 503").await);

        let sent = notifier.sent().await;
        assert_eq!(sent[0].notification.subject, FAILURE_SUBJECT);
        assert!(sent[0].notification.body.contains("socrata returned 503"));
    }

    #[test]
    fn smtp_notifier_rejects_bad_sender() {
        let settings = SmtpSettings {
            server: "smtp.example.com".into(),
            port: 587,
            username: "bot".into(),
            password: "secret".into(),
            from: "not an address".into(),
            recipients: vec!["ops@example.com".into()],
        };
        assert!(matches!(
            SmtpNotifier::new(&settings),
            Err(NotifyError::Address { .. })
        ));
    }
}
