//! Consolidated run report and its delivery transports.

use crate::config::EmailConfig;
use crate::dates::{days_before, display_date, format_timestamp, long_date, run_id};
use crate::error::NotificationError;
use crate::fsutil::write_atomic;
use crate::schema::{ArchiveRecord, DocumentType};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{info, warn};

const TITLE: &str = "La Cañada Flintridge Government Update";
const SOURCE_URL: &str = "https://lcf.ca.gov/city-clerk/agenda-minutes/";
const RULE: &str = "============================================================";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Report {
    pub report_id: String,
    pub subject: String,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub generated_at: String,
    pub document_count: usize,
    pub body_count: usize,
    pub html: String,
    pub text: String,
}

impl Report {
    pub fn is_empty(&self) -> bool {
        self.document_count == 0
    }
}

struct BodyGroup<'a> {
    agendas: Vec<&'a ArchiveRecord>,
    minutes: Vec<&'a ArchiveRecord>,
}

fn group_by_body(records: &[ArchiveRecord]) -> BTreeMap<&str, BodyGroup<'_>> {
    let mut groups: BTreeMap<&str, BodyGroup<'_>> = BTreeMap::new();
    for record in records {
        let group = groups.entry(record.body.as_str()).or_insert_with(|| BodyGroup {
            agendas: Vec::new(),
            minutes: Vec::new(),
        });
        match record.doc_type {
            DocumentType::Agenda => group.agendas.push(record),
            DocumentType::Minutes => group.minutes.push(record),
        }
    }
    for group in groups.values_mut() {
        group.agendas.sort_by(|a, b| b.date.cmp(&a.date));
        group.minutes.sort_by(|a, b| b.date.cmp(&a.date));
    }
    groups
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn generated_label(now: OffsetDateTime) -> String {
    now.format(format_description!(
        "[month repr:long] [day padding:none], [year] at [hour repr:12 padding:none]:[minute] [period]"
    ))
    .unwrap_or_else(|_| format_timestamp(now))
}

fn period_label(now: OffsetDateTime, period_days: u32) -> String {
    let end = now.date();
    let start = days_before(end, period_days);
    format!("{} {} - {}", start.month(), start.day(), long_date(end))
}

/// Builds the report for a run's new records. With no records the result is
/// the "no new activity" variant.
pub fn compose_report(records: &[ArchiveRecord], now: OffsetDateTime, period_days: u32) -> Report {
    let groups = group_by_body(records);
    let document_count = records.len();
    let body_count = groups.len();
    let generated = generated_label(now);

    let (html, text) = if records.is_empty() {
        (empty_html(&generated), empty_text(now, &generated))
    } else {
        let period = period_label(now, period_days);
        (
            activity_html(&groups, document_count, body_count, &period, &generated),
            activity_text(&groups, document_count, body_count, &period, &generated),
        )
    };

    Report {
        report_id: run_id(now),
        subject: format!("{TITLE} - {}", long_date(now.date())),
        from: None,
        to: Vec::new(),
        generated_at: format_timestamp(now),
        document_count,
        body_count,
        html,
        text,
    }
}

const STYLE: &str = "body{font-family:Arial,sans-serif;line-height:1.6;color:#333;max-width:800px;margin:0 auto;padding:20px}\
.header{background-color:#2c5aa0;color:white;padding:20px;text-align:center;border-radius:8px 8px 0 0}\
.content{background-color:#f9f9f9;padding:20px;border-radius:0 0 8px 8px}\
.body-section{background-color:white;margin:20px 0;padding:20px;border-radius:8px}\
.body-title{color:#2c5aa0;font-size:20px;font-weight:bold;border-bottom:2px solid #2c5aa0}\
.document-item{margin:15px 0;padding:15px;background-color:#f8f9fa;border-left:4px solid #2c5aa0}\
.document-title{font-weight:bold;color:#2c5aa0}\
.document-date{font-size:12px;color:#666}\
.summary-stats{background-color:#e3f2fd;padding:15px;border-radius:8px}\
.footer{margin-top:30px;padding:20px;background-color:#e9ecef;font-size:12px;color:#666;text-align:center}";

fn html_footer(generated: &str) -> String {
    format!(
        "<div class=\"footer\">\n\
<p>This report was automatically generated by the La Cañada Flintridge Government Tracker.</p>\n\
<p>For complete meeting documents, visit <a href=\"{SOURCE_URL}\">lcf.ca.gov</a></p>\n\
<p>Report generated on {generated}</p>\n\
</div>\n"
    )
}

fn activity_html(
    groups: &BTreeMap<&str, BodyGroup<'_>>,
    document_count: usize,
    body_count: usize,
    period: &str,
    generated: &str,
) -> String {
    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n<style>{STYLE}</style>\n</head>\n<body>\n\
<div class=\"header\">\n<h1>{TITLE}</h1>\n<p>Weekly Summary of City Council and Commission Activities</p>\n<p>{period}</p>\n</div>\n\
<div class=\"content\">\n<div class=\"summary-stats\">\n<h3>This Week's Activity</h3>\n\
<p><strong>{document_count}</strong> documents from <strong>{body_count}</strong> government bodies</p>\n</div>\n"
    );

    for (body, group) in groups {
        let _ = write!(
            html,
            "<div class=\"body-section\">\n<div class=\"body-title\">{}</div>\n",
            escape_html(body)
        );
        let items = group
            .agendas
            .iter()
            .map(|r| ("📋", *r))
            .chain(group.minutes.iter().map(|r| ("📝", *r)));
        for (icon, record) in items {
            let _ = write!(
                html,
                "<div class=\"document-item\">\n\
<div class=\"document-title\">{icon} <a href=\"{}\">{}</a></div>\n\
<div class=\"document-date\">{}</div>\n\
<div class=\"document-summary\">{}</div>\n</div>\n",
                escape_html(&record.url),
                escape_html(&record.title),
                escape_html(&display_date(&record.date)),
                escape_html(&record.summary.text),
            );
        }
        html.push_str("</div>\n");
    }

    html.push_str(&html_footer(generated));
    html.push_str("</div>\n</body>\n</html>\n");
    html
}

fn activity_text(
    groups: &BTreeMap<&str, BodyGroup<'_>>,
    document_count: usize,
    body_count: usize,
    period: &str,
    generated: &str,
) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "{}", TITLE.to_uppercase());
    let _ = writeln!(text, "Weekly Summary of City Council and Commission Activities");
    let _ = writeln!(text, "{period}");
    let _ = writeln!(text, "{RULE}\n");
    let _ = writeln!(
        text,
        "THIS WEEK'S ACTIVITY: {document_count} documents from {body_count} government bodies\n"
    );

    for (body, group) in groups {
        let _ = writeln!(text, "{}", body.to_uppercase());
        let _ = writeln!(text, "{}\n", "-".repeat(body.chars().count()));
        let items = group
            .agendas
            .iter()
            .map(|r| ("AGENDA", *r))
            .chain(group.minutes.iter().map(|r| ("MINUTES", *r)));
        for (label, record) in items {
            let _ = writeln!(text, "{label}: {}", record.title);
            let _ = writeln!(text, "Date: {}", display_date(&record.date));
            let _ = writeln!(text, "Link: {}", record.url);
            let _ = writeln!(text, "Summary: {}\n", record.summary.text);
        }
    }

    text.push_str(&text_footer(generated));
    text
}

fn text_footer(generated: &str) -> String {
    format!(
        "{RULE}\n\
This report was automatically generated by the La Cañada Flintridge Government Tracker.\n\
For complete meeting documents, visit: {SOURCE_URL}\n\
Report generated on {generated}\n"
    )
}

const NO_ACTIVITY_REASONS: [&str; 3] = [
    "No scheduled meetings this week",
    "Documents not yet published online",
    "Technical issues accessing the city website",
];

fn empty_html(generated: &str) -> String {
    let reasons: String = NO_ACTIVITY_REASONS
        .iter()
        .map(|reason| format!("<li>{reason}</li>\n"))
        .collect();
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n<style>{STYLE}</style>\n</head>\n<body>\n\
<div class=\"header\">\n<h1>{TITLE}</h1>\n<p>Weekly Summary Report</p>\n</div>\n\
<div class=\"content\">\n<h2>No New Activity This Week</h2>\n\
<p>There were no new meeting documents available for the reporting period.</p>\n\
<p>This could be due to:</p>\n<ul>\n{reasons}</ul>\n\
<p>The system will continue monitoring for new documents.</p>\n</div>\n{}</body>\n</html>\n",
        html_footer(generated)
    )
}

fn empty_text(now: OffsetDateTime, generated: &str) -> String {
    let reasons: String = NO_ACTIVITY_REASONS
        .iter()
        .map(|reason| format!("- {reason}\n"))
        .collect();
    format!(
        "{}\nWeekly Summary Report\n{}\n{RULE}\n\n\
NO NEW ACTIVITY THIS WEEK\n\n\
There were no new meeting documents available for the reporting period.\n\n\
This could be due to:\n{reasons}\n\
The system will continue monitoring for new documents.\n\n{}",
        TITLE.to_uppercase(),
        long_date(now.date()),
        text_footer(generated)
    )
}

/// A delivery channel for a finished report.
pub trait Transport {
    fn name(&self) -> &str;

    fn deliver(&self, report: &Report) -> Result<(), NotificationError>;
}

/// Writes `report_<id>.html`, `.txt` and `.json` into a directory.
pub struct OutboxTransport {
    dir: PathBuf,
}

impl OutboxTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn paths_for(&self, report: &Report) -> [PathBuf; 3] {
        let stem = format!("report_{}", report.report_id);
        [
            self.dir.join(format!("{stem}.html")),
            self.dir.join(format!("{stem}.txt")),
            self.dir.join(format!("{stem}.json")),
        ]
    }
}

impl Transport for OutboxTransport {
    fn name(&self) -> &str {
        "outbox"
    }

    fn deliver(&self, report: &Report) -> Result<(), NotificationError> {
        let [html_path, text_path, json_path] = self.paths_for(report);
        let json = serde_json::to_vec_pretty(report)?;
        for (path, data) in [
            (html_path, report.html.as_bytes()),
            (text_path, report.text.as_bytes()),
            (json_path, json.as_slice()),
        ] {
            write_atomic(&path, data).map_err(|source| NotificationError::Io { path, source })?;
        }
        Ok(())
    }
}

/// POSTs the report as JSON to an HTTP endpoint.
pub struct WebhookTransport {
    client: reqwest::blocking::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: &str) -> Result<Self, NotificationError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NotificationError::Http(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl Transport for WebhookTransport {
    fn name(&self) -> &str {
        "webhook"
    }

    fn deliver(&self, report: &Report) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .map_err(|e| NotificationError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotificationError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum NotifyOutcome {
    Skipped {
        reason: &'static str,
    },
    Sent {
        delivered: Vec<String>,
        failed: Vec<(String, NotificationError)>,
    },
}

impl NotifyOutcome {
    /// True when at least one transport accepted the report.
    pub fn was_sent(&self) -> bool {
        matches!(self, NotifyOutcome::Sent { delivered, .. } if !delivered.is_empty())
    }
}

pub struct Notifier {
    transports: Vec<Box<dyn Transport>>,
    send_empty_report: bool,
    from: Option<String>,
    to: Vec<String>,
}

impl Notifier {
    pub fn new(transports: Vec<Box<dyn Transport>>, send_empty_report: bool) -> Self {
        Self {
            transports,
            send_empty_report,
            from: None,
            to: Vec::new(),
        }
    }

    pub fn with_recipients(mut self, from: Option<String>, to: Vec<String>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    /// Outbox and webhook transports as configured. Disabled email means no
    /// transports at all.
    pub fn from_config(email: &EmailConfig, reports_dir: &Path) -> Result<Self, NotificationError> {
        let mut transports: Vec<Box<dyn Transport>> = Vec::new();
        if email.enabled {
            if email.outbox {
                transports.push(Box::new(OutboxTransport::new(reports_dir)));
            }
            if let Some(url) = email.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
                transports.push(Box::new(WebhookTransport::new(url)?));
            }
        }
        Ok(Self::new(transports, email.send_empty_report)
            .with_recipients(email.from.clone(), email.to.clone()))
    }

    pub fn notify(&self, records: &[ArchiveRecord], now: OffsetDateTime, period_days: u32) -> NotifyOutcome {
        if self.transports.is_empty() {
            info!("no notification transports configured");
            return NotifyOutcome::Skipped {
                reason: "no transports configured",
            };
        }
        if records.is_empty() && !self.send_empty_report {
            info!("no new documents, report not sent");
            return NotifyOutcome::Skipped {
                reason: "no new documents",
            };
        }

        let mut report = compose_report(records, now, period_days);
        report.from = self.from.clone();
        report.to = self.to.clone();

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for transport in &self.transports {
            match transport.deliver(&report) {
                Ok(()) => {
                    info!(transport = transport.name(), documents = report.document_count, "report delivered");
                    delivered.push(transport.name().to_string());
                }
                Err(err) => {
                    warn!(transport = transport.name(), error = %err, "report delivery failed");
                    failed.push((transport.name().to_string(), err));
                }
            }
        }
        NotifyOutcome::Sent { delivered, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{GenerationMethod, Summary};
    use time::macros::datetime;

    fn record(id: &str, body: &str, doc_type: DocumentType, date: &str, summary: &str) -> ArchiveRecord {
        ArchiveRecord {
            id: id.to_string(),
            body: body.to_string(),
            title: format!("{body} {doc_type}"),
            date: date.to_string(),
            url: format!("https://lcf.ca.gov/{id}.pdf"),
            doc_type,
            summary: Summary {
                document_id: id.to_string(),
                text: summary.to_string(),
                method: GenerationMethod::Ai,
                model: None,
                usage: None,
            },
            archived_at: "2025-07-21T16:00:00Z".to_string(),
            run_id: "20250721T160000Z".to_string(),
        }
    }

    struct FailingTransport;

    impl Transport for FailingTransport {
        fn name(&self) -> &str {
            "failing"
        }

        fn deliver(&self, _report: &Report) -> Result<(), NotificationError> {
            Err(NotificationError::Rejected { status: 502 })
        }
    }

    #[test]
    fn report_groups_by_body_with_headline() {
        let records = vec![
            record("m1", "City Council", DocumentType::Minutes, "2025-07-02", "Budget approved."),
            record("a1", "City Council", DocumentType::Agenda, "2025-07-16", "Park projects."),
            record("p1", "Planning Commission", DocumentType::Agenda, "2025-07-15", "Hillside permits."),
        ];
        let report = compose_report(&records, datetime!(2025-07-21 09:00 -8), 7);

        assert_eq!(report.subject, "La Cañada Flintridge Government Update - July 21, 2025");
        assert_eq!((report.document_count, report.body_count), (3, 2));
        assert!(report.text.contains("THIS WEEK'S ACTIVITY: 3 documents from 2 government bodies"));
        assert!(report.html.contains("<strong>3</strong> documents from <strong>2</strong> government bodies"));
        assert!(report.text.contains("July 14 - July 21, 2025"));
        assert!(report.text.contains("Report generated on July 21, 2025 at 9:00 AM"));

        let agenda = report.text.find("AGENDA: City Council agenda").unwrap();
        let minutes = report.text.find("MINUTES: City Council minutes").unwrap();
        let planning = report.text.find("PLANNING COMMISSION").unwrap();
        assert!(agenda < minutes && minutes < planning);
        assert!(report.text.contains("Date: July 2, 2025"));
    }

    #[test]
    fn html_escapes_record_text() {
        let records = vec![record(
            "x",
            "Design <Commission>",
            DocumentType::Agenda,
            "2025-07-10",
            "Fence height < 6' & \"setbacks\"",
        )];
        let report = compose_report(&records, datetime!(2025-07-21 09:00 UTC), 7);
        assert!(report.html.contains("Fence height &lt; 6&#39; &amp; &quot;setbacks&quot;"));
        assert!(report.html.contains("Design &lt;Commission&gt;"));
        assert!(!report.html.contains("<Commission>"));
    }

    #[test]
    fn empty_report_uses_no_activity_wording() {
        let report = compose_report(&[], datetime!(2025-07-21 09:00 UTC), 7);
        assert!(report.is_empty());
        assert!(report.html.contains("No New Activity This Week"));
        assert!(report.text.contains("NO NEW ACTIVITY THIS WEEK"));
    }

    #[test]
    fn huge_reporting_period_is_clamped() {
        let records = vec![record("a1", "City Council", DocumentType::Agenda, "2025-07-16", "Park projects.")];
        let report = compose_report(&records, datetime!(2025-07-21 09:00 UTC), 10_000_000);
        assert_eq!(report.document_count, 1);
        assert!(report.text.contains("January 1 - July 21, 2025"));
    }

    #[test]
    fn outbox_writes_all_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = OutboxTransport::new(dir.path());
        let report = compose_report(
            &[record("a1", "City Council", DocumentType::Agenda, "2025-07-16", "Park projects.")],
            datetime!(2025-07-21 16:00 UTC),
            7,
        );
        outbox.deliver(&report).unwrap();
        for path in outbox.paths_for(&report) {
            assert!(path.exists(), "{} missing", path.display());
        }
        assert!(dir.path().join("report_20250721T160000Z.html").exists());
    }

    #[test]
    fn empty_run_is_skipped_unless_configured() {
        let dir = tempfile::tempdir().unwrap();
        let now = datetime!(2025-07-21 16:00 UTC);

        let quiet = Notifier::new(vec![Box::new(OutboxTransport::new(dir.path()))], false);
        assert!(matches!(quiet.notify(&[], now, 7), NotifyOutcome::Skipped { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let chatty = Notifier::new(vec![Box::new(OutboxTransport::new(dir.path()))], true);
        assert!(chatty.notify(&[], now, 7).was_sent());
    }

    #[test]
    fn failing_transport_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::new(
            vec![Box::new(FailingTransport), Box::new(OutboxTransport::new(dir.path()))],
            false,
        );
        let records = vec![record("a1", "City Council", DocumentType::Agenda, "2025-07-16", "Park projects.")];
        match notifier.notify(&records, datetime!(2025-07-21 16:00 UTC), 7) {
            NotifyOutcome::Sent { delivered, failed } => {
                assert_eq!(delivered, vec!["outbox"]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, "failing");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn disabled_email_has_no_transports() {
        let dir = tempfile::tempdir().unwrap();
        let email = EmailConfig {
            enabled: false,
            ..EmailConfig::default()
        };
        let notifier = Notifier::from_config(&email, dir.path()).unwrap();
        let records = vec![record("a1", "City Council", DocumentType::Agenda, "2025-07-16", "Park projects.")];
        assert!(!notifier.notify(&records, datetime!(2025-07-21 16:00 UTC), 7).was_sent());
    }
}
