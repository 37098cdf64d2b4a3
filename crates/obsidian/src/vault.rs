use anyhow::{Context, Result};
use civic_core::archive::Archive;
use civic_core::dates::{display_date, format_timestamp};
use civic_core::schema::{ArchiveRecord, DocumentType};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

const GENERATED_NOTICE: &str = "This index is generated. Do not edit manually.";

pub struct VaultPaths {
    pub root: PathBuf,
    pub index_dir: PathBuf,
    pub records_dir: PathBuf,
    pub bodies_dir: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            index_dir: root.join("00_Index"),
            records_dir: root.join("Records"),
            bodies_dir: root.join("Bodies"),
            root,
        }
    }

    /// Recreates the generated folders from scratch. Anything else in the
    /// vault is left alone.
    pub fn reset(&self) -> Result<()> {
        for dir in [&self.index_dir, &self.records_dir, &self.bodies_dir] {
            if dir.exists() {
                fs::remove_dir_all(dir).with_context(|| format!("clearing {}", dir.display()))?;
            }
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct VaultSummary {
    pub records: usize,
    pub bodies: usize,
}

pub fn build_vault(archive: &Archive, vault_root: &Path, generated: OffsetDateTime) -> Result<VaultSummary> {
    let paths = VaultPaths::new(vault_root);
    paths.reset()?;

    // 1) Record notes
    let mut index_lines = moc_header("MOC - Records", generated);
    let mut by_body: BTreeMap<&str, Vec<&ArchiveRecord>> = BTreeMap::new();
    let mut by_month: BTreeMap<String, usize> = BTreeMap::new();

    for record in archive.records() {
        write_record_note(&paths, record)?;
        index_lines.push(format!(
            "- {} [[Records/{}|{}]] ({})",
            display_date(&record.date),
            record.id,
            record.title,
            record.body
        ));
        by_body.entry(record.body.as_str()).or_default().push(record);
        if let Some(month) = record.date.get(..7) {
            *by_month.entry(month.to_string()).or_insert(0) += 1;
        }
    }
    if archive.is_empty() {
        index_lines.push("_No archived documents yet._".to_string());
    }
    write_lines(&paths.index_dir.join("MOC - Records.md"), &index_lines)?;

    // 2) One MOC per body
    let mut body_lines = moc_header("MOC - Bodies", generated);
    for (body, records) in &by_body {
        let file_stem = note_name(body);
        write_body_note(&paths, body, &file_stem, records)?;
        body_lines.push(format!("- [[Bodies/{file_stem}|{body}]] ({})", records.len()));
    }
    if by_body.is_empty() {
        body_lines.push("_No bodies with archived documents._".to_string());
    }
    write_lines(&paths.index_dir.join("MOC - Bodies.md"), &body_lines)?;

    // 3) Month counts, newest first
    let mut month_lines = moc_header("MOC - Months", generated);
    for (month, count) in by_month.iter().rev() {
        month_lines.push(format!("- {month}: {count} documents"));
    }
    write_lines(&paths.index_dir.join("MOC - Months.md"), &month_lines)?;

    Ok(VaultSummary {
        records: archive.len(),
        bodies: by_body.len(),
    })
}

fn moc_header(title: &str, generated: OffsetDateTime) -> Vec<String> {
    vec![
        format!("# {title}"),
        String::new(),
        GENERATED_NOTICE.to_string(),
        format!("Generated: {}", format_timestamp(generated)),
        String::new(),
    ]
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}

fn write_record_note(paths: &VaultPaths, r: &ArchiveRecord) -> Result<()> {
    let note_path = paths.records_dir.join(format!("{}.md", r.id));

    let mut md = String::new();
    md.push_str("---\n");
    md.push_str(&format!("id: {}\n", r.id));
    md.push_str(&format!("title: {}\n", yaml_string(&r.title)));
    md.push_str(&format!("body: {}\n", yaml_string(&r.body)));
    md.push_str(&format!("type: {}\n", r.doc_type));
    md.push_str(&format!("date: {}\n", r.date));
    md.push_str(&format!("url: {}\n", yaml_string(&r.url)));
    md.push_str(&format!("summary_method: {}\n", r.summary.method));
    if let Some(model) = &r.summary.model {
        md.push_str(&format!("model: {}\n", yaml_string(model)));
    }
    md.push_str(&format!("run_id: {}\n", r.run_id));
    md.push_str(&format!("archived_at: {}\n", r.archived_at));
    md.push_str("summary: |\n");
    md.push_str(&indent_yaml_block(&r.summary.text));
    md.push_str("---\n\n");

    md.push_str(&format!("# {}\n\n", r.title));

    md.push_str("## Source\n");
    md.push_str(&format!("- Body: [[Bodies/{}|{}]]\n", note_name(&r.body), r.body));
    md.push_str(&format!("- Date: {}\n", display_date(&r.date)));
    md.push_str(&format!("- Document: {}\n\n", r.url));

    md.push_str("## Summary\n");
    if r.summary.text.trim().is_empty() {
        md.push_str("_No summary available._\n");
    } else {
        md.push_str(r.summary.text.trim());
        md.push('\n');
    }
    if !r.ai_generated() {
        md.push_str("\n_Extractive summary; no AI model was used._\n");
    }

    fs::write(&note_path, md).with_context(|| format!("writing {}", note_path.display()))?;
    Ok(())
}

fn write_body_note(paths: &VaultPaths, body: &str, file_stem: &str, records: &[&ArchiveRecord]) -> Result<()> {
    let mut lines = vec![
        format!("# {body}"),
        String::new(),
        GENERATED_NOTICE.to_string(),
        String::new(),
    ];
    for (heading, doc_type) in [("Agendas", DocumentType::Agenda), ("Minutes", DocumentType::Minutes)] {
        lines.push(format!("## {heading}"));
        lines.push(String::new());
        let mut any = false;
        for r in records.iter().filter(|r| r.doc_type == doc_type) {
            lines.push(format!("- {} [[Records/{}|{}]]", display_date(&r.date), r.id, r.title));
            any = true;
        }
        if !any {
            lines.push(format!("_No {} archived._", heading.to_lowercase()));
        }
        lines.push(String::new());
    }
    write_lines(&paths.bodies_dir.join(format!("{file_stem}.md")), &lines)
}

/// File-safe note name for a body; keeps spaces so links read naturally.
fn note_name(body: &str) -> String {
    body.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '#' | '^' | '[' | ']' => '-',
            _ => c,
        })
        .collect()
}

/// JSON strings are valid YAML double-quoted scalars.
fn yaml_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value.replace('"', "'")))
}

fn indent_yaml_block(s: &str) -> String {
    let mut out = String::new();
    for line in s.lines() {
        out.push_str("  ");
        out.push_str(line);
        out.push('\n');
    }
    if out.is_empty() {
        out.push_str("  \n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use civic_core::schema::{GenerationMethod, Summary};
    use time::macros::datetime;

    fn record(id: &str, body: &str, date: &str, doc_type: DocumentType, method: GenerationMethod) -> ArchiveRecord {
        ArchiveRecord {
            id: id.to_string(),
            body: body.to_string(),
            title: format!("{body}: \"{doc_type}\" {date}"),
            date: date.to_string(),
            url: format!("https://lcf.ca.gov/{id}.pdf"),
            doc_type,
            summary: Summary {
                document_id: id.to_string(),
                text: "First line.\nSecond line.".to_string(),
                method,
                model: None,
                usage: None,
            },
            archived_at: "2025-07-21T16:00:00Z".to_string(),
            run_id: "20250721T160000Z".to_string(),
        }
    }

    #[test]
    fn renders_notes_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(&dir.path().join("archive")).unwrap();
        archive
            .merge(vec![
                record("cc-a", "City Council", "2025-07-16", DocumentType::Agenda, GenerationMethod::Ai),
                record("pw-m", "Public Works/Traffic", "2025-06-10", DocumentType::Minutes, GenerationMethod::Fallback),
            ])
            .unwrap();

        let vault = dir.path().join("vault");
        let summary = build_vault(&archive, &vault, datetime!(2025-07-21 16:05 UTC)).unwrap();
        assert_eq!(summary, VaultSummary { records: 2, bodies: 2 });

        let note = fs::read_to_string(vault.join("Records").join("cc-a.md")).unwrap();
        assert!(note.starts_with("---\nid: cc-a\n"));
        assert!(note.contains("title: \"City Council: \\\"agenda\\\" 2025-07-16\"\n"));
        assert!(note.contains("summary: |\n  First line.\n  Second line.\n---"));
        assert!(note.contains("- Body: [[Bodies/City Council|City Council]]"));

        let fallback = fs::read_to_string(vault.join("Records").join("pw-m.md")).unwrap();
        assert!(fallback.contains("no AI model was used"));
        assert!(vault.join("Bodies").join("Public Works-Traffic.md").exists());

        let index = fs::read_to_string(vault.join("00_Index").join("MOC - Records.md")).unwrap();
        let first = index.find("[[Records/cc-a").unwrap();
        let second = index.find("[[Records/pw-m").unwrap();
        assert!(first < second);

        let months = fs::read_to_string(vault.join("00_Index").join("MOC - Months.md")).unwrap();
        assert!(months.contains("- 2025-07: 1 documents\n- 2025-06: 1 documents"));
    }

    #[test]
    fn rebuild_drops_stale_notes_but_keeps_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        fs::create_dir_all(vault.join("Records")).unwrap();
        fs::write(vault.join("Records").join("stale.md"), "old").unwrap();
        fs::write(vault.join("Notes.md"), "mine").unwrap();

        let archive = Archive::open(&dir.path().join("archive")).unwrap();
        build_vault(&archive, &vault, datetime!(2025-07-21 16:05 UTC)).unwrap();

        assert!(!vault.join("Records").join("stale.md").exists());
        assert!(vault.join("Notes.md").exists());
        let index = fs::read_to_string(vault.join("00_Index").join("MOC - Records.md")).unwrap();
        assert!(index.contains("_No archived documents yet._"));
    }
}
