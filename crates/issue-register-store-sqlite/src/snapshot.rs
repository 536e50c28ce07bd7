use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use issue_register_core::{
    replay, DeferredCandidate, Document, EvidenceLink, Issue, IssueId, Meeting, MeetingDocumentLink, PendingMatch,
    Revision,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::{
    insert_deferred, insert_document, insert_evidence, insert_issue, insert_meeting, insert_pending,
    insert_revision, list_deferred, list_documents, list_meeting_documents, list_meetings, list_pending_rows,
    load_all_revisions, load_issues, query_evidence, rfc3339, row_exists, SqliteStore, LATEST_SCHEMA_VERSION,
};

const ISSUES_FILE: &str = "issues.ndjson";
const REVISIONS_FILE: &str = "revisions.ndjson";
const EVIDENCE_FILE: &str = "evidence_links.ndjson";
const PENDING_FILE: &str = "pending_matches.ndjson";
const DEFERRED_FILE: &str = "deferred_candidates.ndjson";
const DOCUMENTS_FILE: &str = "documents.ndjson";
const MEETINGS_FILE: &str = "meetings.ndjson";
const MEETING_DOCUMENTS_FILE: &str = "meeting_documents.ndjson";

const SNAPSHOT_FILES: [&str; 8] = [
    ISSUES_FILE,
    REVISIONS_FILE,
    EVIDENCE_FILE,
    PENDING_FILE,
    DEFERRED_FILE,
    DOCUMENTS_FILE,
    MEETINGS_FILE,
    MEETING_DOCUMENTS_FILE,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_issues: usize,
    pub skipped_existing_issues: usize,
    pub imported_evidence_links: usize,
    pub skipped_existing_evidence_links: usize,
    pub imported_pending_matches: usize,
    pub imported_deferred_candidates: usize,
    pub imported_sources: usize,
}

impl SqliteStore {
    /// Export the full register as NDJSON files plus a sha256 manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let evidence = query_evidence(&self.conn, "", &[])?;
        let files = vec![
            export_file(out_dir, ISSUES_FILE, &load_issues(&self.conn, None)?)?,
            export_file(out_dir, REVISIONS_FILE, &load_all_revisions(&self.conn)?)?,
            export_file(out_dir, EVIDENCE_FILE, &evidence)?,
            export_file(out_dir, PENDING_FILE, &list_pending_rows(&self.conn, None)?)?,
            export_file(out_dir, DEFERRED_FILE, &list_deferred(&self.conn)?)?,
            export_file(out_dir, DOCUMENTS_FILE, &list_documents(&self.conn)?)?,
            export_file(out_dir, MEETINGS_FILE, &list_meetings(&self.conn, None)?)?,
            export_file(out_dir, MEETING_DOCUMENTS_FILE, &list_meeting_documents(&self.conn)?)?,
        ];

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: rfc3339(OffsetDateTime::now_utc())?,
            files,
        };
        let manifest_path = out_dir.join("manifest.json");
        let manifest_json = serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json)
            .with_context(|| format!("failed to write export manifest {}", manifest_path.display()))?;

        tracing::info!(dir = %out_dir.display(), "exported register snapshot");
        Ok(manifest)
    }

    /// Import an exported snapshot in one transaction.
    ///
    /// Each issue's revision history is replayed and must reproduce the exported state.
    ///
    /// # Errors
    /// Returns an error when the manifest does not match the files, a history does not
    /// replay, a record already exists and `skip_existing` is false, or a write fails.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let issues = read_ndjson_file::<Issue>(&in_dir.join(ISSUES_FILE))?;
        let mut histories: BTreeMap<IssueId, Vec<Revision>> = BTreeMap::new();
        for revision in read_ndjson_file::<Revision>(&in_dir.join(REVISIONS_FILE))? {
            histories.entry(revision.issue_id).or_default().push(revision);
        }
        let evidence = read_ndjson_file::<EvidenceLink>(&in_dir.join(EVIDENCE_FILE))?;
        let pending = read_ndjson_file::<PendingMatch>(&in_dir.join(PENDING_FILE))?;
        let deferred = read_ndjson_file::<DeferredCandidate>(&in_dir.join(DEFERRED_FILE))?;
        let documents = read_ndjson_file::<Document>(&in_dir.join(DOCUMENTS_FILE))?;
        let meetings = read_ndjson_file::<Meeting>(&in_dir.join(MEETINGS_FILE))?;
        let meeting_documents = read_ndjson_file::<MeetingDocumentLink>(&in_dir.join(MEETING_DOCUMENTS_FILE))?;

        let tx = self.conn.transaction().context("failed to start import transaction")?;
        let mut summary = ImportSummary::default();

        for issue in issues {
            let mut history = histories.remove(&issue.id).unwrap_or_default();
            history.sort_by_key(|revision| revision.sequence);
            let replayed = replay(&history).with_context(|| format!("issue {} history does not replay", issue.id))?;
            if replayed != issue.state || u32::try_from(history.len()).ok() != Some(issue.revision) {
                return Err(anyhow!("issue {} state does not match its revision history", issue.id));
            }
            if row_exists(&tx, "issues", &issue.id.to_string())? {
                if skip_existing {
                    summary.skipped_existing_issues += 1;
                    continue;
                }
                return Err(anyhow!("issue already exists: {}", issue.id));
            }
            insert_issue(&tx, &issue)?;
            for revision in &history {
                insert_revision(&tx, revision)?;
            }
            summary.imported_issues += 1;
        }
        if let Some(orphan) = histories.keys().next() {
            return Err(anyhow!("revisions reference issue {orphan} which is not in the snapshot"));
        }

        for document in &documents {
            if !row_exists(&tx, "documents", &document.source_id)? {
                insert_document(&tx, document)?;
                summary.imported_sources += 1;
            }
        }
        for meeting in &meetings {
            if !row_exists(&tx, "meetings", &meeting.source_id)? {
                insert_meeting(&tx, meeting)?;
                summary.imported_sources += 1;
            }
        }
        for link in &meeting_documents {
            tx.execute(
                "INSERT OR IGNORE INTO meeting_documents(meeting_id, document_id) VALUES (?1, ?2)",
                rusqlite::params![link.meeting_id, link.document_id],
            )
            .context("failed to import meeting document link")?;
        }

        for link in &evidence {
            if row_exists(&tx, "evidence_links", &link.link_id.to_string())? {
                if skip_existing {
                    summary.skipped_existing_evidence_links += 1;
                    continue;
                }
                return Err(anyhow!("evidence link already exists: {}", link.link_id));
            }
            insert_evidence(&tx, link)?;
            summary.imported_evidence_links += 1;
        }
        for entry in &pending {
            if !row_exists(&tx, "pending_matches", &entry.pending_id.to_string())? {
                insert_pending(&tx, entry)?;
                summary.imported_pending_matches += 1;
            }
        }
        for entry in &deferred {
            if !row_exists(&tx, "deferred_candidates", &entry.deferred_id.to_string())? {
                insert_deferred(&tx, entry)?;
                summary.imported_deferred_candidates += 1;
            }
        }

        tx.commit().context("failed to commit snapshot import")?;
        tracing::info!(
            issues = summary.imported_issues,
            evidence = summary.imported_evidence_links,
            "imported register snapshot"
        );
        Ok(summary)
    }
}

fn export_file<T: Serialize>(out_dir: &Path, name: &str, values: &[T]) -> Result<ExportFileDigest> {
    let (sha256, records) = write_ndjson_file(&out_dir.join(name), values)?;
    Ok(ExportFileDigest { path: name.to_string(), sha256, records })
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path).with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;
    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let mut values = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {} from {}", index + 1, path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed)
            .with_context(|| format!("failed to parse NDJSON row {} from {}", index + 1, path.display()))?;
        values.push(value);
    }
    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path).with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path).with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut records = 0_usize;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {} from {}", index + 1, path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }
    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version != LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; expected {LATEST_SCHEMA_VERSION}",
            manifest.schema_version
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in SNAPSHOT_FILES {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {actual_sha256}",
                expected.sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {actual_records}",
                expected.records
            ));
        }
    }
    Ok(())
}
