//! Wire format for published content trees.
//!
//! A document is `{ "generatedOn": <timestamp>, "root": <node> }` where each
//! node is `{ name, path, isDirectory, symlinkTarget?, downloadUrl?,
//! fileSize?, modifiedDate?, children? }`.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::node::{FileMeta, NodeId, NodeKind};
use crate::snapshot::{Snapshot, SnapshotBuilder};

/// Turns a serialized document into a [`Snapshot`].
pub trait DocumentParser: Send + Sync {
    /// Parse raw document bytes.
    fn parse(&self, bytes: &[u8]) -> Result<Snapshot, ParseError>;
}

/// Parser for the JSON document format.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDocumentParser;

impl DocumentParser for JsonDocumentParser {
    fn parse(&self, bytes: &[u8]) -> Result<Snapshot, ParseError> {
        let document: ContentDocument = serde_json::from_slice(bytes)?;
        document.into_snapshot()
    }
}

/// Timestamp as it appears in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    /// Unix seconds.
    Seconds(i64),
    /// RFC 3339, or `YYYY-MM-DD HH:MM:SS` in UTC.
    Text(String),
}

impl Timestamp {
    /// Encode a time the way documents written by this crate carry it.
    pub fn from_datetime(value: DateTime<Utc>) -> Self {
        Self::Text(value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    /// Decode to UTC.
    pub fn to_datetime(&self) -> Result<DateTime<Utc>, ParseError> {
        match self {
            Self::Seconds(secs) => {
                DateTime::from_timestamp(*secs, 0).ok_or_else(|| ParseError::InvalidTimestamp {
                    value: secs.to_string(),
                })
            }
            Self::Text(text) => parse_timestamp(text).ok_or_else(|| ParseError::InvalidTimestamp {
                value: text.clone(),
            }),
        }
    }
}

/// Parse the textual timestamp formats accepted in documents.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Top-level document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDocument {
    pub generated_on: Timestamp,
    pub root: DocumentNode,
}

/// One node of a document tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentNode {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_date: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DocumentNode>,
}

impl ContentDocument {
    /// Build a snapshot, validating every node.
    ///
    /// Node paths are derived from the chain of names below the root so
    /// that remote and scanned trees share one path space. A `path` field
    /// that disagrees is logged and otherwise ignored.
    pub fn into_snapshot(self) -> Result<Snapshot, ParseError> {
        let generated_on = self.generated_on.to_datetime()?;
        if self.root.symlink_target.is_some() || self.root.file_size.is_some() {
            return Err(ParseError::invalid_node(
                self.root.path.as_str(),
                "root must be a directory",
            ));
        }

        let mut builder = SnapshotBuilder::new(generated_on).root_name(self.root.name.as_str());
        for child in self.root.children {
            add_node(&mut builder, NodeId::ROOT, "", child)?;
        }
        Ok(builder.build())
    }

    /// Serialize a snapshot back into document form.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            generated_on: Timestamp::from_datetime(snapshot.generated_on()),
            root: document_node(snapshot, NodeId::ROOT),
        }
    }

    /// Render as pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn add_node(
    builder: &mut SnapshotBuilder,
    parent: NodeId,
    parent_path: &str,
    node: DocumentNode,
) -> Result<(), ParseError> {
    let expected = crate::snapshot::join_path(parent_path, &node.name);
    let declared = node.path.trim_matches('/');
    if !declared.is_empty() && !declared.ends_with(expected.as_str()) {
        tracing::debug!(declared, derived = %expected, "document path differs from name chain");
    }

    if let Some(target) = node.symlink_target {
        if !node.children.is_empty() {
            return Err(ParseError::invalid_node(expected, "symlink with children"));
        }
        builder.add_symlink(parent, &node.name, &target)?;
        return Ok(());
    }

    if node.is_directory {
        let id = builder.add_directory(parent, &node.name)?;
        for child in node.children {
            add_node(builder, id, &expected, child)?;
        }
        return Ok(());
    }

    if !node.children.is_empty() {
        return Err(ParseError::invalid_node(expected, "file with children"));
    }
    let modified = node
        .modified_date
        .as_ref()
        .map(Timestamp::to_datetime)
        .transpose()?;
    let meta = FileMeta {
        download_url: node.download_url,
        size: node.file_size,
        modified,
    };
    builder.add_file(parent, &node.name, meta)?;
    Ok(())
}

fn document_node(snapshot: &Snapshot, id: NodeId) -> DocumentNode {
    let Some(node) = snapshot.node(id) else {
        return DocumentNode::default();
    };

    let mut out = DocumentNode {
        name: node.name.to_string(),
        path: format!("/{}", node.path),
        ..DocumentNode::default()
    };

    match &node.kind {
        NodeKind::Directory => {
            out.is_directory = true;
            out.children = node
                .children
                .iter()
                .map(|child| document_node(snapshot, *child))
                .collect();
        }
        NodeKind::File(meta) => {
            out.download_url = meta.download_url.clone();
            out.file_size = meta.size;
            out.modified_date = meta.modified.map(Timestamp::from_datetime);
        }
        NodeKind::Symlink { target } => {
            out.symlink_target = Some(target.to_string());
        }
    }
    out
}

impl Snapshot {
    /// Serialize into the document wire format.
    pub fn to_document(&self) -> ContentDocument {
        ContentDocument::from_snapshot(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = r#"{
        "generatedOn": "2024-03-01T10:00:00Z",
        "root": {
            "name": "content",
            "path": "/",
            "isDirectory": true,
            "children": [
                { "name": "a.txt", "path": "/a.txt", "isDirectory": false,
                  "downloadUrl": "files/a.txt", "fileSize": 10,
                  "modifiedDate": "2024-02-01 08:30:00" },
                { "name": "dir", "path": "/dir", "isDirectory": true, "children": [
                    { "name": "b.txt", "path": "/dir/b.txt", "isDirectory": false,
                      "downloadUrl": "files/dir/b.txt", "fileSize": 5,
                      "modifiedDate": 1706776200 },
                    { "name": "current", "path": "/dir/current", "isDirectory": false,
                      "symlinkTarget": "b.txt" }
                ]}
            ]
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let snap = JsonDocumentParser.parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(
            snap.generated_on(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(snap.root().name, "content");

        let a = snap.lookup("a.txt").unwrap();
        assert_eq!(a.file_size(), Some(10));
        assert_eq!(a.download_url(), Some("files/a.txt"));
        assert_eq!(
            a.modified_date(),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 0).unwrap())
        );

        let b = snap.lookup("dir/b.txt").unwrap();
        assert_eq!(b.modified_date().unwrap().timestamp(), 1_706_776_200);
        assert_eq!(snap.lookup("dir/current").unwrap().symlink_target(), Some("b.txt"));
    }

    #[test]
    fn test_document_order_preserved() {
        let snap = JsonDocumentParser.parse(SAMPLE.as_bytes()).unwrap();
        let order: Vec<_> = snap
            .descendants(NodeId::ROOT)
            .into_iter()
            .map(|n| n.path.to_string())
            .collect();
        assert_eq!(order, vec!["a.txt", "dir", "dir/b.txt", "dir/current"]);
    }

    #[test]
    fn test_malformed_json() {
        let err = JsonDocumentParser.parse(b"{ not json").unwrap_err();
        assert!(matches!(err, ParseError::Json(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let doc = r#"{"generatedOn": 0, "root": {"name": "", "isDirectory": true, "children": [
            {"name": "a", "fileSize": 1}, {"name": "a", "fileSize": 2}
        ]}}"#;
        assert!(matches!(
            JsonDocumentParser.parse(doc.as_bytes()),
            Err(ParseError::Snapshot(_))
        ));
    }

    #[test]
    fn test_file_with_children_rejected() {
        let doc = r#"{"generatedOn": 0, "root": {"name": "", "isDirectory": true, "children": [
            {"name": "a", "fileSize": 1, "children": [{"name": "b", "fileSize": 1}]}
        ]}}"#;
        assert!(matches!(
            JsonDocumentParser.parse(doc.as_bytes()),
            Err(ParseError::InvalidNode { .. })
        ));
    }

    #[test]
    fn test_parent_traversal_rejected() {
        let doc = r#"{"generatedOn": 0, "root": {"name": "", "isDirectory": true, "children": [
            {"name": "..", "isDirectory": true}
        ]}}"#;
        assert!(JsonDocumentParser.parse(doc.as_bytes()).is_err());
    }

    #[test]
    fn test_bad_timestamp() {
        let doc = r#"{"generatedOn": "yesterday", "root": {"name": "", "isDirectory": true}}"#;
        assert!(matches!(
            JsonDocumentParser.parse(doc.as_bytes()),
            Err(ParseError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_missing_file_size_stays_unknown() {
        let doc = r#"{"generatedOn": 0, "root": {"name": "", "isDirectory": true, "children": [
            {"name": "a.txt", "downloadUrl": "files/a.txt", "modifiedDate": 1700000000}
        ]}}"#;
        let snap = JsonDocumentParser.parse(doc.as_bytes()).unwrap();
        assert_eq!(snap.lookup("a.txt").unwrap().file_size(), None);

        let json = snap.to_document().to_json_pretty().unwrap();
        assert!(!json.contains("fileSize"));
    }

    #[test]
    fn test_snapshot_to_document_reparses() {
        let snap = JsonDocumentParser.parse(SAMPLE.as_bytes()).unwrap();
        let json = snap.to_document().to_json_pretty().unwrap();
        let again = JsonDocumentParser.parse(json.as_bytes()).unwrap();

        assert_eq!(again.len(), snap.len());
        assert_eq!(
            again.lookup("a.txt").unwrap().file(),
            snap.lookup("a.txt").unwrap().file()
        );
        assert!(json.contains("\"isDirectory\": true"));
    }
}
