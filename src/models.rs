use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Text,
    Video,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Text => "text",
            FileType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(FileType::Text),
            "video" => Some(FileType::Video),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog row ready to be written. `id` is assigned by the catalog on first
/// insert and preserved on every later upsert of the same path.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub filepath: String,
    pub filename: String,
    pub file_type: FileType,
    /// Seconds since the Unix epoch, exactly as observed on disk
    pub mtime: f64,
    pub preview: String,
    pub embedding: Vec<f32>,
}

/// Catalog metadata without the embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: i64,
    pub filepath: String,
    pub filename: String,
    pub file_type: FileType,
    pub mtime: f64,
    pub preview: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Score,
    DateDesc,
    DateAsc,
    Size,
    Duration,
    Resolution,
    Name,
}

impl SortBy {
    /// Unknown sort keys fall back to similarity order.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "date_desc" => SortBy::DateDesc,
            "date_asc" => SortBy::DateAsc,
            "size" => SortBy::Size,
            "duration" => SortBy::Duration,
            "resolution" => SortBy::Resolution,
            "name" => SortBy::Name,
            _ => SortBy::Score,
        }
    }
}

/// One ranked hit, tagged with the corpus it came from. Lives only for the
/// duration of a search call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCandidate {
    /// `<corpus key>_<document id>`, unique across corpora
    pub id: String,
    pub corpus: String,
    pub source: String,
    pub doc_id: i64,
    pub filename: String,
    pub filepath: String,
    pub preview: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub mtime: f64,
    pub mtime_str: String,
    pub score: f32,
    pub score_percent: i32,
    pub sort_size: f64,
    pub sort_res: u64,
    pub sort_dur: u64,
}

/// Search request as it arrives on the wire. Every field is optional and
/// gets normalized by the search service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default, alias = "targetCorpusKeys")]
    pub targets: Vec<String>,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchCandidate>,
    pub total: usize,
    /// Wall-clock seconds spent serving the request
    pub time: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    pub corpus: String,
    pub scanned: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub embedded: usize,
    pub skipped_empty: usize,
    pub failed_batches: usize,
    pub degraded_files: usize,
    /// Vector count of the rebuilt index, `None` if the rebuild was skipped
    pub index_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusStatus {
    pub key: String,
    pub name: String,
    pub file_type: FileType,
    pub available: bool,
    pub ntotal: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_by_parse() {
        assert_eq!(SortBy::parse("date_desc"), SortBy::DateDesc);
        assert_eq!(SortBy::parse("name"), SortBy::Name);
        assert_eq!(SortBy::parse("score"), SortBy::Score);
        assert_eq!(SortBy::parse("bogus"), SortBy::Score);
        assert_eq!(SortBy::parse(""), SortBy::Score);
    }

    #[test]
    fn test_search_request_defaults() {
        let req: SearchRequest = serde_json::from_str(r#"{"query": "dragon"}"#).unwrap();
        assert_eq!(req.query.as_deref(), Some("dragon"));
        assert!(req.targets.is_empty());
        assert!(req.page.is_none());

        let req: SearchRequest = serde_json::from_str("{}").unwrap();
        assert!(req.query.is_none());
    }

    #[test]
    fn test_file_type_round_trip_names() {
        assert_eq!(FileType::parse("video"), Some(FileType::Video));
        assert_eq!(FileType::parse("pdf"), None);
        assert_eq!(serde_json::to_string(&FileType::Text).unwrap(), "\"text\"");
    }
}
