use crate::config::{CorpusConfig, SearchConfig};
use crate::db;
use crate::embeddings::Embedder;
use crate::error::{EmbedError, IndexError};
use crate::models::{
    CorpusStatus, DocumentMeta, FileType, SearchCandidate, SearchRequest, SearchResponse, SortBy,
};
use crate::vector_index::FlatIpIndex;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Instant;

static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Size:\s*([\d.]+)MB").unwrap());
static RESOLUTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Resolution:\s*(\d+)x(\d+)").unwrap());
static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration:\s*(\d+)m(\d+)s").unwrap());

/// Numeric sort keys recovered from a media preview string.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MediaSortKeys {
    pub size_mb: f64,
    pub resolution_pixels: u64,
    pub duration_secs: u64,
}

/// Parse `Size: 50.20MB, Resolution: 1920x1080, Duration: 5m30s`. Each part
/// that is missing or malformed stays zero.
pub fn parse_media_meta(preview: &str) -> MediaSortKeys {
    let mut keys = MediaSortKeys::default();

    if let Some(size) = SIZE_RE
        .captures(preview)
        .and_then(|c| c[1].parse::<f64>().ok())
        .filter(|s| s.is_finite())
    {
        keys.size_mb = size;
    }

    if let Some(c) = RESOLUTION_RE.captures(preview) {
        if let (Ok(w), Ok(h)) = (c[1].parse::<u64>(), c[2].parse::<u64>()) {
            keys.resolution_pixels = w.saturating_mul(h);
        }
    }

    if let Some(c) = DURATION_RE.captures(preview) {
        if let (Ok(m), Ok(s)) = (c[1].parse::<u64>(), c[2].parse::<u64>()) {
            keys.duration_secs = m.saturating_mul(60).saturating_add(s);
        }
    }

    keys
}

/// One corpus as seen by the search service: its config plus the vector
/// index loaded at startup or last reload.
pub struct CorpusHandle {
    pub config: CorpusConfig,
    index: Option<FlatIpIndex>,
}

impl CorpusHandle {
    /// Load the corpus' index. Failures leave the corpus unavailable.
    pub fn load(config: CorpusConfig) -> Self {
        let index = match Self::try_load(&config) {
            Ok(index) => {
                log::info!(
                    "Loaded corpus {} ({} vectors)",
                    config.key,
                    index.ntotal()
                );
                Some(index)
            }
            Err(e) => {
                log::warn!("Corpus {} unavailable for search: {}", config.key, e);
                None
            }
        };
        Self { config, index }
    }

    fn try_load(config: &CorpusConfig) -> Result<FlatIpIndex, IndexError> {
        // Make sure the catalog is there too; it is reopened per query
        db::get_connection(&config.catalog)?;
        FlatIpIndex::load(&config.index)
    }

    pub fn is_available(&self) -> bool {
        self.index.is_some()
    }

    pub fn ntotal(&self) -> usize {
        self.index.as_ref().map_or(0, |i| i.ntotal())
    }

    fn candidates(
        &self,
        query: &[f32],
        min_score: f32,
        limit: usize,
    ) -> Result<Vec<SearchCandidate>, IndexError> {
        let Some(index) = &self.index else {
            return Ok(vec![]);
        };

        let hits: Vec<(i64, f32)> = index
            .search(query, limit)?
            .into_iter()
            .filter(|(_, score)| *score >= min_score)
            .collect();
        if hits.is_empty() {
            return Ok(vec![]);
        }

        let conn = db::get_connection(&self.config.catalog)?;
        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        let mut metas: HashMap<i64, DocumentMeta> = db::fetch_by_ids(&conn, &ids)?
            .into_iter()
            .map(|m| (m.id, m))
            .collect();

        let mut out = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            match metas.remove(&id) {
                Some(meta) => out.push(self.candidate(meta, score)),
                // Deleted from the catalog after the index snapshot was taken
                None => log::warn!("Corpus {}: id {} not in catalog", self.config.key, id),
            }
        }
        Ok(out)
    }

    fn candidate(&self, meta: DocumentMeta, score: f32) -> SearchCandidate {
        let keys = match meta.file_type {
            FileType::Video => parse_media_meta(&meta.preview),
            FileType::Text => MediaSortKeys::default(),
        };

        SearchCandidate {
            id: format!("{}_{}", self.config.key, meta.id),
            corpus: self.config.key.clone(),
            source: self.config.name.clone(),
            doc_id: meta.id,
            filename: meta.filename,
            filepath: meta.filepath,
            preview: meta.preview,
            file_type: meta.file_type,
            mtime: meta.mtime,
            mtime_str: format_mtime(meta.mtime),
            score,
            score_percent: (score * 100.0) as i32,
            sort_size: keys.size_mb,
            sort_res: keys.resolution_pixels,
            sort_dur: keys.duration_secs,
        }
    }
}

fn format_mtime(mtime: f64) -> String {
    if !mtime.is_finite() {
        return String::new();
    }
    let secs = mtime.floor();
    let nanos = ((mtime - secs) * 1e9) as u32;
    chrono::DateTime::from_timestamp(secs as i64, nanos)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_default()
}

/// Stable sort in place by the requested criterion.
pub fn sort_candidates(candidates: &mut [SearchCandidate], sort_by: SortBy) {
    match sort_by {
        SortBy::Score => candidates.sort_by(|a, b| b.score.total_cmp(&a.score)),
        SortBy::DateDesc => candidates.sort_by(|a, b| b.mtime.total_cmp(&a.mtime)),
        SortBy::DateAsc => candidates.sort_by(|a, b| a.mtime.total_cmp(&b.mtime)),
        SortBy::Size => candidates.sort_by(|a, b| b.sort_size.total_cmp(&a.sort_size)),
        SortBy::Duration => candidates.sort_by(|a, b| b.sort_dur.cmp(&a.sort_dur)),
        SortBy::Resolution => candidates.sort_by(|a, b| b.sort_res.cmp(&a.sort_res)),
        SortBy::Name => candidates.sort_by(|a, b| a.filename.cmp(&b.filename)),
    }
}

/// 1-based page slice. Pages before the first clamp to 1; pages past the end
/// are empty.
pub fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> Vec<T> {
    let page = page.max(1);
    let start = (page - 1).saturating_mul(page_size);
    if start >= items.len() {
        return Vec::new();
    }
    items.into_iter().skip(start).take(page_size).collect()
}

/// Multi-corpus semantic search over loaded indexes.
///
/// Indexes are immutable snapshots held in memory. Changes written by the
/// indexer become visible only after `reload` or `reload_all`.
pub struct SearchService {
    embedder: Arc<dyn Embedder>,
    settings: SearchConfig,
    /// Configured corpus keys, in config order
    keys: Vec<String>,
    corpora: RwLock<HashMap<String, Arc<CorpusHandle>>>,
}

impl SearchService {
    pub fn new(
        configs: Vec<CorpusConfig>,
        embedder: Arc<dyn Embedder>,
        settings: SearchConfig,
    ) -> Self {
        let keys = configs.iter().map(|c| c.key.clone()).collect();
        let corpora = configs
            .into_iter()
            .map(|c| (c.key.clone(), Arc::new(CorpusHandle::load(c))))
            .collect();
        Self {
            embedder,
            settings,
            keys,
            corpora: RwLock::new(corpora),
        }
    }

    fn handle(&self, key: &str) -> Option<Arc<CorpusHandle>> {
        let map = self.corpora.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned()
    }

    /// Reload one corpus' index from disk. Returns whether it is now available,
    /// or `None` for an unknown key.
    pub fn reload(&self, key: &str) -> Option<bool> {
        let config = self.handle(key)?.config.clone();
        let handle = Arc::new(CorpusHandle::load(config));
        let available = handle.is_available();
        self.corpora
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), handle);
        Some(available)
    }

    pub fn reload_all(&self) -> Vec<CorpusStatus> {
        for key in &self.keys {
            self.reload(key);
        }
        self.status()
    }

    pub fn status(&self) -> Vec<CorpusStatus> {
        self.keys
            .iter()
            .filter_map(|key| self.handle(key))
            .map(|h| CorpusStatus {
                key: h.config.key.clone(),
                name: h.config.name.clone(),
                file_type: h.config.file_type,
                available: h.is_available(),
                ntotal: h.ntotal(),
            })
            .collect()
    }

    /// Rank an already-embedded query across `targets`.
    ///
    /// Similarity order only considers the top `candidate_limit` hits per
    /// corpus; every other order ranks all vectors above `min_score`, so
    /// paging by date or name never misses a document outside that window.
    pub fn search_vector(
        &self,
        query: &[f32],
        targets: &[String],
        min_score: f32,
        sort_by: SortBy,
        page: usize,
        page_size: usize,
    ) -> SearchResponse {
        let started = Instant::now();

        let mut seen = HashSet::new();
        let handles: Vec<Arc<CorpusHandle>> = targets
            .iter()
            .filter(|key| seen.insert(key.as_str()))
            .filter_map(|key| self.handle(key))
            .collect();

        let mut candidates = Vec::new();
        for handle in handles {
            if !handle.is_available() {
                continue;
            }
            let limit = match sort_by {
                SortBy::Score => self.settings.candidate_limit,
                _ => handle.ntotal(),
            };
            match handle.candidates(query, min_score, limit) {
                Ok(mut found) => candidates.append(&mut found),
                Err(e) => log::warn!("Skipping corpus {}: {}", handle.config.key, e),
            }
        }

        sort_candidates(&mut candidates, sort_by);
        let total = candidates.len();
        let results = paginate(candidates, page, page_size);

        SearchResponse {
            results,
            total,
            time: started.elapsed().as_secs_f64(),
        }
    }

    /// Normalize a wire request, embed the query, and search. A blank query
    /// yields an empty result without calling the embedder; no targets means
    /// every configured corpus.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse, EmbedError> {
        let started = Instant::now();

        let query = request.query.as_deref().unwrap_or("").trim();
        if query.is_empty() {
            return Ok(SearchResponse {
                results: vec![],
                total: 0,
                time: started.elapsed().as_secs_f64(),
            });
        }

        let targets: &[String] = if request.targets.is_empty() {
            &self.keys
        } else {
            &request.targets
        };
        let min_score = request
            .min_score
            .filter(|s| s.is_finite())
            .unwrap_or(self.settings.min_score);
        let sort_by = request
            .sort_by
            .as_deref()
            .map(SortBy::parse)
            .unwrap_or_default();
        let page = request.page.filter(|p| *p >= 1).unwrap_or(1) as usize;
        let page_size = request
            .page_size
            .filter(|s| *s >= 1)
            .map_or(self.settings.page_size, |s| s as usize);

        let query_vector = self.embedder.embed_query(query)?;
        let mut response =
            self.search_vector(&query_vector, targets, min_score, sort_by, page, page_size);
        response.time = started.elapsed().as_secs_f64();

        log::info!(
            "Search {:?} over {:?}: {} hits in {:.3}s",
            query,
            targets,
            response.total,
            response.time
        );
        Ok(response)
    }
}
