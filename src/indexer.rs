use crate::config::{AppConfig, CorpusConfig, IndexerConfig};
use crate::db::Catalog;
use crate::embeddings::Embedder;
use crate::error::{EmbedError, IndexError};
use crate::extractor::{extractor_for, ContentExtractor, MediaProbe};
use crate::models::{DocumentRecord, IndexReport};
use crate::scanner::{detect_changes, scan_directory};
use crate::vector_index::export_index;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// What to do with a batch whose embedding call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Extra attempts after the first failure; the batch is skipped afterwards
    pub retries: usize,
}

/// Rows of one batch waiting for their vectors.
struct PendingRow {
    filepath: String,
    filename: String,
    mtime: f64,
    preview: String,
}

struct PreparedBatch {
    texts: Vec<String>,
    rows: Vec<PendingRow>,
    skipped_empty: usize,
    degraded: usize,
}

/// Incremental indexer for a single corpus.
///
/// Runs are not safe to overlap on the same corpus; callers run at most one
/// indexer per catalog at a time.
pub struct CorpusIndexer {
    corpus: CorpusConfig,
    embedder: Arc<dyn Embedder>,
    extractor: Box<dyn ContentExtractor>,
    batch_size: usize,
    embed_timeout: Option<Duration>,
    policy: BatchPolicy,
}

impl CorpusIndexer {
    pub fn new(
        corpus: CorpusConfig,
        embedder: Arc<dyn Embedder>,
        settings: &IndexerConfig,
        probe: Option<Arc<dyn MediaProbe>>,
    ) -> Self {
        let extractor = extractor_for(corpus.file_type, settings.read_chars, probe);
        Self {
            corpus,
            embedder,
            extractor,
            batch_size: settings.batch_size.max(1),
            embed_timeout: None,
            policy: BatchPolicy {
                retries: settings.batch_retries,
            },
        }
    }

    /// Fail an embedding call that has not returned within `timeout`.
    pub fn with_embed_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.embed_timeout = timeout;
        self
    }

    /// Synchronize the catalog with the corpus root and rebuild the vector index.
    ///
    /// Each batch is committed on its own, so an interrupted run keeps every
    /// batch that finished and a rerun only picks up what is still missing.
    pub fn run(&self) -> Result<IndexReport, IndexError> {
        let name = &self.corpus.name;
        log::info!("Indexing corpus {} ({:?})", name, self.corpus.root);

        if !self.corpus.root.is_dir() {
            return Err(IndexError::MissingRoot(self.corpus.root.clone()));
        }
        let root = self
            .corpus
            .root
            .canonicalize()
            .map_err(|source| IndexError::Io {
                path: self.corpus.root.clone(),
                source,
            })?;

        let mut catalog = Catalog::open(&self.corpus.catalog)?;

        let scan = scan_directory(&root, &self.corpus.extensions);
        let stored = catalog.path_mtimes()?;
        let changes = detect_changes(&scan, &stored);

        let mut report = IndexReport {
            corpus: self.corpus.key.clone(),
            scanned: scan.len(),
            unchanged: changes.unchanged,
            ..Default::default()
        };

        if !changes.to_delete.is_empty() {
            report.deleted = catalog.delete_by_paths(&changes.to_delete)?;
            log::info!("Removed {} deleted files from {}", report.deleted, name);
        }

        if changes.to_process.is_empty() {
            log::info!("No changes in {}", name);
        } else {
            let total_batches = changes.to_process.len().div_ceil(self.batch_size);
            log::info!(
                "{} files to update in {} ({} batches)",
                changes.to_process.len(),
                name,
                total_batches
            );

            for (n, batch) in changes.to_process.chunks(self.batch_size).enumerate() {
                let prepared = self.prepare_batch(batch);
                report.skipped_empty += prepared.skipped_empty;
                report.degraded_files += prepared.degraded;

                match self.embed_with_retry(&prepared.texts) {
                    Ok(vectors) => {
                        let records = into_records(self, prepared.rows, vectors);
                        report.embedded += catalog.upsert_many(&records)?;
                        log::debug!(
                            "Batch {}/{} of {} committed ({} documents)",
                            n + 1,
                            total_batches,
                            name,
                            records.len()
                        );
                    }
                    Err(e) => {
                        report.failed_batches += 1;
                        log::error!(
                            "Skipping batch {}/{} of {} after {} attempts: {}",
                            n + 1,
                            total_batches,
                            name,
                            self.policy.retries + 1,
                            e
                        );
                    }
                }
            }
        }

        report.index_size = export_index(&catalog, &self.corpus.index)?;

        log::info!(
            "Corpus {} indexed: {} scanned, {} unchanged, {} embedded, {} deleted, \
             {} failed batches",
            name,
            report.scanned,
            report.unchanged,
            report.embedded,
            report.deleted,
            report.failed_batches
        );
        Ok(report)
    }

    fn prepare_batch(&self, batch: &[(String, f64)]) -> PreparedBatch {
        let mut prepared = PreparedBatch {
            texts: Vec::with_capacity(batch.len()),
            rows: Vec::with_capacity(batch.len()),
            skipped_empty: 0,
            degraded: 0,
        };

        for (filepath, mtime) in batch {
            let path = Path::new(filepath);
            let content = self.extractor.extract(path);
            if let Some(reason) = &content.degraded {
                prepared.degraded += 1;
                log::warn!("Partial content for {}: {}", filepath, reason);
            }
            if content.embedding_text.trim().is_empty() {
                prepared.skipped_empty += 1;
                continue;
            }

            prepared.texts.push(content.embedding_text);
            prepared.rows.push(PendingRow {
                filepath: filepath.clone(),
                filename: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                mtime: *mtime,
                preview: content.preview,
            });
        }
        prepared
    }

    fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut attempt = 0;
        loop {
            match self.embed_once(texts.to_vec()) {
                Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
                Ok(vectors) => {
                    let err = EmbedError::CountMismatch {
                        expected: texts.len(),
                        got: vectors.len(),
                    };
                    if attempt >= self.policy.retries {
                        return Err(err);
                    }
                    log::warn!("Embedding attempt {} failed: {}", attempt + 1, err);
                }
                Err(e) => {
                    if attempt >= self.policy.retries {
                        return Err(e);
                    }
                    log::warn!("Embedding attempt {} failed: {}", attempt + 1, e);
                }
            }
            attempt += 1;
        }
    }

    fn embed_once(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError> {
        let Some(timeout) = self.embed_timeout else {
            return self.embedder.embed(&texts);
        };

        // The worker is left to finish on its own if it overruns the timeout
        let (tx, rx) = mpsc::channel();
        let embedder = Arc::clone(&self.embedder);
        thread::spawn(move || {
            let _ = tx.send(embedder.embed(&texts));
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(EmbedError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(EmbedError::Inference(
                "embedding worker exited without a result".to_string(),
            )),
        }
    }
}

fn into_records(
    indexer: &CorpusIndexer,
    rows: Vec<PendingRow>,
    vectors: Vec<Vec<f32>>,
) -> Vec<DocumentRecord> {
    rows.into_iter()
        .zip(vectors)
        .map(|(row, embedding)| DocumentRecord {
            filepath: row.filepath,
            filename: row.filename,
            file_type: indexer.corpus.file_type,
            mtime: row.mtime,
            preview: row.preview,
            embedding,
        })
        .collect()
}

/// Index every configured corpus (or only `only`), one after another. A
/// failing corpus is logged and does not stop the sweep.
pub fn index_all(
    config: &AppConfig,
    embedder: Arc<dyn Embedder>,
    probe: Option<Arc<dyn MediaProbe>>,
    only: Option<&str>,
) -> Vec<(String, Result<IndexReport, IndexError>)> {
    let mut results = Vec::new();

    for corpus in &config.corpora {
        if only.is_some_and(|key| key != corpus.key) {
            continue;
        }

        let indexer = CorpusIndexer::new(
            corpus.clone(),
            Arc::clone(&embedder),
            &config.indexer,
            probe.clone(),
        )
        .with_embed_timeout(Some(config.embedder.timeout()));

        let result = indexer.run();
        if let Err(e) = &result {
            log::error!("Corpus {} failed: {}", corpus.name, e);
        }
        results.push((corpus.key.clone(), result));
    }

    results
}
