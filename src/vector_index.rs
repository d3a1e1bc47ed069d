use crate::db::Catalog;
use crate::error::IndexError;
use ndarray::{Array2, ArrayView1};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"NSVI";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Exact inner-product vector index keyed by catalog document ids.
///
/// A snapshot: rebuilt in full from the catalog after an indexing run and
/// loaded read-only by the search service. Documents written to the catalog
/// afterwards stay invisible until the next rebuild and reload.
pub struct FlatIpIndex {
    ids: Vec<i64>,
    /// One row per id, `ntotal x dim`
    vectors: Array2<f32>,
}

impl FlatIpIndex {
    /// Build from `(id, vector)` pairs. The first vector fixes the dimension;
    /// rows with any other length are skipped. Returns `None` when nothing
    /// usable remains.
    pub fn build(entries: Vec<(i64, Vec<f32>)>) -> Result<Option<Self>, IndexError> {
        let Some(dim) = entries.iter().map(|(_, v)| v.len()).find(|&d| d > 0) else {
            return Ok(None);
        };

        let mut ids = Vec::with_capacity(entries.len());
        let mut flat = Vec::with_capacity(entries.len() * dim);
        for (id, vector) in entries {
            if vector.len() != dim {
                log::warn!(
                    "Skipping document {}: embedding has dimension {}, expected {}",
                    id,
                    vector.len(),
                    dim
                );
                continue;
            }
            ids.push(id);
            flat.extend_from_slice(&vector);
        }

        let vectors = Array2::from_shape_vec((ids.len(), dim), flat)?;
        Ok(Some(Self { ids, vectors }))
    }

    pub fn ntotal(&self) -> usize {
        self.ids.len()
    }

    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    /// Top `k` `(id, score)` pairs by inner product, highest first. Equal
    /// scores keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>, IndexError> {
        if query.len() != self.dim() {
            return Err(IndexError::DimensionMismatch {
                query: query.len(),
                index: self.dim(),
            });
        }
        if k == 0 || self.ids.is_empty() {
            return Ok(vec![]);
        }

        let scores = self.vectors.dot(&ArrayView1::from(query));
        let cmp = |a: &usize, b: &usize| scores[*b].total_cmp(&scores[*a]).then(a.cmp(b));

        let mut order: Vec<usize> = (0..self.ids.len()).collect();
        if k < order.len() {
            order.select_nth_unstable_by(k, cmp);
            order.truncate(k);
        }
        order.sort_by(cmp);

        Ok(order.into_iter().map(|i| (self.ids[i], scores[i])).collect())
    }

    /// Write the index, replacing any previous file atomically.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let io_err = |source: std::io::Error| IndexError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp = temp_path(path);
        {
            let file = fs::File::create(&tmp).map_err(io_err)?;
            let mut w = BufWriter::new(file);
            w.write_all(MAGIC).map_err(io_err)?;
            w.write_all(&FORMAT_VERSION.to_le_bytes()).map_err(io_err)?;
            w.write_all(&(self.dim() as u32).to_le_bytes())
                .map_err(io_err)?;
            w.write_all(&(self.ntotal() as u64).to_le_bytes())
                .map_err(io_err)?;
            for id in &self.ids {
                w.write_all(&id.to_le_bytes()).map_err(io_err)?;
            }
            for value in self.vectors.iter() {
                w.write_all(&value.to_le_bytes()).map_err(io_err)?;
            }
            let file = w.into_inner().map_err(|e| io_err(e.into_error()))?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let bytes = fs::read(path).map_err(|source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
            return Err(IndexError::BadMagic(path.to_path_buf()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion(version));
        }
        let dim = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[12..20]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        let expected = dim
            .checked_mul(4)
            .and_then(|row| row.checked_add(8))
            .and_then(|row| count.checked_mul(row))
            .and_then(|body| body.checked_add(HEADER_LEN))
            .unwrap_or(usize::MAX);
        if bytes.len() != expected {
            return Err(IndexError::Corrupt {
                expected,
                found: bytes.len(),
            });
        }

        let ids_end = HEADER_LEN + count * 8;
        let ids = bytes[HEADER_LEN..ids_end]
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                i64::from_le_bytes(b)
            })
            .collect::<Vec<_>>();
        let flat = crate::db::bytes_to_f32_vec(&bytes[ids_end..]);
        let vectors = Array2::from_shape_vec((count, dim), flat)?;

        Ok(Self { ids, vectors })
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Rebuild the index file from every embedding in the catalog. An empty
/// catalog leaves any existing index file untouched and returns `None`.
pub fn export_index(catalog: &Catalog, path: &Path) -> Result<Option<usize>, IndexError> {
    let entries = catalog.all_embeddings()?;
    if entries.is_empty() {
        log::warn!("Catalog is empty, skipping index generation for {:?}", path);
        return Ok(None);
    }

    let Some(index) = FlatIpIndex::build(entries)? else {
        log::warn!("No usable embeddings, skipping index generation for {:?}", path);
        return Ok(None);
    };
    index.save(path)?;
    log::info!(
        "Index written to {:?}: {} vectors, dimension {}",
        path,
        index.ntotal(),
        index.dim()
    );
    Ok(Some(index.ntotal()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentRecord, FileType};
    use tempfile::tempdir;

    fn sample() -> FlatIpIndex {
        FlatIpIndex::build(vec![
            (10, vec![1.0, 0.0]),
            (20, vec![0.0, 1.0]),
            (30, vec![0.6, 0.8]),
            (40, vec![1.0, 0.0]),
        ])
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_search_orders_by_inner_product() {
        let index = sample();
        assert_eq!(index.ntotal(), 4);
        assert_eq!(index.dim(), 2);

        let hits = index.search(&[1.0, 0.0], 10).unwrap();
        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        // 10 and 40 tie; insertion order decides
        assert_eq!(ids, vec![10, 40, 30, 20]);
        assert!((hits[2].1 - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_search_top_k() {
        let index = sample();
        let hits = index.search(&[0.0, 1.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 20);
        assert_eq!(hits[1].0, 30);
        assert!(index.search(&[0.0, 1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let index = sample();
        assert!(matches!(
            index.search(&[1.0, 0.0, 0.0], 5),
            Err(IndexError::DimensionMismatch { query: 3, index: 2 })
        ));
    }

    #[test]
    fn test_build_skips_mismatched_rows() {
        let rows = vec![(1, vec![1.0, 0.0]), (2, vec![1.0]), (3, vec![0.0, 1.0])];
        let index = FlatIpIndex::build(rows).unwrap().unwrap();
        assert_eq!(index.ids(), &[1, 3]);
        assert!(FlatIpIndex::build(vec![]).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/index.nsvi");
        let index = sample();
        index.save(&path).unwrap();
        assert!(!temp_path(&path).exists());

        let loaded = FlatIpIndex::load(&path).unwrap();
        assert_eq!(loaded.ids(), index.ids());
        assert_eq!(loaded.dim(), 2);
        assert_eq!(
            loaded.search(&[0.6, 0.8], 1).unwrap(),
            index.search(&[0.6, 0.8], 1).unwrap()
        );
    }

    #[test]
    fn test_load_rejects_corrupt_files() {
        let dir = tempdir().unwrap();

        let missing = FlatIpIndex::load(&dir.path().join("absent.nsvi"));
        assert!(matches!(missing, Err(IndexError::Io { .. })));

        let garbage = dir.path().join("garbage.nsvi");
        fs::write(&garbage, b"definitely not an index file").unwrap();
        assert!(matches!(
            FlatIpIndex::load(&garbage),
            Err(IndexError::BadMagic(_))
        ));

        let path = dir.path().join("truncated.nsvi");
        sample().save(&path).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            FlatIpIndex::load(&path),
            Err(IndexError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_export_index_from_catalog() {
        let dir = tempdir().unwrap();
        let mut catalog = Catalog::open(&dir.path().join("c.sqlite")).unwrap();
        let path = dir.path().join("index.nsvi");

        // Empty catalog: no file is produced and a stale one would be kept
        assert_eq!(export_index(&catalog, &path).unwrap(), None);
        assert!(!path.exists());

        catalog
            .upsert_many(&[
                DocumentRecord {
                    filepath: "/c/a.txt".to_string(),
                    filename: "a.txt".to_string(),
                    file_type: FileType::Text,
                    mtime: 1.0,
                    preview: "a".to_string(),
                    embedding: vec![1.0, 0.0],
                },
                DocumentRecord {
                    filepath: "/c/b.txt".to_string(),
                    filename: "b.txt".to_string(),
                    file_type: FileType::Text,
                    mtime: 2.0,
                    preview: "b".to_string(),
                    embedding: vec![0.0, 1.0],
                },
            ])
            .unwrap();

        assert_eq!(export_index(&catalog, &path).unwrap(), Some(2));
        assert_eq!(FlatIpIndex::load(&path).unwrap().ntotal(), 2);
    }
}
