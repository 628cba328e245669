//! Shared fixtures: an in-memory HTTP transport and fragment builders.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use fragmenter::download::{ByteStream, HttpTransport, ProbeInfo};
use fragmenter::manifest::{
    AlternativesModule, Base, DistributionManifest, DistributionModule, DistributionModuleFile,
    SimpleModule,
};
use fragmenter::{ErrorCode, FragmenterError, FragmenterResult, ModuleJson};
use tempfile::TempDir;

pub const BASE_URL: &str = "http://mock/pkg";
const CHUNK_SIZE: usize = 8 * 1024;

/// In-memory distribution server implementing the transport seam.
#[derive(Default)]
pub struct MockServer {
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// Relative paths whose GET always fails with a transport error.
    broken: Mutex<HashSet<String>>,
    /// Every GET URL received, query string included.
    pub gets: Mutex<Vec<String>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, relative: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(relative.to_string(), bytes);
    }

    pub fn break_path(&self, relative: &str) {
        self.broken.lock().unwrap().insert(relative.to_string());
    }

    pub fn clear_request_log(&self) {
        self.gets.lock().unwrap().clear();
    }

    pub fn get_requests(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    fn relative(url: &str) -> String {
        let without_query = url.split('?').next().unwrap_or(url);
        without_query
            .strip_prefix(&format!("{BASE_URL}/"))
            .unwrap_or(without_query)
            .to_string()
    }

    fn body(&self, url: &str) -> FragmenterResult<Vec<u8>> {
        let relative = Self::relative(url);
        self.files
            .lock()
            .unwrap()
            .get(&relative)
            .cloned()
            .ok_or_else(|| {
                FragmenterError::new(ErrorCode::NetworkError, format!("404 {relative}"))
            })
    }
}

#[async_trait]
impl HttpTransport for MockServer {
    async fn probe(&self, url: &str) -> FragmenterResult<ProbeInfo> {
        let body = self.body(url)?;
        Ok(ProbeInfo {
            content_length: Some(body.len() as u64),
            accepts_ranges: true,
        })
    }

    async fn get(&self, url: &str, start_offset: u64) -> FragmenterResult<ByteStream> {
        self.gets.lock().unwrap().push(url.to_string());
        if self.broken.lock().unwrap().contains(&Self::relative(url)) {
            return Err(FragmenterError::new(
                ErrorCode::NetworkError,
                format!("connection reset by peer: {url}"),
            ));
        }
        let body = self.body(url)?;
        let tail = body[(start_offset as usize).min(body.len())..].to_vec();
        let chunks: Vec<FragmenterResult<Bytes>> = tail
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Build a fragment ZIP from a file list, embedding `module.json` with the
/// payload's tree hash. Returns the ZIP bytes and the hash.
pub fn zip_fragment(files: &[(&str, &str)]) -> (Vec<u8>, String) {
    let payload = TempDir::new().unwrap();
    for (rel, contents) in files {
        let path = payload.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
    let hash = fragmenter::hashing::hash_tree(payload.path()).unwrap();

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        for (rel, contents) in files {
            writer.start_file(*rel, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.start_file("module.json", options).unwrap();
        let doc = serde_json::to_string(&ModuleJson { hash: hash.clone() }).unwrap();
        writer.write_all(doc.as_bytes()).unwrap();
        writer.finish().unwrap();
    }
    (cursor.into_inner(), hash)
}

fn module_file(key: &str, hash: &str, size: u64) -> DistributionModuleFile {
    DistributionModuleFile {
        key: key.to_string(),
        path: String::new(),
        hash: hash.to_string(),
        compression: "zip".to_string(),
        split_file_count: 1,
        complete_file_size: size,
        complete_file_size_uncompressed: size * 2,
    }
}

/// Assembles a whole distribution: fragments on the server plus the
/// manifest that describes them.
pub struct DistributionBuilder<'a> {
    server: &'a MockServer,
    modules: Vec<DistributionModule>,
    /// (destDir, files) per module, for the full fragment.
    module_trees: Vec<(String, Vec<(String, String)>)>,
    base_files: Vec<(String, String)>,
}

impl<'a> DistributionBuilder<'a> {
    pub fn new(server: &'a MockServer) -> Self {
        Self {
            server,
            modules: Vec::new(),
            module_trees: Vec::new(),
            base_files: Vec::new(),
        }
    }

    pub fn base(mut self, files: &[(&str, &str)]) -> Self {
        self.base_files = files
            .iter()
            .map(|(r, c)| (r.to_string(), c.to_string()))
            .collect();
        self
    }

    pub fn simple_module(mut self, name: &str, files: &[(&str, &str)]) -> Self {
        let (zip, hash) = zip_fragment(files);
        let size = zip.len() as u64;
        self.server.put(&format!("{name}.zip"), zip);
        self.modules.push(DistributionModule::Simple(SimpleModule {
            name: name.to_string(),
            dest_dir: name.to_string(),
            download_file: module_file(name, &hash, size),
        }));
        self.record_tree(name, files, &hash);
        self
    }

    /// Store a simple module's fragment as `split` ordered parts.
    pub fn split_module(mut self, name: &str, files: &[(&str, &str)], split: u32) -> Self {
        let (zip, hash) = zip_fragment(files);
        let size = zip.len() as u64;
        let part_len = zip.len().div_ceil(split as usize);
        for (i, part) in zip.chunks(part_len).enumerate() {
            self.server
                .put(&format!("{name}.zip.sf-part{:02}", i + 1), part.to_vec());
        }
        let mut file = module_file(name, &hash, size);
        file.split_file_count = split;
        self.modules.push(DistributionModule::Simple(SimpleModule {
            name: name.to_string(),
            dest_dir: name.to_string(),
            download_file: file,
        }));
        self.record_tree(name, files, &hash);
        self
    }

    /// `chosen` names the alternative whose tree the full fragment carries.
    pub fn alternatives_module(
        mut self,
        name: &str,
        alternatives: &[(&str, &[(&str, &str)])],
        chosen: &str,
    ) -> Self {
        let mut download_files = Vec::new();
        for (key, files) in alternatives {
            let (zip, hash) = zip_fragment(files);
            let size = zip.len() as u64;
            self.server.put(&format!("{name}/{key}.zip"), zip);
            download_files.push(module_file(key, &hash, size));
            if *key == chosen {
                self.record_tree(name, files, &hash);
            }
        }
        self.modules
            .push(DistributionModule::Alternatives(AlternativesModule {
                name: name.to_string(),
                dest_dir: name.to_string(),
                download_files,
            }));
        self
    }

    fn record_tree(&mut self, dest_dir: &str, files: &[(&str, &str)], hash: &str) {
        let mut tree: Vec<(String, String)> = files
            .iter()
            .map(|(r, c)| (r.to_string(), c.to_string()))
            .collect();
        tree.push((
            "module.json".to_string(),
            serde_json::to_string(&ModuleJson {
                hash: hash.to_string(),
            })
            .unwrap(),
        ));
        self.module_trees.push((dest_dir.to_string(), tree));
    }

    /// Upload `base.zip`, `full.zip`, and `modules.json`; returns the
    /// manifest that was served.
    pub fn publish(self) -> DistributionManifest {
        let base_refs: Vec<(&str, &str)> = self
            .base_files
            .iter()
            .map(|(r, c)| (r.as_str(), c.as_str()))
            .collect();
        let (base_zip, base_hash) = zip_fragment(&base_refs);
        let base_size = base_zip.len() as u64;
        self.server.put("base.zip", base_zip);

        // The full fragment is the entire tree: base files plus every
        // module directory, each with its embedded module.json.
        let mut full_files: Vec<(String, String)> = self.base_files.clone();
        for (dest_dir, tree) in &self.module_trees {
            for (rel, contents) in tree {
                full_files.push((format!("{dest_dir}/{rel}"), contents.clone()));
            }
        }
        let full_refs: Vec<(&str, &str)> = full_files
            .iter()
            .map(|(r, c)| (r.as_str(), c.as_str()))
            .collect();
        let (full_zip, full_hash) = zip_fragment(&full_refs);
        let full_size = full_zip.len() as u64;
        self.server.put("full.zip", full_zip);

        let manifest = DistributionManifest {
            version: Some("1.0.0".to_string()),
            modules: self.modules,
            base: Base {
                hash: base_hash,
                files: self.base_files.iter().map(|(r, _)| r.clone()).collect(),
                split_file_count: 1,
                complete_file_size: base_size,
                complete_file_size_uncompressed: base_size * 2,
            },
            full_hash,
            full_split_file_count: 1,
            full_complete_file_size: full_size,
            full_complete_file_size_uncompressed: full_size * 2,
        };
        self.server
            .put("modules.json", serde_json::to_vec(&manifest).unwrap());
        manifest
    }
}

/// Every file under `root` with its contents, for tree comparisons.
pub fn snapshot_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut snapshot = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned();
                snapshot.insert(relative, std::fs::read(&path).unwrap());
            }
        }
    }
    snapshot
}
