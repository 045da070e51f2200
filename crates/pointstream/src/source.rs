//! Ready-made tile, decoder and hierarchy sources.

use std::collections::HashMap;
use std::sync::Arc;

use pointstream_decode::{DecodeError, DecodedBuffers, TileFormat, decode_points};

use crate::error::LoadError;
use crate::hierarchy::{ChildDescriptor, NodeDescriptor, PayloadLocation};
use crate::worker::{FetchFuture, HierarchyFuture, HierarchySource, TileDecoder, TileSource};

/// Tiles held in memory, either as per-node files or as one data blob
/// addressed by byte ranges.
#[derive(Debug, Clone, Default)]
pub struct MemoryTileSource {
    files: HashMap<String, Arc<[u8]>>,
    blob: Arc<[u8]>,
}

impl MemoryTileSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `blob` for [`PayloadLocation::Range`] payloads.
    #[must_use]
    pub fn with_blob(mut self, blob: impl Into<Arc<[u8]>>) -> Self {
        self.blob = blob.into();
        self
    }

    /// Store a file for [`PayloadLocation::Path`] payloads.
    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.files.insert(path.into(), bytes.into());
    }

    fn read(&self, payload: &PayloadLocation) -> Result<Vec<u8>, LoadError> {
        match payload {
            PayloadLocation::Path(path) => self
                .files
                .get(path)
                .map(|bytes| bytes.to_vec())
                .ok_or_else(|| LoadError::Fetch {
                    location: path.clone(),
                    message: "not found".to_string(),
                }),
            PayloadLocation::Range { offset, size } => {
                let start = usize::try_from(*offset).ok();
                let end = start
                    .zip(usize::try_from(*size).ok())
                    .and_then(|(s, n)| s.checked_add(n));
                start
                    .zip(end)
                    .and_then(|(s, e)| self.blob.get(s..e))
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| LoadError::Fetch {
                        location: format!("bytes {offset}+{size}"),
                        message: format!("out of range for {} byte blob", self.blob.len()),
                    })
            }
        }
    }
}

impl TileSource for MemoryTileSource {
    fn fetch(&self, node: &NodeDescriptor) -> FetchFuture {
        let result = self.read(&node.payload);
        Box::pin(std::future::ready(result))
    }
}

/// Decodes fixed-layout point records with [`decode_points`].
///
/// Positions are made relative to the minimum corner of the node bounds.
#[derive(Debug, Clone, Default)]
pub struct LayoutDecoder {
    format: TileFormat,
}

impl LayoutDecoder {
    /// Decode records in `format`.
    #[must_use]
    pub fn new(format: TileFormat) -> Self {
        Self { format }
    }
}

impl TileDecoder for LayoutDecoder {
    fn decode(&self, node: &NodeDescriptor, bytes: &[u8]) -> Result<DecodedBuffers, DecodeError> {
        let buffers = decode_points(bytes, &self.format, node.bounds.min)?;
        if buffers.point_count() as u64 != node.point_count {
            tracing::debug!(
                node = %node.name,
                expected = node.point_count,
                actual = buffers.point_count(),
                "tile point count differs from hierarchy"
            );
        }
        Ok(buffers)
    }
}

/// Child metadata held in memory, keyed by parent node name.
#[derive(Debug, Clone, Default)]
pub struct MemoryHierarchySource {
    children: HashMap<String, Vec<ChildDescriptor>>,
}

impl MemoryHierarchySource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the children of the node named `parent`.
    pub fn insert(&mut self, parent: impl Into<String>, children: Vec<ChildDescriptor>) {
        self.children.insert(parent.into(), children);
    }
}

impl HierarchySource for MemoryHierarchySource {
    fn fetch_children(&self, node: &NodeDescriptor) -> HierarchyFuture {
        let result = self
            .children
            .get(&node.name)
            .cloned()
            .ok_or_else(|| LoadError::Hierarchy {
                message: format!("no child metadata for {}", node.name),
            });
        Box::pin(std::future::ready(result))
    }
}

#[cfg(all(feature = "http", not(target_family = "wasm")))]
pub use http::{HttpHierarchySource, HttpTileSource};

#[cfg(all(feature = "http", not(target_family = "wasm")))]
mod http {
    use pointstream_decode::parse_hierarchy;

    use super::{
        ChildDescriptor, FetchFuture, HierarchyFuture, HierarchySource, LoadError, NodeDescriptor,
        PayloadLocation, TileSource,
    };

    /// Fetches tiles over HTTP relative to a base URL.
    ///
    /// Range payloads are read from `{base}/{data_file}` with a `Range`
    /// header; path payloads from `{base}/{path}`.
    #[derive(Debug, Clone)]
    pub struct HttpTileSource {
        http: reqwest::Client,
        base_url: String,
        data_file: String,
    }

    impl HttpTileSource {
        /// Create a source for datasets under `base_url`.
        #[must_use]
        pub fn new(base_url: impl Into<String>) -> Self {
            Self {
                http: reqwest::Client::new(),
                base_url: base_url.into(),
                data_file: "octree.bin".to_string(),
            }
        }

        /// Use a custom HTTP client.
        #[must_use]
        pub fn with_http(mut self, http: reqwest::Client) -> Self {
            self.http = http;
            self
        }

        /// Name of the single data file used by range payloads.
        #[must_use]
        pub fn with_data_file(mut self, data_file: impl Into<String>) -> Self {
            self.data_file = data_file.into();
            self
        }
    }

    impl TileSource for HttpTileSource {
        fn fetch(&self, node: &NodeDescriptor) -> FetchFuture {
            let http = self.http.clone();
            let (url, range) = match &node.payload {
                PayloadLocation::Path(path) => (format!("{}/{path}", self.base_url), None),
                PayloadLocation::Range { offset, size } => (
                    format!("{}/{}", self.base_url, self.data_file),
                    Some(format!(
                        "bytes={offset}-{}",
                        offset.saturating_add(size.saturating_sub(1))
                    )),
                ),
            };
            Box::pin(async move { fetch_bytes(&http, &url, range.as_deref()).await })
        }
    }

    /// Fetches per-node hierarchy chunks from `{base}/{name}.hrc`.
    ///
    /// Only the direct children in a chunk are returned; deeper records are
    /// fetched again from the children's own chunks when they are expanded.
    #[derive(Debug, Clone)]
    pub struct HttpHierarchySource {
        http: reqwest::Client,
        base_url: String,
    }

    impl HttpHierarchySource {
        /// Create a source for datasets under `base_url`.
        #[must_use]
        pub fn new(base_url: impl Into<String>) -> Self {
            Self {
                http: reqwest::Client::new(),
                base_url: base_url.into(),
            }
        }

        /// Use a custom HTTP client.
        #[must_use]
        pub fn with_http(mut self, http: reqwest::Client) -> Self {
            self.http = http;
            self
        }
    }

    impl HierarchySource for HttpHierarchySource {
        fn fetch_children(&self, node: &NodeDescriptor) -> HierarchyFuture {
            let http = self.http.clone();
            let url = format!("{}/{}.hrc", self.base_url, node.name);
            let name = node.name.clone();
            Box::pin(async move {
                let data = fetch_bytes(&http, &url, None).await?;
                let records = parse_hierarchy(&data, &name)?;
                let children = records
                    .iter()
                    .filter(|r| r.level() == name.len())
                    .filter_map(|r| {
                        let index = r.name.as_bytes().last()?.checked_sub(b'0')?;
                        Some(ChildDescriptor::new(
                            index,
                            u64::from(r.point_count),
                            r.child_mask,
                        ))
                    })
                    .collect();
                Ok(children)
            })
        }
    }

    async fn fetch_bytes(
        http: &reqwest::Client,
        url: &str,
        range: Option<&str>,
    ) -> Result<Vec<u8>, LoadError> {
        tracing::debug!(url, range, "fetching");

        let mut request = http.get(url);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }
        let response = request.send().await.map_err(|e| LoadError::Fetch {
            location: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::HttpStatus {
                location: url.to_string(),
                status: status.as_u16(),
            });
        }

        let data = response.bytes().await.map_err(|e| LoadError::Fetch {
            location: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(data.to_vec())
    }
}
