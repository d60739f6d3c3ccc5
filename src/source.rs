use std::{
    io::{self, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A named blob of known length whose byte ranges can be read independently.
#[async_trait]
pub trait UploadSource: Send + Sync {
    /// File name as the user knows it; the backend keeps its extension.
    fn name(&self) -> &str;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn content_type(&self) -> &str;

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes>;
}

pub fn guess_content_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

fn check_range(range: &Range<u64>, len: u64) -> io::Result<()> {
    if range.start > range.end || range.end > len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("range {:?} out of bounds for {} bytes", range, len),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    content_type: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        Self {
            content_type: guess_content_type(&name),
            name,
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

#[async_trait]
impl UploadSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        check_range(&range, self.len())?;
        Ok(self.data.slice(range.start as usize..range.end as usize))
    }
}

/// A file on local disk. Each range read opens its own handle, so concurrent
/// reads never share a cursor.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    name: String,
    content_type: String,
    len: u64,
}

impl LocalFile {
    pub async fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            content_type: guess_content_type(&name),
            name,
            len: metadata.len(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UploadSource for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        check_range(&range, self.len)?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let mut buffer = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}
