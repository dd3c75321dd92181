//! 待发送文件的数据源

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// 未知类型时使用的 MIME 类型
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone)]
enum SourceData {
    Path(PathBuf),
    Memory(Arc<[u8]>),
}

/// 只读文件源: 名称、声明大小、MIME 类型和字节内容
#[derive(Debug, Clone)]
pub struct FileSource {
    name: String,
    size: u64,
    media_type: String,
    data: SourceData,
}

impl FileSource {
    /// 从磁盘文件创建，MIME 类型根据扩展名猜测
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let media_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string());

        Ok(Self {
            name,
            size: metadata.len(),
            media_type,
            data: SourceData::Path(path.to_path_buf()),
        })
    }

    /// 从内存缓冲区创建
    pub fn from_bytes(
        name: impl Into<String>,
        media_type: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
    ) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            media_type: media_type.into(),
            data: SourceData::Memory(data),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// 从 `offset` 开始读取最多 `len` 字节
    ///
    /// 到达文件末尾时返回的数据可能少于 `len`。
    pub async fn read_chunk(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        match &self.data {
            SourceData::Memory(bytes) => {
                let start = usize::try_from(offset)
                    .unwrap_or(usize::MAX)
                    .min(bytes.len());
                let end = start.saturating_add(len).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            SourceData::Path(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;

                let mut buffer = Vec::with_capacity(len);
                file.take(len as u64).read_to_end(&mut buffer).await?;
                Ok(buffer)
            }
        }
    }
}
