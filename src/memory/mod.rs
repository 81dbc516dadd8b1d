//! 运行状态存储 - 以run_id为键保存每轮结束时的检查点

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

use crate::generator::types::RunState;

/// 检查点格式版本，只保证同版本读写
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("未找到运行 {0} 的检查点")]
    NotFound(String),
    #[error("检查点读写失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("检查点序列化失败: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("检查点版本不兼容: 期望 {expected}，实际 {found}")]
    IncompatibleVersion { expected: u32, found: u32 },
}

/// 检查点：带版本与保存时间的运行状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: RunState,
}

impl Checkpoint {
    pub fn new(state: RunState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            state,
        }
    }

    fn into_state(self) -> Result<RunState, StoreError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(StoreError::IncompatibleVersion {
                expected: CHECKPOINT_VERSION,
                found: self.version,
            });
        }
        Ok(self.state)
    }
}

/// 检查点存储，监督者是唯一写入方
#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// 覆盖保存最新检查点
    async fn save(&self, run_id: &str, state: &RunState) -> Result<(), StoreError>;

    async fn load(&self, run_id: &str) -> Result<RunState, StoreError>;

    /// 已保存的运行ID
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    /// 删除检查点，返回是否存在过
    async fn discard(&self, run_id: &str) -> Result<bool, StoreError>;
}

/// 进程内存储，检查点以JSON值保存
#[derive(Debug, Default)]
pub struct MemoryRunStateStore {
    data: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStateStore {
    async fn save(&self, run_id: &str, state: &RunState) -> Result<(), StoreError> {
        let serialized = serde_json::to_value(Checkpoint::new(state.clone()))?;
        self.data.write().await.insert(run_id.to_string(), serialized);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        let value = self
            .data
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        serde_json::from_value::<Checkpoint>(value)?.into_state()
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.data.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn discard(&self, run_id: &str) -> Result<bool, StoreError> {
        Ok(self.data.write().await.remove(run_id).is_some())
    }
}

/// 文件存储：每个运行一个JSON文件，先写临时文件再改名
#[derive(Debug, Clone)]
pub struct FileRunStateStore {
    dir: PathBuf,
}

impl FileRunStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 文件名用run_id的MD5，避免run_id中的特殊字符
    fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        let mut hasher = Md5::new();
        hasher.update(run_id.as_bytes());
        self.dir.join(format!("{:x}.json", hasher.finalize()))
    }

    async fn read_checkpoint(&self, path: &PathBuf) -> Result<Checkpoint, StoreError> {
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl RunStateStore for FileRunStateStore {
    async fn save(&self, run_id: &str, state: &RunState) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.checkpoint_path(run_id);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(&Checkpoint::new(state.clone()))?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        let path = self.checkpoint_path(run_id);
        if !path.exists() {
            return Err(StoreError::NotFound(run_id.to_string()));
        }
        self.read_checkpoint(&path).await?.into_state()
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_checkpoint(&path).await {
                Ok(checkpoint) => ids.push(checkpoint.state.run.run_id),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "跳过无法读取的检查点"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn discard(&self, run_id: &str) -> Result<bool, StoreError> {
        let path = self.checkpoint_path(run_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
