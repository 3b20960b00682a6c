//! 会话快照持久化
//!
//! 每次状态迁移后写入 (状态, 上下文) 快照；进程重启时据此恢复会话。
//! 提供内存实现与 JSON 文件实现（每个会话一个文件）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::MachineSnapshot;

/// 快照存储接口
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> anyhow::Result<Option<MachineSnapshot>>;

    async fn save(&self, conversation_id: &str, snapshot: &MachineSnapshot) -> anyhow::Result<()>;
}

/// 内存快照存储
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, MachineSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, conversation_id: &str) -> anyhow::Result<Option<MachineSnapshot>> {
        Ok(self.snapshots.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, conversation_id: &str, snapshot: &MachineSnapshot) -> anyhow::Result<()> {
        self.snapshots
            .write()
            .await
            .insert(conversation_id.to_string(), snapshot.clone());
        Ok(())
    }
}

/// JSON 文件快照存储：{dir}/{conversation_id}.json
#[derive(Debug)]
pub struct JsonFileSnapshotStore {
    dir: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// 会话 id 中的路径分隔符等字符替换为下划线
    fn path_for(&self, conversation_id: &str) -> PathBuf {
        let file: String = conversation_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    /// 文件不存在时返回 None
    async fn load(&self, conversation_id: &str) -> anyhow::Result<Option<MachineSnapshot>> {
        let path = self.path_for(conversation_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// 先写临时文件再重命名，避免半写入的快照；目录不存在时自动创建。
    /// 每次写入使用独立的临时文件名，并发写入互不覆盖
    async fn save(&self, conversation_id: &str, snapshot: &MachineSnapshot) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(conversation_id);
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_string_pretty(snapshot)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConversationContext, ConversationState};
    use crate::memory::Message;

    fn snapshot(generation: u64) -> MachineSnapshot {
        let mut context = ConversationContext::new("team/c1", "sales", "mock");
        context.generation = generation;
        context.history = vec![Message::user("hello"), Message::assistant("hi")];
        MachineSnapshot {
            state: ConversationState::Idle,
            context,
        }
    }

    #[tokio::test]
    async fn test_json_store_roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSnapshotStore::new(dir.path().join("snapshots"));

        assert!(store.load("team/c1").await.unwrap().is_none());
        store.save("team/c1", &snapshot(1)).await.unwrap();
        store.save("team/c1", &snapshot(2)).await.unwrap();

        let loaded = store.load("team/c1").await.unwrap().unwrap();
        assert_eq!(loaded.context.generation, 2);
        assert_eq!(loaded.context.history.len(), 2);
        assert!(dir.path().join("snapshots/team_c1.json").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_json_store_concurrent_saves_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JsonFileSnapshotStore::new(dir.path()));

        for round in 0..50u64 {
            let a = {
                let store = store.clone();
                tokio::spawn(async move { store.save("c1", &snapshot(round * 2)).await })
            };
            let b = {
                let store = store.clone();
                tokio::spawn(async move { store.save("c1", &snapshot(round * 2 + 1)).await })
            };
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();

            let loaded = store.load("c1").await.unwrap().unwrap();
            assert!(loaded.context.generation / 2 == round);
        }

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_json_store_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = JsonFileSnapshotStore::new(dir.path());
        assert!(store.load("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemorySnapshotStore::new();
        store.save("c1", &snapshot(3)).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(
            store.load("c1").await.unwrap().unwrap().context.generation,
            3
        );
    }
}
