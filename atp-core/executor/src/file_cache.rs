//! 资源文件缓存
//!
//! 缓存目录中每个资源对应三个文件：
//! - `<name>`：数据文件
//! - `<name>.lock`：下载锁（`create_new` 创建，谁创建成功谁负责下载）
//! - `<name>.done`：完成标记，数据文件写完并改名后才写入
//!
//! 只有存在完成标记时才返回数据文件路径，不会读到写了一半的文件。
//!
//! 同一实例被多个运行共享。每次 `fetch` 登记一个持有者，运行结束时用
//! [`FileCache::release`] 归还；本实例下载的文件在最后一个持有者归还后删除，
//! 缓存目录中原有的文件保留。

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::definition::ResourceRef;
use crate::{ExecutorError, Result};

/// 资源文件缓存
#[derive(Debug)]
pub struct FileCache {
    root: PathBuf,
    poll_interval: Duration,
    wait_timeout: Duration,
    holders: Mutex<Holders>,
}

#[derive(Debug, Default)]
struct Holders {
    /// 数据文件 -> 持有的运行数
    counts: HashMap<PathBuf, usize>,
    /// 本实例下载的数据文件
    downloaded: HashSet<PathBuf>,
}

impl FileCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            poll_interval: Duration::from_millis(50),
            wait_timeout: Duration::from_secs(60),
            holders: Mutex::new(Holders::default()),
        }
    }

    /// 设置等待其他下载者的超时
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, name: &str) -> Result<(PathBuf, PathBuf, PathBuf)> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(ExecutorError::FileCache(format!("非法的资源名称: {}", name)));
        }
        Ok((
            self.root.join(name),
            self.root.join(format!("{}.lock", name)),
            self.root.join(format!("{}.done", name)),
        ))
    }

    /// 获取资源，返回缓存中的文件路径
    ///
    /// 成功返回后调用方成为该文件的持有者，用完需 [`release`](Self::release)。
    pub async fn fetch(&self, resource: &ResourceRef) -> Result<PathBuf> {
        let (data, lock, done) = self.paths(&resource.name)?;

        // 先登记持有者，归还方看到非零计数就不会删除
        *self.holders.lock().await.counts.entry(data.clone()).or_insert(0) += 1;
        let result = self.acquire(resource, &data, &lock, &done).await;
        if result.is_err() {
            self.drop_holder(&data).await;
        }
        result
    }

    async fn drop_holder(&self, data: &Path) {
        let mut holders = self.holders.lock().await;
        if let Some(count) = holders.counts.get_mut(data) {
            *count -= 1;
            if *count == 0 {
                holders.counts.remove(data);
            }
        }
    }

    async fn acquire(
        &self,
        resource: &ResourceRef,
        data: &Path,
        lock: &Path,
        done: &Path,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).await?;

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            if fs::try_exists(done).await? {
                debug!("资源 {} 命中缓存", resource.name);
                return Ok(data.to_path_buf());
            }

            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(lock)
                .await
            {
                Ok(_) => {
                    if fs::try_exists(done).await? {
                        let _ = fs::remove_file(lock).await;
                        return Ok(data.to_path_buf());
                    }
                    let result = self.download(resource, data, done).await;
                    if let Err(e) = fs::remove_file(lock).await {
                        warn!("删除锁文件 {} 失败: {}", lock.display(), e);
                    }
                    result?;
                    self.holders
                        .lock()
                        .await
                        .downloaded
                        .insert(data.to_path_buf());
                    return Ok(data.to_path_buf());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(ExecutorError::FileCache(format!(
                            "等待资源 {} 下载超时",
                            resource.name
                        )));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn download(&self, resource: &ResourceRef, data: &Path, done: &Path) -> Result<()> {
        let source = resource
            .source
            .strip_prefix("file://")
            .unwrap_or(&resource.source);
        info!("下载资源 {} <- {}", resource.name, source);

        let partial = self.root.join(format!("{}.part", resource.name));
        fs::copy(source, &partial).await.map_err(|e| {
            ExecutorError::FileCache(format!("复制资源 {} 失败: {}", resource.name, e))
        })?;
        fs::rename(&partial, data).await?;
        fs::write(done, b"").await?;
        Ok(())
    }

    /// 归还一次运行持有的文件，返回删除的文件数
    ///
    /// 只删除本实例下载且已无其他持有者的文件。删除在持有者表的锁内完成，
    /// 并发的 `fetch` 要么先登记而阻止删除，要么在删除后重新下载。
    pub async fn release(&self, files: &[PathBuf]) -> usize {
        let mut holders = self.holders.lock().await;
        let mut removed = 0;
        for data in files {
            let Some(count) = holders.counts.get_mut(data) else {
                warn!("归还未持有的缓存文件 {}", data.display());
                continue;
            };
            *count -= 1;
            if *count > 0 {
                continue;
            }
            holders.counts.remove(data);
            if !holders.downloaded.remove(data) {
                continue;
            }

            let mut done = data.clone().into_os_string();
            done.push(".done");
            // 完成标记先于数据文件删除
            let _ = fs::remove_file(PathBuf::from(done)).await;
            match fs::remove_file(data).await {
                Ok(_) => removed += 1,
                Err(e) => warn!("清理缓存文件 {} 失败: {}", data.display(), e),
            }
        }
        removed
    }

    /// 当前被运行持有的文件数
    pub async fn held(&self) -> usize {
        self.holders.lock().await.counts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn resource(source: &Path, name: &str) -> ResourceRef {
        ResourceRef {
            source: source.display().to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("input.txt");
        std::fs::write(&source, b"hello").unwrap();

        let cache = FileCache::new(dir.path().join("cache"));
        let path = cache.fetch(&resource(&source, "data.txt")).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert!(dir.path().join("cache/data.txt.done").exists());
        assert!(!dir.path().join("cache/data.txt.lock").exists());

        assert_eq!(cache.release(&[path.clone()]).await, 1);
        assert!(!path.exists());
        assert_eq!(cache.held().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_fetchers_share_one_download() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("input.bin");
        std::fs::write(&source, vec![7u8; 4096]).unwrap();

        let cache = Arc::new(FileCache::new(dir.path().join("cache")));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let res = resource(&source, "shared.bin");
                tokio::spawn(async move { cache.fetch(&res).await })
            })
            .collect();

        let mut paths = Vec::new();
        for handle in handles {
            let path = handle.await.unwrap().unwrap();
            assert_eq!(std::fs::read(&path).unwrap().len(), 4096);
            paths.push(path);
        }

        // 前三个持有者归还后文件仍在
        assert_eq!(cache.release(&paths[..3]).await, 0);
        assert!(paths[3].exists());
        assert_eq!(cache.release(&paths[3..]).await, 1);
        assert!(!paths[3].exists());
    }

    #[tokio::test]
    async fn test_preexisting_file_survives_release() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("kept.bin"), b"old").unwrap();
        std::fs::write(root.join("kept.bin.done"), b"").unwrap();

        let cache = FileCache::new(&root);
        let path = cache
            .fetch(&resource(&dir.path().join("missing"), "kept.bin"))
            .await
            .unwrap();
        assert_eq!(cache.release(&[path.clone()]).await, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_failed_fetch_holds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache"));
        assert!(cache
            .fetch(&resource(&dir.path().join("missing"), "gone.bin"))
            .await
            .is_err());
        assert_eq!(cache.held().await, 0);
    }

    #[tokio::test]
    async fn test_waits_for_foreign_lock_then_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("busy.bin.lock"), b"").unwrap();

        let cache = FileCache::new(&root)
            .with_wait_timeout(Duration::from_millis(100))
            .with_poll_interval(Duration::from_millis(10));
        let err = cache
            .fetch(&resource(&dir.path().join("missing"), "busy.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::FileCache(_)));
    }

    #[tokio::test]
    async fn test_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let err = cache
            .fetch(&resource(dir.path(), "../escape"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::FileCache(_)));
    }
}
