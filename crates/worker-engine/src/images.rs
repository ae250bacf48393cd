use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::runtime::{ContainerRuntime, RuntimeError};

/// Tracks container image disk usage and evicts unused images over quota.
///
/// The engine refuses to delete images backing live containers, so a failed
/// removal is benign here; the next pass retries.
pub(crate) struct ImageCache {
    runtime: Arc<dyn ContainerRuntime>,
    quota_bytes: Option<u64>,
    last_used: Mutex<HashMap<String, i64>>,
}

impl ImageCache {
    pub(crate) fn new(runtime: Arc<dyn ContainerRuntime>, quota_bytes: Option<u64>) -> Self {
        Self {
            runtime,
            quota_bytes,
            last_used: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure the image (and requested digest, when given) is present
    /// locally, pulling it if not, and stamp it as recently used.
    pub(crate) async fn ensure(
        &self,
        reference: &str,
        digest: Option<&str>,
    ) -> Result<(), RuntimeError> {
        if !self.runtime.image_present(reference, digest).await? {
            log::debug!("pulling image {reference}");
            self.runtime.pull_image(reference).await?;
        }
        self.touch(reference);
        Ok(())
    }

    pub(crate) fn touch(&self, reference: &str) {
        let mut last_used = self.last_used.lock().expect("image cache lock poisoned");
        last_used.insert(reference.to_string(), chrono::Utc::now().timestamp());
    }

    /// One reclamation pass: remove least-recently-used images until the
    /// total fits the quota. Images this worker never used sort oldest.
    pub(crate) async fn cleanup_step(&self) {
        let Some(quota) = self.quota_bytes else {
            return;
        };

        let images = match self.runtime.list_images().await {
            Ok(images) => images,
            Err(err) => {
                log::debug!("image cleanup: cannot list images: {err}");
                return;
            }
        };

        let mut total: u64 = images.iter().map(|image| image.size_bytes).sum();
        if total <= quota {
            return;
        }

        let mut candidates = images;
        {
            let last_used = self.last_used.lock().expect("image cache lock poisoned");
            candidates.sort_by_key(|image| last_used.get(&image.reference).copied().unwrap_or(0));
        }

        for image in candidates {
            if total <= quota {
                break;
            }
            match self.runtime.remove_image(&image.reference).await {
                Ok(()) => {
                    log::debug!(
                        "removed image {} ({} bytes)",
                        image.reference,
                        image.size_bytes
                    );
                    total = total.saturating_sub(image.size_bytes);
                    let mut last_used =
                        self.last_used.lock().expect("image cache lock poisoned");
                    last_used.remove(&image.reference);
                }
                Err(err) => {
                    // Likely in use by a running container; retry next pass.
                    log::debug!("cannot remove image {}: {err}", image.reference);
                }
            }
        }
    }

    /// Background reclamation loop; aborted by the worker on drain.
    pub(crate) async fn run_cleanup(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.cleanup_step().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeRuntime;

    #[tokio::test]
    async fn ensure_pulls_only_missing_images() {
        let runtime = Arc::new(FakeRuntime::new());
        let cache = ImageCache::new(runtime.clone(), None);

        cache.ensure("ubuntu:22.04", None).await.unwrap();
        assert_eq!(runtime.pull_count(), 1);

        // Second ensure sees the image locally.
        cache.ensure("ubuntu:22.04", None).await.unwrap();
        assert_eq!(runtime.pull_count(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_oldest_until_under_quota() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.seed_image("old:1", 600);
        runtime.seed_image("new:1", 600);

        let cache = ImageCache::new(runtime.clone(), Some(1000));
        cache.touch("old:1");
        // Make "new" clearly newer.
        {
            let mut last_used = cache.last_used.lock().unwrap();
            let newer = *last_used.get("old:1").unwrap() + 100;
            last_used.insert("new:1".to_string(), newer);
        }

        cache.cleanup_step().await;

        let left: Vec<String> = runtime
            .list_images()
            .await
            .unwrap()
            .into_iter()
            .map(|image| image.reference)
            .collect();
        assert_eq!(left, vec!["new:1".to_string()]);
    }

    #[tokio::test]
    async fn removal_failure_is_benign() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.seed_image("busy:1", 2000);
        runtime.protect_image("busy:1");

        let cache = ImageCache::new(runtime.clone(), Some(1000));
        cache.cleanup_step().await;

        // Still present; nothing panicked, next pass will retry.
        assert_eq!(runtime.list_images().await.unwrap().len(), 1);
    }
}
