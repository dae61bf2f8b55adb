pub mod fixtures;
pub mod reader;
pub mod shared;

use anyhow::Context as _;
use futures::FutureExt as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dicom_index::db::{DatabaseWrapper, IndexOperations, SqliteDatabase, Transaction};
use dicom_index::find::FindRequest;
use dicom_index::finder::ResourceFinder;
use dicom_index::models::{ResourceType, TransactionType};
use dicom_index::Config;

// Re-export commonly used items
pub use fixtures::*;
pub use reader::CountingReader;

/// A private in-memory index.
pub struct TestIndex {
    pub database: Arc<SqliteDatabase>,
    pub index: IndexOperations,
    pub config: Config,
}

impl TestIndex {
    pub async fn new(native_find: bool) -> anyhow::Result<Self> {
        Self::new_with_config(native_find, |_| {}).await
    }

    pub async fn new_with_config(
        native_find: bool,
        configure: impl FnOnce(&mut Config),
    ) -> anyhow::Result<Self> {
        let shared = shared::shared().await?;
        let mut config = shared.base_config.clone();
        config.database.enable_native_find = native_find;
        configure(&mut config);

        let registry = Arc::new(config.registry.build().context("build registry")?);
        let database = Arc::new(SqliteDatabase::new(
            config.database.clone(),
            registry.clone(),
        ));
        database.open().await.context("open in-memory index")?;
        let index = IndexOperations::new(database.clone(), registry);

        Ok(Self {
            database,
            index,
            config,
        })
    }

    pub fn native_find(&self) -> bool {
        self.index.capabilities().has_find_support
    }

    /// Backend name for assertion messages.
    pub fn backend(&self) -> &'static str {
        if self.native_find() {
            "native"
        } else {
            "compatibility"
        }
    }

    pub fn finder(&self, level: ResourceType, expand: bool) -> anyhow::Result<ResourceFinder> {
        Ok(ResourceFinder::new(level, expand)?.with_config(&self.config.find))
    }

    /// Sorted public ids answered by the index for `request`.
    pub async fn find_ids(&self, request: &FindRequest) -> anyhow::Result<Vec<String>> {
        let response = self.index.execute_find(request).await?;
        Ok(sorted(response.iter().map(|resource| resource.public_id())))
    }

    pub async fn transaction(&self, kind: TransactionType) -> anyhow::Result<Box<dyn Transaction>> {
        Ok(self.database.start_transaction(kind).await?)
    }

    pub async fn cleanup(self) -> anyhow::Result<()> {
        self.database.close().await?;
        Ok(())
    }
}

type TestFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + 'a>>;

pub async fn with_test_index<F>(native_find: bool, f: F) -> anyhow::Result<()>
where
    F: for<'a> FnOnce(&'a TestIndex) -> TestFuture<'a>,
{
    let index = TestIndex::new(native_find).await?;

    let result = std::panic::AssertUnwindSafe(f(&index)).catch_unwind().await;
    if let Err(e) = index.cleanup().await {
        eprintln!("test index cleanup failed: {e:?}");
    }

    match result {
        Ok(r) => r,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Runs `f` against the native-find backend, then against the
/// compatibility layer, each on a fresh index.
pub async fn with_both_backends<F>(f: F) -> anyhow::Result<()>
where
    F: for<'a> Fn(&'a TestIndex) -> TestFuture<'a>,
{
    for native_find in [true, false] {
        with_test_index(native_find, &f).await?;
    }
    Ok(())
}
