use crate::client::{ClientError, ExamServiceClient};
use crate::counter;
use crate::metrics_defs::ITEM_VERSIONS_FETCHED;
use crate::types::ItemVersion;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};

/// Looks up item version metadata for one export run.
///
/// Every id is fetched at most once per resolver. Ids missing from the cache
/// are fetched concurrently, at most `concurrency` requests at a time, and
/// all of them complete before `resolve` returns.
pub struct ItemDetailResolver {
    client: ExamServiceClient,
    exam_id: String,
    token: String,
    concurrency: usize,
    cache: HashMap<String, ItemVersion>,
}

impl ItemDetailResolver {
    pub fn new(
        client: ExamServiceClient,
        exam_id: String,
        token: String,
        concurrency: usize,
    ) -> Self {
        ItemDetailResolver {
            client,
            exam_id,
            token,
            concurrency: concurrency.max(1),
            cache: HashMap::new(),
        }
    }

    pub fn cached(&self) -> &HashMap<String, ItemVersion> {
        &self.cache
    }

    pub async fn resolve<'i, I>(
        &mut self,
        ids: I,
    ) -> Result<&HashMap<String, ItemVersion>, ClientError>
    where
        I: IntoIterator<Item = &'i str>,
    {
        let missing: HashSet<&str> = ids
            .into_iter()
            .filter(|id| !self.cache.contains_key(*id))
            .collect();

        if missing.is_empty() {
            return Ok(&self.cache);
        }
        let missing: Vec<String> = missing.into_iter().map(String::from).collect();

        // Owned inputs keep the resolve future `Send`.
        let client = self.client.clone();
        let exam_id = self.exam_id.clone();
        let token = self.token.clone();

        let fetched: Vec<ItemVersion> = stream::iter(missing)
            .map(move |id: String| {
                let client = client.clone();
                let exam_id = exam_id.clone();
                let token = token.clone();
                async move {
                    counter!(ITEM_VERSIONS_FETCHED).increment(1);
                    client.item_version(&exam_id, &token, &id).await
                }
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        tracing::debug!(
            exam_id = %self.exam_id,
            fetched = fetched.len(),
            "Resolved item versions"
        );

        for version in fetched {
            self.cache.insert(version.id.clone(), version);
        }
        Ok(&self.cache)
    }
}
