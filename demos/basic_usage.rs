//! Basic usage example of the query cache.
//!
//! Run with: RUST_LOG=query_kit=debug cargo run --example basic_usage

use query_kit::{
    query_key, AbortSignal, FetchError, MutationOptions, QueryClient, QueryKey, QueryOptions,
    RetryDelay, StoreConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Example resource: Repository
#[derive(Clone, Serialize, Deserialize, Debug)]
struct Repository {
    id: String,
    name: String,
    stars: u32,
}

/// Mock API that simulates remote access
#[derive(Clone, Default)]
struct RepositoryApi {
    calls: Arc<AtomicU32>,
    flaky_attempts: Arc<AtomicU32>,
}

impl RepositoryApi {
    async fn fetch_repository(
        &self,
        id: &str,
        signal: AbortSignal,
    ) -> Result<Repository, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        println!("  [API] GET /repos/{} (call #{})", id, call);

        tokio::select! {
            _ = signal.aborted() => return Err(FetchError::aborted()),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        match id {
            "r1" => Ok(Repository {
                id: id.to_string(),
                name: "query-kit".to_string(),
                stars: 42,
            }),
            // First call fails with a transient error, later calls succeed
            "flaky" if self.flaky_attempts.fetch_add(1, Ordering::SeqCst) == 0 => {
                Err(FetchError::status(503, "service unavailable"))
            }
            "flaky" => Ok(Repository {
                id: id.to_string(),
                name: "flaky".to_string(),
                stars: 1,
            }),
            _ => Err(FetchError::status(404, format!("repository {} not found", id))),
        }
    }

    async fn star(&self, id: String, _signal: AbortSignal) -> Result<u32, FetchError> {
        println!("  [API] PUT /user/starred/{}", id);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(43)
    }
}

fn repo_key(id: &str) -> QueryKey {
    query_key!["repo", id]
}

#[tokio::main]
async fn main() -> query_kit::Result<()> {
    env_logger::init();

    println!("=== query-kit Basic Usage Example ===\n");

    let client = QueryClient::with_config(
        StoreConfig::default()
            .with_max_entries(50)
            .with_cache_time(Duration::from_secs(60)),
    );
    let api = RepositoryApi::default();
    let options = QueryOptions::<Repository>::default()
        .with_stale_time(Duration::from_secs(30))
        .with_retry_delay(RetryDelay::Fixed(Duration::from_millis(100)))
        .on_success(|repo| println!("  [onSuccess] {} has {} stars", repo.name, repo.stars));

    // Example 1: Concurrent callers share one request
    println!("1. Concurrent fetches (deduplicated):");
    let key = repo_key("r1");
    let fetch_r1 = |signal: AbortSignal| {
        let api = api.clone();
        async move { api.fetch_repository("r1", signal).await }
    };
    let (a, b) = tokio::join!(
        client.fetch(&key, fetch_r1, &options),
        client.fetch(&key, fetch_r1, &options),
    );
    println!("   Results: {} / {}\n", a?.stars, b?.stars);

    // Example 2: Fresh data is served from cache
    println!("2. Query (fresh cache hit):");
    let repo = client.query(&key, fetch_r1, &options).await?;
    println!("   Cached: {:?}\n", repo);

    // Example 3: Retry with backoff
    println!("3. Retry of a transient failure:");
    let flaky = client
        .fetch(
            &repo_key("flaky"),
            |signal: AbortSignal| {
                let api = api.clone();
                async move { api.fetch_repository("flaky", signal).await }
            },
            &options,
        )
        .await?;
    println!("   Recovered: {}\n", flaky.name);

    // Example 4: Terminal failure
    println!("4. Terminal failure (no retry):");
    match client
        .fetch(
            &repo_key("missing"),
            |signal: AbortSignal| {
                let api = api.clone();
                async move { api.fetch_repository("missing", signal).await }
            },
            &options,
        )
        .await
    {
        Ok(_) => println!("   Unexpected success\n"),
        Err(e) => println!("   Failed: {}\n", e),
    }

    // Example 5: Mutation, then invalidate the affected queries
    println!("5. Mutation + invalidation:");
    let invalidator = client.clone();
    let star = client.mutation(
        {
            let api = api.clone();
            move |id: String, signal: AbortSignal| {
                let api = api.clone();
                async move { api.star(id, signal).await }
            }
        },
        MutationOptions::default().on_success(move |stars: &u32, id: &String| {
            println!("   [onSuccess] {} now has {} stars", id, stars);
            invalidator.invalidate_queries(Some(&repo_key(id)));
        }),
    );
    star.mutate_async("r1".to_string()).await?;
    let state = client.get_query_state(&key).map(|s| s.status);
    println!("   r1 status after invalidation: {:?}\n", state);

    // Example 6: Stats
    println!("6. Cache stats:");
    for entry in client.get_stats().entries {
        println!(
            "   {} -> {} (age {:?})",
            entry.key, entry.status, entry.age
        );
    }
    println!(
        "\n   API calls made: {}",
        api.calls.load(Ordering::SeqCst)
    );

    Ok(())
}
