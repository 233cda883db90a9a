// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers acting as remote origin
//! streams.

use global_sync::{DocumentStore, LocalOperation, RedisSource, SourceConfig};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A remote origin: its own local store whose operation stream is
/// published into Redis.
pub struct TestOrigin<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub origin_id: String,
    pub redis_url: String,
    pub store: DocumentStore,
    pub stream: RedisSource,
}

impl<'a> TestOrigin<'a> {
    pub async fn new(docker: &'a Cli, origin_id: &str) -> TestOrigin<'a> {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        let config = SourceConfig::redis(origin_id, &redis_url);
        let stream = RedisSource::from_config(&config).unwrap();
        stream.connect().await.unwrap();
        let store = DocumentStore::open(origin_id, ":memory:", false)
            .await
            .unwrap();
        Self {
            container,
            origin_id: origin_id.to_string(),
            redis_url,
            store,
            stream,
        }
    }

    /// Source config a node uses to tail this origin.
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig::redis(&self.origin_id, &self.redis_url)
    }

    /// Publish one operation to the origin stream.
    pub async fn publish(&self, op: &LocalOperation) {
        self.stream.publish(op).await.unwrap();
    }

    /// Stream length, via a plain connection.
    pub async fn stream_len(&self) -> redis::RedisResult<usize> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        use redis::AsyncCommands;
        conn.xlen(self.stream.stream_key()).await
    }
}
