//! In-memory source used by unit tests in place of a live database.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::{ByteStream, ConnectionCheck, ConnectionDescriptor, Connector, DataSource};
use crate::catalog::{DatabaseObject, EstimatedSize, ObjectId, ObjectKind};
use crate::errors::{BackupError, Result};
use crate::export::FormatOptions;

pub(crate) fn fake_object(id: &str, kind: ObjectKind, bytes: u64) -> DatabaseObject {
    let (schema, name) = id.split_once('.').unwrap_or(("public", id));
    DatabaseObject {
        id: ObjectId::from(id),
        schema: schema.to_string(),
        name: name.to_string(),
        kind,
        estimated_size: EstimatedSize {
            rows: kind.has_rows().then_some(bytes / 10),
            bytes: Some(bytes),
        },
        depends_on: Vec::new(),
    }
}

/// Deterministic payload for one object.
pub(crate) fn payload_chunk(id: &str, index: usize) -> Vec<u8> {
    format!("-- {} chunk {}\nINSERT INTO t VALUES ({});\n", id, index, index).into_bytes()
}

struct InFlight {
    current: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(current: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        InFlight {
            current: Arc::clone(current),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeSource {
    objects: Vec<DatabaseObject>,
    chunks: usize,
    delay: Option<Duration>,
    fail_open: HashSet<String>,
    fail_mid_stream: HashSet<String>,
    fail_catalog: bool,
    gate: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakeSource {
    pub(crate) fn with_objects(objects: Vec<DatabaseObject>) -> Self {
        Self {
            objects,
            chunks: 3,
            delay: None,
            fail_open: HashSet::new(),
            fail_mid_stream: HashSet::new(),
            fail_catalog: false,
            gate: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn chunks(mut self, chunks: usize) -> Self {
        self.chunks = chunks;
        self
    }

    /// Sleep before every chunk.
    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn fail_open(mut self, id: &str) -> Self {
        self.fail_open.insert(id.to_string());
        self
    }

    /// Yield one chunk, then fail.
    pub(crate) fn fail_mid_stream(mut self, id: &str) -> Self {
        self.fail_mid_stream.insert(id.to_string());
        self
    }

    pub(crate) fn fail_catalog(mut self) -> Self {
        self.fail_catalog = true;
        self
    }

    /// Every export waits for a permit before its first chunk.
    pub(crate) fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Highest number of export streams alive at once.
    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn expected_payload(&self, id: &str) -> Vec<u8> {
        (0..self.chunks).flat_map(|i| payload_chunk(id, i)).collect()
    }
}

#[async_trait]
impl DataSource for FakeSource {
    fn list_objects(&self) -> BoxStream<'static, Result<DatabaseObject>> {
        if self.fail_catalog {
            return stream::iter(vec![Err(BackupError::Query(
                "permission denied for table pg_class".into(),
            ))])
            .boxed();
        }
        stream::iter(self.objects.clone().into_iter().map(Ok)).boxed()
    }

    async fn open_export(&self, object: &DatabaseObject, _options: &FormatOptions) -> Result<ByteStream> {
        let id = object.id.to_string();
        if self.fail_open.contains(&id) {
            return Err(BackupError::export(id, "relation does not exist"));
        }

        let guard = InFlight::enter(&self.in_flight, &self.peak);
        let chunks = self.chunks;
        let delay = self.delay;
        let gate = self.gate.clone();
        let fail_mid = self.fail_mid_stream.contains(&id);

        let stream = async_stream::try_stream! {
            let _guard = guard;
            if let Some(gate) = gate {
                let _ = gate.acquire().await;
            }
            for index in 0..chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if fail_mid && index == 1 {
                    Err::<(), _>(BackupError::export(id.clone(), "server closed the connection unexpectedly"))?;
                }
                yield payload_chunk(&id, index);
            }
        };
        Ok(stream.boxed())
    }
}

pub(crate) struct FakeConnector {
    source: Option<Arc<FakeSource>>,
}

impl FakeConnector {
    pub(crate) fn new(source: Arc<FakeSource>) -> Self {
        Self { source: Some(source) }
    }

    pub(crate) fn unreachable() -> Self {
        Self { source: None }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn DataSource>> {
        match &self.source {
            Some(source) => Ok(source.clone() as Arc<dyn DataSource>),
            None => Err(BackupError::Connection(format!(
                "connection to {}:{} refused",
                descriptor.host, descriptor.port
            ))),
        }
    }

    async fn test_connection(&self, descriptor: &ConnectionDescriptor) -> ConnectionCheck {
        match self.connect(descriptor).await {
            Ok(_) => ConnectionCheck::ok("Connection successful!"),
            Err(e) => ConnectionCheck::failed(e.to_string()),
        }
    }
}
