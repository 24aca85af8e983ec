//! In-memory provider for testing.

use crate::error::{ProviderError, ProviderResult};
use crate::id::ObjectId;
use crate::provider::{read_to_vec, stream_from_bytes, ByteStream, IdStream, Provider};
use crate::status::{run_init, ProviderStatus, StatusCell};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// An in-memory provider.
///
/// This provider keeps all objects in a map and is suitable for:
/// - Unit tests
/// - Engine tests that need several independent remotes
/// - Fault injection via [`set_offline`](Self::set_offline)
///
/// # Thread Safety
///
/// This provider is thread-safe and can be shared across tasks.
#[derive(Debug)]
pub struct MemoryProvider {
    name: String,
    objects: RwLock<HashMap<ObjectId, Bytes>>,
    status: StatusCell,
    offline: AtomicBool,
    mutations: AtomicU64,
}

impl MemoryProvider {
    /// Creates a new empty provider.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
            status: StatusCell::new(),
            offline: AtomicBool::new(false),
            mutations: AtomicU64::new(0),
        }
    }

    /// Simulates losing (or regaining) the connection.
    ///
    /// While offline, `init` attempts and every CRUD call fail with a
    /// retryable transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Returns the number of stored objects, reserved ones included.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns the raw stored bytes of an object.
    ///
    /// Useful for asserting that content at rest is not plaintext.
    #[must_use]
    pub fn raw(&self, id: &ObjectId) -> Option<Bytes> {
        self.objects.read().get(id).cloned()
    }

    /// Overwrites the raw bytes of an existing object, bypassing the contract.
    ///
    /// Useful for corrupting ciphertext in tests.
    pub fn tamper(&self, id: &ObjectId, bytes: Vec<u8>) -> bool {
        match self.objects.write().get_mut(id) {
            Some(slot) => {
                *slot = Bytes::from(bytes);
                true
            }
            None => false,
        }
    }

    /// Returns how many successful post/put/delete/create calls were served.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    fn check(&self) -> ProviderResult<()> {
        self.status.require_ready()?;
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::transport_retryable(format!(
                "{}: connection lost",
                self.name
            )));
        }
        Ok(())
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    fn status(&self) -> ProviderStatus {
        self.status.get()
    }

    async fn init_cancellable(
        &self,
        retry_attempts: u32,
        cancel: &CancellationToken,
    ) -> ProviderStatus {
        run_init(&self.status, &self.name, retry_attempts, cancel, || async {
            if self.offline.load(Ordering::SeqCst) {
                Err(ProviderError::transport_retryable("connection refused"))
            } else {
                Ok(())
            }
        })
        .await
    }

    async fn post(&self, content: ByteStream) -> ProviderResult<ObjectId> {
        self.check()?;
        let data = read_to_vec(content).await?;
        // Re-check: the connection may have dropped during the transfer.
        self.check()?;
        let id = ObjectId::generate();
        self.objects.write().insert(id.clone(), Bytes::from(data));
        self.record_mutation();
        Ok(id)
    }

    async fn get(&self, id: &ObjectId) -> ProviderResult<ByteStream> {
        self.check()?;
        let data = self
            .objects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(id))?;
        Ok(stream_from_bytes(data))
    }

    async fn put(&self, id: &ObjectId, content: ByteStream) -> ProviderResult<()> {
        self.check()?;
        if !self.objects.read().contains_key(id) {
            return Err(ProviderError::not_found(id));
        }
        let data = read_to_vec(content).await?;
        self.check()?;
        match self.objects.write().get_mut(id) {
            Some(slot) => *slot = Bytes::from(data),
            None => return Err(ProviderError::not_found(id)),
        }
        self.record_mutation();
        Ok(())
    }

    async fn delete(&self, id: &ObjectId) -> ProviderResult<()> {
        self.check()?;
        self.objects
            .write()
            .remove(id)
            .ok_or_else(|| ProviderError::not_found(id))?;
        self.record_mutation();
        Ok(())
    }

    async fn create(&self, id: &ObjectId, content: ByteStream) -> ProviderResult<()> {
        self.check()?;
        if !id.is_reserved() {
            return Err(ProviderError::InvalidId(format!(
                "{id} is not a reserved id"
            )));
        }
        let data = read_to_vec(content).await?;
        self.check()?;
        let mut objects = self.objects.write();
        if objects.contains_key(id) {
            return Err(ProviderError::AlreadyExists { id: id.to_string() });
        }
        objects.insert(id.clone(), Bytes::from(data));
        drop(objects);
        self.record_mutation();
        Ok(())
    }

    fn list(&self) -> IdStream<'_> {
        let items: Vec<ProviderResult<ObjectId>> = match self.check() {
            Ok(()) => self.objects.read().keys().cloned().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        Box::pin(stream::iter(items))
    }

    async fn close(&self) -> ProviderResult<()> {
        self.status.reset();
        Ok(())
    }
}
