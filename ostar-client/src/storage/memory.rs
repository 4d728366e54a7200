//! In-process object store, used by tests and embedders without network access.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};

use ostar_tools::io::WriteClose;

use super::{pipe, Backend, ObjectMetadata};
use crate::locator::{Reference, ReferenceKind};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub metadata: ObjectMetadata,
}

type ObjectMap = BTreeMap<(String, String), StoredObject>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<ObjectMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<ObjectMap>, Error> {
        self.objects
            .lock()
            .map_err(|_| format_err!("memory store lock poisoned"))
    }

    pub fn insert(&self, bucket: &str, key: &str, data: Vec<u8>, metadata: ObjectMetadata) {
        if let Ok(mut objects) = self.lock() {
            objects.insert(
                (bucket.to_string(), key.to_string()),
                StoredObject { data, metadata },
            );
        }
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.lock()
            .ok()?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys stored in `bucket`, in lexical order.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        match self.lock() {
            Ok(objects) => objects
                .keys()
                .filter(|(b, _)| b == bucket)
                .map(|(_, key)| key.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn lookup(&self, reference: &Reference) -> Result<StoredObject, Error> {
        if reference.kind != ReferenceKind::ObjectStore {
            bail!("{} is not an object reference", reference);
        }
        self.get(&reference.bucket, &reference.key)
            .ok_or_else(|| format_err!("object {} not found", reference))
    }
}

impl Backend for MemoryStore {
    fn stat(&self, reference: &Reference) -> Result<u64, Error> {
        Ok(self.lookup(reference)?.data.len() as u64)
    }

    fn open_read(&self, reference: &Reference) -> Result<(Box<dyn Read + Send>, Option<u64>), Error> {
        let object = self.lookup(reference)?;
        let size = object.data.len() as u64;
        Ok((Box::new(Cursor::new(object.data)), Some(size)))
    }

    fn open_write(
        &self,
        reference: &Reference,
        metadata: &ObjectMetadata,
    ) -> Result<Box<dyn WriteClose>, Error> {
        if reference.kind != ReferenceKind::ObjectStore {
            bail!("{} is not an object reference", reference);
        }

        let (writer, mut reader) = pipe();
        let store = self.clone();
        let bucket = reference.bucket.clone();
        let key = reference.key.clone();
        let metadata = metadata.clone();

        std::thread::spawn(move || {
            let mut data = Vec::new();
            let result = loop {
                match reader.blocking_next_chunk() {
                    Ok(Some(chunk)) => data.extend_from_slice(&chunk),
                    Ok(None) => {
                        store.insert(&bucket, &key, data, metadata);
                        break Ok(());
                    }
                    Err(err) => break Err(err),
                }
            };
            reader.complete(result);
        });

        Ok(Box::new(writer))
    }
}
