use std::fs::File;
use std::io::Read;

use anyhow::{bail, Context, Error};

use ostar_tools::io::{NoClose, WriteClose};

use super::{Backend, ObjectMetadata};
use crate::locator::{Reference, ReferenceKind};

/// Local files, plus the process' standard streams for `-`.
#[derive(Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for LocalBackend {
    fn stat(&self, reference: &Reference) -> Result<u64, Error> {
        if reference.kind != ReferenceKind::Local {
            bail!("cannot stat {}", reference);
        }
        let metadata = std::fs::metadata(&reference.path)
            .with_context(|| format!("failed to stat {:?}", reference.path))?;
        Ok(metadata.len())
    }

    fn open_read(&self, reference: &Reference) -> Result<(Box<dyn Read + Send>, Option<u64>), Error> {
        match reference.kind {
            ReferenceKind::Stdio => Ok((Box::new(std::io::stdin()), None)),
            ReferenceKind::Local => {
                let file = File::open(&reference.path)
                    .with_context(|| format!("failed to open {:?}", reference.path))?;
                let size = file.metadata().ok().map(|m| m.len());
                Ok((Box::new(file), size))
            }
            ReferenceKind::ObjectStore => bail!("{} is not a local reference", reference),
        }
    }

    fn open_write(
        &self,
        reference: &Reference,
        _metadata: &ObjectMetadata,
    ) -> Result<Box<dyn WriteClose>, Error> {
        match reference.kind {
            ReferenceKind::Stdio => Ok(Box::new(NoClose::new(std::io::stdout()))),
            ReferenceKind::Local => {
                let file = File::create(&reference.path)
                    .with_context(|| format!("failed to create {:?}", reference.path))?;
                Ok(Box::new(file))
            }
            ReferenceKind::ObjectStore => bail!("{} is not a local reference", reference),
        }
    }
}
