//! Run a create, extract or list operation and classify its outcome.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Error};

use ostar_tools::compression::{new_reader, Compression};

use crate::archive::path::strip_components;
use crate::archive::pattern::MemberFilter;
use crate::archive::{EntryHeader, MetadataFlags};
use crate::error::ArchiveError;
use crate::locator::{self, Reference, ReferenceKind};
use crate::storage::{Backend, LocalBackend};

mod create;
mod extract;
mod list;

pub use create::add_tar_suffix;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Create,
    Extract,
    List,
}

/// Everything a single run needs to know.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub mode: Mode,
    pub archive: String,
    pub members: Vec<String>,
    /// Working directory on create, extraction target (local directory or object prefix)
    /// on extract.
    pub chdir: Option<String>,
    pub compression: Compression,
    pub compression_level: Option<u32>,
    pub suffix: Option<String>,
    pub exclude: Vec<String>,
    pub exclude_from: Vec<PathBuf>,
    pub strip_components: usize,
    pub verbose: bool,
    pub to_stdout: bool,
    pub wildcards: bool,
    pub numeric_owner: bool,
    pub same_owner: Option<bool>,
    pub same_permissions: Option<bool>,
    pub xattrs: bool,
    pub acl: bool,
}

impl RunOptions {
    pub fn new<S: Into<String>>(mode: Mode, archive: S) -> Self {
        Self {
            mode,
            archive: archive.into(),
            members: Vec::new(),
            chdir: None,
            compression: Compression::Auto,
            compression_level: None,
            suffix: None,
            exclude: Vec::new(),
            exclude_from: Vec::new(),
            strip_components: 0,
            verbose: false,
            to_stdout: false,
            wildcards: false,
            numeric_owner: false,
            same_owner: None,
            same_permissions: None,
            xattrs: false,
            acl: false,
        }
    }

    pub fn metadata_flags(&self) -> MetadataFlags {
        let mut flags = MetadataFlags::empty();
        if self.xattrs {
            flags |= MetadataFlags::XATTRS;
        }
        if self.acl {
            flags |= MetadataFlags::ACL;
        }
        flags
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Success = 0,
    Warning = 1,
    Fatal = 2,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Outcome of a run.
#[derive(Debug)]
pub struct RunResult {
    pub status: ExitStatus,
    pub error: Option<Error>,
    /// Conditions which did not stop the run, but make it exit with a warning.
    pub warnings: Vec<String>,
    /// Swallowed metadata restore failures, these do not influence the exit status.
    pub suppressed: Vec<String>,
}

impl RunResult {
    fn classify(result: Result<(), Error>, report: Report) -> Self {
        let status = match (&result, report.warnings.is_empty()) {
            (Err(_), _) => ExitStatus::Fatal,
            (Ok(()), false) => ExitStatus::Warning,
            (Ok(()), true) => ExitStatus::Success,
        };
        Self {
            status,
            error: result.err(),
            warnings: report.warnings,
            suppressed: report.suppressed,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code()
    }
}

/// Collects non-fatal findings while a run progresses.
#[derive(Debug, Default)]
pub(crate) struct Report {
    pub warnings: Vec<String>,
    pub suppressed: Vec<String>,
}

impl Report {
    pub fn warn(&mut self, msg: String) {
        log::debug!("warning: {}", msg);
        self.warnings.push(msg);
    }

    pub fn suppress(&mut self, err: Error) {
        log::debug!("ignoring error: {:#}", err);
        self.suppressed.push(format!("{:#}", err));
    }
}

/// Reads exactly `size` bytes, failing if the source ends early.
pub(crate) struct ExactReader<R> {
    inner: io::Take<R>,
    name: String,
}

impl<R: Read> ExactReader<R> {
    pub fn new(inner: R, size: u64, name: &str) -> Self {
        Self {
            inner: inner.take(size),
            name: name.to_string(),
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let got = self.inner.read(buf)?;
        if got == 0 && !buf.is_empty() && self.inner.limit() > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{}: data ended {} bytes early", self.name, self.inner.limit()),
            ));
        }
        Ok(got)
    }
}

/// Consume the rest of an entry body.
fn drain(body: &mut dyn Read) -> Result<(), Error> {
    io::copy(body, &mut io::sink()).context("failed to skip entry data")?;
    Ok(())
}

/// Executes runs against the configured backends.
/// Builds the object store backend on first use.
pub type ConnectObjectStore = Box<dyn Fn() -> Result<Arc<dyn Backend>, Error> + Send + Sync>;

pub struct Runner {
    local: Arc<dyn Backend>,
    object_store: OnceLock<Arc<dyn Backend>>,
    connect_object_store: Option<ConnectObjectStore>,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    cancel: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(stdout: Box<dyn Write + Send>, stderr: Box<dyn Write + Send>) -> Self {
        Self {
            local: Arc::new(LocalBackend::new()),
            object_store: OnceLock::new(),
            connect_object_store: None,
            stdout,
            stderr,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use `backend` for `s3://` and ARN references.
    pub fn with_object_store(self, backend: Arc<dyn Backend>) -> Self {
        let _ = self.object_store.set(backend);
        self
    }

    /// Like [`with_object_store`](Self::with_object_store), but `connect` only runs once the
    /// first object reference is used, so local runs never set up a client.
    pub fn with_lazy_object_store<F>(mut self, connect: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Backend>, Error> + Send + Sync + 'static,
    {
        self.connect_object_store = Some(Box::new(connect));
        self
    }

    /// Setting the flag stops the run at the next entry boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(&mut self, options: &RunOptions) -> RunResult {
        let mut report = Report::default();
        let result = match options.mode {
            Mode::Create => self.run_create(options, &mut report),
            Mode::Extract => self.run_extract(options, &mut report),
            Mode::List => self.run_list(options, &mut report),
        };
        let _ = self.stdout.flush();
        let _ = self.stderr.flush();
        RunResult::classify(result, report)
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.load(Ordering::SeqCst) {
            bail!("operation cancelled");
        }
        Ok(())
    }

    fn backend(&self, reference: &Reference) -> Result<Arc<dyn Backend>, Error> {
        match reference.kind {
            ReferenceKind::Local | ReferenceKind::Stdio => Ok(Arc::clone(&self.local)),
            ReferenceKind::ObjectStore => {
                if let Some(backend) = self.object_store.get() {
                    return Ok(Arc::clone(backend));
                }
                let connect = match &self.connect_object_store {
                    Some(connect) => connect,
                    None => bail!("no object store configured for {}", reference),
                };
                let backend = connect()
                    .with_context(|| format!("failed to set up object store for {}", reference))?;
                Ok(Arc::clone(self.object_store.get_or_init(|| backend)))
            }
        }
    }

    /// Iterate the entries of the archive, handing every selected entry to `handle` with its
    /// name already stripped. Skipped entries are drained.
    fn scan_archive<F>(
        &mut self,
        options: &RunOptions,
        report: &mut Report,
        mut handle: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&mut Self, &mut Report, EntryHeader, &mut dyn Read) -> Result<(), Error>,
    {
        let archive = locator::resolve(&options.archive)?;
        if archive.kind == ReferenceKind::ObjectStore && archive.key.trim().is_empty() {
            return Err(ArchiveError::EmptyKey("archive object key cannot be empty".to_string()).into());
        }

        let backend = self.backend(&archive)?;
        let (source, _size) = backend
            .open_read(&archive)
            .with_context(|| format!("failed to open archive {}", archive))?;
        let (reader, compression) = new_reader(source, options.compression, archive.name_hint())?;
        log::info!("reading {} ({} compression)", archive, compression);

        let filter = MemberFilter::new(&options.members, options.wildcards);
        let mut tar = tar::Archive::new(reader);
        let entries = tar
            .entries()
            .with_context(|| format!("failed to read archive {}", archive))?;

        for entry in entries {
            self.check_cancelled()?;
            let mut entry = entry.with_context(|| format!("failed to read entry of {}", archive))?;
            let mut header = EntryHeader::from_entry(&mut entry)?;

            if !filter.selects(&header.name) {
                drain(&mut entry)?;
                continue;
            }
            match strip_components(&header.name, options.strip_components) {
                Some(name) => header.name = name,
                None => {
                    log::debug!("{:?} has too few components, skipped", header.name);
                    drain(&mut entry)?;
                    continue;
                }
            }

            log::debug!("processing {:?}", header.name);
            handle(self, report, header, &mut entry)?;
        }
        Ok(())
    }

    /// Verbose listing goes to stderr while the archive itself is written to stdout.
    fn verbose_line(&mut self, archive_on_stdout: bool, name: &str) {
        let out = if archive_on_stdout {
            &mut self.stderr
        } else {
            &mut self.stdout
        };
        let _ = writeln!(out, "{}", name);
    }
}
