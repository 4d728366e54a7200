use std::fs::{DirBuilder, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use nix::errno::Errno;
use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};

use super::{drain, ExactReader, Report, RunOptions, Runner};
use crate::archive::metadata::{decode_for_extract, header_to_object_metadata};
use crate::archive::path::{safe_join, safe_symlink_target, strip_components};
use crate::archive::{EntryHeader, EntryKind, MetadataFlags, PermissionPolicy};
use crate::locator::{self, join_prefix, Reference, ReferenceKind};
use crate::storage::Backend;

struct LocalTarget {
    base: PathBuf,
    policy: PermissionPolicy,
    flags: MetadataFlags,
    strip_components: usize,
}

fn create_parent(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
                .with_context(|| format!("failed to create directory {:?}", parent))?;
        }
    }
    Ok(())
}

/// Remove whatever is in the way of a new link. Missing entries are fine.
fn remove_existing(path: &Path) -> Result<(), Error> {
    let stat = match std::fs::symlink_metadata(path) {
        Ok(stat) => stat,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(format_err!("failed to stat {:?} - {}", path, err)),
    };
    let result = if stat.is_dir() {
        std::fs::remove_dir(path)
    } else {
        std::fs::remove_file(path)
    };
    result.with_context(|| format!("failed to remove existing {:?}", path))
}

impl LocalTarget {
    fn extract(&self, header: &EntryHeader, body: &mut dyn Read, report: &mut Report) -> Result<(), Error> {
        let target = safe_join(&self.base, &header.name)?;
        let mode = self.policy.creation_mode(header.mode);

        match header.kind {
            EntryKind::Directory => {
                DirBuilder::new()
                    .recursive(true)
                    .mode(mode)
                    .create(&target)
                    .with_context(|| format!("failed to create directory {:?}", target))?;
                drain(body)?;
            }
            EntryKind::Regular => {
                create_parent(&target)?;
                // never write through a symlink which happens to be in the way
                if let Ok(stat) = std::fs::symlink_metadata(&target) {
                    if stat.file_type().is_symlink() {
                        remove_existing(&target)?;
                    }
                }
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(mode)
                    .open(&target)
                    .with_context(|| format!("failed to create {:?}", target))?;
                io::copy(&mut ExactReader::new(body, header.size, &header.name), &mut file)
                    .with_context(|| format!("failed to extract {:?}", header.name))?;
            }
            EntryKind::Symlink => {
                safe_symlink_target(&self.base, &target, &header.linkname)?;
                create_parent(&target)?;
                remove_existing(&target)?;
                std::os::unix::fs::symlink(&header.linkname, &target)
                    .with_context(|| format!("failed to create symlink {:?}", target))?;
            }
            EntryKind::HardLink => {
                let link_name = strip_components(&header.linkname, self.strip_components)
                    .unwrap_or_else(|| header.linkname.clone());
                let source = safe_join(&self.base, &link_name)?;
                create_parent(&target)?;
                remove_existing(&target)?;
                std::fs::hard_link(&source, &target).with_context(|| {
                    format!("failed to link {:?} to {:?}", target, source)
                })?;
            }
            EntryKind::Other(flag) => {
                log::debug!("{:?}: skipping entry of type {:?}", header.name, flag as char);
                drain(body)?;
                return Ok(());
            }
        }

        self.apply_metadata(header, &target, &mut |err: Error| report.suppress(err));
        Ok(())
    }

    /// Restore ownership, mode, mtime and extended metadata. Failures are passed to
    /// `on_error` and do not stop the extraction.
    fn apply_metadata(&self, header: &EntryHeader, target: &Path, on_error: &mut dyn FnMut(Error)) {
        let is_symlink = header.kind == EntryKind::Symlink;

        // ownership first, chown may clear the suid/sgid bits
        if self.policy.same_owner {
            if let Err(err) = fchownat(
                None,
                target,
                Some(Uid::from_raw(header.uid as u32)),
                Some(Gid::from_raw(header.gid as u32)),
                FchownatFlags::NoFollowSymlink,
            ) {
                on_error(format_err!("failed to change owner of {:?} - {}", target, err));
            }
        }

        if self.policy.same_perms && !is_symlink {
            let permissions = std::fs::Permissions::from_mode(header.mode & 0o7777);
            if let Err(err) = std::fs::set_permissions(target, permissions) {
                on_error(format_err!("failed to change mode of {:?} - {}", target, err));
            }
        }

        if header.mtime != 0 {
            let time = TimeSpec::new(header.mtime as _, 0);
            if let Err(err) = utimensat(None, target, &time, &time, UtimensatFlags::NoFollowSymlink) {
                on_error(format_err!("failed to restore mtime of {:?} - {}", target, err));
            }
        }

        if self.flags.is_empty() {
            return;
        }
        let (xattrs, acls) = match decode_for_extract(header, self.flags) {
            Ok(decoded) => decoded,
            Err(err) => {
                on_error(err);
                return;
            }
        };
        for (name, value) in xattrs.iter().chain(acls.iter()) {
            match ostar_tools::xattr::lsetxattr(target, name, value) {
                Ok(()) | Err(Errno::EOPNOTSUPP) => (),
                Err(err) => on_error(format_err!(
                    "failed to restore {} on {:?} - {}",
                    name,
                    target,
                    err
                )),
            }
        }
    }
}

impl Runner {
    pub(super) fn run_extract(&mut self, options: &RunOptions, report: &mut Report) -> Result<(), Error> {
        if options.to_stdout {
            return self.scan_archive(options, report, |runner, _report, header, body| {
                if header.kind == EntryKind::Regular {
                    io::copy(
                        &mut ExactReader::new(&mut *body, header.size, &header.name),
                        &mut runner.stdout,
                    )
                    .with_context(|| format!("failed to write {:?} to stdout", header.name))?;
                }
                drain(body)
            });
        }

        let target = locator::resolve(options.chdir.as_deref().unwrap_or("."))?;
        match target.kind {
            ReferenceKind::Stdio => bail!("cannot extract into '-', use --to-stdout instead"),
            ReferenceKind::ObjectStore => {
                let backend = self.backend(&target)?;
                log::info!("extracting into {}", target);
                self.scan_archive(options, report, |runner, report, header, body| {
                    runner.verbose_entry(options, &header.name);
                    runner.extract_to_object(&backend, &target, header, body, report)
                })
            }
            ReferenceKind::Local => {
                let local = LocalTarget {
                    base: PathBuf::from(&target.path),
                    policy: PermissionPolicy::resolve(
                        ostar_tools::fs::is_privileged(),
                        options.same_owner,
                        options.same_permissions,
                        options.numeric_owner,
                        ostar_tools::fs::current_umask(),
                    ),
                    flags: options.metadata_flags(),
                    strip_components: options.strip_components,
                };
                log::info!("extracting into {:?} ({:?})", local.base, local.policy);
                self.scan_archive(options, report, |runner, report, header, body| {
                    runner.verbose_entry(options, &header.name);
                    local.extract(&header, body, report)
                })
            }
        }
    }

    fn verbose_entry(&mut self, options: &RunOptions, name: &str) {
        if options.verbose {
            let _ = writeln!(self.stdout, "{}", name);
        }
    }

    fn extract_to_object(
        &mut self,
        backend: &Arc<dyn Backend>,
        target: &Reference,
        header: EntryHeader,
        body: &mut dyn Read,
        report: &mut Report,
    ) -> Result<(), Error> {
        let name = header.name.strip_prefix("./").unwrap_or(&header.name);
        let key = join_prefix(&target.key, name);
        if name.is_empty() || name == "." || key.is_empty() {
            return drain(body);
        }

        let (header_metadata, fits) = header_to_object_metadata(&header);
        let mut metadata = target.metadata.clone();
        metadata.extend(header_metadata);
        if !fits {
            let msg = format!("metadata exceeds S3 metadata limit for {}", header.name);
            let _ = writeln!(self.stderr, "warning: {}", msg);
            report.warn(msg);
        }

        let object = Reference::object(target.bucket.as_str(), key);
        match header.kind {
            EntryKind::Regular => {
                let mut source = ExactReader::new(&mut *body, header.size, &header.name);
                backend
                    .upload_stream(&object, &mut source, &metadata)
                    .with_context(|| format!("failed to upload {}", object))?;
            }
            EntryKind::Directory => (),
            // links and special files become empty objects, their `type` tells them apart
            _ => {
                backend
                    .upload_stream(&object, &mut io::empty(), &metadata)
                    .with_context(|| format!("failed to upload {}", object))?;
            }
        }
        drain(body)
    }
}
