use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use walkdir::WalkDir;

use ostar_tools::compression::{check_level, new_writer};
use ostar_tools::io::WriteClose;

use super::{ExactReader, Report, RunOptions, Runner};
use crate::archive::metadata::{encode_acls, encode_xattrs, prepare_for_archive};
use crate::archive::path::{archive_name, clean};
use crate::archive::pattern::ExcludeList;
use crate::archive::{EntryHeader, EntryKind, MetadataFlags};
use crate::error::ArchiveError;
use crate::locator::{self, Reference, ReferenceKind};

type ArchiveBuilder = tar::Builder<Box<dyn WriteClose>>;

/// Insert `-<suffix>` into an archive name, in front of its extension.
///
/// `.tar.<ext>` counts as one extension and the suffix `date` stands for the current local
/// date as `YYYYMMDD`. Hidden names without another extension are left alone.
pub fn add_tar_suffix(name: &str, suffix: &str) -> Result<String, Error> {
    if suffix.is_empty() {
        return Ok(name.to_string());
    }
    let suffix = if suffix == "date" {
        ostar_tools::time::local_date_stamp(ostar_tools::time::epoch_i64())?
    } else {
        suffix.to_string()
    };
    Ok(insert_suffix(name, &suffix))
}

fn insert_suffix(name: &str, suffix: &str) -> String {
    let (dir, base) = match name.rfind('/') {
        Some(pos) => name.split_at(pos + 1),
        None => ("", name),
    };
    let ext_start = base.rfind('.').unwrap_or(base.len());
    if ext_start == 0 {
        return name.to_string();
    }
    let stem_end = if ext_start < base.len() && base[..ext_start].ends_with(".tar") {
        ext_start - 4
    } else {
        ext_start
    };
    format!("{}{}-{}{}", dir, &base[..stem_end], suffix, &base[stem_end..])
}

/// Caches user and group name lookups for the duration of a run.
#[derive(Default)]
struct OwnerNames {
    users: HashMap<u32, Option<String>>,
    groups: HashMap<u32, Option<String>>,
}

impl OwnerNames {
    fn user(&mut self, uid: u32) -> Option<String> {
        self.users
            .entry(uid)
            .or_insert_with(|| ostar_tools::fs::user_name(uid))
            .clone()
    }

    fn group(&mut self, gid: u32) -> Option<String> {
        self.groups
            .entry(gid)
            .or_insert_with(|| ostar_tools::fs::group_name(gid))
            .clone()
    }
}

struct CreateState<'a> {
    options: &'a RunOptions,
    excludes: ExcludeList,
    flags: MetadataFlags,
    owners: OwnerNames,
    archive_on_stdout: bool,
    /// Device and inode of a local archive, which must not end up inside itself.
    archive_id: Option<(u64, u64)>,
}

/// Copy as much of `value` as fits into a fixed size header field.
fn fill_truncated(field: &mut [u8], value: &str) {
    field.fill(0);
    let mut end = value.len().min(field.len());
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&value.as_bytes()[..end]);
}

/// Write one entry as a PAX entry. Names and link targets which do not fit into the ustar
/// fields are carried as `path` and `linkpath` records.
fn append_entry<R: Read>(
    builder: &mut ArchiveBuilder,
    header: &EntryHeader,
    body: R,
) -> Result<(), Error> {
    let mut tar_header = header.to_tar_header();
    let mut long_names = Vec::new();

    if let Err(err) = tar_header.set_path(&header.name) {
        log::debug!("{:?} does not fit into a ustar header - {}", header.name, err);
        if let Some(ustar) = tar_header.as_ustar_mut() {
            ustar.prefix.fill(0);
        }
        fill_truncated(&mut tar_header.as_old_mut().name, &header.name);
        long_names.push(("path", header.name.as_str()));
    }

    if matches!(header.kind, EntryKind::Symlink | EntryKind::HardLink) {
        if let Err(err) = tar_header.set_link_name(&header.linkname) {
            log::debug!("link target {:?} does not fit into a ustar header - {}", header.linkname, err);
            fill_truncated(&mut tar_header.as_old_mut().linkname, &header.linkname);
            long_names.push(("linkpath", header.linkname.as_str()));
        }
    }

    if !header.extended_records.is_empty() || !long_names.is_empty() {
        builder.append_pax_extensions(
            header
                .extended_records
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str()))
                .chain(long_names)
                .map(|(key, value)| (key, value.as_bytes())),
        )?;
    }

    tar_header.set_cksum();
    builder.append(&tar_header, body)?;
    Ok(())
}

impl Runner {
    pub(super) fn run_create(&mut self, options: &RunOptions, _report: &mut Report) -> Result<(), Error> {
        if options.members.is_empty() {
            bail!("cowardly refusing to create an empty archive");
        }
        check_level(options.compression_level)?;

        let excludes = ExcludeList::load(&options.exclude, &options.exclude_from)?;
        let members = options
            .members
            .iter()
            .map(|member| locator::resolve_member(member))
            .collect::<Result<Vec<_>, Error>>()?;

        let mut archive = locator::resolve(&options.archive)?;
        if let Some(suffix) = options.suffix.as_deref() {
            match archive.kind {
                ReferenceKind::Local => archive.path = add_tar_suffix(&archive.path, suffix)?,
                ReferenceKind::ObjectStore => archive.key = add_tar_suffix(&archive.key, suffix)?,
                ReferenceKind::Stdio => (),
            }
        }
        if archive.kind == ReferenceKind::ObjectStore && archive.key.trim().is_empty() {
            return Err(ArchiveError::EmptyKey("archive object key cannot be empty".to_string()).into());
        }

        let backend = self.backend(&archive)?;
        let sink = backend
            .open_write(&archive, &archive.metadata)
            .with_context(|| format!("failed to open archive {}", archive))?;
        let archive_id = match archive.kind {
            ReferenceKind::Local => std::fs::metadata(&archive.path)
                .ok()
                .map(|stat| (stat.dev(), stat.ino())),
            _ => None,
        };
        let writer = new_writer(sink, options.compression, options.compression_level)?;
        let mut builder = tar::Builder::new(writer);

        log::info!("creating {} ({} compression)", archive, options.compression);

        let mut state = CreateState {
            options,
            excludes,
            flags: options.metadata_flags(),
            owners: OwnerNames::default(),
            archive_on_stdout: archive.kind == ReferenceKind::Stdio,
            archive_id,
        };

        let added = self.add_members(&mut builder, &members, &mut state);

        // the tar trailer goes first, then the codec stream is finished and the sink closed,
        // the close runs even if the trailer could not be written
        let trailer = builder.finish();
        let closed = builder
            .into_inner()
            .map_err(Error::from)
            .and_then(|mut writer| writer.close());

        added?;
        closed
            .and(trailer.map_err(Error::from))
            .with_context(|| format!("failed to finish archive {}", archive))
    }

    fn add_members(
        &mut self,
        builder: &mut ArchiveBuilder,
        members: &[Reference],
        state: &mut CreateState,
    ) -> Result<(), Error> {
        for member in members {
            self.check_cancelled()?;
            match member.kind {
                ReferenceKind::ObjectStore => {
                    if state.excludes.matches(&member.key) {
                        log::debug!("excluding {}", member);
                        continue;
                    }
                    self.add_object_member(builder, member, state)?;
                }
                ReferenceKind::Local => self.add_local_member(builder, &member.path, state)?,
                ReferenceKind::Stdio => bail!("unsupported member reference {}", member),
            }
        }
        Ok(())
    }

    fn add_object_member(
        &mut self,
        builder: &mut ArchiveBuilder,
        member: &Reference,
        state: &mut CreateState,
    ) -> Result<(), Error> {
        if member.key.trim().is_empty() {
            return Err(ArchiveError::EmptyKey(format!(
                "object member key cannot be empty: {:?}",
                member.raw
            ))
            .into());
        }

        let backend = self.backend(member)?;
        let (reader, size) = backend.open_read(member)?;
        let size = match size {
            Some(size) => size,
            None => backend.stat(member)?,
        };

        let name = archive_name(&member.key);
        let mut header = EntryHeader::new(name.clone(), EntryKind::Regular);
        header.mode = 0o644;
        header.size = size;
        header.mtime = ostar_tools::time::epoch_i64();

        log::debug!("adding {} as {:?} ({} bytes)", member, name, size);
        append_entry(builder, &header, ExactReader::new(reader, size, &name))
            .with_context(|| format!("failed to archive {}", member))?;

        if state.options.verbose {
            self.verbose_line(state.archive_on_stdout, &name);
        }
        Ok(())
    }

    fn add_local_member(
        &mut self,
        builder: &mut ArchiveBuilder,
        member: &str,
        state: &mut CreateState,
    ) -> Result<(), Error> {
        let base_path = match &state.options.chdir {
            Some(dir) => Path::new(dir).join(member),
            None => PathBuf::from(member),
        };

        let member_name = archive_name(member);
        if Path::new(&member_name) != clean(Path::new(member)) {
            log::warn!("removing leading '/' and '../' from member names ({:?})", member);
        }

        let mut walker = WalkDir::new(&base_path)
            .follow_links(false)
            .follow_root_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.with_context(|| format!("failed to walk {:?}", base_path))?;
            self.check_cancelled()?;

            let rel = entry.path().strip_prefix(&base_path).unwrap_or(entry.path());
            let name = if rel.as_os_str().is_empty() {
                member_name.clone()
            } else if member_name == "." {
                rel.to_string_lossy().into_owned()
            } else {
                format!("{}/{}", member_name, rel.to_string_lossy())
            };

            if state.excludes.matches(&name) {
                log::debug!("excluding {:?}", name);
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            self.add_local_entry(builder, entry.path(), name, state)?;
        }
        Ok(())
    }

    fn add_local_entry(
        &mut self,
        builder: &mut ArchiveBuilder,
        path: &Path,
        name: String,
        state: &mut CreateState,
    ) -> Result<(), Error> {
        let stat = std::fs::symlink_metadata(path)
            .with_context(|| format!("failed to stat {:?}", path))?;
        let file_type = stat.file_type();

        if state.archive_id == Some((stat.dev(), stat.ino())) {
            log::warn!("{:?}: file is the archive; not dumped", path);
            return Ok(());
        }

        let kind = if file_type.is_file() {
            EntryKind::Regular
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_fifo() {
            EntryKind::Other(b'6')
        } else if file_type.is_char_device() {
            EntryKind::Other(b'3')
        } else if file_type.is_block_device() {
            EntryKind::Other(b'4')
        } else {
            log::warn!("{:?}: socket ignored", path);
            return Ok(());
        };

        let mut header = EntryHeader::new(name, kind);
        header.mode = stat.mode() & 0o7777;
        header.mtime = stat.mtime();
        header.uid = stat.uid() as u64;
        header.gid = stat.gid() as u64;
        header.uname = state.owners.user(stat.uid()).unwrap_or_default();
        header.gname = state.owners.group(stat.gid()).unwrap_or_default();

        match kind {
            EntryKind::Regular => header.size = stat.len(),
            EntryKind::Symlink => {
                let target = std::fs::read_link(path)
                    .with_context(|| format!("failed to read symlink {:?}", path))?;
                header.linkname = target.to_string_lossy().into_owned();
            }
            EntryKind::Other(_) if !file_type.is_fifo() => {
                let rdev = stat.rdev();
                header.device = Some((
                    nix::sys::stat::major(rdev) as u32,
                    nix::sys::stat::minor(rdev) as u32,
                ));
            }
            _ => (),
        }

        if !state.flags.is_empty() {
            match ostar_tools::xattr::read_all(path) {
                Ok(attrs) => {
                    let (xattrs, acls) = prepare_for_archive(attrs.into_iter().collect(), state.flags);
                    encode_xattrs(&mut header, &xattrs);
                    encode_acls(&mut header, &acls);
                }
                Err(err) => log::debug!("unable to read extended attributes of {:?} - {}", path, err),
            }
        }

        log::debug!("adding {:?} as {:?}", path, header.name);

        let appended = if kind == EntryKind::Regular {
            let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
            append_entry(builder, &header, ExactReader::new(file, header.size, &header.name))
        } else {
            append_entry(builder, &header, io::empty())
        };
        appended.with_context(|| format!("failed to archive {:?}", path))?;

        if state.options.verbose {
            self.verbose_line(state.archive_on_stdout, &header.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_insertion() {
        assert_eq!(insert_suffix("backup.tar.gz", "v1"), "backup-v1.tar.gz");
        assert_eq!(insert_suffix("dir/backup.tgz", "v1"), "dir/backup-v1.tgz");
        assert_eq!(insert_suffix("backup.tar", "v1"), "backup-v1.tar");
        assert_eq!(insert_suffix("backup", "v1"), "backup-v1");
        assert_eq!(insert_suffix("a.b/archive.zst", "x"), "a.b/archive-x.zst");
        assert_eq!(insert_suffix(".hidden", "v1"), ".hidden");
        assert_eq!(insert_suffix("dir/.hidden", "v1"), "dir/.hidden");
    }

    #[test]
    fn long_names_use_pax_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.tar");
        let file: Box<dyn WriteClose> = Box::new(File::create(&path).unwrap());
        let mut builder = tar::Builder::new(file);

        let long_name = format!("data/{}", "n".repeat(150));
        let long_target = format!("../{}", "t".repeat(150));
        let mut file_header = EntryHeader::new(long_name.clone(), EntryKind::Regular);
        file_header.mode = 0o644;
        file_header.size = 5;
        append_entry(&mut builder, &file_header, &b"hello"[..]).unwrap();

        let mut link_header = EntryHeader::new("data/link", EntryKind::Symlink);
        link_header.mode = 0o777;
        link_header.linkname = long_target.clone();
        append_entry(&mut builder, &link_header, io::empty()).unwrap();

        builder.into_inner().unwrap().close().unwrap();

        let mut archive = tar::Archive::new(File::open(&path).unwrap());
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let entry_type = entry.header().entry_type();
            assert!(!entry_type.is_gnu_longname() && !entry_type.is_gnu_longlink());
            let records: Vec<String> = match entry.pax_extensions().unwrap() {
                Some(extensions) => extensions
                    .map(|ext| ext.unwrap().key().unwrap().to_string())
                    .collect(),
                None => Vec::new(),
            };
            let header = EntryHeader::from_entry(&mut entry).unwrap();
            seen.push((header.name, header.linkname, records));
        }

        assert_eq!(
            seen,
            [
                (long_name, String::new(), vec!["path".to_string()]),
                ("data/link".to_string(), long_target, vec!["linkpath".to_string()]),
            ]
        );
    }

    #[test]
    fn short_names_have_no_pax_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.tar");
        let file: Box<dyn WriteClose> = Box::new(File::create(&path).unwrap());
        let mut builder = tar::Builder::new(file);
        let mut header = EntryHeader::new("data/a.txt", EntryKind::Regular);
        header.size = 2;
        append_entry(&mut builder, &header, &b"hi"[..]).unwrap();
        builder.into_inner().unwrap().close().unwrap();

        let mut archive = tar::Archive::new(File::open(&path).unwrap());
        let types: Vec<tar::EntryType> = archive
            .entries()
            .unwrap()
            .raw(true)
            .map(|entry| entry.unwrap().header().entry_type())
            .collect();
        assert_eq!(types, [tar::EntryType::Regular]);
    }

    #[test]
    fn suffix_date_and_empty() {
        assert_eq!(add_tar_suffix("a.tar.gz", "").unwrap(), "a.tar.gz");

        let dated = add_tar_suffix("a.tar.gz", "date").unwrap();
        let stamp = dated
            .strip_prefix("a-")
            .and_then(|rest| rest.strip_suffix(".tar.gz"))
            .unwrap();
        assert_eq!(stamp.len(), 8);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
    }
}
