use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Error;

use anyhow::{bail, format_err};
use nix::errno::Errno;

use ostar_client::storage::{pipe, Backend, MemoryStore, ObjectMetadata};
use ostar_client::{ArchiveError, ExitStatus, Mode, Reference, RunOptions, RunResult, Runner};
use ostar_tools::compression::{Compression, CompressionError};
use ostar_tools::io::WriteClose;

#[derive(Clone, Default)]
struct Output(Arc<Mutex<Vec<u8>>>);

impl Output {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Harness {
    store: MemoryStore,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
        }
    }

    fn run(&self, options: &RunOptions) -> (RunResult, Output, Output) {
        let stdout = Output::default();
        let stderr = Output::default();
        let mut runner = Runner::new(Box::new(stdout.clone()), Box::new(stderr.clone()))
            .with_object_store(Arc::new(self.store.clone()));
        (runner.run(options), stdout, stderr)
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// data/{a.txt, link -> a.txt, sub/b.txt, .exclude/secret}
fn populate(root: &Path) -> Result<(), Error> {
    let data = root.join("data");
    std::fs::create_dir_all(data.join("sub"))?;
    std::fs::create_dir_all(data.join(".exclude"))?;
    std::fs::write(data.join("a.txt"), b"alpha")?;
    std::fs::set_permissions(data.join("a.txt"), std::fs::Permissions::from_mode(0o640))?;
    std::fs::write(data.join("sub/b.txt"), b"beta")?;
    std::fs::write(data.join(".exclude/secret"), b"hidden")?;
    std::os::unix::fs::symlink("a.txt", data.join("link"))?;
    Ok(())
}

fn create_options(source: &Path, archive: &str) -> RunOptions {
    let mut options = RunOptions::new(Mode::Create, archive);
    options.chdir = Some(path_str(source));
    options.members = vec!["data".to_string()];
    options
}

fn extract_options(archive: &str, target: &str) -> RunOptions {
    let mut options = RunOptions::new(Mode::Extract, archive);
    options.chdir = Some(target.to_string());
    options.same_owner = Some(false);
    options.same_permissions = Some(true);
    options
}

/// Append an entry with verbatim header fields, bypassing path validation of the builder.
fn raw_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    linkname: &str,
    entry_type: tar::EntryType,
    data: &[u8],
) -> Result<(), Error> {
    let mut header = tar::Header::new_old();
    header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
    header.as_old_mut().linkname[..linkname.len()].copy_from_slice(linkname.as_bytes());
    header.set_entry_type(entry_type);
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    header.set_mtime(1_600_000_000);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

fn raw_archive(path: &Path, entries: &[(&str, &str, tar::EntryType, &[u8])]) -> Result<(), Error> {
    let mut builder = tar::Builder::new(std::fs::File::create(path)?);
    for (name, linkname, entry_type, data) in entries {
        raw_entry(&mut builder, name, linkname, *entry_type, data)?;
    }
    builder.into_inner()?;
    Ok(())
}

#[test]
fn local_round_trip() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let target = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    populate(source.path())?;
    let archive = path_str(&work.path().join("data.tar"));
    let harness = Harness::new();

    let mut options = create_options(source.path(), &archive);
    options.verbose = true;
    let (result, stdout, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);
    assert_eq!(stdout.lines().len(), 7);

    let (result, listing, _) = harness.run(&RunOptions::new(Mode::List, archive.as_str()));
    assert_eq!(result.status, ExitStatus::Success);
    assert_eq!(
        listing.lines(),
        [
            "data",
            "data/.exclude",
            "data/.exclude/secret",
            "data/a.txt",
            "data/link",
            "data/sub",
            "data/sub/b.txt",
        ]
    );

    let (result, _, _) = harness.run(&extract_options(&archive, &path_str(target.path())));
    assert_eq!(result.exit_code(), 0, "{:?}", result.error);

    let data = target.path().join("data");
    assert_eq!(std::fs::read(data.join("a.txt"))?, b"alpha");
    assert_eq!(std::fs::read(data.join("sub/b.txt"))?, b"beta");
    assert_eq!(std::fs::read_link(data.join("link"))?, Path::new("a.txt"));
    let mode = std::fs::metadata(data.join("a.txt"))?.permissions().mode();
    assert_eq!(mode & 0o7777, 0o640);
    Ok(())
}

#[test]
fn excluded_directories_are_pruned() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    populate(source.path())?;
    let archive = path_str(&work.path().join("data.tar"));
    let harness = Harness::new();

    let mut options = create_options(source.path(), &archive);
    options.exclude = vec!["data/.exclude/**".to_string(), "data/sub/*.txt".to_string()];
    let (result, _, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);

    let (_, listing, _) = harness.run(&RunOptions::new(Mode::List, archive.as_str()));
    assert_eq!(listing.lines(), ["data", "data/a.txt", "data/link", "data/sub"]);
    Ok(())
}

#[test]
fn invalid_exclude_pattern_is_fatal() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    populate(source.path())?;
    let archive = work.path().join("data.tar");

    let mut options = create_options(source.path(), &path_str(&archive));
    options.exclude = vec!["[".to_string()];
    let (result, _, _) = Harness::new().run(&options);
    assert_eq!(result.status, ExitStatus::Fatal);
    assert!(matches!(
        result.error.unwrap().downcast_ref::<ArchiveError>(),
        Some(ArchiveError::InvalidExclude(_))
    ));
    Ok(())
}

#[test]
fn traversal_is_rejected() -> Result<(), Error> {
    let work = tempfile::tempdir()?;
    let target = work.path().join("a/b");
    std::fs::create_dir_all(&target)?;
    let archive = work.path().join("evil.tar");
    raw_archive(
        &archive,
        &[(
            "../../etc/passwd",
            "",
            tar::EntryType::Regular,
            &b"root::0:0::/:/bin/sh\n"[..],
        )],
    )?;

    let (result, _, _) =
        Harness::new().run(&extract_options(&path_str(&archive), &path_str(&target)));
    assert_eq!(result.status, ExitStatus::Fatal);
    assert_eq!(
        result.error.unwrap().downcast_ref::<ArchiveError>(),
        Some(&ArchiveError::PathTraversal("../../etc/passwd".to_string()))
    );
    assert!(!work.path().join("etc/passwd").exists());
    Ok(())
}

#[test]
fn escaping_symlinks_are_rejected() -> Result<(), Error> {
    for linkname in ["../../x", "/etc/passwd"] {
        let work = tempfile::tempdir()?;
        let target = work.path().join("out");
        std::fs::create_dir_all(&target)?;
        let archive = work.path().join("evil.tar");
        raw_archive(&archive, &[("evil", linkname, tar::EntryType::Symlink, &b""[..])])?;

        let (result, _, _) =
            Harness::new().run(&extract_options(&path_str(&archive), &path_str(&target)));
        assert_eq!(result.status, ExitStatus::Fatal, "{}", linkname);
        assert!(matches!(
            result.error.unwrap().downcast_ref::<ArchiveError>(),
            Some(ArchiveError::SymlinkEscape { .. })
        ));
        assert!(std::fs::symlink_metadata(target.join("evil")).is_err());
    }
    Ok(())
}

#[test]
fn strip_components_skips_short_names() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let target = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    populate(source.path())?;
    let archive = path_str(&work.path().join("data.tar"));
    let harness = Harness::new();

    let (result, _, _) = harness.run(&create_options(source.path(), &archive));
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);

    let mut options = extract_options(&archive, &path_str(target.path()));
    options.strip_components = 1;
    options.verbose = true;
    let (result, stdout, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);

    assert_eq!(std::fs::read(target.path().join("a.txt"))?, b"alpha");
    assert_eq!(std::fs::read(target.path().join("sub/b.txt"))?, b"beta");
    assert!(!target.path().join("data").exists());
    assert!(stdout.lines().contains(&"sub/b.txt".to_string()));
    assert!(!stdout.lines().contains(&"data".to_string()));
    Ok(())
}

#[test]
fn member_selection() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    populate(source.path())?;
    let archive = path_str(&work.path().join("data.tar"));
    let harness = Harness::new();
    harness.run(&create_options(source.path(), &archive));

    let mut options = RunOptions::new(Mode::List, archive.as_str());
    options.members = vec!["data/*.txt".to_string()];
    let (_, listing, _) = harness.run(&options);
    assert!(listing.lines().is_empty());

    options.wildcards = true;
    let (_, listing, _) = harness.run(&options);
    assert_eq!(listing.lines(), ["data/a.txt"]);

    options.members = vec!["data/sub/b.txt".to_string()];
    options.wildcards = false;
    let (_, listing, _) = harness.run(&options);
    assert_eq!(listing.lines(), ["data/sub/b.txt"]);
    Ok(())
}

#[test]
fn extract_to_stdout() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    populate(source.path())?;
    let archive = path_str(&work.path().join("data.tar"));
    let harness = Harness::new();
    harness.run(&create_options(source.path(), &archive));

    let mut options = RunOptions::new(Mode::Extract, archive.as_str());
    options.to_stdout = true;
    options.members = vec!["data/a.txt".to_string(), "data/sub/b.txt".to_string()];
    let (result, stdout, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);
    assert_eq!(stdout.text(), "alphabeta");
    Ok(())
}

#[test]
fn object_store_round_trip() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    populate(source.path())?;
    let harness = Harness::new();

    let options = create_options(source.path(), "s3://backups/nightly/data.tar?team=ops");
    let (result, _, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);
    let stored = harness.store.get("backups", "nightly/data.tar").unwrap();
    assert_eq!(stored.metadata["team"], "ops");

    let options = extract_options("s3://backups/nightly/data.tar", "s3://restore/prefix?env=test");
    let (result, _, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);

    assert_eq!(
        harness.store.keys("restore"),
        [
            "prefix/data/.exclude/secret",
            "prefix/data/a.txt",
            "prefix/data/link",
            "prefix/data/sub/b.txt",
        ]
    );
    let file = harness.store.get("restore", "prefix/data/a.txt").unwrap();
    assert_eq!(file.data, b"alpha");
    assert_eq!(file.metadata["env"], "test");
    assert_eq!(file.metadata["mode"], "640");

    let link = harness.store.get("restore", "prefix/data/link").unwrap();
    assert!(link.data.is_empty());
    assert_eq!(link.metadata["linkname"], "a.txt");
    assert_eq!(link.metadata["type"], (b'2').to_string());
    assert_eq!(file.metadata["type"], (b'0').to_string());
    assert!(!link.metadata.keys().any(|key| key.starts_with("ostar")));
    Ok(())
}

#[test]
fn object_members_are_archived() -> Result<(), Error> {
    let work = tempfile::tempdir()?;
    let harness = Harness::new();
    harness
        .store
        .insert("docs", "guides/readme.md", b"# readme\n".to_vec(), Default::default());
    let archive = path_str(&work.path().join("docs.tar"));

    let mut options = RunOptions::new(Mode::Create, archive.as_str());
    options.members = vec!["s3://docs/guides/readme.md".to_string()];
    let (result, _, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);

    let mut options = RunOptions::new(Mode::Extract, archive.as_str());
    options.to_stdout = true;
    let (_, stdout, _) = harness.run(&options);
    assert_eq!(stdout.text(), "# readme\n");

    let (_, listing, _) = harness.run(&RunOptions::new(Mode::List, archive.as_str()));
    assert_eq!(listing.lines(), ["guides/readme.md"]);
    Ok(())
}

#[test]
fn oversized_metadata_warns() -> Result<(), Error> {
    let work = tempfile::tempdir()?;
    let archive = work.path().join("long.tar");
    let linkname = "x".repeat(1600);
    {
        let mut builder = tar::Builder::new(std::fs::File::create(&archive)?);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        builder.append_link(&mut header, "long", &linkname)?;
        builder.into_inner()?;
    }

    let harness = Harness::new();
    let (result, _, stderr) = harness.run(&extract_options(&path_str(&archive), "s3://out/p"));
    assert_eq!(result.status, ExitStatus::Warning, "{:?}", result.error);
    assert_eq!(result.exit_code(), 1);
    assert!(stderr
        .text()
        .contains("warning: metadata exceeds S3 metadata limit for long"));
    assert!(harness.store.get("out", "p/long").is_some());
    Ok(())
}

#[test]
fn compression_is_detected_from_content() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    populate(source.path())?;
    // no extension hint, only the magic bytes tell
    let archive = work.path().join("data.bin");
    let harness = Harness::new();

    let mut options = create_options(source.path(), &path_str(&archive));
    options.compression = Compression::Gzip;
    options.compression_level = Some(9);
    let (result, _, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);
    assert_eq!(&std::fs::read(&archive)?[..2], &[0x1f, 0x8b]);

    let (result, listing, _) = harness.run(&RunOptions::new(Mode::List, path_str(&archive)));
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);
    assert_eq!(listing.lines().len(), 7);
    Ok(())
}

#[test]
fn invalid_level_is_fatal() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    populate(source.path())?;
    let archive = work.path().join("data.tar.zst");

    let mut options = create_options(source.path(), &path_str(&archive));
    options.compression = Compression::Zstd;
    options.compression_level = Some(12);
    let (result, _, _) = Harness::new().run(&options);
    assert_eq!(result.status, ExitStatus::Fatal);
    assert_eq!(
        result.error.unwrap().downcast_ref::<CompressionError>(),
        Some(&CompressionError::InvalidLevel(12))
    );
    assert!(!archive.exists());
    Ok(())
}

#[test]
fn archive_suffix() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    populate(source.path())?;
    let harness = Harness::new();

    let mut options = create_options(source.path(), &path_str(&work.path().join("data.tar.gz")));
    options.compression = Compression::Gzip;
    options.suffix = Some("v2".to_string());
    let (result, _, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);
    assert!(work.path().join("data-v2.tar.gz").exists());

    let mut options = create_options(source.path(), "s3://backups/data.tar");
    options.suffix = Some("v3".to_string());
    harness.run(&options);
    assert_eq!(harness.store.keys("backups"), ["data-v3.tar"]);
    Ok(())
}

#[test]
fn empty_object_keys_are_rejected() {
    let harness = Harness::new();
    let mut options = RunOptions::new(Mode::Create, "s3://backups/");
    options.members = vec!["s3://docs/readme.md".to_string()];
    let (result, _, _) = harness.run(&options);
    assert!(matches!(
        result.error.unwrap().downcast_ref::<ArchiveError>(),
        Some(ArchiveError::EmptyKey(_))
    ));

    let (result, _, _) = harness.run(&RunOptions::new(Mode::List, "s3://backups/"));
    assert!(matches!(
        result.error.unwrap().downcast_ref::<ArchiveError>(),
        Some(ArchiveError::EmptyKey(_))
    ));
}

#[test]
fn empty_member_list_is_fatal() {
    let (result, _, _) = Harness::new().run(&RunOptions::new(Mode::Create, "/tmp/never.tar"));
    assert_eq!(result.status, ExitStatus::Fatal);
    assert!(!Path::new("/tmp/never.tar").exists());
}

#[test]
fn object_archive_extracts_locally() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let target = tempfile::tempdir()?;
    populate(source.path())?;
    let big: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
    std::fs::write(source.path().join("data/sub/big.bin"), &big)?;
    let harness = Harness::new();

    let mut options = create_options(source.path(), "s3://b/x.tar.zst");
    options.compression = Compression::Zstd;
    let (result, _, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);
    let stored = harness.store.get("b", "x.tar.zst").unwrap();
    assert_eq!(&stored.data[..4], &[0x28, 0xb5, 0x2f, 0xfd]);

    let (result, _, _) = harness.run(&extract_options("s3://b/x.tar.zst", &path_str(target.path())));
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);

    let data = target.path().join("data");
    assert_eq!(std::fs::read(data.join("sub/big.bin"))?, big);
    assert_eq!(std::fs::read(data.join("a.txt"))?, b"alpha");
    assert_eq!(std::fs::read(data.join(".exclude/secret"))?, b"hidden");
    assert_eq!(std::fs::read_link(data.join("link"))?, Path::new("a.txt"));
    let mode = std::fs::metadata(data.join("a.txt"))?.permissions().mode();
    assert_eq!(mode & 0o7777, 0o640);
    Ok(())
}

fn has_xattr(path: &Path, name: &str) -> Result<bool, Error> {
    let attrs = ostar_tools::xattr::read_all(path)?;
    Ok(attrs.iter().any(|(attr, value)| attr == name && value == b"nightly"))
}

#[test]
fn xattrs_follow_metadata_flags() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    populate(source.path())?;
    let file = source.path().join("data/a.txt");
    match ostar_tools::xattr::lsetxattr(&file, "user.ostar.note", b"nightly") {
        Ok(()) => (),
        // file system without user xattr support
        Err(Errno::EOPNOTSUPP) | Err(Errno::EPERM) => return Ok(()),
        Err(err) => bail!("lsetxattr failed: {}", err),
    }
    let harness = Harness::new();

    let with_xattrs = path_str(&work.path().join("xattrs.tar"));
    let mut options = create_options(source.path(), &with_xattrs);
    options.xattrs = true;
    let (result, _, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);

    let acl_only = path_str(&work.path().join("acl.tar"));
    let mut options = create_options(source.path(), &acl_only);
    options.acl = true;
    let (result, _, _) = harness.run(&options);
    assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);

    let restore = |archive: &str, xattrs: bool, acl: bool| -> Result<bool, Error> {
        let target = work.path().join(format!("out-{}-{}-{}", archive.len(), xattrs, acl));
        std::fs::create_dir(&target)?;
        let mut options = extract_options(archive, &path_str(&target));
        options.xattrs = xattrs;
        options.acl = acl;
        let (result, _, _) = harness.run(&options);
        assert_eq!(result.status, ExitStatus::Success, "{:?}", result.error);
        has_xattr(&target.join("data/a.txt"), "user.ostar.note")
    };

    assert!(restore(&with_xattrs, true, false)?);
    assert!(!restore(&with_xattrs, false, true)?);
    assert!(!restore(&acl_only, true, true)?);
    Ok(())
}

/// Object store whose uploads are refused after the first chunk.
struct RefusingStore;

impl Backend for RefusingStore {
    fn stat(&self, reference: &Reference) -> Result<u64, Error> {
        bail!("{} not found", reference)
    }

    fn open_read(&self, reference: &Reference) -> Result<(Box<dyn Read + Send>, Option<u64>), Error> {
        bail!("{} not found", reference)
    }

    fn open_write(
        &self,
        _reference: &Reference,
        _metadata: &ObjectMetadata,
    ) -> Result<Box<dyn WriteClose>, Error> {
        let (writer, mut reader) = pipe();
        std::thread::spawn(move || {
            let _ = reader.blocking_next_chunk();
            reader.complete(Err(format_err!(
                "AccessDenied: bucket policy forbids PutObject"
            )));
        });
        Ok(Box::new(writer))
    }
}

#[test]
fn upload_failures_keep_their_cause() -> Result<(), Error> {
    let source = tempfile::tempdir()?;
    std::fs::create_dir(source.path().join("data"))?;
    std::fs::write(source.path().join("data/big"), vec![0x5a; 4 * 1024 * 1024])?;

    let mut runner = Runner::new(Box::new(Output::default()), Box::new(Output::default()))
        .with_object_store(Arc::new(RefusingStore));
    let result = runner.run(&create_options(source.path(), "s3://bucket/a.tar"));
    assert_eq!(result.status, ExitStatus::Fatal);
    let message = format!("{:#}", result.error.unwrap());
    assert!(message.contains("AccessDenied"), "{}", message);
    Ok(())
}
