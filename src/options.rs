//! Command line parsing.

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{bail, Error};
use clap::{ArgGroup, Parser};

use ostar_client::{Mode, RunOptions};
use ostar_tools::compression::Compression;

/// Letters allowed in a legacy, dash-less first argument such as `czvf`.
const LEGACY_FLAGS: &str = "cxtvfCzjJO";

/// tar compatible archiver for local files and S3 objects
#[derive(Debug, Parser)]
#[command(name = "ostar", version)]
#[command(group(ArgGroup::new("mode").required(true).args(["create", "extract", "list"])))]
pub struct Cli {
    /// Create a new archive.
    #[arg(short = 'c', long)]
    create: bool,

    /// Extract files from an archive.
    #[arg(short = 'x', long)]
    extract: bool,

    /// List the contents of an archive.
    #[arg(short = 't', long)]
    list: bool,

    /// Archive file, `-` for stdin/stdout, `s3://bucket/key` or an S3 ARN.
    #[arg(short = 'f', long = "file", value_name = "ARCHIVE")]
    file: String,

    /// Change to DIR before adding members, or extract into DIR (may be an S3 prefix).
    #[arg(short = 'C', long = "directory", value_name = "DIR")]
    directory: Option<String>,

    /// Filter the archive through gzip.
    #[arg(short = 'z', long)]
    gzip: bool,

    /// Filter the archive through bzip2.
    #[arg(short = 'j', long)]
    bzip2: bool,

    /// Filter the archive through xz.
    #[arg(short = 'J', long)]
    xz: bool,

    /// Filter the archive through zstd.
    #[arg(long)]
    zstd: bool,

    /// Filter the archive through lz4.
    #[arg(long)]
    lz4: bool,

    /// Compression type (auto, none, gzip, bzip2, xz, zstd, lz4).
    #[arg(long, value_name = "TYPE")]
    compression: Option<String>,

    /// Compression level, 1 to 9.
    #[arg(long, value_name = "LEVEL")]
    compression_level: Option<u32>,

    /// List processed entries.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Extract regular files to standard output.
    #[arg(short = 'O', long)]
    to_stdout: bool,

    /// Insert -SUFFIX before the archive extension, `date` for the current date.
    #[arg(long, value_name = "SUFFIX")]
    suffix: Option<String>,

    /// Exclude files matching PATTERN.
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Read exclude patterns from FILE.
    #[arg(long, value_name = "FILE")]
    exclude_from: Vec<PathBuf>,

    /// Strip N leading components from member names on extraction.
    #[arg(long, value_name = "N", default_value_t = 0)]
    strip_components: usize,

    /// Archive and restore POSIX ACLs.
    #[arg(long)]
    acl: bool,

    /// Archive and restore extended attributes.
    #[arg(long)]
    xattrs: bool,

    /// Treat member names as shell patterns.
    #[arg(long)]
    wildcards: bool,

    /// Accepted for compatibility.
    #[arg(long)]
    numeric_owner: bool,

    /// Restore file ownership (default for root).
    #[arg(long, overrides_with = "no_same_owner")]
    same_owner: bool,

    /// Extract files as the invoking user.
    #[arg(long, overrides_with = "same_owner")]
    no_same_owner: bool,

    /// Restore permissions exactly (default for root).
    #[arg(long, overrides_with = "no_same_permissions")]
    same_permissions: bool,

    /// Apply the umask to extracted permissions.
    #[arg(long, overrides_with = "same_permissions")]
    no_same_permissions: bool,

    /// Files, directories or objects to archive, or members to extract and list.
    #[arg(value_name = "MEMBER")]
    members: Vec<String>,
}

/// Turn a legacy bundled first argument like `czvf` into `-czvf`.
pub fn rewrite_legacy<I: IntoIterator<Item = OsString>>(args: I) -> Vec<OsString> {
    let mut args: Vec<OsString> = args.into_iter().collect();
    if let Some(first) = args.get_mut(1) {
        let legacy = match first.to_str() {
            Some(text) => !text.is_empty() && text.chars().all(|c| LEGACY_FLAGS.contains(c)),
            None => false,
        };
        if legacy {
            let mut rewritten = OsString::from("-");
            rewritten.push(&*first);
            *first = rewritten;
        }
    }
    args
}

fn tristate(yes: bool, no: bool) -> Option<bool> {
    match (yes, no) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl Cli {
    fn compression(&self) -> Result<Compression, Error> {
        let mut selected = Vec::new();
        for (set, compression) in [
            (self.gzip, Compression::Gzip),
            (self.bzip2, Compression::Bzip2),
            (self.xz, Compression::Xz),
            (self.zstd, Compression::Zstd),
            (self.lz4, Compression::Lz4),
        ] {
            if set {
                selected.push(compression);
            }
        }
        if let Some(name) = &self.compression {
            selected.push(name.parse()?);
        }

        match selected.as_slice() {
            [] => Ok(Compression::Auto),
            [first, rest @ ..] => {
                if rest.iter().any(|other| other != first) {
                    bail!("conflicting compression options");
                }
                Ok(*first)
            }
        }
    }

    pub fn into_run_options(self) -> Result<RunOptions, Error> {
        let mode = if self.create {
            Mode::Create
        } else if self.extract {
            Mode::Extract
        } else {
            Mode::List
        };

        let mut options = RunOptions::new(mode, self.file.as_str());
        options.compression = self.compression()?;
        options.compression_level = self.compression_level;
        options.same_owner = tristate(self.same_owner, self.no_same_owner);
        options.same_permissions = tristate(self.same_permissions, self.no_same_permissions);
        options.members = self.members;
        options.chdir = self.directory;
        options.suffix = self.suffix;
        options.exclude = self.exclude;
        options.exclude_from = self.exclude_from;
        options.strip_components = self.strip_components;
        options.verbose = self.verbose;
        options.to_stdout = self.to_stdout;
        options.wildcards = self.wildcards;
        options.numeric_owner = self.numeric_owner;
        options.xattrs = self.xattrs;
        options.acl = self.acl;
        Ok(options)
    }
}
