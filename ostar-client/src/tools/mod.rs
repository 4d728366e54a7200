//! Environment driven settings for the object store backend.

use std::env::VarError::{NotPresent, NotUnicode};

use anyhow::{bail, Error};

const ENV_VAR_S3_SSE: &str = "OSTAR_S3_SSE";
const ENV_VAR_S3_SSE_KMS_KEY_ID: &str = "OSTAR_S3_SSE_KMS_KEY_ID";
const ENV_VAR_S3_PART_SIZE_MB: &str = "OSTAR_S3_PART_SIZE_MB";
const ENV_VAR_S3_CONCURRENCY: &str = "OSTAR_S3_CONCURRENCY";
const ENV_VAR_S3_MAX_RETRIES: &str = "OSTAR_S3_MAX_RETRIES";
const ENV_VAR_S3_USE_PATH_STYLE: &str = "OSTAR_S3_USE_PATH_STYLE";

/// S3 rejects multipart parts below 5 MiB (except for the last one).
const MIN_PART_SIZE_MB: u64 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerSideEncryption {
    None,
    Aes256,
    Kms { key_id: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S3Settings {
    pub encryption: ServerSideEncryption,
    pub part_size_mb: u64,
    pub concurrency: usize,
    pub max_retries: Option<u32>,
    pub path_style: bool,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            encryption: ServerSideEncryption::Aes256,
            part_size_mb: 16,
            concurrency: 4,
            max_retries: None,
            path_style: false,
        }
    }
}

impl S3Settings {
    pub fn from_env() -> Result<Self, Error> {
        let mut vars = Vec::new();
        for name in [
            ENV_VAR_S3_SSE,
            ENV_VAR_S3_SSE_KMS_KEY_ID,
            ENV_VAR_S3_PART_SIZE_MB,
            ENV_VAR_S3_CONCURRENCY,
            ENV_VAR_S3_MAX_RETRIES,
            ENV_VAR_S3_USE_PATH_STYLE,
        ] {
            match std::env::var(name) {
                Ok(value) => vars.push((name, value)),
                Err(NotUnicode(_)) => bail!("{} contains bad characters", name),
                Err(NotPresent) => {}
            }
        }
        Ok(Self::from_vars(|name| {
            vars.iter()
                .find(|(var, _)| *var == name)
                .map(|(_, value)| value.clone())
        }))
    }

    /// Build settings from a variable lookup. Unparsable numbers keep their defaults.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut settings = Self::default();

        let key_id = get(ENV_VAR_S3_SSE_KMS_KEY_ID);
        settings.encryption = match get(ENV_VAR_S3_SSE).map(|v| v.to_ascii_lowercase()) {
            None => ServerSideEncryption::Aes256,
            Some(mode) => match mode.as_str() {
                "aws:kms" | "sse-kms" => ServerSideEncryption::Kms { key_id },
                "none" => ServerSideEncryption::None,
                "aes256" | "sse-s3" => ServerSideEncryption::Aes256,
                other => {
                    log::warn!("unknown {} value {:?}, using AES256", ENV_VAR_S3_SSE, other);
                    ServerSideEncryption::Aes256
                }
            },
        };

        if let Some(size) = get(ENV_VAR_S3_PART_SIZE_MB).and_then(|v| v.parse::<u64>().ok()) {
            if size > 0 {
                settings.part_size_mb = size.max(MIN_PART_SIZE_MB);
            }
        }
        if let Some(count) = get(ENV_VAR_S3_CONCURRENCY).and_then(|v| v.parse::<usize>().ok()) {
            if count > 0 {
                settings.concurrency = count;
            }
        }
        settings.max_retries = get(ENV_VAR_S3_MAX_RETRIES).and_then(|v| v.parse().ok());
        settings.path_style = get(ENV_VAR_S3_USE_PATH_STYLE)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        settings
    }

    pub fn part_size(&self) -> usize {
        (self.part_size_mb as usize) * 1024 * 1024
    }
}

/// Content type for an uploaded object, derived from its key.
pub fn content_type_for_key(key: &str) -> Option<&'static str> {
    let key = key.trim().to_ascii_lowercase();
    let has = |suffixes: &[&str]| suffixes.iter().any(|suffix| key.ends_with(suffix));

    if has(&[".tgz", ".gz"]) {
        Some("application/gzip")
    } else if has(&[".tbz2", ".tbz", ".bz2"]) {
        Some("application/x-bzip2")
    } else if has(&[".txz", ".xz"]) {
        Some("application/x-xz")
    } else if has(&[".tzst", ".zstd", ".zst"]) {
        Some("application/zstd")
    } else if has(&[".tlz4", ".lz4"]) {
        Some("application/x-lz4")
    } else if has(&[".tar", ".tape"]) {
        Some("application/x-tar")
    } else {
        let base = key.rsplit('/').next().unwrap_or(&key);
        if base.contains('.') {
            None
        } else {
            Some("application/octet-stream")
        }
    }
}
