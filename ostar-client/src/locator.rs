//! Parse archive and member references.
//!
//! A reference is either a local path, `-` for the standard streams, an `s3://bucket/key` URI
//! (with optional `?name=value` object metadata) or an S3 object/access point ARN.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Error;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::ArchiveError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    Local,
    Stdio,
    ObjectStore,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub raw: String,
    pub path: String,
    pub bucket: String,
    pub key: String,
    pub metadata: BTreeMap<String, String>,
}

impl Reference {
    pub fn local<S: Into<String>>(path: S) -> Self {
        let path = path.into();
        Self {
            kind: ReferenceKind::Local,
            raw: path.clone(),
            path,
            bucket: String::new(),
            key: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn stdio() -> Self {
        Self {
            kind: ReferenceKind::Stdio,
            raw: "-".to_string(),
            path: String::new(),
            bucket: String::new(),
            key: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn object<B: Into<String>, K: Into<String>>(bucket: B, key: K) -> Self {
        let bucket = bucket.into();
        let key = key.into();
        Self {
            kind: ReferenceKind::ObjectStore,
            raw: format!("s3://{}/{}", bucket, key),
            path: String::new(),
            bucket,
            key,
            metadata: BTreeMap::new(),
        }
    }

    /// File name or object key, used as hint for compression detection.
    pub fn name_hint(&self) -> &str {
        match self.kind {
            ReferenceKind::ObjectStore => &self.key,
            _ => &self.path,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_error(msg: String) -> Error {
    ArchiveError::Parse(msg).into()
}

/// Resolve an archive reference (`-f`), where `-` denotes the standard streams.
pub fn resolve(raw: &str) -> Result<Reference, Error> {
    if raw == "-" {
        return Ok(Reference::stdio());
    }
    resolve_member(raw)
}

/// Resolve a member reference. Members never refer to the standard streams.
pub fn resolve_member(raw: &str) -> Result<Reference, Error> {
    if raw.starts_with("s3://") {
        parse_s3_uri(raw)
    } else if raw.starts_with("arn:") {
        parse_s3_arn(raw)
    } else {
        Ok(Reference::local(raw))
    }
}

fn parse_s3_uri(raw: &str) -> Result<Reference, Error> {
    let url = Url::parse(raw).map_err(|err| parse_error(format!("invalid s3 uri {:?}: {}", raw, err)))?;

    let bucket = match url.host_str() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => return Err(parse_error(format!("s3 uri must include bucket: {:?}", raw))),
    };

    let path = percent_decode_str(url.path())
        .decode_utf8()
        .map_err(|err| parse_error(format!("invalid s3 key in {:?}: {}", raw, err)))?;
    let key = path.strip_prefix('/').unwrap_or(&path).to_string();

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        grouped
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }

    let mut metadata = BTreeMap::new();
    for (name, values) in grouped {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        metadata.insert(name.to_string(), values.join(","));
    }

    Ok(Reference {
        kind: ReferenceKind::ObjectStore,
        raw: raw.to_string(),
        path: String::new(),
        bucket,
        key,
        metadata,
    })
}

fn parse_s3_arn(raw: &str) -> Result<Reference, Error> {
    // arn:partition:service:region:account-id:resource
    let sections: Vec<&str> = raw.splitn(6, ':').collect();
    if sections.len() != 6 {
        return Err(parse_error(format!("invalid arn {:?}: not enough sections", raw)));
    }
    let (partition, service, region, account, resource) =
        (sections[1], sections[2], sections[3], sections[4], sections[5]);

    if service != "s3" {
        return Err(parse_error(format!("unsupported arn service {:?}", service)));
    }

    if resource.starts_with("accesspoint/") {
        return match resource.split_once("/object/") {
            Some((access_point, key)) if !key.is_empty() => {
                let bucket = format!(
                    "arn:{}:{}:{}:{}:{}",
                    partition, service, region, account, access_point
                );
                Ok(Reference {
                    kind: ReferenceKind::ObjectStore,
                    raw: raw.to_string(),
                    path: String::new(),
                    bucket,
                    key: key.to_string(),
                    metadata: BTreeMap::new(),
                })
            }
            _ => Err(parse_error(format!(
                "unsupported accesspoint arn {:?}, expected /object/<key>",
                raw
            ))),
        };
    }

    let resource = resource.strip_prefix(":::").unwrap_or(resource);
    let resource = resource.strip_prefix("bucket/").unwrap_or(resource);
    match resource.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Reference {
            kind: ReferenceKind::ObjectStore,
            raw: raw.to_string(),
            path: String::new(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            metadata: BTreeMap::new(),
        }),
        _ => Err(parse_error(format!(
            "unsupported s3 arn {:?}, expected object arn with bucket and key",
            raw
        ))),
    }
}

/// Compose an object key from a destination prefix and an entry name.
pub fn join_prefix(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_err(raw: &str) -> ArchiveError {
        resolve(raw)
            .unwrap_err()
            .downcast::<ArchiveError>()
            .unwrap()
    }

    #[test]
    fn local_and_stdio() {
        assert_eq!(resolve("-").unwrap().kind, ReferenceKind::Stdio);
        assert_eq!(resolve_member("-").unwrap().kind, ReferenceKind::Local);

        let local = resolve("backup/archive.tar").unwrap();
        assert_eq!(local.kind, ReferenceKind::Local);
        assert_eq!(local.path, "backup/archive.tar");
    }

    #[test]
    fn s3_uri_with_metadata() {
        let r = resolve("s3://bucket/dir/my%20file.tar?owner=ops&tag=a&tag=b&%20=x").unwrap();
        assert_eq!(r.kind, ReferenceKind::ObjectStore);
        assert_eq!(r.bucket, "bucket");
        assert_eq!(r.key, "dir/my file.tar");
        assert_eq!(r.metadata.len(), 2);
        assert_eq!(r.metadata["owner"], "ops");
        assert_eq!(r.metadata["tag"], "a,b");
    }

    #[test]
    fn s3_uri_without_key() {
        let r = resolve("s3://bucket").unwrap();
        assert_eq!(r.bucket, "bucket");
        assert_eq!(r.key, "");
        assert!(r.metadata.is_empty());
    }

    #[test]
    fn s3_uri_requires_bucket() {
        assert!(matches!(parse_err("s3:///key"), ArchiveError::Parse(_)));
    }

    #[test]
    fn object_arns() {
        let r = resolve("arn:aws:s3:::my-bucket/path/to/key.tgz").unwrap();
        assert_eq!(r.bucket, "my-bucket");
        assert_eq!(r.key, "path/to/key.tgz");

        let r = resolve("arn:aws:s3:us-east-1:123456789012:bucket/my-bucket/k").unwrap();
        assert_eq!(r.bucket, "my-bucket");
        assert_eq!(r.key, "k");
    }

    #[test]
    fn access_point_arn() {
        let r = resolve("arn:aws:s3:us-west-2:123456789012:accesspoint/ap1/object/a/b.tar").unwrap();
        assert_eq!(r.bucket, "arn:aws:s3:us-west-2:123456789012:accesspoint/ap1");
        assert_eq!(r.key, "a/b.tar");

        assert!(matches!(
            parse_err("arn:aws:s3:us-west-2:123456789012:accesspoint/ap1"),
            ArchiveError::Parse(_)
        ));
    }

    #[test]
    fn bad_arns() {
        assert!(matches!(parse_err("arn:aws:s3"), ArchiveError::Parse(_)));
        assert!(matches!(parse_err("arn:aws:sqs:::queue/x"), ArchiveError::Parse(_)));
        assert!(matches!(parse_err("arn:aws:s3:::bucket-only"), ArchiveError::Parse(_)));
        assert!(matches!(parse_err("arn:aws:s3:::bucket/"), ArchiveError::Parse(_)));
    }

    #[test]
    fn prefix_joining() {
        assert_eq!(join_prefix("", "a/b"), "a/b");
        assert_eq!(join_prefix("/restore/", "/a/b"), "restore/a/b");
        assert_eq!(join_prefix("restore", ""), "restore");
        assert_eq!(join_prefix("", ""), "");
    }
}
