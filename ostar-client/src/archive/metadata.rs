//! Extended attribute and ACL records, and object store metadata.
//!
//! Extended attributes are stored as PAX records `xattr.<query escaped name>` and ACLs as
//! `acl.<name>`, both carrying the base64 encoded value.

use std::collections::BTreeMap;

use anyhow::Error;

use ostar_tools::percent_encoding::{query_escape, query_unescape};
use ostar_tools::xattr::is_acl_like;

use super::{EntryHeader, MetadataFlags};
use crate::error::ArchiveError;

pub const XATTR_PREFIX: &str = "xattr.";
pub const ACL_PREFIX: &str = "acl.";

/// Approximate budget for user metadata on an object, S3 allows 2 KiB.
pub const OBJECT_METADATA_LIMIT: usize = 1500;

pub type Attributes = BTreeMap<String, Vec<u8>>;

fn decode_error(key: &str, reason: String) -> Error {
    ArchiveError::MetadataDecode {
        key: key.to_string(),
        reason,
    }
    .into()
}

pub fn encode_xattrs(header: &mut EntryHeader, xattrs: &Attributes) {
    for (name, value) in xattrs {
        header.extended_records.insert(
            format!("{}{}", XATTR_PREFIX, query_escape(name)),
            base64::encode(value),
        );
    }
}

pub fn decode_xattrs(header: &EntryHeader) -> Result<Attributes, Error> {
    let mut xattrs = Attributes::new();
    for (key, value) in &header.extended_records {
        let escaped = match key.strip_prefix(XATTR_PREFIX) {
            Some(escaped) => escaped,
            None => continue,
        };
        let name = query_unescape(escaped).map_err(|err| decode_error(key, err.to_string()))?;
        let value = base64::decode(value).map_err(|err| decode_error(key, err.to_string()))?;
        xattrs.insert(name, value);
    }
    Ok(xattrs)
}

pub fn encode_acls(header: &mut EntryHeader, acls: &Attributes) {
    for (name, value) in acls {
        header
            .extended_records
            .insert(format!("{}{}", ACL_PREFIX, name), base64::encode(value));
    }
}

pub fn decode_acls(header: &EntryHeader) -> Result<Attributes, Error> {
    let mut acls = Attributes::new();
    for (key, value) in &header.extended_records {
        let name = match key.strip_prefix(ACL_PREFIX) {
            Some(name) => name,
            None => continue,
        };
        let value = base64::decode(value).map_err(|err| decode_error(key, err.to_string()))?;
        acls.insert(name.to_string(), value);
    }
    Ok(acls)
}

/// Drop ACL-class attributes from a plain xattr set.
pub fn filter_acl_like(xattrs: Attributes) -> Attributes {
    xattrs
        .into_iter()
        .filter(|(name, _)| !is_acl_like(name))
        .collect()
}

/// Split the attributes read from a file into the xattr and ACL sets to archive.
pub fn prepare_for_archive(attrs: Attributes, flags: MetadataFlags) -> (Attributes, Attributes) {
    let (acls, xattrs): (Attributes, Attributes) =
        attrs.into_iter().partition(|(name, _)| is_acl_like(name));

    let xattrs = if flags.contains(MetadataFlags::XATTRS) {
        xattrs
    } else {
        Attributes::new()
    };
    let acls = if flags.contains(MetadataFlags::ACL) {
        acls
    } else {
        Attributes::new()
    };
    (xattrs, acls)
}

/// Decode the xattr and ACL sets of an entry which should be restored.
pub fn decode_for_extract(
    header: &EntryHeader,
    flags: MetadataFlags,
) -> Result<(Attributes, Attributes), Error> {
    let xattrs = if flags.contains(MetadataFlags::XATTRS) {
        filter_acl_like(decode_xattrs(header)?)
    } else {
        Attributes::new()
    };
    let acls = if flags.contains(MetadataFlags::ACL) {
        decode_acls(header)?
    } else {
        Attributes::new()
    };
    Ok((xattrs, acls))
}

/// Map a header to flat object metadata.
///
/// The second value tells whether the metadata stays within [`OBJECT_METADATA_LIMIT`].
pub fn header_to_object_metadata(header: &EntryHeader) -> (BTreeMap<String, String>, bool) {
    let mut meta = BTreeMap::new();
    meta.insert("type".to_string(), header.kind.typeflag().to_string());
    meta.insert("mode".to_string(), format!("{:o}", header.mode));
    meta.insert("uid".to_string(), header.uid.to_string());
    meta.insert("gid".to_string(), header.gid.to_string());
    meta.insert("mtime".to_string(), header.mtime.to_string());
    if !header.linkname.is_empty() {
        meta.insert("linkname".to_string(), header.linkname.clone());
    }
    if !header.uname.is_empty() {
        meta.insert("uname".to_string(), header.uname.clone());
    }
    if !header.gname.is_empty() {
        meta.insert("gname".to_string(), header.gname.clone());
    }

    let total: usize = meta.iter().map(|(k, v)| k.len() + v.len()).sum();
    (meta, total <= OBJECT_METADATA_LIMIT)
}
