//! Tar entry model, metadata codec and path rules shared by create and extract.

use std::collections::BTreeMap;
use std::io::Read;

use anyhow::{Context, Error};
use bitflags::bitflags;

pub mod metadata;
pub mod path;
pub mod pattern;

pub use metadata::Attributes;

bitflags! {
    /// Which extended metadata gets archived and restored.
    #[derive(Default)]
    pub struct MetadataFlags: u8 {
        /// Plain extended attributes
        const XATTRS = 0x1;
        /// POSIX ACLs
        const ACL = 0x2;
    }
}

/// Ownership and permission handling on extraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PermissionPolicy {
    pub same_owner: bool,
    pub same_perms: bool,
    /// Accepted for compatibility, has no effect.
    pub numeric_owner: bool,
    /// Process umask, applied to created entries unless `same_perms` is set.
    pub umask: u32,
}

impl PermissionPolicy {
    /// Privileged processes keep owner and permissions by default, explicit overrides win.
    pub fn resolve(
        privileged: bool,
        same_owner: Option<bool>,
        same_perms: Option<bool>,
        numeric_owner: bool,
        umask: u32,
    ) -> Self {
        Self {
            same_owner: same_owner.unwrap_or(privileged),
            same_perms: same_perms.unwrap_or(privileged),
            numeric_owner,
            umask,
        }
    }

    /// Mode bits for a newly created entry.
    pub fn creation_mode(&self, mode: u32) -> u32 {
        if self.same_perms {
            mode & 0o7777
        } else {
            mode & 0o777 & !self.umask
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    HardLink,
    /// Any other type, carrying the raw typeflag.
    Other(u8),
}

impl EntryKind {
    pub fn from_entry_type(entry_type: tar::EntryType) -> Self {
        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::Regular,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink => EntryKind::Symlink,
            tar::EntryType::Link => EntryKind::HardLink,
            other => EntryKind::Other(other.as_byte()),
        }
    }

    pub fn entry_type(&self) -> tar::EntryType {
        match self {
            EntryKind::Regular => tar::EntryType::Regular,
            EntryKind::Directory => tar::EntryType::Directory,
            EntryKind::Symlink => tar::EntryType::Symlink,
            EntryKind::HardLink => tar::EntryType::Link,
            EntryKind::Other(flag) => tar::EntryType::new(*flag),
        }
    }

    /// The tar typeflag byte.
    pub fn typeflag(&self) -> u8 {
        self.entry_type().as_byte()
    }
}

/// A decoded tar entry header.
///
/// `size` is the exact body length of the entry, whatever its type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub uid: u64,
    pub gid: u64,
    pub uname: String,
    pub gname: String,
    pub linkname: String,
    pub device: Option<(u32, u32)>,
    pub extended_records: BTreeMap<String, String>,
}

impl EntryHeader {
    pub fn new<S: Into<String>>(name: S, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            mode: 0,
            size: 0,
            mtime: 0,
            uid: 0,
            gid: 0,
            uname: String::new(),
            gname: String::new(),
            linkname: String::new(),
            device: None,
            extended_records: BTreeMap::new(),
        }
    }

    /// Decode the header of an entry read from a tar stream.
    pub fn from_entry<R: Read>(entry: &mut tar::Entry<R>) -> Result<Self, Error> {
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let linkname = entry
            .link_name_bytes()
            .map(|link| String::from_utf8_lossy(&link).into_owned())
            .unwrap_or_default();

        let mut extended_records = BTreeMap::new();
        if let Some(extensions) = entry
            .pax_extensions()
            .with_context(|| format!("failed to read pax header of {:?}", name))?
        {
            for extension in extensions {
                let extension =
                    extension.with_context(|| format!("bad pax record in {:?}", name))?;
                match (extension.key(), extension.value()) {
                    (Ok(key), Ok(value)) => {
                        extended_records.insert(key.to_string(), value.to_string());
                    }
                    _ => log::debug!("skipping non-utf8 pax record in {:?}", name),
                }
            }
        }

        let size = entry.size();
        let header = entry.header();
        let kind = EntryKind::from_entry_type(header.entry_type());
        let device = match (header.device_major(), header.device_minor()) {
            (Ok(Some(major)), Ok(Some(minor))) => Some((major, minor)),
            _ => None,
        };

        Ok(Self {
            kind,
            mode: header
                .mode()
                .with_context(|| format!("bad mode in header of {:?}", name))?,
            size,
            mtime: header.mtime().unwrap_or(0) as i64,
            uid: header.uid().unwrap_or(0),
            gid: header.gid().unwrap_or(0),
            uname: header.username().ok().flatten().unwrap_or_default().to_string(),
            gname: header.groupname().ok().flatten().unwrap_or_default().to_string(),
            linkname,
            device,
            extended_records,
            name,
        })
    }

    /// Build the ustar header, without the path and link name.
    pub fn to_tar_header(&self) -> tar::Header {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(self.kind.entry_type());
        header.set_mode(self.mode & 0o7777);
        header.set_size(self.size);
        header.set_mtime(self.mtime.max(0) as u64);
        header.set_uid(self.uid);
        header.set_gid(self.gid);
        if !self.uname.is_empty() {
            if let Err(err) = header.set_username(&self.uname) {
                log::debug!("dropping user name of {:?} - {}", self.name, err);
            }
        }
        if !self.gname.is_empty() {
            if let Err(err) = header.set_groupname(&self.gname) {
                log::debug!("dropping group name of {:?} - {}", self.name, err);
            }
        }
        if let Some((major, minor)) = self.device {
            let _ = header.set_device_major(major);
            let _ = header.set_device_minor(minor);
        }
        header
    }
}
