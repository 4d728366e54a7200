//! Wrapper functions for the libc xattr calls
//!
//! All functions operate on paths without following symlinks.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;

/// `"system.posix_acl_access"`
pub const XATTR_ACL_ACCESS: &str = "system.posix_acl_access";

/// `"system.posix_acl_default"`
pub const XATTR_ACL_DEFAULT: &str = "system.posix_acl_default";

/// Check whether an attribute name belongs to the ACL class.
///
/// This covers the POSIX ACL access/default attributes and any other name mentioning "acl".
pub fn is_acl_like(name: &str) -> bool {
    name == XATTR_ACL_ACCESS || name == XATTR_ACL_DEFAULT || name.contains("acl")
}

fn path_to_cstring(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

/// Result of `llistxattr`, allows iterating over the attributes as a list of `&CStr`s.
///
/// Listing xattrs produces a list separated by zeroes, inherently making them available as `&CStr`
/// already, so we make use of this fact and reflect this in the interface.
pub struct ListXAttr {
    data: Vec<u8>,
}

impl<'a> IntoIterator for &'a ListXAttr {
    type Item = &'a CStr;
    type IntoIter = ListXAttrIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        ListXAttrIter {
            data: &self.data,
            at: 0,
        }
    }
}

/// Iterator over the extended attribute entries in a `ListXAttr`.
pub struct ListXAttrIter<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Iterator for ListXAttrIter<'a> {
    type Item = &'a CStr;

    fn next(&mut self) -> Option<&'a CStr> {
        let data = &self.data[self.at..];
        let next = data.iter().position(|b| *b == 0)? + 1;
        self.at += next;
        CStr::from_bytes_with_nul(&data[..next]).ok()
    }
}

/// Call `op` with growing buffers until the result fits.
fn with_growing_buffer<F>(mut op: F) -> Result<Vec<u8>, Errno>
where
    F: FnMut(&mut [u8]) -> isize,
{
    // Initial buffer size, if content does not fit it gets doubled until big enough.
    let mut size = 256usize;
    loop {
        let mut buffer = vec![0u8; size];
        let bytes = op(&mut buffer);
        if bytes >= 0 {
            buffer.truncate(bytes as usize);
            return Ok(buffer);
        }
        match Errno::last() {
            Errno::ERANGE => size = size.checked_mul(2).ok_or(Errno::ENOMEM)?,
            err => return Err(err),
        }
    }
}

/// Return a list of extended attributes accessible as an iterator over items of type `&CStr`.
pub fn llistxattr(path: &Path) -> Result<ListXAttr, Errno> {
    let c_path = path_to_cstring(path)?;
    let data = with_growing_buffer(|buffer| unsafe {
        libc::llistxattr(
            c_path.as_ptr(),
            buffer.as_mut_ptr() as *mut libc::c_char,
            buffer.len(),
        )
    })?;
    Ok(ListXAttr { data })
}

/// Get an extended attribute by name.
pub fn lgetxattr(path: &Path, name: &CStr) -> Result<Vec<u8>, Errno> {
    let c_path = path_to_cstring(path)?;
    with_growing_buffer(|buffer| unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            name.as_ptr(),
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
        )
    })
}

/// Set an extended attribute on a path.
pub fn lsetxattr(path: &Path, name: &str, data: &[u8]) -> Result<(), Errno> {
    let c_path = path_to_cstring(path)?;
    let c_name = CString::new(name).map_err(|_| Errno::EINVAL)?;
    let result = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            data.as_ptr() as *const libc::c_void,
            data.len(),
            0,
        )
    };
    if result < 0 {
        return Err(Errno::last());
    }

    Ok(())
}

/// Read all extended attributes of a path into name/value pairs.
///
/// Names which are not valid UTF-8 are skipped.
pub fn read_all(path: &Path) -> Result<Vec<(String, Vec<u8>)>, Errno> {
    let list = match llistxattr(path) {
        Ok(list) => list,
        Err(Errno::EOPNOTSUPP) => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut attrs = Vec::new();
    for name in &list {
        let value = match lgetxattr(path, name) {
            Ok(value) => value,
            // removed in the meantime
            Err(Errno::ENODATA) => continue,
            Err(err) => return Err(err),
        };
        match name.to_str() {
            Ok(name) => attrs.push((name.to_string(), value)),
            Err(_) => log::debug!("skipping non-utf8 xattr {:?} on {:?}", name, path),
        }
    }
    Ok(attrs)
}
