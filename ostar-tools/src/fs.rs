//! File system helper utilities.

use nix::sys::stat::{umask, Mode};
use nix::unistd::{Gid, Group, Uid, User};

/// Query the process umask.
///
/// There is no way to read the mask without setting it, so this briefly replaces it and
/// restores the old value. Call it once, before any threads create files.
pub fn current_umask() -> u32 {
    let old = umask(Mode::from_bits_truncate(0o022));
    umask(old);
    old.bits() as u32
}

/// Look up the user name for a uid, if there is one.
pub fn user_name(uid: u32) -> Option<String> {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(user) => user.map(|user| user.name),
        Err(err) => {
            log::debug!("unable to look up user {} - {}", uid, err);
            None
        }
    }
}

/// Look up the group name for a gid, if there is one.
pub fn group_name(gid: u32) -> Option<String> {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(group) => group.map(|group| group.name),
        Err(err) => {
            log::debug!("unable to look up group {} - {}", gid, err);
            None
        }
    }
}

/// Whether the process runs with an effective uid of root.
pub fn is_privileged() -> bool {
    Uid::effective().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umask_is_restored() {
        let first = current_umask();
        assert_eq!(current_umask(), first);
        assert_eq!(first & !0o777, 0);
    }

    #[test]
    fn root_has_a_name() {
        assert_eq!(user_name(0).as_deref(), Some("root"));
    }
}
