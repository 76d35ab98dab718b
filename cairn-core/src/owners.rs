//! Owner and group names for numeric ids, cached per process.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct OwnerNames {
    users: Mutex<HashMap<u32, Option<String>>>,
    groups: Mutex<HashMap<u32, Option<String>>>,
}

impl OwnerNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account name for `uid`, or `None` when the system has no entry.
    pub fn user(&self, uid: u32) -> Option<String> {
        self.users
            .lock()
            .entry(uid)
            .or_insert_with(|| lookup_user(uid))
            .clone()
    }

    pub fn group(&self, gid: u32) -> Option<String> {
        self.groups
            .lock()
            .entry(gid)
            .or_insert_with(|| lookup_group(gid))
            .clone()
    }
}

#[cfg(unix)]
fn lookup_user(uid: u32) -> Option<String> {
    use nix::unistd::{Uid, User};

    User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
}

#[cfg(unix)]
fn lookup_group(gid: u32) -> Option<String> {
    use nix::unistd::{Gid, Group};

    Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|g| g.name)
}

#[cfg(not(unix))]
fn lookup_user(_uid: u32) -> Option<String> {
    None
}

#[cfg(not(unix))]
fn lookup_group(_gid: u32) -> Option<String> {
    None
}
