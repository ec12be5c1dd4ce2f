//! Privilege-drop helpers applied to a child between `fork` and `exec`.
use nix::unistd::{Group, Uid, User, getgid, getuid};
use std::io;
use std::path::PathBuf;

use crate::config::ProgramConfig;
use crate::error::SpawnError;

/// Resolved uid/gid/supplementary-groups a child should switch to before exec.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    supplementary: Vec<libc::gid_t>,
    home: Option<PathBuf>,
}

impl UserContext {
    /// Resolves `user`/`group` (by name) into uid/gid, requiring superuser if either
    /// is set and the daemon is not currently root.
    pub fn resolve(program: &ProgramConfig) -> Result<Self, SpawnError> {
        if program.user.is_none() && program.group.is_none() {
            return Ok(UserContext::default());
        }

        if !getuid().is_root() {
            return Err(SpawnError::Identity(
                program.name.clone(),
                io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "user/group switch requested but the daemon is not running as root",
                ),
            ));
        }

        let mut ctx = UserContext::default();

        if let Some(user_name) = &program.user {
            let user = lookup_user(program, user_name)?;
            ctx.uid = Some(user.uid.as_raw());
            ctx.gid = Some(user.gid.as_raw());
            ctx.home = Some(user.dir);
        }

        if let Some(group_name) = &program.group {
            let group = lookup_group(program, group_name)?;
            ctx.gid = Some(group.gid.as_raw());
        }

        if ctx.gid.is_none()
            && let Some(uid) = ctx.uid
        {
            let user = User::from_uid(Uid::from_raw(uid))
                .map_err(|err| SpawnError::Identity(program.name.clone(), io::Error::other(err)))?
                .ok_or_else(|| {
                    SpawnError::Identity(
                        program.name.clone(),
                        io::Error::other(format!("failed to reload user by uid {uid}")),
                    )
                })?;
            ctx.gid = Some(user.gid.as_raw());
        }

        Ok(ctx)
    }

    /// Home directory of the resolved user, if a `user` switch was requested.
    pub fn home(&self) -> Option<&PathBuf> {
        self.home.as_ref()
    }

    /// Applies the resolved uid/gid/supplementary groups in the current process.
    ///
    /// # Safety
    /// Must only be called in the child between `fork` and `exec`. Calling it in the
    /// supervisor process permanently drops the supervisor's own privileges.
    pub unsafe fn apply(&self) -> io::Result<()> {
        if self.uid.is_none() && self.gid.is_none() {
            return Ok(());
        }

        if !self.supplementary.is_empty() {
            let mut groups = self.supplementary.clone();
            groups.insert(0, self.gid.unwrap_or_else(|| getgid().as_raw()));
            if unsafe { libc::setgroups(groups.len(), groups.as_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if let Some(gid) = self.gid
            && unsafe { libc::setgid(gid) } != 0
        {
            return Err(io::Error::last_os_error());
        }

        if let Some(uid) = self.uid
            && unsafe { libc::setuid(uid) } != 0
        {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

fn lookup_user(program: &ProgramConfig, name: &str) -> Result<User, SpawnError> {
    User::from_name(name)
        .map_err(|err| SpawnError::Identity(program.name.clone(), io::Error::other(err)))?
        .ok_or_else(|| {
            SpawnError::Identity(
                program.name.clone(),
                io::Error::other(format!("user '{name}' not found")),
            )
        })
}

fn lookup_group(program: &ProgramConfig, name: &str) -> Result<Group, SpawnError> {
    Group::from_name(name)
        .map_err(|err| SpawnError::Identity(program.name.clone(), io::Error::other(err)))?
        .ok_or_else(|| {
            SpawnError::Identity(
                program.name.clone(),
                io::Error::other(format!("group '{name}' not found")),
            )
        })
}

/// Applies `umask` in the child. Must be called between `fork` and `exec`.
///
/// # Safety
/// Mutates the calling process's umask; only safe to call in a child about to exec.
pub unsafe fn apply_umask(mask: Option<u32>) {
    if let Some(mask) = mask {
        unsafe {
            libc::umask(mask as libc::mode_t);
        }
    }
}
