//! Privilege dropping
//!
//! Switches the process to the configured unprivileged group and user once
//! the listeners are bound. The switch is one-shot: [`PrivilegeManager`] is
//! consumed by [`PrivilegeManager::drop_privileges`].
//!
//! All system calls go through [`IdentityOps`], so the ordering and the
//! failure paths can be exercised without root.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::config::PrivilegeConfig;
use crate::severity::Notifier;

/// Privilege errors, all fatal
#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("Can't resolve the group name {0}.")]
    GroupNotFound(String),

    #[error("Can't change the group to {group}.\n{source}")]
    GroupChange {
        group: String,
        #[source]
        source: io::Error,
    },

    #[error("Can't resolve the user name {0}.")]
    UserNotFound(String),

    #[error("Can't change user to {user}.\n{source}")]
    UserChange {
        user: String,
        #[source]
        source: io::Error,
    },
}

/// A user or group: name and numeric id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub id: u32,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Identity lookups and transitions
pub trait IdentityOps: Send + Sync {
    /// Group id for a name, `None` if there is no such group
    fn resolve_group(&self, name: &str) -> io::Result<Option<u32>>;
    /// User id for a name, `None` if there is no such user
    fn resolve_user(&self, name: &str) -> io::Result<Option<u32>>;
    /// Replace the supplementary groups with `gid` alone
    fn set_groups(&self, gid: u32) -> io::Result<()>;
    fn set_gid(&self, gid: u32) -> io::Result<()>;
    fn set_uid(&self, uid: u32) -> io::Result<()>;
    fn current_user(&self) -> Identity;
    fn current_group(&self) -> Identity;
}

/// [`IdentityOps`] on the real process
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdentity;

#[cfg(unix)]
impl IdentityOps for SystemIdentity {
    fn resolve_group(&self, name: &str) -> io::Result<Option<u32>> {
        Ok(nix::unistd::Group::from_name(name)?.map(|group| group.gid.as_raw()))
    }

    fn resolve_user(&self, name: &str) -> io::Result<Option<u32>> {
        Ok(nix::unistd::User::from_name(name)?.map(|user| user.uid.as_raw()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn set_groups(&self, gid: u32) -> io::Result<()> {
        nix::unistd::setgroups(&[nix::unistd::Gid::from_raw(gid)])?;
        Ok(())
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn set_groups(&self, _gid: u32) -> io::Result<()> {
        Ok(())
    }

    fn set_gid(&self, gid: u32) -> io::Result<()> {
        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))?;
        Ok(())
    }

    fn set_uid(&self, uid: u32) -> io::Result<()> {
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))?;
        Ok(())
    }

    fn current_user(&self) -> Identity {
        let uid = nix::unistd::Uid::current();
        let name = nix::unistd::User::from_uid(uid)
            .ok()
            .flatten()
            .map(|user| user.name)
            .unwrap_or_else(|| uid.to_string());
        Identity {
            name,
            id: uid.as_raw(),
        }
    }

    fn current_group(&self) -> Identity {
        let gid = nix::unistd::Gid::current();
        let name = nix::unistd::Group::from_gid(gid)
            .ok()
            .flatten()
            .map(|group| group.name)
            .unwrap_or_else(|| gid.to_string());
        Identity {
            name,
            id: gid.as_raw(),
        }
    }
}

#[cfg(not(unix))]
impl IdentityOps for SystemIdentity {
    fn resolve_group(&self, _name: &str) -> io::Result<Option<u32>> {
        Ok(None)
    }

    fn resolve_user(&self, _name: &str) -> io::Result<Option<u32>> {
        Ok(None)
    }

    fn set_groups(&self, _gid: u32) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "not supported on this platform"))
    }

    fn set_gid(&self, _gid: u32) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "not supported on this platform"))
    }

    fn set_uid(&self, _uid: u32) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "not supported on this platform"))
    }

    fn current_user(&self) -> Identity {
        Identity {
            name: "unknown".to_string(),
            id: 0,
        }
    }

    fn current_group(&self) -> Identity {
        Identity {
            name: "unknown".to_string(),
            id: 0,
        }
    }
}

/// Result of a privilege transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegeOutcome {
    /// Neither user nor group configured
    Unchanged,
    /// Now running as these identities
    Changed { user: Identity, group: Identity },
}

/// One-shot transition to the configured identity
pub struct PrivilegeManager {
    user: String,
    group: String,
    ops: Box<dyn IdentityOps>,
    notifier: Notifier,
}

impl PrivilegeManager {
    pub fn with_ops(config: &PrivilegeConfig, ops: Box<dyn IdentityOps>, notifier: Notifier) -> Self {
        Self {
            user: config.user.trim().to_string(),
            group: config.group.trim().to_string(),
            ops,
            notifier,
        }
    }

    /// Whether a user or group is configured
    pub fn is_requested(&self) -> bool {
        !self.user.is_empty() || !self.group.is_empty()
    }

    /// Target (uid, gid) without changing anything
    ///
    /// Used to start module processes under the target identity. `None` when
    /// no change is requested or a name does not resolve.
    pub fn target_ids(&self) -> Option<(u32, u32)> {
        if !self.is_requested() {
            return None;
        }
        let gid = if self.group.is_empty() {
            self.ops.current_group().id
        } else {
            self.ops.resolve_group(&self.group).ok().flatten()?
        };
        let uid = if self.user.is_empty() {
            self.ops.current_user().id
        } else {
            self.ops.resolve_user(&self.user).ok().flatten()?
        };
        Some((uid, gid))
    }

    /// Switch group, then user
    ///
    /// Any failure is reported at Error severity and returned; the caller
    /// must not keep running at the half-changed privilege level.
    pub fn drop_privileges(self) -> Result<PrivilegeOutcome, PrivilegeError> {
        match self.transition() {
            Ok(outcome) => {
                match &outcome {
                    PrivilegeOutcome::Unchanged => {
                        self.notifier.info("No privilege change requested");
                    }
                    PrivilegeOutcome::Changed { user, group } => {
                        self.notifier.info(format!(
                            "Run as user: {}({}) and group: {}({})",
                            user.name, user.id, group.name, group.id
                        ));
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                self.notifier.error(e.to_string());
                Err(e)
            }
        }
    }

    fn transition(&self) -> Result<PrivilegeOutcome, PrivilegeError> {
        if !self.is_requested() {
            return Ok(PrivilegeOutcome::Unchanged);
        }

        if !self.group.is_empty() {
            let gid = self
                .ops
                .resolve_group(&self.group)
                .ok()
                .flatten()
                .ok_or_else(|| PrivilegeError::GroupNotFound(self.group.clone()))?;

            self.ops
                .set_groups(gid)
                .and_then(|()| self.ops.set_gid(gid))
                .map_err(|source| PrivilegeError::GroupChange {
                    group: self.group.clone(),
                    source,
                })?;
        }

        if !self.user.is_empty() {
            let uid = self
                .ops
                .resolve_user(&self.user)
                .ok()
                .flatten()
                .ok_or_else(|| PrivilegeError::UserNotFound(self.user.clone()))?;

            self.ops
                .set_uid(uid)
                .map_err(|source| PrivilegeError::UserChange {
                    user: self.user.clone(),
                    source,
                })?;
        }

        Ok(PrivilegeOutcome::Changed {
            user: self.ops.current_user(),
            group: self.ops.current_group(),
        })
    }
}
