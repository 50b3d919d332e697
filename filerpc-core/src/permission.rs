//! Permission engine: cascading rule files evaluated from a datasite root down to a path.
//!
//! Each directory may hold one [`RULE_FILE_NAME`]. Levels are applied root to leaf, one axis at
//! a time: an axis changes only at levels whose matching rules grant or deny it, and a terminal
//! rule locks the axes it names until a deeper terminal rule names them again.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::address::Datasites;

/// Name of the per-directory rule file.
pub const RULE_FILE_NAME: &str = "syft.perm.toml";

/// Principal that matches every identity.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Right {
    Read,
    Write,
    Admin,
}

impl Right {
    pub const ALL: [Right; 3] = [Right::Read, Right::Write, Right::Admin];
}

/// Effective rights of one principal on one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rights {
    pub read: bool,
    pub write: bool,
    pub admin: bool,
}

impl Rights {
    pub const NONE: Rights = Rights {
        read: false,
        write: false,
        admin: false,
    };
    pub const ALL: Rights = Rights {
        read: true,
        write: true,
        admin: true,
    };

    pub fn contains(&self, right: Right) -> bool {
        match right {
            Right::Read => self.read,
            Right::Write => self.write,
            Right::Admin => self.admin,
        }
    }

    fn set(&mut self, right: Right, granted: bool) {
        match right {
            Right::Read => self.read = granted,
            Right::Write => self.write = granted,
            Right::Admin => self.admin = granted,
        }
    }
}

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |on: bool, c: char| if on { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.read, 'r'),
            flag(self.write, 'w'),
            flag(self.admin, 'a')
        )
    }
}

/// One rule inside a rule file. Its scope is the directory holding the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionRule {
    /// Exact identity or [`WILDCARD`].
    pub principal: String,
    #[serde(default)]
    pub rights: Vec<Right>,
    /// Axes revoked at this level. A deny beats a grant on the same level.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<Right>,
    #[serde(default)]
    pub terminal: bool,
}

impl PermissionRule {
    pub fn new(principal: impl Into<String>, rights: &[Right], terminal: bool) -> Self {
        Self {
            principal: principal.into(),
            rights: rights.to_vec(),
            deny: Vec::new(),
            terminal,
        }
    }

    pub fn denying(mut self, rights: &[Right]) -> Self {
        self.deny = rights.to_vec();
        self
    }

    pub fn matches(&self, principal: &str) -> bool {
        self.principal == WILDCARD || self.principal == principal
    }

    fn names(&self, right: Right) -> bool {
        self.rights.contains(&right) || self.deny.contains(&right)
    }
}

/// Contents of one rule file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleFile {
    #[serde(default, rename = "rule")]
    pub rules: Vec<PermissionRule>,
}

impl RuleFile {
    pub fn parse(text: &str) -> Result<Self, PermissionError> {
        Ok(toml::from_str(text)?)
    }

    /// Rule file of `dir`, if there is one.
    pub fn load(dir: &Path) -> Result<Option<Self>, PermissionError> {
        match fs::read_to_string(dir.join(RULE_FILE_NAME)) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write this rule file into `dir` atomically.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, PermissionError> {
        fs::create_dir_all(dir)?;
        let text = toml::to_string_pretty(self)?;
        let path = dir.join(RULE_FILE_NAME);
        let temp = tempfile::Builder::new().prefix(".perm").tempfile_in(dir)?;
        fs::write(temp.path(), text)?;
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }
}

/// Fold rule levels (root first) into effective rights for `principal`.
pub fn evaluate<'a, I>(levels: I, principal: &str) -> Rights
where
    I: IntoIterator<Item = &'a [PermissionRule]>,
{
    #[derive(Clone, Copy, Default)]
    struct Axis {
        granted: bool,
        locked: bool,
    }

    let mut axes = [Axis::default(); 3];
    for rules in levels {
        let matching: Vec<&PermissionRule> =
            rules.iter().filter(|r| r.matches(principal)).collect();
        if matching.is_empty() {
            continue;
        }
        for (axis, right) in axes.iter_mut().zip(Right::ALL) {
            let naming: Vec<&&PermissionRule> =
                matching.iter().filter(|r| r.names(right)).collect();
            if naming.is_empty() {
                continue;
            }
            let terminal = naming.iter().any(|r| r.terminal);
            if axis.locked && !terminal {
                continue;
            }
            let granted = naming.iter().any(|r| r.rights.contains(&right));
            let denied = naming.iter().any(|r| r.deny.contains(&right));
            axis.granted = granted && !denied;
            axis.locked |= terminal;
        }
    }

    let mut rights = Rights::NONE;
    for (axis, right) in axes.iter().zip(Right::ALL) {
        rights.set(right, axis.granted);
    }
    rights
}

/// Computes effective rights by reading rule files under a datasites root. Never writes.
#[derive(Debug, Clone)]
pub struct PermissionEngine {
    datasites: Datasites,
}

impl PermissionEngine {
    pub fn new(datasites: Datasites) -> Self {
        Self { datasites }
    }

    /// Effective rights of `principal` on `path`.
    ///
    /// Paths outside the datasites root get no rights. The datasite owner always has all rights.
    pub fn compute(&self, path: &Path, principal: &str) -> Rights {
        let Ok(relative) = path.strip_prefix(self.datasites.root()) else {
            return Rights::NONE;
        };
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part),
                _ => return Rights::NONE,
            }
        }
        let Some((owner, rest)) = parts.split_first() else {
            return Rights::NONE;
        };
        if owner.to_str() == Some(principal) {
            return Rights::ALL;
        }
        if rest.is_empty() {
            return Rights::NONE;
        }

        // Levels run from the datasite root down to the target's parent.
        let mut dir = self.datasites.root().join(owner);
        let mut levels = Vec::with_capacity(rest.len());
        levels.push(self.load_level(&dir));
        for part in &rest[..rest.len() - 1] {
            dir.push(part);
            levels.push(self.load_level(&dir));
        }
        evaluate(levels.iter().map(Vec::as_slice), principal)
    }

    pub fn check(&self, path: &Path, principal: &str, right: Right) -> bool {
        self.compute(path, principal).contains(right)
    }

    fn load_level(&self, dir: &Path) -> Vec<PermissionRule> {
        match RuleFile::load(dir) {
            Ok(Some(file)) => file.rules,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "ignoring unreadable rule file: {e}");
                Vec::new()
            }
        }
    }
}

/// Error reading or writing a rule file.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("rule file i/o: {0}")]
    Io(#[from] io::Error),
    #[error("rule file parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("rule file render: {0}")]
    Render(#[from] toml::ser::Error),
}
