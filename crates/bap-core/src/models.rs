use crate::error::{BapError, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Package version in the `MAJOR.MINOR.PATCH[-PRERELEASE][+BUILDINFO]` form.
///
/// Only string round-tripping is guaranteed; no ordering is defined on this
/// type. Use [`Version::to_semver`] when a comparison is needed.
///
/// An empty prerelease or build suffix is stored as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    prerelease: Option<String>,
    buildinfo: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            buildinfo: None,
        }
    }

    pub fn with_prerelease(mut self, prerelease: impl Into<String>) -> Self {
        self.prerelease = non_empty(&prerelease.into());
        self
    }

    pub fn with_buildinfo(mut self, buildinfo: impl Into<String>) -> Self {
        self.buildinfo = non_empty(&buildinfo.into());
        self
    }

    pub fn prerelease(&self) -> Option<&str> {
        self.prerelease.as_deref()
    }

    pub fn buildinfo(&self) -> Option<&str> {
        self.buildinfo.as_deref()
    }

    /// Strict semver view of this version, if it is one.
    pub fn to_semver(&self) -> Option<semver::Version> {
        semver::Version::parse(&self.to_string()).ok()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(build) = &self.buildinfo {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = BapError;

    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim();
        let invalid = || BapError::InvalidVersion(s.to_string());

        // Build info starts at the first '+', prerelease at the first '-' before it.
        let (rest, buildinfo) = match text.split_once('+') {
            Some((rest, build)) => (rest, non_empty(build)),
            None => (text, None),
        };
        let (core, prerelease) = match rest.split_once('-') {
            Some((core, pre)) => (core, non_empty(pre)),
            None => (rest, None),
        };

        let mut parts = core.split('.');
        let mut component = || -> Result<u64> {
            parts
                .next()
                .and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(invalid)
        };
        let major = component()?;
        let minor = component()?;
        let patch = component()?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            major,
            minor,
            patch,
            prerelease,
            buildinfo,
        })
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Package author or maintainer.
///
/// Serialized as `NAME <EMAIL>[ WEBSITE]`. The parser additionally accepts the
/// long form `NAME <EMAIL> (WEBSITE)` and only recognises a website inside
/// parentheses, so a website written by `Display` does not survive a reparse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    pub fullname: String,
    pub email: String,
    pub website: Option<String>,
}

impl Person {
    pub fn new(fullname: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            fullname: fullname.into(),
            email: email.into(),
            website: None,
        }
    }

    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }
}

impl fmt::Display for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.fullname, self.email)?;
        if let Some(website) = &self.website {
            write!(f, " {}", website)?;
        }
        Ok(())
    }
}

impl FromStr for Person {
    type Err = BapError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BapError::InvalidPerson(s.to_string());
        let (fullname, rest) = s.split_once('<').ok_or_else(invalid)?;
        let (email, tail) = rest.split_once('>').ok_or_else(invalid)?;
        let website = tail
            .split_once('(')
            .and_then(|(_, w)| w.split_once(')'))
            .map(|(w, _)| w.trim().to_string())
            .filter(|w| !w.is_empty());

        Ok(Self {
            fullname: fullname.trim().to_string(),
            email: email.trim().to_string(),
            website,
        })
    }
}

impl Serialize for Person {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Package identity as carried by archives, the installed database and
/// repository indexes.
///
/// `files` is `None` when ownership is unknown (e.g. a database row read
/// without file detail), which is not the same as owning nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PkgInfo {
    pub name: String,
    pub version: Version,
    pub desc: String,
    pub depends: Vec<String>,
    pub author: Option<Person>,
    pub maintainer: Option<Person>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

impl PkgInfo {
    pub fn new(name: impl Into<String>, version: Version, desc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            desc: desc.into(),
            depends: Vec::new(),
            author: None,
            maintainer: None,
            files: None,
        }
    }

    /// Same package with the given owned-file list.
    pub fn with_files(self, files: Vec<String>) -> Self {
        Self {
            files: Some(files),
            ..self
        }
    }
}

impl fmt::Display for PkgInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// A remote package source from the repository list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub name: String,
    pub url_repo_database: String,
    pub url_packages_root: String,
}
