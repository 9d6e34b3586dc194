//! `key = value` metadata text, used both for the `PKGINFO` archive entry and
//! for human-written package definitions.

use crate::error::{PkgError, Result};
use bap_core::{BapError, Person, PkgInfo, Version};
use std::collections::BTreeMap;
use std::path::Path;

pub const HEADER: &str = "# This file was generated by bap. Do not edit by hand.";

/// Written in place of an absent author or maintainer.
pub const PLACEHOLDER_PERSON: &str = "nobody <nobody@example.com>";

pub const REQUIRED_FIELDS: [&str; 6] = ["name", "version", "desc", "depends", "author", "maintainer"];

pub fn serialize(pkg: &PkgInfo) -> String {
    let person = |p: &Option<Person>| {
        p.as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| PLACEHOLDER_PERSON.to_string())
    };

    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');
    out.push_str(&format!("name = {}\n", pkg.name));
    out.push_str(&format!("version = {}\n", pkg.version));
    out.push_str(&format!("desc = {}\n", pkg.desc));
    out.push_str(&format!("depends = {}\n", pkg.depends.join(" ")));
    out.push_str(&format!("author = {}\n", person(&pkg.author)));
    out.push_str(&format!("maintainer = {}\n", person(&pkg.maintainer)));
    out
}

/// Split metadata text into trimmed key/value pairs. Later duplicates win.
pub fn parse(text: &str) -> bap_core::Result<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (key, value) = trimmed
            .split_once('=')
            .ok_or(BapError::MalformedMetadata { line: idx + 1 })?;
        fields.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(fields)
}

pub fn to_pkginfo(fields: &BTreeMap<String, String>) -> bap_core::Result<PkgInfo> {
    if let Some(missing) = REQUIRED_FIELDS.iter().find(|k| !fields.contains_key(**k)) {
        return Err(BapError::MissingField(missing.to_string()));
    }
    let field = |key: &str| fields[key].as_str();

    let version: Version = field("version").parse()?;
    let mut pkg = PkgInfo::new(field("name"), version, field("desc"));
    pkg.depends = field("depends").split_whitespace().map(String::from).collect();
    pkg.author = parse_person(field("author"))?;
    pkg.maintainer = parse_person(field("maintainer"))?;
    Ok(pkg)
}

pub fn from_text(text: &str) -> bap_core::Result<PkgInfo> {
    to_pkginfo(&parse(text)?)
}

/// Read a declarative package definition file.
pub fn read_definition(path: &Path) -> Result<PkgInfo> {
    if !path.is_file() {
        return Err(PkgError::DefinitionNotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    Ok(from_text(&text)?)
}

fn parse_person(value: &str) -> bap_core::Result<Option<Person>> {
    if value.is_empty() || value == PLACEHOLDER_PERSON {
        return Ok(None);
    }
    value.parse().map(Some)
}
