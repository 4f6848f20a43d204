//! The INI-ish config format with system/global/local/worktree scopes.
//! Lookups walk the chain most-specific-first; mutation is read-modify-
//! rewrite of a single scope under the usual lock discipline.

use crate::error::{GitGenericError, GitResult};
use crate::fs;
use crate::lockfile::{Lockfile, LockfileFlags};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

lazy_static! {
    static ref GLOBAL_PATH: Option<PathBuf> = dirs::home_dir().map(|home| home.join(".gitconfig"));
}

const SYSTEM_PATH: &str = "/etc/gitconfig";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigScope {
    System,
    Global,
    Local,
    Worktree,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConfigFile {
    sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq)]
struct Section {
    name: String,
    subsection: Option<String>,
    /// `None` value is the boolean-true shorthand (`[core]\n bare`)
    entries: Vec<(String, Option<String>)>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> GitResult<Self> {
        let mut sections: Vec<Section> = vec![];
        let mut logical_lines = vec![];
        let mut pending = String::new();
        for line in text.lines() {
            // trailing backslash continues the logical line
            if let Some(stripped) = line.strip_suffix('\\') {
                pending.push_str(stripped);
                continue;
            }
            pending.push_str(line);
            logical_lines.push(std::mem::take(&mut pending));
        }
        if !pending.is_empty() {
            logical_lines.push(pending);
        }

        for line in logical_lines {
            let line = strip_comment(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let header = header
                    .strip_suffix(']')
                    .ok_or_else(|| anyhow!("unterminated section header `{}`", line))?
                    .trim();
                let (name, subsection) = match header.split_once(' ') {
                    Some((name, sub)) => {
                        let sub = sub.trim();
                        let sub = sub
                            .strip_prefix('"')
                            .and_then(|s| s.strip_suffix('"'))
                            .ok_or_else(|| anyhow!("malformed subsection in `{}`", line))?;
                        (name, Some(sub.replace("\\\"", "\"").replace("\\\\", "\\")))
                    }
                    None => (header, None),
                };
                ensure!(
                    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.'),
                    "invalid section name `{}`",
                    name
                );
                sections.push(Section {
                    name: name.to_ascii_lowercase(),
                    subsection,
                    entries: vec![],
                });
                continue;
            }
            let section = sections
                .last_mut()
                .ok_or_else(|| anyhow!("config entry `{}` outside any section", line))?;
            match line.split_once('=') {
                Some((key, value)) => section
                    .entries
                    .push((key.trim().to_ascii_lowercase(), Some(unquote(value.trim())))),
                None => section.entries.push((line.to_ascii_lowercase(), None)),
            }
        }
        Ok(Self { sections })
    }

    /// Last definition wins, matching the on-disk override behavior.
    pub fn get(&self, section: &str, subsection: Option<&str>, key: &str) -> Option<&str> {
        let mut found = None;
        for s in &self.sections {
            if s.name != section || s.subsection.as_deref() != subsection {
                continue;
            }
            for (k, v) in &s.entries {
                if k == key {
                    found = Some(v.as_deref().unwrap_or("true"));
                }
            }
        }
        found
    }

    pub fn set(&mut self, section: &str, subsection: Option<&str>, key: &str, value: &str) {
        let key = key.to_ascii_lowercase();
        let section_name = section.to_ascii_lowercase();
        if let Some(s) = self
            .sections
            .iter_mut()
            .find(|s| s.name == section_name && s.subsection.as_deref() == subsection)
        {
            if let Some(entry) = s.entries.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = Some(value.to_owned());
            } else {
                s.entries.push((key, Some(value.to_owned())));
            }
        } else {
            self.sections.push(Section {
                name: section_name,
                subsection: subsection.map(str::to_owned),
                entries: vec![(key, Some(value.to_owned()))],
            });
        }
    }

    pub fn unset(&mut self, section: &str, subsection: Option<&str>, key: &str) -> bool {
        let mut removed = false;
        for s in &mut self.sections {
            if s.name == section && s.subsection.as_deref() == subsection {
                let before = s.entries.len();
                s.entries.retain(|(k, _)| k != key);
                removed |= s.entries.len() != before;
            }
        }
        removed
    }

    pub fn subsection_exists(&self, section: &str, subsection: &str) -> bool {
        self.sections
            .iter()
            .any(|s| s.name == section && s.subsection.as_deref() == Some(subsection))
    }

    pub fn remove_subsection(&mut self, section: &str, subsection: &str) -> bool {
        let before = self.sections.len();
        self.sections
            .retain(|s| !(s.name == section && s.subsection.as_deref() == Some(subsection)));
        self.sections.len() != before
    }

    /// All `(subsection, key, value)` triples of a section, e.g. every
    /// `remote.<name>.*` entry.
    pub fn subsections(&self, section: &str) -> Vec<(String, String, String)> {
        let mut out = vec![];
        for s in &self.sections {
            if s.name != section {
                continue;
            }
            let sub = match &s.subsection {
                Some(sub) => sub,
                None => continue,
            };
            for (k, v) in &s.entries {
                out.push((
                    sub.clone(),
                    k.clone(),
                    v.clone().unwrap_or_else(|| "true".to_owned()),
                ));
            }
        }
        out
    }

    pub fn to_file_contents(&self) -> String {
        let mut out = String::new();
        for s in &self.sections {
            match &s.subsection {
                Some(sub) => writeln!(
                    out,
                    "[{} \"{}\"]",
                    s.name,
                    sub.replace('\\', "\\\\").replace('"', "\\\"")
                )
                .unwrap(),
                None => writeln!(out, "[{}]", s.name).unwrap(),
            }
            for (k, v) in &s.entries {
                match v {
                    Some(v) => writeln!(out, "\t{} = {}", k, quote_if_needed(v)).unwrap(),
                    None => writeln!(out, "\t{}", k).unwrap(),
                }
            }
        }
        out
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '#' | ';' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        value.to_owned()
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.is_empty()
        || value.starts_with(' ')
        || value.ends_with(' ')
        || value.contains(['#', ';', '"'])
    {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_owned()
    }
}

pub trait ConfigValue: Sized {
    fn parse_config(s: &str) -> GitResult<Self>;
}

impl ConfigValue for String {
    fn parse_config(s: &str) -> GitResult<Self> {
        Ok(s.to_owned())
    }
}

impl ConfigValue for bool {
    fn parse_config(s: &str) -> GitResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" | "" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => bail!("failed to parse config value `{}` as a boolean", s),
        }
    }
}

impl ConfigValue for i64 {
    fn parse_config(s: &str) -> GitResult<Self> {
        let (digits, shift) = match s.chars().last() {
            Some('k') | Some('K') => (&s[..s.len() - 1], 10),
            Some('m') | Some('M') => (&s[..s.len() - 1], 20),
            Some('g') | Some('G') => (&s[..s.len() - 1], 30),
            _ => (s, 0),
        };
        Ok(i64::from_str(digits.trim())? << shift)
    }
}

struct CachedFile {
    mtime: Option<SystemTime>,
    file: ConfigFile,
}

/// The resolved configuration of one repository: a scope chain of files,
/// each cached and invalidated by mtime observation.
pub struct GitConfig {
    paths: Vec<(ConfigScope, PathBuf)>,
    cache: RwLock<FxHashMap<ConfigScope, CachedFile>>,
}

impl GitConfig {
    pub fn open(gitdir: &std::path::Path) -> Self {
        let mut paths = vec![(ConfigScope::System, PathBuf::from(SYSTEM_PATH))];
        if let Some(global) = GLOBAL_PATH.as_ref() {
            paths.push((ConfigScope::Global, global.clone()));
        }
        paths.push((ConfigScope::Local, gitdir.join("config")));
        paths.push((ConfigScope::Worktree, gitdir.join("config.worktree")));
        Self { paths, cache: Default::default() }
    }

    /// A chain with no global/system files; tests use this for hermeticity.
    pub fn isolated(gitdir: &std::path::Path) -> Self {
        let paths = vec![
            (ConfigScope::Local, gitdir.join("config")),
            (ConfigScope::Worktree, gitdir.join("config.worktree")),
        ];
        Self { paths, cache: Default::default() }
    }

    fn path_of(&self, scope: ConfigScope) -> GitResult<&PathBuf> {
        self.paths
            .iter()
            .find(|(s, _)| *s == scope)
            .map(|(_, path)| path)
            .ok_or_else(|| anyhow!("config scope {:?} unavailable", scope))
    }

    fn file(&self, scope: ConfigScope) -> GitResult<ConfigFile> {
        let path = self.path_of(scope)?;
        let mtime = fs::mtime(path);
        if let Some(cached) = self.cache.read().get(&scope) {
            if cached.mtime == mtime {
                return Ok(cached.file.clone());
            }
        }
        let file = match fs::read_optional_string(path)? {
            Some(text) => ConfigFile::parse(&text)?,
            None => ConfigFile::default(),
        };
        self.cache.write().insert(scope, CachedFile { mtime, file: file.clone() });
        Ok(file)
    }

    /// Most-specific scope wins: worktree, then local, global, system.
    pub fn get_raw(&self, section: &str, subsection: Option<&str>, key: &str) -> GitResult<Option<String>> {
        for (scope, _) in self.paths.iter().rev() {
            if let Some(value) = self.file(*scope)?.get(section, subsection, key) {
                return Ok(Some(value.to_owned()));
            }
        }
        Ok(None)
    }

    pub fn get<T: ConfigValue>(&self, section: &str, key: &str) -> GitResult<Option<T>> {
        self.get_raw(section, None, key)?.map(|v| T::parse_config(&v)).transpose()
    }

    pub fn get_sub<T: ConfigValue>(
        &self,
        section: &str,
        subsection: &str,
        key: &str,
    ) -> GitResult<Option<T>> {
        self.get_raw(section, Some(subsection), key)?.map(|v| T::parse_config(&v)).transpose()
    }

    /// Read-modify-rewrite of one scope under its lockfile.
    pub fn with_file_mut<R>(
        &self,
        scope: ConfigScope,
        f: impl FnOnce(&mut ConfigFile) -> GitResult<R>,
    ) -> GitResult<R> {
        let path = self.path_of(scope)?.clone();
        let result = Lockfile::with_mut(&path, LockfileFlags::empty(), |lockfile| {
            let mut file = match lockfile.file() {
                Some(existing) => {
                    let mut text = String::new();
                    let mut existing = existing;
                    std::io::Read::read_to_string(&mut existing, &mut text)?;
                    ConfigFile::parse(&text)?
                }
                None => ConfigFile::default(),
            };
            let r = f(&mut file)?;
            lockfile.write_all(file.to_file_contents().as_bytes())?;
            Ok(r)
        })?;
        self.cache.write().remove(&scope);
        Ok(result)
    }

    pub fn set_local(&self, section: &str, subsection: Option<&str>, key: &str, value: impl ToString) -> GitResult<()> {
        self.with_file_mut(ConfigScope::Local, |file| {
            file.set(section, subsection, key, &value.to_string());
            Ok(())
        })
    }

    pub fn subsections(&self, section: &str) -> GitResult<Vec<(String, String, String)>> {
        // collected across scopes, most specific last so it wins downstream
        let mut out = vec![];
        for (scope, _) in &self.paths {
            out.extend(self.file(*scope)?.subsections(section));
        }
        Ok(out)
    }
}

/// Typed accessor with a default, searching up the scope chain.
macro_rules! config_get {
    ($section:ident.$field:ident: $ty:ty, $default:expr) => {
        impl GitConfig {
            pub fn $field(&self) -> GitResult<$ty> {
                Ok(self
                    .get::<$ty>(stringify!($section), stringify!($field))?
                    .unwrap_or_else(|| $default))
            }
        }
    };
}

/// Typed accessor returning `None` when unset in every scope.
macro_rules! config_get_opt {
    ($section:ident.$field:ident: $ty:ty) => {
        impl GitConfig {
            pub fn $field(&self) -> GitResult<Option<$ty>> {
                self.get::<$ty>(stringify!($section), stringify!($field))
            }
        }
    };
}

config_get_opt!(user.name: String);
config_get_opt!(user.email: String);
config_get_opt!(core.bare: bool);
config_get_opt!(core.repositoryformatversion: i64);
config_get_opt!(extensions.objectformat: String);
config_get_opt!(ugit.chunkthreshold: i64);

config_get!(core.filemode: bool, true);
config_get!(init.defaultbranch: String, "master".to_owned());
config_get!(merge.conflictstyle: String, "merge".to_owned());
config_get!(protocol.version: i64, 2);
config_get!(receive.denynonfastforwards: bool, false);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sections_subsections_and_values() -> GitResult<()> {
        let text = r#"
[core]
    repositoryformatversion = 0
    filemode = true
    bare
[remote "origin"]
    url = https://example.com/repo.git
    fetch = +refs/heads/*:refs/remotes/origin/*
; comment
[pack]
    window = 16k  # inline comment
"#;
        let file = ConfigFile::parse(text)?;
        assert_eq!(file.get("core", None, "repositoryformatversion"), Some("0"));
        assert_eq!(file.get("core", None, "bare"), Some("true"));
        assert_eq!(file.get("remote", Some("origin"), "url"), Some("https://example.com/repo.git"));
        assert_eq!(file.get("pack", None, "window"), Some("16k"));
        assert_eq!(i64::parse_config("16k")?, 16 * 1024);
        Ok(())
    }

    #[test]
    fn last_definition_wins() -> GitResult<()> {
        let file = ConfigFile::parse("[a]\nx = 1\n[a]\nx = 2\n")?;
        assert_eq!(file.get("a", None, "x"), Some("2"));
        Ok(())
    }

    #[test]
    fn set_and_rewrite_roundtrip() -> GitResult<()> {
        let mut file = ConfigFile::parse("[user]\nname = A\n")?;
        file.set("user", None, "email", "a@b");
        file.set("remote", Some("origin"), "url", "file:///tmp/x");
        let reparsed = ConfigFile::parse(&file.to_file_contents())?;
        assert_eq!(reparsed.get("user", None, "email"), Some("a@b"));
        assert_eq!(reparsed.get("remote", Some("origin"), "url"), Some("file:///tmp/x"));
        Ok(())
    }

    #[test]
    fn scope_chain_most_specific_wins() -> GitResult<()> {
        let dir = tempfile::tempdir()?;
        let gitdir = dir.path().join(".git");
        std::fs::create_dir_all(&gitdir)?;
        std::fs::write(gitdir.join("config"), "[user]\nname = local\n")?;
        std::fs::write(gitdir.join("config.worktree"), "[user]\nname = worktree\n")?;
        let config = GitConfig::isolated(&gitdir);
        assert_eq!(config.get::<String>("user", "name")?, Some("worktree".to_owned()));
        Ok(())
    }

    #[test]
    fn mutation_invalidates_cache() -> GitResult<()> {
        let dir = tempfile::tempdir()?;
        let gitdir = dir.path().join(".git");
        std::fs::create_dir_all(&gitdir)?;
        let config = GitConfig::isolated(&gitdir);
        assert_eq!(config.get::<String>("user", "name")?, None);
        config.set_local("user", None, "name", "A")?;
        assert_eq!(config.get::<String>("user", "name")?, Some("A".to_owned()));
        Ok(())
    }
}
