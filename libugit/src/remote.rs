use crate::checkout::{self, CheckoutOpts};
use crate::error::{GitError, GitGenericError, GitResult};
use crate::hash::Oid;
use crate::protocol::fetch::{self, FetchOpts, FetchSummary};
use crate::protocol::push::{self, PushOpts, PushSummary};
use crate::refs::{Expect, GitRef, RefUpdate, SymbolicRef};
use crate::repo::{InitOpts, Repository};
use crate::transport::{
    DaemonTransport, FileTransport, HttpClient, HttpTransport, RemoteCallbacks, SmartTransport,
    SshTransport,
};
use git_url_parse::GitUrl;
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::str::FromStr;

/// A fetch/push mapping like `+refs/heads/*:refs/remotes/origin/*`.
#[derive(Debug, Clone)]
pub struct Refspec {
    /// lhs of the `:`, `*` stripped
    src: String,
    /// rhs of the `:`, `*` stripped
    dst: String,
    forced: bool,
    glob: bool,
}

impl PartialEq for Refspec {
    fn eq(&self, other: &Self) -> bool {
        self.src == other.src && self.dst == other.dst && self.forced == other.forced
    }
}

impl Refspec {
    pub fn default_fetch_for_remote(remote_name: &str) -> Self {
        Self {
            src: "refs/heads/".to_owned(),
            dst: format!("refs/remotes/{}/", remote_name),
            forced: true,
            glob: true,
        }
    }

    /// A single-branch push spec (`main` -> `refs/heads/main:refs/heads/main`).
    pub fn push_branch(branch: &str, forced: bool) -> Self {
        let name = if branch.starts_with("refs/") {
            branch.to_owned()
        } else {
            format!("refs/heads/{}", branch)
        };
        Self { src: name.clone(), dst: name, forced, glob: false }
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Maps a source ref name to its destination, expanding globs.
    pub fn match_ref(&self, source: &str) -> Option<String> {
        if self.glob {
            let suffix = source.strip_prefix(self.src.as_str())?;
            Some(format!("{}{}", self.dst, suffix))
        } else if source == self.src {
            Some(self.dst.clone())
        } else {
            None
        }
    }

    /// The `(local source, remote destination)` pair of a push; a `None`
    /// source deletes the destination.
    pub fn push_pair(&self, _repo: &Repository) -> GitResult<(Option<SymbolicRef>, SymbolicRef)> {
        ensure!(!self.glob, "glob refspecs are not supported for push");
        let dst = SymbolicRef::new_valid(self.dst.clone())?;
        if self.src.is_empty() {
            return Ok((None, dst));
        }
        Ok((Some(SymbolicRef::new(self.src.clone())), dst))
    }
}

impl FromStr for Refspec {
    type Err = GitGenericError;

    // rough: full refspec semantics have more corners than anyone needs
    fn from_str(mut s: &str) -> GitResult<Self> {
        let forced = if s.starts_with('+') {
            s = &s[1..];
            true
        } else {
            false
        };
        let (src, dst) = match s.split_once(':') {
            Some((src, dst)) => (src, dst),
            // a lone name pushes/fetches a same-named branch
            None => (s, s),
        };
        let (src, src_is_glob) = match src.strip_suffix('*') {
            Some(stripped) => (stripped, true),
            None => (src, false),
        };
        let (dst, dst_is_glob) = match dst.strip_suffix('*') {
            Some(stripped) => (stripped, true),
            None => (dst, false),
        };
        let glob = match (src_is_glob, dst_is_glob) {
            (true, true) => true,
            (false, false) => false,
            _ => bail!("only one side of refspec `{}` is globbed", s),
        };
        Ok(Self { src: src.to_owned(), dst: dst.to_owned(), forced, glob })
    }
}

impl Display for Refspec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.forced {
            write!(f, "+")?;
        }
        let star = if self.glob { "*" } else { "" };
        write!(f, "{}{}:{}{}", self.src, star, self.dst, star)
    }
}

#[derive(Debug, PartialEq)]
pub struct Remote {
    pub name: String,
    pub url: String,
    pub fetch: Refspec,
}

pub fn add_remote(repo: &Repository, name: &str, url: &str) -> GitResult<()> {
    let config = repo.config();
    ensure!(
        config.get_sub::<String>("remote", name, "url")?.is_none(),
        GitError::AlreadyExists(format!("remote `{}`", name))
    );
    let refspec = Refspec::default_fetch_for_remote(name);
    config.with_file_mut(crate::config::ConfigScope::Local, |file| {
        file.set("remote", Some(name), "url", url);
        file.set("remote", Some(name), "fetch", &refspec.to_string());
        Ok(())
    })
}

pub fn remove_remote(repo: &Repository, name: &str) -> GitResult<()> {
    let removed = repo
        .config()
        .with_file_mut(crate::config::ConfigScope::Local, |file| {
            Ok(file.remove_subsection("remote", name))
        })?;
    ensure!(removed, "remote `{}` does not exist", name);
    Ok(())
}

pub fn get_remote(repo: &Repository, name: &str) -> GitResult<Remote> {
    let url = repo
        .config()
        .get_sub::<String>("remote", name, "url")?
        .ok_or_else(|| anyhow!("remote `{}` does not exist", name))?;
    let fetch = match repo.config().get_sub::<String>("remote", name, "fetch")? {
        Some(spec) => spec.parse()?,
        None => Refspec::default_fetch_for_remote(name),
    };
    Ok(Remote { name: name.to_owned(), url, fetch })
}

pub fn ls_remotes(repo: &Repository) -> GitResult<Vec<Remote>> {
    let mut names: Vec<String> = repo
        .config()
        .subsections("remote")?
        .into_iter()
        .map(|(name, ..)| name)
        .collect();
    names.sort();
    names.dedup();
    names.iter().map(|name| get_remote(repo, name)).collect()
}

/// Scheme-based transport dispatch. An explicit `http::`/`https::` prefix
/// forces the HTTP helper regardless of what the rest of the URL claims.
pub fn open_transport(
    url: &str,
    http_client: Option<Box<dyn HttpClient>>,
) -> GitResult<Box<dyn SmartTransport>> {
    if let Some(forced) = url.strip_prefix("http::").or_else(|| url.strip_prefix("https::")) {
        let client = http_client
            .ok_or_else(|| anyhow!(GitError::UnknownTransport("no http provider".to_owned())))?;
        return Ok(Box::new(HttpTransport::new(client, forced)));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        let client = http_client
            .ok_or_else(|| anyhow!(GitError::UnknownTransport("no http provider".to_owned())))?;
        return Ok(Box::new(HttpTransport::new(client, url)));
    }
    if let Some(rest) = url.strip_prefix("git://") {
        let (host_port, path) = rest
            .split_once('/')
            .ok_or_else(|| anyhow!(GitError::ParseUrl(url.to_owned())))?;
        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => (host, Some(port.parse::<u16>()?)),
            None => (host_port, None),
        };
        return Ok(Box::new(DaemonTransport::new(host, port, format!("/{}", path))));
    }
    if url.starts_with("file://") || Path::new(url).exists() {
        let path = url.strip_prefix("file://").unwrap_or(url);
        return Ok(Box::new(FileTransport::new(path)));
    }

    let parsed = GitUrl::parse(url).map_err(|_| anyhow!(GitError::ParseUrl(url.to_owned())))?;
    match parsed.host {
        Some(host) => {
            // scp-like and ssh:// urls
            let destination = match parsed.user {
                Some(user) => format!("{}@{}", user, host),
                None => host,
            };
            Ok(Box::new(SshTransport::new(destination, parsed.path)))
        }
        None => Err(anyhow!(GitError::UnknownTransport(url.to_owned()))),
    }
}

/// Wraps a network future with the caller-supplied deadline.
async fn with_deadline<T>(
    deadline: Option<std::time::Duration>,
    fut: impl std::future::Future<Output = GitResult<T>>,
) -> GitResult<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| anyhow!("network operation timed out"))?,
        None => fut.await,
    }
}

/// Fetches from a transport and applies the refspec to tracking refs, plus
/// tags and FETCH_HEAD. Auth failures retry once with credentials from
/// `on_auth`.
pub async fn fetch_with_transport(
    repo: &Repository,
    remote: &Remote,
    transport: &mut dyn SmartTransport,
    opts: &FetchOpts,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<FetchSummary> {
    let summary = match with_deadline(opts.deadline, fetch::fetch(repo, transport, opts, callbacks)).await {
        Err(err) if is_auth_failure(&err) => {
            let (user, pass) = callbacks
                .auth(&remote.url)
                .ok_or_else(|| anyhow!(err))?;
            transport.set_basic_auth(&user, &pass);
            with_deadline(opts.deadline, fetch::fetch(repo, transport, opts, callbacks)).await?
        }
        result => result?,
    };
    apply_fetched_refs(repo, remote, &summary)?;
    Ok(summary)
}

fn is_auth_failure(err: &GitGenericError) -> bool {
    matches!(
        err.downcast_ref::<GitError>(),
        Some(GitError::Http { status: 401 | 403, .. })
    )
}

fn apply_fetched_refs(repo: &Repository, remote: &Remote, summary: &FetchSummary) -> GitResult<()> {
    let committer = repo
        .user_signature()
        .unwrap_or_else(|_| crate::signature::Signature::now("ugit", "ugit@fetch"));
    let mut fetch_head = String::new();
    for (oid, name) in &summary.fetched {
        if !repo.odb().contains(*oid)? {
            continue;
        }
        if let Some(tracking) = remote.fetch.match_ref(name) {
            repo.refdb().update(
                &SymbolicRef::new(tracking),
                GitRef::Direct(*oid),
                RefUpdate::new(committer.clone(), format!("fetch: from {}", remote.url)),
            )?;
        } else if let Some(tag) = name.strip_prefix("refs/tags/") {
            // tags land under their own name, never clobbering local ones
            let sym = SymbolicRef::new_tag(tag)?;
            let result = repo.refdb().create(
                &sym,
                GitRef::Direct(*oid),
                RefUpdate::new(committer.clone(), "fetch: new tag"),
            );
            match result {
                Ok(()) => {}
                Err(err)
                    if err
                        .downcast_ref::<GitError>()
                        .map(|e| matches!(e, GitError::AlreadyExists(..)))
                        .unwrap_or(false) => {}
                Err(err) => return Err(err),
            }
        }
        let kind = if name == "HEAD" { "" } else { "branch " };
        fetch_head.push_str(&format!("{}\t\t{}'{}' of {}\n", oid, kind, name, remote.url));
    }
    if !fetch_head.is_empty() {
        std::fs::write(repo.gitdir().join("FETCH_HEAD"), fetch_head)?;
    }
    Ok(())
}

/// `fetch <remote>`: resolve config, open the transport, fetch.
pub async fn fetch_remote(
    repo: &Repository,
    remote_name: &str,
    http_client: Option<Box<dyn HttpClient>>,
    opts: &FetchOpts,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<FetchSummary> {
    let remote = get_remote(repo, remote_name)?;
    let mut transport = open_transport(&remote.url, http_client)?;
    fetch_with_transport(repo, &remote, transport.as_mut(), opts, callbacks).await
}

/// `push <remote> <refspec>...`.
pub async fn push_remote(
    repo: &Repository,
    remote_name: &str,
    refspecs: &[Refspec],
    http_client: Option<Box<dyn HttpClient>>,
    opts: &PushOpts,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<PushSummary> {
    let remote = get_remote(repo, remote_name)?;
    let mut transport = open_transport(&remote.url, http_client)?;
    let result = with_deadline(
        opts.deadline,
        push::push(repo, transport.as_mut(), refspecs, opts, callbacks),
    )
    .await;
    match result {
        Err(err) if is_auth_failure(&err) => {
            let (user, pass) = callbacks.auth(&remote.url).ok_or_else(|| anyhow!(err))?;
            transport.set_basic_auth(&user, &pass);
            with_deadline(
                opts.deadline,
                push::push(repo, transport.as_mut(), refspecs, opts, callbacks),
            )
            .await
        }
        result => result,
    }
}

#[derive(Debug, Clone, Default)]
pub struct CloneOpts {
    pub bare: bool,
    pub fetch: FetchOpts,
}

/// `clone <url> <path>`: init, configure origin, fetch, point HEAD at the
/// remote's default branch, check out.
pub async fn clone(
    url: &str,
    path: impl AsRef<Path>,
    http_client: Option<Box<dyn HttpClient>>,
    opts: &CloneOpts,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<Repository> {
    let repo = Repository::init_opts(
        path.as_ref(),
        InitOpts { bare: opts.bare, ..Default::default() },
    )?;
    add_remote(&repo, "origin", url)?;
    let remote = get_remote(&repo, "origin")?;
    let mut transport = open_transport(url, http_client)?;
    let summary =
        fetch_with_transport(&repo, &remote, transport.as_mut(), &opts.fetch, callbacks).await?;

    // prefer the advertised HEAD symref; fall back to any fetched branch
    let default_branch = summary
        .head_symref
        .clone()
        .or_else(|| {
            summary
                .fetched
                .iter()
                .find(|(_, name)| name.starts_with("refs/heads/"))
                .map(|(_, name)| name.clone())
        })
        .and_then(|name| name.strip_prefix("refs/heads/").map(str::to_owned));

    if let Some(branch) = default_branch {
        let branch_ref = SymbolicRef::new_branch(&branch)?;
        let target = summary
            .fetched
            .iter()
            .find(|(_, name)| name == &format!("refs/heads/{}", branch))
            .map(|&(oid, _)| oid)
            .or_else(|| {
                summary.fetched.iter().find(|(_, name)| name == "HEAD").map(|&(oid, _)| oid)
            });
        if let Some(oid) = target {
            let committer = crate::signature::Signature::now("ugit", "ugit@clone");
            repo.refdb().update(
                &branch_ref,
                GitRef::Direct(oid),
                RefUpdate::new(committer, format!("clone: from {}", url))
                    .expecting(Expect::Any),
            )?;
        }
        std::fs::write(
            repo.gitdir().join("HEAD"),
            GitRef::Symbolic(branch_ref.clone()).file_contents(),
        )?;
        if !opts.bare {
            if let Some(oid) = repo.refdb().try_fully_resolve(GitRef::Symbolic(branch_ref))? {
                callbacks.progress(crate::transport::Progress::UpdatingWorkingTree);
                let tree = repo.tree_oid_of_commit(oid)?;
                checkout::checkout(&repo, tree, &CheckoutOpts::default())?;
            }
        }
    }
    Ok(repo)
}

#[cfg(test)]
mod tests;
