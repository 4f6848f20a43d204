use anyhow::Result;
use clap::{Parser, Subcommand};
use libugit::checkout::{self, CheckoutOpts};
use libugit::cmd;
use libugit::hash::HashAlgo;
use libugit::merge::{MergeOpts, MergeResults};
use libugit::protocol::fetch::FetchOpts;
use libugit::protocol::push::PushOpts;
use libugit::refs::GitRef;
use libugit::remote::{self, CloneOpts, Refspec};
use libugit::repo::{InitOpts, Repository};
use libugit::transport::RemoteCallbacks;
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(name = "ugit", about = "a pure-library git, with a thin face")]
struct Opts {
    /// run as if started in this directory
    #[arg(short = 'C', default_value = ".")]
    root_path: PathBuf,
    #[command(subcommand)]
    subcmd: SubCmd,
}

#[derive(Subcommand, Debug)]
enum SubCmd {
    /// create an empty repository
    Init {
        #[arg(default_value = ".")]
        path: PathBuf,
        #[arg(long)]
        bare: bool,
        /// object format: sha1 or sha256
        #[arg(long, default_value = "sha1")]
        object_format: String,
        #[arg(long = "initial-branch", short = 'b')]
        initial_branch: Option<String>,
    },
    /// stage file contents
    Add {
        #[arg(required_unless_present = "all")]
        pathspecs: Vec<String>,
        #[arg(short = 'A', long)]
        all: bool,
    },
    /// record the staged tree
    Commit {
        #[arg(short, long)]
        message: String,
    },
    /// working tree status
    Status,
    /// commit history of HEAD
    Log {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// manage branches
    Branch {
        name: Option<String>,
        #[arg(short = 'd', long)]
        delete: bool,
    },
    /// switch branches or restore a commit's tree
    Checkout {
        target: String,
        #[arg(short = 'b')]
        new_branch: bool,
        #[arg(short, long)]
        force: bool,
    },
    /// join another line of development
    Merge {
        branch: String,
        #[arg(long)]
        no_commit: bool,
        #[arg(long)]
        no_ff: bool,
    },
    /// find the best common ancestor
    MergeBase { a: String, b: String },
    /// create a tag
    Tag {
        name: String,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// print an object
    CatFile {
        /// object type is inferred; -t prints only the header
        spec: String,
        #[arg(short = 't')]
        type_only: bool,
    },
    /// hash (and optionally store) an object
    HashObject {
        file: PathBuf,
        #[arg(short = 'w')]
        write: bool,
        #[arg(short = 't', default_value = "blob")]
        obj_type: String,
    },
    /// write the staged tree and print its oid
    WriteTree,
    /// set a ref to an oid
    UpdateRef { name: String, oid: String },
    /// show a ref's history
    Reflog {
        #[arg(default_value = "HEAD")]
        name: String,
    },
    /// manage remotes
    Remote {
        #[command(subcommand)]
        action: RemoteCmd,
    },
    /// copy a repository
    Clone {
        url: String,
        path: Option<PathBuf>,
        #[arg(long)]
        bare: bool,
        #[arg(long)]
        depth: Option<u32>,
        #[arg(long, default_value = "2")]
        protocol: u8,
    },
    /// bring refs and objects from a remote
    Fetch {
        #[arg(default_value = "origin")]
        remote: String,
        #[arg(long)]
        depth: Option<u32>,
        #[arg(long, default_value = "2")]
        protocol: u8,
    },
    /// send refs and objects to a remote
    Push {
        #[arg(default_value = "origin")]
        remote: String,
        refspec: Option<String>,
        #[arg(short, long)]
        force: bool,
    },
    /// serve a fetch over stdio
    UploadPack { path: PathBuf },
    /// serve a push over stdio
    ReceivePack { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum RemoteCmd {
    Add { name: String, url: String },
    Remove { name: String },
    List,
}

pub fn run<T: Into<OsString> + Clone>(args: impl IntoIterator<Item = T>) -> Result<()> {
    let opts = Opts::parse_from(args);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if let SubCmd::Init { path, bare, object_format, initial_branch } = &opts.subcmd {
        let repo = Repository::init_opts(
            opts.root_path.join(path),
            InitOpts {
                bare: *bare,
                object_format: Some(HashAlgo::from_name(object_format)?),
                default_branch: initial_branch.clone(),
            },
        )?;
        writeln!(out, "Initialized empty repository in {}", repo.gitdir().display())?;
        return Ok(());
    }
    if let SubCmd::Clone { url, path, bare, depth, protocol } = &opts.subcmd {
        let dest = match path {
            Some(path) => path.clone(),
            None => PathBuf::from(
                url.trim_end_matches('/').rsplit('/').next().unwrap_or("repo").trim_end_matches(".git"),
            ),
        };
        let clone_opts = CloneOpts {
            bare: *bare,
            fetch: FetchOpts { depth: *depth, protocol_version: *protocol, ..Default::default() },
        };
        let repo = block_on(remote::clone(
            url,
            opts.root_path.join(dest),
            None,
            &clone_opts,
            &mut progress_callbacks(),
        ))?;
        writeln!(out, "Cloned into {}", repo.workdir().display())?;
        return Ok(());
    }

    let repo = Repository::find(&opts.root_path)?;
    match opts.subcmd {
        SubCmd::Init { .. } | SubCmd::Clone { .. } => unreachable!(),
        SubCmd::Add { pathspecs, all } => {
            if all {
                cmd::add_all(&repo)?
            } else {
                cmd::add(&repo, &pathspecs)?
            }
        }
        SubCmd::Commit { message } => {
            let oid = cmd::commit(&repo, message)?;
            writeln!(out, "{}", oid)?;
        }
        SubCmd::Status => {
            let status = libugit::status::status(&repo)?;
            for change in &status.staged {
                writeln!(out, "{:>12?}: {} (staged)", change.kind, change.path)?;
            }
            for change in &status.unstaged {
                writeln!(out, "{:>12?}: {}", change.kind, change.path)?;
            }
            for path in &status.unmerged {
                writeln!(out, "   unmerged: {}", path)?;
            }
            for path in &status.untracked {
                writeln!(out, "  untracked: {}", path)?;
            }
            if status.is_clean() {
                writeln!(out, "nothing to commit, working tree clean")?;
            }
        }
        SubCmd::Log { limit } => {
            for entry in cmd::log(&repo, limit)? {
                writeln!(out, "{:#} {}", entry.oid, entry.commit.subject())?;
            }
        }
        SubCmd::Branch { name, delete } => match name {
            Some(name) if delete => cmd::branch_delete(&repo, &name)?,
            Some(name) => cmd::branch_create(&repo, &name, None)?,
            None => {
                let current = repo.current_branch()?;
                for (name, _) in cmd::branches(&repo)? {
                    let marker = match &current {
                        Some(sym) if sym.short() == name => "*",
                        _ => " ",
                    };
                    writeln!(out, "{} {}", marker, name)?;
                }
            }
        },
        SubCmd::Checkout { target, new_branch, force } => {
            if new_branch {
                checkout::checkout_new_branch(&repo, &target)?;
            } else {
                let reference = match libugit::hash::Oid::from_str(&target) {
                    Ok(oid) => GitRef::Direct(oid),
                    Err(..) => GitRef::Symbolic(libugit::refs::SymbolicRef::new_branch(&target)?),
                };
                checkout::checkout_revision(&repo, reference, &CheckoutOpts { force })?;
            }
        }
        SubCmd::Merge { branch, no_commit, no_ff } => {
            let merge_opts = MergeOpts { no_commit, no_ff, ..Default::default() };
            let reference = GitRef::Symbolic(libugit::refs::SymbolicRef::new_branch(&branch)?);
            match libugit::merge::merge(&repo, reference, &merge_opts)? {
                MergeResults::Null => writeln!(out, "Already up to date.")?,
                MergeResults::FastForward { to, .. } => writeln!(out, "Fast-forward to {}", to)?,
                MergeResults::Merge(summary) => match summary.commit {
                    Some(commit) => writeln!(out, "Merge made: {}", commit)?,
                    None => writeln!(out, "Merge staged (no commit requested).")?,
                },
                MergeResults::Conflicts(conflicts) => {
                    write!(out, "{}", conflicts)?;
                    std::process::exit(1);
                }
            }
        }
        SubCmd::MergeBase { a, b } => {
            let a = repo.odb().expand_id(libugit::obj::Id::from_str(&a)?)?;
            let b = repo.odb().expand_id(libugit::obj::Id::from_str(&b)?)?;
            match libugit::graph::merge_base(&repo, a, b)? {
                Some(base) => writeln!(out, "{}", base)?,
                None => std::process::exit(1),
            }
        }
        SubCmd::Tag { name, message } => {
            let head = repo.fully_resolve_head()?;
            match message {
                Some(message) => {
                    cmd::tag_annotated(&repo, &name, head, message)?;
                }
                None => cmd::tag_lightweight(&repo, &name, head)?,
            }
        }
        SubCmd::CatFile { spec, type_only } => {
            if type_only {
                let header = cmd::cat_file_header(&repo, &spec)?;
                writeln!(out, "{}", header.obj_type)?;
            } else {
                match cmd::cat_file(&repo, &spec)? {
                    libugit::obj::ObjectKind::Blob(blob) => out.write_all(blob.bytes())?,
                    obj => write!(out, "{}", DisplayObject(obj))?,
                }
            }
        }
        SubCmd::HashObject { file, write, obj_type } => {
            let bytes = std::fs::read(&file)?;
            let oid = cmd::hash_object(&repo, obj_type.parse()?, &bytes, write)?;
            writeln!(out, "{}", oid)?;
        }
        SubCmd::WriteTree => {
            writeln!(out, "{}", cmd::write_tree(&repo)?)?;
        }
        SubCmd::UpdateRef { name, oid } => {
            cmd::update_ref(&repo, &name, oid.parse()?)?;
        }
        SubCmd::Reflog { name } => {
            for entry in cmd::reflog(&repo, &name)?.entries.iter().rev() {
                writeln!(out, "{:#} {}", entry.new_oid, entry.msg)?;
            }
        }
        SubCmd::Remote { action } => match action {
            RemoteCmd::Add { name, url } => remote::add_remote(&repo, &name, &url)?,
            RemoteCmd::Remove { name } => remote::remove_remote(&repo, &name)?,
            RemoteCmd::List => {
                for remote in remote::ls_remotes(&repo)? {
                    writeln!(out, "{}\t{}", remote.name, remote.url)?;
                }
            }
        },
        SubCmd::Fetch { remote: name, depth, protocol } => {
            let fetch_opts = FetchOpts { depth, protocol_version: protocol, ..Default::default() };
            let summary = block_on(remote::fetch_remote(
                &repo,
                &name,
                None,
                &fetch_opts,
                &mut progress_callbacks(),
            ))?;
            writeln!(out, "Fetched {} objects from {}", summary.pack_objects, name)?;
        }
        SubCmd::Push { remote: name, refspec, force } => {
            let spec = match refspec {
                Some(spec) => Refspec::from_str(&spec)?,
                None => {
                    let branch = repo
                        .current_branch()?
                        .ok_or_else(|| anyhow::anyhow!("detached HEAD; name a refspec"))?;
                    Refspec::push_branch(branch.short(), force)
                }
            };
            let push_opts = PushOpts { force, ..Default::default() };
            block_on(remote::push_remote(
                &repo,
                &name,
                &[spec],
                None,
                &push_opts,
                &mut progress_callbacks(),
            ))?;
            writeln!(out, "Pushed to {}", name)?;
        }
        SubCmd::UploadPack { path } => {
            let repo = Repository::open(path)?;
            block_on(libugit::protocol::upload_pack::serve(
                &repo,
                tokio::io::BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            ))?;
        }
        SubCmd::ReceivePack { path } => {
            let repo = Repository::open(path)?;
            block_on(libugit::protocol::receive_pack::serve(
                &repo,
                tokio::io::BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            ))?;
        }
    }
    Ok(())
}

fn block_on<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
        .block_on(fut)
}

fn progress_callbacks() -> RemoteCallbacks {
    RemoteCallbacks {
        on_message: Some(Box::new(|msg| eprintln!("remote: {}", msg))),
        on_progress: None,
        on_auth: None,
    }
}

struct DisplayObject(libugit::obj::ObjectKind);

impl std::fmt::Display for DisplayObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            libugit::obj::ObjectKind::Blob(blob) => write!(f, "{}", blob),
            libugit::obj::ObjectKind::Tree(tree) => write!(f, "{}", tree),
            libugit::obj::ObjectKind::Commit(commit) => write!(f, "{}", commit),
            libugit::obj::ObjectKind::Tag(tag) => write!(f, "{}", tag),
        }
    }
}
