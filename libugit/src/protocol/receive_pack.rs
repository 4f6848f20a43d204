//! The server side of push: advertise, take update commands plus a pack,
//! apply the updates with CAS against the advertised values, and report
//! per-ref status.

use super::caps::CapSet;
use super::AGENT;
use crate::error::{GitError, GitResult, GitResultExt};
use crate::graph;
use crate::hash::Oid;
use crate::pkt::{self, Frame, PktReader, PktWriter};
use crate::refs::{Expect, GitRef, RefUpdate, SymbolicRef};
use crate::repo::Repository;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncWrite};

fn server_caps(repo: &Repository) -> CapSet {
    let mut caps = CapSet::default();
    for flag in ["report-status", "delete-refs", "ofs-delta"] {
        caps.push(super::Capability::flag(flag));
    }
    caps.push(super::Capability::valued("object-format", repo.algo().name()));
    caps.push(super::Capability::parse(AGENT));
    caps
}

pub fn advertisement(repo: &Repository) -> GitResult<Vec<u8>> {
    let mut out = vec![];
    let caps = server_caps(repo);
    let refs = repo.refdb().ls_refs()?;
    let mut iter = refs.iter();
    match iter.next() {
        None => {
            let zero = Oid::zero(repo.algo());
            pkt::encode_str(&mut out, &format!("{} capabilities^{{}}\0{}\n", zero, caps.to_line()))?;
        }
        Some((name, oid)) => {
            pkt::encode_str(&mut out, &format!("{} {}\0{}\n", oid, name, caps.to_line()))?;
            for (name, oid) in iter {
                pkt::encode_str(&mut out, &format!("{} {}\n", oid, name))?;
            }
        }
    }
    pkt::encode_flush(&mut out);
    Ok(out)
}

#[derive(Debug, Clone)]
struct UpdateCommand {
    old: Oid,
    new: Oid,
    name: String,
}

impl UpdateCommand {
    fn parse(line: &str) -> GitResult<Self> {
        let mut words = line.split(' ');
        let mut next =
            || words.next().ok_or_else(|| GitError::corrupt(format!("update command `{}`", line)));
        let old = Oid::from_str(next()?)?;
        let new = Oid::from_str(next()?)?;
        let name = next()?.trim_end().to_owned();
        Ok(Self { old, new, name })
    }

    fn is_delete(&self) -> bool {
        self.new.is_zero()
    }

    fn is_create(&self) -> bool {
        self.old.is_zero()
    }
}

/// Handles one complete receive-pack request (commands plus pack) and
/// writes the report-status reply.
pub async fn handle_request<W: AsyncWrite + Unpin + Send>(
    repo: &Repository,
    request: &[u8],
    writer: W,
) -> GitResult<()> {
    let mut bytes = request;
    let mut commands = vec![];
    let mut caps = CapSet::default();
    loop {
        let (frame, consumed) = pkt::decode(bytes)?;
        bytes = &bytes[consumed..];
        match frame {
            Frame::Data(payload) => {
                let line = Frame::Data(payload).text()?;
                // the first command smuggles the client capability list
                let (command, cap_list) = match line.split_once('\0') {
                    Some((command, cap_list)) => (command, Some(cap_list)),
                    None => (line.as_str(), None),
                };
                if let Some(cap_list) = cap_list {
                    caps = CapSet::parse(cap_list);
                }
                commands.push(UpdateCommand::parse(command)?);
            }
            Frame::Flush => break,
            Frame::End => return Ok(()),
            Frame::Delim => bail!(GitError::corrupt("delimiter in receive-pack request")),
        }
    }
    if commands.is_empty() {
        return Ok(());
    }
    super::caps::check_object_format(&caps, repo.algo())?;

    // the pack follows the flush as raw bytes; absent when every command is
    // a delete
    let unpack_result = if bytes.is_empty() {
        Ok(())
    } else {
        repo.odb().index_pack(std::io::Cursor::new(bytes.to_vec())).map(|_| ())
    };

    let mut statuses = vec![];
    match &unpack_result {
        Ok(()) => {
            for command in &commands {
                statuses.push((command.name.clone(), apply_command(repo, command)));
            }
        }
        Err(..) => {
            for command in &commands {
                statuses.push((
                    command.name.clone(),
                    Err(anyhow!("unpack failed")),
                ));
            }
        }
    }

    // report-status is required for this reply shape
    let mut writer = PktWriter::new(writer);
    if caps.contains("report-status") {
        match &unpack_result {
            Ok(()) => writer.write_text("unpack ok\n").await?,
            Err(err) => writer.write_text(format!("unpack {}\n", err)).await?,
        }
        for (name, status) in &statuses {
            match status {
                Ok(()) => writer.write_text(format!("ok {}\n", name)).await?,
                Err(err) => writer.write_text(format!("ng {} {}\n", name, err)).await?,
            }
        }
        writer.write_flush().await?;
    }
    Ok(())
}

/// One ref update under the lock, CAS'd against the client's view of the
/// old value.
fn apply_command(repo: &Repository, command: &UpdateCommand) -> GitResult<()> {
    let sym = SymbolicRef::new(command.name.clone());
    ensure!(
        crate::refs::is_valid_name(sym.path()),
        GitError::InvalidRef(sym.path().to_owned())
    );
    let committer = repo
        .user_signature()
        .unwrap_or_else(|_| crate::signature::Signature::now("ugit", "ugit@receive-pack"));

    if command.is_delete() {
        let expect_current = repo.refdb().read_opt(&sym)?;
        match expect_current {
            Some(GitRef::Direct(oid)) if oid == command.old => {}
            _ => bail!("stale info"),
        }
        return repo.refdb().delete(&sym);
    }

    ensure!(
        repo.odb().contains(command.new)?,
        "missing necessary objects for {}",
        command.new
    );

    if !command.is_create() && repo.config().denynonfastforwards()? {
        let fast_forward = repo.odb().contains(command.old)?
            && graph::is_ancestor(repo, command.old, command.new)?;
        ensure!(fast_forward, "non-fast-forward");
    }

    let expect = if command.is_create() {
        Expect::MustNotExist
    } else {
        Expect::Value(GitRef::Direct(command.old))
    };
    repo.refdb()
        .update(
            &sym,
            GitRef::Direct(command.new),
            RefUpdate::new(committer, "push").expecting(expect),
        )
        .map_err(|err| {
            if err.is_not_found_err() {
                anyhow!("failed to lock")
            } else {
                err
            }
        })
}

/// Stateful stdio service (`ugit receive-pack <dir>`).
pub async fn serve<R, W>(repo: &Repository, reader: R, writer: W) -> GitResult<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    use tokio::io::AsyncWriteExt;
    let mut reader = PktReader::new(reader);
    let mut writer = PktWriter::new(writer);
    writer.get_mut().write_all(&advertisement(repo)?).await?;
    writer.flush().await?;

    // commands until flush, then the raw pack until EOF
    let mut request = vec![];
    loop {
        match reader.recv_frame().await? {
            Frame::Data(bytes) => pkt::encode(&mut request, &bytes)?,
            Frame::Flush => {
                pkt::encode_flush(&mut request);
                break;
            }
            Frame::Delim => pkt::encode_delim(&mut request),
            Frame::End => return Ok(()),
        }
    }
    request.extend(reader.read_remaining().await?);
    handle_request(repo, &request, writer.into_inner()).await
}
