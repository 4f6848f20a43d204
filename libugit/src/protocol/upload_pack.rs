//! The server side of fetch. One entry point per transport shape: a byte
//! advertisement, a one-shot request handler (stateless transports), and a
//! stateful stdio server for `ugit upload-pack`.

use super::caps::CapSet;
use super::AGENT;
use crate::error::{GitError, GitResult};
use crate::graph;
use crate::hash::Oid;
use crate::pkt::{self, Frame, PktReader, PktWriter};
use crate::refs::SymbolicRef;
use crate::repo::Repository;
use rustc_hash::FxHashSet;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncWrite};

fn server_caps(repo: &Repository) -> CapSet {
    let mut caps = CapSet::default();
    for flag in ["side-band-64k", "ofs-delta", "thin-pack", "shallow", "deepen-since", "deepen-not", "no-progress"] {
        caps.push(super::Capability::flag(flag));
    }
    if let Ok(Some(target)) = head_symref_target(repo) {
        caps.push(super::Capability::valued("symref", format!("HEAD:{}", target)));
    }
    caps.push(super::Capability::valued("object-format", repo.algo().name()));
    caps.push(super::Capability::parse(AGENT));
    caps
}

fn head_symref_target(repo: &Repository) -> GitResult<Option<String>> {
    Ok(match repo.read_head()? {
        crate::refs::GitRef::Symbolic(sym) => Some(sym.path().to_owned()),
        crate::refs::GitRef::Direct(..) => None,
    })
}

/// Advertised `(oid, name)` pairs: HEAD first, then sorted refs, each
/// annotated tag followed by its peeled `^{}` line.
fn advertised_refs(repo: &Repository) -> GitResult<Vec<(Oid, String)>> {
    let mut refs = vec![];
    if let Some(head) = repo.try_fully_resolve_head()? {
        refs.push((head, "HEAD".to_owned()));
    }
    for (name, oid) in repo.refdb().ls_refs()? {
        refs.push((oid, name.clone()));
        if let Ok(crate::obj::ObjectKind::Tag(tag)) = repo.read_obj(oid) {
            refs.push((tag.object, format!("{}^{{}}", name)));
        }
    }
    Ok(refs)
}

/// The ref discovery payload for `protocol_version` 1 or 2.
pub fn advertisement(repo: &Repository, protocol_version: u8) -> GitResult<Vec<u8>> {
    let mut out = vec![];
    if protocol_version == 2 {
        pkt::encode_str(&mut out, "version 2\n")?;
        pkt::encode_str(&mut out, &format!("{}\n", AGENT))?;
        pkt::encode_str(&mut out, "ls-refs\n")?;
        pkt::encode_str(&mut out, "fetch=shallow\n")?;
        pkt::encode_str(&mut out, &format!("object-format={}\n", repo.algo().name()))?;
        pkt::encode_flush(&mut out);
        return Ok(out);
    }

    let refs = advertised_refs(repo)?;
    let caps = server_caps(repo);
    match refs.split_first() {
        None => {
            let zero = Oid::zero(repo.algo());
            pkt::encode_str(&mut out, &format!("{} capabilities^{{}}\0{}\n", zero, caps.to_line()))?;
        }
        Some(((oid, name), rest)) => {
            pkt::encode_str(&mut out, &format!("{} {}\0{}\n", oid, name, caps.to_line()))?;
            for (oid, name) in rest {
                pkt::encode_str(&mut out, &format!("{} {}\n", oid, name))?;
            }
        }
    }
    pkt::encode_flush(&mut out);
    Ok(out)
}

#[derive(Debug, Default)]
struct FetchRequest {
    wants: Vec<Oid>,
    haves: Vec<Oid>,
    caps: CapSet,
    client_shallows: Vec<Oid>,
    depth: Option<u32>,
    deepen_since: Option<i64>,
    deepen_not: Vec<String>,
    done: bool,
}

impl FetchRequest {
    fn sideband(&self) -> bool {
        self.caps.contains("side-band-64k")
    }

    fn wants_progress(&self) -> bool {
        self.sideband() && !self.caps.contains("no-progress")
    }

    fn is_shallow_request(&self) -> bool {
        self.depth.is_some() || self.deepen_since.is_some() || !self.deepen_not.is_empty()
    }

    fn parse_line(&mut self, line: &str) -> GitResult<()> {
        if let Some(rest) = line.strip_prefix("want ") {
            // the first want smuggles the capability list
            let (oid, caps) = match rest.split_once(' ') {
                Some((oid, caps)) => (oid, Some(caps)),
                None => (rest, None),
            };
            self.wants.push(Oid::from_str(oid)?);
            if let Some(caps) = caps {
                self.caps = CapSet::parse(caps);
            }
        } else if let Some(oid) = line.strip_prefix("have ") {
            self.haves.push(Oid::from_str(oid)?);
        } else if let Some(oid) = line.strip_prefix("shallow ") {
            self.client_shallows.push(Oid::from_str(oid)?);
        } else if let Some(depth) = line.strip_prefix("deepen ") {
            self.depth = Some(depth.parse()?);
        } else if let Some(since) = line.strip_prefix("deepen-since ") {
            self.deepen_since = Some(since.parse()?);
        } else if let Some(name) = line.strip_prefix("deepen-not ") {
            self.deepen_not.push(name.to_owned());
        } else if line == "done" {
            self.done = true;
        } else if line == "thin-pack" || line == "ofs-delta" || line == "no-progress" {
            // v2 argument form of the v1 capabilities
            self.caps.push(super::Capability::flag(line));
        } else if line == "deepen-relative" || line.starts_with("agent=")
            || line.starts_with("object-format=")
        {
            // accepted and irrelevant to the reply
        } else {
            bail!(GitError::corrupt(format!("upload-pack request line `{}`", line)));
        }
        Ok(())
    }
}

/// Handles one complete request body (everything the client sends for a
/// fetch) and writes the complete response.
pub async fn handle_request<W: AsyncWrite + Unpin + Send>(
    repo: &Repository,
    request: &[u8],
    writer: W,
) -> GitResult<()> {
    let frames = pkt::decode_all(request)?;
    let first = frames.iter().find_map(|frame| match frame {
        Frame::Data(bytes) => Some(bytes.as_slice()),
        _ => None,
    });
    match first {
        None => Ok(()),
        Some(line) if line.starts_with(b"command=") => handle_v2(repo, frames, writer).await,
        Some(..) => handle_v1(repo, frames, writer).await,
    }
}

async fn handle_v1<W: AsyncWrite + Unpin + Send>(
    repo: &Repository,
    frames: Vec<Frame>,
    writer: W,
) -> GitResult<()> {
    let mut request = FetchRequest::default();
    for frame in frames {
        match frame {
            Frame::Data(bytes) => {
                let line = Frame::Data(bytes).text()?;
                request.parse_line(&line)?;
            }
            Frame::Flush | Frame::Delim => continue,
            Frame::End => break,
        }
    }
    if request.wants.is_empty() {
        return Ok(());
    }
    let mut writer = PktWriter::new(writer);

    let shallow_info = compute_shallow_info(repo, &request)?;
    if request.is_shallow_request() {
        for oid in &shallow_info.new_shallow {
            writer.write_text(format!("shallow {}\n", oid)).await?;
        }
        for oid in &shallow_info.unshallow {
            writer.write_text(format!("unshallow {}\n", oid)).await?;
        }
        writer.write_flush().await?;
    }

    // one-shot negotiation: acknowledge the best common tip, or NAK
    let common: Vec<Oid> = request
        .haves
        .iter()
        .copied()
        .filter(|&oid| repo.odb().contains(oid).unwrap_or(false))
        .collect();
    match common.first() {
        Some(oid) => writer.write_text(format!("ACK {}\n", oid)).await?,
        None => writer.write_text("NAK\n").await?,
    }

    send_pack(repo, &request, &shallow_info, common, &mut writer).await?;
    writer.flush().await
}

async fn handle_v2<W: AsyncWrite + Unpin + Send>(
    repo: &Repository,
    frames: Vec<Frame>,
    writer: W,
) -> GitResult<()> {
    let mut writer = PktWriter::new(writer);
    let mut lines = vec![];
    for frame in frames {
        match frame {
            Frame::Data(bytes) => lines.push(Frame::Data(bytes).text()?),
            _ => continue,
        }
    }
    let command = lines
        .first()
        .and_then(|line| line.strip_prefix("command="))
        .ok_or_else(|| GitError::corrupt("v2 request without a command"))?
        .to_owned();

    match command.as_str() {
        "ls-refs" => handle_ls_refs(repo, &lines, &mut writer).await,
        "fetch" => {
            let mut request = FetchRequest::default();
            for line in &lines[1..] {
                if line.starts_with("command=") {
                    continue;
                }
                request.parse_line(line)?;
            }
            // v2 always side-bands the packfile section
            request.caps.push(super::Capability::flag("side-band-64k"));
            if request.wants.is_empty() {
                writer.write_flush().await?;
                return Ok(());
            }
            let shallow_info = compute_shallow_info(repo, &request)?;
            if request.is_shallow_request() {
                writer.write_text("shallow-info\n").await?;
                for oid in &shallow_info.new_shallow {
                    writer.write_text(format!("shallow {}\n", oid)).await?;
                }
                for oid in &shallow_info.unshallow {
                    writer.write_text(format!("unshallow {}\n", oid)).await?;
                }
                writer.write_delim().await?;
            }
            let common: Vec<Oid> = request
                .haves
                .iter()
                .copied()
                .filter(|&oid| repo.odb().contains(oid).unwrap_or(false))
                .collect();
            writer.write_text("packfile\n").await?;
            send_pack(repo, &request, &shallow_info, common, &mut writer).await?;
            writer.flush().await
        }
        other => bail!("unknown protocol v2 command `{}`", other),
    }
}

async fn handle_ls_refs<W: AsyncWrite + Unpin + Send>(
    repo: &Repository,
    lines: &[String],
    writer: &mut PktWriter<W>,
) -> GitResult<()> {
    let mut prefixes = vec![];
    let mut symrefs = false;
    let mut peel = false;
    for line in &lines[1..] {
        if let Some(prefix) = line.strip_prefix("ref-prefix ") {
            prefixes.push(prefix.to_owned());
        } else if line == "symrefs" {
            symrefs = true;
        } else if line == "peel" {
            peel = true;
        }
    }
    let matches = |name: &str| {
        prefixes.is_empty() || prefixes.iter().any(|prefix| name.starts_with(prefix))
    };

    if let Some(head) = repo.try_fully_resolve_head()? {
        if matches("HEAD") {
            let mut line = format!("{} HEAD", head);
            if symrefs {
                if let Some(target) = head_symref_target(repo)? {
                    line.push_str(&format!(" symref-target:{}", target));
                }
            }
            line.push('\n');
            writer.write_text(line).await?;
        }
    }
    for (name, oid) in repo.refdb().ls_refs()? {
        if !matches(&name) {
            continue;
        }
        let mut line = format!("{} {}", oid, name);
        if peel {
            if let Ok(crate::obj::ObjectKind::Tag(tag)) = repo.read_obj(oid) {
                line.push_str(&format!(" peeled:{}", tag.object));
            }
        }
        line.push('\n');
        writer.write_text(line).await?;
    }
    writer.write_flush().await
}

#[derive(Debug, Default)]
struct ShallowInfo {
    /// commits whose ancestry the client must treat as truncated
    new_shallow: Vec<Oid>,
    /// previously-shallow commits the deepened fetch completes
    unshallow: Vec<Oid>,
    /// the commit set included by the depth limit (`None` = unlimited)
    included: Option<FxHashSet<Oid>>,
}

/// Depth-limited BFS from the wants. Boundary commits (cut parents) become
/// shallow; client shallows that are now fully included become unshallow.
fn compute_shallow_info(repo: &Repository, request: &FetchRequest) -> GitResult<ShallowInfo> {
    if !request.is_shallow_request() {
        return Ok(ShallowInfo::default());
    }
    let mut info = ShallowInfo::default();
    let mut included: FxHashSet<Oid> = Default::default();
    let mut frontier: Vec<Oid> = request.wants.clone();
    let mut depth_left = request.depth.unwrap_or(u32::MAX);
    let since = request.deepen_since;
    let not: Vec<Oid> = request
        .deepen_not
        .iter()
        .filter_map(|name| {
            let sym = SymbolicRef::new(name.clone());
            repo.refdb().try_fully_resolve(crate::refs::GitRef::Symbolic(sym)).ok().flatten()
        })
        .collect();

    while !frontier.is_empty() && depth_left > 0 {
        depth_left -= 1;
        let mut next = vec![];
        for oid in frontier {
            let commit = repo.peel_to_commit(oid)?;
            if let Some(since) = since {
                if commit.committer.time.seconds < since {
                    continue;
                }
            }
            if not.contains(&oid) || !included.insert(oid) {
                continue;
            }
            let at_boundary = depth_left == 0 && !commit.parents.is_empty();
            if at_boundary {
                info.new_shallow.push(oid);
            } else {
                next.extend(commit.parents.iter().copied());
            }
        }
        frontier = next;
    }

    for &shallow in &request.client_shallows {
        if included.contains(&shallow) && !info.new_shallow.contains(&shallow) {
            info.unshallow.push(shallow);
        }
    }
    info.included = Some(included);
    Ok(info)
}

/// Streams the pack for `wants - common`, side-banded when negotiated, with
/// progress on band 2.
async fn send_pack<W: AsyncWrite + Unpin + Send>(
    repo: &Repository,
    request: &FetchRequest,
    shallow_info: &ShallowInfo,
    common: Vec<Oid>,
    writer: &mut PktWriter<W>,
) -> GitResult<()> {
    // everything reachable from the common tips is skippable
    let mut skip: FxHashSet<Oid> = Default::default();
    if !common.is_empty() {
        graph::reachable_objects(repo, &common, &mut skip)?;
    }

    let objects: Vec<Oid> = match &shallow_info.included {
        None => graph::reachable_objects(repo, &request.wants, &mut skip)?,
        Some(included) => {
            // depth-limited: only included commits contribute, each with its
            // tree closure
            let mut out = vec![];
            for &oid in included {
                if skip.contains(&oid) {
                    continue;
                }
                let commit = repo.peel_to_commit(oid)?;
                skip.insert(oid);
                out.push(oid);
                out.extend(graph::reachable_objects(repo, &[commit.tree], &mut skip)?);
            }
            out
        }
    };

    if request.wants_progress() {
        writer
            .write_band(2, format!("Counting objects: {}, done.\n", objects.len()).as_bytes())
            .await?;
    }

    let mut raw_objects = Vec::with_capacity(objects.len());
    for oid in objects {
        raw_objects.push(repo.odb().read_raw(oid)?);
    }
    let (_, pack) = crate::pack::write_pack_to_vec(repo.algo(), &raw_objects)?;

    if request.sideband() {
        writer.write_band(1, &pack).await?;
        if request.wants_progress() {
            writer.write_band(2, b"Total objects written.\n").await?;
        }
        writer.write_flush().await?;
    } else {
        // raw pack bytes terminate the stream
        use tokio::io::AsyncWriteExt;
        writer.get_mut().write_all(&pack).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Stateful stdio service (`ugit upload-pack <dir>`): advertisement, then
/// one request, then the response.
pub async fn serve<R, W>(repo: &Repository, reader: R, writer: W) -> GitResult<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut reader = PktReader::new(reader);
    let mut writer = PktWriter::new(writer);
    use tokio::io::AsyncWriteExt;
    writer.get_mut().write_all(&advertisement(repo, 1)?).await?;
    writer.flush().await?;

    // collect the full request: wants/shallow/deepen then haves then done
    let mut request = vec![];
    let mut saw_want = false;
    loop {
        let frame = reader.recv_frame().await?;
        match &frame {
            Frame::Data(bytes) => {
                saw_want |= bytes.starts_with(b"want ");
                let done = bytes.as_slice() == b"done\n" || bytes.as_slice() == b"done";
                pkt::encode(&mut request, bytes)?;
                if done {
                    break;
                }
            }
            Frame::Flush => {
                pkt::encode_flush(&mut request);
                if !saw_want {
                    // client disconnected after the advertisement
                    return Ok(());
                }
            }
            Frame::Delim => pkt::encode_delim(&mut request),
            Frame::End => break,
        }
    }
    handle_request(repo, &request, writer.into_inner()).await
}
