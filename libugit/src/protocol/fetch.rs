use super::caps::{check_object_format, CapSet};
use super::{Advertised, AGENT};
use crate::error::{GitError, GitResult};
use crate::hash::{HashAlgo, Oid};
use crate::pkt::{self, Frame, PktReader};
use crate::repo::Repository;
use crate::revwalk::RevWalk;
use crate::transport::{Progress, RemoteCallbacks, Service, SmartTransport};
use std::io::Cursor;
use std::str::FromStr;

/// How many `have` lines the one-shot negotiator sends; beyond this the
/// server simply sends a bigger pack than strictly necessary.
const MAX_HAVES: usize = 256;

#[derive(Debug, Clone)]
pub struct FetchOpts {
    /// 1 or 2; some servers mishandle v2 with shallow + single-branch, so
    /// callers can opt down
    pub protocol_version: u8,
    pub depth: Option<u32>,
    pub deepen_since: Option<i64>,
    pub deepen_not: Vec<String>,
    /// fetch only this branch (clone `--single-branch`)
    pub single_branch: Option<String>,
    /// accept thin packs (completed locally at index time)
    pub thin: bool,
    pub deadline: Option<std::time::Duration>,
}

impl Default for FetchOpts {
    fn default() -> Self {
        Self {
            protocol_version: 2,
            depth: None,
            deepen_since: None,
            deepen_not: vec![],
            single_branch: None,
            thin: true,
            deadline: None,
        }
    }
}

impl FetchOpts {
    pub fn from_config(repo: &Repository) -> GitResult<Self> {
        let version = repo.config().version()?;
        ensure!(version == 1 || version == 2, "protocol.version must be 1 or 2, got {}", version);
        Ok(Self { protocol_version: version as u8, ..Default::default() })
    }

    fn is_shallow_request(&self) -> bool {
        self.depth.is_some() || self.deepen_since.is_some() || !self.deepen_not.is_empty()
    }
}

/// What a fetch brought home. Ref updates are the caller's job (refspec
/// application differs between fetch, clone and pull).
#[derive(Debug, Default)]
pub struct FetchSummary {
    /// every ref the server advertised (v1) or listed (v2 ls-refs)
    pub remote_refs: Vec<(Oid, String)>,
    /// the branch the remote HEAD points at
    pub head_symref: Option<String>,
    /// oids we asked for and now have
    pub fetched: Vec<(Oid, String)>,
    pub pack_objects: u32,
}

pub async fn fetch(
    repo: &Repository,
    transport: &mut dyn SmartTransport,
    opts: &FetchOpts,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<FetchSummary> {
    let frames = transport.discover(Service::UploadPack, opts.protocol_version).await?;
    let adv = Advertised::parse(frames, Service::UploadPack)?;
    if adv.version == 2 && opts.protocol_version == 2 {
        fetch_v2(repo, transport, adv, opts, callbacks).await
    } else {
        fetch_v1(repo, transport, adv, opts, callbacks).await
    }
}

fn want_this_ref(name: &str, opts: &FetchOpts) -> bool {
    if let Some(branch) = &opts.single_branch {
        return name == "HEAD"
            || name == format!("refs/heads/{}", branch)
            || name == format!("refs/tags/{}", branch);
    }
    name == "HEAD" || name.starts_with("refs/heads/") || name.starts_with("refs/tags/")
}

/// The wants list: advertised refs we track, minus peeled entries.
fn select_wants(_repo: &Repository, refs: &[(Oid, String)], opts: &FetchOpts) -> Vec<(Oid, String)> {
    refs.iter()
        .filter(|(_, name)| !name.ends_with("^{}") && want_this_ref(name, opts))
        .map(|(oid, name)| (*oid, name.clone()))
        .collect()
}

/// Local tips offered as `have`s: every ref plus HEAD, walked newest-first.
fn local_haves(repo: &Repository) -> GitResult<Vec<Oid>> {
    let mut walk = RevWalk::new(repo);
    walk.push_head()?;
    for (_, oid) in repo.refdb().ls_refs()? {
        // annotated tags peel on push; ignore unpeelable tips
        if repo.peel_to_commit(oid).is_ok() {
            walk.push(oid)?;
        }
    }
    walk.take(MAX_HAVES).map(|c| c.map(|c| c.oid)).collect()
}

fn client_caps(repo: &Repository, server: &CapSet, opts: &FetchOpts) -> GitResult<CapSet> {
    // progress is always requested and surfaced through callbacks, so
    // `no-progress` is never offered
    let mut wanted = CapSet::default();
    for name in ["side-band-64k", "ofs-delta", "shallow", "deepen-since", "deepen-not"] {
        wanted.push(super::Capability::flag(name));
    }
    if opts.thin {
        wanted.push(super::Capability::flag("thin-pack"));
    }
    wanted.push(super::Capability::parse(AGENT));
    if repo.algo() == HashAlgo::Sha256 {
        wanted.push(super::Capability::valued("object-format", "sha256"));
    }
    let session = server.intersect(&wanted);
    check_object_format(server, repo.algo())?;
    if opts.is_shallow_request() {
        ensure!(server.contains("shallow"), "server does not support shallow fetches");
    }
    Ok(session)
}

async fn fetch_v1(
    repo: &Repository,
    transport: &mut dyn SmartTransport,
    adv: Advertised,
    opts: &FetchOpts,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<FetchSummary> {
    let mut summary = FetchSummary {
        remote_refs: adv.refs.clone(),
        head_symref: adv.head_symref().map(str::to_owned),
        ..Default::default()
    };
    let wants = select_wants(repo, &adv.refs, opts);
    summary.fetched = wants.clone();
    let needed: Vec<(Oid, String)> = wants
        .into_iter()
        .filter(|(oid, _)| !repo.odb().contains(*oid).unwrap_or(false))
        .collect();
    if needed.is_empty() {
        return Ok(summary);
    }

    let session = client_caps(repo, &adv.caps, opts)?;
    let sideband = session.contains("side-band-64k");

    let mut request = vec![];
    for (i, (oid, _)) in needed.iter().enumerate() {
        let line = if i == 0 {
            format!("want {} {}\n", oid, session.to_line())
        } else {
            format!("want {}\n", oid)
        };
        pkt::encode_str(&mut request, &line)?;
    }
    for root in repo.shallow_roots()? {
        pkt::encode_str(&mut request, &format!("shallow {}\n", root))?;
    }
    if let Some(depth) = opts.depth {
        pkt::encode_str(&mut request, &format!("deepen {}\n", depth))?;
    }
    if let Some(since) = opts.deepen_since {
        pkt::encode_str(&mut request, &format!("deepen-since {}\n", since))?;
    }
    for not in &opts.deepen_not {
        pkt::encode_str(&mut request, &format!("deepen-not {}\n", not))?;
    }
    pkt::encode_flush(&mut request);
    for have in local_haves(repo)? {
        pkt::encode_str(&mut request, &format!("have {}\n", have))?;
    }
    pkt::encode_str(&mut request, "done\n")?;

    let response = transport.exchange(Service::UploadPack, opts.protocol_version, request).await?;
    let mut reader = PktReader::new(response);

    if opts.is_shallow_request() {
        read_shallow_updates(repo, &mut reader).await?;
    }

    let pack = read_acks_then_pack(&mut reader, sideband, callbacks).await?;
    index_received_pack(repo, pack, &mut summary, callbacks)?;
    Ok(summary)
}

async fn fetch_v2(
    repo: &Repository,
    transport: &mut dyn SmartTransport,
    adv: Advertised,
    opts: &FetchOpts,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<FetchSummary> {
    ensure!(adv.v2_caps.contains("ls-refs"), "v2 server does not support ls-refs");
    ensure!(adv.v2_caps.contains("fetch"), "v2 server does not support fetch");
    check_object_format(&adv.v2_caps, repo.algo())?;

    // ls-refs round
    let mut request = vec![];
    pkt::encode_str(&mut request, "command=ls-refs\n")?;
    pkt::encode_str(&mut request, &format!("{}\n", AGENT))?;
    pkt::encode_delim(&mut request);
    pkt::encode_str(&mut request, "symrefs\n")?;
    pkt::encode_str(&mut request, "peel\n")?;
    match &opts.single_branch {
        Some(branch) => {
            pkt::encode_str(&mut request, "ref-prefix HEAD\n")?;
            pkt::encode_str(&mut request, &format!("ref-prefix refs/heads/{}\n", branch))?;
            pkt::encode_str(&mut request, &format!("ref-prefix refs/tags/{}\n", branch))?;
        }
        None => {
            pkt::encode_str(&mut request, "ref-prefix HEAD\n")?;
            pkt::encode_str(&mut request, "ref-prefix refs/heads/\n")?;
            pkt::encode_str(&mut request, "ref-prefix refs/tags/\n")?;
        }
    }
    pkt::encode_flush(&mut request);

    let response = transport.exchange(Service::UploadPack, 2, request).await?;
    let mut reader = PktReader::new(response);
    let mut summary = FetchSummary::default();
    loop {
        match reader.recv_frame().await? {
            Frame::Data(bytes) => {
                let line = Frame::Data(bytes).text()?;
                let mut words = line.split(' ');
                let oid = Oid::from_str(
                    words.next().ok_or_else(|| GitError::corrupt("empty ls-refs line"))?,
                )?;
                let name = words
                    .next()
                    .ok_or_else(|| GitError::corrupt(format!("ls-refs line `{}`", line)))?
                    .to_owned();
                for attr in words {
                    if let Some(target) = attr.strip_prefix("symref-target:") {
                        if name == "HEAD" {
                            summary.head_symref = Some(target.to_owned());
                        }
                    } else if let Some(peeled) = attr.strip_prefix("peeled:") {
                        summary.remote_refs.push((Oid::from_str(peeled)?, format!("{}^{{}}", name)));
                    }
                }
                summary.remote_refs.push((oid, name));
            }
            Frame::Flush | Frame::End => break,
            Frame::Delim => bail!(GitError::corrupt("delimiter in ls-refs response")),
        }
    }

    let wants = select_wants(repo, &summary.remote_refs, opts);
    summary.fetched = wants.clone();
    let needed: Vec<(Oid, String)> = wants
        .into_iter()
        .filter(|(oid, _)| !repo.odb().contains(*oid).unwrap_or(false))
        .collect();
    if needed.is_empty() {
        return Ok(summary);
    }
    if opts.is_shallow_request() {
        ensure!(
            adv.v2_caps.value_of("fetch").map(|v| v.contains("shallow")).unwrap_or(false),
            "v2 server does not support shallow fetches"
        );
    }

    // fetch round: capabilities are per-command in v2
    let mut request = vec![];
    pkt::encode_str(&mut request, "command=fetch\n")?;
    pkt::encode_str(&mut request, &format!("{}\n", AGENT))?;
    if repo.algo() == HashAlgo::Sha256 {
        pkt::encode_str(&mut request, "object-format=sha256\n")?;
    }
    pkt::encode_delim(&mut request);
    if opts.thin {
        pkt::encode_str(&mut request, "thin-pack\n")?;
    }
    pkt::encode_str(&mut request, "ofs-delta\n")?;
    for (oid, _) in &needed {
        pkt::encode_str(&mut request, &format!("want {}\n", oid))?;
    }
    for root in repo.shallow_roots()? {
        pkt::encode_str(&mut request, &format!("shallow {}\n", root))?;
    }
    if let Some(depth) = opts.depth {
        pkt::encode_str(&mut request, &format!("deepen {}\n", depth))?;
    }
    if let Some(since) = opts.deepen_since {
        pkt::encode_str(&mut request, &format!("deepen-since {}\n", since))?;
    }
    for not in &opts.deepen_not {
        pkt::encode_str(&mut request, &format!("deepen-not {}\n", not))?;
    }
    for have in local_haves(repo)? {
        pkt::encode_str(&mut request, &format!("have {}\n", have))?;
    }
    pkt::encode_str(&mut request, "done\n")?;
    pkt::encode_flush(&mut request);

    let response = transport.exchange(Service::UploadPack, 2, request).await?;
    let mut reader = PktReader::new(response);
    let mut pack = vec![];
    let mut received: u64 = 0;
    'sections: loop {
        let section = match reader.recv_frame().await? {
            Frame::Data(bytes) => Frame::Data(bytes).text()?,
            Frame::Flush | Frame::End => break,
            Frame::Delim => continue,
        };
        match section.as_str() {
            "shallow-info" => {
                let mut roots = repo.shallow_roots()?;
                loop {
                    match reader.recv_frame().await? {
                        Frame::Data(bytes) => {
                            let line = Frame::Data(bytes).text()?;
                            apply_shallow_line(&line, &mut roots)?;
                        }
                        Frame::Delim => break,
                        Frame::Flush | Frame::End => {
                            repo.write_shallow_roots(&roots)?;
                            break 'sections;
                        }
                    }
                }
                repo.write_shallow_roots(&roots)?;
            }
            "acknowledgments" | "wanted-refs" => loop {
                match reader.recv_frame().await? {
                    Frame::Data(..) => continue,
                    Frame::Delim => break,
                    Frame::Flush | Frame::End => break 'sections,
                }
            },
            "packfile" => loop {
                // the packfile section is always side-band framed
                match reader.recv_frame().await? {
                    Frame::Data(frame) => {
                        demux_band(&frame, &mut pack, callbacks)?;
                        received += frame.len() as u64;
                        callbacks.progress(Progress::ReceivingObjects { bytes: received });
                    }
                    Frame::Flush | Frame::End => break 'sections,
                    Frame::Delim => bail!(GitError::corrupt("delimiter inside packfile section")),
                }
            },
            other => bail!(GitError::corrupt(format!("unknown fetch response section `{}`", other))),
        }
    }

    index_received_pack(repo, pack, &mut summary, callbacks)?;
    Ok(summary)
}

fn apply_shallow_line(line: &str, roots: &mut Vec<Oid>) -> GitResult<()> {
    if let Some(oid) = line.strip_prefix("shallow ") {
        let oid = Oid::from_str(oid)?;
        if !roots.contains(&oid) {
            roots.push(oid);
        }
    } else if let Some(oid) = line.strip_prefix("unshallow ") {
        let oid = Oid::from_str(oid)?;
        roots.retain(|&root| root != oid);
    } else {
        bail!(GitError::corrupt(format!("shallow section line `{}`", line)));
    }
    Ok(())
}

/// Reads `shallow`/`unshallow` lines up to the flush and rewrites the
/// `shallow` file accordingly.
async fn read_shallow_updates<R: tokio::io::AsyncBufRead + Unpin + Send>(
    repo: &Repository,
    reader: &mut PktReader<R>,
) -> GitResult<()> {
    let mut roots = repo.shallow_roots()?;
    loop {
        match reader.recv_frame().await? {
            Frame::Data(bytes) => {
                let line = Frame::Data(bytes).text()?;
                if let Some(oid) = line.strip_prefix("shallow ") {
                    let oid = Oid::from_str(oid)?;
                    if !roots.contains(&oid) {
                        roots.push(oid);
                    }
                } else if let Some(oid) = line.strip_prefix("unshallow ") {
                    let oid = Oid::from_str(oid)?;
                    roots.retain(|&root| root != oid);
                } else {
                    bail!(GitError::corrupt(format!("shallow section line `{}`", line)));
                }
            }
            Frame::Flush => break,
            frame => bail!(GitError::corrupt(format!("unexpected frame {:?} in shallow section", frame))),
        }
    }
    repo.write_shallow_roots(&roots)
}

/// Consumes ACK/NAK lines then demuxes the (side-banded) pack stream.
async fn read_acks_then_pack<R: tokio::io::AsyncBufRead + Unpin + Send>(
    reader: &mut PktReader<R>,
    sideband: bool,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<Vec<u8>> {
    let mut pack = vec![];
    let mut received: u64 = 0;
    loop {
        let frame = match reader.recv_frame().await? {
            Frame::Data(bytes) => bytes,
            Frame::Flush | Frame::End => break,
            Frame::Delim => bail!(GitError::corrupt("unexpected delimiter in fetch response")),
        };
        if pack.is_empty() && (frame.starts_with(b"ACK") || frame.starts_with(b"NAK")) {
            trace!("negotiation reply: {}", String::from_utf8_lossy(&frame).trim_end());
            continue;
        }
        if sideband {
            demux_band(&frame, &mut pack, callbacks)?;
            received += frame.len() as u64;
            callbacks.progress(Progress::ReceivingObjects { bytes: received });
        } else {
            // without side-band the remainder of the stream is the raw pack
            pack.extend_from_slice(&frame);
            pack.extend(reader.read_remaining().await?);
            break;
        }
    }
    Ok(pack)
}

/// Routes one side-band frame: band 1 is pack data, band 2 is progress text
/// for the user, band 3 aborts.
pub(super) fn demux_band(
    frame: &[u8],
    pack: &mut Vec<u8>,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<()> {
    let (&band, payload) = frame
        .split_first()
        .ok_or_else(|| GitError::corrupt("empty side-band frame"))?;
    match band {
        1 => pack.extend_from_slice(payload),
        2 => callbacks.message(String::from_utf8_lossy(payload).trim_end()),
        3 => bail!("remote error: {}", String::from_utf8_lossy(payload).trim_end()),
        _ => bail!(GitError::corrupt(format!("side-band channel {}", band))),
    }
    Ok(())
}

pub(super) fn index_received_pack(
    repo: &Repository,
    pack: Vec<u8>,
    summary: &mut FetchSummary,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<()> {
    if pack.is_empty() {
        return Ok(());
    }
    let outcome = repo.odb().index_pack(Cursor::new(pack))?;
    callbacks.progress(Progress::ResolvingDeltas { total: outcome.object_count });
    summary.pack_objects = outcome.object_count;
    Ok(())
}
