//! The client side of push: compute ref updates from refspecs, send the
//! command list plus a pack of missing objects, parse report-status.

use super::caps::{check_object_format, CapSet};
use super::{Advertised, RefStatus, AGENT};
use crate::error::{GitError, GitResult};
use crate::graph;
use crate::hash::{HashAlgo, Oid};
use crate::pkt::{self, Frame, PktReader};
use crate::remote::Refspec;
use crate::repo::Repository;
use crate::transport::{Progress, RemoteCallbacks, Service, SmartTransport};
use rustc_hash::FxHashSet;

#[derive(Debug, Clone, Default)]
pub struct PushOpts {
    /// update even when not a fast-forward (refspec `+` also grants this)
    pub force: bool,
    /// compare-and-swap against this instead of the advertised value
    /// (`--force-with-lease=<ref>:<oid>` semantics)
    pub expected_old: Option<(String, Oid)>,
    pub deadline: Option<std::time::Duration>,
}

#[derive(Debug, Default)]
pub struct PushSummary {
    pub statuses: Vec<RefStatus>,
}

impl PushSummary {
    pub fn rejected(&self) -> Vec<(String, String)> {
        self.statuses
            .iter()
            .filter_map(|status| match status {
                RefStatus::Rejected { name, reason } => Some((name.clone(), reason.clone())),
                RefStatus::Ok(..) => None,
            })
            .collect()
    }
}

struct PlannedUpdate {
    old: Oid,
    new: Oid,
    name: String,
}

pub async fn push(
    repo: &Repository,
    transport: &mut dyn SmartTransport,
    refspecs: &[Refspec],
    opts: &PushOpts,
    callbacks: &mut RemoteCallbacks,
) -> GitResult<PushSummary> {
    // receive-pack speaks v0/v1 only
    let frames = transport.discover(Service::ReceivePack, 1).await?;
    let adv = Advertised::parse(frames, Service::ReceivePack)?;
    check_object_format(&adv.caps, repo.algo())?;
    ensure!(
        adv.caps.contains("report-status") || adv.caps.is_empty(),
        "server does not support report-status"
    );

    let updates = plan_updates(repo, &adv, refspecs, opts)?;
    if updates.is_empty() {
        return Ok(PushSummary::default());
    }

    let mut client_caps = CapSet::default();
    client_caps.push(super::Capability::flag("report-status"));
    if adv.caps.contains("delete-refs") && updates.iter().any(|update| update.new.is_zero()) {
        client_caps.push(super::Capability::flag("delete-refs"));
    }
    client_caps.push(super::Capability::parse(AGENT));
    if repo.algo() == HashAlgo::Sha256 {
        client_caps.push(super::Capability::valued("object-format", "sha256"));
    }
    let session = if adv.caps.is_empty() { client_caps } else { adv.caps.intersect(&client_caps) };

    let mut request = vec![];
    for (i, update) in updates.iter().enumerate() {
        let line = if i == 0 {
            format!("{} {} {}\0{}\n", update.old, update.new, update.name, session.to_line())
        } else {
            format!("{} {} {}\n", update.old, update.new, update.name)
        };
        pkt::encode_str(&mut request, &line)?;
    }
    pkt::encode_flush(&mut request);

    // pack of everything the remote is missing, fattened (never thin): new
    // tips minus whatever the server advertised that we also have
    let new_tips: Vec<Oid> =
        updates.iter().filter(|update| !update.new.is_zero()).map(|update| update.new).collect();
    if !new_tips.is_empty() {
        let mut skip: FxHashSet<Oid> = Default::default();
        let known_remote: Vec<Oid> = adv
            .refs
            .iter()
            .map(|&(oid, _)| oid)
            .filter(|&oid| repo.odb().contains(oid).unwrap_or(false))
            .collect();
        graph::reachable_objects(repo, &known_remote, &mut skip)?;
        let objects = graph::reachable_objects(repo, &new_tips, &mut skip)?;
        callbacks.progress(Progress::Counting { objects: objects.len() });
        let mut raw_objects = Vec::with_capacity(objects.len());
        for oid in objects {
            raw_objects.push(repo.odb().read_raw(oid)?);
        }
        let (_, pack) = crate::pack::write_pack_to_vec(repo.algo(), &raw_objects)?;
        request.extend(pack);
    }

    let response = transport.exchange(Service::ReceivePack, 1, request).await?;
    let mut reader = PktReader::new(response);
    let mut summary = PushSummary::default();
    let mut unpack_ok = false;
    loop {
        match reader.recv_frame().await? {
            Frame::Data(bytes) => {
                let line = Frame::Data(bytes).text()?;
                if let Some(status) = line.strip_prefix("unpack ") {
                    unpack_ok = status == "ok";
                    ensure!(unpack_ok, "remote failed to unpack: {}", status);
                } else if let Some(name) = line.strip_prefix("ok ") {
                    summary.statuses.push(RefStatus::Ok(name.to_owned()));
                } else if let Some(rest) = line.strip_prefix("ng ") {
                    let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
                    summary.statuses.push(RefStatus::Rejected {
                        name: name.to_owned(),
                        reason: reason.to_owned(),
                    });
                }
            }
            Frame::Flush | Frame::End => break,
            Frame::Delim => bail!(GitError::corrupt("delimiter in report-status")),
        }
    }

    let rejected = summary.rejected();
    if !rejected.is_empty() {
        bail!(GitError::PushRejected(rejected));
    }
    Ok(summary)
}

/// Expands refspecs against the advertisement into `(old, new, name)`
/// commands, enforcing fast-forward unless forced.
fn plan_updates(
    repo: &Repository,
    adv: &Advertised,
    refspecs: &[Refspec],
    opts: &PushOpts,
) -> GitResult<Vec<PlannedUpdate>> {
    let zero = Oid::zero(repo.algo());
    let mut updates = vec![];
    for refspec in refspecs {
        let force = opts.force || refspec.is_forced();
        let (src, dst) = refspec.push_pair(repo)?;
        let new = match &src {
            Some(src) => repo
                .refdb()
                .try_fully_resolve(crate::refs::GitRef::Symbolic(src.clone()))?
                .ok_or_else(|| anyhow!("push source `{}` does not exist", src))?,
            // a null source deletes the destination
            None => zero,
        };
        let advertised_old = adv.find_ref(dst.path()).unwrap_or(zero);
        let old = match &opts.expected_old {
            Some((name, expected)) if name == dst.path() => *expected,
            _ => advertised_old,
        };

        if new == old {
            continue;
        }
        if !new.is_zero() && !old.is_zero() && !force {
            // a non-fast-forward we cannot even verify (old not fetched) is
            // also rejected client-side
            ensure!(
                repo.odb().contains(old)?,
                GitError::CommitNotFetched(old)
            );
            ensure!(
                graph::is_ancestor(repo, old, new)?,
                "non-fast-forward update to `{}` (fetch first or force)",
                dst.path()
            );
        }
        updates.push(PlannedUpdate { old, new, name: dst.path().to_owned() });
    }
    Ok(updates)
}
