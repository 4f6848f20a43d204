use super::{index_entries, worktree_entries, Entry, Filter, TreeIter};
use crate::error::GitResult;
use crate::hash::Oid;
use crate::repo::Repository;

/// One step of a synchronized walk: the union path plus the per-source
/// handles, `None` where a source lacks the path.
#[derive(Debug, Clone)]
pub struct WalkItem {
    pub path: String,
    pub slots: Vec<Option<Entry>>,
}

impl WalkItem {
    pub fn slot(&self, i: usize) -> Option<&Entry> {
        self.slots.get(i).and_then(|slot| slot.as_ref())
    }

    /// The first populated handle; at least one is always present.
    pub fn any(&self) -> &Entry {
        self.slots
            .iter()
            .flatten()
            .next()
            .expect("a walk item exists only because some source yielded it")
    }
}

/// What to walk. Tree sources take any tree oid so diffs between arbitrary
/// commits reuse the same machinery.
#[derive(Debug, Clone)]
pub enum WalkSource {
    Tree(Oid),
    Stage,
    Workdir,
}

type EntryStream = std::vec::IntoIter<Entry>;

/// A synchronized walk over the union of paths in every source, in tree
/// order, yielding per-source handles per path.
pub struct Walker {
    streams: Vec<std::iter::Peekable<EntryStream>>,
}

impl Walker {
    pub fn new(repo: &Repository, sources: &[WalkSource], filter: Filter) -> GitResult<Self> {
        let mut streams = vec![];
        for source in sources {
            let entries: Vec<Entry> = match source {
                WalkSource::Tree(oid) => {
                    TreeIter::new(repo, *oid, filter.clone())?.collect::<GitResult<Vec<_>>>()?
                }
                WalkSource::Stage => index_entries(&repo.index()?, &filter),
                WalkSource::Workdir => worktree_entries(repo, &filter)?,
            };
            streams.push(entries.into_iter().peekable());
        }
        Ok(Self { streams })
    }

    /// The smallest path at any stream head.
    fn next_path(&mut self) -> Option<String> {
        self.streams
            .iter_mut()
            .filter_map(|stream| stream.peek().map(|entry| entry.path.clone()))
            .min()
    }
}

impl Iterator for Walker {
    type Item = WalkItem;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.next_path()?;
        let slots = self
            .streams
            .iter_mut()
            .map(|stream| {
                if stream.peek().map(|entry| entry.path == path).unwrap_or(false) {
                    stream.next()
                } else {
                    None
                }
            })
            .collect();
        Some(WalkItem { path, slots })
    }
}

/// Walks `sources`, applying `f` to every union path.
pub fn walk(
    repo: &Repository,
    sources: &[WalkSource],
    filter: Filter,
    mut f: impl FnMut(WalkItem) -> GitResult<()>,
) -> GitResult<()> {
    for item in Walker::new(repo, sources, filter)? {
        f(item)?;
    }
    Ok(())
}
