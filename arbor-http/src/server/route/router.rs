//! The composite router: a trie over skeletonized paths for trie-able
//! routes, a linear scan for regex routes, and a negative cache keyed by
//! the routing-context summary.

use ahash::AHashMap;
use dashmap::DashMap;
use faststr::FastStr;

use super::{
    context::{RoutingContext, RoutingResult, RoutingSummary},
    Route, RouteError,
};

const DEFAULT_NEGATIVE_CACHE_CAPACITY: usize = 4096;

/// What to do when two registered routes collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionPolicy {
    /// Fail router construction.
    #[default]
    Error,
    /// Keep the first registration and log the collision.
    Warn,
    /// Keep the first registration silently.
    Ignore,
}

#[derive(Default)]
struct TrieNode {
    children: AHashMap<FastStr, TrieNode>,
    param: Option<Box<TrieNode>>,
    /// Routes terminating exactly here.
    entries: Vec<usize>,
    /// Prefix routes rooted here, matching this node and every deeper
    /// path.
    prefix_entries: Vec<usize>,
}

impl TrieNode {
    fn insert(&mut self, skeleton: &str, index: usize) {
        let mut node = self;
        for segment in skeleton[1..].split('/') {
            match segment {
                "*" => {
                    node.prefix_entries.push(index);
                    return;
                }
                ":" => {
                    node = node.param.get_or_insert_with(Default::default);
                }
                literal => {
                    node = node.children.entry(FastStr::new(literal)).or_default();
                }
            }
        }
        node.entries.push(index);
    }

    /// Collects every candidate along both literal and parameter edges,
    /// in traversal order (literal children before parameter children).
    fn collect(&self, segments: &[&str], out: &mut Vec<usize>) {
        out.extend(&self.prefix_entries);
        let Some((head, rest)) = segments.split_first() else {
            out.extend(&self.entries);
            return;
        };
        if let Some(child) = self.children.get(*head) {
            child.collect(rest, out);
        }
        if let Some(param) = &self.param {
            param.collect(rest, out);
        }
    }
}

struct TrieGroup {
    root: TrieNode,
}

struct SequentialGroup {
    order: Vec<usize>,
}

enum Group {
    Trie(TrieGroup),
    Sequential(SequentialGroup),
}

/// The route table: dispatches a context to the best-matching handler.
pub struct Router<V> {
    entries: Vec<(Route, V)>,
    groups: Vec<Group>,
    negative_cache: Option<DashMap<RoutingSummary, ()>>,
    negative_cache_capacity: usize,
}

impl<V> Router<V> {
    pub fn builder() -> RouterBuilder<V> {
        RouterBuilder::new()
    }

    /// Finds the single best match, or `None` with any delayed failure
    /// recorded on `ctx`.
    pub fn find(&self, ctx: &RoutingContext) -> Option<(&V, RoutingResult)> {
        // Every mapping rejects non-absolute paths; bail before the trie
        // walk does.
        if !ctx.path().starts_with('/') {
            return None;
        }
        if let Some(cache) = &self.negative_cache {
            if cache.contains_key(ctx.summary()) {
                return None;
            }
        }

        for group in &self.groups {
            let found = match group {
                Group::Trie(trie) => {
                    let segments: Vec<&str> = ctx.path()[1..].split('/').collect();
                    let mut candidates = Vec::new();
                    trie.root.collect(&segments, &mut candidates);
                    // Most constrained first; the sort is stable so the
                    // traversal order breaks ties.
                    candidates
                        .sort_by_key(|&i| std::cmp::Reverse(self.entries[i].0.complexity()));
                    self.best_match(&candidates, ctx)
                }
                Group::Sequential(seq) => self.best_match(&seq.order, ctx),
            };
            if let Some((index, result)) = found {
                return Some((&self.entries[index].1, result));
            }
        }

        // Cache pure misses only: a miss carrying a delayed failure must
        // re-run matching to record it again for the next request.
        if ctx.delayed_failure().is_none() {
            if let Some(cache) = &self.negative_cache {
                if cache.len() >= self.negative_cache_capacity {
                    cache.clear();
                }
                cache.insert(ctx.summary().clone(), ());
            }
        }
        None
    }

    fn best_match(&self, order: &[usize], ctx: &RoutingContext) -> Option<(usize, RoutingResult)> {
        let mut best: Option<(usize, RoutingResult)> = None;
        for &index in order {
            if let Some(result) = self.entries[index].0.apply(ctx) {
                if result.has_highest_score() {
                    return Some((index, result));
                }
                match &best {
                    None => best = Some((index, result)),
                    Some((_, current)) => {
                        // Ties keep the earlier candidate.
                        if result.score > current.score {
                            best = Some((index, result));
                        }
                    }
                }
            }
        }
        best
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.entries.iter().map(|(route, _)| route)
    }

    #[cfg(test)]
    fn negative_cache_len(&self) -> usize {
        self.negative_cache.as_ref().map(DashMap::len).unwrap_or(0)
    }
}

/// Builds a [`Router`] from (route, handler) registrations.
pub struct RouterBuilder<V> {
    entries: Vec<(Route, V)>,
    rejection: RejectionPolicy,
    negative_cache: bool,
    negative_cache_capacity: usize,
}

impl<V> Default for RouterBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RouterBuilder<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            rejection: RejectionPolicy::default(),
            negative_cache: true,
            negative_cache_capacity: DEFAULT_NEGATIVE_CACHE_CAPACITY,
        }
    }

    pub fn route(mut self, route: Route, handler: V) -> Self {
        self.entries.push((route, handler));
        self
    }

    pub fn rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection = policy;
        self
    }

    pub fn negative_cache(mut self, enabled: bool) -> Self {
        self.negative_cache = enabled;
        self
    }

    pub fn build(self) -> Result<Router<V>, RouteError> {
        let mut entries = self.entries;

        // Duplicate detection: group trie-able routes by skeleton and
        // compare each pair within a group.
        let mut by_skeleton: AHashMap<FastStr, Vec<usize>> = AHashMap::new();
        let mut rejected: Vec<usize> = Vec::new();
        for (index, (route, _)) in entries.iter().enumerate() {
            let Some(skeleton) = route.mapping().skeleton() else {
                continue;
            };
            let group = by_skeleton.entry(skeleton.clone()).or_default();
            if let Some(&existing) = group
                .iter()
                .find(|&&i| entries[i].0.conflicts_with(route))
            {
                match self.rejection {
                    RejectionPolicy::Error => {
                        return Err(RouteError::Duplicate {
                            existing: FastStr::new(entries[existing].0.meter_tag()),
                            new: FastStr::new(route.meter_tag()),
                        });
                    }
                    RejectionPolicy::Warn => {
                        tracing::warn!(
                            existing = entries[existing].0.meter_tag(),
                            new = route.meter_tag(),
                            "ignoring duplicate route",
                        );
                        rejected.push(index);
                    }
                    RejectionPolicy::Ignore => rejected.push(index),
                }
            } else {
                group.push(index);
            }
        }
        for index in rejected.into_iter().rev() {
            entries.remove(index);
        }

        // Consecutive routes sharing trie-ability form one group, kept in
        // declaration order.
        let mut groups: Vec<Group> = Vec::new();
        let mut current_trie: Option<TrieGroup> = None;
        let mut current_seq: Option<SequentialGroup> = None;
        for (index, (route, _)) in entries.iter().enumerate() {
            if let Some(skeleton) = route.mapping().skeleton() {
                if let Some(seq) = current_seq.take() {
                    groups.push(Group::Sequential(seq));
                }
                current_trie
                    .get_or_insert_with(|| TrieGroup {
                        root: TrieNode::default(),
                    })
                    .root
                    .insert(&skeleton, index);
            } else {
                if let Some(trie) = current_trie.take() {
                    groups.push(Group::Trie(trie));
                }
                current_seq
                    .get_or_insert_with(|| SequentialGroup { order: Vec::new() })
                    .order
                    .push(index);
            }
        }
        if let Some(trie) = current_trie.take() {
            groups.push(Group::Trie(trie));
        }
        if let Some(seq) = current_seq.take() {
            groups.push(Group::Sequential(seq));
        }

        // Linear groups scan most-constrained first as well.
        for group in &mut groups {
            if let Group::Sequential(seq) = group {
                seq.order
                    .sort_by_key(|&i| std::cmp::Reverse(entries[i].0.complexity()));
            }
        }

        Ok(Router {
            entries,
            groups,
            negative_cache: self.negative_cache.then(DashMap::new),
            negative_cache_capacity: self.negative_cache_capacity,
        })
    }
}
