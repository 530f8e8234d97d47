use crate::event::AccessEvent;
use crate::CoaccessError;
use itertools::Itertools;
use serde::Serialize;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{debug, info};

/// How a session is turned into co-access pairs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PairPolicy {
    /// Every unordered pair of distinct documents in the session.
    #[default]
    FullCross,
    /// Only documents viewed one after the other.
    AdjacentChain,
}

/// Unordered document pair, stored with `a < b`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoAccessPair {
    pub a: String,
    pub b: String,
}

impl CoAccessPair {
    /// `None` for a self pair.
    pub fn new(x: &str, y: &str) -> Option<Self> {
        match x.cmp(y) {
            std::cmp::Ordering::Less => Some(Self { a: x.to_string(), b: y.to_string() }),
            std::cmp::Ordering::Greater => Some(Self { a: y.to_string(), b: x.to_string() }),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// All documents one user viewed, ordered by view time (ties by id).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub user_key: String,
    pub documents: Vec<String>,
}

impl Session {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Neighbor lists produced by one session, ready for the aggregator.
///
/// Full-cross sessions share a single list between all of their documents;
/// the owning document is filtered out when the lists are written.
#[derive(Clone, Debug)]
pub struct Expansion {
    pub entries: Vec<(String, Arc<[String]>)>,
    pub pairs: u64,
    cost: usize,
}

impl Expansion {
    /// Stored references: one per entry plus one per element of each distinct list.
    pub fn cost(&self) -> usize {
        self.cost
    }

    /// Neighbor lines this expansion turns into once written.
    pub fn neighbor_lines(&self) -> u64 {
        self.entries
            .iter()
            .map(|(doc, list)| list.iter().filter(|n| *n != doc).count() as u64)
            .sum()
    }
}

impl PairPolicy {
    /// Unordered pairs of the session, each emitted once.
    pub fn pairs(&self, documents: &[String]) -> Vec<CoAccessPair> {
        match self {
            PairPolicy::FullCross => documents
                .iter()
                .tuple_combinations()
                .filter_map(|(x, y)| CoAccessPair::new(x, y))
                .collect(),
            PairPolicy::AdjacentChain => documents
                .iter()
                .tuple_windows()
                .filter_map(|(x, y)| CoAccessPair::new(x, y))
                .collect(),
        }
    }

    /// Per-document neighbor lists crediting every pair to both endpoints.
    pub fn neighborhoods(&self, documents: &[String]) -> Expansion {
        let n = documents.len();
        match self {
            PairPolicy::FullCross => {
                let shared: Arc<[String]> = documents.to_vec().into();
                Expansion {
                    entries: documents
                        .iter()
                        .map(|doc| (doc.clone(), Arc::clone(&shared)))
                        .collect(),
                    pairs: (n * n.saturating_sub(1) / 2) as u64,
                    cost: 2 * n,
                }
            }
            PairPolicy::AdjacentChain => {
                let mut cost = 0;
                let entries: Vec<(String, Arc<[String]>)> = documents
                    .iter()
                    .enumerate()
                    .map(|(i, doc)| {
                        let neighbors: Vec<String> = [i.checked_sub(1), Some(i + 1)]
                            .into_iter()
                            .flatten()
                            .filter_map(|j| documents.get(j))
                            .cloned()
                            .collect();
                        cost += 1 + neighbors.len();
                        (doc.clone(), Arc::from(neighbors))
                    })
                    .collect();
                Expansion {
                    entries,
                    pairs: n.saturating_sub(1) as u64,
                    cost,
                }
            }
        }
    }
}

/// Groups consecutive same-user lines of the deduplicated triple file into sessions.
pub struct SessionReader<R> {
    lines: std::io::Lines<R>,
    pending: Option<AccessEvent>,
    malformed: u64,
}

impl<R: BufRead> SessionReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            pending: None,
            malformed: 0,
        }
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    fn next_event(&mut self) -> Option<Result<AccessEvent, CoaccessError>> {
        for line in self.lines.by_ref() {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            match AccessEvent::parse_line(&line) {
                Some(event) => return Some(Ok(event)),
                None if line.trim().is_empty() => {}
                None => self.malformed += 1,
            }
        }
        None
    }
}

impl<R: BufRead> Iterator for SessionReader<R> {
    type Item = Result<Session, CoaccessError>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.pending.take() {
            Some(event) => event,
            None => match self.next_event()? {
                Ok(event) => event,
                Err(e) => return Some(Err(e)),
            },
        };
        let user_key = first.user_key;
        let mut views = vec![(first.timestamp, first.document_id)];
        loop {
            match self.next_event() {
                None => break,
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(event)) if event.user_key == user_key => {
                    views.push((event.timestamp, event.document_id));
                }
                Some(Ok(event)) => {
                    self.pending = Some(event);
                    break;
                }
            }
        }
        views.sort();
        Some(Ok(Session {
            user_key,
            documents: views.into_iter().map(|(_, doc)| doc).collect(),
        }))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ExpandStats {
    pub sessions: u64,
    pub single: u64,
    pub over_cap: u64,
    pub expanded: u64,
    pub pairs: u64,
    pub malformed: u64,
}

/// Turns sessions into neighbor lists under a policy, skipping trivial and oversized ones.
pub struct PairExpander {
    policy: PairPolicy,
    session_cap: usize,
}

impl PairExpander {
    pub fn new(policy: PairPolicy, session_cap: usize) -> Self {
        Self { policy, session_cap }
    }

    pub fn policy(&self) -> PairPolicy {
        self.policy
    }

    /// `None` for sessions of at most one document or more than the cap.
    pub fn expand(&self, session: &Session, stats: &mut ExpandStats) -> Option<Expansion> {
        stats.sessions += 1;
        if session.len() <= 1 {
            stats.single += 1;
            return None;
        }
        if session.len() > self.session_cap {
            stats.over_cap += 1;
            debug!(user = %session.user_key, documents = session.len(), cap = self.session_cap, "skip user");
            return None;
        }
        let expansion = self.policy.neighborhoods(&session.documents);
        stats.expanded += 1;
        stats.pairs += expansion.pairs;
        Some(expansion)
    }

    /// Expand every session from `reader`, handing each expansion to `sink`.
    pub fn run<R, F>(&self, reader: R, mut sink: F) -> Result<ExpandStats, CoaccessError>
    where
        R: BufRead,
        F: FnMut(Expansion) -> Result<(), CoaccessError>,
    {
        info!(policy = ?self.policy, session_cap = self.session_cap, "expanding sessions");
        let mut stats = ExpandStats::default();
        let mut sessions = SessionReader::new(reader);
        for session in sessions.by_ref() {
            if let Some(expansion) = self.expand(&session?, &mut stats) {
                sink(expansion)?;
            }
        }
        stats.malformed = sessions.malformed();
        info!(
            sessions = stats.sessions,
            expanded = stats.expanded,
            over_cap = stats.over_cap,
            pairs = stats.pairs,
            "expansion complete"
        );
        Ok(stats)
    }
}
