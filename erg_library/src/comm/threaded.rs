use super::Communicator;
use crate::clock::now;
use crate::errors::CollectiveUnavailableError;
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a collective waits for the rest of the group by default.
pub const DEFAULT_COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Contributions to the n-th collective of the group.
/// The first rank to see it complete or fail records the outcome, so every rank observes the same one.
struct Slot {
    op: &'static str,
    participants: Vec<usize>,
    contributions: BTreeMap<usize, Vec<u8>>,
    outcome: Option<std::result::Result<BTreeMap<usize, Vec<u8>>, Vec<usize>>>,
    readers: usize,
}

struct GroupState {
    alive: Vec<bool>,
    slots: HashMap<u64, Slot>,
}

struct Group {
    state: Mutex<GroupState>,
    cond: Condvar,
    timeout: Duration,
}

/// One rank of an in-process group, each rank living on its own thread.
/// Ranks can be disconnected to simulate a crashed peer.
/// Dropping a rank disconnects it.
pub struct ThreadComm {
    rank: usize,
    size: usize,
    group: Arc<Group>,
    seq: AtomicU64,
}

impl ThreadComm {
    /// A connected group of `size` ranks, to be moved onto one thread each.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        Self::group_with_timeout(size, DEFAULT_COLLECTIVE_TIMEOUT)
    }

    pub fn group_with_timeout(size: usize, timeout: Duration) -> Vec<ThreadComm> {
        let group = Arc::new(Group {
            state: Mutex::new(GroupState {
                alive: vec![true; size],
                slots: HashMap::new(),
            }),
            cond: Condvar::new(),
            timeout,
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                group: group.clone(),
                seq: AtomicU64::new(0),
            })
            .collect()
    }

    /// Leave the group. Collectives waiting on this rank fail, as do this rank's own.
    pub fn disconnect(&self) {
        let mut state = self.group.state.lock();
        if let Some(a) = state.alive.get_mut(self.rank) {
            *a = false;
        }
        self.group.cond.notify_all();
    }

    fn unavailable(op: &'static str, unreachable: Vec<usize>) -> anyhow::Error {
        anyhow::Error::new(CollectiveUnavailableError {
            operation: op,
            unreachable,
        })
    }

    /// Contribute `payload` to the next collective and wait until every participant did.
    fn collective(
        &self,
        op: &'static str,
        payload: Vec<u8>,
        participants: &[usize],
    ) -> Result<BTreeMap<usize, Vec<u8>>> {
        let mut state = self.group.state.lock();
        if !state.alive.get(self.rank).copied().unwrap_or(false) {
            return Err(Self::unavailable(op, vec![self.rank]));
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let slot = state.slots.entry(seq).or_insert_with(|| Slot {
            op,
            participants: participants.to_vec(),
            contributions: BTreeMap::new(),
            outcome: None,
            readers: 0,
        });
        if slot.op != op || slot.participants != participants {
            anyhow::bail!(
                "Rank {} called '{}' while peers are in '{}', collectives out of order",
                self.rank,
                op,
                slot.op
            );
        }
        slot.contributions.insert(self.rank, payload);
        self.group.cond.notify_all();

        let deadline = now() + self.group.timeout;
        loop {
            let timed_out = now() >= deadline;
            let GroupState { alive, slots } = &mut *state;
            let slot = match slots.get_mut(&seq) {
                Some(s) => s,
                None => anyhow::bail!("Collective '{}' #{} vanished", op, seq),
            };
            if slot.outcome.is_none() {
                let missing: Vec<usize> = slot
                    .participants
                    .iter()
                    .copied()
                    .filter(|r| !slot.contributions.contains_key(r))
                    .collect();
                if missing.is_empty() {
                    slot.outcome = Some(Ok(std::mem::take(&mut slot.contributions)));
                } else {
                    let dead: Vec<usize> = missing
                        .iter()
                        .copied()
                        .filter(|r| !alive.get(*r).copied().unwrap_or(false))
                        .collect();
                    if !dead.is_empty() {
                        slot.outcome = Some(Err(dead));
                    } else if timed_out {
                        slot.outcome = Some(Err(missing));
                    }
                }
                if slot.outcome.is_some() {
                    self.group.cond.notify_all();
                }
            }
            if let Some(outcome) = &slot.outcome {
                let result = match outcome {
                    Ok(all) => Ok(all.clone()),
                    Err(unreachable) => Err(Self::unavailable(op, unreachable.clone())),
                };
                slot.readers += 1;
                if slot.readers >= slot.participants.len() {
                    slots.remove(&seq);
                }
                return result;
            }
            self.group.cond.wait_until(&mut state, deadline);
        }
    }

    fn everyone(&self) -> Vec<usize> {
        (0..self.size).collect()
    }
}

impl Drop for ThreadComm {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .collective("all_gather", payload, &self.everyone())?
            .into_values()
            .collect())
    }
    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>> {
        let mut all = self.collective("broadcast", payload.unwrap_or_default(), &self.everyone())?;
        match all.remove(&root) {
            Some(p) => Ok(p),
            None => anyhow::bail!("Broadcast root {} is outside the group", root),
        }
    }
    fn barrier(&self) -> Result<()> {
        self.collective("barrier", vec![], &self.everyone())?;
        Ok(())
    }
    fn gather_bytes(&self, payload: Vec<u8>, root: usize) -> Result<Option<Vec<Vec<u8>>>> {
        let all = self.collective("gather", payload, &self.everyone())?;
        match self.rank == root {
            true => Ok(Some(all.into_values().collect())),
            false => Ok(None),
        }
    }
    fn gather_from_subset_bytes(
        &self,
        payload: Vec<u8>,
        ranks: &[usize],
        root: usize,
    ) -> Result<Option<Vec<(usize, Vec<u8>)>>> {
        if !ranks.contains(&self.rank) {
            return Ok(None);
        }
        let mut participants = ranks.to_vec();
        participants.sort_unstable();
        participants.dedup();
        let all = self.collective("gather_from_subset", payload, &participants)?;
        match self.rank == root {
            true => Ok(Some(all.into_iter().collect())),
            false => Ok(None),
        }
    }
    fn reachable_ranks(&self) -> Vec<usize> {
        let state = self.group.state.lock();
        state
            .alive
            .iter()
            .enumerate()
            .filter(|(_, a)| **a)
            .map(|(r, _)| r)
            .collect()
    }
}
