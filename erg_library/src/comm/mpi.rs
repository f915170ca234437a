use super::Communicator;
use crate::transaction::TransactionId;
use anyhow::Result;
use mpi::datatype::PartitionMut;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Count;
use tracing::info;

/// `MPI_COMM_WORLD`.
/// MPI aborts the job when a peer dies, so every rank is always reported reachable.
pub struct MpiComm {
    universe: Universe,
}

impl MpiComm {
    /// `None` if MPI was already initialized or cannot start.
    pub fn init(tid: &TransactionId) -> Option<Self> {
        let universe = mpi::initialize()?;
        let world = universe.world();
        info!(tid=tid, rank=world.rank(), size=world.size(), "MPI initialized");
        Some(MpiComm { universe })
    }

    fn world(&self) -> SimpleCommunicator {
        self.universe.world()
    }
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |acc, &c| {
            let d = *acc;
            *acc += c;
            Some(d)
        })
        .collect()
}

fn split(buf: Vec<u8>, counts: &[Count]) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(counts.len());
    let mut rest = buf.as_slice();
    for &c in counts {
        let (head, tail) = rest.split_at(c as usize);
        out.push(head.to_vec());
        rest = tail;
    }
    out
}

fn count_of(payload: &[u8]) -> Result<Count> {
    match Count::try_from(payload.len()) {
        Ok(c) => Ok(c),
        Err(_) => anyhow::bail!("Payload of {} bytes is too large for MPI", payload.len()),
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.world().rank() as usize
    }
    fn size(&self) -> usize {
        self.world().size() as usize
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let world = self.world();
        let count = count_of(&payload)?;
        let mut counts = vec![0 as Count; world.size() as usize];
        world.all_gather_into(&count, &mut counts[..]);
        let displs = displacements(&counts);
        let total: usize = counts.iter().map(|c| *c as usize).sum();
        let mut buf = vec![0u8; total];
        {
            let mut partition = PartitionMut::new(&mut buf[..], &counts[..], &displs[..]);
            world.all_gather_varcount_into(&payload[..], &mut partition);
        }
        Ok(split(buf, &counts))
    }

    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>> {
        let world = self.world();
        let root_proc = world.process_at_rank(root as Count);
        let mut buf = payload.unwrap_or_default();
        let mut len = count_of(&buf)?;
        root_proc.broadcast_into(&mut len);
        buf.resize(len as usize, 0);
        root_proc.broadcast_into(&mut buf[..]);
        Ok(buf)
    }

    fn barrier(&self) -> Result<()> {
        self.world().barrier();
        Ok(())
    }

    fn gather_bytes(&self, payload: Vec<u8>, root: usize) -> Result<Option<Vec<Vec<u8>>>> {
        let world = self.world();
        let root_proc = world.process_at_rank(root as Count);
        let count = count_of(&payload)?;
        if world.rank() as usize != root {
            root_proc.gather_into(&count);
            root_proc.gather_varcount_into(&payload[..]);
            return Ok(None);
        }
        let mut counts = vec![0 as Count; world.size() as usize];
        root_proc.gather_into_root(&count, &mut counts[..]);
        let displs = displacements(&counts);
        let total: usize = counts.iter().map(|c| *c as usize).sum();
        let mut buf = vec![0u8; total];
        {
            let mut partition = PartitionMut::new(&mut buf[..], &counts[..], &displs[..]);
            root_proc.gather_varcount_into_root(&payload[..], &mut partition);
        }
        Ok(Some(split(buf, &counts)))
    }

    fn gather_from_subset_bytes(
        &self,
        payload: Vec<u8>,
        ranks: &[usize],
        root: usize,
    ) -> Result<Option<Vec<(usize, Vec<u8>)>>> {
        let world = self.world();
        let me = world.rank() as usize;
        if !ranks.contains(&me) {
            return Ok(None);
        }
        if me != root {
            world.process_at_rank(root as Count).send(&payload[..]);
            return Ok(None);
        }
        let mut out = Vec::with_capacity(ranks.len());
        for &r in ranks {
            if r == me {
                out.push((r, payload.clone()));
            } else {
                let (msg, _status) = world.process_at_rank(r as Count).receive_vec::<u8>();
                out.push((r, msg));
            }
        }
        Ok(Some(out))
    }

    fn reachable_ranks(&self) -> Vec<usize> {
        (0..self.size()).collect()
    }
}
