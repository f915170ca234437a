//! Collective operations between the ranks of one execution.
pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;
pub mod threaded;

pub use local::LocalComm;
pub use threaded::ThreadComm;

use crate::transaction::TransactionId;
use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

/// Byte-level collectives every rank group provides.
/// Ranks must call the collectives in the same order.
/// An operation that cannot complete because peers are gone fails with [crate::errors::CollectiveUnavailableError].
pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// One payload per rank, indexed by rank.
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;
    /// The payload of `root`. Only `root` needs to supply one.
    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>>;
    /// Blocks until every rank has reached it.
    fn barrier(&self) -> Result<()>;
    /// Every rank's payload on `root`, `None` elsewhere.
    fn gather_bytes(&self, payload: Vec<u8>, root: usize) -> Result<Option<Vec<Vec<u8>>>>;
    /// Like [Communicator::gather_bytes], but only `ranks` take part.
    /// Ranks outside the subset return `None` without communicating.
    fn gather_from_subset_bytes(
        &self,
        payload: Vec<u8>,
        ranks: &[usize],
        root: usize,
    ) -> Result<Option<Vec<(usize, Vec<u8>)>>>;
    /// Ranks that can still take part in collectives, ascending.
    fn reachable_ranks(&self) -> Vec<usize>;
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// A shared handle takes part as the rank it wraps.
impl<C: Communicator + ?Sized> Communicator for std::sync::Arc<C> {
    fn rank(&self) -> usize {
        (**self).rank()
    }
    fn size(&self) -> usize {
        (**self).size()
    }
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        (**self).all_gather_bytes(payload)
    }
    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>> {
        (**self).broadcast_bytes(payload, root)
    }
    fn barrier(&self) -> Result<()> {
        (**self).barrier()
    }
    fn gather_bytes(&self, payload: Vec<u8>, root: usize) -> Result<Option<Vec<Vec<u8>>>> {
        (**self).gather_bytes(payload, root)
    }
    fn gather_from_subset_bytes(
        &self,
        payload: Vec<u8>,
        ranks: &[usize],
        root: usize,
    ) -> Result<Option<Vec<(usize, Vec<u8>)>>> {
        (**self).gather_from_subset_bytes(payload, ranks, root)
    }
    fn reachable_ranks(&self) -> Vec<usize> {
        (**self).reachable_ranks()
    }
}

/// Typed wrappers, values cross ranks as JSON.
pub trait CommExt: Communicator {
    fn all_gather<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<Vec<T>> {
        self.all_gather_bytes(encode(value)?)?
            .iter()
            .map(|b| decode(b))
            .collect()
    }

    fn broadcast<T: Serialize + DeserializeOwned>(&self, value: Option<&T>, root: usize) -> Result<T> {
        let payload = match value {
            Some(v) => Some(encode(v)?),
            None => None,
        };
        decode(&self.broadcast_bytes(payload, root)?)
    }

    fn gather<T: Serialize + DeserializeOwned>(&self, value: &T, root: usize) -> Result<Option<Vec<T>>> {
        match self.gather_bytes(encode(value)?, root)? {
            Some(all) => Ok(Some(all.iter().map(|b| decode(b)).collect::<Result<Vec<T>>>()?)),
            None => Ok(None),
        }
    }

    fn gather_from_subset<T: Serialize + DeserializeOwned>(
        &self,
        value: &T,
        ranks: &[usize],
        root: usize,
    ) -> Result<Option<Vec<(usize, T)>>> {
        match self.gather_from_subset_bytes(encode(value)?, ranks, root)? {
            Some(all) => {
                let mut out = Vec::with_capacity(all.len());
                for (r, b) in all {
                    out.push((r, decode(&b)?));
                }
                Ok(Some(out))
            },
            None => Ok(None),
        }
    }
}
impl<C: Communicator + ?Sized> CommExt for C {}

/// MPI when the runtime initializes, otherwise a single rank.
pub fn create_communicator(tid: &TransactionId) -> Box<dyn Communicator> {
    #[cfg(feature = "mpi")]
    {
        if let Some(c) = mpi::MpiComm::init(tid) {
            return Box::new(c);
        }
    }
    info!(tid = tid, "No multi-rank runtime, monitoring a single rank");
    Box::new(LocalComm::new())
}
