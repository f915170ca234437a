use super::Communicator;
use anyhow::Result;

/// The only rank of a single-process execution
#[derive(Debug, Default)]
pub struct LocalComm;
impl LocalComm {
    pub fn new() -> Self {
        LocalComm
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![payload])
    }
    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>> {
        match payload {
            Some(p) if root == 0 => Ok(p),
            _ => anyhow::bail!("Broadcast from rank {} without a payload in a single rank group", root),
        }
    }
    fn barrier(&self) -> Result<()> {
        Ok(())
    }
    fn gather_bytes(&self, payload: Vec<u8>, _root: usize) -> Result<Option<Vec<Vec<u8>>>> {
        Ok(Some(vec![payload]))
    }
    fn gather_from_subset_bytes(
        &self,
        payload: Vec<u8>,
        ranks: &[usize],
        _root: usize,
    ) -> Result<Option<Vec<(usize, Vec<u8>)>>> {
        if !ranks.contains(&0) {
            return Ok(None);
        }
        Ok(Some(vec![(0, payload)]))
    }
    fn reachable_ranks(&self) -> Vec<usize> {
        vec![0]
    }
}
