//! Fan-out of a batch over every configured endpoint.
//!
//! The batch is split into contiguous chunks, one per endpoint, all chunks
//! are submitted concurrently and the answers are stitched back together in
//! the original row order. Protocols without native batching get one
//! concurrent call per prompt inside a chunk.

use crate::backend::RemoteClient;
use crate::batch::PaddedBatch;
use crate::error::{Result, SutError};
use std::thread;
use tracing::debug;

/// Splits `items` into `k` contiguous chunks whose sizes differ by at most
/// one; the first `items.len() % k` chunks are the larger ones.
pub fn divide<T>(k: usize, items: &[T]) -> Vec<&[T]> {
    if k == 0 {
        return Vec::new();
    }
    let (base, extra) = (items.len() / k, items.len() % k);
    let mut chunks = Vec::with_capacity(k);
    let mut start = 0;
    for i in 0..k {
        let end = start + base + usize::from(i < extra);
        chunks.push(&items[start..end]);
        start = end;
    }
    chunks
}

pub struct FanOutRouter {
    client: RemoteClient,
    special_ids: Vec<u32>,
}

impl FanOutRouter {
    pub fn new(client: RemoteClient, special_ids: Vec<u32>) -> Self {
        Self {
            client,
            special_ids,
        }
    }

    pub fn client(&self) -> &RemoteClient {
        &self.client
    }

    /// Ids removed from prompts before they leave the process.
    pub fn special_ids(&self) -> &[u32] {
        &self.special_ids
    }

    pub fn route(&self, batch: &PaddedBatch) -> Result<Vec<Vec<u32>>> {
        let prompts = batch.stripped_prompts(&self.special_ids);
        let chunks = divide(self.client.endpoint_count(), &prompts);
        debug!(
            "routing {} prompts as chunks {:?}",
            prompts.len(),
            chunks.iter().map(|chunk| chunk.len()).collect::<Vec<_>>()
        );

        let answers: Vec<Result<Vec<Vec<u32>>>> = thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .iter()
                .enumerate()
                .filter(|(_, chunk)| !chunk.is_empty())
                .map(|(endpoint, chunk)| scope.spawn(move || self.submit(chunk, endpoint)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(SutError::Panicked("endpoint chunk".to_string())))
                })
                .collect()
        });

        let mut outputs = Vec::with_capacity(prompts.len());
        for answer in answers {
            outputs.extend(answer?);
        }
        if outputs.len() != prompts.len() {
            return Err(SutError::malformed(format!(
                "{} outputs for a batch of {}",
                outputs.len(),
                prompts.len()
            )));
        }
        Ok(outputs)
    }

    fn submit(&self, chunk: &[Vec<u32>], endpoint: usize) -> Result<Vec<Vec<u32>>> {
        let outputs = self.client.submit(chunk, endpoint)?;
        if outputs.len() != chunk.len() {
            return Err(SutError::malformed(format!(
                "endpoint {endpoint} answered {} of {} prompts",
                outputs.len(),
                chunk.len()
            )));
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::rpc::testing::EchoRpc;
    use crate::backend::{RetryPolicy, RpcBackend, RpcClient};
    use crate::batch::{pad_batch, PaddingSide};
    use crate::codec::testing::DigitCodec;
    use crate::request::{Request, ResponseId};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn divide_front_loads_remainder() {
        let items: Vec<u32> = (0..10).collect();
        let sizes: Vec<usize> = divide(3, &items).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        let chunks = divide(2, &["A", "B", "C", "D"]);
        assert_eq!(chunks, vec![&["A", "B"][..], &["C", "D"][..]]);
        let sizes: Vec<usize> = divide(4, &[1, 2]).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1, 1, 0, 0]);
    }

    fn router(batch: bool, clients: Vec<EchoRpc>) -> FanOutRouter {
        let clients = clients
            .into_iter()
            .map(|client| Box::new(client) as Box<dyn RpcClient>)
            .collect();
        let backend = RpcBackend::new(
            clients,
            "llama",
            batch,
            RetryPolicy::unlimited(),
            Arc::new(DigitCodec),
        );
        FanOutRouter::new(RemoteClient::Rpc(backend), vec![1, 2])
    }

    fn batch(prompts: &[&[u32]]) -> PaddedBatch {
        let requests: Vec<Request> = prompts
            .iter()
            .enumerate()
            .map(|(i, ids)| Request::new(ResponseId(i as u64), i, ids.to_vec()))
            .collect();
        pad_batch(&requests, 6, 2, PaddingSide::Left).unwrap()
    }

    #[test]
    fn slow_first_endpoint_keeps_order() {
        for native in [true, false] {
            let router = router(
                native,
                vec![
                    EchoRpc::new(&["10"]).with_delay(Duration::from_millis(50)),
                    EchoRpc::new(&["20"]),
                ],
            );
            let outputs = router
                .route(&batch(&[&[1, 3], &[1, 4], &[1, 5], &[1, 6]]))
                .unwrap();
            assert_eq!(
                outputs,
                vec![vec![3, 10], vec![4, 10], vec![5, 20], vec![6, 20]]
            );
        }
    }

    #[test]
    fn fewer_prompts_than_endpoints() {
        let router = router(
            true,
            vec![EchoRpc::new(&["7"]), EchoRpc::new(&["8"]), EchoRpc::new(&["9"])],
        );
        let outputs = router.route(&batch(&[&[1, 3]])).unwrap();
        assert_eq!(outputs, vec![vec![3, 7]]);
    }
}
