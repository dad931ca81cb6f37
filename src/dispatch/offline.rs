use super::Dispatcher;
use crate::batch::pad_batch;
use crate::cache::{CacheKey, CachedOutputs};
use crate::error::{Result, SutError};
use crate::report::{BatchTimings, UnitSource};
use crate::request::{TokenResult, WorkUnit};
use std::time::Instant;
use tracing::debug;

/// Batch-complete handling of one unit: replay from cache or generate, then
/// report every row.
pub(super) fn process_unit(dispatcher: &Dispatcher, unit: WorkUnit) -> Result<()> {
    let requests = unit.into_requests();
    if requests.is_empty() {
        return Ok(());
    }
    let key = dispatcher
        .cache
        .as_ref()
        .map(|_| CacheKey::from_indices(requests.iter().map(|r| r.index)));

    let cached = match (&dispatcher.cache, &key) {
        (Some(cache), Some(key)) => cache
            .load(key)?
            .map(|hit| (hit, cache.path(key))),
        _ => None,
    };

    if let Some((outputs, path)) = cached {
        let rows = requests
            .iter()
            .map(|request| outputs.get(request.index))
            .collect::<Option<Vec<_>>>();
        let rows = match rows {
            Some(rows) if outputs.len() == requests.len() => rows,
            _ => return Err(SutError::cache_decode(&path)),
        };
        for (request, tokens) in requests.iter().zip(rows) {
            dispatcher.complete(request.index, &TokenResult::new(request.id, tokens.to_vec()));
        }
        dispatcher.progress(requests.len(), UnitSource::Cached(path));
        return Ok(());
    }

    let start = Instant::now();
    let batch = pad_batch(
        &requests,
        dispatcher.config.max_seq_len,
        dispatcher.config.pad_token_id,
        dispatcher.config.padding_side,
    )?;
    let built = Instant::now();
    debug!("built batch of {} rows", batch.len());

    let outputs = dispatcher.backend.invoke(&batch)?;
    let inferred = Instant::now();
    if outputs.len() != requests.len() {
        return Err(SutError::malformed(format!(
            "{} outputs for a batch of {}",
            outputs.len(),
            requests.len()
        )));
    }

    if let (Some(cache), Some(key)) = (&dispatcher.cache, &key) {
        let rows = requests
            .iter()
            .map(|request| request.index)
            .zip(outputs.iter().cloned());
        let path = cache.store(key, &CachedOutputs::from_rows(rows))?;
        debug!("stored outputs in {}", path.display());
    }

    for (request, tokens) in requests.iter().zip(outputs) {
        dispatcher.complete(request.index, &TokenResult::new(request.id, tokens));
    }
    let timings = BatchTimings {
        batch_make: built - start,
        inference: inferred - built,
        postprocess: inferred.elapsed(),
    };
    dispatcher.progress(requests.len(), UnitSource::Generated(timings));
    Ok(())
}
