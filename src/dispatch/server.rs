use super::Dispatcher;
use crate::error::Result;
use crate::report::UnitSource;
use crate::request::{Request, TokenResult, WorkUnit};
use std::sync::Arc;

/// Stream-first-token handling. Remote requests each get their own task and
/// the worker moves on immediately; local generation runs on the worker.
pub(super) fn process_unit(dispatcher: &Arc<Dispatcher>, unit: WorkUnit) -> Result<()> {
    for request in unit.into_requests() {
        if dispatcher.backend.is_local() {
            stream_request(dispatcher, &request, 0)?;
            continue;
        }
        let endpoint = dispatcher.next_endpoint();
        let task_dispatcher = Arc::clone(dispatcher);
        let name = format!("request-{}", request.id);
        dispatcher.spawner.spawn(
            name,
            Box::new(move || {
                if let Err(err) = stream_request(&task_dispatcher, &request, endpoint) {
                    task_dispatcher.record_fatal(&format!("request {}", request.id), err);
                }
            }),
        )?;
    }
    Ok(())
}

fn stream_request(dispatcher: &Dispatcher, request: &Request, endpoint: usize) -> Result<()> {
    let mut emitter = dispatcher.emitter(request);
    let tokens = dispatcher
        .backend
        .invoke_streaming(request, endpoint, &mut emitter)?;
    // The partial completion must reach the driver first.
    emitter.wait_reported();
    dispatcher.complete(request.index, &TokenResult::new(request.id, tokens));
    dispatcher.progress(1, UnitSource::Streamed);
    Ok(())
}
