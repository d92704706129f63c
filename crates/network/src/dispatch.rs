//! Turns an incoming quest into a servant invocation and, when the caller wants one, an answer.

use crate::{
    adapter::Adapter,
    message::{Answer, Quest},
    servant::{Current, MethodEntry, ServantError},
};
use std::sync::Arc;
use tracing::{debug, error, trace};
use xic_types::{
    Arguments, Exception, ONEWAY_MISMATCH_EXCEPTION, SERVICE_NOT_FOUND_EXCEPTION,
};

/// Invoke the servant method addressed by `quest`.
///
/// Returns the answer to send, or `None` for a oneway quest (txid 0). Servant failures
/// never escape: they become exceptional answers.
pub async fn dispatch_quest(
    adapter: Option<Arc<dyn Adapter>>,
    quest: Quest,
    incoming: bool,
) -> Option<Answer> {
    let current = Current::new(&quest, incoming);
    dispatch(adapter, current, quest).await
}

/// Like [`dispatch_quest`], with the request view already built.
pub(crate) async fn dispatch(
    adapter: Option<Arc<dyn Adapter>>,
    current: Current,
    quest: Quest,
) -> Option<Answer> {
    let Quest { txid, service, method, args, .. } = quest;

    let (oneway, mut result) = invoke(adapter.as_deref(), current.clone(), &service, &method, args)
        .await;

    if txid == 0 {
        if let Err(e) = result {
            debug!(target: "xic::dispatch", %service, %method, %e, "oneway quest failed");
        }
        return None;
    }

    if oneway {
        result = Err(Exception::new(ONEWAY_MISMATCH_EXCEPTION, 0, "oneway method invoked as twoway")
            .into());
    }

    let answer = match result {
        Ok(out) => Ok(Answer::normal(txid, out)),
        Err(e) => {
            trace!(target: "xic::dispatch", txid, %service, %method, %e, "quest failed");
            Answer::exceptional(txid, &e.to_failure(&current.raiser()))
        }
    };

    match answer {
        Ok(answer) => Some(answer),
        Err(e) => {
            error!(target: "xic::dispatch", txid, %service, %method, ?e, "failed to encode answer");
            None
        }
    }
}

/// Resolve and run the method. Returns whether the method is oneway, and its result.
async fn invoke(
    adapter: Option<&dyn Adapter>,
    current: Current,
    service: &str,
    method: &str,
    args: Vec<u8>,
) -> (bool, Result<Vec<u8>, ServantError>) {
    let servant = adapter.and_then(|a| a.find_servant(service).or_else(|| a.default_servant()));
    let Some(servant) = servant else {
        return (false, Err(Exception::new(SERVICE_NOT_FOUND_EXCEPTION, 0, service).into()));
    };

    match servant.resolve(method) {
        Some(MethodEntry::Typed(entry)) if entry.is_oneway() => {
            if let Err(e) = entry.invoke(current, args).await {
                debug!(target: "xic::dispatch", %service, %method, %e, "oneway method failed");
            }
            (true, Ok(Vec::new()))
        }
        Some(MethodEntry::Typed(entry)) => (false, entry.invoke(current, args).await),
        Some(MethodEntry::Generic(handler)) => {
            let result = match decode_generic_args(&args) {
                Ok(args) => handler.invoke(current, args).await.and_then(|out| {
                    xic_types::encode(&out).map_err(ServantError::other)
                }),
                Err(e) => Err(e),
            };
            (false, result)
        }
        None => (
            false,
            Err(Exception::new(SERVICE_NOT_FOUND_EXCEPTION, 0, format!("{service}#{method}"))
                .into()),
        ),
    }
}

/// An empty payload is an empty dictionary.
fn decode_generic_args(args: &[u8]) -> Result<Arguments, ServantError> {
    if args.is_empty() {
        return Ok(Arguments::new());
    }
    xic_types::decode(args).map_err(|e| {
        Exception::new(xic_types::ARGUMENT_EXCEPTION, 0, format!("invalid arguments: {e}")).into()
    })
}
