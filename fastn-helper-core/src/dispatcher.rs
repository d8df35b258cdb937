//! Turns host requests into responses.
//!
//! Each request is answered exactly once, with the sequence number it came
//! with. The correlation ledger remembers what kind of answer every in-flight
//! sequence number expects. An answer of the wrong shape is a bug in this
//! crate, not in the host, and aborts.

use crate::{DowncallKind, ErrorReply, Helper, HelperError, Request, Response};
use std::sync::Arc;

#[derive(Clone)]
pub struct Dispatcher {
    helper: Helper,
    in_flight: Arc<scc::HashMap<u64, DowncallKind>>,
}

impl Dispatcher {
    pub fn new(helper: Helper) -> Self {
        Self {
            helper,
            in_flight: Arc::new(scc::HashMap::new()),
        }
    }

    /// Number of requests currently being worked on.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[tracing::instrument(skip_all, fields(seqno = request.seqno, kind = ?request.downcall.kind()))]
    pub async fn dispatch(&self, request: Request) -> Response {
        let Request { seqno, downcall } = request;
        let expected = downcall.kind();

        if self.in_flight.insert_async(seqno, expected).await.is_err() {
            tracing::warn!("sequence number already in flight");
            return Response {
                seqno,
                result: Err(ErrorReply::from(HelperError::DuplicateSequence(seqno))),
            };
        }

        let result = self.helper.execute(downcall).await;

        let Some((_, kind)) = self.in_flight.remove_async(&seqno).await else {
            panic!("request {seqno} vanished from the ledger");
        };
        if let Ok(ref ok) = result {
            assert_eq!(
                ok.kind(),
                kind,
                "request {seqno} answered with the wrong kind of response"
            );
        }

        match &result {
            Ok(_) => tracing::debug!("ok"),
            Err(e) => tracing::debug!("failed: {e}"),
        }
        Response {
            seqno,
            result: result.map_err(ErrorReply::from),
        }
    }
}
