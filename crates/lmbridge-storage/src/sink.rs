use std::future::Future;
use std::pin::Pin;

use tracing::warn;

use lmbridge_core::monitoring::{RequestLogSink, RequestRecord};

use crate::store::RequestLogStore;

/// Persist request-end events into the SQLite log. Failures are logged and
/// swallowed; the log is best-effort by contract.
pub struct DbRequestLogSink {
    store: RequestLogStore,
}

impl DbRequestLogSink {
    pub fn new(store: RequestLogStore) -> Self {
        Self { store }
    }
}

impl RequestLogSink for DbRequestLogSink {
    fn write<'a>(&'a self, record: &'a RequestRecord) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(err) = self.store.append(record).await {
                warn!(%err, request = %record.request_id, "request log append failed");
            }
        })
    }
}
