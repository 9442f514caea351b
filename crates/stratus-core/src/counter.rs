//! Sub-task counter: the fan-in barrier for parallel child work.
//!
//! A parent expecting N completions allocates one counter document with
//! the callback it wants fired when everything reports in. Children (or
//! the parent's own spawned operations) patch the counter once each; the
//! patch that takes `completions_remaining` to zero owns the callback.
//! Ownership is decided by the store's version CAS, so the callback fires
//! at most once no matter how reports interleave.
//!
//! Tolerance is a failure-rate threshold fixed at creation: the barrier
//! reports success when `failed / total <= error_threshold`, with the
//! failed resource links enumerated either way.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{
    DocumentLink, FailureInfo, ServiceTaskCallback, TaskStage, TaskStatus,
};
use crate::engine::host::ServiceHost;
use crate::engine::service::DynTaskService;
use crate::error::EngineError;
use crate::ports::Document;

pub const FACTORY: &str = "/core/counter-sub-tasks";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterState {
    pub completions_remaining: u32,
    pub failed_count: u32,
    pub total: u32,
    pub error_threshold: f64,
    pub callback: ServiceTaskCallback,

    #[serde(default)]
    pub failed_links: Vec<DocumentLink>,
}

/// Creation request for a counter document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterCreate {
    pub count: u32,

    #[serde(default)]
    pub error_threshold: f64,

    pub callback: ServiceTaskCallback,
}

/// One completion, success or failure, for one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub resource_link: DocumentLink,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

pub struct CounterSubTaskService;

impl CounterSubTaskService {
    /// Fire the callback and reap the counter. Only the CAS winner that
    /// zeroed the counter gets here.
    async fn finish(
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        state: &CounterState,
    ) -> Result<(), EngineError> {
        let rate = f64::from(state.failed_count) / f64::from(state.total.max(1));
        let extra = json!({ "failed_resource_links": state.failed_links });
        let body = if rate <= state.error_threshold {
            info!(
                counter = %link,
                failed = state.failed_count,
                total = state.total,
                "all sub-tasks reported, within threshold"
            );
            state.callback.finished_response(extra)
        } else {
            warn!(
                counter = %link,
                failed = state.failed_count,
                total = state.total,
                threshold = state.error_threshold,
                "sub-task failures exceeded threshold"
            );
            let failure = FailureInfo::new(format!(
                "{} of {} sub-tasks failed",
                state.failed_count, state.total
            ));
            state.callback.failed_response(failure, extra)
        };
        if let Some(target) = state.callback.target_link.clone() {
            host.spawn_patch(target, body);
        }
        host.store().delete(link).await
    }
}

#[async_trait]
impl DynTaskService for CounterSubTaskService {
    fn factory(&self) -> &'static str {
        FACTORY
    }

    async fn handle_create(
        &self,
        host: &Arc<ServiceHost>,
        body: Value,
    ) -> Result<DocumentLink, EngineError> {
        let create: CounterCreate = serde_json::from_value(body)?;
        if create.count == 0 {
            return Err(EngineError::Validation("counter count must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&create.error_threshold) {
            return Err(EngineError::Validation(format!(
                "error_threshold must be within [0, 1], got {}",
                create.error_threshold
            )));
        }
        if create.callback.is_empty() {
            return Err(EngineError::Validation(
                "counter requires a callback target".into(),
            ));
        }
        let state = CounterState {
            completions_remaining: create.count,
            failed_count: 0,
            total: create.count,
            error_threshold: create.error_threshold,
            callback: create.callback,
            failed_links: Vec::new(),
        };
        let link = DocumentLink::mint(FACTORY);
        host.store()
            .create(Document {
                link: link.clone(),
                kind: FACTORY.to_string(),
                version: 0,
                tenant_links: Vec::new(),
                expiration: None,
                body: serde_json::to_value(&state)?,
                updated_at: host.clock().now(),
            })
            .await?;
        debug!(counter = %link, count = create.count, "counter allocated");
        Ok(link)
    }

    async fn handle_patch(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
        body: Value,
    ) -> Result<(), EngineError> {
        let report: CompletionReport = serde_json::from_value(body)?;
        loop {
            let doc = host.store().get(link).await?;
            let mut state: CounterState = serde_json::from_value(doc.body)?;
            if state.completions_remaining == 0 {
                debug!(counter = %link, "report after completion, ignoring");
                return Ok(());
            }
            state.completions_remaining -= 1;
            if let Some(failure) = &report.failure {
                state.failed_count += 1;
                state.failed_links.push(report.resource_link.clone());
                debug!(
                    counter = %link,
                    resource = %report.resource_link,
                    error = %failure.message,
                    "sub-task failed"
                );
            }
            let body = serde_json::to_value(&state)?;
            match host.store().update(link, doc.version, body).await {
                Ok(_) => {
                    if state.completions_remaining == 0 {
                        return Self::finish(host, link, &state).await;
                    }
                    return Ok(());
                }
                Err(EngineError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn status(
        &self,
        host: &Arc<ServiceHost>,
        link: &DocumentLink,
    ) -> Result<TaskStatus, EngineError> {
        let doc = host.store().get(link).await?;
        let state: CounterState = serde_json::from_value(doc.body)?;
        let done = state.total - state.completions_remaining;
        Ok(TaskStatus {
            phase: "sub-task counter".to_string(),
            stage: TaskStage::Started,
            sub_stage: "COUNTING".to_string(),
            progress: ((100 * done) / state.total.max(1)) as u8,
            failure: None,
            resource_links: None,
        })
    }
}

/// Where a fanned-out operation reports its completion.
///
/// `allocate` picks the representation: a width of one needs no barrier,
/// so the parent's callback is handed through directly and the completion
/// patches the parent without an intermediate document. The threshold
/// rides along either way; a direct sink applies the same failure-rate
/// rule the counter does, where one failure out of one is a rate of 1.0.
#[derive(Debug, Clone)]
pub enum CompletionSink {
    Counter(DocumentLink),
    Direct {
        callback: ServiceTaskCallback,
        error_threshold: f64,
    },
}

impl CompletionSink {
    pub async fn allocate(
        host: &Arc<ServiceHost>,
        count: u32,
        error_threshold: f64,
        callback: ServiceTaskCallback,
    ) -> Result<Self, EngineError> {
        if count == 1 {
            if !(0.0..=1.0).contains(&error_threshold) {
                return Err(EngineError::Validation(format!(
                    "error_threshold must be within [0, 1], got {error_threshold}"
                )));
            }
            return Ok(CompletionSink::Direct {
                callback,
                error_threshold,
            });
        }
        let body = serde_json::to_value(CounterCreate {
            count,
            error_threshold,
            callback,
        })?;
        let link = host.start_task(FACTORY, body).await?;
        Ok(CompletionSink::Counter(link))
    }

    pub fn report_success(&self, host: &Arc<ServiceHost>, resource_link: DocumentLink) {
        match self {
            CompletionSink::Counter(link) => {
                let report = CompletionReport {
                    resource_link,
                    failure: None,
                };
                if let Ok(body) = serde_json::to_value(&report) {
                    host.spawn_patch(link.clone(), body);
                }
            }
            CompletionSink::Direct { callback, .. } => {
                if let Some(target) = callback.target_link.clone() {
                    let body = callback.finished_response(json!({
                        "failed_resource_links": [],
                    }));
                    host.spawn_patch(target, body);
                }
            }
        }
    }

    pub fn report_failure(
        &self,
        host: &Arc<ServiceHost>,
        resource_link: DocumentLink,
        failure: FailureInfo,
    ) {
        match self {
            CompletionSink::Counter(link) => {
                let report = CompletionReport {
                    resource_link,
                    failure: Some(failure),
                };
                if let Ok(body) = serde_json::to_value(&report) {
                    host.spawn_patch(link.clone(), body);
                }
            }
            CompletionSink::Direct {
                callback,
                error_threshold,
            } => {
                if let Some(target) = callback.target_link.clone() {
                    let within = *error_threshold >= 1.0;
                    if within {
                        info!(
                            resource = %resource_link,
                            "single completion failed, within threshold"
                        );
                    }
                    let extra = json!({ "failed_resource_links": [resource_link] });
                    let body = if within {
                        callback.finished_response(extra)
                    } else {
                        callback.failed_response(failure, extra)
                    };
                    host.spawn_patch(target, body);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CallbackTarget;
    use crate::impls::InMemoryStore;
    use rand::seq::SliceRandom;
    use rstest::rstest;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Test parent: records every patch body it receives.
    struct RecordingParent {
        received: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl DynTaskService for RecordingParent {
        fn factory(&self) -> &'static str {
            "/test/parents"
        }

        async fn handle_create(
            &self,
            _host: &Arc<ServiceHost>,
            _body: Value,
        ) -> Result<DocumentLink, EngineError> {
            Ok(DocumentLink::from_path("/test/parents/only"))
        }

        async fn handle_patch(
            &self,
            _host: &Arc<ServiceHost>,
            _link: &DocumentLink,
            body: Value,
        ) -> Result<(), EngineError> {
            self.received.lock().unwrap().push(body);
            Ok(())
        }

        async fn status(
            &self,
            _host: &Arc<ServiceHost>,
            _link: &DocumentLink,
        ) -> Result<TaskStatus, EngineError> {
            unimplemented!("not used in tests")
        }
    }

    fn test_host() -> (Arc<ServiceHost>, Arc<RecordingParent>) {
        let parent = Arc::new(RecordingParent {
            received: Mutex::new(Vec::new()),
        });
        let host = ServiceHost::builder(Arc::new(InMemoryStore::new()))
            .register_dyn(parent.clone())
            .build();
        (host, parent)
    }

    fn parent_callback() -> ServiceTaskCallback {
        ServiceTaskCallback::new(
            DocumentLink::from_path("/test/parents/only"),
            CallbackTarget::new(TaskStage::Started, "NEXT"),
            CallbackTarget::new(TaskStage::Started, "ERROR"),
        )
    }

    async fn drain(parent: &RecordingParent) -> Vec<Value> {
        // Callbacks are spawned; give the runtime a few polls to deliver.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if !parent.received.lock().unwrap().is_empty() {
                break;
            }
        }
        // settle window, to catch a second delivery that should not happen
        tokio::time::sleep(Duration::from_millis(25)).await;
        parent.received.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn all_successes_fire_finished_exactly_once() {
        let (host, parent) = test_host();
        let sink = CompletionSink::allocate(&host, 3, 0.0, parent_callback())
            .await
            .unwrap();
        for i in 0..3 {
            sink.report_success(&host, DocumentLink::from_path(&format!("/r/{i}")));
        }
        let got = drain(&parent).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["sub_stage"], "NEXT");
        assert_eq!(got[0]["failed_resource_links"], json!([]));
    }

    #[rstest]
    #[case(5, 0.5, true)]
    #[case(6, 0.5, false)]
    #[case(10, 1.0, true)]
    #[case(1, 0.0, false)]
    #[tokio::test]
    async fn threshold_boundary_is_inclusive(
        #[case] failures: u32,
        #[case] threshold: f64,
        #[case] expect_success: bool,
    ) {
        let (host, parent) = test_host();
        let sink = CompletionSink::allocate(&host, 10, threshold, parent_callback())
            .await
            .unwrap();
        for i in 0..10u32 {
            let link = DocumentLink::from_path(&format!("/r/{i}"));
            if i < failures {
                sink.report_failure(&host, link, FailureInfo::new("provider said no"));
            } else {
                sink.report_success(&host, link);
            }
        }
        let got = drain(&parent).await;
        assert_eq!(got.len(), 1);
        let expected = if expect_success { "NEXT" } else { "ERROR" };
        assert_eq!(got[0]["sub_stage"], expected);
    }

    #[tokio::test]
    async fn failure_path_enumerates_failed_links() {
        let (host, parent) = test_host();
        let sink = CompletionSink::allocate(&host, 2, 0.0, parent_callback())
            .await
            .unwrap();
        sink.report_success(&host, DocumentLink::from_path("/r/ok"));
        sink.report_failure(
            &host,
            DocumentLink::from_path("/r/bad"),
            FailureInfo::new("boom"),
        );
        let got = drain(&parent).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["sub_stage"], "ERROR");
        assert_eq!(got[0]["failed_resource_links"], json!(["/r/bad"]));
        assert!(
            got[0]["task_info"]["failure"]["message"]
                .as_str()
                .unwrap()
                .contains("1 of 2")
        );
    }

    #[tokio::test]
    async fn counter_document_self_deletes_after_callback() {
        let (host, parent) = test_host();
        let sink = CompletionSink::allocate(&host, 2, 0.0, parent_callback())
            .await
            .unwrap();
        let CompletionSink::Counter(counter_link) = &sink else {
            panic!("width 2 must allocate a counter");
        };
        sink.report_success(&host, DocumentLink::from_path("/r/0"));
        sink.report_success(&host, DocumentLink::from_path("/r/1"));
        drain(&parent).await;
        let err = host.store().get(counter_link).await.unwrap_err();
        assert!(err.is_benign());
    }

    #[tokio::test]
    async fn width_one_bypasses_the_counter() {
        let (host, parent) = test_host();
        let sink = CompletionSink::allocate(&host, 1, 0.0, parent_callback())
            .await
            .unwrap();
        assert!(matches!(sink, CompletionSink::Direct { .. }));
        sink.report_success(&host, DocumentLink::from_path("/r/0"));
        let got = drain(&parent).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["sub_stage"], "NEXT");
    }

    #[tokio::test]
    async fn width_one_failure_within_threshold_still_finishes() {
        let (host, parent) = test_host();
        let sink = CompletionSink::allocate(&host, 1, 1.0, parent_callback())
            .await
            .unwrap();
        sink.report_failure(
            &host,
            DocumentLink::from_path("/r/bad"),
            FailureInfo::new("teardown rejected"),
        );
        let got = drain(&parent).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["sub_stage"], "NEXT", "1 of 1 is within a 1.0 threshold");
        assert_eq!(got[0]["failed_resource_links"], json!(["/r/bad"]));
    }

    #[tokio::test]
    async fn width_one_failure_over_threshold_fails() {
        let (host, parent) = test_host();
        let sink = CompletionSink::allocate(&host, 1, 0.0, parent_callback())
            .await
            .unwrap();
        sink.report_failure(
            &host,
            DocumentLink::from_path("/r/bad"),
            FailureInfo::new("teardown rejected"),
        );
        let got = drain(&parent).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["sub_stage"], "ERROR");
        assert_eq!(got[0]["failed_resource_links"], json!(["/r/bad"]));
    }

    #[tokio::test]
    async fn width_one_rejects_an_out_of_range_threshold() {
        let (host, _parent) = test_host();
        let err = CompletionSink::allocate(&host, 1, 1.5, parent_callback())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn at_most_one_callback_under_randomized_concurrent_reports() {
        for round in 0..10 {
            let (host, parent) = test_host();
            let sink = CompletionSink::allocate(&host, 16, 0.5, parent_callback())
                .await
                .unwrap();
            let mut reports: Vec<(DocumentLink, bool)> = (0..16)
                .map(|i| (DocumentLink::from_path(&format!("/r/{round}/{i}")), i % 3 == 0))
                .collect();
            reports.shuffle(&mut rand::thread_rng());

            let handles: Vec<_> = reports
                .into_iter()
                .map(|(link, fail)| {
                    let host = host.clone();
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        if fail {
                            sink.report_failure(&host, link, FailureInfo::new("boom"));
                        } else {
                            sink.report_success(&host, link);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.await.unwrap();
            }

            let got = drain(&parent).await;
            assert_eq!(got.len(), 1, "round {round} fired {} callbacks", got.len());
            // 6 of 16 failed, rate 0.375 <= 0.5
            assert_eq!(got[0]["sub_stage"], "NEXT");
        }
    }

    #[tokio::test]
    async fn zero_count_is_rejected() {
        let (host, _) = test_host();
        let err = CompletionSink::allocate(&host, 0, 0.0, parent_callback())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn out_of_range_threshold_is_rejected() {
        let (host, _) = test_host();
        let err = CompletionSink::allocate(&host, 2, 1.5, parent_callback())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
