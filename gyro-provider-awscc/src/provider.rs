//! AWS Cloud Control Provider implementation
//!
//! Talks to the AWS Cloud Control API on behalf of resource lifecycle code:
//! reads resource properties, applies tag changes and waits for asynchronous
//! requests to settle.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use aws_config::Region;
use aws_sdk_cloudcontrol::Client as CloudControlClient;
use aws_sdk_cloudcontrol::operation::get_resource::GetResourceError;
use aws_sdk_cloudcontrol::types::OperationStatus;
use gyro_core::provider::{BoxFuture, ProviderError, ProviderResult, TagClient};
use gyro_core::resource::ResourceId;
use gyro_core::tags::TagSet;
use gyro_core::wait::{
    CancelToken, ConditionError, Converged, ConvergencePoller, PollError, PollPolicy,
};
use log::debug;

use crate::tags::{tags_from_json, tags_patch};

/// Interval between request status checks
pub const OPERATION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Ceiling on a single Cloud Control request
pub const OPERATION_MAX_WAIT: Duration = Duration::from_secs(600);

/// Outcome of a single request status check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationProgress {
    /// Request finished; carries the resource identifier
    Succeeded(String),
    InProgress,
    Failed(String),
}

/// Map a Cloud Control request status to its outcome
pub fn classify_status(
    status: Option<&OperationStatus>,
    identifier: Option<&str>,
    message: Option<&str>,
) -> OperationProgress {
    match status {
        Some(OperationStatus::Success) => {
            OperationProgress::Succeeded(identifier.unwrap_or("").to_string())
        }
        Some(OperationStatus::Failed) => OperationProgress::Failed(format!(
            "Operation failed: {}",
            message.unwrap_or("Unknown error")
        )),
        Some(OperationStatus::CancelComplete) => {
            OperationProgress::Failed("Operation was cancelled".to_string())
        }
        _ => OperationProgress::InProgress,
    }
}

/// Whether a `GetResource` error means the resource does not exist (yet)
///
/// An unknown resource type is a configuration error, not a missing resource.
pub fn is_not_found(error: &GetResourceError) -> bool {
    error.is_resource_not_found_exception()
}

/// Fold a poll failure into a provider error, keeping the original as cause
pub fn from_poll_error(error: PollError<ProviderError>) -> ProviderError {
    match error {
        PollError::Failed(e) => e,
        other => ProviderError::new(format!("Operation did not complete: {}", other))
            .with_cause(other),
    }
}

/// AWS Cloud Control Provider
pub struct AwsccProvider {
    cloudcontrol_client: CloudControlClient,
    region: String,
    poller: ConvergencePoller,
    operation_policy: PollPolicy,
}

impl AwsccProvider {
    /// Create a new AwsccProvider for the specified region
    pub async fn new(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Self::with_client(CloudControlClient::new(&config), region)
    }

    /// Create with a specific client
    pub fn with_client(cloudcontrol_client: CloudControlClient, region: &str) -> Self {
        Self {
            cloudcontrol_client,
            region: region.to_string(),
            poller: ConvergencePoller::new(),
            operation_policy: PollPolicy::new(OPERATION_MAX_WAIT, OPERATION_CHECK_INTERVAL),
        }
    }

    /// Override how long request status is polled
    pub fn with_operation_policy(mut self, policy: PollPolicy) -> Self {
        self.operation_policy = policy;
        self
    }

    /// Abort in-flight waits when `token` is cancelled
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.poller = self.poller.with_cancel(token);
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    // =========================================================================
    // Cloud Control API Methods
    // =========================================================================

    /// Get a resource by identifier using Cloud Control API
    pub async fn cc_get_resource(
        &self,
        type_name: &str,
        identifier: &str,
    ) -> ProviderResult<Option<serde_json::Value>> {
        let result = self
            .cloudcontrol_client
            .get_resource()
            .type_name(type_name)
            .identifier(identifier)
            .send()
            .await;

        match result {
            Ok(response) => {
                if let Some(desc) = response.resource_description()
                    && let Some(props_str) = desc.properties()
                {
                    let props: serde_json::Value = serde_json::from_str(props_str)
                        .map_err(|e| {
                            ProviderError::new(format!(
                                "Invalid properties for {} {}",
                                type_name, identifier
                            ))
                            .with_cause(e)
                        })?;
                    Ok(Some(props))
                } else {
                    Ok(None)
                }
            }
            Err(e) => {
                if e.as_service_error().is_some_and(is_not_found) {
                    Ok(None)
                } else {
                    Err(
                        ProviderError::new(format!("Failed to get resource: {:?}", e))
                            .for_resource(ResourceId::new(type_name, identifier)),
                    )
                }
            }
        }
    }

    /// Create a resource using Cloud Control API
    ///
    /// Returns the identifier once the request has settled.
    pub async fn cc_create_resource(
        &self,
        type_name: &str,
        desired_state: serde_json::Value,
    ) -> ProviderResult<String> {
        let result = self
            .cloudcontrol_client
            .create_resource()
            .type_name(type_name)
            .desired_state(desired_state.to_string())
            .send()
            .await
            .map_err(|e| ProviderError::new(format!("Failed to create resource: {:?}", e)))?;

        let request_token = result
            .progress_event()
            .and_then(|p| p.request_token())
            .ok_or_else(|| ProviderError::new("No request token returned"))?;

        self.wait_for_operation(request_token)
            .await
            .map_err(from_poll_error)
    }

    /// Update a resource using Cloud Control API
    pub async fn cc_update_resource(
        &self,
        type_name: &str,
        identifier: &str,
        patch_ops: Vec<serde_json::Value>,
    ) -> ProviderResult<()> {
        if patch_ops.is_empty() {
            return Ok(());
        }

        let patch_document = serde_json::to_string(&patch_ops)
            .map_err(|e| ProviderError::new(format!("Failed to build patch: {}", e)))?;

        let result = self
            .cloudcontrol_client
            .update_resource()
            .type_name(type_name)
            .identifier(identifier)
            .patch_document(patch_document)
            .send()
            .await
            .map_err(|e| ProviderError::new(format!("Failed to update resource: {:?}", e)))?;

        if let Some(request_token) = result.progress_event().and_then(|p| p.request_token()) {
            self.wait_for_operation(request_token)
                .await
                .map_err(from_poll_error)?;
        }

        Ok(())
    }

    /// Delete a resource using Cloud Control API
    pub async fn cc_delete_resource(
        &self,
        type_name: &str,
        identifier: &str,
    ) -> ProviderResult<()> {
        let result = self
            .cloudcontrol_client
            .delete_resource()
            .type_name(type_name)
            .identifier(identifier)
            .send()
            .await
            .map_err(|e| ProviderError::new(format!("Failed to delete resource: {:?}", e)))?;

        if let Some(request_token) = result.progress_event().and_then(|p| p.request_token()) {
            self.wait_for_operation(request_token)
                .await
                .map_err(from_poll_error)?;
        }

        Ok(())
    }

    // =========================================================================
    // Waiters
    // =========================================================================

    /// Wait for a Cloud Control request to settle
    ///
    /// Returns the resource identifier reported by the request.
    pub async fn wait_for_operation(
        &self,
        request_token: &str,
    ) -> Result<String, PollError<ProviderError>> {
        let identifier = OnceLock::new();

        self.poller
            .wait_until(&self.operation_policy, || {
                self.check_operation(request_token, &identifier)
            })
            .await?;

        Ok(identifier.into_inner().unwrap_or_default())
    }

    async fn check_operation(
        &self,
        request_token: &str,
        identifier: &OnceLock<String>,
    ) -> Result<bool, ConditionError<ProviderError>> {
        let status = self
            .cloudcontrol_client
            .get_resource_request_status()
            .request_token(request_token)
            .send()
            .await
            .map_err(|e| ProviderError::new(format!("Failed to get operation status: {:?}", e)))?;

        let Some(progress) = status.progress_event() else {
            return Ok(false);
        };

        match classify_status(
            progress.operation_status(),
            progress.identifier(),
            progress.status_message(),
        ) {
            OperationProgress::Succeeded(id) => {
                identifier.get_or_init(|| id);
                Ok(true)
            }
            OperationProgress::InProgress => Ok(false),
            OperationProgress::Failed(message) => Err(ProviderError::new(message).into()),
        }
    }

    /// Wait until a resource becomes readable
    ///
    /// "Not found" answers count as not yet converged rather than as errors.
    pub async fn wait_until_exists(
        &self,
        type_name: &str,
        identifier: &str,
        policy: &PollPolicy,
    ) -> Result<Converged, PollError<ProviderError>> {
        self.poller
            .wait_until(policy, || self.check_exists(type_name, identifier))
            .await
    }

    async fn check_exists(
        &self,
        type_name: &str,
        identifier: &str,
    ) -> Result<bool, ConditionError<ProviderError>> {
        match self.cc_get_resource(type_name, identifier).await? {
            Some(_) => Ok(true),
            None => Err(ConditionError::NotYetAvailable),
        }
    }

    // =========================================================================
    // Tags
    // =========================================================================

    /// Read the tags currently applied to a resource
    pub async fn read_tags(&self, type_name: &str, identifier: &str) -> ProviderResult<TagSet> {
        let props = self
            .cc_get_resource(type_name, identifier)
            .await?
            .ok_or_else(|| {
                ProviderError::new("Resource not found")
                    .for_resource(ResourceId::new(type_name, identifier))
            })?;
        Ok(tags_from_json(&props))
    }

    /// Tag client bound to one resource
    pub fn tag_client<'a>(&'a self, type_name: &'a str, identifier: &'a str) -> CloudControlTags<'a> {
        CloudControlTags {
            provider: self,
            type_name,
            identifier,
        }
    }

    async fn rewrite_tags(
        &self,
        type_name: &str,
        identifier: &str,
        edit: impl FnOnce(&mut TagSet),
    ) -> ProviderResult<()> {
        let mut tags = self.read_tags(type_name, identifier).await?;
        edit(&mut tags);
        debug!("writing {} tag(s) to {} {}", tags.len(), type_name, identifier);
        self.cc_update_resource(type_name, identifier, tags_patch(&tags))
            .await
    }
}

/// `TagClient` over the Cloud Control `Tags` property
///
/// Cloud Control has no tag-specific calls, so each operation rewrites the
/// whole `Tags` array.
pub struct CloudControlTags<'a> {
    provider: &'a AwsccProvider,
    type_name: &'a str,
    identifier: &'a str,
}

impl TagClient for CloudControlTags<'_> {
    fn untag<'a>(
        &'a self,
        tags: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.provider
                .rewrite_tags(self.type_name, self.identifier, |current| {
                    for key in tags.keys() {
                        current.remove(key);
                    }
                })
                .await
        })
    }

    fn tag<'a>(
        &'a self,
        tags: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.provider
                .rewrite_tags(self.type_name, self.identifier, |current| {
                    for (key, value) in tags {
                        current.insert(key.clone(), value.clone());
                    }
                })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_cloudcontrol::operation::get_resource::GetResourceOutput;
    use aws_sdk_cloudcontrol::operation::get_resource_request_status::GetResourceRequestStatusOutput;
    use aws_sdk_cloudcontrol::operation::update_resource::UpdateResourceOutput;
    use aws_sdk_cloudcontrol::types::error::{ResourceNotFoundException, TypeNotFoundException};
    use aws_sdk_cloudcontrol::types::{ProgressEvent, ResourceDescription};
    use aws_smithy_mocks::{Rule, RuleMode, mock, mock_client};
    use gyro_core::provider::sync_tags;
    use gyro_core::wait::cancel_pair;
    use serde_json::json;

    const LOG_GROUP: &str = "AWS::Logs::LogGroup";

    fn mocked_provider(rules: &[&Rule]) -> AwsccProvider {
        let client = mock_client!(aws_sdk_cloudcontrol, RuleMode::Sequential, rules);
        AwsccProvider::with_client(client, "us-east-1")
    }

    fn resource_output(props: serde_json::Value) -> GetResourceOutput {
        GetResourceOutput::builder()
            .type_name(LOG_GROUP)
            .resource_description(
                ResourceDescription::builder()
                    .identifier("app")
                    .properties(props.to_string())
                    .build(),
            )
            .build()
    }

    fn status_output(
        status: OperationStatus,
        identifier: Option<&str>,
        message: Option<&str>,
    ) -> GetResourceRequestStatusOutput {
        GetResourceRequestStatusOutput::builder()
            .progress_event(
                ProgressEvent::builder()
                    .operation_status(status)
                    .set_identifier(identifier.map(String::from))
                    .set_status_message(message.map(String::from))
                    .build(),
            )
            .build()
    }

    fn update_output(request_token: &str) -> UpdateResourceOutput {
        UpdateResourceOutput::builder()
            .progress_event(
                ProgressEvent::builder()
                    .request_token(request_token)
                    .operation_status(OperationStatus::InProgress)
                    .build(),
            )
            .build()
    }

    fn resource_not_found() -> GetResourceError {
        GetResourceError::ResourceNotFoundException(
            ResourceNotFoundException::builder()
                .message("Resource of type 'AWS::Logs::LogGroup' with identifier 'app' was not found.")
                .build(),
        )
    }

    fn type_not_found() -> GetResourceError {
        GetResourceError::TypeNotFoundException(
            TypeNotFoundException::builder()
                .message("The type 'AWS::Logs::LogGrop' cannot be found.")
                .build(),
        )
    }

    fn tag_set(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // Never reaches the network in these tests
    fn offline_provider() -> AwsccProvider {
        let config = aws_sdk_cloudcontrol::Config::builder()
            .behavior_version(aws_sdk_cloudcontrol::config::BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        AwsccProvider::with_client(CloudControlClient::from_conf(config), "us-east-1")
    }

    #[tokio::test]
    async fn test_cancelled_wait_sends_no_request() {
        let (handle, token) = cancel_pair();
        handle.cancel();
        let provider = offline_provider().with_cancel(token);
        let policy = PollPolicy::new(Duration::from_secs(1200), Duration::from_secs(10));

        let error = provider
            .wait_until_exists("AWS::Elasticsearch::Domain", "search", &policy)
            .await
            .unwrap_err();

        assert!(matches!(error, PollError::Cancelled { checks: 0, .. }));
    }

    #[tokio::test]
    async fn test_invalid_operation_policy_is_rejected() {
        let provider = offline_provider()
            .with_operation_policy(PollPolicy::new(OPERATION_MAX_WAIT, Duration::ZERO));

        let error = provider.wait_for_operation("token").await.unwrap_err();

        assert!(matches!(error, PollError::InvalidPolicy(_)));
    }

    #[test]
    fn test_region() {
        assert_eq!(offline_provider().region(), "us-east-1");
    }

    #[test]
    fn test_classify_success() {
        assert_eq!(
            classify_status(Some(&OperationStatus::Success), Some("vpc-123"), None),
            OperationProgress::Succeeded("vpc-123".to_string())
        );
    }

    #[test]
    fn test_classify_failed() {
        assert_eq!(
            classify_status(
                Some(&OperationStatus::Failed),
                None,
                Some("Limit exceeded")
            ),
            OperationProgress::Failed("Operation failed: Limit exceeded".to_string())
        );
        assert_eq!(
            classify_status(Some(&OperationStatus::Failed), None, None),
            OperationProgress::Failed("Operation failed: Unknown error".to_string())
        );
    }

    #[test]
    fn test_classify_cancelled() {
        assert_eq!(
            classify_status(Some(&OperationStatus::CancelComplete), None, None),
            OperationProgress::Failed("Operation was cancelled".to_string())
        );
    }

    #[test]
    fn test_classify_in_progress() {
        assert_eq!(
            classify_status(Some(&OperationStatus::InProgress), None, None),
            OperationProgress::InProgress
        );
        assert_eq!(
            classify_status(Some(&OperationStatus::Pending), None, None),
            OperationProgress::InProgress
        );
        assert_eq!(classify_status(None, None, None), OperationProgress::InProgress);
    }

    #[test]
    fn test_is_not_found() {
        assert!(is_not_found(&resource_not_found()));
    }

    #[test]
    fn test_unknown_type_is_not_missing_resource() {
        assert!(!is_not_found(&type_not_found()));
    }

    // =========================================================================
    // Mocked Cloud Control
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_operation_returns_identifier() {
        let pending = mock!(aws_sdk_cloudcontrol::Client::get_resource_request_status)
            .match_requests(|req| req.request_token() == Some("token-1"))
            .then_output(|| status_output(OperationStatus::InProgress, None, None));
        let done = mock!(aws_sdk_cloudcontrol::Client::get_resource_request_status)
            .match_requests(|req| req.request_token() == Some("token-1"))
            .then_output(|| status_output(OperationStatus::Success, Some("app"), None));
        let provider = mocked_provider(&[&pending, &done]);
        let started = tokio::time::Instant::now();

        let identifier = provider.wait_for_operation("token-1").await.unwrap();

        assert_eq!(identifier, "app");
        assert_eq!(pending.num_calls(), 1);
        assert_eq!(done.num_calls(), 1);
        assert!(started.elapsed() >= OPERATION_CHECK_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_operation_failed_is_not_retried() {
        let failed = mock!(aws_sdk_cloudcontrol::Client::get_resource_request_status)
            .then_output(|| {
                status_output(OperationStatus::Failed, None, Some("Limit exceeded"))
            });
        let provider = mocked_provider(&[&failed]);
        let started = tokio::time::Instant::now();

        let error = provider.wait_for_operation("token-1").await.unwrap_err();

        match error {
            PollError::Failed(e) => assert_eq!(e.message, "Operation failed: Limit exceeded"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(failed.num_calls(), 1);
        assert!(started.elapsed() < OPERATION_CHECK_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_exists_retries_missing_resource() {
        let missing = mock!(aws_sdk_cloudcontrol::Client::get_resource)
            .then_error(resource_not_found);
        let found = mock!(aws_sdk_cloudcontrol::Client::get_resource)
            .then_output(|| resource_output(json!({"LogGroupName": "app"})));
        let provider = mocked_provider(&[&missing, &found]);
        let policy = PollPolicy::new(Duration::from_secs(60), Duration::from_secs(10));

        let converged = provider
            .wait_until_exists(LOG_GROUP, "app", &policy)
            .await
            .unwrap();

        assert_eq!(converged.checks, 2);
        assert!(converged.elapsed >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_exists_fails_fast_on_unknown_type() {
        let unknown = mock!(aws_sdk_cloudcontrol::Client::get_resource).then_error(type_not_found);
        let provider = mocked_provider(&[&unknown]);
        let policy = PollPolicy::new(Duration::from_secs(60), Duration::from_secs(10));

        let error = provider
            .wait_until_exists(LOG_GROUP, "app", &policy)
            .await
            .unwrap_err();

        match error {
            PollError::Failed(e) => {
                assert!(e.message.starts_with("Failed to get resource"));
                assert_eq!(e.resource_id, Some(ResourceId::new(LOG_GROUP, "app")));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(unknown.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_read_tags_missing_resource_names_it() {
        let missing = mock!(aws_sdk_cloudcontrol::Client::get_resource)
            .then_error(resource_not_found);
        let provider = mocked_provider(&[&missing]);

        let error = provider.read_tags(LOG_GROUP, "app").await.unwrap_err();

        assert_eq!(
            error.to_string(),
            "[AWS::Logs::LogGroup.app] Resource not found"
        );
    }

    #[tokio::test]
    async fn test_sync_tags_rewrites_tags_property() {
        let after_untag = serde_json::to_string(&tags_patch(&tag_set(&[("Name", "a")]))).unwrap();
        let after_tag =
            serde_json::to_string(&tags_patch(&tag_set(&[("Name", "a"), ("Env", "prod")])))
                .unwrap();

        let read_before_untag = mock!(aws_sdk_cloudcontrol::Client::get_resource).then_output(|| {
            resource_output(json!({
                "LogGroupName": "app",
                "Tags": [
                    {"Key": "Name", "Value": "a"},
                    {"Key": "Env", "Value": "dev"},
                    {"Key": "Old", "Value": "x"}
                ]
            }))
        });
        let untag = mock!(aws_sdk_cloudcontrol::Client::update_resource)
            .match_requests(move |req| req.patch_document() == Some(after_untag.as_str()))
            .then_output(|| update_output("untag-token"));
        let untag_done = mock!(aws_sdk_cloudcontrol::Client::get_resource_request_status)
            .match_requests(|req| req.request_token() == Some("untag-token"))
            .then_output(|| status_output(OperationStatus::Success, Some("app"), None));
        let read_before_tag = mock!(aws_sdk_cloudcontrol::Client::get_resource).then_output(|| {
            resource_output(json!({
                "LogGroupName": "app",
                "Tags": [{"Key": "Name", "Value": "a"}]
            }))
        });
        let tag = mock!(aws_sdk_cloudcontrol::Client::update_resource)
            .match_requests(move |req| req.patch_document() == Some(after_tag.as_str()))
            .then_output(|| update_output("tag-token"));
        let tag_done = mock!(aws_sdk_cloudcontrol::Client::get_resource_request_status)
            .match_requests(|req| req.request_token() == Some("tag-token"))
            .then_output(|| status_output(OperationStatus::Success, Some("app"), None));
        let provider = mocked_provider(&[
            &read_before_untag,
            &untag,
            &untag_done,
            &read_before_tag,
            &tag,
            &tag_done,
        ]);

        let desired = tag_set(&[("Name", "a"), ("Env", "prod")]);
        let current = tag_set(&[("Name", "a"), ("Env", "dev"), ("Old", "x")]);
        let delta = sync_tags(&provider.tag_client(LOG_GROUP, "app"), &desired, &current)
            .await
            .unwrap();

        assert_eq!(delta.removed_keys().count(), 2);
        assert_eq!(untag.num_calls(), 1);
        assert_eq!(tag.num_calls(), 1);
        assert_eq!(tag_done.num_calls(), 1);
    }

    #[test]
    fn test_from_poll_error_keeps_condition_error() {
        let error = from_poll_error(PollError::Failed(ProviderError::new("Operation failed: x")));
        assert_eq!(error.message, "Operation failed: x");
    }

    #[test]
    fn test_from_poll_error_timeout_has_cause() {
        let timeout = gyro_core::wait::PollTimeoutError {
            elapsed: OPERATION_MAX_WAIT,
            checks: 121,
            policy: PollPolicy::new(OPERATION_MAX_WAIT, OPERATION_CHECK_INTERVAL),
        };

        let error = from_poll_error(PollError::TimedOut(timeout));

        assert!(error.message.starts_with("Operation did not complete"));
        assert!(std::error::Error::source(&error).is_some());
    }
}
