//! Dispatch pipeline
//!
//! A dispatch job sends one or more messages to a single recipient over the
//! shared transport. Attempts run strictly in order, `delay` apart, and each
//! one is isolated: a failed build or send is recorded and the loop moves on.
//!
//! Message construction is pluggable. Each [`Variant`] tag selects a
//! [`MessageBuilder`] from a [`StrategyTable`]; the loop itself is the same
//! for every variant.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tether_transport::Transport;

use crate::clock::{Clock, SystemClock, unix_millis};
use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::identity::PhoneNumber;
use crate::session_manager::SessionManager;

/// Message variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// `v1`
    #[default]
    V1,
    /// `v2`
    V2,
    /// `v3`
    V3,
}

impl Variant {
    /// All variants
    pub const ALL: [Variant; 3] = [Variant::V1, Variant::V2, Variant::V3];

    /// Wire tag
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
            Self::V3 => "v3",
        }
    }

    /// Parse a tag, falling back to the default variant for unknown or missing tags
    #[must_use]
    pub fn from_tag_or_default(tag: Option<&str>) -> Self {
        tag.and_then(|t| t.parse().ok()).unwrap_or_default()
    }
}

impl FromStr for Variant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            "v3" => Ok(Self::V3),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Unrecognised variant tag
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

/// Message construction failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message build failed: {0}")]
pub struct BuildError(pub String);

/// Builds the protocol frame for one attempt
pub trait MessageBuilder: Send + Sync {
    /// Frame for attempt `index` (1-based) to `recipient`
    ///
    /// # Errors
    /// Returns `BuildError` if the frame cannot be produced
    fn build(&self, recipient: &PhoneNumber, index: u32) -> std::result::Result<Vec<u8>, BuildError>;
}

/// Data-driven text message: a content kind and a body template.
///
/// `{index}` in the body is replaced by the attempt number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    /// Content kind understood by the transport
    pub kind: String,
    /// Body template
    pub body: String,
}

impl MessageTemplate {
    /// Template with the given kind and body
    #[must_use]
    pub fn new(kind: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            body: body.into(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    kind: &'a str,
    to: String,
    text: String,
}

impl MessageBuilder for MessageTemplate {
    fn build(&self, recipient: &PhoneNumber, index: u32) -> std::result::Result<Vec<u8>, BuildError> {
        let envelope = Envelope {
            kind: &self.kind,
            to: recipient.jid(),
            text: self.body.replace("{index}", &index.to_string()),
        };
        serde_json::to_vec(&envelope).map_err(|e| BuildError(e.to_string()))
    }
}

/// Variant → builder mapping
#[derive(Clone)]
pub struct StrategyTable {
    builders: HashMap<Variant, Arc<dyn MessageBuilder>>,
}

impl StrategyTable {
    /// Table with no builders
    #[must_use]
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Register `builder` for `variant`, replacing any previous one
    #[must_use]
    pub fn with(mut self, variant: Variant, builder: Arc<dyn MessageBuilder>) -> Self {
        self.builders.insert(variant, builder);
        self
    }

    /// Builder for `variant`
    #[must_use]
    pub fn get(&self, variant: Variant) -> Option<&Arc<dyn MessageBuilder>> {
        self.builders.get(&variant)
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::empty()
            .with(
                Variant::V1,
                Arc::new(MessageTemplate::new("text", "Message {index}")),
            )
            .with(
                Variant::V2,
                Arc::new(MessageTemplate::new("extendedText", "Message {index}")),
            )
            .with(
                Variant::V3,
                Arc::new(MessageTemplate::new("notice", "Notice {index}")),
            )
    }
}

impl fmt::Debug for StrategyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut variants: Vec<_> = self.builders.keys().map(|v| v.tag()).collect();
        variants.sort_unstable();
        f.debug_struct("StrategyTable")
            .field("variants", &variants)
            .finish()
    }
}

/// Job-level success criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessPolicy {
    /// The job succeeds once every attempt has run, whatever the attempt
    /// outcomes, except that a single-attempt job fails if its attempt failed
    #[default]
    Completed,
    /// Every attempt must succeed
    AllSucceeded,
    /// At least this many attempts must succeed
    AtLeast(u32),
}

impl SuccessPolicy {
    /// Apply the policy to a job's attempt outcomes
    #[must_use]
    pub fn evaluate(self, outcomes: &[AttemptOutcome]) -> bool {
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        match self {
            Self::Completed => outcomes.len() != 1 || succeeded == 1,
            Self::AllSucceeded => succeeded == outcomes.len(),
            Self::AtLeast(n) => succeeded >= n as usize,
        }
    }
}

/// A validated dispatch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchJob {
    /// Recipient
    pub recipient: PhoneNumber,
    /// Message variant
    pub variant: Variant,
    /// Number of attempts
    pub attempts: u32,
    /// Delay between attempts
    pub delay: Duration,
}

/// Outcome of one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptOutcome {
    /// 1-based attempt number
    pub index: u32,
    /// Frame accepted by the transport
    pub success: bool,
    /// Why the attempt failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a dispatch job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Job-level outcome under the pipeline's [`SuccessPolicy`]
    pub success: bool,
    /// Human-readable summary
    pub message: String,
    /// Recipient address
    pub target: String,
    /// Variant used
    pub variant: Variant,
    /// Per-attempt outcomes, in order
    pub attempts: Vec<AttemptOutcome>,
    /// Completion time, milliseconds since the Unix epoch
    pub sent_at: u64,
}

impl DispatchReport {
    /// Attempts that succeeded
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.attempts.iter().filter(|a| a.success).count()
    }

    /// Attempts that failed
    #[must_use]
    pub fn failed(&self) -> usize {
        self.attempts.len() - self.succeeded()
    }
}

/// Sequential, per-attempt-isolated sender
#[derive(Clone)]
pub struct DispatchPipeline {
    strategies: StrategyTable,
    policy: SuccessPolicy,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl DispatchPipeline {
    /// Pipeline with the default strategies and policy
    #[must_use]
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            strategies: StrategyTable::default(),
            policy: SuccessPolicy::default(),
            max_attempts: config.max_attempts_per_job,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the strategy table
    #[must_use]
    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.strategies = strategies;
        self
    }

    /// Replace the success policy
    #[must_use]
    pub fn with_policy(mut self, policy: SuccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the clock used for `sent_at`
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Success policy in use
    #[must_use]
    pub fn policy(&self) -> SuccessPolicy {
        self.policy
    }

    /// Validate a request into a job.
    ///
    /// # Errors
    ///
    /// - `LinkError::InvalidRecipient` if `recipient` is not a phone number
    /// - `LinkError::InvalidJob` if `attempts` is zero or above the per-job cap
    pub fn job(
        &self,
        recipient: &str,
        variant: Variant,
        attempts: u32,
        delay: Duration,
    ) -> Result<DispatchJob> {
        let recipient = PhoneNumber::parse(recipient).map_err(LinkError::InvalidRecipient)?;

        if attempts == 0 {
            return Err(LinkError::InvalidJob("attempt count must be at least 1".into()));
        }
        if attempts > self.max_attempts {
            return Err(LinkError::InvalidJob(
                format!("attempt count {attempts} exceeds limit of {}", self.max_attempts).into(),
            ));
        }

        Ok(DispatchJob {
            recipient,
            variant,
            attempts,
            delay,
        })
    }

    /// Validate, check the session is connected, and run the job.
    ///
    /// # Errors
    ///
    /// - `LinkError::InvalidRecipient` / `LinkError::InvalidJob` from [`job`](Self::job)
    /// - `LinkError::NotConnected` if the session is not connected
    ///
    /// Attempt failures are reported in the returned [`DispatchReport`], not as errors.
    pub async fn dispatch(
        &self,
        session: &SessionManager,
        recipient: &str,
        variant: Variant,
        attempts: u32,
        delay: Duration,
    ) -> Result<DispatchReport> {
        let job = self.job(recipient, variant, attempts, delay)?;
        let transport = session.connected_transport().await?;
        Ok(self.run(transport.as_ref(), &job).await)
    }

    /// Run a validated job on `transport`
    pub async fn run(&self, transport: &dyn Transport, job: &DispatchJob) -> DispatchReport {
        let address = job.recipient.jid();
        let builder = self.strategies.get(job.variant);
        let mut outcomes = Vec::with_capacity(job.attempts as usize);

        for index in 1..=job.attempts {
            let result = match builder {
                Some(builder) => match builder.build(&job.recipient, index) {
                    Ok(frame) => transport
                        .send_raw(&address, &frame)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                },
                None => Err(format!("no builder registered for {}", job.variant)),
            };

            match result {
                Ok(()) => {
                    tracing::debug!(index, total = job.attempts, to = %address, "Attempt sent");
                    outcomes.push(AttemptOutcome {
                        index,
                        success: true,
                        error: None,
                    });
                }
                Err(error) => {
                    tracing::warn!(index, total = job.attempts, to = %address, %error, "Attempt failed");
                    outcomes.push(AttemptOutcome {
                        index,
                        success: false,
                        error: Some(error),
                    });
                }
            }

            if index < job.attempts {
                tokio::time::sleep(job.delay).await;
            }
        }

        let success = self.policy.evaluate(&outcomes);
        let sent = outcomes.iter().filter(|o| o.success).count();
        tracing::info!(
            to = %address,
            variant = %job.variant,
            sent,
            total = job.attempts,
            success,
            "Dispatch job finished"
        );

        DispatchReport {
            success,
            message: format!("{sent} of {} messages sent", job.attempts),
            target: address,
            variant: job.variant,
            attempts: outcomes,
            sent_at: unix_millis(self.clock.now()),
        }
    }
}

impl fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("strategies", &self.strategies)
            .field("policy", &self.policy)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tether_transport::{TransportError, TransportResult};
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingTransport {
        fail_on: HashSet<u32>,
        calls: AtomicU32,
        sent: Mutex<Vec<(String, Vec<u8>, Instant)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(&self) -> TransportResult<()> {
            Ok(())
        }

        async fn request_pairing_code(&self, _phone_number: &str) -> TransportResult<String> {
            Ok("00000000".into())
        }

        async fn send_raw(&self, address: &str, frame: &[u8]) -> TransportResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&call) {
                return Err(TransportError::SendFailed(format!("call {call} rejected")));
            }
            self.sent
                .lock()
                .await
                .push((address.to_string(), frame.to_vec(), Instant::now()));
            Ok(())
        }

        async fn shutdown(&self) -> TransportResult<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    struct FailingBuilder;

    impl MessageBuilder for FailingBuilder {
        fn build(&self, _recipient: &PhoneNumber, _index: u32) -> std::result::Result<Vec<u8>, BuildError> {
            Err(BuildError("template missing".into()))
        }
    }

    fn pipeline() -> DispatchPipeline {
        DispatchPipeline::new(&LinkConfig::default())
    }

    fn outcome(index: u32, success: bool) -> AttemptOutcome {
        AttemptOutcome {
            index,
            success,
            error: (!success).then(|| "x".to_string()),
        }
    }

    #[test]
    fn test_variant_tags() {
        assert_eq!("v2".parse::<Variant>(), Ok(Variant::V2));
        assert_eq!(" V3 ".parse::<Variant>(), Ok(Variant::V3));
        assert!("v9".parse::<Variant>().is_err());
        assert_eq!(Variant::from_tag_or_default(Some("v9")), Variant::V1);
        assert_eq!(Variant::from_tag_or_default(None), Variant::V1);
    }

    #[test]
    fn test_default_table_covers_all_variants() {
        let table = StrategyTable::default();
        for variant in Variant::ALL {
            assert!(table.get(variant).is_some(), "{variant}");
        }
    }

    #[test]
    fn test_template_builder() {
        let recipient = PhoneNumber::parse("08123456789").unwrap();
        let frame = MessageTemplate::new("text", "hello #{index}")
            .build(&recipient, 3)
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["to"], "628123456789@s.whatsapp.net");
        assert_eq!(json["text"], "hello #3");
    }

    #[test]
    fn test_success_policies() {
        let mixed = [outcome(1, true), outcome(2, false), outcome(3, true)];
        assert!(SuccessPolicy::Completed.evaluate(&mixed));
        assert!(!SuccessPolicy::AllSucceeded.evaluate(&mixed));
        assert!(SuccessPolicy::AtLeast(2).evaluate(&mixed));
        assert!(!SuccessPolicy::AtLeast(3).evaluate(&mixed));

        assert!(!SuccessPolicy::Completed.evaluate(&[outcome(1, false)]));
        assert!(SuccessPolicy::Completed.evaluate(&[outcome(1, true)]));
        assert!(SuccessPolicy::Completed.evaluate(&[outcome(1, false), outcome(2, false)]));
    }

    #[test]
    fn test_job_validation() {
        let pipeline = pipeline();
        assert!(matches!(
            pipeline.job("12", Variant::V1, 1, Duration::ZERO),
            Err(LinkError::InvalidRecipient(_))
        ));
        assert!(matches!(
            pipeline.job("08123456789", Variant::V1, 0, Duration::ZERO),
            Err(LinkError::InvalidJob(_))
        ));
        assert!(matches!(
            pipeline.job("08123456789", Variant::V1, 11, Duration::ZERO),
            Err(LinkError::InvalidJob(_))
        ));

        let job = pipeline
            .job("8123456789", Variant::V2, 10, Duration::ZERO)
            .unwrap();
        assert_eq!(job.recipient.as_str(), "628123456789");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_are_isolated() {
        let transport = RecordingTransport {
            fail_on: HashSet::from([2, 4]),
            ..Default::default()
        };
        let pipeline = pipeline();
        let job = pipeline
            .job("08123456789", Variant::V1, 5, Duration::from_millis(100))
            .unwrap();

        let report = pipeline.run(&transport, &job).await;

        assert!(report.success);
        assert_eq!(report.succeeded(), 3);
        assert_eq!(report.failed(), 2);
        let indices: Vec<_> = report.attempts.iter().map(|a| a.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert!(!report.attempts[1].success);
        assert!(!report.attempts[3].success);
        assert!(report.attempts[3].error.as_ref().unwrap().contains("call 4"));
        assert_eq!(report.message, "3 of 5 messages sent");
        assert_eq!(report.target, "628123456789@s.whatsapp.net");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_attempts_only() {
        let transport = RecordingTransport::default();
        let pipeline = pipeline();
        let job = pipeline
            .job("08123456789", Variant::V1, 3, Duration::from_millis(250))
            .unwrap();

        let start = Instant::now();
        pipeline.run(&transport, &job).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(505));
        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 3);
        assert!(sent[1].2 - sent[0].2 >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_failure_fails_job() {
        let transport = RecordingTransport {
            fail_on: HashSet::from([1]),
            ..Default::default()
        };
        let pipeline = pipeline();
        let job = pipeline
            .job("08123456789", Variant::V1, 1, Duration::ZERO)
            .unwrap();

        let report = pipeline.run(&transport, &job).await;
        assert!(!report.success);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_failure_is_recorded() {
        let transport = RecordingTransport::default();
        let pipeline = pipeline().with_strategies(
            StrategyTable::default().with(Variant::V3, Arc::new(FailingBuilder)),
        );
        let job = pipeline
            .job("08123456789", Variant::V3, 2, Duration::ZERO)
            .unwrap();

        let report = pipeline.run(&transport, &job).await;
        assert_eq!(report.failed(), 2);
        assert!(report.attempts[0].error.as_ref().unwrap().contains("template missing"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_policy() {
        let transport = RecordingTransport {
            fail_on: HashSet::from([2]),
            ..Default::default()
        };
        let pipeline = pipeline().with_policy(SuccessPolicy::AllSucceeded);
        let job = pipeline
            .job("08123456789", Variant::V1, 3, Duration::ZERO)
            .unwrap();

        assert!(!pipeline.run(&transport, &job).await.success);
    }
}
