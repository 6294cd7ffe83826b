use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use taxpal_shared::{ChatMessage, ErrorClassification};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::GatewayClient;
use crate::liveness::{LivenessProber, ServerStatus};

pub const OFFLINE_REPLY: &str = "I'm sorry, I can't connect to the server. Please try again later.";
pub const MAX_RETRIES_ERROR: &str = "Maximum automatic retries reached. You can try again manually.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    RateLimited,
}

/// How a single dispatch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    /// `retry_in` is `None` once automatic resends are exhausted.
    RateLimited { retry_in: Option<Duration> },
    Failed(ErrorClassification),
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryContext {
    pub retry_count: u32,
    pub last_message: Option<String>,
    pub is_rate_limited: bool,
}

/// Backoff for automatic resends after a rate-limit answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResendPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_auto_retries: u32,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_auto_retries: 3,
        }
    }
}

impl ResendPolicy {
    /// `min(base * 2^retry_count, cap)` stretched by `jitter` (a fraction in `[0, 0.3)`).
    pub fn delay(&self, retry_count: u32, jitter: f64) -> Duration {
        let backoff = self
            .base
            .checked_mul(2u32.saturating_pow(retry_count))
            .unwrap_or(self.cap)
            .min(self.cap);
        backoff.mul_f64(1.0 + jitter)
    }

    fn jittered_delay(&self, retry_count: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..0.3);
        self.delay(retry_count, jitter)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Message is empty")]
    Empty,

    #[error("A message is already being sent")]
    Busy,

    #[error("There is no message to retry")]
    NothingToRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    ResendDue { generation: u64 },
}

struct ScheduledResend {
    generation: u64,
    cancel: CancellationToken,
}

/// What the UI draws.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerView {
    pub conversation: Vec<ChatMessage>,
    pub phase: Phase,
    pub error: Option<String>,
    pub has_pending: bool,
    pub retry: RetryContext,
}

impl ControllerView {
    pub fn can_submit(&self, status: ServerStatus) -> bool {
        self.phase == Phase::Idle && status != ServerStatus::Offline
    }
}

/// Drives one conversation against the gateway. At most one chat request is
/// in flight; rate-limit answers schedule automatic resends.
pub struct ChatController {
    gateway: GatewayClient,
    prober: Arc<LivenessProber>,
    policy: ResendPolicy,
    conversation: Vec<ChatMessage>,
    phase: Phase,
    retry: RetryContext,
    pending: Option<String>,
    error: Option<String>,
    scheduled: Option<ScheduledResend>,
    generation: u64,
    events: mpsc::UnboundedSender<ControllerEvent>,
    view: watch::Sender<ControllerView>,
}

impl ChatController {
    pub fn new(
        gateway: GatewayClient,
        prober: Arc<LivenessProber>,
        policy: ResendPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            gateway,
            prober,
            policy,
            conversation: Vec::new(),
            phase: Phase::Idle,
            retry: RetryContext::default(),
            pending: None,
            error: None,
            scheduled: None,
            generation: 0,
            events,
            view: watch::Sender::new(ControllerView {
                conversation: Vec::new(),
                phase: Phase::Idle,
                error: None,
                has_pending: false,
                retry: RetryContext::default(),
            }),
        };
        (controller, events_rx)
    }

    pub fn conversation(&self) -> &[ChatMessage] {
        &self.conversation
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn retry_context(&self) -> &RetryContext {
        &self.retry
    }

    pub fn server_status(&self) -> ServerStatus {
        self.prober.status()
    }

    pub fn can_submit(&self) -> bool {
        self.phase == Phase::Idle && self.server_status() != ServerStatus::Offline
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ControllerView> {
        self.view.subscribe()
    }

    pub async fn submit(&mut self, text: &str) -> Result<Outcome, SubmitError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SubmitError::Empty);
        }
        if self.phase == Phase::Sending {
            return Err(SubmitError::Busy);
        }

        self.cancel_scheduled();
        self.conversation.push(ChatMessage::user(text));
        self.pending = Some(text.to_string());
        self.retry = RetryContext::default();
        Ok(self.dispatch().await)
    }

    /// Resends the pending message without appending it again.
    pub async fn retry(&mut self) -> Result<Outcome, SubmitError> {
        if self.phase == Phase::Sending {
            return Err(SubmitError::Busy);
        }
        if self.pending.is_none() {
            return Err(SubmitError::NothingToRetry);
        }

        info!("Manual retry requested");
        self.cancel_scheduled();
        self.retry = RetryContext::default();
        self.error = None;
        Ok(self.dispatch().await)
    }

    pub fn clear(&mut self) {
        self.cancel_scheduled();
        self.conversation.clear();
        self.pending = None;
        self.error = None;
        self.retry = RetryContext::default();
        self.phase = Phase::Idle;
        self.publish();
    }

    /// Runs a resend whose timer fired. Returns `None` for resends that were
    /// cancelled or superseded after the timer went off.
    pub async fn handle_event(&mut self, event: ControllerEvent) -> Option<Outcome> {
        match event {
            ControllerEvent::ResendDue { generation } => {
                if self.scheduled.as_ref().map(|s| s.generation) != Some(generation) {
                    debug!(generation, "Ignoring stale resend");
                    return None;
                }
                self.scheduled = None;
                info!(attempt = self.retry.retry_count, "Resending after rate limit");
                Some(self.dispatch().await)
            }
        }
    }

    async fn dispatch(&mut self) -> Outcome {
        let Some(message) = self.pending.clone() else {
            return Outcome::Failed(ErrorClassification::Generic {
                message: "Nothing to send".to_string(),
            });
        };

        if self.prober.status() != ServerStatus::Online {
            self.prober.probe().await;
            if self.prober.status() != ServerStatus::Online {
                warn!("Server offline; not sending");
                self.conversation.push(ChatMessage::assistant(OFFLINE_REPLY));
                self.phase = Phase::Idle;
                self.publish();
                return Outcome::Offline;
            }
        }

        self.phase = Phase::Sending;
        self.error = None;
        self.retry.last_message = Some(message.clone());
        self.publish();

        let outcome = match self.gateway.send_chat(&message).await {
            Ok(reply) => {
                self.conversation.push(ChatMessage::assistant(reply));
                self.retry = RetryContext::default();
                self.pending = None;
                self.phase = Phase::Idle;
                Outcome::Success
            }
            Err(ErrorClassification::RateLimit) => self.on_rate_limited(),
            Err(failure) => {
                let text = user_facing(&failure);
                if failure == ErrorClassification::NetworkError {
                    self.prober.mark_offline();
                }
                self.conversation
                    .push(ChatMessage::assistant(format!("I'm sorry, there was an error: {text}")));
                self.error = Some(text);
                self.phase = Phase::Idle;
                Outcome::Failed(failure)
            }
        };

        self.publish();
        outcome
    }

    fn on_rate_limited(&mut self) -> Outcome {
        self.retry.is_rate_limited = true;
        self.retry.retry_count += 1;

        if self.retry.retry_count >= self.policy.max_auto_retries {
            warn!(attempts = self.retry.retry_count, "Giving up on automatic resends");
            self.error = Some(MAX_RETRIES_ERROR.to_string());
            self.phase = Phase::Idle;
            return Outcome::RateLimited { retry_in: None };
        }

        let delay = self.policy.jittered_delay(self.retry.retry_count);
        info!(
            attempt = self.retry.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Rate limited; scheduling resend"
        );
        self.schedule_resend(delay);
        self.phase = Phase::RateLimited;
        Outcome::RateLimited {
            retry_in: Some(delay),
        }
    }

    fn schedule_resend(&mut self, delay: Duration) {
        self.cancel_scheduled();
        self.generation += 1;

        let generation = self.generation;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(ControllerEvent::ResendDue { generation });
                }
            }
        });

        self.scheduled = Some(ScheduledResend { generation, cancel });
    }

    fn cancel_scheduled(&mut self) {
        if let Some(scheduled) = self.scheduled.take() {
            debug!(generation = scheduled.generation, "Cancelling scheduled resend");
            scheduled.cancel.cancel();
        }
        if self.phase == Phase::RateLimited {
            self.phase = Phase::Idle;
        }
    }

    fn log_state(&self) {
        debug!(
            phase = ?self.phase(),
            messages = self.conversation().len(),
            pending = self.pending().is_some(),
            last_sent_chars = self.retry.last_message.as_ref().map(|m| m.len()),
            retries = self.retry_context().retry_count,
            rate_limited = self.retry.is_rate_limited,
            error = self.error(),
            can_submit = self.can_submit(),
            "Controller state"
        );
    }

    fn publish(&self) {
        self.view.send_replace(ControllerView {
            conversation: self.conversation.clone(),
            phase: self.phase,
            error: self.error.clone(),
            has_pending: self.pending.is_some(),
            retry: self.retry.clone(),
        });
    }
}

fn user_facing(failure: &ErrorClassification) -> String {
    match failure {
        ErrorClassification::NetworkError => {
            "Network error. The server appears to be down or unreachable. Please try again later."
                .to_string()
        }
        ErrorClassification::Timeout => {
            "The request timed out. The server might be overloaded or unreachable.".to_string()
        }
        ErrorClassification::AuthError => {
            "The tax assistant could not authenticate with the AI service. Please contact support."
                .to_string()
        }
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    Submit(String),
    Retry,
    Clear,
    Probe,
}

/// Runs the controller as its own task, fed by UI commands and its own
/// resend timers. Stops when the command channel closes or `cancel` fires.
pub fn spawn(
    mut controller: ChatController,
    mut events: mpsc::UnboundedReceiver<ControllerEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = events.recv() => {
                    if let Some(outcome) = controller.handle_event(event).await {
                        report(&outcome);
                    }
                    controller.log_state();
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let result = match command {
                        Command::Submit(text) => controller.submit(&text).await.map(Some),
                        Command::Retry => controller.retry().await.map(Some),
                        Command::Clear => {
                            controller.clear();
                            Ok(None)
                        }
                        Command::Probe => {
                            controller.prober.probe().await;
                            Ok(None)
                        }
                    };
                    match result {
                        Ok(Some(outcome)) => report(&outcome),
                        Ok(None) => {}
                        Err(e) => debug!(error = %e, "Command rejected"),
                    }
                    controller.log_state();
                }
            }
        }
        controller.cancel_scheduled();
        debug!("Chat controller stopped");
    })
}

fn report(outcome: &Outcome) {
    match outcome {
        Outcome::Success => debug!("Reply received"),
        Outcome::RateLimited { retry_in: Some(delay) } => {
            debug!(delay_ms = delay.as_millis() as u64, "Resend scheduled")
        }
        Outcome::RateLimited { retry_in: None } => debug!("Automatic resends exhausted"),
        Outcome::Failed(failure) => debug!(%failure, "Send failed"),
        Outcome::Offline => debug!("Server offline"),
    }
}
