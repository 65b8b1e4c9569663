//! Payment Bridge: the adapter between the booking engine and an external
//! payment processor. The processor is opaque behind [`PaymentProcessor`];
//! its asynchronous outcome callbacks are the only thing that moves a
//! reservation from pending to confirmed.
//!
//! Payment records here are shadow state — the processor is the system of
//! record for money, so they are not written to the WAL.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{Ms, ReservationStatus};

#[derive(Debug)]
pub enum PaymentError {
    ReservationNotFound(Ulid),
    CheckoutOnCancelled(Ulid),
    AlreadyPaid(Ulid),
    UnknownIntent(String),
    Processor(String),
    Engine(EngineError),
}

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            PaymentError::CheckoutOnCancelled(id) => {
                write!(f, "cannot pay for cancelled reservation: {id}")
            }
            PaymentError::AlreadyPaid(id) => write!(f, "reservation already paid: {id}"),
            PaymentError::UnknownIntent(r) => write!(f, "no payment with intent ref: {r}"),
            PaymentError::Processor(e) => write!(f, "payment processor error: {e}"),
            PaymentError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PaymentError {}

/// Handle returned by the processor when a charge is initiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub intent_ref: String,
    /// Client-side token for finishing the charge in the processor's UI.
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

/// At most one of these exists per reservation.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub intent_ref: String,
    pub reservation_id: Ulid,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub receipt_url: Option<String>,
    pub created_at: Ms,
}

/// Asynchronous verdict from the processor, delivered at least once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded { receipt_url: Option<String> },
    Failed,
}

/// The outbound half of the bridge. Implementations wrap a real processor
/// SDK; the engine never sees past this trait.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_intent(
        &self,
        reservation_id: Ulid,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentIntent, PaymentError>;
}

pub struct PaymentBridge {
    engine: Arc<Engine>,
    processor: Arc<dyn PaymentProcessor>,
    currency: String,
    records: DashMap<Ulid, PaymentRecord>,
    intent_index: DashMap<String, Ulid>,
}

impl PaymentBridge {
    pub fn new(engine: Arc<Engine>, processor: Arc<dyn PaymentProcessor>, currency: String) -> Self {
        Self {
            engine,
            processor,
            currency,
            records: DashMap::new(),
            intent_index: DashMap::new(),
        }
    }

    /// Initiate payment for a pending reservation. Re-initiating over a
    /// pending/failed payment replaces it (retry); a completed payment or a
    /// non-pending reservation is refused. A processor failure leaves the
    /// reservation pending with no handle — callable again.
    pub async fn start_checkout(&self, reservation_id: Ulid) -> Result<PaymentRecord, PaymentError> {
        let resv = self
            .engine
            .get_reservation(&reservation_id)
            .await
            .map_err(|e| match e {
                EngineError::ReservationNotFound(id) => PaymentError::ReservationNotFound(id),
                other => PaymentError::Engine(other),
            })?;
        match resv.status {
            ReservationStatus::Cancelled => {
                return Err(PaymentError::CheckoutOnCancelled(reservation_id));
            }
            ReservationStatus::Confirmed | ReservationStatus::Completed => {
                return Err(PaymentError::AlreadyPaid(reservation_id));
            }
            ReservationStatus::Pending => {}
        }
        if let Some(existing) = self.records.get(&reservation_id)
            && existing.status == PaymentStatus::Completed {
                return Err(PaymentError::AlreadyPaid(reservation_id));
            }

        let intent = self
            .processor
            .create_intent(reservation_id, resv.total_price, &self.currency)
            .await?;

        // Replace any superseded record so exactly one intent ref routes here.
        if let Some(old) = self.records.get(&reservation_id) {
            self.intent_index.remove(&old.intent_ref);
        }
        let record = PaymentRecord {
            intent_ref: intent.intent_ref.clone(),
            reservation_id,
            amount: resv.total_price,
            currency: self.currency.clone(),
            status: PaymentStatus::Pending,
            receipt_url: None,
            created_at: now_ms(),
        };
        self.intent_index.insert(intent.intent_ref, reservation_id);
        self.records.insert(reservation_id, record.clone());
        Ok(record)
    }

    /// Processor callback entry point. Safe under duplicate delivery: the
    /// engine-side transitions are idempotent and the record update is a
    /// plain overwrite with the same value.
    pub async fn handle_outcome(
        &self,
        intent_ref: &str,
        outcome: PaymentOutcome,
    ) -> Result<(), PaymentError> {
        let reservation_id = *self
            .intent_index
            .get(intent_ref)
            .ok_or_else(|| PaymentError::UnknownIntent(intent_ref.to_string()))?;

        match outcome {
            PaymentOutcome::Succeeded { receipt_url } => {
                self.engine
                    .confirm_reservation(reservation_id)
                    .await
                    .map_err(PaymentError::Engine)?;
                if let Some(mut rec) = self.records.get_mut(&reservation_id) {
                    rec.status = PaymentStatus::Completed;
                    rec.receipt_url = receipt_url;
                }
                metrics::counter!(crate::observability::PAYMENT_OUTCOMES_TOTAL, "outcome" => "succeeded")
                    .increment(1);
            }
            PaymentOutcome::Failed => {
                self.engine
                    .mark_payment_failed(reservation_id)
                    .await
                    .map_err(PaymentError::Engine)?;
                if let Some(mut rec) = self.records.get_mut(&reservation_id)
                    && rec.status == PaymentStatus::Pending {
                        rec.status = PaymentStatus::Failed;
                    }
                metrics::counter!(crate::observability::PAYMENT_OUTCOMES_TOTAL, "outcome" => "failed")
                    .increment(1);
            }
        }
        Ok(())
    }

    pub fn record_for(&self, reservation_id: &Ulid) -> Option<PaymentRecord> {
        self.records.get(reservation_id).map(|r| r.clone())
    }
}

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

// ── Sandbox processor ────────────────────────────────────────────

/// What the sandbox does with every charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    Approve,
    Decline,
}

/// In-process stand-in for a real processor: acknowledges the intent
/// immediately and delivers the verdict asynchronously over a channel, like
/// a webhook would arrive. Lets the full booking → payment → confirmation
/// loop run in dev and integration tests.
pub struct SandboxProcessor {
    mode: SandboxMode,
    outcomes: mpsc::UnboundedSender<(String, PaymentOutcome)>,
}

impl SandboxProcessor {
    pub fn new(mode: SandboxMode) -> (Self, mpsc::UnboundedReceiver<(String, PaymentOutcome)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { mode, outcomes: tx }, rx)
    }
}

#[async_trait]
impl PaymentProcessor for SandboxProcessor {
    async fn create_intent(
        &self,
        _reservation_id: Ulid,
        _amount: Decimal,
        _currency: &str,
    ) -> Result<PaymentIntent, PaymentError> {
        let intent_ref = format!("sbx_{}", Ulid::new());
        let outcome = match self.mode {
            SandboxMode::Approve => PaymentOutcome::Succeeded {
                receipt_url: Some(format!("https://sandbox.invalid/receipts/{intent_ref}")),
            },
            SandboxMode::Decline => PaymentOutcome::Failed,
        };
        self.outcomes
            .send((intent_ref.clone(), outcome))
            .map_err(|_| PaymentError::Processor("sandbox outcome channel closed".into()))?;
        Ok(PaymentIntent {
            intent_ref,
            client_secret: None,
        })
    }
}

/// Drain processor callbacks into the bridge. A verdict can arrive before
/// the checkout call has recorded its intent (webhooks race the API
/// response), so unknown refs are redelivered briefly. Other failures are
/// logged and dropped — a lost notification never corrupts the ledger, it
/// just leaves the reservation pending for a retry.
pub fn spawn_outcome_pump(
    bridge: Arc<PaymentBridge>,
    mut rx: mpsc::UnboundedReceiver<(String, PaymentOutcome)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((intent_ref, outcome)) = rx.recv().await {
            let mut attempts = 0;
            loop {
                match bridge.handle_outcome(&intent_ref, outcome.clone()).await {
                    Ok(()) => break,
                    Err(PaymentError::UnknownIntent(_)) if attempts < 20 => {
                        attempts += 1;
                        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                    }
                    Err(e) => {
                        tracing::warn!("payment outcome for {intent_ref} not applied: {e}");
                        break;
                    }
                }
            }
        }
    })
}
