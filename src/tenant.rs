use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::events::BroadcastHub;
use crate::limits::*;
use crate::model::Ms;
use crate::payment::{spawn_outcome_pump, PaymentBridge, SandboxMode, SandboxProcessor};
use crate::reaper;

/// One tenant of the server: a rental agency with its own engine, WAL,
/// event hub, payment bridge, and background tasks.
pub struct Agency {
    pub engine: Arc<Engine>,
    pub events: Arc<BroadcastHub>,
    pub payments: Arc<PaymentBridge>,
}

/// Manages per-agency state, lazily created. Agency = database name from the
/// pgwire connection.
pub struct AgencyManager {
    agencies: DashMap<String, Arc<Agency>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    /// Pending reservations older than this are auto-cancelled; `None` means
    /// they never expire.
    pending_ttl: Option<Ms>,
    currency: String,
    sandbox_mode: SandboxMode,
}

impl AgencyManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        pending_ttl: Option<Ms>,
        currency: String,
        sandbox_mode: SandboxMode,
    ) -> Self {
        Self {
            agencies: DashMap::new(),
            data_dir,
            compact_threshold,
            pending_ttl,
            currency,
            sandbox_mode,
        }
    }

    /// Get or lazily create the state for the given agency.
    pub fn get_or_create(&self, agency: &str) -> std::io::Result<Arc<Agency>> {
        if let Some(existing) = self.agencies.get(agency) {
            return Ok(existing.value().clone());
        }
        if agency.len() > MAX_AGENCY_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "agency name too long",
            ));
        }
        if self.agencies.len() >= MAX_AGENCIES {
            return Err(std::io::Error::other("too many agencies"));
        }

        // Sanitize agency name to prevent path traversal
        let safe_name: String = agency
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty agency name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let events = Arc::new(BroadcastHub::new());
        let engine = Arc::new(Engine::new(wal_path, events.clone())?);

        // Each agency gets its own processor account; the sandbox delivers
        // verdicts over a channel like a webhook endpoint would.
        let (processor, outcomes) = SandboxProcessor::new(self.sandbox_mode);
        let payments = Arc::new(PaymentBridge::new(
            engine.clone(),
            Arc::new(processor),
            self.currency.clone(),
        ));
        spawn_outcome_pump(payments.clone(), outcomes);

        if let Some(ttl) = self.pending_ttl {
            let expirer_engine = engine.clone();
            tokio::spawn(async move {
                reaper::run_expirer(expirer_engine, ttl).await;
            });
        }
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });

        let state = Arc::new(Agency {
            engine,
            events,
            payments,
        });
        self.agencies.insert(agency.to_string(), state.clone());
        metrics::gauge!(crate::observability::AGENCIES_ACTIVE).set(self.agencies.len() as f64);
        Ok(state)
    }
}
