//! Completion sync: the one authoritative call that tells the server of record a
//! session is finished, plus the delayed local clear that follows success.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::session::WorkoutSession;

pub const DEFAULT_CLEAR_DELAY: Duration = Duration::from_secs(3);

/// Server endpoint that marks a session complete. Calling it again for the same
/// id must be harmless.
pub trait CompletionEndpoint: Send + Sync {
    fn complete(&self, session_id: &str) -> Result<(), SyncError>;
}

/// `POST {base_url}/sessions/{id}/complete`. A 409 means the server already has it.
#[derive(Debug, Clone)]
pub struct HttpCompletionEndpoint {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpCompletionEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::blocking::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::blocking::Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, session_id: &str) -> String {
        format!("{}/sessions/{}/complete", self.base_url, session_id)
    }
}

impl CompletionEndpoint for HttpCompletionEndpoint {
    fn complete(&self, session_id: &str) -> Result<(), SyncError> {
        let response = self.client.post(self.url_for(session_id)).send()?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            Ok(())
        } else {
            Err(SyncError::Status(status.as_u16()))
        }
    }
}

#[derive(Debug)]
pub enum SyncEvent {
    Synced { session_id: String },
    Failed { session_id: String, error: SyncError },
    /// The celebration window has passed; the local snapshot can go.
    ClearDue { session_id: String },
}

#[derive(Debug)]
struct InFlight {
    session_id: String,
    rx: Receiver<Result<(), SyncError>>,
}

#[derive(Debug)]
struct PendingClear {
    session_id: String,
    due_at: DateTime<Utc>,
}

/// Drives completion calls on a worker thread and reports results through `poll`.
/// There is no automatic retry: after a failure the caller decides when to submit
/// again.
pub struct CompletionSync {
    endpoint: Arc<dyn CompletionEndpoint>,
    clear_delay: Duration,
    in_flight: Option<InFlight>,
    pending_clear: Option<PendingClear>,
}

impl CompletionSync {
    pub fn new(endpoint: Arc<dyn CompletionEndpoint>) -> Self {
        Self {
            endpoint,
            clear_delay: DEFAULT_CLEAR_DELAY,
            in_flight: None,
            pending_clear: None,
        }
    }

    pub fn with_clear_delay(mut self, clear_delay: Duration) -> Self {
        self.clear_delay = clear_delay;
        self
    }

    /// Start the completion call for a finished session. Submitting a session that
    /// is already in flight or already synced does not issue another call, and a
    /// different session is refused until the running call has reported.
    pub fn submit(&mut self, session: &WorkoutSession) -> Result<(), SyncError> {
        if !session.is_completed() {
            return Err(SyncError::NotCompleted(session.id.clone()));
        }
        if self.is_tracking(&session.id) {
            debug!(session_id = %session.id, "Completion already submitted");
            return Ok(());
        }
        if let Some(flight) = &self.in_flight {
            warn!(session_id = %session.id, in_flight = %flight.session_id, "Refusing completion while another is in flight");
            return Err(SyncError::Busy(flight.session_id.clone()));
        }

        let (tx, rx) = mpsc::channel();
        let endpoint = Arc::clone(&self.endpoint);
        let session_id = session.id.clone();
        std::thread::spawn(move || {
            let _ = tx.send(endpoint.complete(&session_id));
        });

        info!(session_id = %session.id, "Submitting session completion");
        self.in_flight = Some(InFlight {
            session_id: session.id.clone(),
            rx,
        });
        Ok(())
    }

    fn is_tracking(&self, session_id: &str) -> bool {
        self.in_flight
            .as_ref()
            .map(|f| f.session_id == session_id)
            .unwrap_or(false)
            || self
                .pending_clear
                .as_ref()
                .map(|p| p.session_id == session_id)
                .unwrap_or(false)
    }

    /// Check for a finished call or an expired clear delay. Never blocks.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<SyncEvent> {
        if let Some(flight) = self.in_flight.take() {
            let result = match flight.rx.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => {
                    self.in_flight = Some(flight);
                    return None;
                }
                Err(TryRecvError::Disconnected) => Err(SyncError::Disconnected),
            };

            return Some(match result {
                Ok(()) => {
                    let delay = chrono::Duration::from_std(self.clear_delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    info!(session_id = %flight.session_id, "Session completion synced");
                    if let Some(previous) = &self.pending_clear {
                        warn!(session_id = %previous.session_id, "Dropping pending clear for an earlier session");
                    }
                    self.pending_clear = Some(PendingClear {
                        session_id: flight.session_id.clone(),
                        due_at: now + delay,
                    });
                    SyncEvent::Synced {
                        session_id: flight.session_id,
                    }
                }
                Err(error) => {
                    warn!(session_id = %flight.session_id, error = %error, "Session completion failed; keeping local copy");
                    SyncEvent::Failed {
                        session_id: flight.session_id,
                        error,
                    }
                }
            });
        }

        if self
            .pending_clear
            .as_ref()
            .map(|p| now >= p.due_at)
            .unwrap_or(false)
        {
            return self.pending_clear.take().map(|p| SyncEvent::ClearDue {
                session_id: p.session_id,
            });
        }

        None
    }

    /// Nothing in flight and no clear waiting.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending_clear.is_none()
    }
}

impl std::fmt::Debug for CompletionSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSync")
            .field("clear_delay", &self.clear_delay)
            .field("in_flight", &self.in_flight.as_ref().map(|i| &i.session_id))
            .field("pending_clear", &self.pending_clear)
            .finish()
    }
}
