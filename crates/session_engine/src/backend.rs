use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::participant::{CharacterId, ParticipantId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    FetchLoadout {
        participant: ParticipantId,
        character: CharacterId,
    },
    UpdateLoadout {
        participant: ParticipantId,
        character: CharacterId,
    },
}

impl BackendCall {
    pub fn name(&self) -> &'static str {
        match self {
            BackendCall::FetchLoadout { .. } => "fetch_loadout",
            BackendCall::UpdateLoadout { .. } => "update_loadout",
        }
    }

    pub fn participant(&self) -> ParticipantId {
        match self {
            BackendCall::FetchLoadout { participant, .. }
            | BackendCall::UpdateLoadout { participant, .. } => *participant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendPoll {
    Pending,
    Done,
    Failed(String),
}

/// External account/inventory service. Calls are started and then polled;
/// the session never waits on one.
pub trait AccountBackend {
    fn begin(&mut self, call: &BackendCall) -> TicketId;
    fn poll(&mut self, ticket: TicketId) -> BackendPoll;
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BackendReport {
    pub completed: Vec<BackendCall>,
    pub dropped: Vec<(BackendCall, String)>,
}

#[derive(Debug)]
struct InFlightCall {
    call: BackendCall,
    ticket: TicketId,
    retries: u32,
}

#[derive(Debug)]
pub struct BackendCalls {
    retry_limit: u32,
    in_flight: Vec<InFlightCall>,
}

impl BackendCalls {
    pub fn new(retry_limit: u32) -> Self {
        Self {
            retry_limit,
            in_flight: Vec::new(),
        }
    }

    pub fn issue<B: AccountBackend + ?Sized>(&mut self, backend: &mut B, call: BackendCall) {
        let ticket = backend.begin(&call);
        debug!(call = call.name(), participant = %call.participant(), "backend_call_started");
        self.in_flight.push(InFlightCall {
            call,
            ticket,
            retries: 0,
        });
    }

    pub fn poll<B: AccountBackend + ?Sized>(&mut self, backend: &mut B) -> BackendReport {
        let mut report = BackendReport::default();
        let mut still_pending = Vec::with_capacity(self.in_flight.len());
        for mut entry in self.in_flight.drain(..) {
            match backend.poll(entry.ticket) {
                BackendPoll::Pending => still_pending.push(entry),
                BackendPoll::Done => report.completed.push(entry.call),
                BackendPoll::Failed(reason) if entry.retries < self.retry_limit => {
                    entry.retries += 1;
                    warn!(
                        call = entry.call.name(),
                        participant = %entry.call.participant(),
                        attempt = entry.retries,
                        reason = reason.as_str(),
                        "backend_call_retry"
                    );
                    entry.ticket = backend.begin(&entry.call);
                    still_pending.push(entry);
                }
                BackendPoll::Failed(reason) => {
                    error!(
                        call = entry.call.name(),
                        participant = %entry.call.participant(),
                        reason = reason.as_str(),
                        "backend_call_dropped"
                    );
                    report.dropped.push((entry.call, reason));
                }
            }
        }
        self.in_flight = still_pending;
        report
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

/// Backend that answers every call on its first poll. Failures can be
/// scripted for the next `n` calls.
#[derive(Debug, Default)]
pub struct InstantBackend {
    next_ticket: u64,
    failures_remaining: u32,
    outcomes: HashMap<TicketId, BackendPoll>,
    calls: Vec<BackendCall>,
}

impl InstantBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&mut self, count: u32) {
        self.failures_remaining = count;
    }

    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }
}

impl AccountBackend for InstantBackend {
    fn begin(&mut self, call: &BackendCall) -> TicketId {
        self.next_ticket += 1;
        let ticket = TicketId(self.next_ticket);
        let outcome = if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            BackendPoll::Failed("scripted failure".to_string())
        } else {
            BackendPoll::Done
        };
        self.outcomes.insert(ticket, outcome);
        self.calls.push(call.clone());
        ticket
    }

    fn poll(&mut self, ticket: TicketId) -> BackendPoll {
        self.outcomes
            .remove(&ticket)
            .unwrap_or_else(|| BackendPoll::Failed(format!("unknown ticket {}", ticket.0)))
    }
}
