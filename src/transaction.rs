//! Transaction identity, events and the handles callers hold.
//!
//! Each transaction runs as its own task (see `uac` and `uas`) and is driven
//! only through its event queue, so timers, network input and caller actions
//! for one transaction are applied one at a time.

use crate::dialog::DialogHandle;
use crate::error::{Result, SipError};
use crate::subscription::SubscriptionHandle;
use crate::timer::Expired;
use crate::{MessageHeaders, SipMethod, SipRequest, SipResponse, SipUri};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// (top Via branch, Via sent-by, CSeq method).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub sent_by: String,
    pub method: SipMethod,
}

impl TransactionKey {
    pub fn new(branch: &str, sent_by: &str, method: SipMethod) -> Self {
        Self {
            branch: branch.to_string(),
            sent_by: sent_by.to_ascii_lowercase(),
            method,
        }
    }

    /// Key of a request; ACK and CANCEL keep their own method here.
    pub fn from_request(request: &SipRequest) -> Option<Self> {
        let via = request.top_via()?;
        Some(Self::new(via.branch()?, &via.sent_by(), request.method.clone()))
    }

    /// Key of a response, taken from the Via this agent inserted.
    pub fn from_response(response: &SipResponse) -> Option<Self> {
        let via = response.top_via()?;
        let cseq = response.cseq()?;
        Some(Self::new(via.branch()?, &via.sent_by(), cseq.method))
    }

    pub fn with_method(&self, method: SipMethod) -> Self {
        Self {
            method,
            ..self.clone()
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}@{}", self.method, self.branch, self.sent_by)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Init,
    Calling,
    Trying,
    Proceeding,
    Completed,
    Accepted,
    Confirmed,
    Terminated,
}

/// RFC 3261 §17 timers plus Timer L and M from RFC 6026.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
}

/// A response the UAS sends. Dialog-forming responses get a Contact from
/// `contact`, else the agent's local contact.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status_code: u16,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub contact: Option<SipUri>,
    pub content_type: Option<String>,
    pub body: Option<Bytes>,
}

impl Reply {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            headers: Vec::new(),
            contact: None,
            content_type: None,
            body: None,
        }
    }

    pub fn reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn contact(mut self, contact: SipUri) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn body(mut self, content_type: &str, body: Bytes) -> Self {
        self.content_type = Some(content_type.to_string());
        self.body = Some(body);
        self
    }
}

/// Reported to the sender of a request.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Provisional {
        response: SipResponse,
        dialog: Option<DialogHandle>,
        /// `Require: 100rel` with an RSeq; the caller should PRACK
        reliable: bool,
    },
    /// A locally generated final (408 timeout, 503 transport failure) has no response.
    Final {
        status_code: u16,
        response: Option<SipResponse>,
        dialog: Option<DialogHandle>,
    },
}

impl ClientEvent {
    pub fn status_code(&self) -> u16 {
        match self {
            ClientEvent::Provisional { response, .. } => response.status_code,
            ClientEvent::Final { status_code, .. } => *status_code,
        }
    }

    pub fn dialog(&self) -> Option<DialogHandle> {
        match self {
            ClientEvent::Provisional { dialog, .. } | ClientEvent::Final { dialog, .. } => *dialog,
        }
    }
}

/// Inbox of a transaction task.
#[derive(Debug)]
pub(crate) enum TransactionEvent {
    /// Request retransmission (UAS)
    Request(SipRequest),
    /// Response received (UAC)
    Response(SipResponse),
    /// Caller reply (UAS)
    Reply(Reply),
    /// The request handler returned (UAS)
    HandlerDone,
    /// ACK matched to this INVITE (UAS)
    Ack(SipRequest),
    /// CANCEL matched to this INVITE (UAS)
    CancelRequest(SipRequest),
    /// Caller asks to cancel (UAC INVITE)
    Cancel,
    /// Caller ACK for a 2xx (UAC INVITE)
    SendAck {
        dialog: DialogHandle,
        body: Option<(String, Bytes)>,
    },
    Timer(Expired<TimerKind>),
    Terminate,
}

impl From<Expired<TimerKind>> for TransactionEvent {
    fn from(expired: Expired<TimerKind>) -> Self {
        TransactionEvent::Timer(expired)
    }
}

fn enqueue(queue: &UnboundedSender<TransactionEvent>, event: TransactionEvent) -> Result<()> {
    queue
        .send(event)
        .map_err(|_| SipError::TransactionTerminated)
}

/// Caller handle to an outgoing request's transaction.
#[derive(Clone)]
pub struct ClientTransaction {
    pub(crate) key: TransactionKey,
    pub(crate) request: Arc<SipRequest>,
    pub(crate) queue: UnboundedSender<TransactionEvent>,
    pub(crate) history: Arc<Mutex<Vec<TransactionState>>>,
}

impl ClientTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// The request as sent, including the Via this agent added.
    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    /// CANCEL an INVITE. Held until the first provisional; a no-op after a final.
    pub fn cancel(&self) -> Result<()> {
        if self.key.method != SipMethod::Invite {
            return Err(SipError::InvalidOperation(
                "only INVITE transactions can be cancelled".to_string(),
            ));
        }
        enqueue(&self.queue, TransactionEvent::Cancel)
    }

    /// Send the ACK for a 2xx that created `dialog`.
    pub fn ack(&self, dialog: DialogHandle, body: Option<(&str, Bytes)>) -> Result<()> {
        if self.key.method != SipMethod::Invite {
            return Err(SipError::InvalidOperation(
                "ACK belongs to INVITE transactions".to_string(),
            ));
        }
        enqueue(
            &self.queue,
            TransactionEvent::SendAck {
                dialog,
                body: body.map(|(content_type, body)| (content_type.to_string(), body)),
            },
        )
    }

    /// Discard the transaction now, stopping its timers.
    pub fn terminate(&self) -> Result<()> {
        enqueue(&self.queue, TransactionEvent::Terminate)
    }

    /// States visited so far, in order.
    pub fn history(&self) -> Vec<TransactionState> {
        self.history.lock().clone()
    }

    pub fn state(&self) -> TransactionState {
        self.history
            .lock()
            .last()
            .copied()
            .unwrap_or(TransactionState::Init)
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_closed()
    }
}

/// Caller handle to a received request's transaction.
#[derive(Clone)]
pub struct ServerTransaction {
    pub(crate) key: TransactionKey,
    pub(crate) request: Arc<SipRequest>,
    pub(crate) dialog: Option<DialogHandle>,
    pub(crate) subscription: Option<SubscriptionHandle>,
    pub(crate) queue: UnboundedSender<TransactionEvent>,
}

impl ServerTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    pub fn dialog(&self) -> Option<DialogHandle> {
        self.dialog
    }

    pub fn subscription(&self) -> Option<SubscriptionHandle> {
        self.subscription
    }

    /// Reply with a status code and an optional `application/sdp` body.
    pub fn reply(&self, status_code: u16, body: Option<Bytes>) -> Result<()> {
        let reply = match body {
            Some(body) => Reply::new(status_code).body("application/sdp", body),
            None => Reply::new(status_code),
        };
        self.respond(reply)
    }

    pub fn respond(&self, reply: Reply) -> Result<()> {
        if !(100..700).contains(&reply.status_code) {
            return Err(SipError::InvalidOperation(format!(
                "invalid status code {}",
                reply.status_code
            )));
        }
        enqueue(&self.queue, TransactionEvent::Reply(reply))
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_closed()
    }
}
