//! The agent: owns the dialog and subscription stores plus the transaction
//! tables, and routes every inbound message to the transaction it belongs to.

use crate::dialog::{Dialog, DialogHandle, DialogId, DialogStore, SessionSlot};
use crate::error::{Result, SipError};
use crate::headers::{SubscriptionStateHeader, Via};
use crate::subscription::{
    Subscription, SubscriptionHandle, SubscriptionId, SubscriptionRole, SubscriptionStore,
};
use crate::timer::TimerConfig;
use crate::transaction::{
    ClientEvent, ClientTransaction, Reply, ServerTransaction, TransactionEvent, TransactionKey,
    TransactionState,
};
use crate::transport::Transport;
use crate::uac::ClientActor;
use crate::uas::{ServerActor, ServerSetup};
use crate::utils::{build_response_from_request, generate_branch, generate_call_id, generate_tag, reason_phrase};
use crate::{MessageHeaders, SipMessage, SipMethod, SipParseError, SipRequest, SipResponse, SipUri};
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub timers: TimerConfig,

    /// Client plus server transactions alive at once
    pub max_transactions: usize,

    /// Contact placed in dialog-forming requests and responses
    pub local_contact: Option<String>,

    /// User-Agent / Server header value
    pub user_agent: String,

    /// Methods advertised in Allow
    pub allow: Vec<String>,

    /// Subscription duration when neither side names one
    pub default_subscription_expires: u32,

    /// How often lapsed subscriptions are swept
    pub housekeeping_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timers: TimerConfig::default(),
            max_transactions: 10_000,
            local_contact: None,
            user_agent: concat!("sip-agent-rs/", env!("CARGO_PKG_VERSION")).to_string(),
            allow: [
                "INVITE", "ACK", "CANCEL", "BYE", "OPTIONS", "UPDATE", "INFO", "PRACK",
                "SUBSCRIBE", "NOTIFY", "REFER", "MESSAGE",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
            default_subscription_expires: 3600,
            housekeeping_interval_ms: 1_000,
        }
    }
}

/// Per-method request callbacks. Every method has a default, so an
/// implementation only overrides what it serves. Handlers run with no agent
/// lock held and may call back into the agent.
pub trait RequestHandler: Send + Sync {
    fn on_invite(&self, agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        reject_not_allowed(agent, request, tx);
    }

    /// ACK for a final response to `invite`. Called once per INVITE.
    fn on_ack(&self, _agent: &Agent, _ack: &SipRequest, _invite: &ServerTransaction) {}

    fn on_bye(&self, _agent: &Agent, _request: &SipRequest, tx: &ServerTransaction) {
        respond_or_warn(tx, Reply::new(200));
    }

    /// CANCEL for an INVITE that has no final response yet.
    fn on_cancel(&self, _agent: &Agent, _cancel: &SipRequest, invite: &ServerTransaction) {
        respond_or_warn(invite, Reply::new(487));
    }

    fn on_register(&self, agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        reject_not_allowed(agent, request, tx);
    }

    fn on_prack(&self, agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        reject_not_allowed(agent, request, tx);
    }

    fn on_update(&self, agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        reject_not_allowed(agent, request, tx);
    }

    fn on_info(&self, agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        reject_not_allowed(agent, request, tx);
    }

    fn on_refer(&self, agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        reject_not_allowed(agent, request, tx);
    }

    fn on_subscribe(&self, agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        reject_not_allowed(agent, request, tx);
    }

    /// Subscription-State is applied to the subscription after a 2xx.
    fn on_notify(&self, _agent: &Agent, _request: &SipRequest, tx: &ServerTransaction) {
        respond_or_warn(tx, Reply::new(200));
    }

    fn on_publish(&self, agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        reject_not_allowed(agent, request, tx);
    }

    fn on_message(&self, agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        reject_not_allowed(agent, request, tx);
    }

    fn on_options(&self, agent: &Agent, _request: &SipRequest, tx: &ServerTransaction) {
        respond_or_warn(tx, Reply::new(200).header("allow", agent.allow_header()));
    }

    fn on_other(&self, _agent: &Agent, _request: &SipRequest, tx: &ServerTransaction) {
        respond_or_warn(tx, Reply::new(501));
    }

    /// An active subscription lapsed without refresh and was removed.
    fn on_subscription_expired(&self, _agent: &Agent, _subscription: &Subscription) {}
}

pub(crate) fn respond_or_warn(tx: &ServerTransaction, reply: Reply) {
    if let Err(e) = tx.respond(reply) {
        warn!(key = %tx.key(), "Reply dropped: {}", e);
    }
}

fn reject_not_allowed(agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
    debug!(method = %request.method, "No handler for method, answering 405");
    respond_or_warn(tx, Reply::new(405).header("allow", agent.allow_header()));
}

/// Outbound SUBSCRIBE/REFER waiting for its 2xx; a NOTIFY may arrive first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PendingSubscribe {
    pub call_id: String,
    pub local_tag: String,
    pub event: String,
}

struct ServerEntry {
    queue: UnboundedSender<TransactionEvent>,
    local_tag: Option<String>,
    /// (dialog, CSeq) an INVITE's 2xx-ACK is matched by
    ack_index: Option<(DialogId, u32)>,
}

#[derive(Default)]
struct TransactionTable {
    clients: AHashMap<TransactionKey, UnboundedSender<TransactionEvent>>,
    servers: AHashMap<TransactionKey, ServerEntry>,
    invites_by_dialog: AHashMap<(DialogId, u32), TransactionKey>,
}

impl TransactionTable {
    fn len(&self) -> usize {
        self.clients.len() + self.servers.len()
    }
}

pub(crate) struct AgentInner {
    pub(crate) config: AgentConfig,
    pub(crate) local_contact: Option<SipUri>,
    pub(crate) handler: Arc<dyn RequestHandler>,
    pub(crate) dialogs: DialogStore,
    pub(crate) subscriptions: SubscriptionStore,
    table: Mutex<TransactionTable>,
    pending: Mutex<AHashMap<PendingSubscribe, u32>>,
}

impl AgentInner {
    pub(crate) fn timers(&self) -> &TimerConfig {
        &self.config.timers
    }

    pub(crate) fn remove_client(&self, key: &TransactionKey) {
        self.table.lock().clients.remove(key);
    }

    pub(crate) fn remove_server(&self, key: &TransactionKey) {
        let mut table = self.table.lock();
        if let Some(entry) = table.servers.remove(key) {
            if let Some(index) = entry.ack_index {
                table.invites_by_dialog.remove(&index);
            }
        }
    }

    pub(crate) fn remove_pending(&self, pending: &PendingSubscribe) {
        self.pending.lock().remove(pending);
    }

    fn pending_seq(&self, pending: &PendingSubscribe) -> Option<u32> {
        self.pending.lock().get(pending).copied()
    }

    fn server_queue(&self, key: &TransactionKey) -> Option<UnboundedSender<TransactionEvent>> {
        self.table.lock().servers.get(key).map(|entry| entry.queue.clone())
    }

    /// Register and spawn a client transaction for a request whose top Via
    /// is already in place.
    pub(crate) fn start_client(
        self: &Arc<Self>,
        request: SipRequest,
        transport: Arc<dyn Transport>,
    ) -> Result<(ClientTransaction, UnboundedReceiver<ClientEvent>)> {
        let key = TransactionKey::from_request(&request).ok_or_else(|| {
            SipError::Malformed(SipParseError::MissingRequiredHeader("via branch".to_string()))
        })?;
        let (queue, inbox) = mpsc::unbounded_channel();

        {
            let mut table = self.table.lock();
            if table.len() >= self.config.max_transactions {
                return Err(SipError::LimitExceeded(self.config.max_transactions));
            }
            if table.clients.contains_key(&key) {
                return Err(SipError::TransactionExists(key.to_string()));
            }
            table.clients.insert(key.clone(), queue.clone());
        }

        let pending = self.register_pending(&request);
        let initial = match request.method {
            SipMethod::Invite => TransactionState::Calling,
            _ => TransactionState::Trying,
        };
        let history = Arc::new(Mutex::new(vec![initial]));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = ClientTransaction {
            key: key.clone(),
            request: Arc::new(request.clone()),
            queue: queue.clone(),
            history: history.clone(),
        };

        ClientActor::spawn(
            self.clone(),
            key,
            request,
            transport,
            queue,
            inbox,
            events_tx,
            history,
            pending,
        );

        Ok((handle, events_rx))
    }

    fn register_pending(&self, request: &SipRequest) -> Option<PendingSubscribe> {
        let event = match request.method {
            SipMethod::Subscribe => request.event()?.event_type,
            SipMethod::Refer => "refer".to_string(),
            _ => return None,
        };
        if request.to_tag().is_some() {
            return None;
        }
        let pending = PendingSubscribe {
            call_id: request.call_id()?.to_string(),
            local_tag: request.from_tag()?,
            event,
        };
        let seq = request.cseq()?.seq;
        self.pending.lock().insert(pending.clone(), seq);
        Some(pending)
    }

    fn spawn_server(
        self: &Arc<Self>,
        key: TransactionKey,
        request: SipRequest,
        transport: Arc<dyn Transport>,
        admission: &Admission,
    ) -> Result<(ServerTransaction, UnboundedSender<TransactionEvent>)> {
        let (queue, inbox) = mpsc::unbounded_channel();
        let ack_index = match (&request.method, admission.dialog_id.as_ref(), request.cseq()) {
            (SipMethod::Invite, Some(id), Some(cseq)) => Some((id.clone(), cseq.seq)),
            _ => None,
        };

        {
            let mut table = self.table.lock();
            if table.len() >= self.config.max_transactions {
                return Err(SipError::LimitExceeded(self.config.max_transactions));
            }
            if table.servers.contains_key(&key) {
                return Err(SipError::TransactionExists(key.to_string()));
            }
            if let Some(index) = &ack_index {
                table.invites_by_dialog.insert(index.clone(), key.clone());
            }
            table.servers.insert(
                key.clone(),
                ServerEntry {
                    queue: queue.clone(),
                    local_tag: admission.local_tag.clone(),
                    ack_index,
                },
            );
        }

        let request = Arc::new(request);
        let handle = ServerTransaction {
            key: key.clone(),
            request: request.clone(),
            dialog: admission.dialog,
            subscription: admission.subscription,
            queue: queue.clone(),
        };

        ServerActor::spawn(
            self.clone(),
            ServerSetup {
                key,
                request,
                transport,
                local_tag: admission.local_tag.clone(),
                dialog: admission.dialog,
                subscription: admission.subscription,
                created_dialog: admission.created_dialog,
                created_subscription: admission.created_subscription,
            },
            queue.clone(),
            inbox,
        );

        Ok((handle, queue))
    }

    /// Undo the dialog state an admission created for a request that never
    /// got a transaction.
    fn rollback(&self, admission: &Admission) {
        if admission.created_subscription {
            if let Some(handle) = admission.subscription {
                self.subscriptions.remove(handle, &self.dialogs);
            }
        }
        if admission.created_dialog {
            if let Some(handle) = admission.dialog {
                self.dialogs.remove(handle);
            }
        }
    }

    fn route_response(&self, response: SipResponse) {
        let Some(key) = TransactionKey::from_response(&response) else {
            debug!("Discarding response without Via branch or CSeq");
            return;
        };
        let queue = self.table.lock().clients.get(&key).cloned();
        match queue {
            Some(queue) => {
                if queue.send(TransactionEvent::Response(response)).is_err() {
                    debug!(%key, "Client transaction already gone");
                }
            }
            None => debug!(%key, status = response.status_code, "No matching client transaction"),
        }
    }

    fn route_ack(&self, key: &TransactionKey, ack: SipRequest) {
        let queue = {
            let table = self.table.lock();
            match table.servers.get(&key.with_method(SipMethod::Invite)) {
                // ACK for a non-2xx final reuses the INVITE branch
                Some(entry) => Some(entry.queue.clone()),
                // ACK for a 2xx is its own transaction; match it by dialog and CSeq
                None => DialogId::from_request_uas(&ack)
                    .zip(ack.cseq())
                    .and_then(|(id, cseq)| table.invites_by_dialog.get(&(id, cseq.seq)))
                    .and_then(|invite_key| table.servers.get(invite_key))
                    .map(|entry| entry.queue.clone()),
            }
        };

        match queue {
            Some(queue) => {
                let _ = queue.send(TransactionEvent::Ack(ack));
            }
            None => debug!(%key, "Discarding ACK without matching INVITE transaction"),
        }
    }
}

/// Dialog and subscription context decided before a server transaction exists.
#[derive(Default)]
struct Admission {
    dialog: Option<DialogHandle>,
    dialog_id: Option<DialogId>,
    subscription: Option<SubscriptionHandle>,
    local_tag: Option<String>,
    created_dialog: bool,
    created_subscription: bool,
    reject: Option<Reply>,
}

impl Admission {
    fn reject(mut self, reply: Reply) -> Self {
        self.reject = Some(reply);
        self
    }
}

/// SIP user agent core. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Build an agent and start its housekeeping task. Must be called inside
    /// a Tokio runtime.
    pub fn new(config: AgentConfig, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let local_contact = config
            .local_contact
            .as_deref()
            .map(str::parse::<SipUri>)
            .transpose()?;

        let inner = Arc::new(AgentInner {
            config,
            local_contact,
            handler,
            dialogs: DialogStore::new(),
            subscriptions: SubscriptionStore::new(),
            table: Mutex::new(TransactionTable::default()),
            pending: Mutex::new(AHashMap::new()),
        });
        spawn_housekeeper(Arc::downgrade(&inner));

        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<AgentInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn dialogs(&self) -> &DialogStore {
        &self.inner.dialogs
    }

    pub fn subscriptions(&self) -> &SubscriptionStore {
        &self.inner.subscriptions
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn allow_header(&self) -> String {
        self.inner.config.allow.join(", ")
    }

    /// Attach caller state to a dialog.
    pub fn set_session(&self, dialog: DialogHandle, session: SessionSlot) -> Result<()> {
        self.inner.dialogs.set_session(dialog, session)
    }

    /// Feed a message received from the network. `transport` answers back
    /// to its source and becomes the reply sink of a new server transaction.
    pub fn input(&self, message: SipMessage, transport: Arc<dyn Transport>) {
        if let Err(e) = message.validate() {
            debug!("Discarding malformed message: {}", e);
            return;
        }

        match message {
            SipMessage::Response(response) => self.inner.route_response(response),
            SipMessage::Request(request) => self.route_request(request, transport),
        }
    }

    /// Start a client transaction. The agent inserts the top Via and fills
    /// Max-Forwards, Call-ID, From tag, CSeq, User-Agent and Contact when absent.
    pub fn send_request(
        &self,
        mut request: SipRequest,
        transport: Arc<dyn Transport>,
    ) -> Result<(ClientTransaction, UnboundedReceiver<ClientEvent>)> {
        if matches!(request.method, SipMethod::Ack | SipMethod::Cancel) {
            return Err(SipError::InvalidOperation(format!(
                "{} is sent through the INVITE's ClientTransaction",
                request.method
            )));
        }

        let address = transport.via(&request.uri)?;
        let mut via = Via::new(&address.protocol.to_string(), &address.sent_by, &generate_branch());
        via.set_param("rport", None);
        request.push_front_header("via", via.to_string());
        self.fill_defaults(&mut request, &via.host)?;

        self.inner.start_client(request, transport)
    }

    fn fill_defaults(&self, request: &mut SipRequest, host: &str) -> Result<()> {
        for name in ["from", "to"] {
            if request.header(name).is_none() {
                return Err(SipParseError::MissingRequiredHeader(name.to_string()).into());
            }
        }
        if request.from_tag().is_none() {
            let from = request
                .from_addr()
                .ok_or_else(|| SipParseError::MalformedHeader("From".to_string()))?;
            request.set_header("from", from.with_tag(&generate_tag()).to_string());
        }
        if request.call_id().is_none() {
            request.set_header("call-id", generate_call_id(host));
        }
        if request.cseq().is_none() {
            request.set_header("cseq", format!("1 {}", request.method));
        }
        if request.max_forwards().is_none() {
            request.set_header("max-forwards", "70");
        }
        if request.header("user-agent").is_none() {
            request.set_header("user-agent", self.inner.config.user_agent.clone());
        }
        if request.method.is_target_refresh() && request.header("contact").is_none() {
            if let Some(contact) = &self.inner.local_contact {
                request.set_header("contact", format!("<{}>", contact));
            }
        }
        Ok(())
    }

    /// Next request inside `dialog`, with the dialog's CSeq advanced.
    pub fn create_request(&self, dialog: DialogHandle, method: SipMethod) -> Result<SipRequest> {
        self.inner
            .dialogs
            .with(dialog, |d| {
                let seq = d.next_local_seq();
                d.build_request(method, seq)
            })
            .ok_or(SipError::NoSuchDialog)
    }

    /// NOTIFY for a subscription this agent serves, carrying Event and
    /// Subscription-State (with the remaining duration while active).
    pub fn create_notify(&self, subscription: SubscriptionHandle, state: &str) -> Result<SipRequest> {
        let sub = self
            .inner
            .subscriptions
            .get(subscription)
            .ok_or_else(|| SipError::InvalidOperation("no such subscription".to_string()))?;
        let mut request = self.create_request(sub.dialog, SipMethod::Notify)?;

        let event = match &sub.id.event_id {
            Some(id) => format!("{};id={}", sub.id.event, id),
            None => sub.id.event.clone(),
        };
        request.set_header("event", event);
        let header = SubscriptionStateHeader {
            state: state.to_string(),
            expires: if state == "terminated" { None } else { sub.remaining() },
            reason: None,
        };
        request.set_header("subscription-state", header.to_string());
        Ok(request)
    }

    fn route_request(&self, request: SipRequest, transport: Arc<dyn Transport>) {
        let inner = &self.inner;
        let Some(key) = TransactionKey::from_request(&request) else {
            debug!("Discarding request without Via branch");
            return;
        };
        match request.cseq() {
            Some(cseq) if cseq.method == request.method => {}
            _ => {
                debug!(%key, "Discarding request with mismatched CSeq");
                return;
            }
        }

        if request.method == SipMethod::Ack {
            inner.route_ack(&key, request);
            return;
        }

        if let Some(queue) = inner.server_queue(&key) {
            debug!(%key, "Request retransmission");
            let _ = queue.send(TransactionEvent::Request(request));
            return;
        }

        if inner.table.lock().len() >= inner.config.max_transactions {
            warn!(%key, "Transaction limit reached, answering 503");
            self.reply_stateless(&request, 503, transport.as_ref());
            return;
        }

        if request.method == SipMethod::Cancel {
            self.handle_cancel(key, request, transport);
            return;
        }

        let admission = self.admit(&request);
        let (tx, queue) = match inner.spawn_server(key.clone(), request, transport.clone(), &admission) {
            Ok(created) => created,
            Err(e) => {
                warn!(%key, "Server transaction not created: {}", e);
                inner.rollback(&admission);
                return;
            }
        };

        match admission.reject {
            Some(reply) => respond_or_warn(&tx, reply),
            None => self.dispatch(&tx),
        }
        let _ = queue.send(TransactionEvent::HandlerDone);
    }

    fn dispatch(&self, tx: &ServerTransaction) {
        let handler = self.inner.handler.clone();
        let request = tx.request();
        match request.method {
            SipMethod::Invite => handler.on_invite(self, request, tx),
            SipMethod::Bye => handler.on_bye(self, request, tx),
            SipMethod::Register => handler.on_register(self, request, tx),
            SipMethod::Options => handler.on_options(self, request, tx),
            SipMethod::Info => handler.on_info(self, request, tx),
            SipMethod::Update => handler.on_update(self, request, tx),
            SipMethod::Prack => handler.on_prack(self, request, tx),
            SipMethod::Subscribe => handler.on_subscribe(self, request, tx),
            SipMethod::Notify => handler.on_notify(self, request, tx),
            SipMethod::Refer => handler.on_refer(self, request, tx),
            SipMethod::Message => handler.on_message(self, request, tx),
            SipMethod::Publish => handler.on_publish(self, request, tx),
            SipMethod::Other(_) => handler.on_other(self, request, tx),
            // Routed to their INVITE before any transaction is created
            SipMethod::Ack | SipMethod::Cancel => {}
        }
    }

    fn handle_cancel(&self, key: TransactionKey, request: SipRequest, transport: Arc<dyn Transport>) {
        let inner = &self.inner;
        let invite_key = key.with_method(SipMethod::Invite);
        let (origin, invite_tag) = {
            let table = inner.table.lock();
            match table.servers.get(&invite_key) {
                Some(entry) => (Some(entry.queue.clone()), entry.local_tag.clone()),
                None => (None, None),
            }
        };

        // The CANCEL's 200 carries the same To tag as the INVITE's responses
        let admission = Admission {
            local_tag: match request.to_tag() {
                Some(_) => None,
                None => Some(invite_tag.unwrap_or_else(generate_tag)),
            },
            ..Admission::default()
        };
        let (tx, queue) = match inner.spawn_server(key.clone(), request.clone(), transport, &admission) {
            Ok(created) => created,
            Err(e) => {
                warn!(%key, "CANCEL transaction not created: {}", e);
                return;
            }
        };

        match origin {
            Some(origin) => {
                respond_or_warn(&tx, Reply::new(200));
                let _ = origin.send(TransactionEvent::CancelRequest(request));
            }
            None => {
                debug!(%key, "CANCEL without matching INVITE");
                respond_or_warn(&tx, Reply::new(481));
            }
        }
        let _ = queue.send(TransactionEvent::HandlerDone);
    }

    /// Locate or create the dialog and subscription a new request belongs to.
    fn admit(&self, request: &SipRequest) -> Admission {
        match request.to_tag() {
            Some(_) => self.admit_in_dialog(request),
            None => self.admit_new(request),
        }
    }

    fn admit_in_dialog(&self, request: &SipRequest) -> Admission {
        let inner = &self.inner;
        let mut admission = Admission::default();
        let Some(id) = DialogId::from_request_uas(request) else {
            return admission.reject(Reply::new(400));
        };
        let seq = request.cseq().map(|c| c.seq).unwrap_or(0);

        let dialog = match inner.dialogs.find(&id) {
            Some(handle) => handle,
            None => match self.dialog_from_early_notify(request, &id) {
                Some(handle) => {
                    admission.created_dialog = true;
                    handle
                }
                None => {
                    debug!(dialog = %id, method = %request.method, "No dialog for in-dialog request");
                    return admission.reject(Reply::new(481));
                }
            },
        };
        admission.dialog = Some(dialog);
        admission.dialog_id = Some(id.clone());

        let in_order = inner
            .dialogs
            .with(dialog, |d| {
                if !d.accept_remote_seq(seq) {
                    return false;
                }
                if request.method.is_target_refresh() {
                    d.target_refresh(request.contact_uri());
                }
                true
            })
            .unwrap_or(false);
        if !in_order {
            return admission.reject(Reply::new(500).reason("CSeq Out of Order"));
        }

        match request.method {
            SipMethod::Subscribe => {
                let Some(event) = request.event() else {
                    return admission.reject(Reply::new(489));
                };
                let sub_id = SubscriptionId::new(id, &event.event_type, event.id.as_deref());
                match inner.subscriptions.find(&sub_id) {
                    Some(handle) => admission.subscription = Some(handle),
                    None => self.create_subscription(&mut admission, sub_id, SubscriptionRole::Notifier),
                }
            }
            SipMethod::Refer => {
                let sub_id = SubscriptionId::new(id, "refer", Some(&seq.to_string()));
                self.create_subscription(&mut admission, sub_id, SubscriptionRole::Notifier);
            }
            SipMethod::Notify => {
                let Some(event) = request.event() else {
                    return admission.reject(Reply::new(489));
                };
                let sub_id = SubscriptionId::new(id.clone(), &event.event_type, event.id.as_deref());
                match inner.subscriptions.find(&sub_id) {
                    Some(handle) => admission.subscription = Some(handle),
                    None => {
                        let pending = PendingSubscribe {
                            call_id: id.call_id.clone(),
                            local_tag: id.local_tag.clone(),
                            event: event.event_type.clone(),
                        };
                        if inner.pending_seq(&pending).is_some() {
                            self.create_subscription(&mut admission, sub_id, SubscriptionRole::Subscriber);
                        } else {
                            debug!(subscription = %sub_id, "NOTIFY for unknown subscription");
                            return admission.reject(Reply::new(481));
                        }
                    }
                }
            }
            _ => {}
        }

        admission
    }

    /// A NOTIFY that overtook the 2xx to our SUBSCRIBE creates the dialog.
    fn dialog_from_early_notify(&self, request: &SipRequest, id: &DialogId) -> Option<DialogHandle> {
        if request.method != SipMethod::Notify {
            return None;
        }
        let pending = PendingSubscribe {
            call_id: id.call_id.clone(),
            local_tag: id.local_tag.clone(),
            event: request.event()?.event_type,
        };
        let subscribe_seq = self.inner.pending_seq(&pending)?;

        let mut dialog = Dialog::uas_from_request(request, &id.local_tag, self.inner.local_contact.clone())?;
        dialog.local_seq = subscribe_seq;
        dialog.remote_seq = None;
        dialog.confirm();
        self.inner.dialogs.insert(dialog).ok()
    }

    fn admit_new(&self, request: &SipRequest) -> Admission {
        let inner = &self.inner;
        let local_tag = generate_tag();
        let mut admission = Admission {
            local_tag: Some(local_tag.clone()),
            ..Admission::default()
        };

        let event = match request.method {
            SipMethod::Invite => None,
            SipMethod::Subscribe => match request.event() {
                Some(event) => Some((event.event_type, event.id)),
                None => return admission.reject(Reply::new(489)),
            },
            SipMethod::Refer => Some((
                "refer".to_string(),
                request.cseq().map(|c| c.seq.to_string()),
            )),
            SipMethod::Notify => return admission.reject(Reply::new(481)),
            _ => return admission,
        };

        let Some(dialog) = Dialog::uas_from_request(request, &local_tag, inner.local_contact.clone()) else {
            return admission.reject(Reply::new(400));
        };
        let id = dialog.id.clone();
        match inner.dialogs.insert(dialog) {
            Ok(handle) => {
                admission.dialog = Some(handle);
                admission.dialog_id = Some(id.clone());
                admission.created_dialog = true;
            }
            Err(e) => {
                warn!(dialog = %id, "Dialog not created: {}", e);
                return admission.reject(Reply::new(500));
            }
        }

        if let Some((event, event_id)) = event {
            let sub_id = SubscriptionId::new(id, &event, event_id.as_deref());
            self.create_subscription(&mut admission, sub_id, SubscriptionRole::Notifier);
            if admission.subscription.is_none() {
                inner.rollback(&admission);
                admission.dialog = None;
                return admission.reject(Reply::new(500));
            }
        }

        admission
    }

    fn create_subscription(&self, admission: &mut Admission, id: SubscriptionId, role: SubscriptionRole) {
        let Some(dialog) = admission.dialog else {
            return;
        };
        match self
            .inner
            .subscriptions
            .insert(Subscription::new(id.clone(), dialog, role), &self.inner.dialogs)
        {
            Ok(handle) => {
                admission.subscription = Some(handle);
                admission.created_subscription = true;
            }
            Err(e) => warn!(subscription = %id, "Subscription not created: {}", e),
        }
    }

    fn reply_stateless(&self, request: &SipRequest, status_code: u16, transport: &dyn Transport) {
        let tag = generate_tag();
        let response = build_response_from_request(request, status_code, reason_phrase(status_code), Some(&tag));
        if let Err(e) = transport.send(&response.to_bytes()) {
            warn!("Stateless {} not sent: {}", status_code, e);
        }
    }

    /// Remove subscriptions whose expiry passed without a refresh.
    fn expire_subscriptions(&self) {
        let inner = &self.inner;
        for handle in inner.subscriptions.expired(Instant::now()) {
            if let Some(subscription) = inner.subscriptions.remove(handle, &inner.dialogs) {
                info!(subscription = %subscription.id, "Subscription expired");
                inner.handler.on_subscription_expired(self, &subscription);
            }
        }
    }
}

fn spawn_housekeeper(agent: Weak<AgentInner>) {
    let period = match agent.upgrade() {
        Some(inner) => Duration::from_millis(inner.config.housekeeping_interval_ms.max(1)),
        None => return,
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = agent.upgrade() else {
                break;
            };
            Agent::from_inner(inner).expire_subscriptions();
        }
    });
}

/// Subscription duration granted in a 2xx: the response's Expires, else the
/// request's, else the configured default.
pub(crate) fn granted_expires(config: &AgentConfig, request: &SipRequest, response: Option<&SipResponse>) -> u32 {
    response
        .and_then(|r| r.expires())
        .or_else(|| request.expires())
        .unwrap_or(config.default_subscription_expires)
}

/// Apply a NOTIFY's Subscription-State to the subscriber side.
pub(crate) fn apply_subscription_state(
    inner: &AgentInner,
    subscription: SubscriptionHandle,
    state: Option<SubscriptionStateHeader>,
) {
    let default = Duration::from_secs(inner.config.default_subscription_expires as u64);
    match state {
        Some(state) if state.is_terminated() => {
            inner.subscriptions.remove(subscription, &inner.dialogs);
        }
        Some(state) if state.is_active() => {
            let expires = state.expires.map(|s| Duration::from_secs(s as u64)).unwrap_or(default);
            inner.subscriptions.with(subscription, |s| s.activate(expires));
        }
        Some(state) => {
            if let Some(expires) = state.expires {
                inner
                    .subscriptions
                    .with(subscription, |s| s.refresh(Duration::from_secs(expires as u64)));
            }
        }
        None => debug!(%subscription, "NOTIFY without Subscription-State"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        agent_at, invite_out, link, options_request, register_out, response_to, subscribe_out,
        subscribe_request, test_agent, MockTransport, NullHandler, CLIENT_SENT_BY,
    };
    use crate::dialog::DialogState;
    use crate::SubscriptionState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use bytes::Bytes;

    async fn settle() {
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[derive(Default)]
    struct Presence {
        expired: Mutex<Vec<SubscriptionId>>,
    }

    impl RequestHandler for Presence {
        fn on_subscribe(&self, _agent: &Agent, _request: &SipRequest, tx: &ServerTransaction) {
            tx.respond(Reply::new(200)).unwrap();
        }

        fn on_subscription_expired(&self, _agent: &Agent, subscription: &Subscription) {
            self.expired.lock().push(subscription.id.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_request_fills_defaults() {
        let agent = test_agent(Arc::new(NullHandler));
        let transport = MockTransport::udp();
        let (tx, _events) = agent.send_request(options_request(), transport.clone()).unwrap();
        settle().await;

        let sent = transport.last_request().unwrap();
        let via = sent.top_via().unwrap();
        assert!(via.is_rfc3261());
        assert_eq!(via.sent_by(), CLIENT_SENT_BY);
        assert_eq!(via.rport(), Some(None));
        assert!(sent.from_tag().is_some());
        assert!(sent.call_id().unwrap().ends_with("@client.atlanta.example.com"));
        assert_eq!(sent.cseq().unwrap().to_string(), "1 OPTIONS");
        assert_eq!(sent.max_forwards(), Some(70));
        assert!(sent.header("user-agent").is_some());
        assert_eq!(tx.request().top_via(), Some(via));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_and_cancel_cannot_start_transactions() {
        let agent = test_agent(Arc::new(NullHandler));
        let mut ack = options_request();
        ack.method = SipMethod::Ack;
        assert!(matches!(
            agent.send_request(ack, MockTransport::udp()),
            Err(SipError::InvalidOperation(_))
        ));
        assert_eq!(agent.transaction_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_over_limit_gets_stateless_503() {
        let config = AgentConfig {
            max_transactions: 1,
            ..AgentConfig::default()
        };
        let agent = Agent::new(config, Arc::new(NullHandler)).unwrap();
        let transport = MockTransport::udp();
        let _held = agent.send_request(options_request(), transport.clone()).unwrap();
        settle().await;

        let subscribe = subscribe_request("busy", "watcher", "z9hG4bKbusy", 60);
        agent.input(SipMessage::Request(subscribe), transport.clone());
        settle().await;

        assert_eq!(transport.status_codes(), vec![503]);
        assert!(agent.dialogs().is_empty());
        assert_eq!(agent.transaction_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_without_transaction_is_dropped() {
        let agent = test_agent(Arc::new(NullHandler));
        let transport = MockTransport::udp();
        let stray = response_to(&subscribe_request("x", "y", "z9hG4bKstray", 1), 200, Some("z"));
        agent.input(SipMessage::Response(stray), transport.clone());
        settle().await;
        assert_eq!(transport.sent_count(), 0);
        assert!(agent.dialogs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_before_subscribe_response() {
        let agent = test_agent(Arc::new(NullHandler));
        let transport = MockTransport::udp();
        let (_tx, mut events) = agent.send_request(subscribe_out(600), transport.clone()).unwrap();
        settle().await;
        let subscribe = transport.last_request().unwrap();
        let our_tag = subscribe.from_tag().unwrap();

        let mut notify = SipRequest::new(SipMethod::Notify, "sip:alice@client.atlanta.example.com".parse().unwrap());
        notify.set_header("via", "SIP/2.0/UDP presence.biloxi.example.com;branch=z9hG4bKnotify1");
        notify.set_header("from", "Bob <sip:bob@biloxi.example.com>;tag=notifier");
        notify.set_header("to", format!("Alice <sip:alice@atlanta.example.com>;tag={}", our_tag));
        notify.set_header("call-id", subscribe.call_id().unwrap());
        notify.set_header("cseq", "1 NOTIFY");
        notify.set_header("event", "presence");
        notify.set_header("subscription-state", "active;expires=500");
        notify.set_header("contact", "<sip:bob@198.51.100.9>");
        notify.set_header("max-forwards", "70");
        agent.input(SipMessage::Request(notify), transport.clone());
        settle().await;

        assert_eq!(transport.last_response().unwrap().status_code, 200);
        let id = DialogId::new(subscribe.call_id().unwrap(), &our_tag, "notifier");
        let dialog = agent.dialogs().find(&id).unwrap();
        let subs = agent.subscriptions().for_dialog(dialog);
        assert_eq!(subs.len(), 1);
        assert_eq!(agent.subscriptions().get(subs[0]).unwrap().state, SubscriptionState::Active);

        let ok = response_to(&subscribe, 200, Some("notifier"));
        agent.input(SipMessage::Response(ok), transport.clone());
        let event = events.recv().await.unwrap();
        assert_eq!(event.status_code(), 200);
        assert_eq!(event.dialog(), Some(dialog));
        assert_eq!(agent.subscriptions().len(), 1);

        // The dialog kept the SUBSCRIBE's CSeq as its local sequence
        let next = agent.create_request(dialog, SipMethod::Subscribe).unwrap();
        assert_eq!(next.cseq().unwrap().seq, subscribe.cseq().unwrap().seq + 1);
        assert_eq!(next.uri.host, "198.51.100.9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_notify_is_481() {
        let agent = test_agent(Arc::new(NullHandler));
        let transport = MockTransport::udp();
        let mut notify = subscribe_request("nobody", "notifier", "z9hG4bKn481", 0);
        notify.method = SipMethod::Notify;
        notify.set_header("cseq", "1 NOTIFY");
        notify.set_header("to", "Alice <sip:alice@atlanta.example.com>;tag=never-sent");
        agent.input(SipMessage::Request(notify), transport.clone());
        settle().await;
        assert_eq!(transport.status_codes(), vec![481]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_expires_without_refresh() {
        let presence = Arc::new(Presence::default());
        let agent = test_agent(presence.clone());
        let transport = MockTransport::udp();
        agent.input(
            SipMessage::Request(subscribe_request("expiring", "watcher", "z9hG4bKexp", 60)),
            transport.clone(),
        );
        settle().await;
        assert_eq!(agent.subscriptions().len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert!(presence.expired.lock().is_empty());

        tokio::time::advance(Duration::from_secs(32)).await;
        settle().await;
        assert_eq!(presence.expired.lock().len(), 1);
        assert!(agent.subscriptions().is_empty());
        assert!(agent.dialogs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_notify_for_served_subscription() {
        let agent = test_agent(Arc::new(Presence::default()));
        let transport = MockTransport::udp();
        agent.input(
            SipMessage::Request(subscribe_request("served", "watcher", "z9hG4bKsrv", 300)),
            transport.clone(),
        );
        settle().await;
        let accepted = transport.last_response().unwrap();
        let dialog = agent
            .dialogs()
            .find(&DialogId::from_response_uas(&accepted).unwrap())
            .unwrap();
        let subscription = agent.subscriptions().for_dialog(dialog)[0];

        let notify = agent.create_notify(subscription, "active").unwrap();
        assert_eq!(notify.method, SipMethod::Notify);
        assert_eq!(notify.uri.host, "client.atlanta.example.com");
        assert_eq!(notify.header("event"), Some("presence"));
        let state = notify.subscription_state().unwrap();
        assert!(state.is_active());
        assert!(state.expires.unwrap() >= 299);
        assert_eq!(notify.to_tag().as_deref(), Some("watcher"));
        assert_eq!(notify.cseq().unwrap().seq, 1);

        let last = agent.create_notify(subscription, "terminated").unwrap();
        assert_eq!(last.header("subscription-state"), Some("terminated"));
        assert_eq!(last.cseq().unwrap().seq, 2);
    }

    /// Far end of the two-agent tests: rings then answers, registers, accepts presence.
    #[derive(Default)]
    struct Callee {
        invites: AtomicUsize,
        acks: AtomicUsize,
        registers: AtomicUsize,
    }

    impl RequestHandler for Callee {
        fn on_invite(&self, _agent: &Agent, _request: &SipRequest, tx: &ServerTransaction) {
            self.invites.fetch_add(1, Ordering::SeqCst);
            tx.respond(Reply::new(100)).unwrap();
            tx.respond(Reply::new(180)).unwrap();
            tx.respond(Reply::new(200).body("application/sdp", Bytes::from_static(b"v=0\r\n")))
                .unwrap();
        }

        fn on_ack(&self, _agent: &Agent, _ack: &SipRequest, _invite: &ServerTransaction) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_register(&self, _agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
            self.registers.fetch_add(1, Ordering::SeqCst);
            let contact = request.contact_uri().unwrap();
            let expires = request.expires().unwrap();
            tx.respond(
                Reply::new(200)
                    .header("contact", format!("<{}>;expires={}", contact, expires))
                    .header("expires", expires.to_string()),
            )
            .unwrap();
        }

        fn on_subscribe(&self, _agent: &Agent, _request: &SipRequest, tx: &ServerTransaction) {
            tx.respond(Reply::new(200)).unwrap();
        }
    }

    async fn final_event(events: &mut UnboundedReceiver<ClientEvent>) -> (Vec<u16>, ClientEvent) {
        let mut provisional = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            match event {
                ClientEvent::Provisional { .. } => provisional.push(event.status_code()),
                ClientEvent::Final { .. } => return (provisional, event),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_between_two_agents() {
        let callee_handler = Arc::new(Callee::default());
        let caller = test_agent(Arc::new(NullHandler));
        let callee = agent_at("sip:bob@server.biloxi.example.com", callee_handler.clone());
        let (to_callee, _to_caller) = link(&caller, &callee);

        let (tx, mut events) = caller.send_request(invite_out(), to_callee).unwrap();
        let (provisional, answer) = final_event(&mut events).await;
        assert_eq!(provisional, vec![100, 180]);
        assert_eq!(answer.status_code(), 200);
        let dialog = answer.dialog().unwrap();
        assert_eq!(caller.dialogs().len(), 1);
        assert_eq!(caller.dialogs().get(dialog).unwrap().state, DialogState::Confirmed);
        assert_eq!(
            caller.dialogs().get(dialog).unwrap().remote_target.host,
            "server.biloxi.example.com"
        );

        tx.ack(dialog, None).unwrap();
        settle().await;

        assert_eq!(callee.dialogs().len(), 1);
        let far_end = callee.dialogs().handles()[0];
        assert_eq!(callee.dialogs().get(far_end).unwrap().state, DialogState::Confirmed);
        assert_eq!(callee_handler.invites.load(Ordering::SeqCst), 1);
        assert_eq!(callee_handler.acks.load(Ordering::SeqCst), 1);

        // The ACK stopped the 2xx retransmissions; nothing new reaches the caller
        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_between_two_agents() {
        let registrar = Arc::new(Callee::default());
        let client = test_agent(Arc::new(NullHandler));
        let server = agent_at("sip:registrar@server.biloxi.example.com", registrar.clone());
        let (to_server, _to_client) = link(&client, &server);

        let (_tx, mut events) = client.send_request(register_out(7200), to_server).unwrap();
        let (_, event) = final_event(&mut events).await;
        let ClientEvent::Final { status_code, response: Some(response), dialog } = event else {
            panic!("REGISTER got no response");
        };
        assert_eq!(status_code, 200);
        assert_eq!(dialog, None);
        assert_eq!(response.expires(), Some(7200));
        assert_eq!(
            response.header("contact"),
            Some("<sip:alice@client.atlanta.example.com>;expires=7200")
        );
        assert_eq!(registrar.registers.load(Ordering::SeqCst), 1);
        assert!(client.dialogs().is_empty());
        assert!(server.dialogs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_between_two_agents() {
        let watcher = test_agent(Arc::new(NullHandler));
        let notifier = agent_at("sip:bob@server.biloxi.example.com", Arc::new(Callee::default()));
        let (to_notifier, to_watcher) = link(&watcher, &notifier);

        let (_tx, mut events) = watcher.send_request(subscribe_out(600), to_notifier.clone()).unwrap();
        let (_, accepted) = final_event(&mut events).await;
        assert_eq!(accepted.status_code(), 200);
        let dialog = accepted.dialog().unwrap();
        assert_eq!(watcher.subscriptions().len(), 1);
        settle().await;
        assert_eq!(notifier.subscriptions().len(), 1);

        // Built while the subscription still exists, delivered after it is gone
        let served = notifier.subscriptions().for_dialog(notifier.dialogs().handles()[0])[0];
        let stale_notify = notifier.create_notify(served, "active").unwrap();

        let mut unsubscribe = watcher.create_request(dialog, SipMethod::Subscribe).unwrap();
        unsubscribe.set_header("event", "presence");
        unsubscribe.set_header("expires", "0");
        let (_tx, mut events) = watcher.send_request(unsubscribe, to_notifier).unwrap();
        let (_, removed) = final_event(&mut events).await;
        assert_eq!(removed.status_code(), 200);
        settle().await;
        assert!(watcher.subscriptions().is_empty());
        assert!(watcher.dialogs().is_empty());
        assert!(notifier.subscriptions().is_empty());

        // Let the SUBSCRIBE transactions finish so no early-NOTIFY window remains
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;

        let (_tx, mut events) = notifier.send_request(stale_notify, to_watcher).unwrap();
        let (_, rejected) = final_event(&mut events).await;
        assert_eq!(rejected.status_code(), 481);
        assert!(watcher.dialogs().is_empty());
    }

    #[test]
    fn test_config_from_json() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"max_transactions": 50, "timers": {"t1_ms": 250}, "allow": ["INVITE", "BYE"]}"#,
        )
        .unwrap();
        assert_eq!(config.max_transactions, 50);
        assert_eq!(config.timers.t1(), Duration::from_millis(250));
        assert_eq!(config.default_subscription_expires, 3600);
        assert_eq!(config.allow, vec!["INVITE", "BYE"]);
    }
}
