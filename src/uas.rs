//! Server transactions (RFC 3261 §17.2, RFC 6026 for Accepted and Timer L).
//!
//! The agent spawns one task per received request and then calls the request
//! handler; replies arrive here through the `ServerTransaction` queue.

use crate::agent::{apply_subscription_state, granted_expires, Agent, AgentInner};
use crate::dialog::DialogHandle;
use crate::subscription::SubscriptionHandle;
use crate::timer::{backoff, TimerSet};
use crate::transaction::{Reply, ServerTransaction, TimerKind, TransactionEvent, TransactionKey, TransactionState};
use crate::transport::{Reliability, Transport};
use crate::utils::{build_response_from_request, reason_phrase};
use crate::{MessageHeaders, SipMethod, SipRequest, SipResponse};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info_span, warn, Instrument};

/// What the agent decided about a request before its transaction started.
pub(crate) struct ServerSetup {
    pub key: TransactionKey,
    pub request: Arc<SipRequest>,
    pub transport: Arc<dyn Transport>,
    /// To tag for responses when the request had none
    pub local_tag: Option<String>,
    pub dialog: Option<DialogHandle>,
    pub subscription: Option<SubscriptionHandle>,
    pub created_dialog: bool,
    pub created_subscription: bool,
}

pub(crate) struct ServerActor {
    agent: Arc<AgentInner>,
    setup: ServerSetup,
    queue: UnboundedSender<TransactionEvent>,
    state: TransactionState,
    timers: TimerSet<TimerKind>,
    reliability: Reliability,
    retransmits: u32,
    last_response: Option<Bytes>,
    final_sent: bool,
    ack_reported: bool,
}

impl ServerActor {
    pub(crate) fn spawn(
        agent: Arc<AgentInner>,
        setup: ServerSetup,
        queue: UnboundedSender<TransactionEvent>,
        inbox: UnboundedReceiver<TransactionEvent>,
    ) {
        let span = info_span!("uas", method = %setup.key.method, branch = %setup.key.branch);
        let reliability = match setup.request.top_via() {
            Some(via) if via.transport.eq_ignore_ascii_case("UDP") => Reliability::Unreliable,
            Some(_) => Reliability::Reliable,
            None => Reliability::Unreliable,
        };
        let actor = ServerActor {
            agent,
            setup,
            queue,
            state: TransactionState::Trying,
            timers: TimerSet::new(),
            reliability,
            retransmits: 0,
            last_response: None,
            final_sent: false,
            ack_reported: false,
        };
        tokio::spawn(actor.run(inbox).instrument(span));
    }

    async fn run(mut self, mut inbox: UnboundedReceiver<TransactionEvent>) {
        while self.state != TransactionState::Terminated {
            let Some(event) = inbox.recv().await else {
                break;
            };
            self.handle(event);
        }
        self.timers.stop_all();
        self.agent.remove_server(&self.setup.key);
        debug!("Server transaction finished");
    }

    fn is_invite(&self) -> bool {
        self.setup.key.method == SipMethod::Invite
    }

    fn request(&self) -> &SipRequest {
        &self.setup.request
    }

    fn set_state(&mut self, state: TransactionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "State change");
            self.state = state;
        }
    }

    fn terminate(&mut self) {
        self.timers.stop_all();
        self.set_state(TransactionState::Terminated);
    }

    /// Caller-facing handle, for callbacks made from inside the task.
    fn handle_for_caller(&self) -> ServerTransaction {
        ServerTransaction {
            key: self.setup.key.clone(),
            request: self.setup.request.clone(),
            dialog: self.setup.dialog,
            subscription: self.setup.subscription,
            queue: self.queue.clone(),
        }
    }

    fn handle(&mut self, event: TransactionEvent) {
        match event {
            TransactionEvent::Reply(reply) => self.on_reply(reply),
            TransactionEvent::HandlerDone => self.on_handler_done(),
            TransactionEvent::Request(_) => self.on_retransmission(),
            TransactionEvent::Ack(ack) => self.on_ack(ack),
            TransactionEvent::CancelRequest(cancel) => self.on_cancel(cancel),
            TransactionEvent::Timer(expired) => {
                if self.timers.accept(expired) {
                    self.on_timer(expired.kind);
                }
            }
            TransactionEvent::Terminate => self.terminate(),
            other => debug!(?other, "Event not handled by server transaction"),
        }
    }

    fn send(&mut self, bytes: &Bytes) {
        match self.setup.transport.send(bytes) {
            Ok(reliability) => self.reliability = reliability,
            Err(e) => warn!("Response not sent: {}", e),
        }
    }

    fn resend_last(&mut self) {
        if let Some(bytes) = self.last_response.clone() {
            self.send(&bytes);
        }
    }

    /// A handler that returns without a final response still gets the
    /// transaction reaped after 64·T1.
    fn on_handler_done(&mut self) {
        let guard = self.agent.timers().transaction_timeout();
        match self.state {
            TransactionState::Trying => {
                let kind = if self.is_invite() { TimerKind::H } else { TimerKind::J };
                self.timers.start(kind, guard, &self.queue);
            }
            TransactionState::Proceeding if !self.is_invite() => {
                self.timers.start(TimerKind::J, guard, &self.queue);
            }
            _ => {}
        }
    }

    fn on_retransmission(&mut self) {
        match self.state {
            TransactionState::Proceeding | TransactionState::Completed | TransactionState::Accepted => {
                debug!("Request retransmission, resending last response");
                self.resend_last();
            }
            state => debug!(?state, "Request retransmission absorbed"),
        }
    }

    fn on_reply(&mut self, reply: Reply) {
        if self.final_sent {
            debug!(status = reply.status_code, "Final already sent, reply dropped");
            return;
        }
        let status_code = reply.status_code;
        let response = self.build_response(reply);
        let bytes = response.to_bytes();
        self.send(&bytes);
        self.last_response = Some(bytes);

        let timers = self.agent.timers().clone();
        let unreliable = self.reliability == Reliability::Unreliable;
        match status_code {
            100..=199 => {
                self.set_state(TransactionState::Proceeding);
                if self.is_invite() {
                    // A ringing call waits on the caller, not on a guard
                    self.timers.stop(TimerKind::H);
                }
            }
            200..=299 if self.is_invite() => {
                self.final_sent = true;
                self.timers.stop(TimerKind::H);
                self.set_state(TransactionState::Accepted);
                if unreliable {
                    self.timers.start(TimerKind::G, timers.t1(), &self.queue);
                }
                self.timers.start(TimerKind::L, timers.transaction_timeout(), &self.queue);
            }
            _ if self.is_invite() => {
                self.final_sent = true;
                self.set_state(TransactionState::Completed);
                if unreliable {
                    self.timers.start(TimerKind::G, timers.t1(), &self.queue);
                }
                self.timers.start(TimerKind::H, timers.transaction_timeout(), &self.queue);
                self.discard_created_state();
            }
            _ => {
                self.final_sent = true;
                self.set_state(TransactionState::Completed);
                let linger = if unreliable { timers.transaction_timeout() } else { Duration::ZERO };
                self.timers.start(TimerKind::J, linger, &self.queue);
                self.after_final(status_code, &response);
            }
        }
    }

    fn build_response(&self, reply: Reply) -> SipResponse {
        let request = self.request();
        let status_code = reply.status_code;
        let reason = reply
            .reason
            .unwrap_or_else(|| reason_phrase(status_code).to_string());
        let mut response =
            build_response_from_request(request, status_code, &reason, self.setup.local_tag.as_deref());

        for (name, value) in reply.headers {
            response.add_header(&name, value);
        }

        if (101..300).contains(&status_code) {
            if request.method.creates_dialog() {
                for route in request.header_values("record-route") {
                    response.add_header("record-route", route.clone());
                }
            }
            if request.method.is_target_refresh() && response.header("contact").is_none() {
                if let Some(contact) = reply.contact.as_ref().or(self.agent.local_contact.as_ref()) {
                    response.set_header("contact", format!("<{}>", contact));
                }
            }
        }

        if status_code == 405 && response.header("allow").is_none() {
            response.set_header("allow", self.agent.config.allow.join(", "));
        }
        if (200..300).contains(&status_code)
            && request.method == SipMethod::Subscribe
            && response.header("expires").is_none()
        {
            let expires = granted_expires(&self.agent.config, request, None);
            response.set_header("expires", expires.to_string());
        }
        if response.header("server").is_none() {
            response.set_header("server", self.agent.config.user_agent.clone());
        }
        if let (Some(content_type), Some(body)) = (reply.content_type, reply.body) {
            response.set_header("content-type", content_type);
            response.body = Some(body);
        }
        response
    }

    /// Dialog and subscription bookkeeping once a non-INVITE final is sent.
    fn after_final(&mut self, status_code: u16, response: &SipResponse) {
        let agent = self.agent.clone();
        let success = (200..300).contains(&status_code);
        match self.request().method {
            SipMethod::Subscribe | SipMethod::Refer if success => {
                if let Some(dialog) = self.setup.dialog {
                    agent.dialogs.with(dialog, |d| d.confirm());
                }
                if let Some(subscription) = self.setup.subscription {
                    let expires = response.expires().unwrap_or(agent.config.default_subscription_expires);
                    if expires == 0 && self.request().method == SipMethod::Subscribe {
                        debug!(%subscription, "Unsubscribed by peer");
                        agent.subscriptions.remove(subscription, &agent.dialogs);
                    } else {
                        agent
                            .subscriptions
                            .with(subscription, |s| s.activate(Duration::from_secs(expires as u64)));
                    }
                }
            }
            SipMethod::Bye => {
                if let Some(dialog) = self.setup.dialog {
                    agent.dialogs.end_invite_usage(dialog);
                }
            }
            SipMethod::Notify if success => {
                if let Some(subscription) = self.setup.subscription {
                    apply_subscription_state(&agent, subscription, self.request().subscription_state());
                }
            }
            _ if !success => self.discard_created_state(),
            _ => {}
        }
    }

    /// Undo the dialog and subscription this request created.
    fn discard_created_state(&mut self) {
        let agent = &self.agent;
        if self.setup.created_subscription {
            if let Some(subscription) = self.setup.subscription.take() {
                agent.subscriptions.remove(subscription, &agent.dialogs);
            }
        }
        if self.setup.created_dialog {
            if let Some(dialog) = self.setup.dialog {
                if agent.dialogs.remove_if_early(dialog) {
                    debug!(%dialog, "Early dialog discarded");
                }
            }
        }
    }

    fn on_ack(&mut self, ack: SipRequest) {
        let timers = self.agent.timers().clone();
        let linger = match self.reliability {
            Reliability::Unreliable => timers.t4(),
            Reliability::Reliable => Duration::ZERO,
        };

        match self.state {
            TransactionState::Completed => {
                self.timers.stop(TimerKind::G);
                self.timers.stop(TimerKind::H);
                self.set_state(TransactionState::Confirmed);
                self.timers.start(TimerKind::I, linger, &self.queue);
            }
            TransactionState::Accepted => {
                self.timers.stop(TimerKind::G);
                self.timers.stop(TimerKind::L);
                if let Some(dialog) = self.setup.dialog {
                    let contact = ack.contact_uri();
                    self.agent.dialogs.with(dialog, |d| {
                        d.confirm();
                        d.target_refresh(contact);
                    });
                }
                self.set_state(TransactionState::Confirmed);
                self.timers.start(TimerKind::I, linger, &self.queue);
            }
            state => {
                debug!(?state, "ACK absorbed");
                return;
            }
        }

        if !self.ack_reported {
            self.ack_reported = true;
            let agent = Agent::from_inner(self.agent.clone());
            let handler = self.agent.handler.clone();
            handler.on_ack(&agent, &ack, &self.handle_for_caller());
        }
    }

    fn on_cancel(&mut self, cancel: SipRequest) {
        match self.state {
            TransactionState::Trying | TransactionState::Proceeding if !self.final_sent => {
                let agent = Agent::from_inner(self.agent.clone());
                let handler = self.agent.handler.clone();
                handler.on_cancel(&agent, &cancel, &self.handle_for_caller());
            }
            state => debug!(?state, "CANCEL after final response ignored"),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        let timers = self.agent.timers().clone();
        match (kind, self.state) {
            (TimerKind::G, TransactionState::Completed | TransactionState::Accepted) => {
                self.resend_last();
                self.retransmits += 1;
                let delay = backoff(timers.t1(), self.retransmits, timers.t2());
                self.timers.start(TimerKind::G, delay, &self.queue);
            }
            (TimerKind::H, TransactionState::Completed) => {
                warn!("No ACK for final response (Timer H)");
                self.terminate();
            }
            (TimerKind::H | TimerKind::J, TransactionState::Trying | TransactionState::Proceeding) => {
                warn!("Request never answered, transaction dropped");
                self.discard_created_state();
                self.terminate();
            }
            (TimerKind::L, TransactionState::Accepted) => {
                if let Some(dialog) = self.setup.dialog {
                    if self.agent.dialogs.remove_if_early(dialog) {
                        warn!(%dialog, "2xx never acknowledged, dialog discarded");
                    }
                }
                self.terminate();
            }
            (TimerKind::J, TransactionState::Completed) | (TimerKind::I, TransactionState::Confirmed) => {
                self.terminate()
            }
            (kind, state) => debug!(?kind, ?state, "Timer ignored"),
        }
    }
}
