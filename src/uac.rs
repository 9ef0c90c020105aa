//! Client transactions (RFC 3261 §17.1, RFC 6026 for Accepted and Timer M).
//!
//! One task per transaction. The task owns the request bytes, the timers and
//! the per-fork dialog bookkeeping; callers only reach it through the queue
//! behind `ClientTransaction`.

use crate::agent::{granted_expires, AgentInner, PendingSubscribe};
use crate::dialog::{Dialog, DialogHandle, DialogId};
use crate::subscription::{Subscription, SubscriptionHandle, SubscriptionId, SubscriptionRole};
use crate::timer::{backoff, TimerSet};
use crate::transaction::{ClientEvent, TimerKind, TransactionEvent, TransactionKey, TransactionState};
use crate::transport::{Reliability, Transport};
use crate::utils::generate_branch;
use crate::{MessageHeaders, SipMethod, SipRequest, SipResponse};
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, info_span, warn, Instrument};

pub(crate) struct ClientActor {
    agent: Arc<AgentInner>,
    key: TransactionKey,
    request: SipRequest,
    bytes: Bytes,
    transport: Arc<dyn Transport>,
    queue: UnboundedSender<TransactionEvent>,
    events: UnboundedSender<ClientEvent>,
    history: Arc<Mutex<Vec<TransactionState>>>,
    pending: Option<PendingSubscribe>,
    state: TransactionState,
    timers: TimerSet<TimerKind>,
    reliability: Reliability,
    retransmits: u32,
    final_reported: bool,
    cancel_deferred: bool,
    cancel_sent: bool,
    /// Dialogs per remote tag, early or confirmed
    forks: AHashMap<String, DialogHandle>,
    /// Remote tags that answered 2xx
    answered: AHashSet<String>,
    /// 2xx ACKs per remote tag, resent on 2xx retransmission
    acks: AHashMap<String, Bytes>,
    failure_ack: Option<Bytes>,
}

impl ClientActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        agent: Arc<AgentInner>,
        key: TransactionKey,
        request: SipRequest,
        transport: Arc<dyn Transport>,
        queue: UnboundedSender<TransactionEvent>,
        inbox: UnboundedReceiver<TransactionEvent>,
        events: UnboundedSender<ClientEvent>,
        history: Arc<Mutex<Vec<TransactionState>>>,
        pending: Option<PendingSubscribe>,
    ) {
        let span = info_span!("uac", method = %key.method, branch = %key.branch);
        let state = history.lock().last().copied().unwrap_or(TransactionState::Init);
        let actor = ClientActor {
            bytes: request.to_bytes(),
            agent,
            key,
            request,
            transport,
            queue,
            events,
            history,
            pending,
            state,
            timers: TimerSet::new(),
            reliability: Reliability::Unreliable,
            retransmits: 0,
            final_reported: false,
            cancel_deferred: false,
            cancel_sent: false,
            forks: AHashMap::new(),
            answered: AHashSet::new(),
            acks: AHashMap::new(),
            failure_ack: None,
        };
        tokio::spawn(actor.run(inbox).instrument(span));
    }

    async fn run(mut self, mut inbox: UnboundedReceiver<TransactionEvent>) {
        self.start();
        while self.state != TransactionState::Terminated {
            let Some(event) = inbox.recv().await else {
                break;
            };
            self.handle(event);
        }
        self.timers.stop_all();
        self.agent.remove_client(&self.key);
        if let Some(pending) = self.pending.take() {
            self.agent.remove_pending(&pending);
        }
        debug!("Client transaction finished");
    }

    fn is_invite(&self) -> bool {
        self.key.method == SipMethod::Invite
    }

    fn set_state(&mut self, state: TransactionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "State change");
            self.state = state;
            self.history.lock().push(state);
        }
    }

    fn terminate(&mut self) {
        self.timers.stop_all();
        self.set_state(TransactionState::Terminated);
    }

    fn start(&mut self) {
        match self.transport.send(&self.bytes) {
            Ok(reliability) => self.reliability = reliability,
            Err(e) => {
                warn!("Request not sent: {}", e);
                self.fail(503);
                return;
            }
        }

        let timers = self.agent.timers().clone();
        let unreliable = self.reliability == Reliability::Unreliable;
        if self.is_invite() {
            if unreliable {
                self.timers.start(TimerKind::A, timers.t1(), &self.queue);
            }
            self.timers.start(TimerKind::B, timers.transaction_timeout(), &self.queue);
        } else {
            if unreliable {
                self.timers.start(TimerKind::E, timers.t1(), &self.queue);
            }
            self.timers.start(TimerKind::F, timers.transaction_timeout(), &self.queue);
        }
    }

    fn handle(&mut self, event: TransactionEvent) {
        match event {
            TransactionEvent::Response(response) if self.is_invite() => self.on_invite_response(response),
            TransactionEvent::Response(response) => self.on_response(response),
            TransactionEvent::Timer(expired) => {
                if self.timers.accept(expired) {
                    self.on_timer(expired.kind);
                }
            }
            TransactionEvent::Cancel => self.on_cancel(),
            TransactionEvent::SendAck { dialog, body } => self.send_ack(dialog, body),
            TransactionEvent::Terminate => {
                debug!("Terminated by caller");
                self.remove_unanswered_forks();
                self.terminate();
            }
            other => debug!(?other, "Event not handled by client transaction"),
        }
    }

    fn emit(&self, event: ClientEvent) {
        // The caller may have dropped its receiver
        let _ = self.events.send(event);
    }

    fn report_final(&mut self, status_code: u16, response: Option<SipResponse>, dialog: Option<DialogHandle>) {
        if self.final_reported {
            return;
        }
        self.final_reported = true;
        self.emit(ClientEvent::Final {
            status_code,
            response,
            dialog,
        });
    }

    /// Locally generated final (408, 503) and termination.
    fn fail(&mut self, status_code: u16) {
        let dialog = if self.is_invite() {
            self.remove_unanswered_forks();
            None
        } else {
            self.apply_final_hooks(status_code, None)
        };
        self.report_final(status_code, None, dialog);
        self.terminate();
    }

    fn resend(&mut self) -> bool {
        match self.transport.send(&self.bytes) {
            Ok(_) => true,
            Err(e) => {
                warn!("Retransmission failed: {}", e);
                self.fail(503);
                false
            }
        }
    }

    fn send_bytes(&self, bytes: &Bytes, what: &str) {
        if let Err(e) = self.transport.send(bytes) {
            warn!("{} not sent: {}", what, e);
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        let timers = self.agent.timers().clone();
        match (kind, self.state) {
            (TimerKind::A, TransactionState::Calling) => {
                if self.resend() {
                    self.retransmits += 1;
                    let delay = backoff(timers.t1(), self.retransmits, timers.transaction_timeout());
                    self.timers.start(TimerKind::A, delay, &self.queue);
                }
            }
            (TimerKind::B, TransactionState::Calling | TransactionState::Proceeding) => {
                info!("INVITE timed out (Timer B)");
                self.fail(408);
            }
            (TimerKind::E, TransactionState::Trying | TransactionState::Proceeding) => {
                if self.resend() {
                    self.retransmits += 1;
                    let delay = match self.state {
                        TransactionState::Proceeding => timers.t2(),
                        _ => backoff(timers.t1(), self.retransmits, timers.t2()),
                    };
                    self.timers.start(TimerKind::E, delay, &self.queue);
                }
            }
            (TimerKind::F, TransactionState::Trying | TransactionState::Proceeding) => {
                info!("Request timed out (Timer F)");
                self.fail(408);
            }
            (TimerKind::M, _) => {
                self.remove_unanswered_forks();
                self.terminate();
            }
            (TimerKind::D | TimerKind::K, _) => self.terminate(),
            (kind, state) => debug!(?kind, ?state, "Timer ignored"),
        }
    }

    fn on_invite_response(&mut self, response: SipResponse) {
        match (self.state, response.status_code) {
            (TransactionState::Calling | TransactionState::Proceeding, 100..=199) => {
                let timers = self.agent.timers().clone();
                self.timers.stop(TimerKind::A);
                self.timers.start(TimerKind::B, timers.proceeding_timeout(), &self.queue);
                self.set_state(TransactionState::Proceeding);

                let dialog = self.early_dialog(&response);
                let reliable = response.requires("100rel") && response.rseq().is_some();
                self.emit(ClientEvent::Provisional {
                    response,
                    dialog,
                    reliable,
                });

                if self.cancel_deferred {
                    self.cancel_deferred = false;
                    self.send_cancel();
                }
            }
            (
                TransactionState::Calling | TransactionState::Proceeding | TransactionState::Accepted,
                200..=299,
            ) => self.on_invite_success(response),
            (TransactionState::Calling | TransactionState::Proceeding, _) => self.on_invite_failure(response),
            (TransactionState::Completed, 300..) => {
                if let Some(ack) = &self.failure_ack {
                    debug!("Final retransmission, resending ACK");
                    self.send_bytes(ack, "ACK");
                }
            }
            (state, code) => debug!(?state, code, "Response discarded"),
        }
    }

    /// Early dialog for a 101-199 with a To tag, one per remote tag.
    fn early_dialog(&mut self, response: &SipResponse) -> Option<DialogHandle> {
        if response.status_code == 100 {
            return None;
        }
        let tag = response.to_tag()?;
        let dialogs = &self.agent.dialogs;

        if let Some(&handle) = self.forks.get(&tag) {
            if dialogs.with(handle, |d| d.target_refresh(response.contact_uri())).is_some() {
                return Some(handle);
            }
        }

        let dialog = Dialog::uac_from_response(&self.request, response)?;
        match dialogs.insert(dialog) {
            Ok(handle) => {
                self.forks.insert(tag, handle);
                Some(handle)
            }
            Err(e) => {
                debug!("Early dialog not created: {}", e);
                DialogId::from_response_uac(response).and_then(|id| dialogs.find(&id))
            }
        }
    }

    fn on_invite_success(&mut self, response: SipResponse) {
        let Some(tag) = response.to_tag() else {
            warn!("2xx without To tag discarded");
            return;
        };

        if self.answered.contains(&tag) {
            if let Some(ack) = self.acks.get(&tag) {
                debug!(%tag, "2xx retransmission, resending ACK");
                self.send_bytes(ack, "ACK");
            }
            return;
        }

        let Some(dialog) = self.confirm_dialog(&tag, &response) else {
            warn!(%tag, "2xx did not yield a dialog");
            return;
        };
        self.answered.insert(tag.clone());

        if self.final_reported {
            // Another fork answered; the caller already has its final
            info!(%tag, "Additional 2xx from forked INVITE, acknowledging");
            self.send_ack(dialog, None);
            return;
        }

        let timers = self.agent.timers().clone();
        self.timers.stop(TimerKind::A);
        self.timers.stop(TimerKind::B);
        self.set_state(TransactionState::Accepted);
        self.timers.start(TimerKind::M, timers.transaction_timeout(), &self.queue);
        self.report_final(response.status_code, Some(response), Some(dialog));
    }

    /// Promote the fork's early dialog, or create a confirmed one. A promoted
    /// dialog keeps the route set it was created with.
    fn confirm_dialog(&mut self, tag: &str, response: &SipResponse) -> Option<DialogHandle> {
        let dialogs = &self.agent.dialogs;
        if let Some(&handle) = self.forks.get(tag) {
            let contact = response.contact_uri();
            let promoted = dialogs.with(handle, |d| {
                d.confirm();
                d.target_refresh(contact);
            });
            if promoted.is_some() {
                return Some(handle);
            }
        }

        let dialog = Dialog::uac_from_response(&self.request, response)?;
        let handle = match dialogs.insert(dialog) {
            Ok(handle) => handle,
            Err(_) => dialogs.find(&DialogId::from_response_uac(response)?)?,
        };
        self.forks.insert(tag.to_string(), handle);
        Some(handle)
    }

    fn on_invite_failure(&mut self, response: SipResponse) {
        let timers = self.agent.timers().clone();
        self.timers.stop(TimerKind::A);
        self.timers.stop(TimerKind::B);

        let ack = self.failure_ack_for(&response).to_bytes();
        self.send_bytes(&ack, "ACK");
        self.failure_ack = Some(ack);

        self.set_state(TransactionState::Completed);
        let linger = match self.reliability {
            Reliability::Unreliable => timers.timer_d(),
            Reliability::Reliable => Duration::ZERO,
        };
        self.timers.start(TimerKind::D, linger, &self.queue);

        self.remove_unanswered_forks();
        self.report_final(response.status_code, Some(response), None);
    }

    /// ACK for a non-2xx final (RFC 3261 §17.1.1.3): same branch, the
    /// response's To.
    fn failure_ack_for(&self, response: &SipResponse) -> SipRequest {
        let mut ack = SipRequest::new(SipMethod::Ack, self.request.uri.clone());
        if let Some(via) = self.request.header("via") {
            ack.set_header("via", via);
        }
        for route in self.request.header_values("route") {
            ack.add_header("route", route.clone());
        }
        for name in ["from", "call-id"] {
            if let Some(value) = self.request.header(name) {
                ack.set_header(name, value);
            }
        }
        if let Some(to) = response.header("to").or_else(|| self.request.header("to")) {
            ack.set_header("to", to);
        }
        let seq = self.request.cseq().map(|c| c.seq).unwrap_or(1);
        ack.set_header("cseq", format!("{} ACK", seq));
        ack.set_header("max-forwards", "70");
        ack
    }

    fn remove_unanswered_forks(&mut self) {
        for (tag, handle) in &self.forks {
            if !self.answered.contains(tag) && self.agent.dialogs.remove_if_early(*handle) {
                debug!(%tag, "Early dialog discarded");
            }
        }
    }

    fn send_ack(&mut self, dialog: DialogHandle, body: Option<(String, Bytes)>) {
        if self.state != TransactionState::Accepted {
            debug!(state = ?self.state, "ACK requested outside Accepted, ignored");
            return;
        }
        let seq = self.request.cseq().map(|c| c.seq).unwrap_or(1);
        let Some((tag, mut ack)) = self
            .agent
            .dialogs
            .with(dialog, |d| (d.id.remote_tag.clone(), d.build_request(SipMethod::Ack, seq)))
        else {
            warn!(%dialog, "ACK for unknown dialog");
            return;
        };

        // The 2xx ACK is a transaction of its own
        if let Some(mut via) = self.request.top_via() {
            via.set_param("branch", Some(generate_branch()));
            ack.push_front_header("via", via.to_string());
        }
        if let Some((content_type, body)) = body {
            ack.set_header("content-type", content_type);
            ack.body = Some(body);
        }

        let bytes = ack.to_bytes();
        self.send_bytes(&bytes, "ACK");
        self.acks.insert(tag, bytes);
    }

    fn on_cancel(&mut self) {
        match self.state {
            TransactionState::Calling => {
                debug!("CANCEL held until a provisional arrives");
                self.cancel_deferred = true;
            }
            TransactionState::Proceeding if !self.cancel_sent => self.send_cancel(),
            state => debug!(?state, "CANCEL not applicable"),
        }
    }

    fn send_cancel(&mut self) {
        self.cancel_sent = true;
        let cancel = self.build_cancel();
        match self.agent.start_client(cancel, self.transport.clone()) {
            Ok((tx, _events)) => debug!(key = %tx.key(), "CANCEL sent"),
            Err(e) => warn!("CANCEL not started: {}", e),
        }
    }

    /// CANCEL (RFC 3261 §9.1): the INVITE's top Via, Request-URI, From, To,
    /// Call-ID, CSeq number and Route.
    fn build_cancel(&self) -> SipRequest {
        let mut cancel = SipRequest::new(SipMethod::Cancel, self.request.uri.clone());
        if let Some(via) = self.request.header("via") {
            cancel.set_header("via", via);
        }
        for route in self.request.header_values("route") {
            cancel.add_header("route", route.clone());
        }
        for name in ["from", "to", "call-id"] {
            if let Some(value) = self.request.header(name) {
                cancel.set_header(name, value);
            }
        }
        let seq = self.request.cseq().map(|c| c.seq).unwrap_or(1);
        cancel.set_header("cseq", format!("{} CANCEL", seq));
        cancel.set_header("max-forwards", "70");
        cancel
    }

    fn on_response(&mut self, response: SipResponse) {
        match (self.state, response.status_code) {
            (TransactionState::Trying | TransactionState::Proceeding, 100..=199) => {
                self.set_state(TransactionState::Proceeding);
                self.emit(ClientEvent::Provisional {
                    response,
                    dialog: None,
                    reliable: false,
                });
            }
            (TransactionState::Trying | TransactionState::Proceeding, code) => {
                let timers = self.agent.timers().clone();
                self.timers.stop(TimerKind::E);
                self.timers.stop(TimerKind::F);
                self.set_state(TransactionState::Completed);
                let linger = match self.reliability {
                    Reliability::Unreliable => timers.t4(),
                    Reliability::Reliable => Duration::ZERO,
                };
                self.timers.start(TimerKind::K, linger, &self.queue);

                let dialog = self.apply_final_hooks(code, Some(&response));
                self.report_final(code, Some(response), dialog);
            }
            (state, code) => debug!(?state, code, "Response discarded"),
        }
    }

    /// The dialog an in-dialog request was sent in.
    fn request_dialog(&self) -> Option<DialogHandle> {
        self.request.to_tag()?;
        let id = DialogId::from_request_uac(&self.request)?;
        self.agent.dialogs.find(&id)
    }

    /// Dialog and subscription bookkeeping for a non-INVITE final.
    fn apply_final_hooks(&mut self, status_code: u16, response: Option<&SipResponse>) -> Option<DialogHandle> {
        match self.request.method {
            SipMethod::Bye => {
                if let Some(dialog) = self.request_dialog() {
                    self.agent.dialogs.end_invite_usage(dialog);
                }
                None
            }
            SipMethod::Subscribe | SipMethod::Refer => self.subscription_final(status_code, response),
            SipMethod::Notify => {
                let dialog = self.request_dialog();
                let terminated = self
                    .request
                    .subscription_state()
                    .map(|s| s.is_terminated())
                    .unwrap_or(false);
                if status_code == 481 || ((200..300).contains(&status_code) && terminated) {
                    if let Some(subscription) = self.request_subscription() {
                        self.agent.subscriptions.remove(subscription, &self.agent.dialogs);
                    }
                }
                dialog.filter(|d| self.agent.dialogs.contains(*d))
            }
            _ => self.request_dialog(),
        }
    }

    fn event_of_request(&self) -> Option<(String, Option<String>)> {
        match self.request.method {
            SipMethod::Refer => Some((
                "refer".to_string(),
                self.request.cseq().map(|c| c.seq.to_string()),
            )),
            _ => self.request.event().map(|e| (e.event_type, e.id)),
        }
    }

    fn request_subscription(&self) -> Option<SubscriptionHandle> {
        let id = DialogId::from_request_uac(&self.request)?;
        let (event, event_id) = match self.request.method {
            SipMethod::Notify => self.request.event().map(|e| (e.event_type, e.id))?,
            _ => self.event_of_request()?,
        };
        self.agent
            .subscriptions
            .find(&SubscriptionId::new(id, &event, event_id.as_deref()))
    }

    fn subscription_final(&mut self, status_code: u16, response: Option<&SipResponse>) -> Option<DialogHandle> {
        let agent = self.agent.clone();
        match (status_code, response) {
            (200..=299, Some(response)) => {
                let (event, event_id) = self.event_of_request()?;
                let id = DialogId::from_response_uac(response)?;
                let dialog = match agent.dialogs.find(&id) {
                    Some(handle) => handle,
                    None => {
                        let dialog = Dialog::uac_from_response(&self.request, response)?;
                        agent.dialogs.insert(dialog).ok()?
                    }
                };

                let sub_id = SubscriptionId::new(id, &event, event_id.as_deref());
                let subscription = match agent.subscriptions.find(&sub_id) {
                    Some(handle) => handle,
                    None => {
                        let subscription = Subscription::new(sub_id, dialog, SubscriptionRole::Subscriber);
                        match agent.subscriptions.insert(subscription, &agent.dialogs) {
                            Ok(handle) => handle,
                            Err(e) => {
                                warn!("Subscription not recorded: {}", e);
                                return Some(dialog);
                            }
                        }
                    }
                };

                let expires = granted_expires(&agent.config, &self.request, Some(response));
                if expires == 0 && self.request.method == SipMethod::Subscribe {
                    info!("Unsubscribed");
                    agent.subscriptions.remove(subscription, &agent.dialogs);
                } else {
                    agent
                        .subscriptions
                        .with(subscription, |s| s.activate(Duration::from_secs(expires as u64)));
                }
                Some(dialog).filter(|d| agent.dialogs.contains(*d))
            }
            (481 | 408, _) => {
                if let Some(subscription) = self.request_subscription() {
                    agent.subscriptions.remove(subscription, &agent.dialogs);
                }
                self.request_dialog()
            }
            _ => self.request_dialog(),
        }
    }
}
