//! Dialogs (RFC 3261 §12) and the per-agent store that owns them.
//!
//! A dialog is shared between the transactions that drive it and the caller,
//! so it lives in an arena keyed by a small `DialogHandle`. Everything else
//! refers to it through that handle.

use crate::error::{Result, SipError};
use crate::headers::NameAddr;
use crate::utils::HeaderBuilder;
use crate::{MessageHeaders, SipMethod, SipRequest, SipResponse, SipUri};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(call_id: &str, local_tag: &str, remote_tag: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.to_string(),
        }
    }

    /// Identity of a received request as seen by the UAS: local = To tag.
    pub fn from_request_uas(request: &SipRequest) -> Option<Self> {
        Some(Self {
            call_id: request.call_id()?.to_string(),
            local_tag: request.to_tag().unwrap_or_default(),
            remote_tag: request.from_tag()?,
        })
    }

    /// Identity of a request this agent sends: local = From tag.
    pub fn from_request_uac(request: &SipRequest) -> Option<Self> {
        Some(Self {
            call_id: request.call_id()?.to_string(),
            local_tag: request.from_tag()?,
            remote_tag: request.to_tag().unwrap_or_default(),
        })
    }

    /// Identity of a received response as seen by the UAC: local = From tag.
    pub fn from_response_uac(response: &SipResponse) -> Option<Self> {
        Some(Self {
            call_id: response.call_id()?.to_string(),
            local_tag: response.from_tag()?,
            remote_tag: response.to_tag()?,
        })
    }

    /// Identity of a response this UAS sent.
    pub fn from_response_uas(response: &SipResponse) -> Option<Self> {
        Some(Self {
            call_id: response.call_id()?.to_string(),
            local_tag: response.to_tag()?,
            remote_tag: response.from_tag()?,
        })
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
}

/// Opaque caller state attached to a dialog (typically a media session).
#[derive(Clone, Default)]
pub struct SessionSlot(Option<Arc<dyn Any + Send + Sync>>);

impl SessionSlot {
    pub fn new<T: Any + Send + Sync>(session: T) -> Self {
        Self(Some(Arc::new(session)))
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().and_then(|session| session.downcast::<T>().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => write!(f, "SessionSlot(set)"),
            None => write!(f, "SessionSlot(empty)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub local_seq: u32,
    pub remote_seq: Option<u32>,
    /// Our party (From on the UAC side, To on the UAS side) without tag
    pub local_party: NameAddr,
    pub remote_party: NameAddr,
    pub local_target: Option<SipUri>,
    pub remote_target: SipUri,
    pub route_set: Vec<NameAddr>,
    pub secure: bool,
    pub session: SessionSlot,
    invite_usage: bool,
    subscription_usages: u32,
}

impl Dialog {
    /// Dialog state for the UAC from a 101-299 response to `request`.
    /// The route set is the Record-Route list reversed.
    pub fn uac_from_response(request: &SipRequest, response: &SipResponse) -> Option<Self> {
        let id = DialogId::from_response_uac(response)?;
        let cseq = request.cseq()?;
        let mut route_set = response.record_route();
        route_set.reverse();

        Some(Self {
            id,
            state: if response.is_success() {
                DialogState::Confirmed
            } else {
                DialogState::Early
            },
            local_seq: cseq.seq,
            remote_seq: None,
            local_party: request.from_addr()?.without_tag(),
            remote_party: response.to_addr()?.without_tag(),
            local_target: request.contact_uri(),
            remote_target: response
                .contact_uri()
                .unwrap_or_else(|| request.uri.clone()),
            route_set,
            secure: request.uri.is_secure(),
            session: SessionSlot::default(),
            invite_usage: request.method == SipMethod::Invite,
            subscription_usages: 0,
        })
    }

    /// Dialog state for the UAS from a dialog-creating request. The route set
    /// is the Record-Route list in received order.
    pub fn uas_from_request(
        request: &SipRequest,
        local_tag: &str,
        local_target: Option<SipUri>,
    ) -> Option<Self> {
        let cseq = request.cseq()?;
        let from = request.from_addr()?;
        let id = DialogId::new(request.call_id()?, local_tag, from.tag()?);

        Some(Self {
            id,
            state: DialogState::Early,
            local_seq: 0,
            remote_seq: Some(cseq.seq),
            local_party: request.to_addr()?.without_tag(),
            remote_target: request.contact_uri().unwrap_or_else(|| from.uri.clone()),
            remote_party: from.without_tag(),
            local_target,
            route_set: request.record_route(),
            secure: request.uri.is_secure(),
            session: SessionSlot::default(),
            invite_usage: request.method == SipMethod::Invite,
            subscription_usages: 0,
        })
    }

    /// Early→Confirmed, once. Returns whether the transition happened.
    pub fn confirm(&mut self) -> bool {
        if self.state == DialogState::Confirmed {
            return false;
        }
        self.state = DialogState::Confirmed;
        true
    }

    /// Replace the remote target when the Contact differs.
    pub fn target_refresh(&mut self, contact: Option<SipUri>) -> bool {
        match contact {
            Some(target) if target != self.remote_target => {
                debug!(dialog = %self.id, %target, "remote target refreshed");
                self.remote_target = target;
                true
            }
            _ => false,
        }
    }

    /// Validate and record the CSeq of an in-dialog request (RFC 3261 §12.2.2).
    pub fn accept_remote_seq(&mut self, seq: u32) -> bool {
        match self.remote_seq {
            Some(current) if seq < current => false,
            _ => {
                self.remote_seq = Some(seq);
                true
            }
        }
    }

    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq = self.local_seq.wrapping_add(1);
        self.local_seq
    }

    pub fn is_terminated(&self) -> bool {
        !self.invite_usage && self.subscription_usages == 0
    }

    pub fn usage_count(&self) -> u32 {
        self.invite_usage as u32 + self.subscription_usages
    }

    /// Build an in-dialog request (RFC 3261 §12.2.1.1). CSeq comes from the
    /// caller so ACK can reuse the INVITE's number.
    pub fn build_request(&self, method: SipMethod, seq: u32) -> SipRequest {
        let (uri, routes) = self.request_target();
        let to = if self.id.remote_tag.is_empty() {
            self.remote_party.clone()
        } else {
            self.remote_party.clone().with_tag(&self.id.remote_tag)
        };

        let mut headers = HeaderBuilder::new();
        for route in routes {
            headers = headers.header("route", &route.to_string());
        }
        headers = headers
            .header("from", &self.local_party.clone().with_tag(&self.id.local_tag).to_string())
            .header("to", &to.to_string())
            .call_id(&self.id.call_id)
            .cseq(seq, &method)
            .max_forwards(70);
        if let Some(contact) = self.local_target.as_ref().filter(|_| method.is_target_refresh()) {
            headers = headers.contact(contact);
        }
        headers.request(method, uri)
    }

    /// Request-URI and Route list; a strict-routing first hop takes the
    /// Request-URI and the remote target goes last.
    fn request_target(&self) -> (SipUri, Vec<NameAddr>) {
        match self.route_set.first() {
            Some(first) if !first.uri.is_loose_router() => {
                let mut routes: Vec<NameAddr> = self.route_set[1..].to_vec();
                routes.push(NameAddr::new(self.remote_target.clone()));
                (first.uri.clone(), routes)
            }
            _ => (self.remote_target.clone(), self.route_set.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DialogHandle(u64);

impl fmt::Display for DialogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dialog#{}", self.0)
    }
}

#[derive(Default)]
struct DialogTable {
    next_handle: u64,
    dialogs: AHashMap<DialogHandle, Dialog>,
    index: AHashMap<DialogId, DialogHandle>,
}

impl DialogTable {
    fn remove(&mut self, handle: DialogHandle) -> Option<Dialog> {
        let dialog = self.dialogs.remove(&handle)?;
        self.index.remove(&dialog.id);
        debug!(dialog = %dialog.id, "dialog removed");
        Some(dialog)
    }
}

/// Arena of dialogs keyed by handle, indexed by identity.
#[derive(Default)]
pub struct DialogStore {
    table: Mutex<DialogTable>,
}

impl DialogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dialog; an identity may only be present once.
    pub fn insert(&self, dialog: Dialog) -> Result<DialogHandle> {
        let mut table = self.table.lock();
        if table.index.contains_key(&dialog.id) {
            return Err(SipError::DialogExists);
        }
        table.next_handle += 1;
        let handle = DialogHandle(table.next_handle);
        debug!(dialog = %dialog.id, state = ?dialog.state, "dialog created");
        table.index.insert(dialog.id.clone(), handle);
        table.dialogs.insert(handle, dialog);
        Ok(handle)
    }

    pub fn find(&self, id: &DialogId) -> Option<DialogHandle> {
        self.table.lock().index.get(id).copied()
    }

    /// Snapshot of a dialog.
    pub fn get(&self, handle: DialogHandle) -> Option<Dialog> {
        self.table.lock().dialogs.get(&handle).cloned()
    }

    pub fn contains(&self, handle: DialogHandle) -> bool {
        self.table.lock().dialogs.contains_key(&handle)
    }

    /// Mutate a dialog under the store lock. The closure must not call back
    /// into the store.
    pub fn with<R>(&self, handle: DialogHandle, f: impl FnOnce(&mut Dialog) -> R) -> Option<R> {
        self.table.lock().dialogs.get_mut(&handle).map(f)
    }

    pub fn remove(&self, handle: DialogHandle) -> Option<Dialog> {
        self.table.lock().remove(handle)
    }

    /// Remove the dialog only if it never left Early.
    pub fn remove_if_early(&self, handle: DialogHandle) -> bool {
        let mut table = self.table.lock();
        match table.dialogs.get(&handle) {
            Some(dialog) if dialog.state == DialogState::Early => table.remove(handle).is_some(),
            _ => false,
        }
    }

    pub fn set_session(&self, handle: DialogHandle, session: SessionSlot) -> Result<()> {
        self.with(handle, |dialog| dialog.session = session)
            .ok_or(SipError::NoSuchDialog)
    }

    /// End the INVITE usage; the dialog goes when no usage remains.
    pub fn end_invite_usage(&self, handle: DialogHandle) {
        let mut table = self.table.lock();
        let Some(dialog) = table.dialogs.get_mut(&handle) else {
            return;
        };
        dialog.invite_usage = false;
        if dialog.is_terminated() {
            table.remove(handle);
        }
    }

    pub fn add_subscription_usage(&self, handle: DialogHandle) -> Result<()> {
        self.with(handle, |dialog| dialog.subscription_usages += 1)
            .ok_or(SipError::NoSuchDialog)
    }

    pub fn end_subscription_usage(&self, handle: DialogHandle) {
        let mut table = self.table.lock();
        let Some(dialog) = table.dialogs.get_mut(&handle) else {
            return;
        };
        dialog.subscription_usages = dialog.subscription_usages.saturating_sub(1);
        if dialog.is_terminated() {
            table.remove(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<DialogHandle> {
        let mut handles: Vec<DialogHandle> = self.table.lock().dialogs.keys().copied().collect();
        handles.sort();
        handles
    }
}
