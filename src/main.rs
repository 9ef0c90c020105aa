// main.rs - Demo SIP user agent: registrar, OPTIONS responder, auto-answer and presence

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use sip_agent_rs::{
    transport::{SipTransport, TransportConfig, TransportEvent},
    Agent, AgentConfig, MessageHeaders, Reply, RequestHandler, ServerTransaction, SessionSlot,
    SipRequest, Subscription,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ANSWER_DELAY: Duration = Duration::from_secs(1);
const REGISTRATION_EXPIRES: u32 = 3600;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    transport: TransportConfig,
    agent: AgentConfig,
}

impl Config {
    /// JSON file named by SIP_AGENT_CONFIG, then address overrides.
    fn load() -> Result<Self> {
        let mut config = match std::env::var("SIP_AGENT_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path))?;
                serde_json::from_str(&raw).with_context(|| format!("Invalid config in {}", path))?
            }
            Err(_) => Config::default(),
        };

        if let Ok(udp_addr) = std::env::var("SIP_UDP_ADDR") {
            config.transport.udp_listen_addr = udp_addr.parse()?;
        }
        if let Ok(tcp_addr) = std::env::var("SIP_TCP_ADDR") {
            config.transport.tcp_listen_addr = tcp_addr.parse()?;
        }
        Ok(config)
    }
}

/// Per-call state kept on the dialog
#[derive(Debug)]
struct Call {
    caller: String,
}

/// Answers every call after a short ring and keeps a registrar table.
#[derive(Default)]
struct DemoHandler {
    registrations: Mutex<HashMap<String, String>>,
}

impl RequestHandler for DemoHandler {
    fn on_register(&self, _agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        let (Some(aor), Some(contact)) = (request.to_addr(), request.contact_uri()) else {
            reply(tx, Reply::new(400));
            return;
        };

        let expires = request.expires().unwrap_or(REGISTRATION_EXPIRES);
        let aor = aor.uri.to_string();
        if expires == 0 {
            self.registrations.lock().remove(&aor);
            info!("Unregistered {}", aor);
        } else {
            self.registrations.lock().insert(aor.clone(), contact.to_string());
            info!("Registered {} at {}", aor, contact);
        }

        reply(
            tx,
            Reply::new(200)
                .header("contact", format!("<{}>;expires={}", contact, expires))
                .header("expires", expires.to_string()),
        );
    }

    fn on_invite(&self, agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        let caller = request
            .from_addr()
            .map(|from| from.uri.to_string())
            .unwrap_or_default();
        info!("Incoming call from {}", caller);

        if let Some(dialog) = tx.dialog() {
            if let Err(e) = agent.set_session(dialog, SessionSlot::new(Call { caller })) {
                warn!("Session not attached: {}", e);
            }
        }
        reply(tx, Reply::new(180));

        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ANSWER_DELAY).await;
            let answer = Reply::new(200).body("application/sdp", demo_sdp());
            if let Err(e) = tx.respond(answer) {
                debug!("Call gone before answer: {}", e);
            }
        });
    }

    fn on_ack(&self, agent: &Agent, _ack: &SipRequest, invite: &ServerTransaction) {
        let caller = invite
            .dialog()
            .and_then(|dialog| agent.dialogs().get(dialog))
            .and_then(|dialog| dialog.session.get::<Call>())
            .map(|call| call.caller.clone())
            .unwrap_or_default();
        info!("Call with {} established", caller);
    }

    fn on_bye(&self, _agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        info!("Call {} ended", request.call_id().unwrap_or("?"));
        reply(tx, Reply::new(200));
    }

    fn on_subscribe(&self, _agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        let event = request.event().map(|e| e.event_type).unwrap_or_default();
        if event != "presence" {
            reply(tx, Reply::new(489));
            return;
        }
        reply(tx, Reply::new(200));
    }

    fn on_message(&self, _agent: &Agent, request: &SipRequest, tx: &ServerTransaction) {
        let text = request
            .body
            .as_ref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
            .unwrap_or_default();
        info!("MESSAGE: {}", text);
        reply(tx, Reply::new(200));
    }

    fn on_subscription_expired(&self, _agent: &Agent, subscription: &Subscription) {
        info!("Subscription {} expired", subscription.id);
    }
}

fn reply(tx: &ServerTransaction, reply: Reply) {
    if let Err(e) = tx.respond(reply) {
        warn!("Reply not queued: {}", e);
    }
}

fn demo_sdp() -> Bytes {
    Bytes::from_static(
        b"v=0\r\n\
          o=- 0 0 IN IP4 0.0.0.0\r\n\
          s=sip-agent\r\n\
          c=IN IP4 0.0.0.0\r\n\
          t=0 0\r\n\
          m=audio 0 RTP/AVP 0\r\n",
    )
}

fn handle_event(agent: &Agent, event: TransportEvent) {
    match event {
        TransportEvent::MessageReceived {
            message,
            source,
            protocol,
            transport,
        } => {
            debug!("Received message from {} via {}", source, protocol);
            agent.input(message, transport);
        }
        TransportEvent::ConnectionEstablished { peer, protocol } => {
            info!("Connection established with {} via {}", peer, protocol);
        }
        TransportEvent::ConnectionClosed { peer, protocol } => {
            info!("Connection closed with {} via {}", peer, protocol);
        }
        TransportEvent::Error { error, peer } => {
            error!("Transport error from {:?}: {}", peer, error);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sip_agent_rs=debug,sip_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SIP agent");

    let config = Config::load()?;
    let (mut transport, event_rx) = SipTransport::bind(config.transport).await?;
    let agent = Agent::new(config.agent, Arc::new(DemoHandler::default()))?;
    let listeners = transport.start();

    info!("SIP agent started on UDP {}", transport.udp_local_addr()?);

    let mut events = UnboundedReceiverStream::new(event_rx);
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => handle_event(&agent, event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    for listener in listeners {
        listener.abort();
    }

    Ok(())
}
