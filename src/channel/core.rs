//! Wires the link table, the handshake state machines, the origin-message
//! engine, and the resource registry into one inbound request path
//! (`spec.md` §4.9).

use std::collections::HashMap;

use tracing::warn;

use crate::coap::{self, CoapCode, CoapMessage, CoapType, NonceState};
use crate::config::{ChannelRole, Config};
use crate::error::{ChannelError, OriginApplyOutcome};
use crate::events::ChannelEvent;
use crate::host::{Host, NxId};
use crate::link::{HandshakeAccessory, HandshakeController, Link, LinkManager};
use crate::nv::RawNv;
use crate::om::{ControllerAction, OriginCommand, OriginMessageEngine};

use super::registry::ResourceRegistry;

const LINK_RESOURCE_PATH: &str = "channel/link";

/// The channel subsystem: link table, in-flight handshakes, origin-message
/// engine, and the resource registry inbound requests are routed through.
#[derive(Debug)]
pub struct ChannelCore {
    links: LinkManager,
    nonce_states: HashMap<NxId, NonceState>,
    pending_controllers: HashMap<NxId, HandshakeController>,
    pending_accessories: HashMap<NxId, HandshakeAccessory>,
    pub origin: OriginMessageEngine,
    pub registry: ResourceRegistry,
}

impl ChannelCore {
    #[must_use]
    pub fn new(config: &Config, nv: &dyn RawNv) -> Self {
        let links = LinkManager::new(
            config.max_simultaneous_links as usize,
            config.link_timeout_seconds,
            config.channel_role,
            nv,
        );
        // Seed nonce tracking from whatever the link table persisted, so a
        // restart doesn't regress to accepting nonces the peer has already
        // moved past (`spec.md` §3.5 "nonce is strictly non-decreasing").
        let nonce_states = links
            .iter()
            .map(|l| (l.peer, NonceState::from_persisted(l.nonce)))
            .collect();
        Self {
            links,
            nonce_states,
            pending_controllers: HashMap::new(),
            pending_accessories: HashMap::new(),
            origin: OriginMessageEngine::new(nv),
            registry: ResourceRegistry::new(),
        }
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn links(&self) -> &LinkManager {
        &self.links
    }

    /// Initiates the controller side of a handshake with `peer`, returning
    /// the challenge bytes to send over `network_send`.
    pub fn start_handshake(&mut self, peer: NxId, host: &dyn Host) -> u32 {
        let challenge = host.random_value();
        self.pending_controllers
            .insert(peer, HandshakeController::new(peer, challenge, host.uptime_seconds()));
        host.notify_event(ChannelEvent::LinkHandshakeStarted);
        challenge
    }

    /// Handles one inbound authenticated (or, for the handshake resource,
    /// plaintext) network datagram.
    pub fn network_receive(
        &mut self,
        bytes: &[u8],
        src: NxId,
        host: &dyn Host,
        nv: &dyn RawNv,
    ) -> Result<(), ChannelError> {
        let request = coap::decode(bytes)?;
        let path = request.uri_path();

        if path == LINK_RESOURCE_PATH {
            self.handle_handshake_message(&request, src, host, nv);
            return Ok(());
        }

        let link = self.links.find(src).cloned();
        let Some(link) = link else {
            return Err(ChannelError::Auth(crate::error::AuthOutcome::SenderDeviceNotLinked));
        };
        let nonce_state = self.nonce_states.entry(src).or_default();
        let (payload, _outcome) = coap::unseal(&link.key, &request.payload, nonce_state)
            .map_err(ChannelError::Auth)?;
        self.links.refresh(src, host.uptime_seconds());

        let mut inner = request.clone();
        inner.payload = payload;
        let (code, response_body) = self.registry.dispatch(&inner);
        if code.class() >= 4 {
            warn!(?src, ?code, "resource handler returned an error");
        }

        let response = CoapMessage {
            msg_type: CoapType::Acknowledgement,
            code,
            message_id: request.message_id,
            token: request.token,
            options: Vec::new(),
            payload: response_body,
        };
        let reply_nonce = self.nonce_states.entry(src).or_default().highest_seen().wrapping_add(1);
        let sealed = coap::seal(&link.key, reply_nonce, &coap::encode(&response));
        self.links.set_nonce(src, reply_nonce, nv);
        host.network_send(&sealed, host.get_nexus_id(), src, false);
        Ok(())
    }

    fn handle_handshake_message(&mut self, request: &CoapMessage, src: NxId, host: &dyn Host, nv: &dyn RawNv) {
        let provisioning_key = host.secret_key();
        match request.payload.first() {
            Some(0) if request.payload.len() == 5 => {
                // Challenge from a controller: [0][challenge:4 LE].
                let challenge = u32::from_le_bytes(request.payload[1..5].try_into().unwrap());
                let salt = core::array::from_fn(|i| (host.random_value() >> (i % 4 * 8)) as u8);
                let (accessory, salt_out, mac) =
                    HandshakeAccessory::on_challenge(&provisioning_key, src, challenge, salt, host.uptime_seconds());
                self.pending_accessories.insert(src, accessory);
                let mut reply = vec![1u8];
                reply.extend_from_slice(&salt_out);
                reply.extend_from_slice(&mac.to_le_bytes());
                host.network_send(&reply, host.get_nexus_id(), src, false);
            }
            Some(1) if request.payload.len() == 17 => {
                // Salt response from an accessory: [1][salt:8][mac:8 LE].
                let salt: [u8; 8] = request.payload[1..9].try_into().unwrap();
                let mac = u64::from_le_bytes(request.payload[9..17].try_into().unwrap());
                if let Some(controller) = self.pending_controllers.get_mut(&src) {
                    if let Some(confirm) = controller.on_salt_response(&provisioning_key, salt, mac) {
                        let mut reply = vec![2u8];
                        reply.extend_from_slice(&confirm);
                        host.network_send(&reply, host.get_nexus_id(), src, false);
                    }
                }
            }
            Some(2) if request.payload.len() == 9 => {
                // Inverted-salt confirmation from a controller: [2][salt:8].
                let inverted: [u8; 8] = request.payload[1..9].try_into().unwrap();
                if let Some(mut accessory) = self.pending_accessories.remove(&src) {
                    if let Some(key) = accessory.on_confirm(inverted) {
                        self.install_link(src, key, ChannelRole::Accessory, host, nv);
                        host.network_send(&[3u8], host.get_nexus_id(), src, false);
                    }
                }
            }
            Some(3) => {
                // Final ack: controller completes.
                if let Some(mut controller) = self.pending_controllers.remove(&src) {
                    if let Some(key) = controller.on_confirm_ack() {
                        self.install_link(src, key, ChannelRole::Controller, host, nv);
                    }
                }
            }
            _ => warn!(?src, "malformed handshake message"),
        }
    }

    fn install_link(
        &mut self,
        peer: NxId,
        key: keylink_crypto::CheckKey,
        role: ChannelRole,
        host: &dyn Host,
        nv: &dyn RawNv,
    ) {
        let now = host.uptime_seconds();
        let link = Link {
            peer,
            key,
            role,
            established_at: now,
            last_refreshed: now,
            nonce: 0,
        };
        match self.links.create(link, nv) {
            Ok(()) => {
                let evt = if role == ChannelRole::Controller {
                    ChannelEvent::LinkEstablishedAsController
                } else {
                    ChannelEvent::LinkEstablishedAsAccessory
                };
                host.notify_event(evt);
            }
            Err(e) => warn!(?peer, error = %e, "could not install link"),
        }
    }

    /// Applies one authenticated origin-message command (`spec.md` §4.6.3
    /// -4.6.6). `GenericControllerAction` is applied directly against the
    /// link table; the two `AccessoryAction*` commands are forwarded,
    /// still MAC-sealed, to whichever linked accessory's device id matches
    /// the transmitted truncated id, which decodes and applies them with
    /// its own origin engine instance. `CreateLinkMode3` is authenticated
    /// and accepted but otherwise a no-op here: inviting a not-yet-linked
    /// accessory into a mode-3 handshake needs a multicast rendezvous this
    /// transport doesn't model (see `DESIGN.md`).
    pub fn handle_origin_command(&mut self, frame: &[u8], host: &dyn Host, nv: &dyn RawNv) -> OriginApplyOutcome {
        let Some((full_id, command)) = self.origin.authenticate(frame, host) else {
            return OriginApplyOutcome::ActionRejected;
        };

        match command {
            OriginCommand::CreateLinkMode3 { .. } => {}
            OriginCommand::GenericControllerAction(ControllerAction::UnlinkAllLinkedAccessories) => {
                let peers: Vec<NxId> = self.links.iter().map(|l| l.peer).collect();
                for peer in peers {
                    self.links.delete(peer, nv);
                    self.nonce_states.remove(&peer);
                    host.notify_event(ChannelEvent::LinkDeleted);
                }
            }
            OriginCommand::AccessoryActionUnlock { truncated_device_id }
            | OriginCommand::AccessoryActionUnlink { truncated_device_id } => {
                let target = self
                    .links
                    .iter()
                    .find(|l| (l.peer.device % 10) as u8 == truncated_device_id)
                    .map(|l| l.peer);
                match target {
                    Some(peer) => {
                        let key = self.links.find(peer).expect("just matched").key;
                        let nonce_state = self.nonce_states.entry(peer).or_default();
                        let sealed = coap::seal(&key, nonce_state.highest_seen().wrapping_add(1), frame);
                        host.network_send(&sealed, host.get_nexus_id(), peer, false);
                    }
                    None => warn!(truncated_device_id, "origin command targets an unlinked accessory"),
                }
            }
        }

        self.origin.accept(full_id, nv);
        OriginApplyOutcome::Applied
    }

    /// Driven by the scheduler: expires stale links and in-flight
    /// handshakes. Returns seconds until this subsystem next needs
    /// attention.
    pub fn process(&mut self, host: &dyn Host, nv: &dyn RawNv) -> u32 {
        let now = host.uptime_seconds();
        for peer in self.links.expire(now, nv) {
            host.notify_event(ChannelEvent::LinkDeleted);
            self.nonce_states.remove(&peer);
        }
        self.pending_controllers.retain(|_, c| {
            c.tick(now);
            !matches!(c.state(), crate::link::ControllerState::TimedOut)
        });
        self.pending_accessories.retain(|_, a| {
            a.tick(now);
            !matches!(a.state(), crate::link::AccessoryState::TimedOut)
        });
        self.links.seconds_until_next_expiry(now).unwrap_or(3600).max(1)
    }
}

