//! Community key distribution
//!
//! The control node of a community turns a resolved set of key actions into
//! key-exchange messages: one per hash-ratchet group with a non-`None`
//! action, addressed to that group's members. Receivers install the key and
//! replay any ciphertext they were holding for it.

use crate::crypto::{self, GroupKey, HashRatchet};
use crate::protocol::{KeyExchange, KeyExchangeKind};
use crate::storage::chat::community_chat_id;
use crate::{Error, MergeOutcome, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use tracing::{debug, info, warn};

/// Key action required for one hash-ratchet group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeyActionType {
    /// Nothing to do
    #[default]
    None,
    /// Group gained encryption; establish a key
    Add,
    /// Rotate the key (member removed, or key too old)
    Rekey,
    /// Share the current key with new members
    SendToMembers,
}

/// Key action plus the members it concerns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeyAction {
    /// What to do
    pub action_type: KeyActionType,
    /// Public keys of the recipients
    pub members: BTreeSet<String>,
}

impl KeyAction {
    /// Action of `action_type` for `members`
    pub fn new<I, S>(action_type: KeyActionType, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action_type,
            members: members.into_iter().map(Into::into).collect(),
        }
    }
}

/// Resolved key actions of a community and its channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EncryptionKeyActions {
    /// Action for the community-wide group
    pub community: KeyAction,
    /// Actions per channel ID
    pub channels: BTreeMap<String, KeyAction>,
}

/// Community as seen by the key distributor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    /// Community public key
    pub id: String,
    /// Public key of the control node
    pub control_node: String,
    /// Members of the community
    pub members: BTreeSet<String>,
    /// Channel IDs with their own encryption
    pub encrypted_channels: BTreeSet<String>,
    /// Whether the community-wide group is encrypted
    pub encrypted: bool,
}

impl Community {
    /// Hash-ratchet group of a channel
    pub fn channel_group_id(&self, channel_id: &str) -> String {
        community_chat_id(&self.id, channel_id)
    }

    /// Whether `public_key` controls this community
    pub fn is_control_node(&self, public_key: &str) -> bool {
        self.control_node == public_key
    }
}

/// One key-exchange message to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedExchange {
    /// Target group
    pub group_id: String,
    /// Rekey or reuse
    pub kind: KeyExchangeKind,
    /// Recipient public keys, sorted
    pub recipients: Vec<String>,
}

/// Report of a completed distribution
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DistributionReport {
    /// Exchanges sent, in order
    pub sent: Vec<KeyExchange>,
}

/// Sends key-exchange messages on behalf of the distributor
pub trait KeyExchangeSender: Send + Sync {
    /// Sign and broadcast a key exchange
    fn send_key_exchange(&self, exchange: &KeyExchange) -> impl Future<Output = Result<()>> + Send;
}

fn kind_for(action_type: KeyActionType) -> Option<KeyExchangeKind> {
    match action_type {
        KeyActionType::None => None,
        KeyActionType::Add | KeyActionType::Rekey => Some(KeyExchangeKind::Rekey),
        KeyActionType::SendToMembers => Some(KeyExchangeKind::Reuse),
    }
}

/// Turn key actions into an ordered list of exchanges
///
/// The community group comes first, then channels in ID order. `local` is
/// never a recipient of its own exchange.
///
/// # Errors
/// * `Error::NotControlNode` - `local` does not control the community
/// * `Error::Validation` - a member key is malformed
pub fn plan(
    local: &str,
    community: &Community,
    actions: &EncryptionKeyActions,
) -> Result<Vec<PlannedExchange>> {
    if !community.is_control_node(local) {
        return Err(Error::NotControlNode {
            community_id: community.id.clone(),
        });
    }

    let groups = std::iter::once((community.id.clone(), &actions.community)).chain(
        actions
            .channels
            .iter()
            .map(|(channel_id, action)| (community.channel_group_id(channel_id), action)),
    );

    let mut planned = Vec::new();
    for (group_id, action) in groups {
        let Some(kind) = kind_for(action.action_type) else {
            continue;
        };

        let mut recipients = Vec::with_capacity(action.members.len());
        for member in &action.members {
            crypto::validate_public_key(member)?;
            if member != local {
                recipients.push(member.clone());
            }
        }

        planned.push(PlannedExchange {
            group_id,
            kind,
            recipients,
        });
    }
    Ok(planned)
}

/// Distribute keys for a community
///
/// Sends exactly one key exchange per group with a non-`None` action. The
/// first failed send aborts the remaining groups; exchanges already sent are
/// not retracted. Retrying the whole call is safe since receivers treat a
/// known key generation as stale.
pub async fn distribute<S: KeyExchangeSender>(
    local: &str,
    community: &Community,
    actions: &EncryptionKeyActions,
    ratchet: &dyn HashRatchet,
    sender: &S,
    now_ms: u64,
) -> Result<DistributionReport> {
    let planned = plan(local, community, actions)?;
    let mut report = DistributionReport::default();

    for exchange in planned {
        let key = match exchange.kind {
            KeyExchangeKind::Rekey => ratchet.rekey(&exchange.group_id, now_ms)?,
            KeyExchangeKind::Reuse => match ratchet.current_key(&exchange.group_id)? {
                Some(key) => key,
                None => {
                    warn!("No key to reuse for group {}, generating one", exchange.group_id);
                    ratchet.rekey(&exchange.group_id, now_ms)?
                }
            },
        };

        let message = KeyExchange {
            community_id: community.id.clone(),
            group_id: exchange.group_id.clone(),
            kind: exchange.kind,
            key_id: key.key_id,
            sealed_key: ratchet.seal_key(&key, &exchange.recipients)?,
            recipients: exchange.recipients,
        };

        if let Err(e) = sender.send_key_exchange(&message).await {
            warn!(
                "Key distribution for {} aborted at group {}: {}",
                community.id, message.group_id, e
            );
            return Err(e);
        }

        info!(
            "Sent {:?} key {} for group {} to {} members",
            message.kind,
            message.key_id,
            message.group_id,
            message.recipients.len()
        );
        report.sent.push(message);
    }

    Ok(report)
}

/// Install a key received in a key exchange
///
/// # Errors
/// * `Error::Authority` - the exchange was not sent by the control node
/// * `Error::Validation` - the sealed key does not belong to the announced group
pub fn receive(
    exchange: &KeyExchange,
    sender: &str,
    community: &Community,
    ratchet: &dyn HashRatchet,
) -> Result<(GroupKey, MergeOutcome)> {
    if !community.is_control_node(sender) {
        return Err(Error::Authority(format!(
            "{} is not the control node of {}",
            sender, community.id
        )));
    }

    let key = ratchet.open_key(&exchange.sealed_key)?;
    if key.group_id != exchange.group_id || key.key_id != exchange.key_id {
        return Err(Error::Validation(format!(
            "key exchange for {} carries key {}#{}",
            exchange.group_id, key.group_id, key.key_id
        )));
    }

    let outcome = ratchet.install_key(key.clone())?;
    debug!("Installed key {} for group {}: {:?}", key.key_id, key.group_id, outcome);
    Ok((key, outcome))
}

/// Rekey actions for groups whose current key is older than `interval_ms`
///
/// Groups without a key yet get an `Add` action.
pub fn rekey_due(
    community: &Community,
    ratchet: &dyn HashRatchet,
    now_ms: u64,
    interval_ms: u64,
) -> Result<EncryptionKeyActions> {
    let action_for = |group_id: &str, members: &BTreeSet<String>| -> Result<KeyAction> {
        let action_type = match ratchet.current_key(group_id)? {
            None => KeyActionType::Add,
            Some(key) if now_ms.saturating_sub(key.timestamp) >= interval_ms => {
                KeyActionType::Rekey
            }
            Some(_) => KeyActionType::None,
        };
        Ok(KeyAction {
            action_type,
            members: members.clone(),
        })
    };

    let mut actions = EncryptionKeyActions::default();
    if community.encrypted {
        actions.community = action_for(&community.id, &community.members)?;
    }
    for channel_id in &community.encrypted_channels {
        let action = action_for(&community.channel_group_id(channel_id), &community.members)?;
        if action.action_type != KeyActionType::None {
            actions.channels.insert(channel_id.clone(), action);
        }
    }
    Ok(actions)
}
