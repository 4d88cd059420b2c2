//! Admin message catalog.
//!
//! An admin payload is one discriminator byte followed by a MessagePack
//! array holding the variant's fields in declaration order.

use bytes::{BufMut, Bytes, BytesMut};
use kingdom_transport::{ConnectionMetadata, DeviceId};

use crate::discovery::Beacon;
use crate::error::KingdomError;
use crate::kingdom::Census;
use crate::types::ChannelId;

const BOW_DOWN_TO_NEW_KING: u8 = 1;
const PRONOUNCE_PRINCE: u8 = 2;
const ACK_PRONOUNCE_PRINCE: u8 = 3;
const PRINCE_FOUND_A_KING: u8 = 4;
const DISCOVERED_DEVICE: u8 = 5;
const CENSUS: u8 = 6;
const ADD_SUBSCRIPTION: u8 = 7;
const REMOVE_SUBSCRIPTION: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminMessage {
    /// The losing king tells its members to join `new_king`.
    BowDownToNewKing {
        new_king: DeviceId,
        metadata: Vec<ConnectionMetadata>,
    },
    PronouncePrince {
        prince: DeviceId,
    },
    AckPronouncePrince {
        prince: DeviceId,
        metadata: Vec<ConnectionMetadata>,
    },
    /// A prince reporting a competing king to its own king.
    PrinceFoundAKing {
        king: DeviceId,
        metadata: Vec<ConnectionMetadata>,
    },
    /// A member forwarding a beacon it overheard.
    DiscoveredDevice {
        beacon: Beacon,
    },
    Census {
        census: Census,
    },
    AddSubscription {
        device: DeviceId,
        channel: ChannelId,
    },
    RemoveSubscription {
        device: DeviceId,
        channel: ChannelId,
    },
}

impl AdminMessage {
    pub fn tag(&self) -> u8 {
        match self {
            AdminMessage::BowDownToNewKing { .. } => BOW_DOWN_TO_NEW_KING,
            AdminMessage::PronouncePrince { .. } => PRONOUNCE_PRINCE,
            AdminMessage::AckPronouncePrince { .. } => ACK_PRONOUNCE_PRINCE,
            AdminMessage::PrinceFoundAKing { .. } => PRINCE_FOUND_A_KING,
            AdminMessage::DiscoveredDevice { .. } => DISCOVERED_DEVICE,
            AdminMessage::Census { .. } => CENSUS,
            AdminMessage::AddSubscription { .. } => ADD_SUBSCRIPTION,
            AdminMessage::RemoveSubscription { .. } => REMOVE_SUBSCRIPTION,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            AdminMessage::BowDownToNewKing { .. } => "BowDownToNewKing",
            AdminMessage::PronouncePrince { .. } => "PronouncePrince",
            AdminMessage::AckPronouncePrince { .. } => "ACKPronouncePrince",
            AdminMessage::PrinceFoundAKing { .. } => "PrinceFoundAKing",
            AdminMessage::DiscoveredDevice { .. } => "DiscoveredDevice",
            AdminMessage::Census { .. } => "Census",
            AdminMessage::AddSubscription { .. } => "AddSubscription",
            AdminMessage::RemoveSubscription { .. } => "RemoveSubscription",
        }
    }

    /// Subscription bookkeeping rather than election traffic.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            AdminMessage::AddSubscription { .. } | AdminMessage::RemoveSubscription { .. }
        )
    }

    pub fn encode(&self) -> Result<Bytes, KingdomError> {
        let body = match self {
            AdminMessage::BowDownToNewKing { new_king, metadata } => {
                rmp_serde::to_vec(&(new_king, metadata))?
            }
            AdminMessage::PronouncePrince { prince } => rmp_serde::to_vec(&(prince,))?,
            AdminMessage::AckPronouncePrince { prince, metadata } => {
                rmp_serde::to_vec(&(prince, metadata))?
            }
            AdminMessage::PrinceFoundAKing { king, metadata } => {
                rmp_serde::to_vec(&(king, metadata))?
            }
            AdminMessage::DiscoveredDevice { beacon } => rmp_serde::to_vec(&(beacon,))?,
            AdminMessage::Census { census } => rmp_serde::to_vec(&(census,))?,
            AdminMessage::AddSubscription { device, channel }
            | AdminMessage::RemoveSubscription { device, channel } => {
                rmp_serde::to_vec(&(device, channel))?
            }
        };
        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(self.tag());
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, KingdomError> {
        let Some((&tag, body)) = payload.split_first() else {
            return Err(KingdomError::MalformedAdmin {
                reason: "empty admin payload".into(),
            });
        };
        let message = match tag {
            BOW_DOWN_TO_NEW_KING => {
                let (new_king, metadata) = rmp_serde::from_slice(body)?;
                AdminMessage::BowDownToNewKing { new_king, metadata }
            }
            PRONOUNCE_PRINCE => {
                let (prince,) = rmp_serde::from_slice(body)?;
                AdminMessage::PronouncePrince { prince }
            }
            ACK_PRONOUNCE_PRINCE => {
                let (prince, metadata) = rmp_serde::from_slice(body)?;
                AdminMessage::AckPronouncePrince { prince, metadata }
            }
            PRINCE_FOUND_A_KING => {
                let (king, metadata) = rmp_serde::from_slice(body)?;
                AdminMessage::PrinceFoundAKing { king, metadata }
            }
            DISCOVERED_DEVICE => {
                let (beacon,) = rmp_serde::from_slice(body)?;
                AdminMessage::DiscoveredDevice { beacon }
            }
            CENSUS => {
                let (census,) = rmp_serde::from_slice(body)?;
                AdminMessage::Census { census }
            }
            ADD_SUBSCRIPTION => {
                let (device, channel) = rmp_serde::from_slice(body)?;
                AdminMessage::AddSubscription { device, channel }
            }
            REMOVE_SUBSCRIPTION => {
                let (device, channel) = rmp_serde::from_slice(body)?;
                AdminMessage::RemoveSubscription { device, channel }
            }
            other => {
                return Err(KingdomError::MalformedAdmin {
                    reason: format!("unknown admin type {other}"),
                })
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use kingdom_transport::TransportKind;

    fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    #[test]
    fn first_byte_is_discriminator() {
        let msg = AdminMessage::PronouncePrince { prince: id("p") };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], PRONOUNCE_PRINCE);
        assert_eq!(AdminMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn every_variant_decodes_to_itself() {
        let meta = vec![ConnectionMetadata::new(TransportKind::Tcp, "10.0.0.2:7000")];
        let mut census = Census::crowned(id("k"));
        census.insert(id("p"), Role::Prince);
        let all = vec![
            AdminMessage::BowDownToNewKing {
                new_king: id("k2"),
                metadata: meta.clone(),
            },
            AdminMessage::PronouncePrince { prince: id("p") },
            AdminMessage::AckPronouncePrince {
                prince: id("p"),
                metadata: meta.clone(),
            },
            AdminMessage::PrinceFoundAKing {
                king: id("k3"),
                metadata: vec![],
            },
            AdminMessage::DiscoveredDevice {
                beacon: Beacon::new(id("d"), Role::King, meta),
            },
            AdminMessage::Census { census },
            AdminMessage::AddSubscription {
                device: id("d"),
                channel: 12,
            },
            AdminMessage::RemoveSubscription {
                device: id("d"),
                channel: 12,
            },
        ];
        for (i, msg) in all.into_iter().enumerate() {
            let bytes = msg.encode().unwrap();
            assert_eq!(bytes[0] as usize, i + 1);
            assert_eq!(AdminMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let err = AdminMessage::decode(&[42, 0x90]).unwrap_err();
        assert!(matches!(err, KingdomError::MalformedAdmin { .. }));
        assert!(AdminMessage::decode(&[]).is_err());
    }

    #[test]
    fn garbage_body_is_malformed() {
        let err = AdminMessage::decode(&[PRONOUNCE_PRINCE, 0xc1, 0xc1]).unwrap_err();
        assert!(matches!(err, KingdomError::MalformedAdmin { .. }));
    }
}
