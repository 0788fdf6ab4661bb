//! Identifiers, channel keys and resource descriptors shared by the session registries.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Channel type of the per-instance channel whose router pool exists from startup.
pub const INSTANCE_CHANNEL_TYPE: &str = "instance";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Opaque per-connection peer token.
    PeerId
);
uuid_id!(
    /// Media worker process.
    WorkerId
);
uuid_id!(
    /// Router hosted by a worker.
    RouterId
);
uuid_id!(
    /// WebRTC or direct transport.
    TransportId
);
uuid_id!(
    /// Media producer. Piped replicas keep the origin's id.
    ProducerId
);
uuid_id!(
    /// Media consumer.
    ConsumerId
);
uuid_id!(
    /// Data producer. Piped replicas keep the origin's id.
    DataProducerId
);
uuid_id!(
    /// Data consumer.
    DataConsumerId
);

/// Stable user identity, unchanged across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport direction from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Recv => f.write_str("recv"),
        }
    }
}

/// Media kind of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Logical channel: a router pool plus the transports and producers homed on it.
///
/// Every channel of type `instance` is the same channel; its id is dropped at
/// construction. Other channels are keyed by type and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    channel_type: String,
    channel_id: Option<String>,
}

impl ChannelKey {
    #[must_use]
    pub fn new(channel_type: impl Into<String>, channel_id: Option<String>) -> Self {
        let channel_type = channel_type.into();
        let channel_id = if channel_type == INSTANCE_CHANNEL_TYPE {
            None
        } else {
            channel_id
        };
        Self {
            channel_type,
            channel_id,
        }
    }

    /// The startup-created instance channel.
    #[must_use]
    pub fn instance() -> Self {
        Self::new(INSTANCE_CHANNEL_TYPE, None)
    }

    #[must_use]
    pub fn is_instance(&self) -> bool {
        self.channel_type == INSTANCE_CHANNEL_TYPE
    }

    #[must_use]
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    #[must_use]
    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    /// Bounded metrics label.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        if self.is_instance() {
            "instance"
        } else {
            "channel"
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.channel_id {
            Some(id) => write!(f, "{}:{id}", self.channel_type),
            None => f.write_str(&self.channel_type),
        }
    }
}

/// What a media producer carries, fixed when the producer is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSlotDescriptor {
    pub peer_id: PeerId,
    pub channel: ChannelKey,
    pub media_tag: String,
}

/// What a data producer carries, fixed when the producer is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelDescriptor {
    pub peer_id: PeerId,
    pub channel: ChannelKey,
    pub label: String,
}
