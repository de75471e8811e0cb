// Subject-addressed cluster messages

use std::borrow::Cow;
use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Fixed string identifier that messages are routed by.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageSubject(Cow<'static, str>);

impl MessageSubject {
    pub const fn from_static(subject: &'static str) -> Self {
        Self(Cow::Borrowed(subject))
    }

    pub fn new(subject: impl Into<String>) -> Self {
        Self(Cow::Owned(subject.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MessageSubject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct ClusterMessage {
    pub sender: NodeId,
    pub subject: MessageSubject,
    pub payload: Bytes,
}

impl ClusterMessage {
    pub fn new(sender: NodeId, subject: MessageSubject, payload: Bytes) -> Self {
        Self {
            sender,
            subject,
            payload,
        }
    }
}
