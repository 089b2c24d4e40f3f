// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire schema of the subscriber stream.
//!
//! Every downstream frame is a tagged tuple: a tag string followed by one or
//! two JSON objects, e.g. `["begin", {"tag": "begin"}, {"commitWatermark":
//! "08"}]`. Tuples cannot be expressed with derived serde on an enum, so the
//! frame codec is written by hand.

use std::fmt;

use serde::{
    de::{self, SeqAccess, Visitor},
    ser::SerializeSeq,
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::{
    change::{Change, ControlSignal, DataChange, Watermark},
    error::ReplicationError,
};

/// Protocol version spoken by this task. The subscription endpoint embeds the
/// major version; anything outside the supported range is rejected before a
/// subscriber is registered.
pub const PROTOCOL_VERSION: u32 = 3;
pub const MIN_PROTOCOL_VERSION: u32 = 2;

pub fn check_protocol_version(version: u32) -> Result<(), ReplicationError> {
    if (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        return Ok(());
    }
    Err(ReplicationError::Protocol(format!(
        "unsupported protocol version {version} (supported: {MIN_PROTOCOL_VERSION} to {PROTOCOL_VERSION})"
    )))
}

/// How a subscriber consumes the stream: `serving` replicas answer queries,
/// `backup` replicas only maintain a warm copy and escalate harder on falling
/// behind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriberMode {
    Serving,
    Backup,
}

/// Parameters a subscriber presents when opening a stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub protocol_version: u32,
    pub id: String,
    pub mode: SubscriberMode,
    pub replica_version: Watermark,
    pub watermark: Watermark,
    pub initial: bool,
}

/// Error payload of a terminal `error` frame.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ErrorKind {
    WatermarkTooOld,
    WrongReplicaVersion,
    AutoReset,
    Protocol,
    Internal,
}

impl From<&ReplicationError> for ErrorBody {
    fn from(err: &ReplicationError) -> Self {
        let kind = match err {
            ReplicationError::WatermarkTooOld { .. } => ErrorKind::WatermarkTooOld,
            ReplicationError::WrongReplicaVersion { .. } => ErrorKind::WrongReplicaVersion,
            ReplicationError::AutoReset(_) => ErrorKind::AutoReset,
            ReplicationError::Protocol(_) | ReplicationError::Malformed(_) => ErrorKind::Protocol,
            _ => ErrorKind::Internal,
        };
        ErrorBody {
            kind,
            message: err.to_string(),
        }
    }
}

/// Acknowledgement sent to the upstream source. Commit acks are only emitted
/// after the commit is durable in the change log; status acks carry no
/// durability obligation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum Ack {
    Commit { watermark: Watermark },
    Status { watermark: Watermark },
}

impl Ack {
    pub fn watermark(&self) -> &Watermark {
        match self {
            Ack::Commit { watermark } | Ack::Status { watermark } => watermark,
        }
    }
}

/// A downstream frame, as offered by the upstream source and as delivered to
/// subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum Downstream {
    /// Opens a transaction. Carries the final watermark the transaction will
    /// commit at, so subscribers can filter whole transactions.
    Begin { commit_watermark: Watermark },
    Data(DataChange),
    Commit { watermark: Watermark },
    Rollback,
    Status {
        ack: Option<bool>,
        watermark: Watermark,
    },
    Control(ControlSignal),
    /// Terminal: the stream closes after this frame.
    Error(ErrorBody),
}

impl Downstream {
    pub fn tag(&self) -> &'static str {
        match self {
            Downstream::Begin { .. } => "begin",
            Downstream::Data(_) => "data",
            Downstream::Commit { .. } => "commit",
            Downstream::Rollback => "rollback",
            Downstream::Status { .. } => "status",
            Downstream::Control(_) => "control",
            Downstream::Error(_) => "error",
        }
    }

    /// The change payload archived for this frame, if it is archivable.
    pub fn change(&self) -> Option<Change> {
        match self {
            Downstream::Begin { .. } => Some(Change::Begin),
            Downstream::Data(change) => Some(Change::Data(change.clone())),
            Downstream::Commit { .. } => Some(Change::Commit),
            Downstream::Rollback => Some(Change::Rollback),
            _ => None,
        }
    }

    /// The watermark of the transaction this frame belongs to, used to filter
    /// already-delivered transactions at the catch-up → live boundary.
    pub fn commit_watermark_hint(&self) -> Option<&Watermark> {
        match self {
            Downstream::Begin { commit_watermark } => Some(commit_watermark),
            Downstream::Commit { watermark } => Some(watermark),
            _ => None,
        }
    }
}

/// A downstream frame together with the change-log watermark it is archived
/// under: the pre-commit watermark for `begin`/`data`, the commit watermark
/// for `commit`.
#[derive(Clone, Debug, PartialEq)]
pub struct WatermarkedFrame {
    pub watermark: Watermark,
    pub frame: Downstream,
}

impl WatermarkedFrame {
    pub fn new(watermark: impl Into<Watermark>, frame: Downstream) -> Self {
        Self {
            watermark: watermark.into(),
            frame,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct BeginMeta {
    #[serde(rename = "commitWatermark")]
    commit_watermark: Watermark,
}

#[derive(Serialize, Deserialize)]
struct CommitMeta {
    watermark: Watermark,
}

#[derive(Serialize, Deserialize)]
struct StatusBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack: Option<bool>,
}

impl Serialize for Downstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Downstream::Begin { commit_watermark } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("begin")?;
                seq.serialize_element(&Change::Begin)?;
                seq.serialize_element(&BeginMeta {
                    commit_watermark: commit_watermark.clone(),
                })?;
                seq.end()
            }
            Downstream::Data(change) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("data")?;
                seq.serialize_element(change)?;
                seq.end()
            }
            Downstream::Commit { watermark } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("commit")?;
                seq.serialize_element(&Change::Commit)?;
                seq.serialize_element(&CommitMeta {
                    watermark: watermark.clone(),
                })?;
                seq.end()
            }
            Downstream::Rollback => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("rollback")?;
                seq.serialize_element(&Change::Rollback)?;
                seq.end()
            }
            Downstream::Status { ack, watermark } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("status")?;
                seq.serialize_element(&StatusBody { ack: *ack })?;
                seq.serialize_element(&CommitMeta {
                    watermark: watermark.clone(),
                })?;
                seq.end()
            }
            Downstream::Control(signal) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("control")?;
                seq.serialize_element(signal)?;
                seq.end()
            }
            Downstream::Error(body) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("error")?;
                seq.serialize_element(body)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Downstream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FrameVisitor;

        impl<'de> Visitor<'de> for FrameVisitor {
            type Value = Downstream;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a tagged tuple frame")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Downstream, A::Error> {
                let tag: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                match tag.as_str() {
                    "begin" => {
                        let _payload: Change = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let meta: BeginMeta = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                        Ok(Downstream::Begin {
                            commit_watermark: meta.commit_watermark,
                        })
                    }
                    "data" => {
                        let change: DataChange = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(Downstream::Data(change))
                    }
                    "commit" => {
                        let _payload: Change = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let meta: CommitMeta = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                        Ok(Downstream::Commit {
                            watermark: meta.watermark,
                        })
                    }
                    "rollback" => {
                        let _payload: Change = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(Downstream::Rollback)
                    }
                    "status" => {
                        let body: StatusBody = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let meta: CommitMeta = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                        Ok(Downstream::Status {
                            ack: body.ack,
                            watermark: meta.watermark,
                        })
                    }
                    "control" => {
                        let signal: ControlSignal = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(Downstream::Control(signal))
                    }
                    "error" => {
                        let body: ErrorBody = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(Downstream::Error(body))
                    }
                    other => Err(de::Error::unknown_variant(
                        other,
                        &[
                            "begin", "data", "commit", "rollback", "status", "control", "error",
                        ],
                    )),
                }
            }
        }

        deserializer.deserialize_seq(FrameVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Relation;
    use serde_json::json;

    fn issue_relation() -> Relation {
        Relation {
            schema: "public".into(),
            name: "issue".into(),
            key_columns: vec!["id".into()],
        }
    }

    #[test]
    fn begin_frame_encoding() {
        let frame = Downstream::Begin {
            commit_watermark: "08".into(),
        };
        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            encoded,
            json!(["begin", {"tag": "begin"}, {"commitWatermark": "08"}])
        );
        assert_eq!(serde_json::from_value::<Downstream>(encoded).unwrap(), frame);
    }

    #[test]
    fn data_frame_encoding() {
        let frame = Downstream::Data(DataChange::Insert {
            relation: issue_relation(),
            new: json!({"id": "foo"}).as_object().unwrap().clone(),
        });
        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(encoded[0], "data");
        assert_eq!(encoded[1]["tag"], "insert");
        assert_eq!(serde_json::from_value::<Downstream>(encoded).unwrap(), frame);
    }

    #[test]
    fn commit_status_error_encoding() {
        let commit = Downstream::Commit {
            watermark: "08".into(),
        };
        assert_eq!(
            serde_json::to_value(&commit).unwrap(),
            json!(["commit", {"tag": "commit"}, {"watermark": "08"}])
        );

        let status = Downstream::Status {
            ack: Some(true),
            watermark: "08".into(),
        };
        let encoded = serde_json::to_value(&status).unwrap();
        assert_eq!(encoded, json!(["status", {"ack": true}, {"watermark": "08"}]));
        assert_eq!(serde_json::from_value::<Downstream>(encoded).unwrap(), status);

        let error = Downstream::Error(ErrorBody {
            kind: ErrorKind::WatermarkTooOld,
            message: "earliest supported watermark is 03 (requested 01)".into(),
        });
        let encoded = serde_json::to_value(&error).unwrap();
        assert_eq!(encoded[1]["type"], "WatermarkTooOld");
        assert_eq!(serde_json::from_value::<Downstream>(encoded).unwrap(), error);
    }

    #[test]
    fn protocol_version_gate() {
        assert!(check_protocol_version(PROTOCOL_VERSION).is_ok());
        assert!(check_protocol_version(MIN_PROTOCOL_VERSION).is_ok());
        let err = check_protocol_version(PROTOCOL_VERSION + 1).unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol(_)));
    }

    #[test]
    fn ack_encoding() {
        let ack = Ack::Commit {
            watermark: "08".into(),
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"tag": "commit", "watermark": "08"})
        );
    }
}
