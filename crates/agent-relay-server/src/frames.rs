//! Framing of one object synchronization turn.

use crate::proto::objects_to_synchronize_response::{Headers, Message, Object, Trailers};
use crate::proto::ObjectsToSynchronizeResponse;

/// One message of a synchronization turn: `Headers`, any number of
/// `Object` chunks, then `Trailers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Headers { commit_id: String },
    Object { source: String, data: Vec<u8> },
    Trailers,
}

impl From<SyncMessage> for ObjectsToSynchronizeResponse {
    fn from(msg: SyncMessage) -> Self {
        let message = match msg {
            SyncMessage::Headers { commit_id } => Message::Headers(Headers { commit_id }),
            SyncMessage::Object { source, data } => Message::Object(Object { source, data }),
            SyncMessage::Trailers => Message::Trailers(Trailers {}),
        };
        ObjectsToSynchronizeResponse {
            message: Some(message),
        }
    }
}

impl TryFrom<ObjectsToSynchronizeResponse> for SyncMessage {
    type Error = tonic::Status;

    fn try_from(resp: ObjectsToSynchronizeResponse) -> Result<Self, Self::Error> {
        match resp.message {
            Some(Message::Headers(h)) => Ok(SyncMessage::Headers {
                commit_id: h.commit_id,
            }),
            Some(Message::Object(o)) => Ok(SyncMessage::Object {
                source: o.source,
                data: o.data,
            }),
            Some(Message::Trailers(_)) => Ok(SyncMessage::Trailers),
            None => Err(tonic::Status::internal("empty synchronization message")),
        }
    }
}
