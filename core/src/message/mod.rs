// Message module — wire codec, application envelope and content validation

pub mod codec;
pub mod envelope;
pub mod sanitize;

pub use codec::{
    message_id_for, AckKind, AckPayload, CodecError, LocationPayload, MeshPacket, PacketType,
    SosPayload, SourceToken,
};
pub use envelope::{parse_payload, Envelope, GeoPoint, MessageKind, ParsedPayload, BROADCAST};
pub use sanitize::{sanitize_message, validate_message, ValidationError};
