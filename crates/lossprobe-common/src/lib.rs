// Shared message types, the message factory and payload codecs.
pub mod codec;
pub mod factory;
pub mod message;

pub use codec::{BinaryCodec, Codec, Decoder, Encoder, OpaqueCodec};
pub use factory::MessageFactory;
pub use message::{Message, PartitionInfo, Trace};

pub type Result<T> = std::result::Result<T, MessageError>;

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("incomplete message")]
    Incomplete,
    #[error("invalid message id")]
    InvalidId,
    #[error("field too large: {0}")]
    TooLarge(&'static str),
}
