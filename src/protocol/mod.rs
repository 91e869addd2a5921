//! WebSocket protocol core (RFC 6455): framing, masking, reassembly and the
//! opening handshake.

pub mod assembler;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;
pub mod validation;

pub use assembler::MessageAssembler;
pub use frame::{Frame, FrameDecoder, FrameHeader, decode, encode, encode_with_mask};
pub use handshake::{
    ClientHandshake, HandshakeRequest, HandshakeResponse, Negotiation, WS_GUID,
    compute_accept_key, negotiate,
};
pub use mask::{MaskGenerator, apply_mask, apply_mask_fast};
pub use opcode::OpCode;
pub use validation::FrameValidator;
