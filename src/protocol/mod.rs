pub mod codec;
pub mod command;
pub mod resp;

pub use codec::{CommandCodec, RespCodec};
pub use command::MAX_SLOT_NUM;
pub use resp::Resp;
