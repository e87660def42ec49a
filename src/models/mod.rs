//! In-memory representations of blocks, watermarks and pooled messages

pub mod auth_msg;
pub mod block;
pub mod sdp_msg;
pub mod watermark;

pub use auth_msg::{new_correlation_id, AuthMsgWrapper, LedgerInfo, MsgSource};
pub use block::{Block, CrossChainMessage};
pub use sdp_msg::{is_unordered_session, SdpMsgWrapper};
pub use watermark::{AnchorProcessHeights, Watermark, WatermarkName};
