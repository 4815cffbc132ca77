pub mod reply;

pub use reply::{PendingReply, ReplyOutcome, ReplyService};
