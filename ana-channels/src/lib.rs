pub mod evolution;
pub mod traits;
pub mod types;

pub use evolution::EvolutionAdapter;
pub use traits::Transport;
pub use types::{InboundMessage, MessageId, OutboundMessage, UserKey};
