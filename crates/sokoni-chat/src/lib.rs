pub mod session;

pub use session::{
    ChatConfig, ChatDeps, ChatError, ChatHandle, ChatSession, ChatUpdate, DisplayMessage,
};
