//! Cadence: a chat shell synchronized with a local OpenCode server.

pub mod cli;
pub mod conversation;
pub mod export;
pub mod notice;
pub mod permission_memory;
pub mod settings;
pub mod shell;
mod store;
pub mod subscription;
pub mod synchronizer;
mod transcript;

pub use conversation::{ConversationState, ConversationStore, PartOutcome};
pub use notice::ShellNotice;
pub use permission_memory::PermissionMemory;
pub use settings::{ConfigPaths, ServerMode, Settings, SettingsPatch, UiMode};
pub use shell::{CadenceShell, ReadyInfo, ShellOptions, SlashCommand};
pub use subscription::{SubscriptionState, SubscriptionStatus};
pub use synchronizer::Synchronizer;
