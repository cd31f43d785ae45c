//! Local storage module
//!
//! This module handles the entities the reconciliation core owns and their
//! persistence:
//! - Chats, messages and per-message mutation state
//! - Contacts and contact-request state
//! - Activity center notifications
//! - Configuration
//!
//! The module is organized into submodules:
//! - `chat` - Chat state, ID validation and the membership log fold
//! - `message` - Message structures and mutation registers
//! - `contact` - Contact entity, request states and ENS backoff
//! - `activity` - Activity center notifications and "has seen" cursor
//! - `settings` - Settings and configuration
//! - `storage_db` - SQLite database
//! - `store` - Per-identity store with caches and per-key locks

// Submodules
pub mod activity;
pub mod chat;
pub mod contact;
pub mod message;
pub mod settings;
pub mod storage_db;
pub mod store;

// Re-export commonly used types
pub use activity::{ActivityCenterState, Notification, NotificationKind, Resolution};
pub use chat::{Chat, ChatType, Member, MembershipChange};
pub use contact::{Contact, ContactRequestState, PropagatedState};
pub use message::{Message, MessageMutations};
pub use settings::Settings;
pub use storage_db::{ChangeSet, Storage};
pub use store::{KeyLocks, Store};
